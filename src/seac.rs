//! Seac Screen family.
//!
//! Indexed per-dive downloads inside STX-framed packets. The header stores
//! the dive start in UTC together with a timezone index into a fixed
//! 41-entry offset table; the decoded datetime is local time. Gas switches
//! carry raw percentages and feed a two-slot table.

use chrono::{Duration, NaiveDate, NaiveDateTime};

use crate::codec::read_u16_le;
use crate::context::Context;
use crate::device::{self, Device, DiveCallback, Progress};
use crate::error::{Error, Result};
use crate::parser::{CacheLevel, Parser};
use crate::transport::{LineConfig, Purge, Timeout, Transport};
use crate::types::{Event, Field, FieldValue, GasMix, Sample};

const STX: u8 = 0x02;

const CMD_VERSION: u8 = 0xA0;
const CMD_COUNT: u8 = 0xA1;
const CMD_DIVE: u8 = 0xA2;

const SZ_VERSION: usize = 16;
pub const SZ_HEADER: usize = 0x20;
const SZ_RECORD: usize = 4;

const MAX_RETRIES: u32 = 4;
const RETRY_DELAY_MS: u64 = 100;

pub const FINGERPRINT_OFFSET: usize = 0x0A;
pub const FINGERPRINT_SIZE: usize = 10;

/// Capacity of the gas table built from the sample stream.
pub const NGASMIXES: usize = 2;

const REC_SAMPLE: u8 = 0x00;
const REC_GAS_CHANGE: u8 = 0x01;

/// Timezone offsets in seconds, indexed by the header's timezone byte.
/// Index 15 is UTC. The table must be reproduced exactly for round-trip
/// correctness.
const TIMEZONES: [i32; 41] = [
    -43200, -39600, -36000, -34200, -32400, -28800, -25200, -21600, -18000, -16200, -14400,
    -12600, -10800, -7200, -3600, 0, 3600, 7200, 10800, 12600, 14400, 16200, 18000, 19800,
    20700, 21600, 23400, 25200, 28800, 31500, 32400, 34200, 36000, 37800, 39600, 41400, 43200,
    45900, 46800, 49500, 50400,
];

pub struct SeacDevice<'a, T: Transport> {
    port: T,
    ctx: &'a Context,
    fingerprint: Option<Vec<u8>>,
    version: Vec<u8>,
}

impl<'a, T: Transport> SeacDevice<'a, T> {
    pub fn open(mut port: T, ctx: &'a Context) -> Result<Self> {
        port.configure(&LineConfig::eight_n_one(115200))?;
        port.set_timeout(Timeout::Millis(1000))?;
        port.purge(Purge::Both)?;

        let mut device = SeacDevice {
            port,
            ctx,
            fingerprint: None,
            version: Vec::new(),
        };
        device.version = device.transfer(&[CMD_VERSION])?;
        if device.version.len() < SZ_VERSION {
            return Err(Error::Protocol("version block too short"));
        }
        Ok(device)
    }

    fn frame(payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(payload.len() + 4);
        out.push(STX);
        out.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        out.extend_from_slice(payload);
        out.push(payload.iter().fold(0u8, |acc, &b| acc ^ b));
        out
    }

    fn transfer(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        let request = Self::frame(payload);
        let mut last = Error::Timeout;
        for attempt in 0..MAX_RETRIES {
            self.ctx.check_cancelled()?;
            if attempt > 0 {
                self.port.sleep(RETRY_DELAY_MS);
                self.port.purge(Purge::Input)?;
            }
            let result = self
                .port
                .write_all(&request)
                .and_then(|()| self.try_recv());
            match result {
                Ok(data) => return Ok(data),
                Err(e) if e.is_retryable() => last = e,
                Err(e) => return Err(e),
            }
        }
        Err(last)
    }

    fn try_recv(&mut self) -> Result<Vec<u8>> {
        let mut header = [0u8; 3];
        self.port.read_exact(&mut header)?;
        if header[0] != STX {
            return Err(Error::Protocol("missing frame start"));
        }
        let length = read_u16_le(&header, 1) as usize;
        if length > 0x4000 {
            return Err(Error::Protocol("implausible frame length"));
        }

        let mut payload = vec![0u8; length];
        self.port.read_exact(&mut payload)?;

        let mut checksum = [0u8; 1];
        self.port.read_exact(&mut checksum)?;
        let expected = payload.iter().fold(0u8, |acc, &b| acc ^ b);
        if checksum[0] != expected {
            return Err(Error::Protocol("bad checksum"));
        }
        Ok(payload)
    }
}

impl<'a, T: Transport> Device for SeacDevice<'a, T> {
    fn set_fingerprint(&mut self, fingerprint: &[u8]) {
        device::store_fingerprint(&mut self.fingerprint, fingerprint);
    }

    fn foreach(&mut self, callback: &mut DiveCallback<'_>) -> Result<()> {
        self.ctx.emit(Event::Vendor {
            data: &self.version,
        });
        self.ctx.emit(Event::DeviceInfo {
            model: u32::from(self.version[0]),
            firmware: u32::from(self.version[1]),
            serial: u32::from(read_u16_le(&self.version, 2)),
        });

        let count = self.transfer(&[CMD_COUNT])?;
        if count.len() < 2 {
            return Err(Error::Protocol("short count reply"));
        }
        let count = read_u16_le(&count, 0);
        let mut progress = Progress::new(self.ctx, u32::from(count));

        // Index zero is the newest dive.
        for index in 0..count {
            let mut command = vec![CMD_DIVE];
            command.extend_from_slice(&index.to_le_bytes());
            let blob = self.transfer(&command)?;
            if blob.len() < SZ_HEADER {
                return Err(Error::MalformedData("dive blob shorter than header"));
            }
            progress.add(1);

            let fp = &blob[FINGERPRINT_OFFSET..FINGERPRINT_OFFSET + FINGERPRINT_SIZE];
            if device::fingerprint_matches(&self.fingerprint, fp) {
                break;
            }
            if !callback(&blob, fp) {
                return Ok(());
            }
        }

        progress.finish();
        Ok(())
    }
}

// ── Parser ──

/// Parser for one Seac Screen dive blob.
///
/// Header: the timezone index at 0x0A, then UTC hour/minute/second and
/// day/month/year bytes, dive time (u16 LE, s) at 0x12 and max depth
/// (u16 LE, cm) at 0x14. Profile records are four bytes keyed by type.
pub struct SeacParser<'b> {
    blob: &'b [u8],
    cache: CacheLevel,
    mixes: Vec<(u8, u8)>,
}

impl<'b> SeacParser<'b> {
    pub fn new(blob: &'b [u8]) -> Result<Self> {
        if blob.len() < SZ_HEADER {
            return Err(Error::MalformedData("blob shorter than dive header"));
        }
        if (blob.len() - SZ_HEADER) % SZ_RECORD != 0 {
            return Err(Error::MalformedData("profile is not whole records"));
        }
        Ok(SeacParser {
            blob,
            cache: CacheLevel::Empty,
            mixes: Vec::new(),
        })
    }

    /// UTC offset of the dive site in seconds.
    pub fn timezone(&self) -> Result<i32> {
        let index = usize::from(self.blob[0x0A]);
        TIMEZONES
            .get(index)
            .copied()
            .ok_or(Error::MalformedData("timezone index out of table"))
    }

    fn load_profile(&mut self) -> Result<()> {
        if self.cache >= CacheLevel::ProfileValid {
            return Ok(());
        }
        self.walk(&mut |_| {})
    }

    fn walk(&mut self, callback: &mut dyn FnMut(Sample<'_>)) -> Result<()> {
        let profile = &self.blob[SZ_HEADER..];
        let mut mixes: Vec<(u8, u8)> = Vec::new();
        let mut time_ms = 0u32;

        for record in profile.chunks_exact(SZ_RECORD) {
            match record[0] {
                REC_SAMPLE => {
                    time_ms += 1000;
                    callback(Sample::Time(time_ms));
                    callback(Sample::Depth(f64::from(read_u16_le(record, 1)) / 100.0));
                    callback(Sample::Temperature(f64::from(record[3] as i8)));
                    callback(Sample::Vendor { kind: u32::from(REC_SAMPLE), data: record });
                }
                REC_GAS_CHANGE => {
                    let (o2, he) = (record[1], record[2]);
                    let index = if let Some(i) = mixes.iter().position(|&m| m == (o2, he)) {
                        i
                    } else {
                        if mixes.len() >= NGASMIXES {
                            return Err(Error::MalformedData("gas table overflow"));
                        }
                        mixes.push((o2, he));
                        mixes.len() - 1
                    };
                    callback(Sample::GasSwitch(index));
                    callback(Sample::Vendor { kind: u32::from(REC_GAS_CHANGE), data: record });
                }
                other => {
                    log::warn!("seac: skipping unknown record type {other:#04x}");
                }
            }
        }

        self.mixes = mixes;
        self.cache = CacheLevel::ProfileValid;
        Ok(())
    }
}

impl<'b> Parser for SeacParser<'b> {
    fn datetime(&mut self) -> Result<NaiveDateTime> {
        let b = self.blob;
        let utc = NaiveDate::from_ymd_opt(
            2000 + i32::from(b[0x10]),
            u32::from(b[0x0F]),
            u32::from(b[0x0E]),
        )
        .and_then(|d| {
            d.and_hms_opt(u32::from(b[0x0B]), u32::from(b[0x0C]), u32::from(b[0x0D]))
        })
        .ok_or(Error::MalformedData("invalid date in header"))?;
        Ok(utc + Duration::seconds(i64::from(self.timezone()?)))
    }

    fn field(&mut self, field: Field) -> Result<Option<FieldValue>> {
        match field {
            Field::DiveTime => Ok(Some(FieldValue::Time(u32::from(read_u16_le(
                self.blob, 0x12,
            ))))),
            Field::MaxDepth => Ok(Some(FieldValue::Depth(
                f64::from(read_u16_le(self.blob, 0x14)) / 100.0,
            ))),
            Field::GasMixCount => {
                self.load_profile()?;
                Ok(Some(FieldValue::Count(self.mixes.len() as u32)))
            }
            Field::GasMix(i) => {
                self.load_profile()?;
                Ok(self
                    .mixes
                    .get(i)
                    .map(|&(o2, he)| FieldValue::GasMix(GasMix::from_percent(o2, he))))
            }
            _ => Ok(None),
        }
    }

    fn samples_foreach(&mut self, callback: &mut dyn FnMut(Sample<'_>)) -> Result<()> {
        self.walk(callback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(super) fn test_header(tz_index: u8) -> Vec<u8> {
        let mut h = vec![0u8; SZ_HEADER];
        h[0x0A] = tz_index;
        h[0x0B] = 10;
        h[0x0C] = 30;
        h[0x0D] = 0;
        h[0x0E] = 1;
        h[0x0F] = 6;
        h[0x10] = 24;
        h
    }

    #[test]
    fn timezone_table_anchors() {
        assert_eq!(TIMEZONES.len(), 41);
        assert_eq!(TIMEZONES[15], 0);
        assert_eq!(TIMEZONES[20], 14400);
        // Offsets are strictly increasing, so indices are unambiguous.
        for pair in TIMEZONES.windows(2) {
            assert!(pair[1] > pair[0]);
        }
    }

    #[test]
    fn utc_and_offset_datetimes() {
        let header = test_header(15);
        let mut parser = SeacParser::new(&header).unwrap();
        assert_eq!(parser.timezone().unwrap(), 0);
        assert_eq!(
            parser.datetime().unwrap(),
            NaiveDate::from_ymd_opt(2024, 6, 1)
                .unwrap()
                .and_hms_opt(10, 30, 0)
                .unwrap()
        );

        let header = test_header(20);
        let mut parser = SeacParser::new(&header).unwrap();
        assert_eq!(parser.timezone().unwrap(), 14400);
        assert_eq!(
            parser.datetime().unwrap(),
            NaiveDate::from_ymd_opt(2024, 6, 1)
                .unwrap()
                .and_hms_opt(14, 30, 0)
                .unwrap()
        );
    }

    #[test]
    fn timezone_index_out_of_table() {
        let header = test_header(41);
        let mut parser = SeacParser::new(&header).unwrap();
        assert!(matches!(
            parser.datetime(),
            Err(Error::MalformedData(_))
        ));
    }

    #[test]
    fn two_slot_gas_table() {
        let mut blob = test_header(15);
        blob.extend_from_slice(&[REC_GAS_CHANGE, 21, 0, 0]);
        blob.extend_from_slice(&[REC_SAMPLE, 0x10, 0x27, 18]);
        blob.extend_from_slice(&[REC_GAS_CHANGE, 50, 0, 0]);
        blob.extend_from_slice(&[REC_GAS_CHANGE, 21, 0, 0]);

        let mut parser = SeacParser::new(&blob).unwrap();
        let mut switches = Vec::new();
        parser
            .samples_foreach(&mut |s| {
                if let Sample::GasSwitch(i) = s {
                    switches.push(i);
                }
            })
            .unwrap();
        assert_eq!(switches, vec![0, 1, 0]);

        // A third distinct mix overflows the two slots.
        blob.extend_from_slice(&[REC_GAS_CHANGE, 80, 0, 0]);
        let mut parser = SeacParser::new(&blob).unwrap();
        assert!(matches!(
            parser.samples_foreach(&mut |_| {}),
            Err(Error::MalformedData(_))
        ));
    }
}
