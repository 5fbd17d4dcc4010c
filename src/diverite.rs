//! Dive Rite NiteK Q family.
//!
//! A small serial unit with indexed per-dive downloads. Its profile has no
//! gas-mix table in the header: gas switches carry raw (O2, He) percentages,
//! and the parser builds the table as it walks, emitting indices.

use chrono::{NaiveDate, NaiveDateTime};

use crate::codec::read_u16_le;
use crate::context::Context;
use crate::device::{self, Device, DiveCallback, Progress};
use crate::error::{Error, Result};
use crate::parser::{CacheLevel, Parser};
use crate::transport::{LineConfig, Purge, Timeout, Transport};
use crate::types::{Event, Field, FieldValue, GasMix, Sample};

const CMD_VERSION: u8 = b'V';
const CMD_COUNT: u8 = b'N';
const CMD_DIVE: u8 = b'D';

const SZ_VERSION: usize = 32;
pub const SZ_HEADER: usize = 16;
const SZ_RECORD: usize = 3;

const MAX_RETRIES: u32 = 4;
const RETRY_DELAY_MS: u64 = 100;

pub const FINGERPRINT_SIZE: usize = 6;

/// Capacity of the gas table built from the sample stream.
pub const NGASMIXES: usize = 7;

const REC_SAMPLE: u8 = 0x01;
const REC_TEMPERATURE: u8 = 0x02;
const REC_GAS_CHANGE: u8 = 0x03;

pub struct NitekqDevice<'a, T: Transport> {
    port: T,
    ctx: &'a Context,
    fingerprint: Option<Vec<u8>>,
    version: Vec<u8>,
}

impl<'a, T: Transport> NitekqDevice<'a, T> {
    pub fn open(mut port: T, ctx: &'a Context) -> Result<Self> {
        port.configure(&LineConfig::eight_n_one(9600))?;
        port.set_timeout(Timeout::Millis(1000))?;
        port.purge(Purge::Both)?;

        let mut device = NitekqDevice {
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

    /// One command/response with a u16 LE length prefix and a trailing XOR
    /// checksum over the payload.
    fn transfer(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        let mut last = Error::Timeout;
        for attempt in 0..MAX_RETRIES {
            self.ctx.check_cancelled()?;
            if attempt > 0 {
                self.port.sleep(RETRY_DELAY_MS);
                self.port.purge(Purge::Input)?;
            }
            match self.try_transfer(command) {
                Ok(data) => return Ok(data),
                Err(e) if e.is_retryable() => last = e,
                Err(e) => return Err(e),
            }
        }
        Err(last)
    }

    fn try_transfer(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        self.port.write_all(command)?;

        let mut length = [0u8; 2];
        self.port.read_exact(&mut length)?;
        let length = read_u16_le(&length, 0) as usize;
        if length > 0x4000 {
            return Err(Error::Protocol("implausible response length"));
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

impl<'a, T: Transport> Device for NitekqDevice<'a, T> {
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
        let count = *count.first().ok_or(Error::Protocol("empty count reply"))?;
        let mut progress = Progress::new(self.ctx, u32::from(count));

        // Index zero is the newest dive.
        for index in 0..count {
            let blob = self.transfer(&[CMD_DIVE, index])?;
            if blob.len() < SZ_HEADER {
                return Err(Error::MalformedData("dive blob shorter than header"));
            }
            progress.add(1);

            let fp = &blob[..FINGERPRINT_SIZE];
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

/// Parser for one NiteK Q dive blob.
///
/// Header: six date bytes (year-2000, month, day, hour, minute, second),
/// sample interval, reserved, max depth (u16 LE, 1/10 m), the rest padding.
/// Profile records are three bytes each, keyed by a type byte.
pub struct NitekqParser<'b> {
    blob: &'b [u8],
    cache: CacheLevel,
    mixes: Vec<(u8, u8)>,
}

impl<'b> NitekqParser<'b> {
    pub fn new(blob: &'b [u8]) -> Result<Self> {
        if blob.len() < SZ_HEADER {
            return Err(Error::MalformedData("blob shorter than dive header"));
        }
        if (blob.len() - SZ_HEADER) % SZ_RECORD != 0 {
            return Err(Error::MalformedData("profile is not whole records"));
        }
        Ok(NitekqParser {
            blob,
            cache: CacheLevel::Empty,
            mixes: Vec::new(),
        })
    }

    pub fn ngasmixes(&mut self) -> Result<usize> {
        self.load_profile()?;
        Ok(self.mixes.len())
    }

    fn interval(&self) -> u32 {
        u32::from(self.blob[6]).max(1)
    }

    /// Populate the gas table by walking the profile once without a sink.
    fn load_profile(&mut self) -> Result<()> {
        if self.cache >= CacheLevel::ProfileValid {
            return Ok(());
        }
        self.walk(&mut |_| {})
    }

    /// Find-or-insert keyed by the exact (O2, He) byte pair.
    fn lookup_mix(mixes: &mut Vec<(u8, u8)>, o2: u8, he: u8) -> Result<usize> {
        if let Some(i) = mixes.iter().position(|&m| m == (o2, he)) {
            return Ok(i);
        }
        if mixes.len() >= NGASMIXES {
            return Err(Error::MalformedData("gas table overflow"));
        }
        mixes.push((o2, he));
        Ok(mixes.len() - 1)
    }

    fn walk(&mut self, callback: &mut dyn FnMut(Sample<'_>)) -> Result<()> {
        let profile = &self.blob[SZ_HEADER..];
        let mut mixes: Vec<(u8, u8)> = Vec::new();
        let mut time_ms = 0u32;

        for record in profile.chunks_exact(SZ_RECORD) {
            match record[0] {
                REC_SAMPLE => {
                    time_ms += self.interval() * 1000;
                    callback(Sample::Time(time_ms));
                    callback(Sample::Depth(f64::from(read_u16_le(record, 1)) / 10.0));
                    callback(Sample::Vendor { kind: u32::from(REC_SAMPLE), data: record });
                }
                REC_TEMPERATURE => {
                    callback(Sample::Temperature(f64::from(record[1] as i8)));
                    callback(Sample::Vendor { kind: u32::from(REC_TEMPERATURE), data: record });
                }
                REC_GAS_CHANGE => {
                    let index = Self::lookup_mix(&mut mixes, record[1], record[2])?;
                    callback(Sample::GasSwitch(index));
                    callback(Sample::Vendor { kind: u32::from(REC_GAS_CHANGE), data: record });
                }
                other => {
                    log::warn!("nitekq: skipping unknown record type {other:#04x}");
                }
            }
        }

        self.mixes = mixes;
        self.cache = CacheLevel::ProfileValid;
        Ok(())
    }
}

impl<'b> Parser for NitekqParser<'b> {
    fn datetime(&mut self) -> Result<NaiveDateTime> {
        let b = self.blob;
        NaiveDate::from_ymd_opt(2000 + i32::from(b[0]), u32::from(b[1]), u32::from(b[2]))
            .and_then(|d| d.and_hms_opt(u32::from(b[3]), u32::from(b[4]), u32::from(b[5])))
            .ok_or(Error::MalformedData("invalid date in header"))
    }

    fn field(&mut self, field: Field) -> Result<Option<FieldValue>> {
        match field {
            Field::MaxDepth => Ok(Some(FieldValue::Depth(
                f64::from(read_u16_le(self.blob, 8)) / 10.0,
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

    fn header(day: u8) -> Vec<u8> {
        let mut h = vec![0u8; SZ_HEADER];
        h[0] = 24;
        h[1] = 6;
        h[2] = day;
        h[3] = 14;
        h[6] = 10; // interval
        h
    }

    fn gas_change(o2: u8, he: u8) -> [u8; SZ_RECORD] {
        [REC_GAS_CHANGE, o2, he]
    }

    fn sample(depth_dm: u16) -> [u8; SZ_RECORD] {
        let d = depth_dm.to_le_bytes();
        [REC_SAMPLE, d[0], d[1]]
    }

    #[test]
    fn gas_table_find_or_insert() {
        let mut blob = header(1);
        blob.extend_from_slice(&gas_change(21, 0));
        blob.extend_from_slice(&sample(100));
        blob.extend_from_slice(&gas_change(32, 0));
        blob.extend_from_slice(&sample(150));
        blob.extend_from_slice(&gas_change(21, 0));
        blob.extend_from_slice(&sample(80));

        let mut parser = NitekqParser::new(&blob).unwrap();
        let mut switches = Vec::new();
        parser
            .samples_foreach(&mut |s| {
                if let Sample::GasSwitch(i) = s {
                    switches.push(i);
                }
            })
            .unwrap();
        assert_eq!(switches, vec![0, 1, 0]);
        assert_eq!(parser.ngasmixes().unwrap(), 2);
        assert_eq!(
            parser.field(Field::GasMix(1)).unwrap(),
            Some(FieldValue::GasMix(GasMix::from_percent(32, 0)))
        );
    }

    #[test]
    fn gas_table_closure_over_distinct_pairs() {
        let mut blob = header(2);
        let pairs = [(21u8, 0u8), (32, 0), (18, 45), (21, 0), (18, 45), (50, 0)];
        for &(o2, he) in &pairs {
            blob.extend_from_slice(&gas_change(o2, he));
        }
        let mut parser = NitekqParser::new(&blob).unwrap();
        parser.load_profile().unwrap();
        assert_eq!(parser.mixes, vec![(21, 0), (32, 0), (18, 45), (50, 0)]);
    }

    #[test]
    fn gas_table_overflow_is_malformed() {
        let mut blob = header(3);
        for o2 in 21..=28u8 {
            blob.extend_from_slice(&gas_change(o2, 0));
        }
        let mut parser = NitekqParser::new(&blob).unwrap();
        assert!(matches!(
            parser.samples_foreach(&mut |_| {}),
            Err(Error::MalformedData(_))
        ));
    }

    #[test]
    fn field_triggers_profile_population() {
        let mut blob = header(4);
        blob.extend_from_slice(&gas_change(36, 0));
        let mut parser = NitekqParser::new(&blob).unwrap();
        // No explicit samples walk: the field access populates the cache.
        assert_eq!(
            parser.field(Field::GasMixCount).unwrap(),
            Some(FieldValue::Count(1))
        );
    }
}
