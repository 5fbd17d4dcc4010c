//! Atomic Aquatics Cobalt family.
//!
//! A USB device: short command writes, bulk responses. Every bulk response
//! carries a little-endian length header and a trailing CRC-16 over the
//! payload. Dives are served newest first through an indexed query, so the
//! driver never touches raw memory.

use chrono::{NaiveDate, NaiveDateTime};

use crate::codec::{read_u16_le, read_u32_le};
use crate::context::Context;
use crate::device::{self, Device, DiveCallback, Progress};
use crate::error::{Error, Result};
use crate::parser::{CacheLevel, Parser, BAR, DENSITY_FRESH, DENSITY_SALT, GRAVITY, PSI};
use crate::transport::{Purge, Timeout, Transport};
use crate::types::{
    DiveMode, Event, Field, FieldValue, GasMix, Salinity, Sample, SampleEventKind, WaterKind,
};

const CMD_VERSION: u8 = 0x01;
const CMD_DIVE_COUNT: u8 = 0x02;
const CMD_DIVE: u8 = 0x03;

const SZ_VERSION: usize = 14;
pub const SZ_HEADER: usize = 32;
const SZ_SAMPLE: usize = 6;

const MAX_RETRIES: u32 = 4;
const RETRY_DELAY_MS: u64 = 200;

pub const FINGERPRINT_OFFSET: usize = 4;
pub const FINGERPRINT_SIZE: usize = 6;

pub const NGASMIXES: usize = 4;

/// CRC-16/CCITT-FALSE, the checksum the device appends to bulk transfers.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc = 0xFFFFu16;
    for &b in data {
        crc ^= u16::from(b) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = crc << 1 ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

pub struct CobaltDevice<'a, T: Transport> {
    port: T,
    ctx: &'a Context,
    fingerprint: Option<Vec<u8>>,
    version: Vec<u8>,
}

impl<'a, T: Transport> CobaltDevice<'a, T> {
    pub fn open(mut port: T, ctx: &'a Context) -> Result<Self> {
        port.set_timeout(Timeout::Millis(2000))?;
        port.purge(Purge::Both)?;

        let mut device = CobaltDevice {
            port,
            ctx,
            fingerprint: None,
            version: Vec::new(),
        };
        let version = device.transfer(&[CMD_VERSION])?;
        if version.len() < SZ_VERSION {
            return Err(Error::Protocol("version payload too short"));
        }
        device.version = version;
        Ok(device)
    }

    /// The serial number is printed as seven ASCII digits at the front of
    /// the version payload.
    pub fn serial(&self) -> u32 {
        self.version[..7]
            .iter()
            .fold(0u32, |acc, &b| acc * 10 + u32::from(b.wrapping_sub(b'0')))
    }

    pub fn firmware(&self) -> u32 {
        u32::from(read_u16_le(&self.version, 8)) << 16 | u32::from(read_u16_le(&self.version, 10))
    }

    pub fn model(&self) -> u32 {
        u32::from(read_u16_le(&self.version, 12))
    }

    /// One command/bulk-response exchange with bounded retries.
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

        let mut header = [0u8; 4];
        self.port.read_exact(&mut header)?;
        let length = read_u32_le(&header, 0) as usize;
        if length > 1 << 20 {
            return Err(Error::Protocol("implausible bulk length"));
        }

        let mut payload = vec![0u8; length];
        self.port.read_exact(&mut payload)?;

        let mut crc = [0u8; 2];
        self.port.read_exact(&mut crc)?;
        if read_u16_le(&crc, 0) != crc16(&payload) {
            return Err(Error::Protocol("bulk CRC mismatch"));
        }
        Ok(payload)
    }

    fn dive_count(&mut self) -> Result<u16> {
        let data = self.transfer(&[CMD_DIVE_COUNT])?;
        if data.len() < 2 {
            return Err(Error::Protocol("short dive count reply"));
        }
        Ok(read_u16_le(&data, 0))
    }

    fn read_dive(&mut self, index: u16) -> Result<Vec<u8>> {
        let mut command = vec![CMD_DIVE];
        command.extend_from_slice(&index.to_le_bytes());
        self.transfer(&command)
    }
}

impl<'a, T: Transport> Device for CobaltDevice<'a, T> {
    fn set_fingerprint(&mut self, fingerprint: &[u8]) {
        device::store_fingerprint(&mut self.fingerprint, fingerprint);
    }

    fn foreach(&mut self, callback: &mut DiveCallback<'_>) -> Result<()> {
        self.ctx.emit(Event::Vendor {
            data: &self.version,
        });
        self.ctx.emit(Event::DeviceInfo {
            model: self.model(),
            firmware: self.firmware(),
            serial: self.serial(),
        });

        self.ctx.emit(Event::Waiting);
        let count = self.dive_count()?;
        let mut progress = Progress::new(self.ctx, u32::from(count));

        // Index zero is the newest dive.
        for index in 0..count {
            let blob = self.read_dive(index)?;
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

/// Parser for one Cobalt dive blob.
///
/// Header: dive number (u32 LE), six date/time bytes (year-2000, month, day,
/// hour, minute, second), surface pressure (u16 LE, mbar), sample interval
/// (u16 LE, s), sample count (u16 LE), water type byte, reserved, then four
/// (O2, He) percent pairs. Samples are six bytes: absolute ambient pressure
/// (u16 LE, mbar), temperature (u8, °F), event flags (u8), tank pressure
/// (u16 LE, 2-psi units).
pub struct CobaltParser<'b> {
    blob: &'b [u8],
    cache: CacheLevel,
    atmospheric: Option<f64>,
    density: Option<f64>,
    maxdepth: f64,
}

impl<'b> CobaltParser<'b> {
    pub fn new(blob: &'b [u8]) -> Result<Self> {
        if blob.len() < SZ_HEADER {
            return Err(Error::MalformedData("blob shorter than dive header"));
        }
        if (blob.len() - SZ_HEADER) % SZ_SAMPLE != 0 {
            return Err(Error::MalformedData("profile is not whole samples"));
        }
        Ok(CobaltParser {
            blob,
            cache: CacheLevel::Empty,
            atmospheric: None,
            density: None,
            maxdepth: 0.0,
        })
    }

    fn interval(&self) -> u32 {
        u32::from(read_u16_le(self.blob, 12)).max(1)
    }

    fn nsamples(&self) -> usize {
        read_u16_le(self.blob, 14) as usize
    }

    /// Surface pressure in bar: the override wins over the header value.
    fn surface_pressure(&self) -> f64 {
        self.atmospheric
            .unwrap_or_else(|| f64::from(read_u16_le(self.blob, 10)) / 1000.0)
    }

    fn water_density(&self) -> f64 {
        self.density.unwrap_or(match self.blob[16] {
            0 => DENSITY_FRESH,
            _ => DENSITY_SALT,
        })
    }

    /// Absolute ambient pressure in mbar to depth in meters.
    fn depth(&self, ambient_mbar: u16) -> f64 {
        let pascal = f64::from(ambient_mbar) * 100.0 - self.surface_pressure() * BAR;
        (pascal / (self.water_density() * GRAVITY)).max(0.0)
    }

    fn load_profile(&mut self) -> Result<()> {
        if self.cache >= CacheLevel::ProfileValid {
            return Ok(());
        }
        if SZ_HEADER + self.nsamples() * SZ_SAMPLE > self.blob.len() {
            return Err(Error::MalformedData("sample count exceeds blob"));
        }
        let mut maxdepth = 0.0f64;
        for i in 0..self.nsamples() {
            let offset = SZ_HEADER + i * SZ_SAMPLE;
            maxdepth = maxdepth.max(self.depth(read_u16_le(self.blob, offset)));
        }
        self.maxdepth = maxdepth;
        self.cache = CacheLevel::ProfileValid;
        Ok(())
    }

    fn gasmixes(&self) -> Vec<GasMix> {
        let mut mixes = Vec::new();
        for i in 0..NGASMIXES {
            let o2 = self.blob[20 + i * 2];
            let he = self.blob[21 + i * 2];
            if o2 == 0 || o2 > 100 || he > 100 - o2 {
                continue;
            }
            mixes.push(GasMix::from_percent(o2, he));
        }
        mixes
    }
}

impl<'b> Parser for CobaltParser<'b> {
    fn datetime(&mut self) -> Result<NaiveDateTime> {
        let b = self.blob;
        NaiveDate::from_ymd_opt(2000 + i32::from(b[4]), u32::from(b[5]), u32::from(b[6]))
            .and_then(|d| {
                d.and_hms_opt(u32::from(b[7]), u32::from(b[8]), u32::from(b[9]))
            })
            .ok_or(Error::MalformedData("invalid date in header"))
    }

    fn field(&mut self, field: Field) -> Result<Option<FieldValue>> {
        match field {
            Field::DiveTime => Ok(Some(FieldValue::Time(
                self.nsamples() as u32 * self.interval(),
            ))),
            Field::MaxDepth => {
                self.load_profile()?;
                Ok(Some(FieldValue::Depth(self.maxdepth)))
            }
            Field::GasMixCount => Ok(Some(FieldValue::Count(self.gasmixes().len() as u32))),
            Field::GasMix(i) => Ok(self.gasmixes().get(i).copied().map(FieldValue::GasMix)),
            Field::Atmospheric => Ok(Some(FieldValue::Pressure(self.surface_pressure()))),
            Field::Salinity => {
                let kind = match self.blob[16] {
                    0 => WaterKind::Fresh,
                    _ => WaterKind::Salt,
                };
                Ok(Some(FieldValue::Salinity(Salinity {
                    kind,
                    density: self.water_density(),
                })))
            }
            Field::DiveMode => Ok(Some(FieldValue::Mode(DiveMode::OpenCircuit))),
            _ => Ok(None),
        }
    }

    fn samples_foreach(&mut self, callback: &mut dyn FnMut(Sample<'_>)) -> Result<()> {
        if SZ_HEADER + self.nsamples() * SZ_SAMPLE > self.blob.len() {
            return Err(Error::MalformedData("sample count exceeds blob"));
        }
        let mut time_ms = 0u32;
        for i in 0..self.nsamples() {
            let offset = SZ_HEADER + i * SZ_SAMPLE;
            let window = &self.blob[offset..offset + SZ_SAMPLE];

            time_ms += self.interval() * 1000;
            callback(Sample::Time(time_ms));
            callback(Sample::Depth(self.depth(read_u16_le(window, 0))));

            let fahrenheit = f64::from(window[2]);
            callback(Sample::Temperature((fahrenheit - 32.0) * 5.0 / 9.0));

            let flags = window[3];
            if flags & 0x01 != 0 {
                callback(Sample::Event {
                    kind: SampleEventKind::AscentWarning,
                    flags: u32::from(flags),
                    value: 0,
                });
            }
            if flags & 0x02 != 0 {
                callback(Sample::Event {
                    kind: SampleEventKind::DecoViolation,
                    flags: u32::from(flags),
                    value: 0,
                });
            }

            let tank = read_u16_le(window, 4);
            if tank != 0 {
                callback(Sample::Pressure {
                    tank: 0,
                    bar: f64::from(tank) * 2.0 * PSI / BAR,
                });
            }

            callback(Sample::Vendor { kind: 0, data: window });
        }
        self.cache = self.cache.max(CacheLevel::HeaderValid);
        Ok(())
    }

    fn set_atmospheric(&mut self, pressure: f64) {
        self.atmospheric = Some(pressure);
        self.cache = CacheLevel::Empty;
    }

    fn set_density(&mut self, density: f64) {
        self.density = Some(density);
        self.cache = CacheLevel::Empty;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::write_u16_le;
    use crate::transport::{Exchange, ReplayTransport};

    pub(super) const VERSION_PAYLOAD: [u8; SZ_VERSION] = [
        0x30, 0x30, 0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x01, 0x00, 0x02, 0x00, 0x03, 0x00,
    ];

    fn bulk_reply(payload: &[u8]) -> Vec<u8> {
        let mut reply = (payload.len() as u32).to_le_bytes().to_vec();
        reply.extend_from_slice(payload);
        reply.extend_from_slice(&crc16(payload).to_le_bytes());
        reply
    }

    fn version_exchange() -> Exchange {
        Exchange::new(vec![CMD_VERSION], bulk_reply(&VERSION_PAYLOAD))
    }

    #[test]
    fn identify_decodes_version_payload() {
        let ctx = Context::new();
        let port = ReplayTransport::new([version_exchange()]);
        let device = CobaltDevice::open(port, &ctx).unwrap();
        assert_eq!(device.serial(), 1234);
        assert_eq!(device.model(), 3);
        assert_eq!(device.firmware(), (1 << 16) + 2);
    }

    #[test]
    fn crc_mismatch_is_retried() {
        let ctx = Context::new();
        let good = version_exchange();
        let mut corrupt = good.clone();
        let last = corrupt.reply.len() - 1;
        corrupt.reply[last] ^= 0xFF;

        let port = ReplayTransport::new([corrupt, good]);
        let device = CobaltDevice::open(port, &ctx).unwrap();
        assert_eq!(device.serial(), 1234);
        assert_eq!(device.port.exchanges_left(), 0);
    }

    pub(super) fn test_blob(day: u8, samples: &[(u16, u8, u8, u16)]) -> Vec<u8> {
        let mut blob = vec![0u8; SZ_HEADER];
        blob[4] = 24;
        blob[5] = 6;
        blob[6] = day;
        blob[7] = 11;
        blob[8] = 15;
        write_u16_le(&mut blob, 10, 1013); // surface mbar
        write_u16_le(&mut blob, 12, 10); // interval
        write_u16_le(&mut blob, 14, samples.len() as u16);
        blob[16] = 1; // salt
        blob[20] = 21; // air
        for &(mbar, temp_f, flags, tank) in samples {
            let mut sample = [0u8; SZ_SAMPLE];
            write_u16_le(&mut sample, 0, mbar);
            sample[2] = temp_f;
            sample[3] = flags;
            write_u16_le(&mut sample, 4, tank);
            blob.extend_from_slice(&sample);
        }
        blob
    }

    #[test]
    fn depth_from_absolute_pressure() {
        // 2013 mbar ambient at 1013 mbar surface is one bar of water.
        let blob = test_blob(1, &[(2013, 77, 0, 1500)]);
        let mut parser = CobaltParser::new(&blob).unwrap();

        let mut depths = Vec::new();
        let mut temps = Vec::new();
        let mut tanks = Vec::new();
        parser
            .samples_foreach(&mut |s| match s {
                Sample::Depth(m) => depths.push(m),
                Sample::Temperature(c) => temps.push(c),
                Sample::Pressure { bar, .. } => tanks.push(bar),
                _ => {}
            })
            .unwrap();

        let expected = 100000.0 / (DENSITY_SALT * GRAVITY);
        assert!((depths[0] - expected).abs() < 1e-9);
        assert!((temps[0] - 25.0).abs() < 1e-9);
        // 1500 units of 2 psi = 3000 psi ≈ 206.8 bar.
        assert!((tanks[0] - 3000.0 * PSI / BAR).abs() < 1e-6);
    }

    #[test]
    fn foreach_stops_on_fingerprint() {
        let ctx = Context::new();
        let newest = test_blob(3, &[(1100, 70, 0, 0)]);
        let middle = test_blob(2, &[(1200, 70, 0, 0)]);

        let script = vec![
            version_exchange(),
            Exchange::new(vec![CMD_DIVE_COUNT], bulk_reply(&[3, 0])),
            Exchange::new(vec![CMD_DIVE, 0, 0], bulk_reply(&newest)),
            Exchange::new(vec![CMD_DIVE, 1, 0], bulk_reply(&middle)),
        ];
        let port = ReplayTransport::new(script);
        let mut device = CobaltDevice::open(port, &ctx).unwrap();

        // Watermark matches the second-newest dive.
        device.set_fingerprint(&middle[FINGERPRINT_OFFSET..FINGERPRINT_OFFSET + FINGERPRINT_SIZE]);

        let mut seen = Vec::new();
        device
            .foreach(&mut |blob, _| {
                seen.push(blob.to_vec());
                true
            })
            .unwrap();

        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], newest);
        assert_eq!(device.port.exchanges_left(), 0);
    }
}
