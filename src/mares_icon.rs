//! Mares Icon HD / Genius / Sirius family.
//!
//! Memory is exposed as addressable objects: `0x2000 + i` are device and
//! configuration objects, `0x3000 + i` are per-dive objects (sub-index 4 is
//! the 200-byte header, sub-index 3 the profile). An object transfer pairs an
//! init exchange with either an expedited 12-byte payload or a length header
//! followed by toggled even/odd segment packets.

use chrono::{NaiveDate, NaiveDateTime};

use crate::codec::{read_u16_le, read_u32_le};
use crate::context::Context;
use crate::device::{self, Device, DiveCallback, Progress};
use crate::error::{Error, Result};
use crate::parser::{CacheLevel, Parser};
use crate::transport::{Purge, Timeout, Transport};
use crate::types::{DiveMode, Event, Field, FieldValue, GasMix, Sample};

const ACK: u8 = 0xAA;
const END: u8 = 0xEA;
const XOR: u8 = 0xA5;

const CMD_VERSION: u8 = 0xC2;
const CMD_OBJ_INIT: u8 = 0xBF;
const CMD_OBJ_EVEN: u8 = 0xAC;
const CMD_OBJ_ODD: u8 = 0xFE;
const CMD_SET_DATETIME: u8 = 0xB0;

const OBJ_DEVICE: u16 = 0x2000;
const OBJ_DIVE: u16 = 0x3000;
const SUB_PROFILE: u8 = 3;
const SUB_HEADER: u8 = 4;
const SUB_SERIAL: u8 = 4;

const OBJ_SEGMENTED: u8 = 0x41;
const OBJ_EXPEDITED: u8 = 0x42;
const OBJ_ABORT: u8 = 0x80;

/// Max payload bytes per even/odd segment.
const SZ_SEGMENT: usize = 241;
const SZ_VERSION: usize = 140;
pub const SZ_HEADER: usize = 200;

const MAX_RETRIES: u32 = 4;
const RETRY_DELAY_MS: u64 = 100;
const TIMEOUT_MS: u32 = 5000;

pub const FINGERPRINT_OFFSET: usize = 0x04;
pub const FINGERPRINT_SIZE: usize = 8;

/// Model numbers as reported in the version packet's name field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MaresModel {
    IconHd = 0x14,
    IconAir = 0x15,
    PuckPro = 0x18,
    NemoWide2 = 0x19,
    Genius = 0x1C,
    Puck2 = 0x1F,
    QuadAir = 0x23,
    SmartAir = 0x24,
    Quad = 0x29,
    Horizon = 0x2C,
    PuckAir2 = 0x2D,
    Sirius = 0x2F,
    QuadCi = 0x31,
    Quad2 = 0x32,
    Puck4 = 0x35,
    Unknown = 0xFF,
}

impl MaresModel {
    pub fn from_name(name: &str) -> Self {
        match name.trim_end_matches('\0').trim() {
            "Icon HD" => MaresModel::IconHd,
            "Icon AIR" => MaresModel::IconAir,
            "Puck Pro" | "Puck Pro+" => MaresModel::PuckPro,
            "Nemo Wide 2" => MaresModel::NemoWide2,
            "Genius" => MaresModel::Genius,
            "Puck 2" => MaresModel::Puck2,
            "Quad Air" => MaresModel::QuadAir,
            "Smart Air" => MaresModel::SmartAir,
            "Quad" => MaresModel::Quad,
            "Horizon" => MaresModel::Horizon,
            "Puck Air 2" => MaresModel::PuckAir2,
            "Sirius" => MaresModel::Sirius,
            "Quad Ci" => MaresModel::QuadCi,
            "Quad2" => MaresModel::Quad2,
            "Puck4" | "Puck Lite" | "Puck" | "Puck Pro U" => MaresModel::Puck4,
            _ => MaresModel::Unknown,
        }
    }
}

fn cmd_header(cmd: u8) -> [u8; 2] {
    [cmd, cmd ^ XOR]
}

pub struct MaresIconDevice<'a, T: Transport> {
    port: T,
    ctx: &'a Context,
    fingerprint: Option<Vec<u8>>,
    version: Vec<u8>,
    model: MaresModel,
    serial: u32,
}

impl<'a, T: Transport> MaresIconDevice<'a, T> {
    pub fn open(mut port: T, ctx: &'a Context) -> Result<Self> {
        port.set_timeout(Timeout::Millis(TIMEOUT_MS))?;
        port.purge(Purge::Both)?;

        let mut device = MaresIconDevice {
            port,
            ctx,
            fingerprint: None,
            version: Vec::new(),
            model: MaresModel::Unknown,
            serial: 0,
        };

        let version = device.retried(Self::try_version)?;

        // Model name is a null-terminated string at offset 0x46.
        let name_start = 0x46;
        let name_end = version[name_start..]
            .iter()
            .position(|&b| b == 0)
            .map(|p| name_start + p)
            .unwrap_or(version.len().min(name_start + 16));
        let name = String::from_utf8_lossy(&version[name_start..name_end]).to_string();
        device.model = MaresModel::from_name(&name);
        device.version = version;

        // The serial lives in the device object as a decimal string.
        let serial_obj = device
            .object_read(OBJ_DEVICE, SUB_SERIAL)?
            .ok_or(Error::Protocol("device object missing"))?;
        device.serial = String::from_utf8_lossy(&serial_obj)
            .trim_end_matches('\0')
            .trim()
            .parse()
            .unwrap_or(0);

        Ok(device)
    }

    pub fn model(&self) -> MaresModel {
        self.model
    }

    fn retried<R>(
        &mut self,
        op: impl Fn(&mut Self) -> Result<R>,
    ) -> Result<R> {
        let mut last = Error::Timeout;
        for attempt in 0..MAX_RETRIES {
            self.ctx.check_cancelled()?;
            if attempt > 0 {
                self.port.sleep(RETRY_DELAY_MS);
                self.port.purge(Purge::Input)?;
            }
            match op(self) {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() => last = e,
                Err(e) => return Err(e),
            }
        }
        Err(last)
    }

    fn read_byte(&mut self) -> Result<u8> {
        let mut byte = [0u8; 1];
        self.port.read_exact(&mut byte)?;
        Ok(byte[0])
    }

    fn expect_ack(&mut self) -> Result<()> {
        if self.read_byte()? != ACK {
            return Err(Error::Protocol("missing ACK"));
        }
        Ok(())
    }

    fn expect_end(&mut self) -> Result<()> {
        if self.read_byte()? != END {
            return Err(Error::Protocol("missing end trailer"));
        }
        Ok(())
    }

    fn try_version(&mut self) -> Result<Vec<u8>> {
        self.port.write_all(&cmd_header(CMD_VERSION))?;
        self.expect_ack()?;
        let mut payload = vec![0u8; SZ_VERSION];
        self.port.read_exact(&mut payload)?;
        self.expect_end()?;
        Ok(payload)
    }

    /// One attempt at a full object transfer. `None` means the device
    /// aborted: the object does not exist.
    fn try_object_read(&mut self, index: u16, subindex: u8) -> Result<Option<Vec<u8>>> {
        self.port.write_all(&cmd_header(CMD_OBJ_INIT))?;
        self.expect_ack()?;

        let mut request = [0u8; 18];
        request[0] = 0x40;
        request[1] = (index & 0xFF) as u8;
        request[2] = (index >> 8) as u8;
        request[3] = subindex;
        self.port.write_all(&request)?;

        // Init response: status, echoed index/sub, 12 data bytes, trailer.
        let mut response = [0u8; 16];
        self.port.read_exact(&mut response)?;
        self.expect_end()?;

        if response[0] == OBJ_ABORT {
            return Ok(None);
        }
        if response[1] != request[1] || response[2] != request[2] || response[3] != subindex {
            return Err(Error::Protocol("object echo mismatch"));
        }

        match response[0] {
            OBJ_EXPEDITED => Ok(Some(response[4..16].to_vec())),
            OBJ_SEGMENTED => {
                let size = read_u16_le(&response, 4) as usize;
                let mut data = Vec::with_capacity(size);
                let mut toggle = 0u8;
                while data.len() < size {
                    self.ctx.check_cancelled()?;
                    let cmd = if toggle == 0 { CMD_OBJ_EVEN } else { CMD_OBJ_ODD };
                    self.port.write_all(&cmd_header(cmd))?;
                    self.expect_ack()?;

                    let status = self.read_byte()?;
                    if status & 0x01 != toggle {
                        return Err(Error::Protocol("segment toggle mismatch"));
                    }
                    let remaining = size - data.len();
                    let mut segment = vec![0u8; remaining.min(SZ_SEGMENT)];
                    self.port.read_exact(&mut segment)?;
                    self.expect_end()?;
                    data.extend_from_slice(&segment);
                    toggle ^= 1;
                }
                Ok(Some(data))
            }
            _ => Err(Error::Protocol("unknown object status")),
        }
    }

    fn object_read(&mut self, index: u16, subindex: u8) -> Result<Option<Vec<u8>>> {
        self.retried(|device| device.try_object_read(index, subindex))
    }

    /// Download all dive headers, oldest first, probing until the device
    /// aborts.
    fn read_headers(&mut self) -> Result<Vec<Vec<u8>>> {
        let mut headers = Vec::new();
        while headers.len() < 0x1000 {
            let index = OBJ_DIVE + headers.len() as u16;
            match self.object_read(index, SUB_HEADER)? {
                Some(header) => headers.push(header),
                None => break,
            }
        }
        Ok(headers)
    }
}

impl<'a, T: Transport> Device for MaresIconDevice<'a, T> {
    fn set_fingerprint(&mut self, fingerprint: &[u8]) {
        device::store_fingerprint(&mut self.fingerprint, fingerprint);
    }

    fn foreach(&mut self, callback: &mut DiveCallback<'_>) -> Result<()> {
        self.ctx.emit(Event::Vendor {
            data: &self.version,
        });
        self.ctx.emit(Event::DeviceInfo {
            model: self.model as u32,
            firmware: read_u32_le(&self.version, 0),
            serial: self.serial,
        });

        self.ctx.emit(Event::Waiting);
        let headers = self.read_headers()?;
        let mut progress = Progress::new(self.ctx, headers.len() as u32);

        // Dive objects are appended in the order they were made, so walk the
        // indices backwards for newest-first.
        for (index, header) in headers.iter().enumerate().rev() {
            if header.len() < SZ_HEADER {
                return Err(Error::MalformedData("dive header too short"));
            }
            let fp = &header[FINGERPRINT_OFFSET..FINGERPRINT_OFFSET + FINGERPRINT_SIZE];
            if device::fingerprint_matches(&self.fingerprint, fp) {
                break;
            }

            let profile = self
                .retried(|device| device.try_object_read(OBJ_DIVE + index as u16, SUB_PROFILE))?
                .ok_or(Error::MalformedData("dive has a header but no profile"))?;

            let mut blob = Vec::with_capacity(header.len() + profile.len());
            blob.extend_from_slice(header);
            blob.extend_from_slice(&profile);

            progress.add(1);
            let fp = &blob[FINGERPRINT_OFFSET..FINGERPRINT_OFFSET + FINGERPRINT_SIZE];
            if !callback(&blob, fp) {
                return Ok(());
            }
        }

        progress.finish();
        Ok(())
    }

    fn timesync(&mut self, datetime: &NaiveDateTime) -> Result<()> {
        let timestamp = datetime.and_utc().timestamp();
        if !(0..=i64::from(u32::MAX)).contains(&timestamp) {
            return Err(Error::InvalidArgs);
        }
        let payload = (timestamp as u32).to_le_bytes();
        self.retried(|device| {
            device.port.write_all(&cmd_header(CMD_SET_DATETIME))?;
            device.expect_ack()?;
            device.port.write_all(&payload)?;
            device.expect_end()?;
            Ok(())
        })
    }
}

/// Decode the packed 32-bit date bitfield used by this family.
///
/// Bits 0-4 hour, 5-10 minute, 11-15 day, 16-19 month, 20-31 absolute year.
fn decode_datetime(packed: u32) -> Result<NaiveDateTime> {
    let hour = packed & 0x1F;
    let minute = (packed >> 5) & 0x3F;
    let day = (packed >> 11) & 0x1F;
    let month = (packed >> 16) & 0x0F;
    let year = ((packed >> 20) & 0x0FFF) as i32;

    NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|d| d.and_hms_opt(hour, minute, 0))
        .ok_or(Error::MalformedData("invalid date in header"))
}

/// Record sizes in the profile stream. Each record is a 4-byte ASCII tag,
/// payload, 2-byte CRC and the tag repeated.
const RECORD_DSTR: usize = 58;
const RECORD_TISS: usize = 138;
const RECORD_DPRS: usize = 34;
const RECORD_AIRS: usize = 16;
const RECORD_DEND: usize = 162;

const SAMPLE_INTERVAL: u32 = 5;

/// Parser for one `header || profile` blob of this family.
pub struct MaresIconParser<'b> {
    blob: &'b [u8],
    cache: CacheLevel,
    gasmixes: Vec<GasMix>,
}

impl<'b> MaresIconParser<'b> {
    pub fn new(blob: &'b [u8]) -> Result<Self> {
        if blob.len() < SZ_HEADER {
            return Err(Error::MalformedData("blob shorter than dive header"));
        }
        Ok(MaresIconParser {
            blob,
            cache: CacheLevel::Empty,
            gasmixes: Vec::new(),
        })
    }

    pub fn dive_number(&self) -> u32 {
        read_u32_le(self.blob, 0x04)
    }

    fn settings(&self) -> u32 {
        read_u32_le(self.blob, 0x0C)
    }

    fn nsamples(&self) -> u32 {
        u32::from(read_u16_le(self.blob, 0x20))
    }

    fn load_header(&mut self) {
        if self.cache >= CacheLevel::HeaderValid {
            return;
        }
        // Gas table: five 20-byte slots at 0x54. A slot is live when its
        // state says READY or INUSE and the O2 value is plausible.
        for i in 0..5 {
            let offset = 0x54 + i * 20;
            if offset + 4 > self.blob.len() {
                break;
            }
            let params = read_u32_le(self.blob, offset);
            let o2 = (params & 0x7F) as u8;
            let state = ((params >> 21) & 0x03) as u8;
            if state > 0 && state < 3 && o2 > 0 && o2 <= 100 {
                self.gasmixes.push(GasMix::from_percent(o2, 0));
            }
        }
        if self.gasmixes.is_empty() {
            self.gasmixes.push(GasMix::from_percent(21, 0));
        }
        self.cache = CacheLevel::HeaderValid;
    }

    fn profile(&self) -> &'b [u8] {
        &self.blob[SZ_HEADER..]
    }
}

impl<'b> Parser for MaresIconParser<'b> {
    fn datetime(&mut self) -> Result<NaiveDateTime> {
        decode_datetime(read_u32_le(self.blob, 0x08))
    }

    fn field(&mut self, field: Field) -> Result<Option<FieldValue>> {
        self.load_header();
        match field {
            Field::DiveTime => {
                let surftime_min = (self.settings() >> 13) & 0x3F;
                let total = self.nsamples() * SAMPLE_INTERVAL;
                Ok(Some(FieldValue::Time(
                    total.saturating_sub(surftime_min * 60),
                )))
            }
            Field::MaxDepth => Ok(Some(FieldValue::Depth(
                f64::from(read_u16_le(self.blob, 0x22)) / 10.0,
            ))),
            Field::GasMixCount => Ok(Some(FieldValue::Count(self.gasmixes.len() as u32))),
            Field::GasMix(i) => Ok(self.gasmixes.get(i).copied().map(FieldValue::GasMix)),
            Field::Atmospheric => Ok(Some(FieldValue::Pressure(
                f64::from(read_u16_le(self.blob, 0x3E)) / 1000.0,
            ))),
            Field::DiveMode => {
                let mode = match self.settings() & 0x0F {
                    4 => DiveMode::Gauge,
                    5 => DiveMode::Freedive,
                    _ => DiveMode::OpenCircuit,
                };
                Ok(Some(FieldValue::Mode(mode)))
            }
            _ => Ok(None),
        }
    }

    fn samples_foreach(&mut self, callback: &mut dyn FnMut(Sample<'_>)) -> Result<()> {
        self.load_header();
        let profile = self.profile();
        let mut time_ms = 0u32;

        // Skip the 4-byte object classifier when present.
        let mut offset = if profile.len() >= 8 && &profile[4..8] == b"DSTR" {
            4
        } else {
            0
        };

        while offset + 4 <= profile.len() {
            let tag = &profile[offset..offset + 4];
            match tag {
                b"DSTR" => offset += RECORD_DSTR,
                b"TISS" => offset += RECORD_TISS,
                b"DPRS" => {
                    if offset + RECORD_DPRS > profile.len() {
                        return Err(Error::MalformedData("truncated depth record"));
                    }
                    let record = &profile[offset..offset + RECORD_DPRS];
                    time_ms += SAMPLE_INTERVAL * 1000;
                    callback(Sample::Time(time_ms));
                    callback(Sample::Depth(f64::from(read_u16_le(record, 4)) / 10.0));
                    let temperature = read_u16_le(record, 8) as i16;
                    if temperature > 0 {
                        callback(Sample::Temperature(f64::from(temperature) / 10.0));
                    }
                    callback(Sample::Vendor { kind: 0, data: record });
                    offset += RECORD_DPRS;
                }
                b"AIRS" => {
                    if offset + RECORD_AIRS > profile.len() {
                        return Err(Error::MalformedData("truncated air record"));
                    }
                    let record = &profile[offset..offset + RECORD_AIRS];
                    let pressure = read_u16_le(record, 4);
                    if pressure > 0 {
                        callback(Sample::Pressure {
                            tank: 0,
                            bar: f64::from(pressure) / 100.0,
                        });
                    }
                    callback(Sample::Vendor { kind: 1, data: record });
                    offset += RECORD_AIRS;
                }
                b"DEND" => offset += RECORD_DEND,
                _ => {
                    // Unknown bytes between records: resynchronise on the
                    // next known tag.
                    offset += 1;
                }
            }
        }

        self.cache = CacheLevel::ProfileValid;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{write_u16_le, write_u32_le};
    use crate::transport::{Exchange, ReplayTransport};

    fn expedited_response(index: u16, subindex: u8, data12: &[u8; 12]) -> Vec<u8> {
        let mut out = vec![OBJ_EXPEDITED, (index & 0xFF) as u8, (index >> 8) as u8, subindex];
        out.extend_from_slice(data12);
        out.push(END);
        out
    }

    fn object_request(index: u16, subindex: u8) -> Vec<u8> {
        let mut request = vec![0u8; 18];
        request[0] = 0x40;
        request[1] = (index & 0xFF) as u8;
        request[2] = (index >> 8) as u8;
        request[3] = subindex;
        request
    }

    fn version_script() -> Vec<Exchange> {
        let mut version = vec![0u8; SZ_VERSION];
        version[0x46..0x4C].copy_from_slice(b"Sirius");
        let mut reply = vec![ACK];
        reply.extend_from_slice(&version);
        reply.push(END);

        let mut serial12 = *b"001234567\0\0\0";
        serial12[9] = 0;
        vec![
            Exchange::new(cmd_header(CMD_VERSION).to_vec(), reply),
            Exchange::new(cmd_header(CMD_OBJ_INIT).to_vec(), vec![ACK]),
            Exchange::new(
                object_request(OBJ_DEVICE, SUB_SERIAL),
                expedited_response(OBJ_DEVICE, SUB_SERIAL, &serial12),
            ),
        ]
    }

    #[test]
    fn open_identifies_model_and_serial() {
        let ctx = Context::new();
        let port = ReplayTransport::new(version_script());
        let device = MaresIconDevice::open(port, &ctx).unwrap();
        assert_eq!(device.model(), MaresModel::Sirius);
        assert_eq!(device.serial, 1234567);
        assert_eq!(device.port.exchanges_left(), 0);
    }

    #[test]
    fn segmented_object_read() {
        let ctx = Context::new();
        let mut script = version_script();

        let payload: Vec<u8> = (0..=255u8).chain(0..=49).collect(); // 306 bytes
        let index = OBJ_DIVE;

        // Init: segmented, size in bytes 4-5.
        let mut init = vec![OBJ_SEGMENTED, (index & 0xFF) as u8, (index >> 8) as u8, SUB_HEADER];
        init.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        init.extend_from_slice(&[0u8; 10]);
        init.push(END);
        script.push(Exchange::new(cmd_header(CMD_OBJ_INIT).to_vec(), vec![ACK]));
        script.push(Exchange::new(object_request(index, SUB_HEADER), init));

        // Segment 1 (even): 241 bytes; segment 2 (odd): the remaining 65.
        let mut seg1 = vec![ACK, 0x00];
        seg1.extend_from_slice(&payload[..SZ_SEGMENT]);
        seg1.push(END);
        script.push(Exchange::new(cmd_header(CMD_OBJ_EVEN).to_vec(), seg1));

        let mut seg2 = vec![ACK, 0x01];
        seg2.extend_from_slice(&payload[SZ_SEGMENT..]);
        seg2.push(END);
        script.push(Exchange::new(cmd_header(CMD_OBJ_ODD).to_vec(), seg2));

        let port = ReplayTransport::new(script);
        let mut device = MaresIconDevice::open(port, &ctx).unwrap();
        let data = device.object_read(index, SUB_HEADER).unwrap().unwrap();
        assert_eq!(data, payload);
    }

    #[test]
    fn aborted_object_is_none() {
        let ctx = Context::new();
        let mut script = version_script();
        let index = OBJ_DIVE + 3;
        let mut abort = vec![OBJ_ABORT, 0, 0, 0];
        abort.extend_from_slice(&[0u8; 12]);
        abort.push(END);
        script.push(Exchange::new(cmd_header(CMD_OBJ_INIT).to_vec(), vec![ACK]));
        script.push(Exchange::new(object_request(index, SUB_HEADER), abort));

        let port = ReplayTransport::new(script);
        let mut device = MaresIconDevice::open(port, &ctx).unwrap();
        assert!(device.object_read(index, SUB_HEADER).unwrap().is_none());
    }

    fn packed_datetime(year: u32, month: u32, day: u32, hour: u32, minute: u32) -> u32 {
        hour | minute << 5 | day << 11 | month << 16 | year << 20
    }

    fn test_header(number: u32, nsamples: u16) -> Vec<u8> {
        let mut header = vec![0u8; SZ_HEADER];
        write_u16_le(&mut header, 0x00, 1);
        write_u32_le(&mut header, 0x04, number);
        write_u32_le(&mut header, 0x08, packed_datetime(2025, 3, 14, 9, 26));
        write_u32_le(&mut header, 0x0C, 0); // air, no surface time
        write_u16_le(&mut header, 0x20, nsamples);
        write_u16_le(&mut header, 0x22, 182); // 18.2 m
        write_u16_le(&mut header, 0x3E, 1013);
        // One nitrox slot, state READY.
        write_u32_le(&mut header, 0x54, 32 | 1 << 21);
        header
    }

    fn dprs_record(depth_dm: u16, temp_dc: u16) -> Vec<u8> {
        let mut record = vec![0u8; RECORD_DPRS];
        record[..4].copy_from_slice(b"DPRS");
        write_u16_le(&mut record, 4, depth_dm);
        write_u16_le(&mut record, 8, temp_dc);
        record[RECORD_DPRS - 4..].copy_from_slice(b"DPRS");
        record
    }

    fn airs_record(pressure_cb: u16) -> Vec<u8> {
        let mut record = vec![0u8; RECORD_AIRS];
        record[..4].copy_from_slice(b"AIRS");
        write_u16_le(&mut record, 4, pressure_cb);
        record[RECORD_AIRS - 4..].copy_from_slice(b"AIRS");
        record
    }

    #[test]
    fn parser_decodes_header_and_profile() {
        let mut blob = test_header(42, 2);
        blob.extend_from_slice(&dprs_record(105, 241));
        blob.extend_from_slice(&airs_record(18550));
        blob.extend_from_slice(&dprs_record(121, 239));

        let mut parser = MaresIconParser::new(&blob).unwrap();
        assert_eq!(parser.dive_number(), 42);
        assert_eq!(
            parser.datetime().unwrap(),
            NaiveDate::from_ymd_opt(2025, 3, 14)
                .unwrap()
                .and_hms_opt(9, 26, 0)
                .unwrap()
        );
        assert_eq!(
            parser.field(Field::DiveTime).unwrap(),
            Some(FieldValue::Time(10))
        );
        assert_eq!(
            parser.field(Field::GasMixCount).unwrap(),
            Some(FieldValue::Count(1))
        );

        let mut events = Vec::new();
        parser
            .samples_foreach(&mut |sample| {
                events.push(format!("{sample:?}"));
            })
            .unwrap();
        // Two timed samples, one pressure in between.
        assert!(events[0].starts_with("Time(5000"));
        assert!(events.iter().any(|e| e.starts_with("Pressure")));
        assert!(events.iter().any(|e| e.starts_with("Depth(12.1")));
    }

    #[test]
    fn short_blob_is_malformed() {
        assert!(matches!(
            MaresIconParser::new(&[0u8; 16]),
            Err(Error::MalformedData(_))
        ));
    }
}
