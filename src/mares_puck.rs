//! Mares Puck family.
//!
//! A plain serial device whose commands and replies travel as printable
//! ASCII frames: `<` + hex-encoded body + hex-encoded checksum + `>`, where
//! the checksum is the ones' complement of the byte sum of the body. The
//! device is slow: command bytes are paced at 16 ms apiece.

use chrono::{NaiveDate, NaiveDateTime};

use crate::codec::{bcd2dec, bin2hex, hex2bin, is_filled_with, read_u16_le};
use crate::context::Context;
use crate::device::{self, Device, DiveCallback, Progress};
use crate::error::{Error, Result};
use crate::parser::{CacheLevel, Parser};
use crate::ringbuf::RingLayout;
use crate::transport::{LineConfig, Purge, Timeout, Transport};
use crate::types::{Event, Field, FieldValue, Sample};

pub const SZ_MEMORY: usize = 0x4000;
const SZ_PACKET: usize = 0x80;

/// Profile data ring; everything below it is configuration.
pub const RB_PROFILE: RingLayout = RingLayout::new(0x0100, 0x4000);

/// Config offset of the end-of-profile pointer (u16 LE).
const EOP_ADDRESS: usize = 0x00F0;

const CMD_MEMREAD: [u8; 2] = [0x51, 0x31]; // "Q1"
const CMD_VERSION: [u8; 2] = [0x56, 0x31]; // "V1"

const MAX_RETRIES: u32 = 4;
const RETRY_DELAY_MS: u64 = 100;
/// Inter-byte pacing; the device drops bytes when written back to back.
const BYTE_DELAY_MS: u64 = 16;

pub const FINGERPRINT_SIZE: usize = 6;
const HEADER_SIZE: usize = 12;
const TRAILER_SIZE: usize = 2;

fn checksum(body: &[u8]) -> u8 {
    !body.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// Wrap a binary body into its printable frame.
fn frame(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() * 2 + 4);
    out.push(b'<');
    out.extend_from_slice(bin2hex(body).as_bytes());
    out.extend_from_slice(bin2hex(&[checksum(body)]).as_bytes());
    out.push(b'>');
    out
}

pub struct MaresPuckDevice<'a, T: Transport> {
    port: T,
    ctx: &'a Context,
    fingerprint: Option<Vec<u8>>,
    version: Vec<u8>,
}

impl<'a, T: Transport> MaresPuckDevice<'a, T> {
    pub fn open(mut port: T, ctx: &'a Context) -> Result<Self> {
        port.configure(&LineConfig::eight_n_one(38400))?;
        port.set_timeout(Timeout::Millis(1000))?;
        port.purge(Purge::Both)?;

        let mut device = MaresPuckDevice {
            port,
            ctx,
            fingerprint: None,
            version: Vec::new(),
        };
        device.version = device.transfer(&CMD_VERSION, 8)?;
        Ok(device)
    }

    /// Write one frame with inter-byte pacing.
    fn send(&mut self, data: &[u8]) -> Result<()> {
        for (i, &b) in data.iter().enumerate() {
            if i > 0 {
                self.port.sleep(BYTE_DELAY_MS);
            }
            self.port.write_all(&[b])?;
        }
        Ok(())
    }

    /// Read one `<...>` frame and return its decoded body, checksum
    /// stripped and verified.
    fn recv(&mut self, expected: usize) -> Result<Vec<u8>> {
        let mut byte = [0u8; 1];
        self.port.read_exact(&mut byte)?;
        if byte[0] != b'<' {
            return Err(Error::Protocol("missing frame start"));
        }

        let limit = (expected + 1) * 2;
        let mut hex = Vec::with_capacity(limit);
        loop {
            self.port.read_exact(&mut byte)?;
            if byte[0] == b'>' {
                break;
            }
            hex.push(byte[0]);
            if hex.len() > limit {
                return Err(Error::Protocol("oversized frame"));
            }
        }

        let body = hex2bin(&hex).map_err(|_| Error::Protocol("frame is not hex"))?;
        if body.len() != expected + 1 {
            return Err(Error::Protocol("unexpected frame length"));
        }
        let (data, ck) = body.split_at(expected);
        if ck[0] != checksum(data) {
            return Err(Error::Protocol("bad checksum"));
        }
        Ok(data.to_vec())
    }

    /// One framed command/response with bounded retries.
    fn transfer(&mut self, body: &[u8], expected: usize) -> Result<Vec<u8>> {
        let request = frame(body);
        let mut last = Error::Timeout;
        for attempt in 0..MAX_RETRIES {
            self.ctx.check_cancelled()?;
            if attempt > 0 {
                self.port.sleep(RETRY_DELAY_MS);
                self.port.purge(Purge::Input)?;
            }
            let result = self
                .send(&request)
                .and_then(|()| self.recv(expected));
            match result {
                Ok(data) => return Ok(data),
                Err(e) if e.is_retryable() => last = e,
                Err(e) => return Err(e),
            }
        }
        Err(last)
    }

    fn read_memory(&mut self, address: u16, buf: &mut [u8]) -> Result<()> {
        let mut body = Vec::with_capacity(5);
        body.extend_from_slice(&CMD_MEMREAD);
        body.extend_from_slice(&address.to_le_bytes());
        body.push(buf.len() as u8);
        let data = self.transfer(&body, buf.len())?;
        buf.copy_from_slice(&data);
        Ok(())
    }

    fn download(&mut self, progress: &mut Progress<'_>) -> Result<Vec<u8>> {
        let mut memory = vec![0u8; SZ_MEMORY];
        for offset in (0..SZ_MEMORY).step_by(SZ_PACKET) {
            self.read_memory(offset as u16, &mut memory[offset..offset + SZ_PACKET])?;
            progress.add(SZ_PACKET as u32);
        }
        Ok(memory)
    }
}

impl<'a, T: Transport> Device for MaresPuckDevice<'a, T> {
    fn set_fingerprint(&mut self, fingerprint: &[u8]) {
        device::store_fingerprint(&mut self.fingerprint, fingerprint);
    }

    fn foreach(&mut self, callback: &mut DiveCallback<'_>) -> Result<()> {
        self.ctx.emit(Event::Vendor {
            data: &self.version,
        });
        self.ctx.emit(Event::DeviceInfo {
            model: u32::from(self.version[0]),
            firmware: u32::from(self.version[1]) << 8 | u32::from(self.version[2]),
            serial: read_u16_le(&self.version, 4) as u32
                | (read_u16_le(&self.version, 6) as u32) << 16,
        });

        let mut progress = Progress::new(self.ctx, SZ_MEMORY as u32);
        let memory = self.download(&mut progress)?;
        progress.finish();

        extract_dives(&memory, &self.fingerprint, callback)
    }

    fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<()> {
        if address as usize + buf.len() > SZ_MEMORY || buf.len() > 0xFF {
            return Err(Error::InvalidArgs);
        }
        self.read_memory(address as u16, buf)
    }

    fn dump(&mut self) -> Result<Vec<u8>> {
        let mut progress = Progress::new(self.ctx, SZ_MEMORY as u32);
        let memory = self.download(&mut progress)?;
        progress.finish();
        Ok(memory)
    }
}

/// Walk the profile ring backwards from the end-of-profile pointer.
///
/// Every dive record ends with a u16 LE trailer holding the record's total
/// length. A zero, overlong or `0xFFFF` trailer means the remaining area is
/// unused and terminates the walk cleanly.
pub fn extract_dives(
    memory: &[u8],
    fingerprint: &Option<Vec<u8>>,
    callback: &mut DiveCallback<'_>,
) -> Result<()> {
    if memory.len() < SZ_MEMORY {
        return Err(Error::MalformedData("memory image too short"));
    }

    let eop = u32::from(read_u16_le(memory, EOP_ADDRESS));
    if !RB_PROFILE.contains(eop) && eop != RB_PROFILE.end {
        return Err(Error::MalformedData("end-of-profile pointer out of range"));
    }

    // A pointer at the very end is the same ring position as `begin`.
    let mut current = if eop == RB_PROFILE.end {
        RB_PROFILE.begin
    } else {
        eop
    };
    let mut remaining = RB_PROFILE.size();

    while remaining >= (HEADER_SIZE + TRAILER_SIZE) as u32 {
        // The length trailer sits in the two bytes before `current`.
        let t1 = RB_PROFILE.decrement(current, 2) as usize;
        let t0 = RB_PROFILE.decrement(current, 1) as usize;
        let length = u32::from(memory[t1]) | u32::from(memory[t0]) << 8;

        if length == 0 || length == 0xFFFF {
            break;
        }
        if length < (HEADER_SIZE + TRAILER_SIZE) as u32 || length > remaining {
            log::warn!("puck: implausible dive length {length}, stopping walk");
            break;
        }

        let start = RB_PROFILE.decrement(current, length);
        if is_filled_with(&[memory[start as usize]], 0xFF) {
            log::warn!("puck: uninitialised ringbuffer slot, stopping walk");
            break;
        }

        // Copy the dive out of the ring, handling wrap with two copies.
        let mut blob = Vec::with_capacity(length as usize);
        let start_us = start as usize;
        let current_us = current as usize;
        if start < current {
            blob.extend_from_slice(&memory[start_us..current_us]);
        } else {
            blob.extend_from_slice(&memory[start_us..RB_PROFILE.end as usize]);
            blob.extend_from_slice(&memory[RB_PROFILE.begin as usize..current_us]);
        }

        let fp = &blob[..FINGERPRINT_SIZE];
        if device::fingerprint_matches(fingerprint, fp) {
            return Ok(());
        }
        if !callback(&blob, fp) {
            return Ok(());
        }

        current = start;
        remaining -= length;
    }

    Ok(())
}

/// Parser for one dive record.
///
/// Layout: six BCD date/time bytes, max depth (u16 LE, 1/10 m), sample
/// interval, one reserved byte, sample count (u16 LE), then one u16 LE depth
/// per sample (1/10 m) and the length trailer.
pub struct MaresPuckParser<'b> {
    blob: &'b [u8],
    cache: CacheLevel,
    nsamples: usize,
}

impl<'b> MaresPuckParser<'b> {
    pub fn new(blob: &'b [u8]) -> Result<Self> {
        if blob.len() < HEADER_SIZE + TRAILER_SIZE {
            return Err(Error::MalformedData("dive shorter than header and trailer"));
        }
        Ok(MaresPuckParser {
            blob,
            cache: CacheLevel::Empty,
            nsamples: 0,
        })
    }

    fn load_header(&mut self) -> Result<()> {
        if self.cache >= CacheLevel::HeaderValid {
            return Ok(());
        }
        let nsamples = read_u16_le(self.blob, 10) as usize;
        if HEADER_SIZE + nsamples * 2 + TRAILER_SIZE > self.blob.len() {
            return Err(Error::MalformedData("sample count exceeds dive record"));
        }
        self.nsamples = nsamples;
        self.cache = CacheLevel::HeaderValid;
        Ok(())
    }

    fn interval(&self) -> u32 {
        u32::from(self.blob[8]).max(1)
    }
}

impl<'b> Parser for MaresPuckParser<'b> {
    fn datetime(&mut self) -> Result<NaiveDateTime> {
        let b = self.blob;
        for &digit in &b[..6] {
            if digit >> 4 > 9 || digit & 0x0F > 9 {
                return Err(Error::MalformedData("date is not BCD"));
            }
        }
        let year = 2000 + i32::from(bcd2dec(b[0]));
        NaiveDate::from_ymd_opt(year, u32::from(bcd2dec(b[1])), u32::from(bcd2dec(b[2])))
            .and_then(|d| {
                d.and_hms_opt(
                    u32::from(bcd2dec(b[3])),
                    u32::from(bcd2dec(b[4])),
                    u32::from(bcd2dec(b[5])),
                )
            })
            .ok_or(Error::MalformedData("invalid date in header"))
    }

    fn field(&mut self, field: Field) -> Result<Option<FieldValue>> {
        self.load_header()?;
        match field {
            Field::DiveTime => Ok(Some(FieldValue::Time(
                self.nsamples as u32 * self.interval(),
            ))),
            Field::MaxDepth => Ok(Some(FieldValue::Depth(
                f64::from(read_u16_le(self.blob, 6)) / 10.0,
            ))),
            _ => Ok(None),
        }
    }

    fn samples_foreach(&mut self, callback: &mut dyn FnMut(Sample<'_>)) -> Result<()> {
        self.load_header()?;
        let mut time_ms = 0u32;
        for i in 0..self.nsamples {
            let offset = HEADER_SIZE + i * 2;
            let window = &self.blob[offset..offset + 2];
            time_ms += self.interval() * 1000;
            callback(Sample::Time(time_ms));
            callback(Sample::Depth(f64::from(read_u16_le(window, 0)) / 10.0));
            callback(Sample::Vendor { kind: 0, data: window });
        }
        self.cache = CacheLevel::ProfileValid;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{dec2bcd, write_u16_le};
    use crate::transport::{Exchange, ReplayTransport};

    #[test]
    fn frame_matches_wire_format() {
        // A 4-byte read at 0x0070.
        let body = [0x51, 0x31, 0x70, 0x00, 0x04];
        assert_eq!(frame(&body), b"<513170000409>".to_vec());
    }

    fn version_exchange() -> Exchange {
        let version = [0x07u8, 0x01, 0x02, 0x00, 0x39, 0x30, 0x00, 0x00];
        Exchange::new(frame(&CMD_VERSION), frame(&version))
    }

    #[test]
    fn corrupt_reply_triggers_retry() {
        let ctx = Context::new();

        let mut body = Vec::new();
        body.extend_from_slice(&CMD_MEMREAD);
        body.extend_from_slice(&0x0070u16.to_le_bytes());
        body.push(4);
        let request = frame(&body);
        assert_eq!(request, b"<513170000409>".to_vec());

        let data = [0xDE, 0xAD, 0xBE, 0xEF];
        let good = frame(&data);
        let mut corrupt = good.clone();
        corrupt[1] ^= 0x01; // flip one hex digit: checksum no longer matches

        let script = vec![
            version_exchange(),
            Exchange::new(request.clone(), corrupt),
            Exchange::new(request, good),
        ];
        let port = ReplayTransport::new(script);
        let mut device = MaresPuckDevice::open(port, &ctx).unwrap();

        let mut buf = [0u8; 4];
        device.read(0x0070, &mut buf).unwrap();
        assert_eq!(buf, data);
        assert_eq!(device.port.exchanges_left(), 0);
    }

    fn dive_record(day: u8, depths_dm: &[u16]) -> Vec<u8> {
        let mut record = vec![0u8; HEADER_SIZE];
        record[0] = dec2bcd(24);
        record[1] = dec2bcd(6);
        record[2] = dec2bcd(day);
        record[3] = dec2bcd(10);
        record[4] = dec2bcd(30);
        record[5] = dec2bcd(0);
        let maxdepth = depths_dm.iter().copied().max().unwrap_or(0);
        write_u16_le(&mut record, 6, maxdepth);
        record[8] = 20; // interval
        write_u16_le(&mut record, 10, depths_dm.len() as u16);
        for &d in depths_dm {
            record.extend_from_slice(&d.to_le_bytes());
        }
        let length = (record.len() + TRAILER_SIZE) as u16;
        record.extend_from_slice(&length.to_le_bytes());
        record
    }

    fn build_memory(dives: &[Vec<u8>]) -> Vec<u8> {
        let mut memory = vec![0u8; SZ_MEMORY];
        let mut p = RB_PROFILE.begin as usize;
        for dive in dives {
            memory[p..p + dive.len()].copy_from_slice(dive);
            p += dive.len();
        }
        write_u16_le(&mut memory, EOP_ADDRESS, p as u16);
        memory
    }

    #[test]
    fn extract_walks_newest_first_until_watermark() {
        let dives = vec![
            dive_record(1, &[50, 100, 50]),
            dive_record(2, &[80]),
            dive_record(3, &[120, 130]),
        ];
        let memory = build_memory(&dives);

        let mut seen = Vec::new();
        extract_dives(&memory, &None, &mut |blob, fp| {
            assert_eq!(fp, &blob[..FINGERPRINT_SIZE]);
            seen.push(blob.to_vec());
            true
        })
        .unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0], dives[2]);
        assert_eq!(seen[2], dives[0]);

        // Watermark on the newest dive: nothing is emitted.
        let watermark = dives[2][..FINGERPRINT_SIZE].to_vec();
        let mut count = 0;
        extract_dives(&memory, &Some(watermark), &mut |_, _| {
            count += 1;
            true
        })
        .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn bad_eop_is_malformed() {
        let mut memory = vec![0u8; SZ_MEMORY];
        write_u16_le(&mut memory, EOP_ADDRESS, 0x0010);
        assert!(matches!(
            extract_dives(&memory, &None, &mut |_, _| true),
            Err(Error::MalformedData(_))
        ));
    }

    #[test]
    fn parser_decodes_bcd_date_and_samples() {
        let record = dive_record(15, &[50, 105]);
        let mut parser = MaresPuckParser::new(&record).unwrap();
        assert_eq!(
            parser.datetime().unwrap(),
            NaiveDate::from_ymd_opt(2024, 6, 15)
                .unwrap()
                .and_hms_opt(10, 30, 0)
                .unwrap()
        );
        assert_eq!(
            parser.field(Field::DiveTime).unwrap(),
            Some(FieldValue::Time(40))
        );
        let mut depths = Vec::new();
        parser
            .samples_foreach(&mut |s| {
                if let Sample::Depth(m) = s {
                    depths.push(m);
                }
            })
            .unwrap();
        assert_eq!(depths, vec![5.0, 10.5]);
    }
}
