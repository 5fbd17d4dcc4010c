//! Suunto ring-walk family.
//!
//! The device stores its whole dive log in one small circular memory region.
//! There is no end-of-profile pointer in a header: the newest byte is marked
//! in-band with the `0x82` sentinel, and every dive starts with a `0x80`
//! marker. The driver downloads the full memory image and reconstructs the
//! dives host-side, newest first.

use chrono::{NaiveDate, NaiveDateTime};

use crate::context::Context;
use crate::device::{self, Device, DiveCallback, Progress};
use crate::error::{Error, Result};
use crate::parser::{CacheLevel, Parser, FEET};
use crate::ringbuf::{Overlap, RingLayout};
use crate::transport::{LineConfig, Purge, Timeout, Transport};
use crate::types::{Event, Field, FieldValue, Sample};

pub const SZ_MEMORY: usize = 0x100;
const SZ_PAGE: usize = 0x20;
const SZ_ID: usize = 0x20;

/// Dive data lives in `[0x02, 0xEC)`; the bytes outside hold the device
/// identification page and calibration values.
pub const RB_PROFILE: RingLayout = RingLayout::new(0x02, 0xEC);

/// Marks the newest byte of the ring.
const EOP_SENTINEL: u8 = 0x82;
/// First byte of every dive.
const DIVE_MARKER: u8 = 0x80;

const CMD_READ: u8 = 0x05;
const MAX_RETRIES: u32 = 4;
const RETRY_DELAY_MS: u64 = 100;

pub const FINGERPRINT_OFFSET: usize = 1;
pub const FINGERPRINT_SIZE: usize = 4;

const HEADER_SIZE: usize = 8;

pub struct SuuntoDevice<'a, T: Transport> {
    port: T,
    ctx: &'a Context,
    fingerprint: Option<Vec<u8>>,
    id_page: [u8; SZ_ID],
}

impl<'a, T: Transport> SuuntoDevice<'a, T> {
    pub fn open(mut port: T, ctx: &'a Context) -> Result<Self> {
        port.configure(&LineConfig::eight_n_one(1200))?;
        port.set_timeout(Timeout::Millis(1000))?;
        port.purge(Purge::Both)?;

        let mut device = SuuntoDevice {
            port,
            ctx,
            fingerprint: None,
            id_page: [0; SZ_ID],
        };

        let mut id = [0; SZ_ID];
        device.read_page(0x00, &mut id)?;
        device.id_page = id;
        Ok(device)
    }

    fn serial(&self) -> u32 {
        u32::from_be_bytes([
            self.id_page[0],
            self.id_page[1],
            self.id_page[2],
            self.id_page[3],
        ])
    }

    /// One framed memory read with bounded retries. The reply echoes the
    /// command byte, address and length, and ends with an XOR checksum over
    /// everything before it.
    fn read_page(&mut self, address: u8, buf: &mut [u8]) -> Result<()> {
        let mut last = Error::Timeout;
        for attempt in 0..MAX_RETRIES {
            self.ctx.check_cancelled()?;
            if attempt > 0 {
                self.port.sleep(RETRY_DELAY_MS);
                self.port.purge(Purge::Input)?;
            }
            match self.try_read_page(address, buf) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() => last = e,
                Err(e) => return Err(e),
            }
        }
        Err(last)
    }

    fn try_read_page(&mut self, address: u8, buf: &mut [u8]) -> Result<()> {
        let len = buf.len() as u8;
        let command = [CMD_READ, address, len];
        self.port.write_all(&command)?;

        let mut header = [0u8; 3];
        self.port.read_exact(&mut header)?;
        if header[0] != CMD_READ {
            return Err(Error::Protocol("missing command echo"));
        }
        if header[1] != address || header[2] != len {
            return Err(Error::Protocol("address/length echo mismatch"));
        }

        self.port.read_exact(buf)?;

        let mut checksum = [0u8; 1];
        self.port.read_exact(&mut checksum)?;
        let mut expected = CMD_READ ^ address ^ len;
        for &b in buf.iter() {
            expected ^= b;
        }
        if checksum[0] != expected {
            return Err(Error::Protocol("bad checksum"));
        }
        Ok(())
    }

    fn download(&mut self, progress: &mut Progress<'_>) -> Result<Vec<u8>> {
        let mut memory = vec![0u8; SZ_MEMORY];
        for page in 0..SZ_MEMORY / SZ_PAGE {
            let address = (page * SZ_PAGE) as u8;
            let chunk = &mut memory[page * SZ_PAGE..(page + 1) * SZ_PAGE];
            self.read_page(address, chunk)?;
            progress.add(SZ_PAGE as u32);
        }
        Ok(memory)
    }
}

impl<'a, T: Transport> Device for SuuntoDevice<'a, T> {
    fn set_fingerprint(&mut self, fingerprint: &[u8]) {
        device::store_fingerprint(&mut self.fingerprint, fingerprint);
    }

    fn foreach(&mut self, callback: &mut DiveCallback<'_>) -> Result<()> {
        self.ctx.emit(Event::Vendor {
            data: &self.id_page,
        });
        self.ctx.emit(Event::DeviceInfo {
            model: u32::from(self.id_page[5]),
            firmware: u32::from(self.id_page[4]),
            serial: self.serial(),
        });

        let mut progress = Progress::new(self.ctx, SZ_MEMORY as u32);
        let memory = self.download(&mut progress)?;
        progress.finish();

        extract_dives(&memory, &self.fingerprint, callback)
    }

    fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<()> {
        if address as usize + buf.len() > SZ_MEMORY {
            return Err(Error::InvalidArgs);
        }
        self.read_page(address as u8, buf)
    }

    fn dump(&mut self) -> Result<Vec<u8>> {
        let mut progress = Progress::new(self.ctx, SZ_MEMORY as u32);
        let memory = self.download(&mut progress)?;
        progress.finish();
        Ok(memory)
    }
}

/// Split a full memory image into dives, newest first, honoring the
/// watermark. Shared by `foreach` and the dump-based diagnostic flow.
pub fn extract_dives(
    memory: &[u8],
    fingerprint: &Option<Vec<u8>>,
    callback: &mut DiveCallback<'_>,
) -> Result<()> {
    if memory.len() < SZ_MEMORY {
        return Err(Error::MalformedData("memory image too short"));
    }

    // Locate the end-of-profile sentinel inside the ring.
    let mut eop = None;
    for p in RB_PROFILE.begin..RB_PROFILE.end {
        if memory[p as usize] == EOP_SENTINEL {
            eop = Some(p);
            break;
        }
    }
    let eop = eop.ok_or(Error::MalformedData("end-of-profile sentinel not found"))?;
    if memory[eop as usize] != EOP_SENTINEL {
        return Err(Error::MalformedData("end-of-profile sentinel not found"));
    }

    let mut current = eop;
    let mut remaining = RB_PROFILE.size();

    loop {
        // Scan backwards for the dive marker preceding `current`.
        let mut marker = None;
        let mut k = 1;
        while k <= remaining {
            let p = RB_PROFILE.decrement(current, k);
            if memory[p as usize] == DIVE_MARKER {
                marker = Some((p, k));
                break;
            }
            k += 1;
        }
        let Some((marker, length)) = marker else {
            break; // reached the oldest data
        };

        // Copy marker..current out of the ring, handling wrap.
        let mut blob = Vec::with_capacity(length as usize);
        let mut p = marker;
        while p != current {
            blob.push(memory[p as usize]);
            p = RB_PROFILE.increment(p, 1);
        }
        debug_assert_eq!(blob.len() as u32, RB_PROFILE.distance(marker, current, Overlap::Empty));

        if blob.len() >= FINGERPRINT_OFFSET + FINGERPRINT_SIZE {
            let fp = &blob[FINGERPRINT_OFFSET..FINGERPRINT_OFFSET + FINGERPRINT_SIZE];
            if device::fingerprint_matches(fingerprint, fp) {
                return Ok(());
            }
            if !callback(&blob, fp) {
                return Ok(());
            }
        } else {
            log::warn!("suunto: dropping runt dive of {} bytes", blob.len());
        }

        current = marker;
        remaining -= length;
    }

    Ok(())
}

/// Decoder for one reconstructed dive blob.
///
/// Layout: `0x80` marker, five date/time bytes, the sample interval, one
/// reserved byte, then one profile byte per interval (depth in feet).
pub struct SuuntoParser<'b> {
    blob: &'b [u8],
    cache: CacheLevel,
    interval: u32,
    maxdepth_ft: u8,
    nsamples: u32,
}

impl<'b> SuuntoParser<'b> {
    pub fn new(blob: &'b [u8]) -> Result<Self> {
        if blob.len() < HEADER_SIZE {
            return Err(Error::MalformedData("dive shorter than its header"));
        }
        if blob[0] != DIVE_MARKER {
            return Err(Error::MalformedData("dive does not start with its marker"));
        }
        Ok(SuuntoParser {
            blob,
            cache: CacheLevel::Empty,
            interval: 0,
            maxdepth_ft: 0,
            nsamples: 0,
        })
    }

    fn load_header(&mut self) {
        if self.cache >= CacheLevel::HeaderValid {
            return;
        }
        self.interval = u32::from(self.blob[6]).max(1);
        self.cache = CacheLevel::HeaderValid;
    }

    fn load_profile(&mut self) {
        self.load_header();
        if self.cache >= CacheLevel::ProfileValid {
            return;
        }
        let mut maxdepth = 0u8;
        let mut count = 0u32;
        for &b in &self.blob[HEADER_SIZE..] {
            if b == 0xFF {
                continue; // surface marker carries no depth
            }
            maxdepth = maxdepth.max(b);
            count += 1;
        }
        self.maxdepth_ft = maxdepth;
        self.nsamples = count;
        self.cache = CacheLevel::ProfileValid;
    }
}

impl<'b> Parser for SuuntoParser<'b> {
    fn datetime(&mut self) -> Result<NaiveDateTime> {
        let year = 2000 + i32::from(self.blob[1]);
        let month = u32::from(self.blob[2]);
        let day = u32::from(self.blob[3]);
        let hour = u32::from(self.blob[4]);
        let minute = u32::from(self.blob[5]);
        NaiveDate::from_ymd_opt(year, month, day)
            .and_then(|d| d.and_hms_opt(hour, minute, 0))
            .ok_or(Error::MalformedData("invalid date in header"))
    }

    fn field(&mut self, field: Field) -> Result<Option<FieldValue>> {
        self.load_header();
        match field {
            Field::DiveTime => {
                self.load_profile();
                Ok(Some(FieldValue::Time(self.nsamples * self.interval)))
            }
            Field::MaxDepth => {
                self.load_profile();
                Ok(Some(FieldValue::Depth(f64::from(self.maxdepth_ft) * FEET)))
            }
            _ => Ok(None),
        }
    }

    fn samples_foreach(&mut self, callback: &mut dyn FnMut(Sample<'_>)) -> Result<()> {
        self.load_header();
        let mut time_ms = 0u32;
        for (i, &b) in self.blob[HEADER_SIZE..].iter().enumerate() {
            let window = &self.blob[HEADER_SIZE + i..HEADER_SIZE + i + 1];
            if b == 0xFF {
                callback(Sample::Event {
                    kind: crate::types::SampleEventKind::Surface,
                    flags: 0,
                    value: 0,
                });
                callback(Sample::Vendor { kind: 0, data: window });
                continue;
            }
            time_ms += self.interval * 1000;
            callback(Sample::Time(time_ms));
            callback(Sample::Depth(f64::from(b) * FEET));
            callback(Sample::Vendor { kind: 0, data: window });
        }
        self.cache = self.cache.max(CacheLevel::HeaderValid);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Exchange, ReplayTransport};

    fn checksum(bytes: &[u8]) -> u8 {
        bytes.iter().fold(0, |acc, &b| acc ^ b)
    }

    fn read_exchange(address: u8, data: &[u8]) -> Exchange {
        let mut reply = vec![CMD_READ, address, data.len() as u8];
        reply.extend_from_slice(data);
        reply.push(checksum(&reply));
        Exchange::new(vec![CMD_READ, address, data.len() as u8], reply)
    }

    /// One dive: marker, date 2024-06-`day` 10:30, 10 s interval, reserved,
    /// then depth bytes. The day byte keeps fingerprints distinct.
    fn dive_bytes(day: u8, depths: &[u8]) -> Vec<u8> {
        let mut dive = vec![DIVE_MARKER, 24, 6, day, 10, 30, 10, 0];
        dive.extend_from_slice(depths);
        dive
    }

    fn build_memory(dives: &[Vec<u8>]) -> Vec<u8> {
        // Lay dives out oldest-first from the bottom of the ring and finish
        // with the sentinel.
        let mut memory = vec![0u8; SZ_MEMORY];
        let mut p = RB_PROFILE.begin as usize;
        for dive in dives {
            memory[p..p + dive.len()].copy_from_slice(dive);
            p += dive.len();
        }
        memory[p] = EOP_SENTINEL;
        memory
    }

    #[test]
    fn extract_walks_newest_first() {
        let dives = vec![
            dive_bytes(1, &[10, 20, 10]),
            dive_bytes(2, &[30, 40]),
            dive_bytes(3, &[50]),
        ];
        let memory = build_memory(&dives);

        let mut seen = Vec::new();
        extract_dives(&memory, &None, &mut |blob, fp| {
            assert_eq!(blob[0], DIVE_MARKER);
            assert_eq!(fp, &blob[1..5]);
            seen.push(blob.to_vec());
            true
        })
        .unwrap();

        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0], dives[2]);
        assert_eq!(seen[1], dives[1]);
        assert_eq!(seen[2], dives[0]);
    }

    #[test]
    fn extract_stops_at_watermark() {
        let dives = vec![
            dive_bytes(1, &[10]),
            dive_bytes(2, &[20]),
            dive_bytes(3, &[30]),
        ];
        let memory = build_memory(&dives);

        // Watermark = fingerprint of the middle dive.
        let middle_start = RB_PROFILE.begin as usize + dives[0].len();
        let watermark =
            memory[middle_start + FINGERPRINT_OFFSET..middle_start + FINGERPRINT_OFFSET + 4].to_vec();

        let mut count = 0;
        extract_dives(&memory, &Some(watermark), &mut |_, _| {
            count += 1;
            true
        })
        .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn missing_sentinel_is_malformed() {
        let memory = vec![0u8; SZ_MEMORY];
        let err = extract_dives(&memory, &None, &mut |_, _| true).unwrap_err();
        assert!(matches!(err, Error::MalformedData(_)));
    }

    #[test]
    fn read_page_retries_on_bad_checksum() {
        let ctx = Context::new();
        let address = 0x00u8;
        let data = [0x11u8; SZ_ID];

        let good = read_exchange(address, &data);
        let mut corrupt = good.clone();
        *corrupt.reply.last_mut().unwrap() ^= 0xFF;

        let port = ReplayTransport::new([corrupt, good]);
        let device = SuuntoDevice::open(port, &ctx).unwrap();
        assert_eq!(device.id_page, data);
        assert_eq!(device.port.exchanges_left(), 0);
        assert_eq!(device.port.slept_ms, RETRY_DELAY_MS);
    }

    #[test]
    fn parser_decodes_samples() {
        let blob = dive_bytes(1, &[10, 0xFF, 33]);
        let mut parser = SuuntoParser::new(&blob).unwrap();

        assert_eq!(
            parser.datetime().unwrap(),
            NaiveDate::from_ymd_opt(2024, 6, 1)
                .unwrap()
                .and_hms_opt(10, 30, 0)
                .unwrap()
        );

        let mut depths = Vec::new();
        let mut times = Vec::new();
        parser
            .samples_foreach(&mut |sample| match sample {
                Sample::Depth(m) => depths.push(m),
                Sample::Time(ms) => times.push(ms),
                _ => {}
            })
            .unwrap();
        assert_eq!(times, vec![10_000, 20_000]);
        assert!((depths[0] - 10.0 * FEET).abs() < 1e-9);
        assert!((depths[1] - 33.0 * FEET).abs() < 1e-9);

        match parser.field(Field::MaxDepth).unwrap() {
            Some(FieldValue::Depth(m)) => assert!((m - 33.0 * FEET).abs() < 1e-9),
            other => panic!("unexpected field value {other:?}"),
        }
    }
}
