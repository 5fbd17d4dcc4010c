//! Oceanic family.
//!
//! Two distinct ringbuffers: a logbook of fixed-size per-dive entries and a
//! profile ring of variable-size sample streams. Each logbook entry carries
//! the page range of its profile; a corrupt end pointer is recovered from
//! the neighbouring dive. Date formats vary per model, including one that
//! stores only the final digit of the year.

use chrono::{Datelike, NaiveDate, NaiveDateTime};

use crate::codec::{is_filled_with, read_u16_le, read_u32_be};
use crate::context::Context;
use crate::device::{self, Device, DiveCallback, Progress};
use crate::error::{Error, Result};
use crate::parser::{CacheLevel, Parser, FEET, PSI, BAR};
use crate::ringbuf::{Direction, Overlap, RingLayout, RingStream};
use crate::transport::{LineConfig, Purge, Timeout, Transport};
use crate::types::{
    DiveMode, Event, Field, FieldValue, GasMix, Sample, SampleEventKind,
};

pub const PAGESIZE: u32 = 16;
const SZ_ENTRY: u32 = 16;
const SZ_SAMPLE: usize = 8;

const ACK: u8 = 0x5A;
const NAK: u8 = 0xA5;
const CMD_READ: u8 = 0xB1;

const MAX_RETRIES: u32 = 4;
const RETRY_DELAY_MS: u64 = 100;

const CF_DEVINFO: u32 = 0x0000;
const CF_POINTERS: u32 = 0x0010;

pub const FINGERPRINT_SIZE: usize = 8;

/// How a model packs its date bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateFormat {
    /// Only the final digit of the year is stored; the decade is folded in
    /// from the host clock.
    YearDigit,
    /// The full year, its bits spread over two bytes.
    Packed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OceanicModel {
    Atom2,
    Veo250,
    Geo20,
    F10,
}

/// Per-model layout descriptor: data, not code.
#[derive(Debug, Clone, Copy)]
pub struct OceanicLayout {
    pub rb_logbook: RingLayout,
    pub rb_profile: RingLayout,
    pub date_format: DateFormat,
    pub freedive: bool,
}

impl OceanicModel {
    pub fn layout(&self) -> OceanicLayout {
        match self {
            OceanicModel::Atom2 => OceanicLayout {
                rb_logbook: RingLayout::new(0x0240, 0x0A40),
                rb_profile: RingLayout::new(0x0A40, 0xFFF0),
                date_format: DateFormat::Packed,
                freedive: false,
            },
            OceanicModel::Veo250 | OceanicModel::Geo20 => OceanicLayout {
                rb_logbook: RingLayout::new(0x0400, 0x0600),
                rb_profile: RingLayout::new(0x0600, 0x8000),
                date_format: DateFormat::YearDigit,
                freedive: false,
            },
            OceanicModel::F10 => OceanicLayout {
                rb_logbook: RingLayout::new(0x0100, 0x0200),
                rb_profile: RingLayout::new(0x0200, 0x1000),
                date_format: DateFormat::YearDigit,
                freedive: true,
            },
        }
    }

    fn from_id(id: u16) -> Self {
        match id {
            0x4342 => OceanicModel::Atom2,
            0x4151 => OceanicModel::Veo250,
            0x4653 => OceanicModel::Geo20,
            0x4746 => OceanicModel::F10,
            _ => OceanicModel::Atom2,
        }
    }
}

pub struct OceanicDevice<'a, T: Transport> {
    port: T,
    ctx: &'a Context,
    fingerprint: Option<Vec<u8>>,
    id_page: [u8; PAGESIZE as usize],
    model: OceanicModel,
    layout: OceanicLayout,
}

impl<'a, T: Transport> OceanicDevice<'a, T> {
    pub fn open(mut port: T, ctx: &'a Context) -> Result<Self> {
        port.configure(&LineConfig::eight_n_one(38400))?;
        port.set_timeout(Timeout::Millis(3000))?;
        port.purge(Purge::Both)?;

        let mut device = OceanicDevice {
            port,
            ctx,
            fingerprint: None,
            id_page: [0; PAGESIZE as usize],
            model: OceanicModel::Atom2,
            layout: OceanicModel::Atom2.layout(),
        };

        let mut id = [0u8; PAGESIZE as usize];
        device.read_page(CF_DEVINFO, &mut id)?;
        device.id_page = id;
        device.model = OceanicModel::from_id(read_u16_le(&id, 4));
        device.layout = device.model.layout();
        Ok(device)
    }

    pub fn model(&self) -> OceanicModel {
        self.model
    }

    fn read_page(&mut self, address: u32, buf: &mut [u8]) -> Result<()> {
        read_page_raw(&mut self.port, self.ctx, address, buf)
    }

    fn read_pointers(&mut self) -> Result<Pointers> {
        let mut page = [0u8; PAGESIZE as usize];
        self.read_page(CF_POINTERS, &mut page)?;
        Ok(Pointers {
            logbook_first: u32::from(read_u16_le(&page, 0)),
            logbook_last: u32::from(read_u16_le(&page, 2)),
            profile_first: u32::from(read_u16_le(&page, 4)),
            profile_last: u32::from(read_u16_le(&page, 6)),
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct Pointers {
    logbook_first: u32,
    logbook_last: u32,
    profile_first: u32,
    profile_last: u32,
}

/// Page range of one dive's profile, decoded from its logbook entry.
fn profile_range(entry: &[u8]) -> (u16, u16) {
    (read_u16_le(entry, 4), read_u16_le(entry, 6))
}

/// Byte bounds of one dive's profile. A corrupt end pointer is guessed from
/// the next newer dive's start, or the overall end of profile.
fn profile_bounds(
    layout: &OceanicLayout,
    entry: &[u8],
    previous_begin: u32,
) -> Result<(u32, u32)> {
    let (begin_page, end_page) = profile_range(entry);
    let begin = layout.rb_profile.begin + u32::from(begin_page) * PAGESIZE;
    let end = if end_page == 0xFFFF {
        log::warn!("oceanic: corrupt profile end pointer, guessing");
        previous_begin
    } else {
        layout.rb_profile.begin + u32::from(end_page) * PAGESIZE
    };
    if !layout.rb_profile.contains(begin)
        || (!layout.rb_profile.contains(end) && end != layout.rb_profile.end)
    {
        return Err(Error::MalformedData("profile range out of ring"));
    }
    Ok((begin, end))
}

impl<'a, T: Transport> Device for OceanicDevice<'a, T> {
    fn set_fingerprint(&mut self, fingerprint: &[u8]) {
        device::store_fingerprint(&mut self.fingerprint, fingerprint);
    }

    fn foreach(&mut self, callback: &mut DiveCallback<'_>) -> Result<()> {
        self.ctx.emit(Event::Vendor {
            data: &self.id_page,
        });
        self.ctx.emit(Event::DeviceInfo {
            model: u32::from(read_u16_le(&self.id_page, 4)),
            firmware: u32::from(read_u16_le(&self.id_page, 6)),
            serial: read_u32_be(&self.id_page, 0),
        });

        let layout = self.layout;
        let pointers = self.read_pointers()?;
        if !layout.rb_logbook.contains(pointers.logbook_last)
            && pointers.logbook_last != layout.rb_logbook.end
        {
            return Err(Error::MalformedData("logbook pointer out of range"));
        }
        if !layout.rb_profile.contains(pointers.profile_first)
            || (!layout.rb_profile.contains(pointers.profile_last)
                && pointers.profile_last != layout.rb_profile.end)
        {
            return Err(Error::MalformedData("profile pointer out of range"));
        }

        let logbook_used = layout.rb_logbook.distance(
            pointers.logbook_first,
            pointers.logbook_last,
            Overlap::Empty,
        );
        let nentries = logbook_used / SZ_ENTRY;
        let mut progress = Progress::new(self.ctx, logbook_used);

        // Walk the logbook backwards: one entry per stream read.
        let mut entries: Vec<[u8; SZ_ENTRY as usize]> = Vec::new();
        {
            let port = &mut self.port;
            let ctx = self.ctx;
            let mut stream = RingStream::new(
                |addr, buf: &mut [u8]| {
                    read_page_raw(port, ctx, addr, buf)
                },
                layout.rb_logbook,
                PAGESIZE,
                pointers.logbook_last,
                Direction::Backward,
            )?;
            for _ in 0..nentries {
                let mut entry = [0u8; SZ_ENTRY as usize];
                stream.read(&mut entry, &mut progress)?;
                if is_filled_with(&entry, 0xFF) {
                    log::warn!("oceanic: uninitialised logbook entry, stopping walk");
                    break;
                }
                entries.push(entry);
            }
        }

        // Profile space still available for reconstruction; dives whose
        // profile has been overwritten get a header-only blob.
        let mut capacity_remaining = layout.rb_profile.size();
        // The end address the next older dive may borrow when its own end
        // pointer is corrupt.
        let mut previous_begin = pointers.profile_last;

        for entry in &entries {
            let fp = &entry[..FINGERPRINT_SIZE];
            if device::fingerprint_matches(&self.fingerprint, fp) {
                break;
            }

            let (begin, end) = profile_bounds(&layout, entry, previous_begin)?;
            let length = layout.rb_profile.distance(begin, end, Overlap::Empty);
            let mut blob = entry.to_vec();

            if length > 0 && length <= capacity_remaining {
                capacity_remaining -= length;
                progress.grow_maximum(progress.current() + length);

                let mut profile = vec![0u8; length as usize];
                {
                    let port = &mut self.port;
                    let ctx = self.ctx;
                    let mut stream = RingStream::new(
                        |addr, buf: &mut [u8]| read_page_raw(port, ctx, addr, buf),
                        layout.rb_profile,
                        PAGESIZE,
                        begin,
                        Direction::Forward,
                    )?;
                    stream.read(&mut profile, &mut progress)?;
                }
                blob.extend_from_slice(&profile);
            } else if length > capacity_remaining {
                log::warn!("oceanic: profile overwritten, emitting header only");
            }

            previous_begin = begin;

            let fp = &blob[..FINGERPRINT_SIZE];
            if !callback(&blob, fp) {
                return Ok(());
            }
        }

        progress.finish();
        Ok(())
    }

    fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<()> {
        if address % PAGESIZE != 0 || buf.len() != PAGESIZE as usize {
            return Err(Error::InvalidArgs);
        }
        self.read_page(address, buf)
    }

    fn dump(&mut self) -> Result<Vec<u8>> {
        let size = self.layout.rb_profile.end;
        let mut progress = Progress::new(self.ctx, size);
        let mut memory = vec![0u8; size as usize];
        for offset in (0..size).step_by(PAGESIZE as usize) {
            let page = offset as usize;
            self.read_page(offset, &mut memory[page..page + PAGESIZE as usize])?;
            progress.add(PAGESIZE);
        }
        progress.finish();
        Ok(memory)
    }
}

/// Reconstruct dives from a full memory image, newest first, honoring the
/// watermark. Used by the dump-based diagnostic flow; matches what `foreach`
/// produces for the same memory.
pub fn extract_dives(
    memory: &[u8],
    model: OceanicModel,
    fingerprint: &Option<Vec<u8>>,
    callback: &mut DiveCallback<'_>,
) -> Result<()> {
    let layout = model.layout();
    if memory.len() < layout.rb_profile.end as usize {
        return Err(Error::MalformedData("memory image too short"));
    }

    let pointers = Pointers {
        logbook_first: u32::from(read_u16_le(memory, CF_POINTERS as usize)),
        logbook_last: u32::from(read_u16_le(memory, CF_POINTERS as usize + 2)),
        profile_first: u32::from(read_u16_le(memory, CF_POINTERS as usize + 4)),
        profile_last: u32::from(read_u16_le(memory, CF_POINTERS as usize + 6)),
    };
    if !layout.rb_logbook.contains(pointers.logbook_last)
        && pointers.logbook_last != layout.rb_logbook.end
    {
        return Err(Error::MalformedData("logbook pointer out of range"));
    }
    if !layout.rb_profile.contains(pointers.profile_first)
        || (!layout.rb_profile.contains(pointers.profile_last)
            && pointers.profile_last != layout.rb_profile.end)
    {
        return Err(Error::MalformedData("profile pointer out of range"));
    }

    let logbook_used = layout.rb_logbook.distance(
        pointers.logbook_first,
        pointers.logbook_last,
        Overlap::Empty,
    );
    let nentries = logbook_used / SZ_ENTRY;

    let mut capacity_remaining = layout.rb_profile.size();
    let mut previous_begin = pointers.profile_last;
    let mut current = if pointers.logbook_last == layout.rb_logbook.end {
        layout.rb_logbook.begin
    } else {
        pointers.logbook_last
    };

    for _ in 0..nentries {
        let start = layout.rb_logbook.decrement(current, SZ_ENTRY) as usize;
        let entry = &memory[start..start + SZ_ENTRY as usize];
        current = start as u32;

        if is_filled_with(entry, 0xFF) {
            log::warn!("oceanic: uninitialised logbook entry, stopping walk");
            break;
        }

        let fp = &entry[..FINGERPRINT_SIZE];
        if device::fingerprint_matches(fingerprint, fp) {
            break;
        }

        let (begin, end) = profile_bounds(&layout, entry, previous_begin)?;
        let length = layout.rb_profile.distance(begin, end, Overlap::Empty);
        let mut blob = entry.to_vec();

        if length > 0 && length <= capacity_remaining {
            capacity_remaining -= length;
            // Copy the profile out of the ring, handling wrap.
            if begin < end {
                blob.extend_from_slice(&memory[begin as usize..end as usize]);
            } else {
                blob.extend_from_slice(&memory[begin as usize..layout.rb_profile.end as usize]);
                blob.extend_from_slice(&memory[layout.rb_profile.begin as usize..end as usize]);
            }
        } else if length > capacity_remaining {
            log::warn!("oceanic: profile overwritten, emitting header only");
        }

        previous_begin = begin;

        let fp = &blob[..FINGERPRINT_SIZE];
        if !callback(&blob, fp) {
            return Ok(());
        }
    }

    Ok(())
}

/// One page read with ordered reply validation: ACK/NAK byte, payload,
/// 8-bit additive checksum. A free function so `RingStream` closures can
/// call it while `self` is partially borrowed.
fn read_page_raw<T: Transport>(
    port: &mut T,
    ctx: &Context,
    address: u32,
    buf: &mut [u8],
) -> Result<()> {
    let mut last = Error::Timeout;
    for attempt in 0..MAX_RETRIES {
        ctx.check_cancelled()?;
        if attempt > 0 {
            port.sleep(RETRY_DELAY_MS);
            port.purge(Purge::Input)?;
        }
        let result = (|| {
            let hi = (address >> 8) as u8;
            let lo = (address & 0xFF) as u8;
            let command = [CMD_READ, hi, lo, CMD_READ.wrapping_add(hi).wrapping_add(lo)];
            port.write_all(&command)?;

            let mut status = [0u8; 1];
            port.read_exact(&mut status)?;
            match status[0] {
                ACK => {}
                NAK => return Err(Error::Protocol("device NAK")),
                _ => return Err(Error::Protocol("bad status byte")),
            }
            port.read_exact(buf)?;
            let mut checksum = [0u8; 1];
            port.read_exact(&mut checksum)?;
            let expected = buf.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
            if checksum[0] != expected {
                return Err(Error::Protocol("bad checksum"));
            }
            Ok(())
        })();
        match result {
            Ok(()) => return Ok(()),
            Err(e) if e.is_retryable() => last = e,
            Err(e) => return Err(e),
        }
    }
    Err(last)
}

// ── Parser ──

const TYPE_SAMPLE: u8 = 0x01;
const TYPE_TANK_SWITCH: u8 = 0xAA;
const TYPE_SURFACE: u8 = 0xBB;

pub struct OceanicParser<'b> {
    blob: &'b [u8],
    layout: OceanicLayout,
    reference_year: i32,
    cache: CacheLevel,
    ngasmixes: usize,
    mixes: [u8; 2],
}

impl<'b> OceanicParser<'b> {
    pub fn new(blob: &'b [u8], model: OceanicModel) -> Result<Self> {
        if blob.len() < SZ_ENTRY as usize {
            return Err(Error::MalformedData("blob shorter than logbook entry"));
        }
        Ok(OceanicParser {
            blob,
            layout: model.layout(),
            reference_year: chrono::Utc::now().year(),
            cache: CacheLevel::Empty,
            ngasmixes: 0,
            mixes: [0; 2],
        })
    }

    /// Pin the host-clock year the year-digit decade fold consults. Without
    /// this the fold trusts the host clock, wrong as it may be.
    pub fn with_reference_year(mut self, year: i32) -> Self {
        self.reference_year = year;
        self
    }

    fn load_header(&mut self) {
        if self.cache >= CacheLevel::HeaderValid {
            return;
        }
        let mut n = 0;
        for i in 0..2 {
            let o2 = self.blob[12 + i];
            if o2 != 0 && o2 <= 100 {
                self.mixes[n] = o2;
                n += 1;
            }
        }
        if n == 0 {
            self.mixes[0] = 21;
            n = 1;
        }
        self.ngasmixes = n;
        self.cache = CacheLevel::HeaderValid;
    }

    fn fold_year(&self, digit: u8) -> i32 {
        let decade = self.reference_year / 10 * 10;
        let mut year = decade + i32::from(digit);
        if year > self.reference_year + 1 {
            year -= 10;
            log::warn!("oceanic: folded year digit {digit} into previous decade ({year})");
        }
        year
    }

    fn profile(&self) -> &'b [u8] {
        &self.blob[SZ_ENTRY as usize..]
    }

    fn divetime_minutes(&self) -> u32 {
        u32::from(read_u16_le(self.blob, 10))
    }
}

impl<'b> Parser for OceanicParser<'b> {
    fn datetime(&mut self) -> Result<NaiveDateTime> {
        let b = self.blob;
        let (year, month, day, hour, minute) = match self.layout.date_format {
            DateFormat::YearDigit => {
                let year = self.fold_year(b[0] & 0x0F);
                let month = u32::from(b[0] >> 4);
                let day = u32::from(b[1]);
                (year, month, day, u32::from(b[2]), u32::from(b[3]))
            }
            DateFormat::Packed => {
                // Year bits come from two bytes: low nibble of b0 shifted
                // together with the top three bits of b1.
                let year = 1980
                    + i32::from(b[0] >> 4)
                    + (i32::from(b[1] >> 5) << 4);
                let month = u32::from(b[0] & 0x0F);
                let day = u32::from(b[1] & 0x1F);
                (year, month, day, u32::from(b[2]), u32::from(b[3]))
            }
        };
        NaiveDate::from_ymd_opt(year, month, day)
            .and_then(|d| d.and_hms_opt(hour, minute, 0))
            .ok_or(Error::MalformedData("invalid date in header"))
    }

    fn field(&mut self, field: Field) -> Result<Option<FieldValue>> {
        self.load_header();
        match field {
            Field::DiveTime => Ok(Some(FieldValue::Time(self.divetime_minutes() * 60))),
            Field::MaxDepth => Ok(Some(FieldValue::Depth(
                f64::from(read_u16_le(self.blob, 8)) / 16.0 * FEET,
            ))),
            Field::GasMixCount => Ok(Some(FieldValue::Count(self.ngasmixes as u32))),
            Field::GasMix(i) => {
                if i < self.ngasmixes {
                    Ok(Some(FieldValue::GasMix(GasMix::from_percent(
                        self.mixes[i],
                        0,
                    ))))
                } else {
                    Ok(None)
                }
            }
            Field::DiveMode => Ok(Some(FieldValue::Mode(if self.layout.freedive {
                DiveMode::Freedive
            } else {
                DiveMode::OpenCircuit
            }))),
            _ => Ok(None),
        }
    }

    fn samples_foreach(&mut self, callback: &mut dyn FnMut(Sample<'_>)) -> Result<()> {
        self.load_header();
        if self.layout.freedive {
            return self.freedive_foreach(callback);
        }

        let profile = self.profile();
        let interval_ms = 2000u32;
        let mut time_ms = 0u32;
        let mut offset = 0usize;

        while offset + SZ_SAMPLE <= profile.len() {
            match profile[offset] {
                TYPE_SURFACE => {
                    // Surface-interval records are a full page.
                    let size = PAGESIZE as usize;
                    if offset + size > profile.len() {
                        return Err(Error::MalformedData("truncated surface record"));
                    }
                    let window = &profile[offset..offset + size];
                    callback(Sample::Event {
                        kind: SampleEventKind::Surface,
                        flags: 0,
                        value: u32::from(read_u16_le(window, 2)),
                    });
                    callback(Sample::Vendor { kind: u32::from(TYPE_SURFACE), data: window });
                    offset += size;
                }
                TYPE_TANK_SWITCH => {
                    let window = &profile[offset..offset + SZ_SAMPLE];
                    let mix = usize::from(window[1]);
                    if mix >= self.ngasmixes {
                        return Err(Error::MalformedData("tank switch to unknown mix"));
                    }
                    callback(Sample::GasSwitch(mix));
                    callback(Sample::Vendor { kind: u32::from(TYPE_TANK_SWITCH), data: window });
                    offset += SZ_SAMPLE;
                }
                TYPE_SAMPLE => {
                    let window = &profile[offset..offset + SZ_SAMPLE];
                    time_ms += interval_ms;
                    callback(Sample::Time(time_ms));
                    callback(Sample::Depth(
                        f64::from(read_u16_le(window, 1)) / 16.0 * FEET,
                    ));
                    callback(Sample::Temperature(
                        (f64::from(window[3]) - 32.0) * 5.0 / 9.0,
                    ));
                    let tank_psi = read_u16_le(window, 4);
                    if tank_psi != 0 {
                        callback(Sample::Pressure {
                            tank: 0,
                            bar: f64::from(tank_psi) * PSI / BAR,
                        });
                    }
                    callback(Sample::Vendor { kind: u32::from(TYPE_SAMPLE), data: window });
                    offset += SZ_SAMPLE;
                }
                other => {
                    log::warn!("oceanic: skipping unknown sample type {other:#04x}");
                    offset += SZ_SAMPLE;
                }
            }
        }

        self.cache = CacheLevel::ProfileValid;
        Ok(())
    }
}

impl<'b> OceanicParser<'b> {
    /// Freedive models pack several short apneas into one logbook entry.
    /// Each ancillary record is four bytes: duration (u16 LE, s) and max
    /// depth (u16 LE, 1/16 ft). The logbook's sample count must match.
    fn freedive_foreach(&mut self, callback: &mut dyn FnMut(Sample<'_>)) -> Result<()> {
        let profile = self.profile();
        let expected = self.divetime_minutes() as usize; // apnea count for F-series
        if profile.len() / 4 < expected {
            return Err(Error::MalformedData(
                "freedive count does not match ancillary area",
            ));
        }

        let mut time_ms = 0u32;
        for i in 0..expected {
            let window = &profile[i * 4..i * 4 + 4];
            let duration_s = u32::from(read_u16_le(window, 0));
            let depth = f64::from(read_u16_le(window, 2)) / 16.0 * FEET;

            time_ms += 1000; // surface gap between apneas
            callback(Sample::Time(time_ms));
            callback(Sample::Depth(0.0));
            time_ms += duration_s * 1000 / 2;
            callback(Sample::Time(time_ms));
            callback(Sample::Depth(depth));
            time_ms += duration_s * 1000 - duration_s * 1000 / 2;
            callback(Sample::Time(time_ms));
            callback(Sample::Depth(0.0));
            callback(Sample::Vendor { kind: 0, data: window });
        }

        self.cache = CacheLevel::ProfileValid;
        Ok(())
    }
}
