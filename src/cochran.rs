//! Cochran Commander family.
//!
//! The fastest serial link in the fleet (806400 baud) behind the quirkiest
//! wake-up: the device listens only after a break pulse with DTR raised, and
//! needs a long settling pause before it will answer. Bulk reads are raw,
//! without checksums. Dives are indexed by number through a logbook of
//! fixed-size entries whose profile pointers are sometimes corrupt; recovery
//! is an explicit policy, not a silent guess.

use chrono::{NaiveDate, NaiveDateTime};

use crate::codec::{is_filled_with, read_u16_le, read_u32_le};
use crate::context::Context;
use crate::device::{self, Device, DiveCallback, Progress};
use crate::error::{Error, Result};
use crate::parser::{CacheLevel, Parser, FEET};
use crate::ringbuf::{Direction, Overlap, RingLayout, RingStream};
use crate::transport::{FlowControl, LineConfig, Parity, Purge, StopBits, Timeout, Transport};
use crate::types::{Event, Field, FieldValue, Sample, SampleEventKind};

const BAUD: u32 = 806400;
/// The device ignores the host until this settling pause has passed.
const SETTLE_MS: u64 = 800;

const CMD_ID: u8 = 0x05;
const CMD_READ: u8 = 0x15;

const SZ_ID: usize = 64;
pub const SZ_ENTRY: usize = 32;
const SZ_PAGE: u32 = 0x100;
pub const SZ_MEMORY: usize = 0x10000;

const CF_CONFIG: u32 = 0x0000;
pub const RB_LOGBOOK: RingLayout = RingLayout::new(0x1000, 0x2000);
pub const RB_PROFILE: RingLayout = RingLayout::new(0x2000, 0x10000);

const MAX_RETRIES: u32 = 4;
const RETRY_DELAY_MS: u64 = 100;

/// A profile end pointer the device never wrote.
const CORRUPT_END: u32 = 0xFFFF_FFFF;

pub const FINGERPRINT_SIZE: usize = 6;

/// What to do with a dive whose on-device profile end pointer is corrupt.
/// The guessing heuristic mirrors field observations and may be wrong for
/// corner cases, so it can be switched off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecoveryPolicy {
    /// Surface `MalformedData` instead of guessing.
    Strict,
    /// Borrow the end from the next newer dive's start, or the overall end
    /// of profile for the newest dive.
    #[default]
    GuessFromNeighbors,
}

pub struct CochranDevice<'a, T: Transport> {
    port: T,
    ctx: &'a Context,
    fingerprint: Option<Vec<u8>>,
    recovery: RecoveryPolicy,
    id_block: [u8; SZ_ID],
}

impl<'a, T: Transport> CochranDevice<'a, T> {
    pub fn open(mut port: T, ctx: &'a Context) -> Result<Self> {
        port.configure(&LineConfig {
            baud: BAUD,
            data_bits: 8,
            parity: Parity::None,
            stop_bits: StopBits::Two,
            flow: FlowControl::None,
        })?;
        port.set_timeout(Timeout::Millis(2000))?;

        // Wake the device: break pulse with DTR raised, then settle.
        port.set_dtr(true)?;
        port.set_break(true)?;
        port.sleep(100);
        port.set_break(false)?;
        port.sleep(SETTLE_MS);
        port.purge(Purge::Both)?;

        let mut device = CochranDevice {
            port,
            ctx,
            fingerprint: None,
            recovery: RecoveryPolicy::default(),
            id_block: [0; SZ_ID],
        };
        let mut id = [0u8; SZ_ID];
        device.transfer(&[CMD_ID], &mut id)?;
        device.id_block = id;
        Ok(device)
    }

    pub fn set_recovery_policy(&mut self, policy: RecoveryPolicy) {
        self.recovery = policy;
    }

    /// Raw command/response: the reply has no framing, so only timeouts are
    /// retryable.
    fn transfer(&mut self, command: &[u8], response: &mut [u8]) -> Result<()> {
        let mut last = Error::Timeout;
        for attempt in 0..MAX_RETRIES {
            self.ctx.check_cancelled()?;
            if attempt > 0 {
                self.port.sleep(RETRY_DELAY_MS);
                self.port.purge(Purge::Input)?;
            }
            let result = self
                .port
                .write_all(command)
                .and_then(|()| self.port.read_exact(response));
            match result {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() => last = e,
                Err(e) => return Err(e),
            }
        }
        Err(last)
    }

    fn read_memory(&mut self, address: u32, buf: &mut [u8]) -> Result<()> {
        read_memory_raw(&mut self.port, self.ctx, address, buf)
    }

    fn read_config(&mut self) -> Result<(u16, u32)> {
        let mut config = [0u8; 16];
        self.read_memory(CF_CONFIG, &mut config)?;
        let dive_count = read_u16_le(&config, 4);
        let profile_end = read_u32_le(&config, 6);
        if !RB_PROFILE.contains(profile_end) && profile_end != RB_PROFILE.end {
            return Err(Error::MalformedData("end-of-profile pointer out of range"));
        }
        Ok((dive_count, profile_end))
    }

}

fn entry_address(number: u32) -> u32 {
    let max_entries = RB_LOGBOOK.size() / SZ_ENTRY as u32;
    RB_LOGBOOK.begin + (number % max_entries) * SZ_ENTRY as u32
}

/// Decode a logbook entry's profile range, applying the recovery policy to
/// a corrupt end pointer.
fn profile_bounds(
    entry: &[u8],
    recovery: RecoveryPolicy,
    previous_begin: u32,
) -> Result<(u32, u32)> {
    let begin = read_u32_le(entry, 8);
    let mut end = read_u32_le(entry, 12);
    if end == CORRUPT_END {
        match recovery {
            RecoveryPolicy::Strict => {
                return Err(Error::MalformedData("corrupt profile end pointer"));
            }
            RecoveryPolicy::GuessFromNeighbors => {
                log::warn!("cochran: corrupt profile end pointer, guessing");
                end = previous_begin;
            }
        }
    }
    if !RB_PROFILE.contains(begin) || (!RB_PROFILE.contains(end) && end != RB_PROFILE.end) {
        return Err(Error::MalformedData("profile range out of ring"));
    }
    Ok((begin, end))
}

fn read_memory_raw<T: Transport>(
    port: &mut T,
    ctx: &Context,
    address: u32,
    buf: &mut [u8],
) -> Result<()> {
    let mut command = vec![CMD_READ];
    command.extend_from_slice(&address.to_le_bytes());
    command.extend_from_slice(&(buf.len() as u16).to_le_bytes());

    let mut last = Error::Timeout;
    for attempt in 0..MAX_RETRIES {
        ctx.check_cancelled()?;
        if attempt > 0 {
            port.sleep(RETRY_DELAY_MS);
            port.purge(Purge::Input)?;
        }
        let result = port
            .write_all(&command)
            .and_then(|()| port.read_exact(buf));
        match result {
            Ok(()) => return Ok(()),
            Err(e) if e.is_retryable() => last = e,
            Err(e) => return Err(e),
        }
    }
    Err(last)
}

impl<'a, T: Transport> Device for CochranDevice<'a, T> {
    fn set_fingerprint(&mut self, fingerprint: &[u8]) {
        device::store_fingerprint(&mut self.fingerprint, fingerprint);
    }

    fn foreach(&mut self, callback: &mut DiveCallback<'_>) -> Result<()> {
        self.ctx.emit(Event::Vendor {
            data: &self.id_block,
        });
        self.ctx.emit(Event::DeviceInfo {
            model: u32::from(self.id_block[8]),
            firmware: u32::from(self.id_block[9]),
            serial: read_u32_le(&self.id_block, 0),
        });

        let (dive_count, profile_end) = self.read_config()?;
        let max_entries = (RB_LOGBOOK.size() / SZ_ENTRY as u32) as u16;
        let navailable = dive_count.min(max_entries);

        let mut progress = Progress::new(
            self.ctx,
            u32::from(navailable) * SZ_ENTRY as u32,
        );

        let mut capacity_remaining = RB_PROFILE.size();
        let mut previous_begin = profile_end;

        // Newest dive number first.
        for i in 0..navailable {
            let number = u32::from(dive_count) - 1 - u32::from(i);
            let mut entry = [0u8; SZ_ENTRY];
            self.read_memory(entry_address(number), &mut entry)?;
            progress.add(SZ_ENTRY as u32);

            if is_filled_with(&entry, 0xFF) {
                log::warn!("cochran: uninitialised logbook entry, stopping walk");
                break;
            }

            let fp = &entry[..FINGERPRINT_SIZE];
            if device::fingerprint_matches(&self.fingerprint, fp) {
                break;
            }

            let (begin, end) = profile_bounds(&entry, self.recovery, previous_begin)?;
            let length = RB_PROFILE.distance(begin, end, Overlap::Empty);
            let mut blob = entry.to_vec();

            if length > 0 && length <= capacity_remaining {
                capacity_remaining -= length;
                // Paged reads round up to whole pages.
                let padded = length.div_ceil(SZ_PAGE) * SZ_PAGE;
                progress.grow_maximum(progress.current() + padded);

                let mut profile = vec![0u8; length as usize];
                {
                    let port = &mut self.port;
                    let ctx = self.ctx;
                    let mut stream = RingStream::new(
                        |addr, buf: &mut [u8]| read_memory_raw(port, ctx, addr, buf),
                        RB_PROFILE,
                        SZ_PAGE,
                        begin,
                        Direction::Forward,
                    )?;
                    stream.read(&mut profile, &mut progress)?;
                }
                blob.extend_from_slice(&profile);
            } else if length > capacity_remaining {
                log::warn!("cochran: profile overwritten, emitting header only");
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
        if buf.len() > u16::MAX as usize {
            return Err(Error::InvalidArgs);
        }
        self.read_memory(address, buf)
    }

    fn dump(&mut self) -> Result<Vec<u8>> {
        let mut progress = Progress::new(self.ctx, SZ_MEMORY as u32);
        let mut memory = vec![0u8; SZ_MEMORY];
        for offset in (0..SZ_MEMORY).step_by(SZ_PAGE as usize) {
            self.read_memory(offset as u32, &mut memory[offset..offset + SZ_PAGE as usize])?;
            progress.add(SZ_PAGE);
        }
        progress.finish();
        Ok(memory)
    }
}

/// Reconstruct dives from a full memory image, newest first, honoring the
/// watermark and the recovery policy. Used by the dump-based diagnostic
/// flow; matches what `foreach` produces for the same memory.
pub fn extract_dives(
    memory: &[u8],
    fingerprint: &Option<Vec<u8>>,
    recovery: RecoveryPolicy,
    callback: &mut DiveCallback<'_>,
) -> Result<()> {
    if memory.len() < SZ_MEMORY {
        return Err(Error::MalformedData("memory image too short"));
    }

    let dive_count = read_u16_le(memory, 4);
    let profile_end = read_u32_le(memory, 6);
    if !RB_PROFILE.contains(profile_end) && profile_end != RB_PROFILE.end {
        return Err(Error::MalformedData("end-of-profile pointer out of range"));
    }

    let max_entries = (RB_LOGBOOK.size() / SZ_ENTRY as u32) as u16;
    let navailable = dive_count.min(max_entries);

    let mut capacity_remaining = RB_PROFILE.size();
    let mut previous_begin = profile_end;

    for i in 0..navailable {
        let number = u32::from(dive_count) - 1 - u32::from(i);
        let address = entry_address(number) as usize;
        let entry = &memory[address..address + SZ_ENTRY];

        if is_filled_with(entry, 0xFF) {
            log::warn!("cochran: uninitialised logbook entry, stopping walk");
            break;
        }

        let fp = &entry[..FINGERPRINT_SIZE];
        if device::fingerprint_matches(fingerprint, fp) {
            break;
        }

        let (begin, end) = profile_bounds(entry, recovery, previous_begin)?;
        let length = RB_PROFILE.distance(begin, end, Overlap::Empty);
        let mut blob = entry.to_vec();

        if length > 0 && length <= capacity_remaining {
            capacity_remaining -= length;
            // Copy the profile out of the ring, handling wrap.
            if begin < end {
                blob.extend_from_slice(&memory[begin as usize..end as usize]);
            } else {
                blob.extend_from_slice(&memory[begin as usize..RB_PROFILE.end as usize]);
                blob.extend_from_slice(&memory[RB_PROFILE.begin as usize..end as usize]);
            }
        } else if length > capacity_remaining {
            log::warn!("cochran: profile overwritten, emitting header only");
        }

        previous_begin = begin;

        let fp = &blob[..FINGERPRINT_SIZE];
        if !callback(&blob, fp) {
            return Ok(());
        }
    }

    Ok(())
}

// ── Parser ──

/// Parser for one `entry || profile` blob.
///
/// The entry holds six plain date bytes (year-2000, month, day, hour,
/// minute, second), the profile pointers, max depth in 1/4 ft (u16 LE) and
/// the dive time in seconds (u16 LE). Profile samples are two bytes:
/// depth in feet, then alternately a temperature (°F) or an event byte.
pub struct CochranParser<'b> {
    blob: &'b [u8],
    cache: CacheLevel,
}

impl<'b> CochranParser<'b> {
    pub fn new(blob: &'b [u8]) -> Result<Self> {
        if blob.len() < SZ_ENTRY {
            return Err(Error::MalformedData("blob shorter than logbook entry"));
        }
        Ok(CochranParser {
            blob,
            cache: CacheLevel::Empty,
        })
    }

    fn profile(&self) -> &'b [u8] {
        &self.blob[SZ_ENTRY..]
    }
}

impl<'b> Parser for CochranParser<'b> {
    fn datetime(&mut self) -> Result<NaiveDateTime> {
        let b = self.blob;
        NaiveDate::from_ymd_opt(2000 + i32::from(b[0]), u32::from(b[1]), u32::from(b[2]))
            .and_then(|d| d.and_hms_opt(u32::from(b[3]), u32::from(b[4]), u32::from(b[5])))
            .ok_or(Error::MalformedData("invalid date in header"))
    }

    fn field(&mut self, field: Field) -> Result<Option<FieldValue>> {
        self.cache = self.cache.max(CacheLevel::HeaderValid);
        match field {
            Field::DiveTime => Ok(Some(FieldValue::Time(u32::from(read_u16_le(
                self.blob, 18,
            ))))),
            Field::MaxDepth => Ok(Some(FieldValue::Depth(
                f64::from(read_u16_le(self.blob, 16)) / 4.0 * FEET,
            ))),
            _ => Ok(None),
        }
    }

    fn samples_foreach(&mut self, callback: &mut dyn FnMut(Sample<'_>)) -> Result<()> {
        let profile = self.profile();
        let mut time_ms = 0u32;
        for (i, pair) in profile.chunks_exact(2).enumerate() {
            time_ms += 1000;
            callback(Sample::Time(time_ms));
            callback(Sample::Depth(f64::from(pair[0]) * FEET));
            if i % 2 == 0 {
                callback(Sample::Temperature((f64::from(pair[1]) - 32.0) * 5.0 / 9.0));
            } else if pair[1] != 0 {
                callback(Sample::Event {
                    kind: SampleEventKind::Alarm,
                    flags: u32::from(pair[1]),
                    value: 0,
                });
            }
            callback(Sample::Vendor { kind: 0, data: pair });
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

    fn read_command(address: u32, length: u16) -> Vec<u8> {
        let mut command = vec![CMD_READ];
        command.extend_from_slice(&address.to_le_bytes());
        command.extend_from_slice(&length.to_le_bytes());
        command
    }

    fn entry(day: u8, begin: u32, end: u32) -> [u8; SZ_ENTRY] {
        let mut e = [0u8; SZ_ENTRY];
        e[0] = 24;
        e[1] = 6;
        e[2] = day;
        e[3] = 9;
        e[4] = 0;
        e[5] = 0;
        write_u32_le(&mut e, 8, begin);
        write_u32_le(&mut e, 12, end);
        write_u16_le(&mut e, 16, 4 * 30); // 30 ft
        write_u16_le(&mut e, 18, 600);
        e
    }

    fn open_script(dive_count: u16, profile_end: u32) -> Vec<Exchange> {
        let mut id = vec![0u8; SZ_ID];
        write_u32_le(&mut id, 0, 777);
        id[8] = 2;
        id[9] = 11;

        let mut config = vec![0u8; 16];
        write_u16_le(&mut config, 4, dive_count);
        write_u32_le(&mut config, 6, profile_end);

        vec![
            Exchange::new(vec![CMD_ID], id),
            Exchange::new(read_command(CF_CONFIG, 16), config),
        ]
    }

    #[test]
    fn open_wakes_the_device() {
        let ctx = Context::new();
        let port = ReplayTransport::new(open_script(0, RB_PROFILE.begin));
        // Only the identify exchange runs at open.
        let device = CochranDevice::open(port, &ctx).unwrap();
        assert_eq!(device.port.break_toggles, 2);
        assert_eq!(device.port.dtr, Some(true));
        assert!(device.port.slept_ms >= SETTLE_MS);
        assert_eq!(device.port.exchanges_left(), 1);
    }

    #[test]
    fn corrupt_end_pointer_strict_vs_guess() {
        let ctx = Context::new();

        // One dive whose end pointer was never written; the profile really
        // spans one page up to the overall end of profile.
        let begin = RB_PROFILE.begin;
        let profile_end = begin + SZ_PAGE;
        let e = entry(1, begin, CORRUPT_END);
        let page = vec![0x42u8; SZ_PAGE as usize];

        let mut script = open_script(1, profile_end);
        script.push(Exchange::new(
            read_command(entry_address(0), SZ_ENTRY as u16),
            e.to_vec(),
        ));
        script.push(Exchange::new(
            read_command(begin, SZ_PAGE as u16),
            page.clone(),
        ));

        let port = ReplayTransport::new(script);
        let mut device = CochranDevice::open(port, &ctx).unwrap();

        let mut blobs = Vec::new();
        device
            .foreach(&mut |blob, _| {
                blobs.push(blob.to_vec());
                true
            })
            .unwrap();
        assert_eq!(blobs.len(), 1);
        assert_eq!(blobs[0].len(), SZ_ENTRY + SZ_PAGE as usize);
        assert_eq!(&blobs[0][SZ_ENTRY..], page.as_slice());

        // Strict mode surfaces the corruption instead.
        let mut script = open_script(1, profile_end);
        script.push(Exchange::new(
            read_command(entry_address(0), SZ_ENTRY as u16),
            e.to_vec(),
        ));
        let port = ReplayTransport::new(script);
        let mut device = CochranDevice::open(port, &ctx).unwrap();
        device.set_recovery_policy(RecoveryPolicy::Strict);
        let err = device.foreach(&mut |_, _| true).unwrap_err();
        assert!(matches!(err, Error::MalformedData(_)));
    }

    #[test]
    fn uninitialised_entry_ends_walk() {
        let ctx = Context::new();
        let mut script = open_script(2, RB_PROFILE.begin + SZ_PAGE);

        // Newest entry is blank (overwritten region), so the walk stops
        // without touching the older one.
        script.push(Exchange::new(
            read_command(entry_address(1), SZ_ENTRY as u16),
            vec![0xFF; SZ_ENTRY],
        ));

        let port = ReplayTransport::new(script);
        let mut device = CochranDevice::open(port, &ctx).unwrap();
        let mut count = 0;
        device
            .foreach(&mut |_, _| {
                count += 1;
                true
            })
            .unwrap();
        assert_eq!(count, 0);
        assert_eq!(device.port.exchanges_left(), 0);
    }

    #[test]
    fn dump_extract_matches_foreach() {
        let ctx = Context::new();

        // One dive with a one-page profile, laid out in a full image.
        let begin = RB_PROFILE.begin;
        let profile_end = begin + SZ_PAGE;
        let e = entry(9, begin, profile_end);

        let mut image = vec![0u8; SZ_MEMORY];
        write_u32_le(&mut image, 0, 777);
        write_u16_le(&mut image, 4, 1); // dive count
        write_u32_le(&mut image, 6, profile_end);
        let ea = entry_address(0) as usize;
        image[ea..ea + SZ_ENTRY].copy_from_slice(&e);
        for b in &mut image[begin as usize..profile_end as usize] {
            *b = 0x42;
        }

        let mut id = vec![0u8; SZ_ID];
        write_u32_le(&mut id, 0, 777);
        id[8] = 2;
        id[9] = 11;

        // The foreach path reads config, entry and profile individually.
        let mut script = vec![Exchange::new(vec![CMD_ID], id.clone())];
        script.push(Exchange::new(
            read_command(CF_CONFIG, 16),
            image[..16].to_vec(),
        ));
        script.push(Exchange::new(
            read_command(entry_address(0), SZ_ENTRY as u16),
            e.to_vec(),
        ));
        script.push(Exchange::new(
            read_command(begin, SZ_PAGE as u16),
            image[begin as usize..profile_end as usize].to_vec(),
        ));

        let port = ReplayTransport::new(script);
        let mut device = CochranDevice::open(port, &ctx).unwrap();
        let mut from_foreach: Vec<Vec<u8>> = Vec::new();
        device
            .foreach(&mut |blob, _| {
                from_foreach.push(blob.to_vec());
                true
            })
            .unwrap();

        // The dump path pulls the whole image page by page.
        let mut script = vec![Exchange::new(vec![CMD_ID], id)];
        for offset in (0..SZ_MEMORY).step_by(SZ_PAGE as usize) {
            script.push(Exchange::new(
                read_command(offset as u32, SZ_PAGE as u16),
                image[offset..offset + SZ_PAGE as usize].to_vec(),
            ));
        }
        let port = ReplayTransport::new(script);
        let mut device = CochranDevice::open(port, &ctx).unwrap();
        let dumped = device.dump().unwrap();
        assert_eq!(dumped, image);

        let mut from_dump: Vec<Vec<u8>> = Vec::new();
        extract_dives(
            &dumped,
            &None,
            RecoveryPolicy::GuessFromNeighbors,
            &mut |blob, fp| {
                assert_eq!(fp, &blob[..FINGERPRINT_SIZE]);
                from_dump.push(blob.to_vec());
                true
            },
        )
        .unwrap();

        assert_eq!(from_foreach, from_dump);
    }

    #[test]
    fn parser_decodes_interleaved_samples() {
        let mut blob = entry(5, RB_PROFILE.begin, RB_PROFILE.begin + 4).to_vec();
        blob.extend_from_slice(&[30, 75, 33, 0x04]); // depth/temp, depth/event

        let mut parser = CochranParser::new(&blob).unwrap();
        assert_eq!(
            parser.datetime().unwrap(),
            NaiveDate::from_ymd_opt(2024, 6, 5)
                .unwrap()
                .and_hms_opt(9, 0, 0)
                .unwrap()
        );

        let mut temps = 0;
        let mut alarms = 0;
        let mut depths = Vec::new();
        parser
            .samples_foreach(&mut |s| match s {
                Sample::Temperature(_) => temps += 1,
                Sample::Event { kind: SampleEventKind::Alarm, .. } => alarms += 1,
                Sample::Depth(m) => depths.push(m),
                _ => {}
            })
            .unwrap();
        assert_eq!(temps, 1);
        assert_eq!(alarms, 1);
        assert_eq!(depths.len(), 2);
        assert!((depths[1] - 33.0 * FEET).abs() < 1e-9);
    }
}
