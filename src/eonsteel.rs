//! Suunto EON Steel family.
//!
//! The device exposes a tiny filesystem over 64-byte HID reports: dives are
//! files under `0:/dives`, named by the hex-encoded Unix timestamp of the
//! dive start, so a lexical sort of the directory is chronological order.
//! Responses longer than one report continue in followup reports.

use chrono::{DateTime, NaiveDateTime};

use crate::codec::{read_u16_le, read_u32_le};
use crate::context::Context;
use crate::device::{self, Device, DiveCallback, Progress};
use crate::error::{Error, Result};
use crate::parser::{CacheLevel, Parser};
use crate::transport::{Purge, Timeout, Transport};
use crate::types::{Event, Field, FieldValue, Sample};

const SZ_REPORT: usize = 64;
/// Payload bytes available after the report's length byte.
const SZ_REPORT_DATA: usize = SZ_REPORT - 1;

const CMD_INIT: u8 = 0x00;
const CMD_READDIR: u8 = 0x10;
const CMD_FILE_OPEN: u8 = 0x20;
const CMD_FILE_STAT: u8 = 0x21;
const CMD_FILE_READ: u8 = 0x22;
const CMD_FILE_CLOSE: u8 = 0x23;

const DIVE_DIRECTORY: &str = "0:/dives";
const SZ_READ_CHUNK: u32 = 512;

const MAX_RETRIES: u32 = 4;
const RETRY_DELAY_MS: u64 = 100;

pub const SZ_HEADER: usize = 16;
pub const FINGERPRINT_SIZE: usize = 4;

pub struct EonSteelDevice<'a, T: Transport> {
    port: T,
    ctx: &'a Context,
    fingerprint: Option<Vec<u8>>,
    info: Vec<u8>,
}

impl<'a, T: Transport> EonSteelDevice<'a, T> {
    pub fn open(mut port: T, ctx: &'a Context) -> Result<Self> {
        port.set_timeout(Timeout::Millis(3000))?;
        port.purge(Purge::Both)?;

        let mut device = EonSteelDevice {
            port,
            ctx,
            fingerprint: None,
            info: Vec::new(),
        };
        device.info = device.transfer(CMD_INIT, &[])?;
        if device.info.len() < 12 {
            return Err(Error::Protocol("short init response"));
        }
        Ok(device)
    }

    fn send_report(&mut self, cmd: u8, payload: &[u8]) -> Result<()> {
        if payload.len() + 1 > SZ_REPORT_DATA {
            return Err(Error::InvalidArgs);
        }
        let mut report = [0u8; SZ_REPORT];
        report[0] = (payload.len() + 1) as u8;
        report[1] = cmd;
        report[2..2 + payload.len()].copy_from_slice(payload);
        self.port.write_all(&report)
    }

    /// Read one response, reassembling continuation reports. The first
    /// report echoes the command and declares the total payload length.
    fn recv_response(&mut self, cmd: u8) -> Result<Vec<u8>> {
        let mut report = [0u8; SZ_REPORT];
        self.port.read_exact(&mut report)?;

        let used = usize::from(report[0]);
        if used < 3 || used > SZ_REPORT_DATA {
            return Err(Error::Protocol("bad report length"));
        }
        if report[1] != cmd {
            return Err(Error::Protocol("missing command echo"));
        }
        let total = read_u16_le(&report, 2) as usize;

        let mut data = Vec::with_capacity(total);
        data.extend_from_slice(&report[4..1 + used]);

        while data.len() < total {
            self.port.read_exact(&mut report)?;
            let used = usize::from(report[0]);
            if used == 0 || used > SZ_REPORT_DATA {
                return Err(Error::Protocol("bad continuation report"));
            }
            data.extend_from_slice(&report[1..1 + used]);
        }
        data.truncate(total);
        Ok(data)
    }

    fn transfer(&mut self, cmd: u8, payload: &[u8]) -> Result<Vec<u8>> {
        let mut last = Error::Timeout;
        for attempt in 0..MAX_RETRIES {
            self.ctx.check_cancelled()?;
            if attempt > 0 {
                self.port.sleep(RETRY_DELAY_MS);
                self.port.purge(Purge::Input)?;
            }
            let result = self
                .send_report(cmd, payload)
                .and_then(|()| self.recv_response(cmd));
            match result {
                Ok(data) => return Ok(data),
                Err(e) if e.is_retryable() => last = e,
                Err(e) => return Err(e),
            }
        }
        Err(last)
    }

    /// List `0:/dives`, newest first.
    fn read_dive_directory(&mut self) -> Result<Vec<String>> {
        let mut path = DIVE_DIRECTORY.as_bytes().to_vec();
        path.push(0);
        let listing = self.transfer(CMD_READDIR, &path)?;

        let mut names: Vec<String> = listing
            .split(|&b| b == 0)
            .filter(|name| !name.is_empty())
            .map(|name| String::from_utf8_lossy(name).to_string())
            .collect();

        // Hex timestamps sort lexically into chronological order; walk them
        // newest first.
        names.sort();
        names.reverse();
        Ok(names)
    }

    fn read_file(&mut self, name: &str, progress: &mut Progress<'_>) -> Result<Vec<u8>> {
        let mut path = format!("{DIVE_DIRECTORY}/{name}").into_bytes();
        path.push(0);

        let open = self.transfer(CMD_FILE_OPEN, &path)?;
        if open.first() != Some(&0) {
            return Err(Error::Protocol("file open refused"));
        }

        let stat = self.transfer(CMD_FILE_STAT, &[])?;
        if stat.len() < 4 {
            return Err(Error::Protocol("short stat response"));
        }
        let size = read_u32_le(&stat, 0);
        progress.grow_maximum(progress.current() + size);

        let mut data = Vec::with_capacity(size as usize);
        while (data.len() as u32) < size {
            let offset = data.len() as u32;
            let length = (size - offset).min(SZ_READ_CHUNK);
            let mut request = offset.to_le_bytes().to_vec();
            request.extend_from_slice(&length.to_le_bytes());
            let chunk = self.transfer(CMD_FILE_READ, &request)?;
            if chunk.is_empty() || chunk.len() as u32 > length {
                return Err(Error::Protocol("bad file read chunk"));
            }
            progress.add(chunk.len() as u32);
            data.extend_from_slice(&chunk);
        }

        let close = self.transfer(CMD_FILE_CLOSE, &[])?;
        if close.first() != Some(&0) {
            return Err(Error::Protocol("file close refused"));
        }
        Ok(data)
    }
}

impl<'a, T: Transport> Device for EonSteelDevice<'a, T> {
    fn set_fingerprint(&mut self, fingerprint: &[u8]) {
        device::store_fingerprint(&mut self.fingerprint, fingerprint);
    }

    fn foreach(&mut self, callback: &mut DiveCallback<'_>) -> Result<()> {
        self.ctx.emit(Event::Vendor { data: &self.info });
        self.ctx.emit(Event::DeviceInfo {
            model: read_u32_le(&self.info, 0),
            firmware: read_u32_le(&self.info, 4),
            serial: read_u32_le(&self.info, 8),
        });

        self.ctx.emit(Event::Waiting);
        let names = self.read_dive_directory()?;
        let mut progress = Progress::new(self.ctx, 0);

        for name in names {
            let blob = self.read_file(&name, &mut progress)?;
            if blob.len() < SZ_HEADER {
                return Err(Error::MalformedData("dive file shorter than header"));
            }

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

const REC_TIME: u8 = 0x00;
const REC_DEPTH: u8 = 0x01;
const REC_TEMPERATURE: u8 = 0x02;
const REC_PRESSURE: u8 = 0x03;

/// Parser for one dive file.
///
/// Header: dive start as a Unix timestamp (u32 LE, which is also the
/// fingerprint window), serial, then reserved bytes. The profile is a
/// type/length/value record stream; every group of records is anchored by a
/// time record whose milliseconds must never move backwards.
pub struct EonSteelParser<'b> {
    blob: &'b [u8],
    cache: CacheLevel,
    maxdepth: f64,
    divetime_ms: u32,
}

impl<'b> EonSteelParser<'b> {
    pub fn new(blob: &'b [u8]) -> Result<Self> {
        if blob.len() < SZ_HEADER {
            return Err(Error::MalformedData("blob shorter than dive header"));
        }
        Ok(EonSteelParser {
            blob,
            cache: CacheLevel::Empty,
            maxdepth: 0.0,
            divetime_ms: 0,
        })
    }

    fn load_profile(&mut self) -> Result<()> {
        if self.cache >= CacheLevel::ProfileValid {
            return Ok(());
        }
        let mut maxdepth = 0.0f64;
        let mut divetime = 0u32;
        self.walk(&mut |sample| match sample {
            Sample::Depth(m) => maxdepth = maxdepth.max(m),
            Sample::Time(ms) => divetime = ms,
            _ => {}
        })?;
        self.maxdepth = maxdepth;
        self.divetime_ms = divetime;
        self.cache = CacheLevel::ProfileValid;
        Ok(())
    }

    fn walk(&mut self, callback: &mut dyn FnMut(Sample<'_>)) -> Result<()> {
        let profile = &self.blob[SZ_HEADER..];
        let mut offset = 0usize;
        let mut last_time: Option<u32> = None;
        let mut dropping = false;

        while offset + 2 <= profile.len() {
            let kind = profile[offset];
            let length = usize::from(profile[offset + 1]);
            if offset + 2 + length > profile.len() {
                return Err(Error::MalformedData("truncated record"));
            }
            let payload = &profile[offset + 2..offset + 2 + length];
            offset += 2 + length;

            if kind == REC_TIME {
                if length < 4 {
                    return Err(Error::MalformedData("short time record"));
                }
                let time = read_u32_le(payload, 0);
                match last_time {
                    Some(previous) if time < previous => {
                        return Err(Error::MalformedData("sample time moved backwards"));
                    }
                    Some(previous) if time == previous => {
                        log::warn!("eonsteel: duplicate sample timestamp {time}, dropping");
                        dropping = true;
                        continue;
                    }
                    _ => {}
                }
                last_time = Some(time);
                dropping = false;
                callback(Sample::Time(time));
                callback(Sample::Vendor { kind: u32::from(kind), data: payload });
                continue;
            }

            if dropping {
                continue;
            }
            match kind {
                REC_DEPTH if length >= 2 => {
                    callback(Sample::Depth(f64::from(read_u16_le(payload, 0)) / 100.0));
                }
                REC_TEMPERATURE if length >= 2 => {
                    callback(Sample::Temperature(
                        f64::from(read_u16_le(payload, 0) as i16) / 10.0,
                    ));
                }
                REC_PRESSURE if length >= 3 => {
                    callback(Sample::Pressure {
                        tank: usize::from(payload[0]),
                        bar: f64::from(read_u16_le(payload, 1)) / 100.0,
                    });
                }
                _ => {
                    log::warn!("eonsteel: skipping unknown record type {kind:#04x}");
                    continue;
                }
            }
            callback(Sample::Vendor { kind: u32::from(kind), data: payload });
        }
        Ok(())
    }
}

impl<'b> Parser for EonSteelParser<'b> {
    fn datetime(&mut self) -> Result<NaiveDateTime> {
        let timestamp = read_u32_le(self.blob, 0);
        DateTime::from_timestamp(i64::from(timestamp), 0)
            .map(|dt| dt.naive_utc())
            .ok_or(Error::MalformedData("invalid timestamp in header"))
    }

    fn field(&mut self, field: Field) -> Result<Option<FieldValue>> {
        match field {
            Field::DiveTime => {
                self.load_profile()?;
                Ok(Some(FieldValue::Time(self.divetime_ms / 1000)))
            }
            Field::MaxDepth => {
                self.load_profile()?;
                Ok(Some(FieldValue::Depth(self.maxdepth)))
            }
            _ => Ok(None),
        }
    }

    fn samples_foreach(&mut self, callback: &mut dyn FnMut(Sample<'_>)) -> Result<()> {
        self.walk(callback)
    }
}
