//! Shearwater Predator/Petrel family.
//!
//! Frames travel SLIP-escaped over the link. Small values are fetched with a
//! read-by-identifier exchange; dives are listed in a manifest of 32-byte
//! records (newest first) and downloaded as compressed blobs. The
//! compression is two-pass: a run-length layer over 9-bit symbols, then a
//! block-XOR mask over 32-byte windows.

use chrono::{DateTime, NaiveDateTime};

use crate::codec::{read_u16_be, read_u32_be};
use crate::context::Context;
use crate::device::{self, Device, DiveCallback, Progress};
use crate::error::{Error, Result};
use crate::parser::{CacheLevel, Parser};
use crate::transport::{Purge, Timeout, Transport};
use crate::types::{
    DecoKind, DecoModel, DiveMode, Event, Field, FieldValue, GasMix, Sample,
};

const SLIP_END: u8 = 0xC0;
const SLIP_ESC: u8 = 0xDB;
const SLIP_ESC_END: u8 = 0xDC;
const SLIP_ESC_ESC: u8 = 0xDD;

const CMD_READ_ID: u8 = 0x22;
const RSP_READ_ID: u8 = 0x62;
const CMD_DOWNLOAD_INIT: u8 = 0x35;
const RSP_DOWNLOAD_INIT: u8 = 0x75;
const CMD_DOWNLOAD_BLOCK: u8 = 0x36;
const RSP_DOWNLOAD_BLOCK: u8 = 0x76;
const CMD_DOWNLOAD_DONE: u8 = 0x37;
const RSP_DOWNLOAD_DONE: u8 = 0x77;

const ID_SERIAL: u16 = 0x8010;
const ID_FIRMWARE: u16 = 0x8011;
const ID_MODEL: u16 = 0x8012;

/// Known logbook base addresses across firmware generations; probed in
/// order, first responder wins.
pub const MANIFEST_ADDRESSES: [u32; 4] = [0xDD00_0000, 0xC000_0000, 0x9000_0000, 0x8000_0000];

const SZ_MANIFEST: u32 = 0x600;
const SZ_RECORD: usize = 32;
const SZ_BLOCK: usize = 128;
pub const SZ_HEADER: usize = 32;
const SZ_SAMPLE: usize = 16;

const RECORD_MARKER: u16 = 0xA5C4;

const MAX_RETRIES: u32 = 9;
const RETRY_DELAY_MS: u64 = 100;
/// The unit needs a moment after the link opens before it will talk.
const WARMUP_MS: u64 = 300;

pub const FINGERPRINT_OFFSET: usize = 12;
pub const FINGERPRINT_SIZE: usize = 4;

pub const NGASMIXES: usize = 4;

/// Undo the run-length pass: 9-bit symbols, MSB first. A clear top bit is a
/// literal byte; a set top bit is a run of that many zero bytes; the
/// all-zero run (symbol 0x100) ends the stream.
pub fn decompress_rle(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let total_bits = data.len() * 8;
    let mut bit = 0usize;
    while bit + 9 <= total_bits {
        let mut symbol = 0u16;
        for i in 0..9 {
            let index = bit + i;
            let byte = data[index / 8];
            symbol = symbol << 1 | u16::from(byte >> (7 - index % 8) & 1);
        }
        bit += 9;

        if symbol & 0x100 == 0 {
            out.push(symbol as u8);
        } else {
            let run = (symbol & 0xFF) as usize;
            if run == 0 {
                return Ok(out); // end-of-stream marker
            }
            out.resize(out.len() + run, 0);
        }
    }
    Err(Error::MalformedData("compressed stream has no end marker"))
}

/// Undo the second pass: each byte past the first 32-byte window is XOR
/// masked with the byte one window earlier.
pub fn unmask_xor(data: &mut [u8]) {
    for i in SZ_RECORD..data.len() {
        data[i] ^= data[i - SZ_RECORD];
    }
}

pub struct ShearwaterDevice<'a, T: Transport> {
    port: T,
    ctx: &'a Context,
    fingerprint: Option<Vec<u8>>,
    serial: u32,
    firmware: u32,
    model: u32,
}

impl<'a, T: Transport> ShearwaterDevice<'a, T> {
    pub fn open(mut port: T, ctx: &'a Context) -> Result<Self> {
        port.set_timeout(Timeout::Millis(3000))?;
        port.sleep(WARMUP_MS);
        port.purge(Purge::Both)?;

        let mut device = ShearwaterDevice {
            port,
            ctx,
            fingerprint: None,
            serial: 0,
            firmware: 0,
            model: 0,
        };
        device.serial = read_u32_be(&device.read_identifier(ID_SERIAL)?, 0);
        device.firmware = read_u32_be(&device.read_identifier(ID_FIRMWARE)?, 0);
        device.model = read_u32_be(&device.read_identifier(ID_MODEL)?, 0);
        Ok(device)
    }

    fn slip_write(&mut self, payload: &[u8]) -> Result<()> {
        let mut frame = Vec::with_capacity(payload.len() + 2);
        for &b in payload {
            match b {
                SLIP_END => frame.extend_from_slice(&[SLIP_ESC, SLIP_ESC_END]),
                SLIP_ESC => frame.extend_from_slice(&[SLIP_ESC, SLIP_ESC_ESC]),
                _ => frame.push(b),
            }
        }
        frame.push(SLIP_END);
        self.port.write_all(&frame)
    }

    fn slip_read(&mut self) -> Result<Vec<u8>> {
        let mut payload = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            self.port.read_exact(&mut byte)?;
            match byte[0] {
                SLIP_END => return Ok(payload),
                SLIP_ESC => {
                    self.port.read_exact(&mut byte)?;
                    match byte[0] {
                        SLIP_ESC_END => payload.push(SLIP_END),
                        SLIP_ESC_ESC => payload.push(SLIP_ESC),
                        _ => return Err(Error::Protocol("bad escape sequence")),
                    }
                }
                b => payload.push(b),
            }
            if payload.len() > 4096 {
                return Err(Error::Protocol("oversized frame"));
            }
        }
    }

    /// One framed request/response with bounded retries; the response must
    /// echo the expected opcode.
    fn transfer(&mut self, request: &[u8], response_opcode: u8) -> Result<Vec<u8>> {
        let mut last = Error::Timeout;
        for attempt in 0..MAX_RETRIES {
            self.ctx.check_cancelled()?;
            if attempt > 0 {
                self.port.sleep(RETRY_DELAY_MS);
                self.port.purge(Purge::Input)?;
            }
            let result = self.slip_write(request).and_then(|()| self.slip_read());
            match result {
                Ok(payload) => {
                    if payload.first() != Some(&response_opcode) {
                        last = Error::Protocol("unexpected response opcode");
                        continue;
                    }
                    return Ok(payload);
                }
                Err(e) if e.is_retryable() => last = e,
                Err(e) => return Err(e),
            }
        }
        Err(last)
    }

    /// Read-by-identifier: returns up to ~254 bytes for one id.
    fn read_identifier(&mut self, id: u16) -> Result<Vec<u8>> {
        let request = [CMD_READ_ID, (id >> 8) as u8, (id & 0xFF) as u8];
        let payload = self.transfer(&request, RSP_READ_ID)?;
        if payload.len() < 4 || read_u16_be(&payload, 1) != id {
            return Err(Error::Protocol("identifier echo mismatch"));
        }
        Ok(payload[3..].to_vec())
    }

    /// Streamed download of `length` bytes from `address`.
    fn download(
        &mut self,
        address: u32,
        length: u32,
        mut progress: Option<&mut Progress<'_>>,
    ) -> Result<Vec<u8>> {
        let mut request = vec![CMD_DOWNLOAD_INIT];
        request.extend_from_slice(&address.to_be_bytes());
        request.extend_from_slice(&length.to_be_bytes());
        let init = self.transfer(&request, RSP_DOWNLOAD_INIT)?;
        if init.len() < 2 || init[1] != 0 {
            return Err(Error::Protocol("download refused"));
        }

        let mut data = Vec::with_capacity(length as usize);
        let mut sequence = 0u8;
        while (data.len() as u32) < length {
            let block = self.transfer(&[CMD_DOWNLOAD_BLOCK, sequence], RSP_DOWNLOAD_BLOCK)?;
            if block.len() < 2 || block[1] != sequence {
                return Err(Error::Protocol("block sequence mismatch"));
            }
            let chunk = &block[2..];
            if chunk.is_empty() || chunk.len() > SZ_BLOCK {
                return Err(Error::Protocol("bad block size"));
            }
            data.extend_from_slice(chunk);
            if let Some(p) = progress.as_mut() {
                p.add(chunk.len() as u32);
            }
            sequence = sequence.wrapping_add(1);
        }

        let done = self.transfer(&[CMD_DOWNLOAD_DONE], RSP_DOWNLOAD_DONE)?;
        if done.len() < 2 || done[1] != 0 {
            return Err(Error::Protocol("download close refused"));
        }

        data.truncate(length as usize);
        Ok(data)
    }

    /// Fetch the manifest from the first base address the firmware answers.
    fn read_manifest(&mut self) -> Result<Vec<u8>> {
        for &address in &MANIFEST_ADDRESSES {
            match self.download(address, SZ_MANIFEST, None) {
                Ok(manifest) => return Ok(manifest),
                Err(Error::Protocol(_)) | Err(Error::Timeout) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(Error::NoDevice)
    }
}

impl<'a, T: Transport> Device for ShearwaterDevice<'a, T> {
    fn set_fingerprint(&mut self, fingerprint: &[u8]) {
        device::store_fingerprint(&mut self.fingerprint, fingerprint);
    }

    fn foreach(&mut self, callback: &mut DiveCallback<'_>) -> Result<()> {
        self.ctx.emit(Event::DeviceInfo {
            model: self.model,
            firmware: self.firmware,
            serial: self.serial,
        });

        self.ctx.emit(Event::Waiting);
        let manifest = self.read_manifest()?;
        self.ctx.emit(Event::Vendor { data: &manifest });

        // Collect the valid records; they are stored newest first.
        let mut records = Vec::new();
        for record in manifest.chunks_exact(SZ_RECORD) {
            if read_u16_be(record, 0) != RECORD_MARKER {
                break;
            }
            records.push(record);
        }

        let total: u32 = records
            .iter()
            .map(|record| read_u32_be(record, 8))
            .sum();
        let mut progress = Progress::new(self.ctx, total);

        let mut selected = Vec::new();
        for record in records {
            let fp = &record[FINGERPRINT_OFFSET..FINGERPRINT_OFFSET + FINGERPRINT_SIZE];
            if device::fingerprint_matches(&self.fingerprint, fp) {
                break;
            }
            selected.push((read_u32_be(record, 4), read_u32_be(record, 8)));
        }

        for (address, length) in selected {
            let compressed = self.download(address, length, Some(&mut progress))?;
            let mut blob = decompress_rle(&compressed)?;
            unmask_xor(&mut blob);
            if blob.len() < SZ_HEADER {
                return Err(Error::MalformedData("dive blob shorter than header"));
            }

            let fp = &blob[FINGERPRINT_OFFSET..FINGERPRINT_OFFSET + FINGERPRINT_SIZE];
            if !callback(&blob, fp) {
                return Ok(());
            }
        }

        progress.finish();
        Ok(())
    }
}

// ── Parser ──

/// Parser for one decompressed dive blob.
///
/// The 32-byte header carries the dive number, the start timestamp (which is
/// also the fingerprint window), gradient factors, mode, surface pressure,
/// the sample interval and four (O2, He) pairs. Samples are 16-byte
/// big-endian records.
pub struct ShearwaterParser<'b> {
    blob: &'b [u8],
    cache: CacheLevel,
    gasmixes: Vec<(u8, u8)>,
    maxdepth: f64,
}

impl<'b> ShearwaterParser<'b> {
    pub fn new(blob: &'b [u8]) -> Result<Self> {
        if blob.len() < SZ_HEADER {
            return Err(Error::MalformedData("blob shorter than dive header"));
        }
        if (blob.len() - SZ_HEADER) % SZ_SAMPLE != 0 {
            return Err(Error::MalformedData("profile is not whole samples"));
        }
        Ok(ShearwaterParser {
            blob,
            cache: CacheLevel::Empty,
            gasmixes: Vec::new(),
            maxdepth: 0.0,
        })
    }

    fn interval(&self) -> u32 {
        u32::from(read_u16_be(self.blob, 22)).max(1)
    }

    fn nsamples(&self) -> usize {
        (self.blob.len() - SZ_HEADER) / SZ_SAMPLE
    }

    fn mode(&self) -> DiveMode {
        match self.blob[19] {
            1 => DiveMode::ClosedCircuit,
            2 => DiveMode::Gauge,
            _ => DiveMode::OpenCircuit,
        }
    }

    fn load_header(&mut self) {
        if self.cache >= CacheLevel::HeaderValid {
            return;
        }
        for i in 0..NGASMIXES {
            let o2 = self.blob[24 + i * 2];
            let he = self.blob[25 + i * 2];
            if o2 == 0 || o2 > 100 || he > 100 - o2 {
                continue;
            }
            self.gasmixes.push((o2, he));
        }
        self.cache = CacheLevel::HeaderValid;
    }

    fn load_profile(&mut self) {
        self.load_header();
        if self.cache >= CacheLevel::ProfileValid {
            return;
        }
        let mut maxdepth = 0.0f64;
        for i in 0..self.nsamples() {
            let offset = SZ_HEADER + i * SZ_SAMPLE;
            maxdepth = maxdepth.max(f64::from(read_u16_be(self.blob, offset)) / 10.0);
        }
        self.maxdepth = maxdepth;
        self.cache = CacheLevel::ProfileValid;
    }
}

impl<'b> Parser for ShearwaterParser<'b> {
    fn datetime(&mut self) -> Result<NaiveDateTime> {
        let timestamp = read_u32_be(self.blob, FINGERPRINT_OFFSET);
        DateTime::from_timestamp(i64::from(timestamp), 0)
            .map(|dt| dt.naive_utc())
            .ok_or(Error::MalformedData("invalid timestamp in header"))
    }

    fn field(&mut self, field: Field) -> Result<Option<FieldValue>> {
        self.load_header();
        match field {
            Field::DiveTime => Ok(Some(FieldValue::Time(
                self.nsamples() as u32 * self.interval(),
            ))),
            Field::MaxDepth => {
                self.load_profile();
                Ok(Some(FieldValue::Depth(self.maxdepth)))
            }
            Field::GasMixCount => Ok(Some(FieldValue::Count(self.gasmixes.len() as u32))),
            Field::GasMix(i) => Ok(self
                .gasmixes
                .get(i)
                .map(|&(o2, he)| FieldValue::GasMix(GasMix::from_percent(o2, he)))),
            Field::Atmospheric => Ok(Some(FieldValue::Pressure(
                f64::from(read_u16_be(self.blob, 20)) / 1000.0,
            ))),
            Field::DecoModel => Ok(Some(FieldValue::DecoModel(DecoModel::Buhlmann {
                gf_low: self.blob[16],
                gf_high: self.blob[17],
            }))),
            Field::DiveMode => Ok(Some(FieldValue::Mode(self.mode()))),
            _ => Ok(None),
        }
    }

    fn samples_foreach(&mut self, callback: &mut dyn FnMut(Sample<'_>)) -> Result<()> {
        self.load_header();
        let ccr = self.mode() == DiveMode::ClosedCircuit;
        let mut time_ms = 0u32;
        let mut active_gas: Option<usize> = None;

        for i in 0..self.nsamples() {
            let offset = SZ_HEADER + i * SZ_SAMPLE;
            let window = &self.blob[offset..offset + SZ_SAMPLE];

            time_ms += self.interval() * 1000;
            callback(Sample::Time(time_ms));
            callback(Sample::Depth(f64::from(read_u16_be(window, 0)) / 10.0));
            callback(Sample::Temperature(f64::from(window[2] as i8)));

            let flags = window[3];
            if flags & 0x01 != 0 {
                callback(Sample::Deco {
                    kind: DecoKind::Stop,
                    seconds: u32::from(read_u16_be(window, 4)) * 60,
                    depth: f64::from(window[6]),
                });
            } else {
                callback(Sample::Deco {
                    kind: DecoKind::Ndl,
                    seconds: u32::from(read_u16_be(window, 4)) * 60,
                    depth: 0.0,
                });
            }

            callback(Sample::Cns(f64::from(window[7]) / 100.0));

            if ccr {
                for sensor in 0..3 {
                    callback(Sample::Ppo2 {
                        sensor,
                        bar: f64::from(window[8 + sensor]) / 100.0,
                    });
                }
            }

            let gas = usize::from(window[11]);
            if active_gas != Some(gas) {
                if gas >= self.gasmixes.len() {
                    return Err(Error::MalformedData("gas switch to unknown mix"));
                }
                callback(Sample::GasSwitch(gas));
                active_gas = Some(gas);
            }

            callback(Sample::Vendor { kind: 0, data: window });
        }
        Ok(())
    }
}
