//! The abstract byte stream the drivers talk through.
//!
//! The library never opens ports itself; the caller binds something that
//! implements [`Transport`] (a serial port, USB endpoint pair, or the BLE
//! adapter in [`crate::ble`]) to a driver. Drivers tolerate short reads and
//! retry up to their family's bound, but never silently lose bytes across
//! retries.

use std::collections::VecDeque;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Even,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopBits {
    One,
    OneAndHalf,
    Two,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowControl {
    None,
    Hardware,
    Software,
}

/// Serial line parameters. Devices in the field use baud rates from 1200 up
/// to Cochran's 806400.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineConfig {
    pub baud: u32,
    pub data_bits: u8,
    pub parity: Parity,
    pub stop_bits: StopBits,
    pub flow: FlowControl,
}

impl LineConfig {
    pub const fn eight_n_one(baud: u32) -> Self {
        LineConfig {
            baud,
            data_bits: 8,
            parity: Parity::None,
            stop_bits: StopBits::One,
            flow: FlowControl::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    Blocking,
    NonBlocking,
    Millis(u32),
}

/// Which queue to discard on `purge`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purge {
    Input,
    Output,
    Both,
}

pub trait Transport {
    fn configure(&mut self, config: &LineConfig) -> Result<()>;
    fn set_timeout(&mut self, timeout: Timeout) -> Result<()>;

    /// Read into `buf`, returning the number of bytes transferred. Zero
    /// bytes within the timeout is reported as [`Error::Timeout`].
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Write from `buf`, returning the number of bytes transferred.
    fn write(&mut self, buf: &[u8]) -> Result<usize>;

    fn purge(&mut self, direction: Purge) -> Result<()>;

    /// Cooperatively block the caller. Drivers use this for protocol pacing.
    fn sleep(&mut self, ms: u64);

    fn set_break(&mut self, enabled: bool) -> Result<()> {
        let _ = enabled;
        Err(Error::Unsupported)
    }

    fn set_dtr(&mut self, enabled: bool) -> Result<()> {
        let _ = enabled;
        Err(Error::Unsupported)
    }

    fn set_rts(&mut self, enabled: bool) -> Result<()> {
        let _ = enabled;
        Err(Error::Unsupported)
    }

    /// Read until `buf` is full, tolerating short reads.
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut offset = 0;
        while offset < buf.len() {
            let n = self.read(&mut buf[offset..])?;
            if n == 0 {
                return Err(Error::Timeout);
            }
            offset += n;
        }
        Ok(())
    }

    /// Write the whole buffer, tolerating short writes.
    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let mut offset = 0;
        while offset < data.len() {
            let n = self.write(&data[offset..])?;
            if n == 0 {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "transport accepted no bytes",
                )));
            }
            offset += n;
        }
        Ok(())
    }
}

/// Packet-layer wrapper for framed transports (BLE, some USB HID paths).
///
/// Segments writes into `mtu_out`-sized packets and serves reads from
/// reassembled incoming packets of up to `mtu_in` bytes, so drivers can keep
/// treating the link as a byte stream.
pub struct FramedTransport<T: Transport> {
    inner: T,
    mtu_in: usize,
    mtu_out: usize,
    pending: VecDeque<u8>,
}

impl<T: Transport> FramedTransport<T> {
    pub fn packet_open(inner: T, mtu_in: usize, mtu_out: usize) -> Result<Self> {
        if mtu_in == 0 || mtu_out == 0 {
            return Err(Error::InvalidArgs);
        }
        Ok(FramedTransport {
            inner,
            mtu_in,
            mtu_out,
            pending: VecDeque::new(),
        })
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T: Transport> Transport for FramedTransport<T> {
    fn configure(&mut self, config: &LineConfig) -> Result<()> {
        self.inner.configure(config)
    }

    fn set_timeout(&mut self, timeout: Timeout) -> Result<()> {
        self.inner.set_timeout(timeout)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.pending.is_empty() {
            let mut packet = vec![0; self.mtu_in];
            let n = self.inner.read(&mut packet)?;
            self.pending.extend(&packet[..n]);
        }
        let take = buf.len().min(self.pending.len());
        for slot in buf.iter_mut().take(take) {
            *slot = self.pending.pop_front().unwrap();
        }
        Ok(take)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        for chunk in buf.chunks(self.mtu_out) {
            self.inner.write_all(chunk)?;
        }
        Ok(buf.len())
    }

    fn purge(&mut self, direction: Purge) -> Result<()> {
        if matches!(direction, Purge::Input | Purge::Both) {
            self.pending.clear();
        }
        self.inner.purge(direction)
    }

    fn sleep(&mut self, ms: u64) {
        self.inner.sleep(ms);
    }

    fn set_break(&mut self, enabled: bool) -> Result<()> {
        self.inner.set_break(enabled)
    }

    fn set_dtr(&mut self, enabled: bool) -> Result<()> {
        self.inner.set_dtr(enabled)
    }

    fn set_rts(&mut self, enabled: bool) -> Result<()> {
        self.inner.set_rts(enabled)
    }
}

/// One scripted request/response pair for [`ReplayTransport`].
#[derive(Debug, Clone)]
pub struct Exchange {
    pub expect: Vec<u8>,
    pub reply: Vec<u8>,
}

impl Exchange {
    pub fn new(expect: impl Into<Vec<u8>>, reply: impl Into<Vec<u8>>) -> Self {
        Exchange {
            expect: expect.into(),
            reply: reply.into(),
        }
    }
}

/// A transport that replays a captured byte stream.
///
/// Each write is matched against the next scripted exchange; once the
/// accumulated outgoing bytes equal `expect`, the scripted `reply` becomes
/// readable. Unmatched writes produce no reply, so a driver under test sees
/// exactly the timeout/retry behavior a silent device would cause. Sleeps
/// are virtual and only accumulated.
#[derive(Debug, Default)]
pub struct ReplayTransport {
    script: VecDeque<Exchange>,
    outgoing: Vec<u8>,
    incoming: VecDeque<u8>,
    pub slept_ms: u64,
    pub config: Option<LineConfig>,
    pub timeout: Option<Timeout>,
    pub break_toggles: u32,
    pub dtr: Option<bool>,
    pub rts: Option<bool>,
}

impl ReplayTransport {
    pub fn new(script: impl IntoIterator<Item = Exchange>) -> Self {
        ReplayTransport {
            script: script.into_iter().collect(),
            ..Default::default()
        }
    }

    /// Preload bytes readable before any write, e.g. device banners.
    pub fn push_incoming(&mut self, data: &[u8]) {
        self.incoming.extend(data);
    }

    pub fn exchanges_left(&self) -> usize {
        self.script.len()
    }

    fn try_match(&mut self) {
        while let Some(front) = self.script.front() {
            if self.outgoing == front.expect {
                let exchange = self.script.pop_front().unwrap();
                self.incoming.extend(&exchange.reply);
                self.outgoing.clear();
            } else if front.expect.starts_with(&self.outgoing) {
                break;
            } else {
                // Wrong bytes on the wire: swallow them without replying.
                self.outgoing.clear();
                break;
            }
        }
    }
}

impl Transport for ReplayTransport {
    fn configure(&mut self, config: &LineConfig) -> Result<()> {
        self.config = Some(*config);
        Ok(())
    }

    fn set_timeout(&mut self, timeout: Timeout) -> Result<()> {
        self.timeout = Some(timeout);
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.incoming.is_empty() {
            return Err(Error::Timeout);
        }
        let take = buf.len().min(self.incoming.len());
        for slot in buf.iter_mut().take(take) {
            *slot = self.incoming.pop_front().unwrap();
        }
        Ok(take)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.outgoing.extend_from_slice(buf);
        self.try_match();
        Ok(buf.len())
    }

    fn purge(&mut self, direction: Purge) -> Result<()> {
        if matches!(direction, Purge::Input | Purge::Both) {
            self.incoming.clear();
        }
        if matches!(direction, Purge::Output | Purge::Both) {
            self.outgoing.clear();
        }
        Ok(())
    }

    fn sleep(&mut self, ms: u64) {
        self.slept_ms += ms;
    }

    fn set_break(&mut self, _enabled: bool) -> Result<()> {
        self.break_toggles += 1;
        Ok(())
    }

    fn set_dtr(&mut self, enabled: bool) -> Result<()> {
        self.dtr = Some(enabled);
        Ok(())
    }

    fn set_rts(&mut self, enabled: bool) -> Result<()> {
        self.rts = Some(enabled);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replay_matches_and_replies() {
        let mut port = ReplayTransport::new([Exchange::new(vec![0x01, 0x02], vec![0xAA, 0x55])]);
        port.write_all(&[0x01]).unwrap();
        assert!(matches!(port.read(&mut [0u8; 4]), Err(Error::Timeout)));
        port.write_all(&[0x02]).unwrap();

        let mut buf = [0u8; 2];
        port.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [0xAA, 0x55]);
        assert_eq!(port.exchanges_left(), 0);
    }

    #[test]
    fn replay_ignores_unexpected_bytes() {
        let mut port = ReplayTransport::new([Exchange::new(vec![0x01], vec![0xAA])]);
        port.write_all(&[0x7F]).unwrap();
        assert!(matches!(port.read(&mut [0u8; 1]), Err(Error::Timeout)));
        port.write_all(&[0x01]).unwrap();
        let mut buf = [0u8; 1];
        port.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [0xAA]);
    }

    #[test]
    fn framed_transport_segments_and_reassembles() {
        let mut script = Vec::new();
        // A 45-byte logical write arrives as 20+20+5 packets.
        let payload: Vec<u8> = (0..45u8).collect();
        script.push(Exchange::new(payload.clone(), vec![0x10, 0x20, 0x30]));
        let port = ReplayTransport::new(script);

        let mut framed = FramedTransport::packet_open(port, 20, 20).unwrap();
        framed.write_all(&payload).unwrap();

        let mut buf = [0u8; 3];
        framed.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [0x10, 0x20, 0x30]);
    }
}
