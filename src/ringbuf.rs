//! Modular arithmetic over a circular device-memory region and a paged
//! sequential reader on top of it.

use crate::device::Progress;
use crate::error::{Error, Result};

/// How `distance` treats `from == to`: an empty ring or a completely full
/// one. Callers that cannot distinguish the two must pass `Full`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overlap {
    Empty,
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

/// A circular region `[begin, end)` of device memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingLayout {
    pub begin: u32,
    pub end: u32,
}

impl RingLayout {
    pub const fn new(begin: u32, end: u32) -> Self {
        assert!(begin < end);
        RingLayout { begin, end }
    }

    pub const fn size(&self) -> u32 {
        self.end - self.begin
    }

    pub const fn contains(&self, p: u32) -> bool {
        p >= self.begin && p < self.end
    }

    /// Shortest non-negative forward distance from `from` to `to`, in bytes.
    pub fn distance(&self, from: u32, to: u32, overlap: Overlap) -> u32 {
        debug_assert!(self.contains(from) && self.contains(to));
        if from == to {
            match overlap {
                Overlap::Empty => 0,
                Overlap::Full => self.size(),
            }
        } else if to > from {
            to - from
        } else {
            self.size() - (from - to)
        }
    }

    /// Advance `p` forward by `n` bytes, wrapping at `end`.
    pub fn increment(&self, p: u32, n: u32) -> u32 {
        debug_assert!(self.contains(p));
        self.begin + (p - self.begin + n % self.size()) % self.size()
    }

    /// Move `p` backward by `n` bytes, wrapping at `begin`.
    pub fn decrement(&self, p: u32, n: u32) -> u32 {
        debug_assert!(self.contains(p));
        self.begin + (p - self.begin + self.size() - n % self.size()) % self.size()
    }
}

/// Sequential reader over a device-backed ring.
///
/// Wraps a raw `read(address, buf)` operation and exposes `read(buf)` that
/// yields the next bytes walking the ring in the chosen direction from the
/// supplied pivot (typically the end-of-profile pointer). Device reads are
/// paged to `page_size` and aligned to the region, and the supplied progress
/// counter is credited by exactly the device bytes transferred.
pub struct RingStream<F> {
    read_fn: F,
    layout: RingLayout,
    page_size: u32,
    direction: Direction,
    cursor: u32,
    cache: Vec<u8>,
    cache_off: usize,
    cache_len: usize,
}

impl<F> RingStream<F>
where
    F: FnMut(u32, &mut [u8]) -> Result<()>,
{
    pub fn new(
        read_fn: F,
        layout: RingLayout,
        page_size: u32,
        pivot: u32,
        direction: Direction,
    ) -> Result<Self> {
        if page_size == 0 || layout.size() % page_size != 0 {
            return Err(Error::InvalidArgs);
        }
        // The pivot may equal `end`: for a backward walk that means "start at
        // the newest byte", which is the same position as `begin`.
        let cursor = if pivot == layout.end { layout.begin } else { pivot };
        if !layout.contains(cursor) {
            return Err(Error::InvalidArgs);
        }
        Ok(RingStream {
            read_fn,
            layout,
            page_size,
            direction,
            cursor,
            cache: vec![0; page_size as usize],
            cache_off: 0,
            cache_len: 0,
        })
    }

    fn available(&self) -> usize {
        self.cache_len - self.cache_off
    }

    fn fill_backward(&mut self, progress: &mut Progress<'_>) -> Result<()> {
        let last = self.layout.decrement(self.cursor, 1);
        let page_rel = (last - self.layout.begin) / self.page_size;
        let page_addr = self.layout.begin + page_rel * self.page_size;
        (self.read_fn)(page_addr, &mut self.cache)?;
        progress.add(self.page_size);
        self.cache_off = 0;
        self.cache_len = (last - page_addr + 1) as usize;
        Ok(())
    }

    fn fill_forward(&mut self, progress: &mut Progress<'_>) -> Result<()> {
        let page_rel = (self.cursor - self.layout.begin) / self.page_size;
        let page_addr = self.layout.begin + page_rel * self.page_size;
        (self.read_fn)(page_addr, &mut self.cache)?;
        progress.add(self.page_size);
        self.cache_off = (self.cursor - page_addr) as usize;
        self.cache_len = self.page_size as usize;
        Ok(())
    }

    /// Read the next `buf.len()` bytes of the walk. In backward mode the
    /// buffer is filled in device order, so `buf` ends up holding the bytes
    /// immediately preceding the cursor exactly as they appear in memory.
    pub fn read(&mut self, buf: &mut [u8], progress: &mut Progress<'_>) -> Result<()> {
        let mut remaining = buf.len();
        while remaining > 0 {
            if self.available() == 0 {
                match self.direction {
                    Direction::Backward => self.fill_backward(progress)?,
                    Direction::Forward => self.fill_forward(progress)?,
                }
            }
            let take = remaining.min(self.available());
            match self.direction {
                Direction::Backward => {
                    buf[remaining - take..remaining]
                        .copy_from_slice(&self.cache[self.cache_len - take..self.cache_len]);
                    self.cache_len -= take;
                }
                Direction::Forward => {
                    let written = buf.len() - remaining;
                    buf[written..written + take]
                        .copy_from_slice(&self.cache[self.cache_off..self.cache_off + take]);
                    self.cache_off += take;
                }
            }
            remaining -= take;
            self.cursor = match self.direction {
                Direction::Backward => self.layout.decrement(self.cursor, take as u32),
                Direction::Forward => self.layout.increment(self.cursor, take as u32),
            };
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;

    #[test]
    fn distance_modes() {
        let rb = RingLayout::new(0x20, 0x100);
        assert_eq!(rb.distance(0x40, 0x40, Overlap::Empty), 0);
        assert_eq!(rb.distance(0x40, 0x40, Overlap::Full), 0xE0);
        assert_eq!(rb.distance(0x40, 0x60, Overlap::Full), 0x20);
        assert_eq!(rb.distance(0x60, 0x40, Overlap::Full), 0xC0);
    }

    #[test]
    fn increment_decrement_inverse() {
        let rb = RingLayout::new(0x20, 0x100);
        for p in (0x20..0x100).step_by(7) {
            for n in [0u32, 1, 13, 0x7F, 0xDF, 0xE0] {
                let q = rb.increment(p, n);
                assert!(rb.contains(q));
                assert_eq!(rb.decrement(q, n), p);
                let expected = if n == 0 || n == rb.size() { rb.size() } else { n };
                assert_eq!(rb.distance(p, q, Overlap::Full), expected);
            }
        }
    }

    fn fake_memory() -> Vec<u8> {
        // Value at address a is a & 0xFF, so reads identify themselves.
        (0..0x100u32).map(|a| a as u8).collect()
    }

    #[test]
    fn backward_walk_wraps_and_pages() {
        let mem = fake_memory();
        let rb = RingLayout::new(0x40, 0x80);
        let mut device_bytes = 0u32;
        let ctx = Context::new();
        let mut progress = Progress::new(&ctx, 0x40);

        let mut stream = RingStream::new(
            |addr, buf: &mut [u8]| {
                device_bytes += buf.len() as u32;
                let a = addr as usize;
                buf.copy_from_slice(&mem[a..a + buf.len()]);
                Ok(())
            },
            rb,
            16,
            0x48,
            Direction::Backward,
        )
        .unwrap();

        // First 8 bytes precede the pivot directly.
        let mut buf = [0u8; 8];
        stream.read(&mut buf, &mut progress).unwrap();
        assert_eq!(buf, [0x40, 0x41, 0x42, 0x43, 0x44, 0x45, 0x46, 0x47]);

        // The next 8 wrap around to the top of the region.
        stream.read(&mut buf, &mut progress).unwrap();
        assert_eq!(buf, [0x78, 0x79, 0x7A, 0x7B, 0x7C, 0x7D, 0x7E, 0x7F]);

        drop(stream);
        // One partial-page fill and one full page behind the wrap.
        assert_eq!(device_bytes, 32);
    }

    #[test]
    fn forward_walk_reads_in_order() {
        let mem = fake_memory();
        let rb = RingLayout::new(0x00, 0x40);
        let ctx = Context::new();
        let mut progress = Progress::new(&ctx, 0x40);

        let mut stream = RingStream::new(
            |addr, buf: &mut [u8]| {
                let a = addr as usize;
                buf.copy_from_slice(&mem[a..a + buf.len()]);
                Ok(())
            },
            rb,
            16,
            0x3C,
            Direction::Forward,
        )
        .unwrap();

        let mut buf = [0u8; 8];
        stream.read(&mut buf, &mut progress).unwrap();
        assert_eq!(buf, [0x3C, 0x3D, 0x3E, 0x3F, 0x00, 0x01, 0x02, 0x03]);
    }

    #[test]
    fn rejects_bad_geometry() {
        let rb = RingLayout::new(0x00, 0x40);
        let read = |_addr: u32, _buf: &mut [u8]| Ok(());
        assert!(matches!(
            RingStream::new(read, rb, 24, 0x00, Direction::Forward),
            Err(Error::InvalidArgs)
        ));
        let read = |_addr: u32, _buf: &mut [u8]| Ok(());
        assert!(matches!(
            RingStream::new(read, rb, 16, 0x48, Direction::Forward),
            Err(Error::InvalidArgs)
        ));
    }
}
