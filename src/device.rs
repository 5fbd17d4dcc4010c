//! The per-family download contract and the helpers every driver shares.

use chrono::NaiveDateTime;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::types::Event;

/// Per-dive callback: `(blob, fingerprint)` where the fingerprint is a
/// subslice of the blob. Return `false` to stop the iteration. The slices
/// are valid only for the duration of the call.
pub type DiveCallback<'a> = dyn FnMut(&[u8], &[u8]) -> bool + 'a;

/// A bound, identified dive computer.
///
/// Obtained from a family `open`, which performs the handshake and picks the
/// model's layout descriptor. The transport is released when the driver is
/// dropped.
pub trait Device {
    /// Store the incremental-download watermark. Empty bytes clear it.
    fn set_fingerprint(&mut self, fingerprint: &[u8]);

    /// Download dives newest-first, invoking the callback per dive, stopping
    /// when the callback returns `false` or a dive's fingerprint equals the
    /// stored watermark.
    fn foreach(&mut self, callback: &mut DiveCallback<'_>) -> Result<()>;

    /// Raw memory read, for families that expose it.
    fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<()> {
        let _ = (address, buf);
        Err(Error::Unsupported)
    }

    /// Raw memory write; only the demarcated settings paths use this.
    fn write(&mut self, address: u32, data: &[u8]) -> Result<()> {
        let _ = (address, data);
        Err(Error::Unsupported)
    }

    /// Bulk memory image, used by diagnostic flows.
    fn dump(&mut self) -> Result<Vec<u8>> {
        Err(Error::Unsupported)
    }

    /// Set the device clock.
    fn timesync(&mut self, datetime: &NaiveDateTime) -> Result<()> {
        let _ = datetime;
        Err(Error::Unsupported)
    }
}

/// Stored watermark handling shared by every driver: empty clears.
pub(crate) fn store_fingerprint(slot: &mut Option<Vec<u8>>, fingerprint: &[u8]) {
    if fingerprint.is_empty() {
        *slot = None;
    } else {
        *slot = Some(fingerprint.to_vec());
    }
}

/// Byte-for-byte watermark comparison.
pub(crate) fn fingerprint_matches(slot: &Option<Vec<u8>>, fingerprint: &[u8]) -> bool {
    matches!(slot, Some(stored) if stored.as_slice() == fingerprint)
}

/// Monotonic progress accounting, emitted through the context.
///
/// `maximum` may only grow (more work can be discovered mid-iteration);
/// `current` is clamped to it.
pub struct Progress<'a> {
    ctx: &'a Context,
    current: u32,
    maximum: u32,
}

impl<'a> Progress<'a> {
    /// Emits the initial `Progress { 0, maximum }` event.
    pub fn new(ctx: &'a Context, maximum: u32) -> Self {
        let progress = Progress {
            ctx,
            current: 0,
            maximum,
        };
        progress.emit();
        progress
    }

    fn emit(&self) {
        self.ctx.emit(Event::Progress {
            current: self.current,
            maximum: self.maximum,
        });
    }

    pub fn grow_maximum(&mut self, maximum: u32) {
        if maximum > self.maximum {
            self.maximum = maximum;
            self.emit();
        }
    }

    /// Credit `n` transferred bytes (or work units).
    pub fn add(&mut self, n: u32) {
        self.current = (self.current.saturating_add(n)).min(self.maximum);
        self.emit();
    }

    pub fn finish(&mut self) {
        self.current = self.maximum;
        self.emit();
    }

    pub fn current(&self) -> u32 {
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn watermark_semantics() {
        let mut slot = None;
        store_fingerprint(&mut slot, &[1, 2, 3, 4]);
        assert!(fingerprint_matches(&slot, &[1, 2, 3, 4]));
        assert!(!fingerprint_matches(&slot, &[1, 2, 3]));
        store_fingerprint(&mut slot, &[]);
        assert!(slot.is_none());
        assert!(!fingerprint_matches(&slot, &[]));
    }

    #[test]
    fn progress_is_monotonic_and_clamped() {
        let ctx = Context::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        ctx.set_event_sink(move |ev| {
            if let Event::Progress { current, maximum } = ev {
                sink.borrow_mut().push((current, maximum));
            }
        });

        let mut progress = Progress::new(&ctx, 100);
        progress.add(40);
        progress.grow_maximum(50); // smaller: ignored
        progress.grow_maximum(200);
        progress.add(300); // clamped
        progress.finish();

        let events = seen.borrow();
        assert_eq!(
            events.as_slice(),
            &[(0, 100), (40, 100), (40, 200), (200, 200), (200, 200)]
        );
        for pair in events.windows(2) {
            assert!(pair[1].0 >= pair[0].0);
            assert!(pair[1].1 >= pair[0].1);
        }
    }
}
