use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::types::Event;

/// Cloneable cancellation handle. The owning side keeps the [`Context`];
/// any thread may hold a token and request cancellation.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

type EventSink = Box<dyn FnMut(Event<'_>)>;

/// Per-invocation context threaded through every driver and parser call.
///
/// Carries the caller's event sink and the shared cancellation flag. Drivers
/// consult the flag at the top of every packet send; cancellation is observed
/// at the next packet boundary.
#[derive(Default)]
pub struct Context {
    cancel: CancelToken,
    events: RefCell<Option<EventSink>>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the event sink invoked for progress, device info and vendor
    /// events during iteration.
    pub fn set_event_sink(&self, sink: impl FnMut(Event<'_>) + 'static) {
        *self.events.borrow_mut() = Some(Box::new(sink));
    }

    pub fn emit(&self, event: Event<'_>) {
        if let Some(sink) = self.events.borrow_mut().as_mut() {
            sink(event);
        }
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Checked at every packet boundary.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    #[test]
    fn cancel_token_observed() {
        let ctx = Context::new();
        assert!(ctx.check_cancelled().is_ok());
        ctx.cancel_token().cancel();
        assert!(matches!(ctx.check_cancelled(), Err(Error::Cancelled)));
    }

    #[test]
    fn events_reach_sink() {
        let ctx = Context::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        ctx.set_event_sink(move |ev| {
            if let Event::Progress { current, maximum } = ev {
                sink.borrow_mut().push((current, maximum));
            }
        });
        ctx.emit(Event::Progress {
            current: 3,
            maximum: 10,
        });
        ctx.emit(Event::Waiting);
        assert_eq!(seen.borrow().as_slice(), &[(3, 10)]);
    }
}
