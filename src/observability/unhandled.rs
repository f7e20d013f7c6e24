//! Reporting of errors nobody handled.
//!
//! An unhandled error is produced when:
//!
//! - a Deferred is dropped while its result is an error that no handler consumed
//! - a scheduled call panics while the scheduler fires it
//! - a terminal sink attached with `add_sink` panics
//! - a closure handed over from another thread panics
//!
//! Each report is logged at `error` level. Tests that want to assert on
//! reports instead of reading logs open a [`CaptureGuard`] with
//! [`capture_unhandled`]; while it is alive every report on this thread is
//! also recorded in the guard.

use core::fmt;
use std::cell::RefCell;

use crate::error::Error;
use crate::tracing_compat::error;
use crate::types::{CallId, DeferredId};

/// Where an unhandled error surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorOrigin {
    /// A Deferred was dropped holding an unconsumed error.
    Deferred(DeferredId),
    /// A scheduled call panicked.
    ScheduledCall(CallId),
    /// A terminal sink panicked while consuming a result.
    Sink(DeferredId),
    /// A closure handed over from another thread panicked.
    Handoff,
}

impl fmt::Display for ErrorOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deferred(id) => write!(f, "{id}"),
            Self::ScheduledCall(id) => write!(f, "{id}"),
            Self::Sink(id) => write!(f, "sink of {id}"),
            Self::Handoff => write!(f, "thread hand-off"),
        }
    }
}

/// One captured report.
#[derive(Debug, Clone)]
pub struct UnhandledError {
    /// Where the error surfaced.
    pub origin: ErrorOrigin,
    /// The error itself.
    pub error: Error,
}

thread_local! {
    static CAPTURE: RefCell<Option<Vec<UnhandledError>>> = const { RefCell::new(None) };
}

/// Reports an unhandled error.
pub(crate) fn report(err: Error, origin: ErrorOrigin) {
    error!(origin = %origin, error = %err, "unhandled error");
    // try_with: reports can happen while thread locals are being torn down.
    let _ = CAPTURE.try_with(|slot| {
        if let Ok(mut slot) = slot.try_borrow_mut() {
            if let Some(captured) = slot.as_mut() {
                captured.push(UnhandledError { origin, error: err });
            }
        }
    });
}

/// Starts capturing unhandled errors on the current thread.
///
/// Guards nest: dropping a guard restores whatever capture was active when it
/// was opened, discarding the reports it collected.
#[must_use = "capturing stops when the guard is dropped"]
pub fn capture_unhandled() -> CaptureGuard {
    let previous = CAPTURE.with(|slot| slot.borrow_mut().replace(Vec::new()));
    CaptureGuard { previous }
}

/// Guard returned by [`capture_unhandled`].
#[derive(Debug)]
pub struct CaptureGuard {
    previous: Option<Vec<UnhandledError>>,
}

impl CaptureGuard {
    /// Takes the reports collected so far.
    pub fn take(&self) -> Vec<UnhandledError> {
        CAPTURE.with(|slot| {
            slot.borrow_mut()
                .as_mut()
                .map(std::mem::take)
                .unwrap_or_default()
        })
    }

    /// Returns the number of reports collected and not yet taken.
    #[must_use]
    pub fn len(&self) -> usize {
        CAPTURE.with(|slot| slot.borrow().as_ref().map_or(0, Vec::len))
    }

    /// Returns true if nothing has been reported since the last `take`.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for CaptureGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        let _ = CAPTURE.try_with(|slot| {
            if let Ok(mut slot) = slot.try_borrow_mut() {
                *slot = previous;
            }
        });
    }
}
