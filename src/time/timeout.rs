//! Timeouts and delayed results built on a [`Clock`].

use std::cell::{Cell, RefCell};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::Rc;
use std::time::Duration;

use super::delayed_call::DelayedCall;
use super::scheduler::Clock;
use crate::deferred::{Deferred, Link, Step};
use crate::error::{Error, Result};
use crate::tracing_compat::debug;
use crate::types::CancelReason;

/// Turns the cancellation a timeout caused into a `TimedOut` error.
fn timed_out_error<T>(result: Result<T>, timeout: Duration) -> Result<T> {
    match result {
        Err(err) if err.is_cancelled() => Err(Error::timed_out(timeout)),
        other => other,
    }
}

impl<T: 'static> Deferred<T> {
    /// Cancels this Deferred if it has not fired within `timeout`.
    ///
    /// The cancellation reaches later handlers as an
    /// [`ErrorKind::TimedOut`](crate::ErrorKind::TimedOut) error. If the
    /// Deferred fires first the timer is cancelled.
    pub fn add_timeout<C: Clock>(&self, timeout: Duration, clock: &C) -> &Self {
        self.add_timeout_with(timeout, clock, timed_out_error)
    }

    /// Like [`add_timeout`](Self::add_timeout), with a custom hook for the
    /// timed-out case.
    ///
    /// `on_timeout` runs only when the timer fired. It receives the result
    /// the cancellation produced (normally a `Cancelled` error) and the
    /// timeout, and its return value continues down the chain.
    pub fn add_timeout_with<C, F>(&self, timeout: Duration, clock: &C, on_timeout: F) -> &Self
    where
        C: Clock,
        F: FnOnce(Result<T>, Duration) -> Result<T> + 'static,
    {
        let fired = Rc::new(Cell::new(false));
        let target = self.downgrade();
        let call = {
            let fired = Rc::clone(&fired);
            clock.schedule(
                timeout,
                Box::new(move || {
                    fired.set(true);
                    if let Some(d) = target.upgrade() {
                        debug!(deferred = %d.id(), timeout = ?timeout, "deferred timed out");
                        d.cancel_with(CancelReason::timeout());
                    }
                }),
            )
        };
        self.push_link(Link::Handler(Box::new(move |result| {
            if call.active() {
                let _ = call.cancel();
            }
            if fired.get() {
                Step::Ready(on_timeout(result, timeout))
            } else {
                Step::Ready(result)
            }
        })));
        self
    }
}

/// Returns a Deferred that fires with the result of `f` after `delay`.
///
/// Cancelling the Deferred before then cancels the scheduled call, and `f`
/// never runs. A panic in `f` fails the Deferred.
#[track_caller]
pub fn defer_later<T, C, F>(clock: &C, delay: Duration, f: F) -> Deferred<T>
where
    T: 'static,
    C: Clock,
    F: FnOnce() -> Result<T> + 'static,
{
    let pending: Rc<RefCell<Option<DelayedCall>>> = Rc::new(RefCell::new(None));
    let d = Deferred::with_canceller({
        let pending = Rc::clone(&pending);
        move |_| {
            let call = pending.borrow_mut().take();
            if let Some(call) = call {
                let _ = call.cancel();
            }
        }
    });
    let target = d.clone();
    let slot = Rc::clone(&pending);
    let call = clock.schedule(
        delay,
        Box::new(move || {
            slot.borrow_mut().take();
            let result = catch_unwind(AssertUnwindSafe(f))
                .unwrap_or_else(|payload| Err(Error::panicked(payload.as_ref())));
            let _ = target.resolve(result);
        }),
    );
    *pending.borrow_mut() = Some(call);
    d
}
