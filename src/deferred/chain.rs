//! Chain links and the draining loop.
//!
//! A Deferred's chain is a queue of [`Link`]s. Draining pops links in order
//! and feeds each the current result:
//!
//! - a handler replaces the result with whatever it returns
//! - a handler that returns a pending Deferred pauses the chain; a
//!   continuation link is appended to the inner Deferred so its result is
//!   handed back when it fires
//! - a sink moves the result out and marks the Deferred consumed
//!
//! Nested hand-offs never recurse: the outer Deferred is pushed on an
//! explicit work list and drained by the same loop.

use std::panic::{AssertUnwindSafe, catch_unwind};

use super::Deferred;
use crate::error::{Error, Result};
use crate::observability::unhandled::{ErrorOrigin, report};
use crate::tracing_compat::{trace, warn};

/// What a handler hands back to the chain.
#[derive(Debug)]
pub enum Step<T: 'static> {
    /// Replace the current result.
    Ready(Result<T>),
    /// Wait for another Deferred and continue with its result.
    Wait(Deferred<T>),
}

impl<T: 'static> Step<T> {
    /// Continue with a success value.
    #[must_use]
    pub const fn ok(value: T) -> Self {
        Self::Ready(Ok(value))
    }

    /// Continue with an error.
    #[must_use]
    pub const fn err(error: Error) -> Self {
        Self::Ready(Err(error))
    }

    /// Suspend until `inner` fires.
    #[must_use]
    pub const fn wait(inner: Deferred<T>) -> Self {
        Self::Wait(inner)
    }
}

impl<T: 'static> From<Result<T>> for Step<T> {
    fn from(result: Result<T>) -> Self {
        Self::Ready(result)
    }
}

impl<T: 'static> From<Deferred<T>> for Step<T> {
    fn from(inner: Deferred<T>) -> Self {
        Self::Wait(inner)
    }
}

pub(crate) type Handler<T> = Box<dyn FnOnce(Result<T>) -> Step<T>>;
pub(crate) type Sink<T> = Box<dyn FnOnce(Result<T>)>;

pub(crate) enum Link<T: 'static> {
    Handler(Handler<T>),
    /// Terminal consumer: takes the result out of the Deferred.
    Sink(Sink<T>),
    /// Hands the result to an outer Deferred paused on this one.
    Continue(Deferred<T>),
}

/// Outcome of trying to move a result out of a Deferred.
pub(crate) enum Take<T> {
    Taken(Result<T>),
    Pending,
    Consumed,
}

enum Adopted<T: 'static> {
    Value(Result<T>),
    Waiting { kick: Option<Deferred<T>> },
}

fn consumed_error() -> Error {
    Error::invalid_state("deferred result was already consumed")
}

impl<T: 'static> Deferred<T> {
    pub(crate) fn push_link(&self, link: Link<T>) {
        let ready = {
            let mut inner = self.inner.borrow_mut();
            inner.chain.push_back(link);
            inner.called
        };
        if ready {
            self.run_callbacks();
        }
    }

    /// Drains this Deferred and every outer Deferred it hands results to.
    pub(crate) fn run_callbacks(&self) {
        let mut work = vec![self.clone()];
        while let Some(current) = work.pop() {
            current.drain(&mut work);
        }
    }

    fn drain(&self, work: &mut Vec<Self>) {
        loop {
            let link = {
                let mut inner = self.inner.borrow_mut();
                if !inner.called || inner.paused > 0 || inner.running {
                    return;
                }
                match inner.chain.pop_front() {
                    Some(link) => link,
                    None => return,
                }
            };

            match link {
                Link::Handler(handler) => {
                    let input = {
                        let mut inner = self.inner.borrow_mut();
                        if inner.consumed {
                            warn!(
                                deferred = %inner.id,
                                "handler attached after the result was consumed; dropping it"
                            );
                            continue;
                        }
                        inner.running = true;
                        inner
                            .result
                            .take()
                            .unwrap_or_else(|| Err(Error::internal("resolved deferred has no result")))
                    };

                    let step = catch_unwind(AssertUnwindSafe(move || handler(input)))
                        .unwrap_or_else(|payload| Step::Ready(Err(Error::panicked(payload.as_ref()))));

                    let adopted = match step {
                        Step::Ready(result) => Adopted::Value(result),
                        Step::Wait(next) => self.adopt(next),
                    };

                    let mut inner = self.inner.borrow_mut();
                    inner.running = false;
                    match adopted {
                        Adopted::Value(result) => inner.result = Some(result),
                        Adopted::Waiting { kick } => {
                            trace!(deferred = %inner.id, "chain paused on inner deferred");
                            if let Some(next) = kick {
                                work.push(next);
                            }
                        }
                    }
                }
                Link::Sink(sink) => {
                    let (id, input) = {
                        let mut inner = self.inner.borrow_mut();
                        inner.running = true;
                        let input = if inner.consumed {
                            Err(consumed_error())
                        } else {
                            inner.consumed = true;
                            inner
                                .result
                                .take()
                                .unwrap_or_else(|| Err(Error::internal("resolved deferred has no result")))
                        };
                        (inner.id, input)
                    };
                    if let Err(payload) = catch_unwind(AssertUnwindSafe(move || sink(input))) {
                        report(Error::panicked(payload.as_ref()), ErrorOrigin::Sink(id));
                    }
                    self.inner.borrow_mut().running = false;
                }
                Link::Continue(outer) => {
                    let input = {
                        let mut inner = self.inner.borrow_mut();
                        if inner.consumed {
                            Err(consumed_error())
                        } else {
                            inner.consumed = true;
                            inner
                                .result
                                .take()
                                .unwrap_or_else(|| Err(Error::internal("resolved deferred has no result")))
                        }
                    };
                    outer.accept(input);
                    work.push(outer);
                }
            }
        }
    }

    /// Takes the result of a handler-returned Deferred, or parks `self` on it.
    fn adopt(&self, next: Self) -> Adopted<T> {
        if self.ptr_eq(&next) {
            return Adopted::Value(Err(Error::invalid_state(
                "handler returned the deferred it is attached to",
            )));
        }
        match next.try_take_result() {
            Take::Taken(result) => Adopted::Value(result),
            Take::Consumed => Adopted::Value(Err(consumed_error())),
            Take::Pending => {
                {
                    let mut inner = self.inner.borrow_mut();
                    inner.paused += 1;
                    inner.waiting_on = Some(next.downgrade());
                }
                let kick = {
                    let mut inner = next.inner.borrow_mut();
                    inner.chain.push_back(Link::Continue(self.clone()));
                    // Resolved but not yet drained: drain it from this loop.
                    let idle = inner.called && inner.paused == 0 && !inner.running;
                    idle.then(|| next.clone())
                };
                Adopted::Waiting { kick }
            }
        }
    }

    /// Receives the result of the inner Deferred this one was paused on.
    fn accept(&self, result: Result<T>) {
        let mut inner = self.inner.borrow_mut();
        inner.result = Some(result);
        inner.paused = inner.paused.saturating_sub(1);
        inner.waiting_on = None;
    }

    /// Moves the result out if the chain is quiescent.
    pub(crate) fn try_take_result(&self) -> Take<T> {
        let mut inner = self.inner.borrow_mut();
        if inner.consumed {
            return Take::Consumed;
        }
        if !inner.called || inner.paused > 0 || inner.running || !inner.chain.is_empty() {
            return Take::Pending;
        }
        match inner.result.take() {
            Some(result) => {
                inner.consumed = true;
                Take::Taken(result)
            }
            None => Take::Pending,
        }
    }
}
