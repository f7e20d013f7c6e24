//! Awaiting a Deferred.
//!
//! `Deferred<T>` implements [`IntoFuture`], so a coroutine driven by
//! [`ensure_deferred`](crate::coroutine::ensure_deferred) can write
//! `let v = d.await?;`. Awaiting moves the result out of the Deferred.
//!
//! When the awaiting coroutine is known, resolution resumes it directly;
//! otherwise the stored [`Waker`] is used.

use core::fmt;
use std::cell::RefCell;
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use super::{Deferred, Take, WeakDeferred};
use crate::coroutine;
use crate::error::{Error, Result};
use crate::types::CancelReason;

struct AwaitSlot<T> {
    result: Option<Result<T>>,
    waker: Option<Waker>,
}

enum State<T: 'static> {
    Start(Deferred<T>),
    Waiting {
        slot: Rc<RefCell<AwaitSlot<T>>>,
        target: WeakDeferred<T>,
    },
    Done,
}

/// Future returned by `Deferred::into_future`.
#[must_use = "futures do nothing unless awaited"]
pub struct DeferredFuture<T: 'static> {
    state: State<T>,
}

impl<T: 'static> IntoFuture for Deferred<T> {
    type Output = Result<T>;
    type IntoFuture = DeferredFuture<T>;

    fn into_future(self) -> Self::IntoFuture {
        DeferredFuture {
            state: State::Start(self),
        }
    }
}

impl<T: 'static> fmt::Debug for DeferredFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.state {
            State::Start(_) => "start",
            State::Waiting { .. } => "waiting",
            State::Done => "done",
        };
        f.debug_struct("DeferredFuture").field("state", &state).finish()
    }
}

fn register_cancel_hook<T: 'static>(target: &WeakDeferred<T>) {
    let target = target.clone();
    coroutine::on_cancel(move || {
        if let Some(d) = target.upgrade() {
            d.cancel_with(CancelReason::parent_cancelled());
        }
    });
}

impl<T: 'static> Future for DeferredFuture<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        match std::mem::replace(&mut this.state, State::Done) {
            State::Start(d) => match d.try_take_result() {
                Take::Taken(result) => Poll::Ready(result),
                Take::Consumed => Poll::Ready(Err(Error::invalid_state(
                    "awaited deferred was already consumed",
                ))),
                Take::Pending => {
                    let slot = Rc::new(RefCell::new(AwaitSlot {
                        result: None,
                        waker: Some(cx.waker().clone()),
                    }));
                    let target = d.downgrade();
                    register_cancel_hook(&target);
                    this.state = State::Waiting {
                        slot: Rc::clone(&slot),
                        target,
                    };

                    let task = coroutine::current();
                    d.add_sink(move |result| {
                        let waker = {
                            let mut slot = slot.borrow_mut();
                            slot.result = Some(result);
                            slot.waker.take()
                        };
                        match task {
                            Some(task) => task.resume(),
                            None => {
                                if let Some(waker) = waker {
                                    waker.wake();
                                }
                            }
                        }
                    });

                    // The sink may have run synchronously.
                    let ready = match &this.state {
                        State::Waiting { slot, .. } => slot.borrow_mut().result.take(),
                        _ => None,
                    };
                    match ready {
                        Some(result) => {
                            this.state = State::Done;
                            Poll::Ready(result)
                        }
                        None => Poll::Pending,
                    }
                }
            },
            State::Waiting { slot, target } => {
                let ready = {
                    let mut inner = slot.borrow_mut();
                    match inner.result.take() {
                        Some(result) => Some(result),
                        None => {
                            inner.waker = Some(cx.waker().clone());
                            None
                        }
                    }
                };
                match ready {
                    Some(result) => Poll::Ready(result),
                    None => {
                        register_cancel_hook(&target);
                        this.state = State::Waiting { slot, target };
                        Poll::Pending
                    }
                }
            }
            State::Done => Poll::Ready(Err(Error::invalid_state(
                "deferred future polled after completion",
            ))),
        }
    }
}
