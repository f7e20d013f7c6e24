//! Driving `async` code with Deferreds.
//!
//! [`ensure_deferred`] turns a `Future<Output = Result<T>>` into a
//! [`Deferred<T>`]. The future is polled immediately, up to its first
//! suspension. Every `.await` on a pending Deferred registers a terminal
//! consumer on it; when that Deferred fires, the coroutine is resumed
//! synchronously from inside the resolver's call.
//!
//! Resumption that happens while the coroutine is already being polled (an
//! awaited Deferred resolved from inside the coroutine itself) only marks it
//! notified; the driver loop re-polls instead of recursing, so long runs of
//! already-resolved awaits use constant stack.
//!
//! Cancelling the returned Deferred cancels whatever Deferred the coroutine
//! is suspended on, then drops the future. Its destructors run and it is
//! never polled again.
//!
//! Only wakeups delivered through Deferreds, or issued synchronously while
//! the coroutine is being polled, resume it. A foreign future that stores
//! the waker and wakes it later from elsewhere is not re-polled.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll, Wake, Waker};

use crate::deferred::Deferred;
use crate::error::{Error, Result};
use crate::tracing_compat::{debug, trace};

/// Something that can be resumed when a Deferred it waits on fires.
pub(crate) trait Resume {
    fn resume(self: Rc<Self>);
    fn push_cancel_hook(&self, hook: CancelHook);
}

type CancelHook = Box<dyn FnOnce()>;

thread_local! {
    static CURRENT: RefCell<Option<Rc<dyn Resume>>> = const { RefCell::new(None) };
}

/// Returns the coroutine being polled on this thread, if any.
pub(crate) fn current() -> Option<Rc<dyn Resume>> {
    CURRENT.with(|current| current.borrow().clone())
}

/// Registers a hook run if the current coroutine is cancelled while suspended.
pub(crate) fn on_cancel(hook: impl FnOnce() + 'static) {
    if let Some(task) = current() {
        task.push_cancel_hook(Box::new(hook));
    }
}

struct CurrentGuard {
    previous: Option<Rc<dyn Resume>>,
}

impl CurrentGuard {
    fn enter(task: Rc<dyn Resume>) -> Self {
        let previous = CURRENT.with(|current| current.borrow_mut().replace(task));
        Self { previous }
    }
}

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        let _ = CURRENT.try_with(|current| *current.borrow_mut() = previous);
    }
}

#[derive(Default)]
struct WakeFlag(AtomicBool);

impl WakeFlag {
    fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }
}

impl Wake for WakeFlag {
    fn wake(self: Arc<Self>) {
        self.0.store(true, Ordering::Release);
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.0.store(true, Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Polling,
    Notified,
    Done,
    Cancelled,
}

type BoxedFuture<T> = Pin<Box<dyn Future<Output = Result<T>>>>;

struct Coroutine<T: 'static> {
    future: RefCell<Option<BoxedFuture<T>>>,
    state: Cell<State>,
    cancel_hooks: RefCell<Vec<CancelHook>>,
    output: Deferred<T>,
    wake_flag: Arc<WakeFlag>,
}

impl<T: 'static> Coroutine<T> {
    fn run(self: &Rc<Self>) {
        loop {
            self.state.set(State::Polling);
            self.cancel_hooks.borrow_mut().clear();
            let Some(mut future) = self.future.borrow_mut().take() else {
                return;
            };

            let waker = Waker::from(Arc::clone(&self.wake_flag));
            let mut cx = Context::from_waker(&waker);
            let polled = {
                let _guard = CurrentGuard::enter(Rc::clone(self) as Rc<dyn Resume>);
                catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx)))
            };

            if self.state.get() == State::Cancelled {
                drop(future);
                return;
            }

            match polled {
                Ok(Poll::Ready(result)) => {
                    drop(future);
                    self.state.set(State::Done);
                    trace!(deferred = %self.output.id(), ok = result.is_ok(), "coroutine finished");
                    let _ = self.output.resolve(result);
                    return;
                }
                Err(payload) => {
                    drop(future);
                    self.state.set(State::Done);
                    let err = Error::panicked(payload.as_ref());
                    debug!(deferred = %self.output.id(), error = %err, "coroutine panicked");
                    let _ = self.output.errback(err);
                    return;
                }
                Ok(Poll::Pending) => {
                    *self.future.borrow_mut() = Some(future);
                    let woken = self.wake_flag.take();
                    if self.state.get() == State::Notified || woken {
                        continue;
                    }
                    self.state.set(State::Idle);
                    return;
                }
            }
        }
    }

    fn cancel(self: &Rc<Self>) {
        if matches!(self.state.get(), State::Done | State::Cancelled) {
            return;
        }
        self.state.set(State::Cancelled);
        trace!(deferred = %self.output.id(), "coroutine cancelled");
        let hooks = std::mem::take(&mut *self.cancel_hooks.borrow_mut());
        for hook in hooks {
            hook();
        }
        let future = self.future.borrow_mut().take();
        drop(future);
    }
}

impl<T: 'static> Resume for Coroutine<T> {
    fn resume(self: Rc<Self>) {
        match self.state.get() {
            State::Idle => self.run(),
            State::Polling => self.state.set(State::Notified),
            State::Notified | State::Done | State::Cancelled => {}
        }
    }

    fn push_cancel_hook(&self, hook: CancelHook) {
        self.cancel_hooks.borrow_mut().push(hook);
    }
}

/// Drives `future` and exposes its outcome as a Deferred.
///
/// The future starts running before this function returns. `Ok` completes
/// the Deferred with a value, `Err` or a panic fails it.
#[track_caller]
pub fn ensure_deferred<T, F>(future: F) -> Deferred<T>
where
    T: 'static,
    F: Future<Output = Result<T>> + 'static,
{
    let task: Rc<Coroutine<T>> = Rc::new_cyclic(|weak: &Weak<Coroutine<T>>| {
        let weak = weak.clone();
        let output = Deferred::with_canceller(move |_| {
            if let Some(task) = weak.upgrade() {
                task.cancel();
            }
        });
        Coroutine {
            future: RefCell::new(Some(Box::pin(future))),
            state: Cell::new(State::Idle),
            cancel_hooks: RefCell::new(Vec::new()),
            output,
            wake_flag: Arc::new(WakeFlag::default()),
        }
    });
    let output = task.output.clone();
    task.run();
    output
}

impl<T: 'static> Deferred<T> {
    /// Same as [`ensure_deferred`].
    #[track_caller]
    pub fn from_future<F>(future: F) -> Self
    where
        F: Future<Output = Result<T>> + 'static,
    {
        ensure_deferred(future)
    }
}
