//! Cooperative synchronization built on Deferreds.
//!
//! Nothing here blocks. Acquiring a lock or a semaphore token, or taking an
//! item from a queue, returns a Deferred that fires once the resource is
//! available. Waiters are served in FIFO order; cancelling a waiter's
//! Deferred removes it from the line.

use core::fmt;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::Rc;

use super::{Chainable, Deferred, Step};
use crate::error::{Error, ErrorKind, Result};
use crate::tracing_compat::trace;

trait Waiters<T: 'static> {
    fn waiters(&mut self) -> &mut VecDeque<Deferred<T>>;
}

/// A Deferred that leaves the waiter line when cancelled.
fn waiter<S, T>(state: &Rc<RefCell<S>>) -> Deferred<T>
where
    S: Waiters<T> + 'static,
    T: 'static,
{
    let weak = Rc::downgrade(state);
    Deferred::with_canceller(move |d| {
        if let Some(state) = weak.upgrade() {
            state.borrow_mut().waiters().retain(|w| !w.ptr_eq(d));
            trace!(deferred = %d.id(), "waiter cancelled");
        }
    })
}

/// Runs `f` once `acquired` fires and calls `release` when its Deferred does.
fn run_guarded<T, F, R>(acquired: Deferred<()>, f: F, release: R) -> Deferred<T>
where
    T: 'static,
    F: FnOnce() -> Deferred<T> + 'static,
    R: FnOnce() + 'static,
{
    acquired.then(move |result| match result {
        Ok(()) => {
            let body = catch_unwind(AssertUnwindSafe(f))
                .unwrap_or_else(|payload| Deferred::fail(Error::panicked(payload.as_ref())));
            body.add_both(move |result| {
                release();
                result
            });
            Step::Wait(body)
        }
        Err(err) => Step::Ready(Err(err)),
    })
}

struct LockState {
    locked: bool,
    waiting: VecDeque<Deferred<()>>,
}

impl Waiters<()> for LockState {
    fn waiters(&mut self) -> &mut VecDeque<Deferred<()>> {
        &mut self.waiting
    }
}

/// A mutual-exclusion lock for cooperative code.
///
/// Cloning produces another handle to the same lock.
#[derive(Clone)]
pub struct DeferredLock {
    state: Rc<RefCell<LockState>>,
}

impl DeferredLock {
    /// Creates an unlocked lock.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(LockState {
                locked: false,
                waiting: VecDeque::new(),
            })),
        }
    }

    /// Returns true while some holder has the lock.
    #[must_use]
    pub fn locked(&self) -> bool {
        self.state.borrow().locked
    }

    /// Returns a Deferred that fires when the lock is acquired.
    pub fn acquire(&self) -> Deferred<()> {
        let d = waiter(&self.state);
        let acquired = {
            let mut st = self.state.borrow_mut();
            if st.locked {
                st.waiting.push_back(d.clone());
                false
            } else {
                st.locked = true;
                true
            }
        };
        if acquired {
            let _ = d.callback(());
        }
        d
    }

    /// Releases the lock, handing it to the next waiter if there is one.
    ///
    /// # Errors
    ///
    /// `InvalidState` if the lock is not held.
    pub fn release(&self) -> Result<()> {
        let next = {
            let mut st = self.state.borrow_mut();
            if !st.locked {
                return Err(Error::invalid_state("release of an unlocked lock"));
            }
            let next = st.waiting.pop_front();
            st.locked = next.is_some();
            next
        };
        if let Some(next) = next {
            let _ = next.callback(());
        }
        Ok(())
    }

    /// Runs `f` while holding the lock and releases it when `f`'s Deferred
    /// fires.
    pub fn run<T, F>(&self, f: F) -> Deferred<T>
    where
        T: 'static,
        F: FnOnce() -> Deferred<T> + 'static,
    {
        let lock = self.clone();
        run_guarded(self.acquire(), f, move || {
            let _ = lock.release();
        })
    }
}

impl Default for DeferredLock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for DeferredLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.state.borrow();
        f.debug_struct("DeferredLock")
            .field("locked", &st.locked)
            .field("waiting", &st.waiting.len())
            .finish()
    }
}

struct SemaphoreState {
    tokens: usize,
    limit: usize,
    waiting: VecDeque<Deferred<()>>,
}

impl Waiters<()> for SemaphoreState {
    fn waiters(&mut self) -> &mut VecDeque<Deferred<()>> {
        &mut self.waiting
    }
}

/// A counting semaphore for cooperative code.
#[derive(Clone)]
pub struct DeferredSemaphore {
    state: Rc<RefCell<SemaphoreState>>,
}

impl DeferredSemaphore {
    /// Creates a semaphore with `tokens` tokens. There is always at least one.
    #[must_use]
    pub fn new(tokens: usize) -> Self {
        let tokens = tokens.max(1);
        Self {
            state: Rc::new(RefCell::new(SemaphoreState {
                tokens,
                limit: tokens,
                waiting: VecDeque::new(),
            })),
        }
    }

    /// Returns the number of tokens currently available.
    #[must_use]
    pub fn tokens(&self) -> usize {
        self.state.borrow().tokens
    }

    /// Returns the total number of tokens.
    #[must_use]
    pub fn limit(&self) -> usize {
        self.state.borrow().limit
    }

    /// Returns a Deferred that fires when a token is taken.
    pub fn acquire(&self) -> Deferred<()> {
        let d = waiter(&self.state);
        let acquired = {
            let mut st = self.state.borrow_mut();
            if st.tokens == 0 {
                st.waiting.push_back(d.clone());
                false
            } else {
                st.tokens -= 1;
                true
            }
        };
        if acquired {
            let _ = d.callback(());
        }
        d
    }

    /// Returns a token, handing it to the next waiter if there is one.
    ///
    /// # Errors
    ///
    /// `InvalidState` if every token is already available.
    pub fn release(&self) -> Result<()> {
        let next = {
            let mut st = self.state.borrow_mut();
            if st.tokens >= st.limit {
                return Err(Error::invalid_state(
                    "semaphore released more often than acquired",
                ));
            }
            match st.waiting.pop_front() {
                Some(next) => Some(next),
                None => {
                    st.tokens += 1;
                    None
                }
            }
        };
        if let Some(next) = next {
            let _ = next.callback(());
        }
        Ok(())
    }

    /// Runs `f` while holding a token and returns it when `f`'s Deferred
    /// fires.
    pub fn run<T, F>(&self, f: F) -> Deferred<T>
    where
        T: 'static,
        F: FnOnce() -> Deferred<T> + 'static,
    {
        let sem = self.clone();
        run_guarded(self.acquire(), f, move || {
            let _ = sem.release();
        })
    }
}

impl fmt::Debug for DeferredSemaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.state.borrow();
        f.debug_struct("DeferredSemaphore")
            .field("tokens", &st.tokens)
            .field("limit", &st.limit)
            .field("waiting", &st.waiting.len())
            .finish()
    }
}

struct QueueState<T: 'static> {
    pending: VecDeque<T>,
    waiting: VecDeque<Deferred<T>>,
    size: Option<usize>,
    backlog: Option<usize>,
}

impl<T: 'static> Waiters<T> for QueueState<T> {
    fn waiters(&mut self) -> &mut VecDeque<Deferred<T>> {
        &mut self.waiting
    }
}

/// An event-driven FIFO queue.
///
/// `get` returns a Deferred that fires with the next item. `size` bounds
/// the number of buffered items and `backlog` bounds the number of waiting
/// getters.
#[derive(Clone)]
pub struct DeferredQueue<T: 'static> {
    state: Rc<RefCell<QueueState<T>>>,
}

impl<T: 'static> DeferredQueue<T> {
    /// Creates an unbounded queue.
    #[must_use]
    pub fn new() -> Self {
        Self::with_limits(None, None)
    }

    /// Creates a queue with optional item and getter limits.
    #[must_use]
    pub fn with_limits(size: Option<usize>, backlog: Option<usize>) -> Self {
        Self {
            state: Rc::new(RefCell::new(QueueState {
                pending: VecDeque::new(),
                waiting: VecDeque::new(),
                size,
                backlog,
            })),
        }
    }

    /// Returns the number of buffered items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.borrow().pending.len()
    }

    /// Returns true if no items are buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of getters waiting for an item.
    #[must_use]
    pub fn waiting(&self) -> usize {
        self.state.borrow().waiting.len()
    }

    /// Hands `item` to the oldest waiting getter, or buffers it.
    ///
    /// # Errors
    ///
    /// `QueueOverflow` if nobody is waiting and the buffer is full.
    pub fn put(&self, item: T) -> Result<()> {
        let getter = {
            let mut st = self.state.borrow_mut();
            match st.waiting.pop_front() {
                Some(getter) => getter,
                None => {
                    if let Some(size) = st.size.filter(|&size| st.pending.len() >= size) {
                        return Err(Error::new(ErrorKind::QueueOverflow)
                            .with_message(format!("queue is full ({size} items)")));
                    }
                    st.pending.push_back(item);
                    return Ok(());
                }
            }
        };
        let _ = getter.callback(item);
        Ok(())
    }

    /// Returns a Deferred that fires with the next item.
    ///
    /// # Errors
    ///
    /// `QueueUnderflow` if the queue is empty and the backlog of waiting
    /// getters is full.
    pub fn get(&self) -> Result<Deferred<T>> {
        let d = waiter(&self.state);
        let item = {
            let mut st = self.state.borrow_mut();
            match st.pending.pop_front() {
                Some(item) => Some(item),
                None => {
                    if let Some(backlog) = st.backlog.filter(|&backlog| st.waiting.len() >= backlog)
                    {
                        return Err(Error::new(ErrorKind::QueueUnderflow)
                            .with_message(format!("too many waiting getters ({backlog})")));
                    }
                    st.waiting.push_back(d.clone());
                    None
                }
            }
        };
        if let Some(item) = item {
            let _ = d.callback(item);
        }
        Ok(d)
    }
}

impl<T: 'static> Default for DeferredQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> fmt::Debug for DeferredQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.state.borrow();
        f.debug_struct("DeferredQueue")
            .field("pending", &st.pending.len())
            .field("waiting", &st.waiting.len())
            .field("size", &st.size)
            .field("backlog", &st.backlog)
            .finish()
    }
}
