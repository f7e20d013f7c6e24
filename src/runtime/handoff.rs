//! Marshalling work from other threads onto the scheduler thread.
//!
//! Deferreds and scheduled calls live on one thread. Other threads reach
//! them only through this module:
//!
//! - [`Handoff::call_from_thread`] queues a `Send` closure that the scheduler
//!   runs at the start of its next turn
//! - [`Resolver`] resolves a Deferred created with
//!   [`Scheduler::deferred_from_thread`](crate::time::Scheduler::deferred_from_thread)
//!
//! Queued work is stored in a lock-free [`SegQueue`]; the wall-clock loop
//! sleeps on a condvar that every push signals.

use core::fmt;
use std::marker::PhantomData;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use crossbeam_queue::SegQueue;
use parking_lot::{Condvar, Mutex};

use crate::error::{Error, ErrorKind, Result};
use crate::observability::unhandled::{ErrorOrigin, report};
use crate::time::scheduler::SchedulerCore;
use crate::tracing_compat::trace;

type Job = Box<dyn FnOnce(&SchedulerCore) + Send>;

/// Cross-thread work queue owned by one scheduler.
pub(crate) struct HandoffQueue {
    jobs: SegQueue<Job>,
    signalled: Mutex<bool>,
    condvar: Condvar,
    /// Resolvers handed out and not yet delivered.
    outstanding: AtomicUsize,
    stop: AtomicBool,
}

impl HandoffQueue {
    pub(crate) fn new() -> Self {
        Self {
            jobs: SegQueue::new(),
            signalled: Mutex::new(false),
            condvar: Condvar::new(),
            outstanding: AtomicUsize::new(0),
            stop: AtomicBool::new(false),
        }
    }

    fn push(&self, job: Job) {
        self.jobs.push(job);
        self.notify();
    }

    fn notify(&self) {
        *self.signalled.lock() = true;
        self.condvar.notify_one();
    }

    /// Runs every queued job on the scheduler thread.
    pub(crate) fn drain(&self, core: &SchedulerCore) -> usize {
        let mut ran = 0;
        while let Some(job) = self.jobs.pop() {
            ran += 1;
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| job(core))) {
                report(Error::panicked(payload.as_ref()), ErrorOrigin::Handoff);
            }
        }
        if ran > 0 {
            trace!(jobs = ran, "drained thread hand-offs");
        }
        ran
    }

    /// Blocks until a job arrives, a stop is requested, or `timeout` elapses.
    pub(crate) fn wait(&self, timeout: Option<Duration>) {
        let mut signalled = self.signalled.lock();
        if !*signalled && self.jobs.is_empty() && !self.stop_requested() {
            match timeout {
                Some(timeout) => {
                    let _ = self.condvar.wait_for(&mut signalled, timeout);
                }
                None => self.condvar.wait(&mut signalled),
            }
        }
        *signalled = false;
    }

    pub(crate) fn has_jobs(&self) -> bool {
        !self.jobs.is_empty()
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    pub(crate) fn track_resolver(&self) {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn resolver_delivered(&self) {
        let _ = self
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    pub(crate) fn take_stop(&self) -> bool {
        self.stop.swap(false, Ordering::AcqRel)
    }

    fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}

/// A `Send` handle for reaching a scheduler from other threads.
#[derive(Clone)]
pub struct Handoff {
    pub(crate) queue: Arc<HandoffQueue>,
}

impl Handoff {
    /// Queues `f` to run on the scheduler thread at the start of its next turn.
    pub fn call_from_thread<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.queue.push(Box::new(move |_| f()));
    }

    /// Asks a running wall-clock loop to return after its current turn.
    pub fn stop(&self) {
        self.queue.stop.store(true, Ordering::Release);
        self.queue.notify();
    }
}

impl fmt::Debug for Handoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handoff")
            .field("queued", &self.queue.jobs.len())
            .field("outstanding", &self.queue.outstanding())
            .finish()
    }
}

/// Resolves a scheduler-thread Deferred from any thread.
///
/// Dropping a resolver without resolving fails its Deferred with
/// `ErrorKind::Abandoned`.
pub struct Resolver<T: Send + 'static> {
    key: usize,
    queue: Arc<HandoffQueue>,
    delivered: bool,
    _marker: PhantomData<fn(T)>,
}

impl<T: Send + 'static> Resolver<T> {
    pub(crate) fn new(key: usize, queue: Arc<HandoffQueue>) -> Self {
        queue.track_resolver();
        Self {
            key,
            queue,
            delivered: false,
            _marker: PhantomData,
        }
    }

    /// Delivers `result` to the Deferred.
    pub fn resolve(mut self, result: Result<T>) {
        self.deliver(result);
    }

    /// Delivers a success value.
    pub fn callback(self, value: T) {
        self.resolve(Ok(value));
    }

    /// Delivers an error.
    pub fn errback(self, error: Error) {
        self.resolve(Err(error));
    }

    fn deliver(&mut self, result: Result<T>) {
        self.delivered = true;
        let key = self.key;
        self.queue
            .push(Box::new(move |core| core.complete_remote::<T>(key, result)));
    }
}

impl<T: Send + 'static> Drop for Resolver<T> {
    fn drop(&mut self) {
        if !self.delivered {
            self.deliver(Err(Error::new(ErrorKind::Abandoned)
                .with_message("resolver dropped without resolving")));
        }
    }
}

impl<T: Send + 'static> fmt::Debug for Resolver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver")
            .field("key", &self.key)
            .field("delivered", &self.delivered)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send<T: Send>() {}

    #[test]
    fn handles_are_send() {
        assert_send::<Handoff>();
        assert_send::<Resolver<String>>();
    }

    #[test]
    fn wait_returns_immediately_when_signalled() {
        let queue = HandoffQueue::new();
        queue.notify();
        queue.wait(None);
        queue.wait(Some(Duration::from_millis(1)));
    }

    #[test]
    fn outstanding_never_underflows() {
        let queue = HandoffQueue::new();
        queue.resolver_delivered();
        assert_eq!(queue.outstanding(), 0);
        queue.track_resolver();
        assert_eq!(queue.outstanding(), 1);
        queue.resolver_delivered();
        assert_eq!(queue.outstanding(), 0);
    }
}
