//! The scheduler: timed calls over an injected time source.
//!
//! A [`Scheduler`] owns an ordered set of pending [`DelayedCall`]s. Calls
//! fire in non-decreasing time order; calls with equal times fire in the
//! order they were scheduled, reset or delayed.
//!
//! Nothing fires on its own. The owner drives the scheduler:
//!
//! - virtual time: [`Scheduler::advance`] and [`Scheduler::pump`]
//! - any clock: [`Scheduler::run_due`] fires what is due now
//! - wall clock: [`Scheduler::run_until_idle`] sleeps until the next deadline
//!
//! Every turn starts by running work handed over from other threads.
//!
//! # Example
//!
//! ```
//! use deferred::time::{Clock, Scheduler};
//! use std::cell::Cell;
//! use std::rc::Rc;
//! use std::time::Duration;
//!
//! let sched = Scheduler::new();
//! let hits = Rc::new(Cell::new(0));
//! let h = hits.clone();
//! sched.call_later(Duration::from_secs(1), move || h.set(h.get() + 1));
//!
//! sched.advance(Duration::from_millis(999));
//! assert_eq!(hits.get(), 0);
//! sched.advance(Duration::from_millis(1));
//! assert_eq!(hits.get(), 1);
//! ```

use core::fmt;
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::Duration;

use slab::Slab;

use super::delayed_call::{CallShared, CallState, DelayedCall, Work};
use super::heap::CallQueue;
use super::source::{TimeSource, VirtualClock, WallClock};
use crate::config::SchedulerConfig;
use crate::deferred::{Deferred, set_debugging};
use crate::error::{Error, Result};
use crate::observability::unhandled::{ErrorOrigin, report};
use crate::runtime::handoff::{Handoff, HandoffQueue, Resolver};
use crate::tracing_compat::{debug, trace, warn};
use crate::types::{CallId, Time};

/// Something that can run work later.
///
/// Implemented by [`Scheduler`]; timeouts and looping calls only need this.
pub trait Clock {
    /// Returns the current time.
    fn now(&self) -> Time;

    /// Schedules boxed work to run `delay` from now.
    fn schedule(&self, delay: Duration, work: Box<dyn FnOnce()>) -> DelayedCall;

    /// Returns the pending calls in fire order.
    fn delayed_calls(&self) -> Vec<DelayedCall>;

    /// Returns a handle to this clock that does not keep it alive.
    ///
    /// Work the clock itself holds, such as a looping call's next
    /// iteration, keeps this handle instead of a strong one. Once the clock
    /// is gone, `schedule` on it returns an already-cancelled call.
    fn downgrade(&self) -> Rc<dyn Clock>;

    /// Schedules `f` to run `delay` from now.
    fn call_later<F>(&self, delay: Duration, f: F) -> DelayedCall
    where
        Self: Sized,
        F: FnOnce() + 'static,
    {
        self.schedule(delay, Box::new(f))
    }
}

/// Scheduler state shared with [`DelayedCall`] handles.
pub(crate) struct SchedulerCore {
    clock: Arc<dyn TimeSource>,
    queue: RefCell<CallQueue>,
    next_call_id: Cell<u64>,
    config: SchedulerConfig,
    handoff: Arc<HandoffQueue>,
    remote: RefCell<Slab<Box<dyn Any>>>,
}

impl SchedulerCore {
    pub(crate) fn now(&self) -> Time {
        self.clock.now()
    }

    pub(crate) fn reschedule(&self, call: &Rc<CallShared>, when: Time) {
        trace!(call = %call.id, at = %when, "rescheduled");
        self.queue.borrow_mut().reschedule(call, when);
    }

    pub(crate) fn forget(&self, _call: &CallShared) {
        self.queue.borrow_mut().forget();
    }

    fn insert(self: &Rc<Self>, delay: Duration, work: Work) -> DelayedCall {
        let id = CallId::new(self.next_call_id.get());
        self.next_call_id.set(self.next_call_id.get() + 1);
        let when = self.now() + delay;
        let shared = Rc::new(CallShared::new(id, when, work));
        self.queue.borrow_mut().insert(Rc::clone(&shared));
        trace!(call = %id, at = %when, "scheduled");
        DelayedCall {
            shared,
            core: Rc::downgrade(self),
        }
    }

    fn snapshot(self: &Rc<Self>) -> Vec<DelayedCall> {
        self.queue
            .borrow()
            .snapshot()
            .into_iter()
            .map(|shared| DelayedCall {
                shared,
                core: Rc::downgrade(self),
            })
            .collect()
    }

    /// Fires due calls up to `target` in order. `step` is told each call's
    /// time before it runs.
    fn fire_until(&self, target: Time, step: &dyn Fn(Time)) -> usize {
        self.handoff.drain(self);
        let limit = self.config.max_fires_per_turn;
        let mut fired = 0;
        loop {
            if limit.is_some_and(|limit| fired >= limit) {
                warn!(
                    fired,
                    pending = self.queue.borrow().len(),
                    "per-turn fire limit reached; remaining due calls wait for the next turn"
                );
                break;
            }
            let next = self.queue.borrow_mut().pop_due(target);
            let Some(call) = next else {
                break;
            };
            step(call.time.get());
            self.fire(&call);
            fired += 1;
        }
        fired
    }

    fn fire(&self, call: &CallShared) {
        call.state.set(CallState::Fired);
        let work = call.work.borrow_mut().take();
        let Some(work) = work else {
            return;
        };
        trace!(call = %call.id, at = %call.time.get(), "firing");
        if let Err(payload) = catch_unwind(AssertUnwindSafe(work)) {
            report(
                Error::panicked(payload.as_ref()),
                ErrorOrigin::ScheduledCall(call.id),
            );
        }
    }

    /// Delivers a cross-thread result to the Deferred registered under `key`.
    pub(crate) fn complete_remote<T: 'static>(&self, key: usize, result: Result<T>) {
        self.handoff.resolver_delivered();
        let entry = self.remote.borrow_mut().try_remove(key);
        match entry.map(|entry| entry.downcast::<Deferred<T>>()) {
            Some(Ok(d)) => {
                if let Err(err) = d.resolve(result) {
                    debug!(deferred = %d.id(), error = %err, "cross-thread result arrived after resolution");
                }
            }
            _ => warn!(key, "cross-thread result has no matching deferred"),
        }
    }
}

impl Drop for SchedulerCore {
    fn drop(&mut self) {
        // Pending work can hold handles to its own call.
        for call in self.queue.get_mut().snapshot() {
            let work = call.work.borrow_mut().take();
            drop(work);
        }
    }
}

/// Ordered timed calls over a time source.
///
/// Cloning produces another handle to the same scheduler.
pub struct Scheduler<S: TimeSource = VirtualClock> {
    core: Rc<SchedulerCore>,
    clock: Arc<S>,
}

impl<S: TimeSource> Clone for Scheduler<S> {
    fn clone(&self) -> Self {
        Self {
            core: Rc::clone(&self.core),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl<S: TimeSource + 'static> Scheduler<S> {
    /// Creates a scheduler over `clock`.
    #[must_use]
    pub fn with_clock(clock: Arc<S>, config: SchedulerConfig) -> Self {
        if config.debug_deferreds {
            set_debugging(true);
        }
        debug!(
            start = %clock.now(),
            max_fires_per_turn = ?config.max_fires_per_turn,
            "scheduler created"
        );
        let dyn_clock: Arc<dyn TimeSource> = Arc::clone(&clock) as Arc<dyn TimeSource>;
        Self {
            core: Rc::new(SchedulerCore {
                clock: dyn_clock,
                queue: RefCell::new(CallQueue::new()),
                next_call_id: Cell::new(1),
                config,
                handoff: Arc::new(HandoffQueue::new()),
                remote: RefCell::new(Slab::new()),
            }),
            clock,
        }
    }
}

impl<S: TimeSource> Scheduler<S> {
    /// Returns the underlying time source.
    #[must_use]
    pub fn clock(&self) -> &Arc<S> {
        &self.clock
    }

    /// Returns the configuration this scheduler was built with.
    #[must_use]
    pub fn config(&self) -> &SchedulerConfig {
        &self.core.config
    }

    /// Returns the number of pending calls.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.core.queue.borrow().len()
    }

    /// Returns the earliest pending fire time.
    #[must_use]
    pub fn next_time(&self) -> Option<Time> {
        self.core.queue.borrow_mut().peek_time()
    }

    /// Fires every call due at the current time.
    ///
    /// Returns the number of calls fired.
    pub fn run_due(&self) -> usize {
        let now = self.clock.now();
        self.core.fire_until(now, &|_| {})
    }

    /// Returns a `Send` handle for handing work over from other threads.
    #[must_use]
    pub fn handoff(&self) -> Handoff {
        Handoff {
            queue: Arc::clone(&self.core.handoff),
        }
    }

    /// Creates a Deferred on this thread and a `Send` resolver for it.
    ///
    /// The resolution is delivered at the start of the next turn.
    #[must_use]
    pub fn deferred_from_thread<T: Send + 'static>(&self) -> (Deferred<T>, Resolver<T>) {
        let d = Deferred::new();
        let key = self
            .core
            .remote
            .borrow_mut()
            .insert(Box::new(d.clone()) as Box<dyn Any>);
        (d, Resolver::new(key, Arc::clone(&self.core.handoff)))
    }
}

impl<S: TimeSource> Clock for Scheduler<S> {
    fn now(&self) -> Time {
        self.clock.now()
    }

    fn schedule(&self, delay: Duration, work: Box<dyn FnOnce()>) -> DelayedCall {
        self.core.insert(delay, work)
    }

    fn delayed_calls(&self) -> Vec<DelayedCall> {
        self.core.snapshot()
    }

    fn downgrade(&self) -> Rc<dyn Clock> {
        Rc::new(WeakClock {
            core: Rc::downgrade(&self.core),
            time: Arc::clone(&self.core.clock),
        })
    }
}

/// A [`Clock`] that reaches its scheduler through a weak reference.
struct WeakClock {
    core: Weak<SchedulerCore>,
    time: Arc<dyn TimeSource>,
}

impl Clock for WeakClock {
    fn now(&self) -> Time {
        self.time.now()
    }

    fn schedule(&self, delay: Duration, work: Box<dyn FnOnce()>) -> DelayedCall {
        if let Some(core) = self.core.upgrade() {
            return core.insert(delay, work);
        }
        debug!(delay = ?delay, "scheduler dropped; call discarded");
        let shared = Rc::new(CallShared::new(CallId::new(0), self.now() + delay, work));
        shared.state.set(CallState::Cancelled);
        let work = shared.work.borrow_mut().take();
        drop(work);
        DelayedCall {
            shared,
            core: Weak::new(),
        }
    }

    fn delayed_calls(&self) -> Vec<DelayedCall> {
        self.core
            .upgrade()
            .map(|core| core.snapshot())
            .unwrap_or_default()
    }

    fn downgrade(&self) -> Rc<dyn Clock> {
        Rc::new(Self {
            core: Weak::clone(&self.core),
            time: Arc::clone(&self.time),
        })
    }
}

impl Scheduler<VirtualClock> {
    /// Creates a virtual-time scheduler starting at time zero.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(SchedulerConfig::default())
    }

    /// Creates a virtual-time scheduler from `config`.
    #[must_use]
    pub fn with_config(config: SchedulerConfig) -> Self {
        let clock = Arc::new(VirtualClock::starting_at(config.start_time));
        Self::with_clock(clock, config)
    }

    /// Moves virtual time forward by `by`, firing every call that comes due.
    ///
    /// The clock reads each call's own time while it runs. Calls scheduled
    /// or reset during the turn fire in the same turn if they fall due
    /// before its end.
    pub fn advance(&self, by: Duration) -> usize {
        let target = self.clock.now() + by;
        let clock = Arc::clone(&self.clock);
        let fired = self.core.fire_until(target, &|at| clock.advance_to(at));
        self.clock.advance_to(target);
        fired
    }

    /// Advances by each step in turn.
    pub fn pump(&self, steps: &[Duration]) -> usize {
        steps.iter().map(|step| self.advance(*step)).sum()
    }
}

impl Default for Scheduler<VirtualClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler<WallClock> {
    /// Creates a real-time scheduler.
    #[must_use]
    pub fn wall_clock() -> Self {
        Self::with_clock(Arc::new(WallClock::new()), SchedulerConfig::default())
    }

    /// Runs calls as they come due until nothing is pending.
    ///
    /// Pending means scheduled calls or unresolved cross-thread resolvers.
    /// Returns early after [`Handoff::stop`]. Returns the number of calls fired.
    pub fn run_until_idle(&self) -> usize {
        let handoff = &self.core.handoff;
        let mut fired = 0;
        loop {
            fired += self.run_due();
            if handoff.take_stop() {
                debug!(fired, "scheduler loop stopped");
                break;
            }
            if handoff.has_jobs() {
                continue;
            }
            match self.next_time() {
                Some(at) => {
                    let now = self.clock.now();
                    if at > now {
                        handoff.wait(Some(at.elapsed_since(now)));
                    }
                }
                None if handoff.outstanding() > 0 => handoff.wait(None),
                None => break,
            }
        }
        fired
    }
}

impl<S: TimeSource> fmt::Debug for Scheduler<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("now", &self.clock.now())
            .field("pending", &self.pending())
            .finish()
    }
}
