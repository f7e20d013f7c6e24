//! Recurring calls on a scheduler.
//!
//! A [`LoopingCall`] invokes its callable every `interval`. Fire times are
//! anchored to the start time, so a late iteration does not push later ones
//! back: the next call is always at `start + N * interval` for the smallest
//! `N` strictly after the current time.
//!
//! If the callable returns a Deferred that has not fired, no further
//! iteration is scheduled until it does. The counted variants report how
//! many intervals elapsed since the previous invocation, so callers can
//! account for the ones that were skipped.

use core::fmt;
use std::cell::RefCell;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::Rc;
use std::time::Duration;

use super::delayed_call::DelayedCall;
use super::scheduler::Clock;
use crate::deferred::Deferred;
use crate::error::{Error, Result};
use crate::tracing_compat::{debug, trace, warn};
use crate::types::Time;
use crate::types::id::duration_to_nanos_saturating;

enum Body {
    Plain(Box<dyn FnMut() -> Deferred<()>>),
    Counted(Box<dyn FnMut(u64) -> Deferred<()>>),
}

struct LoopState {
    interval: Duration,
    running: bool,
    start_time: Time,
    run_at_start: bool,
    real_last_time: Option<Time>,
    call: Option<DelayedCall>,
    completion: Option<Deferred<()>>,
    /// Bumped on every start; results from an older run are ignored.
    generation: u64,
}

struct LoopInner {
    /// Weak handle: the scheduler owns the loop's next call, not the reverse.
    clock: Rc<dyn Clock>,
    body: RefCell<Option<Body>>,
    state: RefCell<LoopState>,
}

/// Calls a function repeatedly at a fixed interval.
///
/// Cloning produces another handle to the same loop.
///
/// # Example
///
/// ```
/// use deferred::time::{LoopingCall, Scheduler};
/// use std::cell::Cell;
/// use std::rc::Rc;
/// use std::time::Duration;
///
/// let sched = Scheduler::new();
/// let ticks = Rc::new(Cell::new(0));
/// let t = ticks.clone();
/// let lc = LoopingCall::new(&sched, move || {
///     t.set(t.get() + 1);
///     Ok(())
/// });
/// lc.start(Duration::from_millis(500), true).unwrap();
/// sched.advance(Duration::from_millis(2010));
/// assert_eq!(ticks.get(), 5);
/// ```
#[derive(Clone)]
pub struct LoopingCall {
    inner: Rc<LoopInner>,
}

fn settled(result: Result<()>) -> Deferred<()> {
    match result {
        Ok(()) => Deferred::succeed(()),
        Err(err) => Deferred::fail(err),
    }
}

fn guarded(f: impl FnOnce() -> Deferred<()>) -> Deferred<()> {
    catch_unwind(AssertUnwindSafe(f))
        .unwrap_or_else(|payload| Deferred::fail(Error::panicked(payload.as_ref())))
}

/// Delay from `when` to the next interval boundary after it.
fn next_delay(start: Time, interval: Duration, when: Time) -> Duration {
    let interval = duration_to_nanos_saturating(interval);
    if interval == 0 {
        return Duration::ZERO;
    }
    let running_for = when.duration_since(start);
    Duration::from_nanos(interval - running_for % interval)
}

/// Index of the interval containing `t`, counting from `start`.
fn interval_of(start: Time, interval: u64, t: i128) -> i128 {
    (t - i128::from(start.as_nanos())) / i128::from(interval)
}

impl LoopingCall {
    fn with_body<C: Clock>(clock: &C, body: Body) -> Self {
        Self {
            inner: Rc::new(LoopInner {
                clock: clock.downgrade(),
                body: RefCell::new(Some(body)),
                state: RefCell::new(LoopState {
                    interval: Duration::ZERO,
                    running: false,
                    start_time: Time::ZERO,
                    run_at_start: false,
                    real_last_time: None,
                    call: None,
                    completion: None,
                    generation: 0,
                }),
            }),
        }
    }

    /// Creates a loop around a synchronous callable.
    ///
    /// An `Err` or a panic stops the loop.
    pub fn new<C, F>(clock: &C, mut f: F) -> Self
    where
        C: Clock,
        F: FnMut() -> Result<()> + 'static,
    {
        Self::with_body(clock, Body::Plain(Box::new(move || settled(f()))))
    }

    /// Creates a loop around a callable that returns a Deferred.
    ///
    /// The next iteration is scheduled once that Deferred fires.
    pub fn new_async<C, F>(clock: &C, f: F) -> Self
    where
        C: Clock,
        F: FnMut() -> Deferred<()> + 'static,
    {
        Self::with_body(clock, Body::Plain(Box::new(f)))
    }

    /// Creates a loop whose callable receives the number of intervals that
    /// elapsed since its previous invocation. The count is always at least 1.
    pub fn with_count<C, F>(clock: &C, mut f: F) -> Self
    where
        C: Clock,
        F: FnMut(u64) -> Result<()> + 'static,
    {
        Self::with_body(clock, Body::Counted(Box::new(move |n| settled(f(n)))))
    }

    /// Counted variant of [`new_async`](Self::new_async).
    pub fn with_count_async<C, F>(clock: &C, f: F) -> Self
    where
        C: Clock,
        F: FnMut(u64) -> Deferred<()> + 'static,
    {
        Self::with_body(clock, Body::Counted(Box::new(f)))
    }

    /// Starts the loop.
    ///
    /// With `now` the callable runs immediately, otherwise one interval from
    /// now. The returned Deferred fires with `()` when the loop is stopped,
    /// or fails with the callable's error.
    ///
    /// # Errors
    ///
    /// `InvalidState` if the loop is already running.
    pub fn start(&self, interval: Duration, now: bool) -> Result<Deferred<()>> {
        let inner = &self.inner;
        let start_time = inner.clock.now();
        let completion = {
            let mut st = inner.state.borrow_mut();
            if st.running {
                return Err(Error::invalid_state("looping call is already running"));
            }
            let completion = Deferred::new();
            st.running = true;
            st.interval = interval;
            st.start_time = start_time;
            st.run_at_start = now;
            st.real_last_time = None;
            st.completion = Some(completion.clone());
            st.generation += 1;
            completion
        };
        debug!(interval = ?interval, now, start = %start_time, "looping call started");
        if now {
            inner.fire();
        } else {
            inner.schedule_from(start_time);
        }
        Ok(completion)
    }

    /// Stops the loop and fires the completion Deferred.
    ///
    /// # Errors
    ///
    /// `InvalidState` if the loop is not running.
    pub fn stop(&self) -> Result<()> {
        let (call, completion) = {
            let mut st = self.inner.state.borrow_mut();
            if !st.running {
                return Err(Error::invalid_state("looping call is not running"));
            }
            st.running = false;
            (st.call.take(), st.completion.take())
        };
        if let Some(call) = call {
            let _ = call.cancel();
        }
        debug!("looping call stopped");
        if let Some(completion) = completion {
            let _ = completion.callback(());
        }
        Ok(())
    }

    /// Restarts the interval from now: the next call is one interval away.
    ///
    /// While an iteration's Deferred is still outstanding no call is pending
    /// and the loop keeps its phase.
    ///
    /// # Errors
    ///
    /// `InvalidState` if the loop is not running.
    pub fn reset(&self) -> Result<()> {
        let inner = &self.inner;
        let now = inner.clock.now();
        let call = {
            let mut st = inner.state.borrow_mut();
            if !st.running {
                return Err(Error::invalid_state("looping call is not running"));
            }
            let call = st.call.take();
            if call.is_some() {
                st.start_time = now;
            }
            call
        };
        if let Some(call) = call {
            let _ = call.cancel();
            inner.schedule_from(now);
        }
        Ok(())
    }

    /// Returns true between `start` and `stop` or a failure.
    #[must_use]
    pub fn running(&self) -> bool {
        self.inner.state.borrow().running
    }

    /// Returns the interval of the current or last run.
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.inner.state.borrow().interval
    }

    /// Returns when the next iteration is scheduled, if one is.
    #[must_use]
    pub fn next_call_time(&self) -> Option<Time> {
        self.inner
            .state
            .borrow()
            .call
            .as_ref()
            .filter(|call| call.active())
            .map(DelayedCall::time)
    }
}

impl LoopInner {
    fn fire(self: &Rc<Self>) {
        let now = self.clock.now();
        let generation = {
            let mut st = self.state.borrow_mut();
            st.call = None;
            st.generation
        };
        trace!(at = %now, "looping call iteration");
        let outcome = self
            .invoke(now)
            .unwrap_or_else(|| Deferred::succeed(()));
        let this = Rc::clone(self);
        outcome.add_sink(move |result| this.iteration_done(generation, result));
    }

    /// Runs the callable. `None` when a counted loop has no whole interval
    /// to report.
    fn invoke(&self, now: Time) -> Option<Deferred<()>> {
        let body = self.body.borrow_mut().take();
        let Some(mut body) = body else {
            return Some(Deferred::fail(Error::invalid_state(
                "looping call re-entered its own callable",
            )));
        };
        let outcome = match &mut body {
            Body::Plain(f) => Some(guarded(|| f())),
            Body::Counted(f) => self.count_at(now).map(|count| guarded(|| f(count))),
        };
        *self.body.borrow_mut() = Some(body);
        outcome
    }

    fn count_at(&self, now: Time) -> Option<u64> {
        let mut st = self.state.borrow_mut();
        let interval = duration_to_nanos_saturating(st.interval);
        if interval == 0 {
            st.real_last_time = Some(now);
            return Some(1);
        }
        let last = match st.real_last_time {
            Some(last) => i128::from(last.as_nanos()),
            None if st.run_at_start => {
                i128::from(st.start_time.as_nanos()) - i128::from(interval)
            }
            None => i128::from(st.start_time.as_nanos()),
        };
        let count = interval_of(st.start_time, interval, i128::from(now.as_nanos()))
            - interval_of(st.start_time, interval, last);
        if count > 0 {
            st.real_last_time = Some(now);
            u64::try_from(count).ok()
        } else {
            None
        }
    }

    fn iteration_done(self: &Rc<Self>, generation: u64, result: Result<()>) {
        let (current, running) = {
            let st = self.state.borrow();
            (st.generation == generation, st.running)
        };
        match result {
            Ok(()) if current && running => self.schedule_from(self.clock.now()),
            Ok(()) => {}
            Err(err) if current => {
                let completion = {
                    let mut st = self.state.borrow_mut();
                    st.running = false;
                    st.completion.take()
                };
                debug!(error = %err, "looping call failed");
                match completion {
                    Some(completion) => {
                        let _ = completion.errback(err);
                    }
                    None => warn!(error = %err, "looping call failed after it was stopped"),
                }
            }
            Err(err) => warn!(error = %err, "iteration from an earlier run failed"),
        }
    }

    fn schedule_from(self: &Rc<Self>, when: Time) {
        let delay = {
            let st = self.state.borrow();
            next_delay(st.start_time, st.interval, when)
        };
        let this = Rc::clone(self);
        let call = self.clock.schedule(delay, Box::new(move || this.fire()));
        self.state.borrow_mut().call = Some(call);
    }
}

impl fmt::Debug for LoopingCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.inner.state.borrow();
        f.debug_struct("LoopingCall")
            .field("interval", &st.interval)
            .field("running", &st.running)
            .field("start_time", &st.start_time)
            .field("next_call", &st.call.as_ref().map(DelayedCall::time))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::error::ErrorKind;
    use crate::test_utils::{capture, init_test_logging};
    use crate::time::Scheduler;
    use std::cell::{Cell, RefCell};

    fn ticker(sched: &Scheduler) -> (LoopingCall, Rc<Cell<u32>>) {
        let ticks = Rc::new(Cell::new(0));
        let t = Rc::clone(&ticks);
        let lc = LoopingCall::new(sched, move || {
            t.set(t.get() + 1);
            Ok(())
        });
        (lc, ticks)
    }

    #[test]
    fn half_second_loop_runs_five_times_in_two_seconds() {
        init_test_logging();
        crate::test_phase!("half_second_loop_runs_five_times_in_two_seconds");
        let sched = Scheduler::new();
        let (lc, ticks) = ticker(&sched);
        lc.start(Duration::from_millis(500), true).expect("start");
        assert_eq!(ticks.get(), 1);
        sched.advance(Duration::from_millis(2010));
        assert_eq!(ticks.get(), 5);
        assert_eq!(lc.next_call_time(), Some(Time::from_millis(2500)));
    }

    #[test]
    fn fire_times_stay_anchored_to_start() {
        init_test_logging();
        let sched = Scheduler::new();
        let (lc, ticks) = ticker(&sched);
        lc.start(Duration::from_secs(1), false).expect("start");
        assert_eq!(ticks.get(), 0);
        let pump: Vec<Duration> = std::iter::repeat_n(Duration::from_millis(300), 10).collect();
        sched.pump(&pump);
        assert_eq!(ticks.get(), 3);
        assert_eq!(lc.next_call_time(), Some(Time::from_secs(4)));
    }

    #[test]
    fn stop_fires_completion_and_cancels_next_call() {
        init_test_logging();
        let sched = Scheduler::new();
        let (lc, ticks) = ticker(&sched);
        let done = lc.start(Duration::from_secs(1), true).expect("start");
        let slot = capture(&done);
        lc.stop().expect("stop");
        assert!(!lc.running());
        assert!(matches!(slot.borrow_mut().take(), Some(Ok(()))));
        assert_eq!(sched.pending(), 0);
        sched.advance(Duration::from_secs(5));
        assert_eq!(ticks.get(), 1);
    }

    #[test]
    fn misuse_is_invalid_state() {
        init_test_logging();
        let sched = Scheduler::new();
        let (lc, _) = ticker(&sched);
        assert_eq!(lc.stop().expect_err("stopped").kind(), ErrorKind::InvalidState);
        assert_eq!(lc.reset().expect_err("stopped").kind(), ErrorKind::InvalidState);
        let _done = lc.start(Duration::from_secs(1), false).expect("start");
        let again = lc.start(Duration::from_secs(1), false).expect_err("running");
        assert_eq!(again.kind(), ErrorKind::InvalidState);
        lc.stop().expect("stop");
    }

    #[test]
    fn failure_stops_loop_and_fails_completion() {
        init_test_logging();
        let sched = Scheduler::new();
        let runs = Rc::new(Cell::new(0));
        let r = Rc::clone(&runs);
        let lc = LoopingCall::new(&sched, move || {
            r.set(r.get() + 1);
            if r.get() == 3 {
                Err(Error::msg("third time"))
            } else {
                Ok(())
            }
        });
        let done = lc.start(Duration::from_secs(1), true).expect("start");
        let slot = capture(&done);
        sched.advance(Duration::from_secs(10));
        assert_eq!(runs.get(), 3);
        assert!(!lc.running());
        let err = slot.borrow_mut().take().expect("resolved").expect_err("failed");
        assert_eq!(err.message(), Some("third time"));
        assert_eq!(sched.pending(), 0);
    }

    #[test]
    fn panicking_callable_fails_completion() {
        init_test_logging();
        let sched = Scheduler::new();
        let lc = LoopingCall::new(&sched, || panic!("loop body"));
        let done = lc.start(Duration::from_secs(1), true).expect("start");
        crate::assert_resolved_err!(done, ErrorKind::Panicked);
    }

    #[test]
    fn reset_moves_next_call_one_interval_from_now() {
        init_test_logging();
        let sched = Scheduler::new();
        let (lc, ticks) = ticker(&sched);
        lc.start(Duration::from_secs(2), false).expect("start");
        sched.advance(Duration::from_millis(1500));
        lc.reset().expect("reset");
        assert_eq!(lc.next_call_time(), Some(Time::from_millis(3500)));
        sched.advance(Duration::from_millis(1000));
        assert_eq!(ticks.get(), 0);
        sched.advance(Duration::from_millis(1000));
        assert_eq!(ticks.get(), 1);
    }

    #[test]
    fn counted_loop_reports_skipped_intervals() {
        init_test_logging();
        crate::test_phase!("counted_loop_reports_skipped_intervals");
        let sched = Scheduler::new();
        let counts = Rc::new(RefCell::new(Vec::new()));
        let gate: Rc<RefCell<Option<Deferred<()>>>> = Rc::new(RefCell::new(None));
        let (c, g) = (Rc::clone(&counts), Rc::clone(&gate));
        let lc = LoopingCall::with_count_async(&sched, move |n| {
            c.borrow_mut().push(n);
            if n == 1 && c.borrow().len() == 1 {
                let d = Deferred::new();
                *g.borrow_mut() = Some(d.clone());
                d
            } else {
                Deferred::succeed(())
            }
        });
        lc.start(Duration::from_secs(1), true).expect("start");
        sched.advance(Duration::from_millis(3500));
        assert_eq!(*counts.borrow(), vec![1]);
        assert_eq!(sched.pending(), 0);

        let pending = gate.borrow_mut().take().expect("gate");
        pending.callback(()).expect("release");
        sched.advance(Duration::from_millis(500));
        assert_eq!(*counts.borrow(), vec![1, 4]);
        sched.advance(Duration::from_secs(1));
        assert_eq!(*counts.borrow(), vec![1, 4, 1]);
        assert!(counts.borrow().iter().all(|&n| n >= 1));
    }

    #[test]
    fn zero_interval_is_bounded_by_fire_limit() {
        init_test_logging();
        let sched = Scheduler::with_config(SchedulerConfig::new().max_fires_per_turn(10));
        let (lc, ticks) = ticker(&sched);
        lc.start(Duration::ZERO, true).expect("start");
        assert_eq!(sched.advance(Duration::ZERO), 10);
        assert_eq!(ticks.get(), 11);
        lc.stop().expect("stop");
    }

    #[test]
    fn stop_from_inside_callable() {
        init_test_logging();
        let sched = Scheduler::new();
        let slot: Rc<RefCell<Option<LoopingCall>>> = Rc::new(RefCell::new(None));
        let handle = Rc::clone(&slot);
        let lc = LoopingCall::with_count(&sched, move |_| {
            if let Some(lc) = handle.borrow().as_ref() {
                lc.stop()?;
            }
            Ok(())
        });
        *slot.borrow_mut() = Some(lc.clone());
        let done = lc.start(Duration::from_secs(1), false).expect("start");
        sched.advance(Duration::from_secs(1));
        assert!(!lc.running());
        assert_eq!(sched.pending(), 0);
        crate::assert_resolved_ok!(done, ());
        slot.borrow_mut().take();
    }

    #[test]
    fn reset_while_iteration_outstanding_keeps_phase() {
        init_test_logging();
        let sched = Scheduler::new();
        let gate: Rc<RefCell<Option<Deferred<()>>>> = Rc::new(RefCell::new(None));
        let g = Rc::clone(&gate);
        let lc = LoopingCall::new_async(&sched, move || {
            let d = Deferred::new();
            *g.borrow_mut() = Some(d.clone());
            d
        });
        lc.start(Duration::from_millis(100), false).expect("start");
        sched.advance(Duration::from_millis(150));
        assert_eq!(lc.next_call_time(), None);

        lc.reset().expect("reset");
        sched.advance(Duration::from_millis(20));
        let outstanding = gate.borrow_mut().take().expect("iteration started");
        outstanding.callback(()).expect("finish iteration");
        assert_eq!(lc.next_call_time(), Some(Time::from_millis(200)));
        lc.stop().expect("stop");
    }

    struct DropFlag(Rc<Cell<bool>>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.set(true);
        }
    }

    #[test]
    fn running_loop_does_not_keep_scheduler_alive() {
        init_test_logging();
        let sched = Scheduler::new();
        let freed = Rc::new(Cell::new(false));
        let flag = DropFlag(Rc::clone(&freed));
        sched.call_later(Duration::from_secs(60), move || drop(flag));
        let (lc, _ticks) = ticker(&sched);
        lc.start(Duration::from_secs(1), false).expect("start");
        let inner = Rc::downgrade(&lc.inner);

        drop(sched);
        assert!(freed.get(), "scheduler and its pending work were not freed");
        assert!(lc.running());
        lc.stop().expect("stop after scheduler is gone");
        lc.start(Duration::from_secs(1), true).expect("restart on a dropped scheduler");
        assert_eq!(lc.next_call_time(), None);

        drop(lc);
        assert!(inner.upgrade().is_none(), "loop state outlived every handle");
    }
}
