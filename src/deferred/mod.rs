//! Deferred: a single-fire result with an ordered chain of handlers.
//!
//! A [`Deferred<T>`] is a reference-counted handle to a result that will be
//! produced later. Handlers are attached in order with the
//! [`Chainable`] methods; when the Deferred is resolved with
//! [`callback`](Deferred::callback) or [`errback`](Deferred::errback) the
//! chain is drained synchronously, each handler receiving the previous one's
//! output. Attaching a handler to an already-resolved Deferred runs it
//! immediately.
//!
//! # Nesting
//!
//! A handler may return [`Step::Wait`] with another Deferred. The outer chain
//! pauses until the inner one fires, and later handlers see the inner result.
//!
//! # Cancellation
//!
//! [`cancel`](Deferred::cancel) on an unresolved Deferred runs its canceller
//! and, if the canceller did not resolve it, fails it with
//! [`ErrorKind::Cancelled`](crate::ErrorKind::Cancelled). On a Deferred whose
//! chain is paused on an inner Deferred, the cancel is forwarded to the inner
//! one instead.
//!
//! # Example
//!
//! ```
//! use deferred::prelude::*;
//!
//! let d = Deferred::<i32>::new();
//! d.add_callback(|x| Ok(x + 1));
//! d.callback(1).unwrap();
//! assert_eq!(d.peek().map(Result::ok), Some(Some(2)));
//! ```

mod chain;
pub mod chainable;
pub mod future;
pub mod list;
pub mod sync;

pub use chain::Step;
pub use chainable::{Chainable, maybe_deferred};
pub use future::DeferredFuture;
pub use list::{DeferredList, gather_results, race};
pub use sync::{DeferredLock, DeferredQueue, DeferredSemaphore};

pub(crate) use chain::{Link, Take};

use core::fmt;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, Location, catch_unwind};
use std::rc::{Rc, Weak};

use crate::error::{Error, Result};
use crate::observability::unhandled::{ErrorOrigin, report};
use crate::tracing_compat::trace;
use crate::types::{CancelReason, DeferredId};

thread_local! {
    static DEBUGGING: Cell<bool> = const { Cell::new(false) };
}

/// Enables or disables Deferred debug mode on the current thread.
///
/// In debug mode every new Deferred records where it was created and where
/// it was first resolved; both sites appear in `AlreadyCalled` errors.
pub fn set_debugging(enabled: bool) {
    DEBUGGING.with(|flag| flag.set(enabled));
}

/// Returns true if Deferred debug mode is on for the current thread.
#[must_use]
pub fn debugging() -> bool {
    DEBUGGING.with(Cell::get)
}

/// Source locations recorded in debug mode.
#[derive(Debug, Clone, Copy)]
pub struct DebugInfo {
    /// Where the Deferred was created.
    pub created: &'static Location<'static>,
    /// Where it was first resolved, once resolved.
    pub resolved: Option<&'static Location<'static>>,
}

type Canceller<T> = Box<dyn FnOnce(&Deferred<T>)>;

pub(crate) struct Inner<T: 'static> {
    id: DeferredId,
    result: Option<Result<T>>,
    called: bool,
    consumed: bool,
    paused: u32,
    running: bool,
    chain: VecDeque<Link<T>>,
    canceller: Option<Canceller<T>>,
    suppress_already_called: bool,
    waiting_on: Option<WeakDeferred<T>>,
    debug: Option<DebugInfo>,
}

impl<T: 'static> Drop for Inner<T> {
    fn drop(&mut self) {
        if self.consumed {
            return;
        }
        if let Some(Err(err)) = self.result.take() {
            report(err, ErrorOrigin::Deferred(self.id));
        }
    }
}

/// A single-fire result with an ordered chain of handlers.
///
/// Cloning produces another handle to the same Deferred.
pub struct Deferred<T: 'static> {
    pub(crate) inner: Rc<RefCell<Inner<T>>>,
}

impl<T: 'static> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: 'static> Default for Deferred<T> {
    #[track_caller]
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> Deferred<T> {
    /// Creates an unresolved Deferred without a canceller.
    #[track_caller]
    #[must_use]
    pub fn new() -> Self {
        Self::build(None, Location::caller())
    }

    /// Creates an unresolved Deferred whose cancellation runs `canceller`.
    ///
    /// The canceller may resolve the Deferred itself; if it does not, the
    /// Deferred fails with a cancellation error after it returns.
    #[track_caller]
    #[must_use]
    pub fn with_canceller<F>(canceller: F) -> Self
    where
        F: FnOnce(&Self) + 'static,
    {
        Self::build(Some(Box::new(canceller)), Location::caller())
    }

    fn build(canceller: Option<Canceller<T>>, created: &'static Location<'static>) -> Self {
        let debug = debugging().then_some(DebugInfo {
            created,
            resolved: None,
        });
        Self {
            inner: Rc::new(RefCell::new(Inner {
                id: DeferredId::next(),
                result: None,
                called: false,
                consumed: false,
                paused: 0,
                running: false,
                chain: VecDeque::new(),
                canceller,
                suppress_already_called: false,
                waiting_on: None,
                debug,
            })),
        }
    }

    /// Creates a Deferred already resolved with `value`.
    #[track_caller]
    #[must_use]
    pub fn succeed(value: T) -> Self {
        let d = Self::build(None, Location::caller());
        d.settle(Ok(value), Location::caller());
        d
    }

    /// Creates a Deferred already failed with `error`.
    #[track_caller]
    #[must_use]
    pub fn fail(error: Error) -> Self {
        let d = Self::build(None, Location::caller());
        d.settle(Err(error), Location::caller());
        d
    }

    /// Returns this Deferred's identity.
    #[must_use]
    pub fn id(&self) -> DeferredId {
        self.inner.borrow().id
    }

    /// Returns true once the Deferred has been resolved.
    #[must_use]
    pub fn called(&self) -> bool {
        self.inner.borrow().called
    }

    /// Returns true while draining is suspended by `pause` or by an inner Deferred.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.inner.borrow().paused > 0
    }

    /// Returns true once the result has been moved out to another consumer.
    #[must_use]
    pub fn is_consumed(&self) -> bool {
        self.inner.borrow().consumed
    }

    /// Returns the recorded source locations, if created in debug mode.
    #[must_use]
    pub fn debug_info(&self) -> Option<DebugInfo> {
        self.inner.borrow().debug
    }

    /// Returns true if both handles refer to the same Deferred.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Returns a weak handle that does not keep the Deferred alive.
    #[must_use]
    pub fn downgrade(&self) -> WeakDeferred<T> {
        WeakDeferred {
            inner: Rc::downgrade(&self.inner),
        }
    }

    /// Resolves with a success value and drains the chain.
    ///
    /// Fails with `AlreadyCalled` if the Deferred was resolved before.
    #[track_caller]
    pub fn callback(&self, value: T) -> Result<()> {
        self.resolve_at(Ok(value), Location::caller())
    }

    /// Resolves with an error and drains the chain.
    ///
    /// Fails with `AlreadyCalled` if the Deferred was resolved before.
    #[track_caller]
    pub fn errback(&self, error: Error) -> Result<()> {
        self.resolve_at(Err(error), Location::caller())
    }

    /// Resolves with either outcome and drains the chain.
    #[track_caller]
    pub fn resolve(&self, result: Result<T>) -> Result<()> {
        self.resolve_at(result, Location::caller())
    }

    fn resolve_at(&self, result: Result<T>, site: &'static Location<'static>) -> Result<()> {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.called {
                if inner.suppress_already_called {
                    inner.suppress_already_called = false;
                    trace!(deferred = %inner.id, "late resolution after cancel swallowed");
                    return Ok(());
                }
                let first = inner.debug.and_then(|d| d.resolved);
                return Err(Error::already_called(first));
            }
        }
        self.settle(result, site);
        self.run_callbacks();
        Ok(())
    }

    fn settle(&self, result: Result<T>, site: &'static Location<'static>) {
        let mut inner = self.inner.borrow_mut();
        trace!(deferred = %inner.id, ok = result.is_ok(), "resolved");
        inner.called = true;
        inner.result = Some(result);
        if let Some(debug) = inner.debug.as_mut() {
            debug.resolved = Some(site);
        }
    }

    /// Suspends draining until a matching [`unpause`](Self::unpause).
    pub fn pause(&self) {
        self.inner.borrow_mut().paused += 1;
    }

    /// Undoes one [`pause`](Self::pause); resumes draining at depth zero.
    pub fn unpause(&self) {
        let resume = {
            let mut inner = self.inner.borrow_mut();
            inner.paused = inner.paused.saturating_sub(1);
            inner.paused == 0 && inner.called
        };
        if resume {
            self.run_callbacks();
        }
    }

    /// Cancels with a user reason.
    pub fn cancel(&self) {
        self.cancel_with(CancelReason::default());
    }

    /// Cancels with an explicit reason.
    ///
    /// - Unresolved: run the canceller; if still unresolved, fail with a
    ///   cancellation error. Without a canceller the producer's later
    ///   resolution is silently swallowed.
    /// - Paused on an inner Deferred: cancel the inner one instead.
    /// - Otherwise: no effect.
    pub fn cancel_with(&self, reason: CancelReason) {
        let (called, canceller, waiting_on) = {
            let mut inner = self.inner.borrow_mut();
            if inner.called {
                (true, None, inner.waiting_on.clone())
            } else {
                (false, inner.canceller.take(), None)
            }
        };

        if called {
            if let Some(inner) = waiting_on.and_then(|w| w.upgrade()) {
                trace!(deferred = %self.id(), inner = %inner.id(), "cancel cascades to inner deferred");
                inner.cancel_with(CancelReason::parent_cancelled());
            }
            return;
        }

        match canceller {
            Some(canceller) => {
                if let Err(payload) = catch_unwind(AssertUnwindSafe(|| canceller(self))) {
                    if !self.called() {
                        let _ = self.errback(Error::panicked(payload.as_ref()));
                        return;
                    }
                }
            }
            None => self.inner.borrow_mut().suppress_already_called = true,
        }

        if !self.called() {
            trace!(deferred = %self.id(), reason = %reason, "cancelled");
            let _ = self.errback(Error::cancelled(&reason));
        }
    }

    /// Forwards this Deferred's result into `other`.
    ///
    /// The result is moved into `other`; handlers attached here afterwards
    /// do not run. Chaining a Deferred to itself fails with `InvalidState`.
    pub fn chain_deferred(&self, other: &Self) -> Result<&Self> {
        if self.ptr_eq(other) {
            return Err(Error::invalid_state("a deferred cannot be chained to itself"));
        }
        let target = other.clone();
        self.add_sink(move |result| {
            if let Err(err) = target.resolve(result) {
                crate::tracing_compat::warn!(
                    deferred = %target.id(),
                    error = %err,
                    "chained deferred was already resolved"
                );
            }
        });
        Ok(self)
    }

    /// Appends a terminal consumer that takes the result out of the chain.
    ///
    /// After the sink runs the Deferred is consumed: later handlers never
    /// run and later sinks receive an `InvalidState` error. A panicking sink
    /// is reported as unhandled.
    pub fn add_sink<F>(&self, sink: F) -> &Self
    where
        F: FnOnce(Result<T>) + 'static,
    {
        self.push_link(Link::Sink(Box::new(sink)));
        self
    }

    /// Continues with a possibly different type.
    ///
    /// The returned Deferred resolves with whatever `f` produces from this
    /// Deferred's result. Cancelling it before that cancels this Deferred, or
    /// the Deferred `f` is waiting on.
    pub fn then<U, F>(&self, f: F) -> Deferred<U>
    where
        U: 'static,
        F: FnOnce(Result<T>) -> Step<U> + 'static,
    {
        type CancelHook = Rc<RefCell<Option<Box<dyn FnOnce()>>>>;

        let source = self.downgrade();
        let hook: CancelHook = Rc::new(RefCell::new(Some(Box::new(move || {
            if let Some(source) = source.upgrade() {
                source.cancel_with(CancelReason::parent_cancelled());
            }
        }))));

        let out = Deferred::<U>::with_canceller({
            let hook = Rc::clone(&hook);
            move |_| {
                let hook = hook.borrow_mut().take();
                if let Some(hook) = hook {
                    hook();
                }
            }
        });

        let target = out.clone();
        self.add_sink(move |result| {
            let step = catch_unwind(AssertUnwindSafe(move || f(result)))
                .unwrap_or_else(|payload| Step::Ready(Err(Error::panicked(payload.as_ref()))));
            match step {
                Step::Ready(result) => {
                    let _ = target.resolve(result);
                }
                Step::Wait(next) => {
                    let weak = next.downgrade();
                    *hook.borrow_mut() = Some(Box::new(move || {
                        if let Some(next) = weak.upgrade() {
                            next.cancel_with(CancelReason::parent_cancelled());
                        }
                    }));
                    next.add_sink(move |result| {
                        let _ = target.resolve(result);
                    });
                }
            }
        });
        out
    }
}

impl<T: Clone + 'static> Deferred<T> {
    /// Returns a copy of the current result without consuming it.
    ///
    /// `None` while unresolved, paused on an inner Deferred, or consumed.
    #[must_use]
    pub fn peek(&self) -> Option<Result<T>> {
        self.inner.borrow().result.clone()
    }
}

impl<T: 'static> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.try_borrow() {
            Ok(inner) => f
                .debug_struct("Deferred")
                .field("id", &inner.id)
                .field("called", &inner.called)
                .field("paused", &inner.paused)
                .field("consumed", &inner.consumed)
                .field("chain_len", &inner.chain.len())
                .finish(),
            Err(_) => f.debug_struct("Deferred").finish_non_exhaustive(),
        }
    }
}

/// A weak handle to a Deferred.
pub struct WeakDeferred<T: 'static> {
    inner: Weak<RefCell<Inner<T>>>,
}

impl<T: 'static> WeakDeferred<T> {
    /// Upgrades to a strong handle if the Deferred is still alive.
    #[must_use]
    pub fn upgrade(&self) -> Option<Deferred<T>> {
        self.inner.upgrade().map(|inner| Deferred { inner })
    }
}

impl<T: 'static> Clone for WeakDeferred<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Weak::clone(&self.inner),
        }
    }
}

impl<T: 'static> fmt::Debug for WeakDeferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakDeferred")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::observability::capture_unhandled;
    use crate::test_utils::{capture, init_test_logging, outcome_of};

    #[test]
    fn callback_after_attach_and_attach_after_callback_agree() {
        init_test_logging();
        crate::test_phase!("callback_after_attach_and_attach_after_callback_agree");

        let before = Deferred::<i32>::new();
        before.add_callback(|x| Ok(x + 1));
        before.callback(1).expect("first callback");

        let after = Deferred::<i32>::new();
        after.callback(1).expect("first callback");
        after.add_callback(|x| Ok(x + 1));

        assert_eq!(before.peek().map(Result::ok), Some(Some(2)));
        assert_eq!(after.peek().map(Result::ok), Some(Some(2)));
        crate::test_complete!("callback_after_attach_and_attach_after_callback_agree");
    }

    #[test]
    fn second_resolution_fails() {
        init_test_logging();
        let d = Deferred::<()>::new();
        d.callback(()).expect("first callback");
        let err = d.callback(()).expect_err("second callback");
        assert_eq!(err.kind(), ErrorKind::AlreadyCalled);
        let err = d.errback(Error::msg("late")).expect_err("errback after callback");
        assert_eq!(err.kind(), ErrorKind::AlreadyCalled);
    }

    #[test]
    fn handlers_run_in_attachment_order() {
        init_test_logging();
        let order = Rc::new(RefCell::new(Vec::new()));
        let d = Deferred::<u8>::new();
        for tag in 0..4_u8 {
            let order = Rc::clone(&order);
            d.add_callback(move |v| {
                order.borrow_mut().push(tag);
                Ok(v)
            });
        }
        d.callback(0).expect("callback");
        assert_eq!(*order.borrow(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn error_skips_callbacks_until_errback_recovers() {
        init_test_logging();
        let d = Deferred::<i32>::new();
        d.add_callback(|_| unreachable!("success side must be skipped"))
            .add_errback(|err| {
                assert_eq!(err.message(), Some("bad"));
                Ok(10)
            })
            .add_callback(|v| Ok(v * 2));
        d.errback(Error::msg("bad")).expect("errback");
        assert_eq!(d.peek().map(Result::ok), Some(Some(20)));
    }

    #[test]
    fn handler_panic_becomes_error() {
        init_test_logging();
        let d = Deferred::<i32>::new();
        d.add_callback(|_| panic!("handler blew up"));
        d.callback(1).expect("callback");
        let err = outcome_of(&d).expect("resolved").expect_err("panic captured");
        assert_eq!(err.kind(), ErrorKind::Panicked);
        assert_eq!(err.message(), Some("handler blew up"));
    }

    #[test]
    fn nested_deferred_result_flows_to_outer() {
        init_test_logging();
        crate::test_phase!("nested_deferred_result_flows_to_outer");

        let d1 = Deferred::<String>::new();
        let d2 = Deferred::<String>::new();
        let inner = d2.clone();
        d1.add_callbacks(move |_| Step::wait(inner), Step::err);
        let slot = capture(&d1);

        d1.callback("ignored".into()).expect("callback d1");
        assert!(d1.is_paused());
        assert!(slot.borrow().is_none());

        d2.callback("x".into()).expect("callback d2");
        assert_eq!(
            slot.borrow_mut().take().map(Result::ok),
            Some(Some("x".to_string()))
        );
        assert!(d2.is_consumed());
    }

    #[test]
    fn returning_self_is_invalid_state() {
        init_test_logging();
        let d = Deferred::<i32>::new();
        let me = d.clone();
        d.add_callbacks(move |_| Step::wait(me), Step::err);
        d.callback(1).expect("callback");
        let err = outcome_of(&d).expect("resolved").expect_err("self-wait rejected");
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn pause_and_unpause_gate_draining() {
        init_test_logging();
        let d = Deferred::<i32>::new();
        d.pause();
        d.add_callback(|x| Ok(x + 1));
        d.callback(1).expect("callback");
        assert_eq!(d.peek().map(Result::ok), Some(Some(1)));
        d.unpause();
        assert_eq!(d.peek().map(Result::ok), Some(Some(2)));
    }

    #[test]
    fn cancel_without_canceller_swallows_late_callback() {
        init_test_logging();
        let d = Deferred::<i32>::new();
        let slot = capture(&d);
        d.cancel();
        let err = slot.borrow_mut().take().expect("resolved").expect_err("cancelled");
        assert!(err.is_cancelled());
        d.callback(5).expect("late callback is swallowed");
        let err = d.callback(6).expect_err("only one late callback is swallowed");
        assert_eq!(err.kind(), ErrorKind::AlreadyCalled);
    }

    #[test]
    fn canceller_may_resolve_itself() {
        init_test_logging();
        let d = Deferred::<i32>::with_canceller(|d| {
            let _ = d.callback(-1);
        });
        d.cancel();
        assert_resolved(&d, -1);
    }

    fn assert_resolved(d: &Deferred<i32>, expected: i32) {
        assert_eq!(d.peek().map(Result::ok), Some(Some(expected)));
    }

    #[test]
    fn cancel_cascades_to_awaited_inner_exactly_once() {
        init_test_logging();
        crate::test_phase!("cancel_cascades_to_awaited_inner_exactly_once");

        let hits = Rc::new(Cell::new(0_u32));
        let inner = {
            let hits = Rc::clone(&hits);
            Deferred::<i32>::with_canceller(move |_| hits.set(hits.get() + 1))
        };
        let outer = Deferred::<i32>::new();
        let waiting = inner.clone();
        outer.add_callbacks(move |_| Step::wait(waiting), Step::err);
        let slot = capture(&outer);
        outer.callback(0).expect("callback");

        outer.cancel();
        outer.cancel();
        assert_eq!(hits.get(), 1);
        let err = slot.borrow_mut().take().expect("resolved").expect_err("cancelled");
        assert!(err.is_cancelled());
    }

    #[test]
    fn chain_deferred_forwards_and_rejects_self() {
        init_test_logging();
        let a = Deferred::<i32>::new();
        let b = Deferred::<i32>::new();
        a.chain_deferred(&b).expect("distinct deferreds chain");
        a.callback(3).expect("callback");
        assert_resolved(&b, 3);
        assert!(a.is_consumed());

        let err = b.chain_deferred(&b).expect_err("self chain");
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn unhandled_error_reported_on_drop() {
        init_test_logging();
        let guard = capture_unhandled();
        {
            let d = Deferred::<()>::new();
            d.errback(Error::msg("nobody listened")).expect("errback");
        }
        let reports = guard.take();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].error.message(), Some("nobody listened"));

        {
            let d = Deferred::<()>::new();
            d.errback(Error::msg("handled")).expect("errback");
            d.add_errback(|_| Ok(()));
        }
        assert!(guard.is_empty());
    }

    #[test]
    fn handler_after_consumption_never_runs() {
        init_test_logging();
        let d = Deferred::<i32>::succeed(1);
        assert_eq!(outcome_of(&d).map(Result::ok), Some(Some(1)));
        d.add_callback(|_| unreachable!("consumed deferred must not run handlers"));
        let late = outcome_of(&d).expect("sink still notified").expect_err("consumed");
        assert_eq!(late.kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn then_changes_type_and_cancels_source() {
        init_test_logging();
        let src = Deferred::<i32>::new();
        let shown = src.then(|r| Step::Ready(r.map(|v| format!("v={v}"))));
        src.callback(7).expect("callback");
        assert_eq!(outcome_of(&shown).map(Result::ok), Some(Some("v=7".to_string())));

        let src = Deferred::<i32>::new();
        let out = src.then(|r| Step::Ready(r.map(|v| v * 2)));
        out.cancel();
        assert!(src.called());
        let err = outcome_of(&out).expect("resolved").expect_err("cancelled");
        assert!(err.is_cancelled());
    }

    #[test]
    fn debug_mode_records_sites() {
        init_test_logging();
        set_debugging(true);
        let d = Deferred::<()>::new();
        set_debugging(false);
        d.callback(()).expect("callback");
        let info = d.debug_info().expect("debug info recorded");
        assert!(info.created.file().ends_with("mod.rs"));
        assert!(info.resolved.is_some());
        let err = d.callback(()).expect_err("double fire");
        assert!(err.message().is_some_and(|m| m.contains("already resolved at")));
    }

    #[test]
    fn deep_nesting_unwinds_iteratively() {
        init_test_logging();
        crate::test_phase!("deep_nesting_unwinds_iteratively");

        const DEPTH: usize = 10_000;
        let ds: Vec<Deferred<u32>> = (0..=DEPTH).map(|_| Deferred::new()).collect();
        for pair in ds.windows(2) {
            let next = pair[1].clone();
            pair[0].add_callbacks(move |_| Step::wait(next), Step::err);
        }
        let slot = capture(&ds[0]);

        for d in &ds[..DEPTH] {
            d.callback(0).expect("callback");
            assert!(d.is_paused());
        }
        ds[DEPTH].callback(42).expect("callback innermost");

        assert_eq!(slot.borrow_mut().take().map(Result::ok), Some(Some(42)));
        crate::test_complete!("deep_nesting_unwinds_iteratively", depth = DEPTH);
    }
}
