#![allow(missing_docs)]

//! Deferred chain semantics: ordering, nesting, recovery and cancellation.

#[macro_use]
mod common;

use common::{capture, init_test_logging, outcome_of};
use deferred::observability::capture_unhandled;
use deferred::prelude::*;
use deferred::types::CancelKind;
use deferred::{assert_pending, assert_resolved_err, assert_resolved_ok, test_phase};
use std::cell::RefCell;
use std::rc::Rc;

#[test]
fn handler_result_is_the_same_before_and_after_firing() {
    init_test_logging();
    test_phase!("handler_result_is_the_same_before_and_after_firing");

    let attached_first = Deferred::<i32>::new();
    attached_first.add_callback(|x| Ok(x + 1));
    attached_first.callback(1).expect("callback");

    let fired_first = Deferred::<i32>::new();
    fired_first.callback(1).expect("callback");
    fired_first.add_callback(|x| Ok(x + 1));

    assert_resolved_ok!(attached_first, 2);
    assert_resolved_ok!(fired_first, 2);
}

#[test]
fn nested_deferred_result_flows_to_outer_chain() {
    init_test_logging();
    test_phase!("nested_deferred_result_flows_to_outer_chain");

    let d1 = Deferred::<String>::new();
    let d2 = Deferred::<String>::new();
    let inner = d2.clone();
    d1.add_callbacks(move |_| Step::wait(inner), Step::err);
    let seen = Rc::new(RefCell::new(Vec::new()));
    let log = Rc::clone(&seen);
    d1.add_callback(move |v| {
        log.borrow_mut().push(v.clone());
        Ok(v)
    });

    d1.callback("ignored".into()).expect("outer");
    assert!(seen.borrow().is_empty());
    assert!(d1.is_paused());

    d2.callback("x".into()).expect("inner");
    assert_eq!(*seen.borrow(), vec!["x".to_string()]);
    assert_resolved_ok!(d1, "x".to_string());
}

#[test]
fn errback_recovers_and_callbacks_resume() {
    init_test_logging();
    let d = Deferred::<u32>::new();
    let trail = Rc::new(RefCell::new(Vec::new()));
    let (a, b, c) = (Rc::clone(&trail), Rc::clone(&trail), Rc::clone(&trail));
    d.add_callback(move |v| {
        a.borrow_mut().push("skipped");
        Ok(v)
    });
    d.add_errback(move |_| {
        b.borrow_mut().push("recovered");
        Ok(10)
    });
    d.add_callback(move |v| {
        c.borrow_mut().push("resumed");
        Ok(v * 2)
    });

    d.errback(Error::msg("first failure")).expect("errback");
    assert_eq!(*trail.borrow(), vec!["recovered", "resumed"]);
    assert_resolved_ok!(d, 20);
}

#[test]
fn second_resolution_is_rejected() {
    init_test_logging();
    let d = Deferred::<u8>::new();
    d.callback(1).expect("first");
    let err = d.callback(2).expect_err("second");
    assert_eq!(err.kind(), ErrorKind::AlreadyCalled);
    let err = d.errback(Error::msg("late")).expect_err("third");
    assert_eq!(err.kind(), ErrorKind::AlreadyCalled);
    assert_resolved_ok!(d, 1);
}

#[test]
fn panicking_handler_becomes_error() {
    init_test_logging();
    let d = Deferred::<u8>::new();
    d.add_callback(|_| panic!("handler exploded"));
    d.callback(1).expect("callback");
    let err = outcome_of(&d).expect("resolved").expect_err("panicked");
    assert_eq!(err.kind(), ErrorKind::Panicked);
    assert_eq!(err.message(), Some("handler exploded"));
}

#[test]
fn cancel_without_canceller_swallows_late_callback() {
    init_test_logging();
    let d = Deferred::<u8>::new();
    let slot = capture(&d);
    d.cancel();
    d.callback(5).expect("producer's late callback is swallowed");
    let err = slot.borrow_mut().take().expect("resolved").expect_err("cancelled");
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert_eq!(err.cancel_reason().map(|r| r.kind), Some(CancelKind::User));
}

#[test]
fn cancel_cascades_through_a_chain_of_waits() {
    init_test_logging();
    test_phase!("cancel_cascades_through_a_chain_of_waits");

    let cancels = Rc::new(RefCell::new(0));
    let counter = Rc::clone(&cancels);
    let innermost = Deferred::<u8>::with_canceller(move |_| *counter.borrow_mut() += 1);
    let middle = Deferred::<u8>::new();
    let outer = Deferred::<u8>::new();

    let waited = innermost.clone();
    middle.add_callbacks(move |_| Step::wait(waited), Step::err);
    let waited = middle.clone();
    outer.add_callbacks(move |_| Step::wait(waited), Step::err);
    middle.callback(0).expect("middle");
    outer.callback(0).expect("outer");

    outer.cancel();
    assert_eq!(*cancels.borrow(), 1);
    assert!(innermost.called());
    let err = outcome_of(&outer).expect("resolved").expect_err("cancelled");
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert_eq!(
        err.cancel_reason().map(|r| r.kind),
        Some(CancelKind::ParentCancelled)
    );
}

#[test]
fn dropped_failure_is_reported_once() {
    init_test_logging();
    let guard = capture_unhandled();
    {
        let d = Deferred::<u8>::new();
        d.errback(Error::msg("nobody listened")).expect("errback");
    }
    {
        let handled = Deferred::<u8>::new();
        handled.add_errback(|_| Ok(0));
        handled.errback(Error::msg("recovered")).expect("errback");
    }
    let reports = guard.take();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].error.message(), Some("nobody listened"));
}

#[test]
fn then_changes_type_and_propagates_cancel() {
    init_test_logging();
    let source = Deferred::<u32>::new();
    let text = source.then(|r| Step::Ready(r.map(|n| format!("#{n}"))));
    source.callback(7).expect("callback");
    assert_resolved_ok!(text, "#7".to_string());

    let source = Deferred::<u32>::new();
    let text = source.then(|r| Step::Ready(r.map(|n| n.to_string())));
    text.cancel();
    assert!(source.called());
    assert_resolved_err!(text, ErrorKind::Cancelled);
}

#[test]
fn gather_composes_with_then() {
    init_test_logging();
    let a = Deferred::<u32>::new();
    let b = Deferred::<u32>::new();
    let total = gather_results([a.clone(), b.clone()])
        .then(|r| Step::Ready(r.map(|values| values.into_iter().sum::<u32>())));
    assert_pending!(total);

    b.callback(5).expect("b");
    assert_pending!(total);
    a.callback(4).expect("a");
    assert_resolved_ok!(total, 9);
}

#[test]
fn race_winner_cancels_the_rest() {
    init_test_logging();
    let slow = Deferred::<&'static str>::new();
    let fast = Deferred::<&'static str>::new();
    let winner = race([slow.clone(), fast.clone()]);
    fast.callback("fast").expect("fast");
    assert!(slow.called());
    assert_resolved_ok!(winner, (1, "fast"));
}
