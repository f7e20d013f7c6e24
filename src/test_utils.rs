//! Test utilities for deferred.
//!
//! This module provides shared helpers for unit and integration tests:
//! - Consistent tracing-based logging initialization
//! - Phase/section macros for readable test output
//! - Helpers that observe a Deferred's outcome from the outside
//!
//! # Example
//! ```
//! use deferred::test_utils::{init_test_logging, outcome_of};
//! use deferred::Deferred;
//!
//! init_test_logging();
//! let d = Deferred::succeed(3);
//! assert_eq!(outcome_of(&d).map(Result::ok), Some(Some(3)));
//! ```

use crate::Deferred;
use crate::error::Result;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Once;
use tracing_subscriber::fmt::format::FmtSpan;

static INIT_LOGGING: Once = Once::new();

/// Initialize test logging with trace-level output.
///
/// Safe to call multiple times; only initializes once.
pub fn init_test_logging() {
    init_test_logging_with_level(tracing::Level::TRACE);
}

/// Initialize test logging with a custom level.
///
/// The first call wins; later calls are no-ops.
pub fn init_test_logging_with_level(level: tracing::Level) {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_test_writer()
            .with_file(true)
            .with_line_number(true)
            .with_target(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_ansi(false)
            .try_init();
    });
}

/// A slot that captures the final outcome of a Deferred chain.
pub type OutcomeSlot<T> = Rc<RefCell<Option<Result<T>>>>;

/// Appends a terminal handler that records the chain's outcome.
///
/// The returned slot stays `None` until the chain reaches its end. The handler
/// consumes the result, so errors recorded this way are never reported as
/// unhandled.
pub fn capture<T: 'static>(d: &Deferred<T>) -> OutcomeSlot<T> {
    let slot: OutcomeSlot<T> = Rc::new(RefCell::new(None));
    let sink = Rc::clone(&slot);
    d.add_sink(move |res| {
        *sink.borrow_mut() = Some(res);
    });
    slot
}

/// Returns the chain's outcome if it has already resolved.
///
/// This consumes the Deferred's result; it is intended for assertions at the
/// end of a test.
pub fn outcome_of<T: 'static>(d: &Deferred<T>) -> Option<Result<T>> {
    capture(d).borrow_mut().take()
}

/// Log a test phase transition with a visual separator.
#[macro_export]
macro_rules! test_phase {
    ($name:expr) => {
        tracing::info!(phase = %$name, "========================================");
        tracing::info!(phase = %$name, "TEST PHASE: {}", $name);
        tracing::info!(phase = %$name, "========================================");
    };
}

/// Log a section within a test phase.
#[macro_export]
macro_rules! test_section {
    ($name:expr) => {
        tracing::debug!(section = %$name, "--- {} ---", $name);
    };
}

/// Log test completion with summary.
#[macro_export]
macro_rules! test_complete {
    ($name:expr) => {
        tracing::info!(test = %$name, "test completed successfully: {}", $name);
    };
    ($name:expr, $($key:ident = $value:expr),* $(,)?) => {
        tracing::info!(
            test = %$name,
            $($key = %$value,)*
            "test completed successfully: {}",
            $name
        );
    };
}

/// Log before assertions for context.
#[macro_export]
macro_rules! assert_with_log {
    ($cond:expr, $msg:expr, $expected:expr, $actual:expr) => {
        tracing::debug!(
            expected = ?$expected,
            actual = ?$actual,
            "Asserting: {}",
            $msg
        );
        assert!($cond, "{}: expected {:?}, got {:?}", $msg, $expected, $actual);
    };
}

/// Assert that a Deferred has resolved successfully with a specific value.
#[macro_export]
macro_rules! assert_resolved_ok {
    ($deferred:expr, $expected:expr) => {
        match $crate::test_utils::outcome_of(&$deferred) {
            Some(Ok(v)) => assert_eq!(v, $expected),
            other => unreachable!("expected Ok({:?}), got {:?}", $expected, other),
        }
    };
}

/// Assert that a Deferred has failed with the given error kind.
#[macro_export]
macro_rules! assert_resolved_err {
    ($deferred:expr, $kind:expr) => {
        match $crate::test_utils::outcome_of(&$deferred) {
            Some(Err(e)) => assert_eq!(e.kind(), $kind, "unexpected error: {e}"),
            other => unreachable!("expected Err({:?}), got {:?}", $kind, other.map(|r| r.is_ok())),
        }
    };
}

/// Assert that a Deferred has not resolved yet.
#[macro_export]
macro_rules! assert_pending {
    ($deferred:expr) => {
        assert!(
            !$deferred.called(),
            "expected {} to be pending",
            $deferred.id()
        );
    };
}
