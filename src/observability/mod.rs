//! Diagnostics for cooperative code.
//!
//! Logging itself goes through [`tracing_compat`](crate::tracing_compat). This
//! module holds the pieces that need state: the unhandled-error report sink
//! and its per-thread capture used by tests.

pub mod unhandled;

pub use unhandled::{CaptureGuard, ErrorOrigin, UnhandledError, capture_unhandled};
