//! Deferred: chained single-fire results, virtual-time scheduling and a
//! coroutine bridge for single-threaded cooperative code.
//!
//! # Overview
//!
//! A [`Deferred<T>`] stands for a result that is not available yet. Handlers
//! are attached in order and run synchronously, each seeing the previous
//! one's output, as soon as the result arrives. A handler can hand back
//! another Deferred and the chain waits for it. A [`Scheduler`] runs work at
//! given times over a wall clock or a virtual clock that only moves when the
//! caller advances it, which makes timing code fully deterministic in tests.
//!
//! # Core Guarantees
//!
//! - **Single fire**: a Deferred resolves once; a second resolution is an error
//! - **Ordered handlers**: handlers run in attachment order, whether attached before or after resolution
//! - **No silent failures**: errors nobody consumed are reported when the Deferred is dropped
//! - **Ordered time**: scheduled calls fire in time order, ties in scheduling order
//! - **Cooperative cancellation**: cancelling cascades into whatever the chain is waiting on
//!
//! # Module Structure
//!
//! - [`deferred`](mod@deferred): the Deferred, its chain, aggregates and cooperative locks
//! - [`coroutine`]: drives `async` code that awaits Deferreds
//! - [`time`]: scheduler, delayed calls, looping calls and timeouts
//! - [`runtime`]: hand-off from other threads onto the scheduler thread
//! - [`config`]: scheduler configuration from code, environment or TOML
//! - [`error`](mod@error): error types
//! - [`observability`]: unhandled-error reporting
//! - [`types`]: identifiers, time values and cancellation reasons
//! - [`tracing_compat`]: optional tracing integration (`tracing-integration` feature)
//!
//! # Example
//!
//! ```
//! use deferred::prelude::*;
//! use std::time::Duration;
//!
//! let sched = Scheduler::new();
//! let d = defer_later(&sched, Duration::from_secs(1), || Ok(20));
//! d.add_callback(|x| Ok(x + 1));
//! let out = ensure_deferred({
//!     let d = d.clone();
//!     async move { Ok(d.await? * 2) }
//! });
//!
//! sched.advance(Duration::from_secs(1));
//! assert_eq!(out.peek().map(Result::ok), Some(Some(42)));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_inception)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]

pub mod config;
pub mod coroutine;
pub mod deferred;
pub mod error;
pub mod observability;
pub mod runtime;
pub mod time;
pub mod tracing_compat;
pub mod types;

// ── Test-only modules ───────────────────────────────────────────────────
#[cfg(any(test, feature = "test-internals"))]
pub mod test_utils;

// Re-exports for convenient access to core types
pub use config::{ConfigError, SchedulerConfig};
pub use coroutine::ensure_deferred;
pub use deferred::{
    Chainable, Deferred, DeferredList, DeferredLock, DeferredQueue, DeferredSemaphore, Step,
    WeakDeferred, gather_results, maybe_deferred, race,
};
pub use error::{Error, ErrorCategory, ErrorKind, Result, ResultExt};
pub use runtime::{Handoff, Resolver};
pub use time::{Clock, DelayedCall, LoopingCall, Scheduler, defer_later};
pub use types::{CallId, CancelKind, CancelReason, DeferredId, Time};

pub mod prelude {
    //! The types most code needs, in one import.

    pub use crate::coroutine::ensure_deferred;
    pub use crate::deferred::{Chainable, Deferred, DeferredList, Step, gather_results, race};
    pub use crate::error::{Error, ErrorKind, Result};
    pub use crate::time::{Clock, LoopingCall, Scheduler, defer_later};
}
