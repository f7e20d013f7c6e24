//! Core value types.
//!
//! - [`id`]: identifiers (`CallId`, `DeferredId`) and the clock instant [`Time`]
//! - [`cancel`]: cancellation reason and kind types

pub mod cancel;
pub mod id;

pub use cancel::{CancelKind, CancelReason};
pub use id::{CallId, DeferredId, Time};
