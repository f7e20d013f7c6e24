//! Time: scheduled calls, looping calls and timeouts.
//!
//! - [`source`]: time sources ([`WallClock`], [`VirtualClock`])
//! - [`scheduler`]: the [`Scheduler`] and the [`Clock`] trait
//! - [`delayed_call`]: handles to scheduled calls
//! - [`looping`]: [`LoopingCall`]
//! - [`timeout`]: [`Deferred::add_timeout`](crate::Deferred::add_timeout) and
//!   [`defer_later`]

pub mod delayed_call;
mod heap;
pub mod looping;
pub mod scheduler;
pub mod source;
pub mod timeout;

pub use delayed_call::DelayedCall;
pub use looping::LoopingCall;
pub use scheduler::{Clock, Scheduler};
pub use source::{TimeSource, VirtualClock, WallClock};
pub use timeout::defer_later;
