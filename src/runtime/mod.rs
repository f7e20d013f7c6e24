//! The boundary between the scheduler thread and the rest of the process.
//!
//! Everything in this crate is single-threaded except the hand-off handles
//! re-exported here.

pub mod handoff;

pub use handoff::{Handoff, Resolver};
