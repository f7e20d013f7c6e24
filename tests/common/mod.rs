#![allow(dead_code)]
#![allow(unused_imports)]
//! Shared integration test utilities.
//!
//! Import with:
//! ```ignore
//! mod common;
//! use common::*;
//! ```

use deferred::{Deferred, Scheduler};
use proptest::prelude::ProptestConfig;
use proptest::test_runner::RngSeed;
use std::time::Duration;

pub use deferred::test_utils::{capture, init_test_logging, outcome_of};

/// Default seed for property tests when running under CI.
pub const DEFAULT_PROPTEST_SEED: u64 = 0x5EED_5EED;

const PROPTEST_SEED_ENV: &str = "DEFERRED_PROPTEST_SEED";

/// Build a ProptestConfig with deterministic seed support for CI.
#[must_use]
pub fn test_proptest_config(cases: u32) -> ProptestConfig {
    let mut config = ProptestConfig::with_cases(cases);
    // Honor an existing PROPTEST_RNG_SEED, otherwise apply our own.
    if matches!(config.rng_seed, RngSeed::Random) {
        if let Some(seed) = read_proptest_seed() {
            config.rng_seed = RngSeed::Fixed(seed);
        }
    }
    config
}

fn read_proptest_seed() -> Option<u64> {
    if let Ok(value) = std::env::var(PROPTEST_SEED_ENV) {
        return value.parse::<u64>().ok();
    }
    std::env::var("CI").is_ok().then_some(DEFAULT_PROPTEST_SEED)
}

/// A virtual-time scheduler with logging initialized.
#[must_use]
pub fn test_scheduler() -> Scheduler {
    init_test_logging();
    Scheduler::new()
}

/// Advances `sched` in `step` increments until `total` has elapsed.
pub fn advance_in_steps(sched: &Scheduler, step: Duration, total: Duration) -> usize {
    let mut fired = 0;
    let mut elapsed = Duration::ZERO;
    while elapsed < total {
        let next = step.min(total - elapsed);
        fired += sched.advance(next);
        elapsed += next;
    }
    fired
}

/// Returns a Deferred that resolves with `value` after `delay` on `sched`.
pub fn value_later<T: 'static>(sched: &Scheduler, delay: Duration, value: T) -> Deferred<T> {
    deferred::defer_later(sched, delay, move || Ok(value))
}
