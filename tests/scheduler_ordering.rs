#![allow(missing_docs)]

//! Property tests for scheduled-call ordering under the virtual clock.

#[macro_use]
mod common;

use common::{test_proptest_config, test_scheduler};
use deferred::prelude::*;
use deferred::DelayedCall;
use deferred::types::Time;
use proptest::prelude::*;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

#[derive(Debug, Clone)]
struct Plan {
    delay_ms: u64,
    reset_to_ms: Option<u64>,
    cancel: bool,
}

fn plan_strategy() -> impl Strategy<Value = Plan> {
    (0_u64..50, prop::option::of(0_u64..50), prop::bool::weighted(0.15)).prop_map(
        |(delay_ms, reset_to_ms, cancel)| Plan {
            delay_ms,
            reset_to_ms,
            cancel,
        },
    )
}

proptest! {
    #![proptest_config(test_proptest_config(128))]

    #[test]
    fn calls_fire_in_time_then_scheduling_order(plans in prop::collection::vec(plan_strategy(), 1..40)) {
        let sched = test_scheduler();
        let fired: Rc<RefCell<Vec<(usize, Time)>>> = Rc::new(RefCell::new(Vec::new()));

        let calls: Vec<DelayedCall> = plans
            .iter()
            .enumerate()
            .map(|(index, plan)| {
                let fired = Rc::clone(&fired);
                let clock = sched.clone();
                sched.call_later(Duration::from_millis(plan.delay_ms), move || {
                    fired.borrow_mut().push((index, clock.now()));
                })
            })
            .collect();

        // Model: every insertion or reset takes the next sequence number.
        let mut expected: Vec<(u64, usize, usize)> = Vec::new();
        let mut seq = plans.len();
        let mut keys: Vec<(u64, usize)> = plans
            .iter()
            .enumerate()
            .map(|(index, plan)| (plan.delay_ms, index))
            .collect();
        for (index, plan) in plans.iter().enumerate() {
            if let Some(ms) = plan.reset_to_ms {
                calls[index].reset(Duration::from_millis(ms)).expect("reset pending call");
                keys[index] = (ms, seq);
                seq += 1;
            }
        }
        for (index, plan) in plans.iter().enumerate() {
            if plan.cancel {
                calls[index].cancel().expect("cancel pending call");
            } else {
                expected.push((keys[index].0, keys[index].1, index));
            }
        }
        expected.sort_unstable();

        prop_assert_eq!(sched.pending(), expected.len());
        let count = sched.advance(Duration::from_millis(100));
        prop_assert_eq!(count, expected.len());

        let fired = fired.borrow();
        let order: Vec<usize> = fired.iter().map(|(index, _)| *index).collect();
        let want: Vec<usize> = expected.iter().map(|(_, _, index)| *index).collect();
        prop_assert_eq!(order, want);

        for pair in fired.windows(2) {
            prop_assert!(pair[0].1 <= pair[1].1, "fire times went backwards");
        }
        for (index, at) in fired.iter() {
            prop_assert_eq!(at.as_millis(), keys[*index].0);
        }
        prop_assert_eq!(sched.now(), Time::from_millis(100));
    }

    #[test]
    fn stepping_never_fires_early(delays in prop::collection::vec(1_u64..200, 1..20), step in 1_u64..30) {
        let sched = test_scheduler();
        let early = Rc::new(RefCell::new(0_usize));
        for delay in &delays {
            let due = Time::from_millis(*delay);
            let clock = sched.clone();
            let early = Rc::clone(&early);
            sched.call_later(Duration::from_millis(*delay), move || {
                if clock.now() < due {
                    *early.borrow_mut() += 1;
                }
            });
        }
        let fired = common::advance_in_steps(&sched, Duration::from_millis(step), Duration::from_millis(200));
        prop_assert_eq!(fired, delays.len());
        prop_assert_eq!(*early.borrow(), 0);
        prop_assert_eq!(sched.pending(), 0);
    }
}

#[test]
fn pending_list_matches_fire_order() {
    let sched = test_scheduler();
    let late = sched.call_later(Duration::from_secs(3), || {});
    let soon = sched.call_later(Duration::from_secs(1), || {});
    let mid = sched.call_later(Duration::from_secs(2), || {});
    let ids: Vec<_> = sched.delayed_calls().iter().map(DelayedCall::id).collect();
    assert_eq!(ids, vec![soon.id(), mid.id(), late.id()]);

    mid.cancel().expect("cancel");
    assert_eq!(sched.delayed_calls().len(), 2);
    assert_eq!(sched.next_time(), Some(Time::from_secs(1)));
}
