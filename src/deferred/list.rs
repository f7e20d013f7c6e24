//! Aggregates over several Deferreds.
//!
//! Every aggregate consumes the results of its inputs: handlers attached to
//! an input afterwards never see them. Cancelling an aggregate before it
//! fires cancels every input that is still pending, and the aggregate fails
//! with a cancellation error.

use std::cell::RefCell;
use std::rc::Rc;

use super::{Deferred, Step, WeakDeferred};
use crate::error::{Error, Result};
use crate::tracing_compat::trace;
use crate::types::CancelReason;

fn cancel_all<T: 'static>(inputs: &[WeakDeferred<T>], reason: &CancelReason) {
    for input in inputs.iter().filter_map(WeakDeferred::upgrade) {
        input.cancel_with(reason.clone());
    }
}

struct ListState<T> {
    results: Vec<Option<Result<T>>>,
    remaining: usize,
    done: bool,
}

/// Collects the results of several Deferreds in input order.
///
/// # Example
///
/// ```
/// use deferred::prelude::*;
/// use std::cell::Cell;
/// use std::rc::Rc;
///
/// let a = Deferred::<i32>::new();
/// let b = Deferred::<i32>::new();
/// let all = DeferredList::new([a.clone(), b.clone()]).into_deferred();
/// b.errback(Error::msg("b failed")).unwrap();
/// a.callback(1).unwrap();
///
/// let failures = Rc::new(Cell::new(0));
/// let seen = failures.clone();
/// all.add_sink(move |results| {
///     let results = results.unwrap();
///     seen.set(results.iter().filter(|r| r.is_err()).count());
/// });
/// assert_eq!(failures.get(), 1);
/// ```
#[derive(Debug)]
pub struct DeferredList<T: 'static> {
    inputs: Vec<Deferred<T>>,
    fire_on_one_errback: bool,
}

impl<T: 'static> DeferredList<T> {
    /// Creates a list over `inputs`.
    pub fn new(inputs: impl IntoIterator<Item = Deferred<T>>) -> Self {
        Self {
            inputs: inputs.into_iter().collect(),
            fire_on_one_errback: false,
        }
    }

    /// Fail as soon as any input fails, with a `FirstError` naming its index.
    #[must_use]
    pub const fn fire_on_one_errback(mut self, enabled: bool) -> Self {
        self.fire_on_one_errback = enabled;
        self
    }

    /// Returns a Deferred that fires once every input has a result.
    ///
    /// An empty list fires immediately with an empty vector.
    #[track_caller]
    #[must_use]
    pub fn into_deferred(self) -> Deferred<Vec<Result<T>>> {
        let Self {
            inputs,
            fire_on_one_errback,
        } = self;
        let state = Rc::new(RefCell::new(ListState {
            results: inputs.iter().map(|_| None).collect(),
            remaining: inputs.len(),
            done: false,
        }));
        let weak: Vec<WeakDeferred<T>> = inputs.iter().map(Deferred::downgrade).collect();
        let out = Deferred::with_canceller({
            let state = Rc::clone(&state);
            move |_| {
                state.borrow_mut().done = true;
                cancel_all(&weak, &CancelReason::parent_cancelled());
            }
        });

        if inputs.is_empty() {
            let _ = out.callback(Vec::new());
            return out;
        }

        for (index, input) in inputs.iter().enumerate() {
            let state = Rc::clone(&state);
            let target = out.clone();
            input.add_sink(move |result| {
                let outcome = {
                    let mut st = state.borrow_mut();
                    if st.done {
                        return;
                    }
                    st.remaining -= 1;
                    match result {
                        Err(err) if fire_on_one_errback => {
                            st.done = true;
                            Some(Err(Error::first_error(index, err)))
                        }
                        result => {
                            st.results[index] = Some(result);
                            if st.remaining == 0 {
                                st.done = true;
                                let all: Vec<Result<T>> = st.results.drain(..).flatten().collect();
                                Some(Ok(all))
                            } else {
                                None
                            }
                        }
                    }
                };
                if let Some(outcome) = outcome {
                    trace!(deferred = %target.id(), "deferred list complete");
                    let _ = target.resolve(outcome);
                }
            });
        }
        out
    }
}

/// Waits for every input and fires with their values in input order.
///
/// The first failure fails the result with a `FirstError` whose source is
/// the input's error; the remaining inputs are left running.
#[track_caller]
#[must_use]
pub fn gather_results<T: 'static>(inputs: impl IntoIterator<Item = Deferred<T>>) -> Deferred<Vec<T>> {
    DeferredList::new(inputs)
        .fire_on_one_errback(true)
        .into_deferred()
        .then(|result| Step::Ready(result.and_then(|all| all.into_iter().collect())))
}

struct RaceState {
    remaining: usize,
    done: bool,
    first_failure: Option<(usize, Error)>,
}

/// Fires with the index and value of the first input to succeed.
///
/// Every other input is then cancelled. If all inputs fail, the result fails
/// with a `FirstError` wrapping the failure that arrived first.
#[track_caller]
#[must_use]
pub fn race<T: 'static>(inputs: impl IntoIterator<Item = Deferred<T>>) -> Deferred<(usize, T)> {
    let inputs: Vec<Deferred<T>> = inputs.into_iter().collect();
    let state = Rc::new(RefCell::new(RaceState {
        remaining: inputs.len(),
        done: false,
        first_failure: None,
    }));
    let weak: Rc<Vec<WeakDeferred<T>>> = Rc::new(inputs.iter().map(Deferred::downgrade).collect());
    let out = Deferred::with_canceller({
        let (state, weak) = (Rc::clone(&state), Rc::clone(&weak));
        move |_| {
            state.borrow_mut().done = true;
            cancel_all(&weak, &CancelReason::parent_cancelled());
        }
    });

    if inputs.is_empty() {
        let _ = out.errback(Error::invalid_state("race needs at least one deferred"));
        return out;
    }

    for (index, input) in inputs.iter().enumerate() {
        let state = Rc::clone(&state);
        let weak = Rc::clone(&weak);
        let target = out.clone();
        input.add_sink(move |result| {
            let outcome = {
                let mut st = state.borrow_mut();
                if st.done {
                    return;
                }
                st.remaining -= 1;
                match result {
                    Ok(value) => {
                        st.done = true;
                        Some(Ok((index, value)))
                    }
                    Err(err) => {
                        if st.first_failure.is_none() {
                            st.first_failure = Some((index, err));
                        }
                        if st.remaining == 0 {
                            st.done = true;
                            st.first_failure
                                .take()
                                .map(|(index, err)| Err(Error::first_error(index, err)))
                        } else {
                            None
                        }
                    }
                }
            };
            match outcome {
                Some(Ok(won)) => {
                    trace!(deferred = %target.id(), winner = index, "race won");
                    for (i, loser) in weak.iter().enumerate() {
                        if i != index {
                            if let Some(loser) = loser.upgrade() {
                                loser.cancel_with(CancelReason::race_lost());
                            }
                        }
                    }
                    let _ = target.callback(won);
                }
                Some(Err(err)) => {
                    let _ = target.errback(err);
                }
                None => {}
            }
        });
    }
    out
}
