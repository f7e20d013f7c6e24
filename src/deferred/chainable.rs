//! The handler-attachment surface shared by chainable results.

use std::panic::{AssertUnwindSafe, catch_unwind};

use super::{Deferred, Link, Step};
use crate::error::{Error, Result};

/// Types with an ordered success/failure handler chain.
///
/// Every `add_*` method returns `&Self` so attachments can be chained:
///
/// ```
/// use deferred::prelude::*;
///
/// let d = Deferred::<u32>::new();
/// d.add_callback(|v| Ok(v * 10))
///     .add_errback(|_| Ok(0))
///     .add_both(|r| r.map(|v| v + 1));
/// d.callback(4).unwrap();
/// assert_eq!(d.peek().map(Result::ok), Some(Some(41)));
/// ```
pub trait Chainable {
    /// The success value carried by the chain.
    type Item: 'static;

    /// Appends a handler that sees either side of the result.
    fn add_handler<H>(&self, handler: H) -> &Self
    where
        H: FnOnce(Result<Self::Item>) -> Step<Self::Item> + 'static;

    /// Suspends draining; calls nest.
    fn pause(&self);

    /// Undoes one `pause`.
    fn unpause(&self);

    /// Requests cancellation.
    fn cancel(&self);

    /// Appends a success/failure handler pair. Exactly one of them runs.
    fn add_callbacks<F, G>(&self, on_success: F, on_failure: G) -> &Self
    where
        F: FnOnce(Self::Item) -> Step<Self::Item> + 'static,
        G: FnOnce(Error) -> Step<Self::Item> + 'static,
    {
        self.add_handler(move |result| match result {
            Ok(value) => on_success(value),
            Err(err) => on_failure(err),
        })
    }

    /// Appends a success handler; errors pass through untouched.
    fn add_callback<F>(&self, on_success: F) -> &Self
    where
        F: FnOnce(Self::Item) -> Result<Self::Item> + 'static,
    {
        self.add_callbacks(move |value| Step::Ready(on_success(value)), Step::err)
    }

    /// Appends a failure handler; success values pass through untouched.
    fn add_errback<G>(&self, on_failure: G) -> &Self
    where
        G: FnOnce(Error) -> Result<Self::Item> + 'static,
    {
        self.add_callbacks(Step::ok, move |err| Step::Ready(on_failure(err)))
    }

    /// Appends one handler used for both sides.
    fn add_both<H>(&self, handler: H) -> &Self
    where
        H: FnOnce(Result<Self::Item>) -> Result<Self::Item> + 'static,
    {
        self.add_handler(move |result| Step::Ready(handler(result)))
    }
}

impl<T: 'static> Chainable for Deferred<T> {
    type Item = T;

    fn add_handler<H>(&self, handler: H) -> &Self
    where
        H: FnOnce(Result<T>) -> Step<T> + 'static,
    {
        self.push_link(Link::Handler(Box::new(handler)));
        self
    }

    fn pause(&self) {
        Self::pause(self);
    }

    fn unpause(&self) {
        Self::unpause(self);
    }

    fn cancel(&self) {
        Self::cancel(self);
    }
}

/// Runs `f` and wraps its outcome in a resolved Deferred.
///
/// A panic inside `f` becomes an `ErrorKind::Panicked` failure.
#[track_caller]
pub fn maybe_deferred<T, F>(f: F) -> Deferred<T>
where
    T: 'static,
    F: FnOnce() -> Result<T>,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Deferred::succeed(value),
        Ok(Err(err)) => Deferred::fail(err),
        Err(payload) => Deferred::fail(Error::panicked(payload.as_ref())),
    }
}
