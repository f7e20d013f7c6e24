//! Handles to scheduled calls.

use core::fmt;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::time::Duration;

use super::scheduler::SchedulerCore;
use crate::error::{Error, ErrorKind, Result};
use crate::tracing_compat::trace;
use crate::types::{CallId, Time};

/// Lifecycle of a scheduled call. `Fired` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CallState {
    Pending,
    Fired,
    Cancelled,
}

pub(crate) type Work = Box<dyn FnOnce()>;

/// State shared between the scheduler's queue and the user's handle.
pub(crate) struct CallShared {
    pub(crate) id: CallId,
    pub(crate) time: Cell<Time>,
    /// Sequence number of the queue entry that is currently authoritative.
    pub(crate) seq: Cell<u64>,
    pub(crate) state: Cell<CallState>,
    pub(crate) work: RefCell<Option<Work>>,
}

impl CallShared {
    pub(crate) fn new(id: CallId, time: Time, work: Work) -> Self {
        Self {
            id,
            time: Cell::new(time),
            seq: Cell::new(0),
            state: Cell::new(CallState::Pending),
            work: RefCell::new(Some(work)),
        }
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.state.get() == CallState::Pending
    }
}

/// A call scheduled to run at a specific time.
///
/// The handle can cancel, reset or delay the call until it fires. Dropping
/// the handle does not cancel it.
#[derive(Clone)]
pub struct DelayedCall {
    pub(crate) shared: Rc<CallShared>,
    pub(crate) core: Weak<SchedulerCore>,
}

impl DelayedCall {
    /// Returns the call's identity.
    #[must_use]
    pub fn id(&self) -> CallId {
        self.shared.id
    }

    /// Returns the time the call is scheduled to fire at.
    #[must_use]
    pub fn time(&self) -> Time {
        self.shared.time.get()
    }

    /// Returns true until the call fires or is cancelled.
    #[must_use]
    pub fn active(&self) -> bool {
        self.shared.is_pending()
    }

    fn ensure_pending(&self) -> Result<()> {
        match self.shared.state.get() {
            CallState::Pending => Ok(()),
            CallState::Fired => Err(Error::new(ErrorKind::AlreadyFired)
                .with_message(format!("{} already fired", self.shared.id))),
            CallState::Cancelled => Err(Error::new(ErrorKind::AlreadyCancelled)
                .with_message(format!("{} already cancelled", self.shared.id))),
        }
    }

    fn scheduler(&self) -> Result<Rc<SchedulerCore>> {
        self.core
            .upgrade()
            .ok_or_else(|| Error::invalid_state("scheduler was dropped"))
    }

    /// Cancels the call.
    ///
    /// Fails with `AlreadyCancelled` or `AlreadyFired` when the call is no
    /// longer pending.
    pub fn cancel(&self) -> Result<()> {
        self.ensure_pending()?;
        self.shared.state.set(CallState::Cancelled);
        if let Some(core) = self.core.upgrade() {
            core.forget(&self.shared);
        }
        trace!(call = %self.shared.id, "cancelled");
        let work = self.shared.work.borrow_mut().take();
        drop(work);
        Ok(())
    }

    /// Reschedules the call to fire `delay` from now.
    pub fn reset(&self, delay: Duration) -> Result<()> {
        self.ensure_pending()?;
        let core = self.scheduler()?;
        let when = core.now() + delay;
        core.reschedule(&self.shared, when);
        Ok(())
    }

    /// Pushes the call's fire time back by `extra`.
    pub fn delay(&self, extra: Duration) -> Result<()> {
        self.ensure_pending()?;
        let core = self.scheduler()?;
        let when = self.shared.time.get() + extra;
        core.reschedule(&self.shared, when);
        Ok(())
    }
}

impl fmt::Debug for DelayedCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelayedCall")
            .field("id", &self.shared.id)
            .field("time", &self.shared.time.get())
            .field("state", &self.shared.state.get())
            .finish()
    }
}

impl fmt::Display for DelayedCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.shared.state.get() {
            CallState::Pending => "pending",
            CallState::Fired => "fired",
            CallState::Cancelled => "cancelled",
        };
        write!(f, "<{} at {} {state}>", self.shared.id, self.shared.time.get())
    }
}
