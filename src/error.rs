//! Error types and error handling strategy.
//!
//! Errors travel through Deferred chains as values: a chain carries
//! `Result<T, Error>` and the tag decides whether the success or the failure
//! side of the next handler pair runs. Error handling follows these principles:
//!
//! - Errors are explicit and typed, and cheap to clone (sources are `Arc`ed)
//! - A panic inside a handler or scheduled call is isolated and converted to
//!   [`ErrorKind::Panicked`]
//! - User errors keep their concrete type and can be recovered with
//!   [`Error::downcast_ref`]
//!
//! # Error Categories
//!
//! - **Resolution**: firing a Deferred twice, touching a terminal DelayedCall
//! - **Cancellation**: cancelled operations and synthesized timeouts
//! - **Usage**: API misuse such as self-chaining or restarting a running loop
//! - **Capacity**: bounded queue limits
//! - **User**: errors raised by application handlers
//! - **Internal**: bugs and invariant violations

use core::fmt;
use std::any::Any;
use std::panic::Location;
use std::sync::Arc;
use std::time::Duration;

use crate::types::CancelReason;

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    // === Resolution ===
    /// A Deferred was resolved a second time.
    AlreadyCalled,
    /// A DelayedCall was cancelled, reset or delayed after it was cancelled.
    AlreadyCancelled,
    /// A DelayedCall was cancelled, reset or delayed after it fired.
    AlreadyFired,

    // === Cancellation ===
    /// Operation was cancelled.
    Cancelled,
    /// Operation did not complete before its deadline.
    TimedOut,

    // === Usage ===
    /// Invalid state transition or API misuse.
    InvalidState,
    /// A handler, scheduled call or coroutine panicked.
    Panicked,
    /// One input of an aggregate failed; the original error is the source.
    FirstError,
    /// A cross-thread resolver was dropped without resolving.
    Abandoned,

    // === Capacity ===
    /// A bounded queue is full.
    QueueOverflow,
    /// A bounded queue has too many waiting consumers.
    QueueUnderflow,

    // === Internal ===
    /// Internal error (bug).
    Internal,

    // === User ===
    /// User-provided error.
    User,
}

impl ErrorKind {
    /// Returns the error category for this kind.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::AlreadyCalled | Self::AlreadyCancelled | Self::AlreadyFired => {
                ErrorCategory::Resolution
            }
            Self::Cancelled | Self::TimedOut => ErrorCategory::Cancellation,
            Self::InvalidState | Self::Panicked | Self::FirstError | Self::Abandoned => {
                ErrorCategory::Usage
            }
            Self::QueueOverflow | Self::QueueUnderflow => ErrorCategory::Capacity,
            Self::Internal => ErrorCategory::Internal,
            Self::User => ErrorCategory::User,
        }
    }
}

/// High-level error category for grouping related errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Single-fire and terminal-state violations.
    Resolution,
    /// Cancellation and timeouts.
    Cancellation,
    /// API misuse and captured panics.
    Usage,
    /// Bounded resource limits.
    Capacity,
    /// Internal errors.
    Internal,
    /// User-originated errors.
    User,
}

/// The error value carried by Deferred chains and returned by fallible operations.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
    cancel_reason: Option<CancelReason>,
}

impl Error {
    /// Creates a new error with the given kind.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            source: None,
            cancel_reason: None,
        }
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns true if the error has the given kind.
    #[must_use]
    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }

    /// Returns true if this error represents cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self.kind, ErrorKind::Cancelled)
    }

    /// Returns true if this error is a timeout.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self.kind, ErrorKind::TimedOut)
    }

    /// Adds a message description to the error.
    #[must_use]
    pub fn with_message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }

    /// Adds a source error to the chain.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Wraps an application error.
    ///
    /// The concrete error stays reachable through [`downcast_ref`](Self::downcast_ref).
    #[must_use]
    pub fn user(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        let message = source.to_string();
        Self::new(ErrorKind::User)
            .with_message(message)
            .with_source(source)
    }

    /// Creates a user error from a plain message.
    #[must_use]
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::User).with_message(message)
    }

    /// Creates a cancellation error from a structured reason.
    #[must_use]
    pub fn cancelled(reason: &CancelReason) -> Self {
        let mut err = Self::new(ErrorKind::Cancelled).with_message(format!("{reason}"));
        err.cancel_reason = Some(reason.clone());
        err
    }

    /// Creates the error a timeout helper synthesizes after `timeout` elapsed.
    #[must_use]
    pub fn timed_out(timeout: Duration) -> Self {
        Self::new(ErrorKind::TimedOut)
            .with_message(format!("deferred timed out after {timeout:?}"))
    }

    /// Creates the error for a second resolution of a Deferred.
    #[must_use]
    pub fn already_called(first: Option<&'static Location<'static>>) -> Self {
        let err = Self::new(ErrorKind::AlreadyCalled);
        match first {
            Some(loc) => err.with_message(format!("already resolved at {loc}")),
            None => err,
        }
    }

    /// Creates an invalid state (API misuse) error.
    #[must_use]
    pub fn invalid_state(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidState).with_message(detail)
    }

    /// Converts a captured panic payload into an error.
    #[must_use]
    pub fn panicked(payload: &(dyn Any + Send)) -> Self {
        let detail = payload
            .downcast_ref::<&'static str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        Self::new(ErrorKind::Panicked).with_message(detail)
    }

    /// Creates an aggregate failure pointing at the failing input.
    #[must_use]
    pub fn first_error(index: usize, cause: Self) -> Self {
        Self::new(ErrorKind::FirstError)
            .with_message(format!("input #{index} failed: {cause}"))
            .with_source(cause)
    }

    /// Creates an internal error (bug).
    #[must_use]
    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal).with_message(detail)
    }

    /// Returns the error category.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        self.kind.category()
    }

    /// Returns the error message, if any.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Returns the cancellation reason for cancellation errors.
    #[must_use]
    pub fn cancel_reason(&self) -> Option<&CancelReason> {
        self.cancel_reason.as_ref()
    }

    /// Returns the source error downcast to `E`, if it has that type.
    #[must_use]
    pub fn downcast_ref<E: std::error::Error + 'static>(&self) -> Option<&E> {
        self.source.as_deref().and_then(|e| e.downcast_ref::<E>())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(msg) = &self.message {
            write!(f, ": {msg}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as _)
    }
}

/// Extension trait for adding context to Results.
#[allow(clippy::result_large_err)]
pub trait ResultExt<T> {
    /// Attach a context message on error.
    fn context(self, msg: impl Into<String>) -> Result<T>;
    /// Attach context message computed lazily on error.
    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for core::result::Result<T, E> {
    fn context(self, msg: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().with_message(msg))
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.map_err(|e| e.into().with_message(f()))
    }
}

/// A specialized Result type for chain values and fallible operations.
#[allow(clippy::result_large_err)]
pub type Result<T> = core::result::Result<T, Error>;
