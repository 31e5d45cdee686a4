//! Error types for the worker pool.
//!
//! ## Error Cases
//! - `Configuration`: the pool was constructed or tuned with invalid
//!   arguments.
//! - `Initialization`: a worker's `initialize` hook failed while opening the
//!   pool.
//! - `PoolClosed`: work was submitted after the pool started closing.
//! - `Timeout`: a deadline-bounded submission expired.
//! - `Worker`: the worker's job function failed (or panicked) for a payload.

use core::time::Duration;
use std::any::Any;

/// A result type defaulting to the pool's [`Error`].
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Error type produced by worker code.
///
/// Job functions and lifecycle hooks return this so that any error type can
/// flow back to the submitter without the pool knowing about it.
pub type BoxError = Box<dyn core::error::Error + Send + Sync + 'static>;

/// Unified error type for the worker pool.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The pool was built with invalid arguments (e.g. zero workers).
    #[error("Invalid pool configuration: {reason}")]
    Configuration { reason: String },

    /// A worker could not be brought up while opening the pool.
    #[error("Worker {worker} failed to initialize: {source}")]
    Initialization {
        worker: usize,
        #[source]
        source: BoxError,
    },

    /// The pool is closing or closed and no longer accepts work.
    #[error("Pool is closed")]
    PoolClosed,

    /// No result was available before the submission's deadline.
    #[error("Job did not complete within {timeout:?}")]
    Timeout { timeout: Duration },

    /// The job function returned an error or panicked.
    #[error("Worker {worker} failed: {source}")]
    Worker {
        worker: usize,
        #[source]
        source: BoxError,
    },
}

impl Error {
    pub(crate) fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    /// Returns `true` if this is a [`Error::Timeout`].
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Returns `true` if this is a [`Error::PoolClosed`].
    pub const fn is_pool_closed(&self) -> bool {
        matches!(self, Self::PoolClosed)
    }
}

/// Source error for a job that panicked on its runner thread.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("job panicked: {message}")]
pub struct JobPanicked {
    message: String,
}

impl JobPanicked {
    /// Extracts a readable message from a `catch_unwind` payload.
    pub(crate) fn from_payload(payload: &(dyn Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self { message }
    }

    /// The panic message.
    pub fn message(&self) -> &str {
        &self.message
    }
}
