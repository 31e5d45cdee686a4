use crate::{Error, Result};
use core::time::Duration;

/// How often an idle runner re-evaluates [`Worker::ready`](crate::Worker::ready).
pub const DEFAULT_READINESS_INTERVAL: Duration = Duration::from_millis(50);

/// Prefix for runner thread names; threads are named `<prefix>-<index>`.
pub const DEFAULT_THREAD_NAME: &str = "stevedore-worker";

/// Tuning knobs applied when a pool is opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Readiness re-check period for idle runners.
    pub readiness_interval: Duration,
    /// Runner thread name prefix.
    pub thread_name: String,
    /// Runner thread stack size in bytes. `None` uses the platform default.
    pub stack_size: Option<usize>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            readiness_interval: DEFAULT_READINESS_INTERVAL,
            thread_name: DEFAULT_THREAD_NAME.to_string(),
            stack_size: None,
        }
    }
}

impl PoolConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.readiness_interval.is_zero() {
            return Err(Error::configuration(
                "Readiness interval must be greater than zero",
            ));
        }
        if self.thread_name.is_empty() {
            return Err(Error::configuration("Thread name prefix must not be empty"));
        }
        if self.stack_size == Some(0) {
            return Err(Error::configuration("Stack size must be greater than zero"));
        }
        Ok(())
    }

    pub(crate) fn thread_builder(&self, index: usize) -> std::thread::Builder {
        let builder = std::thread::Builder::new().name(format!("{}-{index}", self.thread_name));
        match self.stack_size {
            Some(size) => builder.stack_size(size),
            None => builder,
        }
    }
}
