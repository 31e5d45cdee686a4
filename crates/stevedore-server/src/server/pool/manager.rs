//! Ownership of the echo worker pool on behalf of the HTTP service.
//!
//! [`PoolManager`] opens the pool at startup, bridges async handlers onto the
//! pool's blocking submission calls, and closes the pool during graceful
//! shutdown. Blocking calls run on Tokio's blocking thread pool so they never
//! stall the async executor.

use crate::server::{
    config::ServerConfig,
    pool::worker::{Echo, EchoWorker},
};
use core::time::Duration;
use std::sync::Arc;
use stevedore::{Callback, Pool, PoolState};

/// Failure of a job submitted through the manager.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error(transparent)]
    Pool(#[from] stevedore::Error),

    /// The blocking task carrying the submission was cancelled or panicked.
    #[error("Submission task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub struct PoolManager {
    pool: Pool<String, Echo>,
    job_timeout: Duration,
}

impl PoolManager {
    /// Opens one [`EchoWorker`] per configured worker and publishes the
    /// pool's counters under the configured metrics name.
    pub fn open(config: &ServerConfig) -> anyhow::Result<Self> {
        let workers = (0..config.num_workers)
            .map(|id| EchoWorker::new(id, config.job_delay))
            .collect::<Vec<_>>();

        let pool = Pool::from_workers(workers)?
            .thread_name("echo-worker")
            .open()?;
        pool.publish_metrics(config.metrics_name.as_str());

        Ok(Self {
            pool,
            job_timeout: config.job_timeout,
        })
    }

    /// Runs `payload` and waits up to the configured job timeout.
    pub async fn submit(self: &Arc<Self>, payload: String) -> Result<Echo, SubmitError> {
        let this = Arc::clone(self);
        let res = tokio::task::spawn_blocking(move || {
            this.pool.send_work_timed(this.job_timeout, payload)
        })
        .await?;
        Ok(res?)
    }

    /// Queues `payload` without waiting for it to run.
    pub fn submit_detached(&self, payload: String) -> Result<(), stevedore::Error> {
        let callback: Callback<Echo> = Box::new(|_res| {
            #[cfg(feature = "tracing")]
            match _res {
                Ok(echo) => tracing::debug!(
                    "Detached job finished on worker {} ({} served)",
                    echo.worker,
                    echo.served
                ),
                Err(err) => tracing::warn!("Detached job failed: {err}"),
            };
        });
        self.pool.send_work_async(payload, Some(callback))
    }

    pub fn state(&self) -> PoolState {
        self.pool.state()
    }

    /// Closes the pool, waiting for in-flight jobs to finish.
    ///
    /// Queued jobs are rejected with [`stevedore::Error::PoolClosed`].
    pub async fn shutdown(self: &Arc<Self>) -> Result<(), SubmitError> {
        #[cfg(feature = "tracing")]
        tracing::info!(
            "Closing worker pool ({} jobs queued, {} running)",
            self.pool.metrics().queued,
            self.pool.metrics().busy
        );

        let this = Arc::clone(self);
        tokio::task::spawn_blocking(move || this.pool.close()).await?;
        Ok(())
    }
}
