//! Pool construction, lifecycle and the submission API.
//!
//! A pool is built unopened ([`UnopenedPool`]), tuned, then opened. Opening
//! spawns one named thread per worker and waits until every worker's
//! `initialize` hook has run. The resulting [`Pool`] is `Sync`; share it
//! behind an `Arc` to submit from many threads.
//!
//! ```
//! use std::convert::Infallible;
//! use stevedore::Pool;
//!
//! let pool = Pool::from_fn(4, |s: String| Ok::<_, Infallible>(s.len()))
//!     .unwrap()
//!     .open()
//!     .unwrap();
//!
//! assert_eq!(pool.send_work("four".to_string()).unwrap(), 4);
//! pool.close();
//! ```

use crate::{
    BoxError, Error, FnWorker, MetricsSnapshot, PoolConfig, PoolState, Result, RunnerState, Task,
    Worker,
    dispatcher::Dispatcher,
    metrics::{self, Metrics},
    request::{Callback, Deadline, Reply},
    runner::{Runner, Started},
};
use core::{convert::Infallible, time::Duration};
use crossbeam_channel::{RecvTimeoutError, bounded, unbounded};
use parking_lot::Mutex;
use std::{
    sync::Arc,
    thread::{self, JoinHandle},
};

type BoxedWorker<I, O> = Box<dyn Worker<Input = I, Output = O>>;

/// A pool that has been configured but not started.
///
/// Created by [`Pool::from_fn`], [`Pool::from_workers`] or [`Pool::generic`].
pub struct UnopenedPool<I, O> {
    workers: Vec<BoxedWorker<I, O>>,
    config: PoolConfig,
}

impl<I, O> UnopenedPool<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    fn new(workers: Vec<BoxedWorker<I, O>>) -> Self {
        Self {
            workers,
            config: PoolConfig::default(),
        }
    }

    /// How often idle runners re-evaluate [`Worker::ready`].
    #[must_use]
    pub fn readiness_interval(mut self, interval: Duration) -> Self {
        self.config.readiness_interval = interval;
        self
    }

    /// Prefix for runner thread names.
    #[must_use]
    pub fn thread_name(mut self, prefix: impl Into<String>) -> Self {
        self.config.thread_name = prefix.into();
        self
    }

    /// Stack size, in bytes, of each runner thread.
    #[must_use]
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.config.stack_size = Some(bytes);
        self
    }

    /// Replaces the whole configuration.
    #[must_use]
    pub fn with_config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    pub const fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Number of workers the pool will run.
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    pub const fn state(&self) -> PoolState {
        PoolState::Unopened
    }

    /// Starts one runner thread per worker and waits for every worker to
    /// initialize.
    ///
    /// # Errors
    ///
    /// - [`Error::Configuration`] if the tuning values are invalid.
    /// - [`Error::Initialization`] if a thread could not be spawned or a
    ///   worker's `initialize` hook failed. Runners that did start are shut
    ///   down (and their workers terminated) before this returns. When several
    ///   workers fail, the lowest index is reported.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all, fields(workers = self.workers.len())))]
    pub fn open(self) -> Result<Pool<I, O>> {
        self.config.validate()?;

        let size = self.workers.len();
        let metrics = Arc::new(Metrics::new(size));
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..size).map(|_| unbounded()).unzip();
        let dispatcher = Arc::new(Dispatcher::new(senders, Arc::clone(&metrics)));

        let (started_tx, started_rx) = bounded::<Started>(size);
        let mut handles = Vec::with_capacity(size);
        let mut failures: Vec<(usize, BoxError)> = Vec::new();

        for (index, (worker, rx)) in self.workers.into_iter().zip(receivers).enumerate() {
            let runner = Runner::new(
                index,
                worker,
                rx,
                Arc::clone(&dispatcher),
                self.config.readiness_interval,
            );
            let started = started_tx.clone();

            match self
                .config
                .thread_builder(index)
                .spawn(move || runner.run(started))
            {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    for unspawned in index..size {
                        dispatcher.mark_terminated(unspawned);
                    }
                    failures.push((index, Box::new(err) as BoxError));
                    break;
                }
            }
        }
        drop(started_tx);

        for report in started_rx.iter() {
            if let (index, Err(err)) = report {
                failures.push((index, err));
            }
        }

        if let Some((worker, source)) = failures.into_iter().min_by_key(|(index, _)| *index) {
            #[cfg(feature = "tracing")]
            tracing::error!("Aborting open: worker {worker} failed to initialize: {source}");
            // Nothing can have been queued while unopened.
            let _ = dispatcher.begin_close();
            join_runners(handles);
            dispatcher.finish_close();
            return Err(Error::Initialization { worker, source });
        }

        dispatcher.mark_open();

        #[cfg(feature = "tracing")]
        tracing::info!("Worker pool opened with {size} workers");

        Ok(Pool {
            dispatcher,
            runners: Mutex::new(handles),
        })
    }
}

/// A fixed-size pool of worker threads.
///
/// Jobs go to the lowest-index runner that is idle and ready; if none is,
/// they wait in submission order. Each runner executes one job at a time.
///
/// Dropping the pool closes it.
pub struct Pool<I, O> {
    dispatcher: Arc<Dispatcher<I, O>>,
    runners: Mutex<Vec<JoinHandle<()>>>,
}

impl<I, O> Pool<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    /// Builds a pool of `worker_count` stateless workers sharing `job`.
    ///
    /// # Errors
    ///
    /// [`Error::Configuration`] if `worker_count` is zero.
    pub fn from_fn<F, E>(worker_count: usize, job: F) -> Result<UnopenedPool<I, O>>
    where
        F: Fn(I) -> core::result::Result<O, E> + Send + Sync + 'static,
        E: Into<BoxError>,
    {
        if worker_count == 0 {
            return Err(Error::configuration(
                "Worker count must be greater than zero",
            ));
        }

        let job = Arc::new(job);
        let workers = (0..worker_count)
            .map(|_| Box::new(FnWorker::new(Arc::clone(&job))) as BoxedWorker<I, O>)
            .collect();

        Ok(UnopenedPool::new(workers))
    }

    /// Builds a pool from explicit worker instances, one runner each.
    ///
    /// Mix worker types by passing `Box<dyn Worker<Input = I, Output = O>>`.
    ///
    /// # Errors
    ///
    /// [`Error::Configuration`] if `workers` is empty.
    pub fn from_workers<W>(workers: Vec<W>) -> Result<UnopenedPool<I, O>>
    where
        W: Worker<Input = I, Output = O>,
    {
        if workers.is_empty() {
            return Err(Error::configuration("Worker list must not be empty"));
        }

        let workers = workers
            .into_iter()
            .map(|worker| Box::new(worker) as BoxedWorker<I, O>)
            .collect();

        Ok(UnopenedPool::new(workers))
    }

    /// Submits `payload` and blocks until its result is available.
    ///
    /// # Errors
    ///
    /// - [`Error::PoolClosed`] if the pool is closing, or closed before a
    ///   runner took the job.
    /// - [`Error::Worker`] if the job failed.
    pub fn send_work(&self, payload: I) -> Result<O> {
        let (tx, rx) = bounded(1);
        self.dispatcher.submit(payload, Reply::Channel(tx), None)?;
        rx.recv().unwrap_or(Err(Error::PoolClosed))
    }

    /// Submits `payload` without waiting for it to be assigned or run.
    ///
    /// `callback`, if given, receives the result exactly once, on the runner
    /// thread that produced it, so it must not block for long. Without a
    /// callback the result is discarded.
    ///
    /// # Errors
    ///
    /// [`Error::PoolClosed`] if the pool no longer accepts work; the callback
    /// is then dropped without being called.
    pub fn send_work_async(&self, payload: I, callback: Option<Callback<O>>) -> Result<()> {
        let reply = callback.map_or(Reply::Detached, Reply::Callback);
        self.dispatcher.submit(payload, reply, None).map(|_| ())
    }

    /// Submits `payload` and waits at most `timeout` for its result.
    ///
    /// On expiry a queued job is withdrawn. A job that already started keeps
    /// running, its worker is interrupted, and its eventual result is
    /// discarded.
    ///
    /// # Errors
    ///
    /// - [`Error::Timeout`] if no result arrived in time.
    /// - [`Error::PoolClosed`] and [`Error::Worker`] as for
    ///   [`send_work`](Self::send_work).
    ///
    /// A `timeout` too large to express as a point in time never expires, so
    /// the call behaves like [`send_work`](Self::send_work).
    pub fn send_work_timed(&self, timeout: Duration, payload: I) -> Result<O> {
        let Some(deadline) = Deadline::after(timeout) else {
            return self.send_work(payload);
        };
        let (tx, rx) = bounded(1);
        let id = self
            .dispatcher
            .submit(payload, Reply::Channel(tx), Some(deadline))?;

        let result = match rx.recv_deadline(deadline.at) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                self.dispatcher.abandon(id);
                Err(Error::Timeout { timeout })
            }
            Err(RecvTimeoutError::Disconnected) => Err(Error::PoolClosed),
        };

        if matches!(result, Err(Error::Timeout { .. })) {
            self.dispatcher.metrics().job_timed_out();
        }
        result
    }

    /// Stops accepting work, fails queued requests with
    /// [`Error::PoolClosed`], waits for running jobs to finish and terminates
    /// every worker.
    ///
    /// Calling it again, or on a pool that is already closing, returns
    /// immediately. When called from a completion callback the calling
    /// runner's own thread is not joined: the pool stays
    /// [`PoolState::Closing`] until that runner terminates its worker once
    /// the callback returns.
    pub fn close(&self) {
        self.shutdown();
    }

    pub fn state(&self) -> PoolState {
        self.dispatcher.state()
    }

    /// Number of runners; fixed for the pool's lifetime.
    pub fn size(&self) -> usize {
        self.dispatcher.runner_states().len()
    }

    /// Current state of each runner, by index.
    pub fn runner_states(&self) -> Vec<RunnerState> {
        self.dispatcher.runner_states()
    }

    /// Point-in-time copy of this pool's counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.dispatcher.metrics().snapshot()
    }

    /// Registers this pool's counters under `name` for external scraping.
    ///
    /// See [`metrics::published`](crate::metrics::published).
    pub fn publish_metrics(&self, name: impl Into<String>) {
        metrics::publish(name.into(), Arc::clone(self.dispatcher.metrics()));
    }
}

impl Pool<Task, ()> {
    /// Builds a pool that runs arbitrary closures.
    ///
    /// ```
    /// use stevedore::Pool;
    ///
    /// let pool = Pool::generic(2).unwrap().open().unwrap();
    /// let (tx, rx) = std::sync::mpsc::channel();
    /// pool.send_work(Box::new(move || tx.send(10).unwrap())).unwrap();
    /// assert_eq!(rx.recv().unwrap(), 10);
    /// ```
    ///
    /// # Errors
    ///
    /// [`Error::Configuration`] if `worker_count` is zero.
    pub fn generic(worker_count: usize) -> Result<UnopenedPool<Task, ()>> {
        Self::from_fn(worker_count, |task: Task| {
            task();
            Ok::<_, Infallible>(())
        })
    }
}

impl<I, O> Pool<I, O> {
    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all))]
    fn shutdown(&self) {
        let Some(orphaned) = self.dispatcher.begin_close() else {
            return;
        };

        #[cfg(feature = "tracing")]
        tracing::info!(
            "Closing worker pool ({} queued requests rejected)",
            orphaned.len()
        );

        for request in orphaned {
            request.reply.deliver(Err(Error::PoolClosed));
        }

        let handles = core::mem::take(&mut *self.runners.lock());
        if join_runners(handles) {
            self.dispatcher.finish_close();
        }

        #[cfg(feature = "tracing")]
        tracing::info!("Worker pool shutdown complete");
    }
}

impl<I, O> Drop for Pool<I, O> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Joins runner threads, skipping the calling thread if it is one of them.
/// Returns `false` if a thread was skipped.
fn join_runners(handles: Vec<JoinHandle<()>>) -> bool {
    let current = thread::current().id();
    let mut joined_all = true;
    for handle in handles {
        if handle.thread().id() == current {
            joined_all = false;
            continue;
        }
        if let Err(_panic) = handle.join() {
            #[cfg(feature = "tracing")]
            tracing::error!("Runner thread panicked outside of a job");
        }
    }
    joined_all
}
