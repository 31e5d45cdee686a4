//! The [`Worker`] capability trait and its function-backed adapter.
//!
//! A worker is owned by exactly one runner thread for its whole life, so its
//! methods take `&mut self` and need no internal locking. The pool only ever
//! calls into a worker from that thread.

use crate::BoxError;
use core::marker::PhantomData;
use std::{sync::Arc, time::Instant};
use tokio_util::sync::CancellationToken;

/// A unit of execution owned by a single runner.
///
/// Only [`Worker::job`] is required. The lifecycle hooks default to no-ops
/// and [`Worker::ready`] defaults to always-ready.
///
/// # Example
///
/// ```
/// use stevedore::{BoxError, JobContext, Pool, Worker};
///
/// struct Upper {
///     served: usize,
/// }
///
/// impl Worker for Upper {
///     type Input = String;
///     type Output = String;
///
///     fn job(&mut self, input: String, _ctx: &JobContext) -> Result<String, BoxError> {
///         self.served += 1;
///         Ok(input.to_uppercase())
///     }
/// }
///
/// let pool = Pool::from_workers(vec![Upper { served: 0 }, Upper { served: 0 }])
///     .unwrap()
///     .open()
///     .unwrap();
/// assert_eq!(pool.send_work("hi".to_string()).unwrap(), "HI");
/// pool.close();
/// ```
pub trait Worker: Send + 'static {
    /// Payload accepted by [`Worker::job`].
    type Input: Send + 'static;
    /// Payload produced by [`Worker::job`].
    type Output: Send + 'static;

    /// Whether this worker may receive a job right now.
    ///
    /// Must not block. Returning `false` keeps the runner out of the available
    /// set until a later re-check returns `true`.
    fn ready(&self) -> bool {
        true
    }

    /// Called once on the runner thread before the first job.
    ///
    /// An error here aborts [`UnopenedPool::open`](crate::UnopenedPool::open).
    fn initialize(&mut self) -> Result<(), BoxError> {
        Ok(())
    }

    /// Executes one job.
    ///
    /// The pool imposes no time limit. Long-running jobs may poll
    /// [`JobContext::is_interrupted`] to stop early once their submitter has
    /// given up.
    fn job(&mut self, input: Self::Input, ctx: &JobContext) -> Result<Self::Output, BoxError>;

    /// Called on the runner thread right after a job returns whose submitter
    /// timed out while it was running.
    ///
    /// This hook never runs concurrently with [`job`](Self::job): the job
    /// holds `&mut self` until it returns, so `interrupt` only observes the
    /// abandonment after the fact. To react while the job is still
    /// executing, poll [`JobContext::is_interrupted`], which flips as soon as
    /// the submitter gives up.
    fn interrupt(&mut self) {}

    /// Called once when the pool closes, after any in-flight job finished.
    fn terminate(&mut self) {}
}

impl<W> Worker for Box<W>
where
    W: Worker + ?Sized,
{
    type Input = W::Input;
    type Output = W::Output;

    fn ready(&self) -> bool {
        (**self).ready()
    }

    fn initialize(&mut self) -> Result<(), BoxError> {
        (**self).initialize()
    }

    fn job(&mut self, input: Self::Input, ctx: &JobContext) -> Result<Self::Output, BoxError> {
        (**self).job(input, ctx)
    }

    fn interrupt(&mut self) {
        (**self).interrupt();
    }

    fn terminate(&mut self) {
        (**self).terminate();
    }
}

/// Per-job information handed to [`Worker::job`].
#[derive(Debug, Clone)]
pub struct JobContext {
    worker: usize,
    deadline: Option<Instant>,
    interrupt: CancellationToken,
}

impl JobContext {
    pub(crate) const fn new(
        worker: usize,
        deadline: Option<Instant>,
        interrupt: CancellationToken,
    ) -> Self {
        Self {
            worker,
            deadline,
            interrupt,
        }
    }

    /// Index of the runner executing this job.
    pub const fn worker_id(&self) -> usize {
        self.worker
    }

    /// The instant the submitter stops waiting, for deadline-bounded jobs.
    pub const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Whether the submitter has given up on this job.
    ///
    /// This is advisory. The job keeps its runner until it returns.
    pub fn is_interrupted(&self) -> bool {
        self.interrupt.is_cancelled()
    }
}

/// A stateless [`Worker`] built from a job function.
///
/// Every runner of a [`Pool::from_fn`](crate::Pool::from_fn) pool holds a
/// clone of the same function.
pub struct FnWorker<F, I, O> {
    job: Arc<F>,
    _marker: PhantomData<fn(I) -> O>,
}

impl<F, I, O> FnWorker<F, I, O> {
    pub(crate) const fn new(job: Arc<F>) -> Self {
        Self {
            job,
            _marker: PhantomData,
        }
    }
}

impl<F, I, O, E> Worker for FnWorker<F, I, O>
where
    F: Fn(I) -> Result<O, E> + Send + Sync + 'static,
    I: Send + 'static,
    O: Send + 'static,
    E: Into<BoxError>,
{
    type Input = I;
    type Output = O;

    fn job(&mut self, input: I, _ctx: &JobContext) -> Result<O, BoxError> {
        (self.job)(input).map_err(Into::into)
    }
}

/// Payload type of a [`Pool::generic`](crate::Pool::generic) pool.
pub type Task = Box<dyn FnOnce() + Send + 'static>;
