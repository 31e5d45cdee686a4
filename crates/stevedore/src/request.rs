use crate::{Error, Result};
use core::time::Duration;
use crossbeam_channel::Sender;
use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    time::Instant,
};

/// Completion callback for [`Pool::send_work_async`](crate::Pool::send_work_async).
pub type Callback<O> = Box<dyn FnOnce(Result<O>) + Send + 'static>;

/// Where a job's result goes once it is known.
pub(crate) enum Reply<O> {
    /// A submitter blocked on the receiving end.
    Channel(Sender<Result<O>>),
    /// Invoked on whichever thread produced the result.
    Callback(Callback<O>),
    /// Fire-and-forget; the result is dropped.
    Detached,
}

impl<O> Reply<O> {
    /// Delivers `result` exactly once.
    ///
    /// A submitter that already stopped waiting (timed out) simply never
    /// reads the channel, so a failed send is not an error. A panicking
    /// callback is contained so it cannot take down the runner thread.
    pub(crate) fn deliver(self, result: Result<O>) {
        match self {
            Self::Channel(tx) => {
                let _ = tx.send(result);
            }
            Self::Callback(callback) => {
                if let Err(_panic) = catch_unwind(AssertUnwindSafe(move || callback(result))) {
                    #[cfg(feature = "tracing")]
                    tracing::error!(
                        "Completion callback panicked: {}",
                        crate::JobPanicked::from_payload(_panic.as_ref())
                    );
                }
            }
            Self::Detached => {}
        }
    }
}

/// When a deadline-bounded submitter stops waiting.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Deadline {
    pub(crate) at: Instant,
    pub(crate) timeout: Duration,
}

impl Deadline {
    /// `None` if `timeout` reaches past what an [`Instant`] can represent.
    pub(crate) fn after(timeout: Duration) -> Option<Self> {
        Instant::now()
            .checked_add(timeout)
            .map(|at| Self { at, timeout })
    }
}

/// A single submission travelling through the dispatcher.
pub(crate) struct JobRequest<I, O> {
    pub(crate) id: u64,
    pub(crate) payload: I,
    pub(crate) reply: Reply<O>,
    pub(crate) deadline: Option<Deadline>,
}

impl<I, O> JobRequest<I, O> {
    pub(crate) fn is_expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| deadline.at <= now)
    }

    /// Fails a request whose deadline passed before any runner took it.
    pub(crate) fn expire(self) {
        let timeout = self.deadline.map_or(Duration::ZERO, |deadline| deadline.timeout);
        self.reply.deliver(Err(Error::Timeout { timeout }));
    }
}
