use crate::{
    BoxError, Error, JobContext, JobPanicked, Worker,
    dispatcher::{Assignment, Checkin, Dispatcher},
    request::JobRequest,
};
use core::time::Duration;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
};
use tokio_util::sync::CancellationToken;

/// Startup report sent back to [`UnopenedPool::open`](crate::UnopenedPool::open).
pub(crate) type Started = (usize, Result<(), BoxError>);

/// Owns one worker and drives it on a dedicated thread.
///
/// The loop is: check in with the dispatcher, run whatever it hands over (or
/// wait on the private channel), publish the result, check in again. Idle
/// runners wake every `readiness_interval` to re-evaluate
/// [`Worker::ready`].
pub(crate) struct Runner<W: Worker> {
    index: usize,
    worker: W,
    rx: Receiver<Assignment<W::Input, W::Output>>,
    dispatcher: Arc<Dispatcher<W::Input, W::Output>>,
    readiness_interval: Duration,
}

impl<W: Worker> Runner<W> {
    pub(crate) const fn new(
        index: usize,
        worker: W,
        rx: Receiver<Assignment<W::Input, W::Output>>,
        dispatcher: Arc<Dispatcher<W::Input, W::Output>>,
        readiness_interval: Duration,
    ) -> Self {
        Self {
            index,
            worker,
            rx,
            dispatcher,
            readiness_interval,
        }
    }

    /// Thread entry point.
    pub(crate) fn run(mut self, started: Sender<Started>) {
        #[cfg(feature = "tracing")]
        tracing::trace!("Worker {} started", self.index);

        let init = match catch_unwind(AssertUnwindSafe(|| self.worker.initialize())) {
            Ok(res) => res,
            Err(panic) => Err(Box::new(JobPanicked::from_payload(panic.as_ref())) as BoxError),
        };

        if let Err(err) = init {
            #[cfg(feature = "tracing")]
            tracing::error!("Worker {} failed to initialize: {err}", self.index);
            self.dispatcher.mark_terminated(self.index);
            let _ = started.send((self.index, Err(err)));
            return;
        }

        let _ = started.send((self.index, Ok(())));
        drop(started);

        self.serve();

        if catch_unwind(AssertUnwindSafe(|| self.worker.terminate())).is_err() {
            #[cfg(feature = "tracing")]
            tracing::error!("Worker {} panicked while terminating", self.index);
        }
        self.dispatcher.mark_terminated(self.index);

        #[cfg(feature = "tracing")]
        tracing::trace!("Worker {} stopped", self.index);
    }

    fn serve(&mut self) {
        let mut expired = Vec::new();

        loop {
            let ready = catch_unwind(AssertUnwindSafe(|| self.worker.ready())).unwrap_or(false);
            let checkin = self.dispatcher.checkin(self.index, ready, &mut expired);

            for request in expired.drain(..) {
                request.expire();
            }

            let next = match checkin {
                Checkin::Job { request, interrupt } => Some(Assignment::Job { request, interrupt }),
                Checkin::Claimed => self.rx.recv().ok(),
                Checkin::Wait => match self.rx.recv_timeout(self.readiness_interval) {
                    Ok(assignment) => Some(assignment),
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => None,
                },
                Checkin::Shutdown => None,
            };

            match next {
                Some(Assignment::Job { request, interrupt }) => self.execute(request, interrupt),
                Some(Assignment::Shutdown) | None => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!("Worker {} received shutdown signal", self.index);
                    return;
                }
            }
        }
    }

    fn execute(
        &mut self,
        request: JobRequest<W::Input, W::Output>,
        interrupt: CancellationToken,
    ) {
        let JobRequest {
            id: _id,
            payload,
            reply,
            deadline,
        } = request;
        let ctx = JobContext::new(
            self.index,
            deadline.map(|deadline| deadline.at),
            interrupt.clone(),
        );

        let worker = &mut self.worker;
        let result = match catch_unwind(AssertUnwindSafe(|| worker.job(payload, &ctx))) {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(source)) => {
                #[cfg(feature = "tracing")]
                tracing::warn!("Worker {} failed request {_id}: {source}", self.index);
                Err(Error::Worker {
                    worker: self.index,
                    source,
                })
            }
            Err(panic) => {
                let source = JobPanicked::from_payload(panic.as_ref());
                #[cfg(feature = "tracing")]
                tracing::error!("Worker {} recovered from panic in request {_id}: {source}", self.index);
                Err(Error::Worker {
                    worker: self.index,
                    source: Box::new(source),
                })
            }
        };

        if interrupt.is_cancelled() {
            #[cfg(feature = "tracing")]
            tracing::debug!("Worker {} interrupted after request {_id}", self.index);
            if catch_unwind(AssertUnwindSafe(|| self.worker.interrupt())).is_err() {
                #[cfg(feature = "tracing")]
                tracing::error!("Worker {} panicked while interrupting", self.index);
            }
        }

        self.dispatcher.finish(self.index, result.is_ok());
        reply.deliver(result);
    }
}
