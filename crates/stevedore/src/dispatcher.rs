//! Assignment of job requests to runners.
//!
//! The dispatcher is the only state shared between submitters and runners.
//! Everything lives behind one mutex: the pool state, the set of idle runners
//! that last reported ready, the FIFO of requests waiting for a runner, and a
//! slot per runner recording what it is doing.
//!
//! A runner is claimed by removing it from the idle set, marking its slot
//! busy, and pushing the job onto that runner's private channel, all in the
//! same critical section. Two submissions therefore can never be handed the
//! same runner, and a runner never has more than one job outstanding.

use crate::{
    Error, Metrics, Result,
    request::{Deadline, JobRequest, Reply},
};
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use std::{
    collections::{BTreeSet, VecDeque},
    sync::Arc,
    time::Instant,
};
use tokio_util::sync::CancellationToken;

/// Lifecycle of a [`Pool`](crate::Pool).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum PoolState {
    /// Constructed but not yet opened.
    Unopened,
    /// Accepting and running work.
    Open,
    /// No longer accepting work; in-flight jobs are finishing.
    Closing,
    /// Every runner has terminated.
    Closed,
}

/// Lifecycle of a single runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum RunnerState {
    /// Running its worker's `initialize` hook.
    Initializing,
    /// Waiting for work.
    Idle,
    /// Executing a job (or about to receive one it has been assigned).
    Busy,
    /// Executing a job whose submitter already timed out.
    Interrupting,
    /// Its worker has been terminated and the thread is exiting.
    Terminated,
}

impl RunnerState {
    const fn is_busy(self) -> bool {
        matches!(self, Self::Busy | Self::Interrupting)
    }
}

/// Message sent to a runner on its private channel.
pub(crate) enum Assignment<I, O> {
    Job {
        request: JobRequest<I, O>,
        interrupt: CancellationToken,
    },
    Shutdown,
}

/// What a runner should do after checking in.
pub(crate) enum Checkin<I, O> {
    /// Execute this request now.
    Job {
        request: JobRequest<I, O>,
        interrupt: CancellationToken,
    },
    /// A submitter already claimed this runner; its job is on the channel.
    Claimed,
    /// Nothing to run. Wait on the channel and check in again later.
    Wait,
    /// The pool is closing.
    Shutdown,
}

struct InFlight {
    request: u64,
    interrupt: CancellationToken,
}

struct Slot<I, O> {
    tx: Sender<Assignment<I, O>>,
    state: RunnerState,
    current: Option<InFlight>,
}

struct Inner<I, O> {
    state: PoolState,
    next_id: u64,
    idle: BTreeSet<usize>,
    pending: VecDeque<JobRequest<I, O>>,
    slots: Vec<Slot<I, O>>,
}

pub(crate) struct Dispatcher<I, O> {
    inner: Mutex<Inner<I, O>>,
    metrics: Arc<Metrics>,
}

impl<I, O> Dispatcher<I, O> {
    pub(crate) fn new(senders: Vec<Sender<Assignment<I, O>>>, metrics: Arc<Metrics>) -> Self {
        let slots = senders
            .into_iter()
            .map(|tx| Slot {
                tx,
                state: RunnerState::Initializing,
                current: None,
            })
            .collect();

        Self {
            inner: Mutex::new(Inner {
                state: PoolState::Unopened,
                next_id: 0,
                idle: BTreeSet::new(),
                pending: VecDeque::new(),
                slots,
            }),
            metrics,
        }
    }

    pub(crate) const fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub(crate) fn state(&self) -> PoolState {
        self.inner.lock().state
    }

    pub(crate) fn runner_states(&self) -> Vec<RunnerState> {
        self.inner.lock().slots.iter().map(|slot| slot.state).collect()
    }

    pub(crate) fn mark_open(&self) {
        self.inner.lock().state = PoolState::Open;
    }

    /// Accepts a request and assigns it to the lowest-index idle runner, or
    /// queues it if none is available.
    ///
    /// Returns the request id.
    pub(crate) fn submit(
        &self,
        payload: I,
        reply: Reply<O>,
        deadline: Option<Deadline>,
    ) -> Result<u64> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        if inner.state != PoolState::Open {
            return Err(Error::PoolClosed);
        }

        let id = inner.next_id;
        inner.next_id += 1;
        self.metrics.job_submitted();

        let mut request = JobRequest {
            id,
            payload,
            reply,
            deadline,
        };

        while let Some(index) = inner.idle.pop_first() {
            match self.assign(&mut inner.slots[index], request) {
                Ok(()) => return Ok(id),
                Err(returned) => {
                    // The runner thread is gone; never offer it again.
                    self.transition(&mut inner.slots[index], RunnerState::Terminated);
                    request = returned;
                }
            }
        }

        inner.pending.push_back(request);
        self.metrics.set_queued(inner.pending.len());
        Ok(id)
    }

    /// Called by a runner whenever it is free: after initializing, after
    /// finishing a job, and on every readiness re-check.
    ///
    /// Requests found in the queue whose deadline already passed are moved
    /// into `expired` so the caller can fail them outside the lock.
    pub(crate) fn checkin(
        &self,
        index: usize,
        ready: bool,
        expired: &mut Vec<JobRequest<I, O>>,
    ) -> Checkin<I, O> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let slot = &mut inner.slots[index];

        // A claim made before the pool started closing still runs.
        if slot.state.is_busy() {
            return Checkin::Claimed;
        }

        if matches!(inner.state, PoolState::Closing | PoolState::Closed) {
            inner.idle.remove(&index);
            return Checkin::Shutdown;
        }

        if slot.state != RunnerState::Idle {
            self.transition(slot, RunnerState::Idle);
        }

        if !ready {
            inner.idle.remove(&index);
            return Checkin::Wait;
        }

        let now = Instant::now();
        while let Some(request) = inner.pending.pop_front() {
            if request.is_expired(now) {
                expired.push(request);
                continue;
            }

            inner.idle.remove(&index);
            let interrupt = CancellationToken::new();
            slot.current = Some(InFlight {
                request: request.id,
                interrupt: interrupt.clone(),
            });
            self.transition(slot, RunnerState::Busy);
            self.metrics.set_queued(inner.pending.len());
            return Checkin::Job { request, interrupt };
        }

        self.metrics.set_queued(0);
        inner.idle.insert(index);
        Checkin::Wait
    }

    /// Records that runner `index` finished its current job.
    pub(crate) fn finish(&self, index: usize, ok: bool) {
        let mut inner = self.inner.lock();
        let slot = &mut inner.slots[index];
        slot.current = None;
        self.transition(slot, RunnerState::Idle);
        self.metrics.job_finished(ok);
    }

    /// Gives up on request `id` after its submitter's deadline passed.
    ///
    /// A queued request is withdrawn. A running one has its interrupt token
    /// cancelled and keeps its runner until the job returns.
    pub(crate) fn abandon(&self, id: u64) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        if let Some(pos) = inner.pending.iter().position(|request| request.id == id) {
            let withdrawn = inner.pending.remove(pos);
            self.metrics.set_queued(inner.pending.len());
            drop(guard);
            drop(withdrawn);
            #[cfg(feature = "tracing")]
            tracing::debug!("Request {id} timed out before assignment");
            return;
        }

        for (_index, slot) in inner.slots.iter_mut().enumerate() {
            let running = slot
                .current
                .as_ref()
                .is_some_and(|in_flight| in_flight.request == id);
            if !running {
                continue;
            }
            if let Some(in_flight) = &slot.current {
                in_flight.interrupt.cancel();
            }
            self.transition(slot, RunnerState::Interrupting);
            #[cfg(feature = "tracing")]
            tracing::debug!("Request {id} timed out on worker {_index}; interrupting");
            return;
        }
    }

    /// Stops accepting work and tells every runner to shut down.
    ///
    /// Returns the requests that were still queued, or `None` if the pool was
    /// already closing.
    pub(crate) fn begin_close(&self) -> Option<Vec<JobRequest<I, O>>> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        if matches!(inner.state, PoolState::Closing | PoolState::Closed) {
            return None;
        }

        inner.state = PoolState::Closing;
        inner.idle.clear();
        let orphaned: Vec<_> = inner.pending.drain(..).collect();
        self.metrics.set_queued(0);

        for slot in &inner.slots {
            // Busy runners read this only after their claimed job, and exit
            // at their next check-in anyway.
            let _ = slot.tx.send(Assignment::Shutdown);
        }

        Some(orphaned)
    }

    /// Marks a closing pool closed once every runner is joined.
    pub(crate) fn finish_close(&self) {
        let mut inner = self.inner.lock();
        if inner.state == PoolState::Closing {
            inner.state = PoolState::Closed;
        }
    }

    /// Records that runner `index` has exited. The last runner to leave a
    /// closing pool marks it closed, which covers a close issued from one of
    /// the runners' own threads.
    pub(crate) fn mark_terminated(&self, index: usize) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.idle.remove(&index);
        self.transition(&mut inner.slots[index], RunnerState::Terminated);

        if inner.state == PoolState::Closing
            && inner
                .slots
                .iter()
                .all(|slot| slot.state == RunnerState::Terminated)
        {
            inner.state = PoolState::Closed;
        }
    }

    /// Hands `request` to the runner in `slot`. Gives the request back if the
    /// runner's channel is closed.
    fn assign(
        &self,
        slot: &mut Slot<I, O>,
        request: JobRequest<I, O>,
    ) -> core::result::Result<(), JobRequest<I, O>> {
        let interrupt = CancellationToken::new();
        let id = request.id;

        match slot.tx.send(Assignment::Job {
            request,
            interrupt: interrupt.clone(),
        }) {
            Ok(()) => {
                slot.current = Some(InFlight {
                    request: id,
                    interrupt,
                });
                self.transition(slot, RunnerState::Busy);
                Ok(())
            }
            Err(err) => match err.into_inner() {
                Assignment::Job { request, .. } => Err(request),
                Assignment::Shutdown => unreachable!("only jobs are assigned"),
            },
        }
    }

    /// Moves `slot` to `next`, keeping the busy/idle gauges in step.
    fn transition(&self, slot: &mut Slot<I, O>, next: RunnerState) {
        let prev = core::mem::replace(&mut slot.state, next);
        if prev == next {
            return;
        }
        if prev == RunnerState::Idle {
            self.metrics.adjust_idle(false);
        }
        if prev.is_busy() && !next.is_busy() {
            self.metrics.adjust_busy(false);
        }
        if next == RunnerState::Idle {
            self.metrics.adjust_idle(true);
        }
        if next.is_busy() && !prev.is_busy() {
            self.metrics.adjust_busy(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::{Receiver, unbounded};

    type TestDispatcher = Dispatcher<u32, u32>;

    fn dispatcher(size: usize) -> (TestDispatcher, Vec<Receiver<Assignment<u32, u32>>>) {
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..size).map(|_| unbounded()).unzip();
        let dispatcher = Dispatcher::new(senders, Arc::new(Metrics::new(size)));
        dispatcher.mark_open();
        (dispatcher, receivers)
    }

    fn received_payload(rx: &Receiver<Assignment<u32, u32>>) -> Option<u32> {
        match rx.try_recv() {
            Ok(Assignment::Job { request, .. }) => Some(request.payload),
            _ => None,
        }
    }

    fn checkin(d: &TestDispatcher, index: usize, ready: bool) -> Checkin<u32, u32> {
        d.checkin(index, ready, &mut Vec::new())
    }

    #[test]
    fn assigns_lowest_idle_index_first() {
        let (d, rx) = dispatcher(3);
        for index in [2, 0, 1] {
            assert!(matches!(checkin(&d, index, true), Checkin::Wait));
        }

        d.submit(10, Reply::Detached, None).unwrap();
        d.submit(11, Reply::Detached, None).unwrap();

        assert_eq!(received_payload(&rx[0]), Some(10));
        assert_eq!(received_payload(&rx[1]), Some(11));
        assert_eq!(received_payload(&rx[2]), None);
        assert_eq!(
            d.runner_states(),
            vec![RunnerState::Busy, RunnerState::Busy, RunnerState::Idle]
        );
    }

    #[test]
    fn not_ready_runner_is_skipped() {
        let (d, rx) = dispatcher(2);
        assert!(matches!(checkin(&d, 0, false), Checkin::Wait));
        assert!(matches!(checkin(&d, 1, true), Checkin::Wait));

        d.submit(7, Reply::Detached, None).unwrap();
        assert_eq!(received_payload(&rx[0]), None);
        assert_eq!(received_payload(&rx[1]), Some(7));
    }

    #[test]
    fn queued_requests_go_to_next_checkin_in_order() {
        let (d, _rx) = dispatcher(1);
        d.submit(1, Reply::Detached, None).unwrap();
        d.submit(2, Reply::Detached, None).unwrap();
        assert_eq!(d.metrics().snapshot().queued, 2);

        let Checkin::Job { request, .. } = checkin(&d, 0, true) else {
            panic!("expected queued job");
        };
        assert_eq!(request.payload, 1);
        assert_eq!(d.metrics().snapshot().queued, 1);
        assert_eq!(d.metrics().snapshot().busy, 1);

        d.finish(0, true);
        let Checkin::Job { request, .. } = checkin(&d, 0, true) else {
            panic!("expected queued job");
        };
        assert_eq!(request.payload, 2);
    }

    #[test]
    fn claimed_runner_is_told_to_read_its_channel() {
        let (d, _rx) = dispatcher(1);
        assert!(matches!(checkin(&d, 0, true), Checkin::Wait));
        d.submit(5, Reply::Detached, None).unwrap();
        assert!(matches!(checkin(&d, 0, true), Checkin::Claimed));
        assert!(matches!(checkin(&d, 0, false), Checkin::Claimed));
    }

    #[test]
    fn expired_requests_are_handed_back() {
        let (d, _rx) = dispatcher(1);
        let past = Deadline {
            at: Instant::now(),
            timeout: core::time::Duration::ZERO,
        };
        d.submit(1, Reply::Detached, Some(past)).unwrap();
        d.submit(2, Reply::Detached, None).unwrap();

        let mut expired = Vec::new();
        let Checkin::Job { request, .. } = d.checkin(0, true, &mut expired) else {
            panic!("expected live job");
        };
        assert_eq!(request.payload, 2);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].payload, 1);
    }

    #[test]
    fn abandon_withdraws_queued_or_interrupts_running() {
        let (d, rx) = dispatcher(1);
        assert!(matches!(checkin(&d, 0, true), Checkin::Wait));

        let running = d.submit(1, Reply::Detached, None).unwrap();
        let queued = d.submit(2, Reply::Detached, None).unwrap();

        d.abandon(queued);
        assert_eq!(d.metrics().snapshot().queued, 0);

        d.abandon(running);
        let Ok(Assignment::Job { interrupt, .. }) = rx[0].try_recv() else {
            panic!("expected assignment");
        };
        assert!(interrupt.is_cancelled());
        assert_eq!(d.runner_states(), vec![RunnerState::Interrupting]);
        assert_eq!(d.metrics().snapshot().busy, 1);

        d.finish(0, true);
        assert_eq!(d.metrics().snapshot().busy, 0);
        assert!(matches!(checkin(&d, 0, true), Checkin::Wait));
    }

    #[test]
    fn close_rejects_and_returns_queue() {
        let (d, rx) = dispatcher(1);
        d.submit(1, Reply::Detached, None).unwrap();

        let orphaned = d.begin_close().unwrap();
        assert_eq!(orphaned.len(), 1);
        assert!(d.begin_close().is_none());
        assert!(matches!(
            d.submit(2, Reply::Detached, None),
            Err(Error::PoolClosed)
        ));
        assert!(matches!(rx[0].try_recv(), Ok(Assignment::Shutdown)));
        assert!(matches!(checkin(&d, 0, true), Checkin::Shutdown));
        assert_eq!(d.state(), PoolState::Closing);

        d.mark_terminated(0);
        assert_eq!(d.state(), PoolState::Closed);
        assert_eq!(d.runner_states(), vec![RunnerState::Terminated]);
    }

    #[test]
    fn dead_runner_is_skipped() {
        let (d, mut rx) = dispatcher(2);
        assert!(matches!(checkin(&d, 0, true), Checkin::Wait));
        assert!(matches!(checkin(&d, 1, true), Checkin::Wait));
        drop(rx.remove(0));

        d.submit(3, Reply::Detached, None).unwrap();
        assert_eq!(received_payload(&rx[0]), Some(3));
        assert_eq!(d.runner_states()[0], RunnerState::Terminated);
    }
}
