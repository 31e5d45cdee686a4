//! Pool counters and the process-wide registry they are published to.
//!
//! Every pool keeps a [`Metrics`] block that the dispatcher updates as jobs
//! move through it. [`Pool::publish_metrics`](crate::Pool::publish_metrics)
//! registers that block under a name so an operational endpoint can read it
//! back with [`published`] or [`lookup`] without holding a reference to the
//! pool.
//!
//! With the `metrics` feature, publishing also registers OpenTelemetry
//! observable instruments on the global meter, tagged with `pool = <name>`.

use parking_lot::Mutex;
use portable_atomic::{AtomicU64, Ordering};
use std::{collections::BTreeMap, sync::Arc, sync::OnceLock};

/// Live counters for one pool.
#[derive(Debug, Default)]
pub struct Metrics {
    workers: u64,
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    busy: AtomicU64,
    idle: AtomicU64,
    queued: AtomicU64,
}

impl Metrics {
    pub(crate) fn new(workers: usize) -> Self {
        Self {
            workers: workers as u64,
            ..Self::default()
        }
    }

    pub(crate) fn job_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn job_finished(&self, ok: bool) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn job_timed_out(&self) {
        self.timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn set_queued(&self, depth: usize) {
        self.queued.store(depth as u64, Ordering::Relaxed);
    }

    pub(crate) fn adjust_busy(&self, up: bool) {
        adjust(&self.busy, up);
    }

    pub(crate) fn adjust_idle(&self, up: bool) {
        adjust(&self.idle, up);
    }

    /// Reads every counter.
    ///
    /// Counters are read independently, so a snapshot taken while jobs are
    /// moving may be off by one between related fields.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            workers: self.workers,
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            busy: self.busy.load(Ordering::Relaxed),
            idle: self.idle.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
        }
    }
}

fn adjust(counter: &AtomicU64, up: bool) {
    if up {
        counter.fetch_add(1, Ordering::Relaxed);
    } else {
        counter.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Point-in-time copy of a pool's [`Metrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct MetricsSnapshot {
    /// Fixed number of runners.
    pub workers: u64,
    /// Requests accepted by the pool.
    pub submitted: u64,
    /// Jobs a worker finished executing, successfully or not.
    pub completed: u64,
    /// Completed jobs that returned an error or panicked.
    pub failed: u64,
    /// Deadline-bounded submissions that gave up waiting.
    pub timed_out: u64,
    /// Runners currently executing a job.
    pub busy: u64,
    /// Runners waiting for work.
    pub idle: u64,
    /// Accepted requests waiting for a runner.
    pub queued: u64,
}

struct Published {
    metrics: Arc<Metrics>,
    // Keeps the observable instruments registered for as long as the entry
    // lives.
    #[cfg(feature = "metrics")]
    _instruments: otel::Instruments,
}

fn registry() -> &'static Mutex<BTreeMap<String, Published>> {
    static REGISTRY: OnceLock<Mutex<BTreeMap<String, Published>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(BTreeMap::new()))
}

/// Registers `metrics` under `name`, replacing any earlier registration.
pub(crate) fn publish(name: String, metrics: Arc<Metrics>) {
    #[cfg(feature = "metrics")]
    let _instruments = otel::register(&name, &metrics);

    let entry = Published {
        metrics,
        #[cfg(feature = "metrics")]
        _instruments,
    };

    #[cfg(feature = "tracing")]
    tracing::debug!("Publishing pool metrics as `{name}`");

    registry().lock().insert(name, entry);
}

/// Snapshots of every published pool, ordered by name.
pub fn published() -> Vec<(String, MetricsSnapshot)> {
    registry()
        .lock()
        .iter()
        .map(|(name, entry)| (name.clone(), entry.metrics.snapshot()))
        .collect()
}

/// Snapshot of the pool published under `name`, if any.
pub fn lookup(name: &str) -> Option<MetricsSnapshot> {
    registry()
        .lock()
        .get(name)
        .map(|entry| entry.metrics.snapshot())
}

/// Removes the registration for `name`. Returns whether one existed.
pub fn unpublish(name: &str) -> bool {
    registry().lock().remove(name).is_some()
}

#[cfg(feature = "metrics")]
mod otel {
    use super::{Metrics, MetricsSnapshot};
    use opentelemetry::{
        KeyValue,
        metrics::{Meter, ObservableCounter, ObservableGauge},
    };
    use std::sync::Arc;

    pub(super) struct Instruments {
        _counters: Vec<ObservableCounter<u64>>,
        _gauges: Vec<ObservableGauge<u64>>,
    }

    type Read = fn(&MetricsSnapshot) -> u64;

    pub(super) fn register(name: &str, metrics: &Arc<Metrics>) -> Instruments {
        let meter = opentelemetry::global::meter("stevedore");
        let attrs = [KeyValue::new("pool", name.to_string())];

        let counters: [(&'static str, &'static str, Read); 4] = [
            (
                "stevedore.jobs.submitted",
                "Requests accepted by the pool",
                |s| s.submitted,
            ),
            (
                "stevedore.jobs.completed",
                "Jobs executed by a worker",
                |s| s.completed,
            ),
            (
                "stevedore.jobs.failed",
                "Jobs that returned an error or panicked",
                |s| s.failed,
            ),
            (
                "stevedore.jobs.timed_out",
                "Deadline-bounded submissions that expired",
                |s| s.timed_out,
            ),
        ];
        let gauges: [(&'static str, &'static str, Read); 4] = [
            ("stevedore.workers", "Runners in the pool", |s| s.workers),
            ("stevedore.workers.busy", "Runners executing a job", |s| s.busy),
            ("stevedore.workers.idle", "Runners waiting for work", |s| s.idle),
            (
                "stevedore.queue.depth",
                "Requests waiting for a runner",
                |s| s.queued,
            ),
        ];

        Instruments {
            _counters: counters
                .into_iter()
                .map(|(instrument, description, read)| {
                    observable_counter(&meter, instrument, description, metrics, &attrs, read)
                })
                .collect(),
            _gauges: gauges
                .into_iter()
                .map(|(instrument, description, read)| {
                    observable_gauge(&meter, instrument, description, metrics, &attrs, read)
                })
                .collect(),
        }
    }

    fn observable_counter(
        meter: &Meter,
        instrument: &'static str,
        description: &'static str,
        metrics: &Arc<Metrics>,
        attrs: &[KeyValue],
        read: Read,
    ) -> ObservableCounter<u64> {
        let metrics = Arc::clone(metrics);
        let attrs = attrs.to_vec();
        meter
            .u64_observable_counter(instrument)
            .with_description(description)
            .with_callback(move |observer| observer.observe(read(&metrics.snapshot()), &attrs))
            .build()
    }

    fn observable_gauge(
        meter: &Meter,
        instrument: &'static str,
        description: &'static str,
        metrics: &Arc<Metrics>,
        attrs: &[KeyValue],
        read: Read,
    ) -> ObservableGauge<u64> {
        let metrics = Arc::clone(metrics);
        let attrs = attrs.to_vec();
        meter
            .u64_observable_gauge(instrument)
            .with_description(description)
            .with_callback(move |observer| observer.observe(read(&metrics.snapshot()), &attrs))
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_track_transitions() {
        let metrics = Metrics::new(3);
        metrics.job_submitted();
        metrics.job_submitted();
        metrics.adjust_idle(true);
        metrics.adjust_idle(true);
        metrics.adjust_idle(false);
        metrics.adjust_busy(true);
        metrics.job_finished(true);
        metrics.job_finished(false);
        metrics.job_timed_out();
        metrics.set_queued(4);

        assert_eq!(
            metrics.snapshot(),
            MetricsSnapshot {
                workers: 3,
                submitted: 2,
                completed: 2,
                failed: 1,
                timed_out: 1,
                busy: 1,
                idle: 1,
                queued: 4,
            }
        );
    }

    #[test]
    fn registry_publish_lookup_replace() {
        let first = Arc::new(Metrics::new(1));
        publish("metrics-test-registry".to_string(), Arc::clone(&first));
        assert_eq!(lookup("metrics-test-registry").map(|s| s.workers), Some(1));

        let second = Arc::new(Metrics::new(9));
        publish("metrics-test-registry".to_string(), second);
        assert_eq!(lookup("metrics-test-registry").map(|s| s.workers), Some(9));
        assert!(
            published()
                .iter()
                .any(|(name, snap)| name == "metrics-test-registry" && snap.workers == 9)
        );

        assert!(unpublish("metrics-test-registry"));
        assert!(!unpublish("metrics-test-registry"));
        assert_eq!(lookup("metrics-test-registry"), None);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn snapshot_serializes() {
        let snap = Metrics::new(2).snapshot();
        let json = serde_json::to_value(snap).unwrap();
        assert_eq!(json["workers"], 2);
        assert_eq!(json["busy"], 0);
    }
}
