//! The stateful worker run by every pool thread.

use core::time::Duration;
use serde::Serialize;
use std::{thread, time::Instant};
use stevedore::{BoxError, JobContext, Worker};

/// Longest single sleep while simulating work, so interrupts are noticed
/// promptly.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Response body of a completed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Echo {
    /// Index of the runner that served the request.
    pub worker: usize,
    /// Jobs this worker has completed, including this one.
    pub served: u64,
    pub payload: String,
}

/// Echoes its payload back after a configurable delay, counting how many
/// jobs it has served.
pub struct EchoWorker {
    id: usize,
    delay: Duration,
    served: u64,
}

impl EchoWorker {
    pub const fn new(id: usize, delay: Duration) -> Self {
        Self {
            id,
            delay,
            served: 0,
        }
    }
}

impl Worker for EchoWorker {
    type Input = String;
    type Output = Echo;

    fn initialize(&mut self) -> Result<(), BoxError> {
        #[cfg(feature = "tracing")]
        tracing::debug!("Echo worker {} ready", self.id);
        Ok(())
    }

    fn job(&mut self, payload: String, ctx: &JobContext) -> Result<Echo, BoxError> {
        if payload.is_empty() {
            return Err("Payload must not be empty".into());
        }

        let until = Instant::now() + self.delay;
        while !ctx.is_interrupted() {
            let now = Instant::now();
            if now >= until {
                break;
            }
            thread::sleep((until - now).min(POLL_INTERVAL));
        }

        self.served += 1;
        Ok(Echo {
            worker: self.id,
            served: self.served,
            payload,
        })
    }

    fn interrupt(&mut self) {
        #[cfg(feature = "tracing")]
        tracing::debug!("Echo worker {} abandoned its job", self.id);
    }

    fn terminate(&mut self) {
        #[cfg(feature = "tracing")]
        tracing::info!("Echo worker {} served {} jobs", self.id, self.served);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stevedore::Pool;

    #[test]
    fn counts_served_jobs() {
        let pool = Pool::from_workers(vec![EchoWorker::new(0, Duration::ZERO)])
            .unwrap()
            .open()
            .unwrap();

        let first = pool.send_work("a".to_string()).unwrap();
        let second = pool.send_work("b".to_string()).unwrap();
        assert_eq!(first.served, 1);
        assert_eq!(
            second,
            Echo {
                worker: 0,
                served: 2,
                payload: "b".to_string(),
            }
        );
    }

    #[test]
    fn rejects_empty_payload() {
        let pool = Pool::from_workers(vec![EchoWorker::new(0, Duration::ZERO)])
            .unwrap()
            .open()
            .unwrap();

        let err = pool.send_work(String::new()).unwrap_err();
        assert!(matches!(err, stevedore::Error::Worker { worker: 0, .. }));
    }

    #[test]
    fn stops_early_when_abandoned() {
        let pool = Pool::from_workers(vec![EchoWorker::new(0, Duration::from_secs(5))])
            .unwrap()
            .open()
            .unwrap();

        let start = Instant::now();
        let err = pool
            .send_work_timed(Duration::from_millis(50), "slow".to_string())
            .unwrap_err();
        assert!(err.is_timeout());

        // Close waits for the abandoned job, which should bail out quickly.
        pool.close();
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
