//! Overlap and timeout guard for scheduled jobs

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{error, warn};

/// How a guarded tick ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobRun {
    Completed,
    /// The previous run of the same job was still in flight
    Skipped,
    TimedOut,
}

/// One per job; clones share the in-flight permit
#[derive(Clone)]
pub struct JobGuard {
    name: &'static str,
    in_flight: Arc<Semaphore>,
    timeout: Duration,
}

impl JobGuard {
    pub fn new(name: &'static str, timeout: Duration) -> Self {
        Self {
            name,
            in_flight: Arc::new(Semaphore::new(1)),
            timeout,
        }
    }

    pub async fn run<F>(&self, job: F) -> JobRun
    where
        F: Future<Output = ()>,
    {
        let Ok(_permit) = self.in_flight.try_acquire() else {
            warn!(job = self.name, "Previous run still in flight, skipping tick");
            return JobRun::Skipped;
        };

        match tokio::time::timeout(self.timeout, job).await {
            Ok(()) => JobRun::Completed,
            Err(_) => {
                error!(
                    job = self.name,
                    timeout_secs = self.timeout.as_secs(),
                    "Job run timed out and was aborted"
                );
                JobRun::TimedOut
            }
        }
    }
}
