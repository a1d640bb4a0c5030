use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::config::{CiConfig, WorkerConfig};
use crate::error::{CiError, Result};
use crate::scheduler::job::JobKey;
use crate::store::StoreClient;
use crate::worker::{JobClaimer, JobRunner, RunOutcome};

/// One worker machine: polls the queue, claims a job, runs it, repeats.
///
/// Workers share nothing but the store. Several nodes polling the same queue
/// race for each record; losing a race just means trying the next one.
#[derive(Debug, Clone)]
pub struct WorkerNode {
    config: WorkerConfig,
    claimer: JobClaimer,
    runner: JobRunner,
}

impl WorkerNode {
    pub fn new(store: StoreClient, config: WorkerConfig, ci: CiConfig) -> Self {
        let claimer = JobClaimer::new(store.clone(), config.identity.clone());
        let runner = JobRunner::new(store, config.runner.clone(), ci, config.identity.clone());
        Self {
            config,
            claimer,
            runner,
        }
    }

    pub fn identity(&self) -> &str {
        &self.config.identity
    }

    /// Run until `shutdown` is cancelled. A job that is already running is
    /// finished before the loop exits.
    ///
    /// Store outages are logged and retried on the next cycle; nothing here
    /// ends the loop except shutdown.
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(identity = %self.config.identity, "Worker started");

        while !shutdown.is_cancelled() {
            let idle = match self.poll_once().await {
                Ok(Some(_)) => false,
                Ok(None) => true,
                Err(e @ CiError::StatusPublish { .. }) => {
                    tracing::error!(error = %e, "Job finished but its status is stuck");
                    false
                }
                Err(e) => {
                    tracing::warn!(error = %e, transient = e.is_transient(), "Poll cycle failed");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.idle_delay()) => {}
                }
            }
        }

        tracing::info!(identity = %self.config.identity, "Worker stopped");
    }

    /// One cycle: walk the queue and run the first job this node manages to
    /// claim. `Ok(None)` means there was nothing to take.
    pub async fn poll_once(&self) -> Result<Option<RunOutcome>> {
        let queue = self.claimer.list_queued().await?;
        if queue.is_empty() {
            return Ok(None);
        }

        for name in queue.keys() {
            let Some(key) = JobKey::parse(name) else {
                tracing::warn!(job = %name, "Skipping queued job with malformed key");
                continue;
            };
            tracing::debug!(job = %key, "Trying to acquire");
            match self.claimer.claim(&key).await {
                Ok(Some(job)) => return self.runner.run(&job).await.map(Some),
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(job = %key, error = %e, "Claim attempt failed");
                    continue;
                }
            }
        }
        Ok(None)
    }

    /// Idle sleep with up to 20% jitter so idle workers do not poll in lockstep.
    fn idle_delay(&self) -> Duration {
        let base = self.config.idle_sleep;
        let jitter_ms = (base.as_millis() / 5) as u64;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
    }
}
