use std::collections::BTreeMap;

use crate::error::Result;
use crate::scheduler::job::{JobKey, QueuedJob};
use crate::store::{paths, StoreClient};

/// Takes exclusive ownership of queued jobs.
///
/// The store offers no locks or leases, so ownership is established with a
/// read / set owner / conditional write sequence on the record's version tag.
/// Exactly one conditional write can succeed per version, so at most one
/// worker claims a given record.
#[derive(Debug, Clone)]
pub struct JobClaimer {
    store: StoreClient,
    identity: String,
}

impl JobClaimer {
    pub fn new(store: StoreClient, identity: impl Into<String>) -> Self {
        Self {
            store,
            identity: identity.into(),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Snapshot of the queue, keyed by record name.
    pub async fn list_queued(&self) -> Result<BTreeMap<String, QueuedJob>> {
        let queue = self
            .store
            .get::<BTreeMap<String, serde_json::Value>>(paths::QUEUED_JOBS)
            .await?
            .unwrap_or_default();

        Ok(queue
            .into_iter()
            .filter_map(|(name, value)| match serde_json::from_value(value) {
                Ok(job) => Some((name, job)),
                Err(e) => {
                    tracing::warn!(job = %name, error = %e, "Skipping malformed queued job");
                    None
                }
            })
            .collect())
    }

    /// Try to take ownership of the queued job at `key`.
    ///
    /// Returns `Ok(None)` when the job is gone, owned by another worker, or
    /// another worker won the conditional write. None of those are errors;
    /// the caller simply moves on to the next candidate. Transport failures
    /// are returned as `Err`.
    pub async fn claim(&self, key: &JobKey) -> Result<Option<QueuedJob>> {
        let path = paths::queued_job(key);
        let current = self.store.get_versioned::<QueuedJob>(&path).await?;

        let Some(mut job) = current.value else {
            tracing::debug!(job = %key, "Job already taken off the queue");
            return Ok(None);
        };
        if !job.claimable_by(&self.identity) {
            tracing::debug!(job = %key, owner = ?job.owner, "Job owned by another worker");
            return Ok(None);
        }

        job.owner = Some(self.identity.clone());
        if !self
            .store
            .conditional_write(&path, &job, &current.etag)
            .await?
        {
            tracing::debug!(job = %key, "Lost claim race");
            return Ok(None);
        }

        // Ownership is established; removing the record only hides it from
        // other pollers.
        if let Err(e) = self.store.delete(&path).await {
            tracing::warn!(job = %key, error = %e, "Claimed job could not be removed from the queue");
        }

        tracing::info!(
            job = %key,
            change_id = %job.change_id,
            patchset = job.patchset,
            "Acquired job"
        );
        Ok(Some(job))
    }
}
