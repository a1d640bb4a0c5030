use std::collections::BTreeMap;

use crate::config::CiConfig;
use crate::error::{CiError, Result};
use crate::scheduler::feed::SourceFeed;
use crate::scheduler::job::{is_change_id, JobKey, QueuedJob};
use crate::store::{paths, StoreClient};

/// Bound on compare-and-swap retries for the processed-patchset update.
const MAX_CAS_ATTEMPTS: u32 = 8;

/// Outcome of one discovery pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PollSummary {
    pub enqueued: Vec<(String, u32)>,
    pub failed: Vec<String>,
}

/// Changes whose latest advertised patchset has not been processed yet.
pub fn pending(
    advertised: &BTreeMap<String, u32>,
    processed: &BTreeMap<String, u32>,
) -> BTreeMap<String, u32> {
    advertised
        .iter()
        .filter(|(change_id, patchset)| {
            processed
                .get(*change_id)
                .map_or(true, |done| *done < **patchset)
        })
        .map(|(change_id, patchset)| (change_id.clone(), *patchset))
        .collect()
}

/// Writes queued-job records for every configured variant.
#[derive(Debug, Clone)]
pub struct Enqueuer {
    store: StoreClient,
    config: CiConfig,
}

impl Enqueuer {
    pub fn new(store: StoreClient, config: CiConfig) -> Self {
        Self { store, config }
    }

    /// Enqueue one job per variant for a change/patchset, then mark the
    /// patchset processed.
    ///
    /// Records live at a deterministic key per change and variant, so a
    /// retried enqueue overwrites rather than duplicates. Change ids must be
    /// numeric so workers can parse the key back.
    pub async fn enqueue(&self, change_id: &str, patchset: u32) -> Result<Vec<JobKey>> {
        if !is_change_id(change_id) {
            return Err(CiError::Config(format!(
                "invalid change id {:?}: expected shard and change number digits",
                change_id
            )));
        }

        let mut keys = Vec::with_capacity(self.config.variants.len());
        for (name, variant) in &self.config.variants {
            let job = QueuedJob::new(change_id, patchset, name, variant);
            let key = job.key();
            self.store.put(&paths::queued_job(&key), &job).await?;
            tracing::debug!(job = %key, patchset, "Queued job");
            keys.push(key);
        }

        let advanced = self.record_processed(change_id, patchset).await?;
        tracing::info!(
            change_id,
            patchset,
            variants = keys.len(),
            advanced,
            "Enqueued change"
        );
        Ok(keys)
    }

    /// Raise the processed patchset of a change to `patchset`, never lowering it.
    ///
    /// Returns `true` if the stored value changed. Concurrent enqueuers for the
    /// same change are serialized through the store's version precondition.
    pub async fn record_processed(&self, change_id: &str, patchset: u32) -> Result<bool> {
        let path = paths::processed_patchset(change_id);
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let current = self.store.get_versioned::<u32>(&path).await?;
            if current.value.is_some_and(|done| done >= patchset) {
                return Ok(false);
            }
            if self
                .store
                .conditional_write(&path, &patchset, &current.etag)
                .await?
            {
                return Ok(true);
            }
            tracing::debug!(
                change_id,
                patchset,
                attempt,
                "Processed patchset changed underneath, retrying"
            );
        }
        Err(CiError::Contention {
            path,
            attempts: MAX_CAS_ATTEMPTS,
        })
    }

    /// All recorded processed patchsets.
    pub async fn processed(&self) -> Result<BTreeMap<String, u32>> {
        Ok(self
            .store
            .get::<BTreeMap<String, u32>>(paths::LAST_PATCHSET)
            .await?
            .unwrap_or_default())
    }

    /// One discovery pass: enqueue every change with an unprocessed patchset.
    ///
    /// A change that fails to enqueue is reported in the summary and retried
    /// on the next pass; it does not stop the others.
    pub async fn poll_once(&self, feed: &SourceFeed) -> Result<PollSummary> {
        let advertised = feed.fetch().await?;
        let processed = self.processed().await?;
        let todo = pending(&advertised, &processed);
        tracing::info!(
            advertised = advertised.len(),
            pending = todo.len(),
            "Discovered pending changes"
        );

        let mut summary = PollSummary::default();
        for (change_id, patchset) in todo {
            match self.enqueue(&change_id, patchset).await {
                Ok(_) => summary.enqueued.push((change_id, patchset)),
                Err(e) => {
                    tracing::warn!(
                        change_id = %change_id,
                        patchset,
                        error = %e,
                        "Failed to enqueue change"
                    );
                    summary.failed.push(change_id);
                }
            }
        }
        Ok(summary)
    }

    /// Record every advertised patchset as processed without enqueueing
    /// anything. Used once when bootstrapping a deployment so historical
    /// changes are not built.
    ///
    /// Each change goes through [`Enqueuer::record_processed`], so a value
    /// raised concurrently by a poller is never lowered. Returns how many
    /// changes were advanced.
    pub async fn mark_all_done(&self, feed: &SourceFeed) -> Result<usize> {
        let advertised = feed.fetch().await?;
        let processed = self.processed().await?;
        let todo = pending(&advertised, &processed);

        let mut marked = 0;
        for (change_id, patchset) in &todo {
            if self.record_processed(change_id, *patchset).await? {
                marked += 1;
            }
        }
        tracing::info!(
            pending = todo.len(),
            marked,
            "Marked advertised patchsets as processed"
        );
        Ok(marked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(entries: &[(&str, u32)]) -> BTreeMap<String, u32> {
        entries.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn unrecorded_change_is_pending() {
        let todo = pending(&map(&[("1", 1)]), &BTreeMap::new());
        assert_eq!(todo, map(&[("1", 1)]));
    }

    #[test]
    fn newer_patchset_is_pending() {
        let todo = pending(&map(&[("1", 3), ("2", 2)]), &map(&[("1", 2), ("2", 2)]));
        assert_eq!(todo, map(&[("1", 3)]));
    }

    #[test]
    fn older_or_equal_patchset_is_not_pending() {
        let todo = pending(&map(&[("1", 2)]), &map(&[("1", 5)]));
        assert!(todo.is_empty());
    }
}
