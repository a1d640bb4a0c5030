use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::JobVariant;

/// Lifecycle of one job execution as published to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobStatus {
    Started,
    Succeeded,
    Failed,
    TimedOut,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobStatus::Started)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Started => write!(f, "started"),
            JobStatus::Succeeded => write!(f, "succeeded"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::TimedOut => write!(f, "timedOut"),
        }
    }
}

/// Stable queue key: one record per change and variant, so re-enqueueing
/// overwrites instead of duplicating.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobKey {
    pub change_id: String,
    pub variant: String,
}

impl JobKey {
    pub fn new(change_id: impl Into<String>, variant: impl Into<String>) -> Self {
        Self {
            change_id: change_id.into(),
            variant: variant.into(),
        }
    }

    /// Parse a key as listed under the queue. Change ids are numeric, so the
    /// first `-` separates them from the variant name.
    pub fn parse(raw: &str) -> Option<Self> {
        let (change_id, variant) = raw.split_once('-')?;
        if variant.is_empty() || !is_change_id(change_id) {
            return None;
        }
        Some(Self::new(change_id, variant))
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.change_id, self.variant)
    }
}

/// A unit of work waiting in the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedJob {
    pub change_id: String,
    pub patchset: u32,
    pub job_variant: String,
    /// Exported verbatim as the job's environment
    #[serde(default)]
    pub variant_params: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

impl QueuedJob {
    /// Build the record for one variant of a change/patchset. The variant's
    /// static parameters win over the generated ones.
    pub fn new(change_id: &str, patchset: u32, variant_name: &str, variant: &JobVariant) -> Self {
        let mut params = BTreeMap::new();
        params.insert("CFG".to_string(), variant_name.to_string());
        params.insert("CHANGE_ID".to_string(), change_id.to_string());
        params.insert("PATCHSET".to_string(), patchset.to_string());
        params.insert("REV".to_string(), revision_ref(change_id, patchset));
        params.extend(variant.env.iter().map(|(k, v)| (k.clone(), v.clone())));

        Self {
            change_id: change_id.to_string(),
            patchset,
            job_variant: variant_name.to_string(),
            variant_params: params,
            owner: None,
        }
    }

    pub fn key(&self) -> JobKey {
        JobKey::new(self.change_id.clone(), self.job_variant.clone())
    }

    /// Whether `identity` may take this record.
    pub fn claimable_by(&self, identity: &str) -> bool {
        match self.owner.as_deref() {
            None | Some("") => true,
            Some(owner) => owner == identity,
        }
    }
}

/// Whether `raw` can be a change id: the two-digit shard of its ref followed
/// by the change number, all ASCII digits.
pub fn is_change_id(raw: &str) -> bool {
    raw.len() > 2 && raw.bytes().all(|b| b.is_ascii_digit())
}

/// Review ref of a patchset. The first two characters of the change id are
/// the ref's shard: `39560239` maps to `refs/changes/39/560239/<patchset>`.
pub fn revision_ref(change_id: &str, patchset: u32) -> String {
    let split = change_id
        .char_indices()
        .nth(2)
        .map_or(change_id.len(), |(i, _)| i);
    let (shard, change) = change_id.split_at(split);
    format!("refs/changes/{}/{}/{}", shard, change, patchset)
}

/// The document written to a job's status path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusRecord {
    pub status: JobStatus,
    pub timestamp: DateTime<Utc>,
    pub owner: String,
    pub run_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl fmt::Display for LogStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogStream::Stdout => write!(f, "stdout"),
            LogStream::Stderr => write!(f, "stderr"),
        }
    }
}
