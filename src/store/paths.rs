//! Document layout inside the store.

use crate::scheduler::job::{JobKey, LogStream};

pub const QUEUED_JOBS: &str = "queued_jobs";
pub const LAST_PATCHSET: &str = "last_patchset";

pub fn queued_job(key: &JobKey) -> String {
    format!("{}/{}", QUEUED_JOBS, key)
}

pub fn processed_patchset(change_id: &str) -> String {
    format!("{}/{}", LAST_PATCHSET, change_id)
}

pub fn job_status(change_id: &str, patchset: u32, variant: &str) -> String {
    format!("jobs/{}/{}/{}", change_id, patchset, variant)
}

/// Parent of both log streams of one run; deleting it resets the logs.
pub fn job_logs(change_id: &str, patchset: u32, variant: &str) -> String {
    format!("logs/{}/{}/{}", change_id, patchset, variant)
}

pub fn job_log(change_id: &str, patchset: u32, variant: &str, stream: LogStream) -> String {
    format!("{}/{}", job_logs(change_id, patchset, variant), stream)
}
