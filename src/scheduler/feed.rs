//! Upstream review feed: the ref advertisement of the review server.
//!
//! Each advertised line looks like
//! `0046fd1489924674b3b833fd69748af4ba66cdab3cf7 refs/changes/39/560239/1`:
//! four hex digits of pkt-line length, the 40 hex digit revision, then the
//! change ref. The change id is the shard and change number joined, here
//! `39560239`. Anything else is skipped.

use std::collections::BTreeMap;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use reqwest::Client;

use crate::error::{CiError, Result};

static CHANGE_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9a-f]{4}([0-9a-f]{40})\s+refs/changes/(\d+)/(\d+)/(\d+)")
        .expect("change ref pattern is valid")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedEntry {
    pub revision: String,
    /// Shard followed by change number, e.g. `39` + `560239`
    pub change_id: String,
    pub patchset: u32,
}

/// Parse one advertisement line. Returns `None` for anything that is not a
/// change ref.
pub fn parse_ref_line(line: &str) -> Option<FeedEntry> {
    let caps = CHANGE_REF.captures(line)?;
    let patchset = caps[4].parse().ok()?;
    Some(FeedEntry {
        revision: caps[1].to_string(),
        change_id: format!("{}{}", &caps[2], &caps[3]),
        patchset,
    })
}

/// Latest advertised patchset per change id.
pub fn latest_patchsets(advertisement: &str) -> BTreeMap<String, u32> {
    let mut latest = BTreeMap::new();
    for line in advertisement.lines() {
        let Some(entry) = parse_ref_line(line) else {
            continue;
        };
        let current = latest.entry(entry.change_id).or_insert(0);
        *current = (*current).max(entry.patchset);
    }
    latest
}

/// Fetches the advertisement over HTTP.
#[derive(Debug, Clone)]
pub struct SourceFeed {
    http: Client,
    url: String,
}

impl SourceFeed {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            http: Client::builder().timeout(timeout).build()?,
            url: url.into(),
        })
    }

    /// URL of the smart-HTTP ref advertisement for a repository root.
    pub fn advertisement_url(repo_root: &str) -> String {
        format!(
            "{}/info/refs?service=git-upload-pack",
            repo_root.trim_end_matches('/')
        )
    }

    pub async fn fetch(&self) -> Result<BTreeMap<String, u32>> {
        let response = self.http.get(&self.url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(CiError::Feed {
                status: status.as_u16(),
                url: self.url.clone(),
            });
        }
        let text = response.text().await?;
        let latest = latest_patchsets(&text);
        tracing::debug!(url = %self.url, changes = latest.len(), "Fetched source feed");
        Ok(latest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHA: &str = "fd1489924674b3b833fd69748af4ba66cdab3cf7";

    #[test]
    fn parses_change_ref() {
        let line = format!("0046{} refs/changes/39/560239/1", SHA);
        let entry = parse_ref_line(&line).unwrap();
        assert_eq!(entry.revision, SHA);
        assert_eq!(entry.change_id, "39560239");
        assert_eq!(entry.patchset, 1);
    }

    #[test]
    fn change_id_rebuilds_the_advertised_ref() {
        let line = format!("0046{} refs/changes/39/560239/7", SHA);
        let entry = parse_ref_line(&line).unwrap();
        assert_eq!(
            crate::scheduler::job::revision_ref(&entry.change_id, entry.patchset),
            "refs/changes/39/560239/7"
        );
    }

    #[test]
    fn skips_non_change_lines() {
        assert!(parse_ref_line("001e# service=git-upload-pack").is_none());
        assert!(parse_ref_line(&format!("003f{} refs/heads/master", SHA)).is_none());
        assert!(parse_ref_line(&format!("0046{} refs/changes/39/560239/meta", SHA)).is_none());
        assert!(parse_ref_line("").is_none());
    }

    #[test]
    fn keeps_latest_patchset_per_change() {
        let text = [
            "001e# service=git-upload-pack".to_string(),
            format!("0046{} refs/changes/39/560239/1", SHA),
            format!("0046{} refs/changes/39/560239/3", SHA),
            format!("0046{} refs/changes/39/560239/2", SHA),
            format!("0046{} refs/changes/40/560240/1", SHA),
            format!("0046{} refs/changes/38/560239/5", SHA),
            "garbage".to_string(),
        ]
        .join("\n");

        let latest = latest_patchsets(&text);
        assert_eq!(latest.len(), 3);
        assert_eq!(latest["39560239"], 3);
        assert_eq!(latest["40560240"], 1);
        // Same change number under another shard is a different change.
        assert_eq!(latest["38560239"], 5);
    }

    #[test]
    fn overflowing_patchset_is_skipped() {
        let line = format!("0046{} refs/changes/39/560239/99999999999", SHA);
        assert!(parse_ref_line(&line).is_none());
    }

    #[test]
    fn advertisement_url_for_repo() {
        assert_eq!(
            SourceFeed::advertisement_url("https://review.example/repo/"),
            "https://review.example/repo/info/refs?service=git-upload-pack"
        );
    }
}
