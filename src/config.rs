use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CiError, Result};

/// Connection settings for the shared document store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Root URL of the store, e.g. `https://example-ci.firebaseio.com`
    pub base_url: String,
    /// Per-request timeout. Bounds how long a log flush can stall the runner loop.
    pub request_timeout: Duration,
    /// Opaque token appended as the `auth` query parameter when set
    pub auth_token: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:9000".to_string(),
            request_timeout: Duration::from_secs(10),
            auth_token: None,
        }
    }
}

impl StoreConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }
}

/// How a claimed job is isolated from the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxConfig {
    /// Run inside a named Docker container.
    Docker {
        /// Docker image providing the build environment
        image: String,
        /// Fixed local container name; a leftover container with this name is removed first
        container_name: String,
        /// Disable network access in container
        network_disabled: bool,
        /// Memory limit (e.g., "8g")
        memory_limit: Option<String>,
        /// CPU limit (e.g., "4")
        cpu_limit: Option<String>,
    },
    /// Run `sh -c <command>` directly on the worker.
    Shell,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        SandboxConfig::Docker {
            image: "worker".to_string(),
            container_name: "job".to_string(),
            network_disabled: false,
            memory_limit: None,
            cpu_limit: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Hard wall-clock limit for a single job
    pub job_timeout: Duration,
    /// Minimum time between two log uploads
    pub flush_interval: Duration,
    /// Upper bound on a single supervision loop iteration
    pub poll_interval: Duration,
    /// Per-stream cap on output held back after failed uploads
    pub max_buffered_bytes: usize,
    /// Delay before the single retry of the terminal status write
    pub status_retry_delay: Duration,
    pub sandbox: SandboxConfig,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            job_timeout: Duration::from_secs(10),
            flush_interval: Duration::from_secs(1),
            poll_interval: Duration::from_secs(1),
            max_buffered_bytes: 4 * 1024 * 1024,
            status_retry_delay: Duration::from_secs(1),
            sandbox: SandboxConfig::default(),
        }
    }
}

impl RunnerConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn with_sandbox(mut self, sandbox: SandboxConfig) -> Self {
        self.sandbox = sandbox;
        self
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Ownership identity written into claimed records
    pub identity: String,
    /// Sleep between polls when the queue is empty
    pub idle_sleep: Duration,
    pub runner: RunnerConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            identity: local_identity(),
            idle_sleep: Duration::from_secs(10),
            runner: RunnerConfig::default(),
        }
    }
}

impl WorkerConfig {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            ..Default::default()
        }
    }
}

/// Machine identity of this worker. Falls back to a fixed name if the
/// hostname cannot be read.
pub fn local_identity() -> String {
    match nix::unistd::gethostname() {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(e) => {
            tracing::warn!(error = %e, "Could not read hostname, using fallback identity");
            "ci-worker".to_string()
        }
    }
}

/// Settings for the compute API that hosts worker machines.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub api_base: String,
    pub project: String,
    pub zone: String,
    /// Every machine whose name starts with this prefix belongs to the pool
    pub vm_prefix: String,
    /// Number of machines created by a recreate
    pub size: usize,
    /// Instance body posted on create; `name` is filled in per machine
    pub instance_template: serde_json::Value,
    pub auth_token: Option<String>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            api_base: "https://www.googleapis.com/compute/v1".to_string(),
            project: "ci-project".to_string(),
            zone: "us-central1-c".to_string(),
            vm_prefix: "ci-worker-".to_string(),
            size: 2,
            instance_template: serde_json::Value::Object(Default::default()),
            auth_token: None,
        }
    }
}

/// A named command template enqueued once per change/patchset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobVariant {
    /// Shell command run in the sandbox. In Docker mode an empty command
    /// runs the image's default entrypoint.
    #[serde(default)]
    pub command: Option<String>,
    /// Static parameters exported to the job environment
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// The job variants shared by the poller and every worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CiConfig {
    pub variants: BTreeMap<String, JobVariant>,
}

impl CiConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        let config: CiConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            CiError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&text)
    }

    pub fn with_variant(mut self, name: impl Into<String>, variant: JobVariant) -> Self {
        self.variants.insert(name.into(), variant);
        self
    }

    pub fn variant(&self, name: &str) -> Option<&JobVariant> {
        self.variants.get(name)
    }

    /// Variant names end up in store keys, so they must be path-safe.
    fn validate(&self) -> Result<()> {
        for name in self.variants.keys() {
            let valid = !name.is_empty()
                && name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
            if !valid {
                return Err(CiError::Config(format!("invalid variant name {:?}", name)));
            }
        }
        Ok(())
    }
}
