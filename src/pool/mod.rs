//! Worker pool management through the compute provider's REST API.
//!
//! The pool is every machine whose name starts with the configured prefix.
//! Refreshing the pool means destroying all of them and creating a fresh set
//! with names that cannot collide with machines still being torn down.

use std::fmt;
use std::time::Duration;

use reqwest::{Client, Method, RequestBuilder, Response};
use serde::Deserialize;

use crate::config::PoolConfig;
use crate::error::{CiError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineStatus {
    Provisioning,
    Staging,
    Running,
    Stopping,
    Terminated,
    Unknown,
}

impl MachineStatus {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "PROVISIONING" => MachineStatus::Provisioning,
            "STAGING" => MachineStatus::Staging,
            "RUNNING" => MachineStatus::Running,
            "STOPPING" => MachineStatus::Stopping,
            "TERMINATED" => MachineStatus::Terminated,
            _ => MachineStatus::Unknown,
        }
    }
}

impl fmt::Display for MachineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MachineStatus::Provisioning => write!(f, "provisioning"),
            MachineStatus::Staging => write!(f, "staging"),
            MachineStatus::Running => write!(f, "running"),
            MachineStatus::Stopping => write!(f, "stopping"),
            MachineStatus::Terminated => write!(f, "terminated"),
            MachineStatus::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerMachine {
    pub name: String,
    pub status: MachineStatus,
}

#[derive(Deserialize)]
struct InstanceList {
    #[serde(default)]
    items: Vec<Instance>,
}

#[derive(Deserialize)]
struct Instance {
    name: String,
    #[serde(default)]
    status: String,
}

/// Names for a fresh batch: `<prefix><unix seconds>-<index>`.
pub fn machine_names(prefix: &str, now_secs: i64, count: usize) -> Vec<String> {
    (0..count)
        .map(|i| format!("{}{}-{}", prefix, now_secs, i))
        .collect()
}

#[derive(Debug, Clone)]
pub struct PoolController {
    http: Client,
    config: PoolConfig,
}

impl PoolController {
    pub fn new(config: PoolConfig) -> Result<Self> {
        let http = Client::builder().timeout(Duration::from_secs(60)).build()?;
        Ok(Self { http, config })
    }

    fn instances_url(&self) -> String {
        format!(
            "{}/projects/{}/zones/{}/instances",
            self.config.api_base.trim_end_matches('/'),
            self.config.project,
            self.config.zone
        )
    }

    fn request(&self, method: Method, uri: &str) -> RequestBuilder {
        let builder = self.http.request(method, uri);
        match &self.config.auth_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    fn check(response: &Response, method: &'static str, uri: &str) -> Result<()> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        tracing::error!(status = status.as_u16(), method, uri, "Provisioning request failed");
        Err(CiError::Provisioning {
            status: status.as_u16(),
            method,
            uri: uri.to_string(),
        })
    }

    /// Machines belonging to the pool.
    pub async fn list(&self) -> Result<Vec<WorkerMachine>> {
        let uri = self.instances_url();
        let response = self.request(Method::GET, &uri).send().await?;
        Self::check(&response, "GET", &uri)?;
        let list: InstanceList = response.json().await?;

        Ok(list
            .items
            .into_iter()
            .filter(|i| i.name.starts_with(&self.config.vm_prefix))
            .map(|i| WorkerMachine {
                status: MachineStatus::parse(&i.status),
                name: i.name,
            })
            .collect())
    }

    /// Destroy every pool machine, one acknowledged request at a time.
    /// Aborts on the first rejected request.
    pub async fn destroy_all(&self) -> Result<Vec<String>> {
        let machines = self.list().await?;
        let mut destroyed = Vec::with_capacity(machines.len());
        for machine in machines {
            tracing::info!(machine = %machine.name, "Destroying worker");
            let uri = format!("{}/{}", self.instances_url(), machine.name);
            let response = self.request(Method::DELETE, &uri).send().await?;
            Self::check(&response, "DELETE", &uri)?;
            destroyed.push(machine.name);
        }
        Ok(destroyed)
    }

    pub async fn create(&self, name: &str) -> Result<()> {
        let mut body = self.config.instance_template.clone();
        match body.as_object_mut() {
            Some(fields) => {
                fields.insert("name".to_string(), serde_json::Value::String(name.to_string()));
            }
            None => {
                return Err(CiError::Config(
                    "instance template must be a JSON object".to_string(),
                ))
            }
        }

        tracing::info!(machine = name, "Creating worker");
        let uri = self.instances_url();
        let response = self.request(Method::POST, &uri).json(&body).send().await?;
        Self::check(&response, "POST", &uri)
    }

    /// Replace the whole pool with `count` fresh machines.
    pub async fn recreate(&self, count: usize) -> Result<Vec<String>> {
        let destroyed = self.destroy_all().await?;
        tracing::info!(destroyed = destroyed.len(), "Destroyed workers");

        let names = machine_names(&self.config.vm_prefix, chrono::Utc::now().timestamp(), count);
        for name in &names {
            self.create(name).await?;
        }
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_disambiguated_by_time_and_index() {
        assert_eq!(
            machine_names("ci-worker-", 1700000000, 2),
            vec!["ci-worker-1700000000-0", "ci-worker-1700000000-1"]
        );
        assert!(machine_names("ci-worker-", 1, 0).is_empty());
    }

    #[test]
    fn status_parse() {
        assert_eq!(MachineStatus::parse("RUNNING"), MachineStatus::Running);
        assert_eq!(MachineStatus::parse("PROVISIONING"), MachineStatus::Provisioning);
        assert_eq!(MachineStatus::parse("SUSPENDED"), MachineStatus::Unknown);
        assert_eq!(MachineStatus::Running.to_string(), "running");
    }

    #[test]
    fn instances_url_layout() {
        let controller = PoolController::new(PoolConfig {
            api_base: "http://compute.local/v1/".to_string(),
            project: "p".to_string(),
            zone: "z".to_string(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(
            controller.instances_url(),
            "http://compute.local/v1/projects/p/zones/z/instances"
        );
    }
}
