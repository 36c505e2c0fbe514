//! Per-service runtime configuration.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Default container port when neither the workload nor its env sets one.
pub const DEFAULT_PORT: u16 = 4200;

/// The kind of workload a service runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkloadKind {
    /// Long-running HTTP server reachable through a cluster service.
    Web {
        #[serde(default)]
        port: Option<u16>,
        #[serde(default = "default_health_path")]
        health_path: String,
        #[serde(default)]
        readiness_path: Option<String>,
    },
    /// Long-running background process with no inbound traffic.
    Worker {
        #[serde(default)]
        command: Vec<String>,
    },
    /// Scheduled job.
    Cron {
        schedule: String,
        #[serde(default)]
        command: Vec<String>,
    },
}

fn default_health_path() -> String {
    "/health".to_string()
}

impl WorkloadKind {
    pub fn web() -> Self {
        Self::Web {
            port: None,
            health_path: default_health_path(),
            readiness_path: None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Web { .. } => "web",
            Self::Worker { .. } => "worker",
            Self::Cron { .. } => "cron",
        }
    }
}

/// CPU and memory requests/limits in cluster quantity notation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub cpu_request: String,
    pub cpu_limit: String,
    pub memory_request: String,
    pub memory_limit: String,
}

impl Default for ResourceSpec {
    fn default() -> Self {
        Self {
            cpu_request: "100m".to_string(),
            cpu_limit: "500m".to_string(),
            memory_request: "128Mi".to_string(),
            memory_limit: "512Mi".to_string(),
        }
    }
}

/// Everything needed to render a service's workload besides the image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub workload: WorkloadKind,
    #[serde(default = "default_replicas")]
    pub replicas: u32,
    #[serde(default)]
    pub resources: ResourceSpec,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Rolling update surge, `"25%"` or a count.
    #[serde(default)]
    pub max_surge: Option<String>,
    /// Rolling update unavailability, `"25%"` or a count.
    #[serde(default)]
    pub max_unavailable: Option<String>,
}

fn default_replicas() -> u32 {
    1
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            workload: WorkloadKind::web(),
            replicas: default_replicas(),
            resources: ResourceSpec::default(),
            env: BTreeMap::new(),
            max_surge: None,
            max_unavailable: None,
        }
    }
}

impl ServiceConfig {
    /// Replicas the rollout must bring up. Scheduled jobs have none.
    pub fn desired_replicas(&self) -> u32 {
        match self.workload {
            WorkloadKind::Cron { .. } => 0,
            _ => self.replicas,
        }
    }
}
