//! Port to the container runtime.
//!
//! The orchestrator only talks to containers through [`ContainerRuntime`]; the Docker adapter lives
//! in [`crate::docker`] and tests use an in-memory fake.

use std::{
    collections::{BTreeMap, HashMap},
    path::PathBuf,
    time::Duration,
};

use futures_util::stream::BoxStream;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("container runtime object `{target}` not found")]
    NotFound { target: String },
    #[error("container runtime call `{operation}` failed for `{target}`: {message}")]
    Operation {
        operation: &'static str,
        target: String,
        message: String,
    },
    #[error("image build for `{image}` failed: {message}")]
    Build { image: String, message: String },
    #[error("failed to connect to container runtime: {0}")]
    Connect(String),
}

impl RuntimeError {
    pub fn operation(operation: &'static str, target: &str, message: impl Into<String>) -> Self {
        RuntimeError::Operation {
            operation,
            target: target.to_string(),
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RuntimeError::NotFound { .. })
    }
}

/// Where a build starts from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildSpec {
    pub dockerfile: PathBuf,
    pub context_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    pub container_port: u16,
    pub protocol: Protocol,
    pub host_ip: String,
    pub host_port: u16,
}

impl PortMapping {
    /// Runtime key, e.g. `8211/udp`.
    pub fn key(&self) -> String {
        format!("{}/{}", self.container_port, self.protocol.as_str())
    }
}

/// Everything needed to create one game container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
    pub ports: Vec<PortMapping>,
    pub memory_bytes: u64,
    pub cpu_shares: u64,
    pub restart_max_retries: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogOptions {
    pub follow: bool,
    pub timestamps: bool,
    /// Unix seconds; only output produced after this instant.
    pub since: Option<i64>,
    /// Only the last `n` lines of history.
    pub tail: Option<usize>,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            follow: true,
            timestamps: true,
            since: None,
            tail: None,
        }
    }
}

/// Combined stdout/stderr chunks, in arrival order.
pub type LogStream = BoxStream<'static, Result<String, RuntimeError>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkCounters {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// Point-in-time counters as reported by the runtime (cgroup style).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawStats {
    pub cpu_total_usage: u64,
    pub precpu_total_usage: u64,
    pub system_cpu_usage: u64,
    pub presystem_cpu_usage: u64,
    pub online_cpus: u32,
    pub memory_usage: u64,
    pub memory_limit: u64,
    pub networks: BTreeMap<String, NetworkCounters>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPort {
    pub host_ip: Option<String>,
    pub host_port: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerDetails {
    pub id: String,
    /// Without the leading `/` the runtime reports.
    pub name: String,
    pub running: bool,
    pub status: String,
    pub labels: HashMap<String, String>,
    pub ports: BTreeMap<String, Vec<HostPort>>,
    /// RFC 3339.
    pub created: Option<String>,
    /// RFC 3339.
    pub started_at: Option<String>,
}

#[async_trait::async_trait]
pub trait ContainerRuntime: Send + Sync + 'static {
    async fn image_exists(&self, image: &str) -> Result<bool, RuntimeError>;

    async fn build_image(&self, image: &str, spec: &BuildSpec) -> Result<(), RuntimeError>;

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError>;

    /// Returns the runtime handle (container id).
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    async fn start_container(&self, handle: &str) -> Result<(), RuntimeError>;

    /// Graceful stop: termination signal, then a forced kill once `grace` elapses.
    async fn stop_container(&self, handle: &str, grace: Duration) -> Result<(), RuntimeError>;

    async fn restart_container(&self, handle: &str, grace: Duration) -> Result<(), RuntimeError>;

    async fn kill_container(&self, handle: &str) -> Result<(), RuntimeError>;

    async fn remove_container(&self, handle: &str, force: bool) -> Result<(), RuntimeError>;

    fn logs(&self, handle: &str, options: LogOptions) -> LogStream;

    async fn stats(&self, handle: &str) -> Result<RawStats, RuntimeError>;

    /// Runs `cmd` once and returns combined output after the exec channel closes.
    async fn exec(&self, handle: &str, cmd: Vec<String>) -> Result<String, RuntimeError>;

    /// Handles of all containers (running or not) carrying `label` (`key=value`).
    async fn list_by_label(&self, label: &str) -> Result<Vec<String>, RuntimeError>;

    async fn inspect(&self, handle: &str) -> Result<ContainerDetails, RuntimeError>;
}
