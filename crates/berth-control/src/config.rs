use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use berth_agent::{CreatePolicy, OrchestratorConfig};

const DEFAULT_CONFIG_PATH: &str = "berth.toml";

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_u64(name: &str) -> Option<u64> {
    env_string(name).and_then(|v| v.parse::<u64>().ok())
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct PanelConfig {
    pub listen_addr: SocketAddr,
    /// Hard bound on shutdown after a termination signal.
    pub shutdown_grace_secs: u64,
    pub stats_interval_ms: u64,
    pub create_policy: CreatePolicy,
    /// Docker socket path; `None` uses `DOCKER_HOST` or the platform default.
    pub docker_socket: Option<PathBuf>,
    pub orchestrator: OrchestratorConfig,
}

impl Default for PanelConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            shutdown_grace_secs: 10,
            stats_interval_ms: 2000,
            create_policy: CreatePolicy::default(),
            docker_socket: None,
            orchestrator: OrchestratorConfig::default(),
        }
    }
}

impl PanelConfig {
    /// `BERTH_CONFIG` (or `./berth.toml` when present), then `BERTH_*` overrides.
    pub fn load() -> anyhow::Result<Self> {
        let config = match env_string("BERTH_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_PATH))?
            }
            None => Self::default(),
        };
        Ok(config.with_env_overrides())
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::from_toml(&raw).with_context(|| format!("parse config {}", path.display()))
    }

    pub fn from_toml(raw: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(raw)?;
        Ok(config.normalized())
    }

    fn with_env_overrides(mut self) -> Self {
        if let Some(v) = env_string("BERTH_LISTEN") {
            match v.parse() {
                Ok(addr) => self.listen_addr = addr,
                Err(_) => tracing::warn!(value = %v, "ignoring invalid BERTH_LISTEN"),
            }
        }
        if let Some(v) = env_u64("BERTH_SHUTDOWN_GRACE_SEC") {
            self.shutdown_grace_secs = v;
        }
        if let Some(v) = env_u64("BERTH_STATS_INTERVAL_MS") {
            self.stats_interval_ms = v;
        }
        if let Some(v) = env_string("BERTH_CREATE_POLICY") {
            match v.as_str() {
                "keep_degraded" => self.create_policy = CreatePolicy::KeepDegraded,
                "roll_back" => self.create_policy = CreatePolicy::RollBack,
                _ => tracing::warn!(value = %v, "ignoring invalid BERTH_CREATE_POLICY"),
            }
        }
        if let Some(v) = env_string("BERTH_DOCKER_SOCKET") {
            self.docker_socket = Some(PathBuf::from(v));
        }
        self.orchestrator = self.orchestrator.with_env_overrides();
        self.normalized()
    }

    fn normalized(mut self) -> Self {
        self.stats_interval_ms = self.stats_interval_ms.clamp(250, 60_000);
        self.shutdown_grace_secs = self.shutdown_grace_secs.clamp(1, 300);
        self.orchestrator = self.orchestrator.normalized();
        self
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

#[cfg(test)]
mod tests {
    use berth_agent::ImageSource;

    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let cfg = PanelConfig::from_toml("").unwrap();
        assert_eq!(cfg.listen_addr.port(), 8080);
        assert_eq!(cfg.stats_interval(), Duration::from_secs(2));
        assert_eq!(cfg.shutdown_grace(), Duration::from_secs(10));
        assert_eq!(cfg.create_policy, CreatePolicy::KeepDegraded);
        assert_eq!(cfg.orchestrator.log_capacity, 1000);
    }

    #[test]
    fn nested_sections_and_clamps() {
        let cfg = PanelConfig::from_toml(
            r#"
listen_addr = "127.0.0.1:9000"
stats_interval_ms = 10
create_policy = "roll_back"

[orchestrator]
stop_grace_secs = 45
log_capacity = 2000

[orchestrator.image]
name = "ghcr.io/acme/palworld:1"
source = { kind = "pull" }
"#,
        )
        .unwrap();
        assert_eq!(cfg.listen_addr, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(cfg.stats_interval_ms, 250);
        assert_eq!(cfg.create_policy, CreatePolicy::RollBack);
        assert_eq!(cfg.orchestrator.stop_grace(), Duration::from_secs(45));
        assert_eq!(cfg.orchestrator.log_capacity, 2000);
        assert_eq!(cfg.orchestrator.image.source, ImageSource::Pull);
    }

    #[test]
    fn unknown_policy_is_a_parse_error() {
        assert!(PanelConfig::from_toml(r#"create_policy = "maybe""#).is_err());
    }
}
