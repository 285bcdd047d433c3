use std::{path::PathBuf, time::Duration};

use crate::support::{env_secs, env_string, env_u64, env_usize};

pub const DEFAULT_IMAGE: &str = "palworld-server:latest";
pub const DEFAULT_DOCKERFILE: &str = "Dockerfile.palworld";
pub const DEFAULT_LOG_CAPACITY: usize = 1000;
pub const DEFAULT_MEMORY_BYTES: u64 = 4 * 1024 * 1024 * 1024; // 4 GiB
pub const DEFAULT_CPU_SHARES: u64 = 1024;
pub const DEFAULT_RCON_CONTAINER_PORT: u16 = 25575;

/// Where the runtime image comes from when it is missing locally.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ImageSource {
    /// `docker build -f <dockerfile> -t <image> <context_dir>`; `dockerfile` is relative to the
    /// context directory.
    Build {
        dockerfile: PathBuf,
        context_dir: PathBuf,
    },
    /// Fetch the image by name from its registry.
    Pull,
}

impl Default for ImageSource {
    fn default() -> Self {
        ImageSource::Build {
            dockerfile: PathBuf::from(DEFAULT_DOCKERFILE),
            context_dir: PathBuf::from("."),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    pub name: String,
    pub source: ImageSource,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_IMAGE.to_string(),
            source: ImageSource::default(),
        }
    }
}

/// Fixed resource envelope applied to every game container.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ResourceEnvelope {
    /// Hard memory ceiling; swap is pinned to the same value.
    pub memory_bytes: u64,
    /// Relative CPU weight.
    pub cpu_shares: u64,
    /// Crash restarts the runtime performs before giving up.
    pub restart_max_retries: u32,
}

impl Default for ResourceEnvelope {
    fn default() -> Self {
        Self {
            memory_bytes: DEFAULT_MEMORY_BYTES,
            cpu_shares: DEFAULT_CPU_SHARES,
            restart_max_retries: 5,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct RconSettings {
    /// RCON port inside the container; published to `127.0.0.1:<rcon_port>` on the host.
    pub container_port: u16,
    pub timeout_ms: u64,
}

impl Default for RconSettings {
    fn default() -> Self {
        Self {
            container_port: DEFAULT_RCON_CONTAINER_PORT,
            timeout_ms: 5000,
        }
    }
}

impl RconSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.clamp(100, 60_000))
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub image: ImageConfig,
    pub resources: ResourceEnvelope,
    /// Container names are `<container_prefix><server_id>`.
    pub container_prefix: String,
    /// Ownership labels are `<label_prefix>.managed`, `<label_prefix>.server-id`, ...
    pub label_prefix: String,
    pub stop_grace_secs: u64,
    pub restart_grace_secs: u64,
    pub log_capacity: usize,
    /// Interface whose counters are reported as rx/tx bytes.
    pub primary_interface: String,
    pub rcon: RconSettings,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            image: ImageConfig::default(),
            resources: ResourceEnvelope::default(),
            container_prefix: "palworld-".to_string(),
            label_prefix: "berth".to_string(),
            stop_grace_secs: 30,
            restart_grace_secs: 10,
            log_capacity: DEFAULT_LOG_CAPACITY,
            primary_interface: "eth0".to_string(),
            rcon: RconSettings::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Applies `BERTH_*` environment overrides on top of file/default values.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(v) = env_string("BERTH_IMAGE") {
            self.image.name = v;
        }
        if let ImageSource::Build {
            dockerfile,
            context_dir,
        } = &mut self.image.source
        {
            if let Some(v) = env_string("BERTH_DOCKER_CONTEXT") {
                *context_dir = PathBuf::from(v);
            }
            if let Some(v) = env_string("BERTH_DOCKERFILE") {
                *dockerfile = PathBuf::from(v);
            }
        }
        if let Some(v) = env_u64("BERTH_MEMORY_BYTES") {
            self.resources.memory_bytes = v;
        }
        if let Some(v) = env_u64("BERTH_CPU_SHARES") {
            self.resources.cpu_shares = v;
        }
        if let Some(v) = env_secs("BERTH_STOP_GRACE_SEC", 1, 600) {
            self.stop_grace_secs = v.as_secs();
        }
        if let Some(v) = env_secs("BERTH_RESTART_GRACE_SEC", 1, 600) {
            self.restart_grace_secs = v.as_secs();
        }
        if let Some(v) = env_usize("BERTH_LOG_MAX_LINES") {
            self.log_capacity = v;
        }
        if let Some(v) = env_string("BERTH_CONTAINER_PREFIX") {
            self.container_prefix = v;
        }
        self.normalized()
    }

    /// Clamps values into their supported ranges.
    pub fn normalized(mut self) -> Self {
        self.log_capacity = self.log_capacity.clamp(100, 50_000);
        self.resources.cpu_shares = self.resources.cpu_shares.clamp(2, 262_144);
        self.resources.memory_bytes = self.resources.memory_bytes.max(64 * 1024 * 1024);
        self.resources.restart_max_retries = self.resources.restart_max_retries.min(100);
        if self.label_prefix.trim().is_empty() {
            self.label_prefix = "berth".to_string();
        }
        self
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs.max(1))
    }

    pub fn restart_grace(&self) -> Duration {
        Duration::from_secs(self.restart_grace_secs.max(1))
    }

    pub fn managed_label(&self) -> String {
        format!("{}.managed", self.label_prefix)
    }

    pub fn server_id_label(&self) -> String {
        format!("{}.server-id", self.label_prefix)
    }

    pub fn config_label(&self) -> String {
        format!("{}.config", self.label_prefix)
    }

    /// `key=value` filter selecting every container this manager created.
    pub fn ownership_filter(&self) -> String {
        format!("{}=true", self.managed_label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_envelope() {
        let cfg = OrchestratorConfig::default();
        assert_eq!(cfg.image.name, "palworld-server:latest");
        assert_eq!(cfg.resources.memory_bytes, 4_294_967_296);
        assert_eq!(cfg.resources.cpu_shares, 1024);
        assert_eq!(cfg.stop_grace(), Duration::from_secs(30));
        assert_eq!(cfg.restart_grace(), Duration::from_secs(10));
        assert_eq!(cfg.log_capacity, 1000);
        assert_eq!(cfg.ownership_filter(), "berth.managed=true");
    }

    #[test]
    fn normalized_clamps_log_capacity() {
        let cfg = OrchestratorConfig {
            log_capacity: 5,
            ..OrchestratorConfig::default()
        }
        .normalized();
        assert_eq!(cfg.log_capacity, 100);
    }

    #[test]
    fn image_source_deserializes_tagged() {
        let src: ImageSource = serde_json::from_str(r#"{"kind":"pull"}"#).unwrap();
        assert_eq!(src, ImageSource::Pull);
        let src: ImageSource = serde_json::from_str(
            r#"{"kind":"build","dockerfile":"Dockerfile.palworld","context_dir":"/project"}"#,
        )
        .unwrap();
        assert_eq!(
            src,
            ImageSource::Build {
                dockerfile: PathBuf::from("Dockerfile.palworld"),
                context_dir: PathBuf::from("/project"),
            }
        );
    }
}
