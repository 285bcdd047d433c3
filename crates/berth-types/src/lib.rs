use std::{collections::BTreeMap, fmt};

use chrono::{DateTime, Utc};

pub const DEFAULT_GAME_PORT: u16 = 8211;
pub const DEFAULT_MAX_PLAYERS: u32 = 32;

/// Logical server identity, stable across container re-creation.
///
/// Used verbatim inside container names and labels, so only `[A-Za-z0-9_-]` is accepted.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServerId(String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidServerId(pub String);

impl fmt::Display for InvalidServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid server id: {:?}", self.0)
    }
}

impl std::error::Error for InvalidServerId {}

impl ServerId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn parse(raw: &str) -> Result<Self, InvalidServerId> {
        let id = raw.trim();
        let ok = !id.is_empty()
            && id.len() <= 64
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'));
        if !ok {
            return Err(InvalidServerId(raw.to_string()));
        }
        Ok(Self(id.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ServerId {
    type Error = InvalidServerId;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::parse(&raw)
    }
}

impl From<ServerId> for String {
    fn from(id: ServerId) -> Self {
        id.0
    }
}

impl Default for ServerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Difficulty {
    None,
    #[default]
    Normal,
    Difficult,
}

impl fmt::Display for Difficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Difficulty::None => "None",
            Difficulty::Normal => "Normal",
            Difficulty::Difficult => "Difficult",
        };
        f.write_str(s)
    }
}

fn default_port() -> u16 {
    DEFAULT_GAME_PORT
}

/// Per-server settings handed to the orchestrator on create.
///
/// Optional fields fall back to the documented defaults through the accessor methods, so a
/// config round-tripped through a container label keeps the caller's original intent.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ServerConfig {
    pub name: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_players: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub difficulty: Option<Difficulty>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_password: Option<String>,
    /// Host port (bound on 127.0.0.1) for the workload's RCON endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rcon_port: Option<u16>,
    /// Overrides the orchestrator's default image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

impl ServerConfig {
    pub fn new(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            port,
            max_players: None,
            difficulty: None,
            password: None,
            admin_password: None,
            rcon_port: None,
            image: None,
        }
    }

    pub fn max_players(&self) -> u32 {
        self.max_players.unwrap_or(DEFAULT_MAX_PLAYERS)
    }

    pub fn difficulty(&self) -> Difficulty {
        self.difficulty.unwrap_or_default()
    }

    /// RCON is usable only when both an admin password and a host port are configured.
    pub fn rcon_endpoint(&self) -> Option<(u16, &str)> {
        let port = self.rcon_port?;
        let password = self.admin_password.as_deref().filter(|p| !p.is_empty())?;
        Some((port, password))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    Created,
    Running,
    Stopped,
}

impl ServerState {
    pub fn is_running(self) -> bool {
        matches!(self, ServerState::Running)
    }
}

/// What the external store persists for a server.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ServerRecord {
    pub server_id: ServerId,
    pub container_ref: Option<String>,
    pub config: ServerConfig,
    pub running: bool,
    /// Set when the record was kept although no container could be provisioned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub degraded: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ServerSummary {
    pub server_id: ServerId,
    pub container_id: String,
    pub container_name: String,
    pub state: ServerState,
    pub started_at: DateTime<Utc>,
    pub config: Option<ServerConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct HostBinding {
    pub host_ip: Option<String>,
    pub host_port: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ContainerInfo {
    /// Short (12 char) runtime id.
    pub id: String,
    pub name: String,
    pub state: ServerState,
    pub status: String,
    pub uptime_secs: u64,
    pub ports: BTreeMap<String, Vec<HostBinding>>,
    pub created: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct StatsSnapshot {
    pub cpu_percent: f64,
    pub memory_used_mb: u64,
    pub memory_limit_mb: u64,
    pub memory_percent: f64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleKind {
    Created,
    Started,
    Stopped,
    Restarted,
    Deleted,
}

impl LifecycleKind {
    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleKind::Created => "created",
            LifecycleKind::Started => "started",
            LifecycleKind::Stopped => "stopped",
            LifecycleKind::Restarted => "restarted",
            LifecycleKind::Deleted => "deleted",
        }
    }
}

/// Everything the orchestrator pushes outward.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Lifecycle {
        server_id: ServerId,
        kind: LifecycleKind,
    },
    Log {
        server_id: ServerId,
        message: String,
    },
    Console {
        server_id: ServerId,
        command: String,
        output: String,
    },
    Stats {
        server_id: ServerId,
        stats: StatsSnapshot,
    },
}

impl ServerEvent {
    pub fn server_id(&self) -> &ServerId {
        match self {
            ServerEvent::Lifecycle { server_id, .. }
            | ServerEvent::Log { server_id, .. }
            | ServerEvent::Console { server_id, .. }
            | ServerEvent::Stats { server_id, .. } => server_id,
        }
    }

    /// Channel name, e.g. `server:alpha:log`.
    pub fn topic(&self) -> String {
        let suffix = match self {
            ServerEvent::Lifecycle { kind, .. } => kind.as_str(),
            ServerEvent::Log { .. } => "log",
            ServerEvent::Console { .. } => "console",
            ServerEvent::Stats { .. } => "stats",
        };
        format!("server:{}:{}", self.server_id(), suffix)
    }
}
