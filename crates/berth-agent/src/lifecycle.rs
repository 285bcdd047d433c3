//! Server lifecycle: create, start, stop, restart, delete and startup reconciliation.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use berth_types::{
    ContainerInfo, HostBinding, LifecycleKind, ServerConfig, ServerEvent, ServerId, ServerRecord,
    ServerState, ServerSummary,
};
use chrono::{DateTime, Datelike, Utc};
use tokio::sync::OwnedMutexGuard;

use crate::{
    config::{ImageSource, OrchestratorConfig},
    error::{OrchestratorError, Result},
    events::EventSink,
    images::ImageProvisioner,
    logs::{LogAggregator, LogFrom},
    registry::{Registry, RegistryEntry},
    runtime::{ContainerRuntime, ContainerSpec, PortMapping, Protocol},
    support::{format_error_chain, short_id},
};

/// Extra time past the grace period before a stuck stop is escalated to a kill.
const STOP_DEADLINE_SLACK: Duration = Duration::from_secs(5);

/// What `create_record` does when the container could not be provisioned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreatePolicy {
    /// Keep a record without a container, flagged as degraded.
    #[default]
    KeepDegraded,
    /// Propagate the error; no record is produced.
    RollBack,
}

/// Owns the registry and drives containers through their lifecycle.
#[derive(Clone)]
pub struct Orchestrator {
    pub(crate) runtime: Arc<dyn ContainerRuntime>,
    pub(crate) events: Arc<dyn EventSink>,
    pub(crate) config: Arc<OrchestratorConfig>,
    pub(crate) images: ImageProvisioner,
    pub(crate) logs: LogAggregator,
    pub(crate) registry: Registry,
    op_locks: Arc<Mutex<HashMap<ServerId, Arc<tokio::sync::Mutex<()>>>>>,
}

impl Orchestrator {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        events: Arc<dyn EventSink>,
        config: OrchestratorConfig,
    ) -> Self {
        let config = config.normalized();
        Self {
            images: ImageProvisioner::new(runtime.clone()),
            logs: LogAggregator::new(runtime.clone(), events.clone(), config.log_capacity),
            registry: Registry::default(),
            op_locks: Arc::new(Mutex::new(HashMap::new())),
            config: Arc::new(config),
            runtime,
            events,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn logs(&self) -> &LogAggregator {
        &self.logs
    }

    pub fn images(&self) -> &ImageProvisioner {
        &self.images
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn list(&self) -> Vec<ServerSummary> {
        self.registry
            .snapshot()
            .iter()
            .map(RegistryEntry::summary)
            .collect()
    }

    pub fn get(&self, server_id: &ServerId) -> Option<ServerSummary> {
        self.registry.get(server_id).map(|e| e.summary())
    }

    /// Provisions the image, creates and starts the container, registers it and attaches logs.
    pub async fn create(&self, server_id: ServerId, config: ServerConfig) -> Result<ServerSummary> {
        let _guard = self.lock_server(&server_id).await;
        if self.registry.contains(&server_id) {
            return Err(OrchestratorError::AlreadyExists(server_id));
        }
        validate(&config)?;

        let (image, source) = self.image_for(&config);
        self.images.ensure_image(&image, &source).await?;

        let spec = self.container_spec(&server_id, &config, image)?;
        let handle = self.runtime.create_container(&spec).await?;
        tracing::info!(server_id = %server_id, container = %short_id(&handle), "container created");

        if let Err(e) = self.runtime.start_container(&handle).await {
            tracing::warn!(
                server_id = %server_id,
                error = %format_error_chain(&e),
                "start failed after create; removing container"
            );
            if let Err(rm) = self.runtime.remove_container(&handle, true).await {
                tracing::warn!(
                    server_id = %server_id,
                    error = %format_error_chain(&rm),
                    "failed to remove orphaned container"
                );
            }
            return Err(e.into());
        }

        let entry = RegistryEntry {
            server_id: server_id.clone(),
            handle: handle.clone(),
            container_name: spec.name,
            started_at: Utc::now(),
            config: Some(config),
            state: ServerState::Running,
        };
        let summary = entry.summary();
        self.registry.insert(entry);
        self.logs.attach(&server_id, &handle, LogFrom::Beginning);
        self.emit(&server_id, LifecycleKind::Created);
        tracing::info!(server_id = %server_id, "server started");
        Ok(summary)
    }

    /// `create` wrapped into the record the external store persists, applying `policy` to
    /// provisioning/runtime failures. Precondition errors always propagate.
    pub async fn create_record(
        &self,
        server_id: ServerId,
        config: ServerConfig,
        policy: CreatePolicy,
    ) -> Result<ServerRecord> {
        match self.create(server_id.clone(), config.clone()).await {
            Ok(summary) => Ok(ServerRecord {
                server_id,
                container_ref: Some(summary.container_id),
                config,
                running: true,
                degraded: None,
            }),
            Err(e) if e.is_precondition() => Err(e),
            Err(e) => match policy {
                CreatePolicy::RollBack => Err(e),
                CreatePolicy::KeepDegraded => {
                    let reason = format_error_chain(&e);
                    tracing::warn!(server_id = %server_id, error = %reason, "keeping degraded server record");
                    Ok(ServerRecord {
                        server_id,
                        container_ref: None,
                        config,
                        running: false,
                        degraded: Some(reason),
                    })
                }
            },
        }
    }

    pub async fn start(&self, server_id: &ServerId) -> Result<()> {
        let _guard = self.lock_server(server_id).await;
        let entry = self.entry(server_id)?;
        if entry.state.is_running() {
            return Err(OrchestratorError::AlreadyRunning(server_id.clone()));
        }

        self.runtime.start_container(&entry.handle).await?;
        self.registry.update(server_id, |e| {
            e.state = ServerState::Running;
            e.started_at = Utc::now();
        });
        self.logs.attach(server_id, &entry.handle, LogFrom::Now);
        self.emit(server_id, LifecycleKind::Started);
        tracing::info!(server_id = %server_id, "server started");
        Ok(())
    }

    pub async fn stop(&self, server_id: &ServerId) -> Result<()> {
        let _guard = self.lock_server(server_id).await;
        let entry = self.running_entry(server_id)?;
        let grace = self.config.stop_grace();

        match tokio::time::timeout(
            grace + STOP_DEADLINE_SLACK,
            self.runtime.stop_container(&entry.handle, grace),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                tracing::warn!(server_id = %server_id, ?grace, "stop exceeded deadline; killing");
                self.runtime.kill_container(&entry.handle).await?;
            }
        }

        self.registry
            .update(server_id, |e| e.state = ServerState::Stopped);
        self.logs.detach(server_id);
        self.emit(server_id, LifecycleKind::Stopped);
        tracing::info!(server_id = %server_id, "server stopped");
        Ok(())
    }

    pub async fn restart(&self, server_id: &ServerId) -> Result<()> {
        let _guard = self.lock_server(server_id).await;
        let entry = self.running_entry(server_id)?;
        let grace = self.config.restart_grace();

        match tokio::time::timeout(
            grace + STOP_DEADLINE_SLACK,
            self.runtime.restart_container(&entry.handle, grace),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                tracing::warn!(server_id = %server_id, ?grace, "restart exceeded deadline; killing");
                self.runtime.kill_container(&entry.handle).await?;
                self.runtime.start_container(&entry.handle).await?;
            }
        }

        self.registry.update(server_id, |e| {
            e.state = ServerState::Running;
            e.started_at = Utc::now();
        });
        self.logs.attach(server_id, &entry.handle, LogFrom::Now);
        self.emit(server_id, LifecycleKind::Restarted);
        tracing::info!(server_id = %server_id, "server restarted");
        Ok(())
    }

    /// Removes a stopped server. Runtime failures while removing are logged; local state is
    /// purged regardless.
    pub async fn delete(&self, server_id: &ServerId) -> Result<()> {
        let guard = self.lock_server(server_id).await;
        let entry = self.entry(server_id)?;
        if entry.state.is_running() {
            return Err(OrchestratorError::StillRunning(server_id.clone()));
        }

        self.logs.detach(server_id);
        if let Err(e) = self.runtime.remove_container(&entry.handle, true).await {
            tracing::warn!(
                server_id = %server_id,
                error = %format_error_chain(&e),
                "failed to remove container; purging local state anyway"
            );
        }
        self.registry.remove(server_id);
        self.logs.remove(server_id);
        self.emit(server_id, LifecycleKind::Deleted);
        tracing::info!(server_id = %server_id, "server deleted");

        drop(guard);
        self.op_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(server_id);
        Ok(())
    }

    /// Rebuilds the registry from containers carrying the ownership label. Idempotent.
    ///
    /// Entries are merged per server under the server's operation lock; an entry is dropped only
    /// if it was registered before the listing and its container is gone.
    pub async fn reconcile(&self) -> Result<usize> {
        let known: Vec<(ServerId, String)> = self
            .registry
            .snapshot()
            .into_iter()
            .map(|e| (e.server_id, e.handle))
            .collect();
        let handles = self
            .runtime
            .list_by_label(&self.config.ownership_filter())
            .await?;

        let server_label = self.config.server_id_label();
        let config_label = self.config.config_label();
        let mut found: HashMap<ServerId, RegistryEntry> = HashMap::new();

        for handle in handles {
            let details = match self.runtime.inspect(&handle).await {
                Ok(d) => d,
                Err(e) if e.is_not_found() => continue,
                Err(e) => {
                    tracing::warn!(container = %short_id(&handle), error = %format_error_chain(&e), "inspect failed during reconcile");
                    continue;
                }
            };

            let Some(server_id) = details
                .labels
                .get(&server_label)
                .and_then(|raw| ServerId::parse(raw).ok())
            else {
                tracing::warn!(container = %short_id(&handle), "managed container without a valid server id label");
                continue;
            };
            if found.contains_key(&server_id) {
                tracing::warn!(server_id = %server_id, container = %short_id(&handle), "duplicate container for server; ignoring");
                continue;
            }

            let config = details
                .labels
                .get(&config_label)
                .and_then(|raw| serde_json::from_str::<ServerConfig>(raw).ok());
            let started = parse_runtime_time(details.started_at.as_deref());
            let state = if details.running {
                ServerState::Running
            } else if started.is_some() {
                ServerState::Stopped
            } else {
                ServerState::Created
            };
            let started_at = started
                .or_else(|| parse_runtime_time(details.created.as_deref()))
                .unwrap_or_else(Utc::now);

            found.insert(
                server_id.clone(),
                RegistryEntry {
                    server_id,
                    handle: details.id,
                    container_name: details.name,
                    started_at,
                    config,
                    state,
                },
            );
        }

        let count = found.len();
        for (server_id, handle) in known {
            if found.contains_key(&server_id) {
                continue;
            }
            let _guard = self.lock_server(&server_id).await;
            if self.registry.remove_if_handle(&server_id, &handle) {
                tracing::info!(server_id = %server_id, "container vanished; dropping registry entry");
                self.logs.detach(&server_id);
            }
        }
        for (server_id, entry) in found {
            let _guard = self.lock_server(&server_id).await;
            if self
                .registry
                .get(&server_id)
                .is_some_and(|current| current.handle != entry.handle)
            {
                continue;
            }
            let handle = entry.handle.clone();
            let running = entry.state.is_running();
            self.registry.insert(entry);
            if running && !self.logs.is_attached(&server_id) {
                self.logs
                    .attach(&server_id, &handle, LogFrom::Tail(self.config.log_capacity));
            }
        }

        tracing::info!(servers = count, "registry reconciled");
        Ok(count)
    }

    /// Inspects the container and syncs the registry state with what the runtime reports.
    pub async fn status(&self, server_id: &ServerId) -> Result<ContainerInfo> {
        let _guard = self.lock_server(server_id).await;
        let entry = self.entry(server_id)?;
        let details = self.runtime.inspect(&entry.handle).await?;

        let state = if details.running {
            ServerState::Running
        } else if entry.state == ServerState::Created {
            ServerState::Created
        } else {
            ServerState::Stopped
        };
        if state != entry.state {
            tracing::info!(server_id = %server_id, from = ?entry.state, to = ?state, "state drifted; syncing");
            self.registry.update(server_id, |e| e.state = state);
            if !state.is_running() {
                self.logs.detach(server_id);
            }
        }

        let uptime_secs = match (state.is_running(), parse_runtime_time(details.started_at.as_deref())) {
            (true, Some(started)) => u64::try_from((Utc::now() - started).num_seconds()).unwrap_or(0),
            _ => 0,
        };
        let ports = details
            .ports
            .into_iter()
            .map(|(key, bindings)| {
                let bindings = bindings
                    .into_iter()
                    .map(|b| HostBinding {
                        host_ip: b.host_ip,
                        host_port: b.host_port,
                    })
                    .collect();
                (key, bindings)
            })
            .collect();

        Ok(ContainerInfo {
            id: short_id(&details.id),
            name: details.name,
            state,
            status: details.status,
            uptime_secs,
            ports,
            created: details.created,
        })
    }

    /// Detaches every log stream.
    pub fn shutdown(&self) {
        self.logs.detach_all();
        tracing::info!("orchestrator shut down");
    }

    pub(crate) fn entry(&self, server_id: &ServerId) -> Result<RegistryEntry> {
        self.registry
            .get(server_id)
            .ok_or_else(|| OrchestratorError::NotFound(server_id.clone()))
    }

    pub(crate) fn running_entry(&self, server_id: &ServerId) -> Result<RegistryEntry> {
        let entry = self.entry(server_id)?;
        if !entry.state.is_running() {
            return Err(OrchestratorError::NotRunning(server_id.clone()));
        }
        Ok(entry)
    }

    pub(crate) async fn lock_server(&self, server_id: &ServerId) -> OwnedMutexGuard<()> {
        let lock = self
            .op_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(server_id.clone())
            .or_default()
            .clone();
        lock.lock_owned().await
    }

    fn emit(&self, server_id: &ServerId, kind: LifecycleKind) {
        self.events.publish(&ServerEvent::Lifecycle {
            server_id: server_id.clone(),
            kind,
        });
    }

    /// Per-server image overrides are pulled; the default image uses the configured source.
    fn image_for(&self, config: &ServerConfig) -> (String, ImageSource) {
        match config.image.as_deref().map(str::trim) {
            Some(image) if !image.is_empty() && image != self.config.image.name => {
                (image.to_string(), ImageSource::Pull)
            }
            _ => (
                self.config.image.name.clone(),
                self.config.image.source.clone(),
            ),
        }
    }

    fn container_spec(
        &self,
        server_id: &ServerId,
        config: &ServerConfig,
        image: String,
    ) -> Result<ContainerSpec> {
        let rcon_container_port = self.config.rcon.container_port;
        let env = vec![
            format!("SERVER_NAME={}", config.name.trim()),
            format!("PORT={}", config.port),
            format!("MAX_PLAYERS={}", config.max_players()),
            format!("DIFFICULTY={}", config.difficulty()),
            format!("SERVER_ID={server_id}"),
            format!(
                "SERVER_PASSWORD={}",
                config.password.as_deref().unwrap_or_default()
            ),
            format!(
                "ADMIN_PASSWORD={}",
                config.admin_password.as_deref().unwrap_or_default()
            ),
            format!("RCON_ENABLED={}", config.rcon_endpoint().is_some()),
            format!("RCON_PORT={rcon_container_port}"),
        ];

        let config_json = serde_json::to_string(config)
            .map_err(|e| OrchestratorError::InvalidConfig(e.to_string()))?;
        let labels = HashMap::from([
            (self.config.managed_label(), "true".to_string()),
            (self.config.server_id_label(), server_id.to_string()),
            (self.config.config_label(), config_json),
        ]);

        let mut ports = vec![PortMapping {
            container_port: config.port,
            protocol: Protocol::Udp,
            host_ip: "0.0.0.0".to_string(),
            host_port: config.port,
        }];
        if let Some(rcon_port) = config.rcon_port {
            ports.push(PortMapping {
                container_port: rcon_container_port,
                protocol: Protocol::Tcp,
                host_ip: "127.0.0.1".to_string(),
                host_port: rcon_port,
            });
        }

        Ok(ContainerSpec {
            name: format!("{}{}", self.config.container_prefix, server_id),
            image,
            env,
            labels,
            ports,
            memory_bytes: self.config.resources.memory_bytes,
            cpu_shares: self.config.resources.cpu_shares,
            restart_max_retries: self.config.resources.restart_max_retries,
        })
    }
}

fn validate(config: &ServerConfig) -> Result<()> {
    let invalid = |msg: String| Err(OrchestratorError::InvalidConfig(msg));
    let name = config.name.trim();
    if name.is_empty() {
        return invalid("name must not be empty".to_string());
    }
    if name.chars().count() > 64 {
        return invalid("name must be at most 64 characters".to_string());
    }
    if config.port < 1024 {
        return invalid(format!("port {} is below 1024", config.port));
    }
    if let Some(max) = config.max_players
        && !(1..=128).contains(&max)
    {
        return invalid(format!("max_players {max} is outside 1..=128"));
    }
    if let Some(rcon_port) = config.rcon_port
        && rcon_port < 1024
    {
        return invalid(format!("rcon_port {rcon_port} is below 1024"));
    }
    Ok(())
}

/// Parses runtime RFC 3339 timestamps; the zero time means "never".
fn parse_runtime_time(raw: Option<&str>) -> Option<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(raw?).ok()?.with_timezone(&Utc);
    (parsed.year() > 1).then_some(parsed)
}
