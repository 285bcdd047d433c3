//! Docker adapter for [`ContainerRuntime`].
//!
//! Container and image calls go through bollard on the local socket. Builds shell out to the
//! `docker build` CLI so build-context handling (ignore files, buildkit) matches what operators get
//! on the command line.

use std::{
    collections::{HashMap, VecDeque},
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use bollard::{
    API_DEFAULT_VERSION, Docker,
    errors::Error as BollardError,
    exec::{CreateExecOptions, StartExecOptions, StartExecResults},
    models::{ContainerCreateBody, HostConfig, PortBinding, RestartPolicy, RestartPolicyNameEnum},
    query_parameters::{
        CreateContainerOptionsBuilder, CreateImageOptionsBuilder, InspectContainerOptions,
        KillContainerOptionsBuilder, ListContainersOptionsBuilder, LogsOptionsBuilder,
        RemoveContainerOptionsBuilder, RestartContainerOptionsBuilder, StartContainerOptions,
        StatsOptionsBuilder, StopContainerOptionsBuilder,
    },
};
use futures_util::StreamExt;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::Command,
    sync::mpsc,
};

use crate::runtime::{
    BuildSpec, ContainerDetails, ContainerRuntime, ContainerSpec, HostPort, LogOptions, LogStream,
    NetworkCounters, RawStats, RuntimeError,
};

const DEFAULT_DOCKER_TIMEOUT_SECS: u64 = 120;
const BUILD_ERROR_TAIL_LINES: usize = 20;
const LOG_CHANNEL_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
    cli: PathBuf,
}

impl DockerRuntime {
    /// Connects to `socket` (a unix socket path) or the local defaults (`DOCKER_HOST`, then
    /// `/var/run/docker.sock`).
    pub fn connect(socket: Option<&Path>) -> Result<Self, RuntimeError> {
        let docker = match socket {
            Some(path) => Docker::connect_with_socket(
                &path.to_string_lossy(),
                DEFAULT_DOCKER_TIMEOUT_SECS,
                API_DEFAULT_VERSION,
            ),
            None => Docker::connect_with_local_defaults(),
        }
        .map_err(|e| RuntimeError::Connect(e.to_string()))?;

        Ok(Self {
            docker,
            cli: PathBuf::from("docker"),
        })
    }

    /// Overrides the CLI binary used for builds.
    pub fn with_cli(mut self, cli: impl Into<PathBuf>) -> Self {
        self.cli = cli.into();
        self
    }

    pub async fn ping(&self) -> Result<(), RuntimeError> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| RuntimeError::Connect(e.to_string()))
    }
}

fn map_err(operation: &'static str, target: &str, err: BollardError) -> RuntimeError {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 404, ..
        } => RuntimeError::NotFound {
            target: target.to_string(),
        },
        other => RuntimeError::operation(operation, target, other.to_string()),
    }
}

/// `304 Not Modified` means the container is already in the requested state.
fn is_not_modified(err: &BollardError) -> bool {
    matches!(
        err,
        BollardError::DockerResponseServerError {
            status_code: 304,
            ..
        }
    )
}

fn to_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

fn grace_secs(grace: Duration) -> i32 {
    i32::try_from(grace.as_secs().max(1)).unwrap_or(i32::MAX)
}

/// Splits `repo[:tag]` (registry ports are not tags), defaulting the tag to `latest`.
fn split_image_ref(image: &str) -> (&str, &str) {
    let name_start = image.rfind('/').map(|i| i + 1).unwrap_or(0);
    match image[name_start..].rfind(':') {
        Some(i) => {
            let split = name_start + i;
            (&image[..split], &image[split + 1..])
        }
        None => (image, "latest"),
    }
}

async fn pump_build_output<R>(reader: Option<R>, image: String) -> VecDeque<String>
where
    R: AsyncRead + Unpin,
{
    let mut tail = VecDeque::with_capacity(BUILD_ERROR_TAIL_LINES);
    let Some(reader) = reader else {
        return tail;
    };
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim_end().to_string();
        if line.is_empty() {
            continue;
        }
        tracing::info!(image = %image, "{line}");
        if tail.len() == BUILD_ERROR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    tail
}

#[async_trait::async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn image_exists(&self, image: &str) -> Result<bool, RuntimeError> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(map_err("inspect_image", image, e)),
        }
    }

    async fn build_image(&self, image: &str, spec: &BuildSpec) -> Result<(), RuntimeError> {
        let dockerfile = spec.context_dir.join(&spec.dockerfile);
        if tokio::fs::metadata(&dockerfile).await.is_err() {
            return Err(RuntimeError::Build {
                image: image.to_string(),
                message: format!("Dockerfile not found: {}", dockerfile.display()),
            });
        }

        tracing::info!(
            image,
            dockerfile = %dockerfile.display(),
            context = %spec.context_dir.display(),
            "building image"
        );

        let mut child = Command::new(&self.cli)
            .arg("build")
            .arg("-f")
            .arg(&dockerfile)
            .arg("-t")
            .arg(image)
            .arg(&spec.context_dir)
            .current_dir(&spec.context_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RuntimeError::Build {
                image: image.to_string(),
                message: format!("spawn {}: {e}", self.cli.display()),
            })?;

        let stdout = tokio::spawn(pump_build_output(child.stdout.take(), image.to_string()));
        let stderr = tokio::spawn(pump_build_output(child.stderr.take(), image.to_string()));

        let status = child.wait().await.map_err(|e| RuntimeError::Build {
            image: image.to_string(),
            message: format!("wait for docker build: {e}"),
        })?;
        let _ = stdout.await;
        let stderr_tail = stderr.await.unwrap_or_default();

        if !status.success() {
            let tail = stderr_tail.into_iter().collect::<Vec<_>>().join("\n");
            return Err(RuntimeError::Build {
                image: image.to_string(),
                message: if tail.is_empty() {
                    format!("docker build exited with {status}")
                } else {
                    format!("docker build exited with {status}: {tail}")
                },
            });
        }
        Ok(())
    }

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        let (repo, tag) = split_image_ref(image);
        let options = CreateImageOptionsBuilder::new()
            .from_image(repo)
            .tag(tag)
            .build();

        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(item) = stream.next().await {
            let info = item.map_err(|e| map_err("create_image", image, e))?;
            if let Some(status) = info.status {
                tracing::info!(image, %status, "pull progress");
            }
        }
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let port_bindings: HashMap<String, Option<Vec<PortBinding>>> = spec
            .ports
            .iter()
            .map(|p| {
                (
                    p.key(),
                    Some(vec![PortBinding {
                        host_ip: Some(p.host_ip.clone()),
                        host_port: Some(p.host_port.to_string()),
                    }]),
                )
            })
            .collect();

        let body = ContainerCreateBody {
            image: Some(spec.image.clone()),
            hostname: Some(spec.name.clone()),
            env: Some(spec.env.clone()),
            labels: Some(spec.labels.clone()),
            host_config: Some(HostConfig {
                port_bindings: Some(port_bindings),
                memory: Some(to_i64(spec.memory_bytes)),
                memory_swap: Some(to_i64(spec.memory_bytes)),
                cpu_shares: Some(to_i64(spec.cpu_shares)),
                restart_policy: Some(RestartPolicy {
                    name: Some(RestartPolicyNameEnum::ON_FAILURE),
                    maximum_retry_count: Some(i64::from(spec.restart_max_retries)),
                }),
                ..HostConfig::default()
            }),
            ..ContainerCreateBody::default()
        };

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptionsBuilder::new().name(&spec.name).build()),
                body,
            )
            .await
            .map_err(|e| map_err("create_container", &spec.name, e))?;

        for warning in &created.warnings {
            tracing::warn!(container = %spec.name, %warning, "runtime warning on create");
        }
        Ok(created.id)
    }

    async fn start_container(&self, handle: &str) -> Result<(), RuntimeError> {
        match self
            .docker
            .start_container(handle, None::<StartContainerOptions>)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_not_modified(&e) => Ok(()),
            Err(e) => Err(map_err("start_container", handle, e)),
        }
    }

    async fn stop_container(&self, handle: &str, grace: Duration) -> Result<(), RuntimeError> {
        let options = StopContainerOptionsBuilder::new().t(grace_secs(grace)).build();
        match self.docker.stop_container(handle, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_modified(&e) => Ok(()),
            Err(e) => Err(map_err("stop_container", handle, e)),
        }
    }

    async fn restart_container(&self, handle: &str, grace: Duration) -> Result<(), RuntimeError> {
        let options = RestartContainerOptionsBuilder::new()
            .t(grace_secs(grace))
            .build();
        self.docker
            .restart_container(handle, Some(options))
            .await
            .map_err(|e| map_err("restart_container", handle, e))
    }

    async fn kill_container(&self, handle: &str) -> Result<(), RuntimeError> {
        let options = KillContainerOptionsBuilder::new().signal("SIGKILL").build();
        self.docker
            .kill_container(handle, Some(options))
            .await
            .map_err(|e| map_err("kill_container", handle, e))
    }

    async fn remove_container(&self, handle: &str, force: bool) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptionsBuilder::new()
            .force(force)
            .v(false)
            .build();
        self.docker
            .remove_container(handle, Some(options))
            .await
            .map_err(|e| map_err("remove_container", handle, e))
    }

    fn logs(&self, handle: &str, options: LogOptions) -> LogStream {
        let docker = self.docker.clone();
        let handle = handle.to_string();
        let (tx, rx) = mpsc::channel::<Result<String, RuntimeError>>(LOG_CHANNEL_CAPACITY);

        // The bollard stream borrows the client; own both on a task and hand out the receiver.
        tokio::spawn(async move {
            let mut builder = LogsOptionsBuilder::new()
                .follow(options.follow)
                .stdout(true)
                .stderr(true)
                .timestamps(options.timestamps);
            if let Some(since) = options.since {
                builder = builder.since(i32::try_from(since).unwrap_or(i32::MAX));
            }
            if let Some(tail) = options.tail {
                builder = builder.tail(&tail.to_string());
            }

            let mut stream = docker.logs(&handle, Some(builder.build()));
            while let Some(item) = stream.next().await {
                let item = item
                    .map(|output| String::from_utf8_lossy(&output.into_bytes()).into_owned())
                    .map_err(|e| map_err("logs", &handle, e));
                if tx.send(item).await.is_err() {
                    break;
                }
            }
        });

        futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed()
    }

    async fn stats(&self, handle: &str) -> Result<RawStats, RuntimeError> {
        // `stream=false` waits for a second sample so precpu counters are populated.
        let options = StatsOptionsBuilder::new().stream(false).build();
        let mut stream = self.docker.stats(handle, Some(options));
        let stats = stream
            .next()
            .await
            .ok_or_else(|| RuntimeError::operation("stats", handle, "no stats returned"))?
            .map_err(|e| map_err("stats", handle, e))?;

        let cpu = stats.cpu_stats.as_ref();
        let pre = stats.precpu_stats.as_ref();
        let total_usage = |s: Option<&bollard::models::ContainerCpuStats>| {
            s.and_then(|c| c.cpu_usage.as_ref())
                .and_then(|u| u.total_usage)
                .unwrap_or(0)
        };
        let online_cpus = cpu
            .and_then(|c| c.online_cpus)
            .and_then(|n| u32::try_from(n).ok())
            .or_else(|| {
                cpu.and_then(|c| c.cpu_usage.as_ref())
                    .and_then(|u| u.percpu_usage.as_ref())
                    .and_then(|v| u32::try_from(v.len()).ok())
            })
            .unwrap_or(1);

        let networks = stats
            .networks
            .unwrap_or_default()
            .into_iter()
            .map(|(name, net)| {
                (
                    name,
                    NetworkCounters {
                        rx_bytes: net.rx_bytes.unwrap_or(0),
                        tx_bytes: net.tx_bytes.unwrap_or(0),
                    },
                )
            })
            .collect();

        Ok(RawStats {
            cpu_total_usage: total_usage(cpu),
            precpu_total_usage: total_usage(pre),
            system_cpu_usage: cpu.and_then(|c| c.system_cpu_usage).unwrap_or(0),
            presystem_cpu_usage: pre.and_then(|c| c.system_cpu_usage).unwrap_or(0),
            online_cpus,
            memory_usage: stats.memory_stats.as_ref().and_then(|m| m.usage).unwrap_or(0),
            memory_limit: stats.memory_stats.as_ref().and_then(|m| m.limit).unwrap_or(0),
            networks,
        })
    }

    async fn exec(&self, handle: &str, cmd: Vec<String>) -> Result<String, RuntimeError> {
        let created = self
            .docker
            .create_exec(
                handle,
                CreateExecOptions {
                    cmd: Some(cmd),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| map_err("create_exec", handle, e))?;

        let mut out = String::new();
        match self
            .docker
            .start_exec(&created.id, None::<StartExecOptions>)
            .await
            .map_err(|e| map_err("start_exec", handle, e))?
        {
            StartExecResults::Attached { mut output, .. } => {
                while let Some(chunk) = output.next().await {
                    let chunk = chunk.map_err(|e| map_err("exec_output", handle, e))?;
                    out.push_str(&chunk.to_string());
                }
            }
            StartExecResults::Detached => {}
        }
        Ok(out)
    }

    async fn list_by_label(&self, label: &str) -> Result<Vec<String>, RuntimeError> {
        let filters: HashMap<String, Vec<String>> =
            HashMap::from([("label".to_string(), vec![label.to_string()])]);
        let options = ListContainersOptionsBuilder::new()
            .all(true)
            .filters(&filters)
            .build();
        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| map_err("list_containers", label, e))?;
        Ok(containers.into_iter().filter_map(|c| c.id).collect())
    }

    async fn inspect(&self, handle: &str) -> Result<ContainerDetails, RuntimeError> {
        let info = self
            .docker
            .inspect_container(handle, None::<InspectContainerOptions>)
            .await
            .map_err(|e| map_err("inspect_container", handle, e))?;

        let state = info.state.as_ref();
        let ports = info
            .network_settings
            .as_ref()
            .and_then(|n| n.ports.clone())
            .unwrap_or_default()
            .into_iter()
            .map(|(key, bindings)| {
                let bindings = bindings
                    .unwrap_or_default()
                    .into_iter()
                    .map(|b| HostPort {
                        host_ip: b.host_ip,
                        host_port: b.host_port,
                    })
                    .collect();
                (key, bindings)
            })
            .collect();

        Ok(ContainerDetails {
            id: info.id.clone().unwrap_or_else(|| handle.to_string()),
            name: info
                .name
                .as_deref()
                .unwrap_or_default()
                .trim_start_matches('/')
                .to_string(),
            running: state.and_then(|s| s.running).unwrap_or(false),
            status: state
                .and_then(|s| s.status.as_ref())
                .map(|s| s.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
            labels: info
                .config
                .as_ref()
                .and_then(|c| c.labels.clone())
                .unwrap_or_default(),
            ports,
            created: info.created.clone(),
            started_at: state.and_then(|s| s.started_at.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::split_image_ref;

    #[test]
    fn image_ref_defaults_to_latest() {
        assert_eq!(split_image_ref("palworld-server"), ("palworld-server", "latest"));
        assert_eq!(
            split_image_ref("palworld-server:1.2"),
            ("palworld-server", "1.2")
        );
    }

    #[test]
    fn image_ref_ignores_registry_port() {
        assert_eq!(
            split_image_ref("registry.local:5000/game/palworld"),
            ("registry.local:5000/game/palworld", "latest")
        );
        assert_eq!(
            split_image_ref("registry.local:5000/game/palworld:v3"),
            ("registry.local:5000/game/palworld", "v3")
        );
    }
}
