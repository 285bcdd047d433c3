//! Scripted in-memory runtime for tests.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    net::SocketAddr,
    sync::{
        Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use futures_util::StreamExt;
use tokio::{net::TcpListener, sync::mpsc};

use crate::{
    rcon::{
        Packet, SERVERDATA_AUTH, SERVERDATA_AUTH_RESPONSE, SERVERDATA_EXECCOMMAND,
        SERVERDATA_RESPONSE_VALUE, read_packet, write_packet,
    },
    runtime::{
        BuildSpec, ContainerDetails, ContainerRuntime, ContainerSpec, HostPort, LogOptions,
        LogStream, RawStats, RuntimeError,
    },
};

struct FakeContainer {
    spec: ContainerSpec,
    running: bool,
    created: String,
    started_at: Option<String>,
}

#[derive(Default)]
struct FakeState {
    images: HashSet<String>,
    containers: HashMap<String, FakeContainer>,
    next_id: u64,
    calls: HashMap<&'static str, usize>,
    failures: HashMap<&'static str, String>,
    log_senders: HashMap<String, Vec<mpsc::UnboundedSender<Result<String, RuntimeError>>>>,
    log_requests: Vec<(String, LogOptions)>,
    stats: Option<RawStats>,
    exec_output: String,
    exec_commands: Vec<Vec<String>>,
    build_delay: Option<Duration>,
    list_delay: Option<Duration>,
}

#[derive(Default)]
pub(crate) struct FakeRuntime {
    state: Mutex<FakeState>,
    stop_hangs: AtomicBool,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_image(self, image: &str) -> Self {
        self.state.lock().unwrap().images.insert(image.to_string());
        self
    }

    pub fn calls(&self, op: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .get(op)
            .copied()
            .unwrap_or(0)
    }

    /// Every subsequent `op` call fails with `message` until cleared.
    pub fn fail(&self, op: &'static str, message: &str) {
        self.state
            .lock()
            .unwrap()
            .failures
            .insert(op, message.to_string());
    }

    pub fn clear_failure(&self, op: &str) {
        self.state.lock().unwrap().failures.remove(op);
    }

    pub fn set_build_delay(&self, delay: Duration) {
        self.state.lock().unwrap().build_delay = Some(delay);
    }

    /// Delays `list_by_label` after the container set has been read.
    pub fn set_list_delay(&self, delay: Duration) {
        self.state.lock().unwrap().list_delay = Some(delay);
    }

    pub fn set_stop_hangs(&self, hangs: bool) {
        self.stop_hangs.store(hangs, Ordering::SeqCst);
    }

    pub fn set_stats(&self, stats: RawStats) {
        self.state.lock().unwrap().stats = Some(stats);
    }

    pub fn set_exec_output(&self, output: &str) {
        self.state.lock().unwrap().exec_output = output.to_string();
    }

    pub fn exec_commands(&self) -> Vec<Vec<String>> {
        self.state.lock().unwrap().exec_commands.clone()
    }

    pub fn has_image(&self, image: &str) -> bool {
        self.state.lock().unwrap().images.contains(image)
    }

    pub fn container_count(&self) -> usize {
        self.state.lock().unwrap().containers.len()
    }

    pub fn is_running(&self, handle: &str) -> Option<bool> {
        self.state
            .lock()
            .unwrap()
            .containers
            .get(handle)
            .map(|c| c.running)
    }

    pub fn spec_of(&self, handle: &str) -> Option<ContainerSpec> {
        self.state
            .lock()
            .unwrap()
            .containers
            .get(handle)
            .map(|c| c.spec.clone())
    }

    /// Container removed behind the orchestrator's back.
    pub fn vanish(&self, handle: &str) {
        let mut state = self.state.lock().unwrap();
        state.containers.remove(handle);
        state.log_senders.remove(handle);
    }

    /// Container flipped to stopped behind the orchestrator's back.
    pub fn crash(&self, handle: &str) {
        if let Some(c) = self.state.lock().unwrap().containers.get_mut(handle) {
            c.running = false;
        }
    }

    pub fn log_requests(&self, handle: &str) -> Vec<LogOptions> {
        self.state
            .lock()
            .unwrap()
            .log_requests
            .iter()
            .filter(|(h, _)| h == handle)
            .map(|(_, o)| *o)
            .collect()
    }

    /// Delivers `chunk` to every open log stream of `handle`.
    pub fn push_log(&self, handle: &str, chunk: &str) {
        let state = self.state.lock().unwrap();
        if let Some(senders) = state.log_senders.get(handle) {
            for tx in senders {
                let _ = tx.send(Ok(chunk.to_string()));
            }
        }
    }

    pub fn fail_logs(&self, handle: &str, message: &str) {
        let state = self.state.lock().unwrap();
        if let Some(senders) = state.log_senders.get(handle) {
            for tx in senders {
                let _ = tx.send(Err(RuntimeError::operation("logs", handle, message)));
            }
        }
    }

    fn record(&self, op: &'static str, target: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        *state.calls.entry(op).or_default() += 1;
        match state.failures.get(op) {
            Some(message) => Err(RuntimeError::operation(op, target, message.clone())),
            None => Ok(()),
        }
    }

    fn with_container<T>(
        &self,
        handle: &str,
        f: impl FnOnce(&mut FakeContainer) -> T,
    ) -> Result<T, RuntimeError> {
        let mut state = self.state.lock().unwrap();
        state
            .containers
            .get_mut(handle)
            .map(f)
            .ok_or_else(|| RuntimeError::NotFound {
                target: handle.to_string(),
            })
    }
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[async_trait::async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn image_exists(&self, image: &str) -> Result<bool, RuntimeError> {
        self.record("image_exists", image)?;
        Ok(self.has_image(image))
    }

    async fn build_image(&self, image: &str, _spec: &BuildSpec) -> Result<(), RuntimeError> {
        let delay = self.state.lock().unwrap().build_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.record("build_image", image).map_err(|e| RuntimeError::Build {
            image: image.to_string(),
            message: e.to_string(),
        })?;
        self.state.lock().unwrap().images.insert(image.to_string());
        Ok(())
    }

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        let delay = self.state.lock().unwrap().build_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.record("pull_image", image)?;
        self.state.lock().unwrap().images.insert(image.to_string());
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        self.record("create_container", &spec.name)?;
        let mut state = self.state.lock().unwrap();
        if state.containers.values().any(|c| c.spec.name == spec.name) {
            return Err(RuntimeError::operation(
                "create_container",
                &spec.name,
                "name already in use",
            ));
        }
        state.next_id += 1;
        let handle = format!("{:064x}", state.next_id);
        state.containers.insert(
            handle.clone(),
            FakeContainer {
                spec: spec.clone(),
                running: false,
                created: now_rfc3339(),
                started_at: None,
            },
        );
        Ok(handle)
    }

    async fn start_container(&self, handle: &str) -> Result<(), RuntimeError> {
        self.record("start_container", handle)?;
        self.with_container(handle, |c| {
            c.running = true;
            c.started_at = Some(now_rfc3339());
        })
    }

    async fn stop_container(&self, handle: &str, _grace: Duration) -> Result<(), RuntimeError> {
        self.record("stop_container", handle)?;
        if self.stop_hangs.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.with_container(handle, |c| c.running = false)
    }

    async fn restart_container(&self, handle: &str, _grace: Duration) -> Result<(), RuntimeError> {
        self.record("restart_container", handle)?;
        if self.stop_hangs.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.with_container(handle, |c| {
            c.running = true;
            c.started_at = Some(now_rfc3339());
        })
    }

    async fn kill_container(&self, handle: &str) -> Result<(), RuntimeError> {
        self.record("kill_container", handle)?;
        self.with_container(handle, |c| c.running = false)
    }

    async fn remove_container(&self, handle: &str, force: bool) -> Result<(), RuntimeError> {
        self.record("remove_container", handle)?;
        let mut state = self.state.lock().unwrap();
        match state.containers.get(handle) {
            None => Err(RuntimeError::NotFound {
                target: handle.to_string(),
            }),
            Some(c) if c.running && !force => Err(RuntimeError::operation(
                "remove_container",
                handle,
                "container is running",
            )),
            Some(_) => {
                state.containers.remove(handle);
                state.log_senders.remove(handle);
                Ok(())
            }
        }
    }

    fn logs(&self, handle: &str, options: LogOptions) -> LogStream {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.state.lock().unwrap();
            *state.calls.entry("logs").or_default() += 1;
            state.log_requests.push((handle.to_string(), options));
            state
                .log_senders
                .entry(handle.to_string())
                .or_default()
                .push(tx);
        }
        futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed()
    }

    async fn stats(&self, handle: &str) -> Result<RawStats, RuntimeError> {
        self.record("stats", handle)?;
        self.with_container(handle, |_| ())?;
        Ok(self.state.lock().unwrap().stats.clone().unwrap_or_default())
    }

    async fn exec(&self, handle: &str, cmd: Vec<String>) -> Result<String, RuntimeError> {
        self.record("exec", handle)?;
        self.with_container(handle, |_| ())?;
        let mut state = self.state.lock().unwrap();
        state.exec_commands.push(cmd);
        Ok(state.exec_output.clone())
    }

    async fn list_by_label(&self, label: &str) -> Result<Vec<String>, RuntimeError> {
        self.record("list_by_label", label)?;
        let (key, value) = label.split_once('=').unwrap_or((label, ""));
        let (mut handles, delay) = {
            let state = self.state.lock().unwrap();
            let handles: Vec<String> = state
                .containers
                .iter()
                .filter(|(_, c)| c.spec.labels.get(key).map(String::as_str) == Some(value))
                .map(|(h, _)| h.clone())
                .collect();
            (handles, state.list_delay)
        };
        handles.sort();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(handles)
    }

    async fn inspect(&self, handle: &str) -> Result<ContainerDetails, RuntimeError> {
        self.record("inspect", handle)?;
        self.with_container(handle, |c| {
            let ports: BTreeMap<String, Vec<HostPort>> = c
                .spec
                .ports
                .iter()
                .map(|p| {
                    (
                        p.key(),
                        vec![HostPort {
                            host_ip: Some(p.host_ip.clone()),
                            host_port: Some(p.host_port.to_string()),
                        }],
                    )
                })
                .collect();
            ContainerDetails {
                id: handle.to_string(),
                name: c.spec.name.clone(),
                running: c.running,
                status: if c.running { "running" } else { "exited" }.to_string(),
                labels: c.spec.labels.clone(),
                ports,
                created: Some(c.created.clone()),
                started_at: c.started_at.clone(),
            }
        })
    }
}

/// Accepts one RCON connection and answers like a game server would; exec replies echo the
/// command unless `reply_to_exec` is false.
pub(crate) async fn fake_rcon_server(password: &'static str, reply_to_exec: bool) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        while let Ok(packet) = read_packet(&mut stream).await {
            match packet.kind {
                SERVERDATA_AUTH => {
                    let id = if packet.body == password { packet.id } else { -1 };
                    let ack = Packet::new(packet.id, SERVERDATA_RESPONSE_VALUE, "");
                    write_packet(&mut stream, &ack).await.unwrap();
                    let auth = Packet::new(id, SERVERDATA_AUTH_RESPONSE, "");
                    write_packet(&mut stream, &auth).await.unwrap();
                }
                SERVERDATA_EXECCOMMAND if reply_to_exec => {
                    let reply = Packet::new(
                        packet.id,
                        SERVERDATA_RESPONSE_VALUE,
                        format!("echo: {}", packet.body),
                    );
                    write_packet(&mut stream, &reply).await.unwrap();
                }
                _ => {}
            }
        }
    });
    addr
}
