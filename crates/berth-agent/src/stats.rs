//! Resource sampling and the periodic stats broadcast.

use std::{sync::Arc, time::Duration};

use berth_types::{ServerEvent, ServerId, StatsSnapshot};
use futures_util::future::join_all;
use tokio::{sync::watch, task::JoinHandle, time::MissedTickBehavior};

use crate::{
    events::SubscriptionSource,
    lifecycle::Orchestrator,
    runtime::RawStats,
    support::{format_error_chain, round2},
};

pub const DEFAULT_STATS_INTERVAL: Duration = Duration::from_secs(2);

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Derives percentages from raw runtime counters.
pub fn compute(raw: &RawStats, interface: &str) -> StatsSnapshot {
    let cpu_delta = raw.cpu_total_usage as f64 - raw.precpu_total_usage as f64;
    let system_delta = raw.system_cpu_usage as f64 - raw.presystem_cpu_usage as f64;
    let cpu_percent = if system_delta > 0.0 && cpu_delta > 0.0 {
        round2(cpu_delta / system_delta * f64::from(raw.online_cpus) * 100.0)
    } else {
        0.0
    };

    let memory_percent = if raw.memory_limit == 0 {
        0.0
    } else {
        round2(raw.memory_usage as f64 / raw.memory_limit as f64 * 100.0)
    };

    let net = raw.networks.get(interface).copied().unwrap_or_default();

    StatsSnapshot {
        cpu_percent,
        memory_used_mb: (raw.memory_usage as f64 / BYTES_PER_MB).round() as u64,
        memory_limit_mb: (raw.memory_limit as f64 / BYTES_PER_MB).round() as u64,
        memory_percent,
        rx_bytes: net.rx_bytes,
        tx_bytes: net.tx_bytes,
    }
}

impl Orchestrator {
    /// `None` for unregistered or stopped servers and when the runtime call fails.
    pub async fn sample(&self, server_id: &ServerId) -> Option<StatsSnapshot> {
        let entry = self.registry.get(server_id)?;
        if !entry.state.is_running() {
            return None;
        }
        match self.runtime.stats(&entry.handle).await {
            Ok(raw) => Some(compute(&raw, &self.config.primary_interface)),
            Err(e) => {
                tracing::warn!(server_id = %server_id, error = %format_error_chain(&e), "stats sample failed");
                None
            }
        }
    }
}

/// Samples every subscribed server on a fixed interval and publishes the results.
pub struct StatsBroadcaster {
    orchestrator: Orchestrator,
    subscriptions: Arc<dyn SubscriptionSource>,
    interval: Duration,
}

impl StatsBroadcaster {
    pub fn new(
        orchestrator: Orchestrator,
        subscriptions: Arc<dyn SubscriptionSource>,
        interval: Duration,
    ) -> Self {
        Self {
            orchestrator,
            subscriptions,
            interval: interval.max(Duration::from_millis(1)),
        }
    }

    /// One sampling round; returns how many snapshots were published.
    pub async fn tick(&self) -> usize {
        let ids = self.subscriptions.subscribed();
        if ids.is_empty() {
            return 0;
        }

        let samples = join_all(ids.into_iter().map(|id| async move {
            let stats = self.orchestrator.sample(&id).await;
            (id, stats)
        }))
        .await;

        let mut published = 0;
        for (server_id, stats) in samples {
            if let Some(stats) = stats {
                self.orchestrator
                    .events
                    .publish(&ServerEvent::Stats { server_id, stats });
                published += 1;
            }
        }
        published
    }

    pub fn spawn(self) -> StatsHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            tracing::info!(interval_ms = self.interval.as_millis() as u64, "stats broadcaster started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let published = self.tick().await;
                        tracing::trace!(published, "stats tick");
                    }
                    _ = stop_rx.changed() => break,
                }
            }
            tracing::info!("stats broadcaster stopped");
        });
        StatsHandle { stop_tx, task }
    }
}

pub struct StatsHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl StatsHandle {
    /// Ends the timer and waits for the loop to exit.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        let _ = self.task.await;
    }
}
