use std::sync::Arc;

use anyhow::Context;
use berth_agent::{DockerRuntime, Orchestrator, StatsBroadcaster, format_error_chain};
use berth_control::{config::PanelConfig, hub::SubscriptionHub, routes, state::AppState};
use tokio::sync::watch;

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = PanelConfig::load().context("load configuration")?;

    let runtime = DockerRuntime::connect(config.docker_socket.as_deref())
        .context("connect to docker")?;
    runtime.ping().await.context("docker daemon is not reachable")?;

    let hub = SubscriptionHub::new();
    let orchestrator = Orchestrator::new(
        Arc::new(runtime),
        Arc::new(hub.clone()),
        config.orchestrator.clone(),
    );

    match orchestrator.reconcile().await {
        Ok(servers) => tracing::info!(servers, "recovered managed containers"),
        Err(e) => tracing::warn!(error = %format_error_chain(&e), "reconcile failed; starting empty"),
    }

    let stats = StatsBroadcaster::new(
        orchestrator.clone(),
        Arc::new(hub.clone()),
        config.stats_interval(),
    )
    .spawn();

    let app = routes::router(AppState {
        orchestrator: orchestrator.clone(),
        hub: hub.clone(),
        create_policy: config.create_policy,
    });

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("bind {}", config.listen_addr))?;
    tracing::info!(addr = %config.listen_addr, "berth-control HTTP listening");

    let (stop_tx, mut stop_rx) = watch::channel(false);
    let mut server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = stop_rx.changed().await;
            })
            .await
    });

    tokio::select! {
        _ = shutdown_signal() => tracing::info!("shutdown requested"),
        res = &mut server => {
            stats.stop().await;
            orchestrator.shutdown();
            return match res {
                Ok(res) => res.context("http server failed"),
                Err(e) => Err(e).context("http server task failed"),
            };
        }
    }

    let grace = config.shutdown_grace();
    let drain = async {
        stats.stop().await;
        orchestrator.shutdown();
        hub.close_all();
        let _ = stop_tx.send(true);
        server.await
    };

    match tokio::time::timeout(grace, drain).await {
        Ok(Ok(Ok(()))) => tracing::info!("shut down cleanly"),
        Ok(Ok(Err(e))) => tracing::warn!(error = %e, "http server error during shutdown"),
        Ok(Err(e)) => tracing::warn!(error = %e, "http server task failed during shutdown"),
        Err(_) => tracing::warn!(?grace, "shutdown grace elapsed; exiting"),
    }
    Ok(())
}
