use crate::state::{AppContext, ConfigState};
use anyhow::Context;
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod admission;
mod config;
mod controller;
mod image_reference;
mod mutation;
mod policy;
mod registry_map;
mod snapshot;
mod state;
mod webserver;

#[cfg(target_env = "musl")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    info!("Starting registry-proxy {}", env!("CARGO_PKG_VERSION"));

    let settings = config::load_settings(config::settings_path())?;
    let client = controller::create_client().await?;
    let state = ConfigState::default();

    match controller::ensure_config_map(&client, &settings.config_map).await {
        Ok(payload) => {
            if let Err(err) = state.apply(payload.as_deref()) {
                warn!("Continuing with built-in registry proxy config: {}", err);
            }
        }
        Err(err) => warn!("Continuing with built-in registry proxy config: {:?}", err),
    }

    let token = CancellationToken::new();
    let (events_tx, events_rx) = mpsc::channel(16);
    let manager = tokio::spawn(controller::run_config_manager(state.clone(), events_rx));
    let config_watch = tokio::spawn(controller::watch_config_map(
        client.clone(),
        settings.config_map.clone(),
        events_tx,
        token.clone(),
    ));

    let (namespaces, namespace_watch) = controller::namespace_reflector(client.clone());
    let namespace_token = token.clone();
    let namespace_watch = tokio::spawn(async move {
        tokio::select! {
            _ = namespace_watch => {}
            _ = namespace_token.cancelled() => {}
        }
    });

    let ctx = AppContext::new(state, namespaces);
    let namespaces_ready = tokio::spawn({
        let ctx = ctx.clone();
        let token = token.clone();
        async move {
            tokio::select! {
                _ = ctx.wait_for_namespaces() => {}
                _ = token.cancelled() => {}
            }
        }
    });

    let app = webserver::create_app(ctx);
    let addr = SocketAddr::new(settings.webserver.address, settings.webserver.port);
    info!("Starting admission webserver on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind webserver to {}", addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(token.clone()))
        .await?;

    token.cancel();
    // the manager drains once the watch drops its sender
    join_tasks(vec![
        ("ConfigMap watch", config_watch),
        ("namespace watch", namespace_watch),
        ("namespace readiness", namespaces_ready),
        ("config manager", manager),
    ])
    .await;
    info!("registry-proxy stopped");

    Ok(())
}

/// Waits for every task in order and returns how many of them failed.
async fn join_tasks(tasks: Vec<(&'static str, JoinHandle<()>)>) -> usize {
    let mut failed = 0;
    for (name, task) in tasks {
        if let Err(err) = task.await {
            warn!("Task {} did not finish cleanly: {}", name, err);
            failed += 1;
        }
    }
    failed
}

async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!("Failed to listen for SIGTERM: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
        _ = token.cancelled() => {}
    }
    info!("Shutdown signal received");
    token.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_join_tasks_counts_panicked_tasks() {
        let ok = tokio::spawn(async {});
        let panicked = tokio::spawn(async {
            panic!("task failure");
        });

        assert_eq!(join_tasks(vec![("ok", ok), ("panicked", panicked)]).await, 1);
    }
}
