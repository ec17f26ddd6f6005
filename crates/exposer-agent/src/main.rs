//! Cluster agent binary: watches annotated services and pushes the
//! resolved desired state to the edge server.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use exposer_agent::{discover_services, DiscoveryConfig, OnChange, ServerClient, ServiceWatcher};

/// Cluster agent for the exposer control plane.
#[derive(Parser, Debug)]
#[command(name = "exposer-agent", version, about)]
struct Args {
    /// Edge server address (host:port, reachable over the tunnel).
    #[arg(long, env = "EXPOSER_SERVER_ADDR", default_value = "10.0.0.1:9090")]
    server_addr: String,

    /// Public domain suffix; also the default annotation prefix source.
    #[arg(long, env = "EXPOSER_DOMAIN", default_value = "example.com")]
    domain: String,

    /// Annotation prefix. Defaults to `expose.<domain>`.
    #[arg(long, env = "EXPOSER_ANNOTATION_PREFIX")]
    annotation_prefix: Option<String>,

    /// Periodic full re-scan interval in seconds.
    #[arg(long, env = "EXPOSER_SYNC_INTERVAL", default_value_t = 30)]
    sync_interval: u64,

    /// Log filter (tracing EnvFilter syntax).
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&args.log_level).context("invalid log filter")?)
        .init();

    let annotation_prefix = args
        .annotation_prefix
        .clone()
        .unwrap_or_else(|| format!("expose.{}", args.domain));

    info!(
        server_addr = %args.server_addr,
        annotation_prefix = %annotation_prefix,
        sync_interval = args.sync_interval,
        "starting exposer agent"
    );

    let client = kube::Client::try_default()
        .await
        .context("failed to initialize cluster client")?;
    info!("cluster client initialized");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_handler(shutdown_tx);

    let discovery_config = DiscoveryConfig::new(annotation_prefix);
    let (updates_tx, updates_rx) = mpsc::channel(10);

    // Client loop: pushes every received snapshot to the server.
    let server_client = Arc::new(ServerClient::new(args.server_addr.clone()));
    let client_task = {
        let server_client = server_client.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { server_client.run(updates_rx, shutdown).await })
    };

    // Periodic full re-scan as a safety net beside the watch.
    {
        let client = client.clone();
        let config = discovery_config.clone();
        let updates = updates_tx.clone();
        let mut shutdown = shutdown_rx.clone();
        let interval = Duration::from_secs(args.sync_interval);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.changed() => return,
                    _ = ticker.tick() => {
                        debug!("performing periodic service discovery");
                        match discover_services(&client, &config).await {
                            Ok(services) => {
                                tokio::select! {
                                    _ = shutdown.changed() => return,
                                    _ = updates.send(services) => {}
                                }
                            }
                            Err(e) => error!(error = %e, "periodic discovery failed"),
                        }
                    }
                }
            }
        });
    }

    // Change-driven watch; every event forwards a full snapshot.
    let on_change: OnChange = {
        let updates = updates_tx.clone();
        let shutdown = shutdown_rx.clone();
        Arc::new(move |services| {
            let updates = updates.clone();
            let mut shutdown = shutdown.clone();
            Box::pin(async move {
                info!(count = services.len(), "service change detected");
                tokio::select! {
                    _ = shutdown.changed() => {}
                    _ = updates.send(services) => {}
                }
            })
        })
    };

    let watcher = ServiceWatcher::new(client, discovery_config, on_change);
    watcher.run(shutdown_rx).await;

    drop(updates_tx);
    let _ = client_task.await;

    info!("agent stopped");
    Ok(())
}

fn spawn_signal_handler(shutdown: watch::Sender<bool>) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut term =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(term) => term,
                    Err(e) => {
                        error!(error = %e, "failed to install SIGTERM handler");
                        let _ = ctrl_c.await;
                        let _ = shutdown.send(true);
                        return;
                    }
                };
            tokio::select! {
                _ = ctrl_c => info!("received interrupt"),
                _ = term.recv() => info!("received termination signal"),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            info!("received interrupt");
        }
        let _ = shutdown.send(true);
    });
}
