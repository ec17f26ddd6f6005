//! Edge server binary: accepts agent connections, applies pushed desired
//! state to the service registry, and keeps HAProxy and the cloud firewall
//! reconciled with it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use exposer_automation::{Reconciler, ReconcilerConfig};
use exposer_server::{serve_agent, Forwarder, ForwarderConfig, ServiceRegistry};

/// Edge server for exposing cluster workloads to the public Internet.
#[derive(Parser, Debug)]
#[command(name = "exposer-server", version, about)]
struct Args {
    /// Address to accept agent connections on (tunnel side).
    #[arg(long, env = "EXPOSER_LISTEN_ADDR", default_value = "10.0.0.1:9090")]
    listen_addr: String,

    /// Start of the fallback port allocation range.
    #[arg(long, env = "EXPOSER_PORT_RANGE_START", default_value_t = 30000)]
    port_range_start: u16,

    /// End of the fallback port allocation range.
    #[arg(long, env = "EXPOSER_PORT_RANGE_END", default_value_t = 32767)]
    port_range_end: u16,

    /// Name of the tunnel-facing network interface.
    #[arg(long, env = "EXPOSER_TUNNEL_INTERFACE", default_value = "wg0")]
    tunnel_interface: String,

    /// Public domain suffix for exposed subdomains.
    #[arg(long, env = "EXPOSER_DOMAIN", default_value = "example.com")]
    domain: String,

    /// HAProxy runtime API socket.
    #[arg(long, env = "EXPOSER_HAPROXY_SOCKET", default_value = "/var/run/haproxy.sock")]
    haproxy_socket: PathBuf,

    /// HAProxy domain-to-backend map file.
    #[arg(long, env = "EXPOSER_HAPROXY_MAP", default_value = "/etc/haproxy/domains.map")]
    haproxy_map: PathBuf,

    /// Generated HAProxy configuration file.
    #[arg(long, env = "EXPOSER_HAPROXY_CONFIG", default_value = "/etc/haproxy/haproxy.cfg")]
    haproxy_config: PathBuf,

    /// Directory scanned for TLS certificates (.pem).
    #[arg(long, env = "EXPOSER_CERT_DIR", default_value = "/etc/ssl/private")]
    cert_dir: PathBuf,

    /// Cloud firewall API token. Firewall management is disabled unless
    /// both the token and the firewall id are set.
    #[arg(long, env = "EXPOSER_FIREWALL_TOKEN")]
    firewall_token: Option<String>,

    /// Cloud firewall id.
    #[arg(long, env = "EXPOSER_FIREWALL_ID")]
    firewall_id: Option<String>,

    /// Reconciliation interval in seconds.
    #[arg(long, env = "EXPOSER_RECONCILE_INTERVAL", default_value_t = 30)]
    reconcile_interval: u64,

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

    info!(
        listen_addr = %args.listen_addr,
        tunnel_interface = %args.tunnel_interface,
        port_range = format!("{}-{}", args.port_range_start, args.port_range_end),
        domain = %args.domain,
        "starting exposer server"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_handler(shutdown_tx);

    let forwarder = Arc::new(Forwarder::new(ForwarderConfig {
        tunnel_interface: args.tunnel_interface.clone(),
        ..ForwarderConfig::default()
    }));

    let registry = Arc::new(ServiceRegistry::new(
        args.port_range_start,
        args.port_range_end,
        forwarder.clone(),
    ));

    let reconciler = Arc::new(Reconciler::new(ReconcilerConfig {
        haproxy_socket: args.haproxy_socket,
        haproxy_map: args.haproxy_map,
        haproxy_config: args.haproxy_config,
        cert_dir: args.cert_dir,
        firewall_token: args.firewall_token,
        firewall_id: args.firewall_id,
        domain: args.domain,
        interval: Duration::from_secs(args.reconcile_interval),
        ..ReconcilerConfig::default()
    }));

    let reconciler_task = {
        let reconciler = reconciler.clone();
        let registry = registry.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let source: exposer_automation::ServiceSource = Arc::new(move || {
                let registry = registry.clone();
                Box::pin(async move { registry.services().await })
            });
            reconciler.run(shutdown, source).await
        })
    };

    let listener = TcpListener::bind(&args.listen_addr)
        .await
        .with_context(|| format!("failed to bind agent listener on {}", args.listen_addr))?;
    info!(addr = %args.listen_addr, "listening for agent connections");

    let accept_loop = {
        let registry = registry.clone();
        let shutdown = shutdown_rx.clone();
        async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        info!(agent = %peer, "agent connected");
                        tokio::spawn(serve_agent(
                            stream,
                            peer,
                            registry.clone(),
                            shutdown.clone(),
                        ));
                    }
                    Err(e) => error!(error = %e, "failed to accept agent connection"),
                }
            }
        }
    };

    let mut shutdown = shutdown_rx;
    tokio::select! {
        _ = shutdown.changed() => info!("shutting down gracefully"),
        result = reconciler_task => {
            match result {
                Ok(Err(e)) => {
                    registry.close().await;
                    forwarder.close();
                    anyhow::bail!("reconciler failed: {e}");
                }
                Ok(Ok(())) => info!("reconciler stopped"),
                Err(e) => error!(error = %e, "reconciler task aborted"),
            }
        }
        _ = accept_loop => unreachable!("accept loop never returns"),
    }

    registry.close().await;
    forwarder.close();
    info!("server stopped");
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
