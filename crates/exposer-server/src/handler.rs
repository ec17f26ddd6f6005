//! Inbound agent connection handling.
//!
//! One task per agent connection. Messages are processed strictly in
//! arrival order; any receive error closes the connection. The registry is
//! never torn down on disconnect — the next connection pushes a fresh full
//! state.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use exposer_proto::{read_message, MessageKind};

use crate::registry::ServiceRegistry;

/// Serve one agent connection until it errors out or shutdown is signaled.
pub async fn serve_agent(
    mut stream: TcpStream,
    peer: SocketAddr,
    registry: Arc<ServiceRegistry>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(agent = %peer, "handling agent connection");

    loop {
        let msg = tokio::select! {
            _ = shutdown.changed() => {
                info!(agent = %peer, "closing agent connection on shutdown");
                return;
            }
            received = read_message(&mut stream) => match received {
                Ok(msg) => msg,
                Err(e) => {
                    warn!(agent = %peer, error = %e, "agent connection closed");
                    return;
                }
            },
        };

        match msg.kind {
            MessageKind::ServiceUpdate => {
                info!(agent = %peer, count = msg.services.len(), "received service update");
                registry.update(msg.services).await;
            }
            MessageKind::ServiceDelete => {
                info!(agent = %peer, count = msg.services.len(), "received service delete");
                for svc in &msg.services {
                    registry.remove_service(&svc.subdomain).await;
                }
            }
            MessageKind::Heartbeat => {
                debug!(agent = %peer, "received heartbeat");
            }
        }
    }
}
