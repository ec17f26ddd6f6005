//! Per-port listeners owning the bound sockets and accept/receive loops.
//!
//! One listener per `(port, protocol)`. A `tcp+udp` mapping binds both
//! transports as a pair; if the UDP bind fails the already-running TCP side
//! is stopped before the error is returned. No other component touches the
//! sockets a listener owns.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use exposer_proto::{ExposedService, PortMapping, Protocol};

use crate::forwarder::Forwarder;

/// Maximum UDP datagram size.
const MAX_DATAGRAM: usize = 65_535;

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// Listener errors.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("failed to bind {transport} port {port}: {source}")]
    Bind {
        transport: &'static str,
        port: u16,
        #[source]
        source: std::io::Error,
    },
}

/// A running listener for one allocated port.
pub struct PortListener {
    id: u64,
    port: u16,
    protocol: Protocol,
    shutdown: watch::Sender<bool>,
    loops: Vec<JoinHandle<()>>,
}

impl PortListener {
    /// Bind the socket(s) for `mapping` on `port` and spawn the
    /// accept/receive loops.
    pub async fn start(
        port: u16,
        service: &ExposedService,
        mapping: &PortMapping,
        forwarder: Arc<Forwarder>,
    ) -> Result<Self, ListenerError> {
        let id = NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed);
        let target_port = resolve_target_port(mapping, port);

        info!(
            listener = id,
            subdomain = %service.subdomain,
            port,
            protocol = %mapping.protocol,
            target = format!("{}:{}", service.target_ip, target_port),
            "starting listener"
        );

        let (shutdown, _) = watch::channel(false);
        let mut loops = Vec::new();

        if mapping.protocol.includes_tcp() {
            let tcp = TcpListener::bind(format!("0.0.0.0:{port}"))
                .await
                .map_err(|source| ListenerError::Bind {
                    transport: "tcp",
                    port,
                    source,
                })?;
            loops.push(tokio::spawn(accept_tcp(
                tcp,
                service.target_ip.clone(),
                target_port,
                forwarder.clone(),
                shutdown.subscribe(),
            )));
        }

        if mapping.protocol.includes_udp() {
            let udp = match UdpSocket::bind(format!("0.0.0.0:{port}")).await {
                Ok(sock) => sock,
                Err(source) => {
                    // Roll back the TCP half of a tcp+udp pair.
                    let _ = shutdown.send(true);
                    for handle in loops {
                        let _ = handle.await;
                    }
                    return Err(ListenerError::Bind {
                        transport: "udp",
                        port,
                        source,
                    });
                }
            };
            loops.push(tokio::spawn(receive_udp(
                Arc::new(udp),
                service.target_ip.clone(),
                target_port,
                forwarder,
                shutdown.subscribe(),
            )));
        }

        Ok(Self {
            id,
            port,
            protocol: mapping.protocol,
            shutdown,
            loops,
        })
    }

    /// Signal the loops, close the sockets, and wait for the loops to exit.
    pub async fn stop(self) {
        info!(
            listener = self.id,
            port = self.port,
            protocol = %self.protocol,
            "stopping listener"
        );

        let _ = self.shutdown.send(true);
        for handle in self.loops {
            let _ = handle.await;
        }

        debug!(listener = self.id, port = self.port, "listener stopped");
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }
}

/// Prefer the mapping's target port, fall back to the external port, then
/// to the listener port.
fn resolve_target_port(mapping: &PortMapping, listen_port: u16) -> u16 {
    if mapping.target_port != 0 {
        mapping.target_port
    } else if mapping.port != 0 {
        mapping.port
    } else {
        listen_port
    }
}

async fn accept_tcp(
    listener: TcpListener,
    target_ip: String,
    target_port: u16,
    forwarder: Arc<Forwarder>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            accepted = listener.accept() => {
                let (conn, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!(error = %e, "failed to accept tcp connection");
                        continue;
                    }
                };

                debug!(remote = %peer, "tcp connection accepted");

                let forwarder = forwarder.clone();
                let target_ip = target_ip.clone();
                tokio::spawn(async move {
                    if let Err(e) = forwarder.forward_tcp(conn, &target_ip, target_port).await {
                        error!(remote = %peer, error = %e, "tcp forwarding failed");
                    }
                });
            }
        }
    }
}

async fn receive_udp(
    sock: Arc<UdpSocket>,
    target_ip: String,
    target_port: u16,
    forwarder: Arc<Forwarder>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buffer = vec![0u8; MAX_DATAGRAM];

    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            received = sock.recv_from(&mut buffer) => {
                let (n, client_addr) = match received {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!(error = %e, "failed to read udp packet");
                        continue;
                    }
                };

                debug!(client = %client_addr, size = n, "udp packet received");

                // The receive buffer is reused; the forwarder gets a copy.
                let data = buffer[..n].to_vec();
                let forwarder = forwarder.clone();
                let target_ip = target_ip.clone();
                let sock = sock.clone();
                tokio::spawn(async move {
                    if let Err(e) = forwarder
                        .forward_udp(sock, client_addr, data, &target_ip, target_port)
                        .await
                    {
                        error!(client = %client_addr, error = %e, "udp forwarding failed");
                    }
                });
            }
        }
    }
}
