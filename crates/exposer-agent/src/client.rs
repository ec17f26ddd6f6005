//! Client loop pushing desired state to the edge server.
//!
//! The loop owns one persistent connection. Heartbeats keep an idle
//! connection alive; any send error triggers reconnection with exponential
//! backoff followed by a resend of the last known full service set — the
//! agent never assumes the server remembers anything across a disconnect.

use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};

use exposer_proto::{Backoff, Connection, ConnectionError, ExposedService, Message};

/// Interval between heartbeats on an otherwise-idle connection.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Client connection to the edge server with resync-on-reconnect.
pub struct ServerClient {
    conn: Connection,
    last_services: Mutex<Vec<ExposedService>>,
}

impl ServerClient {
    pub fn new(server_addr: impl Into<String>) -> Self {
        Self {
            conn: Connection::new(server_addr),
            last_services: Mutex::new(Vec::new()),
        }
    }

    /// Send a full desired-state snapshot, remembering it for resync.
    pub async fn send_update(&self, services: Vec<ExposedService>) -> Result<(), ConnectionError> {
        *self.last_services.lock().await = services.clone();

        info!(count = services.len(), "sending service update");
        self.conn.send(&Message::update(services)).await
    }

    pub async fn send_heartbeat(&self) -> Result<(), ConnectionError> {
        self.conn.send(&Message::heartbeat()).await?;
        debug!("heartbeat sent");
        Ok(())
    }

    /// Drive the connection: forward updates from `updates`, emit
    /// heartbeats, reconnect and resync on any failure.
    pub async fn run(
        &self,
        mut updates: mpsc::Receiver<Vec<ExposedService>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut backoff = Backoff::default();

        match self.conn.connect().await {
            Ok(()) => {}
            Err(e) => {
                warn!(error = %e, "initial connection failed");
                tokio::select! {
                    _ = shutdown.changed() => return,
                    _ = self.reconnect_and_resync(&mut backoff) => {}
                }
            }
        }

        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await; // discard the immediate first tick

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    self.conn.close().await;
                    return;
                }
                _ = heartbeat.tick() => {
                    if let Err(e) = self.send_heartbeat().await {
                        warn!(error = %e, "heartbeat failed, reconnecting");
                        tokio::select! {
                            _ = shutdown.changed() => return,
                            _ = self.reconnect_and_resync(&mut backoff) => {}
                        }
                    }
                }
                received = updates.recv() => {
                    let Some(services) = received else {
                        info!("update channel closed, stopping client");
                        self.conn.close().await;
                        return;
                    };
                    if let Err(e) = self.send_update(services).await {
                        error!(error = %e, "failed to send service update, reconnecting");
                        // The failed set was stored as last-known state, so
                        // the resync after reconnect carries it.
                        tokio::select! {
                            _ = shutdown.changed() => return,
                            _ = self.reconnect_and_resync(&mut backoff) => {}
                        }
                    }
                }
            }
        }
    }

    async fn reconnect_and_resync(&self, backoff: &mut Backoff) {
        self.conn.reconnect(backoff).await;
        backoff.reset();

        let services = self.last_services.lock().await.clone();
        if services.is_empty() {
            return;
        }

        info!(count = services.len(), "resending full service set after reconnect");
        if let Err(e) = self.conn.send(&Message::update(services)).await {
            error!(error = %e, "failed to resend services after reconnect");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use exposer_proto::{read_message, MessageKind, PortMapping, Protocol};
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    fn service(subdomain: &str) -> ExposedService {
        ExposedService {
            name: subdomain.to_string(),
            namespace: "default".to_string(),
            subdomain: subdomain.to_string(),
            ports: vec![PortMapping {
                port: 80,
                target_port: 8080,
                protocol: Protocol::Tcp,
            }],
            target_ip: "10.0.0.1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_update_delivered_to_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            read_message(&mut stream).await.unwrap()
        });

        let client = std::sync::Arc::new(ServerClient::new(addr.to_string()));
        let (tx, rx) = mpsc::channel(10);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let runner = {
            let client = client.clone();
            tokio::spawn(async move { client.run(rx, shutdown_rx).await })
        };

        tx.send(vec![service("web")]).await.unwrap();

        let received = timeout(Duration::from_secs(5), server).await.unwrap().unwrap();
        assert_eq!(received.kind, MessageKind::ServiceUpdate);
        assert_eq!(received.services.len(), 1);
        assert_eq!(received.services[0].subdomain, "web");

        drop(tx);
        let _ = timeout(Duration::from_secs(2), runner).await;
    }

    #[tokio::test]
    async fn test_full_set_resent_after_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // First connection: read one update, then drop the socket so the
        // client's next send fails. Second connection: collect the resync.
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let first = read_message(&mut stream).await.unwrap();
            drop(stream);

            let (mut stream, _) = listener.accept().await.unwrap();
            let resync = read_message(&mut stream).await.unwrap();
            (first, resync)
        });

        let client = std::sync::Arc::new(ServerClient::new(addr.to_string()));
        let (tx, rx) = mpsc::channel(10);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let runner = {
            let client = client.clone();
            tokio::spawn(async move { client.run(rx, shutdown_rx).await })
        };

        tx.send(vec![service("a")]).await.unwrap();
        // Give the first send time to land before pushing the set whose
        // send hits the closed socket. The first write after the peer's
        // close can still land in the kernel buffer, so push the same
        // snapshot twice; the second write observes the reset.
        tokio::time::sleep(Duration::from_millis(200)).await;
        tx.send(vec![service("a"), service("b")]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        tx.send(vec![service("a"), service("b")]).await.unwrap();

        let (first, resync) = timeout(Duration::from_secs(10), server)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.services.len(), 1);
        // The resynced set is the client's latest view, not a delta.
        assert_eq!(resync.kind, MessageKind::ServiceUpdate);
        assert_eq!(resync.services.len(), 2);

        drop(tx);
        let _ = timeout(Duration::from_secs(2), runner).await;
    }
}
