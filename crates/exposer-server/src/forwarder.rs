//! Traffic forwarding across the tunnel: TCP relays and UDP pseudo-sessions.
//!
//! TCP connections are shuttled with one copy task per direction and torn
//! down as soon as either direction finishes. UDP traffic is tracked as
//! sessions keyed by the public client address in a moka cache whose
//! idle-expiry policy evicts sessions that see no traffic; each session
//! owns a socket connected to the target and a response pump that relays
//! replies back through the listener's server socket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use moka::sync::Cache;
use thiserror::Error;
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Maximum UDP datagram size.
const MAX_DATAGRAM: usize = 65_535;

/// Forwarding errors.
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("timed out dialing {0}")]
    DialTimeout(String),

    #[error("failed to dial target {addr}: {source}")]
    Unreachable {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("forwarding error: {0}")]
    Io(#[from] std::io::Error),
}

/// Forwarder tunables. Defaults are the production contract; tests shrink
/// them to exercise eviction quickly.
#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    /// Name of the tunnel-facing interface the targets are routed over.
    pub tunnel_interface: String,
    /// TCP connect timeout.
    pub dial_timeout: Duration,
    /// Per-read deadline on the UDP target socket.
    pub udp_read_deadline: Duration,
    /// Idle TTL after which a UDP session is evicted.
    pub udp_idle_ttl: Duration,
    /// Upper bound on concurrently tracked UDP sessions.
    pub max_udp_sessions: u64,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            tunnel_interface: "wg0".to_string(),
            dial_timeout: Duration::from_secs(10),
            udp_read_deadline: Duration::from_secs(30),
            udp_idle_ttl: Duration::from_secs(300),
            max_udp_sessions: 65_536,
        }
    }
}

/// A pseudo-connection for one UDP client: an ephemeral socket connected
/// to the target so reads only deliver that target's replies. Dropping
/// the session closes the socket.
struct UdpSession {
    client_addr: SocketAddr,
    target: UdpSocket,
}

/// Forwards traffic between public listeners and cluster workloads.
pub struct Forwarder {
    config: ForwarderConfig,
    /// Idle-expiring session cache. A cache read counts as activity, so
    /// forwarding a datagram in either direction refreshes the session.
    sessions: Cache<SocketAddr, Arc<UdpSession>>,
}

impl Forwarder {
    pub fn new(config: ForwarderConfig) -> Self {
        info!(
            tunnel_interface = %config.tunnel_interface,
            "initializing forwarder"
        );

        let sessions = Cache::builder()
            .max_capacity(config.max_udp_sessions)
            .time_to_idle(config.udp_idle_ttl)
            .build();

        Self { config, sessions }
    }

    /// Relay a TCP connection to `target_ip:target_port`, returning when
    /// either direction finishes. Closing either socket cascades to the
    /// other; EOF is not an error.
    pub async fn forward_tcp(
        &self,
        client: TcpStream,
        target_ip: &str,
        target_port: u16,
    ) -> Result<(), ForwardError> {
        let addr = format!("{target_ip}:{target_port}");

        let target = timeout(self.config.dial_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| ForwardError::DialTimeout(addr.clone()))?
            .map_err(|source| ForwardError::Unreachable {
                addr: addr.clone(),
                source,
            })?;

        debug!(target = %addr, "tcp connection established");

        let (mut client_read, mut client_write) = client.into_split();
        let (mut target_read, mut target_write) = target.into_split();

        let result = tokio::select! {
            res = tokio::io::copy(&mut client_read, &mut target_write) => res,
            res = tokio::io::copy(&mut target_read, &mut client_write) => res,
        };
        // The split halves drop here, closing both sockets and terminating
        // the losing copy direction.

        debug!(target = %addr, "tcp connection closed");
        result.map(|_| ()).map_err(ForwardError::Io)
    }

    /// Forward one UDP datagram, creating the client's session on first
    /// contact. Replies are pumped back via `server_sock`.
    pub async fn forward_udp(
        &self,
        server_sock: Arc<UdpSocket>,
        client_addr: SocketAddr,
        data: Vec<u8>,
        target_ip: &str,
        target_port: u16,
    ) -> Result<(), ForwardError> {
        // The lookup itself refreshes the session's idle clock.
        let session = match self.sessions.get(&client_addr) {
            Some(session) => session,
            None => {
                self.create_session(server_sock, client_addr, target_ip, target_port)
                    .await?
            }
        };

        session.target.send(&data).await?;
        debug!(client = %client_addr, size = data.len(), "udp packet forwarded");
        Ok(())
    }

    /// Number of live UDP sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.run_pending_tasks();
        self.sessions.entry_count() as usize
    }

    /// Drop all sessions.
    pub fn close(&self) {
        self.sessions.invalidate_all();
        info!("forwarder closed");
    }

    async fn create_session(
        &self,
        server_sock: Arc<UdpSocket>,
        client_addr: SocketAddr,
        target_ip: &str,
        target_port: u16,
    ) -> Result<Arc<UdpSession>, ForwardError> {
        let addr = format!("{target_ip}:{target_port}");

        let target = UdpSocket::bind("0.0.0.0:0").await?;
        target
            .connect(&addr)
            .await
            .map_err(|source| ForwardError::Unreachable {
                addr: addr.clone(),
                source,
            })?;

        let session = Arc::new(UdpSession {
            client_addr,
            target,
        });

        let entry = self
            .sessions
            .entry(client_addr)
            .or_insert_with(|| session.clone());
        if !entry.is_fresh() {
            // Another datagram from the same client won the race; keep the
            // first session and let our freshly dialed socket drop.
            return Ok(entry.into_value());
        }

        debug!(client = %client_addr, target = %addr, "udp session created");

        tokio::spawn(pump_responses(
            server_sock,
            session.clone(),
            self.sessions.clone(),
            self.config.udp_read_deadline,
        ));

        Ok(session)
    }
}

/// Relay target replies back to the session's client until the session
/// errors out or the cache expires it.
async fn pump_responses(
    server_sock: Arc<UdpSocket>,
    session: Arc<UdpSession>,
    sessions: Cache<SocketAddr, Arc<UdpSession>>,
    read_deadline: Duration,
) {
    let client_addr = session.client_addr;
    let mut buffer = vec![0u8; MAX_DATAGRAM];

    loop {
        match timeout(read_deadline, session.target.recv(&mut buffer)).await {
            Err(_) => {
                // Idle eviction is the cache's job; the pump follows its
                // entry out. contains_key is not a cache read, so probing
                // here does not keep an idle session alive.
                if !sessions.contains_key(&client_addr) {
                    debug!(client = %client_addr, "udp session expired");
                    return;
                }
            }
            Ok(Err(e)) => {
                warn!(client = %client_addr, error = %e, "udp read error");
                sessions.invalidate(&client_addr);
                return;
            }
            Ok(Ok(n)) => {
                // A reply counts as activity: refresh the idle clock.
                let _ = sessions.get(&client_addr);
                if let Err(e) = server_sock.send_to(&buffer[..n], client_addr).await {
                    error!(client = %client_addr, error = %e, "failed to write udp response");
                    continue;
                }
                debug!(client = %client_addr, size = n, "udp response forwarded");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn test_config() -> ForwarderConfig {
        ForwarderConfig {
            tunnel_interface: "lo".to_string(),
            dial_timeout: Duration::from_secs(2),
            ..ForwarderConfig::default()
        }
    }

    async fn spawn_tcp_echo() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    while let Ok(n) = stream.read(&mut buf).await {
                        if n == 0 || stream.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        addr
    }

    async fn spawn_udp_echo() -> SocketAddr {
        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = sock.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            while let Ok((n, peer)) = sock.recv_from(&mut buf).await {
                let _ = sock.send_to(&buf[..n], peer).await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_forward_tcp_roundtrip() {
        let echo = spawn_tcp_echo().await;
        let forwarder = Forwarder::new(test_config());

        let relay = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let relay_addr = relay.local_addr().unwrap();

        let fwd = tokio::spawn(async move {
            let (conn, _) = relay.accept().await.unwrap();
            forwarder
                .forward_tcp(conn, &echo.ip().to_string(), echo.port())
                .await
        });

        let mut client = TcpStream::connect(relay_addr).await.unwrap();
        client.write_all(b"ping").await.unwrap();

        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"ping");

        // Closing the client side terminates the relay.
        drop(client);
        fwd.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_forward_tcp_unreachable() {
        let forwarder = Forwarder::new(test_config());

        // Grab a port that refuses connections by binding and dropping it.
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead = probe.local_addr().unwrap();
        drop(probe);

        let relay = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let relay_addr = relay.local_addr().unwrap();
        let _client = TcpStream::connect(relay_addr).await.unwrap();
        let (conn, _) = relay.accept().await.unwrap();

        let err = forwarder
            .forward_tcp(conn, &dead.ip().to_string(), dead.port())
            .await
            .unwrap_err();
        assert!(matches!(err, ForwardError::Unreachable { .. }));
    }

    #[tokio::test]
    async fn test_udp_session_reply_affinity() {
        let echo = spawn_udp_echo().await;
        let forwarder = Forwarder::new(test_config());

        let server_sock = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client_addr = client.local_addr().unwrap();

        forwarder
            .forward_udp(
                server_sock.clone(),
                client_addr,
                b"hello".to_vec(),
                &echo.ip().to_string(),
                echo.port(),
            )
            .await
            .unwrap();

        let mut buf = [0u8; 16];
        let (n, from) = timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(from, server_sock.local_addr().unwrap());
        assert_eq!(forwarder.session_count(), 1);
    }

    #[tokio::test]
    async fn test_udp_independent_sessions() {
        let echo = spawn_udp_echo().await;
        let forwarder = Forwarder::new(test_config());

        let server_sock = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let client_x = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client_y = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        for (client, payload) in [(&client_x, b"xx".to_vec()), (&client_y, b"yy".to_vec())] {
            forwarder
                .forward_udp(
                    server_sock.clone(),
                    client.local_addr().unwrap(),
                    payload,
                    &echo.ip().to_string(),
                    echo.port(),
                )
                .await
                .unwrap();
        }

        assert_eq!(forwarder.session_count(), 2);

        let mut buf = [0u8; 16];
        let (n, _) = timeout(Duration::from_secs(2), client_x.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"xx");
        let (n, _) = timeout(Duration::from_secs(2), client_y.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"yy");
    }

    #[tokio::test]
    async fn test_udp_idle_eviction() {
        let echo = spawn_udp_echo().await;
        let forwarder = Forwarder::new(ForwarderConfig {
            udp_idle_ttl: Duration::from_millis(100),
            ..test_config()
        });

        let server_sock = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client_addr = client.local_addr().unwrap();

        forwarder
            .forward_udp(
                server_sock.clone(),
                client_addr,
                b"one".to_vec(),
                &echo.ip().to_string(),
                echo.port(),
            )
            .await
            .unwrap();
        assert_eq!(forwarder.session_count(), 1);

        // Wait past the idle TTL; the cache expires the session.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(forwarder.session_count(), 0);

        // The next packet creates a fresh session.
        forwarder
            .forward_udp(
                server_sock,
                client_addr,
                b"two".to_vec(),
                &echo.ip().to_string(),
                echo.port(),
            )
            .await
            .unwrap();
        assert_eq!(forwarder.session_count(), 1);
    }

    #[tokio::test]
    async fn test_close_drops_sessions() {
        let echo = spawn_udp_echo().await;
        let forwarder = Forwarder::new(test_config());

        let server_sock = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        forwarder
            .forward_udp(
                server_sock,
                client.local_addr().unwrap(),
                b"x".to_vec(),
                &echo.ip().to_string(),
                echo.port(),
            )
            .await
            .unwrap();

        forwarder.close();
        assert_eq!(forwarder.session_count(), 0);
    }
}
