//! Persistent agent-side connection to the edge server.
//!
//! The connection is single-owner; sends serialize through a mutex so the
//! heartbeat ticker and the update sender cannot interleave frames.

use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::codec::{write_message, CodecError};
use crate::reconnect::Backoff;
use crate::service::Message;

/// Connection errors.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("not connected")]
    NotConnected,

    #[error("already connected")]
    AlreadyConnected,

    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to send message: {0}")]
    Send(#[from] CodecError),
}

/// A persistent TCP connection to the edge server.
pub struct Connection {
    addr: String,
    stream: Mutex<Option<TcpStream>>,
}

impl Connection {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            stream: Mutex::new(None),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Establish the connection. Fails if already connected.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        let mut stream = self.stream.lock().await;
        if stream.is_some() {
            return Err(ConnectionError::AlreadyConnected);
        }

        let conn = TcpStream::connect(&self.addr)
            .await
            .map_err(|source| ConnectionError::Connect {
                addr: self.addr.clone(),
                source,
            })?;

        info!(addr = %self.addr, "connected to server");
        *stream = Some(conn);
        Ok(())
    }

    /// Send a message. The frame is written whole under the lock.
    pub async fn send(&self, msg: &Message) -> Result<(), ConnectionError> {
        let mut stream = self.stream.lock().await;
        let conn = stream.as_mut().ok_or(ConnectionError::NotConnected)?;
        write_message(conn, msg).await?;
        Ok(())
    }

    /// Drop the underlying stream, if any.
    pub async fn close(&self) {
        let mut stream = self.stream.lock().await;
        if stream.take().is_some() {
            info!(addr = %self.addr, "connection closed");
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.stream.lock().await.is_some()
    }

    /// Close and re-establish the connection, retrying with backoff until
    /// it succeeds. The caller resets the backoff afterwards.
    pub async fn reconnect(&self, backoff: &mut Backoff) {
        self.close().await;

        loop {
            backoff.wait().await;
            info!(addr = %self.addr, attempt = backoff.attempt(), "attempting to reconnect");
            match self.connect().await {
                Ok(()) => {
                    info!(addr = %self.addr, "reconnected");
                    return;
                }
                Err(e) => warn!(addr = %self.addr, error = %e, "reconnection failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::read_message;
    use crate::service::MessageKind;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_send_requires_connection() {
        let conn = Connection::new("127.0.0.1:1");
        let err = conn.send(&Message::heartbeat()).await.unwrap_err();
        assert!(matches!(err, ConnectionError::NotConnected));
    }

    #[tokio::test]
    async fn test_connect_and_send() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            read_message(&mut stream).await.unwrap()
        });

        let conn = Connection::new(addr.to_string());
        conn.connect().await.unwrap();
        assert!(conn.is_connected().await);

        conn.send(&Message::heartbeat()).await.unwrap();

        let received = server.await.unwrap();
        assert_eq!(received.kind, MessageKind::Heartbeat);

        conn.close().await;
        assert!(!conn.is_connected().await);
    }

    #[tokio::test]
    async fn test_double_connect_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let conn = Connection::new(addr.to_string());
        conn.connect().await.unwrap();
        let err = conn.connect().await.unwrap_err();
        assert!(matches!(err, ConnectionError::AlreadyConnected));
    }
}
