//! A single framed request/response channel over one TCP socket.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use mesh_core::{Message, TransportConfig};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

use crate::codec::{self, JsonFramed};
use crate::error::{TransportError, TransportResult};

/// Client side of a request/response socket.
///
/// At most one exchange is in flight: `send` holds the stream lock from the
/// write of the request until the matching response has been read.
pub struct Connection {
    framed: Mutex<JsonFramed>,
    peer: SocketAddr,
    next_id: AtomicU64,
}

impl Connection {
    /// Dial `addr` and frame the socket.
    pub async fn connect(addr: &str, config: &TransportConfig) -> TransportResult<Self> {
        let stream = TcpStream::connect(addr).await?;
        Self::from_stream(stream, config.max_frame_bytes)
    }

    pub fn from_stream(stream: TcpStream, max_frame_bytes: usize) -> TransportResult<Self> {
        let peer = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        Ok(Self {
            framed: Mutex::new(codec::framed(stream, max_frame_bytes)),
            peer,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Send `request` and wait for its response.
    ///
    /// A request without a `messageID` gets one. Responses carrying a
    /// different id are stale and skipped.
    pub async fn send(&self, mut request: Message) -> TransportResult<Message> {
        let mut framed = self.framed.lock().await;
        let id = match request.message_id() {
            Some(id) => id,
            None => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                request.set_message_id(Some(id));
                id
            }
        };
        framed.send(request).await?;

        loop {
            match framed.next().await {
                None => return Err(TransportError::Closed),
                Some(Err(e)) => return Err(e),
                Some(Ok(Err(invalid))) => {
                    return Err(TransportError::Malformed(invalid.message));
                }
                Some(Ok(Ok(response))) => match response.message_id() {
                    Some(got) if got != id => {
                        debug!(peer = %self.peer, expected = id, got, "dropping stale response");
                    }
                    _ => return Ok(response),
                },
            }
        }
    }

    /// `send` bounded by `deadline`.
    pub async fn send_timeout(
        &self,
        request: Message,
        deadline: Duration,
    ) -> TransportResult<Message> {
        tokio::time::timeout(deadline, self.send(request))
            .await
            .map_err(|_| TransportError::Timeout(deadline))?
    }

    /// `send`, turning a failure status into `TransportError::Rejected`.
    pub async fn send_ok(&self, request: Message) -> TransportResult<Message> {
        self.send(request)
            .await?
            .into_result()
            .map_err(TransportError::Rejected)
    }

    /// Give up request/response mode and hand the framed socket to a worker.
    pub fn into_framed(self) -> JsonFramed {
        self.framed.into_inner()
    }

    /// Dial, perform one exchange, and drop the socket.
    pub async fn request(
        addr: &str,
        request: Message,
        config: &TransportConfig,
    ) -> TransportResult<Message> {
        let connection = Self::connect(addr, config).await?;
        connection.send_timeout(request, config.read_timeout).await
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").field("peer", &self.peer).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_core::Action;
    use tokio::net::TcpListener;

    /// Accepts one socket and answers every request with its own id, after
    /// first emitting a stale response.
    async fn spawn_peer() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut framed = codec::framed(stream, 1024);
            while let Some(Ok(Ok(request))) = framed.next().await {
                let id = request.message_id();
                let stale = Message::ok().with_message_id(Some(10_000));
                framed.send(stale).await.unwrap();
                let reply = Message::ok()
                    .with("echo", request.action_name().unwrap_or_default().to_string())
                    .with_message_id(id);
                framed.send(reply).await.unwrap();
            }
        });
        addr
    }

    #[tokio::test]
    async fn send_skips_stale_responses() {
        let addr = spawn_peer().await;
        let conn = Connection::connect(&addr.to_string(), &TransportConfig::default())
            .await
            .unwrap();

        for _ in 0..2 {
            let response = conn.send(Message::request(Action::TestConnection)).await.unwrap();
            assert!(response.is_success());
            assert_eq!(response.get("echo").unwrap(), "testConnection");
        }
    }

    #[tokio::test]
    async fn closed_peer_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let conn = Connection::connect(&addr.to_string(), &TransportConfig::default())
            .await
            .unwrap();
        let err = conn
            .send_timeout(Message::request(Action::TestConnection), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _hold = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let conn = Connection::connect(&addr.to_string(), &TransportConfig::default())
            .await
            .unwrap();
        let err = conn
            .send_timeout(Message::request(Action::TestConnection), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout(_)));
    }
}
