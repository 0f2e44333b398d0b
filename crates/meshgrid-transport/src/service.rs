//! Listening service engine.
//!
//! A `Service` binds a socket and serves every accepted connection on its
//! own task, feeding requests to a `RequestHandler` one at a time. In
//! control-plane mode the first frame of a connection may instead ask to
//! turn the socket into a long-lived channel; the `ChannelAcceptor` decides,
//! and the engine hands the framed socket to a `ConnectionWorker`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use mesh_core::{Action, Message, RequestError, TransportConfig};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::codec::{self, JsonFramed};
use crate::connection::Connection;
use crate::error::{TransportError, TransportResult};
use crate::handler::{RequestHandler, dispatch};
use crate::worker::ConnectionWorker;

/// What a `ChannelAcceptor` hands back for an accepted channel request.
pub struct ChannelGrant {
    /// Channel name, used for logging and as the registry key.
    pub name: String,
    /// Handles requests the peer later sends on the channel.
    pub handler: Arc<dyn RequestHandler>,
    /// Reply to the opening frame.
    pub response: Message,
}

/// Upgrades a first frame into a long-lived channel.
#[async_trait]
pub trait ChannelAcceptor: Send + Sync + 'static {
    /// Whether `action`, seen as the first frame, opens a channel.
    fn opens_channel(&self, action: Action) -> bool;

    /// Validate the opening request. An error is sent back and the
    /// connection continues in plain mode.
    async fn open_channel(
        &self,
        request: &Message,
        peer: SocketAddr,
    ) -> Result<ChannelGrant, RequestError>;

    /// Take ownership of the running worker.
    async fn attach_channel(&self, name: String, worker: Arc<ConnectionWorker>);
}

#[derive(Clone)]
pub enum ServeMode {
    Plain,
    ControlPlane(Arc<dyn ChannelAcceptor>),
}

/// A bound listener plus the handler for its requests.
pub struct Service {
    listener: TcpListener,
    handler: Arc<dyn RequestHandler>,
    mode: ServeMode,
    config: TransportConfig,
}

impl Service {
    /// Bind `addr` (port 0 lets the OS pick).
    pub async fn bind(
        addr: &str,
        handler: Arc<dyn RequestHandler>,
        mode: ServeMode,
        config: TransportConfig,
    ) -> TransportResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            handler,
            mode,
            config,
        })
    }

    pub fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` flips to `true`.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let local = self.listener.local_addr().ok();
        info!(addr = ?local, "service listening");

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let conn = ConnectionTask {
                            handler: self.handler.clone(),
                            mode: self.mode.clone(),
                            read_timeout: self.config.read_timeout,
                            peer,
                        };
                        let framed = codec::framed(stream, self.config.max_frame_bytes);
                        tokio::spawn(conn.run(framed, shutdown.clone()));
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!(addr = ?local, "service stopped");
    }

    /// Run on a background task; the handle stops it.
    pub fn spawn(self) -> TransportResult<ServiceHandle> {
        let addr = self.local_addr()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(shutdown_rx));
        Ok(ServiceHandle {
            addr,
            shutdown_tx,
            task,
        })
    }
}

/// Control handle for a spawned `Service`.
pub struct ServiceHandle {
    addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ServiceHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting, drop served connections, and wait for the accept
    /// loop to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            debug!(error = %e, "service task ended abnormally");
        }
    }
}

struct ConnectionTask {
    handler: Arc<dyn RequestHandler>,
    mode: ServeMode,
    read_timeout: Duration,
    peer: SocketAddr,
}

impl ConnectionTask {
    async fn run(self, mut framed: JsonFramed, mut shutdown: watch::Receiver<bool>) {
        let peer = self.peer;
        debug!(%peer, "connection accepted");
        let mut first = true;

        loop {
            let next = tokio::select! {
                next = tokio::time::timeout(self.read_timeout, framed.next()) => next,
                _ = shutdown.changed() => break,
            };

            let frame = match next {
                Err(_) => {
                    debug!(%peer, "read timeout, closing connection");
                    break;
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    warn!(%peer, error = %e, "read failed");
                    break;
                }
                Ok(Some(Ok(frame))) => frame,
            };

            let response = match frame {
                Err(invalid) => Message::error(&invalid),
                Ok(request) => {
                    if std::mem::take(&mut first)
                        && let ServeMode::ControlPlane(acceptor) = &self.mode
                        && let Ok(action) = request.action()
                        && acceptor.opens_channel(action)
                    {
                        match acceptor.open_channel(&request, peer).await {
                            Ok(grant) => {
                                let id = request.message_id();
                                hand_off(acceptor.clone(), framed, grant, id).await;
                                return;
                            }
                            Err(e) => Message::error(&e).with_message_id(request.message_id()),
                        }
                    } else {
                        dispatch(&self.handler, request, peer).await
                    }
                }
            };

            if let Err(e) = framed.send(response).await {
                warn!(%peer, error = %e, "write failed");
                break;
            }
        }
        debug!(%peer, "connection closed");
    }
}

async fn hand_off(
    acceptor: Arc<dyn ChannelAcceptor>,
    mut framed: JsonFramed,
    grant: ChannelGrant,
    id: Option<u64>,
) {
    let ChannelGrant {
        name,
        handler,
        response,
    } = grant;

    if let Err(e) = framed.send(response.with_message_id(id)).await {
        warn!(channel = %name, error = %e, "failed to acknowledge channel");
        return;
    }
    match ConnectionWorker::spawn(name.clone(), framed, handler) {
        Ok(worker) => acceptor.attach_channel(name, worker).await,
        Err(e) => warn!(channel = %name, error = %e, "failed to start channel worker"),
    }
}

/// Dial `addr`, send `opening` as the first frame, and turn the socket into
/// a worker once the peer accepts.
pub async fn open_channel(
    name: impl Into<String>,
    addr: &str,
    opening: Message,
    handler: Arc<dyn RequestHandler>,
    config: &TransportConfig,
    deadline: Duration,
) -> TransportResult<Arc<ConnectionWorker>> {
    let stream = tokio::time::timeout(deadline, TcpStream::connect(addr))
        .await
        .map_err(|_| TransportError::Timeout(deadline))??;
    let connection = Connection::from_stream(stream, config.max_frame_bytes)?;
    let reply = connection.send_timeout(opening, deadline).await?;
    reply.into_result().map_err(TransportError::Rejected)?;
    ConnectionWorker::spawn(name, connection.into_framed(), handler)
}
