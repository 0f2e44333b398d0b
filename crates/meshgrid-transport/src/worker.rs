//! Long-lived bidirectional channel.
//!
//! A `ConnectionWorker` owns a framed socket and runs a reader task that
//! demultiplexes incoming frames:
//!
//! ```text
//! reader task
//!   ├── request  → spawn task → RequestHandler → response (same messageID)
//!   └── response → completes the pending outbound exchange (id must match)
//! ```
//!
//! Outbound requests are serialized: one exchange at a time per worker.
//! Inbound requests are handled on their own tasks so a handler that itself
//! sends on this channel cannot block the reader.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use mesh_core::Message;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::codec::JsonFramed;
use crate::error::{TransportError, TransportResult};
use crate::handler::{RequestHandler, dispatch};

type Sink = SplitSink<JsonFramed, Message>;

struct Pending {
    id: u64,
    reply: oneshot::Sender<Message>,
}

struct Shared {
    name: String,
    peer: SocketAddr,
    sink: Mutex<Sink>,
    pending: StdMutex<Option<Pending>>,
    closed: AtomicBool,
}

impl Shared {
    async fn write(&self, message: Message) -> TransportResult<()> {
        let mut sink = self.sink.lock().await;
        sink.send(message).await
    }

    fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
        // Dropping the sender fails the waiting exchange.
        self.take_pending();
    }

    fn take_pending(&self) -> Option<Pending> {
        self.pending.lock().ok().and_then(|mut slot| slot.take())
    }
}

pub struct ConnectionWorker {
    shared: Arc<Shared>,
    exchange: Mutex<()>,
    next_id: AtomicU64,
    reader: StdMutex<Option<JoinHandle<()>>>,
}

impl ConnectionWorker {
    /// Take ownership of `framed` and start the reader task.
    ///
    /// `name` identifies the channel in logs (agent name or instance id).
    pub fn spawn(
        name: impl Into<String>,
        framed: JsonFramed,
        handler: Arc<dyn RequestHandler>,
    ) -> TransportResult<Arc<Self>> {
        let peer = framed.get_ref().peer_addr()?;
        let (sink, stream) = framed.split();
        let shared = Arc::new(Shared {
            name: name.into(),
            peer,
            sink: Mutex::new(sink),
            pending: StdMutex::new(None),
            closed: AtomicBool::new(false),
        });

        let reader = tokio::spawn(read_loop(shared.clone(), stream, handler));
        debug!(channel = %shared.name, %peer, "connection worker started");

        Ok(Arc::new(Self {
            shared,
            exchange: Mutex::new(()),
            next_id: AtomicU64::new(1),
            reader: StdMutex::new(Some(reader)),
        }))
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn peer(&self) -> SocketAddr {
        self.shared.peer
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Send `request` and wait for the response carrying its id.
    pub async fn send(&self, mut request: Message) -> TransportResult<Message> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let _exchange = self.exchange.lock().await;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        request.set_message_id(Some(id));
        let (tx, rx) = oneshot::channel();
        if let Ok(mut slot) = self.shared.pending.lock() {
            *slot = Some(Pending { id, reply: tx });
        }

        if let Err(e) = self.shared.write(request).await {
            warn!(channel = %self.shared.name, error = %e, "write failed");
            self.shared.mark_closed();
            return Err(e);
        }

        rx.await.map_err(|_| TransportError::Closed)
    }

    /// `send` bounded by `deadline`. A late response is dropped on arrival.
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
    pub async fn send_ok(&self, request: Message, deadline: Duration) -> TransportResult<Message> {
        self.send_timeout(request, deadline)
            .await?
            .into_result()
            .map_err(TransportError::Rejected)
    }

    /// Stop the reader and shut the socket down. Idempotent.
    pub async fn close(&self) {
        let reader = self.reader.lock().ok().and_then(|mut slot| slot.take());
        let Some(reader) = reader else {
            return;
        };
        self.shared.mark_closed();
        reader.abort();
        let mut sink = self.shared.sink.lock().await;
        if let Err(e) = sink.close().await {
            debug!(channel = %self.shared.name, error = %e, "error closing socket");
        }
        debug!(channel = %self.shared.name, "connection worker closed");
    }
}

impl Drop for ConnectionWorker {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.reader.lock()
            && let Some(reader) = slot.take()
        {
            reader.abort();
        }
    }
}

impl std::fmt::Debug for ConnectionWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionWorker")
            .field("name", &self.shared.name)
            .field("peer", &self.shared.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn read_loop(
    shared: Arc<Shared>,
    mut stream: SplitStream<JsonFramed>,
    handler: Arc<dyn RequestHandler>,
) {
    while let Some(frame) = stream.next().await {
        match frame {
            Err(e) => {
                warn!(channel = %shared.name, error = %e, "read failed");
                break;
            }
            Ok(Err(invalid)) => {
                let reply = Message::error(&invalid);
                if let Err(e) = shared.write(reply).await {
                    warn!(channel = %shared.name, error = %e, "write failed");
                    break;
                }
            }
            Ok(Ok(message)) if message.is_request() => {
                let shared = shared.clone();
                let handler = handler.clone();
                tokio::spawn(async move {
                    let response = dispatch(&handler, message, shared.peer).await;
                    if let Err(e) = shared.write(response).await {
                        warn!(channel = %shared.name, error = %e, "failed to answer request");
                    }
                });
            }
            Ok(Ok(response)) => complete(&shared, response),
        }
    }
    debug!(channel = %shared.name, "connection worker reader finished");
    shared.mark_closed();
}

fn complete(shared: &Shared, response: Message) {
    let Some(pending) = shared.take_pending() else {
        debug!(channel = %shared.name, "dropping unsolicited response");
        return;
    };

    match response.message_id() {
        Some(got) if got != pending.id => {
            debug!(
                channel = %shared.name,
                expected = pending.id,
                got,
                "dropping response with mismatched id"
            );
            // Still waiting for the right one.
            if let Ok(mut slot) = shared.pending.lock() {
                *slot = Some(pending);
            }
        }
        _ => {
            let _ = pending.reply.send(response);
        }
    }
}
