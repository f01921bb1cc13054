//! Caller side of the RPC bridge
//!
//! Turns an [`Endpoint`] into awaitable request/response calls:
//!
//! ```text
//!   call(req) ──► allocate id ──► pending[id] = resolver ──► post RpcCall
//!                                                               │
//!   receive loop ◄── FromRemote::Reply { id, result } ◄─────────┘
//!        │
//!        └──► pending.remove(id) ──► resolver.send(result) ──► future resolves
//! ```
//!
//! Replies may arrive in any order. A reply whose id has no pending entry is a
//! protocol violation: it is logged, counted and dropped. When the transport
//! closes every pending future resolves to [`RpcError::Disconnected`].

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use log::{debug, error, info, warn};
use sliceview_common::{FromRemote, Handshake, RpcCall, RpcReply, PROTOCOL_VERSION};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::{oneshot, watch};

use super::transport::Endpoint;
use crate::domain::RpcError;

/// Link state as seen by the caller
#[derive(Debug, Clone, PartialEq, Eq)]
enum Link {
    /// Waiting for the remote's handshake
    Connecting,
    Ready(Handshake),
    Closed,
}

/// Outstanding calls keyed by request id
struct PendingTable<Resp> {
    next_request_id: u32,
    waiting: HashMap<u32, oneshot::Sender<Resp>>,
}

impl<Resp> PendingTable<Resp> {
    /// Next id not held by an outstanding call (wraps at `u32::MAX`)
    fn allocate(&mut self) -> u32 {
        loop {
            let id = self.next_request_id;
            self.next_request_id = self.next_request_id.wrapping_add(1);
            if !self.waiting.contains_key(&id) {
                return id;
            }
        }
    }
}

/// State shared between the channel handles and the receive loop.
///
/// The receive loop holds only this, never the outbound sender, so dropping
/// every [`RpcChannel`] closes the link.
struct Shared<Resp> {
    pending: Mutex<PendingTable<Resp>>,
    link: watch::Sender<Link>,
    protocol_violations: AtomicU64,
}

impl<Resp> Shared<Resp> {
    fn lock(&self) -> MutexGuard<'_, PendingTable<Resp>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn violation(&self) {
        self.protocol_violations.fetch_add(1, Ordering::Relaxed);
    }

    fn handle_message(&self, message: FromRemote<Resp>) -> Result<(), RpcError> {
        match message {
            FromRemote::Ready(handshake) => {
                let accepted = self.link.send_if_modified(|link| {
                    if *link == Link::Connecting {
                        *link = Link::Ready(handshake.clone());
                        true
                    } else {
                        false
                    }
                });
                if accepted {
                    info!(
                        "Remote ready: {} (protocol v{})",
                        handshake.engine, handshake.protocol_version
                    );
                } else {
                    warn!("Protocol violation: unexpected handshake from {}", handshake.engine);
                    self.violation();
                }
                Ok(())
            }
            FromRemote::Reply(RpcReply { request_id, result }) => {
                let resolver = self.lock().waiting.remove(&request_id);
                match resolver {
                    Some(resolver) => {
                        if resolver.send(result).is_err() {
                            debug!("Caller abandoned request {request_id} before its reply");
                        }
                        Ok(())
                    }
                    None => {
                        error!("Protocol violation: reply for unknown request id {request_id}");
                        self.violation();
                        Err(RpcError::UnknownRequest(request_id))
                    }
                }
            }
        }
    }

    fn close(&self) {
        self.link.send_replace(Link::Closed);
        let abandoned = std::mem::take(&mut self.lock().waiting);
        if !abandoned.is_empty() {
            warn!("RPC link closed with {} call(s) outstanding", abandoned.len());
        }
        // Dropping the resolvers fails every outstanding future
        drop(abandoned);
    }
}

/// Handle for issuing calls to a remote capability.
///
/// Cloning is cheap; clones share the pending table and the link state.
pub struct RpcChannel<Req, Resp> {
    outbound: UnboundedSender<RpcCall<Req>>,
    shared: Arc<Shared<Resp>>,
}

impl<Req, Resp> Clone for RpcChannel<Req, Resp> {
    fn clone(&self) -> Self {
        Self { outbound: self.outbound.clone(), shared: Arc::clone(&self.shared) }
    }
}

impl<Req, Resp> RpcChannel<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    /// Channel posting calls to `outbound`.
    ///
    /// Inbound messages must be fed through [`RpcChannel::handle_message`];
    /// [`RpcChannel::connect`] does that for an [`Endpoint`].
    #[must_use]
    pub fn new(outbound: UnboundedSender<RpcCall<Req>>) -> Self {
        let (link, _) = watch::channel(Link::Connecting);
        Self {
            outbound,
            shared: Arc::new(Shared {
                pending: Mutex::new(PendingTable { next_request_id: 0, waiting: HashMap::new() }),
                link,
                protocol_violations: AtomicU64::new(0),
            }),
        }
    }

    /// Channel over `endpoint`, with its receive loop spawned on the current
    /// tokio runtime.
    ///
    /// # Panics
    /// Panics if called outside a tokio runtime
    #[must_use]
    pub fn connect(endpoint: Endpoint<RpcCall<Req>, FromRemote<Resp>>) -> Self {
        let (outbound, mut inbound) = endpoint.split();
        let channel = Self::new(outbound);
        let shared = Arc::clone(&channel.shared);

        tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                // Violations are logged and counted inside
                let _ = shared.handle_message(message);
            }
            debug!("RPC transport closed");
            shared.close();
        });

        channel
    }

    /// Post `request` and return a future for its reply.
    ///
    /// The call is on the wire when this returns; awaiting the future only
    /// waits for the reply.
    ///
    /// # Errors
    /// Returns `RpcError::Disconnected` if the link is closed
    pub fn call(&self, request: Req) -> Result<ResponseFuture<Resp>, RpcError> {
        if *self.shared.link.borrow() == Link::Closed {
            return Err(RpcError::Disconnected);
        }

        let (resolver, reply) = oneshot::channel();
        let request_id = {
            let mut table = self.shared.lock();
            let id = table.allocate();
            table.waiting.insert(id, resolver);
            id
        };

        if self.outbound.send(RpcCall { request_id, request }).is_err() {
            self.shared.lock().waiting.remove(&request_id);
            return Err(RpcError::Disconnected);
        }

        Ok(ResponseFuture { request_id, reply })
    }

    /// Post `request` and wait for its reply
    ///
    /// # Errors
    /// Returns `RpcError::Disconnected` if the link closes first
    pub async fn request(&self, request: Req) -> Result<Resp, RpcError> {
        self.call(request)?.await
    }

    /// Route one inbound message to its waiting caller.
    ///
    /// # Errors
    /// Returns `RpcError::UnknownRequest` for a reply nobody is waiting for.
    /// The reply is dropped and the violation counted.
    pub fn handle_message(&self, message: FromRemote<Resp>) -> Result<(), RpcError> {
        self.shared.handle_message(message)
    }

    /// Wait for the remote's handshake.
    ///
    /// Resolves immediately if the handshake already arrived.
    ///
    /// # Errors
    /// - `RpcError::ProtocolMismatch` if the remote speaks another schema version
    /// - `RpcError::Disconnected` if the link closes before the handshake
    pub async fn ready(&self) -> Result<Handshake, RpcError> {
        let mut link = self.shared.link.subscribe();
        let state = link
            .wait_for(|state| *state != Link::Connecting)
            .await
            .map_err(|_| RpcError::Disconnected)?
            .clone();

        match state {
            Link::Ready(handshake) if handshake.protocol_version == PROTOCOL_VERSION => Ok(handshake),
            Link::Ready(handshake) => Err(RpcError::ProtocolMismatch {
                expected: PROTOCOL_VERSION,
                found: handshake.protocol_version,
            }),
            Link::Connecting | Link::Closed => Err(RpcError::Disconnected),
        }
    }

    /// Mark the link closed and fail every outstanding call
    pub fn close(&self) {
        self.shared.close();
    }

    /// Number of calls still waiting for a reply
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.shared.lock().waiting.len()
    }

    /// Inbound messages rejected as protocol violations so far
    #[must_use]
    pub fn protocol_violations(&self) -> u64 {
        self.shared.protocol_violations.load(Ordering::Relaxed)
    }
}

/// Reply to one call, resolving to `Err(Disconnected)` if the link closes
/// before the reply arrives.
#[derive(Debug)]
pub struct ResponseFuture<Resp> {
    request_id: u32,
    reply: oneshot::Receiver<Resp>,
}

impl<Resp> ResponseFuture<Resp> {
    /// Correlation id of the underlying call
    #[must_use]
    pub fn request_id(&self) -> u32 {
        self.request_id
    }
}

impl<Resp> Future for ResponseFuture<Resp> {
    type Output = Result<Resp, RpcError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        Pin::new(&mut this.reply).poll(cx).map(|r| r.map_err(|_| RpcError::Disconnected))
    }
}
