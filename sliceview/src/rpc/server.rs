//! Remote side of the RPC bridge
//!
//! A [`Capability`] is whatever object the remote exposes. [`serve`] announces
//! it with a handshake, then answers every call with a reply carrying the
//! call's request id.

use std::future::Future;

use log::{debug, info};
use sliceview_common::{FromRemote, Handshake, RpcCall, RpcReply};

use super::transport::{self, Endpoint};
use crate::domain::RpcError;

/// An object served over the RPC bridge
pub trait Capability: Send + 'static {
    type Request: Send + 'static;
    type Response: Send + 'static;

    /// Identification sent to the caller before any reply
    fn handshake(&self) -> Handshake;

    /// Answer one call. Failures are expressed in `Self::Response`.
    fn handle(&mut self, request: Self::Request) -> impl Future<Output = Self::Response> + Send;
}

/// Caller-facing endpoint type for a capability
pub type CallerEndpoint<C> = Endpoint<
    RpcCall<<C as Capability>::Request>,
    FromRemote<<C as Capability>::Response>,
>;

/// Serving-side endpoint type for a capability
pub type ServerEndpoint<C> = Endpoint<
    FromRemote<<C as Capability>::Response>,
    RpcCall<<C as Capability>::Request>,
>;

/// Serve `capability` until the caller goes away.
///
/// Posts the handshake first, then handles calls one at a time in arrival
/// order.
///
/// # Errors
/// Returns `RpcError::Disconnected` if the handshake cannot be posted
pub async fn serve<C: Capability>(mut capability: C, mut endpoint: ServerEndpoint<C>) -> Result<(), RpcError> {
    let handshake = capability.handshake();
    info!("Serving {} (protocol v{})", handshake.engine, handshake.protocol_version);
    endpoint.post(FromRemote::Ready(handshake))?;

    while let Some(RpcCall { request_id, request }) = endpoint.recv().await {
        let result = capability.handle(request).await;
        if endpoint.post(FromRemote::Reply(RpcReply { request_id, result })).is_err() {
            debug!("Caller went away before reply {request_id}");
            break;
        }
    }

    debug!("Caller closed the link, server stopping");
    Ok(())
}

/// Run `capability` on a tokio task and return the caller's end of an
/// in-memory link to it.
///
/// # Panics
/// Panics if called outside a tokio runtime
pub fn spawn_in_memory<C: Capability>(capability: C) -> CallerEndpoint<C> {
    let (caller, server) = transport::in_memory();
    tokio::spawn(async move {
        if let Err(e) = serve(capability, server).await {
            debug!("In-memory server ended: {e}");
        }
    });
    caller
}
