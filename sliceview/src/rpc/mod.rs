//! RPC bridge between the caller side and a remote capability
//!
//! - [`transport`] - ordered message delivery (in-memory or JSON lines)
//! - [`channel`] - request ids, reply correlation, handshake wait
//! - [`server`] - serving a [`Capability`] over an endpoint

pub mod channel;
pub mod server;
pub mod transport;

pub use channel::{ResponseFuture, RpcChannel};
pub use server::{serve, spawn_in_memory, CallerEndpoint, Capability, ServerEndpoint};
pub use transport::{in_memory, json_lines, Endpoint};
