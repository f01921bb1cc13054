//! Message transports for the RPC bridge
//!
//! A transport delivers whole messages in order and nothing more: it knows
//! nothing about requests, replies or their pairing. Both flavors hand out the
//! same [`Endpoint`], so the RPC layers never see which one they run on.
//!
//! - [`in_memory`] - a connected pair of tokio channels (engine on a task)
//! - [`json_lines`] - one JSON message per line over any async byte stream
//!   (engine in a child process, on a pipe or a socket)

use log::{debug, error, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

use crate::domain::RpcError;

/// One side of a bidirectional, ordered message link
pub struct Endpoint<Out, In> {
    outbound: UnboundedSender<Out>,
    inbound: UnboundedReceiver<In>,
}

impl<Out, In> Endpoint<Out, In> {
    /// Post a message without waiting for the peer
    ///
    /// # Errors
    /// Returns `RpcError::Disconnected` if the peer has gone away
    pub fn post(&self, message: Out) -> Result<(), RpcError> {
        self.outbound.send(message).map_err(|_| RpcError::Disconnected)
    }

    /// Next message from the peer, or `None` once the peer is gone
    pub async fn recv(&mut self) -> Option<In> {
        self.inbound.recv().await
    }

    /// Separate the sending and receiving halves
    #[must_use]
    pub fn split(self) -> (UnboundedSender<Out>, UnboundedReceiver<In>) {
        (self.outbound, self.inbound)
    }
}

/// A connected pair of in-process endpoints
#[must_use]
pub fn in_memory<A, B>() -> (Endpoint<A, B>, Endpoint<B, A>) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (Endpoint { outbound: a_tx, inbound: b_rx }, Endpoint { outbound: b_tx, inbound: a_rx })
}

/// Endpoint speaking newline-delimited JSON over an async byte stream.
///
/// Spawns a reader and a writer task on the current tokio runtime. Lines that
/// fail to decode are logged as protocol violations and skipped; the inbound
/// side closes at end of stream or on an I/O error.
///
/// The returned handle is the writer task. It finishes once the endpoint is
/// dropped and every posted message has been written, so awaiting it keeps
/// the last replies from being lost at shutdown.
///
/// # Panics
/// Panics if called outside a tokio runtime
pub fn json_lines<Out, In, R, W>(reader: R, writer: W) -> (Endpoint<Out, In>, JoinHandle<()>)
where
    Out: Serialize + Send + 'static,
    In: DeserializeOwned + Send + 'static,
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (out_tx, out_rx) = mpsc::unbounded_channel::<Out>();
    let (in_tx, in_rx) = mpsc::unbounded_channel::<In>();

    let flushed = tokio::spawn(write_lines(out_rx, writer));
    tokio::spawn(read_lines(reader, in_tx));

    (Endpoint { outbound: out_tx, inbound: in_rx }, flushed)
}

async fn write_lines<Out, W>(mut outbound: UnboundedReceiver<Out>, mut writer: W)
where
    Out: Serialize,
    W: AsyncWrite + Unpin,
{
    while let Some(message) = outbound.recv().await {
        let mut line = match serde_json::to_string(&message) {
            Ok(line) => line,
            Err(e) => {
                error!("Failed to encode outbound message: {e}");
                continue;
            }
        };
        line.push('\n');
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            warn!("Transport write failed: {e}");
            break;
        }
        if let Err(e) = writer.flush().await {
            warn!("Transport flush failed: {e}");
            break;
        }
    }
    debug!("JSON-lines writer finished");
}

async fn read_lines<In, R>(reader: R, inbound: UnboundedSender<In>)
where
    In: DeserializeOwned,
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<In>(&line) {
                    Ok(message) => {
                        if inbound.send(message).is_err() {
                            break;
                        }
                    }
                    Err(e) => error!("Protocol violation: undecodable message ({e}): {line}"),
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("Transport read failed: {e}");
                break;
            }
        }
    }
    debug!("JSON-lines reader finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Ping(u32);

    #[tokio::test]
    async fn test_in_memory_preserves_order() {
        let (left, mut right) = in_memory::<Ping, Ping>();
        for i in 0..5 {
            left.post(Ping(i)).unwrap();
        }
        for i in 0..5 {
            assert_eq!(right.recv().await, Some(Ping(i)));
        }
    }

    #[tokio::test]
    async fn test_in_memory_reports_disconnect() {
        let (left, right) = in_memory::<Ping, Ping>();
        drop(right);
        assert_eq!(left.post(Ping(1)), Err(RpcError::Disconnected));
    }

    #[tokio::test]
    async fn test_json_lines_round_trip() {
        let (a, b) = tokio::io::duplex(1024);
        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);

        let (left, _) = json_lines::<Ping, Ping, _, _>(a_read, a_write);
        let (mut right, _) = json_lines::<Ping, Ping, _, _>(b_read, b_write);

        left.post(Ping(7)).unwrap();
        left.post(Ping(8)).unwrap();
        assert_eq!(right.recv().await, Some(Ping(7)));
        assert_eq!(right.recv().await, Some(Ping(8)));
    }

    #[tokio::test]
    async fn test_json_lines_skips_garbage() {
        let (a, mut b) = tokio::io::duplex(1024);
        let (a_read, a_write) = tokio::io::split(a);
        let (mut endpoint, _) = json_lines::<Ping, Ping, _, _>(a_read, a_write);

        b.write_all(b"not json\n\n3\n").await.unwrap();
        assert_eq!(endpoint.recv().await, Some(Ping(3)));

        drop(b);
        assert_eq!(endpoint.recv().await, None);
    }

    #[tokio::test]
    async fn test_writer_drains_after_endpoint_dropped() {
        let (a, b) = tokio::io::duplex(1024);
        let (a_read, a_write) = tokio::io::split(a);
        let (endpoint, flushed) = json_lines::<Ping, Ping, _, _>(a_read, a_write);

        endpoint.post(Ping(1)).unwrap();
        endpoint.post(Ping(2)).unwrap();
        drop(endpoint);
        flushed.await.unwrap();

        let mut lines = BufReader::new(b).lines();
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("1"));
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("2"));
    }
}
