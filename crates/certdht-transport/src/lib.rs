//! # certdht-transport
//!
//! Request/response datagram transport for the certdht overlay.
//!
//! The DHT layer talks to peers through the [`Transport`] trait: send one
//! [`Request`] to an address and await the matching [`Response`], or fail with
//! [`TransportError::Timeout`]. Inbound requests arrive on a channel as
//! [`InboundRequest`] values; the handler answers through the attached
//! one-shot sender, and answering `None` drops the request without a reply.
//!
//! - [`udp`] — the production transport: one UDP socket, CBOR datagrams,
//!   a pending-request table keyed by message id
//! - [`memory`] — an in-process network of transports for tests
//! - [`wire`] — the datagram envelope
//! - [`messages`] — RPC payloads
//! - [`cbor`] — codec helpers
//!
//! ## Architecture
//!
//! ```text
//! DHT protocol layer
//!     |  Transport::send(addr, Request) -> Response
//!     v
//! Envelope (wire.rs)   -- version, network tag, msg_id, body
//!     |
//!     v
//! UdpTransport (udp.rs) / MemoryTransport (memory.rs)
//! ```

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::oneshot;

pub mod cbor;
pub mod memory;
pub mod messages;
pub mod udp;
pub mod wire;

pub use memory::{MemoryNetwork, MemoryTransport};
pub use messages::{Call, Request, Response, Value};
pub use udp::UdpTransport;

/// Error types for transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// CBOR serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// CBOR deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Protocol violation (version mismatch, oversized datagram).
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// No reply arrived before the deadline.
    #[error("request to {0} timed out")]
    Timeout(SocketAddr),

    /// Nothing is listening at the address.
    #[error("peer {0} is unreachable")]
    Unreachable(SocketAddr),

    /// Socket I/O error.
    #[error("I/O error: {0}")]
    Io(String),

    /// The transport has shut down.
    #[error("transport closed")]
    Closed,
}

/// Result type alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// A request received from a peer, awaiting an answer.
#[derive(Debug)]
pub struct InboundRequest {
    /// Source address of the datagram.
    pub from: SocketAddr,
    pub request: Request,
    /// Answer channel. `None` means "send nothing back".
    pub reply: oneshot::Sender<Option<Response>>,
}

impl InboundRequest {
    /// Answer the request. A receiver that has gone away is ignored.
    pub fn respond(self, response: Option<Response>) {
        let _ = self.reply.send(response);
    }
}

/// Request/response messaging between peers.
///
/// Implementors carry the network I/O; the DHT layer never touches sockets
/// directly, which is what lets the whole protocol run over [`MemoryNetwork`]
/// in tests.
pub trait Transport: Send + Sync + 'static {
    /// The address peers use to reach this node.
    fn local_addr(&self) -> SocketAddr;

    /// Whether the transport can carry traffic yet.
    fn is_ready(&self) -> bool {
        true
    }

    /// Send `request` to `addr` and wait up to `timeout` for the reply.
    ///
    /// A peer that chooses not to answer is indistinguishable from a lost
    /// datagram: both surface as [`TransportError::Timeout`].
    fn send(
        &self,
        addr: SocketAddr,
        request: Request,
        timeout: Duration,
    ) -> impl Future<Output = Result<Response>> + Send;
}
