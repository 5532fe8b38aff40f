//! RPC payloads exchanged between certdht nodes.
//!
//! Every request carries the sender's claimed identifier, a fresh challenge,
//! and the sender's signature over `UPPER_HEX(recipient_id) + challenge`.
//! Every reply carries the responder's signature over the challenge alone.
//!
//! | Call | Success reply | Other replies |
//! |------|---------------|---------------|
//! | `Ping` | [`Response::Pong`] | [`Response::Nack`] |
//! | `FindNode` | [`Response::Bucket`] | [`Response::Nack`] |
//! | `FindValue` | [`Response::Value`] | [`Response::Bucket`] on miss, [`Response::Nack`] |
//! | `Store` | [`Response::Stored`] | [`Response::Nack`] |
//! | `Append` | [`Response::Stored`] | [`Response::Nack`] |
//!
//! A request that fails verification gets no reply at all.

use certdht_types::{NodeId, NodeInfo};
use serde::{Deserialize, Serialize};
use serde_with::serde_as;

/// A signed request.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// Identifier the sender claims.
    pub sender: NodeId,
    /// Hex challenge chosen by the sender.
    pub challenge: String,
    /// Sender's signature over `UPPER_HEX(recipient_id) + challenge`.
    #[serde_as(as = "serde_with::Bytes")]
    pub signature: Vec<u8>,
    /// Operation-specific arguments.
    pub call: Call,
}

/// The operation a [`Request`] asks for.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Call {
    /// Liveness and identity check. May carry the sender's certificate (PEM).
    Ping { certificate: Option<String> },
    /// Ask for the contacts closest to `key`.
    FindNode { key: NodeId },
    /// Ask for the value under `key`. May carry the sender's certificate.
    FindValue {
        key: NodeId,
        certificate: Option<String>,
    },
    /// Overwrite `key` with `value`.
    Store {
        key: NodeId,
        #[serde_as(as = "serde_with::Bytes")]
        value: Vec<u8>,
    },
    /// Merge `values` into the set held under `key`.
    Append {
        key: NodeId,
        #[serde_as(as = "Vec<serde_with::Bytes>")]
        values: Vec<Vec<u8>>,
    },
}

impl Call {
    /// Short operation name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Call::Ping { .. } => "ping",
            Call::FindNode { .. } => "find_node",
            Call::FindValue { .. } => "find_value",
            Call::Store { .. } => "store",
            Call::Append { .. } => "append",
        }
    }

    /// The inline certificate, for the calls that may carry one.
    pub fn certificate(&self) -> Option<&str> {
        match self {
            Call::Ping { certificate } | Call::FindValue { certificate, .. } => {
                certificate.as_deref()
            }
            _ => None,
        }
    }
}

/// A value held in the store: either a single blob or a set of blobs.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    Blob(#[serde_as(as = "serde_with::Bytes")] Vec<u8>),
    Set(#[serde_as(as = "Vec<serde_with::Bytes>")] Vec<Vec<u8>>),
}

/// A signed reply. `signature` always covers the request's challenge.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    /// The responder holds no certificate for the sender. The signature proves
    /// the responder's identity so the sender can retry with its certificate.
    Nack {
        #[serde_as(as = "serde_with::Bytes")]
        signature: Vec<u8>,
    },
    /// Reply to `Ping`.
    Pong {
        id: NodeId,
        #[serde_as(as = "serde_with::Bytes")]
        signature: Vec<u8>,
    },
    /// Closest known contacts.
    Bucket {
        bucket: Vec<NodeInfo>,
        #[serde_as(as = "serde_with::Bytes")]
        signature: Vec<u8>,
    },
    /// A value hit.
    Value {
        value: Value,
        #[serde_as(as = "serde_with::Bytes")]
        signature: Vec<u8>,
    },
    /// Acknowledges `Store` and `Append`.
    Stored {
        #[serde_as(as = "serde_with::Bytes")]
        signature: Vec<u8>,
    },
}

impl Response {
    pub fn signature(&self) -> &[u8] {
        match self {
            Response::Nack { signature }
            | Response::Pong { signature, .. }
            | Response::Bucket { signature, .. }
            | Response::Value { signature, .. }
            | Response::Stored { signature } => signature,
        }
    }

    pub fn is_nack(&self) -> bool {
        matches!(self, Response::Nack { .. })
    }

    /// Short reply name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Response::Nack { .. } => "nack",
            Response::Pong { .. } => "pong",
            Response::Bucket { .. } => "bucket",
            Response::Value { .. } => "value",
            Response::Stored { .. } => "stored",
        }
    }
}
