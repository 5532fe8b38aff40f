//! Datagram envelope.
//!
//! Each UDP datagram holds exactly one CBOR-encoded [`Envelope`]. Replies reuse
//! the request's `msg_id`, which is how the sender matches them to its pending
//! call.
//!
//! ## Wire format
//!
//! ```text
//! Envelope {
//!     version: u8,        // PROTOCOL_VERSION
//!     network: String,    // logical partition tag
//!     msg_id:  [u8; 16],  // random per request, echoed by the reply
//!     body:    Request | Response,
//! }
//! ```

use serde::{Deserialize, Serialize};

use crate::cbor;
use crate::messages::{Request, Response};
use crate::TransportError;

/// Current wire protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Largest payload a single UDP datagram can carry over IPv4.
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Request correlation id.
pub type MsgId = [u8; 16];

/// Either half of an exchange.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Body {
    Request(Request),
    Response(Response),
}

/// The datagram envelope.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Protocol version. Must be [`PROTOCOL_VERSION`].
    pub version: u8,
    /// Network partition tag. Datagrams from other partitions are ignored.
    pub network: String,
    /// Correlation id.
    pub msg_id: MsgId,
    pub body: Body,
}

impl Envelope {
    /// Wrap a request under a fresh random `msg_id`.
    pub fn request(network: &str, request: Request) -> Self {
        let mut msg_id = [0u8; 16];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut msg_id);
        Self {
            version: PROTOCOL_VERSION,
            network: network.to_string(),
            msg_id,
            body: Body::Request(request),
        }
    }

    /// Wrap a reply to the request identified by `msg_id`.
    pub fn response(network: &str, msg_id: MsgId, response: Response) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            network: network.to_string(),
            msg_id,
            body: Body::Response(response),
        }
    }

    /// Serialize for transmission.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ProtocolViolation`] if the encoding does not
    /// fit in one datagram.
    pub fn to_bytes(&self) -> Result<Vec<u8>, TransportError> {
        let bytes = cbor::to_vec(self)?;
        if bytes.len() > MAX_DATAGRAM_SIZE {
            return Err(TransportError::ProtocolViolation(format!(
                "datagram too large: {} bytes, max {MAX_DATAGRAM_SIZE}",
                bytes.len()
            )));
        }
        Ok(bytes)
    }

    /// Decode and validate a received datagram.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Deserialization`] for malformed CBOR and
    /// [`TransportError::ProtocolViolation`] for an unsupported version.
    pub fn from_bytes(data: &[u8]) -> Result<Self, TransportError> {
        let envelope: Self = cbor::from_slice(data)?;
        if envelope.version != PROTOCOL_VERSION {
            return Err(TransportError::ProtocolViolation(format!(
                "unsupported protocol version {}, expected {PROTOCOL_VERSION}",
                envelope.version
            )));
        }
        Ok(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::Call;
    use certdht_types::{NodeId, ID_LEN};

    fn ping() -> Request {
        Request {
            sender: NodeId::from_bytes([3; ID_LEN]),
            challenge: "00112233aabbccdd".into(),
            signature: vec![1; 64],
            call: Call::Ping { certificate: None },
        }
    }

    #[test]
    fn test_request_roundtrip_keeps_msg_id() {
        let env = Envelope::request("ALL", ping());
        let bytes = env.to_bytes().expect("encode");
        let back = Envelope::from_bytes(&bytes).expect("decode");
        assert_eq!(back, env);
        assert_eq!(back.network, "ALL");
    }

    #[test]
    fn test_response_echoes_msg_id() {
        let req = Envelope::request("ALL", ping());
        let resp = Envelope::response(
            "ALL",
            req.msg_id,
            Response::Stored {
                signature: vec![2; 64],
            },
        );
        assert_eq!(resp.msg_id, req.msg_id);
    }

    #[test]
    fn test_msg_id_is_random() {
        let a = Envelope::request("ALL", ping());
        let b = Envelope::request("ALL", ping());
        assert_ne!(a.msg_id, b.msg_id);
    }

    #[test]
    fn test_invalid_version_rejected() {
        let mut env = Envelope::request("ALL", ping());
        env.version = 99;
        let bytes = cbor::to_vec(&env).expect("encode");
        assert!(matches!(
            Envelope::from_bytes(&bytes),
            Err(TransportError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_oversized_datagram_rejected() {
        let mut req = ping();
        req.call = Call::Store {
            key: NodeId::from_bytes([0; ID_LEN]),
            value: vec![0u8; MAX_DATAGRAM_SIZE],
        };
        let env = Envelope::request("ALL", req);
        assert!(env.to_bytes().is_err());
    }
}
