//! Node identifiers and contact records.
//!
//! Identifiers are rendered as upper-case hex everywhere they appear in logs,
//! file names, and signed payloads, so [`NodeId::to_hex`] is the single place
//! that decides the textual form.

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use serde_with::serde_as;

use crate::{Result, TypesError, ID_LEN};

/// XOR distance between two identifiers, compared lexicographically.
pub type Distance = [u8; ID_LEN];

/// A 160-bit routing identifier.
#[serde_as]
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(#[serde_as(as = "serde_with::Bytes")] [u8; ID_LEN]);

impl NodeId {
    /// Wrap raw identifier bytes.
    pub const fn from_bytes(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Build an identifier from a slice, which must be exactly [`ID_LEN`] bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; ID_LEN] = bytes.try_into().map_err(|_| TypesError::InvalidLength {
            expected: ID_LEN,
            actual: bytes.len(),
        })?;
        Ok(Self(arr))
    }

    /// Parse an identifier from hex (either case).
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| TypesError::InvalidHex(e.to_string()))?;
        Self::from_slice(&bytes)
    }

    /// The raw identifier bytes.
    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    /// Upper-case hex rendering.
    pub fn to_hex(&self) -> String {
        hex::encode_upper(self.0)
    }

    /// XOR distance to another identifier.
    pub fn distance(&self, other: &NodeId) -> Distance {
        let mut out = [0u8; ID_LEN];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.to_hex())
    }
}

impl From<[u8; ID_LEN]> for NodeId {
    fn from(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }
}

/// A routing contact: identifier plus the address it was last reached on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// The node's 160-bit identifier.
    pub node_id: NodeId,
    /// The node's network address.
    #[serde(with = "socket_addr_serde")]
    pub addr: SocketAddr,
}

impl NodeInfo {
    /// Create a contact record.
    pub fn new(node_id: NodeId, addr: SocketAddr) -> Self {
        Self { node_id, addr }
    }

    /// XOR distance from this node to `target`.
    pub fn distance_to(&self, target: &NodeId) -> Distance {
        self.node_id.distance(target)
    }
}

impl fmt::Display for NodeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.node_id, self.addr)
    }
}

/// Serde support for `SocketAddr` as a string.
pub mod socket_addr_serde {
    use std::net::SocketAddr;

    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_is_upper_case() {
        let id = NodeId::from_bytes([0xab; ID_LEN]);
        assert_eq!(id.to_hex(), "AB".repeat(ID_LEN));
        assert_eq!(id.to_string(), id.to_hex());
    }

    #[test]
    fn test_from_hex_accepts_either_case() {
        let id = NodeId::from_bytes([0x5c; ID_LEN]);
        assert_eq!(NodeId::from_hex(&id.to_hex()).expect("upper"), id);
        assert_eq!(
            NodeId::from_hex(&id.to_hex().to_lowercase()).expect("lower"),
            id
        );
    }

    #[test]
    fn test_from_slice_wrong_length() {
        let err = NodeId::from_slice(&[0u8; 19]).expect_err("too short");
        assert!(matches!(
            err,
            TypesError::InvalidLength {
                expected: 20,
                actual: 19
            }
        ));
        assert!(NodeId::from_hex("zz").is_err());
    }

    #[test]
    fn test_distance_is_symmetric_and_zero_to_self() {
        let a = NodeId::from_bytes([0x0f; ID_LEN]);
        let b = NodeId::from_bytes([0xf0; ID_LEN]);
        assert_eq!(a.distance(&b), [0xff; ID_LEN]);
        assert_eq!(a.distance(&b), b.distance(&a));
        assert_eq!(a.distance(&a), [0u8; ID_LEN]);
    }

    #[test]
    fn test_node_info_cbor_roundtrip() {
        let info = NodeInfo::new(
            NodeId::from_bytes([7; ID_LEN]),
            "10.0.0.7:5000".parse().expect("addr"),
        );
        let mut buf = Vec::new();
        ciborium::into_writer(&info, &mut buf).expect("encode");
        let back: NodeInfo = ciborium::from_reader(buf.as_slice()).expect("decode");
        assert_eq!(back, info);
    }
}
