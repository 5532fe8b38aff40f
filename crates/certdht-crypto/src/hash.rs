//! Hashing for identities and DHT keys.
//!
//! Two digests are in play:
//!
//! - [`fingerprint`] — SHA-256 over a certificate's DER encoding. The low 160
//!   bits become the node identifier ([`id_from_fingerprint`]).
//! - [`digest`] — SHA-1, the 160-bit key digest of the Kademlia key space.
//!
//! Certificates are published in the value store under the reserved key
//! [`certificate_key`], `digest(UPPER_HEX(id) + "cert")`.

use certdht_types::{NodeId, ID_LEN};
use sha1::Sha1;
use sha2::{Digest, Sha256};

/// Suffix appended to an identifier's hex form to build its certificate key.
pub const CERT_KEY_SUFFIX: &str = "cert";

/// SHA-256 of the input.
pub fn fingerprint(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Take the low 160 bits of a SHA-256 fingerprint.
pub fn id_from_fingerprint(fp: &[u8; 32]) -> NodeId {
    let mut out = [0u8; ID_LEN];
    out.copy_from_slice(&fp[32 - ID_LEN..]);
    NodeId::from_bytes(out)
}

/// 160-bit key digest (SHA-1) used to place values in the key space.
pub fn digest(data: &[u8]) -> NodeId {
    let out: [u8; ID_LEN] = Sha1::digest(data).into();
    NodeId::from_bytes(out)
}

/// The reserved value-store key under which `id`'s certificate is published.
pub fn certificate_key(id: &NodeId) -> NodeId {
    let mut input = id.to_hex();
    input.push_str(CERT_KEY_SUFFIX);
    digest(input.as_bytes())
}
