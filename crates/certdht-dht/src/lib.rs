//! # certdht-dht
//!
//! Kademlia distributed hash table in which every RPC is bound to a
//! certificate-verified node identity.
//!
//! This crate implements:
//! - Kademlia routing table with XOR-distance metric (160 buckets, k and
//!   alpha configurable)
//! - Value store with expiry, set-valued keys, and pinned certificate entries
//! - A trust store of CA-verified peer certificates, backed by the DHT value
//!   store and an on-disk directory
//! - Challenge-response authentication of every request and reply
//! - Key transfer to newly joined peers, bootstrap, and periodic refresh
//! - Adversarial handler strategies used to exercise the above
//!
//! ## Key Parameters
//!
//! | Parameter | Default |
//! |---|---|
//! | k (bucket size) | 20 |
//! | alpha (lookup parallelism) | 3 |
//! | RPC timeout | 5 seconds |
//! | Refresh interval | 1 hour |
//! | Node ID derivation | `SHA-256(certificate DER)[12..32]` |
//! | Key derivation | `SHA-1(key bytes)` |
//!
//! ## Module map
//!
//! ```text
//! bootstrap ──> crawl ──> protocol ──> auth ──> trust ──> pki
//!                  │          │                   │
//!                  │          ├──> kademlia       └──> storage
//!                  │          └──> adversary
//! membership <─────┘ (events from protocol)
//! ```

pub mod adversary;
pub mod auth;
pub mod bootstrap;
pub mod config;
pub mod crawl;
pub mod kademlia;
pub mod membership;
pub mod node;
pub mod pki;
pub mod protocol;
pub mod storage;
pub mod trust;

use std::fmt;

use certdht_crypto::CryptoError;
use certdht_transport::TransportError;
use certdht_types::NodeId;

pub use config::DhtConfig;
pub use node::DhtNode;

/// Number of buckets in the routing table (one per bit of the 160-bit id space).
pub const NUM_BUCKETS: usize = 160;

/// Error types for DHT operations.
#[derive(Debug, thiserror::Error)]
pub enum DhtError {
    /// The local key could not produce a signature. The RPC is not sent.
    #[error("signing failed: {0}")]
    Signing(String),

    /// A signature or certificate did not check out.
    #[error("verification failed: {0}")]
    VerificationFailure(String),

    /// A certificate does not chain to a trusted root.
    #[error("certificate untrusted: {0}")]
    CertificateUntrusted(String),

    /// The peer did not answer in time or answered with something unusable.
    #[error("peer unresponsive: {0}")]
    PeerUnresponsive(String),

    /// The peer has no certificate for us.
    #[error("peer {peer} answered NACK")]
    ProtocolNack { peer: NodeId },

    /// Routing table misuse.
    #[error("routing error: {0}")]
    Routing(String),

    /// Transport error from certdht-transport.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Cryptographic error from certdht-crypto.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Key material or certificate directory problem.
    #[error("pki error: {0}")]
    Pki(String),

    /// Bootstrap could not authenticate the seed.
    #[error("bootstrap failed: {0}")]
    BootstrapFailed(String),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Convenience result type for DHT operations.
pub type Result<T> = std::result::Result<T, DhtError>;

/// Failure classes every suppressed error is logged under.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    SigningError,
    VerificationFailure,
    CertificateUntrusted,
    PeerUnresponsive,
    ProtocolNack,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::SigningError => "signing_error",
            ErrorKind::VerificationFailure => "verification_failure",
            ErrorKind::CertificateUntrusted => "certificate_untrusted",
            ErrorKind::PeerUnresponsive => "peer_unresponsive",
            ErrorKind::ProtocolNack => "protocol_nack",
            ErrorKind::Internal => "internal",
        };
        f.write_str(name)
    }
}

impl DhtError {
    /// The failure class this error is reported under.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DhtError::Signing(_) => ErrorKind::SigningError,
            DhtError::VerificationFailure(_) => ErrorKind::VerificationFailure,
            DhtError::CertificateUntrusted(_) => ErrorKind::CertificateUntrusted,
            DhtError::PeerUnresponsive(_) => ErrorKind::PeerUnresponsive,
            DhtError::ProtocolNack { .. } => ErrorKind::ProtocolNack,
            DhtError::Transport(TransportError::Timeout(_))
            | DhtError::Transport(TransportError::Unreachable(_))
            | DhtError::Transport(TransportError::Closed) => ErrorKind::PeerUnresponsive,
            DhtError::Crypto(CryptoError::Signing(_)) => ErrorKind::SigningError,
            DhtError::Crypto(CryptoError::UntrustedCertificate(_)) => {
                ErrorKind::CertificateUntrusted
            }
            DhtError::Crypto(CryptoError::SignatureVerification)
            | DhtError::Crypto(CryptoError::InvalidCertificate(_)) => {
                ErrorKind::VerificationFailure
            }
            DhtError::BootstrapFailed(_) => ErrorKind::PeerUnresponsive,
            _ => ErrorKind::Internal,
        }
    }
}
