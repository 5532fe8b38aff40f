//! # certdht-crypto
//!
//! Cryptographic primitives for the certdht overlay.
//!
//! Every node owns an Ed25519 key pair and an X.509 certificate for that key,
//! issued by a CA the rest of the network trusts. The node's routing identity
//! is derived from the certificate fingerprint, so a node cannot claim an
//! identifier without also presenting the matching certificate.
//!
//! ## Modules
//!
//! - [`hash`] — SHA-256 fingerprints and SHA-1 160-bit DHT key digests
//! - [`ed25519`] — Node signing keys (PKCS#8 PEM) and signatures
//! - [`certificate`] — X.509 parsing, trusted-root verification, id derivation
//! - [`challenge`] — Random single-use challenges for authenticated RPCs
//! - `fixtures` — Throwaway CA and node certificates (feature `test-util`)

pub mod certificate;
pub mod challenge;
pub mod ed25519;
#[cfg(any(test, feature = "test-util"))]
pub mod fixtures;
pub mod hash;

pub use certificate::{Certificate, TrustedRoots};
pub use challenge::Challenge;
pub use ed25519::{NodeSigner, Signature};

/// Error types for cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// Ed25519 signature verification failed.
    #[error("signature verification failed")]
    SignatureVerification,

    /// The signing primitive refused to produce a signature.
    #[error("signing failed: {0}")]
    Signing(String),

    /// The private key could not be decoded.
    #[error("invalid private key: {0}")]
    InvalidKey(String),

    /// The certificate could not be decoded or uses an unsupported key type.
    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),

    /// The certificate does not chain to any configured trusted root, or is
    /// outside its validity window.
    #[error("untrusted certificate: {0}")]
    UntrustedCertificate(String),

    /// Invalid input data.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

pub type Result<T> = std::result::Result<T, CryptoError>;
