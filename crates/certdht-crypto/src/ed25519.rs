//! Ed25519 node signing keys.
//!
//! A node signs every outgoing request and every reply with the private key
//! that matches its certificate. Keys are stored on disk as PKCS#8 PEM and
//! wrapped here so the rest of the workspace never touches `ed25519-dalek`
//! directly.

use ed25519_dalek::pkcs8::{DecodePrivateKey, EncodePrivateKey};
use ed25519_dalek::{Signer, Verifier};
use zeroize::Zeroizing;

use crate::{CryptoError, Result};

/// Length of an Ed25519 signature in bytes.
pub const SIGNATURE_LEN: usize = 64;

/// The local node's private signing key.
pub struct NodeSigner {
    inner: ed25519_dalek::SigningKey,
}

/// An Ed25519 signature.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Signature {
    inner: ed25519_dalek::Signature,
}

impl NodeSigner {
    /// Generate a new random signing key.
    pub fn generate() -> Self {
        let mut csprng = rand::rngs::OsRng;
        Self {
            inner: ed25519_dalek::SigningKey::generate(&mut csprng),
        }
    }

    /// Decode a PKCS#8 PEM private key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKey`] if the PEM is malformed or does not
    /// hold an Ed25519 key.
    pub fn from_pkcs8_pem(pem: &str) -> Result<Self> {
        let inner = ed25519_dalek::SigningKey::from_pkcs8_pem(pem)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Ok(Self { inner })
    }

    /// Encode this key as PKCS#8 PEM.
    pub fn to_pkcs8_pem(&self) -> Result<Zeroizing<String>> {
        let pem = self
            .inner
            .to_pkcs8_pem(ed25519_dalek::pkcs8::spki::der::pem::LineEnding::LF)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Ok(Zeroizing::new(pem.as_str().to_owned()))
    }

    /// Raw bytes of the matching public key.
    pub fn public_key(&self) -> [u8; 32] {
        self.inner.verifying_key().to_bytes()
    }

    /// Sign a message.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Signing`] if the signing primitive fails.
    pub fn sign(&self, message: &[u8]) -> Result<Signature> {
        let inner = self
            .inner
            .try_sign(message)
            .map_err(|e| CryptoError::Signing(e.to_string()))?;
        Ok(Signature { inner })
    }
}

impl std::fmt::Debug for NodeSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeSigner")
            .field("public", &hex::encode(self.public_key()))
            .finish()
    }
}

impl Signature {
    /// Decode a signature received from the wire.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidInput`] unless exactly 64 bytes are given.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; SIGNATURE_LEN] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidInput(format!(
                "signature must be {SIGNATURE_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self {
            inner: ed25519_dalek::Signature::from_bytes(&arr),
        })
    }

    /// Raw signature bytes.
    pub fn to_bytes(&self) -> [u8; SIGNATURE_LEN] {
        self.inner.to_bytes()
    }

    /// Signature bytes as an owned vector, the form carried on the wire.
    pub fn to_vec(&self) -> Vec<u8> {
        self.to_bytes().to_vec()
    }
}

/// Verify `signature` over `message` under a raw Ed25519 public key.
///
/// # Errors
///
/// Returns [`CryptoError::InvalidInput`] for a malformed key or signature and
/// [`CryptoError::SignatureVerification`] if the signature does not match.
pub fn verify(public_key: &[u8; 32], message: &[u8], signature: &[u8]) -> Result<()> {
    let vk = ed25519_dalek::VerifyingKey::from_bytes(public_key)
        .map_err(|e| CryptoError::InvalidInput(e.to_string()))?;
    let sig = Signature::from_slice(signature)?;
    vk.verify(message, &sig.inner)
        .map_err(|_| CryptoError::SignatureVerification)
}
