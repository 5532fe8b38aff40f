//! X.509 node certificates and the trusted-root set.
//!
//! A node's identifier is bound to its certificate:
//!
//! ```text
//! node_id = low_160_bits( SHA-256( DER(certificate) ) )
//! ```
//!
//! so the identifier can be recomputed by anyone holding the certificate.
//! Certificates travel as PEM text; only the first `CERTIFICATE` block of a
//! PEM input is used, and [`Certificate::to_pem`] always re-emits the same
//! canonical encoding for the same DER bytes.
//!
//! Chain validation is a single hop: a node certificate is accepted when one of
//! the configured roots is its issuer, the issuer's signature checks out, and
//! both certificates are inside their validity windows.

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use certdht_types::NodeId;
use x509_parser::certificate::X509Certificate;
use x509_parser::pem::Pem;

use crate::hash::{fingerprint, id_from_fingerprint};
use crate::{CryptoError, Result};

/// Object identifier of the Ed25519 signature algorithm (RFC 8410).
const ED25519_OID: &str = "1.3.101.112";

const PEM_LABEL: &str = "CERTIFICATE";

/// A parsed node certificate carrying an Ed25519 public key.
#[derive(Clone, PartialEq, Eq)]
pub struct Certificate {
    der: Vec<u8>,
    node_id: NodeId,
    public_key: [u8; 32],
}

impl Certificate {
    /// Parse the first `CERTIFICATE` block of a PEM document.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidCertificate`] if no certificate block is
    /// present, the DER does not parse, or the subject key is not Ed25519.
    pub fn from_pem(pem: &str) -> Result<Self> {
        let der = first_certificate_block(pem)?
            .ok_or_else(|| CryptoError::InvalidCertificate("no CERTIFICATE block".into()))?;
        Self::from_der(der)
    }

    /// Parse a DER-encoded certificate.
    pub fn from_der(der: Vec<u8>) -> Result<Self> {
        let public_key = {
            let x509 = parse(&der)?;
            let spki = x509.public_key();
            if spki.algorithm.algorithm.to_id_string() != ED25519_OID {
                return Err(CryptoError::InvalidCertificate(format!(
                    "subject key algorithm {} is not Ed25519",
                    spki.algorithm.algorithm.to_id_string()
                )));
            }
            let raw: &[u8] = spki.subject_public_key.data.as_ref();
            let key: [u8; 32] = raw.try_into().map_err(|_| {
                CryptoError::InvalidCertificate(format!(
                    "Ed25519 key must be 32 bytes, got {}",
                    raw.len()
                ))
            })?;
            key
        };
        let node_id = derive_id(&der);
        Ok(Self {
            der,
            node_id,
            public_key,
        })
    }

    /// The identifier derived from this certificate's fingerprint.
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// DER encoding.
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// The subject's Ed25519 public key.
    pub fn public_key(&self) -> &[u8; 32] {
        &self.public_key
    }

    /// Canonical PEM encoding (64-column base64, LF line endings).
    pub fn to_pem(&self) -> String {
        let body = STANDARD.encode(&self.der);
        let mut out = String::with_capacity(body.len() + body.len() / 64 + 64);
        out.push_str("-----BEGIN CERTIFICATE-----\n");
        for line in body.as_bytes().chunks(64) {
            out.push_str(&String::from_utf8_lossy(line));
            out.push('\n');
        }
        out.push_str("-----END CERTIFICATE-----\n");
        out
    }

    /// Verify a signature made by this certificate's subject key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::SignatureVerification`] on mismatch and
    /// [`CryptoError::InvalidInput`] on a malformed signature.
    pub fn verify_signature(&self, message: &[u8], signature: &[u8]) -> Result<()> {
        crate::ed25519::verify(&self.public_key, message, signature)
    }
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("node_id", &self.node_id)
            .field("der_len", &self.der.len())
            .finish()
    }
}

/// Derive the routing identifier for a DER-encoded certificate.
pub fn derive_id(der: &[u8]) -> NodeId {
    id_from_fingerprint(&fingerprint(der))
}

/// The set of CA certificates a node accepts as issuers.
///
/// Roots may use any key algorithm `x509-parser` can verify; only node
/// certificates are restricted to Ed25519.
#[derive(Clone, Debug, Default)]
pub struct TrustedRoots {
    roots: Vec<Vec<u8>>,
}

impl TrustedRoots {
    /// An empty root set. Nothing verifies against it.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every `CERTIFICATE` block of a PEM bundle.
    ///
    /// # Errors
    ///
    /// Fails if the bundle holds no certificates or any block does not parse.
    pub fn from_pem_bundle(pem: &str) -> Result<Self> {
        let mut roots = Self::new();
        for block in Pem::iter_from_buffer(pem.as_bytes()) {
            let block = block.map_err(|e| CryptoError::InvalidCertificate(e.to_string()))?;
            if block.label == PEM_LABEL {
                roots.add_der(block.contents)?;
            }
        }
        if roots.is_empty() {
            return Err(CryptoError::InvalidCertificate(
                "trusted root bundle holds no certificates".into(),
            ));
        }
        Ok(roots)
    }

    /// Add a DER-encoded root.
    pub fn add_der(&mut self, der: Vec<u8>) -> Result<()> {
        parse(&der)?;
        self.roots.push(der);
        Ok(())
    }

    /// Number of configured roots.
    pub fn len(&self) -> usize {
        self.roots.len()
    }

    /// Whether no roots are configured.
    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// Check that `cert` was issued by one of the configured roots and that
    /// both are currently valid.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::UntrustedCertificate`] if no root vouches for the
    /// certificate.
    pub fn verify(&self, cert: &Certificate) -> Result<()> {
        let leaf = parse(cert.der())?;
        if !leaf.validity().is_valid() {
            return Err(CryptoError::UntrustedCertificate(format!(
                "certificate for {} is outside its validity window",
                cert.node_id()
            )));
        }

        for root_der in &self.roots {
            let Ok(root) = parse(root_der) else {
                continue;
            };
            if root.subject().as_raw() != leaf.issuer().as_raw() {
                continue;
            }
            if !root.validity().is_valid() {
                continue;
            }
            if leaf.verify_signature(Some(root.public_key())).is_ok() {
                return Ok(());
            }
        }

        Err(CryptoError::UntrustedCertificate(format!(
            "no trusted root issued the certificate for {}",
            cert.node_id()
        )))
    }
}

fn parse(der: &[u8]) -> Result<X509Certificate<'_>> {
    let (_, cert) = x509_parser::parse_x509_certificate(der)
        .map_err(|e| CryptoError::InvalidCertificate(e.to_string()))?;
    Ok(cert)
}

fn first_certificate_block(pem: &str) -> Result<Option<Vec<u8>>> {
    for block in Pem::iter_from_buffer(pem.as_bytes()) {
        let block = block.map_err(|e| CryptoError::InvalidCertificate(e.to_string()))?;
        if block.label == PEM_LABEL {
            return Ok(Some(block.contents));
        }
    }
    Ok(None)
}
