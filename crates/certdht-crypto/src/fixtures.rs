//! Throwaway PKI for tests.
//!
//! [`TestCa`] mints a self-signed Ed25519 CA and issues node certificates
//! under it. Each issued node gets a fresh key pair, so every call to
//! [`TestCa::issue`] yields a distinct identifier.

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue, IsCa, KeyPair,
};
use zeroize::Zeroizing;

use crate::{Certificate, CryptoError, NodeSigner, Result, TrustedRoots};

/// A self-signed certificate authority.
pub struct TestCa {
    key: KeyPair,
    cert: rcgen::Certificate,
    pem: String,
}

/// Everything a test node needs to join a network rooted at a [`TestCa`].
pub struct NodeCredentials {
    pub certificate_pem: String,
    pub private_key_pem: Zeroizing<String>,
    pub certificate: Certificate,
    pub signer: NodeSigner,
}

fn pki_err(e: rcgen::Error) -> CryptoError {
    CryptoError::InvalidCertificate(e.to_string())
}

fn params_for(common_name: &str) -> Result<CertificateParams> {
    let mut params = CertificateParams::new(Vec::<String>::new()).map_err(pki_err)?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, DnValue::Utf8String(common_name.to_string()));
    params.distinguished_name = dn;
    Ok(params)
}

impl TestCa {
    /// Create a CA with the given common name.
    pub fn new(common_name: &str) -> Result<Self> {
        let key = KeyPair::generate_for(&rcgen::PKCS_ED25519).map_err(pki_err)?;
        let mut params = params_for(common_name)?;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let cert = params.self_signed(&key).map_err(pki_err)?;
        let pem = cert.pem();
        Ok(Self { key, cert, pem })
    }

    /// The CA certificate as PEM.
    pub fn certificate_pem(&self) -> &str {
        &self.pem
    }

    /// A root set containing only this CA.
    pub fn roots(&self) -> TrustedRoots {
        let mut roots = TrustedRoots::new();
        // The certificate was produced by rcgen a moment ago, so it parses.
        let _ = roots.add_der(self.cert.der().to_vec());
        roots
    }

    /// Issue a node certificate for a freshly generated Ed25519 key.
    pub fn issue(&self, common_name: &str) -> Result<NodeCredentials> {
        let signer = NodeSigner::generate();
        let private_key_pem = signer.to_pkcs8_pem()?;
        let node_key = KeyPair::from_pem(&private_key_pem).map_err(pki_err)?;
        let params = params_for(common_name)?;
        let cert = params
            .signed_by(&node_key, &self.cert, &self.key)
            .map_err(pki_err)?;
        let certificate_pem = cert.pem();
        let certificate = Certificate::from_der(cert.der().to_vec())?;
        Ok(NodeCredentials {
            certificate_pem,
            private_key_pem,
            certificate,
            signer,
        })
    }
}
