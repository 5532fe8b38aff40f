//! Challenge-response authentication.
//!
//! A request is signed over `UPPER_HEX(recipient_id) + challenge`, so the
//! recipient checks it against its own id. A reply (including a NACK) is
//! signed over the challenge alone.
//!
//! Verification fails closed: every failure, whatever its cause, comes back as
//! `false` and is logged with the peer's id. Ed25519 is cheap enough that
//! signing and verifying run inline on the calling task.

use std::sync::Arc;

use certdht_crypto::{Certificate, Challenge, NodeSigner, TrustedRoots};
use certdht_types::NodeId;
use tracing::debug;

use crate::{DhtError, Result};

/// Signs outgoing messages with the local key and checks peers' signatures.
#[derive(Clone)]
pub struct ChallengeAuthenticator {
    local_id: NodeId,
    signer: Arc<NodeSigner>,
    roots: TrustedRoots,
}

impl ChallengeAuthenticator {
    pub fn new(local_id: NodeId, signer: Arc<NodeSigner>, roots: TrustedRoots) -> Self {
        Self {
            local_id,
            signer,
            roots,
        }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    /// A fresh random challenge.
    pub fn issue_challenge(&self) -> Challenge {
        Challenge::generate()
    }

    /// Bytes a requester signs when addressing `recipient`.
    pub fn request_payload(recipient: &NodeId, challenge: &str) -> Vec<u8> {
        let mut payload = recipient.to_hex().into_bytes();
        payload.extend_from_slice(challenge.as_bytes());
        payload
    }

    /// Sign `message` with the local key.
    ///
    /// # Errors
    ///
    /// [`DhtError::Signing`] if the key refuses to sign. The caller must not
    /// send anything in that case.
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        self.signer
            .sign(message)
            .map(|s| s.to_vec())
            .map_err(|e| DhtError::Signing(e.to_string()))
    }

    /// Signature for a request to `recipient`.
    pub fn sign_request(&self, recipient: &NodeId, challenge: &Challenge) -> Result<Vec<u8>> {
        self.sign(&Self::request_payload(recipient, challenge.as_str()))
    }

    /// Signature for a reply (or NACK) to `challenge`.
    pub fn sign_response(&self, challenge: &str) -> Result<Vec<u8>> {
        self.sign(challenge.as_bytes())
    }

    /// Check `signature` over `message` under `cert`.
    ///
    /// `false` if the certificate does not chain to a trusted root or the
    /// signature is malformed or wrong.
    pub fn verify(&self, cert: &Certificate, signature: &[u8], message: &[u8]) -> bool {
        let peer = cert.node_id();
        if let Err(e) = self.roots.verify(cert) {
            debug!(peer = %peer, error = %e, "verification failed: certificate untrusted");
            return false;
        }
        match cert.verify_signature(message, signature) {
            Ok(()) => {
                debug!(peer = %peer, "signature verified");
                true
            }
            Err(e) => {
                debug!(peer = %peer, error = %e, "verification failed");
                false
            }
        }
    }

    /// Check a request addressed to this node.
    pub fn verify_request(&self, cert: &Certificate, challenge: &str, signature: &[u8]) -> bool {
        self.verify(
            cert,
            signature,
            &Self::request_payload(&self.local_id, challenge),
        )
    }

    /// Check a reply to one of our requests.
    pub fn verify_response(&self, cert: &Certificate, challenge: &str, signature: &[u8]) -> bool {
        self.verify(cert, signature, challenge.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use certdht_crypto::fixtures::{NodeCredentials, TestCa};

    fn authenticator(ca: &TestCa, node: NodeCredentials) -> ChallengeAuthenticator {
        let id = node.certificate.node_id();
        ChallengeAuthenticator::new(id, Arc::new(node.signer), ca.roots())
    }

    #[test]
    fn test_request_round_trip() {
        let ca = TestCa::new("root").expect("ca");
        let alice = ca.issue("alice").expect("issue");
        let bob = ca.issue("bob").expect("issue");
        let alice_cert = alice.certificate.clone();
        let bob_cert = bob.certificate.clone();

        let alice_auth = authenticator(&ca, alice);
        let bob_auth = authenticator(&ca, bob);

        let challenge = alice_auth.issue_challenge();
        let sig = alice_auth
            .sign_request(&bob_cert.node_id(), &challenge)
            .expect("sign");
        assert!(bob_auth.verify_request(&alice_cert, challenge.as_str(), &sig));

        // The same signature is worthless when presented to anyone else.
        assert!(!alice_auth.verify_request(&alice_cert, challenge.as_str(), &sig));
    }

    #[test]
    fn test_response_round_trip() {
        let ca = TestCa::new("root").expect("ca");
        let alice = ca.issue("alice").expect("issue");
        let bob = ca.issue("bob").expect("issue");
        let bob_cert = bob.certificate.clone();
        let alice_auth = authenticator(&ca, alice);
        let bob_auth = authenticator(&ca, bob);

        let challenge = alice_auth.issue_challenge();
        let sig = bob_auth.sign_response(challenge.as_str()).expect("sign");
        assert!(alice_auth.verify_response(&bob_cert, challenge.as_str(), &sig));
        assert!(!alice_auth.verify_response(&bob_cert, "0000000000000000", &sig));
    }

    #[test]
    fn test_verify_fails_closed() {
        let ca = TestCa::new("root").expect("ca");
        let alice = ca.issue("alice").expect("issue");
        let alice_cert = alice.certificate.clone();
        let auth = authenticator(&ca, alice);

        let mut sig = auth.sign(b"message").expect("sign");
        assert!(auth.verify(&alice_cert, &sig, b"message"));

        sig[0] ^= 0x01;
        assert!(!auth.verify(&alice_cert, &sig, b"message"));
        assert!(!auth.verify(&alice_cert, &[], b"message"));
        assert!(!auth.verify(&alice_cert, &[0u8; 3], b"message"));
    }

    #[test]
    fn test_untrusted_certificate_fails() {
        let ca = TestCa::new("root").expect("ca");
        let rogue_ca = TestCa::new("rogue").expect("ca");
        let alice = ca.issue("alice").expect("issue");
        let mallory = rogue_ca.issue("mallory").expect("issue");
        let mallory_cert = mallory.certificate.clone();
        let mallory_sig = mallory.signer.sign(b"hello").expect("sign").to_vec();

        let auth = authenticator(&ca, alice);
        assert!(!auth.verify(&mallory_cert, &mallory_sig, b"hello"));
    }

    #[test]
    fn test_request_payload_uses_upper_hex() {
        let id = NodeId::from_bytes([0xAB; certdht_types::ID_LEN]);
        let payload = ChallengeAuthenticator::request_payload(&id, "00ff");
        let text = String::from_utf8(payload).expect("utf8");
        assert!(text.starts_with("ABABAB"));
        assert!(text.ends_with("00ff"));
        assert_eq!(text.len(), 40 + 4);
    }
}
