//! Verified peer certificates.
//!
//! A certificate enters the [`TrustStore`] only after it chains to a trusted
//! root. The first verified certificate for an id wins; later ones for the
//! same id are ignored. Accepted certificates are mirrored into the DHT value
//! store under `SHA-1(id_hex + "cert")` and persisted through the
//! [`CertificateDirectory`].

use std::collections::HashMap;
use std::sync::Arc;

use certdht_crypto::hash::certificate_key;
use certdht_crypto::{Certificate, TrustedRoots};
use certdht_types::NodeId;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::pki::CertificateDirectory;
use crate::storage::ValueStore;

/// Cache of CA-verified peer certificates.
pub struct TrustStore {
    roots: TrustedRoots,
    directory: Arc<dyn CertificateDirectory>,
    certs: RwLock<HashMap<NodeId, Certificate>>,
    values: Arc<RwLock<ValueStore>>,
}

impl TrustStore {
    pub fn new(
        roots: TrustedRoots,
        directory: Arc<dyn CertificateDirectory>,
        values: Arc<RwLock<ValueStore>>,
    ) -> Self {
        Self {
            roots,
            directory,
            certs: RwLock::new(HashMap::new()),
            values,
        }
    }

    pub fn roots(&self) -> &TrustedRoots {
        &self.roots
    }

    /// Whether a certificate for `peer` is known, in memory or on disk.
    pub async fn has(&self, peer: &NodeId) -> bool {
        self.lookup(peer).await.is_some()
    }

    /// The certificate for `peer`.
    ///
    /// Falls back to the persisted copy on a memory miss. A persisted
    /// certificate is re-verified against the roots and the id before it is
    /// cached.
    pub async fn lookup(&self, peer: &NodeId) -> Option<Certificate> {
        if let Some(cert) = self.certs.read().await.get(peer) {
            return Some(cert.clone());
        }

        let directory = Arc::clone(&self.directory);
        let id = *peer;
        let pem = match tokio::task::spawn_blocking(move || {
            directory.read_persisted_certificate(&id)
        })
        .await
        {
            Ok(Ok(Some(pem))) => pem,
            Ok(Ok(None)) => return None,
            Ok(Err(e)) => {
                debug!(peer = %peer, error = %e, "persisted certificate lookup failed");
                return None;
            }
            Err(e) => {
                warn!(error = %e, "certificate lookup task failed");
                return None;
            }
        };

        let cert = match Certificate::from_pem(&pem) {
            Ok(cert) => cert,
            Err(e) => {
                warn!(peer = %peer, error = %e, "persisted certificate does not parse");
                return None;
            }
        };
        if cert.node_id() != *peer {
            warn!(peer = %peer, found = %cert.node_id(), "persisted certificate belongs to another id");
            return None;
        }
        if let Err(e) = self.roots.verify(&cert) {
            warn!(peer = %peer, error = %e, "persisted certificate no longer trusted");
            return None;
        }

        self.insert_verified(cert.clone()).await;
        Some(cert)
    }

    /// Verify `cert` against the roots and record it for `claimed_id`.
    ///
    /// Returns `true` only if the certificate was newly recorded. An untrusted
    /// certificate is logged and dropped; an id that already has a certificate
    /// keeps it. The id binding is not checked here.
    pub async fn store(&self, cert: &Certificate, claimed_id: &NodeId) -> bool {
        if let Err(e) = self.roots.verify(cert) {
            warn!(peer = %claimed_id, error = %e, "certificate untrusted, not stored");
            return false;
        }

        if !self.insert_verified_for(cert.clone(), *claimed_id).await {
            debug!(peer = %claimed_id, "certificate already known, keeping first");
            return false;
        }

        let pem = cert.to_pem();
        self.values
            .write()
            .await
            .store_certificate(certificate_key(claimed_id), &pem);

        let directory = Arc::clone(&self.directory);
        let id = *claimed_id;
        match tokio::task::spawn_blocking(move || directory.persist_certificate(&id, &pem)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(peer = %claimed_id, error = %e, "failed to persist certificate"),
            Err(e) => warn!(error = %e, "certificate persist task failed"),
        }

        info!(peer = %claimed_id, "stored peer certificate");
        true
    }

    async fn insert_verified(&self, cert: Certificate) -> bool {
        let id = cert.node_id();
        self.insert_verified_for(cert, id).await
    }

    async fn insert_verified_for(&self, cert: Certificate, id: NodeId) -> bool {
        let mut certs = self.certs.write().await;
        if certs.contains_key(&id) {
            return false;
        }
        certs.insert(id, cert);
        true
    }

    /// Number of certificates held in memory.
    pub async fn len(&self) -> usize {
        self.certs.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pki::MemoryDirectory;
    use certdht_crypto::fixtures::{NodeCredentials, TestCa};
    use certdht_transport::Value;
    use std::time::Duration;

    fn trust_store(ca: &TestCa, owner: &NodeCredentials) -> (TrustStore, Arc<MemoryDirectory>, Arc<RwLock<ValueStore>>) {
        let directory = Arc::new(MemoryDirectory::new(
            owner.private_key_pem.clone(),
            owner.certificate_pem.clone(),
            ca.roots(),
        ));
        let values = Arc::new(RwLock::new(ValueStore::with_ttl(Duration::from_secs(60))));
        let store = TrustStore::new(
            ca.roots(),
            Arc::clone(&directory) as Arc<dyn CertificateDirectory>,
            Arc::clone(&values),
        );
        (store, directory, values)
    }

    #[tokio::test]
    async fn test_store_and_lookup() {
        let ca = TestCa::new("root").expect("ca");
        let owner = ca.issue("owner").expect("issue");
        let peer = ca.issue("peer").expect("issue");
        let (store, directory, values) = trust_store(&ca, &owner);
        let peer_id = peer.certificate.node_id();

        assert!(!store.has(&peer_id).await);
        assert!(store.store(&peer.certificate, &peer_id).await);
        assert!(store.has(&peer_id).await);
        assert_eq!(store.lookup(&peer_id).await, Some(peer.certificate.clone()));

        let mirrored = values.read().await.get(&certificate_key(&peer_id)).cloned();
        assert_eq!(
            mirrored,
            Some(Value::Blob(peer.certificate.to_pem().into_bytes()))
        );
        assert_eq!(directory.persisted_ids(), vec![peer_id]);
    }

    #[tokio::test]
    async fn test_untrusted_certificate_is_not_stored() {
        let ca = TestCa::new("root").expect("ca");
        let rogue_ca = TestCa::new("rogue").expect("ca");
        let owner = ca.issue("owner").expect("issue");
        let rogue = rogue_ca.issue("mallory").expect("issue");
        let (store, directory, _) = trust_store(&ca, &owner);
        let rogue_id = rogue.certificate.node_id();

        assert!(!store.store(&rogue.certificate, &rogue_id).await);
        assert!(!store.has(&rogue_id).await);
        assert!(directory.persisted_ids().is_empty());
    }

    #[tokio::test]
    async fn test_first_seen_wins() {
        let ca = TestCa::new("root").expect("ca");
        let owner = ca.issue("owner").expect("issue");
        let first = ca.issue("first").expect("issue");
        let second = ca.issue("second").expect("issue");
        let (store, _, values) = trust_store(&ca, &owner);
        let id = first.certificate.node_id();

        assert!(store.store(&first.certificate, &id).await);
        // A different valid certificate presented under the same id.
        assert!(!store.store(&second.certificate, &id).await);

        assert_eq!(store.lookup(&id).await, Some(first.certificate.clone()));
        let mirrored = values.read().await.get(&certificate_key(&id)).cloned();
        assert_eq!(
            mirrored,
            Some(Value::Blob(first.certificate.to_pem().into_bytes()))
        );
    }

    #[tokio::test]
    async fn test_lookup_falls_back_to_directory() {
        let ca = TestCa::new("root").expect("ca");
        let owner = ca.issue("owner").expect("issue");
        let peer = ca.issue("peer").expect("issue");
        let other = ca.issue("other").expect("issue");
        let (store, directory, _) = trust_store(&ca, &owner);
        let peer_id = peer.certificate.node_id();
        let other_id = other.certificate.node_id();

        directory
            .persist_certificate(&peer_id, &peer.certificate_pem)
            .expect("persist");
        // Persisted under the wrong id: must not be trusted.
        directory
            .persist_certificate(&other_id, &peer.certificate_pem)
            .expect("persist");

        assert_eq!(store.lookup(&peer_id).await, Some(peer.certificate.clone()));
        assert_eq!(store.len().await, 1);
        assert_eq!(store.lookup(&other_id).await, None);
    }
}
