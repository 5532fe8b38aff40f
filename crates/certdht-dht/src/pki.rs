//! Key material and certificate persistence.
//!
//! The DHT consumes PKI through [`CertificateDirectory`] only: load the local
//! key, the local certificate, and the trusted roots; persist and read back
//! peer certificates. [`FsDirectory`] is the on-disk layout used by the node
//! binary; [`MemoryDirectory`] backs tests.
//!
//! Methods are synchronous. Async callers run them on `spawn_blocking`.
//!
//! ## On-disk layout
//!
//! ```text
//! <runtimes_dir>/<name>/
//!     mine/*.pem              own certificate (first file, sorted by name)
//!     private/private.key     PKCS#8 PEM private key
//!     others/<HEX_ID>.pem     persisted peer certificates
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use certdht_crypto::{Certificate, NodeSigner, TrustedRoots};
use certdht_types::NodeId;
use zeroize::Zeroizing;

use crate::{DhtError, Result};

const MINE_DIR: &str = "mine";
const PRIVATE_DIR: &str = "private";
const OTHERS_DIR: &str = "others";
const PRIVATE_KEY_FILE: &str = "private.key";

/// Source of key material and sink for peer certificates.
pub trait CertificateDirectory: Send + Sync + 'static {
    /// The local node's signing key.
    fn load_private_key(&self) -> Result<NodeSigner>;

    /// The local node's certificate.
    fn load_own_certificate(&self) -> Result<Certificate>;

    /// The CA certificates peers must chain to.
    fn load_trusted_roots(&self) -> Result<TrustedRoots>;

    /// Durably record `pem` as the certificate of `node_id`.
    fn persist_certificate(&self, node_id: &NodeId, pem: &str) -> Result<()>;

    /// A previously persisted certificate for `node_id`, if any.
    fn read_persisted_certificate(&self, node_id: &NodeId) -> Result<Option<String>>;
}

fn io_err(path: &Path, e: std::io::Error) -> DhtError {
    DhtError::Pki(format!("{}: {e}", path.display()))
}

/// Certificate directory rooted at `<runtimes_dir>/<name>`.
#[derive(Clone, Debug)]
pub struct FsDirectory {
    node_dir: PathBuf,
    ca_certificate: PathBuf,
}

impl FsDirectory {
    pub fn new(runtimes_dir: impl Into<PathBuf>, name: &str, ca_certificate: impl Into<PathBuf>) -> Self {
        Self {
            node_dir: runtimes_dir.into().join(name),
            ca_certificate: ca_certificate.into(),
        }
    }

    pub fn node_dir(&self) -> &Path {
        &self.node_dir
    }

    fn others_dir(&self) -> PathBuf {
        self.node_dir.join(OTHERS_DIR)
    }

    fn own_certificate_path(&self) -> Result<PathBuf> {
        let mine = self.node_dir.join(MINE_DIR);
        let mut pems: Vec<PathBuf> = fs::read_dir(&mine)
            .map_err(|e| io_err(&mine, e))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "pem"))
            .collect();
        pems.sort();
        pems.into_iter()
            .next()
            .ok_or_else(|| DhtError::Pki(format!("no certificate in {}", mine.display())))
    }
}

impl CertificateDirectory for FsDirectory {
    fn load_private_key(&self) -> Result<NodeSigner> {
        let path = self.node_dir.join(PRIVATE_DIR).join(PRIVATE_KEY_FILE);
        let pem = Zeroizing::new(fs::read_to_string(&path).map_err(|e| io_err(&path, e))?);
        Ok(NodeSigner::from_pkcs8_pem(&pem)?)
    }

    fn load_own_certificate(&self) -> Result<Certificate> {
        let path = self.own_certificate_path()?;
        let pem = fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
        Ok(Certificate::from_pem(&pem)?)
    }

    fn load_trusted_roots(&self) -> Result<TrustedRoots> {
        let pem = fs::read_to_string(&self.ca_certificate)
            .map_err(|e| io_err(&self.ca_certificate, e))?;
        Ok(TrustedRoots::from_pem_bundle(&pem)?)
    }

    fn persist_certificate(&self, node_id: &NodeId, pem: &str) -> Result<()> {
        let dir = self.others_dir();
        fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        let path = dir.join(format!("{}.pem", node_id.to_hex()));
        fs::write(&path, pem).map_err(|e| io_err(&path, e))
    }

    fn read_persisted_certificate(&self, node_id: &NodeId) -> Result<Option<String>> {
        let dir = self.others_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_err(&dir, e)),
        };

        let needle = node_id.to_hex();
        let matches: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.to_uppercase().contains(&needle))
            })
            .collect();

        match matches.as_slice() {
            [] => Ok(None),
            [path] => fs::read_to_string(path)
                .map(Some)
                .map_err(|e| io_err(path, e)),
            _ => Err(DhtError::Pki(format!(
                "{} certificates on file for {needle}",
                matches.len()
            ))),
        }
    }
}

/// Certificate directory held in memory.
pub struct MemoryDirectory {
    private_key_pem: Zeroizing<String>,
    certificate_pem: String,
    roots: TrustedRoots,
    others: Mutex<HashMap<NodeId, String>>,
}

impl MemoryDirectory {
    pub fn new(private_key_pem: Zeroizing<String>, certificate_pem: String, roots: TrustedRoots) -> Self {
        Self {
            private_key_pem,
            certificate_pem,
            roots,
            others: Mutex::new(HashMap::new()),
        }
    }

    /// Ids with a persisted certificate.
    pub fn persisted_ids(&self) -> Vec<NodeId> {
        self.others
            .lock()
            .map(|m| m.keys().copied().collect())
            .unwrap_or_default()
    }
}

impl CertificateDirectory for MemoryDirectory {
    fn load_private_key(&self) -> Result<NodeSigner> {
        Ok(NodeSigner::from_pkcs8_pem(&self.private_key_pem)?)
    }

    fn load_own_certificate(&self) -> Result<Certificate> {
        Ok(Certificate::from_pem(&self.certificate_pem)?)
    }

    fn load_trusted_roots(&self) -> Result<TrustedRoots> {
        Ok(self.roots.clone())
    }

    fn persist_certificate(&self, node_id: &NodeId, pem: &str) -> Result<()> {
        self.others
            .lock()
            .map_err(|_| DhtError::Pki("certificate map poisoned".into()))?
            .insert(*node_id, pem.to_string());
        Ok(())
    }

    fn read_persisted_certificate(&self, node_id: &NodeId) -> Result<Option<String>> {
        Ok(self
            .others
            .lock()
            .map_err(|_| DhtError::Pki("certificate map poisoned".into()))?
            .get(node_id)
            .cloned())
    }
}
