//! Local key/value storage.
//!
//! Values are either single blobs (written by `store`, last writer wins) or
//! sets of blobs (grown by `append`). Keys that have ever been appended to are
//! tracked in `set_keys`; membership transfer replicates those with `append`
//! so that the receiver merges rather than overwrites.
//!
//! Certificate entries (keys of the form `SHA-1(id_hex + "cert")`) are pinned:
//! they never expire and are tracked separately so that key transfer can skip
//! them.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use certdht_transport::Value;
use certdht_types::NodeId;

/// Internal storage entry wrapping a value with metadata.
#[derive(Clone, Debug)]
struct StoreEntry {
    value: Value,
    /// When this entry was last written.
    stored_at: Instant,
    /// `None` for pinned entries.
    ttl: Option<Duration>,
}

impl StoreEntry {
    fn is_expired(&self) -> bool {
        self.ttl.is_some_and(|ttl| self.stored_at.elapsed() > ttl)
    }
}

/// In-memory value store with expiration support.
pub struct ValueStore {
    entries: HashMap<NodeId, StoreEntry>,
    set_keys: HashSet<NodeId>,
    cert_keys: HashSet<NodeId>,
    default_ttl: Duration,
}

impl ValueStore {
    /// Create a store whose ordinary values live for `ttl`.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            set_keys: HashSet::new(),
            cert_keys: HashSet::new(),
            default_ttl: ttl,
        }
    }

    /// Overwrite `key` with a single blob.
    ///
    /// A key written this way stops being set-valued.
    pub fn store(&mut self, key: NodeId, value: Vec<u8>) {
        self.set_keys.remove(&key);
        self.entries.insert(
            key,
            StoreEntry {
                value: Value::Blob(value),
                stored_at: Instant::now(),
                ttl: Some(self.default_ttl),
            },
        );
    }

    /// Merge `values` into the set under `key`, skipping duplicates.
    ///
    /// An existing blob becomes the first member of the set.
    pub fn append(&mut self, key: NodeId, values: Vec<Vec<u8>>) {
        let mut members = match self.entries.remove(&key) {
            Some(entry) if !entry.is_expired() => match entry.value {
                Value::Set(members) => members,
                Value::Blob(blob) => vec![blob],
            },
            _ => Vec::new(),
        };
        for v in values {
            if !members.contains(&v) {
                members.push(v);
            }
        }
        self.set_keys.insert(key);
        self.entries.insert(
            key,
            StoreEntry {
                value: Value::Set(members),
                stored_at: Instant::now(),
                ttl: Some(self.default_ttl),
            },
        );
    }

    /// Store a certificate PEM under its certificate key. Never expires.
    pub fn store_certificate(&mut self, key: NodeId, pem: &str) {
        self.set_keys.remove(&key);
        self.cert_keys.insert(key);
        self.entries.insert(
            key,
            StoreEntry {
                value: Value::Blob(pem.as_bytes().to_vec()),
                stored_at: Instant::now(),
                ttl: None,
            },
        );
    }

    /// The value under `key`, if present and not expired.
    pub fn get(&self, key: &NodeId) -> Option<&Value> {
        self.entries
            .get(key)
            .filter(|e| !e.is_expired())
            .map(|e| &e.value)
    }

    pub fn is_set_key(&self, key: &NodeId) -> bool {
        self.set_keys.contains(key)
    }

    pub fn is_certificate_key(&self, key: &NodeId) -> bool {
        self.cert_keys.contains(key)
    }

    /// Snapshot of every live entry.
    pub fn items(&self) -> Vec<(NodeId, Value)> {
        self.entries
            .iter()
            .filter(|(_, e)| !e.is_expired())
            .map(|(k, e)| (*k, e.value.clone()))
            .collect()
    }

    /// Remove expired values.
    ///
    /// Returns the number of values removed.
    pub fn expire(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired());
        let entries = &self.entries;
        self.set_keys.retain(|k| entries.contains_key(k));
        let removed = before - self.entries.len();
        if removed > 0 {
            tracing::debug!("Expired {removed} DHT values");
        }
        removed
    }

    /// Number of live values.
    pub fn len(&self) -> usize {
        self.entries.values().filter(|e| !e.is_expired()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All live keys.
    pub fn keys(&self) -> Vec<NodeId> {
        self.entries
            .iter()
            .filter(|(_, e)| !e.is_expired())
            .map(|(k, _)| *k)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use certdht_crypto::hash::digest;

    fn store() -> ValueStore {
        ValueStore::with_ttl(Duration::from_secs(60))
    }

    #[test]
    fn test_store_overwrites() {
        let mut s = store();
        let key = digest(b"colour");
        s.store(key, b"red".to_vec());
        s.store(key, b"blue".to_vec());
        assert_eq!(s.get(&key), Some(&Value::Blob(b"blue".to_vec())));
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn test_append_merges_and_marks_set_key() {
        let mut s = store();
        let key = digest(b"members");
        s.store(key, b"a".to_vec());
        assert!(!s.is_set_key(&key));

        s.append(key, vec![b"b".to_vec(), b"a".to_vec()]);
        s.append(key, vec![b"c".to_vec()]);
        assert!(s.is_set_key(&key));
        assert_eq!(
            s.get(&key),
            Some(&Value::Set(vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]))
        );

        s.store(key, b"z".to_vec());
        assert!(!s.is_set_key(&key));
    }

    #[test]
    fn test_expiration_spares_certificates() {
        let mut s = ValueStore::with_ttl(Duration::from_millis(1));
        let plain = digest(b"ephemeral");
        let cert = digest(b"ABCDcert");
        s.store(plain, b"x".to_vec());
        s.append(digest(b"set"), vec![b"y".to_vec()]);
        s.store_certificate(cert, "-----BEGIN CERTIFICATE-----");

        std::thread::sleep(Duration::from_millis(10));

        assert!(s.get(&plain).is_none());
        assert_eq!(s.expire(), 2);
        assert!(!s.is_set_key(&digest(b"set")));
        assert!(s.get(&cert).is_some());
        assert!(s.is_certificate_key(&cert));
        assert_eq!(s.keys(), vec![cert]);
    }

    #[test]
    fn test_items_snapshot() {
        let mut s = store();
        assert!(s.is_empty());
        s.store(digest(b"k1"), b"v1".to_vec());
        s.store(digest(b"k2"), b"v2".to_vec());
        let mut items = s.items();
        items.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(items.len(), 2);
        assert!(items.iter().any(|(k, _)| *k == digest(b"k1")));
    }
}
