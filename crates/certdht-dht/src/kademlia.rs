//! Kademlia routing table with XOR-distance metric.
//!
//! 160 k-buckets, one per bit of the identifier space, each holding up to
//! `ksize` contacts. Only contacts whose signatures have been verified are
//! ever handed to [`RoutingTable::add_node`]; the table itself does no
//! authentication.
//!
//! ## LRU Eviction
//!
//! When a bucket is full and a new node is discovered, the least-recently-seen
//! entry is pinged. If the ping fails, the stale entry is evicted and the new
//! node is inserted. If the ping succeeds, the new node is discarded (Kademlia
//! preference for long-lived nodes).

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use certdht_types::{Distance, NodeId, NodeInfo, ID_LEN};
use rand::RngCore;

use crate::{DhtError, Result, NUM_BUCKETS};

/// Runtime metadata for a node entry within a k-bucket.
#[derive(Clone, Debug)]
struct BucketEntry {
    info: NodeInfo,
    /// When this node was last seen (for LRU eviction).
    last_seen: Instant,
}

/// A single k-bucket, ordered by last-seen time.
///
/// The front of the deque holds the least-recently-seen entry;
/// the back holds the most-recently-seen entry.
#[derive(Clone, Debug)]
struct KBucket {
    entries: VecDeque<BucketEntry>,
    /// Last time this bucket was refreshed via a lookup.
    last_refresh: Instant,
}

impl KBucket {
    fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            last_refresh: Instant::now(),
        }
    }

    fn find_index(&self, node_id: &NodeId) -> Option<usize> {
        self.entries.iter().position(|e| e.info.node_id == *node_id)
    }

    /// Move an existing entry to the back and refresh its address.
    fn touch(&mut self, index: usize, info: NodeInfo) {
        if self.entries.remove(index).is_some() {
            self.entries.push_back(BucketEntry {
                info,
                last_seen: Instant::now(),
            });
        }
    }

    fn insert(&mut self, info: NodeInfo) {
        self.entries.push_back(BucketEntry {
            info,
            last_seen: Instant::now(),
        });
    }

    fn remove(&mut self, index: usize) -> Option<NodeInfo> {
        self.entries.remove(index).map(|e| e.info)
    }
}

/// Result of attempting to add a node to the routing table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AddNodeResult {
    /// The node was newly inserted into a bucket.
    Inserted,
    /// The node was already present and moved to the most-recently-seen slot.
    Updated,
    /// The node was ignored (it is the local node).
    Ignored,
    /// The target bucket is full. Carries the least-recently-seen entry,
    /// which should be pinged to check liveness.
    BucketFull { least_recently_seen: NodeInfo },
}

/// The Kademlia routing table.
pub struct RoutingTable {
    local_id: NodeId,
    ksize: usize,
    buckets: Vec<KBucket>,
}

impl RoutingTable {
    /// Create an empty routing table for `local_id` with buckets of `ksize`.
    pub fn new(local_id: NodeId, ksize: usize) -> Self {
        let buckets = (0..NUM_BUCKETS).map(|_| KBucket::new(ksize)).collect();
        Self {
            local_id,
            ksize,
            buckets,
        }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    pub fn ksize(&self) -> usize {
        self.ksize
    }

    /// The bucket index for `node_id`: the number of leading zero bits of its
    /// distance to the local node. `None` for the local id itself.
    pub fn bucket_index(&self, node_id: &NodeId) -> Option<usize> {
        leading_zeros(&self.local_id.distance(node_id))
    }

    /// Whether `node_id` is absent from the table.
    pub fn is_new_node(&self, node_id: &NodeId) -> bool {
        !self.contains(node_id)
    }

    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.bucket_index(node_id)
            .is_some_and(|idx| self.buckets[idx].find_index(node_id).is_some())
    }

    /// Look up a contact by id.
    pub fn get(&self, node_id: &NodeId) -> Option<NodeInfo> {
        let idx = self.bucket_index(node_id)?;
        let bucket = &self.buckets[idx];
        bucket
            .find_index(node_id)
            .and_then(|i| bucket.entries.get(i))
            .map(|e| e.info.clone())
    }

    /// Add a node to the routing table.
    ///
    /// - Already present: moved to the most-recently-seen position.
    /// - Bucket has room: inserted.
    /// - Bucket full: [`AddNodeResult::BucketFull`] with the least-recently-seen
    ///   entry, so the caller can ping it and decide whether to evict.
    pub fn add_node(&mut self, info: NodeInfo) -> AddNodeResult {
        let Some(bucket_idx) = self.bucket_index(&info.node_id) else {
            return AddNodeResult::Ignored;
        };
        let ksize = self.ksize;
        let bucket = &mut self.buckets[bucket_idx];

        if let Some(idx) = bucket.find_index(&info.node_id) {
            bucket.touch(idx, info);
            return AddNodeResult::Updated;
        }

        if bucket.entries.len() < ksize {
            bucket.insert(info);
            return AddNodeResult::Inserted;
        }

        match bucket.entries.front() {
            Some(lrs) => AddNodeResult::BucketFull {
                least_recently_seen: lrs.info.clone(),
            },
            None => AddNodeResult::Ignored,
        }
    }

    /// Evict `stale_id` and insert `new_node` in its place.
    ///
    /// Call this after a failed ping to the entry returned by
    /// [`AddNodeResult::BucketFull`].
    pub fn evict_and_insert(&mut self, stale_id: &NodeId, new_node: NodeInfo) -> Result<()> {
        let bucket_idx = self
            .bucket_index(stale_id)
            .ok_or_else(|| DhtError::Routing("cannot evict the local node".into()))?;
        let bucket = &mut self.buckets[bucket_idx];

        match bucket.find_index(stale_id) {
            Some(idx) => {
                bucket.remove(idx);
                bucket.insert(new_node);
                Ok(())
            }
            None => Err(DhtError::Routing(format!("{stale_id} is not in the table"))),
        }
    }

    /// Remove a node from the routing table.
    pub fn remove_node(&mut self, node_id: &NodeId) -> Option<NodeInfo> {
        let bucket_idx = self.bucket_index(node_id)?;
        let bucket = &mut self.buckets[bucket_idx];
        let entry_idx = bucket.find_index(node_id)?;
        bucket.remove(entry_idx)
    }

    /// The `count` contacts closest to `target`, nearest first, skipping
    /// `exclude`.
    pub fn find_neighbors(
        &self,
        target: &NodeId,
        count: usize,
        exclude: Option<&NodeId>,
    ) -> Vec<NodeInfo> {
        let mut all: Vec<(&NodeInfo, Distance)> = self
            .buckets
            .iter()
            .flat_map(|b| b.entries.iter())
            .filter(|e| Some(&e.info.node_id) != exclude)
            .map(|e| (&e.info, e.info.distance_to(target)))
            .collect();

        all.sort_by(|a, b| a.1.cmp(&b.1));

        all.into_iter()
            .take(count)
            .map(|(info, _)| info.clone())
            .collect()
    }

    /// Every contact in the table.
    pub fn all_nodes(&self) -> Vec<NodeInfo> {
        self.buckets
            .iter()
            .flat_map(|b| b.entries.iter().map(|e| e.info.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Non-empty buckets not refreshed within `refresh_interval`.
    pub fn stale_buckets(&self, refresh_interval: Duration) -> Vec<usize> {
        let now = Instant::now();
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| {
                !b.entries.is_empty() && now.duration_since(b.last_refresh) > refresh_interval
            })
            .map(|(i, _)| i)
            .collect()
    }

    pub fn mark_bucket_refreshed(&mut self, bucket_idx: usize) {
        if let Some(bucket) = self.buckets.get_mut(bucket_idx) {
            bucket.last_refresh = Instant::now();
        }
    }

    /// A random identifier that falls into bucket `bucket_idx`.
    pub fn random_id_in_bucket(&self, bucket_idx: usize) -> NodeId {
        let mut distance = [0u8; ID_LEN];
        rand::thread_rng().fill_bytes(&mut distance);

        let idx = bucket_idx.min(NUM_BUCKETS - 1);
        let (byte, bit) = (idx / 8, idx % 8);
        for b in distance.iter_mut().take(byte) {
            *b = 0;
        }
        // Clear the bits above position `bit`, set the bit itself.
        let marker = 0x80u8 >> bit;
        distance[byte] = (distance[byte] & (marker - 1)) | marker;

        let local = self.local_id.as_bytes();
        let mut out = [0u8; ID_LEN];
        for (i, o) in out.iter_mut().enumerate() {
            *o = local[i] ^ distance[i];
        }
        NodeId::from_bytes(out)
    }
}

/// A candidate node in the iterative lookup process.
#[derive(Clone, Debug)]
struct LookupCandidate {
    info: NodeInfo,
    distance: Distance,
    queried: bool,
}

/// Iterative `FIND_NODE` lookup state machine.
///
/// Queries `alpha` nodes per round, converging on the `ksize` closest
/// responsive nodes to the target.
pub struct FindNodeLookup {
    target: NodeId,
    /// Contacts already queried, or known to be unusable. Keyed by id and
    /// address so a forged address cannot shut out the real node.
    seen: Vec<NodeInfo>,
    candidates: Vec<LookupCandidate>,
    alpha: usize,
    result_count: usize,
}

impl FindNodeLookup {
    /// Start a lookup for `target` from `seed_nodes`.
    pub fn new(target: NodeId, seed_nodes: Vec<NodeInfo>, alpha: usize, ksize: usize) -> Self {
        let mut lookup = Self {
            target,
            seen: Vec::new(),
            candidates: Vec::new(),
            alpha,
            result_count: ksize,
        };
        lookup.add_responses(seed_nodes);
        lookup
    }

    pub fn target(&self) -> &NodeId {
        &self.target
    }

    /// The next batch of up to `alpha` un-queried nodes.
    ///
    /// Returns an empty vec when the lookup is complete.
    pub fn next_queries(&mut self) -> Vec<NodeInfo> {
        let mut batch = Vec::with_capacity(self.alpha);

        for candidate in self.candidates.iter_mut().take(self.result_count) {
            if batch.len() >= self.alpha {
                break;
            }
            if !candidate.queried {
                candidate.queried = true;
                self.seen.push(candidate.info.clone());
                batch.push(candidate.info.clone());
            }
        }

        batch
    }

    /// Merge nodes returned by a queried peer.
    pub fn add_responses(&mut self, new_nodes: Vec<NodeInfo>) {
        for info in new_nodes {
            if self.seen.contains(&info)
                || self.candidates.iter().any(|c| c.info.node_id == info.node_id)
            {
                continue;
            }
            let distance = info.distance_to(&self.target);
            self.candidates.push(LookupCandidate {
                info,
                distance,
                queried: false,
            });
        }

        self.candidates.sort_by(|a, b| a.distance.cmp(&b.distance));
        self.candidates.truncate(self.result_count * 3);
    }

    /// Drop a contact that failed to answer; it never appears in the results.
    ///
    /// The same id advertised at another address is still eligible.
    pub fn mark_failed(&mut self, node: &NodeInfo) {
        self.candidates.retain(|c| c.info != *node);
        if !self.seen.contains(node) {
            self.seen.push(node.clone());
        }
    }

    /// Whether every one of the `ksize` closest candidates has been queried.
    pub fn is_complete(&self) -> bool {
        self.candidates
            .iter()
            .take(self.result_count)
            .all(|c| c.queried)
    }

    /// The closest nodes found, nearest first.
    pub fn results(&self) -> Vec<NodeInfo> {
        self.candidates
            .iter()
            .take(self.result_count)
            .map(|c| c.info.clone())
            .collect()
    }
}

/// Number of leading zero bits in a distance; `None` if it is all zeros.
fn leading_zeros(value: &Distance) -> Option<usize> {
    for (i, byte) in value.iter().enumerate() {
        if *byte != 0 {
            return Some(i * 8 + byte.leading_zeros() as usize);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn id(bytes: [u8; ID_LEN]) -> NodeId {
        NodeId::from_bytes(bytes)
    }

    fn make_node_with_id(node_id: NodeId) -> NodeInfo {
        NodeInfo::new(node_id, SocketAddr::from(([127, 0, 0, 1], 4433)))
    }

    fn prefixed(first: u8, last: u8) -> NodeId {
        let mut b = [0u8; ID_LEN];
        b[0] = first;
        b[ID_LEN - 1] = last;
        id(b)
    }

    #[test]
    fn test_leading_zeros() {
        let mut val = [0u8; ID_LEN];
        assert_eq!(leading_zeros(&val), None);

        val[0] = 0x80;
        assert_eq!(leading_zeros(&val), Some(0));

        val[0] = 0x01;
        assert_eq!(leading_zeros(&val), Some(7));

        let mut val2 = [0u8; ID_LEN];
        val2[1] = 0x01;
        assert_eq!(leading_zeros(&val2), Some(15));
    }

    #[test]
    fn test_bucket_index() {
        let local_id = id([0; ID_LEN]);
        let table = RoutingTable::new(local_id, 20);

        assert_eq!(table.bucket_index(&local_id), None);
        assert_eq!(table.bucket_index(&prefixed(0x80, 0)), Some(0));
        assert_eq!(table.bucket_index(&prefixed(0, 1)), Some(NUM_BUCKETS - 1));
    }

    #[test]
    fn test_add_and_find_node() {
        let mut table = RoutingTable::new(id([0; ID_LEN]), 20);
        let node = make_node_with_id(id([1; ID_LEN]));

        assert_eq!(table.add_node(node.clone()), AddNodeResult::Inserted);
        assert!(!table.is_new_node(&node.node_id));
        assert_eq!(table.add_node(node.clone()), AddNodeResult::Updated);
        assert_eq!(table.len(), 1);

        let closest = table.find_neighbors(&id([1; ID_LEN]), 5, None);
        assert_eq!(closest, vec![node.clone()]);
        assert!(table
            .find_neighbors(&id([1; ID_LEN]), 5, Some(&node.node_id))
            .is_empty());
    }

    #[test]
    fn test_update_refreshes_address() {
        let mut table = RoutingTable::new(id([0; ID_LEN]), 20);
        let node_id = id([1; ID_LEN]);
        table.add_node(NodeInfo::new(node_id, "10.0.0.1:1".parse().expect("addr")));
        table.add_node(NodeInfo::new(node_id, "10.0.0.1:2".parse().expect("addr")));
        let stored = table.get(&node_id).expect("present");
        assert_eq!(stored.addr.port(), 2);
    }

    #[test]
    fn test_add_self_ignored() {
        let local_id = id([0x42; ID_LEN]);
        let mut table = RoutingTable::new(local_id, 20);
        assert_eq!(
            table.add_node(make_node_with_id(local_id)),
            AddNodeResult::Ignored
        );
        assert!(table.is_empty());
    }

    #[test]
    fn test_remove_node() {
        let mut table = RoutingTable::new(id([0; ID_LEN]), 20);
        let node = make_node_with_id(id([1; ID_LEN]));
        table.add_node(node.clone());

        assert!(table.remove_node(&node.node_id).is_some());
        assert!(table.is_new_node(&node.node_id));
        assert!(table.remove_node(&id([0xFF; ID_LEN])).is_none());
    }

    #[test]
    fn test_bucket_full_reports_least_recently_seen() {
        let k = 4;
        let mut table = RoutingTable::new(id([0; ID_LEN]), k);

        for i in 0..k {
            let result = table.add_node(make_node_with_id(prefixed(0x80, i as u8)));
            assert_eq!(result, AddNodeResult::Inserted);
        }
        // Touch the first entry so the second becomes least recently seen.
        table.add_node(make_node_with_id(prefixed(0x80, 0)));

        let result = table.add_node(make_node_with_id(prefixed(0x80, 0xEE)));
        match result {
            AddNodeResult::BucketFull {
                least_recently_seen,
            } => assert_eq!(least_recently_seen.node_id, prefixed(0x80, 1)),
            other => panic!("expected BucketFull, got {other:?}"),
        }
    }

    #[test]
    fn test_evict_and_insert() {
        let k = 3;
        let mut table = RoutingTable::new(id([0; ID_LEN]), k);
        for i in 0..k {
            table.add_node(make_node_with_id(prefixed(0x80, i as u8)));
        }

        let new_node = make_node_with_id(prefixed(0x80, 0xEE));
        table
            .evict_and_insert(&prefixed(0x80, 0), new_node.clone())
            .expect("evict");
        assert_eq!(table.len(), k);
        assert!(table.contains(&new_node.node_id));
        assert!(!table.contains(&prefixed(0x80, 0)));

        assert!(table
            .evict_and_insert(&prefixed(0x80, 0x55), new_node)
            .is_err());
    }

    #[test]
    fn test_find_neighbors_sorted() {
        let mut table = RoutingTable::new(id([0; ID_LEN]), 20);
        for i in 1..=10u8 {
            table.add_node(make_node_with_id(prefixed(i, 0)));
        }

        let target = id([0x05; ID_LEN]);
        let closest = table.find_neighbors(&target, 5, None);
        assert_eq!(closest.len(), 5);
        for pair in closest.windows(2) {
            assert!(pair[0].distance_to(&target) <= pair[1].distance_to(&target));
        }
        assert_eq!(closest[0].node_id, prefixed(5, 0));
    }

    #[test]
    fn test_random_id_lands_in_bucket() {
        let table = RoutingTable::new(id([0x3C; ID_LEN]), 20);
        for idx in [0usize, 7, 8, 63, 159] {
            let random = table.random_id_in_bucket(idx);
            assert_eq!(table.bucket_index(&random), Some(idx));
        }
    }

    #[test]
    fn test_find_node_lookup() {
        let target = id([0xFF; ID_LEN]);
        let seeds: Vec<NodeInfo> = (1..=5u8)
            .map(|i| make_node_with_id(prefixed(i, 0)))
            .collect();

        let mut lookup = FindNodeLookup::new(target, seeds, 3, 20);
        assert!(!lookup.is_complete());

        let batch = lookup.next_queries();
        assert_eq!(batch.len(), 3);

        let response_nodes: Vec<NodeInfo> = (10..=12u8)
            .map(|i| make_node_with_id(prefixed(0xF0, i)))
            .collect();
        lookup.add_responses(response_nodes);

        let batch2 = lookup.next_queries();
        assert_eq!(batch2[0].node_id, prefixed(0xF0, 12));
    }

    #[test]
    fn test_lookup_convergence_drops_failures() {
        let target = id([0x42; ID_LEN]);
        let seeds: Vec<NodeInfo> = (1..=3u8)
            .map(|i| make_node_with_id(prefixed(i, 0)))
            .collect();

        let mut lookup = FindNodeLookup::new(target, seeds, 3, 20);
        let batch = lookup.next_queries();
        lookup.mark_failed(&batch[0]);
        assert!(lookup.next_queries().is_empty());

        assert!(lookup.is_complete());
        let results = lookup.results();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|n| n.node_id != batch[0].node_id));

        // A failed node re-advertised by a peer is not reconsidered.
        lookup.add_responses(vec![batch[0].clone()]);
        assert!(lookup.next_queries().is_empty());
    }

    #[test]
    fn test_failed_forged_address_keeps_real_contact() {
        let target = id([0x42; ID_LEN]);
        let real = make_node_with_id(prefixed(0x40, 1));
        let forged = NodeInfo::new(real.node_id, "10.9.9.9:9".parse().expect("addr"));

        let mut lookup = FindNodeLookup::new(target, vec![forged.clone()], 3, 20);
        let batch = lookup.next_queries();
        assert_eq!(batch, vec![forged.clone()]);
        lookup.mark_failed(&forged);

        // The forged address stays excluded; the real one is still queried.
        lookup.add_responses(vec![forged, real.clone()]);
        assert_eq!(lookup.next_queries(), vec![real.clone()]);
        assert_eq!(lookup.results(), vec![real]);
    }
}
