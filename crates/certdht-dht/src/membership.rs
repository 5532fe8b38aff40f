//! Reactions to routing-table changes.
//!
//! The RPC layer never issues follow-up calls from inside a handler. When a
//! verified peer is added for the first time, or lands in a full bucket, it
//! posts a [`MembershipEvent`]; [`run`] consumes those and performs the
//! network work on its own tasks.
//!
//! ## Key transfer
//!
//! When peer `J` joins, each locally held key `K` is checked against the `k`
//! nearest known neighbours of `K` (excluding `J`):
//!
//! - no neighbours: transfer
//! - `J` closer to `K` than the farthest neighbour, and the local node closer
//!   than the nearest neighbour: transfer
//! - otherwise: keep
//!
//! Set-valued keys go out as `append`, everything else as `store`. Certificate
//! keys are never transferred unless they are set-valued. The number of
//! `store` calls per join is capped by `transfer_batch_limit`.

use std::sync::Arc;

use certdht_transport::{Transport, Value};
use certdht_types::{NodeId, NodeInfo};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::kademlia::RoutingTable;
use crate::protocol::RpcLayer;
use crate::storage::ValueStore;

/// Routing-table change that needs network follow-up.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MembershipEvent {
    /// A verified peer was inserted into the routing table for the first time.
    Joined(NodeInfo),
    /// A verified peer maps to a full bucket; `stale` is that bucket's
    /// least-recently-seen entry.
    BucketFull { stale: NodeInfo, candidate: NodeInfo },
}

/// The calls a key transfer will issue.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct TransferPlan {
    pub appends: Vec<(NodeId, Vec<Vec<u8>>)>,
    pub stores: Vec<(NodeId, Vec<u8>)>,
    /// Eligible keys left out because of the store limit.
    pub deferred: usize,
}

impl TransferPlan {
    pub fn is_empty(&self) -> bool {
        self.appends.is_empty() && self.stores.is_empty()
    }
}

/// Whether `new_node` should receive a copy of `key`.
///
/// `neighbors` are the nearest known contacts of `key`, nearest first.
pub fn should_transfer(
    local_id: &NodeId,
    new_node: &NodeId,
    key: &NodeId,
    neighbors: &[NodeInfo],
) -> bool {
    match (neighbors.first(), neighbors.last()) {
        (Some(nearest), Some(farthest)) => {
            let new_node_close = new_node.distance(key) < farthest.distance_to(key);
            let local_closest = local_id.distance(key) < nearest.distance_to(key);
            new_node_close && local_closest
        }
        _ => true,
    }
}

/// Work out which keys `new_node` should receive.
///
/// Keys are visited in ascending order so the outcome does not depend on
/// hash-map iteration order. `store_limit` of `None` means unlimited.
pub fn plan_transfer(
    routing: &RoutingTable,
    values: &ValueStore,
    new_node: &NodeId,
    store_limit: Option<usize>,
) -> TransferPlan {
    let local_id = routing.local_id();
    let mut items = values.items();
    items.sort_by(|a, b| a.0.cmp(&b.0));

    let mut plan = TransferPlan::default();
    for (key, value) in items {
        let is_set = values.is_set_key(&key);
        if values.is_certificate_key(&key) && !is_set {
            continue;
        }

        let neighbors = routing.find_neighbors(&key, routing.ksize(), Some(new_node));
        if !should_transfer(local_id, new_node, &key, &neighbors) {
            continue;
        }

        match (is_set, value) {
            (true, Value::Set(members)) => plan.appends.push((key, members)),
            (true, Value::Blob(blob)) => plan.appends.push((key, vec![blob])),
            (false, value) => {
                if store_limit.is_some_and(|limit| plan.stores.len() >= limit) {
                    plan.deferred += 1;
                    continue;
                }
                let blob = match value {
                    Value::Blob(blob) => blob,
                    Value::Set(members) => members.concat(),
                };
                plan.stores.push((key, blob));
            }
        }
    }
    plan
}

/// Outcome of one key transfer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TransferReport {
    pub sent: usize,
    pub failed: usize,
    pub deferred: usize,
}

/// Replicate the keys `peer` should now hold.
pub async fn transfer_keys<T: Transport>(rpc: &RpcLayer<T>, peer: &NodeInfo) -> TransferReport {
    let plan = {
        let routing = rpc.routing().lock().await;
        let values = rpc.values().read().await;
        plan_transfer(
            &routing,
            &values,
            &peer.node_id,
            rpc.config().transfer_limit(),
        )
    };

    let mut report = TransferReport {
        deferred: plan.deferred,
        ..TransferReport::default()
    };
    if plan.deferred > 0 {
        warn!(
            peer = %peer.node_id,
            deferred = plan.deferred,
            "key transfer limit reached, eligible keys left untransferred"
        );
    }

    for (key, members) in plan.appends {
        match rpc.call_append(peer, key, members).await {
            Ok(()) => report.sent += 1,
            Err(e) => {
                debug!(peer = %peer.node_id, key = %key, error = %e, kind = %e.kind(), "append transfer failed");
                report.failed += 1;
            }
        }
    }
    for (key, value) in plan.stores {
        match rpc.call_store(peer, key, value).await {
            Ok(()) => report.sent += 1,
            Err(e) => {
                debug!(peer = %peer.node_id, key = %key, error = %e, kind = %e.kind(), "store transfer failed");
                report.failed += 1;
            }
        }
    }

    if report.sent > 0 {
        info!(peer = %peer.node_id, sent = report.sent, "transferred keys to new peer");
    }
    report
}

/// Ping the least-recently-seen entry of a full bucket; replace it with
/// `candidate` if it does not answer.
pub async fn check_stale<T: Transport>(rpc: &RpcLayer<T>, stale: &NodeInfo, candidate: &NodeInfo) {
    match rpc.call_ping(stale, false).await {
        Ok(_) => debug!(stale = %stale.node_id, candidate = %candidate.node_id, "stale entry alive, candidate dropped"),
        Err(e) => {
            info!(stale = %stale.node_id, candidate = %candidate.node_id, error = %e, "evicting unresponsive entry");
            rpc.routing().lock().await.remove_node(&stale.node_id);
            rpc.welcome(candidate).await;
        }
    }
}

/// Consume membership events until the channel closes.
pub async fn run<T: Transport>(
    rpc: Arc<RpcLayer<T>>,
    mut events: mpsc::UnboundedReceiver<MembershipEvent>,
) {
    while let Some(event) = events.recv().await {
        let rpc = Arc::clone(&rpc);
        match event {
            MembershipEvent::Joined(peer) => {
                tokio::spawn(async move {
                    transfer_keys(&rpc, &peer).await;
                });
            }
            MembershipEvent::BucketFull { stale, candidate } => {
                tokio::spawn(async move {
                    check_stale(&rpc, &stale, &candidate).await;
                });
            }
        }
    }
    debug!("membership worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use certdht_crypto::hash::digest;
    use certdht_types::ID_LEN;
    use std::time::Duration;

    fn node(first: u8) -> NodeInfo {
        let mut id = [0u8; ID_LEN];
        id[0] = first;
        NodeInfo::new(
            NodeId::from_bytes(id),
            format!("127.0.0.1:{}", 4000 + first as u16).parse().expect("addr"),
        )
    }

    fn id(first: u8) -> NodeId {
        node(first).node_id
    }

    fn values() -> ValueStore {
        ValueStore::with_ttl(Duration::from_secs(60))
    }

    #[test]
    fn test_should_transfer_without_neighbors() {
        assert!(should_transfer(&id(1), &id(2), &id(3), &[]));
    }

    #[test]
    fn test_should_transfer_rule() {
        // key = 0x00.., local = 0x01 (distance 1), neighbours at 0x10 and 0x40.
        let key = id(0x00);
        let neighbors = vec![node(0x10), node(0x40)];

        // Joiner at 0x20 is inside the neighbour set and the local node is nearest.
        assert!(should_transfer(&id(0x01), &id(0x20), &key, &neighbors));
        // Joiner beyond every neighbour.
        assert!(!should_transfer(&id(0x01), &id(0x80), &key, &neighbors));
        // Local node is not the nearest holder.
        assert!(!should_transfer(&id(0x18), &id(0x20), &key, &neighbors));
    }

    #[test]
    fn test_plan_respects_store_limit() {
        let routing = RoutingTable::new(id(0x01), 20);
        let mut store = values();
        store.store(digest(b"one"), b"1".to_vec());
        store.store(digest(b"two"), b"2".to_vec());
        store.store(digest(b"three"), b"3".to_vec());
        store.append(digest(b"set"), vec![b"a".to_vec(), b"b".to_vec()]);

        let plan = plan_transfer(&routing, &store, &id(0x02), Some(1));
        assert_eq!(plan.stores.len(), 1);
        assert_eq!(plan.deferred, 2);
        assert_eq!(
            plan.appends,
            vec![(digest(b"set"), vec![b"a".to_vec(), b"b".to_vec()])]
        );

        let unlimited = plan_transfer(&routing, &store, &id(0x02), None);
        assert_eq!(unlimited.stores.len(), 3);
        assert_eq!(unlimited.deferred, 0);
    }

    #[test]
    fn test_plan_skips_certificate_keys() {
        let routing = RoutingTable::new(id(0x01), 20);
        let mut store = values();
        store.store_certificate(digest(b"AAcert"), "pem");
        let plan = plan_transfer(&routing, &store, &id(0x02), None);
        assert!(plan.is_empty());
    }

    #[test]
    fn test_plan_excludes_joiner_from_neighbors() {
        let mut routing = RoutingTable::new(id(0x01), 20);
        let joiner = node(0x02);
        routing.add_node(node(0x70));
        routing.add_node(joiner.clone());

        let mut store = values();
        let key = id(0x00);
        store.store(key, b"v".to_vec());

        // With the joiner excluded the only neighbour is 0x70: the joiner is
        // closer than it and the local node is closer still.
        let plan = plan_transfer(&routing, &store, &joiner.node_id, None);
        assert_eq!(plan.stores, vec![(key, b"v".to_vec())]);

        // A joiner farther than every neighbour gets nothing.
        let far = plan_transfer(&routing, &store, &id(0xF0), None);
        assert!(far.is_empty());
    }
}
