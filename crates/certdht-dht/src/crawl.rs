//! Iterative lookups.
//!
//! Both crawls drive a [`FindNodeLookup`]: query `alpha` unqueried candidates
//! at a time, merge what they return, and stop once the `k` closest
//! candidates have all been asked. Peers that fail (timeout, NACK, bad
//! signature) are dropped from the candidate set. Only certified contacts
//! ever become candidates, since bucket replies are filtered by the RPC layer.

use std::sync::Arc;

use certdht_transport::{Transport, Value};
use certdht_types::{NodeId, NodeInfo};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::kademlia::FindNodeLookup;
use crate::protocol::{FindValueResult, RpcLayer};

/// Find the `k` closest reachable nodes to `target`, starting from `seeds`.
pub async fn node_crawl<T: Transport>(
    rpc: &Arc<RpcLayer<T>>,
    target: NodeId,
    seeds: Vec<NodeInfo>,
) -> Vec<NodeInfo> {
    let config = rpc.config();
    let mut lookup = FindNodeLookup::new(target, seeds, config.alpha, config.ksize);

    loop {
        let batch = lookup.next_queries();
        if batch.is_empty() {
            break;
        }

        let mut tasks = JoinSet::new();
        for peer in batch {
            let rpc = Arc::clone(rpc);
            tasks.spawn(async move {
                let result = rpc.call_find_node(&peer, target).await;
                (peer, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(nodes))) => lookup.add_responses(nodes),
                Ok((peer, Err(e))) => {
                    debug!(peer = %peer.node_id, error = %e, kind = %e.kind(), "lookup peer failed");
                    lookup.mark_failed(&peer);
                }
                Err(e) => warn!(error = %e, "lookup task failed"),
            }
        }
    }

    let results = lookup.results();
    debug!(target = %target, found = results.len(), "node crawl finished");
    results
}

/// Look `key` up across the network, starting from `seeds`.
///
/// Returns the first value any queried peer holds.
pub async fn value_crawl<T: Transport>(
    rpc: &Arc<RpcLayer<T>>,
    key: NodeId,
    seeds: Vec<NodeInfo>,
) -> Option<Value> {
    let config = rpc.config();
    let mut lookup = FindNodeLookup::new(key, seeds, config.alpha, config.ksize);

    loop {
        let batch = lookup.next_queries();
        if batch.is_empty() {
            break;
        }

        let mut tasks = JoinSet::new();
        for peer in batch {
            let rpc = Arc::clone(rpc);
            tasks.spawn(async move {
                let result = rpc.call_find_value(&peer, key).await;
                (peer, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((peer, Ok(FindValueResult::Found(value)))) => {
                    debug!(key = %key, peer = %peer.node_id, "value found");
                    return Some(value);
                }
                Ok((_, Ok(FindValueResult::Closer(nodes)))) => lookup.add_responses(nodes),
                Ok((peer, Err(e))) => {
                    debug!(peer = %peer.node_id, error = %e, kind = %e.kind(), "value lookup peer failed");
                    lookup.mark_failed(&peer);
                }
                Err(e) => warn!(error = %e, "value lookup task failed"),
            }
        }
    }

    debug!(key = %key, "value not found");
    None
}

/// Crawl a random id in every bucket not refreshed within the refresh
/// interval. Returns the number of buckets refreshed.
pub async fn refresh_stale_buckets<T: Transport>(rpc: &Arc<RpcLayer<T>>) -> usize {
    let interval = rpc.config().refresh_interval();
    let targets: Vec<(usize, NodeId)> = {
        let routing = rpc.routing().lock().await;
        routing
            .stale_buckets(interval)
            .into_iter()
            .map(|idx| (idx, routing.random_id_in_bucket(idx)))
            .collect()
    };

    for (idx, target) in &targets {
        let seeds = rpc.neighbors(target, None).await;
        node_crawl(rpc, *target, seeds).await;
        rpc.routing().lock().await.mark_bucket_refreshed(*idx);
    }
    targets.len()
}
