//! Network bootstrap logic for joining the DHT.
//!
//! When a new node starts, it must authenticate against a seed node to
//! populate its routing table. The bootstrap process:
//!
//! 1. Wait until the transport is ready, polling every `transport_retry_secs`.
//! 2. Trust the first seed's certificate, derive its id from it, and send it
//!    a signed `ping` carrying our own certificate.
//! 3. If the seed's reply verifies and the seed is a fresh contact, crawl for
//!    our own id to discover nearby peers.
//!
//! Only the first seed is contacted. A seed that cannot be authenticated
//! leaves the node in [`BootstrapState::AwaitingSeedReplies`]; there is no
//! automatic retry.
//!
//! Progress is published on a [`watch`] channel.

use std::net::SocketAddr;
use std::sync::Arc;

use certdht_crypto::Certificate;
use certdht_transport::Transport;
use certdht_types::{socket_addr_serde, NodeId, NodeInfo};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::crawl::node_crawl;
use crate::protocol::RpcLayer;
use crate::{DhtError, Result};

/// Bootstrap progress.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BootstrapState {
    Unstarted,
    AwaitingTransport,
    PingingSeed,
    AwaitingSeedReplies,
    Crawling,
    Ready,
}

/// A seed node endpoint for bootstrapping.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedNode {
    /// The seed node's network address.
    #[serde(with = "socket_addr_serde")]
    pub addr: SocketAddr,
    /// The seed node's certificate (PEM). Its id is derived from this.
    pub certificate: String,
}

/// The result of a bootstrap attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BootstrapReport {
    /// The authenticated seed, if any seed was configured.
    pub seed: Option<NodeId>,
    /// Number of peers the crawl returned.
    pub peers_discovered: usize,
}

/// Join the network through `seeds`.
///
/// An empty seed list makes this node the first in its network: it is ready
/// immediately.
///
/// # Errors
///
/// [`DhtError::BootstrapFailed`] if the seed certificate is unusable or the
/// seed's reply cannot be authenticated.
pub async fn bootstrap<T: Transport>(
    rpc: &Arc<RpcLayer<T>>,
    seeds: &[SeedNode],
    state: &watch::Sender<BootstrapState>,
) -> Result<BootstrapReport> {
    state.send_replace(BootstrapState::AwaitingTransport);
    while !rpc.transport().is_ready() {
        debug!("transport not ready, retrying bootstrap");
        tokio::time::sleep(rpc.config().transport_retry()).await;
    }

    let Some(seed) = seeds.first() else {
        info!("no seeds configured, starting a new network");
        state.send_replace(BootstrapState::Ready);
        return Ok(BootstrapReport {
            seed: None,
            peers_discovered: 0,
        });
    };
    if seeds.len() > 1 {
        debug!(ignored = seeds.len() - 1, "only the first seed is contacted");
    }

    state.send_replace(BootstrapState::PingingSeed);
    let cert = Certificate::from_pem(&seed.certificate)
        .map_err(|e| DhtError::BootstrapFailed(format!("seed certificate: {e}")))?;
    let seed_info = NodeInfo::new(cert.node_id(), seed.addr);
    info!(seed = %seed_info, "bootstrapping");

    rpc.trust().store(&cert, &seed_info.node_id).await;
    let is_new = rpc.routing().lock().await.is_new_node(&seed_info.node_id);

    state.send_replace(BootstrapState::AwaitingSeedReplies);
    if let Err(e) = rpc.call_ping(&seed_info, true).await {
        warn!(seed = %seed_info, error = %e, kind = %e.kind(), "seed did not authenticate");
        return Err(DhtError::BootstrapFailed(format!(
            "seed {} did not authenticate: {e}",
            seed_info.node_id
        )));
    }

    let mut peers_discovered = 0;
    if is_new {
        state.send_replace(BootstrapState::Crawling);
        let local_id = *rpc.local_id();
        let seeds = rpc.neighbors(&local_id, None).await;
        peers_discovered = node_crawl(rpc, local_id, seeds).await.len();
    }

    state.send_replace(BootstrapState::Ready);
    info!(
        seed = %seed_info.node_id,
        peers_discovered,
        contacts = rpc.routing().lock().await.len(),
        "bootstrap complete"
    );
    Ok(BootstrapReport {
        seed: Some(seed_info.node_id),
        peers_discovered,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seed_node_toml() {
        let seed: SeedNode = toml::from_str(
            "addr = \"192.0.2.10:5000\"\ncertificate = \"-----BEGIN CERTIFICATE-----\"",
        )
        .expect("parse");
        assert_eq!(seed.addr, "192.0.2.10:5000".parse().expect("addr"));
        assert!(seed.certificate.starts_with("-----BEGIN"));
    }

    #[test]
    fn test_seed_node_bad_addr() {
        let parsed: std::result::Result<SeedNode, _> =
            toml::from_str("addr = \"not-an-addr\"\ncertificate = \"\"");
        assert!(parsed.is_err());
    }
}
