//! Multi-node harness for the certdht integration tests.
//!
//! A [`Cluster`] owns one test CA and one in-memory network. Every node it
//! spawns gets a fresh certificate under that CA and its own address, so the
//! tests exercise the full authenticated path without sockets.
//!
//! Run all integration tests:
//! ```sh
//! cargo test -p certdht-integration-tests
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use certdht_crypto::fixtures::TestCa;
use certdht_crypto::Certificate;
use certdht_dht::adversary::HandlerStrategy;
use certdht_dht::bootstrap::SeedNode;
use certdht_dht::pki::MemoryDirectory;
use certdht_dht::{DhtConfig, DhtNode, Result};
use certdht_transport::{MemoryNetwork, MemoryTransport};
use certdht_types::{NodeId, NodeInfo};

/// A node plus the certificate it was issued.
pub struct ClusterNode {
    pub node: DhtNode<MemoryTransport>,
    pub certificate_pem: String,
    pub certificate: Certificate,
}

impl ClusterNode {
    pub fn id(&self) -> NodeId {
        self.node.node_id()
    }

    pub fn info(&self) -> NodeInfo {
        self.node.info()
    }

    pub fn addr(&self) -> SocketAddr {
        self.node.local_addr()
    }

    /// This node as a bootstrap seed.
    pub fn seed(&self) -> SeedNode {
        SeedNode {
            addr: self.addr(),
            certificate: self.certificate_pem.clone(),
        }
    }
}

/// A CA, a network, and address allocation.
pub struct Cluster {
    pub ca: TestCa,
    pub net: MemoryNetwork,
    config: DhtConfig,
    next_port: u16,
    addresses: HashMap<NodeId, SocketAddr>,
}

impl Cluster {
    pub fn new() -> Result<Self> {
        Self::with_config(DhtConfig {
            rpc_timeout_secs: 1,
            ..DhtConfig::default()
        })
    }

    pub fn with_config(config: DhtConfig) -> Result<Self> {
        Ok(Self {
            ca: TestCa::new("certdht test root")?,
            net: MemoryNetwork::new(),
            config,
            next_port: 7000,
            addresses: HashMap::new(),
        })
    }

    /// Start an honest node. It is not bootstrapped.
    pub async fn spawn(&mut self) -> Result<ClusterNode> {
        self.spawn_with(HandlerStrategy::Honest).await
    }

    /// Start a node with the given handler strategy. It is not bootstrapped.
    pub async fn spawn_with(&mut self, strategy: HandlerStrategy) -> Result<ClusterNode> {
        let port = self.next_port;
        self.next_port += 1;
        let creds = self.ca.issue(&format!("node{port}"))?;
        let addr = SocketAddr::from(([10, 3, 0, 1], port));
        let (transport, inbound) = self.net.bind(addr).await;
        let directory = Arc::new(MemoryDirectory::new(
            creds.private_key_pem.clone(),
            creds.certificate_pem.clone(),
            self.ca.roots(),
        ));
        let node = DhtNode::start(self.config.clone(), directory, transport, inbound, strategy).await?;
        self.addresses.insert(node.node_id(), addr);
        Ok(ClusterNode {
            node,
            certificate_pem: creds.certificate_pem,
            certificate: creds.certificate,
        })
    }

    /// Start an honest node and join it through `seed`.
    pub async fn join(&mut self, seed: &ClusterNode) -> Result<ClusterNode> {
        let node = self.spawn().await?;
        node.node.bootstrap(&[seed.seed()]).await?;
        Ok(node)
    }

    /// The address a node was really bound at.
    pub fn address_of(&self, id: &NodeId) -> Option<SocketAddr> {
        self.addresses.get(id).copied()
    }

    /// Requests named `op` sent from `from` to `to`.
    pub async fn count_calls(&self, from: SocketAddr, to: SocketAddr, op: &str) -> usize {
        self.net
            .sent_requests()
            .await
            .iter()
            .filter(|sent| sent.from == from && sent.to == to && sent.request.call.name() == op)
            .count()
    }
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// Let background membership work run.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(200)).await;
}
