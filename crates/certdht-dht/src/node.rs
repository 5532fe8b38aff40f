//! A running DHT node.
//!
//! [`DhtNode::start`] loads key material, checks that the private key belongs
//! to the node's certificate, seeds the trust store with that certificate,
//! and spawns three tasks:
//!
//! - the request loop, answering each inbound request on its own task
//! - the membership worker (key transfer, stale-entry checks)
//! - maintenance: value expiry and stale-bucket refresh every
//!   `refresh_interval_secs`
//!
//! The tasks stop when the node is shut down or dropped.

use std::net::SocketAddr;
use std::sync::Arc;

use certdht_crypto::hash::digest;
use certdht_transport::{InboundRequest, Transport, Value};
use certdht_types::{NodeId, NodeInfo};
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::adversary::HandlerStrategy;
use crate::bootstrap::{self, BootstrapReport, BootstrapState, SeedNode};
use crate::config::DhtConfig;
use crate::crawl::{node_crawl, refresh_stale_buckets, value_crawl};
use crate::membership;
use crate::pki::CertificateDirectory;
use crate::protocol::{LocalIdentity, RpcLayer};
use crate::storage::ValueStore;
use crate::trust::TrustStore;
use crate::{DhtError, Result};

/// A DHT participant bound to a transport.
pub struct DhtNode<T: Transport> {
    rpc: Arc<RpcLayer<T>>,
    state: watch::Sender<BootstrapState>,
    tasks: Vec<JoinHandle<()>>,
}

impl<T: Transport> DhtNode<T> {
    /// Load identity from `directory` and start serving `inbound`.
    ///
    /// # Errors
    ///
    /// - [`DhtError::Config`] for invalid configuration
    /// - [`DhtError::Pki`] / [`DhtError::Crypto`] if key material cannot be
    ///   loaded or the key does not match the certificate
    /// - [`DhtError::CertificateUntrusted`] if our own certificate does not
    ///   chain to the configured roots
    pub async fn start(
        config: DhtConfig,
        directory: Arc<dyn CertificateDirectory>,
        transport: T,
        inbound: mpsc::Receiver<InboundRequest>,
        strategy: HandlerStrategy,
    ) -> Result<Self> {
        config.validate()?;

        let loader = Arc::clone(&directory);
        let (signer, certificate, roots) = tokio::task::spawn_blocking(move || {
            Ok::<_, DhtError>((
                loader.load_private_key()?,
                loader.load_own_certificate()?,
                loader.load_trusted_roots()?,
            ))
        })
        .await
        .map_err(|e| DhtError::Pki(format!("key loading task failed: {e}")))??;

        if signer.public_key() != *certificate.public_key() {
            return Err(DhtError::Pki(
                "private key does not match the node certificate".into(),
            ));
        }
        roots
            .verify(&certificate)
            .map_err(|e| DhtError::CertificateUntrusted(e.to_string()))?;

        let info = NodeInfo::new(certificate.node_id(), transport.local_addr());
        let values = Arc::new(RwLock::new(ValueStore::with_ttl(config.value_ttl())));
        let trust = Arc::new(TrustStore::new(roots, directory, Arc::clone(&values)));
        trust.store(&certificate, &info.node_id).await;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let identity = LocalIdentity {
            info: info.clone(),
            certificate,
            signer: Arc::new(signer),
        };
        let rpc = Arc::new(RpcLayer::new(
            identity,
            config,
            Arc::new(transport),
            trust,
            values,
            strategy,
            events_tx,
        ));

        let tasks = vec![
            tokio::spawn(serve(Arc::clone(&rpc), inbound)),
            tokio::spawn(membership::run(Arc::clone(&rpc), events_rx)),
            tokio::spawn(maintain(Arc::clone(&rpc))),
        ];
        let (state, _) = watch::channel(BootstrapState::Unstarted);

        info!(node = %info, ?strategy, "DHT node started");
        Ok(Self { rpc, state, tasks })
    }

    /// Join the network through `seeds`.
    pub async fn bootstrap(&self, seeds: &[SeedNode]) -> Result<BootstrapReport> {
        bootstrap::bootstrap(&self.rpc, seeds, &self.state).await
    }

    pub fn state(&self) -> BootstrapState {
        *self.state.borrow()
    }

    /// Watch bootstrap progress.
    pub fn subscribe_state(&self) -> watch::Receiver<BootstrapState> {
        self.state.subscribe()
    }

    pub fn node_id(&self) -> NodeId {
        *self.rpc.local_id()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.rpc.local().addr
    }

    pub fn info(&self) -> NodeInfo {
        self.rpc.local().clone()
    }

    /// The RPC layer, for direct calls.
    pub fn rpc(&self) -> &Arc<RpcLayer<T>> {
        &self.rpc
    }

    /// Store `value` under `SHA-1(key)` locally and on the `k` closest nodes.
    ///
    /// Returns how many remote nodes acknowledged.
    pub async fn set(&self, key: &[u8], value: Vec<u8>) -> usize {
        let key = digest(key);
        self.rpc.values().write().await.store(key, value.clone());

        let targets = self.closest_nodes(key).await;
        let mut tasks = JoinSet::new();
        for peer in targets {
            let rpc = Arc::clone(&self.rpc);
            let value = value.clone();
            tasks.spawn(async move { rpc.call_store(&peer, key, value).await });
        }
        self.count_acks(key, tasks).await
    }

    /// Merge `values` into the set under `SHA-1(key)` locally and on the `k`
    /// closest nodes.
    pub async fn append(&self, key: &[u8], values: Vec<Vec<u8>>) -> usize {
        let key = digest(key);
        self.rpc.values().write().await.append(key, values.clone());

        let targets = self.closest_nodes(key).await;
        let mut tasks = JoinSet::new();
        for peer in targets {
            let rpc = Arc::clone(&self.rpc);
            let values = values.clone();
            tasks.spawn(async move { rpc.call_append(&peer, key, values).await });
        }
        self.count_acks(key, tasks).await
    }

    /// The value under `SHA-1(key)`, from the local store or the network.
    pub async fn get(&self, key: &[u8]) -> Option<Value> {
        let key = digest(key);
        if let Some(value) = self.rpc.values().read().await.get(&key) {
            return Some(value.clone());
        }
        let seeds = self.rpc.neighbors(&key, None).await;
        value_crawl(&self.rpc, key, seeds).await
    }

    /// Expire values and refresh stale buckets now.
    pub async fn refresh(&self) -> usize {
        self.rpc.values().write().await.expire();
        refresh_stale_buckets(&self.rpc).await
    }

    /// Stop the node's background tasks.
    pub fn shutdown(mut self) {
        self.abort_tasks();
    }

    fn abort_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }

    async fn closest_nodes(&self, key: NodeId) -> Vec<NodeInfo> {
        let seeds = self.rpc.neighbors(&key, None).await;
        node_crawl(&self.rpc, key, seeds).await
    }

    async fn count_acks(&self, key: NodeId, mut tasks: JoinSet<Result<()>>) -> usize {
        let mut acked = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => acked += 1,
                Ok(Err(e)) => debug!(key = %key, error = %e, kind = %e.kind(), "remote store failed"),
                Err(e) => warn!(error = %e, "store task failed"),
            }
        }
        info!(key = %key, acked, "value published");
        acked
    }
}

impl<T: Transport> Drop for DhtNode<T> {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

async fn serve<T: Transport>(rpc: Arc<RpcLayer<T>>, mut inbound: mpsc::Receiver<InboundRequest>) {
    while let Some(InboundRequest {
        from,
        request,
        reply,
    }) = inbound.recv().await
    {
        let rpc = Arc::clone(&rpc);
        tokio::spawn(async move {
            let response = rpc.handle_request(from, request).await;
            let _ = reply.send(response);
        });
    }
    debug!("inbound channel closed, request loop stopped");
}

async fn maintain<T: Transport>(rpc: Arc<RpcLayer<T>>) {
    let mut ticker = tokio::time::interval(rpc.config().refresh_interval());
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let expired = rpc.values().write().await.expire();
        let refreshed = refresh_stale_buckets(&rpc).await;
        debug!(expired, refreshed, "maintenance pass");
    }
}
