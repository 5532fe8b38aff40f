//! Integration test: network formation over the in-memory transport.
//!
//! 1. A first node starts a network with no seeds
//! 2. Further nodes join through it and crawl for their own id
//! 3. Every routing table holds only certified contacts at real addresses
//! 4. `set` reaches the other nodes and `get` finds the value remotely
//! 5. Unusable seeds leave the joiner waiting for seed replies

use std::time::Duration;

use certdht_crypto::fixtures::TestCa;
use certdht_crypto::hash::digest;
use certdht_dht::bootstrap::{BootstrapState, SeedNode};
use certdht_dht::protocol::FindValueResult;
use certdht_dht::DhtError;
use certdht_integration_tests::{settle, Cluster, ClusterNode};
use certdht_transport::Value;

async fn assert_routing_certified(cluster: &Cluster, member: &ClusterNode) {
    let contacts = member.node.rpc().routing().lock().await.all_nodes();
    for contact in contacts {
        assert!(
            member.node.rpc().trust().has(&contact.node_id).await,
            "routing entry {} has no trusted certificate",
            contact.node_id
        );
        assert_eq!(
            cluster.address_of(&contact.node_id),
            Some(contact.addr),
            "routing entry {} carries the wrong address",
            contact.node_id
        );
    }
}

#[tokio::test]
async fn network_bootstrap_four_nodes() {
    let mut cluster = Cluster::new().expect("cluster");

    // =========================================================
    // Step 1: First node starts the network
    // =========================================================
    let first = cluster.spawn().await.expect("spawn first");
    let report = first.node.bootstrap(&[]).await.expect("bootstrap first");
    assert_eq!(report.seed, None);
    assert_eq!(first.node.state(), BootstrapState::Ready);

    // =========================================================
    // Step 2: Three more nodes join through the first
    // =========================================================
    let mut members = Vec::new();
    for _ in 0..3 {
        let member = cluster.spawn().await.expect("spawn member");
        let report = member
            .node
            .bootstrap(&[first.seed()])
            .await
            .expect("bootstrap member");
        assert_eq!(report.seed, Some(first.id()));
        assert_eq!(member.node.state(), BootstrapState::Ready);
        members.push(member);
    }

    // The seed has verified every joiner.
    let seed_routing = first.node.rpc().routing().lock().await.all_nodes();
    assert_eq!(seed_routing.len(), 3, "seed should know all joiners");

    // The last joiner found the earlier ones through the crawl.
    let last = &members[2];
    for earlier in &members[..2] {
        assert!(
            last.node
                .rpc()
                .routing()
                .lock()
                .await
                .contains(&earlier.id()),
            "last joiner should have discovered {}",
            earlier.id()
        );
    }

    // =========================================================
    // Step 3: Routing tables hold certified contacts only
    // =========================================================
    assert_routing_certified(&cluster, &first).await;
    for member in &members {
        assert_routing_certified(&cluster, member).await;
    }

    // =========================================================
    // Step 4: set on one node, get everywhere
    // =========================================================
    let acked = members[0].node.set(b"colour", b"teal".to_vec()).await;
    assert_eq!(acked, 3, "every other node should acknowledge the store");

    let key = digest(b"colour");
    for other in std::iter::once(&first).chain(&members[1..]) {
        let held = other.node.rpc().values().read().await.get(&key).cloned();
        assert_eq!(held, Some(Value::Blob(b"teal".to_vec())));
    }

    // Fetch over the wire rather than from the local store.
    let found = members[2]
        .node
        .rpc()
        .call_find_value(&members[1].info(), key)
        .await
        .expect("find_value");
    assert_eq!(found, FindValueResult::Found(Value::Blob(b"teal".to_vec())));

    // =========================================================
    // Step 5: append merges sets across the network
    // =========================================================
    members[1]
        .node
        .append(b"peers", vec![b"alpha".to_vec()])
        .await;
    members[2]
        .node
        .append(b"peers", vec![b"beta".to_vec(), b"alpha".to_vec()])
        .await;
    let merged = first.node.get(b"peers").await;
    assert_eq!(
        merged,
        Some(Value::Set(vec![b"alpha".to_vec(), b"beta".to_vec()]))
    );
}

#[tokio::test]
async fn network_get_crawls_for_remote_value() {
    let mut cluster = Cluster::new().expect("cluster");
    let first = cluster.spawn().await.expect("spawn");
    first.node.bootstrap(&[]).await.expect("bootstrap");
    let second = cluster.join(&first).await.expect("join");
    settle().await;

    // Held only by `first`, never replicated.
    let key = digest(b"motd");
    first
        .node
        .rpc()
        .values()
        .write()
        .await
        .store(key, b"hello".to_vec());

    assert!(second.node.rpc().values().read().await.get(&key).is_none());
    assert_eq!(
        second.node.get(b"motd").await,
        Some(Value::Blob(b"hello".to_vec()))
    );
    assert_eq!(second.node.get(b"nobody-has-this").await, None);
}

#[tokio::test]
async fn network_bootstrap_waits_for_transport() {
    let mut cluster = Cluster::new().expect("cluster");
    let first = cluster.spawn().await.expect("spawn");
    first.node.bootstrap(&[]).await.expect("bootstrap");

    let joiner = cluster.spawn().await.expect("spawn joiner");
    joiner.node.rpc().transport().set_ready(false);
    let mut state = joiner.node.subscribe_state();

    let seeds = [first.seed()];
    let bootstrap = joiner.node.bootstrap(&seeds);
    let watcher = async {
        state
            .wait_for(|s| *s == BootstrapState::AwaitingTransport)
            .await
            .expect("state channel");
        joiner.node.rpc().transport().set_ready(true);
    };
    let (report, ()) = tokio::join!(bootstrap, watcher);

    assert_eq!(report.expect("bootstrap").seed, Some(first.id()));
    assert_eq!(joiner.node.state(), BootstrapState::Ready);
}

#[tokio::test]
async fn network_bootstrap_rejects_untrusted_seed() {
    let mut cluster = Cluster::new().expect("cluster");
    let first = cluster.spawn().await.expect("spawn");
    first.node.bootstrap(&[]).await.expect("bootstrap");

    // A seed certificate from a foreign CA is never trusted, so the seed's
    // reply cannot be verified.
    let foreign = TestCa::new("foreign root").expect("ca");
    let impostor = foreign.issue("impostor").expect("issue");
    let joiner = cluster.spawn().await.expect("spawn joiner");
    let result = joiner
        .node
        .bootstrap(&[SeedNode {
            addr: first.addr(),
            certificate: impostor.certificate_pem.clone(),
        }])
        .await;

    assert!(matches!(result, Err(DhtError::BootstrapFailed(_))));
    assert_eq!(joiner.node.state(), BootstrapState::AwaitingSeedReplies);
    assert!(joiner.node.rpc().routing().lock().await.is_empty());
}

#[tokio::test]
async fn network_bootstrap_unreachable_seed() {
    let mut cluster = Cluster::new().expect("cluster");
    let first = cluster.spawn().await.expect("spawn");
    let seed = first.seed();
    cluster.net.disconnect(first.addr()).await;

    let joiner = cluster.spawn().await.expect("spawn joiner");
    let started = tokio::time::Instant::now();
    let result = joiner.node.bootstrap(&[seed]).await;

    assert!(matches!(result, Err(DhtError::BootstrapFailed(_))));
    assert_eq!(joiner.node.state(), BootstrapState::AwaitingSeedReplies);
    assert!(started.elapsed() < Duration::from_secs(2));

    // The seed's certificate was still trusted up front.
    assert!(joiner.node.rpc().trust().has(&first.id()).await);
}
