//! Misbehaving handler strategies for fault injection.
//!
//! A node built with anything other than [`HandlerStrategy::Honest`] answers
//! `find_node` and `find_value` dishonestly. It still signs every answer with
//! its own, genuinely certified key; what it lies about is content. The
//! authentication path itself is never altered, so these strategies show what
//! a certified but malicious peer can and cannot achieve.
//!
//! | Strategy | `find_node` | `find_value` |
//! |---|---|---|
//! | `Poison` | real neighbours re-pointed at the attacker's port, plus 30 fabricated ids | forged value for the bait keys, else own certificate |
//! | `Insert` | 9 ids crafted next to the bait keys | as `Poison` |
//! | `Sybil` | 30 fabricated ids | as `Poison` |
//! | `Eclipse` | the victim's entry re-pointed at the attacker (every entry, when the victim asks), plus 10 fabricated ids | forged value to the victim, honest to everyone else |
//!
//! Fabricated entries use host `10.0.0.9` and the attacker's port. Misbehaving
//! handlers skip request verification and add the asker to the routing table
//! unverified.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use certdht_crypto::hash::{certificate_key, digest};
use certdht_crypto::Challenge;
use certdht_transport::{Call, Request, Response, Transport, Value};
use certdht_types::{NodeId, NodeInfo, ID_LEN};
use rand::seq::SliceRandom;
use rand::RngCore;
use tracing::{debug, info};

use crate::protocol::RpcLayer;
use crate::Result;

/// Address advertised for fabricated contacts.
pub const FAKE_HOST: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9));

/// Value returned for bait keys.
pub const FORGED_VALUE: &[u8] = b"apelsin";

/// Keys whose lookups get [`FORGED_VALUE`].
pub const BAIT_KEYS: [&str; 3] = ["APA", "KANIN", "KOALA"];

const POISON_FAKES: usize = 30;
const SYBIL_FAKES: usize = 30;
const ECLIPSE_FAKES: usize = 10;
const POISON_SAMPLE: usize = 20;

/// Inbound handler behaviour, fixed when the node is built.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum HandlerStrategy {
    #[default]
    Honest,
    Poison,
    Insert,
    Eclipse {
        victim: NodeId,
    },
    Sybil,
}

/// Strategy plus the fabricated contacts it advertises.
pub struct Adversary {
    strategy: HandlerStrategy,
    port: u16,
    fakes: Vec<NodeInfo>,
}

fn random_id() -> NodeId {
    let mut seed = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut seed);
    digest(&seed)
}

/// The nine ids an insertion attack plants: each bait key's digest with its
/// last byte set to 1, 2 and 3.
pub fn insertion_ids() -> Vec<NodeId> {
    ["APA", "KOALA", "KANIN"]
        .iter()
        .flat_map(|bait| {
            let base = *digest(bait.as_bytes()).as_bytes();
            (1..=3u8).map(move |end| {
                let mut bytes = base;
                bytes[ID_LEN - 1] = end;
                NodeId::from_bytes(bytes)
            })
        })
        .collect()
}

impl Adversary {
    /// `port` is the attacker's own port, advertised on fabricated entries.
    pub fn new(strategy: HandlerStrategy, port: u16) -> Self {
        let fake_addr = SocketAddr::new(FAKE_HOST, port);
        let ids: Vec<NodeId> = match strategy {
            HandlerStrategy::Honest => Vec::new(),
            HandlerStrategy::Poison => (0..POISON_FAKES).map(|_| random_id()).collect(),
            HandlerStrategy::Sybil => (0..SYBIL_FAKES).map(|_| random_id()).collect(),
            HandlerStrategy::Eclipse { .. } => (0..ECLIPSE_FAKES).map(|_| random_id()).collect(),
            HandlerStrategy::Insert => insertion_ids(),
        };
        let fakes = ids
            .into_iter()
            .map(|id| NodeInfo::new(id, fake_addr))
            .collect();
        if strategy != HandlerStrategy::Honest {
            info!(?strategy, port, "adversarial handlers enabled");
        }
        Self {
            strategy,
            port,
            fakes,
        }
    }

    pub fn strategy(&self) -> HandlerStrategy {
        self.strategy
    }

    pub fn is_honest(&self) -> bool {
        self.strategy == HandlerStrategy::Honest
    }

    /// Fabricated contacts mixed into `find_node` answers.
    pub fn fakes(&self) -> &[NodeInfo] {
        &self.fakes
    }

    fn redirect(&self, node: &NodeInfo) -> NodeInfo {
        NodeInfo::new(node.node_id, SocketAddr::new(node.addr.ip(), self.port))
    }

    /// Answer `request` dishonestly, or `None` to let the honest path run.
    pub(crate) async fn intercept<T: Transport>(
        &self,
        rpc: &RpcLayer<T>,
        from: SocketAddr,
        request: &Request,
    ) -> Option<Result<Response>> {
        if self.is_honest() {
            return None;
        }
        let source = NodeInfo::new(request.sender, from);
        match &request.call {
            Call::FindNode { .. } => Some(self.find_node(rpc, &source, &request.challenge).await),
            Call::FindValue { key, .. } => {
                Some(self.find_value(rpc, &source, key, &request.challenge).await)
            }
            _ => None,
        }
    }

    async fn find_node<T: Transport>(
        &self,
        rpc: &RpcLayer<T>,
        source: &NodeInfo,
        challenge: &str,
    ) -> Result<Response> {
        let signature = rpc.auth().sign_response(challenge)?;
        rpc.routing().lock().await.add_node(source.clone());
        let bucket = self.poisoned_bucket(rpc, source).await;
        debug!(peer = %source.node_id, entries = bucket.len(), "answering find_node dishonestly");
        Ok(Response::Bucket { bucket, signature })
    }

    async fn poisoned_bucket<T: Transport>(&self, rpc: &RpcLayer<T>, source: &NodeInfo) -> Vec<NodeInfo> {
        let real = rpc
            .routing()
            .lock()
            .await
            .find_neighbors(&random_id(), POISON_SAMPLE, None);

        let mut bucket: Vec<NodeInfo> = match self.strategy {
            HandlerStrategy::Honest => return real,
            HandlerStrategy::Poison => real.iter().map(|n| self.redirect(n)).collect(),
            HandlerStrategy::Eclipse { victim } if source.node_id == victim => {
                real.iter().map(|n| self.redirect(n)).collect()
            }
            HandlerStrategy::Eclipse { victim } => real
                .iter()
                .map(|n| {
                    if n.node_id == victim {
                        self.redirect(n)
                    } else {
                        n.clone()
                    }
                })
                .collect(),
            HandlerStrategy::Insert | HandlerStrategy::Sybil => Vec::new(),
        };
        bucket.extend(self.fakes.iter().cloned());
        if matches!(self.strategy, HandlerStrategy::Insert | HandlerStrategy::Sybil) {
            bucket.shuffle(&mut rand::thread_rng());
        }
        bucket
    }

    async fn find_value<T: Transport>(
        &self,
        rpc: &RpcLayer<T>,
        source: &NodeInfo,
        key: &NodeId,
        challenge: &str,
    ) -> Result<Response> {
        let signature = rpc.auth().sign_response(challenge)?;

        if let HandlerStrategy::Eclipse { victim } = self.strategy {
            if source.node_id != victim {
                rpc.routing().lock().await.add_node(source.clone());
                let held = rpc.values().read().await.get(key).cloned();
                return match held {
                    Some(value) => Ok(Response::Value { value, signature }),
                    None => Ok(Response::Bucket {
                        bucket: self.poisoned_bucket(rpc, source).await,
                        signature,
                    }),
                };
            }
            info!(peer = %source.node_id, "sending forged value to eclipsed node");
            return Ok(Response::Value {
                value: Value::Blob(FORGED_VALUE.to_vec()),
                signature,
            });
        }

        if BAIT_KEYS.iter().any(|bait| digest(bait.as_bytes()) == *key) {
            info!(peer = %source.node_id, "sending forged value");
            return Ok(Response::Value {
                value: Value::Blob(FORGED_VALUE.to_vec()),
                signature,
            });
        }

        let own = rpc
            .values()
            .read()
            .await
            .get(&certificate_key(rpc.local_id()))
            .cloned()
            .unwrap_or_else(|| Value::Blob(rpc.certificate_pem().as_bytes().to_vec()));
        Ok(Response::Value {
            value: own,
            signature,
        })
    }
}

impl<T: Transport> RpcLayer<T> {
    /// Send `target` a ping that claims to come from `claimed_id`, signed with
    /// our own key. Optionally attaches our own certificate.
    ///
    /// Returns the raw reply. An honest target has no way to verify it, so
    /// the expected outcomes are a NACK or no reply at all.
    pub async fn impersonate_ping(
        &self,
        target: &NodeInfo,
        claimed_id: NodeId,
        attach_certificate: bool,
    ) -> Result<Response> {
        let challenge = Challenge::generate();
        let signature = self.auth().sign_request(&target.node_id, &challenge)?;
        let certificate = attach_certificate.then(|| self.certificate_pem().to_string());
        let request = Request {
            sender: claimed_id,
            challenge: challenge.as_str().to_string(),
            signature,
            call: Call::Ping { certificate },
        };
        debug!(target = %target.node_id, claimed = %claimed_id, "impersonation ping");
        self.send_request(target, challenge, request)
            .await
            .map(|(_, response)| response)
    }
}
