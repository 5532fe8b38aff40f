//! Authenticated RPCs.
//!
//! [`RpcLayer`] owns both directions of the protocol:
//!
//! - **Outbound** (`call_*`): issue a challenge, sign
//!   `UPPER_HEX(recipient) + challenge`, send, and check the reply's signature
//!   over the challenge against the recipient's stored certificate. A reply is
//!   only ever accepted from a peer whose certificate is already trusted.
//! - **Inbound** ([`RpcLayer::handle_request`]): authenticate the sender with a
//!   stored certificate, or with an inline certificate on `ping` and on
//!   `find_value` for our own certificate key; answer NACK if neither exists;
//!   drop the request silently on any verification failure.
//!
//! A peer enters the routing table only through [`RpcLayer::welcome`], which is
//! called after successful verification and nowhere else.
//!
//! ## NACK handling
//!
//! A NACK reply means the peer has no certificate for us. If the NACK's
//! signature verifies under the peer's stored certificate, we push our
//! certificate with a `ping` and report [`DhtError::ProtocolNack`] so the
//! caller can retry.

use std::net::SocketAddr;
use std::sync::Arc;

use certdht_crypto::hash::certificate_key;
use certdht_crypto::{Certificate, Challenge, NodeSigner};
use certdht_transport::{Call, Request, Response, Transport, Value};
use certdht_types::{NodeId, NodeInfo};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::adversary::{Adversary, HandlerStrategy};
use crate::auth::ChallengeAuthenticator;
use crate::config::DhtConfig;
use crate::kademlia::{AddNodeResult, RoutingTable};
use crate::membership::MembershipEvent;
use crate::storage::ValueStore;
use crate::trust::TrustStore;
use crate::{DhtError, ErrorKind, Result};

/// The local node's identity and key.
pub struct LocalIdentity {
    pub info: NodeInfo,
    pub certificate: Certificate,
    pub signer: Arc<NodeSigner>,
}

/// Result of a `find_value` call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FindValueResult {
    Found(Value),
    /// The peer does not hold the key; these are closer contacts.
    Closer(Vec<NodeInfo>),
}

/// How an inbound request was authenticated.
enum Admission {
    Verified,
    /// No certificate is known for the sender. Carries our signature over the
    /// challenge.
    Nack(Vec<u8>),
}

/// Authenticated RPC endpoint of one node.
pub struct RpcLayer<T: Transport> {
    local: NodeInfo,
    certificate_pem: String,
    config: DhtConfig,
    transport: Arc<T>,
    auth: ChallengeAuthenticator,
    trust: Arc<TrustStore>,
    routing: Mutex<RoutingTable>,
    values: Arc<RwLock<ValueStore>>,
    adversary: Adversary,
    events: mpsc::UnboundedSender<MembershipEvent>,
}

impl<T: Transport> RpcLayer<T> {
    pub fn new(
        identity: LocalIdentity,
        config: DhtConfig,
        transport: Arc<T>,
        trust: Arc<TrustStore>,
        values: Arc<RwLock<ValueStore>>,
        strategy: HandlerStrategy,
        events: mpsc::UnboundedSender<MembershipEvent>,
    ) -> Self {
        let auth = ChallengeAuthenticator::new(
            identity.info.node_id,
            identity.signer,
            trust.roots().clone(),
        );
        let routing = Mutex::new(RoutingTable::new(identity.info.node_id, config.ksize));
        let adversary = Adversary::new(strategy, identity.info.addr.port());
        Self {
            local: identity.info,
            certificate_pem: identity.certificate.to_pem(),
            config,
            transport,
            auth,
            trust,
            routing,
            values,
            adversary,
            events,
        }
    }

    pub fn local(&self) -> &NodeInfo {
        &self.local
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local.node_id
    }

    pub fn config(&self) -> &DhtConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn auth(&self) -> &ChallengeAuthenticator {
        &self.auth
    }

    pub fn trust(&self) -> &Arc<TrustStore> {
        &self.trust
    }

    pub fn routing(&self) -> &Mutex<RoutingTable> {
        &self.routing
    }

    pub fn values(&self) -> &Arc<RwLock<ValueStore>> {
        &self.values
    }

    pub fn adversary(&self) -> &Adversary {
        &self.adversary
    }

    pub(crate) fn certificate_pem(&self) -> &str {
        &self.certificate_pem
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    /// Sign and send `call` to `peer`, returning the raw reply.
    ///
    /// A transport failure removes `peer` from the routing table, provided
    /// the table has it at the same address.
    async fn call(&self, peer: &NodeInfo, call: Call) -> Result<(Challenge, Response)> {
        let challenge = self.auth.issue_challenge();
        let signature = self.auth.sign_request(&peer.node_id, &challenge)?;
        let request = Request {
            sender: self.local.node_id,
            challenge: challenge.as_str().to_string(),
            signature,
            call,
        };
        self.send_request(peer, challenge, request).await
    }

    pub(crate) async fn send_request(
        &self,
        peer: &NodeInfo,
        challenge: Challenge,
        request: Request,
    ) -> Result<(Challenge, Response)> {
        let op = request.call.name();
        match self
            .transport
            .send(peer.addr, request, self.config.rpc_timeout())
            .await
        {
            Ok(response) => {
                debug!(peer = %peer.node_id, op, reply = response.name(), "reply received");
                Ok((challenge, response))
            }
            Err(e) => {
                debug!(peer = %peer.node_id, addr = %peer.addr, op, error = %e, "peer unresponsive");
                let mut routing = self.routing.lock().await;
                if routing
                    .get(&peer.node_id)
                    .is_some_and(|known| known.addr == peer.addr)
                {
                    routing.remove_node(&peer.node_id);
                }
                Err(e.into())
            }
        }
    }

    /// Check a reply's signature without any follow-up. NACKs are returned
    /// as [`DhtError::ProtocolNack`].
    async fn verify_reply(
        &self,
        peer: &NodeInfo,
        challenge: &Challenge,
        response: Response,
    ) -> Result<Response> {
        if response.is_nack() {
            return Err(DhtError::ProtocolNack {
                peer: peer.node_id,
            });
        }
        let cert = self.trust.lookup(&peer.node_id).await.ok_or_else(|| {
            DhtError::VerificationFailure(format!("no certificate on file for {}", peer.node_id))
        })?;
        if !self
            .auth
            .verify_response(&cert, challenge.as_str(), response.signature())
        {
            return Err(DhtError::VerificationFailure(format!(
                "bad {} signature from {}",
                response.name(),
                peer.node_id
            )));
        }
        Ok(response)
    }

    /// Check a reply, handling NACK by pushing our certificate.
    async fn authenticate_reply(
        &self,
        peer: &NodeInfo,
        challenge: &Challenge,
        response: Response,
    ) -> Result<Response> {
        if let Response::Nack { signature } = &response {
            self.handle_nack(peer, challenge, signature).await;
            return Err(DhtError::ProtocolNack {
                peer: peer.node_id,
            });
        }
        self.verify_reply(peer, challenge, response).await
    }

    async fn handle_nack(&self, peer: &NodeInfo, challenge: &Challenge, signature: &[u8]) {
        let Some(cert) = self.trust.lookup(&peer.node_id).await else {
            warn!(peer = %peer.node_id, "NACK from peer with no certificate on file");
            return;
        };
        if !self
            .auth
            .verify_response(&cert, challenge.as_str(), signature)
        {
            warn!(peer = %peer.node_id, "bad signature on NACK");
            return;
        }
        match self.push_certificate(peer).await {
            Ok(()) => info!(peer = %peer.node_id, "certificate sent after NACK"),
            Err(e) => debug!(peer = %peer.node_id, error = %e, "certificate push failed"),
        }
    }

    /// Ping `peer` with our certificate attached. A NACK here is not
    /// followed up.
    async fn push_certificate(&self, peer: &NodeInfo) -> Result<()> {
        let (challenge, response) = self
            .call(
                peer,
                Call::Ping {
                    certificate: Some(self.certificate_pem.clone()),
                },
            )
            .await?;
        let response = self.verify_reply(peer, &challenge, response).await?;
        self.accept_pong(peer, response).await.map(|_| ())
    }

    async fn accept_pong(&self, peer: &NodeInfo, response: Response) -> Result<NodeId> {
        match response {
            Response::Pong { id, .. } if id == peer.node_id => {
                self.welcome(peer).await;
                Ok(id)
            }
            Response::Pong { id, .. } => Err(DhtError::VerificationFailure(format!(
                "pong carries id {id}, expected {}",
                peer.node_id
            ))),
            other => Err(unexpected(peer, "ping", &other)),
        }
    }

    /// Authenticated `ping`. Returns the peer's id.
    pub async fn call_ping(&self, peer: &NodeInfo, attach_certificate: bool) -> Result<NodeId> {
        let certificate = attach_certificate.then(|| self.certificate_pem.clone());
        let (challenge, response) = self.call(peer, Call::Ping { certificate }).await?;
        let response = self.authenticate_reply(peer, &challenge, response).await?;
        self.accept_pong(peer, response).await
    }

    /// Authenticated `find_node`. Returns the certified contacts of the
    /// reply, fetching certificates for those we do not know yet.
    pub async fn call_find_node(self: &Arc<Self>, peer: &NodeInfo, key: NodeId) -> Result<Vec<NodeInfo>> {
        let (challenge, response) = self.call(peer, Call::FindNode { key }).await?;
        match self.authenticate_reply(peer, &challenge, response).await? {
            Response::Bucket { bucket, .. } => {
                self.welcome(peer).await;
                Ok(self.backfill(bucket).await)
            }
            other => Err(unexpected(peer, "find_node", &other)),
        }
    }

    /// Authenticated `find_value`. A miss yields the peer's closer contacts.
    pub async fn call_find_value(
        self: &Arc<Self>,
        peer: &NodeInfo,
        key: NodeId,
    ) -> Result<FindValueResult> {
        let (challenge, response) = self
            .call(
                peer,
                Call::FindValue {
                    key,
                    certificate: None,
                },
            )
            .await?;
        match self.authenticate_reply(peer, &challenge, response).await? {
            Response::Value { value, .. } => {
                self.welcome(peer).await;
                Ok(FindValueResult::Found(value))
            }
            Response::Bucket { bucket, .. } => {
                self.welcome(peer).await;
                Ok(FindValueResult::Closer(self.backfill(bucket).await))
            }
            other => Err(unexpected(peer, "find_value", &other)),
        }
    }

    /// Authenticated `store`.
    pub async fn call_store(&self, peer: &NodeInfo, key: NodeId, value: Vec<u8>) -> Result<()> {
        let (challenge, response) = self.call(peer, Call::Store { key, value }).await?;
        self.accept_stored(peer, &challenge, response, "store").await
    }

    /// Authenticated `append`.
    pub async fn call_append(
        &self,
        peer: &NodeInfo,
        key: NodeId,
        values: Vec<Vec<u8>>,
    ) -> Result<()> {
        let (challenge, response) = self.call(peer, Call::Append { key, values }).await?;
        self.accept_stored(peer, &challenge, response, "append").await
    }

    async fn accept_stored(
        &self,
        peer: &NodeInfo,
        challenge: &Challenge,
        response: Response,
        op: &str,
    ) -> Result<()> {
        match self.authenticate_reply(peer, challenge, response).await? {
            Response::Stored { .. } => {
                self.welcome(peer).await;
                Ok(())
            }
            other => Err(unexpected(peer, op, &other)),
        }
    }

    /// Fetch `node`'s own certificate from `node` itself.
    ///
    /// The reply is accepted only if the certificate chains to a trusted root,
    /// derives `node`'s id, and verifies the reply signature. The certificate
    /// is then trusted and `node` welcomed.
    pub async fn call_cert_find_value(&self, node: &NodeInfo) -> Result<Certificate> {
        let key = certificate_key(&node.node_id);
        let (challenge, response) = self
            .call(
                node,
                Call::FindValue {
                    key,
                    certificate: Some(self.certificate_pem.clone()),
                },
            )
            .await?;

        let (pem, signature) = match response {
            Response::Value {
                value: Value::Blob(bytes),
                signature,
            } => (bytes, signature),
            Response::Nack { signature } => {
                self.handle_nack(node, &challenge, &signature).await;
                return Err(DhtError::ProtocolNack {
                    peer: node.node_id,
                });
            }
            other => return Err(unexpected(node, "certificate find_value", &other)),
        };

        let pem = String::from_utf8(pem)
            .map_err(|_| DhtError::VerificationFailure("certificate is not text".into()))?;
        let cert = Certificate::from_pem(&pem)
            .map_err(|e| DhtError::VerificationFailure(e.to_string()))?;
        if cert.node_id() != node.node_id {
            return Err(DhtError::VerificationFailure(format!(
                "certificate for {} returned by {}",
                cert.node_id(),
                node.node_id
            )));
        }
        self.trust
            .roots()
            .verify(&cert)
            .map_err(|e| DhtError::CertificateUntrusted(e.to_string()))?;
        if !self
            .auth
            .verify_response(&cert, challenge.as_str(), &signature)
        {
            return Err(DhtError::VerificationFailure(format!(
                "bad certificate reply signature from {}",
                node.node_id
            )));
        }

        self.trust.store(&cert, &node.node_id).await;
        self.welcome(node).await;
        Ok(cert)
    }

    /// Keep the certified entries of a bucket reply, fetching certificates
    /// for unknown entries concurrently. Entries whose certificate cannot be
    /// obtained are dropped.
    ///
    /// A trusted id already in the routing table keeps its verified address,
    /// whatever the replier advertised.
    async fn backfill(self: &Arc<Self>, bucket: Vec<NodeInfo>) -> Vec<NodeInfo> {
        let mut certified = Vec::with_capacity(bucket.len());
        let mut tasks = JoinSet::new();

        for node in bucket {
            if node.node_id == self.local.node_id {
                continue;
            }
            if self.trust.has(&node.node_id).await {
                match self.routing.lock().await.get(&node.node_id) {
                    Some(known) if known.addr != node.addr => {
                        debug!(peer = %node.node_id, advertised = %node.addr, known = %known.addr, "ignoring advertised address for known peer");
                        certified.push(known);
                    }
                    _ => certified.push(node),
                }
                continue;
            }
            let rpc = Arc::clone(self);
            tasks.spawn(async move {
                let result = rpc.call_cert_find_value(&node).await;
                (node, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((node, Ok(_))) => certified.push(node),
                Ok((node, Err(e))) => {
                    debug!(peer = %node.node_id, error = %e, kind = %e.kind(), "dropping uncertified contact");
                }
                Err(e) => warn!(error = %e, "certificate backfill task failed"),
            }
        }
        certified
    }

    // ------------------------------------------------------------------
    // Routing-table admission
    // ------------------------------------------------------------------

    /// Register a verified peer.
    ///
    /// First-time insertion posts [`MembershipEvent::Joined`]; a full bucket
    /// posts [`MembershipEvent::BucketFull`].
    pub(crate) async fn welcome(&self, peer: &NodeInfo) {
        let outcome = self.routing.lock().await.add_node(peer.clone());
        let event = match outcome {
            AddNodeResult::Inserted => {
                info!(peer = %peer.node_id, addr = %peer.addr, "new contact");
                MembershipEvent::Joined(peer.clone())
            }
            AddNodeResult::BucketFull {
                least_recently_seen,
            } => MembershipEvent::BucketFull {
                stale: least_recently_seen,
                candidate: peer.clone(),
            },
            AddNodeResult::Updated | AddNodeResult::Ignored => return,
        };
        if self.events.send(event).is_err() {
            debug!("membership worker gone, event dropped");
        }
    }

    /// Up to `k` contacts nearest `key`, never including `exclude`.
    pub async fn neighbors(&self, key: &NodeId, exclude: Option<&NodeId>) -> Vec<NodeInfo> {
        self.routing
            .lock()
            .await
            .find_neighbors(key, self.config.ksize, exclude)
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    /// Answer an inbound request. `None` drops it without a reply.
    pub async fn handle_request(&self, from: SocketAddr, request: Request) -> Option<Response> {
        let sender = request.sender;
        let op = request.call.name();
        let intercepted = self.adversary.intercept(self, from, &request).await;
        let result = match intercepted {
            Some(result) => result,
            None => self.serve(from, request).await,
        };
        match result {
            Ok(response) => Some(response),
            Err(e) => {
                match e.kind() {
                    ErrorKind::VerificationFailure | ErrorKind::CertificateUntrusted => {
                        warn!(peer = %sender, %from, op, error = %e, kind = %e.kind(), "request dropped");
                    }
                    _ => debug!(peer = %sender, %from, op, error = %e, kind = %e.kind(), "request dropped"),
                }
                None
            }
        }
    }

    async fn serve(&self, from: SocketAddr, request: Request) -> Result<Response> {
        let source = NodeInfo::new(request.sender, from);

        if let Admission::Nack(signature) = self.admit(&request).await? {
            debug!(peer = %source.node_id, op = request.call.name(), "no certificate for sender, answering NACK");
            return Ok(Response::Nack { signature });
        }

        self.welcome(&source).await;
        let signature = self.auth.sign_response(&request.challenge)?;

        let sender = request.sender;
        let response = match request.call {
            Call::Ping { .. } => Response::Pong {
                id: self.local.node_id,
                signature,
            },
            Call::FindNode { key } => Response::Bucket {
                bucket: self.neighbors(&key, Some(&source.node_id)).await,
                signature,
            },
            Call::FindValue { key, .. } => {
                let hit = self.values.read().await.get(&key).cloned();
                match hit {
                    Some(value) => Response::Value { value, signature },
                    None => Response::Bucket {
                        bucket: self.neighbors(&key, Some(&source.node_id)).await,
                        signature,
                    },
                }
            }
            Call::Store { key, value } => {
                let mut values = self.values.write().await;
                if self.is_reserved_key(&values, &key, &sender) {
                    return Err(DhtError::VerificationFailure(format!(
                        "store over certificate key {key}"
                    )));
                }
                values.store(key, value);
                Response::Stored { signature }
            }
            Call::Append { key, values } => {
                let mut store = self.values.write().await;
                if self.is_reserved_key(&store, &key, &sender) {
                    return Err(DhtError::VerificationFailure(format!(
                        "append to certificate key {key}"
                    )));
                }
                store.append(key, values);
                Response::Stored { signature }
            }
        };
        Ok(response)
    }

    /// Certificate keys a peer may not write: those already pinned, plus the
    /// keys of this node and of the sender, whether or not they are held yet.
    fn is_reserved_key(&self, values: &ValueStore, key: &NodeId, sender: &NodeId) -> bool {
        values.is_certificate_key(key)
            || *key == certificate_key(&self.local.node_id)
            || *key == certificate_key(sender)
    }

    /// Authenticate the sender of `request`.
    async fn admit(&self, request: &Request) -> Result<Admission> {
        if let Some(cert) = self.trust.lookup(&request.sender).await {
            if self
                .auth
                .verify_request(&cert, &request.challenge, &request.signature)
            {
                return Ok(Admission::Verified);
            }
            return Err(DhtError::VerificationFailure(format!(
                "bad request signature from {}",
                request.sender
            )));
        }

        match self.inline_certificate(request) {
            Some(pem) => {
                self.admit_inline(request, pem).await?;
                Ok(Admission::Verified)
            }
            None => Ok(Admission::Nack(self.auth.sign_response(&request.challenge)?)),
        }
    }

    /// The inline certificate, where the call is allowed to carry one.
    fn inline_certificate<'a>(&self, request: &'a Request) -> Option<&'a str> {
        match &request.call {
            Call::Ping { certificate } => certificate.as_deref(),
            Call::FindValue { key, certificate } if *key == certificate_key(&self.local.node_id) => {
                certificate.as_deref()
            }
            _ => None,
        }
    }

    async fn admit_inline(&self, request: &Request, pem: &str) -> Result<()> {
        let cert = Certificate::from_pem(pem)
            .map_err(|e| DhtError::VerificationFailure(e.to_string()))?;
        self.trust
            .roots()
            .verify(&cert)
            .map_err(|e| DhtError::CertificateUntrusted(e.to_string()))?;
        if cert.node_id() != request.sender {
            return Err(DhtError::VerificationFailure(format!(
                "certificate id {} does not match claimed id {}",
                cert.node_id(),
                request.sender
            )));
        }
        if !self
            .auth
            .verify_request(&cert, &request.challenge, &request.signature)
        {
            return Err(DhtError::VerificationFailure(format!(
                "bad request signature from {}",
                request.sender
            )));
        }
        self.trust.store(&cert, &request.sender).await;
        Ok(())
    }
}

fn unexpected(peer: &NodeInfo, op: &str, response: &Response) -> DhtError {
    DhtError::PeerUnresponsive(format!(
        "{} answered {op} with {}",
        peer.node_id,
        response.name()
    ))
}
