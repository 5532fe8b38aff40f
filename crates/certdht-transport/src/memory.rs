//! In-process transport.
//!
//! A [`MemoryNetwork`] is a shared switchboard: each [`MemoryTransport`] bound
//! on it registers an address and receives [`InboundRequest`]s exactly as a
//! UDP transport would. Requests are logged so tests can assert on who called
//! whom.
//!
//! A handler that answers `None` makes the call fail with
//! [`TransportError::Timeout`] immediately rather than after the deadline.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex};

use crate::messages::{Request, Response};
use crate::{InboundRequest, Result, Transport, TransportError};

const INBOUND_QUEUE: usize = 256;

/// A request observed on a [`MemoryNetwork`].
#[derive(Clone, Debug)]
pub struct SentRequest {
    pub from: SocketAddr,
    pub to: SocketAddr,
    pub request: Request,
}

#[derive(Default)]
struct Switchboard {
    endpoints: HashMap<SocketAddr, mpsc::Sender<InboundRequest>>,
    log: Vec<SentRequest>,
}

/// Shared in-memory network.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<Switchboard>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `addr` and return its transport and inbound queue.
    ///
    /// Binding an address twice replaces the earlier registration.
    pub async fn bind(&self, addr: SocketAddr) -> (MemoryTransport, mpsc::Receiver<InboundRequest>) {
        let (tx, rx) = mpsc::channel(INBOUND_QUEUE);
        self.inner.lock().await.endpoints.insert(addr, tx);
        let transport = MemoryTransport {
            network: self.clone(),
            local_addr: addr,
            ready: Arc::new(AtomicBool::new(true)),
        };
        (transport, rx)
    }

    /// Remove `addr`; later sends to it fail with [`TransportError::Unreachable`].
    pub async fn disconnect(&self, addr: SocketAddr) {
        self.inner.lock().await.endpoints.remove(&addr);
    }

    /// Every request sent so far, oldest first.
    pub async fn sent_requests(&self) -> Vec<SentRequest> {
        self.inner.lock().await.log.clone()
    }

    pub async fn clear_log(&self) {
        self.inner.lock().await.log.clear();
    }
}

/// One endpoint on a [`MemoryNetwork`].
#[derive(Clone)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    local_addr: SocketAddr,
    ready: Arc<AtomicBool>,
}

impl MemoryTransport {
    /// Toggle readiness, as reported by [`Transport::is_ready`].
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }
}

impl Transport for MemoryTransport {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn send(&self, addr: SocketAddr, request: Request, timeout: Duration) -> Result<Response> {
        let endpoint = {
            let mut board = self.network.inner.lock().await;
            board.log.push(SentRequest {
                from: self.local_addr,
                to: addr,
                request: request.clone(),
            });
            board.endpoints.get(&addr).cloned()
        };
        let endpoint = endpoint.ok_or(TransportError::Unreachable(addr))?;

        let (tx, rx) = oneshot::channel();
        endpoint
            .send(InboundRequest {
                from: self.local_addr,
                request,
                reply: tx,
            })
            .await
            .map_err(|_| TransportError::Unreachable(addr))?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Some(response))) => Ok(response),
            Ok(Ok(None)) | Ok(Err(_)) | Err(_) => Err(TransportError::Timeout(addr)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::Call;
    use certdht_types::{NodeId, ID_LEN};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    fn find_node() -> Request {
        Request {
            sender: NodeId::from_bytes([1; ID_LEN]),
            challenge: "aa".into(),
            signature: vec![],
            call: Call::FindNode {
                key: NodeId::from_bytes([2; ID_LEN]),
            },
        }
    }

    #[tokio::test]
    async fn test_request_is_delivered_and_logged() {
        let net = MemoryNetwork::new();
        let (a, _a_in) = net.bind(addr(1)).await;
        let (_b, mut b_in) = net.bind(addr(2)).await;

        tokio::spawn(async move {
            if let Some(req) = b_in.recv().await {
                assert_eq!(req.from, addr(1));
                req.respond(Some(Response::Bucket {
                    bucket: vec![],
                    signature: vec![],
                }));
            }
        });

        let reply = a
            .send(addr(2), find_node(), Duration::from_secs(1))
            .await
            .expect("reply");
        assert!(matches!(reply, Response::Bucket { .. }));

        let log = net.sent_requests().await;
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].to, addr(2));
    }

    #[tokio::test]
    async fn test_silent_handler_is_timeout() {
        let net = MemoryNetwork::new();
        let (a, _a_in) = net.bind(addr(1)).await;
        let (_b, mut b_in) = net.bind(addr(2)).await;
        tokio::spawn(async move {
            while let Some(req) = b_in.recv().await {
                req.respond(None);
            }
        });
        let err = a
            .send(addr(2), find_node(), Duration::from_secs(1))
            .await
            .expect_err("dropped");
        assert!(matches!(err, TransportError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_unknown_address_is_unreachable() {
        let net = MemoryNetwork::new();
        let (a, _a_in) = net.bind(addr(1)).await;
        let err = a
            .send(addr(9), find_node(), Duration::from_secs(1))
            .await
            .expect_err("nobody there");
        assert!(matches!(err, TransportError::Unreachable(_)));

        let (_b, _b_in) = net.bind(addr(2)).await;
        net.disconnect(addr(2)).await;
        assert!(a
            .send(addr(2), find_node(), Duration::from_secs(1))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_readiness_toggle() {
        let net = MemoryNetwork::new();
        let (t, _rx) = net.bind(addr(1)).await;
        assert!(t.is_ready());
        t.set_ready(false);
        assert!(!t.is_ready());
    }
}
