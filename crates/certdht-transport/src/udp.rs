//! UDP transport.
//!
//! One socket serves both directions. A background task reads datagrams and
//! routes them:
//!
//! - requests become [`InboundRequest`]s on the channel returned by
//!   [`UdpTransport::bind`]; the reply (if any) is sent back to the source
//!   address under the same `msg_id`
//! - responses complete the pending call registered under their `msg_id`,
//!   provided they come from the address the request went to
//!
//! Datagrams that fail to decode, or carry a different network tag, are
//! dropped with a debug log.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::messages::{Request, Response};
use crate::wire::{Body, Envelope, MsgId, MAX_DATAGRAM_SIZE};
use crate::{InboundRequest, Result, Transport, TransportError};

/// Depth of the inbound request queue.
const INBOUND_QUEUE: usize = 256;

type PendingTable = Arc<Mutex<HashMap<MsgId, (SocketAddr, oneshot::Sender<Response>)>>>;

/// Removes a call's pending entry when the call ends, including when the
/// calling future is dropped before a reply arrives.
struct PendingGuard {
    pending: PendingTable,
    msg_id: MsgId,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if let Ok(mut table) = self.pending.try_lock() {
            table.remove(&self.msg_id);
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let pending = Arc::clone(&self.pending);
        let msg_id = self.msg_id;
        handle.spawn(async move {
            pending.lock().await.remove(&msg_id);
        });
    }
}

/// A bound UDP endpoint.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    network: Arc<str>,
    pending: PendingTable,
    recv_task: JoinHandle<()>,
}

impl UdpTransport {
    /// Bind a socket and start the receive loop.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Io`] if the socket cannot be bound.
    pub async fn bind(
        addr: SocketAddr,
        network: &str,
    ) -> Result<(Self, mpsc::Receiver<InboundRequest>)> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| TransportError::Io(e.to_string()))?;
        let socket = Arc::new(socket);
        let network: Arc<str> = Arc::from(network);
        let pending: PendingTable = Arc::new(Mutex::new(HashMap::new()));
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);

        let recv_task = tokio::spawn(recv_loop(
            Arc::clone(&socket),
            Arc::clone(&network),
            Arc::clone(&pending),
            inbound_tx,
        ));

        info!(%local_addr, network = %network, "UDP transport bound");

        Ok((
            Self {
                socket,
                local_addr,
                network,
                pending,
                recv_task,
            },
            inbound_rx,
        ))
    }

    /// Number of calls still waiting for a reply.
    pub async fn pending_len(&self) -> usize {
        self.pending.lock().await.len()
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.recv_task.abort();
    }
}

impl Transport for UdpTransport {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn send(&self, addr: SocketAddr, request: Request, timeout: Duration) -> Result<Response> {
        let envelope = Envelope::request(&self.network, request);
        let bytes = envelope.to_bytes()?;
        let msg_id = envelope.msg_id;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(msg_id, (addr, tx));
        let _guard = PendingGuard {
            pending: Arc::clone(&self.pending),
            msg_id,
        };

        self.socket
            .send_to(&bytes, addr)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                debug!(%addr, "request timed out");
                Err(TransportError::Timeout(addr))
            }
        }
    }
}

async fn recv_loop(
    socket: Arc<UdpSocket>,
    network: Arc<str>,
    pending: PendingTable,
    inbound: mpsc::Sender<InboundRequest>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "UDP receive failed");
                continue;
            }
        };

        let envelope = match Envelope::from_bytes(&buf[..len]) {
            Ok(env) => env,
            Err(e) => {
                debug!(%from, error = %e, "dropping undecodable datagram");
                continue;
            }
        };

        if *envelope.network != *network {
            debug!(%from, network = %envelope.network, "dropping datagram from other network");
            continue;
        }

        match envelope.body {
            Body::Request(request) => {
                let (reply_tx, reply_rx) = oneshot::channel();
                let inbound_request = InboundRequest {
                    from,
                    request,
                    reply: reply_tx,
                };
                match inbound.try_send(inbound_request) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(%from, "inbound queue full, dropping request");
                        continue;
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        info!("inbound queue closed, stopping receive loop");
                        return;
                    }
                }
                tokio::spawn(send_reply(
                    Arc::clone(&socket),
                    Arc::clone(&network),
                    from,
                    envelope.msg_id,
                    reply_rx,
                ));
            }
            Body::Response(response) => {
                let mut table = pending.lock().await;
                match table.remove(&envelope.msg_id) {
                    Some((expected, tx)) if expected == from => {
                        let _ = tx.send(response);
                    }
                    Some(entry) => {
                        debug!(%from, expected = %entry.0, "reply from unexpected address");
                        table.insert(envelope.msg_id, entry);
                    }
                    None => debug!(%from, "reply for unknown or expired request"),
                }
            }
        }
    }
}

async fn send_reply(
    socket: Arc<UdpSocket>,
    network: Arc<str>,
    to: SocketAddr,
    msg_id: MsgId,
    reply: oneshot::Receiver<Option<Response>>,
) {
    let Ok(Some(response)) = reply.await else {
        return;
    };
    let bytes = match Envelope::response(&network, msg_id, response).to_bytes() {
        Ok(b) => b,
        Err(e) => {
            warn!(%to, error = %e, "failed to encode reply");
            return;
        }
    };
    if let Err(e) = socket.send_to(&bytes, to).await {
        debug!(%to, error = %e, "failed to send reply");
    }
}
