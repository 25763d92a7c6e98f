//! Inter-node forwarding links
//!
//! One [`ProxyLink`] per peer carries two flows:
//!
//! - **upstream**: a proxy's request to the master, answered synchronously
//!   and bounded by the link timeout;
//! - **downstream**: a master's deliveries to sessions on the peer, queued
//!   and sent in order by a single worker task.

use crate::error::{Error, Result};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tidings_cluster::{
    ClusterError, ClusterRequest, ClusterResponse, Delivery, Membership, NodeId, PeerTransport,
    ProxyRequest, ProxyResult, RequestHeader,
};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Link settings
#[derive(Debug, Clone, Copy)]
pub struct LinkConfig {
    pub call_timeout: Duration,
    pub queue: usize,
}

/// Forwarding channel to one peer
pub struct ProxyLink {
    peer: NodeId,
    membership: Arc<Membership>,
    transport: Arc<dyn PeerTransport>,
    call_timeout: Duration,
    degraded: AtomicBool,
    deliveries: mpsc::Sender<Delivery>,
    cancel: CancellationToken,
}

impl ProxyLink {
    /// Open a link and start its delivery worker
    pub fn open(
        peer: impl Into<NodeId>,
        membership: Arc<Membership>,
        transport: Arc<dyn PeerTransport>,
        config: LinkConfig,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(config.queue.max(1));
        let link = Arc::new(Self {
            peer: peer.into(),
            membership,
            transport,
            call_timeout: config.call_timeout,
            degraded: AtomicBool::new(false),
            deliveries: tx,
            cancel: CancellationToken::new(),
        });
        debug!(peer = %link.peer, "Proxy link opened");
        tokio::spawn(link.clone().delivery_worker(rx));
        link
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Set after a failed exchange, cleared by the next success
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    pub fn mark_degraded(&self) {
        if !self.degraded.swap(true, Ordering::Relaxed) {
            warn!(peer = %self.peer, "Proxy link degraded");
        }
    }

    fn mark_healthy(&self) {
        if self.degraded.swap(false, Ordering::Relaxed) {
            debug!(peer = %self.peer, "Proxy link recovered");
        }
    }

    fn header(&self) -> RequestHeader {
        RequestHeader::new(
            self.membership.next_correlation_id(),
            self.membership.local_id(),
        )
        .with_timeout(self.call_timeout)
    }

    /// Forward one request to the master on the peer
    pub async fn call(&self, request: ProxyRequest) -> Result<ProxyResult> {
        let op = request.op.kind();
        let message = ClusterRequest::Proxy {
            header: self.header(),
            request,
        };
        trace!(peer = %self.peer, op, "Proxy call");

        let response = match timeout(self.call_timeout, self.transport.send(&self.peer, message)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                self.mark_degraded();
                return Err(e.into());
            }
            Err(_) => {
                self.mark_degraded();
                return Err(ClusterError::Timeout.into());
            }
        };
        self.mark_healthy();

        match response {
            ClusterResponse::Proxy {
                header,
                result: Some(result),
            } if header.is_success() => Ok(result),
            ClusterResponse::Proxy { header, .. } | ClusterResponse::Error { header }
                if !header.is_success() =>
            {
                Err(Error::from_status(
                    header.status,
                    header.message.unwrap_or_default(),
                ))
            }
            _ => Err(ClusterError::UnexpectedResponse { expected: "proxy" }.into()),
        }
    }

    /// Queue a delivery for the peer. Never waits.
    pub fn deliver(&self, delivery: Delivery) -> Result<()> {
        self.deliveries.try_send(delivery).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                Error::Backpressure(format!("delivery queue to {} full", self.peer))
            }
            mpsc::error::TrySendError::Closed(_) => ClusterError::ConnectionClosed.into(),
        })
    }

    /// Stop the delivery worker; queued deliveries are dropped
    pub fn close(&self) {
        self.cancel.cancel();
    }

    async fn delivery_worker(self: Arc<Self>, mut rx: mpsc::Receiver<Delivery>) {
        loop {
            let delivery = tokio::select! {
                _ = self.cancel.cancelled() => break,
                delivery = rx.recv() => match delivery {
                    Some(delivery) => delivery,
                    None => break,
                },
            };

            let topic = delivery.topic.clone();
            let request = ClusterRequest::Deliver {
                header: self.header(),
                delivery,
            };
            match timeout(self.call_timeout, self.transport.send(&self.peer, request)).await {
                Ok(Ok(ClusterResponse::Delivered { .. })) => self.mark_healthy(),
                Ok(Ok(other)) => {
                    warn!(peer = %self.peer, topic = %topic, status = ?other.header().status, "Delivery refused");
                }
                Ok(Err(e)) => {
                    self.mark_degraded();
                    warn!(peer = %self.peer, topic = %topic, error = %e, "Delivery failed");
                }
                Err(_) => {
                    self.mark_degraded();
                    warn!(peer = %self.peer, topic = %topic, "Delivery timed out");
                }
            }
        }
        debug!(peer = %self.peer, "Proxy link closed");
    }
}

/// Open links by peer
pub struct LinkRegistry {
    membership: Arc<Membership>,
    transport: Arc<dyn PeerTransport>,
    config: LinkConfig,
    links: DashMap<NodeId, Arc<ProxyLink>>,
}

impl LinkRegistry {
    pub fn new(
        membership: Arc<Membership>,
        transport: Arc<dyn PeerTransport>,
        config: LinkConfig,
    ) -> Self {
        Self {
            membership,
            transport,
            config,
            links: DashMap::new(),
        }
    }

    /// Existing link to `peer`, or a new one
    pub fn get_or_open(&self, peer: &str) -> Arc<ProxyLink> {
        self.links
            .entry(peer.to_string())
            .or_insert_with(|| {
                ProxyLink::open(
                    peer,
                    self.membership.clone(),
                    self.transport.clone(),
                    self.config,
                )
            })
            .clone()
    }

    /// Tear down the link to a failed peer
    pub fn close(&self, peer: &str) {
        if let Some((_, link)) = self.links.remove(peer) {
            link.close();
        }
    }

    pub fn close_all(&self) {
        for entry in self.links.iter() {
            entry.value().close();
        }
        self.links.clear();
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use tidings_cluster::{
        ClusterConfig, ClusterHandler, DeliveryEvent, Envelope, LocalNetwork, ProxyOp,
        ResponseHeader, SessionRef, StatusCode,
    };
    use uuid::Uuid;

    /// Peer that answers proxies with a fixed status and records deliveries
    struct Peer {
        status: StatusCode,
        delivered: Mutex<Vec<u64>>,
    }

    #[async_trait]
    impl ClusterHandler for Peer {
        async fn handle(&self, request: ClusterRequest) -> ClusterResponse {
            match request {
                ClusterRequest::Proxy { header, .. } if self.status == StatusCode::Ok => {
                    ClusterResponse::proxied(
                        header.correlation_id,
                        ProxyResult::Published {
                            seq: 7,
                            duplicate: false,
                        },
                    )
                }
                ClusterRequest::Proxy { header, .. } => {
                    ClusterResponse::proxy_failed(header.correlation_id, self.status, "refused")
                }
                ClusterRequest::Deliver { header, delivery } => {
                    if let DeliveryEvent::Data(env) = delivery.event {
                        self.delivered.lock().push(env.seq);
                    }
                    ClusterResponse::Delivered {
                        header: ResponseHeader::success(header.correlation_id),
                    }
                }
                other => ClusterResponse::Error {
                    header: ResponseHeader::error(
                        other.header().correlation_id,
                        StatusCode::InvalidRequest,
                        "unexpected",
                    ),
                },
            }
        }
    }

    fn membership() -> Arc<Membership> {
        let config = ClusterConfig::builder()
            .node("a", "a:1")
            .node("b", "b:1")
            .this_name("a")
            .build()
            .unwrap();
        Arc::new(Membership::new(config).unwrap())
    }

    fn request() -> ProxyRequest {
        ProxyRequest {
            topic: "grpX".into(),
            op: ProxyOp::Publish {
                payload: Bytes::from_static(b"hi"),
            },
            session: SessionRef {
                session_id: Uuid::new_v4(),
                principal: "alice".into(),
                origin: "a".into(),
            },
            client_seq: 1,
        }
    }

    fn link_to(net: &Arc<LocalNetwork>) -> Arc<ProxyLink> {
        ProxyLink::open(
            "b",
            membership(),
            Arc::new(net.endpoint("a")),
            LinkConfig {
                call_timeout: Duration::from_millis(200),
                queue: 16,
            },
        )
    }

    #[tokio::test]
    async fn test_call_success() {
        let net = LocalNetwork::new();
        let peer: Arc<dyn ClusterHandler> = Arc::new(Peer {
            status: StatusCode::Ok,
            delivered: Mutex::new(Vec::new()),
        });
        net.register("b", Arc::downgrade(&peer));

        let link = link_to(&net);
        let result = link.call(request()).await.unwrap();
        assert_eq!(
            result,
            ProxyResult::Published {
                seq: 7,
                duplicate: false
            }
        );
        assert!(!link.is_degraded());
    }

    #[tokio::test]
    async fn test_not_owner_maps_to_transient() {
        let net = LocalNetwork::new();
        let peer: Arc<dyn ClusterHandler> = Arc::new(Peer {
            status: StatusCode::NotOwner,
            delivered: Mutex::new(Vec::new()),
        });
        net.register("b", Arc::downgrade(&peer));

        let err = link_to(&net).call(request()).await.unwrap_err();
        assert!(matches!(err, Error::OwnershipTransient(_)));
        assert!(err.is_upstream_transient());
    }

    #[tokio::test]
    async fn test_dead_peer_degrades_link() {
        let net = LocalNetwork::new();
        let link = link_to(&net);
        let err = link.call(request()).await.unwrap_err();
        assert!(err.is_upstream_transient());
        assert!(link.is_degraded());
    }

    #[tokio::test]
    async fn test_deliveries_arrive_in_order() {
        let net = LocalNetwork::new();
        let peer = Arc::new(Peer {
            status: StatusCode::Ok,
            delivered: Mutex::new(Vec::new()),
        });
        let handler: Arc<dyn ClusterHandler> = peer.clone();
        net.register("b", Arc::downgrade(&handler));

        let link = link_to(&net);
        for seq in 1..=5 {
            link.deliver(Delivery {
                topic: "grpX".into(),
                recipients: vec![Uuid::new_v4()],
                event: DeliveryEvent::Data(Envelope {
                    topic: "grpX".into(),
                    sender: "alice".into(),
                    seq,
                    timestamp_ms: 0,
                    payload: Bytes::new(),
                }),
            })
            .unwrap();
        }

        for _ in 0..50 {
            if peer.delivered.lock().len() == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(*peer.delivered.lock(), vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_registry_reuses_links() {
        let net = LocalNetwork::new();
        let registry = LinkRegistry::new(
            membership(),
            Arc::new(net.endpoint("a")),
            LinkConfig {
                call_timeout: Duration::from_millis(200),
                queue: 16,
            },
        );
        let first = registry.get_or_open("b");
        let second = registry.get_or_open("b");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);

        registry.close("b");
        assert!(registry.is_empty());
        assert!(!Arc::ptr_eq(&first, &registry.get_or_open("b")));
    }
}
