//! Node assembly
//!
//! Wires membership, the hub and the session store together and serves the
//! requests peers send to this node.

use crate::cluster::Cluster;
use crate::context::ServerContext;
use crate::error::{Error, Result};
use crate::hub::Hub;
use crate::session::{CloseReason, SessionStore};
use async_trait::async_trait;
use std::sync::Arc;
use tidings_cluster::{
    ClusterHandler, ClusterRequest, ClusterResponse, Membership, PeerTransport, ResponseHeader,
};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct Node {
    ctx: Arc<ServerContext>,
    cluster: Arc<Cluster>,
    hub: Arc<Hub>,
    sessions: Arc<SessionStore>,
    shutdown: CancellationToken,
}

impl Node {
    pub fn new(ctx: Arc<ServerContext>, transport: Arc<dyn PeerTransport>) -> Result<Arc<Self>> {
        let membership = Membership::new(ctx.config.cluster.clone())
            .map_err(|e| Error::Config(e.to_string()))?;
        let cluster = Arc::new(Cluster::new(Arc::new(membership), transport, &ctx.config));
        let hub = Hub::new(ctx.clone(), cluster.clone());
        let sessions = SessionStore::new(ctx.clone(), hub.clone());
        Ok(Arc::new(Self {
            ctx,
            cluster,
            hub,
            sessions,
            shutdown: CancellationToken::new(),
        }))
    }

    /// Start the heartbeat loop, the membership listener and the idle sweeper
    pub fn start(self: &Arc<Self>) {
        let membership = self.cluster.membership().clone();
        let mut events = membership.subscribe();

        tokio::spawn(
            membership
                .clone()
                .run(self.cluster.transport().clone(), self.shutdown.clone()),
        );

        let hub = self.hub.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => return,
                    event = events.recv() => event,
                };
                match event {
                    Ok(event) => hub.on_membership_event(&event),
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "Membership events lagged, rehashing all topics");
                        hub.rehash_all();
                    }
                    Err(RecvError::Closed) => return,
                }
            }
        });

        tokio::spawn(self.sessions.clone().run_sweeper(self.shutdown.clone()));

        info!(
            node = %self.local_id(),
            epoch = self.cluster.epoch(),
            peers = membership.peers().len(),
            "Node started"
        );
    }

    /// Close every session, unload every topic, stop background tasks
    pub async fn shutdown(&self) {
        info!(node = %self.local_id(), sessions = self.sessions.len(), "Node shutting down");
        self.shutdown.cancel();
        self.sessions.close_all(CloseReason::Shutdown);
        self.hub.shutdown().await;
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn local_id(&self) -> &str {
        self.cluster.local_id()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

#[async_trait]
impl ClusterHandler for Node {
    async fn handle(&self, request: ClusterRequest) -> ClusterResponse {
        let correlation_id = request.header().correlation_id;
        if let Err(header) = request.header().validate_version() {
            return ClusterResponse::Error { header };
        }

        match request {
            ClusterRequest::Heartbeat { heartbeat, .. } => {
                let membership = self.cluster.membership();
                membership.record_heartbeat(&heartbeat);
                ClusterResponse::Heartbeat {
                    header: ResponseHeader::success(correlation_id),
                    epoch: membership.epoch(),
                }
            }
            ClusterRequest::Proxy { request, .. } => {
                self.hub.handle_proxy(correlation_id, request).await
            }
            ClusterRequest::Deliver { header, delivery } => {
                match self.hub.handle_deliver(&header.source, delivery).await {
                    Ok(()) => ClusterResponse::Delivered {
                        header: ResponseHeader::success(correlation_id),
                    },
                    Err(e) => {
                        debug!(source = %header.source, error = %e, "Delivery not accepted");
                        ClusterResponse::Error {
                            header: ResponseHeader::error(correlation_id, e.status(), e.to_string()),
                        }
                    }
                }
            }
        }
    }
}
