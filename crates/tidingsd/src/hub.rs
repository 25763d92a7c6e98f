//! Topic registry and request router
//!
//! The hub maps routing names to running topic actors and starts the right
//! kind of actor on first use: a master when this node owns the topic, a
//! proxy otherwise. Sessions talk to topics only through the hub.

use crate::cluster::{Cluster, Owner};
use crate::context::ServerContext;
use crate::error::{Error, Result};
use crate::session::SessionSink;
use crate::topic::{
    backoff, AccessMode, MasterTopic, Pending, ProxyTopic, TopicHandle, TopicMsg, TopicName,
    TopicRequest, TopicRole, TopicStats,
};
use crate::validate::ValidationInput;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tidings_cluster::{
    ClusterError, ClusterResponse, Delivery, Envelope, MembershipEvent, ProxyOp, ProxyRequest,
    ProxyResult, SessionRef, StatusCode,
};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How long shutdown waits for actors to unload
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub struct Hub {
    ctx: Arc<ServerContext>,
    cluster: Arc<Cluster>,
    topics: DashMap<String, TopicHandle>,
    next_id: AtomicU64,
}

impl Hub {
    pub fn new(ctx: Arc<ServerContext>, cluster: Arc<Cluster>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            cluster,
            topics: DashMap::new(),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn local_id(&self) -> &str {
        self.cluster.local_id()
    }

    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    /// Number of loaded topics
    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    /// Running actor for a topic, if any
    pub fn handle(&self, name: &TopicName) -> Option<TopicHandle> {
        self.topics
            .get(name.as_str())
            .map(|h| h.value().clone())
            .filter(|h| !h.is_closed())
    }

    /// Loaded topics and their roles
    pub fn loaded(&self) -> Vec<(String, TopicRole)> {
        self.topics
            .iter()
            .map(|h| (h.key().clone(), h.role))
            .collect()
    }

    /// Running actor for a topic, starting one if needed
    fn get_or_spawn(self: &Arc<Self>, name: &TopicName) -> Result<TopicHandle> {
        match self.topics.entry(name.as_str().to_string()) {
            Entry::Occupied(mut entry) => {
                if !entry.get().is_closed() {
                    return Ok(entry.get().clone());
                }
                let handle = self.spawn(name)?;
                entry.insert(handle.clone());
                Ok(handle)
            }
            Entry::Vacant(entry) => {
                let handle = self.spawn(name)?;
                entry.insert(handle.clone());
                Ok(handle)
            }
        }
    }

    fn spawn(self: &Arc<Self>, name: &TopicName) -> Result<TopicHandle> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = match self.cluster.owner_of(name.as_str())? {
            Owner::Local => MasterTopic::spawn(
                self.ctx.clone(),
                self.cluster.clone(),
                self.clone(),
                id,
                name.clone(),
            ),
            Owner::Remote(owner) => ProxyTopic::spawn(
                self.ctx.clone(),
                self.cluster.clone(),
                self.clone(),
                id,
                name.clone(),
                owner,
            ),
        };
        debug!(topic = %name, role = %handle.role, id, "Topic actor started");
        Ok(handle)
    }

    /// Remove an actor's registration; a newer actor under the same name is
    /// left alone
    pub(crate) fn deregister(&self, name: &TopicName, id: u64) {
        self.topics.remove_if(name.as_str(), |_, h| h.id == id);
    }

    /// Send a request, retrying while the topic changes hands
    async fn call(
        self: &Arc<Self>,
        name: &TopicName,
        session: SessionRef,
        sink: Option<SessionSink>,
        op: ProxyOp,
    ) -> Result<ProxyResult> {
        let request = TopicRequest {
            op,
            session,
            client_seq: 0,
            sink,
        };
        let retries = self.ctx.limits().subscribe_retries;
        let calls = async {
            let mut attempt = 0;
            loop {
                let result = match self.get_or_spawn(name) {
                    Ok(handle) => handle.request(request.clone()).await,
                    Err(e) => Err(e),
                };
                match result {
                    Err(Error::OwnershipTransient(reason)) if attempt < retries => {
                        attempt += 1;
                        debug!(topic = %name, op = request.op.kind(), attempt, reason = %reason, "Retrying request");
                        tokio::time::sleep(backoff(attempt)).await;
                    }
                    result => return result,
                }
            }
        };
        timeout(self.ctx.timeouts().request, calls)
            .await
            .map_err(|_| Error::Cluster(ClusterError::Timeout))?
    }

    /// Attach a session to a topic
    pub async fn subscribe(
        self: &Arc<Self>,
        session: SessionRef,
        sink: SessionSink,
        name: &TopicName,
    ) -> Result<ProxyResult> {
        self.call(name, session, Some(sink), ProxyOp::Subscribe).await
    }

    /// Detach a session; a topic that is gone has nothing to detach from
    pub async fn unsubscribe(self: &Arc<Self>, session: SessionRef, name: &TopicName) -> Result<()> {
        let Some(handle) = self.handle(name) else {
            return Ok(());
        };
        let request = TopicRequest {
            op: ProxyOp::Unsubscribe,
            session,
            client_seq: 0,
            sink: None,
        };
        match handle.request(request).await {
            Ok(_) | Err(Error::OwnershipTransient(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Queue a publish; the outcome arrives on the session's queue as an ack
    pub fn publish(
        self: &Arc<Self>,
        session: SessionRef,
        sink: SessionSink,
        name: &TopicName,
        client_seq: u64,
        payload: Bytes,
    ) -> Result<()> {
        let max = self.ctx.limits().max_message_size;
        if payload.len() > max {
            return Err(Error::Validation(format!(
                "message of {} bytes exceeds limit of {}",
                payload.len(),
                max
            )));
        }
        self.ctx.validators.check(&ValidationInput {
            principal: &session.principal,
            topic: name.as_str(),
            payload: &payload,
        })?;

        let handle = self.get_or_spawn(name)?;
        handle.try_send(TopicMsg::Request(Pending {
            request: TopicRequest {
                op: ProxyOp::Publish { payload },
                session,
                client_seq,
                sink: Some(sink),
            },
            reply: None,
        }))
    }

    /// Delete the session principal's persisted subscription
    pub async fn leave(self: &Arc<Self>, session: SessionRef, name: &TopicName) -> Result<()> {
        self.call(name, session, None, ProxyOp::Leave).await.map(|_| ())
    }

    pub async fn mark_read(
        self: &Arc<Self>,
        session: SessionRef,
        name: &TopicName,
        seq: u64,
    ) -> Result<()> {
        self.call(name, session, None, ProxyOp::MarkRead { seq })
            .await
            .map(|_| ())
    }

    pub async fn history(
        self: &Arc<Self>,
        session: SessionRef,
        name: &TopicName,
        since: u64,
        limit: u32,
    ) -> Result<Vec<Envelope>> {
        match self
            .call(name, session, None, ProxyOp::History { since, limit })
            .await?
        {
            ProxyResult::History(messages) => Ok(messages),
            other => Err(Error::Internal(format!("unexpected history result {:?}", other))),
        }
    }

    pub async fn set_access(
        self: &Arc<Self>,
        session: SessionRef,
        name: &TopicName,
        target: &str,
        mode: AccessMode,
    ) -> Result<()> {
        let op = ProxyOp::SetAccess {
            target: target.to_string(),
            mode: mode.bits(),
        };
        self.call(name, session, None, op).await.map(|_| ())
    }

    /// A local session closed; every topic it was attached to drops it
    pub fn session_gone(&self, session_id: Uuid, topics: &[String]) {
        for topic in topics {
            if let Some(handle) = self.topics.get(topic) {
                handle.post(TopicMsg::SessionGone(session_id));
            }
        }
    }

    /// Serve a request forwarded by a peer's proxy
    pub async fn handle_proxy(self: &Arc<Self>, correlation_id: u64, request: ProxyRequest) -> ClusterResponse {
        let name = match TopicName::from_routing(&request.topic) {
            Ok(name) => name,
            Err(e) => return ClusterResponse::proxy_failed(correlation_id, e.status(), e.to_string()),
        };
        match self.cluster.owner_of(name.as_str()) {
            Ok(Owner::Local) => {}
            Ok(Owner::Remote(owner)) => {
                debug!(topic = %name, owner = %owner, from = %request.session.origin, "Proxied request for topic owned elsewhere");
                return ClusterResponse::proxy_failed(
                    correlation_id,
                    StatusCode::NotOwner,
                    format!("{} is owned by {}", name, owner),
                );
            }
            Err(e) => return ClusterResponse::proxy_failed(correlation_id, e.status(), e.to_string()),
        }

        match self.serve_proxied(&name, request).await {
            Ok(result) => ClusterResponse::proxied(correlation_id, result),
            Err(e) => ClusterResponse::proxy_failed(correlation_id, e.status(), e.to_string()),
        }
    }

    async fn serve_proxied(self: &Arc<Self>, name: &TopicName, request: ProxyRequest) -> Result<ProxyResult> {
        let handle = self.get_or_spawn(name)?;
        if handle.role == TopicRole::Proxy {
            // Ring moved here but the old proxy has not noticed yet
            handle.post(TopicMsg::Rehash);
            return Err(Error::OwnershipTransient(format!("{} is being taken over", name)));
        }
        let request = TopicRequest {
            op: request.op,
            session: request.session,
            client_seq: request.client_seq,
            sink: None,
        };
        timeout(self.ctx.timeouts().request, handle.request(request))
            .await
            .map_err(|_| Error::Backpressure(format!("topic {} did not answer in time", name)))?
    }

    /// Downstream event from a master on `source`
    pub async fn handle_deliver(&self, source: &str, delivery: Delivery) -> Result<()> {
        let handle = self
            .topics
            .get(&delivery.topic)
            .map(|h| h.value().clone())
            .filter(|h| h.role == TopicRole::Proxy)
            .ok_or_else(|| Error::NotFound(format!("no proxy for {}", delivery.topic)))?;
        handle
            .send(TopicMsg::Deliver {
                source: source.to_string(),
                delivery,
            })
            .await
    }

    /// React to a membership change
    pub fn on_membership_event(&self, event: &MembershipEvent) {
        match event {
            MembershipEvent::RingChanged { epoch, alive } => {
                info!(epoch, alive = ?alive, topics = self.topics.len(), "Ring changed, rehashing topics");
                self.broadcast(|| TopicMsg::Rehash);
            }
            MembershipEvent::NodeFailed(node) => {
                self.cluster.close_link(node);
                self.broadcast(|| TopicMsg::PeerDown(node.clone()));
            }
            MembershipEvent::NodeSuspected(_) | MembershipEvent::NodeRecovered(_) => {}
        }
    }

    /// Re-check ownership of every loaded topic
    pub fn rehash_all(&self) {
        self.broadcast(|| TopicMsg::Rehash);
    }

    fn broadcast(&self, msg: impl Fn() -> TopicMsg) {
        let handles: Vec<TopicHandle> = self.topics.iter().map(|h| h.value().clone()).collect();
        for handle in handles {
            handle.post(msg());
        }
    }

    /// Re-route the sessions and requests of an actor that stepped down.
    /// Sessions are re-attached first so queued requests find them attached.
    pub(crate) fn rehome(
        self: &Arc<Self>,
        name: TopicName,
        sessions: Vec<(SessionRef, SessionSink)>,
        pending: Vec<Pending>,
    ) {
        if sessions.is_empty() && pending.is_empty() {
            return;
        }
        debug!(topic = %name, sessions = sessions.len(), pending = pending.len(), "Re-routing topic");
        let hub = self.clone();
        tokio::spawn(async move {
            for (session, sink) in sessions {
                if sink.is_closed() {
                    continue;
                }
                let session_id = session.session_id;
                if let Err(e) = hub.subscribe(session, sink.clone(), &name).await {
                    warn!(topic = %name, session = %session_id, error = %e, "Re-subscribe after hand-off failed");
                    sink.detached(name.as_str(), e.status());
                }
            }
            for pending in pending {
                match hub.get_or_spawn(&name) {
                    Ok(handle) => handle.forward(pending).await,
                    Err(e) => pending.complete(name.as_str(), Err(e)),
                }
            }
        });
    }

    pub async fn topic_stats(&self, name: &TopicName) -> Option<TopicStats> {
        self.handle(name)?.stats().await
    }

    /// Unload every topic and close peer links
    pub async fn shutdown(&self) {
        info!(topics = self.topics.len(), "Unloading topics");
        self.broadcast(|| TopicMsg::Shutdown);
        let drained = timeout(SHUTDOWN_GRACE, async {
            while !self.topics.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        if drained.is_err() {
            warn!(remaining = self.topics.len(), "Topics still loaded after shutdown grace");
        }
        self.cluster.close_links();
    }
}
