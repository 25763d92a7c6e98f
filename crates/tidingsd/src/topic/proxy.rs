//! Proxy topic actor
//!
//! Stands in for a remote master on nodes with local subscribers. Upstream
//! calls leave in order with at most one in flight; the call itself runs on
//! a spawned task and reports back through a channel, so the mailbox keeps
//! draining while the master is slow or gone.
//!
//! On a transient failure the call stays at the head of the queue and the
//! owner is resolved again:
//!
//! - new remote owner: switch links, re-subscribe every local session, then
//!   continue with the queued calls;
//! - this node became the owner: hand everything to the hub and exit;
//! - same owner: retry after a capped backoff.

use super::{
    backoff, sleep_until_opt, Attachment, Pending, TopicHandle, TopicMsg, TopicName, TopicRequest,
    TopicRole, TopicState, TopicStats,
};
use crate::cluster::{Cluster, Owner};
use crate::context::ServerContext;
use crate::error::{Error, Result};
use crate::hub::Hub;
use crate::link::ProxyLink;
use crate::metrics::TopicMetrics;
use crate::session::{ServerMessage, SessionSink};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tidings_cluster::{
    Delivery, DeliveryEvent, NodeId, ProxyOp, ProxyRequest, ProxyResult, SessionRef, StatusCode,
};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

enum Flow {
    Continue,
    Unload,
    HandOff,
}

enum Event {
    Msg(Option<TopicMsg>),
    Result(Result<ProxyResult>),
    Retry,
    Idle,
}

/// A queued upstream call
struct Upstream {
    pending: Pending,
    /// Generated by the proxy itself; nobody waits for it
    internal: bool,
}

impl Upstream {
    fn internal(op: ProxyOp, session: SessionRef, sink: Option<SessionSink>) -> Self {
        Self {
            pending: Pending {
                request: TopicRequest {
                    op,
                    session,
                    client_seq: 0,
                    sink,
                },
                reply: None,
            },
            internal: true,
        }
    }

    fn is_resubscribe(&self) -> bool {
        self.internal && matches!(self.pending.request.op, ProxyOp::Subscribe)
    }
}

pub(crate) struct ProxyTopic {
    ctx: Arc<ServerContext>,
    cluster: Arc<Cluster>,
    hub: Arc<Hub>,
    id: u64,
    name: TopicName,
    rx: mpsc::Receiver<TopicMsg>,
    state: TopicState,
    owner: NodeId,
    link: Arc<ProxyLink>,
    /// Local sessions confirmed by the master
    attached: HashMap<Uuid, Attachment>,
    /// Local sessions whose subscribe is on its way upstream. The master
    /// may fan out to them before its reply arrives.
    attaching: HashMap<Uuid, SessionSink>,
    queue: VecDeque<Upstream>,
    in_flight: Option<Upstream>,
    results_tx: mpsc::Sender<Result<ProxyResult>>,
    results_rx: mpsc::Receiver<Result<ProxyResult>>,
    /// Consecutive transient failures of the head call
    attempts: u32,
    retry_at: Option<Instant>,
    /// Highest sequence relayed downstream
    last_delivered: u64,
    idle_deadline: Option<Instant>,
}

impl ProxyTopic {
    pub(crate) fn spawn(
        ctx: Arc<ServerContext>,
        cluster: Arc<Cluster>,
        hub: Arc<Hub>,
        id: u64,
        name: TopicName,
        owner: NodeId,
    ) -> TopicHandle {
        let (tx, rx) = mpsc::channel(ctx.limits().mailbox_capacity);
        let (results_tx, results_rx) = mpsc::channel(1);
        let handle = TopicHandle::new(id, name.clone(), TopicRole::Proxy, tx);
        let link = cluster.link(&owner);
        let actor = Self {
            ctx,
            cluster,
            hub,
            id,
            name,
            rx,
            state: TopicState::Live,
            owner,
            link,
            attached: HashMap::new(),
            attaching: HashMap::new(),
            queue: VecDeque::new(),
            in_flight: None,
            results_tx,
            results_rx,
            attempts: 0,
            retry_at: None,
            last_delivered: 0,
            idle_deadline: None,
        };
        tokio::spawn(actor.run());
        handle
    }

    async fn run(mut self) {
        TopicMetrics::increment_loaded(TopicRole::Proxy);
        debug!(topic = %self.name, owner = %self.owner, "Proxy started");

        loop {
            self.pump();
            let event = tokio::select! {
                msg = self.rx.recv() => Event::Msg(msg),
                Some(result) = self.results_rx.recv() => Event::Result(result),
                _ = sleep_until_opt(self.retry_at) => Event::Retry,
                _ = sleep_until_opt(self.idle_deadline) => Event::Idle,
            };
            let flow = match event {
                Event::Msg(Some(msg)) => self.handle(msg),
                Event::Msg(None) => return,
                Event::Result(result) => self.on_result(result),
                Event::Retry => {
                    self.retry_at = None;
                    Flow::Continue
                }
                Event::Idle => Flow::Unload,
            };
            match flow {
                Flow::Continue => self.update_idle(),
                Flow::Unload => return self.unload(),
                Flow::HandOff => return self.hand_off(),
            }
        }
    }

    /// Start the next upstream call if none is in flight
    fn pump(&mut self) {
        if self.in_flight.is_some() || self.retry_at.is_some() {
            return;
        }
        let Some(upstream) = self.queue.pop_front() else {
            return;
        };
        let request = &upstream.pending.request;
        let call = ProxyRequest {
            topic: self.name.as_str().to_string(),
            op: request.op.clone(),
            session: request.session.clone(),
            client_seq: request.client_seq,
        };
        let link = self.link.clone();
        let results = self.results_tx.clone();
        tokio::spawn(async move {
            let result = link.call(call).await;
            let _ = results.send(result).await;
        });
        self.in_flight = Some(upstream);
    }

    fn handle(&mut self, msg: TopicMsg) -> Flow {
        match msg {
            TopicMsg::Request(pending) => self.enqueue(pending),
            TopicMsg::Deliver { source, delivery } => self.relay(&source, delivery),
            TopicMsg::Rehash => return self.resolve_owner(false),
            TopicMsg::PeerDown(node) => {
                if node == self.owner {
                    return self.resolve_owner(false);
                }
            }
            TopicMsg::SessionGone(session_id) => {
                self.attaching.remove(&session_id);
                if let Some(attachment) = self.attached.remove(&session_id) {
                    self.queue.push_back(Upstream::internal(
                        ProxyOp::Unsubscribe,
                        attachment.session,
                        None,
                    ));
                }
            }
            TopicMsg::Stats(tx) => {
                let _ = tx.send(self.stats());
            }
            TopicMsg::Shutdown => return Flow::Unload,
        }
        Flow::Continue
    }

    fn pending_len(&self) -> usize {
        self.queue.len() + usize::from(self.in_flight.is_some())
    }

    fn enqueue(&mut self, pending: Pending) {
        if self.pending_len() >= self.ctx.limits().max_pending_upstream {
            warn!(topic = %self.name, owner = %self.owner, "Upstream queue full");
            pending.complete(
                self.name.as_str(),
                Err(Error::OwnershipTransient(format!(
                    "topic {} upstream queue full",
                    self.name
                ))),
            );
            return;
        }
        let session_id = pending.request.session.session_id;
        match (&pending.request.op, &pending.request.sink) {
            (ProxyOp::Unsubscribe, _) => {
                self.attaching.remove(&session_id);
                self.attached.remove(&session_id);
            }
            (ProxyOp::Subscribe, Some(sink)) => {
                self.attaching.insert(session_id, sink.clone());
            }
            _ => {}
        }
        self.queue.push_back(Upstream {
            pending,
            internal: false,
        });
    }

    fn on_result(&mut self, result: Result<ProxyResult>) -> Flow {
        let Some(upstream) = self.in_flight.take() else {
            return Flow::Continue;
        };
        match result {
            Err(e) if e.is_upstream_transient()
                && self.attempts + 1 < self.ctx.limits().max_upstream_attempts =>
            {
                self.attempts += 1;
                TopicMetrics::increment_upstream_retries();
                debug!(
                    topic = %self.name,
                    owner = %self.owner,
                    op = upstream.pending.request.op.kind(),
                    attempt = self.attempts,
                    error = %e,
                    "Upstream call failed"
                );
                self.link.mark_degraded();
                self.requeue(upstream);
                self.resolve_owner(true)
            }
            result => {
                self.attempts = 0;
                self.finish(upstream, result);
                Flow::Continue
            }
        }
    }

    /// Put a failed call back at the head, behind pending re-subscribes
    fn requeue(&mut self, upstream: Upstream) {
        let at = self
            .queue
            .iter()
            .position(|u| !u.is_resubscribe())
            .unwrap_or(self.queue.len());
        self.queue.insert(at, upstream);
    }

    fn finish(&mut self, upstream: Upstream, result: Result<ProxyResult>) {
        let request = &upstream.pending.request;
        let session_id = request.session.session_id;
        match (&request.op, &result) {
            (ProxyOp::Subscribe, Ok(_)) if !upstream.internal => {
                self.attaching.remove(&session_id);
                match &request.sink {
                    Some(sink) if sink.is_closed() => {
                        debug!(topic = %self.name, session = %session_id, "Session closed while subscribing");
                        self.queue.push_back(Upstream::internal(
                            ProxyOp::Unsubscribe,
                            request.session.clone(),
                            None,
                        ));
                    }
                    Some(sink) => {
                        self.attached.insert(
                            session_id,
                            Attachment {
                                session: request.session.clone(),
                                sink: Some(sink.clone()),
                            },
                        );
                    }
                    None => {}
                }
            }
            (ProxyOp::Subscribe, Err(_)) if !upstream.internal => {
                self.attaching.remove(&session_id);
            }
            // A subscribe queued ahead of it may have attached the session
            (ProxyOp::Unsubscribe, _) if !upstream.internal => {
                self.attached.remove(&session_id);
            }
            (ProxyOp::Subscribe, Err(e)) if upstream.internal => {
                warn!(topic = %self.name, session = %session_id, error = %e, "Re-subscribe failed");
                if let Some(attachment) = self.attached.remove(&session_id) {
                    if let Some(sink) = attachment.sink {
                        sink.detached(self.name.as_str(), e.status());
                    }
                }
            }
            (ProxyOp::Leave, Ok(_)) => {
                self.attached.remove(&session_id);
            }
            _ => {}
        }
        if !upstream.internal {
            upstream.pending.complete(self.name.as_str(), result);
        }
    }

    /// Re-check the owner after a ring change or a failed call
    fn resolve_owner(&mut self, after_failure: bool) -> Flow {
        match self.cluster.owner_of(self.name.as_str()) {
            Ok(Owner::Local) => return Flow::HandOff,
            Ok(Owner::Remote(node)) if node != self.owner => self.switch_owner(node),
            _ if after_failure => {
                self.retry_at = Some(Instant::now() + backoff(self.attempts));
            }
            _ => {}
        }
        Flow::Continue
    }

    fn switch_owner(&mut self, node: NodeId) {
        info!(topic = %self.name, from = %self.owner, to = %node, "Proxy following new owner");
        self.owner = node;
        self.link = self.cluster.link(&self.owner);
        self.retry_at = None;

        // Re-assert every local subscription ahead of the queued calls
        self.queue.retain(|u| !u.is_resubscribe());
        for attachment in self.attached.values() {
            self.queue.push_front(Upstream::internal(
                ProxyOp::Subscribe,
                attachment.session.clone(),
                attachment.sink.clone(),
            ));
        }
    }

    /// Downstream event from the master
    fn relay(&mut self, source: &str, delivery: Delivery) {
        if source != self.owner {
            debug!(topic = %self.name, source = %source, owner = %self.owner, "Dropped event from stale owner");
            return;
        }
        match delivery.event {
            DeliveryEvent::Data(envelope) => {
                if envelope.seq <= self.last_delivered {
                    debug!(topic = %self.name, seq = envelope.seq, "Dropped duplicate delivery");
                    return;
                }
                self.last_delivered = envelope.seq;

                let mut failed = Vec::new();
                for recipient in &delivery.recipients {
                    let sink = match self.attached.get(recipient) {
                        Some(attachment) => attachment.sink.as_ref(),
                        None => self.attaching.get(recipient),
                    };
                    let Some(sink) = sink else {
                        continue;
                    };
                    if !sink.deliver(ServerMessage::Data(envelope.clone())) {
                        failed.push(*recipient);
                    }
                }
                for session_id in failed {
                    // An attaching session is unsubscribed once its reply arrives
                    self.attaching.remove(&session_id);
                    if let Some(attachment) = self.attached.remove(&session_id) {
                        self.queue.push_back(Upstream::internal(
                            ProxyOp::Unsubscribe,
                            attachment.session,
                            None,
                        ));
                    }
                }
            }
            DeliveryEvent::Detached { session_id, reason } => {
                if reason == StatusCode::OwnershipTransient {
                    // The master stepped down; attach again wherever it went
                    if let Some(attachment) = self.attached.get(&session_id) {
                        self.queue.push_back(Upstream::internal(
                            ProxyOp::Subscribe,
                            attachment.session.clone(),
                            attachment.sink.clone(),
                        ));
                    }
                } else if let Some(attachment) = self.attached.remove(&session_id) {
                    if let Some(sink) = attachment.sink {
                        sink.detached(self.name.as_str(), reason);
                    }
                }
            }
        }
    }

    fn update_idle(&mut self) {
        let idle = self.attached.is_empty() && self.pending_len() == 0;
        if idle {
            if self.state != TopicState::Draining {
                self.state = TopicState::Draining;
                self.idle_deadline = Some(Instant::now() + self.ctx.timeouts().proxy_idle);
            }
        } else if self.state == TopicState::Draining {
            self.state = TopicState::Live;
            self.idle_deadline = None;
        }
    }

    fn stats(&self) -> TopicStats {
        TopicStats {
            role: TopicRole::Proxy,
            state: self.state,
            local_subscribers: self.attached.len(),
            remote_subscribers: 0,
            last_seq: self.last_delivered,
            pending: self.pending_len(),
        }
    }

    /// Stop reading; returns every user request not yet answered
    fn drain(&mut self) -> Vec<Pending> {
        self.hub.deregister(&self.name, self.id);
        self.rx.close();

        let mut pending: Vec<Pending> = self
            .in_flight
            .take()
            .into_iter()
            .chain(self.queue.drain(..))
            .filter(|u| !u.internal)
            .map(|u| u.pending)
            .collect();
        while let Ok(msg) = self.rx.try_recv() {
            match msg {
                TopicMsg::Request(p) => pending.push(p),
                TopicMsg::Stats(tx) => {
                    let _ = tx.send(self.stats());
                }
                _ => {}
            }
        }
        pending
    }

    fn unload(mut self) {
        for pending in self.drain() {
            pending.complete(
                self.name.as_str(),
                Err(Error::OwnershipTransient(format!("topic {} unloading", self.name))),
            );
        }
        TopicMetrics::increment_unloaded(TopicRole::Proxy);
        debug!(topic = %self.name, "Proxy unloaded");
    }

    /// This node became the owner: the hub re-routes sessions and requests
    /// to a local master
    fn hand_off(mut self) {
        info!(topic = %self.name, from = %self.owner, "Ownership moved here, proxy stepping down");
        let pending = self.drain();
        let sessions: Vec<(SessionRef, SessionSink)> = self
            .attached
            .drain()
            .filter_map(|(_, a)| a.sink.map(|sink| (a.session, sink)))
            .collect();
        TopicMetrics::increment_handoffs(TopicRole::Proxy);
        self.hub.rehome(self.name.clone(), sessions, pending);
    }
}
