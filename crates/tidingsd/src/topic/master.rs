//! Master topic actor
//!
//! Runs on the owning node. It is the only place sequences are assigned:
//! each publish takes `last_seq + 1` and is committed with a conditional
//! append before anyone sees it. A conflict on that append means another
//! master advanced the topic, so this one steps down.

use super::{
    page_limit, sleep_until_opt, AccessMode, Attachment, Pending, TopicHandle, TopicKind,
    TopicMsg, TopicName, TopicRequest, TopicRole, TopicState, TopicStats,
};
use crate::cluster::Cluster;
use crate::context::ServerContext;
use crate::error::{Error, Result};
use crate::hub::Hub;
use crate::metrics::TopicMetrics;
use crate::push::PushPayload;
use crate::session::{ServerMessage, SessionSink};
use crate::store::{AppendOutcome, AppendRequest, StoreError, SubscriptionRecord, TopicRecord};
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tidings_cluster::protocol::now_millis;
use tidings_cluster::{
    Delivery, DeliveryEvent, Envelope, NodeId, ProxyOp, ProxyResult, SessionRef, StatusCode,
};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

enum Flow {
    Continue,
    Unload,
    HandOff(&'static str),
}

enum Event {
    Msg(Option<TopicMsg>),
    Idle,
}

pub(crate) struct MasterTopic {
    ctx: Arc<ServerContext>,
    cluster: Arc<Cluster>,
    hub: Arc<Hub>,
    id: u64,
    name: TopicName,
    rx: mpsc::Receiver<TopicMsg>,
    state: TopicState,
    record: TopicRecord,
    /// Persisted subscriptions by principal
    members: HashMap<String, SubscriptionRecord>,
    /// Attached sessions, local and remote
    attached: HashMap<Uuid, Attachment>,
    /// Most recent messages, ascending
    cache: VecDeque<Envelope>,
    idle_deadline: Option<Instant>,
    /// Set when the store reported that another master advanced the topic
    superseded: bool,
    /// Local publishes to re-route after stepping down
    carry: Vec<Pending>,
}

impl MasterTopic {
    pub(crate) fn spawn(
        ctx: Arc<ServerContext>,
        cluster: Arc<Cluster>,
        hub: Arc<Hub>,
        id: u64,
        name: TopicName,
    ) -> TopicHandle {
        let (tx, rx) = mpsc::channel(ctx.limits().mailbox_capacity);
        let handle = TopicHandle::new(id, name.clone(), TopicRole::Master, tx);
        let record = TopicRecord::new(name.as_str(), name.kind(), None);
        let actor = Self {
            ctx,
            cluster,
            hub,
            id,
            name,
            rx,
            state: TopicState::Loading,
            record,
            members: HashMap::new(),
            attached: HashMap::new(),
            cache: VecDeque::new(),
            idle_deadline: None,
            superseded: false,
            carry: Vec::new(),
        };
        tokio::spawn(actor.run());
        handle
    }

    async fn run(mut self) {
        TopicMetrics::increment_loaded(TopicRole::Master);
        if let Err(e) = self.load().await {
            self.abort(e);
            return;
        }
        info!(
            topic = %self.name,
            last_seq = self.record.last_seq,
            members = self.members.len(),
            "Master loaded"
        );
        self.state = TopicState::Live;
        self.update_idle();

        loop {
            let event = tokio::select! {
                msg = self.rx.recv() => Event::Msg(msg),
                _ = sleep_until_opt(self.idle_deadline) => Event::Idle,
            };
            let flow = match event {
                Event::Msg(Some(msg)) => self.handle(msg).await,
                Event::Msg(None) => return,
                Event::Idle => Flow::Unload,
            };
            match flow {
                Flow::Continue => self.update_idle(),
                Flow::Unload => return self.unload().await,
                Flow::HandOff(reason) => return self.hand_off(reason).await,
            }
        }
    }

    async fn load(&mut self) -> Result<()> {
        let store = self.ctx.store.clone();
        let name = self.name.as_str();

        let record = match store.load_topic(name).await? {
            Some(record) => record,
            None if self.name.kind().is_implicit() => {
                let owner = self.name.owner_principal().map(str::to_string);
                store
                    .create_topic(TopicRecord::new(name, self.name.kind(), owner))
                    .await?
            }
            None => return Err(Error::NotFound(format!("topic {}", name))),
        };

        self.members = store
            .subscriptions(name)
            .await?
            .into_iter()
            .map(|s| (s.principal.clone(), s))
            .collect();

        let keep = self.ctx.limits().history_cache;
        if record.last_seq > 0 && keep > 0 {
            let since = record.last_seq.saturating_sub(keep as u64);
            self.cache = store.history(name, since, keep).await?.into();
        }
        self.record = record;
        Ok(())
    }

    /// Loading failed: fail everything queued and leave no trace
    fn abort(mut self, error: Error) {
        warn!(topic = %self.name, error = %error, "Master failed to load");
        self.hub.deregister(&self.name, self.id);
        self.rx.close();
        while let Ok(msg) = self.rx.try_recv() {
            match msg {
                TopicMsg::Request(pending) => {
                    let failure = match &error {
                        Error::NotFound(m) => Error::NotFound(m.clone()),
                        e => Error::OwnershipTransient(format!("topic {} failed to load: {}", self.name, e)),
                    };
                    pending.complete(self.name.as_str(), Err(failure));
                }
                TopicMsg::Stats(tx) => {
                    let _ = tx.send(self.stats());
                }
                _ => {}
            }
        }
        TopicMetrics::increment_unloaded(TopicRole::Master);
    }

    async fn handle(&mut self, msg: TopicMsg) -> Flow {
        match msg {
            TopicMsg::Request(pending) => {
                let result = self.dispatch(&pending.request).await;
                if self.superseded {
                    let reroute = pending.reply.is_none()
                        && matches!(result, Err(Error::OwnershipTransient(_)));
                    if reroute {
                        self.carry.push(pending);
                    } else {
                        pending.complete(self.name.as_str(), result);
                    }
                    return Flow::HandOff("superseded by another master");
                }
                pending.complete(self.name.as_str(), result);
            }
            TopicMsg::Deliver { source, .. } => {
                debug!(topic = %self.name, source = %source, "Master ignores downstream delivery");
            }
            TopicMsg::Rehash => {
                if !self.cluster.is_local_owner(self.name.as_str()) {
                    return Flow::HandOff("ownership moved");
                }
            }
            TopicMsg::PeerDown(node) => self.drop_peer(&node),
            TopicMsg::SessionGone(session_id) => {
                self.attached.remove(&session_id);
            }
            TopicMsg::Stats(tx) => {
                let _ = tx.send(self.stats());
            }
            TopicMsg::Shutdown => return Flow::Unload,
        }
        Flow::Continue
    }

    async fn dispatch(&mut self, request: &TopicRequest) -> Result<ProxyResult> {
        match &request.op {
            ProxyOp::Subscribe => self.subscribe(request).await,
            ProxyOp::Unsubscribe => {
                self.attached.remove(&request.session.session_id);
                Ok(ProxyResult::Done)
            }
            ProxyOp::Publish { payload } => self.publish(request, payload.clone()).await,
            ProxyOp::Leave => self.leave(&request.session).await,
            ProxyOp::MarkRead { seq } => self.mark_read(&request.session, *seq).await,
            ProxyOp::History { since, limit } => {
                self.history(&request.session, *since, *limit).await
            }
            ProxyOp::SetAccess { target, mode } => {
                self.set_access(&request.session, target, AccessMode::from_bits_truncate(*mode))
                    .await
            }
        }
    }

    fn mode_of(&self, principal: &str) -> AccessMode {
        self.members
            .get(principal)
            .map(|m| m.mode)
            .unwrap_or_default()
    }

    /// Access granted to a principal joining for the first time
    fn default_mode(&self, principal: &str) -> Result<AccessMode> {
        if self.record.owner.as_deref() == Some(principal) {
            return Ok(AccessMode::FULL);
        }
        match self.name.kind() {
            TopicKind::Group => Ok(AccessMode::GROUP_MEMBER),
            TopicKind::Channel => Ok(AccessMode::CHANNEL_READER),
            TopicKind::P2p => match self.name.parties() {
                Some((a, b)) if principal == a || principal == b => Ok(AccessMode::P2P_PARTY),
                _ => Err(Error::PermissionDenied(format!("not a party of {}", self.name))),
            },
            TopicKind::Me | TopicKind::Fnd => {
                Err(Error::PermissionDenied(format!("{} is private", self.name)))
            }
        }
    }

    fn check_capacity(&self) -> Result<()> {
        let limit = self.ctx.limits().max_subscriber_count;
        if matches!(self.name.kind(), TopicKind::Group | TopicKind::Channel)
            && self.members.len() >= limit
        {
            return Err(Error::PermissionDenied(format!(
                "topic {} has reached {} subscribers",
                self.name, limit
            )));
        }
        Ok(())
    }

    async fn subscribe(&mut self, request: &TopicRequest) -> Result<ProxyResult> {
        let local = request.session.origin == self.cluster.local_id();
        if local && request.sink.as_ref().is_some_and(SessionSink::is_closed) {
            return Err(Error::SessionClosed);
        }
        let principal = &request.session.principal;
        let mode = match self.members.get(principal) {
            Some(member) => member.mode,
            None => {
                let mode = self.default_mode(principal)?;
                self.check_capacity()?;
                let member = SubscriptionRecord {
                    topic: self.name.as_str().to_string(),
                    principal: principal.clone(),
                    mode,
                    read_seq: 0,
                };
                self.ctx.store.upsert_subscription(&member).await?;
                self.members.insert(principal.clone(), member);
                mode
            }
        };
        if !mode.can_join() {
            return Err(Error::PermissionDenied(format!(
                "{} may not join {} ({})",
                principal, self.name, mode
            )));
        }

        self.attached.insert(
            request.session.session_id,
            Attachment {
                session: request.session.clone(),
                sink: if local { request.sink.clone() } else { None },
            },
        );
        debug!(
            topic = %self.name,
            session = %request.session.session_id,
            origin = %request.session.origin,
            "Session attached"
        );
        Ok(ProxyResult::Subscribed {
            mode: mode.bits(),
            last_seq: self.record.last_seq,
        })
    }

    async fn publish(&mut self, request: &TopicRequest, payload: Bytes) -> Result<ProxyResult> {
        let session = &request.session;
        if !self.attached.contains_key(&session.session_id) {
            return Err(Error::PermissionDenied(format!("not subscribed to {}", self.name)));
        }
        if !self.mode_of(&session.principal).can_write() {
            return Err(Error::PermissionDenied(format!(
                "{} may not publish to {}",
                session.principal, self.name
            )));
        }

        let timestamp_ms = now_millis();
        let append = AppendRequest {
            topic: self.name.as_str().to_string(),
            expected_seq: self.record.last_seq + 1,
            sender: session.principal.clone(),
            session_id: session.session_id,
            client_seq: request.client_seq,
            timestamp_ms,
            payload: payload.clone(),
        };

        match self.ctx.store.append(append).await {
            Ok(AppendOutcome::Appended(seq)) => {
                self.record.last_seq = seq;
                self.record.touched_ms = timestamp_ms;
                let envelope = Envelope {
                    topic: self.name.as_str().to_string(),
                    sender: session.principal.clone(),
                    seq,
                    timestamp_ms,
                    payload,
                };
                self.remember(envelope.clone());
                self.fan_out(&envelope);
                self.notify_offline(&envelope);
                TopicMetrics::increment_publishes();
                Ok(ProxyResult::Published {
                    seq,
                    duplicate: false,
                })
            }
            Ok(AppendOutcome::Duplicate(seq)) => {
                debug!(
                    topic = %self.name,
                    session = %session.session_id,
                    client_seq = request.client_seq,
                    seq,
                    "Duplicate publish"
                );
                TopicMetrics::increment_duplicates();
                Ok(ProxyResult::Published {
                    seq,
                    duplicate: true,
                })
            }
            Err(StoreError::SequenceConflict { stored, .. }) => {
                warn!(
                    topic = %self.name,
                    last_seq = self.record.last_seq,
                    stored,
                    "Sequence conflict, stepping down"
                );
                self.superseded = true;
                Err(Error::OwnershipTransient(format!(
                    "topic {} advanced elsewhere",
                    self.name
                )))
            }
            Err(e) => {
                warn!(topic = %self.name, error = %e, "Append failed");
                Err(e.into())
            }
        }
    }

    fn remember(&mut self, envelope: Envelope) {
        let keep = self.ctx.limits().history_cache;
        if keep == 0 {
            return;
        }
        self.cache.push_back(envelope);
        while self.cache.len() > keep {
            self.cache.pop_front();
        }
    }

    /// Deliver to attached readers: local sinks directly, one delivery per
    /// remote node
    fn fan_out(&mut self, envelope: &Envelope) {
        let mut remote: BTreeMap<NodeId, Vec<Uuid>> = BTreeMap::new();
        let mut failed = Vec::new();

        for (session_id, attachment) in &self.attached {
            if !self.mode_of(&attachment.session.principal).can_read() {
                continue;
            }
            match &attachment.sink {
                Some(sink) => {
                    if !sink.deliver(ServerMessage::Data(envelope.clone())) {
                        failed.push(*session_id);
                    }
                }
                None => remote
                    .entry(attachment.session.origin.clone())
                    .or_default()
                    .push(*session_id),
            }
        }

        for session_id in failed {
            self.attached.remove(&session_id);
        }

        for (node, recipients) in remote {
            if !self.cluster.is_reachable(&node) {
                // A failed peer's link is closed; do not reopen it
                self.drop_peer(&node);
                continue;
            }
            let delivery = Delivery {
                topic: self.name.as_str().to_string(),
                recipients,
                event: DeliveryEvent::Data(envelope.clone()),
            };
            if let Err(e) = self.cluster.link(&node).deliver(delivery) {
                warn!(topic = %self.name, node = %node, error = %e, "Downstream delivery dropped");
            }
        }
    }

    /// Push notification to readers with no attached session
    fn notify_offline(&self, envelope: &Envelope) {
        let online: HashSet<&str> = self
            .attached
            .values()
            .map(|a| a.session.principal.as_str())
            .collect();
        let recipients: Vec<String> = self
            .members
            .values()
            .filter(|m| {
                m.mode.can_read()
                    && m.principal != envelope.sender
                    && !online.contains(m.principal.as_str())
            })
            .map(|m| m.principal.clone())
            .collect();
        if recipients.is_empty() {
            return;
        }
        self.ctx.push.notify(PushPayload {
            topic: envelope.topic.clone(),
            sender: envelope.sender.clone(),
            seq: envelope.seq,
            timestamp_ms: envelope.timestamp_ms,
            recipients,
        });
    }

    /// Tell one session it was dropped
    fn notify_detached(&self, attachment: &Attachment, reason: StatusCode) {
        match &attachment.sink {
            Some(sink) => sink.detached(self.name.as_str(), reason),
            None if !self.cluster.is_reachable(&attachment.session.origin) => {
                debug!(
                    topic = %self.name,
                    session = %attachment.session.session_id,
                    origin = %attachment.session.origin,
                    "Detach notice for failed node skipped"
                );
            }
            None => {
                let session_id = attachment.session.session_id;
                let delivery = Delivery {
                    topic: self.name.as_str().to_string(),
                    recipients: vec![session_id],
                    event: DeliveryEvent::Detached { session_id, reason },
                };
                if let Err(e) = self.cluster.link(&attachment.session.origin).deliver(delivery) {
                    warn!(topic = %self.name, session = %session_id, error = %e, "Detach notice dropped");
                }
            }
        }
    }

    /// Detach every session of `principal` except `keep`
    fn detach_principal(&mut self, principal: &str, keep: Option<Uuid>, reason: StatusCode) {
        let dropped: Vec<Uuid> = self
            .attached
            .iter()
            .filter(|(id, a)| a.session.principal == principal && Some(**id) != keep)
            .map(|(id, _)| *id)
            .collect();
        for id in dropped {
            if let Some(attachment) = self.attached.remove(&id) {
                self.notify_detached(&attachment, reason);
            }
        }
    }

    async fn leave(&mut self, session: &SessionRef) -> Result<ProxyResult> {
        let principal = session.principal.as_str();
        if self.record.owner.as_deref() == Some(principal)
            && matches!(self.name.kind(), TopicKind::Group | TopicKind::Channel)
        {
            return Err(Error::PermissionDenied(format!(
                "the owner cannot leave {}",
                self.name
            )));
        }
        self.ctx
            .store
            .delete_subscription(self.name.as_str(), principal)
            .await?;
        self.members.remove(principal);
        self.attached.remove(&session.session_id);
        self.detach_principal(principal, None, StatusCode::NotFound);
        debug!(topic = %self.name, principal = %principal, "Left topic");
        Ok(ProxyResult::Done)
    }

    async fn mark_read(&mut self, session: &SessionRef, seq: u64) -> Result<ProxyResult> {
        let Some(member) = self.members.get(&session.principal) else {
            return Err(Error::NotFound(format!(
                "{} is not subscribed to {}",
                session.principal, self.name
            )));
        };
        let seq = seq.min(self.record.last_seq);
        if seq <= member.read_seq {
            return Ok(ProxyResult::Done);
        }
        let updated = SubscriptionRecord {
            read_seq: seq,
            ..member.clone()
        };
        self.ctx.store.upsert_subscription(&updated).await?;
        self.members.insert(session.principal.clone(), updated);
        Ok(ProxyResult::Done)
    }

    async fn history(&self, session: &SessionRef, since: u64, limit: u32) -> Result<ProxyResult> {
        if !self.mode_of(&session.principal).can_read() {
            return Err(Error::PermissionDenied(format!(
                "{} may not read {}",
                session.principal, self.name
            )));
        }
        if since >= self.record.last_seq {
            return Ok(ProxyResult::History(Vec::new()));
        }
        let limit = page_limit(limit);

        let cached = self
            .cache
            .front()
            .map(|first| first.seq <= since + 1)
            .unwrap_or(false);
        let messages = if cached {
            self.cache
                .iter()
                .filter(|m| m.seq > since)
                .take(limit)
                .cloned()
                .collect()
        } else {
            self.ctx
                .store
                .history(self.name.as_str(), since, limit)
                .await?
        };
        Ok(ProxyResult::History(messages))
    }

    async fn set_access(
        &mut self,
        session: &SessionRef,
        target: &str,
        mode: AccessMode,
    ) -> Result<ProxyResult> {
        if !self.mode_of(&session.principal).is_owner() {
            return Err(Error::PermissionDenied(format!(
                "only the owner may change access to {}",
                self.name
            )));
        }
        if !matches!(self.name.kind(), TopicKind::Group | TopicKind::Channel) {
            return Err(Error::Validation(format!(
                "access to {} topics is fixed",
                self.name.kind()
            )));
        }
        if self.record.owner.as_deref() == Some(target) {
            return Err(Error::PermissionDenied("the owner's access cannot change".into()));
        }
        TopicName::resolve("me", target)?;

        let updated = match self.members.get(target) {
            Some(member) => SubscriptionRecord {
                mode,
                ..member.clone()
            },
            None => {
                self.check_capacity()?;
                SubscriptionRecord {
                    topic: self.name.as_str().to_string(),
                    principal: target.to_string(),
                    mode,
                    read_seq: 0,
                }
            }
        };
        self.ctx.store.upsert_subscription(&updated).await?;
        self.members.insert(target.to_string(), updated);
        info!(topic = %self.name, target = %target, mode = %mode, "Access changed");

        if !mode.can_join() {
            self.detach_principal(target, None, StatusCode::PermissionDenied);
        }
        Ok(ProxyResult::Done)
    }

    fn drop_peer(&mut self, node: &str) {
        let before = self.attached.len();
        self.attached.retain(|_, a| a.session.origin != node);
        let dropped = before - self.attached.len();
        if dropped > 0 {
            info!(topic = %self.name, node = %node, dropped, "Dropped subscribers of failed node");
        }
    }

    fn update_idle(&mut self) {
        if self.attached.is_empty() {
            if self.state != TopicState::Draining {
                self.state = TopicState::Draining;
                self.idle_deadline = Some(Instant::now() + self.ctx.timeouts().master_idle);
                debug!(topic = %self.name, "Master idle");
            }
        } else if self.state == TopicState::Draining {
            self.state = TopicState::Live;
            self.idle_deadline = None;
            debug!(topic = %self.name, "Master idle unload cancelled");
        }
    }

    fn stats(&self) -> TopicStats {
        let local = self.attached.values().filter(|a| a.sink.is_some()).count();
        TopicStats {
            role: TopicRole::Master,
            state: self.state,
            local_subscribers: local,
            remote_subscribers: self.attached.len() - local,
            last_seq: self.record.last_seq,
            pending: 0,
        }
    }

    async fn flush(&self) {
        if let Err(e) = self.ctx.store.save_topic(&self.record).await {
            warn!(topic = %self.name, error = %e, "Failed to flush topic record");
        }
    }

    /// Stop reading and collect what is still queued. Requests awaiting a
    /// reply are failed; local publishes are returned.
    fn drain_mailbox(&mut self, reason: &str) -> Vec<Pending> {
        self.hub.deregister(&self.name, self.id);
        self.rx.close();
        let mut publishes = Vec::new();
        while let Ok(msg) = self.rx.try_recv() {
            match msg {
                TopicMsg::Request(pending) if pending.reply.is_none() => publishes.push(pending),
                TopicMsg::Request(pending) => pending.complete(
                    self.name.as_str(),
                    Err(Error::OwnershipTransient(format!("topic {} {}", self.name, reason))),
                ),
                TopicMsg::Stats(tx) => {
                    let _ = tx.send(self.stats());
                }
                _ => {}
            }
        }
        publishes
    }

    async fn unload(mut self) {
        self.flush().await;
        for pending in self.drain_mailbox("unloading") {
            pending.complete(
                self.name.as_str(),
                Err(Error::OwnershipTransient(format!("topic {} unloading", self.name))),
            );
        }
        TopicMetrics::increment_unloaded(TopicRole::Master);
        info!(topic = %self.name, last_seq = self.record.last_seq, "Master unloaded");
    }

    /// Ownership moved away: hand local sessions back to the hub and ask
    /// remote proxies to re-subscribe
    async fn hand_off(mut self, reason: &'static str) {
        info!(topic = %self.name, reason, "Master stepping down");
        self.flush().await;

        let mut pending = std::mem::take(&mut self.carry);
        pending.extend(self.drain_mailbox("moved"));

        let attached = std::mem::take(&mut self.attached);
        let mut sessions: Vec<(SessionRef, SessionSink)> = Vec::new();
        for (_, attachment) in attached {
            match attachment.sink {
                Some(sink) => sessions.push((attachment.session, sink)),
                None => self.notify_detached(
                    &Attachment {
                        session: attachment.session,
                        sink: None,
                    },
                    StatusCode::OwnershipTransient,
                ),
            }
        }

        TopicMetrics::increment_handoffs(TopicRole::Master);
        self.hub.rehome(self.name.clone(), sessions, pending);
    }
}
