//! Session multiplexer
//!
//! A session binds one client connection to its subscriptions. Whatever
//! the client transport is, it talks to the [`SessionStore`] by session id
//! and drains the session's outbound queue.
//!
//! Sessions expire after `session_idle` without activity; long-poll
//! sessions get `long_poll_grace` on top to cover the gap between polls.
//! A session whose outbound queue overflows is closed.

use crate::context::ServerContext;
use crate::error::{Error, ErrorReply, Result};
use crate::hub::Hub;
use crate::metrics::SessionMetrics;
use crate::topic::{AccessMode, TopicName};
use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tidings_cluster::{Envelope, ProxyResult, SessionRef, StatusCode};
use tokio::sync::mpsc;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Client transport a session arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    WebSocket,
    LongPoll,
    Grpc,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransportKind::WebSocket => "websocket",
            TransportKind::LongPoll => "long_poll",
            TransportKind::Grpc => "grpc",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Client went away
    Disconnect,
    Idle,
    /// Outbound queue overflowed
    Overflow,
    Shutdown,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::Disconnect => "disconnect",
            CloseReason::Idle => "idle",
            CloseReason::Overflow => "overflow",
            CloseReason::Shutdown => "shutdown",
        }
    }
}

/// Server to client message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    Data(Envelope),
    /// Outcome of an asynchronous publish
    Ack {
        topic: String,
        client_seq: u64,
        result: std::result::Result<u64, ErrorReply>,
    },
    /// The session no longer receives messages from this topic
    Detached { topic: String, reason: StatusCode },
    Closed { reason: CloseReason },
}

/// Writing end of a session's outbound queue, handed to topic actors
#[derive(Clone)]
pub struct SessionSink {
    session_id: Uuid,
    tx: mpsc::Sender<ServerMessage>,
    subscriptions: Arc<DashSet<String>>,
    close_reason: Arc<Mutex<Option<CloseReason>>>,
    closer: CancellationToken,
}

impl fmt::Debug for SessionSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionSink")
            .field("session_id", &self.session_id)
            .field("closed", &self.closer.is_cancelled())
            .finish()
    }
}

impl SessionSink {
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn is_closed(&self) -> bool {
        self.closer.is_cancelled()
    }

    /// Queue a message without waiting. A full queue closes the session;
    /// returns false when the message was not queued.
    pub fn deliver(&self, msg: ServerMessage) -> bool {
        match self.tx.try_send(msg) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(session = %self.session_id, "Outbound queue full, closing session");
                self.close(CloseReason::Overflow);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.close(CloseReason::Disconnect);
                false
            }
        }
    }

    /// The topic dropped this session
    pub fn detached(&self, topic: &str, reason: StatusCode) {
        self.subscriptions.remove(topic);
        self.deliver(ServerMessage::Detached {
            topic: topic.to_string(),
            reason,
        });
    }

    /// Request teardown; the first reason wins
    pub fn close(&self, reason: CloseReason) {
        self.close_reason.lock().get_or_insert(reason);
        self.closer.cancel();
    }

    fn reason(&self) -> CloseReason {
        self.close_reason
            .lock()
            .unwrap_or(CloseReason::Disconnect)
    }
}

/// A connected client
pub struct Session {
    id: Uuid,
    principal: String,
    origin: String,
    transport: TransportKind,
    last_active: Mutex<Instant>,
    subscriptions: Arc<DashSet<String>>,
    client_seq: AtomicU64,
    sink: SessionSink,
}

impl Session {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn principal(&self) -> &str {
        &self.principal
    }

    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    /// Routing names of the subscribed topics
    pub fn subscriptions(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.subscriptions.iter().map(|t| t.key().clone()).collect();
        topics.sort();
        topics
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.subscriptions.contains(topic)
    }

    pub fn idle_for(&self) -> Duration {
        self.last_active.lock().elapsed()
    }

    fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }

    fn session_ref(&self) -> SessionRef {
        SessionRef {
            session_id: self.id,
            principal: self.principal.clone(),
            origin: self.origin.clone(),
        }
    }

    /// Run an operation unless the session is closed first
    async fn guard<T>(&self, op: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            biased;
            _ = self.sink.closer.cancelled() => Err(Error::SessionClosed),
            result = op => result,
        }
    }
}

/// Newly connected session and its outbound queue
pub struct SessionHandle {
    pub session: Arc<Session>,
    pub outbound: mpsc::Receiver<ServerMessage>,
}

impl SessionHandle {
    pub fn id(&self) -> Uuid {
        self.session.id
    }
}

/// Result of a successful subscribe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// Routing name
    pub topic: String,
    pub mode: AccessMode,
    pub last_seq: u64,
}

/// All sessions of this node
pub struct SessionStore {
    ctx: Arc<ServerContext>,
    hub: Arc<Hub>,
    sessions: DashMap<Uuid, Arc<Session>>,
}

impl SessionStore {
    pub fn new(ctx: Arc<ServerContext>, hub: Arc<Hub>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            hub,
            sessions: DashMap::new(),
        })
    }

    /// Open a session for an already authenticated principal
    pub fn connect(self: &Arc<Self>, principal: &str, transport: TransportKind) -> Result<SessionHandle> {
        // The principal must be usable in topic names
        TopicName::resolve("me", principal)?;

        let (tx, rx) = mpsc::channel(self.ctx.limits().session_queue);
        let subscriptions = Arc::new(DashSet::new());
        let closer = CancellationToken::new();
        let id = Uuid::new_v4();
        let session = Arc::new(Session {
            id,
            principal: principal.to_string(),
            origin: self.hub.local_id().to_string(),
            transport,
            last_active: Mutex::new(Instant::now()),
            subscriptions: subscriptions.clone(),
            client_seq: AtomicU64::new(0),
            sink: SessionSink {
                session_id: id,
                tx,
                subscriptions,
                close_reason: Arc::new(Mutex::new(None)),
                closer: closer.clone(),
            },
        });
        self.sessions.insert(id, session.clone());

        let store = Arc::downgrade(self);
        tokio::spawn(watch_session(store, id, closer));

        SessionMetrics::increment_opened();
        SessionMetrics::set_active(self.sessions.len());
        info!(session = %id, principal = %principal, transport = %transport, "Session opened");

        Ok(SessionHandle {
            session,
            outbound: rx,
        })
    }

    /// Authenticate, then open a session
    pub fn login(
        self: &Arc<Self>,
        scheme: &str,
        secret: &str,
        transport: TransportKind,
    ) -> Result<SessionHandle> {
        let principal = self.ctx.auth.authenticate(scheme, secret)?;
        self.connect(&principal, transport)
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|s| s.value().clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Live session, marked active
    fn active(&self, id: Uuid) -> Result<Arc<Session>> {
        let session = self.get(id).ok_or(Error::SessionClosed)?;
        if session.sink.is_closed() {
            return Err(Error::SessionClosed);
        }
        session.touch();
        Ok(session)
    }

    /// Keepalive from the transport (a long poll arriving, a ping)
    pub fn touch(&self, id: Uuid) -> Result<()> {
        self.active(id).map(|_| ())
    }

    pub async fn subscribe(&self, id: Uuid, topic: &str) -> Result<Subscription> {
        let session = self.active(id)?;
        let name = TopicName::resolve(topic, &session.principal)?;
        let result = session
            .guard(
                self.hub
                    .subscribe(session.session_ref(), session.sink.clone(), &name),
            )
            .await;
        if session.sink.is_closed() {
            // close() may have run before this topic was recorded
            self.hub.session_gone(id, &[name.as_str().to_string()]);
            return Err(Error::SessionClosed);
        }
        match result? {
            ProxyResult::Subscribed { mode, last_seq } => {
                session.subscriptions.insert(name.as_str().to_string());
                debug!(session = %id, topic = %name, "Subscribed");
                Ok(Subscription {
                    topic: name.as_str().to_string(),
                    mode: AccessMode::from_bits_truncate(mode),
                    last_seq,
                })
            }
            other => Err(Error::Internal(format!("unexpected subscribe result {:?}", other))),
        }
    }

    pub async fn unsubscribe(&self, id: Uuid, topic: &str) -> Result<()> {
        let session = self.active(id)?;
        let name = TopicName::resolve(topic, &session.principal)?;
        session.subscriptions.remove(name.as_str());
        session
            .guard(self.hub.unsubscribe(session.session_ref(), &name))
            .await
    }

    /// Queue a publish. Returns the client sequence the acknowledgement will
    /// carry; the assigned topic sequence arrives as [`ServerMessage::Ack`].
    pub async fn publish(&self, id: Uuid, topic: &str, payload: Bytes) -> Result<u64> {
        let session = self.active(id)?;
        let name = TopicName::resolve(topic, &session.principal)?;
        if !session.is_subscribed(name.as_str()) {
            return Err(Error::PermissionDenied(format!("not subscribed to {}", name)));
        }
        let client_seq = session.client_seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.hub.publish(
            session.session_ref(),
            session.sink.clone(),
            &name,
            client_seq,
            payload,
        )?;
        Ok(client_seq)
    }

    /// Delete the persisted subscription
    pub async fn leave(&self, id: Uuid, topic: &str) -> Result<()> {
        let session = self.active(id)?;
        let name = TopicName::resolve(topic, &session.principal)?;
        session
            .guard(self.hub.leave(session.session_ref(), &name))
            .await?;
        session.subscriptions.remove(name.as_str());
        Ok(())
    }

    pub async fn mark_read(&self, id: Uuid, topic: &str, seq: u64) -> Result<()> {
        let session = self.active(id)?;
        let name = TopicName::resolve(topic, &session.principal)?;
        session
            .guard(self.hub.mark_read(session.session_ref(), &name, seq))
            .await
    }

    /// Messages with `seq > since`, ascending
    pub async fn history(&self, id: Uuid, topic: &str, since: u64, limit: u32) -> Result<Vec<Envelope>> {
        let session = self.active(id)?;
        let name = TopicName::resolve(topic, &session.principal)?;
        session
            .guard(self.hub.history(session.session_ref(), &name, since, limit))
            .await
    }

    /// Change another principal's access mode; owner only
    pub async fn set_access(&self, id: Uuid, topic: &str, target: &str, mode: AccessMode) -> Result<()> {
        let session = self.active(id)?;
        let name = TopicName::resolve(topic, &session.principal)?;
        session
            .guard(self.hub.set_access(session.session_ref(), &name, target, mode))
            .await
    }

    /// Client disconnected
    pub fn disconnect(&self, id: Uuid) {
        self.close(id, CloseReason::Disconnect);
    }

    /// Tear a session down: detach from every topic and send `Closed`
    pub fn close(&self, id: Uuid, reason: CloseReason) {
        let Some((_, session)) = self.sessions.remove(&id) else {
            return;
        };
        session.sink.close(reason);

        let topics = session.subscriptions();
        session.subscriptions.clear();
        self.hub.session_gone(id, &topics);

        let _ = session.sink.tx.try_send(ServerMessage::Closed { reason });
        SessionMetrics::increment_closed(reason.as_str());
        SessionMetrics::set_active(self.sessions.len());
        info!(
            session = %id,
            principal = %session.principal,
            reason = reason.as_str(),
            topics = topics.len(),
            "Session closed"
        );
    }

    fn idle_limit(&self, transport: TransportKind) -> Duration {
        let timeouts = self.ctx.timeouts();
        match transport {
            TransportKind::LongPoll => timeouts.session_idle + timeouts.long_poll_grace,
            _ => timeouts.session_idle,
        }
    }

    /// Close every idle session; returns how many were closed
    pub fn sweep(&self) -> usize {
        let expired: Vec<Uuid> = self
            .sessions
            .iter()
            .filter(|s| s.idle_for() >= self.idle_limit(s.transport))
            .map(|s| s.id)
            .collect();
        for id in &expired {
            self.close(*id, CloseReason::Idle);
        }
        expired.len()
    }

    /// Periodic idle sweep until shutdown
    pub async fn run_sweeper(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = interval(self.ctx.timeouts().sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let closed = self.sweep();
                    if closed > 0 {
                        debug!(closed, "Idle sessions swept");
                    }
                }
            }
        }
    }

    pub fn close_all(&self, reason: CloseReason) {
        let ids: Vec<Uuid> = self.sessions.iter().map(|s| s.id).collect();
        for id in ids {
            self.close(id, reason);
        }
    }
}

/// Close the session once its token fires, whoever fired it
async fn watch_session(store: Weak<SessionStore>, id: Uuid, closer: CancellationToken) {
    closer.cancelled().await;
    if let Some(store) = store.upgrade() {
        if let Some(session) = store.get(id) {
            let reason = session.sink.reason();
            store.close(id, reason);
        }
    }
}
