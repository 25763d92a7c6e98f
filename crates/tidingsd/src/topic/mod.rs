//! Topic actors
//!
//! Every loaded topic is a single task owning all of the topic's state and
//! draining a bounded mailbox. The task is either the topic's **master**
//! (on the owning node: assigns sequences, persists, fans out) or a
//! **proxy** (on any other node with local subscribers: forwards upstream,
//! relays downstream).

mod access;
mod master;
mod name;
mod proxy;

pub use access::AccessMode;
pub use name::{TopicKind, TopicName};

pub(crate) use master::MasterTopic;
pub(crate) use proxy::ProxyTopic;

use crate::error::{Error, Result};
use crate::metrics::TopicMetrics;
use crate::session::{ServerMessage, SessionSink};
use std::fmt;
use std::time::Duration;
use tidings_cluster::{Delivery, NodeId, ProxyOp, ProxyResult, SessionRef};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use uuid::Uuid;

/// Largest history page
pub const MAX_HISTORY_PAGE: u32 = 1000;

/// Page size used when a history request asks for zero messages
pub const DEFAULT_HISTORY_PAGE: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicRole {
    Master,
    Proxy,
}

impl fmt::Display for TopicRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TopicRole::Master => "master",
            TopicRole::Proxy => "proxy",
        })
    }
}

/// Lifecycle of a loaded actor. An unloaded topic has no actor at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicState {
    Loading,
    Live,
    /// No subscribers; unloads when the idle deadline passes
    Draining,
}

/// One session action addressed to a topic
#[derive(Debug, Clone)]
pub struct TopicRequest {
    pub op: ProxyOp,
    pub session: SessionRef,
    pub client_seq: u64,
    /// Outbound queue when the session lives on this node
    pub sink: Option<SessionSink>,
}

pub type Reply = oneshot::Sender<Result<ProxyResult>>;

/// A request together with the way its outcome is reported
pub struct Pending {
    pub request: TopicRequest,
    /// `None` for publishes acknowledged on the session's outbound queue
    pub reply: Option<Reply>,
}

impl Pending {
    /// Report the outcome of the request
    pub fn complete(self, topic: &str, result: Result<ProxyResult>) {
        match self.reply {
            Some(reply) => {
                let _ = reply.send(result);
            }
            None => acknowledge(topic, &self.request, result),
        }
    }
}

/// Publish acknowledgement on the session's outbound queue
fn acknowledge(topic: &str, request: &TopicRequest, result: Result<ProxyResult>) {
    let Some(sink) = &request.sink else {
        return;
    };
    if !matches!(request.op, ProxyOp::Publish { .. }) {
        return;
    }
    let result = match result {
        Ok(ProxyResult::Published { seq, .. }) => Ok(seq),
        Ok(other) => Err(Error::Internal(format!("unexpected publish result {:?}", other)).into()),
        Err(e) => Err(e.into()),
    };
    sink.deliver(ServerMessage::Ack {
        topic: topic.to_string(),
        client_seq: request.client_seq,
        result,
    });
}

pub enum TopicMsg {
    Request(Pending),
    /// Downstream event from the master on `source`
    Deliver { source: NodeId, delivery: Delivery },
    /// The ring changed; re-check ownership
    Rehash,
    PeerDown(NodeId),
    SessionGone(Uuid),
    Stats(oneshot::Sender<TopicStats>),
    Shutdown,
}

/// Snapshot of an actor for introspection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicStats {
    pub role: TopicRole,
    pub state: TopicState,
    pub local_subscribers: usize,
    pub remote_subscribers: usize,
    pub last_seq: u64,
    /// Upstream calls queued or in flight (proxy only)
    pub pending: usize,
}

/// Address of a running actor
#[derive(Clone)]
pub struct TopicHandle {
    pub id: u64,
    pub name: TopicName,
    pub role: TopicRole,
    tx: mpsc::Sender<TopicMsg>,
}

impl TopicHandle {
    pub(crate) fn new(id: u64, name: TopicName, role: TopicRole, tx: mpsc::Sender<TopicMsg>) -> Self {
        Self { id, name, role, tx }
    }

    /// The actor stopped reading its mailbox
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Enqueue without waiting
    pub fn try_send(&self, msg: TopicMsg) -> Result<()> {
        self.tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                TopicMetrics::increment_backpressure();
                Error::Backpressure(format!("topic {} busy", self.name))
            }
            mpsc::error::TrySendError::Closed(_) => {
                Error::OwnershipTransient(format!("topic {} unloading", self.name))
            }
        })
    }

    /// Enqueue, waiting for mailbox space
    pub async fn send(&self, msg: TopicMsg) -> Result<()> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| Error::OwnershipTransient(format!("topic {} unloading", self.name)))
    }

    /// Enqueue a request and wait for its outcome
    pub async fn request(&self, request: TopicRequest) -> Result<ProxyResult> {
        let (tx, rx) = oneshot::channel();
        self.try_send(TopicMsg::Request(Pending {
            request,
            reply: Some(tx),
        }))?;
        rx.await
            .map_err(|_| Error::OwnershipTransient(format!("topic {} unloading", self.name)))?
    }

    /// Enqueue a control message; a full mailbox defers it to a task
    pub(crate) fn post(&self, msg: TopicMsg) {
        if let Err(mpsc::error::TrySendError::Full(msg)) = self.tx.try_send(msg) {
            let tx = self.tx.clone();
            tokio::spawn(async move {
                let _ = tx.send(msg).await;
            });
        }
    }

    /// Hand over a request, failing it if the actor is gone
    pub(crate) async fn forward(&self, pending: Pending) {
        if let Err(mpsc::error::SendError(TopicMsg::Request(pending))) =
            self.tx.send(TopicMsg::Request(pending)).await
        {
            pending.complete(
                self.name.as_str(),
                Err(Error::OwnershipTransient(format!("topic {} unloading", self.name))),
            );
        }
    }

    pub async fn stats(&self) -> Option<TopicStats> {
        let (tx, rx) = oneshot::channel();
        self.send(TopicMsg::Stats(tx)).await.ok()?;
        rx.await.ok()
    }
}

/// Local session attached to an actor
#[derive(Debug, Clone)]
pub(crate) struct Attachment {
    pub session: SessionRef,
    /// `None` for sessions on other nodes
    pub sink: Option<SessionSink>,
}

/// Wait for an optional deadline; never resolves for `None`
pub(crate) async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Normalize a requested history page size
pub(crate) fn page_limit(limit: u32) -> usize {
    match limit {
        0 => DEFAULT_HISTORY_PAGE as usize,
        n => n.min(MAX_HISTORY_PAGE) as usize,
    }
}

/// Capped exponential backoff with jitter
pub(crate) fn backoff(attempt: u32) -> Duration {
    use rand::Rng;

    let base = Duration::from_millis(50)
        .saturating_mul(1 << attempt.saturating_sub(1).min(10))
        .min(Duration::from_secs(1));
    let jitter = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 4);
    base + Duration::from_millis(jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_limit() {
        assert_eq!(page_limit(0), 100);
        assert_eq!(page_limit(10), 10);
        assert_eq!(page_limit(5000), 1000);
    }

    #[test]
    fn test_backoff_is_capped() {
        assert!(backoff(1) >= Duration::from_millis(50));
        assert!(backoff(1) <= Duration::from_millis(62));
        for attempt in 6..40 {
            let delay = backoff(attempt);
            assert!(delay >= Duration::from_secs(1));
            assert!(delay <= Duration::from_millis(1250));
        }
    }
}
