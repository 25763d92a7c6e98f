//! Persistence interface
//!
//! The store is the only durable source of truth. Its conditional append is
//! the arbiter when two nodes briefly both believe they own a topic: the
//! append succeeds only if the caller's `expected_seq` is exactly one past
//! the stored sequence.

mod memory;

pub use memory::MemoryStore;

use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::topic::{AccessMode, TopicKind};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;
use tidings_cluster::Envelope;
use uuid::Uuid;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    /// Another writer advanced the topic; the caller's view is stale
    #[error("sequence conflict on {topic}: expected {expected}, stored {stored}")]
    SequenceConflict {
        topic: String,
        expected: u64,
        stored: u64,
    },

    #[error("no such topic: {0}")]
    TopicNotFound(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_retriable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Persisted topic metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicRecord {
    pub name: String,
    pub kind: TopicKind,
    /// Principal with full control
    pub owner: Option<String>,
    /// Highest committed sequence
    pub last_seq: u64,
    pub created_ms: u64,
    pub touched_ms: u64,
}

impl TopicRecord {
    pub fn new(name: impl Into<String>, kind: TopicKind, owner: Option<String>) -> Self {
        let now = tidings_cluster::protocol::now_millis();
        Self {
            name: name.into(),
            kind,
            owner,
            last_seq: 0,
            created_ms: now,
            touched_ms: now,
        }
    }
}

/// Persisted (principal, topic) subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRecord {
    pub topic: String,
    pub principal: String,
    pub mode: AccessMode,
    /// Highest sequence the principal has read
    pub read_seq: u64,
}

/// Conditional, idempotent message append
#[derive(Debug, Clone)]
pub struct AppendRequest {
    pub topic: String,
    /// Sequence the new message will carry; must equal stored + 1
    pub expected_seq: u64,
    pub sender: String,
    pub session_id: Uuid,
    pub client_seq: u64,
    pub timestamp_ms: u64,
    pub payload: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended(u64),
    /// The (session, client_seq) pair was already stored under this sequence
    Duplicate(u64),
}

impl AppendOutcome {
    pub fn seq(self) -> u64 {
        match self {
            AppendOutcome::Appended(seq) | AppendOutcome::Duplicate(seq) => seq,
        }
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Adapter name as used in configuration
    fn name(&self) -> &'static str;

    async fn load_topic(&self, topic: &str) -> StoreResult<Option<TopicRecord>>;

    /// Create a topic; returns the existing record if it is already there
    async fn create_topic(&self, record: TopicRecord) -> StoreResult<TopicRecord>;

    /// Flush topic metadata. Never moves `last_seq` backwards.
    async fn save_topic(&self, record: &TopicRecord) -> StoreResult<()>;

    async fn append(&self, request: AppendRequest) -> StoreResult<AppendOutcome>;

    /// Messages with `seq > since`, ascending, at most `limit`
    async fn history(&self, topic: &str, since: u64, limit: usize) -> StoreResult<Vec<Envelope>>;

    async fn subscriptions(&self, topic: &str) -> StoreResult<Vec<SubscriptionRecord>>;

    async fn upsert_subscription(&self, record: &SubscriptionRecord) -> StoreResult<()>;

    /// Returns whether a record was removed
    async fn delete_subscription(&self, topic: &str, principal: &str) -> StoreResult<bool>;
}

/// Build the configured adapter
pub fn open(config: &StoreConfig) -> Result<Arc<dyn Store>> {
    match config.adapter.as_str() {
        "memory" => Ok(Arc::new(MemoryStore::from_config(&config.config)?)),
        other => Err(Error::Config(format!("unknown store adapter '{}'", other))),
    }
}
