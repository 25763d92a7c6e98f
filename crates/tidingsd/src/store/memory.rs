//! In-memory store adapter

use super::{
    AppendOutcome, AppendRequest, Store, StoreError, StoreResult, SubscriptionRecord, TopicRecord,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tidings_cluster::Envelope;
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct MemoryStoreConfig {
    /// Idempotency keys remembered per topic
    dedupe_window: usize,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self {
            dedupe_window: 4096,
        }
    }
}

struct TopicLog {
    record: TopicRecord,
    messages: Vec<Envelope>,
    dedupe: HashMap<(Uuid, u64), u64>,
    dedupe_order: VecDeque<(Uuid, u64)>,
}

/// Process-local store. Shared between in-process nodes it behaves like a
/// single external database.
pub struct MemoryStore {
    topics: DashMap<String, Arc<Mutex<TopicLog>>>,
    subscriptions: DashMap<String, BTreeMap<String, SubscriptionRecord>>,
    dedupe_window: usize,
    unavailable: AtomicBool,
    failing_appends: AtomicUsize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_window(MemoryStoreConfig::default().dedupe_window)
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(value: &serde_json::Value) -> Result<Self> {
        let config: MemoryStoreConfig = if value.is_null() {
            MemoryStoreConfig::default()
        } else {
            serde_json::from_value(value.clone())
                .map_err(|e| Error::Config(format!("memory store: {}", e)))?
        };
        if config.dedupe_window == 0 {
            return Err(Error::Config("memory store: dedupe_window must be positive".into()));
        }
        Ok(Self::with_window(config.dedupe_window))
    }

    fn with_window(dedupe_window: usize) -> Self {
        Self {
            topics: DashMap::new(),
            subscriptions: DashMap::new(),
            dedupe_window,
            unavailable: AtomicBool::new(false),
            failing_appends: AtomicUsize::new(0),
        }
    }

    /// Make every call fail with `Unavailable`
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fail the next `n` appends with `Unavailable`
    pub fn fail_next_appends(&self, n: usize) {
        self.failing_appends.store(n, Ordering::SeqCst);
    }

    /// Stored messages of a topic, for inspection
    pub fn messages(&self, topic: &str) -> Vec<Envelope> {
        self.topics
            .get(topic)
            .map(|t| t.lock().messages.clone())
            .unwrap_or_default()
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".into()));
        }
        Ok(())
    }

    fn log(&self, topic: &str) -> StoreResult<Arc<Mutex<TopicLog>>> {
        self.topics
            .get(topic)
            .map(|t| t.value().clone())
            .ok_or_else(|| StoreError::TopicNotFound(topic.to_string()))
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn load_topic(&self, topic: &str) -> StoreResult<Option<TopicRecord>> {
        self.check_available()?;
        Ok(self.topics.get(topic).map(|t| t.lock().record.clone()))
    }

    async fn create_topic(&self, record: TopicRecord) -> StoreResult<TopicRecord> {
        self.check_available()?;
        let log = self
            .topics
            .entry(record.name.clone())
            .or_insert_with(|| {
                Arc::new(Mutex::new(TopicLog {
                    record,
                    messages: Vec::new(),
                    dedupe: HashMap::new(),
                    dedupe_order: VecDeque::new(),
                }))
            })
            .clone();
        let record = log.lock().record.clone();
        Ok(record)
    }

    async fn save_topic(&self, record: &TopicRecord) -> StoreResult<()> {
        self.check_available()?;
        let log = self.log(&record.name)?;
        let mut log = log.lock();
        let last_seq = log.record.last_seq.max(record.last_seq);
        log.record = TopicRecord {
            last_seq,
            ..record.clone()
        };
        Ok(())
    }

    async fn append(&self, request: AppendRequest) -> StoreResult<AppendOutcome> {
        self.check_available()?;
        let failing = self.failing_appends.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_appends.store(failing - 1, Ordering::SeqCst);
            return Err(StoreError::Unavailable("injected append failure".into()));
        }

        let log = self.log(&request.topic)?;
        let mut log = log.lock();

        let key = (request.session_id, request.client_seq);
        if let Some(seq) = log.dedupe.get(&key) {
            return Ok(AppendOutcome::Duplicate(*seq));
        }

        let stored = log.record.last_seq;
        if request.expected_seq != stored + 1 {
            return Err(StoreError::SequenceConflict {
                topic: request.topic,
                expected: request.expected_seq,
                stored,
            });
        }

        let seq = request.expected_seq;
        log.messages.push(Envelope {
            topic: request.topic,
            sender: request.sender,
            seq,
            timestamp_ms: request.timestamp_ms,
            payload: request.payload,
        });
        log.record.last_seq = seq;
        log.record.touched_ms = request.timestamp_ms;

        log.dedupe.insert(key, seq);
        log.dedupe_order.push_back(key);
        while log.dedupe_order.len() > self.dedupe_window {
            if let Some(old) = log.dedupe_order.pop_front() {
                log.dedupe.remove(&old);
            }
        }

        Ok(AppendOutcome::Appended(seq))
    }

    async fn history(&self, topic: &str, since: u64, limit: usize) -> StoreResult<Vec<Envelope>> {
        self.check_available()?;
        let log = self.log(topic)?;
        let log = log.lock();
        // Sequences are dense from 1, so seq n sits at index n - 1
        let start = (since as usize).min(log.messages.len());
        Ok(log.messages[start..].iter().take(limit).cloned().collect())
    }

    async fn subscriptions(&self, topic: &str) -> StoreResult<Vec<SubscriptionRecord>> {
        self.check_available()?;
        Ok(self
            .subscriptions
            .get(topic)
            .map(|subs| subs.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn upsert_subscription(&self, record: &SubscriptionRecord) -> StoreResult<()> {
        self.check_available()?;
        self.subscriptions
            .entry(record.topic.clone())
            .or_default()
            .insert(record.principal.clone(), record.clone());
        Ok(())
    }

    async fn delete_subscription(&self, topic: &str, principal: &str) -> StoreResult<bool> {
        self.check_available()?;
        Ok(self
            .subscriptions
            .get_mut(topic)
            .map(|mut subs| subs.remove(principal).is_some())
            .unwrap_or(false))
    }
}
