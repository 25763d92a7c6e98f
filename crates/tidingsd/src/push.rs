//! Push notifications for members not attached to a topic
//!
//! Fire-and-forget: a full queue drops the notification and never slows
//! down the publishing topic.

use crate::config::PushConfig;
use crate::error::{Error, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// One new message for offline members
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushPayload {
    pub topic: String,
    pub sender: String,
    pub seq: u64,
    pub timestamp_ms: u64,
    pub recipients: Vec<String>,
}

pub trait PushNotifier: Send + Sync {
    fn name(&self) -> &'static str;

    fn notify(&self, payload: PushPayload);
}

/// Discards notifications
pub struct NoopPush;

impl PushNotifier for NoopPush {
    fn name(&self) -> &'static str {
        "none"
    }

    fn notify(&self, _payload: PushPayload) {}
}

/// Writes notifications to the log from a background worker
pub struct LogPush {
    tx: mpsc::Sender<PushPayload>,
    dropped: AtomicU64,
}

impl LogPush {
    /// Must be called from within a Tokio runtime
    pub fn new(queue: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<PushPayload>(queue.max(1));
        tokio::spawn(async move {
            while let Some(push) = rx.recv().await {
                info!(
                    topic = %push.topic,
                    sender = %push.sender,
                    seq = push.seq,
                    recipients = ?push.recipients,
                    "Push notification"
                );
            }
        });
        Self {
            tx,
            dropped: AtomicU64::new(0),
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl PushNotifier for LogPush {
    fn name(&self) -> &'static str {
        "log"
    }

    fn notify(&self, payload: PushPayload) {
        if self.tx.try_send(payload).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            debug!("Push queue full, notification dropped");
        }
    }
}

/// Build the configured push handler
pub fn open(config: &PushConfig) -> Result<Arc<dyn PushNotifier>> {
    match config.handler.as_str() {
        "none" => Ok(Arc::new(NoopPush)),
        "log" => Ok(Arc::new(LogPush::new(config.queue))),
        other => Err(Error::Config(format!("unknown push handler '{}'", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(seq: u64) -> PushPayload {
        PushPayload {
            topic: "grpX".into(),
            sender: "alice".into(),
            seq,
            timestamp_ms: 0,
            recipients: vec!["bob".into()],
        }
    }

    #[tokio::test]
    async fn test_open_handlers() {
        assert_eq!(open(&PushConfig::default()).unwrap().name(), "none");
        let log = open(&PushConfig {
            handler: "log".into(),
            queue: 4,
        })
        .unwrap();
        assert_eq!(log.name(), "log");
        log.notify(payload(1));

        assert!(open(&PushConfig {
            handler: "fcm".into(),
            queue: 4,
        })
        .is_err());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_full_queue_drops() {
        let push = LogPush::new(1);
        // The worker has not run yet on a current-thread runtime
        push.notify(payload(1));
        push.notify(payload(2));
        push.notify(payload(3));
        assert_eq!(push.dropped(), 2);
    }
}
