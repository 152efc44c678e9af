//! Event fan-out for a running deployment
//!
//! Every progress message passes through one sink per deployment, which
//! chunks it into size-bounded frames, assigns each frame a monotonic
//! sequence number, persists it to the log store and then broadcasts it
//! to attached observers. Persist-then-broadcast means a late joiner that
//! replays the store and then tails the channel can dedupe by sequence
//! number and never observe a gap.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::warn;

use crate::models::deployment::LogEntry;
use crate::models::message::StreamMessage;
use crate::storage::LogStore;

/// Broadcast capacity per deployment; a lagging observer skips ahead.
const CHANNEL_CAPACITY: usize = 1024;

pub struct EventSink {
    deployment_id: String,
    logs: Arc<dyn LogStore>,
    events: broadcast::Sender<LogEntry>,
    next_seq: AtomicU64,
    max_message_bytes: usize,
}

impl EventSink {
    /// Create a sink for one deployment.
    ///
    /// `next_seq` continues the numbering of any entries already persisted
    /// for this deployment, so retries extend the transcript rather than
    /// restarting it.
    pub fn new(
        deployment_id: impl Into<String>,
        logs: Arc<dyn LogStore>,
        max_message_bytes: usize,
        next_seq: u64,
    ) -> Self {
        let (events, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            deployment_id: deployment_id.into(),
            logs,
            events,
            next_seq: AtomicU64::new(next_seq),
            max_message_bytes,
        }
    }

    /// Chunk, persist and broadcast one message.
    ///
    /// A log-store failure is reported but does not interrupt the
    /// deployment; observers still receive the live frame.
    pub async fn emit(&self, message: StreamMessage) {
        for frame in message.into_frames(self.max_message_bytes) {
            let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
            let entry = LogEntry::new(self.deployment_id.clone(), seq, frame);
            if let Err(e) = self.logs.append(entry.clone()).await {
                warn!(
                    deployment_id = %self.deployment_id,
                    seq,
                    "Failed to persist log entry: {}", e
                );
            }
            let _ = self.events.send(entry);
        }
    }

    /// Attach a live observer
    pub fn subscribe(&self) -> broadcast::Receiver<LogEntry> {
        self.events.subscribe()
    }
}
