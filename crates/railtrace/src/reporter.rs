//! Recording state and sync result broadcasting.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::{Error, ErrorKind};
use crate::record::RecordId;
use crate::strategy::ExecutionStrategy;

/// Buffered events per subscriber before the oldest are dropped.
const CHANNEL_CAPACITY: usize = 64;

/// Something subscribers may want to know about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StatusEvent {
    /// Recording started.
    Started {
        /// Sampling interval in milliseconds.
        interval_ms: u64,
        /// Strategy running the session.
        strategy: ExecutionStrategy,
    },
    /// Recording stopped.
    Stopped,
    /// A sample was persisted.
    PointRecorded {
        /// Store key of the record.
        id: RecordId,
        /// Undelivered records after the append.
        pending: i64,
    },
    /// A sync attempt finished.
    SyncResult {
        /// Records submitted in the batch.
        submitted: usize,
        /// Records the sink acknowledged.
        delivered: usize,
        /// Failure message, if the attempt failed.
        error: Option<String>,
    },
    /// A component failed.
    Error {
        /// Failure category.
        kind: ErrorKind,
        /// Human-readable detail.
        message: String,
    },
}

impl StatusEvent {
    /// Whether this event should reach the user.
    #[must_use]
    pub fn is_user_visible(&self) -> bool {
        self.notification().is_some()
    }

    /// Notification text for user-visible events.
    #[must_use]
    pub fn notification(&self) -> Option<String> {
        match self {
            Self::Started { interval_ms, .. } => Some(format!(
                "Background recording started (every {}s)",
                interval_ms / 1000
            )),
            Self::Stopped => Some("Background recording stopped".to_string()),
            Self::SyncResult {
                error: Some(error), ..
            } => Some(format!("Sync failed: {error}")),
            Self::SyncResult { delivered, .. } if *delivered > 0 => {
                Some(format!("{delivered} points synced"))
            }
            Self::SyncResult { .. } | Self::PointRecorded { .. } | Self::Error { .. } => None,
        }
    }
}

/// Fan-out of [`StatusEvent`]s. Clones share the channel.
///
/// Publishing never blocks; a lagging subscriber loses the oldest events.
#[derive(Debug, Clone)]
pub struct StatusReporter {
    tx: broadcast::Sender<StatusEvent>,
}

impl StatusReporter {
    /// Create a reporter with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Subscribe to future events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.tx.subscribe()
    }

    /// Publish an event.
    pub fn publish(&self, event: StatusEvent) {
        debug!(?event, "Status event");
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    /// Log an error and publish it if it has a runtime category.
    pub fn report_error(&self, error: &Error) {
        warn!(error = %error, "Component failure");
        if let Some(kind) = error.kind() {
            self.publish(StatusEvent::Error {
                kind,
                message: error.to_string(),
            });
        }
    }
}

impl Default for StatusReporter {
    fn default() -> Self {
        Self::new()
    }
}
