//! Batch delivery of undelivered records.
//!
//! The [`SyncEngine`] is single-flight: at most one attempt runs at a time,
//! and a call made while one is running returns [`SyncOutcome::InFlight`]
//! instead of queuing. Engines in one process share a guard; engines on
//! other connections to the same database are excluded by a lease stored
//! next to the records. Failed attempts leave every record undelivered;
//! retrying is left to the next trigger.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::record::{RecordId, TelemetryRecord};
use crate::reporter::{StatusEvent, StatusReporter};
use crate::sink::{Sink, SinkAck, SinkRow};
use crate::storage::RecordStore;

/// Why a sync was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncReason {
    /// The pending count crossed the threshold.
    Threshold,
    /// The periodic timer fired.
    Periodic,
    /// The host came back to the foreground.
    Foreground,
    /// Network connectivity came back.
    ConnectivityRestored,
    /// Final sync after an explicit stop.
    Stop,
    /// Requested by the user.
    Manual,
}

impl std::fmt::Display for SyncReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Threshold => write!(f, "threshold"),
            Self::Periodic => write!(f, "periodic"),
            Self::Foreground => write!(f, "foreground"),
            Self::ConnectivityRestored => write!(f, "connectivity_restored"),
            Self::Stop => write!(f, "stop"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

/// Result of one sync call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SyncOutcome {
    /// Another attempt was already running; nothing was done.
    InFlight,
    /// Nothing to deliver.
    Empty,
    /// The sink accepted the batch (possibly only part of it).
    Delivered {
        /// Records submitted.
        submitted: usize,
        /// Records marked delivered.
        delivered: usize,
    },
    /// The attempt failed; all records remain undelivered.
    Failed {
        /// Records submitted (0 if the store could not be read).
        submitted: usize,
        /// Failure message.
        error: String,
    },
}

impl SyncOutcome {
    /// Number of records marked delivered by this call.
    #[must_use]
    pub const fn delivered(&self) -> usize {
        match self {
            Self::Delivered { delivered, .. } => *delivered,
            _ => 0,
        }
    }
}

/// One in-flight batch and the subset the sink acknowledged.
#[derive(Debug, Clone)]
pub struct SyncBatch {
    records: Vec<TelemetryRecord>,
    acknowledged: HashSet<RecordId>,
}

impl SyncBatch {
    /// Wrap undelivered records read from the store.
    #[must_use]
    pub fn new(records: Vec<TelemetryRecord>) -> Self {
        Self {
            records,
            acknowledged: HashSet::new(),
        }
    }

    /// Whether the batch has no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of records in the batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Rows to submit, in batch order.
    #[must_use]
    pub fn rows(&self) -> Vec<SinkRow> {
        self.records.iter().filter_map(SinkRow::from_record).collect()
    }

    /// Record the sink's acknowledgement. Ids outside the batch are ignored.
    pub fn reconcile(&mut self, ack: &SinkAck) {
        self.acknowledged = self
            .records
            .iter()
            .filter_map(|r| r.id)
            .filter(|id| ack.contains(*id))
            .collect();
    }

    /// Acknowledged ids, in batch order.
    #[must_use]
    pub fn acknowledged(&self) -> Vec<RecordId> {
        self.records
            .iter()
            .filter_map(|r| r.id)
            .filter(|id| self.acknowledged.contains(id))
            .collect()
    }
}

/// How long a sync lease stays valid if its holder never releases it.
///
/// Outlasts any sink request; configuration keeps the request timeout below it.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(300);

/// Single-flight sync of undelivered records to a sink.
///
/// Cheap to clone; clones share the in-flight guard and the lease holder.
#[derive(Debug, Clone)]
pub struct SyncEngine {
    store: Arc<RecordStore>,
    sink: Arc<dyn Sink>,
    reporter: StatusReporter,
    max_batch_size: usize,
    guard: Arc<Mutex<()>>,
    lease_holder: Arc<str>,
}

impl SyncEngine {
    /// Create an engine reading from `store` and delivering to `sink`.
    #[must_use]
    pub fn new(
        store: Arc<RecordStore>,
        sink: Arc<dyn Sink>,
        reporter: StatusReporter,
        max_batch_size: usize,
    ) -> Self {
        Self {
            store,
            sink,
            reporter,
            max_batch_size,
            guard: Arc::new(Mutex::new(())),
            lease_holder: format!("{}-{:016x}", std::process::id(), rand::random::<u64>()).into(),
        }
    }
    /// Whether an attempt is running.
    #[must_use]
    pub fn is_in_flight(&self) -> bool {
        self.guard.try_lock().is_err()
    }

    /// The sink this engine delivers to.
    #[must_use]
    pub fn sink(&self) -> &Arc<dyn Sink> {
        &self.sink
    }

    /// Run one attempt now, or return `InFlight` if one is running.
    pub async fn sync_once(&self, reason: SyncReason) -> SyncOutcome {
        let Ok(_guard) = self.guard.try_lock() else {
            debug!(%reason, "Sync already in flight");
            return SyncOutcome::InFlight;
        };
        self.attempt(reason).await
    }

    /// Spawn an attempt if none is running. Returns whether one was spawned.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn trigger(&self, reason: SyncReason) -> bool {
        let Ok(guard) = Arc::clone(&self.guard).try_lock_owned() else {
            debug!(%reason, "Sync already in flight, trigger ignored");
            return false;
        };
        let engine = self.clone();
        tokio::spawn(async move {
            let _guard = guard;
            engine.attempt(reason).await;
        });
        true
    }

    async fn attempt(&self, reason: SyncReason) -> SyncOutcome {
        match self
            .store
            .try_acquire_sync_lease(&self.lease_holder, DEFAULT_LEASE_TTL)
        {
            Ok(true) => {}
            Ok(false) => {
                debug!(%reason, "Sync running on another connection");
                return SyncOutcome::InFlight;
            }
            Err(e) => {
                self.reporter.report_error(&e);
                return SyncOutcome::Failed {
                    submitted: 0,
                    error: e.to_string(),
                };
            }
        }

        let outcome = self.deliver(reason).await;
        self.release_lease();
        outcome
    }

    /// Give up the sync lease if this engine holds it.
    ///
    /// Call after abandoning an attempt so other connections need not wait
    /// for the lease to expire.
    pub fn release_lease(&self) {
        if let Err(e) = self.store.release_sync_lease(&self.lease_holder) {
            warn!(error = %e, "Failed to release sync lease, it expires on its own");
        }
    }

    async fn deliver(&self, reason: SyncReason) -> SyncOutcome {
        let records = match self.store.list_undelivered_batch(Some(self.max_batch_size)) {
            Ok(records) => records,
            Err(e) => {
                self.reporter.report_error(&e);
                return SyncOutcome::Failed {
                    submitted: 0,
                    error: e.to_string(),
                };
            }
        };

        let mut batch = SyncBatch::new(records);
        if batch.is_empty() {
            debug!(%reason, "Nothing to sync");
            return SyncOutcome::Empty;
        }

        let rows = batch.rows();
        let submitted = rows.len();
        info!(%reason, submitted, sink = %self.sink.describe(), "Syncing records");

        let ack = match self.sink.submit(&rows).await {
            Ok(ack) => ack,
            Err(e) => return self.fail(submitted, &e),
        };

        batch.reconcile(&ack);
        let acknowledged = batch.acknowledged();
        let delivered = match self.store.mark_delivered(&acknowledged) {
            Ok(_) => acknowledged.len(),
            Err(e) => return self.fail(submitted, &e),
        };

        if delivered < submitted {
            warn!(
                submitted,
                delivered, "Sink acknowledged only part of the batch"
            );
        } else {
            info!(delivered, "Batch delivered");
        }
        self.reporter.publish(StatusEvent::SyncResult {
            submitted,
            delivered,
            error: None,
        });
        SyncOutcome::Delivered {
            submitted,
            delivered,
        }
    }

    fn fail(&self, submitted: usize, error: &Error) -> SyncOutcome {
        warn!(submitted, error = %error, "Sync failed, records stay undelivered");
        self.reporter.publish(StatusEvent::SyncResult {
            submitted,
            delivered: 0,
            error: Some(error.to_string()),
        });
        SyncOutcome::Failed {
            submitted,
            error: error.to_string(),
        }
    }
}
