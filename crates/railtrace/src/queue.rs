//! Bridge from sampler output to the record store.
//!
//! The queue itself is a view over the store (`pending` is the undelivered
//! count). The manager adds two things on top: a bounded in-memory retry
//! buffer for records the store could not take, and the sync threshold.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::record::{RecordId, TelemetryRecord};
use crate::storage::RecordStore;
use crate::sync::{SyncEngine, SyncReason};

/// Something that can be asked to start a sync.
///
/// Implementations must not block and must not queue a second attempt
/// while one is running.
pub trait SyncTrigger: Send + Sync + std::fmt::Debug {
    /// Request a sync. Returns whether an attempt was started or registered.
    fn request_sync(&self, reason: SyncReason) -> bool;
}

impl SyncTrigger for SyncEngine {
    fn request_sync(&self, reason: SyncReason) -> bool {
        self.trigger(reason)
    }
}

/// What to drop when the retry buffer is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Drop the oldest buffered record.
    #[default]
    DropOldest,
    /// Drop the incoming record.
    DropNewest,
}

/// Queue bounds and thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSettings {
    /// Maximum records kept in the store.
    pub max_records: usize,
    /// Size of the recent view and of the retry buffer.
    pub max_queue_size: usize,
    /// Pending count that triggers a sync.
    pub sync_threshold: usize,
    /// Retry buffer overflow behaviour.
    pub overflow_policy: OverflowPolicy,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_records: 10_000,
            max_queue_size: 100,
            sync_threshold: 10,
            overflow_policy: OverflowPolicy::DropOldest,
        }
    }
}

/// A record accepted into the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Accepted {
    /// Store key of the record.
    pub id: RecordId,
    /// Undelivered records after the append.
    pub pending: i64,
    /// Whether this append started a sync.
    pub sync_requested: bool,
}

/// Feeds records into the store and requests syncs.
#[derive(Debug)]
pub struct QueueManager {
    store: Arc<RecordStore>,
    trigger: Arc<dyn SyncTrigger>,
    settings: QueueSettings,
    retry: Mutex<VecDeque<TelemetryRecord>>,
}

impl QueueManager {
    /// Create a manager over `store`.
    #[must_use]
    pub fn new(
        store: Arc<RecordStore>,
        trigger: Arc<dyn SyncTrigger>,
        settings: QueueSettings,
    ) -> Self {
        Self {
            store,
            trigger,
            settings,
            retry: Mutex::new(VecDeque::new()),
        }
    }

    /// The configured bounds.
    #[must_use]
    pub const fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    fn retry(&self) -> MutexGuard<'_, VecDeque<TelemetryRecord>> {
        self.retry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Persist `record`, after first retrying anything buffered.
    ///
    /// Records reach the store in the order they were accepted. If the store
    /// fails transiently, the record stays in the retry buffer and the
    /// error is returned; the next call retries it.
    ///
    /// # Errors
    ///
    /// Returns the storage error that prevented the append.
    pub fn accept(&self, record: TelemetryRecord) -> Result<Accepted> {
        let mut retry = self.retry();

        while let Some(buffered) = retry.front() {
            match self.store_one(buffered) {
                Ok(id) => {
                    debug!(%id, "Flushed buffered record");
                    retry.pop_front();
                }
                Err(e) => {
                    Self::buffer(&mut retry, record, self.settings);
                    return Err(e);
                }
            }
        }

        let id = match self.store_one(&record) {
            Ok(id) => id,
            Err(e) => {
                if e.is_transient() {
                    Self::buffer(&mut retry, record, self.settings);
                }
                return Err(e);
            }
        };
        drop(retry);

        if let Err(e) = self.store.evict_oldest(self.settings.max_records) {
            warn!(error = %e, "Failed to bound record store");
        }

        let pending = self.pending()?;
        let sync_requested = usize::try_from(pending).unwrap_or(usize::MAX)
            >= self.settings.sync_threshold
            && self.trigger.request_sync(SyncReason::Threshold);

        Ok(Accepted {
            id,
            pending,
            sync_requested,
        })
    }

    fn store_one(&self, record: &TelemetryRecord) -> Result<RecordId> {
        match self.store.append(record) {
            Err(e) if e.is_storage_exhausted() => {
                let total = usize::try_from(self.store.count()?).unwrap_or(usize::MAX);
                let target = self.settings.max_records.min(total.saturating_sub(1));
                warn!(target, "Storage exhausted, evicting and retrying once");
                self.store.evict_oldest(target)?;
                self.store.append(record)
            }
            other => other,
        }
    }

    fn buffer(
        retry: &mut VecDeque<TelemetryRecord>,
        record: TelemetryRecord,
        settings: QueueSettings,
    ) {
        if retry.len() >= settings.max_queue_size {
            match settings.overflow_policy {
                OverflowPolicy::DropOldest => {
                    if let Some(dropped) = retry.pop_front() {
                        warn!(sample_id = dropped.sample_id, "Retry buffer full, dropped oldest record");
                    }
                }
                OverflowPolicy::DropNewest => {
                    warn!(sample_id = record.sample_id, "Retry buffer full, dropped newest record");
                    return;
                }
            }
        }
        retry.push_back(record);
        debug!(buffered = retry.len(), "Record held for retry");
    }

    /// Records waiting in the retry buffer.
    #[must_use]
    pub fn retry_len(&self) -> usize {
        self.retry().len()
    }

    /// Undelivered records in the store.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn pending(&self) -> Result<i64> {
        self.store.count_undelivered()
    }

    /// The newest `max_queue_size` undelivered records, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn recent(&self) -> Result<Vec<TelemetryRecord>> {
        self.store.recent_undelivered(self.settings.max_queue_size)
    }

    /// Request a sync regardless of the threshold.
    pub fn sync_now(&self, reason: SyncReason) -> bool {
        let started = self.trigger.request_sync(reason);
        if started {
            info!(%reason, "Sync requested");
        }
        started
    }
}
