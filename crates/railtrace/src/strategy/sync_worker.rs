//! Background sync worker.
//!
//! Runs on its own store connection, independent of the sampling context.
//! Syncs happen when one is registered through a [`SyncWorkerHandle`] or
//! when the periodic timer fires. Registrations made while one is already
//! pending collapse into it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::queue::SyncTrigger;
use crate::reporter::StatusReporter;
use crate::sink::Sink;
use crate::storage::RecordStore;
use crate::sync::{SyncEngine, SyncReason};

/// Cloneable handle for registering syncs with a running worker.
#[derive(Debug, Clone)]
pub struct SyncWorkerHandle {
    tx: mpsc::Sender<SyncReason>,
}

impl SyncWorkerHandle {
    /// Register a one-off sync. Returns `false` if one is already pending
    /// or the worker is gone.
    pub fn register(&self, reason: SyncReason) -> bool {
        match self.tx.try_send(reason) {
            Ok(()) => {
                debug!(%reason, "Sync registered with worker");
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(%reason, "Sync already registered");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!(%reason, "Sync worker is not running");
                false
            }
        }
    }
}

impl SyncTrigger for SyncWorkerHandle {
    fn request_sync(&self, reason: SyncReason) -> bool {
        self.register(reason)
    }
}

/// A running background sync worker.
#[derive(Debug)]
pub struct SyncWorker {
    handle: SyncWorkerHandle,
    engine: SyncEngine,
    task: JoinHandle<()>,
}

impl SyncWorker {
    /// Start a worker with its own connection to `store`'s database.
    ///
    /// # Errors
    ///
    /// Returns an error if the second connection cannot be opened.
    pub fn spawn(
        store: &RecordStore,
        sink: Arc<dyn Sink>,
        reporter: StatusReporter,
        max_batch_size: usize,
        periodic_interval: Duration,
    ) -> Result<Self> {
        let own_store = Arc::new(store.reopen()?);
        let engine = SyncEngine::new(own_store, sink, reporter, max_batch_size);
        let (tx, rx) = mpsc::channel(1);

        info!(
            periodic_secs = periodic_interval.as_secs(),
            "Starting background sync worker"
        );
        let task = tokio::spawn(run(engine.clone(), rx, periodic_interval));
        Ok(Self {
            handle: SyncWorkerHandle { tx },
            engine,
            task,
        })
    }

    /// A handle for registering syncs.
    #[must_use]
    pub fn handle(&self) -> SyncWorkerHandle {
        self.handle.clone()
    }

    /// Stop the worker. An attempt in progress is abandoned; its records
    /// stay undelivered and its sync lease is released.
    pub fn shutdown(self) {
        self.task.abort();
        self.engine.release_lease();
        debug!("Background sync worker stopped");
    }
}

async fn run(engine: SyncEngine, mut rx: mpsc::Receiver<SyncReason>, periodic: Duration) {
    let mut ticker = interval_at(Instant::now() + periodic, periodic);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let reason = tokio::select! {
            registered = rx.recv() => match registered {
                Some(reason) => reason,
                None => break,
            },
            _ = ticker.tick() => SyncReason::Periodic,
        };
        let outcome = engine.sync_once(reason).await;
        debug!(%reason, ?outcome, "Worker sync finished");
    }
    debug!("Sync worker channel closed");
}
