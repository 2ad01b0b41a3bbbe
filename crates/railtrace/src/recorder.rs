//! The per-context recorder.
//!
//! A [`Recorder`] owns one store handle, one status reporter, one queue
//! manager and one launched strategy. Construct one per execution context;
//! nothing in this crate is a global singleton.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::feed::PositionFeed;
use crate::queue::QueueManager;
use crate::record::EventFields;
use crate::reporter::{StatusEvent, StatusReporter};
use crate::sampler::{Sampler, SamplerEvent};
use crate::session::RecordingSession;
use crate::sink::{HttpSink, Sink, UnconfiguredSink};
use crate::storage::RecordStore;
use crate::strategy::{
    select_strategy, CapabilityProbe, ExecutionStrategy, RuntimeProbe, StrategyContext,
    StrategyRunner,
};
use crate::sync::{SyncEngine, SyncReason};

/// Sampler events buffered between the sampling context and intake.
const EVENT_BUFFER: usize = 64;

/// Snapshot of recorder state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecorderStatus {
    /// Whether sampling is running.
    pub recording: bool,
    /// Strategy in use.
    pub strategy: ExecutionStrategy,
    /// Sampling interval in milliseconds.
    pub interval_ms: u64,
    /// When the current session started.
    pub started_at: Option<DateTime<Utc>>,
    /// Undelivered records in the store.
    pub pending: i64,
    /// Records waiting in the retry buffer.
    pub buffered: usize,
    /// Records in the store.
    pub total_records: i64,
    /// Sink description.
    pub sink: String,
}

/// Build the sink described by `config`.
///
/// # Errors
///
/// Returns an error if the HTTP client cannot be built.
pub fn sink_from_config(config: &Config) -> Result<Arc<dyn Sink>> {
    Ok(match &config.sync.endpoint {
        Some(endpoint) => Arc::new(HttpSink::new(
            endpoint.clone(),
            config.sync.action.clone(),
            config.sync_timeout(),
        )?),
        None => {
            warn!("No sync endpoint configured, records will stay local");
            Arc::new(UnconfiguredSink)
        }
    })
}

/// Records, persists and syncs telemetry for one execution context.
#[derive(Debug)]
pub struct Recorder {
    store: Arc<RecordStore>,
    reporter: StatusReporter,
    queue: Arc<QueueManager>,
    sink: Arc<dyn Sink>,
    runner: Option<StrategyRunner>,
    session: Option<RecordingSession>,
    default_interval: Duration,
    intake: JoinHandle<()>,
    host_loop: JoinHandle<()>,
}

impl Recorder {
    /// Open the configured store and build a recorder with the HTTP sink and
    /// runtime capability probe.
    ///
    /// Must be called inside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be opened or the sink built.
    pub fn from_config(config: &Config, feed: PositionFeed) -> Result<Self> {
        let store = Arc::new(RecordStore::open_with_busy_timeout(
            config.database_path(),
            config.busy_timeout(),
        )?);
        let sink = sink_from_config(config)?;
        let probe = RuntimeProbe::new(Arc::clone(&store), config.probe_settings());
        Ok(Self::new(config, store, sink, feed, &probe))
    }

    /// Build a recorder over `store`, selecting a strategy with `probe`.
    ///
    /// Must be called inside a Tokio runtime.
    #[must_use]
    pub fn new(
        config: &Config,
        store: Arc<RecordStore>,
        sink: Arc<dyn Sink>,
        feed: PositionFeed,
        probe: &dyn CapabilityProbe,
    ) -> Self {
        let reporter = StatusReporter::new();
        let engine = SyncEngine::new(
            Arc::clone(&store),
            Arc::clone(&sink),
            reporter.clone(),
            config.sync.max_batch_size,
        );
        let sampler = Sampler::new(feed, config.recording.mode, config.recording.origin);
        let (events, events_rx) = mpsc::channel(EVENT_BUFFER);

        let selection = select_strategy(probe);
        for fallback in &selection.fallbacks {
            reporter.report_error(fallback);
        }

        let ctx = StrategyContext {
            sampler,
            store: Arc::clone(&store),
            sink: Arc::clone(&sink),
            engine,
            reporter: reporter.clone(),
            max_batch_size: config.sync.max_batch_size,
            periodic_sync_interval: config.periodic_sync_interval(),
            events,
        };
        let (runner, launch_error) = StrategyRunner::launch_or_fallback(selection.strategy, ctx);
        if let Some(e) = launch_error {
            reporter.report_error(&e);
        }

        let queue = Arc::new(QueueManager::new(
            Arc::clone(&store),
            runner.sync_trigger(),
            config.queue_settings(),
        ));

        let intake = tokio::spawn(run_intake(
            events_rx,
            Arc::clone(&queue),
            reporter.clone(),
        ));
        let host_loop = tokio::spawn(run_host_loop(
            Arc::clone(&store),
            Arc::clone(&queue),
            config.sync_interval(),
            config.retain_delivered(),
        ));

        info!(strategy = %runner.strategy(), sink = %sink.describe(), "Recorder ready");
        Self {
            store,
            reporter,
            queue,
            sink,
            runner: Some(runner),
            session: None,
            default_interval: config.recording_interval(),
            intake,
            host_loop,
        }
    }

    fn runner(&self) -> Result<&StrategyRunner> {
        self.runner
            .as_ref()
            .ok_or_else(|| Error::internal("recorder has been shut down"))
    }

    fn runner_mut(&mut self) -> Result<&mut StrategyRunner> {
        self.runner
            .as_mut()
            .ok_or_else(|| Error::internal("recorder has been shut down"))
    }

    /// The store this recorder writes to.
    #[must_use]
    pub fn store(&self) -> &Arc<RecordStore> {
        &self.store
    }

    /// The strategy in use.
    ///
    /// # Errors
    ///
    /// Returns an error after shutdown.
    pub fn strategy(&self) -> Result<ExecutionStrategy> {
        Ok(self.runner()?.strategy())
    }

    /// Subscribe to status events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.reporter.subscribe()
    }

    /// Start a new session at `interval` (the configured default if `None`).
    ///
    /// The session is persisted so that a restarted process resumes it.
    /// Returns `false` if already recording.
    ///
    /// # Errors
    ///
    /// Returns an error if the session cannot be persisted or sampling
    /// cannot start.
    pub fn start_recording(&mut self, interval: Option<Duration>) -> Result<bool> {
        if self.runner()?.is_recording() {
            debug!("Recording already active");
            return Ok(false);
        }
        let interval = interval.unwrap_or(self.default_interval);
        self.begin(RecordingSession::started(interval, Utc::now()))?;
        Ok(true)
    }

    /// Resume a persisted active session, if there is one.
    ///
    /// Returns whether a session was resumed.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or sampling cannot start.
    pub fn resume(&mut self) -> Result<bool> {
        if self.runner()?.is_recording() {
            return Ok(false);
        }
        match self.store.load_session()? {
            Some(session) if session.should_resume() => {
                info!(
                    interval_ms = session.interval_ms(),
                    "Resuming persisted recording session"
                );
                let started_at = session.started_at.unwrap_or_else(Utc::now);
                self.begin(RecordingSession::started(session.interval, started_at))?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn begin(&mut self, session: RecordingSession) -> Result<()> {
        let started_at = session.started_at.unwrap_or_else(Utc::now);
        self.store.save_session(&session)?;

        let event = EventFields::for_session(started_at);
        let started = match self.runner_mut()?.start_recording(session.interval, event) {
            Ok(started) => started,
            Err(e) => {
                self.store.clear_session()?;
                return Err(e);
            }
        };

        self.session = Some(session);
        if started {
            let strategy = self.runner()?.strategy();
            info!(interval_ms = session.interval_ms(), %strategy, "Recording started");
            self.reporter.publish(StatusEvent::Started {
                interval_ms: session.interval_ms(),
                strategy,
            });
        }
        Ok(())
    }

    /// Stop the session explicitly.
    ///
    /// Stops sampling, fires a final sync without waiting for it, and clears
    /// the persisted flag so the session does not resume.
    ///
    /// # Errors
    ///
    /// Returns an error if the persisted session cannot be cleared. Sampling
    /// has stopped regardless.
    pub fn stop_recording(&mut self) -> Result<bool> {
        self.session = None;

        let runner = self.runner_mut()?;
        let was_recording = runner.stop_recording();
        runner.trigger_sync(SyncReason::Stop);

        if was_recording {
            info!("Recording stopped");
            self.reporter.publish(StatusEvent::Stopped);
        }
        self.store.clear_session()?;
        Ok(was_recording)
    }

    /// Apply a session change made through another connection, such as a
    /// `stop` from a second process.
    ///
    /// Failures are reported as status events and leave recording as it
    /// was; the next call tries again.
    pub fn follow_persisted_session(&mut self) {
        if let Err(e) = self.apply_persisted_session() {
            self.reporter.report_error(&e);
        }
    }

    fn apply_persisted_session(&mut self) -> Result<()> {
        let active = self
            .store
            .load_session()?
            .is_some_and(|s| s.should_resume());
        let recording = self.runner()?.is_recording();

        if recording && !active {
            info!("Session stopped externally");
            self.stop_recording()?;
        } else if !recording && active {
            info!("Session started externally");
            self.resume()?;
        }
        Ok(())
    }

    /// Change the sampling interval.
    ///
    /// An active session restarts its schedule at the new interval, keeping
    /// its trip identifier. Otherwise the interval becomes the default for
    /// the next start.
    ///
    /// # Errors
    ///
    /// Returns an error if the interval is zero or the session cannot be
    /// persisted.
    pub fn update_interval(&mut self, interval: Duration) -> Result<()> {
        if interval.is_zero() {
            return Err(Error::ConfigValidation {
                message: "recording interval must be greater than 0".to_string(),
            });
        }
        self.default_interval = interval;

        let Some(session) = self.session else {
            return Ok(());
        };
        if !self.runner()?.is_recording() {
            return Ok(());
        }

        let started_at = session.started_at.unwrap_or_else(Utc::now);
        let updated = RecordingSession::started(interval, started_at);
        self.store.save_session(&updated)?;

        let runner = self.runner_mut()?;
        runner.stop_recording();
        runner.start_recording(interval, EventFields::for_session(started_at))?;
        self.session = Some(updated);

        info!(interval_ms = updated.interval_ms(), "Recording interval updated");
        Ok(())
    }

    /// Request a sync now.
    ///
    /// # Errors
    ///
    /// Returns an error after shutdown.
    pub fn trigger_sync(&self, reason: SyncReason) -> Result<bool> {
        Ok(self.runner()?.trigger_sync(reason))
    }

    /// Current state.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn status(&self) -> Result<RecorderStatus> {
        let runner = self.runner()?;
        let recording = runner.is_recording();
        let session = self.session.filter(|_| recording);
        Ok(RecorderStatus {
            recording,
            strategy: runner.strategy(),
            interval_ms: session.map_or_else(
                || u64::try_from(self.default_interval.as_millis()).unwrap_or(u64::MAX),
                |s| s.interval_ms(),
            ),
            started_at: session.and_then(|s| s.started_at),
            pending: self.queue.pending()?,
            buffered: self.queue.retry_len(),
            total_records: self.store.count()?,
            sink: self.sink.describe(),
        })
    }

    /// Stop everything without clearing the persisted session, so the next
    /// process resumes it.
    pub fn shutdown(&mut self) {
        if let Some(runner) = self.runner.take() {
            runner.shutdown();
        }
        self.intake.abort();
        self.host_loop.abort();
        info!("Recorder shut down");
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        if self.runner.is_some() {
            self.shutdown();
        }
    }
}

async fn run_intake(
    mut events: mpsc::Receiver<SamplerEvent>,
    queue: Arc<QueueManager>,
    reporter: StatusReporter,
) {
    while let Some(event) = events.recv().await {
        match event {
            SamplerEvent::Record(record) => match queue.accept(record) {
                Ok(accepted) => {
                    debug!(
                        id = %accepted.id,
                        pending = accepted.pending,
                        sync = accepted.sync_requested,
                        "Point recorded"
                    );
                    reporter.publish(StatusEvent::PointRecorded {
                        id: accepted.id,
                        pending: accepted.pending,
                    });
                }
                Err(e) => reporter.report_error(&e),
            },
            SamplerEvent::PositionError(e) => {
                debug!(error = %e, "Tick produced no position");
                reporter.report_error(&e);
            }
        }
    }
    debug!("Sampler event channel closed");
}

async fn run_host_loop(
    store: Arc<RecordStore>,
    queue: Arc<QueueManager>,
    period: Duration,
    retain_delivered: Option<chrono::Duration>,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        match queue.pending() {
            Ok(pending) if pending > 0 => {
                queue.sync_now(SyncReason::Periodic);
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Failed to read pending count"),
        }

        if let Some(max_age) = retain_delivered {
            if let Err(e) = store.prune_delivered_older_than(max_age) {
                warn!(error = %e, "Failed to prune delivered records");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::error::ErrorKind;
    use crate::feed::PositionFix;
    use crate::record::Position;
    use crate::sampler::SamplingMode;
    use crate::strategy::ProbeSettings;
    use crate::sync::tests::FakeSink;

    fn test_config(path: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.storage.database_path = Some(path.to_path_buf());
        config.recording.interval_ms = 20;
        config.sync.sync_interval_secs = 3600;
        config
    }

    fn build(config: &Config, feed: PositionFeed, background: bool) -> (Recorder, Arc<FakeSink>) {
        let store = Arc::new(RecordStore::open(config.database_path()).unwrap());
        let sink = Arc::new(FakeSink::new());
        let probe = RuntimeProbe::new(
            Arc::clone(&store),
            ProbeSettings {
                background_sync: background,
                dedicated_worker: false,
            },
        );
        let recorder = Recorder::new(
            config,
            store,
            Arc::clone(&sink) as Arc<dyn Sink>,
            feed,
            &probe,
        );
        (recorder, sink)
    }

    async fn wait_for_records(store: &RecordStore, n: i64) {
        for _ in 0..1000 {
            if store.count().unwrap() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {n} records");
    }

    #[tokio::test]
    async fn test_start_records_points() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir.path().join("records.db"));
        let feed = PositionFeed::new();
        feed.update(PositionFix::now(Position::new(-34.6, -58.4)));
        let (mut recorder, _sink) = build(&config, feed, false);
        let mut events = recorder.subscribe();

        assert!(recorder.start_recording(None).unwrap());
        assert!(!recorder.start_recording(None).unwrap());
        assert!(matches!(
            events.recv().await.unwrap(),
            StatusEvent::Started { interval_ms: 20, .. }
        ));

        wait_for_records(recorder.store(), 2).await;
        let status = recorder.status().unwrap();
        assert!(status.recording);
        assert_eq!(status.strategy, ExecutionStrategy::ForegroundTimer);
        assert!(status.started_at.is_some());

        let records = recorder.store().list_undelivered().unwrap();
        assert!(records[0].event.trip_id.starts_with("BACKGROUND_"));
        recorder.shutdown();
    }

    #[tokio::test]
    async fn test_stop_clears_session_and_syncs() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir.path().join("records.db"));
        let feed = PositionFeed::new();
        feed.update(PositionFix::now(Position::new(1.0, 2.0)));
        let (mut recorder, sink) = build(&config, feed, false);

        recorder.start_recording(None).unwrap();
        wait_for_records(recorder.store(), 1).await;

        assert!(recorder.stop_recording().unwrap());
        assert!(!recorder.status().unwrap().recording);
        assert!(!recorder
            .store()
            .load_session()
            .unwrap()
            .unwrap()
            .should_resume());

        for _ in 0..1000 {
            if !sink.batches().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!sink.batches().is_empty());
        recorder.shutdown();
    }

    #[tokio::test]
    async fn test_no_resume_after_explicit_stop() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir.path().join("records.db"));

        {
            let (mut recorder, _sink) = build(&config, PositionFeed::new(), false);
            recorder.start_recording(None).unwrap();
            recorder.stop_recording().unwrap();
            recorder.shutdown();
        }

        let (mut recorder, _sink) = build(&config, PositionFeed::new(), false);
        assert!(!recorder.resume().unwrap());
        assert!(!recorder.status().unwrap().recording);
    }

    #[tokio::test]
    async fn test_resume_after_unplanned_restart() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir.path().join("records.db"));

        let started_at = {
            let (mut recorder, _sink) = build(&config, PositionFeed::new(), false);
            recorder
                .start_recording(Some(Duration::from_millis(50)))
                .unwrap();
            let started_at = recorder.status().unwrap().started_at;
            // Dropped without stop_recording.
            drop(recorder);
            started_at
        };

        let (mut recorder, _sink) = build(&config, PositionFeed::new(), false);
        assert!(recorder.resume().unwrap());

        let status = recorder.status().unwrap();
        assert!(status.recording);
        assert_eq!(status.interval_ms, 50);
        assert_eq!(
            status.started_at.map(|t| t.timestamp_millis()),
            started_at.map(|t| t.timestamp_millis())
        );
        recorder.shutdown();
    }

    #[tokio::test]
    async fn test_update_interval() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir.path().join("records.db"));
        let (mut recorder, _sink) = build(&config, PositionFeed::new(), false);

        recorder.update_interval(Duration::from_secs(5)).unwrap();
        assert_eq!(recorder.status().unwrap().interval_ms, 5000);

        recorder.start_recording(None).unwrap();
        recorder.update_interval(Duration::from_secs(2)).unwrap();
        assert_eq!(recorder.status().unwrap().interval_ms, 2000);
        assert_eq!(
            recorder.store().load_session().unwrap().unwrap().interval,
            Duration::from_secs(2)
        );
        assert!(recorder.update_interval(Duration::ZERO).is_err());
        recorder.shutdown();
    }

    #[tokio::test]
    async fn test_threshold_sync_through_background_worker() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(&dir.path().join("records.db"));
        config.recording.mode = SamplingMode::Synthetic;
        config.queue.sync_threshold = 3;
        let (mut recorder, sink) = build(&config, PositionFeed::new(), true);
        assert_eq!(
            recorder.strategy().unwrap(),
            ExecutionStrategy::InstallableWorker
        );

        recorder.start_recording(None).unwrap();
        for _ in 0..1000 {
            if !sink.batches().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        recorder.stop_recording().unwrap();

        let first = &sink.batches()[0];
        assert!(first.len() >= 3);
        recorder.shutdown();
    }

    #[tokio::test]
    async fn test_follow_external_stop_and_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.db");
        let config = test_config(&path);
        let (mut recorder, _sink) = build(&config, PositionFeed::new(), false);
        let other = RecordStore::open(&path).unwrap();

        recorder.start_recording(None).unwrap();
        recorder.follow_persisted_session();
        assert!(recorder.status().unwrap().recording);

        other.clear_session().unwrap();
        recorder.follow_persisted_session();
        assert!(!recorder.status().unwrap().recording);

        other
            .save_session(&RecordingSession::started(
                Duration::from_millis(40),
                Utc::now(),
            ))
            .unwrap();
        recorder.follow_persisted_session();
        let status = recorder.status().unwrap();
        assert!(status.recording);
        assert_eq!(status.interval_ms, 40);
        recorder.shutdown();
    }

    #[tokio::test]
    async fn test_follow_survives_locked_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.db");
        let mut config = test_config(&path);
        config.recording.interval_ms = 60_000;
        let store = Arc::new(RecordStore::open_with_busy_timeout(&path, Duration::ZERO).unwrap());
        let probe = RuntimeProbe::new(
            Arc::clone(&store),
            ProbeSettings {
                background_sync: false,
                dedicated_worker: false,
            },
        );
        let mut recorder = Recorder::new(
            &config,
            store,
            Arc::new(FakeSink::new()),
            PositionFeed::new(),
            &probe,
        );
        let mut events = recorder.subscribe();
        recorder.start_recording(None).unwrap();

        // Another process stops the session, then holds the write lock.
        let other = RecordStore::open(&path).unwrap();
        other.clear_session().unwrap();
        let blocker = rusqlite::Connection::open(&path).unwrap();
        blocker.execute_batch("BEGIN EXCLUSIVE;").unwrap();

        recorder.follow_persisted_session();
        assert!(!recorder.status().unwrap().recording);
        let kind = loop {
            match events.recv().await {
                Ok(StatusEvent::Error { kind, .. }) => break kind,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("reporter closed"),
            }
        };
        assert_eq!(kind, ErrorKind::StorageUnavailable);

        blocker.execute_batch("COMMIT;").unwrap();
        other
            .save_session(&RecordingSession::started(
                Duration::from_secs(60),
                Utc::now(),
            ))
            .unwrap();
        recorder.follow_persisted_session();
        assert!(recorder.status().unwrap().recording);
        recorder.shutdown();
    }

    #[tokio::test]
    async fn test_operations_after_shutdown_fail() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir.path().join("records.db"));
        let (mut recorder, _sink) = build(&config, PositionFeed::new(), false);

        recorder.shutdown();
        assert!(recorder.start_recording(None).is_err());
        assert!(recorder.trigger_sync(SyncReason::Manual).is_err());
    }
}
