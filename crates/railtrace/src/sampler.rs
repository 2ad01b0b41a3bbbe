//! Periodic position sampling.
//!
//! A [`Sampler`] turns the current state of the [`PositionFeed`] into at
//! most one [`TelemetryRecord`] per tick. [`SamplerControl`] owns the
//! schedule: `Idle -> Active -> Idle`, first tick one interval after start.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::error::Error;
use crate::feed::PositionFeed;
use crate::record::{EventFields, Position, RecordSource, SampleIdGenerator, TelemetryRecord};

/// What to do when no live fix is available.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SamplingMode {
    /// Skip the tick.
    #[default]
    Strict,
    /// Emit a synthetic point around the configured origin.
    Synthetic,
}

impl std::fmt::Display for SamplingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Strict => write!(f, "strict"),
            Self::Synthetic => write!(f, "synthetic"),
        }
    }
}

/// Centre of the synthetic point cloud.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SyntheticOrigin {
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
}

impl Default for SyntheticOrigin {
    fn default() -> Self {
        Self {
            latitude: -34.6037,
            longitude: -58.3816,
        }
    }
}

/// Maximum synthetic offset from the origin, in degrees.
const SYNTHETIC_SPREAD_DEG: f64 = 0.01;
/// Maximum synthetic speed, in km/h.
const SYNTHETIC_MAX_SPEED_KMH: f64 = 50.0;
/// Synthetic accuracy range, in metres.
const SYNTHETIC_ACCURACY_M: std::ops::Range<f64> = 10.0..30.0;

/// Result of a single sampler tick.
#[derive(Debug)]
pub enum TickOutcome {
    /// A record was produced.
    Emitted(TelemetryRecord),
    /// No fix was available in strict mode.
    Skipped,
    /// The feed reported an error.
    Failed(Error),
}

/// Produces records from the position feed.
#[derive(Debug, Clone)]
pub struct Sampler {
    feed: PositionFeed,
    mode: SamplingMode,
    origin: SyntheticOrigin,
    ids: SampleIdGenerator,
    event: EventFields,
}

impl Sampler {
    /// Create a sampler reading from `feed`.
    #[must_use]
    pub fn new(feed: PositionFeed, mode: SamplingMode, origin: SyntheticOrigin) -> Self {
        Self {
            feed,
            mode,
            origin,
            ids: SampleIdGenerator::new(),
            event: EventFields::default(),
        }
    }

    /// Use `event` as the event fields of every emitted record.
    #[must_use]
    pub fn with_event(mut self, event: EventFields) -> Self {
        self.event = event;
        self
    }

    /// The sampling mode.
    #[must_use]
    pub const fn mode(&self) -> SamplingMode {
        self.mode
    }

    /// The feed this sampler reads from.
    #[must_use]
    pub const fn feed(&self) -> &PositionFeed {
        &self.feed
    }

    /// Run one tick.
    #[must_use]
    pub fn tick(&self) -> TickOutcome {
        if let Some(reason) = self.feed.take_error() {
            return TickOutcome::Failed(Error::position_unavailable(reason));
        }

        let (position, captured_at, source) = match self.feed.latest() {
            Some(fix) => (fix.position, fix.captured_at, RecordSource::Live),
            None => match self.mode {
                SamplingMode::Strict => {
                    trace!("No position fix, skipping tick");
                    return TickOutcome::Skipped;
                }
                SamplingMode::Synthetic => {
                    (self.synthetic_position(), Utc::now(), RecordSource::Synthetic)
                }
            },
        };

        let sample_id = self.ids.next_at(captured_at);
        TickOutcome::Emitted(TelemetryRecord::new(
            sample_id,
            captured_at,
            Some(position),
            self.event.clone(),
            source,
        ))
    }

    fn synthetic_position(&self) -> Position {
        let mut rng = rand::rng();
        Position {
            latitude: self.origin.latitude + rng.random_range(0.0..SYNTHETIC_SPREAD_DEG),
            longitude: self.origin.longitude + rng.random_range(0.0..SYNTHETIC_SPREAD_DEG),
            speed: Some(rng.random_range(0.0..SYNTHETIC_MAX_SPEED_KMH) / 3.6),
            heading: None,
            accuracy: Some(rng.random_range(SYNTHETIC_ACCURACY_M)),
        }
    }
}

/// Message from a running sampler to its consumer.
#[derive(Debug)]
pub enum SamplerEvent {
    /// A record ready to be queued.
    Record(TelemetryRecord),
    /// The tick failed to read a position.
    PositionError(Error),
}

/// Sampler schedule state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SamplerState {
    /// Not sampling.
    Idle,
    /// A tick is scheduled every interval.
    Active,
}

/// Owns the sampling schedule.
#[derive(Debug)]
pub struct SamplerControl {
    sampler: Sampler,
    running: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
    interval: Option<Duration>,
}

impl SamplerControl {
    /// Create an idle control for `sampler`.
    #[must_use]
    pub fn new(sampler: Sampler) -> Self {
        Self {
            sampler,
            running: Arc::new(AtomicBool::new(false)),
            task: None,
            interval: None,
        }
    }

    /// Current schedule state.
    #[must_use]
    pub fn state(&self) -> SamplerState {
        if self.running.load(Ordering::SeqCst) {
            SamplerState::Active
        } else {
            SamplerState::Idle
        }
    }

    /// Interval of the active schedule.
    #[must_use]
    pub const fn interval(&self) -> Option<Duration> {
        self.interval
    }

    /// Start ticking every `interval`, sending results to `tx`.
    ///
    /// Only valid from `Idle`; returns `false` if already active. Must be
    /// called inside a Tokio runtime.
    pub fn start(
        &mut self,
        interval: Duration,
        event: EventFields,
        tx: mpsc::Sender<SamplerEvent>,
    ) -> bool {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Sampler already active");
            return false;
        }

        debug!(interval_ms = interval.as_millis(), mode = %self.sampler.mode, "Starting sampler");

        let sampler = self.sampler.clone().with_event(event);
        let running = Arc::clone(&self.running);
        self.interval = Some(interval);
        self.task = Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            while running.load(Ordering::SeqCst) {
                ticker.tick().await;
                if !running.load(Ordering::SeqCst) {
                    break;
                }

                let event = match sampler.tick() {
                    TickOutcome::Emitted(record) => SamplerEvent::Record(record),
                    TickOutcome::Skipped => continue,
                    TickOutcome::Failed(e) => SamplerEvent::PositionError(e),
                };
                if tx.send(event).await.is_err() {
                    debug!("Sampler channel closed, stopping");
                    break;
                }
            }

            running.store(false, Ordering::SeqCst);
            debug!("Sampler stopped");
        }));
        true
    }

    /// Stop ticking. No tick fires after this returns.
    ///
    /// Returns `false` if the sampler was already idle.
    pub fn stop(&mut self) -> bool {
        let was_running = self.running.swap(false, Ordering::SeqCst);
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.interval = None;
        if was_running {
            debug!("Sampler stop requested");
        }
        was_running
    }
}

impl Drop for SamplerControl {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::timeout;

    use super::*;
    use crate::feed::PositionFix;

    fn sampler(mode: SamplingMode) -> (Sampler, PositionFeed) {
        let feed = PositionFeed::new();
        (
            Sampler::new(feed.clone(), mode, SyntheticOrigin::default()),
            feed,
        )
    }

    fn emitted(outcome: TickOutcome) -> Option<TelemetryRecord> {
        match outcome {
            TickOutcome::Emitted(record) => Some(record),
            _ => None,
        }
    }

    #[test]
    fn test_strict_skips_without_fix() {
        let (sampler, _feed) = sampler(SamplingMode::Strict);
        assert!(matches!(sampler.tick(), TickOutcome::Skipped));
    }

    #[test]
    fn test_live_fix_is_recorded() {
        let (sampler, feed) = sampler(SamplingMode::Strict);
        feed.update(PositionFix::now(Position::new(10.0, 20.0)));

        let record = emitted(sampler.tick()).unwrap();
        assert_eq!(record.source, RecordSource::Live);
        assert_eq!(record.position, Some(Position::new(10.0, 20.0)));
        assert!(!record.delivered);
    }

    #[test]
    fn test_synthetic_point_near_origin() {
        let (sampler, _feed) = sampler(SamplingMode::Synthetic);
        let origin = SyntheticOrigin::default();

        let record = emitted(sampler.tick()).unwrap();
        let position = record.position.unwrap();
        assert_eq!(record.source, RecordSource::Synthetic);
        assert!(position.latitude >= origin.latitude);
        assert!(position.latitude < origin.latitude + SYNTHETIC_SPREAD_DEG);
        assert!(position.longitude >= origin.longitude);
        assert!(position.speed.unwrap() * 3.6 < SYNTHETIC_MAX_SPEED_KMH);
        assert!(SYNTHETIC_ACCURACY_M.contains(&position.accuracy.unwrap()));
    }

    #[test]
    fn test_feed_error_surfaces_and_emits_nothing() {
        let (sampler, feed) = sampler(SamplingMode::Synthetic);
        feed.report_error("permission denied");

        match sampler.tick() {
            TickOutcome::Failed(e) => assert!(matches!(e, Error::PositionUnavailable { .. })),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(emitted(sampler.tick()).is_some());
    }

    #[test]
    fn test_three_ticks_fix_only_on_second() {
        for (mode, expected) in [(SamplingMode::Strict, 1), (SamplingMode::Synthetic, 3)] {
            let (sampler, feed) = sampler(mode);
            let mut records = Vec::new();
            for tick in 1..=3 {
                if tick == 2 {
                    feed.update(PositionFix::now(Position::new(1.0, 1.0)));
                } else {
                    feed.clear();
                }
                records.extend(emitted(sampler.tick()));
            }

            assert_eq!(records.len(), expected, "mode {mode}");
            let live = records
                .iter()
                .filter(|r| r.source == RecordSource::Live)
                .count();
            assert_eq!(live, 1);
            assert!(records.windows(2).all(|w| w[0].sample_id < w[1].sample_id));
        }
    }

    #[test]
    fn test_with_event_applies_to_records() {
        let started = Utc::now();
        let (sampler, _feed) = sampler(SamplingMode::Synthetic);
        let sampler = sampler.with_event(EventFields::for_session(started));

        let record = emitted(sampler.tick()).unwrap();
        assert!(record.event.trip_id.starts_with("BACKGROUND_"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_tick_after_one_interval() {
        let (sampler, _feed) = sampler(SamplingMode::Synthetic);
        let mut control = SamplerControl::new(sampler);
        let (tx, mut rx) = mpsc::channel(8);

        let started = Instant::now();
        assert!(control.start(Duration::from_secs(10), EventFields::default(), tx));
        assert_eq!(control.state(), SamplerState::Active);

        assert!(timeout(Duration::from_secs(9), rx.recv()).await.is_err());
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, SamplerEvent::Record(_)));
        assert!(started.elapsed() >= Duration::from_secs(10));

        let second = rx.recv().await.unwrap();
        assert!(matches!(second, SamplerEvent::Record(_)));
        assert!(started.elapsed() >= Duration::from_secs(20));
    }

    /// Ten-second schedule with a fix on the first and third ticks only.
    async fn record_gap_in_fix(mode: SamplingMode) -> Vec<TelemetryRecord> {
        let (sampler, feed) = sampler(mode);
        let mut control = SamplerControl::new(sampler);
        let (tx, mut rx) = mpsc::channel(8);
        let interval = Duration::from_millis(10_000);

        feed.update(PositionFix::now(Position::new(-34.60, -58.38)));
        control.start(interval, EventFields::default(), tx);

        tokio::time::sleep(Duration::from_millis(15_000)).await;
        feed.clear();
        tokio::time::sleep(interval).await;
        feed.update(PositionFix::now(Position::new(-34.61, -58.39)));
        tokio::time::sleep(interval).await;
        control.stop();

        let mut records = Vec::new();
        while let Ok(event) = rx.try_recv() {
            match event {
                SamplerEvent::Record(record) => records.push(record),
                SamplerEvent::PositionError(e) => panic!("unexpected error: {e}"),
            }
        }
        records
    }

    #[tokio::test(start_paused = true)]
    async fn test_strict_records_only_ticks_with_fix() {
        let records = record_gap_in_fix(SamplingMode::Strict).await;

        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.source == RecordSource::Live));
        assert_eq!(records[0].position, Some(Position::new(-34.60, -58.38)));
        assert_eq!(records[1].position, Some(Position::new(-34.61, -58.39)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_synthetic_fills_tick_without_fix() {
        let records = record_gap_in_fix(SamplingMode::Synthetic).await;

        let sources: Vec<_> = records.iter().map(|r| r.source).collect();
        assert_eq!(
            sources,
            vec![
                RecordSource::Live,
                RecordSource::Synthetic,
                RecordSource::Live
            ]
        );
        assert!(records.windows(2).all(|w| w[0].sample_id < w[1].sample_id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_twice_is_rejected() {
        let (sampler, _feed) = sampler(SamplingMode::Strict);
        let mut control = SamplerControl::new(sampler);
        let (tx, _rx) = mpsc::channel(8);

        assert!(control.start(Duration::from_secs(1), EventFields::default(), tx.clone()));
        assert!(!control.start(Duration::from_secs(1), EventFields::default(), tx));
        assert_eq!(control.interval(), Some(Duration::from_secs(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_next_tick() {
        let (sampler, _feed) = sampler(SamplingMode::Synthetic);
        let mut control = SamplerControl::new(sampler);
        let (tx, mut rx) = mpsc::channel(8);

        control.start(Duration::from_secs(10), EventFields::default(), tx);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(control.stop());
        assert_eq!(control.state(), SamplerState::Idle);
        assert!(!control.stop());

        let next = timeout(Duration::from_secs(60), rx.recv()).await;
        assert!(matches!(next, Ok(None) | Err(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_after_stop() {
        let (sampler, _feed) = sampler(SamplingMode::Synthetic);
        let mut control = SamplerControl::new(sampler);

        let (tx, _rx) = mpsc::channel(8);
        control.start(Duration::from_secs(10), EventFields::default(), tx);
        control.stop();

        let (tx, mut rx) = mpsc::channel(8);
        assert!(control.start(Duration::from_secs(2), EventFields::default(), tx));
        assert!(matches!(rx.recv().await, Some(SamplerEvent::Record(_))));
    }
}
