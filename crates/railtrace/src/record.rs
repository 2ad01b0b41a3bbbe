//! Core telemetry record types for railtrace.
//!
//! A [`TelemetryRecord`] is one timestamped observation. The store assigns
//! its [`RecordId`]; the sampler assigns its time-based `sample_id`.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Store-assigned record key, strictly increasing in insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub i64);

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a record's position came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordSource {
    /// Read from the live position feed.
    Live,
    /// Generated in degraded mode with no feed available.
    Synthetic,
}

impl std::fmt::Display for RecordSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "live"),
            Self::Synthetic => write!(f, "synthetic"),
        }
    }
}

impl std::str::FromStr for RecordSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "live" => Ok(Self::Live),
            "synthetic" => Ok(Self::Synthetic),
            other => Err(format!("unknown record source: {other}")),
        }
    }
}

/// A position fix.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
    /// Ground speed in metres per second.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    /// Heading in degrees from true north.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading: Option<f64>,
    /// Horizontal accuracy in metres.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
}

impl Position {
    /// A bare fix with no speed, heading or accuracy.
    #[must_use]
    pub const fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            speed: None,
            heading: None,
            accuracy: None,
        }
    }
}

/// Event classification fields carried through to the sink untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventFields {
    /// Event classification.
    pub event_type: String,
    /// How long the vehicle has been stopped, in seconds.
    pub stop_duration_s: f64,
    /// Route line the sample was matched to.
    pub line: String,
    /// Distance from the expected route, in metres.
    pub deviation_m: f64,
    /// Direction of travel.
    pub direction: String,
    /// Trip identifier.
    pub trip_id: String,
}

/// Default event type.
pub const DEFAULT_EVENT_TYPE: &str = "EN_ROUTE";
/// Default route line when none was detected.
pub const DEFAULT_LINE: &str = "UNDETECTED";
/// Default direction of travel.
pub const DEFAULT_DIRECTION: &str = "OUTBOUND";
/// Trip identifier prefix for background recordings.
pub const TRIP_ID_PREFIX: &str = "BACKGROUND";

impl Default for EventFields {
    fn default() -> Self {
        Self {
            event_type: DEFAULT_EVENT_TYPE.to_string(),
            stop_duration_s: 0.0,
            line: DEFAULT_LINE.to_string(),
            deviation_m: 0.0,
            direction: DEFAULT_DIRECTION.to_string(),
            trip_id: TRIP_ID_PREFIX.to_string(),
        }
    }
}

impl EventFields {
    /// Defaults with a trip identifier derived from the session start.
    #[must_use]
    pub fn for_session(started_at: DateTime<Utc>) -> Self {
        Self {
            trip_id: format!("{TRIP_ID_PREFIX}_{}", started_at.timestamp_millis()),
            ..Self::default()
        }
    }
}

/// One telemetry observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    /// Store-assigned key (absent until appended).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<RecordId>,

    /// Time-based identifier assigned at capture.
    pub sample_id: i64,

    /// When the observation was made.
    pub captured_at: DateTime<Utc>,

    /// The position fix, if one was available.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,

    /// Derived event fields.
    pub event: EventFields,

    /// Where the position came from.
    pub source: RecordSource,

    /// BLAKE3 hash of the content, used to drop re-delivered duplicates.
    pub fingerprint: String,

    /// Whether the sink acknowledged this record.
    pub delivered: bool,
}

impl TelemetryRecord {
    /// Create a new undelivered record.
    #[must_use]
    pub fn new(
        sample_id: i64,
        captured_at: DateTime<Utc>,
        position: Option<Position>,
        event: EventFields,
        source: RecordSource,
    ) -> Self {
        let fingerprint =
            Self::compute_fingerprint(sample_id, captured_at, position.as_ref(), &event, source);
        Self {
            id: None,
            sample_id,
            captured_at,
            position,
            event,
            source,
            fingerprint,
            delivered: false,
        }
    }

    /// Compute the content fingerprint.
    #[must_use]
    pub fn compute_fingerprint(
        sample_id: i64,
        captured_at: DateTime<Utc>,
        position: Option<&Position>,
        event: &EventFields,
        source: RecordSource,
    ) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&sample_id.to_le_bytes());
        hasher.update(captured_at.to_rfc3339().as_bytes());
        if let Some(pos) = position {
            hasher.update(&pos.latitude.to_le_bytes());
            hasher.update(&pos.longitude.to_le_bytes());
            for value in [pos.speed, pos.heading, pos.accuracy] {
                hasher.update(&value.unwrap_or(f64::NAN).to_le_bytes());
            }
        }
        hasher.update(event.event_type.as_bytes());
        hasher.update(&event.stop_duration_s.to_le_bytes());
        hasher.update(event.line.as_bytes());
        hasher.update(&event.deviation_m.to_le_bytes());
        hasher.update(event.direction.as_bytes());
        hasher.update(event.trip_id.as_bytes());
        hasher.update(source.to_string().as_bytes());
        hasher.finalize().to_hex().to_string()
    }

    /// Whether this record is still waiting for delivery.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        !self.delivered
    }
}

/// Generates time-based sample identifiers.
///
/// Values are microseconds since the epoch, bumped so that each value is
/// strictly greater than the previous one from the same generator. Clones
/// share state. Independent generators may collide.
#[derive(Debug, Clone, Default)]
pub struct SampleIdGenerator {
    last: Arc<AtomicI64>,
}

impl SampleIdGenerator {
    /// Create a new generator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Next identifier for a sample taken at `now`.
    pub fn next_at(&self, now: DateTime<Utc>) -> i64 {
        let candidate = now.timestamp_micros();
        let previous = self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(candidate.max(last.saturating_add(1)))
            })
            .unwrap_or_else(|last| last);
        candidate.max(previous.saturating_add(1))
    }

    /// Next identifier for a sample taken now.
    pub fn next(&self) -> i64 {
        self.next_at(Utc::now())
    }
}
