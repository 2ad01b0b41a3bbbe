//! Persisted recording session state.
//!
//! A session is just two facts, "is sampling active" and "at what interval",
//! plus the start time used for trip identifiers. It is written to the
//! store's settings table so a restarted process can resume recording.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Recording session control state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordingSession {
    /// Whether sampling should be running.
    pub active: bool,
    /// Sampling interval.
    #[serde(with = "interval_ms")]
    pub interval: Duration,
    /// When the session was started.
    pub started_at: Option<DateTime<Utc>>,
}

impl RecordingSession {
    /// An active session started at `started_at`.
    #[must_use]
    pub const fn started(interval: Duration, started_at: DateTime<Utc>) -> Self {
        Self {
            active: true,
            interval,
            started_at: Some(started_at),
        }
    }

    /// The same session marked inactive, keeping the interval.
    #[must_use]
    pub const fn stopped(self) -> Self {
        Self {
            active: false,
            interval: self.interval,
            started_at: None,
        }
    }

    /// Whether a restarted process should resume recording.
    #[must_use]
    pub const fn should_resume(&self) -> bool {
        self.active
    }

    /// Interval in whole milliseconds.
    #[must_use]
    pub fn interval_ms(&self) -> u64 {
        u64::try_from(self.interval.as_millis()).unwrap_or(u64::MAX)
    }
}

mod interval_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_started_session_resumes() {
        let session = RecordingSession::started(Duration::from_secs(10), Utc::now());
        assert!(session.should_resume());
        assert!(session.started_at.is_some());
        assert_eq!(session.interval_ms(), 10_000);
    }

    #[test]
    fn test_stopped_session_keeps_interval() {
        let session = RecordingSession::started(Duration::from_secs(5), Utc::now()).stopped();
        assert!(!session.should_resume());
        assert!(session.started_at.is_none());
        assert_eq!(session.interval, Duration::from_secs(5));
    }

    #[test]
    fn test_session_json_uses_milliseconds() {
        let session = RecordingSession {
            active: true,
            interval: Duration::from_millis(2500),
            started_at: None,
        };
        let json = serde_json::to_string(&session).unwrap();
        assert!(json.contains("\"interval\":2500"));
        let parsed: RecordingSession = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, session);
    }
}
