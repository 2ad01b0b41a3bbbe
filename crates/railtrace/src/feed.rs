//! Push-style position feed.
//!
//! The feed is a latest-value cell. A position source (a device reader, a
//! stdin pipe, a test) pushes fixes and errors into it; the sampler reads
//! the latest value on every tick.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::record::Position;

/// A position fix reported by the feed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionFix {
    /// The position itself.
    pub position: Position,
    /// When the fix was taken.
    pub captured_at: DateTime<Utc>,
}

impl PositionFix {
    /// A fix taken now.
    #[must_use]
    pub fn now(position: Position) -> Self {
        Self {
            position,
            captured_at: Utc::now(),
        }
    }
}

#[derive(Debug, Default)]
struct FeedState {
    latest: Option<PositionFix>,
    error: Option<String>,
    updates: u64,
}

/// Latest-value position cell shared between a source and the sampler.
///
/// Clones share state.
#[derive(Debug, Clone, Default)]
pub struct PositionFeed {
    state: Arc<Mutex<FeedState>>,
}

impl PositionFeed {
    /// Create an empty feed.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FeedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish a new fix. Clears any pending error.
    pub fn update(&self, fix: PositionFix) {
        let mut state = self.state();
        state.latest = Some(fix);
        state.error = None;
        state.updates += 1;
        trace!(
            latitude = fix.position.latitude,
            longitude = fix.position.longitude,
            "Position updated"
        );
    }

    /// Report a position error. The next sampler tick surfaces it.
    pub fn report_error(&self, message: impl Into<String>) {
        let message = message.into();
        debug!(error = %message, "Position feed error");
        self.state().error = Some(message);
    }

    /// Forget the latest fix (signal lost).
    pub fn clear(&self) {
        self.state().latest = None;
    }

    /// The latest fix, if any.
    #[must_use]
    pub fn latest(&self) -> Option<PositionFix> {
        self.state().latest
    }

    /// Take the pending error, if any.
    pub fn take_error(&self) -> Option<String> {
        self.state().error.take()
    }

    /// Number of fixes published so far.
    #[must_use]
    pub fn update_count(&self) -> u64 {
        self.state().updates
    }
}

/// One line of the JSON position stream.
#[derive(Debug, Deserialize)]
struct FeedLine {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    captured_at: Option<DateTime<Utc>>,
    #[serde(default)]
    latitude: Option<f64>,
    #[serde(default)]
    longitude: Option<f64>,
    #[serde(default)]
    speed: Option<f64>,
    #[serde(default)]
    heading: Option<f64>,
    #[serde(default)]
    accuracy: Option<f64>,
}

/// A parsed line of the position stream.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage {
    /// A new fix.
    Fix(PositionFix),
    /// The source reported an error.
    Error(String),
}

/// Parse one JSON line of the position stream.
///
/// Accepts `{"latitude": .., "longitude": .., "speed"?, "heading"?,
/// "accuracy"?, "captured_at"?}` or `{"error": ".."}`. Returns `None` for
/// blank lines. Lines that cannot be understood become [`FeedMessage::Error`].
#[must_use]
pub fn parse_line(line: &str) -> Option<FeedMessage> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let parsed: FeedLine = match serde_json::from_str(line) {
        Ok(parsed) => parsed,
        Err(e) => return Some(FeedMessage::Error(format!("unreadable position line: {e}"))),
    };

    if let Some(error) = parsed.error {
        return Some(FeedMessage::Error(error));
    }

    match (parsed.latitude, parsed.longitude) {
        (Some(latitude), Some(longitude)) => Some(FeedMessage::Fix(PositionFix {
            position: Position {
                latitude,
                longitude,
                speed: parsed.speed,
                heading: parsed.heading,
                accuracy: parsed.accuracy,
            },
            captured_at: parsed.captured_at.unwrap_or_else(Utc::now),
        })),
        _ => Some(FeedMessage::Error(
            "position line without latitude/longitude".to_string(),
        )),
    }
}

/// Read JSON position lines from `reader` into `feed` until end of input.
///
/// End of input leaves the last fix in place.
pub fn spawn_line_reader<R>(reader: R, feed: PositionFeed) -> JoinHandle<()>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = reader.lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => match parse_line(&line) {
                    Some(FeedMessage::Fix(fix)) => feed.update(fix),
                    Some(FeedMessage::Error(message)) => feed.report_error(message),
                    None => {}
                },
                Ok(None) => {
                    debug!("Position stream ended");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Position stream read failed");
                    feed.report_error(e.to_string());
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feed_starts_empty() {
        let feed = PositionFeed::new();
        assert!(feed.latest().is_none());
        assert!(feed.take_error().is_none());
        assert_eq!(feed.update_count(), 0);
    }

    #[test]
    fn test_update_and_clear() {
        let feed = PositionFeed::new();
        feed.update(PositionFix::now(Position::new(1.0, 2.0)));

        assert_eq!(feed.latest().unwrap().position, Position::new(1.0, 2.0));
        assert_eq!(feed.update_count(), 1);

        feed.clear();
        assert!(feed.latest().is_none());
    }

    #[test]
    fn test_error_is_taken_once() {
        let feed = PositionFeed::new();
        feed.report_error("permission denied");

        assert_eq!(feed.take_error().as_deref(), Some("permission denied"));
        assert!(feed.take_error().is_none());
    }

    #[test]
    fn test_update_clears_error() {
        let feed = PositionFeed::new();
        feed.report_error("timeout");
        feed.update(PositionFix::now(Position::new(1.0, 2.0)));
        assert!(feed.take_error().is_none());
    }

    #[test]
    fn test_clones_share_state() {
        let feed = PositionFeed::new();
        let clone = feed.clone();
        clone.update(PositionFix::now(Position::new(3.0, 4.0)));
        assert!(feed.latest().is_some());
    }

    #[test]
    fn test_parse_fix_line() {
        let msg = parse_line(
            r#"{"latitude": -34.6, "longitude": -58.4, "speed": 5.0, "captured_at": "2024-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        let FeedMessage::Fix(fix) = msg else {
            panic!("expected fix");
        };
        assert_eq!(fix.position.speed, Some(5.0));
        assert!(fix.position.heading.is_none());
        assert_eq!(fix.captured_at.to_rfc3339(), "2024-01-01T00:00:00+00:00");
    }

    #[test]
    fn test_parse_error_line() {
        assert_eq!(
            parse_line(r#"{"error": "no signal"}"#),
            Some(FeedMessage::Error("no signal".to_string()))
        );
    }

    #[test]
    fn test_parse_blank_and_garbage() {
        assert!(parse_line("   ").is_none());
        assert!(matches!(parse_line("not json"), Some(FeedMessage::Error(_))));
        assert!(matches!(
            parse_line(r#"{"latitude": 1.0}"#),
            Some(FeedMessage::Error(_))
        ));
    }

    #[tokio::test]
    async fn test_line_reader_feeds_positions() {
        let input: &[u8] = b"{\"latitude\": 1.0, \"longitude\": 2.0}\n\n{\"latitude\": 3.0, \"longitude\": 4.0}\n";
        let feed = PositionFeed::new();

        spawn_line_reader(input, feed.clone()).await.unwrap();

        assert_eq!(feed.update_count(), 2);
        assert_eq!(feed.latest().unwrap().position, Position::new(3.0, 4.0));
    }

    #[tokio::test]
    async fn test_line_reader_reports_errors() {
        let input: &[u8] = b"{\"error\": \"denied\"}\n";
        let feed = PositionFeed::new();

        spawn_line_reader(input, feed.clone()).await.unwrap();

        assert_eq!(feed.take_error().as_deref(), Some("denied"));
    }
}
