//! Remote collector interface.
//!
//! A [`Sink`] accepts a batch of rows and reports which of them it took.
//! [`HttpSink`] speaks the collector's form-encoded protocol:
//! `action=<action>&data=<JSON array of rows>`, answered by a JSON body with
//! a `status` marker and an optional per-item `acknowledged` id list.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::record::{RecordId, TelemetryRecord};

/// Default collector action name.
pub const DEFAULT_ACTION: &str = "saveData";

/// Status markers that mean the batch was accepted.
const SUCCESS_STATUSES: &[&str] = &["success", "ok"];

/// One record as the collector expects it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkRow {
    /// Store key, echoed back in `acknowledged`.
    pub id: RecordId,
    /// Capture time, RFC 3339.
    pub timestamp: String,
    /// Latitude in degrees.
    pub lat: Option<f64>,
    /// Longitude in degrees.
    pub lng: Option<f64>,
    /// Speed in km/h.
    pub speed_kmh: Option<f64>,
    /// Heading in degrees.
    pub heading: Option<f64>,
    /// Accuracy rounded to whole metres.
    pub accuracy_m: Option<i64>,
    /// Event classification.
    pub event_type: String,
    /// Stop duration in seconds.
    pub stop_duration_s: f64,
    /// Route line.
    pub line: String,
    /// Route deviation in metres.
    pub deviation_m: f64,
    /// Direction of travel.
    pub direction: String,
    /// Trip identifier.
    pub trip_id: String,
}

impl SinkRow {
    /// Map a stored record to a row.
    ///
    /// Returns `None` for records that were never appended (no id).
    #[must_use]
    pub fn from_record(record: &TelemetryRecord) -> Option<Self> {
        let id = record.id?;
        let position = record.position;
        #[allow(clippy::cast_possible_truncation)]
        let accuracy_m = position.and_then(|p| p.accuracy).map(|a| a.round() as i64);
        Some(Self {
            id,
            timestamp: record.captured_at.to_rfc3339(),
            lat: position.map(|p| p.latitude),
            lng: position.map(|p| p.longitude),
            speed_kmh: position.and_then(|p| p.speed).map(|s| s * 3.6),
            heading: position.and_then(|p| p.heading),
            accuracy_m,
            event_type: record.event.event_type.clone(),
            stop_duration_s: record.event.stop_duration_s,
            line: record.event.line.clone(),
            deviation_m: record.event.deviation_m,
            direction: record.event.direction.clone(),
            trip_id: record.event.trip_id.clone(),
        })
    }
}

/// What the sink acknowledged for a submitted batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkAck {
    /// The sink accepted the whole batch.
    All,
    /// The sink accepted only these ids.
    Partial(HashSet<RecordId>),
}

impl SinkAck {
    /// Whether `id` is acknowledged.
    #[must_use]
    pub fn contains(&self, id: RecordId) -> bool {
        match self {
            Self::All => true,
            Self::Partial(ids) => ids.contains(&id),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SinkResponse {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    acknowledged: Option<Vec<RecordId>>,
}

/// Interpret a collector response body.
///
/// # Errors
///
/// Returns `NetworkFailure` for malformed bodies, missing or unknown status
/// markers, and explicit rejections.
pub fn parse_ack(body: &str) -> Result<SinkAck> {
    let response: SinkResponse = serde_json::from_str(body)
        .map_err(|e| Error::network(format!("malformed sink response: {e}")))?;

    let Some(status) = response.status else {
        return Err(Error::network("sink response has no status"));
    };
    if !SUCCESS_STATUSES
        .iter()
        .any(|s| s.eq_ignore_ascii_case(status.trim()))
    {
        let detail = response.message.unwrap_or_default();
        return Err(Error::network(format!(
            "sink rejected batch: status={status} {detail}"
        )));
    }

    Ok(match response.acknowledged {
        Some(ids) => SinkAck::Partial(ids.into_iter().collect()),
        None => SinkAck::All,
    })
}

/// A remote collector.
#[async_trait]
pub trait Sink: Send + Sync + std::fmt::Debug {
    /// Submit one batch in a single request.
    ///
    /// # Errors
    ///
    /// Returns `NetworkFailure` if the request fails or the sink rejects it.
    async fn submit(&self, rows: &[SinkRow]) -> Result<SinkAck>;

    /// Where batches go, for logs and status.
    fn describe(&self) -> String;
}

/// Collector reached over HTTP.
#[derive(Debug, Clone)]
pub struct HttpSink {
    client: reqwest::Client,
    endpoint: String,
    action: String,
}

impl HttpSink {
    /// Create a sink posting to `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(endpoint: impl Into<String>, action: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(10)))
            .build()
            .map_err(|e| Error::internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            action: action.into(),
        })
    }
}

#[async_trait]
impl Sink for HttpSink {
    async fn submit(&self, rows: &[SinkRow]) -> Result<SinkAck> {
        let data = serde_json::to_string(rows)?;
        debug!(endpoint = %self.endpoint, rows = rows.len(), "Submitting batch");

        let response = self
            .client
            .post(&self.endpoint)
            .form(&[("action", self.action.as_str()), ("data", data.as_str())])
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            warn!(status = %status, "Sink returned error status");
            return Err(Error::network(format!("sink returned HTTP {status}")));
        }

        parse_ack(&body)
    }

    fn describe(&self) -> String {
        self.endpoint.clone()
    }
}

/// Placeholder used when no endpoint is configured; every submit fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnconfiguredSink;

#[async_trait]
impl Sink for UnconfiguredSink {
    async fn submit(&self, _rows: &[SinkRow]) -> Result<SinkAck> {
        Err(Error::network("no sync endpoint configured"))
    }

    fn describe(&self) -> String {
        "unconfigured".to_string()
    }
}
