//! `railtrace` - An offline-first location telemetry recorder
//!
//! This library samples vehicle positions on a fixed interval, persists every
//! sample to a local SQLite store, and syncs undelivered records to an HTTP
//! sink in batches whenever connectivity allows.

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

pub mod cli;
pub mod config;
pub mod error;
pub mod feed;
pub mod logging;
pub mod queue;
pub mod record;
pub mod recorder;
pub mod reporter;
pub mod sampler;
pub mod session;
pub mod sink;
pub mod storage;
pub mod strategy;
pub mod sync;

pub use config::Config;
pub use error::{Error, ErrorKind, Result};
pub use feed::{PositionFeed, PositionFix};
pub use logging::init_logging;
pub use queue::{QueueManager, QueueSettings};
pub use record::{EventFields, Position, RecordId, RecordSource, TelemetryRecord};
pub use recorder::{Recorder, RecorderStatus};
pub use reporter::{StatusEvent, StatusReporter};
pub use sampler::{Sampler, SamplingMode};
pub use session::RecordingSession;
pub use sink::{HttpSink, Sink, SinkAck, SinkRow};
pub use storage::{RecordStore, StoreStats};
pub use strategy::ExecutionStrategy;
pub use sync::{SyncEngine, SyncOutcome, SyncReason};
