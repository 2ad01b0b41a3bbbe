//! Error types for railtrace.
//!
//! Runtime failures fall into four categories (see [`ErrorKind`]): the
//! storage medium, the network sink, the position feed, and execution
//! strategy capabilities. None of them is fatal to a running recorder; they
//! are logged, reported, and retried by the next tick or sync trigger.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for railtrace operations.
#[derive(Error, Debug)]
pub enum Error {
    // === Storage Errors ===
    /// Failed to open or create the database.
    #[error("failed to open database at {path}: {source}")]
    DatabaseOpen {
        /// Path to the database file.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: rusqlite::Error,
    },

    /// A database query failed.
    #[error("database query failed: {0}")]
    DatabaseQuery(rusqlite::Error),

    /// Failed to run database migrations.
    #[error("database migration failed: {message}")]
    DatabaseMigration {
        /// Description of what went wrong.
        message: String,
    },

    /// The storage medium is busy, locked, full or otherwise inaccessible.
    #[error("storage unavailable: {message}")]
    StorageUnavailable {
        /// Description of the medium failure.
        message: String,
        /// Whether the medium reported exhaustion (disk full).
        exhausted: bool,
    },

    // === Configuration Errors ===
    /// Failed to load configuration.
    #[error("failed to load configuration: {0}")]
    ConfigLoad(Box<figment::Error>),

    /// Configuration validation failed.
    #[error("invalid configuration: {message}")]
    ConfigValidation {
        /// Description of the validation failure.
        message: String,
    },

    // === Runtime Errors ===
    /// The sink was unreachable or did not acknowledge the batch.
    #[error("network failure: {message}")]
    NetworkFailure {
        /// Description of what went wrong.
        message: String,
    },

    /// No position fix is available.
    #[error("position unavailable: {reason}")]
    PositionUnavailable {
        /// Why no fix could be read.
        reason: String,
    },

    /// An execution strategy's platform primitive is missing.
    #[error("capability '{capability}' unavailable: {reason}")]
    CapabilityUnavailable {
        /// Name of the missing capability.
        capability: &'static str,
        /// Why the probe failed.
        reason: String,
    },

    // === I/O Errors ===
    /// File system operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to create a required directory.
    #[error("failed to create directory {path}: {source}")]
    DirectoryCreate {
        /// Path that couldn't be created.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    // === Serialization Errors ===
    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// An internal error occurred (bug).
    #[error("internal error: {0}")]
    Internal(String),
}

/// A specialized Result type for railtrace operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Runtime failure categories surfaced to the status reporter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Storage medium inaccessible; retried on the next tick.
    StorageUnavailable,
    /// Sink unreachable or non-success; retried by the next sync trigger.
    NetworkFailure,
    /// No live fix yet; emission suppressed.
    PositionUnavailable,
    /// Strategy primitive missing; the selector falls back.
    CapabilityUnavailable,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StorageUnavailable => write!(f, "storage_unavailable"),
            Self::NetworkFailure => write!(f, "network_failure"),
            Self::PositionUnavailable => write!(f, "position_unavailable"),
            Self::CapabilityUnavailable => write!(f, "capability_unavailable"),
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        match err.sqlite_error_code() {
            Some(code @ (ErrorCode::DiskFull | ErrorCode::OutOfMemory)) => {
                Self::StorageUnavailable {
                    message: format!("{code:?}: {err}"),
                    exhausted: true,
                }
            }
            Some(
                code @ (ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::CannotOpen
                | ErrorCode::ReadOnly
                | ErrorCode::SystemIoFailure),
            ) => Self::StorageUnavailable {
                message: format!("{code:?}: {err}"),
                exhausted: false,
            },
            _ => Self::DatabaseQuery(err),
        }
    }
}

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Self::ConfigLoad(Box::new(err))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Self::NetworkFailure {
            message: err.to_string(),
        }
    }
}

impl Error {
    /// Create a new internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Create a new network failure.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkFailure {
            message: message.into(),
        }
    }

    /// Create a storage-unavailable error that is not caused by exhaustion.
    #[must_use]
    pub fn storage_unavailable(message: impl Into<String>) -> Self {
        Self::StorageUnavailable {
            message: message.into(),
            exhausted: false,
        }
    }

    /// Create a position-unavailable error.
    #[must_use]
    pub fn position_unavailable(reason: impl Into<String>) -> Self {
        Self::PositionUnavailable {
            reason: reason.into(),
        }
    }

    /// Create a capability-unavailable error.
    #[must_use]
    pub fn capability_unavailable(capability: &'static str, reason: impl Into<String>) -> Self {
        Self::CapabilityUnavailable {
            capability,
            reason: reason.into(),
        }
    }

    /// Runtime category of this error, if it belongs to one.
    #[must_use]
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::StorageUnavailable { .. } => Some(ErrorKind::StorageUnavailable),
            Self::NetworkFailure { .. } => Some(ErrorKind::NetworkFailure),
            Self::PositionUnavailable { .. } => Some(ErrorKind::PositionUnavailable),
            Self::CapabilityUnavailable { .. } => Some(ErrorKind::CapabilityUnavailable),
            _ => None,
        }
    }

    /// Whether retrying the same operation later may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::StorageUnavailable { .. }
                | Self::NetworkFailure { .. }
                | Self::PositionUnavailable { .. }
        )
    }

    /// Whether the storage medium reported exhaustion.
    #[must_use]
    pub fn is_storage_exhausted(&self) -> bool {
        matches!(
            self,
            Self::StorageUnavailable {
                exhausted: true,
                ..
            }
        )
    }
}
