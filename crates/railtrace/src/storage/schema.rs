//! `SQLite` schema definitions for railtrace.

/// SQL statement to create the records table.
///
/// `id` is the insertion sequence; `sample_id` is the time-based capture
/// identifier and is deliberately not unique.
pub const CREATE_RECORDS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    sample_id INTEGER NOT NULL,
    captured_at TEXT NOT NULL,
    latitude REAL,
    longitude REAL,
    speed REAL,
    heading REAL,
    accuracy REAL,
    event_json TEXT NOT NULL,
    source TEXT NOT NULL,
    fingerprint TEXT NOT NULL,
    delivered INTEGER NOT NULL DEFAULT 0,
    delivered_at TEXT,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
)
";

/// Index backing undelivered lookups in insertion order.
pub const CREATE_DELIVERED_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_records_delivered ON records(delivered, id)
";

/// Index on `fingerprint` for duplicate detection.
pub const CREATE_FINGERPRINT_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_records_fingerprint ON records(fingerprint)
";

/// Index on `captured_at` for time-based statistics.
pub const CREATE_CAPTURED_AT_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_records_captured_at ON records(captured_at)
";

/// Small key-value table holding the persisted recording session.
pub const CREATE_SETTINGS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
";

/// SQL statement to create the metadata table for storing key-value pairs.
pub const CREATE_METADATA_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS metadata (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
";

/// All schema creation statements in order.
pub const SCHEMA_STATEMENTS: &[&str] = &[
    CREATE_RECORDS_TABLE,
    CREATE_DELIVERED_INDEX,
    CREATE_FINGERPRINT_INDEX,
    CREATE_CAPTURED_AT_INDEX,
    CREATE_SETTINGS_TABLE,
    CREATE_METADATA_TABLE,
];
