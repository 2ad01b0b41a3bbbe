//! Durable record store for railtrace.
//!
//! `SQLite`-backed, append-only storage of telemetry records with a
//! per-record `delivered` flag, plus the settings table holding the
//! persisted recording session.
//!
//! Delivered records are kept (flag-and-keep) until they age out via
//! [`RecordStore::prune_delivered_older_than`] or are evicted by the growth
//! bound in [`RecordStore::evict_oldest`].
//!
//! The store is safe to share between tasks (`Arc<RecordStore>`), and
//! separate connections to the same file may be used from other execution
//! contexts; WAL mode plus a busy timeout keeps their reads consistent.

pub mod migrations;
pub mod schema;

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::record::{EventFields, Position, RecordId, RecordSource, TelemetryRecord};
use crate::session::RecordingSession;

/// Path reported by in-memory stores.
const MEMORY_PATH: &str = ":memory:";

/// How long a connection waits on a lock held by another context.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SESSION_ACTIVE_KEY: &str = "recording.active";
const SESSION_INTERVAL_KEY: &str = "recording.interval_ms";
const SESSION_STARTED_KEY: &str = "recording.started_at";

const SYNC_LEASE_HOLDER_KEY: &str = "sync.lease_holder";
const SYNC_LEASE_EXPIRES_KEY: &str = "sync.lease_expires_at";

const RECORD_COLUMNS: &str = "id, sample_id, captured_at, latitude, longitude, speed, heading, \
                              accuracy, event_json, source, fingerprint, delivered";

/// Durable store of telemetry records.
#[derive(Debug)]
pub struct RecordStore {
    /// Path to the database file.
    path: PathBuf,
    /// Database connection.
    conn: Mutex<Connection>,
    /// Lock wait applied to this and reopened connections.
    busy_timeout: Duration,
}

impl RecordStore {
    /// Open or create a store at the given path.
    ///
    /// Creates the parent directories and database file if they don't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or schema initialization fails.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_busy_timeout(path, DEFAULT_BUSY_TIMEOUT)
    }

    /// Open or create a store, waiting at most `busy_timeout` on locks held
    /// by other connections.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or schema initialization fails.
    pub fn open_with_busy_timeout(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|source| Error::DirectoryCreate {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        debug!(path = %path.display(), "Opening record store");
        let conn = Connection::open(&path).map_err(|source| Error::DatabaseOpen {
            path: path.clone(),
            source,
        })?;

        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        migrations::initialize_schema(&conn)?;

        info!(path = %path.display(), "Record store opened");
        Ok(Self {
            path,
            conn: Mutex::new(conn),
            busy_timeout,
        })
    }

    /// Create an in-memory store.
    ///
    /// In-memory stores cannot be shared with another execution context.
    ///
    /// # Errors
    ///
    /// Returns an error if the in-memory database cannot be created.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|source| Error::DatabaseOpen {
            path: PathBuf::from(MEMORY_PATH),
            source,
        })?;

        migrations::initialize_schema(&conn)?;

        Ok(Self {
            path: PathBuf::from(MEMORY_PATH),
            conn: Mutex::new(conn),
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        })
    }

    /// Open a second, independent connection to the same database.
    ///
    /// # Errors
    ///
    /// Returns `StorageUnavailable` for in-memory stores, or any error from
    /// [`RecordStore::open`].
    pub fn reopen(&self) -> Result<Self> {
        if self.is_in_memory() {
            return Err(Error::storage_unavailable(
                "in-memory store cannot be opened from another context",
            ));
        }
        Self::open_with_busy_timeout(&self.path, self.busy_timeout)
    }

    /// Get the path to the database file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether this store lives only in memory.
    #[must_use]
    pub fn is_in_memory(&self) -> bool {
        self.path.as_os_str() == MEMORY_PATH
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::internal("record store connection mutex poisoned"))
    }

    /// Append a record and return its id.
    ///
    /// A record whose fingerprint is already stored is not inserted again;
    /// the existing id is returned instead.
    ///
    /// # Errors
    ///
    /// Returns `StorageUnavailable` if the medium is inaccessible or full.
    pub fn append(&self, record: &TelemetryRecord) -> Result<RecordId> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing: Option<i64> = tx
            .query_row(
                "SELECT id FROM records WHERE fingerprint = ?1 LIMIT 1",
                [&record.fingerprint],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(id) = existing {
            debug!(
                id,
                fingerprint = &record.fingerprint[..16.min(record.fingerprint.len())],
                "Skipping duplicate record"
            );
            return Ok(RecordId(id));
        }

        let event_json = serde_json::to_string(&record.event)?;
        let position = record.position;
        tx.execute(
            r"
            INSERT INTO records (sample_id, captured_at, latitude, longitude, speed, heading,
                                 accuracy, event_json, source, fingerprint, delivered)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ",
            params![
                record.sample_id,
                record.captured_at.to_rfc3339(),
                position.map(|p| p.latitude),
                position.map(|p| p.longitude),
                position.and_then(|p| p.speed),
                position.and_then(|p| p.heading),
                position.and_then(|p| p.accuracy),
                event_json,
                record.source.to_string(),
                record.fingerprint,
                record.delivered,
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        debug!(id, sample_id = record.sample_id, "Appended record");
        Ok(RecordId(id))
    }

    /// Get a record by its id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn get(&self, id: RecordId) -> Result<Option<TelemetryRecord>> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM records WHERE id = ?1"),
                [id.0],
                Self::row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    /// All undelivered records, in insertion order.
    ///
    /// # Errors
    ///
    /// Returns `StorageUnavailable` if the medium is inaccessible.
    pub fn list_undelivered(&self) -> Result<Vec<TelemetryRecord>> {
        self.list_undelivered_batch(None)
    }

    /// The oldest `limit` undelivered records (all when `None`), in insertion order.
    ///
    /// # Errors
    ///
    /// Returns `StorageUnavailable` if the medium is inaccessible.
    pub fn list_undelivered_batch(&self, limit: Option<usize>) -> Result<Vec<TelemetryRecord>> {
        let limit_i64 = limit.map_or(-1, |l| i64::try_from(l).unwrap_or(i64::MAX));
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM records WHERE delivered = 0 ORDER BY id ASC LIMIT ?1"
        ))?;
        let records = stmt
            .query_map([limit_i64], Self::row_to_record)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// The newest `limit` undelivered records, returned in insertion order.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn recent_undelivered(&self, limit: usize) -> Result<Vec<TelemetryRecord>> {
        let limit_i64 = i64::try_from(limit).unwrap_or(i64::MAX);
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            r"
            SELECT * FROM (
                SELECT {RECORD_COLUMNS} FROM records WHERE delivered = 0
                ORDER BY id DESC LIMIT ?1
            ) ORDER BY id ASC
            "
        ))?;
        let records = stmt
            .query_map([limit_i64], Self::row_to_record)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Mark records as delivered.
    ///
    /// Idempotent: unknown or already-delivered ids are ignored. Returns the
    /// number of records that changed state.
    ///
    /// # Errors
    ///
    /// Returns `StorageUnavailable` if the medium is inaccessible.
    pub fn mark_delivered<'a>(&self, ids: impl IntoIterator<Item = &'a RecordId>) -> Result<usize> {
        let delivered_at = Utc::now().to_rfc3339();
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut changed = 0;
        {
            let mut stmt = tx.prepare(
                "UPDATE records SET delivered = 1, delivered_at = ?2 WHERE id = ?1 AND delivered = 0",
            )?;
            for id in ids {
                changed += stmt.execute(params![id.0, delivered_at])?;
            }
        }
        tx.commit()?;

        if changed > 0 {
            debug!(changed, "Marked records delivered");
        }
        Ok(changed)
    }

    /// Bound the store to at most `max_count` records.
    ///
    /// Delivered records go first, oldest first; after that the oldest
    /// undelivered records are evicted and their data is lost. Returns the
    /// number of records removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn evict_oldest(&self, max_count: usize) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let total: i64 = tx.query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))?;
        let max_i64 = i64::try_from(max_count).unwrap_or(i64::MAX);
        let excess = total - max_i64;
        if excess <= 0 {
            return Ok(0);
        }

        let undelivered_before: i64 = tx.query_row(
            "SELECT COUNT(*) FROM records WHERE delivered = 0",
            [],
            |row| row.get(0),
        )?;
        let evicted = tx.execute(
            r"
            DELETE FROM records WHERE id IN (
                SELECT id FROM records ORDER BY delivered DESC, id ASC LIMIT ?1
            )
            ",
            [excess],
        )?;
        let undelivered_after: i64 = tx.query_row(
            "SELECT COUNT(*) FROM records WHERE delivered = 0",
            [],
            |row| row.get(0),
        )?;
        tx.commit()?;

        let lost = undelivered_before - undelivered_after;
        if lost > 0 {
            warn!(
                evicted,
                lost, max_count, "Evicted undelivered records to bound store growth"
            );
        } else {
            info!(evicted, max_count, "Evicted delivered records");
        }
        Ok(evicted)
    }

    /// Delete delivered records acknowledged more than `max_age` ago.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn prune_delivered_older_than(&self, max_age: chrono::Duration) -> Result<usize> {
        let cutoff = (Utc::now() - max_age).to_rfc3339();
        let conn = self.conn()?;
        let affected = conn.execute(
            "DELETE FROM records WHERE delivered = 1 AND delivered_at < ?1",
            [cutoff],
        )?;

        if affected > 0 {
            info!(affected, "Pruned delivered records");
        }
        Ok(affected)
    }

    /// Count all records.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn count(&self) -> Result<i64> {
        let conn = self.conn()?;
        let count = conn.query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Count undelivered records.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn count_undelivered(&self) -> Result<i64> {
        let conn = self.conn()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM records WHERE delivered = 0",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Get store statistics.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn stats(&self) -> Result<StoreStats> {
        let conn = self.conn()?;
        let (total_records, undelivered_records, oldest, newest): (
            i64,
            i64,
            Option<String>,
            Option<String>,
        ) = conn.query_row(
            r"
            SELECT COUNT(*), COALESCE(SUM(delivered = 0), 0), MIN(captured_at), MAX(captured_at)
            FROM records
            ",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )?;
        drop(conn);

        let parse = |s: Option<String>| {
            s.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                .map(|dt| dt.with_timezone(&Utc))
        };

        let db_size_bytes = if self.is_in_memory() {
            0
        } else {
            std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
        };

        Ok(StoreStats {
            total_records,
            undelivered_records,
            oldest_capture: parse(oldest),
            newest_capture: parse(newest),
            db_size_bytes,
        })
    }

    /// Persist the recording session.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn save_session(&self, session: &RecordingSession) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        {
            let mut upsert =
                tx.prepare("INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)")?;
            upsert.execute((SESSION_ACTIVE_KEY, session.active.to_string()))?;
            upsert.execute((SESSION_INTERVAL_KEY, session.interval_ms().to_string()))?;
            match session.started_at {
                Some(at) => {
                    upsert.execute((SESSION_STARTED_KEY, at.to_rfc3339()))?;
                }
                None => {
                    tx.execute("DELETE FROM settings WHERE key = ?1", [SESSION_STARTED_KEY])?;
                }
            }
        }
        tx.commit()?;
        debug!(
            active = session.active,
            interval_ms = session.interval_ms(),
            "Saved recording session"
        );
        Ok(())
    }

    /// Load the persisted recording session, if one was ever saved.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn load_session(&self) -> Result<Option<RecordingSession>> {
        let conn = self.conn()?;
        let get = |key: &str| -> Result<Option<String>> {
            Ok(conn
                .query_row("SELECT value FROM settings WHERE key = ?1", [key], |row| {
                    row.get(0)
                })
                .optional()?)
        };

        let Some(active) = get(SESSION_ACTIVE_KEY)? else {
            return Ok(None);
        };
        let interval_ms: u64 = match get(SESSION_INTERVAL_KEY)?.map(|v| v.parse()) {
            Some(Ok(ms)) => ms,
            Some(Err(_)) | None => {
                warn!("Persisted session has no valid interval, ignoring it");
                return Ok(None);
            }
        };
        let started_at = get(SESSION_STARTED_KEY)?
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc));

        Ok(Some(RecordingSession {
            active: active == "true",
            interval: Duration::from_millis(interval_ms),
            started_at,
        }))
    }

    /// Mark the persisted session inactive, keeping its interval.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn clear_session(&self) -> Result<()> {
        match self.load_session()? {
            Some(session) => self.save_session(&session.stopped()),
            None => Ok(()),
        }
    }

    /// Claim the sync lease for `holder` until `ttl` from now.
    ///
    /// The lease is shared by every connection to the database file, so a
    /// sync started from another process holds it too. Returns `false` if a
    /// different holder owns an unexpired lease. The same holder may renew.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn try_acquire_sync_lease(&self, holder: &str, ttl: Duration) -> Result<bool> {
        self.try_acquire_sync_lease_at(holder, ttl, Utc::now())
    }

    fn try_acquire_sync_lease_at(
        &self,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| Error::internal(format!("invalid lease ttl: {e}")))?;
        let expires_at = now
            .checked_add_signed(ttl)
            .ok_or_else(|| Error::internal("lease expiry out of range"))?;

        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let get = |key: &str| -> Result<Option<String>> {
            Ok(tx
                .query_row("SELECT value FROM settings WHERE key = ?1", [key], |row| {
                    row.get(0)
                })
                .optional()?)
        };

        if let Some(current) = get(SYNC_LEASE_HOLDER_KEY)? {
            let held_until = get(SYNC_LEASE_EXPIRES_KEY)?
                .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                .map(|dt| dt.with_timezone(&Utc));
            if current != holder && held_until.is_some_and(|until| until > now) {
                debug!(holder = %current, "Sync lease held elsewhere");
                return Ok(false);
            }
        }

        {
            let mut upsert =
                tx.prepare("INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)")?;
            upsert.execute((SYNC_LEASE_HOLDER_KEY, holder))?;
            upsert.execute((SYNC_LEASE_EXPIRES_KEY, expires_at.to_rfc3339()))?;
        }
        tx.commit()?;
        Ok(true)
    }

    /// Release the sync lease if `holder` owns it.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn release_sync_lease(&self, holder: &str) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let released = tx.execute(
            "DELETE FROM settings WHERE key = ?1 AND value = ?2",
            (SYNC_LEASE_HOLDER_KEY, holder),
        )?;
        if released > 0 {
            tx.execute("DELETE FROM settings WHERE key = ?1", [SYNC_LEASE_EXPIRES_KEY])?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Convert a database row to a record.
    fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<TelemetryRecord> {
        let id: i64 = row.get(0)?;
        let sample_id: i64 = row.get(1)?;
        let captured_at_str: String = row.get(2)?;
        let latitude: Option<f64> = row.get(3)?;
        let longitude: Option<f64> = row.get(4)?;
        let speed: Option<f64> = row.get(5)?;
        let heading: Option<f64> = row.get(6)?;
        let accuracy: Option<f64> = row.get(7)?;
        let event_json: String = row.get(8)?;
        let source_str: String = row.get(9)?;
        let fingerprint: String = row.get(10)?;
        let delivered: bool = row.get(11)?;

        let captured_at = DateTime::parse_from_rfc3339(&captured_at_str)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
            })?;

        let position = match (latitude, longitude) {
            (Some(latitude), Some(longitude)) => Some(Position {
                latitude,
                longitude,
                speed,
                heading,
                accuracy,
            }),
            _ => None,
        };

        let event: EventFields = serde_json::from_str(&event_json).unwrap_or_else(|e| {
            warn!(id, error = %e, "Unreadable event fields, using defaults");
            EventFields::default()
        });

        let source = source_str.parse::<RecordSource>().unwrap_or_else(|e: String| {
            warn!(id, error = %e, "Unknown record source, defaulting to live");
            RecordSource::Live
        });

        Ok(TelemetryRecord {
            id: Some(RecordId(id)),
            sample_id,
            captured_at,
            position,
            event,
            source,
            fingerprint,
            delivered,
        })
    }
}

/// Statistics about the store.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct StoreStats {
    /// Total number of records stored.
    pub total_records: i64,
    /// Records not yet acknowledged by the sink.
    pub undelivered_records: i64,
    /// Capture time of the oldest record.
    pub oldest_capture: Option<DateTime<Utc>>,
    /// Capture time of the newest record.
    pub newest_capture: Option<DateTime<Utc>>,
    /// Size of the database file in bytes.
    pub db_size_bytes: u64,
}
