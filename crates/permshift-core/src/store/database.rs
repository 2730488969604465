//! SQLite-backed revert history

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::report::Counts;
use crate::store::MetadataStore;
use crate::{
    BatchId, BatchKind, BatchRecord, BatchState, Mode, NodeKind, NodeState, Ownership, Snapshot,
    Target,
};

const BATCH_COLUMNS: &str = "id, kind, reverts, root, target_json, max_depth, state, \
     started_at, ended_at, changed, unchanged, errored, not_attempted, seen, fault";

const SNAPSHOT_COLUMNS: &str =
    "batch_id, path, kind, owner_user, owner_group, mode, captured_at";

/// Snapshot and batch history in a single SQLite file.
///
/// The connection is shared by every worker of a batch, so it lives behind a
/// mutex; each statement runs in autocommit mode.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl SqliteStore {
    /// Open or create a history database at the specified path
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let db_path = path.as_ref().to_path_buf();

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        let conn = Connection::open(&db_path)?;
        conn.busy_timeout(Duration::from_secs(5))?;

        let store = Self {
            conn: Mutex::new(conn),
            db_path,
        };
        store.initialize_schema()?;

        tracing::debug!("Opened history database at {}", store.db_path.display());
        Ok(store)
    }

    /// Get the default database path (~/.permshift/history.db)
    pub fn default_path() -> StoreResult<PathBuf> {
        let home = dirs::home_dir().ok_or(StoreError::NoHomeDirectory)?;
        Ok(home.join(".permshift").join("history.db"))
    }

    /// Get the database file path
    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn initialize_schema(&self) -> StoreResult<()> {
        self.conn()?.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS batches (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                reverts TEXT,
                root BLOB,
                target_json TEXT,
                max_depth INTEGER,
                state TEXT NOT NULL,
                started_at TEXT NOT NULL,
                ended_at TEXT,
                changed INTEGER NOT NULL DEFAULT 0,
                unchanged INTEGER NOT NULL DEFAULT 0,
                errored INTEGER NOT NULL DEFAULT 0,
                not_attempted INTEGER NOT NULL DEFAULT 0,
                seen INTEGER NOT NULL DEFAULT 0,
                fault TEXT
            );

            CREATE TABLE IF NOT EXISTS snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                batch_id TEXT NOT NULL,
                path BLOB NOT NULL,
                kind TEXT NOT NULL,
                owner_user TEXT NOT NULL,
                owner_group TEXT NOT NULL,
                mode INTEGER NOT NULL,
                captured_at TEXT NOT NULL,
                UNIQUE (batch_id, path)
            );

            CREATE INDEX IF NOT EXISTS idx_batches_started_at
                ON batches(started_at DESC);

            CREATE INDEX IF NOT EXISTS idx_snapshots_batch
                ON snapshots(batch_id);

            CREATE INDEX IF NOT EXISTS idx_snapshots_path
                ON snapshots(path);
            "#,
        )?;
        Ok(())
    }

    fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable("connection lock poisoned".to_string()))
    }

    /// Number of snapshots across all batches
    pub fn snapshot_count(&self) -> StoreResult<usize> {
        let count: i64 = self
            .conn()?
            .query_row("SELECT COUNT(*) FROM snapshots", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn query_batch(&self, id: &str) -> StoreResult<Option<BatchRecord>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM batches WHERE id = ?1", BATCH_COLUMNS);
        let row = conn
            .query_row(&sql, params![id], BatchRow::read)
            .optional()?;
        row.map(BatchRow::into_record).transpose()
    }

    fn query_snapshots(&self, filter: &str, key: &dyn rusqlite::ToSql) -> StoreResult<Vec<Snapshot>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM snapshots WHERE {}", SNAPSHOT_COLUMNS, filter);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([key], SnapshotRow::read)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(SnapshotRow::into_snapshot).collect()
    }
}

impl MetadataStore for SqliteStore {
    fn begin_batch(&self, record: &BatchRecord) -> StoreResult<()> {
        let target_json = record
            .target
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let (kind, reverts) = match record.kind {
            BatchKind::Change => ("change", None),
            BatchKind::Revert { of } => ("revert", Some(of.to_string())),
        };

        self.conn()?.execute(
            r#"
            INSERT INTO batches (
                id, kind, reverts, root, target_json, max_depth,
                state, started_at, ended_at,
                changed, unchanged, errored, not_attempted, seen, fault
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            "#,
            params![
                record.id.to_string(),
                kind,
                reverts,
                record.root.as_deref().map(path_to_blob),
                target_json,
                record.max_depth.map(|d| d as i64),
                record.state.as_str(),
                timestamp(&record.started_at),
                record.ended_at.as_ref().map(timestamp),
                record.counts.changed as i64,
                record.counts.unchanged as i64,
                record.counts.errored as i64,
                record.counts.not_attempted as i64,
                record.counts.seen as i64,
                record.fault,
            ],
        )?;

        tracing::debug!("Recorded batch {} ({})", record.id, record.kind);
        Ok(())
    }

    fn finish_batch(&self, record: &BatchRecord) -> StoreResult<()> {
        let rows_affected = self.conn()?.execute(
            r#"
            UPDATE batches SET
                state = ?2, ended_at = ?3,
                changed = ?4, unchanged = ?5, errored = ?6,
                not_attempted = ?7, seen = ?8, fault = ?9
            WHERE id = ?1
            "#,
            params![
                record.id.to_string(),
                record.state.as_str(),
                record.ended_at.as_ref().map(timestamp),
                record.counts.changed as i64,
                record.counts.unchanged as i64,
                record.counts.errored as i64,
                record.counts.not_attempted as i64,
                record.counts.seen as i64,
                record.fault,
            ],
        )?;

        if rows_affected == 0 {
            return Err(StoreError::MissingBatch(record.id));
        }
        Ok(())
    }

    fn insert_snapshot(&self, snapshot: &Snapshot) -> StoreResult<()> {
        self.conn()?.execute(
            r#"
            INSERT INTO snapshots (
                batch_id, path, kind, owner_user, owner_group, mode, captured_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                snapshot.batch_id.to_string(),
                path_to_blob(&snapshot.path),
                snapshot.kind.as_str(),
                snapshot.before.owner.user,
                snapshot.before.owner.group,
                snapshot.before.mode.bits() as i64,
                timestamp(&snapshot.captured_at),
            ],
        )?;
        Ok(())
    }

    fn rollback_snapshot(&self, batch_id: BatchId, path: &Path) -> StoreResult<()> {
        self.conn()?.execute(
            "DELETE FROM snapshots WHERE batch_id = ?1 AND path = ?2",
            params![batch_id.to_string(), path_to_blob(path)],
        )?;
        Ok(())
    }

    fn snapshots_for_batch(&self, batch_id: BatchId) -> StoreResult<Vec<Snapshot>> {
        let mut snapshots = self.query_snapshots("batch_id = ?1", &batch_id.to_string())?;
        // BLOB ordering is bytewise, PathBuf ordering is by component
        snapshots.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(snapshots)
    }

    fn has_snapshots(&self, batch_id: BatchId) -> StoreResult<bool> {
        let exists: bool = self.conn()?.query_row(
            "SELECT EXISTS(SELECT 1 FROM snapshots WHERE batch_id = ?1)",
            params![batch_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    fn snapshot_for(&self, batch_id: BatchId, path: &Path) -> StoreResult<Option<Snapshot>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM snapshots WHERE batch_id = ?1 AND path = ?2",
            SNAPSHOT_COLUMNS
        );
        let row = conn
            .query_row(
                &sql,
                params![batch_id.to_string(), path_to_blob(path)],
                SnapshotRow::read,
            )
            .optional()?;
        row.map(SnapshotRow::into_snapshot).transpose()
    }

    fn history_for_path(&self, path: &Path) -> StoreResult<Vec<Snapshot>> {
        self.query_snapshots("path = ?1 ORDER BY captured_at ASC, id ASC", &path_to_blob(path))
    }

    fn list_batches(&self) -> StoreResult<Vec<BatchRecord>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM batches ORDER BY started_at DESC, rowid DESC",
            BATCH_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], BatchRow::read)?
            .collect::<Result<Vec<_>, _>>()?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let id = row.id.clone();
            match row.into_record() {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!("Skipping unreadable batch {}: {}", id, e),
            }
        }
        Ok(records)
    }

    fn find_batch(&self, id_or_prefix: &str) -> StoreResult<Option<BatchRecord>> {
        let prefix = id_or_prefix.trim().to_ascii_lowercase();
        if prefix.is_empty() || !prefix.chars().all(|c| c.is_ascii_hexdigit() || c == '-') {
            return Ok(None);
        }

        if let Some(record) = self.query_batch(&prefix)? {
            return Ok(Some(record));
        }

        let rows = {
            let conn = self.conn()?;
            let sql = format!("SELECT {} FROM batches WHERE id LIKE ?1 LIMIT 2", BATCH_COLUMNS);
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![format!("{}%", prefix)], BatchRow::read)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        match rows.len() {
            0 => Ok(None),
            1 => rows.into_iter().next().map(BatchRow::into_record).transpose(),
            _ => Err(StoreError::AmbiguousBatch(id_or_prefix.to_string())),
        }
    }
}

struct BatchRow {
    id: String,
    kind: String,
    reverts: Option<String>,
    root: Option<Vec<u8>>,
    target_json: Option<String>,
    max_depth: Option<i64>,
    state: String,
    started_at: String,
    ended_at: Option<String>,
    counts: [i64; 5],
    fault: Option<String>,
}

impl BatchRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            kind: row.get(1)?,
            reverts: row.get(2)?,
            root: row.get(3)?,
            target_json: row.get(4)?,
            max_depth: row.get(5)?,
            state: row.get(6)?,
            started_at: row.get(7)?,
            ended_at: row.get(8)?,
            counts: [
                row.get(9)?,
                row.get(10)?,
                row.get(11)?,
                row.get(12)?,
                row.get(13)?,
            ],
            fault: row.get(14)?,
        })
    }

    fn into_record(self) -> StoreResult<BatchRecord> {
        let kind = match (self.kind.as_str(), self.reverts) {
            ("change", _) => BatchKind::Change,
            ("revert", Some(of)) => BatchKind::Revert {
                of: Uuid::parse_str(&of)?,
            },
            (other, _) => {
                return Err(StoreError::Corrupt(format!("unknown batch kind '{}'", other)))
            }
        };

        let state = BatchState::parse(&self.state)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown batch state '{}'", self.state)))?;

        let target: Option<Target> = self
            .target_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;

        let [changed, unchanged, errored, not_attempted, seen] = self.counts;

        Ok(BatchRecord {
            id: Uuid::parse_str(&self.id)?,
            kind,
            root: self.root.map(path_from_blob),
            target,
            max_depth: self.max_depth.map(|d| d as usize),
            state,
            started_at: parse_timestamp(&self.started_at)?,
            ended_at: self.ended_at.as_deref().map(parse_timestamp).transpose()?,
            counts: Counts {
                changed: changed as u64,
                unchanged: unchanged as u64,
                errored: errored as u64,
                not_attempted: not_attempted as u64,
                seen: seen as u64,
            },
            fault: self.fault,
        })
    }
}

struct SnapshotRow {
    batch_id: String,
    path: Vec<u8>,
    kind: String,
    owner_user: String,
    owner_group: String,
    mode: i64,
    captured_at: String,
}

impl SnapshotRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            batch_id: row.get(0)?,
            path: row.get(1)?,
            kind: row.get(2)?,
            owner_user: row.get(3)?,
            owner_group: row.get(4)?,
            mode: row.get(5)?,
            captured_at: row.get(6)?,
        })
    }

    fn into_snapshot(self) -> StoreResult<Snapshot> {
        let kind = NodeKind::parse(&self.kind)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown node kind '{}'", self.kind)))?;

        Ok(Snapshot {
            batch_id: Uuid::parse_str(&self.batch_id)?,
            path: path_from_blob(self.path),
            kind,
            before: NodeState::new(
                Ownership::new(self.owner_user, self.owner_group),
                Mode::from_bits(self.mode as u32),
            ),
            captured_at: parse_timestamp(&self.captured_at)?,
        })
    }
}

fn timestamp(at: &DateTime<Utc>) -> String {
    // Fixed width keeps lexical order equal to time order
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(value: &str) -> StoreResult<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)?.with_timezone(&Utc))
}

#[cfg(unix)]
fn path_to_blob(path: &Path) -> Vec<u8> {
    use std::os::unix::ffi::OsStrExt;
    path.as_os_str().as_bytes().to_vec()
}

#[cfg(unix)]
fn path_from_blob(bytes: Vec<u8>) -> PathBuf {
    use std::os::unix::ffi::OsStringExt;
    PathBuf::from(std::ffi::OsString::from_vec(bytes))
}

#[cfg(not(unix))]
fn path_to_blob(path: &Path) -> Vec<u8> {
    path.to_string_lossy().into_owned().into_bytes()
}

#[cfg(not(unix))]
fn path_from_blob(bytes: Vec<u8>) -> PathBuf {
    PathBuf::from(String::from_utf8_lossy(&bytes).into_owned())
}
