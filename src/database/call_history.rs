//! Call History Database
//!
//! SQLite-Datenbank für den Anrufverlauf. Es werden nur die neuesten
//! `limit` Einträge behalten.

use super::records::{CallHistoryStore, CallOutcome, CallRecord};
use super::DatabaseError;
use crate::call_engine::{CallDirection, MediaKind, RemoteParty};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, Result as SqliteResult, Row};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// SQLite-Ablage für [`CallRecord`]s (Thread-safe durch Mutex)
pub struct SqliteCallHistory {
    conn: Mutex<Connection>,
    limit: usize,
}

impl SqliteCallHistory {
    /// Öffnet oder erstellt die Datenbank im App-Datenverzeichnis
    pub fn open(limit: usize) -> Result<Self, DatabaseError> {
        let db_path = Self::get_database_path()?;
        Self::open_at(&db_path, limit)
    }

    /// Öffnet oder erstellt die Datenbank unter `path`
    pub fn open_at(path: &Path, limit: usize) -> Result<Self, DatabaseError> {
        // Parent-Verzeichnis erstellen
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        tracing::info!("Opening call history at {:?}", path);

        let conn = Connection::open(path)?;
        Self::with_connection(conn, limit)
    }

    /// In-Memory Datenbank für Tests
    #[cfg(test)]
    pub fn open_in_memory(limit: usize) -> Result<Self, DatabaseError> {
        Self::with_connection(Connection::open_in_memory()?, limit)
    }

    fn with_connection(conn: Connection, limit: usize) -> Result<Self, DatabaseError> {
        let db = Self {
            conn: Mutex::new(conn),
            limit,
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Ermittelt den Pfad zur Datenbank-Datei
    fn get_database_path() -> Result<PathBuf, DatabaseError> {
        let proj_dirs = directories::ProjectDirs::from("com", "shopfloor", "shopfloor-rtc")
            .ok_or(DatabaseError::NoDataDirectory)?;

        let mut path = proj_dirs.data_dir().to_path_buf();
        path.push("call_history.db");
        Ok(path)
    }

    fn init_schema(&self) -> Result<(), DatabaseError> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS call_history (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                record_id TEXT NOT NULL UNIQUE,
                call_id TEXT NOT NULL,
                remote_user_id TEXT NOT NULL,
                remote_name TEXT,
                direction TEXT NOT NULL,
                kind TEXT NOT NULL,
                outcome TEXT NOT NULL,
                duration_secs INTEGER NOT NULL DEFAULT 0,
                timestamp TEXT NOT NULL
            )
            "#,
            [],
        )?;

        conn.execute(
            r#"
            CREATE INDEX IF NOT EXISTS idx_call_history_call_id ON call_history(call_id)
            "#,
            [],
        )?;

        Ok(())
    }

    /// Löscht alles jenseits der neuesten `limit` Einträge
    fn prune(conn: &Connection, limit: usize) -> Result<usize, DatabaseError> {
        let removed = conn.execute(
            r#"
            DELETE FROM call_history
            WHERE seq NOT IN (
                SELECT seq FROM call_history ORDER BY seq DESC LIMIT ?1
            )
            "#,
            params![limit as i64],
        )?;
        Ok(removed)
    }

    pub fn count(&self) -> Result<usize, DatabaseError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM call_history", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Löscht den gesamten Verlauf
    pub fn clear(&self) -> Result<(), DatabaseError> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM call_history", [])?;
        Ok(())
    }
}

impl CallHistoryStore for SqliteCallHistory {
    fn append(&self, record: &CallRecord) -> Result<(), DatabaseError> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO call_history
                (record_id, call_id, remote_user_id, remote_name, direction, kind,
                 outcome, duration_secs, timestamp)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(record_id) DO NOTHING
            "#,
            params![
                record.id.to_string(),
                record.call_id,
                record.remote.user_id,
                record.remote.display_name,
                direction_str(record.direction),
                record.kind.to_string(),
                record.outcome.as_str(),
                record.duration_secs as i64,
                record.timestamp.to_rfc3339(),
            ],
        )?;

        let removed = Self::prune(&conn, self.limit)?;
        if removed > 0 {
            tracing::debug!("Pruned {} old call record(s)", removed);
        }
        Ok(())
    }

    fn recent(&self, limit: usize) -> Result<Vec<CallRecord>, DatabaseError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT record_id, call_id, remote_user_id, remote_name, direction, kind,
                   outcome, duration_secs, timestamp
            FROM call_history
            ORDER BY seq DESC
            LIMIT ?1
            "#,
        )?;

        let records = stmt
            .query_map(params![limit as i64], record_from_row)?
            .collect::<SqliteResult<Vec<CallRecord>>>()?;

        Ok(records)
    }
}

impl std::fmt::Debug for SqliteCallHistory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteCallHistory")
            .field("limit", &self.limit)
            .finish()
    }
}

// ============================================================================
// ROW MAPPING
// ============================================================================

fn direction_str(direction: CallDirection) -> &'static str {
    match direction {
        CallDirection::Outgoing => "outgoing",
        CallDirection::Incoming => "incoming",
    }
}

fn invalid_column(index: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn record_from_row(row: &Row<'_>) -> SqliteResult<CallRecord> {
    let id: String = row.get(0)?;
    let id = Uuid::parse_str(&id).map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))?;

    let direction = match row.get::<_, String>(4)?.as_str() {
        "outgoing" => CallDirection::Outgoing,
        "incoming" => CallDirection::Incoming,
        other => return Err(invalid_column(4, format!("unknown direction '{other}'"))),
    };

    let kind = match row.get::<_, String>(5)?.as_str() {
        "audio" => MediaKind::Audio,
        "video" => MediaKind::Video,
        other => return Err(invalid_column(5, format!("unknown media kind '{other}'"))),
    };

    let outcome: CallOutcome = row
        .get::<_, String>(6)?
        .parse()
        .map_err(|e: String| invalid_column(6, e))?;

    let timestamp: String = row.get(8)?;
    let timestamp = DateTime::parse_from_rfc3339(&timestamp)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(8, Type::Text, Box::new(e)))?
        .with_timezone(&Utc);

    Ok(CallRecord {
        id,
        call_id: row.get(1)?,
        remote: RemoteParty {
            user_id: row.get(2)?,
            display_name: row.get(3)?,
        },
        direction,
        kind,
        outcome,
        duration_secs: row.get::<_, i64>(7)?.max(0) as u64,
        timestamp,
    })
}

// ============================================================================
// TESTS
// ============================================================================
