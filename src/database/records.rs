//! Anrufprotokoll
//!
//! Jeder beendete Anruf erzeugt genau einen [`CallRecord`]. Der [`CallLog`]
//! hält die letzten N Einträge im Speicher und spiegelt sie in einen
//! [`CallHistoryStore`].

use super::DatabaseError;
use crate::call_engine::{CallDirection, MediaKind, RemoteParty};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

// ============================================================================
// CALL RECORD
// ============================================================================

/// Ausgang eines Anrufs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallOutcome {
    Completed,
    Missed,
    Rejected,
    Failed,
}

impl CallOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Missed => "missed",
            Self::Rejected => "rejected",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for CallOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CallOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(Self::Completed),
            "missed" => Ok(Self::Missed),
            "rejected" => Ok(Self::Rejected),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown call outcome '{other}'")),
        }
    }
}

/// Unveränderlicher Eintrag im Anrufverlauf
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    pub id: Uuid,
    pub call_id: String,
    pub remote: RemoteParty,
    pub direction: CallDirection,
    pub kind: MediaKind,
    pub outcome: CallOutcome,
    /// Gesprächsdauer ab Annahme, 0 wenn nie angenommen
    pub duration_secs: u64,
    pub timestamp: DateTime<Utc>,
}

impl CallRecord {
    pub fn new(
        call_id: impl Into<String>,
        remote: RemoteParty,
        direction: CallDirection,
        kind: MediaKind,
        outcome: CallOutcome,
        duration_secs: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            call_id: call_id.into(),
            remote,
            direction,
            kind,
            outcome,
            duration_secs,
            timestamp: Utc::now(),
        }
    }
}

// ============================================================================
// STORE
// ============================================================================

/// Dauerhafte Ablage für Anrufeinträge
pub trait CallHistoryStore: Send + Sync {
    fn append(&self, record: &CallRecord) -> Result<(), DatabaseError>;

    /// Die neuesten `limit` Einträge, neueste zuerst
    fn recent(&self, limit: usize) -> Result<Vec<CallRecord>, DatabaseError>;
}

/// Store ohne Persistenz, z.B. für Tests oder ohne Datenverzeichnis
#[derive(Debug, Default)]
pub struct MemoryHistoryStore {
    records: Mutex<Vec<CallRecord>>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl CallHistoryStore for MemoryHistoryStore {
    fn append(&self, record: &CallRecord) -> Result<(), DatabaseError> {
        self.records.lock().push(record.clone());
        Ok(())
    }

    fn recent(&self, limit: usize) -> Result<Vec<CallRecord>, DatabaseError> {
        Ok(self.records.lock().iter().rev().take(limit).cloned().collect())
    }
}

// ============================================================================
// CALL LOG
// ============================================================================

pub struct CallLog {
    records: Mutex<VecDeque<CallRecord>>,
    limit: usize,
    store: Option<Arc<dyn CallHistoryStore>>,
}

impl CallLog {
    /// Reiner In-Memory-Verlauf
    pub fn new(limit: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::with_capacity(limit)),
            limit,
            store: None,
        }
    }

    /// Lädt die letzten Einträge aus dem Store und spiegelt neue dorthin
    pub fn load(store: Arc<dyn CallHistoryStore>, limit: usize) -> Result<Self, DatabaseError> {
        let existing = store.recent(limit)?;
        tracing::debug!("Loaded {} call record(s) from history", existing.len());

        Ok(Self {
            records: Mutex::new(existing.into_iter().collect()),
            limit,
            store: Some(store),
        })
    }

    /// Fügt einen Eintrag vorne an
    ///
    /// Ein zweiter Eintrag für dieselbe `call_id` wird ignoriert; gibt zurück,
    /// ob der Eintrag übernommen wurde. Store-Fehler werden nur geloggt.
    pub fn append(&self, record: CallRecord) -> bool {
        {
            let mut records = self.records.lock();
            if records.iter().any(|r| r.call_id == record.call_id) {
                tracing::debug!("Call {} already recorded", record.call_id);
                return false;
            }
            records.push_front(record.clone());
            records.truncate(self.limit);
        }

        tracing::info!(
            "Call {} with {} recorded as {} ({}s)",
            record.call_id,
            record.remote.label(),
            record.outcome,
            record.duration_secs
        );

        if let Some(store) = &self.store {
            if let Err(e) = store.append(&record) {
                tracing::error!("Failed to persist call record {}: {}", record.id, e);
            }
        }
        true
    }

    /// Alle Einträge, neueste zuerst
    pub fn records(&self) -> Vec<CallRecord> {
        self.records.lock().iter().cloned().collect()
    }

    pub fn latest(&self) -> Option<CallRecord> {
        self.records.lock().front().cloned()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

impl fmt::Debug for CallLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallLog")
            .field("len", &self.len())
            .field("limit", &self.limit)
            .field("persistent", &self.store.is_some())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
