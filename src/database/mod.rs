//! Database Module - Anrufverlauf
//!
//! - [`CallLog`]: begrenzter In-Memory-Verlauf (neueste zuerst)
//! - [`CallHistoryStore`]: dauerhafte Ablage, Standard ist SQLite

mod call_history;
mod records;

pub use call_history::SqliteCallHistory;
pub use records::{CallHistoryStore, CallLog, CallOutcome, CallRecord, MemoryHistoryStore};

use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to create database directory: {0}")]
    DirectoryCreation(#[from] std::io::Error),

    #[error("Could not determine app data directory")]
    NoDataDirectory,
}
