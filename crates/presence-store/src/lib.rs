//! presence-store — Durable identity registry and attendance ledger.
//!
//! SQLite via `rusqlite`, with optional AES-256-GCM encryption of the
//! stored face embeddings.

pub mod codec;
pub mod sqlite;

pub use codec::EmbeddingCipher;
pub use sqlite::SqliteStore;

use std::path::PathBuf;

/// Default database location: `$XDG_DATA_HOME/presence/attendance.db`.
pub fn default_db_path() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("presence")
        .join("attendance.db")
}
