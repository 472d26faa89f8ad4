//! SQLite-backed identity registry and attendance ledger.

use crate::codec::{self, EmbeddingCipher};
use chrono::{DateTime, Utc};
use presence_core::{
    AttendanceLedger, CoreError, EmbeddingStore, Identity, IdentityId, LedgerSummary, Result,
    Session, SessionEvent, SessionId, Store,
};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;

const SCHEMA_VERSION: i32 = 1;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS persons (
    identity_id   INTEGER PRIMARY KEY,
    name          TEXT,
    embedding     BLOB NOT NULL,
    registered_at TEXT NOT NULL,
    last_seen     TEXT NOT NULL,
    visit_count   INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS attendance (
    session_id       INTEGER PRIMARY KEY,
    identity_id      INTEGER NOT NULL REFERENCES persons(identity_id),
    check_in         TEXT NOT NULL,
    check_out        TEXT,
    session_duration REAL
);
CREATE INDEX IF NOT EXISTS idx_attendance_identity ON attendance(identity_id);
CREATE INDEX IF NOT EXISTS idx_attendance_open ON attendance(session_id) WHERE check_out IS NULL;
";

const PERSON_COLUMNS: &str =
    "identity_id, name, embedding, registered_at, last_seen, visit_count";
const SESSION_COLUMNS: &str = "session_id, identity_id, check_in, check_out";

fn storage_err(e: rusqlite::Error) -> CoreError {
    CoreError::StorageUnavailable(e.to_string())
}

/// Durable store over a single SQLite connection.
///
/// Single-writer: the pipeline owns the only mutable handle. Readers such
/// as the CLI open their own connection; WAL mode keeps them from blocking
/// the writer.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Connection,
    cipher: Option<EmbeddingCipher>,
    in_transaction: bool,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: &Path, cipher: Option<EmbeddingCipher>) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                CoreError::StorageUnavailable(format!("create {}: {e}", parent.display()))
            })?;
        }
        let conn = Connection::open(path).map_err(storage_err)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(storage_err)?;
        let store = Self::init(conn, cipher)?;
        tracing::info!(
            path = %path.display(),
            encrypted = store.cipher.is_some(),
            "opened attendance database"
        );
        Ok(store)
    }

    /// Private in-memory database.
    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().map_err(storage_err)?, None)
    }

    fn init(conn: Connection, cipher: Option<EmbeddingCipher>) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys=ON;").map_err(storage_err)?;

        let version: i32 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .map_err(storage_err)?;
        if version > SCHEMA_VERSION {
            return Err(CoreError::StorageUnavailable(format!(
                "database schema version {version} is newer than supported {SCHEMA_VERSION}"
            )));
        }
        conn.execute_batch(SCHEMA).map_err(storage_err)?;
        conn.execute_batch(&format!("PRAGMA user_version = {SCHEMA_VERSION};"))
            .map_err(storage_err)?;

        Ok(Self {
            conn,
            cipher,
            in_transaction: false,
        })
    }

    fn decode_person(&self, row: PersonRow) -> Result<Identity> {
        Ok(Identity {
            identity_id: row.identity_id,
            display_name: row.name,
            reference_embedding: codec::decode(&row.embedding, self.cipher.as_ref())?,
            registered_at: row.registered_at,
            last_seen_at: row.last_seen,
            visit_count: row.visit_count,
        })
    }

    fn query_sessions(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<Session>> {
        let mut stmt = self.conn.prepare(sql).map_err(storage_err)?;
        let rows = stmt
            .query_map(params, session_from_row)
            .map_err(storage_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(storage_err)
    }
}

/// A `persons` row before the embedding blob is decoded.
struct PersonRow {
    identity_id: IdentityId,
    name: Option<String>,
    embedding: Vec<u8>,
    registered_at: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    visit_count: u32,
}

fn person_from_row(row: &Row<'_>) -> rusqlite::Result<PersonRow> {
    Ok(PersonRow {
        identity_id: row.get(0)?,
        name: row.get(1)?,
        embedding: row.get(2)?,
        registered_at: row.get(3)?,
        last_seen: row.get(4)?,
        visit_count: row.get(5)?,
    })
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        session_id: row.get(0)?,
        identity_id: row.get(1)?,
        check_in: row.get(2)?,
        check_out: row.get(3)?,
    })
}

fn seconds(duration: chrono::Duration) -> f64 {
    duration.num_milliseconds() as f64 / 1000.0
}

impl EmbeddingStore for SqliteStore {
    fn upsert(&mut self, identity: &Identity) -> Result<()> {
        let blob = codec::encode(&identity.reference_embedding, self.cipher.as_ref())?;
        self.conn
            .execute(
                "INSERT INTO persons
                    (identity_id, name, embedding, registered_at, last_seen, visit_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(identity_id) DO UPDATE SET
                    name = excluded.name,
                    embedding = excluded.embedding,
                    registered_at = excluded.registered_at,
                    last_seen = excluded.last_seen,
                    visit_count = excluded.visit_count",
                params![
                    identity.identity_id,
                    identity.display_name,
                    blob,
                    identity.registered_at,
                    identity.last_seen_at,
                    identity.visit_count,
                ],
            )
            .map_err(storage_err)?;
        Ok(())
    }

    fn get(&self, identity_id: IdentityId) -> Result<Option<Identity>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {PERSON_COLUMNS} FROM persons WHERE identity_id = ?1"),
                params![identity_id],
                person_from_row,
            )
            .optional()
            .map_err(storage_err)?;
        row.map(|r| self.decode_person(r)).transpose()
    }

    fn all(&self) -> Result<Vec<Identity>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {PERSON_COLUMNS} FROM persons ORDER BY identity_id ASC"
            ))
            .map_err(storage_err)?;
        let rows = stmt
            .query_map([], person_from_row)
            .map_err(storage_err)?;

        let mut identities = Vec::new();
        for row in rows {
            identities.push(self.decode_person(row.map_err(storage_err)?)?);
        }
        Ok(identities)
    }

    fn next_identity_id(&self) -> Result<IdentityId> {
        self.conn
            .query_row(
                "SELECT COALESCE(MAX(identity_id), 0) + 1 FROM persons",
                [],
                |row| row.get(0),
            )
            .map_err(storage_err)
    }
}

impl AttendanceLedger for SqliteStore {
    fn record(&mut self, event: &SessionEvent) -> Result<()> {
        match event {
            SessionEvent::None => Ok(()),
            SessionEvent::Opened {
                session_id,
                identity_id,
                check_in,
            } => {
                let inserted = self
                    .conn
                    .execute(
                        "INSERT OR IGNORE INTO attendance (session_id, identity_id, check_in)
                         VALUES (?1, ?2, ?3)",
                        params![session_id, identity_id, check_in],
                    )
                    .map_err(storage_err)?;
                if inserted == 0 {
                    tracing::debug!(session_id, "duplicate open event ignored");
                }
                Ok(())
            }
            SessionEvent::Closed {
                session_id,
                check_out,
                duration,
                ..
            } => {
                let updated = self
                    .conn
                    .execute(
                        "UPDATE attendance SET check_out = ?2, session_duration = ?3
                         WHERE session_id = ?1 AND check_out IS NULL",
                        params![session_id, check_out, seconds(*duration)],
                    )
                    .map_err(storage_err)?;
                if updated == 0 {
                    if self.get_session(*session_id)?.is_none() {
                        return Err(CoreError::UnknownSession(*session_id));
                    }
                    tracing::debug!(session_id, "session already closed; close event ignored");
                }
                Ok(())
            }
        }
    }

    fn get_session(&self, session_id: SessionId) -> Result<Option<Session>> {
        self.conn
            .query_row(
                &format!("SELECT {SESSION_COLUMNS} FROM attendance WHERE session_id = ?1"),
                params![session_id],
                session_from_row,
            )
            .optional()
            .map_err(storage_err)
    }

    fn open_sessions(&self) -> Result<Vec<Session>> {
        self.query_sessions(
            &format!(
                "SELECT {SESSION_COLUMNS} FROM attendance
                 WHERE check_out IS NULL ORDER BY session_id ASC"
            ),
            [],
        )
    }

    fn sessions_for(&self, identity_id: IdentityId) -> Result<Vec<Session>> {
        self.query_sessions(
            &format!(
                "SELECT {SESSION_COLUMNS} FROM attendance
                 WHERE identity_id = ?1 ORDER BY session_id ASC"
            ),
            params![identity_id],
        )
    }

    fn recent_sessions(&self, limit: usize) -> Result<Vec<Session>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.query_sessions(
            &format!(
                "SELECT {SESSION_COLUMNS} FROM attendance
                 ORDER BY session_id DESC LIMIT ?1"
            ),
            params![limit],
        )
    }

    fn last_session_id(&self) -> Result<Option<SessionId>> {
        self.conn
            .query_row("SELECT MAX(session_id) FROM attendance", [], |row| row.get(0))
            .map_err(storage_err)
    }

    fn summary(&self) -> Result<LedgerSummary> {
        self.conn
            .query_row(
                "SELECT COUNT(*),
                        COALESCE(SUM(CASE WHEN check_out IS NULL THEN 1 ELSE 0 END), 0),
                        COALESCE(SUM(session_duration), 0.0)
                 FROM attendance",
                [],
                |row| {
                    Ok(LedgerSummary {
                        sessions: row.get::<_, i64>(0)? as u64,
                        open_sessions: row.get::<_, i64>(1)? as u64,
                        closed_seconds: row.get(2)?,
                    })
                },
            )
            .map_err(storage_err)
    }
}

impl Store for SqliteStore {
    fn begin(&mut self) -> Result<()> {
        self.conn
            .execute_batch("BEGIN IMMEDIATE")
            .map_err(storage_err)?;
        self.in_transaction = true;
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.conn.execute_batch("COMMIT").map_err(storage_err)?;
        self.in_transaction = false;
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        if !self.in_transaction {
            return Ok(());
        }
        self.in_transaction = false;
        self.conn.execute_batch("ROLLBACK").map_err(storage_err)
    }
}
