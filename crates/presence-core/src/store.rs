//! Persistence seams: the identity registry, the attendance ledger, and the
//! transaction boundary that makes a pipeline tick atomic.
//!
//! [`MemoryStore`] is a complete in-process implementation used by tests and
//! by callers that do not need durability.

use crate::error::{CoreError, Result};
use crate::types::{Identity, IdentityId, LedgerSummary, Session, SessionEvent, SessionId, Stats};
use std::collections::BTreeMap;

/// Table of known identities and their reference embeddings.
pub trait EmbeddingStore {
    /// Insert or fully replace the row for `identity.identity_id`.
    fn upsert(&mut self, identity: &Identity) -> Result<()>;
    fn get(&self, identity_id: IdentityId) -> Result<Option<Identity>>;
    /// All identities ordered by `identity_id`.
    fn all(&self) -> Result<Vec<Identity>>;
    /// Next unused identity id. Ids are never reused.
    fn next_identity_id(&self) -> Result<IdentityId>;
}

/// Record of attendance sessions derived from tracker transitions.
pub trait AttendanceLedger {
    /// Persist an `Opened` (insert) or `Closed` (set check-out) event.
    ///
    /// Idempotent: replaying an `Opened` or closing an already-closed
    /// session is a no-op. `None` events are ignored.
    fn record(&mut self, event: &SessionEvent) -> Result<()>;
    fn get_session(&self, session_id: SessionId) -> Result<Option<Session>>;
    /// Sessions without a check-out, ordered by `session_id`.
    fn open_sessions(&self) -> Result<Vec<Session>>;
    fn sessions_for(&self, identity_id: IdentityId) -> Result<Vec<Session>>;
    /// Most recent sessions first.
    fn recent_sessions(&self, limit: usize) -> Result<Vec<Session>>;
    fn last_session_id(&self) -> Result<Option<SessionId>>;
    fn summary(&self) -> Result<LedgerSummary>;
}

/// Registry and attendance statistics read straight from a store.
pub fn stats<S: EmbeddingStore + AttendanceLedger + ?Sized>(store: &S) -> Result<Stats> {
    let identities = store.all()?;
    let ledger = store.summary()?;
    let closed = ledger.sessions.saturating_sub(ledger.open_sessions);
    Ok(Stats {
        identities: identities.len() as u64,
        named_identities: identities.iter().filter(|i| i.display_name.is_some()).count() as u64,
        total_visits: identities.iter().map(|i| u64::from(i.visit_count)).sum(),
        sessions: ledger.sessions,
        open_sessions: ledger.open_sessions,
        mean_session_secs: (closed > 0).then(|| ledger.closed_seconds / closed as f64),
    })
}

/// Combined durable store with an explicit transaction boundary.
///
/// Between `begin` and `commit` every write is provisional; `rollback`
/// discards all of them.
pub trait Store: EmbeddingStore + AttendanceLedger {
    fn begin(&mut self) -> Result<()>;
    fn commit(&mut self) -> Result<()>;
    fn rollback(&mut self) -> Result<()>;
}

#[derive(Debug, Clone, Default)]
struct Tables {
    persons: BTreeMap<IdentityId, Identity>,
    attendance: BTreeMap<SessionId, Session>,
}

/// In-memory store with snapshot transactions.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Tables,
    snapshot: Option<Tables>,
    #[cfg(test)]
    fail_writes: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail with `StorageUnavailable`.
    #[cfg(test)]
    pub(crate) fn set_fail_writes(&mut self, fail: bool) {
        self.fail_writes = fail;
    }

    fn check_writable(&self) -> Result<()> {
        #[cfg(test)]
        if self.fail_writes {
            return Err(CoreError::StorageUnavailable("injected write failure".into()));
        }
        Ok(())
    }
}

impl EmbeddingStore for MemoryStore {
    fn upsert(&mut self, identity: &Identity) -> Result<()> {
        self.check_writable()?;
        self.tables
            .persons
            .insert(identity.identity_id, identity.clone());
        Ok(())
    }

    fn get(&self, identity_id: IdentityId) -> Result<Option<Identity>> {
        Ok(self.tables.persons.get(&identity_id).cloned())
    }

    fn all(&self) -> Result<Vec<Identity>> {
        Ok(self.tables.persons.values().cloned().collect())
    }

    fn next_identity_id(&self) -> Result<IdentityId> {
        Ok(self
            .tables
            .persons
            .keys()
            .next_back()
            .map_or(1, |id| id + 1))
    }
}

impl AttendanceLedger for MemoryStore {
    fn record(&mut self, event: &SessionEvent) -> Result<()> {
        match event {
            SessionEvent::None => Ok(()),
            SessionEvent::Opened {
                session_id,
                identity_id,
                check_in,
            } => {
                self.check_writable()?;
                self.tables
                    .attendance
                    .entry(*session_id)
                    .or_insert_with(|| Session {
                        session_id: *session_id,
                        identity_id: *identity_id,
                        check_in: *check_in,
                        check_out: None,
                    });
                Ok(())
            }
            SessionEvent::Closed {
                session_id,
                check_out,
                ..
            } => {
                self.check_writable()?;
                let session = self
                    .tables
                    .attendance
                    .get_mut(session_id)
                    .ok_or(CoreError::UnknownSession(*session_id))?;
                if session.check_out.is_none() {
                    session.check_out = Some(*check_out);
                }
                Ok(())
            }
        }
    }

    fn get_session(&self, session_id: SessionId) -> Result<Option<Session>> {
        Ok(self.tables.attendance.get(&session_id).cloned())
    }

    fn open_sessions(&self) -> Result<Vec<Session>> {
        Ok(self
            .tables
            .attendance
            .values()
            .filter(|s| s.is_open())
            .cloned()
            .collect())
    }

    fn sessions_for(&self, identity_id: IdentityId) -> Result<Vec<Session>> {
        Ok(self
            .tables
            .attendance
            .values()
            .filter(|s| s.identity_id == identity_id)
            .cloned()
            .collect())
    }

    fn recent_sessions(&self, limit: usize) -> Result<Vec<Session>> {
        Ok(self
            .tables
            .attendance
            .values()
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }

    fn last_session_id(&self) -> Result<Option<SessionId>> {
        Ok(self.tables.attendance.keys().next_back().copied())
    }

    fn summary(&self) -> Result<LedgerSummary> {
        let mut summary = LedgerSummary::default();
        for session in self.tables.attendance.values() {
            summary.sessions += 1;
            match session.duration() {
                Some(d) => summary.closed_seconds += d.num_milliseconds() as f64 / 1000.0,
                None => summary.open_sessions += 1,
            }
        }
        Ok(summary)
    }
}

impl Store for MemoryStore {
    fn begin(&mut self) -> Result<()> {
        self.snapshot = Some(self.tables.clone());
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.snapshot = None;
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        if let Some(tables) = self.snapshot.take() {
            self.tables = tables;
        }
        Ok(())
    }
}
