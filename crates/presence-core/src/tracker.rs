//! Per-identity attendance state machine.
//!
//! Each identity is either CLOSED (no entry in `open`) or OPEN. `observe`
//! opens a session on first sight and refreshes last activity afterwards;
//! `sweep` closes sessions whose last activity fell behind the exit timeout;
//! `depart` closes a session on an explicit departure signal.

use crate::error::{CoreError, Result};
use crate::store::{AttendanceLedger, EmbeddingStore};
use crate::types::{IdentityId, SessionEvent, SessionId};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Timestamp written as `check_out` when the inactivity timeout closes a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckoutPolicy {
    /// `last_activity + exit_timeout`: the instant the timeout elapsed.
    #[default]
    TimeoutExpiry,
    /// The last time the identity was observed.
    LastActivity,
    /// The `now` passed to `sweep`.
    SweepTime,
}

impl std::str::FromStr for CheckoutPolicy {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "timeout_expiry" => Ok(Self::TimeoutExpiry),
            "last_activity" => Ok(Self::LastActivity),
            "sweep_time" => Ok(Self::SweepTime),
            other => Err(CoreError::InvalidConfig(format!(
                "unknown checkout policy: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct OpenSession {
    session_id: SessionId,
    check_in: DateTime<Utc>,
    last_activity: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SessionTracker {
    exit_timeout: Duration,
    checkout: CheckoutPolicy,
    /// Identities currently OPEN. Ordered so sweeps emit deterministically.
    open: BTreeMap<IdentityId, OpenSession>,
    next_session_id: SessionId,
}

impl SessionTracker {
    /// Tracker with no open sessions, allocating session ids from 1.
    pub fn new(exit_timeout: Duration, checkout: CheckoutPolicy) -> Result<Self> {
        if exit_timeout <= Duration::zero() {
            return Err(CoreError::InvalidConfig(
                "exit timeout must be positive".into(),
            ));
        }
        Ok(Self {
            exit_timeout,
            checkout,
            open: BTreeMap::new(),
            next_session_id: 1,
        })
    }

    /// Rebuild tracker state from the ledger after a restart.
    ///
    /// Every session without a check-out is OPEN. Its last activity is the
    /// later of `check_in` and the identity's persisted `last_seen_at`.
    pub fn restore<S>(store: &S, exit_timeout: Duration, checkout: CheckoutPolicy) -> Result<Self>
    where
        S: EmbeddingStore + AttendanceLedger,
    {
        let mut tracker = Self::new(exit_timeout, checkout)?;
        tracker.next_session_id = store.last_session_id()?.map_or(1, |id| id + 1);

        for session in store.open_sessions()? {
            let last_seen = store
                .get(session.identity_id)?
                .map(|i| i.last_seen_at)
                .ok_or(CoreError::UnknownIdentity(session.identity_id))?;

            // open_sessions is ordered by id, so a later duplicate wins.
            if let Some(stale) = tracker.open.get(&session.identity_id) {
                tracing::warn!(
                    identity_id = session.identity_id,
                    stale_session = stale.session_id,
                    session_id = session.session_id,
                    "multiple open sessions for identity; tracking the newest"
                );
            }
            tracker.open.insert(
                session.identity_id,
                OpenSession {
                    session_id: session.session_id,
                    check_in: session.check_in,
                    last_activity: session.check_in.max(last_seen),
                },
            );
        }

        tracing::info!(
            open = tracker.open.len(),
            next_session_id = tracker.next_session_id,
            "session tracker restored"
        );
        Ok(tracker)
    }

    pub fn is_open(&self, identity_id: IdentityId) -> bool {
        self.open.contains_key(&identity_id)
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    /// Record that `identity_id` was seen at `now`.
    ///
    /// CLOSED → OPEN emits `Opened` and increments the identity's
    /// `visit_count` in the store. OPEN refreshes last activity and emits
    /// `None`.
    pub fn observe<S: EmbeddingStore>(
        &mut self,
        store: &mut S,
        identity_id: IdentityId,
        now: DateTime<Utc>,
    ) -> Result<SessionEvent> {
        let mut identity = store
            .get(identity_id)?
            .ok_or(CoreError::UnknownIdentity(identity_id))?;

        if let Some(open) = self.open.get_mut(&identity_id) {
            open.last_activity = open.last_activity.max(now);
            return Ok(SessionEvent::None);
        }

        identity.visit_count = identity.visit_count.saturating_add(1);
        store.upsert(&identity)?;

        let session_id = self.next_session_id;
        self.next_session_id += 1;
        self.open.insert(
            identity_id,
            OpenSession {
                session_id,
                check_in: now,
                last_activity: now,
            },
        );

        tracing::info!(
            identity_id,
            session_id,
            visit_count = identity.visit_count,
            "session opened"
        );
        Ok(SessionEvent::Opened {
            session_id,
            identity_id,
            check_in: now,
        })
    }

    /// Close every session whose last activity is strictly older than
    /// `now - exit_timeout`.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> Vec<SessionEvent> {
        let cutoff = now - self.exit_timeout;
        let expired: Vec<IdentityId> = self
            .open
            .iter()
            .filter(|(_, s)| s.last_activity < cutoff)
            .map(|(id, _)| *id)
            .collect();

        let mut events = Vec::with_capacity(expired.len());
        for identity_id in expired {
            let Some(session) = self.open.remove(&identity_id) else {
                continue;
            };
            let check_out = match self.checkout {
                CheckoutPolicy::TimeoutExpiry => session.last_activity + self.exit_timeout,
                CheckoutPolicy::LastActivity => session.last_activity,
                CheckoutPolicy::SweepTime => now,
            };
            events.push(Self::close(identity_id, session, check_out, "timeout"));
        }
        events
    }

    /// Close `identity_id`'s open session at `now` on an explicit departure.
    ///
    /// Emits `None` when the identity has no open session.
    pub fn depart<S: EmbeddingStore>(
        &mut self,
        store: &S,
        identity_id: IdentityId,
        now: DateTime<Utc>,
    ) -> Result<SessionEvent> {
        if store.get(identity_id)?.is_none() {
            return Err(CoreError::UnknownIdentity(identity_id));
        }
        Ok(match self.open.remove(&identity_id) {
            Some(session) => Self::close(identity_id, session, now, "departure"),
            None => SessionEvent::None,
        })
    }

    fn close(
        identity_id: IdentityId,
        session: OpenSession,
        check_out: DateTime<Utc>,
        reason: &'static str,
    ) -> SessionEvent {
        let check_out = check_out.max(session.check_in);
        let duration = check_out - session.check_in;
        tracing::info!(
            identity_id,
            session_id = session.session_id,
            duration_secs = duration.num_seconds(),
            reason,
            "session closed"
        );
        SessionEvent::Closed {
            session_id: session.session_id,
            identity_id,
            check_out,
            duration,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::{Embedding, Identity};

    fn store_with(ids: &[IdentityId], at: DateTime<Utc>) -> MemoryStore {
        let mut store = MemoryStore::new();
        for id in ids {
            store
                .upsert(&Identity {
                    identity_id: *id,
                    display_name: None,
                    reference_embedding: Embedding::new(vec![1.0, 0.0]).unwrap(),
                    registered_at: at,
                    last_seen_at: at,
                    visit_count: 0,
                })
                .unwrap();
        }
        store
    }

    fn tracker() -> SessionTracker {
        SessionTracker::new(Duration::minutes(5), CheckoutPolicy::TimeoutExpiry).unwrap()
    }

    #[test]
    fn test_observe_closed_opens_session() {
        let t0 = Utc::now();
        let mut store = store_with(&[1], t0);
        let mut tracker = tracker();

        let event = tracker.observe(&mut store, 1, t0).unwrap();
        assert_eq!(
            event,
            SessionEvent::Opened {
                session_id: 1,
                identity_id: 1,
                check_in: t0,
            }
        );
        assert!(tracker.is_open(1));
        assert_eq!(store.get(1).unwrap().unwrap().visit_count, 1);
    }

    #[test]
    fn test_observe_open_emits_none() {
        let t0 = Utc::now();
        let mut store = store_with(&[1], t0);
        let mut tracker = tracker();

        tracker.observe(&mut store, 1, t0).unwrap();
        let event = tracker
            .observe(&mut store, 1, t0 + Duration::seconds(2))
            .unwrap();
        assert_eq!(event, SessionEvent::None);
        assert_eq!(tracker.open_count(), 1);
        assert_eq!(store.get(1).unwrap().unwrap().visit_count, 1);
    }

    #[test]
    fn test_observe_unknown_identity() {
        let mut store = MemoryStore::new();
        let mut tracker = tracker();
        let err = tracker.observe(&mut store, 42, Utc::now()).unwrap_err();
        assert_eq!(err, CoreError::UnknownIdentity(42));
        assert_eq!(tracker.open_count(), 0);
    }

    #[test]
    fn test_sweep_closes_after_timeout() {
        let t0 = Utc::now();
        let mut store = store_with(&[1], t0);
        let mut tracker = tracker();
        tracker.observe(&mut store, 1, t0).unwrap();

        // Exactly at the boundary: last activity is not strictly older.
        assert!(tracker.sweep(t0 + Duration::minutes(5)).is_empty());

        let events = tracker.sweep(t0 + Duration::minutes(5) + Duration::milliseconds(1));
        assert_eq!(
            events,
            vec![SessionEvent::Closed {
                session_id: 1,
                identity_id: 1,
                check_out: t0 + Duration::minutes(5),
                duration: Duration::seconds(300),
            }]
        );
        assert!(!tracker.is_open(1));
    }

    #[test]
    fn test_sweep_only_closes_stale_sessions() {
        let t0 = Utc::now();
        let mut store = store_with(&[1, 2], t0);
        let mut tracker = tracker();
        tracker.observe(&mut store, 1, t0).unwrap();
        tracker.observe(&mut store, 2, t0).unwrap();
        tracker
            .observe(&mut store, 2, t0 + Duration::minutes(3))
            .unwrap();

        let events = tracker.sweep(t0 + Duration::minutes(6));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].session_id(), Some(1));
        assert!(tracker.is_open(2));
    }

    #[test]
    fn test_reobserve_after_close_opens_new_session() {
        let t0 = Utc::now();
        let mut store = store_with(&[1], t0);
        let mut tracker = tracker();
        tracker.observe(&mut store, 1, t0).unwrap();
        tracker.sweep(t0 + Duration::minutes(10));

        let event = tracker
            .observe(&mut store, 1, t0 + Duration::minutes(11))
            .unwrap();
        assert_eq!(event.session_id(), Some(2));
        assert_eq!(store.get(1).unwrap().unwrap().visit_count, 2);
    }

    #[test]
    fn test_checkout_policies() {
        let t0 = Utc::now();
        let later = t0 + Duration::minutes(20);
        for (policy, expected) in [
            (CheckoutPolicy::TimeoutExpiry, t0 + Duration::minutes(6)),
            (CheckoutPolicy::LastActivity, t0 + Duration::minutes(1)),
            (CheckoutPolicy::SweepTime, later),
        ] {
            let mut store = store_with(&[1], t0);
            let mut tracker = SessionTracker::new(Duration::minutes(5), policy).unwrap();
            tracker.observe(&mut store, 1, t0).unwrap();
            tracker
                .observe(&mut store, 1, t0 + Duration::minutes(1))
                .unwrap();

            match tracker.sweep(later).as_slice() {
                [SessionEvent::Closed { check_out, duration, .. }] => {
                    assert_eq!(*check_out, expected, "{policy:?}");
                    assert_eq!(*duration, expected - t0);
                }
                other => panic!("unexpected events for {policy:?}: {other:?}"),
            }
        }
    }

    #[test]
    fn test_depart_closes_at_now() {
        let t0 = Utc::now();
        let mut store = store_with(&[1], t0);
        let mut tracker = tracker();
        tracker.observe(&mut store, 1, t0).unwrap();

        let event = tracker.depart(&store, 1, t0 + Duration::seconds(42)).unwrap();
        assert_eq!(
            event,
            SessionEvent::Closed {
                session_id: 1,
                identity_id: 1,
                check_out: t0 + Duration::seconds(42),
                duration: Duration::seconds(42),
            }
        );
        assert_eq!(tracker.depart(&store, 1, t0).unwrap(), SessionEvent::None);
        assert_eq!(
            tracker.depart(&store, 9, t0),
            Err(CoreError::UnknownIdentity(9))
        );
    }

    #[test]
    fn test_restore_from_ledger() {
        let t0 = Utc::now();
        let mut store = store_with(&[1, 2], t0);
        store
            .record(&SessionEvent::Opened {
                session_id: 3,
                identity_id: 1,
                check_in: t0,
            })
            .unwrap();
        store
            .record(&SessionEvent::Opened {
                session_id: 4,
                identity_id: 2,
                check_in: t0,
            })
            .unwrap();
        store
            .record(&SessionEvent::Closed {
                session_id: 4,
                identity_id: 2,
                check_out: t0,
                duration: Duration::zero(),
            })
            .unwrap();
        let mut heartbeat = store.get(1).unwrap().unwrap();
        heartbeat.last_seen_at = t0 + Duration::minutes(4);
        store.upsert(&heartbeat).unwrap();

        let mut tracker =
            SessionTracker::restore(&store, Duration::minutes(5), CheckoutPolicy::TimeoutExpiry)
                .unwrap();
        assert!(tracker.is_open(1));
        assert!(!tracker.is_open(2));

        // Seeded from last_seen, so still open at t0 + 6 min.
        assert!(tracker.sweep(t0 + Duration::minutes(6)).is_empty());

        let event = tracker
            .observe(&mut store, 2, t0 + Duration::minutes(6))
            .unwrap();
        assert_eq!(event.session_id(), Some(5));
    }

    #[test]
    fn test_rejects_non_positive_timeout() {
        assert!(SessionTracker::new(Duration::zero(), CheckoutPolicy::default()).is_err());
    }

    #[test]
    fn test_checkout_policy_from_str() {
        assert_eq!(
            "last_activity".parse::<CheckoutPolicy>().unwrap(),
            CheckoutPolicy::LastActivity
        );
        assert!("whenever".parse::<CheckoutPolicy>().is_err());
    }
}
