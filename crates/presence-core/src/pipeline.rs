//! One atomic tick per processed frame:
//! embeddings in → matched/created identity → session transition → ledger write.

use crate::error::{CoreError, Result};
use crate::matcher::{CosineMatcher, Matcher};
use crate::registrar::{IdentityRegistrar, Resolution};
use crate::store::{AttendanceLedger, EmbeddingStore, Store};
use crate::tracker::{CheckoutPolicy, SessionTracker};
use crate::types::{Embedding, FrameObservation, Identity, IdentityId, SessionEvent, Stats};
use chrono::{DateTime, Duration, Utc};

/// Tunables for identity resolution and session tracking.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub similarity_threshold: f32,
    pub exit_timeout: Duration,
    pub checkout_policy: CheckoutPolicy,
    /// EMA weight for reference embedding updates; 0 freezes references.
    pub reference_update_weight: f32,
    /// Required embedding length, if any.
    pub embedding_dim: Option<usize>,
    /// Detections with a smaller bbox side (pixels) are skipped; 0 disables.
    pub min_face_size: f32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.65,
            exit_timeout: Duration::minutes(5),
            checkout_policy: CheckoutPolicy::TimeoutExpiry,
            reference_update_weight: 0.1,
            embedding_dim: None,
            min_face_size: 0.0,
        }
    }
}

/// What a single frame tick did.
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub resolutions: Vec<Resolution>,
    /// Non-`None` session transitions, in the order they were recorded.
    pub events: Vec<SessionEvent>,
    /// Detections dropped for an unusable embedding.
    pub rejected: usize,
    /// Detections dropped by the face size filter.
    pub skipped: usize,
}

pub struct Pipeline<S: Store, M: Matcher = CosineMatcher> {
    store: S,
    registrar: IdentityRegistrar<M>,
    tracker: SessionTracker,
    embedding_dim: Option<usize>,
    min_face_size: f32,
}

impl<S: Store> Pipeline<S, CosineMatcher> {
    pub fn new(store: S, config: &PipelineConfig) -> Result<Self> {
        Self::with_matcher(store, CosineMatcher, config)
    }
}

impl<S: Store, M: Matcher> Pipeline<S, M> {
    /// Build a pipeline over `store`, restoring open sessions from its ledger.
    pub fn with_matcher(store: S, matcher: M, config: &PipelineConfig) -> Result<Self> {
        if config.embedding_dim == Some(0) {
            return Err(CoreError::InvalidConfig("embedding_dim must be non-zero".into()));
        }
        let registrar = IdentityRegistrar::with_matcher(
            matcher,
            config.similarity_threshold,
            config.reference_update_weight,
        )?;
        let tracker =
            SessionTracker::restore(&store, config.exit_timeout, config.checkout_policy)?;
        Ok(Self {
            store,
            registrar,
            tracker,
            embedding_dim: config.embedding_dim,
            min_face_size: config.min_face_size,
        })
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn tracker(&self) -> &SessionTracker {
        &self.tracker
    }

    /// Process one frame's detections and departures at `now`.
    ///
    /// Expired sessions are swept first, so a subject returning after the
    /// exit timeout gets a fresh session. Unusable embeddings are rejected
    /// individually; any other error aborts the whole tick.
    pub fn process_frame(
        &mut self,
        frame: &FrameObservation,
        now: DateTime<Utc>,
    ) -> Result<TickReport> {
        let mut report = TickReport::default();
        let mut queries = Vec::with_capacity(frame.detections.len());

        for (idx, detection) in frame.detections.iter().enumerate() {
            let bbox = &detection.bbox;
            if self.min_face_size > 0.0
                && (bbox.width < self.min_face_size || bbox.height < self.min_face_size)
            {
                tracing::debug!(
                    idx,
                    width = bbox.width,
                    height = bbox.height,
                    "face too small, skipping"
                );
                report.skipped += 1;
                continue;
            }
            let values = detection.embedding.clone();
            let parsed = match self.embedding_dim {
                Some(dim) => Embedding::with_dim(values, dim),
                None => Embedding::new(values),
            };
            match parsed {
                Ok(embedding) => queries.push(embedding),
                Err(e) => {
                    tracing::warn!(idx, error = %e, "rejecting detection");
                    report.rejected += 1;
                }
            }
        }

        let departures = frame.departures.clone();
        self.atomically(move |store, registrar, tracker| {
            for event in tracker.sweep(now) {
                store.record(&event)?;
                report.events.push(event);
            }

            for query in &queries {
                let resolution = match registrar.resolve(store, query, now) {
                    Ok(r) => r,
                    Err(e) if e.is_rejection() => {
                        tracing::warn!(error = %e, "rejecting detection");
                        report.rejected += 1;
                        continue;
                    }
                    Err(e) => return Err(e),
                };
                let event = tracker.observe(store, resolution.identity_id, now)?;
                if !event.is_none() {
                    store.record(&event)?;
                    report.events.push(event);
                }
                report.resolutions.push(resolution);
            }

            for identity_id in departures {
                let event = tracker.depart(&*store, identity_id, now)?;
                if !event.is_none() {
                    store.record(&event)?;
                    report.events.push(event);
                }
            }
            Ok(report)
        })
    }

    /// Close sessions that exceeded the exit timeout.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> Result<Vec<SessionEvent>> {
        self.atomically(move |store, _, tracker| {
            let events = tracker.sweep(now);
            for event in &events {
                store.record(event)?;
            }
            Ok(events)
        })
    }

    /// Explicit check-out for `identity_id`.
    pub fn depart(&mut self, identity_id: IdentityId, now: DateTime<Utc>) -> Result<SessionEvent> {
        self.atomically(move |store, _, tracker| {
            let event = tracker.depart(&*store, identity_id, now)?;
            store.record(&event)?;
            Ok(event)
        })
    }

    /// Set or clear the display name of an identity.
    pub fn label(&mut self, identity_id: IdentityId, name: Option<String>) -> Result<Identity> {
        self.atomically(move |store, _, _| {
            let mut identity = store
                .get(identity_id)?
                .ok_or(CoreError::UnknownIdentity(identity_id))?;
            identity.display_name = name.filter(|n| !n.trim().is_empty());
            store.upsert(&identity)?;
            tracing::info!(identity_id, label = %identity.label(), "identity labelled");
            Ok(identity)
        })
    }

    pub fn stats(&self) -> Result<Stats> {
        crate::store::stats(&self.store)
    }

    /// Run `f` inside a store transaction.
    ///
    /// On error the store is rolled back and the tracker restored to its
    /// state before the call, so in-memory and persisted state stay aligned.
    fn atomically<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut S, &IdentityRegistrar<M>, &mut SessionTracker) -> Result<T>,
    {
        let snapshot = self.tracker.clone();
        self.store.begin()?;

        let result = f(&mut self.store, &self.registrar, &mut self.tracker)
            .and_then(|value| self.store.commit().map(|_| value));

        if let Err(e) = &result {
            tracing::warn!(error = %e, "rolling back tick");
            if let Err(rollback_err) = self.store.rollback() {
                tracing::error!(error = %rollback_err, "rollback failed");
            }
            self.tracker = snapshot;
        }
        result
    }
}
