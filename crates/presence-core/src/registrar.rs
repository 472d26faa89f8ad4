//! Identity registration: match a query embedding against the registry or
//! enroll it as a new anonymous identity.
//!
//! This is the only code path that creates identities.

use crate::error::{CoreError, Result};
use crate::matcher::{CosineMatcher, Matcher};
use crate::store::EmbeddingStore;
use crate::types::{Embedding, Identity, IdentityId};
use chrono::{DateTime, Utc};

/// Outcome of [`IdentityRegistrar::resolve`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Resolution {
    pub identity_id: IdentityId,
    /// Similarity to the best candidate (0.0 for an empty registry).
    pub similarity: f32,
    /// True when the query did not match and a new identity was created.
    pub created: bool,
}

pub struct IdentityRegistrar<M: Matcher = CosineMatcher> {
    matcher: M,
    threshold: f32,
    /// Share of the query mixed into the reference embedding on each match.
    update_weight: f32,
}

impl IdentityRegistrar<CosineMatcher> {
    pub fn new(threshold: f32, update_weight: f32) -> Result<Self> {
        Self::with_matcher(CosineMatcher, threshold, update_weight)
    }
}

impl<M: Matcher> IdentityRegistrar<M> {
    pub fn with_matcher(matcher: M, threshold: f32, update_weight: f32) -> Result<Self> {
        if !(-1.0..=1.0).contains(&threshold) {
            return Err(CoreError::InvalidConfig(format!(
                "similarity threshold {threshold} outside [-1, 1]"
            )));
        }
        if !(0.0..=1.0).contains(&update_weight) {
            return Err(CoreError::InvalidConfig(format!(
                "reference update weight {update_weight} outside [0, 1]"
            )));
        }
        Ok(Self {
            matcher,
            threshold,
            update_weight,
        })
    }

    /// Resolve `query` to an identity, creating one when nothing matches.
    ///
    /// On a match the identity's `last_seen_at` advances to `now` (never
    /// backwards) and its reference embedding moves toward the query by
    /// `update_weight`. `visit_count` is left to the session tracker.
    pub fn resolve<S: EmbeddingStore>(
        &self,
        store: &mut S,
        query: &Embedding,
        now: DateTime<Utc>,
    ) -> Result<Resolution> {
        let gallery = store.all()?;
        let result = self.matcher.compare(query, &gallery, self.threshold)?;

        if let Some(identity_id) = result.identity_id {
            let mut identity = gallery
                .into_iter()
                .find(|i| i.identity_id == identity_id)
                .ok_or(CoreError::UnknownIdentity(identity_id))?;

            identity.last_seen_at = identity.last_seen_at.max(now);
            identity.reference_embedding = identity
                .reference_embedding
                .blend(query, self.update_weight)?;
            store.upsert(&identity)?;

            tracing::debug!(
                identity_id,
                similarity = result.similarity,
                "matched identity"
            );
            return Ok(Resolution {
                identity_id,
                similarity: result.similarity,
                created: false,
            });
        }

        let identity_id = store.next_identity_id()?;
        let identity = Identity {
            identity_id,
            display_name: None,
            reference_embedding: query.clone(),
            registered_at: now,
            last_seen_at: now,
            visit_count: 0,
        };
        store.upsert(&identity)?;

        tracing::info!(
            identity_id,
            best_similarity = result.similarity,
            known = gallery.len(),
            "registered new identity"
        );
        Ok(Resolution {
            identity_id,
            similarity: result.similarity,
            created: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::Duration;

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec()).unwrap()
    }

    #[test]
    fn test_first_query_creates_identity() {
        let registrar = IdentityRegistrar::new(0.65, 0.0).unwrap();
        let mut store = MemoryStore::new();
        let now = Utc::now();

        let resolution = registrar.resolve(&mut store, &emb(&[1.0, 0.0]), now).unwrap();
        assert!(resolution.created);
        assert_eq!(resolution.identity_id, 1);

        let identity = store.get(1).unwrap().unwrap();
        assert_eq!(identity.registered_at, now);
        assert_eq!(identity.last_seen_at, now);
        assert_eq!(identity.visit_count, 0);
        assert_eq!(identity.display_name, None);
        assert_eq!(identity.reference_embedding, emb(&[1.0, 0.0]));
    }

    #[test]
    fn test_near_duplicate_matches_and_updates_last_seen() {
        let registrar = IdentityRegistrar::new(0.65, 0.0).unwrap();
        let mut store = MemoryStore::new();
        let t0 = Utc::now();
        registrar.resolve(&mut store, &emb(&[1.0, 0.0]), t0).unwrap();

        // cos = 0.9
        let near = emb(&[0.9, (1.0f32 - 0.81).sqrt()]);
        let t1 = t0 + Duration::seconds(2);
        let resolution = registrar.resolve(&mut store, &near, t1).unwrap();
        assert!(!resolution.created);
        assert_eq!(resolution.identity_id, 1);
        assert!((resolution.similarity - 0.9).abs() < 1e-5);

        let identity = store.get(1).unwrap().unwrap();
        assert_eq!(identity.last_seen_at, t1);
        assert_eq!(identity.registered_at, t0);
        assert_eq!(store.all().unwrap().len(), 1);
    }

    #[test]
    fn test_distinct_faces_get_distinct_ids() {
        let registrar = IdentityRegistrar::new(0.65, 0.1).unwrap();
        let mut store = MemoryStore::new();
        let now = Utc::now();

        let a = registrar.resolve(&mut store, &emb(&[1.0, 0.0, 0.0]), now).unwrap();
        let b = registrar.resolve(&mut store, &emb(&[0.0, 1.0, 0.0]), now).unwrap();
        assert!(a.created && b.created);
        assert_ne!(a.identity_id, b.identity_id);
        assert_eq!(store.all().unwrap().len(), 2);
    }

    #[test]
    fn test_last_seen_never_moves_backwards() {
        let registrar = IdentityRegistrar::new(0.65, 0.0).unwrap();
        let mut store = MemoryStore::new();
        let t0 = Utc::now();
        registrar.resolve(&mut store, &emb(&[1.0, 0.0]), t0).unwrap();
        registrar
            .resolve(&mut store, &emb(&[1.0, 0.0]), t0 - Duration::seconds(5))
            .unwrap();
        assert_eq!(store.get(1).unwrap().unwrap().last_seen_at, t0);
    }

    #[test]
    fn test_reference_moves_toward_query_on_match() {
        let registrar = IdentityRegistrar::new(0.5, 0.5).unwrap();
        let mut store = MemoryStore::new();
        let now = Utc::now();
        registrar.resolve(&mut store, &emb(&[1.0, 0.0]), now).unwrap();
        registrar.resolve(&mut store, &emb(&[0.8, 0.6]), now).unwrap();

        let reference = store.get(1).unwrap().unwrap().reference_embedding;
        let v = reference.as_slice();
        assert!(v[1] > 0.0 && v[1] < 0.6);
    }

    #[test]
    fn test_dimension_mismatch_leaves_store_untouched() {
        let registrar = IdentityRegistrar::new(0.65, 0.0).unwrap();
        let mut store = MemoryStore::new();
        let now = Utc::now();
        registrar.resolve(&mut store, &emb(&[1.0, 0.0]), now).unwrap();

        let err = registrar
            .resolve(&mut store, &emb(&[1.0, 0.0, 0.0]), now)
            .unwrap_err();
        assert!(err.is_rejection());
        assert_eq!(store.all().unwrap().len(), 1);
    }

    #[test]
    fn test_rejects_bad_config() {
        assert!(IdentityRegistrar::new(1.5, 0.1).is_err());
        assert!(IdentityRegistrar::new(0.6, -0.1).is_err());
    }
}
