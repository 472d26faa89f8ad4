//! Similarity matching of a query embedding against the identity registry.

use crate::error::Result;
use crate::types::{Embedding, Identity, IdentityId};

/// Result of matching a query embedding against a gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub matched: bool,
    /// Cosine similarity of the best candidate [-1, 1], or 0.0 for an empty gallery.
    pub similarity: f32,
    /// Best candidate, present only when `matched`.
    pub identity_id: Option<IdentityId>,
}

impl MatchResult {
    pub fn no_match(similarity: f32) -> Self {
        Self {
            matched: false,
            similarity,
            identity_id: None,
        }
    }
}

/// Strategy for comparing a query embedding against the known identities.
pub trait Matcher {
    fn compare(&self, query: &Embedding, gallery: &[Identity], threshold: f32)
        -> Result<MatchResult>;
}

/// Cosine similarity matcher with a full linear scan.
///
/// Every gallery entry is scored. Equal best scores resolve to the smaller
/// `identity_id`, so the outcome does not depend on gallery order.
#[derive(Debug, Clone, Copy, Default)]
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn compare(
        &self,
        query: &Embedding,
        gallery: &[Identity],
        threshold: f32,
    ) -> Result<MatchResult> {
        let mut best: Option<(IdentityId, f32)> = None;

        for identity in gallery {
            let sim = query.similarity(&identity.reference_embedding)?;
            if !sim.is_finite() {
                tracing::warn!(
                    identity_id = identity.identity_id,
                    "skipping non-finite similarity"
                );
                continue;
            }
            let is_better = match best {
                None => true,
                Some((best_id, best_sim)) => {
                    sim > best_sim || (sim == best_sim && identity.identity_id < best_id)
                }
            };
            if is_better {
                best = Some((identity.identity_id, sim));
            }
        }

        Ok(match best {
            Some((identity_id, similarity)) if similarity >= threshold => MatchResult {
                matched: true,
                similarity,
                identity_id: Some(identity_id),
            },
            Some((_, similarity)) => MatchResult::no_match(similarity),
            None => MatchResult::no_match(0.0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use chrono::Utc;

    fn identity(id: IdentityId, values: &[f32]) -> Identity {
        Identity {
            identity_id: id,
            display_name: None,
            reference_embedding: Embedding::new(values.to_vec()).unwrap(),
            registered_at: Utc::now(),
            last_seen_at: Utc::now(),
            visit_count: 0,
        }
    }

    fn query(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec()).unwrap()
    }

    #[test]
    fn test_matcher_scans_whole_gallery() {
        // Best match is the last entry.
        let gallery = vec![
            identity(1, &[0.0, 1.0, 0.0]),
            identity(2, &[0.0, 0.0, 1.0]),
            identity(3, &[1.0, 0.0, 0.0]),
        ];

        let result = CosineMatcher
            .compare(&query(&[1.0, 0.0, 0.0]), &gallery, 0.5)
            .unwrap();
        assert!(result.matched);
        assert_eq!(result.identity_id, Some(3));
        assert!((result.similarity - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_matcher_below_threshold() {
        let gallery = vec![identity(1, &[0.0, 1.0, 0.0])];
        let result = CosineMatcher
            .compare(&query(&[1.0, 0.0, 0.0]), &gallery, 0.5)
            .unwrap();
        assert!(!result.matched);
        assert_eq!(result.identity_id, None);
        assert!(result.similarity.abs() < 1e-6);
    }

    #[test]
    fn test_matcher_threshold_is_inclusive() {
        let gallery = vec![identity(1, &[1.0, 0.0])];
        let result = CosineMatcher
            .compare(&query(&[1.0, 0.0]), &gallery, 1.0)
            .unwrap();
        assert!(result.matched);
    }

    #[test]
    fn test_matcher_empty_gallery() {
        let result = CosineMatcher.compare(&query(&[1.0, 0.0]), &[], -1.0).unwrap();
        assert!(!result.matched);
        assert_eq!(result.similarity, 0.0);
    }

    #[test]
    fn test_matcher_tie_breaks_on_smaller_id() {
        let forward = vec![identity(4, &[1.0, 0.0]), identity(2, &[1.0, 0.0])];
        let reversed = vec![identity(2, &[1.0, 0.0]), identity(4, &[1.0, 0.0])];

        let a = CosineMatcher.compare(&query(&[1.0, 0.0]), &forward, 0.5).unwrap();
        let b = CosineMatcher.compare(&query(&[1.0, 0.0]), &reversed, 0.5).unwrap();
        assert_eq!(a.identity_id, Some(2));
        assert_eq!(a, b);
    }

    #[test]
    fn test_matcher_is_deterministic() {
        let gallery = vec![
            identity(1, &[0.6, 0.8]),
            identity(2, &[0.8, 0.6]),
            identity(3, &[-1.0, 0.0]),
        ];
        let q = query(&[0.7, 0.7]);
        let first = CosineMatcher.compare(&q, &gallery, 0.65).unwrap();
        for _ in 0..10 {
            assert_eq!(CosineMatcher.compare(&q, &gallery, 0.65).unwrap(), first);
        }
    }

    #[test]
    fn test_matcher_large_magnitude_query_matches_itself() {
        let gallery = vec![identity(1, &[1e20, 1e20]), identity(2, &[1e20, -1e20])];
        let result = CosineMatcher
            .compare(&query(&[1e20, 1e20]), &gallery, 0.65)
            .unwrap();
        assert!(result.matched);
        assert_eq!(result.identity_id, Some(1));
        assert!(result.similarity.is_finite());
    }

    #[test]
    fn test_matcher_dimension_mismatch() {
        let gallery = vec![identity(1, &[1.0, 0.0, 0.0])];
        let err = CosineMatcher
            .compare(&query(&[1.0, 0.0]), &gallery, 0.5)
            .unwrap_err();
        assert_eq!(
            err,
            CoreError::DimensionMismatch {
                expected: 3,
                actual: 2,
            }
        );
    }
}
