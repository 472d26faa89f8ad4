use crate::error::{CoreError, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

pub type IdentityId = i64;
pub type SessionId = i64;

/// Bounding box of a detected face in frame pixel coordinates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// One face reported by the detector/embedder collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    /// Raw embedding values, validated on ingestion.
    pub embedding: Vec<f32>,
    /// Detector confidence, already filtered by the detector's own threshold.
    #[serde(default)]
    pub confidence: f32,
    #[serde(default)]
    pub bbox: BoundingBox,
}

/// Everything the collaborator produced for one processed frame.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FrameObservation {
    /// Capture time. When absent the driver's wall clock is used.
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub detections: Vec<Detection>,
    /// Identities that explicitly checked out during this frame.
    #[serde(default)]
    pub departures: Vec<IdentityId>,
}

/// Face embedding vector (typically 512-dimensional for ArcFace).
///
/// Only constructible through [`Embedding::new`], so every instance is
/// non-empty, finite and has a non-zero norm.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Result<Self> {
        if values.is_empty() {
            return Err(CoreError::InvalidEmbedding("empty vector".into()));
        }
        if let Some(idx) = values.iter().position(|v| !v.is_finite()) {
            return Err(CoreError::InvalidEmbedding(format!(
                "non-finite value at index {idx}"
            )));
        }
        let norm = l2_norm(&values);
        if !norm.is_finite() || norm == 0.0 {
            return Err(CoreError::InvalidEmbedding("zero-norm vector".into()));
        }
        Ok(Self { values })
    }

    /// Validate and additionally require an exact dimension.
    pub fn with_dim(values: Vec<f32>, expected: usize) -> Result<Self> {
        if values.len() != expected {
            return Err(CoreError::DimensionMismatch {
                expected,
                actual: values.len(),
            });
        }
        Self::new(values)
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.values
    }

    /// Compute cosine similarity between two embeddings.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar.
    /// Fails if the two vectors have different lengths.
    pub fn similarity(&self, other: &Embedding) -> Result<f32> {
        if self.dim() != other.dim() {
            return Err(CoreError::DimensionMismatch {
                expected: other.dim(),
                actual: self.dim(),
            });
        }

        // f64 accumulators: f32 squares overflow above ~1e19 and underflow below ~1e-19.
        let mut dot = 0.0f64;
        let mut norm_a = 0.0f64;
        let mut norm_b = 0.0f64;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            let (a, b) = (f64::from(*a), f64::from(*b));
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        let sim = dot / denom;
        Ok(if denom > 0.0 && sim.is_finite() {
            sim.clamp(-1.0, 1.0) as f32
        } else {
            0.0
        })
    }

    /// Exponential moving average toward `other`, L2-normalized.
    ///
    /// `weight` is the share given to `other`; 0 returns `self` unchanged.
    pub fn blend(&self, other: &Embedding, weight: f32) -> Result<Embedding> {
        if self.dim() != other.dim() {
            return Err(CoreError::DimensionMismatch {
                expected: self.dim(),
                actual: other.dim(),
            });
        }
        if weight <= 0.0 {
            return Ok(self.clone());
        }

        let weight = f64::from(weight);
        let mixed: Vec<f64> = self
            .values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (1.0 - weight) * f64::from(*a) + weight * f64::from(*b))
            .collect();

        let norm = mixed.iter().map(|x| x * x).sum::<f64>().sqrt();
        if !norm.is_finite() || norm == 0.0 {
            // Opposite vectors cancelled out; keep the previous reference.
            return Ok(self.clone());
        }
        Embedding::new(mixed.iter().map(|x| (x / norm) as f32).collect())
    }
}

fn l2_norm(values: &[f32]) -> f64 {
    values
        .iter()
        .map(|v| f64::from(*v) * f64::from(*v))
        .sum::<f64>()
        .sqrt()
}

/// A registered face cluster representing one person.
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    pub identity_id: IdentityId,
    /// Human label; `None` for auto-registered identities.
    pub display_name: Option<String>,
    pub reference_embedding: Embedding,
    pub registered_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub visit_count: u32,
}

impl Identity {
    /// Display name, or `Person_<id>` for anonymous identities.
    pub fn label(&self) -> String {
        match &self.display_name {
            Some(name) => name.clone(),
            None => format!("Person_{}", self.identity_id),
        }
    }
}

/// One continuous presence interval for an identity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Session {
    pub session_id: SessionId,
    pub identity_id: IdentityId,
    pub check_in: DateTime<Utc>,
    /// `None` while the session is open.
    pub check_out: Option<DateTime<Utc>>,
}

impl Session {
    pub fn is_open(&self) -> bool {
        self.check_out.is_none()
    }

    pub fn duration(&self) -> Option<Duration> {
        self.check_out.map(|out| out - self.check_in)
    }
}

/// Transition emitted by the session tracker and consumed by the ledger.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Opened {
        session_id: SessionId,
        identity_id: IdentityId,
        check_in: DateTime<Utc>,
    },
    None,
    Closed {
        session_id: SessionId,
        identity_id: IdentityId,
        check_out: DateTime<Utc>,
        duration: Duration,
    },
}

impl SessionEvent {
    pub fn is_none(&self) -> bool {
        matches!(self, SessionEvent::None)
    }

    pub fn session_id(&self) -> Option<SessionId> {
        match self {
            SessionEvent::Opened { session_id, .. } | SessionEvent::Closed { session_id, .. } => {
                Some(*session_id)
            }
            SessionEvent::None => None,
        }
    }
}

/// Aggregate ledger counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LedgerSummary {
    pub sessions: u64,
    pub open_sessions: u64,
    /// Sum of all closed session durations, in seconds.
    pub closed_seconds: f64,
}

/// Registry and attendance statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Stats {
    pub identities: u64,
    pub named_identities: u64,
    pub total_visits: u64,
    pub sessions: u64,
    pub open_sessions: u64,
    pub mean_session_secs: Option<f64>,
}
