//! presence-core — Identity resolution and attendance session engine.
//!
//! Given face embeddings from an external detector, decides whether each
//! one belongs to a known person or a new one, and maintains check-in /
//! check-out sessions keyed on those identities.

pub mod error;
pub mod matcher;
pub mod pipeline;
pub mod registrar;
pub mod store;
pub mod tracker;
pub mod types;

pub use error::{CoreError, Result};
pub use matcher::{CosineMatcher, MatchResult, Matcher};
pub use pipeline::{Pipeline, PipelineConfig, TickReport};
pub use registrar::{IdentityRegistrar, Resolution};
pub use store::{stats, AttendanceLedger, EmbeddingStore, MemoryStore, Store};
pub use tracker::{CheckoutPolicy, SessionTracker};
pub use types::{
    BoundingBox, Detection, Embedding, FrameObservation, Identity, IdentityId, LedgerSummary,
    Session, SessionEvent, SessionId, Stats,
};
