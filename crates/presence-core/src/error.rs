use crate::types::{IdentityId, SessionId};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoreError {
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("invalid embedding: {0}")]
    InvalidEmbedding(String),
    #[error("unknown identity: {0}")]
    UnknownIdentity(IdentityId),
    #[error("unknown session: {0}")]
    UnknownSession(SessionId),
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl CoreError {
    /// The durable store refused a read or write. The tick may be retried.
    pub fn is_storage(&self) -> bool {
        matches!(self, CoreError::StorageUnavailable(_))
    }

    /// The input embedding was unusable. Reject the detection and carry on.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            CoreError::DimensionMismatch { .. } | CoreError::InvalidEmbedding(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
