//! Error types of the pool.

use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, PoolError>;

/// Everything that can go wrong while handing out chunks.
///
/// Returning memory never fails: null pointers are ignored and chunks that
/// belong to another pool are routed to that pool's reclamation queue.
#[must_use = "errors should be handled"]
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// The raw memory backend could not supply a new block.
    #[error("block allocation failed: {size} bytes with {align} byte alignment")]
    AllocationFailed { size: usize, align: usize },

    /// The requested type does not fit in a chunk of this pool.
    #[error(
        "type of {size} bytes aligned to {align} does not fit chunks of {chunk_size} bytes aligned to {alignment}"
    )]
    IncompatibleLayout {
        size: usize,
        align: usize,
        chunk_size: usize,
        alignment: usize,
    },

    /// The configuration produces a block layout that cannot be represented.
    #[error("invalid pool configuration: {reason}")]
    InvalidConfig { reason: String },

    /// The calling thread's pool registry was already destroyed or is
    /// borrowed further up the stack.
    #[error("thread local pool registry is unavailable")]
    RegistryUnavailable,
}

impl PoolError {
    /// Whether calling again could succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::AllocationFailed { .. })
    }

    pub(crate) fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }
}
