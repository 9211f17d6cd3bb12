//! Error types for the prefetching subsystem.

use crate::types::BlockId;
use thiserror::Error;

/// Errors surfaced by the block-retrieval layer and the caches it writes to.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum RetrievalError {
    /// The request exceeded its deadline.
    #[error("retrieval timed out")]
    Timeout,

    /// No reachable server holds the block.
    #[error("block {0} not found")]
    NotFound(BlockId),

    /// Transport-level failure reaching the block servers.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The fetched bytes did not hash to the requested id.
    #[error("block {0} failed content verification")]
    VerificationFailed(BlockId),

    /// A cache rejected the write.
    #[error("cache write failed: {0}")]
    CacheWrite(String),

    /// The request's cancellation scope fired before completion.
    #[error("retrieval canceled")]
    Canceled,
}

impl RetrievalError {
    /// Returns `true` if retrying the same request later could succeed.
    ///
    /// Transient failures leave the affected subtree incomplete but the
    /// coordinator healthy; a later request or an explicit cache put can
    /// still finish the prefetch.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout | Self::ConnectionFailed(_) | Self::CacheWrite(_) => true,
            Self::NotFound(_) | Self::VerificationFailed(_) | Self::Canceled => false,
        }
    }
}

/// Errors returned by the prefetcher's public surface.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum PrefetchError {
    /// The prefetcher has been shut down; no further events are accepted.
    #[error("prefetcher already shut down")]
    ShuttingDown,

    /// A block shape the child enumeration cannot walk.
    #[error("unknown block type")]
    UnknownBlockType,
}
