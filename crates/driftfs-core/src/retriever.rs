//! Interfaces to the block-retrieval layer and the on-disk caches.
//!
//! The prefetcher never performs I/O itself. It issues requests through
//! [`BlockRetriever`] and receives a completion channel per request; the
//! retriever must return the channel promptly and do the actual waiting
//! elsewhere, because the prefetch worker awaits some completions inline.

use crate::action::BlockRequestAction;
use crate::block::Block;
use crate::errors::RetrievalError;
use crate::types::{BlockPointer, CacheLifetime, DiskCacheType, FolderId, KeyMetadata, PrefetchStatus};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Completion channel for a single block retrieval. Carries the fetched
/// block or the failure; a dropped sender means the retrieval was abandoned.
pub type RetrievalReceiver = oneshot::Receiver<Result<Block, RetrievalError>>;

/// Cancellation scope handed to the retriever with every request.
///
/// The token is cancelled when the owning prefetch is cancelled or the
/// prefetcher shuts down; the deadline bounds the whole prefetch subtree.
#[derive(Debug, Clone)]
pub struct FetchContext {
    pub cancel: CancellationToken,
    pub deadline: Instant,
}

impl FetchContext {
    #[must_use]
    pub fn new(cancel: CancellationToken, deadline: Instant) -> Self {
        Self { cancel, deadline }
    }
}

/// The block-retrieval layer: fetches named blocks from peers or servers and
/// writes them into the memory and disk caches.
pub trait BlockRetriever: Send + Sync {
    /// Issues a single block fetch.
    ///
    /// `empty` names the expected block shape. The returned channel resolves
    /// with the fetched block or the retrieval error; implementations must
    /// not block in this call.
    fn request(
        &self,
        ctx: &FetchContext,
        priority: i32,
        kmd: &KeyMetadata,
        ptr: BlockPointer,
        empty: Block,
        lifetime: CacheLifetime,
        action: BlockRequestAction,
    ) -> RetrievalReceiver;

    /// Writes a block into the memory and/or disk caches with the given
    /// prefetch status.
    ///
    /// # Errors
    ///
    /// Returns `RetrievalError::CacheWrite` when the caches reject the
    /// block.
    fn put_in_caches(
        &self,
        ctx: &FetchContext,
        ptr: BlockPointer,
        folder: FolderId,
        block: &Block,
        lifetime: CacheLifetime,
        status: PrefetchStatus,
    ) -> Result<(), RetrievalError>;
}

/// Space oracle for the on-disk caches. Queried, never reserved; races with
/// concurrent writers are benign because the next request re-checks.
pub trait DiskBlockCache: Send + Sync {
    /// Whether the given cache currently has room for more blocks.
    ///
    /// # Errors
    ///
    /// Returns the underlying cache error; callers treat an error as "has
    /// room" and proceed.
    fn does_cache_have_space(&self, cache_type: DiskCacheType) -> Result<bool, RetrievalError>;
}
