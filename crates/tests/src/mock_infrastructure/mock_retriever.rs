//! Scripted retriever and disk cache mocks.

use driftfs_core::action::BlockRequestAction;
use driftfs_core::block::Block;
use driftfs_core::errors::RetrievalError;
use driftfs_core::prefetcher::BlockPrefetcher;
use driftfs_core::retriever::{BlockRetriever, DiskBlockCache, FetchContext, RetrievalReceiver};
use driftfs_core::types::{
    BlockId, BlockPointer, CacheLifetime, DiskCacheType, FolderId, KeyMetadata, PrefetchStatus,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::oneshot;

/// One retrieval issued through the mock.
#[derive(Debug, Clone)]
pub struct RequestRecord {
    pub ptr: BlockPointer,
    pub priority: i32,
    pub action: BlockRequestAction,
}

#[derive(Default)]
struct MockState {
    blocks: HashMap<BlockId, Block>,
    /// Ids whose retrievals are held back until the test releases them.
    held: HashSet<BlockId>,
    /// Held retrievals waiting on a release.
    pending: HashMap<BlockId, Vec<PendingRetrieval>>,
    /// Ids already in the "cache": requests for these complete without
    /// feeding back into the prefetcher, like a cache hit in production.
    cached: HashSet<BlockId>,
    requests: Vec<RequestRecord>,
    puts: Vec<(BlockId, PrefetchStatus)>,
    prefetcher: Option<BlockPrefetcher>,
}

struct PendingRetrieval {
    tx: oneshot::Sender<Result<Block, RetrievalError>>,
    feedback: Option<Feedback>,
}

struct Feedback {
    ptr: BlockPointer,
    kmd: KeyMetadata,
    priority: i32,
    lifetime: CacheLifetime,
    action: BlockRequestAction,
}

/// Scripted block retriever.
///
/// Responses complete instantly unless the block is [`held`](Self::hold).
/// The first retrieval of a block plays the role of a server fetch: the
/// fetched block is fed back through
/// [`BlockPrefetcher::process_block_for_prefetch`], exactly as the retrieval
/// layer does in production. Later retrievals (and anything already written
/// via `put_in_caches`) count as cache hits and complete silently.
pub struct MockRetriever {
    state: Mutex<MockState>,
}

impl MockRetriever {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { state: Mutex::new(MockState::default()) })
    }

    /// Wires the feedback loop up. Must be called after the prefetcher is
    /// built (the retriever is a constructor argument of the prefetcher).
    pub fn attach(&self, prefetcher: BlockPrefetcher) {
        self.state.lock().prefetcher = Some(prefetcher);
    }

    pub fn script(&self, id: BlockId, block: Block) {
        self.state.lock().blocks.insert(id, block);
    }

    /// Holds retrievals of `id` until [`release`](Self::release).
    pub fn hold(&self, id: BlockId) {
        self.state.lock().held.insert(id);
    }

    /// Completes every held retrieval of `id` and stops holding it.
    pub fn release(&self, id: BlockId) {
        let (pending, result) = {
            let mut state = self.state.lock();
            state.held.remove(&id);
            let pending = state.pending.remove(&id).unwrap_or_default();
            let result = state
                .blocks
                .get(&id)
                .cloned()
                .ok_or(RetrievalError::NotFound(id));
            (pending, result)
        };
        for retrieval in pending {
            Self::complete(retrieval, result.clone(), &self.state);
        }
    }

    /// Ids written back with `Finished`, in put order.
    pub fn finished_puts(&self) -> Vec<BlockId> {
        self.state
            .lock()
            .puts
            .iter()
            .filter(|(_, status)| *status == PrefetchStatus::Finished)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn puts(&self) -> Vec<(BlockId, PrefetchStatus)> {
        self.state.lock().puts.clone()
    }

    pub fn requests(&self) -> Vec<RequestRecord> {
        self.state.lock().requests.clone()
    }

    pub fn request_count(&self) -> usize {
        self.state.lock().requests.len()
    }

    fn complete(
        retrieval: PendingRetrieval,
        result: Result<Block, RetrievalError>,
        state: &Mutex<MockState>,
    ) {
        let feedback = match (&result, retrieval.feedback) {
            (Ok(_), Some(feedback)) => Some(feedback),
            _ => None,
        };
        let block = result.as_ref().ok().cloned();
        let _ = retrieval.tx.send(result);

        if let (Some(feedback), Some(block)) = (feedback, block) {
            let prefetcher = state.lock().prefetcher.clone();
            if let Some(prefetcher) = prefetcher {
                // Spawned so the feedback runs outside the caller's stack
                // and lock scope, like the retrieval layer's own executor.
                tokio::spawn(async move {
                    prefetcher.process_block_for_prefetch(
                        feedback.ptr,
                        &block,
                        &feedback.kmd,
                        feedback.priority,
                        feedback.lifetime,
                        PrefetchStatus::NotPrefetched,
                        feedback.action,
                    );
                });
            }
        }
    }
}

impl BlockRetriever for MockRetriever {
    fn request(
        &self,
        _ctx: &FetchContext,
        priority: i32,
        kmd: &KeyMetadata,
        ptr: BlockPointer,
        _empty: Block,
        lifetime: CacheLifetime,
        action: BlockRequestAction,
    ) -> RetrievalReceiver {
        let (tx, rx) = oneshot::channel();
        let (retrieval, result) = {
            let mut state = self.state.lock();
            state.requests.push(RequestRecord { ptr, priority, action });

            // First retrieval of a block is a server fetch and feeds back;
            // the block then counts as cached.
            let feedback = if state.cached.insert(ptr.id) {
                Some(Feedback {
                    ptr,
                    kmd: kmd.clone(),
                    priority,
                    lifetime,
                    action,
                })
            } else {
                None
            };
            let retrieval = PendingRetrieval { tx, feedback };

            if state.held.contains(&ptr.id) {
                state.pending.entry(ptr.id).or_default().push(retrieval);
                return rx;
            }
            let result = state
                .blocks
                .get(&ptr.id)
                .cloned()
                .ok_or(RetrievalError::NotFound(ptr.id));
            (retrieval, result)
        };
        Self::complete(retrieval, result, &self.state);
        rx
    }

    fn put_in_caches(
        &self,
        _ctx: &FetchContext,
        ptr: BlockPointer,
        _folder: FolderId,
        _block: &Block,
        _lifetime: CacheLifetime,
        status: PrefetchStatus,
    ) -> Result<(), RetrievalError> {
        let mut state = self.state.lock();
        state.cached.insert(ptr.id);
        state.puts.push((ptr.id, status));
        Ok(())
    }
}

/// Disk cache stub whose free space the test controls.
pub struct MockDiskCache {
    has_space: Mutex<bool>,
}

impl MockDiskCache {
    pub fn new(has_space: bool) -> Arc<Self> {
        Arc::new(Self { has_space: Mutex::new(has_space) })
    }

    pub fn set_has_space(&self, has_space: bool) {
        *self.has_space.lock() = has_space;
    }
}

impl DiskBlockCache for MockDiskCache {
    fn does_cache_have_space(&self, _cache_type: DiskCacheType) -> Result<bool, RetrievalError> {
        Ok(*self.has_space.lock())
    }
}
