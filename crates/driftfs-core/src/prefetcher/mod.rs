//! Speculative block prefetching.
//!
//! When a user-driven fetch lands a directory or file block, the prefetcher
//! fetches the block's descendants into the local caches so later reads hit
//! warm memory or disk. It tracks, per in-flight prefetch, how many blocks
//! of the subtree are still outstanding; when a subtree completes, the root
//! block is written back to the caches with [`PrefetchStatus::Finished`].
//!
//! # Architecture
//!
//! ```text
//!             process_block_for_prefetch / cancel_prefetch / wait_channel
//!                                     │
//!                        unbounded event channels
//!                                     │
//!                                     ▼
//!  ┌──────────────────────── PrefetchWorker ───────────────────────┐
//!  │  active: BlockId -> PrefetchRecord   (the prefetch forest)    │
//!  │  rescheduled: BlockId -> backoff + timer                      │
//!  └──────┬──────────────────────────────────────────────┬─────────┘
//!         │ fetches                     completion handles│
//!         ▼                                               ▼
//!   BlockRetriever ──────────────────────────────▶ in-flight drain task
//! ```
//!
//! All bookkeeping is owned by the single worker task; the public
//! [`BlockPrefetcher`] handle is a cheap-clone sender bundle that is safe to
//! use from any task.
//!
//! # Usage
//!
//! ```ignore
//! let prefetcher = BlockPrefetcher::new(config, retriever, Some(disk_cache));
//! prefetcher.process_block_for_prefetch(
//!     ptr, &block, &kmd, priority, lifetime, status, action,
//! );
//! let wait = prefetcher.wait_channel_for_block_prefetch(ptr).await?;
//! wait.wait().await; // resolves when the whole subtree is cached
//! ```

mod record;
mod worker;

use crate::action::BlockRequestAction;
use crate::block::Block;
use crate::config::PrefetcherConfig;
use crate::errors::PrefetchError;
use crate::retriever::{BlockRetriever, DiskBlockCache, FetchContext};
use crate::types::{BlockPointer, CacheLifetime, KeyMetadata, PrefetchStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use worker::{run_inflight_drain, stop_if_needed, PrefetchWorker, StopVerdict};

/// One queued prefetch event.
pub(crate) struct PrefetchRequest {
    pub(crate) ptr: BlockPointer,
    /// Empty block naming the expected shape.
    pub(crate) block: Block,
    pub(crate) kmd: KeyMetadata,
    pub(crate) priority: i32,
    pub(crate) lifetime: CacheLifetime,
    /// The block's prefetch status as known to the caller when the request
    /// was made.
    pub(crate) prefetch_status: PrefetchStatus,
    pub(crate) action: BlockRequestAction,
    /// Set only by wait-channel queries; the worker replies instead of
    /// prefetching.
    pub(crate) wait_reply: Option<oneshot::Sender<WaitHandle>>,
}

impl PrefetchRequest {
    /// A copy suitable for re-submitting from a reschedule timer.
    pub(crate) fn to_retrigger(&self) -> Self {
        Self {
            block: self.block.clone(),
            kmd: self.kmd.clone(),
            wait_reply: None,
            ..*self
        }
    }
}

/// Resolves when the subtree under a block finishes prefetching, is
/// cancelled, or the prefetcher shuts down.
#[derive(Debug, Clone)]
pub struct WaitHandle {
    rx: watch::Receiver<bool>,
}

impl WaitHandle {
    pub(crate) fn new(rx: watch::Receiver<bool>) -> Self {
        Self { rx }
    }

    /// A handle that is already resolved, for blocks the prefetcher is not
    /// tracking.
    pub(crate) fn finished() -> Self {
        let (tx, rx) = watch::channel(true);
        drop(tx);
        Self { rx }
    }

    /// Whether the signal has already been raised.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        *self.rx.borrow()
    }

    /// Waits for the signal. Callers needing a deadline wrap this in
    /// `tokio::time::timeout`.
    pub async fn wait(mut self) {
        // A dropped sender means the worker is gone; resolve rather than
        // hang.
        let _ = self.rx.wait_for(|done| *done).await;
    }
}

/// Resolves once the prefetcher has fully drained after a shutdown.
#[derive(Debug, Clone)]
pub struct DoneHandle {
    rx: watch::Receiver<bool>,
}

impl DoneHandle {
    pub async fn wait(mut self) {
        let _ = self.rx.wait_for(|done| *done).await;
    }
}

/// Public handle to the block prefetcher.
///
/// Cheap to clone; all clones drive the same worker. Methods are safe to
/// call from any task and never block: they enqueue events on unbounded
/// channels.
#[derive(Clone)]
pub struct BlockPrefetcher {
    inner: Arc<Inner>,
}

struct Inner {
    request_tx: mpsc::UnboundedSender<PrefetchRequest>,
    cancel_tx: mpsc::UnboundedSender<BlockPointer>,
    reschedule_tx: mpsc::UnboundedSender<PrefetchRequest>,
    shutdown_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
    retriever: Arc<dyn BlockRetriever>,
    disk_cache: Option<Arc<dyn DiskBlockCache>>,
    root_cancel: CancellationToken,
    timeout: Duration,
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Last handle gone: shut the worker down rather than leak it.
        let _ = self.shutdown_tx.send(true);
    }
}

impl Inner {
    fn fetch_context(&self) -> FetchContext {
        FetchContext::new(self.root_cancel.child_token(), Instant::now() + self.timeout)
    }

    fn is_shut_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }
}

impl BlockPrefetcher {
    /// Creates the prefetcher and spawns its worker and drain tasks.
    ///
    /// Passing no disk cache disables the cache-pressure gate.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    #[must_use]
    pub fn new(
        config: PrefetcherConfig,
        retriever: Arc<dyn BlockRetriever>,
        disk_cache: Option<Arc<dyn DiskBlockCache>>,
    ) -> Self {
        let timeout = config.prefetch_timeout();
        let (worker, channels) =
            PrefetchWorker::new(config, retriever.clone(), disk_cache.clone());

        tokio::spawn(run_inflight_drain(
            channels.inflight_rx,
            channels.shutdown_tx.subscribe(),
            channels.almost_done_tx,
        ));
        tokio::spawn(worker.run());

        Self {
            inner: Arc::new(Inner {
                request_tx: channels.request_tx,
                cancel_tx: channels.cancel_tx,
                reschedule_tx: channels.reschedule_tx,
                shutdown_tx: channels.shutdown_tx,
                done_rx: channels.done_rx,
                retriever,
                disk_cache,
                root_cancel: channels.root_cancel,
                timeout,
            }),
        }
    }

    /// Entry point called after a user-driven fetch completes: caches the
    /// block and, depending on its status and the action, triggers a
    /// prefetch of its descendants.
    #[allow(clippy::too_many_arguments)]
    pub fn process_block_for_prefetch(
        &self,
        ptr: BlockPointer,
        block: &Block,
        kmd: &KeyMetadata,
        priority: i32,
        lifetime: CacheLifetime,
        prefetch_status: PrefetchStatus,
        action: BlockRequestAction,
    ) {
        let req = PrefetchRequest {
            ptr,
            block: block.new_empty(),
            kmd: kmd.clone(),
            priority,
            lifetime,
            prefetch_status,
            action,
            wait_reply: None,
        };
        if prefetch_status == PrefetchStatus::Finished {
            // Already cached as finished; the worker short-circuits it.
        } else if !action.prefetch(block) {
            // Cache with the status unchanged; nothing gets triggered below
            // this block.
            let ctx = self.inner.fetch_context();
            if let Err(err) = self.inner.retriever.put_in_caches(
                &ctx,
                ptr,
                kmd.folder_id(),
                block,
                lifetime,
                prefetch_status,
            ) {
                debug!(block = %ptr, error = %err, "couldn't cache block");
            }
        } else {
            // The cache sees `Triggered` now; the queued request keeps the
            // caller's status so the worker can still short-circuit.
            let ctx = self.inner.fetch_context();
            if let Err(err) = self.inner.retriever.put_in_caches(
                &ctx,
                ptr,
                kmd.folder_id(),
                block,
                lifetime,
                PrefetchStatus::Triggered,
            ) {
                warn!(block = %ptr, error = %err, "error caching block, canceling its prefetch");
                self.cancel_prefetch(ptr);
                return;
            }
            match stop_if_needed(self.inner.disk_cache.as_deref(), &req) {
                StopVerdict::Proceed => {}
                StopVerdict::Stop => return,
                StopVerdict::Reschedule => {
                    self.reschedule(req);
                    return;
                }
            }
        }
        self.trigger(req);
    }

    /// Obtains a signal that resolves when the whole subtree under `ptr` is
    /// prefetched. For blocks the prefetcher is not tracking the signal is
    /// already resolved.
    ///
    /// The query travels through the same queue as prefetch requests, so it
    /// observes any request for the block submitted earlier by the caller.
    ///
    /// # Errors
    ///
    /// Returns [`PrefetchError::ShuttingDown`] after shutdown.
    pub async fn wait_channel_for_block_prefetch(
        &self,
        ptr: BlockPointer,
    ) -> Result<WaitHandle, PrefetchError> {
        if self.inner.is_shut_down() {
            return Err(PrefetchError::ShuttingDown);
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        let req = PrefetchRequest {
            ptr,
            block: Block::Other,
            kmd: KeyMetadata::default(),
            priority: 0,
            lifetime: CacheLifetime::Transient,
            prefetch_status: PrefetchStatus::NotPrefetched,
            action: BlockRequestAction::SOLO,
            wait_reply: Some(reply_tx),
        };
        self.inner
            .request_tx
            .send(req)
            .map_err(|_| PrefetchError::ShuttingDown)?;

        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        tokio::select! {
            reply = reply_rx => reply.map_err(|_| PrefetchError::ShuttingDown),
            res = shutdown_rx.wait_for(|down| *down) => {
                let _ = res;
                Err(PrefetchError::ShuttingDown)
            }
        }
    }

    /// Cancels the prefetch reachable through `ptr`'s ref nonce. Sibling
    /// references to the same block id are untouched.
    pub fn cancel_prefetch(&self, ptr: BlockPointer) {
        if self.inner.is_shut_down() {
            warn!(block = %ptr, "skipping prefetch cancel, prefetcher is shut down");
            return;
        }
        let _ = self.inner.cancel_tx.send(ptr);
    }

    /// Shuts the prefetcher down. Idempotent; every call returns a handle
    /// that resolves once in-flight retrievals are drained and the worker
    /// has served everything already queued.
    pub fn shutdown(&self) -> DoneHandle {
        let _ = self.inner.shutdown_tx.send(true);
        DoneHandle { rx: self.inner.done_rx.clone() }
    }

    fn trigger(&self, req: PrefetchRequest) {
        if self.inner.is_shut_down() {
            warn!(block = %req.ptr.id, "skipping prefetch, prefetcher is shut down");
            return;
        }
        let _ = self.inner.request_tx.send(req);
    }

    fn reschedule(&self, req: PrefetchRequest) {
        if self.inner.is_shut_down() {
            warn!(block = %req.ptr.id, "skipping prefetch reschedule, prefetcher is shut down");
            return;
        }
        let _ = self.inner.reschedule_tx.send(req);
    }
}
