//! The single-owner prefetch worker.
//!
//! All prefetch state lives in one task: the map of active prefetches and
//! the map of rescheduled (backed-off) top-level prefetches. Public API
//! methods never touch either map; they enqueue events over unbounded
//! channels and the worker serves them one at a time, so no lock is ever
//! taken on the bookkeeping.
//!
//! # How a subtree drains
//!
//! For a synced prefetch of `a -> {b -> {c, d}, e -> {f, g}}` the active map
//! evolves as:
//!
//! 1. `a` is fetched, triggers `b` and `e`: `a:2 -> {b:1, e:1}`
//! 2. `b` is fetched, decrements `b` and `a` by 1, then registers `c` and
//!    `d`, adding 2 back up the chain: `a:3 -> {b:2 -> {c:1, d:1}, e:1}`
//! 3. `c` is fetched and is a tail, so it completes up the tree:
//!    `a:2 -> {b:1 -> {d:1}, e:1}`
//! 4. `d` completes: `a:1 -> {e:1}`
//! 5. `e` is fetched, registers `f` and `g`: `a:2 -> {e:2 -> {f:1, g:1}}`
//! 6. `f` completes: `a:1 -> {e:1 -> {g:1}}`
//! 7. `g` completes `g`, `e`, and `a`: empty.
//!
//! A block may gain extra parents mid-flight: a write that lands while `b`
//! is fetching creates a brand-new ancestor `a'` sharing `b`. Content
//! addressing guarantees the parent graph stays a forest (at most one
//! directed path between any two nodes); a repeated node during a walk means
//! the forest is corrupt, and the worker aborts rather than double-count
//! forever.

use crate::action::BlockRequestAction;
use crate::block::{entries_by_size_asc, Block, EntryType};
use crate::config::PrefetcherConfig;
use crate::errors::PrefetchError;
use crate::retriever::{BlockRetriever, DiskBlockCache, FetchContext, RetrievalReceiver};
use crate::types::{
    BlockId, BlockPointer, CacheLifetime, KeyMetadata, PrefetchStatus, RefNonce,
    ON_DEMAND_REQUEST_PRIORITY,
};
use ahash::{AHashMap, AHashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use super::record::{PrefetchRecord, RescheduledPrefetch};
use super::{PrefetchRequest, WaitHandle};

/// Effective priority for a child prefetch: one below the parent that
/// caused it. This drains each subtree roughly depth-first while unrelated
/// interactive requests keep their relative ordering. The action is
/// accepted for future policy and currently unused.
pub(crate) fn calculate_priority(base_priority: i32, _action: BlockRequestAction) -> i32 {
    base_priority - 1
}

/// Outcome of the cache-pressure gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StopVerdict {
    /// There is room (or no disk cache); carry on.
    Proceed,
    /// The target cache is full and the action says to stop silently.
    Stop,
    /// The sync cache is full; defer the request with backoff.
    Reschedule,
}

/// Asks the disk cache whether the request's target cache has room.
///
/// Space is queried, never reserved; an occasional over-enqueue from a race
/// is absorbed by the re-check on the next request. Errors from the cache
/// are logged and treated as "has room".
pub(crate) fn stop_if_needed(
    disk_cache: Option<&dyn DiskBlockCache>,
    req: &PrefetchRequest,
) -> StopVerdict {
    let Some(cache) = disk_cache else {
        return StopVerdict::Proceed;
    };
    let has_room = match cache.does_cache_have_space(req.action.cache_type()) {
        Ok(has_room) => has_room,
        Err(err) => {
            debug!(error = %err, "error checking disk cache space");
            return StopVerdict::Proceed;
        }
    };
    if has_room {
        return StopVerdict::Proceed;
    }
    if req.action.sync() {
        debug!(block = %req.ptr.id, "sync cache full, deferring prefetch");
        return StopVerdict::Reschedule;
    }
    if req.action.stop_if_full() {
        StopVerdict::Stop
    } else {
        StopVerdict::Proceed
    }
}

/// Sender/receiver bundle produced alongside a worker. The public handle
/// keeps the senders; the drain task takes `inflight_rx`.
pub(crate) struct WorkerChannels {
    pub(crate) request_tx: mpsc::UnboundedSender<PrefetchRequest>,
    pub(crate) cancel_tx: mpsc::UnboundedSender<BlockPointer>,
    pub(crate) reschedule_tx: mpsc::UnboundedSender<PrefetchRequest>,
    pub(crate) inflight_rx: mpsc::UnboundedReceiver<RetrievalReceiver>,
    pub(crate) almost_done_tx: mpsc::Sender<()>,
    pub(crate) shutdown_tx: watch::Sender<bool>,
    pub(crate) done_rx: watch::Receiver<bool>,
    pub(crate) root_cancel: CancellationToken,
}

/// The prefetch coordinator state. Owned by exactly one task.
pub(crate) struct PrefetchWorker {
    config: PrefetcherConfig,
    retriever: Arc<dyn BlockRetriever>,
    disk_cache: Option<Arc<dyn DiskBlockCache>>,

    /// The prefetch forest, keyed by block id.
    pub(crate) active: AHashMap<BlockId, PrefetchRecord>,
    /// Backed-off top-level prefetches, keyed by block id.
    pub(crate) rescheduled: AHashMap<BlockId, RescheduledPrefetch>,

    request_rx: mpsc::UnboundedReceiver<PrefetchRequest>,
    cancel_rx: mpsc::UnboundedReceiver<BlockPointer>,
    reschedule_rx: mpsc::UnboundedReceiver<PrefetchRequest>,
    almost_done_rx: mpsc::Receiver<()>,

    /// For reschedule timers to re-enqueue their request.
    request_tx: mpsc::UnboundedSender<PrefetchRequest>,
    /// Completion handles of fetches issued for children; drained by the
    /// shutdown helper task.
    inflight_tx: mpsc::UnboundedSender<RetrievalReceiver>,
    shutdown_rx: watch::Receiver<bool>,
    done_tx: watch::Sender<bool>,
    root_cancel: CancellationToken,
}

impl PrefetchWorker {
    pub(crate) fn new(
        config: PrefetcherConfig,
        retriever: Arc<dyn BlockRetriever>,
        disk_cache: Option<Arc<dyn DiskBlockCache>>,
    ) -> (Self, WorkerChannels) {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = mpsc::unbounded_channel();
        let (reschedule_tx, reschedule_rx) = mpsc::unbounded_channel();
        let (inflight_tx, inflight_rx) = mpsc::unbounded_channel();
        let (almost_done_tx, almost_done_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);
        let root_cancel = CancellationToken::new();

        let worker = Self {
            config,
            retriever,
            disk_cache,
            active: AHashMap::new(),
            rescheduled: AHashMap::new(),
            request_rx,
            cancel_rx,
            reschedule_rx,
            almost_done_rx,
            request_tx: request_tx.clone(),
            inflight_tx,
            shutdown_rx: shutdown_rx.clone(),
            done_tx,
            root_cancel: root_cancel.clone(),
        };
        let channels = WorkerChannels {
            request_tx,
            cancel_tx,
            reschedule_tx,
            inflight_rx,
            almost_done_tx,
            shutdown_tx,
            done_rx,
            root_cancel,
        };
        (worker, channels)
    }

    /// Serves events until shutdown, then drains every queue before closing
    /// the `done` signal.
    pub(crate) async fn run(mut self) {
        enum Event {
            AlmostDone,
            Cancel(BlockPointer),
            Reschedule(PrefetchRequest),
            Request(PrefetchRequest),
            ChannelsClosed,
        }

        loop {
            let event = tokio::select! {
                Some(()) = self.almost_done_rx.recv() => Event::AlmostDone,
                Some(ptr) = self.cancel_rx.recv() => Event::Cancel(ptr),
                Some(req) = self.reschedule_rx.recv() => Event::Reschedule(req),
                Some(req) = self.request_rx.recv() => Event::Request(req),
                else => Event::ChannelsClosed,
            };
            match event {
                Event::AlmostDone => {
                    debug!("starting shutdown");
                    let ids: Vec<BlockId> = self.rescheduled.keys().copied().collect();
                    for id in ids {
                        self.clear_reschedule_state(&id);
                    }
                    break;
                }
                Event::Cancel(ptr) => self.handle_cancel(ptr),
                Event::Reschedule(req) => self.handle_reschedule(req),
                Event::Request(req) => self.handle_request(req).await,
                Event::ChannelsClosed => break,
            }
        }

        // Serve whatever was already queued when the shutdown fired. New
        // events can no longer arrive: the public handle refuses sends once
        // the shutdown signal is up.
        loop {
            let mut progressed = false;
            while let Ok(ptr) = self.cancel_rx.try_recv() {
                self.handle_cancel(ptr);
                progressed = true;
            }
            while let Ok(req) = self.reschedule_rx.try_recv() {
                self.handle_reschedule(req);
                progressed = true;
            }
            while let Ok(req) = self.request_rx.try_recv() {
                self.handle_request(req).await;
                progressed = true;
            }
            if !progressed {
                break;
            }
        }

        let ids: Vec<BlockId> = self.rescheduled.keys().copied().collect();
        for id in ids {
            self.clear_reschedule_state(&id);
        }
        self.rescheduled.clear();
        for (_, rec) in self.active.drain() {
            rec.close();
        }
        self.root_cancel.cancel();
        let _ = self.done_tx.send(true);
        debug!("prefetcher shut down");
    }

    fn new_record(&self, count: u64, triggered: bool, req: PrefetchRequest) -> PrefetchRecord {
        PrefetchRecord::new(
            count,
            triggered,
            req,
            self.root_cancel.child_token(),
            Instant::now() + self.config.prefetch_timeout(),
        )
    }

    fn ephemeral_fetch_context(&self) -> FetchContext {
        FetchContext::new(
            self.root_cancel.child_token(),
            Instant::now() + self.config.prefetch_timeout(),
        )
    }

    // --- Event handlers ---

    pub(crate) fn handle_cancel(&mut self, ptr: BlockPointer) {
        if self.active.contains_key(&ptr.id) {
            debug!(block = %ptr, "canceling prefetch");
            // Walk up and drop every ancestor edge reachable through this
            // pointer's ref nonce; other references to the same id stay
            // live.
            self.cancel_ptr_walk(ptr);
        } else if self.rescheduled.contains_key(&ptr.id) {
            debug!(block = %ptr.id, "canceling rescheduled prefetch");
            self.clear_reschedule_state(&ptr.id);
            self.rescheduled.remove(&ptr.id);
        } else {
            debug!(block = %ptr, "nothing to cancel");
        }
    }

    pub(crate) fn handle_reschedule(&mut self, req: PrefetchRequest) {
        let id = req.ptr.id;
        if let Some(rec) = self.active.get_mut(&id) {
            rec.req = req;
        } else {
            // Insert a placeholder so subsequent requests for this block
            // don't create a competing record while the reschedule settles.
            let rec = self.new_record(1, false, req);
            self.active.insert(id, rec);
        }
        debug!(block = %id, "rescheduling top-block prefetch");
        for node in self.collect_ancestry(id) {
            let _guard = self.unroll_guard(node);
            self.reschedule_top_block_node(node);
        }
    }

    /// Serves one prefetch request: solo-fetch the block, then decide
    /// whether and how to walk into its children.
    // One request flows through a fixed sequence of gates; splitting them
    // into helpers would hide the order the gates must run in.
    #[allow(clippy::too_many_lines)]
    pub(crate) async fn handle_request(&mut self, mut req: PrefetchRequest) {
        let block_id = req.ptr.id;

        // A request that only wants the wait channel is answered from the
        // same queue, guaranteeing any earlier request for this block was
        // served first.
        if let Some(reply) = req.wait_reply.take() {
            let handle = match self.active.get(&block_id) {
                Some(rec) => rec.wait_handle(),
                None => WaitHandle::finished(),
            };
            let _ = reply.send(handle);
            return;
        }

        self.clear_reschedule_state(&block_id);

        debug!(block = %req.ptr, action = %req.action, "handling prefetch request");

        let (fetch_ctx, is_active) = match self.active.get(&block_id) {
            Some(rec) => (rec.fetch_context(), true),
            None => (self.ephemeral_fetch_context(), false),
        };

        // Ensure the block is in the right cache. No other events are served
        // while this waits, so retrievers must resolve the channel from
        // their own executor.
        let receiver = self.retriever.request(
            &fetch_ctx,
            ON_DEMAND_REQUEST_PRIORITY,
            &req.kmd,
            req.ptr,
            req.block.new_empty(),
            req.lifetime,
            req.action.solo_action(),
        );
        let block = match receiver.await {
            Ok(Ok(block)) => block,
            Ok(Err(err)) => {
                warn!(block = %block_id, error = %err, "error requesting block");
                return;
            }
            Err(_) => {
                warn!(block = %block_id, "retrieval abandoned");
                return;
            }
        };

        // Finished blocks and tails have nothing below them to fetch.
        if req.prefetch_status == PrefetchStatus::Finished || block.is_tail() {
            if is_active {
                // Decrementing by the full remaining count guarantees the
                // record is removed on the way up.
                let count = self
                    .active
                    .get(&block_id)
                    .map_or(0, |rec| rec.subtree_block_count);
                self.complete_prefetch_walk(block_id, count).await;
            } else {
                debug!(block = %block_id, "skipping prefetch for finished block");
                if req.prefetch_status != PrefetchStatus::Finished {
                    if let Err(err) = self.retriever.put_in_caches(
                        &fetch_ctx,
                        req.ptr,
                        req.kmd.folder_id(),
                        &block,
                        req.lifetime,
                        PrefetchStatus::Finished,
                    ) {
                        debug!(block = %req.ptr, error = %err, "couldn't put finished block in cache");
                    }
                }
            }
            return;
        }

        if !req.action.prefetch(&block) {
            debug!(block = %block_id, action = %req.action, "skipping prefetch per action");
            let existing_skips = self
                .active
                .get(&block_id)
                .is_some_and(|rec| !rec.req.action.prefetch(&block));
            if existing_skips {
                // Not a tail (caught above), so give up on the subtree
                // rather than leave it counted forever.
                self.cancel_ptr_walk(req.ptr);
            }
            return;
        }

        if req.prefetch_status == PrefetchStatus::Triggered && !req.action.deep_sync() {
            if let Some(rec) = self.active.get(&block_id) {
                if req.action.sync() == rec.req.action.sync()
                    && req.action.stop_if_full() == rec.req.action.stop_if_full()
                {
                    debug!(block = %block_id, "prefetch already triggered");
                    return;
                }
            }
        }

        // Bail out early if the target cache is already full, before the
        // children get enqueued only to be uncacheable.
        match stop_if_needed(self.disk_cache.as_deref(), &req) {
            StopVerdict::Proceed => {}
            StopVerdict::Stop => return,
            StopVerdict::Reschedule => {
                self.handle_reschedule(req);
                return;
            }
        }

        let is_prefetch_new = !is_active;
        let event_action = req.action;

        if is_active {
            let (triggered, count, current_action) = {
                let Some(rec) = self.active.get(&block_id) else {
                    return;
                };
                (rec.subtree_triggered, rec.subtree_block_count, rec.req.action)
            };
            let new_action = current_action.combine(req.action);
            if triggered {
                debug!(block = %block_id, "prefetch subtree already triggered");
                if count == 0 {
                    // Only this block is left and an earlier pass never ran
                    // through to the tail, so unwind this reference. A later
                    // request starts the block fresh, which is how an
                    // unsynced subtree upgrades to a synced one.
                    self.cancel_ptr_walk(req.ptr);
                    return;
                }
                if new_action == current_action {
                    return;
                }
                if let Some(rec) = self.active.get_mut(&block_id) {
                    rec.req.action = new_action;
                }
            } else {
                // The block was counted in the tree and has now been
                // fetched; percolate that up before enumerating children.
                if count == 0 {
                    error!(
                        block = %block_id,
                        "prefetch was in the tree and untriggered, but its subtree count is 0"
                    );
                    panic!("untriggered prefetch with a zero subtree block count");
                }
                self.decrement_prefetch_walk(block_id);
                if let Some(rec) = self.active.get_mut(&block_id) {
                    rec.subtree_triggered = true;
                    rec.req.action = new_action;
                }
            }
        } else {
            if self.active.len() >= self.config.max_active_prefetches {
                warn!(
                    block = %block_id,
                    active = self.active.len(),
                    "active prefetch limit reached, deferring top-level prefetch"
                );
                self.handle_reschedule(req);
                return;
            }
            // Count starts at 0: this block is already fetched, so it must
            // not hold up anything above it. Children found below bump it.
            let rec = self.new_record(0, true, req);
            self.active.insert(block_id, rec);
            debug!(block = %block_id, "created new prefetch");
        }

        let (num_blocks, is_tail) =
            match self.handle_prefetch(block_id, is_prefetch_new, event_action, &block) {
                Ok(result) => result,
                Err(err) => {
                    warn!(block = %block_id, error = %err, "error handling prefetch");
                    return;
                }
            };

        if is_tail {
            debug!(block = %block_id, "completed prefetch for tail block");
            // Zero because the decrement already happened above; this walk
            // just removes any chain of nodes that have reached zero.
            self.complete_prefetch_walk(block_id, 0).await;
            return;
        }
        if num_blocks == 0 {
            debug!(block = %block_id, "no new blocks to prefetch");
            return;
        }
        debug!(block = %block_id, num_blocks, "prefetching children");
        self.add_to_subtree_counts_walk(block_id, num_blocks);
    }

    // --- Child enumeration ---

    /// Dispatches on the block shape and registers every prefetchable child.
    ///
    /// Returns how many blocks not already in the tree now hang below this
    /// one (the amount every ancestor's count must grow by), and whether the
    /// block turned out to be a tail.
    pub(crate) fn handle_prefetch(
        &mut self,
        parent_id: BlockId,
        is_parent_new: bool,
        action: BlockRequestAction,
        block: &Block,
    ) -> Result<(u64, bool), PrefetchError> {
        let (parent_ptr, kmd, lifetime, base_priority) = {
            let Some(rec) = self.active.get(&parent_id) else {
                error!(block = %parent_id, "prefetch record vanished before child enumeration");
                panic!("prefetch record missing during child enumeration");
            };
            (rec.req.ptr, rec.req.kmd.clone(), rec.req.lifetime, rec.req.priority)
        };
        let child_action = action.child_action(block);
        let priority = calculate_priority(base_priority, child_action);
        let mut ids_seen: AHashSet<BlockId> = AHashSet::new();
        let mut num_blocks = 0_u64;

        let is_tail = match block {
            Block::IndirectFile(ptrs) | Block::IndirectDir(ptrs) => {
                for indirect in ptrs {
                    num_blocks += self.register_child(
                        priority,
                        &kmd,
                        indirect.ptr,
                        block.new_empty(),
                        lifetime,
                        parent_ptr,
                        is_parent_new,
                        child_action,
                        &mut ids_seen,
                    );
                }
                ptrs.is_empty()
            }
            Block::DirectDir(children) => {
                let mut total_child_entries = 0_usize;
                // Smaller entries first: they land sooner and make the
                // warmed tree usable earlier.
                for entry in entries_by_size_asc(children) {
                    let shell = match entry.entry_type {
                        EntryType::Dir => Block::empty_dir(),
                        EntryType::File | EntryType::Exec => Block::DirectFile,
                        EntryType::Sym => continue,
                        EntryType::Unknown(kind) => {
                            debug!(block = %parent_id, kind, "skipping entry of unknown type");
                            continue;
                        }
                    };
                    trace!(child = %entry.ptr, action = %child_action, "prefetching directory entry");
                    total_child_entries += 1;
                    num_blocks += self.register_child(
                        priority,
                        &kmd,
                        entry.ptr,
                        shell,
                        lifetime,
                        parent_ptr,
                        is_parent_new,
                        child_action,
                        &mut ids_seen,
                    );
                }
                total_child_entries == 0
            }
            Block::DirectFile => true,
            Block::Other => return Err(PrefetchError::UnknownBlockType),
        };
        Ok((num_blocks, is_tail))
    }

    /// Maps the parent->child edge and triggers the child's fetch if it is
    /// new or its action strengthened.
    ///
    /// Returns the child's current subtree count if the edge is new to this
    /// parent (the parent's contribution to `num_blocks`), zero otherwise.
    #[allow(clippy::too_many_arguments)]
    fn register_child(
        &mut self,
        priority: i32,
        kmd: &KeyMetadata,
        ptr: BlockPointer,
        shell: Block,
        lifetime: CacheLifetime,
        parent_ptr: BlockPointer,
        is_parent_new: bool,
        action: BlockRequestAction,
        ids_seen: &mut AHashSet<BlockId>,
    ) -> u64 {
        if !ids_seen.insert(ptr.id) {
            return 0;
        }

        // A child already waiting shouldn't wait again; only the parent edge
        // is added below.
        let is_waiting = self.active.contains_key(&ptr.id);
        if !is_waiting {
            // Count of 1: the child itself is outstanding until its own
            // fetch comes back through the request queue and decrements it.
            let req = PrefetchRequest {
                ptr,
                block: shell.clone(),
                kmd: kmd.clone(),
                priority,
                lifetime,
                prefetch_status: PrefetchStatus::NotPrefetched,
                action,
                wait_reply: None,
            };
            let rec = self.new_record(1, false, req);
            self.active.insert(ptr.id, rec);
        }

        if let Some(rec) = self.active.get_mut(&ptr.id) {
            let new_action = action.combine(rec.req.action);
            if !is_waiting || rec.req.action != new_action {
                // Upgrading the stored action keeps an earlier weaker
                // request from cancelling this one early, and a fresh fetch
                // covers the case where the earlier request already ran.
                rec.req.action = new_action;
                let receiver = self.retriever.request(
                    &rec.fetch_context(),
                    priority,
                    kmd,
                    ptr,
                    shell,
                    lifetime,
                    action,
                );
                let _ = self.inflight_tx.send(receiver);
            }
        }

        if !self.active.contains_key(&parent_ptr.id) {
            error!(
                parent = %parent_ptr,
                child = %ptr.id,
                "prefetcher doesn't know about the parent of a child block"
            );
            panic!("parent block missing while recording a parent-child edge");
        }

        let Some(rec) = self.active.get_mut(&ptr.id) else {
            return 0;
        };
        let newly_added = rec.parents.entry(ptr.ref_nonce).or_default().insert(parent_ptr);
        if newly_added || is_parent_new {
            // The parent's subtree count must grow by the child's whole
            // outstanding subtree, whether the child just learned about the
            // parent or the parent is a fresh record re-adopting a child it
            // was cancelled away from.
            trace!(child = %ptr.id, parent = %parent_ptr.id, count = rec.subtree_block_count, "recorded parent edge");
            return rec.subtree_block_count;
        }
        0
    }

    // --- Tree walks ---

    /// Guard that names the node a walk was applying to if the walk panics,
    /// so the post-mortem shows where the forest was corrupt.
    fn unroll_guard(&self, id: BlockId) -> UnrollLogGuard {
        let (count, triggered, parent_refs) = self
            .active
            .get(&id)
            .map_or((0, false, 0), |rec| {
                (rec.subtree_block_count, rec.subtree_triggered, rec.parents.len())
            });
        UnrollLogGuard { id, count, triggered, parent_refs }
    }

    /// Collects the ancestry of `start` across every ref nonce, ancestors
    /// first, pruning edges to nodes no longer in the active set and
    /// cleaning emptied nonce buckets along the way.
    ///
    /// Aborts if a node repeats: the parent graph must be a forest, and a
    /// repeat means double counting from here on.
    fn collect_ancestry(&mut self, start: BlockId) -> Vec<BlockId> {
        enum Frame {
            Enter(BlockId),
            Apply(BlockId),
        }
        let mut order = Vec::new();
        let mut visited: AHashSet<BlockId> = AHashSet::new();
        let mut stack = vec![Frame::Enter(start)];
        while let Some(frame) = stack.pop() {
            match frame {
                Frame::Enter(id) => {
                    if !visited.insert(id) {
                        error!(block = %id, "prefetch parent graph revisited a node");
                        panic!("cycle in the prefetch parent graph");
                    }
                    stack.push(Frame::Apply(id));
                    let Some(rec) = self.active.get(&id) else {
                        continue;
                    };
                    let parents: Vec<BlockPointer> = rec
                        .parents
                        .values()
                        .flat_map(|bucket| bucket.iter().copied())
                        .collect();
                    let (live, dead): (Vec<_>, Vec<_>) = parents
                        .into_iter()
                        .partition(|pptr| self.active.contains_key(&pptr.id));
                    if !dead.is_empty() {
                        // The ancestor may have been rescheduled out of the
                        // active set; a later reschedule re-adds the edge.
                        if let Some(rec) = self.active.get_mut(&id) {
                            for pptr in &dead {
                                for bucket in rec.parents.values_mut() {
                                    bucket.remove(pptr);
                                }
                            }
                            rec.parents.retain(|_, bucket| !bucket.is_empty());
                        }
                    }
                    for pptr in live {
                        stack.push(Frame::Enter(pptr.id));
                    }
                }
                Frame::Apply(id) => order.push(id),
            }
        }
        order
    }

    /// Like [`collect_ancestry`](Self::collect_ancestry), but restricted to
    /// parents reachable through each pointer's own ref nonce, so other
    /// references to the same block stay undisturbed.
    fn collect_ptr_ancestry(&mut self, start: BlockPointer) -> Vec<BlockPointer> {
        enum Frame {
            Enter(BlockPointer),
            Apply(BlockPointer),
        }
        let mut order = Vec::new();
        let mut visited: AHashSet<BlockId> = AHashSet::new();
        let mut stack = vec![Frame::Enter(start)];
        while let Some(frame) = stack.pop() {
            match frame {
                Frame::Enter(ptr) => {
                    if !visited.insert(ptr.id) {
                        error!(block = %ptr, "prefetch parent graph revisited a node");
                        panic!("cycle in the prefetch parent graph");
                    }
                    stack.push(Frame::Apply(ptr));
                    let Some(rec) = self.active.get(&ptr.id) else {
                        continue;
                    };
                    let parents: Vec<BlockPointer> = rec
                        .parents
                        .get(&ptr.ref_nonce)
                        .map(|bucket| bucket.iter().copied().collect())
                        .unwrap_or_default();
                    let (live, dead): (Vec<_>, Vec<_>) = parents
                        .into_iter()
                        .partition(|pptr| self.active.contains_key(&pptr.id));
                    if let Some(rec) = self.active.get_mut(&ptr.id) {
                        if let Some(bucket) = rec.parents.get_mut(&ptr.ref_nonce) {
                            for pptr in &dead {
                                bucket.remove(pptr);
                            }
                            if bucket.is_empty() {
                                rec.parents.remove(&ptr.ref_nonce);
                            }
                        }
                    }
                    for pptr in live {
                        stack.push(Frame::Enter(pptr));
                    }
                }
                Frame::Apply(ptr) => order.push(ptr),
            }
        }
        order
    }

    /// Walks up from `start` subtracting `num_blocks` at every node. Nodes
    /// that hit zero are removed, cached as finished, and their wait signals
    /// raised.
    pub(crate) async fn complete_prefetch_walk(&mut self, start: BlockId, num_blocks: u64) {
        let mut finished = Vec::new();
        for id in self.collect_ancestry(start) {
            let _guard = self.unroll_guard(id);
            if let Some(rec) = self.complete_prefetch_node(id, num_blocks) {
                finished.push(rec);
            }
        }
        // Mark finished from the leaves up: a subtree's children become
        // visible as finished before their parent does.
        for rec in finished.into_iter().rev() {
            self.finish_record(rec).await;
        }
    }

    /// Applies one completion step. Returns the record when its count hit
    /// zero and it left the active set.
    fn complete_prefetch_node(&mut self, id: BlockId, num_blocks: u64) -> Option<PrefetchRecord> {
        {
            let rec = self.active.get_mut(&id)?;
            rec.subtree_block_count = match rec.subtree_block_count.checked_sub(num_blocks) {
                Some(count) => count,
                None => {
                    error!(
                        block = %id,
                        count = rec.subtree_block_count,
                        decrement = num_blocks,
                        "prefetch completion overstepped its subtree count"
                    );
                    panic!("prefetch completion overstepped its subtree count");
                }
            };
            if rec.subtree_block_count > 0 {
                return None;
            }
        }
        let rec = self.active.remove(&id)?;
        self.clear_reschedule_state(&id);
        self.rescheduled.remove(&id);
        debug!(block = %id, "prefetch complete, marking finished");
        Some(rec)
    }

    /// Re-fetches the block solo (a cache hit in the common case) and writes
    /// it back with the finished status; that final write is the externally
    /// visible completion signal.
    async fn finish_record(&mut self, rec: PrefetchRecord) {
        let id = rec.req.ptr.id;
        let ctx = rec.fetch_context();
        let receiver = self.retriever.request(
            &ctx,
            ON_DEMAND_REQUEST_PRIORITY,
            &rec.req.kmd,
            rec.req.ptr,
            rec.req.block.new_empty(),
            rec.req.lifetime,
            BlockRequestAction::SOLO,
        );
        match receiver.await {
            Ok(Ok(block)) => {
                if let Err(err) = self.retriever.put_in_caches(
                    &ctx,
                    rec.req.ptr,
                    rec.req.kmd.folder_id(),
                    &block,
                    rec.req.lifetime,
                    PrefetchStatus::Finished,
                ) {
                    warn!(block = %id, error = %err, "failed to complete prefetch due to cache error");
                }
            }
            Ok(Err(err)) => {
                warn!(block = %id, error = %err, "failed to retrieve block to complete its prefetch");
            }
            Err(_) => {
                warn!(block = %id, "retrieval abandoned while completing prefetch");
            }
        }
        rec.close();
    }

    /// Walks up from `start` subtracting one at every node; a fetched block
    /// no longer counts against its ancestors.
    fn decrement_prefetch_walk(&mut self, start: BlockId) {
        for id in self.collect_ancestry(start) {
            let _guard = self.unroll_guard(id);
            let Some(rec) = self.active.get_mut(&id) else {
                continue;
            };
            rec.subtree_block_count = match rec.subtree_block_count.checked_sub(1) {
                Some(count) => count,
                None => {
                    error!(block = %id, "prefetch decrement overstepped its subtree count");
                    panic!("prefetch decrement overstepped its subtree count");
                }
            };
        }
    }

    /// Walks up from `start` adding `num_blocks` at every node, `start`
    /// included.
    fn add_to_subtree_counts_walk(&mut self, start: BlockId, num_blocks: u64) {
        for id in self.collect_ancestry(start) {
            if let Some(rec) = self.active.get_mut(&id) {
                rec.subtree_block_count += num_blocks;
            }
        }
    }

    /// Walks up from `start` along its ref nonce, dropping that reference at
    /// every node and closing nodes left with no references at all.
    fn cancel_ptr_walk(&mut self, start: BlockPointer) {
        for ptr in self.collect_ptr_ancestry(start) {
            let _guard = self.unroll_guard(ptr.id);
            self.cancel_prefetch_node(ptr);
        }
    }

    fn cancel_prefetch_node(&mut self, ptr: BlockPointer) {
        let Some(rec) = self.active.get_mut(&ptr.id) else {
            return;
        };
        rec.parents.remove(&ptr.ref_nonce);
        if !rec.parents.is_empty() {
            return;
        }
        if let Some(rec) = self.active.remove(&ptr.id) {
            rec.close();
        }
        self.clear_reschedule_state(&ptr.id);
        self.rescheduled.remove(&ptr.id);
    }

    /// Moves a parentless node out of the active set and arms its backoff
    /// timer. Nodes that still have parents are not top-level; their
    /// references are cancelled instead.
    fn reschedule_top_block_node(&mut self, id: BlockId) {
        let nonces = match self.active.get(&id) {
            None => return,
            Some(rec) if !rec.parents.is_empty() => {
                Some(rec.parents.keys().copied().collect::<Vec<RefNonce>>())
            }
            Some(_) => None,
        };
        if let Some(nonces) = nonces {
            for ref_nonce in nonces {
                self.cancel_prefetch_node(BlockPointer::new(id, ref_nonce));
            }
            return;
        }

        // Transfer the request from the active set to the rescheduled set.
        let Some(rec) = self.active.remove(&id) else {
            return;
        };
        rec.close();

        let backoff_config = self.config.backoff.clone();
        let entry = self
            .rescheduled
            .entry(id)
            .or_insert_with(|| RescheduledPrefetch::new(&backoff_config));
        if entry.timer.is_some() {
            // Already scheduled.
            return;
        }
        let Some(delay) = entry.backoff.next_backoff() else {
            debug!(block = %id, "backoff exhausted, no longer rescheduling");
            return;
        };
        debug!(block = %id, delay_ms = delay.as_millis() as u64, "rescheduling prefetch");

        let req = rec.req.to_retrigger();
        let request_tx = self.request_tx.clone();
        let shutdown_rx = self.shutdown_rx.clone();
        entry.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if *shutdown_rx.borrow() {
                warn!(block = %req.ptr.id, "skipping rescheduled prefetch, prefetcher is shut down");
                return;
            }
            let _ = request_tx.send(req);
        }));
    }

    /// Disarms a pending reschedule timer; the backoff progression is kept
    /// so later deferrals keep backing off.
    pub(crate) fn clear_reschedule_state(&mut self, id: &BlockId) {
        if let Some(entry) = self.rescheduled.get_mut(id) {
            if let Some(timer) = entry.timer.take() {
                timer.abort();
            }
        }
    }
}

/// Logs the node a tree walk was visiting if the walk unwinds with a panic,
/// then lets the panic continue.
struct UnrollLogGuard {
    id: BlockId,
    count: u64,
    triggered: bool,
    parent_refs: usize,
}

impl Drop for UnrollLogGuard {
    fn drop(&mut self) {
        if std::thread::panicking() {
            error!(
                block = %self.id,
                subtree_block_count = self.count,
                subtree_triggered = self.triggered,
                parent_refs = self.parent_refs,
                "prefetch walk unwinding through this node"
            );
        }
    }
}

/// Consumes completion handles of child fetches for the life of the
/// prefetcher. Once the shutdown signal fires it finishes draining whatever
/// is still in flight, then tells the worker it may drain its own queues.
pub(crate) async fn run_inflight_drain(
    mut inflight_rx: mpsc::UnboundedReceiver<RetrievalReceiver>,
    mut shutdown_rx: watch::Receiver<bool>,
    almost_done_tx: mpsc::Sender<()>,
) {
    loop {
        tokio::select! {
            biased;
            _ = async {
                while !*shutdown_rx.borrow() {
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
            } => {
                break;
            }
            maybe_handle = inflight_rx.recv() => {
                match maybe_handle {
                    Some(handle) => {
                        let _ = handle.await;
                    }
                    None => break,
                }
            }
        }
    }
    while let Ok(handle) = inflight_rx.try_recv() {
        let _ = handle.await;
    }
    debug!("in-flight retrievals drained");
    let _ = almost_done_tx.send(()).await;
}
