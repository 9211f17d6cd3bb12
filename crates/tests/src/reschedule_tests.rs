//! Cache-pressure deferral: backoff timers re-enqueue deferred prefetches,
//! and cancellation disarms them.

use crate::mock_infrastructure::{
    bid, bptr, dir_of_dirs, fast_backoff_config, kmd, poll_until, remains_false_for,
    within_timeout, MockDiskCache, MockRetriever, TestTiming,
};
use driftfs_core::action::BlockRequestAction;
use driftfs_core::block::Block;
use driftfs_core::prefetcher::BlockPrefetcher;
use driftfs_core::retriever::DiskBlockCache;
use driftfs_core::types::{CacheLifetime, PrefetchStatus, ON_DEMAND_REQUEST_PRIORITY};
use std::sync::Arc;

fn build(
    retriever: &Arc<MockRetriever>,
    cache: Arc<MockDiskCache>,
    initial_backoff_ms: u64,
) -> BlockPrefetcher {
    let prefetcher = BlockPrefetcher::new(
        fast_backoff_config(initial_backoff_ms),
        retriever.clone(),
        Some(cache as Arc<dyn DiskBlockCache>),
    );
    retriever.attach(prefetcher.clone());
    prefetcher
}

fn process_sync(prefetcher: &BlockPrefetcher, n: u8, block: &Block) {
    prefetcher.process_block_for_prefetch(
        bptr(n),
        block,
        &kmd(),
        ON_DEMAND_REQUEST_PRIORITY,
        CacheLifetime::Transient,
        PrefetchStatus::NotPrefetched,
        BlockRequestAction::DEEP_SYNC,
    );
}

/// A sync prefetch deferred by a full cache fires again from its backoff
/// timer and completes once space is back.
#[tokio::test]
async fn deferred_prefetch_recovers_when_space_returns() {
    let retriever = MockRetriever::new();
    let root = dir_of_dirs(&[("b", bptr(2))]);
    retriever.script(bid(1), root.clone());
    retriever.script(bid(2), Block::empty_dir());
    let cache = MockDiskCache::new(false);
    let prefetcher = build(&retriever, cache.clone(), 20);
    let timing = TestTiming::default();

    process_sync(&prefetcher, 1, &root);

    // Backoff retries keep re-checking the cache, but as long as it is
    // full the subtree never gets walked: no child fetch, nothing
    // finished.
    remains_false_for("child fetched while cache full", &timing, || {
        retriever.requests().iter().any(|r| r.ptr.id == bid(2))
            || !retriever.finished_puts().is_empty()
    })
    .await
    .expect("deferred");

    cache.set_has_space(true);

    poll_until("deferred prefetch completes", &timing, || {
        retriever.finished_puts().contains(&bid(1))
    })
    .await
    .expect("recovery");

    let done = prefetcher.shutdown();
    within_timeout("shutdown", &timing, done.wait()).await;
}

/// Cancelling a deferred prefetch before its timer fires disarms it for
/// good.
#[tokio::test]
async fn cancel_before_timer_fires_clears_it() {
    let retriever = MockRetriever::new();
    retriever.script(bid(1), Block::empty_dir());
    let cache = MockDiskCache::new(false);
    // A long first delay so the cancel always wins the race.
    let prefetcher = build(&retriever, cache.clone(), 60_000);
    let timing = TestTiming::default();

    process_sync(&prefetcher, 1, &Block::empty_dir());

    // Let the reschedule event reach the worker, then cancel.
    poll_until("block cached", &timing, || !retriever.puts().is_empty())
        .await
        .expect("entry cached");
    prefetcher.cancel_prefetch(bptr(1));
    cache.set_has_space(true);

    remains_false_for("cancelled prefetch fired anyway", &timing, || {
        retriever.request_count() > 0
    })
    .await
    .expect("stays cancelled");

    let done = prefetcher.shutdown();
    within_timeout("shutdown", &timing, done.wait()).await;
}
