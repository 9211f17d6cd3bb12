//! End-to-end prefetch flows through the public handle.
//!
//! These run the real worker with the mock retriever's feedback loop: a
//! fetched block re-enters the prefetcher via `process_block_for_prefetch`
//! the way the retrieval layer does in production.

use crate::mock_infrastructure::{
    bid, bptr, dir_of_dirs, indirect_file, kmd, poll_until, within_timeout, MockRetriever,
    TestTiming,
};
use driftfs_core::action::BlockRequestAction;
use driftfs_core::block::Block;
use driftfs_core::config::PrefetcherConfig;
use driftfs_core::prefetcher::BlockPrefetcher;
use driftfs_core::types::{CacheLifetime, PrefetchStatus, ON_DEMAND_REQUEST_PRIORITY};
use std::sync::Arc;

fn build_prefetcher(retriever: &Arc<MockRetriever>) -> BlockPrefetcher {
    let prefetcher =
        BlockPrefetcher::new(PrefetcherConfig::default(), retriever.clone(), None);
    retriever.attach(prefetcher.clone());
    prefetcher
}

fn process(
    prefetcher: &BlockPrefetcher,
    n: u8,
    block: &Block,
    action: BlockRequestAction,
    status: PrefetchStatus,
) {
    prefetcher.process_block_for_prefetch(
        bptr(n),
        block,
        &kmd(),
        ON_DEMAND_REQUEST_PRIORITY,
        CacheLifetime::Transient,
        status,
        action,
    );
}

/// A whole directory tree drains to finished, root last.
#[tokio::test]
async fn full_tree_prefetch_completes() {
    let retriever = MockRetriever::new();
    let root = dir_of_dirs(&[("b", bptr(2)), ("e", bptr(5))]);
    retriever.script(bid(1), root.clone());
    retriever.script(bid(2), dir_of_dirs(&[("c", bptr(3)), ("d", bptr(4))]));
    retriever.script(bid(5), dir_of_dirs(&[("f", bptr(6)), ("g", bptr(7))]));
    for leaf in [3, 4, 6, 7] {
        retriever.script(bid(leaf), Block::empty_dir());
    }
    let prefetcher = build_prefetcher(&retriever);
    let timing = TestTiming::default();

    process(
        &prefetcher,
        1,
        &root,
        BlockRequestAction::WITH_PREFETCH,
        PrefetchStatus::NotPrefetched,
    );

    let wait = within_timeout(
        "wait channel reply",
        &timing,
        prefetcher.wait_channel_for_block_prefetch(bptr(1)),
    )
    .await
    .expect("wait channel");
    within_timeout("subtree completion", &timing, wait.wait()).await;

    let finished = retriever.finished_puts();
    assert_eq!(finished.len(), 7, "every block marked finished: {finished:?}");
    assert_eq!(*finished.last().expect("nonempty"), bid(1), "root finishes last");

    let done = prefetcher.shutdown();
    within_timeout("shutdown", &timing, done.wait()).await;
}

/// Without a deep sync, prefetching an indirect file pulls exactly one
/// level of pointer blocks; the leaves complete as their own tails.
#[tokio::test]
async fn indirect_file_prefetches_one_level() {
    let retriever = MockRetriever::new();
    let file = indirect_file(&[bptr(11), bptr(12)]);
    retriever.script(bid(10), file.clone());
    retriever.script(bid(11), Block::DirectFile);
    retriever.script(bid(12), Block::DirectFile);
    let prefetcher = build_prefetcher(&retriever);
    let timing = TestTiming::default();

    process(
        &prefetcher,
        10,
        &file,
        BlockRequestAction::WITH_PREFETCH,
        PrefetchStatus::NotPrefetched,
    );

    let wait = within_timeout(
        "wait channel reply",
        &timing,
        prefetcher.wait_channel_for_block_prefetch(bptr(10)),
    )
    .await
    .expect("wait channel");
    within_timeout("file prefetch completion", &timing, wait.wait()).await;

    let finished = retriever.finished_puts();
    assert_eq!(finished.len(), 3);
    assert_eq!(*finished.last().expect("nonempty"), bid(10));

    let done = prefetcher.shutdown();
    within_timeout("shutdown", &timing, done.wait()).await;
}

/// Wait channels for blocks the prefetcher never saw resolve immediately.
#[tokio::test]
async fn wait_channel_for_unknown_block_resolves_immediately() {
    let retriever = MockRetriever::new();
    let prefetcher = build_prefetcher(&retriever);
    let timing = TestTiming::default();

    let wait = within_timeout(
        "wait channel reply",
        &timing,
        prefetcher.wait_channel_for_block_prefetch(bptr(42)),
    )
    .await
    .expect("wait channel");
    assert!(wait.is_complete());

    let done = prefetcher.shutdown();
    within_timeout("shutdown", &timing, done.wait()).await;
}

/// Cancelling a top-level prefetch wakes its waiters without marking the
/// block finished.
#[tokio::test]
async fn cancel_releases_waiters_without_finishing() {
    let retriever = MockRetriever::new();
    retriever.script(bid(1), dir_of_dirs(&[("b", bptr(2))]));
    retriever.script(bid(2), Block::empty_dir());
    retriever.hold(bid(2));
    let prefetcher = build_prefetcher(&retriever);
    let timing = TestTiming::default();

    process(
        &prefetcher,
        1,
        &dir_of_dirs(&[("b", bptr(2))]),
        BlockRequestAction::WITH_PREFETCH,
        PrefetchStatus::NotPrefetched,
    );

    // The child fetch is held, so the root is guaranteed still active when
    // the wait handle arrives.
    poll_until("child fetch issued", &timing, || {
        retriever.requests().iter().any(|r| r.ptr.id == bid(2))
    })
    .await
    .expect("child fetch");

    let wait = within_timeout(
        "wait channel reply",
        &timing,
        prefetcher.wait_channel_for_block_prefetch(bptr(1)),
    )
    .await
    .expect("wait channel");
    assert!(!wait.is_complete());

    prefetcher.cancel_prefetch(bptr(1));
    within_timeout("cancelled waiter released", &timing, wait.wait()).await;
    assert!(!retriever.finished_puts().contains(&bid(1)));

    retriever.release(bid(2));
    let done = prefetcher.shutdown();
    within_timeout("shutdown", &timing, done.wait()).await;
}

/// A solo-action block is cached with its status unchanged and triggers no
/// child work.
#[tokio::test]
async fn solo_action_caches_without_prefetching() {
    let retriever = MockRetriever::new();
    let block = dir_of_dirs(&[("b", bptr(2))]);
    retriever.script(bid(1), block.clone());
    let prefetcher = build_prefetcher(&retriever);
    let timing = TestTiming::default();

    process(
        &prefetcher,
        1,
        &block,
        BlockRequestAction::SOLO,
        PrefetchStatus::NotPrefetched,
    );

    // The block is cached with the caller's status.
    poll_until("block cached", &timing, || {
        retriever
            .puts()
            .iter()
            .any(|(id, status)| *id == bid(1) && *status == PrefetchStatus::NotPrefetched)
    })
    .await
    .expect("cache put");

    // And no retrieval is ever issued for the child.
    crate::mock_infrastructure::remains_false_for("child fetched", &timing, || {
        retriever.requests().iter().any(|r| r.ptr.id == bid(2))
    })
    .await
    .expect("no child fetch");

    let done = prefetcher.shutdown();
    within_timeout("shutdown", &timing, done.wait()).await;
}
