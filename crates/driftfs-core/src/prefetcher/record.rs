//! Per-block bookkeeping records owned by the prefetch worker.

use crate::config::BackoffConfig;
use crate::retriever::FetchContext;
use crate::types::{BlockPointer, RefNonce};
use ahash::{AHashMap, AHashSet};
use rand::Rng;
use std::time::{Duration, Instant as StdInstant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{PrefetchRequest, WaitHandle};

/// Bookkeeping for one active prefetch.
///
/// `subtree_block_count` counts the blocks in this node's subtree that have
/// not yet been fetched, including this node until its own fetch lands. The
/// `parents` map holds the reverse edges of the prefetch forest: one bucket
/// per ref nonce, each bucket the set of parent pointers that reference this
/// block through that nonce.
pub(crate) struct PrefetchRecord {
    pub(crate) subtree_block_count: u64,
    pub(crate) subtree_triggered: bool,
    pub(crate) req: PrefetchRequest,
    pub(crate) parents: AHashMap<RefNonce, AHashSet<BlockPointer>>,
    cancel: CancellationToken,
    deadline: Instant,
    wait_tx: watch::Sender<bool>,
}

impl PrefetchRecord {
    pub(crate) fn new(
        subtree_block_count: u64,
        subtree_triggered: bool,
        req: PrefetchRequest,
        cancel: CancellationToken,
        deadline: Instant,
    ) -> Self {
        let (wait_tx, _) = watch::channel(false);
        Self {
            subtree_block_count,
            subtree_triggered,
            req,
            parents: AHashMap::new(),
            cancel,
            deadline,
            wait_tx,
        }
    }

    /// A fresh handle that resolves when this subtree completes, is
    /// cancelled, or the prefetcher shuts down.
    pub(crate) fn wait_handle(&self) -> WaitHandle {
        WaitHandle::new(self.wait_tx.subscribe())
    }

    /// The cancellation scope retrievals for this prefetch run under.
    pub(crate) fn fetch_context(&self) -> FetchContext {
        FetchContext::new(self.cancel.clone(), self.deadline)
    }

    /// Raises the wait signal and cancels outstanding retrievals.
    pub(crate) fn close(&self) {
        let _ = self.wait_tx.send(true);
        self.cancel.cancel();
    }
}

/// Deferred top-level prefetch: its backoff progression plus, if armed, the
/// timer task that will re-enqueue the request.
pub(crate) struct RescheduledPrefetch {
    pub(crate) backoff: Backoff,
    pub(crate) timer: Option<JoinHandle<()>>,
}

impl RescheduledPrefetch {
    pub(crate) fn new(config: &BackoffConfig) -> Self {
        Self { backoff: Backoff::new(config.clone()), timer: None }
    }
}

/// Exponential backoff with jitter.
///
/// Each call to [`next_backoff`](Self::next_backoff) yields the next delay,
/// growing by `multiplier` up to `max_interval`, randomized by
/// `randomization_factor` around the nominal value. Once `max_elapsed` has
/// passed since the first call, yields `None` and the caller stops retrying.
pub(crate) struct Backoff {
    config: BackoffConfig,
    current: Duration,
    started: Option<StdInstant>,
}

impl Backoff {
    pub(crate) fn new(config: BackoffConfig) -> Self {
        let current = config.initial_interval();
        Self { config, current, started: None }
    }

    pub(crate) fn next_backoff(&mut self) -> Option<Duration> {
        let started = *self.started.get_or_insert_with(StdInstant::now);
        if started.elapsed() >= self.config.max_elapsed() {
            return None;
        }

        let nominal = self.current;
        self.current = nominal
            .mul_f64(self.config.multiplier)
            .min(self.config.max_interval());

        let factor = self.config.randomization_factor;
        if factor <= 0.0 {
            return Some(nominal);
        }
        let spread = rand::rng().random_range(-factor..=factor);
        Some(nominal.mul_f64(1.0 + spread).min(self.config.max_interval()))
    }
}
