//! Shared helpers for timing-sensitive assertions and block fixtures.
//!
//! # Test Philosophy
//!
//! Positive cases poll until the condition becomes true within a timeout;
//! negative cases verify the condition stays false for a stability window.
//! Both beat fixed sleeps: tests pass as soon as the condition is met and
//! have explicit bounds for slow CI machines.

use driftfs_core::block::{dir_entry, indirect_ptr, Block, DirEntry, EntryType, IndirectPointer};
use driftfs_core::config::{BackoffConfig, PrefetcherConfig};
use driftfs_core::types::{BlockId, BlockPointer, KeyMetadata, RefNonce};
use std::collections::BTreeMap;
use std::future::Future;
use tokio::time::{sleep, Duration, Instant};

/// Configuration for timing-sensitive test assertions.
pub struct TestTiming {
    /// Maximum time to wait for a condition to become true.
    pub poll_timeout: Duration,
    /// Interval between checks when polling.
    pub poll_interval: Duration,
    /// Duration to verify a condition remains false (for negative tests).
    pub stability_duration: Duration,
}

impl Default for TestTiming {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(10),
            stability_duration: Duration::from_millis(300),
        }
    }
}

/// Polls until a condition becomes true, or times out.
///
/// Returns `Ok(elapsed)` if the condition became true, `Err(msg)` on
/// timeout.
pub async fn poll_until<F>(
    condition_name: &str,
    timing: &TestTiming,
    mut check: F,
) -> Result<Duration, String>
where
    F: FnMut() -> bool,
{
    let start = Instant::now();
    while start.elapsed() < timing.poll_timeout {
        if check() {
            return Ok(start.elapsed());
        }
        sleep(timing.poll_interval).await;
    }
    Err(format!("{condition_name} did not become true within {:?}", timing.poll_timeout))
}

/// Verifies a condition remains false for the stability duration.
pub async fn remains_false_for<F>(
    condition_name: &str,
    timing: &TestTiming,
    mut check: F,
) -> Result<(), String>
where
    F: FnMut() -> bool,
{
    let start = Instant::now();
    while start.elapsed() < timing.stability_duration {
        if check() {
            return Err(format!(
                "{condition_name} unexpectedly became true after {:?}",
                start.elapsed()
            ));
        }
        sleep(timing.poll_interval).await;
    }
    Ok(())
}

/// Awaits a future with the poll timeout, panicking with the condition name
/// on expiry.
pub async fn within_timeout<F>(condition_name: &str, timing: &TestTiming, future: F) -> F::Output
where
    F: Future,
{
    match tokio::time::timeout(timing.poll_timeout, future).await {
        Ok(output) => output,
        Err(_) => panic!("{condition_name} timed out after {:?}", timing.poll_timeout),
    }
}

// --- Block fixtures ---

pub fn bid(n: u8) -> BlockId {
    let mut bytes = [0_u8; 32];
    bytes[0] = n;
    BlockId::from_bytes(bytes)
}

pub fn bptr(n: u8) -> BlockPointer {
    BlockPointer::new(bid(n), RefNonce::ZERO)
}

pub fn kmd() -> KeyMetadata {
    KeyMetadata::default()
}

/// A direct directory whose entries are all subdirectories, sized by
/// position so enumeration order matches the slice order.
pub fn dir_of_dirs(entries: &[(&str, BlockPointer)]) -> Block {
    let mut children: BTreeMap<String, DirEntry> = BTreeMap::new();
    for (i, (name, ptr)) in entries.iter().enumerate() {
        children.insert(
            (*name).to_string(),
            dir_entry(*ptr, EntryType::Dir, (i as u64 + 1) * 10),
        );
    }
    Block::DirectDir(children)
}

/// An indirect file block pointing at the given lower-level blocks.
pub fn indirect_file(ptrs: &[BlockPointer]) -> Block {
    let ptrs: Vec<IndirectPointer> = ptrs
        .iter()
        .enumerate()
        .map(|(i, ptr)| indirect_ptr(*ptr, i as u64 * 4096))
        .collect();
    Block::IndirectFile(ptrs)
}

/// A prefetcher config with a fast, deterministic backoff for tests.
pub fn fast_backoff_config(initial_ms: u64) -> PrefetcherConfig {
    PrefetcherConfig {
        backoff: BackoffConfig {
            initial_interval_ms: initial_ms,
            randomization_factor: 0.0,
            ..Default::default()
        },
        ..Default::default()
    }
}
