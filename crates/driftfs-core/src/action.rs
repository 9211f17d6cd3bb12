//! Request actions controlling whether and how blocks are prefetched.
//!
//! A [`BlockRequestAction`] is a small flag set attached to every block
//! request. Flags are combined monotonically: once a reference has asked for
//! a stronger behavior (say, deep sync), later weaker requests never undo
//! it.

use crate::block::Block;
use crate::types::DiskCacheType;
use serde::{Deserialize, Serialize};
use std::fmt;

const PREFETCH: u8 = 1 << 0;
const SYNC: u8 = 1 << 1;
const STOP_IF_FULL: u8 = 1 << 2;

/// Policy flags for a single block request and its descendants.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockRequestAction(u8);

impl BlockRequestAction {
    /// Fetch the one block only; no prefetch side effects.
    pub const SOLO: Self = Self(0);
    /// Fetch the block and speculatively prefetch its children.
    pub const WITH_PREFETCH: Self = Self(PREFETCH);
    /// Prefetch the entire subtree into the sync cache, ignoring redundancy
    /// filters.
    pub const DEEP_SYNC: Self = Self(PREFETCH | SYNC);
    /// Prefetch, but stop enqueuing work when the target cache is full.
    pub const PREFETCH_UNTIL_FULL: Self = Self(PREFETCH | STOP_IF_FULL);

    /// Whether this action wants the given block's children prefetched.
    #[must_use]
    pub fn prefetch(&self, _block: &Block) -> bool {
        self.0 & PREFETCH != 0
    }

    /// Whether the block is destined for the sync cache.
    #[must_use]
    pub fn sync(&self) -> bool {
        self.0 & SYNC != 0
    }

    /// Whether the whole subtree must be cached regardless of redundancy
    /// filters.
    #[must_use]
    pub fn deep_sync(&self) -> bool {
        self.0 & PREFETCH != 0 && self.0 & SYNC != 0
    }

    /// Whether prefetching should halt silently once the cache reports no
    /// room.
    #[must_use]
    pub fn stop_if_full(&self) -> bool {
        self.0 & STOP_IF_FULL != 0
    }

    /// The disk cache this action's blocks belong in.
    #[must_use]
    pub fn cache_type(&self) -> DiskCacheType {
        if self.sync() {
            DiskCacheType::Sync
        } else {
            DiskCacheType::Working
        }
    }

    /// Combines two actions into the strongest of both. Monotone: combining
    /// with an already-absorbed action is a no-op.
    #[must_use]
    pub fn combine(&self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// The action that should propagate to the given block's children.
    ///
    /// Without a deep sync, prefetching stops below a file block: its
    /// indirect children are fetched solo so one level of pointers lands in
    /// cache without dragging the whole file in.
    #[must_use]
    pub fn child_action(&self, block: &Block) -> Self {
        if block.is_file() && !self.deep_sync() {
            self.solo_action()
        } else {
            *self
        }
    }

    /// Strips the prefetch side effects, keeping cache placement.
    #[must_use]
    pub fn solo_action(&self) -> Self {
        Self(self.0 & SYNC)
    }

    /// Static label for log fields.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match (self.0 & PREFETCH != 0, self.0 & SYNC != 0, self.0 & STOP_IF_FULL != 0) {
            (false, false, false) => "solo",
            (false, true, false) => "solo_sync",
            (false, false, true) => "solo_until_full",
            (false, true, true) => "solo_sync_until_full",
            (true, false, false) => "prefetch",
            (true, true, false) => "deep_sync",
            (true, false, true) => "prefetch_until_full",
            (true, true, true) => "deep_sync_until_full",
        }
    }
}

impl fmt::Display for BlockRequestAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for BlockRequestAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockRequestAction({})", self.as_str())
    }
}

impl Default for BlockRequestAction {
    fn default() -> Self {
        Self::SOLO
    }
}
