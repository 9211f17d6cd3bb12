//! Core identifier and status types shared across the prefetching subsystem.
//!
//! # Type Categories
//!
//! ## Block Identity
//! - [`BlockId`]: content hash of a block
//! - [`RefNonce`]: distinguishes multiple logical references to the same
//!   content-identical block
//! - [`BlockPointer`]: a specific reference (`BlockId` + `RefNonce`)
//!
//! ## Folder & Credentials
//! - [`FolderId`]: identifies the top-level folder a block belongs to
//! - [`KeyMetadata`]: opaque credential bundle passed through to the
//!   block-retrieval layer
//!
//! ## Cache & Prefetch State
//! - [`PrefetchStatus`]: tri-state prefetch progress recorded in the caches
//! - [`CacheLifetime`], [`DiskCacheType`]: cache placement hints

use serde::{Deserialize, Serialize};
use std::fmt;

/// Priority used for user-driven (on-demand) block retrievals. Prefetches
/// triggered for child blocks run strictly below this.
pub const ON_DEMAND_REQUEST_PRIORITY: i32 = 100;

/// Priority assigned to prefetches triggered by metadata pointer updates.
pub const UPDATE_POINTER_PREFETCH_PRIORITY: i32 = 1;

/// Content hash identifying a block.
///
/// Equal ids imply byte-identical block contents; any mutation anywhere in a
/// subtree produces brand-new ids all the way up the ancestor chain.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId([u8; 32]);

impl BlockId {
    pub const ZERO: Self = Self([0; 32]);

    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for BlockId {
    /// Renders the first eight bytes as hex, enough to correlate log lines.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..8] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockId({self})")
    }
}

/// Distinguishes multiple logical references to the same content block.
///
/// Deduplicated writes can reference one stored block from several places;
/// each place gets its own nonce so references can be created and cancelled
/// independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct RefNonce(pub u64);

impl RefNonce {
    /// The nonce of the initial (creating) reference.
    pub const ZERO: Self = Self(0);
}

impl fmt::Display for RefNonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// A specific reference to a block: content id plus reference nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockPointer {
    pub id: BlockId,
    pub ref_nonce: RefNonce,
}

impl BlockPointer {
    #[must_use]
    pub const fn new(id: BlockId, ref_nonce: RefNonce) -> Self {
        Self { id, ref_nonce }
    }
}

impl fmt::Display for BlockPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(ref {})", self.id, self.ref_nonce)
    }
}

/// Identifies a top-level folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct FolderId([u8; 16]);

impl FolderId {
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for FolderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..8] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Opaque key/credential bundle the retrieval layer needs to decrypt and
/// verify blocks. The prefetcher only threads it through and reads the
/// folder id for cache writes.
#[derive(Debug, Clone, Default)]
pub struct KeyMetadata {
    folder: FolderId,
}

impl KeyMetadata {
    #[must_use]
    pub const fn new(folder: FolderId) -> Self {
        Self { folder }
    }

    #[must_use]
    pub const fn folder_id(&self) -> FolderId {
        self.folder
    }
}

/// Prefetch progress recorded alongside a block in the caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrefetchStatus {
    /// The block has been fetched, but no prefetch of its children has been
    /// triggered.
    NotPrefetched,
    /// Child prefetches have been triggered but the subtree has not finished.
    Triggered,
    /// The block and its entire subtree are present in the caches.
    Finished,
}

impl PrefetchStatus {
    /// Static label for log fields.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotPrefetched => "not_prefetched",
            Self::Triggered => "triggered",
            Self::Finished => "finished",
        }
    }
}

impl fmt::Display for PrefetchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How long a block should survive in the memory cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheLifetime {
    /// Evictable as soon as space is needed.
    Transient,
    /// Pinned until explicitly invalidated.
    Permanent,
}

/// Which on-disk cache a block is destined for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiskCacheType {
    /// The general working-set cache.
    Working,
    /// The cache backing folders configured for full sync.
    Sync,
}

impl DiskCacheType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Working => "working",
            Self::Sync => "sync",
        }
    }
}
