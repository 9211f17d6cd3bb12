//! Block representation used by the prefetcher.
//!
//! Blocks come in five shapes. Indirect blocks carry pointers to lower
//! levels of the same object; direct directory blocks carry named child
//! entries; direct file blocks and everything else carry no prefetchable
//! children. Child enumeration dispatches on the [`Block`] variant.

use crate::types::BlockPointer;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A pointer from an indirect block to one of its lower-level blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndirectPointer {
    pub ptr: BlockPointer,
    /// Byte (file) or name-ordinal (directory) offset this pointer covers.
    pub offset: u64,
}

/// The kind of object a directory entry refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryType {
    Dir,
    File,
    Exec,
    /// Symbolic link. Carries no block of its own, so never prefetched.
    Sym,
    /// Entry kind from a newer writer this version does not understand.
    Unknown(u8),
}

/// A single entry in a direct directory block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub ptr: BlockPointer,
    pub entry_type: EntryType,
    /// Total size of the entry's content, used to order prefetches.
    pub size: u64,
}

/// A content-addressed unit of filesystem data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Block {
    /// Top or middle level of a large file: pointers to lower file blocks.
    IndirectFile(Vec<IndirectPointer>),
    /// Leaf file data.
    DirectFile,
    /// Top or middle level of a large directory.
    IndirectDir(Vec<IndirectPointer>),
    /// Directory entries keyed by name.
    DirectDir(BTreeMap<String, DirEntry>),
    /// A block shape this version does not know how to walk.
    Other,
}

impl Block {
    /// Allocates an empty block of the same object kind, used as the shape
    /// hint for retrieval requests.
    #[must_use]
    pub fn new_empty(&self) -> Block {
        match self {
            Self::IndirectFile(_) | Self::DirectFile => Self::DirectFile,
            Self::IndirectDir(_) | Self::DirectDir(_) => Self::DirectDir(BTreeMap::new()),
            Self::Other => Self::Other,
        }
    }

    /// Returns `true` when this block's subtree contains no further
    /// prefetchable children.
    ///
    /// Symlink entries and entries of unknown type carry nothing to
    /// prefetch, so a directory holding only those is a tail.
    #[must_use]
    pub fn is_tail(&self) -> bool {
        match self {
            Self::IndirectFile(ptrs) | Self::IndirectDir(ptrs) => ptrs.is_empty(),
            Self::DirectFile | Self::Other => true,
            Self::DirectDir(children) => children
                .values()
                .all(|entry| matches!(entry.entry_type, EntryType::Sym | EntryType::Unknown(_))),
        }
    }

    /// Returns `true` for either file block shape.
    #[must_use]
    pub fn is_file(&self) -> bool {
        matches!(self, Self::IndirectFile(_) | Self::DirectFile)
    }

    /// Convenience constructor for a leaf directory.
    #[must_use]
    pub fn empty_dir() -> Block {
        Self::DirectDir(BTreeMap::new())
    }
}

/// Orders direct-directory entries by ascending size.
///
/// Smaller blocks tend to arrive sooner, so issuing them first improves
/// interactivity of the warmed cache. The sort is stable; equal sizes keep
/// the directory's name order.
#[must_use]
pub fn entries_by_size_asc(children: &BTreeMap<String, DirEntry>) -> Vec<&DirEntry> {
    let mut entries: Vec<&DirEntry> = children.values().collect();
    entries.sort_by_key(|entry| entry.size);
    entries
}

/// Builds a directory entry; test and fixture helper.
#[must_use]
pub fn dir_entry(ptr: BlockPointer, entry_type: EntryType, size: u64) -> DirEntry {
    DirEntry { ptr, entry_type, size }
}

/// Builds an indirect pointer; test and fixture helper.
#[must_use]
pub fn indirect_ptr(ptr: BlockPointer, offset: u64) -> IndirectPointer {
    IndirectPointer { ptr, offset }
}
