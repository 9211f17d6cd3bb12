//! # driftfs-core
//!
//! Core library for driftfs, a content-addressed, tree-structured
//! distributed filesystem. This crate provides the **block prefetcher**:
//! the subsystem that speculatively pulls a block's descendants into the
//! local caches after a user-driven fetch, so subsequent reads of the same
//! subtree hit warm memory or local disk.
//!
//! - **[`prefetcher`]**: the coordinator itself — a single-owner worker
//!   serving request, cancel, and reschedule events, tracking the prefetch
//!   forest and marking completed subtrees `Finished` in the caches.
//!
//! - **[`block`]**: the block sum type (indirect/direct file and directory
//!   shapes) and child enumeration helpers.
//!
//! - **[`action`]**: per-request policy flags (prefetch, sync, deep sync,
//!   stop-if-full) with monotone combination.
//!
//! - **[`retriever`]**: traits for the block-retrieval layer and the
//!   on-disk caches, which this crate consumes but does not implement.
//!
//! - **[`config`]**: layered configuration (defaults, TOML file,
//!   environment overrides).
//!
//! - **[`types`]**, **[`errors`]**: identifiers, statuses, and the error
//!   taxonomy.
//!
//! ## Data Flow
//!
//! ```text
//! user-driven fetch completes
//!        │
//!        ▼
//! process_block_for_prefetch ──► request queue ──► worker
//!                                                    │
//!                               issues child fetches ▼
//!                                              BlockRetriever
//!                                                    │
//!                      fetched child re-enters via   │
//!                      process_block_for_prefetch ◄──┘
//!                                                    │
//!                          subtree count hits zero   ▼
//!                                    PutInCaches(status = Finished)
//! ```

pub mod action;
pub mod block;
pub mod config;
pub mod errors;
pub mod prefetcher;
pub mod retriever;
pub mod types;
