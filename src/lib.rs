//! A concurrent lock-free hash trie with constant-time snapshots.
//!
//! The [`Ctrie`] type is a thread-safe key-value map based on a hash-array
//! mapped trie of 32-slot branches. All operations are lock-free: threads
//! never block each other, and a thread that stumbles over somebody else's
//! half-finished work helps it forward instead of waiting.
//!
//! The headline feature is [`snapshot`][Ctrie::snapshot] /
//! [`snapshot_read_only`][Ctrie::snapshot_read_only]: an O(1), atomic,
//! point-in-time view of the entire map. A snapshot shares structure with
//! the original and the two copy subtrees from each other lazily, only
//! along the paths writers actually touch. This makes consistent iteration,
//! backups and fork-and-mutate workflows cheap even while other threads
//! keep writing.
//!
//! Internally this follows the Ctrie design: each mutable spot in the tree
//! is an *indirection node* updated by a generation-aware compare-and-set,
//! and the root is swapped for snapshots by a restricted double
//! compare-single-swap. Both protocols are cooperative, which is where the
//! lock freedom comes from. The gory details live in the [`raw`] module,
//! which is public for the adventurous.
//!
//! # Examples
//!
//! ```rust
//! use ctrie::Ctrie;
//!
//! let map = Ctrie::new();
//! map.insert("one", 1);
//! map.insert("two", 2);
//!
//! // A frozen view: iteration is consistent no matter what other threads
//! // do to `map` in the meantime.
//! let frozen = map.snapshot_read_only();
//! map.remove("one");
//!
//! assert!(frozen.get("one").is_some());
//! assert!(map.get("one").is_none());
//! assert_eq!(2, frozen.count());
//! ```

pub mod map;
pub mod raw;

use thiserror::Error;

pub use crate::map::{Ctrie, Entry, Snapshot};

/// An attempted mutation of a read-only snapshot.
///
/// The typed map API statically prevents this (a [`Snapshot`] simply has no
/// mutating methods); the error surfaces from the [`raw`] layer, where
/// writability is a runtime property of the handle.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Error)]
#[error("cannot mutate a read-only snapshot")]
pub struct ReadOnlyError;
