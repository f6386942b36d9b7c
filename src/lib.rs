//! Petek: concurrent flat-array hash maps with wait-free reads.
//!
//! Petek stores entries directly in flat arrays of cells whose atomic key
//! word doubles as a per-cell lock. That buys a very cheap concurrency
//! protocol (one compare-and-swap to claim a cell, one release store to
//! publish it) at the price of two deliberate restrictions: keys are
//! machine words with three reserved sentinel values, and erased cells are
//! tombstoned rather than reclaimed.
//!
//! # Features
//!
//! - **Wait-Free Reads**: `get` never writes, spins, or blocks.
//! - **Cell-Locking Inserts**: one CAS claims a cell; the value is
//!   constructed in place and published with a release store.
//! - **Insert-Once Semantics**: a colliding insert never overwrites; the
//!   existing entry is returned.
//! - **Non-Reclaiming Erase**: erase flips the key to a tombstone and leaves
//!   the value untouched, so concurrent readers keep their references and
//!   entry handles stay resolvable until erased.
//! - **Bounded Growth**: [`SegMap`] chains up to 16 fixed-capacity
//!   [`ArrayMap`] segments, surviving underestimated sizing while handing
//!   out stable 32-bit [`EntryHandle`]s.
//! - **Heterogeneous Lookup**: probe and insert by any type that can stand
//!   for the stored key (see [`Equivalent`] and [`ToKey`]).
//!
//! # Example
//!
//! ```rust
//! use petek::SegMap;
//!
//! let map: SegMap<u64, String> = SegMap::new(128).unwrap();
//!
//! let inserted = map.insert(42, "hello".to_string()).unwrap();
//! let handle = inserted.entry().handle;
//!
//! // Resolve the handle with no hashing.
//! assert_eq!(map.get_at(handle).unwrap().value, "hello");
//!
//! map.remove(&42);
//! assert!(map.get(&42).is_none());
//! ```
//!
//! Pick [`ArrayMap`] directly when the maximum size is known up front;
//! [`SegMap`] costs one extra indirection per operation and degrades
//! linearly in the number of segments it has had to allocate.

#![warn(missing_docs)]

pub mod array_map;
mod config;
mod error;
mod handle;
mod key;
mod lookup;
mod probe;
pub mod seg_map;

pub use crate::array_map::ArrayMap;
pub use crate::config::Config;
pub use crate::error::{InsertError, MapError};
pub use crate::handle::EntryHandle;
pub use crate::key::AtomicKey;
pub use crate::lookup::{Equivalent, ToKey};
pub use crate::probe::{LinearProbe, ProbeSequence, QuadraticProbe};
pub use crate::seg_map::{Entry, SegMap};

/// Outcome of an insert: either this call created the entry or an equal key
/// was already present (and nothing was overwritten).
#[derive(Debug, Clone, Copy)]
pub enum Insert<T> {
    /// The key was absent; this call created the entry.
    Inserted(T),
    /// An equal key was already present; the existing entry is returned.
    Exists(T),
}

impl<T> Insert<T> {
    /// Returns true if this call created the entry.
    pub fn is_inserted(&self) -> bool {
        matches!(self, Insert::Inserted(_))
    }

    /// The created or pre-existing entry.
    pub fn entry(&self) -> &T {
        match self {
            Insert::Inserted(entry) | Insert::Exists(entry) => entry,
        }
    }

    /// Consumes the outcome, returning the entry.
    pub fn into_entry(self) -> T {
        match self {
            Insert::Inserted(entry) | Insert::Exists(entry) => entry,
        }
    }
}
