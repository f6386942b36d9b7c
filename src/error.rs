//! Typed errors for map construction and insertion.

use std::fmt;

/// Errors surfaced by map construction and plain inserts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MapError {
    /// The configured load factor is outside (0, 1].
    InvalidLoadFactor {
        /// The rejected value.
        value: f64,
    },
    /// Two or more of the empty/locked/erased sentinel keys are equal.
    SentinelCollision,
    /// Every cell is exhausted and no further segment can be allocated.
    MapFull,
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapError::InvalidLoadFactor { value } => {
                write!(f, "max load factor {} is outside (0, 1]", value)
            }
            MapError::SentinelCollision => {
                write!(f, "empty/locked/erased sentinel keys must be pairwise distinct")
            }
            MapError::MapFull => write!(f, "map is full"),
        }
    }
}

impl std::error::Error for MapError {}

/// Failure of a fallible in-place insert ([`try_insert_with`]).
///
/// [`try_insert_with`]: crate::SegMap::try_insert_with
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InsertError<E> {
    /// The map ran out of usable cells before a value was constructed.
    Full,
    /// The value constructor failed. The claimed cell was reverted to empty
    /// and remains usable by a later insert.
    Value(E),
}

impl<E: fmt::Display> fmt::Display for InsertError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InsertError::Full => write!(f, "map is full"),
            InsertError::Value(e) => write!(f, "value construction failed: {}", e),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for InsertError<E> {}
