//! Construction options shared by [`ArrayMap`](crate::ArrayMap) and
//! [`SegMap`](crate::SegMap).

use crate::error::MapError;
use crate::key::AtomicKey;

/// Construction options.
///
/// The three sentinel keys must be pairwise distinct and must never occur as
/// real keys; [`Default`] picks them from the key type's reserved range
/// (see [`AtomicKey`]).
#[derive(Debug, Clone, Copy)]
pub struct Config<K> {
    /// Highest fraction of cells allowed to hold entries, in (0, 1].
    /// Capacity is sized as `max_size / max_load_factor`.
    pub max_load_factor: f64,
    /// Key marking an unused cell.
    pub empty_key: K,
    /// Key marking a cell whose value is under construction.
    pub locked_key: K,
    /// Key marking a tombstoned cell.
    pub erased_key: K,
    /// Sizing of each new segment relative to total capacity so far.
    /// Negative means `1.0 - max_load_factor`.
    pub growth_factor: f64,
    /// Per-thread cache size for the entry and pending counters.
    pub counter_cache_size: u32,
}

impl<K: AtomicKey> Default for Config<K> {
    fn default() -> Self {
        Config {
            max_load_factor: 0.8,
            empty_key: K::DEFAULT_EMPTY,
            locked_key: K::DEFAULT_LOCKED,
            erased_key: K::DEFAULT_ERASED,
            growth_factor: -1.0,
            counter_cache_size: 1000,
        }
    }
}

impl<K: AtomicKey> Config<K> {
    /// Default options with caller-supplied sentinel keys, for key domains
    /// that cover the reserved defaults.
    pub fn with_sentinels(empty_key: K, locked_key: K, erased_key: K) -> Self {
        Config {
            empty_key,
            locked_key,
            erased_key,
            ..Config::default()
        }
    }

    pub(crate) fn validate(&self) -> Result<(), MapError> {
        if !(self.max_load_factor > 0.0 && self.max_load_factor <= 1.0) {
            return Err(MapError::InvalidLoadFactor {
                value: self.max_load_factor,
            });
        }
        if self.empty_key == self.locked_key
            || self.empty_key == self.erased_key
            || self.locked_key == self.erased_key
        {
            return Err(MapError::SentinelCollision);
        }
        Ok(())
    }

    /// Effective growth fraction, resolving the negative-means-default rule.
    pub(crate) fn growth_fraction(&self) -> f64 {
        if self.growth_factor < 0.0 {
            1.0 - self.max_load_factor
        } else {
            self.growth_factor
        }
    }
}
