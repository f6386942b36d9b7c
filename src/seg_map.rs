//! Growable concurrent map chaining fixed-capacity segments.
//!
//! # Architecture
//!
//! - **Segments**: an array of 16 [`ArrayMap`] slots, each `Null`, claimed,
//!   or published. Slot 0 is allocated at construction; later slots come up
//!   on demand when every earlier segment has quiesced full.
//! - **Allocation**: threads race a compare-and-swap from null to a claimed
//!   sentinel; the winner builds the segment and publishes the real pointer,
//!   losers spin on the slot. No mutex guards "who allocates".
//! - **Dispatch**: operations walk segments in allocation order, so cost
//!   grows linearly with the number of segments, the price of surviving an
//!   underestimated initial size. Size the primary generously.
//!
//! A published segment is never moved or freed while the map is alive,
//! which is what makes [`EntryHandle`]s stable.

use std::hash::{BuildHasher, Hash};
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

use crossbeam_utils::Backoff;
use foldhash::fast::FixedState;

use crate::Insert;
use crate::array_map::{self, ArrayMap, RawSlot};
use crate::config::Config;
use crate::error::{InsertError, MapError};
use crate::handle::{EntryHandle, NUM_SEGMENTS};
use crate::key::AtomicKey;
use crate::lookup::{Equivalent, ToKey};
use crate::probe::{LinearProbe, ProbeSequence};

/// Slot value marking a segment claimed but not yet published. Never
/// dereferenced.
const CLAIMED: usize = 0x88;

/// A concurrent map that grows by chaining [`ArrayMap`] segments.
///
/// Inserts go to the first segment that still accepts entries; once a
/// segment quiesces full it is never written again, though its entries stay
/// readable and erasable. Successful inserts and lookups return an
/// [`Entry`] carrying a stable [`EntryHandle`] for O(1) re-access.
pub struct SegMap<K: AtomicKey, V, S = FixedState, P = LinearProbe> {
    segments: [AtomicPtr<ArrayMap<K, V, S, P>>; NUM_SEGMENTS],
    num_allocated: AtomicU32,
    growth_fraction: f64,
    config: Config<K>,
    hasher: S,
}

// SAFETY: segment pointers are owned by the map; concurrent access to the
// segments themselves is governed by ArrayMap's own Send/Sync reasoning.
unsafe impl<K: AtomicKey, V: Send, S: Send, P> Send for SegMap<K, V, S, P> {}
unsafe impl<K: AtomicKey, V: Send + Sync, S: Send + Sync, P> Sync for SegMap<K, V, S, P> {}

impl<K: AtomicKey, V, S, P> std::fmt::Debug for SegMap<K, V, S, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegMap")
            .field("num_allocated", &self.num_allocated.load(Ordering::Relaxed))
            .field("growth_fraction", &self.growth_fraction)
            .finish_non_exhaustive()
    }
}

/// A view of one occupied cell of a [`SegMap`].
#[derive(Debug, Clone, Copy)]
pub struct Entry<'a, K, V> {
    /// Stable handle resolving to this entry until it is erased.
    pub handle: EntryHandle,
    /// The stored key.
    pub key: K,
    /// The stored value.
    pub value: &'a V,
}

impl<K: AtomicKey, V> SegMap<K, V> {
    /// Creates a map sized for an estimated `final_size_est` entries with
    /// default options.
    ///
    /// The estimate is not a hard cap (growth handles the overflow), but
    /// every operation pays per extra segment, so estimate high.
    pub fn new(final_size_est: usize) -> Result<Self, MapError> {
        Self::with_config(final_size_est, Config::default())
    }
}

impl<K, V, S, P> SegMap<K, V, S, P>
where
    K: AtomicKey,
    S: BuildHasher + Clone + Default,
    P: ProbeSequence,
{
    /// Creates a map sized for an estimated `final_size_est` entries.
    pub fn with_config(final_size_est: usize, config: Config<K>) -> Result<Self, MapError> {
        Self::with_config_and_hasher(final_size_est, config, S::default())
    }
}

impl<K, V, S, P> SegMap<K, V, S, P>
where
    K: AtomicKey,
    S: BuildHasher + Clone,
    P: ProbeSequence,
{
    /// Creates a map with an explicit hasher, cloned into each new segment.
    pub fn with_config_and_hasher(
        final_size_est: usize,
        config: Config<K>,
        hasher: S,
    ) -> Result<Self, MapError> {
        config.validate()?;
        let primary = ArrayMap::with_parts(final_size_est, &config, hasher.clone());
        let segments: [AtomicPtr<ArrayMap<K, V, S, P>>; NUM_SEGMENTS] =
            std::array::from_fn(|_| AtomicPtr::new(ptr::null_mut()));
        segments[0].store(Box::into_raw(Box::new(primary)), Ordering::Relaxed);
        Ok(SegMap {
            segments,
            num_allocated: AtomicU32::new(1),
            growth_fraction: config.growth_fraction(),
            config,
            hasher,
        })
    }

    /// Segment `index`, which must be below the allocated count.
    fn segment(&self, index: usize) -> &ArrayMap<K, V, S, P> {
        // Slots below num_allocated hold real pointers published with
        // Release before the count was bumped.
        unsafe { &*self.segments[index].load(Ordering::Acquire) }
    }

    fn occupied(&self, segment_index: usize, offset: usize, key: K) -> Entry<'_, K, V> {
        Entry {
            handle: EntryHandle::encode(segment_index as u32, offset as u32),
            key,
            value: unsafe { self.segment(segment_index).value_at(offset) },
        }
    }

    /// Number of segments allocated so far.
    pub fn num_segments(&self) -> usize {
        self.num_allocated.load(Ordering::Acquire) as usize
    }

    /// Total cell count across segments.
    pub fn capacity(&self) -> usize {
        (0..self.num_segments())
            .map(|i| self.segment(i).capacity())
            .sum()
    }

    /// Inserts remaining before every current segment is at max load.
    /// Synchronizing.
    pub fn space_remaining(&self) -> usize {
        (0..self.num_segments())
            .map(|i| self.segment(i).space_remaining())
            .sum()
    }

    /// Number of live entries. Exact at the moment it is computed; each
    /// segment reconciles its sharded counter.
    pub fn len(&self) -> usize {
        (0..self.num_segments())
            .map(|i| self.segment(i).len())
            .sum()
    }

    /// Returns true if the map holds no live entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get the underlying hasher.
    pub fn hasher(&self) -> &S {
        &self.hasher
    }

    fn locate<Q>(&self, key: &Q) -> Option<(usize, usize, K)>
    where
        Q: Hash + Equivalent<K> + ?Sized,
    {
        // Primary first: the common case when sizing was adequate.
        if let Some((offset, stored)) = self.segment(0).find_slot(key) {
            return Some((0, offset, stored));
        }
        for i in 1..self.num_segments() {
            if let Some((offset, stored)) = self.segment(i).find_slot(key) {
                return Some((i, offset, stored));
            }
        }
        None
    }

    /// Looks up a value. Wait-free; supports heterogeneous keys.
    pub fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        Q: Hash + Equivalent<K> + ?Sized,
    {
        self.locate(key)
            .map(|(segment, offset, _)| unsafe { self.segment(segment).value_at(offset) })
    }

    /// Looks up the stored key and value.
    pub fn get_key_value<Q>(&self, key: &Q) -> Option<(K, &V)>
    where
        Q: Hash + Equivalent<K> + ?Sized,
    {
        self.locate(key)
            .map(|(segment, offset, stored)| {
                (stored, unsafe { self.segment(segment).value_at(offset) })
            })
    }

    /// Looks up an entry view, including its stable handle.
    pub fn get_entry<Q>(&self, key: &Q) -> Option<Entry<'_, K, V>>
    where
        Q: Hash + Equivalent<K> + ?Sized,
    {
        self.locate(key)
            .map(|(segment, offset, stored)| self.occupied(segment, offset, stored))
    }

    /// Returns true if the map contains `key`.
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        Q: Hash + Equivalent<K> + ?Sized,
    {
        self.locate(key).is_some()
    }

    /// Resolves a handle from an earlier insert or lookup. Direct indexed
    /// access, no hashing; `None` once the entry has been erased.
    pub fn get_at(&self, handle: EntryHandle) -> Option<Entry<'_, K, V>> {
        let (segment_index, offset) = handle.decode();
        if segment_index as usize >= self.num_segments() {
            return None;
        }
        let entry = self.segment(segment_index as usize).get_at(offset as usize)?;
        Some(Entry {
            handle,
            key: entry.key,
            value: entry.value,
        })
    }

    /// Inserts a key-value pair. Never overwrites: if the key is present
    /// anywhere, the existing entry is returned.
    pub fn insert(&self, key: K, value: V) -> Result<Insert<Entry<'_, K, V>>, MapError>
    where
        K: Hash,
    {
        self.insert_with(&key, move || value)
    }

    /// Inserts with lazy value construction: `make` runs only if the key is
    /// absent and a cell is claimed.
    pub fn insert_with<Q, F>(&self, key: &Q, make: F) -> Result<Insert<Entry<'_, K, V>>, MapError>
    where
        Q: Hash + ToKey<K> + ?Sized,
        F: FnOnce() -> V,
    {
        match self.try_insert_with(key, move || Ok::<V, std::convert::Infallible>(make())) {
            Ok(insert) => Ok(insert),
            Err(InsertError::Full) => Err(MapError::MapFull),
            Err(InsertError::Value(never)) => match never {},
        }
    }

    /// Inserts with fallible value construction. A segment reporting itself
    /// exhausted is recovered from internally by moving to (or allocating)
    /// the next segment; only total exhaustion surfaces as
    /// [`InsertError::Full`].
    pub fn try_insert_with<Q, E, F>(
        &self,
        key: &Q,
        make: F,
    ) -> Result<Insert<Entry<'_, K, V>>, InsertError<E>>
    where
        Q: Hash + ToKey<K> + ?Sized,
        F: FnOnce() -> Result<V, E>,
    {
        let mut make = Some(make);
        loop {
            let num = self.num_segments();
            for i in 0..num {
                let segment = self.segment(i);
                if segment.is_closed() {
                    // A closed segment takes no new claims, but an equal key
                    // may already live there.
                    if let Some((offset, stored)) = segment.find_slot(key) {
                        return Ok(Insert::Exists(self.occupied(i, offset, stored)));
                    }
                    continue;
                }
                match segment.raw_insert(key, &mut make)? {
                    RawSlot::Inserted(offset, stored) => {
                        return Ok(Insert::Inserted(self.occupied(i, offset, stored)));
                    }
                    RawSlot::Exists(offset, stored) => {
                        return Ok(Insert::Exists(self.occupied(i, offset, stored)));
                    }
                    RawSlot::Full => {}
                }
            }

            // Every segment is exhausted; bring up the next one and insert
            // there directly.
            let segment = self
                .allocate_segment(num)
                .map_err(|_| InsertError::Full)?;
            match segment.raw_insert(key, &mut make)? {
                RawSlot::Inserted(offset, stored) => {
                    return Ok(Insert::Inserted(self.occupied(num, offset, stored)));
                }
                RawSlot::Exists(offset, stored) => {
                    return Ok(Insert::Exists(self.occupied(num, offset, stored)));
                }
                // The fresh segment filled before we got in; start over.
                RawSlot::Full => {}
            }
        }
    }

    /// Claims and publishes segment slot `next_index`, or joins the winner
    /// that got there first. Fails only when growth is impossible.
    fn allocate_segment(&self, next_index: usize) -> Result<&ArrayMap<K, V, S, P>, MapError> {
        if next_index >= NUM_SEGMENTS {
            return Err(MapError::MapFull);
        }
        let primary_capacity = self.segment(0).capacity();
        if primary_capacity as f64 * self.growth_fraction < 1.0 {
            return Err(MapError::MapFull);
        }

        let slot = &self.segments[next_index];
        let claimed = CLAIMED as *mut ArrayMap<K, V, S, P>;
        match slot.compare_exchange(
            ptr::null_mut(),
            claimed,
            Ordering::Acquire,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                // Sized against total capacity so far:
                // primary * (1 + g)^(i - 1) * g.
                let cells_so_far = primary_capacity as f64
                    * (1.0 + self.growth_fraction).powi(next_index as i32 - 1);
                let max_size = ((cells_so_far * self.growth_fraction) as usize).max(1);
                let segment = ArrayMap::with_parts(max_size, &self.config, self.hasher.clone());
                let raw = Box::into_raw(Box::new(segment));
                slot.store(raw, Ordering::Release);
                self.num_allocated.fetch_add(1, Ordering::Release);
                Ok(unsafe { &*raw })
            }
            Err(_) => {
                // Lost the claim; wait for the winner to publish. Bounded by
                // the winner's (one-time) segment construction.
                let backoff = Backoff::new();
                loop {
                    let raw = slot.load(Ordering::Acquire);
                    if !raw.is_null() && raw as usize != CLAIMED {
                        return Ok(unsafe { &*raw });
                    }
                    backoff.snooze();
                }
            }
        }
    }

    /// Erases `key` wherever it lives. Returns false if absent or already
    /// erased by another thread.
    pub fn remove<Q>(&self, key: &Q) -> bool
    where
        Q: Hash + Equivalent<K> + ?Sized,
    {
        (0..self.num_segments()).any(|i| self.segment(i).remove(key))
    }

    /// Iterates over live entries, segment by segment in allocation order,
    /// array order within each. Lazy and restartable.
    pub fn iter(&self) -> Iter<'_, K, V, S, P> {
        Iter {
            map: self,
            segment_index: 0,
            inner: None,
        }
    }

    /// Wipes the primary segment and frees all others. Exclusive access
    /// only; outstanding handles are invalidated.
    pub fn clear(&mut self) {
        let num = *self.num_allocated.get_mut() as usize;
        unsafe {
            (*self.segments[0].load(Ordering::Relaxed)).clear();
            for slot in &mut self.segments[1..num] {
                drop(Box::from_raw(*slot.get_mut()));
                *slot.get_mut() = ptr::null_mut();
            }
        }
        *self.num_allocated.get_mut() = 1;
    }
}

impl<K: AtomicKey, V, S, P> Drop for SegMap<K, V, S, P> {
    fn drop(&mut self) {
        for slot in &mut self.segments {
            let raw = *slot.get_mut();
            if !raw.is_null() && raw as usize != CLAIMED {
                unsafe { drop(Box::from_raw(raw)) };
            }
        }
    }
}

/// Iterator over a [`SegMap`]'s live entries.
pub struct Iter<'a, K: AtomicKey, V, S, P> {
    map: &'a SegMap<K, V, S, P>,
    segment_index: usize,
    inner: Option<array_map::Iter<'a, K, V, S, P>>,
}

impl<'a, K, V, S, P> Iterator for Iter<'a, K, V, S, P>
where
    K: AtomicKey,
    S: BuildHasher + Clone,
    P: ProbeSequence,
{
    type Item = (K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(inner) = &mut self.inner {
                if let Some(item) = inner.next() {
                    return Some(item);
                }
                self.inner = None;
            }
            if self.segment_index >= self.map.num_segments() {
                return None;
            }
            self.inner = Some(self.map.segment(self.segment_index).iter());
            self.segment_index += 1;
        }
    }
}

impl<'a, K, V, S, P> IntoIterator for &'a SegMap<K, V, S, P>
where
    K: AtomicKey,
    S: BuildHasher + Clone,
    P: ProbeSequence,
{
    type Item = (K, &'a V);
    type IntoIter = Iter<'a, K, V, S, P>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn half_load_config() -> Config<u64> {
        Config {
            max_load_factor: 0.5,
            ..Config::default()
        }
    }

    #[test]
    fn test_insert_and_get() {
        let map: SegMap<u64, &str> = SegMap::new(16).unwrap();
        assert!(map.insert(1, "a").unwrap().is_inserted());
        assert!(map.insert(2, "b").unwrap().is_inserted());
        assert_eq!(map.get(&1), Some(&"a"));
        assert_eq!(map.get(&2), Some(&"b"));
        assert_eq!(map.get(&3), None);
    }

    #[test]
    fn test_growth_scenario() {
        // estimatedSize=2 at load factor 0.5: capacity 4, max 2 entries.
        let map: SegMap<u64, char> = SegMap::with_config(2, half_load_config()).unwrap();
        assert!(map.insert(10, 'A').unwrap().is_inserted());
        assert!(map.insert(11, 'B').unwrap().is_inserted());
        assert_eq!(map.num_segments(), 1);

        // Third insert exhausts the primary and allocates segment 1.
        let entry = map.insert(12, 'C').unwrap();
        assert!(entry.is_inserted());
        assert_eq!(map.num_segments(), 2);
        let (segment, _) = entry.entry().handle.decode();
        assert_eq!(segment, 1);

        assert_eq!(map.get(&10), Some(&'A'));
        assert_eq!(map.get(&11), Some(&'B'));
        assert_eq!(map.get(&12), Some(&'C'));

        assert!(map.remove(&10));
        assert_eq!(map.get(&10), None);
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_growth_segment_sizing() {
        // Primary capacity 4, growth fraction 0.5: segment 1 gets
        // max_size 4 * 0.5 = 2, hence capacity 4.
        let mut config = half_load_config();
        config.growth_factor = 0.5;
        let map: SegMap<u64, u64> = SegMap::with_config(2, config).unwrap();
        for i in 0..3 {
            map.insert(i, i).unwrap();
        }
        assert_eq!(map.num_segments(), 2);
        assert_eq!(map.capacity(), 8);
    }

    #[test]
    fn test_insert_existing_in_closed_segment() {
        let map: SegMap<u64, u64> = SegMap::with_config(2, half_load_config()).unwrap();
        map.insert(1, 100).unwrap();
        map.insert(2, 200).unwrap();
        map.insert(3, 300).unwrap();
        assert_eq!(map.num_segments(), 2);

        // Key 1 lives in the now-closed primary; a re-insert must find it
        // there, not duplicate it into segment 1.
        let outcome = map.insert(1, 999).unwrap();
        assert!(!outcome.is_inserted());
        assert_eq!(*outcome.entry().value, 100);
        let (segment, _) = outcome.entry().handle.decode();
        assert_eq!(segment, 0);
    }

    #[test]
    fn test_map_full_when_growth_impossible() {
        // Growth fraction small enough that capacity * g < 1.
        let mut config = half_load_config();
        config.growth_factor = 0.1;
        let map: SegMap<u64, u64> = SegMap::with_config(2, config).unwrap();
        map.insert(1, 1).unwrap();
        map.insert(2, 2).unwrap();
        assert_eq!(map.insert(3, 3).unwrap_err(), MapError::MapFull);
        // The failed insert had no effect.
        assert_eq!(map.len(), 2);
        assert_eq!(map.get(&3), None);
    }

    #[test]
    fn test_handles_stable_across_growth() {
        let map: SegMap<u64, u64> = SegMap::with_config(2, half_load_config()).unwrap();
        let mut handles = Vec::new();
        for i in 0..12 {
            handles.push((i, map.insert(i, i * 7).unwrap().into_entry().handle));
        }
        assert!(map.num_segments() > 1);
        for (key, handle) in handles {
            let entry = map.get_at(handle).unwrap();
            assert_eq!(entry.key, key);
            assert_eq!(*entry.value, key * 7);
            // Lookups return the same handle.
            assert_eq!(map.get_entry(&key).unwrap().handle, handle);
        }
    }

    #[test]
    fn test_get_at_after_erase() {
        let map: SegMap<u64, u64> = SegMap::new(16).unwrap();
        let handle = map.insert(5, 50).unwrap().into_entry().handle;
        assert!(map.get_at(handle).is_some());
        assert!(map.remove(&5));
        assert!(map.get_at(handle).is_none());
    }

    #[test]
    fn test_remove_idempotent() {
        let map: SegMap<u64, u64> = SegMap::new(16).unwrap();
        map.insert(1, 1).unwrap();
        assert!(map.remove(&1));
        assert!(!map.remove(&1));
        assert!(!map.remove(&2));
    }

    #[test]
    fn test_iter_spans_segments() {
        let map: SegMap<u64, u64> = SegMap::with_config(2, half_load_config()).unwrap();
        for i in 0..9 {
            map.insert(i, i).unwrap();
        }
        assert!(map.num_segments() > 1);
        let mut keys: Vec<_> = map.iter().map(|(k, _)| k).collect();
        keys.sort_unstable();
        assert_eq!(keys, (0..9u64).collect::<Vec<_>>());
    }

    #[test]
    fn test_space_remaining() {
        let map: SegMap<u64, u64> = SegMap::with_config(2, half_load_config()).unwrap();
        assert_eq!(map.space_remaining(), 2);
        map.insert(1, 1).unwrap();
        assert_eq!(map.space_remaining(), 1);
    }

    #[test]
    fn test_clear_frees_secondary_segments() {
        let mut map: SegMap<u64, u64> = SegMap::with_config(2, half_load_config()).unwrap();
        for i in 0..9 {
            map.insert(i, i).unwrap();
        }
        assert!(map.num_segments() > 1);
        map.clear();
        assert_eq!(map.num_segments(), 1);
        assert!(map.is_empty());
        assert!(map.insert(1, 1).unwrap().is_inserted());
    }

    #[test]
    fn test_failed_construction_recovers() {
        let map: SegMap<u64, String> = SegMap::new(16).unwrap();
        assert!(
            map.try_insert_with(&1, || Err::<String, &str>("nope"))
                .is_err()
        );
        assert!(
            map.try_insert_with(&1, || Ok::<_, &str>("x".to_string()))
                .unwrap()
                .is_inserted()
        );
        assert_eq!(map.get(&1).map(String::as_str), Some("x"));
    }

    #[test]
    fn test_signed_keys_default_sentinels() {
        let map: SegMap<i64, u64> = SegMap::new(16).unwrap();
        map.insert(0, 10).unwrap();
        map.insert(-4, 20).unwrap();
        assert_eq!(map.get(&0), Some(&10));
        assert_eq!(map.get(&-4), Some(&20));
    }
}
