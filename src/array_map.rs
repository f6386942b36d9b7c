//! Fixed-capacity concurrent map over a flat array of atomically-claimed
//! cells.
//!
//! # Architecture
//!
//! - **Cells**: a boxed slice of (atomic key word, uninitialized value) pairs.
//!   The key word doubles as the cell's lock: `Empty -> Locked` claims it,
//!   the final key publishes it, `-> Erased` tombstones it.
//! - **Reads**: wait-free. A find never writes and never spins.
//! - **Inserts**: claim a cell with a single compare-and-swap, construct the
//!   value in place, publish with a release store of the real key.
//! - **Erases**: flip the key to the erased sentinel. The value is never
//!   dropped or reused while the map is alive, so concurrent readers keep
//!   their references.
//!
//! Capacity is fixed for the life of the map; [`SegMap`](crate::SegMap)
//! chains several `ArrayMap`s when growth is needed.

use std::cell::UnsafeCell;
use std::convert::Infallible;
use std::hash::{BuildHasher, Hash};
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU8, Ordering};

use crossbeam_utils::Backoff;
use foldhash::fast::FixedState;
use petek_counter::CachedCounter;
use portable_atomic::AtomicU64;

use crate::Insert;
use crate::config::Config;
use crate::error::{InsertError, MapError};
use crate::key::AtomicKey;
use crate::lookup::{Equivalent, ToKey};
use crate::probe::{LinearProbe, ProbeSequence};

/// Fullness flag: inserts proceed normally.
const OPEN: u8 = 0;
/// Fullness flag: the entry count crossed `max_entries`; new claims are
/// refused while in-flight inserts drain.
const PENDING_CLOSED: u8 = 1;
/// Fullness flag: quiescent and permanently exhausted.
const CLOSED: u8 = 2;

/// One slot of the cell array.
struct Cell<K: AtomicKey, V> {
    key: K::Repr,
    value: UnsafeCell<MaybeUninit<V>>,
}

/// A fixed-capacity concurrent map with wait-free reads.
///
/// Keys are machine words (see [`AtomicKey`]); three caller-configurable
/// sentinel values are reserved to mark empty, locked, and erased cells.
/// Erase tombstones a cell without reclaiming it, so entry references and
/// indices stay valid until the map is dropped.
pub struct ArrayMap<K: AtomicKey, V, S = FixedState, P = LinearProbe> {
    cells: Box<[Cell<K, V>]>,
    capacity: usize,
    max_entries: usize,
    /// Mask over the next power of two >= capacity; anchors probe starts.
    anchor_mask: usize,
    empty_key: K,
    locked_key: K,
    erased_key: K,
    hasher: S,
    /// Published entries. Never decremented; erases are counted separately.
    entries: CachedCounter,
    /// Claims in flight. Must read exactly zero before the map closes.
    pending: CachedCounter,
    fullness: AtomicU8,
    num_erases: AtomicU64,
    _probe: PhantomData<P>,
}

// SAFETY: all cross-thread cell access goes through the atomic key word;
// a cell's value is written only by the claiming thread and shared
// immutably after publication.
unsafe impl<K: AtomicKey, V: Send, S: Send, P> Send for ArrayMap<K, V, S, P> {}
unsafe impl<K: AtomicKey, V: Send + Sync, S: Sync, P> Sync for ArrayMap<K, V, S, P> {}

/// A view of one occupied cell.
#[derive(Debug, Clone, Copy)]
pub struct Entry<'a, K, V> {
    /// Cell index within the map; valid for [`ArrayMap::get_at`] until the
    /// entry is erased.
    pub index: usize,
    /// The stored key.
    pub key: K,
    /// The stored value.
    pub value: &'a V,
}

/// Raw insert outcome, before entry views are attached.
pub(crate) enum RawSlot<K> {
    Inserted(usize, K),
    Exists(usize, K),
    Full,
}

/// Reverts a claimed cell and its pending count if value construction does
/// not complete.
struct ClaimGuard<'a, K: AtomicKey, V, S, P> {
    map: &'a ArrayMap<K, V, S, P>,
    cell: &'a Cell<K, V>,
}

impl<K: AtomicKey, V, S, P> ClaimGuard<'_, K, V, S, P> {
    fn disarm(self) {
        std::mem::forget(self);
    }
}

impl<K: AtomicKey, V, S, P> Drop for ClaimGuard<'_, K, V, S, P> {
    fn drop(&mut self) {
        K::store(&self.cell.key, self.map.empty_key, Ordering::Release);
        self.map.pending.decrement();
    }
}

impl<K: AtomicKey, V> ArrayMap<K, V> {
    /// Creates a map sized for `max_size` entries with default options.
    pub fn new(max_size: usize) -> Result<Self, MapError> {
        Self::with_config(max_size, &Config::default())
    }
}

impl<K, V, S, P> ArrayMap<K, V, S, P>
where
    K: AtomicKey,
    S: BuildHasher + Default,
    P: ProbeSequence,
{
    /// Creates a map sized for `max_size` entries.
    ///
    /// Capacity is `max_size / config.max_load_factor`; every cell starts
    /// empty and no value is constructed until a cell is claimed, so value
    /// types with expensive constructors cost nothing up front.
    pub fn with_config(max_size: usize, config: &Config<K>) -> Result<Self, MapError> {
        Self::with_config_and_hasher(max_size, config, S::default())
    }
}

impl<K, V, S, P> ArrayMap<K, V, S, P>
where
    K: AtomicKey,
    S: BuildHasher,
    P: ProbeSequence,
{
    /// Creates a map sized for `max_size` entries with an explicit hasher.
    pub fn with_config_and_hasher(
        max_size: usize,
        config: &Config<K>,
        hasher: S,
    ) -> Result<Self, MapError> {
        config.validate()?;
        Ok(Self::with_parts(max_size, config, hasher))
    }

    /// Construction behind validation; `config` must already be validated.
    pub(crate) fn with_parts(max_size: usize, config: &Config<K>, hasher: S) -> Self {
        let capacity = ((max_size as f64 / config.max_load_factor) as usize).max(1);
        let max_entries = ((config.max_load_factor * capacity as f64) as usize).max(1);
        // Small maps clamp the counter cache so the become-full trigger
        // fires before the array overfills; large maps keep cheap buffering.
        let cache_size = config
            .counter_cache_size
            .min((max_entries / 8).max(1) as u32)
            .max(1);

        let mut cells = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            cells.push(Cell {
                key: K::repr(config.empty_key),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            });
        }

        ArrayMap {
            cells: cells.into_boxed_slice(),
            capacity,
            max_entries,
            anchor_mask: capacity.next_power_of_two() - 1,
            empty_key: config.empty_key,
            locked_key: config.locked_key,
            erased_key: config.erased_key,
            hasher,
            entries: CachedCounter::with_cache_size(cache_size),
            pending: CachedCounter::unbuffered(),
            fullness: AtomicU8::new(OPEN),
            num_erases: AtomicU64::new(0),
            _probe: PhantomData,
        }
    }

    /// Number of cells.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of entries this map accepts before closing.
    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// Inserts remaining before this map reaches max load. Synchronizing.
    pub fn space_remaining(&self) -> usize {
        (self.max_entries as i64 - self.entries.read_full()).max(0) as usize
    }

    /// Number of live entries. Exact at the moment it is computed, at the
    /// cost of reconciling the sharded entry counter.
    pub fn len(&self) -> usize {
        let entries = self.entries.read_full();
        let erases = self.num_erases.load(Ordering::Relaxed) as i64;
        (entries - erases).max(0) as usize
    }

    /// Returns true if the map holds no live entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get the underlying hasher.
    pub fn hasher(&self) -> &S {
        &self.hasher
    }

    /// Whether this map has quiesced full and refuses all further inserts.
    pub(crate) fn is_closed(&self) -> bool {
        self.fullness.load(Ordering::SeqCst) == CLOSED
    }

    #[inline(always)]
    fn hash_of<Q: Hash + ?Sized>(&self, key: &Q) -> u64 {
        self.hasher.hash_one(key)
    }

    /// Initial probe index for a hash. The mask is taken over the next
    /// power of two, so out-of-range anchors fall back to a modulo.
    #[inline(always)]
    fn anchor_index(&self, hash: u64) -> usize {
        let anchor = (hash as usize) & self.anchor_mask;
        if anchor < self.capacity {
            anchor
        } else {
            (hash as usize) % self.capacity
        }
    }

    #[inline(always)]
    fn is_sentinel(&self, key: K) -> bool {
        key == self.empty_key || key == self.locked_key || key == self.erased_key
    }

    /// Value of a cell known to have held a published key.
    ///
    /// # Safety
    ///
    /// `index` must have been observed with a published (non-sentinel) key.
    /// Such cells hold an initialized value for the life of the map.
    pub(crate) unsafe fn value_at(&self, index: usize) -> &V {
        unsafe { (*self.cells[index].value.get()).assume_init_ref() }
    }

    fn occupied(&self, index: usize, key: K) -> Entry<'_, K, V> {
        Entry {
            index,
            key,
            value: unsafe { self.value_at(index) },
        }
    }

    /// Wait-free probe for `key`: the cell index and stored key, or `None`
    /// on an empty cell or after `capacity` probes.
    pub(crate) fn find_slot<Q>(&self, key: &Q) -> Option<(usize, K)>
    where
        Q: Hash + Equivalent<K> + ?Sized,
    {
        let mut idx = self.anchor_index(self.hash_of(key));
        for num_probes in 1..=self.capacity {
            let observed = K::load(&self.cells[idx].key, Ordering::Acquire);
            if observed == self.empty_key {
                return None;
            }
            if !self.is_sentinel(observed) && key.equivalent(&observed) {
                return Some((idx, observed));
            }
            idx = P::next(idx, num_probes, self.capacity);
        }
        None
    }

    /// Looks up a value. Wait-free; supports heterogeneous keys.
    pub fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        Q: Hash + Equivalent<K> + ?Sized,
    {
        self.find_slot(key)
            .map(|(index, _)| unsafe { self.value_at(index) })
    }

    /// Looks up the stored key and value.
    pub fn get_key_value<Q>(&self, key: &Q) -> Option<(K, &V)>
    where
        Q: Hash + Equivalent<K> + ?Sized,
    {
        self.find_slot(key)
            .map(|(index, stored)| (stored, unsafe { self.value_at(index) }))
    }

    /// Looks up an entry view, including its cell index.
    pub fn get_entry<Q>(&self, key: &Q) -> Option<Entry<'_, K, V>>
    where
        Q: Hash + Equivalent<K> + ?Sized,
    {
        self.find_slot(key)
            .map(|(index, stored)| self.occupied(index, stored))
    }

    /// Returns true if the map contains `key`.
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        Q: Hash + Equivalent<K> + ?Sized,
    {
        self.find_slot(key).is_some()
    }

    /// Direct indexed access, bypassing hashing. `None` if the cell does
    /// not currently hold a published entry.
    pub fn get_at(&self, index: usize) -> Option<Entry<'_, K, V>> {
        if index >= self.capacity {
            return None;
        }
        let observed = K::load(&self.cells[index].key, Ordering::Acquire);
        if self.is_sentinel(observed) {
            return None;
        }
        Some(self.occupied(index, observed))
    }

    /// Inserts a key-value pair. Never overwrites: if the key is present
    /// the existing entry is returned untouched.
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
        match self.try_insert_with(key, move || Ok::<V, Infallible>(make())) {
            Ok(insert) => Ok(insert),
            Err(InsertError::Full) => Err(MapError::MapFull),
            Err(InsertError::Value(never)) => match never {},
        }
    }

    /// Inserts with fallible value construction. On `Err` the claimed cell
    /// is reverted to empty and remains usable by a later insert.
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
        match self.raw_insert(key, &mut make)? {
            RawSlot::Inserted(index, stored) => Ok(Insert::Inserted(self.occupied(index, stored))),
            RawSlot::Exists(index, stored) => Ok(Insert::Exists(self.occupied(index, stored))),
            RawSlot::Full => Err(InsertError::Full),
        }
    }

    /// The cell-claiming insert protocol. `RawSlot::Full` means this map is
    /// (or just became) exhausted; the caller decides whether that is an
    /// error or a cue to move to the next segment.
    pub(crate) fn raw_insert<Q, E, F>(
        &self,
        key: &Q,
        make: &mut Option<F>,
    ) -> Result<RawSlot<K>, InsertError<E>>
    where
        Q: Hash + ToKey<K> + ?Sized,
        F: FnOnce() -> Result<V, E>,
    {
        let mut idx = self.anchor_index(self.hash_of(key));
        let mut num_probes = 1;
        loop {
            let cell = &self.cells[idx];
            let mut observed = K::load(&cell.key, Ordering::Acquire);

            if observed == self.empty_key {
                // SeqCst on the pending increment and the flag load: they
                // form a store/load pair with try_close's flag store and
                // pending read, which acquire/release would not order.
                self.pending.increment();
                if self.fullness.load(Ordering::SeqCst) != OPEN {
                    self.pending.decrement();
                    self.try_close();
                    // The map is now quiesced. An equal key may have been
                    // published behind us while we probed; re-probe before
                    // reporting full, or a caller could plant a duplicate
                    // in the next segment.
                    return Ok(match self.find_slot(key) {
                        Some((index, stored)) => RawSlot::Exists(index, stored),
                        None => RawSlot::Full,
                    });
                }
                match K::compare_exchange(
                    &cell.key,
                    self.empty_key,
                    self.locked_key,
                    Ordering::Acquire,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        let guard = ClaimGuard { map: self, cell };
                        let Some(make) = make.take() else {
                            unreachable!("a single insert never claims two cells");
                        };
                        let stored = key.to_key();
                        let value = match make() {
                            Ok(value) => value,
                            // The guard reverts the cell and the pending
                            // count as the error propagates.
                            Err(e) => return Err(InsertError::Value(e)),
                        };
                        unsafe { (*cell.value.get()).write(value) };
                        // Publish: pairs with the acquire key loads, so any
                        // thread that sees the key sees the value.
                        K::store(&cell.key, stored, Ordering::Release);
                        guard.disarm();
                        self.pending.decrement();

                        self.entries.increment();
                        if self.entries.read_fast() >= self.max_entries as i64 {
                            self.fullness.store(PENDING_CLOSED, Ordering::SeqCst);
                        }
                        return Ok(RawSlot::Inserted(idx, stored));
                    }
                    Err(actual) => {
                        // Lost the claim race; the cell is no longer ours
                        // to count against.
                        self.pending.decrement();
                        observed = actual;
                    }
                }
            }

            if observed == self.locked_key {
                // The claimant either publishes a real key or reverts to
                // empty; bounded by that one in-flight construction.
                let backoff = Backoff::new();
                loop {
                    observed = K::load(&cell.key, Ordering::Acquire);
                    if observed != self.locked_key {
                        break;
                    }
                    backoff.snooze();
                }
            }

            if observed == self.empty_key {
                // The claimant reverted; take another shot at this cell.
                continue;
            }

            if observed != self.erased_key && key.equivalent(&observed) {
                return Ok(RawSlot::Exists(idx, observed));
            }

            if num_probes == self.capacity {
                return Ok(RawSlot::Full);
            }
            idx = P::next(idx, num_probes, self.capacity);
            num_probes += 1;
        }
    }

    /// Drives PendingClosed to Closed once no insert is in flight.
    ///
    /// Invariant: once Closed is visible, no claim can be in flight, so the
    /// owning [`SegMap`](crate::SegMap) may treat this map as permanently
    /// exhausted.
    fn try_close(&self) {
        let backoff = Backoff::new();
        loop {
            if self.fullness.load(Ordering::SeqCst) != PENDING_CLOSED {
                return;
            }
            if self.pending.read_full() == 0 {
                self.fullness.store(CLOSED, Ordering::SeqCst);
                return;
            }
            backoff.snooze();
        }
    }

    /// Erases `key`, leaving a tombstone. Returns false if the key was
    /// absent or another thread erased it first. The value is never touched:
    /// concurrent readers may still hold references to it.
    pub fn remove<Q>(&self, key: &Q) -> bool
    where
        Q: Hash + Equivalent<K> + ?Sized,
    {
        let mut idx = self.anchor_index(self.hash_of(key));
        for num_probes in 1..=self.capacity {
            let cell = &self.cells[idx];
            let observed = K::load(&cell.key, Ordering::Acquire);
            if observed == self.empty_key {
                return false;
            }
            if !self.is_sentinel(observed) && key.equivalent(&observed) {
                // Published keys only ever change to Erased, so a failed
                // swap means another thread erased this entry first.
                let erased = K::compare_exchange(
                    &cell.key,
                    observed,
                    self.erased_key,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok();
                if erased {
                    self.num_erases.fetch_add(1, Ordering::Relaxed);
                }
                return erased;
            }
            idx = P::next(idx, num_probes, self.capacity);
        }
        false
    }

    /// Iterates over live entries in array order. Lazy and restartable; a
    /// fresh call always starts over.
    pub fn iter(&self) -> Iter<'_, K, V, S, P> {
        Iter {
            map: self,
            index: 0,
        }
    }

    /// Wipes all entries and reopens the map. Exclusive access only.
    pub fn clear(&mut self) {
        for cell in self.cells.iter() {
            let observed = K::load(&cell.key, Ordering::Relaxed);
            if observed != self.empty_key {
                if observed != self.locked_key {
                    unsafe { (*cell.value.get()).assume_init_drop() };
                }
                K::store(&cell.key, self.empty_key, Ordering::Relaxed);
            }
        }
        self.entries = CachedCounter::with_cache_size(self.entries.cache_size());
        self.pending = CachedCounter::unbuffered();
        self.fullness.store(OPEN, Ordering::Relaxed);
        self.num_erases.store(0, Ordering::Relaxed);
    }
}

impl<K: AtomicKey, V, S, P> Drop for ArrayMap<K, V, S, P> {
    fn drop(&mut self) {
        if !std::mem::needs_drop::<V>() {
            return;
        }
        for cell in self.cells.iter() {
            let observed = K::load(&cell.key, Ordering::Relaxed);
            // Tombstoned cells still hold constructed values.
            if observed != self.empty_key && observed != self.locked_key {
                unsafe { (*cell.value.get()).assume_init_drop() };
            }
        }
    }
}

/// Iterator over an [`ArrayMap`]'s live entries.
pub struct Iter<'a, K: AtomicKey, V, S, P> {
    map: &'a ArrayMap<K, V, S, P>,
    index: usize,
}

impl<'a, K, V, S, P> Iterator for Iter<'a, K, V, S, P>
where
    K: AtomicKey,
    S: BuildHasher,
    P: ProbeSequence,
{
    type Item = (K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        while self.index < self.map.capacity {
            let index = self.index;
            self.index += 1;
            let observed = K::load(&self.map.cells[index].key, Ordering::Acquire);
            if !self.map.is_sentinel(observed) {
                return Some((observed, unsafe { self.map.value_at(index) }));
            }
        }
        None
    }
}

impl<'a, K, V, S, P> IntoIterator for &'a ArrayMap<K, V, S, P>
where
    K: AtomicKey,
    S: BuildHasher,
    P: ProbeSequence,
{
    type Item = (K, &'a V);
    type IntoIter = Iter<'a, K, V, S, P>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
