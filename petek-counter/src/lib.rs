//! Thread-sharded counter with cheap writes and two read flavors.
//!
//! `CachedCounter` is built for counters that are bumped constantly from many
//! threads but read rarely. Each thread buffers its updates in a private,
//! cache-padded shard and folds them into a shared total once the buffered
//! magnitude reaches the cache size. That gives three cost tiers:
//!
//! - [`CachedCounter::add`] / [`increment`](CachedCounter::increment) /
//!   [`decrement`](CachedCounter::decrement): one uncontended atomic op on the
//!   calling thread's own shard.
//! - [`CachedCounter::read_fast`]: a single load of the shared total.
//!   Approximate: it misses whatever is still buffered in shards.
//! - [`CachedCounter::read_full`]: locks the shard registry and sums the
//!   total plus every live shard. Exact, synchronizing.
//!
//! A thread's buffered count is flushed into the shared total when the thread
//! exits, so `read_full` (and eventually `read_fast`) stay exact across
//! thread churn.
//!
//! # Example
//!
//! ```rust
//! use petek_counter::CachedCounter;
//!
//! let counter = CachedCounter::new();
//! counter.add(10);
//! counter.decrement();
//! assert_eq!(counter.read_full(), 9);
//! ```

#![warn(missing_docs)]

use std::cell::RefCell;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crossbeam_utils::CachePadded;
use portable_atomic::AtomicI64;

/// Default per-thread cache size, in buffered increments.
const DEFAULT_CACHE_SIZE: u32 = 1000;

/// A counter sharded across the threads that touch it.
pub struct CachedCounter {
    inner: Arc<Inner>,
}

struct Inner {
    /// Flushed contributions. `read_fast` reads only this.
    total: AtomicI64,
    /// Buffered magnitude at which a shard folds itself into `total`.
    cache_size: AtomicU32,
    /// One shard per thread that has ever touched this counter.
    shards: Mutex<Vec<Arc<Shard>>>,
}

#[derive(Default)]
struct Shard {
    /// Buffered delta. Written only by the owning thread; read by `read_full`.
    pending: CachePadded<AtomicI64>,
    /// Set once the owning thread has exited and flushed.
    retired: AtomicBool,
}

thread_local! {
    /// This thread's shard handles, keyed by counter identity.
    static SHARDS: RefCell<HashMap<usize, LocalShard>> = RefCell::new(HashMap::new());
}

/// A thread's handle on its shard of one counter. Dropping it (at thread
/// exit, or when a stale entry is evicted) flushes the buffered count.
struct LocalShard {
    owner: Weak<Inner>,
    shard: Arc<Shard>,
}

impl Drop for LocalShard {
    fn drop(&mut self) {
        let pending = self.shard.pending.load(Ordering::SeqCst);
        if pending != 0 {
            if let Some(inner) = self.owner.upgrade() {
                inner.total.fetch_add(pending, Ordering::SeqCst);
            }
            self.shard.pending.fetch_sub(pending, Ordering::SeqCst);
        }
        self.shard.retired.store(true, Ordering::Release);
    }
}

impl CachedCounter {
    /// Creates a counter with the default cache size.
    pub fn new() -> Self {
        Self::with_cache_size(DEFAULT_CACHE_SIZE)
    }

    /// Creates a counter that flushes a thread's buffered count into the
    /// shared total once its magnitude reaches `cache_size` (min 1).
    pub fn with_cache_size(cache_size: u32) -> Self {
        CachedCounter {
            inner: Arc::new(Inner {
                total: AtomicI64::new(0),
                cache_size: AtomicU32::new(cache_size.max(1)),
                shards: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Creates a counter that never threshold-flushes: every update stays in
    /// its shard until the thread exits, so `read_full` sums live shard
    /// values directly and never observes a flush in flight.
    pub fn unbuffered() -> Self {
        Self::with_cache_size(u32::MAX)
    }

    /// Adds `delta` to the counter.
    pub fn add(&self, delta: i64) {
        if delta == 0 {
            return;
        }
        self.with_shard(|shard, inner| {
            let buffered = shard.pending.fetch_add(delta, Ordering::SeqCst) + delta;
            let cache = inner.cache_size.load(Ordering::Relaxed);
            if buffered.unsigned_abs() >= u64::from(cache) {
                // Fold into the total first, then drain the shard: a racing
                // `read_full` may transiently double-count the flushed delta
                // but can never miss a buffered increment.
                inner.total.fetch_add(buffered, Ordering::SeqCst);
                shard.pending.fetch_sub(buffered, Ordering::SeqCst);
            }
        });
    }

    /// Adds one.
    pub fn increment(&self) {
        self.add(1);
    }

    /// Subtracts one.
    pub fn decrement(&self) {
        self.add(-1);
    }

    /// Approximate value: the flushed total only. Lock-free; undercounts
    /// whatever threads still have buffered.
    pub fn read_fast(&self) -> i64 {
        self.inner.total.load(Ordering::Relaxed)
    }

    /// Exact value: the flushed total plus every live shard's buffer.
    /// Takes the shard-registry lock; prunes shards of exited threads.
    pub fn read_full(&self) -> i64 {
        let mut shards = match self.inner.shards.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        shards.retain(|shard| {
            !(shard.retired.load(Ordering::Acquire)
                && shard.pending.load(Ordering::SeqCst) == 0)
        });
        let mut sum = self.inner.total.load(Ordering::SeqCst);
        for shard in shards.iter() {
            sum += shard.pending.load(Ordering::SeqCst);
        }
        sum
    }

    /// Current flush threshold.
    pub fn cache_size(&self) -> u32 {
        self.inner.cache_size.load(Ordering::Relaxed)
    }

    /// Changes the flush threshold for subsequent updates (min 1).
    pub fn set_cache_size(&self, cache_size: u32) {
        self.inner
            .cache_size
            .store(cache_size.max(1), Ordering::Relaxed);
    }

    /// Runs `f` with this thread's shard, registering one on first use.
    fn with_shard<R>(&self, f: impl FnOnce(&Shard, &Inner) -> R) -> R {
        SHARDS.with(|cell| {
            let mut map = cell.borrow_mut();
            let id = Arc::as_ptr(&self.inner) as usize;
            // An entry under our id may belong to a dropped counter whose
            // allocation this one reuses; upgrade() distinguishes them.
            if let Entry::Occupied(existing) = map.entry(id) {
                if existing.get().owner.upgrade().is_none() {
                    existing.remove();
                }
            }
            let local = map.entry(id).or_insert_with(|| {
                let shard = Arc::new(Shard::default());
                let mut shards = match self.inner.shards.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                shards.push(Arc::clone(&shard));
                LocalShard {
                    owner: Arc::downgrade(&self.inner),
                    shard,
                }
            });
            f(local.shard.as_ref(), self.inner.as_ref())
        })
    }
}

impl Default for CachedCounter {
    fn default() -> Self {
        Self::new()
    }
}
