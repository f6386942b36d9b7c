//! The atomic key word underpinning every cell.

use core::sync::atomic::{AtomicI32, AtomicIsize, AtomicU32, AtomicUsize, Ordering};

use portable_atomic::{AtomicI64, AtomicU64};

/// A key type that fits in a single atomic machine word.
///
/// The key slot of a cell doubles as the cell's lock, so keys must be
/// readable and writable in one atomic operation. Implementations exist for
/// the primitive integer types up to 64 bits; pointer-wide or narrower types
/// are all fine, anything larger is not representable.
///
/// The three `DEFAULT_*` constants are the sentinel values used by
/// [`Config::default`](crate::Config::default). They sit at the extreme end
/// of the type's range; callers whose key domain includes those values must
/// configure their own sentinels.
pub trait AtomicKey: Copy + Eq + Send + Sync + 'static {
    /// Atomic storage for one key slot.
    type Repr: Send + Sync;

    /// Default sentinel for an unused cell.
    const DEFAULT_EMPTY: Self;
    /// Default sentinel for a cell whose value is under construction.
    const DEFAULT_LOCKED: Self;
    /// Default sentinel for a tombstoned cell.
    const DEFAULT_ERASED: Self;

    /// Creates a slot holding `value`.
    fn repr(value: Self) -> Self::Repr;

    /// Atomically reads the slot.
    fn load(slot: &Self::Repr, order: Ordering) -> Self;

    /// Atomically writes the slot.
    fn store(slot: &Self::Repr, value: Self, order: Ordering);

    /// Atomically replaces `current` with `new`, returning the observed
    /// value on failure.
    fn compare_exchange(
        slot: &Self::Repr,
        current: Self,
        new: Self,
        success: Ordering,
        failure: Ordering,
    ) -> Result<Self, Self>;
}

macro_rules! atomic_key {
    ($key:ty, $repr:ty, $empty:expr, $locked:expr, $erased:expr) => {
        impl AtomicKey for $key {
            type Repr = $repr;

            const DEFAULT_EMPTY: Self = $empty;
            const DEFAULT_LOCKED: Self = $locked;
            const DEFAULT_ERASED: Self = $erased;

            #[inline(always)]
            fn repr(value: Self) -> Self::Repr {
                <$repr>::new(value)
            }

            #[inline(always)]
            fn load(slot: &Self::Repr, order: Ordering) -> Self {
                slot.load(order)
            }

            #[inline(always)]
            fn store(slot: &Self::Repr, value: Self, order: Ordering) {
                slot.store(value, order)
            }

            #[inline(always)]
            fn compare_exchange(
                slot: &Self::Repr,
                current: Self,
                new: Self,
                success: Ordering,
                failure: Ordering,
            ) -> Result<Self, Self> {
                slot.compare_exchange(current, new, success, failure)
            }
        }
    };
}

atomic_key!(u32, AtomicU32, u32::MAX, u32::MAX - 1, u32::MAX - 2);
atomic_key!(u64, AtomicU64, u64::MAX, u64::MAX - 1, u64::MAX - 2);
atomic_key!(usize, AtomicUsize, usize::MAX, usize::MAX - 1, usize::MAX - 2);
atomic_key!(i32, AtomicI32, -1, -2, -3);
atomic_key!(i64, AtomicI64, -1, -2, -3);
atomic_key!(isize, AtomicIsize, -1, -2, -3);
