//! Stable bit-packed entry handles.

/// Handle bits reserved for the segment index.
pub(crate) const NUM_SEGMENT_BITS: u32 = 4;

/// Upper bound on segments per [`SegMap`](crate::SegMap), derived from the
/// handle layout.
pub(crate) const NUM_SEGMENTS: usize = 1 << NUM_SEGMENT_BITS;

const SECONDARY_BIT: u32 = 1 << 31;
const SEGMENT_SHIFT: u32 = 31 - NUM_SEGMENT_BITS;
const OFFSET_MASK: u32 = (1 << SEGMENT_SHIFT) - 1;

/// A stable reference to one occupied cell of a [`SegMap`](crate::SegMap).
///
/// Handles pack (segment index, cell offset) into 32 bits. Segment 0 keeps
/// the whole lower 31 bits for its offset; later segments spend four bits
/// on the segment index and flag themselves with the top bit. Resolving a
/// handle is a direct array access with no hashing.
///
/// A handle stays valid until its entry is erased or the map is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryHandle(u32);

impl EntryHandle {
    pub(crate) fn encode(segment: u32, offset: u32) -> Self {
        if segment == 0 {
            debug_assert_eq!(offset & SECONDARY_BIT, 0);
            return EntryHandle(offset);
        }
        debug_assert_eq!(segment >> NUM_SEGMENT_BITS, 0);
        debug_assert_eq!(offset & !OFFSET_MASK, 0);
        EntryHandle(SECONDARY_BIT | (segment << SEGMENT_SHIFT) | offset)
    }

    pub(crate) fn decode(self) -> (u32, u32) {
        if self.0 & SECONDARY_BIT == 0 {
            (0, self.0)
        } else {
            let bits = self.0 & !SECONDARY_BIT;
            (bits >> SEGMENT_SHIFT, bits & OFFSET_MASK)
        }
    }

    /// The raw packed value, for embedding in other structures.
    pub fn into_raw(self) -> u32 {
        self.0
    }

    /// Rebuilds a handle from [`into_raw`](Self::into_raw) output.
    pub fn from_raw(raw: u32) -> Self {
        EntryHandle(raw)
    }
}
