//! Persistence boundary: the segment store trait, the borrowed records it
//! receives, and the structural descriptor used to resume paging.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Identifier of a block in the backing store.
///
/// Block ids are assigned lazily the first time a segment is persisted and
/// stay attached to the segment for its remaining lifetime.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct BlockId(pub u64);

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Borrowed view of a segment handed to [`SegmentStore::save`].
///
/// The record has no identity beyond the call; the store must persist
/// `values.len()` elements (and the matching tail slots) under `block`.
pub struct SaveRequest<'a, T, X = ()> {
    /// Occupied element slots of the segment, in logical order.
    pub values: &'a [T],
    /// Auxiliary payload slots, `tail_count` per element, element-major.
    pub tails: &'a [X],
    /// Number of tail slots per element.
    pub tail_count: usize,
    /// Global index of the first element in the segment.
    pub first_index: usize,
    /// Ordinal of the segment in the directory at the time of the call.
    pub segment: usize,
    /// Backing-store block assigned to the segment.
    pub block: BlockId,
    /// True when the segment's memory is released after a successful save.
    pub destroy: bool,
}

/// Borrowed view of a segment handed to [`SegmentStore::load`].
///
/// The slots arrive default-initialized. On a first-ever load the store may
/// leave them untouched; otherwise it must replay the content previously
/// saved under `block`.
pub struct LoadRequest<'a, T, X = ()> {
    /// Element slots to fill, in logical order.
    pub values: &'a mut [T],
    /// Auxiliary payload slots to fill, `tail_count` per element.
    pub tails: &'a mut [X],
    /// Number of tail slots per element.
    pub tail_count: usize,
    /// Global index of the first element in the segment.
    pub first_index: usize,
    /// Ordinal of the segment in the directory at the time of the call.
    pub segment: usize,
    /// Backing-store block assigned to the segment.
    pub block: BlockId,
    /// True when nothing has ever been persisted for this segment.
    pub first_load: bool,
}

/// Backing store for paged-out segments.
///
/// Implementations are opaque to the array: it only promises to call `save`
/// before releasing a segment's memory and `load` before handing out access
/// to an unmapped segment. Errors abort the triggering operation and leave
/// the array retry-safe: a failed save keeps the segment resident, a failed
/// load keeps it unmapped.
pub trait SegmentStore<T, X = ()> {
    /// Persists the occupied range of a segment.
    fn save(&mut self, req: &SaveRequest<'_, T, X>) -> Result<()>;
    /// Reloads the occupied range of a segment into fresh slots.
    fn load(&mut self, req: &mut LoadRequest<'_, T, X>) -> Result<()>;
}

/// Per-segment entry of an [`ArrayDescriptor`].
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SegmentDescriptor {
    /// Leading free slots in the segment buffer.
    pub used_offset: u64,
    /// Global index of the segment's first element.
    pub first_index: u64,
    /// Number of occupied slots.
    pub used_count: u64,
    /// Backing-store block, if the segment was ever persisted.
    pub block: Option<BlockId>,
}

/// Structural snapshot of a segmented array, without element content.
///
/// Together with the backing store this is enough to resume paging: segments
/// are restored unmapped and fault their content in on first access.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArrayDescriptor {
    /// Raw segment size as a power-of-two exponent.
    pub segment_shift: u32,
    /// Element capacity of each segment.
    pub segment_capacity: u64,
    /// Sequential-insert hint in effect when the array was captured.
    pub sequential_insert: bool,
    /// Trivial-constructor flag in effect when the array was captured.
    pub trivial_constructor: bool,
    /// Trivial-destructor flag in effect when the array was captured.
    pub trivial_destructor: bool,
    /// Logical element count.
    pub len: u64,
    /// Auxiliary payload slots per element.
    pub tail_count: u64,
    /// Resident-segment cap (`None` = unbounded).
    pub max_resident_segments: Option<u64>,
    /// One entry per segment, ordered by first index.
    pub segments: Vec<SegmentDescriptor>,
}
