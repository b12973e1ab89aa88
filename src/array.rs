//! The segmented, pageable array.
//!
//! Storage is split across fixed-capacity segments tracked by an ordered
//! directory. A bounded number of segments is kept resident; when the budget
//! is exhausted the least recently used unpinned segments are persisted
//! through the configured [`SegmentStore`] and their memory released. Access
//! to an unmapped segment faults its content back in through the same store.
//!
//! All operations run synchronously on the caller's thread. Mutating methods
//! take `&self` through interior mutability so live cursors can keep their
//! segments pinned while other parts of the array change; the type is
//! deliberately neither `Send` nor `Sync`.

use std::cell::{Ref, RefCell, RefMut};
use std::ops::Range;

use tracing::{debug, warn};

use crate::cursor::Cursor;
use crate::directory::Directory;
use crate::error::{QuireError, Result};
use crate::evict::VictimQueue;
use crate::options::{segment_shift, ArrayOptions};
use crate::persist::{
    ArrayDescriptor, BlockId, LoadRequest, SaveRequest, SegmentDescriptor, SegmentStore,
};
use crate::segment::{Layout, PinGuard, Segment};

/// Counters describing paging activity since the array was created.
#[derive(Clone, Debug, Default)]
pub struct ArrayStats {
    /// Segments loaded (or first-initialized) through the store.
    pub faults: u64,
    /// Faults that were first-ever loads of a never-persisted segment.
    pub prime_loads: u64,
    /// Segments evicted under memory pressure.
    pub evictions: u64,
    /// Save callbacks issued, including explicit flushes.
    pub saves: u64,
    /// Times the victim batch had to be recomputed.
    pub batch_rebuilds: u64,
}

/// Introspection snapshot of one segment.
#[derive(Clone, Debug)]
pub struct SegmentInfo {
    /// Global index of the segment's first element.
    pub first_index: usize,
    /// Number of occupied slots.
    pub used_count: usize,
    /// Leading free slots in the segment buffer.
    pub used_offset: usize,
    /// Backing-store block, if the segment was ever persisted.
    pub block: Option<BlockId>,
    /// Whether the segment's buffer is currently in memory.
    pub resident: bool,
}

/// Shared reference to one element, holding the array borrowed until drop.
pub struct ValueRef<'a, T>(Ref<'a, T>);

impl<'a, T> ValueRef<'a, T> {
    pub(crate) fn new(inner: Ref<'a, T>) -> Self {
        Self(inner)
    }
}

impl<T> std::ops::Deref for ValueRef<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for ValueRef<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        (**self).fmt(f)
    }
}

/// Mutable reference to one element, holding the array borrowed until drop.
pub struct ValueMut<'a, T>(RefMut<'a, T>);

impl<'a, T> ValueMut<'a, T> {
    pub(crate) fn new(inner: RefMut<'a, T>) -> Self {
        Self(inner)
    }
}

impl<T> std::ops::Deref for ValueMut<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T> std::ops::DerefMut for ValueMut<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for ValueMut<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        (**self).fmt(f)
    }
}

type BoxedStore<T, X> = Box<dyn SegmentStore<T, X>>;

/// A segmented array of `T`, optionally paged out to a backing store.
///
/// Each element may carry a fixed number of auxiliary payload slots of type
/// `X` with identical density and lifetime (see
/// [`ArrayOptions::tail_count`]). Elements are default-constructed on insert;
/// `T: Default` stands in for the usual notion of constructibility.
pub struct SegArray<T, X = ()> {
    pub(crate) inner: RefCell<Inner<T, X>>,
    pub(crate) store: RefCell<Option<BoxedStore<T, X>>>,
}

impl<T, X> std::fmt::Debug for SegArray<T, X> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("SegArray")
            .field("len", &inner.len)
            .field("segments", &inner.dir.len())
            .field("resident", &inner.resident)
            .field("segment_capacity", &inner.layout.capacity)
            .finish_non_exhaustive()
    }
}

pub(crate) struct Inner<T, X> {
    pub(crate) layout: Layout,
    pub(crate) dir: Directory<T, X>,
    pub(crate) len: usize,
    pub(crate) resident: usize,
    pub(crate) max_resident: Option<usize>,
    pub(crate) counter: u64,
    pub(crate) next_block: u64,
    pub(crate) victims: VictimQueue,
    pub(crate) epoch: u64,
    pub(crate) stats: ArrayStats,
}

impl<T: Default, X: Default> SegArray<T, X> {
    /// Creates an empty array with the given options and no store attached.
    pub fn new(options: ArrayOptions) -> Result<Self> {
        let shift = segment_shift(options.segment_bytes);
        let layout = Self::build_layout(
            shift,
            options.tail_count,
            options.sequential_insert,
            options.trivial_constructor,
            options.trivial_destructor,
        )?;
        Ok(Self {
            inner: RefCell::new(Inner {
                layout,
                dir: Directory::new(),
                len: 0,
                resident: 0,
                max_resident: options.max_resident_segments,
                counter: 0,
                next_block: 0,
                victims: VictimQueue::default(),
                epoch: 0,
                stats: ArrayStats::default(),
            }),
            store: RefCell::new(None),
        })
    }

    /// Creates an array with a backing store already attached.
    pub fn with_store<S>(options: ArrayOptions, store: S) -> Result<Self>
    where
        S: SegmentStore<T, X> + 'static,
    {
        let array = Self::new(options)?;
        array.set_store(store);
        Ok(array)
    }

    fn build_layout(
        shift: u32,
        tail_count: usize,
        sequential_insert: bool,
        trivial_constructor: bool,
        trivial_destructor: bool,
    ) -> Result<Layout> {
        let stride = std::mem::size_of::<T>() + tail_count * std::mem::size_of::<X>();
        let bytes = 1usize
            .checked_shl(shift)
            .ok_or(QuireError::InvalidArgument("segment size overflow"))?;
        if stride > bytes {
            return Err(QuireError::InvalidArgument(
                "element stride exceeds the segment size",
            ));
        }
        Ok(Layout {
            shift,
            capacity: bytes / stride.max(1),
            tail_count,
            sequential_insert,
            trivial_constructor,
            trivial_destructor,
        })
    }

    /// Rebuilds an array from a structural descriptor.
    ///
    /// Every segment comes back unmapped; content is faulted in lazily from
    /// the store attached afterwards with [`SegArray::set_store`].
    pub fn restore(desc: &ArrayDescriptor) -> Result<Self> {
        let layout = Self::build_layout(
            desc.segment_shift,
            desc.tail_count as usize,
            desc.sequential_insert,
            desc.trivial_constructor,
            desc.trivial_destructor,
        )
        .map_err(|_| QuireError::Corruption("descriptor layout does not fit element".into()))?;
        if layout.capacity as u64 != desc.segment_capacity {
            return Err(QuireError::Corruption(
                "descriptor segment capacity does not match element layout".into(),
            ));
        }
        let mut dir = Directory::new();
        let mut running = 0u64;
        let mut next_block = 0u64;
        for (ordinal, seg) in desc.segments.iter().enumerate() {
            if seg.first_index != running {
                return Err(QuireError::Corruption(
                    "descriptor segment ranges are not contiguous".into(),
                ));
            }
            if seg.used_count == 0
                || seg.used_offset + seg.used_count > desc.segment_capacity
            {
                return Err(QuireError::Corruption(
                    "descriptor segment occupancy out of bounds".into(),
                ));
            }
            running += seg.used_count;
            if let Some(block) = seg.block {
                next_block = next_block.max(block.0 + 1);
            }
            dir.insert(
                ordinal,
                Segment::new_unmapped(
                    seg.used_offset as usize,
                    seg.used_count as usize,
                    seg.first_index as usize,
                    seg.block,
                ),
            );
        }
        if running != desc.len {
            return Err(QuireError::Corruption(
                "descriptor length does not match segment occupancy".into(),
            ));
        }
        Ok(Self {
            inner: RefCell::new(Inner {
                layout,
                dir,
                len: desc.len as usize,
                resident: 0,
                max_resident: desc.max_resident_segments.map(|v| v as usize),
                counter: 0,
                next_block,
                victims: VictimQueue::default(),
                epoch: 0,
                stats: ArrayStats::default(),
            }),
            store: RefCell::new(None),
        })
    }

    /// Attaches (or replaces) the backing store used for paging.
    pub fn set_store<S>(&self, store: S)
    where
        S: SegmentStore<T, X> + 'static,
    {
        *self.store.borrow_mut() = Some(Box::new(store));
    }

    /// Logical number of elements.
    pub fn len(&self) -> usize {
        self.inner.borrow().len
    }

    /// True when the array holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element capacity of one segment.
    pub fn segment_capacity(&self) -> usize {
        self.inner.borrow().layout.capacity
    }

    /// Raw segment size in bytes (a power of two).
    pub fn segment_bytes(&self) -> usize {
        self.inner.borrow().layout.raw_bytes()
    }

    /// Auxiliary payload slots per element.
    pub fn tail_count(&self) -> usize {
        self.inner.borrow().layout.tail_count
    }

    /// Number of segments in the directory.
    pub fn segment_count(&self) -> usize {
        self.inner.borrow().dir.len()
    }

    /// Number of segments currently held in memory.
    pub fn resident_segments(&self) -> usize {
        self.inner.borrow().resident
    }

    /// Resident-segment cap currently in effect.
    pub fn max_resident_segments(&self) -> Option<usize> {
        self.inner.borrow().max_resident
    }

    /// Whether the given segment's buffer is in memory.
    pub fn is_resident(&self, ordinal: usize) -> Result<bool> {
        let inner = self.inner.borrow();
        if ordinal >= inner.dir.len() {
            return Err(QuireError::OutOfRange {
                index: ordinal,
                len: inner.dir.len(),
            });
        }
        Ok(inner.dir.get(ordinal).is_resident())
    }

    /// Bookkeeping snapshot of one segment.
    pub fn segment_info(&self, ordinal: usize) -> Result<SegmentInfo> {
        let inner = self.inner.borrow();
        if ordinal >= inner.dir.len() {
            return Err(QuireError::OutOfRange {
                index: ordinal,
                len: inner.dir.len(),
            });
        }
        let seg = inner.dir.get(ordinal);
        Ok(SegmentInfo {
            first_index: seg.first_index,
            used_count: seg.used_count,
            used_offset: seg.used_offset,
            block: seg.block,
            resident: seg.is_resident(),
        })
    }

    /// Paging counters accumulated so far.
    pub fn stats(&self) -> ArrayStats {
        self.inner.borrow().stats.clone()
    }

    /// Changes the resident-segment cap, evicting down to it if necessary.
    pub fn set_max_resident_segments(&self, cap: Option<usize>) -> Result<()> {
        let mut store = self.store.borrow_mut();
        let mut inner = self.inner.borrow_mut();
        if cap == Some(0) {
            return Err(QuireError::InvalidArgument(
                "resident cap must admit at least one segment",
            ));
        }
        inner.max_resident = cap;
        if let Some(cap) = cap {
            while inner.resident > cap {
                inner.evict_one(cap, store.as_deref_mut())?;
            }
        }
        Ok(())
    }

    /// Derives the resident-segment cap from a memory budget in bytes.
    ///
    /// A budget of zero removes the cap and disables paging.
    pub fn set_memory_budget(&self, bytes: usize) -> Result<()> {
        let cap = if bytes == 0 {
            None
        } else {
            let shift = self.inner.borrow().layout.shift;
            Some(std::cmp::max(1, bytes >> shift))
        };
        self.set_max_resident_segments(cap)
    }

    /// Changes the number of auxiliary payload slots per element.
    ///
    /// Rejected once the array holds elements.
    pub fn set_tail_count(&self, tail_count: usize) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        if inner.len > 0 {
            return Err(QuireError::LayoutFrozen);
        }
        let layout = &inner.layout;
        let rebuilt = Self::build_layout(
            layout.shift,
            tail_count,
            layout.sequential_insert,
            layout.trivial_constructor,
            layout.trivial_destructor,
        )?;
        inner.layout = rebuilt;
        Ok(())
    }

    /// Changes the raw segment byte size (rounded up to a power of two).
    ///
    /// Rejected once the array holds elements.
    pub fn set_segment_bytes(&self, bytes: usize) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        if inner.len > 0 {
            return Err(QuireError::LayoutFrozen);
        }
        let layout = &inner.layout;
        let rebuilt = Self::build_layout(
            segment_shift(bytes),
            layout.tail_count,
            layout.sequential_insert,
            layout.trivial_constructor,
            layout.trivial_destructor,
        )?;
        inner.layout = rebuilt;
        Ok(())
    }

    /// Inserts `n` default-constructed elements before `index`.
    ///
    /// An index at or past the logical end first extends the array with
    /// default elements up to `index`, then appends.
    pub fn insert(&self, index: usize, n: usize) -> Result<()> {
        let mut store = self.store.borrow_mut();
        let mut inner = self.inner.borrow_mut();
        inner.do_insert(index, n, store.as_deref_mut())
    }

    /// Removes `n` elements starting at `index`.
    pub fn remove(&self, index: usize, n: usize) -> Result<()> {
        let mut store = self.store.borrow_mut();
        let mut inner = self.inner.borrow_mut();
        inner.do_remove(index, n, store.as_deref_mut())
    }

    /// Appends one element and returns its index.
    pub fn push(&self, value: T) -> Result<usize> {
        let mut store = self.store.borrow_mut();
        let mut inner = self.inner.borrow_mut();
        let index = inner.len;
        inner.do_insert(index, 1, store.as_deref_mut())?;
        let (ordinal, local) = inner.resolve(index, store.as_deref_mut())?;
        *inner.dir.get_mut(ordinal).value_mut(local) = value;
        Ok(index)
    }

    /// Shared access to the element at `index`, faulting its segment in if
    /// needed. The returned guard keeps the array borrowed; drop it before
    /// the next mutating call.
    pub fn get(&self, index: usize) -> Result<ValueRef<'_, T>> {
        let (ordinal, local) = {
            let mut store = self.store.borrow_mut();
            let mut inner = self.inner.borrow_mut();
            inner.resolve(index, store.as_deref_mut())?
        };
        Ok(ValueRef(Ref::map(self.inner.borrow(), |inner| {
            inner.dir.get(ordinal).value(local)
        })))
    }

    /// Mutable access to the element at `index`.
    pub fn get_mut(&self, index: usize) -> Result<ValueMut<'_, T>> {
        let (ordinal, local) = {
            let mut store = self.store.borrow_mut();
            let mut inner = self.inner.borrow_mut();
            inner.resolve(index, store.as_deref_mut())?
        };
        Ok(ValueMut(RefMut::map(self.inner.borrow_mut(), |inner| {
            inner.dir.get_mut(ordinal).value_mut(local)
        })))
    }

    /// Overwrites the element at `index`.
    pub fn set(&self, index: usize, value: T) -> Result<()> {
        let mut store = self.store.borrow_mut();
        let mut inner = self.inner.borrow_mut();
        let (ordinal, local) = inner.resolve(index, store.as_deref_mut())?;
        *inner.dir.get_mut(ordinal).value_mut(local) = value;
        Ok(())
    }

    /// Shared access to one auxiliary payload slot of the element at `index`.
    pub fn tail(&self, index: usize, slot: usize) -> Result<ValueRef<'_, X>> {
        let (ordinal, local) = {
            let mut store = self.store.borrow_mut();
            let mut inner = self.inner.borrow_mut();
            if slot >= inner.layout.tail_count {
                return Err(QuireError::InvalidArgument("tail slot out of range"));
            }
            inner.resolve(index, store.as_deref_mut())?
        };
        Ok(ValueRef(Ref::map(self.inner.borrow(), |inner| {
            inner.dir.get(ordinal).tail(&inner.layout, local, slot)
        })))
    }

    /// Overwrites one auxiliary payload slot of the element at `index`.
    pub fn set_tail(&self, index: usize, slot: usize, value: X) -> Result<()> {
        let mut store = self.store.borrow_mut();
        let mut inner = self.inner.borrow_mut();
        if slot >= inner.layout.tail_count {
            return Err(QuireError::InvalidArgument("tail slot out of range"));
        }
        let (ordinal, local) = inner.resolve(index, store.as_deref_mut())?;
        let layout = inner.layout.clone();
        *inner.dir.get_mut(ordinal).tail_mut(&layout, local, slot) = value;
        Ok(())
    }

    /// Copies `dst.len()` elements starting at `index` into `dst`, walking
    /// segments and faulting them in as needed.
    pub fn read_into(&self, index: usize, dst: &mut [T]) -> Result<()>
    where
        T: Clone,
    {
        if dst.is_empty() {
            return Ok(());
        }
        let mut store = self.store.borrow_mut();
        let mut inner = self.inner.borrow_mut();
        let end = index
            .checked_add(dst.len())
            .ok_or(QuireError::InvalidArgument("range overflow"))?;
        if end > inner.len {
            return Err(QuireError::OutOfRange {
                index: end - 1,
                len: inner.len,
            });
        }
        let mut at = index;
        let mut done = 0;
        while done < dst.len() {
            let (ordinal, local) = inner.resolve(at, store.as_deref_mut())?;
            let seg = inner.dir.get(ordinal);
            let take = (seg.used_count - local).min(dst.len() - done);
            let (values, _) = seg.used_slices(&inner.layout);
            dst[done..done + take].clone_from_slice(&values[local..local + take]);
            done += take;
            at += take;
        }
        Ok(())
    }

    /// Overwrites `src.len()` elements starting at `index` from `src`.
    pub fn write_from(&self, index: usize, src: &[T]) -> Result<()>
    where
        T: Clone,
    {
        if src.is_empty() {
            return Ok(());
        }
        let mut store = self.store.borrow_mut();
        let mut inner = self.inner.borrow_mut();
        let end = index
            .checked_add(src.len())
            .ok_or(QuireError::InvalidArgument("range overflow"))?;
        if end > inner.len {
            return Err(QuireError::OutOfRange {
                index: end - 1,
                len: inner.len,
            });
        }
        let layout = inner.layout.clone();
        let mut at = index;
        let mut done = 0;
        while done < src.len() {
            let (ordinal, local) = inner.resolve(at, store.as_deref_mut())?;
            let seg = inner.dir.get_mut(ordinal);
            let take = (seg.used_count - local).min(src.len() - done);
            let (values, _) = seg.used_slices_mut(&layout);
            values[local..local + take].clone_from_slice(&src[done..done + take]);
            done += take;
            at += take;
        }
        Ok(())
    }

    /// Binds a cursor at `index`; `index == len()` yields a past-end cursor.
    pub fn cursor(&self, index: usize) -> Result<Cursor<'_, T, X>> {
        Cursor::bind(self, index)
    }

    /// Saves every resident segment through the store without evicting.
    ///
    /// Together with [`SegArray::descriptor`] this captures enough state to
    /// resume paging against the same store later.
    pub fn flush(&self) -> Result<()> {
        let mut store = self.store.borrow_mut();
        let store = store.as_deref_mut().ok_or(QuireError::StoreRequired)?;
        let mut inner = self.inner.borrow_mut();
        inner.flush_all(store)
    }

    /// Captures the structural descriptor of the array (no element content).
    pub fn descriptor(&self) -> ArrayDescriptor {
        let inner = self.inner.borrow();
        ArrayDescriptor {
            segment_shift: inner.layout.shift,
            segment_capacity: inner.layout.capacity as u64,
            sequential_insert: inner.layout.sequential_insert,
            trivial_constructor: inner.layout.trivial_constructor,
            trivial_destructor: inner.layout.trivial_destructor,
            len: inner.len as u64,
            tail_count: inner.layout.tail_count as u64,
            max_resident_segments: inner.max_resident.map(|v| v as u64),
            segments: inner
                .dir
                .iter()
                .map(|seg| SegmentDescriptor {
                    used_offset: seg.used_offset as u64,
                    first_index: seg.first_index as u64,
                    used_count: seg.used_count as u64,
                    block: seg.block,
                })
                .collect(),
        }
    }

    /// Drops all content, keeping layout and configuration.
    ///
    /// Blocks already written to the store are orphaned; block ids restart
    /// from zero. Live cursors become stale.
    pub fn reset(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.dir = Directory::new();
        inner.len = 0;
        inner.resident = 0;
        inner.counter = 0;
        inner.next_block = 0;
        inner.victims.clear();
        inner.epoch += 1;
    }
}

type StoreRef<'a, T, X> = Option<&'a mut (dyn SegmentStore<T, X> + 'static)>;

impl<T: Default, X: Default> Inner<T, X> {
    fn touch(&mut self, ordinal: usize) {
        self.counter += 1;
        self.dir.get_mut(ordinal).stamp = self.counter;
    }

    /// Maps a logical index to `(ordinal, local)`, faulting the segment in.
    pub(crate) fn resolve(
        &mut self,
        index: usize,
        store: StoreRef<'_, T, X>,
    ) -> Result<(usize, usize)> {
        let ordinal = self
            .dir
            .locate(index, self.len)
            .ok_or(QuireError::OutOfRange {
                index,
                len: self.len,
            })?;
        self.make_resident(ordinal, store)?;
        Ok((ordinal, index - self.dir.get(ordinal).first_index))
    }

    pub(crate) fn make_resident(
        &mut self,
        ordinal: usize,
        store: StoreRef<'_, T, X>,
    ) -> Result<()> {
        if self.dir.get(ordinal).is_resident() {
            self.touch(ordinal);
            return Ok(());
        }
        self.fault_in(ordinal, store)
    }

    fn fault_in(&mut self, ordinal: usize, mut store: StoreRef<'_, T, X>) -> Result<()> {
        self.ensure_budget(store.as_deref_mut())?;
        let store = store.ok_or(QuireError::StoreRequired)?;
        let layout = self.layout.clone();
        let prior = self.dir.get(ordinal).block;
        let first_load = prior.is_none();
        let block = prior.unwrap_or(BlockId(self.next_block));
        let seg = self.dir.get_mut(ordinal);
        let first_index = seg.first_index;
        seg.map_buffer(&layout);
        let outcome = {
            let (values, tails) = seg.used_slices_mut(&layout);
            let mut req = LoadRequest {
                values,
                tails,
                tail_count: layout.tail_count,
                first_index,
                segment: ordinal,
                block,
                first_load,
            };
            store.load(&mut req)
        };
        if let Err(err) = outcome {
            // Leave the segment unmapped; the next access retries the load.
            self.dir.get_mut(ordinal).release_buffer();
            return Err(err);
        }
        let seg = self.dir.get_mut(ordinal);
        if seg.block.is_none() {
            seg.block = Some(block);
            self.next_block += 1;
        }
        self.resident += 1;
        self.stats.faults += 1;
        if first_load {
            self.stats.prime_loads += 1;
        }
        debug!(segment = ordinal, block = block.0, first_load, "quire.fault_in");
        self.touch(ordinal);
        Ok(())
    }

    fn ensure_budget(&mut self, mut store: StoreRef<'_, T, X>) -> Result<()> {
        let Some(cap) = self.max_resident else {
            return Ok(());
        };
        while self.resident >= cap {
            self.evict_one(cap, store.as_deref_mut())?;
        }
        Ok(())
    }

    pub(crate) fn evict_one(&mut self, cap: usize, store: StoreRef<'_, T, X>) -> Result<()> {
        let store = store.ok_or(QuireError::StoreRequired)?;
        let mut rebuilt = false;
        loop {
            if let Some(ordinal) = self.victims.pop_valid(&self.dir) {
                return self.evict_segment(ordinal, store);
            }
            if rebuilt {
                warn!("quire.evict.exhausted");
                return Err(QuireError::CapacityExhausted);
            }
            if let Err(err) = self.victims.rebuild(&self.dir, self.counter, cap) {
                warn!("quire.evict.exhausted");
                return Err(err);
            }
            self.stats.batch_rebuilds += 1;
            rebuilt = true;
        }
    }

    fn evict_segment(
        &mut self,
        ordinal: usize,
        store: &mut dyn SegmentStore<T, X>,
    ) -> Result<()> {
        let layout = self.layout.clone();
        let block = self
            .dir
            .get(ordinal)
            .block
            .unwrap_or(BlockId(self.next_block));
        {
            let seg = self.dir.get(ordinal);
            debug_assert!(seg.is_resident() && !seg.is_pinned());
            let (values, tails) = seg.used_slices(&layout);
            let req = SaveRequest {
                values,
                tails,
                tail_count: layout.tail_count,
                first_index: seg.first_index,
                segment: ordinal,
                block,
                destroy: true,
            };
            // A failed save aborts the evict; the segment stays resident.
            store.save(&req)?;
        }
        let seg = self.dir.get_mut(ordinal);
        if seg.block.is_none() {
            seg.block = Some(block);
            self.next_block += 1;
        }
        seg.release_buffer();
        self.resident -= 1;
        self.stats.evictions += 1;
        self.stats.saves += 1;
        debug!(segment = ordinal, block = block.0, "quire.evict");
        Ok(())
    }

    fn flush_all(&mut self, store: &mut dyn SegmentStore<T, X>) -> Result<()> {
        let layout = self.layout.clone();
        for ordinal in 0..self.dir.len() {
            if !self.dir.get(ordinal).is_resident() {
                continue;
            }
            let block = self
                .dir
                .get(ordinal)
                .block
                .unwrap_or(BlockId(self.next_block));
            {
                let seg = self.dir.get(ordinal);
                let (values, tails) = seg.used_slices(&layout);
                let req = SaveRequest {
                    values,
                    tails,
                    tail_count: layout.tail_count,
                    first_index: seg.first_index,
                    segment: ordinal,
                    block,
                    destroy: false,
                };
                store.save(&req)?;
            }
            let seg = self.dir.get_mut(ordinal);
            if seg.block.is_none() {
                seg.block = Some(block);
                self.next_block += 1;
            }
            self.stats.saves += 1;
        }
        Ok(())
    }

    /// Creates an empty resident segment spliced in at `at`.
    fn create_segment(&mut self, at: usize, store: StoreRef<'_, T, X>) -> Result<()> {
        self.ensure_budget(store)?;
        let first = if at > 0 {
            self.dir.get(at - 1).index_behind()
        } else {
            0
        };
        self.counter += 1;
        let seg = Segment::new_resident(&self.layout, first, self.counter);
        self.dir.insert(at, seg);
        self.resident += 1;
        // Segment ordinals shifted; any precomputed victim batch is stale.
        self.victims.clear();
        Ok(())
    }

    fn remove_segments(&mut self, range: Range<usize>) {
        if range.is_empty() {
            return;
        }
        let removed = self.dir.remove_range(range);
        for seg in &removed {
            if seg.is_resident() {
                self.resident -= 1;
            }
        }
        self.victims.clear();
    }

    /// Keeps `keep` pinned (and resident) while faulting `want` in, so the
    /// eviction triggered by the fault can never take the segment the caller
    /// is about to work on.
    fn resident_pair(
        &mut self,
        keep: usize,
        want: usize,
        mut store: StoreRef<'_, T, X>,
    ) -> Result<()> {
        self.make_resident(keep, store.as_deref_mut())?;
        let _pin = PinGuard::new(self.dir.get(keep).pin.clone());
        self.make_resident(want, store)
    }

    pub(crate) fn do_insert(
        &mut self,
        index: usize,
        n: usize,
        store: StoreRef<'_, T, X>,
    ) -> Result<()> {
        if n == 0 {
            return Ok(());
        }
        self.epoch += 1;
        match self.dir.locate(index, self.len) {
            None => self.append(index, n, store),
            Some(sid) => {
                let free = self.dir.get(sid).free_count(&self.layout);
                if free >= n {
                    self.local_insert(sid, index, n, store)
                } else if sid + 1 < self.dir.len()
                    && free + self.dir.get(sid + 1).free_count(&self.layout) >= n
                {
                    self.borrow_next(sid, index, n, store)
                } else if sid > 0 && free + self.dir.get(sid - 1).free_count(&self.layout) >= n {
                    self.borrow_prev(sid, index, n, store)
                } else {
                    self.split_insert(sid, index, n, store)
                }
            }
        }
    }

    /// Append path: extend the last segment's free space, then create new
    /// full-capacity segments until the request is satisfied. Inserting past
    /// the logical end constructs the intervening elements as well.
    fn append(&mut self, index: usize, n: usize, mut store: StoreRef<'_, T, X>) -> Result<()> {
        let implicit = index - self.len;
        let mut remaining = n + implicit;
        if !self.dir.is_empty() {
            let sid = self.dir.len() - 1;
            let take = remaining.min(self.dir.get(sid).free_count(&self.layout));
            if take > 0 {
                self.make_resident(sid, store.as_deref_mut())?;
                let layout = self.layout.clone();
                let seg = self.dir.get_mut(sid);
                let count = seg.used_count;
                seg.insert_balanced(&layout, count, take);
                remaining -= take;
                self.len += take;
            }
        }
        while remaining > 0 {
            let at = self.dir.len();
            self.create_segment(at, store.as_deref_mut())?;
            let take = remaining.min(self.layout.capacity);
            let layout = self.layout.clone();
            self.dir.get_mut(at).insert_balanced(&layout, 0, take);
            remaining -= take;
            self.len += take;
        }
        Ok(())
    }

    fn local_insert(
        &mut self,
        sid: usize,
        index: usize,
        n: usize,
        store: StoreRef<'_, T, X>,
    ) -> Result<()> {
        self.make_resident(sid, store)?;
        let layout = self.layout.clone();
        let seg = self.dir.get_mut(sid);
        let pos = index - seg.first_index;
        seg.insert_balanced(&layout, pos, n);
        self.len = self.dir.renumber_from(sid);
        Ok(())
    }

    /// Borrows free space from the following segment: occupied elements are
    /// redistributed so the insertion point ends up with contiguous room.
    fn borrow_next(
        &mut self,
        sid: usize,
        index: usize,
        n: usize,
        store: StoreRef<'_, T, X>,
    ) -> Result<()> {
        let n2 = self.dir.get(sid + 1).free_count(&self.layout).min(n);
        let n1 = n - n2;
        let tail = self.dir.get(sid).index_behind() - index;
        self.resident_pair(sid, sid + 1, store)?;
        let layout = self.layout.clone();
        let (s0, s1) = self.dir.pair_mut(sid, sid + 1);
        if tail <= n2 {
            s0.move_range(&layout, s1, true, tail);
            s1.insert_balanced(&layout, 0, n2 - tail);
            let count = s0.used_count;
            s0.insert_balanced(&layout, count, n1 + tail);
        } else {
            s0.move_range(&layout, s1, true, n2);
            let pos = s0.used_count - (tail - n2);
            s0.insert_balanced(&layout, pos, n1 + n2);
        }
        self.len = self.dir.renumber_from(sid);
        Ok(())
    }

    /// Borrows free space from the preceding segment.
    fn borrow_prev(
        &mut self,
        sid: usize,
        index: usize,
        n: usize,
        store: StoreRef<'_, T, X>,
    ) -> Result<()> {
        let n2 = self.dir.get(sid - 1).free_count(&self.layout).min(n);
        let n1 = n - n2;
        let head = index - self.dir.get(sid).first_index;
        self.resident_pair(sid, sid - 1, store)?;
        let layout = self.layout.clone();
        let (s, prev) = self.dir.pair_mut(sid, sid - 1);
        if head <= n2 {
            s.move_range(&layout, prev, false, head);
            let count = prev.used_count;
            prev.insert_balanced(&layout, count, n2 - head);
            s.insert_balanced(&layout, 0, n1 + head);
        } else {
            s.move_range(&layout, prev, false, n2);
            s.insert_balanced(&layout, head - n2, n1 + n2);
        }
        self.len = self.dir.renumber_from(sid - 1);
        Ok(())
    }

    /// Neither neighbor has room: splice new segments next to `sid` on the
    /// side with fewer elements to relocate, move the overflow, and lay the
    /// gap out across the chain.
    fn split_insert(
        &mut self,
        sid: usize,
        index: usize,
        n: usize,
        mut store: StoreRef<'_, T, X>,
    ) -> Result<()> {
        let cap = self.layout.capacity;
        let layout = self.layout.clone();
        let pos = index - self.dir.get(sid).first_index;
        if pos < cap / 2 {
            // Relocate the shorter prefix into segments spliced before sid.
            let nseg = (n + pos + cap - 1) / cap;
            for i in 0..nseg {
                self.create_segment(sid + i, store.as_deref_mut())?;
            }
            let target = sid + nseg;
            if pos > 0 {
                self.resident_pair(target, sid, store.as_deref_mut())?;
                let (new0, tgt) = self.dir.pair_mut(sid, target);
                tgt.move_range(&layout, new0, false, pos);
            }
            let mut rem = n;
            for r in sid..target {
                if rem == 0 {
                    break;
                }
                self.make_resident(r, store.as_deref_mut())?;
                let seg = self.dir.get_mut(r);
                let take = rem.min(seg.free_count(&layout));
                let count = seg.used_count;
                seg.insert_balanced(&layout, count, take);
                rem -= take;
            }
            debug_assert_eq!(rem, 0);
            if let Some(first_empty) =
                (sid..target).find(|&r| self.dir.get(r).used_count == 0)
            {
                self.remove_segments(first_empty..target);
            }
            self.len = self.dir.renumber_from(sid);
        } else {
            // Relocate the shorter suffix into segments spliced after sid.
            let tail = self.dir.get(sid).index_behind() - index;
            let nseg = (n + tail + cap - 1) / cap;
            for i in 0..nseg {
                self.create_segment(sid + 1 + i, store.as_deref_mut())?;
            }
            let last_new = sid + nseg;
            if tail > 0 {
                self.resident_pair(sid, last_new, store.as_deref_mut())?;
                let (tgt, newl) = self.dir.pair_mut(sid, last_new);
                tgt.move_range(&layout, newl, true, tail);
            }
            let mut rem = n;
            {
                self.make_resident(sid, store.as_deref_mut())?;
                let seg = self.dir.get_mut(sid);
                let take = rem.min(seg.free_count(&layout));
                let count = seg.used_count;
                seg.insert_balanced(&layout, count, take);
                rem -= take;
            }
            for r in sid + 1..=last_new {
                if rem == 0 {
                    break;
                }
                self.make_resident(r, store.as_deref_mut())?;
                let seg = self.dir.get_mut(r);
                let take = rem.min(seg.free_count(&layout));
                seg.insert_balanced(&layout, 0, take);
                rem -= take;
            }
            debug_assert_eq!(rem, 0);
            if let Some(first_empty) =
                (sid + 1..=last_new).find(|&r| self.dir.get(r).used_count == 0)
            {
                let mut end = first_empty;
                while end <= last_new && self.dir.get(end).used_count == 0 {
                    end += 1;
                }
                self.remove_segments(first_empty..end);
            }
            self.len = self.dir.renumber_from(sid);
        }
        Ok(())
    }

    pub(crate) fn do_remove(
        &mut self,
        index: usize,
        n: usize,
        mut store: StoreRef<'_, T, X>,
    ) -> Result<()> {
        if n == 0 {
            return Ok(());
        }
        let end = index
            .checked_add(n)
            .ok_or(QuireError::InvalidArgument("range overflow"))?;
        if end > self.len {
            return Err(QuireError::OutOfRange {
                index: end - 1,
                len: self.len,
            });
        }
        self.epoch += 1;
        let layout = self.layout.clone();
        let sid = self
            .dir
            .locate(index, self.len)
            .ok_or(QuireError::OutOfRange {
                index,
                len: self.len,
            })?;
        self.make_resident(sid, store.as_deref_mut())?;
        let first = self.dir.get(sid).first_index;
        let local = index - first;
        let within = self.dir.get(sid).used_count - local;
        if n > within {
            self.dir.get_mut(sid).delete_at(&layout, local, within);
            let mut rem = n - within;
            let mut consumed_end = sid + 1;
            let mut partial = None;
            let mut i = sid + 1;
            while rem > 0 {
                let count = self.dir.get(i).used_count;
                if rem < count {
                    partial = Some((i, rem));
                    rem = 0;
                } else {
                    rem -= count;
                    consumed_end = i + 1;
                    i += 1;
                }
            }
            if let Some((ordinal, del)) = partial {
                self.make_resident(ordinal, store.as_deref_mut())?;
                self.dir.get_mut(ordinal).delete_at(&layout, 0, del);
            }
            // Wholly consumed segments are dropped without a save: their
            // content is deleted, not evicted.
            self.remove_segments(sid + 1..consumed_end);
            if self.dir.get(sid).used_count == 0 {
                self.remove_segments(sid..sid + 1);
            }
        } else {
            self.dir.get_mut(sid).delete_at(&layout, local, n);
            if self.dir.get(sid).used_count == 0 {
                self.remove_segments(sid..sid + 1);
            }
        }
        if self.dir.is_empty() {
            self.len = 0;
            return Ok(());
        }
        if sid == 0 {
            // Trimming the head re-anchors the first segment at index zero.
            self.dir.get_mut(0).first_index = 0;
            self.len = self.dir.renumber_from(0);
        } else {
            self.len = self.dir.renumber_from(sid - 1);
        }
        Ok(())
    }
}
