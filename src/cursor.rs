//! Pinning cursor over a segmented array.
//!
//! A bound cursor holds a pin on the segment containing its element, which
//! excludes that segment from eviction and keeps its contents in place for
//! as long as the cursor stays bound. Moving across a segment boundary
//! re-resolves through the directory (possibly faulting a segment in) and
//! re-pins; dropping or rebinding releases the previous pin exactly once.

use crate::array::{SegArray, ValueMut, ValueRef};
use crate::error::{QuireError, Result};
use crate::segment::PinGuard;

enum State {
    /// Pointing at an element; the pin keeps its segment resident.
    Bound {
        pin: PinGuard,
        ordinal: usize,
        index: usize,
        epoch: u64,
    },
    /// One past the last element; no pin is held.
    PastEnd,
}

impl Clone for State {
    fn clone(&self) -> Self {
        match self {
            State::Bound {
                pin,
                ordinal,
                index,
                epoch,
            } => State::Bound {
                pin: pin.clone(),
                ordinal: *ordinal,
                index: *index,
                epoch: *epoch,
            },
            State::PastEnd => State::PastEnd,
        }
    }
}

/// Cursor into a [`SegArray`], either bound to an element or past the end.
///
/// Structural edits made directly on the array invalidate existing cursors;
/// using one afterwards reports [`QuireError::StaleCursor`]. Edits made
/// *through* a cursor ([`Cursor::insert`], [`Cursor::remove`]) leave it
/// repositioned consistently.
pub struct Cursor<'a, T, X = ()> {
    array: &'a SegArray<T, X>,
    state: State,
}

impl<'a, T, X> Clone for Cursor<'a, T, X> {
    fn clone(&self) -> Self {
        Self {
            array: self.array,
            state: self.state.clone(),
        }
    }
}

impl<'a, T: Default, X: Default> Cursor<'a, T, X> {
    pub(crate) fn bind(array: &'a SegArray<T, X>, index: usize) -> Result<Self> {
        let state = Self::bind_state(array, index)?;
        Ok(Self { array, state })
    }

    fn bind_state(array: &SegArray<T, X>, index: usize) -> Result<State> {
        let mut store = array.store.borrow_mut();
        let mut inner = array.inner.borrow_mut();
        if index > inner.len {
            return Err(QuireError::OutOfRange {
                index,
                len: inner.len,
            });
        }
        if index == inner.len {
            return Ok(State::PastEnd);
        }
        let (ordinal, _) = inner.resolve(index, store.as_deref_mut())?;
        let pin = PinGuard::new(inner.dir.get(ordinal).pin.clone());
        Ok(State::Bound {
            pin,
            ordinal,
            index,
            epoch: inner.epoch,
        })
    }

    fn check_epoch(&self) -> Result<()> {
        if let State::Bound { epoch, .. } = &self.state {
            if *epoch != self.array.inner.borrow().epoch {
                return Err(QuireError::StaleCursor);
            }
        }
        Ok(())
    }

    /// Global index of the element the cursor points at; the array length
    /// when past the end.
    pub fn index(&self) -> usize {
        match &self.state {
            State::Bound { index, .. } => *index,
            State::PastEnd => self.array.len(),
        }
    }

    /// True while the cursor points at an element.
    pub fn is_bound(&self) -> bool {
        matches!(self.state, State::Bound { .. })
    }

    /// True when the cursor sits one past the last element.
    pub fn is_past_end(&self) -> bool {
        matches!(self.state, State::PastEnd)
    }

    /// Moves the cursor by `delta` elements.
    ///
    /// Landing exactly on the array length unbinds the cursor (past-end);
    /// stepping backwards from past-end lands on the last element. Movement
    /// within the pinned segment is resolved locally; anything else goes
    /// through the directory and may fault a segment in.
    pub fn seek(&mut self, delta: i64) -> Result<()> {
        self.check_epoch()?;
        let base = self.index() as i64;
        let target = base + delta;
        if target < 0 {
            return Err(QuireError::InvalidArgument("cursor seek before the start"));
        }
        let target = target as usize;
        let len = self.array.len();
        if target > len {
            return Err(QuireError::OutOfRange { index: target, len });
        }
        if let State::Bound { ordinal, index, .. } = &mut self.state {
            let inner = self.array.inner.borrow();
            if inner.dir.get(*ordinal).contains(target) {
                *index = target;
                return Ok(());
            }
        }
        self.rebind(target)
    }

    /// Advances to the next element (or past the end).
    pub fn next(&mut self) -> Result<()> {
        self.seek(1)
    }

    /// Steps back one element; from past-end this lands on the last element.
    pub fn prev(&mut self) -> Result<()> {
        self.seek(-1)
    }

    fn rebind(&mut self, index: usize) -> Result<()> {
        // Release the current pin first so the segment we leave is a normal
        // eviction candidate while the target faults in.
        self.state = State::PastEnd;
        self.state = Self::bind_state(self.array, index)?;
        Ok(())
    }

    /// Shared reference to the current element.
    pub fn value(&self) -> Result<ValueRef<'a, T>> {
        self.check_epoch()?;
        match &self.state {
            State::PastEnd => Err(QuireError::OutOfRange {
                index: self.array.len(),
                len: self.array.len(),
            }),
            State::Bound { ordinal, index, .. } => {
                Ok(self.array.pinned_value(*ordinal, *index))
            }
        }
    }

    /// Mutable reference to the current element.
    pub fn value_mut(&self) -> Result<ValueMut<'a, T>> {
        self.check_epoch()?;
        match &self.state {
            State::PastEnd => Err(QuireError::OutOfRange {
                index: self.array.len(),
                len: self.array.len(),
            }),
            State::Bound { ordinal, index, .. } => {
                Ok(self.array.pinned_value_mut(*ordinal, *index))
            }
        }
    }

    /// Clones the current element out.
    pub fn get(&self) -> Result<T>
    where
        T: Clone,
    {
        Ok(self.value()?.clone())
    }

    /// Overwrites the current element.
    pub fn set(&self, value: T) -> Result<()> {
        *self.value_mut()? = value;
        Ok(())
    }

    /// Shared reference to one auxiliary payload slot of the current element.
    pub fn tail(&self, slot: usize) -> Result<ValueRef<'a, X>> {
        self.check_epoch()?;
        match &self.state {
            State::PastEnd => Err(QuireError::OutOfRange {
                index: self.array.len(),
                len: self.array.len(),
            }),
            State::Bound { ordinal, index, .. } => {
                self.array.pinned_tail(*ordinal, *index, slot)
            }
        }
    }

    /// Overwrites one auxiliary payload slot of the current element.
    pub fn set_tail(&self, slot: usize, value: X) -> Result<()> {
        self.check_epoch()?;
        match &self.state {
            State::PastEnd => Err(QuireError::OutOfRange {
                index: self.array.len(),
                len: self.array.len(),
            }),
            State::Bound { ordinal, index, .. } => {
                self.array.pinned_set_tail(*ordinal, *index, slot, value)
            }
        }
    }

    /// Inserts `n` default elements at the cursor's index and repositions the
    /// cursor on the first of them. Past-end this appends.
    pub fn insert(&mut self, n: usize) -> Result<()> {
        self.check_epoch()?;
        let at = self.index();
        self.state = State::PastEnd;
        self.array.insert(at, n)?;
        self.rebind(at)
    }

    /// Removes `n` elements starting at the cursor's index and repositions
    /// the cursor on the element now at that index (or past the end).
    pub fn remove(&mut self, n: usize) -> Result<()> {
        self.check_epoch()?;
        if self.is_past_end() {
            return Err(QuireError::InvalidArgument(
                "cursor points past the last element",
            ));
        }
        let at = self.index();
        self.state = State::PastEnd;
        self.array.remove(at, n)?;
        self.rebind(at)
    }
}

impl<T: Default, X: Default> SegArray<T, X> {
    fn pinned_value(&self, ordinal: usize, index: usize) -> ValueRef<'_, T> {
        ValueRef::new(std::cell::Ref::map(self.inner.borrow(), |inner| {
            let seg = inner.dir.get(ordinal);
            seg.value(index - seg.first_index)
        }))
    }

    fn pinned_value_mut(&self, ordinal: usize, index: usize) -> ValueMut<'_, T> {
        ValueMut::new(std::cell::RefMut::map(self.inner.borrow_mut(), |inner| {
            let seg = inner.dir.get_mut(ordinal);
            let local = index - seg.first_index;
            seg.value_mut(local)
        }))
    }

    fn pinned_tail(&self, ordinal: usize, index: usize, slot: usize) -> Result<ValueRef<'_, X>> {
        if slot >= self.inner.borrow().layout.tail_count {
            return Err(QuireError::InvalidArgument("tail slot out of range"));
        }
        Ok(ValueRef::new(std::cell::Ref::map(
            self.inner.borrow(),
            |inner| {
                let seg = inner.dir.get(ordinal);
                seg.tail(&inner.layout, index - seg.first_index, slot)
            },
        )))
    }

    fn pinned_set_tail(&self, ordinal: usize, index: usize, slot: usize, value: X) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        if slot >= inner.layout.tail_count {
            return Err(QuireError::InvalidArgument("tail slot out of range"));
        }
        let layout = inner.layout.clone();
        let seg = inner.dir.get_mut(ordinal);
        let local = index - seg.first_index;
        *seg.tail_mut(&layout, local, slot) = value;
        Ok(())
    }
}
