//! Segmented, pageable array.
//!
//! A [`SegArray`] behaves like a single logical array, but stores its
//! elements in fixed-capacity segments that can be independently allocated,
//! rebalanced, split, merged, and — the distinguishing part — paged out to a
//! caller-supplied backing store and faulted back in on demand. A bounded
//! number of segments stays resident; least-recently-used unpinned segments
//! are evicted under pressure, and live [`Cursor`]s pin the segment they
//! point into so eviction never invalidates them.
//!
//! ```
//! use quire::{ArrayOptions, MemoryStore, SegArray};
//!
//! let array: SegArray<u64> = SegArray::with_store(
//!     ArrayOptions::new().segment_bytes(64).memory_budget(128),
//!     MemoryStore::new(),
//! )
//! .unwrap();
//! for i in 0..100 {
//!     array.push(i).unwrap();
//! }
//! assert_eq!(*array.get(42).unwrap(), 42);
//! ```

#![warn(missing_docs)]

pub mod array;
pub mod cursor;
pub mod error;
pub mod options;
pub mod persist;
pub mod store;

mod directory;
mod evict;
mod segment;

pub use array::{ArrayStats, SegArray, SegmentInfo, ValueMut, ValueRef};
pub use cursor::Cursor;
pub use error::{QuireError, Result};
pub use options::ArrayOptions;
pub use persist::{
    ArrayDescriptor, BlockId, LoadRequest, SaveRequest, SegmentDescriptor, SegmentStore,
};
pub use store::{FileStore, MemoryStore};
