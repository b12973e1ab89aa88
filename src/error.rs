//! Error type shared across the crate.

use std::io;
use thiserror::Error;

/// Convenient result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, QuireError>;

/// Errors surfaced by segmented array operations.
///
/// Contract violations (out-of-range indexes, stale cursors, layout changes
/// after the first insert) are reported as errors rather than panics; paging
/// failures from the backing store propagate verbatim from the operation
/// that triggered them.
#[derive(Debug, Error)]
pub enum QuireError {
    /// I/O error from a backing store implementation.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Encoding a segment for the backing store failed.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// A persisted block or descriptor failed validation.
    #[error("corruption detected: {0}")]
    Corruption(String),
    /// An index was outside the logical bounds of the array.
    #[error("index {index} out of range (len {len})")]
    OutOfRange {
        /// The offending index.
        index: usize,
        /// Logical length at the time of the call.
        len: usize,
    },
    /// A caller-supplied argument violated the operation's contract.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// Segment layout can no longer be changed.
    #[error("segment layout is frozen once the array holds elements")]
    LayoutFrozen,
    /// A cursor was used after a structural edit it did not participate in.
    #[error("cursor invalidated by a structural edit")]
    StaleCursor,
    /// Eviction could not make progress.
    #[error("cannot free enough segments: every eviction candidate is pinned")]
    CapacityExhausted,
    /// Paging was required but no store has been configured.
    #[error("no segment store configured")]
    StoreRequired,
}
