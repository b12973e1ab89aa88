//! Configuration supplied when constructing a [`crate::SegArray`].

/// Default raw segment size exponent (4 KiB segments).
pub const DEFAULT_SEGMENT_SHIFT: u32 = 12;

/// Default raw segment size in bytes.
pub const DEFAULT_SEGMENT_BYTES: usize = 1 << DEFAULT_SEGMENT_SHIFT;

/// Configuration options for a segmented array.
///
/// The requested segment byte size is rounded up to the next power of two;
/// element capacity per segment is derived from it and the element stride.
/// Everything here is fixed for the life of the array once the first element
/// has been inserted.
#[derive(Clone, Debug)]
pub struct ArrayOptions {
    /// Requested raw segment size in bytes (rounded up to a power of two).
    pub segment_bytes: usize,
    /// Bias new segments toward trailing free space for append-heavy use.
    pub sequential_insert: bool,
    /// Number of auxiliary payload slots stored per element.
    pub tail_count: usize,
    /// Skip default-filling newly inserted slots; the caller overwrites them.
    pub trivial_constructor: bool,
    /// Skip eagerly dropping deleted slots; stale values linger in free space.
    pub trivial_destructor: bool,
    /// Maximum number of resident segments (`None` = unbounded, no paging).
    pub max_resident_segments: Option<usize>,
}

impl Default for ArrayOptions {
    fn default() -> Self {
        Self {
            segment_bytes: DEFAULT_SEGMENT_BYTES,
            sequential_insert: true,
            tail_count: 0,
            trivial_constructor: false,
            trivial_destructor: false,
            max_resident_segments: None,
        }
    }
}

impl ArrayOptions {
    /// Creates options with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the requested raw segment size in bytes.
    pub fn segment_bytes(mut self, bytes: usize) -> Self {
        self.segment_bytes = bytes;
        self
    }

    /// Enables or disables the sequential-insert hint.
    pub fn sequential_insert(mut self, enabled: bool) -> Self {
        self.sequential_insert = enabled;
        self
    }

    /// Sets the number of auxiliary payload slots per element.
    pub fn tail_count(mut self, count: usize) -> Self {
        self.tail_count = count;
        self
    }

    /// Marks element construction as trivial.
    pub fn trivial_constructor(mut self, trivial: bool) -> Self {
        self.trivial_constructor = trivial;
        self
    }

    /// Marks element destruction as trivial.
    pub fn trivial_destructor(mut self, trivial: bool) -> Self {
        self.trivial_destructor = trivial;
        self
    }

    /// Caps the number of segments kept resident at once.
    pub fn max_resident_segments(mut self, cap: Option<usize>) -> Self {
        self.max_resident_segments = cap;
        self
    }

    /// Derives the resident-segment cap from a memory budget in bytes.
    ///
    /// A budget of zero disables paging entirely.
    pub fn memory_budget(mut self, bytes: usize) -> Self {
        let shift = segment_shift(self.segment_bytes);
        self.max_resident_segments = if bytes == 0 {
            None
        } else {
            Some(std::cmp::max(1, bytes >> shift))
        };
        self
    }
}

/// Rounds a requested segment byte size up to a power-of-two exponent.
pub(crate) fn segment_shift(bytes: usize) -> u32 {
    if bytes == 0 {
        return DEFAULT_SEGMENT_SHIFT;
    }
    bytes.next_power_of_two().trailing_zeros()
}
