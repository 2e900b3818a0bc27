use std::ops::Range;

/// Index arithmetic for a fixed-capacity circular buffer.
///
/// Positions are always in `[0, capacity)`. Absolute counters (samples ever
/// written) are mapped onto the ring with [`RingIndex::wrap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingIndex {
    capacity: usize,
}

impl RingIndex {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be > 0");
        Self { capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Ring position of an absolute counter.
    pub fn wrap(&self, absolute: u64) -> usize {
        (absolute % self.capacity as u64) as usize
    }

    /// Move `position` forward by `count`, wrapping at the end.
    pub fn advance(&self, position: usize, count: usize) -> usize {
        debug_assert!(position < self.capacity);
        (position + count % self.capacity) % self.capacity
    }

    /// Split a run of `len` slots starting at `position` into the part before the
    /// wrap point and the part continuing at the start of the ring.
    ///
    /// The second range is empty when the run does not wrap.
    pub fn span_across_wrap(&self, position: usize, len: usize) -> (Range<usize>, Range<usize>) {
        assert!(position < self.capacity, "ring position {position} out of range");
        assert!(len <= self.capacity, "span of {len} exceeds ring capacity");

        let tail = len.min(self.capacity - position);
        (position..position + tail, 0..len - tail)
    }
}
