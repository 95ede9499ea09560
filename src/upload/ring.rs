//! Circular Upload Buffer
//!
//! Pure byte bookkeeping for the streaming ring. Holds no GPU resources.
//!
//! ```text
//!  not wrapped:   [ free | start ▓▓▓▓▓▓▓ end | free ]
//!  wrapped:       [ ▓▓▓ tail | free | start ▓▓▓▓▓▓▓ ]
//! ```
//!
//! An allocation that does not fit between the logical end and the physical
//! end of the buffer restarts at offset 0, provided the region before `start`
//! is large enough. The skipped tail is charged to that allocation as
//! padding and returned together with it.
//!
//! Allocations must be released strictly in the order they were made.

/// A contiguous byte range handed out by [`CircularUploadBuffer`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct RingAllocation {
    pub offset: u64,
    pub size: u64,
    /// Bytes skipped at the physical end to make this allocation contiguous.
    pub padding: u64,
}

impl RingAllocation {
    #[inline]
    #[must_use]
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

#[derive(Debug)]
pub struct CircularUploadBuffer {
    capacity: u64,
    start: u64,
    used: u64,
}

impl CircularUploadBuffer {
    #[must_use]
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            start: 0,
            used: 0,
        }
    }

    #[inline]
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Offset of the oldest live allocation (or its padding).
    #[inline]
    #[must_use]
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Bytes reserved by live allocations, padding included.
    #[inline]
    #[must_use]
    pub fn used(&self) -> u64 {
        self.used
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// Reserves `size` contiguous bytes, or returns `None` if no run that
    /// large is free right now.
    pub fn try_allocate(&mut self, size: u64) -> Option<RingAllocation> {
        if size > self.capacity - self.used {
            return None;
        }
        let end = self.start + self.used;

        let allocation = if end < self.capacity {
            let tail_room = self.capacity - end;
            if size <= tail_room {
                RingAllocation {
                    offset: end,
                    size,
                    padding: 0,
                }
            } else if size <= self.start {
                RingAllocation {
                    offset: 0,
                    size,
                    padding: tail_room,
                }
            } else {
                return None;
            }
        } else {
            let tail = end - self.capacity;
            if size > self.start - tail {
                return None;
            }
            RingAllocation {
                offset: tail,
                size,
                padding: 0,
            }
        };

        self.used += allocation.padding + allocation.size;
        debug_assert!(self.used <= self.capacity);
        Some(allocation)
    }

    /// Returns the oldest allocation to the free region.
    pub fn release(&mut self, allocation: &RingAllocation) {
        debug_assert!(
            allocation.padding + allocation.size <= self.used,
            "ring release of {allocation:?} exceeds used bytes {}",
            self.used
        );
        debug_assert!(
            (allocation.padding == 0 && allocation.offset == self.start)
                || (allocation.padding > 0 && self.start == self.capacity - allocation.padding),
            "ring allocations must be released in order"
        );

        self.used -= allocation.padding + allocation.size;
        self.start = if self.used == 0 {
            0
        } else {
            allocation.end() % self.capacity
        };
    }

    /// Forgets every allocation.
    pub fn reset(&mut self) {
        self.start = 0;
        self.used = 0;
    }
}
