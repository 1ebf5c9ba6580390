//! Executable code space.
//!
//! Hands out position-fixed, non-overlapping address ranges for compiled
//! units and PIC bodies. Ranges never move once handed out; a range is
//! only reused after it has been explicitly freed, which the code table
//! and PIC heap do only once no active frame can return into it.

use kestrel_core::{DispatchError, DispatchResult};
use std::collections::BTreeMap;

/// Default base address of the code space.
pub const CODE_SPACE_BASE: usize = 0x1000_0000;

/// Allocation granularity in bytes.
pub const CODE_ALIGNMENT: usize = 16;

/// Bump allocator with a first-fit free list.
#[derive(Debug)]
pub struct CodeSpace {
    /// Lowest address.
    base: usize,
    /// Total capacity in bytes.
    capacity: usize,
    /// Next never-used address.
    top: usize,
    /// Freed ranges keyed by start address.
    free: BTreeMap<usize, usize>,
    /// Bytes currently handed out.
    used: usize,
    /// High-water mark of `used`.
    peak: usize,
    /// Allocations refused for lack of space.
    failures: u64,
}

impl CodeSpace {
    /// Create a code space of `capacity` bytes at the default base.
    pub fn new(capacity: usize) -> Self {
        Self::with_base(CODE_SPACE_BASE, capacity)
    }

    /// Create a code space at a specific base address.
    pub fn with_base(base: usize, capacity: usize) -> Self {
        Self {
            base,
            capacity,
            top: base,
            free: BTreeMap::new(),
            used: 0,
            peak: 0,
            failures: 0,
        }
    }

    #[inline]
    fn align(size: usize) -> usize {
        size.max(1).div_ceil(CODE_ALIGNMENT) * CODE_ALIGNMENT
    }

    /// Allocate `size` bytes, returning the start address.
    pub fn allocate(&mut self, size: usize) -> DispatchResult<usize> {
        let size = Self::align(size);

        let fit = self
            .free
            .iter()
            .find(|&(_, &len)| len >= size)
            .map(|(&start, &len)| (start, len));
        if let Some((start, len)) = fit {
            self.free.remove(&start);
            if len > size {
                self.free.insert(start + size, len - size);
            }
            self.note_used(size);
            return Ok(start);
        }

        if self.top + size > self.base + self.capacity {
            self.failures += 1;
            return Err(DispatchError::CodeSpaceExhausted {
                requested: size,
                available: self.available(),
            });
        }
        let start = self.top;
        self.top += size;
        self.note_used(size);
        Ok(start)
    }

    fn note_used(&mut self, size: usize) {
        self.used += size;
        self.peak = self.peak.max(self.used);
    }

    /// Return a range previously handed out by `allocate`.
    pub fn free(&mut self, start: usize, size: usize) {
        let size = Self::align(size);
        debug_assert!(start >= self.base && start + size <= self.top);
        debug_assert!(!self.free.contains_key(&start), "double free at {start:#x}");
        self.used = self.used.saturating_sub(size);

        let mut start = start;
        let mut size = size;
        // Coalesce with the following range.
        if let Some(next_len) = self.free.remove(&(start + size)) {
            size += next_len;
        }
        // Coalesce with the preceding range.
        if let Some((&prev, &prev_len)) = self.free.range(..start).next_back() {
            if prev + prev_len == start {
                self.free.remove(&prev);
                start = prev;
                size += prev_len;
            }
        }
        // Give the tail back to the bump region.
        if start + size == self.top {
            self.top = start;
        } else {
            self.free.insert(start, size);
        }
    }

    /// Bytes currently handed out.
    #[inline]
    pub fn used(&self) -> usize {
        self.used
    }

    /// Bytes still available.
    #[inline]
    pub fn available(&self) -> usize {
        self.capacity - self.used
    }

    /// Total capacity.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// High-water mark.
    #[inline]
    pub fn peak(&self) -> usize {
        self.peak
    }

    /// Number of refused allocations.
    #[inline]
    pub fn failures(&self) -> u64 {
        self.failures
    }

    /// Check if an address lies inside the space.
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.base + self.capacity
    }
}
