//! Virtual address range allocator.
//!
//! Each address space owns two of these: one for the supervisor half and
//! one for the user half. The allocator keeps a sorted list of disjoint
//! free intervals; allocation is first-fit with an optional address hint,
//! release merges neighbours back together.

use alloc::vec::Vec;

use lazy_static::lazy_static;
use spin::Mutex;

use super::{VirtualAddress, VirtualRange, LARGE_PAGE_SIZE, PAGE_SIZE};

/// Bottom of the supervisor allocation window, above the direct map.
const SUPERVISOR_FRONT: u64 = 0xffff_9000_0000_0000;

/// Top of the supervisor allocation window.
const SUPERVISOR_BACK: u64 = 0xffff_a000_0000_0000;

lazy_static! {
    /// The kernel-half allocator, shared by every process: the high
    /// half of each address space aliases the same mappings.
    static ref SUPERVISOR_VA: Mutex<RangeAllocator> = Mutex::new(RangeAllocator::new(
        VirtualRange::from_raw(SUPERVISOR_FRONT, SUPERVISOR_BACK),
    ));
}

/// The supervisor virtual address allocator.
pub fn supervisor_va() -> &'static Mutex<RangeAllocator> {
    &SUPERVISOR_VA
}

/// First-fit allocator over a virtual range.
pub struct RangeAllocator {
    /// Disjoint free intervals, ascending. Invariant checked by
    /// [`check_invariants`](Self::check_invariants) in tests.
    free: Vec<VirtualRange>,
    /// The full range handed to the constructor.
    span: VirtualRange,
}

impl RangeAllocator {
    /// Manage `range`, initially fully free.
    pub fn new(range: VirtualRange) -> RangeAllocator {
        debug_assert!(range.front.is_page_aligned() && range.back.is_page_aligned());

        let mut free = Vec::new();
        if !range.is_empty() {
            free.push(range);
        }

        RangeAllocator { free, span: range }
    }

    /// Allocate `count` 4 KiB pages.
    pub fn alloc4k(&mut self, count: usize, hint: Option<VirtualAddress>) -> VirtualRange {
        self.alloc_aligned(count as u64 * PAGE_SIZE as u64, PAGE_SIZE as u64, hint)
    }

    /// Allocate `count` 2 MiB pages, 2 MiB aligned.
    pub fn alloc2m(&mut self, count: usize, hint: Option<VirtualAddress>) -> VirtualRange {
        self.alloc_aligned(
            count as u64 * LARGE_PAGE_SIZE as u64,
            LARGE_PAGE_SIZE as u64,
            hint,
        )
    }

    fn alloc_aligned(
        &mut self,
        size: u64,
        align: u64,
        hint: Option<VirtualAddress>,
    ) -> VirtualRange {
        if size == 0 {
            return VirtualRange::INVALID;
        }

        // Prefer the hint when it is aligned and its span is free.
        if let Some(hint) = hint {
            if hint.as_u64() % align == 0 {
                let wanted = VirtualRange::from_raw(hint.as_u64(), hint.as_u64() + size);
                if self.take_exact(wanted) {
                    return wanted;
                }
            }
        }

        for index in 0..self.free.len() {
            let interval = self.free[index];
            let front = interval.front.as_u64().next_multiple_of(align);
            if front + size > interval.back.as_u64() {
                continue;
            }

            let taken = VirtualRange::from_raw(front, front + size);
            self.carve(index, taken);
            return taken;
        }

        VirtualRange::INVALID
    }

    /// Remove `wanted` from the free list if some interval fully covers it.
    fn take_exact(&mut self, wanted: VirtualRange) -> bool {
        for index in 0..self.free.len() {
            let interval = self.free[index];
            if interval.front.as_u64() <= wanted.front.as_u64()
                && wanted.back.as_u64() <= interval.back.as_u64()
            {
                self.carve(index, wanted);
                return true;
            }
        }
        false
    }

    /// Split `taken` out of the interval at `index`.
    fn carve(&mut self, index: usize, taken: VirtualRange) {
        let interval = self.free[index];
        let left = VirtualRange::new(interval.front, taken.front);
        let right = VirtualRange::new(taken.back, interval.back);

        match (left.is_empty(), right.is_empty()) {
            (true, true) => {
                self.free.remove(index);
            }
            (false, true) => self.free[index] = left,
            (true, false) => self.free[index] = right,
            (false, false) => {
                self.free[index] = left;
                self.free.insert(index + 1, right);
            }
        }
    }

    /// Return a range to the free list, merging adjacent intervals.
    pub fn release(&mut self, range: VirtualRange) {
        if range.is_empty() {
            return;
        }

        let position = self
            .free
            .partition_point(|interval| interval.front.as_u64() < range.front.as_u64());
        self.free.insert(position, range);

        // Merge with the right neighbour, then the left.
        if position + 1 < self.free.len()
            && self.free[position].back.as_u64() >= self.free[position + 1].front.as_u64()
        {
            self.free[position].back = self.free[position].back.max(self.free[position + 1].back);
            self.free.remove(position + 1);
        }
        if position > 0
            && self.free[position - 1].back.as_u64() >= self.free[position].front.as_u64()
        {
            self.free[position - 1].back =
                self.free[position - 1].back.max(self.free[position].back);
            self.free.remove(position);
        }
    }

    /// Withdraw a range from the free list regardless of interval
    /// boundaries; overlapping intervals are split or trimmed.
    pub fn mark_used(&mut self, range: VirtualRange) {
        if range.is_empty() {
            return;
        }

        let mut index = 0;
        while index < self.free.len() {
            let interval = self.free[index];

            if interval.back.as_u64() <= range.front.as_u64()
                || range.back.as_u64() <= interval.front.as_u64()
            {
                index += 1;
                continue;
            }

            let overlap = VirtualRange::from_raw(
                interval.front.as_u64().max(range.front.as_u64()),
                interval.back.as_u64().min(range.back.as_u64()),
            );
            self.carve(index, overlap);
            // carve may have shrunk or split the interval; rescan from the
            // same index.
        }
    }

    /// Total free bytes.
    pub fn free_bytes(&self) -> u64 {
        self.free.iter().map(VirtualRange::size).sum()
    }

    /// The full managed span.
    pub fn span(&self) -> VirtualRange {
        self.span
    }

    /// Assert the free list is sorted, disjoint, and inside the span.
    #[cfg(any(test, debug_assertions))]
    pub fn check_invariants(&self) {
        for interval in &self.free {
            assert!(!interval.is_empty());
            assert!(self.span.front.as_u64() <= interval.front.as_u64());
            assert!(interval.back.as_u64() <= self.span.back.as_u64());
        }
        for pair in self.free.windows(2) {
            assert!(pair[0].back.as_u64() < pair[1].front.as_u64());
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    const MB: u64 = 0x10_0000;

    fn allocator() -> RangeAllocator {
        RangeAllocator::new(VirtualRange::from_raw(16 * MB, 64 * MB))
    }

    #[test]
    fn first_fit_is_ascending() {
        let mut vaa = allocator();
        let a = vaa.alloc4k(4, None);
        let b = vaa.alloc4k(4, None);
        assert_eq!(a.front.as_u64(), 16 * MB);
        assert_eq!(b.front.as_u64(), 16 * MB + 4 * PAGE_SIZE as u64);
        vaa.check_invariants();
    }

    #[test]
    fn hint_is_honoured_when_free() {
        let mut vaa = allocator();
        let hint = VirtualAddress::new(32 * MB);
        let taken = vaa.alloc4k(2, Some(hint));
        assert_eq!(taken.front, hint);
        vaa.check_invariants();

        // Same hint again: the span is taken, fall back to first fit.
        let other = vaa.alloc4k(2, Some(hint));
        assert_eq!(other.front.as_u64(), 16 * MB);
        vaa.check_invariants();
    }

    #[test]
    fn alloc2m_is_large_aligned() {
        let mut vaa = RangeAllocator::new(VirtualRange::from_raw(
            16 * MB + PAGE_SIZE as u64,
            64 * MB,
        ));
        let taken = vaa.alloc2m(1, None);
        assert!(taken.is_valid());
        assert_eq!(taken.front.as_u64() % LARGE_PAGE_SIZE as u64, 0);
        vaa.check_invariants();
    }

    #[test]
    fn release_merges_neighbours() {
        let mut vaa = allocator();
        let a = vaa.alloc4k(8, None);
        let b = vaa.alloc4k(8, None);
        let c = vaa.alloc4k(8, None);

        vaa.release(a);
        vaa.release(c);
        vaa.check_invariants();

        // Releasing the middle block must fuse all three into the head
        // interval again.
        vaa.release(b);
        vaa.check_invariants();
        assert_eq!(vaa.free_bytes(), 48 * MB);

        let again = vaa.alloc4k(24, None);
        assert_eq!(again.front, a.front);
    }

    #[test]
    fn free_plus_allocated_covers_the_span() {
        let mut vaa = allocator();
        let mut allocated = 0;
        for count in [1usize, 7, 3, 12, 5] {
            let taken = vaa.alloc4k(count, None);
            assert!(taken.is_valid());
            allocated += taken.size();
        }
        vaa.check_invariants();
        assert_eq!(vaa.free_bytes() + allocated, vaa.span().size());
    }

    #[test]
    fn mark_used_splits_intervals() {
        let mut vaa = allocator();
        let middle = VirtualRange::from_raw(30 * MB, 31 * MB);
        vaa.mark_used(middle);
        vaa.check_invariants();
        assert_eq!(vaa.free_bytes(), 47 * MB);

        // The hint inside the reserved hole cannot be satisfied.
        let taken = vaa.alloc4k(1, Some(VirtualAddress::new(30 * MB)));
        assert_ne!(taken.front.as_u64(), 30 * MB);
    }

    #[test]
    fn exhaustion_is_invalid_range() {
        let mut vaa = RangeAllocator::new(VirtualRange::from_raw(16 * MB, 16 * MB + 0x4000));
        assert!(vaa.alloc4k(4, None).is_valid());
        assert!(!vaa.alloc4k(1, None).is_valid());
    }
}
