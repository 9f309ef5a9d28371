//! Physical page frame allocator.
//!
//! A [`RegionBitmapAllocator`] owns one contiguous usable range with one
//! bit per 4 KiB page (set = taken). The [`PageAllocator`] stacks one
//! region allocator per usable range, split at 1 MiB into the low-memory
//! pool (AP trampolines and other firmware-adjacent allocations) and the
//! high-memory pool everything else draws from.
//!
//! Out of memory is reported as [`PhysicalAddress::INVALID`]; the PFA
//! never fails with an error value.

use alloc::vec::Vec;

use super::{
    layout::SystemMemoryLayout, MemoryRange, PhysicalAddress, LOW_MEMORY_LIMIT, PAGE_SIZE,
};

/// Bytes of bitmap needed to cover a range.
pub fn range_bitmap_size(range: &MemoryRange) -> usize {
    (range.pages() as usize).div_ceil(8)
}

/// Bytes of bitmap needed for every usable and reclaimable range of a
/// layout. Boot code sizes the early-memory arena from this.
pub fn layout_bitmap_size(layout: &SystemMemoryLayout) -> usize {
    layout
        .usable
        .iter()
        .chain(layout.reclaimable.iter())
        .map(range_bitmap_size)
        .sum()
}

/// Bitmap allocator for one physically contiguous range.
///
/// The range is page aligned; bits outside the page count are never set.
pub struct RegionBitmapAllocator {
    range: MemoryRange,
    bitmap: &'static mut [u8],
}

impl RegionBitmapAllocator {
    /// Build an allocator over `range` with every page free.
    ///
    /// `bitmap` must hold at least [`range_bitmap_size`] bytes; the extra
    /// tail bytes are never touched.
    pub fn new(range: MemoryRange, bitmap: &'static mut [u8]) -> RegionBitmapAllocator {
        debug_assert!(range.front.is_page_aligned() && range.back.is_page_aligned());
        debug_assert!(bitmap.len() >= range_bitmap_size(&range));

        let mut region = RegionBitmapAllocator { range, bitmap };
        for byte in region.bitmap.iter_mut() {
            *byte = 0;
        }
        region
    }

    fn bit_count(&self) -> usize {
        self.range.pages() as usize
    }

    fn test(&self, bit: usize) -> bool {
        self.bitmap[bit / 8] & (1 << (bit % 8)) != 0
    }

    fn set(&mut self, bit: usize) {
        self.bitmap[bit / 8] |= 1 << (bit % 8);
    }

    fn clear(&mut self, bit: usize) {
        self.bitmap[bit / 8] &= !(1 << (bit % 8));
    }

    /// The range of memory managed by this allocator.
    pub fn range(&self) -> MemoryRange {
        self.range
    }

    /// First-fit allocation of `count` contiguous pages.
    pub fn alloc4k(&mut self, count: usize) -> PhysicalAddress {
        if count == 0 || count > self.bit_count() {
            return PhysicalAddress::INVALID;
        }

        let mut run = 0;
        for bit in 0..self.bit_count() {
            if self.test(bit) {
                run = 0;
                continue;
            }

            run += 1;
            if run == count {
                let first = bit + 1 - count;
                for taken in first..first + count {
                    self.set(taken);
                }
                return self.range.front.offset((first * PAGE_SIZE) as u64);
            }
        }

        PhysicalAddress::INVALID
    }

    /// Release the pages of `range` that fall inside this region.
    ///
    /// The range is intersected first, so releasing a span that was
    /// merged or split across regions is safe.
    pub fn release(&mut self, range: MemoryRange) {
        let covered = self.range.intersect(&range);
        if covered.is_empty() {
            return;
        }

        let first = ((covered.front.0 - self.range.front.0) / PAGE_SIZE as u64) as usize;
        for bit in first..first + covered.pages() as usize {
            self.clear(bit);
        }
    }

    /// Mark the pages of `range` that fall inside this region as taken.
    /// Idempotent.
    pub fn mark_used(&mut self, range: MemoryRange) {
        let covered = self.range.intersect(&range);
        if covered.is_empty() {
            return;
        }

        let first = ((covered.front.0 - self.range.front.0) / PAGE_SIZE as u64) as usize;
        for bit in first..first + covered.pages() as usize {
            self.set(bit);
        }
    }

    /// Absorb an adjacent region whose bitmap directly follows this one.
    ///
    /// Only meaningful when both bitmaps were carved back to back from
    /// the same arena; [`PageAllocator::rebuild`] checks that before
    /// calling.
    fn extend(&mut self, other: RegionBitmapAllocator) {
        debug_assert_eq!(self.range.back, other.range.front);

        // The merged bitmap is only valid if this region ends on a byte
        // boundary, otherwise the two bit streams would interleave.
        debug_assert_eq!(self.bit_count() % 8, 0);

        let len = self.bitmap.len() + other.bitmap.len();
        // Rebuild the slice over both carvings. The caller guarantees
        // they are contiguous within the bitmap arena.
        self.bitmap =
            unsafe { core::slice::from_raw_parts_mut(self.bitmap.as_mut_ptr(), len) };
        self.range = MemoryRange::new(self.range.front, other.range.back);
    }

    fn bitmap_end_ptr(&self) -> *const u8 {
        self.bitmap.as_ptr_range().end
    }

    /// Number of taken pages, for diagnostics and tests.
    pub fn taken_pages(&self) -> usize {
        (0..self.bit_count()).filter(|&bit| self.test(bit)).count()
    }
}

/// The system-wide page frame allocator.
pub struct PageAllocator {
    /// One allocator per usable or reclaimable range at or above 1 MiB.
    regions: Vec<RegionBitmapAllocator>,
    /// One allocator per range below 1 MiB.
    low_memory: Vec<RegionBitmapAllocator>,
    rebuilt: bool,
}

impl PageAllocator {
    /// Build the PFA from the boot layout.
    ///
    /// `bitmap_arena` supplies the backing for every region bitmap and
    /// must hold at least [`layout_bitmap_size`] bytes; it is carved
    /// sequentially in address order so that [`rebuild`](Self::rebuild)
    /// can merge neighbouring regions later. Reclaimable ranges start
    /// fully marked used; release them once the bootloader data they
    /// hold is dead.
    pub fn new(layout: &SystemMemoryLayout, mut bitmap_arena: &'static mut [u8]) -> PageAllocator {
        let mut ranges: Vec<(MemoryRange, bool)> = Vec::new();
        for range in &layout.usable {
            ranges.push((*range, false));
        }
        for range in &layout.reclaimable {
            ranges.push((*range, true));
        }
        ranges.sort_unstable_by_key(|(range, _)| range.front);

        let mut allocator = PageAllocator {
            regions: Vec::new(),
            low_memory: Vec::new(),
            rebuilt: false,
        };

        for (range, reclaimable) in ranges {
            // A range straddling the low-memory limit contributes to both
            // pools.
            let low = range.intersect(&MemoryRange::from_raw(0, LOW_MEMORY_LIMIT));
            let high = range.intersect(&MemoryRange::from_raw(LOW_MEMORY_LIMIT, u64::MAX));

            for part in [low, high] {
                if part.is_empty() {
                    continue;
                }

                let bytes = range_bitmap_size(&part);
                assert!(bytes <= bitmap_arena.len(), "bitmap arena too small");

                // Carve the arena by hand so both halves keep the
                // 'static lifetime.
                let base = bitmap_arena.as_mut_ptr();
                let remaining = bitmap_arena.len() - bytes;
                let bitmap = unsafe { core::slice::from_raw_parts_mut(base, bytes) };
                bitmap_arena =
                    unsafe { core::slice::from_raw_parts_mut(base.add(bytes), remaining) };

                let mut region = RegionBitmapAllocator::new(part, bitmap);
                if reclaimable {
                    region.mark_used(part);
                }

                if part.back.0 <= LOW_MEMORY_LIMIT {
                    allocator.low_memory.push(region);
                } else {
                    allocator.regions.push(region);
                }
            }
        }

        allocator
    }

    /// Allocate `count` contiguous 4 KiB pages above 1 MiB, first-fit
    /// across regions in address order.
    pub fn alloc4k(&mut self, count: usize) -> PhysicalAddress {
        for region in &mut self.regions {
            let addr = region.alloc4k(count);
            if addr.is_valid() {
                return addr;
            }
        }

        PhysicalAddress::INVALID
    }

    /// Allocate a single page below 1 MiB.
    pub fn low_memory_alloc4k(&mut self) -> PhysicalAddress {
        for region in &mut self.low_memory {
            let addr = region.alloc4k(1);
            if addr.is_valid() {
                return addr;
            }
        }

        PhysicalAddress::INVALID
    }

    /// Release a range back to whichever regions cover it.
    pub fn release(&mut self, range: MemoryRange) {
        for region in self.regions.iter_mut().chain(self.low_memory.iter_mut()) {
            region.release(range);
        }
    }

    /// Reserve a range before it can be handed out. Idempotent.
    pub fn mark_used(&mut self, range: MemoryRange) {
        for region in self.regions.iter_mut().chain(self.low_memory.iter_mut()) {
            region.mark_used(range);
        }
    }

    /// Merge neighbouring regions whose bitmaps are contiguous.
    ///
    /// Called exactly once, after bootloader-reclaimable memory has been
    /// released; afterwards large allocations can span former region
    /// boundaries.
    pub fn rebuild(&mut self) {
        assert!(!self.rebuilt, "page allocator rebuilt twice");
        self.rebuilt = true;

        let mut merged: Vec<RegionBitmapAllocator> = Vec::new();
        for region in self.regions.drain(..) {
            match merged.last_mut() {
                Some(last)
                    if last.range().back == region.range().front
                        && last.bitmap_end_ptr() == region.bitmap.as_ptr()
                        && last.bit_count() % 8 == 0 =>
                {
                    last.extend(region);
                }
                _ => merged.push(region),
            }
        }

        self.regions = merged;
    }

    /// Number of high-memory regions, for diagnostics and tests.
    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    /// Total taken pages across every pool.
    pub fn taken_pages(&self) -> usize {
        self.regions
            .iter()
            .chain(self.low_memory.iter())
            .map(RegionBitmapAllocator::taken_pages)
            .sum()
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use alloc::boxed::Box;
    use alloc::vec;

    use super::*;
    use crate::mm::layout::{MemoryMapEntry, MemoryMapEntryKind};

    fn leak_bitmap(bytes: usize) -> &'static mut [u8] {
        Box::leak(vec![0u8; bytes].into_boxed_slice())
    }

    fn region(front: u64, back: u64) -> RegionBitmapAllocator {
        let range = MemoryRange::from_raw(front, back);
        RegionBitmapAllocator::new(range, leak_bitmap(range_bitmap_size(&range)))
    }

    #[test]
    fn alloc_sets_the_bits_it_returns() {
        let mut region = region(0x10_0000, 0x20_0000);

        let a = region.alloc4k(4);
        assert_eq!(a, PhysicalAddress::new(0x10_0000));
        assert_eq!(region.taken_pages(), 4);

        let b = region.alloc4k(2);
        assert_eq!(b, PhysicalAddress::new(0x10_4000));
        assert_eq!(region.taken_pages(), 6);
    }

    #[test]
    fn outstanding_allocations_never_overlap() {
        let mut region = region(0x10_0000, 0x14_0000);

        let mut spans = vec![];
        loop {
            let addr = region.alloc4k(3);
            if !addr.is_valid() {
                break;
            }
            spans.push(addr.as_u64());
        }

        spans.sort_unstable();
        for pair in spans.windows(2) {
            assert!(pair[0] + 3 * PAGE_SIZE as u64 <= pair[1]);
        }
    }

    #[test]
    fn release_reopens_first_fit_hole() {
        let mut region = region(0x10_0000, 0x20_0000);

        let a = region.alloc4k(8);
        let _b = region.alloc4k(8);
        region.release(MemoryRange::new(a, a.offset(8 * PAGE_SIZE as u64)));

        let again = region.alloc4k(8);
        assert_eq!(again, a);
    }

    #[test]
    fn mark_used_is_idempotent() {
        let mut region = region(0x10_0000, 0x11_0000);
        let used = MemoryRange::from_raw(0x10_2000, 0x10_4000);

        region.mark_used(used);
        region.mark_used(used);
        assert_eq!(region.taken_pages(), 2);

        region.release(used);
        assert_eq!(region.taken_pages(), 0);
    }

    #[test]
    fn release_outside_region_is_ignored() {
        let mut region = region(0x10_0000, 0x11_0000);
        region.mark_used(MemoryRange::from_raw(0x10_0000, 0x11_0000));

        region.release(MemoryRange::from_raw(0x20_0000, 0x21_0000));
        assert_eq!(region.taken_pages(), 16);
    }

    fn boot_allocator(entries: &[MemoryMapEntry]) -> PageAllocator {
        let layout = crate::mm::layout::SystemMemoryLayout::from_entries(entries);
        let arena = leak_bitmap(layout_bitmap_size(&layout));
        PageAllocator::new(&layout, arena)
    }

    #[test]
    fn pfa_round_trip() {
        // Boot map: [0, 1M) reserved, [1M, 64M) usable.
        let mut pfa = boot_allocator(&[
            MemoryMapEntry {
                kind: MemoryMapEntryKind::Reserved,
                range: MemoryRange::from_raw(0, 0x10_0000),
            },
            MemoryMapEntry {
                kind: MemoryMapEntryKind::Usable,
                range: MemoryRange::from_raw(0x10_0000, 0x400_0000),
            },
        ]);
        pfa.rebuild();

        let a = pfa.alloc4k(16);
        let b = pfa.alloc4k(16);
        assert!(a.is_valid() && b.is_valid());
        assert_eq!(b.as_u64() - a.as_u64(), 16 * PAGE_SIZE as u64);

        pfa.release(MemoryRange::new(a, a.offset(16 * PAGE_SIZE as u64)));

        let a2 = pfa.alloc4k(16);
        assert_eq!(a2, a);
    }

    #[test]
    fn low_memory_pool_is_separate() {
        let mut pfa = boot_allocator(&[MemoryMapEntry {
            kind: MemoryMapEntryKind::Usable,
            range: MemoryRange::from_raw(0x4000, 0x20_0000),
        }]);

        let low = pfa.low_memory_alloc4k();
        assert_eq!(low, PhysicalAddress::new(0x4000));

        let high = pfa.alloc4k(1);
        assert_eq!(high, PhysicalAddress::new(0x10_0000));
    }

    #[test]
    fn reclaimable_memory_is_reserved_until_released() {
        let reclaim = MemoryRange::from_raw(0x20_0000, 0x30_0000);
        let mut pfa = boot_allocator(&[
            MemoryMapEntry {
                kind: MemoryMapEntryKind::Usable,
                range: MemoryRange::from_raw(0x10_0000, 0x20_0000),
            },
            MemoryMapEntry {
                kind: MemoryMapEntryKind::BootloaderReclaimable,
                range: reclaim,
            },
        ]);

        assert_eq!(pfa.taken_pages(), reclaim.pages() as usize);

        pfa.release(reclaim);
        pfa.rebuild();
        assert_eq!(pfa.taken_pages(), 0);
        assert_eq!(pfa.region_count(), 1, "adjacent regions merged");

        // A span crossing the former boundary is now allocatable.
        let across = pfa.alloc4k(0x18_0000 / PAGE_SIZE);
        assert!(across.is_valid());
    }

    #[test]
    fn exhaustion_returns_the_sentinel() {
        let mut pfa = boot_allocator(&[MemoryMapEntry {
            kind: MemoryMapEntryKind::Usable,
            range: MemoryRange::from_raw(0x10_0000, 0x10_4000),
        }]);

        assert!(pfa.alloc4k(4).is_valid());
        let exhausted = pfa.alloc4k(1);
        assert!(!exhausted.is_valid());
    }
}
