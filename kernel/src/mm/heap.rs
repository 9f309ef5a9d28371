//! TLSF kernel heap.
//!
//! Two-level segregated fit over one contiguous arena. Free blocks are
//! indexed by a memory class (roughly `log2(size) - 7`) and a five-bit
//! second index; a bitmap per level makes finding the next non-empty
//! free list O(1). Block metadata lives outside the arena in a
//! caller-supplied node pool, so every byte of the arena belongs to
//! exactly one block and the arena itself is never written by the
//! allocator core.
//!
//! A designated *null block* represents the unbounded tail of the arena.
//! It is free but never linked into a free list; carving from it appends
//! new blocks in address order.
//!
//! [`KernelHeap`] wraps the block-level allocator with the pointer-based
//! `malloc`/`free`/`realloc` surface and backs `#[global_allocator]` on
//! bare metal.

use core::mem::MaybeUninit;
use core::ptr::NonNull;

use super::{MemoryRange, PhysicalAddress};
use crate::error::{OsResult, OsStatus};

/// Sizes at or below this use the flat small-size class (class 0).
const SMALL_BUFFER_SIZE: usize = 0x100;

/// `log2` shift between a size and its memory class.
const MEMORY_CLASS_SHIFT: u32 = 7;

/// Bits of second-level subdivision inside one memory class.
const SECOND_LEVEL_INDEX: u32 = 5;

/// Granularity of the small-size classes; also the minimum block size.
const SMALL_SIZE_STEP: usize = SMALL_BUFFER_SIZE / (1 << SECOND_LEVEL_INDEX);

/// Upper bound of representable memory classes on a 64-bit size.
const MAX_MEMORY_CLASS: usize = (64 - MEMORY_CLASS_SHIFT) as usize;

/// Total number of free lists across every (class, second index) pair.
const FREE_LIST_COUNT: usize =
    (MAX_MEMORY_CLASS - 1) * (1 << SECOND_LEVEL_INDEX) + (1 << SECOND_LEVEL_INDEX) * 2;

type BlockIndex = u32;

/// Null link in the block lists.
const NIL: BlockIndex = u32::MAX;

const fn bit_scan_leading(value: usize) -> u32 {
    63 - (value as u64).leading_zeros()
}

const fn round_up(value: usize, step: usize) -> usize {
    value.div_ceil(step) * step
}

/// Memory class of a size: `max(0, floor(log2(size)) - 7)`.
const fn size_to_memory_class(size: usize) -> usize {
    if size > SMALL_BUFFER_SIZE {
        (bit_scan_leading(size) - MEMORY_CLASS_SHIFT) as usize
    } else {
        0
    }
}

/// Second index of a size within its memory class, from the next five
/// bits below the class bit.
const fn size_to_second_index(size: usize, memory_class: usize) -> usize {
    if memory_class == 0 {
        (size - 1) / SMALL_SIZE_STEP
    } else {
        let shift = memory_class as u32 + MEMORY_CLASS_SHIFT - SECOND_LEVEL_INDEX;
        (size >> shift) ^ (1 << SECOND_LEVEL_INDEX)
    }
}

/// Flat free-list index for a (class, second index) pair.
const fn list_index(memory_class: usize, second_index: usize) -> usize {
    if memory_class == 0 {
        second_index
    } else {
        (memory_class - 1) * (1 << SECOND_LEVEL_INDEX)
            + second_index
            + (1 << SECOND_LEVEL_INDEX)
    }
}

/// Flat free-list index for a size.
const fn list_index_for(size: usize) -> usize {
    let memory_class = size_to_memory_class(size);
    list_index(memory_class, size_to_second_index(size, memory_class))
}

/// Allocation granularity for a size's memory class.
///
/// `aligned_alloc` rounds requests up to the next multiple of this.
pub const fn size_granularity(size: usize) -> usize {
    if size > SMALL_BUFFER_SIZE {
        1 << (bit_scan_leading(size) - SECOND_LEVEL_INDEX)
    } else {
        SMALL_SIZE_STEP
    }
}

/// One block of the arena.
///
/// Blocks tile the arena without gaps and are linked in address order
/// through `prev_phys`/`next_phys`. A block is free iff `prev_free`
/// does not point back at the block itself.
#[derive(Debug, Clone, Copy)]
pub struct TlsfBlock {
    offset: usize,
    size: usize,
    prev_phys: BlockIndex,
    next_phys: BlockIndex,
    prev_free: BlockIndex,
    next_free: BlockIndex,
}

/// Opaque allocation token. Stable for the lifetime of the allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlsfAllocation(BlockIndex);

/// Fixed-capacity pool the block metadata is carved from.
///
/// Node memory is supplied by the caller (boot feeds it PFA pages, tests
/// leak a boxed slice) so the heap never calls back into a global
/// allocator.
struct BlockPool {
    nodes: &'static mut [MaybeUninit<TlsfBlock>],
    free_head: BlockIndex,
    used: usize,
    high_water: usize,
}

impl BlockPool {
    fn new(nodes: &'static mut [MaybeUninit<TlsfBlock>]) -> BlockPool {
        BlockPool {
            nodes,
            free_head: NIL,
            used: 0,
            high_water: 0,
        }
    }

    fn available(&self) -> usize {
        let fresh = self.nodes.len() - self.high_water;
        fresh + (self.high_water - self.used)
    }

    fn alloc(&mut self, block: TlsfBlock) -> Option<BlockIndex> {
        if self.free_head != NIL {
            let index = self.free_head;
            // The free chain reuses next_free of returned nodes.
            self.free_head = unsafe { self.nodes[index as usize].assume_init_ref() }.next_free;
            self.nodes[index as usize] = MaybeUninit::new(block);
            self.used += 1;
            return Some(index);
        }

        if self.high_water < self.nodes.len() {
            let index = self.high_water as BlockIndex;
            self.nodes[self.high_water] = MaybeUninit::new(block);
            self.high_water += 1;
            self.used += 1;
            return Some(index);
        }

        None
    }

    fn free(&mut self, index: BlockIndex) {
        let node = unsafe { self.nodes[index as usize].assume_init_mut() };
        node.next_free = self.free_head;
        self.free_head = index;
        self.used -= 1;
    }

    fn get(&self, index: BlockIndex) -> &TlsfBlock {
        unsafe { self.nodes[index as usize].assume_init_ref() }
    }

    fn get_mut(&mut self, index: BlockIndex) -> &mut TlsfBlock {
        unsafe { self.nodes[index as usize].assume_init_mut() }
    }
}

/// The block-level TLSF allocator.
pub struct TlsfHeap {
    range: MemoryRange,
    pool: BlockPool,
    null_block: BlockIndex,
    head: BlockIndex,
    free_list: [BlockIndex; FREE_LIST_COUNT],
    inner_free_map: [u32; MAX_MEMORY_CLASS],
    is_free_map: u64,
}

/// Point-in-time counters for diagnostics.
#[derive(Debug, Clone, Copy, Default)]
pub struct TlsfHeapStats {
    pub block_count: usize,
    pub free_bytes: usize,
    pub taken_bytes: usize,
    pub pool_used: usize,
    pub pool_capacity: usize,
}

impl TlsfHeap {
    /// Build a heap over `range` using `nodes` for block metadata.
    ///
    /// The range must be page aligned and non-empty; the pool must hold
    /// at least a handful of nodes (one is consumed immediately by the
    /// null block).
    pub fn create(
        range: MemoryRange,
        nodes: &'static mut [MaybeUninit<TlsfBlock>],
    ) -> OsResult<TlsfHeap> {
        if range.is_empty() || !range.front.is_page_aligned() {
            return Err(OsStatus::InvalidInput);
        }

        let mut pool = BlockPool::new(nodes);
        let null_block = pool
            .alloc(TlsfBlock {
                offset: 0,
                size: range.size() as usize,
                prev_phys: NIL,
                next_phys: NIL,
                prev_free: NIL,
                next_free: NIL,
            })
            .ok_or(OsStatus::OutOfMemory)?;

        Ok(TlsfHeap {
            range,
            pool,
            null_block,
            head: null_block,
            free_list: [NIL; FREE_LIST_COUNT],
            inner_free_map: [0; MAX_MEMORY_CLASS],
            is_free_map: 0,
        })
    }

    /// The managed arena.
    pub fn range(&self) -> MemoryRange {
        self.range
    }

    fn is_free(&self, index: BlockIndex) -> bool {
        self.pool.get(index).prev_free != index
    }

    fn block_address(&self, index: BlockIndex) -> usize {
        self.range.front.as_usize() + self.pool.get(index).offset
    }

    /// Address of an allocation within the arena.
    pub fn address_of(&self, alloc: TlsfAllocation) -> PhysicalAddress {
        PhysicalAddress::new(self.block_address(alloc.0) as u64)
    }

    /// Current byte size of an allocation.
    pub fn size_of(&self, alloc: TlsfAllocation) -> usize {
        self.pool.get(alloc.0).size
    }

    // -----------------------------------------------------------------
    // Free list maintenance
    // -----------------------------------------------------------------

    fn insert_free_block(&mut self, index: BlockIndex) {
        let size = self.pool.get(index).size;
        let memory_class = size_to_memory_class(size);
        let second_index = size_to_second_index(size, memory_class);
        let list = list_index(memory_class, second_index);

        let old_head = self.free_list[list];
        {
            let block = self.pool.get_mut(index);
            block.prev_free = NIL;
            block.next_free = old_head;
        }
        if old_head != NIL {
            self.pool.get_mut(old_head).prev_free = index;
        }
        self.free_list[list] = index;

        self.inner_free_map[memory_class] |= 1 << second_index;
        self.is_free_map |= 1 << memory_class;
    }

    fn remove_free_block(&mut self, index: BlockIndex) {
        let size = self.pool.get(index).size;
        let memory_class = size_to_memory_class(size);
        let second_index = size_to_second_index(size, memory_class);
        let list = list_index(memory_class, second_index);

        let (prev, next) = {
            let block = self.pool.get(index);
            (block.prev_free, block.next_free)
        };

        if prev != NIL {
            self.pool.get_mut(prev).next_free = next;
        } else {
            debug_assert_eq!(self.free_list[list], index);
            self.free_list[list] = next;
        }
        if next != NIL {
            self.pool.get_mut(next).prev_free = prev;
        }

        if self.free_list[list] == NIL {
            self.inner_free_map[memory_class] &= !(1 << second_index);
            if self.inner_free_map[memory_class] == 0 {
                self.is_free_map &= !(1 << memory_class);
            }
        }
    }

    fn mark_taken(&mut self, index: BlockIndex) {
        let block = self.pool.get_mut(index);
        block.prev_free = index;
        block.next_free = index;
    }

    /// Find the first non-empty free list at or above `list`, consulting
    /// the two bitmaps.
    fn next_non_empty_list(&self, start_class: usize, start_second: usize) -> Option<usize> {
        // Remaining second indexes inside the starting class.
        let inner = self.inner_free_map[start_class] & !((1u32 << start_second) - 1);
        if inner != 0 {
            return Some(list_index(start_class, inner.trailing_zeros() as usize));
        }

        // Any higher class with a free block.
        let outer = self.is_free_map & !((1u64 << (start_class + 1)) - 1);
        if outer != 0 {
            let memory_class = outer.trailing_zeros() as usize;
            let second = self.inner_free_map[memory_class].trailing_zeros() as usize;
            return Some(list_index(memory_class, second));
        }

        None
    }

    // -----------------------------------------------------------------
    // Allocation
    // -----------------------------------------------------------------

    /// Alignment padding needed to place `size` bytes in `block`, if it
    /// fits.
    fn check_fit(&self, index: BlockIndex, size: usize, align: usize) -> Option<usize> {
        let block = self.pool.get(index);
        let addr = self.range.front.as_usize() + block.offset;
        let pad = round_up(addr, align) - addr;
        if pad + size <= block.size {
            Some(pad)
        } else {
            None
        }
    }

    /// `malloc` with the minimum granularity alignment.
    pub fn malloc(&mut self, size: usize) -> OsResult<TlsfAllocation> {
        self.aligned_alloc(SMALL_SIZE_STEP, size)
    }

    /// Allocate `size` bytes at the given power-of-two alignment.
    ///
    /// The size is rounded up to the granularity of its memory class.
    /// Fails with `OutOfMemory` when no free block at or above the
    /// request can hold it; partial success is never returned.
    pub fn aligned_alloc(&mut self, align: usize, size: usize) -> OsResult<TlsfAllocation> {
        if size == 0 || !align.is_power_of_two() {
            return Err(OsStatus::InvalidInput);
        }

        let size = round_up(size, size_granularity(size));
        let align = align.max(SMALL_SIZE_STEP);

        // A single allocation creates at most three new list states
        // (front pad, taken block, tail remainder); refuse up front
        // rather than unwind half a carve.
        if self.pool.available() < 3 {
            return Err(OsStatus::OutOfMemory);
        }

        // First fit within the candidate list, then the bitmaps point at
        // the next non-empty higher list, whose blocks are all large
        // enough by construction (alignment can still disqualify one).
        let memory_class = size_to_memory_class(size);
        let second_index = size_to_second_index(size, memory_class);
        let mut cursor = self.next_non_empty_list(memory_class, second_index);
        while let Some(list) = cursor {
            let mut walk = self.free_list[list];
            while walk != NIL {
                if let Some(pad) = self.check_fit(walk, size, align) {
                    return Ok(self.take_list_block(walk, pad, size));
                }
                walk = self.pool.get(walk).next_free;
            }

            let (class, second) = if list >= 1 << SECOND_LEVEL_INDEX {
                let class = (list - (1 << SECOND_LEVEL_INDEX)) / (1 << SECOND_LEVEL_INDEX) + 1;
                let second = (list - (1 << SECOND_LEVEL_INDEX)) % (1 << SECOND_LEVEL_INDEX);
                (class, second)
            } else {
                (0, list)
            };
            cursor = if second + 1 < 1 << SECOND_LEVEL_INDEX {
                self.next_non_empty_list(class, second + 1)
            } else if class + 1 < MAX_MEMORY_CLASS {
                self.next_non_empty_list(class + 1, 0)
            } else {
                None
            };
        }

        // Fall back to the tail.
        if let Some(pad) = self.check_fit(self.null_block, size, align) {
            return Ok(self.take_from_null(pad, size));
        }

        Err(OsStatus::OutOfMemory)
    }

    /// Carve an allocation out of a block taken from the free lists.
    fn take_list_block(&mut self, index: BlockIndex, pad: usize, size: usize) -> TlsfAllocation {
        self.remove_free_block(index);

        if pad > 0 {
            let (offset, prev_phys) = {
                let block = self.pool.get(index);
                (block.offset, block.prev_phys)
            };
            let front = self
                .pool
                .alloc(TlsfBlock {
                    offset,
                    size: pad,
                    prev_phys,
                    next_phys: index,
                    prev_free: NIL,
                    next_free: NIL,
                })
                .expect("pool availability checked before carving");
            if prev_phys != NIL {
                self.pool.get_mut(prev_phys).next_phys = front;
            } else {
                self.head = front;
            }
            {
                let block = self.pool.get_mut(index);
                block.prev_phys = front;
                block.offset += pad;
                block.size -= pad;
            }
            self.insert_free_block(front);
        }

        let remainder = self.pool.get(index).size - size;
        if remainder >= SMALL_SIZE_STEP {
            let (offset, next_phys) = {
                let block = self.pool.get(index);
                (block.offset, block.next_phys)
            };
            let tail = self
                .pool
                .alloc(TlsfBlock {
                    offset: offset + size,
                    size: remainder,
                    prev_phys: index,
                    next_phys,
                    prev_free: NIL,
                    next_free: NIL,
                })
                .expect("pool availability checked before carving");
            if next_phys != NIL {
                self.pool.get_mut(next_phys).prev_phys = tail;
            }
            {
                let block = self.pool.get_mut(index);
                block.next_phys = tail;
                block.size = size;
            }
            self.insert_free_block(tail);
        }

        self.mark_taken(index);
        TlsfAllocation(index)
    }

    /// Append an allocation by advancing the null block.
    fn take_from_null(&mut self, pad: usize, size: usize) -> TlsfAllocation {
        let (null_offset, null_prev) = {
            let null = self.pool.get(self.null_block);
            (null.offset, null.prev_phys)
        };

        let taken = self
            .pool
            .alloc(TlsfBlock {
                offset: null_offset + pad,
                size,
                prev_phys: null_prev,
                next_phys: self.null_block,
                prev_free: NIL,
                next_free: NIL,
            })
            .expect("pool availability checked before carving");

        if null_prev != NIL {
            self.pool.get_mut(null_prev).next_phys = taken;
        } else {
            self.head = taken;
        }
        {
            let null = self.pool.get_mut(self.null_block);
            null.prev_phys = taken;
            null.offset += pad + size;
            null.size -= pad + size;
        }

        if pad > 0 {
            let front = self
                .pool
                .alloc(TlsfBlock {
                    offset: null_offset,
                    size: pad,
                    prev_phys: null_prev,
                    next_phys: taken,
                    prev_free: NIL,
                    next_free: NIL,
                })
                .expect("pool availability checked before carving");
            if null_prev != NIL {
                self.pool.get_mut(null_prev).next_phys = front;
            } else {
                self.head = front;
            }
            self.pool.get_mut(taken).prev_phys = front;
            self.insert_free_block(front);
        }

        self.mark_taken(taken);
        TlsfAllocation(taken)
    }

    // -----------------------------------------------------------------
    // Free
    // -----------------------------------------------------------------

    /// Return an allocation, merging with free physical neighbours.
    pub fn free(&mut self, alloc: TlsfAllocation) {
        let mut index = alloc.0;
        assert!(!self.is_free(index), "double free of tlsf block");

        {
            let block = self.pool.get_mut(index);
            block.prev_free = NIL;
            block.next_free = NIL;
        }

        // Merge the physically previous block in. The null block is the
        // tail, so it can never be the previous neighbour.
        let prev = self.pool.get(index).prev_phys;
        if prev != NIL && self.is_free(prev) {
            self.remove_free_block(prev);
            let (size, next) = {
                let block = self.pool.get(index);
                (block.size, block.next_phys)
            };
            {
                let prev_block = self.pool.get_mut(prev);
                prev_block.size += size;
                prev_block.next_phys = next;
            }
            if next != NIL {
                self.pool.get_mut(next).prev_phys = prev;
            }
            self.pool.free(index);
            index = prev;
        }

        let next = self.pool.get(index).next_phys;
        if next == self.null_block {
            // Merge into the tail instead of keeping a fragment list
            // entry at the end of the arena.
            let (offset, size, prev_phys) = {
                let block = self.pool.get(index);
                (block.offset, block.size, block.prev_phys)
            };
            {
                let null = self.pool.get_mut(self.null_block);
                null.offset = offset;
                null.size += size;
                null.prev_phys = prev_phys;
            }
            if prev_phys != NIL {
                self.pool.get_mut(prev_phys).next_phys = self.null_block;
            } else {
                self.head = self.null_block;
            }
            self.pool.free(index);
            return;
        }

        if next != NIL && self.is_free(next) {
            self.remove_free_block(next);
            let (next_size, next_next) = {
                let block = self.pool.get(next);
                (block.size, block.next_phys)
            };
            {
                let block = self.pool.get_mut(index);
                block.size += next_size;
                block.next_phys = next_next;
            }
            if next_next != NIL {
                self.pool.get_mut(next_next).prev_phys = index;
            }
            self.pool.free(next);
        }

        self.insert_free_block(index);
    }

    // -----------------------------------------------------------------
    // Realloc
    // -----------------------------------------------------------------

    /// Grow or shrink an allocation in place.
    ///
    /// Growth succeeds only when the next physical block is free (or the
    /// tail) and large enough; otherwise the caller allocates, copies,
    /// and frees. Shrinking always succeeds and releases the cut tail.
    pub fn resize_in_place(&mut self, alloc: TlsfAllocation, size: usize) -> OsResult<()> {
        if size == 0 {
            return Err(OsStatus::InvalidInput);
        }

        let index = alloc.0;
        assert!(!self.is_free(index), "resize of free tlsf block");

        let size = round_up(size, size_granularity(size));
        let current = self.pool.get(index).size;

        if size == current {
            return Ok(());
        }

        if size < current {
            let remainder = current - size;
            if remainder < SMALL_SIZE_STEP {
                return Ok(());
            }
            if self.pool.available() < 1 {
                // Keeping the slack is harmless; reuse needs a node.
                return Ok(());
            }
            let (offset, next_phys) = {
                let block = self.pool.get(index);
                (block.offset, block.next_phys)
            };
            let tail = self
                .pool
                .alloc(TlsfBlock {
                    offset: offset + size,
                    size: remainder,
                    prev_phys: index,
                    next_phys,
                    prev_free: NIL,
                    next_free: NIL,
                })
                .expect("availability checked");
            if next_phys != NIL {
                self.pool.get_mut(next_phys).prev_phys = tail;
            }
            {
                let block = self.pool.get_mut(index);
                block.next_phys = tail;
                block.size = size;
            }
            // Route through free() so the tail merges with a free
            // successor.
            self.mark_taken(tail);
            self.free(TlsfAllocation(tail));
            return Ok(());
        }

        let growth = size - current;
        let next = self.pool.get(index).next_phys;

        if next == self.null_block {
            if self.pool.get(self.null_block).size >= growth {
                {
                    let null = self.pool.get_mut(self.null_block);
                    null.offset += growth;
                    null.size -= growth;
                }
                self.pool.get_mut(index).size = size;
                return Ok(());
            }
            return Err(OsStatus::OutOfMemory);
        }

        if next != NIL && self.is_free(next) {
            let next_size = self.pool.get(next).size;
            if next_size >= growth {
                self.remove_free_block(next);
                let leftover = next_size - growth;
                if leftover >= SMALL_SIZE_STEP {
                    {
                        let block = self.pool.get_mut(next);
                        block.offset += growth;
                        block.size = leftover;
                    }
                    self.pool.get_mut(index).size = size;
                    self.insert_free_block(next);
                } else {
                    // Absorb the whole neighbour.
                    let next_next = self.pool.get(next).next_phys;
                    {
                        let block = self.pool.get_mut(index);
                        block.size = current + next_size;
                        block.next_phys = next_next;
                    }
                    if next_next != NIL {
                        self.pool.get_mut(next_next).prev_phys = index;
                    }
                    self.pool.free(next);
                }
                return Ok(());
            }
        }

        Err(OsStatus::OutOfMemory)
    }

    // -----------------------------------------------------------------
    // Diagnostics
    // -----------------------------------------------------------------

    pub fn stats(&self) -> TlsfHeapStats {
        let mut stats = TlsfHeapStats {
            pool_used: self.pool.used,
            pool_capacity: self.pool.nodes.len(),
            ..Default::default()
        };

        let mut walk = self.head;
        while walk != NIL {
            let block = self.pool.get(walk);
            stats.block_count += 1;
            if self.is_free(walk) {
                stats.free_bytes += block.size;
            } else {
                stats.taken_bytes += block.size;
            }
            walk = block.next_phys;
        }

        stats
    }

    /// Panic if any structural invariant is broken. Test-grade, O(n²) in
    /// list length.
    pub fn validate(&self) {
        // Blocks tile the arena in address order.
        let mut walk = self.head;
        let mut expected_offset = 0usize;
        let mut total = 0usize;
        let mut previous = NIL;
        while walk != NIL {
            let block = self.pool.get(walk);
            assert_eq!(block.offset, expected_offset, "gap or overlap in arena");
            assert_eq!(block.prev_phys, previous, "broken physical back link");
            if walk != self.null_block {
                assert!(block.size > 0);
            }
            expected_offset += block.size;
            total += block.size;
            previous = walk;
            walk = block.next_phys;
        }
        assert_eq!(previous, self.null_block, "null block is not the tail");
        assert_eq!(total, self.range.size() as usize, "arena not fully tiled");

        // Bitmaps agree with the lists.
        for memory_class in 0..MAX_MEMORY_CLASS {
            for second_index in 0..(1 << SECOND_LEVEL_INDEX) {
                let list = list_index(memory_class, second_index);
                if list >= FREE_LIST_COUNT {
                    continue;
                }
                let non_empty = self.free_list[list] != NIL;
                let inner = self.inner_free_map[memory_class] & (1 << second_index) != 0;
                assert_eq!(non_empty, inner, "inner bitmap out of sync");

                let mut entry = self.free_list[list];
                while entry != NIL {
                    assert!(self.is_free(entry), "taken block on a free list");
                    let block = self.pool.get(entry);
                    assert_eq!(list_index_for(block.size), list, "block in wrong list");
                    entry = block.next_free;
                }
            }
            let outer = self.is_free_map & (1 << memory_class) != 0;
            assert_eq!(
                outer,
                self.inner_free_map[memory_class] != 0,
                "outer bitmap out of sync"
            );
        }
    }
}

// ---------------------------------------------------------------------
// Pointer-level heap
// ---------------------------------------------------------------------

const HEAP_MAGIC: u32 = 0x464c_5354;

/// Header stored immediately before every pointer handed out by
/// [`KernelHeap`]. Lives inside the allocation's own block.
#[repr(C)]
#[derive(Clone, Copy)]
struct HeapHeader {
    magic: u32,
    block: BlockIndex,
    /// Byte distance from the block base to the user pointer.
    offset: u32,
    _reserved: u32,
}

const HEADER_SIZE: usize = core::mem::size_of::<HeapHeader>();

/// Pointer-based heap surface over [`TlsfHeap`].
///
/// `base` is the writable virtual mapping of the arena; it must share
/// page alignment with the arena's physical range so block alignment
/// carries over to pointers.
pub struct KernelHeap {
    tlsf: TlsfHeap,
    base: *mut u8,
}

// The raw arena pointer is only dereferenced under the owner's lock.
unsafe impl Send for KernelHeap {}

impl KernelHeap {
    pub fn new(tlsf: TlsfHeap, base: *mut u8) -> KernelHeap {
        debug_assert_eq!(base as usize % super::PAGE_SIZE, 0);
        KernelHeap { tlsf, base }
    }

    fn user_ptr(&self, alloc: TlsfAllocation, offset: usize) -> NonNull<u8> {
        let block_offset = self.tlsf.address_of(alloc).as_usize()
            - self.tlsf.range().front.as_usize();
        // SAFETY: the block lies inside the mapped arena.
        unsafe { NonNull::new_unchecked(self.base.add(block_offset + offset)) }
    }

    fn header_of(&self, ptr: NonNull<u8>) -> OsResult<HeapHeader> {
        let addr = ptr.as_ptr() as usize;
        let arena = self.base as usize;
        if addr < arena + HEADER_SIZE
            || addr >= arena + self.tlsf.range().size() as usize
        {
            return Err(OsStatus::InvalidAddress);
        }

        // SAFETY: in range per the check above; the header was written by
        // the matching alloc.
        let header = unsafe { *(ptr.as_ptr().sub(HEADER_SIZE) as *const HeapHeader) };
        if header.magic != HEAP_MAGIC {
            return Err(OsStatus::InvalidAddress);
        }
        Ok(header)
    }

    fn write_header(&mut self, alloc: TlsfAllocation, offset: usize) -> NonNull<u8> {
        let user = self.user_ptr(alloc, offset);
        let header = HeapHeader {
            magic: HEAP_MAGIC,
            block: alloc.0,
            offset: offset as u32,
            _reserved: 0,
        };
        // SAFETY: offset >= HEADER_SIZE by construction, so the header
        // stays inside the block.
        unsafe {
            *(user.as_ptr().sub(HEADER_SIZE) as *mut HeapHeader) = header;
        }
        user
    }

    /// Allocate `size` bytes with the default granularity alignment.
    pub fn malloc(&mut self, size: usize) -> OsResult<NonNull<u8>> {
        self.aligned_alloc(HEADER_SIZE, size)
    }

    /// Allocate `size` bytes aligned to `align`.
    pub fn aligned_alloc(&mut self, align: usize, size: usize) -> OsResult<NonNull<u8>> {
        if size == 0 {
            return Err(OsStatus::InvalidInput);
        }

        let align = align.max(HEADER_SIZE);
        if !align.is_power_of_two() {
            return Err(OsStatus::InvalidInput);
        }

        // The user pointer is `align` past an `align`-aligned block
        // start, leaving room for the header right below it.
        let alloc = self.tlsf.aligned_alloc(align, size + align)?;
        Ok(self.write_header(alloc, align))
    }

    /// Free a pointer previously returned by this heap.
    pub fn free(&mut self, ptr: NonNull<u8>) -> OsResult {
        let header = self.header_of(ptr)?;
        self.tlsf.free(TlsfAllocation(header.block));
        Ok(())
    }

    /// Resize an allocation, extending in place when the next block is
    /// free, otherwise allocate-copy-free.
    pub fn realloc(&mut self, ptr: NonNull<u8>, size: usize) -> OsResult<NonNull<u8>> {
        let header = self.header_of(ptr)?;
        let alloc = TlsfAllocation(header.block);
        let offset = header.offset as usize;
        let old_user = self.tlsf.size_of(alloc) - offset;

        if self
            .tlsf
            .resize_in_place(alloc, size + offset)
            .is_ok()
        {
            return Ok(ptr);
        }

        let fresh = self.aligned_alloc(offset, size)?;
        // SAFETY: both ranges are live arena allocations; copy length is
        // clamped to the smaller of the two.
        unsafe {
            core::ptr::copy_nonoverlapping(ptr.as_ptr(), fresh.as_ptr(), old_user.min(size));
        }
        self.tlsf.free(alloc);
        Ok(fresh)
    }

    pub fn stats(&self) -> TlsfHeapStats {
        self.tlsf.stats()
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use alloc::boxed::Box;
    use alloc::vec;

    use super::*;

    const KB: usize = 1024;

    fn nodes(count: usize) -> &'static mut [MaybeUninit<TlsfBlock>] {
        Box::leak(vec![MaybeUninit::uninit(); count].into_boxed_slice())
    }

    fn heap(size: usize) -> TlsfHeap {
        TlsfHeap::create(MemoryRange::from_raw(0x10_0000, (0x10_0000 + size) as u64), nodes(512))
            .unwrap()
    }

    #[test]
    fn index_math_matches_the_design() {
        // Class 0 covers sizes up to 256 in steps of 8.
        assert_eq!(size_to_memory_class(8), 0);
        assert_eq!(size_to_memory_class(256), 0);
        assert_eq!(size_to_memory_class(257), 1);
        assert_eq!(size_to_memory_class(512), 2);

        assert_eq!(size_to_second_index(8, 0), 0);
        assert_eq!(size_to_second_index(256, 0), 31);

        assert_eq!(list_index(0, 31), 31);
        assert_eq!(list_index(1, 0), 32);

        assert_eq!(size_granularity(100), 8);
        assert_eq!(size_granularity(1 << 12), 1 << 7);
    }

    #[test]
    fn oversized_request_is_out_of_memory() {
        let mut heap = heap(1024 * KB);
        let err = heap.malloc(2 * 1024 * KB).unwrap_err();
        assert_eq!(err, OsStatus::OutOfMemory);
        heap.validate();
    }

    #[test]
    fn split_and_merge_reuses_the_middle() {
        // Arena 1 MiB; three 300 KiB blocks fill most of it.
        let mut heap = heap(1024 * KB);

        let a = heap.malloc(300 * KB).unwrap();
        let b = heap.malloc(300 * KB).unwrap();
        let c = heap.malloc(300 * KB).unwrap();
        heap.validate();

        let b_addr = heap.address_of(b);
        heap.free(b);
        heap.validate();

        // A 250 KiB request lands exactly where the middle block was.
        let d = heap.malloc(250 * KB).unwrap();
        assert_eq!(heap.address_of(d), b_addr);
        heap.validate();

        heap.free(a);
        heap.free(c);
        heap.free(d);
        heap.validate();

        let stats = heap.stats();
        assert_eq!(stats.taken_bytes, 0);
        assert_eq!(stats.block_count, 1, "everything merged back into the tail");
    }

    #[test]
    fn every_byte_belongs_to_exactly_one_block() {
        let mut heap = heap(256 * KB);
        let mut live = vec![];

        for (index, size) in [32usize, 500, 4096, 9, 100 * KB, 77].into_iter().enumerate() {
            let alloc = heap.malloc(size).unwrap();
            if index % 2 == 0 {
                live.push(alloc);
            } else {
                heap.free(alloc);
            }
            heap.validate();
        }

        for alloc in live {
            heap.free(alloc);
            heap.validate();
        }
    }

    #[test]
    fn aligned_alloc_respects_alignment() {
        let mut heap = heap(1024 * KB);

        let _skew = heap.malloc(24).unwrap();
        for align in [8usize, 64, 256, 4096] {
            let alloc = heap.aligned_alloc(align, 100).unwrap();
            assert_eq!(heap.address_of(alloc).as_usize() % align, 0);
            heap.validate();
        }
    }

    #[test]
    fn free_merges_both_neighbours() {
        let mut heap = heap(256 * KB);
        let a = heap.malloc(16 * KB).unwrap();
        let b = heap.malloc(16 * KB).unwrap();
        let c = heap.malloc(16 * KB).unwrap();
        let _fence = heap.malloc(16 * KB).unwrap();

        heap.free(a);
        heap.free(c);
        heap.validate();

        // Freeing b joins a, b, and c into one block.
        let before = heap.stats().block_count;
        heap.free(b);
        heap.validate();
        assert_eq!(heap.stats().block_count, before - 2);
    }

    #[test]
    fn resize_in_place_grows_into_free_neighbour() {
        let mut heap = heap(256 * KB);
        let a = heap.malloc(16 * KB).unwrap();
        let b = heap.malloc(16 * KB).unwrap();
        let _fence = heap.malloc(16 * KB).unwrap();

        heap.free(b);
        heap.resize_in_place(a, 24 * KB).unwrap();
        assert!(heap.size_of(a) >= 24 * KB);
        heap.validate();

        // The fence blocks further growth beyond b's former extent.
        let err = heap.resize_in_place(a, 64 * KB).unwrap_err();
        assert_eq!(err, OsStatus::OutOfMemory);
        heap.validate();
    }

    #[test]
    fn tail_allocation_grows_into_the_null_block() {
        let mut heap = heap(256 * KB);
        let a = heap.malloc(16 * KB).unwrap();
        heap.resize_in_place(a, 128 * KB).unwrap();
        assert!(heap.size_of(a) >= 128 * KB);
        heap.validate();
    }

    #[test]
    fn pool_exhaustion_is_out_of_memory() {
        let range = MemoryRange::from_raw(0x10_0000, 0x10_0000 + 64 * KB as u64);
        let mut heap = TlsfHeap::create(range, nodes(4)).unwrap();

        // The tiny pool runs dry long before the arena does.
        let mut allocs = vec![];
        loop {
            match heap.malloc(64) {
                Ok(alloc) => allocs.push(alloc),
                Err(status) => {
                    assert_eq!(status, OsStatus::OutOfMemory);
                    break;
                }
            }
        }
        assert!(!allocs.is_empty());
        heap.validate();
    }

    // -- pointer-level heap ------------------------------------------

    fn pointer_heap(size: usize) -> KernelHeap {
        let layout = core::alloc::Layout::from_size_align(size, 4096).unwrap();
        // SAFETY: layout is non-zero; the memory is intentionally leaked
        // for the 'static arena.
        let base = unsafe { alloc::alloc::alloc(layout) };
        assert!(!base.is_null());
        let tlsf = TlsfHeap::create(
            MemoryRange::from_raw(base as u64, base as u64 + size as u64),
            nodes(512),
        )
        .unwrap();
        KernelHeap::new(tlsf, base)
    }

    #[test]
    fn pointer_round_trip() {
        let mut heap = pointer_heap(256 * KB);

        let ptr = heap.malloc(100).unwrap();
        unsafe {
            core::ptr::write_bytes(ptr.as_ptr(), 0xab, 100);
        }
        heap.free(ptr).unwrap();

        let again = heap.aligned_alloc(256, 512).unwrap();
        assert_eq!(again.as_ptr() as usize % 256, 0);
        heap.free(again).unwrap();
    }

    #[test]
    fn realloc_preserves_contents() {
        let mut heap = pointer_heap(256 * KB);

        let ptr = heap.malloc(64).unwrap();
        for byte in 0..64u8 {
            unsafe { *ptr.as_ptr().add(byte as usize) = byte };
        }

        // Force a move by pinning the neighbour.
        let _fence = heap.malloc(64).unwrap();
        let grown = heap.realloc(ptr, 4 * KB).unwrap();
        for byte in 0..64u8 {
            assert_eq!(unsafe { *grown.as_ptr().add(byte as usize) }, byte);
        }
        heap.free(grown).unwrap();
    }

    #[test]
    fn foreign_pointer_is_rejected() {
        let mut heap = pointer_heap(64 * KB);
        let bogus = NonNull::new(0x1000 as *mut u8).unwrap();
        assert_eq!(heap.free(bogus).unwrap_err(), OsStatus::InvalidAddress);
    }
}
