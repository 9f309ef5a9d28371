//! 4-level x86-64 page tables.
//!
//! Table frames come from the page frame allocator and are reached
//! through a [`PhysMapper`] (the higher-half direct map on bare metal, an
//! identity view over a test arena on the host). Entry stores are made
//! visible with an explicit release fence before any caller can observe
//! the mapping; TLB invalidation is local only, cross-CPU shootdown is a
//! collaborator concern.

use core::sync::atomic::{fence, Ordering};

use super::{
    phys::PageAllocator, MemoryRange, MemoryType, PageFlags, PhysicalAddress, VirtualAddress,
    LARGE_PAGE_SIZE, PAGE_SIZE,
};
use crate::arch::x86_64::pat;
use crate::error::{OsResult, OsStatus};

/// Entries per table at every level.
const TABLE_ENTRIES: usize = 512;

/// A linear `(vaddr, paddr, size)` region with a single slide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressMapping {
    pub vaddr: VirtualAddress,
    pub paddr: PhysicalAddress,
    pub size: usize,
}

impl AddressMapping {
    pub const fn new(vaddr: VirtualAddress, paddr: PhysicalAddress, size: usize) -> Self {
        Self { vaddr, paddr, size }
    }

    /// The constant `vaddr - paddr` difference across the mapping.
    pub const fn slide(&self) -> i64 {
        self.vaddr.as_u64() as i64 - self.paddr.as_u64() as i64
    }

    pub fn is_page_aligned(&self) -> bool {
        self.vaddr.is_page_aligned()
            && self.paddr.is_page_aligned()
            && self.size % PAGE_SIZE == 0
    }

    /// Enlarge outward so both ends are `align`-aligned; coverage only
    /// ever grows.
    pub fn aligned(&self, align: u64) -> AddressMapping {
        let front = self.vaddr.as_u64() / align * align;
        let back = (self.vaddr.as_u64() + self.size as u64).next_multiple_of(align);
        let delta = self.vaddr.as_u64() - front;
        AddressMapping {
            vaddr: VirtualAddress::new(front),
            paddr: PhysicalAddress::new(self.paddr.as_u64() - delta),
            size: (back - front) as usize,
        }
    }

    pub fn physical_range(&self) -> MemoryRange {
        MemoryRange::new(self.paddr, self.paddr.offset(self.size as u64))
    }
}

/// Whether a mapping qualifies for 2 MiB leaves: exact large-page
/// alignment of all three of `vaddr`, `paddr`, and `size`. Flag and
/// memory-type uniformity is implied by mapping a single request.
pub fn is_large_page_eligible(mapping: &AddressMapping) -> bool {
    mapping.vaddr.as_u64() % LARGE_PAGE_SIZE as u64 == 0
        && mapping.paddr.as_u64() % LARGE_PAGE_SIZE as u64 == 0
        && mapping.size % LARGE_PAGE_SIZE == 0
}

/// Translation from physical addresses to referenceable pointers.
pub trait PhysMapper {
    fn phys_to_ptr(&self, addr: PhysicalAddress) -> *mut u8;
}

/// The higher-half direct map: every physical address is visible at a
/// fixed offset.
#[derive(Debug, Clone, Copy)]
pub struct DirectMap {
    pub offset: u64,
}

impl PhysMapper for DirectMap {
    fn phys_to_ptr(&self, addr: PhysicalAddress) -> *mut u8 {
        (addr.as_u64() + self.offset) as *mut u8
    }
}

// Architectural bits of a page table entry.
const ENTRY_PRESENT: u64 = 1 << 0;
const ENTRY_WRITABLE: u64 = 1 << 1;
const ENTRY_USER: u64 = 1 << 2;
const ENTRY_PWT: u64 = 1 << 3;
const ENTRY_PCD: u64 = 1 << 4;
const ENTRY_ACCESSED: u64 = 1 << 5;
const ENTRY_DIRTY: u64 = 1 << 6;
const ENTRY_LARGE: u64 = 1 << 7;
const ENTRY_PAT_4K: u64 = 1 << 7;
const ENTRY_PAT_LARGE: u64 = 1 << 12;
const ENTRY_NO_EXECUTE: u64 = 1 << 63;
const ENTRY_ADDRESS_MASK: u64 = 0x000f_ffff_ffff_f000;

/// One 64-bit table entry at any level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageTableEntry(pub u64);

impl PageTableEntry {
    pub const EMPTY: PageTableEntry = PageTableEntry(0);

    /// Build a leaf entry for a page of the given size class.
    fn leaf(addr: PhysicalAddress, flags: PageFlags, memory_type: MemoryType, large: bool) -> Self {
        let mut bits = addr.as_u64() & ENTRY_ADDRESS_MASK;

        if flags.contains(PageFlags::PRESENT) {
            bits |= ENTRY_PRESENT;
        }
        if flags.contains(PageFlags::WRITABLE) {
            bits |= ENTRY_WRITABLE;
        }
        if flags.contains(PageFlags::USER) {
            bits |= ENTRY_USER;
        }
        if !flags.contains(PageFlags::EXECUTABLE) {
            bits |= ENTRY_NO_EXECUTE;
        }
        if large {
            bits |= ENTRY_LARGE;
        }

        let slot = pat::slot_for(memory_type);
        if slot & 0b001 != 0 {
            bits |= ENTRY_PWT;
        }
        if slot & 0b010 != 0 {
            bits |= ENTRY_PCD;
        }
        if slot & 0b100 != 0 {
            bits |= if large { ENTRY_PAT_LARGE } else { ENTRY_PAT_4K };
        }

        PageTableEntry(bits)
    }

    /// Build an intermediate entry pointing at the next table down.
    ///
    /// Intermediates are permissive; the leaf is what restricts the
    /// final rights, and `get_memory_flags` intersects the walk anyway.
    fn table(addr: PhysicalAddress, user: bool) -> Self {
        let mut bits = (addr.as_u64() & ENTRY_ADDRESS_MASK) | ENTRY_PRESENT | ENTRY_WRITABLE;
        if user {
            bits |= ENTRY_USER;
        }
        PageTableEntry(bits)
    }

    pub const fn is_present(&self) -> bool {
        self.0 & ENTRY_PRESENT != 0
    }

    pub const fn is_large(&self) -> bool {
        self.0 & ENTRY_LARGE != 0
    }

    pub const fn address(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 & ENTRY_ADDRESS_MASK)
    }

    /// Access flags of this single entry.
    pub fn flags(&self) -> PageFlags {
        let mut flags = PageFlags::empty();
        if self.0 & ENTRY_PRESENT != 0 {
            flags |= PageFlags::PRESENT;
        }
        if self.0 & ENTRY_WRITABLE != 0 {
            flags |= PageFlags::WRITABLE;
        }
        if self.0 & ENTRY_USER != 0 {
            flags |= PageFlags::USER;
        }
        if self.0 & ENTRY_NO_EXECUTE == 0 {
            flags |= PageFlags::EXECUTABLE;
        }
        if self.0 & ENTRY_ACCESSED != 0 {
            flags |= PageFlags::ACCESSED;
        }
        if self.0 & ENTRY_DIRTY != 0 {
            flags |= PageFlags::DIRTY;
        }
        flags
    }

    /// PAT slot index encoded in a leaf entry.
    pub fn memory_type_index(&self, large: bool) -> u8 {
        let mut slot = 0u8;
        if self.0 & ENTRY_PWT != 0 {
            slot |= 0b001;
        }
        if self.0 & ENTRY_PCD != 0 {
            slot |= 0b010;
        }
        let pat_bit = if large { ENTRY_PAT_LARGE } else { ENTRY_PAT_4K };
        if self.0 & pat_bit != 0 {
            slot |= 0b100;
        }
        slot
    }
}

/// Snapshot of all four levels for one address, outermost first.
/// `None` past the first non-present level.
#[derive(Debug, Clone, Copy, Default)]
pub struct PageWalk {
    pub entries: [Option<PageTableEntry>; 4],
}

impl PageWalk {
    /// The leaf entry of the walk, if translation completed.
    pub fn leaf(&self) -> Option<PageTableEntry> {
        for (level, entry) in self.entries.iter().enumerate() {
            let entry = (*entry)?;
            if !entry.is_present() {
                return None;
            }
            // Level index 2 is the PD where 2 MiB leaves live.
            if level == 3 || (level == 2 && entry.is_large()) {
                return Some(entry);
            }
        }
        None
    }
}

/// A 4-level page table hierarchy rooted in one frame.
pub struct PageTables<M: PhysMapper> {
    root: PhysicalAddress,
    mapper: M,
}

fn table_indices(vaddr: VirtualAddress) -> [usize; 4] {
    let addr = vaddr.as_u64();
    [
        (addr >> 39) as usize & 0x1ff,
        (addr >> 30) as usize & 0x1ff,
        (addr >> 21) as usize & 0x1ff,
        (addr >> 12) as usize & 0x1ff,
    ]
}

impl<M: PhysMapper> PageTables<M> {
    /// Allocate and zero the root table.
    pub fn new(pfa: &mut PageAllocator, mapper: M) -> OsResult<PageTables<M>> {
        let root = pfa.alloc4k(1);
        if !root.is_valid() {
            return Err(OsStatus::OutOfMemory);
        }

        let tables = PageTables { root, mapper };
        tables.zero_table(root);
        Ok(tables)
    }

    /// Adopt an existing root (the boot tables).
    pub fn from_root(root: PhysicalAddress, mapper: M) -> PageTables<M> {
        PageTables { root, mapper }
    }

    pub fn root(&self) -> PhysicalAddress {
        self.root
    }

    fn zero_table(&self, table: PhysicalAddress) {
        let ptr = self.mapper.phys_to_ptr(table) as *mut u64;
        // SAFETY: the frame was just allocated for exclusive use as a
        // table and is mapped through the direct map.
        unsafe {
            core::ptr::write_bytes(ptr, 0, TABLE_ENTRIES);
        }
    }

    fn entry(&self, table: PhysicalAddress, index: usize) -> PageTableEntry {
        let ptr = self.mapper.phys_to_ptr(table) as *const u64;
        // SAFETY: `table` is a live table frame; index < 512.
        PageTableEntry(unsafe { core::ptr::read_volatile(ptr.add(index)) })
    }

    fn set_entry(&self, table: PhysicalAddress, index: usize, entry: PageTableEntry) {
        let ptr = self.mapper.phys_to_ptr(table) as *mut u64;
        // SAFETY: `table` is a live table frame; index < 512.
        unsafe {
            core::ptr::write_volatile(ptr.add(index), entry.0);
        }
    }

    /// Walk to the table at `target_level`, allocating missing
    /// intermediates from the PFA.
    fn descend_for_write(
        &mut self,
        pfa: &mut PageAllocator,
        vaddr: VirtualAddress,
        target_level: usize,
        user: bool,
    ) -> OsResult<PhysicalAddress> {
        let indices = table_indices(vaddr);
        let mut table = self.root;

        for level in 0..target_level {
            let entry = self.entry(table, indices[level]);
            table = if entry.is_present() {
                debug_assert!(!entry.is_large(), "remap over a large leaf");
                entry.address()
            } else {
                let fresh = pfa.alloc4k(1);
                if !fresh.is_valid() {
                    return Err(OsStatus::OutOfMemory);
                }
                self.zero_table(fresh);
                self.set_entry(table, indices[level], PageTableEntry::table(fresh, user));
                fresh
            };
        }

        Ok(table)
    }

    /// Install `mapping` with uniform flags and memory type.
    ///
    /// 2 MiB leaves are used when the whole mapping is large-page
    /// eligible. Intermediate tables are allocated as needed and only
    /// released at teardown.
    pub fn map(
        &mut self,
        pfa: &mut PageAllocator,
        mapping: AddressMapping,
        flags: PageFlags,
        memory_type: MemoryType,
    ) -> OsResult {
        if !mapping.is_page_aligned() || mapping.size == 0 {
            return Err(OsStatus::InvalidInput);
        }

        let user = flags.contains(PageFlags::USER);
        let large = is_large_page_eligible(&mapping);
        let step = if large { LARGE_PAGE_SIZE } else { PAGE_SIZE };
        let target_level = if large { 2 } else { 3 };

        let mut offset = 0usize;
        while offset < mapping.size {
            let vaddr = mapping.vaddr.offset(offset as u64);
            let paddr = mapping.paddr.offset(offset as u64);

            let table = self.descend_for_write(pfa, vaddr, target_level, user)?;
            let index = table_indices(vaddr)[target_level];
            self.set_entry(
                table,
                index,
                PageTableEntry::leaf(paddr, flags, memory_type, large),
            );

            offset += step;
        }

        // Publish the entries before the caller can hand out pointers
        // into the mapping.
        fence(Ordering::Release);
        Ok(())
    }

    /// Clear the leaves covering `[vaddr, vaddr + size)` and invalidate
    /// the local TLB for each page. Intermediate tables stay in place.
    pub fn unmap(&mut self, vaddr: VirtualAddress, size: usize) {
        debug_assert!(vaddr.is_page_aligned() && size % PAGE_SIZE == 0);

        let mut offset = 0usize;
        while offset < size {
            let addr = vaddr.offset(offset as u64);
            let walk = self.walk(addr);

            // A 2 MiB leaf unmaps the whole aligned block at once.
            let step = match walk.entries[2] {
                Some(entry) if entry.is_present() && entry.is_large() => {
                    self.clear_leaf(addr, 2);
                    LARGE_PAGE_SIZE
                }
                _ => {
                    if walk.leaf().is_some() {
                        self.clear_leaf(addr, 3);
                    }
                    PAGE_SIZE
                }
            };

            invalidate_page(addr);
            offset += step;
        }

        fence(Ordering::Release);
    }

    fn clear_leaf(&mut self, vaddr: VirtualAddress, target_level: usize) {
        let indices = table_indices(vaddr);
        let mut table = self.root;
        for level in 0..target_level {
            let entry = self.entry(table, indices[level]);
            if !entry.is_present() {
                return;
            }
            table = entry.address();
        }
        self.set_entry(table, indices[target_level], PageTableEntry::EMPTY);
    }

    /// The physical address backing `vaddr`, or the invalid sentinel if
    /// any level on the way down is not present.
    pub fn get_backing_address(&self, vaddr: VirtualAddress) -> PhysicalAddress {
        let walk = self.walk(vaddr);
        let Some(leaf) = walk.leaf() else {
            return PhysicalAddress::INVALID;
        };

        let page_mask = if leaf.is_large() {
            LARGE_PAGE_SIZE as u64 - 1
        } else {
            PAGE_SIZE as u64 - 1
        };
        PhysicalAddress::new(leaf.address().as_u64() | (vaddr.as_u64() & page_mask))
    }

    /// Effective flags at `vaddr`: the intersection of every level along
    /// the walk, so a page is writable/user/executable only if all
    /// levels permit it.
    pub fn get_memory_flags(&self, vaddr: VirtualAddress) -> PageFlags {
        let walk = self.walk(vaddr);
        if walk.leaf().is_none() {
            return PageFlags::empty();
        }

        let mut flags = PageFlags::PRESENT
            | PageFlags::WRITABLE
            | PageFlags::USER
            | PageFlags::EXECUTABLE;
        let mut status = PageFlags::empty();

        for entry in walk.entries.iter().flatten() {
            flags &= entry.flags() | (PageFlags::ACCESSED | PageFlags::DIRTY);
            status |= entry.flags() & (PageFlags::ACCESSED | PageFlags::DIRTY);
            if entry.is_large() {
                break;
            }
        }

        flags | status
    }

    /// Full four-level snapshot for diagnostics and user-pointer
    /// validation.
    pub fn walk(&self, vaddr: VirtualAddress) -> PageWalk {
        let indices = table_indices(vaddr);
        let mut walk = PageWalk::default();
        let mut table = self.root;

        for level in 0..4 {
            let entry = self.entry(table, indices[level]);
            walk.entries[level] = Some(entry);

            if !entry.is_present() || entry.is_large() {
                break;
            }
            table = entry.address();
        }

        walk
    }
}

/// Invalidate the local TLB entry for one page.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
fn invalidate_page(vaddr: VirtualAddress) {
    x86_64::instructions::tlb::flush(x86_64::VirtAddr::new(vaddr.as_u64()));
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
fn invalidate_page(_vaddr: VirtualAddress) {}
