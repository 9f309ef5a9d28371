//! Memory management for the Obsidian kernel.
//!
//! Layering, bottom to top:
//! - [`layout`]: the boot memory map handed over by the loader.
//! - [`phys`]: the page frame allocator owning every physical page.
//! - [`virt`]: range allocators for supervisor and user address space.
//! - [`heap`]: the TLSF kernel heap over a PFA-backed arena.
//! - [`paging`]: 4-level page tables binding the two together.
//! - [`user`]: validated copies in and out of user memory.

pub mod heap;
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub mod kalloc;
pub mod layout;
pub mod paging;
pub mod phys;
pub mod user;
pub mod virt;

pub use layout::{LaunchInfo, MemoryMapEntry, MemoryMapEntryKind};
pub use paging::{AddressMapping, PageTables, PageWalk};
pub use phys::{PageAllocator, RegionBitmapAllocator};
pub use virt::RangeAllocator;

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;

/// Offset of the higher-half direct map, published at boot.
static HHDM_OFFSET: AtomicU64 = AtomicU64::new(0);

/// Record the direct-map offset from the boot handoff.
pub fn set_hhdm_offset(offset: u64) {
    HHDM_OFFSET.store(offset, Ordering::Release);
}

/// The direct-map offset; zero until boot publishes it (host tests use
/// identity views).
pub fn hhdm_offset() -> u64 {
    HHDM_OFFSET.load(Ordering::Acquire)
}

/// Size of a physical frame and of the smallest page mapping.
pub const PAGE_SIZE: usize = 4096;

/// Size of a 2 MiB large page.
pub const LARGE_PAGE_SIZE: usize = 2 * 1024 * 1024;

/// Boundary between the low-memory and high-memory physical pools.
pub const LOW_MEMORY_LIMIT: u64 = 0x10_0000;

/// Physical memory address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysicalAddress(pub u64);

impl PhysicalAddress {
    /// Sentinel returned by allocators on exhaustion.
    pub const INVALID: PhysicalAddress = PhysicalAddress(u64::MAX);

    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub const fn as_usize(&self) -> usize {
        self.0 as usize
    }

    pub const fn is_valid(&self) -> bool {
        self.0 != u64::MAX
    }

    pub const fn offset(&self, offset: u64) -> Self {
        Self(self.0 + offset)
    }

    pub const fn is_page_aligned(&self) -> bool {
        self.0 % PAGE_SIZE as u64 == 0
    }
}

impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Virtual memory address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtualAddress(pub u64);

impl VirtualAddress {
    pub const INVALID: VirtualAddress = VirtualAddress(u64::MAX);

    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub const fn offset(&self, offset: u64) -> Self {
        Self(self.0 + offset)
    }

    pub const fn is_valid(&self) -> bool {
        self.0 != u64::MAX
    }

    pub const fn is_page_aligned(&self) -> bool {
        self.0 % PAGE_SIZE as u64 == 0
    }

    /// Whether the address is canonical on x86-64 (bits 63:47 sign-extend
    /// bit 47).
    pub const fn is_canonical(&self) -> bool {
        let upper = self.0 >> 47;
        upper == 0 || upper == 0x1ffff
    }

    /// Whether the address falls in the lower (user) half.
    pub const fn is_user_half(&self) -> bool {
        self.0 < 0x0000_8000_0000_0000
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Half-open range `[front, back)` of physical memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRange {
    pub front: PhysicalAddress,
    pub back: PhysicalAddress,
}

impl MemoryRange {
    pub const fn new(front: PhysicalAddress, back: PhysicalAddress) -> Self {
        Self { front, back }
    }

    pub const fn from_raw(front: u64, back: u64) -> Self {
        Self {
            front: PhysicalAddress(front),
            back: PhysicalAddress(back),
        }
    }

    pub const fn size(&self) -> u64 {
        self.back.0.saturating_sub(self.front.0)
    }

    pub const fn is_empty(&self) -> bool {
        self.back.0 <= self.front.0
    }

    pub const fn pages(&self) -> u64 {
        self.size() / PAGE_SIZE as u64
    }

    pub const fn contains(&self, addr: PhysicalAddress) -> bool {
        self.front.0 <= addr.0 && addr.0 < self.back.0
    }

    pub const fn contains_range(&self, other: &MemoryRange) -> bool {
        self.front.0 <= other.front.0 && other.back.0 <= self.back.0
    }

    pub fn overlaps(&self, other: &MemoryRange) -> bool {
        self.front.0 < other.back.0 && other.front.0 < self.back.0
    }

    /// The common subrange of two ranges, empty when they are disjoint.
    pub fn intersect(&self, other: &MemoryRange) -> MemoryRange {
        MemoryRange::from_raw(
            self.front.0.max(other.front.0),
            self.back.0.min(other.back.0),
        )
    }

    /// Shrink the range inward so both ends are page aligned.
    pub fn page_align_inward(&self) -> MemoryRange {
        let front = self.front.0.div_ceil(PAGE_SIZE as u64) * PAGE_SIZE as u64;
        let back = (self.back.0 / PAGE_SIZE as u64) * PAGE_SIZE as u64;
        MemoryRange::from_raw(front, back.max(front))
    }
}

impl fmt::Display for MemoryRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}, {:#x})", self.front.0, self.back.0)
    }
}

/// Half-open range `[front, back)` of virtual memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualRange {
    pub front: VirtualAddress,
    pub back: VirtualAddress,
}

impl VirtualRange {
    pub const INVALID: VirtualRange = VirtualRange {
        front: VirtualAddress::INVALID,
        back: VirtualAddress::INVALID,
    };

    pub const fn new(front: VirtualAddress, back: VirtualAddress) -> Self {
        Self { front, back }
    }

    pub const fn from_raw(front: u64, back: u64) -> Self {
        Self {
            front: VirtualAddress(front),
            back: VirtualAddress(back),
        }
    }

    pub const fn size(&self) -> u64 {
        self.back.0.saturating_sub(self.front.0)
    }

    pub const fn is_empty(&self) -> bool {
        self.back.0 <= self.front.0
    }

    pub const fn is_valid(&self) -> bool {
        self.front.0 != u64::MAX
    }

    pub const fn contains(&self, addr: VirtualAddress) -> bool {
        self.front.0 <= addr.0 && addr.0 < self.back.0
    }
}

impl fmt::Display for VirtualRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}, {:#x})", self.front.0, self.back.0)
    }
}

bitflags! {
    /// Access and status bits of a page mapping.
    ///
    /// `get_memory_flags` reports the intersection along the table walk,
    /// so a bit is set only if every level on the way down permits it.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u64 {
        const PRESENT    = 1 << 0;
        const WRITABLE   = 1 << 1;
        const USER       = 1 << 2;
        const EXECUTABLE = 1 << 3;
        const ACCESSED   = 1 << 4;
        const DIRTY      = 1 << 5;
    }
}

impl PageFlags {
    /// Flags for kernel read-write data.
    pub const DATA: PageFlags = PageFlags::PRESENT.union(PageFlags::WRITABLE);

    /// Flags for user read-write data.
    pub const USER_DATA: PageFlags = PageFlags::DATA.union(PageFlags::USER);
}

/// Cache attribution for a mapping, resolved to a PAT slot at map time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryType {
    Uncached,
    WriteCombining,
    WriteThrough,
    WriteBack,
    WriteProtect,
    /// Uncached, but overridable by an MTRR covering the range.
    UncachedOverridable,
    /// Defer to whatever the firmware configured for the range.
    Deferred,
}
