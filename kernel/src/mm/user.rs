//! Validated access to user memory.
//!
//! The kernel never dereferences a userspace pointer directly: the page
//! tables are walked first to prove every page of the span is present,
//! user accessible, and carries the rights the operation needs. Only
//! then does a trusted copy run. Span arithmetic is checked before the
//! walk so an overflowing `front + size` can never alias kernel memory.

use super::{
    paging::{PageTables, PhysMapper},
    PageFlags, VirtualAddress, PAGE_SIZE,
};
use crate::error::{OsResult, OsStatus};

/// Assert that every page of `[begin, end)` is mapped with at least
/// `flags` (in addition to `user | present`, which are always required)
/// and that both endpoints are canonical addresses in the user half.
pub fn is_range_mapped<M: PhysMapper>(
    tables: &PageTables<M>,
    begin: VirtualAddress,
    end: VirtualAddress,
    flags: PageFlags,
) -> OsResult {
    if end < begin {
        return Err(OsStatus::InvalidSpan);
    }
    if begin == end {
        return Ok(());
    }

    if !begin.is_canonical() || !begin.is_user_half() {
        return Err(OsStatus::InvalidAddress);
    }
    let last = VirtualAddress::new(end.as_u64() - 1);
    if !last.is_canonical() || !last.is_user_half() {
        return Err(OsStatus::InvalidAddress);
    }

    let required = flags | PageFlags::PRESENT | PageFlags::USER;

    let mut page = begin.as_u64() / PAGE_SIZE as u64 * PAGE_SIZE as u64;
    while page < end.as_u64() {
        let mapped = tables.get_memory_flags(VirtualAddress::new(page));
        if !mapped.contains(required) {
            return Err(OsStatus::InvalidAddress);
        }
        page += PAGE_SIZE as u64;
    }

    Ok(())
}

/// Check `front + size` for overflow and produce the end address.
fn span_end(front: VirtualAddress, size: usize) -> OsResult<VirtualAddress> {
    front
        .as_u64()
        .checked_add(size as u64)
        .map(VirtualAddress::new)
        .ok_or(OsStatus::InvalidSpan)
}

/// Copy `dst.len()` bytes from user memory into a kernel buffer.
pub fn read_user_memory<M: PhysMapper>(
    tables: &PageTables<M>,
    src: VirtualAddress,
    dst: &mut [u8],
) -> OsResult {
    let end = span_end(src, dst.len())?;
    is_range_mapped(tables, src, end, PageFlags::empty())?;

    // SAFETY: the span was just proven present and user readable.
    unsafe {
        core::ptr::copy_nonoverlapping(src.as_u64() as *const u8, dst.as_mut_ptr(), dst.len());
    }
    Ok(())
}

/// Copy a kernel buffer out to user memory.
pub fn write_user_memory<M: PhysMapper>(
    tables: &PageTables<M>,
    dst: VirtualAddress,
    src: &[u8],
) -> OsResult {
    let end = span_end(dst, src.len())?;
    is_range_mapped(tables, dst, end, PageFlags::WRITABLE)?;

    // SAFETY: the span was just proven present, user accessible, and
    // writable.
    unsafe {
        core::ptr::copy_nonoverlapping(src.as_ptr(), dst.as_u64() as *mut u8, src.len());
    }
    Ok(())
}

/// Copy between two user spans without staging through a kernel buffer.
pub fn copy_user_memory<M: PhysMapper>(
    tables: &PageTables<M>,
    src: VirtualAddress,
    dst: VirtualAddress,
    size: usize,
) -> OsResult {
    let src_end = span_end(src, size)?;
    let dst_end = span_end(dst, size)?;

    is_range_mapped(tables, src, src_end, PageFlags::empty())?;
    is_range_mapped(tables, dst, dst_end, PageFlags::WRITABLE)?;

    // SAFETY: both spans validated above; `copy` tolerates overlap.
    unsafe {
        core::ptr::copy(src.as_u64() as *const u8, dst.as_u64() as *mut u8, size);
    }
    Ok(())
}
