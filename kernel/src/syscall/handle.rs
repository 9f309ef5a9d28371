//! Handle facility system calls: clone, close, stat, wait.

use super::CallContext;
use crate::error::{OsResult, OsStatus};
use crate::object::{self, HandleAccess, HandleType, ObjectRef, OsHandle};

/// Wire layout of HandleClone input.
#[repr(C)]
#[derive(Clone, Copy)]
struct OsHandleCloneInfo {
    access: u64,
    /// Target process handle; zero clones into the calling process.
    process: u64,
}

/// 0x60: duplicate a handle with a subset of its rights.
///
/// Cloning into another process requires `IO_CONTROL` on that process's
/// handle.
pub fn handle_clone(call: &CallContext, arg0: u64, arg1: u64, _arg2: u64, _arg3: u64) -> OsResult<u64> {
    let size = core::mem::size_of::<OsHandleCloneInfo>() as u64;
    let bytes = call.copy_from_user(arg1, arg1 + size)?;
    // SAFETY: plain repr(C) integers, length checked by the copy.
    let info =
        unsafe { core::ptr::read_unaligned(bytes.as_ptr() as *const OsHandleCloneInfo) };

    let access = HandleAccess::from_bits(info.access).ok_or(OsStatus::InvalidInput)?;
    let source = OsHandle(arg0);

    if info.process == 0 {
        let minted = object::clone_handle(
            call.process.handles(),
            source,
            access,
            call.process.handles(),
        )?;
        return Ok(minted.raw());
    }

    let entry = call
        .process
        .handles()
        .get_typed(OsHandle(info.process), HandleType::Process)?;
    if !entry.access.contains(HandleAccess::IO_CONTROL) {
        return Err(OsStatus::AccessDenied);
    }
    let ObjectRef::Process(target) = &entry.object else {
        return Err(OsStatus::InvalidType);
    };

    let minted = object::clone_handle(
        call.process.handles(),
        source,
        access,
        target.handles(),
    )?;
    Ok(minted.raw())
}

/// 0x61: close any handle in the calling process.
pub fn handle_close(call: &CallContext, arg0: u64, _arg1: u64, _arg2: u64, _arg3: u64) -> OsResult<u64> {
    call.process.handles().close(OsHandle(arg0))?;
    Ok(0)
}

/// Wire layout of HandleStat output.
#[repr(C)]
#[derive(Clone, Copy)]
struct OsHandleInfo {
    access: u64,
    handle_type: u64,
}

/// 0x62: report a handle's rights and type.
pub fn handle_stat(call: &CallContext, arg0: u64, arg1: u64, _arg2: u64, _arg3: u64) -> OsResult<u64> {
    let info = object::handle_stat(call.process.handles(), OsHandle(arg0))?;

    let wire = OsHandleInfo {
        access: info.access.bits(),
        handle_type: info.handle_type as u64,
    };
    // SAFETY: plain repr(C) integers, no padding.
    let bytes = unsafe {
        core::slice::from_raw_parts(
            &wire as *const OsHandleInfo as *const u8,
            core::mem::size_of::<OsHandleInfo>(),
        )
    };
    call.copy_to_user(arg1, bytes)?;
    Ok(0)
}

/// 0x63: wait for the object behind a handle.
pub fn handle_wait(call: &CallContext, arg0: u64, arg1: u64, _arg2: u64, _arg3: u64) -> OsResult<u64> {
    object::handle_wait(call.process.handles(), OsHandle(arg0), arg1 as i64)?;
    Ok(0)
}
