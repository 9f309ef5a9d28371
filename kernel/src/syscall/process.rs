//! Process and thread system calls.

use super::CallContext;
use crate::error::{OsResult, OsStatus};
use crate::isr::IsrContext;
use crate::object::{HandleAccess, HandleType, ObjectRef, OsHandle};
use crate::process::{process_table, Privilege, ThreadState};
use crate::sched::scheduler;

/// Wire layout of ProcessCreate input.
#[repr(C)]
#[derive(Clone, Copy)]
struct OsProcessCreateInfo {
    name_front: u64,
    name_back: u64,
    /// 0 = user, 1 = supervisor.
    privilege: u64,
}

/// Wire layout of ThreadCreate input.
#[repr(C)]
#[derive(Clone, Copy)]
struct OsThreadCreateInfo {
    name_front: u64,
    name_back: u64,
    entry: u64,
    stack: u64,
    /// Target process handle; zero for the calling process.
    process: u64,
}

// ThreadControl operations.
const THREAD_SUSPEND: u64 = 0;
const THREAD_RESUME: u64 = 1;
const THREAD_TERMINATE: u64 = 2;

fn read_struct<T: Copy>(call: &CallContext, address: u64) -> OsResult<T> {
    let size = core::mem::size_of::<T>() as u64;
    let bytes = call.copy_from_user(address, address + size)?;
    // SAFETY: wire structs are plain repr(C) integers; the copy above
    // produced exactly size_of::<T>() bytes.
    Ok(unsafe { core::ptr::read_unaligned(bytes.as_ptr() as *const T) })
}

/// 0x30: a handle to the calling process.
pub fn process_get_current(
    call: &CallContext,
    _arg0: u64,
    _arg1: u64,
    _arg2: u64,
    _arg3: u64,
) -> OsResult<u64> {
    let minted = call
        .process
        .handles()
        .insert(ObjectRef::Process(call.process.clone()), HandleAccess::ALL);
    Ok(minted.raw())
}

/// 0x31: create a process from the wire description.
pub fn process_create(
    call: &CallContext,
    arg0: u64,
    _arg1: u64,
    _arg2: u64,
    _arg3: u64,
) -> OsResult<u64> {
    let info: OsProcessCreateInfo = read_struct(call, arg0)?;
    let name = call.read_name(info.name_front, info.name_back)?;

    let privilege = match info.privilege {
        0 => Privilege::User,
        // Only supervisor callers may mint supervisor processes.
        1 if call.process.privilege() == Privilege::Supervisor => Privilege::Supervisor,
        1 => return Err(OsStatus::AccessDenied),
        _ => return Err(OsStatus::InvalidInput),
    };

    let process = process_table().create_process(&name, privilege);
    let minted = call
        .process
        .handles()
        .insert(ObjectRef::Process(process), HandleAccess::ALL);
    Ok(minted.raw())
}

/// 0x32: exit the calling process. Does not logically return; the
/// calling thread is orphaned and the scheduler drops it on the next
/// tick.
pub fn process_exit(
    call: &CallContext,
    arg0: u64,
    _arg1: u64,
    _arg2: u64,
    _arg3: u64,
) -> OsResult<u64> {
    process_table().exit_process(&call.process, arg0);
    crate::sched::yield_current_thread();
    Ok(0)
}

/// 0x40: a handle to the calling thread.
pub fn thread_get_current(
    call: &CallContext,
    _arg0: u64,
    _arg1: u64,
    _arg2: u64,
    _arg3: u64,
) -> OsResult<u64> {
    let minted = call
        .process
        .handles()
        .insert(ObjectRef::Thread(call.thread.clone()), HandleAccess::ALL);
    Ok(minted.raw())
}

/// 0x41: create a thread, initially suspended.
pub fn thread_create(
    call: &CallContext,
    arg0: u64,
    _arg1: u64,
    _arg2: u64,
    _arg3: u64,
) -> OsResult<u64> {
    let info: OsThreadCreateInfo = read_struct(call, arg0)?;
    let name = call.read_name(info.name_front, info.name_back)?;

    let target = if info.process == 0 {
        call.process.clone()
    } else {
        let entry = call
            .process
            .handles()
            .get_typed(OsHandle(info.process), HandleType::Process)?;
        if !entry.access.contains(HandleAccess::IO_CONTROL) {
            return Err(OsStatus::AccessDenied);
        }
        match &entry.object {
            ObjectRef::Process(process) => process.clone(),
            _ => return Err(OsStatus::InvalidType),
        }
    };

    let mut context = IsrContext::default();
    context.rip = info.entry;
    context.rsp = info.stack;
    // IF set so a resumed thread is preemptible.
    context.rflags = 1 << 9;

    let thread = process_table().create_thread(&target, &name, context)?;
    let minted = call
        .process
        .handles()
        .insert(ObjectRef::Thread(thread), HandleAccess::ALL);
    Ok(minted.raw())
}

fn thread_of(call: &CallContext, raw: u64) -> OsResult<crate::sync::RcuShared<crate::process::Thread>> {
    let entry = call
        .process
        .handles()
        .get_typed(OsHandle(raw), HandleType::Thread)?;
    match &entry.object {
        ObjectRef::Thread(thread) => Ok(thread.clone()),
        _ => Err(OsStatus::InvalidType),
    }
}

/// 0x42: suspend, resume, or terminate a thread.
pub fn thread_control(
    call: &CallContext,
    arg0: u64,
    arg1: u64,
    _arg2: u64,
    _arg3: u64,
) -> OsResult<u64> {
    let thread = thread_of(call, arg0)?;

    match arg1 {
        THREAD_SUSPEND => match thread.state() {
            ThreadState::Finished | ThreadState::Orphaned => Err(OsStatus::Completed),
            _ => {
                thread.set_state(ThreadState::Suspended);
                Ok(0)
            }
        },
        THREAD_RESUME => {
            if thread.transition(ThreadState::Suspended, ThreadState::Queued) {
                scheduler().enqueue(&thread);
                Ok(0)
            } else {
                Err(OsStatus::InvalidData)
            }
        }
        THREAD_TERMINATE => {
            thread.finish();
            Ok(0)
        }
        _ => Err(OsStatus::InvalidInput),
    }
}

/// 0x43: tear a thread down.
pub fn thread_destroy(
    call: &CallContext,
    arg0: u64,
    _arg1: u64,
    _arg2: u64,
    _arg3: u64,
) -> OsResult<u64> {
    let thread = thread_of(call, arg0)?;
    thread.finish();
    Ok(0)
}
