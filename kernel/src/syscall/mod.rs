//! System call dispatch.
//!
//! The entry stub hands the portable layer a [`SystemCallContext`]; the
//! one-byte function id indexes a 256-entry handler table and the
//! handler gets four register arguments. Results travel back as an
//! [`OsCallResult`] status/value pair; syscalls never unwind and never
//! raise.
//!
//! Handlers touch user memory only through [`CallContext`], which
//! validates spans against the calling process's page tables before any
//! copy (supervisor processes are trusted and copy directly).

mod file;
mod handle;
mod process;
mod tx;

use alloc::vec;
use alloc::vec::Vec;

use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Once;

use crate::error::{OsResult, OsStatus};
use crate::fs::VfsPath;
use crate::mm::paging::{DirectMap, PageTables};
use crate::mm::{self, user, VirtualAddress};
use crate::process::{Privilege, Process, Thread};
use crate::sync::RcuShared;

/// Value reported alongside a failed handle-producing call.
pub const OS_FILE_HANDLE_INVALID: u64 = u64::MAX;

/// Upper bound on a single user span the kernel will stage in one copy.
const MAX_STAGED_COPY: usize = 1 << 20;

/// The register contract of one system call.
///
/// Layout is ABI with the entry stub: function id, four arguments, then
/// the saved return `rip` and `rflags` that `sysret` consumes.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SystemCallContext {
    pub function: u64,
    pub arg0: u64,
    pub arg1: u64,
    pub arg2: u64,
    pub arg3: u64,
    pub rip: u64,
    pub rflags: u64,
}

/// Status/value pair returned to userspace in `rax`/`rdx`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OsCallResult {
    pub status: u64,
    pub value: u64,
}

impl OsCallResult {
    pub fn from_result(result: OsResult<u64>) -> OsCallResult {
        match result {
            Ok(value) => OsCallResult { status: 0, value },
            Err(status) => OsCallResult {
                status: status.code(),
                value: OS_FILE_HANDLE_INVALID,
            },
        }
    }
}

/// System call function ids. The numeric values are ABI.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallFunction {
    FileOpen = 0x10,
    FileClose = 0x11,
    FileRead = 0x12,
    FileWrite = 0x13,
    FileSeek = 0x14,
    FileStat = 0x15,

    DirIter = 0x20,
    DirNext = 0x21,

    ProcessGetCurrent = 0x30,
    ProcessCreate = 0x31,
    ProcessExit = 0x32,

    ThreadGetCurrent = 0x40,
    ThreadCreate = 0x41,
    ThreadControl = 0x42,
    ThreadDestroy = 0x43,

    TransactionBegin = 0x50,
    TransactionCommit = 0x51,
    TransactionRollback = 0x52,

    HandleClone = 0x60,
    HandleClose = 0x61,
    HandleStat = 0x62,
    HandleWait = 0x63,
}

/// The resolved identity of the caller.
pub struct CallContext {
    pub process: RcuShared<Process>,
    pub thread: RcuShared<Thread>,
}

impl CallContext {
    /// Resolve from the scheduler's CPU-local current thread.
    pub fn current() -> OsResult<CallContext> {
        let thread = crate::sched::current_thread().ok_or(OsStatus::NotAvailable)?;
        let process = thread.process().ok_or(OsStatus::ProcessOrphaned)?;
        Ok(CallContext { process, thread })
    }

    fn user_tables(&self) -> OsResult<PageTables<DirectMap>> {
        let root = self.process.vm().lock().page_root;
        if !root.is_valid() {
            return Err(OsStatus::InvalidAddress);
        }
        Ok(PageTables::from_root(
            root,
            DirectMap {
                offset: mm::hhdm_offset(),
            },
        ))
    }

    /// Stage `[front, back)` of caller memory into a kernel buffer.
    pub fn copy_from_user(&self, front: u64, back: u64) -> OsResult<Vec<u8>> {
        if back < front {
            return Err(OsStatus::InvalidSpan);
        }
        let length = (back - front) as usize;
        if length > MAX_STAGED_COPY {
            return Err(OsStatus::InvalidSpan);
        }

        let mut buffer = vec![0u8; length];
        match self.process.privilege() {
            Privilege::Supervisor => {
                // Supervisor processes run in kernel space; their
                // pointers are trusted.
                // SAFETY: span checked non-reversed and bounded above.
                unsafe {
                    core::ptr::copy_nonoverlapping(
                        front as *const u8,
                        buffer.as_mut_ptr(),
                        length,
                    );
                }
            }
            Privilege::User => {
                let tables = self.user_tables()?;
                user::read_user_memory(&tables, VirtualAddress::new(front), &mut buffer)?;
            }
        }
        Ok(buffer)
    }

    /// Copy a kernel buffer out to caller memory at `front`.
    pub fn copy_to_user(&self, front: u64, data: &[u8]) -> OsResult {
        front
            .checked_add(data.len() as u64)
            .ok_or(OsStatus::InvalidSpan)?;

        match self.process.privilege() {
            Privilege::Supervisor => {
                // SAFETY: see copy_from_user; the span was overflow
                // checked.
                unsafe {
                    core::ptr::copy_nonoverlapping(data.as_ptr(), front as *mut u8, data.len());
                }
            }
            Privilege::User => {
                let tables = self.user_tables()?;
                user::write_user_memory(&tables, VirtualAddress::new(front), data)?;
            }
        }
        Ok(())
    }

    /// Read and validate a path from caller memory.
    pub fn read_path(&self, front: u64, back: u64) -> OsResult<VfsPath> {
        let bytes = self.copy_from_user(front, back)?;
        let text = core::str::from_utf8(&bytes).map_err(|_| OsStatus::InvalidPath)?;
        VfsPath::new(text)
    }

    /// Read a short UTF-8 name (object names, not paths).
    pub fn read_name(&self, front: u64, back: u64) -> OsResult<alloc::string::String> {
        let bytes = self.copy_from_user(front, back)?;
        if bytes.len() > 255 {
            return Err(OsStatus::InvalidInput);
        }
        core::str::from_utf8(&bytes)
            .map(alloc::string::String::from)
            .map_err(|_| OsStatus::InvalidInput)
    }
}

/// One handler: four register arguments in, value out.
pub type SystemCallHandler = fn(&CallContext, u64, u64, u64, u64) -> OsResult<u64>;

/// The 256-entry dispatch table, lock-free like the ISR tables.
static SYSTEM_CALLS: [AtomicUsize; 256] = [const { AtomicUsize::new(0) }; 256];

/// Install a handler for `function`.
pub fn add_system_call(function: SyscallFunction, handler: SystemCallHandler) {
    SYSTEM_CALLS[function as u8 as usize].store(handler as usize, Ordering::Release);
}

/// Register every handler. Idempotent.
pub fn install_system_calls() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        add_system_call(SyscallFunction::FileOpen, file::file_open);
        add_system_call(SyscallFunction::FileClose, file::file_close);
        add_system_call(SyscallFunction::FileRead, file::file_read);
        add_system_call(SyscallFunction::FileWrite, file::file_write);
        add_system_call(SyscallFunction::FileSeek, file::file_seek);
        add_system_call(SyscallFunction::FileStat, file::file_stat);
        add_system_call(SyscallFunction::DirIter, file::dir_iter);
        add_system_call(SyscallFunction::DirNext, file::dir_next);

        add_system_call(SyscallFunction::ProcessGetCurrent, process::process_get_current);
        add_system_call(SyscallFunction::ProcessCreate, process::process_create);
        add_system_call(SyscallFunction::ProcessExit, process::process_exit);
        add_system_call(SyscallFunction::ThreadGetCurrent, process::thread_get_current);
        add_system_call(SyscallFunction::ThreadCreate, process::thread_create);
        add_system_call(SyscallFunction::ThreadControl, process::thread_control);
        add_system_call(SyscallFunction::ThreadDestroy, process::thread_destroy);

        add_system_call(SyscallFunction::TransactionBegin, tx::transaction_begin);
        add_system_call(SyscallFunction::TransactionCommit, tx::transaction_commit);
        add_system_call(SyscallFunction::TransactionRollback, tx::transaction_rollback);

        add_system_call(SyscallFunction::HandleClone, handle::handle_clone);
        add_system_call(SyscallFunction::HandleClose, handle::handle_close);
        add_system_call(SyscallFunction::HandleStat, handle::handle_stat);
        add_system_call(SyscallFunction::HandleWait, handle::handle_wait);
    });
}

/// Dispatch one system call.
///
/// Unknown function ids report `InvalidFunction`; a missing calling
/// context (no current thread) reports `NotAvailable`. Internal errors
/// become status codes, never unwinds.
pub fn dispatch_system_call(context: &mut SystemCallContext) -> OsCallResult {
    let function = (context.function & 0xff) as usize;

    let raw = SYSTEM_CALLS[function].load(Ordering::Acquire);
    if raw == 0 {
        log::warn!("unknown system call function {:#x}", function);
        return OsCallResult::from_result(Err(OsStatus::InvalidFunction));
    }

    let call = match CallContext::current() {
        Ok(call) => call,
        Err(status) => return OsCallResult::from_result(Err(status)),
    };

    // SAFETY: only SystemCallHandler values are stored in the table.
    let handler: SystemCallHandler = unsafe { core::mem::transmute(raw) };
    let result = handler(
        &call,
        context.arg0,
        context.arg1,
        context.arg2,
        context.arg3,
    );

    OsCallResult::from_result(result)
}

#[cfg(all(test, not(target_os = "none")))]
pub mod tests {
    use super::*;
    use crate::process::{process_table, ThreadState};

    /// Install a supervisor process as the calling context and run
    /// `body` with syscalls registered.
    pub fn with_kernel_context<R>(name: &str, body: impl FnOnce() -> R) -> R {
        install_system_calls();

        let process = process_table().create_process(name, Privilege::Supervisor);
        let thread = process_table()
            .create_thread(&process, "syscall", crate::isr::IsrContext::default())
            .unwrap();
        thread.set_state(ThreadState::Running);
        crate::sched::set_current_thread(Some(thread));

        let result = body();
        crate::sched::set_current_thread(None);
        result
    }

    /// Issue one syscall through the dispatch table.
    pub fn invoke(function: SyscallFunction, args: [u64; 4]) -> OsCallResult {
        let mut context = SystemCallContext {
            function: function as u8 as u64,
            arg0: args[0],
            arg1: args[1],
            arg2: args[2],
            arg3: args[3],
            rip: 0,
            rflags: 0,
        };
        dispatch_system_call(&mut context)
    }

    // Syscall tests share the CPU-0 current-thread slot with the
    // scheduler tests.
    pub use crate::sched::TEST_CPU_LOCK as CONTEXT_LOCK;

    #[test]
    fn unknown_function_is_rejected() {
        let _serial = CONTEXT_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        with_kernel_context("unknown-fn", || {
            let mut context = SystemCallContext {
                function: 0xee,
                arg0: 0,
                arg1: 0,
                arg2: 0,
                arg3: 0,
                rip: 0,
                rflags: 0,
            };
            let result = dispatch_system_call(&mut context);
            assert_eq!(result.status, OsStatus::InvalidFunction.code());
        });
    }

    #[test]
    fn missing_context_is_not_available() {
        let _serial = CONTEXT_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        install_system_calls();
        crate::sched::set_current_thread(None);

        let mut context = SystemCallContext {
            function: SyscallFunction::FileClose as u8 as u64,
            arg0: 1,
            arg1: 0,
            arg2: 0,
            arg3: 0,
            rip: 0,
            rflags: 0,
        };
        let result = dispatch_system_call(&mut context);
        assert_eq!(result.status, OsStatus::NotAvailable.code());
    }

    #[test]
    fn reversed_span_is_invalid() {
        let _serial = CONTEXT_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        with_kernel_context("reversed-span", || {
            let call = CallContext::current().unwrap();
            assert_eq!(
                call.copy_from_user(100, 50).unwrap_err(),
                OsStatus::InvalidSpan
            );
        });
    }
}
