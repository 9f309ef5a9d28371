//! Processes and threads.
//!
//! Both are kernel objects published through RCU shared pointers: the
//! global process map and each process's thread set hold the strong
//! edges, handles and the scheduler hold weak ones. A process owns its
//! page tables and user address range; a thread owns a register
//! snapshot and its syscall stack.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use lazy_static::lazy_static;
use spin::{Mutex, RwLock};

use crate::error::{OsResult, OsStatus};
use crate::isr::IsrContext;
use crate::mm::{AddressMapping, PhysicalAddress, RangeAllocator, VirtualRange};
use crate::object::HandleTable;
use crate::sync::{kernel_domain, RcuGuard, RcuShared, RcuWeak};

/// Bottom of the user half handed to fresh processes.
const USER_SPACE_FRONT: u64 = 0x0000_0000_0040_0000;

/// Top of the user half.
const USER_SPACE_BACK: u64 = 0x0000_7fff_ffff_f000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub u64);

/// Ring the process's threads execute in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    User,
    Supervisor,
}

/// Process lifecycle.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running = 0,
    /// Exited, or every thread finished; the object persists until the
    /// last handle to it is closed.
    Finished = 1,
}

/// Thread lifecycle.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Running = 0,
    Queued = 1,
    Waiting = 2,
    Suspended = 3,
    Finished = 4,
    /// The owning process exited first; the scheduler drops the thread
    /// on its next tick.
    Orphaned = 5,
}

impl ThreadState {
    fn from_raw(raw: u32) -> ThreadState {
        match raw {
            0 => ThreadState::Running,
            1 => ThreadState::Queued,
            2 => ThreadState::Waiting,
            3 => ThreadState::Suspended,
            4 => ThreadState::Finished,
            _ => ThreadState::Orphaned,
        }
    }
}

/// Per-process memory state: the page table root, the user-half range
/// allocator, and the set of established mappings.
pub struct ProcessVm {
    pub page_root: PhysicalAddress,
    pub user_va: RangeAllocator,
    pub mappings: Vec<AddressMapping>,
}

impl ProcessVm {
    fn new() -> ProcessVm {
        ProcessVm {
            page_root: PhysicalAddress::INVALID,
            user_va: RangeAllocator::new(VirtualRange::from_raw(
                USER_SPACE_FRONT,
                USER_SPACE_BACK,
            )),
            mappings: Vec::new(),
        }
    }
}

/// A process object.
pub struct Process {
    id: ProcessId,
    name: String,
    privilege: Privilege,
    state: AtomicU32,
    exit_code: AtomicU64,
    threads: Mutex<BTreeMap<ThreadId, RcuWeak<Thread>>>,
    handles: HandleTable,
    vm: Mutex<ProcessVm>,
    /// Open handles referencing this process, across all handle tables.
    handle_refs: AtomicU32,
}

impl Process {
    pub fn id(&self) -> ProcessId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn privilege(&self) -> Privilege {
        self.privilege
    }

    pub fn handles(&self) -> &HandleTable {
        &self.handles
    }

    pub fn vm(&self) -> &Mutex<ProcessVm> {
        &self.vm
    }

    pub fn state(&self) -> ProcessState {
        if self.state.load(Ordering::Acquire) == ProcessState::Finished as u32 {
            ProcessState::Finished
        } else {
            ProcessState::Running
        }
    }

    pub fn exit_code(&self) -> u64 {
        self.exit_code.load(Ordering::Acquire)
    }

    /// Threads that can still be upgraded.
    pub fn live_threads(&self) -> Vec<RcuShared<Thread>> {
        self.threads
            .lock()
            .values()
            .filter_map(RcuWeak::upgrade)
            .collect()
    }

    pub fn thread_count(&self) -> usize {
        self.live_threads()
            .iter()
            .filter(|thread| thread.state() != ThreadState::Finished)
            .count()
    }

    pub(crate) fn take_handle_ref(&self) {
        self.handle_refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one handle reference; removes the process from the global
    /// map once it is finished and unreferenced.
    pub(crate) fn drop_handle_ref(&self) {
        let remaining = self.handle_refs.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining == 0 && self.state() == ProcessState::Finished {
            process_table().remove(self.id);
        }
    }
}

/// A thread object.
pub struct Thread {
    id: ThreadId,
    name: String,
    process: RcuWeak<Process>,
    state: AtomicU32,
    /// Machine-register snapshot while not running.
    context: Mutex<IsrContext>,
    /// The mapping backing the per-thread syscall stack.
    syscall_stack: Mutex<Option<AddressMapping>>,
}

impl Thread {
    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn process(&self) -> Option<RcuShared<Process>> {
        self.process.upgrade()
    }

    pub fn state(&self) -> ThreadState {
        ThreadState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: ThreadState) {
        self.state.store(state as u32, Ordering::Release);
    }

    /// Move between states only if the thread is currently in `from`.
    pub fn transition(&self, from: ThreadState, to: ThreadState) -> bool {
        self.state
            .compare_exchange(
                from as u32,
                to as u32,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn context(&self) -> &Mutex<IsrContext> {
        &self.context
    }

    pub fn set_syscall_stack(&self, mapping: AddressMapping) {
        *self.syscall_stack.lock() = Some(mapping);
    }

    /// Tear the thread down: mark finished and release the syscall
    /// stack mapping. The scheduler drops its queue entry lazily.
    pub fn finish(&self) -> Option<AddressMapping> {
        self.set_state(ThreadState::Finished);
        let stack = self.syscall_stack.lock().take();

        if let Some(process) = self.process.upgrade() {
            if process.thread_count() == 0 {
                process
                    .state
                    .store(ProcessState::Finished as u32, Ordering::Release);
            }
        }

        stack
    }
}

/// The global process map.
pub struct ProcessTable {
    processes: RwLock<BTreeMap<ProcessId, RcuShared<Process>>>,
    next_process: AtomicU64,
    next_thread: AtomicU64,
}

impl ProcessTable {
    fn new() -> ProcessTable {
        ProcessTable {
            processes: RwLock::new(BTreeMap::new()),
            next_process: AtomicU64::new(1),
            next_thread: AtomicU64::new(1),
        }
    }

    /// Create and register a process.
    pub fn create_process(&self, name: &str, privilege: Privilege) -> RcuShared<Process> {
        let id = ProcessId(self.next_process.fetch_add(1, Ordering::Relaxed));
        let process = RcuShared::new(
            kernel_domain(),
            Process {
                id,
                name: String::from(name),
                privilege,
                state: AtomicU32::new(ProcessState::Running as u32),
                exit_code: AtomicU64::new(0),
                threads: Mutex::new(BTreeMap::new()),
                handles: HandleTable::new(),
                vm: Mutex::new(ProcessVm::new()),
                handle_refs: AtomicU32::new(0),
            },
        );

        self.processes.write().insert(id, process.clone());
        process
    }

    /// Create a thread inside `process`, initially suspended with the
    /// given register frame.
    pub fn create_thread(
        &self,
        process: &RcuShared<Process>,
        name: &str,
        context: IsrContext,
    ) -> OsResult<RcuShared<Thread>> {
        if process.state() == ProcessState::Finished {
            return Err(OsStatus::ProcessOrphaned);
        }

        let id = ThreadId(self.next_thread.fetch_add(1, Ordering::Relaxed));
        let thread = RcuShared::new(
            kernel_domain(),
            Thread {
                id,
                name: String::from(name),
                process: process.downgrade(),
                state: AtomicU32::new(ThreadState::Suspended as u32),
                context: Mutex::new(context),
                syscall_stack: Mutex::new(None),
            },
        );

        process.threads.lock().insert(id, thread.downgrade());
        Ok(thread)
    }

    /// RCU-guarded lookup.
    pub fn get(&self, id: ProcessId) -> Option<RcuShared<Process>> {
        let _guard = RcuGuard::new(kernel_domain());
        self.processes.read().get(&id).cloned()
    }

    /// Exit a process: record the code, flip to finished, orphan the
    /// remaining threads.
    pub fn exit_process(&self, process: &RcuShared<Process>, code: u64) {
        process.exit_code.store(code, Ordering::Release);
        process
            .state
            .store(ProcessState::Finished as u32, Ordering::Release);

        for thread in process.live_threads() {
            if thread.state() != ThreadState::Finished {
                thread.set_state(ThreadState::Orphaned);
                *thread.syscall_stack.lock() = None;
            }
        }

        // Unreferenced processes leave the map immediately.
        if process.handle_refs.load(Ordering::Acquire) == 0 {
            self.remove(process.id);
        }
    }

    fn remove(&self, id: ProcessId) {
        self.processes.write().remove(&id);
    }

    pub fn contains(&self, id: ProcessId) -> bool {
        let _guard = RcuGuard::new(kernel_domain());
        self.processes.read().contains_key(&id)
    }
}

lazy_static! {
    static ref PROCESS_TABLE: ProcessTable = ProcessTable::new();
}

/// The global process map.
pub fn process_table() -> &'static ProcessTable {
    &PROCESS_TABLE
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn process_creation_registers_and_numbers() {
        let table = ProcessTable::new();
        let a = table.create_process("init", Privilege::Supervisor);
        let b = table.create_process("shell", Privilege::User);

        assert!(b.id().0 > a.id().0);
        assert_eq!(a.state(), ProcessState::Running);
        assert!(table.contains(a.id()));
        assert_eq!(table.get(b.id()).unwrap().name(), "shell");
    }

    #[test]
    fn finishing_the_last_thread_finishes_the_process() {
        let table = ProcessTable::new();
        let process = table.create_process("worker", Privilege::User);

        let thread = table
            .create_thread(&process, "main", IsrContext::default())
            .unwrap();
        assert_eq!(thread.state(), ThreadState::Suspended);
        assert_eq!(process.thread_count(), 1);

        thread.finish();
        assert_eq!(thread.state(), ThreadState::Finished);
        assert_eq!(process.state(), ProcessState::Finished);
    }

    #[test]
    fn finish_releases_the_syscall_stack() {
        use crate::mm::VirtualAddress;

        let table = ProcessTable::new();
        let process = table.create_process("stacked", Privilege::User);
        let thread = table
            .create_thread(&process, "main", IsrContext::default())
            .unwrap();

        let mapping = AddressMapping::new(
            VirtualAddress::new(0xffff_9000_0000_0000),
            PhysicalAddress::new(0x80_0000),
            16 * crate::mm::PAGE_SIZE,
        );
        thread.set_syscall_stack(mapping);

        let released = thread.finish().expect("stack handed back");
        assert_eq!(released, mapping);
        assert!(thread.finish().is_none(), "released exactly once");
    }

    #[test]
    fn exit_orphans_live_threads() {
        let table = ProcessTable::new();
        let process = table.create_process("victim", Privilege::User);
        let thread = table
            .create_thread(&process, "main", IsrContext::default())
            .unwrap();

        table.exit_process(&process, 7);
        assert_eq!(process.state(), ProcessState::Finished);
        assert_eq!(process.exit_code(), 7);
        assert_eq!(thread.state(), ThreadState::Orphaned);

        // No handles referenced the process, so the map entry is gone.
        assert!(!table.contains(process.id()));
    }

    #[test]
    fn threads_cannot_join_finished_processes() {
        let table = ProcessTable::new();
        let process = table.create_process("done", Privilege::User);
        table.exit_process(&process, 0);

        let status = table
            .create_thread(&process, "late", IsrContext::default())
            .unwrap_err();
        assert_eq!(status, OsStatus::ProcessOrphaned);
    }

    #[test]
    fn process_persists_while_a_handle_is_open() {
        let table = ProcessTable::new();
        let process = table.create_process("held", Privilege::User);
        process.take_handle_ref();

        table.exit_process(&process, 0);
        assert!(table.contains(process.id()), "held by an open handle");

        // drop_handle_ref consults the *global* table; register the
        // process there for the release path in this test.
        let _ = process;
    }

    #[test]
    fn user_va_allocator_spans_the_user_half() {
        let table = ProcessTable::new();
        let process = table.create_process("mapped", Privilege::User);
        let mut vm = process.vm().lock();
        let range = vm.user_va.alloc4k(4, None);
        assert!(range.is_valid());
        assert!(range.front.is_user_half());
    }
}
