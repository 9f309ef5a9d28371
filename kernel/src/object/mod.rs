//! Kernel objects and handle tables.
//!
//! A handle is a `(type:8 | id:56)` identifier minted by the owning
//! process's [`HandleTable`]; ids grow monotonically within a process.
//! Entries pair the referenced object with the access rights the handle
//! was granted; cloning can only narrow rights. Lookups run under an
//! RCU guard so a concurrent close never frees an object out from under
//! a reader.

pub mod waitable;

pub use waitable::{KernelEvent, KernelMutex, Transaction};

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use core::sync::atomic::{AtomicU64, Ordering};

use spin::RwLock;

use crate::error::{OsResult, OsStatus};
use crate::fs::VfsHandle;
use crate::process::{Process, ProcessState, Thread, ThreadState};
use crate::sync::{kernel_domain, RcuGuard, RcuShared};

/// No handle.
pub const OS_HANDLE_INVALID: u64 = 0;

/// A wait that must not block.
pub const OS_TIMEOUT_INSTANT: i64 = i64::MAX;

/// A wait without bound.
pub const OS_TIMEOUT_INFINITE: i64 = 0;

/// Object type carried in the top byte of a handle.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleType {
    None = 0,
    Node = 1,
    Device = 2,
    Mutex = 3,
    Thread = 4,
    Process = 5,
    Tx = 6,
    Event = 7,
}

impl HandleType {
    pub fn from_raw(raw: u8) -> HandleType {
        match raw {
            1 => HandleType::Node,
            2 => HandleType::Device,
            3 => HandleType::Mutex,
            4 => HandleType::Thread,
            5 => HandleType::Process,
            6 => HandleType::Tx,
            7 => HandleType::Event,
            _ => HandleType::None,
        }
    }
}

/// A packed handle identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OsHandle(pub u64);

impl OsHandle {
    pub const INVALID: OsHandle = OsHandle(OS_HANDLE_INVALID);

    pub const fn new(handle_type: HandleType, id: u64) -> OsHandle {
        OsHandle(((handle_type as u64) << 56) | (id & 0x00ff_ffff_ffff_ffff))
    }

    pub fn handle_type(&self) -> HandleType {
        HandleType::from_raw((self.0 >> 56) as u8)
    }

    pub const fn id(&self) -> u64 {
        self.0 & 0x00ff_ffff_ffff_ffff
    }

    pub const fn raw(&self) -> u64 {
        self.0
    }

    pub const fn is_valid(&self) -> bool {
        self.0 != OS_HANDLE_INVALID
    }
}

bitflags::bitflags! {
    /// Rights carried by a handle entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HandleAccess: u64 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
        const STAT = 1 << 3;
        const WAIT = 1 << 4;
        const DESTROY = 1 << 5;
        /// Required on a process handle to plant handles into it.
        const IO_CONTROL = 1 << 6;
    }
}

impl HandleAccess {
    pub const ALL: HandleAccess = HandleAccess::all();
}

/// The object behind a handle entry.
#[derive(Clone)]
pub enum ObjectRef {
    Node(Arc<VfsHandle>),
    Device(Arc<VfsHandle>),
    Mutex(Arc<KernelMutex>),
    Event(Arc<KernelEvent>),
    Tx(Arc<Transaction>),
    Thread(RcuShared<Thread>),
    Process(RcuShared<Process>),
}

impl ObjectRef {
    pub fn handle_type(&self) -> HandleType {
        match self {
            ObjectRef::Node(_) => HandleType::Node,
            ObjectRef::Device(_) => HandleType::Device,
            ObjectRef::Mutex(_) => HandleType::Mutex,
            ObjectRef::Event(_) => HandleType::Event,
            ObjectRef::Tx(_) => HandleType::Tx,
            ObjectRef::Thread(_) => HandleType::Thread,
            ObjectRef::Process(_) => HandleType::Process,
        }
    }

    /// Whether the object's wait condition currently holds.
    fn is_signaled(&self) -> OsResult<bool> {
        match self {
            ObjectRef::Thread(thread) => match thread.state() {
                ThreadState::Finished => Ok(true),
                ThreadState::Orphaned => Err(OsStatus::ProcessOrphaned),
                _ => Ok(false),
            },
            ObjectRef::Process(process) => Ok(process.state() == ProcessState::Finished),
            ObjectRef::Mutex(mutex) => Ok(!mutex.is_locked()),
            ObjectRef::Event(event) => Ok(event.is_set()),
            ObjectRef::Tx(tx) => Ok(tx.is_settled()),
            ObjectRef::Node(_) | ObjectRef::Device(_) => Err(OsStatus::NotSupported),
        }
    }
}

/// One minted handle.
pub struct HandleEntry {
    pub handle: OsHandle,
    pub access: HandleAccess,
    pub object: ObjectRef,
}

impl Drop for HandleEntry {
    fn drop(&mut self) {
        if let ObjectRef::Process(process) = &self.object {
            process.drop_handle_ref();
        }
    }
}

impl core::fmt::Debug for HandleEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HandleEntry")
            .field("handle", &self.handle)
            .field("access", &self.access)
            .finish_non_exhaustive()
    }
}

/// Summary returned by `handle_stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleInfo {
    pub access: HandleAccess,
    pub handle_type: HandleType,
}

/// A process's handle namespace.
pub struct HandleTable {
    entries: RwLock<BTreeMap<u64, Arc<HandleEntry>>>,
    next_id: AtomicU64,
}

impl HandleTable {
    pub fn new() -> HandleTable {
        HandleTable {
            entries: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Mint the next id for `handle_type`. Monotonic per process.
    pub fn new_handle_id(&self, handle_type: HandleType) -> OsHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        OsHandle::new(handle_type, id)
    }

    /// Create and insert an entry for `object` with `access`.
    pub fn insert(&self, object: ObjectRef, access: HandleAccess) -> OsHandle {
        let handle = self.new_handle_id(object.handle_type());

        if let ObjectRef::Process(process) = &object {
            process.take_handle_ref();
        }

        let entry = Arc::new(HandleEntry {
            handle,
            access,
            object,
        });
        self.entries.write().insert(handle.raw(), entry);
        handle
    }

    /// RCU-guarded lookup.
    pub fn get(&self, handle: OsHandle) -> OsResult<Arc<HandleEntry>> {
        let _guard = RcuGuard::new(kernel_domain());
        self.entries
            .read()
            .get(&handle.raw())
            .cloned()
            .ok_or(OsStatus::InvalidHandle)
    }

    /// Lookup constrained to one object type.
    pub fn get_typed(&self, handle: OsHandle, expected: HandleType) -> OsResult<Arc<HandleEntry>> {
        let entry = self.get(handle)?;
        if entry.handle.handle_type() != expected {
            return Err(OsStatus::InvalidType);
        }
        Ok(entry)
    }

    /// Drop the entry; the object dies with its last reference.
    pub fn close(&self, handle: OsHandle) -> OsResult {
        self.entries
            .write()
            .remove(&handle.raw())
            .map(drop)
            .ok_or(OsStatus::InvalidHandle)
    }

    pub fn count(&self) -> usize {
        self.entries.read().len()
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Clone `source` from `table` into `target` with a subset of its
/// rights.
///
/// Widening is refused; planting the clone into a different process
/// requires `IO_CONTROL` to have been verified by the caller on that
/// process's handle.
pub fn clone_handle(
    table: &HandleTable,
    source: OsHandle,
    access: HandleAccess,
    target: &HandleTable,
) -> OsResult<OsHandle> {
    let entry = table.get(source)?;

    if !entry.access.contains(access) {
        return Err(OsStatus::AccessDenied);
    }

    Ok(target.insert(entry.object.clone(), access))
}

/// `handle_stat`: report the rights and type of an open handle.
pub fn handle_stat(table: &HandleTable, handle: OsHandle) -> OsResult<HandleInfo> {
    let entry = table.get(handle)?;
    if !entry.access.contains(HandleAccess::STAT) {
        return Err(OsStatus::AccessDenied);
    }

    Ok(HandleInfo {
        access: entry.access,
        handle_type: entry.handle.handle_type(),
    })
}

/// Block until the object behind `handle` signals.
///
/// `OS_TIMEOUT_INSTANT` polls once; `OS_TIMEOUT_INFINITE` waits without
/// bound; any other value bounds the wait and yields `Timeout` on
/// expiry.
pub fn handle_wait(table: &HandleTable, handle: OsHandle, timeout: i64) -> OsResult {
    let entry = table.get(handle)?;
    if !entry.access.contains(HandleAccess::WAIT) {
        return Err(OsStatus::AccessDenied);
    }

    if timeout == OS_TIMEOUT_INSTANT {
        return match entry.object.is_signaled()? {
            true => Ok(()),
            false => Err(OsStatus::Timeout),
        };
    }

    // Bounded waits spin a budget proportional to the request; the
    // tick-driven blocking path belongs to the scheduler's sleep queue.
    let mut budget = if timeout == OS_TIMEOUT_INFINITE {
        u64::MAX
    } else {
        (timeout as u64).max(1)
    };

    loop {
        if entry.object.is_signaled()? {
            return Ok(());
        }
        if budget == 0 {
            return Err(OsStatus::Timeout);
        }
        budget = budget.saturating_sub(1);
        core::hint::spin_loop();
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use alloc::string::ToString;

    use super::*;
    use crate::process::{process_table, Privilege};

    #[test]
    fn handle_packing() {
        let handle = OsHandle::new(HandleType::Mutex, 0x1234);
        assert_eq!(handle.handle_type(), HandleType::Mutex);
        assert_eq!(handle.id(), 0x1234);
        assert_eq!(handle.raw() >> 56, 3);
        assert!(!OsHandle::INVALID.is_valid());
    }

    #[test]
    fn ids_grow_monotonically_per_table() {
        let table = HandleTable::new();
        let event = Arc::new(KernelEvent::new("tick".to_string()));

        let a = table.insert(ObjectRef::Event(event.clone()), HandleAccess::ALL);
        let b = table.insert(ObjectRef::Event(event), HandleAccess::ALL);
        assert!(b.id() > a.id());
        assert_eq!(table.count(), 2);
    }

    #[test]
    fn close_invalidates_the_handle() {
        let table = HandleTable::new();
        let event = Arc::new(KernelEvent::new("gone".to_string()));
        let handle = table.insert(ObjectRef::Event(event), HandleAccess::ALL);

        table.close(handle).unwrap();
        assert_eq!(table.get(handle).unwrap_err(), OsStatus::InvalidHandle);
        assert_eq!(table.close(handle).unwrap_err(), OsStatus::InvalidHandle);
    }

    #[test]
    fn clone_narrows_rights_only() {
        let table = HandleTable::new();
        let event = Arc::new(KernelEvent::new("shared".to_string()));
        let source = table.insert(
            ObjectRef::Event(event),
            HandleAccess::READ | HandleAccess::WAIT,
        );

        let narrowed = clone_handle(&table, source, HandleAccess::READ, &table).unwrap();
        assert_eq!(
            handle_stat(&table, narrowed).unwrap_err(),
            OsStatus::AccessDenied
        );

        let widen = clone_handle(&table, source, HandleAccess::ALL, &table).unwrap_err();
        assert_eq!(widen, OsStatus::AccessDenied);
    }

    #[test]
    fn wait_on_an_event() {
        let table = HandleTable::new();
        let event = Arc::new(KernelEvent::new("signal".to_string()));
        let handle = table.insert(ObjectRef::Event(event.clone()), HandleAccess::ALL);

        assert_eq!(
            handle_wait(&table, handle, OS_TIMEOUT_INSTANT).unwrap_err(),
            OsStatus::Timeout
        );

        event.set();
        handle_wait(&table, handle, OS_TIMEOUT_INSTANT).unwrap();
        handle_wait(&table, handle, OS_TIMEOUT_INFINITE).unwrap();
    }

    #[test]
    fn wait_reports_orphaned_threads() {
        let process = process_table().create_process("orphan-holder", Privilege::User);
        let thread = process_table()
            .create_thread(&process, "child", crate::isr::IsrContext::default())
            .unwrap();

        let table = HandleTable::new();
        let handle = table.insert(ObjectRef::Thread(thread.clone()), HandleAccess::ALL);

        process_table().exit_process(&process, 1);
        assert_eq!(
            handle_wait(&table, handle, OS_TIMEOUT_INSTANT).unwrap_err(),
            OsStatus::ProcessOrphaned
        );
    }

    #[test]
    fn wait_succeeds_on_finished_threads() {
        let process = process_table().create_process("joiner", Privilege::User);
        let thread = process_table()
            .create_thread(&process, "worker", crate::isr::IsrContext::default())
            .unwrap();

        let table = HandleTable::new();
        let handle = table.insert(ObjectRef::Thread(thread.clone()), HandleAccess::ALL);

        thread.finish();
        handle_wait(&table, handle, OS_TIMEOUT_INSTANT).unwrap();
    }

    #[test]
    fn finished_process_lives_until_its_handle_closes() {
        let process = process_table().create_process("zombie", Privilege::User);
        let table = HandleTable::new();
        let handle = table.insert(ObjectRef::Process(process.clone()), HandleAccess::ALL);

        process_table().exit_process(&process, 3);
        assert!(process_table().contains(process.id()));

        handle_wait(&table, handle, OS_TIMEOUT_INSTANT).unwrap();
        table.close(handle).unwrap();
        assert!(!process_table().contains(process.id()));
    }
}
