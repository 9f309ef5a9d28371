//! Named waitable objects: mutexes and events.
//!
//! Both are plain kernel objects reachable through handles; their
//! signalled condition feeds `handle_wait`. A mutex is signalled while
//! unowned, an event while set.

use alloc::string::String;

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::error::{OsResult, OsStatus};
use crate::process::ThreadId;

/// A named mutual-exclusion object.
pub struct KernelMutex {
    name: String,
    /// Owning thread id; zero when free.
    owner: AtomicU64,
}

impl KernelMutex {
    pub fn new(name: String) -> KernelMutex {
        KernelMutex {
            name,
            owner: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Take the mutex for `thread` without blocking.
    pub fn try_lock(&self, thread: ThreadId) -> bool {
        self.owner
            .compare_exchange(0, thread.0, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Take the mutex for `thread`, spinning until the holder releases
    /// it. A suspension point.
    pub fn lock(&self, thread: ThreadId) {
        while !self.try_lock(thread) {
            core::hint::spin_loop();
        }
    }

    /// Release; only the owner may unlock.
    pub fn unlock(&self, thread: ThreadId) -> OsResult {
        self.owner
            .compare_exchange(thread.0, 0, Ordering::Release, Ordering::Relaxed)
            .map(drop)
            .map_err(|_| OsStatus::AccessDenied)
    }

    pub fn is_locked(&self) -> bool {
        self.owner.load(Ordering::Acquire) != 0
    }
}

/// A named manual-reset event.
pub struct KernelEvent {
    name: String,
    set: AtomicBool,
}

impl KernelEvent {
    pub fn new(name: String) -> KernelEvent {
        KernelEvent {
            name,
            set: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set(&self) {
        self.set.store(true, Ordering::Release);
    }

    pub fn reset(&self) {
        self.set.store(false, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.set.load(Ordering::Acquire)
    }
}

/// A transaction object. The isolation modes are carried verbatim; the
/// backing store that would honour them is a collaborator, so commit
/// and rollback only settle the object's lifecycle.
pub struct Transaction {
    name: String,
    mode: u64,
    state: AtomicU64,
}

/// Transaction lifecycle values.
const TX_ACTIVE: u64 = 0;
const TX_COMMITTED: u64 = 1;
const TX_ROLLED_BACK: u64 = 2;

impl Transaction {
    pub fn new(name: String, mode: u64) -> Transaction {
        Transaction {
            name,
            mode,
            state: AtomicU64::new(TX_ACTIVE),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Raw mode bits: low two bits read isolation, next two write
    /// isolation.
    pub fn mode(&self) -> u64 {
        self.mode
    }

    pub fn read_isolation(&self) -> u64 {
        self.mode & 0b11
    }

    pub fn write_isolation(&self) -> u64 {
        (self.mode >> 2) & 0b11
    }

    pub fn commit(&self) -> OsResult {
        self.state
            .compare_exchange(TX_ACTIVE, TX_COMMITTED, Ordering::AcqRel, Ordering::Acquire)
            .map(drop)
            .map_err(|_| OsStatus::Completed)
    }

    pub fn rollback(&self) -> OsResult {
        self.state
            .compare_exchange(
                TX_ACTIVE,
                TX_ROLLED_BACK,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(drop)
            .map_err(|_| OsStatus::Completed)
    }

    pub fn is_settled(&self) -> bool {
        self.state.load(Ordering::Acquire) != TX_ACTIVE
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use alloc::string::ToString;

    use super::*;

    #[test]
    fn mutex_ownership() {
        let mutex = KernelMutex::new("gate".to_string());
        let a = ThreadId(1);
        let b = ThreadId(2);

        assert!(mutex.try_lock(a));
        assert!(!mutex.try_lock(b));
        assert_eq!(mutex.unlock(b).unwrap_err(), OsStatus::AccessDenied);
        mutex.unlock(a).unwrap();
        assert!(mutex.try_lock(b));
    }

    #[test]
    fn event_set_reset() {
        let event = KernelEvent::new("ready".to_string());
        assert!(!event.is_set());
        event.set();
        assert!(event.is_set());
        event.reset();
        assert!(!event.is_set());
    }

    #[test]
    fn transactions_settle_once() {
        let tx = Transaction::new("batch".to_string(), 0b0110);
        assert_eq!(tx.read_isolation(), 0b10);
        assert_eq!(tx.write_isolation(), 0b01);

        tx.commit().unwrap();
        assert!(tx.is_settled());
        assert_eq!(tx.commit().unwrap_err(), OsStatus::Completed);
        assert_eq!(tx.rollback().unwrap_err(), OsStatus::Completed);
    }
}
