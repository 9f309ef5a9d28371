//! CPU-local state.
//!
//! Every CPU owns a slot in each [`CpuLocal`]; nothing CPU-local is ever
//! shared across CPUs, so the per-slot lock is uncontended and exists
//! only to give the container interior mutability. On bare metal the
//! slot index comes from the per-CPU id installed at bring-up; host
//! tests run as CPU 0.

pub mod ipl;

use spin::Mutex;

pub use ipl::{enforce_ipl, lower_ipl, raise_ipl, Ipl, IplToken, DISPATCH, PASSIVE};

/// Upper bound on supported CPUs.
pub const MAX_CPUS: usize = 16;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod id {
    use core::sync::atomic::{AtomicUsize, Ordering};

    /// Installed once per CPU at bring-up, before any CpuLocal access.
    static CPU_ID: AtomicUsize = AtomicUsize::new(0);

    pub fn current_cpu_id() -> usize {
        CPU_ID.load(Ordering::Relaxed)
    }

    pub fn install_cpu_id(id: usize) {
        CPU_ID.store(id, Ordering::Relaxed);
    }
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
mod id {
    pub fn current_cpu_id() -> usize {
        0
    }

    pub fn install_cpu_id(_id: usize) {}
}

pub use id::{current_cpu_id, install_cpu_id};

/// A value instantiated per CPU.
///
/// Slots start empty; CPU bring-up populates them. The accessor takes a
/// closure rather than returning a reference so the slot lock cannot be
/// held across a suspension point.
pub struct CpuLocal<T> {
    slots: [Mutex<Option<T>>; MAX_CPUS],
}

impl<T> CpuLocal<T> {
    pub const fn new() -> CpuLocal<T> {
        CpuLocal {
            slots: [const { Mutex::new(None) }; MAX_CPUS],
        }
    }

    /// Run `body` over this CPU's slot.
    pub fn with<R>(&self, body: impl FnOnce(&mut Option<T>) -> R) -> R {
        let mut slot = self.slots[current_cpu_id()].lock();
        body(&mut slot)
    }

    /// Replace this CPU's value, returning the old one.
    pub fn replace(&self, value: Option<T>) -> Option<T> {
        self.with(|slot| core::mem::replace(slot, value))
    }

    /// Install this CPU's value at bring-up.
    pub fn init(&self, value: T) {
        self.with(|slot| {
            debug_assert!(slot.is_none(), "cpu-local slot initialised twice");
            *slot = Some(value);
        });
    }
}

impl<T: Clone> CpuLocal<T> {
    /// Clone this CPU's value out of the slot.
    pub fn get(&self) -> Option<T> {
        self.with(|slot| slot.clone())
    }
}

impl<T> Default for CpuLocal<T> {
    fn default() -> Self {
        Self::new()
    }
}
