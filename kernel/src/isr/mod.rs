//! Interrupt dispatch.
//!
//! All 256 vectors funnel through one register-frame layout,
//! [`IsrContext`]. Exception vectors (0–31) are routed through the
//! global [`SharedIsrTable`], installed once at boot and read-only
//! afterwards; everything else goes through the current CPU's
//! [`LocalIsrTable`], which hands out vectors dynamically for the timer,
//! IPIs, and device interrupts.
//!
//! Handlers receive the saved frame and may mutate it; whatever the
//! frame contains when the handler returns is what gets restored, which
//! is how the scheduler switches threads from a timer tick.

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub mod idt;

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::cpu::{current_cpu_id, MAX_CPUS};
use crate::error::{OsResult, OsStatus};

/// Number of architectural exception vectors.
pub const EXCEPTION_COUNT: usize = 32;

/// Total interrupt vectors.
pub const VECTOR_COUNT: usize = 256;

/// Saved register frame, in push order of the entry stub.
///
/// The layout is ABI: the entry stubs build it and restore from it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct IsrContext {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rbp: u64,
    pub vector: u64,
    pub error: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl IsrContext {
    /// Whether the frame was captured in ring 3.
    pub fn is_user_frame(&self) -> bool {
        self.cs & 0b11 != 0
    }
}

/// An interrupt handler. Mutating the context redirects the return.
pub type IsrCallback = fn(&mut IsrContext);

fn default_handler(context: &mut IsrContext) {
    log::warn!(
        "unhandled interrupt: vector {} error {:#x} rip {:#x}",
        context.vector,
        context.error,
        context.rip
    );
}

/// A vector-indexed table of handler pointers.
///
/// Slots are atomics so dispatch never takes a lock; an empty slot runs
/// the logging default handler.
struct IsrSlots<const N: usize> {
    slots: [AtomicUsize; N],
}

impl<const N: usize> IsrSlots<N> {
    const fn new() -> IsrSlots<N> {
        IsrSlots {
            slots: [const { AtomicUsize::new(0) }; N],
        }
    }

    fn install(&self, index: usize, handler: IsrCallback) {
        self.slots[index].store(handler as usize, Ordering::Release);
    }

    fn clear(&self, index: usize) {
        self.slots[index].store(0, Ordering::Release);
    }

    fn invoke(&self, index: usize, context: &mut IsrContext) {
        let raw = self.slots[index].load(Ordering::Acquire);
        if raw == 0 {
            default_handler(context);
        } else {
            // SAFETY: only IsrCallback values are ever stored.
            let handler: IsrCallback = unsafe { core::mem::transmute(raw) };
            handler(context);
        }
    }

    fn is_installed(&self, index: usize) -> bool {
        self.slots[index].load(Ordering::Acquire) != 0
    }
}

/// Exception table shared by every CPU. Installed at boot, read-only
/// thereafter.
pub struct SharedIsrTable {
    slots: IsrSlots<EXCEPTION_COUNT>,
}

impl SharedIsrTable {
    pub const fn new() -> SharedIsrTable {
        SharedIsrTable {
            slots: IsrSlots::new(),
        }
    }

    /// Install the handler for an exception vector.
    pub fn install(&self, vector: u8, handler: IsrCallback) {
        assert!((vector as usize) < EXCEPTION_COUNT);
        self.slots.install(vector as usize, handler);
    }

    pub fn invoke(&self, context: &mut IsrContext) {
        self.slots.invoke(context.vector as usize, context);
    }
}

impl Default for SharedIsrTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-CPU table for the non-exception vectors.
pub struct LocalIsrTable {
    slots: IsrSlots<VECTOR_COUNT>,
}

impl LocalIsrTable {
    pub const fn new() -> LocalIsrTable {
        LocalIsrTable {
            slots: IsrSlots::new(),
        }
    }

    /// Claim a free vector and install `handler` on it.
    pub fn allocate(&self, handler: IsrCallback) -> OsResult<u8> {
        for vector in EXCEPTION_COUNT..VECTOR_COUNT {
            if !self.slots.is_installed(vector) {
                self.slots.install(vector, handler);
                return Ok(vector as u8);
            }
        }
        Err(OsStatus::NotAvailable)
    }

    /// Install a handler on a specific vector.
    pub fn install(&self, vector: u8, handler: IsrCallback) {
        assert!(vector as usize >= EXCEPTION_COUNT);
        self.slots.install(vector as usize, handler);
    }

    /// Release a previously allocated vector.
    pub fn release(&self, vector: u8) {
        assert!(vector as usize >= EXCEPTION_COUNT);
        self.slots.clear(vector as usize);
    }

    pub fn invoke(&self, context: &mut IsrContext) {
        self.slots.invoke(context.vector as usize, context);
    }
}

impl Default for LocalIsrTable {
    fn default() -> Self {
        Self::new()
    }
}

static SHARED_ISR_TABLE: SharedIsrTable = SharedIsrTable::new();
static LOCAL_ISR_TABLES: [LocalIsrTable; MAX_CPUS] = [const { LocalIsrTable::new() }; MAX_CPUS];

/// The global exception table.
pub fn shared_isr_table() -> &'static SharedIsrTable {
    &SHARED_ISR_TABLE
}

/// The current CPU's interrupt table.
pub fn local_isr_table() -> &'static LocalIsrTable {
    &LOCAL_ISR_TABLES[current_cpu_id()]
}

/// Route a saved frame to the owning table.
///
/// The entry stub has already handled the ring transition (`swapgs`)
/// before calling in, and mirrors the check on the frame left behind
/// when this returns.
pub fn dispatch(context: &mut IsrContext) {
    if (context.vector as usize) < EXCEPTION_COUNT {
        SHARED_ISR_TABLE.invoke(context);
    } else {
        local_isr_table().invoke(context);
    }
}
