//! The global kernel allocator.
//!
//! Boot starts on a fixed bump arena so early containers work before
//! the PFA exists; once paging and the PFA are up, boot hands over a
//! TLSF heap and the bump arena is retired (its few live allocations
//! are leaked deliberately, the arena is part of the kernel image).

use core::alloc::{GlobalAlloc, Layout};
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;

use super::heap::KernelHeap;

/// Size of the boot bump arena.
const BOOTSTRAP_SIZE: usize = 2 * 1024 * 1024;

#[repr(align(4096))]
struct BootstrapArena([u8; BOOTSTRAP_SIZE]);

static mut BOOTSTRAP_ARENA: BootstrapArena = BootstrapArena([0; BOOTSTRAP_SIZE]);
static BOOTSTRAP_CURSOR: AtomicUsize = AtomicUsize::new(0);

fn bootstrap_range() -> (usize, usize) {
    // SAFETY: address-of only; the arena bytes are handed out through
    // the cursor protocol.
    let base = unsafe { core::ptr::addr_of!(BOOTSTRAP_ARENA) } as usize;
    (base, base + BOOTSTRAP_SIZE)
}

fn bootstrap_alloc(layout: Layout) -> *mut u8 {
    let (base, end) = bootstrap_range();
    let mut cursor = BOOTSTRAP_CURSOR.load(Ordering::Relaxed);
    loop {
        let address = (base + cursor).next_multiple_of(layout.align());
        let next = address + layout.size() - base;
        if base + next > end {
            return core::ptr::null_mut();
        }
        match BOOTSTRAP_CURSOR.compare_exchange_weak(
            cursor,
            next,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => return address as *mut u8,
            Err(current) => cursor = current,
        }
    }
}

/// The TLSF heap once boot installs it.
static KERNEL_HEAP: Mutex<Option<KernelHeap>> = Mutex::new(None);

/// Switch the global allocator over to a TLSF heap.
///
/// Called once after the PFA and the heap arena mapping exist. Bump
/// allocations made before the switch stay live in the boot arena.
pub fn install_heap(heap: KernelHeap) {
    let mut slot = KERNEL_HEAP.lock();
    debug_assert!(slot.is_none(), "kernel heap installed twice");
    *slot = Some(heap);
}

/// `#[global_allocator]` for bare metal.
pub struct KernelAllocator;

// SAFETY: allocation is served by the TLSF heap under its lock (or the
// atomic bump arena before that); frees route back by address range.
unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let mut slot = KERNEL_HEAP.lock();
        if let Some(heap) = slot.as_mut() {
            return match heap.aligned_alloc(layout.align(), layout.size().max(1)) {
                Ok(ptr) => ptr.as_ptr(),
                Err(_) => core::ptr::null_mut(),
            };
        }
        drop(slot);

        bootstrap_alloc(layout)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        let (base, end) = bootstrap_range();
        let address = ptr as usize;
        if (base..end).contains(&address) {
            // Boot arena memory is never reclaimed.
            return;
        }

        if let Some(heap) = KERNEL_HEAP.lock().as_mut() {
            if let Some(ptr) = core::ptr::NonNull::new(ptr) {
                let _ = heap.free(ptr);
            }
        }
    }
}
