//! Two-generation read-copy-update domain.
//!
//! Readers enter a section through [`RcuGuard`], which pins the current
//! generation and bumps its reader count. Retired objects are pushed
//! onto the pinned generation's atomic list; their callbacks run when
//! [`RcuDomain::synchronize`] later flips the current-generation bit and
//! drains the old side once its reader count reaches zero.
//!
//! Work submitted *during* a `synchronize` call lands in the new current
//! generation and is never freed by that same call; two back-to-back
//! `synchronize` calls drain everything retired before the first.
//!
//! Retirement nodes are intrusive: an [`RcuObject`] header embedded in
//! the retired object keeps the hot path allocation free. The
//! convenience [`RcuDomain::call`] allocates a trampoline node and is
//! the only fallible entry point.

use core::alloc::Layout;
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

use crate::error::{OsResult, OsStatus};

/// Retirement callback; receives the object's [`RcuObject`] header.
pub type RcuRetireFn = unsafe fn(*mut RcuObject);

/// Intrusive retirement header.
///
/// Embed this as the first field (`#[repr(C)]`) of any object retired
/// through the domain, and recover the object from the header pointer in
/// the callback.
#[repr(C)]
pub struct RcuObject {
    next: AtomicPtr<RcuObject>,
    retire: Option<RcuRetireFn>,
}

impl RcuObject {
    pub const fn new() -> RcuObject {
        RcuObject {
            next: AtomicPtr::new(ptr::null_mut()),
            retire: None,
        }
    }

    pub fn set_retire(&mut self, retire: RcuRetireFn) {
        self.retire = Some(retire);
    }
}

impl Default for RcuObject {
    fn default() -> Self {
        Self::new()
    }
}

/// One of the two generations: a reader count and the retired list.
struct RcuGeneration {
    guard: AtomicU32,
    head: AtomicPtr<RcuObject>,
}

impl RcuGeneration {
    const fn new() -> RcuGeneration {
        RcuGeneration {
            guard: AtomicU32::new(0),
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Lock-free push onto the retired list.
    fn append(&self, object: *mut RcuObject) {
        // SAFETY: the caller hands over ownership of `object` until its
        // retire callback runs.
        let header = unsafe { &*object };
        debug_assert!(header.retire.is_some(), "retired object without callback");

        let mut head = self.head.load(Ordering::Acquire);
        loop {
            header.next.store(head, Ordering::Relaxed);
            match self
                .head
                .compare_exchange_weak(head, object, Ordering::Release, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(current) => head = current,
            }
        }
    }

    /// Run every retirement callback. Requires the reader count to have
    /// drained to zero.
    fn destroy(&self) {
        debug_assert_eq!(self.guard.load(Ordering::Acquire), 0);

        let mut head = self.head.swap(ptr::null_mut(), Ordering::AcqRel);
        while !head.is_null() {
            // SAFETY: the list owns the objects; each callback runs at
            // most once because the list was detached above.
            let next = unsafe { (*head).next.load(Ordering::Relaxed) };
            let retire = unsafe { (*head).retire.expect("checked on append") };
            unsafe { retire(head) };
            head = next;
        }
    }
}

/// Bit of `state` selecting the current generation.
const CURRENT_GENERATION: u32 = 1 << 31;

/// The reclamation domain.
pub struct RcuDomain {
    /// Top bit: current generation index. Low bits: readers currently
    /// inside [`acquire`](Self::acquire), which pins the bit.
    state: AtomicU32,
    generations: [RcuGeneration; 2],
}

impl RcuDomain {
    pub const fn new() -> RcuDomain {
        RcuDomain {
            state: AtomicU32::new(0),
            generations: [RcuGeneration::new(), RcuGeneration::new()],
        }
    }

    fn current_index(state: u32) -> usize {
        if state & CURRENT_GENERATION != 0 {
            1
        } else {
            0
        }
    }

    /// Pin the current generation and take a reader reference on it.
    fn acquire(&self) -> &RcuGeneration {
        // The low bits of `state` hold the generation bit steady while
        // we publish our reader count; `exchange` waits for them to
        // drain before flipping.
        let state = self.state.fetch_add(1, Ordering::Acquire);
        let generation = &self.generations[Self::current_index(state)];

        generation.guard.fetch_add(1, Ordering::Acquire);

        let after = self.state.fetch_sub(1, Ordering::Release);
        debug_assert_eq!(
            after & CURRENT_GENERATION,
            state & CURRENT_GENERATION,
            "generation flipped while pinned"
        );

        generation
    }

    /// Flip the current-generation bit, waiting out in-flight acquires.
    fn exchange(&self) -> &RcuGeneration {
        let initial = self.state.load(Ordering::Acquire) & CURRENT_GENERATION;

        let mut expected = initial;
        loop {
            match self.state.compare_exchange_weak(
                expected,
                expected ^ CURRENT_GENERATION,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => {
                    // Readers are mid-acquire; wait for the low bits to
                    // drain without perturbing the generation bit.
                    core::hint::spin_loop();
                    expected = observed & CURRENT_GENERATION;
                }
            }
        }

        &self.generations[Self::current_index(initial)]
    }

    /// Retire `object` onto the current generation from outside a guard.
    pub fn append(&self, object: *mut RcuObject) {
        let guard = RcuGuard::new(self);
        guard.append(object);
    }

    /// Retire through an allocated trampoline: `callback(data)` runs
    /// after the grace period.
    ///
    /// Returns `OutOfMemory` if the trampoline cannot be allocated; the
    /// caller then still owns `data`.
    pub fn call(&self, data: *mut u8, callback: unsafe fn(*mut u8)) -> OsResult {
        #[repr(C)]
        struct RcuCall {
            header: RcuObject,
            data: *mut u8,
            callback: unsafe fn(*mut u8),
        }

        unsafe fn retire(object: *mut RcuObject) {
            let call = object as *mut RcuCall;
            // SAFETY: `object` was allocated below with this layout.
            unsafe {
                ((*call).callback)((*call).data);
                alloc::alloc::dealloc(call as *mut u8, Layout::new::<RcuCall>());
            }
        }

        // Raw allocation so a null return is observable instead of
        // aborting through the alloc error handler.
        let node = unsafe { alloc::alloc::alloc(Layout::new::<RcuCall>()) } as *mut RcuCall;
        if node.is_null() {
            return Err(OsStatus::OutOfMemory);
        }

        // SAFETY: `node` is valid for writes of RcuCall.
        unsafe {
            node.write(RcuCall {
                header: RcuObject {
                    next: AtomicPtr::new(ptr::null_mut()),
                    retire: Some(retire),
                },
                data,
                callback,
            });
        }

        let guard = RcuGuard::new(self);
        guard.append(node as *mut RcuObject);
        Ok(())
    }

    /// Wait for all readers of the previous generation and run its
    /// retirement callbacks.
    pub fn synchronize(&self) {
        let generation = self.exchange();

        while generation.guard.load(Ordering::Acquire) > 0 {
            core::hint::spin_loop();
        }

        generation.destroy();
    }
}

impl Default for RcuDomain {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RcuDomain {
    fn drop(&mut self) {
        self.synchronize();
        self.synchronize();
    }
}

/// A pinned read section.
///
/// Holding a guard keeps every object published before the guard was
/// taken alive; objects retired inside the guard are freed no earlier
/// than the second `synchronize` after the guard drops.
pub struct RcuGuard<'a> {
    generation: &'a RcuGeneration,
}

impl<'a> RcuGuard<'a> {
    pub fn new(domain: &'a RcuDomain) -> RcuGuard<'a> {
        RcuGuard {
            generation: domain.acquire(),
        }
    }

    /// Retire an object onto the guarded generation.
    pub fn append(&self, object: *mut RcuObject) {
        self.generation.append(object);
    }
}

impl Drop for RcuGuard<'_> {
    fn drop(&mut self) {
        self.generation.guard.fetch_sub(1, Ordering::Release);
    }
}
