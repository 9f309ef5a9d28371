//! RCU-deferred shared and weak pointers.
//!
//! [`RcuShared`] behaves like an atomically counted shared pointer whose
//! pointee destruction is routed through an [`RcuDomain`]: when the last
//! strong reference drops, the value is *retired*, not freed, so any
//! reader that observed the pointer inside a guard can keep using it
//! until the grace period expires.
//!
//! Both counters are *sticky at zero*: once a count has fallen to zero
//! it can never be revived, which is what makes [`RcuWeak::upgrade`]
//! sound without a lock.

use core::marker::PhantomData;
use core::mem::offset_of;
use core::ops::Deref;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, Ordering};

use alloc::boxed::Box;

use super::rcu::{RcuDomain, RcuObject};

/// High bit marks a counter that has been stuck to zero.
const STICKY_ZERO: u32 = 1 << 31;

/// A counter that can be incremented only while non-zero.
struct StickyCounter(AtomicU32);

impl StickyCounter {
    const fn new(initial: u32) -> StickyCounter {
        StickyCounter(AtomicU32::new(initial))
    }

    /// Take a reference. Fails if the counter is stuck at zero.
    fn increment(&self) -> bool {
        self.0.fetch_add(1, Ordering::Acquire) & STICKY_ZERO == 0
    }

    /// Drop a reference. True when this was the last one and the counter
    /// is now stuck.
    fn decrement(&self) -> bool {
        if self.0.fetch_sub(1, Ordering::Release) == 1 {
            self.0
                .compare_exchange(0, STICKY_ZERO, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        } else {
            false
        }
    }
}

/// Shared state behind every [`RcuShared`]/[`RcuWeak`] pair.
///
/// The two intrusive retire headers let the value and the block be
/// retired independently: the strong cohort collectively owns one weak
/// reference, so the block outlives the value.
#[repr(C)]
struct ControlBlock<T> {
    value_retire: RcuObject,
    block_retire: RcuObject,
    strong: StickyCounter,
    weak: StickyCounter,
    value: *mut T,
    domain: &'static RcuDomain,
}

unsafe fn retire_value<T>(object: *mut RcuObject) {
    // SAFETY: `object` is the `value_retire` header of a live control
    // block; the value pointer was produced by Box::into_raw.
    unsafe {
        let control =
            (object as *mut u8).sub(offset_of!(ControlBlock<T>, value_retire)) as *mut ControlBlock<T>;
        drop(Box::from_raw((*control).value));
        release_weak(control);
    }
}

unsafe fn retire_block<T>(object: *mut RcuObject) {
    // SAFETY: `object` is the `block_retire` header; both counters are
    // stuck, nothing else references the block.
    unsafe {
        let control =
            (object as *mut u8).sub(offset_of!(ControlBlock<T>, block_retire)) as *mut ControlBlock<T>;
        drop(Box::from_raw(control));
    }
}

/// Drop one weak reference, retiring the block itself on the last one.
unsafe fn release_weak<T>(control: *mut ControlBlock<T>) {
    // SAFETY: caller holds a weak reference.
    unsafe {
        if (*control).weak.decrement() {
            let domain = (*control).domain;
            let header = core::ptr::addr_of_mut!((*control).block_retire);
            domain.append(header);
        }
    }
}

/// Strong RCU shared pointer.
pub struct RcuShared<T> {
    control: NonNull<ControlBlock<T>>,
    _marker: PhantomData<ControlBlock<T>>,
}

/// Weak companion: keeps the control block alive, not the value.
pub struct RcuWeak<T> {
    control: NonNull<ControlBlock<T>>,
    _marker: PhantomData<ControlBlock<T>>,
}

unsafe impl<T: Send + Sync> Send for RcuShared<T> {}
unsafe impl<T: Send + Sync> Sync for RcuShared<T> {}
unsafe impl<T: Send + Sync> Send for RcuWeak<T> {}
unsafe impl<T: Send + Sync> Sync for RcuWeak<T> {}

impl<T> RcuShared<T> {
    /// Publish `value` into `domain`.
    pub fn new(domain: &'static RcuDomain, value: T) -> RcuShared<T> {
        let value = Box::into_raw(Box::new(value));
        let mut control = Box::new(ControlBlock {
            value_retire: RcuObject::new(),
            block_retire: RcuObject::new(),
            // One strong for the caller, one weak owned by the strong
            // cohort.
            strong: StickyCounter::new(1),
            weak: StickyCounter::new(1),
            value,
            domain,
        });
        control.value_retire.set_retire(retire_value::<T>);
        control.block_retire.set_retire(retire_block::<T>);

        RcuShared {
            // SAFETY: Box::into_raw is never null.
            control: unsafe { NonNull::new_unchecked(Box::into_raw(control)) },
            _marker: PhantomData,
        }
    }

    fn control(&self) -> &ControlBlock<T> {
        // SAFETY: holding a strong reference keeps the block alive.
        unsafe { self.control.as_ref() }
    }

    /// Create a weak reference.
    pub fn downgrade(&self) -> RcuWeak<T> {
        let taken = self.control().weak.increment();
        debug_assert!(taken, "weak count revived from zero");
        RcuWeak {
            control: self.control,
            _marker: PhantomData,
        }
    }

    /// Identity comparison: do both pointers share a control block?
    pub fn ptr_eq(&self, other: &RcuShared<T>) -> bool {
        self.control == other.control
    }
}

impl<T> Deref for RcuShared<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the strong reference keeps the value alive.
        unsafe { &*self.control().value }
    }
}

impl<T> Clone for RcuShared<T> {
    fn clone(&self) -> Self {
        let taken = self.control().strong.increment();
        debug_assert!(taken, "strong count revived from zero");
        RcuShared {
            control: self.control,
            _marker: PhantomData,
        }
    }
}

impl<T> Drop for RcuShared<T> {
    fn drop(&mut self) {
        let control = self.control.as_ptr();
        // SAFETY: we hold a strong reference until the decrement.
        unsafe {
            if (*control).strong.decrement() {
                // Last strong holder: retire the value, then give up the
                // cohort's weak reference.
                let domain = (*control).domain;
                let header = core::ptr::addr_of_mut!((*control).value_retire);
                domain.append(header);
            }
        }
    }
}

impl<T: core::fmt::Debug> core::fmt::Debug for RcuShared<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        self.deref().fmt(f)
    }
}

impl<T> RcuWeak<T> {
    fn control(&self) -> &ControlBlock<T> {
        // SAFETY: holding a weak reference keeps the block alive.
        unsafe { self.control.as_ref() }
    }

    /// Attempt to take a strong reference. Fails once the last strong
    /// holder has dropped, even if the value has not been reclaimed yet.
    pub fn upgrade(&self) -> Option<RcuShared<T>> {
        if self.control().strong.increment() {
            Some(RcuShared {
                control: self.control,
                _marker: PhantomData,
            })
        } else {
            None
        }
    }

    pub fn ptr_eq_shared(&self, other: &RcuShared<T>) -> bool {
        self.control == other.control
    }
}

impl<T> Clone for RcuWeak<T> {
    fn clone(&self) -> Self {
        let taken = self.control().weak.increment();
        debug_assert!(taken, "weak count revived from zero");
        RcuWeak {
            control: self.control,
            _marker: PhantomData,
        }
    }
}

impl<T> Drop for RcuWeak<T> {
    fn drop(&mut self) {
        // SAFETY: we hold a weak reference.
        unsafe { release_weak(self.control.as_ptr()) };
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use core::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn leak_domain() -> &'static RcuDomain {
        Box::leak(Box::new(RcuDomain::new()))
    }

    struct DropFlag(&'static AtomicUsize);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn drop_counter() -> &'static AtomicUsize {
        Box::leak(Box::new(AtomicUsize::new(0)))
    }

    #[test]
    fn value_is_reclaimed_through_the_domain() {
        let domain = leak_domain();
        let drops = drop_counter();

        let shared = RcuShared::new(domain, DropFlag(drops));
        drop(shared);

        // Retired, not yet destroyed.
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        domain.synchronize();
        domain.synchronize();
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn upgrade_fails_after_last_strong_drop() {
        let domain = leak_domain();
        let shared = RcuShared::new(domain, 42usize);
        let weak = shared.downgrade();

        assert!(weak.upgrade().is_some());
        drop(shared);

        // The value may still be waiting in a generation, but the strong
        // count is stuck.
        assert!(weak.upgrade().is_none());

        domain.synchronize();
        domain.synchronize();
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn clones_share_the_value() {
        let domain = leak_domain();
        let a = RcuShared::new(domain, alloc::string::String::from("node"));
        let b = a.clone();
        assert!(a.ptr_eq(&b));
        assert_eq!(*a, *b);
        drop(a);
        assert_eq!(&**b.deref(), "node");
    }

    #[test]
    fn weak_does_not_keep_the_value_alive() {
        let domain = leak_domain();
        let drops = drop_counter();

        let shared = RcuShared::new(domain, DropFlag(drops));
        let weak = shared.downgrade();
        drop(shared);

        domain.synchronize();
        domain.synchronize();
        assert_eq!(drops.load(Ordering::SeqCst), 1, "weak ref held value alive");

        drop(weak);
        domain.synchronize();
        domain.synchronize();
    }

    #[test]
    fn concurrent_upgrade_and_drop_soak() {
        use std::thread;

        let domain = leak_domain();
        let drops = drop_counter();

        for _ in 0..64 {
            let shared = RcuShared::new(domain, DropFlag(drops));
            let weak = shared.downgrade();

            let reader = thread::spawn(move || {
                let mut hits = 0usize;
                for _ in 0..100 {
                    if let Some(strong) = weak.upgrade() {
                        // Touch the value while holding the reference.
                        let _ = &*strong;
                        hits += 1;
                    }
                }
                hits
            });

            let drainer = thread::spawn(move || {
                domain.synchronize();
            });

            drop(shared);
            reader.join().unwrap();
            drainer.join().unwrap();
        }

        domain.synchronize();
        domain.synchronize();
        assert_eq!(drops.load(Ordering::SeqCst), 64);
    }
}
