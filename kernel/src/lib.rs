//! Obsidian kernel library.
//!
//! A monolithic x86-64 kernel core: physical and virtual memory
//! management over a TLSF heap and 4-level paging, interrupt and
//! syscall dispatch, an RCU-protected object model and VFS, and a
//! per-CPU round-robin scheduler. The library carries everything the
//! boot binary wires together, and builds for the host so the unit
//! test suite runs under the standard harness.

#![no_std]

extern crate alloc;

// Host builds (tests, coverage) link std and use the system allocator;
// bare metal runs on the boot bump arena until the TLSF heap is up.
#[cfg(not(target_os = "none"))]
extern crate std;

#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
#[global_allocator]
static KERNEL_ALLOCATOR: mm::kalloc::KernelAllocator = mm::kalloc::KernelAllocator;

pub mod arch;
pub mod clock;
pub mod cpu;
pub mod elf;
pub mod error;
pub mod fs;
pub mod isr;
pub mod logger;
pub mod mm;
pub mod object;
pub mod process;
pub mod sched;
pub mod sync;
pub mod syscall;

pub use error::{OsResult, OsStatus};
