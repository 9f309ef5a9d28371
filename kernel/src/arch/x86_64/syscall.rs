//! `syscall`/`sysret` entry plumbing.
//!
//! The entry stub runs with interrupts masked (FMASK clears IF) until
//! the dispatcher decides it is at a safe point. It swaps GS, moves to
//! the per-CPU syscall stack published at `gs:[0]`, and builds a
//! [`SystemCallContext`] the portable dispatcher consumes. The result
//! comes back in `rax`/`rdx` as the status/value pair of
//! `OsCallResult`.

use x86_64::registers::model_specific::{Efer, EferFlags, KernelGsBase, LStar, SFMask, Star};
use x86_64::registers::rflags::RFlags;
use x86_64::VirtAddr;

use crate::cpu::MAX_CPUS;
use crate::syscall::{dispatch_system_call, OsCallResult, SystemCallContext};

/// Per-CPU block reachable through `KERNEL_GS_BASE`.
///
/// Layout is ABI with the entry stub: `gs:[0]` is the kernel syscall
/// stack top, `gs:[8]` scratch for the interrupted user stack pointer.
#[repr(C)]
pub struct SyscallTls {
    pub kernel_stack_top: u64,
    pub user_stack_scratch: u64,
}

static mut SYSCALL_TLS: [SyscallTls; MAX_CPUS] = {
    const INIT: SyscallTls = SyscallTls {
        kernel_stack_top: 0,
        user_stack_scratch: 0,
    };
    [INIT; MAX_CPUS]
};

core::arch::global_asm!(
    r#"
    .section .text
    .align 16
    .global obsidian_syscall_entry
obsidian_syscall_entry:
    swapgs
    movq %rsp, %gs:8
    movq %gs:0, %rsp

    /* Callee-saved registers of the interrupted user code. */
    pushq %rbp
    pushq %rbx
    pushq %r12
    pushq %r13
    pushq %r14
    pushq %r15

    /* Build the SystemCallContext: function, four args, then the
       return rip (rcx) and rflags (r11) that sysret will consume. */
    pushq %r11
    pushq %rcx
    pushq %r10
    pushq %rdx
    pushq %rsi
    pushq %rdi
    pushq %rax

    movq %rsp, %rdi
    cld
    call {dispatch}

    /* rax:rdx now carry OsCallResult; drop the function and argument
       slots, then restore the sysret registers. */
    addq $40, %rsp
    popq %rcx
    popq %r11

    popq %r15
    popq %r14
    popq %r13
    popq %r12
    popq %rbx
    popq %rbp

    movq %gs:8, %rsp
    swapgs
    sysretq
"#,
    dispatch = sym syscall_dispatch_trampoline,
    options(att_syntax)
);

extern "C" {
    fn obsidian_syscall_entry();
}

extern "C" fn syscall_dispatch_trampoline(context: *mut SystemCallContext) -> OsCallResult {
    // SAFETY: the entry stub built a full context at this address.
    dispatch_system_call(unsafe { &mut *context })
}

/// Publish this CPU's syscall stack in the TLS block and point
/// `KERNEL_GS_BASE` at it.
///
/// # Safety
/// `stack_top` must be the top of a mapped kernel stack dedicated to
/// this CPU's syscall entry.
pub unsafe fn install_syscall_stack(stack_top: u64) {
    let cpu = crate::cpu::current_cpu_id();
    // SAFETY: each CPU writes only its own slot, before enabling
    // userspace.
    unsafe {
        let tls = &mut *core::ptr::addr_of_mut!(SYSCALL_TLS[cpu]);
        tls.kernel_stack_top = stack_top;
        KernelGsBase::write(VirtAddr::new(tls as *mut SyscallTls as u64));
    }
}

/// Program the syscall MSRs on this CPU.
///
/// STAR encodes the fixed GDT layout so `sysret` lands directly in ring
/// 3; FMASK clears IF so handlers start with interrupts off.
pub fn init() {
    let selectors = super::gdt::selectors();

    // SAFETY: selectors come from the loaded GDT; the entry symbol is
    // the stub above.
    unsafe {
        Efer::update(|flags| flags.insert(EferFlags::SYSTEM_CALL_EXTENSIONS));
        LStar::write(VirtAddr::new(obsidian_syscall_entry as usize as u64));
        SFMask::write(RFlags::INTERRUPT_FLAG);
        Star::write(
            selectors.user_code,
            selectors.user_data,
            selectors.kernel_code,
            selectors.kernel_data,
        )
        .expect("fixed gdt layout satisfies star constraints");
    }
}
