//! IDT construction and the interrupt entry stubs.
//!
//! Every vector points at a 16-byte stub that normalises the stack to
//! the [`IsrContext`](super::IsrContext) layout and jumps to the common
//! entry. The common entry swaps GS when the interrupted frame was ring
//! 3, calls [`super::dispatch`], and mirrors the check on the frame it
//! is about to restore, which may belong to a different thread if the
//! handler rescheduled.

use core::mem::size_of;

use x86_64::instructions::tables::lidt;
use x86_64::structures::DescriptorTablePointer;
use x86_64::VirtAddr;

use super::VECTOR_COUNT;

/// Byte stride between consecutive entry stubs.
const STUB_STRIDE: usize = 16;

/// Selector of the kernel code segment in the boot GDT.
const KERNEL_CODE_SELECTOR: u16 = 0x08;

// One stub per vector, then the shared entry. Vectors 8, 10-14, 17, and
// 21 push a hardware error code; the stubs for the rest push a zero so
// the frame layout is uniform. The saved CS sits at 15*8 + 24 once the
// general registers are down.
core::arch::global_asm!(
    r#"
    .section .text
    .align 16
    .global obsidian_isr_stubs
obsidian_isr_stubs:
    .set vector, 0
    .rept 256
    .align 16
    .if (vector == 8) || ((vector >= 10) && (vector <= 14)) || (vector == 17) || (vector == 21)
    .else
    pushq $0
    .endif
    pushq $vector
    jmp obsidian_isr_common
    .set vector, vector + 1
    .endr

    .align 16
obsidian_isr_common:
    pushq %rbp
    pushq %r15
    pushq %r14
    pushq %r13
    pushq %r12
    pushq %r11
    pushq %r10
    pushq %r9
    pushq %r8
    pushq %rsi
    pushq %rdi
    pushq %rdx
    pushq %rcx
    pushq %rbx
    pushq %rax

    /* Entering from ring 3 means user GS is live. */
    testq $3, 144(%rsp)
    jz 1f
    swapgs
1:
    movq %rsp, %rdi
    cld
    call {dispatch}

    /* The handler may have swapped in another thread's frame; decide
       the exit swap from the frame being restored, not the one we
       entered with. */
    testq $3, 144(%rsp)
    jz 2f
    swapgs
2:
    popq %rax
    popq %rbx
    popq %rcx
    popq %rdx
    popq %rdi
    popq %rsi
    popq %r8
    popq %r9
    popq %r10
    popq %r11
    popq %r12
    popq %r13
    popq %r14
    popq %r15
    popq %rbp

    /* Drop vector and error code. */
    addq $16, %rsp
    iretq
"#,
    dispatch = sym isr_dispatch_routine,
    options(att_syntax)
);

extern "C" {
    static obsidian_isr_stubs: u8;
}

/// C-ABI trampoline the common entry calls with the frame pointer.
extern "C" fn isr_dispatch_routine(context: *mut super::IsrContext) {
    // SAFETY: the entry stub built a full IsrContext at this address.
    super::dispatch(unsafe { &mut *context });
}

/// One 16-byte interrupt gate.
#[derive(Clone, Copy)]
#[repr(C)]
struct IdtEntry {
    offset_low: u16,
    selector: u16,
    options: u16,
    offset_mid: u16,
    offset_high: u32,
    _reserved: u32,
}

impl IdtEntry {
    const EMPTY: IdtEntry = IdtEntry {
        offset_low: 0,
        selector: 0,
        options: 0,
        offset_mid: 0,
        offset_high: 0,
        _reserved: 0,
    };

    fn interrupt_gate(target: u64, selector: u16, ist: u8) -> IdtEntry {
        IdtEntry {
            offset_low: target as u16,
            selector,
            // Present, 64-bit interrupt gate, DPL 0, optional IST slot.
            options: 0x8e00 | ist as u16,
            offset_mid: (target >> 16) as u16,
            offset_high: (target >> 32) as u32,
            _reserved: 0,
        }
    }
}

#[repr(C, align(16))]
struct Idt {
    entries: [IdtEntry; VECTOR_COUNT],
}

static mut IDT: Idt = Idt {
    entries: [IdtEntry::EMPTY; VECTOR_COUNT],
};

/// Point every vector at its stub and load the IDT on this CPU.
///
/// # Safety
/// The GDT must already hold a 64-bit kernel code descriptor at
/// [`KERNEL_CODE_SELECTOR`], and the stubs must stay mapped executable
/// for the lifetime of the system.
pub unsafe fn init() {
    // SAFETY: boot-time single-threaded initialisation; the stub table
    // is a linker symbol of the kernel image.
    unsafe {
        let base = core::ptr::addr_of!(obsidian_isr_stubs) as u64;

        let idt = &mut *core::ptr::addr_of_mut!(IDT);
        for vector in 0..VECTOR_COUNT {
            let target = base + (vector * STUB_STRIDE) as u64;
            idt.entries[vector] = IdtEntry::interrupt_gate(target, KERNEL_CODE_SELECTOR, 0);
        }

        let pointer = DescriptorTablePointer {
            limit: (size_of::<Idt>() - 1) as u16,
            base: VirtAddr::new(core::ptr::addr_of!(IDT) as u64),
        };
        lidt(&pointer);
    }
}
