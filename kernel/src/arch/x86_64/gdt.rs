//! Per-CPU GDT and TSS.
//!
//! The segment layout is fixed so the `syscall`/`sysret` STAR encoding
//! can assume it: kernel code, kernel data, user data, user code. Each
//! CPU gets its own TSS for the privilege-0 stack used on ring
//! transitions through the IDT.

use lazy_static::lazy_static;
use x86_64::instructions::segmentation::{Segment, CS, DS, ES, SS};
use x86_64::instructions::tables::load_tss;
use x86_64::registers::segmentation::SegmentSelector;
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable};
use x86_64::structures::tss::TaskStateSegment;
use x86_64::VirtAddr;

use crate::cpu::MAX_CPUS;

/// Stack used for double faults and other critical exceptions.
const FAULT_STACK_SIZE: usize = 4096 * 4;

#[derive(Debug, Clone, Copy)]
pub struct Selectors {
    pub kernel_code: SegmentSelector,
    pub kernel_data: SegmentSelector,
    pub user_data: SegmentSelector,
    pub user_code: SegmentSelector,
    pub tss: SegmentSelector,
}

struct CpuTables {
    gdt: GlobalDescriptorTable,
    selectors: Selectors,
}

static mut FAULT_STACKS: [[u8; FAULT_STACK_SIZE]; MAX_CPUS] =
    [[0; FAULT_STACK_SIZE]; MAX_CPUS];

lazy_static! {
    static ref TSS: [TaskStateSegment; MAX_CPUS] = {
        let mut tss: [TaskStateSegment; MAX_CPUS] =
            core::array::from_fn(|_| TaskStateSegment::new());
        for (cpu, segment) in tss.iter_mut().enumerate() {
            // SAFETY: address-of only; each CPU gets a disjoint slice.
            let stack = unsafe { core::ptr::addr_of!(FAULT_STACKS) } as u64
                + (cpu * FAULT_STACK_SIZE) as u64;
            segment.privilege_stack_table[0] = VirtAddr::new(stack + FAULT_STACK_SIZE as u64);
        }
        tss
    };
    static ref TABLES: [CpuTables; MAX_CPUS] = core::array::from_fn(|cpu| {
        let mut gdt = GlobalDescriptorTable::new();
        let kernel_code = gdt.append(Descriptor::kernel_code_segment());
        let kernel_data = gdt.append(Descriptor::kernel_data_segment());
        let user_data = gdt.append(Descriptor::user_data_segment());
        let user_code = gdt.append(Descriptor::user_code_segment());
        let tss = gdt.append(Descriptor::tss_segment(&TSS[cpu]));
        CpuTables {
            gdt,
            selectors: Selectors {
                kernel_code,
                kernel_data,
                user_data,
                user_code,
                tss,
            },
        }
    });
}

/// Selectors of the fixed layout, for STAR and the IDT.
pub fn selectors() -> Selectors {
    TABLES[crate::cpu::current_cpu_id()].selectors
}

/// Load this CPU's GDT, segment registers, and TSS.
pub fn init() {
    let tables = &TABLES[crate::cpu::current_cpu_id()];
    tables.gdt.load();

    // SAFETY: the selectors index the GDT just loaded.
    unsafe {
        CS::set_reg(tables.selectors.kernel_code);
        SS::set_reg(tables.selectors.kernel_data);
        DS::set_reg(tables.selectors.kernel_data);
        ES::set_reg(tables.selectors.kernel_data);
        load_tss(tables.selectors.tss);
    }
}

/// Set the privilege-0 stack the CPU switches to on ring-3 interrupts.
pub fn set_interrupt_stack(top: VirtAddr) {
    let cpu = crate::cpu::current_cpu_id();
    // SAFETY: each CPU touches only its own TSS slot.
    unsafe {
        let tss = &TSS[cpu] as *const TaskStateSegment as *mut TaskStateSegment;
        (*tss).privilege_stack_table[0] = top;
    }
}
