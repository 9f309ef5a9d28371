//! Minimal local APIC shim.
//!
//! The timing stack proper (HPET/PIT calibration, IO-APIC routing) is a
//! collaborator; the core only needs the pieces the scheduler drives:
//! end-of-interrupt, the periodic timer, and self-IPIs for yield. The
//! legacy PIC is remapped and masked at boot so only APIC vectors fire.

use crate::mm::{PhysicalAddress, VirtualAddress};

const REG_EOI: usize = 0x0b0;
const REG_SPURIOUS: usize = 0x0f0;
const REG_ICR_LOW: usize = 0x300;
const REG_LVT_TIMER: usize = 0x320;
const REG_TIMER_INITIAL: usize = 0x380;
const REG_TIMER_DIVIDE: usize = 0x3e0;

const TIMER_PERIODIC: u32 = 1 << 17;
const ICR_SELF: u32 = 0b01 << 18;

/// Timer divide configurations.
#[derive(Debug, Clone, Copy)]
#[repr(u32)]
pub enum TimerDivide {
    By16 = 0b0011,
    By32 = 0b1000,
    By64 = 0b1001,
}

/// Memory-mapped xAPIC registers.
pub struct LocalApic {
    base: VirtualAddress,
}

impl LocalApic {
    /// Wrap the APIC MMIO window.
    ///
    /// # Safety
    /// `base` must be the APIC register page mapped uncached.
    pub unsafe fn new(base: VirtualAddress) -> LocalApic {
        LocalApic { base }
    }

    /// The default physical register page.
    pub fn default_mmio_base() -> PhysicalAddress {
        PhysicalAddress::new(0xfee0_0000)
    }

    fn write(&self, register: usize, value: u32) {
        let ptr = (self.base.as_u64() as usize + register) as *mut u32;
        // SAFETY: the register page was mapped by the caller of `new`.
        unsafe { core::ptr::write_volatile(ptr, value) };
    }

    /// Enable the APIC through the spurious-vector register.
    pub fn enable(&self, spurious_vector: u8) {
        self.write(REG_SPURIOUS, 0x100 | spurious_vector as u32);
    }

    /// Signal end of interrupt for the in-service vector.
    pub fn eoi(&self) {
        self.write(REG_EOI, 0);
    }

    /// Send an IPI to this CPU on `vector`.
    pub fn self_ipi(&self, vector: u8) {
        self.write(REG_ICR_LOW, ICR_SELF | vector as u32);
    }

    /// Arm the periodic timer on `vector`.
    pub fn arm_timer(&self, vector: u8, divide: TimerDivide, initial: u32) {
        self.write(REG_TIMER_DIVIDE, divide as u32);
        self.write(REG_LVT_TIMER, TIMER_PERIODIC | vector as u32);
        self.write(REG_TIMER_INITIAL, initial);
    }

    /// Stop the timer.
    pub fn disarm_timer(&self) {
        self.write(REG_TIMER_INITIAL, 0);
    }
}

/// Remap the legacy PIC away from the exception vectors and mask every
/// line; the APIC is the only interrupt source afterwards.
pub fn mask_legacy_pic() {
    use pic8259::ChainedPics;

    // SAFETY: offsets 32/40 are above the exception range; both PICs are
    // masked immediately after the remap.
    unsafe {
        let mut pics = ChainedPics::new(32, 40);
        pics.initialize();
        pics.disable();
    }
}
