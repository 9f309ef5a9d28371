//! Interrupt priority level.
//!
//! Two levels exist: *passive* (interrupts enabled, normal kernel code)
//! and *dispatch* (interrupts disabled, interrupt handlers and short
//! critical sections). The level is witnessed by a move-only
//! [`IplToken`], so code annotated as running at a level consumes and
//! produces tokens and cannot accidentally duplicate an IPL claim.

use core::sync::atomic::{AtomicU8, Ordering};

use super::MAX_CPUS;

/// Interrupt priority level values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Ipl {
    Passive = 0,
    Dispatch = 1,
}

pub const PASSIVE: u8 = Ipl::Passive as u8;
pub const DISPATCH: u8 = Ipl::Dispatch as u8;

/// Per-CPU current level, kept in step with the interrupt flag.
static CURRENT_IPL: [AtomicU8; MAX_CPUS] = [const { AtomicU8::new(PASSIVE) }; MAX_CPUS];

fn current_slot() -> &'static AtomicU8 {
    &CURRENT_IPL[super::current_cpu_id()]
}

/// The current CPU's level.
pub fn current_ipl() -> Ipl {
    if current_slot().load(Ordering::Relaxed) == DISPATCH {
        Ipl::Dispatch
    } else {
        Ipl::Passive
    }
}

/// Witness that the current CPU runs at `LEVEL`.
///
/// Deliberately neither `Clone` nor `Copy`, and not constructible
/// outside this module: the only sources are [`enforce_ipl`],
/// [`raise_ipl`], and [`lower_ipl`].
pub struct IplToken<const LEVEL: u8> {
    _private: (),
}

impl<const LEVEL: u8> IplToken<LEVEL> {
    pub fn level(&self) -> Ipl {
        if LEVEL == DISPATCH {
            Ipl::Dispatch
        } else {
            Ipl::Passive
        }
    }
}

/// Assert the current level and mint a witness for it.
///
/// Panics when the actual level differs: that is a kernel bug, not a
/// recoverable condition.
pub fn enforce_ipl<const LEVEL: u8>() -> IplToken<LEVEL> {
    let actual = current_slot().load(Ordering::Relaxed);
    assert_eq!(actual, LEVEL, "ipl enforcement failed");
    IplToken { _private: () }
}

/// Raise from passive to dispatch, disabling interrupts.
pub fn raise_ipl(_from: IplToken<PASSIVE>) -> IplToken<DISPATCH> {
    interrupts_disable();
    current_slot().store(DISPATCH, Ordering::Relaxed);
    IplToken { _private: () }
}

/// Lower from dispatch back to passive, re-enabling interrupts.
pub fn lower_ipl(_from: IplToken<DISPATCH>) -> IplToken<PASSIVE> {
    current_slot().store(PASSIVE, Ordering::Relaxed);
    interrupts_enable();
    IplToken { _private: () }
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
fn interrupts_disable() {
    x86_64::instructions::interrupts::disable();
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
fn interrupts_enable() {
    x86_64::instructions::interrupts::enable();
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
fn interrupts_disable() {}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
fn interrupts_enable() {}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    // The harness runs tests on several threads but they all report as
    // CPU 0; serialise the ones that toggle the level.
    static LEVEL_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    #[test]
    fn raise_and_lower_round_trip() {
        let _serial = LEVEL_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let passive = enforce_ipl::<PASSIVE>();
        assert_eq!(current_ipl(), Ipl::Passive);

        let dispatch = raise_ipl(passive);
        assert_eq!(current_ipl(), Ipl::Dispatch);
        assert_eq!(dispatch.level(), Ipl::Dispatch);

        let passive = lower_ipl(dispatch);
        assert_eq!(current_ipl(), Ipl::Passive);
        assert_eq!(passive.level(), Ipl::Passive);
    }

    #[test]
    #[should_panic(expected = "ipl enforcement failed")]
    fn enforcement_catches_the_wrong_level() {
        let _serial = LEVEL_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        // Running at passive; claiming dispatch must panic.
        let _ = enforce_ipl::<DISPATCH>();
    }
}
