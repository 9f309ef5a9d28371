//! Per-CPU round-robin scheduler.
//!
//! Each CPU owns a FIFO of weak thread references and a CPU-local slot
//! for the running thread. The periodic APIC timer is the sole
//! preemption source: its handler snapshots the interrupted frame into
//! the outgoing thread, requeues it, and restores the incoming thread's
//! frame in place, which is what the interrupt exit path resumes.
//! Orphaned threads (owning process exited) are dropped when the queue
//! hands them out.

use alloc::collections::VecDeque;

use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::cpu::{current_cpu_id, CpuLocal, MAX_CPUS};
use crate::isr::IsrContext;
use crate::process::{Thread, ThreadState};
use crate::sync::{RcuShared, RcuWeak};

/// One CPU's runnable queue and sleep list.
pub struct Scheduler {
    queue: Mutex<VecDeque<RcuWeak<Thread>>>,
    /// `(wake_tick, thread)` pairs; scanned on every tick.
    sleepers: Mutex<VecDeque<(u64, RcuWeak<Thread>)>>,
    ticks: AtomicU64,
}

impl Scheduler {
    pub const fn new() -> Scheduler {
        Scheduler {
            queue: Mutex::new(VecDeque::new()),
            sleepers: Mutex::new(VecDeque::new()),
            ticks: AtomicU64::new(0),
        }
    }

    /// Ticks observed on this CPU since boot.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Make a thread runnable at the back of the queue.
    pub fn enqueue(&self, thread: &RcuShared<Thread>) {
        thread.set_state(ThreadState::Queued);
        self.queue.lock().push_back(thread.downgrade());
    }

    /// Pop the next runnable thread, discarding dead and orphaned
    /// entries on the way.
    fn next_work_item(&self) -> Option<RcuShared<Thread>> {
        let mut queue = self.queue.lock();
        while let Some(weak) = queue.pop_front() {
            let Some(thread) = weak.upgrade() else {
                continue;
            };

            match thread.state() {
                ThreadState::Orphaned | ThreadState::Finished => continue,
                ThreadState::Suspended => {
                    // Keep suspended threads parked at the back; resume
                    // re-queues them properly.
                    continue;
                }
                _ => return Some(thread),
            }
        }
        None
    }

    /// Requeue sleepers whose deadline has passed.
    fn wake_sleepers(&self, now: u64) {
        let mut sleepers = self.sleepers.lock();
        let mut remaining = VecDeque::new();

        while let Some((deadline, weak)) = sleepers.pop_front() {
            if deadline > now {
                remaining.push_back((deadline, weak));
                continue;
            }
            if let Some(thread) = weak.upgrade() {
                if thread.transition(ThreadState::Waiting, ThreadState::Queued) {
                    self.queue.lock().push_back(thread.downgrade());
                }
            }
        }

        *sleepers = remaining;
    }

    /// Park the current thread for `ticks` timer periods.
    pub fn sleep(&self, thread: &RcuShared<Thread>, ticks: u64) {
        thread.set_state(ThreadState::Waiting);
        let deadline = self.ticks() + ticks;
        self.sleepers.lock().push_back((deadline, thread.downgrade()));
    }

    /// The timer tick: preempt the interrupted thread and resume the
    /// next one by swapping the saved frame in place.
    ///
    /// `context` is the frame the interrupt entry captured; whatever it
    /// holds on return is what gets restored, so writing the incoming
    /// thread's snapshot into it is the context switch.
    pub fn tick(&self, context: &mut IsrContext) {
        let now = self.ticks.fetch_add(1, Ordering::Relaxed) + 1;
        self.wake_sleepers(now);

        let Some(incoming) = self.next_work_item() else {
            return;
        };

        if let Some(outgoing) = current_thread() {
            *outgoing.context().lock() = *context;
            if outgoing.state() == ThreadState::Running {
                self.enqueue(&outgoing);
            }
        }

        incoming.set_state(ThreadState::Running);
        *context = *incoming.context().lock();
        set_current_thread(Some(incoming));
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

static SCHEDULERS: [Scheduler; MAX_CPUS] = [const { Scheduler::new() }; MAX_CPUS];

/// The current CPU's scheduler.
pub fn scheduler() -> &'static Scheduler {
    &SCHEDULERS[current_cpu_id()]
}

static CURRENT_THREAD: CpuLocal<RcuShared<Thread>> = CpuLocal::new();

/// The thread running on this CPU.
pub fn current_thread() -> Option<RcuShared<Thread>> {
    CURRENT_THREAD.get()
}

/// Install or clear the running thread.
pub fn set_current_thread(thread: Option<RcuShared<Thread>>) {
    CURRENT_THREAD.replace(thread);
}

/// Serialises host tests that touch the CPU-0 current-thread slot.
#[cfg(all(test, not(target_os = "none")))]
pub static TEST_CPU_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

/// Vector the scheduler owns on the local ISR table.
static SCHEDULE_VECTOR: AtomicU64 = AtomicU64::new(u64::MAX);

/// The tick handler installed on the scheduling vector.
fn schedule_isr(context: &mut IsrContext) {
    apic_eoi();
    scheduler().tick(context);
}

/// Allocate the scheduling vector from the local ISR table and arm the
/// APIC timer as the preemption source.
pub fn start(table: &'static crate::isr::LocalIsrTable) -> crate::error::OsResult<u8> {
    let vector = table.allocate(schedule_isr)?;
    SCHEDULE_VECTOR.store(vector as u64, Ordering::Release);

    arm_timer(vector);
    Ok(vector)
}

/// Give up the CPU: self-IPI on the scheduling vector so the switch
/// happens through the normal interrupt path.
pub fn yield_current_thread() {
    let vector = SCHEDULE_VECTOR.load(Ordering::Acquire);
    if vector != u64::MAX {
        self_ipi(vector as u8);
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod machine {
    use super::*;
    use crate::arch::x86_64::apic::{LocalApic, TimerDivide};
    use crate::mm::VirtualAddress;

    /// The APIC register window, published by CPU bring-up.
    pub static APIC_BASE: AtomicU64 = AtomicU64::new(0);

    fn local_apic() -> Option<LocalApic> {
        let base = APIC_BASE.load(Ordering::Acquire);
        if base == 0 {
            return None;
        }
        // SAFETY: bring-up mapped the register page uncached.
        Some(unsafe { LocalApic::new(VirtualAddress::new(base)) })
    }

    pub fn apic_eoi() {
        if let Some(apic) = local_apic() {
            apic.eoi();
        }
    }

    pub fn self_ipi(vector: u8) {
        if let Some(apic) = local_apic() {
            apic.self_ipi(vector);
        }
    }

    pub fn arm_timer(vector: u8) {
        if let Some(apic) = local_apic() {
            apic.arm_timer(vector, TimerDivide::By32, 0x10000);
        }
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
use machine::{apic_eoi, arm_timer, self_ipi};

/// Publish the mapped APIC register window for this package's timer and
/// IPI shims. Called once during CPU bring-up.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn set_apic_base(base: u64) {
    machine::APIC_BASE.store(base, Ordering::Release);
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
mod machine {
    pub fn apic_eoi() {}
    pub fn self_ipi(_vector: u8) {}
    pub fn arm_timer(_vector: u8) {}
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
use machine::{apic_eoi, arm_timer, self_ipi};

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use alloc::vec::Vec;

    use super::*;
    use crate::process::{process_table, Privilege, ProcessTable};

    use super::TEST_CPU_LOCK as SCHED_LOCK;

    fn spawn_threads(table: &ProcessTable, count: usize) -> Vec<RcuShared<Thread>> {
        let process = table.create_process("sched-test", Privilege::Supervisor);
        (0..count)
            .map(|index| {
                let mut context = IsrContext::default();
                context.rip = 0x1000 + index as u64;
                let thread = table
                    .create_thread(&process, "worker", context)
                    .unwrap();
                thread.set_state(ThreadState::Queued);
                thread
            })
            .collect()
    }

    #[test]
    fn every_thread_runs_within_n_ticks() {
        let _serial = SCHED_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let scheduler = Scheduler::new();
        let threads = spawn_threads(process_table(), 4);

        for thread in &threads {
            scheduler.queue.lock().push_back(thread.downgrade());
        }
        set_current_thread(None);

        let mut frame = IsrContext::default();
        let mut seen = Vec::new();
        for _ in 0..threads.len() {
            scheduler.tick(&mut frame);
            seen.push(frame.rip);
        }

        let mut expected: Vec<u64> = (0..threads.len() as u64).map(|i| 0x1000 + i).collect();
        seen.sort_unstable();
        expected.sort_unstable();
        assert_eq!(seen, expected, "fifo order covers every thread in n ticks");

        set_current_thread(None);
    }

    #[test]
    fn preempted_thread_keeps_its_frame() {
        let _serial = SCHED_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let scheduler = Scheduler::new();
        let threads = spawn_threads(process_table(), 2);

        for thread in &threads {
            scheduler.queue.lock().push_back(thread.downgrade());
        }
        set_current_thread(None);

        let mut frame = IsrContext::default();
        scheduler.tick(&mut frame);

        // Mutate the running frame as the "user code" would.
        frame.rax = 0xfeed;
        scheduler.tick(&mut frame);

        // First thread was requeued with the mutated snapshot.
        scheduler.tick(&mut frame);
        assert_eq!(frame.rax, 0xfeed);

        set_current_thread(None);
    }

    #[test]
    fn orphaned_threads_are_dropped_from_the_queue() {
        let _serial = SCHED_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let scheduler = Scheduler::new();
        let table = process_table();

        let process = table.create_process("doomed", Privilege::User);
        let thread = table
            .create_thread(&process, "walker", IsrContext::default())
            .unwrap();
        thread.set_state(ThreadState::Queued);
        scheduler.queue.lock().push_back(thread.downgrade());

        table.exit_process(&process, 0);
        set_current_thread(None);

        let mut frame = IsrContext::default();
        frame.rip = 0xaaaa;
        scheduler.tick(&mut frame);

        // Nothing runnable: the frame is untouched and no thread is
        // current.
        assert_eq!(frame.rip, 0xaaaa);
        assert!(current_thread().is_none());
    }

    #[test]
    fn sleepers_wake_after_their_deadline() {
        let _serial = SCHED_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let scheduler = Scheduler::new();
        let threads = spawn_threads(process_table(), 1);
        let sleeper = &threads[0];

        scheduler.sleep(sleeper, 3);
        assert_eq!(sleeper.state(), ThreadState::Waiting);
        set_current_thread(None);

        let mut frame = IsrContext::default();
        // Two ticks: still waiting.
        scheduler.tick(&mut frame);
        scheduler.tick(&mut frame);
        assert_eq!(sleeper.state(), ThreadState::Waiting);

        // Third tick wakes and runs it.
        scheduler.tick(&mut frame);
        assert_eq!(sleeper.state(), ThreadState::Running);
        assert_eq!(frame.rip, 0x1000);

        set_current_thread(None);
    }
}
