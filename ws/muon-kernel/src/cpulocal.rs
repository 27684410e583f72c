//! Per-CPU data.
//!
//! Each CPU owns one slot of a [`PerCpu`] array. [`PerCpu::local`] returns
//! the current CPU's slot, [`PerCpu::remote`] a foreign CPU's slot. Slots
//! contain atomics or locks for everything that remote CPUs may touch;
//! purely CPU-private state uses [`core::cell::Cell`] fields.

use crate::arch;
use crate::config::NUM_CPUS;
use crate::hazards::HZD_SCHED;
use core::sync::atomic::{
    AtomicBool,
    AtomicU32,
    Ordering,
};

/// A value replicated per CPU.
#[derive(Debug)]
pub struct PerCpu<T> {
    slots: [T; NUM_CPUS],
}

// Slots are only handed out as shared references; interior mutability
// within a slot must be CPU-safe on its own.
unsafe impl<T> Sync for PerCpu<T> {}

impl<T> PerCpu<T> {
    pub const fn new(slots: [T; NUM_CPUS]) -> Self {
        Self { slots }
    }

    /// The slot of the current CPU.
    pub fn local(&self) -> &T {
        &self.slots[arch::cpu_id()]
    }

    /// The slot of the given CPU. Remote access must go through atomics.
    pub fn remote(&self, cpu: usize) -> &T {
        &self.slots[cpu]
    }
}

/// Per-CPU hazard bitset.
static HAZARD: PerCpu<AtomicU32> = {
    const ZERO: AtomicU32 = AtomicU32::new(0);
    PerCpu::new([ZERO; NUM_CPUS])
};

/// Per-CPU preemption flag. Mirrors IF in EFLAGS.
static PREEMPTION: PerCpu<AtomicBool> = {
    const OFF: AtomicBool = AtomicBool::new(false);
    PerCpu::new([OFF; NUM_CPUS])
};

/// Number of CPUs that finished bring-up.
static ONLINE: core::sync::atomic::AtomicUsize = core::sync::atomic::AtomicUsize::new(1);

pub struct Cpu;

impl Cpu {
    pub fn id() -> usize {
        arch::cpu_id()
    }

    pub fn set_online(count: usize) {
        ONLINE.store(count, Ordering::SeqCst);
    }

    pub fn online() -> usize {
        ONLINE.load(Ordering::SeqCst)
    }

    pub fn hazard() -> u32 {
        HAZARD.local().load(Ordering::SeqCst)
    }

    pub fn set_hazard(bits: u32) {
        HAZARD.local().fetch_or(bits, Ordering::SeqCst);
    }

    pub fn clr_hazard(bits: u32) {
        HAZARD.local().fetch_and(!bits, Ordering::SeqCst);
    }

    pub fn set_hazard_of(cpu: usize, bits: u32) {
        HAZARD.remote(cpu).fetch_or(bits, Ordering::SeqCst);
    }

    pub fn hazard_of(cpu: usize) -> u32 {
        HAZARD.remote(cpu).load(Ordering::SeqCst)
    }

    pub fn preemption() -> bool {
        PREEMPTION.local().load(Ordering::SeqCst)
    }

    pub fn preempt_disable() {
        arch::disable_interrupts();
        PREEMPTION.local().store(false, Ordering::SeqCst);
    }

    pub fn preempt_enable() {
        PREEMPTION.local().store(true, Ordering::SeqCst);
        arch::enable_interrupts();
    }

    /// Preemption point inside long kernel operations: schedule if the
    /// hazard is set and preemption is enabled.
    pub fn sched_pending() -> bool {
        Self::preemption() && Self::hazard() & HZD_SCHED != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hazard_per_cpu() {
        let _guard = crate::test_util::lock();
        arch::with_cpu(0, || Cpu::set_hazard(HZD_SCHED));
        arch::with_cpu(1, || assert_eq!(0, Cpu::hazard() & HZD_SCHED));
        arch::with_cpu(0, || {
            assert_ne!(0, Cpu::hazard() & HZD_SCHED);
            Cpu::clr_hazard(HZD_SCHED);
            assert_eq!(0, Cpu::hazard() & HZD_SCHED);
        });
    }
}
