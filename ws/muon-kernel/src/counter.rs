//! Per-CPU event counters.

use crate::config::{
    NUM_CPUS,
    NUM_VMI,
};
use crate::cpulocal::PerCpu;
use core::sync::atomic::{
    AtomicU64,
    Ordering,
};

const ZERO: AtomicU64 = AtomicU64::new(0);

/// Completed remote-kernel-entry requests, used by the TLB shootdown
/// protocol to wait for the target CPU.
static RKE: PerCpu<AtomicU64> = PerCpu::new([ZERO; NUM_CPUS]);

/// VM exits by reason, on the current CPU.
static VMI: PerCpu<[AtomicU64; NUM_VMI]> = {
    const ROW: [AtomicU64; NUM_VMI] = [ZERO; NUM_VMI];
    PerCpu::new([ROW; NUM_CPUS])
};

pub struct Counter;

impl Counter {
    pub fn rke_of(cpu: usize) -> u64 {
        RKE.remote(cpu).load(Ordering::SeqCst)
    }

    pub fn tick_rke() {
        RKE.local().fetch_add(1, Ordering::SeqCst);
    }

    pub fn tick_vmi(reason: usize) {
        if reason < NUM_VMI {
            VMI.local()[reason].fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn vmi(reason: usize) -> u64 {
        VMI.local()[reason].load(Ordering::SeqCst)
    }
}
