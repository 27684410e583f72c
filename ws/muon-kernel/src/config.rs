//! Build-time configuration of the kernel.

pub use libmuon::consts::{
    NUM_CPUS,
    NUM_EXC,
    NUM_PRIORITIES,
    NUM_VMI,
};

/// Number of GSIs the kernel manages (one kernel semaphore each).
pub const NUM_GSI: usize = 128;

/// RCU callbacks pending on one CPU beyond which other CPUs are kicked
/// with an acceleration IPI.
pub const RCU_ACCEL_THRESHOLD: usize = 2000;

/// Partner-chain hops after which helping declares a livelock and kills
/// the originating EC.
pub const MAX_HELP_LOOPS: usize = 100;

/// Start of the per-PD object-space area in kernel virtual memory. The
/// capability table of a PD is backed by pages mapped in this range of its
/// host page table.
pub const OBJ_SPACE_BASE: u64 = 0xffff_f000_0000_0000;

/// Virtual address of the per-CPU I/O permission bitmap window.
pub const IOP_SPACE_BASE: u64 = 0xffff_f800_0000_0000;

/// First virtual address that is not user-accessible.
pub const USER_ADDR_LIMIT: u64 = 0x0000_8000_0000_0000;
