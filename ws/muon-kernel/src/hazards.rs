//! Hazard bits: work a CPU or an EC must do before leaving the kernel.

/// Run the scheduler.
pub const HZD_SCHED: u32 = 1 << 0;
/// Pass through an RCU quiescent state.
pub const HZD_RCU: u32 = 1 << 1;
/// The TLB has to be flushed.
pub const HZD_TLB: u32 = 1 << 2;
/// The CPU should be parked.
pub const HZD_PRK: u32 = 1 << 3;
/// RCU acceleration: another CPU waits for our grace period.
pub const HZD_IDL: u32 = 1 << 4;
/// There are SCs in the cross-CPU ready queue to drain.
pub const HZD_RRQ: u32 = 1 << 5;

/// Per-EC hazard: the EC was recalled and must deliver a recall event.
pub const HZD_RECALL: u32 = 1 << 8;
