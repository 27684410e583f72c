//! Compile-time constants of the Muon kernel that userland needs to know.

/// Number of supported CPUs.
pub const NUM_CPUS: usize = 64;

/// Number of exception events of a thread EC. The last two are reserved
/// for startup and recall.
pub const NUM_EXC: usize = 32;

/// Number of VM-exit events of a vCPU EC. The last two are reserved for
/// startup and recall.
pub const NUM_VMI: usize = 58;

/// Number of scheduling priorities. Valid priorities are `0..NUM_PRIORITIES`.
pub const NUM_PRIORITIES: usize = 128;

/// Capability selector of the roottask's own PD.
pub const ROOT_PD_SEL: u64 = NUM_EXC as u64;
/// Capability selector of the roottask's first EC.
pub const ROOT_EC_SEL: u64 = ROOT_PD_SEL + 1;
/// Capability selector of the roottask's first SC.
pub const ROOT_SC_SEL: u64 = ROOT_PD_SEL + 2;
