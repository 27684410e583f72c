//! Event offsets into the portal range of an execution context.
//!
//! When the kernel sends an event message on behalf of an EC, it calls the
//! portal at `event_base + offset`. Thread ECs use exception numbers as
//! offsets; vCPU ECs use VM-exit reasons. The last two offsets of each
//! range are reserved for startup and recall.

use crate::consts::{
    NUM_EXC,
    NUM_VMI,
};
use core::convert::TryFrom;
use enum_iterator::IntoEnumIterator;

/// Thread startup event: sent the first time an SC is bound to a global EC.
pub const EVT_STARTUP: u64 = (NUM_EXC - 2) as u64;
/// Thread recall event: sent when the EC is recalled via `ec_ctrl`.
pub const EVT_RECALL: u64 = (NUM_EXC - 1) as u64;

/// vCPU startup event.
pub const VMI_STARTUP: u64 = (NUM_VMI - 2) as u64;
/// vCPU recall event.
pub const VMI_RECALL: u64 = (NUM_VMI - 1) as u64;

/// Offsets from the event base for x86 exceptions.
#[derive(Debug, Copy, Clone, PartialEq, Eq, IntoEnumIterator)]
#[repr(u64)]
pub enum ExceptionEvent {
    /// Divide error (#DE).
    DivideError = 0,
    /// Debug (#DB).
    Debug = 1,
    /// Non-maskable interrupt.
    Nmi = 2,
    /// Breakpoint (#BP).
    Breakpoint = 3,
    /// Overflow (#OF).
    Overflow = 4,
    /// Bound range exceeded (#BR).
    BoundRange = 5,
    /// Invalid opcode (#UD).
    InvalidOpcode = 6,
    /// Device not available (#NM).
    DeviceNotAvailable = 7,
    /// Double fault (#DF).
    DoubleFault = 8,
    /// Invalid TSS (#TS).
    InvalidTss = 10,
    /// Segment not present (#NP).
    SegmentNotPresent = 11,
    /// Stack segment fault (#SS).
    StackSegment = 12,
    /// General protection fault (#GP).
    GeneralProtection = 13,
    /// Page fault (#PF).
    PageFault = 14,
    /// x87 floating point exception (#MF).
    FpuError = 16,
    /// Alignment check (#AC).
    AlignmentCheck = 17,
    /// Machine check (#MC).
    MachineCheck = 18,
    /// SIMD floating point exception (#XM).
    SimdError = 19,
    /// Virtualization exception (#VE).
    Virtualization = 20,
}

impl ExceptionEvent {
    pub fn val(self) -> u64 {
        self as u64
    }
}

impl TryFrom<u64> for ExceptionEvent {
    type Error = ();

    fn try_from(val: u64) -> Result<Self, Self::Error> {
        Self::into_enum_iter()
            .find(|e| e.val() == val)
            .ok_or(())
    }
}

/// VM-exit reasons as defined by Intel, used as event offsets for vCPUs.
/// Only the reasons the kernel itself inspects are named; all others are
/// forwarded with their numeric reason.
#[derive(Debug, Copy, Clone, PartialEq, Eq, IntoEnumIterator)]
#[repr(u64)]
pub enum VmxReason {
    ExceptionOrNmi = 0,
    ExternalInterrupt = 1,
    TripleFault = 2,
    InterruptWindow = 7,
    Cpuid = 10,
    Hlt = 12,
    Invlpg = 14,
    Rdtsc = 16,
    Vmcall = 18,
    CrAccess = 28,
    IoInstruction = 30,
    Rdmsr = 31,
    Wrmsr = 32,
    EptViolation = 48,
    EptMisconfig = 49,
    PreemptionTimer = 52,
}

impl VmxReason {
    pub fn val(self) -> u64 {
        self as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_offsets() {
        assert_eq!(30, EVT_STARTUP);
        assert_eq!(31, EVT_RECALL);
        assert_eq!(56, VMI_STARTUP);
        assert_eq!(57, VMI_RECALL);
    }

    #[test]
    fn test_try_from() {
        assert_eq!(
            ExceptionEvent::try_from(14),
            Ok(ExceptionEvent::PageFault)
        );
        assert_eq!(ExceptionEvent::try_from(9), Err(()));
        assert_eq!(VmxReason::EptViolation.val(), 48);
    }
}
