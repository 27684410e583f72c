//! Hypercall numbers, sub-operations and status codes.
//!
//! The hypercall number travels in the lowest 4 bits of the first argument
//! register, the sub-operation in the 4-bit flags field above it. The
//! status code comes back in the low byte of the first register.

use enum_iterator::IntoEnumIterator;

/// Bits of the first argument register reserved for the hypercall number.
pub const HYPERCALL_BITS: u64 = 0xf;
/// Shift of the 4-bit flags/sub-operation field.
pub const FLAGS_SHIFT: u64 = 4;
/// Bits of the flags/sub-operation field (after shifting).
pub const FLAGS_BITS: u64 = 0xf;

/// All hypercalls of the Muon kernel.
#[derive(Debug, Copy, Clone, PartialEq, Eq, IntoEnumIterator)]
#[repr(u64)]
pub enum Hypercall {
    Call = 0,
    Reply = 1,
    CreatePd = 2,
    CreateEc = 3,
    CreateSc = 4,
    CreatePt = 5,
    CreateSm = 6,
    Revoke = 7,
    PdCtrl = 8,
    EcCtrl = 9,
    ScCtrl = 10,
    PtCtrl = 11,
    SmCtrl = 12,
    AssignPci = 13,
    AssignGsi = 14,
    MachineCtrl = 15,
}

impl Hypercall {
    pub fn val(self) -> u64 {
        self as u64
    }

    /// Decodes the hypercall number field of the first argument register.
    pub fn try_from_arg(arg1: u64) -> Option<Self> {
        let num = arg1 & HYPERCALL_BITS;
        Self::into_enum_iter().find(|h| h.val() == num)
    }
}

/// Sub-operations of `pd_ctrl`. Kernel-page mapping control rides on
/// `pd_ctrl` as well; kernel pages are created via `create_sm` with the
/// KP flag.
#[derive(Debug, Copy, Clone, PartialEq, Eq, IntoEnumIterator)]
#[repr(u64)]
pub enum PdCtrlOp {
    Lookup = 0,
    Delegate = 2,
    KpMap = 4,
    KpUnmap = 5,
}

/// Flag bit of `create_sm` that creates a kernel page instead.
pub const CREATE_SM_FLAG_KP: u64 = 1 << 3;

/// Sub-operations of `ec_ctrl`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, IntoEnumIterator)]
#[repr(u64)]
pub enum EcCtrlOp {
    Recall = 0,
}

/// Sub-operations of `sm_ctrl`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, IntoEnumIterator)]
#[repr(u64)]
pub enum SmCtrlOp {
    Up = 0,
    Down = 1,
}

/// Sub-operations of `machine_ctrl`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, IntoEnumIterator)]
#[repr(u64)]
pub enum MachineCtrlOp {
    Suspend = 0,
    UpdateMicrocode = 1,
}

macro_rules! impl_subop {
    ($name:ident) => {
        impl $name {
            pub fn val(self) -> u64 {
                self as u64
            }

            /// Decodes the sub-operation from the flags field of the first
            /// argument register.
            pub fn try_from_flags(arg1: u64) -> Option<Self> {
                let op = (arg1 >> FLAGS_SHIFT) & FLAGS_BITS;
                Self::into_enum_iter().find(|o| o.val() == op)
            }
        }
    };
}

impl_subop!(PdCtrlOp);
impl_subop!(EcCtrlOp);
impl_subop!(SmCtrlOp);
impl_subop!(MachineCtrlOp);

/// Hypercall status, returned in the low byte of the first register.
/// All values except [`Status::Success`] are errors.
#[derive(Debug, Copy, Clone, PartialEq, Eq, IntoEnumIterator)]
#[repr(u64)]
pub enum Status {
    /// The operation completed successfully.
    Success = 0,
    /// The operation timed out.
    ComTim = 1,
    /// The operation was aborted.
    ComAbt = 2,
    /// An invalid hypercall number was used.
    BadHyp = 3,
    /// A hypercall referred to an empty or otherwise invalid capability.
    BadCap = 4,
    /// A hypercall used invalid parameters.
    BadPar = 5,
    /// An unavailable feature was requested.
    BadFtr = 6,
    /// A portal capability was used on the wrong CPU.
    BadCpu = 7,
    /// An invalid device ID was passed.
    BadDev = 8,
}

impl Status {
    /// Only the lowest 8 bits of the first register encode the status.
    const STATUS_BITS: u64 = 0xff;

    pub fn val(self) -> u64 {
        self as u64
    }
}

impl From<u64> for Status {
    fn from(val: u64) -> Self {
        let val = val & Self::STATUS_BITS;
        for variant in Self::into_enum_iter() {
            if variant.val() == val {
                return variant;
            }
        }
        panic!("invalid status! id={}", val);
    }
}
