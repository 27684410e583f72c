//! Typings for Message Transfer Descriptors.

use bitflags::bitflags;

bitflags! {
    #[derive(Default)]
    /// The Message Transfer Descriptor (MTD) is an architecture-specific
    /// bitfield that controls the contents of an exception or intercept
    /// message. For each bit set to 1, the kernel transfers the
    /// architectural state associated with that bit between the UTCB data
    /// area (or the VMCS for vCPUs) and the register file when a portal
    /// is crossed.
    pub struct Mtd: u64 {
        /// Registers `rAX, rCX, rDX, rBX`.
        const GPR_ACDB = 1 << 0;
        /// Registers `rBP, rSI, rDI`.
        const GPR_BSD = 1 << 1;
        const RSP = 1 << 2;
        /// Instruction pointer and instruction length.
        const RIP_LEN = 1 << 3;
        const RFLAGS = 1 << 4;
        const DS_ES = 1 << 5;
        const FS_GS = 1 << 6;
        const CS_SS = 1 << 7;
        const TR = 1 << 8;
        const LDTR = 1 << 9;
        const GDTR = 1 << 10;
        const IDTR = 1 << 11;
        const CR = 1 << 12;
        const DR = 1 << 13;
        const SYSENTER = 1 << 14;
        /// Exit qualification / page-fault address.
        const QUAL = 1 << 15;
        const CTRL = 1 << 16;
        /// Event injection (ENT_INTR_INFO / ENT_INTR_ERROR).
        const INJ = 1 << 17;
        /// Interruptibility and activity state.
        const STA = 1 << 18;
        const TSC = 1 << 19;
        const EFER_PAT = 1 << 20;
        const PDPTE = 1 << 21;
        const GPR_R8_R15 = 1 << 22;
        /// STAR/LSTAR/FMASK/KERNEL_GS_BASE.
        const SYSCALL_SWAPGS = 1 << 23;
        const TSC_TIMEOUT = 1 << 24;

        const VINTR = 1 << 26;
        const EOI = 1 << 27;
        const TPR = 1 << 28;

        /// Request a guest TLB flush on reply.
        const TLB = 1 << 30;
        const FPU = 1 << 31;

        const NONE = 0;
    }
}

impl Mtd {
    /// The default transfer set for exception messages.
    pub const DEFAULT: Self = Self::from_bits_truncate(0xff_ffff);
}
