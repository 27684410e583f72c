//! The saved register file of an execution context.
//!
//! Hypercall arguments travel in RDI, RSI, RDX, RAX and R8; the status
//! comes back in the low byte of RDI. This matches the userland syscall
//! wrappers.

use libmuon::hypercall::Status;
use libmuon::mtd::Mtd;

/// Saved architectural state of an EC, plus the kernel bookkeeping that
/// rides along with it (pending message-transfer descriptor, destination
/// portal offset, nested-paging fault info).
#[derive(Debug, Clone, Default)]
#[repr(C)]
pub struct CpuRegs {
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,

    pub rip: u64,
    pub rflags: u64,

    /// Exception vector and error code of the last kernel entry.
    pub vec: u64,
    pub err: u64,
    pub cr2: u64,

    /// Guest-physical fault address and qualification of the last nested
    /// paging exit.
    pub nst_fault: u64,
    pub nst_error: u64,

    /// MTD governing the state transfer of the in-flight message.
    pub mtd: Mtd,
    /// Instruction length for RIP advancing on reply.
    pub inst_len: u64,
    /// Event offset the next kernel-originated message is sent to.
    pub dst_portal: u64,
}

impl CpuRegs {
    pub fn new() -> Self {
        Self {
            mtd: Mtd::NONE,
            ..Self::default()
        }
    }

    /// First hypercall argument: number, flags and payload.
    pub fn arg1(&self) -> u64 {
        self.rdi
    }

    pub fn arg2(&self) -> u64 {
        self.rsi
    }

    pub fn arg3(&self) -> u64 {
        self.rdx
    }

    pub fn arg4(&self) -> u64 {
        self.rax
    }

    pub fn arg5(&self) -> u64 {
        self.r8
    }

    /// Capability selector embedded in the first argument register.
    pub fn sel(&self) -> u64 {
        self.rdi >> 8
    }

    /// The 4-bit sub-operation/flags field of the first argument.
    pub fn flags(&self) -> u64 {
        (self.rdi >> 4) & 0xf
    }

    pub fn set_status(&mut self, status: Status) {
        self.rdi = status.val();
    }

    pub fn set_out2(&mut self, val: u64) {
        self.rsi = val;
    }

    /// Portal identifier handed to the callee on portal entry.
    pub fn set_pt(&mut self, id: u64) {
        self.rdi = id;
    }

    pub fn set_ip(&mut self, ip: u64) {
        self.rip = ip;
    }

    pub fn set_sp(&mut self, sp: u64) {
        self.rsp = sp;
    }

    /// Semaphore signal payload delivered on a signalled wake-up.
    pub fn set_si_regs(&mut self, value: u64, count: u64) {
        self.rsi = value;
        self.rdx = count;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arg_encoding() {
        let mut regs = CpuRegs::new();
        regs.rdi = (0x30 << 8) | (0x2 << 4) | 0x8;

        assert_eq!(0x30, regs.sel());
        assert_eq!(0x2, regs.flags());
        assert_eq!(0x8, regs.arg1() & 0xf);

        regs.set_status(Status::BadCap);
        assert_eq!(Status::BadCap.val(), regs.rdi);
    }
}
