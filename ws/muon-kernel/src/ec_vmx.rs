//! VM-exit handling: translating exits into portal messages and loading
//! guest state around VM entries.

use crate::arch;
use crate::counter::Counter;
use crate::cpulocal::Cpu;
use crate::ec::{
    Ec,
    ReturnPath,
};
use crate::vmx::{
    VcpuState,
    VmcsField,
};
use libmuon::event_offset::VmxReason;
use libmuon::mtd::Mtd;
use libmuon::utcb::UtcbFrame;

/// Entry point of the VM-exit path: decodes the exit reason of the
/// current vCPU and turns it into a pseudo-message to the portal at
/// `event_base + reason`. The reply re-enters the guest.
pub fn handle_vmx() {
    let ec = Ec::current();
    let vcpu = ec.vcpu.as_ref().expect("VM exit without vCPU");
    let vmcs = &vcpu.vmcs;

    let reason = vmcs.read(VmcsField::ExiReason) & 0xff;
    Counter::tick_vmi(reason as usize);

    match reason {
        r if r == VmxReason::ExternalInterrupt.val() => {
            // Host interrupt while the guest ran: handle it in the host
            // and resume the guest without bothering user space.
            ec.set_continuation(crate::ec::Continuation::RetUser(ReturnPath::VmResume));
            return;
        }
        r if r == VmxReason::EptViolation.val() => {
            let regs = unsafe { ec.regs_mut() };
            regs.nst_error = vmcs.read(VmcsField::ExiQualification);
            regs.nst_fault = vmcs.read(VmcsField::InfoPhysAddr);
        }
        _ => {}
    }

    unsafe { ec.regs_mut() }.dst_portal = reason;
    ec.set_continuation(crate::ec::Continuation::SendMsg(ReturnPath::VmResume));
}

/// Prepares the current vCPU for VM entry: loads its VMCS, allocates the
/// VPID on first dispatch and drops stale guest translations.
pub fn prepare_vmentry(ec: &Ec) {
    let vcpu = ec.vcpu.as_ref().expect("vmentry without vCPU");
    let cpu = Cpu::id();

    vcpu.vmcs.make_current();
    vcpu.vmcs.write(VmcsField::Vpid, vcpu.vpid(cpu) as u64);

    let mem = ec.pd().mem();
    if mem.gtlb.chk(cpu) {
        mem.gtlb.clr(cpu);
        mem.ept().flush();
        arch::invvpid(vcpu.vpid(cpu));
    }
}

/// Copies MTD-selected guest state into the UTCB frame of the handler.
pub fn load_vmx(frame: &mut UtcbFrame, ec: &Ec) {
    let vcpu = ec.vcpu.as_ref().expect("no vCPU state");
    let vmcs = &vcpu.vmcs;
    let regs = ec.regs();
    let mtd = regs.mtd;

    frame.mtd = mtd;

    if mtd.contains(Mtd::GPR_ACDB) {
        frame.rax = regs.rax;
        frame.rcx = regs.rcx;
        frame.rdx = regs.rdx;
        frame.rbx = regs.rbx;
    }

    if mtd.contains(Mtd::GPR_BSD) {
        frame.rbp = regs.rbp;
        frame.rsi = regs.rsi;
        frame.rdi = regs.rdi;
    }

    if mtd.contains(Mtd::GPR_R8_R15) {
        frame.r8 = regs.r8;
        frame.r9 = regs.r9;
        frame.r10 = regs.r10;
        frame.r11 = regs.r11;
        frame.r12 = regs.r12;
        frame.r13 = regs.r13;
        frame.r14 = regs.r14;
        frame.r15 = regs.r15;
    }

    if mtd.contains(Mtd::RSP) {
        frame.rsp = vmcs.read(VmcsField::GuestRsp);
    }

    if mtd.contains(Mtd::RIP_LEN) {
        frame.rip = vmcs.read(VmcsField::GuestRip);
        frame.inst_len = vmcs.read(VmcsField::ExiInstLen);
    }

    if mtd.contains(Mtd::RFLAGS) {
        frame.rflags = vmcs.read(VmcsField::GuestRflags);
    }

    if mtd.contains(Mtd::CR) {
        frame.cr0 = vmcs.read(VmcsField::GuestCr0);
        frame.cr3 = vmcs.read(VmcsField::GuestCr3);
        frame.cr4 = vmcs.read(VmcsField::GuestCr4);
        frame.cr2 = regs.cr2;
    }

    if mtd.contains(Mtd::QUAL) {
        frame.qual = [regs.nst_error, regs.nst_fault];
    }

    if mtd.contains(Mtd::INJ) {
        frame.intr_info = vmcs.read(VmcsField::IdtVectInfo) as u32;
        frame.intr_error = vmcs.read(VmcsField::IdtVectError) as u32;
    }

    if mtd.contains(Mtd::STA) {
        frame.intr_state = vmcs.read(VmcsField::GuestIntrState) as u32;
        frame.actv_state = vmcs.read(VmcsField::GuestActvState) as u32;
    }

    if mtd.contains(Mtd::TSC) {
        frame.tsc_off = vmcs.read(VmcsField::TscOffset);
    }

    if mtd.contains(Mtd::SYSENTER) {
        frame.sysenter_rsp = vmcs.read(VmcsField::GuestSysenterEsp);
        frame.sysenter_rip = vmcs.read(VmcsField::GuestSysenterEip);
    }
}

/// Writes MTD-selected state from the UTCB frame back into the guest,
/// including event injection.
pub fn save_vmx(frame: &UtcbFrame, ec: &Ec) {
    let vcpu: &VcpuState = ec.vcpu.as_ref().expect("no vCPU state");
    let vmcs = &vcpu.vmcs;
    let regs = unsafe { ec.regs_mut() };
    let mtd = frame.mtd;

    if mtd.contains(Mtd::GPR_ACDB) {
        regs.rax = frame.rax;
        regs.rcx = frame.rcx;
        regs.rdx = frame.rdx;
        regs.rbx = frame.rbx;
    }

    if mtd.contains(Mtd::GPR_BSD) {
        regs.rbp = frame.rbp;
        regs.rsi = frame.rsi;
        regs.rdi = frame.rdi;
    }

    if mtd.contains(Mtd::GPR_R8_R15) {
        regs.r8 = frame.r8;
        regs.r9 = frame.r9;
        regs.r10 = frame.r10;
        regs.r11 = frame.r11;
        regs.r12 = frame.r12;
        regs.r13 = frame.r13;
        regs.r14 = frame.r14;
        regs.r15 = frame.r15;
    }

    if mtd.contains(Mtd::RSP) {
        vmcs.write(VmcsField::GuestRsp, frame.rsp);
    }

    if mtd.contains(Mtd::RIP_LEN) {
        vmcs.write(VmcsField::GuestRip, frame.rip);
        vmcs.write(VmcsField::EntInstLen, frame.inst_len);
    }

    if mtd.contains(Mtd::RFLAGS) {
        vmcs.write(VmcsField::GuestRflags, frame.rflags);
    }

    if mtd.contains(Mtd::CR) {
        vmcs.write(VmcsField::GuestCr0, frame.cr0);
        vmcs.write(VmcsField::GuestCr3, frame.cr3);
        vmcs.write(VmcsField::GuestCr4, frame.cr4);
        regs.cr2 = frame.cr2;
    }

    if mtd.contains(Mtd::INJ) {
        vmcs.write(VmcsField::EntIntrInfo, frame.intr_info as u64);
        vmcs.write(VmcsField::EntIntrError, frame.intr_error as u64);
    }

    if mtd.contains(Mtd::STA) {
        vmcs.write(VmcsField::GuestIntrState, frame.intr_state as u64);
        vmcs.write(VmcsField::GuestActvState, frame.actv_state as u64);
    }

    if mtd.contains(Mtd::TSC) {
        vmcs.write(VmcsField::TscOffset, frame.tsc_off);
    }

    if mtd.contains(Mtd::SYSENTER) {
        vmcs.write(VmcsField::GuestSysenterEsp, frame.sysenter_rsp);
        vmcs.write(VmcsField::GuestSysenterEip, frame.sysenter_rip);
    }

    if mtd.contains(Mtd::TLB) {
        let mem = ec.pd().mem();
        mem.gtlb.merge(&mem.cpus);
    }
}
