//! The hypercall interface and the IPC paths.
//!
//! Hypercall handlers run on behalf of the current EC. They validate
//! capabilities, mutate kernel state, set continuations and return; the
//! trampoline in [`Ec::resume`] then drives execution until the CPU can
//! leave the kernel.

use crate::arch;
use crate::arch::IpiVector;
use crate::capability::capability_cast;
use crate::cpulocal::Cpu;
use crate::ec::{
    Continuation,
    Ec,
    EcCreation,
    Exit,
    ReturnPath,
};
use crate::gsi::Gsi;
use crate::hazards::HZD_RECALL;
use crate::kp::Kp;
use crate::pci::Pci;
use crate::pd::Pd;
use crate::pt::Pt;
use crate::rcu::Rcu;
use crate::sc::Sc;
use crate::sm::Sm;
use crate::space::SpaceObj;
use crate::kobject::{
    Object,
    Refcounted,
};
use alloc::boxed::Box;
use core::ptr;
use libmuon::crd::Crd;
use libmuon::hypercall::{
    EcCtrlOp,
    Hypercall,
    MachineCtrlOp,
    PdCtrlOp,
    SmCtrlOp,
    Status,
    CREATE_SM_FLAG_KP,
};
use libmuon::mem::{
    PAGE_BITS,
    PAGE_MASK,
};
use libmuon::mtd::Mtd;
use libmuon::qpd::Qpd;
use libmuon::utcb::UtcbFrame;
use log::trace;

// ---------------------------------------------------------------------------
// Kernel entry points, called by the assembly layer.

/// Hypercall entry: the user registers have been saved into the current
/// EC.
pub fn handle_syscall() -> Exit {
    dispatch(Ec::current());
    Ec::resume()
}

/// Exception entry.
pub fn handle_exception(vec: u64, err: u64, cr2: u64) -> Exit {
    let ec = Ec::current();

    {
        let regs = unsafe { ec.regs_mut() };
        regs.vec = vec;
        regs.err = err;
        regs.cr2 = cr2;
    }

    // Faults in the object-space window lazily install the shared zero
    // page.
    if vec == 14
        && cr2 >= crate::config::OBJ_SPACE_BASE
        && cr2 < crate::config::IOP_SPACE_BASE
        && err & crate::pagetable::hpt::Hpt::ERR_W == 0
    {
        let _ = Pd::current().obj().page_fault(cr2, err);
        return Ec::resume();
    }

    unsafe { ec.regs_mut() }.dst_portal = vec;
    ec.set_continuation(Continuation::SendMsg(ReturnPath::Iret));
    Ec::resume()
}

/// VM-exit entry.
pub fn handle_vmexit() -> Exit {
    crate::ec_vmx::handle_vmx();
    Ec::resume()
}

/// Timer interrupt entry.
pub fn handle_timer() -> Exit {
    crate::timeout::Timeout::check();
    Cpu::set_hazard(crate::hazards::HZD_SCHED);
    Ec::resume()
}

/// Kernel-IPI entry.
pub fn handle_ipi(vector: IpiVector) -> Exit {
    match vector {
        IpiVector::Rrq => Sc::rrq_handler(),
        IpiVector::Rke => Sc::rke_handler(),
        IpiVector::Idl => Rcu::update(),
    }
    Ec::resume()
}

// ---------------------------------------------------------------------------
// Helpers.

fn finish(ec: &Ec, status: Status) {
    ec.set_continuation(Continuation::SysFinish(status, false));
}

/// Makes `ec` runnable and switches to the best EC afterwards; used by
/// reply paths.
pub(crate) fn activate(ec: &Ec) {
    let bottom = ec.bottom_of_chain();

    if bottom.try_make_current() {
        return;
    }

    if let Some(sc) = Sc::current() {
        if bottom.park_waiter(sc) {
            Sc::schedule(true);
            return;
        }
    }

    bottom.make_current();
}

// ---------------------------------------------------------------------------
// Message transfer.

/// Copies MTD-selected exception state of `src` into a UTCB frame.
fn load_exc(frame: &mut UtcbFrame, src: &Ec) {
    let regs = src.regs();
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
        frame.rsp = regs.rsp;
    }

    if mtd.contains(Mtd::RIP_LEN) {
        frame.rip = regs.rip;
        frame.inst_len = regs.inst_len;
    }

    if mtd.contains(Mtd::RFLAGS) {
        frame.rflags = regs.rflags;
    }

    if mtd.contains(Mtd::QUAL) {
        frame.qual = [regs.err, regs.cr2];
    }
}

/// Writes MTD-selected state of a UTCB frame back into `dst`.
fn save_exc(frame: &UtcbFrame, dst: &Ec) {
    let regs = unsafe { dst.regs_mut() };
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
        regs.rsp = frame.rsp;
    }

    if mtd.contains(Mtd::RIP_LEN) {
        regs.rip = frame.rip;
    }

    if mtd.contains(Mtd::RFLAGS) {
        // User-controlled flags cannot switch off interrupts.
        regs.rflags = (frame.rflags & !0x200) | 0x200;
    }
}

/// Runs the typed items of `src`'s UTCB through the delegation engine.
/// With `user`, the receive windows come from `dst`'s UTCB and results
/// are written back there; otherwise the implicit page-fault window of
/// `dst` is used.
fn transfer_typed_items(src: &Ec, dst: &Ec, user: bool) {
    let src_utcb = match src.utcb() {
        Some(utcb) => utcb,
        None => return,
    };

    let (xlt, del) = if user {
        let dst_utcb = dst.utcb().expect("user transfer without UTCB");
        (dst_utcb.xlt_crd(), dst_utcb.dlt_crd())
    } else {
        let window = if dst.continuation() == Continuation::RetUser(ReturnPath::Iret) {
            dst.regs().cr2
        } else {
            0
        };
        (
            Crd::NULL,
            Crd::new(libmuon::crd::CrdKind::Mem, window >> PAGE_BITS, 0x1f, 0x1f),
        )
    };

    let items = (0..src_utcb.typed_count()).map(|idx| src_utcb.typed_item(idx));

    dst.pd().xfer_items(src.pd(), xlt, del, items, |idx, res| {
        if user {
            if let Some(dst_utcb) = unsafe { dst.utcb_mut() } {
                dst_utcb.set_typed_item(idx, res);
            }
        }
    });
}

/// Continuation side of a kernel-originated message: the handler EC picks
/// the event state up from its caller.
pub(crate) fn recv_kern(ec: &Ec) {
    let caller = ec.rcap().expect("recv_kern without a caller");
    let utcb = unsafe { ec.utcb_mut() }.expect("event handlers need a UTCB");

    match caller.continuation() {
        Continuation::RetUser(ReturnPath::VmResume) => {
            crate::ec_vmx::load_vmx(utcb.frame_mut(), caller);
        }
        _ => load_exc(utcb.frame_mut(), caller),
    }

    ec.set_continuation(Continuation::RetUser(ReturnPath::Sysret));
}

/// Continuation side of a user call: copy the payload, run typed items.
pub(crate) fn recv_user(ec: &Ec) {
    let caller = ec.rcap().expect("recv_user without a caller");

    if let (Some(src), Some(dst)) = (caller.utcb(), unsafe { ec.utcb_mut() }) {
        src.copy_payload_to(dst);
    }

    if caller.utcb().map_or(0, |u| u.typed_count()) > 0 {
        transfer_typed_items(caller, ec, true);
    }

    ec.set_continuation(Continuation::RetUser(ReturnPath::Sysret));
}

/// Sends a kernel-originated event message to `event_base + dst_portal`
/// of the current EC.
pub(crate) fn send_msg(ec: &Ec, path: ReturnPath) {
    let portal_sel = ec.evt + ec.regs().dst_portal;

    let pt = match capability_cast::<Pt>(ec.pd().obj().lookup(portal_sel), 0) {
        Some(pt) => pt,
        None => return Ec::die("PT not found"),
    };

    let target: &Ec = &pt.ec;

    if target.cpu != ec.cpu {
        return Ec::die("PT wrong CPU");
    }

    if target.claim_idle(Continuation::RecvKern) {
        ec.set_continuation(path.into());
        ec.set_partner(target);
        unsafe { ec.regs_mut() }.mtd = pt.mtd;

        let tregs = unsafe { target.regs_mut() };
        tregs.set_pt(pt.id());
        tregs.set_ip(pt.ip);

        target.make_current();
        return;
    }

    if target.is_dead() {
        return Ec::die("IPC Timeout");
    }

    target.help(Continuation::SendMsg(path));
}

/// The `call` hypercall.
pub(crate) fn sys_call(ec: &Ec) {
    let sel = ec.regs().sel();
    let blocking = ec.regs().flags() & 1 == 0;

    // Calls are not permission-gated: holding the portal capability
    // suffices.
    let pt = match capability_cast::<Pt>(ec.pd().obj().lookup(sel), 0) {
        Some(pt) => pt,
        None => return finish(ec, Status::BadCap),
    };

    let target: &Ec = &pt.ec;

    if target.cpu != ec.cpu {
        return finish(ec, Status::BadCpu);
    }

    if target.claim_idle(Continuation::RecvUser) {
        ec.set_continuation(Continuation::RetUser(ReturnPath::Sysret));
        ec.set_partner(target);

        let tregs = unsafe { target.regs_mut() };
        tregs.set_pt(pt.id());
        tregs.set_ip(pt.ip);

        target.make_current();
        return;
    }

    if blocking && !target.is_dead() {
        target.help(Continuation::SysCall);
        return;
    }

    finish(ec, Status::ComTim);
}

/// Core of `reply` and of unwinding paths: sever the partner link and
/// resume whoever should run.
pub(crate) fn do_reply(next_cont: Continuation, sm: Option<&Sm>) {
    let cur = Ec::current();
    cur.set_continuation(next_cont);

    // A global EC replying has nobody to switch back to on its own SC.
    if cur.glb {
        Sc::schedule(true);
        return;
    }

    let caller = match cur.rcap() {
        Some(caller) => caller,
        None => {
            if let Some(sc) = Sc::current() {
                activate(&sc.ec);
            }
            return;
        }
    };

    let remaining = caller.clr_partner();

    if let Some(sc) = Sc::current() {
        if ptr::eq(sc.ec.raw() as *const Ec, caller) && sc.refcount().last_ref() {
            Sc::schedule(true);
            return;
        }
    }

    if let Some(sm) = sm {
        // Reply-and-wait: the caller immediately blocks on the semaphore
        // unless a count is already available.
        if sm.dn(false, 0, caller, remaining != 0) {
            return;
        }
    }

    if remaining == 0 {
        if let Some(sc) = Sc::current() {
            activate(&sc.ec);
            return;
        }
    }

    caller.make_current();
}

/// The `reply` hypercall.
fn sys_reply(ec: &Ec) {
    let mut sm: Option<&Sm> = None;

    if let Some(caller) = ec.rcap() {
        let sm_sel = ec.regs().sel();
        if sm_sel != 0 {
            sm = capability_cast::<Sm>(ec.pd().obj().lookup(sm_sel), 0);

            if sm.is_some() && caller.continuation() == Continuation::RetUser(ReturnPath::Sysret) {
                // The caller re-issues its call once the semaphore fires.
                caller.set_continuation(Continuation::SysCall);
            }
        }

        if ec.utcb().map_or(0, |u| u.typed_count()) > 0 {
            transfer_typed_items(ec, caller, caller.continuation() == Continuation::RetUser(ReturnPath::Sysret));
        }

        match caller.continuation() {
            Continuation::RetUser(ReturnPath::Sysret) | Continuation::SysCall => {
                if let (Some(src), Some(dst)) = (ec.utcb(), unsafe { caller.utcb_mut() }) {
                    src.copy_payload_to(dst);
                }
            }
            Continuation::RetUser(ReturnPath::Iret) => {
                if let Some(src) = ec.utcb() {
                    save_exc(src.frame(), caller);
                }
            }
            Continuation::RetUser(ReturnPath::VmResume) => {
                if let Some(src) = ec.utcb() {
                    crate::ec_vmx::save_vmx(src.frame(), caller);
                }
            }
            _ => {}
        }
    }

    do_reply(Continuation::None_, sm);
}

// ---------------------------------------------------------------------------
// Object creation.

fn insert_or_status<T: Object>(obj: Box<T>) -> Result<&'static T, Status> {
    let obj = Box::leak(obj);

    match SpaceObj::insert_root(obj.kobj()) {
        Ok(true) => Ok(obj),
        Ok(false) => {
            trace!("non-null capability slot");
            let _ = unsafe { Box::from_raw(obj as *mut T) };
            Err(Status::BadCap)
        }
        Err(_) => {
            let _ = unsafe { Box::from_raw(obj as *mut T) };
            Err(Status::BadPar)
        }
    }
}

fn sys_create_pd(ec: &Ec) {
    let regs = ec.regs();
    let sel = regs.sel();

    trace!("EC:{:p} SYS_CREATE PD:{:#x}", ec, sel);

    let parent_cap = ec.pd().obj().lookup(regs.arg2());
    let parent = match capability_cast::<Pd>(parent_cap, Pd::PERM_OBJ_CREATION) {
        Some(parent) => parent,
        None => return finish(ec, Status::BadCap),
    };

    let passthrough = regs.flags() & 1 != 0 && parent.is_passthrough;

    let pd = match Pd::create(Pd::current(), sel, parent_cap.prm(), passthrough) {
        Ok(pd) => pd,
        Err(_) => return finish(ec, Status::BadPar),
    };

    let pd = match insert_or_status(pd) {
        Ok(pd) => pd,
        Err(status) => return finish(ec, status),
    };

    // Seed the child's object space from the creator through the window
    // in arg3.
    let crd = Crd::from_raw(regs.arg3());
    if !crd.is_null() {
        let _ = pd.del_crd(Pd::current(), Crd::whole(libmuon::crd::CrdKind::Obj), crd, 0, 0);
    }

    finish(ec, Status::Success);
}

fn sys_create_ec(ec: &Ec) {
    let regs = ec.regs();
    let sel = regs.sel();
    let flags = regs.flags();

    let cpu = (regs.arg3() & PAGE_MASK) as usize;
    let user_page = regs.arg3() & !PAGE_MASK;
    let evt = regs.arg5();

    trace!(
        "EC:{:p} SYS_CREATE EC:{:#x} CPU:{} UPAGE:{:#x} EVT:{:#x}",
        ec,
        sel,
        cpu,
        user_page,
        evt
    );

    if cpu >= Cpu::online() {
        return finish(ec, Status::BadCpu);
    }

    let vcpu = flags & 2 != 0;
    if vcpu && !arch::has_vmx() {
        return finish(ec, Status::BadFtr);
    }

    let pd = match capability_cast::<Pd>(ec.pd().obj().lookup(regs.arg2()), Pd::PERM_OBJ_CREATION) {
        Some(pd) => pd,
        None => return finish(ec, Status::BadCap),
    };

    if user_page >= crate::config::USER_ADDR_LIMIT {
        return finish(ec, Status::BadPar);
    }

    let creation = EcCreation {
        global: flags & 1 != 0,
        vcpu,
        apic_access_page: flags & 4 != 0,
        map_user_page_in_owner: flags & 8 != 0,
    };

    let new_ec = match Ec::create(Pd::current(), sel, pd, cpu, evt, user_page, regs.arg4(), creation) {
        Ok(new_ec) => new_ec,
        Err(status) => return finish(ec, status),
    };

    match insert_or_status(new_ec) {
        Ok(_) => finish(ec, Status::Success),
        Err(status) => finish(ec, status),
    }
}

fn sys_create_sc(ec: &Ec) {
    let regs = ec.regs();
    let sel = regs.sel();
    let qpd = Qpd::from_raw(regs.arg3());

    trace!(
        "EC:{:p} SYS_CREATE SC:{:#x} EC:{:#x} P:{} Q:{}",
        ec,
        sel,
        regs.arg2(),
        qpd.prio(),
        qpd.quantum()
    );

    let target = match capability_cast::<Ec>(ec.pd().obj().lookup(regs.arg2()), 1 << 2) {
        Some(target) => target,
        None => return finish(ec, Status::BadCap),
    };

    if !target.glb {
        return finish(ec, Status::BadCap);
    }

    if qpd.prio() == 0
        || qpd.quantum() == 0
        || qpd.prio() as usize >= crate::config::NUM_PRIORITIES
    {
        return finish(ec, Status::BadPar);
    }

    // Budget in TSC ticks: quantum is in microseconds.
    let budget = qpd.quantum() * arch::tsc_freq_khz() / 1000;

    let sc = match Sc::create(Pd::current(), sel, target, target.cpu, qpd.prio() as u8, budget) {
        Some(sc) => sc,
        None => return finish(ec, Status::BadCap),
    };

    match insert_or_status(sc) {
        Ok(sc) => {
            sc.remote_enqueue(true);
            finish(ec, Status::Success)
        }
        Err(status) => finish(ec, status),
    }
}

fn sys_create_pt(ec: &Ec) {
    let regs = ec.regs();
    let sel = regs.sel();

    trace!("EC:{:p} SYS_CREATE PT:{:#x} EC:{:#x} IP:{:#x}", ec, sel, regs.arg2(), regs.arg4());

    let target = match capability_cast::<Ec>(ec.pd().obj().lookup(regs.arg2()), 1 << 3) {
        Some(target) => target,
        None => return finish(ec, Status::BadCap),
    };

    if target.glb {
        return finish(ec, Status::BadCap);
    }

    let mtd = Mtd::from_bits_truncate(regs.arg3());

    let pt = match Pt::create(Pd::current(), sel, target, mtd, regs.arg4()) {
        Some(pt) => pt,
        None => return finish(ec, Status::BadCap),
    };

    match insert_or_status(pt) {
        Ok(_) => finish(ec, Status::Success),
        Err(status) => finish(ec, status),
    }
}

fn sys_create_sm(ec: &Ec) {
    let regs = ec.regs();
    let sel = regs.sel();

    // The same hypercall creates kernel pages.
    if regs.arg1() & (CREATE_SM_FLAG_KP << 4) != 0 {
        return sys_create_kp(ec);
    }

    trace!("EC:{:p} SYS_CREATE SM:{:#x} CNT:{}", ec, sel, regs.arg3());

    if capability_cast::<Pd>(ec.pd().obj().lookup(regs.arg2()), Pd::PERM_OBJ_CREATION).is_none() {
        return finish(ec, Status::BadCap);
    }

    let chain_sel = regs.arg4();
    let sm = if chain_sel != 0 {
        let chain = match capability_cast::<Sm>(ec.pd().obj().lookup(chain_sel), Sm::PERM_UP) {
            Some(chain) => chain,
            None => return finish(ec, Status::BadCap),
        };

        // Chaining is limited to one level.
        if chain.is_signal() {
            return finish(ec, Status::BadCap);
        }

        Sm::create(
            Pd::current(),
            sel,
            0,
            chain as *const Sm as *mut Sm,
            regs.arg3(),
        )
    } else {
        Sm::create(Pd::current(), sel, regs.arg3(), ptr::null_mut(), 0)
    };

    match insert_or_status(sm) {
        Ok(_) => finish(ec, Status::Success),
        Err(status) => finish(ec, status),
    }
}

fn sys_create_kp(ec: &Ec) {
    let regs = ec.regs();
    let sel = regs.sel();

    trace!("EC:{:p} SYS_CREATE KP:{:#x}", ec, sel);

    if capability_cast::<Pd>(ec.pd().obj().lookup(regs.arg2()), Pd::PERM_OBJ_CREATION).is_none() {
        return finish(ec, Status::BadCap);
    }

    match insert_or_status(Kp::create(Pd::current(), sel)) {
        Ok(_) => finish(ec, Status::Success),
        Err(status) => finish(ec, status),
    }
}

// ---------------------------------------------------------------------------
// Revocation and PD control.

fn sys_revoke(ec: &Ec) {
    let regs = ec.regs();
    let crd = Crd::from_raw(regs.arg2());
    let include_self = regs.flags() & 1 != 0;
    let remote = regs.flags() & 2 != 0;

    trace!("EC:{:p} SYS_REVOKE {:?}", ec, crd);

    let pd: &Pd = if remote {
        match capability_cast::<Pd>(ec.pd().obj().lookup(regs.sel()), 0) {
            Some(pd) if pd.refcount().add_ref() => pd,
            _ => return finish(ec, Status::BadCap),
        }
    } else {
        Pd::current()
    };

    let result = pd.rev_crd(crd, include_self);

    if remote && pd.refcount().del_rcu() {
        Rcu::call(pd.kobj().rcu_elem());
    }

    if result.is_err() {
        return finish(ec, Status::BadPar);
    }

    let sm_sel = regs.arg3();
    if sm_sel != 0 {
        if let Some(sm) = capability_cast::<Sm>(ec.pd().obj().lookup(sm_sel), Sm::PERM_UP) {
            sm.add_to_rcu();
        }
    }

    finish(ec, Status::Success);
}

fn sys_pd_ctrl(ec: &Ec) {
    match PdCtrlOp::try_from_flags(ec.regs().arg1()) {
        Some(PdCtrlOp::Lookup) => sys_pd_ctrl_lookup(ec),
        Some(PdCtrlOp::Delegate) => sys_pd_ctrl_delegate(ec),
        Some(PdCtrlOp::KpMap) => sys_kp_ctrl_map(ec),
        Some(PdCtrlOp::KpUnmap) => sys_kp_ctrl_unmap(ec),
        None => finish(ec, Status::BadPar),
    }
}

fn sys_pd_ctrl_lookup(ec: &Ec) {
    let crd = Crd::from_raw(ec.regs().arg2());

    trace!("EC:{:p} SYS_LOOKUP {:?}", ec, crd);

    let result = Pd::current()
        .subspace(crd.kind())
        .map(|space| space.tree_lookup(crd.base(), false))
        .and_then(|node| unsafe { node.as_ref() })
        .map(|node| Crd::new(crd.kind(), node.node_base, node.node_order as u8, node.attr() as u8))
        .unwrap_or(Crd::NULL);

    unsafe { ec.regs_mut() }.set_out2(result.val());
    finish(ec, Status::Success);
}

fn sys_pd_ctrl_delegate(ec: &Ec) {
    let regs = ec.regs();

    let src = match capability_cast::<Pd>(ec.pd().obj().lookup(regs.sel()), 0) {
        Some(src) => src,
        None => return finish(ec, Status::BadCap),
    };
    let dst = match capability_cast::<Pd>(ec.pd().obj().lookup(regs.arg2()), 0) {
        Some(dst) => dst,
        None => return finish(ec, Status::BadCap),
    };

    let item = libmuon::crd::Xfer::new(Crd::from_raw(regs.arg3()), regs.arg4());
    let window = Crd::from_raw(regs.arg5());

    let result = dst.xfer_item(src, window, window, item);

    let regs = unsafe { ec.regs_mut() };
    regs.rdx = result.crd().val();
    regs.rax = result.metadata();

    finish(ec, Status::Success);
}

fn sys_kp_ctrl_map(ec: &Ec) {
    let regs = ec.regs();

    let kp = match capability_cast::<Kp>(ec.pd().obj().lookup(regs.sel()), Kp::PERM_KP_CTRL) {
        Some(kp) => kp,
        None => return finish(ec, Status::BadCap),
    };

    let dst_pd = match capability_cast::<Pd>(ec.pd().obj().lookup(regs.arg2()), 0) {
        Some(dst_pd) => dst_pd,
        None => return finish(ec, Status::BadCap),
    };

    match kp.add_user_mapping(dst_pd, regs.arg3()) {
        Ok(true) => finish(ec, Status::Success),
        Ok(false) => finish(ec, Status::BadPar),
        Err(_) => finish(ec, Status::BadPar),
    }
}

fn sys_kp_ctrl_unmap(ec: &Ec) {
    let kp = match capability_cast::<Kp>(ec.pd().obj().lookup(ec.regs().sel()), Kp::PERM_KP_CTRL) {
        Some(kp) => kp,
        None => return finish(ec, Status::BadCap),
    };

    if kp.remove_user_mapping() {
        finish(ec, Status::Success)
    } else {
        finish(ec, Status::BadPar)
    }
}

// ---------------------------------------------------------------------------
// Object control.

fn sys_ec_ctrl(ec: &Ec) {
    match EcCtrlOp::try_from_flags(ec.regs().arg1()) {
        Some(EcCtrlOp::Recall) => {
            let target = match capability_cast::<Ec>(ec.pd().obj().lookup(ec.regs().sel()), 1) {
                Some(target) => target,
                None => return finish(ec, Status::BadCap),
            };

            if target.hazard() & HZD_RECALL == 0 {
                target.set_hazard(HZD_RECALL);

                if Cpu::id() != target.cpu
                    && Ec::remote(target.cpu).map_or(false, |cur| ptr::eq(cur, target))
                {
                    arch::send_ipi(target.cpu, IpiVector::Rke);
                }
            }

            finish(ec, Status::Success);
        }
        None => finish(ec, Status::BadPar),
    }
}

fn sys_sc_ctrl(ec: &Ec) {
    let sc = match capability_cast::<Sc>(ec.pd().obj().lookup(ec.regs().sel()), 1) {
        Some(sc) => sc,
        None => return finish(ec, Status::BadCap),
    };

    // Consumed time in milliseconds.
    let ms = sc.time() / arch::tsc_freq_khz().max(1);
    unsafe { ec.regs_mut() }.set_out2(ms);

    finish(ec, Status::Success);
}

fn sys_pt_ctrl(ec: &Ec) {
    let pt = match capability_cast::<Pt>(ec.pd().obj().lookup(ec.regs().sel()), Pt::PERM_CTRL) {
        Some(pt) => pt,
        None => return finish(ec, Status::BadCap),
    };

    pt.set_id(ec.regs().arg2());
    finish(ec, Status::Success);
}

fn sys_sm_ctrl(ec: &Ec) {
    let regs = ec.regs();

    let op = match SmCtrlOp::try_from_flags(regs.arg1() & 0x1f) {
        Some(op) => op,
        None => return finish(ec, Status::BadPar),
    };

    let sm = match capability_cast::<Sm>(ec.pd().obj().lookup(regs.sel()), 1 << op.val()) {
        Some(sm) => sm,
        None => return finish(ec, Status::BadCap),
    };

    match op {
        SmCtrlOp::Up => {
            sm.submit();
            finish(ec, Status::Success);
        }
        SmCtrlOp::Down => {
            let zero = regs.flags() & 2 != 0;
            let deadline = regs.arg2();

            if let Some(gsi) = Gsi::gsi_of(sm) {
                Gsi::unmask(gsi);
                if sm.is_signal() {
                    // A chained GSI semaphore delivers through the chain.
                    return finish(ec, Status::Success);
                }
            } else if sm.is_signal() {
                return finish(ec, Status::BadCap);
            }

            ec.set_continuation(Continuation::SysFinish(Status::Success, true));
            sm.dn(zero, deadline, ec, true);
        }
    }
}

// ---------------------------------------------------------------------------
// Device assignment and machine control.

fn sys_assign_pci(ec: &Ec) {
    let regs = ec.regs();

    let pd = match capability_cast::<Pd>(ec.pd().obj().lookup(regs.sel()), 0) {
        Some(pd) => pd,
        None => return finish(ec, Status::BadCap),
    };

    let rid = match pd
        .mem()
        .lookup(regs.arg2())
        .and_then(|(phys, _)| Pci::phys_to_rid(phys))
    {
        Some(rid) => rid,
        None => return finish(ec, Status::BadDev),
    };

    let dmar = match Pci::find_dmar(regs.arg3()) {
        Some(dmar) => dmar,
        None => return finish(ec, Status::BadDev),
    };

    match dmar.assign(rid, pd) {
        Ok(()) => finish(ec, Status::Success),
        Err(_) => finish(ec, Status::BadPar),
    }
}

fn sys_assign_gsi(ec: &Ec) {
    let regs = ec.regs();
    let cpu = regs.arg3() as usize;

    if cpu >= Cpu::online() {
        return finish(ec, Status::BadCpu);
    }

    let sm = match capability_cast::<Sm>(ec.pd().obj().lookup(regs.sel()), 0) {
        Some(sm) => sm,
        None => return finish(ec, Status::BadCap),
    };

    let gsi = match Gsi::gsi_of(sm) {
        Some(gsi) => gsi,
        None => return finish(ec, Status::BadCap),
    };

    // Optional signal chaining to a user SM.
    let si_sel = regs.arg4();
    if si_sel != u64::MAX {
        let si = match capability_cast::<Sm>(ec.pd().obj().lookup(si_sel), 0) {
            Some(si) => si,
            None => return finish(ec, Status::BadCap),
        };

        if ptr::eq(si, sm) {
            sm.set_chain(ptr::null_mut());
            return finish(ec, Status::Success);
        }

        if Gsi::gsi_of(si).is_some() {
            return finish(ec, Status::BadCap);
        }

        sm.set_chain(si as *const Sm as *mut Sm);
    }

    let mut rid = 0;
    if !Gsi::is_ioapic(gsi) {
        rid = match Pd::current()
            .mem()
            .lookup(regs.arg2())
            .and_then(|(phys, _)| Pci::phys_to_rid(phys))
        {
            Some(rid) => rid,
            None => return finish(ec, Status::BadDev),
        };
    } else {
        let has_override = regs.flags() & 1 != 0;
        if !has_override {
            return finish(ec, Status::BadPar);
        }

        Gsi::set_polarity(gsi, regs.flags() & 2 != 0, regs.flags() & 4 != 0);
    }

    let (addr, data) = Gsi::route(gsi, cpu, rid);
    unsafe { ec.regs_mut() }.set_out2(addr << 32 | data);

    finish(ec, Status::Success);
}

fn sys_machine_ctrl(ec: &Ec) {
    if !Pd::current().is_passthrough {
        return finish(ec, Status::BadCap);
    }

    match MachineCtrlOp::try_from_flags(ec.regs().arg1()) {
        Some(MachineCtrlOp::Suspend) => sys_machine_ctrl_suspend(ec),
        Some(MachineCtrlOp::UpdateMicrocode) => sys_machine_ctrl_update_microcode(ec),
        None => finish(ec, Status::BadPar),
    }
}

fn sys_machine_ctrl_suspend(ec: &Ec) {
    let regs = ec.regs();
    let slp_typa = (regs.arg2() & 0xff) as u8;
    let slp_typb = ((regs.arg2() >> 8) & 0xff) as u8;

    unsafe { ec.regs_mut() }.set_out2(arch::waking_vector());

    // On a successful transition we never return from the suspend call.
    ec.set_continuation(Continuation::SysFinish(Status::Success, false));

    if !arch::acpi_suspend(slp_typa, slp_typb) {
        finish(ec, Status::BadPar);
    }
}

fn sys_machine_ctrl_update_microcode(ec: &Ec) {
    let regs = ec.regs();
    let size = regs.arg3();

    // Bound the mapped window the kernel is willing to touch.
    if size > 1 << 20 {
        return finish(ec, Status::BadPar);
    }

    let phys = match Pd::current().mem().lookup(regs.arg2()) {
        Some((phys, _)) => phys,
        None => return finish(ec, Status::BadPar),
    };

    // The WRMSR expects a pointer to the payload, 48 bytes into the BLOB.
    #[cfg(not(test))]
    unsafe {
        x86::msr::wrmsr(0x79, crate::kalloc::phys_to_ptr(phys) as u64 + 48);
    }
    #[cfg(test)]
    let _ = phys;

    finish(ec, Status::Success);
}

// ---------------------------------------------------------------------------
// The dispatcher.

/// Decodes and runs one hypercall for `ec`.
pub fn dispatch(ec: &Ec) {
    let num = match Hypercall::try_from_arg(ec.regs().arg1()) {
        Some(num) => num,
        None => return finish(ec, Status::BadHyp),
    };

    match num {
        Hypercall::Call => sys_call(ec),
        Hypercall::Reply => sys_reply(ec),
        Hypercall::CreatePd => sys_create_pd(ec),
        Hypercall::CreateEc => sys_create_ec(ec),
        Hypercall::CreateSc => sys_create_sc(ec),
        Hypercall::CreatePt => sys_create_pt(ec),
        Hypercall::CreateSm => sys_create_sm(ec),
        Hypercall::Revoke => sys_revoke(ec),
        Hypercall::PdCtrl => sys_pd_ctrl(ec),
        Hypercall::EcCtrl => sys_ec_ctrl(ec),
        Hypercall::ScCtrl => sys_sc_ctrl(ec),
        Hypercall::PtCtrl => sys_pt_ctrl(ec),
        Hypercall::SmCtrl => sys_sm_ctrl(ec),
        Hypercall::AssignPci => sys_assign_pci(ec),
        Hypercall::AssignGsi => sys_assign_gsi(ec),
        Hypercall::MachineCtrl => sys_machine_ctrl(ec),
    }
}
