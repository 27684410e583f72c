//! Execution contexts, continuations and the kernel-exit trampoline.
//!
//! The kernel never parks a deep call chain: every EC carries a
//! [`Continuation`] describing what runs when it next becomes current, and
//! the per-CPU trampoline [`Ec::resume`] loops over hazards and the
//! current EC's continuation until it produces an [`Exit`] directive for
//! the assembly layer.

use crate::arch;
use crate::config::{
    MAX_HELP_LOOPS,
    NUM_CPUS,
};
use crate::cpulocal::{
    Cpu,
    PerCpu,
};
use crate::hazards::{
    HZD_IDL,
    HZD_PRK,
    HZD_RCU,
    HZD_RECALL,
    HZD_RRQ,
    HZD_SCHED,
    HZD_TLB,
};
use crate::kalloc::ptr_to_phys;
use crate::kobject::{
    Kobject,
    Object,
    ObjType,
    Refcounted,
    Refptr,
};
use crate::pagetable::hpt::Hpt;
use crate::pd::Pd;
use crate::rcu::{
    Rcu,
    RcuElem,
};
use crate::refcount::Refcount;
use crate::regs::CpuRegs;
use crate::sc::Sc;
use crate::space::SpaceObj;
use crate::timeout::Timeout;
use crate::vmx::VcpuState;
use alloc::boxed::Box;
use core::cell::UnsafeCell;
use core::ptr;
use core::sync::atomic::{
    AtomicPtr,
    AtomicU32,
    AtomicU64,
    Ordering,
};
use libmuon::crd::EcPerm;
use libmuon::event_offset::{
    EVT_RECALL,
    EVT_STARTUP,
    VMI_RECALL,
    VMI_STARTUP,
};
use libmuon::hypercall::Status;
use libmuon::mem::PAGE_BITS;
use libmuon::mtd::Mtd;
use libmuon::utcb::Utcb;
use log::{
    trace,
    warn,
};
use spin::Mutex;

/// How an EC re-enters unprivileged execution.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ReturnPath {
    Iret,
    Sysret,
    VmResume,
}

/// What the assembly layer should do after the trampoline is done.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Exit {
    /// Load the current EC's register file and IRET to user mode.
    UserIret,
    /// Load the current EC's register file and SYSRET to user mode.
    UserSysret,
    /// VMRESUME into the current vCPU.
    GuestResume,
    /// Halt until the next interrupt.
    Halt,
}

/// The resumption state of an EC. `None_` marks an idle portal target.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Continuation {
    None_,
    RetUser(ReturnPath),
    /// Pick up a kernel-originated event message from the partner.
    RecvKern,
    /// Pick up a user call message from the partner.
    RecvUser,
    /// Finish a hypercall with a status; optionally clear the timeout.
    SysFinish(Status, bool),
    /// Retry the `call` hypercall in the saved registers.
    SysCall,
    /// (Re-)send the kernel-originated message in `regs.dst_portal`,
    /// returning to user via the given path after the reply.
    SendMsg(ReturnPath),
    /// The EC was killed; unwind whoever talks to it.
    Dead,
    /// Per-CPU idle loop.
    Idle,
}

impl From<ReturnPath> for Continuation {
    fn from(path: ReturnPath) -> Self {
        Continuation::RetUser(path)
    }
}

/// Legacy x87/SSE state image.
#[repr(C, align(64))]
pub struct FpuState(pub [u8; 512]);

impl FpuState {
    pub fn new() -> Box<Self> {
        Box::new(Self([0; 512]))
    }
}

/// Creation flags for [`Ec::create`].
#[derive(Debug, Copy, Clone, Default)]
pub struct EcCreation {
    /// Global EC: runnable once an SC is bound.
    pub global: bool,
    /// vCPU EC: owns a VMCS instead of a UTCB.
    pub vcpu: bool,
    /// Use the shared APIC access page of the PD.
    pub apic_access_page: bool,
    /// Map the UTCB/vLAPIC page in the creator instead of the target PD.
    pub map_user_page_in_owner: bool,
}

/// An execution context.
#[repr(C)]
pub struct Ec {
    kobj: Kobject,
    refcount: Refcount,

    cont: Mutex<Continuation>,
    regs: UnsafeCell<CpuRegs>,

    utcb: Option<Box<Utcb>>,
    pub vcpu: Option<Box<VcpuState>>,

    /// The PD the EC runs in.
    pd: Refptr<Pd>,
    /// The PD holding the user mapping of the UTCB/vLAPIC page.
    pd_user_page: Refptr<Pd>,

    /// The EC we are currently waiting on (strong edge).
    partner: AtomicPtr<Ec>,
    /// The EC currently waiting on us (weak back edge, cleared before the
    /// strong reference goes away).
    rcap: AtomicPtr<Ec>,

    /// SCs parked here while the EC is busy (donation wait queue).
    waitq: Mutex<*mut Sc>,

    /// Queue linkage while blocked on a semaphore.
    prev: AtomicPtr<Ec>,
    next: AtomicPtr<Ec>,

    pub cpu: usize,
    pub glb: bool,
    /// Event-base selector for kernel-originated messages.
    pub evt: u64,

    /// User virtual address of the UTCB/vLAPIC page.
    user_page: AtomicU64,

    hazard: AtomicU32,

    pub timeout: Timeout,

    fpu: Mutex<Box<FpuState>>,
}

unsafe impl Send for Ec {}
unsafe impl Sync for Ec {}

impl Object for Ec {
    const TYPE: ObjType = ObjType::Ec;

    fn kobj(&self) -> &Kobject {
        &self.kobj
    }
}

impl Refcounted for Ec {
    fn refcount(&self) -> &Refcount {
        &self.refcount
    }
}

static CURRENT_EC: PerCpu<AtomicPtr<Ec>> = {
    const NULL: AtomicPtr<Ec> = AtomicPtr::new(ptr::null_mut());
    PerCpu::new([NULL; NUM_CPUS])
};

static IDLE_EC: PerCpu<AtomicPtr<Ec>> = {
    const NULL: AtomicPtr<Ec> = AtomicPtr::new(ptr::null_mut());
    PerCpu::new([NULL; NUM_CPUS])
};

impl Ec {
    pub const PERM_ALL: u64 =
        EcPerm::EC_CTRL.bits() as u64 | EcPerm::CREATE_SC.bits() as u64 | EcPerm::CREATE_PT.bits() as u64;

    unsafe fn free(elem: *mut RcuElem) {
        let ec = elem as *mut Ec;
        if (*ec).refcount.del_ref() {
            drop(Box::from_raw(ec));
        }
    }

    /// Tears down user mappings of kernel pages before the EC's memory
    /// can be reused.
    unsafe fn pre_free(elem: *mut RcuElem) {
        let ec = &*(elem as *mut Ec);

        let user_page = ec.user_page.swap(0, Ordering::SeqCst);
        if user_page != 0 {
            if let Ok(cleanup) = ec.pd_user_page.mem().insert(user_page, 0, 0, 0) {
                let mut cleanup = cleanup;
                cleanup.ignore_tlb_flush();
                cleanup.release(&crate::kalloc::BuddyAlloc);
            }
            ec.pd_user_page.mem().remove_utcb(user_page);
        }
    }

    /// Creates an execution context.
    ///
    /// Thread ECs receive a UTCB mapped at `user_page` in the target PD;
    /// vCPU ECs receive a VMCS and a vLAPIC page instead.
    pub fn create(
        own: &Pd,
        sel: u64,
        pd: &'static Pd,
        cpu: usize,
        evt: u64,
        user_page: u64,
        sp: u64,
        flags: EcCreation,
    ) -> Result<Box<Ec>, Status> {
        let pd_ref = Refptr::new(pd).ok_or(Status::BadCap)?;
        let user_pd = if flags.map_user_page_in_owner { own } else { pd };
        let pd_user_page = Refptr::new(user_pd).ok_or(Status::BadCap)?;

        pd.mem().init(cpu);

        let mut ec = Box::new(Ec {
            kobj: Kobject::new(
                ObjType::Ec,
                own.obj() as *const SpaceObj as *mut u8,
                sel,
                0xd,
                Self::free,
                Some(Self::pre_free),
            ),
            refcount: Refcount::new(),
            cont: Mutex::new(Continuation::None_),
            regs: UnsafeCell::new(CpuRegs::new()),
            utcb: None,
            vcpu: None,
            pd: pd_ref,
            pd_user_page,
            partner: AtomicPtr::new(ptr::null_mut()),
            rcap: AtomicPtr::new(ptr::null_mut()),
            waitq: Mutex::new(ptr::null_mut()),
            prev: AtomicPtr::new(ptr::null_mut()),
            next: AtomicPtr::new(ptr::null_mut()),
            cpu,
            glb: flags.global,
            evt,
            user_page: AtomicU64::new(user_page),
            hazard: AtomicU32::new(0),
            timeout: Timeout::new(),
            fpu: Mutex::new(FpuState::new()),
        });

        let user_map_pd = if flags.map_user_page_in_owner { own } else { pd };

        if !flags.vcpu {
            let utcb = Box::new(Utcb::new());
            let utcb_phys = ptr_to_phys(&*utcb as *const Utcb as *const u8);

            if user_page != 0 {
                user_map_pd
                    .mem()
                    .insert(
                        user_page,
                        0,
                        Hpt::PTE_U | Hpt::PTE_W | Hpt::PTE_P | Hpt::PTE_A | Hpt::PTE_D | Hpt::PTE_NODELEG,
                        utcb_phys,
                    )
                    .map_err(|_| Status::BadPar)?
                    .ignore_tlb_flush();

                user_map_pd.mem().insert_utcb(user_page, utcb_phys >> PAGE_BITS);
            }

            ec.utcb = Some(utcb);

            let regs = ec.regs.get_mut();
            regs.dst_portal = EVT_STARTUP;
            regs.set_sp(sp);

            if flags.global {
                *ec.cont.get_mut() = Continuation::SendMsg(ReturnPath::Iret);
            }

            trace!(
                "EC:{:p} created (PD:{:p} CPU:{} UTCB:{:#x} EVT:{:#x})",
                ec,
                pd,
                cpu,
                user_page,
                evt
            );
        } else {
            let vcpu = VcpuState::new(pd, flags.apic_access_page).map_err(|_| Status::BadPar)?;

            if user_page != 0 {
                let vlapic_phys = vcpu.vlapic_phys();
                user_map_pd
                    .mem()
                    .insert(
                        user_page,
                        0,
                        Hpt::PTE_U | Hpt::PTE_W | Hpt::PTE_P | Hpt::PTE_A | Hpt::PTE_D | Hpt::PTE_NODELEG,
                        vlapic_phys,
                    )
                    .map_err(|_| Status::BadPar)?
                    .ignore_tlb_flush();

                user_map_pd.mem().insert_utcb(user_page, vlapic_phys >> PAGE_BITS);
            }

            ec.vcpu = Some(vcpu);

            let regs = ec.regs.get_mut();
            regs.dst_portal = VMI_STARTUP;

            *ec.cont.get_mut() = Continuation::SendMsg(ReturnPath::VmResume);

            trace!("EC:{:p} created (PD:{:p} CPU:{} VCPU)", ec, pd, cpu);
        }

        ec.kobj.finish_init();
        ec.timeout.set_owner(&*ec);

        Ok(ec)
    }

    /// Creates the per-CPU idle EC and marks it current.
    pub fn setup_idle(cpu: usize) -> Result<(), Status> {
        let kern = Pd::kern();

        let mut ec = Ec::create(kern, 0, kern, cpu, 0, 0, 0, EcCreation::default())?;
        *ec.cont.get_mut() = Continuation::Idle;
        let ec = Box::leak(ec);

        // The current-EC slot owns a reference.
        let ok = ec.refcount.add_ref();
        debug_assert!(ok);

        IDLE_EC.remote(cpu).store(ec, Ordering::SeqCst);
        CURRENT_EC.remote(cpu).store(ec, Ordering::SeqCst);

        Ok(())
    }

    pub fn current() -> &'static Ec {
        unsafe {
            CURRENT_EC
                .local()
                .load(Ordering::SeqCst)
                .as_ref()
                .expect("no current EC")
        }
    }

    /// The current EC of a remote CPU. Valid until that CPU's next
    /// transition to user space.
    pub fn remote(cpu: usize) -> Option<&'static Ec> {
        unsafe { CURRENT_EC.remote(cpu).load(Ordering::SeqCst).as_ref() }
    }

    // -- basic accessors -------------------------------------------------

    /// The saved register file. Callers must hold the EC still: it is the
    /// current EC of this CPU, or its partner, or freshly created.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn regs_mut(&self) -> &mut CpuRegs {
        &mut *self.regs.get()
    }

    pub fn regs(&self) -> &CpuRegs {
        unsafe { &*self.regs.get() }
    }

    pub fn pd(&self) -> &Pd {
        &self.pd
    }

    pub fn utcb(&self) -> Option<&Utcb> {
        self.utcb.as_deref()
    }

    /// The UTCB, mutably. Same ownership caveat as [`regs_mut`].
    #[allow(clippy::mut_from_ref)]
    #[allow(invalid_reference_casting)]
    pub unsafe fn utcb_mut(&self) -> Option<&mut Utcb> {
        (self.utcb.as_deref() as Option<&Utcb>).map(|utcb| &mut *(utcb as *const Utcb as *mut Utcb))
    }

    pub fn is_vcpu(&self) -> bool {
        self.utcb.is_none()
    }

    pub fn user_page(&self) -> u64 {
        self.user_page.load(Ordering::SeqCst)
    }

    pub fn continuation(&self) -> Continuation {
        *self.cont.lock()
    }

    pub fn set_continuation(&self, cont: Continuation) {
        *self.cont.lock() = cont;
    }

    pub fn hazard(&self) -> u32 {
        self.hazard.load(Ordering::SeqCst)
    }

    pub fn set_hazard(&self, bits: u32) {
        self.hazard.fetch_or(bits, Ordering::SeqCst);
    }

    pub fn clr_hazard(&self, bits: u32) {
        self.hazard.fetch_and(!bits, Ordering::SeqCst);
    }

    pub fn partner(&self) -> Option<&'static Ec> {
        unsafe { self.partner.load(Ordering::SeqCst).as_ref() }
    }

    pub fn rcap(&self) -> Option<&'static Ec> {
        unsafe { self.rcap.load(Ordering::SeqCst).as_ref() }
    }

    /// Queued on a semaphore?
    fn queued(&self) -> bool {
        !self.next.load(Ordering::SeqCst).is_null()
    }

    // Raw queue linkage, for semaphore wait queues.

    pub(crate) fn queue_prev(&self) -> *mut Ec {
        self.prev.load(Ordering::SeqCst)
    }

    pub(crate) fn queue_next(&self) -> *mut Ec {
        self.next.load(Ordering::SeqCst)
    }

    pub(crate) fn set_queue_prev(&self, ec: *mut Ec) {
        self.prev.store(ec, Ordering::SeqCst);
    }

    pub(crate) fn set_queue_next(&self, ec: *mut Ec) {
        self.next.store(ec, Ordering::SeqCst);
    }

    /// Parks the current SC on this (blocked) EC and gives up the CPU.
    pub fn block_sc(&self) {
        if let Some(sc) = Sc::current() {
            if !self.park_waiter(sc) {
                return;
            }
        }

        Sc::schedule(true);
    }

    /// An EC is blocked when it waits on a semaphore or has nothing to
    /// run (idle portal target).
    pub fn blocked(&self) -> bool {
        self.queued() || *self.cont.lock() == Continuation::None_
    }

    pub fn is_dead(&self) -> bool {
        *self.cont.lock() == Continuation::Dead
    }

    // -- partner linkage -------------------------------------------------

    /// Links the current EC to its callee: strong forward edge, weak back
    /// edge on the callee.
    pub fn set_partner(&self, callee: &Ec) {
        let ok = callee.refcount.add_ref();
        debug_assert!(ok);
        self.partner.store(callee as *const _ as *mut Ec, Ordering::SeqCst);

        let ok = self.refcount.add_ref();
        debug_assert!(ok);
        callee.rcap.store(self as *const _ as *mut Ec, Ordering::SeqCst);

        Sc::ctr_link_inc();
    }

    /// Severs the partner linkage of `self` (the caller). The weak back
    /// edge is cleared before the strong references are dropped. Returns
    /// the remaining chain depth.
    pub fn clr_partner(&self) -> u32 {
        let callee = self.partner.swap(ptr::null_mut(), Ordering::SeqCst);
        let callee = unsafe { callee.as_ref() }.expect("clr_partner without partner");

        debug_assert!(ptr::eq(callee, Ec::current()));

        if !callee.rcap.load(Ordering::SeqCst).is_null() {
            callee.rcap.store(ptr::null_mut(), Ordering::SeqCst);
            let last = self.refcount.del_ref();
            debug_assert!(!last);
        }

        let last = callee.refcount.del_ref();
        debug_assert!(!last);

        Sc::ctr_link_dec()
    }

    /// Walks to the end of the partner chain: the EC actually doing the
    /// work on everyone's behalf.
    pub fn bottom_of_chain(&self) -> &Ec {
        let mut ec = self;
        let mut links = 0;

        while let Some(partner) = ec.partner() {
            ec = partner;
            links += 1;
        }

        Sc::set_ctr_link(links);
        ec
    }

    // -- making ECs current ----------------------------------------------

    /// Switches this CPU to the EC, transferring FPU ownership and the
    /// address space.
    pub fn make_current(&self) {
        let this = self as *const Ec as *mut Ec;
        let prev = CURRENT_EC.local().swap(this, Ordering::SeqCst);

        if prev != this {
            if let Some(prev) = unsafe { prev.as_ref() } {
                arch_fpu_switch(prev, self);
                if prev.refcount.del_rcu() {
                    Rcu::call(prev.kobj.rcu_elem());
                }
            }

            let ok = self.refcount.add_ref();
            debug_assert!(ok);
        }

        unsafe { pd_static(&self.pd) }.make_current();
    }

    /// Claims an idle portal target: atomically replaces a `None_`
    /// continuation with `cont`. Fails when the EC is busy or blocked on
    /// a semaphore.
    pub fn claim_idle(&self, cont: Continuation) -> bool {
        let mut cur = self.cont.lock();
        if *cur != Continuation::None_ || self.queued() {
            return false;
        }
        *cur = cont;
        true
    }

    /// Makes the EC current unless it is blocked. The check and the
    /// switch happen under the continuation lock.
    pub fn try_make_current(&self) -> bool {
        let cont = self.cont.lock();
        if self.queued() || *cont == Continuation::None_ {
            return false;
        }
        drop(cont);

        self.make_current();
        true
    }

    /// Parks an SC on this EC's donation wait queue. Fails when the EC
    /// became runnable concurrently.
    pub fn park_waiter(&self, sc: &Sc) -> bool {
        let cont = self.cont.lock();
        if !(self.queued() || *cont == Continuation::None_) {
            return false;
        }

        let ok = sc.refcount().add_ref();
        debug_assert!(ok);

        let mut head = self.waitq.lock();
        sc_queue_append(&mut head, sc);
        true
    }

    /// Wakes the EC: sets its continuation and releases all parked SCs
    /// back to their ready queues.
    pub fn release(&self, cont: Option<Continuation>) {
        if let Some(cont) = cont {
            self.set_continuation(cont);
        }

        let mut head = self.waitq.lock();
        while let Some(sc) = sc_queue_pop(&mut head) {
            let sc = unsafe { &*sc };

            // An SC whose last reference we hold and whose EC no longer
            // waits for anybody is garbage.
            if !sc.refcount().last_ref() || sc.ec.partner().is_some() {
                sc.remote_enqueue(false);
            } else {
                Rcu::call(sc.kobj().rcu_elem());
            }
        }
    }

    // -- helping / dying -------------------------------------------------

    /// The current EC wants `self` to make progress (the callee is busy):
    /// donate our SC to the bottom of the callee's chain, bounded by the
    /// livelock counter.
    pub fn help(&self, retry: Continuation) {
        if self.is_dead() {
            // The callee cannot make progress anymore.
            Ec::current().set_continuation(Continuation::SysFinish(Status::ComTim, false));
            return;
        }

        Ec::current().set_continuation(retry);

        if Sc::ctr_loop_inc() as usize >= MAX_HELP_LOOPS {
            Ec::die("Livelock");
            return;
        }

        let bottom = self.bottom_of_chain();
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

    /// Kills the current EC: its callers are unwound with an abort
    /// status, its own continuation becomes `Dead`.
    pub fn die(reason: &str) {
        let cur = Ec::current();

        if cur.utcb.is_some() || ptr::eq(cur.pd.raw(), Pd::kern() as *const Pd as *mut Pd) {
            warn!("Killed EC:{:p} ({})", cur, reason);
        } else {
            warn!("Killed vCPU EC:{:p} ({})", cur, reason);
        }

        if let Some(caller) = cur.rcap() {
            let cont = caller.continuation();
            caller.set_continuation(
                if cont == Continuation::RetUser(ReturnPath::Sysret) {
                    Continuation::SysFinish(Status::ComAbt, false)
                } else {
                    Continuation::Dead
                },
            );
        }

        crate::syscall::do_reply(Continuation::Dead, None);
    }

    // -- the trampoline --------------------------------------------------

    /// Runs hazards and continuations until the CPU can leave the kernel.
    pub fn resume() -> Exit {
        loop {
            // CPU-level hazards first.
            let hzd = Cpu::hazard();

            if hzd & HZD_RRQ != 0 {
                Cpu::clr_hazard(HZD_RRQ);
                Sc::rrq_handler();
            }

            if hzd & HZD_SCHED != 0 {
                Sc::schedule(false);
                continue;
            }

            if hzd & HZD_RCU != 0 {
                Rcu::quiet();
            }

            if hzd & HZD_IDL != 0 {
                Cpu::clr_hazard(HZD_IDL);
                Rcu::update();
            }

            if hzd & HZD_TLB != 0 {
                Cpu::clr_hazard(HZD_TLB);
                arch::flush_tlb();
            }

            if hzd & HZD_PRK != 0 {
                return Exit::Halt;
            }

            let ec = Ec::current();

            match ec.continuation() {
                Continuation::None_ => {
                    // A blocked EC must never be activated.
                    Ec::die("blocked activation");
                }

                Continuation::RetUser(path) => {
                    if ec.hazard() & HZD_RECALL != 0 {
                        ec.clr_hazard(HZD_RECALL);

                        let (portal, ret) = if path == ReturnPath::VmResume {
                            (VMI_RECALL, ReturnPath::VmResume)
                        } else {
                            (EVT_RECALL, ReturnPath::Iret)
                        };

                        unsafe { ec.regs_mut() }.dst_portal = portal;
                        ec.set_continuation(Continuation::SendMsg(ret));
                        continue;
                    }

                    return match path {
                        ReturnPath::Iret => Exit::UserIret,
                        ReturnPath::Sysret => Exit::UserSysret,
                        ReturnPath::VmResume => {
                            crate::ec_vmx::prepare_vmentry(ec);
                            Exit::GuestResume
                        }
                    };
                }

                Continuation::RecvKern => {
                    crate::syscall::recv_kern(ec);
                }

                Continuation::RecvUser => {
                    crate::syscall::recv_user(ec);
                }

                Continuation::SysFinish(status, clr_timeout) => {
                    if clr_timeout {
                        ec.timeout.dequeue();
                    }
                    unsafe { ec.regs_mut() }.set_status(status);
                    ec.set_continuation(Continuation::RetUser(ReturnPath::Sysret));
                }

                Continuation::SysCall => {
                    crate::syscall::sys_call(ec);
                }

                Continuation::SendMsg(path) => {
                    crate::syscall::send_msg(ec, path);
                }

                Continuation::Dead => {
                    // Dying twice: give the CPU to somebody useful.
                    Ec::idle_now();
                    Sc::schedule(true);
                }

                Continuation::Idle => {
                    Rcu::update();

                    let hzd = Cpu::hazard() & (HZD_RCU | HZD_SCHED | HZD_RRQ);
                    if hzd != 0 {
                        continue;
                    }

                    return Exit::Halt;
                }
            }
        }
    }

    /// Switches this CPU to its idle EC.
    pub fn idle_now() {
        let idle = IDLE_EC.local().load(Ordering::SeqCst);
        if let Some(idle) = unsafe { idle.as_ref() } {
            idle.make_current();
        }
    }

    // -- timeouts --------------------------------------------------------

    pub fn set_timeout(&self, deadline: u64, sm: *mut crate::sm::Sm) {
        if deadline != 0 {
            self.timeout.enqueue(deadline, sm);
        }
    }

    pub fn clr_timeout(&self) {
        self.timeout.dequeue();
    }
}

/// Extends a PD borrow to the static lifetime of kernel objects.
unsafe fn pd_static(pd: &Pd) -> &'static Pd {
    &*(pd as *const Pd)
}

fn arch_fpu_switch(_prev: &Ec, _next: &Ec) {
    // FXSAVE/FXRSTOR live in the assembly layer; ownership simply follows
    // the current EC.
}

// -- intrusive SC wait queues -----------------------------------------------

fn sc_queue_append(head: &mut *mut Sc, sc: &Sc) {
    let this = sc as *const Sc as *mut Sc;

    if head.is_null() {
        *head = this;
        sc_link(this, this, this);
    } else {
        let first = *head;
        let tail = unsafe { (*first).queue_prev() };
        sc_link(this, tail, first);
        unsafe {
            (*tail).set_queue_next(this);
            (*first).set_queue_prev(this);
        }
    }
}

fn sc_queue_pop(head: &mut *mut Sc) -> Option<*mut Sc> {
    let first = *head;
    if first.is_null() {
        return None;
    }

    let next = unsafe { (*first).queue_next() };
    if next == first {
        *head = ptr::null_mut();
    } else {
        let prev = unsafe { (*first).queue_prev() };
        unsafe {
            (*prev).set_queue_next(next);
            (*next).set_queue_prev(prev);
        }
        *head = next;
    }

    unsafe {
        (*first).set_queue_prev(ptr::null_mut());
        (*first).set_queue_next(ptr::null_mut());
    }
    Some(first)
}

fn sc_link(sc: *mut Sc, prev: *mut Sc, next: *mut Sc) {
    unsafe {
        (*sc).set_queue_prev(prev);
        (*sc).set_queue_next(next);
    }
}
