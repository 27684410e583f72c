//! Scheduling contexts and the per-CPU priority scheduler.
//!
//! Each CPU owns an array of circular doubly-linked SC lists, one per
//! priority, plus a cached top priority. Scheduling is strictly
//! priority-driven: the head of the highest non-empty list runs;
//! round-robin within one priority happens by tail-append and head-pick.
//! SCs created for a foreign CPU enter that CPU's cross-CPU queue and the
//! target is woken with an IPI.

use crate::arch;
use crate::arch::IpiVector;
use crate::config::{
    NUM_CPUS,
    NUM_PRIORITIES,
};
use crate::cpulocal::{
    Cpu,
    PerCpu,
};
use crate::ec::Ec;
use crate::hazards::HZD_SCHED;
use crate::kobject::{
    Kobject,
    Object,
    ObjType,
    Refcounted,
    Refptr,
};
use crate::rcu::{
    Rcu,
    RcuElem,
};
use crate::refcount::Refcount;
use crate::space::SpaceObj;
use alloc::boxed::Box;
use core::ptr;
use core::sync::atomic::{
    AtomicPtr,
    AtomicU32,
    AtomicU64,
    Ordering,
};
use libmuon::crd::ScPerm;
use log::trace;
use spin::Mutex;

/// A scheduling context: a priority and a time budget bound to an EC.
#[repr(C)]
pub struct Sc {
    kobj: Kobject,
    refcount: Refcount,

    /// The EC this SC makes runnable.
    pub ec: Refptr<Ec>,
    /// Home CPU; the SC only ever runs there.
    pub cpu: usize,
    /// Priority in `0..NUM_PRIORITIES`.
    pub prio: u8,
    /// Time budget in TSC ticks.
    pub budget: u64,

    /// Consumed time in TSC ticks.
    time: AtomicU64,
    /// TSC timestamp of the last enqueue/dispatch.
    tsc: AtomicU64,

    // Intrusive queue linkage: ready queue, cross-CPU queue or an EC wait
    // queue, exclusively.
    prev: AtomicPtr<Sc>,
    next: AtomicPtr<Sc>,
}

unsafe impl Send for Sc {}
unsafe impl Sync for Sc {}

impl Object for Sc {
    const TYPE: ObjType = ObjType::Sc;

    fn kobj(&self) -> &Kobject {
        &self.kobj
    }
}

impl Refcounted for Sc {
    fn refcount(&self) -> &Refcount {
        &self.refcount
    }
}

impl Sc {
    pub const PERM_ALL: u64 = ScPerm::SC_CTRL.bits() as u64;

    unsafe fn free(elem: *mut RcuElem) {
        let sc = elem as *mut Sc;
        if (*sc).refcount.del_ref() {
            drop(Box::from_raw(sc));
        }
    }

    /// Creates an SC bound to `ec`, with its capability at `sel` in the
    /// creator's object space.
    pub fn create(
        own: &crate::pd::Pd,
        sel: u64,
        ec: &Ec,
        cpu: usize,
        prio: u8,
        budget: u64,
    ) -> Option<Box<Sc>> {
        let ec = Refptr::new(ec)?;

        let mut sc = Box::new(Sc {
            kobj: Kobject::new(
                ObjType::Sc,
                own.obj() as *const SpaceObj as *mut u8,
                sel,
                Self::PERM_ALL,
                Self::free,
                None,
            ),
            refcount: Refcount::new(),
            ec,
            cpu,
            prio,
            budget,
            time: AtomicU64::new(0),
            tsc: AtomicU64::new(0),
            prev: AtomicPtr::new(ptr::null_mut()),
            next: AtomicPtr::new(ptr::null_mut()),
        });

        sc.kobj.finish_init();
        trace!("SC:{:p} created (EC:{:p} CPU:{} P:{})", sc, sc.ec.raw(), cpu, prio);
        Some(sc)
    }

    /// Consumed time in TSC ticks.
    pub fn time(&self) -> u64 {
        self.time.load(Ordering::SeqCst)
    }

    pub fn queued(&self) -> bool {
        !self.prev.load(Ordering::SeqCst).is_null()
    }

    fn this(&self) -> *mut Sc {
        self as *const Sc as *mut Sc
    }

    // Raw queue linkage, for the EC donation wait queues.

    pub(crate) fn queue_prev(&self) -> *mut Sc {
        self.prev.load(Ordering::SeqCst)
    }

    pub(crate) fn queue_next(&self) -> *mut Sc {
        self.next.load(Ordering::SeqCst)
    }

    pub(crate) fn set_queue_prev(&self, sc: *mut Sc) {
        self.prev.store(sc, Ordering::SeqCst);
    }

    pub(crate) fn set_queue_next(&self, sc: *mut Sc) {
        self.next.store(sc, Ordering::SeqCst);
    }
}

/// One priority-indexed run queue.
struct RunQueue {
    list: [*mut Sc; NUM_PRIORITIES],
    prio_top: usize,
}

unsafe impl Send for RunQueue {}

impl RunQueue {
    const fn new() -> Self {
        Self {
            list: [ptr::null_mut(); NUM_PRIORITIES],
            prio_top: 0,
        }
    }
}

static RQ: PerCpu<Mutex<RunQueue>> = {
    const INIT: Mutex<RunQueue> = Mutex::new(RunQueue::new());
    PerCpu::new([INIT; NUM_CPUS])
};

/// Cross-CPU enqueue staging list, guarded by its spinlock.
static XRQ: PerCpu<Mutex<*mut Sc>> = {
    const INIT: Mutex<*mut Sc> = Mutex::new(ptr::null_mut());
    PerCpu::new([INIT; NUM_CPUS])
};

static CURRENT_SC: PerCpu<AtomicPtr<Sc>> = {
    const NULL: AtomicPtr<Sc> = AtomicPtr::new(ptr::null_mut());
    PerCpu::new([NULL; NUM_CPUS])
};

/// Depth of the current partner chain.
static CTR_LINK: PerCpu<AtomicU32> = {
    const ZERO: AtomicU32 = AtomicU32::new(0);
    PerCpu::new([ZERO; NUM_CPUS])
};

/// Helping iterations since the last schedule, for livelock detection.
static CTR_LOOP: PerCpu<AtomicU32> = {
    const ZERO: AtomicU32 = AtomicU32::new(0);
    PerCpu::new([ZERO; NUM_CPUS])
};

impl Sc {
    pub fn current() -> Option<&'static Sc> {
        unsafe { CURRENT_SC.local().load(Ordering::SeqCst).as_ref() }
    }

    pub fn ctr_link() -> u32 {
        CTR_LINK.local().load(Ordering::SeqCst)
    }

    pub fn set_ctr_link(val: u32) {
        CTR_LINK.local().store(val, Ordering::SeqCst);
    }

    pub fn ctr_link_inc() -> u32 {
        CTR_LINK.local().fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn ctr_link_dec() -> u32 {
        CTR_LINK.local().fetch_sub(1, Ordering::SeqCst) - 1
    }

    pub fn ctr_loop_inc() -> u32 {
        CTR_LOOP.local().fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Appends the SC at the tail of its priority list on the current
    /// CPU. Raises the reschedule hazard when it outranks the running SC.
    pub fn ready_enqueue(&self, t: u64, inc_ref: bool) {
        assert!((self.prio as usize) < NUM_PRIORITIES);
        assert_eq!(self.cpu, Cpu::id());

        if inc_ref && !self.refcount.add_ref() {
            return;
        }

        let mut rq = RQ.local().lock();
        let prio = self.prio as usize;
        let this = self.this();

        if rq.list[prio].is_null() {
            rq.list[prio] = this;
            self.prev.store(this, Ordering::SeqCst);
            self.next.store(this, Ordering::SeqCst);
        } else {
            let head = rq.list[prio];
            let tail = unsafe { (*head).prev.load(Ordering::SeqCst) };
            self.next.store(head, Ordering::SeqCst);
            self.prev.store(tail, Ordering::SeqCst);
            unsafe {
                (*tail).next.store(this, Ordering::SeqCst);
                (*head).prev.store(this, Ordering::SeqCst);
            }
        }

        if prio > rq.prio_top {
            rq.prio_top = prio;
        }

        let preempts = Sc::current().map_or(true, |cur| self.prio > cur.prio);
        trace!(
            "ENQ:{:p} PRIO:{} TOP:{} {}",
            self,
            prio,
            rq.prio_top,
            if preempts { "reschedule" } else { "" }
        );
        if preempts {
            Cpu::set_hazard(HZD_SCHED);
        }

        self.tsc.store(t, Ordering::SeqCst);
    }

    /// Removes the SC from its priority list and refreshes the cached top
    /// priority.
    fn ready_dequeue(&self, t: u64) {
        assert!((self.prio as usize) < NUM_PRIORITIES);
        assert_eq!(self.cpu, Cpu::id());
        assert!(self.queued());

        let mut rq = RQ.local().lock();
        let prio = self.prio as usize;
        let this = self.this();

        let next = self.next.load(Ordering::SeqCst);
        let prev = self.prev.load(Ordering::SeqCst);

        if rq.list[prio] == this {
            rq.list[prio] = if next == this { ptr::null_mut() } else { next };
        }
        unsafe {
            (*next).prev.store(prev, Ordering::SeqCst);
            (*prev).next.store(next, Ordering::SeqCst);
        }
        self.prev.store(ptr::null_mut(), Ordering::SeqCst);
        self.next.store(ptr::null_mut(), Ordering::SeqCst);

        while rq.prio_top > 0 && rq.list[rq.prio_top].is_null() {
            rq.prio_top -= 1;
        }

        trace!("DEQ:{:p} PRIO:{} TOP:{}", self, prio, rq.prio_top);

        self.tsc.store(t, Ordering::SeqCst);
    }

    /// Enqueues the SC on its home CPU. Foreign CPUs receive it via their
    /// cross-CPU queue and a wake-up.
    pub fn remote_enqueue(&self, inc_ref: bool) {
        if Cpu::id() == self.cpu {
            self.ready_enqueue(arch::rdtsc(), inc_ref);
            return;
        }

        if inc_ref && !self.refcount.add_ref() {
            return;
        }

        let this = self.this();
        let queue = XRQ.remote(self.cpu);
        let mut head = queue.lock();

        if head.is_null() {
            *head = this;
            self.prev.store(this, Ordering::SeqCst);
            self.next.store(this, Ordering::SeqCst);

            Cpu::set_hazard_of(self.cpu, crate::hazards::HZD_RRQ);
            arch::send_nmi(self.cpu);
        } else {
            let first = *head;
            let tail = unsafe { (*first).prev.load(Ordering::SeqCst) };
            self.next.store(first, Ordering::SeqCst);
            self.prev.store(tail, Ordering::SeqCst);
            unsafe {
                (*tail).next.store(this, Ordering::SeqCst);
                (*first).prev.store(this, Ordering::SeqCst);
            }
        }
    }

    /// Drains the cross-CPU queue into the local ready queue.
    pub fn rrq_handler() {
        let t = arch::rdtsc();

        let drained = {
            let mut head = XRQ.local().lock();
            core::mem::replace(&mut *head, ptr::null_mut())
        };

        if drained.is_null() {
            return;
        }

        let mut cur = drained;
        loop {
            let sc = unsafe { &*cur };
            let next = sc.next.load(Ordering::SeqCst);

            sc.prev.store(ptr::null_mut(), Ordering::SeqCst);
            sc.next.store(ptr::null_mut(), Ordering::SeqCst);
            sc.ready_enqueue(t, false);

            if next == drained {
                break;
            }
            cur = next;
        }
    }

    /// Remote-kernel-entry wake-up: flush whatever this CPU was asked to
    /// flush.
    pub fn rke_handler() {
        let cpu = Cpu::id();

        if let Some(pd) = crate::pd::Pd::remote_current(cpu) {
            if pd.mem().htlb.chk(cpu) {
                pd.mem().htlb.clr(cpu);
                arch::flush_tlb();
            }
            if pd.mem().gtlb.chk(cpu) {
                pd.mem().gtlb.clr(cpu);
                pd.mem().ept().flush();
            }
        }

        crate::counter::Counter::tick_rke();
    }

    /// Switches to the best runnable EC.
    ///
    /// Accounts the outgoing SC, re-enqueues it unless `suspend`, then
    /// picks the head of the highest non-empty priority and activates its
    /// EC, donating the SC along partner chains. Returns once a runnable
    /// EC has been made current.
    pub fn schedule(suspend: bool) {
        let mut suspend = suspend;

        loop {
            Cpu::clr_hazard(HZD_SCHED);

            let t = arch::rdtsc();

            if let Some(cur) = Sc::current() {
                assert!(suspend || !cur.queued());
                cur.time
                    .fetch_add(t.wrapping_sub(cur.tsc.load(Ordering::SeqCst)), Ordering::SeqCst);

                if !suspend {
                    cur.ready_enqueue(t, false);
                } else if cur.refcount.del_rcu() {
                    Rcu::call(cur.kobj.rcu_elem());
                }
            }

            let sc = {
                let rq = RQ.local().lock();
                rq.list[rq.prio_top]
            };
            let sc = unsafe { sc.as_ref() }.expect("run queue empty, idle SC missing");

            CURRENT_SC.local().store(sc.this(), Ordering::SeqCst);
            CTR_LOOP.local().store(0, Ordering::SeqCst);
            sc.ready_dequeue(t);

            // Arm the budget timer for this dispatch.
            arch::set_timer(t.wrapping_add(sc.budget));

            // Donate along the partner chain to the EC that currently
            // does the work.
            let bottom = sc.ec.bottom_of_chain();

            if bottom.try_make_current() {
                return;
            }

            // The chain bottom is blocked: park our SC on its wait queue
            // and pick the next one. A lost race means it just became
            // runnable after all.
            if !bottom.park_waiter(sc) {
                bottom.make_current();
                return;
            }
            suspend = true;
        }
    }
}
