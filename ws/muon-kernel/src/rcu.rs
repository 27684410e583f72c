//! Read-Copy Update: batched deferred reclamation.
//!
//! Retired objects are queued on the CPU that retired them and reclaimed
//! once every online CPU has passed through a quiescent state (return to
//! user, idle, or an explicit quiet call). Per CPU there are three stages:
//! `next` collects new callbacks, `curr` waits for the current grace
//! period, `done` is ready for invocation.

use crate::arch;
use crate::arch::IpiVector;
use crate::config::{
    NUM_CPUS,
    RCU_ACCEL_THRESHOLD,
};
use crate::cpulocal::{
    Cpu,
    PerCpu,
};
use crate::hazards::HZD_RCU;
use core::ptr;
use core::sync::atomic::{
    AtomicPtr,
    AtomicUsize,
    Ordering,
};
use spin::Mutex;

/// Intrusive RCU callback element, embedded in every kernel object.
#[derive(Debug)]
pub struct RcuElem {
    next: AtomicPtr<RcuElem>,
    /// Called when the grace period has elapsed and the object can be
    /// reclaimed.
    pub func: unsafe fn(*mut RcuElem),
    /// Called when the object is handed to [`Rcu::call`].
    pub pre_func: Option<unsafe fn(*mut RcuElem)>,
}

/// Sentinel marking an element as enqueued while it is the tail.
const IN_USE: *mut RcuElem = 1 as *mut RcuElem;

impl RcuElem {
    pub const fn new(func: unsafe fn(*mut RcuElem), pre_func: Option<unsafe fn(*mut RcuElem)>) -> Self {
        Self {
            next: AtomicPtr::new(ptr::null_mut()),
            func,
            pre_func,
        }
    }
}

/// A singly-linked callback list with O(1) append.
struct RcuList {
    head: *mut RcuElem,
    /// Pointer to the location holding the list tail's `next` field, or to
    /// `head` for an empty list.
    tail: *mut AtomicPtr<RcuElem>,
    count: usize,
}

// Lists are only manipulated under the per-CPU lock.
unsafe impl Send for RcuList {}

impl RcuList {
    const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
            count: 0,
        }
    }

    fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    fn enqueue(&mut self, e: *mut RcuElem) -> bool {
        let elem = unsafe { &*e };

        // Refuse elements that already sit on some queue.
        if elem
            .next
            .compare_exchange(ptr::null_mut(), IN_USE, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        if self.head.is_null() {
            self.head = e;
        } else {
            unsafe { (*self.tail).store(e, Ordering::SeqCst) };
        }
        self.tail = &elem.next as *const _ as *mut _;
        self.count += 1;
        true
    }

    /// Moves all elements of `other` to the end of this list.
    fn append(&mut self, other: &mut Self) {
        if other.is_empty() {
            return;
        }

        if self.head.is_null() {
            self.head = other.head;
        } else {
            unsafe { (*self.tail).store(other.head, Ordering::SeqCst) };
        }
        self.tail = other.tail;
        self.count += other.count;

        other.head = ptr::null_mut();
        other.tail = ptr::null_mut();
        other.count = 0;
    }

    /// Invokes and unlinks every element.
    fn invoke(&mut self) {
        let mut cur = self.head;
        while !cur.is_null() {
            let elem = unsafe { &*cur };
            let next = elem.next.load(Ordering::SeqCst);
            elem.next.store(ptr::null_mut(), Ordering::SeqCst);
            unsafe { (elem.func)(cur) };
            cur = if next == IN_USE { ptr::null_mut() } else { next };
        }

        self.head = ptr::null_mut();
        self.tail = ptr::null_mut();
        self.count = 0;
    }
}

struct CpuRcu {
    /// Last global batch number this CPU observed.
    l_batch: usize,
    /// Batch number that retires this CPU's `curr` list.
    c_batch: usize,

    next: RcuList,
    curr: RcuList,
    done: RcuList,
}

impl CpuRcu {
    const fn new() -> Self {
        Self {
            l_batch: 0,
            c_batch: 0,
            next: RcuList::new(),
            curr: RcuList::new(),
            done: RcuList::new(),
        }
    }
}

const RCU_CMP: usize = 1 << 0;
const RCU_PND: usize = 1 << 1;

/// Global batch state: `batch << 2 | flags`. Incrementing the word when
/// both flags are set starts the next batch and clears the flags in one
/// step.
static STATE: AtomicUsize = AtomicUsize::new(RCU_CMP);

/// CPUs that still need to pass a quiescent state for the current batch.
static COUNT: AtomicUsize = AtomicUsize::new(0);

static LISTS: PerCpu<Mutex<CpuRcu>> = {
    const INIT: Mutex<CpuRcu> = Mutex::new(CpuRcu::new());
    PerCpu::new([INIT; NUM_CPUS])
};

pub struct Rcu;

impl Rcu {
    fn batch() -> usize {
        STATE.load(Ordering::SeqCst) >> 2
    }

    fn complete(batch: usize) -> bool {
        let state = STATE.load(Ordering::SeqCst) & !RCU_PND;
        (state as isize).wrapping_sub((batch << 2) as isize) > 0
    }

    /// Hands an object to RCU. Returns false if the element is already
    /// queued.
    pub fn call(elem: *mut RcuElem) -> bool {
        let e = unsafe { &*elem };
        if let Some(pre) = e.pre_func {
            unsafe { pre(elem) };
        }

        LISTS.local().lock().next.enqueue(elem)
    }

    /// Marks a quiescent state of the current CPU.
    pub fn quiet() {
        Cpu::clr_hazard(HZD_RCU);
        if COUNT.fetch_sub(1, Ordering::SeqCst) == 1 {
            Self::start_batch(RCU_CMP);
        }
    }

    fn start_batch(flag: usize) {
        let mut v;
        loop {
            v = STATE.load(Ordering::SeqCst);
            if v >> 2 != LISTS.local().lock().l_batch {
                return;
            }
            if v & flag != 0 {
                break;
            }
            if STATE
                .compare_exchange(v, v | flag, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                v |= flag;
                break;
            }
        }

        // Only proceed when both the completion and the pending flag are
        // set; otherwise the other half has not arrived yet.
        if v & (RCU_CMP | RCU_PND) != (RCU_CMP | RCU_PND) {
            return;
        }

        COUNT.store(Cpu::online(), Ordering::SeqCst);
        STATE.fetch_add(1, Ordering::SeqCst);
    }

    /// Advances the per-CPU state machine. Called on every pass through
    /// the kernel exit path and from the idle loop.
    pub fn update() {
        let lists = LISTS.local();
        let mut rcu = lists.lock();

        if rcu.l_batch != Self::batch() {
            rcu.l_batch = Self::batch();
            Cpu::set_hazard(HZD_RCU);
        }

        if !rcu.curr.is_empty() && Self::complete(rcu.c_batch) {
            let mut curr = core::mem::replace(&mut rcu.curr, RcuList::new());
            rcu.done.append(&mut curr);
        }

        if rcu.curr.is_empty() && !rcu.next.is_empty() {
            let mut next = core::mem::replace(&mut rcu.next, RcuList::new());
            rcu.curr.append(&mut next);

            rcu.c_batch = rcu.l_batch + 1;

            drop(rcu);
            Self::start_batch(RCU_PND);
            rcu = lists.lock();
        }

        if !rcu.curr.is_empty()
            && !rcu.next.is_empty()
            && (rcu.next.count > RCU_ACCEL_THRESHOLD || rcu.curr.count > RCU_ACCEL_THRESHOLD)
        {
            for cpu in (0..Cpu::online()).filter(|&c| c != Cpu::id()) {
                arch::send_ipi(cpu, IpiVector::Idl);
            }
        }

        // Invoke outside the list lock: reclamation callbacks may retire
        // further objects through Rcu::call.
        let mut done = core::mem::replace(&mut rcu.done, RcuList::new());
        drop(rcu);

        if !done.is_empty() {
            done.invoke();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicUsize;

    static FREED: AtomicUsize = AtomicUsize::new(0);

    unsafe fn count_free(_e: *mut RcuElem) {
        FREED.fetch_add(1, Ordering::SeqCst);
    }

    /// Runs the kernel-exit discipline (update, then quiet iff the RCU
    /// hazard is set) often enough on one online CPU to cycle a full
    /// grace period.
    fn settle() {
        for _ in 0..6 {
            Rcu::update();
            if Cpu::hazard() & HZD_RCU != 0 {
                Rcu::quiet();
            }
        }
    }

    #[test]
    fn test_callback_runs_exactly_once_after_grace_period() {
        let _guard = crate::test_util::lock();
        arch::with_cpu(0, || {
            Cpu::set_online(1);
            FREED.store(0, Ordering::SeqCst);

            let mut elem = RcuElem::new(count_free, None);
            assert!(Rcu::call(&mut elem));
            // Double insertion is rejected.
            assert!(!Rcu::call(&mut elem));

            assert_eq!(0, FREED.load(Ordering::SeqCst), "no free before grace period");
            settle();
            assert_eq!(1, FREED.load(Ordering::SeqCst));

            // The element is reusable after retirement.
            assert!(Rcu::call(&mut elem));
            settle();
            assert_eq!(2, FREED.load(Ordering::SeqCst));
        });
    }

    #[test]
    fn test_pre_func_runs_on_call() {
        let _guard = crate::test_util::lock();
        arch::with_cpu(0, || {
            Cpu::set_online(1);
            static PRE: AtomicUsize = AtomicUsize::new(0);

            unsafe fn pre(_e: *mut RcuElem) {
                PRE.fetch_add(1, Ordering::SeqCst);
            }

            let mut elem = RcuElem::new(count_free, Some(pre));
            Rcu::call(&mut elem);
            assert_eq!(1, PRE.load(Ordering::SeqCst));
            settle();
        });
    }
}
