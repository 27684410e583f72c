//! Semaphores and signals.
//!
//! An SM is a counter plus a FIFO of blocked ECs. SMs can also act as
//! signals: a chained SM forwards its `up` to the chain target, carrying
//! its signal value. GSIs are backed by kernel SMs to which user SMs
//! chain.

use crate::ec::{
    Continuation,
    Ec,
};
use crate::kobject::{
    Kobject,
    Object,
    ObjType,
    Refcounted,
};
use crate::rcu::{
    Rcu,
    RcuElem,
};
use crate::refcount::Refcount;
use crate::sc::Sc;
use crate::space::SpaceObj;
use alloc::boxed::Box;
use core::ptr;
use core::sync::atomic::{
    AtomicBool,
    AtomicPtr,
    Ordering,
};
use libmuon::crd::SmPerm;
use libmuon::hypercall::Status;
use spin::Mutex;

struct SmInner {
    counter: u64,
    /// FIFO of blocked ECs (circular, via their queue linkage).
    ec_head: *mut Ec,
    /// FIFO of pending signals (chained SMs).
    si_head: *mut Sm,
}

unsafe impl Send for SmInner {}

/// A semaphore / signal object.
#[repr(C)]
pub struct Sm {
    kobj: Kobject,
    refcount: Refcount,

    inner: Mutex<SmInner>,

    /// Chain target: `up` on this SM forwards there, carrying `value`.
    chain: AtomicPtr<Sm>,
    /// Signal value (for GSI SMs: the GSI number).
    pub value: u64,

    // Linkage while queued as a pending signal on the chain target.
    si_prev: AtomicPtr<Sm>,
    si_next: AtomicPtr<Sm>,
    si_queued: AtomicBool,
}

unsafe impl Send for Sm {}
unsafe impl Sync for Sm {}

impl Object for Sm {
    const TYPE: ObjType = ObjType::Sm;

    fn kobj(&self) -> &Kobject {
        &self.kobj
    }
}

impl Refcounted for Sm {
    fn refcount(&self) -> &Refcount {
        &self.refcount
    }
}

impl Sm {
    pub const PERM_UP: u64 = SmPerm::UP.bits() as u64;
    pub const PERM_DOWN: u64 = SmPerm::DOWN.bits() as u64;
    pub const PERM_ALL: u64 = Self::PERM_UP | Self::PERM_DOWN;

    unsafe fn free(elem: *mut RcuElem) {
        let sm = elem as *mut Sm;
        if (*sm).refcount.del_ref() {
            // Wake leftover waiters with an error before the memory goes.
            while !(*sm).drained() {
                (*sm).up(Some(Continuation::SysFinish(Status::BadCap, true)), None);
            }
            drop(Box::from_raw(sm));
        } else {
            (*sm).up(None, None);
        }
    }

    /// Creates an SM with an initial counter. A non-null `chain` makes it
    /// a signal forwarding to `chain` with value `value`.
    pub fn create(
        own: &crate::pd::Pd,
        sel: u64,
        counter: u64,
        chain: *mut Sm,
        value: u64,
    ) -> Box<Sm> {
        let mut sm = Box::new(Sm {
            kobj: Kobject::new(
                ObjType::Sm,
                own.obj() as *const SpaceObj as *mut u8,
                sel,
                Self::PERM_ALL,
                Self::free,
                None,
            ),
            refcount: Refcount::new(),
            inner: Mutex::new(SmInner {
                counter,
                ec_head: ptr::null_mut(),
                si_head: ptr::null_mut(),
            }),
            chain: AtomicPtr::new(chain),
            value,
            si_prev: AtomicPtr::new(ptr::null_mut()),
            si_next: AtomicPtr::new(ptr::null_mut()),
            si_queued: AtomicBool::new(false),
        });

        sm.kobj.finish_init();
        sm
    }

    pub fn is_signal(&self) -> bool {
        !self.chain.load(Ordering::SeqCst).is_null()
    }

    /// Re-chains the signal; `null` unchains.
    pub fn set_chain(&self, target: *mut Sm) {
        self.chain.store(target, Ordering::SeqCst);
    }

    fn drained(&self) -> bool {
        self.inner.lock().ec_head.is_null()
    }

    /// Zeroes the counter and returns its previous value.
    pub fn reset(&self) -> u64 {
        let mut inner = self.inner.lock();
        core::mem::replace(&mut inner.counter, 0)
    }

    /// Down: consumes one count or blocks the EC. `zero` consumes the
    /// whole count. A non-zero `deadline` bounds the wait.
    ///
    /// Returns true when the EC ended up blocked (and another EC was
    /// scheduled); false when a count was consumed and the EC stays
    /// runnable.
    pub fn dn(&self, zero: bool, deadline: u64, ec: &Ec, block: bool) -> bool {
        {
            let mut inner = self.inner.lock();

            if inner.counter > 0 {
                inner.counter = if zero { 0 } else { inner.counter - 1 };

                // A pending signal rides along with the wake-up.
                if let Some(si) = si_queue_pop(&mut inner.si_head) {
                    let si = unsafe { &*si };
                    unsafe { ec.regs_mut() }.set_si_regs(si.value, si.reset());
                }

                return false;
            }

            if !ec.refcount().add_ref() {
                drop(inner);
                Sc::schedule(block);
                return true;
            }

            ec_queue_append(&mut inner.ec_head, ec);
        }

        if !block {
            Sc::schedule(false);
            return true;
        }

        ec.set_timeout(deadline, self as *const Sm as *mut Sm);
        ec.block_sc();
        true
    }

    /// Up: wakes the longest-waiting EC or increments the counter. Dead
    /// waiters are retired and the next one is woken instead.
    pub fn up(&self, cont: Option<Continuation>, si: Option<&Sm>) {
        loop {
            let ec = {
                let mut inner = self.inner.lock();

                match ec_queue_pop(&mut inner.ec_head) {
                    Some(ec) => ec,
                    None => {
                        if let Some(si) = si {
                            if si.si_queued.load(Ordering::SeqCst) {
                                return;
                            }
                            si_queue_append(&mut inner.si_head, si);
                        }

                        inner.counter += 1;
                        return;
                    }
                }
            };

            let ec = unsafe { &*ec };

            if let Some(si) = si {
                unsafe { ec.regs_mut() }.set_si_regs(si.value, si.reset());
            }

            ec.clr_timeout();
            ec.release(cont);

            if !ec.refcount().del_rcu() {
                return;
            }

            // The EC died while blocked: retire it, wake the next waiter.
            Rcu::call(ec.kobj().rcu_elem());
        }
    }

    /// Timeout path: removes a specific EC from the queue and wakes it
    /// with `COM_TIM`.
    pub fn timeout(&self, ec: &Ec) {
        {
            let mut inner = self.inner.lock();
            if !ec_queue_remove(&mut inner.ec_head, ec) {
                return;
            }
        }

        ec.release(Some(Continuation::SysFinish(Status::ComTim, false)));

        if ec.refcount().del_rcu() {
            Rcu::call(ec.kobj().rcu_elem());
        }
    }

    /// Signal submission (GSI fired): forward along the chain, or wake
    /// our own waiters.
    pub fn submit(&self) {
        let chain = self.chain.load(Ordering::SeqCst);

        match unsafe { chain.as_ref() } {
            Some(target) => target.up(None, Some(self)),
            None => self.up(None, None),
        }
    }

    /// Hands the SM to RCU once, used by `revoke` with a semaphore
    /// argument.
    pub fn add_to_rcu(&self) {
        if !self.refcount.add_ref() {
            return;
        }

        if !Rcu::call(self.kobj.rcu_elem()) && self.refcount.del_rcu() {
            Rcu::call(self.kobj.rcu_elem());
        }
    }
}

// -- intrusive EC / signal queues -------------------------------------------

fn ec_queue_append(head: &mut *mut Ec, ec: &Ec) {
    let this = ec as *const Ec as *mut Ec;

    if head.is_null() {
        *head = this;
        ec.set_queue_prev(this);
        ec.set_queue_next(this);
    } else {
        let first = *head;
        let tail = unsafe { (*first).queue_prev() };
        ec.set_queue_prev(tail);
        ec.set_queue_next(first);
        unsafe {
            (*tail).set_queue_next(this);
            (*first).set_queue_prev(this);
        }
    }
}

fn ec_queue_pop(head: &mut *mut Ec) -> Option<*mut Ec> {
    let first = *head;
    if first.is_null() {
        return None;
    }

    let ec = unsafe { &*first };
    let next = ec.queue_next();

    if next == first {
        *head = ptr::null_mut();
    } else {
        let prev = ec.queue_prev();
        unsafe {
            (*prev).set_queue_next(next);
            (*next).set_queue_prev(prev);
        }
        *head = next;
    }

    ec.set_queue_prev(ptr::null_mut());
    ec.set_queue_next(ptr::null_mut());
    Some(first)
}

fn ec_queue_remove(head: &mut *mut Ec, ec: &Ec) -> bool {
    if ec.queue_next().is_null() {
        return false;
    }

    let this = ec as *const Ec as *mut Ec;
    let next = ec.queue_next();
    let prev = ec.queue_prev();

    if *head == this {
        *head = if next == this { ptr::null_mut() } else { next };
    }

    unsafe {
        (*prev).set_queue_next(next);
        (*next).set_queue_prev(prev);
    }

    ec.set_queue_prev(ptr::null_mut());
    ec.set_queue_next(ptr::null_mut());
    true
}

fn si_queue_append(head: &mut *mut Sm, si: &Sm) {
    let this = si as *const Sm as *mut Sm;

    si.si_queued.store(true, Ordering::SeqCst);

    if head.is_null() {
        *head = this;
        si.si_prev.store(this, Ordering::SeqCst);
        si.si_next.store(this, Ordering::SeqCst);
    } else {
        let first = *head;
        let tail = unsafe { (*first).si_prev.load(Ordering::SeqCst) };
        si.si_prev.store(tail, Ordering::SeqCst);
        si.si_next.store(first, Ordering::SeqCst);
        unsafe {
            (*tail).si_next.store(this, Ordering::SeqCst);
            (*first).si_prev.store(this, Ordering::SeqCst);
        }
    }
}

fn si_queue_pop(head: &mut *mut Sm) -> Option<*mut Sm> {
    let first = *head;
    if first.is_null() {
        return None;
    }

    let si = unsafe { &*first };
    let next = si.si_next.load(Ordering::SeqCst);

    if next == first {
        *head = ptr::null_mut();
    } else {
        let prev = si.si_prev.load(Ordering::SeqCst);
        unsafe {
            (*prev).si_next.store(next, Ordering::SeqCst);
            (*next).si_prev.store(prev, Ordering::SeqCst);
        }
        *head = next;
    }

    si.si_prev.store(ptr::null_mut(), Ordering::SeqCst);
    si.si_next.store(ptr::null_mut(), Ordering::SeqCst);
    si.si_queued.store(false, Ordering::SeqCst);
    Some(first)
}
