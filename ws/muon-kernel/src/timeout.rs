//! Absolute-TSC timeouts, one sorted list per CPU.
//!
//! The one-shot timer is armed for the earliest deadline; expired entries
//! trigger in order. Hypercall timeouts wake an EC blocked on a
//! semaphore with a timeout status.

use crate::arch;
use crate::config::NUM_CPUS;
use crate::cpulocal::PerCpu;
use crate::ec::Ec;
use crate::sm::Sm;
use core::ptr;
use core::sync::atomic::{
    AtomicPtr,
    AtomicU64,
    Ordering,
};
use spin::Mutex;

static TIMEOUT_LIST: PerCpu<Mutex<*mut Timeout>> = {
    const INIT: Mutex<*mut Timeout> = Mutex::new(ptr::null_mut());
    PerCpu::new([INIT; NUM_CPUS])
};

/// A pending timeout, embedded in its EC.
#[derive(Debug)]
pub struct Timeout {
    time: AtomicU64,
    prev: AtomicPtr<Timeout>,
    next: AtomicPtr<Timeout>,
    /// Set while the timeout is enqueued.
    active: core::sync::atomic::AtomicBool,

    /// The semaphore the owner blocks on, if any.
    sm: AtomicPtr<Sm>,
    /// Back pointer to the owning EC.
    ec: AtomicPtr<Ec>,
}

unsafe impl Send for Timeout {}
unsafe impl Sync for Timeout {}

impl Timeout {
    pub const fn new() -> Self {
        Self {
            time: AtomicU64::new(0),
            prev: AtomicPtr::new(ptr::null_mut()),
            next: AtomicPtr::new(ptr::null_mut()),
            active: core::sync::atomic::AtomicBool::new(false),
            sm: AtomicPtr::new(ptr::null_mut()),
            ec: AtomicPtr::new(ptr::null_mut()),
        }
    }

    pub fn set_owner(&self, ec: &Ec) {
        self.ec.store(ec as *const Ec as *mut Ec, Ordering::SeqCst);
    }

    pub fn active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn this(&self) -> *mut Timeout {
        self as *const Timeout as *mut Timeout
    }

    /// Enqueues the timeout for an absolute TSC deadline, sorted
    /// ascending. The timer is re-armed when the new deadline is the
    /// earliest.
    pub fn enqueue(&self, time: u64, sm: *mut Sm) {
        debug_assert!(!self.active());

        self.time.store(time, Ordering::SeqCst);
        self.sm.store(sm, Ordering::SeqCst);
        self.active.store(true, Ordering::SeqCst);

        let mut head = TIMEOUT_LIST.local().lock();

        let mut prev: *mut Timeout = ptr::null_mut();
        let mut cur = *head;
        while let Some(node) = unsafe { cur.as_ref() } {
            if node.time.load(Ordering::SeqCst) >= time {
                break;
            }
            prev = cur;
            cur = node.next.load(Ordering::SeqCst);
        }

        self.prev.store(prev, Ordering::SeqCst);
        self.next.store(cur, Ordering::SeqCst);

        if prev.is_null() {
            *head = self.this();
            arch::set_timer(time);
        } else {
            unsafe { (*prev).next.store(self.this(), Ordering::SeqCst) };
        }

        if let Some(next) = unsafe { cur.as_ref() } {
            next.prev.store(self.this(), Ordering::SeqCst);
        }
    }

    /// Removes the timeout. Re-arms the timer when the head changed.
    pub fn dequeue(&self) -> u64 {
        if self.active.swap(false, Ordering::SeqCst) {
            let mut head = TIMEOUT_LIST.local().lock();

            let prev = self.prev.load(Ordering::SeqCst);
            let next = self.next.load(Ordering::SeqCst);

            if let Some(next) = unsafe { next.as_ref() } {
                next.prev.store(prev, Ordering::SeqCst);
            }

            if let Some(prev) = unsafe { prev.as_ref() } {
                prev.next.store(next, Ordering::SeqCst);
            } else {
                *head = next;
                if let Some(next) = unsafe { next.as_ref() } {
                    arch::set_timer(next.time.load(Ordering::SeqCst));
                }
            }

            self.prev.store(ptr::null_mut(), Ordering::SeqCst);
            self.next.store(ptr::null_mut(), Ordering::SeqCst);
        }

        self.time.load(Ordering::SeqCst)
    }

    fn trigger(&self) {
        let sm = self.sm.swap(ptr::null_mut(), Ordering::SeqCst);
        let ec = self.ec.load(Ordering::SeqCst);

        if let (Some(sm), Some(ec)) = (unsafe { sm.as_ref() }, unsafe { ec.as_ref() }) {
            sm.timeout(ec);
        }
    }

    /// Timer-interrupt path: triggers every expired timeout, then re-arms
    /// the timer for the next deadline.
    pub fn check() {
        loop {
            let expired = {
                let head = TIMEOUT_LIST.local().lock();
                match unsafe { (*head).as_ref() } {
                    Some(first) if first.time.load(Ordering::SeqCst) <= arch::rdtsc() => first.this(),
                    _ => break,
                }
            };

            let expired = unsafe { &*expired };
            expired.dequeue();
            expired.trigger();
        }

        let head = TIMEOUT_LIST.local().lock();
        if let Some(first) = unsafe { (*head).as_ref() } {
            arch::set_timer(first.time.load(Ordering::SeqCst));
        }
    }
}
