//! Atomic reference counting for kernel objects.

use core::sync::atomic::{
    AtomicU32,
    Ordering,
};

/// An atomic reference count starting at one.
#[derive(Debug)]
pub struct Refcount {
    refs: AtomicU32,
}

impl Refcount {
    pub const fn new() -> Self {
        Self {
            refs: AtomicU32::new(1),
        }
    }

    /// Adds a reference.
    ///
    /// Returns false when the count already reached zero: the object is on
    /// its way to destruction and must not be resurrected.
    pub fn add_ref(&self) -> bool {
        let mut cur = self.refs.load(Ordering::SeqCst);
        while cur != 0 {
            match self
                .refs
                .compare_exchange(cur, cur + 1, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return true,
                Err(now) => cur = now,
            }
        }
        false
    }

    /// Removes a reference. Returns true when the last reference was
    /// dropped; the caller must then hand the object to RCU.
    pub fn del_ref(&self) -> bool {
        self.refs.fetch_sub(1, Ordering::SeqCst) == 1
    }

    /// Returns true iff exactly one reference exists.
    pub fn last_ref(&self) -> bool {
        self.refs.load(Ordering::SeqCst) == 1
    }

    /// Like [`del_ref`](Self::del_ref), but already reports the object
    /// ready for destruction when the caller holds the last reference,
    /// and re-arms the count so that exactly one caller performs the RCU
    /// retirement.
    pub fn del_rcu(&self) -> bool {
        if self.last_ref() {
            return true;
        }

        if self.del_ref() {
            self.refs.store(1, Ordering::SeqCst);
            return true;
        }

        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_del() {
        let rc = Refcount::new();
        assert!(rc.last_ref());
        assert!(rc.add_ref());
        assert!(!rc.last_ref());
        assert!(!rc.del_ref());
        assert!(rc.del_ref(), "second del drops the last reference");
    }

    #[test]
    fn test_no_resurrection() {
        let rc = Refcount::new();
        assert!(rc.del_ref());
        assert!(!rc.add_ref(), "a dead object must stay dead");
    }

    #[test]
    fn test_del_rcu_claims_once() {
        let rc = Refcount::new();
        // Only reference: ready for retirement, count stays claimable once.
        assert!(rc.del_rcu());

        let rc = Refcount::new();
        rc.add_ref();
        // Two references: first del_rcu just drops, second claims.
        assert!(!rc.del_rcu());
        assert!(rc.del_rcu());
    }
}
