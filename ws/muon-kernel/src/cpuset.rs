//! Atomic CPU bitmap, used to track which CPUs hold stale TLB entries.

use crate::config::NUM_CPUS;
use core::sync::atomic::{
    AtomicU64,
    Ordering,
};

const WORDS: usize = (NUM_CPUS + 63) / 64;

/// A set of CPUs with atomic membership operations.
#[derive(Debug)]
pub struct Cpuset {
    bits: [AtomicU64; WORDS],
}

impl Cpuset {
    pub const fn new() -> Self {
        const ZERO: AtomicU64 = AtomicU64::new(0);
        Self { bits: [ZERO; WORDS] }
    }

    fn word(cpu: usize) -> (usize, u64) {
        assert!(cpu < NUM_CPUS);
        (cpu / 64, 1 << (cpu % 64))
    }

    /// Returns whether the CPU is in the set.
    pub fn chk(&self, cpu: usize) -> bool {
        let (w, m) = Self::word(cpu);
        self.bits[w].load(Ordering::SeqCst) & m != 0
    }

    /// Adds the CPU. Returns whether it was already present.
    pub fn set(&self, cpu: usize) -> bool {
        let (w, m) = Self::word(cpu);
        self.bits[w].fetch_or(m, Ordering::SeqCst) & m != 0
    }

    /// Removes the CPU.
    pub fn clr(&self, cpu: usize) {
        let (w, m) = Self::word(cpu);
        self.bits[w].fetch_and(!m, Ordering::SeqCst);
    }

    /// Adds all members of `other` to this set.
    pub fn merge(&self, other: &Cpuset) {
        for (dst, src) in self.bits.iter().zip(other.bits.iter()) {
            dst.fetch_or(src.load(Ordering::SeqCst), Ordering::SeqCst);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|w| w.load(Ordering::SeqCst) == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_chk_clr() {
        let set = Cpuset::new();
        assert!(!set.chk(3));
        assert!(!set.set(3));
        assert!(set.set(3));
        assert!(set.chk(3));
        set.clr(3);
        assert!(!set.chk(3));
    }

    #[test]
    fn test_merge() {
        let a = Cpuset::new();
        let b = Cpuset::new();
        b.set(1);
        b.set(63);
        a.merge(&b);
        assert!(a.chk(1) && a.chk(63));
        assert!(b.chk(1), "merge must not drain the source");
    }
}
