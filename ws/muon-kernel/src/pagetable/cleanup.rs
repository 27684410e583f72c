//! Deferred cleanup of page-table pages and TLB flush tracking.

use super::DeferredCleanup;
use crate::kalloc::PageAlloc;
use alloc::vec::Vec;

/// Deferred cleanup state for the kernel page tables.
///
/// Pages handed to [`free_later`](TlbCleanup::free_later) are *not* freed
/// until the TLB flush has happened: they may still be referenced by other
/// cores. The initiator of the page-table modification performs the flush
/// (or shootdown) and then calls [`TlbCleanup::release`].
#[derive(Debug, Default)]
pub struct TlbCleanup {
    tlb_flush: bool,
    pages: Vec<u64>,
}

impl TlbCleanup {
    pub const fn new() -> Self {
        Self {
            tlb_flush: false,
            pages: Vec::new(),
        }
    }

    /// A named convenience constructor for readable code.
    pub fn tlb_flush(tlb_flush: bool) -> Self {
        Self {
            tlb_flush,
            pages: Vec::new(),
        }
    }

    /// Returns true if a TLB flush is scheduled.
    pub fn need_tlb_flush(&self) -> bool {
        self.tlb_flush
    }

    /// Schedules a TLB flush.
    pub fn flush_tlb_later(&mut self) {
        self.tlb_flush = true;
    }

    /// Discards a scheduled TLB flush. Only valid when the affected
    /// table was never installed on a running CPU.
    pub fn ignore_tlb_flush(&mut self) {
        self.tlb_flush = false;
    }

    /// Marks a page as to-be-freed once the flush has happened. The page
    /// stays readable and writable until then.
    pub fn free_later(&mut self, page: u64) {
        self.tlb_flush = true;
        self.pages.push(page);
    }

    /// Moves all deferred activity of `other` into `self`.
    pub fn merge(&mut self, other: &mut Self) {
        self.tlb_flush |= other.tlb_flush;
        self.pages.append(&mut other.pages);
        other.tlb_flush = false;
    }

    /// Completes the cleanup after the initiator flushed all affected
    /// TLBs: clears the flush obligation and returns the deferred pages
    /// to the allocator.
    pub fn release(&mut self, alloc: &impl PageAlloc) {
        self.tlb_flush = false;
        for page in self.pages.drain(..) {
            alloc.free_page(page);
        }
    }
}

impl DeferredCleanup for TlbCleanup {
    fn need_tlb_flush(&self) -> bool {
        TlbCleanup::need_tlb_flush(self)
    }

    fn flush_tlb_later(&mut self) {
        TlbCleanup::flush_tlb_later(self);
    }

    fn ignore_tlb_flush(&mut self) {
        TlbCleanup::ignore_tlb_flush(self);
    }

    fn free_later(&mut self, page: u64) {
        TlbCleanup::free_later(self, page);
    }

    fn merge(&mut self, other: &mut Self) {
        TlbCleanup::merge(self, other);
    }

    fn free_pages_now(&mut self, free: &mut dyn FnMut(u64)) {
        assert!(!self.tlb_flush, "freeing pages with a TLB flush pending");
        for page in self.pages.drain(..) {
            free(page);
        }
    }
}

impl Drop for TlbCleanup {
    fn drop(&mut self) {
        // Dropping deferred pages would leak them; dropping a pending
        // flush would leave stale TLB entries.
        debug_assert!(self.pages.is_empty(), "TlbCleanup dropped with deferred pages");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kalloc::{
        BuddyAlloc,
        PageAlloc,
    };

    #[test]
    fn test_merge_moves_obligations() {
        let mut a = TlbCleanup::new();
        let mut b = TlbCleanup::new();

        let alloc = BuddyAlloc;
        let page = alloc.alloc_zeroed_page().unwrap();

        b.free_later(page);
        assert!(b.need_tlb_flush());

        a.merge(&mut b);
        assert!(a.need_tlb_flush());
        assert!(!b.need_tlb_flush());

        a.release(&alloc);
        assert!(!a.need_tlb_flush());
    }
}
