//! Host page tables.
//!
//! Besides backing the normal CPU page tables, the host attribute layout
//! also stores metainformation: the memory type of each page and whether a
//! page may be delegated at all.

use super::{
    GenericPageTable,
    Mapping,
    MemoryPolicy,
    PtAttr,
    PtePtr,
    TlbCleanup,
};
use crate::arch;
use crate::kalloc::{
    phys_to_ptr,
    BuddyAlloc,
    NoMemory,
};
use core::ops::{
    Deref,
    DerefMut,
};
use core::sync::atomic::{
    AtomicU32,
    AtomicU64,
    Ordering,
};

/// Sequentially consistent access to page-table memory through the direct
/// map.
#[derive(Debug, Copy, Clone, Default)]
pub struct AtomicMemory;

impl AtomicMemory {
    fn cell(pte: PtePtr) -> &'static AtomicU64 {
        unsafe { &*(phys_to_ptr(pte.0) as *const AtomicU64) }
    }
}

impl MemoryPolicy for AtomicMemory {
    fn read(&self, pte: PtePtr) -> u64 {
        Self::cell(pte).load(Ordering::SeqCst)
    }

    fn write(&self, pte: PtePtr, val: u64) {
        Self::cell(pte).store(val, Ordering::SeqCst);
    }

    fn cmp_swap(&self, pte: PtePtr, old: u64, new: u64) -> bool {
        Self::cell(pte)
            .compare_exchange(old, new, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn exchange(&self, pte: PtePtr, val: u64) -> u64 {
        Self::cell(pte).swap(val, Ordering::SeqCst)
    }
}

/// Host page-table attribute layout.
pub struct HptAttr;

impl Hpt {
    pub const PTE_P: u64 = 1 << 0;
    pub const PTE_W: u64 = 1 << 1;
    pub const PTE_U: u64 = 1 << 2;
    pub const PTE_UC: u64 = 1 << 4;
    pub const PTE_A: u64 = 1 << 5;
    pub const PTE_D: u64 = 1 << 6;
    pub const PTE_S: u64 = 1 << 7;
    pub const PTE_G: u64 = 1 << 8;
    pub const PTE_NX: u64 = 1 << 63;

    /// Memory type, encoded in otherwise available bits.
    pub const PTE_MT_SHIFT: u64 = 53;
    pub const MT_MASK: u64 = 0b111;
    pub const PTE_MT_MASK: u64 = Self::MT_MASK << Self::PTE_MT_SHIFT;

    /// Prevents a page from being delegated. Used for pages the kernel
    /// must be able to reclaim from userspace (UTCBs, vLAPIC pages).
    pub const PTE_NODELEG: u64 = 1 << 56;

    /// Page-fault error-code bits.
    pub const ERR_W: u64 = 1 << 1;
    pub const ERR_U: u64 = 1 << 2;
}

impl PtAttr for HptAttr {
    const PTE_P: u64 = Hpt::PTE_P;
    const PTE_W: u64 = Hpt::PTE_W;
    const PTE_S: u64 = Hpt::PTE_S;
    const ALL_RIGHTS: u64 = Hpt::PTE_P | Hpt::PTE_W | Hpt::PTE_U | Hpt::PTE_A | Hpt::PTE_D;
    const MASK: u64 = Hpt::PTE_NX
        | Hpt::PTE_MT_MASK
        | Hpt::PTE_NODELEG
        | Hpt::PTE_UC
        | Hpt::PTE_G
        | Self::ALL_RIGHTS;
}

pub type HptTable = GenericPageTable<9, AtomicMemory, BuddyAlloc, HptAttr, TlbCleanup>;
pub type HptMapping = Mapping<HptAttr>;

/// How many levels may carry leaf entries; 3 when the CPU supports 1 GiB
/// pages. Set once during bring-up.
static SUPPORTED_LEAF_LEVELS: AtomicU32 = AtomicU32::new(2);

/// A host page table.
pub struct Hpt {
    table: HptTable,
}

impl Hpt {
    /// Adjusts the number of leaf levels to the given value.
    pub fn set_supported_leaf_levels(levels: u32) {
        SUPPORTED_LEAF_LEVELS.store(levels, Ordering::SeqCst);
    }

    /// Creates an empty host page table.
    pub fn new() -> Result<Self, NoMemory> {
        Ok(Self {
            table: HptTable::new(
                4,
                SUPPORTED_LEAF_LEVELS.load(Ordering::SeqCst),
                AtomicMemory,
                BuddyAlloc,
            )?,
        })
    }

    /// Wraps existing page-table structures.
    pub fn with_root(root: u64) -> Self {
        Self {
            table: HptTable::with_root(
                4,
                SUPPORTED_LEAF_LEVELS.load(Ordering::SeqCst),
                root,
                AtomicMemory,
                BuddyAlloc,
            ),
        }
    }

    /// Converts mapping-database attributes (R/W/X) into hardware
    /// attributes.
    pub fn hw_attr(attr: u64) -> u64 {
        if attr & 1 == 0 {
            return 0;
        }

        Self::PTE_P
            | Self::PTE_U
            | Self::PTE_A
            | Self::PTE_D
            | if attr & 2 != 0 { Self::PTE_W } else { 0 }
            | if attr & 4 != 0 { 0 } else { Self::PTE_NX }
    }

    /// Loads this page table into CR3, together with the PCID bits.
    pub fn make_current(&self, pcid: u64) {
        unsafe { arch::make_current(self.table.root() | pcid) };
    }

    /// Atomically changes a non-present or read-only 4K mapping to point
    /// to a new frame. Returns the physical address now backing `vaddr`.
    pub fn replace(&self, vaddr: u64, pte: u64) -> Result<u64, NoMemory> {
        let mut cleanup = TlbCleanup::new();
        let phys = self.table.replace_readonly_page(
            &mut cleanup,
            vaddr,
            pte & !HptAttr::MASK,
            pte & HptAttr::MASK,
        )?;

        // Promoting a read-only page schedules a flush; the caller
        // handles shootdown via the space cpusets.
        cleanup.ignore_tlb_flush();
        cleanup.release(&BuddyAlloc);
        Ok(phys)
    }
}

impl Deref for Hpt {
    type Target = HptTable;

    fn deref(&self) -> &HptTable {
        &self.table
    }
}

impl DerefMut for Hpt {
    fn deref_mut(&mut self) -> &mut HptTable {
        &mut self.table
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libmuon::mem::PAGE_BITS;

    #[test]
    fn test_real_hpt_roundtrip() {
        // The real policies run on the host: direct map offset is zero in
        // test builds.
        let hpt = Hpt::new().unwrap();
        let frame = 0xCAFE0000u64;

        let cleanup = hpt
            .update_one(&HptMapping::new(0x1000, frame, Hpt::PTE_P | Hpt::PTE_W, PAGE_BITS))
            .unwrap();
        assert!(!cleanup.need_tlb_flush());

        let mapping = hpt.lookup(0x1000);
        assert_eq!(frame, mapping.paddr);
        assert_eq!(PAGE_BITS, mapping.order);
        assert!(mapping.present());

        let mut cleanup = hpt.update_one(&HptMapping::empty(0x1000, PAGE_BITS)).unwrap();
        assert!(cleanup.need_tlb_flush());
        assert!(!hpt.lookup(0x1000).present());

        cleanup.ignore_tlb_flush();
        cleanup.release(&BuddyAlloc);
    }

    #[test]
    fn test_hw_attr() {
        assert_eq!(0, Hpt::hw_attr(0));
        assert_eq!(0, Hpt::hw_attr(0) & Hpt::PTE_P);

        let ro = Hpt::hw_attr(1);
        assert_ne!(0, ro & Hpt::PTE_P);
        assert_eq!(0, ro & Hpt::PTE_W);
        assert_ne!(0, ro & Hpt::PTE_NX);

        let rwx = Hpt::hw_attr(7);
        assert_ne!(0, rwx & Hpt::PTE_W);
        assert_eq!(0, rwx & Hpt::PTE_NX);
    }
}
