//! IOMMU device page tables (Intel VT-d second-level tables).
//!
//! IOMMUs may not snoop the cache, so every store to table memory is
//! followed by a cache-line flush.

use super::hpt::AtomicMemory;
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
    Ordering,
};

/// Atomic access with a cache-line flush after every visible store.
#[derive(Debug, Copy, Clone, Default)]
pub struct FlushedMemory;

impl MemoryPolicy for FlushedMemory {
    fn read(&self, pte: PtePtr) -> u64 {
        AtomicMemory.read(pte)
    }

    fn write(&self, pte: PtePtr, val: u64) {
        AtomicMemory.write(pte, val);
        arch::clflush(phys_to_ptr(pte.0), 8);
    }

    fn cmp_swap(&self, pte: PtePtr, old: u64, new: u64) -> bool {
        let done = AtomicMemory.cmp_swap(pte, old, new);
        if done {
            arch::clflush(phys_to_ptr(pte.0), 8);
        }
        done
    }

    fn exchange(&self, pte: PtePtr, val: u64) -> u64 {
        let old = AtomicMemory.exchange(pte, val);
        arch::clflush(phys_to_ptr(pte.0), 8);
        old
    }
}

pub struct DptAttr;

impl Dpt {
    pub const PTE_R: u64 = 1 << 0;
    pub const PTE_W: u64 = 1 << 1;
    pub const PTE_S: u64 = 1 << 7;
}

impl PtAttr for DptAttr {
    const PTE_P: u64 = Dpt::PTE_R | Dpt::PTE_W;
    const PTE_W: u64 = Dpt::PTE_W;
    const PTE_S: u64 = Dpt::PTE_S;
    const MASK: u64 = Dpt::PTE_R | Dpt::PTE_W;
    const ALL_RIGHTS: u64 = Dpt::PTE_R | Dpt::PTE_W;
}

pub type DptTable = GenericPageTable<9, FlushedMemory, BuddyAlloc, DptAttr, TlbCleanup>;
pub type DptMapping = Mapping<DptAttr>;

/// The minimum of all DMAR units' supported leaf levels.
static SUPPORTED_LEAF_LEVELS: AtomicU32 = AtomicU32::new(1);

/// An IOMMU device page table.
pub struct Dpt {
    table: DptTable,
}

impl Dpt {
    /// Lowers the number of supported leaf levels. Can be called once per
    /// DMAR unit; the minimum wins.
    pub fn lower_supported_leaf_levels(levels: u32) {
        SUPPORTED_LEAF_LEVELS.fetch_min(levels.max(1), Ordering::SeqCst);
    }

    pub fn new() -> Result<Self, NoMemory> {
        Ok(Self {
            table: DptTable::new(
                4,
                SUPPORTED_LEAF_LEVELS.load(Ordering::SeqCst),
                FlushedMemory,
                BuddyAlloc,
            )?,
        })
    }

    /// Converts mapping-database attributes into hardware attributes.
    pub fn hw_attr(attr: u64) -> u64 {
        (if attr & 1 != 0 { Self::PTE_R } else { 0 })
            | (if attr & 2 != 0 { Self::PTE_W } else { 0 })
    }

    /// Returns the root as if the table had only `levels` levels; IOMMUs
    /// with shorter walks start below the real root.
    pub fn root_at(&self, levels: u32) -> Result<u64, NoMemory> {
        assert!(levels > 0 && levels <= self.table.max_levels());

        if levels == self.table.max_levels() {
            return Ok(self.table.root());
        }

        let mut cleanup = TlbCleanup::new();
        let table = self
            .table
            .walk_down_and_split(&mut cleanup, 0, levels - 1, true)?
            .expect("create-walk always returns a table");
        assert!(!cleanup.need_tlb_flush());

        Ok(table.0)
    }
}

impl Deref for Dpt {
    type Target = DptTable;

    fn deref(&self) -> &DptTable {
        &self.table
    }
}

impl DerefMut for Dpt {
    fn deref_mut(&mut self) -> &mut DptTable {
        &mut self.table
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libmuon::mem::PAGE_BITS;

    #[test]
    fn test_device_mapping() {
        let dpt = Dpt::new().unwrap();
        let mut cleanup = dpt
            .update_one(&DptMapping::new(0x1000, 0x4000, Dpt::hw_attr(0x3), PAGE_BITS))
            .unwrap();

        assert_eq!(Some(0x4000), dpt.lookup_phys(0x1000));
        assert_eq!(None, dpt.lookup_phys(0x2000));

        cleanup.ignore_tlb_flush();
        cleanup.release(&BuddyAlloc);
    }

    #[test]
    fn test_shorter_walk_root() {
        let dpt = Dpt::new().unwrap();
        let root3 = dpt.root_at(3).unwrap();
        assert_ne!(dpt.root(), root3);
        // The shortened root is stable.
        assert_eq!(root3, dpt.root_at(3).unwrap());
    }
}
