//! Guest nested page tables (Intel EPT).

use super::hpt::AtomicMemory;
use super::{
    GenericPageTable,
    Mapping,
    PtAttr,
    TlbCleanup,
};
use crate::arch;
use crate::kalloc::{
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

pub struct EptAttr;

impl Ept {
    pub const PTE_R: u64 = 1 << 0;
    pub const PTE_W: u64 = 1 << 1;
    pub const PTE_X: u64 = 1 << 2;
    /// Ignore-PAT bit.
    pub const PTE_I: u64 = 1 << 6;
    pub const PTE_S: u64 = 1 << 7;

    pub const PTE_MT_SHIFT: u64 = 3;

    /// EPTP constants.
    const EPTP_WB: u64 = 6;
    const EPTP_WALK_LENGTH_SHIFT: u64 = 3;
}

impl PtAttr for EptAttr {
    /// An EPT entry is present if it allows any kind of access.
    const PTE_P: u64 = Ept::PTE_R | Ept::PTE_W | Ept::PTE_X;
    const PTE_W: u64 = Ept::PTE_W;
    const PTE_S: u64 = Ept::PTE_S;
    const MASK: u64 = 0xfff;
    const ALL_RIGHTS: u64 = Ept::PTE_R | Ept::PTE_W | Ept::PTE_X;
}

pub type EptTable = GenericPageTable<9, AtomicMemory, BuddyAlloc, EptAttr, TlbCleanup>;
pub type EptMapping = Mapping<EptAttr>;

static SUPPORTED_LEAF_LEVELS: AtomicU32 = AtomicU32::new(2);

/// A guest nested page table.
pub struct Ept {
    table: EptTable,
}

impl Ept {
    /// Adjusts the number of leaf levels to the given value.
    pub fn set_supported_leaf_levels(levels: u32) {
        SUPPORTED_LEAF_LEVELS.store(levels, Ordering::SeqCst);
    }

    pub fn new() -> Result<Self, NoMemory> {
        Ok(Self {
            table: EptTable::new(
                4,
                SUPPORTED_LEAF_LEVELS.load(Ordering::SeqCst),
                AtomicMemory,
                BuddyAlloc,
            )?,
        })
    }

    /// Converts mapping-database attributes plus the MTRR memory type of
    /// the region into hardware attributes.
    pub fn hw_attr(attr: u64, mtrr_type: u64) -> u64 {
        if attr & 0x7 == 0 {
            return 0;
        }

        (attr & 0x7) | Self::PTE_I | (mtrr_type << Self::PTE_MT_SHIFT)
    }

    /// The VMCS EPT pointer for this table.
    pub fn eptp(&self) -> u64 {
        self.table.root()
            | ((self.table.max_levels() as u64 - 1) << Self::EPTP_WALK_LENGTH_SHIFT)
            | Self::EPTP_WB
    }

    /// Single-context invalidation for this EPT.
    pub fn flush(&self) {
        arch::invept(self.eptp());
    }
}

impl Deref for Ept {
    type Target = EptTable;

    fn deref(&self) -> &EptTable {
        &self.table
    }
}

impl DerefMut for Ept {
    fn deref_mut(&mut self) -> &mut EptTable {
        &mut self.table
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libmuon::mem::PAGE_BITS;

    #[test]
    fn test_eptp_encodes_walk_length() {
        let ept = Ept::new().unwrap();
        let eptp = ept.eptp();
        assert_eq!(ept.root(), eptp & !0xfff);
        assert_eq!(3 << 3 | 6, eptp & 0xfff);
    }

    #[test]
    fn test_guest_mapping() {
        let ept = Ept::new().unwrap();
        let mut cleanup = ept
            .update_one(&EptMapping::new(
                0x1000,
                0x8000_0000,
                Ept::hw_attr(0x7, 6),
                PAGE_BITS,
            ))
            .unwrap();

        let mapping = ept.lookup(0x1000);
        assert!(mapping.present());
        assert_eq!(0x8000_0000, mapping.paddr);

        cleanup.ignore_tlb_flush();
        cleanup.release(&BuddyAlloc);
    }
}
