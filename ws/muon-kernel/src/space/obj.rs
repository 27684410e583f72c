//! The object space: the capability table of a protection domain.
//!
//! Capabilities live in a sparse, page-backed table in a dedicated kernel
//! virtual range of the PD's host page table. Slots whose backing page was
//! never written map a shared zero page read-only, so capability lookup
//! never faults and unknown selectors read as null capabilities. The first
//! write to such a page promotes it to a private frame via the atomic
//! read-only-replace operation of the page-table engine.

use super::{
    Space,
    SpaceMem,
    Subspace,
};
use crate::capability::Capability;
use crate::config::OBJ_SPACE_BASE;
use crate::kalloc::{
    phys_to_ptr,
    ptr_to_phys,
    BuddyAlloc,
    NoMemory,
    PageAlloc,
};
use crate::kobject::Kobject;
use crate::mdb::Mdb;
use crate::pagetable::hpt::Hpt;
use crate::pagetable::TlbCleanup;
use core::sync::atomic::{
    AtomicU64,
    Ordering,
};
use libmuon::crd::CapSel;
use libmuon::mem::{
    PAGE_MASK,
    PAGE_SIZE,
};

/// The shared all-zeroes page backing untouched object-space slots.
#[repr(C, align(4096))]
struct ZeroPage([u8; PAGE_SIZE]);

static ZERO_PAGE: ZeroPage = ZeroPage([0; PAGE_SIZE]);

/// Physical address of the shared zero page.
pub fn zero_page_phys() -> u64 {
    ptr_to_phys(ZERO_PAGE.0.as_ptr())
}

/// The object space of one PD.
#[repr(C)]
#[derive(Debug)]
pub struct SpaceObj {
    space: Space,
    /// The memory space of the same PD; capability-table pages live in
    /// its host page table. Set once when the PD reaches its final
    /// address.
    mem: core::sync::atomic::AtomicPtr<SpaceMem>,
}

impl SpaceObj {
    pub const fn new() -> Self {
        Self {
            space: Space::new(),
            mem: core::sync::atomic::AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    /// Links the object space to its PD's memory space.
    pub fn set_mem(&self, mem: *const SpaceMem) {
        self.mem.store(mem as *mut SpaceMem, Ordering::SeqCst);
    }

    /// Virtual address of a selector's slot in the capability table.
    fn sel_to_virt(sel: CapSel) -> u64 {
        OBJ_SPACE_BASE + sel * core::mem::size_of::<Capability>() as u64
    }

    fn mem(&self) -> &SpaceMem {
        unsafe { &*self.mem.load(Ordering::SeqCst) }
    }

    /// Resolves the slot of `sel` to a writable frame, promoting the
    /// shared zero page to a private frame on first write. Returns the
    /// physical address of the slot and whether a read-only mapping was
    /// displaced (requiring a shootdown).
    fn walk(&self, sel: CapSel) -> Result<(u64, bool), NoMemory> {
        let virt = Self::sel_to_virt(sel);
        let mem = self.mem();

        let mut shootdown = false;

        let slot_phys = match mem.hpt().lookup_phys(virt) {
            Some(phys) if phys & !PAGE_MASK != zero_page_phys() => phys,
            existing => {
                shootdown = existing.is_some();

                let fresh = BuddyAlloc.alloc_zeroed_page()?;
                let pte = fresh | Hpt::PTE_NX | Hpt::PTE_D | Hpt::PTE_A | Hpt::PTE_W | Hpt::PTE_P;
                let now = mem.hpt().replace(virt, pte)?;

                // A concurrent walk may have won the race; its frame is
                // the one that stays.
                if now != fresh {
                    BuddyAlloc.free_page(fresh);
                }

                now | (virt & PAGE_MASK)
            }
        };

        Ok((slot_phys, shootdown))
    }

    fn slot(phys: u64) -> &'static AtomicU64 {
        unsafe { &*(phys_to_ptr(phys) as *const AtomicU64) }
    }

    /// Reads the capability stored for `sel`. Unbacked slots yield the
    /// null capability.
    pub fn lookup(&self, sel: CapSel) -> Capability {
        let virt = Self::sel_to_virt(sel);

        match self.mem().hpt().lookup_phys(virt) {
            Some(phys) if phys & !PAGE_MASK != zero_page_phys() => {
                Capability::from_raw(Self::slot(phys).load(Ordering::SeqCst))
            }
            _ => Capability::NULL,
        }
    }

    /// Stores a capability word for `sel`.
    pub fn insert(&self, sel: CapSel, cap: Capability) -> Result<TlbCleanup, NoMemory> {
        let (phys, shootdown) = self.walk(sel)?;
        Self::slot(phys).store(cap.raw(), Ordering::SeqCst);
        Ok(TlbCleanup::tlb_flush(shootdown))
    }

    /// Inserts a freshly created object's root capability: the object's
    /// own MDB node goes into the creator's tree and the capability word
    /// into the table.
    pub fn insert_root(obj: &Kobject) -> Result<bool, NoMemory> {
        if !Space::tree_insert(&obj.mdb) {
            return Ok(false);
        }

        let space = unsafe { SpaceObj::of_node(&obj.mdb) };
        if !space.space.is_kernel() {
            space
                .insert(obj.mdb.node_base, Capability::new(obj, obj.mdb.attr()))?
                .ignore_tlb_flush();
        }

        Ok(true)
    }

    /// Handles a page fault in the object-space region: installs the
    /// shared zero page read-only.
    pub fn page_fault(&self, addr: u64, error: u64) -> Result<(), NoMemory> {
        assert_eq!(0, error & Hpt::ERR_W, "write fault on an object-space page");

        let pte = zero_page_phys() | Hpt::PTE_NX | Hpt::PTE_A | Hpt::PTE_P;
        let _ = self.mem().hpt().replace(addr & !PAGE_MASK, pte)?;
        Ok(())
    }
}

impl Subspace for SpaceObj {
    fn generic(&self) -> &Space {
        &self.space
    }

    fn update(&self, node: &Mdb, rmask: u64) -> Result<TlbCleanup, NoMemory> {
        debug_assert!(!self.space.is_kernel());

        let _guard = node.node_lock.lock();
        let cap = Capability::new(node.node_phys as *const Kobject, node.attr() & !rmask);
        self.insert(node.node_base, cap)
    }

    unsafe fn of_node(node: &Mdb) -> &Self {
        &*(node.space() as *const SpaceObj)
    }
}
