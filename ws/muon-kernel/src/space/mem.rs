//! The memory space: host, guest and IOMMU page tables of one PD.

use super::{
    Space,
    Subspace,
};
use crate::arch;
use crate::arch::IpiVector;
use crate::counter::Counter;
use crate::cpulocal::Cpu;
use crate::cpuset::Cpuset;
use crate::config::USER_ADDR_LIMIT;
use crate::hazards::HZD_SCHED;
use crate::kalloc::NoMemory;
use crate::mdb::Mdb;
use crate::pagetable::dpt::{
    Dpt,
    DptMapping,
};
use crate::pagetable::ept::{
    Ept,
    EptMapping,
};
use crate::pagetable::hpt::{
    Hpt,
    HptMapping,
};
use crate::pagetable::TlbCleanup;
use crate::pd::Pd;
use crate::rcu::Rcu;
use alloc::boxed::Box;
use core::sync::atomic::{
    AtomicU32,
    Ordering,
};
use libmuon::mem::{
    PAGE_BITS,
    PAGE_MASK,
};

/// Subspace selector bit: IOMMU tables.
pub const SUBSPACE_DEV: u64 = 1 << 0;
/// Subspace selector bit: guest nested tables.
pub const SUBSPACE_GUEST: u64 = 1 << 1;

/// Monotonic domain-identifier allocator. The DID tags PCID, VPID and the
/// IOMMU domain of the PD.
static DID_CTR: AtomicU32 = AtomicU32::new(0);

/// The memory space of one PD.
#[repr(C)]
pub struct SpaceMem {
    space: Space,

    hpt: Hpt,
    ept: Ept,
    dpt: Dpt,

    /// Domain identifier of this PD.
    pub did: u32,

    /// CPUs this PD has ever run on.
    pub cpus: Cpuset,
    /// CPUs that may hold stale host translations.
    pub htlb: Cpuset,
    /// CPUs that may hold stale guest translations.
    pub gtlb: Cpuset,
}

impl SpaceMem {
    pub fn new() -> Result<Self, NoMemory> {
        Ok(Self {
            space: Space::new(),
            hpt: Hpt::new()?,
            ept: Ept::new()?,
            dpt: Dpt::new()?,
            did: DID_CTR.fetch_add(1, Ordering::SeqCst),
            cpus: Cpuset::new(),
            htlb: Cpuset::new(),
            gtlb: Cpuset::new(),
        })
    }

    /// Notes that the PD is about to run on `cpu`.
    pub fn init(&self, cpu: usize) {
        self.cpus.set(cpu);
    }

    pub fn hpt(&self) -> &Hpt {
        &self.hpt
    }

    pub fn ept(&self) -> &Ept {
        &self.ept
    }

    pub fn dpt(&self) -> &Dpt {
        &self.dpt
    }

    /// Resolves `virt` in the host table. Returns the physical address
    /// and the size of the covering region, or `None`.
    pub fn lookup(&self, virt: u64) -> Option<(u64, u64)> {
        let mapping = self.hpt.lookup(virt);
        mapping
            .present()
            .then(|| (mapping.paddr | (virt & PAGE_MASK), mapping.size()))
    }

    /// Installs a host mapping: `order` in pages, `attr` in hardware
    /// bits. Passing empty attributes removes the region.
    pub fn insert(&self, virt: u64, order: u32, attr: u64, phys: u64) -> Result<TlbCleanup, NoMemory> {
        self.hpt
            .update_one(&HptMapping::new(virt, phys, attr, order + PAGE_BITS))
    }

    /// Tracks a UTCB (or vLAPIC) page in the mapping database so the
    /// region cannot be delegated over.
    pub fn insert_utcb(&self, virt: u64, phys_page: u64) -> bool {
        if virt == 0 {
            return true;
        }

        let node = Box::leak(Box::new(Mdb::new(
            self as *const Self as *mut u8,
            phys_page,
            virt >> PAGE_BITS,
            0,
            0x3,
            0,
            0,
        )));
        node.init_list();

        if Space::tree_insert(node) {
            return true;
        }

        drop(unsafe { Box::from_raw(node as *mut Mdb) });
        false
    }

    /// Removes the UTCB tracking node again.
    pub fn remove_utcb(&self, virt: u64) -> bool {
        if virt == 0 {
            return false;
        }

        let node = self.space.tree_lookup(virt >> PAGE_BITS, false);
        if node.is_null() {
            return false;
        }

        let node = unsafe { &*node };
        node.demote_node(0x3);

        if node.remove_node() && Space::tree_remove(node) {
            Rcu::call(&node.rcu as *const _ as *mut _);
            return true;
        }

        false
    }

    /// Drains all CPUs that hold stale translations of this space with
    /// remote-kernel-entry IPIs, waiting for each to pass through the
    /// kernel.
    pub fn shootdown() {
        for cpu in 0..Cpu::online() {
            let pd = Pd::remote_current(cpu);
            let pd = match pd {
                Some(pd) => pd,
                None => continue,
            };

            let mem = pd.mem();
            if !mem.htlb.chk(cpu) && !mem.gtlb.chk(cpu) {
                continue;
            }

            if Cpu::id() == cpu {
                Cpu::set_hazard(HZD_SCHED);
                continue;
            }

            let ctr = Counter::rke_of(cpu);

            arch::send_ipi(cpu, IpiVector::Rke);

            let resume = !Cpu::preemption();
            if resume {
                arch::enable_interrupts();
            }

            arch::busy_wait(|| Counter::rke_of(cpu) != ctr);

            if resume {
                arch::disable_interrupts();
            }
        }
    }
}

impl Subspace for SpaceMem {
    fn generic(&self) -> &Space {
        &self.space
    }

    /// Writes the node's attributes through all subspace tables the node
    /// is installed in, batching TLB/IOMMU flush obligations into the
    /// returned cleanup object.
    fn update(&self, node: &Mdb, rmask: u64) -> Result<TlbCleanup, NoMemory> {
        debug_assert!(!self.space.is_kernel());

        let mut cleanup = TlbCleanup::tlb_flush(rmask != 0);

        let _guard = node.node_lock.lock();

        let phys = node.node_phys << PAGE_BITS;
        let virt = node.node_base << PAGE_BITS;
        let order = node.node_order + PAGE_BITS;
        let attr = node.attr() & !rmask;

        if node.node_sub & SUBSPACE_DEV != 0 {
            let mut sub = TlbCleanup::new();
            self.dpt
                .update(&mut sub, &DptMapping::new(virt, phys, Dpt::hw_attr(attr), order))?;
            cleanup.merge(&mut sub);
        }

        if node.node_sub & SUBSPACE_GUEST != 0 {
            let mut sub = TlbCleanup::new();
            self.ept.update(
                &mut sub,
                &EptMapping::new(virt, phys, Ept::hw_attr(attr, node.node_type), order),
            )?;
            cleanup.merge(&mut sub);

            if rmask != 0 {
                self.gtlb.merge(&self.cpus);
            }
        }

        // Kernel-space addresses never enter the host table.
        if node.node_end() > USER_ADDR_LIMIT >> PAGE_BITS {
            cleanup.ignore_tlb_flush();
            return Ok(cleanup);
        }

        let mut sub = TlbCleanup::new();
        self.hpt
            .update(&mut sub, &HptMapping::new(virt, phys, Hpt::hw_attr(attr), order))?;
        cleanup.merge(&mut sub);

        if cleanup.need_tlb_flush() {
            self.htlb.merge(&self.cpus);
        }

        Ok(cleanup)
    }

    unsafe fn of_node(node: &Mdb) -> &Self {
        &*(node.space() as *const SpaceMem)
    }
}
