//! PCI requester IDs and DMAR (IOMMU) domain assignment policy.
//!
//! The object-level policy lives here: a device is named by a memory
//! capability for its config space, the requester ID is derived from that
//! physical address, and the device's DMA is routed through the target
//! PD's device page table with the PD's DID as IOMMU domain. The DMAR
//! register programming is behind [`DmarOps`].

use crate::kalloc::NoMemory;
use crate::pd::Pd;
use spin::Mutex;

/// Hardware operations of the IOMMU driver.
#[derive(Debug, Copy, Clone)]
pub struct DmarOps {
    /// Derives the PCI requester ID from a config-space physical address.
    pub phys_to_rid: fn(phys: u64) -> Option<u32>,
    /// Number of DMAR units.
    pub unit_count: fn() -> usize,
    /// Page-table levels the unit supports.
    pub unit_levels: fn(unit: usize) -> u32,
    /// Installs a context entry: requester `rid` uses the device page
    /// table `dpt_root` under domain `did` on `unit`.
    pub assign: fn(unit: usize, rid: u32, did: u32, dpt_root: u64),
}

static OPS: Mutex<Option<DmarOps>> = Mutex::new(None);

pub struct Pci;

impl Pci {
    pub fn register(ops: DmarOps) {
        *OPS.lock() = Some(ops);
    }

    pub fn phys_to_rid(phys: u64) -> Option<u32> {
        OPS.lock().and_then(|ops| (ops.phys_to_rid)(phys))
    }

    /// The DMAR unit selected by the assignment hint.
    pub fn find_dmar(hint: u64) -> Option<Dmar> {
        let ops = (*OPS.lock())?;
        if (hint as usize) < (ops.unit_count)() {
            Some(Dmar {
                unit: hint as usize,
                ops,
            })
        } else {
            None
        }
    }
}

/// One DMAR unit.
#[derive(Debug, Copy, Clone)]
pub struct Dmar {
    unit: usize,
    ops: DmarOps,
}

impl Dmar {
    /// Routes all DMA of `rid` through `pd`'s device page table, tagged
    /// with the PD's DID.
    pub fn assign(&self, rid: u32, pd: &Pd) -> Result<(), NoMemory> {
        let levels = (self.ops.unit_levels)(self.unit);
        let root = pd.mem().dpt().root_at(levels)?;

        (self.ops.assign)(self.unit, rid, pd.mem().did, root);
        Ok(())
    }
}
