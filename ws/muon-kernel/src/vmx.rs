//! VMCS lifecycle, MSR areas, the MSR pass-through bitmap and VPIDs.

use crate::config::NUM_CPUS;
use crate::kalloc::{
    ptr_to_phys,
    NoMemory,
};
use crate::pd::Pd;
use alloc::boxed::Box;
use core::sync::atomic::{
    AtomicU16,
    Ordering,
};
use libmuon::mem::PAGE_SIZE;

/// VMCS field encodings, restricted to the fields the kernel itself
/// touches.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum VmcsField {
    Vpid = 0x0000,
    EptPointer = 0x201a,
    ApicVirtAddr = 0x2012,
    ApicAccsAddr = 0x2014,
    IoBitmapA = 0x2000,
    IoBitmapB = 0x2002,
    MsrBitmap = 0x2004,
    ExiMsrStAddr = 0x2006,
    ExiMsrLdAddr = 0x2008,
    EntMsrLdAddr = 0x200a,
    TscOffset = 0x2010,

    ExiMsrStCnt = 0x400e,
    ExiMsrLdCnt = 0x4010,
    EntMsrLdCnt = 0x4014,

    ExiReason = 0x4402,
    ExiIntrInfo = 0x4404,
    ExiIntrError = 0x4406,
    IdtVectInfo = 0x4408,
    IdtVectError = 0x440a,
    ExiInstLen = 0x440c,
    EntIntrInfo = 0x4016,
    EntIntrError = 0x4018,
    EntInstLen = 0x401a,

    GuestIntrState = 0x4824,
    GuestActvState = 0x4826,

    ExiQualification = 0x6400,
    InfoPhysAddr = 0x2400,

    GuestCr0 = 0x6800,
    GuestCr3 = 0x6802,
    GuestCr4 = 0x6804,
    GuestRsp = 0x681c,
    GuestRip = 0x681e,
    GuestRflags = 0x6820,
    GuestSysenterEsp = 0x6824,
    GuestSysenterEip = 0x6826,
}

#[cfg(test)]
type Shadow = spin::Mutex<alloc::collections::BTreeMap<u32, u64>>;

/// One virtual-machine control structure.
pub struct Vmcs {
    /// The hardware VMCS region.
    region: Box<[u8; PAGE_SIZE]>,

    #[cfg(test)]
    shadow: Shadow,
}

impl Vmcs {
    pub fn new() -> Result<Self, NoMemory> {
        Ok(Self {
            region: Box::new([0; PAGE_SIZE]),
            #[cfg(test)]
            shadow: spin::Mutex::new(alloc::collections::BTreeMap::new()),
        })
    }

    pub fn phys(&self) -> u64 {
        ptr_to_phys(self.region.as_ptr())
    }

    /// Clears the launch state (VMCLEAR).
    pub fn clear(&self) {
        #[cfg(not(test))]
        unsafe {
            let phys = self.phys();
            core::arch::asm!("vmclear [{}]", in(reg) &phys, options(nostack));
        }
    }

    /// Loads this VMCS on the current CPU (VMPTRLD).
    pub fn make_current(&self) {
        #[cfg(not(test))]
        unsafe {
            let phys = self.phys();
            core::arch::asm!("vmptrld [{}]", in(reg) &phys, options(nostack));
        }
    }

    #[cfg(not(test))]
    pub fn read(&self, field: VmcsField) -> u64 {
        let val: u64;
        unsafe {
            core::arch::asm!("vmread {}, {}", out(reg) val, in(reg) field as u32 as u64, options(nostack));
        }
        val
    }

    #[cfg(not(test))]
    pub fn write(&self, field: VmcsField, val: u64) {
        unsafe {
            core::arch::asm!("vmwrite {}, {}", in(reg) field as u32 as u64, in(reg) val, options(nostack));
        }
    }

    #[cfg(test)]
    pub fn read(&self, field: VmcsField) -> u64 {
        *self.shadow.lock().get(&(field as u32)).unwrap_or(&0)
    }

    #[cfg(test)]
    pub fn write(&self, field: VmcsField, val: u64) {
        self.shadow.lock().insert(field as u32, val);
    }
}

/// Number of MSRs saved/loaded around VM transitions.
pub const MSR_COUNT: usize = 5;

/// The MSRs in the save/load area, in slot order.
pub const MSR_AREA_MSRS: [u32; MSR_COUNT] = [
    0xC000_0081, // STAR
    0xC000_0082, // LSTAR
    0xC000_0084, // FMASK
    0xC000_0102, // KERNEL_GS_BASE
    0xC000_0103, // TSC_AUX
];

#[derive(Debug, Copy, Clone, Default)]
#[repr(C)]
pub struct MsrAreaEntry {
    pub index: u32,
    _reserved: u32,
    pub value: u64,
}

/// An MSR save/load area as consumed by VM entry/exit controls.
#[derive(Debug)]
#[repr(C, align(16))]
pub struct MsrArea {
    pub entries: [MsrAreaEntry; MSR_COUNT],
}

impl MsrArea {
    pub fn new() -> Box<Self> {
        let mut area = Box::new(MsrArea {
            entries: [MsrAreaEntry::default(); MSR_COUNT],
        });

        for (entry, msr) in area.entries.iter_mut().zip(MSR_AREA_MSRS) {
            entry.index = msr;
        }

        area
    }

    pub fn phys(&self) -> u64 {
        ptr_to_phys(self as *const Self as *const u8)
    }
}

/// The MSR pass-through bitmap: one exit bit per MSR for reads and
/// writes, low (0..0x2000) and high (0xC0000000..0xC0002000) ranges.
#[repr(C, align(4096))]
pub struct MsrBitmap {
    bits: [u8; PAGE_SIZE],
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MsrAccess {
    Read,
    Write,
}

impl MsrBitmap {
    /// A bitmap that exits on every MSR access.
    pub fn new() -> Box<Self> {
        Box::new(Self {
            bits: [0xff; PAGE_SIZE],
        })
    }

    pub fn phys(&self) -> u64 {
        ptr_to_phys(self.bits.as_ptr())
    }

    fn bit_of(msr: u32, access: MsrAccess) -> Option<(usize, u8)> {
        let (base, msr) = match msr {
            0..=0x1fff => (0usize, msr),
            0xc000_0000..=0xc000_1fff => (0x400, msr - 0xc000_0000),
            _ => return None,
        };

        let byte = base
            + match access {
                MsrAccess::Read => 0,
                MsrAccess::Write => 0x800,
            }
            + (msr / 8) as usize;

        Some((byte, 1 << (msr % 8)))
    }

    /// Whether the given access exits.
    pub fn exits(&self, msr: u32, access: MsrAccess) -> bool {
        match Self::bit_of(msr, access) {
            Some((byte, mask)) => self.bits[byte] & mask != 0,
            // Out-of-range MSRs always exit.
            None => true,
        }
    }

    /// Grants the guest direct access to the MSR.
    pub fn set_passthrough(&mut self, msr: u32, access: MsrAccess) -> bool {
        match Self::bit_of(msr, access) {
            Some((byte, mask)) => {
                self.bits[byte] &= !mask;
                true
            }
            None => false,
        }
    }

    /// Forces exits for the MSR again.
    pub fn set_exit(&mut self, msr: u32, access: MsrAccess) -> bool {
        match Self::bit_of(msr, access) {
            Some((byte, mask)) => {
                self.bits[byte] |= mask;
                true
            }
            None => false,
        }
    }
}

/// Per-CPU VPID allocators. VPID 0 belongs to the host.
static VPID_CTR: [AtomicU16; NUM_CPUS] = {
    const ONE: AtomicU16 = AtomicU16::new(1);
    [ONE; NUM_CPUS]
};

/// Everything a vCPU EC owns on top of a thread EC.
pub struct VcpuState {
    pub vmcs: Vmcs,
    pub guest_msr: Box<MsrArea>,
    pub host_msr: Box<MsrArea>,
    pub msr_bitmap: Box<MsrBitmap>,
    /// The virtual-LAPIC page, shared with user space.
    pub vlapic: Box<[u8; PAGE_SIZE]>,
    /// VPID per CPU, allocated on first dispatch there.
    vpid: [AtomicU16; NUM_CPUS],
}

impl VcpuState {
    pub fn new(pd: &Pd, use_apic_access_page: bool) -> Result<Box<Self>, NoMemory> {
        const ZERO: AtomicU16 = AtomicU16::new(0);

        let state = Box::new(VcpuState {
            vmcs: Vmcs::new()?,
            guest_msr: MsrArea::new(),
            host_msr: MsrArea::new(),
            msr_bitmap: MsrBitmap::new(),
            vlapic: Box::new([0; PAGE_SIZE]),
            vpid: [ZERO; NUM_CPUS],
        });

        let vmcs = &state.vmcs;
        vmcs.clear();

        vmcs.write(VmcsField::EptPointer, pd.mem().ept().eptp());
        vmcs.write(VmcsField::IoBitmapA, pd.pio().bitmap_phys(false));
        vmcs.write(VmcsField::IoBitmapB, pd.pio().bitmap_phys(false) + PAGE_SIZE as u64);
        vmcs.write(VmcsField::MsrBitmap, state.msr_bitmap.phys());

        vmcs.write(VmcsField::ExiMsrLdAddr, state.host_msr.phys());
        vmcs.write(VmcsField::ExiMsrLdCnt, MSR_COUNT as u64);
        vmcs.write(VmcsField::EntMsrLdAddr, state.guest_msr.phys());
        vmcs.write(VmcsField::EntMsrLdCnt, MSR_COUNT as u64);
        vmcs.write(VmcsField::ExiMsrStAddr, state.guest_msr.phys());
        vmcs.write(VmcsField::ExiMsrStCnt, MSR_COUNT as u64);

        vmcs.write(VmcsField::ApicVirtAddr, ptr_to_phys(state.vlapic.as_ptr()));
        if use_apic_access_page {
            vmcs.write(VmcsField::ApicAccsAddr, pd.apic_access_page()?);
        }

        Ok(state)
    }

    pub fn vlapic_phys(&self) -> u64 {
        ptr_to_phys(self.vlapic.as_ptr())
    }

    /// The VPID of this vCPU on `cpu`, allocated on first use.
    pub fn vpid(&self, cpu: usize) -> u16 {
        let cur = self.vpid[cpu].load(Ordering::SeqCst);
        if cur != 0 {
            return cur;
        }

        let fresh = VPID_CTR[cpu].fetch_add(1, Ordering::SeqCst);
        match self.vpid[cpu].compare_exchange(0, fresh, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => fresh,
            Err(existing) => existing,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_msr_bitmap_defaults_to_exits() {
        let bitmap = MsrBitmap::new();
        assert!(bitmap.exits(0x10, MsrAccess::Read));
        assert!(bitmap.exits(0xc000_0081, MsrAccess::Write));
        // Out of range exits unconditionally.
        assert!(bitmap.exits(0x4000_0000, MsrAccess::Read));
    }

    #[test]
    fn test_msr_bitmap_passthrough_is_per_access() {
        let mut bitmap = MsrBitmap::new();

        assert!(bitmap.set_passthrough(0xc000_0102, MsrAccess::Read));
        assert!(!bitmap.exits(0xc000_0102, MsrAccess::Read));
        assert!(bitmap.exits(0xc000_0102, MsrAccess::Write), "writes still exit");

        assert!(bitmap.set_exit(0xc000_0102, MsrAccess::Read));
        assert!(bitmap.exits(0xc000_0102, MsrAccess::Read));

        assert!(!bitmap.set_passthrough(0x4000_0000, MsrAccess::Read));
    }

    #[test]
    fn test_msr_area_layout() {
        assert_eq!(16, core::mem::size_of::<MsrAreaEntry>());
        let area = MsrArea::new();
        assert_eq!(0xC000_0081, area.entries[0].index);
        assert_eq!(0xC000_0103, area.entries[MSR_COUNT - 1].index);
    }

    #[test]
    fn test_vmcs_shadow_roundtrip() {
        let vmcs = Vmcs::new().unwrap();
        vmcs.write(VmcsField::GuestRip, 0x1234);
        assert_eq!(0x1234, vmcs.read(VmcsField::GuestRip));
        assert_eq!(0, vmcs.read(VmcsField::GuestRsp));
    }
}
