//! Kernel pages: single pages of kernel memory shared with user space.

use crate::kalloc::{
    ptr_to_phys,
    NoMemory,
};
use crate::kobject::{
    Kobject,
    Object,
    ObjType,
    Refcounted,
    Refptr,
};
use crate::pagetable::hpt::Hpt;
use crate::pd::Pd;
use crate::rcu::RcuElem;
use crate::refcount::Refcount;
use crate::space::SpaceObj;
use alloc::boxed::Box;
use core::sync::atomic::{
    AtomicPtr,
    AtomicU64,
    Ordering,
};
use libmuon::crd::KpPerm;
use libmuon::mem::{
    PAGE_MASK,
    PAGE_SIZE,
};
use spin::Mutex;

/// Sentinel: no user mapping exists.
const INVALID_USER_ADDR: u64 = u64::MAX;

/// A kernel page with at most one tracked user mapping.
#[repr(C)]
pub struct Kp {
    kobj: Kobject,
    refcount: Refcount,

    /// The page itself.
    data: Box<[u8; PAGE_SIZE]>,

    /// Serializes mapping changes.
    lock: Mutex<()>,
    /// The PD holding the current user mapping.
    user_pd: AtomicPtr<Pd>,
    /// Where the page is mapped in user space.
    user_addr: AtomicU64,
}

unsafe impl Send for Kp {}
unsafe impl Sync for Kp {}

impl Object for Kp {
    const TYPE: ObjType = ObjType::Kp;

    fn kobj(&self) -> &Kobject {
        &self.kobj
    }
}

impl Refcounted for Kp {
    fn refcount(&self) -> &Refcount {
        &self.refcount
    }
}

impl Kp {
    pub const PERM_KP_CTRL: u64 = KpPerm::KP_CTRL.bits() as u64;

    unsafe fn free(elem: *mut RcuElem) {
        let kp = elem as *mut Kp;
        (*kp).remove_user_mapping();
        drop(Box::from_raw(kp));
    }

    pub fn create(own: &Pd, sel: u64) -> Box<Kp> {
        let mut kp = Box::new(Kp {
            kobj: Kobject::new(
                ObjType::Kp,
                own.obj() as *const SpaceObj as *mut u8,
                sel,
                Self::PERM_KP_CTRL,
                Self::free,
                None,
            ),
            refcount: Refcount::new(),
            data: Box::new([0; PAGE_SIZE]),
            lock: Mutex::new(()),
            user_pd: AtomicPtr::new(core::ptr::null_mut()),
            user_addr: AtomicU64::new(INVALID_USER_ADDR),
        });

        kp.kobj.finish_init();
        kp
    }

    pub fn kernel_addr(&self) -> *const u8 {
        self.data.as_ptr()
    }

    fn has_user_mapping(&self) -> bool {
        self.user_addr.load(Ordering::SeqCst) != INVALID_USER_ADDR
    }

    /// Maps the page read/write into `pd` at `addr`. Fails when a mapping
    /// already exists or the address is not a user page address.
    pub fn add_user_mapping(&self, pd: &'static Pd, addr: u64) -> Result<bool, NoMemory> {
        if addr & PAGE_MASK != 0 || addr >= crate::config::USER_ADDR_LIMIT {
            return Ok(false);
        }

        let _guard = self.lock.lock();

        if self.has_user_mapping() {
            return Ok(false);
        }

        let pd_ref = match Refptr::new(pd) {
            Some(pd_ref) => pd_ref,
            None => return Ok(false),
        };

        pd.mem()
            .insert(
                addr,
                0,
                Hpt::PTE_U | Hpt::PTE_W | Hpt::PTE_P | Hpt::PTE_A | Hpt::PTE_D | Hpt::PTE_NODELEG,
                ptr_to_phys(self.data.as_ptr()),
            )?
            .ignore_tlb_flush();

        self.user_pd.store(pd_ref.raw(), Ordering::SeqCst);
        core::mem::forget(pd_ref);
        self.user_addr.store(addr, Ordering::SeqCst);

        Ok(true)
    }

    /// Tears the user mapping down again.
    pub fn remove_user_mapping(&self) -> bool {
        let _guard = self.lock.lock();

        let addr = self.user_addr.swap(INVALID_USER_ADDR, Ordering::SeqCst);
        if addr == INVALID_USER_ADDR {
            return false;
        }

        let pd = self.user_pd.swap(core::ptr::null_mut(), Ordering::SeqCst);
        if let Some(pd) = unsafe { pd.as_ref() } {
            if let Ok(mut cleanup) = pd.mem().insert(addr, 0, 0, 0) {
                pd.mem().htlb.merge(&pd.mem().cpus);
                crate::space::SpaceMem::shootdown();
                cleanup.ignore_tlb_flush();
                cleanup.release(&crate::kalloc::BuddyAlloc);
            }

            // Drop the reference we took when mapping.
            if pd.refcount().del_rcu() {
                crate::rcu::Rcu::call(pd.kobj().rcu_elem());
            }
        }

        true
    }
}
