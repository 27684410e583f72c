//! Portals: immutable IPC entry points.

use crate::ec::Ec;
use crate::kobject::{
    Kobject,
    Object,
    ObjType,
    Refptr,
};
use crate::rcu::RcuElem;
use crate::space::SpaceObj;
use alloc::boxed::Box;
use core::sync::atomic::{
    AtomicU64,
    Ordering,
};
use libmuon::crd::PtPerm;
use libmuon::mtd::Mtd;
use log::trace;

/// A portal: a target EC, the state-transfer mask, and the instruction
/// pointer at which the target resumes. Only the user-settable identifier
/// can change after creation.
#[repr(C)]
pub struct Pt {
    kobj: Kobject,

    pub ec: Refptr<Ec>,
    pub mtd: Mtd,
    pub ip: u64,
    id: AtomicU64,
}

unsafe impl Send for Pt {}
unsafe impl Sync for Pt {}

impl Object for Pt {
    const TYPE: ObjType = ObjType::Pt;

    fn kobj(&self) -> &Kobject {
        &self.kobj
    }
}

impl Pt {
    pub const PERM_CTRL: u64 = PtPerm::PT_CTRL.bits() as u64;
    pub const PERM_CALL: u64 = PtPerm::CALL.bits() as u64;
    pub const PERM_ALL: u64 = Self::PERM_CTRL | Self::PERM_CALL;

    unsafe fn free(elem: *mut RcuElem) {
        drop(Box::from_raw(elem as *mut Pt));
    }

    pub fn create(own: &crate::pd::Pd, sel: u64, ec: &Ec, mtd: Mtd, ip: u64) -> Option<Box<Pt>> {
        let ec = Refptr::new(ec)?;

        let mut pt = Box::new(Pt {
            kobj: Kobject::new(
                ObjType::Pt,
                own.obj() as *const SpaceObj as *mut u8,
                sel,
                Self::PERM_ALL,
                Self::free,
                None,
            ),
            ec,
            mtd,
            ip,
            id: AtomicU64::new(0),
        });

        pt.kobj.finish_init();
        trace!("PT:{:p} created (EC:{:p} IP:{:#x})", pt, pt.ec.raw(), ip);
        Some(pt)
    }

    /// The identifier handed to the callee on every call through this
    /// portal.
    pub fn id(&self) -> u64 {
        self.id.load(Ordering::SeqCst)
    }

    pub fn set_id(&self, id: u64) {
        self.id.store(id, Ordering::SeqCst);
    }
}
