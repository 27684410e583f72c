//! Kernel objects.
//!
//! Every kernel object starts with a [`Kobject`] header: the object's root
//! MDB node (which doubles as its RCU retirement hook) plus a type tag
//! that is checked on every capability dereference. Concrete objects are
//! `#[repr(C)]` with the header as first field, so a `Kobject` pointer and
//! an object pointer are freely convertible.

use crate::mdb::Mdb;
use crate::rcu::{
    Rcu,
    RcuElem,
};
use crate::refcount::Refcount;
use core::ops::Deref;
use core::ptr::NonNull;
use static_assertions::const_assert;

// Capabilities steal the five low bits of object pointers.
const_assert!(core::mem::align_of::<Kobject>() >= 32);

/// The closed set of kernel-object types.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjType {
    Pd,
    Ec,
    Sc,
    Pt,
    Sm,
    Kp,
    Vcpu,
}

/// Common header of all kernel objects.
///
/// Aligned to 32 bytes so that the five low bits of an object pointer are
/// free to carry capability permissions.
#[repr(C, align(32))]
pub struct Kobject {
    /// Root MDB node of the object's capability. First field: its RCU
    /// element retires the whole object.
    pub mdb: Mdb,
    objtype: ObjType,
}

impl Kobject {
    /// Creates an object header. `sel` is the creator-chosen capability
    /// selector, `attr` the default permission mask of the root
    /// capability.
    pub fn new(
        objtype: ObjType,
        space: *mut u8,
        sel: u64,
        attr: u64,
        free: unsafe fn(*mut RcuElem),
        pre_free: Option<unsafe fn(*mut RcuElem)>,
    ) -> Self {
        Self {
            mdb: Mdb::with_free(space, 0, sel, 0, attr, 0, 0, free, pre_free),
            objtype,
        }
    }

    pub fn obj_type(&self) -> ObjType {
        self.objtype
    }

    /// Finishes initialization once the object has its final address: the
    /// MDB node records the object pointer as its "physical" payload and
    /// becomes a one-element delegation tree.
    pub fn finish_init(&mut self) {
        self.mdb.node_phys = self as *const _ as u64;
        self.mdb.init_list();
    }

    pub fn rcu_elem(&self) -> *mut RcuElem {
        &self.mdb.rcu as *const _ as *mut RcuElem
    }
}

/// Implemented by every concrete kernel object.
pub trait Object {
    const TYPE: ObjType;

    fn kobj(&self) -> &Kobject;
}

/// Implemented by objects with a reference count.
pub trait Refcounted: Object {
    fn refcount(&self) -> &Refcount;
}

/// An owning reference to a refcounted kernel object. Dropping the last
/// one hands the object to RCU.
pub struct Refptr<T: Refcounted> {
    ptr: NonNull<T>,
}

unsafe impl<T: Refcounted + Sync> Send for Refptr<T> {}
unsafe impl<T: Refcounted + Sync> Sync for Refptr<T> {}

impl<T: Refcounted> Refptr<T> {
    /// Takes a new reference. Fails when the object is already dying.
    pub fn new(obj: &T) -> Option<Self> {
        obj.refcount().add_ref().then(|| Self {
            ptr: NonNull::from(obj),
        })
    }

    pub fn raw(&self) -> *mut T {
        self.ptr.as_ptr()
    }
}

impl<T: Refcounted> Deref for Refptr<T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { self.ptr.as_ref() }
    }
}

impl<T: Refcounted> Drop for Refptr<T> {
    fn drop(&mut self) {
        let obj = unsafe { self.ptr.as_ref() };
        if obj.refcount().del_rcu() {
            Rcu::call(obj.kobj().rcu_elem());
        }
    }
}
