//! Capabilities: a tagged object pointer plus a permission mask in one
//! machine word.

use crate::kobject::{
    Kobject,
    Object,
};

/// A capability word as stored in an object space slot. The five low bits
/// carry permissions; a capability without permissions is null.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct Capability(u64);

impl Capability {
    const PERM: u64 = 0x1f;

    /// The null capability, read from unmapped object-space slots.
    pub const NULL: Self = Self(0);

    pub fn new(obj: *const Kobject, attr: u64) -> Self {
        if attr & Self::PERM != 0 {
            Self(obj as u64 | (attr & Self::PERM))
        } else {
            Self(0)
        }
    }

    pub fn obj(self) -> *mut Kobject {
        (self.0 & !Self::PERM) as *mut Kobject
    }

    pub fn prm(self) -> u64 {
        self.0 & Self::PERM
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

/// Casts a capability to a specific object type with dynamic type
/// checking, optionally verifying permission bits. Returns `None` when the
/// capability is null, of the wrong type, or lacks permissions, just like
/// a failed downcast.
///
/// The returned reference is valid for the current RCU read side: until
/// the next quiescent state of this CPU.
pub fn capability_cast<T: Object>(cap: Capability, required_permissions: u64) -> Option<&'static T> {
    let obj = cap.obj();

    if obj.is_null() {
        return None;
    }

    let kobj = unsafe { &*obj };
    if kobj.obj_type() != T::TYPE || cap.prm() & required_permissions != required_permissions {
        return None;
    }

    Some(unsafe { &*(obj as *const T) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kobject::ObjType;
    use crate::rcu::RcuElem;

    #[repr(C)]
    struct DummyPt {
        kobj: Kobject,
        payload: u64,
    }

    impl Object for DummyPt {
        const TYPE: ObjType = ObjType::Pt;

        fn kobj(&self) -> &Kobject {
            &self.kobj
        }
    }

    unsafe fn nop_free(_e: *mut RcuElem) {}

    fn dummy() -> std::boxed::Box<DummyPt> {
        let mut obj = std::boxed::Box::new(DummyPt {
            kobj: Kobject::new(ObjType::Pt, core::ptr::null_mut(), 5, 0x3, nop_free, None),
            payload: 42,
        });
        obj.kobj.finish_init();
        obj
    }

    #[test]
    fn test_roundtrip_and_type_check() {
        let obj = dummy();
        let cap = Capability::new(&obj.kobj, 0x3);

        let pt: &DummyPt = capability_cast(cap, 0).unwrap();
        assert_eq!(42, pt.payload);

        // Wrong type.
        struct NotPt;
        impl Object for NotPt {
            const TYPE: ObjType = ObjType::Sm;
            fn kobj(&self) -> &Kobject {
                unreachable!()
            }
        }
        assert!(capability_cast::<NotPt>(cap, 0).is_none());

        // Missing permissions.
        assert!(capability_cast::<DummyPt>(cap, 0x4).is_none());
        // Null capability.
        assert!(capability_cast::<DummyPt>(Capability::NULL, 0).is_none());
    }

    #[test]
    fn test_zero_attr_is_null() {
        let obj = dummy();
        let cap = Capability::new(&obj.kobj, 0);
        assert_eq!(Capability::NULL, cap);
        assert!(cap.obj().is_null());
    }
}
