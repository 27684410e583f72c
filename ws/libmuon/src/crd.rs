//! Capability Range Descriptors ([`Crd`]) and capability permission masks.
//!
//! A CRD names a region of one of the three capability spaces of a
//! protection domain: memory pages, x86 I/O ports, or object capabilities.
//! It is a single machine word and travels in registers on hypercalls and
//! in typed items ([`Xfer`]) on IPC.

use bitflags::bitflags;
use core::fmt::{
    Debug,
    Formatter,
};
use enum_iterator::IntoEnumIterator;

/// Generic capability selector. It indexes into the object space of a
/// protection domain, similar to a file descriptor in UNIX.
pub type CapSel = u64;

/// Highest possible order for a [`Crd`]. An order has exactly 5 bits.
pub const MAX_CRD_ORDER: u8 = 0x1f;
/// Highest possible base for a [`Crd`]. A base has exactly 52 bits.
pub const MAX_CRD_BASE: u64 = 0x000f_ffff_ffff_ffff;

/// The space a [`Crd`] refers to. Encoded in the two lowest bits.
#[derive(Debug, Copy, Clone, PartialEq, Eq, IntoEnumIterator)]
#[repr(u8)]
pub enum CrdKind {
    /// The null capability. Revoking or delegating it is a no-op.
    Null = 0,
    /// Memory pages. The base is a page number.
    Mem = 1,
    /// x86 I/O ports. The base is a port number.
    Pio = 2,
    /// Kernel objects. The base is a capability selector.
    Obj = 3,
}

impl CrdKind {
    /// Returns the raw unsigned integer value.
    pub fn val(self) -> u8 {
        self as u8
    }
}

impl From<u8> for CrdKind {
    fn from(val: u8) -> Self {
        for variant in Self::into_enum_iter() {
            if variant.val() == val {
                return variant;
            }
        }
        unreachable!("two bits always map to a CrdKind")
    }
}

/// A **C**apability **R**ange **D**escriptor.
///
/// Bit layout: `bits[1:0]` kind, `bits[6:2]` attribute/permission mask,
/// `bits[11:7]` order, `bits[63:12]` base. An order-`N` CRD covers `2^N`
/// consecutive units starting at a base aligned down to `2^N`.
#[derive(Copy, Clone, PartialEq, Eq, Default)]
pub struct Crd(u64);

impl Crd {
    const KIND_BITS: u64 = 0b11;
    const ATTR_SHIFT: u64 = 2;
    const ATTR_BITS: u64 = 0x1f;
    const ORDER_SHIFT: u64 = 7;
    const ORDER_BITS: u64 = 0x1f;
    const BASE_SHIFT: u64 = 12;

    /// The null CRD.
    pub const NULL: Self = Self(0);

    /// Constructs a CRD from its parts. Base and order are masked to their
    /// field widths; callers that care about truncation must validate first.
    pub fn new(kind: CrdKind, base: u64, order: u8, attr: u8) -> Self {
        Self(
            (base << Self::BASE_SHIFT)
                | ((order as u64 & Self::ORDER_BITS) << Self::ORDER_SHIFT)
                | ((attr as u64 & Self::ATTR_BITS) << Self::ATTR_SHIFT)
                | (kind.val() as u64 & Self::KIND_BITS),
        )
    }

    /// Constructs a CRD covering a whole space: base 0, maximum order, all
    /// attribute bits. Used by revoke-everything paths.
    pub fn whole(kind: CrdKind) -> Self {
        Self::new(kind, 0, MAX_CRD_ORDER, 0x1f)
    }

    /// Reconstructs a CRD from its raw transfer value.
    pub fn from_raw(val: u64) -> Self {
        Self(val)
    }

    /// The raw transfer value.
    pub fn val(self) -> u64 {
        self.0
    }

    pub fn kind(self) -> CrdKind {
        CrdKind::from((self.0 & Self::KIND_BITS) as u8)
    }

    /// The 5-bit attribute/permission mask.
    pub fn attr(self) -> u8 {
        (self.0 >> Self::ATTR_SHIFT & Self::ATTR_BITS) as u8
    }

    /// The 5-bit order. The region covers `2^order` units.
    pub fn order(self) -> u8 {
        (self.0 >> Self::ORDER_SHIFT & Self::ORDER_BITS) as u8
    }

    /// The base unit (page number, port number, or selector).
    pub fn base(self) -> u64 {
        self.0 >> Self::BASE_SHIFT
    }

    /// A CRD is null if its kind is [`CrdKind::Null`].
    pub fn is_null(self) -> bool {
        self.kind() == CrdKind::Null
    }
}

impl Debug for Crd {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Crd")
            .field("kind", &self.kind())
            .field("base", &self.base())
            .field("order", &self.order())
            .field("attr", &self.attr())
            .finish()
    }
}

/// The kind of a typed item, encoded in the two lowest metadata bits of an
/// [`Xfer`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, IntoEnumIterator)]
#[repr(u8)]
pub enum XferKind {
    Translate = 0,
    Delegate = 1,
    TransDelegate = 2,
    Invalid = 3,
}

impl From<u8> for XferKind {
    fn from(val: u8) -> Self {
        for variant in Self::into_enum_iter() {
            if variant as u8 == val {
                return variant;
            }
        }
        unreachable!("two bits always map to an XferKind")
    }
}

/// A typed item: a [`Crd`] plus a metadata word carrying the item kind,
/// flags and the hot-spot used by the delegation clamp rule.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(C)]
pub struct Xfer {
    crd: Crd,
    meta: u64,
}

impl Xfer {
    /// Items carrying this flag use the kernel PD as delegation source.
    /// Only honoured when the sender is the roottask.
    pub const FLAG_FROM_KERNEL: u64 = 0x800;

    pub fn new(crd: Crd, meta: u64) -> Self {
        Self { crd, meta }
    }

    pub fn crd(self) -> Crd {
        self.crd
    }

    pub fn metadata(self) -> u64 {
        self.meta
    }

    /// The low 12 metadata bits.
    pub fn flags(self) -> u64 {
        self.meta & 0xfff
    }

    /// The hot-spot fills address bits not determined by the smaller of
    /// the two orders when delegating between differently sized regions.
    pub fn hotspot(self) -> u64 {
        self.meta >> 12
    }

    pub fn kind(self) -> XferKind {
        XferKind::from((self.meta & 0x3) as u8)
    }

    /// Subspace selector for memory delegations:
    /// bit 0 = IOMMU tables, bit 1 = guest tables.
    pub fn subspaces(self) -> u64 {
        (self.meta >> 9) & 0x3
    }

    pub fn from_kernel(self) -> bool {
        self.flags() & Self::FLAG_FROM_KERNEL != 0
    }
}

bitflags! {
    /// Permissions of a memory-page capability.
    pub struct MemPerm: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

bitflags! {
    /// Permissions of an I/O-port capability.
    pub struct PioPerm: u8 {
        const READ_WRITE = 1 << 0;
    }
}

bitflags! {
    /// Permissions of a `PD` object capability.
    pub struct PdPerm: u8 {
        /// The holder may create kernel objects inside this PD
        /// (`create_pd`, `create_ec`, ...).
        const OBJ_CREATION = 1 << 0;
    }
}

bitflags! {
    /// Permissions of an `EC` object capability.
    pub struct EcPerm: u8 {
        const EC_CTRL = 1 << 0;
        const CREATE_SC = 1 << 2;
        const CREATE_PT = 1 << 3;
    }
}

bitflags! {
    /// Permissions of an `SC` object capability.
    pub struct ScPerm: u8 {
        const SC_CTRL = 1 << 0;
    }
}

bitflags! {
    /// Permissions of a `PT` object capability.
    pub struct PtPerm: u8 {
        const PT_CTRL = 1 << 0;
        const CALL = 1 << 1;
    }
}

bitflags! {
    /// Permissions of an `SM` object capability.
    pub struct SmPerm: u8 {
        const UP = 1 << 0;
        const DOWN = 1 << 1;
    }
}

bitflags! {
    /// Permissions of a `KP` object capability.
    pub struct KpPerm: u8 {
        const KP_CTRL = 1 << 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::size_of;

    #[test]
    fn test_size() {
        assert_eq!(8, size_of::<Crd>());
        assert_eq!(16, size_of::<Xfer>());
    }

    #[test]
    fn test_bits() {
        let crd = Crd::new(CrdKind::Mem, MAX_CRD_BASE, MAX_CRD_ORDER, 0b111);

        assert_eq!(CrdKind::Mem, crd.kind());
        assert_eq!(MAX_CRD_BASE, crd.base());
        assert_eq!(MAX_CRD_ORDER, crd.order());
        assert_eq!(0b111, crd.attr());

        let val = crd.val();
        assert_eq!(0b01, val & 0x3, "kind bits must match");
        assert_eq!(0b111 << 2, val & 0b111_1100, "attr bits must match");
        assert_eq!(
            (MAX_CRD_ORDER as u64) << 7,
            val & 0b1111_1000_0000,
            "order bits must match"
        );
        assert_eq!(MAX_CRD_BASE << 12, val & !0xfff, "base bits must match");
    }

    #[test]
    fn test_null() {
        assert!(Crd::NULL.is_null());
        assert!(!Crd::new(CrdKind::Obj, 0, 0, 0).is_null());
        assert_eq!(Crd::default(), Crd::NULL);
    }

    #[test]
    fn test_xfer() {
        let crd = Crd::new(CrdKind::Mem, 0x1000, 4, MemPerm::all().bits());
        let xfer = Xfer::new(crd, (0xcafe << 12) | 0x800 | (0b10 << 9) | 1);

        assert_eq!(crd, xfer.crd());
        assert_eq!(XferKind::Delegate, xfer.kind());
        assert_eq!(0xcafe, xfer.hotspot());
        assert_eq!(0b10, xfer.subspaces());
        assert!(xfer.from_kernel());
    }
}
