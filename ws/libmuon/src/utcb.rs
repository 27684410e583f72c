//! The User Thread Control Block ([`Utcb`]): the per-thread message page.
//!
//! An execution context uses its UTCB for IPC and event messages. The page
//! starts with a small header, followed by a data area that is either an
//! architectural register image (for event messages) or a sequence of
//! untyped items growing upwards plus typed items ([`Xfer`]) growing
//! downwards from the top of the page.

use crate::crd::{
    Crd,
    Xfer,
};
use crate::mem::PAGE_SIZE;
use crate::mtd::Mtd;
use core::fmt::{
    Debug,
    Formatter,
};
use core::mem::size_of;
use static_assertions::const_assert_eq;

/// Capacity in bytes of the UTCB data area.
pub const UTCB_DATA_CAPACITY: usize = PAGE_SIZE - size_of::<UtcbHead>();
/// Capacity count of untyped items in the UTCB data area.
pub const UNTYPED_ITEM_CAPACITY: usize = UTCB_DATA_CAPACITY / size_of::<u64>();
/// Capacity count of typed items in the UTCB data area.
pub const TYPED_ITEM_CAPACITY: usize = UTCB_DATA_CAPACITY / size_of::<Xfer>();

/// The UTCB header.
#[derive(Debug)]
#[repr(C)]
pub struct UtcbHead {
    /// Low half: number of untyped items. High half: number of typed items.
    pub items: u64,
    /// CRD describing the receive window for capability translation.
    pub xlt: u64,
    /// CRD describing the receive window for capability delegation.
    pub dlt: u64,
    /// Never touched by the kernel; free for thread-local data.
    pub tls: u64,
}

impl UtcbHead {
    pub const fn new() -> Self {
        Self {
            items: 0,
            xlt: 0,
            dlt: 0,
            tls: 0,
        }
    }
}

/// Segment descriptor image inside the exception frame.
#[derive(Debug, Copy, Clone, Default)]
#[repr(C)]
pub struct UtcbSegment {
    pub sel: u16,
    pub ar: u16,
    pub limit: u32,
    pub base: u64,
}

/// The architectural state image used for exception and VM-exit messages.
/// Which fields are valid is governed by the [`Mtd`] in the first word.
#[derive(Debug, Copy, Clone)]
#[repr(C)]
pub struct UtcbFrame {
    pub mtd: Mtd,
    pub inst_len: u64,
    pub rip: u64,
    pub rflags: u64,
    pub intr_state: u32,
    pub actv_state: u32,
    pub intr_info: u32,
    pub intr_error: u32,
    pub vect_info: u32,
    pub vect_error: u32,
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub qual: [u64; 2],
    pub ctrl: [u32; 2],
    pub xcr0: u64,
    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub pdpte: [u64; 4],
    pub cr8: u64,
    pub efer: u64,
    pub pat: u64,
    pub star: u64,
    pub lstar: u64,
    pub fmask: u64,
    pub kernel_gs_base: u64,
    pub dr7: u64,
    pub sysenter_cs: u64,
    pub sysenter_rsp: u64,
    pub sysenter_rip: u64,
    pub es: UtcbSegment,
    pub cs: UtcbSegment,
    pub ss: UtcbSegment,
    pub ds: UtcbSegment,
    pub fs: UtcbSegment,
    pub gs: UtcbSegment,
    pub ld: UtcbSegment,
    pub tr: UtcbSegment,
    pub gd: UtcbSegment,
    pub id: UtcbSegment,
    pub tsc_val: u64,
    pub tsc_off: u64,
    pub tsc_aux: u32,
    pub exc_bitmap: u32,
    pub tpr_threshold: u32,
    _reserved: u32,
    pub eoi_bitmap: [u64; 4],
    pub vintr_status: u16,
    _reserved_array: [u16; 3],
    pub tsc_timeout: u64,
}

impl UtcbFrame {
    pub fn new() -> Self {
        // A zeroed frame is a valid empty frame.
        unsafe { core::mem::zeroed() }
    }
}

impl Default for UtcbFrame {
    fn default() -> Self {
        Self::new()
    }
}

/// The data area of the UTCB.
#[repr(C)]
pub union UtcbData {
    bytes: [u8; UTCB_DATA_CAPACITY],
    /// Untyped items grow from the beginning of the data area upwards.
    untyped: [u64; UNTYPED_ITEM_CAPACITY],
    /// Typed items grow from the end of the data area downwards.
    typed: [Xfer; TYPED_ITEM_CAPACITY],
    frame: UtcbFrame,
}

impl UtcbData {
    pub const fn new() -> Self {
        Self {
            bytes: [0; UTCB_DATA_CAPACITY],
        }
    }
}

impl Debug for UtcbData {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        let non_null = unsafe { self.bytes.iter().filter(|&&b| b != 0).count() };
        write!(f, "UtcbData({} non-null bytes)", non_null)
    }
}

/// One page: header plus data area.
#[repr(C, align(4096))]
pub struct Utcb {
    head: UtcbHead,
    data: UtcbData,
}

const_assert_eq!(size_of::<Utcb>(), PAGE_SIZE);
const_assert_eq!(size_of::<UtcbHead>(), 32);
const_assert_eq!(size_of::<UtcbSegment>(), 16);

impl Utcb {
    pub const fn new() -> Self {
        Self {
            head: UtcbHead::new(),
            data: UtcbData::new(),
        }
    }

    pub fn head(&self) -> &UtcbHead {
        &self.head
    }

    pub fn head_mut(&mut self) -> &mut UtcbHead {
        &mut self.head
    }

    /// Number of untyped items currently announced in the header.
    pub fn untyped_count(&self) -> usize {
        (self.head.items as u16) as usize
    }

    /// Number of typed items currently announced in the header.
    pub fn typed_count(&self) -> usize {
        ((self.head.items >> 16) as u16) as usize
    }

    /// Announce item counts. Counts beyond the capacity are clamped; a
    /// sender cannot make the kernel read past the page.
    pub fn set_counts(&mut self, untyped: usize, typed: usize) {
        let u = untyped.min(UNTYPED_ITEM_CAPACITY) as u64;
        let t = typed.min(TYPED_ITEM_CAPACITY) as u64;
        self.head.items = (t << 16) | u;
    }

    /// The receive window for capability translation.
    pub fn xlt_crd(&self) -> Crd {
        Crd::from_raw(self.head.xlt)
    }

    /// The receive window for capability delegation.
    pub fn dlt_crd(&self) -> Crd {
        Crd::from_raw(self.head.dlt)
    }

    pub fn untyped_items(&self) -> &[u64] {
        let cnt = self.untyped_count();
        unsafe { &self.data.untyped[..cnt] }
    }

    pub fn set_untyped_items(&mut self, items: &[u64]) {
        let cnt = items.len().min(UNTYPED_ITEM_CAPACITY);
        unsafe { self.data.untyped[..cnt].copy_from_slice(&items[..cnt]) };
        self.set_counts(cnt, self.typed_count());
    }

    /// The announced typed items. Item `0` sits at the very top of the
    /// page, item `1` below it, and so on.
    pub fn typed_item(&self, idx: usize) -> Xfer {
        assert!(idx < self.typed_count());
        unsafe { self.data.typed[TYPED_ITEM_CAPACITY - 1 - idx] }
    }

    pub fn set_typed_item(&mut self, idx: usize, item: Xfer) {
        assert!(idx < TYPED_ITEM_CAPACITY);
        unsafe { self.data.typed[TYPED_ITEM_CAPACITY - 1 - idx] = item };
    }

    pub fn frame(&self) -> &UtcbFrame {
        unsafe { &self.data.frame }
    }

    pub fn frame_mut(&mut self) -> &mut UtcbFrame {
        unsafe { &mut self.data.frame }
    }

    /// Copies header and announced payload into another UTCB. Typed items
    /// are not copied; they are consumed by the delegation engine.
    pub fn copy_payload_to(&self, dst: &mut Self) {
        dst.head.items = self.head.items;
        dst.head.xlt = self.head.xlt;
        dst.head.dlt = self.head.dlt;
        let cnt = self.untyped_count();
        unsafe {
            dst.data.untyped[..cnt].copy_from_slice(&self.data.untyped[..cnt]);
        }
    }
}

impl Default for Utcb {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for Utcb {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Utcb")
            .field("head", &self.head)
            .field("untyped items", &self.untyped_count())
            .field("typed items", &self.typed_count())
            .finish()
    }
}
