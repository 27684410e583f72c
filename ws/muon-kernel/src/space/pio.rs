//! The port-I/O space: host and guest permission bitmaps of one PD.
//!
//! The host bitmap is mapped read-only into the per-CPU IOPB window of
//! the PD's host page table, so the CPU enforces it directly from the
//! TSS. A set bit denies access; freshly created PDs deny everything.

use super::{
    Space,
    SpaceMem,
    Subspace,
};
use crate::config::IOP_SPACE_BASE;
use crate::kalloc::{
    phys_to_ptr,
    BuddyAlloc,
    NoMemory,
    PageAlloc,
};
use crate::mdb::Mdb;
use crate::pagetable::hpt::Hpt;
use crate::pagetable::TlbCleanup;
use core::sync::atomic::{
    AtomicU64,
    Ordering,
};
use libmuon::mem::{
    PAGE_BITS,
    PAGE_SIZE,
};

/// 65536 ports, one bit each: two pages per bitmap.
const BITMAP_PAGES: usize = 2;

/// The port-I/O space of one PD.
#[repr(C)]
#[derive(Debug)]
pub struct SpacePio {
    space: Space,
    /// Host bitmap page frames.
    hbmp: [u64; BITMAP_PAGES],
    /// Guest bitmap page frames.
    gbmp: [u64; BITMAP_PAGES],
}

impl SpacePio {
    /// Creates the bitmaps (all ports denied) and maps the host bitmap
    /// read-only into the IOPB window of `mem`.
    pub fn new(mem: &SpaceMem) -> Result<Self, NoMemory> {
        let mut pages = [[0u64; BITMAP_PAGES]; 2];

        for bmp in pages.iter_mut() {
            for page in bmp.iter_mut() {
                *page = BuddyAlloc.alloc_zeroed_page()?;
                // A set bit denies; start with everything denied.
                unsafe { core::ptr::write_bytes(phys_to_ptr(*page), 0xff, PAGE_SIZE) };
            }
        }

        for (i, page) in pages[0].iter().enumerate() {
            mem.insert(
                IOP_SPACE_BASE + (i * PAGE_SIZE) as u64,
                0,
                Hpt::PTE_NX | Hpt::PTE_A | Hpt::PTE_P,
                *page,
            )?
            .ignore_tlb_flush();
        }

        Ok(Self {
            space: Space::new(),
            hbmp: pages[0],
            gbmp: pages[1],
        })
    }

    /// A kernel-PD port space without hardware bitmaps.
    pub const fn kernel() -> Self {
        Self {
            space: Space::new(),
            hbmp: [0; BITMAP_PAGES],
            gbmp: [0; BITMAP_PAGES],
        }
    }

    fn word(&self, host: bool, port: u64) -> &AtomicU64 {
        let bmp = if host { &self.hbmp } else { &self.gbmp };
        let bit = port as usize;
        let page = bmp[(bit / 8) / PAGE_SIZE];
        let offset = ((bit / 64) * 8) % PAGE_SIZE;

        unsafe { &*(phys_to_ptr(page + offset as u64) as *const AtomicU64) }
    }

    fn set_port(&self, host: bool, port: u64, grant: bool) {
        let mask = 1u64 << (port % 64);
        if grant {
            self.word(host, port).fetch_and(!mask, Ordering::SeqCst);
        } else {
            self.word(host, port).fetch_or(mask, Ordering::SeqCst);
        }
    }

    /// Whether the host bitmap currently permits the port.
    pub fn allows(&self, host: bool, port: u64) -> bool {
        self.word(host, port).load(Ordering::SeqCst) & (1 << (port % 64)) == 0
    }

    /// Physical address of the host bitmap, for the TSS IOPB and the
    /// VMCS I/O bitmap fields.
    pub fn bitmap_phys(&self, host: bool) -> u64 {
        if host {
            self.hbmp[0]
        } else {
            self.gbmp[0]
        }
    }
}

impl Subspace for SpacePio {
    fn generic(&self) -> &Space {
        &self.space
    }

    fn update(&self, node: &Mdb, rmask: u64) -> Result<TlbCleanup, NoMemory> {
        debug_assert!(!self.space.is_kernel());

        let _guard = node.node_lock.lock();
        let attr = node.attr() & !rmask;

        for port in node.node_base..node.node_end() {
            self.set_port(true, port, attr != 0);

            if node.node_sub & super::mem::SUBSPACE_GUEST != 0 {
                self.set_port(false, port, attr != 0);
            }
        }

        Ok(TlbCleanup::new())
    }

    unsafe fn of_node(node: &Mdb) -> &Self {
        &*(node.space() as *const SpacePio)
    }
}

// The PAGE_BITS import keeps the port-to-page arithmetic honest.
const _: () = assert!(1usize << PAGE_BITS == PAGE_SIZE);
