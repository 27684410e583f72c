//! Protection domains and the delegation engine.
//!
//! A PD owns an object space, a memory space and a port-I/O space. All
//! user-visible mapping operations are transformations on capability range
//! descriptors: translate walks the delegation tree upwards, delegate
//! creates clamped child nodes, revoke demotes and detaches whole
//! subtrees.

use crate::capability::Capability;
use crate::cpulocal::{
    Cpu,
    PerCpu,
};
use crate::config::NUM_CPUS;
use crate::kalloc::{
    NoMemory,
    PageAlloc,
};
use crate::kobject::{
    Kobject,
    Object,
    ObjType,
    Refcounted,
};
use crate::mdb::Mdb;
use crate::pagetable::TlbCleanup;
use crate::rcu::{
    Rcu,
    RcuElem,
};
use crate::refcount::Refcount;
use crate::space::{
    Space,
    SpaceMem,
    SpaceObj,
    SpacePio,
    Subspace,
};
use alloc::boxed::Box;
use core::ptr;
use core::sync::atomic::{
    AtomicBool,
    AtomicPtr,
    AtomicU64,
    Ordering,
};
use libmuon::crd::{
    Crd,
    CrdKind,
    Xfer,
    XferKind,
};
use log::{
    trace,
    warn,
};
use spin::Once;

/// Selects one of the three subspaces of a PD.
pub trait PdSubspace: Subspace {
    fn of_pd(pd: &Pd) -> &Self;
}

impl PdSubspace for SpaceMem {
    fn of_pd(pd: &Pd) -> &SpaceMem {
        &pd.mem
    }
}

impl PdSubspace for SpacePio {
    fn of_pd(pd: &Pd) -> &SpacePio {
        &pd.pio
    }
}

impl PdSubspace for SpaceObj {
    fn of_pd(pd: &Pd) -> &SpaceObj {
        &pd.obj
    }
}

/// A protection domain.
#[repr(C)]
pub struct Pd {
    kobj: Kobject,
    refcount: Refcount,

    mem: SpaceMem,
    pio: SpacePio,
    obj: SpaceObj,

    /// Whether this PD may use passthrough features (MSR access,
    /// machine_ctrl).
    pub is_passthrough: bool,

    /// Lazily allocated APIC access page shared by all vCPUs of this PD.
    apic_access_page: AtomicU64,
}

unsafe impl Send for Pd {}
unsafe impl Sync for Pd {}

impl Object for Pd {
    const TYPE: ObjType = ObjType::Pd;

    fn kobj(&self) -> &Kobject {
        &self.kobj
    }
}

impl Refcounted for Pd {
    fn refcount(&self) -> &Refcount {
        &self.refcount
    }
}

impl Pd {
    /// Default permission mask of a fresh PD capability.
    pub const PERM_ALL: u64 = 0x1f;
    /// Object-creation permission bit.
    pub const PERM_OBJ_CREATION: u64 = 1 << 0;

    unsafe fn free(elem: *mut RcuElem) {
        let pd = elem as *mut Pd;
        if (*pd).refcount.del_ref() {
            debug_assert!(
                Pd::remote_current(Cpu::id()).map_or(true, |cur| !ptr::eq(pd, cur)),
                "freeing the current PD"
            );
            drop(Box::from_raw(pd));
        }
    }

    /// Revokes everything the PD still holds before its memory can be
    /// reused, so residual user mappings become unreachable.
    unsafe fn pre_free(elem: *mut RcuElem) {
        let pd = &*(elem as *mut Pd);

        for kind in [CrdKind::Mem, CrdKind::Pio, CrdKind::Obj] {
            let _ = pd.rev_crd(Crd::whole(kind), true);
        }
    }

    /// Creates a PD whose root capability lives at `sel` in the creator's
    /// object space.
    pub fn create(own: &Pd, sel: u64, attr: u64, passthrough: bool) -> Result<Box<Pd>, NoMemory> {
        let mut pd = Box::new(Pd {
            kobj: Kobject::new(
                ObjType::Pd,
                &own.obj as *const SpaceObj as *mut u8,
                sel,
                attr,
                Self::free,
                Some(Self::pre_free),
            ),
            refcount: Refcount::new(),
            mem: SpaceMem::new()?,
            pio: SpacePio::kernel(),
            obj: SpaceObj::new(),
            is_passthrough: passthrough,
            apic_access_page: AtomicU64::new(0),
        });

        pd.pio = SpacePio::new(&pd.mem)?;
        pd.kobj.finish_init();
        pd.obj.set_mem(&pd.mem);

        Ok(pd)
    }

    /// Creates the kernel PD: it owns all physical memory and all I/O
    /// ports as delegation roots, but no hardware space state.
    pub fn create_kernel() -> Result<Box<Pd>, NoMemory> {
        let mut pd = Box::new(Pd {
            kobj: Kobject::new(
                ObjType::Pd,
                ptr::null_mut(),
                0,
                Self::PERM_ALL,
                Self::free,
                None,
            ),
            refcount: Refcount::new(),
            mem: SpaceMem::new()?,
            pio: SpacePio::kernel(),
            obj: SpaceObj::new(),
            is_passthrough: true,
            apic_access_page: AtomicU64::new(0),
        });

        pd.kobj.finish_init();
        pd.obj.set_mem(&pd.mem);
        // The kernel PD's own root capability node lives in its own
        // object space.
        pd.kobj.mdb.set_space(&pd.obj as *const SpaceObj as *mut u8);

        pd.mem.generic().mark_kernel();
        pd.pio.generic().mark_kernel();
        pd.obj.generic().mark_kernel();

        // All physical pages and all I/O ports are delegatable from here.
        let mem_ptr = &pd.mem as *const SpaceMem as *mut u8;
        pd.mem.generic().addreg(mem_ptr, 0, 1 << 40, 0x7, 0);

        let pio_ptr = &pd.pio as *const SpacePio as *mut u8;
        pd.pio.generic().addreg(pio_ptr, 0, 1 << 16, 0x7, 0);

        Ok(pd)
    }

    pub fn mem(&self) -> &SpaceMem {
        &self.mem
    }

    pub fn pio(&self) -> &SpacePio {
        &self.pio
    }

    pub fn obj(&self) -> &SpaceObj {
        &self.obj
    }

    /// The PD's APIC access page, allocated on first use.
    pub fn apic_access_page(&self) -> Result<u64, NoMemory> {
        let cur = self.apic_access_page.load(Ordering::SeqCst);
        if cur != 0 {
            return Ok(cur);
        }

        let fresh = crate::kalloc::BuddyAlloc.alloc_zeroed_page()?;
        match self
            .apic_access_page
            .compare_exchange(0, fresh, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => Ok(fresh),
            Err(existing) => {
                crate::kalloc::BuddyAlloc.free_page(fresh);
                Ok(existing)
            }
        }
    }

    /// The generic space of the given CRD kind, or `None` for null CRDs.
    pub fn subspace(&self, kind: CrdKind) -> Option<&Space> {
        match kind {
            CrdKind::Null => None,
            CrdKind::Mem => Some(self.mem.generic()),
            CrdKind::Pio => Some(self.pio.generic()),
            CrdKind::Obj => Some(self.obj.generic()),
        }
    }

    // -- the current PD of each CPU --------------------------------------

    pub fn current() -> &'static Pd {
        Pd::remote_current(Cpu::id()).expect("no current PD on this CPU")
    }

    pub fn remote_current(cpu: usize) -> Option<&'static Pd> {
        let pd = CURRENT_PD.remote(cpu).load(Ordering::SeqCst);
        unsafe { pd.as_ref() }
    }

    /// Installs this PD's address space on the current CPU.
    pub fn make_current(&'static self) {
        let cpu = Cpu::id();
        let mut pcid = self.mem.did as u64;

        if self.mem.htlb.chk(cpu) {
            self.mem.htlb.clr(cpu);
        } else {
            if let Some(cur) = Pd::remote_current(cpu) {
                if ptr::eq(cur, self) {
                    return;
                }
            }
            // No stale entries: keep the TLB content of our PCID.
            pcid |= 1 << 63;
        }

        let prev = CURRENT_PD
            .remote(cpu)
            .swap(self as *const Pd as *mut Pd, Ordering::SeqCst);
        if let Some(prev) = unsafe { prev.as_ref() } {
            if prev.refcount.del_rcu() {
                Rcu::call(prev.kobj.rcu_elem());
            }
        }

        let ok = self.refcount.add_ref();
        debug_assert!(ok);

        self.mem
            .hpt()
            .make_current(if PCID_ENABLED.load(Ordering::SeqCst) { pcid } else { 0 });
    }

    // -- clamping --------------------------------------------------------

    /// Intersection clamp: both regions must overlap when viewed at the
    /// larger order. Returns the combined base and the smaller order.
    fn clamp(snd_base: u64, rcv_base: u64, snd_ord: u32, rcv_ord: u32) -> Option<(u64, u32)> {
        if (snd_base ^ rcv_base) >> snd_ord.max(rcv_ord) != 0 {
            return None;
        }

        Some((rcv_base | snd_base, snd_ord.min(rcv_ord)))
    }

    /// Hot-spot clamp: aligns both bases to their orders; the bits of the
    /// larger region's base not determined by the smaller order are taken
    /// from the hot spot. Returns (snd_base, rcv_base, order).
    fn clamp_hotspot(
        snd_base: u64,
        rcv_base: u64,
        snd_ord: u32,
        rcv_ord: u32,
        hot: u64,
    ) -> (u64, u64, u32) {
        let snd_mask = (1u64 << snd_ord) - 1;
        let rcv_mask = (1u64 << rcv_ord) - 1;

        let snd_base = snd_base & !snd_mask;
        let rcv_base = rcv_base & !rcv_mask;

        if snd_mask < rcv_mask {
            (snd_base, rcv_base | (hot & rcv_mask & !snd_mask), snd_ord)
        } else {
            (snd_base | (hot & snd_mask & !rcv_mask), rcv_base, rcv_ord)
        }
    }

    // -- delegation ------------------------------------------------------

    /// Delegates `[snd_base, snd_base + 2^ord)` from `snd`'s subspace into
    /// ours at `rcv_base`: one clamped child node per covering sender
    /// node. Returns the accumulated cleanup obligations.
    pub fn delegate<S: PdSubspace>(
        &self,
        snd: &Pd,
        snd_base: u64,
        rcv_base: u64,
        ord: u32,
        attr: u64,
        sub: u64,
    ) -> Result<TlbCleanup, NoMemory> {
        let mut cleanup = TlbCleanup::new();
        let rcv_space = S::of_pd(self);

        let mut addr = snd_base;
        loop {
            let mdb = S::of_pd(snd).generic().tree_lookup(addr, true);
            let mdb = match unsafe { mdb.as_ref() } {
                Some(mdb) => mdb,
                None => break,
            };

            let (b, o) = match Self::clamp(mdb.node_base, snd_base, mdb.node_order, ord) {
                Some(clamped) => clamped,
                None => break,
            };
            addr = mdb.node_end();

            let node = Box::leak(Box::new(Mdb::new(
                rcv_space as *const S as *mut u8,
                b - mdb.node_base + mdb.node_phys,
                b - snd_base + rcv_base,
                o,
                0,
                mdb.node_type,
                sub,
            )));
            node.init_list();

            if !Space::tree_insert(node) {
                let node = unsafe { Box::from_raw(node as *mut Mdb) };

                // Probably an overmap attempt; retrying the same mapping
                // is tolerated, everything else is a userland bug.
                let existing = rcv_space.generic().tree_lookup(node.node_base, false);
                let benign = unsafe { existing.as_ref() }.map_or(false, |x| {
                    ptr::eq(x.parent(), mdb) && x.attr() == attr & mdb.attr()
                });
                if !benign {
                    warn!(
                        "overmap attempt: PD:{:p}->{:p} SB:{:#x} RB:{:#x} O:{}",
                        snd, self, snd_base, rcv_base, ord
                    );
                }
                continue;
            }

            if !node.insert_node(mdb, attr) {
                Space::tree_remove(node);
                drop(unsafe { Box::from_raw(node as *mut Mdb) });
                warn!(
                    "dead delegation source: PD:{:p}->{:p} SB:{:#x} O:{}",
                    snd, self, snd_base, ord
                );
                continue;
            }

            let mut sub_cleanup = rcv_space.update(node, 0)?;
            cleanup.merge(&mut sub_cleanup);
        }

        Ok(cleanup)
    }

    /// Revokes attribute bits in `[base, base + 2^ord)` of our subspace:
    /// post-order demotion of every matching subtree, then bottom-up
    /// detach of emptied nodes.
    pub fn revoke<S: PdSubspace>(
        &self,
        base: u64,
        ord: u32,
        attr: u64,
        include_self: bool,
    ) -> Result<TlbCleanup, NoMemory> {
        let mut cleanup = TlbCleanup::new();

        let mut addr = base;
        loop {
            let mdb = S::of_pd(self).generic().tree_lookup(addr, true);
            let mdb = match unsafe { mdb.as_ref() } {
                Some(mdb) => mdb,
                None => break,
            };

            let (b, o) = match Self::clamp(mdb.node_base, base, mdb.node_order, ord) {
                Some(clamped) => clamped,
                None => break,
            };
            addr = mdb.node_end();

            let d = mdb.depth();
            let skip_root = u32::from(!include_self);

            // Demote pass: walk the contiguous subtree run in list order,
            // deciding at each (sub)root whether its physical range is
            // covered by the revocation window.
            let mut node = mdb;
            let mut demote = false;
            loop {
                if node.depth() == d + skip_root {
                    let p = b - mdb.node_base + mdb.node_phys;
                    demote = Self::clamp(node.node_phys, p, node.node_order, o).is_some();
                }

                if demote && node.attr() & attr != 0 {
                    let space = unsafe { S::of_node(node) };
                    let mut sub = space.update(node, attr)?;
                    cleanup.merge(&mut sub);
                    node.demote_node(attr);
                }

                let next = node.next_node();
                if unsafe { (*next).depth() } <= d {
                    break;
                }
                node = unsafe { &*next };
            }

            // Detach pass: bottom-up, so a concurrent reader always sees
            // children disappear before their parents. Preemption stays
            // off only around the individual unlink.
            loop {
                let preempt = Cpu::preemption();
                if preempt {
                    Cpu::preempt_disable();
                }

                if node.remove_node() && Space::tree_remove(node) {
                    Rcu::call(&node.rcu as *const _ as *mut _);
                }

                if preempt {
                    Cpu::preempt_enable();
                }

                let prev = node.prev_node();
                if node.depth() <= d {
                    break;
                }
                node = unsafe { &*prev };
            }

            debug_assert!(ptr::eq(node, mdb));
        }

        Ok(cleanup)
    }

    /// Translate: finds the image of `crd` (a region in `snd`'s space)
    /// inside our space by walking the delegation tree towards the root.
    /// Falls back to the identity translation when sender and receiver
    /// are the same space.
    pub fn xlt_crd(&self, snd: &Pd, xlt: Crd, crd: Crd) -> Crd {
        let kind = xlt.kind();

        if kind == CrdKind::Null || kind != crd.kind() {
            return Crd::NULL;
        }

        let snd_space = snd.subspace(kind).unwrap() as *const Space;
        let rcv_space = self.subspace(kind).unwrap() as *const Space;

        let sb = crd.base();
        let so = crd.order() as u32;
        let mut rb = xlt.base();
        let mut ro = xlt.order() as u32;

        let mdb = unsafe { (*snd_space).tree_lookup(sb, false).as_ref() };
        let mdb = match mdb {
            Some(mdb) => mdb,
            None => return Crd::NULL,
        };

        // Ascend from the sender's node towards the delegation root,
        // looking for an ancestor in the receiver's space.
        let mut node: Option<&Mdb> = None;
        let mut cur = mdb.parent();
        while let Some(candidate) = unsafe { cur.as_ref() } {
            if candidate.space() as *const u8 == rcv_space as *const u8 {
                if let Some((nb, no)) =
                    Self::clamp(candidate.node_base, rb, candidate.node_order, ro)
                {
                    rb = nb;
                    ro = no;
                    node = Some(candidate);
                    break;
                }
            }
            cur = candidate.parent();
        }

        // Same-space fallback: translating inside one PD yields the
        // region itself.
        if node.is_none()
            && mdb.space() as *const u8 == rcv_space as *const u8
            && ptr::eq(snd_space, rcv_space)
        {
            if let Some((nb, no)) = Self::clamp(mdb.node_base, xlt.base(), mdb.node_order, xlt.order() as u32)
            {
                rb = nb;
                ro = no;
                node = Some(mdb);
            }
        }

        let node = match node {
            Some(node) => node,
            None => return Crd::NULL,
        };

        let (sb, so) = match Self::clamp(mdb.node_base, sb, mdb.node_order, so) {
            Some(clamped) => clamped,
            None => return Crd::NULL,
        };

        let translated = sb - mdb.node_base + mdb.node_phys - node.node_phys + node.node_base;

        match Self::clamp(translated, rb, so, ro) {
            Some((rb, ro)) => {
                trace!("XLT {:?} SB:{:#x} -> RB:{:#x} O:{}", kind, crd.base(), rb, ro);
                Crd::new(kind, rb, ro as u8, mdb.attr() as u8)
            }
            None => Crd::NULL,
        }
    }

    /// Delegate: transfers `crd` from `snd` into the receive window
    /// `del`, returning the CRD actually mapped.
    pub fn del_crd(
        &self,
        snd: &Pd,
        del: Crd,
        crd: Crd,
        sub: u64,
        hot: u64,
    ) -> Result<Crd, NoMemory> {
        let kind = crd.kind();
        let attr = (crd.attr() & del.attr()) as u64;

        if kind != del.kind() || attr == 0 {
            return Ok(Crd::NULL);
        }

        let sb = crd.base();
        let so = crd.order() as u32;
        let rb = del.base();
        let ro = del.order() as u32;

        let mut cleanup;
        let (rb, o) = match kind {
            CrdKind::Mem => {
                let (sb, rb, o) = Self::clamp_hotspot(sb, rb, so, ro, hot);
                trace!("DEL MEM {:p}->{:p} SB:{:#x} RB:{:#x} O:{}", snd, self, sb, rb, o);
                cleanup = self.delegate::<SpaceMem>(snd, sb, rb, o, attr, sub)?;
                (rb, o)
            }
            CrdKind::Pio => {
                let (rb, o) = match Self::clamp(sb, rb, so, ro) {
                    Some(clamped) => clamped,
                    None => return Ok(Crd::NULL),
                };
                trace!("DEL I/O {:p}->{:p} B:{:#x} O:{}", snd, self, rb, o);
                cleanup = self.delegate::<SpacePio>(snd, rb, rb, o, attr, sub)?;
                (rb, o)
            }
            CrdKind::Obj => {
                let (sb, rb, o) = Self::clamp_hotspot(sb, rb, so, ro, hot);
                trace!("DEL OBJ {:p}->{:p} SB:{:#x} RB:{:#x} O:{}", snd, self, sb, rb, o);
                cleanup = self.delegate::<SpaceObj>(snd, sb, rb, o, attr, 0)?;
                (rb, o)
            }
            CrdKind::Null => return Ok(Crd::NULL),
        };

        if cleanup.need_tlb_flush() {
            // Replaced read-only pages (object space) or changed mappings:
            // every CPU this PD runs on must drop stale entries.
            self.mem.htlb.merge(&self.mem.cpus);
            SpaceMem::shootdown();
        }

        cleanup.release(&crate::kalloc::BuddyAlloc);

        Ok(Crd::new(kind, rb, o as u8, attr as u8))
    }

    /// Revoke: drops `crd.attr()` from the region, including the covering
    /// nodes themselves when `include_self`.
    pub fn rev_crd(&self, crd: Crd, include_self: bool) -> Result<(), NoMemory> {
        let base = crd.base();
        let ord = crd.order() as u32;
        let attr = crd.attr() as u64;

        let mut cleanup = match crd.kind() {
            CrdKind::Null => return Ok(()),
            CrdKind::Mem => {
                trace!("REV MEM {:p} B:{:#x} O:{}", self, base, ord);
                self.revoke::<SpaceMem>(base, ord, attr, include_self)?
            }
            CrdKind::Pio => {
                trace!("REV I/O {:p} B:{:#x} O:{}", self, base, ord);
                self.revoke::<SpacePio>(base, ord, attr, include_self)?
            }
            CrdKind::Obj => {
                trace!("REV OBJ {:p} B:{:#x} O:{}", self, base, ord);
                self.revoke::<SpaceObj>(base, ord, attr, include_self)?
            }
        };

        if crd.kind() == CrdKind::Mem {
            SpaceMem::shootdown();
        }

        cleanup.ignore_tlb_flush();
        cleanup.release(&crate::kalloc::BuddyAlloc);

        Ok(())
    }

    /// Dispatches one typed item.
    pub fn xfer_item(&self, src: &Pd, xlt: Crd, del: Crd, item: Xfer) -> Xfer {
        let mut set_as_del = 0;

        let crd = match item.kind() {
            XferKind::Translate => self.xlt_crd(src, xlt, item.crd()),
            XferKind::TransDelegate => {
                let translated = self.xlt_crd(src, xlt, item.crd());
                if !translated.is_null() {
                    translated
                } else {
                    set_as_del = 1;
                    self.delegate_item(src, del, item)
                }
            }
            XferKind::Delegate => self.delegate_item(src, del, item),
            XferKind::Invalid => Crd::NULL,
        };

        Xfer::new(crd, item.flags() | set_as_del)
    }

    fn delegate_item(&self, src: &Pd, del: Crd, item: Xfer) -> Crd {
        // Items flagged "from kernel" use the kernel PD as source; only
        // the roottask may do that.
        let src = if ptr::eq(src, Pd::root()) && item.from_kernel() {
            Pd::kern()
        } else {
            src
        };

        self.del_crd(src, del, item.crd(), item.subspaces(), item.hotspot())
            .unwrap_or(Crd::NULL)
    }

    /// Dispatches a batch of typed items, writing each result through
    /// `out`.
    pub fn xfer_items(
        &self,
        src: &Pd,
        xlt: Crd,
        del: Crd,
        items: impl Iterator<Item = Xfer>,
        mut out: impl FnMut(usize, Xfer),
    ) {
        for (idx, item) in items.enumerate() {
            let res = self.xfer_item(src, xlt, del, item);
            out(idx, res);
        }
    }
}

static CURRENT_PD: PerCpu<AtomicPtr<Pd>> = {
    const NULL: AtomicPtr<Pd> = AtomicPtr::new(ptr::null_mut());
    PerCpu::new([NULL; NUM_CPUS])
};

static PCID_ENABLED: AtomicBool = AtomicBool::new(false);

static KERN: Once<&'static Pd> = Once::new();
static ROOT: Once<&'static Pd> = Once::new();

impl Pd {
    /// Sets up the kernel PD and the roottask PD. Called once during
    /// bring-up.
    pub fn setup(pcid: bool) -> Result<(), NoMemory> {
        if KERN.get().is_some() {
            return Ok(());
        }

        PCID_ENABLED.store(pcid, Ordering::SeqCst);

        let kern = Box::leak(Pd::create_kernel()?);
        KERN.call_once(|| kern);

        let root = Box::leak(Pd::create(
            kern,
            libmuon::consts::ROOT_PD_SEL,
            Self::PERM_ALL,
            true,
        )?);
        // The roottask's own capability lives in its own object space.
        root.kobj.mdb.set_space(&root.obj as *const SpaceObj as *mut u8);
        ROOT.call_once(|| root);

        Ok(())
    }

    pub fn kern() -> &'static Pd {
        KERN.get().expect("kernel PD not set up")
    }

    pub fn root() -> &'static Pd {
        ROOT.get().expect("root PD not set up")
    }
}
