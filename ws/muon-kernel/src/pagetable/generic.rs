//! The generic page-table modification algorithm.
//!
//! Features:
//!
//! - compile-time configurable entry attributes and memory access
//! - run-time configurable page-table levels (useful for IOMMUs)
//! - atomic updates on page granularity
//!
//! The modification is concurrency-safe if the memory policy is atomic and
//! sequentially consistent: concurrent updates to overlapping regions may
//! interleave arbitrarily, but every observer sees complete entries, i.e.
//! either the pre- or the post-image of each entry. Pages that may still be
//! referenced by other cores until the next TLB flush are collected by the
//! cleanup object and must be handled by the initiator of the modification.

use super::{
    DeferredCleanup,
    Mapping,
    MemoryPolicy,
    PtAttr,
    PtePtr,
};
use crate::kalloc::{
    NoMemory,
    PageAlloc,
};
use core::marker::PhantomData;
use libmuon::mem::PAGE_BITS;

/// A multi-level page table. `BITS` is the number of virtual address bits
/// translated per level (9 on x86_64).
pub struct GenericPageTable<const BITS: u32, M, A, T, C>
where
    M: MemoryPolicy,
    A: PageAlloc,
    T: PtAttr,
    C: DeferredCleanup,
{
    memory: M,
    alloc: A,

    /// Valid levels are `0..max_levels`.
    max_levels: u32,

    /// Levels `0..leaf_levels` may terminate a translation. With 1 GiB
    /// pages on x86_64 this is 3.
    leaf_levels: u32,

    /// Physical address of the root table, or `None` when moved out.
    root: Option<u64>,

    _attr: PhantomData<fn() -> T>,
    _cleanup: PhantomData<fn() -> C>,
}

impl<const BITS: u32, M, A, T, C> GenericPageTable<BITS, M, A, T, C>
where
    M: MemoryPolicy,
    A: PageAlloc,
    T: PtAttr,
    C: DeferredCleanup,
{
    /// Creates a page table around a pre-existing root table.
    pub fn with_root(max_levels: u32, leaf_levels: u32, root: u64, memory: M, alloc: A) -> Self {
        assert!(leaf_levels > 0 && leaf_levels <= max_levels);
        assert!(max_levels > 0 && 64 >= max_levels * BITS + PAGE_BITS);

        Self {
            memory,
            alloc,
            max_levels,
            leaf_levels,
            root: Some(root),
            _attr: PhantomData,
            _cleanup: PhantomData,
        }
    }

    /// Creates an empty page table, allocating the root table.
    pub fn new(max_levels: u32, leaf_levels: u32, memory: M, alloc: A) -> Result<Self, NoMemory> {
        let root = alloc.alloc_zeroed_page()?;
        Ok(Self::with_root(max_levels, leaf_levels, root, memory, alloc))
    }

    /// The memory policy, as a unit-testing aid.
    pub fn memory(&self) -> &M {
        &self.memory
    }

    /// The page allocator, as a unit-testing aid.
    pub fn page_alloc(&self) -> &A {
        &self.alloc
    }

    pub fn max_levels(&self) -> u32 {
        self.max_levels
    }

    pub fn leaf_levels(&self) -> u32 {
        self.leaf_levels
    }

    /// The physical address of the root table. This is what ends up in
    /// CR3 / the EPT pointer / the IOMMU context entry.
    pub fn root(&self) -> u64 {
        self.root.expect("page table was moved out")
    }

    /// The maximum possible mapping order.
    fn max_order(&self) -> u32 {
        self.max_levels * BITS + PAGE_BITS
    }

    /// The mapping order of an entry at the given level.
    fn level_order(level: u32) -> u32 {
        level * BITS + PAGE_BITS
    }

    fn virt_to_index(level: u32, vaddr: u64) -> usize {
        ((vaddr >> Self::level_order(level)) & ((1u64 << BITS) - 1)) as usize
    }

    fn is_superpage(&self, level: u32, entry: u64) -> bool {
        debug_assert!(
            !((level == 0 || level >= self.leaf_levels) && entry & T::PTE_S != 0),
            "superpage bit at an illegal level"
        );
        entry & T::PTE_P != 0 && level < self.leaf_levels && entry & T::PTE_S != 0
    }

    fn is_leaf(&self, level: u32, entry: u64) -> bool {
        level == 0 || entry & T::PTE_P == 0 || self.is_superpage(level, entry)
    }

    fn lookup_at(&self, vaddr: u64, table: PtePtr, level: u32) -> Mapping<T> {
        let entry = self.memory.read(table.index(Self::virt_to_index(level, vaddr)));
        let phys = entry & !T::MASK;

        if self.is_leaf(level, entry) {
            let order = Self::level_order(level);
            let mask = (1u64 << order) - 1;

            return Mapping::new(vaddr & !mask, phys & !mask, entry & T::MASK, order);
        }

        self.lookup_at(vaddr, PtePtr(phys), level - 1)
    }

    /// Returns the mapping at the given virtual address: the largest
    /// natural region covering it together with its current attributes.
    /// Never allocates. A non-present region has zero attributes.
    #[must_use]
    pub fn lookup(&self, vaddr: u64) -> Mapping<T> {
        let result = self.lookup_at(vaddr, PtePtr(self.root()), self.max_levels - 1);

        // The end of the final translation may wrap to zero.
        debug_assert!(
            result.vaddr <= vaddr
                && (result.vaddr.wrapping_add(result.size()) == 0
                    || result.vaddr + result.size() > vaddr)
        );
        result
    }

    /// Byte-granular translation of `vaddr`, or `None` if not mapped.
    pub fn lookup_phys(&self, vaddr: u64) -> Option<u64> {
        let mapping = self.lookup(vaddr);
        mapping
            .present()
            .then(|| mapping.paddr + (vaddr - mapping.vaddr))
    }

    /// Fills a fresh table one level below `level` with the translations
    /// of the given superpage entry.
    fn fill_from_superpage(&self, new_table: PtePtr, superpage: u64, level: u32) {
        debug_assert!(self.is_superpage(level, superpage));

        // The superpage bit survives only if the new entries are still
        // above the 4K level.
        let attr_mask = if level == 1 { T::PTE_S } else { 0 };

        for i in 0..1usize << BITS {
            let offset = (i as u64) << (PAGE_BITS + (level - 1) * BITS);
            self.memory.write(new_table.index(i), (superpage & !attr_mask) | offset);
        }
    }

    fn walk_down_at(
        &self,
        cleanup: &mut C,
        vaddr: u64,
        to_level: u32,
        table: PtePtr,
        level: u32,
        create: bool,
    ) -> Result<Option<PtePtr>, NoMemory> {
        debug_assert!(level < self.max_levels);
        debug_assert!(to_level <= level);

        if to_level == level {
            return Ok(Some(table));
        }

        loop {
            let entry_p = table.index(Self::virt_to_index(level, vaddr));
            let mut entry = self.memory.read(entry_p);
            let mut phys = entry & !T::MASK;

            debug_assert!(level != 0);

            // No mapping and nothing to create: the caller only wanted to
            // downgrade rights, so we can stop here.
            if entry & T::PTE_P == 0 && !create {
                return Ok(None);
            }

            // We hit a leaf entry but need to recurse further: create the
            // next page-table level.
            if entry & T::PTE_P == 0 || self.is_superpage(level, entry) {
                let new_phys = self.alloc.alloc_zeroed_page()?;
                let new_entry = new_phys | (T::ALL_RIGHTS & !T::PTE_S);

                // Initialize the new table with the content of the former
                // superpage.
                if self.is_superpage(level, entry) {
                    self.fill_from_superpage(PtePtr(new_phys), entry, level);
                    cleanup.flush_tlb_later();
                }

                // If we lose the race to install the new table, we can
                // reclaim it immediately: no other CPU holds a reference.
                if !self.memory.cmp_swap(entry_p, entry, new_entry) {
                    self.alloc.free_page(new_phys);
                    continue;
                }

                entry = new_entry;
                phys = new_phys;
            }

            debug_assert!(!self.is_leaf(level, entry));
            return self.walk_down_at(cleanup, vaddr, to_level, PtePtr(phys), level - 1, create);
        }
    }

    /// Walks down to `to_level` for the given virtual address and returns
    /// the table at that level. Superpages on the way are split; missing
    /// structures are created if `create` is set, otherwise the walk
    /// returns `None` at the first non-present entry.
    pub fn walk_down_and_split(
        &self,
        cleanup: &mut C,
        vaddr: u64,
        to_level: u32,
        create: bool,
    ) -> Result<Option<PtePtr>, NoMemory> {
        self.walk_down_at(
            cleanup,
            vaddr,
            to_level,
            PtePtr(self.root()),
            self.max_levels - 1,
            create,
        )
    }

    /// Releases whatever a removed entry at `level` referenced: schedules
    /// a TLB flush for displaced leaves and tears down referenced tables.
    fn cleanup_entry(&self, cleanup: &mut C, entry: u64, level: u32) {
        if self.is_leaf(level, entry) {
            if entry & T::PTE_P != 0 {
                cleanup.flush_tlb_later();
            }
        } else {
            self.cleanup_table(cleanup, PtePtr(entry & !T::MASK), level);
        }
    }

    /// Tears down a table whose entries live at `level - 1`, including the
    /// table page itself. The table must already be unreachable from the
    /// page table.
    fn cleanup_table(&self, cleanup: &mut C, table: PtePtr, level: u32) {
        debug_assert!(level > 0 && level <= self.max_levels);

        for i in 0..1usize << BITS {
            self.cleanup_entry(cleanup, self.memory.read(table.index(i)), level - 1);
        }

        cleanup.free_later(table.0);
    }

    /// Recursively installs the entries of `map` into `table` at `level`.
    fn fill_entries(
        &self,
        cleanup: &mut C,
        table: PtePtr,
        level: u32,
        map: &Mapping<T>,
    ) -> Result<(), NoMemory> {
        let entry_order = Self::level_order(level);
        let table_order = Self::level_order(level + 1);

        debug_assert!(map.order >= entry_order && map.order <= table_order);

        // How many entries of this table the update covers.
        let updated_order = map.order - entry_order;
        let offset = Self::virt_to_index(level, map.vaddr);

        let create_superpages = level > 0 && level < self.leaf_levels;
        let clear_mappings = !map.present();
        let is_leaf = level == 0 || create_superpages || clear_mappings;

        for i in 0..1usize << updated_order {
            let addr_offset = (i as u64) << entry_order;
            let entry_p = table.index(offset + i);

            if is_leaf {
                let new_attr = map.attr | if create_superpages { T::PTE_S } else { 0 };
                let new_entry = if clear_mappings {
                    0
                } else {
                    map.paddr | addr_offset | new_attr
                };

                let old = self.memory.exchange(entry_p, new_entry);
                self.cleanup_entry(cleanup, old, level);
            } else {
                let mut old = self.memory.read(entry_p);

                // We have to create entries at a lower level, but there is
                // no table yet.
                while old & T::PTE_P == 0 {
                    let new_phys = self.alloc.alloc_zeroed_page()?;
                    let new_entry = new_phys | T::ALL_RIGHTS;

                    if !self.memory.cmp_swap(entry_p, old, new_entry) {
                        self.alloc.free_page(new_phys);
                        old = self.memory.read(entry_p);
                        continue;
                    }

                    self.cleanup_entry(cleanup, old, level);
                    old = new_entry;
                }

                let sub_map = Mapping::new(
                    map.vaddr + addr_offset,
                    map.paddr + addr_offset,
                    map.attr,
                    entry_order,
                );

                self.fill_entries(cleanup, PtePtr(old & !T::MASK), level - 1, &sub_map)?;
            }
        }

        Ok(())
    }

    /// Creates, changes or removes mappings at natural alignment.
    ///
    /// On any leaf transition a TLB flush is scheduled in `cleanup`. If an
    /// allocation fails midway, the entries installed so far remain as a
    /// valid subset of the requested mapping and the caller may retry.
    pub fn update(&self, cleanup: &mut C, map: &Mapping<T>) -> Result<(), NoMemory> {
        assert!(map.order >= PAGE_BITS && map.order <= self.max_order());

        let align_mask = (1u64 << map.order) - 1;
        assert_eq!(0, map.vaddr & align_mask, "unaligned vaddr");
        assert_eq!(0, map.paddr & align_mask, "unaligned paddr");

        // The level at which entries are modified.
        let modified_level = (map.order - PAGE_BITS) / BITS;
        debug_assert!(modified_level < self.max_levels);

        // Walk down to the table to modify, splitting superpages on the
        // way. Missing structures are only created if there is something
        // to map.
        let do_create = map.present();
        let table = self.walk_down_and_split(cleanup, map.vaddr, modified_level, do_create)?;

        // When removing mappings, the walk may already have found nothing
        // to recurse into; in that case the job is done.
        if let Some(table) = table {
            self.fill_entries(cleanup, table, modified_level, map)?;
        }

        Ok(())
    }

    /// Convenience version of [`update`](Self::update) when batching of
    /// TLB invalidations is not required.
    pub fn update_one(&self, map: &Mapping<T>) -> Result<C, NoMemory> {
        let mut cleanup = C::default();
        self.update(&mut cleanup, map)?;
        Ok(cleanup)
    }

    /// Atomically replaces a non-present or read-only 4 KiB mapping with a
    /// new frame. Safe to use without synchronization: if the slot is (or
    /// concurrently becomes) writable, it is left untouched.
    ///
    /// Returns the physical frame now visible at `vaddr`, which may differ
    /// from `paddr` if a concurrent call won the race.
    #[must_use = "the returned frame may differ from the requested one"]
    pub fn replace_readonly_page(
        &self,
        cleanup: &mut C,
        vaddr: u64,
        paddr: u64,
        attr: u64,
    ) -> Result<u64, NoMemory> {
        assert_eq!(0, paddr & T::MASK);
        assert!(attr & !T::MASK == 0 && attr & T::PTE_P != 0);

        let table = self
            .walk_down_and_split(cleanup, vaddr, 0, true)?
            .expect("create-walk always returns a table");

        let entry_p = table.index(Self::virt_to_index(0, vaddr));
        let new_entry = paddr | attr;

        loop {
            let old = self.memory.read(entry_p);

            if old != new_entry && old & T::PTE_W == 0 {
                if !self.memory.cmp_swap(entry_p, old, new_entry) {
                    continue;
                }
                return Ok(new_entry & !T::MASK);
            }

            return Ok(old & !T::MASK);
        }
    }

    /// Returns a structural copy of this page table for the given virtual
    /// address range: table pages are duplicated, leaf entries (and thus
    /// the frames they point to) are shared.
    pub fn deep_copy(&self, vaddr_start: u64, vaddr_end: u64) -> Result<Self, NoMemory>
    where
        M: Clone,
        A: Clone,
    {
        let copy = Self::new(
            self.max_levels,
            self.leaf_levels,
            self.memory.clone(),
            self.alloc.clone(),
        )?;

        let top = self.max_levels - 1;
        let first = Self::virt_to_index(top, vaddr_start);
        let last = Self::virt_to_index(top, vaddr_end - 1);

        for idx in first..=last {
            let entry = self.memory.read(PtePtr(self.root()).index(idx));
            let copied = self.copy_entry(entry, top)?;
            self.memory.write(PtePtr(copy.root()).index(idx), copied);
        }

        Ok(copy)
    }

    fn copy_entry(&self, entry: u64, level: u32) -> Result<u64, NoMemory> {
        if self.is_leaf(level, entry) {
            return Ok(entry);
        }

        let src = PtePtr(entry & !T::MASK);
        let new_phys = self.alloc.alloc_zeroed_page()?;

        for i in 0..1usize << BITS {
            let sub = self.copy_entry(self.memory.read(src.index(i)), level - 1)?;
            self.memory.write(PtePtr(new_phys).index(i), sub);
        }

        Ok((entry & T::MASK) | new_phys)
    }
}

impl<const BITS: u32, M, A, T, C> Drop for GenericPageTable<BITS, M, A, T, C>
where
    M: MemoryPolicy,
    A: PageAlloc,
    T: PtAttr,
    C: DeferredCleanup,
{
    /// Assumes the page table is not in use anymore and frees it eagerly.
    /// Callers that drop a table with live users must flush first.
    fn drop(&mut self) {
        let root = match self.root.take() {
            Some(root) => root,
            None => return,
        };

        let mut cleanup = C::default();
        self.cleanup_table(&mut cleanup, PtePtr(root), self.max_levels);

        cleanup.ignore_tlb_flush();
        let alloc = &self.alloc;
        cleanup.free_pages_now(&mut |page| alloc.free_page(page));
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Unit-testing backends for the page-table policies.
    //!
    //! [`FakeMemory`] records every store, so a table can be inspected at
    //! any point in history. This is used to show that updates are atomic:
    //! at every intermediate state the table contains either the old or
    //! the new translation and no broken intermediate.

    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::vec::Vec;

    #[derive(Clone, Default)]
    pub struct FakeMemory {
        mem: Rc<RefCell<Vec<(u64, u64)>>>,
    }

    impl FakeMemory {
        pub fn preload(entries: &[(u64, u64)]) -> Self {
            Self {
                mem: Rc::new(RefCell::new(entries.to_vec())),
            }
        }

        /// A point in history. Increasing values are later states.
        pub fn now(&self) -> usize {
            self.mem.borrow().len()
        }

        /// The memory as it was at time `t`.
        pub fn at(&self, t: usize) -> Self {
            Self {
                mem: Rc::new(RefCell::new(self.mem.borrow()[..t].to_vec())),
            }
        }
    }

    impl MemoryPolicy for FakeMemory {
        fn read(&self, pte: PtePtr) -> u64 {
            assert_eq!(0, pte.0 % 8);
            self.mem
                .borrow()
                .iter()
                .rev()
                .find(|(addr, _)| *addr == pte.0)
                .map(|(_, val)| *val)
                // Unwritten memory reads as zero; FakeAlloc relies on it.
                .unwrap_or(0)
        }

        fn write(&self, pte: PtePtr, val: u64) {
            self.mem.borrow_mut().push((pte.0, val));
        }

        fn cmp_swap(&self, pte: PtePtr, old: u64, new: u64) -> bool {
            if self.read(pte) != old {
                return false;
            }
            self.write(pte, new);
            true
        }

        fn exchange(&self, pte: PtePtr, val: u64) -> u64 {
            let old = self.read(pte);
            self.write(pte, val);
            old
        }
    }

    struct FakeAllocState {
        cur: u64,
        allocated: usize,
        limit: usize,
        freed: Vec<u64>,
    }

    /// A page allocator that can be artificially limited to provoke
    /// out-of-memory conditions.
    #[derive(Clone)]
    pub struct FakeAlloc {
        state: Rc<RefCell<FakeAllocState>>,
    }

    impl Default for FakeAlloc {
        fn default() -> Self {
            Self::limited(usize::MAX)
        }
    }

    impl FakeAlloc {
        pub fn limited(limit: usize) -> Self {
            Self {
                state: Rc::new(RefCell::new(FakeAllocState {
                    cur: 0x1000_0000,
                    allocated: 0,
                    limit,
                    freed: Vec::new(),
                })),
            }
        }

        pub fn allocated_pages(&self) -> usize {
            self.state.borrow().allocated
        }

        pub fn freed_pages(&self) -> Vec<u64> {
            self.state.borrow().freed.clone()
        }
    }

    impl PageAlloc for FakeAlloc {
        fn alloc_zeroed_page(&self) -> Result<u64, NoMemory> {
            let mut state = self.state.borrow_mut();
            if state.allocated == state.limit {
                return Err(NoMemory);
            }

            let page = state.cur;
            state.cur += 4096;
            state.allocated += 1;

            // Pages are never handed out twice, so there is no need to
            // zero: FakeMemory defaults to zero for unwritten locations.
            Ok(page)
        }

        fn free_page(&self, phys: u64) {
            assert_eq!(0, phys % 4096);
            self.state.borrow_mut().freed.push(phys);
        }
    }

    #[derive(Default)]
    pub struct FakeCleanup {
        tlb_flush: bool,
        lazy_freed: Vec<u64>,
    }

    impl FakeCleanup {
        pub fn freed_pages(&self) -> Vec<u64> {
            self.lazy_freed.clone()
        }
    }

    impl DeferredCleanup for FakeCleanup {
        fn need_tlb_flush(&self) -> bool {
            self.tlb_flush
        }

        fn flush_tlb_later(&mut self) {
            self.tlb_flush = true;
        }

        fn ignore_tlb_flush(&mut self) {
            self.tlb_flush = false;
        }

        fn free_later(&mut self, page: u64) {
            self.tlb_flush = true;
            self.lazy_freed.push(page);
        }

        fn merge(&mut self, other: &mut Self) {
            self.tlb_flush |= other.tlb_flush;
            self.lazy_freed.append(&mut other.lazy_freed);
            other.tlb_flush = false;
        }

        fn free_pages_now(&mut self, free: &mut dyn FnMut(u64)) {
            for page in self.lazy_freed.drain(..) {
                free(page);
            }
        }
    }

    pub struct FakeAttr;

    impl PtAttr for FakeAttr {
        const PTE_P: u64 = 1 << 0;
        const PTE_W: u64 = 1 << 1;
        const PTE_S: u64 = 1 << 7;
        const MASK: u64 = (1 << 63) | (1 << 2) | (1 << 1) | (1 << 0);
        const ALL_RIGHTS: u64 = (1 << 0) | (1 << 1) | (1 << 2);
    }

    pub const PTE_P: u64 = 1 << 0;
    pub const PTE_W: u64 = 1 << 1;
    pub const PTE_U: u64 = 1 << 2;
    pub const PTE_S: u64 = 1 << 7;
    pub const ALL_RIGHTS: u64 = PTE_P | PTE_W | PTE_U;

    pub type FakeHpt = GenericPageTable<9, FakeMemory, FakeAlloc, FakeAttr, FakeCleanup>;
    pub type FakeMapping = Mapping<FakeAttr>;

    pub const TWOMB_ORDER: u32 = PAGE_BITS + 9;
    pub const ONEGB_ORDER: u32 = PAGE_BITS + 18;

    /// Rewinds a page table to a point in the history of its memory.
    pub fn rewind(hpt: &FakeHpt, t: usize) -> FakeHpt {
        FakeHpt::with_root(
            hpt.max_levels(),
            hpt.leaf_levels(),
            hpt.root(),
            hpt.memory().at(t),
            FakeAlloc::default(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use libmuon::mem::PAGE_SIZE;
    use proptest::prelude::*;
    use std::collections::HashMap;
    use std::vec::Vec;

    fn empty_hpt(max_levels: u32, leaf_levels: u32) -> FakeHpt {
        FakeHpt::new(
            max_levels,
            leaf_levels,
            FakeMemory::default(),
            FakeAlloc::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_empty_lookup() {
        let hpt = empty_hpt(4, 2);

        // An empty table has an invalid mapping across one entry of the
        // top-most level.
        let mapping = hpt.lookup(0);
        assert_eq!(0, mapping.attr);
        assert_eq!(PAGE_BITS + 3 * 9, mapping.order);
    }

    fn preloaded_walk_hpt() -> FakeHpt {
        let smallpage_paddr = 0xCAFE0000;
        let superpage_paddr = 0x10000000;

        let mem = FakeMemory::preload(&[
            (0x1000, 0x2000 | PTE_P),
            (0x2000, 0x3000 | PTE_P),
            (0x3000, 0x4000 | PTE_P),
            (0x3008, superpage_paddr | PTE_P | PTE_S),
            (0x4008, smallpage_paddr | PTE_P),
        ]);

        FakeHpt::with_root(4, 2, 0x1000, mem, FakeAlloc::default())
    }

    #[test]
    fn test_basic_walk() {
        let hpt = preloaded_walk_hpt();
        let smallpage_vaddr = 0x1000;
        let superpage_vaddr = 1u64 << (PAGE_BITS + 9);

        let mapping = hpt.lookup(smallpage_vaddr);
        assert_eq!(PTE_P, mapping.attr);
        assert_eq!(smallpage_vaddr, mapping.vaddr);
        assert_eq!(0xCAFE0000, mapping.paddr);
        assert_eq!(PAGE_BITS, mapping.order);

        let mapping0 = hpt.lookup(superpage_vaddr);
        let mapping1 = hpt.lookup(superpage_vaddr + PAGE_SIZE as u64);
        assert_eq!(PTE_P, mapping0.attr);
        assert_eq!(superpage_vaddr, mapping0.vaddr);
        assert_eq!(0x10000000, mapping0.paddr);
        assert_eq!(PAGE_BITS + 9, mapping0.order);
        assert_eq!(mapping0, mapping1);
    }

    #[test]
    fn test_lookup_phys() {
        let hpt = preloaded_walk_hpt();
        let smallpage_vaddr = 0x1000u64;
        let superpage_vaddr = 1u64 << (PAGE_BITS + 9);

        assert_eq!(None, hpt.lookup_phys(smallpage_vaddr + PAGE_SIZE as u64));
        assert_eq!(Some(0xCAFE0000 + 0x123), hpt.lookup_phys(smallpage_vaddr + 0x123));
        assert_eq!(
            Some(0x10000000 + 0x123456),
            hpt.lookup_phys(superpage_vaddr + 0x123456)
        );
    }

    #[test]
    fn test_walk_down_creates_structures() {
        let hpt = empty_hpt(4, 2);

        let mut cleanup = FakeCleanup::default();
        hpt.walk_down_and_split(&mut cleanup, 0, 0, true)
            .unwrap()
            .unwrap();

        // Upgrading entries from non-present to present needs no shootdown.
        assert!(!cleanup.need_tlb_flush());

        let mapping = hpt.lookup(0);
        assert_eq!(0, mapping.attr);
        assert_eq!(PAGE_BITS, mapping.order);
    }

    #[test]
    fn test_split_2mb_superpage() {
        let mem = FakeMemory::preload(&[
            (0x1000, 0x2000 | PTE_P),
            (0x2000, 0x3000 | PTE_P),
            (0x3000, 0x10000000 | PTE_P | PTE_S),
        ]);
        let hpt = FakeHpt::with_root(4, 2, 0x1000, mem, FakeAlloc::default());

        let mut cleanup = FakeCleanup::default();
        let table = hpt.walk_down_and_split(&mut cleanup, 0, 0, true).unwrap();
        assert!(table.is_some());

        // Splitting superpages needs a TLB shootdown.
        assert!(cleanup.need_tlb_flush());

        // Every new entry produces a translation identical to the former
        // superpage.
        for i in 0..1u64 << 9 {
            let mapping = hpt.lookup(i * PAGE_SIZE as u64);
            assert_eq!(i * PAGE_SIZE as u64, mapping.vaddr);
            assert_eq!(0x10000000 + i * PAGE_SIZE as u64, mapping.paddr);
            assert_eq!(PTE_P, mapping.attr);
            assert_eq!(PAGE_BITS, mapping.order);
        }
    }

    #[test]
    fn test_split_1gb_into_2mb() {
        let mem = FakeMemory::preload(&[
            (0x1000, 0x2000 | PTE_P),
            (0x2000, 0x80000000 | PTE_P | PTE_S),
        ]);
        let hpt = FakeHpt::with_root(4, 3, 0x1000, mem, FakeAlloc::default());

        assert_eq!(ONEGB_ORDER, hpt.lookup(0).order);

        let mut cleanup = FakeCleanup::default();
        hpt.walk_down_and_split(&mut cleanup, 0, 1, true).unwrap().unwrap();
        assert!(cleanup.need_tlb_flush());

        let mapping0 = hpt.lookup(0);
        let mapping1 = hpt.lookup(1u64 << TWOMB_ORDER);

        assert_eq!(0, mapping0.vaddr);
        assert_eq!(0x80000000, mapping0.paddr);
        assert_eq!(PTE_P, mapping0.attr);
        assert_eq!(TWOMB_ORDER, mapping0.order);

        assert_eq!(1u64 << TWOMB_ORDER, mapping1.vaddr);
        assert_eq!(0x80000000 + (1u64 << TWOMB_ORDER), mapping1.paddr);
        assert_eq!(PTE_P, mapping1.attr);
        assert_eq!(TWOMB_ORDER, mapping1.order);

        // The split superpage keeps the S bit at the new leaf level.
        let entry = hpt.lookup(0);
        assert!(entry.present());
    }

    #[test]
    fn test_update_creates_mappings() {
        for order in [PAGE_BITS, TWOMB_ORDER, ONEGB_ORDER] {
            let hpt = empty_hpt(4, 3);
            let vaddr = 1u64 << order;
            let paddr = 0x8000_0000u64;

            let cleanup = hpt
                .update_one(&FakeMapping::new(vaddr, paddr, PTE_P | PTE_W, order))
                .unwrap();
            assert!(!cleanup.need_tlb_flush());

            let mapping = hpt.lookup(vaddr);
            assert_eq!(vaddr, mapping.vaddr);
            assert_eq!(paddr, mapping.paddr);
            assert_eq!(PTE_P | PTE_W, mapping.attr);
            assert_eq!(order, mapping.order);
        }
    }

    #[test]
    fn test_update_out_of_memory() {
        // Three pages: the root plus two of the three table levels the
        // walk needs. The third allocation fails.
        let hpt = FakeHpt::new(4, 3, FakeMemory::default(), FakeAlloc::limited(3)).unwrap();

        let mut cleanup = FakeCleanup::default();
        let result = hpt.update(&mut cleanup, &FakeMapping::new(0x1000, 0x1000, PTE_P, PAGE_BITS));
        assert!(result.is_err());

        // No mapping was created.
        assert!(!hpt.lookup(0x1000).present());
    }

    #[test]
    fn test_unmap_allocates_nothing() {
        // On an empty page table.
        let hpt = empty_hpt(4, 3);
        let cleanup = hpt.update_one(&FakeMapping::empty(0, PAGE_BITS)).unwrap();
        assert!(!cleanup.need_tlb_flush());
        assert_eq!(PAGE_BITS + 3 * 9, hpt.lookup(0).order);
        assert_eq!(1, hpt.page_alloc().allocated_pages());

        // When unmapping a whole superpage.
        let mem = FakeMemory::preload(&[
            (0x1000, 0x2000 | PTE_P),
            (0x2000, 0x80000000 | PTE_P | PTE_S),
        ]);
        let alloc = FakeAlloc::default();
        let hpt = FakeHpt::with_root(4, 3, 0x1000, mem, alloc);
        let cleanup = hpt.update_one(&FakeMapping::empty(0, ONEGB_ORDER)).unwrap();
        assert!(cleanup.need_tlb_flush());
        assert_eq!(ONEGB_ORDER, hpt.lookup(0).order);
        assert_eq!(0, hpt.page_alloc().allocated_pages());
    }

    #[test]
    fn test_unmap_splits_superpage() {
        // Unmap 4K inside a 1 GiB page.
        let mem = FakeMemory::preload(&[
            (0x1000, 0x2000 | PTE_P),
            (0x2000, 0x80000000 | PTE_P | PTE_S),
        ]);
        let hpt = FakeHpt::with_root(4, 3, 0x1000, mem, FakeAlloc::default());

        let cleanup = hpt.update_one(&FakeMapping::empty(0, PAGE_BITS)).unwrap();
        assert!(cleanup.need_tlb_flush());

        // The region we actually unmapped.
        let mapping0 = hpt.lookup(0);
        assert_eq!(PAGE_BITS, mapping0.order);
        assert_eq!(0, mapping0.attr);
        assert_eq!(0, mapping0.vaddr);

        // The adjacent 4K region.
        let mapping1 = hpt.lookup(PAGE_SIZE as u64);
        assert_eq!(PAGE_BITS, mapping1.order);
        assert_eq!(PTE_P, mapping1.attr);
        assert_eq!(PAGE_SIZE as u64, mapping1.vaddr);
        assert_eq!(0x80000000 + PAGE_SIZE as u64, mapping1.paddr);

        // The adjacent 2M region.
        let mapping2 = hpt.lookup(1u64 << TWOMB_ORDER);
        assert_eq!(TWOMB_ORDER, mapping2.order);
        assert_eq!(PTE_P, mapping2.attr);
        assert_eq!(1u64 << TWOMB_ORDER, mapping2.vaddr);
        assert_eq!(0x80000000 + (1u64 << TWOMB_ORDER), mapping2.paddr);

        // Everything outside the former gigabyte region stays uncovered.
        assert!(!hpt.lookup(1u64 << ONEGB_ORDER).present());
    }

    #[test]
    fn test_updates_are_atomic() {
        let hpt = empty_hpt(4, 3);

        let old_mapping = FakeMapping::new(0, 0x80000000, PTE_P, PAGE_BITS);
        let new_mapping = FakeMapping::new(0, 0xC0000000, PTE_P | PTE_W, PAGE_BITS);

        assert!(!hpt.update_one(&old_mapping).unwrap().need_tlb_flush());
        let before = hpt.memory().now();

        assert!(hpt.update_one(&new_mapping).unwrap().need_tlb_flush());

        // At every point in history, address 0 translates either via the
        // old or via the new mapping.
        for t in before..=hpt.memory().now() {
            let past = rewind(&hpt, t);
            let cur = past.lookup(0);
            assert!(cur == old_mapping || cur == new_mapping, "broken state at t={}", t);
        }
    }

    #[test]
    fn test_superpage_split_is_atomic() {
        let hpt = empty_hpt(4, 3);

        let old_gig = FakeMapping::new(0, 0x80000000, PTE_P, ONEGB_ORDER);
        let old_two = FakeMapping::new(0, 0x80000000, PTE_P, TWOMB_ORDER);
        let old_page = FakeMapping::new(0, 0x80000000, PTE_P, PAGE_BITS);
        let new_page = FakeMapping::new(0, 0xC0000000, PTE_P | PTE_W, PAGE_BITS);

        assert!(!hpt.update_one(&old_gig).unwrap().need_tlb_flush());
        let before = hpt.memory().now();

        assert!(hpt.update_one(&new_page).unwrap().need_tlb_flush());

        // Either the new 4K page or some split form of the old gigabyte
        // mapping is visible; never an inconsistent state.
        for t in before..=hpt.memory().now() {
            let past = rewind(&hpt, t);
            let cur = past.lookup(0);
            assert!(
                cur == old_gig || cur == old_two || cur == old_page || cur == new_page,
                "broken state at t={}",
                t
            );
        }
    }

    #[test]
    fn test_changing_mappings_need_shootdown() {
        let preload = || {
            FakeMemory::preload(&[
                (0x1000, 0x2000 | ALL_RIGHTS),
                (0x2000, 0x3000 | ALL_RIGHTS),
                (0x3000, 0x4000 | ALL_RIGHTS),
                (0x4000, PTE_P),
                (0x4008, PTE_P | PTE_W),
            ])
        };
        let hpt = || FakeHpt::with_root(4, 3, 0x1000, preload(), FakeAlloc::default());

        // Same rights, different physical address.
        assert!(hpt()
            .update_one(&FakeMapping::new(0, PAGE_SIZE as u64, PTE_P, PAGE_BITS))
            .unwrap()
            .need_tlb_flush());

        // Downgrade from PW to P.
        assert!(hpt()
            .update_one(&FakeMapping::new(PAGE_SIZE as u64, 0, PTE_P, PAGE_BITS))
            .unwrap()
            .need_tlb_flush());

        // Unmap.
        assert!(hpt()
            .update_one(&FakeMapping::empty(0, PAGE_BITS))
            .unwrap()
            .need_tlb_flush());

        // Upgrading rights currently also causes a shootdown.
        assert!(hpt()
            .update_one(&FakeMapping::new(0, 0, PTE_P | PTE_W, PAGE_BITS))
            .unwrap()
            .need_tlb_flush());
    }

    #[test]
    fn test_superpage_creation_reclaims_tables() {
        let preload = || {
            FakeMemory::preload(&[
                (0x1000, 0x2000 | ALL_RIGHTS),
                (0x2000, 0x3000 | ALL_RIGHTS),
                (0x3000, 0x4000 | ALL_RIGHTS),
                (0x3008, 0x5000 | ALL_RIGHTS),
            ])
        };

        // Mapping 2MB over 4K pages lazily frees the old leaf table.
        let hpt = FakeHpt::with_root(4, 3, 0x1000, preload(), FakeAlloc::default());
        let cleanup = hpt
            .update_one(&FakeMapping::new(0, 0, PTE_P | PTE_W, TWOMB_ORDER))
            .unwrap();
        assert!(cleanup.need_tlb_flush());
        assert_eq!(vec![0x4000], cleanup.freed_pages());
        assert!(hpt.page_alloc().freed_pages().is_empty());

        // Mapping 1GB over 4K pages lazily frees the two lower levels,
        // leaves first.
        let hpt = FakeHpt::with_root(4, 3, 0x1000, preload(), FakeAlloc::default());
        let cleanup = hpt
            .update_one(&FakeMapping::new(0, 0, PTE_P | PTE_W, ONEGB_ORDER))
            .unwrap();
        assert!(cleanup.need_tlb_flush());
        assert_eq!(vec![0x4000, 0x5000, 0x3000], cleanup.freed_pages());
        assert!(hpt.page_alloc().freed_pages().is_empty());
    }

    #[test]
    fn test_mapping_without_superpage_support() {
        let mem = FakeMemory::preload(&[
            (0x1000, 0x2000 | ALL_RIGHTS),
            (0x2008, 0x3000 | ALL_RIGHTS),
        ]);

        // No superpage support: leaf_levels == 1.
        let hpt = FakeHpt::with_root(4, 1, 0x1000, mem, FakeAlloc::default());

        // A 4MB mapping at one gigabyte has to create two new leaf tables.
        let fourmb_order = TWOMB_ORDER + 1;
        let virt = 1u64 << ONEGB_ORDER;
        let cleanup = hpt
            .update_one(&FakeMapping::new(virt, 0, PTE_P, fourmb_order))
            .unwrap();
        assert!(!cleanup.need_tlb_flush());

        let mut offset = 0u64;
        while offset < 1u64 << fourmb_order {
            let mapping = hpt.lookup(virt + offset);
            assert!(mapping.present());
            assert_eq!(PAGE_SIZE as u64, mapping.size());
            assert_eq!(virt + offset, mapping.vaddr);
            assert_eq!(offset, mapping.paddr);
            offset += PAGE_SIZE as u64;
        }
    }

    #[test]
    fn test_replace_readonly_page() {
        let mem = FakeMemory::preload(&[
            (0x1000, 0x2000 | ALL_RIGHTS),
            (0x2000, 0x3000 | ALL_RIGHTS),
            (0x3000, 0x4000 | ALL_RIGHTS),
            (0x4000, 0x1000 | PTE_P),
            (0x4008, 0x2000 | PTE_P | PTE_W),
        ]);
        let hpt = FakeHpt::with_root(4, 3, 0x1000, mem, FakeAlloc::default());
        let mut cleanup = FakeCleanup::default();

        // Non-existing mapping is created.
        let phys = hpt
            .replace_readonly_page(&mut cleanup, 0x4000, 0x3000, PTE_P | PTE_W)
            .unwrap();
        assert_eq!(0x3000, phys);
        assert_eq!(Some(0x3000), hpt.lookup_phys(0x4000));

        // Existing read-only page is replaced.
        let phys = hpt
            .replace_readonly_page(&mut cleanup, 0, 0x3000, PTE_P | PTE_W)
            .unwrap();
        assert_eq!(0x3000, phys);

        // Existing writable mapping is left as-is.
        let phys = hpt
            .replace_readonly_page(&mut cleanup, 0x1000, 0x3000, PTE_P | PTE_W)
            .unwrap();
        assert_eq!(0x2000, phys);
    }

    #[test]
    fn test_clamp() {
        let attr = PTE_P | PTE_W;
        let source = FakeMapping::new(5 << 22, 0, attr, 22);

        // Idempotent.
        assert_eq!(source, source.clamp(source.vaddr, source.order));
        // Preserves attributes.
        assert_eq!(attr, source.clamp(source.vaddr, source.order).attr);
        // Clamp into a larger region is a no-op.
        assert_eq!(source, source.clamp(4 << 22, 24));

        // Clamp into a smaller region returns the smaller region.
        let clamped = source.clamp(22 << 20, 21);
        assert_eq!(22 << 20, clamped.vaddr);
        assert_eq!(2 << 20, clamped.paddr);
        assert_eq!(21, clamped.order);
    }

    #[test]
    fn test_move_by() {
        let source = FakeMapping::new(5 << 22, 0, PTE_P, 22);

        assert_eq!(source, source.move_by(0));

        let moved = source.move_by(PAGE_SIZE as u64);
        assert_eq!(source.vaddr + PAGE_SIZE as u64, moved.vaddr);
        assert_eq!(source.paddr, moved.paddr);
        assert_eq!(source.attr, moved.attr);
        assert_eq!(PAGE_BITS, moved.order);

        assert_eq!(source.order, source.move_by(1u64 << source.order).order);
        assert_eq!(source.order, source.move_by(1u64 << 30).order);
    }

    #[test]
    fn test_deep_copy_shares_frames() {
        let hpt = empty_hpt(4, 3);
        hpt.update_one(&FakeMapping::new(0x1000, 0xCAFE0000, PTE_P | PTE_W, PAGE_BITS))
            .unwrap();

        let copy = hpt.deep_copy(0, 1 << ONEGB_ORDER).unwrap();
        assert_ne!(hpt.root(), copy.root());
        assert_eq!(Some(0xCAFE0000), copy.lookup_phys(0x1000));

        // Changing the copy does not affect the original.
        copy.update_one(&FakeMapping::empty(0x1000, PAGE_BITS)).unwrap();
        assert_eq!(Some(0xCAFE0000), hpt.lookup_phys(0x1000));
    }

    proptest! {
        /// For all sequences of non-overlapping 4K updates, lookup returns
        /// the translation of the last update that covered the address.
        #[test]
        fn prop_lookup_returns_last_update(
            ops in prop::collection::vec((0u64..16, any::<bool>(), 1u64..16), 1..48)
        ) {
            let hpt = empty_hpt(4, 3);
            let mut model: HashMap<u64, Option<u64>> = HashMap::new();

            for (page, present, frame) in ops {
                let vaddr = page * PAGE_SIZE as u64;
                let paddr = frame * PAGE_SIZE as u64;

                if present {
                    hpt.update_one(&FakeMapping::new(vaddr, paddr, PTE_P, PAGE_BITS)).unwrap();
                    model.insert(page, Some(paddr));
                } else {
                    hpt.update_one(&FakeMapping::empty(vaddr, PAGE_BITS)).unwrap();
                    model.insert(page, None);
                }
            }

            for (page, expected) in &model {
                let mapping = hpt.lookup(page * PAGE_SIZE as u64);
                match expected {
                    Some(paddr) => {
                        prop_assert!(mapping.present());
                        prop_assert_eq!(*paddr, mapping.paddr);
                    }
                    None => prop_assert!(!mapping.present()),
                }
            }
        }
    }
}
