//! The three capability spaces of a protection domain.

pub mod mem;
pub mod obj;
pub mod pio;

pub use mem::SpaceMem;
pub use obj::SpaceObj;
pub use pio::SpacePio;

use crate::kalloc::NoMemory;
use crate::mdb::{
    Mdb,
    MdbTree,
};
use crate::pagetable::TlbCleanup;
use alloc::boxed::Box;
use core::sync::atomic::{
    AtomicBool,
    Ordering,
};
use spin::Mutex;

/// The generic part of a space: a spinlock-guarded AVL of MDB nodes. Every
/// concrete space embeds this as its first field, so an opaque
/// `Mdb::space` pointer can always be read as a `Space`.
#[derive(Debug)]
pub struct Space {
    lock: Mutex<()>,
    tree: MdbTree,
    /// The kernel PD's spaces never materialize hardware state.
    kernel: AtomicBool,
}

impl Space {
    pub const fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            tree: MdbTree::new(),
            kernel: AtomicBool::new(false),
        }
    }

    pub fn mark_kernel(&self) {
        self.kernel.store(true, Ordering::SeqCst);
    }

    pub fn is_kernel(&self) -> bool {
        self.kernel.load(Ordering::SeqCst)
    }

    /// Recovers the generic space from a node's opaque space pointer.
    pub unsafe fn of_node(node: &Mdb) -> &Space {
        &*(node.space() as *const Space)
    }

    /// Finds the node containing `idx`, or (with `next`) the first node
    /// starting after it.
    pub fn tree_lookup(&self, idx: u64, next: bool) -> *mut Mdb {
        let _guard = self.lock.lock();
        self.tree.lookup(idx, next)
    }

    /// Inserts the node into its owning space's AVL. Rejects duplicate
    /// base addresses.
    pub fn tree_insert(node: &Mdb) -> bool {
        let space = unsafe { Space::of_node(node) };
        let _guard = space.lock.lock();
        space.tree.insert(node as *const _ as *mut Mdb)
    }

    /// Removes the node from its owning space's AVL.
    pub fn tree_remove(node: &Mdb) -> bool {
        let space = unsafe { Space::of_node(node) };
        let _guard = space.lock.lock();
        space.tree.remove(node as *const _ as *mut Mdb)
    }

    /// Seeds the space with delegation-root nodes covering
    /// `[addr, addr + size)`, split into naturally aligned chunks. Used
    /// for the kernel PD's initial resources.
    pub fn addreg(&self, space_ptr: *mut u8, mut addr: u64, mut size: u64, attr: u64, node_type: u64) {
        let _guard = self.lock.lock();

        while size != 0 {
            let order = max_order(addr, size);
            let node = Box::leak(Box::new(Mdb::new(
                space_ptr,
                addr,
                addr,
                order,
                attr,
                node_type,
                0,
            )));
            node.init_list();
            self.tree.insert(node);

            addr += 1 << order;
            size -= 1 << order;
        }
    }
}

/// The largest natural order for a chunk at `addr` not exceeding `size`.
pub fn max_order(addr: u64, size: u64) -> u32 {
    let align = if addr == 0 { 63 } else { addr.trailing_zeros() };
    let fit = 63 - size.leading_zeros();
    align.min(fit)
}

/// A subspace of a PD as seen by the delegation engine: it can resolve
/// MDB nodes and commit attribute changes into hardware structures.
pub trait Subspace {
    /// The generic space inside the concrete space.
    fn generic(&self) -> &Space;

    /// Writes the node's (possibly demoted) attributes through to the
    /// hardware structures. `rmask` is the set of rights being dropped.
    fn update(&self, node: &Mdb, rmask: u64) -> Result<TlbCleanup, NoMemory>;

    /// Recovers the concrete space from a node's opaque space pointer.
    ///
    /// Sound because nodes only ever enter trees of their own concrete
    /// space type.
    unsafe fn of_node(node: &Mdb) -> &Self;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_order() {
        assert_eq!(0, max_order(1, 4));
        assert_eq!(2, max_order(4, 4));
        assert_eq!(2, max_order(8, 7));
        assert_eq!(3, max_order(8, 8));
        assert_eq!(4, max_order(0, 16));
    }

    #[test]
    fn test_addreg_splits_naturally() {
        let space = Box::leak(Box::new(Space::new()));
        let ptr = space as *mut Space as *mut u8;
        space.addreg(ptr, 3, 9, 0x7, 0);

        // Chunks: 3(+1), 4(+4), 8(+4).
        for (idx, base, order) in [(3u64, 3u64, 0u32), (4, 4, 2), (8, 8, 2)] {
            let node = space.tree_lookup(idx, false);
            assert!(!node.is_null());
            unsafe {
                assert_eq!(base, (*node).node_base);
                assert_eq!(order, (*node).node_order);
            }
        }
        assert!(space.tree_lookup(12, false).is_null());
    }
}
