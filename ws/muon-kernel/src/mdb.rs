//! The Mapping Database (MDB).
//!
//! Every delegated region is recorded by an [`Mdb`] node. Nodes live in two
//! structures at once:
//!
//! - a per-space AVL tree ordered by `node_base`, for range lookups, and
//! - a delegation tree threaded as a circular doubly-linked list in which
//!   the subtree of a node is the contiguous run of deeper nodes following
//!   it. Children sit immediately after their parent at depth
//!   `parent.depth + 1`, so revoke can walk a subtree in O(subtree) and
//!   detach it bottom-up.
//!
//! Nodes are retired through RCU; a concurrent lock-free reader sees either
//! the old tree or a strictly smaller subset.

use crate::rcu::RcuElem;
use alloc::boxed::Box;
use core::ptr;
use core::sync::atomic::{
    AtomicPtr,
    AtomicU32,
    AtomicU64,
    Ordering,
};
use spin::Mutex;

/// A node of the mapping database.
#[repr(C)]
pub struct Mdb {
    /// RCU retirement hook. Must stay the first field: kernel objects
    /// embed an `Mdb` as their first field and are retired through it.
    pub rcu: RcuElem,

    // AVL linkage, guarded by the owning space's lock.
    avl_left: AtomicPtr<Mdb>,
    avl_right: AtomicPtr<Mdb>,
    avl_height: AtomicU32,

    // Delegation-tree linkage: circular doubly-linked list plus parent
    // pointer and depth.
    prev: AtomicPtr<Mdb>,
    next: AtomicPtr<Mdb>,
    prnt: AtomicPtr<Mdb>,
    dpth: AtomicU32,

    /// The space owning this node (an opaque pointer; the delegation
    /// engine knows the concrete subspace type).
    space: AtomicPtr<u8>,

    /// Serializes attribute updates and list surgery on this node.
    pub node_lock: Mutex<()>,

    pub node_base: u64,
    pub node_order: u32,
    pub node_phys: u64,
    node_attr: AtomicU64,
    pub node_type: u64,
    pub node_sub: u64,
}

unsafe impl Send for Mdb {}
unsafe impl Sync for Mdb {}

unsafe fn mdb_free(elem: *mut RcuElem) {
    drop(Box::from_raw(elem as *mut Mdb));
}

impl Mdb {
    /// Creates a node. The tree list initially contains only the node
    /// itself (a delegation root at depth 0).
    pub fn new(
        space: *mut u8,
        phys: u64,
        base: u64,
        order: u32,
        attr: u64,
        node_type: u64,
        sub: u64,
    ) -> Self {
        Self::with_free(space, phys, base, order, attr, node_type, sub, mdb_free, None)
    }

    /// Creates a node with custom RCU hooks. Used by kernel objects whose
    /// root capability node is embedded in the object itself.
    #[allow(clippy::too_many_arguments)]
    pub fn with_free(
        space: *mut u8,
        phys: u64,
        base: u64,
        order: u32,
        attr: u64,
        node_type: u64,
        sub: u64,
        free: unsafe fn(*mut RcuElem),
        pre_free: Option<unsafe fn(*mut RcuElem)>,
    ) -> Self {
        Self {
            rcu: RcuElem::new(free, pre_free),
            avl_left: AtomicPtr::new(ptr::null_mut()),
            avl_right: AtomicPtr::new(ptr::null_mut()),
            avl_height: AtomicU32::new(1),
            prev: AtomicPtr::new(ptr::null_mut()),
            next: AtomicPtr::new(ptr::null_mut()),
            prnt: AtomicPtr::new(ptr::null_mut()),
            dpth: AtomicU32::new(0),
            space: AtomicPtr::new(space),
            node_lock: Mutex::new(()),
            node_base: base,
            node_order: order,
            node_phys: phys,
            node_attr: AtomicU64::new(attr),
            node_type,
            node_sub: sub,
        }
    }

    /// Links the node into its own one-element circular list. Must happen
    /// after the node has a stable address.
    pub fn init_list(&self) {
        let this = self as *const _ as *mut Mdb;
        self.prev.store(this, Ordering::SeqCst);
        self.next.store(this, Ordering::SeqCst);
    }

    pub fn attr(&self) -> u64 {
        self.node_attr.load(Ordering::SeqCst)
    }

    /// A node is alive while it still grants anything.
    pub fn alive(&self) -> bool {
        self.attr() != 0
    }

    pub fn depth(&self) -> u32 {
        self.dpth.load(Ordering::SeqCst)
    }

    pub fn parent(&self) -> *mut Mdb {
        self.prnt.load(Ordering::SeqCst)
    }

    pub fn next_node(&self) -> *mut Mdb {
        self.next.load(Ordering::SeqCst)
    }

    pub fn prev_node(&self) -> *mut Mdb {
        self.prev.load(Ordering::SeqCst)
    }

    pub fn space(&self) -> *mut u8 {
        self.space.load(Ordering::SeqCst)
    }

    pub fn set_space(&self, space: *mut u8) {
        self.space.store(space, Ordering::SeqCst);
    }

    /// Number of units covered: `2^order`.
    pub fn size(&self) -> u64 {
        1u64 << self.node_order
    }

    /// Last unit + 1 of the covered range.
    pub fn node_end(&self) -> u64 {
        self.node_base + self.size()
    }

    /// Hooks the node into the delegation tree as a child of `parent` and
    /// activates it with the given attributes, masked by what the parent
    /// still grants. Fails when the parent died concurrently or grants
    /// none of the requested attributes.
    pub fn insert_node(&self, parent: &Mdb, attr: u64) -> bool {
        let _guard = parent.node_lock.lock();

        let attr = attr & parent.attr();
        if attr == 0 {
            return false;
        }

        let this = self as *const _ as *mut Mdb;
        let parent_ptr = parent as *const _ as *mut Mdb;

        self.node_attr.store(attr, Ordering::SeqCst);
        self.prnt.store(parent_ptr, Ordering::SeqCst);
        self.dpth.store(parent.depth() + 1, Ordering::SeqCst);

        // Insert immediately after the parent: the subtree of every node
        // stays a contiguous run of deeper nodes.
        let after = parent.next_node();
        self.next.store(after, Ordering::SeqCst);
        self.prev.store(parent_ptr, Ordering::SeqCst);
        unsafe { (*after).prev.store(this, Ordering::SeqCst) };
        parent.next.store(this, Ordering::SeqCst);

        true
    }

    /// Removes attribute bits. Returns the remaining attributes.
    pub fn demote_node(&self, attr: u64) -> u64 {
        let _guard = self.node_lock.lock();
        self.node_attr.fetch_and(!attr, Ordering::SeqCst) & !attr
    }

    /// Unlinks the node from the delegation tree if it has neither
    /// attributes nor children left. The caller removes it from the AVL
    /// and hands it to RCU afterwards.
    pub fn remove_node(&self) -> bool {
        let _guard = self.node_lock.lock();

        if self.alive() {
            return false;
        }

        let next = self.next_node();
        // A deeper successor is a child: the subtree must go first.
        if unsafe { (*next).depth() } > self.depth() {
            return false;
        }

        let prev = self.prev_node();
        unsafe {
            (*prev).next.store(next, Ordering::SeqCst);
            (*next).prev.store(prev, Ordering::SeqCst);
        }
        // The node's own prev/next stay as they are: a concurrent
        // bottom-up walker may still step through this node until the
        // grace period ends.

        true
    }
}

// ---------------------------------------------------------------------------
// The per-space AVL, ordered by node_base. All operations run under the
// space's spinlock; the link fields use atomics so that the unlocked
// list-walkers of revoke never observe torn pointers.

fn height(node: *mut Mdb) -> u32 {
    if node.is_null() {
        0
    } else {
        unsafe { (*node).avl_height.load(Ordering::SeqCst) }
    }
}

unsafe fn update_height(node: *mut Mdb) {
    let h = 1 + height((*node).avl_left.load(Ordering::SeqCst))
        .max(height((*node).avl_right.load(Ordering::SeqCst)));
    (*node).avl_height.store(h, Ordering::SeqCst);
}

fn balance_of(node: *mut Mdb) -> i32 {
    unsafe {
        height((*node).avl_left.load(Ordering::SeqCst)) as i32
            - height((*node).avl_right.load(Ordering::SeqCst)) as i32
    }
}

unsafe fn rotate_right(node: *mut Mdb) -> *mut Mdb {
    let new_root = (*node).avl_left.load(Ordering::SeqCst);
    (*node)
        .avl_left
        .store((*new_root).avl_right.load(Ordering::SeqCst), Ordering::SeqCst);
    (*new_root).avl_right.store(node, Ordering::SeqCst);
    update_height(node);
    update_height(new_root);
    new_root
}

unsafe fn rotate_left(node: *mut Mdb) -> *mut Mdb {
    let new_root = (*node).avl_right.load(Ordering::SeqCst);
    (*node)
        .avl_right
        .store((*new_root).avl_left.load(Ordering::SeqCst), Ordering::SeqCst);
    (*new_root).avl_left.store(node, Ordering::SeqCst);
    update_height(node);
    update_height(new_root);
    new_root
}

unsafe fn rebalance(node: *mut Mdb) -> *mut Mdb {
    update_height(node);

    let balance = balance_of(node);
    if balance > 1 {
        let left = (*node).avl_left.load(Ordering::SeqCst);
        if balance_of(left) < 0 {
            (*node).avl_left.store(rotate_left(left), Ordering::SeqCst);
        }
        return rotate_right(node);
    }
    if balance < -1 {
        let right = (*node).avl_right.load(Ordering::SeqCst);
        if balance_of(right) > 0 {
            (*node).avl_right.store(rotate_right(right), Ordering::SeqCst);
        }
        return rotate_left(node);
    }

    node
}

unsafe fn avl_insert(root: *mut Mdb, node: *mut Mdb) -> (*mut Mdb, bool) {
    if root.is_null() {
        (*node).avl_left.store(ptr::null_mut(), Ordering::SeqCst);
        (*node).avl_right.store(ptr::null_mut(), Ordering::SeqCst);
        (*node).avl_height.store(1, Ordering::SeqCst);
        return (node, true);
    }

    let (link, inserted) = if (*node).node_base < (*root).node_base {
        let (sub, ok) = avl_insert((*root).avl_left.load(Ordering::SeqCst), node);
        (*root).avl_left.store(sub, Ordering::SeqCst);
        (root, ok)
    } else if (*node).node_base > (*root).node_base {
        let (sub, ok) = avl_insert((*root).avl_right.load(Ordering::SeqCst), node);
        (*root).avl_right.store(sub, Ordering::SeqCst);
        (root, ok)
    } else {
        // Duplicate key: at most one node per base and space.
        (root, false)
    };

    if !inserted {
        return (link, false);
    }

    (rebalance(link), true)
}

unsafe fn avl_min(mut node: *mut Mdb) -> *mut Mdb {
    while !(*node).avl_left.load(Ordering::SeqCst).is_null() {
        node = (*node).avl_left.load(Ordering::SeqCst);
    }
    node
}

/// Removes `base` from the subtree. Returns (new subtree root, removed?).
unsafe fn avl_remove(root: *mut Mdb, base: u64) -> (*mut Mdb, bool) {
    if root.is_null() {
        return (root, false);
    }

    let removed;
    let mut node = root;

    if base < (*root).node_base {
        let (sub, ok) = avl_remove((*root).avl_left.load(Ordering::SeqCst), base);
        (*root).avl_left.store(sub, Ordering::SeqCst);
        removed = ok;
    } else if base > (*root).node_base {
        let (sub, ok) = avl_remove((*root).avl_right.load(Ordering::SeqCst), base);
        (*root).avl_right.store(sub, Ordering::SeqCst);
        removed = ok;
    } else {
        let left = (*root).avl_left.load(Ordering::SeqCst);
        let right = (*root).avl_right.load(Ordering::SeqCst);

        if left.is_null() || right.is_null() {
            return (if left.is_null() { right } else { left }, true);
        }

        // Two children: splice the in-order successor into our place.
        let succ = avl_min(right);
        let (new_right, ok) = avl_remove(right, (*succ).node_base);
        debug_assert!(ok);
        (*succ).avl_left.store(left, Ordering::SeqCst);
        (*succ).avl_right.store(new_right, Ordering::SeqCst);
        node = succ;
        removed = true;
    }

    (rebalance(node), removed)
}

/// Finds the node whose range contains `idx`; with `next`, falls back to
/// the node with the smallest base greater than `idx`.
pub(crate) unsafe fn avl_lookup(root: *mut Mdb, idx: u64, next: bool) -> *mut Mdb {
    let mut best = ptr::null_mut();
    let mut cur = root;

    while !cur.is_null() {
        let node = &*cur;
        if idx < node.node_base {
            best = cur;
            cur = node.avl_left.load(Ordering::SeqCst);
        } else if idx >= node.node_end() {
            cur = node.avl_right.load(Ordering::SeqCst);
        } else {
            return cur;
        }
    }

    if next {
        best
    } else {
        ptr::null_mut()
    }
}

/// The AVL root of one space, to be used under the space's lock.
#[derive(Debug)]
pub struct MdbTree {
    root: AtomicPtr<Mdb>,
}

impl MdbTree {
    pub const fn new() -> Self {
        Self {
            root: AtomicPtr::new(ptr::null_mut()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.root.load(Ordering::SeqCst).is_null()
    }

    /// Inserts a node; rejects duplicate base addresses.
    pub fn insert(&self, node: *mut Mdb) -> bool {
        let (new_root, inserted) = unsafe { avl_insert(self.root.load(Ordering::SeqCst), node) };
        self.root.store(new_root, Ordering::SeqCst);
        inserted
    }

    /// Removes the node with the given base.
    pub fn remove(&self, node: *mut Mdb) -> bool {
        let base = unsafe { (*node).node_base };
        let (new_root, removed) = unsafe { avl_remove(self.root.load(Ordering::SeqCst), base) };
        self.root.store(new_root, Ordering::SeqCst);
        removed
    }

    pub fn lookup(&self, idx: u64, next: bool) -> *mut Mdb {
        unsafe { avl_lookup(self.root.load(Ordering::SeqCst), idx, next) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::vec::Vec;

    fn node(base: u64, order: u32) -> Box<Mdb> {
        let node = Box::new(Mdb::new(ptr::null_mut(), base, base, order, 0x3, 0, 0));
        node.init_list();
        node
    }

    #[test]
    fn test_avl_insert_lookup() {
        let tree = MdbTree::new();
        let mut nodes: Vec<Box<Mdb>> = (0..64).map(|i| node(i * 16, 2)).collect();

        for n in nodes.iter_mut() {
            assert!(tree.insert(&mut **n));
        }

        // Duplicate base is rejected.
        let mut dup = node(16, 0);
        assert!(!tree.insert(&mut *dup));

        // Containing lookup.
        let found = tree.lookup(19, false);
        assert!(!found.is_null());
        assert_eq!(16, unsafe { (*found).node_base });

        // A gap without `next` yields nothing; with `next` the follower.
        assert!(tree.lookup(20, false).is_null());
        let next = tree.lookup(20, true);
        assert_eq!(32, unsafe { (*next).node_base });

        // Past the last node nothing follows.
        assert!(tree.lookup(63 * 16 + 4, true).is_null());
    }

    #[test]
    fn test_avl_remove_rebalances() {
        let tree = MdbTree::new();
        let mut nodes: Vec<Box<Mdb>> = (0..128).map(|i| node(i * 4, 2)).collect();

        for n in nodes.iter_mut() {
            assert!(tree.insert(&mut **n));
        }

        // Remove every second node.
        for n in nodes.iter_mut().step_by(2) {
            assert!(tree.remove(&mut **n));
        }

        for (i, n) in nodes.iter_mut().enumerate() {
            let found = tree.lookup(n.node_base, false);
            if i % 2 == 0 {
                assert!(found.is_null());
                // Revoking something already revoked is a no-op.
                assert!(!tree.remove(&mut **n));
            } else {
                assert_eq!(n.node_base, unsafe { (*found).node_base });
            }
        }
    }

    #[test]
    fn test_delegation_tree_linkage() {
        let root = node(0, 4);
        let child_a = node(0, 2);
        let child_b = node(4, 2);
        let grandchild = node(4, 1);

        assert!(child_a.insert_node(&root, 0x3));
        assert!(child_b.insert_node(&root, 0x3));
        assert!(grandchild.insert_node(&child_b, 0x1));

        // Depth increases along the parent chain.
        assert_eq!(0, root.depth());
        assert_eq!(1, child_a.depth());
        assert_eq!(1, child_b.depth());
        assert_eq!(2, grandchild.depth());

        // List order: root, B, grandchild, A (children inserted right
        // after the parent), every subtree contiguous.
        let order: Vec<u64> = {
            let mut out = Vec::new();
            let mut cur = root.next_node();
            while cur != (&*root as *const _ as *mut Mdb) {
                out.push(unsafe { (*cur).node_base });
                cur = unsafe { (*cur).next_node() };
            }
            out
        };
        assert_eq!(vec![4, 4, 0], order);

        // A child with live attributes cannot be removed.
        assert!(!child_b.remove_node());
        // A parent with children cannot be removed even when demoted.
        child_b.demote_node(0x3);
        assert!(!child_b.remove_node());

        // Bottom-up removal succeeds.
        grandchild.demote_node(0x1);
        assert!(grandchild.remove_node());
        assert!(child_b.remove_node());

        // Dead parents refuse new children.
        assert!(!node(5, 0).insert_node(&child_b, 0x1));
    }
}
