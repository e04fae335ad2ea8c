use crate::reclaim::{Atomic, Guard, Shared};
use parking_lot::Mutex;
use std::borrow::Borrow;
use std::cmp;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::thread::{current, park, Thread};

/// What a table slot points at. A null slot is an empty bin.
#[derive(Debug)]
pub(crate) enum BinEntry<K, V> {
    Node(Node<K, V>),
    Tree(TreeBin<K, V>),
    Moved,
}

impl<K, V> BinEntry<K, V> {
    pub(crate) fn as_node(&self) -> Option<&Node<K, V>> {
        if let BinEntry::Node(ref n) = *self {
            Some(n)
        } else {
            None
        }
    }
}

/// Dereferences a pointer that is known to be part of a chain.
///
/// # Safety
///
/// `entry` must be non-null and protected by `'g`.
#[inline]
pub(crate) unsafe fn chain_node<'g, K, V>(entry: Shared<'g, BinEntry<K, V>>) -> &'g Node<K, V> {
    match entry.deref().as_node() {
        Some(node) => node,
        None => unreachable!("chains only link BinEntry::Node"),
    }
}

/// An entry in a chain. Only the head's `lock` is ever taken; it guards every
/// mutation of the chain.
#[derive(Debug)]
pub(crate) struct Node<K, V> {
    pub(crate) hash: u64,
    pub(crate) key: K,
    pub(crate) value: Atomic<V>,
    pub(crate) next: Atomic<BinEntry<K, V>>,
    pub(crate) lock: Mutex<()>,
}

impl<K, V> Node<K, V> {
    pub(crate) fn new(hash: u64, key: K, value: Atomic<V>) -> Self {
        Node::with_next(hash, key, value, Atomic::null())
    }

    pub(crate) fn with_next(
        hash: u64,
        key: K,
        value: Atomic<V>,
        next: Atomic<BinEntry<K, V>>,
    ) -> Self {
        Node {
            hash,
            key,
            value,
            next,
            lock: Mutex::new(()),
        }
    }
}

/* ------------------------ TreeNodes ------------------------ */

/// An entry of a [`TreeBin`]. Tree nodes are both linked into a red-black tree
/// ordered by `(hash, key)` and into an insertion-ordered list through
/// `next`/`prev`, which readers fall back to while the tree is restructured.
#[derive(Debug)]
pub(crate) struct TreeNode<K, V> {
    pub(crate) hash: u64,
    pub(crate) key: K,
    pub(crate) value: Atomic<V>,
    pub(crate) next: Atomic<TreeNode<K, V>>,
    pub(crate) prev: Atomic<TreeNode<K, V>>,

    // red-black tree links
    pub(crate) parent: Atomic<TreeNode<K, V>>,
    pub(crate) left: Atomic<TreeNode<K, V>>,
    pub(crate) right: Atomic<TreeNode<K, V>>,
    pub(crate) red: AtomicBool,
}

impl<K, V> TreeNode<K, V> {
    pub(crate) fn new(hash: u64, key: K, value: Atomic<V>) -> Self {
        TreeNode {
            hash,
            key,
            value,
            next: Atomic::null(),
            prev: Atomic::null(),
            parent: Atomic::null(),
            left: Atomic::null(),
            right: Atomic::null(),
            red: AtomicBool::new(false),
        }
    }

    /// Searches the subtree rooted at `from` for `(hash, key)`.
    pub(crate) fn find_tree_node<'g, Q>(
        from: Shared<'g, TreeNode<K, V>>,
        hash: u64,
        key: &Q,
        guard: &'g Guard<'_>,
    ) -> Shared<'g, TreeNode<K, V>>
    where
        K: Borrow<Q>,
        Q: ?Sized + Ord,
    {
        let mut p = from;
        while !p.is_null() {
            // safety: the TreeBin holding these nodes was read under our guard,
            // and tree nodes are only retired through the guard once unlinked.
            let p_deref = unsafe { p.deref() };
            p = match p_deref
                .hash
                .cmp(&hash)
                .then_with(|| p_deref.key.borrow().cmp(key))
            {
                cmp::Ordering::Greater => p_deref.left.load(Ordering::SeqCst, guard),
                cmp::Ordering::Less => p_deref.right.load(Ordering::SeqCst, guard),
                cmp::Ordering::Equal => return p,
            };
        }
        Shared::null()
    }
}

const WRITER: i64 = 1; // set while holding write lock
const WAITER: i64 = 2; // set when waiting for write lock
const READER: i64 = 4; // increment value for setting read lock

enum Dir {
    Left,
    Right,
}

/// The head of a bin that has been converted into a red-black tree.
///
/// Writers serialize on `lock` like they do on a chain head. On top of that,
/// `lock_state` is a small read-write lock around the tree *shape*: readers
/// that cannot get it walk the `first` list instead, and a writer that must
/// rebalance parks in `waiter` until the last reader leaves.
#[derive(Debug)]
pub(crate) struct TreeBin<K, V> {
    pub(crate) root: Atomic<TreeNode<K, V>>,
    pub(crate) first: Atomic<TreeNode<K, V>>,
    pub(crate) waiter: Atomic<Thread>,
    pub(crate) lock: Mutex<()>,
    pub(crate) lock_state: AtomicI64,
    len: AtomicUsize,
}

impl<K, V> TreeBin<K, V>
where
    K: Ord,
{
    /// Builds a tree out of the list of tree nodes starting at `first`.
    pub(crate) fn new(first: Shared<'_, TreeNode<K, V>>, guard: &Guard<'_>) -> Self {
        let mut root = Shared::null();
        let mut len = 0;
        let mut x = first;
        while !x.is_null() {
            len += 1;
            let x_deref = unsafe { x.deref() };
            let next = x_deref.next.load(Ordering::Relaxed, guard);
            x_deref.left.store(Shared::null(), Ordering::Relaxed);
            x_deref.right.store(Shared::null(), Ordering::Relaxed);

            if root.is_null() {
                x_deref.parent.store(Shared::null(), Ordering::Relaxed);
                x_deref.red.store(false, Ordering::Relaxed);
                root = x;
                x = next;
                continue;
            }

            let mut p = root;
            loop {
                let p_deref = unsafe { p.deref() };
                let xp = p;
                let dir;
                p = match p_deref
                    .hash
                    .cmp(&x_deref.hash)
                    .then_with(|| p_deref.key.cmp(&x_deref.key))
                {
                    cmp::Ordering::Greater => {
                        dir = Dir::Left;
                        &p_deref.left
                    }
                    cmp::Ordering::Less => {
                        dir = Dir::Right;
                        &p_deref.right
                    }
                    cmp::Ordering::Equal => unreachable!("one key references two nodes"),
                }
                .load(Ordering::Relaxed, guard);

                if p.is_null() {
                    x_deref.parent.store(xp, Ordering::Relaxed);
                    let xp_deref = unsafe { xp.deref() };
                    match dir {
                        Dir::Left => xp_deref.left.store(x, Ordering::Relaxed),
                        Dir::Right => xp_deref.right.store(x, Ordering::Relaxed),
                    }
                    root = TreeNode::balance_insertion(root, x, guard);
                    break;
                }
            }

            x = next;
        }

        if cfg!(debug_assertions) {
            TreeNode::check_invariants(root, guard);
        }
        TreeBin {
            root: Atomic::from(root),
            first: Atomic::from(first),
            waiter: Atomic::null(),
            lock: Mutex::new(()),
            lock_state: AtomicI64::new(0),
            len: AtomicUsize::new(len),
        }
    }

    /// Finds the node for `key`, or inserts a new node holding `value` at the
    /// front of the list. Returns the existing node, or null if one was
    /// inserted.
    ///
    /// Must be called with `self.lock` held.
    pub(crate) fn find_or_put_tree_val<'g>(
        &'g self,
        hash: u64,
        key: K,
        value: Shared<'g, V>,
        guard: &'g Guard<'_>,
    ) -> Shared<'g, TreeNode<K, V>> {
        let mut p = self.root.load(Ordering::SeqCst, guard);
        if p.is_null() {
            let tree_node = Shared::boxed(TreeNode::new(hash, key, Atomic::from(value)), guard);
            self.root.store(tree_node, Ordering::Release);
            self.first.store(tree_node, Ordering::Release);
            self.len.store(1, Ordering::Relaxed);
            return Shared::null();
        }

        loop {
            let p_deref = unsafe { p.deref() };
            let xp = p;
            let dir;
            p = match p_deref.hash.cmp(&hash).then_with(|| p_deref.key.cmp(&key)) {
                cmp::Ordering::Greater => {
                    dir = Dir::Left;
                    &p_deref.left
                }
                cmp::Ordering::Less => {
                    dir = Dir::Right;
                    &p_deref.right
                }
                cmp::Ordering::Equal => return p,
            }
            .load(Ordering::SeqCst, guard);

            if p.is_null() {
                // reached a leaf: the key is not in the tree and belongs here
                let first = self.first.load(Ordering::SeqCst, guard);
                let node = TreeNode::new(hash, key, Atomic::from(value));
                node.next.store(first, Ordering::Relaxed);
                node.parent.store(xp, Ordering::Relaxed);
                let x = Shared::boxed(node, guard);

                self.first.store(x, Ordering::SeqCst);
                if !first.is_null() {
                    unsafe { first.deref() }.prev.store(x, Ordering::SeqCst);
                }
                let xp_deref = unsafe { xp.deref() };
                match dir {
                    Dir::Left => xp_deref.left.store(x, Ordering::SeqCst),
                    Dir::Right => xp_deref.right.store(x, Ordering::SeqCst),
                }

                if !xp_deref.red.load(Ordering::SeqCst) {
                    unsafe { x.deref() }.red.store(true, Ordering::SeqCst);
                } else {
                    self.lock_root(guard);
                    self.root.store(
                        TreeNode::balance_insertion(
                            self.root.load(Ordering::Relaxed, guard),
                            x,
                            guard,
                        ),
                        Ordering::Relaxed,
                    );
                    self.unlock_root();
                }
                break;
            }
        }

        self.len.fetch_add(1, Ordering::Relaxed);
        if cfg!(debug_assertions) {
            TreeNode::check_invariants(self.root.load(Ordering::SeqCst, guard), guard);
        }
        Shared::null()
    }
}

impl<K, V> TreeBin<K, V> {
    /// Number of nodes in this bin.
    pub(crate) fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    fn lock_root(&self, guard: &Guard<'_>) {
        if self
            .lock_state
            .compare_exchange(0, WRITER, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            self.contended_lock(guard);
        }
    }

    fn unlock_root(&self) {
        self.lock_state.store(0, Ordering::Release);
    }

    fn contended_lock(&self, guard: &Guard<'_>) {
        let mut waiting = false;
        loop {
            let state = self.lock_state.load(Ordering::Acquire);
            if state & !WAITER == 0 {
                // no readers and no writer
                if self
                    .lock_state
                    .compare_exchange(state, WRITER, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    if waiting {
                        let waiter = self.waiter.swap(Shared::null(), Ordering::SeqCst, guard);
                        // safety: the handle was unlinked above and readers
                        // only touch it under the guard they loaded it with
                        unsafe { guard.retire(waiter) };
                    }
                    return;
                }
            } else if state & WAITER == 0 {
                if self
                    .lock_state
                    .compare_exchange(state, state | WAITER, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    waiting = true;
                    let me = Shared::boxed(current(), guard);
                    let waiter = self.waiter.swap(me, Ordering::SeqCst, guard);
                    assert!(waiter.is_null());
                }
            } else if waiting {
                park();
            }
            std::hint::spin_loop();
        }
    }

    /// Looks up `(hash, key)` without blocking.
    ///
    /// If a writer holds or waits for the tree, the lookup walks the `first`
    /// list instead of the tree.
    pub(crate) fn find<'g, Q>(
        &'g self,
        hash: u64,
        key: &Q,
        guard: &'g Guard<'_>,
    ) -> Shared<'g, TreeNode<K, V>>
    where
        K: Borrow<Q>,
        Q: ?Sized + Ord,
    {
        let mut element = self.first.load(Ordering::SeqCst, guard);
        while !element.is_null() {
            let s = self.lock_state.load(Ordering::SeqCst);
            if s & (WAITER | WRITER) != 0 {
                let element_deref = unsafe { element.deref() };
                if element_deref.hash == hash && element_deref.key.borrow() == key {
                    return element;
                }
                element = element_deref.next.load(Ordering::SeqCst, guard);
            } else if self
                .lock_state
                .compare_exchange(s, s + READER, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                let root = self.root.load(Ordering::SeqCst, guard);
                let p = TreeNode::find_tree_node(root, hash, key, guard);
                if self.lock_state.fetch_add(-READER, Ordering::SeqCst) == (READER | WAITER) {
                    // last reader out wakes the parked writer
                    let waiter = self.waiter.load(Ordering::SeqCst, guard);
                    // safety: the writer retires its handle only after it got
                    // the lock, which cannot have happened yet
                    if let Some(waiter) = unsafe { waiter.as_ref() } {
                        waiter.unpark();
                    }
                }
                return p;
            }
        }

        Shared::null()
    }

    /// Unlinks `p` from this bin.
    ///
    /// Returns `true` if the bin is now small enough (fewer than
    /// `untreeify_threshold` nodes) that the caller should replace it with a
    /// chain, in which case the tree itself is left unbalanced. The caller is
    /// responsible for retiring `p` and its value.
    ///
    /// # Safety
    ///
    /// Must be called with `self.lock` held, and `p` must belong to this bin.
    pub(crate) unsafe fn remove_tree_node<'g>(
        &'g self,
        p: Shared<'g, TreeNode<K, V>>,
        untreeify_threshold: usize,
        guard: &'g Guard<'_>,
    ) -> bool {
        let p_deref = p.deref();
        let next = p_deref.next.load(Ordering::SeqCst, guard);
        let prev = p_deref.prev.load(Ordering::SeqCst, guard);

        if prev.is_null() {
            self.first.store(next, Ordering::SeqCst);
        } else {
            prev.deref().next.store(next, Ordering::SeqCst);
        }
        if !next.is_null() {
            next.deref().prev.store(prev, Ordering::SeqCst);
        }
        let len = self.len.fetch_sub(1, Ordering::Relaxed) - 1;

        if self.first.load(Ordering::SeqCst, guard).is_null() {
            // that was the last node
            self.root.store(Shared::null(), Ordering::SeqCst);
            return true;
        }
        if len < untreeify_threshold {
            return true;
        }

        self.lock_root(guard);

        let mut root = self.root.load(Ordering::Relaxed, guard);
        let replacement;
        let p_left = p_deref.left.load(Ordering::Relaxed, guard);
        let p_right = p_deref.right.load(Ordering::Relaxed, guard);
        if !p_left.is_null() && !p_right.is_null() {
            // swap `p` with its in-order successor, then delete from there
            let mut successor = p_right;
            let mut successor_deref = successor.deref();
            let mut successor_left = successor_deref.left.load(Ordering::Relaxed, guard);
            while !successor_left.is_null() {
                successor = successor_left;
                successor_deref = successor.deref();
                successor_left = successor_deref.left.load(Ordering::Relaxed, guard);
            }
            let color = successor_deref.red.load(Ordering::Relaxed);
            successor_deref
                .red
                .store(p_deref.red.load(Ordering::Relaxed), Ordering::Relaxed);
            p_deref.red.store(color, Ordering::Relaxed);

            let successor_right = successor_deref.right.load(Ordering::Relaxed, guard);
            let p_parent = p_deref.parent.load(Ordering::Relaxed, guard);
            if successor == p_right {
                // `p` is the successor's direct parent
                p_deref.parent.store(successor, Ordering::Relaxed);
                successor_deref.right.store(p, Ordering::Relaxed);
            } else {
                let successor_parent = successor_deref.parent.load(Ordering::Relaxed, guard);
                p_deref.parent.store(successor_parent, Ordering::Relaxed);
                if !successor_parent.is_null() {
                    let sp = successor_parent.deref();
                    if successor == sp.left.load(Ordering::Relaxed, guard) {
                        sp.left.store(p, Ordering::Relaxed);
                    } else {
                        sp.right.store(p, Ordering::Relaxed);
                    }
                }
                successor_deref.right.store(p_right, Ordering::Relaxed);
                if !p_right.is_null() {
                    p_right.deref().parent.store(successor, Ordering::Relaxed);
                }
            }
            debug_assert!(successor_left.is_null());
            p_deref.left.store(Shared::null(), Ordering::Relaxed);
            p_deref.right.store(successor_right, Ordering::Relaxed);
            if !successor_right.is_null() {
                successor_right.deref().parent.store(p, Ordering::Relaxed);
            }
            successor_deref.left.store(p_left, Ordering::Relaxed);
            if !p_left.is_null() {
                p_left.deref().parent.store(successor, Ordering::Relaxed);
            }
            successor_deref.parent.store(p_parent, Ordering::Relaxed);
            if p_parent.is_null() {
                root = successor;
            } else {
                let pp = p_parent.deref();
                if p == pp.left.load(Ordering::Relaxed, guard) {
                    pp.left.store(successor, Ordering::Relaxed);
                } else {
                    pp.right.store(successor, Ordering::Relaxed);
                }
            }

            replacement = if successor_right.is_null() {
                p
            } else {
                successor_right
            };
        } else if !p_left.is_null() {
            replacement = p_left;
        } else if !p_right.is_null() {
            replacement = p_right;
        } else {
            replacement = p;
        }

        if replacement != p {
            let p_parent = p_deref.parent.load(Ordering::Relaxed, guard);
            replacement.deref().parent.store(p_parent, Ordering::Relaxed);
            if p_parent.is_null() {
                root = replacement;
            } else {
                let pp = p_parent.deref();
                if p == pp.left.load(Ordering::Relaxed, guard) {
                    pp.left.store(replacement, Ordering::Relaxed);
                } else {
                    pp.right.store(replacement, Ordering::Relaxed);
                }
            }
            p_deref.parent.store(Shared::null(), Ordering::Relaxed);
            p_deref.right.store(Shared::null(), Ordering::Relaxed);
            p_deref.left.store(Shared::null(), Ordering::Relaxed);
        }

        self.root.store(
            if p_deref.red.load(Ordering::Relaxed) {
                root
            } else {
                TreeNode::balance_deletion(root, replacement, guard)
            },
            Ordering::Relaxed,
        );

        if p == replacement {
            // `p` is a leaf, detach it from its parent
            let p_parent = p_deref.parent.load(Ordering::Relaxed, guard);
            if !p_parent.is_null() {
                let pp = p_parent.deref();
                if p == pp.left.load(Ordering::Relaxed, guard) {
                    pp.left.store(Shared::null(), Ordering::Relaxed);
                } else if p == pp.right.load(Ordering::Relaxed, guard) {
                    pp.right.store(Shared::null(), Ordering::Relaxed);
                }
                p_deref.parent.store(Shared::null(), Ordering::Relaxed);
            }
        }
        self.unlock_root();

        if cfg!(debug_assertions) {
            TreeNode::check_invariants(self.root.load(Ordering::SeqCst, guard), guard);
        }
        false
    }
}

impl<K, V> Drop for TreeBin<K, V> {
    fn drop(&mut self) {
        // safety: we have &mut self, so no one else can reach the nodes
        unsafe { self.drop_fields(true) };
    }
}

impl<K, V> TreeBin<K, V> {
    /// Retires a `BinEntry::Tree` whose values now live in other nodes.
    ///
    /// # Safety
    ///
    /// `bin` must point to a `BinEntry::Tree` that is no longer reachable from
    /// any table, and must not be retired twice.
    pub(crate) unsafe fn retire_without_values(
        bin: Shared<'_, BinEntry<K, V>>,
        guard: &Guard<'_>,
    ) {
        guard.retire_with(bin, drop_tree_bin_without_values::<K, V>);
    }

    /// Frees all nodes of this bin, and their values if `drop_values`.
    ///
    /// # Safety
    ///
    /// No other thread may be able to reach the nodes.
    pub(crate) unsafe fn drop_fields(&mut self, drop_values: bool) {
        let guard = Guard::unprotected();
        let p = self.first.swap(Shared::null(), Ordering::Relaxed, &guard);
        Self::drop_tree_nodes(p, drop_values, &guard);
        let waiter = self.waiter.swap(Shared::null(), Ordering::Relaxed, &guard);
        if !waiter.is_null() {
            drop(waiter.into_box());
        }
    }

    /// Frees the list of tree nodes starting at `from`.
    ///
    /// # Safety
    ///
    /// No other thread may be able to reach the nodes.
    pub(crate) unsafe fn drop_tree_nodes<'g>(
        from: Shared<'g, TreeNode<K, V>>,
        drop_values: bool,
        guard: &'g Guard<'_>,
    ) {
        let mut p = from;
        while !p.is_null() {
            let tree_node = p.into_box();
            if drop_values {
                drop(tree_node.value.load(Ordering::Relaxed, guard).into_box());
            }
            p = tree_node.next.load(Ordering::Relaxed, guard);
        }
    }
}

unsafe fn drop_tree_bin_without_values<K, V>(ptr: *mut ()) {
    match *Box::from_raw(ptr as *mut BinEntry<K, V>) {
        BinEntry::Tree(mut tree_bin) => tree_bin.drop_fields(false),
        _ => unreachable!("only tree bins are retired without their values"),
    }
}

macro_rules! tree_node {
    ($pointer:ident) => {
        unsafe { $pointer.deref() }
    };
}

// Red-black tree methods, all adapted from CLR
impl<K, V> TreeNode<K, V> {
    fn rotate_left<'g>(
        mut root: Shared<'g, TreeNode<K, V>>,
        p: Shared<'g, TreeNode<K, V>>,
        guard: &'g Guard<'_>,
    ) -> Shared<'g, TreeNode<K, V>> {
        if p.is_null() {
            return root;
        }
        let p_deref = tree_node!(p);
        let right = p_deref.right.load(Ordering::Relaxed, guard);
        if right.is_null() {
            return root;
        }
        let right_deref = tree_node!(right);
        let right_left = right_deref.left.load(Ordering::Relaxed, guard);
        p_deref.right.store(right_left, Ordering::Relaxed);
        if !right_left.is_null() {
            tree_node!(right_left).parent.store(p, Ordering::Relaxed);
        }

        let p_parent = p_deref.parent.load(Ordering::Relaxed, guard);
        right_deref.parent.store(p_parent, Ordering::Relaxed);
        if p_parent.is_null() {
            root = right;
            right_deref.red.store(false, Ordering::Relaxed);
        } else {
            let p_parent_deref = tree_node!(p_parent);
            if p_parent_deref.left.load(Ordering::Relaxed, guard) == p {
                p_parent_deref.left.store(right, Ordering::Relaxed);
            } else {
                p_parent_deref.right.store(right, Ordering::Relaxed);
            }
        }
        right_deref.left.store(p, Ordering::Relaxed);
        p_deref.parent.store(right, Ordering::Relaxed);

        root
    }

    fn rotate_right<'g>(
        mut root: Shared<'g, TreeNode<K, V>>,
        p: Shared<'g, TreeNode<K, V>>,
        guard: &'g Guard<'_>,
    ) -> Shared<'g, TreeNode<K, V>> {
        if p.is_null() {
            return root;
        }
        let p_deref = tree_node!(p);
        let left = p_deref.left.load(Ordering::Relaxed, guard);
        if left.is_null() {
            return root;
        }
        let left_deref = tree_node!(left);
        let left_right = left_deref.right.load(Ordering::Relaxed, guard);
        p_deref.left.store(left_right, Ordering::Relaxed);
        if !left_right.is_null() {
            tree_node!(left_right).parent.store(p, Ordering::Relaxed);
        }

        let p_parent = p_deref.parent.load(Ordering::Relaxed, guard);
        left_deref.parent.store(p_parent, Ordering::Relaxed);
        if p_parent.is_null() {
            root = left;
            left_deref.red.store(false, Ordering::Relaxed);
        } else {
            let p_parent_deref = tree_node!(p_parent);
            if p_parent_deref.right.load(Ordering::Relaxed, guard) == p {
                p_parent_deref.right.store(left, Ordering::Relaxed);
            } else {
                p_parent_deref.left.store(left, Ordering::Relaxed);
            }
        }
        left_deref.right.store(p, Ordering::Relaxed);
        p_deref.parent.store(left, Ordering::Relaxed);

        root
    }

    fn is_red(p: Shared<'_, TreeNode<K, V>>) -> bool {
        !p.is_null() && tree_node!(p).red.load(Ordering::Relaxed)
    }

    fn parent_of<'g>(p: Shared<'g, TreeNode<K, V>>, guard: &'g Guard<'_>) -> Shared<'g, TreeNode<K, V>> {
        if p.is_null() {
            Shared::null()
        } else {
            tree_node!(p).parent.load(Ordering::Relaxed, guard)
        }
    }

    fn balance_insertion<'g>(
        mut root: Shared<'g, TreeNode<K, V>>,
        mut x: Shared<'g, TreeNode<K, V>>,
        guard: &'g Guard<'_>,
    ) -> Shared<'g, TreeNode<K, V>> {
        tree_node!(x).red.store(true, Ordering::Relaxed);

        loop {
            let mut x_parent = tree_node!(x).parent.load(Ordering::Relaxed, guard);
            if x_parent.is_null() {
                tree_node!(x).red.store(false, Ordering::Relaxed);
                return x;
            }
            let mut x_grandparent = tree_node!(x_parent).parent.load(Ordering::Relaxed, guard);
            if !Self::is_red(x_parent) || x_grandparent.is_null() {
                return root;
            }
            let x_uncle;
            let grandparent_left = tree_node!(x_grandparent).left.load(Ordering::Relaxed, guard);
            if x_parent == grandparent_left {
                x_uncle = tree_node!(x_grandparent).right.load(Ordering::Relaxed, guard);
                if Self::is_red(x_uncle) {
                    tree_node!(x_uncle).red.store(false, Ordering::Relaxed);
                    tree_node!(x_parent).red.store(false, Ordering::Relaxed);
                    tree_node!(x_grandparent).red.store(true, Ordering::Relaxed);
                    x = x_grandparent;
                    continue;
                }
                if x == tree_node!(x_parent).right.load(Ordering::Relaxed, guard) {
                    x = x_parent;
                    root = Self::rotate_left(root, x, guard);
                    x_parent = Self::parent_of(x, guard);
                    x_grandparent = Self::parent_of(x_parent, guard);
                }
                if !x_parent.is_null() {
                    tree_node!(x_parent).red.store(false, Ordering::Relaxed);
                    if !x_grandparent.is_null() {
                        tree_node!(x_grandparent).red.store(true, Ordering::Relaxed);
                        root = Self::rotate_right(root, x_grandparent, guard);
                    }
                }
            } else {
                x_uncle = grandparent_left;
                if Self::is_red(x_uncle) {
                    tree_node!(x_uncle).red.store(false, Ordering::Relaxed);
                    tree_node!(x_parent).red.store(false, Ordering::Relaxed);
                    tree_node!(x_grandparent).red.store(true, Ordering::Relaxed);
                    x = x_grandparent;
                    continue;
                }
                if x == tree_node!(x_parent).left.load(Ordering::Relaxed, guard) {
                    x = x_parent;
                    root = Self::rotate_right(root, x, guard);
                    x_parent = Self::parent_of(x, guard);
                    x_grandparent = Self::parent_of(x_parent, guard);
                }
                if !x_parent.is_null() {
                    tree_node!(x_parent).red.store(false, Ordering::Relaxed);
                    if !x_grandparent.is_null() {
                        tree_node!(x_grandparent).red.store(true, Ordering::Relaxed);
                        root = Self::rotate_left(root, x_grandparent, guard);
                    }
                }
            }
        }
    }

    fn balance_deletion<'g>(
        mut root: Shared<'g, TreeNode<K, V>>,
        mut x: Shared<'g, TreeNode<K, V>>,
        guard: &'g Guard<'_>,
    ) -> Shared<'g, TreeNode<K, V>> {
        loop {
            if x.is_null() || x == root {
                return root;
            }
            let mut x_parent = tree_node!(x).parent.load(Ordering::Relaxed, guard);
            if x_parent.is_null() {
                tree_node!(x).red.store(false, Ordering::Relaxed);
                return x;
            } else if Self::is_red(x) {
                tree_node!(x).red.store(false, Ordering::Relaxed);
                return root;
            }

            let x_parent_left = tree_node!(x_parent).left.load(Ordering::Relaxed, guard);
            if x_parent_left == x {
                let mut sibling = tree_node!(x_parent).right.load(Ordering::Relaxed, guard);
                if Self::is_red(sibling) {
                    tree_node!(sibling).red.store(false, Ordering::Relaxed);
                    tree_node!(x_parent).red.store(true, Ordering::Relaxed);
                    root = Self::rotate_left(root, x_parent, guard);
                    x_parent = Self::parent_of(x, guard);
                    sibling = if x_parent.is_null() {
                        Shared::null()
                    } else {
                        tree_node!(x_parent).right.load(Ordering::Relaxed, guard)
                    };
                }
                if sibling.is_null() {
                    x = x_parent;
                    continue;
                }
                let s_left = tree_node!(sibling).left.load(Ordering::Relaxed, guard);
                let mut s_right = tree_node!(sibling).right.load(Ordering::Relaxed, guard);
                if !Self::is_red(s_right) && !Self::is_red(s_left) {
                    tree_node!(sibling).red.store(true, Ordering::Relaxed);
                    x = x_parent;
                    continue;
                }
                if !Self::is_red(s_right) {
                    if !s_left.is_null() {
                        tree_node!(s_left).red.store(false, Ordering::Relaxed);
                    }
                    tree_node!(sibling).red.store(true, Ordering::Relaxed);
                    root = Self::rotate_right(root, sibling, guard);
                    x_parent = Self::parent_of(x, guard);
                    sibling = if x_parent.is_null() {
                        Shared::null()
                    } else {
                        tree_node!(x_parent).right.load(Ordering::Relaxed, guard)
                    };
                }
                if !sibling.is_null() {
                    tree_node!(sibling)
                        .red
                        .store(Self::is_red(x_parent), Ordering::Relaxed);
                    s_right = tree_node!(sibling).right.load(Ordering::Relaxed, guard);
                    if !s_right.is_null() {
                        tree_node!(s_right).red.store(false, Ordering::Relaxed);
                    }
                }
                if !x_parent.is_null() {
                    tree_node!(x_parent).red.store(false, Ordering::Relaxed);
                    root = Self::rotate_left(root, x_parent, guard);
                }
                x = root;
            } else {
                let mut sibling = x_parent_left;
                if Self::is_red(sibling) {
                    tree_node!(sibling).red.store(false, Ordering::Relaxed);
                    tree_node!(x_parent).red.store(true, Ordering::Relaxed);
                    root = Self::rotate_right(root, x_parent, guard);
                    x_parent = Self::parent_of(x, guard);
                    sibling = if x_parent.is_null() {
                        Shared::null()
                    } else {
                        tree_node!(x_parent).left.load(Ordering::Relaxed, guard)
                    };
                }
                if sibling.is_null() {
                    x = x_parent;
                    continue;
                }
                let mut s_left = tree_node!(sibling).left.load(Ordering::Relaxed, guard);
                let s_right = tree_node!(sibling).right.load(Ordering::Relaxed, guard);
                if !Self::is_red(s_left) && !Self::is_red(s_right) {
                    tree_node!(sibling).red.store(true, Ordering::Relaxed);
                    x = x_parent;
                    continue;
                }
                if !Self::is_red(s_left) {
                    if !s_right.is_null() {
                        tree_node!(s_right).red.store(false, Ordering::Relaxed);
                    }
                    tree_node!(sibling).red.store(true, Ordering::Relaxed);
                    root = Self::rotate_left(root, sibling, guard);
                    x_parent = Self::parent_of(x, guard);
                    sibling = if x_parent.is_null() {
                        Shared::null()
                    } else {
                        tree_node!(x_parent).left.load(Ordering::Relaxed, guard)
                    };
                }
                if !sibling.is_null() {
                    tree_node!(sibling)
                        .red
                        .store(Self::is_red(x_parent), Ordering::Relaxed);
                    s_left = tree_node!(sibling).left.load(Ordering::Relaxed, guard);
                    if !s_left.is_null() {
                        tree_node!(s_left).red.store(false, Ordering::Relaxed);
                    }
                }
                if !x_parent.is_null() {
                    tree_node!(x_parent).red.store(false, Ordering::Relaxed);
                    root = Self::rotate_right(root, x_parent, guard);
                }
                x = root;
            }
        }
    }

    /// Panics if the tree or list rooted at `t` is malformed.
    fn check_invariants<'g>(t: Shared<'g, TreeNode<K, V>>, guard: &'g Guard<'_>) {
        if t.is_null() {
            return;
        }
        let t_deref = tree_node!(t);
        let t_parent = t_deref.parent.load(Ordering::Relaxed, guard);
        let t_left = t_deref.left.load(Ordering::Relaxed, guard);
        let t_right = t_deref.right.load(Ordering::Relaxed, guard);
        let t_back = t_deref.prev.load(Ordering::Relaxed, guard);
        let t_next = t_deref.next.load(Ordering::Relaxed, guard);

        if !t_back.is_null() {
            assert_eq!(
                tree_node!(t_back).next.load(Ordering::Relaxed, guard),
                t,
                "a tree node's `prev` does not point back to it"
            );
        }
        if !t_next.is_null() {
            assert_eq!(
                tree_node!(t_next).prev.load(Ordering::Relaxed, guard),
                t,
                "a tree node's `next` does not point back to it"
            );
        }
        if !t_parent.is_null() {
            let t_parent_deref = tree_node!(t_parent);
            assert!(
                t_parent_deref.left.load(Ordering::Relaxed, guard) == t
                    || t_parent_deref.right.load(Ordering::Relaxed, guard) == t,
                "a tree node's parent does not have it as a child"
            );
        }
        if !t_left.is_null() {
            let t_left_deref = tree_node!(t_left);
            assert_eq!(t_left_deref.parent.load(Ordering::Relaxed, guard), t);
            assert!(t_left_deref.hash <= t_deref.hash, "left child hashes higher");
        }
        if !t_right.is_null() {
            let t_right_deref = tree_node!(t_right);
            assert_eq!(t_right_deref.parent.load(Ordering::Relaxed, guard), t);
            assert!(t_right_deref.hash >= t_deref.hash, "right child hashes lower");
        }
        if t_deref.red.load(Ordering::Relaxed) {
            assert!(
                !(Self::is_red(t_left) && Self::is_red(t_right)),
                "a red tree node has two red children"
            );
        }
        Self::check_invariants(t_left, guard);
        Self::check_invariants(t_right, guard);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_tree_bin(entries: &[(u64, u32)], guard: &Guard<'_>) -> TreeBin<u32, u32> {
        let mut head = Shared::null();
        let mut tail: Shared<'_, TreeNode<u32, u32>> = Shared::null();
        for &(hash, key) in entries {
            let node = TreeNode::new(hash, key, Atomic::from(Shared::boxed(key * 10, guard)));
            node.prev.store(tail, Ordering::Relaxed);
            let node = Shared::boxed(node, guard);
            if tail.is_null() {
                head = node;
            } else {
                unsafe { tail.deref() }.next.store(node, Ordering::Relaxed);
            }
            tail = node;
        }
        TreeBin::new(head, guard)
    }

    fn value_of(node: Shared<'_, TreeNode<u32, u32>>, guard: &Guard<'_>) -> Option<u32> {
        unsafe { node.as_ref() }.map(|n| unsafe { *n.value.load(Ordering::SeqCst, guard).deref() })
    }

    #[test]
    fn builds_balanced_tree_from_list() {
        let guard = unsafe { Guard::unprotected() };
        let entries: Vec<_> = (0..32).map(|k| (u64::from(k % 4), k)).collect();
        let bin = new_tree_bin(&entries, &guard);
        assert_eq!(bin.len(), 32);
        TreeNode::check_invariants(bin.root.load(Ordering::SeqCst, &guard), &guard);
        for &(hash, key) in &entries {
            assert_eq!(value_of(bin.find(hash, &key, &guard), &guard), Some(key * 10));
        }
        assert!(bin.find(0, &1, &guard).is_null());
    }

    #[test]
    fn find_or_put_returns_existing() {
        let guard = unsafe { Guard::unprotected() };
        let bin = new_tree_bin(&[(7, 1), (7, 2), (7, 3)], &guard);

        let value = Shared::boxed(40, &guard);
        assert!(bin.find_or_put_tree_val(7, 4, value, &guard).is_null());
        assert_eq!(bin.len(), 4);
        assert_eq!(bin.first.load(Ordering::SeqCst, &guard), bin.find(7, &4, &guard));

        let dup = Shared::boxed(99, &guard);
        let existing = bin.find_or_put_tree_val(7, 2, dup, &guard);
        assert_eq!(value_of(existing, &guard), Some(20));
        assert_eq!(bin.len(), 4);
        unsafe { drop(dup.into_box()) };
    }

    #[test]
    fn remove_reports_when_small() {
        let guard = unsafe { Guard::unprotected() };
        let entries: Vec<_> = (0..10).map(|k| (5, k)).collect();
        let bin = new_tree_bin(&entries, &guard);

        for k in 0..4 {
            let p = bin.find(5, &k, &guard);
            assert!(!unsafe { bin.remove_tree_node(p, 6, &guard) });
            unsafe { drop(p.deref().value.load(Ordering::SeqCst, &guard).into_box()) };
            unsafe { drop(p.into_box()) };
            TreeNode::check_invariants(bin.root.load(Ordering::SeqCst, &guard), &guard);
        }
        assert_eq!(bin.len(), 6);

        let p = bin.find(5, &4, &guard);
        assert!(unsafe { bin.remove_tree_node(p, 6, &guard) });
        assert_eq!(bin.len(), 5);
        // the tree shape is stale now, but the list no longer holds the node
        let mut e = bin.first.load(Ordering::SeqCst, &guard);
        while !e.is_null() {
            assert_ne!(e, p);
            e = unsafe { e.deref() }.next.load(Ordering::SeqCst, &guard);
        }
        unsafe { drop(p.deref().value.load(Ordering::SeqCst, &guard).into_box()) };
        unsafe { drop(p.into_box()) };
    }
}
