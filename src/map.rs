use crate::config::MapConfig;
use crate::error::{ConfigError, TryInsertError};
use crate::node::*;
use crate::raw::*;
use crate::reclaim::{Atomic, Collector, Guard, Shared};
use crossbeam_utils::Backoff;
use log::{debug, trace, warn};
use std::borrow::Borrow;
use std::fmt::{self, Debug, Formatter};
use std::hash::{BuildHasher, Hash, Hasher};
use std::ptr;
use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};
use std::sync::Once;

const ISIZE_BITS: usize = core::mem::size_of::<isize>() * 8;

/// The largest possible table capacity, in bins.
pub(crate) const MAXIMUM_CAPACITY: usize = 1 << 30;

/// Number of bins allocated for a map created without a capacity.
const DEFAULT_CAPACITY: usize = 16;

/// Smallest table for which bins may be converted into trees. Below it, a long
/// chain grows the table instead.
const MIN_TREEIFY_CAPACITY: usize = 64;

/// Minimum number of bins a resizing thread claims at a time.
const MIN_TRANSFER_STRIDE: isize = 16;

const RESIZE_STAMP_BITS: usize = ISIZE_BITS / 2;

const MAX_RESIZERS: isize = (1 << (ISIZE_BITS - RESIZE_STAMP_BITS)) - 1;

const RESIZE_STAMP_SHIFT: usize = ISIZE_BITS - RESIZE_STAMP_BITS;

static NCPU_INITIALIZER: Once = Once::new();
static NCPU: AtomicUsize = AtomicUsize::new(0);

/// A concurrent hash map.
///
/// Every operation takes a [`Guard`] obtained from [`HashMap::guard`].
/// References handed out by the map stay valid for as long as that guard is
/// held, even if the entry is concurrently replaced or removed.
///
/// Bins start out as linked chains guarded by a lock in their head node. A
/// chain that grows past [`MapConfig::treeify_threshold`] in a table of at
/// least 64 bins is converted into a red-black tree. The table doubles when it
/// is filled to [`MapConfig::load_factor`]; all threads that touch the map
/// while a resize is under way help move bins into the new table.
pub struct HashMap<K, V, S = crate::DefaultHashBuilder> {
    /// The array of bins. Lazily initialized upon first insertion.
    table: Atomic<Table<K, V>>,

    /// The next table to use; non-null only while resizing.
    next_table: Atomic<Table<K, V>>,

    /// The next bin index (plus one) to split while resizing.
    transfer_index: AtomicIsize,

    count: AtomicIsize,

    /// Table initialization and resizing control. When negative, the table is
    /// being initialized (-1) or resized (stamp plus number of resizers).
    /// Otherwise, the element count at which to resize next.
    size_ctl: AtomicIsize,

    config: MapConfig,

    build_hasher: S,

    // declared last so it is dropped after the table
    collector: Collector,
}

#[derive(Eq, PartialEq, Clone, Debug)]
enum PutResult<'a, T> {
    Inserted {
        new: &'a T,
    },
    Replaced {
        old: &'a T,
        new: &'a T,
    },
    Exists {
        current: &'a T,
        not_inserted: Box<T>,
    },
}

impl<'a, T> PutResult<'a, T> {
    fn before(&self) -> Option<&'a T> {
        match *self {
            PutResult::Inserted { .. } => None,
            PutResult::Replaced { old, .. } => Some(old),
            PutResult::Exists { current, .. } => Some(current),
        }
    }
}

impl<K, V> HashMap<K, V, crate::DefaultHashBuilder> {
    /// Creates an empty map. No table is allocated until the first insert.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a map sized to hold `capacity` entries without resizing.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_capacity_and_hasher(capacity, crate::DefaultHashBuilder::default())
    }

    /// Creates a map tuned by `config`.
    pub fn with_config(config: MapConfig) -> Result<Self, ConfigError> {
        Self::with_config_and_hasher(config, crate::DefaultHashBuilder::default())
    }
}

impl<K, V, S> Default for HashMap<K, V, S>
where
    S: Default,
{
    fn default() -> Self {
        Self::with_hasher(S::default())
    }
}

impl<K, V, S> HashMap<K, V, S> {
    /// Creates an empty map that hashes keys with `hash_builder`.
    pub fn with_hasher(hash_builder: S) -> Self {
        Self::from_parts(MapConfig::default(), hash_builder)
    }

    /// Creates a map that holds `capacity` entries without resizing and
    /// hashes keys with `hash_builder`.
    pub fn with_capacity_and_hasher(capacity: usize, hash_builder: S) -> Self {
        Self::from_parts(
            MapConfig::default().with_initial_capacity(capacity),
            hash_builder,
        )
    }

    /// Creates a map tuned by `config` that hashes keys with `hash_builder`.
    pub fn with_config_and_hasher(config: MapConfig, hash_builder: S) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::from_parts(config, hash_builder))
    }

    fn from_parts(config: MapConfig, hash_builder: S) -> Self {
        let mut map = Self {
            table: Atomic::null(),
            next_table: Atomic::null(),
            transfer_index: AtomicIsize::new(0),
            count: AtomicIsize::new(0),
            size_ctl: AtomicIsize::new(0),
            config,
            build_hasher: hash_builder,
            collector: Collector::new(config.collect_threshold),
        };
        if config.initial_capacity > 0 {
            map.presize(config.initial_capacity);
        }
        map
    }

    /// Pins the current thread in this map's epoch.
    ///
    /// Nothing retired while the returned guard is alive is freed.
    pub fn guard(&self) -> Guard<'_> {
        self.collector.pin()
    }

    #[inline]
    fn check_guard(&self, guard: &Guard<'_>) {
        if let Some(c) = guard.collector() {
            assert!(
                ptr::eq(c, &self.collector),
                "guard belongs to a different map"
            );
        }
    }

    /// The number of entries. Only an estimate while other threads are
    /// writing.
    pub fn len(&self) -> usize {
        let n = self.count.load(Ordering::Relaxed);
        if n < 0 {
            0
        } else {
            n as usize
        }
    }

    /// Whether [`len`](Self::len) is zero.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The number of bins in the current table, or zero if none has been
    /// allocated yet.
    pub fn capacity(&self, guard: &Guard<'_>) -> usize {
        self.check_guard(guard);
        let table = self.table.load(Ordering::Relaxed, guard);
        // safety: tables are retired only after being replaced
        unsafe { table.as_ref() }.map_or(0, Table::len)
    }

    /// The settings this map was built with.
    pub fn config(&self) -> &MapConfig {
        &self.config
    }

    fn resize_stamp(n: usize) -> isize {
        n.leading_zeros() as isize | (1_isize << (RESIZE_STAMP_BITS - 1))
    }

    /// The element count at which a table of `n` bins is resized.
    fn resize_threshold(&self, n: usize) -> isize {
        ((n as f64 * f64::from(self.config.load_factor)) as isize).max(1)
    }

    /// The table capacity needed to hold `size` entries.
    fn table_size_for(&self, size: usize) -> usize {
        let wanted = ((size as f64 / f64::from(self.config.load_factor)) as usize).saturating_add(1);
        if wanted >= MAXIMUM_CAPACITY {
            MAXIMUM_CAPACITY
        } else {
            wanted.next_power_of_two()
        }
    }

    fn init_table<'g>(&'g self, guard: &'g Guard<'_>) -> Shared<'g, Table<K, V>> {
        let backoff = Backoff::new();
        loop {
            let table = self.table.load(Ordering::SeqCst, guard);
            if !table.is_null() {
                break table;
            }
            let mut sc = self.size_ctl.load(Ordering::SeqCst);
            if sc < 0 {
                // lost the initialization race
                backoff.snooze();
                continue;
            }

            if self
                .size_ctl
                .compare_exchange(sc, -1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                let mut table = self.table.load(Ordering::SeqCst, guard);
                if table.is_null() {
                    let n = if sc > 0 {
                        sc as usize
                    } else {
                        DEFAULT_CAPACITY
                    };
                    table = Shared::boxed(Table::new(n), guard);
                    self.table.store(table, Ordering::SeqCst);
                    sc = self.resize_threshold(n);
                }
                self.size_ctl.store(sc, Ordering::SeqCst);
                break table;
            }
        }
    }

    fn presize(&mut self, size: usize) {
        // safety: we have &mut self, so nothing else can see the table
        let guard = unsafe { Guard::unprotected() };

        let requested_capacity = self.table_size_for(size);

        assert_eq!(self.size_ctl.load(Ordering::SeqCst), 0);
        assert!(self.table.load(Ordering::SeqCst, &guard).is_null());

        let new_table = Shared::boxed(Table::new(requested_capacity), &guard);
        self.table.store(new_table, Ordering::SeqCst);

        let new_load_to_resize_at = self.resize_threshold(requested_capacity);
        self.size_ctl.store(new_load_to_resize_at, Ordering::SeqCst);
    }
}

impl<K, V, S> HashMap<K, V, S>
where
    K: Clone + Ord,
{
    /// Grows the table until it can hold `size` entries.
    fn try_presize<'g>(&'g self, size: usize, guard: &'g Guard<'_>) {
        let requested_capacity = self.table_size_for(size);

        loop {
            let size_ctl = self.size_ctl.load(Ordering::SeqCst);
            if size_ctl < 0 {
                break;
            }

            let table = self.table.load(Ordering::SeqCst, guard);
            // safety: tables are retired only after being replaced
            let current_capacity = unsafe { table.as_ref() }.map_or(0, Table::len);

            if current_capacity == 0 {
                let new_capacity = requested_capacity.max(DEFAULT_CAPACITY);

                if self
                    .size_ctl
                    .compare_exchange(size_ctl, -1, Ordering::SeqCst, Ordering::SeqCst)
                    .is_err()
                {
                    continue;
                }

                if self.table.load(Ordering::SeqCst, guard) != table {
                    self.size_ctl.store(size_ctl, Ordering::SeqCst);
                    continue;
                }

                let new_table = Shared::boxed(Table::new(new_capacity), guard);
                let old_table = self.table.swap(new_table, Ordering::SeqCst, guard);
                assert!(old_table.is_null());

                self.size_ctl
                    .store(self.resize_threshold(new_capacity), Ordering::SeqCst);
            } else if requested_capacity <= current_capacity
                || current_capacity >= MAXIMUM_CAPACITY
            {
                break;
            } else if table == self.table.load(Ordering::SeqCst, guard) {
                let rs: isize = Self::resize_stamp(current_capacity) << RESIZE_STAMP_SHIFT;
                if self
                    .size_ctl
                    .compare_exchange(size_ctl, rs + 2, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    self.transfer(table, Shared::null(), guard);
                }
            }
        }
    }

    /// Moves bins from `table` into `next_table`, allocating the latter if it
    /// is null. Returns once this thread can find no more bins to move.
    #[inline(never)]
    fn transfer<'g>(
        &'g self,
        table: Shared<'g, Table<K, V>>,
        mut next_table: Shared<'g, Table<K, V>>,
        guard: &'g Guard<'_>,
    ) {
        // safety: table was read under our guard and is only retired by the
        // last thread to leave this resize
        let n = unsafe { table.deref() }.len();
        let ncpu = num_cpus();

        let stride = if ncpu > 1 { (n >> 3) / ncpu } else { n };
        let stride = std::cmp::max(stride as isize, MIN_TRANSFER_STRIDE);

        if next_table.is_null() {
            debug!("resizing table from {} to {} bins", n, n << 1);
            let table = Shared::boxed(Table::new(n << 1), guard);
            let now_garbage = self.next_table.swap(table, Ordering::SeqCst, guard);
            assert!(now_garbage.is_null());
            self.transfer_index.store(n as isize, Ordering::SeqCst);
            next_table = table;
        }

        // safety: next_table is only retired after it was replaced in turn
        let next_n = unsafe { next_table.deref() }.len();

        let mut advance = true;
        let mut finishing = false;
        let mut i = 0;
        let mut bound = 0;
        loop {
            // claim the next bin, or the next stride of bins
            while advance {
                i -= 1;
                if i >= bound || finishing {
                    advance = false;
                    break;
                }

                let next_index = self.transfer_index.load(Ordering::SeqCst);
                if next_index <= 0 {
                    i = -1;
                    advance = false;
                    break;
                }

                let next_bound = if next_index > stride {
                    next_index - stride
                } else {
                    0
                };
                if self
                    .transfer_index
                    .compare_exchange(next_index, next_bound, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    bound = next_bound;
                    i = next_index;
                    advance = false;
                    break;
                }
            }

            if i < 0 || i as usize >= n || i as usize + n >= next_n {
                if finishing {
                    self.next_table.store(Shared::null(), Ordering::SeqCst);
                    let now_garbage = self.table.swap(next_table, Ordering::SeqCst, guard);
                    // safety: every bin of the old table is now Moved, and
                    // threads still reading it hold guards
                    unsafe { guard.retire(now_garbage) };
                    if next_n >= MAXIMUM_CAPACITY {
                        warn!(
                            "table reached its maximum capacity of {} bins and will not grow further",
                            next_n
                        );
                        self.size_ctl.store(isize::MAX, Ordering::SeqCst);
                    } else {
                        self.size_ctl
                            .store(self.resize_threshold(next_n), Ordering::SeqCst);
                    }
                    debug!("resized table from {} to {} bins", n, next_n);
                    return;
                }

                let sc = self.size_ctl.load(Ordering::SeqCst);
                if self
                    .size_ctl
                    .compare_exchange(sc, sc - 1, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    if (sc - 2) != Self::resize_stamp(n) << RESIZE_STAMP_SHIFT {
                        // someone else is still transferring
                        return;
                    }

                    // we are the last resizer; recheck every bin before committing
                    finishing = true;
                    advance = true;
                    i = n as isize;
                }

                continue;
            }
            let i = i as usize;

            // safety: see above
            let table = unsafe { table.deref() };

            let bin = table.bin(i, guard);
            if bin.is_null() {
                advance = table
                    .cas_bin(i, Shared::null(), table.get_moved(next_table, guard), guard)
                    .is_ok();
                continue;
            }
            // safety: see above
            let next_table_ref = unsafe { next_table.deref() };

            // safety: bins are retired only after being unlinked
            match *unsafe { bin.deref() } {
                BinEntry::Moved => {
                    // already processed
                    advance = true;
                }
                BinEntry::Node(ref head) => {
                    let head_lock = head.lock.lock();

                    // another thread may have transferred or removed this
                    // head while we waited for the lock
                    if table.bin(i, guard) != bin {
                        continue;
                    }

                    // nodes after `last_run` all go to the same side and are
                    // reused as-is
                    let mut run_bit = head.hash & n as u64;
                    let mut last_run = bin;
                    let mut p = bin;
                    loop {
                        let node = unsafe { chain_node(p) };
                        let next = node.next.load(Ordering::SeqCst, guard);

                        let b = node.hash & n as u64;
                        if b != run_bit {
                            run_bit = b;
                            last_run = p;
                        }

                        if next.is_null() {
                            break;
                        }
                        p = next;
                    }

                    let mut low_bin = Shared::null();
                    let mut high_bin = Shared::null();
                    if run_bit == 0 {
                        low_bin = last_run;
                    } else {
                        high_bin = last_run;
                    }

                    p = bin;
                    while p != last_run {
                        let node = unsafe { chain_node(p) };

                        let link = if node.hash & n as u64 == 0 {
                            &mut low_bin
                        } else {
                            &mut high_bin
                        };

                        *link = Shared::boxed(
                            BinEntry::Node(Node::with_next(
                                node.hash,
                                node.key.clone(),
                                Atomic::from(node.value.load(Ordering::SeqCst, guard)),
                                Atomic::from(*link),
                            )),
                            guard,
                        );

                        p = node.next.load(Ordering::SeqCst, guard);
                    }

                    next_table_ref.store_bin(i, low_bin);
                    next_table_ref.store_bin(i + n, high_bin);
                    table.store_bin(i, table.get_moved(next_table, guard));

                    // the copied nodes are unreachable now; their values live on
                    p = bin;
                    while p != last_run {
                        let next = unsafe { chain_node(p) }.next.load(Ordering::SeqCst, guard);
                        unsafe { guard.retire(p) };
                        p = next;
                    }

                    advance = true;

                    drop(head_lock);
                }
                BinEntry::Tree(ref tree_bin) => {
                    let bin_lock = tree_bin.lock.lock();

                    if table.bin(i, guard) != bin {
                        continue;
                    }

                    let mut low = Shared::null();
                    let mut low_tail = Shared::null();
                    let mut high = Shared::null();
                    let mut high_tail = Shared::null();
                    let mut low_count = 0;
                    let mut high_count = 0;
                    let mut e = tree_bin.first.load(Ordering::Relaxed, guard);
                    while !e.is_null() {
                        let tree_node = unsafe { e.deref() };
                        let new_node = TreeNode::new(
                            tree_node.hash,
                            tree_node.key.clone(),
                            Atomic::from(tree_node.value.load(Ordering::SeqCst, guard)),
                        );
                        let (head, tail, count) = if tree_node.hash & n as u64 == 0 {
                            (&mut low, &mut low_tail, &mut low_count)
                        } else {
                            (&mut high, &mut high_tail, &mut high_count)
                        };
                        new_node.prev.store(*tail, Ordering::Relaxed);
                        let new_node = Shared::boxed(new_node, guard);
                        if tail.is_null() {
                            *head = new_node;
                        } else {
                            unsafe { tail.deref() }.next.store(new_node, Ordering::Relaxed);
                        }
                        *tail = new_node;
                        *count += 1;
                        e = tree_node.next.load(Ordering::Relaxed, guard);
                    }

                    let untreeify_threshold = self.config.untreeify_threshold;
                    let mut reused_bin = false;
                    let low_bin = if low_count <= untreeify_threshold {
                        let low_linear = Self::untreeify(low, guard);
                        unsafe { TreeBin::drop_tree_nodes(low, false, guard) };
                        low_linear
                    } else if high_count != 0 {
                        Shared::boxed(BinEntry::Tree(TreeBin::new(low, guard)), guard)
                    } else {
                        // everything stays on the low side; keep the old tree
                        reused_bin = true;
                        unsafe { TreeBin::drop_tree_nodes(low, false, guard) };
                        bin
                    };
                    let high_bin = if high_count <= untreeify_threshold {
                        let high_linear = Self::untreeify(high, guard);
                        unsafe { TreeBin::drop_tree_nodes(high, false, guard) };
                        high_linear
                    } else if low_count != 0 {
                        Shared::boxed(BinEntry::Tree(TreeBin::new(high, guard)), guard)
                    } else {
                        reused_bin = true;
                        unsafe { TreeBin::drop_tree_nodes(high, false, guard) };
                        bin
                    };

                    next_table_ref.store_bin(i, low_bin);
                    next_table_ref.store_bin(i + n, high_bin);
                    table.store_bin(i, table.get_moved(next_table, guard));

                    if !reused_bin {
                        unsafe { TreeBin::retire_without_values(bin, guard) };
                    }

                    advance = true;
                    drop(bin_lock);
                }
            }
        }
    }

    /// Joins an in-progress resize of `table`, if any, and returns the table
    /// to retry against.
    fn help_transfer<'g>(
        &'g self,
        table: Shared<'g, Table<K, V>>,
        guard: &'g Guard<'_>,
    ) -> Shared<'g, Table<K, V>> {
        // safety: tables are retired only after being replaced
        let t = match unsafe { table.as_ref() } {
            Some(t) => t,
            None => return table,
        };

        let next_table = t.next_table(guard);
        if next_table.is_null() {
            return table;
        }

        let rs = Self::resize_stamp(t.len()) << RESIZE_STAMP_SHIFT;

        while next_table == self.next_table.load(Ordering::SeqCst, guard)
            && table == self.table.load(Ordering::SeqCst, guard)
        {
            let sc = self.size_ctl.load(Ordering::SeqCst);
            if sc >= 0
                || sc == rs + MAX_RESIZERS
                || sc == rs + 1
                || self.transfer_index.load(Ordering::SeqCst) <= 0
            {
                break;
            }

            if self
                .size_ctl
                .compare_exchange(sc, sc + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                self.transfer(table, next_table, guard);
                break;
            }
        }
        next_table
    }

    /// Adds `n` to the element count and, if `check_resize`, starts or joins a
    /// resize when the count has reached the threshold.
    fn add_count<'g>(&'g self, n: isize, check_resize: bool, guard: &'g Guard<'_>) {
        let mut count = self.count.fetch_add(n, Ordering::SeqCst) + n;

        if !check_resize {
            return;
        }

        loop {
            let sc = self.size_ctl.load(Ordering::SeqCst);
            if count < sc {
                break;
            }

            let table = self.table.load(Ordering::SeqCst, guard);
            // safety: tables are retired only after being replaced
            let n = match unsafe { table.as_ref() } {
                Some(t) => t.len(),
                None => break,
            };
            if n >= MAXIMUM_CAPACITY {
                break;
            }

            let rs = Self::resize_stamp(n) << RESIZE_STAMP_SHIFT;
            if sc < 0 {
                if sc == rs + MAX_RESIZERS || sc == rs + 1 {
                    break;
                }
                let nt = self.next_table.load(Ordering::SeqCst, guard);
                if nt.is_null() {
                    break;
                }
                if self.transfer_index.load(Ordering::SeqCst) <= 0 {
                    break;
                }

                if self
                    .size_ctl
                    .compare_exchange(sc, sc + 1, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    self.transfer(table, nt, guard);
                }
            } else if self
                .size_ctl
                .compare_exchange(sc, rs + 2, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                self.transfer(table, Shared::null(), guard);
            }

            count = self.count.load(Ordering::SeqCst);
        }
    }

    /// Grows the table so that at least `additional` more entries fit without
    /// a resize.
    pub fn reserve(&self, additional: usize, guard: &Guard<'_>) {
        self.check_guard(guard);
        let absolute = self.len() + additional;
        self.try_presize(absolute, guard);
    }

    /// Removes every entry.
    ///
    /// Entries inserted concurrently with `clear` may or may not survive it.
    pub fn clear(&self, guard: &Guard<'_>) {
        self.check_guard(guard);
        let mut delta = 0;
        let mut idx = 0usize;

        let mut table = self.table.load(Ordering::SeqCst, guard);
        // safety: tables are retired only after being replaced
        while let Some(tab) = unsafe { table.as_ref() } {
            if idx >= tab.len() {
                break;
            }
            let raw_node = tab.bin(idx, guard);
            if raw_node.is_null() {
                idx += 1;
                continue;
            }
            // safety: bins are retired only after being unlinked
            match *unsafe { raw_node.deref() } {
                BinEntry::Moved => {
                    table = self.help_transfer(table, guard);
                    idx = 0;
                }
                BinEntry::Node(ref node) => {
                    let head_lock = node.lock.lock();
                    if tab.bin(idx, guard) != raw_node {
                        continue;
                    }
                    tab.store_bin(idx, Shared::null());
                    drop(head_lock);

                    let mut p = raw_node;
                    while !p.is_null() {
                        let node = unsafe { chain_node(p) };
                        let next = node.next.load(Ordering::SeqCst, guard);
                        let value = node.value.load(Ordering::SeqCst, guard);
                        // safety: the chain was unlinked above
                        unsafe {
                            guard.retire(value);
                            guard.retire(p);
                        }
                        delta -= 1;
                        p = next;
                    }
                    idx += 1;
                }
                BinEntry::Tree(ref tree_bin) => {
                    let bin_lock = tree_bin.lock.lock();
                    if tab.bin(idx, guard) != raw_node {
                        continue;
                    }
                    tab.store_bin(idx, Shared::null());
                    drop(bin_lock);

                    delta -= tree_bin.len() as isize;
                    // safety: the bin was unlinked above; dropping a TreeBin
                    // frees its nodes and values
                    unsafe { guard.retire(raw_node) };
                    idx += 1;
                }
            };
        }

        if delta != 0 {
            self.add_count(delta, false, guard);
        }
        guard.try_collect();
    }

    /// Converts the chain in bin `index` into a tree, or grows the table if it
    /// is too small for trees.
    fn treeify_bin<'g>(&'g self, tab: &'g Table<K, V>, index: usize, guard: &'g Guard<'_>) {
        let n = tab.len();
        if n < MIN_TREEIFY_CAPACITY {
            self.try_presize(n << 1, guard);
            return;
        }

        let bin = tab.bin(index, guard);
        // safety: bins are retired only after being unlinked
        let node = match unsafe { bin.as_ref() } {
            Some(BinEntry::Node(node)) => node,
            // emptied, moved, or already a tree
            _ => return,
        };

        let lock = node.lock.lock();
        if tab.bin(index, guard) != bin {
            return;
        }

        let mut e = bin;
        let mut head = Shared::null();
        let mut tail: Shared<'_, TreeNode<K, V>> = Shared::null();
        while !e.is_null() {
            let e_deref = unsafe { chain_node(e) };
            let new_tree_node = TreeNode::new(
                e_deref.hash,
                e_deref.key.clone(),
                Atomic::from(e_deref.value.load(Ordering::SeqCst, guard)),
            );
            new_tree_node.prev.store(tail, Ordering::Relaxed);
            let new_tree_node = Shared::boxed(new_tree_node, guard);
            if tail.is_null() {
                head = new_tree_node;
            } else {
                unsafe { tail.deref() }
                    .next
                    .store(new_tree_node, Ordering::Relaxed);
            }
            tail = new_tree_node;
            e = e_deref.next.load(Ordering::SeqCst, guard);
        }
        let tree_bin = TreeBin::new(head, guard);
        trace!("converted bin {} of {} into a tree of {} nodes", index, n, tree_bin.len());
        tab.store_bin(index, Shared::boxed(BinEntry::Tree(tree_bin), guard));
        drop(lock);

        // the old chain is unreachable; its values moved into the tree
        e = bin;
        while !e.is_null() {
            let next = unsafe { chain_node(e) }.next.load(Ordering::SeqCst, guard);
            unsafe { guard.retire(e) };
            e = next;
        }
    }

    /// Builds a chain holding the same entries as the tree node list starting
    /// at `bin`. Values are shared with the tree nodes.
    fn untreeify<'g>(
        bin: Shared<'g, TreeNode<K, V>>,
        guard: &'g Guard<'_>,
    ) -> Shared<'g, BinEntry<K, V>> {
        let mut head = Shared::null();
        let mut tail: Shared<'_, BinEntry<K, V>> = Shared::null();
        let mut q = bin;
        while !q.is_null() {
            let q_deref = unsafe { q.deref() };
            let new_node = Shared::boxed(
                BinEntry::Node(Node::new(
                    q_deref.hash,
                    q_deref.key.clone(),
                    Atomic::from(q_deref.value.load(Ordering::SeqCst, guard)),
                )),
                guard,
            );
            if tail.is_null() {
                head = new_node;
            } else {
                unsafe { chain_node(tail) }
                    .next
                    .store(new_node, Ordering::Relaxed);
            }
            tail = new_node;
            q = q_deref.next.load(Ordering::Relaxed, guard);
        }

        head
    }
}

impl<K, V, S> HashMap<K, V, S>
where
    K: Hash + Ord,
    S: BuildHasher,
{
    #[inline]
    fn hash<Q: ?Sized + Hash>(&self, key: &Q) -> u64 {
        let mut h = self.build_hasher.build_hasher();
        key.hash(&mut h);
        h.finish()
    }

    fn get_node<'g, Q>(&'g self, key: &Q, guard: &'g Guard<'_>) -> Option<(&'g K, Shared<'g, V>)>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Ord,
    {
        let table = self.table.load(Ordering::SeqCst, guard);
        // safety: tables are retired only after being replaced
        let table = unsafe { table.as_ref() }?;

        let h = self.hash(key);
        let bin = table.bin(table.bini(h), guard);
        // safety: bins are retired only after being unlinked
        let bin = unsafe { bin.as_ref() }?;
        table.find(bin, h, key, guard)
    }

    /// Returns `true` if the map holds a value for `key`.
    pub fn contains_key<Q>(&self, key: &Q, guard: &Guard<'_>) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Ord,
    {
        self.check_guard(guard);
        self.get_node(key, guard).is_some()
    }

    /// Returns a reference to the value for `key`.
    ///
    /// The key may be any borrowed form of the map's key type, but `Hash` and
    /// `Ord` on the borrowed form must match those for the key type.
    #[inline]
    pub fn get<'g, Q>(&'g self, key: &Q, guard: &'g Guard<'_>) -> Option<&'g V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Ord,
    {
        self.check_guard(guard);
        let (_, v) = self.get_node(key, guard)?;
        assert!(!v.is_null());
        // safety: values are retired only after being replaced or removed,
        // and we hold a guard
        unsafe { v.as_ref() }
    }

    /// Returns the stored key and value for `key`.
    #[inline]
    pub fn get_key_value<'g, Q>(&'g self, key: &Q, guard: &'g Guard<'_>) -> Option<(&'g K, &'g V)>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Ord,
    {
        self.check_guard(guard);
        let (k, v) = self.get_node(key, guard)?;
        assert!(!v.is_null());
        // safety: see `get`
        unsafe { v.as_ref() }.map(|v| (k, v))
    }
}

impl<K, V, S> HashMap<K, V, S>
where
    K: Clone + Ord + Hash + Send + Sync,
    V: Send + Sync,
    S: BuildHasher,
{
    /// Maps `key` to `value`, returning the previous value if there was one.
    ///
    /// The previous value stays readable until `guard` is dropped.
    pub fn insert<'g>(&'g self, key: K, value: V, guard: &'g Guard<'_>) -> Option<&'g V> {
        self.check_guard(guard);
        self.put(key, value, false, guard).before()
    }

    /// Maps `key` to `value` only if `key` is not in the map yet.
    ///
    /// On success, returns a reference to the inserted value. Otherwise hands
    /// `value` back together with the current value.
    #[inline]
    pub fn try_insert<'g>(
        &'g self,
        key: K,
        value: V,
        guard: &'g Guard<'_>,
    ) -> Result<&'g V, TryInsertError<'g, V>> {
        self.check_guard(guard);
        match self.put(key, value, true, guard) {
            PutResult::Exists {
                current,
                not_inserted,
            } => Err(TryInsertError {
                current,
                not_inserted: *not_inserted,
            }),
            PutResult::Inserted { new } => Ok(new),
            PutResult::Replaced { .. } => {
                unreachable!("no_replacement cannot result in PutResult::Replaced")
            }
        }
    }

    fn put<'g>(
        &'g self,
        mut key: K,
        value: V,
        no_replacement: bool,
        guard: &'g Guard<'_>,
    ) -> PutResult<'g, V> {
        let hash = self.hash(&key);
        let mut table = self.table.load(Ordering::SeqCst, guard);
        let value = Shared::boxed(value, guard);
        loop {
            if table.is_null() {
                table = self.init_table(guard);
                continue;
            }

            // safety: tables are retired only after being replaced
            let t = unsafe { table.deref() };

            let bini = t.bini(hash);
            let mut bin = t.bin(bini, guard);
            if bin.is_null() {
                // fast path: install a new head without locking
                let node = Shared::boxed(
                    BinEntry::Node(Node::new(hash, key, Atomic::from(value))),
                    guard,
                );
                match t.cas_bin(bini, bin, node, guard) {
                    Ok(()) => {
                        self.add_count(1, true, guard);
                        guard.try_collect();
                        // safety: we hold a guard, so the value cannot have
                        // been freed even if it was already replaced
                        return PutResult::Inserted {
                            new: unsafe { value.deref() },
                        };
                    }
                    Err(current) => {
                        assert!(!current.is_null());
                        bin = current;
                        // safety: the node was never published
                        match *unsafe { node.into_box() } {
                            BinEntry::Node(node) => key = node.key,
                            _ => unreachable!("we declared node and it is a BinEntry::Node"),
                        }
                    }
                }
            }

            // safety: bins are retired only after being unlinked
            match *unsafe { bin.deref() } {
                BinEntry::Moved => {
                    table = self.help_transfer(table, guard);
                    continue;
                }
                BinEntry::Node(ref head)
                    if no_replacement && head.hash == hash && head.key == key =>
                {
                    // fast path for try_insert on the head without locking
                    let v = head.value.load(Ordering::SeqCst, guard);
                    return PutResult::Exists {
                        current: unsafe { v.deref() },
                        // safety: the value was never published
                        not_inserted: unsafe { value.into_box() },
                    };
                }
                BinEntry::Node(ref head) => {
                    let head_lock = head.lock.lock();

                    // the head may have been removed or moved while we waited
                    if t.bin(bini, guard) != bin {
                        continue;
                    }

                    let mut chain_len = 1;
                    let mut p = bin;
                    let old_val = loop {
                        let n = unsafe { chain_node(p) };
                        if n.hash == hash && n.key == key {
                            let current_value = n.value.load(Ordering::SeqCst, guard);
                            let current_value = unsafe { current_value.deref() };

                            if no_replacement {
                                return PutResult::Exists {
                                    current: current_value,
                                    not_inserted: unsafe { value.into_box() },
                                };
                            }
                            let now_garbage = n.value.swap(value, Ordering::SeqCst, guard);
                            // safety: the old value is no longer reachable
                            // from the map; readers that saw it hold guards
                            unsafe { guard.retire(now_garbage) };
                            break Some(current_value);
                        }

                        let next = n.next.load(Ordering::SeqCst, guard);
                        if next.is_null() {
                            let node = Shared::boxed(
                                BinEntry::Node(Node::new(hash, key, Atomic::from(value))),
                                guard,
                            );
                            n.next.store(node, Ordering::SeqCst);
                            break None;
                        }
                        p = next;
                        chain_len += 1;
                    };
                    drop(head_lock);

                    if let Some(old) = old_val {
                        guard.try_collect();
                        return PutResult::Replaced {
                            old,
                            new: unsafe { value.deref() },
                        };
                    }
                    if chain_len >= self.config.treeify_threshold {
                        self.treeify_bin(t, bini, guard);
                    }
                    break;
                }
                BinEntry::Tree(ref tree_bin) => {
                    let head_lock = tree_bin.lock.lock();

                    if t.bin(bini, guard) != bin {
                        continue;
                    }

                    let p = tree_bin.find_or_put_tree_val(hash, key, value, guard);
                    if p.is_null() {
                        break;
                    }
                    // safety: we hold the bin lock, so the node is still linked
                    let tree_node = unsafe { p.deref() };
                    let current_value = tree_node.value.load(Ordering::SeqCst, guard);
                    let current_value = unsafe { current_value.deref() };
                    if no_replacement {
                        return PutResult::Exists {
                            current: current_value,
                            not_inserted: unsafe { value.into_box() },
                        };
                    }
                    let now_garbage = tree_node.value.swap(value, Ordering::SeqCst, guard);
                    unsafe { guard.retire(now_garbage) };
                    drop(head_lock);

                    guard.try_collect();
                    return PutResult::Replaced {
                        old: current_value,
                        new: unsafe { value.deref() },
                    };
                }
            }
        }
        self.add_count(1, true, guard);
        guard.try_collect();
        PutResult::Inserted {
            new: unsafe { value.deref() },
        }
    }

    /// Replaces the value for `key` with `remapping_function(key, value)` if
    /// the key is present, or removes the entry if the function returns
    /// `None`. Returns the new value, if any.
    ///
    /// The function runs while the key's bin is locked, so it must not access
    /// the map.
    pub fn compute_if_present<'g, Q, F>(
        &'g self,
        key: &Q,
        remapping_function: F,
        guard: &'g Guard<'_>,
    ) -> Option<&'g V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Ord,
        F: FnOnce(&K, &V) -> Option<V>,
    {
        self.check_guard(guard);
        let hash = self.hash(key);

        let mut table = self.table.load(Ordering::SeqCst, guard);
        let new_val;
        let mut removed_node = false;
        let mut remapping_function = Some(remapping_function);
        loop {
            // safety: tables are retired only after being replaced
            let t = match unsafe { table.as_ref() } {
                Some(t) => t,
                None => return None,
            };

            let bini = t.bini(hash);
            let bin = t.bin(bini, guard);
            if bin.is_null() {
                return None;
            }

            // safety: bins are retired only after being unlinked
            match *unsafe { bin.deref() } {
                BinEntry::Moved => {
                    table = self.help_transfer(table, guard);
                    continue;
                }
                BinEntry::Node(ref head) => {
                    let head_lock = head.lock.lock();

                    if t.bin(bini, guard) != bin {
                        continue;
                    }

                    let mut p = bin;
                    let mut pred: Shared<'_, BinEntry<K, V>> = Shared::null();

                    new_val = loop {
                        let n = unsafe { chain_node(p) };
                        let next = n.next.load(Ordering::SeqCst, guard);
                        if n.hash == hash && n.key.borrow() == key {
                            let current_value = n.value.load(Ordering::SeqCst, guard);

                            let f = match remapping_function.take() {
                                Some(f) => f,
                                None => unreachable!("the remapping function runs at most once"),
                            };
                            let new_value = f(&n.key, unsafe { current_value.deref() });

                            if let Some(value) = new_value {
                                let value = Shared::boxed(value, guard);
                                let now_garbage = n.value.swap(value, Ordering::SeqCst, guard);
                                unsafe { guard.retire(now_garbage) };
                                break Some(unsafe { value.deref() });
                            }

                            removed_node = true;
                            if pred.is_null() {
                                t.store_bin(bini, next);
                            } else {
                                unsafe { chain_node(pred) }
                                    .next
                                    .store(next, Ordering::SeqCst);
                            }
                            unsafe {
                                guard.retire(p);
                                guard.retire(current_value);
                            }
                            break None;
                        }

                        pred = p;
                        if next.is_null() {
                            break None;
                        }
                        p = next;
                    };
                    drop(head_lock);
                }
                BinEntry::Tree(ref tree_bin) => {
                    let bin_lock = tree_bin.lock.lock();

                    if t.bin(bini, guard) != bin {
                        continue;
                    }

                    let root = tree_bin.root.load(Ordering::SeqCst, guard);
                    let p = TreeNode::find_tree_node(root, hash, key, guard);
                    // safety: we hold the bin lock, so the node is still linked
                    new_val = match unsafe { p.as_ref() } {
                        None => None,
                        Some(n) => {
                            let current_value = n.value.load(Ordering::SeqCst, guard);

                            let f = match remapping_function.take() {
                                Some(f) => f,
                                None => unreachable!("the remapping function runs at most once"),
                            };
                            match f(&n.key, unsafe { current_value.deref() }) {
                                Some(value) => {
                                    let value = Shared::boxed(value, guard);
                                    let now_garbage =
                                        n.value.swap(value, Ordering::SeqCst, guard);
                                    unsafe { guard.retire(now_garbage) };
                                    Some(unsafe { value.deref() })
                                }
                                None => {
                                    removed_node = true;
                                    self.remove_tree_entry(t, bini, bin, tree_bin, p, guard);
                                    None
                                }
                            }
                        }
                    };
                    drop(bin_lock);
                }
            }
            break;
        }
        if removed_node {
            self.add_count(-1, false, guard);
        }
        guard.try_collect();
        new_val
    }

    /// Removes `key` from the map, returning its value if it was present.
    ///
    /// The removed value stays readable until `guard` is dropped.
    pub fn remove<'g, Q>(&'g self, key: &Q, guard: &'g Guard<'_>) -> Option<&'g V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Ord,
    {
        self.check_guard(guard);
        self.remove_node(key, guard).map(|(_, v)| v)
    }

    /// Removes `key` from the map, returning the stored key and value if it
    /// was present.
    pub fn remove_entry<'g, Q>(&'g self, key: &Q, guard: &'g Guard<'_>) -> Option<(&'g K, &'g V)>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Ord,
    {
        self.check_guard(guard);
        self.remove_node(key, guard)
    }

    fn remove_node<'g, Q>(&'g self, key: &Q, guard: &'g Guard<'_>) -> Option<(&'g K, &'g V)>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Ord,
    {
        let hash = self.hash(key);

        let mut old_val = None;
        let mut table = self.table.load(Ordering::SeqCst, guard);
        loop {
            // safety: tables are retired only after being replaced
            let t = match unsafe { table.as_ref() } {
                Some(t) => t,
                None => break,
            };
            let bini = t.bini(hash);
            let bin = t.bin(bini, guard);
            if bin.is_null() {
                break;
            }

            // safety: bins are retired only after being unlinked
            match *unsafe { bin.deref() } {
                BinEntry::Moved => {
                    table = self.help_transfer(table, guard);
                    continue;
                }
                BinEntry::Node(ref head) => {
                    let head_lock = head.lock.lock();

                    if t.bin(bini, guard) != bin {
                        continue;
                    }

                    let mut e = bin;
                    let mut pred: Shared<'_, BinEntry<K, V>> = Shared::null();
                    loop {
                        let n = unsafe { chain_node(e) };
                        let next = n.next.load(Ordering::SeqCst, guard);
                        if n.hash == hash && n.key.borrow() == key {
                            let ev = n.value.load(Ordering::SeqCst, guard);
                            old_val = Some((&n.key, ev));

                            if pred.is_null() {
                                t.store_bin(bini, next);
                            } else {
                                unsafe { chain_node(pred) }
                                    .next
                                    .store(next, Ordering::SeqCst);
                            }
                            // safety: the node is unlinked
                            unsafe { guard.retire(e) };
                            break;
                        }
                        pred = e;
                        if next.is_null() {
                            break;
                        }
                        e = next;
                    }
                    drop(head_lock);
                }
                BinEntry::Tree(ref tree_bin) => {
                    let bin_lock = tree_bin.lock.lock();

                    if t.bin(bini, guard) != bin {
                        continue;
                    }

                    let root = tree_bin.root.load(Ordering::SeqCst, guard);
                    let p = TreeNode::find_tree_node(root, hash, key, guard);
                    // safety: we hold the bin lock, so the node is still linked
                    if let Some(n) = unsafe { p.as_ref() } {
                        old_val = Some((&n.key, n.value.load(Ordering::SeqCst, guard)));
                        self.remove_tree_entry_keep_value(t, bini, bin, tree_bin, p, guard);
                    }
                    drop(bin_lock);
                }
            }
            break;
        }

        let (key, val) = old_val?;
        self.add_count(-1, false, guard);
        // safety: the entry holding the value is unlinked
        unsafe { guard.retire(val) };
        guard.try_collect();
        unsafe { val.as_ref() }.map(move |v| (key, v))
    }

    /// Unlinks the tree node `p` from `tree_bin` (the entry `bin` in slot
    /// `bini` of `t`) and retires it together with its value.
    ///
    /// Must be called with the bin lock held.
    fn remove_tree_entry<'g>(
        &'g self,
        t: &'g Table<K, V>,
        bini: usize,
        bin: Shared<'g, BinEntry<K, V>>,
        tree_bin: &'g TreeBin<K, V>,
        p: Shared<'g, TreeNode<K, V>>,
        guard: &'g Guard<'_>,
    ) {
        // safety: the caller holds the bin lock, so `p` is still linked
        let value = unsafe { p.deref() }.value.load(Ordering::SeqCst, guard);
        self.remove_tree_entry_keep_value(t, bini, bin, tree_bin, p, guard);
        // safety: the node holding the value is unlinked
        unsafe { guard.retire(value) };
    }

    /// Like `remove_tree_entry`, but leaves retiring the value to the caller.
    fn remove_tree_entry_keep_value<'g>(
        &'g self,
        t: &'g Table<K, V>,
        bini: usize,
        bin: Shared<'g, BinEntry<K, V>>,
        tree_bin: &'g TreeBin<K, V>,
        p: Shared<'g, TreeNode<K, V>>,
        guard: &'g Guard<'_>,
    ) {
        // safety: the caller holds the bin lock and `p` belongs to this bin
        let too_small =
            unsafe { tree_bin.remove_tree_node(p, self.config.untreeify_threshold, guard) };
        if too_small {
            let linear_bin = Self::untreeify(tree_bin.first.load(Ordering::SeqCst, guard), guard);
            trace!(
                "converted bin {} of {} back into a chain",
                bini,
                t.len()
            );
            t.store_bin(bini, linear_bin);
            // safety: the tree is unlinked; its values now live in the chain
            unsafe { TreeBin::retire_without_values(bin, guard) };
        }
        // safety: `p` was unlinked from both the list and the tree
        unsafe { guard.retire(p) };
    }
}

impl<K, V, S> Debug for HashMap<K, V, S> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let guard = self.guard();
        f.debug_struct("HashMap")
            .field("len", &self.len())
            .field("capacity", &self.capacity(&guard))
            .field("config", &self.config)
            .finish()
    }
}

impl<K, V, S> Drop for HashMap<K, V, S> {
    fn drop(&mut self) {
        // safety: we have &mut self, so no guards into this map exist
        let guard = unsafe { Guard::unprotected() };

        assert!(self.next_table.load(Ordering::SeqCst, &guard).is_null());
        let table = self.table.swap(Shared::null(), Ordering::SeqCst, &guard);
        if table.is_null() {
            return;
        }

        let mut table = unsafe { table.into_box() };
        table.drop_bins();
    }
}

#[inline]
fn num_cpus() -> usize {
    NCPU_INITIALIZER.call_once(|| NCPU.store(num_cpus::get_physical(), Ordering::Relaxed));
    NCPU.load(Ordering::Relaxed)
}
