use crate::node::*;
use crate::reclaim::{Atomic, Guard, Shared};
use std::borrow::Borrow;
use std::sync::atomic::Ordering;

/// A power-of-two array of bins.
///
/// While the table is being resized, `next_table` points at its replacement
/// and every bin that has been copied over holds the shared `moved` entry.
#[derive(Debug)]
pub(crate) struct Table<K, V> {
    bins: Box<[Atomic<BinEntry<K, V>>]>,

    moved: Atomic<BinEntry<K, V>>,

    next_table: Atomic<Table<K, V>>,
}

impl<K, V> Table<K, V> {
    pub(crate) fn new(bins: usize) -> Self {
        debug_assert!(bins.is_power_of_two());
        // safety: the moved entry is not shared with anyone yet
        let guard = unsafe { Guard::unprotected() };
        Table {
            bins: (0..bins).map(|_| Atomic::null()).collect(),
            moved: Atomic::from(Shared::boxed(BinEntry::Moved, &guard)),
            next_table: Atomic::null(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.bins.len()
    }

    /// Records `for_table` as the table this one is moving into and returns
    /// the entry to mark moved bins with.
    pub(crate) fn get_moved<'g>(
        &'g self,
        for_table: Shared<'g, Table<K, V>>,
        guard: &'g Guard<'_>,
    ) -> Shared<'g, BinEntry<K, V>> {
        match self.next_table(guard) {
            t if t.is_null() => {
                if let Err(current) = self.next_table.compare_exchange(
                    Shared::null(),
                    for_table,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                    guard,
                ) {
                    assert_eq!(current, for_table);
                }
            }
            t => {
                assert_eq!(t, for_table);
            }
        }
        self.moved.load(Ordering::SeqCst, guard)
    }

    /// Searches `bin`, which was read from this table, for `key`, following
    /// moved bins into newer tables.
    pub(crate) fn find<'g, Q>(
        &'g self,
        bin: &'g BinEntry<K, V>,
        hash: u64,
        key: &Q,
        guard: &'g Guard<'_>,
    ) -> Option<(&'g K, Shared<'g, V>)>
    where
        K: Borrow<Q>,
        Q: ?Sized + Ord,
    {
        match *bin {
            BinEntry::Node(ref head) => {
                let mut node = head;
                loop {
                    if node.hash == hash && node.key.borrow() == key {
                        return Some((&node.key, node.value.load(Ordering::SeqCst, guard)));
                    }
                    let next = node.next.load(Ordering::SeqCst, guard);
                    if next.is_null() {
                        return None;
                    }
                    // safety: chain nodes are retired only after being unlinked
                    node = unsafe { chain_node(next) };
                }
            }
            BinEntry::Tree(ref tree_bin) => {
                let node = tree_bin.find(hash, key, guard);
                // safety: tree nodes are retired only after being unlinked
                unsafe { node.as_ref() }
                    .map(|n| (&n.key, n.value.load(Ordering::SeqCst, guard)))
            }
            BinEntry::Moved => {
                // safety: a moved entry is only installed after `next_table`
                // was set, and tables are retired only once fully replaced
                let mut table = unsafe { self.next_table(guard).deref() };
                loop {
                    let bin = table.bin(table.bini(hash), guard);
                    // safety: bins are retired only after being unlinked
                    match unsafe { bin.as_ref() } {
                        None => return None,
                        Some(BinEntry::Moved) => {
                            table = unsafe { table.next_table(guard).deref() };
                        }
                        Some(bin) => return table.find(bin, hash, key, guard),
                    }
                }
            }
        }
    }

    /// Frees every bin along with its keys and values.
    pub(crate) fn drop_bins(&mut self) {
        // safety: we have &mut self, so no other thread can see the bins
        let guard = unsafe { Guard::unprotected() };

        for bin in std::mem::take(&mut self.bins).iter() {
            let entry = bin.load(Ordering::SeqCst, &guard);
            if entry.is_null() {
                continue;
            }
            // safety: see above
            match unsafe { entry.deref() } {
                BinEntry::Moved => {}
                BinEntry::Node(_) => {
                    let mut p = entry;
                    while !p.is_null() {
                        let node = match *unsafe { p.into_box() } {
                            BinEntry::Node(node) => node,
                            _ => unreachable!("chains only link BinEntry::Node"),
                        };
                        unsafe { drop(node.value.load(Ordering::SeqCst, &guard).into_box()) };
                        p = node.next.load(Ordering::SeqCst, &guard);
                    }
                }
                BinEntry::Tree(_) => {
                    // TreeBin's destructor frees its nodes and values
                    drop(unsafe { entry.into_box() });
                }
            }
        }
    }
}

impl<K, V> Drop for Table<K, V> {
    fn drop(&mut self) {
        // safety: we have &mut self
        let guard = unsafe { Guard::unprotected() };

        if cfg!(debug_assertions) {
            for bin in self.bins.iter() {
                let bin = bin.load(Ordering::SeqCst, &guard);
                if let Some(entry) = unsafe { bin.as_ref() } {
                    assert!(
                        matches!(entry, BinEntry::Moved),
                        "dropped table with non-empty bin"
                    );
                }
            }
        }

        let moved = self.moved.swap(Shared::null(), Ordering::SeqCst, &guard);
        assert!(
            !moved.is_null(),
            "self.moved is initialized together with the table"
        );
        drop(unsafe { moved.into_box() });
    }
}

impl<K, V> Table<K, V> {
    #[inline]
    pub(crate) fn bini(&self, hash: u64) -> usize {
        let mask = self.bins.len() as u64 - 1;
        (hash & mask) as usize
    }

    #[inline]
    pub(crate) fn bin<'g>(&'g self, i: usize, guard: &'g Guard<'_>) -> Shared<'g, BinEntry<K, V>> {
        self.bins[i].load(Ordering::Acquire, guard)
    }

    /// Installs `new` in bin `i` if it still holds `current`. On failure the
    /// entry that is there now is returned, so callers can retry on it.
    #[inline]
    pub(crate) fn cas_bin<'g>(
        &'g self,
        i: usize,
        current: Shared<'_, BinEntry<K, V>>,
        new: Shared<'_, BinEntry<K, V>>,
        guard: &'g Guard<'_>,
    ) -> Result<(), Shared<'g, BinEntry<K, V>>> {
        self.bins[i]
            .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire, guard)
            .map(|_| ())
    }

    #[inline]
    pub(crate) fn store_bin(&self, i: usize, new: Shared<'_, BinEntry<K, V>>) {
        self.bins[i].store(new, Ordering::Release)
    }

    #[inline]
    pub(crate) fn next_table<'g>(&'g self, guard: &'g Guard<'_>) -> Shared<'g, Table<K, V>> {
        self.next_table.load(Ordering::SeqCst, guard)
    }
}
