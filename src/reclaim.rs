//! Epoch-based memory reclamation.
//!
//! Every map owns a [`Collector`]. Threads register with it lazily the first
//! time they pin, and each registered thread announces the global epoch it
//! observed while it holds a [`Guard`]. Objects unlinked from the map are
//! *retired* into the retiring thread's local garbage bag, tagged with the
//! global epoch at retirement, and are only freed once the global epoch has
//! moved two steps past that tag. The epoch can only advance when every
//! pinned thread has announced the current epoch, so a pinned thread can never
//! observe memory that has been freed.
//!
//! There is no background thread: a thread whose bag has grown past the
//! collector's threshold tries to advance the epoch and frees its own expired
//! garbage the next time it pins or writes. After each attempt the thread
//! waits for another threshold's worth of retirements before trying again, so
//! a guard held across many writes does not turn every write into a scan.

use crossbeam_utils::CachePadded;
use log::trace;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{self, AtomicPtr, AtomicU64, AtomicUsize, Ordering};
use thread_local::ThreadLocal;

/// Announcement of a thread that is not pinned.
const UNPINNED: u64 = 0;

/// Garbage bag length that triggers collection when no other value is given.
pub(crate) const DEFAULT_COLLECT_THRESHOLD: usize = 64;

#[inline]
fn pinned(epoch: u64) -> u64 {
    (epoch << 1) | 1
}

#[inline]
fn is_pinned(announcement: u64) -> bool {
    announcement & 1 == 1
}

#[inline]
fn announced_epoch(announcement: u64) -> u64 {
    announcement >> 1
}

/// A type-erased object waiting for its grace period to end.
struct Retired {
    ptr: *mut (),
    reclaim: unsafe fn(*mut ()),
    epoch: u64,
}

// The map only retires nodes and values of `Send` types.
unsafe impl Send for Retired {}

impl Retired {
    #[inline]
    fn is_expired(&self, global: u64) -> bool {
        global >= self.epoch + 2
    }
}

impl Drop for Retired {
    fn drop(&mut self) {
        // safety: a `Retired` is created exactly once per unlinked object and
        // is only dropped once no guard can reach the object anymore.
        unsafe { (self.reclaim)(self.ptr) }
    }
}

/// Per-thread participant state.
struct Local {
    epoch: CachePadded<AtomicU64>,
    guard_count: AtomicUsize,
    /// Retired objects in retirement order. Their epochs never decrease.
    bag: Mutex<VecDeque<Retired>>,
    /// Bag length at which the next collection is attempted.
    collect_at: AtomicUsize,
    #[cfg(test)]
    attempts: AtomicUsize,
}

impl Local {
    fn new(collect_threshold: usize) -> Self {
        Local {
            epoch: CachePadded::new(AtomicU64::new(UNPINNED)),
            guard_count: AtomicUsize::new(0),
            bag: Mutex::new(VecDeque::new()),
            collect_at: AtomicUsize::new(collect_threshold + 1),
            #[cfg(test)]
            attempts: AtomicUsize::new(0),
        }
    }

    #[inline]
    fn wants_collect(&self) -> bool {
        self.bag.lock().len() >= self.collect_at.load(Ordering::Relaxed)
    }
}

/// The global side of epoch-based reclamation.
pub(crate) struct Collector {
    epoch: CachePadded<AtomicU64>,
    locals: ThreadLocal<Local>,
    collect_threshold: usize,
}

impl Default for Collector {
    fn default() -> Self {
        Self::new(DEFAULT_COLLECT_THRESHOLD)
    }
}

impl fmt::Debug for Collector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collector")
            .field("epoch", &self.epoch.load(Ordering::Relaxed))
            .field("collect_threshold", &self.collect_threshold)
            .finish()
    }
}

impl Collector {
    /// Creates a collector whose threads try to reclaim garbage once their
    /// local bag holds more than `collect_threshold` objects.
    pub(crate) fn new(collect_threshold: usize) -> Self {
        Collector {
            epoch: CachePadded::new(AtomicU64::new(0)),
            locals: ThreadLocal::new(),
            collect_threshold: collect_threshold.max(1),
        }
    }

    /// Pins the current thread, registering it with this collector if this
    /// is its first pin.
    ///
    /// Pinning is reentrant: only the outermost guard announces an epoch, and
    /// the thread stays pinned until every guard it holds has been dropped.
    pub(crate) fn pin(&self) -> Guard<'_> {
        let threshold = self.collect_threshold;
        let local = self.locals.get_or(|| Local::new(threshold));
        let count = local.guard_count.load(Ordering::Relaxed);
        local.guard_count.store(count + 1, Ordering::Relaxed);

        if count == 0 {
            let global = self.epoch.load(Ordering::Relaxed);
            local.epoch.store(pinned(global), Ordering::Relaxed);
            atomic::fence(Ordering::SeqCst);

            if local.wants_collect() {
                self.try_collect(local);
            }
        }

        Guard {
            collector: Some(self),
            local: Some(local),
            _not_send: PhantomData,
        }
    }

    /// The current global epoch.
    #[cfg(test)]
    pub(crate) fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Relaxed)
    }

    /// Advances the global epoch if every pinned thread has observed the
    /// current one. Returns the global epoch after the attempt.
    fn try_advance(&self) -> u64 {
        let global = self.epoch.load(Ordering::Relaxed);
        atomic::fence(Ordering::SeqCst);

        for local in self.locals.iter() {
            let announcement = local.epoch.load(Ordering::Relaxed);
            if is_pinned(announcement) && announced_epoch(announcement) != global {
                return global;
            }
        }
        atomic::fence(Ordering::Acquire);

        match self.epoch.compare_exchange(
            global,
            global + 1,
            Ordering::Release,
            Ordering::Relaxed,
        ) {
            Ok(_) => {
                trace!("advanced global epoch to {}", global + 1);
                global + 1
            }
            Err(current) => current,
        }
    }

    /// Tries to advance the epoch, frees what it can from `local`'s bag, and
    /// pushes the next attempt a full threshold past what is left.
    fn try_collect(&self, local: &Local) {
        #[cfg(test)]
        local.attempts.fetch_add(1, Ordering::Relaxed);

        self.try_advance();
        let remaining = self.collect(local);
        local
            .collect_at
            .store(remaining + self.collect_threshold + 1, Ordering::Relaxed);
    }

    /// Frees the expired prefix of `local`'s bag and returns how many objects
    /// are still waiting.
    fn collect(&self, local: &Local) -> usize {
        let global = self.epoch.load(Ordering::Acquire);
        loop {
            let expired = {
                let mut bag = local.bag.lock();
                match bag.front() {
                    Some(r) if r.is_expired(global) => bag.pop_front(),
                    _ => return bag.len(),
                }
            };
            // destructors run without the bag lock held; they may pin again
            drop(expired);
        }
    }

    /// Number of objects retired by the current thread that are still waiting
    /// to be freed.
    #[cfg(test)]
    pub(crate) fn local_garbage(&self) -> usize {
        self.locals.get().map_or(0, |local| local.bag.lock().len())
    }

    /// Number of collections the current thread has attempted.
    #[cfg(test)]
    pub(crate) fn local_attempts(&self) -> usize {
        self.locals
            .get()
            .map_or(0, |local| local.attempts.load(Ordering::Relaxed))
    }
}

/// A witness that the current thread is pinned.
///
/// Shared pointers loaded through a guard, and references derived from them,
/// stay valid for as long as the guard lives.
pub struct Guard<'c> {
    collector: Option<&'c Collector>,
    local: Option<&'c Local>,
    _not_send: PhantomData<*mut ()>,
}

impl Guard<'static> {
    /// Returns a guard that does not pin anything.
    ///
    /// # Safety
    ///
    /// Retiring through this guard frees immediately, and loads through it are
    /// unprotected. Only usable when no other thread can access the data, such
    /// as in `Drop` or during construction.
    pub(crate) unsafe fn unprotected() -> Self {
        Guard {
            collector: None,
            local: None,
            _not_send: PhantomData,
        }
    }
}

impl<'c> Guard<'c> {
    /// The collector this guard pins, or `None` for an unprotected guard.
    pub(crate) fn collector(&self) -> Option<&'c Collector> {
        self.collector
    }

    /// Defers freeing a boxed `T` until no pinned thread can observe it.
    ///
    /// # Safety
    ///
    /// `ptr` must have come from [`Shared::boxed`], must already be
    /// unreachable for threads that pin from now on, and must not be retired
    /// twice.
    pub(crate) unsafe fn retire<T>(&self, ptr: Shared<'_, T>) {
        self.retire_with(ptr, drop_box::<T>)
    }

    /// Like [`retire`](Guard::retire), but runs `reclaim` on the pointer
    /// instead of dropping it as a `Box<T>`.
    ///
    /// # Safety
    ///
    /// Same as [`retire`](Guard::retire); `reclaim` must be sound to call on
    /// `ptr` once.
    pub(crate) unsafe fn retire_with<T>(&self, ptr: Shared<'_, T>, reclaim: unsafe fn(*mut ())) {
        assert!(!ptr.is_null(), "retired a null pointer");
        let ptr = ptr.as_ptr() as *mut ();

        match (self.collector, self.local) {
            (Some(collector), Some(local)) => {
                atomic::fence(Ordering::SeqCst);
                let epoch = collector.epoch.load(Ordering::Relaxed);
                local.bag.lock().push_back(Retired {
                    ptr,
                    reclaim,
                    epoch,
                });
            }
            _ => reclaim(ptr),
        }
    }

    /// Like [`flush`](Guard::flush), but only once this thread has retired
    /// another threshold's worth of objects since its last attempt.
    pub(crate) fn try_collect(&self) {
        if let (Some(collector), Some(local)) = (self.collector, self.local) {
            if local.wants_collect() {
                collector.try_collect(local);
            }
        }
    }

    /// Tries to advance the epoch and free this thread's expired garbage.
    pub fn flush(&self) {
        if let (Some(collector), Some(local)) = (self.collector, self.local) {
            collector.try_collect(local);
        }
    }
}

impl Drop for Guard<'_> {
    fn drop(&mut self) {
        if let Some(local) = self.local {
            let count = local.guard_count.load(Ordering::Relaxed);
            local.guard_count.store(count - 1, Ordering::Relaxed);
            if count == 1 {
                local.epoch.store(UNPINNED, Ordering::Release);
            }
        }
    }
}

impl fmt::Debug for Guard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("Guard { .. }")
    }
}

unsafe fn drop_box<T>(ptr: *mut ()) {
    drop(Box::from_raw(ptr as *mut T));
}

/// An atomic pointer whose loads are tied to a [`Guard`].
///
/// Dropping an `Atomic` does not free its pointee.
pub(crate) struct Atomic<T> {
    ptr: AtomicPtr<T>,
}

unsafe impl<T: Send + Sync> Send for Atomic<T> {}
unsafe impl<T: Send + Sync> Sync for Atomic<T> {}

impl<T> Atomic<T> {
    pub(crate) fn null() -> Self {
        Atomic {
            ptr: AtomicPtr::new(ptr::null_mut()),
        }
    }

    #[inline]
    pub(crate) fn load<'g>(&self, order: Ordering, _: &'g Guard<'_>) -> Shared<'g, T> {
        Shared::from_raw(self.ptr.load(order))
    }

    #[inline]
    pub(crate) fn store(&self, new: Shared<'_, T>, order: Ordering) {
        self.ptr.store(new.ptr, order)
    }

    #[inline]
    pub(crate) fn swap<'g>(
        &self,
        new: Shared<'_, T>,
        order: Ordering,
        _: &'g Guard<'_>,
    ) -> Shared<'g, T> {
        Shared::from_raw(self.ptr.swap(new.ptr, order))
    }

    /// Stores `new` if the current value is `current`. On failure, returns the
    /// value that was actually found.
    #[inline]
    pub(crate) fn compare_exchange<'g>(
        &self,
        current: Shared<'_, T>,
        new: Shared<'_, T>,
        success: Ordering,
        failure: Ordering,
        _: &'g Guard<'_>,
    ) -> Result<Shared<'g, T>, Shared<'g, T>> {
        self.ptr
            .compare_exchange(current.ptr, new.ptr, success, failure)
            .map(Shared::from_raw)
            .map_err(Shared::from_raw)
    }
}

impl<T> From<Shared<'_, T>> for Atomic<T> {
    fn from(shared: Shared<'_, T>) -> Self {
        Atomic {
            ptr: AtomicPtr::new(shared.ptr),
        }
    }
}

impl<T> fmt::Debug for Atomic<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Pointer::fmt(&self.ptr.load(Ordering::Relaxed), f)
    }
}

/// A pointer loaded under a guard; valid for the guard's lifetime `'g`.
pub(crate) struct Shared<'g, T> {
    ptr: *mut T,
    _guard: PhantomData<(&'g (), *const T)>,
}

impl<T> Clone for Shared<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Shared<'_, T> {}

impl<T> PartialEq for Shared<'_, T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}

impl<T> Eq for Shared<'_, T> {}

impl<T> From<*const T> for Shared<'_, T> {
    fn from(ptr: *const T) -> Self {
        Shared::from_raw(ptr as *mut T)
    }
}

impl<T> fmt::Debug for Shared<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Pointer::fmt(&self.ptr, f)
    }
}

impl<'g, T> Shared<'g, T> {
    #[inline]
    pub(crate) fn null() -> Self {
        Self::from_raw(ptr::null_mut())
    }

    #[inline]
    fn from_raw(ptr: *mut T) -> Self {
        Shared {
            ptr,
            _guard: PhantomData,
        }
    }

    /// Moves `value` to the heap. The allocation is owned by whoever
    /// publishes or frees the returned pointer.
    pub(crate) fn boxed(value: T, _: &'g Guard<'_>) -> Self {
        Self::from_raw(Box::into_raw(Box::new(value)))
    }

    #[inline]
    pub(crate) fn is_null(&self) -> bool {
        self.ptr.is_null()
    }

    #[inline]
    pub(crate) fn as_ptr(&self) -> *mut T {
        self.ptr
    }

    /// # Safety
    ///
    /// The pointer must be non-null and point to a live `T` that is protected
    /// by the guard this pointer was loaded under.
    #[inline]
    pub(crate) unsafe fn deref(&self) -> &'g T {
        &*self.ptr
    }

    /// # Safety
    ///
    /// Same as [`deref`](Shared::deref), except that null is allowed.
    #[inline]
    pub(crate) unsafe fn as_ref(&self) -> Option<&'g T> {
        self.ptr.as_ref()
    }

    /// Takes back ownership of the allocation.
    ///
    /// # Safety
    ///
    /// The pointer must be non-null, come from [`Shared::boxed`], and no other
    /// thread may be able to reach it.
    #[inline]
    pub(crate) unsafe fn into_box(self) -> Box<T> {
        debug_assert!(!self.is_null());
        Box::from_raw(self.ptr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    struct DropCount(Arc<AtomicUsize>);

    impl Drop for DropCount {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn pin_is_reentrant() {
        let collector = Collector::default();
        let outer = collector.pin();
        {
            let _inner = collector.pin();
        }
        let local = outer.local.unwrap();
        assert!(is_pinned(local.epoch.load(Ordering::SeqCst)));
        drop(outer);
        assert_eq!(local.epoch.load(Ordering::SeqCst), UNPINNED);
    }

    #[test]
    fn retired_object_survives_while_pinned() {
        let collector = Collector::new(1);
        let drops = Arc::new(AtomicUsize::new(0));

        let guard = collector.pin();
        let shared = Shared::boxed(DropCount(drops.clone()), &guard);
        unsafe { guard.retire(shared) };

        for _ in 0..8 {
            guard.flush();
        }
        // we are pinned in the epoch the object was retired in, so the epoch
        // can move at most one step past it
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        assert_eq!(collector.local_garbage(), 1);
        drop(guard);

        for _ in 0..4 {
            collector.pin().flush();
        }
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert_eq!(collector.local_garbage(), 0);
    }

    #[test]
    fn pinned_thread_blocks_advance() {
        let collector = Arc::new(Collector::new(1));
        let (pinned_tx, pinned_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();

        let c = collector.clone();
        let reader = std::thread::spawn(move || {
            let _guard = c.pin();
            pinned_tx.send(()).unwrap();
            release_rx.recv().unwrap();
        });
        pinned_rx.recv().unwrap();

        let start = collector.epoch();
        for _ in 0..8 {
            collector.pin().flush();
        }
        assert!(collector.epoch() <= start + 1);

        release_tx.send(()).unwrap();
        reader.join().unwrap();

        for _ in 0..8 {
            collector.pin().flush();
        }
        assert!(collector.epoch() >= start + 2);
    }

    #[test]
    fn held_guard_spaces_out_collections() {
        let collector = Collector::new(64);
        let drops = Arc::new(AtomicUsize::new(0));

        let guard = collector.pin();
        for _ in 0..40_000 {
            let shared = Shared::boxed(DropCount(drops.clone()), &guard);
            unsafe { guard.retire(shared) };
            guard.try_collect();
        }
        // nothing can be freed while we stay pinned, so the bag only grows and
        // an attempt happens once per 65 retirements
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        assert_eq!(collector.local_garbage(), 40_000);
        assert_eq!(collector.local_attempts(), 40_000 / 65);
        drop(guard);

        for _ in 0..2 {
            collector.pin().flush();
        }
        assert_eq!(drops.load(Ordering::SeqCst), 40_000);
        assert_eq!(collector.local_garbage(), 0);
    }

    #[test]
    fn collect_frees_only_the_expired_prefix() {
        let collector = Collector::new(1_000);
        let drops = Arc::new(AtomicUsize::new(0));

        {
            let guard = collector.pin();
            let shared = Shared::boxed(DropCount(drops.clone()), &guard);
            unsafe { guard.retire(shared) };
            guard.flush();
        }
        let guard = collector.pin();
        let shared = Shared::boxed(DropCount(drops.clone()), &guard);
        unsafe { guard.retire(shared) };
        guard.flush();
        // the first object is two epochs old, the second one is not
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert_eq!(collector.local_garbage(), 1);
    }

    #[test]
    fn unprotected_retire_frees_immediately() {
        let drops = Arc::new(AtomicUsize::new(0));
        let guard = unsafe { Guard::unprotected() };
        let shared = Shared::boxed(DropCount(drops.clone()), &guard);
        unsafe { guard.retire(shared) };
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropping_collector_frees_garbage() {
        let drops = Arc::new(AtomicUsize::new(0));
        let collector = Collector::new(1_000);
        {
            let guard = collector.pin();
            for _ in 0..10 {
                let shared = Shared::boxed(DropCount(drops.clone()), &guard);
                unsafe { guard.retire(shared) };
            }
        }
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        drop(collector);
        assert_eq!(drops.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn atomic_compare_exchange() {
        let guard = unsafe { Guard::unprotected() };
        let atomic = Atomic::null();
        let a = Shared::boxed(1, &guard);
        let b = Shared::boxed(2, &guard);

        assert!(atomic
            .compare_exchange(Shared::null(), a, Ordering::AcqRel, Ordering::Acquire, &guard)
            .is_ok());
        let current = atomic
            .compare_exchange(Shared::null(), b, Ordering::AcqRel, Ordering::Acquire, &guard)
            .unwrap_err();
        assert_eq!(current, a);
        assert_eq!(unsafe { *atomic.load(Ordering::SeqCst, &guard).deref() }, 1);

        unsafe {
            drop(a.into_box());
            drop(b.into_box());
        }
    }
}
