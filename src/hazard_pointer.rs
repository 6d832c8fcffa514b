//! Per-thread record of the hazard pointer collector.

use crate::hazard_gc::Stat;
use crate::retired::RetiredList;
use crate::util::{WrappedAlign64Type, NULL_THREAD_ID};
use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{self, AtomicBool, AtomicI64, AtomicPtr, AtomicUsize, Ordering};

#[derive(Default)]
pub(crate) struct RecordStat {
    pub guard_allocated: AtomicUsize,
    pub guard_freed: AtomicUsize,
    pub retired_count: AtomicUsize,
    pub free_count: AtomicUsize,
    pub scan_count: AtomicUsize,
    pub help_scan_count: AtomicUsize,
}

impl RecordStat {
    #[inline]
    pub fn inc(counter: &AtomicUsize, n: usize) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

/// Hazard pointers and retired pointers of one thread.
///
/// Records form a singly linked list that only grows while the collector lives, so a scanning
/// thread may walk it without any lock. Hazard slots are written by the owner and read by every
/// scanning thread. Slot bookkeeping and the retired list belong to whoever owns the record,
/// ownership being taken by a CAS of `owner` from `NULL_THREAD_ID`.
pub(crate) struct ThreadRecord {
    owner: WrappedAlign64Type<AtomicI64>,
    free: AtomicBool,
    next: AtomicPtr<ThreadRecord>,
    hazards: Box<[AtomicPtr<()>]>,
    free_slots: UnsafeCell<Vec<usize>>,
    /// Bumped by `reset_slots`, slots taken before belong to no guard any more.
    slot_generation: AtomicUsize,
    retired: UnsafeCell<RetiredList>,
    pub stat: RecordStat,
}

unsafe impl Send for ThreadRecord {}
unsafe impl Sync for ThreadRecord {}

impl ThreadRecord {
    pub fn new(hazard_ptr_count: usize, retired_capacity: usize, owner: i64) -> ThreadRecord {
        ThreadRecord {
            owner: WrappedAlign64Type(AtomicI64::new(owner)),
            free: AtomicBool::new(owner == NULL_THREAD_ID),
            next: AtomicPtr::new(ptr::null_mut()),
            hazards: (0..hazard_ptr_count)
                .map(|_| AtomicPtr::new(ptr::null_mut()))
                .collect(),
            free_slots: UnsafeCell::new((0..hazard_ptr_count).rev().collect()),
            slot_generation: AtomicUsize::new(0),
            retired: UnsafeCell::new(RetiredList::new(retired_capacity)),
            stat: RecordStat::default(),
        }
    }

    #[inline]
    pub fn owner(&self) -> i64 {
        self.owner.load(Ordering::Acquire)
    }

    /// Take ownership of an unowned record.
    #[inline]
    pub fn try_acquire(&self, tid: i64) -> bool {
        self.owner.load(Ordering::Relaxed) == NULL_THREAD_ID
            && self
                .owner
                .compare_exchange(NULL_THREAD_ID, tid, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
    }

    #[inline]
    pub fn release(&self) {
        self.owner.store(NULL_THREAD_ID, Ordering::Release);
    }

    /// A free record has nothing left to reclaim.
    #[inline]
    pub fn is_free(&self) -> bool {
        self.free.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_free(&self, free: bool) {
        self.free.store(free, Ordering::Release);
    }

    #[inline]
    pub fn next(&self) -> *mut ThreadRecord {
        self.next.load(Ordering::Acquire)
    }

    /// Only before the record is published.
    #[inline]
    pub fn set_next(&self, next: *mut ThreadRecord) {
        self.next.store(next, Ordering::Relaxed);
    }

    #[inline]
    pub fn hazard_count(&self) -> usize {
        self.hazards.len()
    }

    #[inline]
    pub fn hazard(&self, idx: usize) -> *mut () {
        self.hazards[idx].load(Ordering::Acquire)
    }

    /// Publish `ptr` in slot `idx`. The fence orders the publication before any later load of
    /// the source the pointer was read from.
    #[inline]
    pub fn set_hazard(&self, idx: usize, ptr: *mut ()) {
        self.hazards[idx].store(ptr, Ordering::Release);
        atomic::fence(Ordering::SeqCst);
    }

    #[inline]
    pub fn clear_hazard(&self, idx: usize) {
        self.hazards[idx].store(ptr::null_mut(), Ordering::Release);
    }

    pub fn clear_hazards(&self) {
        for hp in self.hazards.iter() {
            hp.store(ptr::null_mut(), Ordering::Release);
        }
    }

    /// Call `f` with every published hazard.
    pub fn for_each_hazard<F: FnMut(*mut ())>(&self, mut f: F) {
        for hp in self.hazards.iter() {
            let p = hp.load(Ordering::Acquire);
            if !p.is_null() {
                f(p);
            }
        }
    }

    /// Take a free guard slot.
    ///
    /// # Safety
    ///
    /// Only the owner of the record may call it.
    pub unsafe fn alloc_slot(&self) -> Option<usize> {
        let idx = (*self.free_slots.get()).pop()?;
        RecordStat::inc(&self.stat.guard_allocated, 1);
        Some(idx)
    }

    /// Generation the slots taken now belong to.
    #[inline]
    pub fn slot_generation(&self) -> usize {
        self.slot_generation.load(Ordering::Acquire)
    }

    /// Clear slot `idx` and give it back. Ignored when the slots were reset since `generation`.
    ///
    /// # Safety
    ///
    /// Only the owner of the record may call it, with a slot taken by `alloc_slot` in
    /// `generation`.
    pub unsafe fn free_slot(&self, idx: usize, generation: usize) {
        if generation != self.slot_generation() {
            return;
        }
        self.clear_hazard(idx);
        let slots = &mut *self.free_slots.get();
        debug_assert!(!slots.contains(&idx), "guard slot {} freed twice", idx);
        slots.push(idx);
        RecordStat::inc(&self.stat.guard_freed, 1);
    }

    /// Number of slots currently taken by guards.
    ///
    /// # Safety
    ///
    /// Only the owner of the record may call it.
    pub unsafe fn guards_in_use(&self) -> usize {
        self.hazards.len() - (*self.free_slots.get()).len()
    }

    /// Forget every taken slot, used when a record is reclaimed from its owner.
    ///
    /// # Safety
    ///
    /// No guard of the record may be used afterwards.
    pub unsafe fn reset_slots(&self) {
        self.clear_hazards();
        self.slot_generation.fetch_add(1, Ordering::AcqRel);
        RecordStat::inc(&self.stat.guard_freed, self.guards_in_use());
        let slots = &mut *self.free_slots.get();
        slots.clear();
        slots.extend((0..self.hazards.len()).rev());
    }

    /// # Safety
    ///
    /// Only the owner of the record may call it, and the returned reference must not outlive a
    /// call that may re-enter the collector.
    #[allow(clippy::mut_from_ref)]
    #[inline]
    pub unsafe fn retired_mut(&self) -> &mut RetiredList {
        &mut *self.retired.get()
    }

    pub fn accumulate(&self, stat: &mut Stat) {
        stat.guard_allocated += self.stat.guard_allocated.load(Ordering::Relaxed);
        stat.guard_freed += self.stat.guard_freed.load(Ordering::Relaxed);
        stat.retired_count += self.stat.retired_count.load(Ordering::Relaxed);
        stat.free_count += self.stat.free_count.load(Ordering::Relaxed);
        stat.scan_count += self.stat.scan_count.load(Ordering::Relaxed);
        stat.help_scan_count += self.stat.help_scan_count.load(Ordering::Relaxed);
    }
}

impl Drop for ThreadRecord {
    fn drop(&mut self) {
        let rest = self.retired.get_mut().take_all();
        RecordStat::inc(&self.stat.free_count, rest.len());
        for r in rest {
            unsafe { r.free() };
        }
    }
}
