//! Retired pointers waiting for reclamation.

use std::mem;

/// Disposal of a retired object of type `T`.
pub trait Disposer<T> {
    /// Release `ptr`. Called exactly once, when no hazard pointer protects `ptr` any more.
    unsafe fn dispose(ptr: *mut T);
}

/// Drops objects allocated with `Box`.
#[derive(Debug, Default, Copy, Clone)]
pub struct BoxDisposer;

impl<T> Disposer<T> for BoxDisposer {
    unsafe fn dispose(ptr: *mut T) {
        drop(Box::from_raw(ptr));
    }
}

unsafe fn dispose_erased<T, D: Disposer<T>>(ptr: *mut ()) {
    D::dispose(ptr as *mut T)
}

/// Type erased disposer of `T` through `D`.
pub fn erased_disposer<T, D: Disposer<T>>() -> unsafe fn(*mut ()) {
    dispose_erased::<T, D>
}

/// A retired pointer and the function releasing it.
#[derive(Copy, Clone)]
pub struct RetiredPtr {
    ptr: *mut (),
    disposer: unsafe fn(*mut ()),
    guarded: bool,
}

impl RetiredPtr {
    pub fn new(ptr: *mut (), disposer: unsafe fn(*mut ())) -> Self {
        RetiredPtr {
            ptr,
            disposer,
            guarded: false,
        }
    }

    #[inline]
    pub fn ptr(&self) -> *mut () {
        self.ptr
    }

    /// Invoke the disposer.
    pub unsafe fn free(self) {
        (self.disposer)(self.ptr)
    }
}

/// Per-thread list of retired pointers. `capacity` is the size that triggers a scan, the list
/// itself grows past it rather than dropping a retirement.
pub struct RetiredList {
    items: Vec<RetiredPtr>,
    capacity: usize,
}

impl RetiredList {
    pub fn new(capacity: usize) -> RetiredList {
        RetiredList {
            items: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Append `retired`. Return false once the list is full and must be scanned.
    pub fn push(&mut self, retired: RetiredPtr) -> bool {
        debug_assert!(
            self.items.iter().all(|r| r.ptr != retired.ptr),
            "pointer {:p} retired twice",
            retired.ptr
        );
        self.items.push(retired);
        !self.is_full()
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.items.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Remove and return the entries `is_hazard` rejects.
    pub fn take_reclaimable<F>(&mut self, mut is_hazard: F) -> Vec<RetiredPtr>
    where
        F: FnMut(*mut ()) -> bool,
    {
        let mut reclaimable = Vec::new();
        self.items.retain(|r| {
            if is_hazard(r.ptr) {
                true
            } else {
                reclaimable.push(*r);
                false
            }
        });
        reclaimable
    }

    /// Sort entries by address, preparing `mark_guarded`.
    pub fn sort_by_address(&mut self) {
        self.items.sort_unstable_by_key(|r| r.ptr as usize);
        debug_assert!(
            self.items.windows(2).all(|w| w[0].ptr != w[1].ptr),
            "double retirement detected"
        );
    }

    /// Mark the entry retiring `ptr` as still guarded. The list must be sorted.
    pub fn mark_guarded(&mut self, ptr: *mut ()) -> bool {
        match self
            .items
            .binary_search_by_key(&(ptr as usize), |r| r.ptr as usize)
        {
            Ok(idx) => {
                self.items[idx].guarded = true;
                true
            }
            Err(_) => false,
        }
    }

    /// Remove and return unmarked entries, clearing marks of the kept ones.
    pub fn take_unmarked(&mut self) -> Vec<RetiredPtr> {
        let mut reclaimable = Vec::new();
        self.items.retain(|r| {
            if !r.guarded {
                reclaimable.push(*r);
            }
            r.guarded
        });
        for r in self.items.iter_mut() {
            r.guarded = false;
        }
        reclaimable
    }

    /// Remove and return all entries.
    pub fn take_all(&mut self) -> Vec<RetiredPtr> {
        mem::replace(&mut self.items, Vec::with_capacity(self.capacity))
    }
}
