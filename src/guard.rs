//! Hazard pointer guards and the smart pointers built on them.
//!
//! A `Guard` owns one hazard pointer slot of current thread for its lifetime. While it holds an
//! address, no scan of any thread frees that address. `GuardArray` owns several slots at once.
//! `GuardedPtr` pairs a guard with a typed pointer into the guarded object, `ExemptPtr` owns an
//! object already unlinked from its container and retires it when dropped.

use crate::atomic::HazardSource;
use crate::error::{Result, Status};
use crate::hazard_gc::HazardGc;
use crate::hazard_pointer::ThreadRecord;
use crate::retired::Disposer;
use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::ptr;

/// One hazard pointer slot of current thread.
///
/// # Examples
///
/// ```
/// use rs_hazard_gc::atomic::Atomic;
/// use rs_hazard_gc::guard::Guard;
/// use rs_hazard_gc::hazard_gc::HazardGc;
/// use std::sync::atomic::Ordering;
///
/// let gc = HazardGc::default_new().unwrap();
/// let shared: Atomic<i32> = Atomic::new(Box::into_raw(Box::new(7)));
/// let guard = Guard::new(&gc).unwrap();
/// let p = guard.protect(&shared);
/// assert_eq!(unsafe { *p }, 7);
/// let old = shared.swap(std::ptr::null_mut(), Ordering::AcqRel);
/// unsafe { gc.retire_box(old).unwrap(); }
/// gc.scan().unwrap();
/// // still protected
/// assert_eq!(unsafe { *p }, 7);
/// drop(guard);
/// gc.scan().unwrap();
/// assert_eq!(gc.statistics().free_count, 1);
/// ```
///
pub struct Guard<'g> {
    rec: &'g ThreadRecord,
    idx: usize,
    generation: usize,
    _marker: PhantomData<*mut ()>,
}

impl<'g> Guard<'g> {
    /// Take a free slot of current thread, attaching the thread if needed.
    pub fn new(gc: &'g HazardGc) -> Result<Guard<'g>> {
        let rec = gc.current_record()?;
        Self::with_record(rec)
    }

    fn with_record(rec: &'g ThreadRecord) -> Result<Guard<'g>> {
        match unsafe { rec.alloc_slot() } {
            Some(idx) => Ok(Guard {
                rec,
                idx,
                generation: rec.slot_generation(),
                _marker: PhantomData,
            }),
            None => {
                warn!(
                    "thread {} has no free guard slot of {}",
                    rec.owner(),
                    rec.hazard_count()
                );
                Err(Status::GuardsExhausted)
            }
        }
    }

    /// Load `src` and protect the loaded value. The value is published, then `src` is loaded
    /// again until both loads agree, so the returned value was reachable from `src` after the
    /// guard became visible to scanners.
    pub fn protect<S: HazardSource>(&self, src: &S) -> S::Ptr {
        let mut cur = src.load_hazard();
        loop {
            self.rec.set_hazard(self.idx, S::hazard_address(cur));
            let reloaded = src.load_hazard();
            if reloaded == cur {
                return cur;
            }
            cur = reloaded;
        }
    }

    /// Publish `ptr` without validation. The caller must know `ptr` is not retired yet.
    pub fn assign<T>(&self, ptr: *const T) -> *const T {
        self.rec.set_hazard(self.idx, ptr as *mut ());
        ptr
    }

    /// Protect what `other` protects.
    pub fn copy_from(&self, other: &Guard) {
        self.rec.set_hazard(self.idx, other.get_native());
    }

    pub fn clear(&self) {
        self.rec.clear_hazard(self.idx);
    }

    #[inline]
    pub fn get<T>(&self) -> *mut T {
        self.get_native() as *mut T
    }

    #[inline]
    pub fn get_native(&self) -> *mut () {
        self.rec.hazard(self.idx)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.get_native().is_null()
    }
}

impl<'g> Drop for Guard<'g> {
    fn drop(&mut self) {
        unsafe { self.rec.free_slot(self.idx, self.generation) };
    }
}

impl<'g> fmt::Debug for Guard<'g> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Guard")
            .field("slot", &self.idx)
            .field("hazard", &self.get_native())
            .finish()
    }
}

/// `N` hazard pointer slots of current thread, taken all at once.
pub struct GuardArray<'g, const N: usize> {
    rec: &'g ThreadRecord,
    idx: [usize; N],
    generation: usize,
    _marker: PhantomData<*mut ()>,
}

impl<'g, const N: usize> GuardArray<'g, N> {
    /// Take `N` slots, or none of them.
    pub fn new(gc: &'g HazardGc) -> Result<GuardArray<'g, N>> {
        let rec = gc.current_record()?;
        let generation = rec.slot_generation();
        let mut idx = [0; N];
        for i in 0..N {
            match unsafe { rec.alloc_slot() } {
                Some(slot) => idx[i] = slot,
                None => {
                    for slot in idx.iter().take(i) {
                        unsafe { rec.free_slot(*slot, generation) };
                    }
                    warn!(
                        "thread {} can not take {} guard slots of {}",
                        rec.owner(),
                        N,
                        rec.hazard_count()
                    );
                    return Err(Status::GuardsExhausted);
                }
            }
        }
        Ok(GuardArray {
            rec,
            idx,
            generation,
            _marker: PhantomData,
        })
    }

    #[inline]
    pub const fn capacity(&self) -> usize {
        N
    }

    /// Same as `Guard::protect`, with slot `i`.
    pub fn protect<S: HazardSource>(&self, i: usize, src: &S) -> S::Ptr {
        let mut cur = src.load_hazard();
        loop {
            self.rec.set_hazard(self.idx[i], S::hazard_address(cur));
            let reloaded = src.load_hazard();
            if reloaded == cur {
                return cur;
            }
            cur = reloaded;
        }
    }

    pub fn assign<T>(&self, i: usize, ptr: *const T) -> *const T {
        self.rec.set_hazard(self.idx[i], ptr as *mut ());
        ptr
    }

    /// Slot `dst` protects what slot `src` protects.
    pub fn copy(&self, dst: usize, src: usize) {
        self.rec.set_hazard(self.idx[dst], self.get_native(src));
    }

    pub fn clear(&self, i: usize) {
        self.rec.clear_hazard(self.idx[i]);
    }

    #[inline]
    pub fn get<T>(&self, i: usize) -> *mut T {
        self.get_native(i) as *mut T
    }

    #[inline]
    pub fn get_native(&self, i: usize) -> *mut () {
        self.rec.hazard(self.idx[i])
    }

    /// Protect in a new `Guard` what slot `i` protects.
    pub fn to_guard(&self, i: usize) -> Result<Guard<'g>> {
        let guard = Guard::with_record(self.rec)?;
        guard.assign(self.get_native(i));
        Ok(guard)
    }
}

impl<'g, const N: usize> Drop for GuardArray<'g, N> {
    fn drop(&mut self) {
        for slot in self.idx.iter() {
            unsafe { self.rec.free_slot(*slot, self.generation) };
        }
    }
}

/// Pointer to a value kept alive by a hazard pointer guard.
pub struct GuardedPtr<'g, T> {
    guard: Guard<'g>,
    ptr: *const T,
}

impl<'g, T> GuardedPtr<'g, T> {
    /// `guard` must protect the object `ptr` points into.
    pub(crate) fn new(guard: Guard<'g>, ptr: *const T) -> GuardedPtr<'g, T> {
        GuardedPtr { guard, ptr }
    }

    /// Duplicate the protection in a new guard slot.
    pub fn try_clone(&self) -> Result<GuardedPtr<'g, T>> {
        let guard = Guard::with_record(self.guard.rec)?;
        guard.copy_from(&self.guard);
        Ok(GuardedPtr {
            guard,
            ptr: self.ptr,
        })
    }

    #[inline]
    pub fn as_ptr(&self) -> *const T {
        self.ptr
    }
}

impl<'g, T> Clone for GuardedPtr<'g, T> {
    /// Panics if current thread has no free guard slot.
    fn clone(&self) -> Self {
        match self.try_clone() {
            Ok(p) => p,
            Err(e) => panic!("clone GuardedPtr fail, ret={}", e),
        }
    }
}

impl<'g, T> Deref for GuardedPtr<'g, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.ptr }
    }
}

impl<'g, T: fmt::Debug> fmt::Debug for GuardedPtr<'g, T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("GuardedPtr").field(&**self).finish()
    }
}

unsafe fn retire_erased<N: Send + 'static, D: Disposer<N>>(
    gc: &HazardGc,
    node: *mut (),
) -> Result<()> {
    gc.retire::<N, D>(node as *mut N)
}

/// Value of an object unlinked from its container. No other thread can reach the object any
/// more except through guards taken before, so the object is retired when this pointer drops.
pub struct ExemptPtr<'g, T> {
    gc: &'g HazardGc,
    node: *mut (),
    value: *const T,
    retire: unsafe fn(&HazardGc, *mut ()) -> Result<()>,
}

impl<'g, T> ExemptPtr<'g, T> {
    /// `node` must be unlinked and owned by the caller, `value` must point into it. `node` is
    /// retired with `D` on drop.
    pub(crate) unsafe fn new<N: Send + 'static, D: Disposer<N>>(
        gc: &'g HazardGc,
        node: *mut N,
        value: *const T,
    ) -> ExemptPtr<'g, T> {
        ExemptPtr {
            gc,
            node: node as *mut (),
            value,
            retire: retire_erased::<N, D>,
        }
    }

    /// Retire the object now.
    pub fn release(self) {
        drop(self)
    }
}

impl<'g, T> Deref for ExemptPtr<'g, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.value }
    }
}

impl<'g, T> Drop for ExemptPtr<'g, T> {
    fn drop(&mut self) {
        if !self.node.is_null() {
            let node = std::mem::replace(&mut self.node, ptr::null_mut());
            // failures are logged by the collector
            let _ = unsafe { (self.retire)(self.gc, node) };
        }
    }
}

impl<'g, T: fmt::Debug> fmt::Debug for ExemptPtr<'g, T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("ExemptPtr").field(&**self).finish()
    }
}
