//! Memory model abstraction.
//!
//! Every atomic operation of the containers goes through a `MemoryModel`, which maps the ordering
//! an algorithm asks for to the ordering actually used. `RelaxedOrdering` keeps the minimal
//! ordering each operation needs and is the default; `SequentialConsistent` forces `SeqCst`
//! everywhere, which is handy when hunting ordering bugs.
//!
//! `MarkedPtr` packs a one-bit mark into the low bit of an aligned pointer. Lists use it as the
//! logical-deletion flag of a node's own link.

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{self, AtomicBool, AtomicPtr, AtomicUsize, Ordering};

/// Ordering policy applied to every atomic operation.
pub trait MemoryModel: Send + Sync + 'static {
    /// Ordering used when an operation asks for `order`.
    fn order(order: Ordering) -> Ordering;

    /// Failure ordering of a compare-and-swap whose success ordering is `success`.
    #[inline]
    fn failure_order(success: Ordering) -> Ordering {
        match Self::order(success) {
            Ordering::AcqRel => Ordering::Acquire,
            Ordering::Release => Ordering::Relaxed,
            o => o,
        }
    }
}

/// Minimal ordering each operation requires.
#[derive(Debug, Default, Copy, Clone)]
pub struct RelaxedOrdering;

impl MemoryModel for RelaxedOrdering {
    #[inline]
    fn order(order: Ordering) -> Ordering {
        order
    }
}

/// `SeqCst` everywhere.
#[derive(Debug, Default, Copy, Clone)]
pub struct SequentialConsistent;

impl MemoryModel for SequentialConsistent {
    #[inline]
    fn order(_order: Ordering) -> Ordering {
        Ordering::SeqCst
    }
}

/// Memory fence under the policy `M`. A relaxed fence is a no-op.
#[inline]
pub fn fence<M: MemoryModel>(order: Ordering) {
    let order = M::order(order);
    if order != Ordering::Relaxed {
        atomic::fence(order);
    }
}

/// Atomic cell a hazard pointer can be published for.
pub trait HazardSource {
    /// Value kept in the cell.
    type Ptr: Copy + PartialEq;

    /// Load the current value with (at least) acquire ordering.
    fn load_hazard(&self) -> Self::Ptr;

    /// The address a hazard pointer has to publish to protect `ptr`.
    fn hazard_address(ptr: Self::Ptr) -> *mut ();
}

impl<T> HazardSource for AtomicPtr<T> {
    type Ptr = *mut T;

    #[inline]
    fn load_hazard(&self) -> *mut T {
        self.load(Ordering::Acquire)
    }

    #[inline]
    fn hazard_address(ptr: *mut T) -> *mut () {
        ptr as *mut ()
    }
}

/// Atomic raw pointer under the policy `M`.
pub struct Atomic<T, M = RelaxedOrdering> {
    ptr: AtomicPtr<T>,
    _model: PhantomData<M>,
}

impl<T, M: MemoryModel> Atomic<T, M> {
    pub fn new(ptr: *mut T) -> Self {
        Atomic {
            ptr: AtomicPtr::new(ptr),
            _model: PhantomData,
        }
    }

    pub fn null() -> Self {
        Self::new(std::ptr::null_mut())
    }

    #[inline]
    pub fn load(&self, order: Ordering) -> *mut T {
        self.ptr.load(M::order(order))
    }

    #[inline]
    pub fn store(&self, ptr: *mut T, order: Ordering) {
        self.ptr.store(ptr, M::order(order))
    }

    #[inline]
    pub fn swap(&self, ptr: *mut T, order: Ordering) -> *mut T {
        self.ptr.swap(ptr, M::order(order))
    }

    /// Strong compare-and-swap. On failure `expected` receives the current value.
    #[inline]
    pub fn compare_exchange(
        &self,
        expected: &mut *mut T,
        desired: *mut T,
        success: Ordering,
        failure: Ordering,
    ) -> bool {
        match self
            .ptr
            .compare_exchange(*expected, desired, M::order(success), M::order(failure))
        {
            Ok(_) => true,
            Err(cur) => {
                *expected = cur;
                false
            }
        }
    }

    /// Weak compare-and-swap, may fail spuriously.
    #[inline]
    pub fn compare_exchange_weak(
        &self,
        expected: &mut *mut T,
        desired: *mut T,
        success: Ordering,
        failure: Ordering,
    ) -> bool {
        match self
            .ptr
            .compare_exchange_weak(*expected, desired, M::order(success), M::order(failure))
        {
            Ok(_) => true,
            Err(cur) => {
                *expected = cur;
                false
            }
        }
    }
}

impl<T, M: MemoryModel> HazardSource for Atomic<T, M> {
    type Ptr = *mut T;

    #[inline]
    fn load_hazard(&self) -> *mut T {
        self.load(Ordering::Acquire)
    }

    #[inline]
    fn hazard_address(ptr: *mut T) -> *mut () {
        ptr as *mut ()
    }
}

impl<T, M: MemoryModel> Default for Atomic<T, M> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T, M: MemoryModel> fmt::Debug for Atomic<T, M> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Atomic({:p})", self.load(Ordering::Relaxed))
    }
}

const MARK_BIT: usize = 1;

/// Pointer with a one-bit mark kept in its lowest bit.
pub struct MarkedPtr<T> {
    raw: usize,
    _marker: PhantomData<*mut T>,
}

impl<T> MarkedPtr<T> {
    #[inline]
    pub fn new(ptr: *mut T, marked: bool) -> Self {
        debug_assert_eq!(ptr as usize & MARK_BIT, 0, "pointer is not aligned");
        MarkedPtr {
            raw: ptr as usize | marked as usize,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn null() -> Self {
        Self::new(std::ptr::null_mut(), false)
    }

    #[inline]
    fn from_raw(raw: usize) -> Self {
        MarkedPtr {
            raw,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn ptr(&self) -> *mut T {
        (self.raw & !MARK_BIT) as *mut T
    }

    #[inline]
    pub fn is_marked(&self) -> bool {
        self.raw & MARK_BIT != 0
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.ptr().is_null()
    }

    #[inline]
    pub fn with_mark(&self, marked: bool) -> Self {
        Self::new(self.ptr(), marked)
    }
}

impl<T> Copy for MarkedPtr<T> {}

impl<T> Clone for MarkedPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> PartialEq for MarkedPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl<T> Eq for MarkedPtr<T> {}

impl<T> fmt::Debug for MarkedPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "MarkedPtr({:p}, {})", self.ptr(), self.is_marked())
    }
}

/// Atomic `MarkedPtr` under the policy `M`.
pub struct AtomicMarkedPtr<T, M = RelaxedOrdering> {
    raw: AtomicUsize,
    _marker: PhantomData<(*mut T, M)>,
}

unsafe impl<T, M> Send for AtomicMarkedPtr<T, M> {}
unsafe impl<T, M> Sync for AtomicMarkedPtr<T, M> {}

impl<T, M: MemoryModel> AtomicMarkedPtr<T, M> {
    pub fn new(ptr: MarkedPtr<T>) -> Self {
        AtomicMarkedPtr {
            raw: AtomicUsize::new(ptr.raw),
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn load(&self, order: Ordering) -> MarkedPtr<T> {
        MarkedPtr::from_raw(self.raw.load(M::order(order)))
    }

    #[inline]
    pub fn store(&self, ptr: MarkedPtr<T>, order: Ordering) {
        self.raw.store(ptr.raw, M::order(order))
    }

    /// Strong compare-and-swap. On failure `expected` receives the current value.
    #[inline]
    pub fn compare_exchange(
        &self,
        expected: &mut MarkedPtr<T>,
        desired: MarkedPtr<T>,
        success: Ordering,
        failure: Ordering,
    ) -> bool {
        match self.raw.compare_exchange(
            expected.raw,
            desired.raw,
            M::order(success),
            M::order(failure),
        ) {
            Ok(_) => true,
            Err(cur) => {
                expected.raw = cur;
                false
            }
        }
    }
}

impl<T, M: MemoryModel> HazardSource for AtomicMarkedPtr<T, M> {
    type Ptr = MarkedPtr<T>;

    #[inline]
    fn load_hazard(&self) -> MarkedPtr<T> {
        self.load(Ordering::Acquire)
    }

    #[inline]
    fn hazard_address(ptr: MarkedPtr<T>) -> *mut () {
        ptr.ptr() as *mut ()
    }
}

impl<T, M: MemoryModel> Default for AtomicMarkedPtr<T, M> {
    fn default() -> Self {
        Self::new(MarkedPtr::null())
    }
}

/// Atomic boolean flag under the policy `M`.
pub struct AtomicFlag<M = RelaxedOrdering> {
    flag: AtomicBool,
    _model: PhantomData<M>,
}

impl<M: MemoryModel> AtomicFlag<M> {
    pub fn new(v: bool) -> Self {
        AtomicFlag {
            flag: AtomicBool::new(v),
            _model: PhantomData,
        }
    }

    #[inline]
    pub fn load(&self, order: Ordering) -> bool {
        self.flag.load(M::order(order))
    }

    #[inline]
    pub fn store(&self, v: bool, order: Ordering) {
        self.flag.store(v, M::order(order))
    }
}

/// Atomic counter under the policy `M`.
pub struct AtomicCounter<M = RelaxedOrdering> {
    cnt: AtomicUsize,
    _model: PhantomData<M>,
}

impl<M: MemoryModel> AtomicCounter<M> {
    pub fn new(v: usize) -> Self {
        AtomicCounter {
            cnt: AtomicUsize::new(v),
            _model: PhantomData,
        }
    }

    #[inline]
    pub fn load(&self, order: Ordering) -> usize {
        self.cnt.load(M::order(order))
    }

    #[inline]
    pub fn fetch_add(&self, v: usize, order: Ordering) -> usize {
        self.cnt.fetch_add(v, M::order(order))
    }

    #[inline]
    pub fn fetch_sub(&self, v: usize, order: Ordering) -> usize {
        self.cnt.fetch_sub(v, M::order(order))
    }

    #[inline]
    pub fn reset(&self, order: Ordering) {
        self.cnt.store(0, M::order(order))
    }
}

impl<M: MemoryModel> Default for AtomicCounter<M> {
    fn default() -> Self {
        Self::new(0)
    }
}
