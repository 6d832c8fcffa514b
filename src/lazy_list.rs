//! Definition and implementations of `LazyList`
//!
//! Lazy list of Heller, Herlihy, Luchangco, Moir, Scherer and Shavit: an ordered singly linked
//! list where lookups never lock and updates lock only the two nodes around the change. Nodes
//! are logically deleted by marking the low bit of their own `next` link, then physically
//! unlinked, then retired to `HazardGc`. Traversal protects every node with a hazard pointer
//! and starts over from the head when it reads a marked link, so a protected node is always
//! one that was still linked after its guard was published.
use crate::atomic::{AtomicCounter, AtomicMarkedPtr, MarkedPtr, MemoryModel, RelaxedOrdering};
use crate::backoff::{Backoff, DefaultBackoff};
use crate::error::Result;
use crate::guard::{ExemptPtr, GuardArray, GuardedPtr};
use crate::hazard_gc::HazardGc;
use crate::list_stat::{ListStat, ListStatSnapshot};
use crate::retired::BoxDisposer;
use crate::spin_lock::SpinLock;
use std::borrow::Borrow;
use std::cmp;
use std::ptr;
use std::sync::atomic::Ordering;

/// Guards one thread needs for `LazyList` operations, a `GuardedPtr` returned by `get`
/// included.
pub const HAZARD_PTR_COUNT: usize = 3;

const PRED: usize = 0;
const CUR: usize = 1;

type NodePtr<K, V, M, B> = *mut Node<K, V, M, B>;

struct Node<K, V, M: MemoryModel, B> {
    /// None for head and tail.
    entry: Option<(K, V)>,
    next: AtomicMarkedPtr<Node<K, V, M, B>, M>,
    lock: SpinLock<B>,
}

// nodes are freed by whichever thread reclaims them, the lock holds no `B`
unsafe impl<K: Send, V: Send, M: MemoryModel, B> Send for Node<K, V, M, B> {}

impl<K, V, M: MemoryModel, B> Node<K, V, M, B> {
    fn new(entry: Option<(K, V)>, next: NodePtr<K, V, M, B>) -> Self {
        Node {
            entry,
            next: AtomicMarkedPtr::new(MarkedPtr::new(next, false)),
            lock: SpinLock::new(),
        }
    }

    #[inline]
    fn is_marked(&self) -> bool {
        self.next.load(Ordering::Acquire).is_marked()
    }

    /// Order of the node relative to `key`, the tail being greater than any key.
    #[inline]
    fn compare<Q>(&self, key: &Q) -> cmp::Ordering
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        match self.entry {
            Some((ref k, _)) => k.borrow().cmp(key),
            None => cmp::Ordering::Greater,
        }
    }
}

/// Ordered key-value list with lock-free lookups and fine-grained locking updates. `M` selects
/// the ordering of link operations, `B` the back-off of node locks.
///
/// # Examples
///
/// ```
/// use rs_hazard_gc::hazard_gc::HazardGc;
/// use rs_hazard_gc::lazy_list::LazyList;
///
/// let gc = HazardGc::default_new().unwrap();
/// let list: LazyList<String, u32> = LazyList::new(&gc).unwrap();
/// assert!(list.insert("b".to_string(), 2));
/// assert!(list.insert("a".to_string(), 1));
/// assert!(!list.insert("a".to_string(), 3));
/// assert_eq!(*list.get("a").unwrap(), 1);
/// assert!(list.erase("a"));
/// assert!(!list.contains("a"));
/// assert_eq!(list.len(), 1);
/// ```
///
/// Erased nodes are freed later, possibly by another thread, so entries can not borrow from
/// the caller:
///
/// ```compile_fail
/// use rs_hazard_gc::hazard_gc::HazardGc;
/// use rs_hazard_gc::lazy_list::LazyList;
///
/// let gc = HazardGc::default_new().unwrap();
/// let local = 5u64;
/// let list: LazyList<u32, &u64> = LazyList::new(&gc).unwrap();
/// list.insert(1, &local);
/// ```
///
pub struct LazyList<K, V, M: MemoryModel = RelaxedOrdering, B = DefaultBackoff> {
    gc: HazardGc,
    head: NodePtr<K, V, M, B>,
    tail: NodePtr<K, V, M, B>,
    item_counter: AtomicCounter<M>,
    stat: ListStat,
}

unsafe impl<K: Send + Sync, V: Send + Sync, M: MemoryModel, B> Send for LazyList<K, V, M, B> {}
unsafe impl<K: Send + Sync, V: Send + Sync, M: MemoryModel, B> Sync for LazyList<K, V, M, B> {}

impl<K, V, M, B> LazyList<K, V, M, B>
where
    K: Ord + Send + 'static,
    V: Send + 'static,
    M: MemoryModel,
    B: Backoff + 'static,
{
    /// Create an empty list reclaimed by `gc`. Fails if `gc` has fewer than `HAZARD_PTR_COUNT`
    /// hazard pointers per thread.
    pub fn new(gc: &HazardGc) -> Result<Self> {
        gc.check_available_guards(HAZARD_PTR_COUNT)?;
        let tail = Box::into_raw(Box::new(Node::new(None, ptr::null_mut())));
        let head = Box::into_raw(Box::new(Node::new(None, tail)));
        Ok(LazyList {
            gc: gc.clone(),
            head,
            tail,
            item_counter: AtomicCounter::new(0),
            stat: ListStat::default(),
        })
    }

    pub fn gc(&self) -> &HazardGc {
        &self.gc
    }

    fn guards(&self) -> GuardArray<'_, 2> {
        match GuardArray::new(&self.gc) {
            Ok(guards) => guards,
            Err(e) => panic!("LazyList needs 2 free guards, ret={}", e),
        }
    }

    /// Find the first node not less than `key` and its predecessor, both protected by `guards`.
    unsafe fn search<Q>(
        &self,
        key: &Q,
        guards: &GuardArray<'_, 2>,
    ) -> (NodePtr<K, V, M, B>, NodePtr<K, V, M, B>)
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        'restart: loop {
            let mut pred = self.head;
            guards.assign(PRED, pred);
            let mut cur = guards.protect(CUR, &(*pred).next).ptr();
            loop {
                if (*cur).compare(key) != cmp::Ordering::Less {
                    return (pred, cur);
                }
                guards.copy(PRED, CUR);
                pred = cur;
                let next = guards.protect(CUR, &(*pred).next);
                if next.is_marked() {
                    continue 'restart;
                }
                cur = next.ptr();
            }
        }
    }

    /// Both nodes alive and adjacent. Call with both locked.
    unsafe fn validate(&self, pred: NodePtr<K, V, M, B>, cur: NodePtr<K, V, M, B>) -> bool {
        let pred_next = (*pred).next.load(Ordering::Acquire);
        let ok = !pred_next.is_marked() && pred_next.ptr() == cur && !(*cur).is_marked();
        ListStat::inc(if ok {
            &self.stat.validation_success
        } else {
            &self.stat.validation_failed
        });
        ok
    }

    /// Mark and unlink `cur` if it still follows `pred`. `f` sees the entry between the two
    /// steps, under both locks.
    unsafe fn unlink<F>(&self, pred: NodePtr<K, V, M, B>, cur: NodePtr<K, V, M, B>, f: F) -> bool
    where
        F: FnOnce(&K, &V),
    {
        let _pred_lock = (*pred).lock.lock_guard();
        let _cur_lock = (*cur).lock.lock_guard();
        if !self.validate(pred, cur) {
            return false;
        }
        let next = (*cur).next.load(Ordering::Acquire);
        (*cur).next.store(next.with_mark(true), Ordering::Release);
        if let Some((ref k, ref v)) = (*cur).entry {
            f(k, v);
        }
        (*pred)
            .next
            .store(MarkedPtr::new(next.ptr(), false), Ordering::Release);
        true
    }

    unsafe fn retire_node(&self, node: NodePtr<K, V, M, B>) {
        // failures are logged by the collector, the node leaks
        let _ = self.gc.retire::<Node<K, V, M, B>, BoxDisposer>(node);
    }

    /// Insert `key` with `value`. Return false, dropping both, if `key` is already present.
    pub fn insert(&self, key: K, value: V) -> bool {
        let guards = self.guards();
        loop {
            unsafe {
                let (pred, cur) = self.search(&key, &guards);
                let _pred_lock = (*pred).lock.lock_guard();
                let _cur_lock = (*cur).lock.lock_guard();
                if self.validate(pred, cur) {
                    if (*cur).compare(&key) == cmp::Ordering::Equal {
                        ListStat::inc(&self.stat.insert_failed);
                        return false;
                    }
                    let node = Box::into_raw(Box::new(Node::new(Some((key, value)), cur)));
                    (*pred)
                        .next
                        .store(MarkedPtr::new(node, false), Ordering::Release);
                    self.item_counter.fetch_add(1, Ordering::Relaxed);
                    ListStat::inc(&self.stat.insert_success);
                    return true;
                }
            }
            ListStat::inc(&self.stat.insert_retry);
        }
    }

    /// Remove `key`. Return false if it is absent, including when a concurrent erase removed it
    /// first.
    pub fn erase<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.erase_with(key, |_, _| {})
    }

    /// Remove `key`, calling `f` with the entry while it is being unlinked.
    pub fn erase_with<Q, F>(&self, key: &Q, f: F) -> bool
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
        F: FnOnce(&K, &V),
    {
        let guards = self.guards();
        let mut f = Some(f);
        loop {
            unsafe {
                let (pred, cur) = self.search(key, &guards);
                if (*cur).compare(key) != cmp::Ordering::Equal {
                    ListStat::inc(&self.stat.erase_failed);
                    return false;
                }
                let unlinked = self.unlink(pred, cur, |k, v| {
                    if let Some(f) = f.take() {
                        f(k, v)
                    }
                });
                if unlinked {
                    self.item_counter.fetch_sub(1, Ordering::Relaxed);
                    ListStat::inc(&self.stat.erase_success);
                    self.retire_node(cur);
                    return true;
                }
            }
            ListStat::inc(&self.stat.erase_retry);
        }
    }

    /// Unlink `key` and hand its value over. The node is retired when the returned pointer drops.
    pub fn extract<Q>(&self, key: &Q) -> Option<ExemptPtr<'_, V>>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let guards = self.guards();
        loop {
            unsafe {
                let (pred, cur) = self.search(key, &guards);
                if (*cur).compare(key) != cmp::Ordering::Equal {
                    ListStat::inc(&self.stat.erase_failed);
                    return None;
                }
                let mut value = ptr::null();
                if self.unlink(pred, cur, |_, v| value = v as *const V) {
                    self.item_counter.fetch_sub(1, Ordering::Relaxed);
                    ListStat::inc(&self.stat.erase_success);
                    return Some(ExemptPtr::new::<Node<K, V, M, B>, BoxDisposer>(
                        &self.gc, cur, value,
                    ));
                }
            }
            ListStat::inc(&self.stat.erase_retry);
        }
    }

    /// Node holding `key`, protected by the `CUR` guard, or null.
    unsafe fn lookup<Q>(&self, key: &Q, guards: &GuardArray<'_, 2>) -> NodePtr<K, V, M, B>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let (_, cur) = self.search(key, guards);
        if (*cur).compare(key) == cmp::Ordering::Equal && !(*cur).is_marked() {
            ListStat::inc(&self.stat.find_success);
            cur
        } else {
            ListStat::inc(&self.stat.find_failed);
            ptr::null_mut()
        }
    }

    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.find(key, |_, _| {})
    }

    /// Call `f` with the entry of `key` if present.
    pub fn find<Q, F>(&self, key: &Q, f: F) -> bool
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
        F: FnOnce(&K, &V),
    {
        let guards = self.guards();
        unsafe {
            let node = self.lookup(key, &guards);
            match node.as_ref().and_then(|n| n.entry.as_ref()) {
                Some((k, v)) => {
                    f(k, v);
                    true
                }
                None => false,
            }
        }
    }

    /// Value of `key`, kept alive by a guard while the returned pointer lives.
    pub fn get<Q>(&self, key: &Q) -> Option<GuardedPtr<'_, V>>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let guards = self.guards();
        unsafe {
            let node = self.lookup(key, &guards);
            let value = match node.as_ref().and_then(|n| n.entry.as_ref()) {
                Some((_, v)) => v as *const V,
                None => return None,
            };
            match guards.to_guard(CUR) {
                Ok(guard) => Some(GuardedPtr::new(guard, value)),
                Err(e) => panic!("LazyList::get needs a free guard, ret={}", e),
            }
        }
    }

    /// Erase every entry. Entries inserted concurrently may survive.
    pub fn clear(&self) {
        let guards = self.guards();
        let mut bk = B::default();
        unsafe {
            loop {
                guards.assign(PRED, self.head);
                let cur = guards.protect(CUR, &(*self.head).next).ptr();
                if cur == self.tail {
                    break;
                }
                if self.unlink(self.head, cur, |_, _| {}) {
                    self.item_counter.fetch_sub(1, Ordering::Relaxed);
                    ListStat::inc(&self.stat.erase_success);
                    self.retire_node(cur);
                    bk.reset();
                } else {
                    bk.backoff();
                }
            }
        }
    }

    /// Count of entries, exact only when the list is quiescent.
    pub fn len(&self) -> usize {
        self.item_counter.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        unsafe { (*self.head).next.load(Ordering::Acquire).ptr() == self.tail }
    }

    pub fn statistics(&self) -> ListStatSnapshot {
        self.stat.snapshot()
    }
}

impl<K, V, M: MemoryModel, B> Drop for LazyList<K, V, M, B> {
    fn drop(&mut self) {
        let mut cur = self.head;
        while !cur.is_null() {
            let node = unsafe { Box::from_raw(cur) };
            cur = node.next.load(Ordering::Relaxed).ptr();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::atomic::SequentialConsistent;
    use crate::backoff::Yield;
    use crate::error::Status;
    use crate::hazard_gc::Config;

    fn gc() -> HazardGc {
        HazardGc::new(Config {
            hazard_ptr_count: HAZARD_PTR_COUNT,
            help_scan_interval_us: 0,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_too_few_hazard_pointers() {
        let gc = HazardGc::new(Config {
            hazard_ptr_count: 2,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(
            LazyList::<u32, u32>::new(&gc).err(),
            Some(Status::TooFewHazardPointers)
        );
    }

    #[test]
    fn test_base() {
        let gc = gc();
        let list: LazyList<i32, i32> = LazyList::new(&gc).unwrap();
        assert!(list.is_empty());
        for k in &[5, 1, 9, 3, 7] {
            assert!(list.insert(*k, k * 10));
        }
        assert!(!list.insert(3, 0));
        assert_eq!(list.len(), 5);
        assert!(!list.is_empty());
        let mut seen = 0;
        assert!(list.find(&7, |k, v| seen = k + v));
        assert_eq!(seen, 77);
        assert!(!list.contains(&4));
        assert_eq!(*list.get(&9).unwrap(), 90);
        assert!(list.get(&10).is_none());

        assert!(list.erase(&5));
        assert!(!list.erase(&5));
        let mut erased = None;
        assert!(list.erase_with(&1, |_, v| erased = Some(*v)));
        assert_eq!(erased, Some(10));
        assert_eq!(list.len(), 3);

        let stat = list.statistics();
        assert_eq!(stat.insert_success, 5);
        assert_eq!(stat.insert_failed, 1);
        assert_eq!(stat.erase_success, 2);
        assert_eq!(stat.erase_failed, 1);
        assert_eq!(stat.find_success, 2);
        assert_eq!(stat.find_failed, 2);
        assert_eq!(stat.validation_failed, 0);
    }

    #[test]
    fn test_extract_and_get_keep_value_alive() {
        let gc = gc();
        let list: LazyList<String, String, SequentialConsistent, Yield> =
            LazyList::new(&gc).unwrap();
        list.insert("k".to_string(), "v".to_string());
        list.insert("x".to_string(), "y".to_string());
        let got = list.get("x").unwrap();
        assert!(list.erase("x"));
        gc.scan().unwrap();
        assert_eq!(&*got, "y");
        drop(got);

        let ep = list.extract("k").unwrap();
        assert!(!list.contains("k"));
        assert!(list.extract("k").is_none());
        assert_eq!(&*ep, "v");
        assert_eq!(gc.statistics().retired_count, 1);
        drop(ep);
        assert_eq!(gc.statistics().retired_count, 2);
        gc.scan().unwrap();
        assert_eq!(gc.statistics().free_count, 2);
    }

    #[test]
    fn test_clear() {
        let gc = gc();
        let list: LazyList<u64, ()> = LazyList::new(&gc).unwrap();
        for k in 0..100 {
            list.insert(k, ());
        }
        list.clear();
        assert!(list.is_empty());
        assert_eq!(list.len(), 0);
        for k in 0..100 {
            assert!(!list.contains(&k));
        }
        gc.scan().unwrap();
        let stat = gc.statistics();
        assert_eq!(stat.retired_count, 100);
        assert_eq!(stat.free_count, 100);
    }
}
