//! Definition and implementations of `LazySkipList`
//!
//! Lazy skip list of Herlihy, Lev, Luchangco and Shavit. Every node has a tower of up to
//! `MAX_HEIGHT` links, a `marked` flag for logical deletion and a `fully_linked` flag telling
//! readers that every level of the tower is in place. Insertion locks the predecessors of all
//! levels bottom-up and links bottom-up; removal locks the victim, marks it, then locks its
//! predecessors and unlinks top-down.
//!
//! To keep hazard pointers sound, marking a victim also sets the mark bit of each of its links.
//! A traversal that reads a marked link starts over from the head.
use crate::atomic::{
    AtomicCounter, AtomicFlag, AtomicMarkedPtr, MarkedPtr, MemoryModel, RelaxedOrdering,
};
use crate::backoff::{Backoff, DefaultBackoff};
use crate::error::Result;
use crate::guard::{ExemptPtr, GuardArray, GuardedPtr};
use crate::hazard_gc::HazardGc;
use crate::list_stat::{ListStat, ListStatSnapshot};
use crate::retired::BoxDisposer;
use crate::spin_lock::{SpinLock, SpinLockGuard};
use rand::Rng;
use std::borrow::Borrow;
use std::cmp;
use std::ptr;
use std::sync::atomic::Ordering;

/// Maximum tower height.
pub const MAX_HEIGHT: usize = 8;
/// Guards of one operation: predecessors and successors of every level, and the victim.
const GUARD_COUNT: usize = 2 * MAX_HEIGHT + 1;
const VICTIM: usize = 2 * MAX_HEIGHT;
/// Guards one thread needs for `LazySkipList` operations, a `GuardedPtr` returned by `get`
/// included.
pub const HAZARD_PTR_COUNT: usize = GUARD_COUNT + 1;

#[inline]
fn pred_slot(level: usize) -> usize {
    level
}

#[inline]
fn succ_slot(level: usize) -> usize {
    MAX_HEIGHT + level
}

/// Height of a new tower, `h` with probability `2^-h`, capped at `MAX_HEIGHT`.
fn random_height() -> usize {
    let mut rng = rand::thread_rng();
    let mut height = 1;
    while height < MAX_HEIGHT && rng.gen_bool(0.5) {
        height += 1;
    }
    height
}

type NodePtr<K, V, M, B> = *mut Node<K, V, M, B>;
type Tower<K, V, M, B> = [NodePtr<K, V, M, B>; MAX_HEIGHT];

struct Node<K, V, M: MemoryModel, B> {
    entry: Option<(K, V)>,
    height: usize,
    next: [AtomicMarkedPtr<Node<K, V, M, B>, M>; MAX_HEIGHT],
    marked: AtomicFlag<M>,
    fully_linked: AtomicFlag<M>,
    lock: SpinLock<B>,
}

// nodes are freed by whichever thread reclaims them, the lock holds no `B`
unsafe impl<K: Send, V: Send, M: MemoryModel, B> Send for Node<K, V, M, B> {}

impl<K, V, M: MemoryModel, B> Node<K, V, M, B> {
    fn new(entry: Option<(K, V)>, height: usize) -> Self {
        Node {
            entry,
            height,
            next: Default::default(),
            marked: AtomicFlag::new(false),
            fully_linked: AtomicFlag::new(false),
            lock: SpinLock::new(),
        }
    }

    #[inline]
    fn is_marked(&self) -> bool {
        self.marked.load(Ordering::Acquire)
    }

    #[inline]
    fn is_fully_linked(&self) -> bool {
        self.fully_linked.load(Ordering::Acquire)
    }

    /// Order relative to `key`, the tail being greater than any key.
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

struct Position<K, V, M: MemoryModel, B> {
    /// Highest level the key was found at.
    found: Option<usize>,
    preds: Tower<K, V, M, B>,
    succs: Tower<K, V, M, B>,
}

/// Ordered key-value skip list with lock-free lookups and fine-grained locking updates.
///
/// # Examples
///
/// ```
/// use rs_hazard_gc::hazard_gc::{Config, HazardGc};
/// use rs_hazard_gc::lazy_skip_list::{LazySkipList, HAZARD_PTR_COUNT};
///
/// let gc = HazardGc::new(Config {
///     hazard_ptr_count: HAZARD_PTR_COUNT,
///     ..Default::default()
/// })
/// .unwrap();
/// let list: LazySkipList<u32, &str> = LazySkipList::new(&gc).unwrap();
/// assert!(list.insert(2, "two"));
/// assert!(list.insert(1, "one"));
/// assert!(list.find(&2, |_, v| assert_eq!(*v, "two")));
/// assert_eq!(*list.extract(&1).unwrap(), "one");
/// assert_eq!(list.len(), 1);
/// ```
///
/// Entries must be `Send + 'static`, a node may be freed by any thread:
///
/// ```compile_fail
/// use rs_hazard_gc::hazard_gc::{Config, HazardGc};
/// use rs_hazard_gc::lazy_skip_list::{LazySkipList, HAZARD_PTR_COUNT};
/// use std::rc::Rc;
///
/// let gc = HazardGc::new(Config {
///     hazard_ptr_count: HAZARD_PTR_COUNT,
///     ..Default::default()
/// })
/// .unwrap();
/// let list: LazySkipList<u32, Rc<u32>> = LazySkipList::new(&gc).unwrap();
/// list.insert(1, Rc::new(1));
/// ```
///
pub struct LazySkipList<K, V, M: MemoryModel = RelaxedOrdering, B = DefaultBackoff> {
    gc: HazardGc,
    head: NodePtr<K, V, M, B>,
    tail: NodePtr<K, V, M, B>,
    item_counter: AtomicCounter<M>,
    stat: ListStat,
}

unsafe impl<K: Send + Sync, V: Send + Sync, M: MemoryModel, B> Send
    for LazySkipList<K, V, M, B>
{
}
unsafe impl<K: Send + Sync, V: Send + Sync, M: MemoryModel, B> Sync
    for LazySkipList<K, V, M, B>
{
}

impl<K, V, M, B> LazySkipList<K, V, M, B>
where
    K: Ord + Send + 'static,
    V: Send + 'static,
    M: MemoryModel,
    B: Backoff + 'static,
{
    /// Create an empty skip list reclaimed by `gc`. Fails if `gc` has fewer than
    /// `HAZARD_PTR_COUNT` hazard pointers per thread.
    pub fn new(gc: &HazardGc) -> Result<Self> {
        gc.check_available_guards(HAZARD_PTR_COUNT)?;
        let tail = Box::into_raw(Box::new(Node::new(None, MAX_HEIGHT)));
        let head = Box::into_raw(Box::new(Node::new(None, MAX_HEIGHT)));
        unsafe {
            for level in 0..MAX_HEIGHT {
                (*head).next[level].store(MarkedPtr::new(tail, false), Ordering::Relaxed);
            }
            (*head).fully_linked.store(true, Ordering::Relaxed);
            (*tail).fully_linked.store(true, Ordering::Relaxed);
        }
        Ok(LazySkipList {
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

    fn guards(&self) -> GuardArray<'_, GUARD_COUNT> {
        match GuardArray::new(&self.gc) {
            Ok(guards) => guards,
            Err(e) => panic!("LazySkipList needs {} free guards, ret={}", GUARD_COUNT, e),
        }
    }

    /// Predecessors and successors of `key` at every level, all protected by `guards`.
    unsafe fn find_position<Q>(
        &self,
        key: &Q,
        guards: &GuardArray<'_, GUARD_COUNT>,
    ) -> Position<K, V, M, B>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        'restart: loop {
            let mut pos = Position {
                found: None,
                preds: [ptr::null_mut(); MAX_HEIGHT],
                succs: [ptr::null_mut(); MAX_HEIGHT],
            };
            let mut pred = self.head;
            for level in (0..MAX_HEIGHT).rev() {
                guards.assign(pred_slot(level), pred);
                let next = guards.protect(succ_slot(level), &(*pred).next[level]);
                if next.is_marked() {
                    continue 'restart;
                }
                let mut cur = next.ptr();
                loop {
                    match (*cur).compare(key) {
                        cmp::Ordering::Less => {
                            guards.copy(pred_slot(level), succ_slot(level));
                            pred = cur;
                            let next = guards.protect(succ_slot(level), &(*pred).next[level]);
                            if next.is_marked() {
                                continue 'restart;
                            }
                            cur = next.ptr();
                        }
                        cmp::Ordering::Equal => {
                            if pos.found.is_none() {
                                pos.found = Some(level);
                            }
                            break;
                        }
                        cmp::Ordering::Greater => break,
                    }
                }
                pos.preds[level] = pred;
                pos.succs[level] = cur;
            }
            return pos;
        }
    }

    /// Lock the distinct predecessors of levels below `height` bottom-up and check each still
    /// links to its successor. On failure every lock is released.
    unsafe fn lock_preds(
        &self,
        pos: &Position<K, V, M, B>,
        height: usize,
        succ_may_be_marked: bool,
    ) -> Option<Vec<SpinLockGuard<'_, B>>> {
        let mut locks = Vec::with_capacity(height);
        let mut prev_pred = ptr::null_mut();
        for level in 0..height {
            let pred = pos.preds[level];
            let succ = pos.succs[level];
            if pred != prev_pred {
                locks.push((*pred).lock.lock_guard());
                prev_pred = pred;
            }
            let valid = !(*pred).is_marked()
                && (succ_may_be_marked || !(*succ).is_marked())
                && (*pred).next[level].load(Ordering::Acquire) == MarkedPtr::new(succ, false);
            if !valid {
                ListStat::inc(&self.stat.validation_failed);
                return None;
            }
        }
        ListStat::inc(&self.stat.validation_success);
        Some(locks)
    }

    /// Insert `key` with `value`. Return false, dropping both, if `key` is already present.
    pub fn insert(&self, key: K, value: V) -> bool {
        let height = random_height();
        let guards = self.guards();
        let mut bk = B::default();
        loop {
            unsafe {
                let pos = self.find_position(&key, &guards);
                if let Some(level) = pos.found {
                    let found = pos.succs[level];
                    if !(*found).is_marked() {
                        while !(*found).is_fully_linked() {
                            bk.backoff();
                        }
                        ListStat::inc(&self.stat.insert_failed);
                        return false;
                    }
                    // wait for the remover to unlink it
                    bk.backoff();
                } else if let Some(_locks) = self.lock_preds(&pos, height, false) {
                    let node = Box::into_raw(Box::new(Node::new(Some((key, value)), height)));
                    for level in 0..height {
                        (*node).next[level]
                            .store(MarkedPtr::new(pos.succs[level], false), Ordering::Relaxed);
                    }
                    for level in 0..height {
                        (*pos.preds[level]).next[level]
                            .store(MarkedPtr::new(node, false), Ordering::Release);
                    }
                    (*node).fully_linked.store(true, Ordering::Release);
                    self.item_counter.fetch_add(1, Ordering::Relaxed);
                    ListStat::inc(&self.stat.insert_success);
                    return true;
                }
            }
            ListStat::inc(&self.stat.insert_retry);
        }
    }

    /// Mark and unlink the node of `key`, leaving it to the caller. `f` sees the entry once the
    /// node is marked. Null if `key` is absent or another thread removes it first.
    unsafe fn remove<Q, F>(
        &self,
        key: &Q,
        guards: &GuardArray<'_, GUARD_COUNT>,
        f: F,
    ) -> NodePtr<K, V, M, B>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
        F: FnOnce(&K, &V),
    {
        let mut f = Some(f);
        let mut victim: NodePtr<K, V, M, B> = ptr::null_mut();
        let mut victim_lock = None;
        loop {
            let pos = self.find_position(key, guards);
            if victim_lock.is_none() {
                let level = match pos.found {
                    Some(level) => level,
                    None => {
                        ListStat::inc(&self.stat.erase_failed);
                        return ptr::null_mut();
                    }
                };
                victim = pos.succs[level];
                if !(*victim).is_fully_linked()
                    || (*victim).height != level + 1
                    || (*victim).is_marked()
                {
                    ListStat::inc(&self.stat.erase_failed);
                    return ptr::null_mut();
                }
                guards.copy(VICTIM, succ_slot(level));
                let lock = (*victim).lock.lock_guard();
                if (*victim).is_marked() {
                    ListStat::inc(&self.stat.erase_failed);
                    return ptr::null_mut();
                }
                (*victim).marked.store(true, Ordering::Release);
                for level in (0..(*victim).height).rev() {
                    let next = (*victim).next[level].load(Ordering::Acquire);
                    (*victim).next[level].store(next.with_mark(true), Ordering::Release);
                }
                if let (Some(f), Some((k, v))) = (f.take(), (*victim).entry.as_ref()) {
                    f(k, v);
                }
                victim_lock = Some(lock);
            }
            let height = (*victim).height;
            if let Some(_locks) = self.lock_preds(&pos, height, true) {
                for level in (0..height).rev() {
                    let next = (*victim).next[level].load(Ordering::Acquire).ptr();
                    (*pos.preds[level]).next[level]
                        .store(MarkedPtr::new(next, false), Ordering::Release);
                }
                drop(victim_lock);
                self.item_counter.fetch_sub(1, Ordering::Relaxed);
                ListStat::inc(&self.stat.erase_success);
                return victim;
            }
            ListStat::inc(&self.stat.erase_retry);
        }
    }

    pub fn erase<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.erase_with(key, |_, _| {})
    }

    /// Remove `key`, calling `f` with the entry once it is logically deleted.
    pub fn erase_with<Q, F>(&self, key: &Q, f: F) -> bool
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
        F: FnOnce(&K, &V),
    {
        let guards = self.guards();
        unsafe {
            let victim = self.remove(key, &guards, f);
            if victim.is_null() {
                return false;
            }
            self.retire_node(victim);
        }
        true
    }

    /// Unlink `key` and hand its value over. The node is retired when the returned pointer drops.
    pub fn extract<Q>(&self, key: &Q) -> Option<ExemptPtr<'_, V>>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let guards = self.guards();
        unsafe {
            let mut value = ptr::null();
            let victim = self.remove(key, &guards, |_, v| value = v as *const V);
            if victim.is_null() {
                return None;
            }
            Some(ExemptPtr::new::<Node<K, V, M, B>, BoxDisposer>(
                &self.gc, victim, value,
            ))
        }
    }

    unsafe fn retire_node(&self, node: NodePtr<K, V, M, B>) {
        // failures are logged by the collector, the node leaks
        let _ = self.gc.retire::<Node<K, V, M, B>, BoxDisposer>(node);
    }

    /// Fully linked, unmarked node of `key` protected by the returned slot.
    unsafe fn lookup<Q>(
        &self,
        key: &Q,
        guards: &GuardArray<'_, GUARD_COUNT>,
    ) -> Option<(NodePtr<K, V, M, B>, usize)>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let pos = self.find_position(key, guards);
        match pos.found {
            Some(level)
                if (*pos.succs[level]).is_fully_linked() && !(*pos.succs[level]).is_marked() =>
            {
                ListStat::inc(&self.stat.find_success);
                Some((pos.succs[level], succ_slot(level)))
            }
            _ => {
                ListStat::inc(&self.stat.find_failed);
                None
            }
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
            match self.lookup(key, &guards) {
                Some((node, _)) => match (*node).entry {
                    Some((ref k, ref v)) => {
                        f(k, v);
                        true
                    }
                    None => false,
                },
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
            let (node, slot) = self.lookup(key, &guards)?;
            let value = match (*node).entry {
                Some((_, ref v)) => v as *const V,
                None => return None,
            };
            match guards.to_guard(slot) {
                Ok(guard) => Some(GuardedPtr::new(guard, value)),
                Err(e) => panic!("LazySkipList::get needs a free guard, ret={}", e),
            }
        }
    }

    /// Erase every entry. Entries inserted concurrently may survive.
    pub fn clear(&self) {
        let guards = self.guards();
        let first = match guards.to_guard(VICTIM) {
            Ok(guard) => guard,
            Err(e) => panic!("LazySkipList::clear needs a free guard, ret={}", e),
        };
        let mut bk = B::default();
        unsafe {
            loop {
                let node = first.protect(&(*self.head).next[0]).ptr();
                if node == self.tail {
                    break;
                }
                // `first` keeps the key alive while `remove` looks it up
                if let Some((ref k, _)) = (*node).entry {
                    let victim = self.remove(k, &guards, |_, _| {});
                    if victim.is_null() {
                        // another thread owns the first node, let it finish
                        bk.backoff();
                    } else {
                        self.retire_node(victim);
                        bk.reset();
                    }
                }
            }
        }
    }

    /// Count of entries, exact only when the list is quiescent.
    pub fn len(&self) -> usize {
        self.item_counter.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        unsafe { (*self.head).next[0].load(Ordering::Acquire).ptr() == self.tail }
    }

    pub fn statistics(&self) -> ListStatSnapshot {
        self.stat.snapshot()
    }
}

impl<K, V, M: MemoryModel, B> Drop for LazySkipList<K, V, M, B> {
    fn drop(&mut self) {
        let mut cur = self.head;
        while !cur.is_null() {
            let node = unsafe { Box::from_raw(cur) };
            cur = node.next[0].load(Ordering::Relaxed).ptr();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
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
    fn test_random_height() {
        let mut seen = [0usize; MAX_HEIGHT + 1];
        for _ in 0..10_000 {
            let h = random_height();
            assert!(h >= 1 && h <= MAX_HEIGHT);
            seen[h] += 1;
        }
        assert!(seen[1] > seen[3]);
    }

    #[test]
    fn test_too_few_hazard_pointers() {
        let gc = HazardGc::default_new().unwrap();
        assert_eq!(
            LazySkipList::<u32, u32>::new(&gc).err(),
            Some(Status::TooFewHazardPointers)
        );
    }

    #[test]
    fn test_base() {
        let gc = gc();
        let list: LazySkipList<u32, u32> = LazySkipList::new(&gc).unwrap();
        assert!(list.is_empty());
        for k in (0..200).rev() {
            assert!(list.insert(k, k + 1));
        }
        for k in 0..200 {
            assert!(!list.insert(k, 0));
            let mut v = 0;
            assert!(list.find(&k, |_, x| v = *x));
            assert_eq!(v, k + 1);
        }
        assert_eq!(list.len(), 200);
        for k in (0..200).step_by(2) {
            assert!(list.erase(&k));
        }
        for k in 0..200 {
            assert_eq!(list.contains(&k), k % 2 == 1);
        }
        let mut erased = 0;
        assert!(list.erase_with(&101, |k, v| erased = k + v));
        assert_eq!(erased, 203);
        assert!(!list.erase(&101));
        assert_eq!(list.len(), 99);

        let stat = list.statistics();
        assert_eq!(stat.insert_success, 200);
        assert_eq!(stat.insert_failed, 200);
        assert_eq!(stat.erase_success, 101);
        assert_eq!(stat.erase_failed, 1);
        assert_eq!(stat.validation_failed, 0);
    }

    #[test]
    fn test_get_extract_clear() {
        let gc = gc();
        let list: LazySkipList<String, Vec<u8>> = LazySkipList::new(&gc).unwrap();
        for i in 0..50 {
            list.insert(format!("key{:02}", i), vec![i as u8; 4]);
        }
        let got = list.get("key07").unwrap();
        assert!(list.erase("key07"));
        gc.scan().unwrap();
        assert_eq!(*got, vec![7u8; 4]);
        drop(got);

        let ep = list.extract("key08").unwrap();
        assert!(!list.contains("key08"));
        assert_eq!(ep.len(), 4);
        drop(ep);

        list.clear();
        assert!(list.is_empty());
        assert_eq!(list.len(), 0);
        gc.scan().unwrap();
        let stat = gc.statistics();
        assert_eq!(stat.retired_count, 50);
        assert_eq!(stat.free_count, 50);
    }
}
