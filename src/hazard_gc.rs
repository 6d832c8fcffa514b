//! Definition and implementations of `HazardGc`
//!
//! `HazardGc` is a hazard pointer garbage collector. Every thread owns a `ThreadRecord` holding a
//! fixed number of hazard pointer slots and a list of retired pointers. A reader publishes the
//! address it is going to dereference in one of its slots, then validates that the address is
//! still reachable. A writer that unlinks an object retires it instead of freeing it. Once the
//! retired list of a thread fills up, the thread scans every record's hazard pointers and frees
//! the retired objects nobody protects.
//!
//! Threads attach lazily on first use and detach on exit. Records of detached threads are kept
//! and reused, and whatever they could not free is adopted by other threads through `help_scan`.
use crate::error::{Result, Status};
use crate::hazard_pointer::{RecordStat, ThreadRecord};
use crate::retired::{erased_disposer, BoxDisposer, Disposer, RetiredPtr};
use crate::util::{self, WrappedAlign64Type};
use parking_lot::Mutex;
use std::cell::RefCell;
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{self, AtomicBool, AtomicI64, AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;

cfg_if! {
    if #[cfg(feature = "max_thread_count_4096")] {
        pub const MAX_THREAD_COUNT: usize = 4096;
    } else if #[cfg(feature = "max_thread_count_256")] {
        pub const MAX_THREAD_COUNT: usize = 256;
    } else {
        /// Default maximum thread count
        pub const MAX_THREAD_COUNT: usize = 16;
    }
}

/// Default count of hazard pointers per thread
pub const DEFAULT_HAZARD_PTR_COUNT: usize = 8;
/// Upper limit of hazard pointers per thread
pub const MAX_HAZARD_PTR_COUNT: usize = 64;
/// Default minimum interval(microsecond) between two opportunistic help scans
pub const DEFAULT_HELP_SCAN_INTERVAL_US: i64 = 200_000;

/// Algorithm used to reclaim retired pointers.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ScanType {
    /// Collect all hazard pointers into a sorted vector and free every retired pointer absent
    /// from it.
    Classic,
    /// Sort the retired list and mark the entries hazard pointers refer to. Needs no extra
    /// allocation for the hazard set.
    InPlace,
}

impl Default for ScanType {
    fn default() -> Self {
        ScanType::InPlace
    }
}

/// Construction-time configuration of `HazardGc`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Hazard pointers per thread, 0 means `DEFAULT_HAZARD_PTR_COUNT`.
    pub hazard_ptr_count: usize,
    /// Thread records allocated at construction.
    pub min_thread_count: usize,
    /// Expected maximum of attached threads, 0 means `MAX_THREAD_COUNT`. More threads are
    /// allowed, with a warning.
    pub max_thread_count: usize,
    /// Capacity of each retired list. Raised to `2 * hazard_ptr_count * max_thread_count` when
    /// below `hazard_ptr_count * max_thread_count`.
    pub max_retired_ptr_count: usize,
    pub scan_type: ScanType,
    /// Minimum interval(microsecond) between two help scans triggered by `retire`, 0 disables
    /// them.
    pub help_scan_interval_us: i64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            hazard_ptr_count: DEFAULT_HAZARD_PTR_COUNT,
            min_thread_count: 0,
            max_thread_count: MAX_THREAD_COUNT,
            max_retired_ptr_count: 0,
            scan_type: ScanType::default(),
            help_scan_interval_us: DEFAULT_HELP_SCAN_INTERVAL_US,
        }
    }
}

impl Config {
    /// Fill defaults in and validate.
    pub fn normalize(mut self) -> Result<Config> {
        if self.hazard_ptr_count == 0 {
            self.hazard_ptr_count = DEFAULT_HAZARD_PTR_COUNT;
        }
        if self.hazard_ptr_count > MAX_HAZARD_PTR_COUNT {
            warn!(
                "hazard_ptr_count={} exceeds limit {}",
                self.hazard_ptr_count, MAX_HAZARD_PTR_COUNT
            );
            return Err(Status::InvalidParam);
        }
        if self.max_thread_count == 0 {
            self.max_thread_count = MAX_THREAD_COUNT;
        }
        if self.min_thread_count > self.max_thread_count {
            warn!(
                "min_thread_count={} is greater than max_thread_count={}",
                self.min_thread_count, self.max_thread_count
            );
            return Err(Status::InvalidParam);
        }
        if self.help_scan_interval_us < 0 {
            warn!("negative help_scan_interval_us={}", self.help_scan_interval_us);
            return Err(Status::InvalidParam);
        }
        let hazard_total = self.hazard_ptr_count * self.max_thread_count;
        if self.max_retired_ptr_count < hazard_total {
            self.max_retired_ptr_count = hazard_total * 2;
        }
        Ok(self)
    }
}

/// Collector statistics, summed over all thread records.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct Stat {
    pub thread_rec_count: usize,
    pub guard_allocated: usize,
    pub guard_freed: usize,
    pub retired_count: usize,
    pub free_count: usize,
    pub scan_count: usize,
    pub help_scan_count: usize,
}

static GC_ID: AtomicUsize = AtomicUsize::new(1);

struct GcInner {
    id: usize,
    config: Config,
    thread_list: WrappedAlign64Type<AtomicPtr<ThreadRecord>>,
    thread_lock: Mutex<()>,
    thread_rec_count: AtomicUsize,
    last_help_scan_us: WrappedAlign64Type<AtomicI64>,
    destructed: AtomicBool,
    postmortem: Mutex<Stat>,
}

struct Records<'a> {
    cur: *mut ThreadRecord,
    _marker: PhantomData<&'a ThreadRecord>,
}

impl<'a> Iterator for Records<'a> {
    type Item = &'a ThreadRecord;

    fn next(&mut self) -> Option<&'a ThreadRecord> {
        if self.cur.is_null() {
            None
        } else {
            // records are only freed with the collector
            let rec = unsafe { &*self.cur };
            self.cur = rec.next();
            Some(rec)
        }
    }
}

impl GcInner {
    fn records(&self) -> Records {
        Records {
            cur: self.thread_list.load(Ordering::Acquire),
            _marker: PhantomData,
        }
    }

    #[inline]
    fn is_destructed(&self) -> bool {
        self.destructed.load(Ordering::Acquire)
    }

    fn new_record(&self, owner: i64) -> *mut ThreadRecord {
        Box::into_raw(Box::new(ThreadRecord::new(
            self.config.hazard_ptr_count,
            self.config.max_retired_ptr_count,
            owner,
        )))
    }

    fn push_record(&self, rec: *mut ThreadRecord) {
        let _lock = self.thread_lock.lock();
        let count = self.thread_rec_count.fetch_add(1, Ordering::Relaxed) + 1;
        if count > self.config.max_thread_count {
            warn!(
                "collector {} has {} thread records, more than max_thread_count={}",
                self.id, count, self.config.max_thread_count
            );
        }
        unsafe { (*rec).set_next(self.thread_list.load(Ordering::Relaxed)) };
        self.thread_list.store(rec, Ordering::Release);
    }

    /// Reuse an unowned record or publish a new one, owned by `tid`.
    fn alloc_thread_data(&self, tid: i64) -> &ThreadRecord {
        for rec in self.records() {
            if rec.try_acquire(tid) {
                rec.set_free(false);
                return rec;
            }
        }
        let rec = self.new_record(tid);
        self.push_record(rec);
        unsafe { &*rec }
    }

    fn free_thread_data(&self, rec: &ThreadRecord) {
        unsafe { rec.reset_slots() };
        self.scan(rec);
        self.help_scan(rec);
        if unsafe { rec.retired_mut() }.is_empty() {
            rec.set_free(true);
        }
        rec.release();
    }

    /// Push `retired`, scanning when the list is full. Records left by exited threads are
    /// adopted once every `help_scan_interval_us`, whether or not the list filled.
    fn retire(&self, rec: &ThreadRecord, retired: RetiredPtr) {
        RecordStat::inc(&rec.stat.retired_count, 1);
        if !unsafe { rec.retired_mut() }.push(retired) {
            self.scan(rec);
            let count = unsafe { rec.retired_mut() }.count();
            if count >= self.config.max_retired_ptr_count {
                warn!(
                    "retired list of thread {} is still full after scan, count={}",
                    rec.owner(),
                    count
                );
            }
        }
        if self.help_scan_due() {
            self.help_scan(rec);
        }
    }

    fn help_scan_due(&self) -> bool {
        let interval = self.config.help_scan_interval_us;
        if interval == 0 {
            return false;
        }
        let now = util::get_cur_microseconds_time();
        let last = self.last_help_scan_us.load(Ordering::Relaxed);
        now - last >= interval
            && self
                .last_help_scan_us
                .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
    }

    fn scan(&self, rec: &ThreadRecord) {
        RecordStat::inc(&rec.stat.scan_count, 1);
        // retirements must be ordered before the hazard pointers are read
        atomic::fence(Ordering::SeqCst);
        let reclaimable = match self.config.scan_type {
            ScanType::Classic => self.classic_scan(rec),
            ScanType::InPlace => self.inplace_scan(rec),
        };
        trace!(
            "thread {} scan freed {}, kept {}",
            rec.owner(),
            reclaimable.len(),
            unsafe { rec.retired_mut() }.count()
        );
        Self::free_retired(rec, reclaimable);
    }

    fn classic_scan(&self, rec: &ThreadRecord) -> Vec<RetiredPtr> {
        let mut hazards = Vec::with_capacity(
            self.config.hazard_ptr_count * self.thread_rec_count.load(Ordering::Relaxed),
        );
        for r in self.records() {
            r.for_each_hazard(|p| hazards.push(p));
        }
        hazards.sort_unstable();
        unsafe { rec.retired_mut() }.take_reclaimable(|p| hazards.binary_search(&p).is_ok())
    }

    fn inplace_scan(&self, rec: &ThreadRecord) -> Vec<RetiredPtr> {
        let retired = unsafe { rec.retired_mut() };
        retired.sort_by_address();
        for r in self.records() {
            r.for_each_hazard(|p| {
                retired.mark_guarded(p);
            });
        }
        retired.take_unmarked()
    }

    /// Disposers run after the retired list is released since they may retire again.
    fn free_retired(rec: &ThreadRecord, reclaimable: Vec<RetiredPtr>) {
        RecordStat::inc(&rec.stat.free_count, reclaimable.len());
        for r in reclaimable {
            unsafe { r.free() };
        }
    }

    /// Adopt the retired pointers of records no thread owns, then scan.
    fn help_scan(&self, rec: &ThreadRecord) {
        RecordStat::inc(&rec.stat.help_scan_count, 1);
        let tid = rec.owner();
        for other in self.records() {
            if ptr::eq(other, rec) || other.is_free() || !other.try_acquire(tid) {
                continue;
            }
            let adopted = unsafe { other.retired_mut() }.take_all();
            trace!(
                "thread {} adopts {} retired pointers from an unowned record",
                tid,
                adopted.len()
            );
            for r in adopted {
                if !unsafe { rec.retired_mut() }.push(r) {
                    self.scan(rec);
                }
            }
            other.set_free(true);
            other.release();
            self.scan(rec);
        }
    }

    fn statistics(&self) -> Stat {
        let mut stat = Stat::default();
        for rec in self.records() {
            stat.thread_rec_count += 1;
            rec.accumulate(&mut stat);
        }
        stat
    }

    unsafe fn destruct(&self, detach_all: bool) {
        if self.destructed.swap(true, Ordering::AcqRel) {
            warn!("collector {} is already destructed", self.id);
            return;
        }
        if detach_all {
            for rec in self.records() {
                rec.reset_slots();
                rec.release();
            }
        }
        atomic::fence(Ordering::SeqCst);
        let mut hazards = vec![];
        for rec in self.records() {
            rec.for_each_hazard(|p| hazards.push(p));
        }
        hazards.sort_unstable();
        for rec in self.records() {
            let reclaimable =
                rec.retired_mut()
                    .take_reclaimable(|p| hazards.binary_search(&p).is_ok());
            Self::free_retired(rec, reclaimable);
            if rec.retired_mut().is_empty() {
                rec.set_free(true);
            }
        }
        let stat = self.statistics();
        *self.postmortem.lock() = stat;
        info!("collector {} destructed, statistics={:?}", self.id, stat);
    }
}

impl Drop for GcInner {
    fn drop(&mut self) {
        let mut cur = self.thread_list.load(Ordering::Acquire);
        while !cur.is_null() {
            let rec = unsafe { Box::from_raw(cur) };
            cur = rec.next();
        }
    }
}

struct Attachment {
    gc: Arc<GcInner>,
    rec: *const ThreadRecord,
    tid: i64,
}

impl Drop for Attachment {
    fn drop(&mut self) {
        if self.gc.is_destructed() {
            return;
        }
        debug!("thread {} detached from collector {}", self.tid, self.gc.id);
        self.gc.free_thread_data(unsafe { &*self.rec });
    }
}

thread_local!(static ATTACHED: RefCell<Vec<Attachment>> = RefCell::new(Vec::new()));

/// Handle of a hazard pointer collector. Clones share the same collector.
///
/// # Examples
///
/// ```
/// use rs_hazard_gc::hazard_gc::{Config, HazardGc};
///
/// let gc = HazardGc::new(Config::default()).unwrap();
/// let p = Box::into_raw(Box::new(42));
/// unsafe { gc.retire_box(p).unwrap(); }
/// gc.scan().unwrap();
/// assert_eq!(gc.statistics().free_count, 1);
/// ```
///
#[derive(Clone)]
pub struct HazardGc {
    inner: Arc<GcInner>,
}

impl HazardGc {
    /// Create a collector, allocating `min_thread_count` thread records up front.
    pub fn new(config: Config) -> Result<HazardGc> {
        let config = config.normalize()?;
        let gc = HazardGc {
            inner: Arc::new(GcInner {
                id: GC_ID.fetch_add(1, Ordering::Relaxed),
                config,
                thread_list: WrappedAlign64Type(AtomicPtr::new(ptr::null_mut())),
                thread_lock: Mutex::new(()),
                thread_rec_count: AtomicUsize::new(0),
                last_help_scan_us: WrappedAlign64Type(AtomicI64::new(
                    util::get_cur_microseconds_time(),
                )),
                destructed: AtomicBool::new(false),
                postmortem: Mutex::new(Stat::default()),
            }),
        };
        for _ in 0..gc.inner.config.min_thread_count {
            let rec = gc.inner.new_record(util::NULL_THREAD_ID);
            gc.inner.push_record(rec);
        }
        info!(
            "collector {} constructed, config={:?}",
            gc.inner.id, gc.inner.config
        );
        Ok(gc)
    }

    /// Return `Self::new(Config::default())`
    pub fn default_new() -> Result<HazardGc> {
        Self::new(Config::default())
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    #[inline]
    pub fn hazard_ptr_count(&self) -> usize {
        self.inner.config.hazard_ptr_count
    }

    #[inline]
    pub fn max_thread_count(&self) -> usize {
        self.inner.config.max_thread_count
    }

    #[inline]
    pub fn max_retired_ptr_count(&self) -> usize {
        self.inner.config.max_retired_ptr_count
    }

    /// Fail unless every thread may hold `count` guards at once.
    pub fn check_available_guards(&self, count: usize) -> Result<()> {
        if count > self.hazard_ptr_count() {
            warn!(
                "{} guards required, collector {} has {} per thread",
                count,
                self.inner.id,
                self.hazard_ptr_count()
            );
            return Err(Status::TooFewHazardPointers);
        }
        Ok(())
    }

    /// Record of current thread, attaching it on first use.
    pub(crate) fn current_record(&self) -> Result<&ThreadRecord> {
        if self.inner.is_destructed() {
            return Err(Status::Destructed);
        }
        let rec = ATTACHED
            .try_with(|attached| {
                let found = attached
                    .borrow()
                    .iter()
                    .find(|a| Arc::ptr_eq(&a.gc, &self.inner))
                    .map(|a| a.rec);
                if let Some(rec) = found {
                    return rec;
                }
                let tid = util::get_thread_id();
                let rec = self.inner.alloc_thread_data(tid) as *const ThreadRecord;
                debug!("thread {} attached to collector {}", tid, self.inner.id);
                attached.borrow_mut().push(Attachment {
                    gc: self.inner.clone(),
                    rec,
                    tid,
                });
                rec
            })
            .map_err(|_| Status::NotAttached)?;
        Ok(unsafe { &*rec })
    }

    /// Run `f` with the record of current thread. While thread local storage is torn down, a
    /// record is borrowed for the call only.
    fn with_record<R, F: FnOnce(&ThreadRecord) -> R>(&self, f: F) -> Result<R> {
        match self.current_record() {
            Ok(rec) => Ok(f(rec)),
            Err(Status::NotAttached) => {
                let rec = self.inner.alloc_thread_data(util::get_thread_id());
                let ret = f(rec);
                self.inner.free_thread_data(rec);
                Ok(ret)
            }
            Err(e) => Err(e),
        }
    }

    /// Attach current thread. No-op if already attached.
    pub fn attach_thread(&self) -> Result<()> {
        self.current_record().map(|_| ())
    }

    /// Detach current thread: scan, help other records, and give the record back for reuse.
    /// Fails with `Busy` while current thread holds guards. No-op if not attached.
    pub fn detach_thread(&self) -> Result<()> {
        let detached = ATTACHED
            .try_with(|attached| {
                let mut attached = attached.borrow_mut();
                let pos = match attached
                    .iter()
                    .position(|a| Arc::ptr_eq(&a.gc, &self.inner))
                {
                    Some(pos) => pos,
                    None => return Ok(None),
                };
                let in_use = unsafe { (*attached[pos].rec).guards_in_use() };
                if in_use > 0 {
                    warn!(
                        "thread {} holds {} guards, detach refused",
                        attached[pos].tid, in_use
                    );
                    return Err(Status::Busy);
                }
                Ok(Some(attached.swap_remove(pos)))
            })
            .map_err(|_| Status::NotAttached)??;
        drop(detached);
        Ok(())
    }

    pub fn is_thread_attached(&self) -> bool {
        ATTACHED
            .try_with(|attached| {
                attached
                    .borrow()
                    .iter()
                    .any(|a| Arc::ptr_eq(&a.gc, &self.inner))
            })
            .unwrap_or(false)
    }

    /// Retire `ptr`, to be released by `D` once no hazard pointer refers to it. A full retired
    /// list triggers a scan first.
    ///
    /// # Safety
    ///
    /// `ptr` must be unreachable for threads that do not already protect it, and retired once.
    /// `T` is `Send + 'static` since it may be freed by any thread, long after the caller
    /// returns.
    pub unsafe fn retire<T: Send + 'static, D: Disposer<T>>(&self, ptr: *mut T) -> Result<()> {
        if ptr.is_null() {
            warn!("retire a null pointer");
            return Err(Status::InvalidParam);
        }
        let retired = RetiredPtr::new(ptr as *mut (), erased_disposer::<T, D>());
        let ret = self.with_record(|rec| self.inner.retire(rec, retired));
        if let Err(e) = ret {
            error!("retire {:p} fail, ret={}", ptr, e);
        }
        ret
    }

    /// Retire a pointer obtained from `Box::into_raw`. A box borrowing from the stack is
    /// rejected:
    ///
    /// ```compile_fail
    /// use rs_hazard_gc::hazard_gc::HazardGc;
    ///
    /// let gc = HazardGc::default_new().unwrap();
    /// let local = 1u32;
    /// let p = Box::into_raw(Box::new(&local));
    /// unsafe { gc.retire_box(p).unwrap() };
    /// ```
    ///
    /// # Safety
    ///
    /// Same as `retire`.
    #[inline]
    pub unsafe fn retire_box<T: Send + 'static>(&self, ptr: *mut T) -> Result<()> {
        self.retire::<T, BoxDisposer>(ptr)
    }

    /// Free every retired pointer of current thread no hazard pointer refers to.
    pub fn scan(&self) -> Result<()> {
        let rec = self.current_record()?;
        self.inner.scan(rec);
        Ok(())
    }

    /// Adopt retired pointers left by detached threads, scanning after each adopted record.
    pub fn help_scan(&self) -> Result<()> {
        let rec = self.current_record()?;
        self.inner.help_scan(rec);
        Ok(())
    }

    pub fn statistics(&self) -> Stat {
        self.inner.statistics()
    }

    /// Statistics taken by `destruct`.
    pub fn postmortem_statistics(&self) -> Stat {
        *self.inner.postmortem.lock()
    }

    pub fn is_destructed(&self) -> bool {
        self.inner.is_destructed()
    }

    /// Free every retired pointer not protected by a hazard pointer. With `detach_all`, the
    /// guards of all threads are cleared first, so everything is freed. Afterwards the collector
    /// refuses guards and retirements, and thread records are freed with the last handle.
    ///
    /// # Safety
    ///
    /// No other thread may use the collector concurrently or afterwards, and with `detach_all`
    /// no guard may be dereferenced afterwards. Such guards may still be dropped.
    pub unsafe fn destruct(&self, detach_all: bool) {
        self.inner.destruct(detach_all)
    }
}

static GLOBAL_GC: Mutex<Option<HazardGc>> = parking_lot::const_mutex(None);

/// Construct the process-wide collector.
pub fn construct(config: Config) -> Result<HazardGc> {
    let mut global = GLOBAL_GC.lock();
    if global.is_some() {
        warn!("global collector is already constructed");
        return Err(Status::AlreadyConstructed);
    }
    let gc = HazardGc::new(config)?;
    *global = Some(gc.clone());
    Ok(gc)
}

/// Handle of the process-wide collector.
pub fn instance() -> Result<HazardGc> {
    GLOBAL_GC.lock().clone().ok_or(Status::NotConstructed)
}

/// Destruct the process-wide collector, see `HazardGc::destruct`. A new one may be constructed
/// afterwards.
///
/// # Safety
///
/// Same as `HazardGc::destruct`.
pub unsafe fn destruct(detach_all: bool) -> Result<()> {
    let gc = GLOBAL_GC.lock().take().ok_or(Status::NotConstructed)?;
    gc.destruct(detach_all);
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    struct Counted(Arc<AtomicUsize>);

    impl Drop for Counted {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn small_config() -> Config {
        Config {
            hazard_ptr_count: 2,
            max_thread_count: 4,
            max_retired_ptr_count: 16,
            help_scan_interval_us: 0,
            ..Default::default()
        }
    }

    #[test]
    fn test_config() {
        let c = Config {
            hazard_ptr_count: 0,
            max_thread_count: 0,
            ..Default::default()
        }
        .normalize()
        .unwrap();
        assert_eq!(c.hazard_ptr_count, DEFAULT_HAZARD_PTR_COUNT);
        assert_eq!(c.max_thread_count, MAX_THREAD_COUNT);
        assert_eq!(
            c.max_retired_ptr_count,
            2 * DEFAULT_HAZARD_PTR_COUNT * MAX_THREAD_COUNT
        );
        assert_eq!(small_config().normalize().unwrap().max_retired_ptr_count, 16);

        let bad = Config {
            min_thread_count: 5,
            max_thread_count: 4,
            ..Default::default()
        };
        assert_eq!(HazardGc::new(bad).err(), Some(Status::InvalidParam));
        let bad = Config {
            hazard_ptr_count: MAX_HAZARD_PTR_COUNT + 1,
            ..Default::default()
        };
        assert_eq!(bad.normalize(), Err(Status::InvalidParam));

        let gc = HazardGc::new(small_config()).unwrap();
        assert!(gc.check_available_guards(2).is_ok());
        assert_eq!(
            gc.check_available_guards(3),
            Err(Status::TooFewHazardPointers)
        );
    }

    #[test]
    fn test_attach_detach() {
        let gc = HazardGc::new(Config {
            min_thread_count: 2,
            ..small_config()
        })
        .unwrap();
        assert_eq!(gc.statistics().thread_rec_count, 2);
        assert!(!gc.is_thread_attached());
        gc.attach_thread().unwrap();
        gc.attach_thread().unwrap();
        assert!(gc.is_thread_attached());
        assert_eq!(gc.statistics().thread_rec_count, 2);

        let rec = gc.current_record().unwrap();
        let gen = rec.slot_generation();
        let slot = unsafe { rec.alloc_slot() }.unwrap();
        assert_eq!(gc.detach_thread(), Err(Status::Busy));
        assert!(gc.is_thread_attached());
        unsafe { rec.free_slot(slot, gen) };
        gc.detach_thread().unwrap();
        assert!(!gc.is_thread_attached());
        gc.detach_thread().unwrap();
    }

    #[test]
    fn test_record_reuse() {
        let gc = HazardGc::new(small_config()).unwrap();
        for _ in 0..3 {
            let gc = gc.clone();
            thread::spawn(move || gc.attach_thread().unwrap())
                .join()
                .unwrap();
        }
        assert_eq!(gc.statistics().thread_rec_count, 1);
    }

    #[test]
    fn test_scan_respects_hazards() {
        let freed = Arc::new(AtomicUsize::new(0));
        let gc = HazardGc::new(Config {
            scan_type: ScanType::Classic,
            ..small_config()
        })
        .unwrap();
        let rec = gc.current_record().unwrap();
        let p = Box::into_raw(Box::new(Counted(freed.clone())));
        let q = Box::into_raw(Box::new(Counted(freed.clone())));
        rec.set_hazard(0, p as *mut ());
        unsafe {
            gc.retire_box(p).unwrap();
            gc.retire_box(q).unwrap();
        }
        gc.scan().unwrap();
        assert_eq!(freed.load(Ordering::SeqCst), 1);
        rec.clear_hazard(0);
        gc.scan().unwrap();
        assert_eq!(freed.load(Ordering::SeqCst), 2);
        let stat = gc.statistics();
        assert_eq!(stat.retired_count, 2);
        assert_eq!(stat.free_count, 2);
        assert_eq!(stat.scan_count, 2);
    }

    #[test]
    fn test_full_list_triggers_scan() {
        let freed = Arc::new(AtomicUsize::new(0));
        let gc = HazardGc::new(small_config()).unwrap();
        for _ in 0..16 {
            unsafe { gc.retire_box(Box::into_raw(Box::new(Counted(freed.clone())))).unwrap() };
        }
        assert_eq!(freed.load(Ordering::SeqCst), 16);
        assert_eq!(gc.statistics().scan_count, 1);
    }

    #[test]
    fn test_help_scan() {
        let freed = Arc::new(AtomicUsize::new(0));
        struct Shared(Arc<AtomicUsize>);
        impl Drop for Shared {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let gc = HazardGc::new(small_config()).unwrap();
        let p = Box::into_raw(Box::new(Shared(freed.clone())));
        let rec = gc.current_record().unwrap();
        rec.set_hazard(0, p as *mut ());
        let addr = p as usize;
        {
            let gc = gc.clone();
            thread::spawn(move || unsafe { gc.retire_box(addr as *mut Shared).unwrap() })
                .join()
                .unwrap();
        }
        assert_eq!(freed.load(Ordering::SeqCst), 0);
        rec.clear_hazard(0);
        gc.help_scan().unwrap();
        assert_eq!(freed.load(Ordering::SeqCst), 1);
        assert_eq!(gc.statistics().free_count, 1);
    }

    #[test]
    fn test_destruct() {
        let freed = Arc::new(AtomicUsize::new(0));
        let gc = HazardGc::new(small_config()).unwrap();
        let rec = gc.current_record().unwrap();
        let p = Box::into_raw(Box::new(Counted(freed.clone())));
        rec.set_hazard(0, p as *mut ());
        unsafe { gc.retire_box(p).unwrap() };
        unsafe { gc.destruct(true) };
        assert_eq!(freed.load(Ordering::SeqCst), 1);
        assert!(gc.is_destructed());
        let stat = gc.postmortem_statistics();
        assert_eq!(stat.retired_count, stat.free_count);
        assert_eq!(gc.attach_thread(), Err(Status::Destructed));
        let q = Box::into_raw(Box::new(1));
        assert_eq!(unsafe { gc.retire_box(q) }, Err(Status::Destructed));
        drop(unsafe { Box::from_raw(q) });
    }
}
