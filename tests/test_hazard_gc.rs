extern crate core_affinity;
extern crate env_logger;
extern crate rand;
extern crate rs_hazard_gc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rs_hazard_gc::error::Status;
use rs_hazard_gc::guard::{Guard, GuardArray};
use rs_hazard_gc::hazard_gc::{Config, HazardGc, ScanType};
use rs_hazard_gc::retired::Disposer;
use rs_hazard_gc::util;
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicPtr, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time;

struct TestObj {
    cnt: Arc<AtomicI64>,
    data: Option<i32>,
}

impl Drop for TestObj {
    fn drop(&mut self) {
        self.data.take().unwrap();
        self.cnt.fetch_sub(1, Ordering::SeqCst);
    }
}

impl TestObj {
    fn new(cnt: &Arc<AtomicI64>) -> TestObj {
        cnt.fetch_add(1, Ordering::SeqCst);
        TestObj {
            cnt: cnt.clone(),
            data: Some(0),
        }
    }

    fn boxed(cnt: &Arc<AtomicI64>) -> *mut TestObj {
        Box::into_raw(Box::new(TestObj::new(cnt)))
    }
}

struct GlobalConf {
    stop: AtomicBool,
    cnt: Arc<AtomicI64>,
    read_loops: i64,
    write_loops: i64,
    v: AtomicPtr<TestObj>,
    gc: HazardGc,
}

fn set_cpu_affinity() {
    let cpus = core_affinity::get_core_ids().unwrap();
    let tid = util::get_thread_id() as usize;
    core_affinity::set_for_current(cpus[tid % cpus.len()]);
    println!("set_cpu_affinity {} {}", tid, tid % cpus.len());
}

fn read_thread_func(global_conf: Arc<GlobalConf>) {
    set_cpu_affinity();
    for _ in 0..global_conf.read_loops {
        let guard = Guard::new(&global_conf.gc).unwrap();
        let v = guard.protect(&global_conf.v);
        assert_eq!(unsafe { (*v).data }, Some(0));
    }
}

fn write_thread_func(global_conf: Arc<GlobalConf>) {
    set_cpu_affinity();
    for _ in 0..global_conf.write_loops {
        let v = TestObj::boxed(&global_conf.cnt);
        let old = global_conf.v.swap(v, Ordering::AcqRel);
        unsafe { global_conf.gc.retire_box(old).unwrap() };
    }
}

fn debug_thread_func(global_conf: Arc<GlobalConf>) {
    while !global_conf.stop.load(Ordering::Acquire) {
        let stat = global_conf.gc.statistics();
        println!(
            "waiting={} records={}",
            stat.retired_count - stat.free_count,
            stat.thread_rec_count
        );
        thread::sleep(time::Duration::from_millis(200));
    }
}

fn config(hazard_ptr_count: usize) -> Config {
    Config {
        hazard_ptr_count,
        max_thread_count: 16,
        max_retired_ptr_count: 64,
        help_scan_interval_us: 0,
        ..Default::default()
    }
}

#[test]
fn test_multi_thread() {
    let _ = env_logger::try_init();

    let cpu_count = core_affinity::get_core_ids().unwrap().len().min(8);
    let read_count = (cpu_count + 1) / 2;
    let write_count = (cpu_count + 1) / 2;
    println!("read thread {}, write thread {}", read_count, write_count);

    let cnt = Arc::new(AtomicI64::new(0));
    let global_conf = Arc::new(GlobalConf {
        stop: AtomicBool::new(false),
        cnt: cnt.clone(),
        read_loops: 200_000,
        write_loops: 100_000,
        v: AtomicPtr::new(TestObj::boxed(&cnt)),
        gc: HazardGc::new(config(1)).unwrap(),
    });

    let dpd = {
        let global_conf = global_conf.clone();
        thread::spawn(move || debug_thread_func(global_conf))
    };
    let mut rpd = vec![];
    let mut wpd = vec![];
    for _ in 0..read_count {
        let global_conf = global_conf.clone();
        rpd.push(thread::spawn(move || read_thread_func(global_conf)));
    }
    for _ in 0..write_count {
        let global_conf = global_conf.clone();
        wpd.push(thread::spawn(move || write_thread_func(global_conf)));
    }
    for t in rpd {
        t.join().unwrap();
    }
    println!("read threads joined");
    for t in wpd {
        t.join().unwrap();
    }
    println!("write threads joined");

    global_conf.stop.store(true, Ordering::Release);
    dpd.join().unwrap();

    let last = global_conf.v.swap(ptr::null_mut(), Ordering::AcqRel);
    unsafe { global_conf.gc.retire_box(last).unwrap() };
    global_conf.gc.help_scan().unwrap();
    global_conf.gc.scan().unwrap();
    assert_eq!(0, cnt.load(Ordering::SeqCst));

    let stat = global_conf.gc.statistics();
    assert_eq!(stat.retired_count, stat.free_count);
    assert_eq!(stat.guard_allocated, stat.guard_freed);
}

#[test]
fn test_guard_blocks_reclamation() {
    let _ = env_logger::try_init();
    let cnt = Arc::new(AtomicI64::new(0));
    let gc = HazardGc::new(config(2)).unwrap();
    let shared = Arc::new(AtomicPtr::new(TestObj::boxed(&cnt)));
    let protected = Arc::new(Barrier::new(2));
    let (retired_tx, retired_rx) = mpsc::channel();
    let (cleared_tx, cleared_rx) = mpsc::channel();

    let reader = {
        let gc = gc.clone();
        let shared = shared.clone();
        let protected = protected.clone();
        let cnt = cnt.clone();
        thread::spawn(move || {
            let guard = Guard::new(&gc).unwrap();
            let x = guard.protect(&*shared);
            protected.wait();
            retired_rx.recv().unwrap();
            // still readable though already retired and scanned
            assert_eq!(unsafe { (*x).data }, Some(0));
            assert_eq!(cnt.load(Ordering::SeqCst), 1);
            guard.clear();
            cleared_tx.send(()).unwrap();
            drop(guard);
            gc.detach_thread().unwrap();
        })
    };

    protected.wait();
    let x = shared.swap(ptr::null_mut(), Ordering::AcqRel);
    unsafe { gc.retire_box(x).unwrap() };
    gc.scan().unwrap();
    assert_eq!(cnt.load(Ordering::SeqCst), 1);
    retired_tx.send(()).unwrap();

    cleared_rx.recv().unwrap();
    gc.scan().unwrap();
    assert_eq!(cnt.load(Ordering::SeqCst), 0);
    reader.join().unwrap();
}

#[test]
fn test_exited_thread_is_detached() {
    let _ = env_logger::try_init();
    let cnt = Arc::new(AtomicI64::new(0));
    let gc = HazardGc::new(config(2)).unwrap();
    {
        let gc = gc.clone();
        let cnt = cnt.clone();
        thread::spawn(move || {
            for _ in 0..10 {
                unsafe { gc.retire_box(TestObj::boxed(&cnt)).unwrap() };
            }
            assert!(gc.is_thread_attached());
            assert_eq!(cnt.load(Ordering::SeqCst), 10);
        })
        .join()
        .unwrap();
    }
    assert_eq!(cnt.load(Ordering::SeqCst), 0);
    let stat = gc.statistics();
    assert_eq!(stat.retired_count, 10);
    assert_eq!(stat.free_count, 10);

    // the record of the exited thread is reused
    let records = stat.thread_rec_count;
    thread::spawn(move || {
        let _guard = Guard::new(&gc).unwrap();
        assert_eq!(gc.statistics().thread_rec_count, records);
    })
    .join()
    .unwrap();
}

#[test]
fn test_help_scan_adopts_leftovers() {
    let _ = env_logger::try_init();
    let cnt = Arc::new(AtomicI64::new(0));
    let gc = HazardGc::new(config(2)).unwrap();
    let guard = Guard::new(&gc).unwrap();
    let x = TestObj::boxed(&cnt);
    guard.assign(x as *const TestObj);
    {
        let gc = gc.clone();
        let cnt = cnt.clone();
        let x = x as usize;
        thread::spawn(move || unsafe {
            gc.retire_box(x as *mut TestObj).unwrap();
            gc.retire_box(TestObj::boxed(&cnt)).unwrap();
        })
        .join()
        .unwrap();
    }
    // the exited thread could free only the unprotected object
    assert_eq!(cnt.load(Ordering::SeqCst), 1);
    gc.help_scan().unwrap();
    assert_eq!(cnt.load(Ordering::SeqCst), 1);

    assert_eq!(gc.detach_thread(), Err(Status::Busy));
    drop(guard);
    gc.scan().unwrap();
    assert_eq!(cnt.load(Ordering::SeqCst), 0);
    assert!(gc.statistics().help_scan_count >= 2);
}

#[test]
fn test_retire_triggers_help_scan() {
    let _ = env_logger::try_init();
    let cnt = Arc::new(AtomicI64::new(0));
    let gc = HazardGc::new(Config {
        help_scan_interval_us: 1,
        ..config(2)
    })
    .unwrap();
    let guard = Guard::new(&gc).unwrap();
    let x = TestObj::boxed(&cnt);
    guard.assign(x as *const TestObj);
    {
        let gc = gc.clone();
        let x = x as usize;
        thread::spawn(move || unsafe { gc.retire_box(x as *mut TestObj).unwrap() })
            .join()
            .unwrap();
    }
    assert_eq!(cnt.load(Ordering::SeqCst), 1);
    drop(guard);
    thread::sleep(time::Duration::from_millis(2));

    // far below max_retired_ptr_count, the elapsed interval alone adopts the leftover
    let before = gc.statistics().help_scan_count;
    unsafe { gc.retire_box(TestObj::boxed(&cnt)).unwrap() };
    assert!(gc.statistics().help_scan_count > before);
    assert_eq!(cnt.load(Ordering::SeqCst), 0);
}

#[test]
fn test_destruct() {
    let _ = env_logger::try_init();
    let cnt = Arc::new(AtomicI64::new(0));
    let gc = HazardGc::new(config(2)).unwrap();
    let guard = Guard::new(&gc).unwrap();
    let x = TestObj::boxed(&cnt);
    guard.assign(x as *const TestObj);
    unsafe {
        gc.retire_box(x).unwrap();
        gc.retire_box(TestObj::boxed(&cnt)).unwrap();
    }
    unsafe { gc.destruct(true) };
    assert_eq!(cnt.load(Ordering::SeqCst), 0);
    assert!(gc.is_destructed());
    // its slot was taken back by destruct
    assert!(guard.is_empty());
    drop(guard);
    let stat = gc.postmortem_statistics();
    assert_eq!(stat.retired_count, 2);
    assert_eq!(stat.free_count, 2);

    let y = TestObj::boxed(&cnt);
    assert_eq!(unsafe { gc.retire_box(y) }, Err(Status::Destructed));
    assert_eq!(Guard::new(&gc).err(), Some(Status::Destructed));
    drop(unsafe { Box::from_raw(y) });
}

#[test]
fn test_guards_outlive_destruct() {
    let _ = env_logger::try_init();
    let cnt = Arc::new(AtomicI64::new(0));
    let gc = HazardGc::new(config(4)).unwrap();
    let guards = GuardArray::<2>::new(&gc).unwrap();
    let guard = Guard::new(&gc).unwrap();
    let x = TestObj::boxed(&cnt);
    guards.assign(0, x as *const TestObj);
    guard.assign(x as *const TestObj);
    unsafe {
        gc.retire_box(x).unwrap();
        gc.destruct(true);
    }
    assert_eq!(cnt.load(Ordering::SeqCst), 0);
    drop(guard);
    drop(guards);
    let stat = gc.postmortem_statistics();
    assert_eq!(stat.guard_allocated, 3);
    assert_eq!(stat.guard_freed, 3);
}

thread_local! {
    static DISPOSED: RefCell<Vec<usize>> = RefCell::new(vec![]);
}

/// Frees boxed values and records their addresses.
struct RecordingDisposer;

impl Disposer<u64> for RecordingDisposer {
    unsafe fn dispose(ptr: *mut u64) {
        DISPOSED.with(|d| d.borrow_mut().push(ptr as usize));
        drop(Box::from_raw(ptr));
    }
}

/// What the guards publish and what is retired but not freed yet.
struct GuardModel {
    protected: Vec<Option<usize>>,
    retired: BTreeSet<usize>,
}

impl GuardModel {
    fn check_disposed(&mut self) {
        let disposed = DISPOSED.with(|d| std::mem::take(&mut *d.borrow_mut()));
        for addr in disposed {
            assert!(
                !self.protected.contains(&Some(addr)),
                "{:#x} freed while guarded",
                addr
            );
            assert!(self.retired.remove(&addr), "{:#x} freed but never retired", addr);
        }
    }
}

fn run_guard_model(scan_type: ScanType, seed: u64) {
    const GUARDS: usize = 4;
    let gc = HazardGc::new(Config {
        scan_type,
        max_thread_count: 2,
        max_retired_ptr_count: 8,
        ..config(GUARDS)
    })
    .unwrap();
    let guards: Vec<Guard> = (0..GUARDS).map(|_| Guard::new(&gc).unwrap()).collect();
    let mut model = GuardModel {
        protected: vec![None; GUARDS],
        retired: BTreeSet::new(),
    };
    let mut live: Vec<usize> = vec![];
    let mut rng = StdRng::seed_from_u64(seed);

    for i in 0..5000u64 {
        match rng.gen_range(0..5) {
            0 => live.push(Box::into_raw(Box::new(i)) as usize),
            1 => {
                // any object not freed yet, retired ones included
                let candidates: Vec<usize> =
                    live.iter().chain(model.retired.iter()).cloned().collect();
                if !candidates.is_empty() {
                    let g = rng.gen_range(0..GUARDS);
                    let addr = candidates[rng.gen_range(0..candidates.len())];
                    guards[g].assign(addr as *const u64);
                    model.protected[g] = Some(addr);
                }
            }
            2 => {
                let g = rng.gen_range(0..GUARDS);
                guards[g].clear();
                model.protected[g] = None;
            }
            3 => {
                if !live.is_empty() {
                    let addr = live.swap_remove(rng.gen_range(0..live.len()));
                    model.retired.insert(addr);
                    unsafe { gc.retire::<u64, RecordingDisposer>(addr as *mut u64).unwrap() };
                }
            }
            _ => {
                gc.scan().unwrap();
                model.check_disposed();
                // a scan leaves only guarded objects behind
                for addr in model.retired.iter() {
                    assert!(model.protected.contains(&Some(*addr)));
                }
            }
        }
        model.check_disposed();
    }

    drop(guards);
    model.protected = vec![None; GUARDS];
    gc.scan().unwrap();
    model.check_disposed();
    assert!(model.retired.is_empty());
    let stat = gc.statistics();
    assert_eq!(stat.retired_count, stat.free_count);
    for addr in live {
        drop(unsafe { Box::from_raw(addr as *mut u64) });
    }
}

#[test]
fn test_guarded_never_freed_classic() {
    let _ = env_logger::try_init();
    for seed in 0..8 {
        run_guard_model(ScanType::Classic, seed);
    }
}

#[test]
fn test_guarded_never_freed_in_place() {
    let _ = env_logger::try_init();
    for seed in 0..8 {
        run_guard_model(ScanType::InPlace, seed);
    }
}
