extern crate core_affinity;
extern crate rs_hazard_gc;
#[macro_use]
extern crate log;
extern crate env_logger;

use rs_hazard_gc::guard::Guard;
use rs_hazard_gc::hazard_gc::{Config, HazardGc};
use rs_hazard_gc::util;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicPtr, Ordering};
use std::sync::Arc;
use std::thread;
use std::time;
use std::time::SystemTime;

#[repr(align(16))]
struct Value {
    value: i64,
}

struct GlobalControl {
    gc: HazardGc,
    shared: AtomicPtr<Value>,
    loop_cnt: i64,
    stop: AtomicBool,
    read: AtomicI64,
    written: AtomicI64,
}

fn set_cpu_affinity() {
    let cpus = core_affinity::get_core_ids().unwrap();
    core_affinity::set_for_current(cpus[util::get_thread_id() as usize % cpus.len()]);
    info!(
        "set_cpu_affinity {} {}",
        util::get_thread_id(),
        util::get_thread_id() as usize % cpus.len()
    );
}

fn reader_thread(global_control: Arc<GlobalControl>) {
    set_cpu_affinity();
    let mut tol = 0;
    while !global_control.stop.load(Ordering::Acquire) {
        let guard = Guard::new(&global_control.gc).unwrap();
        let v = guard.protect(&global_control.shared);
        assert!(unsafe { (*v).value } >= 0);
        tol += 1;
        if tol % 1024 == 0 {
            global_control.read.fetch_add(tol, Ordering::Relaxed);
            tol = 0;
        }
    }
    global_control.read.fetch_add(tol, Ordering::Relaxed);
}

fn writer_thread(global_control: Arc<GlobalControl>) {
    set_cpu_affinity();
    for i in 0..global_control.loop_cnt {
        let v = Box::into_raw(Box::new(Value { value: i }));
        let old = global_control.shared.swap(v, Ordering::AcqRel);
        unsafe { global_control.gc.retire_box(old).unwrap() };
        if i % 1024 == 0 {
            global_control.written.fetch_add(1024, Ordering::Relaxed);
        }
    }
}

fn debug_thread(global_control: Arc<GlobalControl>) {
    while !global_control.stop.load(Ordering::Acquire) {
        let stat = global_control.gc.statistics();
        info!(
            "debug_thread written {} read {} waiting {}",
            global_control.written.load(Ordering::Relaxed),
            global_control.read.load(Ordering::Relaxed),
            stat.retired_count - stat.free_count
        );
        thread::sleep(time::Duration::from_millis(1000));
    }
}

fn main() {
    let start = SystemTime::now();
    thread::spawn(|| {
        test_multi_threads();
    })
    .join()
    .unwrap();
    let end = SystemTime::now();
    let cost = {
        let t = end.duration_since(start).unwrap();
        t.subsec_millis() as u64 + t.as_secs() * 1000
    };
    println!("time cost {} ms", cost);
}

fn test_multi_threads() {
    env_logger::init();

    let cpu_count = core_affinity::get_core_ids().unwrap().len();
    let writer_count = (cpu_count + 1) / 2;
    let reader_count = cpu_count - writer_count + 1;
    info!("writer_count {} reader_count {}", writer_count, reader_count);

    let gc = HazardGc::new(Config {
        hazard_ptr_count: 1,
        max_thread_count: cpu_count + 2,
        ..Default::default()
    })
    .unwrap();
    let global_control = Arc::new(GlobalControl {
        gc: gc.clone(),
        shared: AtomicPtr::new(Box::into_raw(Box::new(Value { value: 0 }))),
        loop_cnt: 1 << 22,
        stop: AtomicBool::new(false),
        read: AtomicI64::new(0),
        written: AtomicI64::new(0),
    });

    let watch_thread = {
        let global_control = global_control.clone();
        thread::spawn(move || debug_thread(global_control))
    };
    let readers: Vec<_> = (0..reader_count)
        .map(|_| {
            let global_control = global_control.clone();
            thread::spawn(move || reader_thread(global_control))
        })
        .collect();
    let writers: Vec<_> = (0..writer_count)
        .map(|_| {
            let global_control = global_control.clone();
            thread::spawn(move || writer_thread(global_control))
        })
        .collect();

    for t in writers {
        t.join().unwrap();
    }
    info!("writer threads joined");
    global_control.stop.store(true, Ordering::Release);
    for t in readers {
        t.join().unwrap();
    }
    info!("reader threads joined");
    watch_thread.join().unwrap();

    let last = global_control.shared.swap(std::ptr::null_mut(), Ordering::AcqRel);
    unsafe { gc.retire_box(last).unwrap() };
    gc.help_scan().unwrap();
    gc.scan().unwrap();

    let stat = gc.statistics();
    info!("statistics {:?}", stat);
    assert_eq!(stat.retired_count, stat.free_count);
    println!(
        "written {} read {} scans {} help scans {}",
        global_control.written.load(Ordering::Relaxed),
        global_control.read.load(Ordering::Relaxed),
        stat.scan_count,
        stat.help_scan_count
    );
}
