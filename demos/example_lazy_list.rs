extern crate core_affinity;
extern crate rand;
extern crate rs_hazard_gc;
#[macro_use]
extern crate log;
extern crate env_logger;

use rand::Rng;
use rs_hazard_gc::hazard_gc::{Config, HazardGc};
use rs_hazard_gc::lazy_list::LazyList;
use rs_hazard_gc::lazy_skip_list::{self, LazySkipList};
use rs_hazard_gc::util;
use std::sync::Arc;
use std::thread;
use std::time::SystemTime;

const KEY_RANGE: u64 = 1024;
const LOOP_CNT: usize = 1 << 20;

/// Operations shared by both lists.
trait OrderedSet: Send + Sync + 'static {
    fn insert(&self, key: u64) -> bool;
    fn erase(&self, key: u64) -> bool;
    fn contains(&self, key: u64) -> bool;
    fn dump_statistics(&self);
}

impl OrderedSet for LazyList<u64, u64> {
    fn insert(&self, key: u64) -> bool {
        LazyList::insert(self, key, key)
    }

    fn erase(&self, key: u64) -> bool {
        LazyList::erase(self, &key)
    }

    fn contains(&self, key: u64) -> bool {
        LazyList::contains(self, &key)
    }

    fn dump_statistics(&self) {
        info!("lazy list len {} {:?}", self.len(), self.statistics());
    }
}

impl OrderedSet for LazySkipList<u64, u64> {
    fn insert(&self, key: u64) -> bool {
        LazySkipList::insert(self, key, key)
    }

    fn erase(&self, key: u64) -> bool {
        LazySkipList::erase(self, &key)
    }

    fn contains(&self, key: u64) -> bool {
        LazySkipList::contains(self, &key)
    }

    fn dump_statistics(&self) {
        info!("lazy skip list len {} {:?}", self.len(), self.statistics());
    }
}

fn set_cpu_affinity() {
    let cpus = core_affinity::get_core_ids().unwrap();
    core_affinity::set_for_current(cpus[util::get_thread_id() as usize % cpus.len()]);
}

fn worker_thread<S: OrderedSet>(set: Arc<S>) {
    set_cpu_affinity();
    let mut rng = rand::thread_rng();
    for _ in 0..LOOP_CNT {
        let key = rng.gen_range(0..KEY_RANGE);
        match rng.gen_range(0..10) {
            0 => {
                set.insert(key);
            }
            1 => {
                set.erase(key);
            }
            _ => {
                set.contains(key);
            }
        }
    }
}

fn run<S: OrderedSet>(name: &str, set: S, thread_count: usize) {
    let start = SystemTime::now();
    let set = Arc::new(set);
    let workers: Vec<_> = (0..thread_count)
        .map(|_| {
            let set = set.clone();
            thread::spawn(move || worker_thread(set))
        })
        .collect();
    for t in workers {
        t.join().unwrap();
    }
    let cost = SystemTime::now().duration_since(start).unwrap();
    println!(
        "{}: {} threads, {} ops each, time cost {} ms",
        name,
        thread_count,
        LOOP_CNT,
        cost.as_millis()
    );
    set.dump_statistics();
}

fn main() {
    env_logger::init();

    let thread_count = core_affinity::get_core_ids().unwrap().len();
    let gc = HazardGc::new(Config {
        hazard_ptr_count: lazy_skip_list::HAZARD_PTR_COUNT,
        max_thread_count: thread_count + 1,
        ..Default::default()
    })
    .unwrap();

    let list: LazyList<u64, u64> = LazyList::new(&gc).unwrap();
    run("lazy list", list, thread_count);
    let skip_list: LazySkipList<u64, u64> = LazySkipList::new(&gc).unwrap();
    run("lazy skip list", skip_list, thread_count);

    gc.help_scan().unwrap();
    let stat = gc.statistics();
    println!(
        "retired {} freed {} scans {} help scans {} records {}",
        stat.retired_count,
        stat.free_count,
        stat.scan_count,
        stat.help_scan_count,
        stat.thread_rec_count
    );
}
