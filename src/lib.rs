//! Hazard Pointers garbage collector for Rust, with lazy lists built on top of it
//!
//! [`Hazard Pointers`](http://www.cs.otago.ac.nz/cosc440/readings/hazard-pointers.pdf) let a
//! thread publish the address of a shared object it is about to access. A writer that unlinks an
//! object retires it instead of freeing it, and the object is freed only once no thread publishes
//! its address any more, which also solves the [`ABA problem`](https://en.wikipedia.org/wiki/ABA_problem).
//!
//! `HazardGc` keeps one record per thread with a fixed number of hazard pointer slots and a
//! bounded list of retired pointers. Slots are taken through `Guard` and `GuardArray`; a full
//! retired list triggers a scan of every record. Records of exited threads are reused and their
//! leftovers adopted through `help_scan`.
//!
//! `LazyList` and `LazySkipList` are ordered key-value containers with lock-free lookups and
//! per-node spin locks for updates, reclaimed by `HazardGc`. Their values are handed out as
//! `GuardedPtr` (still in the container) and `ExemptPtr` (unlinked, retired on drop).

pub mod atomic;
pub mod backoff;
pub mod error;
pub mod guard;
pub mod hazard_gc;
mod hazard_pointer;
pub mod lazy_list;
pub mod lazy_skip_list;
pub mod list_stat;
pub mod retired;
pub mod spin_lock;
pub mod util;

pub use crate::error::{Result, Status};
pub use crate::guard::{ExemptPtr, Guard, GuardArray, GuardedPtr};
pub use crate::hazard_gc::{Config, HazardGc, ScanType, Stat};
pub use crate::lazy_list::LazyList;
pub use crate::lazy_skip_list::LazySkipList;
pub use crate::list_stat::ListStatSnapshot;

#[macro_use]
extern crate log;

#[macro_use]
extern crate cfg_if;
