//! Operation counters of the lazy lists.

use crate::atomic::{AtomicCounter, RelaxedOrdering};
use std::sync::atomic::Ordering;

#[derive(Default)]
pub(crate) struct ListStat {
    pub insert_success: AtomicCounter<RelaxedOrdering>,
    pub insert_failed: AtomicCounter<RelaxedOrdering>,
    pub insert_retry: AtomicCounter<RelaxedOrdering>,
    pub erase_success: AtomicCounter<RelaxedOrdering>,
    pub erase_failed: AtomicCounter<RelaxedOrdering>,
    pub erase_retry: AtomicCounter<RelaxedOrdering>,
    pub find_success: AtomicCounter<RelaxedOrdering>,
    pub find_failed: AtomicCounter<RelaxedOrdering>,
    pub validation_success: AtomicCounter<RelaxedOrdering>,
    pub validation_failed: AtomicCounter<RelaxedOrdering>,
}

/// Counters of a list at one instant.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct ListStatSnapshot {
    pub insert_success: usize,
    pub insert_failed: usize,
    pub insert_retry: usize,
    pub erase_success: usize,
    pub erase_failed: usize,
    pub erase_retry: usize,
    pub find_success: usize,
    pub find_failed: usize,
    pub validation_success: usize,
    pub validation_failed: usize,
}

impl ListStat {
    #[inline]
    pub fn inc(counter: &AtomicCounter<RelaxedOrdering>) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ListStatSnapshot {
        let get = |c: &AtomicCounter<RelaxedOrdering>| c.load(Ordering::Relaxed);
        ListStatSnapshot {
            insert_success: get(&self.insert_success),
            insert_failed: get(&self.insert_failed),
            insert_retry: get(&self.insert_retry),
            erase_success: get(&self.erase_success),
            erase_failed: get(&self.erase_failed),
            erase_retry: get(&self.erase_retry),
            find_success: get(&self.find_success),
            find_failed: get(&self.find_failed),
            validation_success: get(&self.validation_success),
            validation_failed: get(&self.validation_failed),
        }
    }
}
