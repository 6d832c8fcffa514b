extern crate time;

use std::cell::Cell;
use std::hint;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicI64, Ordering};

/// Thread id of a record no thread owns.
pub const NULL_THREAD_ID: i64 = 0;

static GLOBAL_THREAD_ID: AtomicI64 = AtomicI64::new(NULL_THREAD_ID + 1);

/// Process-unique id of current thread. Ids start from 1 and are never reused.
pub fn get_thread_id() -> i64 {
    thread_local!(static THREAD_ID: Cell<i64> = Cell::new(NULL_THREAD_ID));
    THREAD_ID.with(|tid| {
        if NULL_THREAD_ID == tid.get() {
            tid.set(GLOBAL_THREAD_ID.fetch_add(1, Ordering::Relaxed));
        }
        tid.get()
    })
}

#[repr(align(64))]
pub struct WrappedAlign64Type<T>(pub T);

impl<T> Default for WrappedAlign64Type<T>
where
    T: Default,
{
    fn default() -> Self {
        WrappedAlign64Type(T::default())
    }
}

impl<T> Deref for WrappedAlign64Type<T> {
    type Target = T;

    fn deref(&self) -> &<Self as Deref>::Target {
        &self.0
    }
}

impl<T> DerefMut for WrappedAlign64Type<T> {
    fn deref_mut(&mut self) -> &mut <Self as Deref>::Target {
        &mut self.0
    }
}

pub fn get_cur_microseconds_time() -> i64 {
    let timespec = time::get_time();
    timespec.sec * 1_000_000 + timespec.nsec as i64 / 1_000
}

#[inline]
pub fn pause() {
    hint::spin_loop();
}
