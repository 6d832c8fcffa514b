//! Back-off strategies for contended retry loops.
//!
//! A strategy only affects latency and fairness, never correctness. Create one per wait loop
//! (`Default`) or `reset` it between logically distinct loops.

use crate::util;
use std::thread;
use std::time::Duration;

pub trait Backoff: Default {
    /// One back-off step after a failed attempt.
    fn backoff(&mut self);

    /// Back off unless `pred` already holds. Return the answer of `pred`.
    fn backoff_until<P: FnMut() -> bool>(&mut self, mut pred: P) -> bool {
        if pred() {
            return true;
        }
        self.backoff();
        false
    }

    /// Restore the initial state.
    fn reset(&mut self) {}
}

/// Busy spin without delay.
#[derive(Debug, Default, Copy, Clone)]
pub struct Empty;

impl Backoff for Empty {
    #[inline]
    fn backoff(&mut self) {}
}

/// Processor pause hint.
#[derive(Debug, Default, Copy, Clone)]
pub struct Pause;

impl Backoff for Pause {
    #[inline]
    fn backoff(&mut self) {
        util::pause();
    }
}

/// Cooperative yield to the scheduler.
#[derive(Debug, Default, Copy, Clone)]
pub struct Yield;

impl Backoff for Yield {
    #[inline]
    fn backoff(&mut self) {
        thread::yield_now();
    }
}

/// Sleep for a fixed timeout.
#[derive(Debug, Copy, Clone)]
pub struct Delay {
    timeout: Duration,
}

impl Delay {
    pub fn new(timeout: Duration) -> Self {
        Delay { timeout }
    }
}

impl Default for Delay {
    fn default() -> Self {
        Delay::new(Duration::from_millis(5))
    }
}

impl Backoff for Delay {
    #[inline]
    fn backoff(&mut self) {
        thread::sleep(self.timeout);
    }
}

/// Lower spinning limit of `Exponential`.
pub const EXPONENTIAL_LOWER_BOUND: usize = 16;
/// Upper spinning limit of `Exponential`.
pub const EXPONENTIAL_UPPER_BOUND: usize = 16 * 1024;

/// Runs the fast strategy `F` a doubling number of times per step until the count exceeds the
/// upper bound, then switches to the slow strategy `S` until `reset`.
#[derive(Debug, Clone)]
pub struct Exponential<F = Pause, S = Yield> {
    cur: usize,
    lower: usize,
    upper: usize,
    fast: F,
    slow: S,
}

impl<F: Backoff, S: Backoff> Exponential<F, S> {
    pub fn with_bounds(lower: usize, upper: usize) -> Self {
        let lower = lower.max(1);
        Exponential {
            cur: lower,
            lower,
            upper: upper.max(lower),
            fast: F::default(),
            slow: S::default(),
        }
    }

    /// True once the fast phase is over.
    pub fn is_slow_path(&self) -> bool {
        self.cur > self.upper
    }
}

impl<F: Backoff, S: Backoff> Default for Exponential<F, S> {
    fn default() -> Self {
        Self::with_bounds(EXPONENTIAL_LOWER_BOUND, EXPONENTIAL_UPPER_BOUND)
    }
}

impl<F: Backoff, S: Backoff> Backoff for Exponential<F, S> {
    fn backoff(&mut self) {
        if self.cur <= self.upper {
            for _ in 0..self.cur {
                self.fast.backoff();
            }
            self.cur *= 2;
        } else {
            self.slow.backoff();
        }
    }

    fn backoff_until<P: FnMut() -> bool>(&mut self, mut pred: P) -> bool {
        if self.cur <= self.upper {
            for _ in 0..self.cur {
                if self.fast.backoff_until(&mut pred) {
                    return true;
                }
            }
            self.cur *= 2;
            false
        } else {
            self.slow.backoff_until(pred)
        }
    }

    fn reset(&mut self) {
        self.cur = self.lower;
        self.fast.reset();
        self.slow.reset();
    }
}

const SPIN_LIMIT: u32 = 6;
const YIELD_LIMIT: u32 = 10;
const SLEEP_MICROS: u64 = 100;

/// Spins with a doubling count of pause hints, then yields, then sleeps under prolonged
/// contention.
#[derive(Debug, Default, Clone)]
pub struct DefaultBackoff {
    step: u32,
}

impl DefaultBackoff {
    /// True once the strategy sleeps instead of spinning or yielding.
    pub fn is_sleeping(&self) -> bool {
        self.step > YIELD_LIMIT
    }
}

impl Backoff for DefaultBackoff {
    fn backoff(&mut self) {
        if self.step <= SPIN_LIMIT {
            for _ in 0..1u32 << self.step {
                util::pause();
            }
        } else if self.step <= YIELD_LIMIT {
            thread::yield_now();
        } else {
            thread::sleep(Duration::from_micros(SLEEP_MICROS));
        }
        self.step = self.step.saturating_add(1);
    }

    fn reset(&mut self) {
        self.step = 0;
    }
}
