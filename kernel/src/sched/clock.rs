//! Monotonic time source consumed by the scheduler
//!
//! The embedding kernel provides a [`Clock`] backed by its timer hardware
//! (TSC, CNTVCT_EL0, `time` CSR). Host tests and simulations use
//! [`ManualClock`], which only moves when told to.
//!
//! ## Skew
//!
//! `now_ns()` must never go backwards on a single CPU. Across CPUs a small
//! skew (bounded by one tick period) is tolerated: every elapsed-time
//! computation in the scheduler uses saturating subtraction, so a reading
//! that is behind an earlier stamp from another CPU counts as zero elapsed
//! time rather than wrapping.

use core::sync::atomic::{AtomicU64, Ordering};

/// Nanoseconds per millisecond.
pub const NS_PER_MS: u64 = 1_000_000;

/// Nanoseconds per microsecond.
pub const NS_PER_US: u64 = 1_000;

/// Monotonic nanosecond time source.
pub trait Clock: Send + Sync {
    /// Current time in nanoseconds since an arbitrary fixed origin.
    fn now_ns(&self) -> u64;
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now_ns(&self) -> u64 {
        (**self).now_ns()
    }
}

/// Clock that only advances when explicitly moved.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Create a clock reading `start_ns`.
    pub const fn new(start_ns: u64) -> Self {
        Self {
            now: AtomicU64::new(start_ns),
        }
    }

    /// Move the clock forward by `ns`.
    pub fn advance(&self, ns: u64) {
        self.now.fetch_add(ns, Ordering::AcqRel);
    }

    /// Move the clock forward by whole milliseconds.
    pub fn advance_ms(&self, ms: u64) {
        self.advance(ms * NS_PER_MS);
    }

    /// Set an absolute reading. Going backwards is ignored.
    pub fn set(&self, ns: u64) {
        self.now.fetch_max(ns, Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    fn now_ns(&self) -> u64 {
        self.now.load(Ordering::Acquire)
    }
}

/// Elapsed time between two stamps, zero if `later` is behind `earlier`.
#[inline]
pub fn elapsed(earlier: u64, later: u64) -> u64 {
    later.saturating_sub(earlier)
}

/// Convert timer ticks to nanoseconds for a given tick period.
#[inline]
pub fn ticks_to_ns(ticks: u64, tick_period_ns: u64) -> u64 {
    ticks.saturating_mul(tick_period_ns)
}

/// Convert nanoseconds to whole timer ticks for a given tick period.
#[inline]
pub fn ns_to_ticks(ns: u64, tick_period_ns: u64) -> u64 {
    if tick_period_ns == 0 {
        0
    } else {
        ns / tick_period_ns
    }
}
