//! Global real-time bandwidth cap
//!
//! Real-time entities on all CPUs share one runtime budget per period.
//! Every nanosecond charged to a real-time entity is added here with an
//! atomic add; once the budget is used up the pickers treat their RT
//! queues as empty until the period rolls over. No lock is involved: the
//! first CPU to notice an elapsed period wins a compare-exchange on the
//! period start and resets the consumption.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use super::{clock::elapsed, config::SchedConfig, metrics::SchedulerMetrics};

/// Global RT runtime accounting
#[derive(Debug)]
pub struct RtBandwidth {
    period_ns: u64,
    budget_ns: u64,
    period_start_ns: AtomicU64,
    consumed_ns: AtomicU64,
    /// Set while throttled, to log and count transitions once
    throttled: AtomicBool,
}

impl RtBandwidth {
    pub fn new(config: &SchedConfig, now: u64) -> Self {
        Self {
            period_ns: config.rt_period_ns,
            budget_ns: config.rt_budget_ns,
            period_start_ns: AtomicU64::new(now),
            consumed_ns: AtomicU64::new(0),
            throttled: AtomicBool::new(false),
        }
    }

    pub fn period_ns(&self) -> u64 {
        self.period_ns
    }

    pub fn budget_ns(&self) -> u64 {
        self.budget_ns
    }

    /// RT runtime consumed in the current period.
    pub fn consumed_ns(&self) -> u64 {
        self.consumed_ns.load(Ordering::Acquire)
    }

    pub fn period_start_ns(&self) -> u64 {
        self.period_start_ns.load(Ordering::Acquire)
    }

    /// Start a new period if the current one is over. Returns true on the
    /// CPU that performed the rollover.
    pub fn rollover(&self, now: u64) -> bool {
        let start = self.period_start_ns.load(Ordering::Acquire);
        let since = elapsed(start, now);
        if since < self.period_ns {
            return false;
        }
        let new_start = start + since / self.period_ns * self.period_ns;
        if self
            .period_start_ns
            .compare_exchange(start, new_start, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.consumed_ns.store(0, Ordering::Release);
        if self.throttled.swap(false, Ordering::AcqRel) {
            log::debug!("RT bandwidth replenished at {}ns", now);
        }
        true
    }

    /// Charge RT runtime to the current period.
    pub fn charge(&self, ns: u64, now: u64) {
        self.rollover(now);
        self.consumed_ns.fetch_add(ns, Ordering::AcqRel);
    }

    /// Whether RT entities are throttled at `now`. Counts each transition
    /// into throttling once.
    pub fn is_throttled(&self, now: u64, metrics: &SchedulerMetrics) -> bool {
        self.rollover(now);
        let over = self.consumed_ns() >= self.budget_ns;
        if over && !self.throttled.swap(true, Ordering::AcqRel) {
            metrics.record_rt_throttle();
            log::debug!(
                "RT bandwidth exhausted: {}ns of {}ns used",
                self.consumed_ns(),
                self.budget_ns
            );
        }
        over
    }

    /// RT runtime left in the current period.
    pub fn remaining_ns(&self) -> u64 {
        self.budget_ns.saturating_sub(self.consumed_ns())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::clock::NS_PER_MS;

    fn bandwidth() -> RtBandwidth {
        RtBandwidth::new(&SchedConfig::default(), 0)
    }

    #[test]
    fn test_throttles_at_budget() {
        let rt = bandwidth();
        let metrics = SchedulerMetrics::new();
        rt.charge(949 * NS_PER_MS, 949 * NS_PER_MS);
        assert!(!rt.is_throttled(949 * NS_PER_MS, &metrics));
        rt.charge(NS_PER_MS, 950 * NS_PER_MS);
        assert!(rt.is_throttled(950 * NS_PER_MS, &metrics));
        assert!(rt.is_throttled(960 * NS_PER_MS, &metrics));
        assert_eq!(rt.remaining_ns(), 0);
        assert_eq!(metrics.rt_throttle_events.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_rollover_resets() {
        let rt = bandwidth();
        let metrics = SchedulerMetrics::new();
        rt.charge(950 * NS_PER_MS, 950 * NS_PER_MS);
        assert!(rt.is_throttled(999 * NS_PER_MS, &metrics));
        assert!(!rt.is_throttled(1000 * NS_PER_MS, &metrics));
        assert_eq!(rt.consumed_ns(), 0);
        assert_eq!(rt.period_start_ns(), 1000 * NS_PER_MS);

        // Several idle periods later the start stays period-aligned
        assert!(rt.rollover(3500 * NS_PER_MS));
        assert_eq!(rt.period_start_ns(), 3000 * NS_PER_MS);
        assert!(!rt.rollover(3600 * NS_PER_MS));
    }
}
