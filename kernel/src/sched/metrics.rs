//! Scheduler statistics
//!
//! Global counters are plain atomics updated with relaxed ordering from
//! every CPU. A [`SchedSnapshot`] reads them one by one, so it may be
//! slightly inconsistent across CPUs.

use core::sync::atomic::{AtomicU64, Ordering};

use super::{clock::NS_PER_MS, task::SchedClass};

/// Scheduler performance metrics
pub struct SchedulerMetrics {
    /// Total number of context switches
    pub context_switches: AtomicU64,
    /// Number of voluntary context switches (yield, sleep, block)
    pub voluntary_switches: AtomicU64,
    /// Number of involuntary context switches (preemption, expiry)
    pub involuntary_switches: AtomicU64,
    /// Number of scheduling decisions made
    pub schedule_calls: AtomicU64,
    /// Number of times the idle sentinel was picked
    pub idle_scheduled: AtomicU64,
    /// Load balancing runs
    pub load_balance_count: AtomicU64,
    /// Task migrations between CPUs
    pub task_migrations: AtomicU64,
    /// One-level promotions by the aging sweep
    pub aging_promotions: AtomicU64,
    /// Straight-to-L0 promotions of starved entities
    pub starvation_promotions: AtomicU64,
    /// MLFQ demotions (expiry and CPU-hog)
    pub demotions: AtomicU64,
    /// Transitions into RT throttling
    pub rt_throttle_events: AtomicU64,
    /// Deadline misses by class
    pub deadline_misses: [AtomicU64; SchedClass::COUNT],
    /// Number of quanta handed out
    pub quanta_granted: AtomicU64,
    /// Sum of the quanta handed out
    pub quanta_granted_ns: AtomicU64,
}

impl SchedulerMetrics {
    /// Create new metrics instance
    pub const fn new() -> Self {
        Self {
            context_switches: AtomicU64::new(0),
            voluntary_switches: AtomicU64::new(0),
            involuntary_switches: AtomicU64::new(0),
            schedule_calls: AtomicU64::new(0),
            idle_scheduled: AtomicU64::new(0),
            load_balance_count: AtomicU64::new(0),
            task_migrations: AtomicU64::new(0),
            aging_promotions: AtomicU64::new(0),
            starvation_promotions: AtomicU64::new(0),
            demotions: AtomicU64::new(0),
            rt_throttle_events: AtomicU64::new(0),
            deadline_misses: [const { AtomicU64::new(0) }; SchedClass::COUNT],
            quanta_granted: AtomicU64::new(0),
            quanta_granted_ns: AtomicU64::new(0),
        }
    }

    /// Record a context switch
    pub fn record_context_switch(&self, voluntary: bool) {
        self.context_switches.fetch_add(1, Ordering::Relaxed);

        if voluntary {
            self.voluntary_switches.fetch_add(1, Ordering::Relaxed);
        } else {
            self.involuntary_switches.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_schedule_call(&self) {
        self.schedule_calls.fetch_add(1, Ordering::Relaxed);
    }

    /// Record idle sentinel scheduled
    pub fn record_idle_scheduled(&self) {
        self.idle_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    /// Record load balancing operation
    pub fn record_load_balance(&self) {
        self.load_balance_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Record task migration
    pub fn record_migration(&self) {
        self.task_migrations.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a one-level aging promotion. `starving` marks entities that
    /// waited past the starvation threshold; they count in both totals.
    pub fn record_promotion(&self, starving: bool) {
        self.aging_promotions.fetch_add(1, Ordering::Relaxed);
        if starving {
            self.starvation_promotions.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_demotion(&self) {
        self.demotions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rt_throttle(&self) {
        self.rt_throttle_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_deadline_miss(&self, class: SchedClass) {
        self.deadline_misses[class.index()].fetch_add(1, Ordering::Relaxed);
    }

    /// Record a fresh quantum handed to a dispatched entity
    pub fn record_quantum(&self, quantum_ns: u64) {
        self.quanta_granted.fetch_add(1, Ordering::Relaxed);
        self.quanta_granted_ns.fetch_add(quantum_ns, Ordering::Relaxed);
    }

    /// Build a snapshot. Runnable counts come from the runqueues and the
    /// elapsed time from the caller's clock.
    pub fn snapshot(&self, runnable_by_class: [usize; SchedClass::COUNT], uptime_ns: u64) -> SchedSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        let task_migrations = load(&self.task_migrations);
        let quanta = load(&self.quanta_granted);
        let uptime_ms = uptime_ns / NS_PER_MS;

        SchedSnapshot {
            context_switches: load(&self.context_switches),
            voluntary_switches: load(&self.voluntary_switches),
            involuntary_switches: load(&self.involuntary_switches),
            schedule_calls: load(&self.schedule_calls),
            idle_scheduled: load(&self.idle_scheduled),
            runnable_by_class,
            deadline_misses: self.deadline_misses.each_ref().map(load),
            rt_throttle_events: load(&self.rt_throttle_events),
            load_balance_count: load(&self.load_balance_count),
            task_migrations,
            migrations_per_sec: if uptime_ms > 0 {
                task_migrations.saturating_mul(1000) / uptime_ms
            } else {
                0
            },
            aging_promotions: load(&self.aging_promotions),
            starvation_promotions: load(&self.starvation_promotions),
            demotions: load(&self.demotions),
            avg_quantum_ns: if quanta > 0 {
                load(&self.quanta_granted_ns) / quanta
            } else {
                0
            },
        }
    }

    /// Reset all metrics
    pub fn reset(&self) {
        let counters = [
            &self.context_switches,
            &self.voluntary_switches,
            &self.involuntary_switches,
            &self.schedule_calls,
            &self.idle_scheduled,
            &self.load_balance_count,
            &self.task_migrations,
            &self.aging_promotions,
            &self.starvation_promotions,
            &self.demotions,
            &self.rt_throttle_events,
            &self.quanta_granted,
            &self.quanta_granted_ns,
        ];
        for counter in counters.into_iter().chain(self.deadline_misses.iter()) {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl Default for SchedulerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of the scheduler statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedSnapshot {
    pub context_switches: u64,
    pub voluntary_switches: u64,
    pub involuntary_switches: u64,
    pub schedule_calls: u64,
    pub idle_scheduled: u64,
    /// Runnable (queued or running) entities per class, [`SchedClass::ALL`]
    /// order
    pub runnable_by_class: [usize; SchedClass::COUNT],
    pub deadline_misses: [u64; SchedClass::COUNT],
    pub rt_throttle_events: u64,
    pub load_balance_count: u64,
    pub task_migrations: u64,
    /// Average since init
    pub migrations_per_sec: u64,
    pub aging_promotions: u64,
    pub starvation_promotions: u64,
    pub demotions: u64,
    pub avg_quantum_ns: u64,
}
