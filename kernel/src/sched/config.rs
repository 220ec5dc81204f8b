//! Scheduler tunables
//!
//! Every tunable has a named default. The surrounding kernel may expose
//! them through its own configuration surface and hand the result to
//! [`Scheduler::init`](super::Scheduler::init).

use super::clock::{NS_PER_MS, NS_PER_US};
use crate::error::{SchedError, SchedResult};

/// Maximum number of CPUs supported (width of [`CpuSet`](super::CpuSet)).
pub const MAX_CPUS: usize = 64;

/// Number of MLFQ levels.
pub const MLFQ_LEVELS: usize = 5;

/// Lowest-priority MLFQ level.
pub const MLFQ_LOWEST: u8 = (MLFQ_LEVELS - 1) as u8;

/// Level new normal tasks start at.
pub const DEFAULT_LEVEL: u8 = 2;

/// Base quantum per MLFQ level, in nanoseconds.
pub const DEFAULT_QUANTA_NS: [u64; MLFQ_LEVELS] = [
    NS_PER_MS,      // L0: 1ms
    2 * NS_PER_MS,  // L1: 2ms
    4 * NS_PER_MS,  // L2: 4ms
    8 * NS_PER_MS,  // L3: 8ms
    16 * NS_PER_MS, // L4: 16ms
];

/// Timer tick period.
pub const DEFAULT_TICK_PERIOD_NS: u64 = NS_PER_MS;

/// Queued entities waiting longer than this are promoted one level.
pub const AGING_THRESHOLD_MS: u64 = 50;

/// Queued entities waiting longer than this are reported as starving when
/// aging promotes them (still one level per sweep).
pub const STARVATION_THRESHOLD_MS: u64 = 500;

/// How often each CPU runs its aging sweep.
pub const DEFAULT_AGING_INTERVAL_NS: u64 = 10 * NS_PER_MS;

/// How often each CPU attempts a load balance.
pub const DEFAULT_LOAD_BALANCE_INTERVAL_NS: u64 = 10 * NS_PER_MS;

/// Minimum time between two migrations of the same entity.
pub const DEFAULT_MIGRATION_COST_NS: u64 = 50 * NS_PER_US;

/// Global RT bandwidth accounting window.
pub const DEFAULT_RT_PERIOD_NS: u64 = 1_000 * NS_PER_MS;

/// RT runtime allowed per window (95%).
pub const DEFAULT_RT_BUDGET_NS: u64 = 950 * NS_PER_MS;

/// Behavior classification window.
pub const DEFAULT_BEHAVIOR_WINDOW_NS: u64 = 10 * NS_PER_MS;

/// Entity slots preallocated per CPU.
pub const DEFAULT_SLOTS_PER_CPU: usize = 256;

/// CPUs per NUMA node when the platform does not describe its topology.
pub const DEFAULT_CPUS_PER_NODE: usize = 8;

/// Scheduler configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedConfig {
    /// Number of CPUs the scheduler manages (`1..=MAX_CPUS`)
    pub cpu_count: usize,
    /// CPUs per NUMA node (CPU `c` lives on node `c / cpus_per_node`)
    pub cpus_per_node: usize,
    /// Timer tick period
    pub tick_period_ns: u64,
    /// Base quantum per MLFQ level
    pub quanta_ns: [u64; MLFQ_LEVELS],
    /// Aging promotion threshold
    pub aging_threshold_ns: u64,
    /// Waits past this count as starvation when aged
    pub starvation_threshold_ns: u64,
    /// Aging sweep cadence
    pub aging_interval_ns: u64,
    /// Load balance cadence
    pub load_balance_interval_ns: u64,
    /// Migration cost estimate
    pub migration_cost_ns: u64,
    /// RT bandwidth period
    pub rt_period_ns: u64,
    /// RT bandwidth budget per period
    pub rt_budget_ns: u64,
    /// Behavior classification window
    pub behavior_window_ns: u64,
    /// Entity slots per CPU runqueue
    pub slots_per_cpu: usize,
}

impl Default for SchedConfig {
    fn default() -> Self {
        Self {
            cpu_count: 1,
            cpus_per_node: DEFAULT_CPUS_PER_NODE,
            tick_period_ns: DEFAULT_TICK_PERIOD_NS,
            quanta_ns: DEFAULT_QUANTA_NS,
            aging_threshold_ns: AGING_THRESHOLD_MS * NS_PER_MS,
            starvation_threshold_ns: STARVATION_THRESHOLD_MS * NS_PER_MS,
            aging_interval_ns: DEFAULT_AGING_INTERVAL_NS,
            load_balance_interval_ns: DEFAULT_LOAD_BALANCE_INTERVAL_NS,
            migration_cost_ns: DEFAULT_MIGRATION_COST_NS,
            rt_period_ns: DEFAULT_RT_PERIOD_NS,
            rt_budget_ns: DEFAULT_RT_BUDGET_NS,
            behavior_window_ns: DEFAULT_BEHAVIOR_WINDOW_NS,
            slots_per_cpu: DEFAULT_SLOTS_PER_CPU,
        }
    }
}

impl SchedConfig {
    /// Default configuration for `cpu_count` CPUs.
    pub fn with_cpus(cpu_count: usize) -> Self {
        Self {
            cpu_count,
            ..Self::default()
        }
    }

    pub fn with_cpus_per_node(mut self, cpus_per_node: usize) -> Self {
        self.cpus_per_node = cpus_per_node;
        self
    }

    pub fn with_aging_threshold_ms(mut self, ms: u64) -> Self {
        self.aging_threshold_ns = ms * NS_PER_MS;
        self
    }

    pub fn with_load_balance_interval_ns(mut self, ns: u64) -> Self {
        self.load_balance_interval_ns = ns;
        self
    }

    pub fn with_migration_cost_ns(mut self, ns: u64) -> Self {
        self.migration_cost_ns = ns;
        self
    }

    pub fn with_rt_bandwidth(mut self, budget_ns: u64, period_ns: u64) -> Self {
        self.rt_budget_ns = budget_ns;
        self.rt_period_ns = period_ns;
        self
    }

    pub fn with_behavior_window_ns(mut self, ns: u64) -> Self {
        self.behavior_window_ns = ns;
        self
    }

    pub fn with_slots_per_cpu(mut self, slots: usize) -> Self {
        self.slots_per_cpu = slots;
        self
    }

    /// Quantum for an MLFQ level (clamped to the lowest level).
    #[inline]
    pub fn quantum(&self, level: u8) -> u64 {
        self.quanta_ns[(level as usize).min(MLFQ_LEVELS - 1)]
    }

    /// Number of NUMA nodes implied by the CPU count.
    pub fn numa_nodes(&self) -> usize {
        self.cpu_count.div_ceil(self.cpus_per_node.max(1))
    }

    /// Check the configuration for internal consistency.
    pub fn validate(&self) -> SchedResult<()> {
        if self.cpu_count == 0 || self.cpu_count > MAX_CPUS {
            return Err(SchedError::InvalidArgument {
                name: "cpu_count",
                reason: "must be between 1 and MAX_CPUS",
            });
        }
        if self.cpus_per_node == 0 {
            return Err(SchedError::InvalidArgument {
                name: "cpus_per_node",
                reason: "must be non-zero",
            });
        }
        if self.tick_period_ns == 0 {
            return Err(SchedError::InvalidArgument {
                name: "tick_period_ns",
                reason: "must be non-zero",
            });
        }
        if self.quanta_ns.iter().any(|&q| q == 0) {
            return Err(SchedError::InvalidArgument {
                name: "quanta_ns",
                reason: "every level needs a non-zero quantum",
            });
        }
        if self.quanta_ns.windows(2).any(|w| w[0] > w[1]) {
            return Err(SchedError::InvalidArgument {
                name: "quanta_ns",
                reason: "quanta must not shrink at lower levels",
            });
        }
        if self.rt_period_ns == 0 || self.rt_budget_ns > self.rt_period_ns {
            return Err(SchedError::InvalidArgument {
                name: "rt_budget_ns",
                reason: "budget must fit in a non-zero period",
            });
        }
        if self.starvation_threshold_ns < self.aging_threshold_ns {
            return Err(SchedError::InvalidArgument {
                name: "starvation_threshold_ns",
                reason: "must not be shorter than the aging threshold",
            });
        }
        if self.slots_per_cpu == 0 {
            return Err(SchedError::InvalidArgument {
                name: "slots_per_cpu",
                reason: "must be non-zero",
            });
        }
        Ok(())
    }
}
