//! Scheduling entity: the scheduler's per-task record
//!
//! The task layer owns tasks; the scheduler only knows a task by its stable
//! [`TaskId`]. Each runnable or blocked task has exactly one [`SchedEntity`]
//! holding its class, MLFQ level, quantum, statistics and the intrusive
//! queue link used by whichever runqueue currently lists it.
//!
//! Mutators are only called by the scheduler with the owning runqueue lock
//! held (or, for blocked entities, with the parked table lock held).

use bitflags::bitflags;

use super::{
    clock::elapsed,
    config::{MAX_CPUS, MLFQ_LOWEST},
    queue::QueueLink,
};
use crate::error::{SchedError, SchedResult};

/// CPU identifier
pub type CpuId = u32;

/// Stable task identifier assigned by the task layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub u64);

impl core::fmt::Display for TaskId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// Scheduling class, highest priority first
///
/// The derived ordering is the strict class ordering used by the picker
/// and the preemption arbiter: `Gaming < RealTime < ... < Background`.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum SchedClass {
    /// Latency-critical gaming/interactive workloads (gaming band)
    Gaming = 0,
    /// Deadline-driven real-time tasks
    RealTime = 1,
    /// Interactive user tasks
    Interactive = 2,
    /// Normal batch tasks
    #[default]
    Normal = 3,
    /// Background/idle-priority tasks
    Background = 4,
}

impl SchedClass {
    /// Number of scheduling classes.
    pub const COUNT: usize = 5;

    /// All classes in priority order.
    pub const ALL: [SchedClass; Self::COUNT] = [
        SchedClass::Gaming,
        SchedClass::RealTime,
        SchedClass::Interactive,
        SchedClass::Normal,
        SchedClass::Background,
    ];

    /// Dense index for per-class statistics arrays.
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Whether entities of this class consume MLFQ quanta.
    #[inline]
    pub fn uses_quantum(self) -> bool {
        !matches!(self, SchedClass::Gaming | SchedClass::RealTime)
    }
}

/// Behavior tag derived by the classifier. Never set by users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Behavior {
    #[default]
    Unknown,
    /// High CPU usage, little waiting
    CpuBound,
    /// Mostly blocked on IO
    IoBound,
    /// Frequent short bursts ending in voluntary switches
    Interactive,
    /// Opted into gaming treatment
    Gaming,
}

/// Bounds of the nice value.
pub const NICE_MIN: i8 = -20;
pub const NICE_MAX: i8 = 19;

/// CPU affinity mask
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuSet {
    /// Bitmap of allowed CPUs (bit N = CPU N)
    mask: u64,
}

impl CpuSet {
    /// Create new CPU set with all CPUs allowed
    pub const fn all() -> Self {
        Self { mask: !0u64 }
    }

    /// Create an empty set
    pub const fn empty() -> Self {
        Self { mask: 0 }
    }

    /// Create new CPU set with single CPU
    pub const fn single(cpu: CpuId) -> Self {
        Self { mask: 1u64 << cpu }
    }

    /// Create from raw mask
    pub const fn from_mask(mask: u64) -> Self {
        Self { mask }
    }

    /// Set containing CPUs `0..count`
    pub fn first_n(count: usize) -> Self {
        if count >= MAX_CPUS {
            Self::all()
        } else {
            Self {
                mask: (1u64 << count) - 1,
            }
        }
    }

    /// Raw bitmap
    pub const fn mask(&self) -> u64 {
        self.mask
    }

    /// Check if CPU is in set
    pub fn contains(&self, cpu: CpuId) -> bool {
        (cpu as usize) < MAX_CPUS && (self.mask & (1u64 << cpu)) != 0
    }

    /// Add CPU to set
    pub fn add(&mut self, cpu: CpuId) {
        self.mask |= 1u64 << cpu;
    }

    /// Remove CPU from set
    pub fn remove(&mut self, cpu: CpuId) {
        self.mask &= !(1u64 << cpu);
    }

    pub fn is_empty(&self) -> bool {
        self.mask == 0
    }

    pub fn count(&self) -> u32 {
        self.mask.count_ones()
    }

    /// Lowest CPU in the set
    pub fn first(&self) -> Option<CpuId> {
        if self.mask == 0 {
            None
        } else {
            Some(self.mask.trailing_zeros())
        }
    }

    pub fn intersection(&self, other: CpuSet) -> CpuSet {
        CpuSet {
            mask: self.mask & other.mask,
        }
    }

    /// Iterate over the CPUs in the set, lowest first
    pub fn iter(&self) -> impl Iterator<Item = CpuId> {
        let mut rest = self.mask;
        core::iter::from_fn(move || {
            if rest == 0 {
                return None;
            }
            let cpu = rest.trailing_zeros();
            rest &= rest - 1;
            Some(cpu)
        })
    }
}

impl Default for CpuSet {
    fn default() -> Self {
        Self::all()
    }
}

bitflags! {
    /// Per-entity scheduler flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EntityFlags: u32 {
        /// Per-task gaming opt-in
        const GAMING = 1 << 0;
        /// Quantum ran out (or RT deadline/budget exhausted) while running
        const QUANTUM_EXPIRED = 1 << 1;
        /// Must move to another CPU at the next preemption point
        const MIGRATE_PENDING = 1 << 2;
        /// Blocked on IO; the blocked interval counts as IO wait
        const IO_WAIT = 1 << 3;
        /// Never picked by the load balancer
        const MIGRATION_DISABLED = 1 << 4;
        /// Current RT deadline already counted as missed
        const DEADLINE_MISSED = 1 << 5;
    }
}

/// Real-time parameters supplied by callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtParams {
    /// Replenishment period
    pub period_ns: u64,
    /// Runtime budget per period
    pub runtime_ns: u64,
    /// Relative deadline within each period (defaults to the period)
    pub deadline_ns: Option<u64>,
}

impl RtParams {
    pub const fn new(runtime_ns: u64, period_ns: u64) -> Self {
        Self {
            period_ns,
            runtime_ns,
            deadline_ns: None,
        }
    }

    pub const fn with_deadline(mut self, relative_deadline_ns: u64) -> Self {
        self.deadline_ns = Some(relative_deadline_ns);
        self
    }

    /// Reject parameters no period could ever satisfy.
    pub fn validate(&self) -> SchedResult<()> {
        if self.period_ns == 0 {
            return Err(SchedError::InvalidArgument {
                name: "rt.period_ns",
                reason: "period must be positive",
            });
        }
        if self.runtime_ns == 0 || self.runtime_ns > self.period_ns {
            return Err(SchedError::InvalidArgument {
                name: "rt.runtime_ns",
                reason: "runtime must be positive and fit in the period",
            });
        }
        if let Some(deadline) = self.deadline_ns {
            if deadline < self.runtime_ns || deadline > self.period_ns {
                return Err(SchedError::InvalidArgument {
                    name: "rt.deadline_ns",
                    reason: "deadline must lie between runtime and period",
                });
            }
        }
        Ok(())
    }
}

/// Real-time state of an entity (meaningful only for `RealTime`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtState {
    pub period_ns: u64,
    pub runtime_ns: u64,
    relative_deadline_ns: u64,
    /// Absolute deadline of the current period
    pub deadline_ns: u64,
    /// Start of the current period
    pub period_start_ns: u64,
    /// Runtime consumed in the current period
    pub consumed_ns: u64,
}

impl RtState {
    fn new(params: RtParams, now: u64) -> Self {
        let relative = params.deadline_ns.unwrap_or(params.period_ns);
        Self {
            period_ns: params.period_ns,
            runtime_ns: params.runtime_ns,
            relative_deadline_ns: relative,
            deadline_ns: now.saturating_add(relative),
            period_start_ns: now,
            consumed_ns: 0,
        }
    }

    /// Whether the period containing `now` is later than the tracked one.
    #[inline]
    pub fn period_elapsed(&self, now: u64) -> bool {
        elapsed(self.period_start_ns, now) >= self.period_ns
    }

    /// Budget exhausted in the tracked period.
    #[inline]
    pub fn budget_exhausted(&self) -> bool {
        self.consumed_ns >= self.runtime_ns
    }

    /// Could run at `now`: budget left, or a fresh period has begun.
    #[inline]
    pub fn eligible(&self, now: u64) -> bool {
        !self.budget_exhausted() || self.period_elapsed(now)
    }

    /// Roll the period forward to the one containing `now`. Returns true if
    /// a rollover happened.
    fn replenish(&mut self, now: u64) -> bool {
        if !self.period_elapsed(now) {
            return false;
        }
        let periods = elapsed(self.period_start_ns, now) / self.period_ns;
        let advance = periods.saturating_mul(self.period_ns);
        self.period_start_ns = self.period_start_ns.saturating_add(advance);
        self.deadline_ns = self.period_start_ns.saturating_add(self.relative_deadline_ns);
        self.consumed_ns = 0;
        true
    }
}

/// Attributes used when admitting a task or changing its class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedAttrs {
    pub class: SchedClass,
    /// Static nice value (`NICE_MIN..=NICE_MAX`)
    pub nice: i8,
    /// Initial MLFQ level
    pub level: u8,
    pub affinity: CpuSet,
    pub preferred_cpu: Option<CpuId>,
    /// Per-task gaming opt-in
    pub gaming: bool,
    /// Required when `class == RealTime`
    pub rt: Option<RtParams>,
}

impl Default for SchedAttrs {
    fn default() -> Self {
        Self {
            class: SchedClass::Normal,
            nice: 0,
            level: super::config::DEFAULT_LEVEL,
            affinity: CpuSet::all(),
            preferred_cpu: None,
            gaming: false,
            rt: None,
        }
    }
}

impl SchedAttrs {
    pub fn with_class(mut self, class: SchedClass) -> Self {
        self.class = class;
        if class == SchedClass::Gaming {
            self.gaming = true;
        }
        self
    }

    pub fn with_level(mut self, level: u8) -> Self {
        self.level = level;
        self
    }

    pub fn with_nice(mut self, nice: i8) -> Self {
        self.nice = nice;
        self
    }

    pub fn with_affinity(mut self, affinity: CpuSet) -> Self {
        self.affinity = affinity;
        self
    }

    pub fn with_preferred_cpu(mut self, cpu: CpuId) -> Self {
        self.preferred_cpu = Some(cpu);
        self
    }

    pub fn real_time(params: RtParams) -> Self {
        Self {
            class: SchedClass::RealTime,
            level: 0,
            rt: Some(params),
            ..Self::default()
        }
    }

    /// Validate against the set of CPUs that actually exist.
    pub fn validate(&self, online: CpuSet) -> SchedResult<()> {
        if self.level > MLFQ_LOWEST {
            return Err(SchedError::InvalidArgument {
                name: "level",
                reason: "MLFQ level out of range",
            });
        }
        if !(NICE_MIN..=NICE_MAX).contains(&self.nice) {
            return Err(SchedError::InvalidArgument {
                name: "nice",
                reason: "nice value out of range",
            });
        }
        validate_affinity(self.affinity, online)?;
        if let Some(cpu) = self.preferred_cpu {
            if !self.affinity.contains(cpu) || !online.contains(cpu) {
                return Err(SchedError::InvalidArgument {
                    name: "preferred_cpu",
                    reason: "preferred CPU outside affinity",
                });
            }
        }
        match (self.class, self.rt) {
            (SchedClass::RealTime, Some(params)) => params.validate(),
            (SchedClass::RealTime, None) => Err(SchedError::InvalidArgument {
                name: "rt",
                reason: "real-time class needs period and runtime",
            }),
            _ => Ok(()),
        }
    }
}

/// An affinity mask must name at least one CPU that exists.
pub fn validate_affinity(mask: CpuSet, online: CpuSet) -> SchedResult<()> {
    if mask.intersection(online).is_empty() {
        return Err(SchedError::InvalidArgument {
            name: "affinity",
            reason: "mask excludes every online CPU",
        });
    }
    Ok(())
}

/// Where an entity currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    /// In none of the queues and not running
    Blocked,
    /// Listed in exactly one queue of one runqueue
    Queued,
    /// The `current` of exactly one runqueue
    Running,
}

/// Per-entity counters; every field only ever grows
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntityStats {
    pub total_runtime_ns: u64,
    pub total_wait_ns: u64,
    pub io_wait_ns: u64,
    pub voluntary_switches: u64,
    pub involuntary_switches: u64,
    pub migrations: u64,
    pub boosts: u64,
    pub demotions: u64,
    pub deadline_misses: u64,
}

/// Counter values at the start of the current behavior window
#[derive(Debug, Clone, Copy, Default)]
pub(super) struct WindowBase {
    pub start_ns: u64,
    pub runtime_ns: u64,
    pub wait_ns: u64,
    pub io_wait_ns: u64,
    pub voluntary: u64,
    pub involuntary: u64,
}

/// Scheduling entity
#[derive(Debug, Clone)]
pub struct SchedEntity {
    task: TaskId,
    class: SchedClass,
    level: u8,
    nice: i8,
    /// Dynamic priority: nice adjusted by behavior feedback
    prio: i8,
    quantum_remaining_ns: u64,
    pub(super) state: EntityState,
    pub(super) flags: EntityFlags,

    created_ns: u64,
    last_scheduled_ns: u64,
    /// Start of the current wait, `None` while running
    wait_start_ns: Option<u64>,
    io_wait_start_ns: Option<u64>,
    last_migration_ns: Option<u64>,
    pub(super) stats: EntityStats,

    affinity: CpuSet,
    preferred_cpu: Option<CpuId>,
    last_cpu: CpuId,

    behavior: Behavior,
    cpu_usage_pct: u8,
    io_wait_pct: u8,
    pub(super) cpu_bound_streak: u8,
    pub(super) window: WindowBase,
    /// Behavior feedback leaves the priority alone until this time
    boost_until_ns: Option<u64>,

    rt: Option<RtState>,

    /// Insertion order stamp for FIFO tie-breaks in the deadline queue
    pub(super) enqueue_seq: u64,
    pub(super) link: QueueLink,
}

impl SchedEntity {
    /// Create an entity in the blocked state. Attributes must already be
    /// validated.
    pub fn new(task: TaskId, attrs: &SchedAttrs, quantum_ns: u64, now: u64) -> Self {
        let mut flags = EntityFlags::empty();
        if attrs.gaming {
            flags |= EntityFlags::GAMING;
        }
        let rt = match (attrs.class, attrs.rt) {
            (SchedClass::RealTime, Some(params)) => Some(RtState::new(params, now)),
            _ => None,
        };
        let last_cpu = attrs
            .preferred_cpu
            .or_else(|| attrs.affinity.first())
            .unwrap_or(0);
        Self {
            task,
            class: attrs.class,
            level: attrs.level.min(MLFQ_LOWEST),
            nice: attrs.nice,
            prio: if attrs.gaming { NICE_MIN } else { attrs.nice },
            quantum_remaining_ns: quantum_ns,
            state: EntityState::Blocked,
            flags,
            created_ns: now,
            last_scheduled_ns: now,
            wait_start_ns: Some(now),
            io_wait_start_ns: None,
            last_migration_ns: None,
            stats: EntityStats::default(),
            affinity: attrs.affinity,
            preferred_cpu: attrs.preferred_cpu,
            last_cpu,
            behavior: Behavior::Unknown,
            cpu_usage_pct: 0,
            io_wait_pct: 0,
            cpu_bound_streak: 0,
            window: WindowBase {
                start_ns: now,
                ..WindowBase::default()
            },
            boost_until_ns: None,
            rt,
            enqueue_seq: 0,
            link: QueueLink::default(),
        }
    }

    // ----- queries -----

    pub fn task(&self) -> TaskId {
        self.task
    }

    pub fn class(&self) -> SchedClass {
        self.class
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    pub fn nice(&self) -> i8 {
        self.nice
    }

    pub fn priority(&self) -> i8 {
        self.prio
    }

    pub fn quantum_remaining(&self) -> u64 {
        self.quantum_remaining_ns
    }

    pub fn state(&self) -> EntityState {
        self.state
    }

    pub fn flags(&self) -> EntityFlags {
        self.flags
    }

    pub fn is_gaming(&self) -> bool {
        self.flags.contains(EntityFlags::GAMING)
    }

    pub fn created_at(&self) -> u64 {
        self.created_ns
    }

    pub fn last_scheduled(&self) -> u64 {
        self.last_scheduled_ns
    }

    pub fn wait_start(&self) -> Option<u64> {
        self.wait_start_ns
    }

    pub fn last_migration(&self) -> Option<u64> {
        self.last_migration_ns
    }

    pub fn stats(&self) -> &EntityStats {
        &self.stats
    }

    pub fn affinity(&self) -> CpuSet {
        self.affinity
    }

    pub fn preferred_cpu(&self) -> Option<CpuId> {
        self.preferred_cpu
    }

    pub fn last_cpu(&self) -> CpuId {
        self.last_cpu
    }

    pub fn can_run_on(&self, cpu: CpuId) -> bool {
        self.affinity.contains(cpu)
    }

    pub fn behavior(&self) -> Behavior {
        self.behavior
    }

    pub fn cpu_usage_pct(&self) -> u8 {
        self.cpu_usage_pct
    }

    pub fn io_wait_pct(&self) -> u8 {
        self.io_wait_pct
    }

    pub fn rt(&self) -> Option<&RtState> {
        self.rt.as_ref()
    }

    /// Absolute deadline (real-time entities only).
    pub fn deadline(&self) -> Option<u64> {
        self.rt.map(|rt| rt.deadline_ns)
    }

    pub fn quantum_expired(&self) -> bool {
        self.flags.contains(EntityFlags::QUANTUM_EXPIRED)
    }

    /// Class the picker and arbiter should use. A gaming-class entity only
    /// gets gaming treatment while gaming mode is on and it has opted in;
    /// otherwise it competes as an interactive task.
    pub fn effective_class(&self, gaming_enabled: bool) -> SchedClass {
        match self.class {
            SchedClass::Gaming if gaming_enabled && self.is_gaming() => SchedClass::Gaming,
            SchedClass::Gaming => SchedClass::Interactive,
            class => class,
        }
    }

    // ----- mutators (runqueue lock held) -----

    pub fn set_level(&mut self, level: u8) {
        self.level = level.min(MLFQ_LOWEST);
    }

    /// Refill the quantum for the current level.
    pub fn reset_quantum(&mut self, quantum_ns: u64) {
        self.quantum_remaining_ns = quantum_ns;
        self.flags.remove(EntityFlags::QUANTUM_EXPIRED);
    }

    /// Add CPU time to the runtime counters.
    pub fn charge_runtime(&mut self, ns: u64) {
        self.stats.total_runtime_ns = self.stats.total_runtime_ns.saturating_add(ns);
        if let Some(rt) = self.rt.as_mut() {
            rt.consumed_ns = rt.consumed_ns.saturating_add(ns);
        }
    }

    /// Take `ns` off the remaining quantum, saturating at zero. Returns true
    /// once the quantum is used up. `tick_charge(0)` changes nothing.
    pub fn tick_charge(&mut self, ns: u64) -> bool {
        if ns == 0 {
            return self.quantum_remaining_ns == 0;
        }
        self.quantum_remaining_ns = self.quantum_remaining_ns.saturating_sub(ns);
        self.quantum_remaining_ns == 0
    }

    pub fn mark_expired(&mut self) {
        self.flags.insert(EntityFlags::QUANTUM_EXPIRED);
    }

    pub fn set_last_scheduled(&mut self, now: u64) {
        self.last_scheduled_ns = now;
    }

    pub fn set_last_cpu(&mut self, cpu: CpuId) {
        self.last_cpu = cpu;
    }

    /// Close any open wait interval into the totals and start a new one.
    pub fn set_wait_start(&mut self, now: u64) {
        self.clear_wait(now);
        self.wait_start_ns = Some(now);
    }

    /// Close the open wait interval (if any) into the totals.
    pub fn clear_wait(&mut self, now: u64) {
        if let Some(start) = self.wait_start_ns.take() {
            let waited = elapsed(start, now);
            self.stats.total_wait_ns = self.stats.total_wait_ns.saturating_add(waited);
        }
        if let Some(start) = self.io_wait_start_ns.take() {
            let waited = elapsed(start, now);
            self.stats.io_wait_ns = self.stats.io_wait_ns.saturating_add(waited);
        }
    }

    /// Begin a blocked interval; IO blocks also count as IO wait.
    pub fn begin_block(&mut self, now: u64, io: bool) {
        self.set_wait_start(now);
        if io {
            self.io_wait_start_ns = Some(now);
            self.flags.insert(EntityFlags::IO_WAIT);
        } else {
            self.flags.remove(EntityFlags::IO_WAIT);
        }
    }

    pub fn record_voluntary(&mut self) {
        self.stats.voluntary_switches += 1;
    }

    pub fn record_involuntary(&mut self) {
        self.stats.involuntary_switches += 1;
    }

    pub fn record_boost(&mut self) {
        self.stats.boosts += 1;
    }

    pub fn record_demotion(&mut self) {
        self.stats.demotions += 1;
    }

    pub fn record_migration(&mut self, from: CpuId, to: CpuId, now: u64) {
        log::trace!("{} migrated cpu{} -> cpu{}", self.task, from, to);
        self.stats.migrations += 1;
        self.last_migration_ns = Some(now);
        self.last_cpu = to;
    }

    /// Count a missed deadline once per deadline. Returns true if this call
    /// recorded a new miss.
    pub fn record_deadline_miss(&mut self) -> bool {
        if self.flags.contains(EntityFlags::DEADLINE_MISSED) {
            return false;
        }
        self.flags.insert(EntityFlags::DEADLINE_MISSED);
        self.stats.deadline_misses += 1;
        true
    }

    /// Start a new RT period if the tracked one is over.
    pub fn rt_replenish(&mut self, now: u64) -> bool {
        let rolled = self.rt.as_mut().is_some_and(|rt| rt.replenish(now));
        if rolled {
            self.flags.remove(EntityFlags::DEADLINE_MISSED);
        }
        rolled
    }

    /// Eligible to be picked at `now` (RT budget check; always true for
    /// other classes).
    pub fn rt_eligible(&self, now: u64) -> bool {
        self.rt.map_or(true, |rt| rt.eligible(now))
    }

    pub fn set_affinity(&mut self, mask: CpuSet) {
        self.affinity = mask;
        if let Some(cpu) = self.preferred_cpu {
            if !mask.contains(cpu) {
                self.preferred_cpu = None;
            }
        }
    }

    pub fn set_gaming(&mut self, gaming: bool) {
        self.flags.set(EntityFlags::GAMING, gaming);
    }

    pub fn set_migration_disabled(&mut self, disabled: bool) {
        self.flags.set(EntityFlags::MIGRATION_DISABLED, disabled);
    }

    /// Apply a class change. Attributes must already be validated.
    pub fn set_class(&mut self, attrs: &SchedAttrs, quantum_ns: u64, now: u64) {
        self.class = attrs.class;
        self.nice = attrs.nice;
        self.prio = attrs.nice;
        self.set_level(attrs.level);
        self.set_gaming(attrs.gaming);
        if attrs.gaming {
            self.prio = NICE_MIN;
        }
        self.rt = match (attrs.class, attrs.rt) {
            (SchedClass::RealTime, Some(params)) => Some(RtState::new(params, now)),
            _ => None,
        };
        self.flags.remove(EntityFlags::DEADLINE_MISSED);
        self.reset_quantum(quantum_ns);
    }

    /// Apply a temporary priority boost lasting until `until_ns`.
    pub fn apply_boost(&mut self, prio: i8, until_ns: u64) {
        self.set_prio(prio);
        self.boost_until_ns = Some(until_ns);
        self.record_boost();
    }

    pub fn boost_active(&self, now: u64) -> bool {
        self.boost_until_ns.is_some_and(|until| now < until)
    }

    pub(super) fn set_class_only(&mut self, class: SchedClass) {
        self.class = class;
    }

    pub(super) fn set_prio(&mut self, prio: i8) {
        self.prio = prio.clamp(NICE_MIN, NICE_MAX);
    }

    pub(super) fn set_behavior(&mut self, behavior: Behavior) {
        self.behavior = behavior;
    }

    pub(super) fn set_usage(&mut self, cpu_usage_pct: u8, io_wait_pct: u8) {
        self.cpu_usage_pct = cpu_usage_pct.min(100);
        self.io_wait_pct = io_wait_pct.min(100);
    }

    /// Read-only snapshot for observers.
    pub fn info(&self) -> EntityInfo {
        EntityInfo {
            task: self.task,
            class: self.class,
            level: self.level,
            nice: self.nice,
            priority: self.prio,
            quantum_remaining_ns: self.quantum_remaining_ns,
            state: self.state,
            behavior: self.behavior,
            cpu_usage_pct: self.cpu_usage_pct,
            io_wait_pct: self.io_wait_pct,
            gaming: self.is_gaming(),
            affinity: self.affinity,
            preferred_cpu: self.preferred_cpu,
            last_cpu: self.last_cpu,
            wait_start_ns: self.wait_start_ns,
            created_ns: self.created_ns,
            deadline_ns: self.deadline(),
            stats: self.stats,
        }
    }
}

/// Copy of an entity's observable state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityInfo {
    pub task: TaskId,
    pub class: SchedClass,
    pub level: u8,
    pub nice: i8,
    pub priority: i8,
    pub quantum_remaining_ns: u64,
    pub state: EntityState,
    pub behavior: Behavior,
    pub cpu_usage_pct: u8,
    pub io_wait_pct: u8,
    pub gaming: bool,
    pub affinity: CpuSet,
    pub preferred_cpu: Option<CpuId>,
    pub last_cpu: CpuId,
    pub wait_start_ns: Option<u64>,
    pub created_ns: u64,
    pub deadline_ns: Option<u64>,
    pub stats: EntityStats,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::clock::NS_PER_MS;

    fn entity() -> SchedEntity {
        SchedEntity::new(TaskId(1), &SchedAttrs::default(), 4 * NS_PER_MS, 0)
    }

    #[test]
    fn test_class_ordering() {
        assert!(SchedClass::Gaming < SchedClass::RealTime);
        assert!(SchedClass::RealTime < SchedClass::Interactive);
        assert!(SchedClass::Normal < SchedClass::Background);
        assert!(!SchedClass::RealTime.uses_quantum());
        assert!(SchedClass::Background.uses_quantum());
    }

    #[test]
    fn test_cpuset() {
        let mut set = CpuSet::empty();
        assert!(set.is_empty());
        set.add(3);
        set.add(1);
        assert!(set.contains(1));
        assert!(!set.contains(2));
        assert!(!set.contains(200));
        assert_eq!(set.first(), Some(1));
        assert_eq!(set.count(), 2);
        let cpus: std::vec::Vec<CpuId> = set.iter().collect();
        assert_eq!(cpus, [1, 3]);
        set.remove(1);
        assert_eq!(set.first(), Some(3));
        assert_eq!(CpuSet::first_n(2).mask(), 0b11);
        assert_eq!(CpuSet::first_n(64), CpuSet::all());
    }

    #[test]
    fn test_tick_charge_saturates() {
        let mut e = entity();
        assert!(!e.tick_charge(NS_PER_MS));
        assert_eq!(e.quantum_remaining(), 3 * NS_PER_MS);
        assert!(e.tick_charge(10 * NS_PER_MS));
        assert_eq!(e.quantum_remaining(), 0);
        assert!(e.tick_charge(NS_PER_MS));
        assert_eq!(e.quantum_remaining(), 0);
    }

    #[test]
    fn test_tick_charge_zero_is_noop() {
        let mut e = entity();
        let before = *e.stats();
        let quantum = e.quantum_remaining();
        assert!(!e.tick_charge(0));
        assert_eq!(*e.stats(), before);
        assert_eq!(e.quantum_remaining(), quantum);
    }

    #[test]
    fn test_wait_accounting() {
        let mut e = entity();
        assert_eq!(e.wait_start(), Some(0));
        e.clear_wait(5);
        assert_eq!(e.stats().total_wait_ns, 5);
        assert_eq!(e.wait_start(), None);
        e.set_wait_start(10);
        e.set_wait_start(12);
        assert_eq!(e.stats().total_wait_ns, 7);
        e.begin_block(20, true);
        e.clear_wait(30);
        assert_eq!(e.stats().total_wait_ns, 25);
        assert_eq!(e.stats().io_wait_ns, 10);
    }

    #[test]
    fn test_rt_validation() {
        assert!(RtParams::new(10, 100).validate().is_ok());
        assert!(RtParams::new(0, 100).validate().is_err());
        assert!(RtParams::new(10, 0).validate().is_err());
        assert!(RtParams::new(200, 100).validate().is_err());
        assert!(RtParams::new(10, 100).with_deadline(5).validate().is_err());
        assert!(RtParams::new(10, 100).with_deadline(50).validate().is_ok());

        let online = CpuSet::first_n(2);
        assert!(SchedAttrs::default()
            .with_class(SchedClass::RealTime)
            .validate(online)
            .is_err());
        assert!(SchedAttrs::real_time(RtParams::new(10, 100))
            .validate(online)
            .is_ok());
    }

    #[test]
    fn test_attr_validation() {
        let online = CpuSet::first_n(2);
        assert!(SchedAttrs::default().validate(online).is_ok());
        assert!(SchedAttrs::default().with_level(5).validate(online).is_err());
        assert!(SchedAttrs::default().with_nice(25).validate(online).is_err());
        assert!(SchedAttrs::default()
            .with_affinity(CpuSet::single(5))
            .validate(online)
            .is_err());
        assert!(SchedAttrs::default()
            .with_affinity(CpuSet::single(0))
            .with_preferred_cpu(1)
            .validate(online)
            .is_err());
    }

    #[test]
    fn test_rt_budget_and_replenish() {
        let attrs = SchedAttrs::real_time(RtParams::new(3, 10));
        let mut e = SchedEntity::new(TaskId(2), &attrs, NS_PER_MS, 100);
        assert_eq!(e.deadline(), Some(110));
        e.charge_runtime(3);
        assert!(!e.rt_eligible(105));
        assert!(e.rt_eligible(110));
        assert!(e.record_deadline_miss());
        assert!(!e.record_deadline_miss());
        assert!(e.rt_replenish(125));
        assert_eq!(e.deadline(), Some(130));
        assert_eq!(e.rt().map(|rt| rt.consumed_ns), Some(0));
        assert!(e.record_deadline_miss());
        assert_eq!(e.stats().deadline_misses, 2);
    }

    #[test]
    fn test_effective_class() {
        let attrs = SchedAttrs::default().with_class(SchedClass::Gaming);
        let mut e = SchedEntity::new(TaskId(3), &attrs, NS_PER_MS, 0);
        assert_eq!(e.priority(), NICE_MIN);
        assert_eq!(e.effective_class(true), SchedClass::Gaming);
        assert_eq!(e.effective_class(false), SchedClass::Interactive);
        e.set_gaming(false);
        assert_eq!(e.effective_class(true), SchedClass::Interactive);
    }

    #[test]
    fn test_record_migration() {
        let mut e = entity();
        e.record_migration(0, 1, 42);
        assert_eq!(e.last_cpu(), 1);
        assert_eq!(e.last_migration(), Some(42));
        assert_eq!(e.stats().migrations, 1);
    }
}
