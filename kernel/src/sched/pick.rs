//! Picker: choose the next entity to run on one CPU
//!
//! The previous entity is put back first, so the runnable set is complete
//! when the choice is made:
//!
//! - expired MLFQ entities are demoted one level with a fresh quantum,
//! - preempted entities go back to the tail of their level with whatever
//!   quantum they had left,
//! - entities flagged for migration whose affinity excludes this CPU are
//!   handed back to the caller to be placed elsewhere.
//!
//! Then the first eligible entity in gaming → real-time → L0..L4 order is
//! removed and made current, or the idle sentinel runs.

use super::{
    aging::demote,
    clock::elapsed,
    config::SchedConfig,
    metrics::SchedulerMetrics,
    queue::{Rejected, SlotId},
    rt_bandwidth::RtBandwidth,
    runqueue::RunQueue,
    task::{EntityFlags, EntityState, SchedEntity, TaskId},
    tick::ExecMode,
};
use crate::error::{SchedError, SchedResult};

/// What the dispatcher should switch to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Nothing runnable: run the idle sentinel
    Idle,
    Task(TaskId),
}

impl Dispatch {
    pub fn task(&self) -> Option<TaskId> {
        match self {
            Dispatch::Idle => None,
            Dispatch::Task(task) => Some(*task),
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, Dispatch::Idle)
    }
}

/// Global policy inputs for one scheduling decision
pub(super) struct Policy<'a> {
    pub config: &'a SchedConfig,
    pub rt: &'a RtBandwidth,
    pub metrics: &'a SchedulerMetrics,
    pub gaming_enabled: bool,
    pub gaming_floor: Option<u32>,
    pub now: u64,
}

/// Result of a pick
#[derive(Debug)]
pub(super) struct PickOutcome {
    pub dispatch: Dispatch,
    /// Previous entity that must move to a CPU its affinity allows
    pub evicted: Option<SchedEntity>,
}

impl RunQueue {
    /// Put the running entity back. Returns it detached if it has to move
    /// to another CPU.
    fn put_prev(&mut self, p: &Policy) -> SchedResult<Option<SchedEntity>> {
        let Some(slot) = self.current() else {
            return Ok(None);
        };
        self.charge_current(p, ExecMode::User)?;
        self.set_current(None);

        let cpu = self.cpu();
        let entity = self.entity_mut(slot)?;
        if entity.flags.contains(EntityFlags::MIGRATE_PENDING) {
            entity.flags.remove(EntityFlags::MIGRATE_PENDING);
            if !entity.can_run_on(cpu) {
                return self.detach(slot).map(Some);
            }
        }

        if entity.quantum_expired() {
            if entity.effective_class(p.gaming_enabled).uses_quantum() {
                if demote(entity, p.config) {
                    p.metrics.record_demotion();
                }
            } else {
                entity.flags.remove(EntityFlags::QUANTUM_EXPIRED);
            }
        }
        self.enqueue_slot(slot, p.now, p.gaming_enabled)?;
        Ok(None)
    }

    /// Make a dequeued entity current.
    fn start_running(&mut self, slot: SlotId, p: &Policy) -> SchedResult<TaskId> {
        let cpu = self.cpu();
        let entity = self.entity_mut(slot)?;
        if entity.rt_replenish(p.now) {
            log::trace!("{} starts a new RT period", entity.task());
        }
        entity.clear_wait(p.now);
        entity.set_last_scheduled(p.now);
        entity.set_last_cpu(cpu);
        entity.state = EntityState::Running;
        if entity.effective_class(p.gaming_enabled).uses_quantum() {
            if entity.quantum_remaining() == 0 {
                entity.reset_quantum(p.config.quantum(entity.level()));
            }
            p.metrics.record_quantum(entity.quantum_remaining());
        }
        let task = entity.task();
        self.set_current(Some(slot));
        Ok(task)
    }

    /// Choose and install the next entity for this CPU.
    pub(super) fn pick_next(&mut self, p: &Policy) -> SchedResult<PickOutcome> {
        p.metrics.record_schedule_call();
        let prev = self.current();
        let mut evicted = self.put_prev(p)?;

        let rt_allowed = !p.rt.is_throttled(p.now, p.metrics);
        self.refresh_rt(p.now, p.metrics)?;
        let next = self.pop_highest(p.now, p.gaming_enabled, rt_allowed)?;
        self.clear_need_resched();

        let dispatch = match next {
            Some(slot) => {
                if let Some(since) = self.cadence.idle_since_ns.take() {
                    self.stats.idle_ns += elapsed(since, p.now);
                }
                Dispatch::Task(self.start_running(slot, p)?)
            }
            None => {
                if self.cadence.idle_since_ns.is_none() {
                    self.cadence.idle_since_ns = Some(p.now);
                }
                self.stats.idle_picks += 1;
                p.metrics.record_idle_scheduled();
                Dispatch::Idle
            }
        };

        let voluntary = core::mem::take(&mut self.switch_voluntary);
        if self.last_dispatched != dispatch.task() {
            let outgoing_idle = self.last_dispatched.is_none();
            self.stats.context_switches += 1;
            p.metrics
                .record_context_switch(voluntary || outgoing_idle);
            if !voluntary {
                if let Some(entity) = evicted.as_mut() {
                    entity.record_involuntary();
                } else if let Some(slot) = prev {
                    self.entity_mut(slot)?.record_involuntary();
                }
            }
        }
        self.last_dispatched = dispatch.task();

        Ok(PickOutcome { dispatch, evicted })
    }

    /// Note that the outgoing task is giving up the CPU itself.
    pub(super) fn mark_voluntary_switch(&mut self) {
        self.switch_voluntary = true;
    }

    /// Install an entity that is already executing on this CPU, without a
    /// context switch. Used when the scheduler takes over at boot. A
    /// refused entity is handed back.
    pub(super) fn adopt_running(&mut self, entity: SchedEntity, p: &Policy) -> Result<(), Rejected> {
        if self.current().is_some() {
            return Err(Rejected {
                error: SchedError::InvalidArgument {
                    name: "cpu",
                    reason: "CPU already has a running task",
                },
                entity,
            });
        }
        let slot = self.attach(entity)?;
        if let Some(since) = self.cadence.idle_since_ns.take() {
            self.stats.idle_ns += elapsed(since, p.now);
        }
        // Attached: a failure past this point leaves it owned by this queue
        match self.start_running(slot, p) {
            Ok(task) => self.last_dispatched = Some(task),
            Err(err) => log::error!("cpu{}: could not adopt running task: {}", self.cpu(), err),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::{
        clock::NS_PER_MS,
        task::{CpuSet, SchedAttrs, SchedClass},
    };

    struct Fixture {
        config: SchedConfig,
        rt: RtBandwidth,
        metrics: SchedulerMetrics,
    }

    impl Fixture {
        fn new() -> Self {
            let config = SchedConfig::default();
            let rt = RtBandwidth::new(&config, 0);
            Self {
                config,
                rt,
                metrics: SchedulerMetrics::new(),
            }
        }

        fn policy(&self, now: u64) -> Policy<'_> {
            Policy {
                config: &self.config,
                rt: &self.rt,
                metrics: &self.metrics,
                gaming_enabled: true,
                gaming_floor: None,
                now,
            }
        }
    }

    fn add(rq: &mut RunQueue, id: u64, attrs: SchedAttrs) {
        let quantum = SchedConfig::default().quantum(attrs.level);
        rq.enqueue(SchedEntity::new(TaskId(id), &attrs, quantum, 0), 0, true)
            .unwrap();
    }

    #[test]
    fn test_idle_when_empty() {
        let fx = Fixture::new();
        let mut rq = RunQueue::new(0, 0, &fx.config, 0);
        let out = rq.pick_next(&fx.policy(0)).unwrap();
        assert_eq!(out.dispatch, Dispatch::Idle);
        assert_eq!(rq.stats.idle_picks, 1);
        assert_eq!(rq.stats.context_switches, 0);
    }

    #[test]
    fn test_preempted_entity_keeps_quantum() {
        let fx = Fixture::new();
        let mut rq = RunQueue::new(0, 0, &fx.config, 0);
        add(&mut rq, 1, SchedAttrs::default());
        assert_eq!(
            rq.pick_next(&fx.policy(0)).unwrap().dispatch,
            Dispatch::Task(TaskId(1))
        );

        add(&mut rq, 2, SchedAttrs::default().with_class(SchedClass::Gaming));
        let out = rq.pick_next(&fx.policy(NS_PER_MS)).unwrap();
        assert_eq!(out.dispatch, Dispatch::Task(TaskId(2)));

        let slot = rq.lookup(TaskId(1)).unwrap();
        let prev = rq.entity(slot).unwrap();
        assert_eq!(prev.level(), 2);
        assert_eq!(prev.quantum_remaining(), 3 * NS_PER_MS);
        assert_eq!(prev.stats().involuntary_switches, 1);
        assert_eq!(prev.stats().total_runtime_ns, NS_PER_MS);
        assert!(rq.verify().is_ok());
    }

    #[test]
    fn test_expired_entity_is_demoted() {
        let fx = Fixture::new();
        let mut rq = RunQueue::new(0, 0, &fx.config, 0);
        add(&mut rq, 1, SchedAttrs::default());
        rq.pick_next(&fx.policy(0)).unwrap();
        let out = rq.pick_next(&fx.policy(4 * NS_PER_MS)).unwrap();
        // Alone on the CPU: demoted, then picked again
        assert_eq!(out.dispatch, Dispatch::Task(TaskId(1)));
        let slot = rq.current().unwrap();
        let entity = rq.entity(slot).unwrap();
        assert_eq!(entity.level(), 3);
        assert_eq!(entity.quantum_remaining(), 8 * NS_PER_MS);
        assert_eq!(rq.stats.context_switches, 1);
    }

    #[test]
    fn test_migrate_pending_evicts() {
        let fx = Fixture::new();
        let mut rq = RunQueue::new(0, 0, &fx.config, 0);
        add(&mut rq, 1, SchedAttrs::default());
        rq.pick_next(&fx.policy(0)).unwrap();

        let slot = rq.current().unwrap();
        let entity = rq.entity_mut(slot).unwrap();
        entity.set_affinity(CpuSet::single(1));
        entity.flags.insert(EntityFlags::MIGRATE_PENDING);

        let out = rq.pick_next(&fx.policy(NS_PER_MS)).unwrap();
        assert_eq!(out.dispatch, Dispatch::Idle);
        let evicted = out.evicted.unwrap();
        assert_eq!(evicted.task(), TaskId(1));
        assert!(!evicted.flags().contains(EntityFlags::MIGRATE_PENDING));
        assert!(rq.lookup(TaskId(1)).is_none());
        assert_eq!(rq.load(), 0);
    }

    #[test]
    fn test_voluntary_switch_accounting() {
        let fx = Fixture::new();
        let mut rq = RunQueue::new(0, 0, &fx.config, 0);
        add(&mut rq, 1, SchedAttrs::default());
        add(&mut rq, 2, SchedAttrs::default());
        rq.pick_next(&fx.policy(0)).unwrap();
        rq.mark_voluntary_switch();
        rq.pick_next(&fx.policy(NS_PER_MS)).unwrap();
        let snap = fx.metrics.snapshot([0; SchedClass::COUNT], NS_PER_MS);
        // idle -> 1 counts as voluntary, 1 -> 2 was a yield
        assert_eq!(snap.context_switches, 2);
        assert_eq!(snap.voluntary_switches, 2);
        let slot = rq.lookup(TaskId(1)).unwrap();
        assert_eq!(rq.entity(slot).unwrap().stats().involuntary_switches, 0);
    }

    #[test]
    fn test_adopt_running() {
        let fx = Fixture::new();
        let mut rq = RunQueue::new(0, 0, &fx.config, 0);
        let boot = SchedEntity::new(TaskId(1), &SchedAttrs::default(), 4 * NS_PER_MS, 0);
        rq.adopt_running(boot, &fx.policy(NS_PER_MS)).unwrap();
        assert_eq!(rq.current_task(), Some(TaskId(1)));
        assert_eq!(rq.load(), 1);
        assert_eq!(rq.stats.idle_ns, NS_PER_MS);

        let other = SchedEntity::new(TaskId(2), &SchedAttrs::default(), 4 * NS_PER_MS, 0);
        let rejected = rq.adopt_running(other, &fx.policy(NS_PER_MS)).unwrap_err();
        assert_eq!(rejected.entity.task(), TaskId(2));
        assert!(rejected.error.is_invalid_argument());

        // Staying on the boot task is not a context switch
        add(&mut rq, 3, SchedAttrs::default().with_level(3));
        let out = rq.pick_next(&fx.policy(2 * NS_PER_MS)).unwrap();
        assert_eq!(out.dispatch, Dispatch::Task(TaskId(1)));
        assert_eq!(rq.stats.context_switches, 0);
    }
}
