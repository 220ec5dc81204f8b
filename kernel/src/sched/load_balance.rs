//! Load balancing and task migration between CPUs
//!
//! One balance cycle compares the lock-free run lengths of every CPU and,
//! if the busiest and idlest differ by more than [`IMBALANCE_THRESHOLD`],
//! moves exactly one queued entity from the busiest CPU to an idlest CPU
//! its affinity allows. Candidates are scanned from the lowest-priority
//! band upward, newest first. The running entity is never moved.
//!
//! Cycles are serialized by the global migration mutex, which is only
//! ever taken with `try_lock` and never while a runqueue lock is held.
//! The two runqueue locks of a migration are taken in CPU-id order.

use spin::MutexGuard;

use super::{
    clock::{elapsed, Clock},
    preempt::Candidate,
    queue::{Band, Rejected},
    runqueue::RunQueue,
    scheduler::{Residence, Scheduler},
    task::{CpuId, CpuSet, EntityFlags, SchedClass, SchedEntity, TaskId},
};
use crate::error::{SchedError, SchedResult};

/// Load difference at or below which the system counts as balanced.
pub const IMBALANCE_THRESHOLD: usize = 2;

/// One entity moved by the balancer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Migration {
    pub task: TaskId,
    pub from: CpuId,
    pub to: CpuId,
}

/// Whether the balancer may move this queued entity at `now`.
fn movable(entity: &SchedEntity, now: u64, migration_cost_ns: u64) -> bool {
    if entity.flags().contains(EntityFlags::MIGRATION_DISABLED) {
        return false;
    }
    if entity
        .last_migration()
        .is_some_and(|at| elapsed(at, now) < migration_cost_ns)
    {
        return false;
    }
    if entity.class() == SchedClass::RealTime
        && entity
            .deadline()
            .is_some_and(|deadline| deadline.saturating_sub(now) < migration_cost_ns)
    {
        return false;
    }
    true
}

impl<C: Clock> Scheduler<C> {
    /// Lock two distinct runqueues in CPU-id order. The guards come back in
    /// argument order.
    pub(super) fn lock_pair(
        &self,
        a: CpuId,
        b: CpuId,
    ) -> SchedResult<(MutexGuard<'_, RunQueue>, MutexGuard<'_, RunQueue>)> {
        if a == b {
            return Err(SchedError::InvalidArgument {
                name: "cpu",
                reason: "cannot lock a runqueue pair on one CPU",
            });
        }
        let (first, second) = (self.percpu(a)?, self.percpu(b)?);
        if a < b {
            let ga = first.rq.lock();
            let gb = second.rq.lock();
            Ok((ga, gb))
        } else {
            let gb = second.rq.lock();
            let ga = first.rq.lock();
            Ok((ga, gb))
        }
    }

    /// Run one balance cycle. Returns the migration performed, if any.
    ///
    /// Fails with `WouldDeadlock` if another cycle is already in progress;
    /// the tick handler treats that as "skip this cycle".
    pub fn balance(&self) -> SchedResult<Option<Migration>> {
        let Some(_guard) = self.migration.try_lock() else {
            log::warn!("load balance already in progress, skipping");
            return Err(SchedError::WouldDeadlock);
        };
        self.metrics.record_load_balance();

        let mut busiest: Option<(CpuId, usize)> = None;
        let mut min_load = usize::MAX;
        for cpu in self.online().iter() {
            let load = self.percpu(cpu)?.run_length();
            if busiest.map_or(true, |(_, max)| load > max) {
                busiest = Some((cpu, load));
            }
            min_load = min_load.min(load);
        }
        let Some((src, max_load)) = busiest else {
            return Ok(None);
        };
        if max_load - min_load <= IMBALANCE_THRESHOLD {
            return Ok(None);
        }
        let mut idlest = CpuSet::empty();
        for cpu in self.online().iter() {
            if self.percpu(cpu)?.run_length() == min_load {
                idlest.add(cpu);
            }
        }

        let now = self.now();
        let Some((task, dst)) = self.find_candidate(src, idlest, now)? else {
            log::trace!("cpu{}: nothing movable to rebalance", src);
            return Ok(None);
        };
        self.migrate(task, src, dst, now)
    }

    /// Scan the busiest runqueue for the first movable entity, lowest band
    /// first, and the destination it should go to.
    fn find_candidate(
        &self,
        src: CpuId,
        idlest: CpuSet,
        now: u64,
    ) -> SchedResult<Option<(TaskId, CpuId)>> {
        let cost = self.config().migration_cost_ns;
        let rq = self.percpu(src)?.rq.lock();
        for band in Band::ALL.into_iter().rev() {
            for slot in rq.band_slots_rev(band) {
                let entity = rq.entity(slot)?;
                if !movable(entity, now, cost) {
                    continue;
                }
                let allowed = entity.affinity().intersection(idlest);
                if allowed.is_empty() {
                    continue;
                }
                let home = entity.preferred_cpu().unwrap_or(src);
                if let Some(dst) = self.closest_cpu(allowed, home) {
                    return Ok(Some((entity.task(), dst)));
                }
            }
        }
        Ok(None)
    }

    /// Move a queued entity from `src` to `dst` under both runqueue locks.
    fn migrate(
        &self,
        task: TaskId,
        src: CpuId,
        dst: CpuId,
        now: u64,
    ) -> SchedResult<Option<Migration>> {
        let gaming = self.gaming_enabled();
        let (mut from, mut to) = self.lock_pair(src, dst)?;

        // The entity may have been picked or blocked since the scan
        let Some(slot) = from.lookup(task) else {
            return Ok(None);
        };
        if from.current() == Some(slot) {
            return Ok(None);
        }
        if to.spare_slots() == 0 {
            return Err(SchedError::OutOfCapacity {
                resource: "runqueue entity slots",
            });
        }

        let entity = from.detach(slot)?;
        let moved = match to.attach(entity) {
            Ok(moved) => moved,
            Err(Rejected { error, entity }) => {
                // Back where it came from; the directory still names `src`
                match from.attach(entity) {
                    Ok(back) => from.enqueue_slot(back, now, gaming)?,
                    Err(lost) => {
                        log::error!("{} could not return to cpu{}, left blocked", task, src);
                        self.park(lost);
                    }
                }
                self.percpu(src)?.publish(&from);
                return Err(error);
            }
        };
        self.tasks.write().insert(task, Residence::OnCpu(dst));
        to.entity_mut(moved)?.record_migration(src, dst, now);
        self.metrics.record_migration();

        let queued = to.enqueue_slot(moved, now, gaming);
        self.percpu(src)?.publish(&from);
        self.percpu(dst)?.publish(&to);
        queued?;
        let candidate = Candidate::of(to.entity(moved)?, gaming);
        to.arbitrate(&candidate, gaming)?;

        log::debug!("Load balance: {} cpu{} -> cpu{}", task, src, dst);
        Ok(Some(Migration {
            task,
            from: src,
            to: dst,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::{
        clock::{ManualClock, NS_PER_MS},
        config::SchedConfig,
        task::{RtParams, SchedAttrs},
    };

    fn sched(cpus: usize) -> Scheduler<ManualClock> {
        Scheduler::init(SchedConfig::with_cpus(cpus), ManualClock::new(0)).unwrap()
    }

    fn spawn(s: &Scheduler<ManualClock>, id: u64, cpu: CpuId, attrs: SchedAttrs) {
        s.admit(TaskId(id), attrs).unwrap();
        s.enqueue(TaskId(id), cpu).unwrap();
    }

    #[test]
    fn test_movable_rules() {
        let now = 10 * NS_PER_MS;
        let cost = SchedConfig::default().migration_cost_ns;
        let mut e = SchedEntity::new(TaskId(1), &SchedAttrs::default(), NS_PER_MS, 0);
        assert!(movable(&e, now, cost));
        e.record_migration(0, 1, now - 1);
        assert!(!movable(&e, now, cost));
        assert!(movable(&e, now + cost, cost));
        e.set_migration_disabled(true);
        assert!(!movable(&e, now + cost, cost));

        let rt = SchedAttrs::real_time(RtParams::new(NS_PER_MS, 10 * NS_PER_MS));
        let e = SchedEntity::new(TaskId(2), &rt, 0, 0);
        // Deadline at 10ms
        assert!(movable(&e, 0, cost));
        assert!(!movable(&e, 10 * NS_PER_MS - 1, cost));
    }

    #[test]
    fn test_balanced_system_is_left_alone() {
        let s = sched(2);
        for id in 0..3 {
            spawn(&s, id, 0, SchedAttrs::default());
        }
        spawn(&s, 10, 1, SchedAttrs::default());
        assert_eq!(s.balance().unwrap(), None);
        assert_eq!(s.load(0).unwrap(), 3);
    }

    #[test]
    fn test_moves_newest_lowest_band_entity() {
        let s = sched(2);
        spawn(&s, 1, 0, SchedAttrs::default().with_level(1));
        spawn(&s, 2, 0, SchedAttrs::default().with_level(4));
        spawn(&s, 3, 0, SchedAttrs::default().with_level(2));
        spawn(&s, 4, 0, SchedAttrs::default().with_level(4));

        let moved = s.balance().unwrap().unwrap();
        assert_eq!(
            moved,
            Migration {
                task: TaskId(4),
                from: 0,
                to: 1
            }
        );
        assert_eq!(s.load(0).unwrap(), 3);
        assert_eq!(s.load(1).unwrap(), 1);
        let info = s.task_info(TaskId(4)).unwrap();
        assert_eq!(info.last_cpu, 1);
        assert_eq!(info.stats.migrations, 1);
        assert!(s.need_resched(1).unwrap());
        assert!(s.verify(0).is_ok());
        assert!(s.verify(1).is_ok());
    }

    #[test]
    fn test_numa_preference_breaks_ties() {
        let config = SchedConfig::with_cpus(4).with_cpus_per_node(2);
        let s = Scheduler::init(config, ManualClock::new(0)).unwrap();
        for id in 0..3 {
            spawn(&s, id, 0, SchedAttrs::default());
        }
        spawn(&s, 3, 0, SchedAttrs::default().with_preferred_cpu(3));
        spawn(&s, 9, 3, SchedAttrs::default());
        // cpu1 (node 0) and cpu2 (node 1) tie at zero; task 3 prefers node 1
        let moved = s.balance().unwrap().unwrap();
        assert_eq!(moved.task, TaskId(3));
        assert_eq!(moved.to, 2);
    }

    #[test]
    fn test_reentry_is_refused() {
        let s = sched(2);
        let _held = s.migration.lock();
        assert_eq!(s.balance(), Err(SchedError::WouldDeadlock));
    }

    #[test]
    fn test_lock_pair_rejects_same_cpu() {
        let s = sched(2);
        assert!(s.lock_pair(1, 1).is_err());
        let (a, b) = s.lock_pair(1, 0).unwrap();
        assert_eq!(a.cpu(), 1);
        assert_eq!(b.cpu(), 0);
    }
}
