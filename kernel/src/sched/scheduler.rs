//! Scheduler facade
//!
//! [`Scheduler`] is the context the rest of the kernel talks to. It owns
//! one [`RunQueue`] per CPU, each behind its own spin lock with a
//! lock-free published run length, plus the global state shared by all
//! CPUs: RT bandwidth, gaming mode, statistics and the task directory.
//!
//! The directory maps every admitted task to its residence. A runnable
//! task's entity is owned by the runqueue of its CPU; a blocked task's
//! entity is held in the directory itself until it is enqueued again.
//!
//! Lock order: migration mutex, then runqueues in CPU-id order, then the
//! directory. Lookups read the directory, drop it, then lock the
//! runqueue it named; if the entity moved in between they look again.

use alloc::{collections::BTreeMap, vec::Vec};
use core::sync::atomic::{AtomicU32, Ordering};

use spin::{Mutex, RwLock};

use super::{
    clock::{elapsed, Clock},
    config::SchedConfig,
    gaming::{GamingConfig, GamingControl},
    metrics::{SchedSnapshot, SchedulerMetrics},
    numa::NumaTopology,
    pick::{Dispatch, Policy},
    preempt::Candidate,
    queue::{Rejected, SlotId},
    rt_bandwidth::RtBandwidth,
    runqueue::{RunQueue, RunQueueInfo},
    task::{
        validate_affinity, CpuId, CpuSet, EntityFlags, EntityInfo, SchedAttrs, SchedClass,
        SchedEntity, TaskId,
    },
    tick::ExecMode,
};
use crate::error::{SchedError, SchedResult};

/// One CPU's runqueue and its published load
pub(super) struct PerCpuRunQueue {
    pub rq: Mutex<RunQueue>,
    /// Load as of the last change, readable without the lock
    run_length: AtomicU32,
}

impl PerCpuRunQueue {
    fn new(rq: RunQueue) -> Self {
        Self {
            rq: Mutex::new(rq),
            run_length: AtomicU32::new(0),
        }
    }

    /// Publish the load of `rq`. Called with its lock held after every
    /// change.
    pub fn publish(&self, rq: &RunQueue) {
        self.run_length.store(rq.load() as u32, Ordering::Release);
    }

    /// Get the current load (lock-free).
    pub fn run_length(&self) -> usize {
        self.run_length.load(Ordering::Acquire) as usize
    }
}

/// Where a task's entity lives
#[derive(Debug)]
pub(super) enum Residence {
    /// Owned by this CPU's runqueue, queued or running
    OnCpu(CpuId),
    /// Not runnable
    Blocked(SchedEntity),
}

impl Residence {
    fn cpu(&self) -> Option<CpuId> {
        match self {
            Residence::OnCpu(cpu) => Some(*cpu),
            Residence::Blocked(_) => None,
        }
    }
}

/// An entity reached through [`Scheduler::with_entity`]
enum Place<'a> {
    OnCpu { rq: &'a mut RunQueue, slot: SlotId },
    Blocked(&'a mut SchedEntity),
}

/// Scheduler context
pub struct Scheduler<C: Clock> {
    clock: C,
    config: SchedConfig,
    online: CpuSet,
    topology: NumaTopology,
    cpus: Vec<PerCpuRunQueue>,
    pub(super) tasks: RwLock<BTreeMap<TaskId, Residence>>,
    /// Held for the duration of a balance cycle
    pub(super) migration: Mutex<()>,
    rt: RtBandwidth,
    gaming: GamingControl,
    pub(super) metrics: SchedulerMetrics,
    init_ns: u64,
}

impl<C: Clock> Scheduler<C> {
    /// Build the global and per-CPU state.
    pub fn init(config: SchedConfig, clock: C) -> SchedResult<Self> {
        config.validate()?;
        let now = clock.now_ns();
        let topology = NumaTopology::from_config(&config);
        let cpus = (0..config.cpu_count as CpuId)
            .map(|cpu| {
                let node = topology.cpu_to_node(cpu).unwrap_or(0);
                PerCpuRunQueue::new(RunQueue::new(cpu, node, &config, now))
            })
            .collect();

        log::info!(
            "Scheduler initialized: {} CPUs on {} NUMA nodes, {} entity slots per CPU",
            config.cpu_count,
            topology.node_count(),
            config.slots_per_cpu
        );

        Ok(Self {
            online: CpuSet::first_n(config.cpu_count),
            rt: RtBandwidth::new(&config, now),
            clock,
            topology,
            cpus,
            tasks: RwLock::new(BTreeMap::new()),
            migration: Mutex::new(()),
            gaming: GamingControl::new(),
            metrics: SchedulerMetrics::new(),
            init_ns: now,
            config,
        })
    }

    /// Adopt the task each CPU is already executing as that CPU's current
    /// entity. Tasks that were never admitted get default attributes.
    pub fn start(&self, running: &[(CpuId, TaskId)]) -> SchedResult<()> {
        for &(cpu, task) in running {
            self.ensure_admitted(task);
            let percpu = self.percpu(cpu)?;
            let now = self.now();
            let mut rq = percpu.rq.lock();
            if rq.current().is_some() {
                return Err(SchedError::InvalidArgument {
                    name: "cpu",
                    reason: "CPU already has a running task",
                });
            }
            Self::check_capacity(&rq)?;
            let Some(entity) = self.claim_blocked(task, cpu)? else {
                return Err(SchedError::InvalidArgument {
                    name: "task",
                    reason: "task is already runnable",
                });
            };
            if !entity.can_run_on(cpu) {
                self.tasks.write().insert(task, Residence::Blocked(entity));
                return Err(SchedError::InvalidArgument {
                    name: "cpu",
                    reason: "outside the task's affinity",
                });
            }
            if let Err(rejected) = rq.adopt_running(entity, &self.policy(now)) {
                return Err(self.park(rejected));
            }
            percpu.publish(&rq);
            log::info!("cpu{}: scheduler started with {}", cpu, task);
        }
        Ok(())
    }

    // ----- accessors -----

    pub fn config(&self) -> &SchedConfig {
        &self.config
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn online(&self) -> CpuSet {
        self.online
    }

    pub fn cpu_count(&self) -> usize {
        self.cpus.len()
    }

    pub fn topology(&self) -> &NumaTopology {
        &self.topology
    }

    pub fn rt_bandwidth(&self) -> &RtBandwidth {
        &self.rt
    }

    pub fn metrics(&self) -> &SchedulerMetrics {
        &self.metrics
    }

    pub(super) fn now(&self) -> u64 {
        self.clock.now_ns()
    }

    pub(super) fn percpu(&self, cpu: CpuId) -> SchedResult<&PerCpuRunQueue> {
        self.cpus
            .get(cpu as usize)
            .ok_or(SchedError::InvalidArgument {
                name: "cpu",
                reason: "no such CPU",
            })
    }

    pub(super) fn gaming_enabled(&self) -> bool {
        self.gaming.is_enabled()
    }

    fn policy(&self, now: u64) -> Policy<'_> {
        Policy {
            config: &self.config,
            rt: &self.rt,
            metrics: &self.metrics,
            gaming_enabled: self.gaming.is_enabled(),
            gaming_floor: self.gaming.frequency_floor(),
            now,
        }
    }

    // ----- timer and dispatcher entry points -----

    /// Timer tick on `cpu`, interrupting user code.
    pub fn on_tick(&self, cpu: CpuId) -> SchedResult<()> {
        self.on_tick_from(cpu, ExecMode::User)
    }

    /// Timer tick on `cpu`. The runqueue lock is dropped before a due load
    /// balance runs.
    pub fn on_tick_from(&self, cpu: CpuId, mode: ExecMode) -> SchedResult<()> {
        let percpu = self.percpu(cpu)?;
        let now = self.now();
        let outcome = {
            let mut rq = percpu.rq.lock();
            let outcome = rq.tick(&self.policy(now), mode)?;
            percpu.publish(&rq);
            outcome
        };

        if outcome.balance_due {
            match self.balance() {
                Ok(_) | Err(SchedError::WouldDeadlock) => {}
                Err(SchedError::OutOfCapacity { resource }) => {
                    log::warn!("cpu{}: load balance skipped, {} exhausted", cpu, resource);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Choose what `cpu` runs next.
    pub fn pick_next(&self, cpu: CpuId) -> SchedResult<Dispatch> {
        let percpu = self.percpu(cpu)?;
        let now = self.now();
        let outcome = {
            let mut rq = percpu.rq.lock();
            let outcome = rq.pick_next(&self.policy(now))?;
            percpu.publish(&rq);
            outcome
        };
        self.place_evicted(outcome.evicted, now);
        Ok(outcome.dispatch)
    }

    /// The current task of `cpu` gives up the CPU. Its quantum is refilled
    /// and it goes to the tail of its level before the picker runs.
    pub fn yield_now(&self, cpu: CpuId) -> SchedResult<Dispatch> {
        let percpu = self.percpu(cpu)?;
        let now = self.now();
        let policy = self.policy(now);
        let outcome = {
            let mut rq = percpu.rq.lock();
            if let Some(slot) = rq.current() {
                rq.charge_current(&policy, ExecMode::User)?;
                let entity = rq.entity_mut(slot)?;
                entity.reset_quantum(self.config.quantum(entity.level()));
                entity.record_voluntary();
                rq.mark_voluntary_switch();
            }
            let outcome = rq.pick_next(&policy)?;
            percpu.publish(&rq);
            outcome
        };
        self.place_evicted(outcome.evicted, now);
        Ok(outcome.dispatch)
    }

    /// Ask `cpu` to reschedule at its next safe point.
    pub fn preempt(&self, cpu: CpuId) -> SchedResult<()> {
        self.percpu(cpu)?.rq.lock().set_need_resched();
        Ok(())
    }

    pub fn need_resched(&self, cpu: CpuId) -> SchedResult<bool> {
        Ok(self.percpu(cpu)?.rq.lock().need_resched())
    }

    // ----- task lifecycle -----

    /// Create a blocked entity for `task`.
    pub fn admit(&self, task: TaskId, attrs: SchedAttrs) -> SchedResult<()> {
        attrs.validate(self.online)?;
        let entity = SchedEntity::new(task, &attrs, self.config.quantum(attrs.level), self.now());
        let mut tasks = self.tasks.write();
        if tasks.contains_key(&task) {
            return Err(SchedError::InvalidArgument {
                name: "task",
                reason: "already admitted",
            });
        }
        tasks.insert(task, Residence::Blocked(entity));
        log::trace!("{} admitted as {:?}", task, attrs.class);
        Ok(())
    }

    /// Make `task` runnable on `cpu`, admitting it with default attributes
    /// if it is unknown. Waking a task that is already runnable does
    /// nothing.
    pub fn enqueue(&self, task: TaskId, cpu: CpuId) -> SchedResult<()> {
        let percpu = self.percpu(cpu)?;
        self.ensure_admitted(task);
        let now = self.now();
        let gaming = self.gaming_enabled();

        let mut rq = percpu.rq.lock();
        Self::check_capacity(&rq)?;
        let Some(entity) = self.claim_blocked(task, cpu)? else {
            log::trace!("{} is already runnable", task);
            return Ok(());
        };
        if !entity.can_run_on(cpu) {
            self.tasks.write().insert(task, Residence::Blocked(entity));
            return Err(SchedError::InvalidArgument {
                name: "cpu",
                reason: "outside the task's affinity",
            });
        }

        let slot = match rq.attach(entity) {
            Ok(slot) => slot,
            Err(rejected) => return Err(self.park(rejected)),
        };
        // Attached and named OnCpu(cpu): a link failure keeps it reachable
        let queued = rq.enqueue_slot(slot, now, gaming);
        percpu.publish(&rq);
        queued?;
        let candidate = Candidate::of(rq.entity(slot)?, gaming);
        rq.arbitrate(&candidate, gaming)?;
        Ok(())
    }

    /// Make `task` non-runnable.
    pub fn dequeue(&self, task: TaskId) -> SchedResult<()> {
        self.block(task, false)
    }

    /// Make `task` non-runnable while it waits for IO.
    pub fn dequeue_for_io(&self, task: TaskId) -> SchedResult<()> {
        self.block(task, true)
    }

    /// Remove `task` from the scheduler and hand its entity back. A running
    /// task leaves its CPU to the idle sentinel until the next pick.
    pub fn dequeue_and_forget(&self, task: TaskId) -> SchedResult<SchedEntity> {
        let now = self.now();
        loop {
            match self.residence(task)? {
                Some(cpu) => {
                    let percpu = self.percpu(cpu)?;
                    let mut rq = percpu.rq.lock();
                    if let Some(slot) = rq.lookup(task) {
                        let entity = self.take_off_cpu(&mut rq, slot, now)?;
                        percpu.publish(&rq);
                        // Freeing the directory node happens outside the runqueue lock
                        drop(rq);
                        self.tasks.write().remove(&task);
                        log::debug!("{} left the scheduler", task);
                        return Ok(entity);
                    }
                }
                None => {
                    let mut tasks = self.tasks.write();
                    match tasks.remove(&task) {
                        Some(Residence::Blocked(entity)) => {
                            log::debug!("{} left the scheduler", task);
                            return Ok(entity);
                        }
                        Some(moved) => {
                            tasks.insert(task, moved);
                        }
                        None => return Err(SchedError::UnknownTask { id: task.0 }),
                    }
                }
            }
            core::hint::spin_loop();
        }
    }

    /// Read-only snapshot of a task's entity.
    pub fn task_info(&self, task: TaskId) -> SchedResult<EntityInfo> {
        self.with_entity(task, |place| match place {
            Place::OnCpu { rq, slot } => Ok(rq.entity(slot)?.info()),
            Place::Blocked(entity) => Ok(entity.info()),
        })
    }

    // ----- attributes -----

    /// Change class, nice, level, gaming opt-in and RT parameters of a
    /// task. Its affinity is left alone.
    pub fn set_class(&self, task: TaskId, attrs: SchedAttrs) -> SchedResult<()> {
        attrs.validate(self.online)?;
        let now = self.now();
        let policy = self.policy(now);
        let gaming = policy.gaming_enabled;
        let quantum = self.config.quantum(attrs.level);

        self.with_entity(task, |place| match place {
            Place::Blocked(entity) => {
                entity.set_class(&attrs, quantum, now);
                Ok(())
            }
            Place::OnCpu { rq, slot } => {
                if rq.current() == Some(slot) {
                    rq.charge_current(&policy, ExecMode::Kernel)?;
                    rq.entity_mut(slot)?.set_class(&attrs, quantum, now);
                    rq.set_need_resched();
                    return Ok(());
                }
                rq.remove(slot)?;
                rq.entity_mut(slot)?.set_class(&attrs, quantum, now);
                rq.enqueue_slot(slot, now, gaming)?;
                let candidate = Candidate::of(rq.entity(slot)?, gaming);
                rq.arbitrate(&candidate, gaming)?;
                Ok(())
            }
        })?;
        log::debug!("{} is now {:?} at L{}", task, attrs.class, attrs.level);
        Ok(())
    }

    /// Restrict the CPUs `task` may run on. A queued task outside its new
    /// mask moves right away; a running one moves at its next pick.
    pub fn set_affinity(&self, task: TaskId, mask: CpuSet) -> SchedResult<()> {
        validate_affinity(mask, self.online)?;
        let now = self.now();
        let evicted = self.with_entity(task, |place| match place {
            Place::Blocked(entity) => {
                entity.set_affinity(mask);
                Ok(None)
            }
            Place::OnCpu { rq, slot } => {
                let cpu = rq.cpu();
                let running = rq.current() == Some(slot);
                let entity = rq.entity_mut(slot)?;
                entity.set_affinity(mask);
                if entity.can_run_on(cpu) {
                    Ok(None)
                } else if running {
                    entity.flags.insert(EntityFlags::MIGRATE_PENDING);
                    rq.set_need_resched();
                    Ok(None)
                } else {
                    rq.detach(slot).map(Some)
                }
            }
        })?;
        if let Some(entity) = evicted {
            let cpu = self.place(entity, now)?;
            log::debug!("{} moved to cpu{} by its new affinity", task, cpu);
        }
        Ok(())
    }

    /// Pin `task` to whatever CPU it is on, as far as the balancer is
    /// concerned.
    pub fn set_migration_disabled(&self, task: TaskId, disabled: bool) -> SchedResult<()> {
        self.with_entity(task, |place| {
            match place {
                Place::OnCpu { rq, slot } => rq.entity_mut(slot)?.set_migration_disabled(disabled),
                Place::Blocked(entity) => entity.set_migration_disabled(disabled),
            }
            Ok(())
        })
    }

    /// Route `cpu`'s device interrupts to `mask`.
    pub fn set_irq_affinity(&self, cpu: CpuId, mask: CpuSet) -> SchedResult<()> {
        validate_affinity(mask, self.online)?;
        self.percpu(cpu)?.rq.lock().set_irq_affinity(mask);
        Ok(())
    }

    // ----- gaming mode -----

    pub fn is_gaming_mode(&self) -> bool {
        self.gaming.is_enabled()
    }

    /// Flip the gaming master switch and move queued entities between the
    /// gaming band and the MLFQ on every CPU.
    pub fn set_gaming_mode(&self, enabled: bool) -> SchedResult<()> {
        if self.gaming.set_enabled(enabled) == enabled {
            return Ok(());
        }
        let now = self.now();
        for percpu in &self.cpus {
            let mut rq = percpu.rq.lock();
            let moved = rq.rebucket_gaming(now, enabled)?;
            percpu.publish(&rq);
            if moved > 0 {
                log::debug!("cpu{}: {} entities changed band", rq.cpu(), moved);
            }
        }
        Ok(())
    }

    pub fn gaming_config(&self) -> GamingConfig {
        self.gaming.config()
    }

    pub fn configure_gaming(&self, config: GamingConfig) -> SchedResult<()> {
        self.gaming.configure(config)
    }

    /// Opt `task` into gaming treatment and give it the input boost.
    pub fn gaming_boost(&self, task: TaskId) -> SchedResult<()> {
        let now = self.now();
        let config = self.gaming.config();
        let gaming = self.gaming_enabled();
        let until = now.saturating_add(config.input_boost_duration_ns);
        let boost = |entity: &mut SchedEntity| {
            entity.set_gaming(true);
            if entity.class() != SchedClass::RealTime {
                entity.set_class_only(SchedClass::Gaming);
            }
            entity.apply_boost(config.input_boost_priority, until);
        };

        self.with_entity(task, |place| match place {
            Place::Blocked(entity) => {
                boost(entity);
                Ok(())
            }
            Place::OnCpu { rq, slot } => {
                let queued_in = rq.entity(slot)?.link.band();
                boost(rq.entity_mut(slot)?);
                let Some(band) = queued_in else {
                    return Ok(());
                };
                if RunQueue::band_for(rq.entity(slot)?, gaming) != band {
                    rq.remove(slot)?;
                    rq.enqueue_slot(slot, now, gaming)?;
                }
                let candidate = Candidate::of(rq.entity(slot)?, gaming);
                rq.arbitrate(&candidate, gaming)?;
                Ok(())
            }
        })?;
        log::debug!("{} boosted until {}ns", task, until);
        Ok(())
    }

    // ----- queries -----

    /// Frequency hint for `cpu` in MHz, never below the gaming floor while
    /// gaming mode is on.
    pub fn frequency_hint(&self, cpu: CpuId) -> SchedResult<u32> {
        let freq = self.percpu(cpu)?.rq.lock().freq_mhz;
        Ok(match self.gaming.frequency_floor() {
            Some(floor) => freq.max(floor),
            None => freq,
        })
    }

    /// Load average of `cpu` over 1, 5 or 15 minutes, times 100.
    pub fn load_average(&self, cpu: CpuId, minutes: u32) -> SchedResult<u32> {
        self.percpu(cpu)?
            .rq
            .lock()
            .load_avg
            .get(minutes)
            .ok_or(SchedError::InvalidArgument {
                name: "minutes",
                reason: "must be 1, 5 or 15",
            })
    }

    /// Queued entities on `cpu` plus its running one.
    pub fn load(&self, cpu: CpuId) -> SchedResult<usize> {
        Ok(self.percpu(cpu)?.rq.lock().load())
    }

    pub fn current(&self, cpu: CpuId) -> SchedResult<Option<TaskId>> {
        Ok(self.percpu(cpu)?.rq.lock().current_task())
    }

    pub fn runqueue_info(&self, cpu: CpuId) -> SchedResult<RunQueueInfo> {
        Ok(self.percpu(cpu)?.rq.lock().info())
    }

    /// Check the invariants of `cpu`'s runqueue and its agreement with the
    /// task directory.
    pub fn verify(&self, cpu: CpuId) -> SchedResult<()> {
        let percpu = self.percpu(cpu)?;
        let rq = percpu.rq.lock();
        rq.verify()?;
        if percpu.run_length() != rq.load() {
            log::error!("cpu{}: published load is stale", cpu);
            return Err(SchedError::Corrupted {
                what: "published load is stale",
            });
        }
        let tasks = self.tasks.read();
        for (_, entity) in rq.entities() {
            match tasks.get(&entity.task()) {
                Some(Residence::OnCpu(owner)) if *owner == cpu => {}
                _ => {
                    log::error!("cpu{}: directory disagrees about {}", cpu, entity.task());
                    return Err(SchedError::Corrupted {
                        what: "task directory disagrees with runqueue",
                    });
                }
            }
        }
        Ok(())
    }

    /// Statistics across all CPUs.
    pub fn snapshot(&self) -> SchedSnapshot {
        let gaming = self.gaming_enabled();
        let mut runnable = [0; SchedClass::COUNT];
        for percpu in &self.cpus {
            let rq = percpu.rq.lock();
            for (total, count) in runnable.iter_mut().zip(rq.runnable_by_class(gaming)) {
                *total += count;
            }
        }
        self.metrics
            .snapshot(runnable, elapsed(self.init_ns, self.now()))
    }

    // ----- internals -----

    /// CPU the directory names for `task`, `None` if it is blocked.
    fn residence(&self, task: TaskId) -> SchedResult<Option<CpuId>> {
        self.tasks
            .read()
            .get(&task)
            .map(Residence::cpu)
            .ok_or(SchedError::UnknownTask { id: task.0 })
    }

    /// Run `f` on the entity of `task` with its owner locked.
    fn with_entity<R>(
        &self,
        task: TaskId,
        f: impl FnOnce(Place<'_>) -> SchedResult<R>,
    ) -> SchedResult<R> {
        loop {
            match self.residence(task)? {
                Some(cpu) => {
                    let percpu = self.percpu(cpu)?;
                    let mut rq = percpu.rq.lock();
                    if let Some(slot) = rq.lookup(task) {
                        let result = f(Place::OnCpu { rq: &mut *rq, slot });
                        percpu.publish(&rq);
                        return result;
                    }
                }
                None => {
                    let mut tasks = self.tasks.write();
                    if let Some(Residence::Blocked(entity)) = tasks.get_mut(&task) {
                        return f(Place::Blocked(entity));
                    }
                }
            }
            // In flight between owners
            core::hint::spin_loop();
        }
    }

    fn ensure_admitted(&self, task: TaskId) {
        if self.tasks.read().contains_key(&task) {
            return;
        }
        let attrs = SchedAttrs::default();
        let quantum = self.config.quantum(attrs.level);
        let now = self.now();
        self.tasks
            .write()
            .entry(task)
            .or_insert_with(|| Residence::Blocked(SchedEntity::new(task, &attrs, quantum, now)));
    }

    /// Take a blocked entity out of the directory, recording `cpu` as its
    /// new owner. `None` if the task is already runnable.
    fn claim_blocked(&self, task: TaskId, cpu: CpuId) -> SchedResult<Option<SchedEntity>> {
        let mut tasks = self.tasks.write();
        let residence = tasks
            .get_mut(&task)
            .ok_or(SchedError::UnknownTask { id: task.0 })?;
        match core::mem::replace(residence, Residence::OnCpu(cpu)) {
            Residence::Blocked(entity) => Ok(Some(entity)),
            runnable => {
                *residence = runnable;
                Ok(None)
            }
        }
    }

    /// Return a refused entity to the directory as blocked and hand back
    /// the reason. The task's directory entry already exists, so this
    /// never allocates.
    pub(super) fn park(&self, rejected: Rejected) -> SchedError {
        let Rejected { error, entity } = rejected;
        let task = entity.task();
        self.tasks.write().insert(task, Residence::Blocked(entity));
        error
    }

    fn check_capacity(rq: &RunQueue) -> SchedResult<()> {
        if rq.spare_slots() == 0 {
            return Err(SchedError::OutOfCapacity {
                resource: "runqueue entity slots",
            });
        }
        Ok(())
    }

    fn block(&self, task: TaskId, io: bool) -> SchedResult<()> {
        let now = self.now();
        loop {
            let Some(cpu) = self.residence(task)? else {
                return Err(SchedError::NotRunnable { id: task.0 });
            };
            let percpu = self.percpu(cpu)?;
            let mut rq = percpu.rq.lock();
            if let Some(slot) = rq.lookup(task) {
                let mut entity = self.take_off_cpu(&mut rq, slot, now)?;
                entity.flags.remove(EntityFlags::MIGRATE_PENDING);
                entity.begin_block(now, io);
                self.tasks.write().insert(task, Residence::Blocked(entity));
                percpu.publish(&rq);
                log::trace!("{} blocked on cpu{} (io: {})", task, cpu, io);
                return Ok(());
            }
            drop(rq);
            core::hint::spin_loop();
        }
    }

    /// Detach an entity from its runqueue. A running entity is charged up
    /// to `now` and its CPU asked to pick again.
    fn take_off_cpu(&self, rq: &mut RunQueue, slot: SlotId, now: u64) -> SchedResult<SchedEntity> {
        if rq.current() != Some(slot) {
            return rq.detach(slot);
        }
        rq.charge_current(&self.policy(now), ExecMode::Kernel)?;
        rq.mark_voluntary_switch();
        rq.set_need_resched();
        let mut entity = rq.detach(slot)?;
        entity.record_voluntary();
        Ok(entity)
    }

    /// `home` itself if it is a candidate, else the closest candidate by
    /// NUMA distance.
    pub(super) fn closest_cpu(&self, candidates: CpuSet, home: CpuId) -> Option<CpuId> {
        if candidates.contains(home) {
            return Some(home);
        }
        self.topology.closest(candidates, home)
    }

    /// Least-loaded CPU the entity may run on, NUMA-closest on ties.
    fn select_cpu(&self, entity: &SchedEntity) -> Option<CpuId> {
        let allowed = entity.affinity().intersection(self.online);
        let run_length = |cpu: CpuId| self.percpu(cpu).map_or(usize::MAX, PerCpuRunQueue::run_length);
        let min = allowed.iter().map(run_length).min()?;
        let mut tied = CpuSet::empty();
        for cpu in allowed.iter().filter(|&cpu| run_length(cpu) == min) {
            tied.add(cpu);
        }
        let home = entity.preferred_cpu().unwrap_or(entity.last_cpu());
        self.closest_cpu(tied, home)
    }

    /// Queue a detached, runnable entity on a CPU its affinity allows. If
    /// no CPU can take it, the task is left blocked and the caller told.
    fn place(&self, entity: SchedEntity, now: u64) -> SchedResult<CpuId> {
        let task = entity.task();
        let Some(cpu) = self.select_cpu(&entity) else {
            self.tasks.write().insert(task, Residence::Blocked(entity));
            return Err(SchedError::InvalidArgument {
                name: "affinity",
                reason: "mask excludes every online CPU",
            });
        };
        let percpu = self.percpu(cpu)?;
        let gaming = self.gaming_enabled();
        let mut rq = percpu.rq.lock();
        let from = entity.last_cpu();
        let slot = match rq.attach(entity) {
            Ok(slot) => slot,
            Err(rejected) => return Err(self.park(rejected)),
        };
        self.tasks.write().insert(task, Residence::OnCpu(cpu));
        if from != cpu {
            rq.entity_mut(slot)?.record_migration(from, cpu, now);
            self.metrics.record_migration();
        }
        let queued = rq.enqueue_slot(slot, now, gaming);
        percpu.publish(&rq);
        queued?;
        let candidate = Candidate::of(rq.entity(slot)?, gaming);
        rq.arbitrate(&candidate, gaming)?;
        Ok(cpu)
    }

    /// Place an entity the picker evicted. The CPU has already switched, so
    /// a failure leaves the task blocked and is only logged.
    fn place_evicted(&self, entity: Option<SchedEntity>, now: u64) {
        let Some(entity) = entity else {
            return;
        };
        let task = entity.task();
        match self.place(entity, now) {
            Ok(cpu) => log::debug!("{} moved to cpu{} at its pick", task, cpu),
            Err(err) => log::error!("{} left blocked, no CPU could take it: {}", task, err),
        }
    }
}
