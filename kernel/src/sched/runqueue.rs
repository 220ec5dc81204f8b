//! Per-CPU runqueue
//!
//! Each CPU owns one [`RunQueue`] behind its own spin lock. The runqueue
//! owns the entities attached to it (queued or running) in a preallocated
//! slab and lists them in seven bands: a gaming FIFO, an earliest-deadline
//! real-time queue and five MLFQ FIFOs.
//!
//! The idle sentinel is implicit: `current == None` means the CPU is idle.
//! It is never queued and can never be removed.

use super::{
    config::{SchedConfig, MLFQ_LEVELS},
    metrics::SchedulerMetrics,
    numa::NodeId,
    power::DEFAULT_FREQ_MHZ,
    queue::{Band, EntitySlab, IntrusiveList, Rejected, SlotId, TaskIndex, BAND_COUNT},
    task::{CpuId, CpuSet, EntityState, SchedClass, SchedEntity, TaskId},
};
use crate::error::{SchedError, SchedResult};

/// Fixed-point shift for load averages.
const FSHIFT: u32 = 32;
const FIXED_ONE: u128 = 1 << FSHIFT;

/// Load-average windows in seconds.
const LOAD_WINDOWS_SECS: [u64; 3] = [60, 300, 900];

/// 1, 5 and 15 minute exponential moving averages of the runnable count
#[derive(Debug, Clone, Copy)]
pub struct LoadAverages {
    /// Per-tick decay factors (fixed point)
    decay: [u128; 3],
    /// Current averages (fixed point)
    avg: [u128; 3],
}

impl LoadAverages {
    /// Decay factors for a sample every `tick_ns`: `e^(-tick/window)`,
    /// second-order approximation, which is exact to well under one part
    /// per million for millisecond ticks.
    pub fn new(tick_ns: u64) -> Self {
        let mut decay = [0u128; 3];
        for (d, secs) in decay.iter_mut().zip(LOAD_WINDOWS_SECS) {
            let window_ns = u128::from(secs) * 1_000_000_000;
            let x = (FIXED_ONE * u128::from(tick_ns) / window_ns).min(FIXED_ONE);
            *d = FIXED_ONE - x + x * x / (2 * FIXED_ONE);
        }
        Self {
            decay,
            avg: [0; 3],
        }
    }

    /// Fold one sample of the runnable count into every average.
    pub fn sample(&mut self, runnable: usize) {
        let n = runnable as u128 * FIXED_ONE;
        for (avg, decay) in self.avg.iter_mut().zip(self.decay) {
            *avg = (*avg * decay + n * (FIXED_ONE - decay)) >> FSHIFT;
        }
    }

    /// Average over `minutes` (1, 5 or 15), scaled by 100.
    pub fn get(&self, minutes: u32) -> Option<u32> {
        let idx = match minutes {
            1 => 0,
            5 => 1,
            15 => 2,
            _ => return None,
        };
        let scaled = (self.avg[idx] * 100 + FIXED_ONE / 2) >> FSHIFT;
        Some(scaled.min(u128::from(u32::MAX)) as u32)
    }
}

/// Runqueue counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunQueueStats {
    pub context_switches: u64,
    pub ticks: u64,
    pub idle_ns: u64,
    pub user_ns: u64,
    pub kernel_ns: u64,
    pub idle_picks: u64,
}

/// Per-CPU time stamps driving the periodic work of the tick handler
#[derive(Debug, Clone, Copy, Default)]
pub(super) struct Cadence {
    pub last_tick_ns: u64,
    pub last_aging_ns: u64,
    pub last_balance_ns: u64,
    pub window_start_ns: u64,
    /// Busy time accumulated in the current behavior window
    pub window_busy_ns: u64,
    /// Set while the idle sentinel runs
    pub idle_since_ns: Option<u64>,
}

/// Observable runqueue state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunQueueInfo {
    pub cpu: CpuId,
    pub node: NodeId,
    /// `None` while the idle sentinel runs
    pub current: Option<TaskId>,
    /// Lengths in [`Band::ALL`] order
    pub band_lens: [usize; BAND_COUNT],
    pub load: usize,
    pub need_resched: bool,
    pub freq_mhz: u32,
    pub irq_affinity: CpuSet,
    pub load_avg: [u32; 3],
    pub stats: RunQueueStats,
}

/// Per-CPU runqueue
#[derive(Debug)]
pub struct RunQueue {
    cpu: CpuId,
    node: NodeId,
    slab: EntitySlab,
    index: TaskIndex,
    bands: [IntrusiveList; BAND_COUNT],
    current: Option<SlotId>,
    need_resched: bool,
    enqueue_seq: u64,
    irq_affinity: CpuSet,
    pub(super) freq_mhz: u32,
    pub(super) load_avg: LoadAverages,
    pub(super) stats: RunQueueStats,
    pub(super) cadence: Cadence,
    /// Task returned by the previous pick, `None` for idle
    pub(super) last_dispatched: Option<TaskId>,
    /// The outgoing task gave up the CPU itself
    pub(super) switch_voluntary: bool,
}

impl RunQueue {
    pub fn new(cpu: CpuId, node: NodeId, config: &SchedConfig, now: u64) -> Self {
        Self {
            cpu,
            node,
            slab: EntitySlab::with_capacity(config.slots_per_cpu),
            index: TaskIndex::with_capacity(config.slots_per_cpu),
            bands: [IntrusiveList::new(); BAND_COUNT],
            current: None,
            need_resched: false,
            enqueue_seq: 0,
            irq_affinity: CpuSet::single(cpu),
            freq_mhz: DEFAULT_FREQ_MHZ,
            load_avg: LoadAverages::new(config.tick_period_ns),
            stats: RunQueueStats::default(),
            cadence: Cadence {
                last_tick_ns: now,
                last_aging_ns: now,
                last_balance_ns: now,
                window_start_ns: now,
                window_busy_ns: 0,
                idle_since_ns: Some(now),
            },
            last_dispatched: None,
            switch_voluntary: false,
        }
    }

    pub fn cpu(&self) -> CpuId {
        self.cpu
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn irq_affinity(&self) -> CpuSet {
        self.irq_affinity
    }

    pub fn set_irq_affinity(&mut self, mask: CpuSet) {
        self.irq_affinity = mask;
    }

    pub fn need_resched(&self) -> bool {
        self.need_resched
    }

    pub fn set_need_resched(&mut self) {
        self.need_resched = true;
    }

    pub(super) fn clear_need_resched(&mut self) {
        self.need_resched = false;
    }

    // ----- slab ownership -----

    /// Take ownership of an entity without queueing it. A refused entity
    /// is handed back.
    pub fn attach(&mut self, mut entity: SchedEntity) -> Result<SlotId, Rejected> {
        let task = entity.task();
        debug_assert!(!self.index.contains(task), "task attached twice");
        let Some(slot) = self.slab.next_free() else {
            return Err(Rejected {
                error: SchedError::OutOfCapacity {
                    resource: "runqueue entity slots",
                },
                entity,
            });
        };
        if let Err(error) = self.index.insert(task, slot) {
            return Err(Rejected { error, entity });
        }
        entity.set_last_cpu(self.cpu);
        self.slab.insert(entity).map_err(|rejected| {
            self.index.remove(task);
            rejected
        })
    }

    /// Release ownership of an entity, unlinking it from its band or
    /// clearing `current` first.
    pub fn detach(&mut self, slot: SlotId) -> SchedResult<SchedEntity> {
        let band = self.entity(slot)?.link.band();
        if let Some(band) = band {
            self.bands[band.index()].remove(&mut self.slab, slot)?;
        }
        if self.current == Some(slot) {
            self.current = None;
        }
        let mut entity = self.slab.take(slot).ok_or(SchedError::Corrupted {
            what: "detaching an empty slot",
        })?;
        self.index.remove(entity.task());
        entity.state = EntityState::Blocked;
        Ok(entity)
    }

    pub fn lookup(&self, task: TaskId) -> Option<SlotId> {
        self.index.get(task)
    }

    pub fn entity(&self, slot: SlotId) -> SchedResult<&SchedEntity> {
        self.slab.get(slot).ok_or(SchedError::Corrupted {
            what: "runqueue slot is empty",
        })
    }

    pub fn entity_mut(&mut self, slot: SlotId) -> SchedResult<&mut SchedEntity> {
        self.slab.get_mut(slot).ok_or(SchedError::Corrupted {
            what: "runqueue slot is empty",
        })
    }

    /// Free entity slots left.
    pub fn spare_slots(&self) -> usize {
        self.slab.capacity() - self.slab.len()
    }

    /// Every entity this runqueue owns, in slot order.
    pub fn entities(&self) -> impl Iterator<Item = (SlotId, &SchedEntity)> {
        self.slab.iter()
    }

    // ----- queueing -----

    /// Band an entity belongs in given the global gaming switch.
    pub fn band_for(entity: &SchedEntity, gaming_enabled: bool) -> Band {
        match entity.effective_class(gaming_enabled) {
            SchedClass::Gaming => Band::Gaming,
            SchedClass::RealTime => Band::RealTime,
            _ => Band::Mlfq(entity.level()),
        }
    }

    /// Queue an attached entity at the tail of its band (deadline order for
    /// real-time, after rolling its period forward to `now`). Stamps
    /// `last_cpu` and restarts the wait clock.
    pub fn enqueue_slot(&mut self, slot: SlotId, now: u64, gaming_enabled: bool) -> SchedResult<()> {
        debug_assert!(self.current != Some(slot), "enqueueing the running entity");
        if self.current == Some(slot) {
            return Err(SchedError::Corrupted {
                what: "running entity enqueued",
            });
        }
        self.enqueue_seq += 1;
        let seq = self.enqueue_seq;
        let cpu = self.cpu;
        let entity = self.entity_mut(slot)?;
        let band = Self::band_for(entity, gaming_enabled);
        entity.set_last_cpu(cpu);
        entity.set_wait_start(now);
        entity.enqueue_seq = seq;
        entity.state = EntityState::Queued;
        if band == Band::RealTime {
            entity.rt_replenish(now);
        }
        let list = &mut self.bands[band.index()];
        match band {
            Band::RealTime => list.insert_by_deadline(&mut self.slab, slot, band),
            _ => list.push_back(&mut self.slab, slot, band),
        }
    }

    /// Attach and queue in one step.
    #[cfg(test)]
    pub fn enqueue(&mut self, entity: SchedEntity, now: u64, gaming_enabled: bool) -> SchedResult<SlotId> {
        let slot = self.attach(entity).map_err(|rejected| rejected.error)?;
        self.enqueue_slot(slot, now, gaming_enabled)?;
        Ok(slot)
    }

    /// Unlink a queued entity in O(1). The entity stays attached.
    pub fn remove(&mut self, slot: SlotId) -> SchedResult<()> {
        let band = self.entity(slot)?.link.band().ok_or(SchedError::Corrupted {
            what: "removing an entity that is not queued",
        })?;
        self.bands[band.index()].remove(&mut self.slab, slot)
    }

    /// Remove and return the head of an MLFQ level.
    pub fn dequeue(&mut self, level: u8) -> SchedResult<Option<SchedEntity>> {
        if level as usize >= MLFQ_LEVELS {
            return Ok(None);
        }
        match self.bands[Band::Mlfq(level).index()].front() {
            Some(slot) => self.detach(slot).map(Some),
            None => Ok(None),
        }
    }

    /// Bring queued real-time entities up to `now`: count a miss for each
    /// one whose deadline passed while it still had budget to run, then
    /// roll expired periods forward and re-sort the band by the new
    /// deadlines. Returns the number of misses recorded.
    pub fn refresh_rt(&mut self, now: u64, metrics: &SchedulerMetrics) -> SchedResult<usize> {
        let mut misses = 0;
        let mut at = self.bands[Band::RealTime.index()].front();
        while let Some(slot) = at {
            let entity = self.entity_mut(slot)?;
            at = entity.link.next();
            let overdue = entity
                .rt()
                .is_some_and(|rt| now > rt.deadline_ns && !rt.budget_exhausted());
            if overdue && entity.record_deadline_miss() {
                metrics.record_deadline_miss(SchedClass::RealTime);
                log::warn!("{} missed its deadline while queued", entity.task());
                misses += 1;
            }
            if entity.rt_replenish(now) {
                let list = &mut self.bands[Band::RealTime.index()];
                list.remove(&mut self.slab, slot)?;
                list.insert_by_deadline(&mut self.slab, slot, Band::RealTime)?;
            }
        }
        Ok(misses)
    }

    /// First entity of `band` that may run now. Real-time entities whose
    /// own budget is spent are skipped until their period rolls over.
    fn band_head(&self, band: Band, now: u64) -> Option<SlotId> {
        let list = &self.bands[band.index()];
        match band {
            Band::RealTime => list
                .iter(&self.slab)
                .find(|&s| self.slab.get(s).is_some_and(|e| e.rt_eligible(now))),
            _ => list.front(),
        }
    }

    /// Highest-priority runnable candidate without removing it.
    ///
    /// The gaming band participates only while gaming mode is on and the
    /// real-time band only while RT bandwidth remains.
    pub fn peek_highest(&self, now: u64, gaming_enabled: bool, rt_allowed: bool) -> Option<(Band, SlotId)> {
        Band::ALL.iter().find_map(|&band| {
            let skip = match band {
                Band::Gaming => !gaming_enabled,
                Band::RealTime => !rt_allowed,
                Band::Mlfq(_) => false,
            };
            if skip {
                return None;
            }
            self.band_head(band, now).map(|slot| (band, slot))
        })
    }

    /// Remove and return the highest-priority runnable candidate.
    pub fn pop_highest(&mut self, now: u64, gaming_enabled: bool, rt_allowed: bool) -> SchedResult<Option<SlotId>> {
        match self.peek_highest(now, gaming_enabled, rt_allowed) {
            Some((band, slot)) => {
                self.bands[band.index()].remove(&mut self.slab, slot)?;
                Ok(Some(slot))
            }
            None => Ok(None),
        }
    }

    pub fn band(&self, band: Band) -> &IntrusiveList {
        &self.bands[band.index()]
    }

    /// Slots of one band head to tail
    pub fn band_slots(&self, band: Band) -> impl Iterator<Item = SlotId> + '_ {
        self.bands[band.index()].iter(&self.slab)
    }

    /// Slots of one band tail to head
    pub fn band_slots_rev(&self, band: Band) -> impl Iterator<Item = SlotId> + '_ {
        self.bands[band.index()].iter_rev(&self.slab)
    }

    pub fn queued(&self) -> usize {
        self.bands.iter().map(IntrusiveList::len).sum()
    }

    /// Queued entities plus the running one, if not idle.
    pub fn load(&self) -> usize {
        self.queued() + usize::from(self.current.is_some())
    }

    // ----- current -----

    pub fn current(&self) -> Option<SlotId> {
        self.current
    }

    pub fn current_task(&self) -> Option<TaskId> {
        self.current
            .and_then(|slot| self.slab.get(slot))
            .map(SchedEntity::task)
    }

    /// Make a dequeued, attached entity the running one.
    pub(super) fn set_current(&mut self, slot: Option<SlotId>) {
        self.current = slot;
    }

    // ----- observability -----

    pub fn info(&self) -> RunQueueInfo {
        let mut band_lens = [0; BAND_COUNT];
        for (len, list) in band_lens.iter_mut().zip(self.bands.iter()) {
            *len = list.len();
        }
        RunQueueInfo {
            cpu: self.cpu,
            node: self.node,
            current: self.current_task(),
            band_lens,
            load: self.load(),
            need_resched: self.need_resched,
            freq_mhz: self.freq_mhz,
            irq_affinity: self.irq_affinity,
            load_avg: [1, 5, 15].map(|m| self.load_avg.get(m).unwrap_or(0)),
            stats: self.stats,
        }
    }

    /// Runnable entities per class, by effective class.
    pub fn runnable_by_class(&self, gaming_enabled: bool) -> [usize; SchedClass::COUNT] {
        let mut counts = [0; SchedClass::COUNT];
        for (_, entity) in self.slab.iter() {
            if entity.state != EntityState::Blocked {
                counts[entity.effective_class(gaming_enabled).index()] += 1;
            }
        }
        counts
    }

    /// Check every structural invariant of this runqueue.
    pub fn verify(&self) -> SchedResult<()> {
        let mut listed = 0usize;
        for band in Band::ALL {
            let list = &self.bands[band.index()];
            let mut count = 0usize;
            let mut last_deadline = 0u64;
            for slot in list.iter(&self.slab) {
                let entity = self.entity(slot)?;
                count += 1;
                if count > list.len() {
                    return Err(corrupted("band is longer than its count"));
                }
                if entity.link.band() != Some(band) {
                    return Err(corrupted("entity linked into the wrong band"));
                }
                if entity.last_cpu() != self.cpu {
                    return Err(corrupted("queued entity reports another CPU"));
                }
                if entity.state != EntityState::Queued || self.current == Some(slot) {
                    return Err(corrupted("queued entity in the wrong state"));
                }
                if let Band::Mlfq(level) = band {
                    if entity.level() != level {
                        return Err(corrupted("MLFQ entity in the wrong level"));
                    }
                }
                if band == Band::RealTime {
                    let deadline = entity.deadline().unwrap_or(u64::MAX);
                    if deadline < last_deadline {
                        return Err(corrupted("real-time queue out of deadline order"));
                    }
                    last_deadline = deadline;
                }
            }
            if count != list.len() {
                return Err(corrupted("band count mismatch"));
            }
            listed += count;
        }

        if listed + usize::from(self.current.is_some()) > self.slab.len() {
            return Err(corrupted("more runnable entities than attached ones"));
        }
        if self.index.len() != self.slab.len() {
            return Err(corrupted("task index out of sync with slab"));
        }
        for (slot, entity) in self.slab.iter() {
            if self.index.get(entity.task()) != Some(slot) {
                return Err(corrupted("task index points at the wrong slot"));
            }
            let running = self.current == Some(slot);
            match entity.state {
                EntityState::Running if running => {}
                EntityState::Queued if entity.link.is_linked() => {}
                _ => return Err(corrupted("attached entity neither queued nor running")),
            }
            if entity.level() as usize >= MLFQ_LEVELS {
                return Err(corrupted("MLFQ level out of range"));
            }
            if entity.affinity().is_empty() {
                return Err(corrupted("empty affinity mask"));
            }
        }
        Ok(())
    }
}

fn corrupted(what: &'static str) -> SchedError {
    log::error!("runqueue invariant violated: {}", what);
    SchedError::Corrupted { what }
}
