//! Timer tick handling for one runqueue
//!
//! Per tick: charge the running entity, bring queued real-time deadlines
//! up to date, run quantum and deadline checks, close behavior and power
//! windows, run the aging sweep when due, sample the load averages and
//! finally ask the arbiter whether the best queued candidate should
//! displace the running entity. Load balancing is only
//! flagged here; the caller runs it after dropping the runqueue lock.

use super::{
    aging::demote,
    behavior,
    clock::elapsed,
    pick::Policy,
    power::frequency_hint,
    preempt::{should_preempt, Candidate},
    queue::SlotId,
    runqueue::RunQueue,
    task::SchedClass,
};
use crate::error::SchedResult;

/// Privilege level the interrupted code was running at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecMode {
    #[default]
    User,
    Kernel,
}

/// Work the caller has to do after the tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(super) struct TickOutcome {
    pub balance_due: bool,
}

impl RunQueue {
    /// Charge the running entity for the time since it was last charged.
    /// Marks the quantum expired (and requests a reschedule) when it runs
    /// out.
    pub(super) fn charge_current(&mut self, p: &Policy, mode: ExecMode) -> SchedResult<u64> {
        let Some(slot) = self.current() else {
            return Ok(0);
        };
        let entity = self.entity_mut(slot)?;
        let delta = elapsed(entity.last_scheduled(), p.now);
        entity.set_last_scheduled(p.now);
        if delta == 0 {
            return Ok(0);
        }

        entity.charge_runtime(delta);
        let class = entity.effective_class(p.gaming_enabled);
        let mut expired = false;
        if class.uses_quantum() && entity.tick_charge(delta) {
            entity.mark_expired();
            expired = true;
        }
        if class == SchedClass::RealTime {
            p.rt.charge(delta, p.now);
        }

        match mode {
            ExecMode::User => self.stats.user_ns += delta,
            ExecMode::Kernel => self.stats.kernel_ns += delta,
        }
        self.cadence.window_busy_ns += delta;
        if expired {
            self.set_need_resched();
        }
        Ok(delta)
    }

    /// Deadline, budget and behavior checks on the running entity.
    fn check_current(&mut self, slot: SlotId, p: &Policy, rt_allowed: bool) -> SchedResult<()> {
        let entity = self.entity_mut(slot)?;
        let class = entity.effective_class(p.gaming_enabled);
        let mut resched = false;

        if class == SchedClass::RealTime {
            entity.rt_replenish(p.now);
            if let Some(deadline) = entity.deadline() {
                if p.now > deadline && entity.record_deadline_miss() {
                    p.metrics.record_deadline_miss(SchedClass::RealTime);
                    log::warn!(
                        "{} missed its deadline by {}ns",
                        entity.task(),
                        p.now - deadline
                    );
                    entity.mark_expired();
                    resched = true;
                }
            }
            if !rt_allowed || !entity.rt_eligible(p.now) {
                resched = true;
            }
        }

        if let Some(update) = behavior::update(entity, p.now, p.config.behavior_window_ns) {
            if update.hog && class.uses_quantum() && demote(entity, p.config) {
                p.metrics.record_demotion();
                log::debug!(
                    "{} demoted for CPU hogging ({}%)",
                    entity.task(),
                    update.cpu_usage_pct
                );
            }
        }

        if resched {
            self.set_need_resched();
        }
        Ok(())
    }

    /// Recompute the frequency hint once per behavior window.
    fn close_power_window(&mut self, p: &Policy) {
        let span = elapsed(self.cadence.window_start_ns, p.now);
        if span < p.config.behavior_window_ns {
            return;
        }
        self.freq_mhz = frequency_hint(self.cadence.window_busy_ns, span, p.gaming_floor);
        self.cadence.window_start_ns = p.now;
        self.cadence.window_busy_ns = 0;
    }

    /// Handle one timer tick.
    pub(super) fn tick(&mut self, p: &Policy, mode: ExecMode) -> SchedResult<TickOutcome> {
        let now = p.now;
        self.stats.ticks += 1;
        self.cadence.last_tick_ns = now;

        match self.current() {
            None => {
                if let Some(since) = self.cadence.idle_since_ns.replace(now) {
                    self.stats.idle_ns += elapsed(since, now);
                }
            }
            Some(_) => {
                self.charge_current(p, mode)?;
            }
        }
        let rt_allowed = !p.rt.is_throttled(now, p.metrics);
        self.refresh_rt(now, p.metrics)?;
        if let Some(slot) = self.current() {
            self.check_current(slot, p, rt_allowed)?;
        }
        self.close_power_window(p);

        if elapsed(self.cadence.last_aging_ns, now) >= p.config.aging_interval_ns {
            self.cadence.last_aging_ns = now;
            self.age(now, p.config, p.gaming_enabled, p.metrics)?;
        }

        let mut outcome = TickOutcome::default();
        if elapsed(self.cadence.last_balance_ns, now) >= p.config.load_balance_interval_ns {
            self.cadence.last_balance_ns = now;
            outcome.balance_due = true;
        }

        self.load_avg.sample(self.load());

        if !self.need_resched() {
            match self.current() {
                Some(slot) => {
                    let current = Candidate::of(self.entity(slot)?, p.gaming_enabled);
                    if let Some((_, best)) = self.peek_highest(now, p.gaming_enabled, rt_allowed) {
                        let best = Candidate::of(self.entity(best)?, p.gaming_enabled);
                        if should_preempt(&current, &best) {
                            self.set_need_resched();
                        }
                    }
                }
                // Idle with queued work (e.g. just rolled over RT bandwidth)
                None if self.peek_highest(now, p.gaming_enabled, rt_allowed).is_some() => {
                    self.set_need_resched();
                }
                None => {}
            }
        }

        log::trace!(
            "cpu{} tick: load {} resched {}",
            self.cpu(),
            self.load(),
            self.need_resched()
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::{
        clock::NS_PER_MS,
        config::SchedConfig,
        metrics::SchedulerMetrics,
        pick::Dispatch,
        power::{DEFAULT_FREQ_MHZ, MAX_FREQ_MHZ, MIN_FREQ_MHZ},
        rt_bandwidth::RtBandwidth,
        task::{RtParams, SchedAttrs, SchedEntity, TaskId},
    };

    struct Fixture {
        config: SchedConfig,
        rt: RtBandwidth,
        metrics: SchedulerMetrics,
    }

    impl Fixture {
        fn new(config: SchedConfig) -> Self {
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
                gaming_enabled: false,
                gaming_floor: None,
                now,
            }
        }
    }

    fn add(rq: &mut RunQueue, id: u64, attrs: SchedAttrs) {
        let quantum = SchedConfig::default().quantum(attrs.level);
        rq.enqueue(SchedEntity::new(TaskId(id), &attrs, quantum, 0), 0, false)
            .unwrap();
    }

    #[test]
    fn test_quantum_expiry_requests_resched() {
        let fx = Fixture::new(SchedConfig::default());
        let mut rq = RunQueue::new(0, 0, &fx.config, 0);
        add(&mut rq, 1, SchedAttrs::default());
        add(&mut rq, 2, SchedAttrs::default());
        rq.pick_next(&fx.policy(0)).unwrap();

        for ms in 1..4 {
            rq.tick(&fx.policy(ms * NS_PER_MS), ExecMode::User).unwrap();
            assert!(!rq.need_resched(), "tick {}", ms);
        }
        rq.tick(&fx.policy(4 * NS_PER_MS), ExecMode::User).unwrap();
        assert!(rq.need_resched());
        let slot = rq.current().unwrap();
        assert!(rq.entity(slot).unwrap().quantum_expired());
        assert_eq!(rq.stats.user_ns, 4 * NS_PER_MS);
    }

    #[test]
    fn test_idle_tick_accumulates_idle_time() {
        let fx = Fixture::new(SchedConfig::default());
        let mut rq = RunQueue::new(0, 0, &fx.config, 0);
        rq.tick(&fx.policy(NS_PER_MS), ExecMode::Kernel).unwrap();
        rq.tick(&fx.policy(2 * NS_PER_MS), ExecMode::Kernel).unwrap();
        assert_eq!(rq.stats.idle_ns, 2 * NS_PER_MS);
        assert_eq!(rq.stats.ticks, 2);
        assert!(!rq.need_resched());
    }

    #[test]
    fn test_balance_due_on_interval() {
        let fx = Fixture::new(SchedConfig::default());
        let mut rq = RunQueue::new(0, 0, &fx.config, 0);
        let mut due = 0;
        for ms in 1..=30 {
            if rq.tick(&fx.policy(ms * NS_PER_MS), ExecMode::User).unwrap().balance_due {
                due += 1;
            }
        }
        assert_eq!(due, 3);
    }

    #[test]
    fn test_deadline_miss_recorded_once() {
        let fx = Fixture::new(SchedConfig::default());
        let mut rq = RunQueue::new(0, 0, &fx.config, 0);
        let params = RtParams::new(20 * NS_PER_MS, 100 * NS_PER_MS).with_deadline(20 * NS_PER_MS);
        add(&mut rq, 1, SchedAttrs::real_time(params));
        assert_eq!(
            rq.pick_next(&fx.policy(0)).unwrap().dispatch,
            Dispatch::Task(TaskId(1))
        );
        for ms in 1..=25 {
            rq.tick(&fx.policy(ms * NS_PER_MS), ExecMode::User).unwrap();
        }
        let slot = rq.lookup(TaskId(1)).unwrap();
        assert_eq!(rq.entity(slot).unwrap().stats().deadline_misses, 1);
        assert!(rq.need_resched());
        assert_eq!(
            fx.metrics.snapshot([0; SchedClass::COUNT], 0).deadline_misses
                [SchedClass::RealTime.index()],
            1
        );
    }

    #[test]
    fn test_cpu_hog_demoted_once_per_window() {
        let mut config = SchedConfig::default();
        config.quanta_ns = [20 * NS_PER_MS; 5];
        config.behavior_window_ns = 2 * NS_PER_MS;
        let fx = Fixture::new(config);
        let mut rq = RunQueue::new(0, 0, &fx.config, 0);
        let hog = SchedEntity::new(TaskId(1), &SchedAttrs::default().with_level(0), 20 * NS_PER_MS, 0);
        rq.enqueue(hog, 0, false).unwrap();
        rq.pick_next(&fx.policy(0)).unwrap();
        let slot = rq.current().unwrap();

        // Hog after two full windows, then one level per window
        let expected = [0, 0, 0, 0, 1, 1, 2, 2, 3, 3, 4, 4, 4];
        for (ms, &level) in expected.iter().enumerate().skip(1) {
            rq.tick(&fx.policy(ms as u64 * NS_PER_MS), ExecMode::User).unwrap();
            let entity = rq.entity(slot).unwrap();
            assert_eq!(entity.level(), level, "t={}ms", ms);
            assert!(!entity.quantum_expired(), "t={}ms", ms);
        }
        let entity = rq.entity(slot).unwrap();
        assert_eq!(entity.stats().demotions, 4);
        assert_eq!(entity.quantum_remaining(), 18 * NS_PER_MS);
        assert!(!rq.need_resched());
        assert_eq!(fx.metrics.snapshot([0; SchedClass::COUNT], 0).demotions, 4);
    }

    #[test]
    fn test_frequency_hint_follows_load() {
        let fx = Fixture::new(SchedConfig::default());
        let mut rq = RunQueue::new(0, 0, &fx.config, 0);
        assert_eq!(rq.freq_mhz, DEFAULT_FREQ_MHZ);
        for ms in 1..=10 {
            rq.tick(&fx.policy(ms * NS_PER_MS), ExecMode::User).unwrap();
        }
        assert_eq!(rq.freq_mhz, MIN_FREQ_MHZ);

        add(&mut rq, 1, SchedAttrs::default().with_level(4));
        rq.pick_next(&fx.policy(10 * NS_PER_MS)).unwrap();
        for ms in 11..=20 {
            rq.tick(&fx.policy(ms * NS_PER_MS), ExecMode::User).unwrap();
        }
        assert_eq!(rq.freq_mhz, MAX_FREQ_MHZ);
    }

    #[test]
    fn test_arbiter_flags_better_candidate() {
        let fx = Fixture::new(SchedConfig::default());
        let mut rq = RunQueue::new(0, 0, &fx.config, 0);
        add(&mut rq, 1, SchedAttrs::default().with_level(3));
        rq.pick_next(&fx.policy(0)).unwrap();
        add(&mut rq, 2, SchedAttrs::default().with_level(1));
        rq.tick(&fx.policy(NS_PER_MS), ExecMode::User).unwrap();
        assert!(rq.need_resched());
    }
}
