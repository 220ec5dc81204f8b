//! Behavior classifier
//!
//! Once per behavior window the running entity's counters are diffed
//! against the values saved at the start of its window. The resulting
//! sample is classified, the moving usage percentages are updated, and the
//! dynamic priority is nudged one step toward the behavior's target. The
//! classifier never changes an entity's class.

use super::{
    clock::elapsed,
    task::{Behavior, SchedEntity, WindowBase, NICE_MIN},
};

/// CPU usage at or above which a window is CPU-bound.
pub const CPU_BOUND_PCT: u8 = 80;

/// IO wait at or above which a window is IO-bound.
pub const IO_BOUND_PCT: u8 = 50;

/// CPU usage above which a CPU-bound entity counts as a hog.
pub const HOG_PCT: u8 = 95;

/// Consecutive hog windows before a hog is demoted.
pub const HOG_STREAK: u8 = 2;

/// Priority floor reached by interactive entities.
pub const INTERACTIVE_PRIO_FLOOR: i8 = -5;

/// Priority floor reached by IO-bound entities.
pub const IO_BOUND_PRIO_FLOOR: i8 = -2;

/// Priority ceiling reached by CPU-bound entities.
pub const CPU_BOUND_PRIO_CEILING: i8 = 10;

/// Counter deltas over one window
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowSample {
    pub window_ns: u64,
    pub runtime_ns: u64,
    pub wait_ns: u64,
    pub io_wait_ns: u64,
    pub voluntary: u64,
    pub involuntary: u64,
    pub gaming: bool,
}

impl WindowSample {
    pub fn cpu_usage_pct(&self) -> u8 {
        percent(self.runtime_ns, self.window_ns)
    }

    pub fn io_wait_pct(&self) -> u8 {
        percent(self.io_wait_ns, self.window_ns)
    }
}

fn percent(part: u64, whole: u64) -> u8 {
    if whole == 0 {
        return 0;
    }
    (u128::from(part.min(whole)) * 100 / u128::from(whole)) as u8
}

/// Map a window sample to a behavior tag.
///
/// Rules are checked in order, the first match wins. The gaming flag only
/// decides when usage does not already mark the window CPU- or IO-bound.
pub fn classify(sample: &WindowSample) -> Behavior {
    let cpu = sample.cpu_usage_pct();
    if cpu >= CPU_BOUND_PCT {
        return Behavior::CpuBound;
    }
    if sample.io_wait_pct() >= IO_BOUND_PCT {
        return Behavior::IoBound;
    }
    let switches = sample.voluntary + sample.involuntary;
    if switches > 0 && sample.voluntary >= 2 * sample.involuntary {
        return Behavior::Interactive;
    }
    if sample.gaming {
        return Behavior::Gaming;
    }
    Behavior::Unknown
}

/// Move a priority one step toward the target for `behavior`.
pub fn adjust_priority(prio: i8, behavior: Behavior) -> i8 {
    match behavior {
        Behavior::Interactive if prio > INTERACTIVE_PRIO_FLOOR => prio - 1,
        Behavior::IoBound if prio > IO_BOUND_PRIO_FLOOR => prio - 1,
        Behavior::CpuBound if prio < CPU_BOUND_PRIO_CEILING => prio + 1,
        Behavior::Gaming => NICE_MIN,
        _ => prio,
    }
}

/// Outcome of closing an entity's behavior window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BehaviorUpdate {
    pub behavior: Behavior,
    pub cpu_usage_pct: u8,
    /// The entity has been a CPU hog for enough consecutive windows
    pub hog: bool,
}

/// Moving average weighting the newest sample by a quarter.
fn blend(old: u8, new: u8) -> u8 {
    ((u16::from(old) * 3 + u16::from(new)) / 4) as u8
}

/// Close the entity's behavior window if it has lasted `window_ns`.
pub fn update(entity: &mut SchedEntity, now: u64, window_ns: u64) -> Option<BehaviorUpdate> {
    let base = entity.window;
    let span = elapsed(base.start_ns, now);
    if window_ns == 0 || span < window_ns {
        return None;
    }

    let stats = *entity.stats();
    // Include the open wait interval, if any
    let open_wait = entity.wait_start().map_or(0, |start| elapsed(start, now));
    let wait_total = stats.total_wait_ns + open_wait;
    let sample = WindowSample {
        window_ns: span,
        runtime_ns: stats.total_runtime_ns.saturating_sub(base.runtime_ns),
        wait_ns: wait_total.saturating_sub(base.wait_ns),
        io_wait_ns: stats.io_wait_ns.saturating_sub(base.io_wait_ns),
        voluntary: stats.voluntary_switches - base.voluntary,
        involuntary: stats.involuntary_switches - base.involuntary,
        gaming: entity.is_gaming(),
    };

    let behavior = classify(&sample);
    let cpu = sample.cpu_usage_pct();
    entity.set_behavior(behavior);
    entity.set_usage(
        blend(entity.cpu_usage_pct(), cpu),
        blend(entity.io_wait_pct(), sample.io_wait_pct()),
    );
    if !entity.boost_active(now) {
        entity.set_prio(adjust_priority(entity.priority(), behavior));
    }

    if behavior == Behavior::CpuBound && cpu > HOG_PCT {
        entity.cpu_bound_streak = entity.cpu_bound_streak.saturating_add(1);
    } else {
        entity.cpu_bound_streak = 0;
    }

    entity.window = WindowBase {
        start_ns: now,
        runtime_ns: stats.total_runtime_ns,
        wait_ns: wait_total,
        io_wait_ns: stats.io_wait_ns,
        voluntary: stats.voluntary_switches,
        involuntary: stats.involuntary_switches,
    };

    log::trace!(
        "{} classified {:?} (cpu {}%, io {}%)",
        entity.task(),
        behavior,
        cpu,
        sample.io_wait_pct()
    );

    Some(BehaviorUpdate {
        behavior,
        cpu_usage_pct: cpu,
        hog: entity.cpu_bound_streak >= HOG_STREAK,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::{
        clock::NS_PER_MS,
        task::{SchedAttrs, SchedClass, TaskId},
    };

    fn sample(runtime: u64, io: u64, vol: u64, invol: u64) -> WindowSample {
        WindowSample {
            window_ns: 100,
            runtime_ns: runtime,
            wait_ns: 100 - runtime,
            io_wait_ns: io,
            voluntary: vol,
            involuntary: invol,
            gaming: false,
        }
    }

    #[test]
    fn test_classify_thresholds() {
        assert_eq!(classify(&sample(80, 0, 0, 0)), Behavior::CpuBound);
        assert_eq!(classify(&sample(79, 0, 0, 0)), Behavior::Unknown);
        assert_eq!(classify(&sample(10, 50, 0, 0)), Behavior::IoBound);
        assert_eq!(classify(&sample(10, 10, 4, 2)), Behavior::Interactive);
        assert_eq!(classify(&sample(10, 10, 3, 2)), Behavior::Unknown);
        // CPU-bound wins over a voluntary-heavy switch pattern
        assert_eq!(classify(&sample(90, 0, 5, 0)), Behavior::CpuBound);

        let gaming = WindowSample {
            gaming: true,
            ..sample(10, 0, 0, 0)
        };
        assert_eq!(classify(&gaming), Behavior::Gaming);
        assert_eq!(classify(&WindowSample::default()), Behavior::Unknown);
    }

    #[test]
    fn test_priority_nudges_are_bounded() {
        let mut prio = 0;
        for _ in 0..20 {
            prio = adjust_priority(prio, Behavior::Interactive);
        }
        assert_eq!(prio, INTERACTIVE_PRIO_FLOOR);
        assert_eq!(adjust_priority(-10, Behavior::Interactive), -10);
        assert_eq!(adjust_priority(0, Behavior::IoBound), -1);
        assert_eq!(adjust_priority(-2, Behavior::IoBound), -2);
        assert_eq!(adjust_priority(10, Behavior::CpuBound), 10);
        assert_eq!(adjust_priority(3, Behavior::CpuBound), 4);
        assert_eq!(adjust_priority(5, Behavior::Gaming), NICE_MIN);
        assert_eq!(adjust_priority(5, Behavior::Unknown), 5);
    }

    #[test]
    fn test_update_waits_for_full_window() {
        let mut e = SchedEntity::new(TaskId(1), &SchedAttrs::default(), NS_PER_MS, 0);
        e.clear_wait(0);
        e.charge_runtime(5 * NS_PER_MS);
        assert!(update(&mut e, 5 * NS_PER_MS, 10 * NS_PER_MS).is_none());
    }

    #[test]
    fn test_hog_needs_consecutive_windows() {
        let mut e = SchedEntity::new(TaskId(1), &SchedAttrs::default(), NS_PER_MS, 0);
        e.clear_wait(0);
        let window = 10 * NS_PER_MS;

        e.charge_runtime(window);
        let first = update(&mut e, window, window).unwrap();
        assert_eq!(first.behavior, Behavior::CpuBound);
        assert!(!first.hog);
        assert_eq!(e.priority(), 1);

        e.charge_runtime(window);
        let second = update(&mut e, 2 * window, window).unwrap();
        assert!(second.hog);
        assert_eq!(e.class(), SchedClass::Normal);

        // A quiet window breaks the streak
        e.set_wait_start(2 * window);
        let third = update(&mut e, 3 * window, window).unwrap();
        assert_eq!(third.behavior, Behavior::Unknown);
        assert!(!third.hog);
    }

    #[test]
    fn test_io_bound_from_blocked_interval() {
        let mut e = SchedEntity::new(TaskId(2), &SchedAttrs::default(), NS_PER_MS, 0);
        e.clear_wait(0);
        e.charge_runtime(NS_PER_MS);
        e.begin_block(NS_PER_MS, true);
        e.clear_wait(9 * NS_PER_MS);
        let res = update(&mut e, 10 * NS_PER_MS, 10 * NS_PER_MS).unwrap();
        assert_eq!(res.behavior, Behavior::IoBound);
        assert_eq!(e.priority(), -1);
        assert!(e.io_wait_pct() > 0);
    }

    #[test]
    fn test_boost_shields_priority() {
        let mut e = SchedEntity::new(TaskId(3), &SchedAttrs::default(), NS_PER_MS, 0);
        e.clear_wait(0);
        e.apply_boost(-10, 50 * NS_PER_MS);
        e.charge_runtime(10 * NS_PER_MS);
        update(&mut e, 10 * NS_PER_MS, 10 * NS_PER_MS).unwrap();
        assert_eq!(e.priority(), -10);
        e.charge_runtime(50 * NS_PER_MS);
        update(&mut e, 60 * NS_PER_MS, 10 * NS_PER_MS).unwrap();
        assert_eq!(e.priority(), -9);
    }
}
