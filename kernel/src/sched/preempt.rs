//! Preemption arbiter
//!
//! A pure decision over two summaries: the running entity and the best
//! queued candidate. Callers build the summaries with the effective class,
//! so a gaming-class entity outside gaming mode compares as interactive.

use super::{
    runqueue::RunQueue,
    task::{SchedClass, SchedEntity},
};
use crate::error::SchedResult;

/// What the arbiter needs to know about one entity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub class: SchedClass,
    pub level: u8,
    pub quantum_remaining_ns: u64,
    pub deadline_ns: Option<u64>,
}

impl Candidate {
    pub fn of(entity: &SchedEntity, gaming_enabled: bool) -> Self {
        Self {
            class: entity.effective_class(gaming_enabled),
            level: entity.level(),
            quantum_remaining_ns: entity.quantum_remaining(),
            deadline_ns: entity.deadline(),
        }
    }
}

/// Whether `candidate` should displace `current`.
///
/// Gaming entities are cooperative among themselves, and real-time
/// entities compare by deadline only. Level and quantum only matter
/// between MLFQ entities of the same class.
pub fn should_preempt(current: &Candidate, candidate: &Candidate) -> bool {
    if candidate.class != current.class {
        return candidate.class < current.class;
    }
    match current.class {
        SchedClass::Gaming => false,
        SchedClass::RealTime => match (candidate.deadline_ns, current.deadline_ns) {
            (Some(theirs), Some(ours)) => theirs < ours,
            _ => false,
        },
        _ => {
            candidate.level < current.level
                || (candidate.level == current.level && current.quantum_remaining_ns == 0)
        }
    }
}

impl RunQueue {
    /// Request a reschedule if `candidate`, just queued here, should run
    /// before the current entity. An idle CPU always reschedules.
    pub fn arbitrate(&mut self, candidate: &Candidate, gaming_enabled: bool) -> SchedResult<bool> {
        let preempt = match self.current() {
            Some(slot) => should_preempt(&Candidate::of(self.entity(slot)?, gaming_enabled), candidate),
            None => true,
        };
        if preempt {
            self.set_need_resched();
        }
        Ok(preempt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c(class: SchedClass, level: u8, quantum: u64, deadline: Option<u64>) -> Candidate {
        Candidate {
            class,
            level,
            quantum_remaining_ns: quantum,
            deadline_ns: deadline,
        }
    }

    #[test]
    fn test_class_wins() {
        let normal = c(SchedClass::Normal, 0, 5, None);
        let gaming = c(SchedClass::Gaming, 4, 5, None);
        let background = c(SchedClass::Background, 0, 0, None);
        assert!(should_preempt(&normal, &gaming));
        assert!(!should_preempt(&gaming, &normal));
        assert!(!should_preempt(&normal, &background));
        assert!(should_preempt(
            &normal,
            &c(SchedClass::RealTime, 0, 5, Some(100))
        ));
    }

    #[test]
    fn test_level_and_quantum() {
        let current = c(SchedClass::Normal, 2, 3, None);
        assert!(should_preempt(&current, &c(SchedClass::Normal, 1, 4, None)));
        assert!(!should_preempt(&current, &c(SchedClass::Normal, 2, 4, None)));
        assert!(!should_preempt(&current, &c(SchedClass::Normal, 3, 8, None)));
        let expired = c(SchedClass::Normal, 2, 0, None);
        assert!(should_preempt(&expired, &c(SchedClass::Normal, 2, 4, None)));
        assert!(!should_preempt(&expired, &c(SchedClass::Normal, 3, 8, None)));
    }

    #[test]
    fn test_deadline_among_real_time() {
        let current = c(SchedClass::RealTime, 0, 1, Some(200));
        assert!(should_preempt(&current, &c(SchedClass::RealTime, 0, 1, Some(100))));
        assert!(!should_preempt(&current, &c(SchedClass::RealTime, 0, 1, Some(200))));
        assert!(!should_preempt(&current, &c(SchedClass::RealTime, 0, 1, Some(300))));
    }

    #[test]
    fn test_gaming_is_cooperative() {
        let current = c(SchedClass::Gaming, 3, 0, None);
        assert!(!should_preempt(&current, &c(SchedClass::Gaming, 0, 1, None)));
    }
}
