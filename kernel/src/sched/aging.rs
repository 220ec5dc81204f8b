//! Aging and demotion
//!
//! Aging keeps low levels from starving: every sweep promotes entities
//! that have waited past the aging threshold by exactly one level. Those
//! past the starvation threshold are promoted the same way but counted and
//! reported as starving. Levels are swept top-down (L1 first), and a
//! promoted entity lands in a level the sweep has already finished, so
//! nothing is promoted twice per sweep.
//!
//! Demotion moves an entity whose quantum ran out (or a persistent CPU
//! hog) one level down with the longer quantum of its new level.

use super::{
    clock::elapsed,
    config::{SchedConfig, MLFQ_LOWEST},
    metrics::SchedulerMetrics,
    queue::Band,
    runqueue::RunQueue,
    task::SchedEntity,
};
use crate::error::SchedResult;

/// Result of one aging sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AgingReport {
    /// One-level promotions, starving entities included
    pub promoted: usize,
    /// Promotions of entities that waited past the starvation threshold
    pub starving: usize,
}

/// Move an entity one MLFQ level down and refill its quantum for the new
/// level. Returns false (quantum still refilled) when already at the
/// lowest level.
pub fn demote(entity: &mut SchedEntity, config: &SchedConfig) -> bool {
    let level = entity.level();
    if level >= MLFQ_LOWEST {
        entity.reset_quantum(config.quantum(level));
        return false;
    }
    entity.set_level(level + 1);
    entity.reset_quantum(config.quantum(level + 1));
    entity.record_demotion();
    log::debug!("{} demoted to L{}", entity.task(), level + 1);
    true
}

impl RunQueue {
    /// Run one aging sweep over MLFQ levels 1 through 4.
    pub fn age(
        &mut self,
        now: u64,
        config: &SchedConfig,
        gaming_enabled: bool,
        metrics: &SchedulerMetrics,
    ) -> SchedResult<AgingReport> {
        let mut report = AgingReport::default();
        for level in 1..=MLFQ_LOWEST {
            let mut at = self.band(Band::Mlfq(level)).front();
            while let Some(slot) = at {
                let entity = self.entity(slot)?;
                at = entity.link.next();
                let waited = entity.wait_start().map_or(0, |start| elapsed(start, now));
                if waited < config.aging_threshold_ns {
                    continue;
                }

                let starving = waited >= config.starvation_threshold_ns;
                let target = level - 1;
                self.remove(slot)?;
                let entity = self.entity_mut(slot)?;
                entity.set_level(target);
                entity.reset_quantum(config.quantum(target));
                entity.record_boost();
                log::trace!(
                    "{} aged L{} -> L{} after {}ns",
                    entity.task(),
                    level,
                    target,
                    waited
                );
                self.enqueue_slot(slot, now, gaming_enabled)?;

                metrics.record_promotion(starving);
                report.promoted += 1;
                if starving {
                    report.starving += 1;
                }
            }
        }
        if report.starving > 0 {
            log::warn!(
                "cpu{}: promoted {} starving entities",
                self.cpu(),
                report.starving
            );
        }
        Ok(report)
    }
}
