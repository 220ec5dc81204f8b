//! Gaming mode
//!
//! A global master switch plus per-entity opt-in. The gaming band of every
//! runqueue only participates while the switch is on, and only entities of
//! class `Gaming` that carry the gaming flag are placed in it. While the
//! switch is on, frequency hints never drop below the configured minimum.

use core::sync::atomic::{AtomicBool, Ordering};

use spin::RwLock;

use super::{
    queue::Band,
    runqueue::RunQueue,
    task::{SchedClass, NICE_MAX, NICE_MIN},
};
use crate::error::{SchedError, SchedResult};

/// Gaming mode parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GamingConfig {
    /// Target frame rate
    pub frame_rate_target: u32,
    /// Priority applied by a gaming boost
    pub input_boost_priority: i8,
    /// How long a boost shields the priority from behavior feedback
    pub input_boost_duration_ns: u64,
    /// Frequency floor while gaming mode is on
    pub min_cpu_frequency_mhz: u32,
}

impl Default for GamingConfig {
    fn default() -> Self {
        Self {
            frame_rate_target: 60,
            input_boost_priority: -10,
            input_boost_duration_ns: 16_666_666,
            min_cpu_frequency_mhz: 3000,
        }
    }
}

impl GamingConfig {
    /// CPU time available per frame at the target rate.
    pub fn frame_budget_ns(&self) -> u64 {
        if self.frame_rate_target == 0 {
            0
        } else {
            1_000_000_000 / u64::from(self.frame_rate_target)
        }
    }

    pub fn validate(&self) -> SchedResult<()> {
        if self.frame_rate_target == 0 {
            return Err(SchedError::InvalidArgument {
                name: "frame_rate_target",
                reason: "must be non-zero",
            });
        }
        if !(NICE_MIN..=NICE_MAX).contains(&self.input_boost_priority) {
            return Err(SchedError::InvalidArgument {
                name: "input_boost_priority",
                reason: "outside the nice range",
            });
        }
        Ok(())
    }
}

/// Global gaming state
#[derive(Debug, Default)]
pub struct GamingControl {
    enabled: AtomicBool,
    config: RwLock<GamingConfig>,
}

impl GamingControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Flip the master switch, returning the previous state.
    pub fn set_enabled(&self, enabled: bool) -> bool {
        let was = self.enabled.swap(enabled, Ordering::AcqRel);
        if was != enabled {
            log::info!(
                "Gaming mode {}",
                if enabled { "enabled" } else { "disabled" }
            );
        }
        was
    }

    pub fn config(&self) -> GamingConfig {
        *self.config.read()
    }

    pub fn configure(&self, config: GamingConfig) -> SchedResult<()> {
        config.validate()?;
        *self.config.write() = config;
        log::info!(
            "Gaming mode configured: {} fps, {}ns frame budget",
            config.frame_rate_target,
            config.frame_budget_ns()
        );
        Ok(())
    }

    /// Frequency floor to apply, if gaming mode is on.
    pub fn frequency_floor(&self) -> Option<u32> {
        self.is_enabled()
            .then(|| self.config.read().min_cpu_frequency_mhz)
    }
}

impl RunQueue {
    /// Move queued entities between the gaming band and the MLFQ after the
    /// master switch flipped. Returns how many entities moved.
    pub fn rebucket_gaming(&mut self, now: u64, gaming_enabled: bool) -> SchedResult<usize> {
        let mut moved = 0;
        for band in Band::ALL {
            let source = match band {
                Band::Gaming => !gaming_enabled,
                Band::RealTime => false,
                Band::Mlfq(_) => gaming_enabled,
            };
            if !source {
                continue;
            }
            let mut at = self.band(band).front();
            while let Some(slot) = at {
                let entity = self.entity(slot)?;
                at = entity.link.next();
                if Self::band_for(entity, gaming_enabled) == band {
                    continue;
                }
                self.remove(slot)?;
                self.enqueue_slot(slot, now, gaming_enabled)?;
                moved += 1;
            }
        }

        let running_gaming = match self.current() {
            Some(slot) => self.entity(slot)?.class() == SchedClass::Gaming,
            None => false,
        };
        if moved > 0 || running_gaming {
            self.set_need_resched();
        }
        Ok(moved)
    }
}
