//! RaeenOS Kernel Library
//!
//! This library provides the process scheduler core of the RaeenOS kernel:
//! per-CPU multi-level feedback queues with a gaming fast path, real-time
//! deadline scheduling, aging, behavior feedback and cross-CPU load
//! balancing. Everything below the scheduler (context switching, timer
//! programming, paging) is provided by the embedding kernel.

#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod error;
pub mod sched;

pub use error::{SchedError, SchedResult};
// Re-export scheduler items for tests
pub use sched::{
    CpuId, CpuSet, Dispatch, ManualClock, SchedAttrs, SchedClass, SchedConfig, Scheduler, TaskId,
};
