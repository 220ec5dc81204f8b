//! Process and thread scheduling module
//!
//! Implements a per-CPU multi-level scheduler with support for:
//! - A five-level feedback queue with aging and hog demotion
//! - A gaming band gated by a global switch
//! - Deadline-ordered real-time scheduling under a bandwidth budget
//! - Behavior classification feeding dynamic priority
//! - SMP load balancing with CPU affinity and NUMA preference
//!
//! Context switching itself belongs to the architecture layer: the
//! scheduler only tells the dispatcher which task to run next.

pub mod aging;
pub mod behavior;
pub mod clock;
pub mod config;
pub mod gaming;
pub mod load_balance;
pub mod metrics;
pub mod numa;
pub mod pick;
pub mod power;
pub mod preempt;
pub mod queue;
pub mod rt_bandwidth;
pub mod runqueue;
pub mod scheduler;
pub mod task;
pub mod tick;

// Re-export common types
pub use clock::{Clock, ManualClock};
pub use config::SchedConfig;
pub use gaming::GamingConfig;
pub use load_balance::Migration;
pub use metrics::SchedSnapshot;
pub use pick::Dispatch;
pub use runqueue::RunQueueInfo;
pub use scheduler::Scheduler;
pub use task::{
    Behavior, CpuId, CpuSet, EntityFlags, EntityInfo, EntityState, RtParams, SchedAttrs,
    SchedClass, TaskId,
};
pub use tick::ExecMode;
