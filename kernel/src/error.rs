//! Error types for the RaeenOS scheduler core
//!
//! Every fallible facade operation returns a [`SchedResult`]. The scheduler
//! never recovers from an error by silently placing a task somewhere else:
//! either the operation happens as requested or the caller is told why not.

use core::fmt;

/// Scheduler error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    /// Malformed argument (empty affinity, bad RT attributes, bad CPU id)
    InvalidArgument {
        name: &'static str,
        reason: &'static str,
    },
    /// The task id has no scheduling entity
    UnknownTask {
        id: u64,
    },
    /// Per-CPU slot table or entity storage exhausted; the caller should
    /// back off and retry
    OutOfCapacity {
        resource: &'static str,
    },
    /// The task is already blocked (or was never made runnable)
    NotRunnable {
        id: u64,
    },
    /// The load balancer re-entry guard tripped
    WouldDeadlock,
    /// A runqueue invariant was found broken (release builds only; debug
    /// builds halt instead)
    Corrupted {
        what: &'static str,
    },
}

impl SchedError {
    /// Whether this error belongs to the invalid-argument family.
    ///
    /// Unknown tasks are reported with their id for diagnostics, but callers
    /// treat them exactly like any other invalid argument.
    pub fn is_invalid_argument(&self) -> bool {
        matches!(
            self,
            Self::InvalidArgument { .. } | Self::UnknownTask { .. }
        )
    }
}

/// Result type alias for scheduler operations
pub type SchedResult<T> = Result<T, SchedError>;

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument { name, reason } => {
                write!(f, "Invalid argument '{}': {}", name, reason)
            }
            Self::UnknownTask { id } => write!(f, "Task {} has no scheduling entity", id),
            Self::OutOfCapacity { resource } => write!(f, "Out of capacity: {}", resource),
            Self::NotRunnable { id } => write!(f, "Task {} is not runnable", id),
            Self::WouldDeadlock => write!(f, "Load balancer re-entered while already running"),
            Self::Corrupted { what } => write!(f, "Scheduler state corrupted: {}", what),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_task_is_invalid_argument() {
        assert!(SchedError::UnknownTask { id: 7 }.is_invalid_argument());
        assert!(SchedError::InvalidArgument {
            name: "affinity",
            reason: "empty mask"
        }
        .is_invalid_argument());
        assert!(!SchedError::WouldDeadlock.is_invalid_argument());
        assert!(!SchedError::NotRunnable { id: 1 }.is_invalid_argument());
    }

    #[test]
    fn test_display() {
        use std::string::ToString;

        let err = SchedError::OutOfCapacity {
            resource: "runqueue slots",
        };
        assert_eq!(err.to_string(), "Out of capacity: runqueue slots");
    }
}
