//! Scheduler error types
//!
//! Recoverable API misuse is reported through [`SchedError`]. Conditions that
//! can only arise from corrupted scheduler state go through [`sched_bug!`]
//! instead, which logs and halts.

use crate::sched::TaskId;

/// Errors returned by the public scheduler API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedError {
    #[error("cpu {0} does not exist")]
    InvalidCpu(usize),

    #[error("cpu {0} is offline")]
    CpuOffline(usize),

    #[error("no such task: {0}")]
    NoSuchTask(TaskId),

    #[error("priority {0} is out of range for the requested policy")]
    InvalidPriority(i32),

    #[error("affinity mask contains no active cpu")]
    EmptyAffinity,

    #[error("rt period must be positive")]
    InvalidPeriod,

    #[error("rt runtime must be -1 (unlimited) or non-negative")]
    InvalidRuntime,

    #[error("rt runtime {runtime}us exceeds period {period}us")]
    RuntimeExceedsPeriod { runtime: u64, period: u64 },

    #[error("no coregroup with index {0}")]
    NoSuchCoregroup(usize),

    #[error("tick length must be positive")]
    InvalidTick,

    #[error("ontime down threshold {down} is above up threshold {up}")]
    InvalidThreshold { up: u64, down: u64 },

    #[error("invalid topology: {0}")]
    InvalidTopology(&'static str),
}

/// Result alias for scheduler operations.
pub type Result<T> = core::result::Result<T, SchedError>;

/// Report a violated scheduler invariant and halt.
macro_rules! sched_bug {
    ($($arg:tt)*) => {{
        log::error!(target: "nyx_sched::bug", $($arg)*);
        panic!($($arg)*)
    }};
}

/// `sched_bug!` when `cond` holds.
macro_rules! sched_bug_on {
    ($cond:expr, $($arg:tt)*) => {
        if $cond {
            sched_bug!($($arg)*);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn test_error_messages() {
        assert_eq!(SchedError::InvalidCpu(9).to_string(), "cpu 9 does not exist");
        assert_eq!(
            SchedError::RuntimeExceedsPeriod { runtime: 20, period: 10 }.to_string(),
            "rt runtime 20us exceeds period 10us"
        );
        assert_eq!(SchedError::NoSuchTask(TaskId(7)).to_string(), "no such task: 7");
    }

    #[test]
    #[should_panic(expected = "corrupt")]
    fn test_sched_bug_panics() {
        sched_bug_on!(1 + 1 == 2, "corrupt {}", "state");
    }
}
