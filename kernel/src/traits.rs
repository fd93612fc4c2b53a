//! # Scheduler Abstraction Traits
//!
//! The scheduler core does not measure the machine itself. Capacities,
//! frequencies, fair-class utilization, idle states and per-task policy
//! attributes come from the platform through [`Platform`]; power costs come
//! from an optional [`EnergyModel`].
//!
//! ## Testing Strategy
//!
//! Tests and the simulator inject [`crate::platform::PlatformModel`], a
//! fully software-controlled implementation, and inspect the decisions it
//! records.

use crate::sched::TaskId;
use crate::trace::TraceEvent;

/// Capacity and utilization oracle.
///
/// Every method may be called with or without run-queue locks held and must
/// not block.
pub trait Platform: Send + Sync + 'static {
    /// Monotonic clock in nanoseconds
    fn now(&self) -> u64;

    /// Capacity currently available to tasks on `cpu` (after RT/IRQ pressure)
    fn capacity_of(&self, cpu: usize) -> u64;

    /// Capacity of `cpu` at its current frequency
    fn capacity_curr_of(&self, cpu: usize) -> u64;

    /// Decayed fair-class utilization of `cpu`
    fn cpu_util(&self, cpu: usize) -> u64;

    /// Whether `cpu` is idle
    fn idle_cpu(&self, cpu: usize) -> bool;

    /// Idle state depth of `cpu`; negative when running
    fn idle_state_idx(&self, cpu: usize) -> i32;

    /// Whether `cpu` is already past its utilization margin
    fn is_overutilized(&self, cpu: usize) -> bool;

    /// Whether `cpu` would pass its utilization margin at `util`
    fn would_overutilize(&self, cpu: usize, util: u64) -> bool;

    /// System-wide performance boost
    fn global_boosted(&self) -> bool;

    /// Estimated fair-class utilization of a task
    fn task_util_est(&self, task: TaskId) -> u64;

    /// Boost percentage of a task's group (0..=100, negative de-boosts)
    fn task_boost(&self, task: TaskId) -> i32;

    fn prefer_idle(&self, task: TaskId) -> bool;

    fn prefer_perf(&self, task: TaskId) -> bool;

    /// Service-class attribute steering a task to the fastest tier
    fn prefer_high_cap(&self, task: TaskId) -> bool;

    /// Whether the task is the foreground (on-top) task
    fn task_on_top(&self, task: TaskId) -> bool;

    /// Whether the task belongs to the top-app group
    fn task_top_app(&self, task: TaskId) -> bool;

    /// Frequency scale of `cpu` in `0..=1024`
    fn freq_scale(&self, cpu: usize) -> u64 {
        let _ = cpu;
        crate::sched::pelt::SCHED_CAPACITY_SCALE
    }

    /// Sink for structured scheduling decisions
    fn record(&self, event: TraceEvent) {
        let _ = event;
    }
}

/// Energy cost oracle.
pub trait EnergyModel: Send + Sync {
    /// Energy spent by `cpu` over one period when running at `util`, or
    /// `None` when the CPU has no table.
    fn compute_energy(&self, cpu: usize, util: u64) -> Option<u64>;
}
