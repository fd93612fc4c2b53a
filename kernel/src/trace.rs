//! Structured scheduling decisions
//!
//! Every placement decision and every bandwidth/migration state change is
//! emitted as a [`TraceEvent`]: logged at trace level and handed to
//! [`Platform::record`].

use crate::sched::TaskId;
use crate::traits::Platform;

/// A scheduling decision or state change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TraceEvent {
    /// Result of the fair-class wakeup balancer
    WakeupBalance {
        task: TaskId,
        cpu: Option<usize>,
        state: &'static str,
    },
    /// Result of the prefer-idle selection
    SelectIdle {
        task: TaskId,
        cpu: Option<usize>,
        state: &'static str,
    },
    /// Result of the balanced fallback selection
    SelectProper {
        task: TaskId,
        cpu: Option<usize>,
        util: u64,
    },
    /// Result of fluid RT placement
    FluidStat {
        task: TaskId,
        cpu: Option<usize>,
        util: u64,
        state: &'static str,
    },
    /// Activated-CPU mask update
    FluidActivated {
        coregroup: usize,
        util_sum: u64,
        active_thr: u64,
        mask: u64,
    },
    /// A run-queue was throttled
    RtThrottle {
        cpu: usize,
        rt_time: u64,
        runtime: u64,
    },
    /// A queued RT task moved between CPUs
    Migrate {
        task: TaskId,
        from: usize,
        to: usize,
        reason: &'static str,
    },
}

impl TraceEvent {
    /// Task the event concerns, if any.
    pub fn task(&self) -> Option<TaskId> {
        match *self {
            TraceEvent::WakeupBalance { task, .. }
            | TraceEvent::SelectIdle { task, .. }
            | TraceEvent::SelectProper { task, .. }
            | TraceEvent::FluidStat { task, .. }
            | TraceEvent::Migrate { task, .. } => Some(task),
            TraceEvent::FluidActivated { .. } | TraceEvent::RtThrottle { .. } => None,
        }
    }

    /// Strategy label, if the event carries one.
    pub fn state(&self) -> Option<&'static str> {
        match *self {
            TraceEvent::WakeupBalance { state, .. }
            | TraceEvent::SelectIdle { state, .. }
            | TraceEvent::FluidStat { state, .. } => Some(state),
            TraceEvent::Migrate { reason, .. } => Some(reason),
            _ => None,
        }
    }

    /// Chosen CPU, if the event carries one.
    pub fn cpu(&self) -> Option<usize> {
        match *self {
            TraceEvent::WakeupBalance { cpu, .. }
            | TraceEvent::SelectIdle { cpu, .. }
            | TraceEvent::SelectProper { cpu, .. }
            | TraceEvent::FluidStat { cpu, .. } => cpu,
            TraceEvent::RtThrottle { cpu, .. } => Some(cpu),
            TraceEvent::Migrate { to, .. } => Some(to),
            TraceEvent::FluidActivated { .. } => None,
        }
    }
}

/// Log `event` and pass it to the platform.
pub(crate) fn emit<P: Platform + ?Sized>(platform: &P, event: TraceEvent) {
    log::trace!(target: "nyx_sched::trace", "{:?}", event);
    platform.record(event);
}
