//! Ontime migration
//!
//! A task whose estimated utilization reaches the up threshold is pinned
//! to the performance tier until it decays below the down threshold. The
//! gap between the two keeps a task near the boundary from bouncing.

use super::PlacementEnv;
use crate::error::{Result, SchedError};
use crate::sched::{Scheduler, TaskId};
use crate::sync::OntimeLock;
use crate::traits::Platform;
use core::sync::atomic::{AtomicU64, Ordering};
use hashbrown::HashSet;

pub const DEFAULT_ONTIME_UP: u64 = 400;
pub const DEFAULT_ONTIME_DOWN: u64 = 300;

/// Ontime classification of tasks.
///
/// The task set is the innermost lock: it is only taken with no run-queue
/// lock held.
pub struct Ontime {
    up: AtomicU64,
    down: AtomicU64,
    tasks: OntimeLock<HashSet<TaskId>>,
}

impl Ontime {
    pub fn new(up: u64, down: u64) -> Result<Self> {
        if down > up {
            return Err(SchedError::InvalidThreshold { up, down });
        }
        Ok(Self {
            up: AtomicU64::new(up),
            down: AtomicU64::new(down),
            tasks: OntimeLock::new(HashSet::new(), "ontime"),
        })
    }

    /// `(up, down)` thresholds.
    pub fn thresholds(&self) -> (u64, u64) {
        (self.up.load(Ordering::Relaxed), self.down.load(Ordering::Relaxed))
    }

    pub fn set_thresholds(&self, up: u64, down: u64) -> Result<()> {
        if down > up {
            return Err(SchedError::InvalidThreshold { up, down });
        }
        self.up.store(up, Ordering::Relaxed);
        self.down.store(down, Ordering::Relaxed);
        Ok(())
    }

    pub fn is_ontime(&self, task: TaskId) -> bool {
        self.tasks.lock().contains(&task)
    }

    /// Reclassify `task` at `util`; returns whether it is ontime after.
    pub fn update(&self, task: TaskId, util: u64) -> bool {
        let (up, down) = self.thresholds();
        let mut tasks = self.tasks.lock();
        if tasks.contains(&task) {
            if util < down {
                tasks.remove(&task);
                log::debug!(target: "nyx_sched::wakeup", "task {} leaves ontime at util {}", task, util);
                return false;
            }
            return true;
        }
        if util >= up {
            tasks.insert(task);
            log::debug!(target: "nyx_sched::wakeup", "task {} becomes ontime at util {}", task, util);
            return true;
        }
        false
    }

    pub fn forget(&self, task: TaskId) {
        self.tasks.lock().remove(&task);
    }
}

impl Default for Ontime {
    fn default() -> Self {
        Self {
            up: AtomicU64::new(DEFAULT_ONTIME_UP),
            down: AtomicU64::new(DEFAULT_ONTIME_DOWN),
            tasks: OntimeLock::new(HashSet::new(), "ontime"),
        }
    }
}

impl<P: Platform> Scheduler<P> {
    pub(super) fn ontime_task_wakeup(&self, env: &PlacementEnv<'_>) -> Option<usize> {
        if !self.ontime.update(env.p.id, env.task_util) {
            return None;
        }
        self.select_perf_cpu(env)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hysteresis() {
        let ontime = Ontime::new(400, 300).unwrap();
        let t = TaskId(1);
        assert!(!ontime.update(t, 399));
        assert!(ontime.update(t, 400));
        // Between the thresholds it stays pinned.
        assert!(ontime.update(t, 350));
        assert!(ontime.update(t, 300));
        assert!(!ontime.update(t, 299));
        assert!(!ontime.is_ontime(t));
    }

    #[test]
    fn test_idempotent_for_equal_util() {
        let ontime = Ontime::default();
        let t = TaskId(2);
        let first = ontime.update(t, 450);
        assert_eq!(ontime.update(t, 450), first);
        assert_eq!(ontime.update(t, 450), first);
    }

    #[test]
    fn test_threshold_validation() {
        assert_eq!(
            Ontime::new(100, 200).err(),
            Some(SchedError::InvalidThreshold { up: 100, down: 200 })
        );
        let ontime = Ontime::default();
        assert!(ontime.set_thresholds(10, 20).is_err());
        assert_eq!(ontime.thresholds(), (DEFAULT_ONTIME_UP, DEFAULT_ONTIME_DOWN));
        ontime.set_thresholds(20, 10).unwrap();
        assert_eq!(ontime.thresholds(), (20, 10));
    }

    #[test]
    fn test_forget() {
        let ontime = Ontime::default();
        ontime.update(TaskId(3), 1000);
        ontime.forget(TaskId(3));
        assert!(!ontime.is_ontime(TaskId(3)));
    }
}
