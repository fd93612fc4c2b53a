//! Scheduling class interface
//!
//! Each task belongs to exactly one class, chosen by its effective
//! priority. Classes are consulted in priority order (`ClassKind::Rt`
//! before `ClassKind::Fair`); an empty chain means the CPU idles.

use super::rq::{Rq, RqGuard};
use super::task::{TaskId, TaskSnapshot};
use super::Scheduler;
use crate::traits::Platform;
use bitflags::bitflags;

bitflags! {
    /// Flags for [`SchedClass::enqueue_task`].
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct EnqueueFlags: u32 {
        /// Task is waking up
        const WAKEUP = 0x01;
        /// Re-enqueue after a `DequeueFlags::SAVE` dequeue
        const RESTORE = 0x02;
        /// Priority or class changed; relink the entity
        const MOVE = 0x04;
        /// Insert at the head of its priority list
        const HEAD = 0x10;
        /// Task arrived from another CPU
        const MIGRATED = 0x40;
    }
}

bitflags! {
    /// Flags for [`SchedClass::dequeue_task`].
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct DequeueFlags: u32 {
        /// Task is going to sleep
        const SLEEP = 0x01;
        /// Attributes are changing; a `RESTORE` enqueue follows
        const SAVE = 0x02;
        /// Priority or class changed; relink the entity
        const MOVE = 0x04;
    }
}

bitflags! {
    /// Wake-up context.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct WakeFlags: u32 {
        /// Waker is about to sleep
        const SYNC = 0x01;
        /// First wake-up after spawn
        const FORK = 0x02;
        /// Task was moved to a new CPU by this wake-up
        const MIGRATED = 0x04;
    }
}

bitflags! {
    /// Deferred balance work queued on a run-queue.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct BalanceCallbacks: u8 {
        const PUSH = 0x01;
        const PULL = 0x02;
    }
}

/// Whether a SAVE/RESTORE pair relinks the entity.
#[inline]
pub fn move_entity(save_or_restore: bool, move_flag: bool) -> bool {
    !save_or_restore || move_flag
}

/// Kind of CPU selection being made.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SdFlag {
    /// Wake-up of a sleeping task
    Wake,
    /// First placement of a new task
    Fork,
    /// Placement after exec
    Exec,
}

/// The polymorphic per-class contract.
///
/// Every method except `select_task_rq` runs with the run-queue lock held
/// and must not block.
pub trait SchedClass<P: Platform> {
    /// Make `p` runnable on `rq`.
    fn enqueue_task(&self, s: &Scheduler<P>, rq: &mut Rq, p: TaskId, flags: EnqueueFlags);

    /// Remove `p` from the runnable set of `rq`.
    fn dequeue_task(&self, s: &Scheduler<P>, rq: &mut Rq, p: TaskId, flags: DequeueFlags);

    /// The running task gives up the CPU to its peers.
    fn yield_task(&self, s: &Scheduler<P>, rq: &mut Rq);

    /// Whether `p`, just made runnable, should preempt the running task of
    /// the same class.
    fn check_preempt_curr(&self, s: &Scheduler<P>, rq: &mut Rq, p: TaskId, flags: WakeFlags);

    /// Pull work before a pick. May drop and retake the run-queue lock.
    fn balance<'a>(
        &self,
        s: &'a Scheduler<P>,
        rq: RqGuard<'a>,
        prev: Option<TaskId>,
    ) -> RqGuard<'a> {
        let _ = (s, prev);
        rq
    }

    /// Choose the next task of this class, making it current.
    fn pick_next_task(&self, s: &Scheduler<P>, rq: &mut Rq) -> Option<TaskId>;

    /// `prev` stops being the running task.
    fn put_prev_task(&self, s: &Scheduler<P>, rq: &mut Rq, prev: TaskId);

    /// `rq.curr` changed class or attributes while running.
    fn set_curr_task(&self, s: &Scheduler<P>, rq: &mut Rq);

    /// Periodic tick for the running task.
    fn task_tick(&self, s: &Scheduler<P>, rq: &mut Rq, curr: TaskId, queued: bool);

    /// Length of the task's round-robin slice in ns, 0 if it has none.
    fn get_rr_interval(&self, s: &Scheduler<P>, rq: &Rq, p: TaskId) -> u64;

    fn prio_changed(&self, s: &Scheduler<P>, rq: &mut Rq, p: TaskId, old_prio: u32);

    /// `p` is leaving this class.
    fn switched_from(&self, s: &Scheduler<P>, rq: &mut Rq, p: TaskId);

    /// `p` has entered this class.
    fn switched_to(&self, s: &Scheduler<P>, rq: &mut Rq, p: TaskId);

    /// Choose a CPU for `p`. Runs without any run-queue lock held.
    fn select_task_rq(
        &self,
        s: &Scheduler<P>,
        p: &TaskSnapshot,
        cpu: usize,
        sd_flag: SdFlag,
        flags: WakeFlags,
    ) -> usize;

    /// `p` is leaving `rq` for `new_cpu`.
    fn migrate_task_rq(&self, s: &Scheduler<P>, rq: &mut Rq, p: TaskId, new_cpu: usize) {
        let _ = (s, rq, p, new_cpu);
    }

    /// `p` has exited.
    fn task_dead(&self, s: &Scheduler<P>, rq: &mut Rq, p: TaskId) {
        let _ = (s, rq, p);
    }

    /// Affinity of `p` changed while homed on `rq`.
    fn set_cpus_allowed(&self, s: &Scheduler<P>, rq: &mut Rq, p: TaskId) {
        let _ = (s, rq, p);
    }

    fn rq_online(&self, s: &Scheduler<P>, rq: &mut Rq) {
        let _ = (s, rq);
    }

    fn rq_offline(&self, s: &Scheduler<P>, rq: &mut Rq) {
        let _ = (s, rq);
    }

    /// `p` was woken onto `rq` and did not preempt.
    fn task_woken(&self, s: &Scheduler<P>, rq: &mut Rq, p: TaskId) {
        let _ = (s, rq, p);
    }

    /// Charge the running task's elapsed time.
    fn update_curr(&self, s: &Scheduler<P>, rq: &mut Rq);
}
