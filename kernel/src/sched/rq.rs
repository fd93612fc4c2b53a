//! Per-CPU run-queues
//!
//! [`Rq`] is the state a CPU mutates under its own lock. [`RqStat`] is the
//! subset other CPUs read without taking that lock: it is republished at
//! the end of every locked section and may be stale by the time a remote
//! reader acts on it.

use super::class::BalanceCallbacks;
use super::fair::FairRq;
use super::rt::RtRq;
use super::task::{Task, TaskId, MAX_PRIO, MAX_RT_PRIO};
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use hashbrown::HashMap;

/// Tasks homed on a CPU, by id.
pub type TaskTable = HashMap<TaskId, Task>;

/// Guard over a locked run-queue.
pub type RqGuard<'a> = spin::MutexGuard<'a, Rq>;

/// A CPU's run-queue.
pub struct Rq {
    pub cpu: usize,
    /// Part of the root domain (hotplug state)
    pub online: bool,
    /// Clock used for runtime accounting, in ns
    pub clock_task: u64,
    /// Running task; `None` while idle
    pub curr: Option<TaskId>,
    /// Every task whose home CPU is this one
    pub tasks: TaskTable,
    pub rt: RtRq,
    pub fair: FairRq,
    /// Push/pull work to run once the current decision is made
    pub callbacks: BalanceCallbacks,
}

impl Rq {
    pub fn new(cpu: usize) -> Self {
        Self {
            cpu,
            online: false,
            clock_task: 0,
            curr: None,
            tasks: TaskTable::new(),
            rt: RtRq::new(),
            fair: FairRq::new(),
            callbacks: BalanceCallbacks::empty(),
        }
    }

    /// A task homed here. Missing tasks are a corrupted-state bug.
    pub fn task(&self, id: TaskId) -> &Task {
        match self.tasks.get(&id) {
            Some(task) => task,
            None => sched_bug!("task {} is not homed on cpu {}", id, self.cpu),
        }
    }

    pub fn task_mut(&mut self, id: TaskId) -> &mut Task {
        let cpu = self.cpu;
        match self.tasks.get_mut(&id) {
            Some(task) => task,
            None => sched_bug!("task {} is not homed on cpu {}", id, cpu),
        }
    }

    pub fn curr_task(&self) -> Option<&Task> {
        self.curr.and_then(|id| self.tasks.get(&id))
    }

    /// Priority of the running task, `MAX_PRIO` while idle.
    pub fn curr_prio(&self) -> u32 {
        self.curr_task().map_or(MAX_PRIO, |t| t.prio)
    }

    #[inline]
    pub fn is_curr(&self, id: TaskId) -> bool {
        self.curr == Some(id)
    }

    /// Runnable tasks, including the running one.
    pub fn nr_running(&self) -> u32 {
        let rt = if self.rt.rt_queued {
            self.rt.rt_nr_running
        } else {
            0
        };
        self.fair.nr_running + rt
    }
}

const NO_TASK: u64 = 0;

#[inline]
fn encode(id: Option<TaskId>) -> u64 {
    id.map_or(NO_TASK, |id| id.0 + 1)
}

#[inline]
fn decode(raw: u64) -> Option<TaskId> {
    (raw != NO_TASK).then(|| TaskId(raw - 1))
}

/// Lock-free view of a run-queue plus the cross-CPU mailboxes.
pub struct RqStat {
    highest_curr: AtomicU32,
    highest_next: AtomicU32,
    curr: AtomicU64,
    curr_prio: AtomicU32,
    curr_nr_allowed: AtomicU32,
    curr_util: AtomicU64,
    rt_util: AtomicU64,
    rt_nr_running: AtomicU32,
    nr_running: AtomicU32,
    has_pushable: AtomicBool,

    need_resched: AtomicBool,
    /// Pending relay hop (models an irq_work IPI)
    push_work: AtomicBool,
    /// Running task chosen as victim by a remote CPU
    victim: AtomicU64,
    removed_util: AtomicU64,
    removed_load: AtomicU64,
}

impl RqStat {
    pub fn new() -> Self {
        Self {
            highest_curr: AtomicU32::new(MAX_RT_PRIO),
            highest_next: AtomicU32::new(MAX_RT_PRIO),
            curr: AtomicU64::new(NO_TASK),
            curr_prio: AtomicU32::new(MAX_PRIO),
            curr_nr_allowed: AtomicU32::new(1),
            curr_util: AtomicU64::new(0),
            rt_util: AtomicU64::new(0),
            rt_nr_running: AtomicU32::new(0),
            nr_running: AtomicU32::new(0),
            has_pushable: AtomicBool::new(false),
            need_resched: AtomicBool::new(false),
            push_work: AtomicBool::new(false),
            victim: AtomicU64::new(NO_TASK),
            removed_util: AtomicU64::new(0),
            removed_load: AtomicU64::new(0),
        }
    }

    /// Mirror `rq` for lock-free readers.
    pub fn publish(&self, rq: &Rq) {
        let curr = rq.curr_task();
        self.curr.store(encode(rq.curr), Ordering::Relaxed);
        self.curr_prio
            .store(curr.map_or(MAX_PRIO, |t| t.prio), Ordering::Relaxed);
        self.curr_nr_allowed
            .store(curr.map_or(1, |t| t.nr_cpus_allowed), Ordering::Relaxed);
        self.curr_util
            .store(curr.map_or(0, |t| t.rt.avg.util_avg), Ordering::Relaxed);
        self.rt_util.store(rq.rt.avg.util_avg, Ordering::Relaxed);
        self.rt_nr_running
            .store(rq.rt.rt_nr_running, Ordering::Relaxed);
        self.nr_running.store(rq.nr_running(), Ordering::Relaxed);
        self.has_pushable
            .store(rq.rt.has_pushable_tasks(), Ordering::Relaxed);
        self.highest_next
            .store(rq.rt.highest_prio.next, Ordering::Relaxed);
        self.highest_curr
            .store(rq.rt.highest_prio.curr, Ordering::Release);
    }

    #[inline]
    pub fn highest_curr(&self) -> u32 {
        self.highest_curr.load(Ordering::Acquire)
    }

    #[inline]
    pub fn highest_next(&self) -> u32 {
        self.highest_next.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn curr(&self) -> Option<TaskId> {
        decode(self.curr.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn curr_prio(&self) -> u32 {
        self.curr_prio.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn curr_is_rt(&self) -> bool {
        self.curr_prio() < MAX_RT_PRIO
    }

    #[inline]
    pub fn curr_nr_allowed(&self) -> u32 {
        self.curr_nr_allowed.load(Ordering::Relaxed)
    }

    /// RT utilization of the running task.
    #[inline]
    pub fn curr_util(&self) -> u64 {
        self.curr_util.load(Ordering::Relaxed)
    }

    /// Aggregate RT utilization.
    #[inline]
    pub fn rt_util(&self) -> u64 {
        self.rt_util.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn rt_nr_running(&self) -> u32 {
        self.rt_nr_running.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn nr_running(&self) -> u32 {
        self.nr_running.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn has_pushable(&self) -> bool {
        self.has_pushable.load(Ordering::Relaxed)
    }

    /// Nothing running and nothing queued.
    #[inline]
    pub fn is_idle(&self) -> bool {
        self.curr().is_none() && self.nr_running() == 0
    }

    #[inline]
    pub fn set_need_resched(&self) {
        self.need_resched.store(true, Ordering::Release);
    }

    #[inline]
    pub fn need_resched(&self) -> bool {
        self.need_resched.load(Ordering::Acquire)
    }

    #[inline]
    pub fn clear_need_resched(&self) {
        self.need_resched.store(false, Ordering::Release);
    }

    /// Queue a relay hop; returns false if one was already pending.
    #[inline]
    pub fn queue_push_work(&self) -> bool {
        !self.push_work.swap(true, Ordering::AcqRel)
    }

    #[inline]
    pub fn take_push_work(&self) -> bool {
        self.push_work.swap(false, Ordering::AcqRel)
    }

    #[inline]
    pub fn push_work_pending(&self) -> bool {
        self.push_work.load(Ordering::Acquire)
    }

    /// Ask the owner to flag `id` as victim if it is still running.
    #[inline]
    pub fn mark_victim(&self, id: TaskId) {
        self.victim.store(encode(Some(id)), Ordering::Release);
    }

    #[inline]
    pub fn take_victim(&self) -> Option<TaskId> {
        decode(self.victim.swap(NO_TASK, Ordering::AcqRel))
    }

    /// Record an entity average that left without the home lock.
    pub fn add_removed(&self, util: u64, load: u64) {
        self.removed_util.fetch_add(util, Ordering::Relaxed);
        self.removed_load.fetch_add(load, Ordering::Relaxed);
    }

    /// Take the pending removed `(util, load)`.
    pub fn take_removed(&self) -> (u64, u64) {
        (
            self.removed_util.swap(0, Ordering::Relaxed),
            self.removed_load.swap(0, Ordering::Relaxed),
        )
    }
}

impl Default for RqStat {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_rq_snapshot() {
        let rq = Rq::new(3);
        let stat = RqStat::new();
        stat.publish(&rq);
        assert_eq!(stat.highest_curr(), MAX_RT_PRIO);
        assert_eq!(stat.curr(), None);
        assert_eq!(stat.curr_prio(), MAX_PRIO);
        assert!(stat.is_idle());
        assert!(!stat.curr_is_rt());
    }

    #[test]
    fn test_mailboxes() {
        let stat = RqStat::new();
        assert!(stat.queue_push_work());
        assert!(!stat.queue_push_work());
        assert!(stat.take_push_work());
        assert!(!stat.take_push_work());

        stat.mark_victim(TaskId(0));
        assert_eq!(stat.take_victim(), Some(TaskId(0)));
        assert_eq!(stat.take_victim(), None);

        stat.add_removed(10, 20);
        stat.add_removed(1, 2);
        assert_eq!(stat.take_removed(), (11, 22));
        assert_eq!(stat.take_removed(), (0, 0));
    }
}
