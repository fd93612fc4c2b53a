//! Real-time scheduling class
//!
//! FIFO and round-robin tasks at priorities 0..=99. Each CPU keeps an
//! [`RtRq`]: a priority array of queued tasks (the running one included),
//! the subset that could run elsewhere (the pushable set), and the
//! counters that drive overload tracking and the CPU priority index.
//!
//! Cross-CPU balancing lives in `migrate`, placement of waking tasks in
//! `fluid` (or the classic lowest-priority search), and runtime limits in
//! `bandwidth`.

use super::class::{
    move_entity, BalanceCallbacks, DequeueFlags, EnqueueFlags, SchedClass, SdFlag, WakeFlags,
};
use super::pelt::{SchedAvg, NICE_0_LOAD};
use super::prio::{ListKind, PrioArray};
use super::rq::{Rq, RqGuard, TaskTable};
use super::task::{OnRq, Policy, TaskId, TaskSnapshot, MAX_RT_PRIO};
use super::{SchedFeatures, Scheduler};
use crate::traits::Platform;

/// Default round-robin slice, in milliseconds.
pub const RR_TIMESLICE_MS: u64 = 100;

/// Highest queued and highest pushable priority of a run-queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HighestPrio {
    /// Highest priority queued (the running task included)
    pub curr: u32,
    /// Highest priority in the pushable set
    pub next: u32,
}

/// Per-CPU RT run-queue.
pub struct RtRq {
    pub active: PrioArray,
    pub pushable: PrioArray,
    pub highest_prio: HighestPrio,
    pub rt_nr_running: u32,
    pub rr_nr_running: u32,
    pub rt_nr_total: u32,
    pub rt_nr_migratory: u32,
    /// Queued tasks running with a PI-boosted priority
    pub rt_nr_boosted: u32,
    /// More than one RT task queued and at least one could migrate
    pub overloaded: bool,
    /// RT class counts toward the CPU's runnable tasks (not throttled)
    pub rt_queued: bool,
    /// Aggregate decayed utilization of the queued RT tasks
    pub avg: SchedAvg,
}

/// Accounting attributes of an entity, fixed between enqueue and dequeue.
#[derive(Clone, Copy)]
struct EntityAttrs {
    prio: u32,
    rr: bool,
    migratable: bool,
    boosted: bool,
}

fn entity_attrs(tasks: &TaskTable, id: TaskId) -> EntityAttrs {
    match tasks.get(&id) {
        Some(t) => EntityAttrs {
            prio: t.prio,
            rr: t.policy == Policy::RoundRobin,
            migratable: t.is_migratable(),
            boosted: t.is_boosted(),
        },
        None => sched_bug!("rt entity {} has no task", id),
    }
}

impl RtRq {
    pub fn new() -> Self {
        Self {
            active: PrioArray::new(ListKind::Run),
            pushable: PrioArray::new(ListKind::Push),
            highest_prio: HighestPrio {
                curr: MAX_RT_PRIO,
                next: MAX_RT_PRIO,
            },
            rt_nr_running: 0,
            rr_nr_running: 0,
            rt_nr_total: 0,
            rt_nr_migratory: 0,
            rt_nr_boosted: 0,
            overloaded: false,
            rt_queued: false,
            avg: SchedAvg::default(),
        }
    }

    /// Count `id` as queued, linking it into the priority array unless a
    /// SAVE/RESTORE pair left it in place.
    pub fn enqueue_entity(&mut self, tasks: &mut TaskTable, id: TaskId, head: bool, relink: bool) {
        let attrs = entity_attrs(tasks, id);
        let linked = tasks.get(&id).is_some_and(|t| t.rt.run.linked);
        sched_bug_on!(relink && linked, "rt entity {} enqueued twice", id);

        if !linked {
            if head {
                self.active.push_front(tasks, id, attrs.prio);
            } else {
                self.active.push_back(tasks, id, attrs.prio);
            }
        }
        if let Some(t) = tasks.get_mut(&id) {
            t.rt.on_rq = true;
        }
        self.inc_rt_tasks(attrs);
    }

    pub fn dequeue_entity(&mut self, tasks: &mut TaskTable, id: TaskId, relink: bool) {
        let attrs = entity_attrs(tasks, id);
        if relink && tasks.get(&id).is_some_and(|t| t.rt.run.linked) {
            self.active.remove(tasks, id);
        }
        if let Some(t) = tasks.get_mut(&id) {
            t.rt.on_rq = false;
        }
        self.dec_rt_tasks(attrs);
    }

    fn inc_rt_tasks(&mut self, attrs: EntityAttrs) {
        self.rt_nr_running += 1;
        if attrs.rr {
            self.rr_nr_running += 1;
        }
        if attrs.prio < self.highest_prio.curr {
            self.highest_prio.curr = attrs.prio;
        }

        self.rt_nr_total += 1;
        if attrs.migratable {
            self.rt_nr_migratory += 1;
        }
        self.update_rt_migration();

        if attrs.boosted {
            self.rt_nr_boosted += 1;
        }
    }

    fn dec_rt_tasks(&mut self, attrs: EntityAttrs) {
        sched_bug_on!(self.rt_nr_running == 0, "rt_nr_running underflow");
        self.rt_nr_running -= 1;
        if attrs.rr {
            self.rr_nr_running -= 1;
        }
        if self.rt_nr_running == 0 {
            self.highest_prio.curr = MAX_RT_PRIO;
        } else if attrs.prio == self.highest_prio.curr {
            self.highest_prio.curr = self.active.bitmap().first();
        }

        self.rt_nr_total -= 1;
        if attrs.migratable {
            self.rt_nr_migratory -= 1;
        }
        self.update_rt_migration();

        if attrs.boosted {
            self.rt_nr_boosted -= 1;
        }
    }

    fn update_rt_migration(&mut self) {
        self.overloaded = self.rt_nr_migratory > 0 && self.rt_nr_total > 1;
    }

    /// Move a queued entity to the head or tail of its priority list.
    pub fn requeue(&mut self, tasks: &mut TaskTable, id: TaskId, head: bool) {
        if tasks.get(&id).is_some_and(|t| t.rt.on_rq) {
            self.active.requeue(tasks, id, head);
        }
    }

    pub fn enqueue_pushable(&mut self, tasks: &mut TaskTable, id: TaskId) {
        if tasks.get(&id).is_some_and(|t| t.rt.push.linked) {
            self.pushable.remove(tasks, id);
        }
        let prio = entity_attrs(tasks, id).prio;
        self.pushable.push_back(tasks, id, prio);
        if prio < self.highest_prio.next {
            self.highest_prio.next = prio;
        }
    }

    pub fn dequeue_pushable(&mut self, tasks: &mut TaskTable, id: TaskId) {
        if tasks.get(&id).is_some_and(|t| t.rt.push.linked) {
            self.pushable.remove(tasks, id);
        }
        self.highest_prio.next = self.pushable.first_prio().unwrap_or(MAX_RT_PRIO);
    }

    pub fn has_pushable_tasks(&self) -> bool {
        !self.pushable.is_empty()
    }

    /// Head of the highest populated priority.
    pub fn pick_next_entity(&self) -> Option<TaskId> {
        self.active.first()
    }

    /// Check the structural invariants against the home table.
    pub fn verify(&self, tasks: &TaskTable) -> bool {
        let expected_highest = if self.rt_nr_running == 0 {
            MAX_RT_PRIO
        } else {
            self.active.bitmap().first()
        };
        self.active.verify(tasks)
            && self.pushable.verify(tasks)
            && self.overloaded == (self.rt_nr_migratory > 0 && self.rt_nr_total > 1)
            && self.highest_prio.curr == expected_highest
            && self.highest_prio.next == self.pushable.first_prio().unwrap_or(MAX_RT_PRIO)
    }
}

impl Default for RtRq {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Platform> Scheduler<P> {
    /// Queue an RT entity and propagate the change to the CPU priority
    /// index, the overload mask and the runnable count.
    pub(crate) fn enqueue_rt_entity(&self, rq: &mut Rq, p: TaskId, flags: EnqueueFlags) {
        let before = (rq.rt.highest_prio.curr, rq.rt.overloaded);
        let relink = move_entity(
            flags.contains(EnqueueFlags::RESTORE),
            flags.contains(EnqueueFlags::MOVE),
        );
        rq.rt
            .enqueue_entity(&mut rq.tasks, p, flags.contains(EnqueueFlags::HEAD), relink);
        self.start_rt_bandwidth();
        self.rt_rq_changed(rq, before);
        self.enqueue_top_rt_rq(rq);
    }

    pub(crate) fn dequeue_rt_entity(&self, rq: &mut Rq, p: TaskId, flags: DequeueFlags) {
        let before = (rq.rt.highest_prio.curr, rq.rt.overloaded);
        let relink = move_entity(
            flags.contains(DequeueFlags::SAVE),
            flags.contains(DequeueFlags::MOVE),
        );
        rq.rt.dequeue_entity(&mut rq.tasks, p, relink);
        self.rt_rq_changed(rq, before);
        self.enqueue_top_rt_rq(rq);
    }

    fn rt_rq_changed(&self, rq: &Rq, (prev_prio, was_overloaded): (u32, bool)) {
        if rq.online && rq.rt.highest_prio.curr != prev_prio {
            self.cpupri.set(rq.cpu, Some(rq.rt.highest_prio.curr));
        }
        match (was_overloaded, rq.rt.overloaded) {
            (false, true) if rq.online => self.root.set_overload(rq.cpu),
            (true, false) if rq.online => self.root.clear_overload(rq.cpu),
            _ => {}
        }
    }

    pub(crate) fn enqueue_pushable_task(&self, rq: &mut Rq, p: TaskId) {
        rq.rt.enqueue_pushable(&mut rq.tasks, p);
    }

    pub(crate) fn dequeue_pushable_task(&self, rq: &mut Rq, p: TaskId) {
        rq.rt.dequeue_pushable(&mut rq.tasks, p);
    }

    pub(crate) fn queue_push_tasks(&self, rq: &mut Rq) {
        if rq.rt.has_pushable_tasks() {
            rq.callbacks |= BalanceCallbacks::PUSH;
        }
    }

    pub(crate) fn queue_pull_task(&self, rq: &mut Rq) {
        rq.callbacks |= BalanceCallbacks::PULL;
    }

    /// Charge the running RT task for the time since it last started.
    pub(crate) fn update_curr_rt(&self, rq: &mut Rq) {
        let Some(curr) = rq.curr else {
            return;
        };
        let now = rq.clock_task;
        let delta = {
            let task = rq.task_mut(curr);
            if !task.is_rt() || now <= task.exec_start {
                return;
            }
            let delta = now - task.exec_start;
            task.sum_exec_runtime += delta;
            task.exec_start = now;
            delta
        };

        if !self.bandwidth.lock().enabled() {
            return;
        }

        let charged = {
            let mut rt = self.cpus[rq.cpu].runtime.lock();
            if rt.rt_runtime == super::bandwidth::RUNTIME_INF {
                false
            } else {
                rt.rt_time += delta;
                true
            }
        };
        if charged && self.sched_rt_runtime_exceeded(rq) {
            self.resched_curr(rq);
        }
    }

    /// Fold in averages that left without the lock and advance the
    /// aggregate to the run-queue clock.
    pub(crate) fn update_rt_rq_load_avg(&self, rq: &mut Rq) {
        let (util, load) = self.cpus[rq.cpu].stat.take_removed();
        if util != 0 || load != 0 {
            rq.rt.avg.remove(util, load);
        }
        let running = rq.curr_task().is_some_and(|t| t.is_rt());
        let weight = if rq.rt.rt_nr_running > 0 {
            NICE_0_LOAD
        } else {
            0
        };
        let freq = self.platform.freq_scale(rq.cpu);
        let cap = self.topology.capacity_orig_of(rq.cpu);
        rq.rt.avg.update(rq.clock_task, weight, running, freq, cap);
    }

    /// Advance an entity's average to the run-queue clock.
    pub(crate) fn update_rt_entity_avg(&self, rq: &mut Rq, p: TaskId) {
        let now = rq.clock_task;
        let running = rq.is_curr(p);
        let freq = self.platform.freq_scale(rq.cpu);
        let cap = self.topology.capacity_orig_of(rq.cpu);
        let task = rq.task_mut(p);
        let weight = if task.rt.on_rq { NICE_0_LOAD } else { 0 };
        task.rt.avg.update(now, weight, running, freq, cap);
    }

    /// Fold `p`'s average into the run-queue aggregate if it is not yet.
    pub(crate) fn attach_rt_entity(&self, rq: &mut Rq, p: TaskId) {
        let Rq { rt, tasks, .. } = rq;
        if let Some(task) = tasks.get_mut(&p) {
            if !task.rt.attached {
                rt.avg.attach(&mut task.rt.avg);
                task.rt.attached = true;
            }
        }
    }

    pub(crate) fn detach_rt_entity(&self, rq: &mut Rq, p: TaskId) {
        let Rq { rt, tasks, .. } = rq;
        if let Some(task) = tasks.get_mut(&p) {
            if task.rt.attached {
                rt.avg.detach(&task.rt.avg);
                task.rt.attached = false;
            }
        }
    }

    /// Hand an attached average back to its run-queue without its lock.
    fn remove_rt_entity(&self, rq: &mut Rq, p: TaskId) {
        let cpu = rq.cpu;
        let task = rq.task_mut(p);
        if task.rt.attached {
            self.cpus[cpu]
                .stat
                .add_removed(task.rt.avg.util_avg, task.rt.avg.load_avg);
            task.rt.attached = false;
        }
    }

    /// Count RT ticks against the task's RT-time limit.
    fn watchdog(&self, rq: &mut Rq, p: TaskId) {
        let jiffies = rq.clock_task / self.tick_ns;
        let tick_us = (self.tick_ns / 1_000).max(1);
        let task = rq.task_mut(p);
        let Some(soft) = task.rttime_limit.soft_us else {
            return;
        };

        if task.rt.watchdog_stamp != jiffies {
            task.rt.timeout += 1;
            task.rt.watchdog_stamp = jiffies;
        }

        let limit = task.rttime_limit.hard_us.map_or(soft, |hard| soft.min(hard));
        let next = limit.div_ceil(tick_us);
        if task.rt.timeout > next && !task.rttime_expired {
            task.rttime_expired = true;
            log::warn!(
                target: "nyx_sched::rt",
                "task {} exceeded its rt time limit ({}us)",
                p,
                limit
            );
        }
    }

    /// If the running task could go elsewhere and `p` could not, requeue
    /// `p` ahead so the next pick pushes the running task away.
    fn check_preempt_equal_prio(&self, rq: &mut Rq, p: TaskId) {
        let Some(curr) = rq.curr_task() else {
            return;
        };
        if curr.nr_cpus_allowed == 1 || self.cpupri.find(curr.prio, curr.cpus_allowed).is_none() {
            return;
        }

        let task = rq.task(p);
        if task.nr_cpus_allowed != 1 && self.cpupri.find(task.prio, task.cpus_allowed).is_some() {
            return;
        }

        rq.rt.requeue(&mut rq.tasks, p, true);
        self.resched_curr(rq);
    }

    /// Whether a pick on `rq` should first try to pull RT work.
    pub(crate) fn need_pull_rt_task(&self, rq: &Rq, prev: Option<TaskId>) -> bool {
        let prev_prio = prev
            .and_then(|id| rq.tasks.get(&id))
            .map_or(super::task::MAX_PRIO, |t| t.prio);
        rq.online && rq.rt.highest_prio.curr > prev_prio
    }

    fn rr_timeslice_ns(&self) -> u64 {
        self.rr_timeslice() as u64 * self.tick_ns
    }
}

/// The RT scheduling class.
pub struct RtClass;

#[cfg(feature = "sched-debug")]
fn debug_verify(rq: &Rq, op: &str, p: TaskId) {
    sched_bug_on!(
        !rq.rt.verify(&rq.tasks),
        "cpu{}: rt run-queue inconsistent after {} of task {}",
        rq.cpu,
        op,
        p
    );
}

#[cfg(not(feature = "sched-debug"))]
#[inline(always)]
fn debug_verify(_rq: &Rq, _op: &str, _p: TaskId) {}

/// Shared instance of [`RtClass`].
pub static RT_CLASS: RtClass = RtClass;

impl<P: Platform> SchedClass<P> for RtClass {
    fn enqueue_task(&self, s: &Scheduler<P>, rq: &mut Rq, p: TaskId, flags: EnqueueFlags) {
        if flags.contains(EnqueueFlags::WAKEUP) {
            rq.task_mut(p).rt.timeout = 0;
        }

        s.enqueue_rt_entity(rq, p, flags);

        s.update_rt_rq_load_avg(rq);
        if rq.task(p).rt.attached {
            s.update_rt_entity_avg(rq, p);
        } else {
            s.attach_rt_entity(rq, p);
        }

        if !rq.is_curr(p) && rq.task(p).is_migratable() {
            s.enqueue_pushable_task(rq, p);
        }
        debug_verify(rq, "enqueue", p);
    }

    fn dequeue_task(&self, s: &Scheduler<P>, rq: &mut Rq, p: TaskId, flags: DequeueFlags) {
        s.update_curr_rt(rq);
        s.update_rt_rq_load_avg(rq);
        s.update_rt_entity_avg(rq, p);

        s.dequeue_rt_entity(rq, p, flags);

        // A sleeping task's contribution decays in place; anything else is
        // leaving this run-queue's signal.
        if !flags.contains(DequeueFlags::SLEEP) {
            s.detach_rt_entity(rq, p);
        }
        s.dequeue_pushable_task(rq, p);
        debug_verify(rq, "dequeue", p);
    }

    fn yield_task(&self, _s: &Scheduler<P>, rq: &mut Rq) {
        if let Some(curr) = rq.curr {
            rq.rt.requeue(&mut rq.tasks, curr, false);
        }
    }

    fn check_preempt_curr(&self, s: &Scheduler<P>, rq: &mut Rq, p: TaskId, _flags: WakeFlags) {
        let curr_prio = rq.curr_prio();
        let (prio, victim) = {
            let task = rq.task(p);
            (task.prio, task.victim)
        };

        if prio < curr_prio {
            s.resched_curr(rq);
            return;
        }
        if victim {
            rq.rt.requeue(&mut rq.tasks, p, true);
            s.resched_curr(rq);
            return;
        }

        if prio == curr_prio && !s.cpus[rq.cpu].stat.need_resched() {
            s.check_preempt_equal_prio(rq, p);
        }
    }

    fn balance<'a>(
        &self,
        s: &'a Scheduler<P>,
        rq: RqGuard<'a>,
        prev: Option<TaskId>,
    ) -> RqGuard<'a> {
        if s.need_pull_rt_task(&rq, prev) {
            s.pull_rt_task(rq)
        } else {
            rq
        }
    }

    fn pick_next_task(&self, s: &Scheduler<P>, rq: &mut Rq) -> Option<TaskId> {
        if !rq.rt.rt_queued {
            return None;
        }
        let Some(p) = rq.rt.pick_next_entity() else {
            sched_bug!("cpu{}: rt class queued with an empty priority array", rq.cpu);
        };

        rq.curr = Some(p);
        let now = rq.clock_task;
        s.update_rt_entity_avg(rq, p);
        {
            let task = rq.task_mut(p);
            task.exec_start = now;
            task.victim = false;
        }

        // The running task is never eligible for pushing.
        s.dequeue_pushable_task(rq, p);
        s.queue_push_tasks(rq);
        s.update_rt_rq_load_avg(rq);
        Some(p)
    }

    fn put_prev_task(&self, s: &Scheduler<P>, rq: &mut Rq, prev: TaskId) {
        s.update_curr_rt(rq);
        let (queued, migratable) = {
            let task = rq.task(prev);
            (task.rt.on_rq, task.is_migratable())
        };
        if queued {
            s.update_rt_entity_avg(rq, prev);
            if migratable {
                s.enqueue_pushable_task(rq, prev);
            }
        }
    }

    fn set_curr_task(&self, s: &Scheduler<P>, rq: &mut Rq) {
        let Some(curr) = rq.curr else {
            return;
        };
        let now = rq.clock_task;
        rq.task_mut(curr).exec_start = now;
        s.dequeue_pushable_task(rq, curr);
    }

    fn task_tick(&self, s: &Scheduler<P>, rq: &mut Rq, curr: TaskId, _queued: bool) {
        s.update_curr_rt(rq);
        s.update_rt_rq_load_avg(rq);
        s.update_rt_entity_avg(rq, curr);
        if s.features().contains(SchedFeatures::FLUID_RT) {
            s.update_activated_cpus();
        }
        s.watchdog(rq, curr);

        let rr_slice = s.rr_timeslice();
        let (prio, has_peers) = {
            let task = rq.task_mut(curr);
            if task.policy != Policy::RoundRobin {
                return;
            }
            task.rt.time_slice = task.rt.time_slice.saturating_sub(1);
            if task.rt.time_slice > 0 {
                return;
            }
            task.rt.time_slice = rr_slice;
            let prio = task.prio;
            (prio, rq.rt.active.has_multiple(prio))
        };

        // Requeue to the end of the queue if we (and all of our ancestors)
        // are not the only element on it.
        if has_peers {
            log::trace!(target: "nyx_sched::rt", "rr slice of {} expired at prio {}", curr, prio);
            rq.rt.requeue(&mut rq.tasks, curr, false);
            s.resched_curr(rq);
        }
    }

    fn get_rr_interval(&self, s: &Scheduler<P>, rq: &Rq, p: TaskId) -> u64 {
        if rq.task(p).policy == Policy::RoundRobin {
            s.rr_timeslice_ns()
        } else {
            0
        }
    }

    fn prio_changed(&self, s: &Scheduler<P>, rq: &mut Rq, p: TaskId, old_prio: u32) {
        let task = rq.task(p);
        if task.on_rq != OnRq::Queued {
            return;
        }
        let prio = task.prio;

        if rq.is_curr(p) {
            // Lowered priority: someone else may now deserve this CPU.
            if old_prio < prio {
                s.queue_pull_task(rq);
            }
            if prio > rq.rt.highest_prio.curr {
                s.resched_curr(rq);
            }
        } else if prio < rq.curr_prio() {
            s.resched_curr(rq);
        }
    }

    fn switched_from(&self, s: &Scheduler<P>, rq: &mut Rq, p: TaskId) {
        s.detach_rt_entity(rq, p);
        // Other RT tasks will balance themselves; the last one leaving may
        // have to pull.
        if rq.task(p).on_rq != OnRq::Queued || rq.rt.rt_nr_running > 0 {
            return;
        }
        s.queue_pull_task(rq);
    }

    fn switched_to(&self, s: &Scheduler<P>, rq: &mut Rq, p: TaskId) {
        // Carry the fair history over, keeping the attachment state.
        let attached = rq.task(p).rt.attached;
        s.detach_rt_entity(rq, p);
        {
            let task = rq.task_mut(p);
            task.rt.avg = task.se_avg;
        }
        if attached {
            s.attach_rt_entity(rq, p);
        }

        let (queued, migratable, prio) = {
            let task = rq.task(p);
            (task.on_rq == OnRq::Queued, task.is_migratable(), task.prio)
        };
        if queued && !rq.is_curr(p) {
            if migratable && rq.rt.overloaded {
                s.queue_push_tasks(rq);
            }
            if prio < rq.curr_prio() && rq.online {
                s.resched_curr(rq);
            }
        }
    }

    fn select_task_rq(
        &self,
        s: &Scheduler<P>,
        p: &TaskSnapshot,
        cpu: usize,
        sd_flag: SdFlag,
        _flags: WakeFlags,
    ) -> usize {
        let mut target = cpu;

        if matches!(sd_flag, SdFlag::Wake | SdFlag::Fork) {
            let stat = &s.cpus[cpu].stat;
            if s.features().contains(SchedFeatures::FLUID_RT) {
                // Fluid placement may move a task even off a CPU running
                // something more important if that CPU is too busy.
                if let Some(found) = s.find_lowest_rq(p) {
                    target = found;
                }
            } else if stat.curr_is_rt()
                && (stat.curr_nr_allowed() < 2 || stat.curr_prio() <= p.prio)
            {
                if let Some(found) = s.find_lowest_rq(p) {
                    if p.prio < s.cpus[found].stat.highest_curr() {
                        target = found;
                    }
                }
            }
        }

        log::trace!(
            target: "nyx_sched::fluid",
            "task {} {} on cpu{}",
            p.id,
            if s.topology.is_slowest_cpu(target) {
                "SLOW_ASSIGNED"
            } else {
                "FAST_ASSIGNED"
            },
            target
        );
        target
    }

    fn migrate_task_rq(&self, s: &Scheduler<P>, rq: &mut Rq, p: TaskId, _new_cpu: usize) {
        s.remove_rt_entity(rq, p);
        rq.task_mut(p).exec_start = 0;
    }

    fn task_dead(&self, s: &Scheduler<P>, rq: &mut Rq, p: TaskId) {
        s.remove_rt_entity(rq, p);
    }

    fn set_cpus_allowed(&self, s: &Scheduler<P>, rq: &mut Rq, p: TaskId) {
        let task = rq.task(p);
        if task.on_rq == OnRq::Queued && !rq.is_curr(p) && rq.rt.overloaded {
            s.queue_push_tasks(rq);
        }
    }

    fn rq_online(&self, s: &Scheduler<P>, rq: &mut Rq) {
        if rq.rt.overloaded {
            s.root.set_overload(rq.cpu);
        }
        s.enable_runtime(rq);
        s.cpupri.set(rq.cpu, Some(rq.rt.highest_prio.curr));
    }

    fn rq_offline(&self, s: &Scheduler<P>, rq: &mut Rq) {
        if rq.rt.overloaded {
            s.root.clear_overload(rq.cpu);
        }
        s.disable_runtime(rq);
        s.cpupri.set(rq.cpu, None);
    }

    fn task_woken(&self, s: &Scheduler<P>, rq: &mut Rq, p: TaskId) {
        let need_to_push = {
            let task = rq.task(p);
            !rq.is_curr(p)
                && !s.cpus[rq.cpu].stat.need_resched()
                && task.is_migratable()
                && rq.curr_task().is_some_and(|curr| {
                    curr.is_rt() && (curr.nr_cpus_allowed < 2 || curr.prio <= task.prio)
                })
        };

        if s.features().contains(SchedFeatures::FLUID_RT) {
            let sync_lower = rq.task(p).rt.sync_flag && rq.curr_prio() < rq.task(p).prio;
            if need_to_push && sync_lower {
                rq.callbacks |= BalanceCallbacks::PUSH;
            }
        } else if need_to_push {
            rq.callbacks |= BalanceCallbacks::PUSH;
        }
        rq.task_mut(p).rt.sync_flag = false;
    }

    fn update_curr(&self, s: &Scheduler<P>, rq: &mut Rq) {
        s.update_curr_rt(rq);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpumask::CpuMask;
    use crate::sched::task::{Task, TaskSpec};
    use alloc::vec::Vec;

    fn table(specs: &[(u64, TaskSpec)]) -> TaskTable {
        specs
            .iter()
            .map(|(id, spec)| {
                let mask = spec.cpus_allowed.unwrap_or(CpuMask::first_n(4));
                (TaskId(*id), Task::new(TaskId(*id), spec, 0, mask))
            })
            .collect()
    }

    #[test]
    fn test_counters_and_highest_prio() {
        let mut tasks = table(&[
            (1, TaskSpec::fifo(10)),
            (2, TaskSpec::round_robin(50)),
            (3, TaskSpec::fifo(50).affinity(CpuMask::single(0))),
        ]);
        let mut rt = RtRq::new();

        rt.enqueue_entity(&mut tasks, TaskId(1), false, true);
        assert_eq!(rt.highest_prio.curr, 89);
        assert!(!rt.overloaded);

        rt.enqueue_entity(&mut tasks, TaskId(2), false, true);
        rt.enqueue_entity(&mut tasks, TaskId(3), false, true);
        assert_eq!(rt.rt_nr_running, 3);
        assert_eq!(rt.rr_nr_running, 1);
        assert_eq!(rt.rt_nr_migratory, 2);
        assert_eq!(rt.highest_prio.curr, 49);
        assert!(rt.overloaded);
        assert!(rt.verify(&tasks));

        rt.dequeue_entity(&mut tasks, TaskId(2), true);
        assert_eq!(rt.highest_prio.curr, 49);
        rt.dequeue_entity(&mut tasks, TaskId(3), true);
        assert_eq!(rt.highest_prio.curr, 89);
        assert!(!rt.overloaded);
        rt.dequeue_entity(&mut tasks, TaskId(1), true);
        assert_eq!(rt.highest_prio.curr, MAX_RT_PRIO);
        assert!(rt.verify(&tasks));
    }

    #[test]
    fn test_pinned_tasks_never_overload() {
        let pinned = TaskSpec::fifo(10).affinity(CpuMask::single(0));
        let mut tasks = table(&[(1, pinned.clone()), (2, pinned)]);
        let mut rt = RtRq::new();
        rt.enqueue_entity(&mut tasks, TaskId(1), false, true);
        rt.enqueue_entity(&mut tasks, TaskId(2), false, true);
        assert!(!rt.overloaded);
    }

    #[test]
    fn test_save_restore_keeps_position() {
        let mut tasks = table(&[(1, TaskSpec::fifo(10)), (2, TaskSpec::fifo(10))]);
        let mut rt = RtRq::new();
        rt.enqueue_entity(&mut tasks, TaskId(1), false, true);
        rt.enqueue_entity(&mut tasks, TaskId(2), false, true);

        rt.dequeue_entity(&mut tasks, TaskId(1), false);
        assert_eq!(rt.rt_nr_running, 1);
        assert_eq!(rt.active.head(89), Some(TaskId(1)));
        rt.enqueue_entity(&mut tasks, TaskId(1), false, false);
        assert_eq!(rt.active.head(89), Some(TaskId(1)));
        assert!(rt.verify(&tasks));
    }

    #[test]
    fn test_pushable_tracks_next() {
        let mut tasks = table(&[(1, TaskSpec::fifo(10)), (2, TaskSpec::fifo(20))]);
        let mut rt = RtRq::new();
        rt.enqueue_pushable(&mut tasks, TaskId(1));
        rt.enqueue_pushable(&mut tasks, TaskId(2));
        assert_eq!(rt.highest_prio.next, 79);

        rt.dequeue_pushable(&mut tasks, TaskId(2));
        assert_eq!(rt.highest_prio.next, 89);
        rt.dequeue_pushable(&mut tasks, TaskId(1));
        assert_eq!(rt.highest_prio.next, MAX_RT_PRIO);
        assert!(!rt.has_pushable_tasks());
    }

    #[cfg(feature = "sched-debug")]
    #[test]
    #[should_panic(expected = "rt run-queue inconsistent")]
    fn test_debug_build_catches_corrupt_rq() {
        use crate::platform::PlatformModel;
        use crate::sched::Tunables;
        use crate::topology::Topology;

        let topo = Topology::uniform(1, 1024).unwrap();
        let s = Scheduler::new(PlatformModel::new(&topo), topo, Tunables::default()).unwrap();
        let a = s.spawn(TaskSpec::fifo(10)).unwrap();
        assert_eq!(s.schedule(0).unwrap(), Some(a));

        s.lock_rq(0).rt.highest_prio.next = 0;
        let _ = s.spawn(TaskSpec::fifo(20));
    }

    #[test]
    fn test_head_enqueue_and_pick() {
        let mut tasks = table(&[(1, TaskSpec::fifo(10)), (2, TaskSpec::fifo(10))]);
        let mut rt = RtRq::new();
        rt.enqueue_entity(&mut tasks, TaskId(1), false, true);
        rt.enqueue_entity(&mut tasks, TaskId(2), true, true);
        assert_eq!(rt.pick_next_entity(), Some(TaskId(2)));

        rt.requeue(&mut tasks, TaskId(2), false);
        let order: Vec<_> = rt.active.iter(&tasks).collect();
        assert_eq!(order, [TaskId(1), TaskId(2)]);
    }
}
