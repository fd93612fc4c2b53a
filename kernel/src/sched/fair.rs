//! Fair scheduling class
//!
//! A vruntime-ordered queue for normal, batch and idle-policy tasks. It
//! keeps just enough state to let normal tasks run, be preempted by RT
//! work and be placed by the wakeup balancer; load balancing between fair
//! run-queues is not modelled.

use super::class::{DequeueFlags, EnqueueFlags, SchedClass, SdFlag, WakeFlags};
use super::pelt::NICE_0_LOAD;
use super::rq::Rq;
use super::task::{ClassKind, OnRq, Policy, TaskId, TaskSnapshot};
use super::Scheduler;
use crate::traits::Platform;
use alloc::collections::BTreeSet;

/// Target latency for one round over all runnable fair tasks, in ns.
pub const SCHED_LATENCY_NS: u64 = 6_000_000;
/// Smallest slice a fair task is granted, in ns.
pub const SCHED_MIN_GRANULARITY_NS: u64 = 750_000;
/// Vruntime lead a waking task needs to preempt, in ns.
pub const SCHED_WAKEUP_GRANULARITY_NS: u64 = 1_000_000;

/// Weight of an idle-policy task.
const WEIGHT_IDLEPRIO: u32 = 3;

/// Load weight per nice level, from -20 to 19. Each step is ~10% of CPU.
pub const NICE_TO_WEIGHT: [u32; 40] = [
    88761, 71755, 56483, 46273, 36291, 29154, 23254, 18705, 14949, 11916, 9548, 7620, 6100, 4904,
    3906, 3121, 2501, 1991, 1586, 1277, 1024, 820, 655, 526, 423, 335, 272, 215, 172, 137, 110, 87,
    70, 56, 45, 36, 29, 23, 18, 15,
];

/// Calculate weight from nice value (-20 to 19)
pub fn nice_to_weight(nice: i32) -> u32 {
    let idx = (nice + 20).clamp(0, 39) as usize;
    NICE_TO_WEIGHT[idx]
}

/// Calculate virtual runtime delta
pub fn calc_vruntime_delta(runtime_ns: u64, weight: u32) -> u64 {
    // vruntime = runtime * NICE_0_WEIGHT / weight
    (runtime_ns * NICE_0_LOAD) / weight.max(1) as u64
}

/// Per-CPU fair run-queue.
///
/// The running task is kept out of the tree and reinserted when it stops
/// running.
pub struct FairRq {
    tree: BTreeSet<(u64, TaskId)>,
    /// Monotonic floor for placing new and waking tasks
    pub min_vruntime: u64,
    /// Queued fair tasks, the running one included
    pub nr_running: u32,
}

impl FairRq {
    pub fn new() -> Self {
        Self {
            tree: BTreeSet::new(),
            min_vruntime: 0,
            nr_running: 0,
        }
    }

    /// Task with the smallest vruntime, if any is waiting.
    pub fn leftmost(&self) -> Option<(u64, TaskId)> {
        self.tree.first().copied()
    }

    /// Tasks waiting (the running one excluded).
    pub fn waiting(&self) -> usize {
        self.tree.len()
    }

    fn update_min_vruntime(&mut self, curr_vruntime: Option<u64>) {
        let candidate = match (curr_vruntime, self.leftmost()) {
            (Some(curr), Some((left, _))) => curr.min(left),
            (Some(curr), None) => curr,
            (None, Some((left, _))) => left,
            (None, None) => return,
        };
        self.min_vruntime = self.min_vruntime.max(candidate);
    }

    /// Slice of one task when `nr_running` share the latency target.
    pub fn sched_slice(&self) -> u64 {
        let nr = self.nr_running.max(1) as u64;
        (SCHED_LATENCY_NS / nr).max(SCHED_MIN_GRANULARITY_NS)
    }
}

impl Default for FairRq {
    fn default() -> Self {
        Self::new()
    }
}

fn task_weight(rq: &Rq, p: TaskId) -> u32 {
    let task = rq.task(p);
    if task.policy == Policy::Idle {
        WEIGHT_IDLEPRIO
    } else {
        nice_to_weight(task.nice())
    }
}

/// The fair scheduling class.
pub struct FairClass;

/// Shared instance of [`FairClass`].
pub static FAIR_CLASS: FairClass = FairClass;

impl FairClass {
    fn update_se_avg<P: Platform>(&self, s: &Scheduler<P>, rq: &mut Rq, p: TaskId) {
        let now = rq.clock_task;
        let running = rq.is_curr(p);
        let freq = s.platform.freq_scale(rq.cpu);
        let cap = s.topology.capacity_orig_of(rq.cpu);
        let task = rq.task_mut(p);
        let weight = if task.on_rq == OnRq::Queued { NICE_0_LOAD } else { 0 };
        task.se_avg.update(now, weight, running, freq, cap);
    }
}

impl<P: Platform> SchedClass<P> for FairClass {
    fn enqueue_task(&self, s: &Scheduler<P>, rq: &mut Rq, p: TaskId, flags: EnqueueFlags) {
        self.update_se_avg(s, rq, p);
        let min_vruntime = rq.fair.min_vruntime;
        let is_curr = rq.is_curr(p);
        let vruntime = {
            let task = rq.task_mut(p);
            if flags.contains(EnqueueFlags::WAKEUP) {
                task.vruntime = task.vruntime.max(min_vruntime);
            } else {
                // Relative to the queue it left.
                task.vruntime += min_vruntime;
            }
            task.vruntime
        };
        if !is_curr {
            rq.fair.tree.insert((vruntime, p));
        }
        rq.fair.nr_running += 1;
    }

    fn dequeue_task(&self, s: &Scheduler<P>, rq: &mut Rq, p: TaskId, flags: DequeueFlags) {
        self.update_curr(s, rq);
        self.update_se_avg(s, rq, p);
        let vruntime = rq.task(p).vruntime;
        if !rq.is_curr(p) {
            rq.fair.tree.remove(&(vruntime, p));
        }
        sched_bug_on!(rq.fair.nr_running == 0, "cpu{}: fair nr_running underflow", rq.cpu);
        rq.fair.nr_running -= 1;

        if !flags.contains(DequeueFlags::SLEEP) {
            let min_vruntime = rq.fair.min_vruntime;
            let task = rq.task_mut(p);
            task.vruntime = task.vruntime.saturating_sub(min_vruntime);
        }
        let curr = rq.curr.filter(|&c| c != p).map(|c| rq.task(c).vruntime);
        rq.fair.update_min_vruntime(curr);
    }

    fn yield_task(&self, s: &Scheduler<P>, rq: &mut Rq) {
        let Some(curr) = rq.curr else {
            return;
        };
        self.update_curr(s, rq);
        if let Some(&(last, _)) = rq.fair.tree.last() {
            let task = rq.task_mut(curr);
            task.vruntime = task.vruntime.max(last + 1);
        }
    }

    fn check_preempt_curr(&self, s: &Scheduler<P>, rq: &mut Rq, p: TaskId, _flags: WakeFlags) {
        let Some(curr) = rq.curr else {
            s.resched_curr(rq);
            return;
        };
        if rq.task(curr).policy == Policy::Idle && rq.task(p).policy != Policy::Idle {
            s.resched_curr(rq);
            return;
        }
        self.update_curr(s, rq);
        let gran = calc_vruntime_delta(SCHED_WAKEUP_GRANULARITY_NS, task_weight(rq, p));
        if rq.task(p).vruntime + gran < rq.task(curr).vruntime {
            s.resched_curr(rq);
        }
    }

    fn pick_next_task(&self, s: &Scheduler<P>, rq: &mut Rq) -> Option<TaskId> {
        let (_, p) = rq.fair.tree.pop_first()?;
        rq.curr = Some(p);
        let now = rq.clock_task;
        rq.task_mut(p).exec_start = now;
        self.update_se_avg(s, rq, p);
        let vruntime = rq.task(p).vruntime;
        rq.fair.update_min_vruntime(Some(vruntime));
        Some(p)
    }

    fn put_prev_task(&self, s: &Scheduler<P>, rq: &mut Rq, prev: TaskId) {
        self.update_curr(s, rq);
        let task = rq.task(prev);
        if task.on_rq == OnRq::Queued {
            let key = (task.vruntime, prev);
            rq.fair.tree.insert(key);
        }
    }

    fn set_curr_task(&self, _s: &Scheduler<P>, rq: &mut Rq) {
        let Some(curr) = rq.curr else {
            return;
        };
        let now = rq.clock_task;
        let task = rq.task_mut(curr);
        task.exec_start = now;
        let key = (task.vruntime, curr);
        rq.fair.tree.remove(&key);
    }

    fn task_tick(&self, s: &Scheduler<P>, rq: &mut Rq, curr: TaskId, _queued: bool) {
        self.update_curr(s, rq);
        let Some((left, _)) = rq.fair.leftmost() else {
            return;
        };
        let slice = calc_vruntime_delta(rq.fair.sched_slice(), task_weight(rq, curr));
        if rq.task(curr).vruntime > left + slice {
            s.resched_curr(rq);
        }
    }

    fn get_rr_interval(&self, _s: &Scheduler<P>, rq: &Rq, _p: TaskId) -> u64 {
        rq.fair.sched_slice()
    }

    fn prio_changed(&self, s: &Scheduler<P>, rq: &mut Rq, p: TaskId, old_prio: u32) {
        if rq.task(p).on_rq != OnRq::Queued {
            return;
        }
        if rq.is_curr(p) {
            if rq.task(p).prio > old_prio {
                s.resched_curr(rq);
            }
        } else {
            self.check_preempt_curr(s, rq, p, WakeFlags::empty());
        }
    }

    fn switched_from(&self, _s: &Scheduler<P>, rq: &mut Rq, p: TaskId) {
        // A queued task was made relative by its dequeue already.
        let min_vruntime = rq.fair.min_vruntime;
        let task = rq.task_mut(p);
        if task.on_rq != OnRq::Queued {
            task.vruntime = task.vruntime.saturating_sub(min_vruntime);
        }
    }

    fn switched_to(&self, s: &Scheduler<P>, rq: &mut Rq, p: TaskId) {
        if rq.task(p).on_rq != OnRq::Queued {
            return;
        }
        if rq.is_curr(p) {
            s.resched_curr(rq);
        } else if rq.curr_task().map_or(true, |c| c.class() == ClassKind::Fair) {
            self.check_preempt_curr(s, rq, p, WakeFlags::empty());
        }
    }

    fn select_task_rq(
        &self,
        s: &Scheduler<P>,
        p: &TaskSnapshot,
        cpu: usize,
        sd_flag: SdFlag,
        flags: WakeFlags,
    ) -> usize {
        match sd_flag {
            SdFlag::Wake | SdFlag::Fork => s
                .wakeup_balance(p, cpu, sd_flag, flags.contains(WakeFlags::SYNC))
                .unwrap_or(cpu),
            SdFlag::Exec => cpu,
        }
    }

    fn update_curr(&self, _s: &Scheduler<P>, rq: &mut Rq) {
        let Some(curr) = rq.curr else {
            return;
        };
        let now = rq.clock_task;
        let weight = task_weight(rq, curr);
        let vruntime = {
            let task = rq.task_mut(curr);
            if task.is_rt() || now <= task.exec_start {
                return;
            }
            let delta = now - task.exec_start;
            task.exec_start = now;
            task.sum_exec_runtime += delta;
            task.vruntime += calc_vruntime_delta(delta, weight);
            task.vruntime
        };
        rq.fair.update_min_vruntime(Some(vruntime));
    }
}
