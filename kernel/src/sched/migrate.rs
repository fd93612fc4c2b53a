//! RT push/pull migration
//!
//! A CPU with more than one queued RT task is *overloaded* and advertises
//! itself in the root domain's `rto_mask`. Its surplus is pushed to CPUs
//! running lower-priority work, and CPUs about to run something less
//! important pull from it.
//!
//! Every cross-CPU move follows the same shape: probe the lock-free
//! snapshots, take both run-queue locks in ascending CPU order, re-check
//! what the probe decided, then commit or give up on that candidate.
//!
//! With `RT_PUSH_IPI` a pulling CPU does not lock overloaded CPUs itself;
//! it starts a relay that visits each overloaded CPU in turn and lets that
//! CPU push locally. The relay is a single token guarded by `relay`, and
//! `rto_loop_next` counts requests so one raised mid-walk forces another
//! pass.

use super::class::{DequeueFlags, EnqueueFlags};
use super::rq::{Rq, RqGuard};
use super::task::{OnRq, TaskId, TaskSnapshot};
use super::{SchedFeatures, Scheduler};
use crate::cpumask::{AtomicCpuMask, CpuMask};
use crate::sync::RelayLock;
use crate::trace::{self, TraceEvent};
use crate::traits::Platform;
use core::sync::atomic::{fence, AtomicU32, Ordering};

/// Attempts at finding and locking a lower-priority run-queue.
pub const RT_MAX_TRIES: usize = 3;

/// Position of the push relay.
#[derive(Clone, Copy, Debug, Default)]
pub struct RtoCursor {
    /// CPU currently holding the relay, `None` when idle
    pub rto_cpu: Option<usize>,
    /// Value of `rto_loop_next` the current pass started from
    pub rto_loop: u32,
}

/// CPUs eligible for RT migration and their overload state.
pub struct RootDomain {
    span: AtomicCpuMask,
    rto_mask: AtomicCpuMask,
    rto_count: AtomicU32,
    relay: RelayLock<RtoCursor>,
    rto_loop_next: AtomicU32,
    rto_loop_start: AtomicU32,
}

impl RootDomain {
    pub fn new() -> Self {
        Self {
            span: AtomicCpuMask::new(CpuMask::empty()),
            rto_mask: AtomicCpuMask::new(CpuMask::empty()),
            rto_count: AtomicU32::new(0),
            relay: RelayLock::new(RtoCursor::default(), "rto_lock"),
            rto_loop_next: AtomicU32::new(0),
            rto_loop_start: AtomicU32::new(0),
        }
    }

    /// Online CPUs.
    #[inline]
    pub fn span(&self) -> CpuMask {
        self.span.load(Ordering::Acquire)
    }

    pub(crate) fn add_cpu(&self, cpu: usize) {
        self.span.set(cpu, Ordering::Release);
    }

    pub(crate) fn remove_cpu(&self, cpu: usize) {
        self.span.clear(cpu, Ordering::Release);
    }

    pub fn set_overload(&self, cpu: usize) {
        self.rto_mask.set(cpu, Ordering::Relaxed);
        // A reader that sees the count must also see the mask bit.
        fence(Ordering::Release);
        self.rto_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn clear_overload(&self, cpu: usize) {
        self.rto_count.fetch_sub(1, Ordering::Relaxed);
        self.rto_mask.clear(cpu, Ordering::Relaxed);
    }

    pub fn overload_count(&self) -> u32 {
        self.rto_count.load(Ordering::Relaxed)
    }

    pub fn overload_mask(&self) -> CpuMask {
        self.rto_mask.load(Ordering::Relaxed)
    }
}

impl Default for RootDomain {
    fn default() -> Self {
        Self::new()
    }
}

/// First pushable task of `rq` allowed on `cpu`.
fn pick_highest_pushable_task(rq: &Rq, cpu: usize) -> Option<TaskId> {
    rq.rt.pushable.iter(&rq.tasks).find(|&id| {
        !rq.is_curr(id) && rq.tasks.get(&id).is_some_and(|t| t.cpus_allowed.test(cpu))
    })
}

impl<P: Platform> Scheduler<P> {
    /// Lowest-priority CPU `p` could run on, or `None` to stay put.
    pub(crate) fn find_lowest_rq(&self, p: &TaskSnapshot) -> Option<usize> {
        if self.features().contains(SchedFeatures::FLUID_RT) {
            return self.find_lowest_rq_fluid(p);
        }

        if p.nr_cpus_allowed == 1 {
            return None;
        }
        let lowest = self
            .cpupri
            .find(p.prio, p.cpus_allowed)?
            .and(self.root.span());

        // Prev first, then its coregroup.
        if lowest.test(p.cpu) {
            return Some(p.cpu);
        }
        lowest
            .and(self.topology.coregroup_mask(p.cpu))
            .first()
            .or_else(|| lowest.first())
    }

    /// Lock `other` while holding `this`. Returns the two guards and
    /// whether `this` was released on the way, in which case anything
    /// read under it must be re-checked.
    pub(crate) fn double_lock_balance<'a>(
        &'a self,
        this: RqGuard<'a>,
        other: usize,
    ) -> (RqGuard<'a>, RqGuard<'a>, bool) {
        let this_cpu = this.cpu;
        sched_bug_on!(this_cpu == other, "cpu{}: double lock on itself", this_cpu);

        if other > this_cpu {
            let other = self.lock_rq(other);
            return (this, other, false);
        }
        if let Some(other) = self.try_lock_rq(other) {
            return (this, other, false);
        }

        self.publish(&this);
        drop(this);
        let other = self.lock_rq(other);
        let this = self.lock_rq(this_cpu);
        (this, other, true)
    }

    /// Find a CPU running lower-priority work than `task` and lock it.
    pub(crate) fn find_lock_lowest_rq<'a>(
        &'a self,
        mut this: RqGuard<'a>,
        task: TaskId,
    ) -> (RqGuard<'a>, Option<RqGuard<'a>>) {
        for _ in 0..RT_MAX_TRIES {
            let snap = TaskSnapshot::of(this.task(task));
            let Some(cpu) = self.find_lowest_rq(&snap) else {
                break;
            };
            if cpu == this.cpu {
                break;
            }

            // Equal or higher work there; retrying releases nothing and
            // would see the same.
            if self.cpus[cpu].stat.highest_curr() <= snap.prio {
                break;
            }

            let (t, lowest, dropped) = self.double_lock_balance(this, cpu);
            this = t;

            if dropped {
                let still_ours = !this.is_curr(task)
                    && this.tasks.get(&task).is_some_and(|t| {
                        t.cpus_allowed.test(cpu) && t.is_rt() && t.on_rq == OnRq::Queued
                    });
                if !still_ours {
                    self.publish(&lowest);
                    return (this, None);
                }
            }

            if lowest.rt.highest_prio.curr > this.task(task).prio {
                return (this, Some(lowest));
            }

            log::trace!(
                target: "nyx_sched::rt",
                "cpu{} gained work before task {} could move, retrying",
                cpu,
                task
            );
            self.publish(&lowest);
        }
        (this, None)
    }

    /// Move one pushable task off an overloaded CPU. Returns whether a
    /// task moved.
    fn push_rt_task<'a>(&'a self, mut this: RqGuard<'a>) -> (RqGuard<'a>, bool) {
        if !this.rt.overloaded {
            return (this, false);
        }
        let Some(mut next) = this.rt.pushable.first() else {
            return (this, false);
        };

        loop {
            sched_bug_on!(this.is_curr(next), "cpu{}: running task {} is pushable", this.cpu, next);

            // It slipped in above the running task: preempt instead.
            if this.task(next).prio < this.curr_prio() {
                self.resched_curr(&this);
                return (this, false);
            }

            let (t, lowest) = self.find_lock_lowest_rq(this, next);
            this = t;

            match lowest {
                Some(mut lowest) => {
                    self.move_queued_task(&mut this, &mut lowest, next, "push");
                    self.resched_curr(&lowest);
                    self.publish(&lowest);
                    return (this, true);
                }
                None => match this.rt.pushable.first() {
                    // Still the best candidate but nowhere to go; others
                    // will pull when they can.
                    Some(task) if task == next => return (this, false),
                    None => return (this, false),
                    Some(task) => next = task,
                },
            }
        }
    }

    /// Push until nothing more can move.
    pub(crate) fn push_rt_tasks<'a>(&'a self, mut this: RqGuard<'a>) -> RqGuard<'a> {
        loop {
            let (t, moved) = self.push_rt_task(this);
            this = t;
            if !moved {
                return this;
            }
        }
    }

    /// Pull higher-priority work from overloaded CPUs onto `this`.
    pub(crate) fn pull_rt_task<'a>(&'a self, mut this: RqGuard<'a>) -> RqGuard<'a> {
        let count = self.root.overload_count();
        if count == 0 {
            return this;
        }
        fence(Ordering::Acquire);

        let this_cpu = this.cpu;
        if count == 1 && self.root.overload_mask().test(this_cpu) {
            return this;
        }

        if self.features().contains(SchedFeatures::RT_PUSH_IPI) {
            self.tell_cpu_to_push();
            return this;
        }

        let mut resched = false;
        for cpu in self.root.overload_mask().iter() {
            if cpu == this_cpu {
                continue;
            }
            // Unlocked precheck; a stale value only costs a missed or a
            // wasted attempt.
            if self.cpus[cpu].stat.highest_next() >= this.rt.highest_prio.curr {
                continue;
            }

            let (t, mut src, _) = self.double_lock_balance(this, cpu);
            this = t;

            if let Some(p) = pick_highest_pushable_task(&src, this_cpu) {
                let prio = src.task(p).prio;
                // Woken above its own CPU's current task; it will run
                // there shortly.
                if prio < this.rt.highest_prio.curr && prio >= src.curr_prio() {
                    resched = true;
                    self.move_queued_task(&mut src, &mut this, p, "pull");
                }
            }
            self.publish(&src);
        }

        if resched {
            self.resched_curr(&this);
        }
        this
    }

    /// Relocate a queued, non-running task between two locked run-queues.
    pub(crate) fn move_queued_task(&self, src: &mut Rq, dst: &mut Rq, p: TaskId, reason: &'static str) {
        let from = src.cpu;
        self.deactivate_task(src, p, DequeueFlags::empty());
        src.task_mut(p).on_rq = OnRq::Migrating;
        self.set_task_cpu(src, dst, p);
        dst.task_mut(p).on_rq = OnRq::Queued;
        self.activate_task(dst, p, EnqueueFlags::MIGRATED);

        trace::emit(
            &self.platform,
            TraceEvent::Migrate {
                task: p,
                from,
                to: dst.cpu,
                reason,
            },
        );
    }

    /// Next overloaded CPU for the relay, starting another pass if new
    /// requests arrived since the current one began.
    fn rto_next_cpu(&self, cursor: &mut RtoCursor) -> Option<usize> {
        loop {
            let cpu = self.root.overload_mask().next(cursor.rto_cpu);
            cursor.rto_cpu = cpu;
            if cpu.is_some() {
                return cpu;
            }

            let next = self.root.rto_loop_next.load(Ordering::Acquire);
            if cursor.rto_loop == next {
                return None;
            }
            cursor.rto_loop = next;
        }
    }

    /// Ask overloaded CPUs to push, starting the relay if it is idle.
    pub(crate) fn tell_cpu_to_push(&self) {
        self.root.rto_loop_next.fetch_add(1, Ordering::Release);

        // Only one CPU starts a relay at a time.
        if self
            .root
            .rto_loop_start
            .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return;
        }

        let cpu = {
            let mut cursor = self.root.relay.lock();
            // A relay in flight picks up the new request on its own.
            if cursor.rto_cpu.is_none() {
                self.rto_next_cpu(&mut cursor)
            } else {
                None
            }
        };
        self.root.rto_loop_start.store(0, Ordering::Release);

        if let Some(cpu) = cpu {
            self.cpus[cpu].stat.queue_push_work();
        }
    }

    /// One relay hop on `cpu`: push locally, then hand the relay on.
    fn rto_push_work(&self, cpu: usize) {
        if self.cpus[cpu].stat.has_pushable() {
            let mut rq = self.lock_rq(cpu);
            self.update_rq_clock(&mut rq);
            let rq = self.push_rt_tasks(rq);
            self.publish(&rq);
        }

        let next = {
            let mut cursor = self.root.relay.lock();
            self.rto_next_cpu(&mut cursor)
        };
        if let Some(next) = next {
            self.cpus[next].stat.queue_push_work();
        }
    }

    /// Run the relay hop pending on `cpu`, if any. Returns whether one ran.
    pub fn run_irq_work(&self, cpu: usize) -> bool {
        if cpu >= self.cpus.len() || !self.cpus[cpu].stat.take_push_work() {
            return false;
        }
        self.rto_push_work(cpu);
        true
    }

    /// Run relay hops on every CPU until none is pending. Returns the
    /// number of hops.
    pub fn drain_irq_work(&self) -> usize {
        let mut hops = 0;
        loop {
            let ran = (0..self.cpus.len())
                .filter(|&cpu| self.run_irq_work(cpu))
                .count();
            if ran == 0 {
                return hops;
            }
            hops += ran;
        }
    }

    /// CPUs currently advertising RT overload.
    pub fn overloaded_cpus(&self) -> CpuMask {
        self.root.overload_mask()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::PlatformModel;
    use crate::sched::{TaskSpec, Tunables, MAX_RT_PRIO};
    use crate::topology::Topology;

    fn sched() -> Scheduler<PlatformModel> {
        let topo = Topology::uniform(2, 1024).unwrap();
        let tunables = Tunables {
            features: SchedFeatures::RT_RUNTIME_SHARE,
            ..Tunables::default()
        };
        Scheduler::new(PlatformModel::new(&topo), topo, tunables).unwrap()
    }

    #[test]
    fn test_lock_lowest_gives_up_on_target_that_gained_equal_work() {
        let s = sched();
        let a = s.spawn(TaskSpec::fifo(50).on_cpu(0).affinity(CpuMask::single(0))).unwrap();
        assert_eq!(s.schedule(0).unwrap(), Some(a));
        let c = s.spawn(TaskSpec::fifo(60).on_cpu(1).affinity(CpuMask::single(1))).unwrap();
        assert_eq!(s.schedule(1).unwrap(), Some(c));
        let b = s.spawn(TaskSpec::fifo(10).on_cpu(0)).unwrap();
        assert_eq!(s.pushable_tasks(0).unwrap(), [b]);

        let b_prio = s.lock_rq(0).task(b).prio;
        let c_prio = s.lock_rq(1).task(c).prio;

        // CPU 1 advertises nothing RT, but under its lock it already
        // holds work as important as b.
        {
            let mut rq = s.lock_rq(1);
            rq.rt.highest_prio.curr = MAX_RT_PRIO;
            s.publish(&rq);
            s.cpupri.set(1, Some(MAX_RT_PRIO));
            rq.rt.highest_prio.curr = b_prio;
        }

        let (this, lowest) = s.find_lock_lowest_rq(s.lock_rq(0), b);
        assert!(lowest.is_none());
        assert!(this.tasks.contains_key(&b));
        assert!(!this.is_curr(b));
        drop(this);

        // The locked state was republished when the candidate was dropped.
        assert_eq!(s.cpus[1].stat.highest_curr(), b_prio);

        {
            let mut rq = s.lock_rq(1);
            rq.rt.highest_prio.curr = c_prio;
            s.cpupri.set(1, Some(c_prio));
            s.publish(&rq);
        }
        assert_eq!(s.task_info(b).unwrap().cpu, 0);
        assert!(s.verify_rq(0).unwrap());
        assert!(s.verify_rq(1).unwrap());
    }

    #[test]
    fn test_overload_mask_and_count() {
        let rd = RootDomain::new();
        rd.set_overload(2);
        rd.set_overload(5);
        assert_eq!(rd.overload_count(), 2);
        assert_eq!(rd.overload_mask(), CpuMask::from_cpus(&[2, 5]));
        rd.clear_overload(2);
        assert_eq!(rd.overload_count(), 1);
        assert_eq!(rd.overload_mask(), CpuMask::single(5));
    }

    #[test]
    fn test_span() {
        let rd = RootDomain::new();
        rd.add_cpu(0);
        rd.add_cpu(3);
        rd.remove_cpu(0);
        assert_eq!(rd.span(), CpuMask::single(3));
        assert!(rd.relay.lock().rto_cpu.is_none());
    }
}
