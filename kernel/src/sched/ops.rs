//! Task lifecycle and scheduling entry points
//!
//! The public operations all follow the same discipline: look the task up
//! in the directory, lock its home run-queue, change what must change
//! through the class hooks, republish the snapshot, and finally run any
//! balance work the hooks queued.

use super::class::{BalanceCallbacks, DequeueFlags, EnqueueFlags, SchedClass, SdFlag, WakeFlags};
use super::fair::FAIR_CLASS;
use super::rq::{Rq, RqGuard};
use super::rt::RT_CLASS;
use super::task::{
    ClassKind, OnRq, Policy, Task, TaskId, TaskSnapshot, TaskSpec, WakeState, DEFAULT_PRIO,
    MAX_USER_RT_PRIO,
};
use super::Scheduler;
use crate::cpumask::CpuMask;
use crate::error::{Result, SchedError};
use crate::trace::{self, TraceEvent};
use crate::traits::Platform;
use alloc::vec::Vec;

const NICE_MIN: i32 = -20;
const NICE_MAX: i32 = 19;

/// Classes in pick order.
const CLASS_ORDER: [ClassKind; 2] = [ClassKind::Rt, ClassKind::Fair];

fn class<P: Platform>(kind: ClassKind) -> &'static dyn SchedClass<P> {
    match kind {
        ClassKind::Rt => &RT_CLASS,
        ClassKind::Fair => &FAIR_CLASS,
    }
}

fn validate_policy(policy: Policy, priority: i32) -> Result<()> {
    let valid = if policy.is_rt() {
        (1..=MAX_USER_RT_PRIO).contains(&priority)
    } else {
        (NICE_MIN..=NICE_MAX).contains(&priority)
    };
    if valid {
        Ok(())
    } else {
        Err(SchedError::InvalidPriority(priority))
    }
}

/// Public view of a task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskInfo {
    pub id: TaskId,
    pub name: heapless::String<16>,
    pub policy: Policy,
    pub prio: u32,
    pub normal_prio: u32,
    pub rt_priority: u32,
    pub nice: i32,
    pub cpu: usize,
    pub cpus_allowed: CpuMask,
    pub on_rq: OnRq,
    pub state: WakeState,
    pub running: bool,
    pub victim: bool,
    pub rt_util: u64,
    pub sum_exec_runtime: u64,
    /// Remaining RR ticks
    pub time_slice: u32,
    pub rttime_expired: bool,
}

impl TaskInfo {
    fn of(task: &Task, running: bool) -> Self {
        Self {
            id: task.id,
            name: task.name.clone(),
            policy: task.policy,
            prio: task.prio,
            normal_prio: task.normal_prio,
            rt_priority: task.rt_priority,
            nice: task.nice(),
            cpu: task.cpu,
            cpus_allowed: task.cpus_allowed,
            on_rq: task.on_rq,
            state: task.state,
            running,
            victim: task.victim,
            rt_util: task.rt.avg.util_avg,
            sum_exec_runtime: task.sum_exec_runtime,
            time_slice: task.rt.time_slice,
            rttime_expired: task.rttime_expired,
        }
    }
}

impl<P: Platform> Scheduler<P> {
    // ---------------------------------------------------------------------
    // Building blocks used by the classes and the migration code
    // ---------------------------------------------------------------------

    pub(crate) fn activate_task(&self, rq: &mut Rq, p: TaskId, flags: EnqueueFlags) {
        let kind = {
            let task = rq.task_mut(p);
            task.on_rq = OnRq::Queued;
            task.class()
        };
        class::<P>(kind).enqueue_task(self, rq, p, flags);
    }

    pub(crate) fn deactivate_task(&self, rq: &mut Rq, p: TaskId, flags: DequeueFlags) {
        let kind = {
            let task = rq.task_mut(p);
            task.on_rq = OnRq::No;
            task.class()
        };
        class::<P>(kind).dequeue_task(self, rq, p, flags);
    }

    /// Rehome a dequeued task from `src` to `dst`.
    pub(crate) fn set_task_cpu(&self, src: &mut Rq, dst: &mut Rq, p: TaskId) {
        let kind = src.task(p).class();
        class::<P>(kind).migrate_task_rq(self, src, p, dst.cpu);

        let Some(mut task) = src.tasks.remove(&p) else {
            sched_bug!("task {} left cpu{} twice", p, src.cpu);
        };
        sched_bug_on!(
            task.rt.run.linked || task.rt.push.linked,
            "task {} migrated while still linked on cpu{}",
            p,
            src.cpu
        );
        task.cpu = dst.cpu;
        dst.tasks.insert(p, task);
        self.directory.write().insert(p, dst.cpu);
    }

    /// Let `p`, just made runnable on `rq`, preempt the running task if it
    /// deserves to.
    pub(crate) fn check_preempt_curr(&self, rq: &mut Rq, p: TaskId, flags: WakeFlags) {
        let kind = rq.task(p).class();
        match rq.curr_task().map(Task::class) {
            Some(curr) if curr == kind => class::<P>(kind).check_preempt_curr(self, rq, p, flags),
            Some(curr) if kind > curr => {}
            _ => self.resched_curr(rq),
        }
    }

    /// Run the push/pull work queued on `rq`.
    pub(crate) fn run_balance_callbacks<'a>(&'a self, mut rq: RqGuard<'a>) -> RqGuard<'a> {
        let callbacks = core::mem::replace(&mut rq.callbacks, BalanceCallbacks::empty());
        if callbacks.contains(BalanceCallbacks::PUSH) {
            rq = self.push_rt_tasks(rq);
        }
        if callbacks.contains(BalanceCallbacks::PULL) {
            rq = self.pull_rt_task(rq);
        }
        self.publish(&rq);
        rq
    }

    fn unlock_rq(&self, rq: RqGuard<'_>) {
        let rq = self.run_balance_callbacks(rq);
        drop(rq);
    }

    fn is_cpu_allowed(&self, p: &TaskSnapshot, cpu: usize) -> bool {
        p.cpus_allowed.test(cpu) && self.root.span().test(cpu)
    }

    /// First active allowed CPU, or any active CPU when the affinity has
    /// none left.
    fn select_fallback_rq(&self, allowed: CpuMask, prev: usize) -> usize {
        let active = self.root.span();
        allowed
            .and(active)
            .first()
            .or_else(|| active.first())
            .unwrap_or(prev)
    }

    fn select_task_rq(&self, p: &TaskSnapshot, kind: ClassKind, sd_flag: SdFlag, flags: WakeFlags) -> usize {
        let cpu = if p.nr_cpus_allowed > 1 {
            class::<P>(kind).select_task_rq(self, p, p.cpu, sd_flag, flags)
        } else {
            p.cpu
        };
        if self.is_cpu_allowed(p, cpu) {
            cpu
        } else {
            self.select_fallback_rq(p.cpus_allowed, p.cpu)
        }
    }

    /// Move `p` from `src` to `dst` whatever its state. A running task is
    /// taken off the CPU first; `src` reschedules.
    fn relocate_task(&self, src: &mut Rq, dst: &mut Rq, p: TaskId, reason: &'static str) {
        if src.is_curr(p) {
            let kind = src.task(p).class();
            class::<P>(kind).put_prev_task(self, src, p);
            src.curr = None;
            self.resched_curr(src);
        }

        if src.task(p).on_rq == OnRq::Queued {
            self.move_queued_task(src, dst, p, reason);
            self.check_preempt_curr(dst, p, WakeFlags::MIGRATED);
        } else {
            let from = src.cpu;
            self.set_task_cpu(src, dst, p);
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
    }

    /// Lock `p`'s home run-queue and, if different, `target`'s.
    fn lock_task_and_target(&self, p: TaskId, target: usize) -> Result<(RqGuard<'_>, Option<RqGuard<'_>>)> {
        loop {
            let home = self.task_cpu(p)?;
            if home == target {
                let rq = self.lock_rq(home);
                if rq.tasks.contains_key(&p) {
                    return Ok((rq, None));
                }
                continue;
            }
            let (src, dst) = self.double_rq_lock(home, target);
            if src.tasks.contains_key(&p) {
                return Ok((src, Some(dst)));
            }
        }
    }

    // ---------------------------------------------------------------------
    // Task lifecycle
    // ---------------------------------------------------------------------

    /// Create a task and make it runnable.
    pub fn spawn(&self, spec: TaskSpec) -> Result<TaskId> {
        validate_policy(spec.policy, spec.priority)?;

        let possible = self.topology.possible_mask();
        let active = self.root.span();
        let allowed = spec.cpus_allowed.unwrap_or(possible).and(possible);
        if !allowed.intersects(active) {
            return Err(SchedError::EmptyAffinity);
        }

        let cpu = match spec.cpu {
            Some(cpu) => {
                self.check_cpu(cpu)?;
                if !active.test(cpu) {
                    return Err(SchedError::CpuOffline(cpu));
                }
                if allowed.test(cpu) {
                    cpu
                } else {
                    self.select_fallback_rq(allowed, cpu)
                }
            }
            None => self.select_fallback_rq(allowed, 0),
        };

        let id = self.alloc_task_id();
        let mut task = Task::new(id, &spec, cpu, allowed);
        task.rt.time_slice = self.rr_timeslice();
        {
            let mut rq = self.lock_rq(cpu);
            rq.tasks.insert(id, task);
            self.directory.write().insert(id, cpu);
            self.publish(&rq);
        }
        log::debug!(
            "spawned task {} ({:?}, prio {}) on cpu{}",
            id,
            spec.policy,
            spec.priority,
            cpu
        );

        self.try_to_wake_up(id, SdFlag::Fork, WakeFlags::FORK)?;
        Ok(id)
    }

    /// Wake a sleeping task. Returns false if it was already runnable.
    pub fn wake_up(&self, id: TaskId, flags: WakeFlags) -> Result<bool> {
        self.try_to_wake_up(id, SdFlag::Wake, flags)
    }

    fn try_to_wake_up(&self, id: TaskId, sd_flag: SdFlag, flags: WakeFlags) -> Result<bool> {
        // Claim the wakeup and snapshot what placement needs.
        let (snap, kind) = {
            let mut rq = self.task_rq_lock(id)?;
            let task = rq.task_mut(id);
            if task.state != WakeState::Sleeping {
                return Ok(false);
            }
            task.state = WakeState::Waking;
            task.rt.sync_flag = flags.contains(WakeFlags::SYNC);
            (TaskSnapshot::of(task), task.class())
        };

        let mut target = self.select_task_rq(&snap, kind, sd_flag, flags);

        loop {
            let (mut src, dst) = self.lock_task_and_target(id, target)?;

            // The affinity or the target's state may have changed meanwhile.
            let allowed = src.task(id).cpus_allowed;
            let target_ok = allowed.test(target) && self.root.span().test(target);
            if !target_ok {
                target = self.select_fallback_rq(allowed, src.cpu);
                continue;
            }

            let mut wake_flags = flags;
            let mut enqueue = EnqueueFlags::WAKEUP;
            let mut rq = match dst {
                Some(mut dst) => {
                    let from = src.cpu;
                    self.set_task_cpu(&mut src, &mut dst, id);
                    trace::emit(
                        &self.platform,
                        TraceEvent::Migrate {
                            task: id,
                            from,
                            to: dst.cpu,
                            reason: "wakeup",
                        },
                    );
                    self.publish(&src);
                    drop(src);
                    wake_flags |= WakeFlags::MIGRATED;
                    enqueue |= EnqueueFlags::MIGRATED;
                    dst
                }
                None => src,
            };

            self.update_rq_clock(&mut rq);
            rq.task_mut(id).state = WakeState::Runnable;
            self.activate_task(&mut rq, id, enqueue);
            self.check_preempt_curr(&mut rq, id, wake_flags);
            let kind = rq.task(id).class();
            class::<P>(kind).task_woken(self, &mut rq, id);
            self.publish(&rq);

            log::trace!("woke task {} on cpu{}", id, rq.cpu);
            self.unlock_rq(rq);
            return Ok(true);
        }
    }

    /// Block a runnable task. A running task is switched out at once.
    pub fn sleep(&self, id: TaskId) -> Result<()> {
        let (cpu, was_running) = {
            let mut rq = self.task_rq_lock(id)?;
            if rq.task(id).on_rq != OnRq::Queued {
                return Ok(());
            }
            self.update_rq_clock(&mut rq);
            self.deactivate_task(&mut rq, id, DequeueFlags::SLEEP);
            rq.task_mut(id).state = WakeState::Sleeping;
            let running = rq.is_curr(id);
            if running {
                self.resched_curr(&rq);
            }
            self.publish(&rq);
            (rq.cpu, running)
        };
        if was_running {
            self.schedule(cpu)?;
        }
        Ok(())
    }

    /// Remove a task for good.
    pub fn exit(&self, id: TaskId) -> Result<()> {
        let (cpu, was_running) = {
            let mut rq = self.task_rq_lock(id)?;
            self.update_rq_clock(&mut rq);
            let kind = rq.task(id).class();
            if rq.task(id).on_rq == OnRq::Queued {
                self.deactivate_task(&mut rq, id, DequeueFlags::SLEEP);
            }
            let running = rq.is_curr(id);
            if running {
                class::<P>(kind).put_prev_task(self, &mut rq, id);
                rq.curr = None;
                self.resched_curr(&rq);
                // Nothing schedules out of a dead task; look for work now.
                if kind == ClassKind::Rt {
                    self.queue_pull_task(&mut rq);
                }
            }
            class::<P>(kind).task_dead(self, &mut rq, id);
            rq.tasks.remove(&id);
            self.directory.write().remove(&id);
            self.publish(&rq);
            let cpu = rq.cpu;
            self.unlock_rq(rq);
            (cpu, running)
        };
        self.ontime.forget(id);
        log::debug!("task {} exited on cpu{}", id, cpu);

        if was_running {
            self.schedule(cpu)?;
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Scheduling
    // ---------------------------------------------------------------------

    /// Pick the next task for `cpu` and make it current.
    pub fn schedule(&self, cpu: usize) -> Result<Option<TaskId>> {
        self.check_cpu(cpu)?;
        let mut rq = self.lock_rq(cpu);
        self.update_rq_clock(&mut rq);
        self.cpus[cpu].stat.clear_need_resched();

        let prev = rq.curr.filter(|p| rq.tasks.contains_key(p));
        if let Some(prev_kind) = prev.map(|p| rq.task(p).class()) {
            for kind in CLASS_ORDER.into_iter().filter(|&k| k >= prev_kind) {
                rq = class::<P>(kind).balance(self, rq, prev);
            }
        }

        if let Some(prev) = prev {
            let kind = rq.task(prev).class();
            class::<P>(kind).put_prev_task(self, &mut rq, prev);
        }
        rq.curr = None;

        let next = CLASS_ORDER
            .into_iter()
            .find_map(|kind| class::<P>(kind).pick_next_task(self, &mut rq));

        if next != prev {
            log::trace!("cpu{}: switch {:?} -> {:?}", cpu, prev, next);
        }
        self.publish(&rq);
        self.unlock_rq(rq);
        Ok(next)
    }

    /// The running task on `cpu` yields to its peers.
    pub fn yield_current(&self, cpu: usize) -> Result<Option<TaskId>> {
        self.check_cpu(cpu)?;
        {
            let mut rq = self.lock_rq(cpu);
            self.update_rq_clock(&mut rq);
            if let Some(curr) = rq.curr {
                let kind = rq.task(curr).class();
                class::<P>(kind).yield_task(self, &mut rq);
            }
        }
        self.schedule(cpu)
    }

    /// Periodic tick on `cpu`: charge the running task, fire the RT period
    /// timer when due and run a pending relay hop. Returns whether `cpu`
    /// needs to reschedule.
    pub fn tick(&self, cpu: usize) -> Result<bool> {
        self.check_cpu(cpu)?;
        {
            let mut rq = self.lock_rq(cpu);
            self.update_rq_clock(&mut rq);
            if let Some(curr) = rq.curr {
                let kind = rq.task(curr).class();
                class::<P>(kind).task_tick(self, &mut rq, curr, true);
            }
            self.publish(&rq);
            self.unlock_rq(rq);
        }

        if self
            .rt_period_expires()
            .is_some_and(|expires| self.platform.now() >= expires)
        {
            self.rt_period_timer();
        }
        self.run_irq_work(cpu);

        Ok(self.cpus[cpu].stat.need_resched())
    }

    // ---------------------------------------------------------------------
    // Attribute changes
    // ---------------------------------------------------------------------

    /// Change a task's policy and priority (nice value for fair policies).
    pub fn set_scheduler(&self, id: TaskId, policy: Policy, priority: i32) -> Result<()> {
        validate_policy(policy, priority)?;
        let rr_slice = self.rr_timeslice();
        let mut rq = self.task_rq_lock(id)?;
        self.change_task(&mut rq, id, |task| {
            task.policy = policy;
            if policy.is_rt() {
                task.rt_priority = priority as u32;
                if policy == Policy::RoundRobin {
                    task.rt.time_slice = rr_slice;
                }
            } else {
                task.rt_priority = 0;
                task.static_prio = (DEFAULT_PRIO as i32 + priority) as u32;
            }
            task.refresh_prio();
        });
        log::debug!("task {} set to {:?} at {}", id, policy, priority);
        self.unlock_rq(rq);
        Ok(())
    }

    /// Donate (or, with `None`, withdraw) a priority through priority
    /// inheritance.
    pub fn set_rt_mutex_prio(&self, id: TaskId, donor: Option<u32>) -> Result<()> {
        let mut rq = self.task_rq_lock(id)?;
        let unchanged = {
            let task = rq.task(id);
            let prio = donor.map_or(task.normal_prio, |d| d.min(task.normal_prio));
            task.pi_prio == donor && task.prio == prio
        };
        if !unchanged {
            self.change_task(&mut rq, id, |task| {
                task.pi_prio = donor;
                task.refresh_prio();
            });
        }
        self.unlock_rq(rq);
        Ok(())
    }

    /// Dequeue, mutate and requeue `id` around `f`, then tell the classes.
    fn change_task(&self, rq: &mut Rq, id: TaskId, f: impl FnOnce(&mut Task)) {
        self.update_rq_clock(rq);
        let (old_prio, old_kind, queued, running) = {
            let task = rq.task(id);
            (task.prio, task.class(), task.on_rq == OnRq::Queued, rq.is_curr(id))
        };

        // Work out the new priority without touching the task yet.
        let mut preview = rq.task(id).clone();
        f(&mut preview);
        let (new_prio, new_kind) = (preview.prio, preview.class());
        let relink = new_prio != old_prio || new_kind != old_kind;

        let mut dequeue = DequeueFlags::SAVE;
        let mut enqueue = EnqueueFlags::RESTORE;
        if relink {
            dequeue |= DequeueFlags::MOVE;
            enqueue |= EnqueueFlags::MOVE;
        }
        // A deboosted task keeps its turn.
        if old_prio < new_prio {
            enqueue |= EnqueueFlags::HEAD;
        }

        if queued {
            class::<P>(old_kind).dequeue_task(self, rq, id, dequeue);
            rq.task_mut(id).on_rq = OnRq::Migrating;
        }
        if running {
            class::<P>(old_kind).put_prev_task(self, rq, id);
        }

        {
            let task = rq.task_mut(id);
            task.policy = preview.policy;
            task.rt_priority = preview.rt_priority;
            task.static_prio = preview.static_prio;
            task.pi_prio = preview.pi_prio;
            task.rt.time_slice = preview.rt.time_slice;
            task.refresh_prio();
        }

        if queued {
            rq.task_mut(id).on_rq = OnRq::Queued;
            class::<P>(new_kind).enqueue_task(self, rq, id, enqueue);
        }
        if running {
            class::<P>(new_kind).set_curr_task(self, rq);
        }

        if old_kind != new_kind {
            class::<P>(old_kind).switched_from(self, rq, id);
            class::<P>(new_kind).switched_to(self, rq, id);
        } else if old_prio != new_prio {
            class::<P>(new_kind).prio_changed(self, rq, id, old_prio);
        }
        self.publish(rq);
    }

    /// Install a new affinity on a task homed on `rq`.
    fn apply_affinity(&self, rq: &mut Rq, id: TaskId, allowed: CpuMask) {
        let (kind, queued, running) = {
            let task = rq.task(id);
            (task.class(), task.on_rq == OnRq::Queued, rq.is_curr(id))
        };

        if queued {
            class::<P>(kind).dequeue_task(self, rq, id, DequeueFlags::SAVE);
            rq.task_mut(id).on_rq = OnRq::Migrating;
        }
        if running {
            class::<P>(kind).put_prev_task(self, rq, id);
        }
        {
            let task = rq.task_mut(id);
            task.cpus_allowed = allowed;
            task.nr_cpus_allowed = allowed.weight() as u32;
        }
        if queued {
            rq.task_mut(id).on_rq = OnRq::Queued;
            class::<P>(kind).enqueue_task(self, rq, id, EnqueueFlags::RESTORE);
        }
        if running {
            class::<P>(kind).set_curr_task(self, rq);
        }
        class::<P>(kind).set_cpus_allowed(self, rq, id);
        self.publish(rq);
    }

    /// Restrict a task to `mask`. A task homed on a CPU it may no longer
    /// use moves right away.
    pub fn set_affinity(&self, id: TaskId, mask: CpuMask) -> Result<()> {
        let allowed = mask.and(self.topology.possible_mask());
        if !allowed.intersects(self.root.span()) {
            return Err(SchedError::EmptyAffinity);
        }

        let mut rq = self.task_rq_lock(id)?;
        self.update_rq_clock(&mut rq);
        self.apply_affinity(&mut rq, id, allowed);

        if allowed.test(rq.cpu) {
            self.unlock_rq(rq);
            return Ok(());
        }

        let dest = self.select_fallback_rq(allowed, rq.cpu);
        let (mut rq, mut dst, _) = self.double_lock_balance(rq, dest);
        // Re-check after a possible unlock.
        let still_here = rq
            .tasks
            .get(&id)
            .is_some_and(|t| !t.cpus_allowed.test(rq.cpu));
        if still_here {
            self.relocate_task(&mut rq, &mut dst, id, "affinity");
        }
        self.publish(&dst);
        drop(dst);
        self.unlock_rq(rq);
        Ok(())
    }

    /// Bring a CPU into or out of the root domain. Tasks homed on a CPU
    /// going offline move to their fallback CPUs.
    pub fn set_cpu_online(&self, cpu: usize, online: bool) -> Result<()> {
        self.check_cpu(cpu)?;
        {
            let mut rq = self.lock_rq(cpu);
            if rq.online == online {
                return Ok(());
            }
            if online {
                self.root.add_cpu(cpu);
                rq.online = true;
                for kind in CLASS_ORDER {
                    class::<P>(kind).rq_online(self, &mut rq);
                }
            } else {
                if self.root.span() == CpuMask::single(cpu) {
                    return Err(SchedError::InvalidTopology("cannot offline the last cpu"));
                }
                for kind in CLASS_ORDER {
                    class::<P>(kind).rq_offline(self, &mut rq);
                }
                rq.online = false;
                self.root.remove_cpu(cpu);
            }
            self.publish(&rq);
        }
        log::info!("cpu{} {}", cpu, if online { "online" } else { "offline" });

        if !online {
            self.migrate_tasks_off(cpu);
        }
        Ok(())
    }

    fn migrate_tasks_off(&self, cpu: usize) {
        loop {
            let next = {
                let rq = self.lock_rq(cpu);
                rq.tasks
                    .values()
                    .next()
                    .map(|t| (t.id, self.select_fallback_rq(t.cpus_allowed, cpu)))
            };
            let Some((id, dest)) = next else {
                return;
            };
            let (mut src, mut dst) = self.double_rq_lock(cpu, dest);
            if src.tasks.contains_key(&id) {
                self.update_rq_clock(&mut dst);
                self.relocate_task(&mut src, &mut dst, id, "hotplug");
                if !dst.task(id).cpus_allowed.test(dest) {
                    log::warn!("task {} is no longer affine to cpu{}", id, cpu);
                    self.apply_affinity(&mut dst, id, self.topology.possible_mask());
                }
            }
            self.publish(&src);
            self.publish(&dst);
        }
    }

    // ---------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------

    pub fn task_info(&self, id: TaskId) -> Result<TaskInfo> {
        let rq = self.task_rq_lock(id)?;
        Ok(TaskInfo::of(rq.task(id), rq.is_curr(id)))
    }

    /// Every live task.
    pub fn tasks(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self.directory.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn current(&self, cpu: usize) -> Result<Option<TaskId>> {
        self.check_cpu(cpu)?;
        Ok(self.lock_rq(cpu).curr)
    }

    /// Runnable tasks on `cpu`, the running one included.
    pub fn nr_running(&self, cpu: usize) -> Result<u32> {
        self.check_cpu(cpu)?;
        Ok(self.lock_rq(cpu).nr_running())
    }

    pub fn need_resched(&self, cpu: usize) -> Result<bool> {
        self.check_cpu(cpu)?;
        Ok(self.cpus[cpu].stat.need_resched())
    }

    /// Queued RT tasks of `cpu` in pick order.
    pub fn rt_queue(&self, cpu: usize) -> Result<Vec<TaskId>> {
        self.check_cpu(cpu)?;
        let rq = self.lock_rq(cpu);
        Ok(rq.rt.active.iter(&rq.tasks).collect())
    }

    /// Pushable RT tasks of `cpu` in priority order.
    pub fn pushable_tasks(&self, cpu: usize) -> Result<Vec<TaskId>> {
        self.check_cpu(cpu)?;
        let rq = self.lock_rq(cpu);
        Ok(rq.rt.pushable.iter(&rq.tasks).collect())
    }

    /// Whether the RT class of `cpu` is throttled.
    pub fn rt_throttled(&self, cpu: usize) -> Result<bool> {
        Ok(self.rt_runtime(cpu)?.rt_throttled)
    }

    /// Round-robin interval of a task in ns (fair tasks report their slice).
    pub fn rr_interval(&self, id: TaskId) -> Result<u64> {
        let rq = self.task_rq_lock(id)?;
        let kind = rq.task(id).class();
        Ok(class::<P>(kind).get_rr_interval(self, &rq, id))
    }

    /// Check the RT run-queue structure of `cpu` against its tasks.
    pub fn verify_rq(&self, cpu: usize) -> Result<bool> {
        self.check_cpu(cpu)?;
        let rq = self.lock_rq(cpu);
        let overload_ok = !rq.online || self.root.overload_mask().test(cpu) == rq.rt.overloaded;
        Ok(rq.rt.verify(&rq.tasks) && overload_ok)
    }

    /// Whether `id` is currently marked ontime.
    pub fn is_ontime(&self, id: TaskId) -> bool {
        self.ontime.is_ontime(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::PlatformModel;
    use crate::sched::{SchedFeatures, Tunables};
    use crate::topology::Topology;

    fn sched(nr: usize) -> Scheduler<PlatformModel> {
        let topo = Topology::uniform(nr, 1024).unwrap();
        let tunables = Tunables {
            features: SchedFeatures::RT_RUNTIME_SHARE,
            ..Tunables::default()
        };
        Scheduler::new(PlatformModel::new(&topo), topo, tunables).unwrap()
    }

    #[test]
    fn test_validate_policy() {
        assert!(validate_policy(Policy::Fifo, 1).is_ok());
        assert!(validate_policy(Policy::RoundRobin, 99).is_ok());
        assert_eq!(validate_policy(Policy::Fifo, 0), Err(SchedError::InvalidPriority(0)));
        assert_eq!(validate_policy(Policy::Fifo, 100), Err(SchedError::InvalidPriority(100)));
        assert!(validate_policy(Policy::Normal, -20).is_ok());
        assert_eq!(validate_policy(Policy::Batch, 20), Err(SchedError::InvalidPriority(20)));
    }

    #[test]
    fn test_spawn_and_pick() {
        let s = sched(1);
        let fair = s.spawn(TaskSpec::normal()).unwrap();
        let rt = s.spawn(TaskSpec::fifo(10)).unwrap();
        assert_eq!(s.schedule(0).unwrap(), Some(rt));
        assert_eq!(s.nr_running(0).unwrap(), 2);

        s.sleep(rt).unwrap();
        assert_eq!(s.current(0).unwrap(), Some(fair));
        assert_eq!(s.task_info(rt).unwrap().state, WakeState::Sleeping);

        assert!(s.wake_up(rt, WakeFlags::empty()).unwrap());
        assert!(!s.wake_up(rt, WakeFlags::empty()).unwrap());
        assert!(s.need_resched(0).unwrap());
        assert_eq!(s.schedule(0).unwrap(), Some(rt));
        assert!(s.verify_rq(0).unwrap());
    }

    #[test]
    fn test_spawn_rejects_bad_input() {
        let s = sched(2);
        assert_eq!(
            s.spawn(TaskSpec::fifo(0)).err(),
            Some(SchedError::InvalidPriority(0))
        );
        assert_eq!(
            s.spawn(TaskSpec::normal().affinity(CpuMask::empty())).err(),
            Some(SchedError::EmptyAffinity)
        );
        assert_eq!(
            s.spawn(TaskSpec::normal().on_cpu(5)).err(),
            Some(SchedError::InvalidCpu(5))
        );
        assert_eq!(s.task_info(TaskId(999)).err(), Some(SchedError::NoSuchTask(TaskId(999))));
    }

    #[test]
    fn test_set_scheduler_keeps_place_when_prio_unchanged() {
        let s = sched(1);
        let a = s.spawn(TaskSpec::fifo(10).name("a")).unwrap();
        let b = s.spawn(TaskSpec::fifo(10).name("b")).unwrap();
        let c = s.spawn(TaskSpec::fifo(10).name("c")).unwrap();
        assert_eq!(s.rt_queue(0).unwrap(), [a, b, c]);

        // FIFO to RR at the same priority: position kept.
        s.set_scheduler(b, Policy::RoundRobin, 10).unwrap();
        assert_eq!(s.rt_queue(0).unwrap(), [a, b, c]);
        assert!(s.verify_rq(0).unwrap());

        // Raising a priority relinks at the tail of the new level.
        s.set_scheduler(a, Policy::Fifo, 5).unwrap();
        assert_eq!(s.rt_queue(0).unwrap(), [b, c, a]);
        s.set_scheduler(a, Policy::Fifo, 10).unwrap();
        assert_eq!(s.rt_queue(0).unwrap(), [b, c, a]);

        // Lowering one goes to the head.
        s.set_scheduler(c, Policy::Fifo, 20).unwrap();
        s.set_scheduler(c, Policy::Fifo, 10).unwrap();
        assert_eq!(s.rt_queue(0).unwrap(), [c, b, a]);
        assert!(s.verify_rq(0).unwrap());
    }

    #[test]
    fn test_class_switch() {
        let s = sched(1);
        let t = s.spawn(TaskSpec::normal()).unwrap();
        s.set_scheduler(t, Policy::Fifo, 50).unwrap();
        let info = s.task_info(t).unwrap();
        assert_eq!(info.prio, 49);
        assert_eq!(s.rt_queue(0).unwrap(), [t]);

        s.set_scheduler(t, Policy::Normal, 5).unwrap();
        let info = s.task_info(t).unwrap();
        assert_eq!(info.prio, DEFAULT_PRIO + 5);
        assert_eq!(info.nice, 5);
        assert!(s.rt_queue(0).unwrap().is_empty());
        assert_eq!(s.nr_running(0).unwrap(), 1);
        assert!(s.verify_rq(0).unwrap());
    }

    #[test]
    fn test_priority_inheritance() {
        let s = sched(1);
        let t = s.spawn(TaskSpec::fifo(10)).unwrap();
        s.set_rt_mutex_prio(t, Some(5)).unwrap();
        let info = s.task_info(t).unwrap();
        assert_eq!(info.prio, 5);
        assert_eq!(info.normal_prio, 89);
        s.set_rt_mutex_prio(t, None).unwrap();
        assert_eq!(s.task_info(t).unwrap().prio, 89);
        assert!(s.verify_rq(0).unwrap());
    }

    #[test]
    fn test_affinity_moves_task() {
        let s = sched(2);
        let t = s.spawn(TaskSpec::normal().on_cpu(0).affinity(CpuMask::single(0))).unwrap();
        assert_eq!(s.task_info(t).unwrap().cpu, 0);
        s.set_affinity(t, CpuMask::single(1)).unwrap();
        let info = s.task_info(t).unwrap();
        assert_eq!(info.cpu, 1);
        assert_eq!(info.on_rq, OnRq::Queued);
        assert_eq!(s.nr_running(0).unwrap(), 0);
        assert_eq!(s.nr_running(1).unwrap(), 1);
        assert_eq!(
            s.set_affinity(t, CpuMask::single(7)),
            Err(SchedError::EmptyAffinity)
        );
    }

    #[test]
    fn test_exit_removes_task() {
        let s = sched(1);
        let t = s.spawn(TaskSpec::fifo(10)).unwrap();
        s.schedule(0).unwrap();
        s.exit(t).unwrap();
        assert_eq!(s.current(0).unwrap(), None);
        assert!(s.tasks().is_empty());
        assert_eq!(s.exit(t), Err(SchedError::NoSuchTask(t)));
    }

    #[test]
    fn test_offline_migrates_tasks() {
        let s = sched(2);
        let a = s.spawn(TaskSpec::fifo(10).on_cpu(1).affinity(CpuMask::single(1))).unwrap();
        let b = s.spawn(TaskSpec::normal().on_cpu(1).affinity(CpuMask::single(1))).unwrap();
        s.set_cpu_online(1, false).unwrap();
        assert_eq!(s.task_info(a).unwrap().cpu, 0);
        assert_eq!(s.task_info(b).unwrap().cpu, 0);
        assert_eq!(s.task_info(a).unwrap().cpus_allowed, CpuMask::first_n(2));
        assert_eq!(s.nr_running(0).unwrap(), 2);
        assert!(!s.online_cpus().test(1));
        assert!(s.set_cpu_online(0, false).is_err());
        s.set_cpu_online(1, true).unwrap();
        assert_eq!(s.online_cpus(), CpuMask::first_n(2));
    }

    #[test]
    fn test_rr_interval() {
        let s = sched(1);
        let rr = s.spawn(TaskSpec::round_robin(5)).unwrap();
        let fifo = s.spawn(TaskSpec::fifo(5)).unwrap();
        assert_eq!(s.rr_interval(rr).unwrap(), 25 * 4_000_000);
        assert_eq!(s.rr_interval(fifo).unwrap(), 0);
    }
}
