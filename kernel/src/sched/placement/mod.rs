//! Wakeup placement for fair-class tasks
//!
//! [`Scheduler::wakeup_balance`] walks a fixed chain of strategies and
//! returns the first CPU one of them settles on:
//!
//! | # | strategy          | applies when                                  |
//! |---|-------------------|-----------------------------------------------|
//! | 1 | `fast path`       | prev CPU is shallow idle in the start tier    |
//! | 2 | `service`         | task prefers high capacity                    |
//! | 3 | `ontime migration`| task is (or just became) an ontime task       |
//! | 4 | `prefer-perf`     | task prefers performance                      |
//! | 5 | `global boosting` | the platform is globally boosted              |
//! | 6 | `prefer-idle`     | task prefers idle CPUs                        |
//! | 7 | `energy cpu`      | an energy model is installed                  |
//! | 8 | `proper cpu`      | always                                        |
//!
//! Apart from the ontime classification nothing here mutates state, so
//! equal inputs give equal answers.

mod energy;
mod idle;
mod ontime;
mod perf;
mod proper;

pub use ontime::{Ontime, DEFAULT_ONTIME_DOWN, DEFAULT_ONTIME_UP};

use super::class::SdFlag;
use super::pelt::boosted_util;
use super::task::{TaskId, TaskSnapshot};
use super::Scheduler;
use crate::trace::{self, TraceEvent};
use crate::traits::Platform;

/// Utilization above which a task no longer fits the slowest tier, as a
/// percentage of its capacity.
const START_FAST_PCT: u64 = 61;

/// Capacity headroom a task needs to fit a CPU (`util * 1280 <= cap * 1024`).
const CAPACITY_MARGIN: u64 = 1280;

/// Inputs of one placement, gathered once per wakeup.
pub(crate) struct PlacementEnv<'a> {
    pub p: &'a TaskSnapshot,
    pub task_util: u64,
    pub min_util: u64,
    pub boost: i32,
    pub prefer_idle: bool,
    pub prefer_perf: bool,
    pub prefer_high_cap: bool,
    pub start_cpu_cap: u64,
    pub prev_cpu: usize,
}

impl<P: Platform> Scheduler<P> {
    /// Pick a CPU for a waking fair-class task. `None` leaves the choice to
    /// the caller, which keeps the previous CPU.
    pub(crate) fn wakeup_balance(
        &self,
        p: &TaskSnapshot,
        prev_cpu: usize,
        sd_flag: SdFlag,
        sync: bool,
    ) -> Option<usize> {
        let Some(env) = self.placement_env(p, prev_cpu) else {
            self.wakeup_trace(p.id, None, "fail");
            return None;
        };

        let strategies: [(&'static str, &dyn Fn() -> Option<usize>); 8] = [
            ("fast path", &|| self.select_fast_path(&env)),
            ("service", &|| self.select_service_cpu(&env)),
            ("ontime migration", &|| self.ontime_task_wakeup(&env)),
            ("prefer-perf", &|| self.prefer_perf_cpu(&env)),
            ("global boosting", &|| self.global_boosting(&env)),
            ("prefer-idle", &|| self.prefer_idle_cpu(&env)),
            ("energy cpu", &|| self.select_energy_cpu(&env, sd_flag, sync)),
            ("proper cpu", &|| Some(self.select_proper_cpu(&env))),
        ];

        for (state, strategy) in strategies {
            if let Some(cpu) = strategy() {
                self.wakeup_trace(p.id, Some(cpu), state);
                return Some(cpu);
            }
        }
        self.wakeup_trace(p.id, None, "fail");
        None
    }

    fn wakeup_trace(&self, task: TaskId, cpu: Option<usize>, state: &'static str) {
        log::trace!(target: "nyx_sched::wakeup", "task {} -> {:?} ({})", task, cpu, state);
        trace::emit(&self.platform, TraceEvent::WakeupBalance { task, cpu, state });
    }

    fn placement_env<'a>(&self, p: &'a TaskSnapshot, prev_cpu: usize) -> Option<PlacementEnv<'a>> {
        let task_util = self.platform.task_util_est(p.id);
        let prefer_perf = self.platform.prefer_perf(p.id);
        let boost = self.platform.task_boost(p.id);
        let start_cpu = self.start_cpu(p, task_util, prefer_perf)?;

        Some(PlacementEnv {
            p,
            task_util,
            min_util: boosted_util(self.topology.capacity_orig_of(p.cpu), task_util, boost),
            boost,
            prefer_idle: self.platform.prefer_idle(p.id),
            prefer_perf,
            prefer_high_cap: self.platform.prefer_high_cap(p.id),
            start_cpu_cap: self.topology.capacity_orig_of(start_cpu),
            prev_cpu,
        })
    }

    /// First active CPU of the tier the search starts from: the slowest,
    /// unless the task needs (or is asked) to run fast and may.
    fn start_cpu(&self, p: &TaskSnapshot, task_util: u64, prefer_perf: bool) -> Option<usize> {
        let active = self.root.span();
        let slow = self.topology.slowest_mask().and(active).first();
        let fast = self.topology.fastest_mask().and(active);

        if !fast.is_empty() && fast.intersects(p.cpus_allowed) {
            let slow_cap = slow.map_or(0, |cpu| self.topology.capacity_orig_of(cpu));
            if prefer_perf
                || self.platform.global_boosted()
                || task_util * 100 >= slow_cap * START_FAST_PCT
            {
                return fast.first();
            }
        }
        slow.or_else(|| active.first())
    }

    fn select_fast_path(&self, env: &PlacementEnv<'_>) -> Option<usize> {
        let prev = env.prev_cpu;
        let fits = self.root.span().test(prev)
            && env.p.cpus_allowed.test(prev)
            && self.is_cpu_idle(prev)
            && env.start_cpu_cap == self.topology.capacity_orig_of(prev)
            && !self.platform.is_overutilized(prev)
            && self.platform.idle_state_idx(prev) <= 1;
        fits.then_some(prev)
    }

    /// Fair utilization of `cpu` without `p`'s blocked contribution.
    pub(crate) fn cpu_util_without(&self, cpu: usize, p: &TaskSnapshot) -> u64 {
        let util = self.platform.cpu_util(cpu);
        if cpu != p.cpu || !p.has_history {
            return util;
        }
        let util = util - util.min(self.platform.task_util_est(p.id));
        util.min(self.topology.capacity_orig_of(cpu))
    }

    /// Whether moving `p` between `prev_cpu` and `cpu` would leave it on a
    /// CPU it does not fit.
    fn wake_cap(&self, p: &TaskSnapshot, cpu: usize, prev_cpu: Option<usize>) -> bool {
        let prev_cap = prev_cpu.map_or(u64::MAX, |prev| self.topology.capacity_orig_of(prev));
        let min_cap = self.topology.capacity_orig_of(cpu).min(prev_cap);
        let max_cap = self.topology.max_capacity();

        // Symmetric enough that capacity does not matter.
        if max_cap - min_cap < max_cap >> 3 {
            return false;
        }
        self.platform.task_util_est(p.id) * CAPACITY_MARGIN > min_cap * 1024
    }

    /// Whether `p` may take `cpu` from its current task. Foreground work on
    /// a faster CPU is protected.
    pub(crate) fn is_cpu_preemptible(
        &self,
        p: &TaskSnapshot,
        prev_cpu: Option<usize>,
        cpu: usize,
        sync: bool,
    ) -> bool {
        if sync && self.platform.task_boost(p.id) > 0 {
            return true;
        }

        let stat = &self.cpus[cpu].stat;
        if let Some(curr) = stat.curr() {
            if !self.topology.is_slowest_cpu(cpu) && self.platform.task_top_app(curr) {
                if curr != p.id && self.platform.task_on_top(curr) {
                    return false;
                }
                if self.platform.prefer_high_cap(curr) {
                    return false;
                }
            }
        }

        !(sync && (stat.nr_running() != 1 || self.wake_cap(p, cpu, prev_cpu)))
    }
}
