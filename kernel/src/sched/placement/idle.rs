//! Prefer-idle selection
//!
//! Three candidates are tracked across every coregroup: the shallowest
//! idle CPU, the busy CPU with the most spare capacity, and the least
//! utilized busy CPU. They are preferred in that order.

use super::PlacementEnv;
use crate::sched::Scheduler;
use crate::trace::{self, TraceEvent};
use crate::traits::Platform;

#[derive(Clone, Copy, Debug)]
struct IdleBest {
    cpu: usize,
    idle_idx: i32,
    util: u64,
}

#[derive(Clone, Copy, Debug)]
struct SpareBest {
    cpu: usize,
    spare: u64,
}

#[derive(Clone, Copy, Debug)]
struct UtilBest {
    cpu: usize,
    wake_util: u64,
    new_util: u64,
    new_util_cuml: u64,
}

struct IdleSearch {
    boosted: bool,
    target_cap: u64,
    lowest_idle: Option<IdleBest>,
    highest_spare: Option<SpareBest>,
    lowest_util: Option<UtilBest>,
}

impl IdleSearch {
    fn new(boosted: bool) -> Self {
        Self {
            boosted,
            target_cap: if boosted { 0 } else { u64::MAX },
            lowest_idle: None,
            highest_spare: None,
            lowest_util: None,
        }
    }

    fn mark_lowest_idle(&mut self, cpu: usize, idle_idx: i32, new_util: u64) {
        let better = match self.lowest_idle {
            None => true,
            Some(best) if idle_idx < best.idle_idx => true,
            Some(best) => idle_idx == best.idle_idx && new_util < best.util,
        };
        if better {
            self.lowest_idle = Some(IdleBest { cpu, idle_idx, util: new_util });
        }
    }

    /// Boosted tasks lean to big capacity, the rest to small. A CPU of the
    /// wrong size for the current target is passed over.
    fn mark_highest_spare(&mut self, cpu: usize, capacity_orig: u64, capacity_curr: u64, new_util: u64) {
        if self.boosted && capacity_orig < self.target_cap {
            return;
        }
        if !self.boosted && capacity_orig > self.target_cap {
            return;
        }
        if capacity_curr < new_util {
            return;
        }

        let spare = capacity_orig.saturating_sub(new_util);
        if self.highest_spare.map_or(true, |best| spare > best.spare) {
            self.target_cap = capacity_orig;
            self.highest_spare = Some(SpareBest { cpu, spare });
        }
    }

    fn mark_lowest_util(&mut self, cand: UtilBest) {
        let better = match self.lowest_util {
            None => true,
            Some(best) => {
                if cand.wake_util > best.wake_util || cand.new_util > best.new_util {
                    false
                } else if cand.new_util == best.new_util {
                    cand.new_util_cuml < best.new_util_cuml
                } else {
                    true
                }
            }
        };
        if better {
            self.lowest_util = Some(cand);
        }
    }

    fn result(&self) -> Option<(usize, &'static str)> {
        self.lowest_idle
            .map(|b| (b.cpu, "lowest_idle_util"))
            .or_else(|| self.highest_spare.map(|b| (b.cpu, "highest_spare_util")))
            .or_else(|| self.lowest_util.map(|b| (b.cpu, "lowest_util")))
    }
}

impl<P: Platform> Scheduler<P> {
    pub(super) fn prefer_idle_cpu(&self, env: &PlacementEnv<'_>) -> Option<usize> {
        if !env.prefer_idle {
            return None;
        }
        self.select_idle_cpu(env)
    }

    /// Search every allowed active CPU for an idle or lightly loaded home.
    pub(crate) fn select_idle_cpu(&self, env: &PlacementEnv<'_>) -> Option<usize> {
        let p = env.p;
        let candidates = p.cpus_allowed.and(self.root.span());
        let mut search = IdleSearch::new(env.boost > 0);

        for cg in self.topology.coregroups() {
            for cpu in cg.cpus.and(candidates).iter() {
                let wake_util = self.cpu_util_without(cpu, p);
                let new_util = (wake_util + env.task_util).max(env.min_util);
                if self.platform.would_overutilize(cpu, new_util) {
                    continue;
                }

                if self.is_cpu_idle(cpu) {
                    search.mark_lowest_idle(cpu, self.platform.idle_state_idx(cpu), new_util);
                    continue;
                }

                let capacity_orig = self.topology.capacity_orig_of(cpu);
                let capacity_curr = self.platform.capacity_curr_of(cpu);
                search.mark_highest_spare(cpu, capacity_orig, capacity_curr, new_util);

                let mut new_util_cuml = self.platform.cpu_util(cpu) + env.min_util;
                // Already counted in this CPU's window.
                if cpu == p.cpu && p.has_history {
                    new_util_cuml = new_util_cuml.saturating_sub(env.task_util);
                }
                search.mark_lowest_util(UtilBest {
                    cpu,
                    wake_util,
                    new_util,
                    new_util_cuml,
                });
            }
        }

        let (cpu, state) = match search.result() {
            Some(found) => found,
            None if !self.platform.is_overutilized(env.prev_cpu) => (env.prev_cpu, "prev_cpu"),
            None => return None,
        };
        trace::emit(
            &self.platform,
            TraceEvent::SelectIdle {
                task: p.id,
                cpu: Some(cpu),
                state,
            },
        );
        Some(cpu)
    }
}
