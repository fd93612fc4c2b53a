//! Last-resort placement: the first coregroup at or above the start tier
//! that has room for the task.

use super::PlacementEnv;
use crate::sched::Scheduler;
use crate::trace::{self, TraceEvent};
use crate::traits::Platform;

struct ProperSearch {
    best_active: Option<(usize, u64)>,
    /// (cpu, capacity, idle index, util)
    best_idle: Option<(usize, u64, i32, u64)>,
}

impl<P: Platform> Scheduler<P> {
    pub(super) fn select_proper_cpu(&self, env: &PlacementEnv<'_>) -> usize {
        let p = env.p;
        let active = self.root.span();
        let mut search = ProperSearch {
            best_active: None,
            best_idle: None,
        };

        for cg in self.topology.coregroups() {
            // Skip tiers slower than where the search starts.
            if cg.capacity < env.start_cpu_cap {
                continue;
            }

            for cpu in cg.cpus.and(active).and(p.cpus_allowed).iter() {
                let capacity_orig = self.topology.capacity_orig_of(cpu);
                let wake_util = self.cpu_util_without(cpu, p);
                let new_util = (wake_util + env.task_util).max(env.min_util);
                if new_util > capacity_orig {
                    continue;
                }

                if self.is_cpu_idle(cpu) {
                    let idle_idx = self.platform.idle_state_idx(cpu);
                    let better = match search.best_idle {
                        None => true,
                        Some((best, cap, best_idx, best_util)) => {
                            if cap != capacity_orig {
                                false
                            } else if idle_idx != best_idx {
                                idle_idx < best_idx
                            } else if best == env.prev_cpu {
                                false
                            } else if cpu == env.prev_cpu {
                                true
                            } else {
                                new_util < best_util
                            }
                        }
                    };
                    if better {
                        search.best_idle = Some((cpu, capacity_orig, idle_idx, new_util));
                    }
                    continue;
                }

                if search.best_active.map_or(true, |(_, util)| new_util <= util) {
                    search.best_active = Some((cpu, new_util));
                }
            }

            if search.best_active.is_some() || search.best_idle.is_some() {
                break;
            }
        }

        let best_idle = search.best_idle.map(|(cpu, ..)| cpu);
        let best_active = search.best_active.map(|(cpu, _)| cpu);

        let chosen = match (best_active, best_idle) {
            (Some(active_cpu), Some(idle_cpu)) => {
                let protected = !self.topology.is_slowest_cpu(active_cpu)
                    && !self.is_cpu_preemptible(p, None, active_cpu, false);
                if env.prefer_idle || protected {
                    Some(idle_cpu)
                } else {
                    Some(active_cpu)
                }
            }
            (active_cpu, idle_cpu) => active_cpu.or(idle_cpu),
        };

        let util = match chosen {
            Some(_) if chosen == best_idle => search.best_idle.map_or(0, |(.., util)| util),
            Some(_) => search.best_active.map_or(0, |(_, util)| util),
            None => 0,
        };
        trace::emit(
            &self.platform,
            TraceEvent::SelectProper {
                task: p.id,
                cpu: chosen,
                util,
            },
        );

        // Nothing fits: any other CPU is as good as prev.
        chosen.unwrap_or(env.prev_cpu)
    }
}
