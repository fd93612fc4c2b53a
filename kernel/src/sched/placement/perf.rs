//! Performance-tier selection shared by the service, ontime, prefer-perf
//! and global-boost strategies.

use super::PlacementEnv;
use crate::sched::Scheduler;
use crate::traits::Platform;

impl<P: Platform> Scheduler<P> {
    /// Best allowed active CPU of the fastest tier: the shallowest idle one,
    /// otherwise the least utilized.
    pub(crate) fn select_perf_cpu(&self, env: &PlacementEnv<'_>) -> Option<usize> {
        let p = env.p;
        let candidates = self
            .topology
            .fastest_mask()
            .and(self.root.span())
            .and(p.cpus_allowed);

        let mut best_idle: Option<(usize, i32)> = None;
        let mut best_active: Option<(usize, u64)> = None;

        for cpu in candidates.iter() {
            if self.is_cpu_idle(cpu) {
                let idx = self.platform.idle_state_idx(cpu);
                if best_idle.map_or(true, |(_, best)| idx < best) {
                    best_idle = Some((cpu, idx));
                }
                continue;
            }
            let util = self.cpu_util_without(cpu, p) + self.cpus[cpu].stat.rt_util();
            if best_active.map_or(true, |(_, best)| util < best) {
                best_active = Some((cpu, util));
            }
        }

        best_idle
            .map(|(cpu, _)| cpu)
            .or_else(|| best_active.map(|(cpu, _)| cpu))
    }

    pub(super) fn select_service_cpu(&self, env: &PlacementEnv<'_>) -> Option<usize> {
        if !env.prefer_high_cap {
            return None;
        }
        self.select_perf_cpu(env)
    }

    pub(super) fn prefer_perf_cpu(&self, env: &PlacementEnv<'_>) -> Option<usize> {
        if !env.prefer_perf {
            return None;
        }
        self.select_perf_cpu(env)
    }

    pub(super) fn global_boosting(&self, env: &PlacementEnv<'_>) -> Option<usize> {
        if !self.platform.global_boosted() {
            return None;
        }
        self.select_perf_cpu(env)
    }
}
