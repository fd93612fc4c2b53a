//! Energy-aware selection
//!
//! Among allowed active CPUs the task fits, pick the one where adding the
//! task costs the least extra energy. Any CPU without a table voids the
//! comparison and the chain moves on.

use super::PlacementEnv;
use crate::sched::class::SdFlag;
use crate::sched::Scheduler;
use crate::traits::Platform;

impl<P: Platform> Scheduler<P> {
    pub(super) fn select_energy_cpu(
        &self,
        env: &PlacementEnv<'_>,
        sd_flag: SdFlag,
        _sync: bool,
    ) -> Option<usize> {
        let model = self.energy.as_deref()?;
        // Fork and exec balance spread load instead.
        if sd_flag != SdFlag::Wake {
            return None;
        }
        // Not while prev is overutilized.
        if self.platform.is_overutilized(env.prev_cpu) {
            return None;
        }

        let p = env.p;
        let candidates = p.cpus_allowed.and(self.root.span());
        // (cpu, delta, new_util)
        let mut best: Option<(usize, u64, u64)> = None;

        for cpu in candidates.iter() {
            let wake_util = self.cpu_util_without(cpu, p);
            let new_util = (wake_util + env.task_util).max(env.min_util);
            if new_util > self.topology.capacity_orig_of(cpu)
                || self.platform.would_overutilize(cpu, new_util)
            {
                continue;
            }

            let before = model.compute_energy(cpu, wake_util)?;
            let after = model.compute_energy(cpu, new_util)?;
            let delta = after.saturating_sub(before);

            let better = match best {
                None => true,
                Some((best_cpu, best_delta, best_util)) => {
                    delta < best_delta
                        || (delta == best_delta && new_util < best_util)
                        || (delta == best_delta
                            && new_util == best_util
                            && cpu == env.prev_cpu
                            && best_cpu != env.prev_cpu)
                }
            };
            if better {
                best = Some((cpu, delta, new_util));
            }
        }

        best.map(|(cpu, ..)| cpu)
    }
}
