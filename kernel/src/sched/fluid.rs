//! Fluid RT placement
//!
//! Capacity-aware CPU selection for waking RT tasks on heterogeneous
//! systems. Candidates are searched in three passes, each cheaper for the
//! rest of the system than the next:
//!
//! 1. an idle CPU (`IDLE-FIRST`),
//! 2. a CPU running lower-priority work (`RT-RECESS` / `FAIR-RECESS`),
//! 3. a CPU whose running task can be displaced (`VICTIM-*`).
//!
//! Passes 1 and 2 walk the coregroup domains circularly, starting from the
//! first domain whose coverage threshold fits the task. Every probe here
//! reads [`RqStat`](super::rq::RqStat) snapshots and never takes a
//! run-queue lock.

use super::pelt::boosted_util;
use super::task::{rt_prio, TaskSnapshot, MAX_RT_PRIO};
use super::Scheduler;
use crate::cpumask::{AtomicCpuMask, CpuMask};
use crate::error::{Result, SchedError};
use crate::topology::{Topology, MAX_COREGROUPS};
use crate::trace::{self, TraceEvent};
use crate::traits::Platform;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use heapless::Vec;

const RATIO_SCALE_SHIFT: u32 = 10;

/// Default coverage ratio, in percent.
pub const DEFAULT_COVERAGE_RATIO: u32 = 100;

/// Scale `v` by a percentage `r`.
#[inline]
pub fn ratio_scale(v: u64, r: u32) -> u64 {
    (v * r as u64 * 10) >> RATIO_SCALE_SHIFT
}

/// Load weight per pair of RT priorities, 0 (highest) first.
const RTPRIO_TO_WEIGHT: [u64; 51] = [
    10419729, 9472481, 8611347, 7828497, 7116815, 6469832, 5881666, 5346969, 4860881, 4418982,
    4017257, 3652052, 3320047, 3018224, 2743840, 2494400, 2267637, 2061488, 1874080, 1703709,
    1548826, 1408024, 1280022, 1163656, 1057869, 961699, 874272, 794793, 722539, 656854, 597140,
    542854, 493504, 448640, 407854, 370777, 337070, 306427, 278570, 253245, 230223, 209294,
    190267, 172970, 157246, 142950, 129955, 118141, 107401, 97637, 88761,
];

/// Weight of a priority. RT priorities interpolate between table steps;
/// normal priorities use the fair-class nice weights.
pub fn weight_from_rtprio(prio: u32) -> u64 {
    if !rt_prio(prio) {
        let idx = (prio - MAX_RT_PRIO) as usize;
        return super::fair::NICE_TO_WEIGHT[idx.min(39)] as u64;
    }
    let idx = (prio >> 1) as usize;
    if (idx << 1) as u32 == prio {
        RTPRIO_TO_WEIGHT[idx]
    } else {
        (RTPRIO_TO_WEIGHT[idx] + RTPRIO_TO_WEIGHT[idx + 1]) >> 1
    }
}

/// Ratios of one coregroup domain, in percent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrtRatios {
    /// Share of a CPU's capacity a task may use and still prefer the domain
    pub coverage: u32,
    /// Share of the domain's capacity under which it counts as idle
    pub active: u32,
}

impl Default for FrtRatios {
    fn default() -> Self {
        Self {
            coverage: DEFAULT_COVERAGE_RATIO,
            active: 0,
        }
    }
}

/// Snapshot of a domain's tunables and derived thresholds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrtDomainInfo {
    pub coregroup: usize,
    pub cpus: CpuMask,
    pub coverage_ratio: u32,
    pub coverage_thr: u64,
    pub active_ratio: u32,
    pub active_thr: u64,
}

/// Per-coregroup fluid state.
pub struct FrtDomain {
    pub coregroup: usize,
    pub cpus: CpuMask,
    coverage_ratio: AtomicU32,
    coverage_thr: AtomicU64,
    active_ratio: AtomicU32,
    active_thr: AtomicU64,
}

impl FrtDomain {
    fn new(topology: &Topology, coregroup: usize, ratios: FrtRatios) -> Self {
        let dom = Self {
            coregroup,
            cpus: topology.coregroups()[coregroup].cpus,
            coverage_ratio: AtomicU32::new(0),
            coverage_thr: AtomicU64::new(0),
            active_ratio: AtomicU32::new(0),
            active_thr: AtomicU64::new(0),
        };
        // A zero coverage ratio in the boot description means "unset".
        let coverage = if ratios.coverage == 0 {
            DEFAULT_COVERAGE_RATIO
        } else {
            ratios.coverage
        };
        dom.set_coverage_ratio(topology, coverage);
        dom.set_active_ratio(topology, ratios.active);
        dom
    }

    fn max_capacity(&self, topology: &Topology) -> u64 {
        self.cpus
            .first()
            .map_or(0, |cpu| topology.capacity_orig_of(cpu))
    }

    fn set_coverage_ratio(&self, topology: &Topology, ratio: u32) {
        let ratio = ratio.min(100);
        self.coverage_ratio.store(ratio, Ordering::Relaxed);
        self.coverage_thr
            .store(ratio_scale(self.max_capacity(topology), ratio), Ordering::Relaxed);
    }

    fn set_active_ratio(&self, topology: &Topology, ratio: u32) {
        let ratio = ratio.min(100);
        let capacity = self.max_capacity(topology) * self.cpus.weight() as u64;
        self.active_ratio.store(ratio, Ordering::Relaxed);
        self.active_thr
            .store(ratio_scale(capacity, ratio), Ordering::Relaxed);
    }

    pub fn coverage_thr(&self) -> u64 {
        self.coverage_thr.load(Ordering::Relaxed)
    }

    pub fn info(&self) -> FrtDomainInfo {
        FrtDomainInfo {
            coregroup: self.coregroup,
            cpus: self.cpus,
            coverage_ratio: self.coverage_ratio.load(Ordering::Relaxed),
            coverage_thr: self.coverage_thr.load(Ordering::Relaxed),
            active_ratio: self.active_ratio.load(Ordering::Relaxed),
            active_thr: self.active_thr.load(Ordering::Relaxed),
        }
    }
}

/// Fluid placement state shared by all CPUs.
pub struct FluidRt {
    /// One per coregroup, in topology order (slowest first); the walk
    /// order wraps around.
    domains: Vec<FrtDomain, MAX_COREGROUPS>,
    /// CPUs of domains not parked by the activity tracker
    activated: AtomicCpuMask,
    lock: spin::Mutex<()>,
}

impl FluidRt {
    /// Domains for every coregroup; missing `ratios` entries take defaults.
    pub fn new(topology: &Topology, ratios: &[FrtRatios]) -> Result<Self> {
        let mut domains = Vec::new();
        for cg in 0..topology.coregroups().len() {
            let r = ratios.get(cg).copied().unwrap_or_default();
            domains
                .push(FrtDomain::new(topology, cg, r))
                .map_err(|_| SchedError::InvalidTopology("more coregroups than fluid domains"))?;
        }
        Ok(Self {
            domains,
            activated: AtomicCpuMask::new(topology.possible_mask()),
            lock: spin::Mutex::new(()),
        })
    }

    pub fn domains(&self) -> &[FrtDomain] {
        &self.domains
    }

    fn domain(&self, coregroup: usize) -> Result<&FrtDomain> {
        self.domains
            .get(coregroup)
            .ok_or(SchedError::NoSuchCoregroup(coregroup))
    }

    pub fn activated(&self) -> CpuMask {
        self.activated.load(Ordering::Acquire)
    }
}

/// Per-wakeup inputs of a fluid search.
struct RtEnv<'a> {
    p: &'a TaskSnapshot,
    task_util: u64,
    min_util: u64,
    prefer_perf: bool,
    prev_cpu: usize,
}

impl<P: Platform> Scheduler<P> {
    /// Utilization `cpu` would carry without `p`'s own blocked
    /// contribution. Only the discounted value is capped at capacity.
    pub(crate) fn frt_cpu_util_wake(&self, cpu: usize, p: &TaskSnapshot) -> u64 {
        let util = self.platform.cpu_util(cpu) + self.cpus[cpu].stat.rt_util();
        if cpu != p.cpu || !p.rt_attached {
            return util;
        }
        let util = util - util.min(p.rt_util);
        util.min(self.topology.capacity_orig_of(cpu))
    }

    /// First allowed CPU of the first domain whose coverage fits the task,
    /// or the last allowed CPU seen.
    fn frt_find_prefer_cpu(&self, env: &RtEnv<'_>) -> usize {
        let mut allowed_cpu = 0;
        for dom in self.fluid.domains() {
            let Some(first) = dom.cpus.first() else {
                continue;
            };
            if env.prefer_perf && self.topology.is_slowest_cpu(first) {
                continue;
            }
            let coverage_thr = dom.coverage_thr();
            for cpu in dom.cpus.and(env.p.cpus_allowed).iter() {
                allowed_cpu = cpu;
                if env.task_util < coverage_thr {
                    return allowed_cpu;
                }
            }
        }
        allowed_cpu
    }

    /// Projected load of `cpu` with `p` on it, or `None` if it would not
    /// fit.
    fn frt_projected_load(&self, cpu: usize, env: &RtEnv<'_>) -> Option<u64> {
        let load = (self.frt_cpu_util_wake(cpu, env.p) + env.task_util).max(env.min_util);
        (load <= self.topology.capacity_orig_of(cpu)).then_some(load)
    }

    /// Domain indices starting at `first`, wrapping around.
    fn frt_walk(&self, first: usize) -> impl Iterator<Item = usize> {
        let n = self.fluid.domains().len();
        (0..n).map(move |i| (first + i) % n)
    }

    fn find_idle_cpu(&self, env: &RtEnv<'_>) -> Option<usize> {
        let prefer = self.topology.coregroup_of(self.frt_find_prefer_cpu(env));
        let active = self.root.span();

        let mut candidates = env
            .p
            .cpus_allowed
            .and(active)
            .and(self.fluid.activated());
        if candidates.is_empty() {
            candidates = env.p.cpus_allowed;
        }

        let mut best = None;
        let mut max_prio: Option<u32> = None;
        let mut min_load = u64::MAX;

        for d in self.frt_walk(prefer) {
            let dom = &self.fluid.domains()[d];
            for cpu in dom.cpus.and(candidates).iter() {
                if !self.is_cpu_idle(cpu) {
                    continue;
                }
                if env.prefer_perf && self.topology.is_slowest_cpu(cpu) {
                    continue;
                }
                let cpu_prio = self.cpus[cpu].stat.highest_curr();
                if max_prio.is_some_and(|max| cpu_prio < max) {
                    continue;
                }
                let Some(load) = self.frt_projected_load(cpu, env) else {
                    continue;
                };

                if max_prio.map_or(true, |max| cpu_prio > max)
                    || load < min_load
                    || (load == min_load && env.prev_cpu == cpu)
                {
                    min_load = load;
                    max_prio = Some(cpu_prio);
                    best = Some(cpu);
                }
            }

            if best.is_some() {
                self.frt_stat(env.p, best, "IDLE-FIRST");
                return best;
            }
        }
        None
    }

    fn find_recessive_cpu(&self, env: &RtEnv<'_>) -> Option<usize> {
        let lowest = self.cpupri.find(env.p.prio, env.p.cpus_allowed)?;
        let candidates = lowest.and(self.root.span());
        let prefer = self.topology.coregroup_of(self.frt_find_prefer_cpu(env));

        let mut best = None;
        let mut min_load = u64::MAX;

        for d in self.frt_walk(prefer) {
            let dom = &self.fluid.domains()[d];
            for cpu in dom.cpus.and(candidates).iter() {
                if env.prefer_perf && self.topology.is_slowest_cpu(cpu) {
                    continue;
                }
                let Some(load) = self.frt_projected_load(cpu, env) else {
                    continue;
                };
                if load < min_load || (load == min_load && env.prev_cpu == cpu) {
                    min_load = load;
                    best = Some(cpu);
                }
            }

            if let Some(cpu) = best {
                let label = if self.cpus[cpu].stat.curr_is_rt() {
                    "RT-RECESS"
                } else {
                    "FAIR-RECESS"
                };
                self.frt_stat(env.p, best, label);
                return best;
            }
        }
        None
    }

    /// Look for a CPU in `group` whose running task can make room for `p`.
    /// A CPU running non-RT work wins outright; otherwise the RT task with
    /// the smallest capacity-relative weighted demand below `p`'s own is
    /// marked as victim.
    fn find_victim(&self, p: &TaskSnapshot, group: CpuMask) -> Option<usize> {
        if !p.is_rt() {
            return None;
        }

        let mut min_cap = self.topology.capacity_orig_of(p.cpu);
        let mut min_weight = p.rt_util * weight_from_rtprio(p.prio);
        let mut best = None;

        for cpu in group.iter() {
            let stat = &self.cpus[cpu].stat;
            if stat.curr_nr_allowed() < 2 {
                continue;
            }
            if !stat.curr_is_rt() {
                self.frt_stat(p, Some(cpu), "VICTIM-FAIR");
                return Some(cpu);
            }

            let cap = self.topology.capacity_orig_of(cpu);
            let weight = stat.curr_util() * weight_from_rtprio(stat.curr_prio());
            let lighter = if cap == min_cap {
                weight < min_weight
            } else {
                // Compare demand relative to capacity.
                (weight as u128) * (min_cap as u128) < (min_weight as u128) * (cap as u128)
            };
            if lighter {
                min_weight = weight;
                min_cap = cap;
                best = Some(cpu);
            }
        }

        let cpu = best?;
        if let Some(victim) = self.cpus[cpu].stat.curr() {
            self.cpus[cpu].stat.mark_victim(victim);
            log::debug!(target: "nyx_sched::fluid", "task {} on cpu{} marked victim", victim, cpu);
        }
        self.frt_stat(p, best, "VICTIM-RT");
        best
    }

    /// Fluid placement of a waking RT task. `None` means no valid CPU.
    pub(crate) fn find_lowest_rq_fluid(&self, p: &TaskSnapshot) -> Option<usize> {
        if p.nr_cpus_allowed == 1 {
            self.frt_stat(p, None, "NA ALLOWED");
            return self.frt_fallback(p, None);
        }

        let env = RtEnv {
            p,
            task_util: p.rt_util,
            min_util: boosted_util(
                self.topology.capacity_orig_of(p.cpu),
                p.rt_util,
                self.platform.task_boost(p.id),
            ),
            prefer_perf: self.platform.prefer_perf(p.id),
            prev_cpu: p.cpu,
        };

        let mut best = self.find_idle_cpu(&env);
        if best.is_none() {
            best = self.find_recessive_cpu(&env);
        }
        if best.is_none() {
            let active = self.root.span();
            for cpu in active.iter() {
                if self.topology.coregroup_mask(cpu).first() != Some(cpu) {
                    continue;
                }
                if env.prefer_perf && self.topology.is_slowest_cpu(cpu) {
                    continue;
                }
                let group = self
                    .topology
                    .coregroup_mask(cpu)
                    .and(p.cpus_allowed)
                    .and(active);
                best = self.find_victim(p, group);
                if best.is_some() {
                    break;
                }
            }
        }
        self.frt_fallback(p, best)
    }

    fn frt_fallback(&self, p: &TaskSnapshot, best: Option<usize>) -> Option<usize> {
        let cpu = best.unwrap_or(p.cpu);
        if !self.root.span().test(cpu) {
            self.frt_stat(p, Some(cpu), "NOTHING_VALID");
            return None;
        }
        Some(cpu)
    }

    fn frt_stat(&self, p: &TaskSnapshot, cpu: Option<usize>, state: &'static str) {
        trace::emit(
            &self.platform,
            TraceEvent::FluidStat {
                task: p.id,
                cpu,
                util: p.rt_util,
                state,
            },
        );
    }

    /// Park fast domains while the domain below them is also idle. Runs
    /// from the tick; skipped if another CPU is already updating.
    pub(crate) fn update_activated_cpus(&self) {
        let Some(_guard) = self.fluid.lock.try_lock() else {
            return;
        };

        let active = self.root.span();
        let mut mask = self.topology.possible_mask();
        let mut prev_idle: Option<CpuMask> = None;

        for dom in self.fluid.domains().iter().rev() {
            let cpus = dom.cpus.and(active);
            let Some(first) = cpus.first() else {
                continue;
            };

            let util_sum: u64 = cpus
                .iter()
                .map(|cpu| self.platform.cpu_util(cpu) + self.cpus[cpu].stat.rt_util())
                .sum();
            let capacity = self.topology.capacity_orig_of(first) * cpus.weight() as u64;
            let active_thr = ratio_scale(capacity, dom.info().active_ratio);

            if util_sum < active_thr {
                if let Some(faster) = prev_idle {
                    mask = mask.andnot(faster);
                }
                prev_idle = Some(dom.cpus);
            }

            trace::emit(
                &self.platform,
                TraceEvent::FluidActivated {
                    coregroup: dom.coregroup,
                    util_sum,
                    active_thr,
                    mask: mask.bits(),
                },
            );
        }

        self.fluid.activated.store(mask, Ordering::Release);
    }

    /// CPUs fluid placement currently considers for idle-first selection.
    pub fn activated_cpus(&self) -> CpuMask {
        self.fluid.activated()
    }

    /// Set a domain's coverage ratio (percent, capped at 100).
    pub fn set_coverage_ratio(&self, coregroup: usize, ratio: u32) -> Result<()> {
        self.fluid
            .domain(coregroup)?
            .set_coverage_ratio(&self.topology, ratio);
        log::info!(target: "nyx_sched::fluid", "coregroup{} coverage ratio {}", coregroup, ratio.min(100));
        Ok(())
    }

    /// Set a domain's active ratio (percent, capped at 100).
    pub fn set_active_ratio(&self, coregroup: usize, ratio: u32) -> Result<()> {
        self.fluid
            .domain(coregroup)?
            .set_active_ratio(&self.topology, ratio);
        log::info!(target: "nyx_sched::fluid", "coregroup{} active ratio {}", coregroup, ratio.min(100));
        Ok(())
    }

    pub fn frt_domain(&self, coregroup: usize) -> Result<FrtDomainInfo> {
        Ok(self.fluid.domain(coregroup)?.info())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ratio_scale() {
        assert_eq!(ratio_scale(1024, 100), 1000);
        assert_eq!(ratio_scale(1024, 0), 0);
        assert_eq!(ratio_scale(2048, 50), 1000);
    }

    #[test]
    fn test_weight_from_rtprio() {
        assert_eq!(weight_from_rtprio(0), 10419729);
        assert_eq!(weight_from_rtprio(1), (10419729 + 9472481) >> 1);
        assert_eq!(weight_from_rtprio(98), 97637);
        assert_eq!(weight_from_rtprio(99), (97637 + 88761) >> 1);
        assert_eq!(weight_from_rtprio(120), 1024);
        assert!(weight_from_rtprio(10) > weight_from_rtprio(50));
    }

    #[test]
    fn test_boosted_util() {
        assert_eq!(boosted_util(1024, 200, 0), 200);
        assert_eq!(boosted_util(1024, 224, 50), 624);
        assert_eq!(boosted_util(1024, 200, -50), 100);
        assert_eq!(boosted_util(100, 200, 10), 200);
    }

    #[test]
    fn test_cpu_util_wake_caps_only_discounted_util() {
        use crate::platform::PlatformModel;
        use crate::sched::{TaskId, Tunables};

        let topo = Topology::big_little(4, 512, 4, 1024).unwrap();
        let s = Scheduler::new(PlatformModel::new(&topo), topo, Tunables::default()).unwrap();
        s.platform().set_cpu_util(1, 900);
        s.platform().set_cpu_util(2, 900);

        let p = TaskSnapshot {
            id: TaskId(99),
            prio: 89,
            cpu: 1,
            cpus_allowed: CpuMask::first_n(8),
            nr_cpus_allowed: 8,
            rt_util: 100,
            rt_attached: true,
            has_history: true,
        };
        assert_eq!(s.frt_cpu_util_wake(1, &p), 512);
        assert_eq!(s.frt_cpu_util_wake(2, &p), 900);

        let detached = TaskSnapshot { rt_attached: false, ..p };
        assert_eq!(s.frt_cpu_util_wake(1, &detached), 900);
    }

    #[test]
    fn test_domain_thresholds() {
        let topo = Topology::big_little(4, 512, 4, 1024).unwrap();
        let fluid = FluidRt::new(&topo, &[FrtRatios { coverage: 0, active: 25 }]).unwrap();
        let little = fluid.domain(0).unwrap().info();
        assert_eq!(little.coverage_ratio, 100);
        assert_eq!(little.coverage_thr, ratio_scale(512, 100));
        assert_eq!(little.active_thr, ratio_scale(512 * 4, 25));

        let big = fluid.domain(1).unwrap().info();
        assert_eq!(big.active_thr, 0);
        assert_eq!(fluid.activated(), CpuMask::first_n(8));
        assert!(fluid.domain(2).is_err());
    }
}
