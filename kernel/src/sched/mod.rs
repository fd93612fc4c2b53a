//! Scheduler subsystem
//!
//! ## Features
//!
//! - Capacity-aware wakeup placement for fair tasks (big.LITTLE)
//! - FIFO/RR real-time class with priority arrays and PI accounting
//! - Fluid RT placement: idle-first, recessive and victim selection
//! - RT bandwidth throttling with runtime borrowing between CPUs
//! - Push/pull RT migration, optionally relayed between overloaded CPUs
//!
//! ## Structure
//!
//! Everything hangs off one [`Scheduler`] value that owns every CPU's
//! run-queue. There are no globals: tests and the simulator build as many
//! independent schedulers as they like, each with its own [`Platform`].

mod bandwidth;
mod class;
mod cpupri;
mod energy;
mod fair;
mod fluid;
mod migrate;
mod ops;
mod placement;
mod prio;
mod rq;
mod rt;
mod task;

pub mod pelt;

pub use self::bandwidth::{RtBandwidth, RtRuntime, DEFAULT_RT_PERIOD_US, DEFAULT_RT_RUNTIME_US, RUNTIME_INF};
pub use self::class::{DequeueFlags, EnqueueFlags, SdFlag, WakeFlags};
pub use self::ops::TaskInfo;
pub use self::cpupri::{CpuPri, CPUPRI_IDLE, CPUPRI_INVALID, CPUPRI_NORMAL};
pub use self::energy::{CapState, EnergyTable};
pub use self::fair::{nice_to_weight, SCHED_LATENCY_NS};
pub use self::fluid::{ratio_scale, weight_from_rtprio, FrtDomainInfo, FrtRatios, DEFAULT_COVERAGE_RATIO};
pub use self::migrate::{RtoCursor, RT_MAX_TRIES};
pub use self::placement::{DEFAULT_ONTIME_DOWN, DEFAULT_ONTIME_UP};
pub use self::prio::PrioBitmap;
pub use self::rq::RqStat;
pub use self::rt::RR_TIMESLICE_MS;
pub use self::task::{
    ClassKind, OnRq, Policy, RtLimit, TaskId, TaskSpec, WakeState, DEFAULT_PRIO, MAX_PRIO,
    MAX_RT_PRIO, MAX_USER_RT_PRIO,
};

use self::fluid::FluidRt;
use self::migrate::RootDomain;
use self::placement::Ontime;
use self::rq::{Rq, RqGuard};
use crate::cpumask::CpuMask;
use crate::error::{Result, SchedError};
use crate::sync::{BandwidthLock, DirectoryLock, RqLock, RuntimeLock};
use crate::topology::Topology;
use crate::traits::{EnergyModel, Platform};
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use bitflags::bitflags;
use hashbrown::HashMap;

/// Default tick: 4ms (HZ=250).
pub const DEFAULT_TICK_NS: u64 = 4_000_000;

bitflags! {
    /// Runtime switches.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct SchedFeatures: u32 {
        /// Relay pull requests to overloaded CPUs instead of locking them
        const RT_PUSH_IPI = 0x01;
        /// Let CPUs borrow unused RT runtime from their peers
        const RT_RUNTIME_SHARE = 0x02;
        /// Capacity-aware RT placement
        const FLUID_RT = 0x04;
    }
}

impl Default for SchedFeatures {
    fn default() -> Self {
        Self::all()
    }
}

/// Boot-time tunables.
#[derive(Clone, Debug)]
pub struct Tunables {
    pub rt_period_us: i64,
    /// -1 disables throttling
    pub rt_runtime_us: i64,
    /// Zero or negative selects [`RR_TIMESLICE_MS`]
    pub rr_timeslice_ms: i64,
    pub tick_ns: u64,
    pub features: SchedFeatures,
    pub ontime_up: u64,
    pub ontime_down: u64,
    /// Per coregroup, in topology order; missing entries take defaults
    pub frt_ratios: Vec<FrtRatios>,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            rt_period_us: DEFAULT_RT_PERIOD_US,
            rt_runtime_us: DEFAULT_RT_RUNTIME_US,
            rr_timeslice_ms: RR_TIMESLICE_MS as i64,
            tick_ns: DEFAULT_TICK_NS,
            features: SchedFeatures::default(),
            ontime_up: DEFAULT_ONTIME_UP,
            ontime_down: DEFAULT_ONTIME_DOWN,
            frt_ratios: Vec::new(),
        }
    }
}

/// Per-CPU scheduler state.
pub(crate) struct Cpu {
    pub rq: RqLock<Rq>,
    pub stat: RqStat,
    pub runtime: RuntimeLock<RtRuntime>,
}

/// The scheduler: every CPU's run-queue plus the state shared between them.
pub struct Scheduler<P: Platform> {
    pub(crate) platform: P,
    pub(crate) topology: Topology,
    pub(crate) energy: Option<Box<dyn EnergyModel>>,
    pub(crate) cpus: Vec<Cpu>,
    pub(crate) cpupri: CpuPri,
    pub(crate) root: RootDomain,
    pub(crate) bandwidth: BandwidthLock<RtBandwidth>,
    pub(crate) fluid: FluidRt,
    pub(crate) ontime: Ontime,
    /// Home CPU of every live task
    pub(crate) directory: DirectoryLock<HashMap<TaskId, usize>>,
    pub(crate) tick_ns: u64,
    pub(crate) throttle_warned: AtomicBool,
    features: AtomicU32,
    /// RR slice in ticks
    rr_timeslice: AtomicU32,
    next_id: AtomicU64,
}

impl<P: Platform> Scheduler<P> {
    /// Build a scheduler with every CPU of `topology` online.
    pub fn new(platform: P, topology: Topology, tunables: Tunables) -> Result<Self> {
        if tunables.tick_ns == 0 {
            return Err(SchedError::InvalidTick);
        }
        let bandwidth = RtBandwidth::new(tunables.rt_period_us, tunables.rt_runtime_us)?;
        let ontime = Ontime::new(tunables.ontime_up, tunables.ontime_down)?;
        let fluid = FluidRt::new(&topology, &tunables.frt_ratios)?;

        let cpus = (0..topology.nr_cpus())
            .map(|cpu| Cpu {
                rq: RqLock::new(Rq::new(cpu), "rq"),
                stat: RqStat::new(),
                runtime: RuntimeLock::new(RtRuntime::new(bandwidth.runtime), "rt_runtime"),
            })
            .collect();

        let sched = Self {
            fluid,
            platform,
            topology,
            energy: None,
            cpus,
            cpupri: CpuPri::new(),
            root: RootDomain::new(),
            bandwidth: BandwidthLock::new(bandwidth, "rt_bandwidth"),
            ontime,
            directory: DirectoryLock::new(HashMap::new(), "task_directory"),
            tick_ns: tunables.tick_ns,
            throttle_warned: AtomicBool::new(false),
            features: AtomicU32::new(tunables.features.bits()),
            rr_timeslice: AtomicU32::new(0),
            next_id: AtomicU64::new(1),
        };
        sched.set_rr_timeslice_ms(tunables.rr_timeslice_ms);

        for cpu in 0..sched.topology.nr_cpus() {
            sched.set_cpu_online(cpu, true)?;
        }

        log::info!(
            "scheduler up: {} cpus in {} coregroups, features {:?}",
            sched.topology.nr_cpus(),
            sched.topology.coregroups().len(),
            tunables.features
        );
        Ok(sched)
    }

    /// Install an energy model for wakeup placement.
    pub fn with_energy(mut self, model: impl EnergyModel + 'static) -> Self {
        self.energy = Some(Box::new(model));
        self
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn nr_cpus(&self) -> usize {
        self.cpus.len()
    }

    /// Lock-free snapshot of a CPU's run-queue.
    pub fn stat(&self, cpu: usize) -> Result<&RqStat> {
        self.check_cpu(cpu)?;
        Ok(&self.cpus[cpu].stat)
    }

    pub fn online_cpus(&self) -> CpuMask {
        self.root.span()
    }

    pub fn cpupri(&self) -> &CpuPri {
        &self.cpupri
    }

    pub fn features(&self) -> SchedFeatures {
        SchedFeatures::from_bits_truncate(self.features.load(Ordering::Relaxed))
    }

    pub fn set_features(&self, features: SchedFeatures) {
        self.features.store(features.bits(), Ordering::Relaxed);
        log::info!("scheduler features {:?}", features);
    }

    /// RR slice in ticks.
    pub fn rr_timeslice(&self) -> u32 {
        self.rr_timeslice.load(Ordering::Relaxed)
    }

    /// Set the RR slice; zero or negative restores the default.
    pub fn set_rr_timeslice_ms(&self, ms: i64) {
        let ms = if ms <= 0 { RR_TIMESLICE_MS } else { ms as u64 };
        let ticks = (ms * 1_000_000).div_ceil(self.tick_ns).clamp(1, u32::MAX as u64);
        self.rr_timeslice.store(ticks as u32, Ordering::Relaxed);
    }

    /// Ontime `(up, down)` thresholds.
    pub fn ontime_thresholds(&self) -> (u64, u64) {
        self.ontime.thresholds()
    }

    pub fn set_ontime_thresholds(&self, up: u64, down: u64) -> Result<()> {
        self.ontime.set_thresholds(up, down)
    }

    pub(crate) fn check_cpu(&self, cpu: usize) -> Result<()> {
        if cpu >= self.cpus.len() {
            return Err(SchedError::InvalidCpu(cpu));
        }
        Ok(())
    }

    fn alloc_task_id(&self) -> TaskId {
        TaskId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Apply what remote CPUs left in `rq`'s mailboxes.
    fn absorb_mailboxes(&self, rq: &mut Rq) {
        if let Some(victim) = self.cpus[rq.cpu].stat.take_victim() {
            if rq.is_curr(victim) {
                rq.task_mut(victim).victim = true;
            }
        }
    }

    pub(crate) fn lock_rq(&self, cpu: usize) -> RqGuard<'_> {
        let mut rq = self.cpus[cpu].rq.lock();
        self.absorb_mailboxes(&mut rq);
        rq
    }

    pub(crate) fn try_lock_rq(&self, cpu: usize) -> Option<RqGuard<'_>> {
        let mut rq = self.cpus[cpu].rq.try_lock()?;
        self.absorb_mailboxes(&mut rq);
        Some(rq)
    }

    /// Lock two distinct run-queues in ascending order, returned as
    /// `(a, b)`.
    pub(crate) fn double_rq_lock(&self, a: usize, b: usize) -> (RqGuard<'_>, RqGuard<'_>) {
        sched_bug_on!(a == b, "cpu{}: double lock on itself", a);
        if a < b {
            let ra = self.lock_rq(a);
            let rb = self.lock_rq(b);
            (ra, rb)
        } else {
            let rb = self.lock_rq(b);
            let ra = self.lock_rq(a);
            (ra, rb)
        }
    }

    pub(crate) fn update_rq_clock(&self, rq: &mut Rq) {
        let now = self.platform.now();
        if now > rq.clock_task {
            rq.clock_task = now;
        }
    }

    /// Republish `rq` for lock-free readers.
    #[inline]
    pub(crate) fn publish(&self, rq: &Rq) {
        self.cpus[rq.cpu].stat.publish(rq);
    }

    #[inline]
    pub(crate) fn resched_curr(&self, rq: &Rq) {
        self.cpus[rq.cpu].stat.set_need_resched();
    }

    /// Nothing queued and the platform reports the CPU idle.
    pub(crate) fn is_cpu_idle(&self, cpu: usize) -> bool {
        self.cpus[cpu].stat.is_idle() && self.platform.idle_cpu(cpu)
    }

    /// Home CPU of `id`.
    pub(crate) fn task_cpu(&self, id: TaskId) -> Result<usize> {
        self.directory
            .read()
            .get(&id)
            .copied()
            .ok_or(SchedError::NoSuchTask(id))
    }

    /// Lock the run-queue `id` is homed on, following it if it migrates
    /// in between.
    pub(crate) fn task_rq_lock(&self, id: TaskId) -> Result<RqGuard<'_>> {
        loop {
            let cpu = self.task_cpu(id)?;
            let rq = self.lock_rq(cpu);
            if rq.tasks.contains_key(&id) {
                return Ok(rq);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::PlatformModel;

    fn sched(tunables: Tunables) -> Scheduler<PlatformModel> {
        let topo = Topology::big_little(4, 512, 4, 1024).unwrap();
        Scheduler::new(PlatformModel::new(&topo), topo, tunables).unwrap()
    }

    #[test]
    fn test_new_brings_cpus_online() {
        let s = sched(Tunables::default());
        assert_eq!(s.online_cpus(), CpuMask::first_n(8));
        assert_eq!(s.features(), SchedFeatures::all());
        assert_eq!(s.cpupri().get(0), CPUPRI_NORMAL);
    }

    #[test]
    fn test_rr_timeslice_conversion() {
        let s = sched(Tunables::default());
        // 100ms at a 4ms tick.
        assert_eq!(s.rr_timeslice(), 25);
        s.set_rr_timeslice_ms(10);
        assert_eq!(s.rr_timeslice(), 3);
        s.set_rr_timeslice_ms(0);
        assert_eq!(s.rr_timeslice(), 25);
        s.set_rr_timeslice_ms(-5);
        assert_eq!(s.rr_timeslice(), 25);
    }

    #[test]
    fn test_invalid_tunables() {
        let topo = Topology::uniform(2, 1024).unwrap();
        let bad_tick = Tunables {
            tick_ns: 0,
            ..Tunables::default()
        };
        assert_eq!(
            Scheduler::new(PlatformModel::new(&topo), topo.clone(), bad_tick).err(),
            Some(SchedError::InvalidTick)
        );

        let bad_bw = Tunables {
            rt_runtime_us: 2_000_000,
            ..Tunables::default()
        };
        assert!(matches!(
            Scheduler::new(PlatformModel::new(&topo), topo, bad_bw).err(),
            Some(SchedError::RuntimeExceedsPeriod { .. })
        ));
    }

    #[test]
    fn test_check_cpu() {
        let s = sched(Tunables::default());
        assert!(s.check_cpu(7).is_ok());
        assert_eq!(s.check_cpu(8), Err(SchedError::InvalidCpu(8)));
        assert!(s.stat(9).is_err());
    }
}
