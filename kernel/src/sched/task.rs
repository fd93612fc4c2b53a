//! Task management

use super::pelt::SchedAvg;
use super::prio::Links;
use crate::cpumask::CpuMask;
use core::fmt;

/// Number of real-time priority levels (0 is the highest).
pub const MAX_RT_PRIO: u32 = 100;
/// One past the lowest normal priority.
pub const MAX_PRIO: u32 = MAX_RT_PRIO + 40;
/// Priority of a nice-0 normal task.
pub const DEFAULT_PRIO: u32 = MAX_RT_PRIO + 20;
/// Highest user-visible RT priority.
pub const MAX_USER_RT_PRIO: i32 = 99;

/// Task identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Scheduling policy
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Policy {
    /// Time-shared fair scheduling
    Normal,
    /// CPU-bound batch work
    Batch,
    /// Lowest-weight background work
    Idle,
    /// Fixed priority, run until blocked or preempted
    Fifo,
    /// Fixed priority with a time slice
    RoundRobin,
}

impl Policy {
    pub fn is_rt(self) -> bool {
        matches!(self, Policy::Fifo | Policy::RoundRobin)
    }
}

/// Whether a task sits on a run-queue
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OnRq {
    No,
    Queued,
    /// Between the dequeue and enqueue of a migration
    Migrating,
}

/// Wake-up state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WakeState {
    /// Blocked (or freshly spawned, never woken)
    Sleeping,
    /// Claimed by a waker that is choosing a CPU
    Waking,
    /// Queued or running
    Runnable,
}

/// Scheduling class a task belongs to, by priority
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ClassKind {
    Rt,
    Fair,
}

/// `prio` belongs to the RT range.
#[inline]
pub fn rt_prio(prio: u32) -> bool {
    prio < MAX_RT_PRIO
}

/// RT run-queue entity
#[derive(Clone, Debug, Default)]
pub struct RtEntity {
    /// Links in the run-queue priority array
    pub run: Links,
    /// Links in the pushable set
    pub push: Links,
    /// Counted in the run-queue's RT counters
    pub on_rq: bool,
    /// Remaining RR ticks
    pub time_slice: u32,
    /// Ticks run since the last wakeup (watchdog)
    pub timeout: u64,
    /// Jiffy at which `timeout` was last advanced
    pub watchdog_stamp: u64,
    /// Decayed RT utilization
    pub avg: SchedAvg,
    /// Whether `avg` is currently folded into the home run-queue's average
    pub attached: bool,
    /// Set on synchronous wakeups; consumed by `task_woken`
    pub sync_flag: bool,
}

/// RT-time resource limit, in microseconds
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RtLimit {
    pub soft_us: Option<u64>,
    pub hard_us: Option<u64>,
}

/// Task control block
#[derive(Clone, Debug)]
pub struct Task {
    /// Task ID
    pub id: TaskId,
    /// Short name for diagnostics
    pub name: heapless::String<16>,
    pub policy: Policy,
    /// Effective priority (may be PI-boosted)
    pub prio: u32,
    /// Priority implied by the policy
    pub normal_prio: u32,
    /// Nice-derived priority for normal tasks
    pub static_prio: u32,
    /// User RT priority (1..=99), 0 for normal tasks
    pub rt_priority: u32,
    /// Priority donated through priority inheritance
    pub pi_prio: Option<u32>,
    pub cpus_allowed: CpuMask,
    pub nr_cpus_allowed: u32,
    /// Home CPU
    pub cpu: usize,
    pub on_rq: OnRq,
    pub state: WakeState,
    pub rt: RtEntity,
    /// Fair-class decayed average, handed to the RT entity on class switch
    pub se_avg: SchedAvg,
    /// Fair-class ordering key
    pub vruntime: u64,
    pub exec_start: u64,
    pub sum_exec_runtime: u64,
    /// Marked for displacement by fluid RT placement
    pub victim: bool,
    pub rttime_limit: RtLimit,
    /// Watchdog fired
    pub rttime_expired: bool,
}

impl Task {
    /// Build a task from `spec`. The priority in `spec` must already be
    /// validated for its policy.
    pub fn new(id: TaskId, spec: &TaskSpec, cpu: usize, cpus_allowed: CpuMask) -> Self {
        let (rt_priority, static_prio) = if spec.policy.is_rt() {
            (spec.priority.max(0) as u32, DEFAULT_PRIO)
        } else {
            (0, (DEFAULT_PRIO as i32 + spec.priority) as u32)
        };

        let mut task = Self {
            id,
            name: spec.name.clone(),
            policy: spec.policy,
            prio: DEFAULT_PRIO,
            normal_prio: DEFAULT_PRIO,
            static_prio,
            rt_priority,
            pi_prio: None,
            cpus_allowed,
            nr_cpus_allowed: cpus_allowed.weight() as u32,
            cpu,
            on_rq: OnRq::No,
            state: WakeState::Sleeping,
            rt: RtEntity {
                avg: SchedAvg::with_util(spec.util),
                ..RtEntity::default()
            },
            se_avg: SchedAvg::with_util(spec.util),
            vruntime: 0,
            exec_start: 0,
            sum_exec_runtime: 0,
            victim: false,
            rttime_limit: spec.rttime_limit,
            rttime_expired: false,
        };
        task.refresh_prio();
        task
    }

    pub fn class(&self) -> ClassKind {
        if rt_prio(self.prio) {
            ClassKind::Rt
        } else {
            ClassKind::Fair
        }
    }

    pub fn is_rt(&self) -> bool {
        rt_prio(self.prio)
    }

    /// Can run on more than one CPU.
    pub fn is_migratable(&self) -> bool {
        self.nr_cpus_allowed > 1
    }

    /// Nice value for normal tasks.
    pub fn nice(&self) -> i32 {
        self.static_prio as i32 - DEFAULT_PRIO as i32
    }

    /// Recompute `normal_prio` and `prio` after a policy or PI change.
    pub fn refresh_prio(&mut self) {
        self.normal_prio = normal_prio(self.policy, self.rt_priority, self.static_prio);
        self.prio = match self.pi_prio {
            Some(donor) => donor.min(self.normal_prio),
            None => self.normal_prio,
        };
    }

    /// Running with a priority borrowed through PI.
    pub fn is_boosted(&self) -> bool {
        self.prio < self.normal_prio
    }
}

/// Priority implied by a policy.
pub fn normal_prio(policy: Policy, rt_priority: u32, static_prio: u32) -> u32 {
    if policy.is_rt() {
        MAX_RT_PRIO - 1 - rt_priority.min(MAX_RT_PRIO - 1)
    } else {
        static_prio
    }
}

/// Parameters of a new task.
#[derive(Clone, Debug)]
pub struct TaskSpec {
    pub name: heapless::String<16>,
    pub policy: Policy,
    /// RT priority for RT policies, nice value otherwise
    pub priority: i32,
    pub cpus_allowed: Option<CpuMask>,
    /// Initial home CPU
    pub cpu: Option<usize>,
    /// Seed for the decayed utilization
    pub util: u64,
    pub rttime_limit: RtLimit,
}

impl TaskSpec {
    /// A FIFO task at user RT priority `rt_priority`.
    pub fn fifo(rt_priority: i32) -> Self {
        Self::with_policy(Policy::Fifo, rt_priority)
    }

    /// A round-robin task at user RT priority `rt_priority`.
    pub fn round_robin(rt_priority: i32) -> Self {
        Self::with_policy(Policy::RoundRobin, rt_priority)
    }

    /// A normal task at nice 0.
    pub fn normal() -> Self {
        Self::with_policy(Policy::Normal, 0)
    }

    pub fn with_policy(policy: Policy, priority: i32) -> Self {
        Self {
            name: heapless::String::new(),
            policy,
            priority,
            cpus_allowed: None,
            cpu: None,
            util: 0,
            rttime_limit: RtLimit::default(),
        }
    }

    /// Set the name, truncated to 16 bytes.
    pub fn name(mut self, name: &str) -> Self {
        self.name.clear();
        for ch in name.chars() {
            if self.name.push(ch).is_err() {
                break;
            }
        }
        self
    }

    pub fn nice(mut self, nice: i32) -> Self {
        self.priority = nice;
        self
    }

    pub fn affinity(mut self, mask: CpuMask) -> Self {
        self.cpus_allowed = Some(mask);
        self
    }

    pub fn on_cpu(mut self, cpu: usize) -> Self {
        self.cpu = Some(cpu);
        self
    }

    pub fn util(mut self, util: u64) -> Self {
        self.util = util;
        self
    }

    pub fn rttime_limit(mut self, soft_us: Option<u64>, hard_us: Option<u64>) -> Self {
        self.rttime_limit = RtLimit { soft_us, hard_us };
        self
    }
}

/// Read-only copy of the fields CPU selection needs, taken under the home
/// run-queue lock and used after it is released.
#[derive(Clone, Copy, Debug)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub prio: u32,
    pub cpu: usize,
    pub cpus_allowed: CpuMask,
    pub nr_cpus_allowed: u32,
    /// Decayed RT utilization
    pub rt_util: u64,
    /// RT average currently folded into the home run-queue
    pub rt_attached: bool,
    /// Has run before (its utilization is part of its CPU's signal)
    pub has_history: bool,
}

impl TaskSnapshot {
    pub fn of(task: &Task) -> Self {
        Self {
            id: task.id,
            prio: task.prio,
            cpu: task.cpu,
            cpus_allowed: task.cpus_allowed,
            nr_cpus_allowed: task.nr_cpus_allowed,
            rt_util: task.rt.avg.util_avg,
            rt_attached: task.rt.attached,
            has_history: task.sum_exec_runtime > 0 || task.rt.attached,
        }
    }

    pub fn is_rt(&self) -> bool {
        rt_prio(self.prio)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prio_mapping() {
        assert_eq!(normal_prio(Policy::Fifo, 99, DEFAULT_PRIO), 0);
        assert_eq!(normal_prio(Policy::Fifo, 1, DEFAULT_PRIO), 98);
        assert_eq!(normal_prio(Policy::Normal, 0, 110), 110);
        assert!(rt_prio(98));
        assert!(!rt_prio(MAX_RT_PRIO));
    }

    #[test]
    fn test_spec_builder() {
        let spec = TaskSpec::round_robin(10)
            .name("a-very-long-task-name")
            .affinity(CpuMask::first_n(2))
            .util(300);
        assert_eq!(spec.policy, Policy::RoundRobin);
        assert_eq!(spec.name.len(), 16);
        assert_eq!(spec.cpus_allowed, Some(CpuMask::first_n(2)));
        assert_eq!(spec.util, 300);
        assert_eq!(TaskSpec::normal().nice(-5).priority, -5);
    }

    #[test]
    fn test_policy_is_rt() {
        assert!(Policy::Fifo.is_rt());
        assert!(Policy::RoundRobin.is_rt());
        assert!(!Policy::Batch.is_rt());
    }
}
