//! Software platform model
//!
//! A [`Platform`] whose every input is set explicitly: clock, capacities,
//! fair-class utilization, idle states and task attributes. It backs the
//! test suites and the `kairos` simulator, and keeps the most recent
//! decisions in a bounded history.

use crate::cpumask::NR_CPUS;
use crate::sched::TaskId;
use crate::topology::Topology;
use crate::trace::TraceEvent;
use crate::traits::Platform;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use hashbrown::HashMap;
use heapless::HistoryBuffer;
use spin::{Mutex, RwLock};

/// Number of trace events retained.
pub const EVENT_HISTORY: usize = 512;

/// Default utilization margin, in percent of original capacity.
pub const DEFAULT_MARGIN_PCT: u64 = 80;

/// Per-task policy attributes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TaskAttrs {
    /// Estimated fair-class utilization
    pub util_est: u64,
    /// Boost percentage
    pub boost: i32,
    pub prefer_idle: bool,
    pub prefer_perf: bool,
    pub prefer_high_cap: bool,
    pub on_top: bool,
    pub top_app: bool,
}

struct CpuState {
    capacity_orig: u64,
    capacity: AtomicU64,
    capacity_curr: AtomicU64,
    util: AtomicU64,
    /// Idle state index, negative while busy
    idle_idx: AtomicI32,
    overutilized: AtomicBool,
}

/// Software-controlled platform.
pub struct PlatformModel {
    clock: AtomicU64,
    cpus: Vec<CpuState>,
    margin_pct: AtomicU64,
    boosted: AtomicBool,
    tasks: RwLock<HashMap<TaskId, TaskAttrs>>,
    events: Mutex<HistoryBuffer<TraceEvent, EVENT_HISTORY>>,
}

impl PlatformModel {
    /// A platform for `topology`: every CPU idle in state 0, running at its
    /// original capacity with no fair load.
    pub fn new(topology: &Topology) -> Self {
        let cpus = (0..topology.nr_cpus().min(NR_CPUS))
            .map(|cpu| {
                let cap = topology.capacity_orig_of(cpu);
                CpuState {
                    capacity_orig: cap,
                    capacity: AtomicU64::new(cap),
                    capacity_curr: AtomicU64::new(cap),
                    util: AtomicU64::new(0),
                    idle_idx: AtomicI32::new(0),
                    overutilized: AtomicBool::new(false),
                }
            })
            .collect();

        Self {
            clock: AtomicU64::new(0),
            cpus,
            margin_pct: AtomicU64::new(DEFAULT_MARGIN_PCT),
            boosted: AtomicBool::new(false),
            tasks: RwLock::new(HashMap::new()),
            events: Mutex::new(HistoryBuffer::new()),
        }
    }

    pub fn set_clock(&self, ns: u64) {
        self.clock.store(ns, Ordering::Release);
    }

    /// Advance the clock by `ns`, returning the new time.
    pub fn advance(&self, ns: u64) -> u64 {
        self.clock.fetch_add(ns, Ordering::AcqRel) + ns
    }

    /// Set fair-class utilization of `cpu`.
    pub fn set_cpu_util(&self, cpu: usize, util: u64) {
        if let Some(c) = self.cpus.get(cpu) {
            c.util.store(util, Ordering::Relaxed);
        }
    }

    /// Mark `cpu` idle in state `idx`.
    pub fn set_idle(&self, cpu: usize, idx: i32) {
        if let Some(c) = self.cpus.get(cpu) {
            c.idle_idx.store(idx.max(0), Ordering::Relaxed);
        }
    }

    /// Mark `cpu` busy.
    pub fn set_busy(&self, cpu: usize) {
        if let Some(c) = self.cpus.get(cpu) {
            c.idle_idx.store(-1, Ordering::Relaxed);
        }
    }

    /// Force the overutilized flag of `cpu`.
    pub fn set_overutilized(&self, cpu: usize, over: bool) {
        if let Some(c) = self.cpus.get(cpu) {
            c.overutilized.store(over, Ordering::Relaxed);
        }
    }

    /// Capacity available to tasks on `cpu`.
    pub fn set_capacity(&self, cpu: usize, capacity: u64) {
        if let Some(c) = self.cpus.get(cpu) {
            c.capacity.store(capacity, Ordering::Relaxed);
        }
    }

    /// Capacity of `cpu` at its current frequency.
    pub fn set_capacity_curr(&self, cpu: usize, capacity: u64) {
        if let Some(c) = self.cpus.get(cpu) {
            c.capacity_curr.store(capacity, Ordering::Relaxed);
        }
    }

    pub fn set_margin_pct(&self, pct: u64) {
        self.margin_pct.store(pct, Ordering::Relaxed);
    }

    pub fn set_global_boost(&self, boosted: bool) {
        self.boosted.store(boosted, Ordering::Relaxed);
    }

    pub fn set_task_attrs(&self, task: TaskId, attrs: TaskAttrs) {
        self.tasks.write().insert(task, attrs);
    }

    pub fn update_task_attrs(&self, task: TaskId, f: impl FnOnce(&mut TaskAttrs)) {
        f(self.tasks.write().entry(task).or_default());
    }

    fn attrs(&self, task: TaskId) -> TaskAttrs {
        self.tasks.read().get(&task).copied().unwrap_or_default()
    }

    /// Recorded events, oldest first.
    pub fn events(&self) -> Vec<TraceEvent> {
        self.events.lock().oldest_ordered().copied().collect()
    }

    /// Most recent event concerning `task`.
    pub fn last_event_for(&self, task: TaskId) -> Option<TraceEvent> {
        self.events
            .lock()
            .oldest_ordered()
            .filter(|e| e.task() == Some(task))
            .last()
            .copied()
    }

    pub fn clear_events(&self) {
        *self.events.lock() = HistoryBuffer::new();
    }

    fn over_margin(&self, cpu: usize, util: u64) -> bool {
        let cap = self.cpus.get(cpu).map_or(0, |c| c.capacity_orig);
        util * 100 > cap * self.margin_pct.load(Ordering::Relaxed)
    }
}

impl Platform for PlatformModel {
    fn now(&self) -> u64 {
        self.clock.load(Ordering::Acquire)
    }

    fn capacity_of(&self, cpu: usize) -> u64 {
        self.cpus.get(cpu).map_or(0, |c| c.capacity.load(Ordering::Relaxed))
    }

    fn capacity_curr_of(&self, cpu: usize) -> u64 {
        self.cpus
            .get(cpu)
            .map_or(0, |c| c.capacity_curr.load(Ordering::Relaxed))
    }

    fn cpu_util(&self, cpu: usize) -> u64 {
        self.cpus.get(cpu).map_or(0, |c| c.util.load(Ordering::Relaxed))
    }

    fn idle_cpu(&self, cpu: usize) -> bool {
        self.idle_state_idx(cpu) >= 0
    }

    fn idle_state_idx(&self, cpu: usize) -> i32 {
        self.cpus
            .get(cpu)
            .map_or(-1, |c| c.idle_idx.load(Ordering::Relaxed))
    }

    fn is_overutilized(&self, cpu: usize) -> bool {
        let forced = self
            .cpus
            .get(cpu)
            .is_some_and(|c| c.overutilized.load(Ordering::Relaxed));
        forced || self.over_margin(cpu, self.cpu_util(cpu))
    }

    fn would_overutilize(&self, cpu: usize, util: u64) -> bool {
        self.over_margin(cpu, util)
    }

    fn global_boosted(&self) -> bool {
        self.boosted.load(Ordering::Relaxed)
    }

    fn task_util_est(&self, task: TaskId) -> u64 {
        self.attrs(task).util_est
    }

    fn task_boost(&self, task: TaskId) -> i32 {
        self.attrs(task).boost
    }

    fn prefer_idle(&self, task: TaskId) -> bool {
        self.attrs(task).prefer_idle
    }

    fn prefer_perf(&self, task: TaskId) -> bool {
        self.attrs(task).prefer_perf
    }

    fn prefer_high_cap(&self, task: TaskId) -> bool {
        self.attrs(task).prefer_high_cap
    }

    fn task_on_top(&self, task: TaskId) -> bool {
        self.attrs(task).on_top
    }

    fn task_top_app(&self, task: TaskId) -> bool {
        self.attrs(task).top_app
    }

    fn freq_scale(&self, cpu: usize) -> u64 {
        match self.cpus.get(cpu) {
            Some(c) if c.capacity_orig > 0 => {
                c.capacity_curr.load(Ordering::Relaxed) * 1024 / c.capacity_orig
            }
            _ => 1024,
        }
    }

    fn record(&self, event: TraceEvent) {
        self.events.lock().write(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> PlatformModel {
        PlatformModel::new(&Topology::big_little(2, 512, 2, 1024).unwrap())
    }

    #[test]
    fn test_defaults_follow_topology() {
        let p = model();
        assert_eq!(p.capacity_of(0), 512);
        assert_eq!(p.capacity_curr_of(3), 1024);
        assert!(p.idle_cpu(1));
        assert_eq!(p.freq_scale(2), 1024);
        assert_eq!(p.capacity_of(9), 0);
    }

    #[test]
    fn test_overutilization_margin() {
        let p = model();
        p.set_cpu_util(0, 400);
        assert!(!p.is_overutilized(0));
        assert!(p.would_overutilize(0, 420));
        p.set_cpu_util(0, 420);
        assert!(p.is_overutilized(0));
        p.set_overutilized(1, true);
        assert!(p.is_overutilized(1));
    }

    #[test]
    fn test_event_history_is_bounded() {
        let p = model();
        for i in 0..(EVENT_HISTORY as u64 + 10) {
            p.record(TraceEvent::RtThrottle { cpu: 0, rt_time: i, runtime: 0 });
        }
        let events = p.events();
        assert_eq!(events.len(), EVENT_HISTORY);
        assert_eq!(events[0], TraceEvent::RtThrottle { cpu: 0, rt_time: 10, runtime: 0 });
        p.clear_events();
        assert!(p.events().is_empty());
    }

    #[test]
    fn test_task_attrs() {
        let p = model();
        let t = TaskId(3);
        assert!(!p.prefer_idle(t));
        p.update_task_attrs(t, |a| {
            a.prefer_idle = true;
            a.util_est = 20;
        });
        assert!(p.prefer_idle(t));
        assert_eq!(p.task_util_est(t), 20);
        assert_eq!(p.last_event_for(t), None);
    }
}
