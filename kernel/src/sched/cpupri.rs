//! CPU priority index
//!
//! Tracks the priority of the highest RT task queued on each CPU so a
//! waking or pushed task can find CPUs running something of lower priority
//! without touching their run-queues. Updates come from the owning CPU under
//! its run-queue lock; lookups are lock-free and may observe a CPU between
//! two levels, which callers tolerate by revalidating under the lock.

use super::task::{MAX_PRIO, MAX_RT_PRIO};
use crate::cpumask::{AtomicCpuMask, CpuMask, NR_CPUS};
use core::sync::atomic::{AtomicI32, AtomicU32, Ordering};

/// CPU is not part of the index (offline)
pub const CPUPRI_INVALID: i32 = -1;
/// CPU is idle
pub const CPUPRI_IDLE: i32 = 0;
/// CPU runs fair-class work only
pub const CPUPRI_NORMAL: i32 = 1;
/// Number of index levels: idle, normal, one per RT priority
pub const CPUPRI_NR_PRIORITIES: usize = MAX_RT_PRIO as usize + 2;

/// Map a run-queue priority to an index level. Higher levels are more
/// important.
pub fn convert_prio(prio: u32) -> i32 {
    if prio >= MAX_PRIO {
        CPUPRI_IDLE
    } else if prio >= MAX_RT_PRIO {
        CPUPRI_NORMAL
    } else {
        (MAX_RT_PRIO - prio + 1) as i32
    }
}

struct PriVec {
    count: AtomicU32,
    mask: AtomicCpuMask,
}

impl PriVec {
    const fn new() -> Self {
        Self {
            count: AtomicU32::new(0),
            mask: AtomicCpuMask::new(CpuMask::empty()),
        }
    }
}

/// Per-level CPU sets.
pub struct CpuPri {
    pri_to_cpu: [PriVec; CPUPRI_NR_PRIORITIES],
    cpu_to_pri: [AtomicI32; NR_CPUS],
}

impl CpuPri {
    pub fn new() -> Self {
        Self {
            pri_to_cpu: core::array::from_fn(|_| PriVec::new()),
            cpu_to_pri: core::array::from_fn(|_| AtomicI32::new(CPUPRI_INVALID)),
        }
    }

    /// Move `cpu` to the level of `prio`, or out of the index with `None`.
    ///
    /// Must be called with the run-queue lock of `cpu` held.
    pub fn set(&self, cpu: usize, prio: Option<u32>) {
        let new = prio.map_or(CPUPRI_INVALID, convert_prio);
        let old = self.cpu_to_pri[cpu].load(Ordering::Relaxed);
        if new == old {
            return;
        }

        // Appear in the new level before leaving the old one so a
        // concurrent scan never misses the cpu entirely.
        if new != CPUPRI_INVALID {
            let vec = &self.pri_to_cpu[new as usize];
            vec.mask.set(cpu, Ordering::Relaxed);
            vec.count.fetch_add(1, Ordering::Release);
        }
        if old != CPUPRI_INVALID {
            let vec = &self.pri_to_cpu[old as usize];
            vec.count.fetch_sub(1, Ordering::Release);
            vec.mask.clear(cpu, Ordering::Relaxed);
        }
        self.cpu_to_pri[cpu].store(new, Ordering::Relaxed);
    }

    /// Current level of `cpu`.
    pub fn get(&self, cpu: usize) -> i32 {
        self.cpu_to_pri[cpu].load(Ordering::Relaxed)
    }

    /// Find the lowest level below the task's that holds an allowed CPU.
    ///
    /// Returns the allowed CPUs of that level, or `None` if every allowed
    /// CPU runs something at least as important as `prio`.
    pub fn find(&self, prio: u32, allowed: CpuMask) -> Option<CpuMask> {
        let task_pri = convert_prio(prio);
        for idx in 0..task_pri.max(0) as usize {
            let vec = &self.pri_to_cpu[idx];
            if vec.count.load(Ordering::Acquire) == 0 {
                continue;
            }
            let lowest = allowed.and(vec.mask.load(Ordering::Relaxed));
            if !lowest.is_empty() {
                return Some(lowest);
            }
        }
        None
    }
}

impl Default for CpuPri {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_convert_prio() {
        assert_eq!(convert_prio(MAX_PRIO), CPUPRI_IDLE);
        assert_eq!(convert_prio(120), CPUPRI_NORMAL);
        assert_eq!(convert_prio(MAX_RT_PRIO), CPUPRI_NORMAL);
        assert_eq!(convert_prio(99), 2);
        assert_eq!(convert_prio(0), 101);
    }

    #[test]
    fn test_find_lowest_level() {
        let cp = CpuPri::new();
        cp.set(0, Some(10));
        cp.set(1, Some(MAX_RT_PRIO));
        cp.set(2, Some(MAX_RT_PRIO));
        cp.set(3, Some(50));

        let all = CpuMask::first_n(4);
        assert_eq!(cp.find(20, all), Some(CpuMask::from_cpus(&[1, 2])));
        assert_eq!(cp.find(20, CpuMask::from_cpus(&[0, 3])), Some(CpuMask::single(3)));
        assert_eq!(cp.find(60, CpuMask::from_cpus(&[0, 3])), None);
        assert_eq!(cp.find(5, CpuMask::single(0)), Some(CpuMask::single(0)));
        // An equal priority does not preempt.
        assert_eq!(cp.find(10, CpuMask::single(0)), None);
    }

    #[test]
    fn test_set_moves_between_levels() {
        let cp = CpuPri::new();
        cp.set(0, Some(MAX_RT_PRIO));
        assert_eq!(cp.get(0), CPUPRI_NORMAL);
        cp.set(0, Some(30));
        assert_eq!(cp.find(40, CpuMask::single(0)), None);
        cp.set(0, None);
        assert_eq!(cp.get(0), CPUPRI_INVALID);
        assert_eq!(cp.find(0, CpuMask::single(0)), None);
    }
}
