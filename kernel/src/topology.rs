//! CPU topology
//!
//! Coregroups (clusters of CPUs sharing a capacity tier) and per-CPU
//! original capacities. Built once at boot and immutable afterwards.

use crate::cpumask::{CpuMask, NR_CPUS};
use crate::error::{Result, SchedError};
use heapless::Vec;

/// Maximum number of coregroups.
pub const MAX_COREGROUPS: usize = 8;

/// Core type for heterogeneous systems
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CoreType {
    /// Performance core (big)
    Performance,
    /// Middle tier on three-tier parts
    Mid,
    /// Efficiency core (LITTLE)
    Efficiency,
}

/// Description of a coregroup used to build a [`Topology`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CoregroupSpec {
    /// CPUs in the group
    pub cpus: CpuMask,
    /// Original (maximum) capacity of each CPU in the group
    pub capacity: u64,
}

impl CoregroupSpec {
    pub fn new(cpus: CpuMask, capacity: u64) -> Self {
        Self { cpus, capacity }
    }
}

/// One coregroup.
#[derive(Clone, Copy, Debug)]
pub struct Coregroup {
    pub id: usize,
    pub cpus: CpuMask,
    pub capacity: u64,
    pub core_type: CoreType,
}

/// Static CPU topology.
#[derive(Clone, Debug)]
pub struct Topology {
    nr_cpus: usize,
    groups: Vec<Coregroup, MAX_COREGROUPS>,
    cpu_group: [u8; NR_CPUS],
    slowest: CpuMask,
    fastest: CpuMask,
    min_capacity: u64,
    max_capacity: u64,
}

impl Topology {
    /// Build a topology. Coregroups must be disjoint, ordered by their first
    /// CPU, and together cover CPUs `0..n` without gaps.
    pub fn new(specs: &[CoregroupSpec]) -> Result<Self> {
        if specs.is_empty() {
            return Err(SchedError::InvalidTopology("no coregroups"));
        }
        if specs.len() > MAX_COREGROUPS {
            return Err(SchedError::InvalidTopology("too many coregroups"));
        }

        let mut covered = CpuMask::empty();
        let mut last_first = None;
        for spec in specs {
            if spec.cpus.is_empty() {
                return Err(SchedError::InvalidTopology("empty coregroup"));
            }
            if spec.capacity == 0 {
                return Err(SchedError::InvalidTopology("zero capacity"));
            }
            if spec.cpus.intersects(covered) {
                return Err(SchedError::InvalidTopology("coregroups overlap"));
            }
            let first = spec.cpus.first();
            if last_first >= first {
                return Err(SchedError::InvalidTopology("coregroups out of order"));
            }
            last_first = first;
            covered = covered.or(spec.cpus);
        }

        let nr_cpus = covered.weight();
        if covered != CpuMask::first_n(nr_cpus) {
            return Err(SchedError::InvalidTopology("cpu ids are not contiguous"));
        }

        let min_capacity = specs.iter().map(|s| s.capacity).min().unwrap_or(0);
        let max_capacity = specs.iter().map(|s| s.capacity).max().unwrap_or(0);

        let mut groups = Vec::new();
        let mut cpu_group = [u8::MAX; NR_CPUS];
        let mut slowest = CpuMask::empty();
        let mut fastest = CpuMask::empty();

        for (id, spec) in specs.iter().enumerate() {
            let core_type = if spec.capacity == max_capacity && max_capacity != min_capacity {
                CoreType::Performance
            } else if spec.capacity == min_capacity {
                CoreType::Efficiency
            } else {
                CoreType::Mid
            };
            if spec.capacity == min_capacity {
                slowest = slowest.or(spec.cpus);
            }
            if spec.capacity == max_capacity {
                fastest = fastest.or(spec.cpus);
            }
            for cpu in spec.cpus {
                cpu_group[cpu] = id as u8;
            }
            let _ = groups.push(Coregroup {
                id,
                cpus: spec.cpus,
                capacity: spec.capacity,
                core_type,
            });
        }

        Ok(Self {
            nr_cpus,
            groups,
            cpu_group,
            slowest,
            fastest,
            min_capacity,
            max_capacity,
        })
    }

    /// A homogeneous topology of `nr_cpus` CPUs of the given capacity.
    pub fn uniform(nr_cpus: usize, capacity: u64) -> Result<Self> {
        Self::new(&[CoregroupSpec::new(CpuMask::first_n(nr_cpus), capacity)])
    }

    /// A two-cluster big.LITTLE topology: `little` slow CPUs followed by
    /// `big` fast ones.
    pub fn big_little(little: usize, little_cap: u64, big: usize, big_cap: u64) -> Result<Self> {
        let little_mask = CpuMask::first_n(little);
        let big_mask = CpuMask::first_n(little + big).andnot(little_mask);
        Self::new(&[
            CoregroupSpec::new(little_mask, little_cap),
            CoregroupSpec::new(big_mask, big_cap),
        ])
    }

    pub fn nr_cpus(&self) -> usize {
        self.nr_cpus
    }

    /// Every CPU of the system.
    pub fn possible_mask(&self) -> CpuMask {
        CpuMask::first_n(self.nr_cpus)
    }

    pub fn coregroups(&self) -> &[Coregroup] {
        &self.groups
    }

    /// Coregroup index of `cpu`.
    pub fn coregroup_of(&self, cpu: usize) -> usize {
        self.cpu_group.get(cpu).copied().unwrap_or(0) as usize
    }

    /// CPUs sharing `cpu`'s coregroup.
    pub fn coregroup_mask(&self, cpu: usize) -> CpuMask {
        self.groups
            .get(self.coregroup_of(cpu))
            .map(|g| g.cpus)
            .unwrap_or_default()
    }

    /// Original (maximum) capacity of `cpu`.
    pub fn capacity_orig_of(&self, cpu: usize) -> u64 {
        self.groups
            .get(self.coregroup_of(cpu))
            .map(|g| g.capacity)
            .unwrap_or(0)
    }

    pub fn core_type(&self, cpu: usize) -> CoreType {
        self.groups
            .get(self.coregroup_of(cpu))
            .map(|g| g.core_type)
            .unwrap_or(CoreType::Efficiency)
    }

    pub fn is_slowest_cpu(&self, cpu: usize) -> bool {
        self.slowest.test(cpu)
    }

    /// CPUs of the lowest capacity tier.
    pub fn slowest_mask(&self) -> CpuMask {
        self.slowest
    }

    /// CPUs of the highest capacity tier.
    pub fn fastest_mask(&self) -> CpuMask {
        self.fastest
    }

    /// Highest original capacity in the system.
    pub fn max_capacity(&self) -> u64 {
        self.max_capacity
    }

    pub fn min_capacity(&self) -> u64 {
        self.min_capacity
    }

    pub fn contains(&self, cpu: usize) -> bool {
        cpu < self.nr_cpus
    }
}
