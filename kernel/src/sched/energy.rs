//! Energy-aware scheduling
//!
//! A table-driven [`EnergyModel`]: each coregroup lists its capacity
//! states (the capacity a CPU delivers at one frequency and the power it
//! draws there). A CPU running at `util` sits in the lowest state whose
//! capacity covers it and spends `power * util / capacity` while busy plus
//! its idle power for the rest of the period.

use crate::cpumask::CpuMask;
use crate::traits::EnergyModel;
use alloc::vec::Vec;

/// One frequency step of a coregroup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CapState {
    pub capacity: u64,
    /// Busy power at this step, in arbitrary units
    pub power: u64,
}

#[derive(Clone, Debug)]
struct GroupTable {
    cpus: CpuMask,
    /// Sorted by ascending capacity
    states: Vec<CapState>,
    idle_power: u64,
}

/// Energy costs per coregroup.
#[derive(Clone, Debug, Default)]
pub struct EnergyTable {
    groups: Vec<GroupTable>,
}

impl EnergyTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the states of the CPUs in `cpus`. Empty state lists are ignored.
    pub fn with_coregroup(mut self, cpus: CpuMask, mut states: Vec<CapState>, idle_power: u64) -> Self {
        if states.is_empty() {
            return self;
        }
        states.sort_by_key(|s| s.capacity);
        self.groups.push(GroupTable {
            cpus,
            states,
            idle_power,
        });
        self
    }

    fn group_of(&self, cpu: usize) -> Option<&GroupTable> {
        self.groups.iter().find(|g| g.cpus.test(cpu))
    }
}

impl EnergyModel for EnergyTable {
    fn compute_energy(&self, cpu: usize, util: u64) -> Option<u64> {
        let group = self.group_of(cpu)?;
        let state = group
            .states
            .iter()
            .find(|s| s.capacity >= util)
            .or_else(|| group.states.last())?;
        let capacity = state.capacity.max(1);
        let busy = util.min(capacity);
        let idle = capacity - busy;
        Some((state.power * busy + group.idle_power * idle) / capacity)
    }
}
