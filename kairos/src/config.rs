//! Kairos configuration
//!
//! The modelled machine (coregroups and their capacities), the scheduler
//! tunables and the platform knobs. Everything has a default, so an empty
//! file describes a 4+4 big.LITTLE part with stock tunables.

use nyx_sched::sched::{
    CapState, EnergyTable, FrtRatios, SchedFeatures, DEFAULT_COVERAGE_RATIO, DEFAULT_ONTIME_DOWN,
    DEFAULT_ONTIME_UP, DEFAULT_RT_PERIOD_US, DEFAULT_RT_RUNTIME_US, DEFAULT_TICK_NS, RR_TIMESLICE_MS,
};
use nyx_sched::platform::DEFAULT_MARGIN_PCT;
use nyx_sched::{CoregroupSpec, CpuMask, Topology, Tunables};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KairosConfig {
    /// Modelled CPU topology
    #[serde(default)]
    pub topology: TopologyConfig,

    /// Scheduler tunables
    #[serde(default)]
    pub sched: SchedConfig,

    /// Platform model knobs
    #[serde(default)]
    pub platform: PlatformConfig,
}

/// CPU topology
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyConfig {
    /// Coregroups, ordered by their first CPU
    #[serde(default = "default_coregroups")]
    pub coregroups: Vec<CoregroupConfig>,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            coregroups: default_coregroups(),
        }
    }
}

/// One coregroup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoregroupConfig {
    /// CPU ids in the group
    pub cpus: Vec<usize>,

    /// Original capacity of each CPU (1024 = fastest possible)
    pub capacity: u64,

    /// Fluid-RT coverage ratio in percent
    #[serde(default = "default_coverage_ratio")]
    pub coverage_ratio: u32,

    /// Fluid-RT active ratio in percent (0 disables activated-CPU tracking)
    #[serde(default)]
    pub active_ratio: u32,

    /// Capacity states for energy-aware placement
    #[serde(default)]
    pub energy: Option<EnergyConfig>,
}

/// Energy costs of one coregroup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnergyConfig {
    /// `(capacity, busy power)` pairs, one per frequency step
    pub states: Vec<(u64, u64)>,

    /// Power drawn while idle
    #[serde(default)]
    pub idle_power: u64,
}

/// Scheduler tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedConfig {
    /// RT bandwidth period in microseconds
    #[serde(default = "default_rt_period_us")]
    pub rt_period_us: i64,

    /// RT runtime per period in microseconds (-1 = unlimited)
    #[serde(default = "default_rt_runtime_us")]
    pub rt_runtime_us: i64,

    /// Round-robin timeslice in milliseconds
    #[serde(default = "default_rr_timeslice_ms")]
    pub rr_timeslice_ms: i64,

    /// Tick length in nanoseconds
    #[serde(default = "default_tick_ns")]
    pub tick_ns: u64,

    /// Ontime migration thresholds (utilization)
    #[serde(default = "default_ontime_up")]
    pub ontime_up: u64,

    #[serde(default = "default_ontime_down")]
    pub ontime_down: u64,

    /// Relay pulls through the overloaded CPUs
    #[serde(default = "default_true")]
    pub rt_push_ipi: bool,

    /// Borrow unused RT runtime from peer CPUs
    #[serde(default = "default_true")]
    pub rt_runtime_share: bool,

    /// Capacity-aware RT placement
    #[serde(default = "default_true")]
    pub fluid_rt: bool,
}

impl Default for SchedConfig {
    fn default() -> Self {
        Self {
            rt_period_us: default_rt_period_us(),
            rt_runtime_us: default_rt_runtime_us(),
            rr_timeslice_ms: default_rr_timeslice_ms(),
            tick_ns: default_tick_ns(),
            ontime_up: default_ontime_up(),
            ontime_down: default_ontime_down(),
            rt_push_ipi: true,
            rt_runtime_share: true,
            fluid_rt: true,
        }
    }
}

/// Platform model knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    /// Share of a CPU's capacity usable before it counts as overutilized
    #[serde(default = "default_margin_pct")]
    pub margin_pct: u64,

    /// Start with global boost on
    #[serde(default)]
    pub global_boost: bool,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            margin_pct: default_margin_pct(),
            global_boost: false,
        }
    }
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_coregroups() -> Vec<CoregroupConfig> {
    vec![
        CoregroupConfig {
            cpus: (0..4).collect(),
            capacity: 512,
            coverage_ratio: default_coverage_ratio(),
            active_ratio: 0,
            energy: None,
        },
        CoregroupConfig {
            cpus: (4..8).collect(),
            capacity: 1024,
            coverage_ratio: default_coverage_ratio(),
            active_ratio: 0,
            energy: None,
        },
    ]
}

fn default_coverage_ratio() -> u32 {
    DEFAULT_COVERAGE_RATIO
}

fn default_rt_period_us() -> i64 {
    DEFAULT_RT_PERIOD_US
}

fn default_rt_runtime_us() -> i64 {
    DEFAULT_RT_RUNTIME_US
}

fn default_rr_timeslice_ms() -> i64 {
    RR_TIMESLICE_MS as i64
}

fn default_tick_ns() -> u64 {
    DEFAULT_TICK_NS
}

fn default_ontime_up() -> u64 {
    DEFAULT_ONTIME_UP
}

fn default_ontime_down() -> u64 {
    DEFAULT_ONTIME_DOWN
}

fn default_margin_pct() -> u64 {
    DEFAULT_MARGIN_PCT
}

impl KairosConfig {
    /// Load configuration from file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Build the scheduler topology.
    pub fn topology(&self) -> nyx_sched::Result<Topology> {
        let specs: Vec<CoregroupSpec> = self
            .topology
            .coregroups
            .iter()
            .map(|g| CoregroupSpec::new(CpuMask::from_cpus(&g.cpus), g.capacity))
            .collect();
        Topology::new(&specs)
    }

    /// Scheduler tunables, with per-coregroup fluid ratios in topology order.
    pub fn tunables(&self) -> Tunables {
        let s = &self.sched;
        let mut features = SchedFeatures::empty();
        features.set(SchedFeatures::RT_PUSH_IPI, s.rt_push_ipi);
        features.set(SchedFeatures::RT_RUNTIME_SHARE, s.rt_runtime_share);
        features.set(SchedFeatures::FLUID_RT, s.fluid_rt);

        Tunables {
            rt_period_us: s.rt_period_us,
            rt_runtime_us: s.rt_runtime_us,
            rr_timeslice_ms: s.rr_timeslice_ms,
            tick_ns: s.tick_ns,
            features,
            ontime_up: s.ontime_up,
            ontime_down: s.ontime_down,
            frt_ratios: self
                .topology
                .coregroups
                .iter()
                .map(|g| FrtRatios {
                    coverage: g.coverage_ratio,
                    active: g.active_ratio,
                })
                .collect(),
        }
    }

    /// Energy table, if any coregroup describes its capacity states.
    pub fn energy(&self) -> Option<EnergyTable> {
        let groups: Vec<_> = self
            .topology
            .coregroups
            .iter()
            .filter_map(|g| g.energy.as_ref().map(|e| (g, e)))
            .collect();
        if groups.is_empty() {
            return None;
        }

        let table = groups.into_iter().fold(EnergyTable::new(), |table, (g, e)| {
            let states = e
                .states
                .iter()
                .map(|&(capacity, power)| CapState { capacity, power })
                .collect();
            table.with_coregroup(CpuMask::from_cpus(&g.cpus), states, e.idle_power)
        });
        Some(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_is_default_big_little() {
        let config: KairosConfig = toml::from_str("").unwrap();
        let topo = config.topology().unwrap();
        assert_eq!(topo.nr_cpus(), 8);
        assert_eq!(topo.min_capacity(), 512);
        assert_eq!(topo.max_capacity(), 1024);
        assert_eq!(config.tunables().features, SchedFeatures::all());
        assert!(config.energy().is_none());
    }

    #[test]
    fn test_partial_sections() {
        let config: KairosConfig = toml::from_str(
            r#"
            [sched]
            rt_runtime_us = -1
            rt_push_ipi = false

            [[topology.coregroups]]
            cpus = [0, 1]
            capacity = 1024
            active_ratio = 30
            energy = { states = [[512, 100], [1024, 400]], idle_power = 5 }
            "#,
        )
        .unwrap();

        let tunables = config.tunables();
        assert_eq!(tunables.rt_runtime_us, -1);
        assert_eq!(tunables.rt_period_us, DEFAULT_RT_PERIOD_US);
        assert!(!tunables.features.contains(SchedFeatures::RT_PUSH_IPI));
        assert!(tunables.features.contains(SchedFeatures::FLUID_RT));
        assert_eq!(
            tunables.frt_ratios,
            [FrtRatios {
                coverage: DEFAULT_COVERAGE_RATIO,
                active: 30
            }]
        );
        assert_eq!(config.topology().unwrap().nr_cpus(), 2);
        assert!(config.energy().is_some());
    }

    #[test]
    fn test_bad_topology_is_rejected() {
        let config: KairosConfig = toml::from_str(
            r#"
            [[topology.coregroups]]
            cpus = [0, 2]
            capacity = 512
            "#,
        )
        .unwrap();
        assert!(config.topology().is_err());
    }

    #[test]
    fn test_save_then_load() {
        let dir = std::env::temp_dir().join(format!("kairos-config-{}", std::process::id()));
        let path = dir.join("kairos.toml");
        let mut config = KairosConfig::default();
        config.sched.ontime_up = 500;
        config.platform.margin_pct = 90;
        config.save(&path).unwrap();

        let loaded = KairosConfig::load(&path).unwrap();
        assert_eq!(loaded.sched.ontime_up, 500);
        assert_eq!(loaded.platform.margin_pct, 90);
        assert_eq!(loaded.topology.coregroups.len(), 2);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_missing_file_loads_defaults() {
        let config = KairosConfig::load(Path::new("/nonexistent/kairos.toml")).unwrap();
        assert_eq!(config.sched.tick_ns, DEFAULT_TICK_NS);
    }
}
