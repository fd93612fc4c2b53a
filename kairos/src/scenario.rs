//! Scenario replay
//!
//! A scenario is a list of steps (spawn, wake, tick, platform changes,
//! expectations) read from TOML or JSON. [`Simulator::replay`] runs them in
//! order against a fresh scheduler and writes every scheduling decision the
//! core reports, step by step.

use crate::config::KairosConfig;
use nyx_sched::sched::{Policy, WakeFlags};
use nyx_sched::{
    CpuMask, Platform, PlatformModel, SchedError, Scheduler, TaskAttrs, TaskId, TaskSpec, TraceEvent,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use tracing::debug;

/// Scenario errors
#[derive(Debug, thiserror::Error)]
pub enum ScenarioError {
    #[error("failed to read scenario: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid TOML scenario: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid JSON scenario: {0}")]
    Json(#[from] serde_json::Error),

    #[error("step {step}: unknown task '{name}'")]
    UnknownTask { step: usize, name: String },

    #[error("step {step}: task '{name}' already exists")]
    DuplicateTask { step: usize, name: String },

    #[error("step {step}: {source}")]
    Sched {
        step: usize,
        #[source]
        source: SchedError,
    },

    #[error("step {step}: expectation failed: {message}")]
    Expectation { step: usize, message: String },
}

pub type Result<T> = std::result::Result<T, ScenarioError>;

/// Scheduling policy as written in scenarios
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyName {
    Normal,
    Batch,
    Idle,
    Fifo,
    #[serde(alias = "rr")]
    RoundRobin,
}

impl From<PolicyName> for Policy {
    fn from(name: PolicyName) -> Self {
        match name {
            PolicyName::Normal => Policy::Normal,
            PolicyName::Batch => Policy::Batch,
            PolicyName::Idle => Policy::Idle,
            PolicyName::Fifo => Policy::Fifo,
            PolicyName::RoundRobin => Policy::RoundRobin,
        }
    }
}

/// Fair-placement hints for a task. Unset fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttrsUpdate {
    #[serde(default)]
    pub util_est: Option<u64>,
    #[serde(default)]
    pub boost: Option<i32>,
    #[serde(default)]
    pub prefer_idle: Option<bool>,
    #[serde(default)]
    pub prefer_perf: Option<bool>,
    #[serde(default)]
    pub prefer_high_cap: Option<bool>,
    #[serde(default)]
    pub on_top: Option<bool>,
    #[serde(default)]
    pub top_app: Option<bool>,
}

impl AttrsUpdate {
    fn apply(&self, attrs: &mut TaskAttrs) {
        if let Some(v) = self.util_est {
            attrs.util_est = v;
        }
        if let Some(v) = self.boost {
            attrs.boost = v;
        }
        if let Some(v) = self.prefer_idle {
            attrs.prefer_idle = v;
        }
        if let Some(v) = self.prefer_perf {
            attrs.prefer_perf = v;
        }
        if let Some(v) = self.prefer_high_cap {
            attrs.prefer_high_cap = v;
        }
        if let Some(v) = self.on_top {
            attrs.on_top = v;
        }
        if let Some(v) = self.top_app {
            attrs.top_app = v;
        }
    }
}

/// One scenario step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    /// Create a task and wake it. Attributes apply from its next wakeup.
    Spawn {
        name: String,
        policy: PolicyName,
        /// RT priority for RT policies, nice value otherwise
        #[serde(default)]
        priority: i32,
        #[serde(default)]
        cpu: Option<usize>,
        #[serde(default)]
        util: u64,
        #[serde(default)]
        affinity: Option<Vec<usize>>,
        #[serde(default)]
        attrs: Option<AttrsUpdate>,
    },
    Wake {
        task: String,
        #[serde(default)]
        sync: bool,
    },
    Sleep {
        task: String,
    },
    Exit {
        task: String,
    },
    /// Advance the clock by `count` ticks, ticking every online CPU (or
    /// only `cpu`) and rescheduling where asked to.
    Tick {
        #[serde(default)]
        cpu: Option<usize>,
        #[serde(default = "default_count")]
        count: u32,
    },
    Schedule {
        cpu: usize,
    },
    Yield {
        cpu: usize,
    },
    SetScheduler {
        task: String,
        policy: PolicyName,
        #[serde(default)]
        priority: i32,
    },
    /// Priority inheritance: boost to `prio`, or drop the boost.
    Boost {
        task: String,
        #[serde(default)]
        prio: Option<u32>,
    },
    SetAttrs {
        task: String,
        #[serde(flatten)]
        attrs: AttrsUpdate,
    },
    SetAffinity {
        task: String,
        cpus: Vec<usize>,
    },
    SetIdle {
        cpu: usize,
        #[serde(default)]
        state: i32,
    },
    SetBusy {
        cpu: usize,
    },
    SetUtil {
        cpu: usize,
        util: u64,
    },
    SetOverutilized {
        cpu: usize,
        over: bool,
    },
    GlobalBoost {
        on: bool,
    },
    Online {
        cpu: usize,
    },
    Offline {
        cpu: usize,
    },
    Bandwidth {
        period_us: i64,
        runtime_us: i64,
    },
    /// Advance the clock without ticking.
    Advance {
        ns: u64,
    },
    /// Run every pending relay hop.
    Drain,
    ExpectCpu {
        task: String,
        cpu: usize,
    },
    ExpectCurrent {
        cpu: usize,
        #[serde(default)]
        task: Option<String>,
    },
    ExpectThrottled {
        cpu: usize,
        throttled: bool,
    },
}

fn default_count() -> u32 {
    1
}

/// A named list of steps
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default, rename = "step")]
    pub steps: Vec<Step>,
}

impl Scenario {
    /// Load a scenario; `.json` files are JSON, anything else TOML.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        if path.extension().is_some_and(|ext| ext == "json") {
            Self::from_json(&content)
        } else {
            Self::from_toml(&content)
        }
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }
}

/// A scheduler on a modelled platform, plus the task names a scenario uses.
pub struct Simulator {
    sched: Scheduler<PlatformModel>,
    tick_ns: u64,
    tasks: HashMap<String, TaskId>,
    names: HashMap<TaskId, String>,
}

impl Simulator {
    pub fn new(config: &KairosConfig) -> anyhow::Result<Self> {
        let topology = config.topology()?;
        let platform = PlatformModel::new(&topology);
        platform.set_margin_pct(config.platform.margin_pct);
        platform.set_global_boost(config.platform.global_boost);

        let tunables = config.tunables();
        let tick_ns = tunables.tick_ns;
        let mut sched = Scheduler::new(platform, topology, tunables)?;
        if let Some(energy) = config.energy() {
            sched = sched.with_energy(energy);
        }

        Ok(Self {
            sched,
            tick_ns,
            tasks: HashMap::new(),
            names: HashMap::new(),
        })
    }

    pub fn scheduler(&self) -> &Scheduler<PlatformModel> {
        &self.sched
    }

    /// Id of the task a scenario calls `name`.
    pub fn task(&self, name: &str) -> Option<TaskId> {
        self.tasks.get(name).copied()
    }

    /// Run every step, writing decisions to `out`. Stops at the first
    /// failing step.
    pub fn replay(&mut self, scenario: &Scenario, out: &mut impl Write) -> anyhow::Result<()> {
        if let Some(name) = &scenario.name {
            writeln!(out, "# {}", name)?;
        }
        for (i, step) in scenario.steps.iter().enumerate() {
            let index = i + 1;
            debug!("step {}: {:?}", index, step);
            self.sched.platform().clear_events();
            self.run_step(index, step)?;

            writeln!(out, "[{:>12.3}ms] step {}: {}", self.now_ms(), index, self.label(step))?;
            for event in self.sched.platform().events() {
                writeln!(out, "    {}", self.describe(&event))?;
            }
        }
        self.summary(out)?;
        Ok(())
    }

    /// Per-CPU state at the end of a run.
    pub fn summary(&self, out: &mut impl Write) -> anyhow::Result<()> {
        writeln!(out, "--- final state at {:.3}ms", self.now_ms())?;
        for cpu in 0..self.sched.nr_cpus() {
            let online = self.sched.online_cpus().test(cpu);
            let curr = self.sched.current(cpu)?.map_or_else(|| "-".to_string(), |t| self.name(t));
            let queue: Vec<String> = self.sched.rt_queue(cpu)?.into_iter().map(|t| self.name(t)).collect();
            writeln!(
                out,
                "cpu{:<2} {:<7} curr={:<12} nr_running={} rt_queue=[{}]{}",
                cpu,
                if online { "online" } else { "offline" },
                curr,
                self.sched.nr_running(cpu)?,
                queue.join(", "),
                if self.sched.rt_throttled(cpu)? { " throttled" } else { "" },
            )?;
        }
        Ok(())
    }

    fn now_ms(&self) -> f64 {
        self.sched.platform().now() as f64 / 1_000_000.0
    }

    fn lookup(&self, step: usize, name: &str) -> Result<TaskId> {
        self.task(name).ok_or_else(|| ScenarioError::UnknownTask {
            step,
            name: name.to_string(),
        })
    }

    fn name(&self, task: TaskId) -> String {
        self.names.get(&task).cloned().unwrap_or_else(|| format!("#{}", task))
    }

    fn run_step(&mut self, index: usize, step: &Step) -> Result<()> {
        let sched_err = |source| ScenarioError::Sched { step: index, source };
        let s = &self.sched;

        match step {
            Step::Spawn {
                name,
                policy,
                priority,
                cpu,
                util,
                affinity,
                attrs,
            } => {
                if self.tasks.contains_key(name) {
                    return Err(ScenarioError::DuplicateTask {
                        step: index,
                        name: name.clone(),
                    });
                }
                let mut spec = TaskSpec::with_policy((*policy).into(), *priority).name(name).util(*util);
                if let Some(cpu) = cpu {
                    spec = spec.on_cpu(*cpu);
                }
                if let Some(cpus) = affinity {
                    spec = spec.affinity(CpuMask::from_cpus(cpus));
                }
                let id = s.spawn(spec).map_err(sched_err)?;
                if let Some(attrs) = attrs {
                    s.platform().update_task_attrs(id, |a| attrs.apply(a));
                }
                self.tasks.insert(name.clone(), id);
                self.names.insert(id, name.clone());
            }
            Step::Wake { task, sync } => {
                let id = self.lookup(index, task)?;
                let flags = if *sync { WakeFlags::SYNC } else { WakeFlags::empty() };
                s.wake_up(id, flags).map_err(sched_err)?;
            }
            Step::Sleep { task } => {
                let id = self.lookup(index, task)?;
                s.sleep(id).map_err(sched_err)?;
            }
            Step::Exit { task } => {
                let id = self.lookup(index, task)?;
                s.exit(id).map_err(sched_err)?;
                self.tasks.remove(task);
            }
            Step::Tick { cpu, count } => {
                let cpus = match cpu {
                    Some(cpu) => CpuMask::single(*cpu),
                    None => s.online_cpus(),
                };
                for _ in 0..*count {
                    s.platform().advance(self.tick_ns);
                    for cpu in cpus {
                        if s.tick(cpu).map_err(sched_err)? {
                            s.schedule(cpu).map_err(sched_err)?;
                        }
                    }
                    s.drain_irq_work();
                }
            }
            Step::Schedule { cpu } => {
                s.schedule(*cpu).map_err(sched_err)?;
            }
            Step::Yield { cpu } => {
                s.yield_current(*cpu).map_err(sched_err)?;
            }
            Step::SetScheduler { task, policy, priority } => {
                let id = self.lookup(index, task)?;
                s.set_scheduler(id, (*policy).into(), *priority).map_err(sched_err)?;
            }
            Step::Boost { task, prio } => {
                let id = self.lookup(index, task)?;
                s.set_rt_mutex_prio(id, *prio).map_err(sched_err)?;
            }
            Step::SetAttrs { task, attrs } => {
                let id = self.lookup(index, task)?;
                s.platform().update_task_attrs(id, |a| attrs.apply(a));
            }
            Step::SetAffinity { task, cpus } => {
                let id = self.lookup(index, task)?;
                s.set_affinity(id, CpuMask::from_cpus(cpus)).map_err(sched_err)?;
            }
            Step::SetIdle { cpu, state } => s.platform().set_idle(*cpu, *state),
            Step::SetBusy { cpu } => s.platform().set_busy(*cpu),
            Step::SetUtil { cpu, util } => s.platform().set_cpu_util(*cpu, *util),
            Step::SetOverutilized { cpu, over } => s.platform().set_overutilized(*cpu, *over),
            Step::GlobalBoost { on } => s.platform().set_global_boost(*on),
            Step::Online { cpu } => s.set_cpu_online(*cpu, true).map_err(sched_err)?,
            Step::Offline { cpu } => s.set_cpu_online(*cpu, false).map_err(sched_err)?,
            Step::Bandwidth { period_us, runtime_us } => {
                s.set_rt_bandwidth(*period_us, *runtime_us).map_err(sched_err)?;
            }
            Step::Advance { ns } => {
                s.platform().advance(*ns);
            }
            Step::Drain => {
                s.drain_irq_work();
            }
            Step::ExpectCpu { task, cpu } => {
                let id = self.lookup(index, task)?;
                let actual = s.task_info(id).map_err(sched_err)?.cpu;
                if actual != *cpu {
                    return Err(ScenarioError::Expectation {
                        step: index,
                        message: format!("{} is on cpu{}, expected cpu{}", task, actual, cpu),
                    });
                }
            }
            Step::ExpectCurrent { cpu, task } => {
                let expected = task.as_deref().map(|t| self.lookup(index, t)).transpose()?;
                let actual = s.current(*cpu).map_err(sched_err)?;
                if actual != expected {
                    return Err(ScenarioError::Expectation {
                        step: index,
                        message: format!(
                            "cpu{} runs {}, expected {}",
                            cpu,
                            actual.map_or_else(|| "nothing".to_string(), |t| self.name(t)),
                            task.as_deref().unwrap_or("nothing"),
                        ),
                    });
                }
            }
            Step::ExpectThrottled { cpu, throttled } => {
                if s.rt_throttled(*cpu).map_err(sched_err)? != *throttled {
                    return Err(ScenarioError::Expectation {
                        step: index,
                        message: format!(
                            "cpu{} is {}throttled",
                            cpu,
                            if *throttled { "not " } else { "" }
                        ),
                    });
                }
            }
        }
        Ok(())
    }

    fn label(&self, step: &Step) -> String {
        match step {
            Step::Spawn { name, policy, priority, .. } => {
                format!("spawn {} ({:?} {})", name, policy, priority)
            }
            Step::Wake { task, .. } => format!("wake {}", task),
            Step::Sleep { task } => format!("sleep {}", task),
            Step::Exit { task } => format!("exit {}", task),
            Step::Tick { cpu: Some(cpu), count } => format!("tick x{} cpu{}", count, cpu),
            Step::Tick { cpu: None, count } => format!("tick x{}", count),
            Step::Schedule { cpu } => format!("schedule cpu{}", cpu),
            Step::Yield { cpu } => format!("yield cpu{}", cpu),
            Step::SetScheduler { task, policy, priority } => {
                format!("set_scheduler {} ({:?} {})", task, policy, priority)
            }
            Step::Boost { task, prio: Some(prio) } => format!("boost {} to {}", task, prio),
            Step::Boost { task, prio: None } => format!("unboost {}", task),
            Step::SetAttrs { task, .. } => format!("set_attrs {}", task),
            Step::SetAffinity { task, cpus } => format!("set_affinity {} {:?}", task, cpus),
            Step::SetIdle { cpu, state } => format!("cpu{} idle (state {})", cpu, state),
            Step::SetBusy { cpu } => format!("cpu{} busy", cpu),
            Step::SetUtil { cpu, util } => format!("cpu{} util {}", cpu, util),
            Step::SetOverutilized { cpu, over } => format!("cpu{} overutilized={}", cpu, over),
            Step::GlobalBoost { on } => format!("global boost {}", on),
            Step::Online { cpu } => format!("cpu{} online", cpu),
            Step::Offline { cpu } => format!("cpu{} offline", cpu),
            Step::Bandwidth { period_us, runtime_us } => {
                format!("rt bandwidth {}us/{}us", runtime_us, period_us)
            }
            Step::Advance { ns } => format!("advance {}ns", ns),
            Step::Drain => "drain irq work".to_string(),
            Step::ExpectCpu { task, cpu } => format!("expect {} on cpu{}", task, cpu),
            Step::ExpectCurrent { cpu, task } => {
                format!("expect cpu{} runs {}", cpu, task.as_deref().unwrap_or("nothing"))
            }
            Step::ExpectThrottled { cpu, throttled } => {
                format!("expect cpu{} throttled={}", cpu, throttled)
            }
        }
    }

    /// One line per decision.
    fn describe(&self, event: &TraceEvent) -> String {
        let cpu = |cpu: Option<usize>| cpu.map_or_else(|| "none".to_string(), |c| format!("cpu{}", c));
        match *event {
            TraceEvent::WakeupBalance { task, cpu: c, state } => {
                format!("wakeup-balance {} -> {} [{}]", self.name(task), cpu(c), state)
            }
            TraceEvent::SelectIdle { task, cpu: c, state } => {
                format!("select-idle    {} -> {} [{}]", self.name(task), cpu(c), state)
            }
            TraceEvent::SelectProper { task, cpu: c, util } => {
                format!("select-proper  {} -> {} (util {})", self.name(task), cpu(c), util)
            }
            TraceEvent::FluidStat { task, cpu: c, util, state } => {
                format!("fluid-rt       {} -> {} [{}] (util {})", self.name(task), cpu(c), state, util)
            }
            TraceEvent::FluidActivated {
                coregroup,
                util_sum,
                active_thr,
                mask,
            } => format!(
                "fluid-activate coregroup{} util {}/{} activated {}",
                coregroup,
                util_sum,
                active_thr,
                CpuMask::from_bits(mask)
            ),
            TraceEvent::RtThrottle { cpu: c, rt_time, runtime } => {
                format!("rt-throttle    cpu{} rt_time {}ns > runtime {}ns", c, rt_time, runtime)
            }
            TraceEvent::Migrate { task, from, to, reason } => {
                format!("migrate        {} cpu{} -> cpu{} [{}]", self.name(task), from, to, reason)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_cpu_config() -> KairosConfig {
        toml::from_str(
            r#"
            [sched]
            rt_period_us = 100000
            rt_runtime_us = 50000
            rt_push_ipi = false

            [[topology.coregroups]]
            cpus = [0, 1]
            capacity = 1024
            "#,
        )
        .unwrap()
    }

    fn run(config: &KairosConfig, scenario: &str) -> (Simulator, anyhow::Result<()>, String) {
        let scenario = Scenario::from_toml(scenario).unwrap();
        let mut sim = Simulator::new(config).unwrap();
        let mut out = Vec::new();
        let result = sim.replay(&scenario, &mut out);
        (sim, result, String::from_utf8(out).unwrap())
    }

    #[test]
    fn test_parse_toml_steps() {
        let scenario = Scenario::from_toml(
            r#"
            name = "parse"

            [[step]]
            op = "spawn"
            name = "audio"
            policy = "rr"
            priority = 50
            affinity = [0, 1]

            [[step]]
            op = "set_attrs"
            task = "audio"
            prefer_idle = true

            [[step]]
            op = "tick"
            count = 3
            "#,
        )
        .unwrap();

        assert_eq!(scenario.name.as_deref(), Some("parse"));
        assert_eq!(scenario.steps.len(), 3);
        assert!(matches!(
            &scenario.steps[0],
            Step::Spawn { policy: PolicyName::RoundRobin, priority: 50, cpu: None, .. }
        ));
        assert_eq!(
            scenario.steps[1],
            Step::SetAttrs {
                task: "audio".to_string(),
                attrs: AttrsUpdate {
                    prefer_idle: Some(true),
                    ..AttrsUpdate::default()
                },
            }
        );
        assert_eq!(scenario.steps[2], Step::Tick { cpu: None, count: 3 });
    }

    #[test]
    fn test_parse_json_steps() {
        let scenario = Scenario::from_json(
            r#"{ "step": [
                { "op": "spawn", "name": "a", "policy": "fifo", "priority": 10 },
                { "op": "expect_current", "cpu": 0 }
            ] }"#,
        )
        .unwrap();
        assert_eq!(scenario.name, None);
        assert_eq!(
            scenario.steps[1],
            Step::ExpectCurrent { cpu: 0, task: None }
        );
    }

    #[test]
    fn test_unknown_op_is_rejected() {
        let err = Scenario::from_toml("[[step]]\nop = \"explode\"\n").unwrap_err();
        assert!(matches!(err, ScenarioError::Toml(_)));
    }

    #[test]
    fn test_replay_prints_decisions() {
        let (sim, result, out) = run(
            &two_cpu_config(),
            r#"
            [[step]]
            op = "spawn"
            name = "low"
            policy = "fifo"
            priority = 10
            cpu = 0

            [[step]]
            op = "schedule"
            cpu = 0

            [[step]]
            op = "expect_current"
            cpu = 0
            task = "low"
            "#,
        );
        result.unwrap();
        assert!(out.contains("step 1: spawn low (Fifo 10)"));
        assert!(out.contains("fluid-rt       low -> cpu0 [IDLE-FIRST]"));
        assert!(out.contains("curr=low"));
        assert!(sim.task("low").is_some());
    }

    #[test]
    fn test_throttle_is_reported() {
        let (sim, result, out) = run(
            &two_cpu_config(),
            r#"
            [[step]]
            op = "spawn"
            name = "hog"
            policy = "fifo"
            priority = 10
            cpu = 0
            affinity = [0]

            [[step]]
            op = "schedule"
            cpu = 0

            [[step]]
            op = "tick"
            cpu = 0
            count = 13

            [[step]]
            op = "expect_throttled"
            cpu = 0
            throttled = true
            "#,
        );
        // Runtime sharing is on: cpu1 lends its time, so no throttle yet.
        let err = result.unwrap_err();
        assert!(err.to_string().contains("expectation failed"));
        assert!(!out.contains("rt-throttle"));
        assert!(!sim.scheduler().rt_throttled(0).unwrap());
    }

    #[test]
    fn test_throttle_without_sharing() {
        let mut config = two_cpu_config();
        config.sched.rt_runtime_share = false;
        let (_, result, out) = run(
            &config,
            r#"
            [[step]]
            op = "spawn"
            name = "hog"
            policy = "fifo"
            priority = 10
            cpu = 0
            affinity = [0]

            [[step]]
            op = "schedule"
            cpu = 0

            [[step]]
            op = "tick"
            cpu = 0
            count = 13

            [[step]]
            op = "expect_throttled"
            cpu = 0
            throttled = true

            [[step]]
            op = "expect_current"
            cpu = 0
            "#,
        );
        result.unwrap();
        assert!(out.contains("rt-throttle    cpu0"));
        assert!(out.contains("throttled"));
    }

    #[test]
    fn test_unknown_task_stops_replay() {
        let (_, result, out) = run(
            &two_cpu_config(),
            r#"
            [[step]]
            op = "wake"
            task = "ghost"

            [[step]]
            op = "drain"
            "#,
        );
        let err = result.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ScenarioError>(),
            Some(ScenarioError::UnknownTask { step: 1, .. })
        ));
        assert!(!out.contains("step 2"));
    }

    #[test]
    fn test_sched_errors_carry_the_step() {
        let (_, result, _) = run(
            &two_cpu_config(),
            r#"
            [[step]]
            op = "spawn"
            name = "bad"
            policy = "fifo"
            priority = 0
            "#,
        );
        let err = result.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ScenarioError>(),
            Some(ScenarioError::Sched {
                step: 1,
                source: SchedError::InvalidPriority(0)
            })
        ));
    }

    #[test]
    fn test_duplicate_names_are_rejected() {
        let (_, result, _) = run(
            &two_cpu_config(),
            r#"
            [[step]]
            op = "spawn"
            name = "a"
            policy = "normal"

            [[step]]
            op = "spawn"
            name = "a"
            policy = "normal"
            "#,
        );
        assert!(matches!(
            result.unwrap_err().downcast_ref::<ScenarioError>(),
            Some(ScenarioError::DuplicateTask { step: 2, .. })
        ));
    }
}
