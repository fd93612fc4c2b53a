//! Wakeup balancing of fair tasks on a 4+4 big.LITTLE model.

use nyx_sched::sched::WakeFlags;
use nyx_sched::{PlatformModel, Scheduler, TaskId, TaskSpec, Topology, TraceEvent, Tunables};

fn scheduler() -> Scheduler<PlatformModel> {
    let topo = Topology::big_little(4, 512, 4, 1024).unwrap();
    Scheduler::new(PlatformModel::new(&topo), topo, Tunables::default()).unwrap()
}

/// State label of the most recent wakeup balance for `task`.
fn last_balance(s: &Scheduler<PlatformModel>, task: TaskId) -> Option<(Option<usize>, &'static str)> {
    s.platform()
        .events()
        .into_iter()
        .filter_map(|e| match e {
            TraceEvent::WakeupBalance { task: t, cpu, state } if t == task => Some((cpu, state)),
            _ => None,
        })
        .last()
}

/// Put `task` back to sleep, change its attributes and wake it again.
fn rewake(s: &Scheduler<PlatformModel>, task: TaskId, f: impl FnOnce(&mut nyx_sched::TaskAttrs)) {
    s.sleep(task).unwrap();
    s.platform().update_task_attrs(task, f);
    assert!(s.wake_up(task, WakeFlags::empty()).unwrap());
}

#[test]
fn test_fast_path_keeps_idle_prev() {
    let s = scheduler();
    let t = s.spawn(TaskSpec::normal().on_cpu(0)).unwrap();
    assert_eq!(last_balance(&s, t), Some((Some(0), "fast path")));

    // A deep idle state is not worth the wakeup latency.
    s.platform().set_idle(0, 2);
    rewake(&s, t, |_| {});
    assert_ne!(last_balance(&s, t), Some((Some(0), "fast path")));
}

#[test]
fn test_prefer_idle_takes_shallowest_idle_cpu() {
    let s = scheduler();
    let t = s.spawn(TaskSpec::normal().on_cpu(0)).unwrap();

    let p = s.platform();
    for cpu in [0, 3, 4, 5, 6, 7] {
        p.set_busy(cpu);
        p.set_cpu_util(cpu, 200);
    }
    p.set_idle(1, 2);
    p.set_idle(2, 1);

    rewake(&s, t, |a| {
        a.prefer_idle = true;
        a.util_est = 100;
    });

    assert_eq!(s.task_info(t).unwrap().cpu, 2);
    assert_eq!(last_balance(&s, t), Some((Some(2), "prefer-idle")));
    assert!(p.events().contains(&TraceEvent::SelectIdle {
        task: t,
        cpu: Some(2),
        state: "lowest_idle_util",
    }));
}

#[test]
fn test_proper_cpu_picks_least_loaded_little() {
    let s = scheduler();
    let t = s.spawn(TaskSpec::normal().on_cpu(0)).unwrap();

    let p = s.platform();
    for (cpu, util) in [(0, 300), (1, 100), (2, 200), (3, 250)] {
        p.set_busy(cpu);
        p.set_cpu_util(cpu, util);
    }
    rewake(&s, t, |a| a.util_est = 50);

    assert_eq!(s.task_info(t).unwrap().cpu, 1);
    assert_eq!(last_balance(&s, t), Some((Some(1), "proper cpu")));
    assert!(p.events().contains(&TraceEvent::SelectProper {
        task: t,
        cpu: Some(1),
        util: 150,
    }));
}

#[test]
fn test_proper_cpu_idle_tie_stays_on_prev() {
    let s = scheduler();
    let t = s.spawn(TaskSpec::normal().on_cpu(0)).unwrap();

    let p = s.platform();
    for cpu in 4..8 {
        p.set_busy(cpu);
    }
    // Same idle depth everywhere; prev is the busiest of them.
    for (cpu, util) in [(0, 300), (1, 100), (2, 200), (3, 250)] {
        p.set_idle(cpu, 2);
        p.set_cpu_util(cpu, util);
    }
    rewake(&s, t, |a| a.util_est = 50);

    assert_eq!(s.task_info(t).unwrap().cpu, 0);
    assert_eq!(last_balance(&s, t), Some((Some(0), "proper cpu")));
}

#[test]
fn test_proper_cpu_idle_prefers_shallower_state_over_prev() {
    let s = scheduler();
    let t = s.spawn(TaskSpec::normal().on_cpu(0)).unwrap();

    let p = s.platform();
    for cpu in 4..8 {
        p.set_busy(cpu);
    }
    for cpu in 0..4 {
        p.set_idle(cpu, 2);
    }
    p.set_idle(3, 1);
    p.set_cpu_util(3, 200);
    rewake(&s, t, |a| a.util_est = 50);

    assert_eq!(s.task_info(t).unwrap().cpu, 3);
}

#[test]
fn test_proper_cpu_active_tie_takes_last() {
    let s = scheduler();
    let t = s.spawn(TaskSpec::normal().on_cpu(0)).unwrap();

    let p = s.platform();
    for (cpu, util) in [(0, 400), (1, 100), (2, 100), (3, 100)] {
        p.set_busy(cpu);
        p.set_cpu_util(cpu, util);
    }
    rewake(&s, t, |a| a.util_est = 50);

    assert_eq!(s.task_info(t).unwrap().cpu, 3);
    assert!(p.events().contains(&TraceEvent::SelectProper {
        task: t,
        cpu: Some(3),
        util: 150,
    }));
}

#[test]
fn test_proper_cpu_falls_back_to_prev_when_nothing_fits() {
    let s = scheduler();
    let t = s.spawn(TaskSpec::normal().on_cpu(1)).unwrap();

    let p = s.platform();
    for cpu in 0..8 {
        p.set_busy(cpu);
        p.set_cpu_util(cpu, 1000);
    }
    rewake(&s, t, |a| a.util_est = 100);

    assert_eq!(s.task_info(t).unwrap().cpu, 1);
    assert_eq!(last_balance(&s, t), Some((Some(1), "proper cpu")));
    assert!(p.events().contains(&TraceEvent::SelectProper {
        task: t,
        cpu: None,
        util: 0,
    }));
}

#[test]
fn test_ontime_hysteresis() {
    let s = scheduler();
    let t = s.spawn(TaskSpec::normal().on_cpu(0)).unwrap();
    let p = s.platform();
    for cpu in [4, 5] {
        p.set_busy(cpu);
    }
    p.set_idle(6, 1);
    p.set_idle(7, 0);

    // Above the up threshold: the shallowest idle big CPU.
    rewake(&s, t, |a| a.util_est = 450);
    assert_eq!(last_balance(&s, t), Some((Some(7), "ontime migration")));
    assert!(s.is_ontime(t));

    // Between the thresholds it stays ontime.
    p.set_busy(7);
    rewake(&s, t, |a| a.util_est = 350);
    assert_eq!(last_balance(&s, t), Some((Some(6), "ontime migration")));
    assert!(s.is_ontime(t));

    // Below the down threshold it leaves.
    rewake(&s, t, |a| a.util_est = 200);
    assert!(!s.is_ontime(t));
    assert_ne!(last_balance(&s, t).map(|(_, state)| state), Some("ontime migration"));
}

#[test]
fn test_prefer_perf_and_global_boost() {
    let s = scheduler();
    let t = s.spawn(TaskSpec::normal().on_cpu(0)).unwrap();
    let p = s.platform();
    p.set_busy(0);

    rewake(&s, t, |a| a.prefer_perf = true);
    let (cpu, state) = last_balance(&s, t).unwrap();
    assert_eq!(state, "prefer-perf");
    assert!(cpu.is_some_and(|cpu| cpu >= 4));

    let u = s.spawn(TaskSpec::normal().on_cpu(1)).unwrap();
    p.set_busy(1);
    p.set_global_boost(true);
    rewake(&s, u, |_| {});
    let (cpu, state) = last_balance(&s, u).unwrap();
    assert_eq!(state, "global boosting");
    assert!(cpu.is_some_and(|cpu| cpu >= 4));
}

#[test]
fn test_service_task_prefers_high_capacity() {
    let s = scheduler();
    let t = s.spawn(TaskSpec::normal().on_cpu(0)).unwrap();
    s.platform().set_busy(0);
    rewake(&s, t, |a| a.prefer_high_cap = true);
    let (cpu, state) = last_balance(&s, t).unwrap();
    assert_eq!(state, "service");
    assert!(s.topology().fastest_mask().test(cpu.unwrap()));
}
