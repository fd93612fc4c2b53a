//! RT throttling and replenishment driven by the tick.

use nyx_sched::sched::SchedFeatures;
use nyx_sched::{Platform, PlatformModel, Scheduler, SchedError, TaskSpec, Topology, TraceEvent, Tunables};

const TICK: u64 = 4_000_000;

fn scheduler(nr_cpus: usize, features: SchedFeatures) -> Scheduler<PlatformModel> {
    let topo = Topology::uniform(nr_cpus, 1024).unwrap();
    let tunables = Tunables {
        rt_period_us: 100_000,
        rt_runtime_us: 50_000,
        features,
        ..Tunables::default()
    };
    Scheduler::new(PlatformModel::new(&topo), topo, tunables).unwrap()
}

/// Advance one tick on `cpu`, rescheduling if asked to.
fn step(s: &Scheduler<PlatformModel>, cpu: usize) {
    s.platform().advance(TICK);
    if s.tick(cpu).unwrap() {
        s.schedule(cpu).unwrap();
    }
}

#[test]
fn test_throttle_then_replenish() {
    let s = scheduler(1, SchedFeatures::RT_RUNTIME_SHARE);
    let t = s.spawn(TaskSpec::fifo(10)).unwrap();
    assert_eq!(s.schedule(0).unwrap(), Some(t));
    assert_eq!(s.rt_period_expires(), Some(100_000_000));

    let mut ticks = 0;
    while !s.rt_throttled(0).unwrap() {
        step(&s, 0);
        ticks += 1;
        assert!(ticks < 20, "never throttled");
    }
    // 50ms of runtime at 4ms per tick.
    assert_eq!(ticks, 13);
    assert_eq!(s.current(0).unwrap(), None);
    assert_eq!(s.nr_running(0).unwrap(), 0);

    let throttle = s
        .platform()
        .events()
        .into_iter()
        .find(|e| matches!(e, TraceEvent::RtThrottle { .. }));
    match throttle {
        Some(TraceEvent::RtThrottle { cpu, rt_time, runtime }) => {
            assert_eq!(cpu, 0);
            assert_eq!(runtime, 50_000_000);
            assert!(rt_time > runtime);
        }
        other => panic!("expected a throttle event, got {:?}", other),
    }

    // The period timer lifts the throttle at 100ms.
    while s.rt_throttled(0).unwrap() {
        step(&s, 0);
        assert!(s.platform().now() <= 100_000_000);
    }
    assert_eq!(s.schedule(0).unwrap(), Some(t));
    assert_eq!(s.rt_period_expires(), Some(200_000_000));
}

#[test]
fn test_fair_task_runs_while_throttled() {
    let s = scheduler(1, SchedFeatures::RT_RUNTIME_SHARE);
    let rt = s.spawn(TaskSpec::fifo(10)).unwrap();
    let fair = s.spawn(TaskSpec::normal()).unwrap();
    assert_eq!(s.schedule(0).unwrap(), Some(rt));

    while !s.rt_throttled(0).unwrap() {
        step(&s, 0);
    }
    assert_eq!(s.current(0).unwrap(), Some(fair));
}

#[test]
fn test_borrowing_delays_throttle() {
    let s = scheduler(2, SchedFeatures::RT_RUNTIME_SHARE);
    let t = s
        .spawn(TaskSpec::fifo(10).on_cpu(0).affinity(nyx_sched::CpuMask::single(0)))
        .unwrap();
    assert_eq!(s.schedule(0).unwrap(), Some(t));

    let mut ticks = 0;
    while !s.rt_throttled(0).unwrap() && ticks < 24 {
        step(&s, 0);
        ticks += 1;
    }
    // CPU 1 lends its idle runtime: nothing throttles within the period.
    assert!(!s.rt_throttled(0).unwrap());
    assert!(s.rt_runtime(0).unwrap().rt_runtime > 50_000_000);
    assert!(s.rt_runtime(1).unwrap().rt_runtime < 50_000_000);
}

#[test]
fn test_no_borrowing_without_sharing() {
    let s = scheduler(2, SchedFeatures::empty());
    let t = s
        .spawn(TaskSpec::fifo(10).on_cpu(0).affinity(nyx_sched::CpuMask::single(0)))
        .unwrap();
    assert_eq!(s.schedule(0).unwrap(), Some(t));

    let mut ticks = 0;
    while !s.rt_throttled(0).unwrap() {
        step(&s, 0);
        ticks += 1;
        assert!(ticks < 20, "never throttled");
    }
    assert_eq!(s.rt_runtime(1).unwrap().rt_runtime, 50_000_000);
}

#[test]
fn test_invalid_bandwidth_keeps_settings() {
    let s = scheduler(1, SchedFeatures::empty());
    assert_eq!(s.set_rt_bandwidth(0, 10), Err(SchedError::InvalidPeriod));
    assert_eq!(s.set_rt_bandwidth(100, -2), Err(SchedError::InvalidRuntime));
    assert_eq!(
        s.set_rt_bandwidth(100, 200),
        Err(SchedError::RuntimeExceedsPeriod { runtime: 200, period: 100 })
    );
    let b = s.rt_bandwidth();
    assert_eq!(b.period, 100_000_000);
    assert_eq!(b.runtime, 50_000_000);

    // Unlimited runtime never throttles.
    s.set_rt_bandwidth(100_000, -1).unwrap();
    let t = s.spawn(TaskSpec::fifo(10)).unwrap();
    assert_eq!(s.schedule(0).unwrap(), Some(t));
    for _ in 0..40 {
        step(&s, 0);
    }
    assert!(!s.rt_throttled(0).unwrap());
    assert_eq!(s.current(0).unwrap(), Some(t));
}
