//! RT push/pull migration, with and without the push relay.

use nyx_sched::sched::SchedFeatures;
use nyx_sched::{CpuMask, PlatformModel, Scheduler, TaskId, TaskSpec, Topology, TraceEvent, Tunables};

fn scheduler(nr_cpus: usize, features: SchedFeatures) -> Scheduler<PlatformModel> {
    let topo = Topology::uniform(nr_cpus, 1024).unwrap();
    let tunables = Tunables {
        features,
        ..Tunables::default()
    };
    Scheduler::new(PlatformModel::new(&topo), topo, tunables).unwrap()
}

fn migrations(s: &Scheduler<PlatformModel>, task: TaskId) -> Vec<(usize, usize, &'static str)> {
    s.platform()
        .events()
        .into_iter()
        .filter_map(|e| match e {
            TraceEvent::Migrate { task: t, from, to, reason } if t == task => Some((from, to, reason)),
            _ => None,
        })
        .collect()
}

/// CPU 0 runs a pinned task `a` with a lower-priority migratable `b`
/// queued behind it; CPU 1 runs a pinned higher-priority task `c`.
fn overloaded_pair(s: &Scheduler<PlatformModel>) -> (TaskId, TaskId, TaskId) {
    let a = s.spawn(TaskSpec::fifo(50).on_cpu(0).affinity(CpuMask::single(0))).unwrap();
    assert_eq!(s.schedule(0).unwrap(), Some(a));
    let c = s.spawn(TaskSpec::fifo(60).on_cpu(1).affinity(CpuMask::single(1))).unwrap();
    assert_eq!(s.schedule(1).unwrap(), Some(c));

    let b = s.spawn(TaskSpec::fifo(10).on_cpu(0)).unwrap();
    assert_eq!(s.task_info(b).unwrap().cpu, 0);
    assert_eq!(s.pushable_tasks(0).unwrap(), [b]);
    assert_eq!(s.overloaded_cpus(), CpuMask::single(0));
    (a, b, c)
}

#[test]
fn test_wakeup_goes_to_lowest_cpu() {
    let s = scheduler(2, SchedFeatures::RT_RUNTIME_SHARE);
    let a = s.spawn(TaskSpec::fifo(50).on_cpu(0).affinity(CpuMask::single(0))).unwrap();
    s.schedule(0).unwrap();

    // CPU 0 runs a pinned higher task; CPU 1 runs nothing.
    let b = s.spawn(TaskSpec::fifo(10).on_cpu(0)).unwrap();
    assert_eq!(s.task_info(b).unwrap().cpu, 1);
    assert_eq!(s.current(0).unwrap(), Some(a));
    assert!(s.overloaded_cpus().is_empty());
}

#[test]
fn test_pull_when_cpu_drops_priority() {
    let s = scheduler(2, SchedFeatures::RT_RUNTIME_SHARE);
    let (a, b, c) = overloaded_pair(&s);

    s.sleep(c).unwrap();
    assert_eq!(s.current(1).unwrap(), Some(b));
    assert_eq!(migrations(&s, b), [(0, 1, "pull")]);

    assert_eq!(s.current(0).unwrap(), Some(a));
    assert!(s.overloaded_cpus().is_empty());
    assert!(s.verify_rq(0).unwrap());
    assert!(s.verify_rq(1).unwrap());
}

#[test]
fn test_relay_pushes_instead_of_pulling() {
    let s = scheduler(2, SchedFeatures::RT_RUNTIME_SHARE | SchedFeatures::RT_PUSH_IPI);
    let (_a, b, c) = overloaded_pair(&s);

    // CPU 1 only asks; nothing moves until the relay runs on CPU 0.
    s.sleep(c).unwrap();
    assert_eq!(s.current(1).unwrap(), None);
    assert_eq!(s.task_info(b).unwrap().cpu, 0);

    assert_eq!(s.drain_irq_work(), 1);
    assert_eq!(migrations(&s, b), [(0, 1, "push")]);
    assert!(s.need_resched(1).unwrap());
    assert_eq!(s.schedule(1).unwrap(), Some(b));
}

#[test]
fn test_push_on_preemption() {
    let s = scheduler(2, SchedFeatures::RT_RUNTIME_SHARE);
    let low = s.spawn(TaskSpec::fifo(10).on_cpu(0)).unwrap();
    assert_eq!(s.schedule(0).unwrap(), Some(low));
    let c = s.spawn(TaskSpec::fifo(60).on_cpu(1).affinity(CpuMask::single(1))).unwrap();
    s.schedule(1).unwrap();

    // A pinned higher task preempts `low`, which has nowhere better to go
    // until CPU 1 frees up.
    let high = s.spawn(TaskSpec::fifo(50).on_cpu(0).affinity(CpuMask::single(0))).unwrap();
    assert_eq!(s.schedule(0).unwrap(), Some(high));
    assert_eq!(s.task_info(low).unwrap().cpu, 0);

    s.exit(c).unwrap();
    assert_eq!(s.task_info(low).unwrap().cpu, 1);
    assert_eq!(s.current(1).unwrap(), Some(low));
}
