//! Structural invariants under random operation sequences, and a
//! multi-threaded smoke run.

use nyx_sched::sched::{Policy, PrioBitmap, SchedFeatures, WakeFlags, MAX_RT_PRIO};
use nyx_sched::{PlatformModel, Scheduler, TaskId, TaskSpec, Topology, Tunables};
use proptest::prelude::*;

const NR_CPUS: usize = 4;
const TICK: u64 = 4_000_000;

fn scheduler(features: SchedFeatures) -> Scheduler<PlatformModel> {
    let topo = Topology::big_little(2, 512, 2, 1024).unwrap();
    let tunables = Tunables {
        rt_period_us: 100_000,
        rt_runtime_us: 80_000,
        features,
        ..Tunables::default()
    };
    Scheduler::new(PlatformModel::new(&topo), topo, tunables).unwrap()
}

fn check(s: &Scheduler<PlatformModel>) {
    for cpu in 0..NR_CPUS {
        assert!(s.verify_rq(cpu).unwrap(), "cpu{} run-queue is inconsistent", cpu);
        if let Some(curr) = s.current(cpu).unwrap() {
            assert_eq!(s.task_info(curr).unwrap().cpu, cpu);
        }
    }
    let queued: u32 = (0..NR_CPUS).map(|cpu| s.nr_running(cpu).unwrap()).sum();
    assert!(queued as usize <= s.tasks().len());
}

#[derive(Clone, Debug)]
enum Op {
    SpawnRt { prio: i32, cpu: usize, util: u64 },
    SpawnFair { nice: i32, cpu: usize },
    Sleep(usize),
    Wake(usize),
    Schedule(usize),
    Tick(usize),
    Renice(usize, i32),
    Boost(usize, u32),
    Exit(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1..=99i32, 0..NR_CPUS, 0..600u64).prop_map(|(prio, cpu, util)| Op::SpawnRt { prio, cpu, util }),
        (-20..=19i32, 0..NR_CPUS).prop_map(|(nice, cpu)| Op::SpawnFair { nice, cpu }),
        (0..16usize).prop_map(Op::Sleep),
        (0..16usize).prop_map(Op::Wake),
        (0..NR_CPUS).prop_map(Op::Schedule),
        (0..NR_CPUS).prop_map(Op::Tick),
        (0..16usize, 1..=99i32).prop_map(|(i, p)| Op::Renice(i, p)),
        (0..16usize, 0..MAX_RT_PRIO).prop_map(|(i, p)| Op::Boost(i, p)),
        (0..16usize).prop_map(Op::Exit),
    ]
}

fn apply(s: &Scheduler<PlatformModel>, tasks: &mut Vec<TaskId>, op: Op) {
    let pick = |i: usize| (!tasks.is_empty()).then(|| tasks[i % tasks.len()]);
    match op {
        Op::SpawnRt { prio, cpu, util } => {
            tasks.push(s.spawn(TaskSpec::fifo(prio).on_cpu(cpu).util(util)).unwrap());
        }
        Op::SpawnFair { nice, cpu } => {
            tasks.push(s.spawn(TaskSpec::normal().nice(nice).on_cpu(cpu)).unwrap());
        }
        Op::Sleep(i) => {
            if let Some(t) = pick(i) {
                s.sleep(t).unwrap();
            }
        }
        Op::Wake(i) => {
            if let Some(t) = pick(i) {
                s.wake_up(t, WakeFlags::empty()).unwrap();
            }
        }
        Op::Schedule(cpu) => {
            s.schedule(cpu).unwrap();
        }
        Op::Tick(cpu) => {
            s.platform().advance(TICK);
            if s.tick(cpu).unwrap() {
                s.schedule(cpu).unwrap();
            }
        }
        Op::Renice(i, prio) => {
            if let Some(t) = pick(i) {
                let policy = if prio % 2 == 0 { Policy::RoundRobin } else { Policy::Normal };
                let priority = if policy == Policy::Normal { prio % 20 } else { prio };
                s.set_scheduler(t, policy, priority).unwrap();
            }
        }
        Op::Boost(i, prio) => {
            if let Some(t) = pick(i) {
                let donor = (prio % 3 != 0).then_some(prio);
                s.set_rt_mutex_prio(t, donor).unwrap();
            }
        }
        Op::Exit(i) => {
            if let Some(t) = pick(i) {
                s.exit(t).unwrap();
                tasks.retain(|&id| id != t);
            }
        }
    }
}

proptest! {
    #[test]
    fn prop_bitmap_first_is_minimum(prios in proptest::collection::btree_set(0..MAX_RT_PRIO, 0..20)) {
        let mut bitmap = PrioBitmap::new();
        for &p in &prios {
            bitmap.set(p);
        }
        prop_assert_eq!(bitmap.first(), prios.iter().next().copied().unwrap_or(MAX_RT_PRIO));
        for &p in &prios {
            prop_assert!(bitmap.test(p));
            bitmap.clear(p);
        }
        prop_assert_eq!(bitmap.first(), MAX_RT_PRIO);
    }

    #[test]
    fn prop_bitmap_next_set(prios in proptest::collection::btree_set(0..MAX_RT_PRIO, 1..20), from in 0..MAX_RT_PRIO) {
        let mut bitmap = PrioBitmap::new();
        for &p in &prios {
            bitmap.set(p);
        }
        let expected = prios.range(from..).next().copied().unwrap_or(MAX_RT_PRIO);
        prop_assert_eq!(bitmap.next_set(from), expected);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_run_queues_stay_consistent(ops in proptest::collection::vec(op(), 1..80), fluid in any::<bool>()) {
        let features = if fluid {
            SchedFeatures::all()
        } else {
            SchedFeatures::RT_RUNTIME_SHARE
        };
        let s = scheduler(features);
        let mut tasks = Vec::new();
        for op in ops {
            apply(&s, &mut tasks, op);
            s.drain_irq_work();
            check(&s);
        }
        prop_assert_eq!(s.tasks().len(), tasks.len());
    }
}

#[test]
fn test_concurrent_smoke() {
    let s = scheduler(SchedFeatures::all());

    std::thread::scope(|scope| {
        for cpu in 0..NR_CPUS {
            let s = &s;
            scope.spawn(move || {
                let mut mine = Vec::new();
                for i in 0..4 {
                    let spec = if i % 2 == 0 {
                        TaskSpec::fifo(10 + i * 10 + cpu as i32).util(50 * (i as u64 + 1))
                    } else {
                        TaskSpec::normal().nice(i - 2)
                    };
                    mine.push(s.spawn(spec.on_cpu(cpu)).unwrap());
                }

                for round in 0..300usize {
                    s.platform().advance(TICK / 4);
                    if s.tick(cpu).unwrap() {
                        s.schedule(cpu).unwrap();
                    }
                    let t = mine[round % mine.len()];
                    match round % 5 {
                        0 => s.sleep(t).unwrap(),
                        1 => {
                            s.wake_up(t, WakeFlags::empty()).unwrap();
                        }
                        2 => {
                            s.schedule(cpu).unwrap();
                        }
                        3 => s.set_rt_mutex_prio(t, (round % 2 == 0).then_some(5)).unwrap(),
                        _ => {
                            s.yield_current(cpu).unwrap();
                        }
                    }
                }

                for t in mine {
                    s.wake_up(t, WakeFlags::empty()).unwrap();
                }
            });
        }
    });

    s.drain_irq_work();
    check(&s);
    assert_eq!(s.tasks().len(), NR_CPUS * 4);
    for t in s.tasks() {
        let info = s.task_info(t).unwrap();
        assert_eq!(info.prio, info.prio.min(info.normal_prio));
    }
}
