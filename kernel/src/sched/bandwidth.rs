//! RT bandwidth control
//!
//! RT tasks on a CPU may consume at most `runtime` of every `period`. When
//! a run-queue exceeds its share it first tries to borrow unused runtime
//! from its peers; failing that it is throttled and the whole RT class
//! leaves the runnable set until the period timer replenishes it.
//!
//! The global [`RtBandwidth`] sits behind the bandwidth lock and every
//! CPU's [`RtRuntime`] behind its own runtime lock. `rt_runtime` fields
//! only change with the bandwidth lock held, so a path holding it may cache
//! its own CPU's value while it visits peers.

use super::rq::Rq;
use super::{SchedFeatures, Scheduler};
use crate::error::{Result, SchedError};
use crate::trace::{self, TraceEvent};
use crate::traits::Platform;
use core::sync::atomic::Ordering;

/// Unlimited runtime.
pub const RUNTIME_INF: u64 = u64::MAX;

/// Default period: 1s.
pub const DEFAULT_RT_PERIOD_US: i64 = 1_000_000;
/// Default runtime: 0.95s.
pub const DEFAULT_RT_RUNTIME_US: i64 = 950_000;

const NSEC_PER_USEC: u64 = 1_000;

/// Global RT period and runtime plus the period timer state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RtBandwidth {
    /// Period in ns
    pub period: u64,
    /// Runtime per period in ns, [`RUNTIME_INF`] when unlimited
    pub runtime: u64,
    /// Period timer armed
    pub period_active: bool,
    /// Next expiry of the period timer, in ns
    pub expires: u64,
}

impl RtBandwidth {
    /// Bandwidth of `runtime_us` per `period_us`; a runtime of -1 means
    /// unlimited.
    pub fn new(period_us: i64, runtime_us: i64) -> Result<Self> {
        let (period, runtime) = Self::validate(period_us, runtime_us)?;
        Ok(Self {
            period,
            runtime,
            period_active: false,
            expires: 0,
        })
    }

    /// Check a period/runtime pair and convert it to ns.
    pub fn validate(period_us: i64, runtime_us: i64) -> Result<(u64, u64)> {
        if period_us <= 0 {
            return Err(SchedError::InvalidPeriod);
        }
        if runtime_us < -1 {
            return Err(SchedError::InvalidRuntime);
        }
        if runtime_us == -1 {
            return Ok((period_us as u64 * NSEC_PER_USEC, RUNTIME_INF));
        }
        if runtime_us > period_us {
            return Err(SchedError::RuntimeExceedsPeriod {
                runtime: runtime_us as u64,
                period: period_us as u64,
            });
        }
        Ok((
            period_us as u64 * NSEC_PER_USEC,
            runtime_us as u64 * NSEC_PER_USEC,
        ))
    }

    /// Throttling is in effect.
    pub fn enabled(&self) -> bool {
        self.runtime != RUNTIME_INF
    }

    /// Move the expiry past `now`, returning the number of whole periods
    /// that elapsed (0 if the timer has not fired yet).
    pub fn forward(&mut self, now: u64) -> u64 {
        if now < self.expires {
            return 0;
        }
        let overrun = (now - self.expires) / self.period + 1;
        self.expires += overrun * self.period;
        overrun
    }
}

/// Per-CPU RT runtime accounting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RtRuntime {
    /// RT time consumed in the current period, ns
    pub rt_time: u64,
    /// Runtime this CPU may consume, including borrowed time
    pub rt_runtime: u64,
    pub rt_throttled: bool,
}

impl RtRuntime {
    pub fn new(rt_runtime: u64) -> Self {
        Self {
            rt_time: 0,
            rt_runtime,
            rt_throttled: false,
        }
    }
}

impl<P: Platform> Scheduler<P> {
    /// Arm the period timer if throttling is enabled and it is idle.
    pub(crate) fn start_rt_bandwidth(&self) {
        let mut b = self.bandwidth.lock();
        if !b.enabled() || b.period_active {
            return;
        }
        b.period_active = true;
        b.expires = self.platform.now() + b.period;
    }

    /// Whether the RT class of `rq` is throttled: out of runtime and not
    /// running a priority-boosted task.
    pub(crate) fn rt_rq_throttled(&self, rq: &Rq) -> bool {
        self.cpus[rq.cpu].runtime.lock().rt_throttled && rq.rt.rt_nr_boosted == 0
    }

    /// Put the RT class back into the runnable set after replenishment.
    pub(crate) fn sched_rt_rq_enqueue(&self, rq: &mut Rq) {
        if rq.rt.rt_nr_running == 0 {
            return;
        }
        self.enqueue_top_rt_rq(rq);
        self.resched_curr(rq);
    }

    /// Take the RT class out of the runnable set.
    pub(crate) fn sched_rt_rq_dequeue(&self, rq: &mut Rq) {
        rq.rt.rt_queued = false;
    }

    /// Recompute whether the RT class counts as runnable on `rq`.
    pub(crate) fn enqueue_top_rt_rq(&self, rq: &mut Rq) {
        rq.rt.rt_queued = rq.rt.rt_nr_running > 0 && !self.rt_rq_throttled(rq);
    }

    /// Borrow runtime if `cpu` has overrun its own share.
    pub(crate) fn balance_runtime(&self, cpu: usize) {
        if !self.features().contains(SchedFeatures::RT_RUNTIME_SHARE) {
            return;
        }
        let overrun = {
            let rt = self.cpus[cpu].runtime.lock();
            rt.rt_time > rt.rt_runtime
        };
        if overrun {
            self.do_balance_runtime(cpu);
        }
    }

    /// Take `1/n` of every peer's spare runtime, never exceeding the period.
    pub(crate) fn do_balance_runtime(&self, cpu: usize) {
        let span = self.root.span();
        let weight = span.weight() as u64;
        if weight == 0 {
            return;
        }

        let b = self.bandwidth.lock();
        let period = b.period;
        let mut mine = self.cpus[cpu].runtime.lock().rt_runtime;
        if mine == RUNTIME_INF {
            return;
        }

        for i in span.iter().filter(|&i| i != cpu) {
            let mut peer = self.cpus[i].runtime.lock();
            // Disabled (offline) CPUs carry infinite runtime and lend nothing.
            if peer.rt_runtime == RUNTIME_INF {
                continue;
            }
            let spare = peer.rt_runtime as i64 - peer.rt_time as i64;
            if spare <= 0 {
                continue;
            }
            let mut diff = spare as u64 / weight;
            if mine + diff > period {
                diff = period.saturating_sub(mine);
            }
            peer.rt_runtime -= diff;
            mine += diff;
            if mine == period {
                break;
            }
        }

        self.cpus[cpu].runtime.lock().rt_runtime = mine;
        drop(b);
        log::trace!(target: "nyx_sched::rt", "cpu{} borrowed runtime, now {}ns", cpu, mine);
    }

    /// Reclaim everything `rq` lent out and exempt it from throttling.
    /// Called when the CPU leaves the root domain.
    pub(crate) fn disable_runtime(&self, rq: &mut Rq) {
        let cpu = rq.cpu;
        {
            let b = self.bandwidth.lock();
            let own = self.cpus[cpu].runtime.lock().rt_runtime;

            if own != RUNTIME_INF && own != b.runtime {
                let mut want = b.runtime as i64 - own as i64;
                for i in self.root.span().iter().filter(|&i| i != cpu) {
                    let mut peer = self.cpus[i].runtime.lock();
                    if peer.rt_runtime == RUNTIME_INF {
                        continue;
                    }
                    if want > 0 {
                        let diff = (peer.rt_runtime as i64).min(want);
                        peer.rt_runtime -= diff as u64;
                        want -= diff;
                    } else {
                        peer.rt_runtime = (peer.rt_runtime as i64 - want) as u64;
                        want = 0;
                    }
                    if want == 0 {
                        break;
                    }
                }
                sched_bug_on!(
                    want != 0,
                    "cpu{}: {}ns of lent rt runtime could not be reclaimed",
                    cpu,
                    want
                );
            }

            let mut rt = self.cpus[cpu].runtime.lock();
            rt.rt_runtime = RUNTIME_INF;
            rt.rt_throttled = false;
        }
        self.sched_rt_rq_enqueue(rq);
    }

    /// Reset the runtime of a CPU joining the root domain.
    pub(crate) fn enable_runtime(&self, rq: &mut Rq) {
        let b = self.bandwidth.lock();
        let mut rt = self.cpus[rq.cpu].runtime.lock();
        rt.rt_runtime = b.runtime;
        rt.rt_time = 0;
        rt.rt_throttled = false;
    }

    /// Account a fresh `rt_time` charge and throttle if the share is used
    /// up. Returns whether the RT class was removed from the runnable set.
    pub(crate) fn sched_rt_runtime_exceeded(&self, rq: &mut Rq) -> bool {
        let cpu = rq.cpu;
        let (period, global_runtime) = {
            let b = self.bandwidth.lock();
            (b.period, b.runtime)
        };

        {
            let rt = self.cpus[cpu].runtime.lock();
            if rt.rt_throttled {
                return rq.rt.rt_nr_boosted == 0;
            }
            if rt.rt_runtime >= period {
                return false;
            }
        }

        self.balance_runtime(cpu);

        let mut rt = self.cpus[cpu].runtime.lock();
        if rt.rt_runtime == RUNTIME_INF || rt.rt_time <= rt.rt_runtime {
            return false;
        }

        // A zero share only accrues time through boosting; forgive it.
        if global_runtime != 0 {
            rt.rt_throttled = true;
            if !self.throttle_warned.swap(true, Ordering::Relaxed) {
                log::warn!(target: "nyx_sched::rt", "RT throttling activated");
            }
            trace::emit(
                &self.platform,
                TraceEvent::RtThrottle {
                    cpu,
                    rt_time: rt.rt_time,
                    runtime: rt.rt_runtime,
                },
            );
        } else {
            rt.rt_time = 0;
        }

        let throttled = rt.rt_throttled && rq.rt.rt_nr_boosted == 0;
        drop(rt);
        if throttled {
            self.sched_rt_rq_dequeue(rq);
        }
        throttled
    }

    /// Replenish every CPU for `overrun` elapsed periods. Returns whether
    /// the timer may stop: nothing throttled and nothing consuming runtime.
    pub(crate) fn do_sched_rt_period_timer(&self, overrun: u64) -> bool {
        let share = self.features().contains(SchedFeatures::RT_RUNTIME_SHARE);
        let global_runtime = self.bandwidth.lock().runtime;
        let mut idle = true;
        let mut throttled = false;

        for cpu in self.root.span().iter() {
            let skip = {
                let b = self.bandwidth.lock();
                let mut rt = self.cpus[cpu].runtime.lock();
                if !share && rt.rt_runtime != RUNTIME_INF {
                    rt.rt_runtime = b.runtime;
                }
                rt.rt_time == 0 && self.cpus[cpu].stat.rt_nr_running() == 0
            };
            if skip {
                continue;
            }

            let mut rq = self.lock_rq(cpu);
            self.update_rq_clock(&mut rq);
            let mut enqueue = false;

            let rt_time = self.cpus[cpu].runtime.lock().rt_time;
            if rt_time > 0 {
                if self.cpus[cpu].runtime.lock().rt_throttled {
                    self.balance_runtime(cpu);
                }
                let mut rt = self.cpus[cpu].runtime.lock();
                let runtime = rt.rt_runtime;
                rt.rt_time -= rt.rt_time.min(overrun.saturating_mul(runtime));
                if rt.rt_throttled && rt.rt_time < runtime {
                    rt.rt_throttled = false;
                    enqueue = true;
                    log::debug!(target: "nyx_sched::rt", "cpu{} unthrottled", cpu);
                }
                if rt.rt_time > 0 || rq.rt.rt_nr_running > 0 {
                    idle = false;
                }
                throttled |= rt.rt_throttled;
            } else if rq.rt.rt_nr_running > 0 {
                idle = false;
                if !self.rt_rq_throttled(&rq) {
                    enqueue = true;
                }
                throttled |= self.cpus[cpu].runtime.lock().rt_throttled;
            }

            if enqueue {
                self.sched_rt_rq_enqueue(&mut rq);
            }
            self.publish(&rq);
        }

        if !throttled && global_runtime == RUNTIME_INF {
            return true;
        }
        idle
    }

    /// Fire the RT period timer if it is due. Returns whether it stays
    /// armed.
    pub fn rt_period_timer(&self) -> bool {
        let now = self.platform.now();
        let overrun = {
            let mut b = self.bandwidth.lock();
            if !b.period_active {
                return false;
            }
            let overrun = b.forward(now);
            if overrun == 0 {
                return true;
            }
            overrun
        };

        let idle = self.do_sched_rt_period_timer(overrun);
        if idle {
            self.bandwidth.lock().period_active = false;
        }
        !idle
    }

    /// Next expiry of the period timer, if armed.
    pub fn rt_period_expires(&self) -> Option<u64> {
        let b = self.bandwidth.lock();
        b.period_active.then_some(b.expires)
    }

    /// Replace the global RT period and runtime. Invalid settings are
    /// rejected and the previous ones kept.
    pub fn set_rt_bandwidth(&self, period_us: i64, runtime_us: i64) -> Result<()> {
        let (period, runtime) = RtBandwidth::validate(period_us, runtime_us)?;
        let mut b = self.bandwidth.lock();
        b.period = period;
        b.runtime = runtime;
        for cpu in self.root.span().iter() {
            self.cpus[cpu].runtime.lock().rt_runtime = runtime;
        }
        log::info!(
            target: "nyx_sched::rt",
            "rt bandwidth set to {}us/{}us",
            runtime_us,
            period_us
        );
        Ok(())
    }

    /// Snapshot of a CPU's runtime accounting.
    pub fn rt_runtime(&self, cpu: usize) -> Result<RtRuntime> {
        self.check_cpu(cpu)?;
        Ok(*self.cpus[cpu].runtime.lock())
    }

    /// Global bandwidth settings.
    pub fn rt_bandwidth(&self) -> RtBandwidth {
        *self.bandwidth.lock()
    }
}
