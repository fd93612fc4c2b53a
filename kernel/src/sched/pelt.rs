//! Per-entity load tracking
//!
//! Geometrically decayed load and utilization averages. Time is split into
//! 1024us periods; a contribution `p` periods old is weighted by `y^p` with
//! `y^32 = 0.5`. Averages saturate at `LOAD_AVG_MAX`.

/// Half-life, in periods.
pub const LOAD_AVG_PERIOD: u64 = 32;
/// Maximum possible decayed sum: `1024 * sum(y^n)`.
pub const LOAD_AVG_MAX: u64 = 47742;

pub const SCHED_CAPACITY_SHIFT: u32 = 10;
pub const SCHED_CAPACITY_SCALE: u64 = 1 << SCHED_CAPACITY_SHIFT;
/// Load weight of a nice-0 entity.
pub const NICE_0_LOAD: u64 = 1024;

/// `y^n * 2^32` for `n` in `0..32`.
const RUNNABLE_AVG_YN_INV: [u32; LOAD_AVG_PERIOD as usize] = [
    0xffffffff, 0xfa83b2da, 0xf5257d14, 0xefe4b99a, 0xeac0c6e6, 0xe5b906e6, 0xe0ccdeeb,
    0xdbfbb796, 0xd744fcc9, 0xd2a81d91, 0xce248c14, 0xc9b9bd85, 0xc5672a10, 0xc12c4cc9,
    0xbd08a39e, 0xb8fbaf46, 0xb504f333, 0xb123f581, 0xad583ee9, 0xa9a15ab4, 0xa5fed6a9,
    0xa2704302, 0x9ef5325f, 0x9b8d39b9, 0x9837f050, 0x94f4efa8, 0x91c3d373, 0x8ea4398a,
    0x8b95c1e3, 0x88980e80, 0x85aac367, 0x82cd8698,
];

/// `val * y^n`.
pub fn decay_load(mut val: u64, n: u64) -> u64 {
    if n > LOAD_AVG_PERIOD * 63 {
        return 0;
    }

    let mut local_n = n;
    if local_n >= LOAD_AVG_PERIOD {
        val >>= local_n / LOAD_AVG_PERIOD;
        local_n %= LOAD_AVG_PERIOD;
    }

    ((val as u128 * RUNNABLE_AVG_YN_INV[local_n as usize] as u128) >> 32) as u64
}

/// Contribution of `periods` full periods split as: the tail `d1` of the
/// last incomplete period, whole periods in between, and the new head `d3`.
fn accumulate_pelt_segments(periods: u64, d1: u64, d3: u64) -> u64 {
    let c1 = decay_load(d1, periods);
    let c2 = LOAD_AVG_MAX
        .saturating_sub(decay_load(LOAD_AVG_MAX, periods))
        .saturating_sub(1024);
    c1 + c2 + d3
}

#[inline]
fn cap_scale(v: u64, scale: u64) -> u64 {
    (v * scale) >> SCHED_CAPACITY_SHIFT
}

/// Decayed load/utilization of an entity or a run-queue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SchedAvg {
    pub last_update_time: u64,
    pub load_sum: u64,
    pub util_sum: u64,
    pub period_contrib: u32,
    pub load_avg: u64,
    pub util_avg: u64,
}

impl SchedAvg {
    /// An average seeded at `util`, as if the entity had always run that
    /// hot.
    pub fn with_util(util: u64) -> Self {
        let mut avg = Self {
            period_contrib: 1023,
            ..Self::default()
        };
        avg.util_avg = util;
        avg.util_sum = util * avg.divider();
        avg
    }

    /// Current divisor turning sums into averages.
    #[inline]
    pub fn divider(&self) -> u64 {
        LOAD_AVG_MAX - 1024 + self.period_contrib as u64
    }

    /// Advance the average to `now` (ns). `weight` is the load weight while
    /// runnable (0 when blocked), `running` whether the entity occupied the
    /// CPU. Returns whether a period boundary was crossed.
    pub fn update(
        &mut self,
        now: u64,
        weight: u64,
        running: bool,
        freq_scale: u64,
        cpu_scale: u64,
    ) -> bool {
        if now < self.last_update_time {
            self.last_update_time = now;
            return false;
        }

        // 1us units
        let delta = (now - self.last_update_time) >> 10;
        if delta == 0 {
            return false;
        }
        self.last_update_time += delta << 10;

        let running = running && weight != 0;
        if self.accumulate_sum(delta, weight, running, freq_scale, cpu_scale) == 0 {
            return false;
        }

        let divider = self.divider();
        self.load_avg = self.load_sum / divider;
        self.util_avg = self.util_sum / divider;
        true
    }

    fn accumulate_sum(
        &mut self,
        delta: u64,
        weight: u64,
        running: bool,
        freq_scale: u64,
        cpu_scale: u64,
    ) -> u64 {
        let mut contrib = delta;
        let mut delta = delta + self.period_contrib as u64;
        let periods = delta / 1024;

        if periods != 0 {
            self.load_sum = decay_load(self.load_sum, periods);
            self.util_sum = decay_load(self.util_sum, periods);

            delta %= 1024;
            contrib = accumulate_pelt_segments(periods, 1024 - self.period_contrib as u64, delta);
        }
        self.period_contrib = delta as u32;

        let contrib = cap_scale(contrib, freq_scale);
        if weight != 0 {
            self.load_sum += weight * contrib;
        }
        if running {
            self.util_sum += contrib * cpu_scale;
        }

        periods
    }

    /// Fold an entity's average into this aggregate.
    pub fn attach(&mut self, se: &mut SchedAvg) {
        se.last_update_time = self.last_update_time;
        self.util_avg += se.util_avg;
        self.util_sum += se.util_sum;
        self.load_avg += se.load_avg;
        self.load_sum += se.load_sum;
    }

    /// Remove an entity's average from this aggregate.
    pub fn detach(&mut self, se: &SchedAvg) {
        self.util_avg = self.util_avg.saturating_sub(se.util_avg);
        self.util_sum = self.util_sum.saturating_sub(se.util_sum);
        self.load_avg = self.load_avg.saturating_sub(se.load_avg);
        self.load_sum = self.load_sum.saturating_sub(se.load_sum);
    }

    /// Subtract contributions of entities that left without the lock.
    pub fn remove(&mut self, util: u64, load: u64) {
        let divider = self.divider();
        self.util_avg = self.util_avg.saturating_sub(util);
        self.util_sum = self.util_sum.saturating_sub(util * divider);
        self.load_avg = self.load_avg.saturating_sub(load);
        self.load_sum = self.load_sum.saturating_sub(load * divider);
    }
}

/// Boost margin: `boost`% of the headroom between `signal` and `capacity`.
pub fn schedtune_margin(capacity: u64, signal: u64, boost: i32) -> i64 {
    if boost == 0 {
        return 0;
    }
    let headroom = capacity as i64 - signal as i64;
    if boost > 0 {
        headroom.max(0) * boost as i64 / 100
    } else {
        -(signal as i64 * (-boost) as i64 / 100)
    }
}

/// `util` plus its boost margin, never negative.
pub fn boosted_util(capacity: u64, util: u64, boost: i32) -> u64 {
    (util as i64 + schedtune_margin(capacity, util, boost)).max(0) as u64
}
