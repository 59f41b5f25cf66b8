//! Running statistics for packet timing, plus the little timer used all over the threads.
use std::fmt;

/// Mean and standard deviation over everything pushed since the last clear (Welford).
#[derive(Debug, Clone, Default)]
pub struct RunningStat {
    count: u64,
    mean: f64,
    m2: f64,
}

impl RunningStat {
    pub fn new() -> RunningStat {
        RunningStat {
            count: 0,
            mean: 0.0,
            m2: 0.0,
        }
    }
    pub fn clear(&mut self) {
        self.count = 0;
        self.mean = 0.0;
        self.m2 = 0.0;
    }
    pub fn push(&mut self, sample: f64) {
        self.count += 1;
        let delta = sample - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (sample - self.mean);
    }
    pub fn count(&self) -> u64 {
        self.count
    }
    pub fn mean(&self) -> f64 {
        self.mean
    }
    pub fn variance(&self) -> f64 {
        if self.count > 1 {
            self.m2 / (self.count - 1) as f64
        } else {
            0.0
        }
    }
    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }
}

impl fmt::Display for RunningStat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{{ count: {}, mean: {:.3}, sd: {:.3} }}",
            self.count,
            self.mean,
            self.std_dev()
        )
    }
}


/// Fires once interval microseconds have gone by since the last reset
#[derive(Debug, Clone)]
pub struct MicroTimer {
    last_time: u128,
    interval: u128,
}

impl MicroTimer {
    pub fn new(now: u128, interval: u128) -> MicroTimer {
        MicroTimer {
            last_time: now,
            interval,
        }
    }
    pub fn expired(&self, now: u128) -> bool {
        now >= self.last_time + self.interval
    }
    pub fn reset(&mut self, now: u128) {
        self.last_time = now;
    }
    /// move the deadline by one interval without losing the phase
    pub fn advance(&mut self) {
        self.last_time += self.interval;
    }
    pub fn since(&self, now: u128) -> u128 {
        now.saturating_sub(self.last_time)
    }
}
