/// Returns timestamp in ns
#[cfg(unix)]
#[inline(never)]
pub fn mono_time_ns() -> u64 {
    use libc::{CLOCK_MONOTONIC, clock_gettime, timespec};
    unsafe {
        let mut ts = timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        clock_gettime(CLOCK_MONOTONIC, &mut ts);
        (ts.tv_sec as u64) * 1_000_000_000 + (ts.tv_nsec as u64)
    }
}

/// Latency sample recorder with percentile reporting.
///
/// Collects nanosecond samples without allocating past the initial
/// reservation, then reports tail percentiles as one CSV row. Call
/// [`Quantiles::sort`] before querying any quantile.
pub struct Quantiles {
    samples: Vec<u64>,
}

impl Quantiles {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            samples: Vec::with_capacity(capacity),
        }
    }

    pub fn record(&mut self, value: u64) {
        self.samples.push(value);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn sort(&mut self) {
        self.samples.sort_unstable();
    }

    pub fn min(&self) -> u64 {
        *self.samples.first().unwrap()
    }

    pub fn max(&self) -> u64 {
        *self.samples.last().unwrap()
    }

    /// Returns the sample at quantile `p`, with `p` in `0.0..=1.0`.
    ///
    /// # Panics
    ///
    /// Panics when no samples were recorded or `p` is out of range.
    pub fn quantile(&self, p: f64) -> u64 {
        let n = self.samples.len();
        assert!(n > 0);
        assert!((0.0..=1.0).contains(&p));
        let idx = ((n - 1) as f64 * p).round() as usize;
        self.samples[idx]
    }

    pub fn print_csv(&self, label: &str) {
        println!("name,n,min,max,0.5,0.9,0.99,0.999,0.9999");
        println!(
            "{},{},{},{},{},{},{},{},{}",
            label,
            self.len(),
            self.min(),
            self.max(),
            self.quantile(0.5),
            self.quantile(0.9),
            self.quantile(0.99),
            self.quantile(0.999),
            self.quantile(0.9999),
        );
    }
}
