//! Adaptive RPC timeout estimation.
//!
//! Observed round-trip times land in a fixed-width histogram. Every 16
//! updates the histogram is snapshotted into a normalised distribution and
//! then decayed, so the estimate tracks current network conditions instead
//! of the whole process lifetime. The stall timeout used by the RPC server
//! is a quantile blend clamped into a configured window.

/// Updates between snapshot/decay passes.
const UPDATES_PER_SNAPSHOT: u32 = 16;

/// Multiplicative decay applied to every bin at snapshot time.
const DECAY_FACTOR: f32 = 0.95;

/// RTT histogram with an adaptive stall-timeout estimate.
#[derive(Debug)]
pub struct TimeoutSampler {
    bin_size: u64,
    timeout_min: u64,
    timeout_max: u64,
    baseline_floor: u64,
    bins: Vec<f32>,
    updates: u32,
    snapshot: Snapshot,
}

/// Frozen view of the histogram used between decay passes.
#[derive(Debug, Clone)]
struct Snapshot {
    bins: Vec<f32>,
    total: f32,
    mean: u64,
    mode: u64,
}

impl Default for TimeoutSampler {
    fn default() -> Self {
        TimeoutSampler::new(50, 0, 10_000, 100)
    }
}

impl TimeoutSampler {
    pub fn new(bin_size: u64, timeout_min: u64, timeout_max: u64, baseline_floor: u64) -> Self {
        assert!(bin_size > 0 && timeout_max > timeout_min);
        let num_bins = ((timeout_max - timeout_min) / bin_size) as usize + 1;

        // Before any samples arrive the estimate must be conservative, so
        // the initial snapshot carries all its mass in the top bin.
        let mut initial = vec![0.0f32; num_bins];
        initial[num_bins - 1] = 1.0;
        let snapshot = Snapshot::from_bins(initial, bin_size, timeout_min);

        TimeoutSampler {
            bin_size,
            timeout_min,
            timeout_max,
            baseline_floor,
            bins: vec![0.0; num_bins],
            updates: 0,
            snapshot,
        }
    }

    /// Record one observed round-trip time in milliseconds.
    pub fn update(&mut self, rtt_ms: u64) {
        let clamped = rtt_ms.clamp(self.timeout_min, self.timeout_max);
        let idx = ((clamped - self.timeout_min) / self.bin_size) as usize;
        let idx = idx.min(self.bins.len() - 1);
        self.bins[idx] += 1.0;

        self.updates += 1;
        if self.updates >= UPDATES_PER_SNAPSHOT {
            self.updates = 0;
            self.snapshot = Snapshot::from_bins(self.bins.clone(), self.bin_size, self.timeout_min);
            for bin in &mut self.bins {
                *bin *= DECAY_FACTOR;
            }
        }
    }

    /// Deadline after which an in-flight call counts as stalled.
    ///
    /// `clamp(max(q10 + baseline_floor, q90), timeout_min, timeout_max)`;
    /// always within the configured window.
    pub fn stall_timeout(&self) -> u64 {
        let q10 = self.snapshot.quantile(0.1, self.bin_size, self.timeout_min);
        let q90 = self.snapshot.quantile(0.9, self.bin_size, self.timeout_min);
        (q10 + self.baseline_floor)
            .max(q90)
            .clamp(self.timeout_min, self.timeout_max)
    }

    /// Mean of the current snapshot distribution.
    pub fn mean(&self) -> u64 {
        self.snapshot.mean
    }

    /// Mode of the current snapshot distribution.
    pub fn mode(&self) -> u64 {
        self.snapshot.mode
    }
}

impl Snapshot {
    fn from_bins(bins: Vec<f32>, bin_size: u64, timeout_min: u64) -> Self {
        let total: f32 = bins.iter().sum();
        let mut mean = 0.0f64;
        let mut mode_idx = 0usize;
        let mut mode_mass = f32::MIN;
        for (i, mass) in bins.iter().enumerate() {
            // Bin centers keep the mean unbiased.
            let center = timeout_min as f64 + (i as f64 + 0.5) * bin_size as f64;
            if total > 0.0 {
                mean += center * (*mass as f64) / total as f64;
            }
            if *mass > mode_mass {
                mode_mass = *mass;
                mode_idx = i;
            }
        }
        Snapshot {
            bins,
            total,
            mean: mean as u64,
            mode: timeout_min + (mode_idx as u64) * bin_size + bin_size / 2,
        }
    }

    /// Upper edge of the bin where the cumulative mass crosses `q`.
    fn quantile(&self, q: f32, bin_size: u64, timeout_min: u64) -> u64 {
        if self.total <= 0.0 {
            return timeout_min;
        }
        let threshold = q * self.total;
        let mut cumulative = 0.0f32;
        for (i, mass) in self.bins.iter().enumerate() {
            cumulative += mass;
            if cumulative >= threshold {
                return timeout_min + (i as u64 + 1) * bin_size;
            }
        }
        timeout_min + self.bins.len() as u64 * bin_size
    }
}
