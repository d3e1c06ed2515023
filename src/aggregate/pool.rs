use parking_lot::Mutex;

use crate::device::Sample;

/// Raw power samples waiting for aggregation.
#[derive(Debug, Default)]
struct Pools {
    /// Samples since the last minute boundary.
    fine: Vec<f64>,
    /// Raw samples since the last half-hour boundary.
    coarse: Vec<f64>,
}

/// Result of draining the per-minute pool.
#[derive(Debug, Clone, PartialEq)]
pub struct MinuteSummary {
    /// Mean power in W, rounded to 4 decimals. 0 when no samples arrived.
    pub mean_watts: f64,
    pub samples: usize,
    /// The drained samples, in arrival order.
    pub values: Vec<f64>,
}

/// Result of draining the per-half-hour pool.
#[derive(Debug, Clone, PartialEq)]
pub struct HalfHourSummary {
    /// Energy over the half hour in kWh, rounded to 4 decimals.
    pub kwh: f64,
    /// Unrounded mean power in W.
    pub mean_watts: f64,
    pub samples: usize,
    /// The drained samples, in arrival order.
    pub values: Vec<f64>,
}

/// Shared sample pools for the reader and both aggregators.
///
/// Both pools sit behind one mutex so an append can never interleave with
/// a drain. The lock is held only for the in-memory work.
#[derive(Debug, Default)]
pub struct PowerPool {
    inner: Mutex<Pools>,
}

impl PowerPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one sample to the per-minute pool.
    pub fn push(&self, sample: Sample) {
        self.inner.lock().fine.push(sample.power_watts);
    }

    /// Drains the per-minute pool into the half-hour pool.
    ///
    /// The half-hour pool receives the raw samples, not the minute mean.
    pub fn drain_minute(&self) -> MinuteSummary {
        let mut guard = self.inner.lock();
        let pools = &mut *guard;

        let values = pools.fine.clone();
        let mean_watts = round4(mean(&values));
        pools.coarse.extend(pools.fine.drain(..));

        MinuteSummary {
            mean_watts,
            samples: values.len(),
            values,
        }
    }

    /// Drains the half-hour pool and converts its mean power to energy.
    ///
    /// The mean is treated as constant power over the 30 minute window.
    pub fn drain_half_hour(&self) -> HalfHourSummary {
        let values = std::mem::take(&mut self.inner.lock().coarse);
        let mean_watts = mean(&values);

        HalfHourSummary {
            kwh: watts_to_half_hour_kwh(mean_watts),
            mean_watts,
            samples: values.len(),
            values,
        }
    }

    /// Number of samples waiting for the next minute boundary.
    pub fn fine_len(&self) -> usize {
        self.inner.lock().fine.len()
    }

    /// Number of samples waiting for the next half-hour boundary.
    pub fn coarse_len(&self) -> usize {
        self.inner.lock().coarse.len()
    }

    /// Copies of both pools taken under a single lock.
    pub fn snapshot(&self) -> (Vec<f64>, Vec<f64>) {
        let pools = self.inner.lock();
        (pools.fine.clone(), pools.coarse.clone())
    }
}

/// Arithmetic mean, 0 for an empty slice.
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Round to 4 decimal places.
///
/// Rounds the exact binary value, ties to even, so `1095.24885` (stored
/// just below the tie) becomes `1095.2488`.
pub fn round4(value: f64) -> f64 {
    format!("{value:.4}").parse().unwrap_or(value)
}

/// Energy in kWh of `watts` held for half an hour, rounded to 4 decimals.
pub fn watts_to_half_hour_kwh(watts: f64) -> f64 {
    round4(watts / 1000.0 * 0.5)
}
