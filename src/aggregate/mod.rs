pub mod pool;

use std::sync::Arc;

use chrono::NaiveDateTime;
use tracing::{debug, error, info};

use crate::clock::truncate_to_minute;
use crate::record::{AggregateRecord, Emitter, RecordKind};

use self::pool::PowerPool;

/// Turns the per-minute pool into one instantaneous power record.
pub struct MinuteAggregator<E: ?Sized> {
    pool: Arc<PowerPool>,
    emitter: Arc<E>,
}

impl<E: Emitter + ?Sized> MinuteAggregator<E> {
    pub fn new(pool: Arc<PowerPool>, emitter: Arc<E>) -> Self {
        Self { pool, emitter }
    }

    /// Drain the minute pool and emit the mean power stamped at `now`'s minute.
    ///
    /// Emission failures are logged; the drain itself is never undone.
    pub fn aggregate(&self, now: NaiveDateTime) -> AggregateRecord {
        let summary = self.pool.drain_minute();
        debug!(pool = ?summary.values, "minute pool");
        let record = AggregateRecord::new(
            RecordKind::InstantaneousPower,
            truncate_to_minute(now),
            summary.mean_watts,
        );

        info!(
            power_w = summary.mean_watts,
            samples = summary.samples,
            "instantaneous power",
        );
        emit(self.emitter.as_ref(), &record);

        record
    }
}

/// Turns the half-hour pool into one energy record.
pub struct EnergyAggregator<E: ?Sized> {
    pool: Arc<PowerPool>,
    emitter: Arc<E>,
}

impl<E: Emitter + ?Sized> EnergyAggregator<E> {
    pub fn new(pool: Arc<PowerPool>, emitter: Arc<E>) -> Self {
        Self { pool, emitter }
    }

    /// Drain the half-hour pool and emit the energy stamped at `now`'s minute.
    pub fn aggregate(&self, now: NaiveDateTime) -> AggregateRecord {
        let summary = self.pool.drain_half_hour();
        debug!(pool = ?summary.values, "half-hour pool");
        let record = AggregateRecord::new(RecordKind::Energy, truncate_to_minute(now), summary.kwh);

        info!(
            energy_kwh = summary.kwh,
            mean_power_w = summary.mean_watts,
            samples = summary.samples,
            "energy",
        );
        emit(self.emitter.as_ref(), &record);

        record
    }
}

fn emit<E: Emitter + ?Sized>(emitter: &E, record: &AggregateRecord) {
    match emitter.emit(record) {
        Ok(path) => info!(
            emitter = emitter.name(),
            kind = record.kind.as_str(),
            path = %path.display(),
            "record written",
        ),
        Err(e) => error!(
            emitter = emitter.name(),
            kind = record.kind.as_str(),
            error = %e,
            "failed to emit record",
        ),
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::path::PathBuf;

    use chrono::NaiveDate;
    use parking_lot::Mutex;

    use super::*;
    use crate::device::Sample;
    use crate::record::EmitError;

    #[derive(Default)]
    struct MemoryEmitter {
        records: Mutex<Vec<AggregateRecord>>,
        fail: bool,
    }

    impl Emitter for MemoryEmitter {
        fn name(&self) -> &str {
            "memory"
        }

        fn emit(&self, record: &AggregateRecord) -> Result<PathBuf, EmitError> {
            if self.fail {
                return Err(EmitError::Write {
                    path: PathBuf::from("/unwritable"),
                    source: io::Error::from(io::ErrorKind::PermissionDenied),
                });
            }
            self.records.lock().push(record.clone());
            Ok(PathBuf::from(record.file_name()))
        }
    }

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 1)
            .expect("valid date")
            .and_hms_opt(h, m, s)
            .expect("valid time")
    }

    fn push_all(pool: &PowerPool, values: &[f64]) {
        for &power_watts in values {
            pool.push(Sample { power_watts });
        }
    }

    #[test]
    fn test_minute_aggregator_emits_mean() {
        let pool = Arc::new(PowerPool::new());
        let emitter = Arc::new(MemoryEmitter::default());
        let minute = MinuteAggregator::new(Arc::clone(&pool), Arc::clone(&emitter));
        push_all(&pool, &[100.0, 200.0, 300.0]);

        let record = minute.aggregate(at(9, 5, 0));

        assert_eq!(
            record,
            AggregateRecord::new(RecordKind::InstantaneousPower, at(9, 5, 0), 200.0)
        );
        assert_eq!(emitter.records.lock().as_slice(), &[record]);
        assert_eq!(pool.coarse_len(), 3);
    }

    #[test]
    fn test_minute_aggregator_truncates_late_tick() {
        let pool = Arc::new(PowerPool::new());
        let emitter = Arc::new(MemoryEmitter::default());
        let minute = MinuteAggregator::new(pool, emitter);

        let record = minute.aggregate(at(9, 5, 1));

        assert_eq!(record.timestamp, at(9, 5, 0));
        assert_eq!(record.value, 0.0);
    }

    #[test]
    fn test_energy_aggregator_emits_kwh() {
        let pool = Arc::new(PowerPool::new());
        let emitter = Arc::new(MemoryEmitter::default());
        let minute = MinuteAggregator::new(Arc::clone(&pool), Arc::clone(&emitter));
        let energy = EnergyAggregator::new(Arc::clone(&pool), Arc::clone(&emitter));

        for m in 0..30 {
            push_all(&pool, &[200.0; 60]);
            minute.aggregate(at(10, m, 0));
        }
        let record = energy.aggregate(at(10, 30, 0));

        assert_eq!(record.kind, RecordKind::Energy);
        assert_eq!(record.value, 0.1);
        assert_eq!(record.timestamp, at(10, 30, 0));
        assert_eq!(pool.coarse_len(), 0);
        assert_eq!(emitter.records.lock().len(), 31);
    }

    #[test]
    fn test_emit_failure_still_drains() {
        let pool = Arc::new(PowerPool::new());
        let emitter = Arc::new(MemoryEmitter {
            fail: true,
            ..Default::default()
        });
        let minute = MinuteAggregator::new(Arc::clone(&pool), Arc::clone(&emitter));
        let energy = EnergyAggregator::new(Arc::clone(&pool), emitter);
        push_all(&pool, &[50.0, 150.0]);

        assert_eq!(minute.aggregate(at(11, 0, 0)).value, 100.0);
        assert_eq!(pool.fine_len(), 0);

        assert_eq!(energy.aggregate(at(11, 0, 0)).value, 0.05);
        assert_eq!(pool.coarse_len(), 0);
    }

    #[test]
    fn test_aggregators_accept_trait_objects() {
        let pool = Arc::new(PowerPool::new());
        let emitter: Arc<dyn Emitter> = Arc::new(MemoryEmitter::default());
        let minute = MinuteAggregator::new(pool, emitter);

        assert_eq!(minute.aggregate(at(12, 0, 0)).value, 0.0);
    }
}
