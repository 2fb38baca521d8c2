use crate::{DriftFlag, SyncedRecord, WaveformRecord};
use log::{debug, warn};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSettings {
    /// Nominal time between consecutive trigger counter values.
    pub trigger_interval: Duration,
    /// Largest |host - predicted| accepted before re-anchoring.
    pub drift_tolerance: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub synchronized: u64,
    pub re_anchors: u64,
    pub out_of_order: u64,
    /// Largest absolute drift seen, ns.
    pub max_drift_ns: i64,
}

#[derive(Debug, Clone, Copy)]
struct Anchor {
    counter: u64,
    host_ns: i64,
}

/// Maps device trigger counters onto host wall-clock time.
///
/// The first record anchors the device counter to its host arrival time.
/// Every later record is placed at `anchor + Δcounter × interval`; when
/// that prediction disagrees with the host arrival time by more than the
/// tolerance the anchor moves to the offending record.
#[derive(Debug)]
pub struct Synchronizer {
    settings: SyncSettings,
    anchor: Option<Anchor>,
    last_counter: u64,
    last_timestamp_ns: i64,
    stats: SyncStats,
}

impl Synchronizer {
    pub fn new(settings: SyncSettings) -> Self {
        Self {
            settings,
            anchor: None,
            last_counter: 0,
            last_timestamp_ns: i64::MIN,
            stats: SyncStats::default(),
        }
    }

    pub fn stats(&self) -> SyncStats {
        self.stats
    }

    pub fn synchronize(&mut self, record: WaveformRecord) -> SyncedRecord {
        self.stats.synchronized += 1;
        let counter = record.trigger_counter;
        let host_ns = record.host_time_ns;

        let Some(anchor) = self.anchor else {
            self.anchor = Some(Anchor { counter, host_ns });
            return self.emit(record, host_ns, DriftFlag::Locked);
        };

        if counter < self.last_counter {
            self.stats.out_of_order += 1;
            warn!(
                "Trigger counter went back from {} to {} (event {})",
                self.last_counter, counter, record.event_id
            );
            return SyncedRecord {
                record,
                timestamp_ns: host_ns,
                drift: DriftFlag::OutOfOrder,
            };
        }

        let elapsed = (counter - anchor.counter) as i128
            * self.settings.trigger_interval.as_nanos() as i128;
        let predicted = (anchor.host_ns as i128 + elapsed)
            .clamp(i64::MIN as i128, i64::MAX as i128) as i64;
        let drift = host_ns.saturating_sub(predicted);
        self.stats.max_drift_ns = self.stats.max_drift_ns.max(drift.saturating_abs());

        if drift.unsigned_abs() as u128 > self.settings.drift_tolerance.as_nanos() {
            self.stats.re_anchors += 1;
            debug!(
                "Re-anchoring at counter {} after {} ns of drift",
                counter, drift
            );
            self.anchor = Some(Anchor { counter, host_ns });
            self.emit(record, host_ns, DriftFlag::ReAnchored)
        } else {
            self.emit(record, predicted, DriftFlag::Locked)
        }
    }

    fn emit(
        &mut self,
        record: WaveformRecord,
        timestamp_ns: i64,
        drift: DriftFlag,
    ) -> SyncedRecord {
        let timestamp_ns = timestamp_ns.max(self.last_timestamp_ns);
        self.last_timestamp_ns = timestamp_ns;
        self.last_counter = record.trigger_counter;
        SyncedRecord {
            record,
            timestamp_ns,
            drift,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    const MS: i64 = 1_000_000;

    fn settings() -> SyncSettings {
        SyncSettings {
            trigger_interval: Duration::from_millis(10),
            drift_tolerance: Duration::from_millis(5),
        }
    }

    fn record(event_id: u64, counter: u64, host_ns: i64) -> WaveformRecord {
        WaveformRecord {
            event_id,
            trigger_counter: counter,
            device_time_ns: 0,
            host_time_ns: host_ns,
            stop_cell: 0,
            channels: vec![0],
            time_ns: Array2::zeros((1, 1)),
            amplitude_mv: Array2::zeros((1, 1)),
        }
    }

    #[test]
    fn follows_counter_within_tolerance() {
        let mut sync = Synchronizer::new(settings());
        let t0 = 1_700_000_000_000 * MS;
        let first = sync.synchronize(record(0, 100, t0));
        assert_eq!(first.timestamp_ns, t0);
        assert_eq!(first.drift, DriftFlag::Locked);

        // host arrives 2 ms late: within tolerance, the counter wins
        let second = sync.synchronize(record(1, 103, t0 + 32 * MS));
        assert_eq!(second.timestamp_ns, t0 + 30 * MS);
        assert_eq!(second.drift, DriftFlag::Locked);
        assert_eq!(sync.stats().max_drift_ns, 2 * MS);
    }

    #[test]
    fn re_anchors_on_step_drift() {
        let mut sync = Synchronizer::new(settings());
        let t0 = 0;
        for i in 0..10 {
            sync.synchronize(record(i, i, t0 + i as i64 * 10 * MS));
        }
        let jumped = sync.synchronize(record(10, 10, t0 + 150 * MS));
        assert_eq!(jumped.drift, DriftFlag::ReAnchored);
        assert_eq!(jumped.timestamp_ns, 150 * MS);

        let after = sync.synchronize(record(11, 11, t0 + 160 * MS));
        assert_eq!(after.drift, DriftFlag::Locked);
        assert_eq!(after.timestamp_ns, 160 * MS);
        assert_eq!(sync.stats().re_anchors, 1);
    }

    #[test]
    fn never_steps_backwards_after_negative_drift() {
        let mut sync = Synchronizer::new(settings());
        sync.synchronize(record(0, 0, 0));
        let a = sync.synchronize(record(1, 5, 50 * MS));
        // host clock stepped back by 40 ms
        let b = sync.synchronize(record(2, 6, 20 * MS));
        assert_eq!(b.drift, DriftFlag::ReAnchored);
        assert!(b.timestamp_ns >= a.timestamp_ns);
    }

    #[test]
    fn counter_regression_passes_through() {
        let mut sync = Synchronizer::new(settings());
        sync.synchronize(record(0, 10, 0));
        sync.synchronize(record(1, 11, 10 * MS));
        let odd = sync.synchronize(record(2, 4, 20 * MS));
        assert_eq!(odd.drift, DriftFlag::OutOfOrder);
        assert_eq!(odd.timestamp_ns, 20 * MS);
        assert_eq!(odd.record.trigger_counter, 4);

        // the anchor is untouched, so the stream picks up where it was
        let next = sync.synchronize(record(3, 12, 20 * MS));
        assert_eq!(next.drift, DriftFlag::Locked);
        assert_eq!(next.timestamp_ns, 20 * MS);
        assert_eq!(sync.stats().out_of_order, 1);
    }
}
