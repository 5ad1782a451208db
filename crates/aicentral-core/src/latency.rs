use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use aicentral_common::EndpointId;

const DEFAULT_ALPHA: f64 = 0.3;

/// A per-endpoint exponentially-weighted moving average, updated lock-free.
/// The mantissa lives in one `AtomicU64` (the `f64` bit pattern); the
/// sample count lives alongside it so `sample()` can distinguish "never
/// observed" from "observed and currently zero".
struct LatencyCell {
    ewma_bits: AtomicU64,
    samples: AtomicU32,
}

impl LatencyCell {
    fn new() -> Self {
        Self {
            ewma_bits: AtomicU64::new(0.0f64.to_bits()),
            samples: AtomicU32::new(0),
        }
    }

    fn record(&self, observed: Duration, alpha: f64) {
        let value = observed.as_secs_f64();
        loop {
            let old_bits = self.ewma_bits.load(Ordering::Acquire);
            let old_count = self.samples.load(Ordering::Acquire);
            let new_value = if old_count == 0 {
                value
            } else {
                alpha * value + (1.0 - alpha) * f64::from_bits(old_bits)
            };
            if self
                .ewma_bits
                .compare_exchange(
                    old_bits,
                    new_value.to_bits(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                if old_count == 0 {
                    self.samples.store(1, Ordering::Release);
                } else {
                    self.samples.fetch_add(1, Ordering::AcqRel);
                }
                return;
            }
        }
    }

    fn sample(&self) -> Option<Duration> {
        if self.samples.load(Ordering::Acquire) == 0 {
            None
        } else {
            let bits = self.ewma_bits.load(Ordering::Acquire);
            Some(Duration::from_secs_f64(f64::from_bits(bits)))
        }
    }
}

/// Holds one EWMA cell per endpoint. The endpoint set is fixed at build
/// time (process-lifetime, immutable), so this map never grows after
/// construction and needs no lock on the hot path.
pub struct LatencyTracker {
    alpha: f64,
    cells: HashMap<EndpointId, LatencyCell>,
}

impl LatencyTracker {
    pub fn new(endpoint_ids: impl IntoIterator<Item = EndpointId>) -> Self {
        Self::with_alpha(endpoint_ids, DEFAULT_ALPHA)
    }

    pub fn with_alpha(endpoint_ids: impl IntoIterator<Item = EndpointId>, alpha: f64) -> Self {
        let cells = endpoint_ids
            .into_iter()
            .map(|id| (id, LatencyCell::new()))
            .collect();
        Self { alpha, cells }
    }

    /// `None` means no sample yet — selectors treat that as "prefer to
    /// probe this endpoint".
    pub fn sample(&self, endpoint_id: &EndpointId) -> Option<Duration> {
        self.cells.get(endpoint_id).and_then(LatencyCell::sample)
    }

    pub fn record(&self, endpoint_id: &EndpointId, observed: Duration) {
        if let Some(cell) = self.cells.get(endpoint_id) {
            cell.record(observed, self.alpha);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsampled_endpoint_returns_none() {
        let tracker = LatencyTracker::new([EndpointId::from("a")]);
        assert!(tracker.sample(&EndpointId::from("a")).is_none());
    }

    #[test]
    fn ewma_converges_toward_repeated_samples() {
        let tracker = LatencyTracker::new([EndpointId::from("a")]);
        let id = EndpointId::from("a");
        for _ in 0..50 {
            tracker.record(&id, Duration::from_millis(100));
        }
        let sample = tracker.sample(&id).unwrap();
        assert!((sample.as_secs_f64() - 0.1).abs() < 0.001);
    }

    #[test]
    fn unknown_endpoint_record_is_a_noop() {
        let tracker = LatencyTracker::new([EndpointId::from("a")]);
        tracker.record(&EndpointId::from("missing"), Duration::from_millis(10));
    }
}
