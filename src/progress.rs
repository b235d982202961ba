//! Aggregation of per-chunk progress and speed signals.
//!
//! Each chunk stream owns one slot. Progress slots hold normalized `[0,1]`
//! floats and aggregate to their mean; speed slots hold bytes/s samples and
//! aggregate to their sum. Slots attach and detach dynamically (chunks can
//! be added lazily), and a concurrent reader never observes a half-attached
//! slot. Aggregate progress is additionally clamped so observers see a
//! monotonic non-decreasing signal; speed is allowed to jitter.

use crate::reporter::Reporter;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

/// Combines N per-chunk progress fractions into one `[0,1]` mean.
pub struct AggregateProgress {
    slots: RwLock<BTreeMap<u64, f64>>,
    next_id: AtomicU64,
    reporter: Reporter<f64>,
    high_water: Mutex<f64>,
}

impl AggregateProgress {
    pub fn new(reporter: Reporter<f64>) -> Self {
        Self {
            slots: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(0),
            reporter,
            high_water: Mutex::new(0.0),
        }
    }

    /// Adds a child slot starting at 0.0 and returns its handle.
    pub fn attach(&self) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.slots.write().unwrap().insert(id, 0.0);
        id
    }

    pub fn detach(&self, id: u64) {
        self.slots.write().unwrap().remove(&id);
    }

    /// Writes a child's progress and emits the aggregate.
    pub fn set(&self, id: u64, value: f64) {
        let mean = {
            let mut slots = self.slots.write().unwrap();
            if let Some(slot) = slots.get_mut(&id) {
                *slot = value.clamp(0.0, 1.0);
            }
            if slots.is_empty() {
                return;
            }
            slots.values().sum::<f64>() / slots.len() as f64
        };

        // Transient regressions (a slot reset after a retried attempt, a
        // late attach) must not reach observers. Reporting stays under the
        // lock so concurrent emitters cannot reorder into a regression.
        let mut high_water = self.high_water.lock().unwrap();
        if mean > *high_water {
            *high_water = mean;
        }
        self.reporter.report(*high_water);
    }

    /// Terminal emission: exactly 1.0, bypassing the reporter interval.
    pub fn complete(&self) {
        *self.high_water.lock().unwrap() = 1.0;
        self.reporter.force(1.0);
    }
}

/// Sums N per-chunk bytes/s samples into one aggregate rate.
pub struct AggregateSpeed {
    slots: RwLock<BTreeMap<u64, u64>>,
    next_id: AtomicU64,
    reporter: Reporter<u64>,
}

impl AggregateSpeed {
    pub fn new(reporter: Reporter<u64>) -> Self {
        Self {
            slots: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(0),
            reporter,
        }
    }

    pub fn attach(&self) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.slots.write().unwrap().insert(id, 0);
        id
    }

    pub fn detach(&self, id: u64) {
        self.slots.write().unwrap().remove(&id);
        self.emit();
    }

    /// Writes a child's sample and emits the sum.
    pub fn set(&self, id: u64, bytes_per_second: u64) {
        {
            let mut slots = self.slots.write().unwrap();
            if let Some(slot) = slots.get_mut(&id) {
                *slot = bytes_per_second;
            }
        }
        self.emit();
    }

    fn emit(&self) {
        let sum = self.slots.read().unwrap().values().sum::<u64>();
        self.reporter.report(sum);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn progress_collector() -> (Arc<Mutex<Vec<f64>>>, Reporter<f64>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let reporter = Reporter::new(Duration::ZERO, move |v| sink_seen.lock().unwrap().push(v));
        (seen, reporter)
    }

    #[tokio::test]
    async fn mean_over_attached_slots() {
        let (seen, reporter) = progress_collector();
        let aggregate = AggregateProgress::new(reporter);
        let a = aggregate.attach();
        let b = aggregate.attach();

        aggregate.set(a, 1.0);
        assert_eq!(*seen.lock().unwrap().last().unwrap(), 0.5);

        aggregate.set(b, 0.5);
        assert_eq!(*seen.lock().unwrap().last().unwrap(), 0.75);
    }

    #[tokio::test]
    async fn progress_never_regresses() {
        let (seen, reporter) = progress_collector();
        let aggregate = AggregateProgress::new(reporter);
        let a = aggregate.attach();

        aggregate.set(a, 0.8);
        // A retried attempt resets the slot; the emission must hold.
        aggregate.set(a, 0.2);
        let emissions = seen.lock().unwrap().clone();
        assert_eq!(emissions, vec![0.8, 0.8]);

        let mut last = 0.0;
        for value in emissions {
            assert!(value >= last);
            last = value;
        }
    }

    #[tokio::test]
    async fn complete_forces_exactly_one() {
        let (seen, reporter) = progress_collector();
        let aggregate = AggregateProgress::new(reporter);
        let a = aggregate.attach();
        aggregate.set(a, 0.997);
        aggregate.complete();
        assert_eq!(*seen.lock().unwrap().last().unwrap(), 1.0);
    }

    #[tokio::test]
    async fn speed_is_the_sum_of_slots() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let reporter = Reporter::new(Duration::ZERO, move |v| sink_seen.lock().unwrap().push(v));
        let aggregate = AggregateSpeed::new(reporter);

        let a = aggregate.attach();
        let b = aggregate.attach();
        aggregate.set(a, 1000);
        aggregate.set(b, 250);
        assert_eq!(*seen.lock().unwrap().last().unwrap(), 1250);

        aggregate.detach(b);
        assert_eq!(*seen.lock().unwrap().last().unwrap(), 1000);
    }
}
