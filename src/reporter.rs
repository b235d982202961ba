//! Throttled value dispatch.
//!
//! Observers are not interested in every byte-level update, and emitting
//! thousands of callbacks per second drowns a UI thread. The reporter
//! coalesces updates: the latest value wins, and consecutive dispatches are
//! at least `interval` apart. Observers always receive the value current at
//! dispatch time, not the value present when `report` was called.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

struct ReporterState<T> {
    latest: Option<T>,
    last_dispatch: Option<Instant>,
    /// A delayed dispatch task is already scheduled.
    pending: bool,
}

struct ReporterInner<T> {
    interval: Duration,
    sink: Box<dyn Fn(T) + Send + Sync>,
    state: Mutex<ReporterState<T>>,
}

/// Coalescing latest-wins dispatcher with a minimum interval between
/// notifications. Cheap to clone and share across tasks.
pub struct Reporter<T> {
    inner: Arc<ReporterInner<T>>,
}

impl<T> Clone for Reporter<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> Reporter<T> {
    /// `interval` of zero dispatches every report inline.
    pub fn new(interval: Duration, sink: impl Fn(T) + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(ReporterInner {
                interval,
                sink: Box::new(sink),
                state: Mutex::new(ReporterState {
                    latest: None,
                    last_dispatch: None,
                    pending: false,
                }),
            }),
        }
    }

    /// Stores `value` as the latest observation and dispatches it now or at
    /// the end of the current interval, whichever the contract allows.
    ///
    /// Delayed dispatches run on the tokio runtime the reporter is used
    /// under, which acts as its captured dispatch context.
    pub fn report(&self, value: T) {
        let inline = {
            let mut state = self.inner.state.lock().unwrap();
            state.latest = Some(value);

            if state.pending {
                // The scheduled dispatch will pick the new value up.
                None
            } else {
                let elapsed = state.last_dispatch.map(|t| t.elapsed());
                match elapsed {
                    Some(e) if e < self.inner.interval => {
                        state.pending = true;
                        let delay = self.inner.interval - e;
                        let inner = Arc::clone(&self.inner);
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            let value = {
                                let mut state = inner.state.lock().unwrap();
                                state.pending = false;
                                state.last_dispatch = Some(Instant::now());
                                state.latest.take()
                            };
                            if let Some(value) = value {
                                (inner.sink)(value);
                            }
                        });
                        None
                    }
                    _ => {
                        state.last_dispatch = Some(Instant::now());
                        state.latest.take()
                    }
                }
            }
        };

        if let Some(value) = inline {
            (self.inner.sink)(value);
        }
    }

    /// Dispatches `value` immediately, bypassing the interval. Used for
    /// terminal emissions that must not be coalesced away.
    pub fn force(&self, value: T) {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.latest = None;
            state.last_dispatch = Some(Instant::now());
        }
        (self.inner.sink)(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collector() -> (Arc<Mutex<Vec<u64>>>, impl Fn(u64) + Send + Sync) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        (seen, move |v| sink_seen.lock().unwrap().push(v))
    }

    #[tokio::test]
    async fn zero_interval_dispatches_inline() {
        let (seen, sink) = collector();
        let reporter = Reporter::new(Duration::ZERO, sink);
        for v in 1..=5 {
            reporter.report(v);
        }
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn rapid_reports_coalesce_to_the_latest() {
        let (seen, sink) = collector();
        let reporter = Reporter::new(Duration::from_millis(50), sink);

        for v in 1..=10 {
            reporter.report(v);
        }
        tokio::time::sleep(Duration::from_millis(120)).await;

        let seen = seen.lock().unwrap();
        // First value goes out inline, the burst collapses into one
        // delayed dispatch carrying the last value.
        assert_eq!(seen.first(), Some(&1));
        assert_eq!(seen.last(), Some(&10));
        assert!(seen.len() <= 3, "got {:?}", seen);
    }

    #[tokio::test]
    async fn force_bypasses_the_interval() {
        let (seen, sink) = collector();
        let reporter = Reporter::new(Duration::from_secs(60), sink);

        reporter.report(1);
        reporter.report(2); // would wait a minute
        reporter.force(99);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.first(), Some(&1));
        assert_eq!(seen.last(), Some(&99));
    }
}
