//! Counter reporting
//!
//! Periodically sums the per-CPU counters, turns the totals into deltas and
//! feeds them to Prometheus and the log.

use crate::ebpf::maps::MapManager;
use parking_lot::RwLock;
use sipsieve_common::metrics::{COUNTER_READ_ERRORS_TOTAL, PACKETS_TOTAL};
use sipsieve_ebpf::{Counter, CounterSnapshot};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Tracks the last observed totals
#[derive(Debug, Default)]
pub struct CounterReporter {
    last: Option<CounterSnapshot>,
}

impl CounterReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `current` and return what changed since the previous call.
    ///
    /// The first observation is reported whole, so exported totals match
    /// the map even when it was pinned by an earlier run.
    pub fn observe(&mut self, current: CounterSnapshot) -> CounterSnapshot {
        let delta = match &self.last {
            Some(last) => current.delta_since(last),
            None => current,
        };
        self.last = Some(current);
        delta
    }

    pub fn last(&self) -> Option<&CounterSnapshot> {
        self.last.as_ref()
    }
}

/// Advance the Prometheus counters by `delta`
pub fn publish(delta: &CounterSnapshot) {
    for (counter, value) in delta.iter() {
        if value > 0 {
            PACKETS_TOTAL
                .with_label_values(&[counter.name()])
                .inc_by(value);
        }
    }
}

/// Spawn the periodic counter reader
pub fn spawn_reporter(
    maps: Arc<RwLock<MapManager>>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut reporter = CounterReporter::new();
        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Counter reporter shutting down");
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let snapshot = maps.read().read_counters();
                    match snapshot {
                        Ok(snapshot) => {
                            let delta = reporter.observe(snapshot);
                            publish(&delta);
                            log_delta(&delta, &snapshot);
                        }
                        Err(e) => {
                            COUNTER_READ_ERRORS_TOTAL.inc();
                            warn!(error = %e, "Failed to read XDP counters");
                        }
                    }
                }
            }
        }
    })
}

fn log_delta(delta: &CounterSnapshot, totals: &CounterSnapshot) {
    if delta.total() == 0 {
        debug!(total = totals.total(), "No SIP traffic classified");
        return;
    }

    info!(
        redirected = delta.get(Counter::Redirected),
        passed = delta.get(Counter::Passed),
        blocked = delta.get(Counter::Blocked),
        options_dropped = delta.get(Counter::OptionsDropped),
        malformed = delta.get(Counter::Malformed),
        total = totals.total(),
        "SIP traffic classified"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use sipsieve_ebpf::CounterSink;

    fn snapshot(pairs: &[(Counter, u64)]) -> CounterSnapshot {
        let mut s = CounterSnapshot::new();
        for (counter, value) in pairs {
            s.add(*counter, *value);
        }
        s
    }

    #[test]
    fn test_first_observation_is_whole() {
        let mut reporter = CounterReporter::new();
        let first = snapshot(&[(Counter::Passed, 5), (Counter::Blocked, 2)]);
        assert_eq!(reporter.observe(first), first);
        assert_eq!(reporter.last(), Some(&first));
    }

    #[test]
    fn test_deltas_between_observations() {
        let mut reporter = CounterReporter::new();
        let mut totals = snapshot(&[(Counter::Passed, 5)]);
        reporter.observe(totals);

        totals.increment(Counter::Passed);
        totals.increment(Counter::Malformed);
        let delta = reporter.observe(totals);
        assert_eq!(delta.get(Counter::Passed), 1);
        assert_eq!(delta.get(Counter::Malformed), 1);
        assert_eq!(delta.total(), 2);

        assert_eq!(reporter.observe(totals).total(), 0);
    }

    #[test]
    fn test_reset_map_reports_post_reset_counts() {
        let mut reporter = CounterReporter::new();
        reporter.observe(snapshot(&[(Counter::Redirected, 100)]));

        let after_reset = snapshot(&[(Counter::Redirected, 3), (Counter::Blocked, 1)]);
        let delta = reporter.observe(after_reset);
        assert_eq!(delta.get(Counter::Redirected), 3);
        assert_eq!(delta.get(Counter::Blocked), 1);

        let mut later = after_reset;
        later.add(Counter::Redirected, 2);
        assert_eq!(reporter.observe(later).get(Counter::Redirected), 2);
    }

    #[test]
    fn test_publish_advances_prometheus() {
        let before = PACKETS_TOTAL
            .with_label_values(&[Counter::OptionsDropped.name()])
            .get();
        publish(&snapshot(&[(Counter::OptionsDropped, 4)]));
        let after = PACKETS_TOTAL
            .with_label_values(&[Counter::OptionsDropped.name()])
            .get();
        assert_eq!(after - before, 4);
    }
}
