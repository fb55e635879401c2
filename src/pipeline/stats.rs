use chrono::{DateTime, Local, Timelike};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::StatsConfig;
use super::queue::HandoffQueue;
use super::record::NormalizedMetricRecord;

/// Counters for one reporting interval.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IntervalStats {
    pub records: u64,
    pub metric_names: HashSet<String>,
    pub resource_ids: HashSet<String>,
    pub max_latency_ms: i64,
}

impl IntervalStats {
    pub fn observe(&mut self, record: &NormalizedMetricRecord, latency_ms: i64) {
        self.records += 1;
        if latency_ms > self.max_latency_ms {
            self.max_latency_ms = latency_ms;
        }
        if !self.metric_names.contains(&record.metric_name) {
            self.metric_names.insert(record.metric_name.clone());
        }
        if !self.resource_ids.contains(&record.resource_id) {
            self.resource_ids.insert(record.resource_id.clone());
        }
    }
}

/// Shared handle: the ingest loop records, the reporter snapshots.
#[derive(Debug, Clone, Default)]
pub struct StatsRecorder {
    inner: Arc<Mutex<IntervalStats>>,
}

impl StatsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, record: &NormalizedMetricRecord, latency_ms: i64) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .observe(record, latency_ms);
    }

    /// Copies the current counters out and resets them in one lock.
    pub fn snapshot_and_reset(&self) -> IntervalStats {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *guard)
    }
}

/// Delay from `now` until the next wall-clock minute boundary divisible by
/// `interval_minutes`, so reports land on :00/:05/:10 rather than drifting.
pub fn delay_to_next_boundary<Tz: chrono::TimeZone>(
    now: &DateTime<Tz>,
    interval_minutes: u32,
) -> Duration {
    let interval_secs = u64::from(interval_minutes.max(1)) * 60;
    let into_cycle = u64::from(now.minute() % interval_minutes.max(1)) * 60 + u64::from(now.second());
    let remaining = Duration::from_secs(interval_secs - into_cycle);
    remaining.saturating_sub(Duration::from_nanos(u64::from(now.nanosecond() % 1_000_000_000)))
}

pub struct StatsReporter {
    config: StatsConfig,
    recorder: StatsRecorder,
    queue: Arc<HandoffQueue<NormalizedMetricRecord>>,
    batch_gauge: Option<Arc<AtomicUsize>>,
}

impl StatsReporter {
    pub fn new(
        config: StatsConfig,
        recorder: StatsRecorder,
        queue: Arc<HandoffQueue<NormalizedMetricRecord>>,
        batch_gauge: Option<Arc<AtomicUsize>>,
    ) -> Self {
        Self {
            config,
            recorder,
            queue,
            batch_gauge,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let first = delay_to_next_boundary(&Local::now(), self.config.interval_minutes);
        info!(
            "Starting statistics reporter, {} seconds to next interval",
            first.as_secs()
        );

        let mut ticker = interval_at(Instant::now() + first, self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Statistics reporter stopping");
                    break;
                }
                _ = ticker.tick() => {
                    self.report();
                }
            }
        }
    }

    pub fn report(&self) -> IntervalStats {
        let stats = self.recorder.snapshot_and_reset();
        let depth = self.queue.len();
        metrics::gauge!("mediator_queue_depth").set(depth as f64);

        info!(
            "==== INTERVAL STATISTICS FOR {} ====",
            Local::now().format("%Y-%m-%d %H:%M:%S")
        );
        if self.config.log_unique_indicators {
            debug!("Unique indicators seen during interval: {:?}", stats.metric_names);
        }
        if self.config.log_unique_resources {
            debug!("Unique resources seen during interval: {:?}", stats.resource_ids);
        }
        info!(
            "Longest source latency for interval is: {:.3} seconds",
            stats.max_latency_ms as f64 / 1000.0
        );
        info!("Number of metrics consumed: {}", stats.records);
        info!("Number of unique metric indicators: {}", stats.metric_names.len());
        info!("Number of unique resources: {}", stats.resource_ids.len());
        info!(
            "Publisher queue length: {} of {} (dropped since start: {})",
            depth,
            self.queue.capacity(),
            self.queue.dropped()
        );
        if let Some(gauge) = &self.batch_gauge {
            info!("Size of in-flight batch: {}", gauge.load(Ordering::Relaxed));
        }

        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OverflowPolicy;
    use crate::pipeline::record::sample_record;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_observe_tracks_max_and_distinct() {
        let recorder = StatsRecorder::new();
        recorder.record(&sample_record("a", "n1"), 100);
        recorder.record(&sample_record("a", "n2"), 500);
        recorder.record(&sample_record("b", "n1"), 200);

        let stats = recorder.snapshot_and_reset();
        assert_eq!(stats.records, 3);
        assert_eq!(stats.max_latency_ms, 500);
        assert_eq!(stats.metric_names.len(), 2);
        assert_eq!(stats.resource_ids.len(), 2);
    }

    #[test]
    fn test_reset_clears_everything() {
        let recorder = StatsRecorder::new();
        recorder.record(&sample_record("a", "n1"), 9_000);

        let queue = Arc::new(HandoffQueue::new(8, OverflowPolicy::Block));
        let reporter = StatsReporter::new(StatsConfig::default(), recorder.clone(), queue, None);
        let reported = reporter.report();
        assert_eq!(reported.records, 1);

        let after = recorder.snapshot_and_reset();
        assert_eq!(after, IntervalStats::default());
        assert!(after.metric_names.is_empty());
        assert!(after.resource_ids.is_empty());
        assert_eq!(after.max_latency_ms, 0);
    }

    #[test]
    fn test_delay_to_next_boundary() {
        let at = |m, s| Utc.with_ymd_and_hms(2024, 1, 1, 10, m, s).unwrap();

        assert_eq!(delay_to_next_boundary(&at(0, 0), 5), Duration::from_secs(300));
        assert_eq!(delay_to_next_boundary(&at(3, 30), 5), Duration::from_secs(90));
        assert_eq!(delay_to_next_boundary(&at(4, 59), 5), Duration::from_secs(1));
        assert_eq!(delay_to_next_boundary(&at(7, 0), 5), Duration::from_secs(180));
        assert_eq!(delay_to_next_boundary(&at(59, 10), 1), Duration::from_secs(50));
        assert_eq!(delay_to_next_boundary(&at(14, 0), 15), Duration::from_secs(60));
    }
}
