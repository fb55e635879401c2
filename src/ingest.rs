use chrono::Utc;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::kafka::{EventSource, SourcePoll};
use crate::lifecycle::ConfigSlot;
use crate::pipeline::queue::QueueClosed;
use crate::pipeline::{
    Decoder, HandoffQueue, NormalizedMetricRecord, RawEvent, StatsRecorder, TranslationRules,
    Translator,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestState {
    Polling,
    Processing,
    Draining,
    Stopped,
}

/// Why the loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestExit {
    Shutdown,
    /// Too many consecutive bus errors; the process should stop non-zero.
    CircuitOpen,
    QueueClosed,
}

pub struct IngestLoop<E> {
    source: E,
    decoder: Decoder,
    translator: Translator,
    tenant_id: String,
    queue: Arc<HandoffQueue<NormalizedMetricRecord>>,
    stats: StatsRecorder,
    settings: Arc<ConfigSlot>,
    generation: u64,
    state: IngestState,
    poll_timeout: Duration,
    commit_interval: Duration,
    max_consecutive_errors: u32,
}

impl<E: EventSource> IngestLoop<E> {
    pub fn new(
        source: E,
        decoder: Decoder,
        tenant_id: String,
        queue: Arc<HandoffQueue<NormalizedMetricRecord>>,
        stats: StatsRecorder,
        settings: Arc<ConfigSlot>,
    ) -> Self {
        let config = settings.load();
        let generation = settings.generation();
        let translator = Translator::new(TranslationRules::from_config(&config, tenant_id.clone()));

        Self {
            source,
            decoder,
            translator,
            tenant_id,
            queue,
            stats,
            settings,
            generation,
            state: IngestState::Polling,
            poll_timeout: config.source.poll_timeout(),
            commit_interval: config.source.commit_interval(),
            max_consecutive_errors: config.source.max_consecutive_errors,
        }
    }

    pub fn state(&self) -> IngestState {
        self.state
    }

    pub async fn run(&mut self, shutdown: CancellationToken) -> IngestExit {
        info!("Consuming metrics from the source bus");
        let mut last_commit = Instant::now();
        let mut error_streak: u32 = 0;

        let exit = loop {
            if shutdown.is_cancelled() {
                break IngestExit::Shutdown;
            }
            self.refresh_settings();

            self.state = IngestState::Polling;
            match self.source.poll(self.poll_timeout).await {
                SourcePoll::Message(raw) => {
                    error_streak = 0;
                    self.state = IngestState::Processing;
                    if let Err(QueueClosed(_)) = self.process(raw).await {
                        warn!("Handoff queue closed, stopping ingestion");
                        break IngestExit::QueueClosed;
                    }
                }
                SourcePoll::Timeout => error_streak = 0,
                SourcePoll::EndOfPartition(partition) => {
                    error_streak = 0;
                    debug!("Reached end of partition {}", partition);
                }
                SourcePoll::Error(e) => {
                    error_streak += 1;
                    error!("Source bus error: {}", e);
                    if self.max_consecutive_errors > 0 && error_streak >= self.max_consecutive_errors {
                        error!(
                            "{} consecutive source bus errors, giving up",
                            error_streak
                        );
                        break IngestExit::CircuitOpen;
                    }
                }
            }

            if last_commit.elapsed() >= self.commit_interval {
                self.commit();
                last_commit = Instant::now();
            }
        };

        self.drain();
        exit
    }

    /// Rebuilds the translator when the settings slot has moved on.
    fn refresh_settings(&mut self) {
        let generation = self.settings.generation();
        if generation == self.generation {
            return;
        }

        let config = self.settings.load();
        self.translator = Translator::new(TranslationRules::from_config(
            &config,
            self.tenant_id.clone(),
        ));
        self.max_consecutive_errors = config.source.max_consecutive_errors;
        self.generation = generation;
        info!("Ingest loop picked up configuration generation {}", generation);
    }

    async fn process(&mut self, raw: RawEvent) -> Result<(), QueueClosed<NormalizedMetricRecord>> {
        let event = match self.decoder.decode(&raw) {
            Ok(event) => event,
            Err(e) => {
                metrics::counter!("mediator_decode_errors_total").increment(1);
                warn!(
                    "Dropping undecodable message ({} bytes, broker time {}): {}",
                    raw.payload.len(),
                    raw.broker_time(),
                    e
                );
                return Ok(());
            }
        };

        let Some(record) = self.translator.translate(&event) else {
            metrics::counter!("mediator_translate_rejects_total").increment(1);
            return Ok(());
        };

        let latency_ms = Utc::now().timestamp_millis() - record.timestamp_millis;
        self.stats.record(&record, latency_ms);

        self.queue.push(record).await?;
        metrics::counter!("mediator_records_enqueued_total").increment(1);
        Ok(())
    }

    fn commit(&mut self) {
        if let Err(e) = self.source.commit() {
            // Nothing consumed yet is reported as an error by the client.
            debug!("Offset commit skipped: {}", e);
        }
    }

    fn drain(&mut self) {
        self.state = IngestState::Draining;
        info!("Draining ingest loop");
        self.commit();
        self.queue.close();

        self.state = IngestState::Stopped;
        self.source.close();
        if let Err(e) = std::io::stdout().flush() {
            debug!("Failed to flush stdout: {}", e);
        }
        info!("Ingest loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, OverflowPolicy, WireFormat};
    use crate::error::BusError;
    use crate::lifecycle::tests::JSON_PI_TOML;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Replays a script of poll results, then requests shutdown.
    struct ScriptedSource {
        script: VecDeque<SourcePoll>,
        shutdown: CancellationToken,
        commits: Arc<AtomicUsize>,
        closed: Arc<AtomicBool>,
    }

    impl ScriptedSource {
        fn new(script: Vec<SourcePoll>, shutdown: CancellationToken) -> Self {
            Self {
                script: script.into(),
                shutdown,
                commits: Arc::new(AtomicUsize::new(0)),
                closed: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    #[async_trait]
    impl EventSource for ScriptedSource {
        async fn poll(&mut self, _timeout: Duration) -> SourcePoll {
            match self.script.pop_front() {
                Some(next) => next,
                None => {
                    self.shutdown.cancel();
                    SourcePoll::Timeout
                }
            }
        }

        fn commit(&mut self) -> Result<(), BusError> {
            self.commits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn message(indicator: &str) -> SourcePoll {
        let payload = json!({
            "deviceName": "router1",
            "objectName": "eth0",
            "indicatorName": indicator,
            "value": 3,
            "time": Utc::now().timestamp()
        });
        SourcePoll::Message(RawEvent::new(payload.to_string().into_bytes(), WireFormat::Json))
    }

    fn settings() -> Arc<ConfigSlot> {
        Arc::new(ConfigSlot::new(
            Config::from_toml_str(JSON_PI_TOML).unwrap(),
            "mediator.toml",
        ))
    }

    fn ingest(
        source: ScriptedSource,
        queue: Arc<HandoffQueue<NormalizedMetricRecord>>,
        stats: StatsRecorder,
        settings: Arc<ConfigSlot>,
    ) -> IngestLoop<ScriptedSource> {
        IngestLoop::new(source, Decoder::Json, "tenant".to_string(), queue, stats, settings)
    }

    #[tokio::test]
    async fn test_valid_messages_are_enqueued_in_order() {
        let shutdown = CancellationToken::new();
        let source = ScriptedSource::new(
            vec![
                message("ifInOctets"),
                SourcePoll::EndOfPartition(0),
                SourcePoll::Message(RawEvent::new(b"not json".to_vec(), WireFormat::Json)),
                message("ifOutOctets"),
            ],
            shutdown.clone(),
        );
        let commits = source.commits.clone();
        let closed = source.closed.clone();
        let queue = Arc::new(HandoffQueue::new(16, OverflowPolicy::Block));
        let stats = StatsRecorder::new();

        let mut ingest = ingest(source, queue.clone(), stats.clone(), settings());
        let exit = ingest.run(shutdown).await;

        assert_eq!(exit, IngestExit::Shutdown);
        assert_eq!(ingest.state(), IngestState::Stopped);
        assert!(queue.is_closed());
        assert_eq!(queue.try_pop().unwrap().metric_name, "ifInOctets");
        assert_eq!(queue.try_pop().unwrap().metric_name, "ifOutOctets");
        assert!(queue.try_pop().is_none());
        assert!(commits.load(Ordering::SeqCst) >= 1);
        assert!(closed.load(Ordering::SeqCst));

        let snapshot = stats.snapshot_and_reset();
        assert_eq!(snapshot.records, 2);
        assert_eq!(snapshot.resource_ids.len(), 1);
    }

    #[tokio::test]
    async fn test_consecutive_errors_open_circuit() {
        let shutdown = CancellationToken::new();
        let mut slot_config = Config::from_toml_str(JSON_PI_TOML).unwrap();
        slot_config.source.max_consecutive_errors = 3;
        let settings = Arc::new(ConfigSlot::new(slot_config, "mediator.toml"));

        let script = vec![
            SourcePoll::Error("broker down".to_string()),
            SourcePoll::Error("broker down".to_string()),
            SourcePoll::Timeout,
            SourcePoll::Error("broker down".to_string()),
            SourcePoll::Error("broker down".to_string()),
            SourcePoll::Error("broker down".to_string()),
            message("never reached"),
        ];
        let source = ScriptedSource::new(script, shutdown.clone());
        let closed = source.closed.clone();
        let queue = Arc::new(HandoffQueue::new(16, OverflowPolicy::Block));

        let mut ingest = ingest(source, queue.clone(), StatsRecorder::new(), settings);
        let exit = ingest.run(shutdown.clone()).await;

        assert_eq!(exit, IngestExit::CircuitOpen);
        assert_eq!(ingest.state(), IngestState::Stopped);
        assert!(!shutdown.is_cancelled());
        assert!(queue.is_closed());
        assert!(queue.is_empty());
        assert!(closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_closed_queue_stops_ingestion() {
        let shutdown = CancellationToken::new();
        let source = ScriptedSource::new(vec![message("ifInOctets")], shutdown.clone());
        let queue = Arc::new(HandoffQueue::new(16, OverflowPolicy::Block));
        queue.close();

        let mut ingest = ingest(source, queue, StatsRecorder::new(), settings());
        assert_eq!(ingest.state(), IngestState::Polling);

        let exit = ingest.run(shutdown).await;
        assert_eq!(exit, IngestExit::QueueClosed);
        assert_eq!(ingest.state(), IngestState::Stopped);
    }

    #[tokio::test]
    async fn test_reload_rebuilds_translator() {
        let shutdown = CancellationToken::new();
        let settings = settings();
        let source = ScriptedSource::new(vec![message("ifInOctets")], shutdown.clone());
        let queue = Arc::new(HandoffQueue::new(16, OverflowPolicy::Block));
        let mut ingest = ingest(source, queue.clone(), StatsRecorder::new(), settings.clone());

        let mut reloaded = Config::from_toml_str(JSON_PI_TOML).unwrap();
        reloaded.metric_lists.ignored.insert("ifInOctets".to_string());
        settings.replace(reloaded);

        ingest.refresh_settings();
        assert!(ingest.translator.rules().ignored.contains("ifInOctets"));
        assert_eq!(ingest.generation, 1);

        ingest.run(shutdown).await;
        assert!(queue.try_pop().is_none());
    }
}
