use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::config::RestTarget;
use crate::pipeline::{HandoffQueue, MetricBatch, NormalizedMetricRecord};
use super::http::PayloadSender;
use super::spool::spool_payload;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

#[derive(Debug)]
pub enum PublishOutcome {
    Delivered { attempts: u32 },
    /// Every attempt failed; the payload is being written to the spool.
    Spilled(JoinHandle<io::Result<PathBuf>>),
}

/// Sends `payload`, sleeping `attempt * base_delay` after each failure, and
/// spools it once the attempts are used up.
pub async fn retry_publish<S: PayloadSender + ?Sized>(
    sender: &S,
    payload: Vec<u8>,
    policy: &RetryPolicy,
    spool_dir: &Path,
) -> PublishOutcome {
    let max_attempts = policy.max_attempts.max(1);

    for attempt in 1..=max_attempts {
        match sender.send(&payload).await {
            Ok(()) => {
                if attempt > 1 {
                    info!("Batch delivered on attempt {}", attempt);
                }
                return PublishOutcome::Delivered { attempts: attempt };
            }
            Err(e) => {
                metrics::counter!("mediator_publish_failures_total").increment(1);
                warn!(
                    "Failed to publish batch (attempt {}/{}): {}",
                    attempt, max_attempts, e
                );
                if !e.is_retryable() || attempt == max_attempts {
                    break;
                }
                sleep(policy.base_delay * attempt).await;
            }
        }
    }

    error!(
        "Giving up on batch of {} bytes, saving it under {}",
        payload.len(),
        spool_dir.display()
    );
    metrics::counter!("mediator_batches_spilled_total").increment(1);
    PublishOutcome::Spilled(spool_payload(spool_dir, payload))
}

/// Accumulates records and posts them as one group per flush, on size or
/// when the flush period elapses with records pending.
pub struct BatchHttpPublisher<S> {
    sender: S,
    queue: Arc<HandoffQueue<NormalizedMetricRecord>>,
    batch: MetricBatch,
    batch_size: usize,
    flush_period: Duration,
    retry: RetryPolicy,
    spool_dir: PathBuf,
    in_flight: Arc<AtomicUsize>,
}

impl<S: PayloadSender> BatchHttpPublisher<S> {
    pub fn new(
        sender: S,
        target: &RestTarget,
        queue: Arc<HandoffQueue<NormalizedMetricRecord>>,
    ) -> Self {
        let batch_size = target.batch_size.max(1);
        Self {
            sender,
            queue,
            batch: MetricBatch::with_capacity(batch_size),
            batch_size,
            flush_period: target.flush_period,
            retry: RetryPolicy {
                max_attempts: target.max_attempts,
                base_delay: target.retry_base_delay,
            },
            spool_dir: target.spool_dir.clone(),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of records currently held in the batch.
    pub fn in_flight_gauge(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.in_flight)
    }

    pub async fn run(mut self) {
        info!(
            "Batch publisher started: batch size {}, flush period {}s",
            self.batch_size,
            self.flush_period.as_secs()
        );

        let queue = Arc::clone(&self.queue);
        let mut deadline = Instant::now() + self.flush_period;
        // Set when the period ran out with nothing to send; the next record
        // is then flushed at once.
        let mut overdue = false;

        loop {
            tokio::select! {
                next = queue.pop() => match next {
                    Some(record) => {
                        self.batch.push(record);
                        self.in_flight.store(self.batch.len(), Ordering::Relaxed);
                        if self.batch.len() >= self.batch_size || overdue {
                            debug!("Flushing batch of {} records", self.batch.len());
                            self.flush().await;
                            deadline = Instant::now() + self.flush_period;
                            overdue = false;
                        }
                    }
                    None => break,
                },
                _ = sleep_until(deadline), if !overdue => {
                    if self.batch.is_empty() {
                        overdue = true;
                    } else {
                        debug!("Flush period elapsed with {} records pending", self.batch.len());
                        self.flush().await;
                        deadline = Instant::now() + self.flush_period;
                    }
                }
            }
        }

        if !self.batch.is_empty() {
            info!("Flushing {} remaining records before shutdown", self.batch.len());
            if let PublishOutcome::Spilled(handle) = self.flush().await {
                if let Err(e) = handle.await {
                    error!("Spool task failed: {}", e);
                }
            }
        }
        info!("Batch publisher stopped");
    }

    async fn flush(&mut self) -> PublishOutcome {
        let outcome = match self.batch.to_payload() {
            Ok(payload) => {
                retry_publish(&self.sender, payload, &self.retry, &self.spool_dir).await
            }
            Err(e) => {
                error!("Failed to serialize batch of {} records: {}", self.batch.len(), e);
                PublishOutcome::Delivered { attempts: 0 }
            }
        };
        self.batch.clear();
        self.in_flight.store(0, Ordering::Relaxed);
        outcome
    }
}
