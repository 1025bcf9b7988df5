use anyhow::Result;
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;

use rivulet_core::config::ProducerConfig;
use rivulet_core::stream_log::{PutEntry, PutOutcome, StreamLog};

/// Delivery errors callers may branch on. Travels inside `anyhow::Error`.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("retries exhausted after {attempts} attempts, undelivered records: {undelivered}")]
    RetriesExhausted { attempts: usize, undelivered: usize },
}

/// Counters of one `DeliveryClient`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryStats {
    /// Records acknowledged by the log. Never decreases.
    pub delivered: u64,

    /// Records resubmitted after a failure, counted once per resubmission.
    pub retried: u64,

    /// Records given up on after the retry ceiling.
    pub dropped: u64,

    /// `put_batch` calls, failed ones included.
    pub put_calls: u64,
}

/// Sends batches to the log and resubmits the failed subset until it is empty.
///
/// A batch gets at most `max_attempts` sends. After a partial failure only the rejected
/// records are sent again, in their original order, after `retry_delay`. A failed call is
/// treated as every record rejected and waits `send_error_delay` instead.
pub struct DeliveryClient {
    log: Arc<dyn StreamLog>,
    stream: String,
    max_attempts: usize,
    retry_delay: Duration,
    send_error_delay: Duration,
    stats: DeliveryStats,
}

impl DeliveryClient {
    pub fn new(log: Arc<dyn StreamLog>, stream: &str, config: &ProducerConfig) -> Self {
        Self {
            log,
            stream: stream.to_string(),
            max_attempts: config.max_delivery_attempts.max(1),
            retry_delay: config.retry_delay(),
            send_error_delay: config.send_error_delay(),
            stats: DeliveryStats::default(),
        }
    }

    pub fn stats(&self) -> DeliveryStats {
        self.stats
    }

    /// Total records delivered so far.
    pub fn delivered(&self) -> u64 {
        self.stats.delivered
    }

    /// Deliver `batch`, returning the number of records acknowledged.
    ///
    /// Fails with `DeliveryError::RetriesExhausted` if records are still rejected after
    /// `max_attempts` sends. Records acknowledged before that stay counted.
    pub async fn send(&mut self, batch: Vec<PutEntry>) -> Result<usize> {
        let mut pending = batch;
        let mut attempts = 0;
        let mut delivered = 0;
        let mut delay = Duration::ZERO;

        while !pending.is_empty() {
            if attempts >= self.max_attempts {
                let undelivered = pending.len();
                self.stats.dropped += undelivered as u64;

                error!(
                    "Give up delivering records, stream: {}, attempts: {}, undelivered: {}",
                    self.stream, attempts, undelivered
                );

                return Err(DeliveryError::RetriesExhausted {
                    attempts,
                    undelivered,
                }
                .into());
            }

            if attempts > 0 {
                self.stats.retried += pending.len() as u64;
                tokio::time::sleep(delay).await;
            }

            attempts += 1;
            self.stats.put_calls += 1;

            match self.log.put_batch(&self.stream, &pending).await {
                Ok(outcomes) if outcomes.len() == pending.len() => {
                    let total = pending.len();
                    let mut failed = Vec::new();

                    for (entry, outcome) in pending.into_iter().zip(outcomes) {
                        match outcome {
                            PutOutcome::Delivered { .. } => {
                                delivered += 1;
                                self.stats.delivered += 1;
                            }
                            PutOutcome::Failed { error_code, message } => {
                                if failed.is_empty() {
                                    warn!("first rejected record, code: {}, message: {}", error_code, message);
                                }
                                failed.push(entry);
                            }
                        }
                    }

                    if !failed.is_empty() {
                        warn!(
                            "Failed to put {} of {} records, retrying, stream: {}, attempt: {}",
                            failed.len(),
                            total,
                            self.stream,
                            attempts
                        );
                    }

                    pending = failed;
                    delay = self.retry_delay;
                }
                Ok(outcomes) => {
                    error!(
                        "outcome count mismatch, treat whole batch as failed, stream: {}, sent: {}, outcomes: {}",
                        self.stream,
                        pending.len(),
                        outcomes.len()
                    );
                    delay = self.send_error_delay;
                }
                Err(e) => {
                    error!(
                        "Error sending batch, stream: {}, records: {}, attempt: {}, error: {}",
                        self.stream,
                        pending.len(),
                        attempts,
                        e
                    );
                    delay = self.send_error_delay;
                }
            }
        }

        if attempts > 1 {
            info!(
                "batch delivered after {} attempts, stream: {}, records: {}",
                attempts, self.stream, delivered
            );
        }

        Ok(delivered)
    }
}
