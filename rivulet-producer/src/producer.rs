use anyhow::Result;
use chrono::Utc;
use likely_stable::unlikely;
use log::{error, info};
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use strum::{Display, EnumString};

use rivulet_core::config::ProducerConfig;
use rivulet_core::record::Review;
use rivulet_core::stream_log::{PutEntry, StreamLog};

use crate::batcher::Batcher;
use crate::delivery::{DeliveryClient, DeliveryError, DeliveryStats};

/// Number of leading records previewed in the log.
const PREVIEW_RECORDS: usize = 3;

/// Chars shown per preview.
const PREVIEW_CHARS: usize = 100;

/// How records are paced.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum StreamingMode {
    /// Short random pauses every few records, to look like live traffic.
    #[default]
    Continuous,

    /// As fast as delivery allows.
    Batch,
}

/// Outcome of one `produce` run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProduceSummary {
    /// Records taken from the source.
    pub records: usize,

    /// Records that could not be serialized.
    pub invalid: usize,

    /// Batches that still had undelivered records after the retry ceiling.
    pub failed_batches: usize,

    pub delivery: DeliveryStats,

    /// The run ended early on a stop request.
    pub stopped: bool,
}

/// Moves reviews from a source into the log.
///
/// Each review is stamped with the send time, keyed by its owner, batched, and delivered.
/// Whatever is still buffered is flushed when the source ends, stops, or breaks.
pub struct Producer {
    log: Arc<dyn StreamLog>,
    stream: String,
    config: ProducerConfig,
    mode: StreamingMode,
    batcher: Batcher,
    client: DeliveryClient,
    stop: Arc<AtomicBool>,
    summary: ProduceSummary,
}

impl Producer {
    pub fn new(
        log: Arc<dyn StreamLog>,
        stream: &str,
        config: &ProducerConfig,
        mode: StreamingMode,
    ) -> Self {
        Self {
            client: DeliveryClient::new(log.clone(), stream, config),
            log,
            stream: stream.to_string(),
            config: config.clone(),
            mode,
            batcher: Batcher::new(config.batch_size),
            stop: Arc::new(AtomicBool::new(false)),
            summary: ProduceSummary::default(),
        }
    }

    /// Set to `true` to make `produce` stop after the current record.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    pub fn summary(&self) -> ProduceSummary {
        ProduceSummary {
            delivery: self.client.stats(),
            ..self.summary
        }
    }

    /// Deliver every review of `reviews`, then flush.
    pub async fn produce<I: Iterator<Item = Review>>(&mut self, mut reviews: I) -> Result<ProduceSummary> {
        info!(
            "Starting to stream, stream: {}, mode: {}, batch_size: {}",
            self.stream, self.mode, self.config.batch_size
        );

        let start = coarsetime::Instant::now();

        // The flag is checked before the next review is read, so nothing read is lost.
        loop {
            if unlikely(self.stop.load(Ordering::Relaxed)) {
                info!("stop requested, stop reading source");
                self.summary.stopped = true;
                break;
            }

            let review = match reviews.next() {
                Some(review) => review,
                None => break,
            };

            self.add(review).await;
            self.pace().await;
        }

        self.flush().await;

        let summary = self.summary();
        let secs = start.elapsed().as_f64();

        info!(
            "Completed! Total reviews streamed: {}, records: {}, dropped: {}, elapsed: {:.2}s",
            summary.delivery.delivered, summary.records, summary.delivery.dropped, secs
        );

        Ok(summary)
    }

    /// Stamp, key, and buffer one review. Delivers the batch once it is full.
    pub async fn add(&mut self, review: Review) {
        let review = review.stamped(Utc::now());

        let data = match review.to_bytes() {
            Ok(data) => data,
            Err(e) => {
                error!("Error processing review, review_id: {}, error: {}", review.review_id, e);
                self.summary.invalid += 1;
                return;
            }
        };

        self.summary.records += 1;
        let records = self.summary.records;

        if records <= PREVIEW_RECORDS {
            info!(
                "Sample review: {}... (Rating: {})",
                review.preview(PREVIEW_CHARS),
                review.stars
            );
        }

        if let Some(batch) = self.batcher.add(data, review.partition_key()) {
            self.deliver(batch).await;
        }

        if self.config.progress_every > 0 && records % self.config.progress_every == 0 {
            info!(
                "Processed {} reviews, sent {} to log",
                records,
                self.client.delivered()
            );
        }
    }

    /// Deliver whatever is buffered.
    pub async fn flush(&mut self) {
        if let Some(batch) = self.batcher.flush() {
            self.deliver(batch).await;
        }
    }

    /// Close the stream for writes.
    pub async fn seal(&self) -> Result<()> {
        self.log.seal(&self.stream).await?;
        info!("stream sealed, stream: {}", self.stream);

        Ok(())
    }

    async fn deliver(&mut self, batch: Vec<PutEntry>) {
        if let Err(e) = self.client.send(batch).await {
            self.summary.failed_batches += 1;

            match e.downcast_ref::<DeliveryError>() {
                Some(DeliveryError::RetriesExhausted { undelivered, .. }) => {
                    error!(
                        "drop batch remainder, stream: {}, undelivered: {}",
                        self.stream, undelivered
                    );
                }
                None => {
                    error!("deliver batch failed, stream: {}, error: {}", self.stream, e);
                }
            }
        }
    }

    async fn pace(&self) {
        if self.mode != StreamingMode::Continuous || self.config.pace_every == 0 {
            return;
        }

        if self.summary.records == 0 || self.summary.records % self.config.pace_every != 0 {
            return;
        }

        let ms = rand::thread_rng().gen_range(self.config.pace_min_ms..=self.config.pace_max_ms);
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
}
