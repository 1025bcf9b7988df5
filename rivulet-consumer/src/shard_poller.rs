use anyhow::Result;
use dashmap::DashMap;
use likely_stable::unlikely;
use log::{error, info, warn};
use std::future::Future;
use std::sync::Arc;
use strum::Display;
use tokio_graceful_shutdown::SubsystemHandle;

use rivulet_core::config::ConsumerConfig;
use rivulet_core::stream_log::{Cursor, LogError, PartitionId, StartPosition, StreamLog};

use crate::processor::RecordProcessor;
use crate::window_store::AnalyticsSink;

/// Log a waiting message every this many empty polls, until the first record shows up.
const EMPTY_POLL_LOG_EVERY: u64 = 30;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum PollerState {
    #[default]
    Init,
    Polling,
    Processing,

    /// The log has no more records for the partition.
    Closed,

    /// No cursor could be acquired.
    Failed,

    /// Stopped by a shutdown request.
    Cancelled,
}

impl PollerState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PollerState::Closed | PollerState::Failed | PollerState::Cancelled
        )
    }
}

/// Live progress of one partition.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct PartitionProgress {
    pub partition: PartitionId,
    pub state: PollerState,

    /// Records folded into the sink.
    pub records: u64,

    /// Records that could not be processed.
    pub failed_records: u64,

    pub empty_polls: u64,
    pub fetch_errors: u64,
    pub last_error: Option<String>,
}

/// Shared table of partition progress, keyed by partition.
pub type ProgressTable = Arc<DashMap<PartitionId, PartitionProgress>>;

/// Drains one partition into the sink.
///
/// Starts at the configured position and fetches until the log reports the partition
/// closed. An empty fetch pauses briefly. A failed fetch pauses longer, then repositions
/// at the latest record. If that fails too, the partition is given up, and only this one.
pub struct ShardPoller {
    log: Arc<dyn StreamLog>,
    stream: String,
    config: ConsumerConfig,
    processor: RecordProcessor,
    sink: Arc<dyn AnalyticsSink>,
    table: ProgressTable,
    done: async_channel::Sender<PartitionProgress>,
    progress: PartitionProgress,
}

impl ShardPoller {
    pub fn new(
        log: Arc<dyn StreamLog>,
        stream: &str,
        partition: PartitionId,
        config: &ConsumerConfig,
        sink: Arc<dyn AnalyticsSink>,
        table: ProgressTable,
        done: async_channel::Sender<PartitionProgress>,
    ) -> Self {
        let progress = PartitionProgress {
            partition,
            ..PartitionProgress::default()
        };

        table.insert(partition, progress.clone());

        Self {
            log,
            stream: stream.to_string(),
            config: config.clone(),
            processor: RecordProcessor::new(),
            sink,
            table,
            done,
            progress,
        }
    }

    pub fn partition(&self) -> PartitionId {
        self.progress.partition
    }

    pub async fn run(mut self, subsys: SubsystemHandle) -> Result<()> {
        let partition = self.progress.partition;

        info!(
            "Starting to process partition: {}, stream: {}, start: {}",
            partition, self.stream, self.config.start_position
        );

        let state = self.poll(&subsys).await;
        self.set_state(state);

        info!(
            "partition done, partition: {}, state: {}, records: {}, failed records: {}, fetch errors: {}",
            partition,
            state,
            self.progress.records,
            self.progress.failed_records,
            self.progress.fetch_errors
        );

        if self.done.send(self.progress.clone()).await.is_err() {
            info!("nobody waits for partition outcome, partition: {}", partition);
        }

        // Failed partitions are reported through `done`, never as a subsystem error.
        Ok(())
    }

    async fn poll(&mut self, subsys: &SubsystemHandle) -> PollerState {
        let partition = self.progress.partition;

        let cursor = self
            .cancellable(
                subsys,
                self.log
                    .get_cursor(&self.stream, partition, self.config.start_position),
            )
            .await;

        let mut cursor = match cursor {
            None => return PollerState::Cancelled,
            Some(Ok(cursor)) => cursor,
            Some(Err(e)) => {
                error!(
                    "Failed to process partition {}, get cursor failed, error: {}",
                    partition, e
                );
                self.progress.last_error = Some(e.to_string());
                return PollerState::Failed;
            }
        };

        self.set_state(PollerState::Polling);

        let mut consecutive_empty = 0;
        let mut records_found = false;

        loop {
            let fetched = match self.cancellable(subsys, self.fetch(&cursor)).await {
                None => return PollerState::Cancelled,
                Some(res) => res,
            };

            let result = match fetched {
                Ok(result) => result,
                Err(e) => {
                    self.progress.fetch_errors += 1;
                    self.progress.last_error = Some(e.to_string());
                    self.publish();

                    warn!("Error in partition {}: {}", partition, e);

                    if self
                        .cancellable(subsys, tokio::time::sleep(self.config.error_backoff()))
                        .await
                        .is_none()
                    {
                        return PollerState::Cancelled;
                    }

                    let repositioned = self
                        .cancellable(
                            subsys,
                            self.log
                                .get_cursor(&self.stream, partition, StartPosition::Latest),
                        )
                        .await;

                    match repositioned {
                        None => return PollerState::Cancelled,
                        Some(Ok(c)) => {
                            info!("partition {} repositioned at latest", partition);
                            cursor = c;
                            continue;
                        }
                        Some(Err(e)) => {
                            error!(
                                "reposition partition {} failed, give up, error: {}",
                                partition, e
                            );
                            self.progress.last_error = Some(e.to_string());
                            return PollerState::Failed;
                        }
                    }
                }
            };

            let empty = result.records.is_empty();

            if empty {
                consecutive_empty += 1;
                self.progress.empty_polls += 1;

                if !records_found && self.progress.empty_polls % EMPTY_POLL_LOG_EVERY == 0 {
                    info!("Still no records in partition {}...", partition);
                }
            } else {
                if !records_found {
                    info!("Found records in partition {}!", partition);
                    records_found = true;
                }

                consecutive_empty = 0;
                self.set_state(PollerState::Processing);

                for record in result.records.iter() {
                    self.process(&record.data, record.sequence);
                }

                self.set_state(PollerState::Polling);
            }

            self.publish();

            cursor = match result.next_cursor {
                Some(c) => c,
                None => {
                    info!("Partition {} has been closed", partition);
                    return PollerState::Closed;
                }
            };

            if empty
                && self
                    .cancellable(
                        subsys,
                        tokio::time::sleep(self.config.idle_backoff(consecutive_empty)),
                    )
                    .await
                    .is_none()
            {
                return PollerState::Cancelled;
            }
        }
    }

    /// One fetch under the configured deadline.
    async fn fetch(&self, cursor: &Cursor) -> Result<rivulet_core::stream_log::FetchResult> {
        let timeout = self.config.fetch_timeout();

        match tokio::time::timeout(timeout, self.log.fetch(cursor, self.config.fetch_limit)).await {
            Ok(res) => res,
            Err(_) => Err(LogError::Timeout {
                partition: cursor.partition(),
                millis: timeout.as_millis() as u64,
            }
            .into()),
        }
    }

    fn process(&mut self, data: &[u8], sequence: u64) {
        let res = self
            .processor
            .process(data)
            .and_then(|review| self.sink.append(review));

        match res {
            Ok(()) => self.progress.records += 1,
            Err(e) => {
                self.progress.failed_records += 1;

                if unlikely(self.progress.failed_records == 1) || self.progress.failed_records % 100 == 0 {
                    error!(
                        "Error processing record, partition: {}, sequence: {}, failed so far: {}, error: {}",
                        self.progress.partition, sequence, self.progress.failed_records, e
                    );
                }
            }
        }
    }

    /// Run `fut` unless shutdown is requested first.
    async fn cancellable<F: Future>(&self, subsys: &SubsystemHandle, fut: F) -> Option<F::Output> {
        tokio::select! {
            _ = subsys.on_shutdown_requested() => None,
            out = fut => Some(out),
        }
    }

    fn set_state(&mut self, state: PollerState) {
        self.progress.state = state;
        self.publish();
    }

    fn publish(&self) {
        self.table
            .insert(self.progress.partition, self.progress.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rivulet_core::record::Review;
    use rivulet_core::stream_log::{MemoryLog, PartitionFault, PutEntry};
    use rivulet_core::tool::setup_log;
    use std::time::Duration;
    use tokio_graceful_shutdown::{SubsystemBuilder, Toplevel};

    use crate::window_store::WindowStore;

    fn config() -> ConsumerConfig {
        ConsumerConfig {
            idle_backoff_ms: 5,
            max_idle_backoff_ms: 20,
            error_backoff_ms: 0,
            ..ConsumerConfig::default()
        }
    }

    async fn fill(log: &MemoryLog, partition: PartitionId, n: usize) -> Result<()> {
        let entries = (0..n)
            .map(|i| {
                let review = Review {
                    review_id: format!("r{}", i),
                    text: "friendly staff".to_string(),
                    stars: 4.0,
                    ..Review::default()
                }
                .stamped(Utc::now());

                Ok(PutEntry::new("k", review.to_bytes()?).with_partition(partition))
            })
            .collect::<Result<Vec<_>>>()?;

        log.put_batch("reviews", &entries).await?;

        Ok(())
    }

    /// Run one poller to completion, optionally requesting shutdown after `stop_after`.
    async fn run_poller(
        log: Arc<MemoryLog>,
        partition: PartitionId,
        config: ConsumerConfig,
        stop_after: Option<Duration>,
    ) -> Result<(PartitionProgress, Arc<WindowStore>)> {
        let store = Arc::new(WindowStore::new(config.window(), 10, 5));
        let table: ProgressTable = Arc::new(DashMap::new());
        let (sender, receiver) = async_channel::unbounded();

        let poller = ShardPoller::new(
            log,
            "reviews",
            partition,
            &config,
            store.clone(),
            table.clone(),
            sender,
        );

        Toplevel::new(move |s| async move {
            s.start(SubsystemBuilder::new("poller", |a| poller.run(a)));

            if let Some(after) = stop_after {
                s.start(SubsystemBuilder::new("stopper", move |a: SubsystemHandle| async move {
                    tokio::time::sleep(after).await;
                    a.request_shutdown();
                    Ok::<(), anyhow::Error>(())
                }));
            }
        })
        .handle_shutdown_requests(Duration::from_secs(5))
        .await
        .map_err(|e| anyhow::anyhow!("shutdown failed: {}", e))?;

        let progress = receiver.recv().await?;
        assert_eq!(table.get(&partition).map(|p| p.state), Some(progress.state));

        Ok((progress, store))
    }

    #[tokio::test]
    async fn test_drain_sealed_partition() -> Result<()> {
        setup_log();

        let log = Arc::new(MemoryLog::new());
        log.create_or_describe("reviews", 2).await?;
        fill(&log, 1, 250).await?;
        log.seal("reviews").await?;

        let (progress, store) = run_poller(log, 1, config(), None).await?;

        assert_eq!(progress.state, PollerState::Closed);
        assert_eq!(progress.records, 250);
        assert_eq!(store.snapshot()?.window_size, 250);

        Ok(())
    }

    #[tokio::test]
    async fn test_reads_fail_gives_up_partition() -> Result<()> {
        setup_log();

        let log = Arc::new(MemoryLog::new());
        log.create_or_describe("reviews", 3).await?;
        fill(&log, 2, 5).await?;
        log.inject_partition_fault("reviews", 2, PartitionFault::ReadsFail);

        let (progress, store) = run_poller(log, 2, config(), None).await?;

        assert_eq!(progress.state, PollerState::Failed);
        assert_eq!(progress.fetch_errors, 1);
        assert!(progress.last_error.is_some());
        assert_eq!(store.snapshot()?.window_size, 0);

        Ok(())
    }

    #[tokio::test]
    async fn test_unavailable_partition_fails_at_init() -> Result<()> {
        setup_log();

        let log = Arc::new(MemoryLog::new());
        log.create_or_describe("reviews", 1).await?;
        log.inject_partition_fault("reviews", 0, PartitionFault::Unavailable);

        let (progress, _) = run_poller(log, 0, config(), None).await?;

        assert_eq!(progress.state, PollerState::Failed);
        assert_eq!(progress.fetch_errors, 0);

        Ok(())
    }

    #[tokio::test]
    async fn test_shutdown_cancels_idle_partition() -> Result<()> {
        setup_log();

        let log = Arc::new(MemoryLog::new());
        log.create_or_describe("reviews", 1).await?;
        fill(&log, 0, 3).await?;

        let (progress, _) = run_poller(log, 0, config(), Some(Duration::from_millis(100))).await?;

        assert_eq!(progress.state, PollerState::Cancelled);
        assert_eq!(progress.records, 3);
        assert!(progress.empty_polls > 0);

        Ok(())
    }

    #[tokio::test]
    async fn test_bad_records_are_skipped() -> Result<()> {
        setup_log();

        let log = Arc::new(MemoryLog::new());
        log.create_or_describe("reviews", 1).await?;
        fill(&log, 0, 2).await?;

        let no_timestamp = Review {
            review_id: "x".to_string(),
            ..Review::default()
        };
        log.put_batch(
            "reviews",
            &[
                PutEntry::new("k", b"{garbage".to_vec()),
                PutEntry::new("k", no_timestamp.to_bytes()?),
            ],
        )
        .await?;
        fill(&log, 0, 2).await?;
        log.seal("reviews").await?;

        let (progress, store) = run_poller(log, 0, config(), None).await?;

        assert_eq!(progress.state, PollerState::Closed);
        assert_eq!(progress.records, 4);
        assert_eq!(progress.failed_records, 2);
        assert_eq!(store.snapshot()?.total_reviews, 4);

        Ok(())
    }

    #[test]
    fn test_terminal_states() {
        assert!(PollerState::Closed.is_terminal());
        assert!(PollerState::Failed.is_terminal());
        assert!(PollerState::Cancelled.is_terminal());
        assert!(!PollerState::Polling.is_terminal());
        assert_eq!(PollerState::Processing.to_string(), "processing");
    }
}
