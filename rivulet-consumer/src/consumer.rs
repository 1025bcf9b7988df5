use anyhow::Result;
use dashmap::DashMap;
use log::{error, info, warn};
use std::sync::Arc;
use tokio_graceful_shutdown::{SubsystemBuilder, SubsystemHandle, Toplevel};

use rivulet_core::config::ConsumerConfig;
use rivulet_core::error_bail;
use rivulet_core::stream_log::StreamLog;

use crate::aggregator::AggregateSnapshot;
use crate::reporter::Reporter;
use crate::shard_poller::{PartitionProgress, PollerState, ProgressTable, ShardPoller};
use crate::window_store::{AnalyticsSink, WindowStore};

/// Outcome of one `consume` run.
#[derive(Debug, Clone)]
pub struct ConsumeSummary {
    /// Final progress of every partition, ordered by partition.
    pub partitions: Vec<PartitionProgress>,

    /// Snapshot taken after every poller stopped.
    pub snapshot: AggregateSnapshot,
}

impl ConsumeSummary {
    pub fn count(&self, state: PollerState) -> usize {
        self.partitions.iter().filter(|p| p.state == state).count()
    }

    pub fn records(&self) -> u64 {
        self.partitions.iter().map(|p| p.records).sum()
    }

    pub fn partition(&self, partition: u32) -> Option<&PartitionProgress> {
        self.partitions.iter().find(|p| p.partition == partition)
    }
}

/// Waits until every poller reported its final state, then shuts the run down.
struct Coordinator {
    expected: usize,
    done: async_channel::Receiver<PartitionProgress>,
}

impl Coordinator {
    async fn run(self, subsys: SubsystemHandle) -> Result<()> {
        let mut finished = 0;

        while finished < self.expected {
            tokio::select! {
                res = self.done.recv() => {
                    match res {
                        Ok(progress) => {
                            finished += 1;
                            info!(
                                "partition {} finished as {}, {}/{} done",
                                progress.partition, progress.state, finished, self.expected
                            );
                        }
                        Err(e) => {
                            warn!("outcome channel closed, error: {}", e);
                            break;
                        }
                    }
                },
                _ = subsys.on_shutdown_requested() => {
                    info!("coordinator shutdown!");
                    return Ok(());
                }
            }
        }

        info!("all partitions finished, shutting down");
        subsys.request_shutdown();

        Ok(())
    }
}

/// Drains every partition of a stream concurrently into one shared `AnalyticsSink`.
///
/// One poller per partition, plus the reporter, all as subsystems of one `Toplevel`. The
/// run ends when every partition is closed or failed, or on a shutdown request.
pub struct Consumer {
    log: Arc<dyn StreamLog>,
    stream: String,
    config: ConsumerConfig,
    sink: Arc<dyn AnalyticsSink>,
    table: ProgressTable,
    catch_signals: bool,
}

impl Consumer {
    /// Consumer with a fresh `WindowStore` as sink.
    pub fn new(log: Arc<dyn StreamLog>, stream: &str, config: &ConsumerConfig) -> Self {
        let store = WindowStore::new(config.window(), config.top_terms, config.top_entities);
        Self::with_sink(log, stream, config, Arc::new(store))
    }

    pub fn with_sink(
        log: Arc<dyn StreamLog>,
        stream: &str,
        config: &ConsumerConfig,
        sink: Arc<dyn AnalyticsSink>,
    ) -> Self {
        Self {
            log,
            stream: stream.to_string(),
            config: config.clone(),
            sink,
            table: Arc::new(DashMap::new()),
            catch_signals: false,
        }
    }

    /// Stop on SIGINT and SIGTERM.
    pub fn catch_signals(mut self) -> Self {
        self.catch_signals = true;
        self
    }

    pub fn sink(&self) -> Arc<dyn AnalyticsSink> {
        self.sink.clone()
    }

    /// Live progress of every partition.
    pub fn progress_table(&self) -> ProgressTable {
        self.table.clone()
    }

    /// Run until every partition is closed or failed, or until shutdown.
    ///
    /// Fails only if the stream cannot be described.
    pub async fn consume(self) -> Result<ConsumeSummary> {
        let description = match self.log.describe(&self.stream).await {
            Ok(d) => d,
            Err(e) => {
                error_bail!(
                    "describe stream failed, stream: {}, error: {}",
                    self.stream.clone(),
                    e
                );
            }
        };

        info!(
            "Starting review stream consumer for: {}, found {} partitions: {:?}",
            self.stream,
            description.partition_count(),
            description.partitions
        );

        let start = coarsetime::Instant::now();
        let (sender, receiver) = async_channel::unbounded::<PartitionProgress>();

        let pollers: Vec<ShardPoller> = description
            .partitions
            .iter()
            .map(|partition| {
                ShardPoller::new(
                    self.log.clone(),
                    &self.stream,
                    *partition,
                    &self.config,
                    self.sink.clone(),
                    self.table.clone(),
                    sender.clone(),
                )
            })
            .collect();

        // Only pollers hold senders from here on.
        drop(sender);

        let coordinator = Coordinator {
            expected: pollers.len(),
            done: receiver,
        };

        let reporter = self.config.report_interval().map(|interval| {
            Reporter::new(
                self.sink.clone(),
                self.table.clone(),
                interval,
                self.config.window_secs,
            )
        });

        let toplevel = Toplevel::new(move |s| async move {
            for poller in pollers {
                let name = format!("poller_{}", poller.partition());
                s.start(SubsystemBuilder::new(name, |a| poller.run(a)));
            }

            if let Some(reporter) = reporter {
                s.start(SubsystemBuilder::new("reporter", |a| reporter.run(a)));
            }

            s.start(SubsystemBuilder::new("coordinator", |a| coordinator.run(a)));
        });

        let toplevel = if self.catch_signals {
            toplevel.catch_signals()
        } else {
            toplevel
        };

        if let Err(e) = toplevel
            .handle_shutdown_requests(self.config.shutdown_timeout())
            .await
        {
            error!("consumer shutdown not clean, error: {}", e);
        }

        let mut partitions: Vec<PartitionProgress> =
            self.table.iter().map(|e| e.value().clone()).collect();
        partitions.sort_by_key(|p| p.partition);

        // Pollers stopped by the shutdown timeout never reached a final state.
        for p in partitions.iter_mut() {
            if !p.state.is_terminal() {
                p.state = PollerState::Cancelled;
            }
        }

        let snapshot = self.sink.snapshot()?;

        info!(
            "consumer done, stream: {}, records: {}, elapsed: {:.2}s",
            self.stream,
            partitions.iter().map(|p| p.records).sum::<u64>(),
            start.elapsed().as_f64()
        );

        Ok(ConsumeSummary {
            partitions,
            snapshot,
        })
    }
}
