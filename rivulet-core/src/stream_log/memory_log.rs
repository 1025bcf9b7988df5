use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use likely_stable::unlikely;
use log::{info, warn};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{
    target_partition, Cursor, FetchResult, LogError, LogRecord, PartitionId, PutEntry, PutOutcome,
    StartPosition, StreamDescription, StreamLog,
};
use crate::error_bail;

/// Error code reported for records rejected by injected faults.
pub const THROTTLED_ERROR_CODE: &str = "ProvisionedThroughputExceeded";

/// Read fault of one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionFault {
    /// Every fetch fails, so does repositioning at `Latest`. A cursor at the trim horizon is
    /// still granted, so readers start normally and break on the first read.
    ReadsFail,

    /// Every cursor request and every fetch fails.
    Unavailable,
}

#[derive(Default)]
struct PutFaults {
    /// Number of upcoming records to reject.
    fail_next_records: usize,

    /// Number of upcoming `put_batch` calls to fail as a whole.
    fail_next_calls: usize,

    /// Reject every record.
    fail_all: bool,
}

struct MemoryStream {
    partitions: Vec<Mutex<Vec<LogRecord>>>,
    sealed: AtomicBool,
}

/// In-process partitioned log.
///
/// Partitions are plain `Vec`s behind their own `Mutex`, so readers of different partitions
/// never contend. Faults can be injected to exercise the retry and isolation paths of
/// producer and consumer.
#[derive(Default)]
pub struct MemoryLog {
    streams: DashMap<String, Arc<MemoryStream>>,

    put_faults: Mutex<PutFaults>,

    partition_faults: DashMap<(String, PartitionId), PartitionFault>,

    /// Number of `put_batch` calls, including failed ones.
    put_calls: AtomicU64,
}

fn lock<T>(m: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    m.lock().map_err(|e| anyhow!("memory log lock poisoned: {}", e))
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject the next `n` records with a throttling error.
    pub fn fail_next_records(&self, n: usize) -> Result<()> {
        lock(&self.put_faults)?.fail_next_records = n;
        Ok(())
    }

    /// Fail the next `n` `put_batch` calls as a whole.
    pub fn fail_next_calls(&self, n: usize) -> Result<()> {
        lock(&self.put_faults)?.fail_next_calls = n;
        Ok(())
    }

    /// Reject every record until switched off.
    pub fn fail_all_records(&self, on: bool) -> Result<()> {
        lock(&self.put_faults)?.fail_all = on;
        Ok(())
    }

    pub fn inject_partition_fault(&self, stream: &str, partition: PartitionId, fault: PartitionFault) {
        self.partition_faults
            .insert((stream.to_string(), partition), fault);
    }

    pub fn clear_partition_fault(&self, stream: &str, partition: PartitionId) {
        self.partition_faults.remove(&(stream.to_string(), partition));
    }

    pub fn put_calls(&self) -> u64 {
        self.put_calls.load(Ordering::Relaxed)
    }

    /// Number of records stored in `partition`.
    pub fn partition_len(&self, stream: &str, partition: PartitionId) -> Result<usize> {
        let s = self.get_stream(stream)?;
        let p = Self::get_partition(&s, stream, partition)?;
        let n = lock(p)?.len();
        Ok(n)
    }

    /// Total number of records stored in `stream`.
    pub fn total_len(&self, stream: &str) -> Result<usize> {
        let s = self.get_stream(stream)?;
        let mut total = 0;
        for p in s.partitions.iter() {
            total += lock(p)?.len();
        }
        Ok(total)
    }

    fn get_stream(&self, stream: &str) -> Result<Arc<MemoryStream>> {
        self.streams
            .get(stream)
            .map(|s| s.value().clone())
            .ok_or_else(|| LogError::StreamNotFound(stream.to_string()).into())
    }

    fn get_partition<'a>(
        s: &'a MemoryStream,
        stream: &str,
        partition: PartitionId,
    ) -> Result<&'a Mutex<Vec<LogRecord>>> {
        s.partitions.get(partition as usize).ok_or_else(|| {
            LogError::PartitionNotFound {
                stream: stream.to_string(),
                partition,
            }
            .into()
        })
    }

    fn partition_fault(&self, stream: &str, partition: PartitionId) -> Option<PartitionFault> {
        self.partition_faults
            .get(&(stream.to_string(), partition))
            .map(|f| *f.value())
    }

    fn describe_stream(stream: &str, s: &MemoryStream) -> StreamDescription {
        StreamDescription {
            stream: stream.to_string(),
            partitions: (0..s.partitions.len() as PartitionId).collect(),
            sealed: s.sealed.load(Ordering::Acquire),
        }
    }

    /// Decide whether the next record is rejected, consuming one injected failure.
    fn take_record_fault(faults: &mut PutFaults) -> bool {
        if faults.fail_all {
            return true;
        }

        if faults.fail_next_records > 0 {
            faults.fail_next_records -= 1;
            return true;
        }

        false
    }
}

#[async_trait]
impl StreamLog for MemoryLog {
    async fn create_or_describe(&self, stream: &str, partitions: usize) -> Result<StreamDescription> {
        if unlikely(partitions == 0) {
            error_bail!("partition count must be positive, stream: {}", stream);
        }

        let s = self
            .streams
            .entry(stream.to_string())
            .or_insert_with(|| {
                info!("create memory stream: {}, partitions: {}", stream, partitions);

                Arc::new(MemoryStream {
                    partitions: (0..partitions).map(|_| Mutex::new(Vec::new())).collect(),
                    sealed: AtomicBool::new(false),
                })
            })
            .value()
            .clone();

        Ok(Self::describe_stream(stream, &s))
    }

    async fn describe(&self, stream: &str) -> Result<StreamDescription> {
        let s = self.get_stream(stream)?;
        Ok(Self::describe_stream(stream, &s))
    }

    async fn put_batch(&self, stream: &str, entries: &[PutEntry]) -> Result<Vec<PutOutcome>> {
        self.put_calls.fetch_add(1, Ordering::Relaxed);

        let s = self.get_stream(stream)?;

        if s.sealed.load(Ordering::Acquire) {
            error_bail!("stream is sealed, cannot put records, stream: {}", stream);
        }

        let mut faults = lock(&self.put_faults)?;

        if faults.fail_next_calls > 0 {
            faults.fail_next_calls -= 1;
            error_bail!("injected put failure, stream: {}", stream);
        }

        let partition_count = s.partitions.len();
        let mut outcomes = Vec::with_capacity(entries.len());

        for entry in entries {
            if Self::take_record_fault(&mut faults) {
                outcomes.push(PutOutcome::Failed {
                    error_code: THROTTLED_ERROR_CODE.to_string(),
                    message: "rate exceeded".to_string(),
                });
                continue;
            }

            let partition = target_partition(entry, partition_count);
            let mut records = match s.partitions.get(partition as usize) {
                Some(p) => lock(p)?,
                None => {
                    warn!(
                        "explicit partition out of range, partition: {}, count: {}",
                        partition, partition_count
                    );
                    outcomes.push(PutOutcome::Failed {
                        error_code: "InvalidArgument".to_string(),
                        message: format!("partition {} out of range", partition),
                    });
                    continue;
                }
            };

            let sequence = records.len() as u64;
            records.push(LogRecord {
                partition,
                sequence,
                partition_key: entry.partition_key.clone(),
                arrival: Utc::now(),
                data: entry.data.clone(),
            });

            outcomes.push(PutOutcome::Delivered {
                partition,
                sequence,
            });
        }

        Ok(outcomes)
    }

    async fn get_cursor(
        &self,
        stream: &str,
        partition: PartitionId,
        start: StartPosition,
    ) -> Result<Cursor> {
        let s = self.get_stream(stream)?;
        let p = Self::get_partition(&s, stream, partition)?;

        let unavailable = match self.partition_fault(stream, partition) {
            Some(PartitionFault::Unavailable) => true,
            Some(PartitionFault::ReadsFail) => start == StartPosition::Latest,
            None => false,
        };

        if unavailable {
            return Err(LogError::Unavailable {
                stream: stream.to_string(),
                partition,
            }
            .into());
        }

        let sequence = match start {
            StartPosition::TrimHorizon => 0,
            StartPosition::Latest => lock(p)?.len() as u64,
        };

        Ok(Cursor {
            stream: stream.to_string(),
            partition,
            sequence,
            offset: sequence,
        })
    }

    async fn fetch(&self, cursor: &Cursor, limit: usize) -> Result<FetchResult> {
        if self.partition_fault(&cursor.stream, cursor.partition).is_some() {
            return Err(LogError::Unavailable {
                stream: cursor.stream.clone(),
                partition: cursor.partition,
            }
            .into());
        }

        let s = self.get_stream(&cursor.stream)?;
        let p = Self::get_partition(&s, &cursor.stream, cursor.partition)?;

        // Read the sealed flag before the records, a put can never land after sealing.
        let sealed = s.sealed.load(Ordering::Acquire);
        let records = lock(p)?;

        let start = cursor.sequence as usize;
        if unlikely(start > records.len()) {
            return Err(LogError::InvalidCursor {
                partition: cursor.partition,
                reason: format!("sequence {} beyond end {}", start, records.len()),
            }
            .into());
        }

        let end = (start + limit).min(records.len());
        let out = records[start..end].to_vec();

        let next_cursor = if sealed && end == records.len() {
            None
        } else {
            Some(Cursor {
                stream: cursor.stream.clone(),
                partition: cursor.partition,
                sequence: end as u64,
                offset: end as u64,
            })
        };

        Ok(FetchResult {
            records: out,
            next_cursor,
        })
    }

    async fn seal(&self, stream: &str) -> Result<()> {
        let s = self.get_stream(stream)?;
        s.sealed.store(true, Ordering::Release);

        info!("memory stream sealed: {}", stream);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::setup_log;

    fn entry(key: &str, data: &str) -> PutEntry {
        PutEntry::new(key, data.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn test_create_is_idempotent() -> Result<()> {
        let log = MemoryLog::new();

        let d1 = log.create_or_describe("s", 3).await?;
        let d2 = log.create_or_describe("s", 8).await?;

        assert_eq!(d1.partition_count(), 3);
        assert_eq!(d2.partition_count(), 3);
        assert!(log.describe("missing").await.is_err());

        Ok(())
    }

    #[tokio::test]
    async fn test_put_and_fetch_in_order() -> Result<()> {
        let log = MemoryLog::new();
        log.create_or_describe("s", 2).await?;

        let entries: Vec<PutEntry> = (0..5)
            .map(|i| entry("same_owner", &format!("r{}", i)))
            .collect();
        let outcomes = log.put_batch("s", &entries).await?;

        assert!(outcomes.iter().all(|o| !o.is_failed()));

        let partition = match outcomes[0] {
            PutOutcome::Delivered { partition, .. } => partition,
            _ => unreachable!(),
        };

        let cursor = log
            .get_cursor("s", partition, StartPosition::TrimHorizon)
            .await?;
        let first = log.fetch(&cursor, 3).await?;
        assert_eq!(first.records.len(), 3);

        let next = first.next_cursor.expect("stream is open");
        let second = log.fetch(&next, 10).await?;
        let data: Vec<String> = first
            .records
            .iter()
            .chain(second.records.iter())
            .map(|r| String::from_utf8_lossy(&r.data).to_string())
            .collect();

        assert_eq!(data, vec!["r0", "r1", "r2", "r3", "r4"]);
        assert!(second.next_cursor.is_some());

        Ok(())
    }

    #[tokio::test]
    async fn test_sealed_partition_closes() -> Result<()> {
        let log = MemoryLog::new();
        log.create_or_describe("s", 1).await?;
        log.put_batch("s", &[entry("k", "a")]).await?;
        log.seal("s").await?;

        assert!(log.put_batch("s", &[entry("k", "b")]).await.is_err());

        let cursor = log.get_cursor("s", 0, StartPosition::TrimHorizon).await?;
        let res = log.fetch(&cursor, 10).await?;

        assert_eq!(res.records.len(), 1);
        assert!(res.next_cursor.is_none());

        Ok(())
    }

    #[tokio::test]
    async fn test_latest_cursor_skips_existing() -> Result<()> {
        let log = MemoryLog::new();
        log.create_or_describe("s", 1).await?;
        log.put_batch("s", &[entry("k", "old")]).await?;

        let cursor = log.get_cursor("s", 0, StartPosition::Latest).await?;
        log.put_batch("s", &[entry("k", "new")]).await?;

        let res = log.fetch(&cursor, 10).await?;
        assert_eq!(res.records.len(), 1);
        assert_eq!(res.records[0].data, b"new".to_vec());

        Ok(())
    }

    #[tokio::test]
    async fn test_injected_record_failures() -> Result<()> {
        setup_log();

        let log = MemoryLog::new();
        log.create_or_describe("s", 2).await?;
        log.fail_next_records(2)?;

        let entries: Vec<PutEntry> = (0..4).map(|i| entry("k", &i.to_string())).collect();
        let outcomes = log.put_batch("s", &entries).await?;

        let failed: Vec<bool> = outcomes.iter().map(|o| o.is_failed()).collect();
        assert_eq!(failed, vec![true, true, false, false]);
        assert_eq!(log.total_len("s")?, 2);

        log.fail_next_calls(1)?;
        assert!(log.put_batch("s", &entries).await.is_err());
        assert_eq!(log.put_calls(), 2);

        Ok(())
    }

    #[tokio::test]
    async fn test_partition_faults() -> Result<()> {
        let log = MemoryLog::new();
        log.create_or_describe("s", 2).await?;

        log.inject_partition_fault("s", 1, PartitionFault::ReadsFail);

        let cursor = log.get_cursor("s", 1, StartPosition::TrimHorizon).await?;
        let err = log.fetch(&cursor, 10).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LogError>(),
            Some(LogError::Unavailable { partition: 1, .. })
        ));
        assert!(log.get_cursor("s", 1, StartPosition::Latest).await.is_err());

        // Other partitions are unaffected.
        let cursor = log.get_cursor("s", 0, StartPosition::Latest).await?;
        assert!(log.fetch(&cursor, 10).await.is_ok());

        log.inject_partition_fault("s", 0, PartitionFault::Unavailable);
        assert!(log.get_cursor("s", 0, StartPosition::TrimHorizon).await.is_err());

        log.clear_partition_fault("s", 0);
        assert!(log.get_cursor("s", 0, StartPosition::TrimHorizon).await.is_ok());

        Ok(())
    }

    #[tokio::test]
    async fn test_partition_len() -> Result<()> {
        let log = MemoryLog::new();
        log.create_or_describe("s", 3).await?;

        let entries: Vec<PutEntry> = (0..5u32)
            .map(|i| PutEntry::new("k", vec![i as u8]).with_partition(i % 2))
            .collect();
        log.put_batch("s", &entries).await?;

        assert_eq!(log.partition_len("s", 0)?, 3);
        assert_eq!(log.partition_len("s", 1)?, 2);
        assert_eq!(log.partition_len("s", 2)?, 0);
        assert_eq!(log.total_len("s")?, 5);
        assert!(log.partition_len("s", 3).is_err());
        assert!(log.partition_len("nope", 0).is_err());

        Ok(())
    }
}
