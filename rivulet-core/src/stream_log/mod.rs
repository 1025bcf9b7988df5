//! The partitioned, append-only log that sits between producer and consumer.
//!
//! `StreamLog` is the seam to the log service. A stream has a fixed number of partitions,
//! each one an independently ordered sequence of records. Records are routed by partition
//! key, readers move through a partition with opaque `Cursor`s.
//!
//! Two backends are provided:
//! - `MemoryLog`, in process, with fault injection for tests.
//! - `FileLog`, one file per partition under a directory, so producer and consumer can run
//!   as separate processes.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fnv::FnvHasher;
use serde::{Deserialize, Serialize};
use std::hash::Hasher;
use strum::{Display, EnumString};

pub mod file_log;
pub mod memory_log;

pub use file_log::FileLog;
pub use memory_log::{MemoryLog, PartitionFault};

/// Partition index inside a stream.
pub type PartitionId = u32;

/// Error kinds of the log service that callers may want to branch on.
///
/// They travel inside `anyhow::Error`, use `downcast_ref::<LogError>()` to inspect them.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("stream not found: {0}")]
    StreamNotFound(String),

    #[error("partition {partition} not found in stream {stream}")]
    PartitionNotFound {
        stream: String,
        partition: PartitionId,
    },

    #[error("partition {partition} of stream {stream} is unavailable")]
    Unavailable {
        stream: String,
        partition: PartitionId,
    },

    #[error("invalid cursor for partition {partition}: {reason}")]
    InvalidCursor {
        partition: PartitionId,
        reason: String,
    },

    #[error("fetch timed out after {millis} ms on partition {partition}")]
    Timeout { partition: PartitionId, millis: u64 },
}

/// Where a new cursor starts.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Display, EnumString, Deserialize, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum StartPosition {
    /// The oldest record still available.
    #[default]
    #[strum(to_string = "trim_horizon", serialize = "earliest")]
    TrimHorizon,

    /// Just after the newest record.
    Latest,
}

/// Partition layout of a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDescription {
    pub stream: String,
    pub partitions: Vec<PartitionId>,
    pub sealed: bool,
}

impl StreamDescription {
    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }
}

/// One record to append.
#[derive(Debug, Clone, PartialEq)]
pub struct PutEntry {
    pub partition_key: String,

    /// Bypass key routing. Used by tests and tools that need a fixed layout.
    pub explicit_partition: Option<PartitionId>,

    pub data: Vec<u8>,
}

impl PutEntry {
    pub fn new(partition_key: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            partition_key: partition_key.into(),
            explicit_partition: None,
            data,
        }
    }

    pub fn with_partition(mut self, partition: PartitionId) -> Self {
        self.explicit_partition = Some(partition);
        self
    }
}

/// Result of appending one record of a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum PutOutcome {
    Delivered {
        partition: PartitionId,
        sequence: u64,
    },
    Failed {
        error_code: String,
        message: String,
    },
}

impl PutOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, PutOutcome::Failed { .. })
    }
}

/// A record read back from a partition.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub partition: PartitionId,
    pub sequence: u64,
    pub partition_key: String,
    pub arrival: DateTime<Utc>,
    pub data: Vec<u8>,
}

/// Opaque read position inside one partition.
///
/// Only the backend that issued a cursor knows how to interpret it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    pub(crate) stream: String,
    pub(crate) partition: PartitionId,
    pub(crate) sequence: u64,
    pub(crate) offset: u64,
}

impl Cursor {
    pub fn partition(&self) -> PartitionId {
        self.partition
    }
}

/// Result of one fetch.
///
/// `next_cursor` is `None` once the partition is closed and fully read.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub records: Vec<LogRecord>,
    pub next_cursor: Option<Cursor>,
}

/// The log service.
#[async_trait]
pub trait StreamLog: Send + Sync {
    /// Create the stream with `partitions` partitions, or describe it if it already exists.
    ///
    /// The partition count of an existing stream is never changed.
    async fn create_or_describe(&self, stream: &str, partitions: usize) -> Result<StreamDescription>;

    /// Describe an existing stream.
    async fn describe(&self, stream: &str) -> Result<StreamDescription>;

    /// Append a batch. Outcomes are returned per record, in input order.
    async fn put_batch(&self, stream: &str, entries: &[PutEntry]) -> Result<Vec<PutOutcome>>;

    /// Get a cursor at `start` of `partition`.
    async fn get_cursor(
        &self,
        stream: &str,
        partition: PartitionId,
        start: StartPosition,
    ) -> Result<Cursor>;

    /// Read up to `limit` records at `cursor`.
    async fn fetch(&self, cursor: &Cursor, limit: usize) -> Result<FetchResult>;

    /// Close the stream for writes. Readers reach the end of every partition afterwards.
    async fn seal(&self, stream: &str) -> Result<()>;
}

/// Route a partition key to a partition with FNV-1a.
pub fn route_partition(partition_key: &str, partition_count: usize) -> PartitionId {
    if partition_count == 0 {
        return 0;
    }

    let mut hasher = FnvHasher::default();
    hasher.write(partition_key.as_bytes());

    (hasher.finish() % partition_count as u64) as PartitionId
}

/// Partition of `entry` in a stream of `partition_count` partitions.
pub(crate) fn target_partition(entry: &PutEntry, partition_count: usize) -> PartitionId {
    match entry.explicit_partition {
        Some(p) => p,
        None => route_partition(&entry.partition_key, partition_count),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_route_partition_is_deterministic() {
        for key in ["user_1", "user_2", "default", ""] {
            let p = route_partition(key, 4);
            assert!(p < 4);
            assert_eq!(p, route_partition(key, 4));
        }

        assert_eq!(route_partition("anything", 1), 0);
        assert_eq!(route_partition("anything", 0), 0);
    }

    #[test]
    fn test_route_partition_spreads_keys() {
        let mut seen = [0usize; 4];
        for i in 0..400 {
            seen[route_partition(&format!("user_{}", i), 4) as usize] += 1;
        }

        assert!(seen.iter().all(|&n| n > 0), "seen: {:?}", seen);
    }

    #[test]
    fn test_start_position_from_str() {
        assert_eq!(StartPosition::from_str("earliest").unwrap(), StartPosition::TrimHorizon);
        assert_eq!(StartPosition::from_str("trim_horizon").unwrap(), StartPosition::TrimHorizon);
        assert_eq!(StartPosition::from_str("latest").unwrap(), StartPosition::Latest);
        assert!(StartPosition::from_str("middle").is_err());
    }
}
