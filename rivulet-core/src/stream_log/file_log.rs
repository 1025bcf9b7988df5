use anyhow::{anyhow, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use dashmap::DashMap;
use likely_stable::unlikely;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::{
    target_partition, Cursor, FetchResult, LogError, LogRecord, PartitionId, PutEntry, PutOutcome,
    StartPosition, StreamDescription, StreamLog,
};
use crate::error_bail;
use crate::record::parse_timestamp;

/// Meta file of a stream.
const META_FILENAME: &str = "stream.toml";

/// Empty marker file, its presence means the stream is closed for writes.
const SEALED_FILENAME: &str = "SEALED";

/// Partition file a writer appends to.
trait PartitionFile: Write {
    fn size(&self) -> io::Result<u64>;
    fn truncate(&mut self, len: u64) -> io::Result<()>;
}

impl PartitionFile for File {
    fn size(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }
}

/// Why a line could not be appended.
enum AppendError {
    /// Nothing of the line is left in the file.
    RolledBack(io::Error),

    /// Part of the line may still be in the file.
    Torn(io::Error),
}

/// Append one whole line or nothing.
fn append_line<F: PartitionFile>(file: &mut F, line: &[u8]) -> Result<(), AppendError> {
    let len = file.size().map_err(AppendError::RolledBack)?;

    if let Err(e) = file.write_all(line).and_then(|_| file.flush()) {
        return match file.truncate(len) {
            Ok(()) => Err(AppendError::RolledBack(e)),
            Err(truncate_err) => {
                error!(
                    "drop torn line failed, len: {}, error: {}",
                    len, truncate_err
                );
                Err(AppendError::Torn(e))
            }
        };
    }

    Ok(())
}

#[derive(Debug, Deserialize, Serialize)]
struct StreamMeta {
    partitions: usize,
    created_at: String,
}

/// Directory-backed partitioned log.
///
/// Layout under `root`:
///
/// ```text
/// <stream>/stream.toml            partition count
/// <stream>/partition-00000.log    one record per line
/// <stream>/SEALED                 present once the stream is closed
/// ```
///
/// Each line is `sequence \t arrival \t base64(partition_key) \t base64(data)`. A line is
/// only visible to readers once its trailing `\n` is written, so a reader racing a writer
/// never sees half a record.
///
/// Only one writer process per stream is supported. Readers may live in other processes.
pub struct FileLog {
    root: PathBuf,

    /// Next sequence number per partition, loaded lazily from the partition file.
    next_sequences: DashMap<(String, PartitionId), u64>,

    /// Serializes writers in this process.
    write_lock: Mutex<()>,
}

impl FileLog {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;

        Ok(Self {
            root,
            next_sequences: DashMap::new(),
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn stream_dir(&self, stream: &str) -> Result<PathBuf> {
        if unlikely(
            stream.is_empty() || stream.contains('/') || stream.contains('\\') || stream == ".." || stream == ".",
        ) {
            error_bail!("invalid stream name: {:?}", stream);
        }

        Ok(self.root.join(stream))
    }

    fn partition_path(dir: &Path, partition: PartitionId) -> PathBuf {
        dir.join(format!("partition-{:05}.log", partition))
    }

    fn read_meta(&self, stream: &str) -> Result<StreamMeta> {
        let path = self.stream_dir(stream)?.join(META_FILENAME);

        if !path.exists() {
            return Err(LogError::StreamNotFound(stream.to_string()).into());
        }

        let content = std::fs::read_to_string(&path)?;
        toml::from_str(&content).map_err(|e| anyhow!("invalid stream meta {:?}, error: {}", path, e))
    }

    fn is_sealed(dir: &Path) -> bool {
        dir.join(SEALED_FILENAME).exists()
    }

    fn description(&self, stream: &str, meta: &StreamMeta) -> Result<StreamDescription> {
        Ok(StreamDescription {
            stream: stream.to_string(),
            partitions: (0..meta.partitions as PartitionId).collect(),
            sealed: Self::is_sealed(&self.stream_dir(stream)?),
        })
    }

    fn check_partition(stream: &str, meta: &StreamMeta, partition: PartitionId) -> Result<()> {
        if partition as usize >= meta.partitions {
            return Err(LogError::PartitionNotFound {
                stream: stream.to_string(),
                partition,
            }
            .into());
        }

        Ok(())
    }

    /// Count complete lines of a partition file, returns `(lines, bytes)`.
    fn count_lines(path: &Path) -> Result<(u64, u64)> {
        if !path.exists() {
            return Ok((0, 0));
        }

        let mut reader = BufReader::new(File::open(path)?);
        let mut buf = Vec::new();
        let mut lines = 0;
        let mut bytes = 0;

        loop {
            buf.clear();
            let n = reader.read_until(b'\n', &mut buf)?;
            if n == 0 || buf.last() != Some(&b'\n') {
                break;
            }

            lines += 1;
            bytes += n as u64;
        }

        Ok((lines, bytes))
    }

    /// Next sequence of a partition. Loading it drops a torn tail left by a failed writer.
    fn next_sequence(&self, stream: &str, dir: &Path, partition: PartitionId) -> Result<u64> {
        let key = (stream.to_string(), partition);

        if let Some(seq) = self.next_sequences.get(&key) {
            return Ok(*seq);
        }

        let path = Self::partition_path(dir, partition);
        let (lines, bytes) = Self::count_lines(&path)?;

        if path.exists() {
            let len = std::fs::metadata(&path)?.len();

            if unlikely(len > bytes) {
                warn!(
                    "drop torn tail of partition file, path: {:?}, bytes: {}",
                    path,
                    len - bytes
                );
                OpenOptions::new().write(true).open(&path)?.set_len(bytes)?;
            }
        }

        self.next_sequences.insert(key, lines);

        Ok(lines)
    }

    fn encode_line(record: &LogRecord) -> String {
        format!(
            "{}\t{}\t{}\t{}\n",
            record.sequence,
            record.arrival.to_rfc3339(),
            STANDARD.encode(record.partition_key.as_bytes()),
            STANDARD.encode(&record.data)
        )
    }

    fn decode_line(partition: PartitionId, line: &str) -> Result<LogRecord> {
        let parts: Vec<&str> = line.trim_end_matches('\n').split('\t').collect();

        if parts.len() != 4 {
            error_bail!("invalid log line, fields: {}", parts.len());
        }

        let sequence = parts[0].parse::<u64>()?;
        let arrival = parse_timestamp(parts[1])?;
        let partition_key = String::from_utf8(STANDARD.decode(parts[2])?)?;
        let data = STANDARD.decode(parts[3])?;

        Ok(LogRecord {
            partition,
            sequence,
            partition_key,
            arrival,
            data,
        })
    }
}

#[async_trait]
impl StreamLog for FileLog {
    async fn create_or_describe(&self, stream: &str, partitions: usize) -> Result<StreamDescription> {
        if unlikely(partitions == 0) {
            error_bail!("partition count must be positive, stream: {}", stream);
        }

        match self.read_meta(stream) {
            Ok(meta) => return self.description(stream, &meta),
            Err(e) => match e.downcast_ref::<LogError>() {
                Some(LogError::StreamNotFound(_)) => {}
                _ => return Err(e),
            },
        }

        let dir = self.stream_dir(stream)?;
        std::fs::create_dir_all(&dir)?;

        for p in 0..partitions as PartitionId {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(Self::partition_path(&dir, p))?;
        }

        let meta = StreamMeta {
            partitions,
            created_at: Utc::now().to_rfc3339(),
        };
        std::fs::write(dir.join(META_FILENAME), toml::to_string(&meta)?)?;

        info!(
            "create file stream: {}, partitions: {}, dir: {:?}",
            stream, partitions, dir
        );

        self.description(stream, &meta)
    }

    async fn describe(&self, stream: &str) -> Result<StreamDescription> {
        let meta = self.read_meta(stream)?;
        self.description(stream, &meta)
    }

    async fn put_batch(&self, stream: &str, entries: &[PutEntry]) -> Result<Vec<PutOutcome>> {
        let meta = self.read_meta(stream)?;
        let dir = self.stream_dir(stream)?;

        let _guard = self
            .write_lock
            .lock()
            .map_err(|e| anyhow!("file log write lock poisoned: {}", e))?;

        if Self::is_sealed(&dir) {
            error_bail!("stream is sealed, cannot put records, stream: {}", stream);
        }

        let mut files: HashMap<PartitionId, File> = HashMap::new();
        let mut broken: HashSet<PartitionId> = HashSet::new();
        let mut outcomes = Vec::with_capacity(entries.len());

        for entry in entries {
            let partition = target_partition(entry, meta.partitions);

            if let Err(e) = Self::check_partition(stream, &meta, partition) {
                outcomes.push(PutOutcome::Failed {
                    error_code: "InvalidArgument".to_string(),
                    message: e.to_string(),
                });
                continue;
            }

            if unlikely(broken.contains(&partition)) {
                outcomes.push(PutOutcome::Failed {
                    error_code: "IoError".to_string(),
                    message: format!("partition {} has a torn line", partition),
                });
                continue;
            }

            let sequence = self.next_sequence(stream, &dir, partition)?;

            if !files.contains_key(&partition) {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(Self::partition_path(&dir, partition))?;
                files.insert(partition, file);
            }

            let record = LogRecord {
                partition,
                sequence,
                partition_key: entry.partition_key.clone(),
                arrival: Utc::now(),
                data: entry.data.clone(),
            };

            let written = match files.get_mut(&partition) {
                Some(file) => append_line(file, Self::encode_line(&record).as_bytes()),
                None => Err(AppendError::RolledBack(io::Error::new(
                    io::ErrorKind::NotFound,
                    "partition file not open",
                ))),
            };

            match written {
                Ok(_) => {
                    self.next_sequences
                        .insert((stream.to_string(), partition), sequence + 1);
                    outcomes.push(PutOutcome::Delivered {
                        partition,
                        sequence,
                    });
                }
                Err(err) => {
                    let e = match err {
                        AppendError::RolledBack(e) => e,
                        AppendError::Torn(e) => {
                            // Reloading the sequence drops the torn tail.
                            broken.insert(partition);
                            files.remove(&partition);
                            self.next_sequences.remove(&(stream.to_string(), partition));
                            e
                        }
                    };

                    error!(
                        "write record failed, stream: {}, partition: {}, error: {}",
                        stream, partition, e
                    );
                    outcomes.push(PutOutcome::Failed {
                        error_code: "IoError".to_string(),
                        message: e.to_string(),
                    });
                }
            }
        }

        for (_, file) in files.iter_mut() {
            file.flush()?;
        }

        Ok(outcomes)
    }

    async fn get_cursor(
        &self,
        stream: &str,
        partition: PartitionId,
        start: StartPosition,
    ) -> Result<Cursor> {
        let meta = self.read_meta(stream)?;
        Self::check_partition(stream, &meta, partition)?;

        let (sequence, offset) = match start {
            StartPosition::TrimHorizon => (0, 0),
            StartPosition::Latest => {
                Self::count_lines(&Self::partition_path(&self.stream_dir(stream)?, partition))?
            }
        };

        Ok(Cursor {
            stream: stream.to_string(),
            partition,
            sequence,
            offset,
        })
    }

    async fn fetch(&self, cursor: &Cursor, limit: usize) -> Result<FetchResult> {
        let dir = self.stream_dir(&cursor.stream)?;
        let path = Self::partition_path(&dir, cursor.partition);

        if !path.exists() {
            return Err(LogError::PartitionNotFound {
                stream: cursor.stream.clone(),
                partition: cursor.partition,
            }
            .into());
        }

        // Check before reading, no record can be appended after sealing.
        let sealed = Self::is_sealed(&dir);

        let mut file = File::open(&path)?;
        let file_len = file.metadata()?.len();

        if unlikely(cursor.offset > file_len) {
            return Err(LogError::InvalidCursor {
                partition: cursor.partition,
                reason: format!("offset {} beyond file length {}", cursor.offset, file_len),
            }
            .into());
        }

        file.seek(SeekFrom::Start(cursor.offset))?;
        let mut reader = BufReader::new(file);

        let mut records = Vec::with_capacity(limit.min(1024));
        let mut offset = cursor.offset;
        let mut sequence = cursor.sequence;
        let mut buf = Vec::new();
        let mut torn = false;

        while records.len() < limit {
            buf.clear();
            let n = reader.read_until(b'\n', &mut buf)?;

            // End of file, or a line still being written.
            if n == 0 || buf.last() != Some(&b'\n') {
                torn = n > 0;
                break;
            }

            offset += n as u64;
            sequence += 1;

            match std::str::from_utf8(&buf)
                .map_err(anyhow::Error::from)
                .and_then(|line| Self::decode_line(cursor.partition, line))
            {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!(
                        "skip corrupted log line, stream: {}, partition: {}, offset: {}, error: {}",
                        cursor.stream, cursor.partition, offset, e
                    );
                }
            }
        }

        // Nothing is written after sealing, so a torn tail stays torn.
        if unlikely(sealed && torn) {
            warn!(
                "sealed partition ends with a torn line, stream: {}, partition: {}, offset: {}",
                cursor.stream, cursor.partition, offset
            );
        }

        let next_cursor = if sealed && (offset >= file_len || torn) {
            None
        } else {
            Some(Cursor {
                stream: cursor.stream.clone(),
                partition: cursor.partition,
                sequence,
                offset,
            })
        };

        Ok(FetchResult {
            records,
            next_cursor,
        })
    }

    async fn seal(&self, stream: &str) -> Result<()> {
        self.read_meta(stream)?;

        let _guard = self
            .write_lock
            .lock()
            .map_err(|e| anyhow!("file log write lock poisoned: {}", e))?;

        File::create(self.stream_dir(stream)?.join(SEALED_FILENAME))?;

        info!("file stream sealed: {}", stream);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::setup_log;

    #[tokio::test]
    async fn test_file_log_roundtrip() -> Result<()> {
        setup_log();

        let dir = tempfile::tempdir()?;
        let log = FileLog::new(dir.path())?;

        let desc = log.create_or_describe("reviews", 2).await?;
        assert_eq!(desc.partition_count(), 2);
        assert!(!desc.sealed);

        let entries: Vec<PutEntry> = (0..6)
            .map(|i| PutEntry::new("owner", format!("{{\"i\":{}}}", i).into_bytes()).with_partition(1))
            .collect();
        let outcomes = log.put_batch("reviews", &entries).await?;
        assert!(outcomes.iter().all(|o| !o.is_failed()));

        let cursor = log.get_cursor("reviews", 1, StartPosition::TrimHorizon).await?;
        let first = log.fetch(&cursor, 4).await?;
        assert_eq!(first.records.len(), 4);
        assert_eq!(first.records[3].sequence, 3);
        assert_eq!(first.records[0].partition_key, "owner");

        log.seal("reviews").await?;

        let next = first.next_cursor.expect("not at end yet");
        let second = log.fetch(&next, 4).await?;
        assert_eq!(second.records.len(), 2);
        assert_eq!(second.records[1].data, b"{\"i\":5}".to_vec());
        assert!(second.next_cursor.is_none());

        Ok(())
    }

    #[tokio::test]
    async fn test_file_log_reopen_keeps_sequences() -> Result<()> {
        let dir = tempfile::tempdir()?;

        {
            let log = FileLog::new(dir.path())?;
            log.create_or_describe("s", 1).await?;
            log.put_batch("s", &[PutEntry::new("k", b"a".to_vec())]).await?;
        }

        let log = FileLog::new(dir.path())?;
        let desc = log.create_or_describe("s", 5).await?;
        assert_eq!(desc.partition_count(), 1);

        let outcomes = log.put_batch("s", &[PutEntry::new("k", b"b".to_vec())]).await?;
        assert_eq!(
            outcomes[0],
            PutOutcome::Delivered {
                partition: 0,
                sequence: 1
            }
        );

        let latest = log.get_cursor("s", 0, StartPosition::Latest).await?;
        let res = log.fetch(&latest, 10).await?;
        assert!(res.records.is_empty());
        assert!(res.next_cursor.is_some());

        Ok(())
    }

    #[tokio::test]
    async fn test_file_log_missing_stream() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let log = FileLog::new(dir.path())?;

        let err = log.describe("nope").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LogError>(),
            Some(LogError::StreamNotFound(_))
        ));

        assert!(log.create_or_describe("../escape", 1).await.is_err());

        Ok(())
    }

    #[tokio::test]
    async fn test_file_log_partial_line_not_visible() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let log = FileLog::new(dir.path())?;
        log.create_or_describe("s", 1).await?;
        log.put_batch("s", &[PutEntry::new("k", b"a".to_vec())]).await?;

        // Simulate a writer in the middle of a line.
        let path = FileLog::partition_path(&dir.path().join("s"), 0);
        let mut file = OpenOptions::new().append(true).open(&path)?;
        file.write_all(b"1\t2025-01-01T00:00:00Z\taw==")?;

        let cursor = log.get_cursor("s", 0, StartPosition::TrimHorizon).await?;
        let res = log.fetch(&cursor, 10).await?;

        assert_eq!(res.records.len(), 1);
        assert!(res.next_cursor.is_some());

        Ok(())
    }

    #[tokio::test]
    async fn test_sealed_partition_with_torn_tail_closes() -> Result<()> {
        setup_log();

        let dir = tempfile::tempdir()?;
        let log = FileLog::new(dir.path())?;
        log.create_or_describe("s", 1).await?;
        log.put_batch("s", &[PutEntry::new("k", b"a".to_vec())]).await?;

        let path = FileLog::partition_path(&dir.path().join("s"), 0);
        let mut file = OpenOptions::new().append(true).open(&path)?;
        file.write_all(b"1\t2025")?;

        log.seal("s").await?;

        let cursor = log.get_cursor("s", 0, StartPosition::TrimHorizon).await?;
        let res = log.fetch(&cursor, 10).await?;

        assert_eq!(res.records.len(), 1);
        assert!(res.next_cursor.is_none());

        Ok(())
    }

    #[tokio::test]
    async fn test_writer_drops_torn_tail_on_load() -> Result<()> {
        setup_log();

        let dir = tempfile::tempdir()?;

        {
            let log = FileLog::new(dir.path())?;
            log.create_or_describe("s", 1).await?;
            log.put_batch("s", &[PutEntry::new("k", b"a".to_vec())]).await?;
        }

        // Left behind by a writer that died mid line.
        let path = FileLog::partition_path(&dir.path().join("s"), 0);
        let mut file = OpenOptions::new().append(true).open(&path)?;
        file.write_all(b"1\t2025-01-01T00:00:00Z\taw==")?;

        let log = FileLog::new(dir.path())?;
        let outcomes = log.put_batch("s", &[PutEntry::new("k", b"b".to_vec())]).await?;
        assert_eq!(
            outcomes[0],
            PutOutcome::Delivered {
                partition: 0,
                sequence: 1
            }
        );

        log.seal("s").await?;

        let cursor = log.get_cursor("s", 0, StartPosition::TrimHorizon).await?;
        let res = log.fetch(&cursor, 10).await?;

        let data: Vec<Vec<u8>> = res.records.iter().map(|r| r.data.clone()).collect();
        assert_eq!(data, vec![b"a".to_vec(), b"b".to_vec()]);
        assert_eq!(res.records[1].sequence, 1);
        assert!(res.next_cursor.is_none());

        Ok(())
    }

    /// In-memory partition file that fails once `room` bytes are written.
    struct ShortFile {
        buf: Vec<u8>,
        room: usize,
        truncate_fails: bool,
    }

    impl Write for ShortFile {
        fn write(&mut self, data: &[u8]) -> io::Result<usize> {
            if self.room == 0 {
                return Err(io::Error::new(io::ErrorKind::Other, "disk full"));
            }

            let n = data.len().min(self.room);
            self.buf.extend_from_slice(&data[..n]);
            self.room -= n;

            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl PartitionFile for ShortFile {
        fn size(&self) -> io::Result<u64> {
            Ok(self.buf.len() as u64)
        }

        fn truncate(&mut self, len: u64) -> io::Result<()> {
            if self.truncate_fails {
                return Err(io::Error::new(io::ErrorKind::Other, "read only"));
            }

            self.buf.truncate(len as usize);
            Ok(())
        }
    }

    #[test]
    fn test_failed_append_leaves_no_partial_line() {
        let mut file = ShortFile {
            buf: Vec::new(),
            room: 6,
            truncate_fails: false,
        };

        assert!(append_line(&mut file, b"abc\n").is_ok());
        assert!(matches!(
            append_line(&mut file, b"defgh\n"),
            Err(AppendError::RolledBack(_))
        ));
        assert_eq!(file.buf, b"abc\n".to_vec());

        file.room = 100;
        assert!(append_line(&mut file, b"ij\n").is_ok());
        assert_eq!(file.buf, b"abc\nij\n".to_vec());

        file.room = 1;
        file.truncate_fails = true;
        assert!(matches!(
            append_line(&mut file, b"kl\n"),
            Err(AppendError::Torn(_))
        ));
    }
}
