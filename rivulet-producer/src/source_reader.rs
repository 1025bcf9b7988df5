use anyhow::{anyhow, Result};
use log::{error, warn};
use std::collections::VecDeque;
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::Path;

use rivulet_core::error_bail;
use rivulet_core::record::Review;

/// Where the bytes come from.
enum Source {
    File(String),
    Reader(Box<dyn Read + Send>),
}

/// Reads newline-delimited lines from a sequence of byte sources, chunk by chunk.
///
/// The bulk source may be far larger than memory, so it is read in fixed size chunks. A line
/// can be cut by a chunk boundary. The tail after the last `\n` of a chunk is kept in `carry`
/// and prepended to the next chunk before splitting again, so every line comes out whole no
/// matter where the cuts fall. Multi-byte chars cut in half are rebuilt the same way, since
/// lines are only decoded once complete.
///
/// The last line of a source does not need a trailing `\n`.
pub struct SourceReader {
    sources: VecDeque<Source>,

    /// Name of the current source, for logs.
    cur_name: String,

    reader: Option<Box<dyn Read + Send>>,

    chunk: Vec<u8>,

    /// Trailing incomplete line of the previous chunk.
    carry: Vec<u8>,

    /// Complete lines not yet returned.
    pending: VecDeque<String>,
}

impl SourceReader {
    /// Read the files in order.
    pub fn new(filenames: &[String], chunk_size: usize) -> Result<Self> {
        // Check if all files exist
        for filename in filenames {
            if !Path::new(filename).exists() {
                error_bail!("File not found: {}", filename.clone());
            }
        }

        Ok(Self::with_sources(
            filenames.iter().map(|f| Source::File(f.clone())).collect(),
            chunk_size,
        ))
    }

    /// Read from an arbitrary byte stream, such as stdin.
    pub fn from_reader(reader: Box<dyn Read + Send>, chunk_size: usize) -> Self {
        Self::with_sources(VecDeque::from(vec![Source::Reader(reader)]), chunk_size)
    }

    fn with_sources(sources: VecDeque<Source>, chunk_size: usize) -> Self {
        Self {
            sources,
            cur_name: String::new(),
            reader: None,
            chunk: vec![0; chunk_size.max(1)],
            carry: Vec::new(),
            pending: VecDeque::new(),
        }
    }

    fn open_next_source(&mut self) -> Result<()> {
        match self.sources.pop_front() {
            Some(Source::File(filename)) => {
                let file = File::open(Path::new(&filename))
                    .map_err(|e| anyhow!("open source failed, filename: {}, error: {}", filename, e))?;

                self.cur_name = filename;
                self.reader = Some(Box::new(file));
            }
            Some(Source::Reader(reader)) => {
                self.cur_name = "<reader>".to_string();
                self.reader = Some(reader);
            }
            None => {
                self.reader = None;
            }
        }

        Ok(())
    }

    fn push_line(&mut self, mut line: &[u8]) {
        if line.last() == Some(&b'\r') {
            line = &line[..line.len() - 1];
        }

        self.pending
            .push_back(String::from_utf8_lossy(line).into_owned());
    }

    /// Move every complete line of `carry` into `pending`.
    fn split_carry(&mut self) {
        let last_newline = match self.carry.iter().rposition(|b| *b == b'\n') {
            Some(pos) => pos,
            None => return,
        };

        let rest = self.carry.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.carry, rest);

        for line in complete[..complete.len() - 1].split(|b| *b == b'\n') {
            self.push_line(line);
        }
    }

    /// End of the current source, the carry is the last line.
    fn finish_source(&mut self) {
        if !self.carry.is_empty() {
            let last = std::mem::take(&mut self.carry);
            self.push_line(&last);
        }

        self.reader = None;
    }
}

impl Iterator for SourceReader {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(line) = self.pending.pop_front() {
                return Some(Ok(line));
            }

            if self.reader.is_none() {
                if self.sources.is_empty() {
                    return None;
                }

                if let Err(e) = self.open_next_source() {
                    return Some(Err(e));
                }

                continue;
            }

            let read = match self.reader.as_mut() {
                Some(reader) => reader.read(&mut self.chunk),
                None => continue,
            };

            match read {
                Ok(0) => self.finish_source(),
                Ok(n) => {
                    self.carry.extend_from_slice(&self.chunk[..n]);
                    self.split_carry();
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    error!(
                        "read source failed, skip the rest of it, source: {}, dropped bytes: {}, error: {}",
                        self.cur_name,
                        self.carry.len(),
                        e
                    );

                    self.carry.clear();
                    self.reader = None;

                    return Some(Err(e.into()));
                }
            }
        }
    }
}

/// Parses lines into reviews.
///
/// Blank lines are ignored, malformed lines are skipped with a warning. Stops after
/// `max_records` reviews when a cap is set.
pub struct ReviewSource<T: Iterator<Item = Result<String>>> {
    lines: T,
    max_records: Option<usize>,
    emitted: usize,
    skipped: usize,
    line_no: usize,
}

impl<T: Iterator<Item = Result<String>>> ReviewSource<T> {
    pub fn new(lines: T, max_records: Option<usize>) -> Self {
        Self {
            lines,
            max_records,
            emitted: 0,
            skipped: 0,
            line_no: 0,
        }
    }

    /// Number of malformed lines skipped so far.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    pub fn emitted(&self) -> usize {
        self.emitted
    }
}

impl<T: Iterator<Item = Result<String>>> Iterator for ReviewSource<T> {
    type Item = Review;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(max) = self.max_records {
            if self.emitted >= max {
                return None;
            }
        }

        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(e) => {
                    error!("Failed to read line, error: {}", e);
                    continue;
                }
            };

            self.line_no += 1;

            if line.trim().is_empty() {
                continue;
            }

            match Review::from_json_line(&line) {
                Ok(review) => {
                    self.emitted += 1;
                    return Some(review);
                }
                Err(e) => {
                    self.skipped += 1;
                    warn!("Skipping invalid JSON line {}: {}", self.line_no, e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rivulet_core::tool::setup_log;
    use std::io::Cursor;

    const CONTENT: &str = concat!(
        "{\"review_id\":\"a\",\"text\":\"Crème brûlée was perfect\",\"stars\":5,\"user_id\":\"u1\"}\n",
        "\n",
        "{\"review_id\":\"b\",\"text\":\"meh\",\"stars\":3,\"user_id\":\"u2\"}\r\n",
        "{broken\n",
        "{\"review_id\":\"c\",\"text\":\"awful 😡 service\",\"stars\":1,\"user_id\":\"u3\"}",
    );

    fn read_all(reader: SourceReader) -> Vec<Review> {
        ReviewSource::new(reader, None).collect()
    }

    #[test]
    fn test_read_lines() {
        setup_log();

        let reader = SourceReader::from_reader(Box::new(Cursor::new(CONTENT.as_bytes().to_vec())), 4096);
        let lines: Vec<String> = reader.filter_map(|l| l.ok()).collect();

        assert_eq!(lines.len(), 5);
        assert_eq!(lines[1], "");
        assert!(lines[2].ends_with('}'));
        assert_eq!(lines[3], "{broken");
    }

    #[test]
    fn test_skip_malformed() {
        setup_log();

        let reader = SourceReader::from_reader(Box::new(Cursor::new(CONTENT.as_bytes().to_vec())), 4096);
        let mut source = ReviewSource::new(reader, None);
        let ids: Vec<String> = source.by_ref().map(|r| r.review_id).collect();

        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(source.skipped(), 1);
        assert_eq!(source.emitted(), 3);
    }

    #[test]
    fn test_every_chunk_size_gives_same_records() {
        setup_log();

        let whole = read_all(SourceReader::from_reader(
            Box::new(Cursor::new(CONTENT.as_bytes().to_vec())),
            1 << 20,
        ));

        for chunk_size in 1..CONTENT.len() + 2 {
            let split = read_all(SourceReader::from_reader(
                Box::new(Cursor::new(CONTENT.as_bytes().to_vec())),
                chunk_size,
            ));

            assert_eq!(split, whole, "chunk_size: {}", chunk_size);
        }
    }

    #[test]
    fn test_split_at_every_offset() {
        setup_log();

        let bytes = CONTENT.as_bytes();
        let whole = read_all(SourceReader::from_reader(Box::new(Cursor::new(bytes.to_vec())), 64));

        for offset in 0..=bytes.len() {
            let (a, b) = bytes.split_at(offset);
            let reader = Cursor::new(a.to_vec()).chain(Cursor::new(b.to_vec()));
            let split = read_all(SourceReader::from_reader(Box::new(reader), 64));

            assert_eq!(split, whole, "offset: {}", offset);
        }
    }

    #[test]
    fn test_max_records() {
        let reader = SourceReader::from_reader(Box::new(Cursor::new(CONTENT.as_bytes().to_vec())), 7);
        let reviews: Vec<Review> = ReviewSource::new(reader, Some(2)).collect();

        assert_eq!(reviews.len(), 2);
        assert_eq!(reviews[1].review_id, "b");
    }

    #[test]
    fn test_missing_file() {
        assert!(SourceReader::new(&["no/such/file.json".to_string()], 16).is_err());
    }

    #[test]
    fn test_multiple_files() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let f1 = dir.path().join("1.json");
        let f2 = dir.path().join("2.json");

        // The first file has no trailing newline, it must not merge with the second one.
        std::fs::write(&f1, "{\"review_id\":\"x\"}")?;
        std::fs::write(&f2, "{\"review_id\":\"y\"}\n{\"review_id\":\"z\"}\n")?;

        let filenames = vec![
            f1.to_string_lossy().to_string(),
            f2.to_string_lossy().to_string(),
        ];
        let reader = SourceReader::new(&filenames, 5)?;
        let ids: Vec<String> = ReviewSource::new(reader, None).map(|r| r.review_id).collect();

        assert_eq!(ids, vec!["x", "y", "z"]);

        Ok(())
    }
}
