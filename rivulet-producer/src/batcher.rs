use rivulet_core::stream_log::PutEntry;

/// Accumulates records into delivery batches of at most `batch_size` entries.
pub struct Batcher {
    batch_size: usize,
    buffer: Vec<PutEntry>,
}

impl Batcher {
    pub fn new(batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);

        Self {
            batch_size,
            buffer: Vec::with_capacity(batch_size),
        }
    }

    /// Append one serialized record. Returns the full batch once it reaches `batch_size`.
    pub fn add(&mut self, data: Vec<u8>, partition_key: String) -> Option<Vec<PutEntry>> {
        self.buffer.push(PutEntry::new(partition_key, data));

        if self.buffer.len() >= self.batch_size {
            Some(self.take())
        } else {
            None
        }
    }

    /// Take whatever is buffered. `None` if nothing is.
    pub fn flush(&mut self) -> Option<Vec<PutEntry>> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(self.take())
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    fn take(&mut self) -> Vec<PutEntry> {
        std::mem::replace(&mut self.buffer, Vec::with_capacity(self.batch_size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_at_size() {
        let mut batcher = Batcher::new(3);

        assert!(batcher.add(b"1".to_vec(), "k1".to_string()).is_none());
        assert!(batcher.add(b"2".to_vec(), "k2".to_string()).is_none());

        let batch = batcher.add(b"3".to_vec(), "k1".to_string());
        assert!(batch.is_some());

        let batch = batch.unwrap_or_default();
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0].data, b"1".to_vec());
        assert_eq!(batch[2].partition_key, "k1");
        assert!(batcher.is_empty());
    }

    #[test]
    fn test_flush() {
        let mut batcher = Batcher::new(25);
        assert!(batcher.flush().is_none());

        for i in 0..7 {
            assert!(batcher.add(vec![i], "k".to_string()).is_none());
        }
        assert_eq!(batcher.len(), 7);

        let batch = batcher.flush().unwrap_or_default();
        assert_eq!(batch.len(), 7);
        assert!(batcher.flush().is_none());
    }
}
