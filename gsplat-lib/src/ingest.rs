//! Incremental ingest of the canonical binary stream.
//!
//! Bytes arrive in arbitrary-sized transport chunks; the assembler carries an
//! undecoded backlog across reads and slices out whole-row-aligned prefixes
//! once enough rows have accumulated to be worth a packer flush.

use crate::pack::QuantizedStore;
use crate::structures::{rows_from_bytes, SplatRow, UploadRect, ROW_LENGTH};

/// Progress and data events emitted while a source streams in.
#[derive(Debug)]
pub enum IngestEvent<'a> {
    /// Download progress, throttled to >1 % deltas.
    Progress {
        bytes_downloaded: u64,
        total_bytes: u64,
    },
    /// A chunk of rows was packed; `rects` are the texture sub-regions the
    /// renderer must re-upload from the store.
    Packed {
        store: &'a QuantizedStore,
        rects: Vec<UploadRect>,
    },
    /// The terminal flush is done and the store is complete.
    Loaded,
}

/// Accumulates transport chunks and hands out whole-row-aligned prefixes.
pub(crate) struct ChunkAssembler {
    backlog: Vec<u8>,
    flush_threshold: usize,
}

impl ChunkAssembler {
    pub fn new(chunk_rows: usize) -> Self {
        Self {
            backlog: Vec::new(),
            flush_threshold: ROW_LENGTH * chunk_rows,
        }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.backlog.extend_from_slice(bytes);
    }

    /// Takes the largest whole-row prefix of the backlog, carrying any
    /// unaligned tail forward. Unless `flush` is set, nothing is taken until
    /// the backlog exceeds the configured threshold.
    pub fn take_rows(&mut self, flush: bool) -> Vec<SplatRow> {
        if !flush && self.backlog.len() <= self.flush_threshold {
            return Vec::new();
        }
        let aligned = self.backlog.len() / ROW_LENGTH * ROW_LENGTH;
        if aligned == 0 {
            return Vec::new();
        }
        let rows = rows_from_bytes(&self.backlog[..aligned]);
        self.backlog.drain(..aligned);
        rows
    }

    /// Bytes that never formed a complete row.
    pub fn leftover_bytes(&self) -> usize {
        self.backlog.len()
    }
}

/// Reports download percentage only when it has advanced by more than 1 %.
pub(crate) struct ProgressThrottle {
    total_bytes: u64,
    last_percent: f64,
}

impl ProgressThrottle {
    pub fn new(total_bytes: u64) -> Self {
        Self {
            total_bytes,
            last_percent: 0.0,
        }
    }

    pub fn should_report(&mut self, bytes_downloaded: u64) -> bool {
        if self.total_bytes == 0 {
            return false;
        }
        let percent = bytes_downloaded as f64 / self.total_bytes as f64 * 100.0;
        if percent - self.last_percent > 1.0 {
            self.last_percent = percent;
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structures::rows_to_bytes;

    fn test_rows(n: usize) -> Vec<SplatRow> {
        (0..n)
            .map(|i| SplatRow {
                position: [i as f32, 0.0, 1.0],
                scale: [0.05; 3],
                color: [255, 255, 255, 255],
                rotation: [255, 128, 128, 128],
            })
            .collect()
    }

    #[test]
    fn holds_back_until_threshold_exceeded() {
        let mut assembler = ChunkAssembler::new(4);
        assembler.extend(&rows_to_bytes(&test_rows(4)));
        assert!(assembler.take_rows(false).is_empty());

        assembler.extend(&rows_to_bytes(&test_rows(1)));
        assert_eq!(assembler.take_rows(false).len(), 5);
        assert_eq!(assembler.leftover_bytes(), 0);
    }

    #[test]
    fn carries_unaligned_tail_forward() {
        let mut assembler = ChunkAssembler::new(1);
        let bytes = rows_to_bytes(&test_rows(3));
        assembler.extend(&bytes[..ROW_LENGTH * 2 + 10]);
        assert_eq!(assembler.take_rows(false).len(), 2);
        assert_eq!(assembler.leftover_bytes(), 10);

        assembler.extend(&bytes[ROW_LENGTH * 2 + 10..]);
        assert_eq!(assembler.take_rows(true).len(), 1);
        assert_eq!(assembler.leftover_bytes(), 0);
    }

    #[test]
    fn flush_takes_partial_backlog_but_not_sub_row_tail() {
        let mut assembler = ChunkAssembler::new(100);
        let mut bytes = rows_to_bytes(&test_rows(2));
        bytes.extend_from_slice(&[7; 5]);
        assembler.extend(&bytes);

        assert_eq!(assembler.take_rows(true).len(), 2);
        assert_eq!(assembler.leftover_bytes(), 5);
        assert!(assembler.take_rows(true).is_empty());
    }

    #[test]
    fn split_points_do_not_change_output() {
        let rows = test_rows(9);
        let bytes = rows_to_bytes(&rows);

        let mut whole = ChunkAssembler::new(2);
        whole.extend(&bytes);
        let mut collected_whole = whole.take_rows(false);
        collected_whole.extend(whole.take_rows(true));

        let mut pieces = ChunkAssembler::new(2);
        let mut collected_pieces = Vec::new();
        for chunk in bytes.chunks(23) {
            pieces.extend(chunk);
            collected_pieces.extend(pieces.take_rows(false));
        }
        collected_pieces.extend(pieces.take_rows(true));

        assert_eq!(collected_whole, rows);
        assert_eq!(collected_pieces, rows);
    }

    #[test]
    fn throttle_reports_on_whole_percent_steps() {
        let mut throttle = ProgressThrottle::new(1000);
        assert!(!throttle.should_report(10));
        assert!(throttle.should_report(11));
        assert!(!throttle.should_report(20));
        assert!(throttle.should_report(1000));
    }
}
