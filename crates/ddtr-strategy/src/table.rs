// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Per-range, per-chunk sample counts

use ndarray::{Array2, ArrayView1};

/// Samples processed per `(range, chunk)`
///
/// Rows are DM ranges, columns are time chunks. Counts for binned ranges are
/// expressed at that range's (reduced) time resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkTable {
    counts: Array2<usize>,
}

impl ChunkTable {
    /// Build from one row per range; rows must have equal length
    pub fn from_rows(rows: Vec<Vec<usize>>) -> Option<Self> {
        let num_ranges = rows.len();
        let num_chunks = rows.first().map(Vec::len).unwrap_or(0);
        if rows.iter().any(|row| row.len() != num_chunks) {
            return None;
        }
        let flat: Vec<usize> = rows.into_iter().flatten().collect();
        Array2::from_shape_vec((num_ranges, num_chunks), flat)
            .ok()
            .map(|counts| Self { counts })
    }

    pub fn from_array(counts: Array2<usize>) -> Self {
        Self { counts }
    }

    pub fn num_ranges(&self) -> usize {
        self.counts.nrows()
    }

    pub fn num_chunks(&self) -> usize {
        self.counts.ncols()
    }

    /// Samples processed for `range` in `chunk`, `None` if out of bounds
    pub fn get(&self, range: usize, chunk: usize) -> Option<usize> {
        self.counts.get((range, chunk)).copied()
    }

    pub fn row(&self, range: usize) -> ArrayView1<'_, usize> {
        self.counts.row(range)
    }

    /// Total samples a range produces over all chunks
    pub fn range_total(&self, range: usize) -> usize {
        if range >= self.num_ranges() {
            return 0;
        }
        self.counts.row(range).sum()
    }

    pub fn as_array(&self) -> &Array2<usize> {
        &self.counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_rows() {
        let table = ChunkTable::from_rows(vec![vec![100, 100, 40], vec![50, 50, 20]]).unwrap();
        assert_eq!(table.num_ranges(), 2);
        assert_eq!(table.num_chunks(), 3);
        assert_eq!(table.get(1, 2), Some(20));
        assert_eq!(table.get(2, 0), None);
        assert_eq!(table.get(0, 3), None);
        assert_eq!(table.range_total(0), 240);
        assert_eq!(table.range_total(1), 120);
        assert_eq!(table.range_total(7), 0);
    }

    #[test]
    fn test_ragged_rows_rejected() {
        assert!(ChunkTable::from_rows(vec![vec![1, 2], vec![3]]).is_none());
    }
}
