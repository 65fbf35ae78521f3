// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! # Dedispersion Strategy
//!
//! The read-only plan consumed by the pipeline controller. Construction
//! validates every relationship the controller relies on, so the controller
//! itself never has to re-check plan consistency mid-chunk.

use crate::{ChunkTable, DmRange, FilterbankMetadata, Result, StrategyError};
use tracing::debug;

/// Complete, validated dedispersion plan
#[derive(Debug, Clone, PartialEq)]
pub struct DdtrStrategy {
    metadata: FilterbankMetadata,
    ranges: Vec<DmRange>,
    ndms: Vec<usize>,
    t_processed: ChunkTable,
    dm_shifts: Vec<f32>,
    max_shift: usize,
    max_ndms: usize,
}

impl DdtrStrategy {
    /// Build a plan from externally computed parts
    ///
    /// # Errors
    ///
    /// Returns the first inconsistency found between metadata, ranges,
    /// chunk table and shift table.
    pub fn new(
        metadata: FilterbankMetadata,
        ranges: Vec<DmRange>,
        t_processed: ChunkTable,
        dm_shifts: Vec<f32>,
        max_shift: usize,
    ) -> Result<Self> {
        metadata.validate()?;
        validate_ranges(&ranges)?;

        if t_processed.num_ranges() != ranges.len() {
            return Err(StrategyError::ChunkTableShape {
                expected: ranges.len(),
                actual: t_processed.num_ranges(),
            });
        }
        if t_processed.num_chunks() == 0 {
            return Err(StrategyError::NoChunks);
        }

        validate_shift_table(&dm_shifts, metadata.nchans)?;

        for (index, range) in ranges.iter().enumerate() {
            let required = required_shift(&dm_shifts, range);
            if required > max_shift {
                return Err(StrategyError::MaxShiftTooSmall {
                    range: index,
                    max_shift,
                    required,
                });
            }
        }

        for chunk in 0..t_processed.num_chunks() {
            let base = t_processed.get(0, chunk).unwrap_or(0);
            for (index, range) in ranges.iter().enumerate().skip(1) {
                let samples = t_processed.get(index, chunk).unwrap_or(0);
                let limit = base / range.bin_factor as usize;
                if samples > limit {
                    return Err(StrategyError::ChunkTooLarge {
                        range: index,
                        chunk,
                        samples,
                        limit,
                    });
                }
            }
        }

        let ndms: Vec<usize> = ranges.iter().map(DmRange::dm_count).collect();
        let max_ndms = ndms.iter().copied().max().unwrap_or(0);

        debug!(
            "[DDTR-STRATEGY] Plan built: {} ranges, {} chunks, max_shift={}, max_ndms={}",
            ranges.len(),
            t_processed.num_chunks(),
            max_shift,
            max_ndms
        );

        Ok(Self {
            metadata,
            ranges,
            ndms,
            t_processed,
            dm_shifts,
            max_shift,
            max_ndms,
        })
    }

    /// Plan evenly sized chunks over the whole observation
    ///
    /// The observation minus the maximum shift is split into chunks of at
    /// most `chunk_samples`, rounded down to a multiple of the largest bin
    /// factor. A trailing remainder shorter than one bin is dropped.
    pub fn uniform(
        metadata: FilterbankMetadata,
        ranges: Vec<DmRange>,
        dm_shifts: Vec<f32>,
        chunk_samples: usize,
    ) -> Result<Self> {
        metadata.validate()?;
        validate_ranges(&ranges)?;
        validate_shift_table(&dm_shifts, metadata.nchans)?;

        let max_shift = ranges
            .iter()
            .map(|range| required_shift(&dm_shifts, range))
            .max()
            .unwrap_or(0);
        if metadata.nsamples <= max_shift {
            return Err(StrategyError::ObservationTooShort {
                nsamples: metadata.nsamples,
                max_shift,
            });
        }

        let max_bin = ranges
            .iter()
            .map(|range| range.bin_factor as usize)
            .max()
            .unwrap_or(1);
        let chunk = (chunk_samples / max_bin) * max_bin;
        if chunk == 0 {
            return Err(StrategyError::NoChunks);
        }

        let mut remaining = metadata.nsamples - max_shift;
        let mut pieces = Vec::new();
        while remaining > 0 {
            let piece = (remaining.min(chunk) / max_bin) * max_bin;
            if piece == 0 {
                break;
            }
            pieces.push(piece);
            remaining -= piece;
        }
        if pieces.is_empty() {
            return Err(StrategyError::NoChunks);
        }

        let rows = ranges
            .iter()
            .map(|range| {
                pieces
                    .iter()
                    .map(|piece| piece / range.bin_factor as usize)
                    .collect()
            })
            .collect();
        let table = ChunkTable::from_rows(rows).ok_or(StrategyError::NoChunks)?;

        Self::new(metadata, ranges, table, dm_shifts, max_shift)
    }

    pub fn metadata(&self) -> &FilterbankMetadata {
        &self.metadata
    }

    /// Number of DM ranges
    pub fn range(&self) -> usize {
        self.ranges.len()
    }

    pub fn ranges(&self) -> &[DmRange] {
        &self.ranges
    }

    /// DM range record `index`
    ///
    /// # Panics
    /// Panics if `index >= self.range()`.
    pub fn dm(&self, index: usize) -> &DmRange {
        &self.ranges[index]
    }

    /// Trial count of range `index`
    pub fn ndms(&self, index: usize) -> usize {
        self.ndms.get(index).copied().unwrap_or(0)
    }

    pub fn ndms_data(&self) -> &[usize] {
        &self.ndms
    }

    pub fn max_ndms(&self) -> usize {
        self.max_ndms
    }

    pub fn t_processed(&self) -> &ChunkTable {
        &self.t_processed
    }

    pub fn num_chunks(&self) -> usize {
        self.t_processed.num_chunks()
    }

    pub fn dm_shifts(&self) -> &[f32] {
        &self.dm_shifts
    }

    pub fn max_shift(&self) -> usize {
        self.max_shift
    }

    /// Largest range-0 chunk; sizes the device input staging buffer
    pub fn chunk_capacity(&self) -> usize {
        self.t_processed.row(0).iter().copied().max().unwrap_or(0)
    }

    /// Raw samples the host stream must hold for a full run
    pub fn required_input_samples(&self) -> usize {
        (self.t_processed.range_total(0) + self.max_shift) * self.metadata.nchans
    }
}

fn validate_ranges(ranges: &[DmRange]) -> Result<()> {
    let first = ranges.first().ok_or(StrategyError::NoRanges)?;
    for (index, range) in ranges.iter().enumerate() {
        range.validate(index)?;
    }
    if first.bin_factor != 1 {
        return Err(StrategyError::BinFactorOrder {
            index: 0,
            bin_factor: first.bin_factor,
            previous: 1,
        });
    }
    for (index, pair) in ranges.windows(2).enumerate() {
        let (previous, current) = (pair[0].bin_factor, pair[1].bin_factor);
        if current != previous && current != previous * 2 {
            return Err(StrategyError::BinFactorOrder {
                index: index + 1,
                bin_factor: current,
                previous,
            });
        }
    }
    Ok(())
}

fn validate_shift_table(dm_shifts: &[f32], nchans: usize) -> Result<()> {
    if dm_shifts.len() != nchans {
        return Err(StrategyError::ShiftTableLength {
            expected: nchans,
            actual: dm_shifts.len(),
        });
    }
    if let Some(bad) = dm_shifts.iter().find(|s| !s.is_finite() || **s < 0.0) {
        return Err(StrategyError::InvalidMetadata(format!(
            "shift table entry {} must be finite and non-negative",
            bad
        )));
    }
    Ok(())
}

/// Delay in original samples of the highest DM trial of `range`
fn required_shift(dm_shifts: &[f32], range: &DmRange) -> usize {
    let largest = dm_shifts.iter().copied().fold(0.0f32, f32::max) as f64;
    (largest * range.high as f64).ceil() as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn metadata(nchans: usize, nsamples: usize) -> FilterbankMetadata {
        FilterbankMetadata {
            nchans,
            nbits: 8,
            tsamp: 0.001,
            nsamples,
            fch1: 1500.0,
            foff: -1.0,
        }
    }

    fn flat_shifts(nchans: usize, per_channel: f32) -> Vec<f32> {
        (0..nchans).map(|c| c as f32 * per_channel).collect()
    }

    #[test]
    fn test_new_accepts_consistent_plan() {
        let ranges = vec![DmRange::new(0.0, 4.0, 1.0, 1), DmRange::new(4.0, 12.0, 1.0, 2)];
        let table = ChunkTable::from_rows(vec![vec![100, 60], vec![50, 30]]).unwrap();
        let strategy =
            DdtrStrategy::new(metadata(4, 400), ranges, table, flat_shifts(4, 0.5), 18).unwrap();

        assert_eq!(strategy.range(), 2);
        assert_eq!(strategy.num_chunks(), 2);
        assert_eq!(strategy.ndms_data(), &[4, 8]);
        assert_eq!(strategy.max_ndms(), 8);
        assert_eq!(strategy.chunk_capacity(), 100);
        assert_eq!(strategy.required_input_samples(), (160 + 18) * 4);
    }

    #[test]
    fn test_first_range_must_be_unbinned() {
        let ranges = vec![DmRange::new(0.0, 4.0, 1.0, 2)];
        let table = ChunkTable::from_rows(vec![vec![50]]).unwrap();
        let err = DdtrStrategy::new(metadata(2, 200), ranges, table, vec![0.0, 1.0], 4).unwrap_err();
        assert!(matches!(err, StrategyError::BinFactorOrder { index: 0, .. }));
    }

    #[test]
    fn test_bin_factor_may_not_skip_or_decrease() {
        let table = ChunkTable::from_rows(vec![vec![64], vec![16]]).unwrap();
        let skip = vec![DmRange::new(0.0, 2.0, 1.0, 1), DmRange::new(2.0, 4.0, 1.0, 4)];
        assert!(matches!(
            DdtrStrategy::new(metadata(2, 200), skip, table, vec![0.0, 1.0], 4),
            Err(StrategyError::BinFactorOrder { index: 1, bin_factor: 4, previous: 1 })
        ));
    }

    #[test]
    fn test_max_shift_must_cover_ranges() {
        let ranges = vec![DmRange::new(0.0, 10.0, 1.0, 1)];
        let table = ChunkTable::from_rows(vec![vec![100]]).unwrap();
        let err =
            DdtrStrategy::new(metadata(2, 200), ranges, table, vec![0.0, 2.0], 5).unwrap_err();
        assert_eq!(
            err,
            StrategyError::MaxShiftTooSmall {
                range: 0,
                max_shift: 5,
                required: 20
            }
        );
    }

    #[test]
    fn test_binned_chunk_must_fit() {
        let ranges = vec![DmRange::new(0.0, 2.0, 1.0, 1), DmRange::new(2.0, 4.0, 1.0, 2)];
        let table = ChunkTable::from_rows(vec![vec![100], vec![51]]).unwrap();
        let err =
            DdtrStrategy::new(metadata(2, 200), ranges, table, vec![0.0, 1.0], 4).unwrap_err();
        assert!(matches!(err, StrategyError::ChunkTooLarge { range: 1, limit: 50, .. }));
    }

    #[test]
    fn test_shift_table_length_checked() {
        let ranges = vec![DmRange::new(0.0, 2.0, 1.0, 1)];
        let table = ChunkTable::from_rows(vec![vec![10]]).unwrap();
        let err = DdtrStrategy::new(metadata(3, 200), ranges, table, vec![0.0], 4).unwrap_err();
        assert_eq!(
            err,
            StrategyError::ShiftTableLength {
                expected: 3,
                actual: 1
            }
        );
    }

    #[test]
    fn test_uniform_splits_observation() {
        let ranges = vec![
            DmRange::new(0.0, 2.0, 1.0, 1),
            DmRange::new(2.0, 4.0, 1.0, 1),
            DmRange::new(4.0, 8.0, 1.0, 2),
            DmRange::new(8.0, 16.0, 2.0, 4),
        ];
        // max shift = ceil(3 * 0.5 * 16) = 24
        let strategy =
            DdtrStrategy::uniform(metadata(4, 1024), ranges, flat_shifts(4, 0.5), 300).unwrap();

        assert_eq!(strategy.max_shift(), 24);
        // 1000 usable samples in chunks of 300 (multiple of 4): 300, 300, 300, 100
        assert_eq!(strategy.num_chunks(), 4);
        assert_eq!(strategy.t_processed().row(0).to_vec(), vec![300, 300, 300, 100]);
        assert_eq!(strategy.t_processed().row(2).to_vec(), vec![150, 150, 150, 50]);
        assert_eq!(strategy.t_processed().row(3).to_vec(), vec![75, 75, 75, 25]);
    }

    #[test]
    fn test_uniform_rejects_short_observation() {
        let ranges = vec![DmRange::new(0.0, 100.0, 1.0, 1)];
        let err = DdtrStrategy::uniform(metadata(2, 50), ranges, vec![0.0, 1.0], 32).unwrap_err();
        assert!(matches!(err, StrategyError::ObservationTooShort { .. }));
    }

    proptest! {
        #[test]
        fn prop_uniform_covers_usable_samples(
            nsamples in 200usize..5000,
            chunk in 8usize..700,
            binned_ranges in 0usize..3,
        ) {
            let mut ranges = vec![DmRange::new(0.0, 4.0, 1.0, 1)];
            let mut bin = 1;
            for i in 0..binned_ranges {
                bin *= 2;
                let low = 4.0 * (i + 1) as f32;
                ranges.push(DmRange::new(low, low + 4.0, 1.0, bin));
            }
            let meta = metadata(4, nsamples);
            let strategy = DdtrStrategy::uniform(meta, ranges, flat_shifts(4, 0.25), chunk);
            if let Ok(strategy) = strategy {
                let usable = nsamples - strategy.max_shift();
                let covered = strategy.t_processed().range_total(0);
                prop_assert!(covered <= usable);
                prop_assert!(usable - covered < bin as usize);
                prop_assert!(strategy.required_input_samples() <= nsamples * 4);
            }
        }
    }
}
