// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Error types for plan construction

/// Reasons a plan is rejected
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StrategyError {
    #[error("Plan has no DM ranges")]
    NoRanges,

    #[error("Plan has no time chunks")]
    NoChunks,

    #[error("Invalid metadata: {0}")]
    InvalidMetadata(String),

    #[error("Invalid DM range {index}: {reason}")]
    InvalidRange { index: usize, reason: String },

    #[error(
        "Bin factor of range {index} is {bin_factor}, previous range uses {previous}: \
         bin factors must be non-decreasing and may only double between ranges"
    )]
    BinFactorOrder {
        index: usize,
        bin_factor: u32,
        previous: u32,
    },

    #[error("Chunk table has {actual} rows, expected one per DM range ({expected})")]
    ChunkTableShape { expected: usize, actual: usize },

    #[error(
        "Chunk {chunk} of range {range} processes {samples} samples, \
         more than the binned range-0 chunk allows ({limit})"
    )]
    ChunkTooLarge {
        range: usize,
        chunk: usize,
        samples: usize,
        limit: usize,
    },

    #[error("Shift table has {actual} entries, expected one per channel ({expected})")]
    ShiftTableLength { expected: usize, actual: usize },

    #[error("Max shift {max_shift} is smaller than the delay of range {range} ({required} samples)")]
    MaxShiftTooSmall {
        range: usize,
        max_shift: usize,
        required: usize,
    },

    #[error("Observation too short: {nsamples} samples cannot cover max shift {max_shift}")]
    ObservationTooShort { nsamples: usize, max_shift: usize },
}

/// Result type for plan operations
pub type Result<T> = core::result::Result<T, StrategyError>;
