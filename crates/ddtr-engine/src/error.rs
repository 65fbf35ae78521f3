// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Error types for the dedispersion engine

use std::path::PathBuf;

use ddtr_strategy::StrategyError;

/// Failure reported by a backend stage or device allocation
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BackendError {
    #[error(
        "Out of device memory: requested {requested_bytes} bytes with {live_bytes} live \
         (limit {limit_bytes})"
    )]
    OutOfMemory {
        requested_bytes: usize,
        live_bytes: usize,
        limit_bytes: usize,
    },

    #[error("Invalid geometry: {0}")]
    InvalidGeometry(String),

    #[error("Device error: {0}")]
    Device(String),
}

/// Result type for backend operations
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Failure writing a chunk artifact
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("Failed to open {path:?}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Capture window out of bounds: range {range}, offset {offset}, length {len}")]
    WindowOutOfBounds {
        range: usize,
        offset: usize,
        len: usize,
    },
}

/// Pipeline stages, used to tag stage failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Load,
    ZeroDm,
    ZeroDmOutliers,
    CornerTurn,
    LegacyRfi,
    RangeLoad,
    Bin,
    Dedisperse,
    Capture,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Load => "load",
            Stage::ZeroDm => "zero-dm",
            Stage::ZeroDmOutliers => "zero-dm-outliers",
            Stage::CornerTurn => "corner-turn",
            Stage::LegacyRfi => "legacy-rfi",
            Stage::RangeLoad => "range-load",
            Stage::Bin => "bin",
            Stage::Dedisperse => "dedisperse",
            Stage::Capture => "capture",
        };
        f.write_str(name)
    }
}

/// Pipeline controller errors
#[derive(Debug, thiserror::Error)]
pub enum DdtrError {
    #[error("Failed to allocate {buffer} buffer: {source}")]
    AllocationFailed {
        buffer: &'static str,
        #[source]
        source: BackendError,
    },

    #[error("Stage {stage} failed on chunk {chunk_index}{}: {source}", range_suffix(.range))]
    StageFailed {
        stage: Stage,
        chunk_index: usize,
        range: Option<usize>,
        #[source]
        source: BackendError,
    },

    #[error("Chunk {chunk_index} processed but artifact {path:?} was not written: {source}")]
    SinkFailed {
        chunk_index: usize,
        path: PathBuf,
        #[source]
        source: SinkError,
    },

    #[error("Pipeline not set up")]
    NotReady,

    #[error("Pipeline already released")]
    Released,

    #[error("Host sample stream holds {actual} samples, plan needs {required}")]
    InputTooShort { required: usize, actual: usize },

    #[error("Invalid pipeline option: {0}")]
    InvalidOption(String),

    #[error(transparent)]
    Strategy(#[from] StrategyError),
}

fn range_suffix(range: &Option<usize>) -> String {
    match range {
        Some(r) => format!(" (DM range {})", r),
        None => String::new(),
    }
}

impl DdtrError {
    /// Whether retrying the same call may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DdtrError::StageFailed { .. } | DdtrError::AllocationFailed { .. }
        )
    }
}

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, DdtrError>;
