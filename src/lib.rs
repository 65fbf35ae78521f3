// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! # DDTR - Chunked Dedispersion Pipeline
//!
//! Dedisperses a filterbank observation over a precomputed plan of DM ranges,
//! one time chunk at a time, on the CPU or (with the `gpu` feature) on any
//! WGPU adapter.
//!
//! ## Quick Start
//!
//! ```toml
//! [dependencies]
//! ddtr = "0.0.1-beta.18"
//! ```
//!
//! ## Feature Flags
//!
//! - `gpu`: WGPU compute backend (Metal/Vulkan/DirectX)
//! - `file-logging`: JSON run logs with retention for the `ddtr_run` driver
//!
//! ## Usage Examples
//!
//! ### Run a plan to completion
//!
//! ```rust,no_run
//! use ddtr::prelude::*;
//!
//! let metadata = FilterbankMetadata {
//!     nchans: 64,
//!     nbits: 8,
//!     tsamp: 0.000064,
//!     nsamples: 65_536,
//!     fch1: 1550.0,
//!     foff: -1.0,
//! };
//! let shifts = dm_shifts_from_frequencies(metadata.fch1, metadata.foff, metadata.nchans, metadata.tsamp);
//! let ranges = vec![DmRange::new(0.0, 50.0, 1.0, 1), DmRange::new(50.0, 100.0, 2.0, 2)];
//! let samples = vec![128u16; metadata.nchans * metadata.nsamples];
//! let strategy = DdtrStrategy::uniform(metadata, ranges, shifts, 8192)?;
//!
//! let mut pipeline =
//!     DedispersionPipeline::new(&strategy, &samples, CpuBackend::new(), PipelineOptions::default())?;
//!
//! let mut capture = CaptureBuffer::new();
//! pipeline.try_setup()?;
//! while let Advance::Processed(report) = pipeline.try_advance_into(&mut capture)? {
//!     println!("chunk {} took {} us", report.chunk_index, report.timing.total_us);
//! }
//! pipeline.cleanup();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Drive through the runner contract
//!
//! ```rust,no_run
//! use std::sync::atomic::AtomicBool;
//! use ddtr::prelude::*;
//!
//! # fn demo(strategy: &DdtrStrategy, samples: &[u16]) -> ddtr::engine::Result<()> {
//! let mut pipeline =
//!     DedispersionPipeline::new(strategy, samples, CpuBackend::new(), PipelineOptions::default())?;
//! let stop = AtomicBool::new(false);
//! let summary = run_to_completion(&mut pipeline, &stop);
//! assert!(summary.exhausted);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  Plan: ddtr-strategy                                    │
//! │  (DM ranges, (range, chunk) table, shift table)         │
//! └─────────────────────────────────────────────────────────┘
//!                         ↓
//! ┌─────────────────────────────────────────────────────────┐
//! │  Compute: ddtr-engine                                   │
//! │  (backends, device buffers, pipeline, sink, runner)     │
//! └─────────────────────────────────────────────────────────┘
//!                         ↓
//! ┌─────────────────────────────────────────────────────────┐
//! │  Infrastructure: ddtr-config, ddtr-observability        │
//! │  (TOML + overrides, tracing setup)                      │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## License
//!
//! Apache-2.0

// Re-export foundation
pub use ddtr_strategy as strategy;

// Re-export compute
pub use ddtr_engine as engine;

// Re-export infrastructure
pub use ddtr_config as config;
pub use ddtr_observability as observability;

/// Prelude - commonly used types and traits
pub mod prelude {
    pub use crate::strategy::{
        dm_shifts_from_frequencies, ChunkTable, DdtrStrategy, DmRange, FilterbankMetadata,
    };

    pub use crate::engine::{
        run_to_completion, Advance, BackendType, CaptureBuffer, ChunkReport, CpuBackend,
        DdtrBackend, DdtrError, DedispersionPipeline, DiskSink, PipelineOptions, PipelineRunner,
        RunSummary, ThroughputReport, ZeroDmMode,
    };

    #[cfg(feature = "gpu")]
    pub use crate::engine::WgpuBackend;

    pub use crate::config::{load_config, validate_config, DdtrConfig};
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_facade_imports() {
        use crate::prelude::*;
        let range = DmRange::new(0.0, 10.0, 1.0, 1);
        assert_eq!(range.dm_count(), 10);
        assert_eq!(ZeroDmMode::default(), ZeroDmMode::Off);
    }
}
