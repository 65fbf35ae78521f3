// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

/*
 * Copyright 2025 Neuraville Inc.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! # DDTR Engine
//!
//! Drives a [`ddtr_strategy::DdtrStrategy`] through a compute backend, one
//! time chunk per call.
//!
//! ## Architecture
//! - **backend**: stage call contracts, CPU (rayon) and optional WGPU implementations
//! - **device**: acquire-on-setup, release-on-every-path device buffers
//! - **pipeline**: the resumable chunk iterator and its counters
//! - **sink**: host capture buffer and per-chunk disk artifacts
//! - **runner**: uniform setup/advance/cleanup driver contract
//!
//! ## Example
//! ```no_run
//! use ddtr_engine::{CpuBackend, DedispersionPipeline, PipelineOptions};
//! # fn demo(strategy: &ddtr_strategy::DdtrStrategy, samples: &[u16]) -> ddtr_engine::Result<()> {
//! let mut pipeline =
//!     DedispersionPipeline::new(strategy, samples, CpuBackend::new(), PipelineOptions::default())?;
//! pipeline.try_setup()?;
//! while pipeline.try_advance()?.is_processed() {}
//! pipeline.cleanup();
//! # Ok(())
//! # }
//! ```

/// Crate version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod backend;
pub mod device;
pub mod error;
pub mod pipeline;
pub mod runner;
pub mod sink;
pub mod timer;

pub use backend::{
    is_gpu_available, select_backend, trial_shift, BackendConfig, BackendDecision, BackendType,
    ChunkGeometry, CpuBackend, CpuBuffer, DdtrBackend, DedispersionJob, DeviceBuffer, LoadParams,
    MemoryLedger, RangeLoad,
};
#[cfg(feature = "gpu")]
pub use backend::{WgpuBackend, WgpuBuffer};
pub use device::{DeviceBuffers, DeviceState};
pub use error::{BackendError, BackendResult, DdtrError, Result, SinkError, Stage};
pub use pipeline::{
    Advance, ChunkReport, ChunkTiming, DedispersionPipeline, PipelineOptions, PipelineStats,
    ZeroDmMode,
};
pub use runner::{run_to_completion, PipelineRunner, RunSummary};
pub use sink::{CaptureBuffer, CaptureWindow, DiskSink};
pub use timer::{ThroughputReport, ThroughputTimer};
