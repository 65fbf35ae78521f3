// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

/*
 * Copyright 2025 Neuraville Inc.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 */

//! # Compute Backend Abstraction
//!
//! Call contracts of the dedispersion stages and the device memory they run
//! on. The pipeline controller only ever talks to a [`DdtrBackend`], so the
//! same chunk/range bookkeeping drives host and GPU execution.
//!
//! ## Device data layout
//!
//! - after [`DdtrBackend::load_chunk`]: time-major, `[t][c]`, `row_len` samples
//! - after [`DdtrBackend::corner_turn`]: channel-major, `[c][t]`, row stride `row_len`
//! - after [`DdtrBackend::bin`]: channel-major, compacted to the halved `row_len`
//! - dedispersion output: trial-major, `out[j * nsamp + t]`

mod cpu;
#[cfg(feature = "gpu")]
mod wgpu_backend;

pub use cpu::{CpuBackend, CpuBuffer, MemoryLedger};
#[cfg(feature = "gpu")]
pub use wgpu_backend::{WgpuBackend, WgpuBuffer};

use crate::error::{BackendError, BackendResult};
use tracing::info;

/// Device-resident buffer handle
pub trait DeviceBuffer {
    /// Number of elements
    fn len(&self) -> usize;

    /// Size in bytes
    fn size_bytes(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Shape of the data currently resident in the input buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkGeometry {
    pub nchans: usize,
    /// Samples per channel currently on the device
    pub row_len: usize,
}

impl ChunkGeometry {
    pub fn total(&self) -> usize {
        self.nchans * self.row_len
    }
}

/// Parameters of a chunk transfer
#[derive(Debug, Clone, Copy)]
pub struct LoadParams<'a> {
    pub nchans: usize,
    /// Samples processed this chunk (range 0)
    pub nsamp: usize,
    pub max_shift: usize,
    /// Per-channel delay per unit DM, staged alongside the data
    pub dm_shifts: &'a [f32],
}

impl LoadParams<'_> {
    /// Raw samples transferred: `(nsamp + max_shift) * nchans`
    pub fn window_len(&self) -> usize {
        (self.nsamp + self.max_shift) * self.nchans
    }
}

/// Range-specific constants staged before a range is dedispersed
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RangeLoad {
    pub range: usize,
    pub nsamp: usize,
    /// Global max shift divided by this range's bin factor
    pub max_shift: usize,
    pub bin_factor: u32,
    /// Samples per channel the range will see once any pending binning ran
    pub available: usize,
}

impl RangeLoad {
    pub(crate) fn check_coverage(&self) -> BackendResult<()> {
        if self.nsamp + self.max_shift > self.available {
            return Err(BackendError::InvalidGeometry(format!(
                "range {} needs {} + {} samples per channel, {} available",
                self.range, self.nsamp, self.max_shift, self.available
            )));
        }
        Ok(())
    }
}

/// One dedispersion launch
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DedispersionJob {
    pub range: usize,
    pub nsamp: usize,
    pub ndms: usize,
    pub dm_low: f32,
    pub dm_step: f32,
    pub bin_factor: u32,
    /// Sampling interval of the data being dedispersed (seconds)
    pub tsamp: f32,
    pub geometry: ChunkGeometry,
}

impl DedispersionJob {
    pub fn output_len(&self) -> usize {
        self.ndms * self.nsamp
    }

    pub fn dm(&self, trial: usize) -> f32 {
        self.dm_low + self.dm_step * trial as f32
    }
}

/// Sample offset of a channel for one DM trial, at the range's resolution
pub fn trial_shift(dm_shift: f32, dm: f32, bin_factor: u32) -> usize {
    let shift = (dm_shift * dm / bin_factor as f32).floor();
    if shift.is_finite() && shift > 0.0 {
        shift as usize
    } else {
        0
    }
}

/// Verify every read of a dedispersion job stays inside the resident rows
pub(crate) fn check_job(job: &DedispersionJob, dm_shifts: &[f32], output_len: usize) -> BackendResult<()> {
    if dm_shifts.len() != job.geometry.nchans {
        return Err(BackendError::InvalidGeometry(format!(
            "{} shift entries staged for {} channels",
            dm_shifts.len(),
            job.geometry.nchans
        )));
    }
    if job.output_len() > output_len {
        return Err(BackendError::InvalidGeometry(format!(
            "{} trials x {} samples exceed output capacity {}",
            job.ndms, job.nsamp, output_len
        )));
    }
    let largest = dm_shifts.iter().copied().fold(0.0f32, f32::max);
    let top_dm = job.dm(job.ndms.saturating_sub(1)).max(job.dm_low);
    let reach = job.nsamp + trial_shift(largest, top_dm, job.bin_factor);
    if reach > job.geometry.row_len {
        return Err(BackendError::InvalidGeometry(format!(
            "range {} reads {} samples per channel, only {} resident",
            job.range, reach, job.geometry.row_len
        )));
    }
    Ok(())
}

/// Stage call contracts
///
/// Every stage is issued in strict sequence by the controller, which calls
/// [`DdtrBackend::synchronize`] at each stage boundary.
pub trait DdtrBackend: Send {
    type Input: DeviceBuffer + Send;
    type Output: DeviceBuffer + Send;

    /// Get backend type name for logging/debugging
    fn backend_name(&self) -> &str;

    /// Allocate the raw-sample staging buffer
    fn allocate_input(&mut self, samples: usize) -> BackendResult<Self::Input>;

    /// Allocate the zero-initialised float output buffer
    fn allocate_output(&mut self, values: usize) -> BackendResult<Self::Output>;

    /// Transfer one chunk window (time-major) and stage the shift table
    fn load_chunk(
        &mut self,
        input: &mut Self::Input,
        host: &[u16],
        params: &LoadParams<'_>,
    ) -> BackendResult<()>;

    /// Stage range-specific shift constants for the resident chunk
    fn load_range(&mut self, input: &mut Self::Input, range: &RangeLoad) -> BackendResult<()>;

    /// Subtract the per-sample channel mean (time-major)
    fn zero_dm(&mut self, input: &mut Self::Input, geometry: &ChunkGeometry, nbits: u32)
        -> BackendResult<()>;

    /// Zero-DM with iterative 3σ outlier rejection (time-major)
    fn zero_dm_outliers(
        &mut self,
        input: &mut Self::Input,
        geometry: &ChunkGeometry,
        nbits: u32,
    ) -> BackendResult<()>;

    /// Transpose time-major to channel-major, using `output` as scratch
    fn corner_turn(
        &mut self,
        input: &mut Self::Input,
        output: &mut Self::Output,
        geometry: &ChunkGeometry,
    ) -> BackendResult<()>;

    /// Clip samples beyond 4σ of their channel (channel-major)
    fn legacy_rfi(&mut self, input: &mut Self::Input, geometry: &ChunkGeometry) -> BackendResult<()>;

    /// Average adjacent sample pairs per channel; returns the new row length
    fn bin(
        &mut self,
        input: &mut Self::Input,
        output: &mut Self::Output,
        geometry: &ChunkGeometry,
    ) -> BackendResult<usize>;

    /// Accumulate every trial of one range into `output`
    fn dedisperse(
        &mut self,
        input: &Self::Input,
        output: &mut Self::Output,
        job: &DedispersionJob,
    ) -> BackendResult<()>;

    /// Copy `dst.len()` values starting at `offset` back to the host
    fn read_trials(&mut self, output: &Self::Output, offset: usize, dst: &mut [f32])
        -> BackendResult<()>;

    /// Block until all issued device work has completed
    fn synchronize(&mut self) -> BackendResult<()>;
}

/// Backend type enum for construction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendType {
    /// Host execution, rayon-parallel kernels
    Cpu,

    /// GPU via WGPU (Metal/Vulkan/DirectX - cross-platform)
    Wgpu,

    /// Pick based on work size and hardware availability
    #[default]
    Auto,
}

impl std::fmt::Display for BackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendType::Cpu => write!(f, "CPU"),
            BackendType::Wgpu => write!(f, "WGPU"),
            BackendType::Auto => write!(f, "Auto"),
        }
    }
}

impl std::str::FromStr for BackendType {
    type Err = BackendError;

    fn from_str(s: &str) -> BackendResult<Self> {
        match s.to_lowercase().as_str() {
            "cpu" => Ok(BackendType::Cpu),
            "wgpu" | "gpu" => Ok(BackendType::Wgpu),
            "auto" => Ok(BackendType::Auto),
            _ => Err(BackendError::Device(format!("unknown backend '{}'", s))),
        }
    }
}

/// Configuration for backend auto-selection
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Minimum `nchans * chunk_samples` for the GPU to be worth its transfer cost
    pub gpu_work_threshold: usize,

    /// Force CPU even if GPU would be beneficial
    pub force_cpu: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            gpu_work_threshold: 4 * 1024 * 1024,
            force_cpu: false,
        }
    }
}

/// Backend selection decision with rationale
#[derive(Debug, Clone, PartialEq)]
pub struct BackendDecision {
    pub backend_type: BackendType,
    pub reason: String,
}

/// Resolve the requested backend into a concrete one
///
/// `work_items` is the number of raw samples per chunk (`nchans * chunk_capacity`).
/// `Auto` picks WGPU only when compiled in, an adapter exists and the chunk is
/// large enough; an explicit WGPU request falls back to CPU when unavailable.
pub fn select_backend(
    requested: BackendType,
    work_items: usize,
    config: &BackendConfig,
) -> BackendDecision {
    if config.force_cpu || requested == BackendType::Cpu {
        return BackendDecision {
            backend_type: BackendType::Cpu,
            reason: "CPU requested via configuration".to_string(),
        };
    }

    let gpu_available = is_gpu_available();

    if requested == BackendType::Wgpu {
        if gpu_available {
            return BackendDecision {
                backend_type: BackendType::Wgpu,
                reason: "WGPU requested via configuration".to_string(),
            };
        }
        info!("⚠️  WGPU requested but not available, falling back to CPU");
        return BackendDecision {
            backend_type: BackendType::Cpu,
            reason: "WGPU requested but not available, falling back to CPU".to_string(),
        };
    }

    if gpu_available && work_items >= config.gpu_work_threshold {
        return BackendDecision {
            backend_type: BackendType::Wgpu,
            reason: format!(
                "WGPU selected: {} samples per chunk (threshold {})",
                work_items, config.gpu_work_threshold
            ),
        };
    }

    BackendDecision {
        backend_type: BackendType::Cpu,
        reason: format!(
            "CPU selected: {} samples per chunk (below GPU threshold or GPU not available)",
            work_items
        ),
    }
}

/// Check if a GPU adapter is available
#[cfg(feature = "gpu")]
pub fn is_gpu_available() -> bool {
    let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
        backends: wgpu::Backends::all(),
        ..Default::default()
    });

    pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
        power_preference: wgpu::PowerPreference::HighPerformance,
        compatible_surface: None,
        force_fallback_adapter: false,
    }))
    .is_some()
}

/// Check if a GPU adapter is available (always false without the `gpu` feature)
#[cfg(not(feature = "gpu"))]
pub fn is_gpu_available() -> bool {
    false
}
