// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

/*
 * Copyright 2025 Neuraville Inc.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 */

//! # Dedispersion Pipeline Controller
//!
//! Pull-based, resumable iteration over the time chunks of a plan. Each
//! successful advance processes exactly one chunk:
//!
//! 1. transfer `(nsamp + max_shift) * nchans` raw samples and stage the shift table
//! 2. run the preprocessing chain fixed at construction
//!    (optional zero-DM variant, corner turn, optional legacy RFI)
//! 3. sweep the DM ranges in plan order, binning whenever the bin factor
//!    doubles and dedispersing every trial of the range
//! 4. optionally copy the trials into a capture buffer
//!
//! Counters only move after the whole sweep succeeded. A failed stage aborts
//! the chunk, restores the transient sampling interval and max shift, and
//! leaves the chunk to be retried by the next call.

use std::path::PathBuf;
use std::time::Instant;

use crate::backend::{ChunkGeometry, DdtrBackend, DedispersionJob, LoadParams, RangeLoad};
use crate::device::{DeviceBuffers, DeviceState};
use crate::error::{BackendError, DdtrError, Result, Stage};
use crate::sink::{CaptureBuffer, CaptureWindow, DiskSink};
use crate::timer::{ThroughputReport, ThroughputTimer};
use ddtr_strategy::DdtrStrategy;
use tracing::{debug, error, info, warn};

/// Zero-DM correction applied before the corner turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ZeroDmMode {
    #[default]
    Off,
    ZeroDm,
    ZeroDmWithOutliers,
}

impl std::fmt::Display for ZeroDmMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ZeroDmMode::Off => write!(f, "off"),
            ZeroDmMode::ZeroDm => write!(f, "zero_dm"),
            ZeroDmMode::ZeroDmWithOutliers => write!(f, "zero_dm_with_outliers"),
        }
    }
}

impl std::str::FromStr for ZeroDmMode {
    type Err = DdtrError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "off" | "none" => Ok(ZeroDmMode::Off),
            "zero_dm" | "zerodm" => Ok(ZeroDmMode::ZeroDm),
            "zero_dm_with_outliers" | "outliers" => Ok(ZeroDmMode::ZeroDmWithOutliers),
            _ => Err(DdtrError::InvalidOption(format!("unknown zero-DM mode '{}'", s))),
        }
    }
}

/// Construction-time pipeline variant
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOptions {
    pub zero_dm: ZeroDmMode,
    /// Clip 4σ outliers per channel after the corner turn
    pub legacy_rfi: bool,
    /// Directory receiving `DD_data_chunk_<t>.dat` artifacts
    pub output_dir: PathBuf,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            zero_dm: ZeroDmMode::Off,
            legacy_rfi: false,
            output_dir: PathBuf::from("."),
        }
    }
}

/// Chunk-level preprocessing stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkStage {
    ZeroDm,
    ZeroDmOutliers,
    CornerTurn,
    LegacyRfi,
}

impl ChunkStage {
    fn stage(self) -> Stage {
        match self {
            ChunkStage::ZeroDm => Stage::ZeroDm,
            ChunkStage::ZeroDmOutliers => Stage::ZeroDmOutliers,
            ChunkStage::CornerTurn => Stage::CornerTurn,
            ChunkStage::LegacyRfi => Stage::LegacyRfi,
        }
    }
}

fn resolve_stages(options: &PipelineOptions) -> Vec<ChunkStage> {
    let mut stages = Vec::with_capacity(3);
    match options.zero_dm {
        ZeroDmMode::Off => {}
        ZeroDmMode::ZeroDm => stages.push(ChunkStage::ZeroDm),
        ZeroDmMode::ZeroDmWithOutliers => stages.push(ChunkStage::ZeroDmOutliers),
    }
    stages.push(ChunkStage::CornerTurn);
    if options.legacy_rfi {
        stages.push(ChunkStage::LegacyRfi);
    }
    stages
}

/// Per-range scalars derived at setup
#[derive(Debug, Clone, Copy, PartialEq)]
struct RangeParams {
    low: f32,
    high: f32,
    step: f32,
    bin_factor: u32,
    ndms: usize,
}

/// Timing breakdown of one chunk (microseconds)
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ChunkTiming {
    pub transfer_us: f64,
    pub preprocess_us: f64,
    pub dedisperse_us: f64,
    pub capture_us: f64,
    pub total_us: f64,
}

/// Result of a successfully processed chunk
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChunkReport {
    pub chunk_index: usize,
    /// Range-0 samples consumed by the chunk
    pub samples: usize,
    pub timing: ChunkTiming,
}

/// Outcome of one advance call
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Advance {
    Processed(ChunkReport),
    /// No chunks left; carries the run's throughput
    Exhausted(ThroughputReport),
}

impl Advance {
    pub fn is_processed(&self) -> bool {
        matches!(self, Advance::Processed(_))
    }
}

/// Cumulative pipeline statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineStats {
    pub chunks_processed: u64,
    pub ranges_processed: u64,
    pub stage_failures: u64,
    pub sink_failures: u64,
    pub capture_resizes: u64,
    pub total_us: f64,
    pub last_chunk: Option<ChunkTiming>,
}

enum Capture<'c> {
    Off,
    Into(&'c mut CaptureBuffer),
    Internal { dump: bool },
}

struct ChunkOutcome {
    samples: usize,
    windows: Vec<CaptureWindow>,
    timing: ChunkTiming,
}

fn stage_failed(
    stage: Stage,
    chunk_index: usize,
    range: Option<usize>,
) -> impl FnOnce(BackendError) -> DdtrError {
    move |source| DdtrError::StageFailed {
        stage,
        chunk_index,
        range,
        source,
    }
}

fn micros(since: Instant) -> f64 {
    since.elapsed().as_secs_f64() * 1_000_000.0
}

/// Chunked, resumable dedispersion pipeline
///
/// Borrows the plan and the host sample stream for its whole lifetime and
/// owns the backend and all device memory. Single-threaded: every method
/// takes `&mut self`.
pub struct DedispersionPipeline<'a, B: DdtrBackend> {
    strategy: &'a DdtrStrategy,
    input: &'a [u16],
    backend: B,
    options: PipelineOptions,
    stages: Vec<ChunkStage>,
    device: DeviceState<B>,
    sink: DiskSink,
    captured: CaptureBuffer,
    range_params: Vec<RangeParams>,

    chunk_index: usize,
    samples_processed: usize,
    tsamp_original: f32,
    tsamp: f32,
    max_shift_original: usize,
    max_shift: usize,

    timer: ThroughputTimer,
    stats: PipelineStats,
}

impl<'a, B: DdtrBackend> DedispersionPipeline<'a, B> {
    /// Create a pipeline; no device memory is touched until setup
    ///
    /// # Errors
    ///
    /// [`DdtrError::InputTooShort`] if `input` cannot cover every chunk plus
    /// the maximum shift.
    pub fn new(
        strategy: &'a DdtrStrategy,
        input: &'a [u16],
        backend: B,
        options: PipelineOptions,
    ) -> Result<Self> {
        let required = strategy.required_input_samples();
        if input.len() < required {
            return Err(DdtrError::InputTooShort {
                required,
                actual: input.len(),
            });
        }

        let stages = resolve_stages(&options);
        debug!(
            "[DDTR-PIPELINE] Stage chain: {:?}, {} ranges, {} chunks",
            stages,
            strategy.range(),
            strategy.num_chunks()
        );

        let tsamp = strategy.metadata().tsamp;
        let max_shift = strategy.max_shift();
        Ok(Self {
            strategy,
            input,
            backend,
            sink: DiskSink::new(options.output_dir.clone()),
            options,
            stages,
            device: DeviceState::Unallocated,
            captured: CaptureBuffer::new(),
            range_params: Vec::new(),
            chunk_index: 0,
            samples_processed: 0,
            tsamp_original: tsamp,
            tsamp,
            max_shift_original: max_shift,
            max_shift,
            timer: ThroughputTimer::new(),
            stats: PipelineStats::default(),
        })
    }

    /// Allocate device buffers and derive per-range parameters
    ///
    /// Succeeds immediately if already allocated.
    pub fn try_setup(&mut self) -> Result<()> {
        match &self.device {
            DeviceState::Released => return Err(DdtrError::Released),
            DeviceState::Allocated(_) => return Ok(()),
            DeviceState::Unallocated => {}
        }

        let buffers = DeviceBuffers::allocate(&mut self.backend, self.strategy)?;
        self.device = DeviceState::Allocated(buffers);

        self.range_params = self
            .strategy
            .ranges()
            .iter()
            .enumerate()
            .map(|(r, range)| RangeParams {
                low: range.low,
                high: range.high,
                step: range.step,
                bin_factor: range.bin_factor,
                ndms: self.strategy.ndms(r),
            })
            .collect();

        info!(
            "[DDTR-PIPELINE] Setup complete: {} chunks, {} DM ranges, max shift {} on {}",
            self.strategy.num_chunks(),
            self.range_params.len(),
            self.max_shift_original,
            self.backend.backend_name()
        );
        Ok(())
    }

    /// Process the next chunk
    pub fn try_advance(&mut self) -> Result<Advance> {
        self.step(Capture::Off)
    }

    /// Process the next chunk and copy its trials into `capture`
    ///
    /// `capture` is grown to the plan's shape first if needed.
    pub fn try_advance_into(&mut self, capture: &mut CaptureBuffer) -> Result<Advance> {
        self.step(Capture::Into(capture))
    }

    /// Process the next chunk into the internal capture buffer, optionally
    /// appending it to `DD_data_chunk_<t>.dat`
    pub fn try_advance_with_dump(&mut self, dump_to_disk: bool) -> Result<Advance> {
        self.step(Capture::Internal { dump: dump_to_disk })
    }

    /// `true` if buffers are allocated after the call
    pub fn setup(&mut self) -> bool {
        match self.try_setup() {
            Ok(()) => true,
            Err(e) => {
                warn!("[DDTR-PIPELINE] Setup failed: {}", e);
                false
            }
        }
    }

    /// `true` after processing exactly one chunk, `false` when exhausted
    /// or when the call could not process a chunk
    ///
    /// A failed stage also yields `false` with the chunk left pending;
    /// [`is_exhausted`](Self::is_exhausted) separates the two cases.
    pub fn advance(&mut self) -> bool {
        Self::advanced(self.try_advance())
    }

    /// Like [`advance`](Self::advance), reporting the processed chunk index
    pub fn advance_into(&mut self, capture: &mut CaptureBuffer, chunk_index: &mut usize) -> bool {
        match self.try_advance_into(capture) {
            Ok(Advance::Processed(report)) => {
                *chunk_index = report.chunk_index;
                true
            }
            other => Self::advanced(other),
        }
    }

    pub fn advance_with_dump(&mut self, dump_to_disk: bool) -> bool {
        Self::advanced(self.try_advance_with_dump(dump_to_disk))
    }

    fn advanced(result: Result<Advance>) -> bool {
        match result {
            Ok(advance) => advance.is_processed(),
            // the chunk itself completed
            Err(DdtrError::SinkFailed { .. }) => true,
            Err(e @ (DdtrError::NotReady | DdtrError::Released)) => {
                warn!("[DDTR-PIPELINE] Advance ignored: {}", e);
                false
            }
            Err(_) => false,
        }
    }

    /// Release device buffers and host staging; always `true`
    pub fn cleanup(&mut self) -> bool {
        if self.device.release() {
            info!("[DDTR-PIPELINE] Device buffers released");
        }
        self.captured = CaptureBuffer::new();
        true
    }

    fn step(&mut self, capture: Capture<'_>) -> Result<Advance> {
        match &self.device {
            DeviceState::Released => return Err(DdtrError::Released),
            DeviceState::Unallocated => return Err(DdtrError::NotReady),
            DeviceState::Allocated(_) => {}
        }

        let num_chunks = self.strategy.num_chunks();
        if self.chunk_index >= num_chunks {
            return Ok(Advance::Exhausted(self.finish()));
        }
        if self.chunk_index == 0 {
            self.timer.start();
        }
        let t = self.chunk_index;
        debug!("[DDTR-PIPELINE] Pipeline start/resume at chunk {}", t);

        let dump = matches!(capture, Capture::Internal { dump: true });
        let result = match capture {
            Capture::Off => self.process_chunk(None),
            Capture::Into(buffer) => {
                if buffer.shape_for(self.strategy) {
                    self.stats.capture_resizes += 1;
                }
                self.process_chunk(Some(buffer))
            }
            Capture::Internal { .. } => {
                let mut buffer = std::mem::take(&mut self.captured);
                if buffer.shape_for(self.strategy) {
                    self.stats.capture_resizes += 1;
                }
                let result = self.process_chunk(Some(&mut buffer));
                self.captured = buffer;
                result
            }
        };

        self.tsamp = self.tsamp_original;
        self.max_shift = self.max_shift_original;

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                self.stats.stage_failures += 1;
                error!("[DDTR-PIPELINE] Chunk {} aborted: {}", t, e);
                return Err(e);
            }
        };

        self.samples_processed += outcome.samples;
        self.chunk_index += 1;

        self.stats.chunks_processed += 1;
        self.stats.ranges_processed += self.range_params.len() as u64;
        self.stats.total_us += outcome.timing.total_us;
        self.stats.last_chunk = Some(outcome.timing);

        info!(
            "[DDTR-PIPELINE] Finished chunk {} / {} ({:.1} ms)",
            self.chunk_index,
            num_chunks,
            outcome.timing.total_us / 1000.0
        );

        if dump {
            if let Err(source) = self.sink.flush_chunk(t, &self.captured, &outcome.windows) {
                self.stats.sink_failures += 1;
                let path = self.sink.artifact_path(t);
                error!(
                    "[DDTR-PIPELINE] Chunk {} output not written to {:?}: {}",
                    t, path, source
                );
                return Err(DdtrError::SinkFailed {
                    chunk_index: t,
                    path,
                    source,
                });
            }
        }

        Ok(Advance::Processed(ChunkReport {
            chunk_index: t,
            samples: outcome.samples,
            timing: outcome.timing,
        }))
    }

    fn process_chunk(&mut self, mut capture: Option<&mut CaptureBuffer>) -> Result<ChunkOutcome> {
        let strategy = self.strategy;
        let t = self.chunk_index;
        let nchans = strategy.metadata().nchans;
        let nbits = strategy.metadata().nbits;
        let table = strategy.t_processed();
        let nsamp0 = table.get(0, t).unwrap_or(0);

        let buffers = self.device.buffers_mut().ok_or(DdtrError::NotReady)?;
        let backend = &mut self.backend;
        let started = Instant::now();

        // Transfer at the global max shift
        let max_shift = self.max_shift_original;
        self.max_shift = max_shift;
        let params = LoadParams {
            nchans,
            nsamp: nsamp0,
            max_shift,
            dm_shifts: strategy.dm_shifts(),
        };
        let offset = self.samples_processed * nchans;
        let host = self
            .input
            .get(offset..offset + params.window_len())
            .ok_or_else(|| {
                stage_failed(Stage::Load, t, None)(BackendError::InvalidGeometry(format!(
                    "host stream ends before sample {}",
                    offset + params.window_len()
                )))
            })?;
        backend
            .load_chunk(&mut buffers.input, host, &params)
            .and_then(|_| backend.synchronize())
            .map_err(stage_failed(Stage::Load, t, None))?;
        let transfer_us = micros(started);

        let preprocess_start = Instant::now();
        let mut geometry = ChunkGeometry {
            nchans,
            row_len: nsamp0 + max_shift,
        };
        for stage in &self.stages {
            let result = match stage {
                ChunkStage::ZeroDm => backend.zero_dm(&mut buffers.input, &geometry, nbits),
                ChunkStage::ZeroDmOutliers => {
                    backend.zero_dm_outliers(&mut buffers.input, &geometry, nbits)
                }
                ChunkStage::CornerTurn => {
                    backend.corner_turn(&mut buffers.input, &mut buffers.output, &geometry)
                }
                ChunkStage::LegacyRfi => backend.legacy_rfi(&mut buffers.input, &geometry),
            };
            result
                .and_then(|_| backend.synchronize())
                .map_err(stage_failed(stage.stage(), t, None))?;
        }
        let preprocess_us = micros(preprocess_start);

        let mut dedisperse_us = 0.0;
        let mut capture_us = 0.0;
        let mut windows = Vec::new();
        let mut current_bin = 1u32;

        for (r, range) in self.range_params.iter().enumerate() {
            let nsamp = table.get(r, t).unwrap_or(0);
            self.max_shift = self.max_shift_original / range.bin_factor as usize;

            info!(
                "[DDTR-PIPELINE] Range {}: dm {} .. {} step {} ({} trials), telescope time processed {:.6} s",
                r,
                range.low,
                range.high,
                range.step,
                range.ndms,
                self.tsamp_original as f64 * self.samples_processed as f64
            );

            let pending = (range.bin_factor / current_bin).max(1) as usize;
            let load = RangeLoad {
                range: r,
                nsamp,
                max_shift: self.max_shift,
                bin_factor: range.bin_factor,
                available: geometry.row_len / pending,
            };
            backend
                .load_range(&mut buffers.input, &load)
                .and_then(|_| backend.synchronize())
                .map_err(stage_failed(Stage::RangeLoad, t, Some(r)))?;

            if range.bin_factor > current_bin {
                geometry.row_len = backend
                    .bin(&mut buffers.input, &mut buffers.output, &geometry)
                    .and_then(|len| backend.synchronize().map(|_| len))
                    .map_err(stage_failed(Stage::Bin, t, Some(r)))?;
                self.tsamp *= 2.0;
                current_bin = range.bin_factor;
            }

            let dedisperse_start = Instant::now();
            let job = DedispersionJob {
                range: r,
                nsamp,
                ndms: range.ndms,
                dm_low: range.low,
                dm_step: range.step,
                bin_factor: range.bin_factor,
                tsamp: self.tsamp,
                geometry,
            };
            backend
                .dedisperse(&buffers.input, &mut buffers.output, &job)
                .and_then(|_| backend.synchronize())
                .map_err(stage_failed(Stage::Dedisperse, t, Some(r)))?;
            dedisperse_us += micros(dedisperse_start);

            if let Some(capture) = capture.as_deref_mut() {
                let capture_start = Instant::now();
                let offset = self.samples_processed / range.bin_factor as usize;
                for trial in 0..range.ndms {
                    let window = capture
                        .capture_window(r, trial, offset, nsamp)
                        .ok_or_else(|| {
                            stage_failed(Stage::Capture, t, Some(r))(BackendError::InvalidGeometry(
                                format!(
                                    "capture window {}..{} of trial {} out of bounds",
                                    offset,
                                    offset + nsamp,
                                    trial
                                ),
                            ))
                        })?;
                    backend
                        .read_trials(&buffers.output, trial * nsamp, window)
                        .map_err(stage_failed(Stage::Capture, t, Some(r)))?;
                }
                windows.push(CaptureWindow {
                    range: r,
                    offset,
                    len: nsamp,
                });
                capture_us += micros(capture_start);
            }
        }

        Ok(ChunkOutcome {
            samples: nsamp0,
            windows,
            timing: ChunkTiming {
                transfer_us,
                preprocess_us,
                dedisperse_us,
                capture_us,
                total_us: micros(started),
            },
        })
    }

    fn finish(&mut self) -> ThroughputReport {
        let wall = self.timer.stop();
        let report = ThroughputReport::new(wall, self.tsamp_original, self.samples_processed);
        debug!("[DDTR-PIPELINE] Throughput including syncs and transfers:");
        debug!(
            "[DDTR-PIPELINE] Wall time: {:.6} s on {}",
            report.wall_seconds,
            self.backend.backend_name()
        );
        debug!(
            "[DDTR-PIPELINE] Amount of telescope time processed: {:.6} s",
            report.telescope_seconds
        );
        debug!(
            "[DDTR-PIPELINE] Number of samples processed: {}",
            report.samples_processed
        );
        debug!(
            "[DDTR-PIPELINE] Real-time speedup factor: {:.3}",
            report.realtime_speedup
        );
        report
    }

    pub fn strategy(&self) -> &'a DdtrStrategy {
        self.strategy
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Index of the next chunk to process; equals the chunk count once exhausted
    pub fn current_chunk_index(&self) -> usize {
        self.chunk_index
    }

    pub fn samples_processed(&self) -> usize {
        self.samples_processed
    }

    /// Original sampling interval x samples processed (seconds)
    pub fn telescope_time_elapsed(&self) -> f64 {
        self.tsamp_original as f64 * self.samples_processed as f64
    }

    /// Current sampling interval; only differs from the plan's mid-sweep
    pub fn sampling_interval(&self) -> f32 {
        self.tsamp
    }

    pub fn current_max_shift(&self) -> usize {
        self.max_shift
    }

    pub fn is_allocated(&self) -> bool {
        self.device.is_allocated()
    }

    pub fn is_released(&self) -> bool {
        self.device.is_released()
    }

    pub fn is_exhausted(&self) -> bool {
        self.chunk_index >= self.strategy.num_chunks()
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    /// Internal capture buffer filled by [`advance_with_dump`](Self::advance_with_dump)
    pub fn captured(&self) -> &CaptureBuffer {
        &self.captured
    }
}

impl<B: DdtrBackend> Drop for DedispersionPipeline<'_, B> {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_chain_resolution() {
        let plain = PipelineOptions::default();
        assert_eq!(resolve_stages(&plain), vec![ChunkStage::CornerTurn]);

        let full = PipelineOptions {
            zero_dm: ZeroDmMode::ZeroDmWithOutliers,
            legacy_rfi: true,
            ..Default::default()
        };
        assert_eq!(
            resolve_stages(&full),
            vec![
                ChunkStage::ZeroDmOutliers,
                ChunkStage::CornerTurn,
                ChunkStage::LegacyRfi
            ]
        );
    }

    #[test]
    fn test_zero_dm_mode_parse() {
        assert_eq!("off".parse::<ZeroDmMode>().unwrap(), ZeroDmMode::Off);
        assert_eq!("zero-dm".parse::<ZeroDmMode>().unwrap(), ZeroDmMode::ZeroDm);
        assert_eq!(
            "ZERO_DM_WITH_OUTLIERS".parse::<ZeroDmMode>().unwrap(),
            ZeroDmMode::ZeroDmWithOutliers
        );
        assert!("median".parse::<ZeroDmMode>().is_err());
        assert_eq!(ZeroDmMode::ZeroDm.to_string(), "zero_dm");
    }
}
