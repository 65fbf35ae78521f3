// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

/*
 * Copyright 2025 Neuraville Inc.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 */

//! # CPU Backend
//!
//! Host memory stands in for device memory; kernels are parallelised over
//! channels or trials with rayon. Every buffer reports to a shared
//! [`MemoryLedger`] on allocation and again when dropped.

use super::{
    check_job, trial_shift, ChunkGeometry, DdtrBackend, DedispersionJob, DeviceBuffer, LoadParams,
    RangeLoad,
};
use crate::error::{BackendError, BackendResult};
use rayon::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const OUTLIER_SIGMA: f32 = 3.0;
const OUTLIER_ITERATIONS: usize = 5;
const RFI_SIGMA: f32 = 4.0;

/// Live-memory accounting shared by a backend and its buffers
#[derive(Debug, Default)]
pub struct MemoryLedger {
    live_bytes: AtomicUsize,
    peak_bytes: AtomicUsize,
    allocations: AtomicUsize,
    releases: AtomicUsize,
}

impl MemoryLedger {
    fn record_allocation(&self, bytes: usize) {
        let live = self.live_bytes.fetch_add(bytes, Ordering::SeqCst) + bytes;
        self.peak_bytes.fetch_max(live, Ordering::SeqCst);
        self.allocations.fetch_add(1, Ordering::SeqCst);
    }

    fn record_release(&self, bytes: usize) {
        self.live_bytes.fetch_sub(bytes, Ordering::SeqCst);
        self.releases.fetch_add(1, Ordering::SeqCst);
    }

    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::SeqCst)
    }

    pub fn peak_bytes(&self) -> usize {
        self.peak_bytes.load(Ordering::SeqCst)
    }

    pub fn allocation_count(&self) -> usize {
        self.allocations.load(Ordering::SeqCst)
    }

    pub fn release_count(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

/// Host-resident "device" buffer
#[derive(Debug)]
pub struct CpuBuffer<T> {
    data: Vec<T>,
    ledger: Arc<MemoryLedger>,
}

impl<T> CpuBuffer<T> {
    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }
}

impl<T> DeviceBuffer for CpuBuffer<T> {
    fn len(&self) -> usize {
        self.data.len()
    }

    fn size_bytes(&self) -> usize {
        self.data.len() * std::mem::size_of::<T>()
    }
}

impl<T> Drop for CpuBuffer<T> {
    fn drop(&mut self) {
        self.ledger.record_release(self.size_bytes());
    }
}

/// CPU backend (rayon-parallel kernels)
pub struct CpuBackend {
    /// Backend name for logging
    name: String,

    /// Allocation beyond this many live bytes fails
    memory_limit: Option<usize>,

    ledger: Arc<MemoryLedger>,

    /// Shift table staged by the last chunk load
    dm_shifts: Vec<f32>,

    /// Range constants staged by the last range load
    staged_range: Option<RangeLoad>,
}

impl CpuBackend {
    pub fn new() -> Self {
        Self {
            name: format!("CPU (rayon x{})", rayon::current_num_threads()),
            memory_limit: None,
            ledger: Arc::new(MemoryLedger::default()),
            dm_shifts: Vec::new(),
            staged_range: None,
        }
    }

    /// CPU backend that refuses to hold more than `bytes` live
    pub fn with_memory_limit(bytes: usize) -> Self {
        Self {
            memory_limit: Some(bytes),
            ..Self::new()
        }
    }

    pub fn memory_limit(&self) -> Option<usize> {
        self.memory_limit
    }

    pub fn ledger(&self) -> Arc<MemoryLedger> {
        Arc::clone(&self.ledger)
    }

    fn allocate<T: Copy + Default>(&self, len: usize) -> BackendResult<CpuBuffer<T>> {
        let live_bytes = self.ledger.live_bytes();
        let limit_bytes = self.memory_limit.unwrap_or(usize::MAX);
        let out_of_memory = |requested_bytes| BackendError::OutOfMemory {
            requested_bytes,
            live_bytes,
            limit_bytes,
        };

        let bytes = len
            .checked_mul(std::mem::size_of::<T>())
            .ok_or_else(|| out_of_memory(usize::MAX))?;
        if live_bytes.saturating_add(bytes) > limit_bytes {
            return Err(out_of_memory(bytes));
        }

        let mut data = Vec::new();
        data.try_reserve_exact(len)
            .map_err(|_| out_of_memory(bytes))?;
        data.resize(len, T::default());

        self.ledger.record_allocation(bytes);
        Ok(CpuBuffer {
            data,
            ledger: Arc::clone(&self.ledger),
        })
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn check_geometry(geometry: &ChunkGeometry, capacity: usize) -> BackendResult<()> {
    if geometry.nchans == 0 || geometry.row_len == 0 {
        return Err(BackendError::InvalidGeometry(format!(
            "empty geometry {} x {}",
            geometry.nchans, geometry.row_len
        )));
    }
    if geometry.total() > capacity {
        return Err(BackendError::InvalidGeometry(format!(
            "{} channels x {} samples exceed buffer capacity {}",
            geometry.nchans, geometry.row_len, capacity
        )));
    }
    Ok(())
}

fn mean_and_sigma(values: impl Iterator<Item = f32> + Clone) -> (f32, f32) {
    let (sum, count) = values.clone().fold((0.0f64, 0usize), |(s, n), v| (s + v as f64, n + 1));
    if count == 0 {
        return (0.0, 0.0);
    }
    let mean = sum / count as f64;
    let var = values.fold(0.0f64, |acc, v| {
        let d = v as f64 - mean;
        acc + d * d
    }) / count as f64;
    (mean as f32, var.sqrt() as f32)
}

/// Remove `baseline` and re-centre on `level`, clamped to the bit depth
fn recentre(row: &mut [u16], baseline: f32, level: f32, max_value: f32) {
    for v in row.iter_mut() {
        *v = (*v as f32 - baseline + level).round().clamp(0.0, max_value) as u16;
    }
}

fn dynamic_range(nbits: u32) -> (f32, f32) {
    let max_value = ((1u32 << nbits.clamp(1, 16)) - 1) as f32;
    (max_value, (max_value + 1.0) / 2.0)
}

fn robust_baseline(row: &[u16]) -> f32 {
    let mut keep = vec![true; row.len()];
    let mut mean = 0.0;
    for _ in 0..OUTLIER_ITERATIONS {
        let kept = row
            .iter()
            .zip(keep.iter())
            .filter(|(_, k)| **k)
            .map(|(v, _)| *v as f32);
        let (m, sigma) = mean_and_sigma(kept);
        mean = m;
        if sigma == 0.0 {
            break;
        }
        let mut changed = false;
        for (v, k) in row.iter().zip(keep.iter_mut()) {
            let inside = (*v as f32 - mean).abs() <= OUTLIER_SIGMA * sigma;
            if *k != inside {
                *k = inside;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
    mean
}

impl DdtrBackend for CpuBackend {
    type Input = CpuBuffer<u16>;
    type Output = CpuBuffer<f32>;

    fn backend_name(&self) -> &str {
        &self.name
    }

    fn allocate_input(&mut self, samples: usize) -> BackendResult<Self::Input> {
        self.allocate(samples)
    }

    fn allocate_output(&mut self, values: usize) -> BackendResult<Self::Output> {
        self.allocate(values)
    }

    fn load_chunk(
        &mut self,
        input: &mut Self::Input,
        host: &[u16],
        params: &LoadParams<'_>,
    ) -> BackendResult<()> {
        let len = params.window_len();
        if host.len() != len {
            return Err(BackendError::InvalidGeometry(format!(
                "host window holds {} samples, expected {}",
                host.len(),
                len
            )));
        }
        if params.dm_shifts.len() != params.nchans {
            return Err(BackendError::InvalidGeometry(format!(
                "{} shift entries for {} channels",
                params.dm_shifts.len(),
                params.nchans
            )));
        }
        let capacity = input.len();
        let dst = input.data.get_mut(..len).ok_or_else(|| {
            BackendError::InvalidGeometry(format!(
                "chunk window {} exceeds input capacity {}",
                len, capacity
            ))
        })?;
        dst.copy_from_slice(host);

        self.dm_shifts.clear();
        self.dm_shifts.extend_from_slice(params.dm_shifts);
        self.staged_range = None;
        Ok(())
    }

    fn load_range(&mut self, _input: &mut Self::Input, range: &RangeLoad) -> BackendResult<()> {
        if self.dm_shifts.is_empty() {
            return Err(BackendError::InvalidGeometry(
                "no chunk loaded before range staging".to_string(),
            ));
        }
        range.check_coverage()?;
        self.staged_range = Some(*range);
        Ok(())
    }

    fn zero_dm(
        &mut self,
        input: &mut Self::Input,
        geometry: &ChunkGeometry,
        nbits: u32,
    ) -> BackendResult<()> {
        check_geometry(geometry, input.len())?;
        let (max_value, level) = dynamic_range(nbits);
        input.data[..geometry.total()]
            .par_chunks_mut(geometry.nchans)
            .for_each(|row| {
                let (baseline, _) = mean_and_sigma(row.iter().map(|v| *v as f32));
                recentre(row, baseline, level, max_value);
            });
        Ok(())
    }

    fn zero_dm_outliers(
        &mut self,
        input: &mut Self::Input,
        geometry: &ChunkGeometry,
        nbits: u32,
    ) -> BackendResult<()> {
        check_geometry(geometry, input.len())?;
        let (max_value, level) = dynamic_range(nbits);
        input.data[..geometry.total()]
            .par_chunks_mut(geometry.nchans)
            .for_each(|row| {
                let baseline = robust_baseline(row);
                recentre(row, baseline, level, max_value);
            });
        Ok(())
    }

    fn corner_turn(
        &mut self,
        input: &mut Self::Input,
        output: &mut Self::Output,
        geometry: &ChunkGeometry,
    ) -> BackendResult<()> {
        check_geometry(geometry, input.len())?;
        check_geometry(geometry, output.len())?;
        let (nchans, rows, total) = (geometry.nchans, geometry.row_len, geometry.total());

        let src = &input.data[..total];
        let scratch = &mut output.data[..total];
        scratch
            .par_chunks_mut(rows)
            .enumerate()
            .for_each(|(c, dst)| {
                for (t, v) in dst.iter_mut().enumerate() {
                    *v = src[t * nchans + c] as f32;
                }
            });

        input.data[..total]
            .par_iter_mut()
            .zip(output.data[..total].par_iter())
            .for_each(|(d, s)| *d = *s as u16);
        Ok(())
    }

    fn legacy_rfi(&mut self, input: &mut Self::Input, geometry: &ChunkGeometry) -> BackendResult<()> {
        check_geometry(geometry, input.len())?;
        input.data[..geometry.total()]
            .par_chunks_mut(geometry.row_len)
            .for_each(|channel| {
                let (mean, sigma) = mean_and_sigma(channel.iter().map(|v| *v as f32));
                if sigma == 0.0 {
                    return;
                }
                let fill = mean.round() as u16;
                for v in channel.iter_mut() {
                    if (*v as f32 - mean).abs() > RFI_SIGMA * sigma {
                        *v = fill;
                    }
                }
            });
        Ok(())
    }

    fn bin(
        &mut self,
        input: &mut Self::Input,
        output: &mut Self::Output,
        geometry: &ChunkGeometry,
    ) -> BackendResult<usize> {
        check_geometry(geometry, input.len())?;
        let rows = geometry.row_len;
        let binned = rows / 2;
        if binned == 0 {
            return Err(BackendError::InvalidGeometry(format!(
                "cannot bin a row of {} samples",
                rows
            )));
        }
        let total = geometry.nchans * binned;
        if total > output.len() {
            return Err(BackendError::InvalidGeometry(format!(
                "binned data {} exceeds scratch capacity {}",
                total,
                output.len()
            )));
        }

        let src = &input.data[..geometry.total()];
        output.data[..total]
            .par_chunks_mut(binned)
            .enumerate()
            .for_each(|(c, dst)| {
                let row = &src[c * rows..(c + 1) * rows];
                for (t, v) in dst.iter_mut().enumerate() {
                    *v = ((row[2 * t] as u32 + row[2 * t + 1] as u32) / 2) as f32;
                }
            });

        input.data[..total]
            .par_iter_mut()
            .zip(output.data[..total].par_iter())
            .for_each(|(d, s)| *d = *s as u16);
        Ok(binned)
    }

    fn dedisperse(
        &mut self,
        input: &Self::Input,
        output: &mut Self::Output,
        job: &DedispersionJob,
    ) -> BackendResult<()> {
        match self.staged_range {
            Some(staged) if staged.range == job.range => {}
            _ => {
                return Err(BackendError::InvalidGeometry(format!(
                    "range {} dedispersed without being staged",
                    job.range
                )))
            }
        }
        check_geometry(&job.geometry, input.len())?;
        check_job(job, &self.dm_shifts, output.len())?;
        if job.nsamp == 0 || job.ndms == 0 {
            return Ok(());
        }

        let rows = job.geometry.row_len;
        let resident = &input.data[..job.geometry.total()];
        let shifts = &self.dm_shifts;
        output.data[..job.output_len()]
            .par_chunks_mut(job.nsamp)
            .enumerate()
            .for_each(|(j, trial)| {
                let dm = job.dm(j);
                trial.fill(0.0);
                for (c, shift) in shifts.iter().enumerate() {
                    let start = c * rows + trial_shift(*shift, dm, job.bin_factor);
                    let src = &resident[start..start + job.nsamp];
                    for (acc, v) in trial.iter_mut().zip(src) {
                        *acc += *v as f32;
                    }
                }
            });
        Ok(())
    }

    fn read_trials(
        &mut self,
        output: &Self::Output,
        offset: usize,
        dst: &mut [f32],
    ) -> BackendResult<()> {
        let src = output.data.get(offset..offset + dst.len()).ok_or_else(|| {
            BackendError::InvalidGeometry(format!(
                "read of {} values at {} exceeds output capacity {}",
                dst.len(),
                offset,
                output.len()
            ))
        })?;
        dst.copy_from_slice(src);
        Ok(())
    }

    fn synchronize(&mut self) -> BackendResult<()> {
        Ok(())
    }
}
