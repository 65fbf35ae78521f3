// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! # Output Sink
//!
//! Host-side capture of dedispersed trials and the per-chunk disk artifact.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::error::SinkError;
use ddtr_strategy::DdtrStrategy;
use tracing::{debug, error};

/// Dedispersed trials indexed `[range][trial][sample]`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CaptureBuffer {
    data: Vec<Vec<Vec<f32>>>,
}

/// Samples of one range written during one chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureWindow {
    pub range: usize,
    pub offset: usize,
    pub len: usize,
}

impl CaptureBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Samples each range needs so every chunk's window fits
    ///
    /// Windows start at `samples_before_chunk / bin_factor`, so a range whose
    /// chunks are shorter than the binned range-0 chunk may need more than
    /// its own total.
    pub fn required_lengths(strategy: &DdtrStrategy) -> Vec<usize> {
        let table = strategy.t_processed();
        strategy
            .ranges()
            .iter()
            .enumerate()
            .map(|(r, range)| {
                let bin = range.bin_factor as usize;
                let mut processed = 0usize;
                let mut furthest = 0usize;
                for k in 0..table.num_chunks() {
                    let end = processed / bin + table.get(r, k).unwrap_or(0);
                    furthest = furthest.max(end);
                    processed += table.get(0, k).unwrap_or(0);
                }
                furthest.max(table.range_total(r))
            })
            .collect()
    }

    /// Grow to `[range][ndms(range)][samples]` for `strategy`
    ///
    /// Only dimensions that are too small are grown; nothing ever shrinks.
    /// Returns whether anything changed.
    pub fn shape_for(&mut self, strategy: &DdtrStrategy) -> bool {
        let lengths = Self::required_lengths(strategy);
        let mut changed = false;

        if self.data.len() < lengths.len() {
            self.data.resize_with(lengths.len(), Vec::new);
            changed = true;
        }
        for (r, (trials, len)) in self.data.iter_mut().zip(lengths).enumerate() {
            let ndms = strategy.ndms(r);
            if trials.len() < ndms {
                trials.resize_with(ndms, Vec::new);
                changed = true;
            }
            for trial in trials.iter_mut().take(ndms) {
                if trial.len() < len {
                    trial.resize(len, 0.0);
                    changed = true;
                }
            }
        }
        changed
    }

    /// Mutable slice `[offset .. offset + len]` of one trial
    pub fn capture_window(
        &mut self,
        range: usize,
        trial: usize,
        offset: usize,
        len: usize,
    ) -> Option<&mut [f32]> {
        self.data
            .get_mut(range)?
            .get_mut(trial)?
            .get_mut(offset..offset.checked_add(len)?)
    }

    /// Copy `samples` into a trial starting at `offset`
    pub fn capture(&mut self, range: usize, trial: usize, offset: usize, samples: &[f32]) -> bool {
        match self.capture_window(range, trial, offset, samples.len()) {
            Some(window) => {
                window.copy_from_slice(samples);
                true
            }
            None => false,
        }
    }

    pub fn trial(&self, range: usize, trial: usize) -> Option<&[f32]> {
        self.data.get(range)?.get(trial).map(Vec::as_slice)
    }

    pub fn num_ranges(&self) -> usize {
        self.data.len()
    }

    pub fn num_trials(&self, range: usize) -> usize {
        self.data.get(range).map(Vec::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_nested(&self) -> &[Vec<Vec<f32>>] {
        &self.data
    }
}

/// Append-only per-chunk artifact writer
#[derive(Debug, Clone)]
pub struct DiskSink {
    output_dir: PathBuf,
}

impl DiskSink {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// `<output_dir>/DD_data_chunk_<chunk_index>.dat`
    pub fn artifact_path(&self, chunk_index: usize) -> PathBuf {
        self.output_dir
            .join(format!("DD_data_chunk_{}.dat", chunk_index))
    }

    /// Append one chunk's windows of every trial to its artifact
    ///
    /// The artifact holds only this chunk's window of each trial, never the
    /// samples captured by earlier chunks.
    ///
    /// Records are native-endian `f32`, ordered range, trial, sample. The
    /// payload is built in memory before the file is opened, so an open
    /// failure writes nothing; a failed write is truncated back to the
    /// length the file had before the call.
    pub fn flush_chunk(
        &self,
        chunk_index: usize,
        capture: &CaptureBuffer,
        windows: &[CaptureWindow],
    ) -> Result<PathBuf, SinkError> {
        let path = self.artifact_path(chunk_index);

        let mut payload: Vec<u8> = Vec::new();
        for window in windows {
            for trial in 0..capture.num_trials(window.range) {
                let samples = capture
                    .trial(window.range, trial)
                    .and_then(|t| t.get(window.offset..window.offset + window.len))
                    .ok_or(SinkError::WindowOutOfBounds {
                        range: window.range,
                        offset: window.offset,
                        len: window.len,
                    })?;
                payload.extend_from_slice(bytemuck::cast_slice(samples));
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| {
                error!("[DDTR-SINK] Cannot open {:?}: {}", path, source);
                SinkError::Open {
                    path: path.clone(),
                    source,
                }
            })?;
        append_whole(&mut file, &payload).map_err(|source| {
            error!("[DDTR-SINK] Write to {:?} failed: {}", path, source);
            SinkError::Write {
                path: path.clone(),
                source,
            }
        })?;

        debug!(
            "[DDTR-SINK] Appended {} bytes to {:?}",
            payload.len(),
            path
        );
        Ok(path)
    }
}

/// Append target that can be cut back to an earlier length
trait Truncatable: Write {
    fn current_len(&self) -> io::Result<u64>;

    fn truncate_to(&mut self, len: u64) -> io::Result<()>;
}

impl Truncatable for File {
    fn current_len(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn truncate_to(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }
}

/// Write all of `payload` or leave `out` at its original length
fn append_whole<W: Truncatable>(out: &mut W, payload: &[u8]) -> io::Result<()> {
    let original = out.current_len()?;
    let written = out.write_all(payload).and_then(|_| out.flush());
    if let Err(e) = written {
        if let Err(undo) = out.truncate_to(original) {
            error!(
                "[DDTR-SINK] Cannot truncate partial write back to {} bytes: {}",
                original, undo
            );
        }
        return Err(e);
    }
    Ok(())
}
