// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! DM range records

use crate::{Result, StrategyError};

/// One DM range of the sweep
///
/// Trial `j` of the range dedisperses at `low + j * step`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DmRange {
    pub low: f32,
    pub high: f32,
    pub step: f32,
    /// Time-binning factor applied before dedispersing this range (power of two)
    pub bin_factor: u32,
}

impl DmRange {
    pub fn new(low: f32, high: f32, step: f32, bin_factor: u32) -> Self {
        Self {
            low,
            high,
            step,
            bin_factor,
        }
    }

    /// Number of DM trials in the range
    pub fn dm_count(&self) -> usize {
        let trials = ((self.high - self.low) / self.step).ceil();
        if trials.is_finite() && trials >= 1.0 {
            trials as usize
        } else {
            1
        }
    }

    /// DM value of trial `index`
    pub fn dm_at(&self, index: usize) -> f32 {
        self.low + self.step * index as f32
    }

    pub(crate) fn validate(&self, index: usize) -> Result<()> {
        let invalid = |reason: String| StrategyError::InvalidRange { index, reason };

        if !(self.low.is_finite() && self.high.is_finite() && self.step.is_finite()) {
            return Err(invalid("bounds and step must be finite".to_string()));
        }
        if self.low < 0.0 {
            return Err(invalid(format!("low DM {} is negative", self.low)));
        }
        if self.high <= self.low {
            return Err(invalid(format!(
                "high DM {} must exceed low DM {}",
                self.high, self.low
            )));
        }
        if self.step <= 0.0 {
            return Err(invalid(format!("step {} must be positive", self.step)));
        }
        if self.bin_factor == 0 || !self.bin_factor.is_power_of_two() {
            return Err(invalid(format!(
                "bin factor {} must be a power of two",
                self.bin_factor
            )));
        }
        Ok(())
    }
}
