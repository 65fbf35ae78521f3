// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Observation metadata

use crate::{Result, StrategyError};

/// Filterbank observation parameters the plan was built for
#[derive(Debug, Clone, PartialEq)]
pub struct FilterbankMetadata {
    /// Number of frequency channels
    pub nchans: usize,
    /// Bits per raw sample (1..=16)
    pub nbits: u32,
    /// Sampling interval in seconds
    pub tsamp: f32,
    /// Total number of time samples in the observation
    pub nsamples: usize,
    /// Frequency of the first channel (MHz)
    pub fch1: f64,
    /// Channel bandwidth (MHz), negative for descending bands
    pub foff: f64,
}

impl FilterbankMetadata {
    pub fn nchans(&self) -> usize {
        self.nchans
    }

    pub fn nbits(&self) -> u32 {
        self.nbits
    }

    pub fn tsamp(&self) -> f32 {
        self.tsamp
    }

    pub fn nsamples(&self) -> usize {
        self.nsamples
    }

    /// Largest raw sample value representable at this bit depth
    pub fn max_sample_value(&self) -> u32 {
        (1u32 << self.nbits) - 1
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.nchans == 0 {
            return Err(StrategyError::InvalidMetadata(
                "channel count must be positive".to_string(),
            ));
        }
        if self.nbits == 0 || self.nbits > 16 {
            return Err(StrategyError::InvalidMetadata(format!(
                "bit depth {} outside 1..=16",
                self.nbits
            )));
        }
        if !(self.tsamp.is_finite() && self.tsamp > 0.0) {
            return Err(StrategyError::InvalidMetadata(format!(
                "sampling interval {} must be finite and positive",
                self.tsamp
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> FilterbankMetadata {
        FilterbankMetadata {
            nchans: 64,
            nbits: 8,
            tsamp: 0.000064,
            nsamples: 4096,
            fch1: 1500.0,
            foff: -1.0,
        }
    }

    #[test]
    fn test_max_sample_value() {
        assert_eq!(metadata().max_sample_value(), 255);
        let mut m = metadata();
        m.nbits = 16;
        assert_eq!(m.max_sample_value(), 65535);
    }

    #[test]
    fn test_validate_rejects_bad_bit_depth() {
        let mut m = metadata();
        m.nbits = 32;
        assert!(matches!(
            m.validate(),
            Err(StrategyError::InvalidMetadata(_))
        ));
    }

    #[test]
    fn test_validate_rejects_zero_tsamp() {
        let mut m = metadata();
        m.tsamp = 0.0;
        assert!(m.validate().is_err());
    }
}
