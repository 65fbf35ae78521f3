// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Configuration type definitions
//!
//! This module defines all configuration structs that map to sections in
//! `ddtr_configuration.toml`.

use std::path::PathBuf;

use ddtr_engine::{BackendConfig, BackendType, PipelineOptions, ZeroDmMode};
use ddtr_strategy::{DmRange, FilterbankMetadata};
use serde::{Deserialize, Serialize};

use crate::{ConfigError, ConfigResult};

/// Root configuration structure
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DdtrConfig {
    pub observation: ObservationConfig,
    pub pipeline: PipelineConfig,
    pub backend: ComputeBackendConfig,
    pub logging: LoggingConfig,
    /// `[[dm_ranges]]` tables, in sweep order
    pub dm_ranges: Vec<DmRangeConfig>,
}

impl Default for DdtrConfig {
    fn default() -> Self {
        Self {
            observation: ObservationConfig::default(),
            pipeline: PipelineConfig::default(),
            backend: ComputeBackendConfig::default(),
            logging: LoggingConfig::default(),
            dm_ranges: vec![
                DmRangeConfig::new(0.0, 100.0, 1.0, 1),
                DmRangeConfig::new(100.0, 200.0, 2.0, 2),
                DmRangeConfig::new(200.0, 400.0, 4.0, 4),
            ],
        }
    }
}

impl DdtrConfig {
    pub fn metadata(&self) -> FilterbankMetadata {
        self.observation.metadata()
    }

    pub fn ranges(&self) -> Vec<DmRange> {
        self.dm_ranges.iter().map(DmRangeConfig::to_range).collect()
    }
}

/// Observation being dedispersed
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservationConfig {
    pub nchans: usize,
    pub nbits: u32,
    /// Sampling interval in seconds
    pub tsamp: f32,
    pub nsamples: usize,
    /// Frequency of channel 0 (MHz)
    pub fch1: f64,
    /// Channel width (MHz)
    pub foff: f64,
    /// Raw native-endian `u16` samples, time-major; synthetic data when unset
    pub input_file: Option<PathBuf>,
    /// Seed for synthetic observations
    pub seed: u64,
}

impl Default for ObservationConfig {
    fn default() -> Self {
        Self {
            nchans: 256,
            nbits: 8,
            tsamp: 0.000064,
            nsamples: 131_072,
            fch1: 1550.0,
            foff: -1.171875,
            input_file: None,
            seed: 42,
        }
    }
}

impl ObservationConfig {
    pub fn metadata(&self) -> FilterbankMetadata {
        FilterbankMetadata {
            nchans: self.nchans,
            nbits: self.nbits,
            tsamp: self.tsamp,
            nsamples: self.nsamples,
            fch1: self.fch1,
            foff: self.foff,
        }
    }
}

/// One `[[dm_ranges]]` table
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct DmRangeConfig {
    pub low: f32,
    pub high: f32,
    pub step: f32,
    #[serde(default = "default_bin_factor")]
    pub bin_factor: u32,
}

fn default_bin_factor() -> u32 {
    1
}

impl DmRangeConfig {
    pub fn new(low: f32, high: f32, step: f32, bin_factor: u32) -> Self {
        Self {
            low,
            high,
            step,
            bin_factor,
        }
    }

    pub fn to_range(&self) -> DmRange {
        DmRange::new(self.low, self.high, self.step, self.bin_factor)
    }
}

/// Chunking and preprocessing
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Upper bound on range-0 samples per chunk
    pub chunk_samples: usize,
    /// "off", "zero_dm" or "zero_dm_with_outliers"
    pub zero_dm: String,
    pub legacy_rfi: bool,
    pub dump_to_disk: bool,
    pub output_dir: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chunk_samples: 16_384,
            zero_dm: "off".to_string(),
            legacy_rfi: false,
            dump_to_disk: false,
            output_dir: PathBuf::from("."),
        }
    }
}

impl PipelineConfig {
    pub fn zero_dm_mode(&self) -> ConfigResult<ZeroDmMode> {
        self.zero_dm
            .parse()
            .map_err(|e| ConfigError::InvalidValue(format!("pipeline.zero_dm: {}", e)))
    }

    pub fn options(&self) -> ConfigResult<PipelineOptions> {
        Ok(PipelineOptions {
            zero_dm: self.zero_dm_mode()?,
            legacy_rfi: self.legacy_rfi,
            output_dir: self.output_dir.clone(),
        })
    }
}

/// Compute backend selection
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ComputeBackendConfig {
    /// "cpu", "wgpu" or "auto"
    #[serde(rename = "type")]
    pub backend_type: String,
    pub force_cpu: bool,
    /// Minimum raw samples per chunk before the GPU is considered
    pub gpu_work_threshold: usize,
    /// CPU backend memory cap in MiB, 0 = unlimited
    pub memory_limit_mb: usize,
}

impl Default for ComputeBackendConfig {
    fn default() -> Self {
        let selection = BackendConfig::default();
        Self {
            backend_type: "auto".to_string(),
            force_cpu: selection.force_cpu,
            gpu_work_threshold: selection.gpu_work_threshold,
            memory_limit_mb: 0,
        }
    }
}

impl ComputeBackendConfig {
    pub fn backend_type(&self) -> ConfigResult<BackendType> {
        self.backend_type
            .parse()
            .map_err(|e| ConfigError::InvalidValue(format!("backend.type: {}", e)))
    }

    pub fn selection(&self) -> BackendConfig {
        BackendConfig {
            gpu_work_threshold: self.gpu_work_threshold,
            force_cpu: self.force_cpu,
        }
    }

    pub fn memory_limit_bytes(&self) -> Option<usize> {
        match self.memory_limit_mb {
            0 => None,
            mb => Some(mb.saturating_mul(1024 * 1024)),
        }
    }
}

/// Logging output
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing` filter directive, e.g. "info" or "ddtr_engine=debug"
    pub level: String,
    /// JSON log files under timestamped run folders when set
    pub log_dir: Option<PathBuf>,
    /// Run folders older than this are deleted at startup
    pub retention_days: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_dir: None,
            retention_days: 7,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_ranges_double_bin() {
        let ranges = DdtrConfig::default().ranges();
        assert_eq!(ranges.len(), 3);
        assert_eq!(ranges[0].bin_factor, 1);
        assert_eq!(ranges[2].bin_factor, 4);
    }

    #[test]
    fn test_string_options_convert() {
        let mut pipeline = PipelineConfig::default();
        pipeline.zero_dm = "zero_dm_with_outliers".to_string();
        pipeline.legacy_rfi = true;
        let options = pipeline.options().unwrap();
        assert_eq!(options.zero_dm, ZeroDmMode::ZeroDmWithOutliers);
        assert!(options.legacy_rfi);

        pipeline.zero_dm = "median".to_string();
        assert!(matches!(pipeline.options(), Err(ConfigError::InvalidValue(_))));

        let mut backend = ComputeBackendConfig::default();
        assert_eq!(backend.backend_type().unwrap(), BackendType::Auto);
        backend.backend_type = "gpu".to_string();
        assert_eq!(backend.backend_type().unwrap(), BackendType::Wgpu);
        assert_eq!(backend.memory_limit_bytes(), None);
        backend.memory_limit_mb = 2;
        assert_eq!(backend.memory_limit_bytes(), Some(2 * 1024 * 1024));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: DdtrConfig = toml::from_str(
            r#"
            [observation]
            nchans = 64

            [[dm_ranges]]
            low = 0.0
            high = 10.0
            step = 0.5
            "#,
        )
        .unwrap();
        assert_eq!(config.observation.nchans, 64);
        assert_eq!(config.observation.nbits, 8);
        assert_eq!(config.dm_ranges, vec![DmRangeConfig::new(0.0, 10.0, 0.5, 1)]);
        assert_eq!(config.pipeline.chunk_samples, 16_384);
    }
}
