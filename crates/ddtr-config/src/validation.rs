// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Configuration validation
//!
//! Checks that configuration values are within valid ranges and consistent
//! with each other before a plan is built from them. Every problem found is
//! reported, not just the first.

use crate::{ConfigError, ConfigResult, DdtrConfig};

/// Validation errors that can occur during config validation
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValidationError {
    MissingRequired { field: String },
    InvalidValue { field: String, reason: String },
}

impl std::fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingRequired { field } => {
                write!(f, "Missing required configuration: {}", field)
            }
            Self::InvalidValue { field, reason } => {
                write!(f, "Invalid configuration value for {}: {}", field, reason)
            }
        }
    }
}

fn invalid(field: impl Into<String>, reason: impl Into<String>) -> ConfigValidationError {
    ConfigValidationError::InvalidValue {
        field: field.into(),
        reason: reason.into(),
    }
}

/// Validate the complete configuration
///
/// # Errors
///
/// Returns `ConfigError::ValidationError` listing every failed check
pub fn validate_config(config: &DdtrConfig) -> ConfigResult<()> {
    let mut errors = Vec::new();

    validate_observation(config, &mut errors);
    validate_dm_ranges(config, &mut errors);
    validate_pipeline(config, &mut errors);
    validate_backend(config, &mut errors);

    if !errors.is_empty() {
        let error_messages = errors
            .iter()
            .map(|e| format!("  - {}", e))
            .collect::<Vec<_>>()
            .join("\n");

        return Err(ConfigError::ValidationError(format!(
            "Configuration validation failed:\n{}",
            error_messages
        )));
    }

    Ok(())
}

fn validate_observation(config: &DdtrConfig, errors: &mut Vec<ConfigValidationError>) {
    let observation = &config.observation;
    if observation.nchans == 0 {
        errors.push(invalid("observation.nchans", "must be positive"));
    }
    if observation.nbits == 0 || observation.nbits > 16 {
        errors.push(invalid("observation.nbits", "must be between 1 and 16"));
    }
    if !(observation.tsamp.is_finite() && observation.tsamp > 0.0) {
        errors.push(invalid("observation.tsamp", "must be positive"));
    }
    if observation.nsamples == 0 {
        errors.push(invalid("observation.nsamples", "must be positive"));
    }
    if observation.foff == 0.0 || !observation.foff.is_finite() {
        errors.push(invalid("observation.foff", "must be non-zero"));
    }
    let lowest = observation.fch1.min(observation.fch1 + observation.foff * observation.nchans as f64);
    if !(lowest.is_finite() && lowest > 0.0) {
        errors.push(invalid(
            "observation.fch1",
            "every channel frequency must be positive",
        ));
    }
    if let Some(path) = &observation.input_file {
        if path.as_os_str().is_empty() {
            errors.push(ConfigValidationError::MissingRequired {
                field: "observation.input_file".to_string(),
            });
        }
    }
}

fn validate_dm_ranges(config: &DdtrConfig, errors: &mut Vec<ConfigValidationError>) {
    if config.dm_ranges.is_empty() {
        errors.push(ConfigValidationError::MissingRequired {
            field: "dm_ranges".to_string(),
        });
        return;
    }

    let mut previous_bin = 1;
    for (index, range) in config.dm_ranges.iter().enumerate() {
        let field = |name: &str| format!("dm_ranges[{}].{}", index, name);
        if !(range.step.is_finite() && range.step > 0.0) {
            errors.push(invalid(field("step"), "must be positive"));
        }
        if !(range.low >= 0.0 && range.high > range.low) {
            errors.push(invalid(field("high"), "must exceed a non-negative low"));
        }
        let allowed = if index == 0 {
            range.bin_factor == 1
        } else {
            range.bin_factor == previous_bin || range.bin_factor == previous_bin * 2
        };
        if !allowed {
            errors.push(invalid(
                field("bin_factor"),
                format!(
                    "must equal or double the previous factor {} (first range starts at 1)",
                    previous_bin
                ),
            ));
        } else {
            previous_bin = range.bin_factor;
        }
    }
}

fn validate_pipeline(config: &DdtrConfig, errors: &mut Vec<ConfigValidationError>) {
    let max_bin = config
        .dm_ranges
        .iter()
        .map(|r| r.bin_factor as usize)
        .max()
        .unwrap_or(1)
        .max(1);
    if config.pipeline.chunk_samples < max_bin {
        errors.push(invalid(
            "pipeline.chunk_samples",
            format!("must be at least the largest bin factor {}", max_bin),
        ));
    }
    if let Err(e) = config.pipeline.zero_dm_mode() {
        errors.push(invalid("pipeline.zero_dm", e.to_string()));
    }
    if config.pipeline.output_dir.as_os_str().is_empty() {
        errors.push(ConfigValidationError::MissingRequired {
            field: "pipeline.output_dir".to_string(),
        });
    }
}

fn validate_backend(config: &DdtrConfig, errors: &mut Vec<ConfigValidationError>) {
    if let Err(e) = config.backend.backend_type() {
        errors.push(invalid("backend.type", e.to_string()));
    }
}
