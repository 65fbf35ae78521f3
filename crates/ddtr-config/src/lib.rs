// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! # DDTR Configuration System
//!
//! Type-safe configuration loader for dedispersion runs with support for:
//! - TOML file parsing
//! - Environment variable overrides
//! - CLI argument overrides
//!
//! ## Usage
//!
//! ```rust,no_run
//! use ddtr_config::{load_config, validate_config};
//!
//! let config = load_config(None, None).expect("Failed to load config");
//! validate_config(&config).expect("Invalid config");
//!
//! println!("Channels: {}", config.observation.nchans);
//! println!("Chunk samples: {}", config.pipeline.chunk_samples);
//! ```
//!
//! Precedence, lowest to highest: built-in defaults, `ddtr_configuration.toml`,
//! `DDTR_*` environment variables, CLI overrides.

/// Crate version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod loader;
pub mod types;
pub mod validation;

pub use loader::{apply_cli_overrides, apply_environment_overrides, find_config_file, load_config};
pub use types::*;
pub use validation::{validate_config, ConfigValidationError};

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config file not found. Searched: {0}")]
    FileNotFound(String),

    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid TOML syntax: {0}")]
    ParseError(String),

    #[error("Validation failed: {0}")]
    ValidationError(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        ConfigError::ParseError(err.to_string())
    }
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_round_trips_through_toml() {
        let config = DdtrConfig::default();
        let text = toml::to_string(&config).unwrap();
        let parsed: DdtrConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }
}
