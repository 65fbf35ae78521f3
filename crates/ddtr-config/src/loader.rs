// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Configuration file loading with override support
//!
//! This module implements the 3-tier configuration loading system:
//! 1. TOML file (base defaults)
//! 2. Environment variables (runtime overrides)
//! 3. CLI arguments (explicit user overrides)

use crate::{ConfigError, ConfigResult, DdtrConfig};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

const CONFIG_FILE_NAME: &str = "ddtr_configuration.toml";

/// Find the DDTR configuration file
///
/// Search order:
/// 1. `DDTR_CONFIG_PATH` environment variable
/// 2. Current working directory: `./ddtr_configuration.toml`
/// 3. Up to 5 parent directories
///
/// # Errors
///
/// Returns `ConfigError::FileNotFound` if no config file is found in any location
pub fn find_config_file() -> ConfigResult<PathBuf> {
    if let Ok(env_path) = env::var("DDTR_CONFIG_PATH") {
        let path = PathBuf::from(env_path);
        if path.exists() {
            return Ok(path);
        }
        return Err(ConfigError::FileNotFound(format!(
            "Config file specified by DDTR_CONFIG_PATH not found: {}",
            path.display()
        )));
    }

    let mut search_paths = Vec::new();
    if let Ok(cwd) = env::current_dir() {
        search_paths.push(cwd.join(CONFIG_FILE_NAME));
        search_paths.extend(cwd.ancestors().skip(1).take(5).map(|dir| dir.join(CONFIG_FILE_NAME)));
    }

    if let Some(path) = search_paths.iter().find(|p| p.exists()) {
        return Ok(path.clone());
    }

    let search_list = search_paths
        .iter()
        .map(|p| format!("  - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n");

    Err(ConfigError::FileNotFound(format!(
        "DDTR configuration file '{}' not found in any of these locations:\n{}\n\nSet DDTR_CONFIG_PATH environment variable to specify custom location.",
        CONFIG_FILE_NAME, search_list
    )))
}

/// Load configuration from TOML file
///
/// # Arguments
///
/// * `config_path` - Optional path to config file. If `None`, will search for config file.
/// * `cli_args` - Optional CLI argument overrides
///
/// # Errors
///
/// Returns error if config file is not found or contains invalid TOML
pub fn load_config(
    config_path: Option<&Path>,
    cli_args: Option<&HashMap<String, String>>,
) -> ConfigResult<DdtrConfig> {
    let config_file = match config_path {
        Some(path) => path.to_path_buf(),
        None => find_config_file()?,
    };

    let content = fs::read_to_string(&config_file)?;
    let mut config: DdtrConfig = toml::from_str(&content)?;

    apply_environment_overrides(&mut config);
    if let Some(cli) = cli_args {
        apply_cli_overrides(&mut config, cli);
    }

    Ok(config)
}

fn parse_flag(value: &str) -> bool {
    matches!(value.to_lowercase().as_str(), "true" | "1" | "yes" | "on")
}

fn set_parsed<T: FromStr>(target: &mut T, value: Option<String>) {
    if let Some(parsed) = value.and_then(|v| v.parse().ok()) {
        *target = parsed;
    }
}

/// Apply environment variable overrides to configuration
///
/// Supported environment variables:
/// - `DDTR_NCHANS` -> `observation.nchans`
/// - `DDTR_NSAMPLES` -> `observation.nsamples`
/// - `DDTR_TSAMP` -> `observation.tsamp`
/// - `DDTR_INPUT_FILE` -> `observation.input_file`
/// - `DDTR_CHUNK_SAMPLES` -> `pipeline.chunk_samples`
/// - `DDTR_ZERO_DM` -> `pipeline.zero_dm`
/// - `DDTR_LEGACY_RFI` -> `pipeline.legacy_rfi`
/// - `DDTR_DUMP_TO_DISK` -> `pipeline.dump_to_disk`
/// - `DDTR_OUTPUT_DIR` -> `pipeline.output_dir`
/// - `DDTR_BACKEND` -> `backend.type`
/// - `DDTR_FORCE_CPU` -> `backend.force_cpu`
/// - `DDTR_LOG_LEVEL` -> `logging.level`
/// - `DDTR_LOG_DIR` -> `logging.log_dir`
pub fn apply_environment_overrides(config: &mut DdtrConfig) {
    let var = |name: &str| env::var(name).ok();

    set_parsed(&mut config.observation.nchans, var("DDTR_NCHANS"));
    set_parsed(&mut config.observation.nsamples, var("DDTR_NSAMPLES"));
    set_parsed(&mut config.observation.tsamp, var("DDTR_TSAMP"));
    if let Some(value) = var("DDTR_INPUT_FILE") {
        config.observation.input_file = Some(PathBuf::from(value));
    }

    set_parsed(&mut config.pipeline.chunk_samples, var("DDTR_CHUNK_SAMPLES"));
    if let Some(value) = var("DDTR_ZERO_DM") {
        config.pipeline.zero_dm = value;
    }
    if let Some(value) = var("DDTR_LEGACY_RFI") {
        config.pipeline.legacy_rfi = parse_flag(&value);
    }
    if let Some(value) = var("DDTR_DUMP_TO_DISK") {
        config.pipeline.dump_to_disk = parse_flag(&value);
    }
    if let Some(value) = var("DDTR_OUTPUT_DIR") {
        config.pipeline.output_dir = PathBuf::from(value);
    }

    if let Some(value) = var("DDTR_BACKEND") {
        config.backend.backend_type = value;
    }
    if let Some(value) = var("DDTR_FORCE_CPU") {
        config.backend.force_cpu = parse_flag(&value);
    }

    if let Some(value) = var("DDTR_LOG_LEVEL") {
        config.logging.level = value;
    }
    if let Some(value) = var("DDTR_LOG_DIR") {
        config.logging.log_dir = Some(PathBuf::from(value));
    }
}

/// Apply CLI argument overrides to configuration
///
/// # Arguments
///
/// * `config` - Configuration to modify
/// * `cli_args` - HashMap of CLI arguments (e.g., `{"chunk_samples": "8192", "backend": "cpu"}`)
pub fn apply_cli_overrides(config: &mut DdtrConfig, cli_args: &HashMap<String, String>) {
    let arg = |name: &str| cli_args.get(name).cloned();

    set_parsed(&mut config.observation.nchans, arg("nchans"));
    set_parsed(&mut config.observation.nsamples, arg("nsamples"));
    set_parsed(&mut config.observation.seed, arg("seed"));
    if let Some(value) = arg("input_file") {
        config.observation.input_file = Some(PathBuf::from(value));
    }

    set_parsed(&mut config.pipeline.chunk_samples, arg("chunk_samples"));
    if let Some(value) = arg("zero_dm") {
        config.pipeline.zero_dm = value;
    }
    if let Some(value) = arg("legacy_rfi") {
        config.pipeline.legacy_rfi = parse_flag(&value);
    }
    if let Some(value) = arg("dump_to_disk") {
        config.pipeline.dump_to_disk = parse_flag(&value);
    }
    if let Some(value) = arg("output_dir") {
        config.pipeline.output_dir = PathBuf::from(value);
    }

    if let Some(value) = arg("backend") {
        config.backend.backend_type = value;
    }
    if let Some(value) = arg("log_level") {
        config.logging.level = value;
    }
}
