// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! # ddtr-observability
//!
//! Logging setup shared by the DDTR binaries, with per-crate debug flag
//! support (`--debug-ddtr-engine`, `DDTR_DEBUG=ddtr-engine`).
//!
//! ## Features
//! - `file-logging`: JSON run logs under timestamped folders, with retention

/// Crate version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod cli;
pub mod init;

pub use cli::*;
pub use init::*;

/// Known DDTR crate names for debug flags
pub const KNOWN_CRATES: &[&str] = &[
    "ddtr",
    "ddtr-strategy",
    "ddtr-engine",
    "ddtr-config",
    "ddtr-observability",
    "ddtr-run",
];
