// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

/*
 * Copyright 2025 Neuraville Inc.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! # DDTR Strategy
//!
//! Immutable description of a dedispersion run, produced once before the
//! pipeline starts and only ever read afterwards:
//!
//! - observation metadata (channel count, bit depth, sampling interval)
//! - the ordered DM ranges with their time-binning factors
//! - the `(range, chunk)` table of samples processed per chunk
//! - the per-channel shift table and the maximum shift it implies
//!
//! Chunk boundaries are normally computed by an external planner. The
//! [`DdtrStrategy::uniform`] constructor is a small convenience planner for
//! drivers and tests that only need evenly sized chunks.

/// Crate version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod error;
pub mod metadata;
pub mod range;
pub mod shifts;
pub mod strategy;
pub mod table;

pub use error::{Result, StrategyError};
pub use metadata::FilterbankMetadata;
pub use range::DmRange;
pub use shifts::{dm_shifts_from_frequencies, DISPERSION_CONSTANT};
pub use strategy::DdtrStrategy;
pub use table::ChunkTable;
