// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! # Runner Interface
//!
//! The uniform `setup` / `advance` / `cleanup` contract an external driver
//! uses to run any pipeline without knowing its internals, plus a driver
//! loop that honours cooperative cancellation between chunks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::backend::DdtrBackend;
use crate::pipeline::DedispersionPipeline;
use tracing::{info, warn};

/// Pipeline lifecycle as seen by a driver
///
/// `advance` returns `true` while work was done and `false` when it was
/// not; `is_exhausted` reports whether that `false` means there is nothing
/// more to do. `cleanup` is safe to call any number of times.
pub trait PipelineRunner {
    fn name(&self) -> &str;

    fn setup(&mut self) -> bool;

    fn advance(&mut self) -> bool;

    fn is_exhausted(&self) -> bool;

    fn cleanup(&mut self) -> bool;
}

impl<B: DdtrBackend> PipelineRunner for DedispersionPipeline<'_, B> {
    fn name(&self) -> &str {
        self.backend().backend_name()
    }

    fn setup(&mut self) -> bool {
        DedispersionPipeline::setup(self)
    }

    fn advance(&mut self) -> bool {
        DedispersionPipeline::advance(self)
    }

    fn is_exhausted(&self) -> bool {
        DedispersionPipeline::is_exhausted(self)
    }

    fn cleanup(&mut self) -> bool {
        DedispersionPipeline::cleanup(self)
    }
}

/// Outcome of [`run_to_completion`]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunSummary {
    /// Advance calls that returned `true`
    pub chunks_advanced: usize,
    /// Stopped because every chunk was processed
    pub exhausted: bool,
    /// Stopped because `advance` returned `false` with chunks still pending
    pub failed: bool,
    /// Stopped because cancellation was requested
    pub cancelled: bool,
    pub setup_failed: bool,
    pub elapsed: Duration,
}

/// Drive a runner from setup through cleanup
///
/// `stop` is checked before every advance; a chunk already in flight always
/// completes. Cleanup runs on every exit path.
pub fn run_to_completion(runner: &mut dyn PipelineRunner, stop: &AtomicBool) -> RunSummary {
    let started = Instant::now();
    let mut summary = RunSummary::default();

    info!("[DDTR-RUNNER] Starting {}", runner.name());
    if !runner.setup() {
        warn!("[DDTR-RUNNER] ⚠️  Setup failed for {}", runner.name());
        summary.setup_failed = true;
        runner.cleanup();
        summary.elapsed = started.elapsed();
        return summary;
    }

    loop {
        if stop.load(Ordering::Acquire) {
            info!(
                "[DDTR-RUNNER] Stop requested after {} chunks",
                summary.chunks_advanced
            );
            summary.cancelled = true;
            break;
        }
        if !runner.advance() {
            if runner.is_exhausted() {
                summary.exhausted = true;
            } else {
                summary.failed = true;
            }
            break;
        }
        summary.chunks_advanced += 1;
    }

    runner.cleanup();
    summary.elapsed = started.elapsed();
    if summary.failed {
        warn!(
            "[DDTR-RUNNER] ⚠️  {} stopped after {} chunks: advance failed with work pending",
            runner.name(),
            summary.chunks_advanced
        );
    } else {
        info!(
            "[DDTR-RUNNER] ✅ {} finished: {} chunks in {:.3} s",
            runner.name(),
            summary.chunks_advanced,
            summary.elapsed.as_secs_f64()
        );
    }
    summary
}
