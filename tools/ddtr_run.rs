// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Command-line driver for a dedispersion run.
//!
//! Loads `ddtr_configuration.toml` (or built-in defaults), reads raw `u16`
//! samples from a file or synthesises a seeded observation with one dispersed
//! pulse, plans uniform chunks and runs the pipeline until the plan is
//! exhausted or Ctrl+C is pressed.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use memmap2::Mmap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{error, info, warn};

use ddtr::config::{load_config, validate_config, ConfigError, DdtrConfig};
use ddtr::engine::{
    run_to_completion, select_backend, trial_shift, Advance, CaptureBuffer, CpuBackend,
    DdtrBackend, DdtrError, DedispersionPipeline, PipelineOptions,
};
use ddtr::observability::{debug_flags_help, init_console_logging, CrateDebugFlags};
use ddtr::strategy::{dm_shifts_from_frequencies, DdtrStrategy};

/// Chunked dedispersion of a filterbank observation
#[derive(Parser, Debug)]
#[command(name = "ddtr_run", version, author, long_about = None, after_help = debug_flags_help())]
struct Args {
    /// Configuration file (default: search for ddtr_configuration.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Raw native-endian u16 samples, time-major
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Number of frequency channels
    #[arg(long)]
    nchans: Option<usize>,

    /// Samples per channel for synthetic observations
    #[arg(long)]
    nsamples: Option<usize>,

    /// Seed for synthetic observations
    #[arg(long)]
    seed: Option<u64>,

    /// Upper bound on range-0 samples per chunk
    #[arg(long)]
    chunk_samples: Option<usize>,

    /// off, zero_dm or zero_dm_with_outliers
    #[arg(long)]
    zero_dm: Option<String>,

    /// Enable the legacy per-channel RFI clip
    #[arg(long, default_value_t = false)]
    legacy_rfi: bool,

    /// Append every chunk to DD_data_chunk_<t>.dat
    #[arg(long, default_value_t = false)]
    dump: bool,

    /// Directory for chunk artifacts
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// cpu, wgpu or auto
    #[arg(long)]
    backend: Option<String>,

    /// Capture all trials and report the strongest candidate
    #[arg(long, default_value_t = false)]
    report_peak: bool,

    /// Base log level, e.g. info or warn
    #[arg(long)]
    log_level: Option<String>,
}

impl Args {
    fn overrides(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        let mut put = |key: &str, value: Option<String>| {
            if let Some(value) = value {
                map.insert(key.to_string(), value);
            }
        };
        put("input_file", self.input.as_ref().map(|p| p.display().to_string()));
        put("nchans", self.nchans.map(|v| v.to_string()));
        put("nsamples", self.nsamples.map(|v| v.to_string()));
        put("seed", self.seed.map(|v| v.to_string()));
        put("chunk_samples", self.chunk_samples.map(|v| v.to_string()));
        put("zero_dm", self.zero_dm.clone());
        put("legacy_rfi", self.legacy_rfi.then(|| "true".to_string()));
        put("dump_to_disk", self.dump.then(|| "true".to_string()));
        put("output_dir", self.output_dir.as_ref().map(|p| p.display().to_string()));
        put("backend", self.backend.clone());
        put("log_level", self.log_level.clone());
        map
    }
}

/// Candidate with the largest dedispersed value
#[derive(Debug, Clone, Copy, PartialEq)]
struct Peak {
    range: usize,
    trial: usize,
    sample: usize,
    value: f32,
}

fn main() -> Result<()> {
    // --debug-<crate> flags are not clap arguments
    let raw_args: Vec<String> = std::env::args().collect();
    let mut debug_flags = CrateDebugFlags::from_args(raw_args.iter().cloned());
    if let Ok(value) = std::env::var("DDTR_DEBUG") {
        debug_flags.merge_env_value(&value);
    }
    let args = Args::parse_from(
        raw_args
            .into_iter()
            .filter(|arg| !arg.starts_with("--debug-")),
    );

    let config = resolve_config(&args)?;

    #[cfg(feature = "file-logging")]
    let _logging_guard = match &config.logging.log_dir {
        Some(dir) => Some(ddtr::observability::init_logging(
            &debug_flags,
            &config.logging.level,
            Some(dir.clone()),
            Some(config.logging.retention_days),
            None,
        )?),
        None => {
            init_console_logging(&debug_flags, &config.logging.level)?;
            None
        }
    };
    #[cfg(not(feature = "file-logging"))]
    init_console_logging(&debug_flags, &config.logging.level)?;

    validate_config(&config)?;

    let samples = load_samples(&config)?;
    let mut metadata = config.metadata();
    metadata.nsamples = samples.len() / metadata.nchans;
    let shifts = dm_shifts_from_frequencies(metadata.fch1, metadata.foff, metadata.nchans, metadata.tsamp);
    let strategy = DdtrStrategy::uniform(metadata, config.ranges(), shifts, config.pipeline.chunk_samples)
        .context("Failed to plan chunks")?;
    info!(
        "📋 Plan: {} chunks of up to {} samples, {} DM ranges, max shift {}",
        strategy.num_chunks(),
        strategy.chunk_capacity(),
        strategy.range(),
        strategy.max_shift()
    );

    let stop = Arc::new(AtomicBool::new(false));
    let handler_stop = Arc::clone(&stop);
    ctrlc::set_handler(move || {
        info!("Shutdown signal received, finishing current chunk...");
        handler_stop.store(true, Ordering::Release);
    })?;

    let options = config.pipeline.options()?;
    let requested = config.backend.backend_type()?;
    let decision = select_backend(
        requested,
        strategy.chunk_capacity() * strategy.metadata().nchans,
        &config.backend.selection(),
    );
    info!("🖥️  {}", decision.reason);

    let settings = RunSettings {
        dump_to_disk: config.pipeline.dump_to_disk,
        report_peak: args.report_peak,
        stop: &stop,
    };

    match decision.backend_type {
        #[cfg(feature = "gpu")]
        ddtr::engine::BackendType::Wgpu => {
            let backend = ddtr::engine::WgpuBackend::new()?;
            run(&strategy, &samples, backend, options, &settings)
        }
        _ => {
            let backend = match config.backend.memory_limit_bytes() {
                Some(limit) => CpuBackend::with_memory_limit(limit),
                None => CpuBackend::new(),
            };
            run(&strategy, &samples, backend, options, &settings)
        }
    }
}

/// Built-in defaults when no configuration file exists, then overrides
fn resolve_config(args: &Args) -> Result<DdtrConfig> {
    let overrides = args.overrides();
    match load_config(args.config.as_deref(), Some(&overrides)) {
        Ok(config) => Ok(config),
        Err(ConfigError::FileNotFound(_)) if args.config.is_none() => {
            let mut config = DdtrConfig::default();
            ddtr::config::apply_environment_overrides(&mut config);
            ddtr::config::apply_cli_overrides(&mut config, &overrides);
            Ok(config)
        }
        Err(e) => Err(e).context("Failed to load configuration"),
    }
}

struct RunSettings<'s> {
    dump_to_disk: bool,
    report_peak: bool,
    stop: &'s AtomicBool,
}

fn run<B: DdtrBackend>(
    strategy: &DdtrStrategy,
    samples: &[u16],
    backend: B,
    options: PipelineOptions,
    settings: &RunSettings<'_>,
) -> Result<()> {
    let mut pipeline = DedispersionPipeline::new(strategy, samples, backend, options)?;

    if !settings.dump_to_disk && !settings.report_peak {
        let summary = run_to_completion(&mut pipeline, settings.stop);
        if summary.setup_failed {
            bail!("Pipeline setup failed");
        }
        if summary.failed {
            bail!(
                "Run stopped at chunk {} of {} ({} stage failures)",
                pipeline.current_chunk_index(),
                strategy.num_chunks(),
                pipeline.stats().stage_failures
            );
        }
        info!(
            "✅ {} chunks in {:.3}s",
            summary.chunks_advanced,
            summary.elapsed.as_secs_f64()
        );
        return Ok(());
    }

    pipeline.try_setup()?;
    loop {
        if settings.stop.load(Ordering::Acquire) {
            warn!("⚠️  Stopped at chunk {}", pipeline.current_chunk_index());
            break;
        }
        match pipeline.try_advance_with_dump(settings.dump_to_disk) {
            Ok(Advance::Processed(_)) => {}
            Ok(Advance::Exhausted(report)) => {
                info!(
                    "✅ {:.3}s of telescope time in {:.3}s ({:.2}x real time)",
                    report.telescope_seconds, report.wall_seconds, report.realtime_speedup
                );
                break;
            }
            Err(e @ DdtrError::SinkFailed { .. }) => error!("{}", e),
            Err(e) => {
                pipeline.cleanup();
                return Err(e.into());
            }
        }
    }

    if settings.report_peak {
        match find_peak(pipeline.captured()) {
            Some(peak) => {
                let range = strategy.dm(peak.range);
                info!(
                    "🎯 Peak {:.1} at DM {:.2} (range {}, trial {}), sample {} ({:.4}s)",
                    peak.value,
                    range.dm_at(peak.trial),
                    peak.range,
                    peak.trial,
                    peak.sample,
                    peak.sample as f64 * range.bin_factor as f64 * strategy.metadata().tsamp as f64
                );
            }
            None => warn!("No trials captured"),
        }
    }

    pipeline.cleanup();
    Ok(())
}

/// Input file contents, or a synthetic observation
fn load_samples(config: &DdtrConfig) -> Result<Vec<u16>> {
    let observation = &config.observation;
    match &observation.input_file {
        Some(path) => read_samples(path, observation.nchans),
        None => {
            info!(
                "No input file, synthesising {} x {} samples (seed {})",
                observation.nsamples, observation.nchans, observation.seed
            );
            Ok(synthesise(config))
        }
    }
}

fn read_samples(path: &Path, nchans: usize) -> Result<Vec<u16>> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    // read-only mapping, copied out before the file could change
    let mmap = unsafe { Mmap::map(&file) }
        .with_context(|| format!("Failed to map {}", path.display()))?;

    let whole_samples = mmap.len() / std::mem::size_of::<u16>();
    let usable = whole_samples - whole_samples % nchans;
    if usable == 0 {
        bail!("{} holds fewer than {} samples", path.display(), nchans);
    }
    let bytes = &mmap[..usable * std::mem::size_of::<u16>()];
    let samples: Vec<u16> = bytemuck::try_cast_slice(bytes)
        .map_err(|e| anyhow!("Failed to read {} as u16 samples: {:?}", path.display(), e))?
        .to_vec();
    info!(
        "Read {} samples per channel from {}",
        samples.len() / nchans,
        path.display()
    );
    Ok(samples)
}

/// Uniform noise around mid-scale plus one pulse dispersed at the middle of
/// the DM sweep
fn synthesise(config: &DdtrConfig) -> Vec<u16> {
    let observation = &config.observation;
    let nchans = observation.nchans;
    let nsamples = observation.nsamples;
    let max_value = ((1u32 << observation.nbits) - 1) as f32;
    let baseline = max_value / 2.0;
    let noise = max_value / 16.0;

    let mut rng = StdRng::seed_from_u64(observation.seed);
    let mut samples: Vec<u16> = (0..nchans * nsamples)
        .map(|_| (baseline + rng.gen_range(-noise..=noise)).round() as u16)
        .collect();

    let ranges = config.ranges();
    let pulse_dm = ranges
        .get(ranges.len() / 2)
        .map(|range| range.dm_at(range.dm_count() / 2))
        .unwrap_or(0.0);
    let shifts = dm_shifts_from_frequencies(observation.fch1, observation.foff, nchans, observation.tsamp);
    let arrival = nsamples / 4;
    let amplitude = (max_value - baseline) * 0.75;
    for (c, shift) in shifts.iter().enumerate() {
        let t = arrival + trial_shift(*shift, pulse_dm, 1);
        if let Some(sample) = samples.get_mut(t * nchans + c) {
            *sample = (*sample as f32 + amplitude).min(max_value) as u16;
        }
    }
    info!("Injected pulse at DM {:.2}, sample {}", pulse_dm, arrival);
    samples
}

fn find_peak(capture: &CaptureBuffer) -> Option<Peak> {
    let mut best: Option<Peak> = None;
    for (range, trials) in capture.as_nested().iter().enumerate() {
        for (trial, values) in trials.iter().enumerate() {
            for (sample, &value) in values.iter().enumerate() {
                if best.map_or(true, |peak| value > peak.value) {
                    best = Some(Peak {
                        range,
                        trial,
                        sample,
                        value,
                    });
                }
            }
        }
    }
    best
}
