// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Logging initialization for DDTR binaries
//!
//! Console output is always human-readable. With the `file-logging` feature a
//! JSON copy of every event goes to a timestamped run folder:
//! ```text
//! ./logs/
//!   └── run_20250101_120000/
//!       └── ddtr.log
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::cli::CrateDebugFlags;

const RUN_PREFIX: &str = "run_";
const RUN_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Build the console/file filter from debug flags
///
/// `RUST_LOG` wins when set.
fn build_filter(debug_flags: &CrateDebugFlags, base_level: &str) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let directives = debug_flags.to_filter_string(base_level);
    EnvFilter::try_new(&directives)
        .with_context(|| format!("Invalid log filter: {}", directives))
}

/// Initialize console-only logging
pub fn init_console_logging(debug_flags: &CrateDebugFlags, base_level: &str) -> Result<()> {
    let filter = build_filter(debug_flags, base_level)?;
    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_file(false)
        .with_line_number(false)
        .with_filter(filter);

    Registry::default()
        .with(console_layer)
        .try_init()
        .context("Global tracing subscriber already installed")
}

/// Logging initialization result; dropping it flushes the file writer
#[cfg(feature = "file-logging")]
pub struct LoggingGuard {
    _file_guard: tracing_appender::non_blocking::WorkerGuard,
    log_dir: PathBuf,
}

#[cfg(feature = "file-logging")]
impl LoggingGuard {
    /// This run's log folder
    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }
}

/// Initialize console logging plus a JSON log file for this run
///
/// # Arguments
/// * `debug_flags` - Per-crate debug flags for filtering
/// * `base_level` - Level for crates without a debug flag
/// * `log_dir` - Base directory for run folders (default: `./logs`)
/// * `retention_days` - Remove run folders older than this (default: 30)
/// * `retention_runs` - Keep at most this many run folders (default: 10)
#[cfg(feature = "file-logging")]
pub fn init_logging(
    debug_flags: &CrateDebugFlags,
    base_level: &str,
    log_dir: Option<PathBuf>,
    retention_days: Option<u64>,
    retention_runs: Option<usize>,
) -> Result<LoggingGuard> {
    let base_log_dir = log_dir.unwrap_or_else(|| PathBuf::from("./logs"));

    let timestamp = Utc::now().format(RUN_FORMAT);
    let run_folder = base_log_dir.join(format!("{}{}", RUN_PREFIX, timestamp));
    std::fs::create_dir_all(&run_folder)
        .with_context(|| format!("Failed to create log directory: {}", run_folder.display()))?;

    cleanup_old_logs(&base_log_dir, retention_days, retention_runs)?;

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_file(false)
        .with_line_number(false)
        .with_filter(build_filter(debug_flags, base_level)?);

    let appender = tracing_appender::rolling::never(&run_folder, "ddtr.log");
    let (non_blocking, file_guard) = tracing_appender::non_blocking(appender);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .json()
        .with_filter(build_filter(debug_flags, base_level)?);

    Registry::default()
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .context("Global tracing subscriber already installed")?;

    Ok(LoggingGuard {
        _file_guard: file_guard,
        log_dir: run_folder,
    })
}

fn parse_run_folder(name: &str) -> Option<DateTime<Utc>> {
    let stamp = name.strip_prefix(RUN_PREFIX)?;
    let naive = NaiveDateTime::parse_from_str(stamp, RUN_FORMAT).ok()?;
    Some(Utc.from_utc_datetime(&naive))
}

/// Remove run folders older than `retention_days`, then all but the newest
/// `retention_runs`
///
/// Returns how many folders were removed. Folders not named `run_<stamp>`
/// are never touched.
pub fn cleanup_old_logs(
    base_log_dir: &Path,
    retention_days: Option<u64>,
    retention_runs: Option<usize>,
) -> Result<usize> {
    if !base_log_dir.exists() {
        return Ok(0);
    }

    let retention_days = retention_days.unwrap_or(30);
    let retention_runs = retention_runs.unwrap_or(10);
    let cutoff_date = Utc::now() - chrono::Duration::days(retention_days as i64);

    let mut runs: Vec<(PathBuf, DateTime<Utc>)> = Vec::new();
    for entry in std::fs::read_dir(base_log_dir)? {
        let path = entry?.path();
        if !path.is_dir() {
            continue;
        }
        let stamp = path.file_name().and_then(|n| n.to_str()).and_then(parse_run_folder);
        if let Some(dt) = stamp {
            runs.push((path, dt));
        }
    }

    // newest first
    runs.sort_by(|a, b| b.1.cmp(&a.1));

    let mut removed = 0;
    for (index, (path, dt)) in runs.iter().enumerate() {
        if *dt >= cutoff_date && index < retention_runs {
            continue;
        }
        match std::fs::remove_dir_all(path) {
            Ok(()) => removed += 1,
            Err(e) => eprintln!(
                "Warning: Failed to remove old log directory {}: {}",
                path.display(),
                e
            ),
        }
    }

    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_run(base: &Path, age_days: i64) -> PathBuf {
        let stamp = (Utc::now() - chrono::Duration::days(age_days)).format(RUN_FORMAT);
        let path = base.join(format!("{}{}", RUN_PREFIX, stamp));
        std::fs::create_dir_all(&path).unwrap();
        path
    }

    #[test]
    fn test_parse_run_folder() {
        assert!(parse_run_folder("run_20250101_120000").is_some());
        assert!(parse_run_folder("run_latest").is_none());
        assert!(parse_run_folder("notes").is_none());
    }

    #[test]
    fn test_cleanup_by_age() {
        let dir = tempfile::tempdir().unwrap();
        let fresh = make_run(dir.path(), 1);
        let stale = make_run(dir.path(), 40);

        let removed = cleanup_old_logs(dir.path(), Some(30), Some(10)).unwrap();
        assert_eq!(removed, 1);
        assert!(fresh.exists());
        assert!(!stale.exists());
    }

    #[test]
    fn test_cleanup_by_count_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        let runs: Vec<PathBuf> = (1..=4).map(|age| make_run(dir.path(), age)).collect();
        let keep = dir.path().join("keep-me");
        std::fs::create_dir_all(&keep).unwrap();

        let removed = cleanup_old_logs(dir.path(), Some(30), Some(2)).unwrap();
        assert_eq!(removed, 2);
        assert!(runs[0].exists());
        assert!(runs[1].exists());
        assert!(!runs[2].exists());
        assert!(!runs[3].exists());
        assert!(keep.exists());
    }

    #[test]
    fn test_cleanup_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            cleanup_old_logs(&dir.path().join("absent"), None, None).unwrap(),
            0
        );
    }
}
