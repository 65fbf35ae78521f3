// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Wall-clock throughput measurement

use std::time::{Duration, Instant};

/// Elapsed-time measurement spanning a whole run
#[derive(Debug, Default, Clone)]
pub struct ThroughputTimer {
    started: Option<Instant>,
    stopped: Option<Duration>,
}

impl ThroughputTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start measuring; ignored if already started
    pub fn start(&mut self) {
        if self.started.is_none() {
            self.started = Some(Instant::now());
        }
    }

    /// Stop measuring and return the elapsed time
    ///
    /// Only the first stop freezes the measurement; later calls return the
    /// same duration.
    pub fn stop(&mut self) -> Duration {
        if let Some(stopped) = self.stopped {
            return stopped;
        }
        let elapsed = self.elapsed();
        if self.started.is_some() {
            self.stopped = Some(elapsed);
        }
        elapsed
    }

    pub fn elapsed(&self) -> Duration {
        match (self.stopped, self.started) {
            (Some(stopped), _) => stopped,
            (None, Some(started)) => started.elapsed(),
            (None, None) => Duration::ZERO,
        }
    }

    pub fn is_running(&self) -> bool {
        self.started.is_some() && self.stopped.is_none()
    }
}

/// Throughput summary reported when a pipeline is exhausted
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThroughputReport {
    pub wall_seconds: f64,
    /// Observation time covered: original sampling interval x samples processed
    pub telescope_seconds: f64,
    pub samples_processed: usize,
    /// Telescope time over wall time
    pub realtime_speedup: f64,
}

impl ThroughputReport {
    pub fn new(wall: Duration, tsamp: f32, samples_processed: usize) -> Self {
        let wall_seconds = wall.as_secs_f64();
        let telescope_seconds = tsamp as f64 * samples_processed as f64;
        let realtime_speedup = if wall_seconds > 0.0 {
            telescope_seconds / wall_seconds
        } else {
            0.0
        };
        Self {
            wall_seconds,
            telescope_seconds,
            samples_processed,
            realtime_speedup,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_is_idempotent() {
        let mut timer = ThroughputTimer::new();
        timer.start();
        std::thread::sleep(Duration::from_millis(2));
        let first = timer.stop();
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(timer.stop(), first);
        assert!(!timer.is_running());
    }

    #[test]
    fn test_unstarted_timer_reports_zero() {
        let mut timer = ThroughputTimer::new();
        assert_eq!(timer.stop(), Duration::ZERO);
        assert!(!timer.is_running());
    }

    #[test]
    fn test_report_speedup() {
        let report = ThroughputReport::new(Duration::from_secs(2), 0.001, 10_000);
        assert!((report.telescope_seconds - 10.0).abs() < 1e-9);
        assert!((report.realtime_speedup - 5.0).abs() < 1e-9);

        let instant = ThroughputReport::new(Duration::ZERO, 0.001, 10);
        assert_eq!(instant.realtime_speedup, 0.0);
    }
}
