// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! GPU vs CPU dedispersion equivalence
//!
//! Run with:
//!   cargo test -p ddtr-engine --test gpu_backend_parity --features gpu

#![cfg(feature = "gpu")]

mod common;

use common::binned_strategy;
use ddtr_engine::{
    is_gpu_available, CaptureBuffer, CpuBackend, DdtrBackend, DedispersionPipeline,
    PipelineOptions, WgpuBackend, ZeroDmMode,
};
use ddtr_strategy::{ChunkTable, DdtrStrategy, DmRange, FilterbankMetadata};

const NCHANS: usize = 8;
const NSAMP: usize = 64;
const TOLERANCE: f32 = 1e-4;

/// Channel `c` is delayed by `c` samples per unit DM; trials at DM 0..3
fn single_range_strategy() -> DdtrStrategy {
    let metadata = FilterbankMetadata {
        nchans: NCHANS,
        nbits: 8,
        tsamp: 0.000064,
        nsamples: NSAMP + 28,
        fch1: 1500.0,
        foff: -1.0,
    };
    let shifts = (0..NCHANS).map(|c| c as f32).collect();
    let table = ChunkTable::from_rows(vec![vec![NSAMP]]).unwrap();
    DdtrStrategy::new(
        metadata,
        vec![DmRange::new(0.0, 4.0, 1.0, 1)],
        table,
        shifts,
        28,
    )
    .unwrap()
}

/// Background of 10 with one pulse dispersed at DM 2 from sample 20
fn dispersed_pulse(strategy: &DdtrStrategy) -> Vec<u16> {
    let nchans = strategy.metadata().nchans;
    let mut data = vec![10; strategy.required_input_samples()];
    for c in 0..nchans {
        data[(20 + 2 * c) * nchans + c] = 110;
    }
    data
}

fn ramp(strategy: &DdtrStrategy) -> Vec<u16> {
    (0..strategy.required_input_samples())
        .map(|i| ((i * 7) % 251) as u16)
        .collect()
}

fn capture<B: DdtrBackend>(
    strategy: &DdtrStrategy,
    input: &[u16],
    backend: B,
    options: PipelineOptions,
) -> CaptureBuffer {
    let mut pipeline = DedispersionPipeline::new(strategy, input, backend, options).unwrap();
    assert!(pipeline.setup());
    let mut capture = CaptureBuffer::new();
    let mut chunk = 0;
    while pipeline.advance_into(&mut capture, &mut chunk) {}
    assert!(pipeline.is_exhausted(), "stopped at chunk {}", chunk);
    pipeline.cleanup();
    capture
}

fn assert_equivalent(cpu: &CaptureBuffer, gpu: &CaptureBuffer) {
    assert_eq!(cpu.num_ranges(), gpu.num_ranges());
    for range in 0..cpu.num_ranges() {
        assert_eq!(cpu.num_trials(range), gpu.num_trials(range));
        for trial in 0..cpu.num_trials(range) {
            let expected = cpu.trial(range, trial).unwrap();
            let actual = gpu.trial(range, trial).unwrap();
            assert_eq!(expected.len(), actual.len());
            for (t, (e, a)) in expected.iter().zip(actual).enumerate() {
                let scale = e.abs().max(1.0);
                assert!(
                    (e - a).abs() <= TOLERANCE * scale,
                    "range {} trial {} sample {}: cpu {} gpu {}",
                    range,
                    trial,
                    t,
                    e,
                    a
                );
            }
        }
    }
}

fn compare(strategy: &DdtrStrategy, input: &[u16], options: PipelineOptions) {
    let gpu_backend = match WgpuBackend::new() {
        Ok(backend) => backend,
        Err(e) => {
            println!("⚠️  GPU backend unavailable ({}), skipping", e);
            return;
        }
    };
    let cpu = capture(strategy, input, CpuBackend::new(), options.clone());
    let gpu = capture(strategy, input, gpu_backend, options);
    assert_equivalent(&cpu, &gpu);
}

#[test]
fn test_gpu_matches_cpu_on_dispersed_pulse() {
    if !is_gpu_available() {
        println!("⚠️  GPU not available, skipping test");
        return;
    }
    let strategy = single_range_strategy();
    let input = dispersed_pulse(&strategy);
    compare(&strategy, &input, PipelineOptions::default());
}

#[test]
fn test_gpu_matches_cpu_across_bin_schedule() {
    if !is_gpu_available() {
        println!("⚠️  GPU not available, skipping test");
        return;
    }
    let strategy = binned_strategy();
    let input = ramp(&strategy);
    compare(&strategy, &input, PipelineOptions::default());
}

#[test]
fn test_gpu_matches_cpu_with_zero_dm() {
    if !is_gpu_available() {
        println!("⚠️  GPU not available, skipping test");
        return;
    }
    let strategy = single_range_strategy();
    let input = ramp(&strategy);
    let options = PipelineOptions {
        zero_dm: ZeroDmMode::ZeroDm,
        ..Default::default()
    };
    compare(&strategy, &input, options);
}
