// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Chunk iteration, range sweep ordering and failure recovery

mod common;

use std::sync::atomic::AtomicBool;

use common::{
    binned_strategy, capture_strategy, constant_input, metadata, single_chunk_strategy,
    RecordingBackend, TSAMP,
};
use ddtr_engine::{
    run_to_completion, Advance, CaptureBuffer, CpuBackend, DdtrError, DedispersionPipeline,
    PipelineOptions, Stage, ZeroDmMode,
};
use ddtr_strategy::{ChunkTable, DdtrStrategy, DmRange};
use proptest::prelude::*;

const SWEEP: [&str; 10] = [
    "load_range",
    "dedisperse",
    "load_range",
    "dedisperse",
    "load_range",
    "bin",
    "dedisperse",
    "load_range",
    "bin",
    "dedisperse",
];

#[test]
fn test_single_chunk_end_to_end() {
    let strategy = single_chunk_strategy();
    let input = constant_input(&strategy, 3);
    let mut pipeline = DedispersionPipeline::new(
        &strategy,
        &input,
        CpuBackend::new(),
        PipelineOptions::default(),
    )
    .unwrap();

    assert!(pipeline.setup());
    assert!(pipeline.advance());
    assert_eq!(pipeline.current_chunk_index(), 1);
    assert_eq!(pipeline.samples_processed(), 10);
    assert!((pipeline.telescope_time_elapsed() - 10.0 * TSAMP as f64).abs() < 1e-9);

    assert!(!pipeline.advance());
    assert!(!pipeline.advance());
    assert_eq!(pipeline.current_chunk_index(), 1);
    assert_eq!(pipeline.samples_processed(), 10);
    assert!(pipeline.cleanup());
}

#[test]
fn test_exhausted_reports_throughput() {
    let strategy = binned_strategy();
    let input = constant_input(&strategy, 1);
    let mut pipeline = DedispersionPipeline::new(
        &strategy,
        &input,
        CpuBackend::new(),
        PipelineOptions::default(),
    )
    .unwrap();
    pipeline.try_setup().unwrap();

    let mut processed = 0;
    let report = loop {
        match pipeline.try_advance().unwrap() {
            Advance::Processed(chunk) => {
                assert_eq!(chunk.chunk_index, processed);
                assert_eq!(chunk.samples, 64);
                processed += 1;
            }
            Advance::Exhausted(report) => break report,
        }
    };

    assert_eq!(processed, 2);
    assert!(pipeline.is_exhausted());
    assert_eq!(report.samples_processed, 128);
    assert!((report.telescope_seconds - 128.0 * TSAMP as f64).abs() < 1e-9);

    // the timer froze on the first exhausted call
    match pipeline.try_advance().unwrap() {
        Advance::Exhausted(again) => assert_eq!(again.wall_seconds, report.wall_seconds),
        Advance::Processed(_) => panic!("exhausted pipeline processed a chunk"),
    }
    assert_eq!(pipeline.stats().chunks_processed, 2);
    assert_eq!(pipeline.stats().ranges_processed, 8);
}

#[test]
fn test_bin_schedule_and_sampling_interval() {
    let strategy = binned_strategy();
    let input = constant_input(&strategy, 7);
    let mut pipeline = DedispersionPipeline::new(
        &strategy,
        &input,
        RecordingBackend::new(),
        PipelineOptions::default(),
    )
    .unwrap();

    assert!(pipeline.setup());
    assert!(pipeline.advance());

    let mut expected = vec!["load_chunk", "corner_turn"];
    expected.extend_from_slice(&SWEEP);
    assert_eq!(pipeline.backend().calls(), expected.as_slice());
    assert_eq!(
        pipeline.backend().dedisperse_tsamps(),
        &[TSAMP, TSAMP, 2.0 * TSAMP, 4.0 * TSAMP]
    );
    // shift shrinks with the bin factor; rows of 64 + 12 halve at each bin
    assert_eq!(
        pipeline.backend().range_loads(),
        &[(12, 76), (12, 76), (6, 38), (3, 19)]
    );

    // transient state is restored after every sweep
    assert_eq!(pipeline.sampling_interval(), TSAMP);
    assert_eq!(pipeline.current_max_shift(), 12);

    assert!(pipeline.advance());
    assert!(!pipeline.advance());
    let bins = pipeline
        .backend()
        .calls()
        .iter()
        .filter(|c| **c == "bin")
        .count();
    assert_eq!(bins, 4);
    assert_eq!(pipeline.samples_processed(), 128);
}

#[test]
fn test_preprocessing_chain_order() {
    let strategy = single_chunk_strategy();
    let input = constant_input(&strategy, 5);
    let options = PipelineOptions {
        zero_dm: ZeroDmMode::ZeroDm,
        legacy_rfi: true,
        ..Default::default()
    };
    let mut pipeline =
        DedispersionPipeline::new(&strategy, &input, RecordingBackend::new(), options).unwrap();

    assert!(pipeline.setup());
    assert!(pipeline.advance());
    assert_eq!(
        pipeline.backend().calls(),
        &["load_chunk", "zero_dm", "corner_turn", "legacy_rfi", "load_range", "dedisperse"]
    );
}

#[test]
fn test_outlier_zero_dm_variant_selected() {
    let strategy = single_chunk_strategy();
    let input = constant_input(&strategy, 5);
    let options = PipelineOptions {
        zero_dm: ZeroDmMode::ZeroDmWithOutliers,
        ..Default::default()
    };
    let mut pipeline =
        DedispersionPipeline::new(&strategy, &input, RecordingBackend::new(), options).unwrap();

    assert!(pipeline.setup());
    assert!(pipeline.advance());
    assert_eq!(
        &pipeline.backend().calls()[..3],
        &["load_chunk", "zero_dm_outliers", "corner_turn"]
    );
    assert!(!pipeline.backend().calls().contains(&"zero_dm"));
}

#[test]
fn test_stage_failure_leaves_chunk_retryable() {
    let strategy = binned_strategy();
    let input = constant_input(&strategy, 2);
    let backend = RecordingBackend::new().failing_on("dedisperse", 3);
    let mut pipeline =
        DedispersionPipeline::new(&strategy, &input, backend, PipelineOptions::default()).unwrap();
    pipeline.try_setup().unwrap();

    let err = pipeline.try_advance().unwrap_err();
    match &err {
        DdtrError::StageFailed {
            stage,
            chunk_index,
            range,
            ..
        } => {
            assert_eq!(*stage, Stage::Dedisperse);
            assert_eq!(*chunk_index, 0);
            assert_eq!(*range, Some(2));
        }
        other => panic!("unexpected error {other}"),
    }
    assert!(err.is_retryable());

    assert_eq!(pipeline.current_chunk_index(), 0);
    assert_eq!(pipeline.samples_processed(), 0);
    assert_eq!(pipeline.sampling_interval(), TSAMP);
    assert_eq!(pipeline.current_max_shift(), 12);
    assert_eq!(pipeline.stats().stage_failures, 1);

    // the retry reprocesses chunk 0 from its first stage
    let before = pipeline.backend().calls().len();
    assert!(pipeline.advance());
    assert_eq!(pipeline.backend().calls()[before], "load_chunk");
    assert_eq!(pipeline.current_chunk_index(), 1);
    assert_eq!(pipeline.samples_processed(), 64);
}

#[test]
fn test_stage_failure_reports_false() {
    let strategy = single_chunk_strategy();
    let input = constant_input(&strategy, 2);
    let backend = RecordingBackend::new().failing_on("corner_turn", 1);
    let mut pipeline =
        DedispersionPipeline::new(&strategy, &input, backend, PipelineOptions::default()).unwrap();

    assert!(pipeline.setup());
    assert!(!pipeline.advance());
    assert_eq!(pipeline.current_chunk_index(), 0);
    assert!(!pipeline.is_exhausted());
    assert!(pipeline.advance());
    assert_eq!(pipeline.current_chunk_index(), 1);
}

#[test]
fn test_runner_reports_stage_failure_as_failed() {
    let strategy = binned_strategy();
    let input = constant_input(&strategy, 2);
    // first range of the second chunk
    let backend = RecordingBackend::new().failing_on("dedisperse", 5);
    let mut pipeline =
        DedispersionPipeline::new(&strategy, &input, backend, PipelineOptions::default()).unwrap();
    let stop = AtomicBool::new(false);

    let summary = run_to_completion(&mut pipeline, &stop);

    assert!(summary.failed);
    assert!(!summary.exhausted);
    assert!(!summary.cancelled);
    assert_eq!(summary.chunks_advanced, 1);
    assert_eq!(pipeline.current_chunk_index(), 1);
    assert_eq!(pipeline.stats().stage_failures, 1);
    assert!(pipeline.is_released());
}

#[test]
fn test_capture_shapes_and_fills_every_window() {
    let strategy = capture_strategy();
    let input = constant_input(&strategy, 10);
    let mut pipeline = DedispersionPipeline::new(
        &strategy,
        &input,
        CpuBackend::new(),
        PipelineOptions::default(),
    )
    .unwrap();
    assert!(pipeline.setup());

    let mut capture = CaptureBuffer::new();
    let mut chunk = usize::MAX;
    assert!(pipeline.advance_into(&mut capture, &mut chunk));
    assert_eq!(chunk, 0);
    assert_eq!(capture.num_ranges(), 2);
    assert_eq!(capture.num_trials(0), 4);
    assert_eq!(capture.num_trials(1), 8);
    assert_eq!(capture.trial(0, 0).unwrap().len(), 100);
    assert_eq!(capture.trial(1, 0).unwrap().len(), 50);

    assert!(pipeline.advance_into(&mut capture, &mut chunk));
    assert_eq!(chunk, 1);
    assert!(!pipeline.advance_into(&mut capture, &mut chunk));
    assert_eq!(chunk, 1);
    assert_eq!(pipeline.stats().capture_resizes, 1);

    // two channels of constant 10, binning averages to 10 as well
    for range in 0..2 {
        for trial in 0..capture.num_trials(range) {
            let samples = capture.trial(range, trial).unwrap();
            assert!(
                samples.iter().all(|v| *v == 20.0),
                "range {range} trial {trial} has unfilled samples"
            );
        }
    }
}

#[test]
fn test_oversized_capture_is_reused() {
    let strategy = capture_strategy();
    let input = constant_input(&strategy, 1);
    let mut pipeline = DedispersionPipeline::new(
        &strategy,
        &input,
        CpuBackend::new(),
        PipelineOptions::default(),
    )
    .unwrap();
    assert!(pipeline.setup());

    let mut capture = CaptureBuffer::new();
    capture.shape_for(&strategy);
    let mut chunk = 0;
    assert!(pipeline.advance_into(&mut capture, &mut chunk));
    assert_eq!(pipeline.stats().capture_resizes, 0);
}

fn single_range_strategy(chunks: &[usize]) -> DdtrStrategy {
    let total: usize = chunks.iter().sum();
    let table = ChunkTable::from_rows(vec![chunks.to_vec()]).unwrap();
    DdtrStrategy::new(
        metadata(2, total + 2),
        vec![DmRange::new(0.0, 2.0, 1.0, 1)],
        table,
        vec![0.0, 1.0],
        2,
    )
    .unwrap()
}

proptest! {
    #[test]
    fn prop_counters_track_prefix_sums(chunks in prop::collection::vec(1usize..40, 1..6)) {
        let strategy = single_range_strategy(&chunks);
        let input = constant_input(&strategy, 1);
        let mut pipeline = DedispersionPipeline::new(
            &strategy,
            &input,
            CpuBackend::new(),
            PipelineOptions::default(),
        )
        .unwrap();
        prop_assert!(pipeline.setup());

        let mut expected = 0usize;
        for (t, samples) in chunks.iter().enumerate() {
            prop_assert!(pipeline.advance());
            expected += samples;
            prop_assert_eq!(pipeline.current_chunk_index(), t + 1);
            prop_assert_eq!(pipeline.samples_processed(), expected);
        }
        prop_assert!(!pipeline.advance());
        prop_assert_eq!(pipeline.current_chunk_index(), chunks.len());
        prop_assert_eq!(pipeline.samples_processed(), expected);
    }
}
