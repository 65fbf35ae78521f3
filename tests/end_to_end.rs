// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Configuration file to disk artifacts through the umbrella crate.

use std::sync::atomic::AtomicBool;

use ddtr::prelude::*;

const CONFIG: &str = r#"
[observation]
nchans = 8
nbits = 8
tsamp = 0.001
nsamples = 600
fch1 = 1500.0
foff = -10.0

[[dm_ranges]]
low = 0.0
high = 20.0
step = 1.0

[[dm_ranges]]
low = 20.0
high = 40.0
step = 2.0
bin_factor = 2

[pipeline]
chunk_samples = 128

[backend]
type = "cpu"
"#;

fn load(dir: &std::path::Path) -> DdtrConfig {
    let path = dir.join("ddtr_configuration.toml");
    std::fs::write(&path, CONFIG).unwrap();
    let mut config = load_config(Some(&path), None).unwrap();
    config.pipeline.output_dir = dir.to_path_buf();
    validate_config(&config).unwrap();
    config
}

fn plan(config: &DdtrConfig) -> DdtrStrategy {
    let metadata = config.metadata();
    let shifts =
        dm_shifts_from_frequencies(metadata.fch1, metadata.foff, metadata.nchans, metadata.tsamp);
    DdtrStrategy::uniform(metadata, config.ranges(), shifts, config.pipeline.chunk_samples).unwrap()
}

fn ramp(config: &DdtrConfig) -> Vec<u16> {
    let n = config.observation.nchans * config.observation.nsamples;
    (0..n).map(|i| (i % 200) as u16).collect()
}

#[test]
fn test_dump_writes_one_artifact_per_chunk() {
    let dir = tempfile::tempdir().unwrap();
    let config = load(dir.path());
    let strategy = plan(&config);
    let samples = ramp(&config);
    assert_eq!(strategy.max_shift(), 8);
    assert_eq!(strategy.num_chunks(), 5);

    let options = config.pipeline.options().unwrap();
    let mut pipeline =
        DedispersionPipeline::new(&strategy, &samples, CpuBackend::new(), options).unwrap();
    assert!(pipeline.setup());
    while pipeline.advance_with_dump(true) {}
    assert!(pipeline.is_exhausted());
    assert_eq!(pipeline.stats().sink_failures, 0);
    pipeline.cleanup();

    let table = strategy.t_processed();
    for chunk in 0..strategy.num_chunks() {
        let expected: usize = (0..strategy.range())
            .map(|r| strategy.ndms(r) * table.get(r, chunk).unwrap() * 4)
            .sum();
        let path = DiskSink::new(dir.path()).artifact_path(chunk);
        let len = std::fs::metadata(&path).unwrap().len() as usize;
        assert_eq!(len, expected, "artifact of chunk {}", chunk);
    }
}

#[test]
fn test_runner_drives_plan_to_exhaustion() {
    let dir = tempfile::tempdir().unwrap();
    let config = load(dir.path());
    let strategy = plan(&config);
    let samples = ramp(&config);

    let mut pipeline = DedispersionPipeline::new(
        &strategy,
        &samples,
        CpuBackend::new(),
        config.pipeline.options().unwrap(),
    )
    .unwrap();
    let stop = AtomicBool::new(false);
    let summary = run_to_completion(&mut pipeline, &stop);

    assert!(summary.exhausted);
    assert!(!summary.cancelled);
    assert!(!summary.failed);
    assert_eq!(summary.chunks_advanced, strategy.num_chunks());
    assert!(pipeline.is_released());
    assert_eq!(
        pipeline.samples_processed(),
        strategy.t_processed().range_total(0)
    );
}
