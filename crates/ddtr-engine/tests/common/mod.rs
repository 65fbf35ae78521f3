// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Shared fixtures for pipeline integration tests

#![allow(dead_code)]

use ddtr_engine::{
    BackendError, BackendResult, ChunkGeometry, CpuBackend, CpuBuffer, DdtrBackend,
    DedispersionJob, LoadParams, RangeLoad,
};
use ddtr_strategy::{ChunkTable, DdtrStrategy, DmRange, FilterbankMetadata};

pub const TSAMP: f32 = 0.001;

pub fn metadata(nchans: usize, nsamples: usize) -> FilterbankMetadata {
    FilterbankMetadata {
        nchans,
        nbits: 8,
        tsamp: TSAMP,
        nsamples,
        fch1: 1500.0,
        foff: -1.0,
    }
}

/// One chunk of 10 samples, 4 channels, 3 trials, max shift 5 (input of 60)
pub fn single_chunk_strategy() -> DdtrStrategy {
    let table = ChunkTable::from_rows(vec![vec![10]]).unwrap();
    DdtrStrategy::new(
        metadata(4, 15),
        vec![DmRange::new(0.0, 3.0, 1.0, 1)],
        table,
        vec![0.0, 0.5, 1.0, 1.5],
        5,
    )
    .unwrap()
}

/// Four ranges binned `[1, 1, 2, 4]`, two chunks of 64, max shift 12
pub fn binned_strategy() -> DdtrStrategy {
    DdtrStrategy::uniform(
        metadata(4, 140),
        vec![
            DmRange::new(0.0, 2.0, 1.0, 1),
            DmRange::new(2.0, 4.0, 1.0, 1),
            DmRange::new(4.0, 8.0, 1.0, 2),
            DmRange::new(8.0, 16.0, 2.0, 4),
        ],
        vec![0.0, 0.25, 0.5, 0.75],
        64,
    )
    .unwrap()
}

/// Two ranges (4 and 8 trials, second binned by 2), chunks `[[50, 50], [25, 25]]`
pub fn capture_strategy() -> DdtrStrategy {
    let table = ChunkTable::from_rows(vec![vec![50, 50], vec![25, 25]]).unwrap();
    DdtrStrategy::new(
        metadata(2, 106),
        vec![DmRange::new(0.0, 4.0, 1.0, 1), DmRange::new(4.0, 12.0, 1.0, 2)],
        table,
        vec![0.0, 0.5],
        6,
    )
    .unwrap()
}

pub fn constant_input(strategy: &DdtrStrategy, value: u16) -> Vec<u16> {
    vec![value; strategy.required_input_samples()]
}

/// CPU backend that records every stage call and can fail one of them
pub struct RecordingBackend {
    inner: CpuBackend,
    calls: Vec<&'static str>,
    dedisperse_tsamps: Vec<f32>,
    range_loads: Vec<(usize, usize)>,
    fault: Option<(&'static str, usize)>,
    seen: usize,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::wrapping(CpuBackend::new())
    }

    pub fn wrapping(inner: CpuBackend) -> Self {
        Self {
            inner,
            calls: Vec::new(),
            dedisperse_tsamps: Vec::new(),
            range_loads: Vec::new(),
            fault: None,
            seen: 0,
        }
    }

    /// Fail the `occurrence`-th (1-based) call of `stage`, once
    pub fn failing_on(mut self, stage: &'static str, occurrence: usize) -> Self {
        self.fault = Some((stage, occurrence));
        self
    }

    pub fn calls(&self) -> &[&'static str] {
        &self.calls
    }

    pub fn dedisperse_tsamps(&self) -> &[f32] {
        &self.dedisperse_tsamps
    }

    /// `(max_shift, available)` of every range load
    pub fn range_loads(&self) -> &[(usize, usize)] {
        &self.range_loads
    }

    pub fn ledger(&self) -> std::sync::Arc<ddtr_engine::MemoryLedger> {
        self.inner.ledger()
    }

    fn record(&mut self, stage: &'static str) -> BackendResult<()> {
        self.calls.push(stage);
        if let Some((target, occurrence)) = self.fault {
            if target == stage {
                self.seen += 1;
                if self.seen == occurrence {
                    self.fault = None;
                    return Err(BackendError::Device(format!("injected {} fault", stage)));
                }
            }
        }
        Ok(())
    }
}

impl DdtrBackend for RecordingBackend {
    type Input = CpuBuffer<u16>;
    type Output = CpuBuffer<f32>;

    fn backend_name(&self) -> &str {
        "recording"
    }

    fn allocate_input(&mut self, samples: usize) -> BackendResult<Self::Input> {
        self.inner.allocate_input(samples)
    }

    fn allocate_output(&mut self, values: usize) -> BackendResult<Self::Output> {
        self.inner.allocate_output(values)
    }

    fn load_chunk(
        &mut self,
        input: &mut Self::Input,
        host: &[u16],
        params: &LoadParams<'_>,
    ) -> BackendResult<()> {
        self.record("load_chunk")?;
        self.inner.load_chunk(input, host, params)
    }

    fn load_range(&mut self, input: &mut Self::Input, range: &RangeLoad) -> BackendResult<()> {
        self.record("load_range")?;
        self.range_loads.push((range.max_shift, range.available));
        self.inner.load_range(input, range)
    }

    fn zero_dm(
        &mut self,
        input: &mut Self::Input,
        geometry: &ChunkGeometry,
        nbits: u32,
    ) -> BackendResult<()> {
        self.record("zero_dm")?;
        self.inner.zero_dm(input, geometry, nbits)
    }

    fn zero_dm_outliers(
        &mut self,
        input: &mut Self::Input,
        geometry: &ChunkGeometry,
        nbits: u32,
    ) -> BackendResult<()> {
        self.record("zero_dm_outliers")?;
        self.inner.zero_dm_outliers(input, geometry, nbits)
    }

    fn corner_turn(
        &mut self,
        input: &mut Self::Input,
        output: &mut Self::Output,
        geometry: &ChunkGeometry,
    ) -> BackendResult<()> {
        self.record("corner_turn")?;
        self.inner.corner_turn(input, output, geometry)
    }

    fn legacy_rfi(&mut self, input: &mut Self::Input, geometry: &ChunkGeometry) -> BackendResult<()> {
        self.record("legacy_rfi")?;
        self.inner.legacy_rfi(input, geometry)
    }

    fn bin(
        &mut self,
        input: &mut Self::Input,
        output: &mut Self::Output,
        geometry: &ChunkGeometry,
    ) -> BackendResult<usize> {
        self.record("bin")?;
        self.inner.bin(input, output, geometry)
    }

    fn dedisperse(
        &mut self,
        input: &Self::Input,
        output: &mut Self::Output,
        job: &DedispersionJob,
    ) -> BackendResult<()> {
        self.record("dedisperse")?;
        self.dedisperse_tsamps.push(job.tsamp);
        self.inner.dedisperse(input, output, job)
    }

    fn read_trials(
        &mut self,
        output: &Self::Output,
        offset: usize,
        dst: &mut [f32],
    ) -> BackendResult<()> {
        self.record("read_trials")?;
        self.inner.read_trials(output, offset, dst)
    }

    fn synchronize(&mut self) -> BackendResult<()> {
        self.inner.synchronize()
    }
}
