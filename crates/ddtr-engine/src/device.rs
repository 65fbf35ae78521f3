// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! # Device Buffer Manager
//!
//! Acquire-on-setup, release-on-every-exit-path ownership of the two
//! device buffers a pipeline needs. Buffers free themselves when dropped, so
//! moving the state to [`DeviceState::Released`] (or dropping it) is the
//! only teardown path.

use crate::backend::{DdtrBackend, DeviceBuffer};
use crate::error::{DdtrError, Result};
use ddtr_strategy::DdtrStrategy;
use tracing::{error, info};

/// Input and output buffers of one pipeline
pub struct DeviceBuffers<B: DdtrBackend> {
    pub input: B::Input,
    pub output: B::Output,
}

impl<B: DdtrBackend> DeviceBuffers<B> {
    /// Raw samples the input buffer must hold
    pub fn input_len(strategy: &DdtrStrategy) -> usize {
        (strategy.chunk_capacity() + strategy.max_shift()) * strategy.metadata().nchans
    }

    /// Floats the output buffer must hold
    ///
    /// The larger of the post-corner-turn and dedispersed projections, so
    /// one buffer serves both without reallocating mid-chunk.
    pub fn output_len(strategy: &DdtrStrategy) -> usize {
        let width = strategy.metadata().nchans.max(strategy.max_ndms());
        (strategy.chunk_capacity() + strategy.max_shift()) * width
    }

    /// Allocate both buffers; the output is zero-initialised
    pub fn allocate(backend: &mut B, strategy: &DdtrStrategy) -> Result<Self> {
        let input_len = Self::input_len(strategy);
        let output_len = Self::output_len(strategy);

        let input = backend.allocate_input(input_len).map_err(|source| {
            error!(
                "[DDTR-DEVICE] Input allocation of {} samples failed: {}",
                input_len, source
            );
            DdtrError::AllocationFailed {
                buffer: "input",
                source,
            }
        })?;
        // on failure `input` is dropped here and its memory returned
        let output = backend.allocate_output(output_len).map_err(|source| {
            error!(
                "[DDTR-DEVICE] Output allocation of {} values failed: {}",
                output_len, source
            );
            DdtrError::AllocationFailed {
                buffer: "output",
                source,
            }
        })?;

        info!(
            "[DDTR-DEVICE] Allocated input {} bytes, output {} bytes on {}",
            input.size_bytes(),
            output.size_bytes(),
            backend.backend_name()
        );
        Ok(Self { input, output })
    }

    pub fn size_bytes(&self) -> usize {
        self.input.size_bytes() + self.output.size_bytes()
    }
}

/// Explicit resource state of a pipeline's device memory
pub enum DeviceState<B: DdtrBackend> {
    Unallocated,
    Allocated(DeviceBuffers<B>),
    /// Terminal; a released pipeline cannot be set up again
    Released,
}

impl<B: DdtrBackend> DeviceState<B> {
    pub fn is_allocated(&self) -> bool {
        matches!(self, DeviceState::Allocated(_))
    }

    pub fn is_released(&self) -> bool {
        matches!(self, DeviceState::Released)
    }

    pub fn buffers_mut(&mut self) -> Option<&mut DeviceBuffers<B>> {
        match self {
            DeviceState::Allocated(buffers) => Some(buffers),
            _ => None,
        }
    }

    /// Move to `Released`, freeing buffers if any are held
    ///
    /// Returns whether buffers were freed by this call.
    pub fn release(&mut self) -> bool {
        match std::mem::replace(self, DeviceState::Released) {
            DeviceState::Allocated(buffers) => {
                drop(buffers);
                true
            }
            DeviceState::Unallocated | DeviceState::Released => false,
        }
    }
}
