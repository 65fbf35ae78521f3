// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

/*
 * Copyright 2025 Neuraville Inc.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 */

//! # WGPU Backend
//!
//! GPU-accelerated backend using WGPU (cross-platform GPU compute library).
//! Supports Metal (macOS), Vulkan (Linux), DirectX 12 (Windows).
//!
//! Raw samples are widened to `u32` on upload since WGSL has no 16-bit
//! storage type. Every stage is a single-entry-point shader; stages that
//! need scratch space write into the output buffer and run `copy_back`.

use super::{
    check_job, ChunkGeometry, DdtrBackend, DedispersionJob, DeviceBuffer, LoadParams, RangeLoad,
};
use crate::error::{BackendError, BackendResult};
use tracing::{debug, info};

const WORKGROUP_SIZE: usize = 256;
const MAX_WORKGROUPS_PER_DIM: usize = 65_535;

/// Mirror of the `Params` struct shared by every shader
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, bytemuck::Pod, bytemuck::Zeroable)]
struct KernelParams {
    nchans: u32,
    row_len: u32,
    nsamp: u32,
    ndms: u32,
    dm_low: f32,
    dm_step: f32,
    bin_factor: u32,
    nbits: u32,
}

/// GPU buffer handle
pub struct WgpuBuffer {
    buffer: wgpu::Buffer,
    len: usize,
}

impl DeviceBuffer for WgpuBuffer {
    fn len(&self) -> usize {
        self.len
    }

    fn size_bytes(&self) -> usize {
        self.len * 4
    }
}

impl Drop for WgpuBuffer {
    fn drop(&mut self) {
        self.buffer.destroy();
    }
}

struct Kernels {
    zero_dm: wgpu::ComputePipeline,
    zero_dm_outliers: wgpu::ComputePipeline,
    corner_turn: wgpu::ComputePipeline,
    copy_back: wgpu::ComputePipeline,
    legacy_rfi: wgpu::ComputePipeline,
    bin: wgpu::ComputePipeline,
    dedisperse: wgpu::ComputePipeline,
}

/// WGPU backend for GPU acceleration
pub struct WgpuBackend {
    /// Backend name for logging
    name: String,

    /// WGPU device
    device: wgpu::Device,

    /// WGPU command queue
    queue: wgpu::Queue,

    kernels: Kernels,

    /// Uniform parameter block, rewritten before every dispatch
    params: wgpu::Buffer,

    /// Staged shift table
    shifts: Option<WgpuBuffer>,

    /// Host copy of the staged shift table, for launch bounds checks
    host_shifts: Vec<f32>,

    staged_range: Option<RangeLoad>,
}

fn to_u32(value: usize, what: &str) -> BackendResult<u32> {
    u32::try_from(value)
        .map_err(|_| BackendError::InvalidGeometry(format!("{} {} exceeds u32", what, value)))
}

fn workgroups(items: usize) -> (u32, u32) {
    let groups = items.div_ceil(WORKGROUP_SIZE).max(1);
    let x = groups.min(MAX_WORKGROUPS_PER_DIM);
    let y = groups.div_ceil(x);
    (x as u32, y as u32)
}

impl WgpuBackend {
    /// Create a new WGPU backend
    pub fn new() -> BackendResult<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .ok_or_else(|| BackendError::Device("Failed to find WGPU adapter".to_string()))?;

        let adapter_info = adapter.get_info();
        let name = format!("WGPU ({} - {:?})", adapter_info.name, adapter_info.backend);

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("DDTR Device"),
                required_features: wgpu::Features::empty(),
                required_limits: adapter.limits(),
            },
            None,
        ))
        .map_err(|e| BackendError::Device(format!("Failed to create device: {}", e)))?;

        let kernels = Kernels {
            zero_dm: Self::load_kernel(&device, "Zero DM", include_str!("shaders/zero_dm.wgsl")),
            zero_dm_outliers: Self::load_kernel(
                &device,
                "Zero DM Outliers",
                include_str!("shaders/zero_dm_outliers.wgsl"),
            ),
            corner_turn: Self::load_kernel(
                &device,
                "Corner Turn",
                include_str!("shaders/corner_turn.wgsl"),
            ),
            copy_back: Self::load_kernel(&device, "Copy Back", include_str!("shaders/copy_back.wgsl")),
            legacy_rfi: Self::load_kernel(
                &device,
                "Legacy RFI",
                include_str!("shaders/legacy_rfi.wgsl"),
            ),
            bin: Self::load_kernel(&device, "Bin", include_str!("shaders/bin.wgsl")),
            dedisperse: Self::load_kernel(
                &device,
                "Dedisperse",
                include_str!("shaders/dedisperse.wgsl"),
            ),
        };
        info!("✅ [DDTR-WGPU] Stage shaders loaded on {}", name);

        let params = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Kernel Params"),
            size: std::mem::size_of::<KernelParams>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        Ok(Self {
            name,
            device,
            queue,
            kernels,
            params,
            shifts: None,
            host_shifts: Vec::new(),
            staged_range: None,
        })
    }

    fn load_kernel(device: &wgpu::Device, label: &str, source: &str) -> wgpu::ComputePipeline {
        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(label),
            source: wgpu::ShaderSource::Wgsl(source.into()),
        });
        device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(label),
            layout: None, // Auto-layout from shader
            module: &module,
            entry_point: "main",
        })
    }

    fn create_storage(&self, len: usize, label: &str) -> BackendResult<WgpuBuffer> {
        let size = (len.max(1) * 4) as u64;
        let limits = self.device.limits();
        if size > limits.max_buffer_size || size > limits.max_storage_buffer_binding_size as u64 {
            return Err(BackendError::OutOfMemory {
                requested_bytes: size as usize,
                live_bytes: 0,
                limit_bytes: limits.max_storage_buffer_binding_size as usize,
            });
        }

        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        // wgpu zero-initialises new buffers
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(BackendError::Device(format!(
                "Failed to allocate {} ({} bytes): {}",
                label, size, err
            )));
        }
        Ok(WgpuBuffer { buffer, len })
    }

    fn write_params(&self, params: KernelParams) {
        self.queue
            .write_buffer(&self.params, 0, bytemuck::bytes_of(&params));
    }

    fn geometry_params(geometry: &ChunkGeometry, nbits: u32) -> BackendResult<KernelParams> {
        Ok(KernelParams {
            nchans: to_u32(geometry.nchans, "channel count")?,
            row_len: to_u32(geometry.row_len, "row length")?,
            nbits,
            ..Default::default()
        })
    }

    /// Bind `buffers` in order and launch one invocation per item
    fn dispatch(
        &self,
        pipeline: &wgpu::ComputePipeline,
        label: &str,
        buffers: &[&wgpu::Buffer],
        items: usize,
    ) {
        let layout = pipeline.get_bind_group_layout(0);
        let entries: Vec<wgpu::BindGroupEntry> = buffers
            .iter()
            .enumerate()
            .map(|(binding, buffer)| wgpu::BindGroupEntry {
                binding: binding as u32,
                resource: buffer.as_entire_binding(),
            })
            .collect();
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(label),
            layout: &layout,
            entries: &entries,
        });

        let (x, y) = workgroups(items);
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(label) });
        {
            let mut compute_pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(label),
                timestamp_writes: None,
            });
            compute_pass.set_pipeline(pipeline);
            compute_pass.set_bind_group(0, &bind_group, &[]);
            compute_pass.dispatch_workgroups(x, y, 1);
        }
        self.queue.submit(Some(encoder.finish()));
    }

    fn check_capacity(geometry: &ChunkGeometry, buffer: &WgpuBuffer) -> BackendResult<()> {
        if geometry.nchans == 0 || geometry.row_len == 0 || geometry.total() > buffer.len {
            return Err(BackendError::InvalidGeometry(format!(
                "{} channels x {} samples do not fit buffer of {}",
                geometry.nchans, geometry.row_len, buffer.len
            )));
        }
        Ok(())
    }
}

impl DdtrBackend for WgpuBackend {
    type Input = WgpuBuffer;
    type Output = WgpuBuffer;

    fn backend_name(&self) -> &str {
        &self.name
    }

    fn allocate_input(&mut self, samples: usize) -> BackendResult<Self::Input> {
        self.create_storage(samples, "DDTR Input")
    }

    fn allocate_output(&mut self, values: usize) -> BackendResult<Self::Output> {
        self.create_storage(values, "DDTR Output")
    }

    fn load_chunk(
        &mut self,
        input: &mut Self::Input,
        host: &[u16],
        params: &LoadParams<'_>,
    ) -> BackendResult<()> {
        let len = params.window_len();
        if host.len() != len || len > input.len {
            return Err(BackendError::InvalidGeometry(format!(
                "host window of {} samples (expected {}) for input capacity {}",
                host.len(),
                len,
                input.len
            )));
        }
        if params.dm_shifts.len() != params.nchans {
            return Err(BackendError::InvalidGeometry(format!(
                "{} shift entries for {} channels",
                params.dm_shifts.len(),
                params.nchans
            )));
        }

        let widened: Vec<u32> = host.iter().map(|v| *v as u32).collect();
        self.queue
            .write_buffer(&input.buffer, 0, bytemuck::cast_slice(&widened));

        if self.host_shifts.as_slice() != params.dm_shifts {
            let shifts = self.create_storage(params.dm_shifts.len(), "DDTR Shift Table")?;
            self.queue
                .write_buffer(&shifts.buffer, 0, bytemuck::cast_slice(params.dm_shifts));
            self.shifts = Some(shifts);
            self.host_shifts = params.dm_shifts.to_vec();
        }
        self.staged_range = None;
        debug!("[DDTR-WGPU] Uploaded {} samples", len);
        Ok(())
    }

    fn load_range(&mut self, _input: &mut Self::Input, range: &RangeLoad) -> BackendResult<()> {
        if self.shifts.is_none() {
            return Err(BackendError::InvalidGeometry(
                "no chunk loaded before range staging".to_string(),
            ));
        }
        range.check_coverage()?;
        self.staged_range = Some(*range);
        Ok(())
    }

    fn zero_dm(
        &mut self,
        input: &mut Self::Input,
        geometry: &ChunkGeometry,
        nbits: u32,
    ) -> BackendResult<()> {
        Self::check_capacity(geometry, input)?;
        self.write_params(Self::geometry_params(geometry, nbits)?);
        self.dispatch(
            &self.kernels.zero_dm,
            "Zero DM",
            &[&input.buffer, &self.params],
            geometry.row_len,
        );
        Ok(())
    }

    fn zero_dm_outliers(
        &mut self,
        input: &mut Self::Input,
        geometry: &ChunkGeometry,
        nbits: u32,
    ) -> BackendResult<()> {
        Self::check_capacity(geometry, input)?;
        self.write_params(Self::geometry_params(geometry, nbits)?);
        self.dispatch(
            &self.kernels.zero_dm_outliers,
            "Zero DM Outliers",
            &[&input.buffer, &self.params],
            geometry.row_len,
        );
        Ok(())
    }

    fn corner_turn(
        &mut self,
        input: &mut Self::Input,
        output: &mut Self::Output,
        geometry: &ChunkGeometry,
    ) -> BackendResult<()> {
        Self::check_capacity(geometry, input)?;
        Self::check_capacity(geometry, output)?;
        self.write_params(Self::geometry_params(geometry, 0)?);
        self.dispatch(
            &self.kernels.corner_turn,
            "Corner Turn",
            &[&input.buffer, &output.buffer, &self.params],
            geometry.total(),
        );
        self.dispatch(
            &self.kernels.copy_back,
            "Corner Turn Copy Back",
            &[&output.buffer, &input.buffer, &self.params],
            geometry.total(),
        );
        Ok(())
    }

    fn legacy_rfi(&mut self, input: &mut Self::Input, geometry: &ChunkGeometry) -> BackendResult<()> {
        Self::check_capacity(geometry, input)?;
        self.write_params(Self::geometry_params(geometry, 0)?);
        self.dispatch(
            &self.kernels.legacy_rfi,
            "Legacy RFI",
            &[&input.buffer, &self.params],
            geometry.nchans,
        );
        Ok(())
    }

    fn bin(
        &mut self,
        input: &mut Self::Input,
        output: &mut Self::Output,
        geometry: &ChunkGeometry,
    ) -> BackendResult<usize> {
        Self::check_capacity(geometry, input)?;
        let binned = ChunkGeometry {
            nchans: geometry.nchans,
            row_len: geometry.row_len / 2,
        };
        Self::check_capacity(&binned, output)?;

        self.write_params(Self::geometry_params(geometry, 0)?);
        self.dispatch(
            &self.kernels.bin,
            "Bin",
            &[&input.buffer, &output.buffer, &self.params],
            binned.total(),
        );

        self.write_params(Self::geometry_params(&binned, 0)?);
        self.dispatch(
            &self.kernels.copy_back,
            "Bin Copy Back",
            &[&output.buffer, &input.buffer, &self.params],
            binned.total(),
        );
        Ok(binned.row_len)
    }

    fn dedisperse(
        &mut self,
        input: &Self::Input,
        output: &mut Self::Output,
        job: &DedispersionJob,
    ) -> BackendResult<()> {
        match self.staged_range {
            Some(staged) if staged.range == job.range => {}
            _ => {
                return Err(BackendError::InvalidGeometry(format!(
                    "range {} dedispersed without being staged",
                    job.range
                )))
            }
        }
        Self::check_capacity(&job.geometry, input)?;
        check_job(job, &self.host_shifts, output.len)?;
        if job.nsamp == 0 || job.ndms == 0 {
            return Ok(());
        }
        let shifts = self.shifts.as_ref().ok_or_else(|| {
            BackendError::InvalidGeometry("shift table not staged".to_string())
        })?;

        self.write_params(KernelParams {
            nchans: to_u32(job.geometry.nchans, "channel count")?,
            row_len: to_u32(job.geometry.row_len, "row length")?,
            nsamp: to_u32(job.nsamp, "sample count")?,
            ndms: to_u32(job.ndms, "trial count")?,
            dm_low: job.dm_low,
            dm_step: job.dm_step,
            bin_factor: job.bin_factor,
            nbits: 0,
        });
        self.dispatch(
            &self.kernels.dedisperse,
            "Dedisperse",
            &[&input.buffer, &shifts.buffer, &output.buffer, &self.params],
            job.output_len(),
        );
        Ok(())
    }

    fn read_trials(
        &mut self,
        output: &Self::Output,
        offset: usize,
        dst: &mut [f32],
    ) -> BackendResult<()> {
        if dst.is_empty() {
            return Ok(());
        }
        if offset + dst.len() > output.len {
            return Err(BackendError::InvalidGeometry(format!(
                "read of {} values at {} exceeds output capacity {}",
                dst.len(),
                offset,
                output.len
            )));
        }

        let size = (dst.len() * 4) as u64;
        let staging_buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Trial Staging"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Download Trials"),
            });
        encoder.copy_buffer_to_buffer(&output.buffer, (offset * 4) as u64, &staging_buffer, 0, size);
        self.queue.submit(Some(encoder.finish()));

        // Map staging buffer to CPU memory (blocking)
        let buffer_slice = staging_buffer.slice(..);
        let (sender, receiver) = std::sync::mpsc::channel();
        buffer_slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);
        receiver
            .recv()
            .map_err(|_| BackendError::Device("Failed to receive trial map result".to_string()))?
            .map_err(|e| BackendError::Device(format!("Failed to map trial buffer: {:?}", e)))?;

        {
            let data = buffer_slice.get_mapped_range();
            dst.copy_from_slice(bytemuck::cast_slice(&data));
        }
        staging_buffer.unmap();
        Ok(())
    }

    fn synchronize(&mut self) -> BackendResult<()> {
        self.device.poll(wgpu::Maintain::Wait);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workgroups_split_large_dispatch() {
        assert_eq!(workgroups(0), (1, 1));
        assert_eq!(workgroups(256), (1, 1));
        assert_eq!(workgroups(257), (2, 1));
        let (x, y) = workgroups(MAX_WORKGROUPS_PER_DIM * WORKGROUP_SIZE + 1);
        assert_eq!(x as usize, MAX_WORKGROUPS_PER_DIM);
        assert_eq!(y, 2);
    }

    #[test]
    fn test_params_layout_matches_shader() {
        assert_eq!(std::mem::size_of::<KernelParams>(), 32);
    }
}
