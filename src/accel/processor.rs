// Cross-device frame blending on a wgpu compute adapter.
//
// Initialization walks a fixed ladder of states. Every rung either succeeds
// and advances, or the whole processor drops back to `Uninitialized` with
// nothing half-built left behind:
//
//   Uninitialized -> PlatformEnumerated -> DeviceSelected
//                 -> ContextReady -> KernelCompiled -> Ready
//
// Buffers are created per `combine` call and dropped before it returns, on
// success and failure alike.
//
// wgpu reports validation and allocation problems asynchronously through
// error scopes. Creation and execution are each bracketed by a scope so
// failures come back as typed errors. The default uncaptured-error handler
// panics, so it is replaced with one that logs.

use wgpu::util::DeviceExt;

use crate::accel::FrameCombiner;
use crate::accel::kernel::{BLEND_KERNEL_WGSL, BlendParams, ENTRY_POINT, dispatch_size};
use crate::accel::selection::{self, AdapterSummary, ComputePlatform};
use crate::config::AcceleratorVendor;
use crate::error::{FrameGenError, FrameGenResult};
use crate::frame::CapturedFrame;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    Uninitialized,
    PlatformEnumerated,
    DeviceSelected,
    ContextReady,
    KernelCompiled,
    Ready,
}

struct AcceleratorContext {
    device: wgpu::Device,
    queue: wgpu::Queue,
}

struct BlendKernel {
    pipeline: wgpu::ComputePipeline,
    layout: wgpu::BindGroupLayout,
}

pub struct CrossAcceleratorProcessor {
    preferred: AcceleratorVendor,
    state: ProcessorState,
    summaries: Vec<AdapterSummary>,
    platforms: Vec<ComputePlatform>,
    selected: Option<AdapterSummary>,
    kernel: Option<BlendKernel>,
    context: Option<AcceleratorContext>,
    adapters: Vec<wgpu::Adapter>,
    adapter: Option<wgpu::Adapter>,
    // Declared last so it outlives every object created from it.
    instance: Option<wgpu::Instance>,
}

impl CrossAcceleratorProcessor {
    pub fn new(preferred: AcceleratorVendor) -> Self {
        Self {
            preferred,
            state: ProcessorState::Uninitialized,
            summaries: Vec::new(),
            platforms: Vec::new(),
            selected: None,
            kernel: None,
            context: None,
            adapters: Vec::new(),
            adapter: None,
            instance: None,
        }
    }

    pub fn state(&self) -> ProcessorState {
        self.state
    }

    /// The adapter in use, once a device has been selected.
    pub fn selected_adapter(&self) -> Option<&AdapterSummary> {
        self.selected.as_ref()
    }

    /// Drop every device object and return to `Uninitialized`.
    pub fn reset(&mut self) {
        self.kernel = None;
        self.context = None;
        self.adapter = None;
        self.adapters.clear();
        self.instance = None;
        self.summaries.clear();
        self.platforms.clear();
        self.selected = None;
        self.state = ProcessorState::Uninitialized;
    }

    fn try_initialize(&mut self) -> FrameGenResult<()> {
        self.enumerate_platforms()?;
        self.select_device()?;
        self.create_context()?;
        self.compile_kernel()?;
        self.state = ProcessorState::Ready;
        Ok(())
    }

    fn enumerate_platforms(&mut self) -> FrameGenResult<()> {
        let backends = wgpu::Backends::DX12 | wgpu::Backends::VULKAN;
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends,
            ..Default::default()
        });

        let adapters = instance.enumerate_adapters(backends);
        let summaries: Vec<AdapterSummary> = adapters
            .iter()
            .map(|adapter| AdapterSummary::from_info(&adapter.get_info()))
            .collect();
        for summary in &summaries {
            tracing::debug!(adapter = %summary, "compute adapter enumerated");
        }

        let platforms = selection::group_platforms(&summaries);
        if platforms.is_empty() {
            return Err(FrameGenError::Platform(anyhow::anyhow!(
                "no compute platforms available"
            )));
        }

        self.instance = Some(instance);
        self.adapters = adapters;
        self.summaries = summaries;
        self.platforms = platforms;
        self.state = ProcessorState::PlatformEnumerated;
        Ok(())
    }

    fn select_device(&mut self) -> FrameGenResult<()> {
        let choice = selection::select_platform(&self.platforms, &self.summaries, self.preferred)
            .ok_or_else(|| FrameGenError::Platform(anyhow::anyhow!("no compute platforms available")))?;
        let platform = &self.platforms[choice.platform];
        if choice.degraded {
            tracing::warn!(
                preferred = %self.preferred,
                fallback = %platform.name,
                "preferred compute vendor not found, falling back to first platform"
            );
        }

        let index = selection::select_device(platform, &self.summaries).ok_or_else(|| {
            FrameGenError::Platform(anyhow::anyhow!(
                "platform {} exposes no GPU-class device",
                platform.name
            ))
        })?;

        let summary = self.summaries[index].clone();
        tracing::info!(platform = %platform.name, adapter = %summary, "secondary accelerator selected");
        // The remaining adapters are no longer needed.
        self.adapter = Some(self.adapters.swap_remove(index));
        self.adapters.clear();
        self.selected = Some(summary);
        self.state = ProcessorState::DeviceSelected;
        Ok(())
    }

    fn create_context(&mut self) -> FrameGenResult<()> {
        let adapter = self.adapter.as_ref().ok_or(FrameGenError::NotReady)?;
        let (device, queue): (wgpu::Device, wgpu::Queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("crosslink-fg accelerator"),
                required_features: wgpu::Features::empty(),
                required_limits: adapter.limits(),
                memory_hints: wgpu::MemoryHints::Performance,
            },
            None,
        ))
        .map_err(|e| FrameGenError::Platform(anyhow::anyhow!("device request failed: {e}")))?;

        device.on_uncaptured_error(Box::new(|error| {
            tracing::error!(%error, "uncaptured accelerator error");
        }));

        self.context = Some(AcceleratorContext { device, queue });
        self.state = ProcessorState::ContextReady;
        Ok(())
    }

    fn compile_kernel(&mut self) -> FrameGenResult<()> {
        let ctx = self.context.as_ref().ok_or(FrameGenError::NotReady)?;
        let device = &ctx.device;

        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("blend_frames"),
            source: wgpu::ShaderSource::Wgsl(BLEND_KERNEL_WGSL.into()),
        });

        let storage = |binding: u32, read_only: bool| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };
        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("blend_frames BGL"),
            entries: &[
                storage(0, true),
                storage(1, true),
                storage(2, false),
                wgpu::BindGroupLayoutEntry {
                    binding: 3,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("blend_frames layout"),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });
        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("blend_frames pipeline"),
            layout: Some(&pipeline_layout),
            module: &module,
            entry_point: ENTRY_POINT,
            compilation_options: Default::default(),
            cache: None,
        });

        if let Some(error) = pollster::block_on(device.pop_error_scope()) {
            return Err(FrameGenError::Platform(anyhow::anyhow!(
                "blend kernel failed to build: {error}"
            )));
        }

        self.kernel = Some(BlendKernel { pipeline, layout });
        self.state = ProcessorState::KernelCompiled;
        Ok(())
    }

    fn run_blend(
        ctx: &AcceleratorContext,
        kernel: &BlendKernel,
        previous: &CapturedFrame,
        current: &CapturedFrame,
        blend: f32,
    ) -> FrameGenResult<Vec<u8>> {
        let device = &ctx.device;
        let size = current.data.len() as u64;
        let max_binding = u64::from(device.limits().max_storage_buffer_binding_size);
        if size > max_binding {
            return Err(FrameGenError::BufferCreationFailed(format!(
                "{size}-byte frame exceeds the {max_binding}-byte storage binding limit"
            )));
        }

        device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let input_a = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("blend input a"),
            contents: &previous.data,
            usage: wgpu::BufferUsages::STORAGE,
        });
        let input_b = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("blend input b"),
            contents: &current.data,
            usage: wgpu::BufferUsages::STORAGE,
        });
        let output = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("blend output"),
            size,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let readback = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("blend readback"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let params = BlendParams::new(current.width, current.height, blend);
        let params_buf = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("blend params"),
            contents: bytemuck::bytes_of(&params),
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let validation = pollster::block_on(device.pop_error_scope());
        let oom = pollster::block_on(device.pop_error_scope());
        if let Some(error) = validation.or(oom) {
            return Err(FrameGenError::BufferCreationFailed(error.to_string()));
        }

        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("blend_frames BG"),
            layout: &kernel.layout,
            entries: &[
                wgpu::BindGroupEntry { binding: 0, resource: input_a.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 1, resource: input_b.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 2, resource: output.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 3, resource: params_buf.as_entire_binding() },
            ],
        });

        let (wg_x, wg_y) = dispatch_size(current.width, current.height);
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("blend_frames dispatch"),
        });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("blend_frames"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&kernel.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(wg_x, wg_y, 1);
        }
        encoder.copy_buffer_to_buffer(&output, 0, &readback, 0, size);
        ctx.queue.submit(std::iter::once(encoder.finish()));
        if let Some(error) = pollster::block_on(device.pop_error_scope()) {
            return Err(FrameGenError::ExecutionFailed(error.to_string()));
        }

        let slice = readback.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        let _ = device.poll(wgpu::Maintain::Wait);
        match rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(FrameGenError::ReadbackFailed(e.to_string())),
            Err(_) => {
                return Err(FrameGenError::ReadbackFailed(
                    "map callback never ran".to_string(),
                ));
            }
        }

        let mapped = slice.get_mapped_range();
        let pixels = mapped.to_vec();
        drop(mapped);
        readback.unmap();
        Ok(pixels)
    }
}

impl FrameCombiner for CrossAcceleratorProcessor {
    fn is_ready(&self) -> bool {
        self.state == ProcessorState::Ready
    }

    fn initialize(&mut self) -> bool {
        if self.is_ready() {
            return true;
        }
        match self.try_initialize() {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, stage = ?self.state, "secondary accelerator initialization failed");
                self.reset();
                false
            }
        }
    }

    fn combine(
        &mut self,
        previous: &CapturedFrame,
        current: &CapturedFrame,
        blend_factor: f32,
    ) -> FrameGenResult<CapturedFrame> {
        if !self.is_ready() {
            return Err(FrameGenError::NotReady);
        }
        let (Some(ctx), Some(kernel)) = (self.context.as_ref(), self.kernel.as_ref()) else {
            return Err(FrameGenError::NotReady);
        };
        if !previous.is_compatible_with(current) {
            return Err(FrameGenError::FrameMismatch(format!(
                "{}x{} {:?} cannot blend with {}x{} {:?}",
                previous.width,
                previous.height,
                previous.format,
                current.width,
                current.height,
                current.format
            )));
        }
        if current.data.is_empty() {
            return Err(FrameGenError::FrameMismatch("frames hold no pixels".to_string()));
        }
        if !blend_factor.is_finite() {
            return Err(FrameGenError::InvalidConfig(format!(
                "blend factor {blend_factor} is not finite"
            )));
        }

        let data = Self::run_blend(ctx, kernel, previous, current, blend_factor.clamp(0.0, 1.0))?;
        Ok(CapturedFrame {
            width: current.width,
            height: current.height,
            format: current.format,
            sequence: current.sequence,
            capture_time: current.capture_time,
            capture_time_qpc: current.capture_time_qpc,
            data,
            transfer: None,
        })
    }
}

impl std::fmt::Debug for CrossAcceleratorProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrossAcceleratorProcessor")
            .field("preferred", &self.preferred)
            .field("state", &self.state)
            .field("selected", &self.selected)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accel::kernel::blend_rgba8;

    fn gradient(width: u32, height: u32, seed: u32) -> CapturedFrame {
        let data = (0..width * height * 4)
            .map(|i| (i.wrapping_mul(31).wrapping_add(seed) % 256) as u8)
            .collect();
        CapturedFrame::from_rgba8(width, height, data).expect("valid frame")
    }

    #[test]
    fn starts_uninitialized_and_refuses_work() {
        let mut processor = CrossAcceleratorProcessor::new(AcceleratorVendor::Amd);
        assert_eq!(processor.state(), ProcessorState::Uninitialized);
        assert!(!processor.is_ready());
        let frame = gradient(2, 2, 0);
        assert!(matches!(
            processor.combine(&frame, &frame, 0.5),
            Err(FrameGenError::NotReady)
        ));
    }

    #[test]
    fn reset_returns_to_uninitialized() {
        let mut processor = CrossAcceleratorProcessor::new(AcceleratorVendor::Any);
        processor.state = ProcessorState::ContextReady;
        processor.reset();
        assert_eq!(processor.state(), ProcessorState::Uninitialized);
        assert!(processor.selected_adapter().is_none());
    }

    #[test]
    #[ignore = "requires a DX12 or Vulkan GPU adapter"]
    fn gpu_blend_matches_cpu_reference() {
        let mut processor = CrossAcceleratorProcessor::new(AcceleratorVendor::Any);
        assert!(processor.initialize());
        assert_eq!(processor.state(), ProcessorState::Ready);
        assert!(processor.initialize(), "initialize is idempotent once ready");

        let a = gradient(37, 19, 3);
        let b = gradient(37, 19, 200);
        for t in [0.0f32, 0.25, 0.5, 1.0] {
            let blended = processor.combine(&a, &b, t).expect("blend succeeds");
            let mut expected = vec![0u8; a.data.len()];
            blend_rgba8(&a.data, &b.data, t, &mut expected);
            assert_eq!(blended.data, expected, "blend factor {t}");
            assert_eq!(blended.dimensions(), (37, 19));
        }
    }

    #[test]
    #[ignore = "requires a DX12 or Vulkan GPU adapter"]
    fn gpu_rejects_mismatched_frames() {
        let mut processor = CrossAcceleratorProcessor::new(AcceleratorVendor::Any);
        assert!(processor.initialize());
        let result = processor.combine(&gradient(4, 4, 0), &gradient(8, 4, 0), 0.5);
        assert!(matches!(result, Err(FrameGenError::FrameMismatch(_))));
        assert!(processor.is_ready());
    }
}
