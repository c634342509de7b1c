//! Bicubic resampling in a wgpu compute shader.
//!
//! Pixels travel as packed RGBA8 storage buffers, so no texture format
//! negotiation is needed and any adapter with compute support works.

use anyhow::{anyhow, Context, Result};
use image::RgbaImage;
use tracing::{debug, info};
use wgpu::util::DeviceExt;

use super::Resampler;

const WORKGROUP_SIZE: u32 = 8;

const BICUBIC_WGSL: &str = r#"
struct Params {
    src_w: u32,
    src_h: u32,
    dst_w: u32,
    dst_h: u32,
};

@group(0) @binding(0) var<storage, read> src: array<u32>;
@group(0) @binding(1) var<storage, read_write> dst: array<u32>;
@group(0) @binding(2) var<uniform> params: Params;

fn catmull_rom(x: f32) -> f32 {
    let a = abs(x);
    if (a <= 1.0) {
        return 1.5 * a * a * a - 2.5 * a * a + 1.0;
    }
    if (a < 2.0) {
        return -0.5 * a * a * a + 2.5 * a * a - 4.0 * a + 2.0;
    }
    return 0.0;
}

fn fetch(x: i32, y: i32) -> vec4<f32> {
    let cx = clamp(x, 0, i32(params.src_w) - 1);
    let cy = clamp(y, 0, i32(params.src_h) - 1);
    return unpack4x8unorm(src[u32(cy) * params.src_w + u32(cx)]);
}

@compute @workgroup_size(8, 8)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    if (id.x >= params.dst_w || id.y >= params.dst_h) {
        return;
    }
    let sx = (f32(id.x) + 0.5) * f32(params.src_w) / f32(params.dst_w) - 0.5;
    let sy = (f32(id.y) + 0.5) * f32(params.src_h) / f32(params.dst_h) - 0.5;
    let fx = floor(sx);
    let fy = floor(sy);
    let tx = sx - fx;
    let ty = sy - fy;

    var acc = vec4<f32>(0.0);
    var weight_sum = 0.0;
    for (var j = -1; j <= 2; j++) {
        let wy = catmull_rom(f32(j) - ty);
        for (var i = -1; i <= 2; i++) {
            let w = catmull_rom(f32(i) - tx) * wy;
            acc += fetch(i32(fx) + i, i32(fy) + j) * w;
            weight_sum += w;
        }
    }
    let color = clamp(acc / weight_sum, vec4<f32>(0.0), vec4<f32>(1.0));
    dst[id.y * params.dst_w + id.x] = pack4x8unorm(color);
}
"#;

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct Params {
    src_w: u32,
    src_h: u32,
    dst_w: u32,
    dst_h: u32,
}

pub struct GpuResampler {
    device: wgpu::Device,
    queue: wgpu::Queue,
    pipeline: wgpu::ComputePipeline,
}

impl GpuResampler {
    /// Acquires a high-performance adapter and compiles the resize shader.
    pub fn new() -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            ..Default::default()
        });
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .context("no GPU adapter available for resampling")?;

        let adapter_info = adapter.get_info();
        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("tilescale resampler"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            memory_hints: wgpu::MemoryHints::default(),
            trace: Default::default(),
        }))
        .context("failed to open GPU device for resampling")?;

        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("bicubic resize"),
            source: wgpu::ShaderSource::Wgsl(BICUBIC_WGSL.into()),
        });
        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("bicubic resize"),
            layout: None,
            module: &module,
            entry_point: Some("main"),
            compilation_options: Default::default(),
            cache: None,
        });

        info!(
            adapter = %adapter_info.name,
            backend = ?adapter_info.backend,
            "GPU resampler ready"
        );

        Ok(Self {
            device,
            queue,
            pipeline,
        })
    }
}

impl Resampler for GpuResampler {
    fn name(&self) -> &'static str {
        "gpu-bicubic"
    }

    fn resize(&self, image: &RgbaImage, width: u32, height: u32) -> Result<RgbaImage> {
        anyhow::ensure!(
            width > 0 && height > 0 && image.width() > 0 && image.height() > 0,
            "GPU resize needs non-empty input and output"
        );

        let packed: Vec<u32> = image
            .as_raw()
            .chunks_exact(4)
            .map(|px| u32::from_le_bytes([px[0], px[1], px[2], px[3]]))
            .collect();
        let params = Params {
            src_w: image.width(),
            src_h: image.height(),
            dst_w: width,
            dst_h: height,
        };
        let output_size = width as u64 * height as u64 * 4;

        let src_buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("resize source"),
                contents: bytemuck::cast_slice(packed.as_slice()),
                usage: wgpu::BufferUsages::STORAGE,
            });
        let params_buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("resize params"),
                contents: bytemuck::bytes_of(&params),
                usage: wgpu::BufferUsages::UNIFORM,
            });
        let dst_buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("resize output"),
            size: output_size,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let readback = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("resize readback"),
            size: output_size,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("resize bindings"),
            layout: &self.pipeline.get_bind_group_layout(0),
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: src_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: dst_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: params_buffer.as_entire_binding(),
                },
            ],
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("resize encoder"),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("resize pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(
                width.div_ceil(WORKGROUP_SIZE),
                height.div_ceil(WORKGROUP_SIZE),
                1,
            );
        }
        encoder.copy_buffer_to_buffer(&dst_buffer, 0, &readback, 0, output_size);
        self.queue.submit(std::iter::once(encoder.finish()));

        let slice = readback.slice(..);
        let (sender, receiver) = futures_intrusive::channel::shared::oneshot_channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.device
            .poll(wgpu::PollType::Wait)
            .context("GPU poll failed while waiting for resize")?;
        pollster::block_on(receiver.receive())
            .ok_or_else(|| anyhow!("GPU readback channel closed"))?
            .context("failed to map GPU resize output")?;

        let bytes = slice.get_mapped_range().to_vec();
        readback.unmap();

        debug!(
            src_w = image.width(),
            src_h = image.height(),
            dst_w = width,
            dst_h = height,
            "GPU bicubic resize finished"
        );

        RgbaImage::from_raw(width, height, bytes)
            .ok_or_else(|| anyhow!("GPU resize returned a buffer of unexpected size"))
    }
}
