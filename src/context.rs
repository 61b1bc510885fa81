use std::thread::{self, ThreadId};

use anyhow::{anyhow, Context, Result};
use log::warn;

use crate::canvas::CanvasSurface;

const BLIT_SHADER: &str = r#"
struct VertexOutput {
  @builtin(position) position: vec4<f32>,
  @location(0) uv: vec2<f32>,
}

@vertex
fn vs_main(@builtin(vertex_index) index: u32) -> VertexOutput {
  // Fullscreen triangle.
  var out: VertexOutput;
  let x = f32(i32(index) / 2) * 4.0 - 1.0;
  let y = f32(i32(index) % 2) * 4.0 - 1.0;
  out.position = vec4<f32>(x, -y, 0.0, 1.0);
  out.uv = vec2<f32>((x + 1.0) * 0.5, (y + 1.0) * 0.5);
  return out;
}

@group(0) @binding(0) var src_tex: texture_2d<f32>;
@group(0) @binding(1) var src_sampler: sampler;

@fragment
fn fs_main(input: VertexOutput) -> @location(0) vec4<f32> {
  return vec4<f32>(textureSample(src_tex, src_sampler, input.uv).rgb, 1.0);
}
"#;

struct BlitPipeline {
    pipeline: wgpu::RenderPipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    sampler: wgpu::Sampler,
}

enum SurfaceBinding {
    Display {
        surface: wgpu::Surface<'static>,
        config: wgpu::SurfaceConfiguration,
        blit: BlitPipeline,
    },
    Headless,
}

/// Owned GPU device plus an optional display surface. A context is bound to
/// exactly one thread at a time; `bind` moves ownership to the calling thread
/// and GPU entry points assert the binding in debug builds. The preview and
/// the encoder each hold their own context and never share GPU objects.
pub struct GraphicsContext {
    _adapter: wgpu::Adapter,
    device: wgpu::Device,
    queue: wgpu::Queue,
    binding: SurfaceBinding,
    bound_thread: ThreadId,
}

impl GraphicsContext {
    /// Create a context driving a window surface. Binds to the calling
    /// thread.
    pub fn for_surface(
        instance: wgpu::Instance,
        surface: wgpu::Surface<'static>,
        width: u32,
        height: u32,
    ) -> Result<Self> {
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            force_fallback_adapter: false,
            compatible_surface: Some(&surface),
        }))
        .ok_or_else(|| anyhow!("no compatible GPU adapter for the window surface"))?;

        let (device, queue) = request_device(&adapter, "fadereel-display-device")?;

        let capabilities = surface.get_capabilities(&adapter);
        let format = pick_surface_format(&capabilities);
        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format,
            width: width.max(1),
            height: height.max(1),
            present_mode: wgpu::PresentMode::AutoVsync,
            alpha_mode: capabilities
                .alpha_modes
                .first()
                .copied()
                .unwrap_or(wgpu::CompositeAlphaMode::Auto),
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        surface.configure(&device, &config);

        let blit = build_blit_pipeline(&device, format);

        Ok(Self {
            _adapter: adapter,
            device,
            queue,
            binding: SurfaceBinding::Display {
                surface,
                config,
                blit,
            },
            bound_thread: thread::current().id(),
        })
    }

    /// Create a window-less context for offscreen rendering. Binds to the
    /// calling thread.
    pub fn headless() -> Result<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor::default());
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            force_fallback_adapter: false,
            compatible_surface: None,
        }))
        .ok_or_else(|| anyhow!("no compatible GPU adapter for offscreen rendering"))?;

        let (device, queue) = request_device(&adapter, "fadereel-headless-device")?;

        Ok(Self {
            _adapter: adapter,
            device,
            queue,
            binding: SurfaceBinding::Headless,
            bound_thread: thread::current().id(),
        })
    }

    /// Rebind the context to the calling thread. The previous owner must not
    /// issue further GPU work.
    pub fn bind(&mut self) {
        self.bound_thread = thread::current().id();
    }

    pub fn is_bound_here(&self) -> bool {
        thread::current().id() == self.bound_thread
    }

    pub(crate) fn assert_bound(&self) {
        debug_assert!(
            self.is_bound_here(),
            "graphics context used from a thread it is not bound to"
        );
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// Reconfigure the display surface for a new size. No-op for headless
    /// contexts.
    pub fn configure_surface(&mut self, width: u32, height: u32) {
        self.assert_bound();
        if let SurfaceBinding::Display {
            surface, config, ..
        } = &mut self.binding
        {
            config.width = width.max(1);
            config.height = height.max(1);
            surface.configure(&self.device, config);
        }
    }

    /// Blit the offscreen canvas target onto the next swapchain frame and
    /// present it. Returns false when the frame was skipped because the
    /// surface had to be reconfigured or timed out.
    pub fn present(&mut self, canvas: &CanvasSurface) -> Result<bool> {
        self.assert_bound();
        let SurfaceBinding::Display {
            surface,
            config,
            blit,
        } = &mut self.binding
        else {
            anyhow::bail!("present requires a display-bound context");
        };

        let frame = match surface.get_current_texture() {
            Ok(frame) => frame,
            Err(wgpu::SurfaceError::Outdated | wgpu::SurfaceError::Lost) => {
                surface.configure(&self.device, config);
                return Ok(false);
            }
            Err(wgpu::SurfaceError::Timeout) => {
                warn!("display surface frame timed out, skipping");
                return Ok(false);
            }
            Err(error) => {
                return Err(error).context("failed acquiring display surface frame");
            }
        };

        let frame_view = frame
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("fadereel-blit-bind-group"),
            layout: &blit.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(canvas.texture_view()),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(&blit.sampler),
                },
            ],
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("fadereel-blit-encoder"),
            });
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("fadereel-blit-pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &frame_view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                occlusion_query_set: None,
                timestamp_writes: None,
            });
            pass.set_pipeline(&blit.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.draw(0..3, 0..1);
        }

        self.queue.submit(Some(encoder.finish()));
        frame.present();
        Ok(true)
    }
}

fn request_device(adapter: &wgpu::Adapter, label: &str) -> Result<(wgpu::Device, wgpu::Queue)> {
    pollster::block_on(adapter.request_device(
        &wgpu::DeviceDescriptor {
            label: Some(label),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::downlevel_defaults(),
        },
        None,
    ))
    .context("failed requesting GPU device")
}

fn pick_surface_format(capabilities: &wgpu::SurfaceCapabilities) -> wgpu::TextureFormat {
    capabilities
        .formats
        .iter()
        .copied()
        .find(|format| format.is_srgb())
        .unwrap_or_else(|| {
            capabilities
                .formats
                .first()
                .copied()
                .unwrap_or(wgpu::TextureFormat::Bgra8UnormSrgb)
        })
}

fn build_blit_pipeline(device: &wgpu::Device, format: wgpu::TextureFormat) -> BlitPipeline {
    let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some("fadereel-blit-shader"),
        source: wgpu::ShaderSource::Wgsl(BLIT_SHADER.into()),
    });

    let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("fadereel-blit-bind-group-layout"),
        entries: &[
            wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Texture {
                    sample_type: wgpu::TextureSampleType::Float { filterable: true },
                    view_dimension: wgpu::TextureViewDimension::D2,
                    multisampled: false,
                },
                count: None,
            },
            wgpu::BindGroupLayoutEntry {
                binding: 1,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                count: None,
            },
        ],
    });

    let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some("fadereel-blit-pipeline-layout"),
        bind_group_layouts: &[&bind_group_layout],
        push_constant_ranges: &[],
    });

    let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some("fadereel-blit-pipeline"),
        layout: Some(&pipeline_layout),
        vertex: wgpu::VertexState {
            module: &shader,
            entry_point: "vs_main",
            buffers: &[],
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        },
        primitive: wgpu::PrimitiveState::default(),
        depth_stencil: None,
        multisample: wgpu::MultisampleState::default(),
        fragment: Some(wgpu::FragmentState {
            module: &shader,
            entry_point: "fs_main",
            targets: &[Some(wgpu::ColorTargetState {
                format,
                blend: None,
                write_mask: wgpu::ColorWrites::ALL,
            })],
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        }),
        multiview: None,
    });

    let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
        label: Some("fadereel-blit-sampler"),
        mag_filter: wgpu::FilterMode::Linear,
        min_filter: wgpu::FilterMode::Linear,
        ..Default::default()
    });

    BlitPipeline {
        pipeline,
        bind_group_layout,
        sampler,
    }
}
