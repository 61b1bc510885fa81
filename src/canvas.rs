use std::collections::HashMap;
use std::num::NonZeroU32;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};

use anyhow::{anyhow, Context, Result};
use bytemuck::{Pod, Zeroable};
use image::{ImageReader, RgbaImage};

use crate::context::GraphicsContext;

/// Textured quad shader shared by every canvas draw. Image draws use a white
/// tint with the draw opacity in the alpha channel; rect fills sample a 1x1
/// white texture so the tint becomes the fill color.
const CANVAS_SHADER: &str = r#"
struct TintUniform {
  color: vec4<f32>,
}

@group(0) @binding(0) var draw_tex: texture_2d<f32>;
@group(0) @binding(1) var draw_sampler: sampler;
@group(0) @binding(2) var<uniform> tint: TintUniform;

struct VertexInput {
  @location(0) position: vec2<f32>,
  @location(1) uv: vec2<f32>,
}

struct VertexOutput {
  @builtin(position) position: vec4<f32>,
  @location(0) uv: vec2<f32>,
}

@vertex
fn vs_main(input: VertexInput) -> VertexOutput {
  var out: VertexOutput;
  out.position = vec4<f32>(input.position, 0.0, 1.0);
  out.uv = input.uv;
  return out;
}

@fragment
fn fs_main(input: VertexOutput) -> @location(0) vec4<f32> {
  return textureSample(draw_tex, draw_sampler, input.uv) * tint.color;
}
"#;

static NEXT_IMAGE_ID: AtomicU64 = AtomicU64::new(1);

/// A decoded bitmap shared across frames and across both render paths.
/// Immutable; GPU texture uploads are cached per canvas surface by `id`
/// because the preview and encode contexts never share GPU objects.
pub struct ImageResource {
    id: u64,
    pixels: RgbaImage,
}

impl ImageResource {
    pub fn from_rgba(pixels: RgbaImage) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_IMAGE_ID.fetch_add(1, Ordering::Relaxed),
            pixels,
        })
    }

    pub fn load(path: &Path) -> Result<Arc<Self>> {
        let pixels = ImageReader::open(path)
            .with_context(|| format!("failed opening {}", path.display()))?
            .decode()
            .with_context(|| format!("failed decoding {}", path.display()))?
            .to_rgba8();
        Ok(Self::from_rgba(pixels))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl Rect {
    pub fn from_xywh(x: f32, y: f32, w: f32, h: f32) -> Self {
        Self { x, y, w, h }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Color {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl Color {
    pub const BLACK: Color = Color::opaque(0.0, 0.0, 0.0);
    pub const WHITE: Color = Color::opaque(1.0, 1.0, 1.0);
    pub const LIGHT_GRAY: Color = Color::opaque(0.8, 0.8, 0.8);
    pub const RED: Color = Color::opaque(1.0, 0.0, 0.0);

    pub const fn opaque(r: f32, g: f32, b: f32) -> Self {
        Self { r, g, b, a: 1.0 }
    }
}

/// One recorded draw operation.
#[derive(Clone)]
pub enum DrawCmd {
    Image {
        image: Arc<ImageResource>,
        dst: Rect,
        opacity: f32,
    },
    FillRect {
        dst: Rect,
        rotation_degrees: f32,
        color: Color,
    },
}

/// CPU-side draw recorder. Both the live preview and the offline encoder
/// record into a `Canvas` and execute it through a `CanvasSurface`, which is
/// what makes their frames bit-identical for the same timeline and timestamp.
pub struct Canvas {
    width: u32,
    height: u32,
    clear_color: Color,
    commands: Vec<DrawCmd>,
}

impl Canvas {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            clear_color: Color::BLACK,
            commands: Vec::new(),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Drop everything recorded so far and set the background color.
    pub fn clear(&mut self, color: Color) {
        self.commands.clear();
        self.clear_color = color;
    }

    /// Reset to the default state between frames.
    pub fn reset(&mut self) {
        self.commands.clear();
        self.clear_color = Color::BLACK;
    }

    pub fn draw_image(&mut self, image: &Arc<ImageResource>, dst: Rect, opacity: f32) {
        self.commands.push(DrawCmd::Image {
            image: Arc::clone(image),
            dst,
            opacity: opacity.clamp(0.0, 1.0),
        });
    }

    pub fn fill_rect(&mut self, dst: Rect, rotation_degrees: f32, color: Color) {
        self.commands.push(DrawCmd::FillRect {
            dst,
            rotation_degrees,
            color,
        });
    }

    pub fn clear_color(&self) -> Color {
        self.clear_color
    }

    pub fn commands(&self) -> &[DrawCmd] {
        &self.commands
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct Vertex {
    position: [f32; 2],
    uv: [f32; 2],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct TintUniform {
    color: [f32; 4],
}

struct CachedImage {
    _texture: wgpu::Texture,
    view: wgpu::TextureView,
}

/// GPU render target sized to the current output dimensions. Rebuilt whenever
/// the output size changes; owns the draw pipeline, a padded readback buffer,
/// and a per-context texture cache for shared image resources.
pub struct CanvasSurface {
    width: u32,
    height: u32,
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    readback_buffer: wgpu::Buffer,
    unpadded_bytes_per_row: u32,
    padded_bytes_per_row: u32,
    pipeline: wgpu::RenderPipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    sampler: wgpu::Sampler,
    white: CachedImage,
    image_cache: HashMap<u64, CachedImage>,
}

impl CanvasSurface {
    pub fn new(ctx: &GraphicsContext, width: u32, height: u32) -> Result<Self> {
        ctx.assert_bound();
        if width == 0 || height == 0 {
            anyhow::bail!("canvas surface requires non-zero dimensions, got {width}x{height}");
        }

        let device = ctx.device();
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("fadereel-canvas-target"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());

        let unpadded_bytes_per_row = width
            .checked_mul(4)
            .ok_or_else(|| anyhow!("frame width overflow when computing row bytes"))?;
        let padded_bytes_per_row =
            align_to(unpadded_bytes_per_row, wgpu::COPY_BYTES_PER_ROW_ALIGNMENT);
        let readback_size = u64::from(padded_bytes_per_row) * u64::from(height);
        let readback_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("fadereel-readback-buffer"),
            size: readback_size,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("fadereel-canvas-bind-group-layout"),
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
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: wgpu::BufferSize::new(
                            std::mem::size_of::<TintUniform>() as u64
                        ),
                    },
                    count: None,
                },
            ],
        });

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("fadereel-canvas-shader"),
            source: wgpu::ShaderSource::Wgsl(CANVAS_SHADER.into()),
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("fadereel-canvas-pipeline-layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("fadereel-canvas-pipeline"),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &shader,
                entry_point: "vs_main",
                buffers: &[wgpu::VertexBufferLayout {
                    array_stride: std::mem::size_of::<Vertex>() as wgpu::BufferAddress,
                    step_mode: wgpu::VertexStepMode::Vertex,
                    attributes: &wgpu::vertex_attr_array![0 => Float32x2, 1 => Float32x2],
                }],
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            },
            primitive: wgpu::PrimitiveState::default(),
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            fragment: Some(wgpu::FragmentState {
                module: &shader,
                entry_point: "fs_main",
                targets: &[Some(wgpu::ColorTargetState {
                    format: wgpu::TextureFormat::Rgba8Unorm,
                    blend: Some(wgpu::BlendState::ALPHA_BLENDING),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            }),
            multiview: None,
        });

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("fadereel-canvas-sampler"),
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        let white = upload_rgba(ctx, "fadereel-white-texture", 1, 1, &[255, 255, 255, 255])?;

        Ok(Self {
            width,
            height,
            texture,
            view,
            readback_buffer,
            unpadded_bytes_per_row,
            padded_bytes_per_row,
            pipeline,
            bind_group_layout,
            sampler,
            white,
            image_cache: HashMap::new(),
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// View of the offscreen color target, used by the display blit.
    pub fn texture_view(&self) -> &wgpu::TextureView {
        &self.view
    }

    /// Execute the recorded canvas against the offscreen target and submit
    /// the GPU work.
    pub fn flush(&mut self, ctx: &GraphicsContext, canvas: &Canvas) -> Result<()> {
        ctx.assert_bound();
        for command in canvas.commands() {
            if let DrawCmd::Image { image, .. } = command {
                self.ensure_cached(ctx, image)?;
            }
        }

        let device = ctx.device();
        let clear = canvas.clear_color();

        struct PreparedDraw {
            bind_group: wgpu::BindGroup,
            vertex_buffer: wgpu::Buffer,
        }

        let mut draws = Vec::with_capacity(canvas.commands().len());
        for command in canvas.commands() {
            let (view, vertices, tint) = match command {
                DrawCmd::Image {
                    image,
                    dst,
                    opacity,
                } => {
                    let cached = self
                        .image_cache
                        .get(&image.id())
                        .ok_or_else(|| anyhow!("image {} missing from texture cache", image.id()))?;
                    (
                        &cached.view,
                        quad_for_rect(self.width, self.height, *dst, 0.0),
                        TintUniform {
                            color: [1.0, 1.0, 1.0, *opacity],
                        },
                    )
                }
                DrawCmd::FillRect {
                    dst,
                    rotation_degrees,
                    color,
                } => (
                    &self.white.view,
                    quad_for_rect(self.width, self.height, *dst, *rotation_degrees),
                    TintUniform {
                        color: [color.r, color.g, color.b, color.a],
                    },
                ),
            };

            let vertex_buffer = create_buffer_init(
                device,
                "fadereel-canvas-vertices",
                bytemuck::cast_slice(&vertices),
                wgpu::BufferUsages::VERTEX,
            );
            let uniform_buffer = create_buffer_init(
                device,
                "fadereel-canvas-tint",
                bytemuck::bytes_of(&tint),
                wgpu::BufferUsages::UNIFORM,
            );
            let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("fadereel-canvas-draw"),
                layout: &self.bind_group_layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: wgpu::BindingResource::TextureView(view),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: wgpu::BindingResource::Sampler(&self.sampler),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: uniform_buffer.as_entire_binding(),
                    },
                ],
            });
            draws.push(PreparedDraw {
                bind_group,
                vertex_buffer,
            });
        }

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("fadereel-canvas-encoder"),
        });

        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("fadereel-canvas-pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &self.view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color {
                            r: f64::from(clear.r),
                            g: f64::from(clear.g),
                            b: f64::from(clear.b),
                            a: f64::from(clear.a),
                        }),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                occlusion_query_set: None,
                timestamp_writes: None,
            });

            pass.set_pipeline(&self.pipeline);
            for draw in &draws {
                pass.set_bind_group(0, &draw.bind_group, &[]);
                pass.set_vertex_buffer(0, draw.vertex_buffer.slice(..));
                pass.draw(0..6, 0..1);
            }
        }

        ctx.queue().submit(Some(encoder.finish()));
        Ok(())
    }

    /// Copy the offscreen target into the readback buffer and return tightly
    /// packed RGBA rows.
    pub fn read_pixels(&self, ctx: &GraphicsContext) -> Result<Vec<u8>> {
        ctx.assert_bound();
        let device = ctx.device();

        let padded_bytes_per_row = NonZeroU32::new(self.padded_bytes_per_row)
            .ok_or_else(|| anyhow!("invalid padded row size {}", self.padded_bytes_per_row))?;
        let rows_per_image = NonZeroU32::new(self.height)
            .ok_or_else(|| anyhow!("invalid render height {}", self.height))?;

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("fadereel-readback-encoder"),
        });
        encoder.copy_texture_to_buffer(
            wgpu::ImageCopyTexture {
                texture: &self.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::ImageCopyBuffer {
                buffer: &self.readback_buffer,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_bytes_per_row.get()),
                    rows_per_image: Some(rows_per_image.get()),
                },
            },
            wgpu::Extent3d {
                width: self.width,
                height: self.height,
                depth_or_array_layers: 1,
            },
        );
        ctx.queue().submit(Some(encoder.finish()));

        let buffer_slice = self.readback_buffer.slice(..);
        let (sender, receiver) = mpsc::channel();
        buffer_slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        device.poll(wgpu::Maintain::Wait);

        receiver
            .recv()
            .map_err(|_| anyhow!("failed receiving GPU map callback"))?
            .context("GPU buffer mapping failed")?;

        let mapped = buffer_slice.get_mapped_range();
        let mut frame = vec![0_u8; (self.unpadded_bytes_per_row * self.height) as usize];
        for (row_index, chunk) in mapped
            .chunks(self.padded_bytes_per_row as usize)
            .take(self.height as usize)
            .enumerate()
        {
            let dst_start = row_index * self.unpadded_bytes_per_row as usize;
            let dst_end = dst_start + self.unpadded_bytes_per_row as usize;
            frame[dst_start..dst_end].copy_from_slice(&chunk[..self.unpadded_bytes_per_row as usize]);
        }

        drop(mapped);
        self.readback_buffer.unmap();
        Ok(frame)
    }

    fn ensure_cached(&mut self, ctx: &GraphicsContext, image: &Arc<ImageResource>) -> Result<()> {
        if self.image_cache.contains_key(&image.id()) {
            return Ok(());
        }
        let cached = upload_rgba(
            ctx,
            &format!("fadereel-image-{}", image.id()),
            image.width(),
            image.height(),
            image.pixels.as_raw(),
        )?;
        self.image_cache.insert(image.id(), cached);
        Ok(())
    }
}

fn upload_rgba(
    ctx: &GraphicsContext,
    label: &str,
    width: u32,
    height: u32,
    pixels: &[u8],
) -> Result<CachedImage> {
    let bytes_per_row = NonZeroU32::new(width.saturating_mul(4))
        .ok_or_else(|| anyhow!("texture '{label}' has invalid width {width}"))?;
    let rows_per_image = NonZeroU32::new(height)
        .ok_or_else(|| anyhow!("texture '{label}' has invalid height {height}"))?;

    let texture = ctx.device().create_texture(&wgpu::TextureDescriptor {
        label: Some(label),
        size: wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: wgpu::TextureFormat::Rgba8Unorm,
        usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
        view_formats: &[],
    });

    ctx.queue().write_texture(
        wgpu::ImageCopyTexture {
            texture: &texture,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        },
        pixels,
        wgpu::ImageDataLayout {
            offset: 0,
            bytes_per_row: Some(bytes_per_row.get()),
            rows_per_image: Some(rows_per_image.get()),
        },
        wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
    );

    let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
    Ok(CachedImage {
        _texture: texture,
        view,
    })
}

fn create_buffer_init(
    device: &wgpu::Device,
    label: &str,
    contents: &[u8],
    usage: wgpu::BufferUsages,
) -> wgpu::Buffer {
    use wgpu::util::DeviceExt;
    device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some(label),
        contents,
        usage,
    })
}

/// Map a destination rect (optionally rotated about its center) to clip-space
/// triangles.
fn quad_for_rect(frame_width: u32, frame_height: u32, dst: Rect, rotation_degrees: f32) -> [Vertex; 6] {
    let center_x = dst.x + dst.w * 0.5;
    let center_y = dst.y + dst.h * 0.5;
    let half_w = dst.w * 0.5;
    let half_h = dst.h * 0.5;

    let radians = rotation_degrees.to_radians();
    let sin_theta = radians.sin();
    let cos_theta = radians.cos();

    let top_left = rotate_point(-half_w, -half_h, cos_theta, sin_theta, center_x, center_y);
    let top_right = rotate_point(half_w, -half_h, cos_theta, sin_theta, center_x, center_y);
    let bottom_left = rotate_point(-half_w, half_h, cos_theta, sin_theta, center_x, center_y);
    let bottom_right = rotate_point(half_w, half_h, cos_theta, sin_theta, center_x, center_y);

    let tl = to_clip(top_left.0, top_left.1, frame_width, frame_height);
    let tr = to_clip(top_right.0, top_right.1, frame_width, frame_height);
    let bl = to_clip(bottom_left.0, bottom_left.1, frame_width, frame_height);
    let br = to_clip(bottom_right.0, bottom_right.1, frame_width, frame_height);

    [
        Vertex {
            position: tl,
            uv: [0.0, 0.0],
        },
        Vertex {
            position: bl,
            uv: [0.0, 1.0],
        },
        Vertex {
            position: tr,
            uv: [1.0, 0.0],
        },
        Vertex {
            position: tr,
            uv: [1.0, 0.0],
        },
        Vertex {
            position: bl,
            uv: [0.0, 1.0],
        },
        Vertex {
            position: br,
            uv: [1.0, 1.0],
        },
    ]
}

fn rotate_point(
    x: f32,
    y: f32,
    cos_theta: f32,
    sin_theta: f32,
    center_x: f32,
    center_y: f32,
) -> (f32, f32) {
    let rotated_x = x * cos_theta - y * sin_theta;
    let rotated_y = x * sin_theta + y * cos_theta;
    (center_x + rotated_x, center_y + rotated_y)
}

fn to_clip(x: f32, y: f32, width: u32, height: u32) -> [f32; 2] {
    let clip_x = (x / width as f32) * 2.0 - 1.0;
    let clip_y = 1.0 - (y / height as f32) * 2.0;
    [clip_x, clip_y]
}

fn align_to(value: u32, alignment: u32) -> u32 {
    let mask = alignment - 1;
    (value + mask) & !mask
}

#[cfg(test)]
mod tests {
    use super::{align_to, quad_for_rect, to_clip, Canvas, Color, DrawCmd, ImageResource, Rect};
    use image::RgbaImage;

    fn test_image(width: u32, height: u32) -> std::sync::Arc<ImageResource> {
        ImageResource::from_rgba(RgbaImage::new(width, height))
    }

    #[test]
    fn image_ids_are_unique() {
        let a = test_image(2, 2);
        let b = test_image(2, 2);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn clear_drops_recorded_commands() {
        let mut canvas = Canvas::new(64, 64);
        canvas.draw_image(&test_image(4, 4), Rect::from_xywh(0.0, 0.0, 4.0, 4.0), 1.0);
        canvas.clear(Color::LIGHT_GRAY);
        assert!(canvas.commands().is_empty());
        assert_eq!(canvas.clear_color(), Color::LIGHT_GRAY);
    }

    #[test]
    fn draw_opacity_is_clamped() {
        let mut canvas = Canvas::new(64, 64);
        canvas.draw_image(&test_image(4, 4), Rect::from_xywh(0.0, 0.0, 4.0, 4.0), 2.5);
        let DrawCmd::Image { opacity, .. } = &canvas.commands()[0] else {
            panic!("expected image command");
        };
        assert_eq!(*opacity, 1.0);
    }

    #[test]
    fn commands_preserve_insertion_order() {
        let mut canvas = Canvas::new(64, 64);
        let first = test_image(4, 4);
        let second = test_image(4, 4);
        canvas.draw_image(&first, Rect::from_xywh(0.0, 0.0, 4.0, 4.0), 0.25);
        canvas.draw_image(&second, Rect::from_xywh(0.0, 0.0, 4.0, 4.0), 0.75);
        let ids: Vec<u64> = canvas
            .commands()
            .iter()
            .map(|cmd| match cmd {
                DrawCmd::Image { image, .. } => image.id(),
                DrawCmd::FillRect { .. } => panic!("unexpected rect"),
            })
            .collect();
        assert_eq!(ids, vec![first.id(), second.id()]);
    }

    #[test]
    fn to_clip_maps_corners() {
        assert_eq!(to_clip(0.0, 0.0, 100, 50), [-1.0, 1.0]);
        assert_eq!(to_clip(100.0, 50.0, 100, 50), [1.0, -1.0]);
    }

    #[test]
    fn unrotated_quad_covers_rect() {
        let quad = quad_for_rect(100, 100, Rect::from_xywh(0.0, 0.0, 100.0, 100.0), 0.0);
        assert_eq!(quad[0].position, [-1.0, 1.0]);
        assert_eq!(quad[5].position, [1.0, -1.0]);
    }

    #[test]
    fn align_to_rounds_up_to_alignment() {
        assert_eq!(align_to(256, 256), 256);
        assert_eq!(align_to(257, 256), 512);
        assert_eq!(align_to(1, 256), 256);
    }
}
