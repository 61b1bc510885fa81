use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use log::{error, info, warn};

use crate::canvas::{Canvas, CanvasSurface, Color};
use crate::context::GraphicsContext;
use crate::drawable::Drawable;
use crate::timeline::{RenderRequest, Timeline};

const FRAME_PACING: Duration = Duration::from_millis(16);

/// Playback cursor for the preview. Pausing keeps the cursor in place;
/// stopping rewinds it. Advancing past the timeline end clamps and reports
/// the end so the caller can auto-pause.
#[derive(Debug, Default)]
pub(crate) struct Transport {
    cursor_sec: f64,
    duration_sec: f64,
}

impl Transport {
    pub(crate) fn reset(&mut self, duration_sec: f64) {
        self.cursor_sec = 0.0;
        self.duration_sec = duration_sec;
    }

    pub(crate) fn rewind(&mut self) {
        self.cursor_sec = 0.0;
    }

    pub(crate) fn cursor_sec(&self) -> f64 {
        self.cursor_sec
    }

    /// Move the cursor forward. Returns true when the end was reached.
    pub(crate) fn advance(&mut self, dt_sec: f64) -> bool {
        self.cursor_sec += dt_sec;
        if self.cursor_sec >= self.duration_sec {
            self.cursor_sec = self.duration_sec;
            return true;
        }
        false
    }
}

#[derive(Default)]
struct PreviewState {
    timeline: Option<Arc<Timeline>>,
    transport: Transport,
}

/// Owns the preview render thread. Control-thread calls communicate through
/// atomics and short critical sections; the render thread owns the GPU
/// context exclusively and snapshots shared state each frame, so no lock is
/// held across GPU work.
pub struct CompositeRenderer {
    running: AtomicBool,
    playing: AtomicBool,
    width: AtomicU32,
    height: AtomicU32,
    resize_requested: AtomicBool,
    preview: Mutex<PreviewState>,
    drawables: Mutex<Vec<Drawable>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl CompositeRenderer {
    pub fn new(width: u32, height: u32) -> Arc<Self> {
        Arc::new(Self {
            running: AtomicBool::new(false),
            playing: AtomicBool::new(false),
            width: AtomicU32::new(width.max(1)),
            height: AtomicU32::new(height.max(1)),
            resize_requested: AtomicBool::new(false),
            preview: Mutex::new(PreviewState::default()),
            drawables: Mutex::new(Vec::new()),
            thread: Mutex::new(None),
        })
    }

    /// Spawn the render thread against a window surface. The surface is
    /// created here, on the control thread; the GPU context it feeds is
    /// created and bound on the render thread. Idempotent while running.
    pub fn start(self: &Arc<Self>, target: wgpu::SurfaceTarget<'static>) -> Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor::default());
        let surface = match instance.create_surface(target) {
            Ok(surface) => surface,
            Err(error) => {
                self.running.store(false, Ordering::Release);
                return Err(error).context("failed creating window surface");
            }
        };

        let renderer = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("fadereel-preview".into())
            .spawn(move || renderer.render_loop(instance, surface))
            .context("failed spawning preview render thread")?;
        *self.thread.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle);
        info!("preview render thread started");
        Ok(())
    }

    /// Stop the render thread and join it. Idempotent.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        self.playing.store(false, Ordering::Release);
        let handle = self
            .thread
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("preview render thread panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Request a surface resize. Applied by the render thread at the top of
    /// its next frame.
    pub fn resize(&self, width: u32, height: u32) {
        self.width.store(width.max(1), Ordering::Release);
        self.height.store(height.max(1), Ordering::Release);
        self.resize_requested.store(true, Ordering::Release);
    }

    pub fn surface_width(&self) -> u32 {
        self.width.load(Ordering::Acquire)
    }

    pub fn surface_height(&self) -> u32 {
        self.height.load(Ordering::Acquire)
    }

    /// Install a timeline and rewind the cursor. Replaces any previous
    /// timeline.
    pub fn set_timeline(&self, timeline: Arc<Timeline>) {
        let mut preview = self.lock_preview();
        preview.transport.reset(timeline.total_duration());
        preview.timeline = Some(timeline);
    }

    pub fn timeline_snapshot(&self) -> Option<Arc<Timeline>> {
        self.lock_preview().timeline.clone()
    }

    pub fn timeline_duration(&self) -> f64 {
        self.lock_preview()
            .timeline
            .as_ref()
            .map(|timeline| timeline.total_duration())
            .unwrap_or(0.0)
    }

    /// Start playback from the current cursor. No-op without a timeline.
    pub fn preview_play(&self) {
        if self.lock_preview().timeline.is_some() {
            self.playing.store(true, Ordering::Release);
        }
    }

    /// Freeze playback, keeping the cursor.
    pub fn preview_pause(&self) {
        self.playing.store(false, Ordering::Release);
    }

    /// Freeze playback and rewind the cursor to the beginning.
    pub fn preview_stop(&self) {
        self.playing.store(false, Ordering::Release);
        self.lock_preview().transport.rewind();
    }

    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::Acquire)
    }

    pub fn add_drawable(&self, drawable: Drawable) {
        self.lock_drawables().push(drawable);
    }

    pub fn clear_drawables(&self) {
        self.lock_drawables().clear();
    }

    /// Record a failed frame without touching the running flag.
    fn note_frame_error(&self, stage: &str, error: &anyhow::Error) {
        error!("preview {stage} failed, skipping frame: {error:#}");
    }

    fn lock_preview(&self) -> std::sync::MutexGuard<'_, PreviewState> {
        self.preview
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_drawables(&self) -> std::sync::MutexGuard<'_, Vec<Drawable>> {
        self.drawables
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn render_loop(&self, instance: wgpu::Instance, surface: wgpu::Surface<'static>) {
        let mut width = self.surface_width();
        let mut height = self.surface_height();

        let mut context = match GraphicsContext::for_surface(instance, surface, width, height) {
            Ok(context) => context,
            Err(error) => {
                error!("preview GPU init failed: {error:#}");
                self.running.store(false, Ordering::Release);
                return;
            }
        };
        let mut target = match CanvasSurface::new(&context, width, height) {
            Ok(target) => target,
            Err(error) => {
                error!("preview render target init failed: {error:#}");
                self.running.store(false, Ordering::Release);
                return;
            }
        };
        let mut canvas = Canvas::new(width, height);
        let mut previous = Instant::now();

        while self.running.load(Ordering::Acquire) {
            if self.resize_requested.swap(false, Ordering::AcqRel) {
                width = self.surface_width();
                height = self.surface_height();
                context.configure_surface(width, height);
                match CanvasSurface::new(&context, width, height) {
                    Ok(rebuilt) => {
                        target = rebuilt;
                        canvas = Canvas::new(width, height);
                    }
                    Err(error) => {
                        warn!("render target rebuild failed, retrying: {error:#}");
                        self.resize_requested.store(true, Ordering::Release);
                        std::thread::sleep(FRAME_PACING);
                        continue;
                    }
                }
            }

            let now = Instant::now();
            let dt = now.duration_since(previous).as_secs_f64();
            previous = now;

            canvas.reset();
            let timeline = {
                let mut preview = self.lock_preview();
                if preview.timeline.is_some() && self.playing.load(Ordering::Acquire) {
                    if preview.transport.advance(dt) {
                        self.playing.store(false, Ordering::Release);
                    }
                }
                preview
                    .timeline
                    .clone()
                    .map(|timeline| (timeline, preview.transport.cursor_sec()))
            };

            match timeline {
                Some((timeline, cursor_sec)) => {
                    timeline.render(RenderRequest {
                        canvas: &mut canvas,
                        width,
                        height,
                        time_sec: cursor_sec,
                    });
                }
                None => {
                    // Idle scene. Drawables only record commands here; the
                    // GPU work happens after the lock is released.
                    canvas.clear(Color::LIGHT_GRAY);
                    let mut drawables = self.lock_drawables();
                    for drawable in drawables.iter_mut() {
                        drawable.update(dt as f32);
                        drawable.draw(&mut canvas);
                    }
                }
            }

            // Drawing errors degrade to a skipped frame; only the running
            // flag ends the loop.
            if let Err(error) = target.flush(&context, &canvas) {
                self.note_frame_error("draw", &error);
                std::thread::sleep(FRAME_PACING);
                continue;
            }
            if let Err(error) = context.present(&target) {
                self.note_frame_error("present", &error);
                std::thread::sleep(FRAME_PACING);
                continue;
            }

            std::thread::sleep(FRAME_PACING);
        }

        self.running.store(false, Ordering::Release);
        info!("preview render thread exited");
    }
}

impl Drop for CompositeRenderer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::{CompositeRenderer, Transport};
    use crate::canvas::{ImageResource, Rect};
    use crate::timeline::{Clip, Timeline};
    use image::RgbaImage;
    use std::sync::Arc;

    fn timeline(seconds: f64) -> Arc<Timeline> {
        Timeline::from_clips(
            vec![Clip {
                image: ImageResource::from_rgba(RgbaImage::new(2, 2)),
                dst: Rect::from_xywh(0.0, 0.0, 2.0, 2.0),
            }],
            seconds,
            0.0,
        )
        .unwrap()
    }

    #[test]
    fn transport_clamps_at_the_end() {
        let mut transport = Transport::default();
        transport.reset(5.0);
        assert!(!transport.advance(4.9));
        assert!(transport.advance(1.0));
        assert_eq!(transport.cursor_sec(), 5.0);
        // Further advances stay clamped.
        assert!(transport.advance(1.0));
        assert_eq!(transport.cursor_sec(), 5.0);
    }

    #[test]
    fn transport_rewind_keeps_duration() {
        let mut transport = Transport::default();
        transport.reset(3.0);
        transport.advance(2.0);
        transport.rewind();
        assert_eq!(transport.cursor_sec(), 0.0);
        assert!(!transport.advance(1.0));
        assert!(transport.advance(2.5));
    }

    #[test]
    fn play_without_timeline_is_a_no_op() {
        let renderer = CompositeRenderer::new(640, 360);
        renderer.preview_play();
        assert!(!renderer.is_playing());
    }

    #[test]
    fn pause_keeps_cursor_and_stop_rewinds() {
        let renderer = CompositeRenderer::new(640, 360);
        renderer.set_timeline(timeline(5.0));
        renderer.preview_play();
        assert!(renderer.is_playing());

        {
            let mut preview = renderer.lock_preview();
            preview.transport.advance(2.0);
        }
        renderer.preview_pause();
        assert_eq!(renderer.lock_preview().transport.cursor_sec(), 2.0);

        renderer.preview_stop();
        assert_eq!(renderer.lock_preview().transport.cursor_sec(), 0.0);
    }

    #[test]
    fn setting_a_timeline_rewinds_the_cursor() {
        let renderer = CompositeRenderer::new(640, 360);
        renderer.set_timeline(timeline(5.0));
        {
            let mut preview = renderer.lock_preview();
            preview.transport.advance(3.0);
        }
        renderer.set_timeline(timeline(2.0));
        assert_eq!(renderer.lock_preview().transport.cursor_sec(), 0.0);
        assert_eq!(renderer.timeline_duration(), 2.0);
    }

    #[test]
    fn resize_clamps_to_non_zero() {
        let renderer = CompositeRenderer::new(640, 360);
        renderer.resize(0, 0);
        assert_eq!(renderer.surface_width(), 1);
        assert_eq!(renderer.surface_height(), 1);
    }

    #[test]
    fn frame_errors_do_not_clear_the_running_flag() {
        use std::sync::atomic::Ordering;

        let renderer = CompositeRenderer::new(640, 360);
        renderer.running.store(true, Ordering::Release);
        renderer.note_frame_error("draw", &anyhow::anyhow!("device lost"));
        renderer.note_frame_error("present", &anyhow::anyhow!("surface gone"));
        assert!(renderer.is_running());
        renderer.running.store(false, Ordering::Release);
    }

    #[test]
    fn stop_without_start_is_safe() {
        let renderer = CompositeRenderer::new(640, 360);
        renderer.stop();
        renderer.stop();
        assert!(!renderer.is_running());
    }
}
