use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use anyhow::Result;
use log::{error, info, warn};

use crate::canvas::Color;
use crate::codec::FfmpegMode;
use crate::drawable::Drawable;
use crate::encoder::{EncodeOutcome, EncoderConfig, ExportEncoder};
use crate::preview::build_image_sequence_timeline;
use crate::renderer::CompositeRenderer;

const DEFAULT_PREVIEW_WIDTH: u32 = 960;
const DEFAULT_PREVIEW_HEIGHT: u32 = 540;

/// Export status shared between the control thread and the export worker.
/// `progress` stores an `f64` as bits; it only ever moves forward during a
/// run and collapses back to 0.0 when a run ends without a file.
struct ExportShared {
    encoding: AtomicBool,
    cancel: AtomicBool,
    progress: AtomicU64,
    last_output: Mutex<Option<PathBuf>>,
}

impl ExportShared {
    fn set_progress(&self, value: f64) {
        self.progress.store(value.to_bits(), Ordering::Release);
    }

    fn progress(&self) -> f64 {
        f64::from_bits(self.progress.load(Ordering::Acquire))
    }

    fn set_last_output(&self, path: Option<PathBuf>) {
        *self
            .last_output
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = path;
    }

    /// Reset per-run status at publish time. The previous run's output path
    /// is cleared so status queries never mix two runs.
    fn begin_run(&self) {
        self.cancel.store(false, Ordering::Release);
        self.set_progress(0.0);
        self.set_last_output(None);
    }
}

/// Application facade tying the preview renderer and the offline exporter to
/// one timeline. One instance per application; surface lifecycle calls are
/// idempotent, exports run on their own worker thread, and at most one
/// export is in flight at a time.
pub struct Engine {
    renderer: Arc<CompositeRenderer>,
    surface_ready: Mutex<bool>,
    ffmpeg_mode: FfmpegMode,
    export: Arc<ExportShared>,
    export_worker: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    pub fn new() -> Self {
        Self::with_ffmpeg_mode(FfmpegMode::default())
    }

    pub fn with_ffmpeg_mode(ffmpeg_mode: FfmpegMode) -> Self {
        Self {
            renderer: CompositeRenderer::new(DEFAULT_PREVIEW_WIDTH, DEFAULT_PREVIEW_HEIGHT),
            surface_ready: Mutex::new(false),
            ffmpeg_mode,
            export: Arc::new(ExportShared {
                encoding: AtomicBool::new(false),
                cancel: AtomicBool::new(false),
                progress: AtomicU64::new(0.0_f64.to_bits()),
                last_output: Mutex::new(None),
            }),
            export_worker: Mutex::new(None),
        }
    }

    /// Attach a window surface and start the preview render thread. Calling
    /// again while a surface is attached is a no-op.
    pub fn init_surface(&self, target: impl Into<wgpu::SurfaceTarget<'static>>) -> Result<()> {
        let mut ready = self.lock_surface();
        if *ready {
            return Ok(());
        }
        // Idle scene shown until a timeline is installed.
        self.renderer.clear_drawables();
        self.renderer
            .add_drawable(Drawable::rotating_rect(100.0, 100.0, 120.0, Color::RED));
        self.renderer.start(target.into())?;
        *ready = true;
        Ok(())
    }

    /// Propagate a window resize to the preview. Ignored without a surface.
    pub fn change_surface(&self, width: u32, height: u32) {
        let ready = self.lock_surface();
        if *ready {
            self.renderer.resize(width, height);
        }
    }

    /// Tear the preview down. Idempotent; the timeline and any running
    /// export are unaffected.
    pub fn destroy_surface(&self) {
        let mut ready = self.lock_surface();
        if !*ready {
            return;
        }
        self.renderer.clear_drawables();
        self.renderer.stop();
        *ready = false;
    }

    /// Build a cross-fading slideshow from image files, laid out for the
    /// current preview size, and install it as the active timeline.
    pub fn set_image_sequence(
        &self,
        paths: &[PathBuf],
        clip_duration_sec: f64,
        crossfade_sec: f64,
    ) -> Result<()> {
        let timeline = build_image_sequence_timeline(
            paths,
            self.renderer.surface_width(),
            self.renderer.surface_height(),
            clip_duration_sec,
            crossfade_sec,
        )?;
        info!(
            "timeline installed: {} file(s), {:.2}s total",
            paths.len(),
            timeline.total_duration()
        );
        self.renderer.set_timeline(timeline);
        Ok(())
    }

    pub fn timeline_duration(&self) -> f64 {
        self.renderer.timeline_duration()
    }

    pub fn preview_play(&self) {
        self.renderer.preview_play();
    }

    pub fn preview_pause(&self) {
        self.renderer.preview_pause();
    }

    pub fn preview_stop(&self) {
        self.renderer.preview_stop();
    }

    pub fn is_previewing(&self) -> bool {
        self.renderer.is_playing()
    }

    /// Kick off an export of the current timeline on a worker thread.
    /// Fire-and-forget: failures are logged and surfaced through
    /// `is_encoding`/`encoding_progress`. A request while an export is in
    /// flight is rejected.
    pub fn start_encoding(&self, config: EncoderConfig) {
        if self.export.encoding.load(Ordering::Acquire) {
            warn!("export already in flight, ignoring request");
            return;
        }
        self.join_export_worker();

        let Some(timeline) = self.renderer.timeline_snapshot() else {
            error!("no timeline to export");
            return;
        };

        let output = config.output_path.clone();
        let mut encoder = ExportEncoder::new(config);
        encoder.set_ffmpeg_mode(self.ffmpeg_mode);
        encoder.set_timeline(timeline);
        if let Err(prepare_error) = encoder.prepare() {
            error!("export prepare failed: {prepare_error:#}");
            encoder.release();
            return;
        }

        // The in-flight flag is published only after a successful prepare.
        if self.export.encoding.swap(true, Ordering::AcqRel) {
            warn!("export already in flight, ignoring request");
            encoder.release();
            return;
        }
        self.export.begin_run();

        let shared = Arc::clone(&self.export);
        let worker = std::thread::Builder::new()
            .name("fadereel-export".into())
            .spawn(move || {
                let progress = Arc::clone(&shared);
                let outcome =
                    encoder.encode_blocking(&shared.cancel, |value| progress.set_progress(value));
                encoder.release();

                match outcome {
                    Ok(EncodeOutcome::Completed) => {
                        shared.set_progress(1.0);
                        shared.set_last_output(Some(output.clone()));
                        info!("export finished: {}", output.display());
                    }
                    Ok(EncodeOutcome::Cancelled) => {
                        shared.set_progress(0.0);
                        info!("export cancelled");
                    }
                    Err(encode_error) => {
                        shared.set_progress(0.0);
                        error!("export failed: {encode_error:#}");
                    }
                }
                shared.encoding.store(false, Ordering::Release);
            });

        match worker {
            Ok(handle) => {
                *self
                    .export_worker
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle);
            }
            Err(spawn_error) => {
                error!("failed spawning export worker: {spawn_error}");
                self.export.encoding.store(false, Ordering::Release);
            }
        }
    }

    /// Request cancellation of the running export and wait for it to wind
    /// down. No-op when idle.
    pub fn cancel_encoding(&self) {
        if !self.export.encoding.load(Ordering::Acquire) {
            return;
        }
        self.export.cancel.store(true, Ordering::Release);
        self.join_export_worker();
        self.export.cancel.store(false, Ordering::Release);
    }

    pub fn is_encoding(&self) -> bool {
        self.export.encoding.load(Ordering::Acquire)
    }

    /// Progress of the current run in `[0, 1]`. Holds 1.0 after a completed
    /// run, 0.0 after a cancelled or failed one.
    pub fn encoding_progress(&self) -> f64 {
        self.export.progress()
    }

    /// Output path of the most recent completed export, if any.
    pub fn last_output_path(&self) -> Option<PathBuf> {
        self.export
            .last_output
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn join_export_worker(&self) {
        let handle = self
            .export_worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("export worker panicked");
            }
        }
    }

    fn lock_surface(&self) -> MutexGuard<'_, bool> {
        self.surface_ready
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.cancel_encoding();
        self.join_export_worker();
        self.renderer.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::Engine;
    use crate::encoder::EncoderConfig;
    use image::RgbaImage;
    use std::path::PathBuf;
    use std::sync::atomic::Ordering;

    #[test]
    fn fresh_engine_is_idle() {
        let engine = Engine::new();
        assert!(!engine.is_encoding());
        assert_eq!(engine.encoding_progress(), 0.0);
        assert_eq!(engine.timeline_duration(), 0.0);
        assert!(engine.last_output_path().is_none());
    }

    #[test]
    fn surface_teardown_without_init_is_safe() {
        let engine = Engine::new();
        engine.destroy_surface();
        engine.destroy_surface();
        engine.change_surface(800, 600);
    }

    #[test]
    fn export_without_timeline_is_rejected() {
        let engine = Engine::new();
        engine.start_encoding(EncoderConfig::default());
        assert!(!engine.is_encoding());
        assert_eq!(engine.encoding_progress(), 0.0);
    }

    #[test]
    fn cancel_when_idle_is_a_no_op() {
        let engine = Engine::new();
        engine.cancel_encoding();
        assert!(!engine.is_encoding());
    }

    #[test]
    fn publishing_a_run_clears_the_previous_output_record() {
        let engine = Engine::new();
        engine.export.set_progress(1.0);
        engine
            .export
            .set_last_output(Some(PathBuf::from("first.mp4")));

        engine.export.begin_run();
        assert_eq!(engine.encoding_progress(), 0.0);
        assert!(engine.last_output_path().is_none());
    }

    #[test]
    fn second_start_is_rejected_and_leaves_the_first_run_untouched() {
        let engine = Engine::new();
        // A run in flight: mid-run progress, no recorded output yet.
        engine.export.encoding.store(true, Ordering::Release);
        engine.export.set_progress(0.42);
        engine
            .export
            .set_last_output(Some(PathBuf::from("earlier.mp4")));

        engine.start_encoding(EncoderConfig {
            output_path: PathBuf::from("second.mp4"),
            ..EncoderConfig::default()
        });

        assert!(engine.is_encoding());
        assert_eq!(engine.encoding_progress(), 0.42);
        assert_eq!(
            engine.last_output_path(),
            Some(PathBuf::from("earlier.mp4"))
        );
        assert!(engine
            .export_worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_none());
    }

    #[test]
    fn image_sequence_drives_timeline_duration() {
        let dir = tempfile::tempdir().unwrap();
        let mut paths = Vec::new();
        for name in ["a.png", "b.png", "c.png"] {
            let path = dir.path().join(name);
            RgbaImage::new(4, 4).save(&path).unwrap();
            paths.push(path);
        }

        let engine = Engine::new();
        engine.set_image_sequence(&paths, 2.0, 0.5).unwrap();
        assert_eq!(engine.timeline_duration(), 5.0);
    }

    #[test]
    fn image_sequence_with_no_loadable_files_errors() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new();
        let missing = dir.path().join("missing.png");
        assert!(engine.set_image_sequence(&[missing], 2.0, 0.5).is_err());
        assert_eq!(engine.timeline_duration(), 0.0);
    }
}
