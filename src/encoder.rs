use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use log::{debug, info, warn};

use crate::canvas::{Canvas, CanvasSurface};
use crate::codec::{
    EncoderBackend, EncoderPoll, FfmpegMode, FfmpegMuxer, FfmpegVideoEncoder, MuxerBackend,
    StreamFormat, TrackId, OUTPUT_POLL_TIMEOUT,
};
use crate::context::GraphicsContext;
use crate::timeline::{RenderRequest, Timeline};

/// Export parameters. Defaults to 720p30 AVC at 4 Mbps with a keyframe every
/// two seconds.
#[derive(Debug, Clone)]
pub struct EncoderConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub bitrate_bps: u32,
    pub i_frame_interval_sec: u32,
    pub mime: String,
    pub output_path: PathBuf,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            fps: 30,
            bitrate_bps: 4_000_000,
            i_frame_interval_sec: 2,
            mime: "video/avc".to_string(),
            output_path: PathBuf::new(),
        }
    }
}

/// How an export run ended. Failures are reported through `Result` instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeOutcome {
    Completed,
    Cancelled,
}

/// The deterministic frame grid for an export: frame `i` samples the timeline
/// at `min(duration, i / fps)`. Always yields at least one frame so a
/// zero-length timeline still produces a valid single-frame video.
pub(crate) struct FrameSchedule {
    duration_sec: f64,
    frame_duration_sec: f64,
    total_frames: u64,
    next: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct FramePoint {
    pub time_sec: f64,
    pub pts_ns: i64,
    pub progress: f64,
}

impl FrameSchedule {
    pub(crate) fn new(duration_sec: f64, fps: u32) -> Self {
        let fps = fps.max(1);
        let duration_sec = duration_sec.max(0.0);
        let total_frames = ((duration_sec * f64::from(fps)).ceil() as u64).max(1);
        Self {
            duration_sec,
            frame_duration_sec: 1.0 / f64::from(fps),
            total_frames,
            next: 0,
        }
    }

    pub(crate) fn total_frames(&self) -> u64 {
        self.total_frames
    }
}

impl Iterator for FrameSchedule {
    type Item = FramePoint;

    fn next(&mut self) -> Option<FramePoint> {
        if self.next >= self.total_frames {
            return None;
        }
        let index = self.next;
        self.next += 1;

        let time_sec = (index as f64 * self.frame_duration_sec).min(self.duration_sec);
        Some(FramePoint {
            time_sec,
            pts_ns: (time_sec * 1e9).round() as i64,
            progress: (index + 1) as f64 / self.total_frames as f64,
        })
    }
}

#[derive(Default)]
struct MuxState {
    track: Option<TrackId>,
    started: bool,
}

/// Pump encoder output into the muxer.
///
/// With `end_of_stream` false this is a non-blocking sweep: it stops at the
/// first empty poll. With `end_of_stream` true it keeps polling until the
/// encoder delivers its end-of-stream sample. The muxer track is registered
/// and the muxer started exactly once, on the format-changed event; samples
/// arriving before that are released unwritten.
fn drain_encoder(
    encoder: &mut dyn EncoderBackend,
    muxer: &mut dyn MuxerBackend,
    mux: &mut MuxState,
    end_of_stream: bool,
) -> Result<()> {
    loop {
        match encoder.dequeue_output(OUTPUT_POLL_TIMEOUT)? {
            EncoderPoll::TryAgainLater => {
                if end_of_stream {
                    continue;
                }
                return Ok(());
            }
            EncoderPoll::FormatChanged(format) => {
                if mux.started {
                    bail!("encoder reported its output format twice");
                }
                let track = muxer
                    .add_track(&format)
                    .context("failed registering output track")?;
                muxer.start().context("failed starting muxer")?;
                mux.track = Some(track);
                mux.started = true;
                debug!("muxer started for {}x{} {}", format.width, format.height, format.mime);
            }
            EncoderPoll::Sample(sample) => {
                if !sample.data.is_empty() {
                    match (mux.started, mux.track) {
                        (true, Some(track)) => {
                            muxer
                                .write_sample(track, &sample)
                                .context("failed writing sample")?;
                        }
                        _ => warn!(
                            "dropping {}-byte sample produced before the muxer started",
                            sample.data.len()
                        ),
                    }
                }
                if sample.end_of_stream {
                    return Ok(());
                }
            }
        }
    }
}

/// Close out the stream after the frame loop: signal end of input and drain
/// to the end-of-stream sample. A completed run additionally verifies that
/// both backends finalized cleanly before completion is reported; a
/// cancelled run skips that check and reports `Cancelled`.
fn finish_export(
    encoder: &mut dyn EncoderBackend,
    muxer: &mut dyn MuxerBackend,
    mux: &mut MuxState,
    cancelled: bool,
) -> Result<EncodeOutcome> {
    encoder
        .signal_end_of_input()
        .context("failed signalling end of input")?;
    drain_encoder(encoder, muxer, mux, true)?;

    if cancelled {
        return Ok(EncodeOutcome::Cancelled);
    }
    encoder.finish().context("encoder finalization failed")?;
    muxer.finish().context("muxer finalization failed")?;
    Ok(EncodeOutcome::Completed)
}

/// Offline exporter: renders a timeline frame by frame through its own
/// headless GPU context and pushes the frames through an encoder and muxer.
///
/// Lifecycle is `set_timeline`, `prepare`, `encode_blocking`, `release`, in
/// that order. `release` is safe after any failure, including a partial
/// `prepare`.
pub struct ExportEncoder {
    config: EncoderConfig,
    ffmpeg_mode: FfmpegMode,
    timeline: Option<Arc<Timeline>>,
    duration_sec: f64,
    encoder: Option<Box<dyn EncoderBackend>>,
    muxer: Option<Box<dyn MuxerBackend>>,
    context: Option<GraphicsContext>,
    surface: Option<CanvasSurface>,
    mux: MuxState,
}

impl ExportEncoder {
    pub fn new(config: EncoderConfig) -> Self {
        Self {
            config,
            ffmpeg_mode: FfmpegMode::default(),
            timeline: None,
            duration_sec: 0.0,
            encoder: None,
            muxer: None,
            context: None,
            surface: None,
            mux: MuxState::default(),
        }
    }

    pub fn set_ffmpeg_mode(&mut self, mode: FfmpegMode) {
        self.ffmpeg_mode = mode;
    }

    /// Snapshot the timeline to export. The encoder holds the snapshot until
    /// it is replaced; later edits to the source timeline do not affect a
    /// running export.
    pub fn set_timeline(&mut self, timeline: Arc<Timeline>) {
        self.duration_sec = timeline.total_duration();
        self.timeline = Some(timeline);
    }

    pub fn output_path(&self) -> &Path {
        &self.config.output_path
    }

    /// Acquire every resource the export needs, failing fast on the first
    /// step that cannot be satisfied. Order: encoder, muxer, encoder start,
    /// GPU context, render target.
    pub fn prepare(&mut self) -> Result<()> {
        if self.timeline.is_none() {
            bail!("no timeline set");
        }
        if self.encoder.is_some() {
            bail!("already prepared");
        }

        let format = StreamFormat {
            mime: self.config.mime.clone(),
            width: self.config.width,
            height: self.config.height,
            fps: self.config.fps.max(1),
        };

        let encoder = FfmpegVideoEncoder::new(
            format,
            self.config.bitrate_bps,
            self.config.i_frame_interval_sec,
            self.ffmpeg_mode,
        )
        .context("failed creating video encoder")?;
        self.encoder = Some(Box::new(encoder));

        let muxer = FfmpegMuxer::new(
            self.config.output_path.clone(),
            &self.config.mime,
            self.ffmpeg_mode,
        )
        .context("failed creating muxer")?;
        self.muxer = Some(Box::new(muxer));

        if let Some(encoder) = self.encoder.as_mut() {
            encoder.start().context("failed starting encoder")?;
        }

        let context = GraphicsContext::headless().context("failed creating GPU context")?;
        let surface = CanvasSurface::new(&context, self.config.width, self.config.height)
            .context("failed creating render target")?;
        self.context = Some(context);
        self.surface = Some(surface);
        Ok(())
    }

    /// Run the export to completion on the calling thread, rebinding the GPU
    /// context to it first. `cancel` is observed between frames; a cancelled
    /// run still signals end of input and drains the encoder so teardown is
    /// orderly, and reports `Cancelled` instead of an error. `on_progress`
    /// sees values in `(0, 1]`, monotonically non-decreasing.
    pub fn encode_blocking(
        &mut self,
        cancel: &AtomicBool,
        mut on_progress: impl FnMut(f64),
    ) -> Result<EncodeOutcome> {
        let timeline = self
            .timeline
            .clone()
            .ok_or_else(|| anyhow::anyhow!("no timeline set"))?;
        let Some(context) = self.context.as_mut() else {
            bail!("not prepared");
        };
        let (Some(surface), Some(encoder), Some(muxer)) = (
            self.surface.as_mut(),
            self.encoder.as_mut(),
            self.muxer.as_mut(),
        ) else {
            bail!("not prepared");
        };

        context.bind();
        let context = &*context;

        let schedule = FrameSchedule::new(self.duration_sec, self.config.fps);
        let total_frames = schedule.total_frames();
        info!(
            "exporting {:.2}s ({} frames at {} fps) to {}",
            self.duration_sec,
            total_frames,
            self.config.fps.max(1),
            self.config.output_path.display()
        );

        let mut canvas = Canvas::new(self.config.width, self.config.height);
        let mut cancelled = false;

        for frame in schedule {
            if cancel.load(Ordering::Acquire) {
                cancelled = true;
                break;
            }

            canvas.reset();
            timeline.render(RenderRequest {
                canvas: &mut canvas,
                width: self.config.width,
                height: self.config.height,
                time_sec: frame.time_sec,
            });
            surface.flush(context, &canvas)?;
            let rgba = surface.read_pixels(context)?;

            encoder.queue_frame(&rgba, frame.pts_ns)?;
            drain_encoder(encoder.as_mut(), muxer.as_mut(), &mut self.mux, false)?;
            on_progress(frame.progress);
        }

        let outcome = finish_export(encoder.as_mut(), muxer.as_mut(), &mut self.mux, cancelled)?;
        if outcome == EncodeOutcome::Cancelled {
            info!("export cancelled");
        }
        Ok(outcome)
    }

    /// Tear down in reverse acquisition order. Idempotent; safe after errors
    /// and after a partial `prepare`.
    pub fn release(&mut self) {
        self.surface.take();
        self.context.take();
        if let Some(mut encoder) = self.encoder.take() {
            encoder.stop();
        }
        if let Some(mut muxer) = self.muxer.take() {
            muxer.stop();
        }
        self.mux = MuxState::default();
    }
}

impl Drop for ExportEncoder {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::{drain_encoder, finish_export, EncodeOutcome, EncoderConfig, FrameSchedule, MuxState};
    use crate::codec::{
        EncodedSample, EncoderBackend, EncoderPoll, MuxerBackend, StreamFormat, TrackId,
    };
    use anyhow::{bail, Result};
    use std::collections::VecDeque;
    use std::time::Duration;

    #[test]
    fn default_config_matches_720p30_avc() {
        let config = EncoderConfig::default();
        assert_eq!((config.width, config.height), (1280, 720));
        assert_eq!(config.fps, 30);
        assert_eq!(config.bitrate_bps, 4_000_000);
        assert_eq!(config.i_frame_interval_sec, 2);
        assert_eq!(config.mime, "video/avc");
    }

    #[test]
    fn schedule_covers_duration_with_ceil() {
        let schedule = FrameSchedule::new(5.0, 30);
        assert_eq!(schedule.total_frames(), 150);
        let schedule = FrameSchedule::new(5.01, 30);
        assert_eq!(schedule.total_frames(), 151);
    }

    #[test]
    fn schedule_always_yields_at_least_one_frame() {
        let frames: Vec<_> = FrameSchedule::new(0.0, 30).collect();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].time_sec, 0.0);
        assert_eq!(frames[0].pts_ns, 0);
        assert_eq!(frames[0].progress, 1.0);
    }

    #[test]
    fn schedule_tolerates_zero_fps() {
        let frames: Vec<_> = FrameSchedule::new(2.5, 0).collect();
        assert_eq!(frames.len(), 3);
    }

    #[test]
    fn schedule_timestamps_are_strictly_increasing_and_clamped() {
        let frames: Vec<_> = FrameSchedule::new(5.0, 30).collect();
        for pair in frames.windows(2) {
            assert!(pair[1].pts_ns > pair[0].pts_ns);
        }
        for frame in &frames {
            assert!(frame.time_sec <= 5.0);
        }
        assert_eq!(frames.last().unwrap().progress, 1.0);
    }

    #[test]
    fn schedule_progress_is_monotone_in_unit_interval() {
        let frames: Vec<_> = FrameSchedule::new(1.0, 24).collect();
        let mut last = 0.0;
        for frame in &frames {
            assert!(frame.progress > last);
            assert!(frame.progress <= 1.0);
            last = frame.progress;
        }
    }

    struct ScriptedEncoder {
        events: VecDeque<EncoderPoll>,
        finish_fails: bool,
        finished: bool,
    }

    impl ScriptedEncoder {
        fn new(events: Vec<EncoderPoll>) -> Self {
            Self {
                events: events.into(),
                finish_fails: false,
                finished: false,
            }
        }

        fn with_failing_finish(events: Vec<EncoderPoll>) -> Self {
            Self {
                finish_fails: true,
                ..Self::new(events)
            }
        }
    }

    impl EncoderBackend for ScriptedEncoder {
        fn start(&mut self) -> Result<()> {
            Ok(())
        }
        fn queue_frame(&mut self, _rgba: &[u8], _pts_ns: i64) -> Result<()> {
            Ok(())
        }
        fn signal_end_of_input(&mut self) -> Result<()> {
            Ok(())
        }
        fn dequeue_output(&mut self, _timeout: Duration) -> Result<EncoderPoll> {
            Ok(self.events.pop_front().unwrap_or_else(|| {
                EncoderPoll::Sample(EncodedSample {
                    data: Vec::new(),
                    end_of_stream: true,
                })
            }))
        }
        fn finish(&mut self) -> Result<()> {
            self.finished = true;
            if self.finish_fails {
                bail!("exited with exit status: 1");
            }
            Ok(())
        }
        fn stop(&mut self) {}
    }

    #[derive(Default)]
    struct RecordingMuxer {
        tracks: usize,
        started: bool,
        finished: bool,
        samples: Vec<Vec<u8>>,
    }

    impl MuxerBackend for RecordingMuxer {
        fn add_track(&mut self, _format: &StreamFormat) -> Result<TrackId> {
            self.tracks += 1;
            Ok(TrackId(0))
        }
        fn start(&mut self) -> Result<()> {
            self.started = true;
            Ok(())
        }
        fn write_sample(&mut self, _track: TrackId, sample: &EncodedSample) -> Result<()> {
            if !self.started {
                bail!("write before start");
            }
            self.samples.push(sample.data.clone());
            Ok(())
        }
        fn finish(&mut self) -> Result<()> {
            self.finished = true;
            Ok(())
        }
        fn stop(&mut self) {}
    }

    fn format() -> StreamFormat {
        StreamFormat {
            mime: "video/avc".into(),
            width: 64,
            height: 64,
            fps: 30,
        }
    }

    fn sample(data: &[u8]) -> EncoderPoll {
        EncoderPoll::Sample(EncodedSample {
            data: data.to_vec(),
            end_of_stream: false,
        })
    }

    fn eos() -> EncoderPoll {
        EncoderPoll::Sample(EncodedSample {
            data: Vec::new(),
            end_of_stream: true,
        })
    }

    #[test]
    fn drain_starts_muxer_once_on_format_change() {
        let mut encoder = ScriptedEncoder::new(vec![
            EncoderPoll::FormatChanged(format()),
            sample(b"one"),
            sample(b"two"),
            eos(),
        ]);
        let mut muxer = RecordingMuxer::default();
        let mut mux = MuxState::default();

        drain_encoder(&mut encoder, &mut muxer, &mut mux, true).unwrap();
        assert_eq!(muxer.tracks, 1);
        assert!(muxer.started);
        assert_eq!(muxer.samples, vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[test]
    fn drain_releases_samples_arriving_before_format() {
        let mut encoder = ScriptedEncoder::new(vec![
            sample(b"early"),
            EncoderPoll::FormatChanged(format()),
            sample(b"late"),
            eos(),
        ]);
        let mut muxer = RecordingMuxer::default();
        let mut mux = MuxState::default();

        drain_encoder(&mut encoder, &mut muxer, &mut mux, true).unwrap();
        assert_eq!(muxer.samples, vec![b"late".to_vec()]);
    }

    #[test]
    fn per_frame_drain_stops_at_first_empty_poll() {
        let mut encoder = ScriptedEncoder::new(vec![
            EncoderPoll::FormatChanged(format()),
            sample(b"ready"),
            EncoderPoll::TryAgainLater,
            sample(b"left behind"),
        ]);
        let mut muxer = RecordingMuxer::default();
        let mut mux = MuxState::default();

        drain_encoder(&mut encoder, &mut muxer, &mut mux, false).unwrap();
        assert_eq!(muxer.samples, vec![b"ready".to_vec()]);
        assert_eq!(encoder.events.len(), 1);
    }

    #[test]
    fn final_drain_polls_through_empty_results() {
        let mut encoder = ScriptedEncoder::new(vec![
            EncoderPoll::FormatChanged(format()),
            EncoderPoll::TryAgainLater,
            EncoderPoll::TryAgainLater,
            sample(b"tail"),
            eos(),
        ]);
        let mut muxer = RecordingMuxer::default();
        let mut mux = MuxState::default();

        drain_encoder(&mut encoder, &mut muxer, &mut mux, true).unwrap();
        assert_eq!(muxer.samples, vec![b"tail".to_vec()]);
    }

    #[test]
    fn duplicate_format_report_is_an_error() {
        let mut encoder = ScriptedEncoder::new(vec![
            EncoderPoll::FormatChanged(format()),
            EncoderPoll::FormatChanged(format()),
        ]);
        let mut muxer = RecordingMuxer::default();
        let mut mux = MuxState::default();

        assert!(drain_encoder(&mut encoder, &mut muxer, &mut mux, true).is_err());
    }

    #[test]
    fn completed_run_finalizes_both_backends() {
        let mut encoder = ScriptedEncoder::new(vec![
            EncoderPoll::FormatChanged(format()),
            sample(b"tail"),
            eos(),
        ]);
        let mut muxer = RecordingMuxer::default();
        let mut mux = MuxState::default();

        let outcome = finish_export(&mut encoder, &mut muxer, &mut mux, false).unwrap();
        assert_eq!(outcome, EncodeOutcome::Completed);
        assert!(encoder.finished);
        assert!(muxer.finished);
    }

    #[test]
    fn failed_backend_finalization_is_not_reported_as_completed() {
        let mut encoder = ScriptedEncoder::with_failing_finish(vec![
            EncoderPoll::FormatChanged(format()),
            sample(b"tail"),
            eos(),
        ]);
        let mut muxer = RecordingMuxer::default();
        let mut mux = MuxState::default();

        let result = finish_export(&mut encoder, &mut muxer, &mut mux, false);
        assert!(result.is_err());
        // The encoder is checked first; the muxer is never certified.
        assert!(!muxer.finished);
        // The stream itself drained before finalization failed.
        assert_eq!(muxer.samples, vec![b"tail".to_vec()]);
    }

    #[test]
    fn cancelled_run_drains_but_skips_finalization() {
        let mut encoder = ScriptedEncoder::new(vec![
            EncoderPoll::FormatChanged(format()),
            sample(b"partial"),
            eos(),
        ]);
        let mut muxer = RecordingMuxer::default();
        let mut mux = MuxState::default();

        let outcome = finish_export(&mut encoder, &mut muxer, &mut mux, true).unwrap();
        assert_eq!(outcome, EncodeOutcome::Cancelled);
        assert!(!encoder.finished);
        assert!(!muxer.finished);
        assert_eq!(muxer.samples, vec![b"partial".to_vec()]);
    }

    #[test]
    fn mux_state_survives_across_drain_calls() {
        let mut muxer = RecordingMuxer::default();
        let mut mux = MuxState::default();

        let mut first = ScriptedEncoder::new(vec![
            EncoderPoll::FormatChanged(format()),
            sample(b"a"),
            EncoderPoll::TryAgainLater,
        ]);
        drain_encoder(&mut first, &mut muxer, &mut mux, false).unwrap();

        let mut second = ScriptedEncoder::new(vec![sample(b"b"), eos()]);
        drain_encoder(&mut second, &mut muxer, &mut mux, true).unwrap();

        assert_eq!(muxer.tracks, 1);
        assert_eq!(muxer.samples, vec![b"a".to_vec(), b"b".to_vec()]);
    }
}
