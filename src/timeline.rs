use std::sync::Arc;

use anyhow::{bail, Result};

use crate::canvas::{Canvas, Color, ImageResource, Rect};

/// One clip on the timeline: an image, where it lands on the canvas, and when
/// it plays. `crossfade_sec` is the overlap shared with the following segment.
#[derive(Clone)]
pub struct Segment {
    pub image: Arc<ImageResource>,
    pub dst: Rect,
    pub start_sec: f64,
    pub duration_sec: f64,
    pub crossfade_sec: f64,
}

impl Segment {
    fn end_sec(&self) -> f64 {
        self.start_sec + self.duration_sec
    }

    fn contains(&self, time_sec: f64) -> bool {
        time_sec >= self.start_sec && time_sec < self.end_sec()
    }
}

/// Input to the uniform-clip builder.
pub struct Clip {
    pub image: Arc<ImageResource>,
    pub dst: Rect,
}

/// Evaluation request for one output frame.
pub struct RenderRequest<'a> {
    pub canvas: &'a mut Canvas,
    pub width: u32,
    pub height: u32,
    pub time_sec: f64,
}

/// An immutable sequence of cross-fading segments. Shared by the live preview
/// and the offline encoder; rendering is a pure function of the timestamp, so
/// both paths produce identical frames.
pub struct Timeline {
    segments: Vec<Segment>,
    total_duration_sec: f64,
}

impl Timeline {
    /// Build from explicit segments. Segments are ordered by start time; the
    /// total duration is the latest segment end.
    pub fn from_segments(mut segments: Vec<Segment>) -> Arc<Self> {
        segments.sort_by(|a, b| a.start_sec.total_cmp(&b.start_sec));
        let total_duration_sec = segments
            .iter()
            .map(Segment::end_sec)
            .fold(0.0_f64, f64::max);
        Arc::new(Self {
            segments,
            total_duration_sec,
        })
    }

    /// Lay out uniform clips back to back, each overlapping its successor by
    /// `crossfade_sec`. Consecutive starts advance by
    /// `clip_duration_sec - crossfade_sec`.
    pub fn from_clips(
        clips: Vec<Clip>,
        clip_duration_sec: f64,
        crossfade_sec: f64,
    ) -> Result<Arc<Self>> {
        if !(clip_duration_sec > 0.0) {
            bail!("clip duration must be positive, got {clip_duration_sec}");
        }
        let crossfade_sec = crossfade_sec.max(0.0);
        if crossfade_sec >= clip_duration_sec {
            bail!(
                "crossfade ({crossfade_sec}s) must be shorter than the clip duration \
                 ({clip_duration_sec}s)"
            );
        }

        let mut segments = Vec::with_capacity(clips.len());
        let mut cursor = 0.0_f64;
        for clip in clips {
            segments.push(Segment {
                image: clip.image,
                dst: clip.dst,
                start_sec: cursor,
                duration_sec: clip_duration_sec,
                crossfade_sec,
            });
            cursor += clip_duration_sec - crossfade_sec;
        }
        Ok(Self::from_segments(segments))
    }

    pub fn total_duration(&self) -> f64 {
        self.total_duration_sec
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Evaluate the timeline at a timestamp into the request's canvas.
    ///
    /// The active segment is the first (in start order) whose
    /// `[start, start + duration)` window contains the timestamp; timestamps
    /// outside every window resolve to the last segment at full opacity.
    /// Inside the trailing crossfade window the active segment fades from
    /// full opacity to zero while its successor fades in on top of it,
    /// painter's order, over a black background.
    pub fn render(&self, request: RenderRequest<'_>) {
        if self.segments.is_empty() {
            return;
        }

        let time_sec = request.time_sec;
        let (index, segment) = match self
            .segments
            .iter()
            .enumerate()
            .find(|(_, segment)| segment.contains(time_sec))
        {
            Some(found) => found,
            // Past the end: hold the final frame.
            None => (
                self.segments.len() - 1,
                &self.segments[self.segments.len() - 1],
            ),
        };

        request.canvas.clear(Color::BLACK);

        let end_sec = segment.end_sec();
        let fade_len = segment.crossfade_sec.max(0.0);
        let fade_start = (end_sec - fade_len).max(segment.start_sec);
        let next = self.segments.get(index + 1);
        let in_fade =
            fade_len > 0.0 && next.is_some() && time_sec >= fade_start && time_sec < end_sec;

        if in_fade {
            let blend = ((time_sec - fade_start) / fade_len).clamp(0.0, 1.0) as f32;
            request
                .canvas
                .draw_image(&segment.image, segment.dst, 1.0 - blend);
            if let Some(next) = next {
                request.canvas.draw_image(&next.image, next.dst, blend);
            }
        } else {
            request.canvas.draw_image(&segment.image, segment.dst, 1.0);
        }
    }
}
