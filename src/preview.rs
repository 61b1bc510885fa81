use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use log::warn;

use crate::canvas::{ImageResource, Rect};
use crate::timeline::{Clip, Timeline};

/// Decode a batch of image files. Files that fail to open or decode are
/// logged and skipped rather than failing the batch.
pub fn load_images(paths: &[PathBuf]) -> Vec<Arc<ImageResource>> {
    let mut images = Vec::with_capacity(paths.len());
    for path in paths {
        match ImageResource::load(path) {
            Ok(image) => images.push(image),
            Err(error) => warn!("skipping {}: {error:#}", path.display()),
        }
    }
    images
}

/// Scale an image to the viewport width, preserving aspect ratio, and center
/// it vertically.
pub fn fit_to_width(image: &ImageResource, viewport_width: u32, viewport_height: u32) -> Rect {
    let scaled_width = viewport_width as f32;
    let scaled_height = scaled_width * image.height() as f32 / image.width() as f32;
    let y = (viewport_height as f32 - scaled_height) * 0.5;
    Rect::from_xywh(0.0, y, scaled_width, scaled_height)
}

/// Build a cross-fading slideshow timeline from image files laid out for the
/// given viewport. Unreadable files are skipped; an empty result is an error.
pub fn build_image_sequence_timeline(
    paths: &[PathBuf],
    viewport_width: u32,
    viewport_height: u32,
    clip_duration_sec: f64,
    crossfade_sec: f64,
) -> Result<Arc<Timeline>> {
    if viewport_width == 0 || viewport_height == 0 {
        bail!("viewport must be non-zero, got {viewport_width}x{viewport_height}");
    }
    let images = load_images(paths);
    if images.is_empty() {
        bail!("none of the {} image(s) could be loaded", paths.len());
    }

    let clips = images
        .into_iter()
        .map(|image| {
            let dst = fit_to_width(&image, viewport_width, viewport_height);
            Clip { image, dst }
        })
        .collect();
    Timeline::from_clips(clips, clip_duration_sec, crossfade_sec)
}

#[cfg(test)]
mod tests {
    use super::{build_image_sequence_timeline, fit_to_width, load_images};
    use crate::canvas::ImageResource;
    use image::RgbaImage;
    use std::fs;

    fn write_png(dir: &std::path::Path, name: &str, width: u32, height: u32) -> std::path::PathBuf {
        let path = dir.join(name);
        RgbaImage::new(width, height).save(&path).unwrap();
        path
    }

    #[test]
    fn wide_image_is_letterboxed_vertically() {
        let image = ImageResource::from_rgba(RgbaImage::new(200, 100));
        let dst = fit_to_width(&image, 1280, 720);
        assert_eq!(dst.x, 0.0);
        assert_eq!(dst.w, 1280.0);
        assert_eq!(dst.h, 640.0);
        assert_eq!(dst.y, 40.0);
    }

    #[test]
    fn tall_image_overflows_symmetrically() {
        let image = ImageResource::from_rgba(RgbaImage::new(100, 200));
        let dst = fit_to_width(&image, 1000, 500);
        assert_eq!(dst.h, 2000.0);
        assert_eq!(dst.y, -750.0);
    }

    #[test]
    fn unreadable_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let good = write_png(dir.path(), "good.png", 4, 4);
        let bad = dir.path().join("bad.png");
        fs::write(&bad, b"not an image").unwrap();
        let missing = dir.path().join("missing.png");

        let images = load_images(&[good, bad, missing]);
        assert_eq!(images.len(), 1);
    }

    #[test]
    fn sequence_builder_errors_when_nothing_loads() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.png");
        let result = build_image_sequence_timeline(&[missing], 1280, 720, 2.0, 0.5);
        assert!(result.is_err());
    }

    #[test]
    fn sequence_builder_produces_expected_duration() {
        let dir = tempfile::tempdir().unwrap();
        let paths = vec![
            write_png(dir.path(), "a.png", 4, 4),
            write_png(dir.path(), "b.png", 4, 4),
            write_png(dir.path(), "c.png", 4, 4),
        ];
        let timeline = build_image_sequence_timeline(&paths, 1280, 720, 2.0, 0.5).unwrap();
        assert_eq!(timeline.total_duration(), 5.0);
    }
}
