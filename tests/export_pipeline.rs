use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::atomic::AtomicBool;

use fadereel::codec::FfmpegMode;
use fadereel::context::GraphicsContext;
use fadereel::encoder::{EncodeOutcome, EncoderConfig, ExportEncoder};
use fadereel::preview::build_image_sequence_timeline;
use image::{Rgba, RgbaImage};

fn has_system_ffmpeg() -> bool {
    Command::new("ffmpeg")
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

fn has_gpu() -> bool {
    GraphicsContext::headless().is_ok()
}

fn write_slides(dir: &std::path::Path) -> Vec<PathBuf> {
    let colors = [
        Rgba([255, 0, 0, 255]),
        Rgba([0, 255, 0, 255]),
        Rgba([0, 0, 255, 255]),
    ];
    colors
        .iter()
        .enumerate()
        .map(|(index, color)| {
            let path = dir.join(format!("slide{index}.png"));
            RgbaImage::from_pixel(64, 64, *color).save(&path).unwrap();
            path
        })
        .collect()
}

#[test]
fn export_writes_a_playable_mp4() {
    if !has_system_ffmpeg() {
        eprintln!("Skipping test: ffmpeg not on PATH");
        return;
    }
    if !has_gpu() {
        eprintln!("Skipping test: no GPU adapter");
        return;
    }

    let dir = tempfile::tempdir().unwrap();
    let slides = write_slides(dir.path());
    let output = dir.path().join("out.mp4");

    let timeline = build_image_sequence_timeline(&slides, 64, 64, 0.5, 0.1).unwrap();
    let mut encoder = ExportEncoder::new(EncoderConfig {
        width: 64,
        height: 64,
        fps: 10,
        output_path: output.clone(),
        ..EncoderConfig::default()
    });
    encoder.set_ffmpeg_mode(FfmpegMode::System);
    encoder.set_timeline(timeline);

    encoder.prepare().unwrap();
    let cancel = AtomicBool::new(false);
    let mut last_progress = 0.0;
    let outcome = encoder
        .encode_blocking(&cancel, |progress| {
            assert!(progress >= last_progress);
            assert!(progress <= 1.0);
            last_progress = progress;
        })
        .unwrap();
    encoder.release();

    assert_eq!(outcome, EncodeOutcome::Completed);
    assert_eq!(last_progress, 1.0);
    let metadata = std::fs::metadata(&output).unwrap();
    assert!(metadata.len() > 0, "output file is empty");
}

#[test]
fn prepare_fails_fast_on_unknown_codec() {
    let dir = tempfile::tempdir().unwrap();
    let slides = write_slides(dir.path());
    let timeline = build_image_sequence_timeline(&slides, 64, 64, 0.5, 0.1).unwrap();

    let mut encoder = ExportEncoder::new(EncoderConfig {
        mime: "video/vp9".into(),
        output_path: dir.path().join("out.mp4"),
        ..EncoderConfig::default()
    });
    encoder.set_timeline(timeline);
    assert!(encoder.prepare().is_err());
    // Safe after a failed prepare, and repeatedly.
    encoder.release();
    encoder.release();
}

#[test]
fn prepare_requires_a_timeline() {
    let mut encoder = ExportEncoder::new(EncoderConfig::default());
    assert!(encoder.prepare().is_err());
}

#[test]
fn prepare_rejects_missing_output_directory() {
    if !has_system_ffmpeg() {
        eprintln!("Skipping test: ffmpeg not on PATH");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let slides = write_slides(dir.path());
    let timeline = build_image_sequence_timeline(&slides, 64, 64, 0.5, 0.1).unwrap();

    let mut encoder = ExportEncoder::new(EncoderConfig {
        output_path: dir.path().join("no-such-dir").join("out.mp4"),
        ..EncoderConfig::default()
    });
    encoder.set_ffmpeg_mode(FfmpegMode::System);
    encoder.set_timeline(timeline);
    assert!(encoder.prepare().is_err());
    encoder.release();
}
