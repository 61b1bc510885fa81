use std::path::PathBuf;
use std::sync::atomic::AtomicBool;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;

use fadereel::codec::FfmpegMode;
use fadereel::encoder::{EncodeOutcome, EncoderConfig, ExportEncoder};
use fadereel::preview::build_image_sequence_timeline;

#[derive(Parser)]
#[command(
    name = "fadereel",
    version = concat!(env!("CARGO_PKG_VERSION"), " (", env!("FADEREEL_GIT_HASH"), ")"),
    about = "GPU cross-fade slideshows: live preview and MP4 export"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct TimelineArgs {
    /// Image files, in slideshow order
    #[arg(required = true)]
    images: Vec<PathBuf>,

    /// Seconds each image is on screen
    #[arg(long, default_value_t = 2.0)]
    clip_duration: f64,

    /// Seconds of overlap blended between consecutive images
    #[arg(long, default_value_t = 0.5)]
    crossfade: f64,
}

#[derive(Subcommand)]
enum Commands {
    /// Render a slideshow to an MP4 file without opening a window
    Export {
        #[command(flatten)]
        timeline: TimelineArgs,

        /// Output video path
        #[arg(short, long, default_value = "slideshow.mp4")]
        output: PathBuf,

        #[arg(long, default_value_t = 1280)]
        width: u32,

        #[arg(long, default_value_t = 720)]
        height: u32,

        #[arg(long, default_value_t = 30)]
        fps: u32,

        /// Video bitrate in bits per second
        #[arg(long, default_value_t = 4_000_000)]
        bitrate: u32,

        /// Codec MIME type (video/avc or video/hevc)
        #[arg(long, default_value = "video/avc")]
        codec: String,

        /// Where to find ffmpeg: auto, system, or sidecar
        #[arg(long, default_value = "auto")]
        ffmpeg: FfmpegMode,
    },

    /// Open an interactive preview window
    #[cfg(feature = "play")]
    Play {
        #[command(flatten)]
        timeline: TimelineArgs,

        /// Output path used when an export is started from the window
        #[arg(short, long, default_value = "slideshow.mp4")]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Export {
            timeline,
            output,
            width,
            height,
            fps,
            bitrate,
            codec,
            ffmpeg,
        } => run_export(timeline, output, width, height, fps, bitrate, codec, ffmpeg),
        #[cfg(feature = "play")]
        Commands::Play { timeline, output } => fadereel::play::run(fadereel::play::PlayArgs {
            images: timeline.images,
            clip_duration_sec: timeline.clip_duration,
            crossfade_sec: timeline.crossfade,
            export: EncoderConfig {
                output_path: output,
                ..EncoderConfig::default()
            },
        }),
    }
}

fn run_export(
    timeline_args: TimelineArgs,
    output: PathBuf,
    width: u32,
    height: u32,
    fps: u32,
    bitrate: u32,
    codec: String,
    ffmpeg: FfmpegMode,
) -> Result<()> {
    let timeline = build_image_sequence_timeline(
        &timeline_args.images,
        width,
        height,
        timeline_args.clip_duration,
        timeline_args.crossfade,
    )?;

    let mut encoder = ExportEncoder::new(EncoderConfig {
        width,
        height,
        fps,
        bitrate_bps: bitrate,
        mime: codec,
        output_path: output,
        ..EncoderConfig::default()
    });
    encoder.set_ffmpeg_mode(ffmpeg);
    encoder.set_timeline(timeline);

    encoder.prepare().context("export setup failed")?;
    let cancel = AtomicBool::new(false);
    let mut last_reported = 0_u32;
    let outcome = encoder.encode_blocking(&cancel, |progress| {
        let percent = (progress * 100.0) as u32;
        if percent >= last_reported + 10 {
            last_reported = percent - percent % 10;
            info!("export {percent}%");
        }
    });
    let path = encoder.output_path().to_path_buf();
    encoder.release();

    // Headless exports carry no cancel signal, so the run always completes.
    if outcome? == EncodeOutcome::Completed {
        info!("wrote {}", path.display());
    }
    Ok(())
}
