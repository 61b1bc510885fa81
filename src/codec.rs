use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use log::{debug, warn};

/// How long a single output poll blocks before reporting "try again later".
pub const OUTPUT_POLL_TIMEOUT: Duration = Duration::from_millis(10);

const OUTPUT_CHUNK_BYTES: usize = 64 * 1024;

/// Negotiated elementary-stream format, surfaced by the encoder before its
/// first sample and consumed by the muxer when registering the track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFormat {
    pub mime: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

/// One chunk of encoded bitstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedSample {
    pub data: Vec<u8>,
    pub end_of_stream: bool,
}

/// Result of a single bounded encoder output poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncoderPoll {
    /// Nothing ready within the poll timeout.
    TryAgainLater,
    /// The output format is now known. Reported at most once, before any
    /// sample.
    FormatChanged(StreamFormat),
    /// An encoded sample. An empty end-of-stream sample closes the stream.
    Sample(EncodedSample),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackId(pub(crate) usize);

/// A video encoder accepting raw RGBA frames and producing an elementary
/// stream. Frames must be queued with strictly increasing timestamps.
pub trait EncoderBackend: Send {
    fn start(&mut self) -> Result<()>;
    fn queue_frame(&mut self, rgba: &[u8], pts_ns: i64) -> Result<()>;
    fn signal_end_of_input(&mut self) -> Result<()>;
    fn dequeue_output(&mut self, timeout: Duration) -> Result<EncoderPoll>;
    /// Finalize after the stream has fully drained, surfacing any backend
    /// failure. Called only on runs that are to be reported as successful.
    fn finish(&mut self) -> Result<()>;
    /// Tear down. Safe to call repeatedly and after errors.
    fn stop(&mut self);
}

/// A container muxer. Tracks are registered before `start`; writing a sample
/// before `start` is an error. Samples produced before the muxer starts must
/// be released unwritten.
pub trait MuxerBackend: Send {
    fn add_track(&mut self, format: &StreamFormat) -> Result<TrackId>;
    fn start(&mut self) -> Result<()>;
    fn write_sample(&mut self, track: TrackId, sample: &EncodedSample) -> Result<()>;
    /// Finalize the container, surfacing any backend failure. Called only
    /// on runs that are to be reported as successful.
    fn finish(&mut self) -> Result<()>;
    /// Tear down. Safe to call repeatedly and after errors.
    fn stop(&mut self);
}

/// Where to find the ffmpeg binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FfmpegMode {
    /// Use the system binary when present, otherwise the downloaded sidecar.
    #[default]
    Auto,
    /// Require `ffmpeg` on PATH.
    System,
    /// Require the sidecar feature and its downloaded binary.
    Sidecar,
}

impl std::str::FromStr for FfmpegMode {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "auto" => Ok(FfmpegMode::Auto),
            "system" => Ok(FfmpegMode::System),
            "sidecar" => Ok(FfmpegMode::Sidecar),
            other => bail!("unknown ffmpeg mode '{other}' (expected auto, system, or sidecar)"),
        }
    }
}

/// Map a codec MIME type to the ffmpeg encoder and elementary-stream format
/// names. Unknown MIME types are a configuration error.
pub(crate) fn codec_names_for_mime(mime: &str) -> Result<(&'static str, &'static str)> {
    match mime {
        "video/avc" => Ok(("libx264", "h264")),
        "video/hevc" => Ok(("libx265", "hevc")),
        other => bail!("unsupported codec MIME type '{other}'"),
    }
}

fn system_ffmpeg() -> Option<PathBuf> {
    let candidate = PathBuf::from("ffmpeg");
    let check = Command::new(&candidate)
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    match check {
        Ok(status) if status.success() => Some(candidate),
        _ => None,
    }
}

#[cfg(feature = "sidecar_ffmpeg")]
fn sidecar_ffmpeg() -> Result<PathBuf> {
    let path = ffmpeg_sidecar::paths::ffmpeg_path();
    if !path.exists() {
        ffmpeg_sidecar::download::auto_download()
            .context("failed to auto-download ffmpeg sidecar binary")?;
    }
    Ok(path)
}

#[cfg(not(feature = "sidecar_ffmpeg"))]
fn sidecar_ffmpeg() -> Result<PathBuf> {
    bail!("sidecar ffmpeg requested but the 'sidecar_ffmpeg' feature is disabled")
}

/// Resolve the ffmpeg binary for the requested mode.
pub fn resolve_ffmpeg(mode: FfmpegMode) -> Result<PathBuf> {
    match mode {
        FfmpegMode::System => {
            system_ffmpeg().ok_or_else(|| anyhow!("ffmpeg not found on PATH"))
        }
        FfmpegMode::Sidecar => sidecar_ffmpeg(),
        FfmpegMode::Auto => {
            if let Some(path) = system_ffmpeg() {
                return Ok(path);
            }
            sidecar_ffmpeg().context("ffmpeg not found on PATH and sidecar unavailable")
        }
    }
}

/// Arguments for the encode process: raw RGBA frames on stdin, elementary
/// stream on stdout.
pub(crate) fn encoder_args(
    format: &StreamFormat,
    bitrate_bps: u32,
    i_frame_interval_sec: u32,
) -> Result<Vec<String>> {
    let (encoder, stream_format) = codec_names_for_mime(&format.mime)?;
    let gop = format.fps.saturating_mul(i_frame_interval_sec).max(1);
    Ok(vec![
        "-hide_banner".into(),
        "-loglevel".into(),
        "error".into(),
        "-f".into(),
        "rawvideo".into(),
        "-pix_fmt".into(),
        "rgba".into(),
        "-s".into(),
        format!("{}x{}", format.width, format.height),
        "-r".into(),
        format.fps.to_string(),
        "-i".into(),
        "-".into(),
        "-c:v".into(),
        encoder.into(),
        "-b:v".into(),
        bitrate_bps.to_string(),
        "-g".into(),
        gop.to_string(),
        "-pix_fmt".into(),
        "yuv420p".into(),
        "-f".into(),
        stream_format.into(),
        "pipe:1".into(),
    ])
}

/// Arguments for the mux process: elementary stream on stdin, MP4 at the
/// output path.
pub(crate) fn muxer_args(format: &StreamFormat, output: &Path) -> Result<Vec<String>> {
    let (_, stream_format) = codec_names_for_mime(&format.mime)?;
    Ok(vec![
        "-hide_banner".into(),
        "-loglevel".into(),
        "error".into(),
        "-y".into(),
        "-f".into(),
        stream_format.into(),
        "-r".into(),
        format.fps.to_string(),
        "-i".into(),
        "-".into(),
        "-c".into(),
        "copy".into(),
        "-f".into(),
        "mp4".into(),
        output.display().to_string(),
    ])
}

enum ReaderEvent {
    Chunk(Vec<u8>),
    End,
}

/// Video encoder backed by an ffmpeg child process. Frames are written to the
/// child's stdin; a reader thread chunks its stdout into samples delivered
/// through a channel, which is what gives `dequeue_output` its bounded-wait
/// behavior.
pub struct FfmpegVideoEncoder {
    format: StreamFormat,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    output: Option<Receiver<ReaderEvent>>,
    reader: Option<JoinHandle<()>>,
    started: bool,
    format_reported: bool,
    last_pts_ns: Option<i64>,
}

impl FfmpegVideoEncoder {
    /// Spawn and configure the encode process. The input pipe exists from
    /// this point, mirroring a codec whose input surface is created at
    /// configure time, but frames are rejected until `start`.
    pub fn new(
        format: StreamFormat,
        bitrate_bps: u32,
        i_frame_interval_sec: u32,
        mode: FfmpegMode,
    ) -> Result<Self> {
        let args = encoder_args(&format, bitrate_bps, i_frame_interval_sec)?;
        let ffmpeg = resolve_ffmpeg(mode)?;
        debug!("spawning encoder: {} {}", ffmpeg.display(), args.join(" "));

        let mut child = Command::new(&ffmpeg)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("failed spawning {}", ffmpeg.display()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("encoder process has no stdin pipe"))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("encoder process has no stdout pipe"))?;

        let (sender, receiver) = mpsc::channel();
        let reader = std::thread::Builder::new()
            .name("fadereel-encoder-output".into())
            .spawn(move || {
                let mut buffer = vec![0_u8; OUTPUT_CHUNK_BYTES];
                loop {
                    match stdout.read(&mut buffer) {
                        Ok(0) => break,
                        Ok(read) => {
                            if sender.send(ReaderEvent::Chunk(buffer[..read].to_vec())).is_err() {
                                return;
                            }
                        }
                        Err(error) => {
                            warn!("encoder output read failed: {error}");
                            break;
                        }
                    }
                }
                let _ = sender.send(ReaderEvent::End);
            })
            .context("failed spawning encoder output reader")?;

        Ok(Self {
            format,
            child: Some(child),
            stdin: Some(stdin),
            output: Some(receiver),
            reader: Some(reader),
            started: false,
            format_reported: false,
            last_pts_ns: None,
        })
    }
}

impl EncoderBackend for FfmpegVideoEncoder {
    fn start(&mut self) -> Result<()> {
        if self.child.is_none() {
            bail!("encoder already stopped");
        }
        self.started = true;
        Ok(())
    }

    fn queue_frame(&mut self, rgba: &[u8], pts_ns: i64) -> Result<()> {
        if !self.started {
            bail!("encoder not started");
        }
        if let Some(last) = self.last_pts_ns {
            if pts_ns <= last {
                bail!("frame timestamps must be strictly increasing ({pts_ns} after {last})");
            }
        }
        let expected = self.format.width as usize * self.format.height as usize * 4;
        if rgba.len() != expected {
            bail!(
                "frame is {} bytes, expected {expected} for {}x{} RGBA",
                rgba.len(),
                self.format.width,
                self.format.height
            );
        }

        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| anyhow!("encoder input already closed"))?;
        stdin
            .write_all(rgba)
            .context("failed writing frame to encoder")?;
        self.last_pts_ns = Some(pts_ns);
        Ok(())
    }

    fn signal_end_of_input(&mut self) -> Result<()> {
        // Closing stdin lets the child finish its stream and exit.
        self.stdin.take();
        Ok(())
    }

    fn dequeue_output(&mut self, timeout: Duration) -> Result<EncoderPoll> {
        if !self.format_reported {
            self.format_reported = true;
            return Ok(EncoderPoll::FormatChanged(self.format.clone()));
        }

        let output = self
            .output
            .as_ref()
            .ok_or_else(|| anyhow!("encoder output already closed"))?;
        match output.recv_timeout(timeout) {
            Ok(ReaderEvent::Chunk(data)) => Ok(EncoderPoll::Sample(EncodedSample {
                data,
                end_of_stream: false,
            })),
            Ok(ReaderEvent::End) => Ok(EncoderPoll::Sample(EncodedSample {
                data: Vec::new(),
                end_of_stream: true,
            })),
            Err(RecvTimeoutError::Timeout) => Ok(EncoderPoll::TryAgainLater),
            Err(RecvTimeoutError::Disconnected) => {
                bail!("encoder output channel closed unexpectedly")
            }
        }
    }

    fn finish(&mut self) -> Result<()> {
        self.stdin.take();
        self.output.take();
        if let Some(mut child) = self.child.take() {
            let status = child
                .wait()
                .context("failed waiting for encoder process")?;
            if !status.success() {
                bail!("encoder process exited with {status}");
            }
        }
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
        self.started = false;
        Ok(())
    }

    fn stop(&mut self) {
        self.stdin.take();
        self.output.take();
        if let Some(mut child) = self.child.take() {
            match child.wait() {
                Ok(status) if !status.success() => {
                    warn!("encoder process exited with {status}");
                }
                Ok(_) => {}
                Err(error) => warn!("failed waiting for encoder process: {error}"),
            }
        }
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
        self.started = false;
    }
}

impl Drop for FfmpegVideoEncoder {
    fn drop(&mut self) {
        self.stop();
    }
}

/// MP4 muxer backed by an ffmpeg stream-copy child process.
pub struct FfmpegMuxer {
    output_path: PathBuf,
    mime: String,
    mode: FfmpegMode,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    track: Option<TrackId>,
    started: bool,
}

impl FfmpegMuxer {
    /// Validate the output container target. The mux process itself is
    /// spawned lazily in `add_track`, once the negotiated stream format is
    /// known.
    pub fn new(output_path: PathBuf, mime: &str, mode: FfmpegMode) -> Result<Self> {
        codec_names_for_mime(mime)?;
        if let Some(parent) = output_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.is_dir() {
                bail!("output directory {} does not exist", parent.display());
            }
        }
        Ok(Self {
            output_path,
            mime: mime.to_string(),
            mode,
            child: None,
            stdin: None,
            track: None,
            started: false,
        })
    }
}

impl MuxerBackend for FfmpegMuxer {
    fn add_track(&mut self, format: &StreamFormat) -> Result<TrackId> {
        if self.track.is_some() {
            bail!("muxer already has a track");
        }
        if format.mime != self.mime {
            bail!(
                "track format '{}' does not match configured '{}'",
                format.mime,
                self.mime
            );
        }

        let args = muxer_args(format, &self.output_path)?;
        let ffmpeg = resolve_ffmpeg(self.mode)?;
        debug!("spawning muxer: {} {}", ffmpeg.display(), args.join(" "));

        let mut child = Command::new(&ffmpeg)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("failed spawning {}", ffmpeg.display()))?;
        self.stdin = Some(
            child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("muxer process has no stdin pipe"))?,
        );
        self.child = Some(child);

        let track = TrackId(0);
        self.track = Some(track);
        Ok(track)
    }

    fn start(&mut self) -> Result<()> {
        if self.track.is_none() {
            bail!("muxer has no track to start");
        }
        self.started = true;
        Ok(())
    }

    fn write_sample(&mut self, track: TrackId, sample: &EncodedSample) -> Result<()> {
        if !self.started {
            bail!("muxer not started");
        }
        if Some(track) != self.track {
            bail!("unknown track {track:?}");
        }
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| anyhow!("muxer input already closed"))?;
        stdin
            .write_all(&sample.data)
            .context("failed writing sample to muxer")?;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.stdin.take();
        if let Some(mut child) = self.child.take() {
            let status = child.wait().context("failed waiting for muxer process")?;
            if !status.success() {
                bail!("muxer process exited with {status}");
            }
        }
        self.started = false;
        Ok(())
    }

    fn stop(&mut self) {
        self.stdin.take();
        if let Some(mut child) = self.child.take() {
            match child.wait() {
                Ok(status) if !status.success() => {
                    warn!("muxer process exited with {status}");
                }
                Ok(_) => {}
                Err(error) => warn!("failed waiting for muxer process: {error}"),
            }
        }
        self.started = false;
    }
}

impl Drop for FfmpegMuxer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::{codec_names_for_mime, encoder_args, muxer_args, FfmpegMode, StreamFormat};
    use std::path::Path;

    fn format() -> StreamFormat {
        StreamFormat {
            mime: "video/avc".into(),
            width: 1280,
            height: 720,
            fps: 30,
        }
    }

    #[test]
    fn mime_mapping_covers_avc_and_hevc() {
        assert_eq!(codec_names_for_mime("video/avc").unwrap(), ("libx264", "h264"));
        assert_eq!(codec_names_for_mime("video/hevc").unwrap(), ("libx265", "hevc"));
        assert!(codec_names_for_mime("video/vp9").is_err());
        assert!(codec_names_for_mime("").is_err());
    }

    #[test]
    fn encoder_args_describe_raw_rgba_input() {
        let args = encoder_args(&format(), 4_000_000, 2).unwrap();
        let joined = args.join(" ");
        assert!(joined.contains("-f rawvideo"));
        assert!(joined.contains("-pix_fmt rgba"));
        assert!(joined.contains("-s 1280x720"));
        assert!(joined.contains("-r 30"));
        assert!(joined.contains("-c:v libx264"));
        assert!(joined.contains("-b:v 4000000"));
        assert!(joined.contains("-g 60"));
        assert!(joined.ends_with("-f h264 pipe:1"));
    }

    #[test]
    fn encoder_args_gop_never_hits_zero() {
        let mut zero_fps = format();
        zero_fps.fps = 0;
        let args = encoder_args(&zero_fps, 4_000_000, 0).unwrap();
        let gop_index = args.iter().position(|a| a == "-g").unwrap();
        assert_eq!(args[gop_index + 1], "1");
    }

    #[test]
    fn muxer_args_stream_copy_into_mp4() {
        let args = muxer_args(&format(), Path::new("out/video.mp4")).unwrap();
        let joined = args.join(" ");
        assert!(joined.contains("-f h264 -r 30 -i -"));
        assert!(joined.contains("-c copy"));
        assert!(joined.ends_with("-f mp4 out/video.mp4"));
    }

    #[test]
    fn ffmpeg_mode_parses_cli_values() {
        assert_eq!("auto".parse::<FfmpegMode>().unwrap(), FfmpegMode::Auto);
        assert_eq!("system".parse::<FfmpegMode>().unwrap(), FfmpegMode::System);
        assert_eq!("sidecar".parse::<FfmpegMode>().unwrap(), FfmpegMode::Sidecar);
        assert!("".parse::<FfmpegMode>().is_err());
        assert!("local".parse::<FfmpegMode>().is_err());
    }
}
