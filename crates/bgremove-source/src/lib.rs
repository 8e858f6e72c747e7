#![warn(missing_docs)]
//! # bgremove-source
//!
//! ## Purpose
//! Demuxes an input video container and emits ordered, rescaled RGB frames.
//!
//! ## Responsibilities
//! - Probe the container for video-stream metadata (`ffprobe`): frame rate,
//!   frame count, native dimensions.
//! - Spawn `ffmpeg` to decode and rescale frames to pipeline height 320,
//!   streaming raw RGB24 bytes over its stdout.
//! - Expose an ordered, index-tagged [`Frame`] iterator that terminates at
//!   the container's end or at a caller-supplied frame limit, whichever
//!   comes first.
//!
//! ## Data flow
//! `bgremove-pipeline` drives [`probe`] once to size the run, then drains
//! [`FrameDecoder`] on a dedicated thread, pushing frames into the shared
//! frame buffer.
//!
//! ## Ownership and lifetimes
//! [`FrameDecoder`] owns the `ffmpeg` child process and its stdout pipe for
//! its entire lifetime; dropping it before exhaustion kills the child.
//!
//! ## Error model
//! [`SourceError::NoVideoStream`] and [`SourceError::UnknownFrameRate`] cover
//! the two probe-time failures this crate distinguishes; anything else from the
//! subprocess boundary is [`SourceError::Demux`].

use std::io::Read;
use std::process::{Child, ChildStdout, Command, Stdio};

use bgremove_core::{CoreError, Frame, FrameRate, VideoMetadata, PIPELINE_HEIGHT};
use serde::Deserialize;
use thiserror::Error;

/// Name of the probe executable, resolved from `PATH`.
pub const FFPROBE_BIN: &str = "ffprobe";

/// Name of the decode executable, resolved from `PATH`.
pub const FFMPEG_BIN: &str = "ffmpeg";

/// Probes `path` for video-stream metadata, rescaling the reported width to
/// pipeline height 320 with aspect ratio preserved and rounded to an even
/// pixel count (the demuxer's even-width convention).
///
/// `frame_limit`, if `Some`, caps `total_frames` below the probed count.
///
/// # Errors
/// Returns [`SourceError::Demux`] if `ffprobe` cannot be run or its output
/// cannot be parsed, [`SourceError::NoVideoStream`] if no video stream is
/// reported, or [`SourceError::UnknownFrameRate`] if the reported rate is
/// `0/0` or unparsable.
pub fn probe(path: &str, frame_limit: Option<u64>) -> Result<VideoMetadata, SourceError> {
    let output = Command::new(FFPROBE_BIN)
        .args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=width,height,r_frame_rate,nb_frames",
            "-of",
            "json",
        ])
        .arg(path)
        .output()
        .map_err(|source| SourceError::Demux(format!("failed to run {FFPROBE_BIN}: {source}")))?;

    if !output.status.success() {
        return Err(SourceError::Demux(format!(
            "{FFPROBE_BIN} exited with status {}",
            output.status
        )));
    }

    let probe: ProbeOutput = serde_json::from_slice(&output.stdout)
        .map_err(|source| SourceError::Demux(format!("failed to parse {FFPROBE_BIN} output: {source}")))?;

    let stream = probe.streams.into_iter().next().ok_or(SourceError::NoVideoStream)?;
    let frame_rate = FrameRate::parse(&stream.r_frame_rate).map_err(|error| match error {
        CoreError::UnknownFrameRate(raw) => SourceError::UnknownFrameRate(raw),
        other => SourceError::Demux(other.to_string()),
    })?;

    let native_frames: u64 = stream.nb_frames.parse().unwrap_or(0);
    let total_frames = match frame_limit {
        Some(limit) => native_frames.min(limit),
        None => native_frames,
    };

    let width = rescaled_width(stream.width, stream.height);

    tracing::info!(
        path,
        total_frames,
        frame_rate = %frame_rate.as_arg_string(),
        width,
        "probed input container"
    );

    Ok(VideoMetadata {
        total_frames,
        frame_rate,
        width,
    })
}

/// Computes the output width when rescaling to [`PIPELINE_HEIGHT`], aspect
/// preserved, rounded down to the nearest even pixel count.
fn rescaled_width(native_width: u32, native_height: u32) -> u32 {
    if native_height == 0 {
        return 0;
    }
    let scaled = (native_width as u64 * PIPELINE_HEIGHT as u64) / native_height as u64;
    let even = (scaled / 2) * 2;
    even.max(2) as u32
}

/// A running `ffmpeg` decode process streaming ordered RGB24 frames.
pub struct FrameDecoder {
    child: Child,
    stdout: ChildStdout,
    width: u32,
    next_index: u64,
    total_frames: u64,
    frame_bytes: usize,
}

impl FrameDecoder {
    /// Spawns `ffmpeg` to decode and rescale `path` to pipeline height 320,
    /// stopping after `metadata.total_frames` frames.
    ///
    /// # Errors
    /// Returns [`SourceError::Demux`] if `ffmpeg` cannot be spawned or its
    /// stdout pipe cannot be captured.
    pub fn spawn(path: &str, metadata: &VideoMetadata) -> Result<Self, SourceError> {
        let mut child = Command::new(FFMPEG_BIN)
            .args(["-v", "error", "-i"])
            .arg(path)
            .args([
                "-vf",
                &format!("scale=-2:{PIPELINE_HEIGHT}"),
                "-f",
                "rawvideo",
                "-pix_fmt",
                "rgb24",
                "-",
            ])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| SourceError::Demux(format!("failed to spawn {FFMPEG_BIN}: {source}")))?;

        let stdout = child.stdout.take().ok_or_else(|| {
            SourceError::Demux(format!("{FFMPEG_BIN} stdout was not captured"))
        })?;

        let frame_bytes = metadata.width as usize * PIPELINE_HEIGHT as usize * 3;

        tracing::info!(path, width = metadata.width, total_frames = metadata.total_frames, "spawned decoder process");

        Ok(Self {
            child,
            stdout,
            width: metadata.width,
            next_index: 0,
            total_frames: metadata.total_frames,
            frame_bytes,
        })
    }

    /// Reads the next frame, or `None` once `total_frames` have been emitted
    /// or the container has ended — whichever comes first (this resolves the
    /// off-by-one open question in favour of `idx >= total_frames`).
    ///
    /// # Errors
    /// Returns [`SourceError::Demux`] on a short/partial read from `ffmpeg`.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        if self.next_index >= self.total_frames {
            return Ok(None);
        }

        let mut buffer = vec![0u8; self.frame_bytes];
        match read_exact_or_eof(&mut self.stdout, &mut buffer)? {
            false => Ok(None),
            true => {
                let frame = Frame::new(self.next_index, self.width, buffer)
                    .map_err(|error| SourceError::Demux(error.to_string()))?;
                self.next_index += 1;
                Ok(Some(frame))
            }
        }
    }
}

impl Drop for FrameDecoder {
    fn drop(&mut self) {
        if self.next_index < self.total_frames {
            tracing::debug!(next_index = self.next_index, total_frames = self.total_frames, "killing decoder process before exhaustion");
        }
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Reads exactly `buffer.len()` bytes, returning `Ok(false)` on a clean EOF
/// before any bytes were read and `Err` on a short read partway through.
fn read_exact_or_eof(reader: &mut impl Read, buffer: &mut [u8]) -> Result<bool, SourceError> {
    let mut filled = 0;
    while filled < buffer.len() {
        let read = reader
            .read(&mut buffer[filled..])
            .map_err(|source| SourceError::Demux(format!("failed reading frame bytes: {source}")))?;
        if read == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(SourceError::Demux(format!(
                "short read: expected {} bytes, got {filled}",
                buffer.len()
            )));
        }
        filled += read;
    }
    Ok(true)
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    streams: Vec<ProbeStream>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    width: u32,
    height: u32,
    r_frame_rate: String,
    #[serde(default = "default_nb_frames")]
    nb_frames: String,
}

fn default_nb_frames() -> String {
    "0".to_string()
}

/// Error type for frame-source failures.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The container exposes no video stream.
    #[error("input has no video stream")]
    NoVideoStream,
    /// The reported frame rate was `0/0` or otherwise unparsable.
    #[error("could not detect frame rate: {0}")]
    UnknownFrameRate(String),
    /// Any other demux/decode-subprocess failure.
    #[error("demux error: {0}")]
    Demux(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rescaled_width_preserves_aspect_and_rounds_even() {
        assert_eq!(rescaled_width(640, 480), 426);
        assert_eq!(rescaled_width(1920, 1080), 568);
    }

    #[test]
    fn rescaled_width_handles_zero_height() {
        assert_eq!(rescaled_width(640, 0), 0);
    }

    #[test]
    fn probe_output_parses_stream_fields() {
        let raw = r#"{"streams":[{"width":640,"height":480,"r_frame_rate":"30000/1001","nb_frames":"300"}]}"#;
        let parsed: ProbeOutput = serde_json::from_str(raw).expect("should parse");
        assert_eq!(parsed.streams[0].width, 640);
        assert_eq!(parsed.streams[0].nb_frames, "300");
    }

    #[test]
    fn probe_output_defaults_missing_nb_frames() {
        let raw = r#"{"streams":[{"width":640,"height":480,"r_frame_rate":"25/1"}]}"#;
        let parsed: ProbeOutput = serde_json::from_str(raw).expect("should parse");
        assert_eq!(parsed.streams[0].nb_frames, "0");
    }
}
