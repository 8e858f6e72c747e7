#![warn(missing_docs)]
//! # bgremove-postprocess
//!
//! ## Purpose
//! Composes the matte-key video pipeline with a second `ffmpeg` filter-graph
//! pass into the five transparent-output post-processing modes.
//!
//! ## Responsibilities
//! - Run a full [`bgremove_pipeline::run`] into a matte-key intermediate
//!   inside a scoped temporary directory.
//! - Select the alpha-capable output codec (`auto`, explicit override, or the
//!   `.webm`-specific policy).
//! - Build and execute the exact filter-graph argument vector for the
//!   requested [`PostprocessMode`].
//!
//! ## Data flow
//! `bgremove-cli` selects a mode and auxiliary inputs, validates them into a
//! [`PostprocessConfig`], and calls [`run`].
//!
//! ## Ownership and lifetimes
//! The matte-key intermediate lives in a [`tempfile::TempDir`] that is
//! dropped (and thus removed, with a best-effort retry on permission
//! failure) on every exit path of [`run`].
//!
//! ## Error model
//! [`PostprocessError::MissingAuxiliaryInput`] covers the `PipelineConfig`
//! error kind; everything else aggregates pipeline and subprocess
//! failures.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use bgremove_engine::Engine;
use bgremove_pipeline::{PipelineConfig, PipelineError};
use thiserror::Error;

/// The five composite post-processing modes, plus the raw matte-key output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostprocessMode {
    /// Raw matte-key video; no second pass.
    MatteKey,
    /// Transparent video over nothing (alpha channel only).
    TransparentVideo,
    /// Transparent video composited over a background video.
    TransparentOverVideo,
    /// Transparent video composited over a background image.
    TransparentOverImage,
    /// Transparent animated GIF.
    TransparentGif,
    /// Transparent animated GIF composited over a background image.
    TransparentGifWithBg,
}

impl PostprocessMode {
    /// Whether this mode requires an auxiliary overlay input.
    pub fn requires_overlay(&self) -> bool {
        matches!(
            self,
            PostprocessMode::TransparentOverVideo
                | PostprocessMode::TransparentOverImage
                | PostprocessMode::TransparentGifWithBg
        )
    }
}

/// Alpha-capable codec selection policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlphaCodec {
    /// `auto`: lossless (`qtrle`) for most containers, `libvpx-vp9` for `.webm`.
    Auto,
    /// An explicit pixel-format override, e.g. `"yuva420p"`.
    Explicit(String),
}

/// Resolved `(codec, pix_fmt)` pair for an output path and codec policy.
pub fn resolve_alpha_codec(output_path: &Path, policy: &AlphaCodec) -> (&'static str, String) {
    if let AlphaCodec::Explicit(pix_fmt) = policy {
        let codec = if pix_fmt == "yuva444p10le" { "prores_ks" } else { "qtrle" };
        return (codec, pix_fmt.clone());
    }

    let is_webm = output_path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("webm"))
        .unwrap_or(false);

    if is_webm {
        ("libvpx-vp9", "yuva420p".to_string())
    } else {
        ("qtrle", "argb".to_string())
    }
}

/// Validated configuration for one post-processing invocation.
#[derive(Debug, Clone)]
pub struct PostprocessConfig {
    /// Which composite mode to run.
    pub mode: PostprocessMode,
    /// Primary input video.
    pub input_path: PathBuf,
    /// Final output path.
    pub output_path: PathBuf,
    /// Background video, required by [`PostprocessMode::TransparentOverVideo`].
    pub overlay_video: Option<PathBuf>,
    /// Background image, required by [`PostprocessMode::TransparentOverImage`]
    /// and [`PostprocessMode::TransparentGifWithBg`].
    pub overlay_image: Option<PathBuf>,
    /// Alpha codec selection policy.
    pub alpha_codec: AlphaCodec,
}

impl PostprocessConfig {
    /// Validates that the auxiliary input required by `mode` is present.
    ///
    /// # Errors
    /// Returns [`PostprocessError::MissingAuxiliaryInput`] if `mode` requires
    /// an overlay and none was supplied.
    pub fn new(
        mode: PostprocessMode,
        input_path: PathBuf,
        output_path: PathBuf,
        overlay_video: Option<PathBuf>,
        overlay_image: Option<PathBuf>,
        alpha_codec: AlphaCodec,
    ) -> Result<Self, PostprocessError> {
        let has_required_overlay = match mode {
            PostprocessMode::TransparentOverVideo => overlay_video.is_some(),
            PostprocessMode::TransparentOverImage | PostprocessMode::TransparentGifWithBg => {
                overlay_image.is_some()
            }
            _ => true,
        };
        if mode.requires_overlay() && !has_required_overlay {
            return Err(PostprocessError::MissingAuxiliaryInput { mode });
        }
        Ok(Self {
            mode,
            input_path,
            output_path,
            overlay_video,
            overlay_image,
            alpha_codec,
        })
    }
}

/// Runs a full pipeline matte-key pass and, unless `mode` is
/// [`PostprocessMode::MatteKey`], a second filter-graph encode into the
/// requested composite output.
///
/// # Errors
/// Returns [`PostprocessError::Pipeline`] if the matte-key pass fails, or
/// [`PostprocessError::Filter`] if the second-pass `ffmpeg` invocation fails.
pub fn run(
    config: &PostprocessConfig,
    pipeline_config: &PipelineConfig,
    engine: Arc<Engine>,
    frame_limit: Option<u64>,
) -> Result<(), PostprocessError> {
    let temp_dir = tempfile::Builder::new()
        .prefix("bgremove-")
        .tempdir()
        .map_err(PostprocessError::TempDir)?;
    let matte_path = temp_dir.path().join("matte.mp4");

    let input_str = config
        .input_path
        .to_str()
        .ok_or_else(|| PostprocessError::InvalidPath(config.input_path.clone()))?;

    bgremove_pipeline::run(input_str, matte_path.clone(), pipeline_config, engine, frame_limit)?;

    let result = if config.mode == PostprocessMode::MatteKey {
        std::fs::rename(&matte_path, &config.output_path).map_err(PostprocessError::TempDir)
    } else {
        run_filter_graph(config, &matte_path)
    };

    if let Err(error) = temp_dir.close() {
        tracing::warn!(%error, "best-effort cleanup of scoped temporary directory failed");
    }

    result
}

fn run_filter_graph(config: &PostprocessConfig, matte_path: &Path) -> Result<(), PostprocessError> {
    let (codec, pix_fmt) = resolve_alpha_codec(&config.output_path, &config.alpha_codec);
    let input = path_str(&config.input_path)?;
    let matte = path_str(matte_path)?;
    let output = path_str(&config.output_path)?;

    let mut command = Command::new("ffmpeg");
    command.arg("-y");

    // `prores_ks` always needs an explicit profile; ffmpeg defaults to
    // profile 0 ("proxy") otherwise, not the 4:4:4:4 profile 4 this codec is
    // selected for.
    let profile_args: &[&str] = if codec == "prores_ks" { &["-profile:v", "4"] } else { &[] };

    match config.mode {
        PostprocessMode::MatteKey => unreachable!("matte-key mode is handled by run() before this call"),
        PostprocessMode::TransparentVideo => {
            command
                .args(["-i", &input, "-i", &matte, "-filter_complex"])
                .arg("[1][0]scale2ref[mask][main];[main][mask]alphamerge=shortest=1")
                .args(["-c:v", codec, "-pix_fmt", &pix_fmt])
                .args(profile_args)
                .args(["-shortest", &output]);
        }
        PostprocessMode::TransparentOverVideo => {
            let overlay = path_str(config.overlay_video.as_ref().ok_or(PostprocessError::MissingAuxiliaryInput {
                mode: config.mode,
            })?)?;
            command
                .args(["-i", &input, "-i", &matte, "-i", &overlay, "-filter_complex"])
                .arg(
                    "[1][0]scale2ref[mask][main];[main][mask]alphamerge=shortest=1[vid];[vid][2:v]scale2ref[fg][bg];[bg][fg]overlay=shortest=1[out]",
                )
                .args(["-map", "[out]", "-c:v", codec, "-pix_fmt", &pix_fmt])
                .args(profile_args)
                .args(["-shortest", &output]);
        }
        PostprocessMode::TransparentOverImage => {
            let overlay = path_str(config.overlay_image.as_ref().ok_or(PostprocessError::MissingAuxiliaryInput {
                mode: config.mode,
            })?)?;
            command
                .args(["-i", &input, "-i", &overlay, "-filter_complex"])
                .arg(
                    "[0:v]scale2ref=oh*mdar:ih[bg];[1:v]scale2ref=oh*mdar:ih[fg];[bg][fg]overlay=(W-w)/2:(H-h)/2:shortest=1[out]",
                )
                .args(["-map", "[out]", "-c:v", codec, "-pix_fmt", &pix_fmt])
                .args(profile_args)
                .args(["-shortest", &output]);
        }
        PostprocessMode::TransparentGif => {
            command
                .args(["-i", &input, "-i", &matte, "-filter_complex"])
                .arg(
                    "[1][0]scale2ref[mask][main];[main][mask]alphamerge=shortest=1,fps=10,split[s0][s1];[s0]palettegen[p];[s1][p]paletteuse",
                )
                .args(["-shortest", &output]);
        }
        PostprocessMode::TransparentGifWithBg => {
            let overlay = path_str(config.overlay_image.as_ref().ok_or(PostprocessError::MissingAuxiliaryInput {
                mode: config.mode,
            })?)?;
            command
                .args(["-i", &input, "-i", &matte, "-i", &overlay, "-filter_complex"])
                .arg(
                    "[1][0]scale2ref[mask][main];[main][mask]alphamerge=shortest=1[fg];[2][fg]overlay=(main_w-overlay_w)/2:(main_h-overlay_h)/2:format=auto,fps=10,split[s0][s1];[s0]palettegen[p];[s1][p]paletteuse",
                )
                .args(["-shortest", &output]);
        }
    }

    let output_status = command
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map_err(PostprocessError::Filter)?;

    if !output_status.success() {
        return Err(PostprocessError::FilterExit(output_status.code()));
    }
    Ok(())
}

fn path_str(path: &Path) -> Result<String, PostprocessError> {
    path.to_str()
        .map(ToString::to_string)
        .ok_or_else(|| PostprocessError::InvalidPath(path.to_path_buf()))
}

/// Error type for post-processing failures.
#[derive(Debug, Error)]
pub enum PostprocessError {
    /// The composite mode's required auxiliary input was not supplied.
    #[error("mode {mode:?} requires an auxiliary input that was not supplied")]
    MissingAuxiliaryInput {
        /// The mode that failed validation.
        mode: PostprocessMode,
    },
    /// The scoped temporary directory could not be created or used.
    #[error("temporary directory error: {0}")]
    TempDir(#[source] std::io::Error),
    /// A path contained non-UTF-8 bytes.
    #[error("path is not valid UTF-8: {0:?}")]
    InvalidPath(PathBuf),
    /// The matte-key pass failed.
    #[error("matte-key pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
    /// The second-pass `ffmpeg` filter-graph invocation could not be spawned.
    #[error("filter-graph invocation error: {0}")]
    Filter(#[source] std::io::Error),
    /// The second-pass `ffmpeg` filter-graph invocation exited non-zero.
    #[error("filter-graph invocation exited with status {0:?}")]
    FilterExit(Option<i32>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_policy_picks_qtrle_for_mp4() {
        let (codec, pix_fmt) = resolve_alpha_codec(Path::new("out.mp4"), &AlphaCodec::Auto);
        assert_eq!(codec, "qtrle");
        assert_eq!(pix_fmt, "argb");
    }

    #[test]
    fn auto_policy_picks_vp9_for_webm() {
        let (codec, pix_fmt) = resolve_alpha_codec(Path::new("out.webm"), &AlphaCodec::Auto);
        assert_eq!(codec, "libvpx-vp9");
        assert_eq!(pix_fmt, "yuva420p");
    }

    #[test]
    fn explicit_prores_profile_selected_for_yuva444p10le() {
        let (codec, pix_fmt) = resolve_alpha_codec(
            Path::new("out.mov"),
            &AlphaCodec::Explicit("yuva444p10le".to_string()),
        );
        assert_eq!(codec, "prores_ks");
        assert_eq!(pix_fmt, "yuva444p10le");
    }

    #[test]
    fn config_rejects_missing_overlay_video() {
        let error = PostprocessConfig::new(
            PostprocessMode::TransparentOverVideo,
            PathBuf::from("in.mp4"),
            PathBuf::from("out.mov"),
            None,
            None,
            AlphaCodec::Auto,
        )
        .unwrap_err();
        assert!(matches!(error, PostprocessError::MissingAuxiliaryInput { .. }));
    }

    #[test]
    fn config_accepts_matte_key_without_overlays() {
        let config = PostprocessConfig::new(
            PostprocessMode::MatteKey,
            PathBuf::from("in.mp4"),
            PathBuf::from("out.mp4"),
            None,
            None,
            AlphaCodec::Auto,
        )
        .expect("matte key needs no overlay");
        assert_eq!(config.mode, PostprocessMode::MatteKey);
    }
}
