#![warn(missing_docs)]
//! # bgremove-cli
//!
//! ## Purpose
//! Parses arguments into a validated run configuration and drives either the
//! still-image cutout path or the concurrent video pipeline.
//!
//! ## Responsibilities
//! - Validate CLI input into a [`RunRequest`]: exactly one output mode for
//!   the video path, required auxiliary inputs present, numeric parameters
//!   non-zero.
//! - Classify the input path as image or video by extension.
//! - Translate any subsystem error into a one-line remediation hint and a
//!   non-zero process exit.
//!
//! ## Error model
//! [`CliError`] aggregates every subsystem crate's error type via `#[from]`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bgremove_core::{Device, FrameRate, ModelVariant};
use bgremove_engine::{Engine, EngineError};
use bgremove_pipeline::{PipelineConfig, PipelineConfigError, PipelineError};
use bgremove_postprocess::{AlphaCodec, PostprocessConfig, PostprocessError, PostprocessMode};
use bgremove_source::SourceError;
use bgremove_stillimage::{StillImageConfig, StillImageError};
use bgremove_weights::WeightsError;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "webp", "tiff", "tif"];

/// Which top-level path a run takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunKind {
    /// Single-image cutout.
    StillImage,
    /// Concurrent video pipeline, possibly followed by a post-processing
    /// second pass.
    Video,
}

/// Classifies `path` as [`RunKind::StillImage`] or [`RunKind::Video`] by
/// file extension.
pub fn classify_input(path: &Path) -> RunKind {
    let is_image = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.iter().any(|candidate| candidate.eq_ignore_ascii_case(ext)))
        .unwrap_or(false);
    if is_image {
        RunKind::StillImage
    } else {
        RunKind::Video
    }
}

/// Validated, immutable description of one CLI invocation.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Input media path.
    pub input: PathBuf,
    /// Output path.
    pub output: PathBuf,
    /// Segmentation model variant.
    pub model_variant: ModelVariant,
    /// Video pipeline worker count.
    pub worker_nodes: u64,
    /// Video pipeline GPU batch size.
    pub gpu_batchsize: u64,
    /// Video pipeline prefetch depth in batches.
    pub prefetched_batches: u64,
    /// Optional frame-rate override.
    pub frame_rate_override: Option<FrameRate>,
    /// Optional cap on frames processed.
    pub frame_limit: Option<u64>,
    /// Video output mode.
    pub postprocess_mode: PostprocessMode,
    /// Background/overlay video, for [`PostprocessMode::TransparentOverVideo`].
    pub overlay_video: Option<PathBuf>,
    /// Background/overlay image, for image-overlay modes and still-image
    /// background compositing.
    pub overlay_image: Option<PathBuf>,
    /// Alpha codec policy for composite video modes.
    pub alpha_codec: AlphaCodec,
    /// Still-image-only: return the raw mask instead of a cutout.
    pub only_mask: bool,
    /// Still-image-only: use alpha-matting instead of a naive cutout.
    pub alpha_matting: bool,
    /// Still-image-only: trimap foreground threshold.
    pub alpha_matting_foreground_threshold: u8,
    /// Still-image-only: trimap background threshold.
    pub alpha_matting_background_threshold: u8,
    /// Still-image-only: trimap erosion structuring-element size.
    pub alpha_matting_erode_size: u32,
    /// Still-image-only: downsample size for tractable matting.
    pub alpha_matting_base_size: u32,
    /// Still-image-only: solid background colour to composite over.
    pub background_color: Option<[u8; 3]>,
}

impl RunRequest {
    /// Which run path this request takes.
    pub fn kind(&self) -> RunKind {
        classify_input(&self.input)
    }
}

/// Runs one invocation end-to-end: resolves the device and engine, then
/// dispatches to the still-image or video path.
///
/// # Errors
/// Returns [`CliError`] on any subsystem failure.
pub fn execute(request: &RunRequest, home_dir: &Path) -> Result<(), CliError> {
    let device = bgremove_engine::select_device();
    tracing::info!(?device, model = request.model_variant.name(), "selected compute device");

    let engine = Arc::new(Engine::load(request.model_variant, device, home_dir)?);

    match request.kind() {
        RunKind::StillImage => execute_still_image(request, &engine),
        RunKind::Video => execute_video(request, device, &engine),
    }
}

fn execute_still_image(request: &RunRequest, engine: &Engine) -> Result<(), CliError> {
    let input_image = image::open(&request.input).map_err(|error| CliError::InputFormat(error.to_string()))?;

    let background_image = match &request.overlay_image {
        Some(path) => Some(image::open(path).map_err(|error| CliError::InputFormat(error.to_string()))?),
        None => None,
    };

    let config = StillImageConfig {
        only_mask: request.only_mask,
        alpha_matting: request.alpha_matting,
        alpha_matting_foreground_threshold: request.alpha_matting_foreground_threshold,
        alpha_matting_background_threshold: request.alpha_matting_background_threshold,
        alpha_matting_erode_structure_size: request.alpha_matting_erode_size,
        alpha_matting_base_size: request.alpha_matting_base_size,
        background_color: request.background_color,
        background_image,
    };

    let result = bgremove_stillimage::remove_background(&input_image, engine, &config)?;
    result
        .save_with_format(&request.output, image::ImageFormat::Png)
        .map_err(|error| CliError::Encode(error.to_string()))
}

fn execute_video(request: &RunRequest, device: Device, engine: &Arc<Engine>) -> Result<(), CliError> {
    let pipeline_config = PipelineConfig::new(
        request.model_variant,
        device,
        request.worker_nodes,
        request.gpu_batchsize,
        request.prefetched_batches,
        request.frame_rate_override,
    )?;

    let input_str = request
        .input
        .to_str()
        .ok_or_else(|| CliError::InputFormat(format!("{:?} is not valid UTF-8", request.input)))?;

    if request.postprocess_mode == PostprocessMode::MatteKey {
        bgremove_pipeline::run(
            input_str,
            request.output.clone(),
            &pipeline_config,
            Arc::clone(engine),
            request.frame_limit,
        )?;
        return Ok(());
    }

    let postprocess_config = PostprocessConfig::new(
        request.postprocess_mode,
        request.input.clone(),
        request.output.clone(),
        request.overlay_video.clone(),
        request.overlay_image.clone(),
        request.alpha_codec.clone(),
    )?;

    bgremove_postprocess::run(&postprocess_config, &pipeline_config, Arc::clone(engine), request.frame_limit)?;
    Ok(())
}

/// Returns a one-line, user-facing remediation hint for `error`.
pub fn remediation_hint(error: &CliError) -> &'static str {
    match error {
        CliError::InputFormat(_) => "check that the input path exists and is a readable image or video",
        CliError::Encode(_) => "check that the output path is writable",
        CliError::PipelineConfig(_) => "pass --worker-nodes, --gpu-batchsize, and --prefetched-batches as positive integers",
        CliError::Postprocess(PostprocessError::MissingAuxiliaryInput { .. }) => {
            "this output mode needs --overlay (video) or --background-image (image)"
        }
        CliError::Postprocess(_) => "check that ffmpeg is installed and on PATH",
        CliError::Source(SourceError::NoVideoStream) => "the input file has no video stream",
        CliError::Source(SourceError::UnknownFrameRate(_)) => "pass --framerate to override the undetectable frame rate",
        CliError::Source(_) => "check that ffprobe/ffmpeg are installed and on PATH",
        CliError::Engine(EngineError::ModelFileMissing(_)) => "weights could not be downloaded; check network access",
        CliError::Engine(EngineError::ModelFileCorrupt { path, .. }) => {
            tracing::error!(?path, "delete the corrupt weights file and re-run to re-download");
            "delete the corrupt weights file and re-run to re-download"
        }
        CliError::Engine(_) => "check the selected model and device are supported",
        CliError::Weights(_) => "check network access to github.com and disk space under your home directory",
        CliError::Pipeline(PipelineError::WorkerDied { .. }) => "reduce --worker-nodes and re-run",
        CliError::Pipeline(_) => "re-run with a smaller --gpu-batchsize or fewer --worker-nodes",
        CliError::StillImage(_) => "check the input image and any --background-image path",
    }
}

/// Aggregated CLI-facing error type.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// The input or an auxiliary image could not be decoded.
    #[error("input format error: {0}")]
    InputFormat(String),
    /// The output image could not be encoded.
    #[error("output encode error: {0}")]
    Encode(String),
    /// Pipeline configuration validation failed.
    #[error("pipeline configuration error: {0}")]
    PipelineConfig(#[from] PipelineConfigError),
    /// Post-processing failed.
    #[error("post-processing error: {0}")]
    Postprocess(#[from] PostprocessError),
    /// The frame source failed.
    #[error("frame source error: {0}")]
    Source(#[from] SourceError),
    /// The segmentation engine failed.
    #[error("segmentation engine error: {0}")]
    Engine(#[from] EngineError),
    /// Weight acquisition failed.
    #[error("weight acquisition error: {0}")]
    Weights(#[from] WeightsError),
    /// The video pipeline failed.
    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
    /// The still-image cutout failed.
    #[error("still-image error: {0}")]
    StillImage(#[from] StillImageError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_input_detects_images() {
        assert_eq!(classify_input(Path::new("photo.jpg")), RunKind::StillImage);
        assert_eq!(classify_input(Path::new("photo.PNG")), RunKind::StillImage);
    }

    #[test]
    fn classify_input_defaults_to_video() {
        assert_eq!(classify_input(Path::new("clip.mp4")), RunKind::Video);
        assert_eq!(classify_input(Path::new("clip.webm")), RunKind::Video);
        assert_eq!(classify_input(Path::new("no_extension")), RunKind::Video);
    }

    #[test]
    fn remediation_hint_covers_worker_died() {
        let error = CliError::Pipeline(PipelineError::WorkerDied { slot: 3 });
        assert_eq!(remediation_hint(&error), "reduce --worker-nodes and re-run");
    }
}
