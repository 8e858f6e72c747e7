#![warn(missing_docs)]
//! # bgremove-engine
//!
//! ## Purpose
//! Selects a compute device and runs the segmentation network over batches of
//! frames, turning RGB pixels into foreground masks.
//!
//! ## Responsibilities
//! - Probe available compute devices in priority order.
//! - Load model weights (delegating acquisition to `bgremove-weights`) behind
//!   a pluggable [`InferenceBackend`] so the rest of the pipeline is testable
//!   without a real ONNX runtime session.
//! - Apply the exact pre/post-processing contract: resize to 320×320,
//!   single-mean normalization, first-head extraction, batch-wide min-max
//!   rescale to `[0,255]`, resize back to source spatial size.
//!
//! ## Data flow
//! `bgremove-pipeline` worker threads call [`Engine::infer`] once per batch;
//! the returned masks are ordered identically to the input frames.
//!
//! ## Ownership and lifetimes
//! [`Engine`] owns its backend exclusively; frames and masks are passed and
//! returned by value so a batch never outlives the call that produced it.
//!
//! ## Error model
//! [`EngineError`] distinguishes missing weights, corrupt weights, and device
//! initialization failure, the only locally-recovered kind.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use bgremove_core::{CoreError, Device, Frame, Mask, ModelVariant};
use bgremove_weights::WeightsError;
use image::{imageops::FilterType, GrayImage, ImageBuffer, Rgb};
use ndarray::Array4;
use thiserror::Error;

/// Square spatial size the network is evaluated at.
const NETWORK_SIZE: u32 = 320;

/// Per-channel normalization mean (applied identically to R, G, and B).
const NORM_MEAN: f32 = 0.485;

/// Per-channel normalization scale (applied identically to R, G, and B).
const NORM_STD: f32 = 0.229;

/// Probes available compute devices in priority order: GPU accelerator,
/// unified accelerator, else CPU.
///
/// This never fails: an accelerator probe failure simply yields the next
/// tier down, terminating at [`Device::Cpu`].
pub fn select_device() -> Device {
    if gpu_accelerator_available() {
        return Device::GpuAccelerator;
    }
    if unified_accelerator_available() {
        return Device::UnifiedAccelerator;
    }
    Device::Cpu
}

fn gpu_accelerator_available() -> bool {
    use ort::execution_providers::{CUDAExecutionProvider, ExecutionProvider};
    CUDAExecutionProvider::default()
        .is_available()
        .unwrap_or(false)
}

fn unified_accelerator_available() -> bool {
    use ort::execution_providers::{CoreMLExecutionProvider, ExecutionProvider};
    CoreMLExecutionProvider::default()
        .is_available()
        .unwrap_or(false)
}

/// A pluggable segmentation backend: NCHW float batch in, single-head float
/// batch out, both at [`NETWORK_SIZE`]×[`NETWORK_SIZE`].
///
/// The real backend wraps an `ort` session; tests and contract checks use a
/// deterministic synthetic implementation so pipeline-ordering invariants can
/// be verified without real model weights.
pub trait InferenceBackend: Send + Sync {
    /// Runs the network over `input`, shaped `[batch, 3, 320, 320]`.
    ///
    /// # Errors
    /// Returns [`EngineError::Backend`] on any backend-internal failure.
    fn run(&self, input: &Array4<f32>) -> Result<Array4<f32>, EngineError>;
}

/// Real backend wrapping an `ort` inference session loaded from a weights
/// file on disk.
pub struct OrtBackend {
    session: ort::session::Session,
}

impl OrtBackend {
    /// Loads an ONNX session for the weights at `path`, bound to `device`.
    ///
    /// # Errors
    /// Returns [`EngineError::ModelFileMissing`] if `path` does not exist,
    /// [`EngineError::DeviceInitFailed`] if `device`'s execution provider
    /// cannot be registered, or [`EngineError::ModelFileCorrupt`] if the file
    /// fails to deserialize as a valid model.
    pub fn load(path: &Path, device: Device) -> Result<Self, EngineError> {
        if !path.exists() {
            return Err(EngineError::ModelFileMissing(path.to_path_buf()));
        }
        let builder = ort::session::Session::builder().map_err(|source| EngineError::ModelFileCorrupt {
            path: path.to_path_buf(),
            source: source.to_string(),
        })?;
        let builder = with_device_execution_provider(builder, device)?;
        let session = builder.commit_from_file(path).map_err(|source| EngineError::ModelFileCorrupt {
            path: path.to_path_buf(),
            source: source.to_string(),
        })?;
        Ok(Self { session })
    }
}

/// Registers `device`'s execution provider on `builder`, leaving it
/// untouched for [`Device::Cpu`].
fn with_device_execution_provider(
    builder: ort::session::builder::SessionBuilder,
    device: Device,
) -> Result<ort::session::builder::SessionBuilder, EngineError> {
    match device {
        Device::GpuAccelerator => {
            use ort::execution_providers::{CUDAExecutionProvider, ExecutionProvider};
            builder
                .with_execution_providers([CUDAExecutionProvider::default().build()])
                .map_err(|source| EngineError::DeviceInitFailed {
                    device,
                    source: source.to_string(),
                })
        }
        Device::UnifiedAccelerator => {
            use ort::execution_providers::{CoreMLExecutionProvider, ExecutionProvider};
            builder
                .with_execution_providers([CoreMLExecutionProvider::default().build()])
                .map_err(|source| EngineError::DeviceInitFailed {
                    device,
                    source: source.to_string(),
                })
        }
        Device::Cpu => Ok(builder),
    }
}

impl InferenceBackend for OrtBackend {
    fn run(&self, input: &Array4<f32>) -> Result<Array4<f32>, EngineError> {
        let input_value = ort::value::Value::from_array(input.clone())
            .map_err(|error| EngineError::Backend(error.to_string()))?;
        let outputs = self
            .session
            .run(ort::inputs![input_value])
            .map_err(|error| EngineError::Backend(error.to_string()))?;
        let (shape, data) = outputs[0]
            .try_extract_raw_tensor::<f32>()
            .map_err(|error| EngineError::Backend(error.to_string()))?;
        let dims: Vec<usize> = shape.iter().map(|&d| d as usize).collect();
        Array4::from_shape_vec((dims[0], dims[1], dims[2], dims[3]), data.to_vec())
            .map_err(|error| EngineError::Backend(error.to_string()))
    }
}

/// Deterministic synthetic backend for tests and contract checks.
///
/// Produces a single-channel output equal to the mean of the three input
/// channels at every pixel, so downstream normalization and shape handling
/// can be exercised without a real model.
#[derive(Debug, Default)]
pub struct SyntheticInferenceBackend;

impl InferenceBackend for SyntheticInferenceBackend {
    fn run(&self, input: &Array4<f32>) -> Result<Array4<f32>, EngineError> {
        let (batch, _channels, height, width) = input.dim();
        let mut output = Array4::<f32>::zeros((batch, 1, height, width));
        for b in 0..batch {
            for y in 0..height {
                for x in 0..width {
                    let mean = (input[[b, 0, y, x]] + input[[b, 1, y, x]] + input[[b, 2, y, x]]) / 3.0;
                    output[[b, 0, y, x]] = mean;
                }
            }
        }
        Ok(output)
    }
}

/// Segmentation engine: a compute device, a model variant identity, and a
/// pluggable inference backend behind a stable pre/post-processing contract.
pub struct Engine {
    variant: ModelVariant,
    device: Device,
    backend: Box<dyn InferenceBackend>,
    specialized: AtomicBool,
}

impl Engine {
    /// Constructs an engine directly from a backend, bypassing weight
    /// resolution. Used by tests and by [`Engine::load`].
    pub fn new_with_backend(variant: ModelVariant, device: Device, backend: Box<dyn InferenceBackend>) -> Self {
        Self {
            variant,
            device,
            backend,
            specialized: AtomicBool::new(false),
        }
    }

    /// Resolves weights for `variant` (downloading if absent) and loads a
    /// real `ort`-backed engine bound to `device`.
    ///
    /// If `device` is an accelerator and its execution provider fails to
    /// initialize, this falls back to [`Device::Cpu`] once, logging a
    /// warning, rather than failing the run outright.
    ///
    /// # Errors
    /// Returns [`EngineError::Weights`] if acquisition fails,
    /// [`EngineError::ModelFileMissing`]/[`EngineError::ModelFileCorrupt`] if
    /// the resolved file cannot be loaded as a model, or
    /// [`EngineError::DeviceInitFailed`] if the CPU fallback itself fails to
    /// initialize.
    pub fn load(variant: ModelVariant, device: Device, home_dir: &Path) -> Result<Self, EngineError> {
        let path = bgremove_weights::ensure_weights(variant, home_dir)?;
        match OrtBackend::load(&path, device) {
            Ok(backend) => Ok(Self::new_with_backend(variant, device, Box::new(backend))),
            Err(EngineError::DeviceInitFailed { device: failed_device, source }) if failed_device != Device::Cpu => {
                tracing::warn!(
                    device = %failed_device,
                    %source,
                    "falling back to cpu after accelerator execution provider failed to initialize"
                );
                let backend = OrtBackend::load(&path, Device::Cpu)?;
                Ok(Self::new_with_backend(variant, Device::Cpu, Box::new(backend)))
            }
            Err(error) => Err(error),
        }
    }

    /// The model variant this engine was constructed with.
    pub fn variant(&self) -> ModelVariant {
        self.variant
    }

    /// The compute device this engine is bound to.
    pub fn device(&self) -> Device {
        self.device
    }

    /// Runs one batch through the network, returning masks in input order.
    ///
    /// All frames in `batch` must share the same width; this holds for every
    /// batch a worker schedules within a single pipeline run since frames all
    /// originate from one video.
    ///
    /// # Errors
    /// Returns [`EngineError::EmptyBatch`] for an empty slice,
    /// [`EngineError::BatchWidthMismatch`] if frames differ in width, or
    /// whatever the backend surfaces otherwise.
    pub fn infer(&self, batch: &[Frame]) -> Result<Vec<Mask>, EngineError> {
        let first = batch.first().ok_or(EngineError::EmptyBatch)?;
        let width = first.width;
        for frame in batch {
            if frame.width != width {
                return Err(EngineError::BatchWidthMismatch {
                    expected: width,
                    actual: frame.width,
                });
            }
        }

        self.note_specialization(batch.len(), width);

        let input = preprocess_batch(batch)?;
        let output = self.backend.run(&input)?;
        postprocess_batch(batch, &output)
    }

    /// Records the one-shot "specialize on first batch shape" event. With the
    /// `ort` backend there is no separate trace/compile step to perform; this
    /// only emits the informational log line once per engine instance.
    fn note_specialization(&self, batch_size: usize, width: u32) {
        if !self.specialized.swap(true, Ordering::SeqCst) {
            tracing::info!(batch_size, width, "specializing engine for first batch shape");
        }
    }

    /// Runs the network over a single arbitrary-sized RGB image, used by the
    /// still-image cutout path (`bgremove-stillimage`), which is not subject
    /// to the video pipeline's fixed 320-pixel frame height.
    ///
    /// Returns a grayscale mask buffer of `width * height` bytes.
    ///
    /// # Errors
    /// Returns [`EngineError::EmptyBatch`] if `rgb` does not match
    /// `width * height * 3` bytes, or whatever the backend surfaces.
    pub fn infer_image(&self, rgb: &[u8], width: u32, height: u32) -> Result<Vec<u8>, EngineError> {
        if rgb.len() != width as usize * height as usize * 3 {
            return Err(EngineError::EmptyBatch);
        }
        let image: ImageBuffer<Rgb<u8>, Vec<u8>> = ImageBuffer::from_raw(width, height, rgb.to_vec())
            .ok_or(EngineError::EmptyBatch)?;
        let resized = image::imageops::resize(&image, NETWORK_SIZE, NETWORK_SIZE, FilterType::Triangle);

        let mut tensor = Array4::<f32>::zeros((1, 3, NETWORK_SIZE as usize, NETWORK_SIZE as usize));
        for y in 0..NETWORK_SIZE {
            for x in 0..NETWORK_SIZE {
                let pixel = resized.get_pixel(x, y).0;
                for c in 0..3 {
                    let normalized = (pixel[c] as f32 / 255.0 - NORM_MEAN) / NORM_STD;
                    tensor[[0, c, y as usize, x as usize]] = normalized;
                }
            }
        }

        let output = self.backend.run(&tensor)?;
        let (_batch, _channels, out_h, out_w) = output.dim();

        let mut min = f32::INFINITY;
        let mut max = f32::NEG_INFINITY;
        for y in 0..out_h {
            for x in 0..out_w {
                let value = output[[0, 0, y, x]];
                min = min.min(value);
                max = max.max(value);
            }
        }
        let range = (max - min).max(f32::EPSILON);

        let mut gray = GrayImage::new(out_w as u32, out_h as u32);
        for y in 0..out_h {
            for x in 0..out_w {
                let value = output[[0, 0, y, x]];
                let scaled = ((value - min) / range * 255.0).clamp(0.0, 255.0) as u8;
                gray.put_pixel(x as u32, y as u32, image::Luma([scaled]));
            }
        }

        let resized_back = image::imageops::resize(&gray, width, height, FilterType::Triangle);
        Ok(resized_back.into_raw())
    }
}

/// Channel-first, 320×320, normalized batch ready for the network.
fn preprocess_batch(batch: &[Frame]) -> Result<Array4<f32>, EngineError> {
    let mut tensor = Array4::<f32>::zeros((batch.len(), 3, NETWORK_SIZE as usize, NETWORK_SIZE as usize));
    for (b, frame) in batch.iter().enumerate() {
        let image: ImageBuffer<Rgb<u8>, Vec<u8>> =
            ImageBuffer::from_raw(frame.width, bgremove_core::PIPELINE_HEIGHT, frame.rgb.clone())
                .ok_or(EngineError::EmptyBatch)?;
        let resized = image::imageops::resize(&image, NETWORK_SIZE, NETWORK_SIZE, FilterType::Triangle);
        for y in 0..NETWORK_SIZE {
            for x in 0..NETWORK_SIZE {
                let pixel = resized.get_pixel(x, y).0;
                for c in 0..3 {
                    let normalized = (pixel[c] as f32 / 255.0 - NORM_MEAN) / NORM_STD;
                    tensor[[b, c, y as usize, x as usize]] = normalized;
                }
            }
        }
    }
    Ok(tensor)
}

/// Extracts the first output head, rescales it batch-wide to `[0,255]`, and
/// resizes each mask back to its source frame's spatial size.
fn postprocess_batch(batch: &[Frame], output: &Array4<f32>) -> Result<Vec<Mask>, EngineError> {
    let (out_batch, _channels, out_h, out_w) = output.dim();
    if out_batch != batch.len() {
        return Err(EngineError::Backend(format!(
            "backend returned {out_batch} masks for a batch of {}",
            batch.len()
        )));
    }

    let mut min = f32::INFINITY;
    let mut max = f32::NEG_INFINITY;
    for b in 0..out_batch {
        for y in 0..out_h {
            for x in 0..out_w {
                let value = output[[b, 0, y, x]];
                min = min.min(value);
                max = max.max(value);
            }
        }
    }
    let range = (max - min).max(f32::EPSILON);

    let mut masks = Vec::with_capacity(batch.len());
    for (b, frame) in batch.iter().enumerate() {
        let mut gray = GrayImage::new(out_w as u32, out_h as u32);
        for y in 0..out_h {
            for x in 0..out_w {
                let value = output[[b, 0, y, x]];
                let scaled = ((value - min) / range * 255.0).clamp(0.0, 255.0) as u8;
                gray.put_pixel(x as u32, y as u32, image::Luma([scaled]));
            }
        }
        let resized = image::imageops::resize(
            &gray,
            frame.width,
            bgremove_core::PIPELINE_HEIGHT,
            FilterType::Triangle,
        );
        let mask = Mask::new(frame.index, frame.width, resized.into_raw())?;
        masks.push(mask);
    }
    Ok(masks)
}

/// Error type for segmentation engine failures.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The resolved weights file does not exist.
    #[error("model weights file missing at {0}")]
    ModelFileMissing(std::path::PathBuf),
    /// The resolved weights file exists but failed to deserialize.
    #[error("model weights file at {path} is corrupt: {source}")]
    ModelFileCorrupt {
        /// Path of the corrupt weights file.
        path: std::path::PathBuf,
        /// Backend-reported deserialization failure.
        source: String,
    },
    /// The requested device's execution provider failed to initialize.
    #[error("failed to initialize {device} execution provider: {source}")]
    DeviceInitFailed {
        /// Device whose execution provider failed to register.
        device: Device,
        /// Backend-reported initialization failure.
        source: String,
    },
    /// An empty batch was passed to [`Engine::infer`].
    #[error("inference batch must contain at least one frame")]
    EmptyBatch,
    /// Frames within a single batch had differing widths.
    #[error("batch width mismatch: expected {expected}, got {actual}")]
    BatchWidthMismatch {
        /// Width of the first frame in the batch.
        expected: u32,
        /// Width of a later frame that diverged.
        actual: u32,
    },
    /// The inference backend failed internally.
    #[error("inference backend error: {0}")]
    Backend(String),
    /// Weight acquisition failed.
    #[error("weight acquisition failed: {0}")]
    Weights(#[from] WeightsError),
    /// A core data-model validation failed while building the result.
    #[error("core validation error: {0}")]
    Core(#[from] CoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_frame(index: u64, width: u32, value: u8) -> Frame {
        Frame::new(index, width, vec![value; width as usize * bgremove_core::PIPELINE_HEIGHT as usize * 3])
            .expect("frame should be valid")
    }

    #[test]
    fn synthetic_engine_produces_one_mask_per_frame() {
        let engine = Engine::new_with_backend(
            ModelVariant::U2NetP,
            Device::Cpu,
            Box::new(SyntheticInferenceBackend),
        );
        let batch = vec![flat_frame(0, 64, 200), flat_frame(1, 64, 200)];
        let masks = engine.infer(&batch).expect("inference should succeed");
        assert_eq!(masks.len(), 2);
        assert_eq!(masks[0].width, 64);
        assert_eq!(masks[0].gray.len(), 64 * bgremove_core::PIPELINE_HEIGHT as usize);
    }

    #[test]
    fn infer_rejects_empty_batch() {
        let engine = Engine::new_with_backend(
            ModelVariant::U2NetP,
            Device::Cpu,
            Box::new(SyntheticInferenceBackend),
        );
        let error = engine.infer(&[]).unwrap_err();
        assert!(matches!(error, EngineError::EmptyBatch));
    }

    #[test]
    fn infer_rejects_mismatched_widths() {
        let engine = Engine::new_with_backend(
            ModelVariant::U2NetP,
            Device::Cpu,
            Box::new(SyntheticInferenceBackend),
        );
        let batch = vec![flat_frame(0, 64, 100), flat_frame(1, 32, 100)];
        let error = engine.infer(&batch).unwrap_err();
        assert!(matches!(error, EngineError::BatchWidthMismatch { .. }));
    }

    #[test]
    fn uniform_input_yields_uniform_mask() {
        let engine = Engine::new_with_backend(
            ModelVariant::U2Net,
            Device::Cpu,
            Box::new(SyntheticInferenceBackend),
        );
        let batch = vec![flat_frame(0, 16, 123)];
        let masks = engine.infer(&batch).expect("inference should succeed");
        // A constant-valued frame has zero variance, so min == max and the
        // batch-wide range floor keeps output well-defined.
        assert!(masks[0].gray.iter().all(|&v| v == masks[0].gray[0]));
    }

    #[test]
    fn infer_image_handles_non_pipeline_height() {
        let engine = Engine::new_with_backend(
            ModelVariant::U2NetP,
            Device::Cpu,
            Box::new(SyntheticInferenceBackend),
        );
        let rgb = vec![128u8; 100 * 50 * 3];
        let mask = engine.infer_image(&rgb, 100, 50).expect("inference should succeed");
        assert_eq!(mask.len(), 100 * 50);
    }
}
