#![warn(missing_docs)]
//! # bgremove-core
//!
//! ## Purpose
//! Defines the pure data model shared across the background-removal workspace.
//!
//! ## Responsibilities
//! - Represent decoded video frames and the masks the segmentation engine
//!   produces for them.
//! - Describe the compute device selected for a run and the three
//!   segmentation model variants.
//! - Provide the deterministic batch/slot scheduling math that assigns frame
//!   indices to workers and worker outputs to result slots.
//!
//! ## Data flow
//! The frame source emits [`Frame`] values tagged by index; the worker pool
//! consumes contiguous index ranges computed by [`worker_batch_indices`] and
//! emits [`Mask`] batches into the slot sequence computed by
//! [`worker_slot_sequence`].
//!
//! ## Ownership and lifetimes
//! Frames and masks own their pixel buffers outright so they can cross thread
//! boundaries without borrow coupling between pipeline stages.
//!
//! ## Error model
//! Shape and configuration validation failures return [`CoreError`] variants
//! with caller-actionable categorization.
//!
//! ## Example
//! ```rust
//! use bgremove_core::{worker_batch_indices, worker_slot_sequence};
//!
//! let batches = worker_batch_indices(0, 2, 4, 50);
//! assert_eq!(batches[0], vec![0, 1, 2, 3]);
//! let slots: Vec<u64> = worker_slot_sequence(0, 2).take(2).collect();
//! assert_eq!(slots, vec![1, 3]);
//! ```

use thiserror::Error;

/// Pipeline frame height; every decoded frame is rescaled to this value.
pub const PIPELINE_HEIGHT: u32 = 320;

/// An immutable RGB frame decoded from the input container.
///
/// Invariant: `rgb.len() == width as usize * PIPELINE_HEIGHT as usize * 3`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// 0-based index assigned by the frame source, in emission order.
    pub index: u64,
    /// Frame width in pixels; height is always [`PIPELINE_HEIGHT`].
    pub width: u32,
    /// Row-major RGB pixel bytes, no padding.
    pub rgb: Vec<u8>,
}

impl Frame {
    /// Constructs a validated frame.
    ///
    /// # Errors
    /// Returns [`CoreError::InvalidFrameShape`] when `rgb` is not exactly
    /// `width * PIPELINE_HEIGHT * 3` bytes.
    pub fn new(index: u64, width: u32, rgb: Vec<u8>) -> Result<Self, CoreError> {
        let expected = required_plane_len(width, PIPELINE_HEIGHT, 3)?;
        if rgb.len() != expected {
            return Err(CoreError::InvalidFrameShape {
                expected,
                actual: rgb.len(),
            });
        }
        Ok(Self { index, width, rgb })
    }
}

/// An 8-bit single-channel foreground mask aligned to a source [`Frame`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mask {
    /// Index of the source frame this mask was produced from.
    pub index: u64,
    /// Mask width in pixels; height is always [`PIPELINE_HEIGHT`].
    pub width: u32,
    /// Row-major grayscale pixel bytes, no padding. 0 = background, 255 = foreground.
    pub gray: Vec<u8>,
}

impl Mask {
    /// Constructs a validated mask.
    ///
    /// # Errors
    /// Returns [`CoreError::InvalidFrameShape`] when `gray` is not exactly
    /// `width * PIPELINE_HEIGHT` bytes.
    pub fn new(index: u64, width: u32, gray: Vec<u8>) -> Result<Self, CoreError> {
        let expected = required_plane_len(width, PIPELINE_HEIGHT, 1)?;
        if gray.len() != expected {
            return Err(CoreError::InvalidFrameShape {
                expected,
                actual: gray.len(),
            });
        }
        Ok(Self { index, width, gray })
    }
}

/// Compute device selected for a run.
///
/// Selection is computed once (see `bgremove-engine`'s device probe) and
/// threaded explicitly through the engine constructor; this type carries no
/// hidden process-wide state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    /// A discrete GPU accelerator (e.g. CUDA).
    GpuAccelerator,
    /// A unified/integrated accelerator (e.g. Apple Metal/MPS).
    UnifiedAccelerator,
    /// CPU-only execution.
    Cpu,
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Device::GpuAccelerator => "gpu",
            Device::UnifiedAccelerator => "unified",
            Device::Cpu => "cpu",
        };
        f.write_str(label)
    }
}

/// The three interchangeable segmentation model variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelVariant {
    /// Full-size general-purpose model (~176 MB).
    U2Net,
    /// Lightweight general-purpose model (~4.5 MB).
    U2NetP,
    /// Full-size model specialized for human subjects (~176 MB).
    U2NetHumanSeg,
}

impl ModelVariant {
    /// Parses a variant from its CLI/config name.
    ///
    /// # Errors
    /// Returns [`CoreError::UnknownModelVariant`] for any other string.
    pub fn parse(name: &str) -> Result<Self, CoreError> {
        match name {
            "u2net" => Ok(ModelVariant::U2Net),
            "u2netp" => Ok(ModelVariant::U2NetP),
            "u2net_human_seg" => Ok(ModelVariant::U2NetHumanSeg),
            other => Err(CoreError::UnknownModelVariant(other.to_string())),
        }
    }

    /// Canonical cache file stem, e.g. `u2net` for `u2net.pth`.
    pub fn name(&self) -> &'static str {
        match self {
            ModelVariant::U2Net => "u2net",
            ModelVariant::U2NetP => "u2netp",
            ModelVariant::U2NetHumanSeg => "u2net_human_seg",
        }
    }

    /// Environment variable that overrides this variant's cache path.
    pub fn path_env_var(&self) -> &'static str {
        match self {
            ModelVariant::U2NetP => "U2NETP_PATH",
            ModelVariant::U2Net | ModelVariant::U2NetHumanSeg => "U2NET_PATH",
        }
    }

    /// Approximate expected file size in bytes, used for download sanity checks.
    pub fn expected_size_bytes(&self) -> u64 {
        match self {
            ModelVariant::U2Net | ModelVariant::U2NetHumanSeg => 176_000_000,
            ModelVariant::U2NetP => 4_500_000,
        }
    }
}

/// A frame rate expressed as an exact rational, matching the container's
/// probed `r_frame_rate` string (e.g. `30000/1001`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRate {
    /// Rational numerator.
    pub numerator: u64,
    /// Rational denominator; never zero for a valid frame rate.
    pub denominator: u64,
}

impl FrameRate {
    /// Parses a `"num/den"` rational string as probed from the container.
    ///
    /// # Errors
    /// Returns [`CoreError::UnknownFrameRate`] for `"0/0"`, a malformed
    /// string, or a zero denominator.
    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        let (num_str, den_str) = raw
            .split_once('/')
            .ok_or_else(|| CoreError::UnknownFrameRate(raw.to_string()))?;
        let numerator: u64 = num_str
            .parse()
            .map_err(|_| CoreError::UnknownFrameRate(raw.to_string()))?;
        let denominator: u64 = den_str
            .parse()
            .map_err(|_| CoreError::UnknownFrameRate(raw.to_string()))?;
        if denominator == 0 {
            return Err(CoreError::UnknownFrameRate(raw.to_string()));
        }
        Ok(Self {
            numerator,
            denominator,
        })
    }

    /// The `num/den` argument string passed to the encoder's `-r` flag.
    pub fn as_arg_string(&self) -> String {
        format!("{}/{}", self.numerator, self.denominator)
    }

    /// Floating-point approximation, for logging only.
    pub fn as_f64(&self) -> f64 {
        self.numerator as f64 / self.denominator as f64
    }
}

/// Probed metadata describing an input video's shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoMetadata {
    /// Total frame count the pipeline will emit, after any frame-limit cap.
    pub total_frames: u64,
    /// Probed (or overridden) frame rate.
    pub frame_rate: FrameRate,
    /// Frame width after rescaling to [`PIPELINE_HEIGHT`].
    pub width: u32,
}

/// Computes the ordered frame-index batches owned by worker `worker` out of
/// `worker_count` workers, given batch size `batch_size` and `total_frames`.
///
/// Worker *w*'s *k*-th batch covers indices `w*B + k*N*B .. w*B + k*N*B + B`,
/// clipped to `total_frames`. The interleaving guarantees that the union of
/// all workers' batches covers `0..total_frames` exactly once (see
/// `bgremove-contract-tests` for the cover-and-no-overlap property check).
pub fn worker_batch_indices(
    worker: u64,
    worker_count: u64,
    batch_size: u64,
    total_frames: u64,
) -> Vec<Vec<u64>> {
    if worker_count == 0 || batch_size == 0 {
        return Vec::new();
    }
    let mut batches = Vec::new();
    let mut k = 0u64;
    loop {
        let start = worker * batch_size + k * worker_count * batch_size;
        if start >= total_frames {
            break;
        }
        let end = (start + batch_size).min(total_frames);
        batches.push((start..end).collect());
        k += 1;
    }
    batches
}

/// Returns the infinite output-slot sequence for worker `worker`: `w+1`,
/// `w+1+N`, `w+1+2N`, ….
pub fn worker_slot_sequence(worker: u64, worker_count: u64) -> impl Iterator<Item = u64> {
    let worker_count = worker_count.max(1);
    (0u64..).map(move |k| worker + 1 + k * worker_count)
}

/// Total number of output slots a run with `total_frames`/`batch_size` produces.
pub fn total_slot_count(total_frames: u64, batch_size: u64) -> u64 {
    if batch_size == 0 {
        return 0;
    }
    total_frames.div_ceil(batch_size)
}

fn required_plane_len(width: u32, height: u32, channels: usize) -> Result<usize, CoreError> {
    let pixels = (width as usize)
        .checked_mul(height as usize)
        .ok_or(CoreError::DimensionOverflow)?;
    pixels.checked_mul(channels).ok_or(CoreError::DimensionOverflow)
}

/// Error type for core domain validation failures.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Pixel buffer length does not match the declared geometry.
    #[error("invalid frame shape: expected {expected} bytes, got {actual}")]
    InvalidFrameShape {
        /// Expected buffer length in bytes.
        expected: usize,
        /// Actual buffer length in bytes.
        actual: usize,
    },
    /// Frame or mask dimensions overflow when computing a buffer length.
    #[error("frame dimensions overflow")]
    DimensionOverflow,
    /// An unrecognized model variant name was supplied.
    #[error("unknown model variant: {0}")]
    UnknownModelVariant(String),
    /// The container reported `0/0` or an otherwise unparsable frame rate.
    #[error("could not detect frame rate: {0}")]
    UnknownFrameRate(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_rejects_mismatched_length() {
        let err = Frame::new(0, 4, vec![0; 10]).unwrap_err();
        assert!(matches!(err, CoreError::InvalidFrameShape { .. }));
    }

    #[test]
    fn frame_rate_parses_rational() {
        let rate = FrameRate::parse("30000/1001").unwrap();
        assert_eq!(rate.numerator, 30000);
        assert_eq!(rate.denominator, 1001);
        assert_eq!(rate.as_arg_string(), "30000/1001");
    }

    #[test]
    fn frame_rate_rejects_zero_over_zero() {
        assert!(matches!(
            FrameRate::parse("0/0"),
            Err(CoreError::UnknownFrameRate(_))
        ));
    }

    #[test]
    fn worker_batches_cover_without_overlap() {
        let total_frames = 50;
        let worker_count = 2;
        let batch_size = 4;
        let mut covered = Vec::new();
        for worker in 0..worker_count {
            for batch in worker_batch_indices(worker, worker_count, batch_size, total_frames) {
                covered.extend(batch);
            }
        }
        covered.sort_unstable();
        let expected: Vec<u64> = (0..total_frames).collect();
        assert_eq!(covered, expected);
    }

    #[test]
    fn worker_batches_match_scenario_s2() {
        let batches0 = worker_batch_indices(0, 2, 4, 50);
        assert_eq!(batches0[0], vec![0, 1, 2, 3]);
        assert_eq!(batches0[1], vec![8, 9, 10, 11]);
        let batches1 = worker_batch_indices(1, 2, 4, 50);
        assert_eq!(batches1[0], vec![4, 5, 6, 7]);
        assert_eq!(batches1[1], vec![12, 13, 14, 15]);
    }

    #[test]
    fn slot_sequence_is_monotone_per_worker() {
        let slots: Vec<u64> = worker_slot_sequence(1, 3).take(3).collect();
        assert_eq!(slots, vec![2, 5, 8]);
    }

    #[test]
    fn total_slot_count_rounds_up() {
        assert_eq!(total_slot_count(50, 4), 13);
        assert_eq!(total_slot_count(0, 4), 0);
    }
}
