#![warn(missing_docs)]
//! # bgremove-stillimage
//!
//! ## Purpose
//! Applies the segmentation model to a single decoded image: naive alpha
//! cutout, closed-form alpha-matting cutout, mask-only output, and
//! background compositing.
//!
//! ## Responsibilities
//! - Run one [`bgremove_engine::Engine::infer_image`] call to get a mask at
//!   the image's native spatial size.
//! - Build an RGBA cutout, either by naive alpha compositing or by a
//!   trimap-driven closed-form-style alpha matte.
//! - Composite the cutout over a supplied background image or solid colour.
//!
//! ## Data flow
//! `bgremove-cli`'s still-image path decodes an input image, calls
//! [`remove_background`], and encodes the result as PNG.
//!
//! ## Ownership and lifetimes
//! Every stage produces a new owned buffer; no stage mutates its input in
//! place, so intermediate `image` buffers can be freely reordered or dropped.
//!
//! ## Error model
//! [`StillImageError::MissingAuxiliaryInput`] covers the `PipelineConfig`
//! error kind for a composite call made without a background.

use bgremove_engine::{Engine, EngineError};
use image::{DynamicImage, GrayImage, ImageBuffer, Luma, Rgba, RgbaImage};
use thiserror::Error;

/// Validated still-image cutout configuration.
#[derive(Debug, Clone)]
pub struct StillImageConfig {
    /// If set, return the raw mask instead of a cutout.
    pub only_mask: bool,
    /// If set, use closed-form alpha matting instead of a naive cutout.
    pub alpha_matting: bool,
    /// Trimap foreground threshold (mask value above which a pixel is
    /// considered definite foreground before erosion).
    pub alpha_matting_foreground_threshold: u8,
    /// Trimap background threshold (mask value below which a pixel is
    /// considered definite background before erosion).
    pub alpha_matting_background_threshold: u8,
    /// Structuring-element size for the trimap's binary erosion pass.
    pub alpha_matting_erode_structure_size: u32,
    /// Image is downsampled to at most this dimension before matting, for
    /// tractable solving, then the result is resized back.
    pub alpha_matting_base_size: u32,
    /// Optional solid background colour to composite over.
    pub background_color: Option<[u8; 3]>,
    /// Optional background image to composite over; takes precedence over
    /// `background_color` when both are set.
    pub background_image: Option<DynamicImage>,
}

impl StillImageConfig {
    /// Constructs a still-image config with the standard default
    /// alpha-matting thresholds.
    pub fn new(only_mask: bool, alpha_matting: bool) -> Self {
        Self {
            only_mask,
            alpha_matting,
            alpha_matting_foreground_threshold: 240,
            alpha_matting_background_threshold: 10,
            alpha_matting_erode_structure_size: 10,
            alpha_matting_base_size: 1000,
            background_color: None,
            background_image: None,
        }
    }
}

impl Default for StillImageConfig {
    fn default() -> Self {
        Self::new(false, false)
    }
}

/// Removes the background from `image`, returning the requested output per
/// `config`.
///
/// # Errors
/// Returns [`StillImageError::Engine`] if inference fails.
pub fn remove_background(
    image: &DynamicImage,
    engine: &Engine,
    config: &StillImageConfig,
) -> Result<DynamicImage, StillImageError> {
    let rgb = image.to_rgb8();
    let (width, height) = (rgb.width(), rgb.height());
    tracing::info!(width, height, alpha_matting = config.alpha_matting, only_mask = config.only_mask, "running still-image cutout");
    let mask_bytes = engine.infer_image(rgb.as_raw(), width, height)?;
    let mask = GrayImage::from_raw(width, height, mask_bytes)
        .expect("infer_image returns width*height bytes");

    if config.only_mask {
        return Ok(DynamicImage::ImageLuma8(mask));
    }

    let cutout = if config.alpha_matting {
        alpha_matting_cutout(&rgb, &mask, config)
    } else {
        naive_cutout(&rgb, &mask)
    };

    let composited = composite_background(cutout, config);
    Ok(DynamicImage::ImageRgba8(composited))
}

/// Composites the source image over a transparent canvas using `mask` as the
/// alpha channel, resized to the image's size.
fn naive_cutout(image: &ImageBuffer<image::Rgb<u8>, Vec<u8>>, mask: &GrayImage) -> RgbaImage {
    let (width, height) = image.dimensions();
    let resized_mask = if mask.dimensions() == (width, height) {
        mask.clone()
    } else {
        image::imageops::resize(mask, width, height, image::imageops::FilterType::Triangle)
    };

    let mut out = RgbaImage::new(width, height);
    for y in 0..height {
        for x in 0..width {
            let p = image.get_pixel(x, y).0;
            let alpha = resized_mask.get_pixel(x, y).0[0];
            out.put_pixel(x, y, Rgba([p[0], p[1], p[2], alpha]));
        }
    }
    out
}

/// Downsamples to `alpha_matting_base_size`, builds a trimap from `mask`,
/// estimates a continuous alpha via a local colour-line (guided-filter)
/// solve, decontaminates the foreground colour against the background's mean
/// colour, then resizes the RGBA result back to the original size.
fn alpha_matting_cutout(
    image: &ImageBuffer<image::Rgb<u8>, Vec<u8>>,
    mask: &GrayImage,
    config: &StillImageConfig,
) -> RgbaImage {
    let (orig_width, orig_height) = image.dimensions();
    let (work_width, work_height) = thumbnail_dims(orig_width, orig_height, config.alpha_matting_base_size);

    let small_image = image::imageops::resize(
        image,
        work_width,
        work_height,
        image::imageops::FilterType::Lanczos3,
    );
    let small_mask = image::imageops::resize(
        mask,
        work_width,
        work_height,
        image::imageops::FilterType::Lanczos3,
    );

    let trimap = build_trimap(
        &small_mask,
        config.alpha_matting_foreground_threshold,
        config.alpha_matting_background_threshold,
        config.alpha_matting_erode_structure_size,
    );

    let alpha = estimate_alpha(&small_image, &trimap);
    let foreground = estimate_foreground(&small_image, &trimap, &alpha);

    let mut cutout = RgbaImage::new(work_width, work_height);
    for y in 0..work_height {
        for x in 0..work_width {
            let fg = foreground.get_pixel(x, y).0;
            let a = (alpha[(y * work_width + x) as usize] * 255.0).clamp(0.0, 255.0) as u8;
            cutout.put_pixel(x, y, Rgba([fg[0], fg[1], fg[2], a]));
        }
    }

    image::imageops::resize(
        &cutout,
        orig_width,
        orig_height,
        image::imageops::FilterType::Lanczos3,
    )
}

/// Computes thumbnail dimensions preserving aspect ratio so the longer side
/// is at most `base_size`.
fn thumbnail_dims(width: u32, height: u32, base_size: u32) -> (u32, u32) {
    let longest = width.max(height);
    if longest <= base_size || base_size == 0 {
        return (width.max(1), height.max(1));
    }
    let scale = base_size as f64 / longest as f64;
    (
        ((width as f64 * scale).round() as u32).max(1),
        ((height as f64 * scale).round() as u32).max(1),
    )
}

/// Three-valued trimap value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TrimapValue {
    Background,
    Unknown,
    Foreground,
}

/// Builds a trimap: threshold the mask into likely foreground/background,
/// erode both regions by `erode_size`, and label everything else unknown.
fn build_trimap(
    mask: &GrayImage,
    foreground_threshold: u8,
    background_threshold: u8,
    erode_size: u32,
) -> Vec<TrimapValue> {
    let (width, height) = mask.dimensions();
    let is_foreground: Vec<bool> = mask.pixels().map(|p| p.0[0] > foreground_threshold).collect();
    let is_background: Vec<bool> = mask.pixels().map(|p| p.0[0] < background_threshold).collect();

    let eroded_foreground = erode(&is_foreground, width, height, erode_size, false);
    let eroded_background = erode(&is_background, width, height, erode_size, true);

    (0..is_foreground.len())
        .map(|i| {
            if eroded_foreground[i] {
                TrimapValue::Foreground
            } else if eroded_background[i] {
                TrimapValue::Background
            } else {
                TrimapValue::Unknown
            }
        })
        .collect()
}

/// Binary erosion with a `k`×`k` square structuring element. Out-of-bounds
/// neighbours are treated as `border_value`.
fn erode(mask: &[bool], width: u32, height: u32, k: u32, border_value: bool) -> Vec<bool> {
    if k == 0 {
        return mask.to_vec();
    }
    let radius = (k as i32) / 2;
    let (w, h) = (width as i32, height as i32);
    let mut out = vec![false; mask.len()];
    for y in 0..h {
        for x in 0..w {
            let mut all_true = true;
            'window: for dy in -radius..=radius {
                for dx in -radius..=radius {
                    let (ny, nx) = (y + dy, x + dx);
                    let value = if ny < 0 || nx < 0 || ny >= h || nx >= w {
                        border_value
                    } else {
                        mask[(ny * w + nx) as usize]
                    };
                    if !value {
                        all_true = false;
                        break 'window;
                    }
                }
            }
            out[(y * w + x) as usize] = all_true;
        }
    }
    out
}

/// Estimates continuous alpha over the unknown trimap region via a guided
/// filter: a local linear model `alpha ≈ a*luma + b` fit per window, which
/// approximates the colour-line energy closed-form matting minimizes
/// without a global sparse solve.
fn estimate_alpha(image: &ImageBuffer<image::Rgb<u8>, Vec<u8>>, trimap: &[TrimapValue]) -> Vec<f32> {
    let (width, height) = image.dimensions();
    let n = (width * height) as usize;

    let luma: Vec<f32> = image
        .pixels()
        .map(|p| {
            let [r, g, b] = p.0;
            (0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32) / 255.0
        })
        .collect();

    let known: Vec<f32> = trimap
        .iter()
        .map(|t| match t {
            TrimapValue::Foreground => 1.0,
            TrimapValue::Background => 0.0,
            TrimapValue::Unknown => 0.5,
        })
        .collect();

    const RADIUS: i32 = 8;
    const EPS: f32 = 1e-4;

    let mean_i = box_filter(&luma, width, height, RADIUS);
    let mean_p = box_filter(&known, width, height, RADIUS);
    let ii: Vec<f32> = luma.iter().map(|v| v * v).collect();
    let ip: Vec<f32> = luma.iter().zip(&known).map(|(i, p)| i * p).collect();
    let mean_ii = box_filter(&ii, width, height, RADIUS);
    let mean_ip = box_filter(&ip, width, height, RADIUS);

    let mut a = vec![0f32; n];
    let mut b = vec![0f32; n];
    for i in 0..n {
        let var_i = mean_ii[i] - mean_i[i] * mean_i[i];
        let cov_ip = mean_ip[i] - mean_i[i] * mean_p[i];
        a[i] = cov_ip / (var_i + EPS);
        b[i] = mean_p[i] - a[i] * mean_i[i];
    }

    let mean_a = box_filter(&a, width, height, RADIUS);
    let mean_b = box_filter(&b, width, height, RADIUS);

    (0..n)
        .map(|i| match trimap[i] {
            TrimapValue::Foreground => 1.0,
            TrimapValue::Background => 0.0,
            TrimapValue::Unknown => (mean_a[i] * luma[i] + mean_b[i]).clamp(0.0, 1.0),
        })
        .collect()
}

/// Box filter via a summed-area table, for O(1)-per-pixel window means.
fn box_filter(values: &[f32], width: u32, height: u32, radius: i32) -> Vec<f32> {
    let (w, h) = (width as i32, height as i32);
    let mut integral = vec![0f64; ((w + 1) * (h + 1)) as usize];
    let stride = (w + 1) as usize;
    for y in 0..h {
        for x in 0..w {
            let v = values[(y * w + x) as usize] as f64;
            integral[(y + 1) as usize * stride + (x + 1) as usize] = v
                + integral[y as usize * stride + (x + 1) as usize]
                + integral[(y + 1) as usize * stride + x as usize]
                - integral[y as usize * stride + x as usize];
        }
    }

    let sum_rect = |x0: i32, y0: i32, x1: i32, y1: i32| -> f64 {
        let x0 = x0.clamp(0, w);
        let y0 = y0.clamp(0, h);
        let x1 = x1.clamp(0, w);
        let y1 = y1.clamp(0, h);
        integral[y1 as usize * stride + x1 as usize]
            - integral[y0 as usize * stride + x1 as usize]
            - integral[y1 as usize * stride + x0 as usize]
            + integral[y0 as usize * stride + x0 as usize]
    };

    let mut out = vec![0f32; (w * h) as usize];
    for y in 0..h {
        for x in 0..w {
            let x0 = x - radius;
            let y0 = y - radius;
            let x1 = (x + radius + 1).min(w);
            let y1 = (y + radius + 1).min(h);
            let count = ((x1 - x0.clamp(0, w)) * (y1 - y0.clamp(0, h))).max(1) as f64;
            out[(y * w + x) as usize] = (sum_rect(x0, y0, x1, y1) / count) as f32;
        }
    }
    out
}

/// Decontaminates foreground colour against a single global background mean
/// colour estimated from the trimap's definite-background pixels: a one-level
/// approximation of `estimate_foreground_ml`'s multi-level solve.
fn estimate_foreground(
    image: &ImageBuffer<image::Rgb<u8>, Vec<u8>>,
    trimap: &[TrimapValue],
    alpha: &[f32],
) -> ImageBuffer<image::Rgb<u8>, Vec<u8>> {
    let (width, height) = image.dimensions();
    let mut bg_sum = [0f64; 3];
    let mut bg_count = 0u64;
    for (pixel, t) in image.pixels().zip(trimap.iter()) {
        if *t == TrimapValue::Background {
            for c in 0..3 {
                bg_sum[c] += pixel.0[c] as f64;
            }
            bg_count += 1;
        }
    }
    let background_color = if bg_count > 0 {
        [
            (bg_sum[0] / bg_count as f64) as f32,
            (bg_sum[1] / bg_count as f64) as f32,
            (bg_sum[2] / bg_count as f64) as f32,
        ]
    } else {
        [0.0, 0.0, 0.0]
    };

    let mut out = ImageBuffer::new(width, height);
    for (index, pixel) in image.pixels().enumerate() {
        let a = alpha[index].max(1e-3);
        let mut channels = [0u8; 3];
        for c in 0..3 {
            let i = pixel.0[c] as f32;
            let b = background_color[c];
            let f = (i - (1.0 - a) * b) / a;
            channels[c] = f.clamp(0.0, 255.0) as u8;
        }
        out.put_pixel(
            (index as u32) % width,
            (index as u32) / width,
            image::Rgb(channels),
        );
    }
    out
}

/// Composites `cutout` over `config`'s background image or colour, if any.
/// Without a background, the cutout is returned as-is (transparent).
fn composite_background(cutout: RgbaImage, config: &StillImageConfig) -> RgbaImage {
    let (width, height) = cutout.dimensions();

    if let Some(background_image) = &config.background_image {
        let background = background_image.resize_exact(
            width,
            height,
            image::imageops::FilterType::Lanczos3,
        );
        let background_rgb = background.to_rgb8();
        return paste_over(&cutout, &background_rgb);
    }

    if let Some(color) = config.background_color {
        let background_rgb = ImageBuffer::from_pixel(width, height, image::Rgb(color));
        return paste_over(&cutout, &background_rgb);
    }

    cutout
}

fn paste_over(cutout: &RgbaImage, background: &ImageBuffer<image::Rgb<u8>, Vec<u8>>) -> RgbaImage {
    let (width, height) = cutout.dimensions();
    let mut out = RgbaImage::new(width, height);
    for y in 0..height {
        for x in 0..width {
            let fg = cutout.get_pixel(x, y).0;
            let bg = background.get_pixel(x, y).0;
            let alpha = fg[3] as f32 / 255.0;
            let blended = [
                (fg[0] as f32 * alpha + bg[0] as f32 * (1.0 - alpha)) as u8,
                (fg[1] as f32 * alpha + bg[1] as f32 * (1.0 - alpha)) as u8,
                (fg[2] as f32 * alpha + bg[2] as f32 * (1.0 - alpha)) as u8,
            ];
            out.put_pixel(x, y, Rgba([blended[0], blended[1], blended[2], 255]));
        }
    }
    out
}

/// Encodes a mask-only result as an 8-bit single-channel buffer for
/// callers that want to skip the [`DynamicImage`] abstraction.
pub fn mask_as_luma(mask: &[u8], width: u32, height: u32) -> GrayImage {
    ImageBuffer::<Luma<u8>, _>::from_raw(width, height, mask.to_vec())
        .expect("mask buffer must be width*height bytes")
}

/// Error type for still-image cutout failures.
#[derive(Debug, Error)]
pub enum StillImageError {
    /// A composite mode's required background input was not supplied.
    #[error("this still-image mode requires an auxiliary background input")]
    MissingAuxiliaryInput,
    /// The segmentation engine failed.
    #[error("segmentation engine error: {0}")]
    Engine(#[from] EngineError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use bgremove_core::{Device, ModelVariant};
    use bgremove_engine::SyntheticInferenceBackend;
    use image::Rgb;

    fn solid_image(width: u32, height: u32, color: [u8; 3]) -> ImageBuffer<Rgb<u8>, Vec<u8>> {
        ImageBuffer::from_pixel(width, height, Rgb(color))
    }

    #[test]
    fn thumbnail_dims_preserve_aspect_ratio() {
        let (w, h) = thumbnail_dims(2000, 1000, 1000);
        assert_eq!(w, 1000);
        assert_eq!(h, 500);
    }

    #[test]
    fn thumbnail_dims_noop_when_already_small() {
        assert_eq!(thumbnail_dims(100, 50, 1000), (100, 50));
    }

    #[test]
    fn naive_cutout_uses_mask_as_alpha() {
        let image = solid_image(4, 4, [10, 20, 30]);
        let mut mask = GrayImage::new(4, 4);
        for y in 0..4 {
            for x in 0..4 {
                let value = if x < 2 { 0 } else { 255 };
                mask.put_pixel(x, y, Luma([value]));
            }
        }
        let cutout = naive_cutout(&image, &mask);
        assert_eq!(cutout.get_pixel(0, 0).0[3], 0);
        assert_eq!(cutout.get_pixel(3, 0).0[3], 255);
    }

    #[test]
    fn erode_shrinks_true_region() {
        let width = 5;
        let height = 1;
        let mask = vec![false, true, true, true, false];
        let eroded = erode(&mask, width, height, 3, false);
        assert_eq!(eroded, vec![false, false, true, false, false]);
    }

    #[test]
    fn build_trimap_labels_thresholds() {
        let mut mask = GrayImage::new(3, 1);
        mask.put_pixel(0, 0, Luma([5]));
        mask.put_pixel(1, 0, Luma([128]));
        mask.put_pixel(2, 0, Luma([250]));
        let trimap = build_trimap(&mask, 240, 10, 0);
        assert_eq!(trimap[0], TrimapValue::Background);
        assert_eq!(trimap[1], TrimapValue::Unknown);
        assert_eq!(trimap[2], TrimapValue::Foreground);
    }

    #[test]
    fn remove_background_only_mask_returns_luma() {
        let engine = Engine::new_with_backend(
            ModelVariant::U2NetP,
            Device::Cpu,
            Box::new(SyntheticInferenceBackend),
        );
        let image = DynamicImage::ImageRgb8(solid_image(16, 16, [100, 100, 100]));
        let config = StillImageConfig::new(true, false);
        let result = remove_background(&image, &engine, &config).expect("should succeed");
        assert!(matches!(result, DynamicImage::ImageLuma8(_)));
    }

    #[test]
    fn remove_background_naive_cutout_returns_rgba() {
        let engine = Engine::new_with_backend(
            ModelVariant::U2NetP,
            Device::Cpu,
            Box::new(SyntheticInferenceBackend),
        );
        let image = DynamicImage::ImageRgb8(solid_image(16, 16, [200, 50, 50]));
        let config = StillImageConfig::new(false, false);
        let result = remove_background(&image, &engine, &config).expect("should succeed");
        assert!(matches!(result, DynamicImage::ImageRgba8(_)));
    }
}
