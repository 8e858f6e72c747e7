#![warn(missing_docs)]
//! # bgremove-weights
//!
//! ## Purpose
//! Acquires segmentation model weight files into a per-user cache, with
//! size-sanity validation and retry/backoff.
//!
//! ## Responsibilities
//! - Resolve a [`bgremove_core::ModelVariant`]'s cache path, honouring the
//!   `U2NET_PATH` / `U2NETP_PATH` environment overrides.
//! - Download the variant's part URLs in order and concatenate them.
//! - Reject implausibly small downloads and retry with exponential backoff.
//!
//! ## Data flow
//! `bgremove-engine` calls [`ensure_weights`] before constructing a real
//! inference session; this crate is the only one that talks to the network.
//!
//! ## Ownership and lifetimes
//! Downloads are streamed directly to the destination file; no full response
//! body is held in memory beyond a single part at a time.
//!
//! ## Error model
//! All failure modes collapse into [`WeightsError`], which the engine surfaces
//! as its `ModelAcquisition` error kind.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bgremove_core::ModelVariant;
use serde::Serialize;
use thiserror::Error;

/// Default number of download attempts before giving up.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Minimum plausible file size in bytes; anything smaller is definitely wrong.
const MIN_SANE_BYTES: u64 = 1_000;

/// Fraction of the expected size a download must reach to be accepted.
const MIN_SIZE_FRACTION: f64 = 0.5;

/// Returns the GitHub-hosted part URLs for `variant`, in download order.
///
/// `u2net` and `u2net_human_seg` are split into four parts; `u2netp` is a
/// single part.
pub fn part_urls(variant: ModelVariant) -> &'static [&'static str] {
    match variant {
        ModelVariant::U2Net => &[
            "https://github.com/nadermx/backgroundremover/raw/main/models/u2aa",
            "https://github.com/nadermx/backgroundremover/raw/main/models/u2ab",
            "https://github.com/nadermx/backgroundremover/raw/main/models/u2ac",
            "https://github.com/nadermx/backgroundremover/raw/main/models/u2ad",
        ],
        ModelVariant::U2NetHumanSeg => &[
            "https://github.com/nadermx/backgroundremover/raw/main/models/u2haa",
            "https://github.com/nadermx/backgroundremover/raw/main/models/u2hab",
            "https://github.com/nadermx/backgroundremover/raw/main/models/u2hac",
            "https://github.com/nadermx/backgroundremover/raw/main/models/u2had",
        ],
        ModelVariant::U2NetP => {
            &["https://github.com/nadermx/backgroundremover/raw/main/models/u2netp.pth"]
        }
    }
}

/// Resolves the cache path for `variant`: the environment override if set,
/// else `${HOME}/.u2net/{variant}.pth`.
pub fn resolve_path(variant: ModelVariant, home_dir: &Path) -> PathBuf {
    if let Ok(overridden) = std::env::var(variant.path_env_var()) {
        if !overridden.is_empty() {
            return PathBuf::from(overridden);
        }
    }
    home_dir.join(".u2net").join(format!("{}.pth", variant.name()))
}

/// Ensures weights for `variant` exist at their resolved path, downloading
/// them if absent.
///
/// # Errors
/// Returns [`WeightsError`] if the destination directory cannot be created
/// or every download attempt fails.
pub fn ensure_weights(variant: ModelVariant, home_dir: &Path) -> Result<PathBuf, WeightsError> {
    let path = resolve_path(variant, home_dir);
    if path.exists() {
        return Ok(path);
    }
    download_with_retry(variant, &path, DEFAULT_MAX_RETRIES)?;
    Ok(path)
}

/// Downloads `variant`'s weight parts to `path`, retrying up to `max_retries`
/// times with `2^attempt` second exponential backoff between attempts.
///
/// Any partial file from a failed attempt is removed before the next retry
/// and after the final failure.
///
/// # Errors
/// Returns [`WeightsError::Network`] or [`WeightsError::SizeSanity`] wrapped
/// in [`WeightsError::Exhausted`] once retries are spent.
pub fn download_with_retry(
    variant: ModelVariant,
    path: &Path,
    max_retries: u32,
) -> Result<(), WeightsError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| WeightsError::Destination {
            path: path.to_path_buf(),
            source,
        })?;
    }

    let mut last_error: Option<WeightsError> = None;
    for attempt in 0..max_retries {
        let _ = std::fs::remove_file(path);
        match download_once(variant, path) {
            Ok(()) => return Ok(()),
            Err(error) => {
                tracing::warn!(variant = variant.name(), attempt, %error, "weight download attempt failed");
                let _ = std::fs::remove_file(path);
                last_error = Some(error);
                if attempt + 1 < max_retries {
                    std::thread::sleep(Duration::from_secs(2u64.pow(attempt)));
                }
            }
        }
    }
    Err(WeightsError::Exhausted {
        variant: variant.name(),
        attempts: max_retries,
        source: Box::new(last_error.expect("at least one attempt runs when max_retries > 0")),
    })
}

fn download_once(variant: ModelVariant, path: &Path) -> Result<(), WeightsError> {
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(60))
        .build()
        .map_err(WeightsError::Network)?;

    let mut out = std::fs::File::create(path).map_err(|source| WeightsError::Destination {
        path: path.to_path_buf(),
        source,
    })?;

    let parts = part_urls(variant);
    for (index, url) in parts.iter().enumerate() {
        tracing::info!(variant = variant.name(), part = index + 1, total = parts.len(), url, "downloading weight part");
        let response = client
            .get(*url)
            .send()
            .and_then(reqwest::blocking::Response::error_for_status)
            .map_err(WeightsError::Network)?;
        let bytes = response.bytes().map_err(WeightsError::Network)?;
        out.write_all(&bytes)
            .map_err(|source| WeightsError::Destination {
                path: path.to_path_buf(),
                source,
            })?;
    }
    out.flush().map_err(|source| WeightsError::Destination {
        path: path.to_path_buf(),
        source,
    })?;
    drop(out);

    validate_size(variant, path)
}

fn validate_size(variant: ModelVariant, path: &Path) -> Result<(), WeightsError> {
    let metadata = std::fs::metadata(path).map_err(|source| WeightsError::Destination {
        path: path.to_path_buf(),
        source,
    })?;
    let actual = metadata.len();
    let expected = variant.expected_size_bytes();

    if actual < MIN_SANE_BYTES {
        return Err(WeightsError::SizeSanity {
            variant: variant.name(),
            actual,
            expected,
        });
    }
    if (actual as f64) < expected as f64 * MIN_SIZE_FRACTION {
        return Err(WeightsError::SizeSanity {
            variant: variant.name(),
            actual,
            expected,
        });
    }
    Ok(())
}

/// JSON-serializable row describing one model variant's acquisition
/// parameters, for operational logging and support tooling.
#[derive(Debug, Clone, Serialize)]
pub struct WeightVariantInfo {
    /// Canonical variant name.
    pub name: &'static str,
    /// Number of part URLs concatenated to build the weights file.
    pub part_count: usize,
    /// Approximate expected file size in bytes.
    pub expected_size_bytes: u64,
}

/// Builds the metadata table for every known model variant.
pub fn variant_manifest() -> Vec<WeightVariantInfo> {
    [ModelVariant::U2Net, ModelVariant::U2NetP, ModelVariant::U2NetHumanSeg]
        .into_iter()
        .map(|variant| WeightVariantInfo {
            name: variant.name(),
            part_count: part_urls(variant).len(),
            expected_size_bytes: variant.expected_size_bytes(),
        })
        .collect()
}

/// Error type for weight acquisition failures.
#[derive(Debug, Error)]
pub enum WeightsError {
    /// The destination path could not be created, written, or read back.
    #[error("weight destination error at {path}: {source}")]
    Destination {
        /// Destination path that failed.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// A network-level failure occurred fetching a part URL.
    #[error("weight download network error: {0}")]
    Network(#[source] reqwest::Error),
    /// The downloaded file failed the size-sanity check.
    #[error("downloaded weight file for {variant} is too small ({actual} bytes, expected ~{expected} bytes)")]
    SizeSanity {
        /// Variant name being validated.
        variant: &'static str,
        /// Actual downloaded size in bytes.
        actual: u64,
        /// Expected approximate size in bytes.
        expected: u64,
    },
    /// All retry attempts were exhausted.
    #[error("failed to download weights for {variant} after {attempts} attempts: {source}")]
    Exhausted {
        /// Variant name being downloaded.
        variant: &'static str,
        /// Number of attempts made.
        attempts: u32,
        /// The last attempt's failure.
        #[source]
        source: Box<WeightsError>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variant_manifest_lists_all_three_variants_with_matching_part_counts() {
        let manifest = variant_manifest();
        assert_eq!(manifest.len(), 3);
        let u2netp = manifest.iter().find(|row| row.name == "u2netp").unwrap();
        assert_eq!(u2netp.part_count, 1);
        let u2net = manifest.iter().find(|row| row.name == "u2net").unwrap();
        assert_eq!(u2net.part_count, 4);
    }

    #[test]
    fn part_urls_has_four_parts_for_large_variants() {
        assert_eq!(part_urls(ModelVariant::U2Net).len(), 4);
        assert_eq!(part_urls(ModelVariant::U2NetHumanSeg).len(), 4);
    }

    #[test]
    fn part_urls_has_one_part_for_small_variant() {
        assert_eq!(part_urls(ModelVariant::U2NetP).len(), 1);
    }

    #[test]
    fn resolve_path_defaults_under_home() {
        let home = PathBuf::from("/home/tester");
        std::env::remove_var("U2NET_PATH");
        let path = resolve_path(ModelVariant::U2Net, &home);
        assert_eq!(path, home.join(".u2net").join("u2net.pth"));
    }

    #[test]
    fn resolve_path_honours_env_override() {
        std::env::set_var("U2NETP_PATH", "/tmp/custom/u2netp.pth");
        let path = resolve_path(ModelVariant::U2NetP, &PathBuf::from("/home/tester"));
        assert_eq!(path, PathBuf::from("/tmp/custom/u2netp.pth"));
        std::env::remove_var("U2NETP_PATH");
    }

    #[test]
    fn ensure_weights_returns_existing_path_without_downloading() {
        let dir = tempfile::tempdir().expect("tempdir");
        let weights_dir = dir.path().join(".u2net");
        std::fs::create_dir_all(&weights_dir).expect("mkdir");
        let existing = weights_dir.join("u2netp.pth");
        std::fs::write(&existing, vec![0u8; 4_500_000]).expect("write stub weights");
        std::env::remove_var("U2NETP_PATH");

        let resolved = ensure_weights(ModelVariant::U2NetP, dir.path()).expect("should find existing file");
        assert_eq!(resolved, existing);
    }

    #[test]
    fn validate_size_rejects_truncated_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("u2netp.pth");
        std::fs::write(&path, vec![0u8; 10]).expect("write tiny file");
        let error = validate_size(ModelVariant::U2NetP, &path).unwrap_err();
        assert!(matches!(error, WeightsError::SizeSanity { .. }));
    }
}
