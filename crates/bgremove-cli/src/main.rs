//! Command-line entry point: parses arguments, builds a [`RunRequest`], and
//! exits with a caller-actionable message on failure.

use std::path::PathBuf;
use std::process::ExitCode;

use bgremove_cli::{execute, remediation_hint, RunRequest};
use bgremove_core::{FrameRate, ModelVariant};
use bgremove_postprocess::{AlphaCodec, PostprocessMode};
use clap::Parser;

/// Removes the background from a video or still image using a local
/// segmentation model.
#[derive(Parser, Debug)]
#[command(name = "bgremove", version, about)]
struct Args {
    /// Input video or image path.
    input: PathBuf,

    /// Output path.
    #[arg(short = 'o', long = "output")]
    output: PathBuf,

    /// Segmentation model variant: u2net, u2netp, or u2net_human_seg.
    #[arg(short = 'm', long = "model", default_value = "u2net")]
    model: String,

    /// Number of parallel worker threads.
    #[arg(short = 'w', long = "workernodes", default_value_t = 1)]
    workernodes: u64,

    /// Frames per inference batch.
    #[arg(short = 'g', long = "gpubatchsize", default_value_t = 2)]
    gpubatchsize: u64,

    /// Prefetch depth in batches.
    #[arg(long = "prefetchedbatches", default_value_t = 4)]
    prefetchedbatches: u64,

    /// Frame rate override, e.g. "30000/1001"; by default it is probed.
    #[arg(long = "framerate")]
    framerate: Option<String>,

    /// Cap the number of frames processed.
    #[arg(long = "framelimit")]
    framelimit: Option<u64>,

    /// Emit the raw matte-key video with no second pass.
    #[arg(long = "mattekey")]
    mattekey: bool,

    /// Emit a transparent video with an alpha channel.
    #[arg(long = "transparentvideo")]
    transparentvideo: bool,

    /// Composite a transparent video over `--overlay`.
    #[arg(long = "transparentvideoovervideo")]
    transparentvideoovervideo: bool,

    /// Composite a transparent video over `--overlay-image`.
    #[arg(long = "transparentvideooverimage")]
    transparentvideooverimage: bool,

    /// Emit a transparent animated GIF.
    #[arg(long = "transparentgif")]
    transparentgif: bool,

    /// Emit a transparent animated GIF composited over `--overlay-image`.
    #[arg(long = "transparentgifwithbackground")]
    transparentgifwithbackground: bool,

    /// Overlay video for `--transparentvideoovervideo`.
    #[arg(long = "overlay")]
    overlay: Option<PathBuf>,

    /// Overlay/background image for image-overlay modes and still-image
    /// background compositing.
    #[arg(long = "background-image")]
    background_image: Option<PathBuf>,

    /// Solid background colour for still images, as "R,G,B".
    #[arg(long = "background-color")]
    background_color: Option<String>,

    /// Alpha-capable codec override, e.g. "yuva420p"; default picks per
    /// container.
    #[arg(long = "alpha-codec")]
    alpha_codec: Option<String>,

    /// Still images only: return the raw mask instead of a cutout.
    #[arg(long = "only-mask")]
    only_mask: bool,

    /// Still images only: use alpha matting instead of a naive cutout.
    #[arg(short = 'a', long = "alpha-matting")]
    alpha_matting: bool,

    /// Still images only: trimap foreground threshold.
    #[arg(long = "alpha-matting-foreground-threshold", default_value_t = 240)]
    alpha_matting_foreground_threshold: u8,

    /// Still images only: trimap background threshold.
    #[arg(long = "alpha-matting-background-threshold", default_value_t = 10)]
    alpha_matting_background_threshold: u8,

    /// Still images only: trimap erosion structuring-element size.
    #[arg(long = "alpha-matting-erode-size", default_value_t = 10)]
    alpha_matting_erode_size: u32,

    /// Still images only: downsample size for tractable matting.
    #[arg(long = "alpha-matting-base-size", default_value_t = 1000)]
    alpha_matting_base_size: u32,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt().with_target(false).init();

    let args = Args::parse();

    let request = match build_request(&args) {
        Ok(request) => request,
        Err(message) => {
            eprintln!("bgremove: {message}");
            return ExitCode::FAILURE;
        }
    };

    let home_dir = match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home),
        None => {
            eprintln!("bgremove: HOME is not set; cannot locate or download model weights");
            return ExitCode::FAILURE;
        }
    };

    match execute(&request, &home_dir) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("bgremove: {error}");
            eprintln!("  hint: {}", remediation_hint(&error));
            ExitCode::FAILURE
        }
    }
}

fn build_request(args: &Args) -> Result<RunRequest, String> {
    let model_variant = ModelVariant::parse(&args.model).map_err(|error| error.to_string())?;

    let frame_rate_override = match &args.framerate {
        Some(raw) => Some(FrameRate::parse(raw).map_err(|error| error.to_string())?),
        None => None,
    };

    let selected_modes = [
        args.mattekey,
        args.transparentvideo,
        args.transparentvideoovervideo,
        args.transparentvideooverimage,
        args.transparentgif,
        args.transparentgifwithbackground,
    ]
    .iter()
    .filter(|selected| **selected)
    .count();
    if selected_modes > 1 {
        return Err("only one of the video output mode flags may be set".to_string());
    }

    let postprocess_mode = if args.transparentvideo {
        PostprocessMode::TransparentVideo
    } else if args.transparentvideoovervideo {
        PostprocessMode::TransparentOverVideo
    } else if args.transparentvideooverimage {
        PostprocessMode::TransparentOverImage
    } else if args.transparentgif {
        PostprocessMode::TransparentGif
    } else if args.transparentgifwithbackground {
        PostprocessMode::TransparentGifWithBg
    } else {
        PostprocessMode::MatteKey
    };

    let alpha_codec = match &args.alpha_codec {
        Some(pix_fmt) => AlphaCodec::Explicit(pix_fmt.clone()),
        None => AlphaCodec::Auto,
    };

    let background_color = match &args.background_color {
        Some(raw) => Some(parse_color(raw)?),
        None => None,
    };

    Ok(RunRequest {
        input: args.input.clone(),
        output: args.output.clone(),
        model_variant,
        worker_nodes: args.workernodes,
        gpu_batchsize: args.gpubatchsize,
        prefetched_batches: args.prefetchedbatches,
        frame_rate_override,
        frame_limit: args.framelimit,
        postprocess_mode,
        overlay_video: args.overlay.clone(),
        overlay_image: args.background_image.clone(),
        alpha_codec,
        only_mask: args.only_mask,
        alpha_matting: args.alpha_matting,
        alpha_matting_foreground_threshold: args.alpha_matting_foreground_threshold,
        alpha_matting_background_threshold: args.alpha_matting_background_threshold,
        alpha_matting_erode_size: args.alpha_matting_erode_size,
        alpha_matting_base_size: args.alpha_matting_base_size,
        background_color,
    })
}

fn parse_color(raw: &str) -> Result<[u8; 3], String> {
    let parts: Vec<&str> = raw.split(',').collect();
    if parts.len() != 3 {
        return Err(format!("background color must be \"R,G,B\", got {raw:?}"));
    }
    let mut channels = [0u8; 3];
    for (slot, part) in channels.iter_mut().zip(parts) {
        *slot = part
            .trim()
            .parse()
            .map_err(|_| format!("background color channel {part:?} is not a byte"))?;
    }
    Ok(channels)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_color_accepts_triples() {
        assert_eq!(parse_color("255, 0, 128").unwrap(), [255, 0, 128]);
    }

    #[test]
    fn parse_color_rejects_wrong_arity() {
        assert!(parse_color("1,2").is_err());
    }
}
