use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{command, value_parser, Arg, ArgAction};
use image::{Rgb, RgbImage};
use ndarray::{ArrayView3, Axis};
use satellite_sr::{
    augment::{Augmenter, Variant},
    logging,
    raster::Resample,
    Error, Result,
};
use tracing::{error, info};

/// Maps normalized values in [-1, 1] back to 8-bit RGB.
fn to_rgb8(image: ArrayView3<f32>) -> RgbImage {
    let (rows, cols, _) = image.dim();
    let byte = |v: f32| ((v.clamp(-1.0, 1.0) + 1.0) * 127.5).round() as u8;

    RgbImage::from_fn(cols as u32, rows as u32, |x, y| {
        let (r, c) = (y as usize, x as usize);
        Rgb([
            byte(image[[r, c, 0]]),
            byte(image[[r, c, 1]]),
            byte(image[[r, c, 2]]),
        ])
    })
}

fn preview(input: &Path, out_dir: &Path, resample: Resample) -> Result<()> {
    std::fs::create_dir_all(out_dir)?;
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(Variant::ALL.len())
        .build()?;

    let stack = Augmenter::default().augment_file(&pool, input, resample)?;
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());

    for (variant, image) in Variant::ALL.iter().zip(stack.axis_iter(Axis(0))) {
        let path = out_dir.join(format!("{stem}_{}.png", variant.name()));
        to_rgb8(image)
            .save(&path)
            .map_err(|source| Error::ImageSave {
                path: path.clone(),
                source,
            })?;
        info!("wrote {}", path.display());
    }
    Ok(())
}

fn main() -> ExitCode {
    logging::init("info");

    let matches = command!()
        .about("Write the six augmentations of one raster as PNG files")
        .args([
            Arg::new("input")
                .required(true)
                .value_parser(value_parser!(PathBuf))
                .help("GeoTIFF with at least three bands"),
            Arg::new("out")
                .long("out")
                .default_value("preview")
                .value_parser(value_parser!(PathBuf))
                .help("Output directory"),
            Arg::new("downsample")
                .long("downsample")
                .action(ArgAction::SetTrue)
                .help("Decode as a low resolution input"),
            Arg::new("scale-factor")
                .long("scale-factor")
                .default_value("0.25")
                .value_parser(value_parser!(f64))
                .help("Downsampling factor"),
        ])
        .get_matches();

    let (Some(input), Some(out_dir)) = (
        matches.get_one::<PathBuf>("input"),
        matches.get_one::<PathBuf>("out"),
    ) else {
        unreachable!("input is required and out has a default");
    };
    let resample = if matches.get_flag("downsample") {
        Resample::Nearest {
            scale_factor: matches.get_one::<f64>("scale-factor").copied().unwrap_or(0.25),
        }
    } else {
        Resample::Full
    };

    match preview(input, out_dir, resample) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}
