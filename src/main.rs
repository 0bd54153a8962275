use std::path::PathBuf;
use std::process::ExitCode;

use burn::prelude::*;
use clap::{command, value_parser, Arg, ArgAction, ArgMatches, Command};
use ndarray::Axis;
use satellite_sr::{
    data::NormalizerConfig,
    loader::BatchSource,
    logging,
    metrics::{nearest_upsample, psnr, TracingSink},
    training::{prepare, PipelineConfig},
    Error, Result,
};
use tracing::error;

const DEFAULT_ARTIFACT_DIR: &str = "/tmp/satellite-sr";

fn cli() -> Command {
    command!()
        .subcommand_required(true)
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .short('v')
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Log every decoded file and fetched batch"),
        )
        .subcommand(
            Command::new("inspect")
                .about("Pair the training images and report counts")
                .args(pipeline_args()),
        )
        .subcommand(
            Command::new("fetch")
                .about("Build one batch and report its shapes and PSNR")
                .args(pipeline_args())
                .arg(
                    Arg::new("index")
                        .long("index")
                        .required(true)
                        .value_parser(value_parser!(usize))
                        .help("Batch index"),
                ),
        )
        .subcommand(
            Command::new("prepare")
                .about("Validate the pipeline and write config.json / params.json")
                .args(pipeline_args())
                .arg(
                    Arg::new("config")
                        .long("config")
                        .value_parser(value_parser!(PathBuf))
                        .conflicts_with("data-dir")
                        .help("Load the pipeline config from a JSON file"),
                ),
        )
}

fn pipeline_args() -> [Arg; 5] {
    [
        Arg::new("data-dir")
            .long("data-dir")
            .value_parser(value_parser!(PathBuf))
            .help("Directory holding images/train/{low,high}"),
        Arg::new("artifact-dir")
            .long("artifact-dir")
            .default_value(DEFAULT_ARTIFACT_DIR)
            .help("Directory for config.json and params.json"),
        Arg::new("batch-size")
            .long("batch-size")
            .default_value("4")
            .value_parser(value_parser!(usize))
            .help("Image pairs per batch"),
        Arg::new("scale-factor")
            .long("scale-factor")
            .default_value("0.25")
            .value_parser(value_parser!(f64))
            .help("Downsampling factor for low resolution images"),
        Arg::new("workers")
            .long("workers")
            .default_value("6")
            .value_parser(value_parser!(usize))
            .help("Worker threads"),
    ]
}

fn config_from(matches: &ArgMatches) -> Result<PipelineConfig> {
    if let Some(path) = matches.try_get_one::<PathBuf>("config").ok().flatten() {
        return PipelineConfig::load(path).map_err(|e| Error::InvalidParameter {
            name: "config".to_string(),
            reason: e.to_string(),
        });
    }

    let data_dir = matches
        .get_one::<PathBuf>("data-dir")
        .ok_or_else(|| Error::InvalidParameter {
            name: "data-dir".to_string(),
            reason: "required unless --config is given".to_string(),
        })?;
    // defaults are registered for every remaining argument
    let artifact_dir = matches.get_one::<String>("artifact-dir").cloned().unwrap_or_default();
    let batch_size = matches.get_one::<usize>("batch-size").copied().unwrap_or(4);
    let scale_factor = matches.get_one::<f64>("scale-factor").copied().unwrap_or(0.25);
    let workers = matches.get_one::<usize>("workers").copied().unwrap_or(6);

    Ok(PipelineConfig::new(
        data_dir.to_string_lossy().into_owned(),
        artifact_dir,
        NormalizerConfig::new(),
    )
    .with_batch_size(batch_size)
    .with_scale_factor(scale_factor)
    .with_num_workers(workers))
}

fn inspect(config: &PipelineConfig) -> Result<()> {
    let loader = config.init_loader(&TracingSink)?;

    println!("Number of image pairs: {}", loader.pairs().len());
    println!("Batch size: {}", loader.batch_size());
    println!("Number of batches: {}", loader.length());
    for (low, high) in loader.pairs().iter().take(5) {
        println!("  {} <-> {}", low.display(), high.display());
    }
    Ok(())
}

fn fetch(config: &PipelineConfig, index: usize) -> Result<()> {
    let loader = config.init_loader(&TracingSink)?;
    let batch = loader.fetch_by_index(index)?;

    let (min, max) = batch
        .high
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    println!("Low resolution batch: {:?}", batch.low.shape());
    println!("High resolution batch: {:?}", batch.high.shape());
    println!("High resolution value range: [{min:.3}, {max:.3}]");

    let (low_rows, high_rows) = (batch.low.len_of(Axis(1)), batch.high.len_of(Axis(1)));
    if low_rows > 0 && high_rows % low_rows == 0 {
        let upsampled = nearest_upsample(batch.low.view(), high_rows / low_rows)?;
        if upsampled.shape() == batch.high.shape() {
            let range = f64::from(config.normalizer.out_max - config.normalizer.out_min);
            let value = psnr(upsampled.view(), batch.high.view(), range)?;
            println!("PSNR (nearest upsampled input vs target) = {value:.3} dB");
        }
    }

    let device = Default::default();
    let tensors = batch.to_tensors::<burn::backend::NdArray>(&device);
    println!(
        "Tensor shapes: low {:?}, high {:?}",
        tensors.low.dims(),
        tensors.high.dims()
    );
    Ok(())
}

fn run(matches: &ArgMatches) -> Result<()> {
    match matches.subcommand() {
        Some(("inspect", sub)) => inspect(&config_from(sub)?),
        Some(("fetch", sub)) => {
            let index = sub.get_one::<usize>("index").copied().unwrap_or_default();
            fetch(&config_from(sub)?, index)
        }
        Some(("prepare", sub)) => {
            let config = config_from(sub)?;
            let loader = prepare(&config)?;
            println!(
                "Prepared {} pairs in {} batches, artifacts in {}",
                loader.pairs().len(),
                loader.length(),
                config.artifact_dir
            );
            Ok(())
        }
        _ => unreachable!("subcommand is required"),
    }
}

fn main() -> ExitCode {
    let matches = cli().get_matches();
    let level = if matches.get_flag("verbose") {
        "debug"
    } else {
        "info"
    };
    logging::init(level);

    match run(&matches) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}
