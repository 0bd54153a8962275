use std::path::Path;
use std::sync::Arc;

use burn::prelude::*;
use serde_json::json;
use tracing::info;

use crate::{
    augment::Augmenter,
    data::NormalizerConfig,
    dataset::list_images,
    error::Error,
    loader::BatchLoader,
    metrics::{JsonParamSink, ParamSink},
};

pub const CONFIG_FILE: &str = "config.json";
pub const PARAMS_FILE: &str = "params.json";

/// Everything the trainer needs to build its batch loader.
#[derive(Config, Debug)]
pub struct PipelineConfig {
    /// Root holding `images/train/{low,high}`.
    pub data_dir: String,
    /// Where `config.json` and `params.json` are written.
    pub artifact_dir: String,
    pub normalizer: NormalizerConfig,
    #[config(default = 4)]
    pub batch_size: usize,
    #[config(default = 0.25)]
    pub scale_factor: f64,
    #[config(default = 6)]
    pub num_workers: usize,
}

impl PipelineConfig {
    pub fn validate(&self) -> crate::Result<()> {
        if self.batch_size == 0 {
            return Err(Error::invalid("batch_size", "must be at least 1"));
        }
        if self.num_workers == 0 {
            return Err(Error::invalid("num_workers", "must be at least 1"));
        }
        if !(self.scale_factor > 0.0 && self.scale_factor <= 1.0) {
            return Err(Error::invalid(
                "scale_factor",
                format!("expected a value in (0, 1], got {}", self.scale_factor),
            ));
        }
        self.normalizer.validate()
    }

    /// Builds the loader without touching the artifact directory.
    pub fn init_loader(&self, sink: &dyn ParamSink) -> crate::Result<BatchLoader> {
        self.validate()?;
        let pairs = list_images(&self.data_dir, sink)?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.num_workers)
            .build()?;

        let augmenter = Augmenter::new(self.normalizer.init()?);

        Ok(BatchLoader::with_pool(pairs, self.batch_size, Arc::new(pool))?
            .with_scale_factor(self.scale_factor)?
            .with_augmenter(augmenter))
    }
}

/// Validates `config`, records it in the artifact directory and returns the batch loader.
///
/// `params.json` is written even when the image directories do not pair up, so a failed run
/// still records the counts it found.
pub fn prepare(config: &PipelineConfig) -> crate::Result<BatchLoader> {
    config.validate()?;
    let artifact_dir = Path::new(&config.artifact_dir);
    std::fs::create_dir_all(artifact_dir)?;
    config.save(artifact_dir.join(CONFIG_FILE))?;

    let sink = JsonParamSink::new();
    sink.log_param("batch_size", json!(config.batch_size));
    sink.log_param("scale_factor", json!(config.scale_factor));
    let loader = config.init_loader(&sink);
    sink.save(artifact_dir.join(PARAMS_FILE))?;
    let loader = loader?;

    info!(
        pairs = loader.pairs().len(),
        batches = loader.length(),
        artifact_dir = %artifact_dir.display(),
        "pipeline prepared"
    );
    Ok(loader)
}
