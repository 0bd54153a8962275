//! Error types for the super-resolution data pipeline.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for satellite_sr.
#[derive(Error, Debug)]
pub enum Error {
    /// Low and high resolution directories hold a different number of images.
    #[error(
        "mismatch between the number of high and low resolution image pairs: {low} low, {high} high"
    )]
    Mismatch { low: usize, high: usize },

    /// The raster could not be opened or decoded.
    #[error("failed to decode raster {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: tiff::TiffError,
    },

    /// The raster has fewer bands than the three we read.
    #[error("raster {path} has {bands} band(s), at least 3 are required")]
    MissingBands { path: PathBuf, bands: usize },

    /// Sample layout the decoder does not turn into floats.
    #[error("raster {path} has an unsupported sample format: {format}")]
    UnsupportedSampleFormat { path: PathBuf, format: String },

    /// Batch index outside `0..len`.
    #[error("batch index {index} out of range for {len} batch(es)")]
    IndexOutOfRange { index: usize, len: usize },

    /// Rotations of a non-square image cannot be stacked.
    #[error("augmentation requires a square image, got {rows}x{cols}")]
    NotSquare { rows: usize, cols: usize },

    /// Invalid parameter value.
    #[error("invalid parameter {name}: {reason}")]
    InvalidParameter { name: String, reason: String },

    /// Malformed glob pattern built from the data directory.
    #[error("invalid file pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    /// A directory entry matched by the pattern could not be read.
    #[error("failed to list images: {0}")]
    Glob(#[from] glob::GlobError),

    /// Failure while encoding a preview image.
    #[error("failed to write image {path}: {source}")]
    ImageSave {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    /// The worker pool could not be started.
    #[error("failed to build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn invalid(name: &str, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for satellite_sr operations.
pub type Result<T> = std::result::Result<T, Error>;
