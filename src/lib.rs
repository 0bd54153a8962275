//! Data preparation for super-resolution training on paired satellite tiles.
//!
//! Low/high resolution GeoTIFFs are located and paired ([`dataset`]), decoded to RGB
//! ([`raster`]), contrast stretched and rescaled ([`data`]), expanded into six geometric
//! variants ([`augment`]) and served batch by batch ([`loader`]).

pub mod augment;
pub mod data;
pub mod dataset;
pub mod error;
pub mod loader;
pub mod logging;
pub mod metrics;
pub mod raster;
pub mod training;

pub use error::{Error, Result};
