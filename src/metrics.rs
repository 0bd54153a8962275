//! Experiment parameters and evaluation metrics.
//!
//! The trainer that consumes our batches tracks runs in an external experiment store. The
//! pipeline only reports key/value parameters through a [`ParamSink`], and provides the PSNR
//! metric used to compare reconstructed and target stacks.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use ndarray::{Array4, ArrayView4, Axis};
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use crate::error::{Error, Result};

/// Destination for named experiment parameters, such as image counts.
pub trait ParamSink: Send + Sync {
    fn log_param(&self, key: &str, value: Value);
}

/// Emits every parameter as a structured log record.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ParamSink for TracingSink {
    fn log_param(&self, key: &str, value: Value) {
        info!(param = key, %value, "logged parameter");
    }
}

/// Collects parameters in memory so they can be written next to the run artifacts.
#[derive(Debug, Default)]
pub struct JsonParamSink {
    params: Mutex<BTreeMap<String, Value>>,
}

#[derive(Serialize)]
struct ParamsFile<'a> {
    params: &'a BTreeMap<String, Value>,
}

impl JsonParamSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything logged so far. Later values overwrite earlier ones with the same key.
    pub fn params(&self) -> BTreeMap<String, Value> {
        self.lock().clone()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.lock().get(key).cloned()
    }

    /// Writes `{"params": {...}}` to `path`.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let params = self.lock();
        let json = serde_json::to_string_pretty(&ParamsFile { params: &params })?;
        std::fs::write(path, json)?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Value>> {
        // A poisoned map still holds valid entries.
        self.params.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ParamSink for JsonParamSink {
    fn log_param(&self, key: &str, value: Value) {
        self.lock().insert(key.to_string(), value);
    }
}

/// Peak signal-to-noise ratio in dB between two stacks of equal shape.
///
/// `data_range` is the distance between the smallest and largest representable value, 2.0 for
/// the default [-1, 1] normalization. Identical inputs give `f64::INFINITY`.
pub fn psnr(pred: ArrayView4<f32>, target: ArrayView4<f32>, data_range: f64) -> Result<f64> {
    if pred.shape() != target.shape() {
        return Err(Error::invalid(
            "target",
            format!("shape {:?} differs from {:?}", target.shape(), pred.shape()),
        ));
    }
    if pred.is_empty() {
        return Err(Error::invalid("pred", "empty stack"));
    }
    if data_range <= 0.0 {
        return Err(Error::invalid("data_range", "must be positive"));
    }

    let sum_sq: f64 = pred
        .iter()
        .zip(target.iter())
        .map(|(&p, &t)| {
            let d = f64::from(p) - f64::from(t);
            d * d
        })
        .sum();
    let mse = sum_sq / pred.len() as f64;

    if mse == 0.0 {
        return Ok(f64::INFINITY);
    }
    Ok(10.0 * (data_range * data_range / mse).log10())
}

/// Enlarges the spatial axes of a `(n, row, col, channel)` stack by an integer factor,
/// repeating pixels.
pub fn nearest_upsample(stack: ArrayView4<f32>, factor: usize) -> Result<Array4<f32>> {
    if factor == 0 {
        return Err(Error::invalid("factor", "must be at least 1"));
    }
    let (n, rows, cols, channels) = stack.dim();
    let mut out = Array4::<f32>::zeros((n, rows * factor, cols * factor, channels));

    for (mut dst, src) in out.axis_iter_mut(Axis(0)).zip(stack.axis_iter(Axis(0))) {
        for ((r, c, ch), value) in dst.indexed_iter_mut() {
            *value = src[[r / factor, c / factor, ch]];
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_sink_keeps_last_value() {
        let sink = JsonParamSink::new();
        sink.log_param("no_of_hr_images", json!(3));
        sink.log_param("no_of_hr_images", json!(4));

        assert_eq!(sink.get("no_of_hr_images"), Some(json!(4)));
        assert_eq!(sink.params().len(), 1);
    }

    #[test]
    fn test_json_sink_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("params.json");
        let sink = JsonParamSink::new();
        sink.log_param("no_of_lr_images", json!(7));
        sink.save(&path).unwrap();

        let saved: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(saved["params"]["no_of_lr_images"], json!(7));
    }

    #[test]
    fn test_psnr_identical_is_infinite() {
        let a = Array4::<f32>::from_elem((1, 2, 2, 3), 0.25);
        assert_eq!(psnr(a.view(), a.view(), 2.0).unwrap(), f64::INFINITY);
    }

    #[test]
    fn test_psnr_known_value() {
        let a = Array4::<f32>::zeros((1, 2, 2, 1));
        let b = Array4::<f32>::from_elem((1, 2, 2, 1), 0.5);
        // mse = 0.25, range 1 => 10 * log10(4)
        let value = psnr(a.view(), b.view(), 1.0).unwrap();
        assert!((value - 10.0 * 4f64.log10()).abs() < 1e-9);
    }

    #[test]
    fn test_psnr_shape_mismatch() {
        let a = Array4::<f32>::zeros((1, 2, 2, 3));
        let b = Array4::<f32>::zeros((1, 4, 4, 3));
        assert!(matches!(
            psnr(a.view(), b.view(), 2.0),
            Err(Error::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_nearest_upsample_repeats_pixels() {
        let mut a = Array4::<f32>::zeros((1, 2, 2, 1));
        a[[0, 0, 1, 0]] = 1.0;
        let up = nearest_upsample(a.view(), 2).unwrap();

        assert_eq!(up.dim(), (1, 4, 4, 1));
        assert_eq!(up[[0, 0, 2, 0]], 1.0);
        assert_eq!(up[[0, 1, 3, 0]], 1.0);
        assert_eq!(up[[0, 2, 2, 0]], 0.0);
    }
}
