use burn::{data::dataloader::batcher::Batcher, prelude::*};
use ndarray::{Array3, ArrayView4, Axis};

use crate::error::Error;
use crate::loader::SrItem;

/// Percentile window and output range used by the [`Normalizer`].
#[derive(Config, Debug)]
pub struct NormalizerConfig {
    #[config(default = 2.0)]
    pub lower_percentile: f64,
    #[config(default = 98.0)]
    pub upper_percentile: f64,
    #[config(default = "-1.0")]
    pub out_min: f32,
    #[config(default = 1.0)]
    pub out_max: f32,
}

impl NormalizerConfig {
    pub fn validate(&self) -> crate::Result<()> {
        let (lo, hi) = (self.lower_percentile, self.upper_percentile);
        if !(0.0..=100.0).contains(&lo) || !(0.0..=100.0).contains(&hi) || lo >= hi {
            return Err(Error::invalid(
                "percentiles",
                format!("expected 0 <= lower < upper <= 100, got ({lo}, {hi})"),
            ));
        }
        if !(self.out_min < self.out_max) {
            return Err(Error::invalid(
                "out_range",
                format!("empty range ({}, {})", self.out_min, self.out_max),
            ));
        }
        Ok(())
    }

    pub fn init(&self) -> crate::Result<Normalizer> {
        self.validate()?;
        Ok(Normalizer {
            config: self.clone(),
        })
    }
}

/// Contrast stretch per channel followed by a min-max rescale into the output range.
#[derive(Clone, Debug)]
pub struct Normalizer {
    config: NormalizerConfig,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self {
            config: NormalizerConfig::new(),
        }
    }
}

impl Normalizer {
    pub fn config(&self) -> &NormalizerConfig {
        &self.config
    }

    /// Midpoint of the output range, the value of every pixel of a constant image.
    pub fn midpoint(&self) -> f32 {
        (self.config.out_min + self.config.out_max) / 2.0
    }

    pub fn normalize(&self, image: Array3<f32>) -> Array3<f32> {
        self.rescale(self.stretch(image))
    }

    /// Maps each channel's percentile window onto [0, 1], clipping values outside it.
    ///
    /// A channel whose window is empty maps values below it to 0, above it to 1 and the rest
    /// to 0.5.
    pub fn stretch(&self, mut image: Array3<f32>) -> Array3<f32> {
        for mut channel in image.axis_iter_mut(Axis(2)) {
            let mut values: Vec<f32> = channel.iter().copied().collect();
            values.sort_by(f32::total_cmp);
            let lo = percentile(&values, self.config.lower_percentile);
            let hi = percentile(&values, self.config.upper_percentile);

            channel.mapv_inplace(|v| {
                if hi > lo {
                    ((v - lo) / (hi - lo)).clamp(0.0, 1.0)
                } else if v < lo {
                    0.0
                } else if v > hi {
                    1.0
                } else {
                    0.5
                }
            });
        }
        image
    }

    /// Affine map of the joint `[min, max]` of all channels onto `[out_min, out_max]`.
    ///
    /// Constant images become the output midpoint instead of NaN.
    pub fn rescale(&self, mut image: Array3<f32>) -> Array3<f32> {
        let (min, max) = image
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            });
        let out_mid = self.midpoint();

        if !(max > min) {
            image.fill(out_mid);
            return image;
        }

        let in_mid = (max + min) / 2.0;
        let gain = (self.config.out_max - self.config.out_min) / (max - min);
        image.mapv_inplace(|v| {
            ((v - in_mid) * gain + out_mid).clamp(self.config.out_min, self.config.out_max)
        });
        image
    }
}

/// Value at percentile `q` of ascending `sorted`, interpolating linearly between ranks.
pub fn percentile(sorted: &[f32], q: f64) -> f32 {
    if sorted.is_empty() {
        return f32::NAN;
    }
    let pos = q.clamp(0.0, 100.0) / 100.0 * (sorted.len() - 1) as f64;
    let below = pos.floor() as usize;
    let above = pos.ceil() as usize;
    let frac = (pos - below as f64) as f32;
    sorted[below] + (sorted[above] - sorted[below]) * frac
}

/// `(n, row, col, channel)` stack to an `[n, channel, row, col]` tensor.
pub fn stack_to_tensor<B: Backend>(stack: ArrayView4<f32>, device: &B::Device) -> Tensor<B, 4> {
    let (n, rows, cols, channels) = stack.dim();
    let values: Vec<f32> = stack.iter().copied().collect();
    let data = TensorData::new(values, Shape::new([n, rows, cols, channels]));

    Tensor::<B, 4>::from_data(data.convert::<B::FloatElem>(), device)
        .swap_dims(3, 2) // [N, H, C, W]
        .swap_dims(2, 1) // [N, C, H, W]
}

#[derive(Clone, Debug)]
pub struct SrBatch<B: Backend> {
    /// Downsampled inputs, `[6 * files, 3, h, w]`.
    pub low: Tensor<B, 4>,
    /// Targets, `[6 * files, 3, H, W]`.
    pub high: Tensor<B, 4>,
}

#[derive(Clone)]
pub struct SrBatcher<B: Backend> {
    device: B::Device,
}

impl<B: Backend> SrBatcher<B> {
    pub fn new(device: B::Device) -> Self {
        Self { device }
    }
}

impl<B: Backend> Batcher<SrItem, SrBatch<B>> for SrBatcher<B> {
    fn batch(&self, items: Vec<SrItem>) -> SrBatch<B> {
        let (low, high): (Vec<_>, Vec<_>) = items
            .iter()
            .map(|item| {
                (
                    stack_to_tensor::<B>(item.low.view(), &self.device),
                    stack_to_tensor::<B>(item.high.view(), &self.device),
                )
            })
            .unzip();

        SrBatch {
            low: Tensor::cat(low, 0),
            high: Tensor::cat(high, 0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use ndarray::{Array3, Array4};

    type TestBackend = NdArray;

    fn ramp(rows: usize, cols: usize) -> Array3<f32> {
        Array3::from_shape_fn((rows, cols, 3), |(r, c, ch)| {
            (r * cols + c) as f32 * (ch + 1) as f32
        })
    }

    #[test]
    fn test_percentile_interpolates() {
        let sorted = [0.0, 10.0, 20.0, 30.0, 40.0];
        assert_eq!(percentile(&sorted, 0.0), 0.0);
        assert_eq!(percentile(&sorted, 50.0), 20.0);
        assert_eq!(percentile(&sorted, 100.0), 40.0);
        assert!((percentile(&sorted, 2.0) - 0.8).abs() < 1e-5);
    }

    #[test]
    fn test_stretch_clips_outliers() {
        let mut image = ramp(10, 10);
        image[[0, 0, 0]] = -1000.0;
        image[[9, 9, 0]] = 1e6;

        let stretched = Normalizer::default().stretch(image);

        assert_eq!(stretched[[0, 0, 0]], 0.0);
        assert_eq!(stretched[[9, 9, 0]], 1.0);
        assert!(stretched.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_normalize_range_and_midpoint() {
        let normalizer = Normalizer::default();
        let out = normalizer.normalize(ramp(16, 16));

        let min = out.iter().copied().fold(f32::INFINITY, f32::min);
        let max = out.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        assert_eq!(min, -1.0);
        assert_eq!(max, 1.0);
        assert!(out.iter().all(|v| (-1.0..=1.0).contains(v)));
    }

    #[test]
    fn test_rescale_maps_midpoint_to_midpoint() {
        let image = Array3::from_shape_vec((1, 3, 1), vec![2.0, 4.0, 6.0]).unwrap();
        let out = NormalizerConfig::new()
            .with_out_min(0.0)
            .with_out_max(10.0)
            .init()
            .unwrap()
            .rescale(image);

        assert_eq!(out.iter().copied().collect::<Vec<_>>(), vec![0.0, 5.0, 10.0]);
    }

    #[test]
    fn test_constant_image_is_midpoint() {
        let normalizer = Normalizer::default();
        let out = normalizer.normalize(Array3::from_elem((8, 8, 3), 1234.0));

        assert!(out.iter().all(|v| v.is_finite()));
        assert!(out.iter().all(|&v| v == normalizer.midpoint()));
        assert_eq!(normalizer.midpoint(), 0.0);
    }

    #[test]
    fn test_constant_image_custom_range() {
        let normalizer = NormalizerConfig::new()
            .with_out_min(0.0)
            .with_out_max(1.0)
            .init()
            .unwrap();
        let out = normalizer.normalize(Array3::zeros((4, 4, 3)));
        assert!(out.iter().all(|&v| v == 0.5));
    }

    #[test]
    fn test_invalid_config() {
        let config = NormalizerConfig::new()
            .with_lower_percentile(98.0)
            .with_upper_percentile(2.0);
        assert!(matches!(config.init(), Err(Error::InvalidParameter { .. })));

        let config = NormalizerConfig::new().with_out_min(1.0);
        assert!(config.init().is_err());
    }

    #[test]
    fn test_config_json_round_trip() {
        let config = NormalizerConfig::new().with_lower_percentile(1.0);
        let json = serde_json::to_string(&config).unwrap();
        let loaded: NormalizerConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(loaded.lower_percentile, 1.0);
        assert_eq!(loaded.upper_percentile, 98.0);
        assert_eq!(loaded.out_min, -1.0);
    }

    #[test]
    fn test_stack_to_tensor_is_nchw() {
        let mut stack = Array4::<f32>::zeros((2, 4, 5, 3));
        stack[[1, 2, 3, 0]] = 7.0;
        let device = Default::default();

        let tensor = stack_to_tensor::<TestBackend>(stack.view(), &device);
        assert_eq!(tensor.dims(), [2, 3, 4, 5]);

        let values = tensor.into_data().to_vec::<f32>().unwrap();
        // [1, 0, 2, 3] in a [2, 3, 4, 5] layout
        let index = ((3 * 4) + 2) * 5 + 3;
        assert_eq!(values[index], 7.0);
    }

    #[test]
    fn test_batcher_concatenates_items() {
        let item = SrItem {
            low: Array4::zeros((6, 2, 2, 3)),
            high: Array4::zeros((6, 8, 8, 3)),
        };
        let batcher = SrBatcher::<TestBackend>::new(Default::default());
        let batch = batcher.batch(vec![item.clone(), item]);

        assert_eq!(batch.low.dims(), [12, 3, 2, 2]);
        assert_eq!(batch.high.dims(), [12, 3, 8, 8]);
    }
}
