//! Random-access batch loading over paired training images.
//!
//! A batch is built on demand from its index alone. Nothing is cached between calls, so the
//! same index always yields the same arrays and batches may be fetched in any order, from any
//! number of callers.

use std::path::Path;
use std::sync::Arc;

use burn::data::dataloader::batcher::Batcher;
use burn::prelude::Backend;
use ndarray::{Array4, Axis};
use rayon::prelude::*;
use rayon::ThreadPool;
use tracing::debug;

use crate::augment::Augmenter;
use crate::data::{stack_to_tensor, SrBatch, SrBatcher};
use crate::dataset::ImagePairs;
use crate::error::{Error, Result};
use crate::raster::Resample;

/// Indexed access to batches, the contract the external training loop relies on.
pub trait BatchSource {
    type Batch;

    /// Number of batches, `ceil(files / batch_size)`.
    fn length(&self) -> usize;

    /// Batch `index`, failing with [`Error::IndexOutOfRange`] outside `0..length()`.
    fn fetch_by_index(&self, index: usize) -> Result<Self::Batch>;
}

/// Augmented stacks of one low/high pair, `(6, row, col, 3)` each.
#[derive(Clone, Debug)]
pub struct SrItem {
    pub low: Array4<f32>,
    pub high: Array4<f32>,
}

/// Concatenated stacks of every pair in a batch, `(6 * files, row, col, 3)` each.
#[derive(Clone, Debug)]
pub struct Batch {
    pub low: Array4<f32>,
    pub high: Array4<f32>,
}

impl Batch {
    fn concat(items: &[SrItem]) -> Result<Self> {
        let low: Vec<_> = items.iter().map(|item| item.low.view()).collect();
        let high: Vec<_> = items.iter().map(|item| item.high.view()).collect();
        let concat_err = |e: ndarray::ShapeError| {
            Error::invalid("batch", format!("images of a batch differ in size: {e}"))
        };

        Ok(Self {
            low: ndarray::concatenate(Axis(0), &low).map_err(concat_err)?,
            high: ndarray::concatenate(Axis(0), &high).map_err(concat_err)?,
        })
    }

    /// Number of samples (variants times files) in the batch.
    pub fn len(&self) -> usize {
        self.low.len_of(Axis(0))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_tensors<B: Backend>(&self, device: &B::Device) -> SrBatch<B> {
        SrBatch {
            low: stack_to_tensor::<B>(self.low.view(), device),
            high: stack_to_tensor::<B>(self.high.view(), device),
        }
    }
}

/// Maps batch indices to augmented low/high resolution arrays.
///
/// Low resolution files are decoded with nearest-neighbour downsampling, high resolution files
/// at native size. Files of one batch are processed concurrently on the loader's own pool.
#[derive(Clone, Debug)]
pub struct BatchLoader {
    pairs: ImagePairs,
    batch_size: usize,
    low_res: Resample,
    augmenter: Augmenter,
    pool: Arc<ThreadPool>,
}

impl BatchLoader {
    /// Loader with the default downsampling, normalization and one worker per core.
    pub fn new(pairs: ImagePairs, batch_size: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new().build()?;
        Self::with_pool(pairs, batch_size, Arc::new(pool))
    }

    pub fn with_pool(pairs: ImagePairs, batch_size: usize, pool: Arc<ThreadPool>) -> Result<Self> {
        if batch_size == 0 {
            return Err(Error::invalid("batch_size", "must be at least 1"));
        }
        Ok(Self {
            pairs,
            batch_size,
            low_res: Resample::downsample(),
            augmenter: Augmenter::default(),
            pool,
        })
    }

    pub fn with_scale_factor(mut self, scale_factor: f64) -> Result<Self> {
        if !(scale_factor > 0.0 && scale_factor <= 1.0) {
            return Err(Error::invalid(
                "scale_factor",
                format!("expected a value in (0, 1], got {scale_factor}"),
            ));
        }
        self.low_res = Resample::Nearest { scale_factor };
        Ok(self)
    }

    pub fn with_augmenter(mut self, augmenter: Augmenter) -> Self {
        self.augmenter = augmenter;
        self
    }

    pub fn pairs(&self) -> &ImagePairs {
        &self.pairs
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn length(&self) -> usize {
        self.pairs.len().div_ceil(self.batch_size)
    }

    /// Augmented stacks for pair `index`.
    pub fn item(&self, index: usize) -> Result<SrItem> {
        let (low, high) = self.pairs.get(index).ok_or(Error::IndexOutOfRange {
            index,
            len: self.pairs.len(),
        })?;
        self.load_pair(low, high)
    }

    pub fn fetch(&self, index: usize) -> Result<Batch> {
        let items = self.load_items(index)?;
        let batch = Batch::concat(&items)?;
        debug!(
            index,
            files = items.len(),
            low = ?batch.low.shape(),
            high = ?batch.high.shape(),
            "fetched batch"
        );
        Ok(batch)
    }

    /// Batch `index` as `[n, channel, row, col]` tensors built by `batcher`.
    pub fn fetch_tensors<B: Backend>(
        &self,
        index: usize,
        batcher: &SrBatcher<B>,
    ) -> Result<SrBatch<B>> {
        Ok(batcher.batch(self.load_items(index)?))
    }

    /// Every batch of one epoch in index order.
    ///
    /// A pair that fails to load yields an `Err` for its batch; later batches are still produced.
    pub fn tensor_batches<'a, B: Backend>(
        &'a self,
        batcher: &'a SrBatcher<B>,
    ) -> impl Iterator<Item = Result<SrBatch<B>>> + 'a {
        (0..self.length()).map(move |index| self.fetch_tensors(index, batcher))
    }

    fn load_items(&self, index: usize) -> Result<Vec<SrItem>> {
        let len = self.length();
        if index >= len {
            return Err(Error::IndexOutOfRange { index, len });
        }

        let start = index * self.batch_size;
        let end = (start + self.batch_size).min(self.pairs.len());
        let low = &self.pairs.low()[start..end];
        let high = &self.pairs.high()[start..end];

        self.pool.install(|| {
            low.par_iter()
                .zip(high.par_iter())
                .map(|(l, h)| self.load_pair(l, h))
                .collect()
        })
    }

    fn load_pair(&self, low: &Path, high: &Path) -> Result<SrItem> {
        Ok(SrItem {
            low: self.augmenter.augment_file(&self.pool, low, self.low_res)?,
            high: self.augmenter.augment_file(&self.pool, high, Resample::Full)?,
        })
    }
}

impl BatchSource for BatchLoader {
    type Batch = Batch;

    fn length(&self) -> usize {
        BatchLoader::length(self)
    }

    fn fetch_by_index(&self, index: usize) -> Result<Batch> {
        self.fetch(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::tests::write_bgr16;
    use std::path::PathBuf;

    fn fake_pairs(count: usize) -> ImagePairs {
        let paths: Vec<PathBuf> = (0..count)
            .map(|i| PathBuf::from(format!("{i}.tif")))
            .collect();
        ImagePairs::new(paths.clone(), paths).unwrap()
    }

    fn write_pairs(dir: &Path, count: usize, size: u32) -> ImagePairs {
        let mut low = Vec::new();
        let mut high = Vec::new();
        for i in 0..count {
            let l = dir.join(format!("low{i}.tif"));
            let h = dir.join(format!("high{i}.tif"));
            write_bgr16(&l, size, size, |r, c, b| (r * 3 + c + b + i as u32) as u16);
            write_bgr16(&h, size * 2, size * 2, |r, c, b| (r + c * 5 + b) as u16);
            low.push(l);
            high.push(h);
        }
        ImagePairs::new(low, high).unwrap()
    }

    #[test]
    fn test_length_is_ceil() {
        for (files, batch_size, expected) in [(0, 4, 0), (1, 4, 1), (4, 4, 1), (5, 4, 2), (9, 2, 5)]
        {
            let loader = BatchLoader::new(fake_pairs(files), batch_size).unwrap();
            assert_eq!(loader.length(), expected, "{files} files / {batch_size}");
        }
    }

    #[test]
    fn test_zero_batch_size() {
        assert!(matches!(
            BatchLoader::new(fake_pairs(2), 0),
            Err(Error::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_fetch_out_of_range() {
        let loader = BatchLoader::new(fake_pairs(3), 2).unwrap();
        assert!(matches!(
            loader.fetch(2),
            Err(Error::IndexOutOfRange { index: 2, len: 2 })
        ));
        assert!(matches!(
            loader.fetch_by_index(usize::MAX),
            Err(Error::IndexOutOfRange { .. })
        ));
    }

    #[test]
    fn test_fetch_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let loader = BatchLoader::new(write_pairs(dir.path(), 3, 8), 2)
            .unwrap()
            .with_scale_factor(0.5)
            .unwrap();

        let first = loader.fetch(1).unwrap();
        let again = loader.fetch(1).unwrap();
        assert_eq!(first.low, again.low);
        assert_eq!(first.high, again.high);
        assert_eq!(first.low.dim(), (6, 4, 4, 3));
        assert_eq!(first.high.dim(), (6, 16, 16, 3));
    }

    #[test]
    fn test_batch_keeps_file_order() {
        let dir = tempfile::tempdir().unwrap();
        let loader = BatchLoader::new(write_pairs(dir.path(), 2, 8), 2).unwrap();

        let batch = loader.fetch(0).unwrap();
        let second = loader.item(1).unwrap();
        assert_eq!(batch.len(), 12);
        assert_eq!(batch.high.slice(ndarray::s![6.., .., .., ..]), second.high);
    }

    #[test]
    fn test_corrupt_file_fails_whole_batch() {
        let dir = tempfile::tempdir().unwrap();
        let pairs = write_pairs(dir.path(), 2, 8);
        std::fs::write(&pairs.high()[1], b"corrupt").unwrap();
        let loader = BatchLoader::new(pairs, 2).unwrap();

        assert!(matches!(loader.fetch(0), Err(Error::Decode { .. })));
    }

    #[test]
    fn test_tensor_batches_surface_failures() {
        let dir = tempfile::tempdir().unwrap();
        let pairs = write_pairs(dir.path(), 3, 8);
        std::fs::write(&pairs.low()[0], b"corrupt").unwrap();
        let loader = BatchLoader::new(pairs, 1).unwrap();
        let batcher = SrBatcher::<burn::backend::NdArray>::new(Default::default());

        let results: Vec<_> = loader.tensor_batches(&batcher).collect();

        assert_eq!(results.len(), 3);
        assert!(matches!(results[0], Err(Error::Decode { .. })));
        for batch in &results[1..] {
            let batch = batch.as_ref().unwrap();
            assert_eq!(batch.low.dims(), [6, 3, 2, 2]);
            assert_eq!(batch.high.dims(), [6, 3, 16, 16]);
        }
    }

    #[test]
    fn test_invalid_scale_factor() {
        let loader = BatchLoader::new(fake_pairs(1), 1).unwrap();
        assert!(loader.with_scale_factor(1.5).is_err());
    }
}
