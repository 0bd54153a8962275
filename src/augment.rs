//! Geometric augmentation of decoded tiles.
//!
//! Every source image yields the same six variants, always stacked in [`Variant::ALL`] order.
//! The variants are computed by a [`TaskGraph`]: one source node (decode + normalize) feeding
//! independent sibling nodes, one per variant, joined in declaration order.

use std::path::Path;

use ndarray::{s, Array3, Array4, ArrayView3, Axis};
use rayon::ThreadPool;
use tracing::debug;

use crate::data::Normalizer;
use crate::error::{Error, Result};
use crate::raster::{decode_rgb, Resample};

/// Number of variants produced per source image.
pub const VARIANTS: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Variant {
    Identity,
    Rot90,
    Rot180,
    Rot270,
    /// Reverses the channel axis, RGB becomes BGR.
    DepthFlip,
    /// Mirrors columns.
    FlipLr,
}

impl Variant {
    pub const ALL: [Variant; VARIANTS] = [
        Variant::Identity,
        Variant::Rot90,
        Variant::Rot180,
        Variant::Rot270,
        Variant::DepthFlip,
        Variant::FlipLr,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Variant::Identity => "identity",
            Variant::Rot90 => "rot90",
            Variant::Rot180 => "rot180",
            Variant::Rot270 => "rot270",
            Variant::DepthFlip => "depth_flip",
            Variant::FlipLr => "fliplr",
        }
    }

    /// Applies the transform to a `(row, col, channel)` image.
    ///
    /// Rotations are counter-clockwise in the row/column plane.
    pub fn apply(self, image: ArrayView3<f32>) -> Array3<f32> {
        match self {
            Variant::Identity => image.to_owned(),
            Variant::Rot90 => image
                .slice(s![.., ..;-1, ..])
                .permuted_axes([1, 0, 2])
                .to_owned(),
            Variant::Rot180 => image.slice(s![..;-1, ..;-1, ..]).to_owned(),
            Variant::Rot270 => image
                .permuted_axes([1, 0, 2])
                .slice_move(s![.., ..;-1, ..])
                .to_owned(),
            Variant::DepthFlip => image.slice(s![.., .., ..;-1]).to_owned(),
            Variant::FlipLr => image.slice(s![.., ..;-1, ..]).to_owned(),
        }
    }
}

type SourceTask<'a, S> = Box<dyn FnOnce() -> Result<S> + Send + 'a>;
type SiblingTask<'a, S, T> = Box<dyn Fn(&S) -> T + Send + Sync + 'a>;

/// A fan-out/join graph: one fallible source node and any number of independent siblings that
/// only read its output.
///
/// Siblings run concurrently on the given pool; results come back in the order the siblings
/// were added, whatever order they finish in. A failing source fails the whole run and no
/// sibling is started.
pub struct TaskGraph<'a, S, T> {
    source: SourceTask<'a, S>,
    siblings: Vec<SiblingTask<'a, S, T>>,
}

impl<'a, S: Sync, T: Send> TaskGraph<'a, S, T> {
    pub fn new(source: impl FnOnce() -> Result<S> + Send + 'a) -> Self {
        Self {
            source: Box::new(source),
            siblings: Vec::new(),
        }
    }

    pub fn sibling(mut self, task: impl Fn(&S) -> T + Send + Sync + 'a) -> Self {
        self.siblings.push(Box::new(task));
        self
    }

    pub fn len(&self) -> usize {
        self.siblings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.siblings.is_empty()
    }

    pub fn run(self, pool: &ThreadPool) -> Result<Vec<T>> {
        let Self { source, siblings } = self;

        pool.install(move || {
            let value = source()?;
            let mut slots: Vec<Option<T>> = siblings.iter().map(|_| None).collect();

            rayon::scope(|scope| {
                for (slot, task) in slots.iter_mut().zip(&siblings) {
                    let value = &value;
                    scope.spawn(move |_| *slot = Some(task(value)));
                }
            });

            // ordered gather, every slot was filled before the scope returned
            Ok(slots.into_iter().flatten().collect())
        })
    }
}

/// Builds the six-variant stack for single images.
#[derive(Clone, Debug, Default)]
pub struct Augmenter {
    normalizer: Normalizer,
}

impl Augmenter {
    pub fn new(normalizer: Normalizer) -> Self {
        Self { normalizer }
    }

    pub fn normalizer(&self) -> &Normalizer {
        &self.normalizer
    }

    /// Stack of `(6, row, col, channel)` for an image that is already decoded and normalized.
    pub fn augment(&self, pool: &ThreadPool, image: Array3<f32>) -> Result<Array4<f32>> {
        let graph = variant_graph(move || {
            ensure_square(&image)?;
            Ok(image)
        });
        stack_variants(graph.run(pool)?)
    }

    /// Decodes `path` once, normalizes it and fans out to the six variants.
    pub fn augment_file(
        &self,
        pool: &ThreadPool,
        path: &Path,
        resample: Resample,
    ) -> Result<Array4<f32>> {
        let graph = variant_graph(|| {
            let image = self.normalizer.normalize(decode_rgb(path, resample)?);
            ensure_square(&image)?;
            Ok(image)
        });
        let stack = stack_variants(graph.run(pool)?)?;
        debug!(path = %path.display(), shape = ?stack.shape(), "augmented");
        Ok(stack)
    }
}

fn variant_graph<'a>(
    source: impl FnOnce() -> Result<Array3<f32>> + Send + 'a,
) -> TaskGraph<'a, Array3<f32>, Array3<f32>> {
    Variant::ALL
        .into_iter()
        .fold(TaskGraph::new(source), |graph, variant| {
            graph.sibling(move |image: &Array3<f32>| variant.apply(image.view()))
        })
}

fn ensure_square(image: &Array3<f32>) -> Result<()> {
    let (rows, cols, _) = image.dim();
    if rows != cols {
        return Err(Error::NotSquare { rows, cols });
    }
    Ok(())
}

fn stack_variants(variants: Vec<Array3<f32>>) -> Result<Array4<f32>> {
    let views: Vec<_> = variants.iter().map(|v| v.view()).collect();
    ndarray::stack(Axis(0), &views).map_err(|e| Error::invalid("variants", e.to_string()))
}
