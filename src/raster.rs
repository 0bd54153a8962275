//! Raster decoding for multi-band GeoTIFF tiles.
//!
//! Only the first three bands are read. The imagery we train on stores them as B, G, R, so the
//! decoder always emits channels in R, G, B order. The band order is not validated.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use ndarray::Array3;
use tiff::decoder::{Decoder, DecodingResult, Limits};
use tracing::debug;

use crate::error::{Error, Result};

pub const DEFAULT_SCALE_FACTOR: f64 = 0.25;

/// Number of bands read from each raster.
pub const BANDS: usize = 3;

/// How a raster is sampled while decoding.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Resample {
    /// Native resolution.
    #[default]
    Full,
    /// Nearest-neighbour resampling to `scale_factor` times the width and height.
    Nearest { scale_factor: f64 },
}

impl Resample {
    /// Nearest-neighbour downsampling by [`DEFAULT_SCALE_FACTOR`].
    pub fn downsample() -> Self {
        Self::Nearest {
            scale_factor: DEFAULT_SCALE_FACTOR,
        }
    }

    /// Output `(rows, cols)` for a source of `rows` x `cols`.
    pub fn output_dims(&self, rows: usize, cols: usize) -> Result<(usize, usize)> {
        match *self {
            Self::Full => Ok((rows, cols)),
            Self::Nearest { scale_factor } => {
                if !(scale_factor > 0.0 && scale_factor.is_finite()) {
                    return Err(Error::invalid("scale_factor", "must be a positive number"));
                }
                let out_rows = (rows as f64 * scale_factor).floor() as usize;
                let out_cols = (cols as f64 * scale_factor).floor() as usize;
                if out_rows == 0 || out_cols == 0 {
                    return Err(Error::invalid(
                        "scale_factor",
                        format!("{scale_factor} reduces a {rows}x{cols} raster to nothing"),
                    ));
                }
                Ok((out_rows, out_cols))
            }
        }
    }
}

/// Band-interleaved samples of a decoded raster, before band selection.
#[derive(Debug, Clone)]
pub struct RasterSamples {
    pub rows: usize,
    pub cols: usize,
    pub bands: usize,
    pub data: Vec<f32>,
}

impl RasterSamples {
    fn sample(&self, row: usize, col: usize, band: usize) -> f32 {
        self.data[(row * self.cols + col) * self.bands + band]
    }
}

/// Opens `path`, optionally resamples it and returns a `(row, col, 3)` array in RGB order.
///
/// The file handle is closed before this returns.
pub fn decode_rgb<P: AsRef<Path>>(path: P, resample: Resample) -> Result<Array3<f32>> {
    let path = path.as_ref();
    let samples = read_samples(path)?;

    if samples.bands < BANDS {
        return Err(Error::MissingBands {
            path: path.to_path_buf(),
            bands: samples.bands,
        });
    }

    let (rows, cols) = resample.output_dims(samples.rows, samples.cols)?;
    debug!(
        path = %path.display(),
        src_rows = samples.rows,
        src_cols = samples.cols,
        rows,
        cols,
        "decoded raster"
    );

    Ok(Array3::from_shape_fn((rows, cols, BANDS), |(r, c, ch)| {
        let src_r = nearest_index(r, rows, samples.rows);
        let src_c = nearest_index(c, cols, samples.cols);
        // channel 0 <- band 3, channel 1 <- band 2, channel 2 <- band 1
        samples.sample(src_r, src_c, BANDS - 1 - ch)
    }))
}

/// Source index whose pixel centre is nearest to the centre of destination pixel `dst`.
fn nearest_index(dst: usize, dst_len: usize, src_len: usize) -> usize {
    if dst_len == src_len {
        return dst;
    }
    let pos = ((dst as f64 + 0.5) * src_len as f64 / dst_len as f64).floor() as usize;
    pos.min(src_len - 1)
}

/// Reads every sample of the first image in the file as `f32`.
pub fn read_samples(path: &Path) -> Result<RasterSamples> {
    let decode_err = |source: tiff::TiffError| Error::Decode {
        path: path.to_path_buf(),
        source,
    };

    let file = File::open(path).map_err(|e| decode_err(e.into()))?;
    let mut decoder = Decoder::new(BufReader::new(file))
        .map_err(decode_err)?
        .with_limits(Limits::unlimited());

    let (width, height) = decoder.dimensions().map_err(decode_err)?;
    let (rows, cols) = (height as usize, width as usize);
    let mut buffer = DecodingResult::U8(Vec::new());
    let layout = decoder
        .read_image_to_buffer(&mut buffer)
        .map_err(decode_err)?;
    let data = samples_as_f32(path, buffer)?;

    let pixels = rows * cols;
    if pixels == 0 || data.len() % pixels != 0 {
        return Err(Error::UnsupportedSampleFormat {
            path: path.to_path_buf(),
            format: format!("{} samples for a {cols}x{rows} raster", data.len()),
        });
    }
    let bands = data.len() / pixels;

    // band-sequential files come back one plane per band
    let data = if layout.planes > 1 {
        interleave_planes(&data, pixels, bands)
    } else {
        data
    };

    Ok(RasterSamples {
        rows,
        cols,
        bands,
        data,
    })
}

fn interleave_planes(planes: &[f32], pixels: usize, bands: usize) -> Vec<f32> {
    (0..pixels)
        .flat_map(|pixel| (0..bands).map(move |band| planes[band * pixels + pixel]))
        .collect()
}

fn samples_as_f32(path: &Path, data: DecodingResult) -> Result<Vec<f32>> {
    fn convert<T: Copy + Into<f64>>(buf: Vec<T>) -> Vec<f32> {
        buf.into_iter().map(|v| v.into() as f32).collect()
    }

    let values = match data {
        DecodingResult::U8(buf) => convert(buf),
        DecodingResult::U16(buf) => convert(buf),
        DecodingResult::U32(buf) => convert(buf),
        DecodingResult::I8(buf) => convert(buf),
        DecodingResult::I16(buf) => convert(buf),
        DecodingResult::I32(buf) => convert(buf),
        DecodingResult::F16(buf) => buf.into_iter().map(|v| v.to_f32()).collect(),
        DecodingResult::F32(buf) => buf,
        DecodingResult::F64(buf) => convert(buf),
        DecodingResult::U64(buf) => buf.into_iter().map(|v| v as f32).collect(),
        DecodingResult::I64(buf) => buf.into_iter().map(|v| v as f32).collect(),
        #[allow(unreachable_patterns)]
        _ => {
            return Err(Error::UnsupportedSampleFormat {
                path: path.to_path_buf(),
                format: "unknown sample type".to_string(),
            })
        }
    };

    Ok(values)
}
