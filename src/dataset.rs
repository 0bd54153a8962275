use std::cmp::Ordering;
use std::path::{Path, PathBuf};

use glob::{glob, Pattern};
use serde_json::json;
use tracing::info;

use crate::error::{Error, Result};
use crate::metrics::ParamSink;

/// Sub directories of the data directory holding the training pairs.
pub const LOW_RES_DIR: [&str; 3] = ["images", "train", "low"];
pub const HIGH_RES_DIR: [&str; 3] = ["images", "train", "high"];
pub const IMAGE_EXTENSION: &str = "tif";

/// Index-aligned low/high resolution file lists.
///
/// Files are paired by position after a natural sort of their names, never by content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePairs {
    low: Vec<PathBuf>,
    high: Vec<PathBuf>,
}

impl ImagePairs {
    /// Pairs two lists, failing when their lengths differ.
    pub fn new(low: Vec<PathBuf>, high: Vec<PathBuf>) -> Result<Self> {
        if low.len() != high.len() {
            return Err(Error::Mismatch {
                low: low.len(),
                high: high.len(),
            });
        }
        Ok(Self { low, high })
    }

    pub fn low(&self) -> &[PathBuf] {
        &self.low
    }

    pub fn high(&self) -> &[PathBuf] {
        &self.high
    }

    pub fn len(&self) -> usize {
        self.low.len()
    }

    pub fn is_empty(&self) -> bool {
        self.low.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<(&Path, &Path)> {
        Some((self.low.get(index)?.as_path(), self.high.get(index)?.as_path()))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Path, &Path)> {
        self.low
            .iter()
            .zip(self.high.iter())
            .map(|(l, h)| (l.as_path(), h.as_path()))
    }
}

/// Finds `<data_dir>/images/train/{low,high}/*.tif` and pairs them.
///
/// Both counts are reported to `sink` as `no_of_lr_images` / `no_of_hr_images` before the
/// lengths are compared, so a mismatching run still records what it saw.
pub fn list_images<P: AsRef<Path>>(data_dir: P, sink: &dyn ParamSink) -> Result<ImagePairs> {
    let data_dir = data_dir.as_ref();
    let high = list_sorted(&join_all(data_dir, &HIGH_RES_DIR))?;
    let low = list_sorted(&join_all(data_dir, &LOW_RES_DIR))?;

    info!(
        no_of_hr_images = high.len(),
        no_of_lr_images = low.len(),
        "located training images in {}",
        data_dir.display()
    );
    sink.log_param("no_of_hr_images", json!(high.len()));
    sink.log_param("no_of_lr_images", json!(low.len()));

    ImagePairs::new(low, high)
}

fn join_all(root: &Path, parts: &[&str]) -> PathBuf {
    parts.iter().fold(root.to_path_buf(), |dir, part| dir.join(part))
}

fn list_sorted(dir: &Path) -> Result<Vec<PathBuf>> {
    // the directory itself may contain glob metacharacters
    let pattern = Path::new(&Pattern::escape(&dir.to_string_lossy()))
        .join(format!("*.{IMAGE_EXTENSION}"));
    let mut files = glob(&pattern.to_string_lossy())?.collect::<std::result::Result<Vec<_>, _>>()?;
    files.sort_by(|a, b| natural_cmp(&a.to_string_lossy(), &b.to_string_lossy()));
    Ok(files)
}

/// Orders strings so that embedded numbers compare by value: `img2` < `img10`.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut lhs = a.chars().peekable();
    let mut rhs = b.chars().peekable();

    loop {
        match (lhs.peek().copied(), rhs.peek().copied()) {
            (None, None) => return a.cmp(b),
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) if x.is_ascii_digit() && y.is_ascii_digit() => {
                let left = take_digits(&mut lhs);
                let right = take_digits(&mut rhs);
                let ord = cmp_numeric(&left, &right);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            (Some(x), Some(y)) => {
                if x != y {
                    return x.cmp(&y);
                }
                lhs.next();
                rhs.next();
            }
        }
    }
}

fn take_digits(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> String {
    let mut digits = String::new();
    while let Some(c) = chars.next_if(|c| c.is_ascii_digit()) {
        digits.push(c);
    }
    digits
}

// Arbitrary length digit runs, compared without parsing.
fn cmp_numeric(a: &str, b: &str) -> Ordering {
    let a = a.trim_start_matches('0');
    let b = b.trim_start_matches('0');
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}
