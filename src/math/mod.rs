//! Matrix and statistics helpers used by the extractors and classifiers.

use image::GrayImage;
use nalgebra::{DMatrix, RowDVector};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Per-column min-max normalization: `X' = (X - offset) / range`.
///
/// Learned on the training features and applied to everything that goes
/// through the classifier afterwards.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Normalizer {
    offset: RowDVector<f32>,
    range: RowDVector<f32>,
}

impl Normalizer {
    pub fn fit(feats: &DMatrix<f32>) -> Self {
        let ncols = feats.ncols();
        let mut offset = RowDVector::zeros(ncols);
        let mut range = RowDVector::zeros(ncols);
        for j in 0..ncols {
            let col = feats.column(j);
            let min = col.min();
            let max = col.max();
            offset[j] = min;
            // Constant columns map to zero instead of NaN.
            range[j] = if max > min { max - min } else { 1.0 };
        }
        Normalizer { offset, range }
    }

    pub fn apply(&self, feats: &DMatrix<f32>) -> DMatrix<f32> {
        let mut out = feats.clone();
        for mut row in out.row_iter_mut() {
            for j in 0..row.ncols() {
                row[j] = (row[j] - self.offset[j]) / self.range[j];
            }
        }
        out
    }
}

/// Flattens a batch of grayscale images into a row-major feature matrix,
/// one image per row. All images must share the dimensions of the first.
pub fn images_to_rows(images: &[GrayImage]) -> Result<DMatrix<f32>> {
    let first = images
        .first()
        .ok_or_else(|| Error::ShapeMismatch("empty image batch".into()))?;
    let (width, height) = (first.width(), first.height());
    let dim = (width * height) as usize;
    let mut data = Vec::with_capacity(images.len() * dim);
    for image in images {
        if image.width() != width || image.height() != height {
            return Err(Error::ShapeMismatch(format!(
                "expected {}x{} image, got {}x{}",
                first.width(),
                first.height(),
                image.width(),
                image.height()
            )));
        }
        data.extend(image.as_raw().iter().map(|&p| f32::from(p)));
    }
    Ok(DMatrix::from_row_slice(images.len(), dim, &data))
}

pub fn unique_class_count(labels: &[usize]) -> usize {
    let mut seen: Vec<usize> = labels.to_vec();
    seen.sort_unstable();
    seen.dedup();
    seen.len()
}

pub fn mean_std(values: &[f32]) -> (f32, f32) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f32;
    let mean = values.iter().sum::<f32>() / n;
    let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n;
    (mean, var.max(0.0).sqrt())
}
