//! Eigenfeature (PCA) extractor.

use image::GrayImage;
use nalgebra::{DMatrix, RowDVector};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::feat::Extractor;
use crate::math::images_to_rows;

/// Projects flattened grayscale images onto the top principal axes of the
/// training set.
#[derive(Serialize, Deserialize)]
pub struct EigenExtractor {
    requested_dim: usize,
    mean: Option<RowDVector<f32>>,
    /// Principal axes, one per row, unit length.
    axes: Option<DMatrix<f32>>,
}

impl EigenExtractor {
    /// `feat_dim` of zero keeps every component.
    pub fn new(feat_dim: usize) -> Self {
        EigenExtractor {
            requested_dim: feat_dim,
            mean: None,
            axes: None,
        }
    }

    fn center(&self, rows: &DMatrix<f32>) -> Result<DMatrix<f32>> {
        let mean = self.mean.as_ref().ok_or(Error::NotTrained)?;
        let mut centered = rows.clone();
        for mut row in centered.row_iter_mut() {
            row -= mean;
        }
        Ok(centered)
    }
}

impl Extractor for EigenExtractor {
    fn train(&mut self, images: &[GrayImage], _labels: &[usize]) -> Result<()> {
        let rows = images_to_rows(images)?;
        let (fitted_mean, axes) = fit_pca(&rows, self.requested_dim)?;
        self.mean = Some(fitted_mean);
        self.axes = Some(axes);
        Ok(())
    }

    fn extract(&self, images: &[GrayImage]) -> Result<DMatrix<f32>> {
        let axes = self.axes.as_ref().ok_or(Error::NotTrained)?;
        let rows = images_to_rows(images)?;
        if rows.ncols() != axes.ncols() {
            return Err(Error::ShapeMismatch(format!(
                "PCA was trained on {}-dimensional images, got {}",
                axes.ncols(),
                rows.ncols()
            )));
        }
        let centered = self.center(&rows)?;
        Ok(&centered * axes.transpose())
    }

    fn feat_dim(&self) -> usize {
        self.axes.as_ref().map_or(0, |a| a.nrows())
    }
}

/// Fits a PCA basis: returns the column mean and the top-`dim` principal
/// axes (all of them when `dim` is zero). Shared with the Fisher extractor.
pub(crate) fn fit_pca(rows: &DMatrix<f32>, dim: usize) -> Result<(RowDVector<f32>, DMatrix<f32>)> {
    if rows.nrows() == 0 {
        return Err(Error::ShapeMismatch("empty training batch".into()));
    }
    let mean = rows.row_mean();
    let mut centered = rows.clone();
    for mut row in centered.row_iter_mut() {
        row -= &mean;
    }

    let max_components = rows.nrows().min(rows.ncols());
    let k = if dim == 0 {
        max_components
    } else {
        dim.min(max_components)
    };

    // Principal axes are the right singular vectors of the centered data.
    let svd = centered.svd(false, true);
    let v_t = svd
        .v_t
        .ok_or_else(|| Error::ShapeMismatch("SVD failed to produce singular vectors".into()))?;
    Ok((mean, v_t.rows(0, k).into_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use image::Luma;

    fn half_bright(left: bool) -> GrayImage {
        GrayImage::from_fn(4, 4, |x, _| {
            if (x < 2) == left {
                Luma([200])
            } else {
                Luma([20])
            }
        })
    }

    #[test]
    fn test_untrained_extract_fails() {
        let extractor = EigenExtractor::new(2);
        let images = vec![half_bright(true)];
        assert!(extractor.extract(&images).is_err());
    }

    #[test]
    fn test_projection_separates_patterns() {
        let images = vec![
            half_bright(true),
            half_bright(true),
            half_bright(false),
            half_bright(false),
        ];
        let mut extractor = EigenExtractor::new(1);
        extractor.train(&images, &[1, 1, 2, 2]).unwrap();
        assert_eq!(1, extractor.feat_dim());

        let feats = extractor.extract(&images).unwrap();
        // Same-pattern images land on the same side of the first axis.
        assert_relative_eq!(feats[(0, 0)], feats[(1, 0)], epsilon = 1e-3);
        assert_relative_eq!(feats[(2, 0)], feats[(3, 0)], epsilon = 1e-3);
        assert!((feats[(0, 0)] - feats[(2, 0)]).abs() > 1.0);
    }

    #[test]
    fn test_requested_dim_is_capped() {
        let images = vec![half_bright(true), half_bright(false)];
        let mut extractor = EigenExtractor::new(100);
        extractor.train(&images, &[1, 2]).unwrap();
        assert!(extractor.feat_dim() <= 2);
    }

    #[test]
    fn test_zero_dim_keeps_all_components() {
        let images = vec![
            half_bright(true),
            half_bright(false),
            half_bright(true),
        ];
        let mut extractor = EigenExtractor::new(0);
        extractor.train(&images, &[1, 2, 1]).unwrap();
        assert_eq!(3, extractor.feat_dim());
    }
}
