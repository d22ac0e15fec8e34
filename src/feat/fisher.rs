//! Fisher (PCA + LDA) extractor.
//!
//! PCA reduces the flattened images to `n - c` dimensions so the
//! within-class scatter is invertible, then LDA finds the `c - 1`
//! most discriminative directions. Only the combined projection matrix
//! and the mean survive training.

use std::collections::BTreeMap;

use image::GrayImage;
use nalgebra::{Cholesky, DMatrix, DVector, RowDVector, SymmetricEigen};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::feat::eigen::fit_pca;
use crate::feat::Extractor;
use crate::math::{images_to_rows, unique_class_count};

const SCATTER_REGULARIZATION: f32 = 1e-4;

#[derive(Serialize, Deserialize)]
pub struct FisherExtractor {
    mean: Option<RowDVector<f32>>,
    /// Combined PCA+LDA projection, one output direction per row.
    projection: Option<DMatrix<f32>>,
}

impl Default for FisherExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl FisherExtractor {
    pub fn new() -> Self {
        FisherExtractor {
            mean: None,
            projection: None,
        }
    }
}

impl Extractor for FisherExtractor {
    fn train(&mut self, images: &[GrayImage], labels: &[usize]) -> Result<()> {
        if images.len() != labels.len() {
            return Err(Error::ShapeMismatch(format!(
                "{} images but {} labels",
                images.len(),
                labels.len()
            )));
        }
        let rows = images_to_rows(images)?;
        let n = rows.nrows();
        let num_classes = unique_class_count(labels);
        if num_classes < 2 || n <= num_classes {
            return Err(Error::ShapeMismatch(format!(
                "Fisher training needs more samples ({}) than classes ({})",
                n, num_classes
            )));
        }

        let pca_dim = n - num_classes;
        let (mean, pca_axes) = fit_pca(&rows, pca_dim)?;
        let mut centered = rows.clone();
        for mut row in centered.row_iter_mut() {
            row -= &mean;
        }
        let reduced = &centered * pca_axes.transpose();
        let lda = fit_lda(&reduced, labels, num_classes - 1)?;

        // Collapse both projections into a single matrix over pixel space.
        self.projection = Some(&lda * &pca_axes);
        self.mean = Some(mean);
        Ok(())
    }

    fn extract(&self, images: &[GrayImage]) -> Result<DMatrix<f32>> {
        let projection = self.projection.as_ref().ok_or(Error::NotTrained)?;
        let mean = self.mean.as_ref().ok_or(Error::NotTrained)?;
        let rows = images_to_rows(images)?;
        if rows.ncols() != projection.ncols() {
            return Err(Error::ShapeMismatch(format!(
                "Fisher projection was trained on {}-dimensional images, got {}",
                projection.ncols(),
                rows.ncols()
            )));
        }
        let mut centered = rows;
        for mut row in centered.row_iter_mut() {
            row -= mean;
        }
        Ok(&centered * projection.transpose())
    }

    fn feat_dim(&self) -> usize {
        self.projection.as_ref().map_or(0, |p| p.nrows())
    }
}

/// Solves the Fisher criterion in the PCA subspace. Returns the `dim` most
/// discriminative directions, one per row.
///
/// The generalized eigenproblem `Sb w = lambda Sw w` is reduced to a
/// symmetric one through the Cholesky factor of `Sw`.
fn fit_lda(feats: &DMatrix<f32>, labels: &[usize], dim: usize) -> Result<DMatrix<f32>> {
    let d = feats.ncols();
    let global_mean: DVector<f32> = feats.row_mean().transpose();

    let mut by_class: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (i, &label) in labels.iter().enumerate() {
        by_class.entry(label).or_default().push(i);
    }

    let mut sw = DMatrix::<f32>::zeros(d, d);
    let mut sb = DMatrix::<f32>::zeros(d, d);
    for indices in by_class.values() {
        let mut class_mean = DVector::<f32>::zeros(d);
        for &i in indices {
            class_mean += feats.row(i).transpose();
        }
        class_mean /= indices.len() as f32;

        for &i in indices {
            let diff = feats.row(i).transpose() - &class_mean;
            sw += &diff * diff.transpose();
        }
        let between = &class_mean - &global_mean;
        sb += (&between * between.transpose()) * indices.len() as f32;
    }
    for i in 0..d {
        sw[(i, i)] += SCATTER_REGULARIZATION;
    }

    let chol = Cholesky::new(sw)
        .ok_or_else(|| Error::ShapeMismatch("within-class scatter is not positive definite".into()))?;
    let l_inv = chol
        .l()
        .try_inverse()
        .ok_or_else(|| Error::ShapeMismatch("failed to invert scatter factor".into()))?;

    // Symmetric equivalent of Sw^-1 Sb.
    let m = &l_inv * &sb * l_inv.transpose();
    let m = (&m + m.transpose()) * 0.5;
    let eigen = SymmetricEigen::new(m);

    let mut order: Vec<usize> = (0..d).collect();
    order.sort_by(|&a, &b| {
        eigen.eigenvalues[b]
            .partial_cmp(&eigen.eigenvalues[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let dim = dim.min(d);
    let mut directions = DMatrix::<f32>::zeros(dim, d);
    for (row, &idx) in order.iter().take(dim).enumerate() {
        let w = l_inv.transpose() * eigen.eigenvectors.column(idx);
        let norm = w.norm();
        let w = if norm > 0.0 { w / norm } else { w };
        directions.set_row(row, &w.transpose());
    }
    Ok(directions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn patterned(seed: u8, bright_row: u32) -> GrayImage {
        GrayImage::from_fn(4, 4, |x, y| {
            if y == bright_row {
                Luma([220_u8.saturating_sub(seed)])
            } else {
                Luma([10 + seed + x as u8])
            }
        })
    }

    #[test]
    fn test_feat_dim_is_classes_minus_one() {
        let images: Vec<GrayImage> = (0..9)
            .map(|i| patterned(i as u8, (i % 3) as u32))
            .collect();
        let labels: Vec<usize> = (0..9).map(|i| i % 3 + 1).collect();
        let mut extractor = FisherExtractor::new();
        extractor.train(&images, &labels).unwrap();
        assert_eq!(2, extractor.feat_dim());
    }

    #[test]
    fn test_projection_clusters_classes() {
        let images: Vec<GrayImage> = (0..8)
            .map(|i| patterned(i as u8, (i % 2) as u32))
            .collect();
        let labels: Vec<usize> = (0..8).map(|i| i % 2 + 1).collect();
        let mut extractor = FisherExtractor::new();
        extractor.train(&images, &labels).unwrap();

        let feats = extractor.extract(&images).unwrap();
        // Within-class spread must be small relative to the class gap.
        let a: Vec<f32> = (0..8).filter(|i| i % 2 == 0).map(|i| feats[(i, 0)]).collect();
        let b: Vec<f32> = (0..8).filter(|i| i % 2 == 1).map(|i| feats[(i, 0)]).collect();
        let mean_a = a.iter().sum::<f32>() / a.len() as f32;
        let mean_b = b.iter().sum::<f32>() / b.len() as f32;
        let spread_a = a.iter().map(|v| (v - mean_a).abs()).fold(0.0f32, f32::max);
        let spread_b = b.iter().map(|v| (v - mean_b).abs()).fold(0.0f32, f32::max);
        assert!((mean_a - mean_b).abs() > 4.0 * (spread_a + spread_b).max(1e-3));
    }

    #[test]
    fn test_single_class_fails() {
        let images: Vec<GrayImage> = (0..4).map(|i| patterned(i as u8, 0)).collect();
        let mut extractor = FisherExtractor::new();
        assert!(extractor.train(&images, &[1, 1, 1, 1]).is_err());
    }
}
