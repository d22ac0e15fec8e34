//! Feature extractors: eigen (PCA) and Fisher (PCA+LDA) projections, and
//! Dalal-Triggs HOG descriptors.

mod eigen;
mod fisher;
mod hog;

pub use self::eigen::EigenExtractor;
pub use self::fisher::FisherExtractor;
pub use self::hog::HogExtractor;

use image::GrayImage;
use nalgebra::DMatrix;

use crate::error::Result;

/// Maps a batch of fixed-size grayscale images to a feature matrix, one
/// feature vector per row.
pub trait Extractor {
    /// Learns the extractor parameters. Extractors without a trained
    /// projection (HOG) treat this as a no-op.
    fn train(&mut self, images: &[GrayImage], labels: &[usize]) -> Result<()> {
        let _ = (images, labels);
        Ok(())
    }

    fn extract(&self, images: &[GrayImage]) -> Result<DMatrix<f32>>;

    /// Feature dimensionality, zero until known.
    fn feat_dim(&self) -> usize;
}

/// Projection-based extractor selection for the KNN sign classifier,
/// decided by configuration and persisted with the model.
#[derive(serde::Serialize, serde::Deserialize)]
pub enum ProjectionExtractor {
    Eigen(EigenExtractor),
    Fisher(FisherExtractor),
}

impl Extractor for ProjectionExtractor {
    fn train(&mut self, images: &[GrayImage], labels: &[usize]) -> Result<()> {
        match self {
            ProjectionExtractor::Eigen(e) => e.train(images, labels),
            ProjectionExtractor::Fisher(e) => e.train(images, labels),
        }
    }

    fn extract(&self, images: &[GrayImage]) -> Result<DMatrix<f32>> {
        match self {
            ProjectionExtractor::Eigen(e) => e.extract(images),
            ProjectionExtractor::Fisher(e) => e.extract(images),
        }
    }

    fn feat_dim(&self) -> usize {
        match self {
            ProjectionExtractor::Eigen(e) => e.feat_dim(),
            ProjectionExtractor::Fisher(e) => e.feat_dim(),
        }
    }
}
