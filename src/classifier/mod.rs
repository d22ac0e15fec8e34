//! Multi-class classifiers over feature matrices: brute-force KNN, an
//! SMO-trained RBF SVM and a random forest.

mod forest;
mod knn;
mod svm;

pub use self::forest::{ForestClassifier, ForestParams};
pub use self::knn::KnnClassifier;
pub use self::svm::SvmClassifier;

use nalgebra::DMatrix;

use crate::error::Result;

/// A predicted label with its confidence. KNN reports vote share here;
/// its open-set distance lives in [`KnnClassifier::predict_with_distance`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Prediction {
    pub label: usize,
    pub prob: f32,
}

pub trait Classifier {
    fn train(&mut self, feats: &DMatrix<f32>, labels: &[usize]) -> Result<()>;

    fn predict(&self, feats: &DMatrix<f32>) -> Result<Vec<usize>> {
        Ok(self
            .predict_prob(feats)?
            .into_iter()
            .map(|p| p.label)
            .collect())
    }

    fn predict_prob(&self, feats: &DMatrix<f32>) -> Result<Vec<Prediction>>;
}

pub(crate) fn check_training_shape(feats: &DMatrix<f32>, labels: &[usize]) -> Result<()> {
    if feats.nrows() != labels.len() {
        return Err(crate::error::Error::ShapeMismatch(format!(
            "{} feature rows but {} labels",
            feats.nrows(),
            labels.len()
        )));
    }
    if feats.nrows() == 0 {
        return Err(crate::error::Error::ShapeMismatch(
            "empty training set".into(),
        ));
    }
    Ok(())
}
