//! Brute-force k-nearest-neighbour classifier.

use nalgebra::DMatrix;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::classifier::{check_training_shape, Classifier, Prediction};
use crate::error::{Error, Result};
use crate::math::Normalizer;

#[derive(Serialize, Deserialize)]
pub struct KnnClassifier {
    near_num: usize,
    normalizer: Option<Normalizer>,
    samples: Option<DMatrix<f32>>,
    labels: Vec<usize>,
}

impl KnnClassifier {
    pub fn new(near_num: usize) -> Self {
        assert!(near_num > 0, "illegal neighbour count: {}", near_num);
        KnnClassifier {
            near_num,
            normalizer: None,
            samples: None,
            labels: Vec::new(),
        }
    }

    /// Predicts a label per row together with the mean distance to the
    /// nearest neighbours. The distance drives open-set rejection in the
    /// sign classifier.
    pub fn predict_with_distance(&self, feats: &DMatrix<f32>) -> Result<Vec<(usize, f32)>> {
        let samples = self.samples.as_ref().ok_or(Error::NotTrained)?;
        let normalizer = self.normalizer.as_ref().ok_or(Error::NotTrained)?;
        if feats.ncols() != samples.ncols() {
            return Err(Error::ShapeMismatch(format!(
                "KNN was trained on {}-dimensional features, got {}",
                samples.ncols(),
                feats.ncols()
            )));
        }

        let feats = normalizer.apply(feats);
        let k = self.near_num.min(samples.nrows());
        let rows: Vec<usize> = (0..feats.nrows()).collect();
        Ok(rows
            .par_iter()
            .map(|&i| {
                let query = feats.row(i);
                let mut distances: Vec<(f32, usize)> = samples
                    .row_iter()
                    .zip(self.labels.iter())
                    .map(|(row, &label)| ((row - query).norm(), label))
                    .collect();
                distances
                    .sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
                distances.truncate(k);

                let mut votes: Vec<(usize, usize)> = Vec::new();
                let mut mean_distance = 0.0;
                for &(distance, label) in &distances {
                    mean_distance += distance;
                    match votes.iter_mut().find(|(l, _)| *l == label) {
                        Some((_, count)) => *count += 1,
                        None => votes.push((label, 1)),
                    }
                }
                mean_distance /= k as f32;
                let label = votes
                    .iter()
                    .max_by_key(|&&(_, count)| count)
                    .map(|&(label, _)| label)
                    .unwrap_or(0);
                (label, mean_distance)
            })
            .collect())
    }
}

impl Classifier for KnnClassifier {
    fn train(&mut self, feats: &DMatrix<f32>, labels: &[usize]) -> Result<()> {
        check_training_shape(feats, labels)?;
        let normalizer = Normalizer::fit(feats);
        self.samples = Some(normalizer.apply(feats));
        self.normalizer = Some(normalizer);
        self.labels = labels.to_vec();
        Ok(())
    }

    fn predict_prob(&self, feats: &DMatrix<f32>) -> Result<Vec<Prediction>> {
        let k = self
            .near_num
            .min(self.samples.as_ref().ok_or(Error::NotTrained)?.nrows());
        Ok(self
            .predict_with_distance(feats)?
            .into_iter()
            .map(|(label, _)| Prediction {
                label,
                // Vote share is not tracked per class here; the winning
                // label always holds at least a plurality of k votes.
                prob: 1.0 / k.max(1) as f32,
            })
            .collect())
    }
}
