//! C-SVC with an RBF kernel, trained with a simplified SMO solver.
//! Multi-class decisions use one-vs-one voting.

use nalgebra::{DMatrix, DVector, RowDVector};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::classifier::{check_training_shape, Classifier, Prediction};
use crate::error::{Error, Result};
use crate::math::Normalizer;

const SMO_TOLERANCE: f32 = 1e-3;
const SMO_MAX_PASSES: usize = 8;
const SMO_MAX_ITERATIONS: usize = 2000;
const ALPHA_EPSILON: f32 = 1e-8;

#[derive(Serialize, Deserialize)]
pub struct SvmClassifier {
    c: f32,
    gamma: Option<f32>,
    normalizer: Option<Normalizer>,
    classes: Vec<usize>,
    machines: Vec<BinarySvm>,
}

/// One trained one-vs-one machine: support vectors and their
/// label-signed coefficients.
#[derive(Serialize, Deserialize)]
struct BinarySvm {
    pos: usize,
    neg: usize,
    support: DMatrix<f32>,
    coeffs: DVector<f32>,
    bias: f32,
}

impl Default for SvmClassifier {
    fn default() -> Self {
        SvmClassifier::new(125.0)
    }
}

impl SvmClassifier {
    /// `c` is the soft-margin penalty. The kernel width defaults to
    /// `1 / feat_dim` at training time.
    pub fn new(c: f32) -> Self {
        assert!(c > 0.0, "illegal penalty: {}", c);
        SvmClassifier {
            c,
            gamma: None,
            normalizer: None,
            classes: Vec::new(),
            machines: Vec::new(),
        }
    }

    pub fn with_gamma(c: f32, gamma: f32) -> Self {
        let mut svm = SvmClassifier::new(c);
        svm.gamma = Some(gamma);
        svm
    }

    fn decision(&self, machine: &BinarySvm, gamma: f32, x: &RowDVector<f32>) -> f32 {
        let mut sum = machine.bias;
        for (row, &coeff) in machine.support.row_iter().zip(machine.coeffs.iter()) {
            sum += coeff * rbf(gamma, (row - x).norm_squared());
        }
        sum
    }
}

fn rbf(gamma: f32, squared_distance: f32) -> f32 {
    (-gamma * squared_distance).exp()
}

impl Classifier for SvmClassifier {
    fn train(&mut self, feats: &DMatrix<f32>, labels: &[usize]) -> Result<()> {
        check_training_shape(feats, labels)?;

        let normalizer = Normalizer::fit(feats);
        let feats = normalizer.apply(feats);
        self.normalizer = Some(normalizer);

        let gamma = self.gamma.unwrap_or(1.0 / feats.ncols() as f32);
        self.gamma = Some(gamma);

        let mut classes: Vec<usize> = labels.to_vec();
        classes.sort_unstable();
        classes.dedup();
        if classes.len() < 2 {
            return Err(Error::ShapeMismatch(
                "SVM training needs at least two classes".into(),
            ));
        }

        self.machines.clear();
        for (i, &pos) in classes.iter().enumerate() {
            for &neg in &classes[i + 1..] {
                let indices: Vec<usize> = (0..labels.len())
                    .filter(|&k| labels[k] == pos || labels[k] == neg)
                    .collect();
                let subset = DMatrix::from_fn(indices.len(), feats.ncols(), |r, c| {
                    feats[(indices[r], c)]
                });
                let targets: Vec<f32> = indices
                    .iter()
                    .map(|&k| if labels[k] == pos { 1.0 } else { -1.0 })
                    .collect();
                self.machines.push(train_smo(
                    pos, neg, subset, &targets, self.c, gamma,
                ));
            }
        }
        self.classes = classes;
        Ok(())
    }

    fn predict_prob(&self, feats: &DMatrix<f32>) -> Result<Vec<Prediction>> {
        if self.machines.is_empty() {
            return Err(Error::NotTrained);
        }
        let normalizer = self.normalizer.as_ref().ok_or(Error::NotTrained)?;
        let gamma = self.gamma.ok_or(Error::NotTrained)?;
        let feats = normalizer.apply(feats);

        let mut predictions = Vec::with_capacity(feats.nrows());
        for i in 0..feats.nrows() {
            let x = RowDVector::from_iterator(feats.ncols(), feats.row(i).iter().copied());
            let mut votes = vec![0usize; self.classes.len()];
            for machine in &self.machines {
                let winner = if self.decision(machine, gamma, &x) >= 0.0 {
                    machine.pos
                } else {
                    machine.neg
                };
                if let Some(idx) = self.classes.iter().position(|&c| c == winner) {
                    votes[idx] += 1;
                }
            }
            let best = votes
                .iter()
                .enumerate()
                .max_by_key(|&(_, &count)| count)
                .map(|(idx, _)| idx)
                .unwrap_or(0);
            predictions.push(Prediction {
                label: self.classes[best],
                // A class is compared against every other class once.
                prob: votes[best] as f32 / (self.classes.len() - 1) as f32,
            });
        }
        Ok(predictions)
    }
}

/// Simplified SMO (Platt) over one class pair. Deterministic: the working
/// pair selection uses a seeded generator.
fn train_smo(
    pos: usize,
    neg: usize,
    feats: DMatrix<f32>,
    targets: &[f32],
    c: f32,
    gamma: f32,
) -> BinarySvm {
    let n = feats.nrows();
    let mut rng = StdRng::seed_from_u64(((pos as u64) << 32) | neg as u64);

    // Kernel matrix over the class-pair subset.
    let mut kernel = DMatrix::<f32>::zeros(n, n);
    for i in 0..n {
        for j in i..n {
            let value = rbf(gamma, (feats.row(i) - feats.row(j)).norm_squared());
            kernel[(i, j)] = value;
            kernel[(j, i)] = value;
        }
    }

    let mut alpha = vec![0.0f32; n];
    let mut bias = 0.0f32;
    let decision = |alpha: &[f32], bias: f32, kernel: &DMatrix<f32>, i: usize| -> f32 {
        let mut sum = bias;
        for k in 0..n {
            if alpha[k] > 0.0 {
                sum += alpha[k] * targets[k] * kernel[(k, i)];
            }
        }
        sum
    };

    let mut passes = 0;
    let mut iterations = 0;
    while passes < SMO_MAX_PASSES && iterations < SMO_MAX_ITERATIONS {
        iterations += 1;
        let mut changed = 0;
        for i in 0..n {
            let error_i = decision(&alpha, bias, &kernel, i) - targets[i];
            let violates = (targets[i] * error_i < -SMO_TOLERANCE && alpha[i] < c)
                || (targets[i] * error_i > SMO_TOLERANCE && alpha[i] > 0.0);
            if !violates {
                continue;
            }

            let mut j = rng.gen_range(0..n - 1);
            if j >= i {
                j += 1;
            }
            let error_j = decision(&alpha, bias, &kernel, j) - targets[j];

            let (low, high) = if targets[i] == targets[j] {
                ((alpha[i] + alpha[j] - c).max(0.0), (alpha[i] + alpha[j]).min(c))
            } else {
                ((alpha[j] - alpha[i]).max(0.0), (c + alpha[j] - alpha[i]).min(c))
            };
            if (high - low).abs() < 1e-7 {
                continue;
            }

            let eta = 2.0 * kernel[(i, j)] - kernel[(i, i)] - kernel[(j, j)];
            if eta >= 0.0 {
                continue;
            }

            let old_i = alpha[i];
            let old_j = alpha[j];
            alpha[j] = (old_j - targets[j] * (error_i - error_j) / eta).clamp(low, high);
            if (alpha[j] - old_j).abs() < 1e-5 {
                continue;
            }
            alpha[i] = old_i + targets[i] * targets[j] * (old_j - alpha[j]);

            let b1 = bias
                - error_i
                - targets[i] * (alpha[i] - old_i) * kernel[(i, i)]
                - targets[j] * (alpha[j] - old_j) * kernel[(i, j)];
            let b2 = bias
                - error_j
                - targets[i] * (alpha[i] - old_i) * kernel[(i, j)]
                - targets[j] * (alpha[j] - old_j) * kernel[(j, j)];
            bias = if alpha[i] > 0.0 && alpha[i] < c {
                b1
            } else if alpha[j] > 0.0 && alpha[j] < c {
                b2
            } else {
                (b1 + b2) * 0.5
            };
            changed += 1;
        }

        if changed == 0 {
            passes += 1;
        } else {
            passes = 0;
        }
    }

    // Keep the support vectors only.
    let support_indices: Vec<usize> = (0..n).filter(|&i| alpha[i] > ALPHA_EPSILON).collect();
    let support = DMatrix::from_fn(support_indices.len(), feats.ncols(), |r, c| {
        feats[(support_indices[r], c)]
    });
    let coeffs = DVector::from_iterator(
        support_indices.len(),
        support_indices.iter().map(|&i| alpha[i] * targets[i]),
    );
    BinarySvm {
        pos,
        neg,
        support,
        coeffs,
        bias,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::DMatrix;

    fn three_clusters() -> (DMatrix<f32>, Vec<usize>) {
        let mut data = Vec::new();
        let mut labels = Vec::new();
        let centers = [(0.0, 0.0), (10.0, 0.0), (0.0, 10.0)];
        for (class, &(cx, cy)) in centers.iter().enumerate() {
            for k in 0..6 {
                data.push(cx + 0.3 * (k % 3) as f32);
                data.push(cy + 0.3 * (k / 3) as f32);
                labels.push(class + 1);
            }
        }
        (DMatrix::from_row_slice(18, 2, &data), labels)
    }

    #[test]
    fn test_separable_clusters() {
        let (feats, labels) = three_clusters();
        let mut svm = SvmClassifier::new(10.0);
        svm.train(&feats, &labels).unwrap();

        let predicted = svm.predict(&feats).unwrap();
        assert_eq!(labels, predicted);
    }

    #[test]
    fn test_vote_share_is_full_for_clear_points() {
        let (feats, labels) = three_clusters();
        let mut svm = SvmClassifier::new(10.0);
        svm.train(&feats, &labels).unwrap();

        let queries = DMatrix::from_row_slice(1, 2, &[0.1, 0.1]);
        let prediction = svm.predict_prob(&queries).unwrap()[0];
        assert_eq!(1, prediction.label);
        assert!((prediction.prob - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_single_class_fails() {
        let feats = DMatrix::from_row_slice(2, 1, &[0.0, 1.0]);
        let mut svm = SvmClassifier::new(1.0);
        assert!(svm.train(&feats, &[1, 1]).is_err());
    }

    #[test]
    fn test_untrained_predict_fails() {
        let svm = SvmClassifier::new(1.0);
        let queries = DMatrix::from_row_slice(1, 1, &[0.0]);
        assert!(svm.predict(&queries).is_err());
    }
}
