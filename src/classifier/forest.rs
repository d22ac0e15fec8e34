//! Random forest of CART trees with Gini impurity splits.

use nalgebra::DMatrix;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::classifier::{check_training_shape, Classifier, Prediction};
use crate::error::{Error, Result};

const FOREST_SEED: u64 = 0x5eed_f0e5;

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ForestParams {
    pub max_depth: usize,
    pub min_samples: usize,
    pub num_trees: usize,
}

impl Default for ForestParams {
    fn default() -> Self {
        ForestParams {
            max_depth: 13,
            min_samples: 10,
            num_trees: 200,
        }
    }
}

#[derive(Serialize, Deserialize)]
pub struct ForestClassifier {
    params: ForestParams,
    classes: Vec<usize>,
    trees: Vec<TreeNode>,
}

#[derive(Serialize, Deserialize)]
enum TreeNode {
    Leaf {
        /// Index into the forest's class list.
        class: usize,
    },
    Split {
        feature: usize,
        threshold: f32,
        left: Box<TreeNode>,
        right: Box<TreeNode>,
    },
}

impl TreeNode {
    fn classify(&self, feats: &DMatrix<f32>, row: usize) -> usize {
        match self {
            TreeNode::Leaf { class } => *class,
            TreeNode::Split {
                feature,
                threshold,
                left,
                right,
            } => {
                if feats[(row, *feature)] <= *threshold {
                    left.classify(feats, row)
                } else {
                    right.classify(feats, row)
                }
            }
        }
    }
}

impl Default for ForestClassifier {
    fn default() -> Self {
        ForestClassifier::new(ForestParams::default())
    }
}

impl ForestClassifier {
    pub fn new(params: ForestParams) -> Self {
        assert!(params.num_trees > 0, "illegal tree count");
        assert!(params.max_depth > 0, "illegal tree depth");
        ForestClassifier {
            params,
            classes: Vec::new(),
            trees: Vec::new(),
        }
    }
}

impl Classifier for ForestClassifier {
    fn train(&mut self, feats: &DMatrix<f32>, labels: &[usize]) -> Result<()> {
        check_training_shape(feats, labels)?;

        let mut classes: Vec<usize> = labels.to_vec();
        classes.sort_unstable();
        classes.dedup();
        if classes.len() < 2 {
            return Err(Error::ShapeMismatch(
                "forest training needs at least two classes".into(),
            ));
        }
        // Class indices instead of raw labels inside the trees.
        let targets: Vec<usize> = labels
            .iter()
            .map(|label| classes.binary_search(label).unwrap_or(0))
            .collect();

        let trainer = TreeTrainer {
            feats,
            targets: &targets,
            num_classes: classes.len(),
            params: self.params,
        };
        self.trees = (0..self.params.num_trees)
            .into_par_iter()
            .map(|tree| {
                let mut rng = StdRng::seed_from_u64(FOREST_SEED.wrapping_add(tree as u64));
                trainer.grow(&mut rng)
            })
            .collect();
        self.classes = classes;
        Ok(())
    }

    fn predict_prob(&self, feats: &DMatrix<f32>) -> Result<Vec<Prediction>> {
        if self.trees.is_empty() {
            return Err(Error::NotTrained);
        }

        let rows: Vec<usize> = (0..feats.nrows()).collect();
        Ok(rows
            .par_iter()
            .map(|&row| {
                let mut votes = vec![0usize; self.classes.len()];
                for tree in &self.trees {
                    votes[tree.classify(feats, row)] += 1;
                }
                let best = votes
                    .iter()
                    .enumerate()
                    .max_by_key(|&(_, &count)| count)
                    .map(|(idx, _)| idx)
                    .unwrap_or(0);
                Prediction {
                    label: self.classes[best],
                    prob: votes[best] as f32 / self.trees.len() as f32,
                }
            })
            .collect())
    }
}

struct TreeTrainer<'a> {
    feats: &'a DMatrix<f32>,
    targets: &'a [usize],
    num_classes: usize,
    params: ForestParams,
}

impl TreeTrainer<'_> {
    /// Grows one tree on a bootstrap sample of the training rows.
    fn grow(&self, rng: &mut StdRng) -> TreeNode {
        let n = self.feats.nrows();
        let sample: Vec<usize> = (0..n).map(|_| rng.gen_range(0..n)).collect();
        self.split(sample, 0, rng)
    }

    fn split(&self, rows: Vec<usize>, depth: usize, rng: &mut StdRng) -> TreeNode {
        let counts = self.class_counts(&rows);
        let majority = counts
            .iter()
            .enumerate()
            .max_by_key(|&(_, &count)| count)
            .map(|(class, _)| class)
            .unwrap_or(0);
        let pure = counts.iter().filter(|&&count| count > 0).count() <= 1;
        if pure || depth >= self.params.max_depth || rows.len() < self.params.min_samples {
            return TreeNode::Leaf { class: majority };
        }

        // Evaluate a random sqrt(d) subset of the features.
        let d = self.feats.ncols();
        let mut features: Vec<usize> = (0..d).collect();
        features.shuffle(rng);
        features.truncate(((d as f64).sqrt().ceil() as usize).max(1));

        // One sorted sweep per feature with running class counts.
        let total = rows.len() as f32;
        let mut best: Option<(f32, usize, f32)> = None;
        for &feature in &features {
            let mut order = rows.clone();
            order.sort_by(|&a, &b| {
                self.feats[(a, feature)]
                    .partial_cmp(&self.feats[(b, feature)])
                    .unwrap_or(std::cmp::Ordering::Equal)
            });

            let mut left = vec![0usize; self.num_classes];
            let mut right = counts.clone();
            for w in 0..order.len() - 1 {
                let class = self.targets[order[w]];
                left[class] += 1;
                right[class] -= 1;

                let value = self.feats[(order[w], feature)];
                let next = self.feats[(order[w + 1], feature)];
                if next <= value {
                    continue;
                }
                let impurity = (gini(&left) * (w + 1) as f32
                    + gini(&right) * (order.len() - w - 1) as f32)
                    / total;
                if best.map_or(true, |(score, _, _)| impurity < score) {
                    best = Some((impurity, feature, (value + next) * 0.5));
                }
            }
        }

        let (_, feature, threshold) = match best {
            Some(found) => found,
            None => return TreeNode::Leaf { class: majority },
        };
        let (left_rows, right_rows): (Vec<usize>, Vec<usize>) = rows
            .into_iter()
            .partition(|&r| self.feats[(r, feature)] <= threshold);
        if left_rows.is_empty() || right_rows.is_empty() {
            return TreeNode::Leaf { class: majority };
        }
        TreeNode::Split {
            feature,
            threshold,
            left: Box::new(self.split(left_rows, depth + 1, rng)),
            right: Box::new(self.split(right_rows, depth + 1, rng)),
        }
    }

    fn class_counts(&self, rows: &[usize]) -> Vec<usize> {
        let mut counts = vec![0usize; self.num_classes];
        for &row in rows {
            counts[self.targets[row]] += 1;
        }
        counts
    }
}

fn gini(counts: &[usize]) -> f32 {
    let total = counts.iter().sum::<usize>() as f32;
    if total == 0.0 {
        return 0.0;
    }
    let mut impurity = 1.0;
    for &count in counts {
        let p = count as f32 / total;
        impurity -= p * p;
    }
    impurity
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::DMatrix;

    fn two_bands() -> (DMatrix<f32>, Vec<usize>) {
        let mut data = Vec::new();
        let mut labels = Vec::new();
        for k in 0..20 {
            let offset = 0.05 * k as f32;
            data.push(offset);
            data.push(1.0 - offset);
            labels.push(1);
            data.push(5.0 + offset);
            data.push(6.0 - offset);
            labels.push(2);
        }
        (DMatrix::from_row_slice(40, 2, &data), labels)
    }

    fn small_params() -> ForestParams {
        ForestParams {
            max_depth: 6,
            min_samples: 2,
            num_trees: 25,
        }
    }

    #[test]
    fn test_separable_bands() {
        let (feats, labels) = two_bands();
        let mut forest = ForestClassifier::new(small_params());
        forest.train(&feats, &labels).unwrap();

        let queries = DMatrix::from_row_slice(2, 2, &[0.3, 0.7, 5.4, 5.6]);
        assert_eq!(vec![1, 2], forest.predict(&queries).unwrap());
    }

    #[test]
    fn test_vote_share_near_unanimous_far_from_boundary() {
        let (feats, labels) = two_bands();
        let mut forest = ForestClassifier::new(small_params());
        forest.train(&feats, &labels).unwrap();

        let queries = DMatrix::from_row_slice(1, 2, &[0.0, 1.0]);
        let prediction = forest.predict_prob(&queries).unwrap()[0];
        assert_eq!(1, prediction.label);
        assert!(prediction.prob > 0.9);
    }

    #[test]
    fn test_training_is_deterministic() {
        let (feats, labels) = two_bands();
        let queries = DMatrix::from_row_slice(3, 2, &[0.5, 0.5, 3.0, 3.0, 5.5, 5.5]);

        let mut first = ForestClassifier::new(small_params());
        first.train(&feats, &labels).unwrap();
        let mut second = ForestClassifier::new(small_params());
        second.train(&feats, &labels).unwrap();

        let a: Vec<Prediction> = first.predict_prob(&queries).unwrap();
        let b: Vec<Prediction> = second.predict_prob(&queries).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_untrained_predict_fails() {
        let forest = ForestClassifier::default();
        let queries = DMatrix::from_row_slice(1, 2, &[0.0, 0.0]);
        assert!(forest.predict(&queries).is_err());
    }
}
