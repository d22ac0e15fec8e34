//! Evaluation utilities for the classifiers and the detector.

use nalgebra::DMatrix;

use crate::common::{Detection, Rectangle};
use crate::error::{Error, Result};

/// Classification quality over one labelled split.
pub struct ClassifyReport {
    /// Share of non-background samples that got their exact label.
    /// Background rows never enter the denominator.
    pub tpr: f32,
    /// Misclassified positives (plus, in open-set mode, background
    /// predicted as a sign), spread over the wrong-class decision count:
    /// `(class_num - 1) * samples` open-set, `(class_num - 2) * positives`
    /// closed-set.
    pub fpr: f32,
    /// Row-normalized confusion matrix, rows = ground truth.
    pub confusion: DMatrix<f32>,
}

pub fn evaluate_classify(
    truth: &[usize],
    predicted: &[usize],
    class_num: usize,
    open_set: bool,
) -> Result<ClassifyReport> {
    if truth.len() != predicted.len() {
        return Err(Error::ShapeMismatch(format!(
            "{} ground-truth labels but {} predictions",
            truth.len(),
            predicted.len()
        )));
    }

    let mut counts = DMatrix::<f32>::zeros(class_num, class_num);
    let mut positives = 0usize;
    let mut true_positives = 0usize;
    let mut false_positives = 0usize;
    for (&gt, &pred) in truth.iter().zip(predicted) {
        if gt >= class_num || pred >= class_num {
            return Err(Error::ShapeMismatch(format!(
                "label out of range for {} classes",
                class_num
            )));
        }
        counts[(gt, pred)] += 1.0;
        if gt == 0 {
            if open_set && pred != 0 {
                false_positives += 1;
            }
        } else {
            positives += 1;
            if gt == pred {
                true_positives += 1;
            } else {
                false_positives += 1;
            }
        }
    }

    let fp_denominator = if open_set {
        (class_num - 1) * truth.len()
    } else {
        class_num.saturating_sub(2) * positives
    };

    let mut confusion = counts;
    for mut row in confusion.row_iter_mut() {
        let sum: f32 = row.iter().sum();
        if sum > 0.0 {
            row /= sum;
        }
    }
    Ok(ClassifyReport {
        tpr: ratio(true_positives, positives),
        fpr: ratio(false_positives, fp_denominator),
        confusion,
    })
}

fn ratio(num: usize, den: usize) -> f32 {
    if den == 0 {
        0.0
    } else {
        num as f32 / den as f32
    }
}

/// Default false-positives-per-window target for threshold searches.
pub const DEFAULT_TARGET_FPPW: f32 = 1e-4;

/// One point of the miss-rate / false-positives-per-window curve.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RatePoint {
    pub miss: f32,
    pub fppw: f32,
}

pub struct ThresholdReport {
    pub threshold: f32,
    /// Hit rate at the chosen threshold.
    pub accuracy: f32,
    pub curve: Vec<RatePoint>,
}

/// Finds the confidence threshold meeting a target false-positive rate.
///
/// `samples` holds one `(hit, score)` pair per classified window, where
/// `hit` marks windows that match a ground-truth sign. Thresholds are
/// swept over the observed scores; the lowest threshold whose FPPW drops
/// to the target wins. Falls back to threshold 1.0 when none qualifies.
pub fn update_threshold(samples: &[(bool, f32)], target_fppw: f32) -> ThresholdReport {
    let mut sorted: Vec<(bool, f32)> = samples.to_vec();
    sorted.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

    let total = sorted.len();
    let total_hits = sorted.iter().filter(|&&(hit, _)| hit).count();
    // Non-hits scoring at or above each candidate threshold, suffix counts.
    let mut fp_from = vec![0usize; total + 1];
    for i in (0..total).rev() {
        fp_from[i] = fp_from[i + 1] + usize::from(!sorted[i].0);
    }

    let mut curve = Vec::with_capacity(total);
    let mut chosen: Option<(f32, f32)> = None;
    let mut missed_hits = 0usize;
    for (i, &(hit, score)) in sorted.iter().enumerate() {
        let point = RatePoint {
            miss: ratio(missed_hits, total_hits),
            fppw: ratio(fp_from[i], total),
        };
        curve.push(point);
        if chosen.is_none() && point.fppw <= target_fppw {
            chosen = Some((score, 1.0 - point.miss));
        }
        if hit {
            missed_hits += 1;
        }
    }

    let (threshold, accuracy) = chosen.unwrap_or((1.0, 0.0));
    ThresholdReport {
        threshold,
        accuracy,
        curve,
    }
}

/// Marks each detection that counts as a hit. Every ground-truth box
/// claims at most one detection: the highest-scoring unmatched one of the
/// same label with IoU at or above `min_iou`.
pub fn match_detections(
    boxes: &[(usize, Rectangle)],
    detections: &[Detection],
    min_iou: f32,
) -> Vec<bool> {
    let mut hits = vec![false; detections.len()];
    for (label, bbox) in boxes {
        let best = detections
            .iter()
            .enumerate()
            .filter(|(i, d)| {
                !hits[*i] && d.label() == *label && d.bbox().iou(bbox) >= min_iou
            })
            .max_by(|(_, a), (_, b)| {
                a.score()
                    .partial_cmp(&b.score())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(i, _)| i);
        if let Some(i) = best {
            hits[i] = true;
        }
    }
    hits
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_closed_set_rates() {
        let truth = vec![1, 1, 2, 2];
        let predicted = vec![1, 2, 2, 2];
        let report = evaluate_classify(&truth, &predicted, 3, false).unwrap();
        assert_relative_eq!(report.tpr, 0.75);
        // One misclassified positive over (class_num - 2) * 4 decisions.
        assert_relative_eq!(report.fpr, 0.25);
        assert_relative_eq!(report.confusion[(1, 1)], 0.5);
        assert_relative_eq!(report.confusion[(2, 2)], 1.0);
    }

    #[test]
    fn test_closed_set_tpr_excludes_background_rows() {
        let truth = vec![0, 1, 2, 2];
        let predicted = vec![1, 1, 2, 1];
        let report = evaluate_classify(&truth, &predicted, 3, false).unwrap();
        // The background row enters neither rate in closed-set mode.
        assert_relative_eq!(report.tpr, 2.0 / 3.0);
        assert_relative_eq!(report.fpr, 1.0 / 3.0);
    }

    #[test]
    fn test_open_set_denominators() {
        let truth = vec![0, 0, 1, 2];
        let predicted = vec![0, 2, 1, 2];
        let report = evaluate_classify(&truth, &predicted, 3, true).unwrap();
        assert_relative_eq!(report.tpr, 1.0);
        // One background false positive over (class_num - 1) * 4 decisions.
        assert_relative_eq!(report.fpr, 0.125);
    }

    #[test]
    fn test_open_set_counts_misclassified_positives() {
        let truth = vec![0, 1, 1, 2];
        let predicted = vec![2, 1, 2, 2];
        let report = evaluate_classify(&truth, &predicted, 3, true).unwrap();
        assert_relative_eq!(report.tpr, 2.0 / 3.0);
        // Background-as-sign plus one wrong positive, over 2 * 4.
        assert_relative_eq!(report.fpr, 0.25);
    }

    #[test]
    fn test_label_out_of_range_fails() {
        assert!(evaluate_classify(&[5], &[0], 3, false).is_err());
    }

    #[test]
    fn test_update_threshold_separable_scores() {
        // Non-hits score low, hits score high.
        let samples = vec![
            (false, 0.1),
            (false, 0.2),
            (true, 0.8),
            (true, 0.9),
        ];
        let report = update_threshold(&samples, 0.0);
        assert_relative_eq!(report.threshold, 0.8);
        assert_relative_eq!(report.accuracy, 1.0);
        assert_eq!(4, report.curve.len());
    }

    #[test]
    fn test_update_threshold_without_solution() {
        let samples = vec![(true, 0.3), (false, 0.9)];
        let report = update_threshold(&samples, 0.0);
        assert_relative_eq!(report.threshold, 1.0);
        assert_relative_eq!(report.accuracy, 0.0);
    }

    #[test]
    fn test_match_detections_prefers_highest_score() {
        let boxes = vec![(1, Rectangle::new(0, 0, 20, 20))];
        let detections = vec![
            Detection::new(Rectangle::new(1, 1, 20, 20), 1, 0.5),
            Detection::new(Rectangle::new(0, 0, 20, 20), 1, 0.9),
            Detection::new(Rectangle::new(0, 0, 20, 20), 2, 0.99),
        ];
        assert_eq!(vec![false, true, false], match_detections(&boxes, &detections, 0.5));
    }

    #[test]
    fn test_each_box_claims_one_detection() {
        let boxes = vec![
            (1, Rectangle::new(0, 0, 20, 20)),
            (1, Rectangle::new(2, 2, 20, 20)),
        ];
        let detections = vec![Detection::new(Rectangle::new(0, 0, 20, 20), 1, 0.9)];
        let hits = match_detections(&boxes, &detections, 0.5);
        assert_eq!(vec![true], hits);
    }
}
