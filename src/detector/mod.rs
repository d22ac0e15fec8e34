//! Sliding-window sign detector.
//!
//! Windows of every candidate size are classified, low-confidence and
//! background windows are discarded, and the survivors go through a
//! union-find merge followed by non-maximum suppression.

use image::GrayImage;
use log::{debug, info};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::common::{Detection, Rectangle};
use crate::dataset::{window_grid, Dataset, Split};
use crate::error::Result;
use crate::eval::{match_detections, RatePoint};
use crate::model::{load_model, save_model};
use crate::sign::HogSignClassifier;

const MODEL_KIND: &str = "sign-detector";

/// Same-label boxes overlapping at least this much merge into one.
const MERGE_IOU: f32 = 0.667;
/// Detections matching a ground-truth box at this IoU count as hits.
const HIT_IOU: f32 = 0.5;
/// Calibration stops at the first threshold below this FPPW.
const TARGET_FPPW: f32 = 1e-2;
const CALIBRATION_STEP: f32 = 0.02;

#[derive(Serialize, Deserialize)]
pub struct SignDetector {
    classifier: HogSignClassifier,
    threshold: f32,
    size_list: Vec<u32>,
    step: u32,
}

impl SignDetector {
    pub fn new(classifier: HogSignClassifier, size_list: Vec<u32>, step: u32) -> Self {
        assert!(!size_list.is_empty(), "empty window size list");
        assert!(step > 0, "illegal window step: {}", step);
        SignDetector {
            classifier,
            threshold: 0.0,
            size_list,
            step,
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn set_threshold(&mut self, threshold: f32) {
        assert!(
            (0.0..=1.0).contains(&threshold),
            "illegal threshold: {}",
            threshold
        );
        self.threshold = threshold;
    }

    /// Trains the inner classifier on every harvested positive window plus
    /// mined background windows.
    pub fn train<R: Rng>(&mut self, dataset: &Dataset, rng: &mut R) -> Result<()> {
        let (windows, labels) =
            dataset.positive_windows(Split::Train, self.classifier.img_size(), true, rng)?;
        self.classifier
            .train_with_windows(dataset, &windows, &labels, rng)
    }

    /// Detects signs with merging applied.
    pub fn detect(&self, image: &GrayImage) -> Result<Vec<Detection>> {
        Ok(self.detect_raw(image, true)?.0)
    }

    /// Detects signs, returning the scanned window count as well. Merging
    /// is skipped during calibration.
    pub fn detect_raw(&self, image: &GrayImage, merge: bool) -> Result<(Vec<Detection>, usize)> {
        let windows = window_grid(image.width(), image.height(), &self.size_list, self.step);
        let patches: Vec<GrayImage> = windows
            .iter()
            .map(|rect| {
                image::imageops::crop_imm(
                    image,
                    rect.x() as u32,
                    rect.y() as u32,
                    rect.width(),
                    rect.height(),
                )
                .to_image()
            })
            .collect();
        if patches.is_empty() {
            return Ok((Vec::new(), 0));
        }

        let predictions = self.classifier.predict(&patches)?;
        let mut detections: Vec<Detection> = windows
            .into_iter()
            .zip(predictions)
            .filter(|(_, p)| p.label > 0 && p.prob > self.threshold)
            .map(|(rect, p)| Detection::new(rect, p.label, p.prob))
            .collect();
        debug!("{} positive windows of {}", detections.len(), patches.len());

        if merge {
            detections = merge_rects(detections, MERGE_IOU);
            debug!("{} detections after merging", detections.len());
        }
        Ok((detections, patches.len()))
    }

    /// Sweeps the confidence threshold over the test scenes and keeps the
    /// first one whose false-positive rate per window drops below the
    /// target. Returns the full miss-rate/FPPW curve.
    pub fn calibrate(&mut self, dataset: &Dataset) -> Result<Vec<RatePoint>> {
        // The scan needs every window response; a previously stored
        // threshold would censor the low end of the sweep.
        self.threshold = 0.0;
        let mut scenes = Vec::new();
        let mut total_windows = 0usize;
        let mut total_boxes = 0usize;
        for index in 0..dataset.scene_len(Split::Test) {
            let gray = dataset.scene_gray(Split::Test, index)?;
            let (detections, windows) = self.detect_raw(&gray, false)?;
            let boxes = dataset.scene_boxes(Split::Test, index).to_vec();
            total_windows += windows;
            total_boxes += boxes.len();
            scenes.push((boxes, detections));
            if index % 100 == 0 {
                info!("calibration scan {}/{}", index, dataset.scene_len(Split::Test));
            }
        }

        let mut curve = Vec::new();
        let mut chosen = None;
        let mut threshold = 0.0f32;
        while threshold <= 1.0 + CALIBRATION_STEP / 2.0 {
            let mut hits = 0usize;
            let mut false_positives = 0usize;
            for (boxes, detections) in &scenes {
                let kept: Vec<Detection> = detections
                    .iter()
                    .filter(|d| d.score() >= threshold)
                    .cloned()
                    .collect();
                let matched = match_detections(boxes, &kept, HIT_IOU);
                let matched_count = matched.iter().filter(|&&hit| hit).count();
                hits += matched_count;
                false_positives += kept.len() - matched_count;
            }

            let point = RatePoint {
                miss: if total_boxes == 0 {
                    0.0
                } else {
                    1.0 - hits as f32 / total_boxes as f32
                },
                fppw: if total_windows == 0 {
                    0.0
                } else {
                    false_positives as f32 / total_windows as f32
                },
            };
            if chosen.is_none() && point.fppw < TARGET_FPPW {
                chosen = Some(threshold);
            }
            curve.push(point);
            threshold += CALIBRATION_STEP;
        }

        self.threshold = chosen.unwrap_or(1.0);
        info!("calibrated threshold: {:.2}", self.threshold);
        Ok(curve)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        save_model(path, MODEL_KIND, self)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        load_model(path, MODEL_KIND)
    }
}

struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        UnionFind {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            // Path halving.
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra != rb {
            self.parent[ra] = rb;
        }
    }
}

/// Merges overlapping same-label detections.
///
/// Union-find groups boxes whose pairwise IoU reaches `min_iou`; each
/// group of two or more becomes its coordinate-wise mean box carrying the
/// group's best score. Lone boxes are discarded as isolated false
/// positives. The merged boxes then pass through non-maximum suppression:
/// a box loses to a stronger same-label box covering more than half of
/// the smaller area.
pub fn merge_rects(detections: Vec<Detection>, min_iou: f32) -> Vec<Detection> {
    let n = detections.len();
    let mut sets = UnionFind::new(n);
    for i in 0..n {
        for j in i + 1..n {
            if detections[i].label() == detections[j].label()
                && detections[i].bbox().iou(detections[j].bbox()) >= min_iou
            {
                sets.union(i, j);
            }
        }
    }

    let roots: Vec<usize> = (0..n).map(|i| sets.find(i)).collect();
    let mut merged = Vec::new();
    for root in 0..n {
        let members: Vec<usize> = (0..n).filter(|&i| roots[i] == root).collect();
        if members.len() <= 1 {
            continue;
        }

        let k = members.len() as f32;
        let mut x = 0.0;
        let mut y = 0.0;
        let mut width = 0.0;
        let mut height = 0.0;
        let mut score = f32::MIN;
        for &i in &members {
            let bbox = detections[i].bbox();
            x += bbox.x() as f32;
            y += bbox.y() as f32;
            width += bbox.width() as f32;
            height += bbox.height() as f32;
            score = score.max(detections[i].score());
        }
        let bbox = Rectangle::new(
            (x / k).round() as i32,
            (y / k).round() as i32,
            (width / k).round() as u32,
            (height / k).round() as u32,
        );
        merged.push(Detection::new(bbox, detections[root].label(), score));
    }

    // Non-maximum suppression among the merged boxes.
    let mut result = Vec::new();
    for (i, candidate) in merged.iter().enumerate() {
        let suppressed = merged.iter().enumerate().any(|(j, other)| {
            j != i
                && other.label() == candidate.label()
                && other.score() > candidate.score()
                && candidate.bbox().intersect_area(other.bbox()) * 2
                    > candidate.bbox().area().min(other.bbox().area())
        });
        if !suppressed {
            result.push(candidate.clone());
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(x: i32, y: i32, size: u32, label: usize, score: f32) -> Detection {
        Detection::new(Rectangle::new(x, y, size, size), label, score)
    }

    #[test]
    fn test_union_find_groups_transitively() {
        let mut sets = UnionFind::new(4);
        sets.union(0, 1);
        sets.union(1, 2);
        assert_eq!(sets.find(0), sets.find(2));
        assert_ne!(sets.find(0), sets.find(3));
    }

    #[test]
    fn test_merge_averages_group() {
        let detections = vec![
            det(10, 10, 40, 1, 0.6),
            det(12, 12, 40, 1, 0.9),
            det(14, 14, 40, 1, 0.7),
        ];
        let merged = merge_rects(detections, 0.667);
        assert_eq!(1, merged.len());
        assert_eq!(12, merged[0].bbox().x());
        assert_eq!(12, merged[0].bbox().y());
        assert_eq!(40, merged[0].bbox().width());
        assert_eq!(1, merged[0].label());
        assert!((merged[0].score() - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_singletons_are_dropped() {
        let detections = vec![det(0, 0, 40, 1, 0.9), det(200, 200, 40, 2, 0.8)];
        assert!(merge_rects(detections, 0.667).is_empty());
    }

    #[test]
    fn test_different_labels_do_not_merge() {
        let detections = vec![det(10, 10, 40, 1, 0.6), det(12, 12, 40, 2, 0.9)];
        assert!(merge_rects(detections, 0.667).is_empty());
    }

    #[test]
    fn test_nms_suppresses_weaker_overlap() {
        // Two merged groups of the same label landing on top of each other.
        let detections = vec![
            det(10, 10, 40, 1, 0.6),
            det(12, 12, 40, 1, 0.7),
            det(20, 20, 60, 1, 0.9),
            det(22, 22, 60, 1, 0.95),
        ];
        let merged = merge_rects(detections, 0.667);
        assert_eq!(1, merged.len());
        assert!((merged[0].score() - 0.95).abs() < 1e-6);
        assert_eq!(60, merged[0].bbox().width());
    }
}
