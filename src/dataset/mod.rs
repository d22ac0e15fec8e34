//! On-disk traffic-sign dataset.
//!
//! Layout under the dataset root:
//!
//! ```text
//! data/labelname.txt      class names, line index = label id, 0 = background
//! data/<label>/filelist.txt   classification crops of one class
//! data/neg/filelist.txt   background crops, evaluation only
//! origin/annotations.txt  full scenes: <name>:<n>;<label>,<x1>,<y1>,<x2>,<y2>;...
//! origin/<name>           the scene images themselves
//! ```
//!
//! Classification crops are held in memory; full scenes are loaded on
//! demand.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use image::imageops::FilterType;
use image::{GrayImage, Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::geometric_transformations::{rotate_about_center, Interpolation};
use imageproc::rect::Rect;
use log::{debug, info};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::common::{Detection, Rectangle};
use crate::error::{Error, Result};

/// Hard cap on rejection-sampling attempts per requested negative patch.
const NEG_SAMPLE_ATTEMPTS: usize = 50;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Split {
    Train,
    Test,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// Number of classes including the background class 0.
    pub class_num: usize,
    /// Leading lines of each class file list held out for testing.
    pub pos_test_num: usize,
    /// Trailing scenes of the annotation file held out for testing.
    pub detect_test_num: usize,
    /// Candidate window sizes for sampling and sliding.
    pub size_list: Vec<u32>,
    /// Sliding-window step in pixels.
    pub detect_step: u32,
    /// Extra rotated copies per augmented patch.
    pub augment_times: usize,
    /// Augmentation rotation bound in degrees.
    pub augment_rotate: f32,
    /// A region is negative when its IoU with every box stays below this.
    pub neg_iou: f32,
    /// A region takes a box's label when their IoU reaches this.
    pub pos_iou: f32,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        DatasetConfig {
            class_num: 11,
            pos_test_num: 40,
            detect_test_num: 500,
            size_list: vec![20, 30, 50, 70, 90, 100, 150, 200, 250, 300],
            detect_step: 10,
            augment_times: 4,
            augment_rotate: 30.0,
            neg_iou: 0.5,
            pos_iou: 0.7,
        }
    }
}

struct ClassifySplit {
    images: Vec<GrayImage>,
    labels: Vec<usize>,
}

struct Scene {
    path: PathBuf,
    boxes: Vec<(usize, Rectangle)>,
}

pub struct Dataset {
    config: DatasetConfig,
    label_names: Vec<String>,
    train: ClassifySplit,
    test: ClassifySplit,
    scenes_train: Vec<Scene>,
    scenes_test: Vec<Scene>,
}

impl Dataset {
    pub fn load<P: AsRef<Path>>(root: P, config: DatasetConfig) -> Result<Dataset> {
        let root = root.as_ref();
        let data_dir = root.join("data");
        let origin_dir = root.join("origin");

        let label_names = read_lines(&data_dir.join("labelname.txt"))?;
        if label_names.len() < config.class_num {
            return Err(Error::Dataset(format!(
                "labelname.txt names {} classes, configuration expects {}",
                label_names.len(),
                config.class_num
            )));
        }

        let mut train = ClassifySplit {
            images: Vec::new(),
            labels: Vec::new(),
        };
        let mut test = ClassifySplit {
            images: Vec::new(),
            labels: Vec::new(),
        };
        for label in 1..config.class_num {
            let class_dir = data_dir.join(label.to_string());
            let names = read_lines(&class_dir.join("filelist.txt"))?;
            for (i, name) in names.iter().enumerate() {
                let image = load_gray(&class_dir.join(name))?;
                let split = if i < config.pos_test_num {
                    &mut test
                } else {
                    &mut train
                };
                split.images.push(image);
                split.labels.push(label);
            }
        }

        // Background crops only exist for open-set evaluation.
        let neg_dir = data_dir.join("neg");
        for name in read_lines(&neg_dir.join("filelist.txt"))? {
            test.images.push(load_gray(&neg_dir.join(&name))?);
            test.labels.push(0);
        }

        let min_size = config.size_list.iter().copied().min().unwrap_or(0);
        let mut scenes = Vec::new();
        for (lineno, line) in read_lines(&origin_dir.join("annotations.txt"))?
            .iter()
            .enumerate()
        {
            let (name, mut boxes) = parse_annotation_line(line, lineno + 1)?;
            // Boxes below the smallest window cannot be detected anyway.
            boxes.retain(|(_, b)| b.width() >= min_size && b.height() >= min_size);
            scenes.push(Scene {
                path: origin_dir.join(name),
                boxes,
            });
        }
        let test_start = scenes.len().saturating_sub(config.detect_test_num);
        let scenes_test = scenes.split_off(test_start);

        info!(
            "dataset loaded: {} train / {} test crops, {} train / {} test scenes",
            train.images.len(),
            test.images.len(),
            scenes.len(),
            scenes_test.len()
        );
        Ok(Dataset {
            config,
            label_names,
            train,
            test,
            scenes_train: scenes,
            scenes_test,
        })
    }

    pub fn config(&self) -> &DatasetConfig {
        &self.config
    }

    pub fn label_name(&self, label: usize) -> Option<&str> {
        self.label_names.get(label).map(String::as_str)
    }

    fn classify(&self, split: Split) -> &ClassifySplit {
        match split {
            Split::Train => &self.train,
            Split::Test => &self.test,
        }
    }

    fn scenes(&self, split: Split) -> &[Scene] {
        match split {
            Split::Train => &self.scenes_train,
            Split::Test => &self.scenes_test,
        }
    }

    pub fn classify_len(&self, split: Split) -> usize {
        self.classify(split).images.len()
    }

    pub fn classify_labels(&self, split: Split) -> &[usize] {
        &self.classify(split).labels
    }

    /// Classification crops, optionally resized to a square side.
    pub fn classify_images(&self, split: Split, size: Option<u32>) -> Vec<GrayImage> {
        self.classify(split)
            .images
            .iter()
            .map(|image| match size {
                Some(s) => image::imageops::resize(image, s, s, FilterType::Triangle),
                None => image.clone(),
            })
            .collect()
    }

    pub fn scene_len(&self, split: Split) -> usize {
        self.scenes(split).len()
    }

    pub fn scene_boxes(&self, split: Split, index: usize) -> &[(usize, Rectangle)] {
        &self.scenes(split)[index].boxes
    }

    pub fn scene_gray(&self, split: Split, index: usize) -> Result<GrayImage> {
        load_gray(&self.scenes(split)[index].path)
    }

    pub fn scene_rgb(&self, split: Split, index: usize) -> Result<RgbImage> {
        let path = &self.scenes(split)[index].path;
        Ok(image::open(path)
            .map_err(|source| Error::Image {
                path: path.clone(),
                source,
            })?
            .to_rgb8())
    }

    /// True when `rect` misses every annotated sign of the scene.
    pub fn is_negative_region(&self, split: Split, index: usize, rect: &Rectangle) -> bool {
        is_negative(self.scene_boxes(split, index), rect, self.config.neg_iou)
    }

    /// Label of an annotated sign that `rect` covers well, zero otherwise.
    pub fn positive_label(&self, split: Split, index: usize, rect: &Rectangle) -> usize {
        region_label(self.scene_boxes(split, index), rect, self.config.pos_iou)
    }

    /// Samples random background windows from the scenes of a split,
    /// resized to `patch_size`. Augmentation adds rotated copies on top
    /// of the `count` sampled patches. Sampling is bounded, so fewer
    /// than `count` unique patches can come back on annotation-dense
    /// data.
    pub fn random_neg_patches<R: Rng>(
        &self,
        split: Split,
        count: usize,
        patch_size: u32,
        augment: bool,
        rng: &mut R,
    ) -> Result<Vec<GrayImage>> {
        let scenes = self.scenes(split);
        if scenes.is_empty() {
            return Err(Error::Dataset("no scenes to sample from".into()));
        }

        let mut patches = Vec::with_capacity(count * (self.config.augment_times + 1));
        let mut accepted = 0;
        let mut attempts = 0;
        while accepted < count && attempts < count * NEG_SAMPLE_ATTEMPTS {
            attempts += 1;
            let index = rng.gen_range(0..scenes.len());
            let gray = self.scene_gray(split, index)?;

            let fitting: Vec<u32> = self
                .config
                .size_list
                .iter()
                .copied()
                .filter(|&s| s <= gray.width() && s <= gray.height())
                .collect();
            if fitting.is_empty() {
                continue;
            }
            let size = fitting[rng.gen_range(0..fitting.len())];
            let x = rng.gen_range(0..=gray.width() - size);
            let y = rng.gen_range(0..=gray.height() - size);
            let rect = Rectangle::new(x as i32, y as i32, size, size);
            if !self.is_negative_region(split, index, &rect) {
                continue;
            }

            let patch = crop_resized(&gray, &rect, patch_size);
            if augment {
                self.push_augmented(&patch, &mut patches, rng);
            }
            patches.push(patch);
            // Rotated copies ride along without consuming the budget.
            accepted += 1;
        }
        debug!(
            "sampled {} negative patches ({} with rotations) in {} attempts",
            accepted,
            patches.len(),
            attempts
        );
        Ok(patches)
    }

    /// Harvests every sliding window that covers an annotated sign, over
    /// the full size/step grid. Returns the patches with their labels.
    pub fn positive_windows<R: Rng>(
        &self,
        split: Split,
        patch_size: u32,
        augment: bool,
        rng: &mut R,
    ) -> Result<(Vec<GrayImage>, Vec<usize>)> {
        let mut patches = Vec::new();
        let mut labels = Vec::new();
        for index in 0..self.scene_len(split) {
            let gray = self.scene_gray(split, index)?;
            for rect in window_grid(
                gray.width(),
                gray.height(),
                &self.config.size_list,
                self.config.detect_step,
            ) {
                let label = self.positive_label(split, index, &rect);
                if label == 0 {
                    continue;
                }
                let patch = crop_resized(&gray, &rect, patch_size);
                if augment {
                    let before = patches.len();
                    self.push_augmented(&patch, &mut patches, rng);
                    labels.extend(std::iter::repeat(label).take(patches.len() - before));
                }
                patches.push(patch);
                labels.push(label);
            }
        }
        info!("harvested {} positive windows", patches.len());
        Ok((patches, labels))
    }

    fn push_augmented<R: Rng>(&self, patch: &GrayImage, out: &mut Vec<GrayImage>, rng: &mut R) {
        let bound = self.config.augment_rotate.to_radians();
        for _ in 0..self.config.augment_times {
            let theta = rng.gen_range(-bound..=bound);
            out.push(rotate_about_center(
                patch,
                theta,
                Interpolation::Bilinear,
                image::Luma([0]),
            ));
        }
    }
}

/// All sliding-window positions over one image for every candidate size.
pub fn window_grid(width: u32, height: u32, sizes: &[u32], step: u32) -> Vec<Rectangle> {
    let mut windows = Vec::new();
    for &size in sizes {
        if size > width || size > height {
            continue;
        }
        let mut y = 0;
        while y + size <= height {
            let mut x = 0;
            while x + size <= width {
                windows.push(Rectangle::new(x as i32, y as i32, size, size));
                x += step;
            }
            y += step;
        }
    }
    windows
}

pub(crate) fn is_negative(boxes: &[(usize, Rectangle)], rect: &Rectangle, neg_iou: f32) -> bool {
    boxes.iter().all(|(_, b)| rect.iou(b) < neg_iou)
}

pub(crate) fn region_label(boxes: &[(usize, Rectangle)], rect: &Rectangle, pos_iou: f32) -> usize {
    boxes
        .iter()
        .find(|(_, b)| rect.iou(b) >= pos_iou)
        .map(|&(label, _)| label)
        .unwrap_or(0)
}

fn crop_resized(image: &GrayImage, rect: &Rectangle, size: u32) -> GrayImage {
    let crop = image::imageops::crop_imm(
        image,
        rect.x().max(0) as u32,
        rect.y().max(0) as u32,
        rect.width(),
        rect.height(),
    )
    .to_image();
    image::imageops::resize(&crop, size, size, FilterType::Triangle)
}

/// Parses one annotation line: `<name>:<n>;<label>,<x1>,<y1>,<x2>,<y2>;...`.
/// A line may carry zero boxes.
pub fn parse_annotation_line(line: &str, lineno: usize) -> Result<(String, Vec<(usize, Rectangle)>)> {
    let invalid = |reason: &str| Error::InvalidAnnotation {
        line: lineno,
        reason: reason.to_string(),
    };

    let (name, rest) = line
        .split_once(':')
        .ok_or_else(|| invalid("missing ':' after image name"))?;
    let mut parts = rest.split(';');
    let count: usize = parts
        .next()
        .ok_or_else(|| invalid("missing box count"))?
        .trim()
        .parse()
        .map_err(|_| invalid("box count is not a number"))?;

    let mut boxes = Vec::with_capacity(count);
    for _ in 0..count {
        let entry = parts
            .next()
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| invalid("fewer boxes than the declared count"))?;
        let fields: Vec<i32> = entry
            .split(',')
            .map(|f| f.trim().parse::<i32>())
            .collect::<std::result::Result<_, _>>()
            .map_err(|_| invalid("box fields must be integers"))?;
        if fields.len() != 5 {
            return Err(invalid("a box needs label and two corners"));
        }
        let (label, x1, y1, x2, y2) = (fields[0], fields[1], fields[2], fields[3], fields[4]);
        if label < 0 || x2 <= x1 || y2 <= y1 {
            return Err(invalid("box corners are not ordered"));
        }
        boxes.push((
            label as usize,
            Rectangle::new(x1, y1, (x2 - x1) as u32, (y2 - y1) as u32),
        ));
    }
    Ok((name.trim().to_string(), boxes))
}

/// Draws hollow boxes for each detection, one palette color per class.
pub fn draw_detections(image: &mut RgbImage, detections: &[Detection]) {
    const PALETTE: [[u8; 3]; 6] = [
        [255, 0, 0],
        [0, 255, 0],
        [0, 0, 255],
        [255, 255, 0],
        [255, 0, 255],
        [0, 255, 255],
    ];
    for detection in detections {
        let bbox = detection.bbox();
        if bbox.width() == 0 || bbox.height() == 0 {
            continue;
        }
        let color = Rgb(PALETTE[detection.label() % PALETTE.len()]);
        let rect = Rect::at(bbox.x(), bbox.y()).of_size(bbox.width(), bbox.height());
        draw_hollow_rect_mut(image, rect, color);
    }
}

fn read_lines(path: &Path) -> Result<Vec<String>> {
    let file = File::open(path)
        .map_err(|e| Error::Dataset(format!("cannot open {}: {}", path.display(), e)))?;
    let mut lines = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        let line = line.trim();
        if !line.is_empty() {
            lines.push(line.to_string());
        }
    }
    Ok(lines)
}

fn load_gray(path: &Path) -> Result<GrayImage> {
    Ok(image::open(path)
        .map_err(|source| Error::Image {
            path: path.to_path_buf(),
            source,
        })?
        .to_luma8())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_annotation_line() {
        let (name, boxes) =
            parse_annotation_line("scene_001.jpg:2;3,10,20,60,70;7,100,100,150,160", 1).unwrap();
        assert_eq!("scene_001.jpg", name);
        assert_eq!(2, boxes.len());
        assert_eq!(3, boxes[0].0);
        assert_eq!(Rectangle::new(10, 20, 50, 50), boxes[0].1);
        assert_eq!(Rectangle::new(100, 100, 50, 60), boxes[1].1);
    }

    #[test]
    fn test_parse_empty_annotation() {
        let (name, boxes) = parse_annotation_line("empty.jpg:0", 4).unwrap();
        assert_eq!("empty.jpg", name);
        assert!(boxes.is_empty());
    }

    #[test]
    fn test_parse_rejects_short_lines() {
        assert!(parse_annotation_line("broken.jpg", 1).is_err());
        assert!(parse_annotation_line("broken.jpg:2;1,0,0,5,5", 1).is_err());
        assert!(parse_annotation_line("broken.jpg:1;1,10,10,5,5", 1).is_err());
    }

    #[test]
    fn test_region_label() {
        let boxes = vec![(4, Rectangle::new(10, 10, 40, 40))];
        assert_eq!(4, region_label(&boxes, &Rectangle::new(10, 10, 40, 40), 0.7));
        assert_eq!(4, region_label(&boxes, &Rectangle::new(12, 12, 40, 40), 0.7));
        assert_eq!(0, region_label(&boxes, &Rectangle::new(40, 40, 40, 40), 0.7));
    }

    #[test]
    fn test_is_negative() {
        let boxes = vec![(1, Rectangle::new(0, 0, 30, 30))];
        assert!(is_negative(&boxes, &Rectangle::new(100, 100, 30, 30), 0.5));
        assert!(!is_negative(&boxes, &Rectangle::new(2, 2, 30, 30), 0.5));
    }

    #[test]
    fn test_window_grid_counts() {
        let windows = window_grid(50, 40, &[20, 60], 10);
        // Only the 20px windows fit: 4 x positions, 3 y positions.
        assert_eq!(12, windows.len());
        assert!(windows.iter().all(|w| w.width() == 20));
    }
}
