//! End-to-end tests on a small synthetic dataset written to disk.

use std::fs;
use std::path::{Path, PathBuf};

use image::{GrayImage, Luma};
use rand::rngs::StdRng;
use rand::SeedableRng;

use rustsign::classifier::{ForestClassifier, ForestParams, SvmClassifier};
use rustsign::dataset::{Dataset, DatasetConfig, Split};
use rustsign::detector::SignDetector;
use rustsign::feat::{EigenExtractor, HogExtractor, ProjectionExtractor};
use rustsign::sign::{HogSignClassifier, KnnSignClassifier, WindowClassifier};
use rustsign::Rectangle;

const CROP: u32 = 20;

fn test_config() -> DatasetConfig {
    DatasetConfig {
        class_num: 3,
        pos_test_num: 2,
        detect_test_num: 1,
        size_list: vec![CROP],
        detect_step: 10,
        augment_times: 0,
        augment_rotate: 10.0,
        neg_iou: 0.5,
        pos_iou: 0.7,
    }
}

/// Bright disk (label 1) or bright cross (label 2) on a dark background,
/// with a per-sample brightness tweak.
fn sign_pattern(label: usize, seed: u8) -> GrayImage {
    GrayImage::from_fn(CROP, CROP, |x, y| {
        let on = match label {
            1 => {
                let dx = x as i32 - 10;
                let dy = y as i32 - 10;
                dx * dx + dy * dy <= 49
            }
            _ => (8..12).contains(&x) || (8..12).contains(&y),
        };
        if on {
            Luma([220 + (seed % 20)])
        } else {
            Luma([20 + (seed % 10)])
        }
    })
}

fn noise_pattern(seed: u32) -> GrayImage {
    GrayImage::from_fn(CROP, CROP, |x, y| {
        Luma([(((x * 7 + y * 13 + seed) % 17) * 15) as u8])
    })
}

fn scene_with_signs(signs: &[(usize, i32, i32)], seed: u8) -> GrayImage {
    let mut scene = GrayImage::from_fn(100, 80, |x, _| Luma([60 + (x / 2) as u8]));
    for &(label, x, y) in signs {
        let patch = sign_pattern(label, seed);
        image::imageops::replace(&mut scene, &patch, i64::from(x), i64::from(y));
    }
    scene
}

/// Writes the dataset layout under a fresh directory and returns its root.
fn write_dataset(name: &str) -> PathBuf {
    let root = std::env::temp_dir().join(format!("rustsign-{}-{}", std::process::id(), name));
    fs::remove_dir_all(&root).ok();

    let data = root.join("data");
    let origin = root.join("origin");
    fs::create_dir_all(&origin).unwrap();
    fs::create_dir_all(data.join("neg")).unwrap();

    fs::write(data.join("labelname.txt"), "background\ndisk\ncross\n").unwrap();

    for label in 1..=2usize {
        let class_dir = data.join(label.to_string());
        fs::create_dir_all(&class_dir).unwrap();
        let mut filelist = String::new();
        for i in 0..8u8 {
            let file = format!("crop_{}.png", i);
            sign_pattern(label, i * 3).save(class_dir.join(&file)).unwrap();
            filelist.push_str(&file);
            filelist.push('\n');
        }
        fs::write(class_dir.join("filelist.txt"), filelist).unwrap();
    }

    let mut neg_list = String::new();
    for i in 0..2u32 {
        let file = format!("neg_{}.png", i);
        noise_pattern(i * 5).save(data.join("neg").join(&file)).unwrap();
        neg_list.push_str(&file);
        neg_list.push('\n');
    }
    fs::write(data.join("neg").join("filelist.txt"), neg_list).unwrap();

    // Four training scenes with two signs each, one test scene.
    let mut annotations = String::new();
    for i in 0..4u8 {
        let file = format!("scene_{}.png", i);
        scene_with_signs(&[(1, 30, 20), (2, 60, 40)], i * 2)
            .save(origin.join(&file))
            .unwrap();
        annotations.push_str(&format!("{}:2;1,30,20,50,40;2,60,40,80,60\n", file));
    }
    scene_with_signs(&[(1, 60, 40)], 9)
        .save(origin.join("scene_test.png"))
        .unwrap();
    annotations.push_str("scene_test.png:1;1,60,40,80,60\n");
    fs::write(origin.join("annotations.txt"), annotations).unwrap();

    root
}

fn cleanup(root: &Path) {
    fs::remove_dir_all(root).ok();
}

#[test]
fn test_dataset_layout() {
    let root = write_dataset("layout");
    let dataset = Dataset::load(&root, test_config()).unwrap();

    // 6 training crops per class; 2 test crops per class plus 2 negatives.
    assert_eq!(12, dataset.classify_len(Split::Train));
    assert_eq!(6, dataset.classify_len(Split::Test));
    assert_eq!(2, dataset.classify_labels(Split::Test).iter().filter(|&&l| l == 0).count());
    assert_eq!(4, dataset.scene_len(Split::Train));
    assert_eq!(1, dataset.scene_len(Split::Test));
    assert_eq!(Some("disk"), dataset.label_name(1));

    let exact = Rectangle::new(30, 20, CROP, CROP);
    assert_eq!(1, dataset.positive_label(Split::Train, 0, &exact));
    assert!(!dataset.is_negative_region(Split::Train, 0, &exact));
    let far = Rectangle::new(0, 60, CROP, CROP);
    assert_eq!(0, dataset.positive_label(Split::Train, 0, &far));
    assert!(dataset.is_negative_region(Split::Train, 0, &far));

    cleanup(&root);
}

#[test]
fn test_augmentation_counts() {
    let root = write_dataset("augment");
    let mut config = test_config();
    config.augment_times = 2;
    let dataset = Dataset::load(&root, config).unwrap();
    let mut rng = StdRng::seed_from_u64(7);

    // Only the exact grid positions reach the positive IoU bound, so the
    // four training scenes yield 8 base windows, each with 2 rotations.
    let (patches, labels) = dataset
        .positive_windows(Split::Train, CROP, true, &mut rng)
        .unwrap();
    assert_eq!(24, patches.len());
    assert_eq!(24, labels.len());
    assert_eq!(12, labels.iter().filter(|&&l| l == 1).count());
    assert_eq!(12, labels.iter().filter(|&&l| l == 2).count());

    // Rotated copies come on top of the requested count.
    let negatives = dataset
        .random_neg_patches(Split::Train, 5, CROP, true, &mut rng)
        .unwrap();
    assert_eq!(15, negatives.len());

    cleanup(&root);
}

#[test]
fn test_knn_classifier_end_to_end() {
    let root = write_dataset("knn");
    let dataset = Dataset::load(&root, test_config()).unwrap();

    let extractor = ProjectionExtractor::Eigen(EigenExtractor::new(8));
    let mut classifier = KnnSignClassifier::new(extractor, 3, CROP, false);
    let mut rng = StdRng::seed_from_u64(7);
    classifier.train(&dataset, &mut rng).unwrap();

    let report = classifier.test(&dataset).unwrap();
    assert!(report.tpr >= 0.75, "tpr {}", report.tpr);

    // Trained state survives persistence.
    let model_path = root.join("knn.json");
    classifier.save(&model_path).unwrap();
    let restored = KnnSignClassifier::load(&model_path).unwrap();
    let images = dataset.classify_images(Split::Test, Some(CROP));
    assert_eq!(
        classifier.predict(&images).unwrap(),
        restored.predict(&images).unwrap()
    );

    cleanup(&root);
}

#[test]
fn test_hog_classifier_end_to_end() {
    let root = write_dataset("hog");
    let dataset = Dataset::load(&root, test_config()).unwrap();

    let mut classifier = HogSignClassifier::new(
        HogExtractor::new(4, 4),
        WindowClassifier::Svm(SvmClassifier::new(10.0)),
        CROP,
    );
    classifier.train(&dataset).unwrap();

    // Closed-set rates run over the four positive test crops only.
    let report = classifier.test(&dataset).unwrap();
    assert!(report.tpr >= 0.5, "tpr {}", report.tpr);

    cleanup(&root);
}

#[test]
fn test_detector_end_to_end() {
    let root = write_dataset("detector");
    let dataset = Dataset::load(&root, test_config()).unwrap();

    let classifier = HogSignClassifier::new(
        HogExtractor::new(4, 4),
        WindowClassifier::Forest(ForestClassifier::new(ForestParams {
            max_depth: 8,
            min_samples: 5,
            num_trees: 15,
        })),
        CROP,
    );
    let config = dataset.config().clone();
    let mut detector = SignDetector::new(classifier, config.size_list, config.detect_step);
    let mut rng = StdRng::seed_from_u64(7);
    detector.train(&dataset, &mut rng).unwrap();

    // A 100x80 scene takes 9x7 positions of the single window size.
    let scene = dataset.scene_gray(Split::Test, 0).unwrap();
    let (_, window_count) = detector.detect_raw(&scene, false).unwrap();
    assert_eq!(63, window_count);

    let curve = detector.calibrate(&dataset).unwrap();
    assert!(!curve.is_empty());
    assert!((0.0..=1.0).contains(&detector.threshold()));

    // Recalibrating an already-thresholded detector scans the full
    // sweep again instead of being censored by the stored threshold.
    let first = detector.threshold();
    detector.set_threshold(0.99);
    detector.calibrate(&dataset).unwrap();
    assert_eq!(first, detector.threshold());

    let model_path = root.join("detector.json");
    detector.save(&model_path).unwrap();
    let restored = rustsign::create_detector(&model_path).unwrap();
    assert_eq!(detector.threshold(), restored.threshold());
    restored.detect(&scene).unwrap();

    cleanup(&root);
}
