//! Projection features + KNN with open-set rejection.

use image::GrayImage;
use log::info;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::classifier::{Classifier, KnnClassifier};
use crate::dataset::{Dataset, Split};
use crate::error::Result;
use crate::eval::{evaluate_classify, ClassifyReport};
use crate::feat::{Extractor, ProjectionExtractor};
use crate::math::mean_std;
use crate::model::{load_model, save_model};
use crate::sign::resize_batch;

const MODEL_KIND: &str = "knn-sign";

/// Negative patches sampled when fitting the rejection threshold.
const REJECT_SAMPLE_COUNT: usize = 2000;

/// Eigen- or Fisher-projected crops classified with KNN. A rejection
/// threshold learned from background patches maps far-away samples to
/// the background label 0.
#[derive(Serialize, Deserialize)]
pub struct KnnSignClassifier {
    img_size: u32,
    use_threshold: bool,
    extractor: ProjectionExtractor,
    knn: KnnClassifier,
    reject_distance: f32,
}

impl KnnSignClassifier {
    pub fn new(
        extractor: ProjectionExtractor,
        near_num: usize,
        img_size: u32,
        use_threshold: bool,
    ) -> Self {
        assert!(img_size > 0, "illegal crop size: {}", img_size);
        KnnSignClassifier {
            img_size,
            use_threshold,
            extractor,
            knn: KnnClassifier::new(near_num),
            reject_distance: f32::MAX,
        }
    }

    pub fn train<R: Rng>(&mut self, dataset: &Dataset, rng: &mut R) -> Result<()> {
        let images = dataset.classify_images(Split::Train, Some(self.img_size));
        let labels = dataset.classify_labels(Split::Train);

        info!("training projection on {} crops", images.len());
        self.extractor.train(&images, labels)?;
        let feats = self.extractor.extract(&images)?;
        self.knn.train(&feats, labels)?;

        if self.use_threshold {
            self.train_threshold(dataset, rng)?;
        }

        let predicted = self.knn.predict(&feats)?;
        let report = evaluate_classify(labels, &predicted, dataset.config().class_num, false)?;
        info!("rate on training split: {:.2}%", report.tpr * 100.0);
        Ok(())
    }

    /// Measures KNN distances on random background patches and keeps
    /// everything beyond mean + 2 sigma out of the known classes.
    fn train_threshold<R: Rng>(&mut self, dataset: &Dataset, rng: &mut R) -> Result<()> {
        let patches = dataset.random_neg_patches(
            Split::Train,
            REJECT_SAMPLE_COUNT,
            self.img_size,
            false,
            rng,
        )?;
        let feats = self.extractor.extract(&patches)?;
        let distances: Vec<f32> = self
            .knn
            .predict_with_distance(&feats)?
            .into_iter()
            .map(|(_, distance)| distance)
            .collect();
        let (mean, std) = mean_std(&distances);
        self.reject_distance = mean + 2.0 * std;
        info!(
            "rejection threshold {:.4} (mean {:.4}, std {:.4})",
            self.reject_distance, mean, std
        );
        Ok(())
    }

    pub fn predict(&self, images: &[GrayImage]) -> Result<Vec<usize>> {
        let images = resize_batch(images, self.img_size);
        let feats = self.extractor.extract(&images)?;
        Ok(self
            .knn
            .predict_with_distance(&feats)?
            .into_iter()
            .map(|(label, distance)| {
                if distance > self.reject_distance {
                    0
                } else {
                    label
                }
            })
            .collect())
    }

    /// Evaluates on the held-out split in open-set mode: background crops
    /// count toward the false-positive rate.
    pub fn test(&self, dataset: &Dataset) -> Result<ClassifyReport> {
        let images = dataset.classify_images(Split::Test, Some(self.img_size));
        let labels = dataset.classify_labels(Split::Test);
        let predicted = self.predict(&images)?;
        let report = evaluate_classify(labels, &predicted, dataset.config().class_num, true)?;
        info!(
            "test rate: {:.2}%, false positives: {:.2}%",
            report.tpr * 100.0,
            report.fpr * 100.0
        );
        Ok(report)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        save_model(path, MODEL_KIND, self)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        load_model(path, MODEL_KIND)
    }
}
