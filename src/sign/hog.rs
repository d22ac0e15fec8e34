//! HOG features + SVM or random forest, with hard-negative mining for
//! the detection path.

use image::GrayImage;
use log::info;
use nalgebra::DMatrix;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::classifier::{Classifier, ForestClassifier, Prediction, SvmClassifier};
use crate::dataset::{window_grid, Dataset, Split};
use crate::error::Result;
use crate::eval::{evaluate_classify, ClassifyReport};
use crate::feat::{Extractor, HogExtractor};
use crate::model::{load_model, save_model};
use crate::sign::resize_batch;

const MODEL_KIND: &str = "hog-sign";

/// Background windows added before the first detection fit.
const NEG_TRAIN_COUNT: usize = 2000;
/// Upper bound on mined hard negatives.
const MINING_CAP: usize = 2000;

/// Window classifier selection, persisted with the model.
#[derive(Serialize, Deserialize)]
pub enum WindowClassifier {
    Svm(SvmClassifier),
    Forest(ForestClassifier),
}

impl Classifier for WindowClassifier {
    fn train(&mut self, feats: &DMatrix<f32>, labels: &[usize]) -> Result<()> {
        match self {
            WindowClassifier::Svm(c) => c.train(feats, labels),
            WindowClassifier::Forest(c) => c.train(feats, labels),
        }
    }

    fn predict_prob(&self, feats: &DMatrix<f32>) -> Result<Vec<Prediction>> {
        match self {
            WindowClassifier::Svm(c) => c.predict_prob(feats),
            WindowClassifier::Forest(c) => c.predict_prob(feats),
        }
    }
}

#[derive(Serialize, Deserialize)]
pub struct HogSignClassifier {
    img_size: u32,
    extractor: HogExtractor,
    classifier: WindowClassifier,
}

impl HogSignClassifier {
    pub fn new(extractor: HogExtractor, classifier: WindowClassifier, img_size: u32) -> Self {
        assert!(img_size > 0, "illegal crop size: {}", img_size);
        HogSignClassifier {
            img_size,
            extractor,
            classifier,
        }
    }

    pub fn img_size(&self) -> u32 {
        self.img_size
    }

    /// Trains on the classification crops alone (no background class).
    pub fn train(&mut self, dataset: &Dataset) -> Result<()> {
        let images = dataset.classify_images(Split::Train, Some(self.img_size));
        let labels = dataset.classify_labels(Split::Train);

        info!("extracting HOG features from {} crops", images.len());
        let feats = self.extractor.extract(&images)?;
        self.classifier.train(&feats, labels)?;

        let predicted = self.classifier.predict(&feats)?;
        let report = evaluate_classify(labels, &predicted, dataset.config().class_num, false)?;
        info!("rate on training split: {:.2}%", report.tpr * 100.0);
        Ok(())
    }

    /// Trains on harvested detection windows plus random background
    /// patches, then runs one round of hard-negative mining: scenes are
    /// re-scanned and confidently misclassified background windows join
    /// the training set as label 0 before a final fit.
    pub fn train_with_windows<R: Rng>(
        &mut self,
        dataset: &Dataset,
        windows: &[GrayImage],
        labels: &[usize],
        rng: &mut R,
    ) -> Result<()> {
        let mut images = resize_batch(windows, self.img_size);
        let mut labels = labels.to_vec();

        let negatives =
            dataset.random_neg_patches(Split::Train, NEG_TRAIN_COUNT, self.img_size, true, rng)?;
        labels.extend(std::iter::repeat(0).take(negatives.len()));
        images.extend(negatives);

        info!("initial fit on {} windows", images.len());
        let feats = self.extractor.extract(&images)?;
        self.classifier.train(&feats, &labels)?;

        let hard = self.mine_hard_samples(dataset)?;
        if !hard.is_empty() {
            labels.extend(std::iter::repeat(0).take(hard.len()));
            images.extend(hard);
            info!("refit on {} windows after mining", images.len());
            let feats = self.extractor.extract(&images)?;
            self.classifier.train(&feats, &labels)?;
        }
        Ok(())
    }

    /// Scans the training scenes over the sliding-window grid and collects
    /// background windows the current fit labels as signs.
    fn mine_hard_samples(&self, dataset: &Dataset) -> Result<Vec<GrayImage>> {
        let config = dataset.config();
        let mut hard = Vec::new();
        for index in 0..dataset.scene_len(Split::Train) {
            if hard.len() >= MINING_CAP {
                break;
            }
            let gray = dataset.scene_gray(Split::Train, index)?;

            let mut patches = Vec::new();
            for rect in window_grid(
                gray.width(),
                gray.height(),
                &config.size_list,
                config.detect_step,
            ) {
                if dataset.is_negative_region(Split::Train, index, &rect) {
                    let crop = image::imageops::crop_imm(
                        &gray,
                        rect.x() as u32,
                        rect.y() as u32,
                        rect.width(),
                        rect.height(),
                    )
                    .to_image();
                    patches.push(crop);
                }
            }
            if patches.is_empty() {
                continue;
            }

            let patches = resize_batch(&patches, self.img_size);
            let predicted = self.predict(&patches)?;
            for (patch, prediction) in patches.into_iter().zip(predicted) {
                if prediction.label > 0 {
                    hard.push(patch);
                    if hard.len() >= MINING_CAP {
                        break;
                    }
                }
            }
        }
        info!("mined {} hard negatives", hard.len());
        Ok(hard)
    }

    pub fn predict(&self, images: &[GrayImage]) -> Result<Vec<Prediction>> {
        let images = resize_batch(images, self.img_size);
        let feats = self.extractor.extract(&images)?;
        self.classifier.predict_prob(&feats)
    }

    pub fn test(&self, dataset: &Dataset) -> Result<ClassifyReport> {
        let images = dataset.classify_images(Split::Test, Some(self.img_size));
        let labels = dataset.classify_labels(Split::Test);
        let predicted: Vec<usize> = self
            .predict(&images)?
            .into_iter()
            .map(|p| p.label)
            .collect();
        let report = evaluate_classify(labels, &predicted, dataset.config().class_num, false)?;
        info!("test rate: {:.2}%", report.tpr * 100.0);
        Ok(report)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        save_model(path, MODEL_KIND, self)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        load_model(path, MODEL_KIND)
    }
}
