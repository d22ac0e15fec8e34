//! Command-line driver for training, evaluating and running the
//! traffic-sign models.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::SeedableRng;

use rustsign::classifier::{ForestClassifier, SvmClassifier};
use rustsign::dataset::{Dataset, DatasetConfig};
use rustsign::detector::SignDetector;
use rustsign::feat::{EigenExtractor, FisherExtractor, HogExtractor, ProjectionExtractor};
use rustsign::sign::{HogSignClassifier, KnnSignClassifier, WindowClassifier};

#[derive(Parser)]
#[command(name = "signtool", version, about = "Traffic sign recognition toolkit")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Train the projection + KNN classifier on the classification crops.
    TrainKnn {
        #[arg(long, default_value = "data")]
        data_dir: PathBuf,
        #[arg(long, default_value = "knn.json")]
        model: PathBuf,
        /// Use the Fisher projection instead of plain PCA.
        #[arg(long)]
        fisher: bool,
        /// PCA dimensionality, 0 keeps every component.
        #[arg(long, default_value_t = 40)]
        feat_dim: usize,
        #[arg(long, default_value_t = 10)]
        near_num: usize,
        #[arg(long, default_value_t = 20)]
        img_size: u32,
        /// Skip open-set rejection training.
        #[arg(long)]
        no_threshold: bool,
        #[arg(long, default_value_t = 42)]
        seed: u64,
    },
    /// Evaluate a trained KNN model on the held-out crops.
    TestKnn {
        #[arg(long, default_value = "data")]
        data_dir: PathBuf,
        #[arg(long, default_value = "knn.json")]
        model: PathBuf,
    },
    /// Train the HOG classifier on the classification crops.
    TrainHog {
        #[arg(long, default_value = "data")]
        data_dir: PathBuf,
        #[arg(long, default_value = "hog.json")]
        model: PathBuf,
        /// Use a random forest instead of the SVM.
        #[arg(long)]
        forest: bool,
        #[arg(long, default_value_t = 125.0)]
        svm_c: f32,
        #[arg(long, default_value_t = 8)]
        num_orient: usize,
        #[arg(long, default_value_t = 8)]
        cell_size: usize,
        #[arg(long, default_value_t = 100)]
        img_size: u32,
    },
    /// Evaluate a trained HOG model on the held-out crops.
    TestHog {
        #[arg(long, default_value = "data")]
        data_dir: PathBuf,
        #[arg(long, default_value = "hog.json")]
        model: PathBuf,
    },
    /// Train the sliding-window detector on the annotated scenes and
    /// calibrate its confidence threshold.
    TrainDetector {
        #[arg(long, default_value = "data")]
        data_dir: PathBuf,
        #[arg(long, default_value = "detector.json")]
        model: PathBuf,
        #[arg(long)]
        forest: bool,
        #[arg(long, default_value_t = 125.0)]
        svm_c: f32,
        #[arg(long, default_value_t = 4)]
        num_orient: usize,
        #[arg(long, default_value_t = 4)]
        cell_size: usize,
        #[arg(long, default_value_t = 20)]
        img_size: u32,
        /// Skip threshold calibration on the test scenes.
        #[arg(long)]
        no_calibrate: bool,
        #[arg(long, default_value_t = 42)]
        seed: u64,
    },
    /// Re-run threshold calibration for a trained detector.
    Calibrate {
        #[arg(long, default_value = "data")]
        data_dir: PathBuf,
        #[arg(long, default_value = "detector.json")]
        model: PathBuf,
    },
    /// Detect signs on one image and write an annotated copy.
    Detect {
        #[arg(long, default_value = "detector.json")]
        model: PathBuf,
        image: PathBuf,
        #[arg(long, default_value = "detections.png")]
        output: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Command::TrainKnn {
            data_dir,
            model,
            fisher,
            feat_dim,
            near_num,
            img_size,
            no_threshold,
            seed,
        } => {
            let dataset = load_dataset(&data_dir)?;
            let extractor = if fisher {
                ProjectionExtractor::Fisher(FisherExtractor::new())
            } else {
                ProjectionExtractor::Eigen(EigenExtractor::new(feat_dim))
            };
            let mut classifier =
                KnnSignClassifier::new(extractor, near_num, img_size, !no_threshold);
            let mut rng = StdRng::seed_from_u64(seed);
            classifier
                .train(&dataset, &mut rng)
                .context("KNN training failed")?;
            classifier.test(&dataset)?;
            classifier
                .save(&model)
                .with_context(|| format!("cannot save model to {}", model.display()))?;
        }
        Command::TestKnn { data_dir, model } => {
            let dataset = load_dataset(&data_dir)?;
            let classifier = KnnSignClassifier::load(&model)
                .with_context(|| format!("cannot load model from {}", model.display()))?;
            let report = classifier.test(&dataset)?;
            println!(
                "test rate: {:.2}%, false positives: {:.2}%",
                report.tpr * 100.0,
                report.fpr * 100.0
            );
        }
        Command::TrainHog {
            data_dir,
            model,
            forest,
            svm_c,
            num_orient,
            cell_size,
            img_size,
        } => {
            let dataset = load_dataset(&data_dir)?;
            let mut classifier = HogSignClassifier::new(
                HogExtractor::new(num_orient, cell_size),
                window_classifier(forest, svm_c),
                img_size,
            );
            classifier.train(&dataset).context("HOG training failed")?;
            classifier.test(&dataset)?;
            classifier
                .save(&model)
                .with_context(|| format!("cannot save model to {}", model.display()))?;
        }
        Command::TestHog { data_dir, model } => {
            let dataset = load_dataset(&data_dir)?;
            let classifier = HogSignClassifier::load(&model)
                .with_context(|| format!("cannot load model from {}", model.display()))?;
            let report = classifier.test(&dataset)?;
            println!("test rate: {:.2}%", report.tpr * 100.0);
        }
        Command::TrainDetector {
            data_dir,
            model,
            forest,
            svm_c,
            num_orient,
            cell_size,
            img_size,
            no_calibrate,
            seed,
        } => {
            let dataset = load_dataset(&data_dir)?;
            let classifier = HogSignClassifier::new(
                HogExtractor::new(num_orient, cell_size),
                window_classifier(forest, svm_c),
                img_size,
            );
            let config = dataset.config();
            let mut detector =
                SignDetector::new(classifier, config.size_list.clone(), config.detect_step);
            let mut rng = StdRng::seed_from_u64(seed);
            detector
                .train(&dataset, &mut rng)
                .context("detector training failed")?;
            if !no_calibrate {
                detector.calibrate(&dataset)?;
            }
            detector
                .save(&model)
                .with_context(|| format!("cannot save model to {}", model.display()))?;
        }
        Command::Calibrate { data_dir, model } => {
            let dataset = load_dataset(&data_dir)?;
            let mut detector = rustsign::create_detector(&model)
                .with_context(|| format!("cannot load model from {}", model.display()))?;
            let curve = detector.calibrate(&dataset)?;
            for point in &curve {
                println!("{:.4}\t{:.6}", point.miss, point.fppw);
            }
            println!("threshold: {:.2}", detector.threshold());
            detector.save(&model)?;
        }
        Command::Detect {
            model,
            image,
            output,
        } => {
            let detector = rustsign::create_detector(&model)
                .with_context(|| format!("cannot load model from {}", model.display()))?;
            let source = image::open(&image)
                .with_context(|| format!("cannot open image {}", image.display()))?;
            let detections = detector.detect(&source.to_luma8())?;
            for detection in &detections {
                println!(
                    "sign {} at ({}, {}) {}x{}, confidence {:.2}",
                    detection.label(),
                    detection.bbox().x(),
                    detection.bbox().y(),
                    detection.bbox().width(),
                    detection.bbox().height(),
                    detection.score()
                );
            }
            let mut canvas = source.to_rgb8();
            rustsign::dataset::draw_detections(&mut canvas, &detections);
            canvas
                .save(&output)
                .with_context(|| format!("cannot write {}", output.display()))?;
            println!("{} detections written to {}", detections.len(), output.display());
        }
    }
    Ok(())
}

fn load_dataset(data_dir: &PathBuf) -> anyhow::Result<Dataset> {
    Dataset::load(data_dir, DatasetConfig::default())
        .with_context(|| format!("cannot load dataset from {}", data_dir.display()))
}

fn window_classifier(forest: bool, svm_c: f32) -> WindowClassifier {
    if forest {
        WindowClassifier::Forest(ForestClassifier::default())
    } else {
        WindowClassifier::Svm(SvmClassifier::new(svm_c))
    }
}
