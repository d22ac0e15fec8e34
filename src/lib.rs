//! Traffic-sign recognition: feature extraction, multi-class
//! classification and sliding-window detection.
//!
//! The crate covers the full pipeline of the coursework-style German
//! traffic-sign task: a [`dataset::Dataset`] loads classification crops
//! and annotated scenes, the [`feat`] extractors turn fixed-size
//! grayscale crops into feature vectors, the [`classifier`] module
//! provides KNN, SVM and random-forest classifiers, and
//! [`SignDetector`] slides windows over a scene and merges the
//! responses into final detections.
//!
//! # Examples
//!
//! ```no_run
//! use rustsign::create_detector;
//!
//! let detector = create_detector("detector.json").unwrap();
//! let image = image::open("scene.jpg").unwrap().to_luma8();
//! for detection in detector.detect(&image).unwrap() {
//!     println!(
//!         "sign {} at {:?} ({:.2})",
//!         detection.label(),
//!         detection.bbox(),
//!         detection.score()
//!     );
//! }
//! ```

pub mod classifier;
pub mod common;
pub mod dataset;
pub mod detector;
pub mod eval;
pub mod feat;
pub mod math;
pub mod model;
pub mod sign;

mod error;

pub use crate::common::{Detection, Rectangle};
pub use crate::detector::SignDetector;
pub use crate::error::{Error, Result};
pub use crate::sign::{HogSignClassifier, KnnSignClassifier};

use std::path::Path;

/// Loads a trained sign detector from a model file.
pub fn create_detector<P: AsRef<Path>>(path: P) -> Result<SignDetector> {
    SignDetector::load(path)
}
