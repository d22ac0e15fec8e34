//! Domain wrappers tying an extractor and a classifier together with the
//! dataset logic: resizing, open-set rejection and hard-negative mining.

mod hog;
mod knn;

pub use self::hog::{HogSignClassifier, WindowClassifier};
pub use self::knn::KnnSignClassifier;

use image::imageops::FilterType;
use image::GrayImage;

pub(crate) fn resize_batch(images: &[GrayImage], size: u32) -> Vec<GrayImage> {
    images
        .iter()
        .map(|image| {
            if image.width() == size && image.height() == size {
                image.clone()
            } else {
                image::imageops::resize(image, size, size, FilterType::Triangle)
            }
        })
        .collect()
}
