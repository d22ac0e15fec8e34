//! Dalal-Triggs HOG descriptor.

use image::GrayImage;
use nalgebra::DMatrix;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::feat::Extractor;

const L2_HYS_CLIP: f32 = 0.2;
const NORM_EPSILON: f32 = 1e-5;

/// Histogram-of-oriented-gradients extractor with unsigned orientation
/// bins, cell histograms and 2x2-cell block normalization.
#[derive(Clone, Serialize, Deserialize)]
pub struct HogExtractor {
    num_orient: usize,
    cell_size: usize,
}

impl Default for HogExtractor {
    fn default() -> Self {
        HogExtractor::new(8, 8)
    }
}

impl HogExtractor {
    pub fn new(num_orient: usize, cell_size: usize) -> Self {
        assert!(num_orient > 0, "illegal orientation bin count");
        assert!(cell_size > 0, "illegal cell size");
        HogExtractor {
            num_orient,
            cell_size,
        }
    }

    /// Descriptor length for a given input size.
    pub fn descriptor_len(&self, width: u32, height: u32) -> usize {
        let cells_x = width as usize / self.cell_size;
        let cells_y = height as usize / self.cell_size;
        if cells_x < 2 || cells_y < 2 {
            return 0;
        }
        (cells_x - 1) * (cells_y - 1) * 4 * self.num_orient
    }

    pub fn describe(&self, image: &GrayImage) -> Result<Vec<f32>> {
        let width = image.width() as usize;
        let height = image.height() as usize;
        let cells_x = width / self.cell_size;
        let cells_y = height / self.cell_size;
        if cells_x < 2 || cells_y < 2 {
            return Err(Error::ShapeMismatch(format!(
                "{}x{} image is too small for cell size {}",
                width, height, self.cell_size
            )));
        }

        // Cell histograms with a linear vote between the two nearest
        // unsigned orientation bins.
        let mut cells = vec![0.0f32; cells_x * cells_y * self.num_orient];
        let bin_width = std::f32::consts::PI / self.num_orient as f32;
        let data = image.as_raw();
        let px = |x: usize, y: usize| f32::from(data[y * width + x]);

        for y in 0..cells_y * self.cell_size {
            for x in 0..cells_x * self.cell_size {
                let gx = px((x + 1).min(width - 1), y) - px(x.saturating_sub(1), y);
                let gy = px(x, (y + 1).min(height - 1)) - px(x, y.saturating_sub(1));
                let magnitude = (gx * gx + gy * gy).sqrt();
                if magnitude == 0.0 {
                    continue;
                }
                let mut orientation = gy.atan2(gx);
                if orientation < 0.0 {
                    orientation += std::f32::consts::PI;
                }
                if orientation >= std::f32::consts::PI {
                    orientation -= std::f32::consts::PI;
                }

                let position = orientation / bin_width - 0.5;
                let low = position.floor();
                let high_weight = position - low;
                let low_bin = (low as i32).rem_euclid(self.num_orient as i32) as usize;
                let high_bin = (low_bin + 1) % self.num_orient;

                let cell = (y / self.cell_size) * cells_x + x / self.cell_size;
                let base = cell * self.num_orient;
                cells[base + low_bin] += magnitude * (1.0 - high_weight);
                cells[base + high_bin] += magnitude * high_weight;
            }
        }

        // Overlapping 2x2 blocks with L2-hys normalization.
        let mut descriptor = Vec::with_capacity(self.descriptor_len(
            image.width(),
            image.height(),
        ));
        for by in 0..cells_y - 1 {
            for bx in 0..cells_x - 1 {
                let mut block = Vec::with_capacity(4 * self.num_orient);
                for (dy, dx) in [(0, 0), (0, 1), (1, 0), (1, 1)] {
                    let cell = (by + dy) * cells_x + (bx + dx);
                    let base = cell * self.num_orient;
                    block.extend_from_slice(&cells[base..base + self.num_orient]);
                }

                let norm = block.iter().map(|v| v * v).sum::<f32>().sqrt() + NORM_EPSILON;
                for v in block.iter_mut() {
                    *v = (*v / norm).min(L2_HYS_CLIP);
                }
                let norm = block.iter().map(|v| v * v).sum::<f32>().sqrt() + NORM_EPSILON;
                for v in block.iter_mut() {
                    *v /= norm;
                }
                descriptor.extend_from_slice(&block);
            }
        }
        Ok(descriptor)
    }
}

impl Extractor for HogExtractor {
    fn extract(&self, images: &[GrayImage]) -> Result<DMatrix<f32>> {
        let first = images
            .first()
            .ok_or_else(|| Error::ShapeMismatch("empty image batch".into()))?;
        let dim = self.descriptor_len(first.width(), first.height());

        let descriptors: Vec<Vec<f32>> = images
            .par_iter()
            .map(|image| self.describe(image))
            .collect::<Result<_>>()?;

        let mut data = Vec::with_capacity(images.len() * dim);
        for descriptor in &descriptors {
            if descriptor.len() != dim {
                return Err(Error::ShapeMismatch(
                    "HOG batch contains images of mixed sizes".into(),
                ));
            }
            data.extend_from_slice(descriptor);
        }
        Ok(DMatrix::from_row_slice(images.len(), dim, &data))
    }

    fn feat_dim(&self) -> usize {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    #[test]
    fn test_descriptor_len() {
        let hog = HogExtractor::new(8, 8);
        // 32x32 -> 4x4 cells -> 3x3 blocks of 32 values.
        assert_eq!(3 * 3 * 4 * 8, hog.descriptor_len(32, 32));
        assert_eq!(0, hog.descriptor_len(8, 8));
    }

    #[test]
    fn test_uniform_image_has_empty_histograms() {
        let hog = HogExtractor::new(4, 4);
        let image = GrayImage::from_pixel(16, 16, Luma([128]));
        let descriptor = hog.describe(&image).unwrap();
        assert!(descriptor.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_vertical_edge_produces_horizontal_gradient() {
        let hog = HogExtractor::new(4, 4);
        let image = GrayImage::from_fn(16, 16, |x, _| if x < 8 { Luma([0]) } else { Luma([255]) });
        let descriptor = hog.describe(&image).unwrap();

        // Horizontal gradients vote into the bins around orientation zero;
        // the two bins adjacent to pi/2 stay empty.
        let sums: Vec<f32> = (0..4)
            .map(|bin| descriptor.iter().skip(bin).step_by(4).sum())
            .collect();
        let edge_votes = sums[0] + sums[3];
        let flat_votes = sums[1] + sums[2];
        assert!(edge_votes > 0.0);
        assert!(flat_votes < edge_votes * 0.1);
    }

    #[test]
    fn test_batch_extraction_shape() {
        let hog = HogExtractor::new(8, 8);
        let images = vec![
            GrayImage::from_pixel(32, 32, Luma([7])),
            GrayImage::from_pixel(32, 32, Luma([9])),
        ];
        let feats = hog.extract(&images).unwrap();
        assert_eq!((2, hog.descriptor_len(32, 32)), feats.shape());
    }

    #[test]
    fn test_mixed_sizes_rejected() {
        let hog = HogExtractor::new(8, 8);
        let images = vec![
            GrayImage::from_pixel(32, 32, Luma([0])),
            GrayImage::from_pixel(40, 32, Luma([0])),
        ];
        assert!(hog.extract(&images).is_err());
    }
}
