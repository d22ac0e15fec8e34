//! Basic geometry shared by the dataset, detector and evaluation code.

use serde::{Deserialize, Serialize};

/// Axis-aligned box in image coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rectangle {
    x: i32,
    y: i32,
    width: u32,
    height: u32,
}

impl Rectangle {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Rectangle {
            x,
            y,
            width,
            height,
        }
    }

    pub fn x(&self) -> i32 {
        self.x
    }

    pub fn set_x(&mut self, x: i32) {
        self.x = x;
    }

    pub fn y(&self) -> i32 {
        self.y
    }

    pub fn set_y(&mut self, y: i32) {
        self.y = y;
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn set_width(&mut self, width: u32) {
        self.width = width;
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn set_height(&mut self, height: u32) {
        self.height = height;
    }

    pub fn area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    fn right(&self) -> i32 {
        self.x + self.width as i32
    }

    fn bottom(&self) -> i32 {
        self.y + self.height as i32
    }

    pub fn intersect_area(&self, other: &Rectangle) -> u64 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = self.right().min(other.right());
        let y2 = self.bottom().min(other.bottom());
        if x2 <= x1 || y2 <= y1 {
            return 0;
        }
        (x2 - x1) as u64 * (y2 - y1) as u64
    }

    pub fn union_area(&self, other: &Rectangle) -> u64 {
        self.area() + other.area() - self.intersect_area(other)
    }

    /// Intersection over union. Zero when the union is degenerate.
    pub fn iou(&self, other: &Rectangle) -> f32 {
        let union = self.union_area(other);
        if union == 0 {
            return 0.0;
        }
        self.intersect_area(other) as f32 / union as f32
    }
}

/// One detected sign: bounding box, predicted class and confidence.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Detection {
    bbox: Rectangle,
    label: usize,
    score: f32,
}

impl Detection {
    pub fn new(bbox: Rectangle, label: usize, score: f32) -> Self {
        Detection { bbox, label, score }
    }

    pub fn bbox(&self) -> &Rectangle {
        &self.bbox
    }

    pub fn bbox_mut(&mut self) -> &mut Rectangle {
        &mut self.bbox
    }

    pub fn label(&self) -> usize {
        self.label
    }

    pub fn score(&self) -> f32 {
        self.score
    }

    pub fn set_score(&mut self, score: f32) {
        self.score = score;
    }
}
