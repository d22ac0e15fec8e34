use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to read image {path}: {source}")]
    Image {
        path: PathBuf,
        source: image::ImageError,
    },

    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("model has not been trained")]
    NotTrained,

    #[error("invalid model file: {0}")]
    InvalidModel(String),

    #[error("invalid annotation (line {line}): {reason}")]
    InvalidAnnotation { line: usize, reason: String },

    #[error("dataset error: {0}")]
    Dataset(String),

    #[error("model serialization error: {0}")]
    Json(#[from] serde_json::Error),
}
