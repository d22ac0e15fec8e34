//! Persistence for trained models.
//!
//! Every trained component (extractor, classifier, sign wrapper, detector)
//! serializes to a JSON file wrapped in a small envelope, so that loading a
//! file into the wrong component kind fails early instead of producing a
//! silently broken model.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const MODEL_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct ModelFile<T> {
    kind: String,
    version: u32,
    model: T,
}

pub fn save_model<T, P>(path: P, kind: &str, model: &T) -> Result<()>
where
    T: Serialize,
    P: AsRef<Path>,
{
    let file = File::create(path)?;
    let envelope = ModelFile {
        kind: kind.to_owned(),
        version: MODEL_VERSION,
        model,
    };
    serde_json::to_writer(BufWriter::new(file), &envelope)?;
    Ok(())
}

pub fn load_model<T, P>(path: P, kind: &str) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let file = File::open(path)?;
    let envelope: ModelFile<T> = serde_json::from_reader(BufReader::new(file))?;
    if envelope.kind != kind {
        return Err(Error::InvalidModel(format!(
            "expected a {} model, found {}",
            kind, envelope.kind
        )));
    }
    if envelope.version != MODEL_VERSION {
        return Err(Error::InvalidModel(format!(
            "unsupported model version {}",
            envelope.version
        )));
    }
    Ok(envelope.model)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_path(name: &str) -> std::path::PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("rustsign-{}-{}", std::process::id(), name));
        path
    }

    #[test]
    fn test_save_load_roundtrip() {
        let path = tmp_path("roundtrip.json");
        save_model(&path, "test", &vec![1u32, 2, 3]).unwrap();
        let loaded: Vec<u32> = load_model(&path, "test").unwrap();
        assert_eq!(vec![1, 2, 3], loaded);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_kind_mismatch_is_rejected() {
        let path = tmp_path("kind.json");
        save_model(&path, "knn", &42u32).unwrap();
        let result: Result<u32> = load_model(&path, "svm");
        assert!(result.is_err());
        std::fs::remove_file(&path).ok();
    }
}
