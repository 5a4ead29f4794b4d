pub mod engine;
pub mod pipeline;

use std::path::Path;

use serde::Serialize;

use crate::error::Result;

pub use engine::InferenceEngine;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    pub label: String,
    pub confidence: f64,
}

/// Labels a still image.
pub trait Classifier {
    fn classify(&self, image_path: &Path) -> Result<Prediction>;
}
