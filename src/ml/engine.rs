use std::fs;
use std::path::Path;

use ort::session::Session;
use anyhow::{Result, Context, anyhow};
use ndarray::Array4;
use tracing::info;

use crate::error::PipelineError;
use crate::ml::pipeline::{normalize_for_classifier, softmax, top_class};
use crate::ml::{Classifier, Prediction};

/// ONNX still-image classifier plus the label for each output index.
pub struct InferenceEngine {
    session: Session,
    labels: Vec<String>,
}

impl InferenceEngine {
    pub fn new(model_path: &Path, labels_path: &Path) -> Result<Self> {
        // Global environment; a second init in the same process is harmless.
        let _ = ort::init()
            .with_name("motion-watch-inference")
            .commit();

        let session = Session::builder()?
            .with_intra_threads(1)?
            .commit_from_file(model_path)
            .with_context(|| format!("Failed to load still model {:?}", model_path))?;

        let labels = load_labels(labels_path)?;
        info!("Loaded still model {:?} with {} labels", model_path, labels.len());

        Ok(Self { session, labels })
    }

    fn run(&self, input: Array4<f32>) -> ort::Result<Vec<f32>> {
        let outputs = self.session.run(ort::inputs![input.view()]?)?;
        let scores = outputs[0].try_extract_tensor::<f32>()?;
        Ok(scores.iter().copied().collect())
    }
}

fn load_labels(path: &Path) -> Result<Vec<String>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read labels file {:?}", path))?;
    let labels: Vec<String> = raw
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect();
    if labels.is_empty() {
        return Err(anyhow!("Labels file {:?} is empty", path));
    }
    Ok(labels)
}

impl Classifier for InferenceEngine {
    fn classify(&self, image_path: &Path) -> crate::error::Result<Prediction> {
        let image = image::open(image_path)?;
        let logits = self
            .run(normalize_for_classifier(&image))
            .map_err(|e| PipelineError::Classifier(e.to_string()))?;
        if logits.len() != self.labels.len() {
            return Err(PipelineError::Classifier(format!(
                "model returned {} scores for {} labels",
                logits.len(),
                self.labels.len()
            )));
        }

        let probs = softmax(&logits);
        let (idx, confidence) = top_class(&probs)
            .ok_or_else(|| PipelineError::Classifier("model returned no scores".into()))?;
        Ok(Prediction {
            label: self.labels[idx].clone(),
            confidence: confidence as f64,
        })
    }
}
