//! Classification engine — turns image bytes into a label and per-label scores.

pub mod artifact;
pub mod http;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ClassifierError;
use crate::model::Detection;

pub use artifact::ModelArtifact;
pub use http::HttpClassifier;

/// Raw model output for one image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    /// Top predicted label.
    #[serde(rename = "predicted_label")]
    pub label: String,
    /// Score per label, each in `[0, 1]`.
    pub scores: HashMap<String, f64>,
}

impl Prediction {
    /// Reduce to a detection for `target_label`.
    ///
    /// Confidence is the score of the predicted label. If the model omitted
    /// that label's score, the highest score present is used instead.
    pub fn detection(&self, target_label: &str) -> Detection {
        let contains = self.label.eq_ignore_ascii_case(target_label);
        let confidence = self
            .scores
            .get(&self.label)
            .copied()
            .or_else(|| self.scores.values().copied().reduce(f64::max))
            .unwrap_or(0.0);
        Detection::new(contains, confidence)
    }
}

/// A stateless image classifier.
#[async_trait]
pub trait Classifier: Send + Sync {
    /// Name of the loaded model, for logs.
    fn model_name(&self) -> &str;

    /// Label that counts as a wildboar sighting.
    fn target_label(&self) -> &str {
        "wildboar"
    }

    async fn classify(&self, image: &[u8]) -> Result<Prediction, ClassifierError>;
}
