//! Model artifact — a JSON manifest describing the deployed classifier.

use std::path::Path;

use serde::Deserialize;

use crate::error::ClassifierError;

fn default_target_label() -> String {
    "wildboar".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

/// Manifest loaded once at startup.
///
/// ```json
/// {
///   "name": "wildboar-v3",
///   "endpoint": "http://inference:9000/v1/classify",
///   "labels": ["wildboar", "deer", "empty"],
///   "target_label": "wildboar",
///   "timeout_secs": 30
/// }
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct ModelArtifact {
    pub name: String,
    pub endpoint: String,
    pub labels: Vec<String>,
    #[serde(default = "default_target_label")]
    pub target_label: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl ModelArtifact {
    /// Read and validate a manifest. Any problem is a `ModelLoad` error.
    pub fn load(path: &Path) -> Result<Self, ClassifierError> {
        let load_err = |reason: String| ClassifierError::ModelLoad {
            path: path.to_path_buf(),
            reason,
        };

        let raw = std::fs::read_to_string(path).map_err(|e| load_err(e.to_string()))?;
        let artifact: Self = serde_json::from_str(&raw).map_err(|e| load_err(e.to_string()))?;

        if artifact.name.trim().is_empty() {
            return Err(load_err("model name is empty".into()));
        }
        if artifact.labels.is_empty() {
            return Err(load_err("label list is empty".into()));
        }
        if !artifact
            .labels
            .iter()
            .any(|l| l.eq_ignore_ascii_case(&artifact.target_label))
        {
            return Err(load_err(format!(
                "target label '{}' is not one of the model labels",
                artifact.target_label
            )));
        }
        reqwest::Url::parse(&artifact.endpoint)
            .map_err(|e| load_err(format!("invalid endpoint: {e}")))?;

        Ok(artifact)
    }

    pub fn knows_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }
}
