//! HTTP inference client for a model described by a [`ModelArtifact`].

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use tracing::debug;

use crate::classify::{Classifier, ModelArtifact, Prediction};
use crate::error::ClassifierError;

/// Sends each image as multipart form data to the model's inference endpoint.
pub struct HttpClassifier {
    artifact: ModelArtifact,
    client: reqwest::Client,
}

impl HttpClassifier {
    pub fn new(artifact: ModelArtifact) -> Result<Self, ClassifierError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(artifact.timeout_secs))
            .build()
            .map_err(|e| ClassifierError::Inference {
                model: artifact.name.clone(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { artifact, client })
    }

    /// Load the artifact at `path` and build a client for it.
    pub fn from_path(path: &Path) -> Result<Self, ClassifierError> {
        Self::new(ModelArtifact::load(path)?)
    }

    fn inference_error(&self, reason: impl Into<String>) -> ClassifierError {
        ClassifierError::Inference {
            model: self.artifact.name.clone(),
            reason: reason.into(),
        }
    }

    /// Reject labels the model does not declare and scores outside `[0, 1]`.
    fn validate(&self, prediction: &Prediction) -> Result<(), ClassifierError> {
        let invalid = |reason: String| ClassifierError::InvalidPrediction {
            model: self.artifact.name.clone(),
            reason,
        };

        if !self.artifact.knows_label(&prediction.label) {
            return Err(invalid(format!("unknown label '{}'", prediction.label)));
        }
        for (label, score) in &prediction.scores {
            if !self.artifact.knows_label(label) {
                return Err(invalid(format!("score for unknown label '{label}'")));
            }
            if !(0.0..=1.0).contains(score) {
                return Err(invalid(format!("score {score} for '{label}' is outside [0, 1]")));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Classifier for HttpClassifier {
    fn model_name(&self) -> &str {
        &self.artifact.name
    }

    fn target_label(&self) -> &str {
        &self.artifact.target_label
    }

    async fn classify(&self, image: &[u8]) -> Result<Prediction, ClassifierError> {
        let part = Part::bytes(image.to_vec())
            .file_name("image.jpg")
            .mime_str("image/jpeg")
            .map_err(|e| self.inference_error(e.to_string()))?;
        let form = Form::new().part("image", part);

        let resp = self
            .client
            .post(&self.artifact.endpoint)
            .multipart(form)
            .send()
            .await
            .map_err(|e| self.inference_error(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(self.inference_error(format!("inference endpoint returned {}", resp.status())));
        }

        let prediction: Prediction =
            resp.json()
                .await
                .map_err(|e| ClassifierError::InvalidPrediction {
                    model: self.artifact.name.clone(),
                    reason: e.to_string(),
                })?;
        self.validate(&prediction)?;

        debug!(model = %self.artifact.name, label = %prediction.label, "Image classified");
        Ok(prediction)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use axum::Router;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;

    use super::*;

    fn artifact(endpoint: &str) -> ModelArtifact {
        ModelArtifact {
            name: "boar-test".into(),
            endpoint: endpoint.into(),
            labels: vec!["wildboar".into(), "empty".into()],
            target_label: "wildboar".into(),
            timeout_secs: 5,
        }
    }

    fn prediction(label: &str, scores: &[(&str, f64)]) -> Prediction {
        Prediction {
            label: label.into(),
            scores: scores.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
        }
    }

    async fn spawn_endpoint(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        format!("http://{addr}/classify")
    }

    #[test]
    fn validate_rejects_unknown_label() {
        let c = HttpClassifier::new(artifact("http://localhost/classify")).unwrap();
        let err = c.validate(&prediction("moose", &[("moose", 0.9)])).unwrap_err();
        assert!(matches!(err, ClassifierError::InvalidPrediction { .. }));
    }

    #[test]
    fn validate_rejects_out_of_range_score() {
        let c = HttpClassifier::new(artifact("http://localhost/classify")).unwrap();
        let err = c
            .validate(&prediction("wildboar", &[("wildboar", 1.2)]))
            .unwrap_err();
        assert!(err.to_string().contains("outside [0, 1]"));
    }

    #[test]
    fn validate_accepts_well_formed_prediction() {
        let c = HttpClassifier::new(artifact("http://localhost/classify")).unwrap();
        assert!(c
            .validate(&prediction("empty", &[("empty", 0.7), ("wildboar", 0.3)]))
            .is_ok());
    }

    #[tokio::test]
    async fn classify_posts_multipart_and_parses_prediction() {
        let app = Router::new().route(
            "/classify",
            post(|headers: HeaderMap, body: axum::body::Bytes| async move {
                let content_type = headers
                    .get("content-type")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default();
                if !content_type.starts_with("multipart/form-data") || body.is_empty() {
                    return (StatusCode::BAD_REQUEST, String::new());
                }
                let mut scores = HashMap::new();
                scores.insert("wildboar", 0.9);
                scores.insert("empty", 0.1);
                let body = serde_json::json!({"predicted_label": "wildboar", "scores": scores});
                (StatusCode::OK, body.to_string())
            }),
        );
        let endpoint = spawn_endpoint(app).await;

        let classifier = HttpClassifier::new(artifact(&endpoint)).unwrap();
        let p = classifier.classify(&[0xFF, 0xD8, 0xFF]).await.unwrap();
        assert_eq!(p.label, "wildboar");
        assert_eq!(p.detection(classifier.target_label()).confidence, 0.9);
    }

    #[tokio::test]
    async fn server_error_is_inference_error() {
        let app = Router::new().route(
            "/classify",
            post(|| async { StatusCode::SERVICE_UNAVAILABLE }),
        );
        let endpoint = spawn_endpoint(app).await;

        let classifier = HttpClassifier::new(artifact(&endpoint)).unwrap();
        let err = classifier.classify(b"img").await.unwrap_err();
        assert!(matches!(err, ClassifierError::Inference { .. }));
    }
}
