//! HTTP client for the multimodal vision model.

use std::collections::HashMap;
use std::time::Duration;

use base64::Engine;
use reqwest::Client;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use oshield_models::{DetectionType, Verdict, WitnessReport};

use crate::error::{WitnessError, WitnessResult};
use crate::rules::rule_verdict;

/// Confidence assigned to mock responses; reflects that nothing was seen.
const MOCK_CONFIDENCE: f64 = 0.5;

const WITNESS_PROMPT: &str = "\
You are an objective visual witness. Describe ONLY what is visible in the \
image. Do not make legal judgments.

Return ONLY a valid JSON object with this exact structure:
{
    \"visual_summary\": \"factual description of the scene\",
    \"tags\": [\"tag1\", \"tag2\"],
    \"environment\": \"single environment label\",
    \"clothing_level\": \"formal|casual|athletic|swimwear|medical|minimal|uniform|religious\",
    \"visible_biometrics\": {
        \"face_visible\": true or false,
        \"tattoos_visible\": true or false,
        \"scars_visible\": true or false,
        \"distinctive_marks\": []
    },
    \"context_indicators\": [\"indicator1\"],
    \"age_group\": \"child|teenager|adult|elderly|unknown\",
    \"confidence\": 0.0 to 1.0
}";

const CLASSIFY_PROMPT: &str = "\
Classify the main object in this image as exactly one of: face, person, \
license_plate, fingerprint, id_document, credit_card, hand_biometric, \
signature. Return ONLY a JSON object: {\"detection_type\": \"<label>\"}";

/// Vision backend configuration.
#[derive(Debug, Clone)]
pub struct WitnessConfig {
    /// OpenAI-style chat completions endpoint
    pub endpoint: String,
    /// Model identifier sent with each request
    pub model_id: String,
    pub timeout: Duration,
}

impl WitnessConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            endpoint: std::env::var("MULTIMODAL_API_URL")
                .unwrap_or_else(|_| "http://localhost:8000/v1/chat/completions".to_string()),
            model_id: std::env::var("MULTIMODAL_MODEL_ID")
                .unwrap_or_else(|_| "google/gemma-3-4b-it".to_string()),
            timeout: Duration::from_secs(120),
        }
    }
}

/// Client for witness descriptions, classifications and verdicts.
pub struct WitnessClient {
    http: Client,
    config: WitnessConfig,
    /// Classification results cached per image path.
    classification_cache: Mutex<HashMap<String, DetectionType>>,
}

impl WitnessClient {
    pub fn new(config: WitnessConfig) -> WitnessResult<Self> {
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(WitnessError::Network)?;
        Ok(Self {
            http,
            config,
            classification_cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn from_env() -> WitnessResult<Self> {
        Self::new(WitnessConfig::from_env())
    }

    /// Model identifier recorded on verification records.
    pub fn model_id(&self) -> &str {
        &self.config.model_id
    }

    /// Witness mode: objective description of one capture image.
    ///
    /// Never fails: any backend or parse problem degrades to a mock report
    /// with reduced confidence.
    pub async fn describe(&self, image_path: &str) -> WitnessReport {
        match self.describe_inner(image_path).await {
            Ok(report) => report,
            Err(e) => {
                warn!(image = %image_path, "Witness call failed, using mock report: {e}");
                metrics::counter!("oshield_witness_mock_responses_total").increment(1);
                mock_report()
            }
        }
    }

    async fn describe_inner(&self, image_path: &str) -> WitnessResult<WitnessReport> {
        let content = self.chat_with_image(WITNESS_PROMPT, image_path).await?;
        let value = extract_json(&content)?;
        let mut report: WitnessReport = serde_json::from_value(value)?;
        if report.confidence <= 0.0 {
            report.confidence = MOCK_CONFIDENCE;
        }
        Ok(report)
    }

    /// Rule-derived verdict for a non-person detection type.
    ///
    /// The mapping is deterministic, so backend availability does not change
    /// the outcome, only the surrounding context snippets do.
    pub fn verdict(&self, detection_type: DetectionType, context: &[String]) -> Verdict {
        rule_verdict(detection_type, context)
    }

    /// Re-label an ambiguous class (`unknown`, `hand`, `hand_crop`) to one of
    /// the supported types. Results are cached per image path.
    pub async fn classify(&self, image_path: &str) -> DetectionType {
        {
            let cache = self.classification_cache.lock().await;
            if let Some(ty) = cache.get(image_path) {
                return *ty;
            }
        }

        let ty = match self.classify_inner(image_path).await {
            Ok(ty) => ty,
            Err(e) => {
                warn!(image = %image_path, "Classification failed: {e}");
                DetectionType::Unknown
            }
        };

        self.classification_cache
            .lock()
            .await
            .insert(image_path.to_string(), ty);
        ty
    }

    async fn classify_inner(&self, image_path: &str) -> WitnessResult<DetectionType> {
        let content = self.chat_with_image(CLASSIFY_PROMPT, image_path).await?;
        let value = extract_json(&content)?;
        let label = value
            .get("detection_type")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                WitnessError::InvalidResponse("missing detection_type field".to_string())
            })?;
        Ok(DetectionType::parse(label))
    }

    /// One chat-completions round trip with an inline image.
    async fn chat_with_image(&self, prompt: &str, image_path: &str) -> WitnessResult<String> {
        let bytes = tokio::fs::read(image_path).await?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
        let data_url = format!("data:image/jpeg;base64,{encoded}");

        let body = json!({
            "model": self.config.model_id,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": prompt },
                    { "type": "image_url", "image_url": { "url": data_url } },
                ],
            }],
            "max_tokens": 1024,
            "temperature": 0,
        });

        debug!(model = %self.config.model_id, image = %image_path, "Vision model request");
        let response = self
            .http
            .post(&self.config.endpoint)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;

        let payload: Value = response.json().await?;
        metrics::counter!("oshield_witness_calls_total").increment(1);

        payload
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| WitnessError::InvalidResponse("no completion content".to_string()))
    }
}

/// Mock witness report used when the backend is unreachable. Shape matches
/// the real response so downstream consumers cannot tell them apart
/// structurally.
fn mock_report() -> WitnessReport {
    WitnessReport {
        visual_summary: "Vision backend unavailable; no description produced.".to_string(),
        environment: "unknown".to_string(),
        confidence: MOCK_CONFIDENCE,
        ..Default::default()
    }
}

/// Extract a JSON object from model output that may wrap it in prose or
/// code fences.
fn extract_json(text: &str) -> WitnessResult<Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Ok(value);
    }

    let start = trimmed.find('{');
    let end = trimmed.rfind('}');
    if let (Some(start), Some(end)) = (start, end) {
        if end > start {
            if let Ok(value) = serde_json::from_str(&trimmed[start..=end]) {
                return Ok(value);
            }
        }
    }

    Err(WitnessError::InvalidResponse(format!(
        "no JSON object in output: {}",
        &trimmed[..trimmed.len().min(200)]
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(endpoint: String) -> WitnessConfig {
        WitnessConfig {
            endpoint,
            model_id: "test-model".to_string(),
            timeout: Duration::from_secs(2),
        }
    }

    fn jpeg_fixture() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10]).unwrap();
        file
    }

    fn completion(content: &str) -> Value {
        json!({ "choices": [{ "message": { "role": "assistant", "content": content } }] })
    }

    #[test]
    fn test_extract_json_direct() {
        let value = extract_json(r#"{"a": 1}"#).unwrap();
        assert_eq!(value["a"], 1);
    }

    #[test]
    fn test_extract_json_with_surrounding_prose() {
        let text = "Here is the result:\n```json\n{\"is_violation\": true}\n```\nDone.";
        let value = extract_json(text).unwrap();
        assert_eq!(value["is_violation"], true);
    }

    #[test]
    fn test_extract_json_failure() {
        assert!(extract_json("no json here").is_err());
    }

    #[tokio::test]
    async fn test_describe_parses_witness_report() {
        let server = MockServer::start().await;
        let report = r#"{
            "visual_summary": "person walking in a park",
            "tags": ["park", "daytime"],
            "environment": "public_space",
            "clothing_level": "casual",
            "age_group": "adult",
            "confidence": 0.88
        }"#;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion(report)))
            .mount(&server)
            .await;

        let client = WitnessClient::new(test_config(format!(
            "{}/v1/chat/completions",
            server.uri()
        )))
        .unwrap();
        let fixture = jpeg_fixture();

        let report = client.describe(fixture.path().to_str().unwrap()).await;
        assert_eq!(report.environment, "public_space");
        assert_eq!(report.tags, vec!["park", "daytime"]);
        assert!((report.confidence - 0.88).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_describe_falls_back_to_mock() {
        let client =
            WitnessClient::new(test_config("http://127.0.0.1:1/v1/chat/completions".into()))
                .unwrap();
        let fixture = jpeg_fixture();

        let report = client.describe(fixture.path().to_str().unwrap()).await;
        assert!(report.confidence <= 0.75);
        assert_eq!(report.environment, "unknown");
    }

    #[tokio::test]
    async fn test_classification_cached_per_image() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(completion(r#"{"detection_type": "signature"}"#)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = WitnessClient::new(test_config(format!(
            "{}/v1/chat/completions",
            server.uri()
        )))
        .unwrap();
        let fixture = jpeg_fixture();
        let path = fixture.path().to_str().unwrap();

        assert_eq!(client.classify(path).await, DetectionType::Signature);
        // Second call must be served from the cache (mock expects one call).
        assert_eq!(client.classify(path).await, DetectionType::Signature);
    }

    #[tokio::test]
    async fn test_verdict_is_backend_independent() {
        let client =
            WitnessClient::new(test_config("http://127.0.0.1:1/nowhere".into())).unwrap();
        let verdict = client.verdict(DetectionType::LicensePlate, &[]);
        assert!(verdict.is_violation);
        assert!(verdict.confidence >= 0.90);
    }
}
