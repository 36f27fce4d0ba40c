//! HTTP client for a remote classification service.
//!
//! The service exposes JSON endpoints behind a bearer token:
//! `POST /v1/classify`, `POST /v1/anomalies`, `POST /v1/recommendations`
//! and `GET /health`.

use super::{
    AnomalyReport, Classification, ClassifierError, FlowClassifier, UsageContext,
    FALLBACK_CATEGORY, FALLBACK_CONFIDENCE, FALLBACK_REASONING,
};
use crate::config::EndpointConfig;
use crate::core::tips::Recommendation;
use crate::readings::FlowSample;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

impl EndpointConfig {
    /// Base URL of the service.
    pub fn url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn classify_url(&self) -> String {
        format!("{}/v1/classify", self.url())
    }

    pub fn anomalies_url(&self) -> String {
        format!("{}/v1/anomalies", self.url())
    }

    pub fn recommendations_url(&self) -> String {
        format!("{}/v1/recommendations", self.url())
    }

    pub fn health_url(&self) -> String {
        format!("{}/health", self.url())
    }
}

/// One point of the profile sent to the service.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProfilePoint {
    time: DateTime<Utc>,
    /// L/min
    flow_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProfileRequest<'a> {
    client_id: &'a str,
    flow_profile: Vec<ProfilePoint>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct UsageRequest<'a> {
    client_id: &'a str,
    #[serde(flatten)]
    usage: &'a UsageContext,
}

#[derive(Debug, Clone, Deserialize)]
struct ClassifyResponse {
    category: Option<String>,
    /// Either 0-1 or 0-100
    confidence: Option<f64>,
    reasoning: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct RecommendationsResponse {
    #[serde(default)]
    recommendations: Vec<Recommendation>,
}

/// Convert a service confidence to the 0-100 scale.
pub fn normalize_confidence(confidence: f64) -> u8 {
    if !confidence.is_finite() || confidence <= 0.0 {
        return 0;
    }
    let percent = if confidence <= 1.0 {
        confidence * 100.0
    } else {
        confidence
    };
    percent.round().min(100.0) as u8
}

impl From<ClassifyResponse> for Classification {
    fn from(response: ClassifyResponse) -> Self {
        Classification::new(
            response
                .category
                .filter(|c| !c.trim().is_empty())
                .unwrap_or_else(|| FALLBACK_CATEGORY.to_string()),
            response
                .confidence
                .map(normalize_confidence)
                .unwrap_or(FALLBACK_CONFIDENCE),
            response
                .reasoning
                .unwrap_or_else(|| FALLBACK_REASONING.to_string()),
        )
    }
}

/// Classifier backed by a remote HTTP service.
pub struct RemoteClassifier {
    config: EndpointConfig,
    client: reqwest::Client,
    client_id: String,
}

impl RemoteClassifier {
    /// Create a new client. `timeout` bounds each HTTP request.
    pub fn new(config: EndpointConfig, timeout: Duration) -> Result<Self, ClassifierError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ClassifierError::Config(format!("Failed to create HTTP client: {e}")))?;

        // Client ID from hostname + instance
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let client_id = format!(
            "water-{}-{}",
            hostname,
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );

        Ok(Self {
            config,
            client,
            client_id,
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Test connection to the service.
    pub async fn test_connection(&self) -> Result<bool, ClassifierError> {
        let response = self
            .client
            .get(self.config.health_url())
            .send()
            .await
            .map_err(network_error)?;

        Ok(response.status().is_success())
    }

    fn profile_request(&self, flow: &[FlowSample]) -> ProfileRequest<'_> {
        ProfileRequest {
            client_id: &self.client_id,
            flow_profile: flow
                .iter()
                .map(|s| ProfilePoint {
                    time: s.time,
                    flow_rate: s.rate_l_per_min(),
                })
                .collect(),
        }
    }

    async fn post<B, R>(&self, url: String, body: &B) -> Result<R, ClassifierError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let response = self
            .client
            .post(url)
            .header("Authorization", format!("Bearer {}", self.config.token))
            .json(body)
            .send()
            .await
            .map_err(network_error)?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ClassifierError::Server {
                status: status.as_u16(),
                message,
            });
        }

        response
            .json()
            .await
            .map_err(|e| ClassifierError::Serialization(e.to_string()))
    }
}

fn network_error(e: reqwest::Error) -> ClassifierError {
    if e.is_timeout() {
        ClassifierError::Unavailable(format!("request timed out: {e}"))
    } else {
        ClassifierError::Network(e.to_string())
    }
}

#[async_trait]
impl FlowClassifier for RemoteClassifier {
    fn name(&self) -> &str {
        "remote"
    }

    async fn classify(&self, flow: &[FlowSample]) -> Result<Classification, ClassifierError> {
        let response: ClassifyResponse = self
            .post(self.config.classify_url(), &self.profile_request(flow))
            .await?;
        Ok(response.into())
    }

    async fn detect_anomalies(&self, flow: &[FlowSample]) -> Result<AnomalyReport, ClassifierError> {
        self.post(self.config.anomalies_url(), &self.profile_request(flow))
            .await
    }

    async fn recommend(&self, usage: &UsageContext) -> Result<Vec<Recommendation>, ClassifierError> {
        let request = UsageRequest {
            client_id: &self.client_id,
            usage,
        };
        let response: RecommendationsResponse = self
            .post(self.config.recommendations_url(), &request)
            .await?;
        Ok(response.recommendations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> EndpointConfig {
        EndpointConfig {
            host: "127.0.0.1".to_string(),
            port: 8080,
            token: "test-token".to_string(),
        }
    }

    #[test]
    fn test_endpoint_urls() {
        let config = endpoint();
        assert_eq!(config.url(), "http://127.0.0.1:8080");
        assert_eq!(config.classify_url(), "http://127.0.0.1:8080/v1/classify");
        assert_eq!(config.anomalies_url(), "http://127.0.0.1:8080/v1/anomalies");
        assert_eq!(config.health_url(), "http://127.0.0.1:8080/health");
    }

    #[test]
    fn test_confidence_scales() {
        assert_eq!(normalize_confidence(0.87), 87);
        assert_eq!(normalize_confidence(1.0), 100);
        assert_eq!(normalize_confidence(64.0), 64);
        assert_eq!(normalize_confidence(250.0), 100);
        assert_eq!(normalize_confidence(-1.0), 0);
    }

    #[test]
    fn test_partial_response_uses_fallback_fields() {
        let response: ClassifyResponse = serde_json::from_str(r#"{"category": "toilet"}"#).unwrap();
        let classification = Classification::from(response);
        assert_eq!(classification.category, "toilet");
        assert_eq!(classification.confidence, 50);
        assert_eq!(classification.reasoning, FALLBACK_REASONING);
    }

    #[tokio::test]
    async fn test_unreachable_service_is_network_error() {
        let config = EndpointConfig {
            port: 1,
            ..endpoint()
        };
        let remote = RemoteClassifier::new(config, Duration::from_secs(2)).unwrap();
        assert!(remote.client_id().starts_with("water-"));
        assert!(remote.classify(&[]).await.is_err());
    }
}
