//! Client for the text-generation backend.
//!
//! The client sends a (system instructions, payload) pair and returns raw
//! text. Failures are classified into a closed set the orchestrator matches
//! on; the client itself never retries — retry policy is an orchestrator
//! decision, not something hidden in the transport layer.

use crate::errors::ModelError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Sends a prompt to a text-generation backend and returns its raw output.
///
/// Stage executors hold a shared client; tests substitute a scripted double.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn invoke(
        &self,
        system: &str,
        payload: &str,
        temperature: f32,
    ) -> Result<String, ModelError>;
}

/// Connection settings for the HTTP backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    /// Base URL of the generation service, e.g. `http://localhost:8811`.
    pub base_url: String,
    /// Model identifier passed through to the backend.
    pub model: String,
    /// Bearer token. Loaded from the environment, never from the config file.
    #[serde(skip)]
    pub api_key: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    120
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8811".to_string(),
            model: "default".to_string(),
            api_key: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    system: &'a str,
    input: &'a str,
    temperature: f32,
}

#[derive(Deserialize)]
struct GenerateResponse {
    output: String,
}

/// HTTP client for the backend's `/v1/generate` contract.
pub struct HttpModelClient {
    http: reqwest::Client,
    settings: ModelSettings,
}

impl HttpModelClient {
    pub fn new(settings: ModelSettings) -> Result<Self, ModelError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|e| ModelError::Other(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { http, settings })
    }

    /// Classify a non-success HTTP status into a typed failure.
    ///
    /// 429 means rate limited unless the body names a quota problem; some
    /// backends signal exhausted quota through 429 with a descriptive body.
    fn classify_status(status: reqwest::StatusCode, body: &str) -> ModelError {
        let lower = body.to_lowercase();
        match status.as_u16() {
            429 if lower.contains("quota") || lower.contains("billing") => {
                ModelError::QuotaExhausted
            }
            429 => ModelError::RateLimited,
            402 => ModelError::QuotaExhausted,
            code => ModelError::Other(format!("backend returned HTTP {}: {}", code, body)),
        }
    }
}

#[async_trait]
impl ModelClient for HttpModelClient {
    async fn invoke(
        &self,
        system: &str,
        payload: &str,
        temperature: f32,
    ) -> Result<String, ModelError> {
        let url = format!("{}/v1/generate", self.settings.base_url.trim_end_matches('/'));
        let request = GenerateRequest {
            model: &self.settings.model,
            system,
            input: payload,
            temperature,
        };

        debug!(model = %self.settings.model, payload_chars = payload.len(), "invoking backend");

        let mut builder = self.http.post(&url).json(&request);
        if let Some(ref key) = self.settings.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ModelError::Other(format!("request to {} failed: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::classify_status(status, &body));
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| ModelError::Other(format!("backend response was not JSON: {}", e)))?;

        Ok(parsed.output)
    }
}
