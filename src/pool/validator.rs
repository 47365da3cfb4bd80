use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};

use super::config::ValidatorConfig;
use super::credential::mask_key;

const MAX_ERROR_BODY_BYTES: usize = 64 * 1024;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub healthy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ValidationOutcome {
    pub fn healthy() -> Self {
        Self {
            healthy: true,
            error: None,
        }
    }

    pub fn unhealthy(reason: impl Into<String>) -> Self {
        Self {
            healthy: false,
            error: Some(reason.into()),
        }
    }

    pub fn reason(&self) -> &str {
        self.error.as_deref().unwrap_or("validation failed")
    }
}

/// Checks a credential against the upstream provider.
///
/// Upstream rejections and transport failures are both reported as an
/// unhealthy outcome; implementations never surface them as errors.
#[async_trait]
pub trait Validator: Send + Sync {
    async fn validate(&self, key: &str) -> ValidationOutcome;
}

/// Validates Gemini API keys with a tiny `generateContent` call.
#[derive(Clone, Debug)]
pub struct GeminiValidator {
    client: reqwest::Client,
    endpoint: String,
}

impl GeminiValidator {
    pub fn new(config: &ValidatorConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds.max(1)))
            .build()?;
        let endpoint = format!(
            "{}/models/{}:generateContent",
            config.base_url.trim_end_matches('/'),
            config.model.trim()
        );
        Ok(Self { client, endpoint })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Validator for GeminiValidator {
    async fn validate(&self, key: &str) -> ValidationOutcome {
        let masked = mask_key(key);
        let request = serde_json::json!({
            "contents": [{ "parts": [{ "text": "Test" }] }],
            "generationConfig": { "temperature": 0.1, "maxOutputTokens": 10 },
        });

        let response = match self
            .client
            .post(&self.endpoint)
            .header("x-goog-api-key", key)
            .json(&request)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                let reason = format!("network error: {err}");
                tracing::warn!(credential = %masked, %reason, "credential validation failed");
                return ValidationOutcome::unhealthy(reason);
            }
        };

        let status = response.status();
        if status.is_success() {
            tracing::debug!(credential = %masked, "credential validated");
            return ValidationOutcome::healthy();
        }

        let body = response_bytes_truncated(response, MAX_ERROR_BODY_BYTES).await;
        let reason = upstream_error_message(&body).unwrap_or_else(|| {
            format!(
                "HTTP {}: {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("Unknown")
            )
        });
        tracing::warn!(
            credential = %masked,
            status = status.as_u16(),
            %reason,
            "credential rejected upstream"
        );
        ValidationOutcome::unhealthy(reason)
    }
}

fn upstream_error_message(body: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    value
        .get("error")?
        .get("message")?
        .as_str()
        .map(str::trim)
        .filter(|message| !message.is_empty())
        .map(str::to_string)
}

async fn response_bytes_truncated(response: reqwest::Response, max_bytes: usize) -> Vec<u8> {
    let mut out = Vec::<u8>::new();
    let mut stream = response.bytes_stream();
    while let Some(next) = stream.next().await {
        let Ok(chunk) = next else {
            break;
        };
        let remaining = max_bytes.saturating_sub(out.len());
        if chunk.len() >= remaining {
            out.extend_from_slice(&chunk.as_ref()[..remaining]);
            break;
        }
        out.extend_from_slice(chunk.as_ref());
    }
    out
}
