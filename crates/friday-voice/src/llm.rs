//! LLM collaborator.

use crate::config::VoiceConfig;
use crate::error::VoiceError;
use std::sync::Arc;
use std::time::Duration;

/// Timeout for one completion round-trip.
const LLM_TIMEOUT: Duration = Duration::from_secs(30);

/// Header carrying the opaque gateway token.
const GATEWAY_TOKEN_HEADER: &str = "x-gateway-token";

/// Header carrying the opaque session key.
const SESSION_KEY_HEADER: &str = "x-session-key";

/// Client for the reply-generation endpoint.
///
/// Request: `POST {model, input}` with a bearer token and the opaque
/// gateway/session headers. Response text is read from
/// `output[0].content[0].text`.
#[derive(Debug, Clone)]
pub struct LlmClient {
    config: Arc<VoiceConfig>,
    http: reqwest::Client,
}

impl LlmClient {
    pub fn new(config: Arc<VoiceConfig>) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    /// Obtains a reply for `input`. Callers substitute their own fallback
    /// text on failure; this method never does.
    pub async fn complete(&self, input: &str) -> Result<String, VoiceError> {
        if self.config.llm_url.is_empty() {
            return Err(VoiceError::Config("llm_url is not configured".to_string()));
        }
        if !self.config.remote_configured() {
            return Err(VoiceError::Config(
                "llm_api_key is not configured".to_string(),
            ));
        }

        let mut request = self
            .http
            .post(&self.config.llm_url)
            .bearer_auth(&self.config.llm_api_key)
            .json(&serde_json::json!({
                "model": self.config.llm_model,
                "input": input,
            }))
            .timeout(LLM_TIMEOUT);
        if !self.config.gateway_token.is_empty() {
            request = request.header(GATEWAY_TOKEN_HEADER, &self.config.gateway_token);
        }
        if !self.config.session_key.is_empty() {
            request = request.header(SESSION_KEY_HEADER, &self.config.session_key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| VoiceError::Llm(format!("request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(VoiceError::Llm(format!(
                "endpoint returned {}",
                response.status()
            )));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| VoiceError::Llm(format!("invalid JSON response: {e}")))?;

        let text = body
            .pointer("/output/0/content/0/text")
            .and_then(|t| t.as_str())
            .ok_or_else(|| VoiceError::Llm("response carried no output text".to_string()))?;

        let text = text.trim();
        if text.is_empty() {
            return Err(VoiceError::Llm("response text was empty".to_string()));
        }
        Ok(text.to_string())
    }
}
