//! LLM client abstraction for the clinical-sign fallback.
//!
//! Text-in/text-out contract only: the engine sends a constrained prompt and
//! expects one short answer. Supports Ollama-style and OpenAI-compatible
//! backends, plus a fake client for tests. Every call is bounded by the
//! configured timeout; the caller treats any failure as "no sign detected".

use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;

/// LLM backend configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Output budget; the answer is one token, long completions are waste.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_endpoint() -> String {
    "http://localhost:11434".to_string()
}

fn default_model() -> String {
    "llama3.2:3b".to_string()
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_max_tokens() -> u32 {
    16
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_endpoint(),
            model: default_model(),
            api_key: None,
            timeout_secs: default_timeout_secs(),
            max_tokens: default_max_tokens(),
        }
    }
}

/// LLM errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LlmError {
    #[error("LLM is disabled in configuration")]
    Disabled,

    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Request timeout after {0} seconds")]
    Timeout(u64),

    #[error("LLM returned empty response")]
    EmptyResponse,
}

/// Generic completion client.
pub trait LlmClient: Send + Sync {
    /// Send a prompt pair, get the raw completion text back.
    fn complete(&self, system_prompt: &str, user_prompt: &str) -> Result<String, LlmError>;
}

/// Real client over HTTP.
pub struct HttpLlmClient {
    config: LlmConfig,
    client: reqwest::blocking::Client,
}

impl HttpLlmClient {
    pub fn new(config: LlmConfig) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))?;

        Ok(Self { config, client })
    }

    /// Check if endpoint is Ollama-style
    fn is_ollama_endpoint(&self) -> bool {
        self.config.endpoint.contains("11434") || self.config.endpoint.contains("ollama")
    }

    fn call_ollama(&self, prompt: &str) -> Result<String, LlmError> {
        let url = format!("{}/api/generate", self.config.endpoint);

        let request_body = serde_json::json!({
            "model": self.config.model,
            "prompt": prompt,
            "stream": false,
            "options": { "num_predict": self.config.max_tokens },
        });

        let response = self.client.post(&url).json(&request_body).send().map_err(|e| {
            if e.is_timeout() {
                LlmError::Timeout(self.config.timeout_secs)
            } else {
                LlmError::HttpError(format!("Request failed: {}", e))
            }
        })?;

        if !response.status().is_success() {
            return Err(LlmError::HttpError(format!("HTTP {} from Ollama", response.status())));
        }

        let response_json: serde_json::Value = response
            .json()
            .map_err(|e| LlmError::InvalidResponse(format!("Failed to parse response: {}", e)))?;

        let text = response_json
            .get("response")
            .and_then(|v| v.as_str())
            .ok_or(LlmError::EmptyResponse)?;

        if text.trim().is_empty() {
            return Err(LlmError::EmptyResponse);
        }
        Ok(text.to_string())
    }

    fn call_openai_compatible(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<String, LlmError> {
        let url = format!("{}/v1/chat/completions", self.config.endpoint);

        let request_body = serde_json::json!({
            "model": self.config.model,
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": user_prompt},
            ],
            "max_tokens": self.config.max_tokens,
        });

        let mut request = self.client.post(&url).json(&request_body);

        if let Some(api_key) = &self.config.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().map_err(|e| {
            if e.is_timeout() {
                LlmError::Timeout(self.config.timeout_secs)
            } else {
                LlmError::HttpError(format!("Request failed: {}", e))
            }
        })?;

        if !response.status().is_success() {
            return Err(LlmError::HttpError(format!(
                "HTTP {} from OpenAI-compatible API",
                response.status()
            )));
        }

        let response_json: serde_json::Value = response
            .json()
            .map_err(|e| LlmError::InvalidResponse(format!("Failed to parse response: {}", e)))?;

        let text = response_json
            .get("choices")
            .and_then(|v| v.get(0))
            .and_then(|v| v.get("message"))
            .and_then(|v| v.get("content"))
            .and_then(|v| v.as_str())
            .ok_or(LlmError::EmptyResponse)?;

        if text.trim().is_empty() {
            return Err(LlmError::EmptyResponse);
        }
        Ok(text.to_string())
    }
}

impl LlmClient for HttpLlmClient {
    fn complete(&self, system_prompt: &str, user_prompt: &str) -> Result<String, LlmError> {
        if !self.config.enabled {
            return Err(LlmError::Disabled);
        }

        // Try Ollama-style API first when the endpoint looks like one
        if self.is_ollama_endpoint() {
            let full_prompt = format!("{}\n\n{}", system_prompt, user_prompt);
            match self.call_ollama(&full_prompt) {
                Ok(text) => return Ok(text),
                Err(e) => {
                    tracing::debug!("Ollama API failed, trying OpenAI-compatible: {}", e);
                }
            }
        }

        self.call_openai_compatible(system_prompt, user_prompt)
    }
}

/// Fake LLM client for testing.
pub struct FakeLlmClient {
    responses: Mutex<Vec<Result<String, LlmError>>>,
    call_count: Mutex<usize>,
}

impl FakeLlmClient {
    /// Create a fake client with pre-defined responses.
    pub fn new(responses: Vec<Result<String, LlmError>>) -> Self {
        Self {
            responses: Mutex::new(responses),
            call_count: Mutex::new(0),
        }
    }

    /// A client that always answers the same text.
    pub fn always(text: impl Into<String>) -> Self {
        Self::new(vec![Ok(text.into())])
    }

    /// A client that always fails.
    pub fn always_error(error: LlmError) -> Self {
        Self::new(vec![Err(error)])
    }

    pub fn call_count(&self) -> usize {
        *self.call_count.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl LlmClient for FakeLlmClient {
    fn complete(&self, _system_prompt: &str, _user_prompt: &str) -> Result<String, LlmError> {
        let mut count = self.call_count.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *count += 1;

        let mut responses = self
            .responses
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if responses.is_empty() {
            return Err(LlmError::EmptyResponse);
        }

        if responses.len() == 1 {
            // Keep returning the same response
            responses[0].clone()
        } else {
            responses.remove(0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_llm_config_default() {
        let config = LlmConfig::default();
        assert!(!config.enabled);
        assert_eq!(config.endpoint, "http://localhost:11434");
        assert!(config.api_key.is_none());
        assert_eq!(config.timeout_secs, 10);
        assert_eq!(config.max_tokens, 16);
    }

    #[test]
    fn test_disabled_client_errors_without_network() {
        let client = HttpLlmClient::new(LlmConfig::default()).unwrap();
        let result = client.complete("system", "user");
        assert!(matches!(result, Err(LlmError::Disabled)));
    }

    #[test]
    fn test_fake_client_always() {
        let client = FakeLlmClient::always("boiterie");

        assert_eq!(client.complete("s", "u").unwrap(), "boiterie");
        assert_eq!(client.complete("s", "u").unwrap(), "boiterie");
        assert_eq!(client.call_count(), 2);
    }

    #[test]
    fn test_fake_client_always_error() {
        let client = FakeLlmClient::always_error(LlmError::Timeout(10));

        assert!(client.complete("s", "u").is_err());
        assert_eq!(client.call_count(), 1);
    }

    #[test]
    fn test_fake_client_scripted_responses() {
        let client = FakeLlmClient::new(vec![
            Ok("apathie".to_string()),
            Err(LlmError::Timeout(10)),
        ]);

        assert_eq!(client.complete("s", "u").unwrap(), "apathie");
        assert!(client.complete("s", "u").is_err());
        assert_eq!(client.call_count(), 2);
    }
}
