use std::time::Duration;

use serde_json::{Value, json};

use super::{ChatModel, ChatRequest};
use crate::support::ProviderError;

const RESPONSES_URL: &str = "https://api.openai.com/v1/responses";
const DEFAULT_MODEL: &str = "gpt-5-nano";

/// [`ChatModel`] backed by the OpenAI Responses API over blocking HTTP.
#[derive(Debug, Clone)]
pub struct OpenAiChat {
    api_key_env: String,
    default_model: String,
    endpoint: String,
    timeout: Duration,
}

impl Default for OpenAiChat {
    fn default() -> Self {
        Self {
            api_key_env: "OPENAI_API_KEY".to_string(),
            default_model: DEFAULT_MODEL.to_string(),
            endpoint: RESPONSES_URL.to_string(),
            timeout: Duration::from_secs(120),
        }
    }
}

impl OpenAiChat {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    pub fn with_api_key_env(mut self, name: impl Into<String>) -> Self {
        self.api_key_env = name.into();
        self
    }

    pub fn with_endpoint(mut self, url: impl Into<String>) -> Self {
        self.endpoint = url.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn body(&self, request: &ChatRequest) -> Value {
        let mut body = json!({
            "model": request.model.as_deref().unwrap_or(&self.default_model),
            "input": request.messages,
            "store": false,
        });
        if request.structured_output {
            body["text"] = json!({ "format": { "type": "json_object" } });
        }
        for key in ["temperature", "max_output_tokens", "top_p"] {
            if let Some(value) = request.settings.get(key) {
                body[key] = value.clone();
            }
        }
        body
    }
}

impl ChatModel for OpenAiChat {
    fn complete(&self, request: &ChatRequest) -> Result<String, ProviderError> {
        let api_key = std::env::var(&self.api_key_env).unwrap_or_default();
        if api_key.trim().is_empty() {
            return Err(ProviderError(format!(
                "missing API key env var: {}",
                self.api_key_env
            )));
        }
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| ProviderError(e.to_string()))?;
        let response = client
            .post(&self.endpoint)
            .bearer_auth(api_key)
            .json(&self.body(request))
            .send()
            .map_err(|e| ProviderError(e.to_string()))?;
        let status = response.status();
        let text = response.text().map_err(|e| ProviderError(e.to_string()))?;
        if !status.is_success() {
            return Err(ProviderError(format!(
                "openai request failed status={status} body={text}"
            )));
        }
        let value: Value = serde_json::from_str(&text).map_err(|e| ProviderError(e.to_string()))?;
        output_text(&value)
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| ProviderError("openai response did not include output text".into()))
    }
}

/// Concatenated text parts of the message items, or the `output_text` shortcut.
fn output_text(value: &Value) -> Option<String> {
    let parts: Vec<&str> = value
        .get("output")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter(|item| item.get("type").and_then(Value::as_str) == Some("message"))
        .filter_map(|item| item.get("content").and_then(Value::as_array))
        .flatten()
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect();
    if !parts.is_empty() {
        return Some(parts.concat());
    }
    value
        .get("output_text")
        .and_then(Value::as_str)
        .map(String::from)
}
