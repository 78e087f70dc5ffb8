use std::time::Duration;

use serde_json::{json, Value};
use thiserror::Error;

use crate::types::{ClientConfig, WireMessage};

pub const PRO_MODEL: &str = "gemini-3-pro-preview";
pub const FLASH_MODEL: &str = "gemini-3-flash-preview";
pub const DEFAULT_THINKING_BUDGET: i32 = 4000;
pub const MAX_THINKING_BUDGET: i32 = 32768;
pub const THINKING_MAX_OUTPUT_TOKENS: u32 = 16384;
pub const TEMPERATURE: f64 = 0.7;

#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("API Key configuration missing on server")]
    MissingApiKey,
    #[error("completion request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("completion service returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Model failed to generate a text response.")]
    EmptyResponse,
}

/// Model and reasoning parameters chosen from a client's thinking flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelProfile {
    pub model: &'static str,
    pub thinking_budget: Option<i32>,
    pub max_output_tokens: Option<u32>,
}

impl ModelProfile {
    pub fn for_config(config: &ClientConfig) -> Self {
        if !config.thinking_enabled {
            return Self {
                model: FLASH_MODEL,
                thinking_budget: None,
                max_output_tokens: None,
            };
        }
        let requested = if config.thinking_budget > 0 {
            config.thinking_budget
        } else {
            DEFAULT_THINKING_BUDGET
        };
        Self {
            model: PRO_MODEL,
            thinking_budget: Some(requested.min(MAX_THINKING_BUDGET)),
            max_output_tokens: Some(THINKING_MAX_OUTPUT_TOKENS),
        }
    }
}

/// Author of a turn as the completion service sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speaker {
    User,
    Assistant,
}

impl Speaker {
    pub fn normalize(role: &str) -> Self {
        let role = role.trim();
        if role.eq_ignore_ascii_case("assistant") || role.eq_ignore_ascii_case("model") {
            Speaker::Assistant
        } else {
            Speaker::User
        }
    }

    pub fn wire_role(self) -> &'static str {
        match self {
            Speaker::User => "user",
            Speaker::Assistant => "model",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub speaker: Speaker,
    pub text: String,
}

impl Turn {
    pub fn from_wire(message: &WireMessage) -> Self {
        Self {
            speaker: Speaker::normalize(&message.role),
            text: message.text().to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompletionRequest<'a> {
    pub profile: ModelProfile,
    pub system_instruction: &'a str,
    pub turns: Vec<Turn>,
}

impl CompletionRequest<'_> {
    pub fn body(&self) -> Value {
        let contents = self
            .turns
            .iter()
            .map(|turn| {
                json!({
                    "role": turn.speaker.wire_role(),
                    "parts": [{ "text": turn.text }]
                })
            })
            .collect::<Vec<_>>();

        let mut generation_config = json!({ "temperature": TEMPERATURE });
        if let Some(max_tokens) = self.profile.max_output_tokens {
            generation_config["maxOutputTokens"] = json!(max_tokens);
        }
        if let Some(budget) = self.profile.thinking_budget {
            generation_config["thinkingConfig"] = json!({ "thinkingBudget": budget });
        }

        json!({
            "contents": contents,
            "systemInstruction": { "parts": [{ "text": self.system_instruction }] },
            "generationConfig": generation_config
        })
    }
}

/// Text of the first candidate, skipping reasoning parts.
pub fn response_text(payload: &Value) -> String {
    payload
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|candidates| candidates.first())
        .and_then(|candidate| candidate.pointer("/content/parts"))
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter(|part| !part.get("thought").and_then(Value::as_bool).unwrap_or(false))
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect::<String>()
        })
        .unwrap_or_default()
}

/// Client for the hosted `generateContent` endpoint.
pub struct GeminiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl GeminiClient {
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    pub async fn generate(&self, request: &CompletionRequest<'_>) -> Result<String, CompletionError> {
        let api_key = self
            .api_key
            .as_deref()
            .filter(|key| !key.trim().is_empty())
            .ok_or(CompletionError::MissingApiKey)?;

        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url, request.profile.model
        );
        let response = self
            .http
            .post(url)
            .header("x-goog-api-key", api_key)
            .json(&request.body())
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(CompletionError::Status { status, body });
        }

        let payload = response.json::<Value>().await?;
        let text = response_text(&payload);
        if text.trim().is_empty() {
            return Err(CompletionError::EmptyResponse);
        }
        Ok(text)
    }
}
