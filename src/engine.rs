use std::time::Duration;

use async_trait::async_trait;
use axum::http::header;
use serde_json::{json, Value};
use thiserror::Error;

use crate::proxy::API_KEY_HEADER;
use crate::types::{ChatMessage, ClientConfig};

pub const CHAT_ENDPOINT: &str = "/api/chat";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineErrorKind {
    Unauthorized,
    Forbidden,
    NotFound,
    RateLimited,
    Upstream,
    Maintenance,
    Status(u16),
    ConnectionLost,
    IncompleteResponse,
}

/// A failed chat turn: a category plus a message safe to show in the transcript.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct EngineError {
    pub kind: EngineErrorKind,
    pub message: String,
}

impl EngineError {
    pub fn from_status(status: u16, client_id: &str, server_message: Option<String>) -> Self {
        let (kind, default_message) = match status {
            401 => (
                EngineErrorKind::Unauthorized,
                "Security verification failed. Invalid API credentials.".to_string(),
            ),
            403 => (
                EngineErrorKind::Forbidden,
                "Access denied. This assistant is not authorized for this site or its subscription has lapsed.".to_string(),
            ),
            404 => (
                EngineErrorKind::NotFound,
                format!("Intelligence Node '{client_id}' not found."),
            ),
            429 => (
                EngineErrorKind::RateLimited,
                "Rate limit exceeded. Please wait a moment.".to_string(),
            ),
            500 => (
                EngineErrorKind::Upstream,
                "Internal Engine Error (500). The AI engine could not synthesize a response."
                    .to_string(),
            ),
            503 => (
                EngineErrorKind::Maintenance,
                "The AI engine is down for maintenance. Please try again shortly.".to_string(),
            ),
            other => (
                EngineErrorKind::Status(other),
                format!("Engine Link Failure ({other})"),
            ),
        };
        Self {
            kind,
            message: server_message
                .filter(|message| !message.trim().is_empty())
                .unwrap_or(default_message),
        }
    }

    pub fn connection_lost() -> Self {
        Self {
            kind: EngineErrorKind::ConnectionLost,
            message: "Network error. Unable to reach the AI backbone.".to_string(),
        }
    }

    pub fn incomplete() -> Self {
        Self {
            kind: EngineErrorKind::IncompleteResponse,
            message: "The AI engine returned an incomplete response.".to_string(),
        }
    }
}

/// Sends one conversation turn and returns the generated reply.
#[async_trait]
pub trait ChatEngine: Send + Sync {
    async fn send(
        &self,
        prompt: &str,
        history: &[ChatMessage],
        config: &ClientConfig,
    ) -> Result<String, EngineError>;
}

/// HTTP client of the chat proxy. Performs no retries.
#[derive(Clone)]
pub struct EngineClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    origin: Option<String>,
}

impl EngineClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            endpoint: format!("{}{CHAT_ENDPOINT}", base_url.trim_end_matches('/')),
            api_key: None,
            origin: None,
        })
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Origin presented on behalf of the page hosting the widget.
    pub fn with_origin(mut self, origin: Option<String>) -> Self {
        self.origin = origin;
        self
    }

    pub fn request_body(prompt: &str, history: &[ChatMessage], config: &ClientConfig) -> Value {
        let mut messages = history
            .iter()
            .map(|message| json!({ "role": message.role.as_str(), "content": message.content }))
            .collect::<Vec<_>>();
        messages.push(json!({ "role": "user", "content": prompt }));
        json!({ "clientId": config.id, "messages": messages })
    }
}

#[async_trait]
impl ChatEngine for EngineClient {
    async fn send(
        &self,
        prompt: &str,
        history: &[ChatMessage],
        config: &ClientConfig,
    ) -> Result<String, EngineError> {
        let mut request = self
            .http
            .post(&self.endpoint)
            .header(header::ACCEPT, "application/json")
            .json(&Self::request_body(prompt, history, config));
        if let Some(key) = &self.api_key {
            request = request.header(API_KEY_HEADER, key);
        }
        if let Some(origin) = &self.origin {
            request = request.header(header::ORIGIN, origin);
        }

        let response = request.send().await.map_err(|err| {
            tracing::warn!(client_id = %config.id, error = %err, "chat engine unreachable");
            EngineError::connection_lost()
        })?;

        let status = response.status();
        let payload = match response.json::<Value>().await {
            Ok(body) => Some(body),
            Err(err) if err.is_timeout() => {
                tracing::warn!(client_id = %config.id, error = %err, "chat engine reply timed out");
                return Err(EngineError::connection_lost());
            }
            Err(_) => None,
        };

        if !status.is_success() {
            let server_message = payload
                .as_ref()
                .and_then(|body| body.get("error"))
                .and_then(Value::as_str)
                .map(str::to_string);
            return Err(EngineError::from_status(
                status.as_u16(),
                &config.id,
                server_message,
            ));
        }

        payload
            .as_ref()
            .and_then(|body| body.get("text"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(EngineError::incomplete)
    }
}
