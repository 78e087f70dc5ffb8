use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::{header, HeaderMap, HeaderName, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::completion::{CompletionError, CompletionRequest, ModelProfile, Turn};
use crate::error::StoreError;
use crate::store::{resolve_config, ConfigSource, ConfigStore, ResolvedConfig};
use crate::types::{AppState, ChatRequestBody};

pub const API_KEY_HEADER: &str = "x-api-key";

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("{0}")]
    BadRequest(String),
    #[error("Intelligence Node '{0}' not found.")]
    NotFound(String),
    #[error("Invalid API Key")]
    InvalidApiKey,
    #[error("Unauthorized Access.")]
    OriginDenied,
    #[error(transparent)]
    Completion(#[from] CompletionError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::NotFound(_) => StatusCode::NOT_FOUND,
            ProxyError::InvalidApiKey => StatusCode::UNAUTHORIZED,
            ProxyError::OriginDenied => StatusCode::FORBIDDEN,
            ProxyError::Completion(CompletionError::Status { status: 429, .. }) => {
                StatusCode::TOO_MANY_REQUESTS
            }
            ProxyError::Completion(CompletionError::Status { status: 503, .. }) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ProxyError::Completion(_) | ProxyError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Text returned to the caller. Upstream bodies only go to the log.
    pub fn public_message(&self) -> String {
        match self {
            ProxyError::Completion(CompletionError::Status { status: 429, .. }) => {
                "Rate limit exceeded. Please wait a moment.".to_string()
            }
            ProxyError::Completion(CompletionError::Status { status: 503, .. }) => {
                "The AI engine is down for maintenance. Please try again shortly.".to_string()
            }
            ProxyError::Completion(
                CompletionError::Status { .. } | CompletionError::Transport(_),
            ) => "The AI engine could not synthesize a response.".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        (
            self.status(),
            cors_headers(),
            Json(json!({ "error": self.public_message() })),
        )
            .into_response()
    }
}

fn cors_headers() -> [(HeaderName, &'static str); 3] {
    [
        (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
        (header::ACCESS_CONTROL_ALLOW_METHODS, "POST, OPTIONS"),
        (
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            "Content-Type, x-api-key, Accept",
        ),
    ]
}

pub async fn chat_preflight() -> Response {
    (StatusCode::NO_CONTENT, cors_headers()).into_response()
}

pub async fn chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Result<Json<ChatRequestBody>, JsonRejection>,
) -> Response {
    let body = match body {
        Ok(Json(body)) => body,
        Err(rejection) => {
            return ProxyError::BadRequest(rejection.body_text()).into_response();
        }
    };
    let client_id = body.client_id.clone().unwrap_or_default();

    match relay_chat(&state, &headers, body).await {
        Ok(text) => (StatusCode::OK, cors_headers(), Json(json!({ "text": text }))).into_response(),
        Err(err) => {
            let status = err.status();
            if status.is_server_error() {
                tracing::error!(client_id = %client_id, %status, error = %err, "chat relay failed");
            } else {
                tracing::info!(client_id = %client_id, %status, error = %err, "chat request rejected");
            }
            err.into_response()
        }
    }
}

async fn relay_chat(
    state: &AppState,
    headers: &HeaderMap,
    body: ChatRequestBody,
) -> Result<String, ProxyError> {
    let client_id = body
        .client_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ProxyError::BadRequest("clientId is required".to_string()))?;

    let resolved = resolve_config(state.store.as_ref(), client_id)
        .await?
        .ok_or_else(|| ProxyError::NotFound(client_id.to_string()))?;

    authorize(state.store.as_ref(), &resolved, headers).await?;

    if body.messages.is_empty() {
        return Err(ProxyError::BadRequest("messages are required".to_string()));
    }

    let config = resolved.config;
    let request = CompletionRequest {
        profile: ModelProfile::for_config(&config),
        system_instruction: &config.system_instruction,
        turns: body.messages.iter().map(Turn::from_wire).collect(),
    };
    tracing::debug!(
        client_id,
        model = request.profile.model,
        turns = request.turns.len(),
        "forwarding chat turn"
    );

    Ok(state.completion.generate(&request).await?)
}

/// Demo configurations are open. Otherwise an API key must belong to the
/// client, and keyless requests are checked against the origin allow-list.
async fn authorize(
    store: &dyn ConfigStore,
    resolved: &ResolvedConfig,
    headers: &HeaderMap,
) -> Result<(), ProxyError> {
    if resolved.source == ConfigSource::Demo {
        return Ok(());
    }
    let client_id = resolved.config.id.as_str();

    let api_key = headers
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|key| !key.is_empty());

    if let Some(key) = api_key {
        return match store.find_api_key(client_id, key).await? {
            Some(_) => Ok(()),
            None => Err(ProxyError::InvalidApiKey),
        };
    }

    let origin = headers
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok());
    tracing::debug!(client_id, origin = origin.unwrap_or(""), "keyless widget request");
    if resolved.config.allows_origin(origin) {
        Ok(())
    } else {
        Err(ProxyError::OriginDenied)
    }
}
