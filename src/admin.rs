use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use regex::Regex;
use serde::Deserialize;
use serde_json::json;

use crate::completion::MAX_THINKING_BUDGET;
use crate::error::StoreError;
use crate::types::{AppState, ClientConfig, CreateApiKeyBody, ANY_ORIGIN};

#[derive(Debug, Deserialize)]
pub struct UpsertClientBody {
    #[serde(default)]
    pub user_id: String,
    pub name: String,
    pub primary_color: String,
    pub greeting: String,
    pub system_instruction: String,
    #[serde(default)]
    pub logo_url: Option<String>,
    #[serde(default)]
    pub thinking_enabled: bool,
    #[serde(default)]
    pub thinking_budget: i32,
    #[serde(default)]
    pub authorized_origins: Vec<String>,
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let header = headers.get("authorization")?.to_str().ok()?;
    let token = header.strip_prefix("Bearer ")?;
    Some(token.trim().to_string())
}

/// Fails closed when no admin token is configured.
fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    let expected = state
        .admin_token
        .as_deref()
        .filter(|token| !token.is_empty());
    match (expected, bearer_token(headers)) {
        (Some(expected), Some(token)) if token == expected => Ok(()),
        _ => Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "invalid admin token" })),
        )
            .into_response()),
    }
}

fn store_failure(err: StoreError) -> Response {
    let status = match err {
        StoreError::UnknownClient(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        tracing::error!(error = %err, "admin store operation failed");
    }
    (status, Json(json!({ "error": err.to_string() }))).into_response()
}

/// Malformed bodies answer with the same `{error}` shape as every other failure.
fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, Response> {
    body.map(|Json(body)| body).map_err(|rejection| {
        (
            rejection.status(),
            Json(json!({ "error": rejection.body_text() })),
        )
            .into_response()
    })
}

fn is_hex_color(value: &str) -> bool {
    Regex::new(r"^#[0-9A-Fa-f]{6}$")
        .map(|re| re.is_match(value))
        .unwrap_or(false)
}

fn normalize_origins(origins: Vec<String>) -> Vec<String> {
    let origins = origins
        .into_iter()
        .map(|origin| origin.trim().to_string())
        .filter(|origin| !origin.is_empty())
        .collect::<Vec<_>>();
    if origins.is_empty() {
        vec![ANY_ORIGIN.to_string()]
    } else {
        origins
    }
}

fn client_from_body(id: String, body: UpsertClientBody) -> Result<ClientConfig, &'static str> {
    let primary_color = body.primary_color.trim().to_string();
    if !is_hex_color(&primary_color) {
        return Err("primary_color must be a #RRGGBB hex color");
    }
    if body.name.trim().is_empty() {
        return Err("name is required");
    }
    Ok(ClientConfig {
        id,
        user_id: body.user_id,
        name: body.name.trim().to_string(),
        primary_color,
        greeting: body.greeting,
        system_instruction: body.system_instruction,
        logo_url: body
            .logo_url
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty()),
        thinking_enabled: body.thinking_enabled,
        thinking_budget: body.thinking_budget.clamp(0, MAX_THINKING_BUDGET),
        authorized_origins: normalize_origins(body.authorized_origins),
        created_at: String::new(),
    })
}

pub async fn get_client(
    Path(client_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    if let Err(err) = require_admin(&state, &headers) {
        return err;
    }
    match state.store.get_client(&client_id).await {
        Ok(Some(config)) => (StatusCode::OK, Json(json!({ "client": config }))).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "client not found" })),
        )
            .into_response(),
        Err(err) => store_failure(err),
    }
}

pub async fn put_client(
    Path(client_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Result<Json<UpsertClientBody>, JsonRejection>,
) -> Response {
    if let Err(err) = require_admin(&state, &headers) {
        return err;
    }
    let body = match json_body(body) {
        Ok(body) => body,
        Err(rejected) => return rejected,
    };
    let config = match client_from_body(client_id, body) {
        Ok(config) => config,
        Err(message) => {
            return (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response();
        }
    };
    match state.store.upsert_client(config).await {
        Ok(saved) => {
            tracing::info!(client_id = %saved.id, "client config saved");
            (StatusCode::OK, Json(json!({ "client": saved }))).into_response()
        }
        Err(err) => store_failure(err),
    }
}

pub async fn get_api_keys(
    Path(client_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    if let Err(err) = require_admin(&state, &headers) {
        return err;
    }
    match state.store.list_api_keys(&client_id).await {
        Ok(keys) => (StatusCode::OK, Json(json!({ "apiKeys": keys }))).into_response(),
        Err(err) => store_failure(err),
    }
}

pub async fn create_api_key(
    Path(client_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Result<Json<CreateApiKeyBody>, JsonRejection>,
) -> Response {
    if let Err(err) = require_admin(&state, &headers) {
        return err;
    }
    let body = match json_body(body) {
        Ok(body) => body,
        Err(rejected) => return rejected,
    };
    let name = body.name.trim();
    if name.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "name is required" })),
        )
            .into_response();
    }
    match state.store.create_api_key(&client_id, name).await {
        Ok(key) => {
            tracing::info!(client_id = %client_id, key_id = %key.id, "api key issued");
            (StatusCode::CREATED, Json(json!({ "apiKey": key }))).into_response()
        }
        Err(err) => store_failure(err),
    }
}

pub async fn delete_api_key(
    Path(key_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    if let Err(err) = require_admin(&state, &headers) {
        return err;
    }
    match state.store.revoke_api_key(&key_id).await {
        Ok(true) => {
            tracing::info!(key_id = %key_id, "api key revoked");
            (StatusCode::OK, Json(json!({ "ok": true }))).into_response()
        }
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "api key not found" })),
        )
            .into_response(),
        Err(err) => store_failure(err),
    }
}

pub async fn get_leads(
    Path(client_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    if let Err(err) = require_admin(&state, &headers) {
        return err;
    }
    match state.store.list_leads(&client_id).await {
        Ok(leads) => (StatusCode::OK, Json(json!({ "leads": leads }))).into_response(),
        Err(err) => store_failure(err),
    }
}
