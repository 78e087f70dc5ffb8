use std::sync::Arc;

use axum::{
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde_json::json;
use tower_http::cors::CorsLayer;

use crate::admin;
use crate::completion::GeminiClient;
use crate::config::Settings;
use crate::embed::{self, PageRenderer, WIDGET_SOCKET_PATH};
use crate::engine::{EngineClient, CHAT_ENDPOINT};
use crate::error::ConfigError;
use crate::postgres::PgStore;
use crate::proxy;
use crate::store::{now_iso, ConfigStore, MemoryStore};
use crate::types::AppState;
use crate::widget_socket;

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true, "now": now_iso() }))
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let admin_routes = Router::new()
        .route(
            "/api/clients/{client_id}",
            get(admin::get_client).put(admin::put_client),
        )
        .route(
            "/api/clients/{client_id}/api-keys",
            get(admin::get_api_keys).post(admin::create_api_key),
        )
        .route("/api/api-keys/{key_id}", delete(admin::delete_api_key))
        .route("/api/clients/{client_id}/leads", get(admin::get_leads))
        .layer(CorsLayer::permissive());

    Router::new()
        .route("/health", get(health))
        .route(
            CHAT_ENDPOINT,
            post(proxy::chat).options(proxy::chat_preflight),
        )
        .route("/loader.js", get(embed::loader_js))
        .route("/", get(embed::index_page))
        .route(WIDGET_SOCKET_PATH, get(widget_socket::widget_ws))
        .merge(admin_routes)
        .with_state(state)
}

pub async fn run() -> Result<(), ConfigError> {
    let settings = Settings::from_env()?;

    let store: Arc<dyn ConfigStore> = match &settings.database_url {
        Some(database_url) => Arc::new(PgStore::connect(database_url).await?),
        None => {
            tracing::warn!("no database configured, client configs live in memory only");
            Arc::new(MemoryStore::new())
        }
    };
    if settings.gemini_api_key.is_none() {
        tracing::warn!("GEMINI_API_KEY is not set, chat requests will fail");
    }
    if settings.admin_token.is_none() {
        tracing::warn!("ADMIN_TOKEN is not set, the admin API rejects every request");
    }

    let state = Arc::new(AppState {
        store,
        completion: GeminiClient::new(
            &settings.gemini_base_url,
            settings.gemini_api_key.clone(),
            settings.completion_timeout,
        )?,
        engine: EngineClient::new(&settings.public_base_url, settings.engine_timeout)?,
        pages: PageRenderer::new()?,
        public_base_url: settings.public_base_url.clone(),
        admin_token: settings.admin_token.clone(),
    });

    let app = build_router(state);
    let addr = format!("0.0.0.0:{}", settings.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!(
        port = settings.port,
        public_url = %settings.public_base_url,
        "widget server listening"
    );
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
pub(crate) const TEST_ADMIN_TOKEN: &str = "admin-secret";

#[cfg(test)]
pub(crate) fn test_state(store: Arc<MemoryStore>, gemini_base_url: &str) -> Arc<AppState> {
    use std::time::Duration;

    Arc::new(AppState {
        store,
        completion: GeminiClient::new(
            gemini_base_url,
            Some("test-key".to_string()),
            Duration::from_secs(5),
        )
        .unwrap(),
        engine: EngineClient::new("http://127.0.0.1:9", Duration::from_secs(1)).unwrap(),
        pages: PageRenderer::new().unwrap(),
        public_base_url: "http://localhost:4000".to_string(),
        admin_token: Some(TEST_ADMIN_TOKEN.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;

    #[tokio::test]
    async fn health_reports_ok() {
        let app = build_router(test_state(Arc::new(MemoryStore::new()), "http://127.0.0.1:9"));
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["ok"], true);
    }

    #[tokio::test]
    async fn admin_routes_answer_cors_preflight() {
        let app = build_router(test_state(Arc::new(MemoryStore::new()), "http://127.0.0.1:9"));
        let response = app
            .oneshot(
                Request::builder()
                    .method("OPTIONS")
                    .uri("/api/clients/acme")
                    .header("origin", "https://dashboard.example")
                    .header("access-control-request-method", "PUT")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response
            .headers()
            .contains_key("access-control-allow-origin"));
    }
}
