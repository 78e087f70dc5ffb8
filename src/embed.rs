use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
};
use minijinja::{context, AutoEscape, Environment, Value};
use reqwest::Url;
use serde::Serialize;

use crate::fixtures::DEMO_CLIENT_IDS;
use crate::types::AppState;

const LOADER_TEMPLATE: &str = include_str!("templates/loader.js.j2");
const WIDGET_TEMPLATE: &str = include_str!("templates/widget.html.j2");
const PREVIEW_TEMPLATE: &str = include_str!("templates/preview.html.j2");

pub const CONTAINER_ID: &str = "ansury-container";
pub const IFRAME_ID: &str = "ansury-iframe";
pub const COLLAPSED_PX: u32 = 80;
pub const EXPANDED_WIDTH_PX: u32 = 420;
pub const EXPANDED_HEIGHT_PX: u32 = 700;
pub const EDGE_MARGIN_PX: u32 = 20;
/// Below this viewport width the expanded widget takes the whole screen.
pub const SMALL_VIEWPORT_PX: u32 = 500;
pub const WIDGET_SOCKET_PATH: &str = "/ws/widget";
const DEFAULT_PREVIEW_CLIENT: &str = "ansury-lux-123";

/// Resize request posted from the widget frame to the host page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type")]
pub enum FrameSignal {
    #[serde(rename = "ansury-expand")]
    Expand,
    #[serde(rename = "ansury-collapse")]
    Collapse,
}

impl FrameSignal {
    pub fn message_type(self) -> &'static str {
        match self {
            FrameSignal::Expand => "ansury-expand",
            FrameSignal::Collapse => "ansury-collapse",
        }
    }
}

/// Address of the widget-only view for `client_id` under `base_url`.
pub fn embed_src(base_url: &str, client_id: &str) -> Option<String> {
    let mut url = Url::parse(base_url).ok()?;
    url.set_path("/");
    url.set_query(None);
    url.query_pairs_mut()
        .append_pair("clientId", client_id)
        .append_pair("embedded", "true");
    Some(url.to_string())
}

/// Scheme, host and port of `url`, as browsers report it in `Origin`.
pub fn origin_of(url: &str) -> Option<String> {
    let origin = Url::parse(url).ok()?.origin();
    origin.is_tuple().then(|| origin.ascii_serialization())
}

/// JSON literal safe to splice into an inline `<script>`.
fn script_literal(value: &str) -> String {
    serde_json::Value::from(value)
        .to_string()
        .replace("</", "<\\/")
}

pub struct PageRenderer {
    env: Environment<'static>,
}

impl PageRenderer {
    pub fn new() -> Result<Self, minijinja::Error> {
        let mut env = Environment::new();
        env.set_auto_escape_callback(|name| {
            if name.ends_with(".html") {
                AutoEscape::Html
            } else {
                AutoEscape::None
            }
        });
        env.add_template("loader.js", LOADER_TEMPLATE)?;
        env.add_template("widget.html", WIDGET_TEMPLATE)?;
        env.add_template("preview.html", PREVIEW_TEMPLATE)?;
        Ok(Self { env })
    }

    pub fn loader_script(&self) -> Result<String, minijinja::Error> {
        self.env.get_template("loader.js")?.render(context! {
            container_id => CONTAINER_ID,
            iframe_id => IFRAME_ID,
            collapsed_px => COLLAPSED_PX,
            expanded_width_px => EXPANDED_WIDTH_PX,
            expanded_height_px => EXPANDED_HEIGHT_PX,
            margin_px => EDGE_MARGIN_PX,
            small_viewport_px => SMALL_VIEWPORT_PX,
            expand_type => FrameSignal::Expand.message_type(),
            collapse_type => FrameSignal::Collapse.message_type(),
        })
    }

    pub fn widget_page(&self, client_id: &str) -> Result<String, minijinja::Error> {
        self.env.get_template("widget.html")?.render(context! {
            client_id_json => Value::from_safe_string(script_literal(client_id)),
            socket_path_json => Value::from_safe_string(script_literal(WIDGET_SOCKET_PATH)),
        })
    }

    pub fn preview_page(&self, base_url: &str, client_id: &str) -> Result<String, minijinja::Error> {
        let embed_src = embed_src(base_url, client_id).unwrap_or_default();
        self.env.get_template("preview.html")?.render(context! {
            client_id => client_id,
            demo_ids => DEMO_CLIENT_IDS,
            loader_url => format!("{base_url}/loader.js"),
            embed_src => embed_src,
        })
    }
}

fn render_failure(err: minijinja::Error) -> Response {
    tracing::error!(error = %err, "page render failed");
    (StatusCode::INTERNAL_SERVER_ERROR, "render failure").into_response()
}

pub async fn loader_js(State(state): State<Arc<AppState>>) -> Response {
    match state.pages.loader_script() {
        Ok(script) => (
            [
                (header::CONTENT_TYPE, "application/javascript;charset=UTF-8"),
                (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
                (header::CACHE_CONTROL, "public, max-age=300"),
            ],
            script,
        )
            .into_response(),
        Err(err) => render_failure(err),
    }
}

/// `/?clientId=<id>&embedded=true` renders only the widget; anything else the preview.
pub async fn index_page(
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let client_id = params
        .get("clientId")
        .map(|id| id.trim())
        .filter(|id| !id.is_empty())
        .unwrap_or(DEFAULT_PREVIEW_CLIENT);
    let embedded = params.get("embedded").map(String::as_str) == Some("true");

    let rendered = if embedded {
        state.pages.widget_page(client_id)
    } else {
        state.pages.preview_page(&state.public_base_url, client_id)
    };
    match rendered {
        Ok(html) => Html(html).into_response(),
        Err(err) => render_failure(err),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use super::*;
    use crate::app::{build_router, test_state};
    use crate::store::MemoryStore;

    async fn get(uri: &str) -> (StatusCode, axum::http::HeaderMap, String) {
        let app = build_router(test_state(Arc::new(MemoryStore::new()), "http://127.0.0.1:9"));
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, headers, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[test]
    fn frame_signals_serialize_as_typed_messages() {
        assert_eq!(
            serde_json::to_value(FrameSignal::Expand).unwrap(),
            serde_json::json!({ "type": "ansury-expand" })
        );
        assert_eq!(
            serde_json::to_value(FrameSignal::Collapse).unwrap(),
            serde_json::json!({ "type": "ansury-collapse" })
        );
    }

    #[test]
    fn embed_src_encodes_client_id() {
        assert_eq!(
            embed_src("https://widgets.example/app?x=1", "ansury-lux-123").unwrap(),
            "https://widgets.example/?clientId=ansury-lux-123&embedded=true"
        );
        assert_eq!(
            embed_src("http://localhost:4000", "a b&c").unwrap(),
            "http://localhost:4000/?clientId=a+b%26c&embedded=true"
        );
        assert!(embed_src("not a url", "x").is_none());
    }

    #[test]
    fn origin_of_strips_path_and_query() {
        assert_eq!(
            origin_of("https://shop.example:8443/products?id=4").as_deref(),
            Some("https://shop.example:8443")
        );
        assert_eq!(
            origin_of("https://shop.example/").as_deref(),
            Some("https://shop.example")
        );
        assert_eq!(origin_of("data:text/plain,hi"), None);
        assert_eq!(origin_of("garbage"), None);
    }

    // No JS engine here; these read the generated source for the guards it must carry.
    #[test]
    fn loader_script_emits_single_instance_and_origin_guards() {
        let script = PageRenderer::new().unwrap().loader_script().unwrap();
        assert!(script.contains("getAttribute('data-client-id')"));
        assert!(script.contains("if (document.getElementById('ansury-container')) return;"));
        assert!(script.contains("new URL(script.src, window.location.href).origin"));
        assert!(script.contains("if (event.origin !== baseUrl || !event.data) return;"));
        assert!(script.contains("'&embedded=true'"));
        assert!(script.contains("'ansury-expand'"));
        assert!(script.contains("'ansury-collapse'"));
        assert!(script.contains("container.style.width = '420px'"));
        assert!(script.contains("pointer-events:none"));
        assert!(!script.contains("{{"));
    }

    #[test]
    fn loader_script_checks_client_id_before_any_dom_call() {
        let script = PageRenderer::new().unwrap().loader_script().unwrap();
        let missing_attr = script.find("Missing data-client-id").unwrap();
        let first_mutation = script.find("document.createElement").unwrap();
        assert!(missing_attr < first_mutation);
        assert!(script.contains("} catch (err) {"));
    }

    #[test]
    fn widget_page_escapes_client_id_in_script() {
        let html = PageRenderer::new()
            .unwrap()
            .widget_page("</script><script>alert(1)")
            .unwrap();
        assert!(html.contains(r#"var clientId = "<\/script><script>alert(1)";"#));
        assert!(html.contains("background: transparent; overflow: hidden;"));
    }

    #[tokio::test]
    async fn loader_is_served_as_cacheable_javascript() {
        let (status, headers, body) = get("/loader.js").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            headers[header::CONTENT_TYPE],
            "application/javascript;charset=UTF-8"
        );
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert_eq!(headers[header::CACHE_CONTROL], "public, max-age=300");
        assert!(body.contains("ansury-container"));
    }

    #[tokio::test]
    async fn embedded_mode_renders_widget_only() {
        let (status, _, body) = get("/?clientId=ansury-saas-456&embedded=true").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains(r#"var clientId = "ansury-saas-456";"#));
        assert!(body.contains(r#"var socketPath = "/ws/widget";"#));
        assert!(body.contains("window.location.host + socketPath + '?clientId='"));
        assert!(!body.contains("Client Website Simulator"));
    }

    #[test]
    fn widget_script_is_not_html_escaped() {
        let html = PageRenderer::new().unwrap().widget_page("acme").unwrap();
        let script_start = html.find("<script>").unwrap();
        let script = &html[script_start..];
        assert!(!script.contains("&#x2f;"));
        assert!(!script.contains("&quot;"));
        assert!(script.contains(r#"var clientId = "acme";"#));
    }

    /// Attribute values are entity-escaped; browsers decode them before use.
    fn decode_slashes(body: &str) -> String {
        body.replace("&#x2f;", "/")
    }

    #[tokio::test]
    async fn default_mode_renders_preview_with_loader() {
        let (status, _, body) = get("/?clientId=ansury-saas-456").await;
        assert_eq!(status, StatusCode::OK);
        let body = decode_slashes(&body);
        assert!(body.contains("Client Website Simulator"));
        assert!(body.contains(
            r#"<script src="http://localhost:4000/loader.js" data-client-id="ansury-saas-456"></script>"#
        ));
        assert!(body.contains(
            "http://localhost:4000/?clientId=ansury-saas-456&amp;embedded=true"
        ));
    }
}
