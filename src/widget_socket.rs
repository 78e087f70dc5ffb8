use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures_util::{sink::SinkExt, stream::StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::embed::{origin_of, FrameSignal};
use crate::engine::{ChatEngine, EngineError};
use crate::store::{resolve_config, ConfigStore};
use crate::types::{AppState, ClientConfig, EventEnvelopeIn};
use crate::widget::{LeadForm, Widget};

#[derive(Debug, Clone, PartialEq, Eq)]
enum ClientEvent {
    Open,
    Close,
    Send(String),
    SubmitLead(LeadForm),
}

impl ClientEvent {
    fn parse(envelope: EventEnvelopeIn) -> Option<Self> {
        match envelope.event.as_str() {
            "widget:open" => Some(Self::Open),
            "widget:close" => Some(Self::Close),
            "widget:send" => envelope
                .data
                .get("text")
                .and_then(Value::as_str)
                .map(|text| Self::Send(text.to_string())),
            "lead:submit" => serde_json::from_value(envelope.data)
                .ok()
                .map(Self::SubmitLead),
            _ => None,
        }
    }
}

fn event_payload<T: Serialize>(event: &str, data: T) -> Option<String> {
    serde_json::to_string(&json!({ "event": event, "data": data })).ok()
}

/// Origin of the page hosting the widget frame.
///
/// The socket is opened by the frame itself, so its `Origin` header names this
/// server. The page reports its parent through `hostOrigin`; headers are only
/// consulted when that parameter is missing or unparseable.
fn host_origin(params: &HashMap<String, String>, headers: &HeaderMap) -> Option<String> {
    if let Some(origin) = params.get("hostOrigin").and_then(|value| origin_of(value.trim())) {
        return Some(origin);
    }
    let header_value =
        |name: header::HeaderName| headers.get(name).and_then(|value| value.to_str().ok());
    header_value(header::ORIGIN)
        .map(str::to_string)
        .or_else(|| header_value(header::REFERER).and_then(origin_of))
}

pub async fn widget_ws(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    let Some(client_id) = params
        .get("clientId")
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
    else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "clientId is required" })),
        )
            .into_response();
    };

    let mut engine = state.engine.clone().with_origin(host_origin(&params, &headers));
    if let Some(api_key) = params.get("apiKey").filter(|key| !key.trim().is_empty()) {
        engine = engine.with_api_key(api_key.trim());
    }
    let engine: Arc<dyn ChatEngine> = Arc::new(engine);
    ws.on_upgrade(move |socket| run_widget_session(socket, state, engine, client_id))
}

/// One mounted widget: the state machine plus the channels it reports through.
struct WidgetSession {
    widget: Widget,
    store: Arc<dyn ConfigStore>,
    engine: Arc<dyn ChatEngine>,
    outbound: mpsc::UnboundedSender<String>,
    replies: mpsc::UnboundedSender<Result<String, EngineError>>,
}

impl WidgetSession {
    fn emit<T: Serialize>(&self, event: &str, data: T) {
        if let Some(payload) = event_payload(event, data) {
            let _ = self.outbound.send(payload);
        }
    }

    fn push_state(&self) {
        self.emit("widget:state", self.widget.snapshot());
    }

    fn push_signal(&self, signal: Option<FrameSignal>) {
        if let Some(signal) = signal {
            self.emit("frame:signal", signal);
        }
    }

    async fn load_config(&mut self) {
        let outcome = resolve_config(self.store.as_ref(), self.widget.client_id())
            .await
            .map(|resolved| resolved.map(|resolved| resolved.config));
        self.widget.config_loaded(outcome);
        self.push_state();
    }

    fn config_changed(&mut self, config: ClientConfig) {
        tracing::debug!(client_id = %config.id, "pushing refreshed config to widget");
        self.widget.config_changed(config);
        self.push_state();
    }

    fn reply_arrived(&mut self, outcome: Result<String, EngineError>) {
        self.widget.finish_send(outcome);
        self.push_state();
    }

    async fn handle(&mut self, event: ClientEvent) {
        match event {
            ClientEvent::Open => {
                let signal = self.widget.open();
                self.push_signal(signal);
                self.push_state();
            }
            ClientEvent::Close => {
                let signal = self.widget.close();
                self.push_signal(signal);
                self.push_state();
            }
            ClientEvent::Send(text) => match self.widget.begin_send(&text) {
                Ok(turn) => {
                    let engine = self.engine.clone();
                    let replies = self.replies.clone();
                    tokio::spawn(async move {
                        let outcome = engine.send(&turn.prompt, &turn.history, &turn.config).await;
                        let _ = replies.send(outcome);
                    });
                    self.push_state();
                }
                Err(rejected) => {
                    tracing::debug!(client_id = %self.widget.client_id(), reason = %rejected, "send ignored");
                }
            },
            ClientEvent::SubmitLead(form) => {
                match self.widget.submit_lead(self.store.as_ref(), form).await {
                    Ok(_) => self.push_state(),
                    Err(err) => self.emit("lead:error", json!({ "message": err.to_string() })),
                }
            }
        }
    }
}

async fn run_widget_session(
    socket: WebSocket,
    state: Arc<AppState>,
    engine: Arc<dyn ChatEngine>,
    client_id: String,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let send_task = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            if ws_sender.send(Message::Text(payload.into())).await.is_err() {
                break;
            }
        }
    });

    // Subscribe before the first read so no update slips between the two.
    let mut subscription = Some(state.store.subscribe(&client_id));
    let mut session = WidgetSession {
        widget: Widget::new(client_id.clone()),
        store: state.store.clone(),
        engine,
        outbound: tx,
        replies: reply_tx,
    };
    session.load_config().await;
    tracing::info!(client_id = %client_id, "widget session started");

    loop {
        tokio::select! {
            incoming = ws_receiver.next() => {
                let text = match incoming {
                    Some(Ok(Message::Text(text))) => text.to_string(),
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => continue,
                };
                let Ok(envelope) = serde_json::from_str::<EventEnvelopeIn>(&text) else {
                    continue;
                };
                if let Some(event) = ClientEvent::parse(envelope) {
                    session.handle(event).await;
                }
            }
            update = async { subscription.as_mut()?.next().await }, if subscription.is_some() => {
                match update {
                    Some(config) => session.config_changed(config),
                    None => {
                        if let Some(closed) = subscription.take() {
                            tracing::warn!(client_id = closed.client_id(), "config feed closed");
                        }
                    }
                }
            }
            Some(outcome) = reply_rx.recv() => session.reply_arrived(outcome),
        }
    }

    drop(subscription);
    tracing::info!(client_id = %client_id, "widget session closed");
    send_task.abort();
}
