use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::completion::GeminiClient;
use crate::embed::PageRenderer;
use crate::engine::EngineClient;
use crate::store::ConfigStore;

/// Sentinel entry of `authorized_origins` that admits every origin.
pub const ANY_ORIGIN: &str = "*";

/// One tenant's chatbot persona and settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub id: String,
    #[serde(default)]
    pub user_id: String,
    pub name: String,
    pub primary_color: String,
    pub greeting: String,
    pub system_instruction: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logo_url: Option<String>,
    #[serde(default)]
    pub thinking_enabled: bool,
    #[serde(default)]
    pub thinking_budget: i32,
    #[serde(default)]
    pub authorized_origins: Vec<String>,
    #[serde(default)]
    pub created_at: String,
}

impl ClientConfig {
    /// Origins the widget may be served to; an empty list means any origin.
    pub fn effective_origins(&self) -> Vec<&str> {
        if self.authorized_origins.is_empty() {
            return vec![ANY_ORIGIN];
        }
        self.authorized_origins.iter().map(String::as_str).collect()
    }

    pub fn allows_origin(&self, origin: Option<&str>) -> bool {
        let origins = self.effective_origins();
        if origins.contains(&ANY_ORIGIN) {
            return true;
        }
        let origin = origin.unwrap_or("").trim();
        !origin.is_empty() && origins.iter().any(|allowed| allowed.trim() == origin)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: String,
    pub client_id: String,
    pub key: String,
    pub name: String,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lead {
    pub id: String,
    pub client_id: String,
    pub name: String,
    pub email: String,
    pub phone: String,
    pub chat_transcript: Vec<ChatMessage>,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct NewLead {
    pub client_id: String,
    pub name: String,
    pub email: String,
    pub phone: String,
    pub chat_transcript: Vec<ChatMessage>,
}

/// Body of `POST /api/chat`. Both fields are optional on the wire so that a
/// missing `clientId` is reported as a validation failure, not a parse error.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequestBody {
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub messages: Vec<WireMessage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireMessage {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub parts: Vec<WirePart>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WirePart {
    #[serde(default)]
    pub text: Option<String>,
}

impl WireMessage {
    pub fn text(&self) -> &str {
        self.content
            .as_deref()
            .or_else(|| self.parts.first().and_then(|part| part.text.as_deref()))
            .unwrap_or("")
    }
}

#[derive(Debug, Deserialize)]
pub struct EventEnvelopeIn {
    pub event: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct CreateApiKeyBody {
    pub name: String,
}

pub struct AppState {
    pub store: Arc<dyn ConfigStore>,
    pub completion: GeminiClient,
    pub engine: EngineClient,
    pub pages: PageRenderer,
    pub public_base_url: String,
    pub admin_token: Option<String>,
}
