//! Conversation, open/closed, lead-form and live-configuration state of one
//! mounted chat widget.
//!
//! The machine is driven by discrete events and never blocks: a send is split
//! into [`Widget::begin_send`], which captures everything the chat call needs,
//! and [`Widget::finish_send`], which applies the reply. Configuration pushes
//! may land between the two without touching the turn already dispatched.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::embed::FrameSignal;
use crate::engine::EngineError;
use crate::error::StoreError;
use crate::fixtures::fallback_profile;
use crate::store::ConfigStore;
use crate::types::{ChatMessage, ClientConfig, Lead, NewLead, Role};

/// User messages after which the lead-capture form is shown.
pub const LEAD_FORM_THRESHOLD: usize = 3;
pub const LEAD_SUCCESS_MESSAGE: &str = "Success! We will reach out within 24 hours.";
pub const CONFIG_UNAVAILABLE_MESSAGE: &str =
    "This assistant is temporarily unavailable. Please try again in a moment.";

pub fn not_registered_message(client_id: &str) -> String {
    format!("Intelligence Node '{client_id}' is not registered. Please contact the site owner.")
}

/// Whether this send should reveal the lead form. Fires once per session.
pub fn lead_form_due(user_messages: usize, already_triggered: bool) -> bool {
    !already_triggered && user_messages >= LEAD_FORM_THRESHOLD
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum WidgetPhase {
    Collapsed,
    Open,
    LeadForm,
    Typing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendRejected {
    #[error("message is empty")]
    Blank,
    #[error("a reply is already pending")]
    Typing,
    #[error("the lead form is open")]
    LeadFormOpen,
    #[error("no configuration is loaded")]
    Unconfigured,
}

#[derive(Debug, Error)]
pub enum LeadError {
    #[error("the lead form is not open")]
    FormClosed,
    #[error("{0} is required")]
    MissingField(&'static str),
    #[error("{0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct LeadForm {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub phone: String,
}

/// Everything a dispatched chat call needs, captured at send time.
#[derive(Debug, Clone)]
pub struct PendingTurn {
    pub prompt: String,
    pub history: Vec<ChatMessage>,
    pub config: ClientConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WidgetSnapshot<'a> {
    pub phase: WidgetPhase,
    pub open: bool,
    pub typing: bool,
    pub lead_form: bool,
    pub can_send: bool,
    pub name: &'a str,
    pub primary_color: &'a str,
    pub logo_url: Option<&'a str>,
    pub messages: &'a [ChatMessage],
}

#[derive(Debug, Clone)]
pub struct Widget {
    client_id: String,
    config: ClientConfig,
    configured: bool,
    open: bool,
    typing: bool,
    lead_form: bool,
    lead_form_triggered: bool,
    messages: Vec<ChatMessage>,
}

impl Widget {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            config: fallback_profile(),
            configured: false,
            open: false,
            typing: false,
            lead_form: false,
            lead_form_triggered: false,
            messages: Vec::new(),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn can_send(&self) -> bool {
        self.configured && !self.typing && !self.lead_form
    }

    pub fn phase(&self) -> WidgetPhase {
        if !self.open {
            WidgetPhase::Collapsed
        } else if self.lead_form {
            WidgetPhase::LeadForm
        } else if self.typing {
            WidgetPhase::Typing
        } else {
            WidgetPhase::Open
        }
    }

    pub fn snapshot(&self) -> WidgetSnapshot<'_> {
        WidgetSnapshot {
            phase: self.phase(),
            open: self.open,
            typing: self.typing,
            lead_form: self.lead_form,
            can_send: self.can_send(),
            name: &self.config.name,
            primary_color: &self.config.primary_color,
            logo_url: self.config.logo_url.as_deref(),
            messages: &self.messages,
        }
    }

    /// Returns the signal for the parent frame only when the state changed.
    pub fn open(&mut self) -> Option<FrameSignal> {
        if self.open {
            return None;
        }
        self.open = true;
        Some(FrameSignal::Expand)
    }

    pub fn close(&mut self) -> Option<FrameSignal> {
        if !self.open {
            return None;
        }
        self.open = false;
        Some(FrameSignal::Collapse)
    }

    /// Applies the outcome of the initial configuration lookup.
    pub fn config_loaded(&mut self, outcome: Result<Option<ClientConfig>, StoreError>) {
        match outcome {
            Ok(Some(config)) => self.apply_config(config),
            Ok(None) => {
                tracing::warn!(client_id = %self.client_id, "widget mounted for unknown client");
                self.messages
                    .push(ChatMessage::assistant(not_registered_message(&self.client_id)));
            }
            Err(err) => {
                tracing::error!(client_id = %self.client_id, error = %err, "widget config load failed");
                self.messages
                    .push(ChatMessage::assistant(CONFIG_UNAVAILABLE_MESSAGE));
            }
        }
    }

    /// Replaces the configuration pushed by the change feed, in any state.
    pub fn config_changed(&mut self, config: ClientConfig) {
        if config.id != self.client_id {
            return;
        }
        self.apply_config(config);
    }

    fn apply_config(&mut self, config: ClientConfig) {
        self.config = config;
        self.configured = true;
        if self.messages.is_empty() {
            self.messages
                .push(ChatMessage::assistant(self.config.greeting.clone()));
        }
    }

    pub fn user_message_count(&self) -> usize {
        self.messages
            .iter()
            .filter(|message| message.role == Role::User)
            .count()
    }

    pub fn begin_send(&mut self, text: &str) -> Result<PendingTurn, SendRejected> {
        if text.trim().is_empty() {
            return Err(SendRejected::Blank);
        }
        if self.typing {
            return Err(SendRejected::Typing);
        }
        if self.lead_form {
            return Err(SendRejected::LeadFormOpen);
        }
        if !self.configured {
            return Err(SendRejected::Unconfigured);
        }

        let history = self.messages.clone();
        self.messages.push(ChatMessage::user(text));
        self.typing = true;

        if lead_form_due(self.user_message_count(), self.lead_form_triggered) {
            self.lead_form_triggered = true;
            self.lead_form = true;
        }

        Ok(PendingTurn {
            prompt: text.to_string(),
            history,
            config: self.config.clone(),
        })
    }

    pub fn finish_send(&mut self, outcome: Result<String, EngineError>) {
        let reply = match outcome {
            Ok(text) => text,
            Err(err) => {
                tracing::warn!(client_id = %self.client_id, kind = ?err.kind, "chat turn failed");
                err.message
            }
        };
        self.messages.push(ChatMessage::assistant(reply));
        self.typing = false;
    }

    pub async fn submit_lead(
        &mut self,
        store: &dyn ConfigStore,
        form: LeadForm,
    ) -> Result<Lead, LeadError> {
        if !self.lead_form {
            return Err(LeadError::FormClosed);
        }
        for (field, value) in [
            ("name", &form.name),
            ("email", &form.email),
            ("phone", &form.phone),
        ] {
            if value.trim().is_empty() {
                return Err(LeadError::MissingField(field));
            }
        }

        let lead = store
            .insert_lead(NewLead {
                client_id: self.client_id.clone(),
                name: form.name.trim().to_string(),
                email: form.email.trim().to_string(),
                phone: form.phone.trim().to_string(),
                chat_transcript: self.messages.clone(),
            })
            .await?;

        tracing::info!(client_id = %self.client_id, lead_id = %lead.id, "lead captured");
        self.lead_form = false;
        self.messages
            .push(ChatMessage::assistant(LEAD_SUCCESS_MESSAGE));
        Ok(lead)
    }
}
