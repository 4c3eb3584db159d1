use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

use crate::db::{self, queries};
use crate::errors::AppError;
use crate::models::InboundEvent;
use crate::services::messaging::OutboundMessage;
use crate::state::AppState;

// ── Verification handshake ──

#[derive(Deserialize)]
pub struct VerifyQuery {
    #[serde(rename = "hub.mode")]
    pub mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    pub verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    pub challenge: Option<String>,
}

// GET /webhook
pub async fn verify(State(state): State<Arc<AppState>>, Query(query): Query<VerifyQuery>) -> Response {
    let subscribed = query.mode.as_deref() == Some("subscribe")
        && query.verify_token.as_deref() == Some(state.config.whatsapp_verify_token.as_str());

    match (subscribed, query.challenge) {
        (true, Some(challenge)) => {
            tracing::info!("webhook verified");
            (StatusCode::OK, challenge).into_response()
        }
        _ => {
            tracing::warn!("webhook verification rejected");
            (StatusCode::FORBIDDEN, "verification failed").into_response()
        }
    }
}

// ── Inbound payload ──

#[derive(Debug, Deserialize)]
pub struct WebhookPayload {
    #[serde(default)]
    pub entry: Vec<Entry>,
}

#[derive(Debug, Deserialize)]
pub struct Entry {
    #[serde(default)]
    pub changes: Vec<Change>,
}

#[derive(Debug, Deserialize)]
pub struct Change {
    pub value: Option<ChangeValue>,
}

/// Delivery receipts (`statuses`) share this envelope and are ignored.
#[derive(Debug, Deserialize)]
pub struct ChangeValue {
    #[serde(default)]
    pub messages: Vec<InboundMessage>,
}

#[derive(Debug, Deserialize)]
pub struct InboundMessage {
    pub from: String,
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub text: Option<TextBody>,
    pub interactive: Option<Interactive>,
    pub button: Option<TemplateButton>,
    pub audio: Option<Media>,
}

#[derive(Debug, Deserialize)]
pub struct TextBody {
    pub body: String,
}

#[derive(Debug, Deserialize)]
pub struct Interactive {
    pub button_reply: Option<Reply>,
    pub list_reply: Option<Reply>,
}

#[derive(Debug, Deserialize)]
pub struct Reply {
    pub id: String,
    #[serde(default)]
    pub title: String,
}

#[derive(Debug, Deserialize)]
pub struct TemplateButton {
    pub payload: Option<String>,
    pub text: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Media {
    pub id: String,
    pub mime_type: Option<String>,
}

impl WebhookPayload {
    pub fn into_messages(self) -> impl Iterator<Item = InboundMessage> {
        self.entry
            .into_iter()
            .flat_map(|e| e.changes)
            .filter_map(|c| c.value)
            .flat_map(|v| v.messages)
    }
}

/// Check Meta's `X-Hub-Signature-256: sha256=<hex>` over the raw body.
pub fn verify_signature(app_secret: &str, body: &[u8], header: &str) -> bool {
    let Some(hex_sig) = header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_sig) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(app_secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

// POST /webhook
pub async fn receive(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    // Skip signature validation when no app secret is configured (dev mode)
    if !state.config.whatsapp_app_secret.is_empty() {
        let signature = headers
            .get("x-hub-signature-256")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");

        if !verify_signature(&state.config.whatsapp_app_secret, &body, signature) {
            tracing::warn!("invalid or missing X-Hub-Signature-256");
            return AppError::InvalidSignature.into_response();
        }
    }

    let payload: WebhookPayload = match serde_json::from_slice(&body) {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!(error = %e, "unparseable webhook payload");
            return AppError::BadRequest("invalid webhook payload".to_string()).into_response();
        }
    };

    for message in payload.into_messages() {
        if !first_delivery(&state, &message.id) {
            tracing::debug!(message_id = %message.id, "duplicate delivery, skipping");
            continue;
        }

        tracing::info!(from = %message.from, kind = %message.kind, "incoming WhatsApp message");

        let from = message.from.clone();
        let event = to_event(&state, message).await;

        if let Err(e) = state.orchestrator.handle(&from, event).await {
            tracing::error!(error = %e, from = %from, "conversation processing failed");
            let fallback = OutboundMessage::text(
                "Lo sentimos, tuvimos un problema procesando tu mensaje. Intenta de nuevo en un momento.",
            );
            if let Err(e) = state.messaging.send(&from, &fallback).await {
                tracing::warn!(error = %e, to = %from, "failed to send fallback apology");
            }
        }
    }

    // Meta stops retrying long before a week is up
    let cutoff = chrono::Utc::now() - chrono::Duration::days(7);
    let pruned = db::lock(&state.db).and_then(|conn| queries::prune_processed_messages(&conn, cutoff));
    if let Err(e) = pruned {
        tracing::warn!(error = %e, "failed to prune processed message ids");
    }

    StatusCode::OK.into_response()
}

/// Provider retries reuse the message id. A failing dedupe table never blocks
/// processing.
fn first_delivery(state: &AppState, message_id: &str) -> bool {
    let result = db::lock(&state.db).and_then(|conn| queries::mark_message_processed(&conn, message_id));
    match result {
        Ok(fresh) => fresh,
        Err(e) => {
            tracing::error!(error = %e, message_id, "failed to record message id");
            true
        }
    }
}

async fn to_event(state: &AppState, message: InboundMessage) -> InboundEvent {
    match message.kind.as_str() {
        "text" => match message.text {
            Some(text) => InboundEvent::Text(text.body),
            None => InboundEvent::Unsupported { kind: message.kind },
        },
        "interactive" => {
            let reply = message
                .interactive
                .and_then(|i| i.button_reply.or(i.list_reply));
            match reply {
                Some(reply) => {
                    tracing::debug!(id = %reply.id, title = %reply.title, "selection");
                    InboundEvent::Selection { id: reply.id }
                }
                None => InboundEvent::Unsupported { kind: message.kind },
            }
        }
        "button" => match message.button.and_then(|b| b.payload.or(b.text)) {
            Some(id) => InboundEvent::Selection { id },
            None => InboundEvent::Unsupported { kind: message.kind },
        },
        "audio" => match message.audio {
            Some(audio) => transcribe(state, audio).await,
            None => InboundEvent::Unsupported { kind: message.kind },
        },
        _ => InboundEvent::Unsupported { kind: message.kind },
    }
}

/// Voice notes become text when a transcriber is configured and it succeeds.
async fn transcribe(state: &AppState, audio: Media) -> InboundEvent {
    let Some(transcriber) = &state.transcriber else {
        return InboundEvent::Audio { media_id: audio.id };
    };

    let bytes = match state.messaging.download_media(&audio.id).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(error = %e, media_id = %audio.id, "audio download failed");
            return InboundEvent::Audio { media_id: audio.id };
        }
    };

    let mime = audio.mime_type.as_deref().unwrap_or("audio/ogg");
    match transcriber.transcribe(bytes, mime).await {
        Ok(text) => {
            tracing::info!(media_id = %audio.id, chars = text.chars().count(), "audio transcribed");
            InboundEvent::Text(text)
        }
        Err(e) => {
            tracing::warn!(error = %e, media_id = %audio.id, "transcription failed");
            InboundEvent::Audio { media_id: audio.id }
        }
    }
}
