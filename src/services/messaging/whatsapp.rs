use anyhow::Context;
use async_trait::async_trait;
use serde_json::{json, Value};

use super::{ChoiceSection, MessagingProvider, OutboundMessage};

const MAX_TEXT_LEN: usize = 4096;
const MAX_INTERACTIVE_BODY_LEN: usize = 1024;
const MAX_BUTTON_TITLE_LEN: usize = 20;
const MAX_ROW_TITLE_LEN: usize = 24;
const MAX_ROW_DESCRIPTION_LEN: usize = 72;
const MAX_HEADER_LEN: usize = 60;

/// Sends messages through the WhatsApp Cloud API (Graph `/{phone_number_id}/messages`).
pub struct WhatsAppCloudProvider {
    access_token: String,
    phone_number_id: String,
    api_base: String,
    api_version: String,
    client: reqwest::Client,
}

impl WhatsAppCloudProvider {
    pub fn new(
        access_token: String,
        phone_number_id: String,
        api_base: String,
        api_version: String,
    ) -> Self {
        Self {
            access_token,
            phone_number_id,
            api_base: api_base.trim_end_matches('/').to_string(),
            api_version,
            client: reqwest::Client::new(),
        }
    }

    fn messages_url(&self) -> String {
        format!(
            "{}/{}/{}/messages",
            self.api_base, self.api_version, self.phone_number_id
        )
    }

    fn media_url(&self, media_id: &str) -> String {
        format!("{}/{}/{}", self.api_base, self.api_version, media_id)
    }
}

#[async_trait]
impl MessagingProvider for WhatsAppCloudProvider {
    async fn send(&self, to: &str, message: &OutboundMessage) -> anyhow::Result<()> {
        let payload = build_payload(to, message);

        let resp = self
            .client
            .post(self.messages_url())
            .bearer_auth(&self.access_token)
            .json(&payload)
            .send()
            .await
            .context("failed to call WhatsApp Cloud API")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("WhatsApp API error ({status}): {body}");
        }

        tracing::debug!(to, "whatsapp message sent");
        Ok(())
    }

    async fn download_media(&self, media_id: &str) -> anyhow::Result<Vec<u8>> {
        let meta: Value = self
            .client
            .get(self.media_url(media_id))
            .bearer_auth(&self.access_token)
            .send()
            .await
            .context("failed to look up WhatsApp media")?
            .error_for_status()
            .context("WhatsApp media lookup returned error")?
            .json()
            .await
            .context("failed to parse WhatsApp media metadata")?;

        let url = meta["url"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("missing url in WhatsApp media metadata"))?;

        let bytes = self
            .client
            .get(url)
            .bearer_auth(&self.access_token)
            .send()
            .await
            .context("failed to download WhatsApp media")?
            .error_for_status()
            .context("WhatsApp media download returned error")?
            .bytes()
            .await
            .context("failed to read WhatsApp media body")?;

        Ok(bytes.to_vec())
    }
}

/// Graph API JSON for one outbound message. Titles are clipped to the
/// provider's limits rather than rejected.
pub fn build_payload(to: &str, message: &OutboundMessage) -> Value {
    match message {
        OutboundMessage::Text { body } => json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": to,
            "type": "text",
            "text": { "preview_url": true, "body": clip(body, MAX_TEXT_LEN) },
        }),
        OutboundMessage::Buttons { body, buttons } => {
            let buttons: Vec<Value> = buttons
                .iter()
                .map(|b| {
                    json!({
                        "type": "reply",
                        "reply": { "id": b.id, "title": clip(&b.title, MAX_BUTTON_TITLE_LEN) },
                    })
                })
                .collect();
            json!({
                "messaging_product": "whatsapp",
                "recipient_type": "individual",
                "to": to,
                "type": "interactive",
                "interactive": {
                    "type": "button",
                    "body": { "text": clip(body, MAX_INTERACTIVE_BODY_LEN) },
                    "action": { "buttons": buttons },
                },
            })
        }
        OutboundMessage::List {
            header,
            body,
            button,
            sections,
        } => json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": to,
            "type": "interactive",
            "interactive": {
                "type": "list",
                "header": { "type": "text", "text": clip(header, MAX_HEADER_LEN) },
                "body": { "text": clip(body, MAX_INTERACTIVE_BODY_LEN) },
                "action": {
                    "button": clip(button, MAX_BUTTON_TITLE_LEN),
                    "sections": sections.iter().map(section_json).collect::<Vec<_>>(),
                },
            },
        }),
        OutboundMessage::Document {
            link,
            filename,
            caption,
        } => {
            let mut document = json!({ "link": link, "filename": filename });
            if let Some(caption) = caption {
                document["caption"] = json!(caption);
            }
            json!({
                "messaging_product": "whatsapp",
                "recipient_type": "individual",
                "to": to,
                "type": "document",
                "document": document,
            })
        }
    }
}

fn section_json(section: &ChoiceSection) -> Value {
    let rows: Vec<Value> = section
        .rows
        .iter()
        .map(|row| {
            let mut value = json!({
                "id": row.id,
                "title": clip(&row.title, MAX_ROW_TITLE_LEN),
            });
            if let Some(description) = &row.description {
                value["description"] = json!(clip(description, MAX_ROW_DESCRIPTION_LEN));
            }
            value
        })
        .collect();
    json!({ "title": clip(&section.title, MAX_ROW_TITLE_LEN), "rows": rows })
}

fn clip(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max_chars.saturating_sub(1)).collect();
    out.push('…');
    out
}
