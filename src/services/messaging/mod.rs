pub mod whatsapp;

use async_trait::async_trait;
use serde::Serialize;

/// WhatsApp renders at most three reply buttons per message.
pub const MAX_BUTTONS: usize = 3;
/// Total rows across all sections of a list message.
pub const MAX_LIST_ROWS: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Choice {
    pub id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Choice {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChoiceSection {
    pub title: String,
    pub rows: Vec<Choice>,
}

/// Provider-neutral outbound notification.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutboundMessage {
    Text {
        body: String,
    },
    Buttons {
        body: String,
        buttons: Vec<Choice>,
    },
    List {
        header: String,
        body: String,
        button: String,
        sections: Vec<ChoiceSection>,
    },
    Document {
        link: String,
        filename: String,
        caption: Option<String>,
    },
}

impl OutboundMessage {
    pub fn text(body: impl Into<String>) -> Self {
        OutboundMessage::Text { body: body.into() }
    }

    pub fn buttons(body: impl Into<String>, buttons: &[(&str, &str)]) -> Self {
        OutboundMessage::Buttons {
            body: body.into(),
            buttons: buttons
                .iter()
                .take(MAX_BUTTONS)
                .map(|(id, title)| Choice::new(*id, *title))
                .collect(),
        }
    }

    pub fn list(
        header: impl Into<String>,
        body: impl Into<String>,
        button: impl Into<String>,
        sections: Vec<ChoiceSection>,
    ) -> Self {
        let mut remaining = MAX_LIST_ROWS;
        let sections = sections
            .into_iter()
            .filter_map(|mut section| {
                section.rows.truncate(remaining);
                remaining -= section.rows.len();
                (!section.rows.is_empty()).then_some(section)
            })
            .collect();

        OutboundMessage::List {
            header: header.into(),
            body: body.into(),
            button: button.into(),
            sections,
        }
    }

    /// The human-readable part of the message, whatever its kind.
    pub fn body(&self) -> &str {
        match self {
            OutboundMessage::Text { body }
            | OutboundMessage::Buttons { body, .. }
            | OutboundMessage::List { body, .. } => body,
            OutboundMessage::Document { filename, .. } => filename,
        }
    }

    /// Every selectable id carried by the message.
    pub fn choice_ids(&self) -> Vec<&str> {
        match self {
            OutboundMessage::Buttons { buttons, .. } => {
                buttons.iter().map(|c| c.id.as_str()).collect()
            }
            OutboundMessage::List { sections, .. } => sections
                .iter()
                .flat_map(|s| s.rows.iter().map(|c| c.id.as_str()))
                .collect(),
            _ => Vec::new(),
        }
    }
}

#[async_trait]
pub trait MessagingProvider: Send + Sync {
    async fn send(&self, to: &str, message: &OutboundMessage) -> anyhow::Result<()>;

    /// Fetch an inbound media object (voice notes) by provider id.
    async fn download_media(&self, media_id: &str) -> anyhow::Result<Vec<u8>> {
        anyhow::bail!("media download not supported for {media_id}")
    }
}
