use anyhow::Context;
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};

const GROQ_TRANSCRIPTIONS_URL: &str = "https://api.groq.com/openai/v1/audio/transcriptions";

/// Turns a voice note into text before it reaches the booking flow.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio: Vec<u8>, mime_type: &str) -> anyhow::Result<String>;
}

/// Whisper through Groq's OpenAI-compatible endpoint.
pub struct GroqTranscriber {
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl GroqTranscriber {
    pub fn new(api_key: String, model: String) -> Self {
        Self {
            api_key,
            model,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Transcriber for GroqTranscriber {
    async fn transcribe(&self, audio: Vec<u8>, mime_type: &str) -> anyhow::Result<String> {
        let file = Part::bytes(audio)
            .file_name(format!("audio.{}", extension_for(mime_type)))
            .mime_str(mime_type)
            .context("invalid audio mime type")?;

        let form = Form::new()
            .part("file", file)
            .text("model", self.model.clone())
            .text("language", "es")
            .text("response_format", "json");

        let resp = self
            .client
            .post(GROQ_TRANSCRIPTIONS_URL)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .context("failed to call Groq transcription API")?;

        let status = resp.status();
        let data: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse Groq transcription response")?;

        if !status.is_success() {
            anyhow::bail!("Groq transcription error ({}): {}", status, data);
        }

        let text = data["text"]
            .as_str()
            .map(|s| s.trim().to_string())
            .ok_or_else(|| anyhow::anyhow!("missing text in Groq transcription response"))?;
        anyhow::ensure!(!text.is_empty(), "empty transcription");
        Ok(text)
    }
}

/// WhatsApp voice notes arrive as `audio/ogg; codecs=opus`.
fn extension_for(mime_type: &str) -> &'static str {
    let base = mime_type.split(';').next().unwrap_or("").trim();
    match base {
        "audio/ogg" | "audio/opus" => "ogg",
        "audio/mpeg" | "audio/mp3" => "mp3",
        "audio/mp4" | "audio/m4a" | "audio/aac" => "m4a",
        "audio/amr" => "amr",
        "audio/wav" | "audio/x-wav" => "wav",
        _ => "ogg",
    }
}
