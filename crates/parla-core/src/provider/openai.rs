//! OpenAI-compatible transcription API.
//!
//! `POST {api_base}/audio/transcriptions` as a multipart form with
//! `model` and `file` fields, bearer-token auth, JSON `{"text": ...}`
//! response. `response_format = "text"` returns the raw body, and the
//! `stream` flag switches to an SSE body carrying `text` / `delta.text`
//! events.

use super::{TranscriptionBackend, TranscriptionRequest, http_client};
use crate::error::PipelineError;
use crate::settings::OpenAiSettings;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

#[derive(Deserialize)]
struct TranscriptionResponse {
    text: String,
}

pub struct OpenAiProvider {
    options: OpenAiSettings,
}

impl OpenAiProvider {
    pub fn new(options: OpenAiSettings) -> Self {
        Self { options }
    }

    fn ensure_auth(&self) -> Result<(), PipelineError> {
        if self.options.api_key.trim().is_empty() {
            return Err(PipelineError::Validation(
                "OpenAI API key is not configured".to_string(),
            ));
        }
        Ok(())
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/audio/transcriptions",
            self.options.api_base.trim_end_matches('/')
        )
    }

    fn build_form(&self, request: &TranscriptionRequest) -> Result<reqwest::multipart::Form, PipelineError> {
        let part = reqwest::multipart::Part::bytes(request.audio.clone())
            .file_name(request.filename.clone())
            .mime_str(&request.mime_type)
            .map_err(|err| PipelineError::Validation(err.to_string()))?;
        let mut form = reqwest::multipart::Form::new()
            .text("model", self.options.model.clone())
            .part("file", part);

        if !self.options.language.trim().is_empty() {
            form = form.text("language", self.options.language.clone());
        }
        if !self.options.prompt.trim().is_empty() {
            form = form.text("prompt", self.options.prompt.clone());
        }
        if !self.options.response_format.trim().is_empty() {
            form = form.text("response_format", self.options.response_format.clone());
        }
        form = form.text("temperature", self.options.temperature.to_string());
        if self.options.stream {
            form = form.text("stream", "true");
        }
        Ok(form)
    }
}

#[async_trait]
impl TranscriptionBackend for OpenAiProvider {
    async fn transcribe(&self, request: &TranscriptionRequest) -> Result<String, PipelineError> {
        self.ensure_auth()?;
        let form = self.build_form(request)?;
        let response = http_client()
            .post(self.endpoint())
            .bearer_auth(self.options.api_key.trim())
            .multipart(form)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::from_status(status, body));
        }

        let body = response
            .text()
            .await
            .map_err(|err| PipelineError::Transient(err.to_string()))?;

        if self.options.stream {
            let streamed = parse_streamed_text(&body)?;
            if !streamed.is_empty() {
                return Ok(streamed);
            }
        }
        if self.options.response_format == "text" {
            return Ok(body.trim().to_string());
        }
        let data: TranscriptionResponse = serde_json::from_str(&body)
            .map_err(|err| PipelineError::Transient(format!("response parse: {err}")))?;
        Ok(data.text)
    }
}

/// Collect the transcript out of an SSE-style streamed body: `data:` lines
/// carrying either a full `text` field or incremental `delta.text` events,
/// terminated by `[DONE]`.
fn parse_streamed_text(body: &str) -> Result<String, PipelineError> {
    let mut output = String::new();
    for line in body.lines() {
        let trimmed = line.trim();
        if !trimmed.starts_with("data:") {
            continue;
        }
        let payload = trimmed.trim_start_matches("data:").trim();
        if payload == "[DONE]" {
            break;
        }
        let value: Value = serde_json::from_str(payload)
            .map_err(|err| PipelineError::Transient(format!("stream parse: {err}")))?;
        if let Some(text) = value.get("text").and_then(|val| val.as_str()) {
            output.push_str(text);
        } else if let Some(text) = value.pointer("/delta/text").and_then(|val| val.as_str()) {
            output.push_str(text);
        }
    }
    Ok(output.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_api_key_is_a_validation_error() {
        let provider = OpenAiProvider::new(OpenAiSettings::default());
        let err = provider.ensure_auth().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
    }

    #[test]
    fn streamed_body_concatenates_deltas() {
        let body = "\
data: {\"delta\": {\"text\": \"hello \"}}\n\
data: {\"delta\": {\"text\": \"world\"}}\n\
data: [DONE]\n";
        assert_eq!(parse_streamed_text(body).unwrap(), "hello world");
    }

    #[test]
    fn streamed_body_prefers_complete_text_events() {
        let body = "data: {\"text\": \"full transcript\"}\ndata: [DONE]\n";
        assert_eq!(parse_streamed_text(body).unwrap(), "full transcript");
    }

    #[test]
    fn non_data_lines_are_ignored() {
        let body = "event: transcript.delta\ndata: {\"text\": \"ok\"}\n\n";
        assert_eq!(parse_streamed_text(body).unwrap(), "ok");
    }

    #[test]
    fn endpoint_strips_trailing_slash() {
        let mut options = OpenAiSettings::default();
        options.api_base = "https://api.example.com/v1/".to_string();
        let provider = OpenAiProvider::new(options);
        assert_eq!(
            provider.endpoint(),
            "https://api.example.com/v1/audio/transcriptions"
        );
    }
}
