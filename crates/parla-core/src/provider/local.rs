//! HTTP client for the locally hosted container service.
//!
//! The container mirrors the OpenAI transcription contract on
//! `POST {service_url}/api/v1/asr`: multipart `file` upload, JSON
//! `{"text": ...}` response. Availability is the dispatcher's concern:
//! it only routes here while the service is `Running`.

use super::{TranscriptionBackend, TranscriptionRequest, http_client};
use crate::error::PipelineError;
use async_trait::async_trait;
use serde::Deserialize;

#[derive(Deserialize)]
struct AsrResponse {
    text: String,
}

pub struct LocalProvider {
    service_url: String,
}

impl LocalProvider {
    pub fn new(service_url: String) -> Self {
        Self { service_url }
    }

    fn endpoint(&self) -> String {
        format!("{}/api/v1/asr", self.service_url.trim().trim_end_matches('/'))
    }
}

#[async_trait]
impl TranscriptionBackend for LocalProvider {
    async fn transcribe(&self, request: &TranscriptionRequest) -> Result<String, PipelineError> {
        if self.service_url.trim().is_empty() {
            return Err(PipelineError::Validation(
                "local service URL is not configured".to_string(),
            ));
        }

        let part = reqwest::multipart::Part::bytes(request.audio.clone())
            .file_name(request.filename.clone())
            .mime_str(&request.mime_type)
            .map_err(|err| PipelineError::Validation(err.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("language", "auto");

        let response = http_client()
            .post(self.endpoint())
            .multipart(form)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::from_status(status, body));
        }

        let data: AsrResponse = response
            .json()
            .await
            .map_err(|err| PipelineError::Transient(format!("response parse: {err}")))?;
        Ok(data.text)
    }
}
