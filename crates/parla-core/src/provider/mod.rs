//! Interchangeable speech-to-text backends.
//!
//! Each provider implements one capability: audio bytes in, transcript
//! out. Provider options are snapshotted into the backend at construction
//! (dispatch time), so concurrent settings edits never touch an in-flight
//! request.

mod local;
mod openai;
mod volcengine;

pub use local::LocalProvider;
pub use openai::OpenAiProvider;
pub use volcengine::VolcengineProvider;

use crate::error::PipelineError;
use crate::settings::{ProviderKind, Settings};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use std::time::Duration;

/// Per-attempt request timeout shared by all HTTP providers.
pub const REQUEST_TIMEOUT_SECS: u64 = 60;

static HTTP_CLIENT: Lazy<reqwest::Client> = Lazy::new(|| {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
        .build()
        .expect("failed to build HTTP client")
});

/// Shared client so providers reuse connections across segments.
pub fn http_client() -> &'static reqwest::Client {
    &HTTP_CLIENT
}

/// One segment's worth of encoded audio plus the metadata providers need.
#[derive(Debug, Clone)]
pub struct TranscriptionRequest {
    pub audio: Vec<u8>,
    pub filename: String,
    pub mime_type: String,
    pub sample_rate: u32,
    pub channels: u16,
}

#[async_trait]
pub trait TranscriptionBackend: Send + Sync {
    async fn transcribe(&self, request: &TranscriptionRequest) -> Result<String, PipelineError>;
}

/// Build the backend for the provider selected in this settings snapshot.
pub fn backend_for(settings: &Settings) -> Box<dyn TranscriptionBackend> {
    match settings.provider {
        ProviderKind::OpenAi => Box::new(OpenAiProvider::new(settings.openai.clone())),
        ProviderKind::Volcengine => Box::new(VolcengineProvider::new(settings.volcengine.clone())),
        ProviderKind::Local => Box::new(LocalProvider::new(settings.local.service_url.clone())),
    }
}
