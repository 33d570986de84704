//! Settings snapshot consumed by the pipeline.
//!
//! The UI owns editing; the core reads an immutable snapshot at dispatch
//! time so concurrent edits never mutate an in-flight request.

use crate::error::PipelineError;
use crate::trigger::TriggerRule;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use url::Url;

const SETTINGS_FILE: &str = "settings.json";

/// Available transcription providers
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    OpenAi,
    Volcengine,
    Local,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Volcengine => "volcengine",
            ProviderKind::Local => "local",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "OpenAI",
            ProviderKind::Volcengine => "Volcengine",
            ProviderKind::Local => "Local service",
        }
    }

    pub fn all() -> &'static [ProviderKind] {
        &[
            ProviderKind::OpenAi,
            ProviderKind::Volcengine,
            ProviderKind::Local,
        ]
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(ProviderKind::OpenAi),
            "volcengine" => Ok(ProviderKind::Volcengine),
            "local" | "sensevoice" => Ok(ProviderKind::Local),
            _ => Err(format!(
                "Unknown provider: {s}. Available: openai, volcengine, local"
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default)]
    pub provider: ProviderKind,
    #[serde(default)]
    pub recording: RecordingSettings,
    #[serde(default)]
    pub openai: OpenAiSettings,
    #[serde(default)]
    pub volcengine: VolcengineSettings,
    #[serde(default)]
    pub local: LocalServiceSettings,
    #[serde(default = "TriggerRule::defaults")]
    pub triggers: Vec<TriggerRule>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            provider: ProviderKind::default(),
            recording: RecordingSettings::default(),
            openai: OpenAiSettings::default(),
            volcengine: VolcengineSettings::default(),
            local: LocalServiceSettings::default(),
            triggers: TriggerRule::defaults(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingSettings {
    /// Seconds of audio per segment handed to transcription.
    pub segment_seconds: u64,
}

impl Default for RecordingSettings {
    fn default() -> Self {
        Self { segment_seconds: 60 }
    }
}

impl RecordingSettings {
    /// Segment duration with the lower bound applied.
    pub fn effective_segment_seconds(&self) -> u64 {
        self.segment_seconds.max(1)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenAiSettings {
    pub api_base: String,
    pub api_key: String,
    pub model: String,
    pub language: String,
    pub prompt: String,
    pub response_format: String,
    pub temperature: f32,
    pub stream: bool,
}

impl Default for OpenAiSettings {
    fn default() -> Self {
        Self {
            api_base: "https://api.openai.com/v1".to_string(),
            api_key: String::new(),
            model: "gpt-4o-transcribe".to_string(),
            language: String::new(),
            prompt: String::new(),
            response_format: "json".to_string(),
            temperature: 0.0,
            stream: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolcengineSettings {
    pub app_id: String,
    pub access_token: String,
    pub language: String,
    pub use_streaming: bool,
    pub use_fast: bool,
}

impl Default for VolcengineSettings {
    fn default() -> Self {
        Self {
            app_id: String::new(),
            access_token: String::new(),
            language: "zh-CN".to_string(),
            use_streaming: false,
            use_fast: false,
        }
    }
}

/// Model identities the local container service can host.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum LocalModel {
    #[default]
    SenseVoice,
    Voxtral,
}

impl LocalModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LocalModel::SenseVoice => "sense-voice",
            LocalModel::Voxtral => "voxtral",
        }
    }

    /// Some models only run on a CUDA accelerator.
    pub fn requires_cuda(&self) -> bool {
        matches!(self, LocalModel::Voxtral)
    }

    pub fn default_model_id(&self) -> &'static str {
        match self {
            LocalModel::SenseVoice => "iic/SenseVoiceSmall",
            LocalModel::Voxtral => "mistralai/Voxtral-Mini-3B-2507",
        }
    }
}

impl fmt::Display for LocalModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for LocalModel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sense-voice" | "sensevoice" => Ok(LocalModel::SenseVoice),
            "voxtral" => Ok(LocalModel::Voxtral),
            _ => Err(format!(
                "Unknown local model: {s}. Available: sense-voice, voxtral"
            )),
        }
    }
}

/// Inference device selection for the local service.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    #[default]
    Auto,
    Cpu,
    Cuda,
}

impl Device {
    pub fn as_str(&self) -> &'static str {
        match self {
            Device::Auto => "auto",
            Device::Cpu => "cpu",
            Device::Cuda => "cuda",
        }
    }
}

impl std::str::FromStr for Device {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(Device::Auto),
            "cpu" => Ok(Device::Cpu),
            "cuda" => Ok(Device::Cuda),
            _ => Err(format!("Unknown device: {s}. Available: auto, cpu, cuda")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalServiceSettings {
    pub service_url: String,
    pub model: LocalModel,
    pub model_id: String,
    pub device: Device,
    /// Whether the image and weights have been downloaded. The running
    /// state is never persisted; the service always starts stopped.
    pub installed: bool,
}

impl Default for LocalServiceSettings {
    fn default() -> Self {
        Self {
            service_url: "http://127.0.0.1:8765".to_string(),
            model: LocalModel::default(),
            model_id: LocalModel::default().default_model_id().to_string(),
            device: Device::default(),
            installed: false,
        }
    }
}

impl LocalServiceSettings {
    pub fn validate(&self) -> Result<(), PipelineError> {
        let trimmed = self.service_url.trim();
        if trimmed.is_empty() {
            return Err(PipelineError::Validation(
                "local service URL must not be empty".to_string(),
            ));
        }
        let parsed = Url::parse(trimmed).map_err(|err| {
            PipelineError::Validation(format!("invalid local service URL: {err}"))
        })?;
        if parsed.host_str().is_none() {
            return Err(PipelineError::Validation(
                "local service URL is missing a host".to_string(),
            ));
        }
        if parsed.port_or_known_default().is_none() {
            return Err(PipelineError::Validation(
                "local service URL is missing a port".to_string(),
            ));
        }
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(PipelineError::Validation(
                "local service URL must use http or https".to_string(),
            ));
        }
        if self.model_id.trim().is_empty() {
            return Err(PipelineError::Validation(
                "local model id must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

impl Settings {
    /// Validate the whole snapshot before persisting.
    pub fn validate(&self) -> Result<(), PipelineError> {
        TriggerRule::validate_all(&self.triggers)?;
        self.local.validate()?;
        Ok(())
    }

    fn path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("parla").join(SETTINGS_FILE))
    }

    /// Load settings from the config directory, falling back to defaults
    /// when the file is absent or unreadable.
    pub fn load() -> Self {
        let Some(path) = Self::path() else {
            return Self::default();
        };
        match std::fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|err| {
                tracing::warn!("failed to parse {}: {err}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    pub fn save(&self) -> Result<(), PipelineError> {
        self.validate()?;
        let path = Self::path().ok_or_else(|| {
            PipelineError::Validation("could not resolve config directory".to_string())
        })?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|err| PipelineError::Validation(err.to_string()))?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|err| PipelineError::Validation(err.to_string()))?;
        std::fs::write(&path, json).map_err(|err| PipelineError::Validation(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_pass_validation() {
        Settings::default().validate().unwrap();
    }

    #[test]
    fn service_url_without_scheme_is_rejected() {
        let mut settings = Settings::default();
        settings.local.service_url = "127.0.0.1:8765".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn service_url_with_ftp_scheme_is_rejected() {
        let mut local = LocalServiceSettings::default();
        local.service_url = "ftp://127.0.0.1:8765".to_string();
        assert!(local.validate().is_err());
    }

    #[test]
    fn settings_round_trip_through_json() {
        let mut settings = Settings::default();
        settings.provider = ProviderKind::Volcengine;
        settings.recording.segment_seconds = 10;
        settings.local.model = LocalModel::Voxtral;

        let json = serde_json::to_string_pretty(&settings).unwrap();
        let parsed: Settings = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.provider, ProviderKind::Volcengine);
        assert_eq!(parsed.recording.segment_seconds, 10);
        assert_eq!(parsed.local.model, LocalModel::Voxtral);
        assert_eq!(parsed.triggers.len(), settings.triggers.len());
    }

    #[test]
    fn provider_round_trips_through_str() {
        for provider in ProviderKind::all() {
            assert_eq!(provider.as_str().parse::<ProviderKind>().ok(), Some(*provider));
        }
    }

    #[test]
    fn voxtral_is_cuda_bound() {
        assert!(LocalModel::Voxtral.requires_cuda());
        assert!(!LocalModel::SenseVoice.requires_cuda());
    }

    #[test]
    fn segment_seconds_lower_bound() {
        let recording = RecordingSettings { segment_seconds: 0 };
        assert_eq!(recording.effective_segment_seconds(), 1);
    }
}
