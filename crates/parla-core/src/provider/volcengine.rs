//! Volcengine speech recognition.
//!
//! Two modes share app-id/token auth: one-shot file recognition over HTTP
//! POST, and chunked streaming recognition over WebSocket when
//! `use_streaming` is set.

use super::{TranscriptionBackend, TranscriptionRequest, http_client};
use crate::error::PipelineError;
use crate::settings::VolcengineSettings;
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

const FILE_ASR_URL: &str = "https://openspeech.bytedance.com/api/v1/auc";
const FILE_CLUSTER: &str = "volcengine_input_common";

#[cfg(feature = "volcengine-streaming")]
const STREAMING_ASR_URL: &str = "wss://openspeech.bytedance.com/api/v1/asr";
#[cfg(feature = "volcengine-streaming")]
const STREAMING_CLUSTER: &str = "volcengine_streaming_common";

#[derive(Serialize)]
struct FileAsrRequest {
    app: AppInfo,
    user: UserInfo,
    audio: AudioInfo,
    request: RequestInfo,
}

#[derive(Serialize)]
struct AppInfo {
    appid: String,
    cluster: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    token: Option<String>,
}

#[derive(Serialize)]
struct UserInfo {
    uid: String,
}

#[derive(Serialize)]
struct AudioInfo {
    data: String,
    format: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    rate: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    language: Option<String>,
}

#[derive(Serialize)]
struct RequestInfo {
    sequence: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<String>,
}

#[derive(Deserialize)]
struct FileAsrResponse {
    code: i32,
    message: String,
    #[serde(default)]
    result: Option<String>,
}

pub struct VolcengineProvider {
    options: VolcengineSettings,
}

impl VolcengineProvider {
    pub fn new(options: VolcengineSettings) -> Self {
        Self { options }
    }

    fn ensure_config(&self) -> Result<(), PipelineError> {
        if self.options.app_id.trim().is_empty() {
            return Err(PipelineError::Validation(
                "Volcengine app id is not configured".to_string(),
            ));
        }
        if self.options.access_token.trim().is_empty() {
            return Err(PipelineError::Validation(
                "Volcengine access token is not configured".to_string(),
            ));
        }
        Ok(())
    }

    async fn transcribe_file(&self, request: &TranscriptionRequest) -> Result<String, PipelineError> {
        let payload = FileAsrRequest {
            app: AppInfo {
                appid: self.options.app_id.clone(),
                cluster: FILE_CLUSTER.to_string(),
                token: Some(self.options.access_token.clone()),
            },
            user: UserInfo {
                uid: "parla".to_string(),
            },
            audio: AudioInfo {
                data: BASE64.encode(&request.audio),
                format: "wav".to_string(),
                rate: Some(request.sample_rate),
                language: Some(self.options.language.clone()),
            },
            request: RequestInfo {
                sequence: 1,
                version: self.options.use_fast.then(|| "fast".to_string()),
            },
        };

        let response = http_client()
            .post(FILE_ASR_URL)
            .header(
                "Authorization",
                format!("Bearer;{}", self.options.access_token),
            )
            .json(&payload)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::from_status(status, body));
        }

        let data: FileAsrResponse = response
            .json()
            .await
            .map_err(|err| PipelineError::Transient(format!("response parse: {err}")))?;
        if data.code != 0 {
            return Err(PipelineError::Validation(format!(
                "Volcengine error {}: {}",
                data.code, data.message
            )));
        }
        Ok(data.result.unwrap_or_default())
    }
}

#[async_trait]
impl TranscriptionBackend for VolcengineProvider {
    async fn transcribe(&self, request: &TranscriptionRequest) -> Result<String, PipelineError> {
        self.ensure_config()?;
        #[cfg(feature = "volcengine-streaming")]
        if self.options.use_streaming {
            return streaming::transcribe(&self.options, request).await;
        }
        self.transcribe_file(request).await
    }
}

#[cfg(feature = "volcengine-streaming")]
mod streaming {
    use super::*;
    use base64::Engine as _;
    use futures_util::{SinkExt, StreamExt};
    use serde_json::{Value, json};
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::Message;

    /// Chunked recognition over WebSocket: handshake, ~100ms audio chunks,
    /// then result frames until `is_last`.
    pub(super) async fn transcribe(
        options: &VolcengineSettings,
        request: &TranscriptionRequest,
    ) -> Result<String, PipelineError> {
        let (mut socket, _response) = connect_async(STREAMING_ASR_URL)
            .await
            .map_err(|err| PipelineError::Transient(format!("websocket connect: {err}")))?;

        let handshake = build_handshake(options, request);
        socket
            .send(Message::text(handshake))
            .await
            .map_err(|err| PipelineError::Transient(format!("websocket send: {err}")))?;

        let reply = socket
            .next()
            .await
            .ok_or_else(|| PipelineError::Transient("websocket closed during handshake".to_string()))?
            .map_err(|err| PipelineError::Transient(format!("websocket read: {err}")))?;
        if let Message::Text(text) = reply {
            let value: Value = serde_json::from_str(&text)
                .map_err(|err| PipelineError::Transient(format!("handshake parse: {err}")))?;
            if value.get("code").and_then(Value::as_i64).unwrap_or(-1) != 0 {
                let message = value
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("handshake rejected");
                return Err(PipelineError::Validation(message.to_string()));
            }
        }

        let chunk_size = chunk_size_for(request);
        let mut offset = 0;
        let mut sequence = 1;
        while offset < request.audio.len() {
            let end = (offset + chunk_size).min(request.audio.len());
            let is_last = end >= request.audio.len();
            let message = json!({
                "audio": { "data": BASE64.encode(&request.audio[offset..end]) },
                "request": { "sequence": sequence, "is_last": is_last },
            });
            socket
                .send(Message::text(message.to_string()))
                .await
                .map_err(|err| PipelineError::Transient(format!("websocket send: {err}")))?;
            offset = end;
            sequence += 1;
        }

        let mut final_text = String::new();
        while let Some(message) = socket.next().await {
            let message =
                message.map_err(|err| PipelineError::Transient(format!("websocket read: {err}")))?;
            match message {
                Message::Text(text) => {
                    let value: Value = serde_json::from_str(&text)
                        .map_err(|err| PipelineError::Transient(format!("result parse: {err}")))?;
                    if let Some(code) = value.get("code").and_then(Value::as_i64) {
                        if code != 0 {
                            let message = value
                                .get("message")
                                .and_then(Value::as_str)
                                .unwrap_or("recognition error");
                            return Err(PipelineError::Transient(message.to_string()));
                        }
                    }
                    if let Some(result) = value.get("result").and_then(Value::as_str) {
                        final_text = result.to_string();
                    }
                    if value.get("is_last").and_then(Value::as_bool).unwrap_or(false) {
                        break;
                    }
                }
                Message::Close(_) => break,
                _ => continue,
            }
        }

        let _ = socket.close(None).await;
        Ok(final_text)
    }

    fn build_handshake(options: &VolcengineSettings, request: &TranscriptionRequest) -> String {
        json!({
            "app": {
                "appid": options.app_id,
                "cluster": STREAMING_CLUSTER,
                "token": options.access_token,
            },
            "user": { "uid": "parla" },
            "request": {
                "reqid": uuid::Uuid::new_v4().simple().to_string(),
                "workflow": "audio_in,resample,partition,vad,fe,decode,itn,nlu_punctuate",
                "sequence": 1,
                "nbest": 1,
                "show_utterances": true,
            },
            "audio": {
                "format": "wav",
                "rate": request.sample_rate,
                "language": options.language,
                "bits": 16,
                "channel": request.channels,
                "codec": "raw",
            },
            "additions": { "use_fast": options.use_fast },
        })
        .to_string()
    }

    /// Roughly 100ms of audio per frame.
    fn chunk_size_for(request: &TranscriptionRequest) -> usize {
        let bytes_per_second =
            request.sample_rate as usize * request.channels as usize * 2;
        (bytes_per_second / 10).max(3200)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_credentials_fail_validation() {
        let provider = VolcengineProvider::new(VolcengineSettings::default());
        let err = provider.ensure_config().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
    }

    #[test]
    fn non_zero_response_code_maps_to_error() {
        let body = r#"{"code": 1001, "message": "invalid token"}"#;
        let parsed: FileAsrResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.code, 1001);
        assert!(parsed.result.is_none());
    }

    #[test]
    fn fast_version_is_only_sent_when_enabled() {
        let mut options = VolcengineSettings::default();
        options.use_fast = true;
        let request = RequestInfo {
            sequence: 1,
            version: options.use_fast.then(|| "fast".to_string()),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["version"], "fast");

        let request = RequestInfo {
            sequence: 1,
            version: None,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert!(value.get("version").is_none());
    }
}
