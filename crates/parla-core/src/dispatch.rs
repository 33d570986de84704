//! Provider-agnostic transcription dispatch.
//!
//! Segments are submitted as they are finalized and transcribed
//! concurrently; the capture path is never blocked by provider latency.
//! Completions arrive in arbitrary order and are reassembled into capture
//! order by a per-session reorder buffer.

use crate::audio::{AudioSegment, encode_wav};
use crate::error::{ErrorKind, PipelineError};
use crate::history::SegmentRecord;
use crate::provider::{self, REQUEST_TIMEOUT_SECS, TranscriptionBackend, TranscriptionRequest};
use crate::service::LocalServiceManager;
use crate::settings::{ProviderKind, Settings};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::mpsc;

/// Attempts per segment: the first try plus two retries for transient
/// failures.
pub const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_millis(500);

/// Outcome of one segment's transcription, terminal after retries.
#[derive(Debug, Clone)]
pub enum TranscriptionResult {
    Text(String),
    Failed { kind: ErrorKind, message: String },
}

impl TranscriptionResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, TranscriptionResult::Text(_))
    }
}

impl From<Result<String, PipelineError>> for TranscriptionResult {
    fn from(result: Result<String, PipelineError>) -> Self {
        match result {
            Ok(text) => TranscriptionResult::Text(text),
            Err(err) => TranscriptionResult::Failed {
                kind: err.kind(),
                message: err.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct SegmentOutcome {
    pub sequence: u64,
    pub result: TranscriptionResult,
}

/// Routes segments to the provider configured in the settings snapshot.
#[derive(Clone)]
pub struct TranscriptionDispatcher {
    service: Option<LocalServiceManager>,
}

impl TranscriptionDispatcher {
    pub fn new(service: Option<LocalServiceManager>) -> Self {
        Self { service }
    }

    /// Submit one finalized segment. Never blocks: the outcome is
    /// delivered on `results` once retries are exhausted or the text is
    /// in. The provider options are snapshotted here, so later settings
    /// edits cannot touch this request.
    pub fn submit(
        &self,
        segment: AudioSegment,
        settings: &Settings,
        results: mpsc::UnboundedSender<SegmentOutcome>,
    ) {
        let sequence = segment.sequence;

        // The local provider is only routable while the container service
        // is Running; otherwise fail fast without any network I/O.
        if settings.provider == ProviderKind::Local && !self.local_service_running() {
            let err = PipelineError::ServiceUnavailable(
                "start the local service before transcribing".to_string(),
            );
            let _ = results.send(SegmentOutcome {
                sequence,
                result: TranscriptionResult::Failed {
                    kind: err.kind(),
                    message: err.to_string(),
                },
            });
            return;
        }

        let backend = provider::backend_for(settings);
        tokio::spawn(async move {
            let result = transcribe_segment(backend.as_ref(), &segment).await;
            if let Err(err) = &result {
                tracing::warn!(sequence, "segment transcription failed: {err}");
            }
            let _ = results.send(SegmentOutcome {
                sequence,
                result: result.into(),
            });
        });
    }

    fn local_service_running(&self) -> bool {
        self.service
            .as_ref()
            .map(LocalServiceManager::is_running)
            .unwrap_or(false)
    }
}

async fn transcribe_segment(
    backend: &dyn TranscriptionBackend,
    segment: &AudioSegment,
) -> Result<String, PipelineError> {
    let audio = encode_wav(&segment.samples, segment.sample_rate, segment.channels)?;
    let request = TranscriptionRequest {
        audio,
        filename: format!("segment-{}.wav", segment.sequence),
        mime_type: "audio/wav".to_string(),
        sample_rate: segment.sample_rate,
        channels: segment.channels,
    };
    transcribe_with_retry(backend, &request).await
}

/// Run one request through the retry policy: transient failures back off
/// exponentially up to `MAX_ATTEMPTS`, everything else surfaces
/// immediately.
pub async fn transcribe_with_retry(
    backend: &dyn TranscriptionBackend,
    request: &TranscriptionRequest,
) -> Result<String, PipelineError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let outcome = tokio::time::timeout(
            Duration::from_secs(REQUEST_TIMEOUT_SECS),
            backend.transcribe(request),
        )
        .await;
        let err = match outcome {
            Ok(Ok(text)) => return Ok(text),
            Ok(Err(err)) => err,
            Err(_) => PipelineError::Transient(format!(
                "request timed out after {REQUEST_TIMEOUT_SECS}s"
            )),
        };
        if !err.is_retryable() || attempt >= MAX_ATTEMPTS {
            return Err(err);
        }
        let backoff = BACKOFF_BASE * 2u32.pow(attempt - 1);
        tracing::debug!(attempt, "transient failure, retrying in {backoff:?}: {err}");
        tokio::time::sleep(backoff).await;
    }
}

/// Per-session reorder buffer keyed by sequence number. Out-of-order
/// completions are held until every lower sequence has resolved, then
/// flushed as a contiguous prefix.
#[derive(Default)]
pub struct TranscriptAssembler {
    next: u64,
    pending: BTreeMap<u64, TranscriptionResult>,
    ordered: Vec<(u64, TranscriptionResult)>,
}

impl TranscriptAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one outcome; returns the sequences flushed into order by it.
    pub fn insert(&mut self, outcome: SegmentOutcome) -> Vec<u64> {
        self.pending.insert(outcome.sequence, outcome.result);
        let mut flushed = Vec::new();
        while let Some(result) = self.pending.remove(&self.next) {
            self.ordered.push((self.next, result));
            flushed.push(self.next);
            self.next += 1;
        }
        flushed
    }

    /// True once all issued sequences have resolved in order.
    pub fn is_complete(&self, issued: u64) -> bool {
        self.ordered.len() as u64 == issued && self.pending.is_empty()
    }

    /// Transcript in capture order. Failed segments contribute empty
    /// spans, which are skipped when joining so spacing stays clean.
    pub fn join_transcript(&self) -> String {
        let parts: Vec<&str> = self
            .ordered
            .iter()
            .filter_map(|(_, result)| match result {
                TranscriptionResult::Text(text) => {
                    let trimmed = text.trim();
                    (!trimmed.is_empty()).then_some(trimmed)
                }
                TranscriptionResult::Failed { .. } => None,
            })
            .collect();
        parts.join(" ")
    }

    pub fn segment_records(&self) -> Vec<SegmentRecord> {
        self.ordered
            .iter()
            .map(|(sequence, result)| match result {
                TranscriptionResult::Text(_) => SegmentRecord {
                    sequence: *sequence,
                    ok: true,
                    error: None,
                },
                TranscriptionResult::Failed { message, .. } => SegmentRecord {
                    sequence: *sequence,
                    ok: false,
                    error: Some(message.clone()),
                },
            })
            .collect()
    }

    /// Kinds of the failures recorded so far, for session-level policy.
    pub fn failure_kinds(&self) -> Vec<ErrorKind> {
        self.ordered
            .iter()
            .filter_map(|(_, result)| match result {
                TranscriptionResult::Failed { kind, .. } => Some(*kind),
                TranscriptionResult::Text(_) => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{ContainerRuntime, HealthProbe, RunSpec, ServicePaths, ServiceState};
    use crate::settings::LocalServiceSettings;
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn text(sequence: u64, text: &str) -> SegmentOutcome {
        SegmentOutcome {
            sequence,
            result: TranscriptionResult::Text(text.to_string()),
        }
    }

    #[test]
    fn out_of_order_completions_assemble_in_capture_order() {
        let mut assembler = TranscriptAssembler::new();
        assert!(assembler.insert(text(2, "three")).is_empty());
        assert!(assembler.insert(text(1, "two")).is_empty());
        let flushed = assembler.insert(text(0, "one"));
        assert_eq!(flushed, vec![0, 1, 2]);
        assert!(assembler.is_complete(3));
        assert_eq!(assembler.join_transcript(), "one two three");
    }

    #[test]
    fn contiguous_prefix_flushes_before_the_tail_resolves() {
        let mut assembler = TranscriptAssembler::new();
        assert_eq!(assembler.insert(text(0, "a")), vec![0]);
        assert!(assembler.insert(text(2, "c")).is_empty());
        assert!(!assembler.is_complete(3));
        assert_eq!(assembler.insert(text(1, "b")), vec![1, 2]);
        assert!(assembler.is_complete(3));
    }

    #[test]
    fn failed_segments_become_empty_spans() {
        let mut assembler = TranscriptAssembler::new();
        assembler.insert(text(0, "start"));
        assembler.insert(SegmentOutcome {
            sequence: 1,
            result: TranscriptionResult::Failed {
                kind: ErrorKind::Transient,
                message: "timeout".to_string(),
            },
        });
        assembler.insert(text(2, "end"));
        assert_eq!(assembler.join_transcript(), "start end");

        let records = assembler.segment_records();
        assert_eq!(records.len(), 3);
        assert!(records[0].ok);
        assert!(!records[1].ok);
        assert_eq!(records[1].error.as_deref(), Some("timeout"));
        assert!(records[2].ok);
    }

    struct ScriptedBackend {
        attempts: AtomicU32,
        failures_before_success: u32,
        kind: ErrorKind,
    }

    impl ScriptedBackend {
        fn failing(kind: ErrorKind, failures_before_success: u32) -> Self {
            Self {
                attempts: AtomicU32::new(0),
                failures_before_success,
                kind,
            }
        }

        fn attempts(&self) -> u32 {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl crate::provider::TranscriptionBackend for ScriptedBackend {
        async fn transcribe(
            &self,
            _request: &TranscriptionRequest,
        ) -> Result<String, PipelineError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failures_before_success {
                return Err(match self.kind {
                    ErrorKind::Validation => {
                        PipelineError::Validation("bad credentials".to_string())
                    }
                    _ => PipelineError::Transient("connection reset".to_string()),
                });
            }
            Ok("recovered".to_string())
        }
    }

    fn request() -> TranscriptionRequest {
        TranscriptionRequest {
            audio: vec![0u8; 16],
            filename: "segment-0.wav".to_string(),
            mime_type: "audio/wav".to_string(),
            sample_rate: 16_000,
            channels: 1,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_is_retried_then_succeeds() {
        let backend = ScriptedBackend::failing(ErrorKind::Transient, 2);
        let result = transcribe_with_retry(&backend, &request()).await.unwrap();
        assert_eq!(result, "recovered");
        assert_eq!(backend.attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_surfaces_after_the_retry_bound() {
        let backend = ScriptedBackend::failing(ErrorKind::Transient, u32::MAX);
        let err = transcribe_with_retry(&backend, &request()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert_eq!(backend.attempts(), MAX_ATTEMPTS);
    }

    #[tokio::test(start_paused = true)]
    async fn validation_failure_is_never_retried() {
        let backend = ScriptedBackend::failing(ErrorKind::Validation, u32::MAX);
        let err = transcribe_with_retry(&backend, &request()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(backend.attempts(), 1);
    }

    struct InertRuntime;

    #[async_trait]
    impl ContainerRuntime for InertRuntime {
        async fn engine_available(&self) -> Result<(), PipelineError> {
            Ok(())
        }
        async fn gpu_available(&self) -> bool {
            false
        }
        async fn image_exists(&self, _tag: &str) -> bool {
            true
        }
        async fn build_image(
            &self,
            _tag: &str,
            _context_dir: &std::path::Path,
            _on_line: crate::service::container::LineSink<'_>,
        ) -> Result<(), PipelineError> {
            Ok(())
        }
        async fn pull_image(
            &self,
            _tag: &str,
            _on_line: crate::service::container::LineSink<'_>,
        ) -> Result<(), PipelineError> {
            Ok(())
        }
        async fn run_to_completion(
            &self,
            _spec: &RunSpec,
            _on_line: crate::service::container::LineSink<'_>,
        ) -> Result<(), PipelineError> {
            Ok(())
        }
        async fn run_detached(&self, _spec: &RunSpec) -> Result<(), PipelineError> {
            Ok(())
        }
        async fn stop_and_remove(&self, _name: &str) -> Result<(), PipelineError> {
            Ok(())
        }
        async fn is_running(&self, _name: &str) -> Result<bool, PipelineError> {
            Ok(false)
        }
    }

    struct NeverHealthy;

    #[async_trait]
    impl HealthProbe for NeverHealthy {
        async fn healthy(&self, _service_url: &str) -> bool {
            false
        }
    }

    #[tokio::test(start_paused = true)]
    async fn local_provider_fails_fast_while_service_is_stopped() {
        let config = LocalServiceSettings {
            installed: true,
            ..LocalServiceSettings::default()
        };
        let manager = LocalServiceManager::spawn(
            config,
            Arc::new(InertRuntime),
            Arc::new(NeverHealthy),
            ServicePaths::in_dir(std::env::temp_dir().join("parla-dispatch-test")),
            crate::events::EventBus::new(),
        );
        assert_eq!(manager.current_state(), ServiceState::Stopped);

        let dispatcher = TranscriptionDispatcher::new(Some(manager));
        let mut settings = Settings::default();
        settings.provider = ProviderKind::Local;

        let segment = AudioSegment {
            sequence: 0,
            samples: vec![0i16; 160],
            sample_rate: 16_000,
            channels: 1,
            started_at: Duration::ZERO,
        };
        let (results_tx, mut results_rx) = mpsc::unbounded_channel();
        dispatcher.submit(segment, &settings, results_tx);

        // The outcome is delivered synchronously by submit(): no task was
        // spawned and no HTTP request went out.
        let outcome = results_rx.try_recv().expect("immediate outcome");
        match outcome.result {
            TranscriptionResult::Failed { kind, .. } => {
                assert_eq!(kind, ErrorKind::ServiceUnavailable)
            }
            TranscriptionResult::Text(_) => panic!("expected failure"),
        }
    }
}
