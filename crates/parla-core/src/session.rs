//! Push-to-talk session control.
//!
//! One session spans shortcut press to release. Frames stream off the
//! capture thread into the segmenter; finalized segments are dispatched
//! immediately, so transcription overlaps recording. On release the
//! session moves to `Finalizing` and resolves in the background; a new
//! press may start an independent session while the previous one's tail
//! is still resolving.

use crate::audio::{AudioCapture, AudioSegment, Segmenter, SegmenterConfig};
use crate::dispatch::{SegmentOutcome, TranscriptAssembler, TranscriptionDispatcher};
use crate::error::PipelineError;
use crate::events::{EventBus, PipelineEvent, SessionPhase};
use crate::history::HistoryItem;
use crate::settings::Settings;
use crate::trigger;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Capture-side state of the controller. `Finalizing` reflects the most
/// recent session; earlier sessions may still be resolving their tails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Recording,
    Finalizing,
    Aborting,
}

struct ActiveSession {
    id: Uuid,
    cancelled: Arc<AtomicBool>,
}

struct ControllerInner {
    state: SessionState,
    active: Option<ActiveSession>,
    /// Session whose finalizer owns the return to `Idle`.
    finalizing: Option<Uuid>,
}

pub struct SessionController {
    capture: AudioCapture,
    dispatcher: TranscriptionDispatcher,
    events: EventBus,
    runtime: tokio::runtime::Handle,
    inner: Arc<Mutex<ControllerInner>>,
}

impl SessionController {
    /// Must be called within a tokio runtime; session tasks are spawned
    /// onto it.
    pub fn new(
        capture: AudioCapture,
        dispatcher: TranscriptionDispatcher,
        events: EventBus,
    ) -> Self {
        Self {
            capture,
            dispatcher,
            events,
            runtime: tokio::runtime::Handle::current(),
            inner: Arc::new(Mutex::new(ControllerInner {
                state: SessionState::Idle,
                active: None,
                finalizing: None,
            })),
        }
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().unwrap().state
    }

    /// Shortcut pressed. Starts a session unless one is already
    /// recording; a session still finalizing does not block a new one.
    pub fn press(&self, settings: Settings) -> Result<Option<Uuid>, PipelineError> {
        if self.inner.lock().unwrap().active.is_some() {
            // Re-entrant press while recording: no nested sessions.
            return Ok(None);
        }

        let id = Uuid::new_v4();
        let stream = match self.capture.start() {
            Ok(stream) => stream,
            Err(err) => {
                // Device failure is fatal to the session: no segments, no
                // partial transcript, a failed history record right away.
                self.events
                    .emit_status(id, SessionPhase::Error, Some(err.to_string()));
                self.events
                    .emit(PipelineEvent::History(HistoryItem::failed(id, err.to_string())));
                return Err(err);
            }
        };

        let cancelled = Arc::new(AtomicBool::new(false));
        {
            let mut inner = self.inner.lock().unwrap();
            inner.state = SessionState::Recording;
            inner.active = Some(ActiveSession {
                id,
                cancelled: Arc::clone(&cancelled),
            });
        }
        self.events.emit_status(id, SessionPhase::Recording, None);
        tracing::info!(session = %id, "recording started");

        let segmenter = Segmenter::new(SegmenterConfig {
            segment_seconds: settings.recording.effective_segment_seconds(),
            sample_rate: stream.sample_rate,
            channels: stream.channels,
        });
        let (segment_tx, segment_rx) = mpsc::unbounded_channel();

        // Pump: blocking reads off the capture queue, segment emission on
        // threshold. Ends when capture stops and the queue disconnects.
        let frames = stream.frames;
        let pump_cancelled = Arc::clone(&cancelled);
        self.runtime.spawn_blocking(move || {
            let mut segmenter = segmenter;
            while let Ok(frame) = frames.recv() {
                if pump_cancelled.load(Ordering::Relaxed) {
                    continue;
                }
                for segment in segmenter.push(&frame) {
                    if segment_tx.send(segment).is_err() {
                        return;
                    }
                }
            }
            // Flush the short tail segment, unless the session was
            // explicitly aborted.
            if !pump_cancelled.load(Ordering::Relaxed) {
                if let Some(tail) = segmenter.finish() {
                    let _ = segment_tx.send(tail);
                }
            }
        });

        self.runtime.spawn(run_session(
            id,
            settings,
            segment_rx,
            self.dispatcher.clone(),
            self.events.clone(),
            Arc::clone(&self.inner),
        ));

        Ok(Some(id))
    }

    /// Shortcut released. Stops capture and flushes the tail segment; the
    /// session resolves in the background.
    pub fn release(&self) {
        let id = {
            let mut inner = self.inner.lock().unwrap();
            let Some(active) = inner.active.take() else {
                return;
            };
            inner.state = SessionState::Finalizing;
            inner.finalizing = Some(active.id);
            active.id
        };
        self.capture.stop();
        tracing::info!(session = %id, "recording stopped, finalizing");
    }

    /// Explicit cancel: pending capture is discarded, but segments
    /// already dispatched complete naturally so history stays accurate.
    pub fn cancel(&self) {
        let id = {
            let mut inner = self.inner.lock().unwrap();
            let Some(active) = inner.active.take() else {
                return;
            };
            active.cancelled.store(true, Ordering::Relaxed);
            inner.state = SessionState::Aborting;
            inner.finalizing = Some(active.id);
            active.id
        };
        self.capture.stop();
        tracing::info!(session = %id, "recording aborted");
    }
}

/// Drive one session from its segment stream to its history record.
async fn run_session(
    id: Uuid,
    settings: Settings,
    mut segment_rx: mpsc::UnboundedReceiver<AudioSegment>,
    dispatcher: TranscriptionDispatcher,
    events: EventBus,
    controller: Arc<Mutex<ControllerInner>>,
) {
    let item = finalize_session(id, &settings, &mut segment_rx, &dispatcher, &events).await;
    events.emit(PipelineEvent::History(item));

    let mut inner = controller.lock().unwrap();
    if inner.finalizing == Some(id) {
        inner.finalizing = None;
        if matches!(inner.state, SessionState::Finalizing | SessionState::Aborting) {
            inner.state = SessionState::Idle;
        }
    }
}

/// Submit every segment, wait for all outcomes, assemble in capture order
/// and resolve triggers. Separated from the task wrapper so the whole
/// pipeline can be exercised in tests without a microphone.
async fn finalize_session(
    id: Uuid,
    settings: &Settings,
    segment_rx: &mut mpsc::UnboundedReceiver<AudioSegment>,
    dispatcher: &TranscriptionDispatcher,
    events: &EventBus,
) -> HistoryItem {
    let (results_tx, mut results_rx) = mpsc::unbounded_channel::<SegmentOutcome>();

    let mut issued: u64 = 0;
    while let Some(segment) = segment_rx.recv().await {
        issued += 1;
        dispatcher.submit(segment, settings, results_tx.clone());
    }
    // Capture has stopped; everything issued is now in flight.
    drop(results_tx);

    if issued == 0 {
        // Nothing was captured: no request dispatched, session closes
        // clean with an empty record.
        events.emit_status(id, SessionPhase::Completed, None);
        return HistoryItem::success(id, String::new(), String::new(), Vec::new(), Vec::new());
    }

    events.emit_status(id, SessionPhase::Transcribing, None);

    // The result channel closes once the last in-flight request resolves.
    let mut assembler = TranscriptAssembler::new();
    while let Some(outcome) = results_rx.recv().await {
        assembler.insert(outcome);
    }
    debug_assert!(assembler.is_complete(issued));

    let transcript = assembler.join_transcript();
    let records = assembler.segment_records();
    let all_failed = records.iter().all(|record| !record.ok);

    if all_failed {
        let message = records
            .iter()
            .find_map(|record| record.error.clone())
            .unwrap_or_else(|| "transcription failed".to_string());
        events.emit_status(id, SessionPhase::Error, Some(message.clone()));
        let mut item = HistoryItem::failed(id, message);
        item.segments = records;
        return item;
    }

    let outcome = if transcript.is_empty() {
        trigger::TriggerOutcome {
            final_text: String::new(),
            matches: Vec::new(),
        }
    } else {
        trigger::resolve(&transcript, &settings.triggers)
    };
    tracing::info!(session = %id, matches = outcome.matches.len(), "session completed");
    events.emit_status(id, SessionPhase::Completed, None);
    HistoryItem::success(id, transcript, outcome.final_text, outcome.matches, records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::HistoryStatus;
    use crate::settings::ProviderKind;
    use std::time::Duration;

    fn segment(sequence: u64) -> AudioSegment {
        AudioSegment {
            sequence,
            samples: vec![0i16; 160],
            sample_rate: 16_000,
            channels: 1,
            started_at: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn zero_segments_close_with_an_empty_success_record() {
        let events = EventBus::new();
        let dispatcher = TranscriptionDispatcher::new(None);
        let (segment_tx, mut segment_rx) = mpsc::unbounded_channel::<AudioSegment>();
        drop(segment_tx);

        let id = Uuid::new_v4();
        let item = finalize_session(
            id,
            &Settings::default(),
            &mut segment_rx,
            &dispatcher,
            &events,
        )
        .await;

        assert_eq!(item.status, HistoryStatus::Success);
        assert!(item.transcript.is_empty());
        assert!(item.final_text.is_empty());
        assert!(item.segments.is_empty());
    }

    #[tokio::test]
    async fn all_segments_failing_produces_a_failed_record() {
        let events = EventBus::new();
        // No service manager handle: the local provider is unroutable and
        // every segment fails fast with ServiceUnavailable.
        let dispatcher = TranscriptionDispatcher::new(None);
        let mut settings = Settings::default();
        settings.provider = ProviderKind::Local;

        let (segment_tx, mut segment_rx) = mpsc::unbounded_channel();
        segment_tx.send(segment(0)).unwrap();
        segment_tx.send(segment(1)).unwrap();
        drop(segment_tx);

        let id = Uuid::new_v4();
        let item = finalize_session(id, &settings, &mut segment_rx, &dispatcher, &events).await;

        assert_eq!(item.status, HistoryStatus::Failed);
        assert_eq!(item.segments.len(), 2);
        assert!(item.segments.iter().all(|record| !record.ok));
        assert!(item.error.is_some());
    }

    #[tokio::test]
    async fn failed_session_still_emits_status_events() {
        let events = EventBus::new();
        let mut receiver = events.subscribe();
        let dispatcher = TranscriptionDispatcher::new(None);
        let mut settings = Settings::default();
        settings.provider = ProviderKind::Local;

        let (segment_tx, mut segment_rx) = mpsc::unbounded_channel();
        segment_tx.send(segment(0)).unwrap();
        drop(segment_tx);

        let id = Uuid::new_v4();
        let _ = finalize_session(id, &settings, &mut segment_rx, &dispatcher, &events).await;

        let mut phases = Vec::new();
        while let Ok(event) = receiver.try_recv() {
            if let PipelineEvent::Status(update) = event {
                phases.push(update.phase);
            }
        }
        assert_eq!(phases, vec![SessionPhase::Transcribing, SessionPhase::Error]);
    }
}
