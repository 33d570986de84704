pub mod audio;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod history;
pub mod provider;
pub mod service;
pub mod session;
pub mod settings;
pub mod trigger;

pub use audio::{AudioCapture, AudioSegment, Segmenter, SegmenterConfig};
pub use dispatch::{
    SegmentOutcome, TranscriptAssembler, TranscriptionDispatcher, TranscriptionResult,
};
pub use error::{ErrorKind, PipelineError};
pub use events::{EventBus, PipelineEvent, ServiceProgress, SessionPhase, StatusUpdate};
pub use history::{HistoryItem, HistoryStatus, SegmentRecord};
pub use provider::{TranscriptionBackend, TranscriptionRequest};
pub use service::{LocalServiceManager, ServiceState, ServiceStatus};
pub use session::{SessionController, SessionState};
pub use settings::{Device, LocalModel, ProviderKind, Settings};
pub use trigger::{TriggerMatch, TriggerOutcome, TriggerRule};
