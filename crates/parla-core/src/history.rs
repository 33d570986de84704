//! Append-only history records, one per completed session attempt.

use crate::trigger::TriggerMatch;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HistoryStatus {
    Success,
    Failed,
}

/// How each segment of the session fared. Failed segments contribute an
/// empty span to the joined transcript but stay inspectable here.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentRecord {
    pub sequence: u64,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Never mutated after creation; persistence is the boundary's concern.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryItem {
    pub id: Uuid,
    pub session: Uuid,
    pub timestamp: DateTime<Utc>,
    pub status: HistoryStatus,
    /// Raw transcript, segments joined in capture order.
    pub transcript: String,
    /// Post-trigger text: the first matching rule's instantiated template,
    /// or the raw transcript when nothing matched.
    pub final_text: String,
    pub matches: Vec<TriggerMatch>,
    pub segments: Vec<SegmentRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HistoryItem {
    pub fn success(
        session: Uuid,
        transcript: String,
        final_text: String,
        matches: Vec<TriggerMatch>,
        segments: Vec<SegmentRecord>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            session,
            timestamp: Utc::now(),
            status: HistoryStatus::Success,
            transcript,
            final_text,
            matches,
            segments,
            error: None,
        }
    }

    pub fn failed(session: Uuid, error: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            session,
            timestamp: Utc::now(),
            status: HistoryStatus::Failed,
            transcript: String::new(),
            final_text: String::new(),
            matches: Vec::new(),
            segments: Vec::new(),
            error: Some(error),
        }
    }
}
