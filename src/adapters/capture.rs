//! Fresh-capture requests to the audio/frame capture pipeline.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{EntryPayload, FrameEvidence, NoteId, SessionId, TranscriptEvidence};

/// What the escalation ladder asks the capture pipeline for
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureRequest {
    pub session_id: SessionId,
    pub note_id: NoteId,
    pub timestamp_seconds: f64,
    pub window_seconds: f64,
}

/// Evidence returned by a capture
#[derive(Debug, Clone, PartialEq)]
pub enum Captured {
    Transcript(TranscriptEvidence),
    Frame(FrameEvidence),
}

impl Captured {
    pub fn into_payload(self) -> EntryPayload {
        match self {
            Captured::Transcript(t) => EntryPayload::EvidenceTranscript(t),
            Captured::Frame(f) => EntryPayload::EvidenceFrame(f),
        }
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("Capture unavailable: {0}")]
    Unavailable(String),

    #[error("Capture failed: {0}")]
    Failed(String),
}

#[async_trait]
pub trait CaptureRequester: Send + Sync {
    async fn request_capture(&self, request: &CaptureRequest) -> Result<Vec<Captured>, CaptureError>;
}

/// Used when no capture pipeline is attached
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCapture;

#[async_trait]
impl CaptureRequester for NoCapture {
    async fn request_capture(&self, request: &CaptureRequest) -> Result<Vec<Captured>, CaptureError> {
        Err(CaptureError::Unavailable(format!(
            "no capture pipeline attached for session {}",
            request.session_id
        )))
    }
}
