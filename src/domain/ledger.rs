//! Ledger entries: the immutable, hash-chained facts of a session.
//!
//! Every change in the system is recorded as a [`LedgerEntry`]. Entries are
//! content-addressed: `payload_hash` covers the typed payload and
//! `entry_hash` covers the whole entry, including the `prev_hash` link to
//! the entry before it in the same session.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// `prev_hash` of the first entry in every session chain.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Identifier of a viewing session (one ledger chain per session)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier of a note, stable across replays
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NoteId(String);

impl NoteId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive the id of a note from the evidence entry that created it.
    ///
    /// First 12 hex chars of sha256("{session_id}:{sequence}").
    pub fn derive(session_id: &SessionId, evidence_sequence: u64) -> Self {
        let digest = compute_hash(format!("{}:{}", session_id, evidence_sequence).as_bytes());
        Self(digest[..12].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of a ledger entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    EvidenceTranscript,
    EvidenceFrame,
    NoteCreated,
    NoteRevision,
    ContextRequest,
    RetryCapture,
    EscalationResolved,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::EvidenceTranscript => "evidence_transcript",
            EntryKind::EvidenceFrame => "evidence_frame",
            EntryKind::NoteCreated => "note_created",
            EntryKind::NoteRevision => "note_revision",
            EntryKind::ContextRequest => "context_request",
            EntryKind::RetryCapture => "retry_capture",
            EntryKind::EscalationResolved => "escalation_resolved",
        }
    }

    /// Evidence entries trigger backfill reconciliation
    pub fn is_evidence(&self) -> bool {
        matches!(self, EntryKind::EvidenceTranscript | EntryKind::EvidenceFrame)
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A half-open window into the video, in seconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: f64,
    pub end: f64,
}

impl TimeRange {
    pub fn around(center: f64, radius: f64) -> Self {
        Self {
            start: (center - radius).max(0.0),
            end: center + radius,
        }
    }

    pub fn contains(&self, t: f64) -> bool {
        t >= self.start && t <= self.end
    }
}

/// Transcript fragment from the transcription/VAD pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEvidence {
    pub timestamp_seconds: f64,
    pub text: String,
    pub confidence: f64,
}

/// Whether the blob behind a frame capture can still be fetched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlobAvailability {
    Present,
    Expired,
}

/// Frame capture from the frame-capture pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameEvidence {
    pub timestamp_seconds: f64,
    pub blob_ref: String,
    pub availability: BlobAvailability,
}

/// Initial synthesis of a note
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteCreated {
    pub note_id: NoteId,
    pub text: String,
    pub category: String,
    pub confidence: f64,
    pub timestamp_seconds: f64,
    #[serde(default)]
    pub gaps: Vec<TimeRange>,
}

/// Why a revision was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevisionReason {
    /// Late evidence re-derived the note
    Backfill,
    /// An escalation ladder step raised confidence
    Escalation,
    /// Secondary refinement pass (wording)
    Refinement,
    /// Secondary refinement pass (near-duplicate merge)
    Merge,
}

/// A new state for an existing note
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteRevision {
    pub note_id: NoteId,
    pub text: String,
    pub category: String,
    pub confidence: f64,
    pub reason: RevisionReason,
    /// Set when this note was absorbed into another by a merge
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_into: Option<NoteId>,
    #[serde(default)]
    pub gaps: Vec<TimeRange>,
}

/// Escalation ladder step that requested more context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LadderStep {
    ExpandWindow,
    FreshCapture,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextRequest {
    pub note_id: NoteId,
    pub step: LadderStep,
    pub timestamp_seconds: f64,
    pub window_seconds: f64,
}

/// Re-synthesis attempt after a fresh capture came back
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryCapture {
    pub note_id: NoteId,
    pub timestamp_seconds: f64,
    pub captured: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    ConfidenceRecovered,
    UserDismissed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationResolved {
    pub note_id: NoteId,
    pub resolution: Resolution,
    pub confidence: f64,
}

/// Typed payload of a ledger entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EntryPayload {
    EvidenceTranscript(TranscriptEvidence),
    EvidenceFrame(FrameEvidence),
    NoteCreated(NoteCreated),
    NoteRevision(NoteRevision),
    ContextRequest(ContextRequest),
    RetryCapture(RetryCapture),
    EscalationResolved(EscalationResolved),
}

impl EntryPayload {
    pub fn kind(&self) -> EntryKind {
        match self {
            EntryPayload::EvidenceTranscript(_) => EntryKind::EvidenceTranscript,
            EntryPayload::EvidenceFrame(_) => EntryKind::EvidenceFrame,
            EntryPayload::NoteCreated(_) => EntryKind::NoteCreated,
            EntryPayload::NoteRevision(_) => EntryKind::NoteRevision,
            EntryPayload::ContextRequest(_) => EntryKind::ContextRequest,
            EntryPayload::RetryCapture(_) => EntryKind::RetryCapture,
            EntryPayload::EscalationResolved(_) => EntryKind::EscalationResolved,
        }
    }

    /// Video timestamp the payload is anchored to
    pub fn timestamp_seconds(&self) -> Option<f64> {
        match self {
            EntryPayload::EvidenceTranscript(e) => Some(e.timestamp_seconds),
            EntryPayload::EvidenceFrame(e) => Some(e.timestamp_seconds),
            EntryPayload::NoteCreated(n) => Some(n.timestamp_seconds),
            EntryPayload::ContextRequest(c) => Some(c.timestamp_seconds),
            EntryPayload::RetryCapture(r) => Some(r.timestamp_seconds),
            EntryPayload::NoteRevision(_) | EntryPayload::EscalationResolved(_) => None,
        }
    }

    /// Note the payload is about, if any
    pub fn note_id(&self) -> Option<&NoteId> {
        match self {
            EntryPayload::NoteCreated(n) => Some(&n.note_id),
            EntryPayload::NoteRevision(r) => Some(&r.note_id),
            EntryPayload::ContextRequest(c) => Some(&c.note_id),
            EntryPayload::RetryCapture(r) => Some(&r.note_id),
            EntryPayload::EscalationResolved(e) => Some(&e.note_id),
            EntryPayload::EvidenceTranscript(_) | EntryPayload::EvidenceFrame(_) => None,
        }
    }

    /// SHA256 of the payload's canonical JSON
    pub fn content_hash(&self) -> Result<String, serde_json::Error> {
        let json = serde_json::to_vec(self)?;
        Ok(compute_hash(&json))
    }

    /// Check the numeric fields before the payload reaches the ledger.
    ///
    /// JSON has no NaN or infinity, so such values would be written as
    /// `null` and the chain could no longer be loaded.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            EntryPayload::EvidenceTranscript(e) => {
                check_timestamp(e.timestamp_seconds)?;
                check_confidence(e.confidence)
            }
            EntryPayload::EvidenceFrame(e) => check_timestamp(e.timestamp_seconds),
            EntryPayload::NoteCreated(n) => {
                check_timestamp(n.timestamp_seconds)?;
                check_confidence(n.confidence)?;
                check_gaps(&n.gaps)
            }
            EntryPayload::NoteRevision(r) => {
                check_confidence(r.confidence)?;
                check_gaps(&r.gaps)
            }
            EntryPayload::ContextRequest(c) => {
                check_timestamp(c.timestamp_seconds)?;
                check_timestamp(c.window_seconds)
                    .map_err(|_| format!("window_seconds must be finite and >= 0, got {}", c.window_seconds))
            }
            EntryPayload::RetryCapture(r) => check_timestamp(r.timestamp_seconds),
            EntryPayload::EscalationResolved(e) => check_confidence(e.confidence),
        }
    }
}

fn check_timestamp(t: f64) -> Result<(), String> {
    if t.is_finite() && t >= 0.0 {
        Ok(())
    } else {
        Err(format!("timestamp_seconds must be finite and >= 0, got {}", t))
    }
}

fn check_confidence(c: f64) -> Result<(), String> {
    if (0.0..=1.0).contains(&c) {
        Ok(())
    } else {
        Err(format!("confidence must be within 0.0..=1.0, got {}", c))
    }
}

fn check_gaps(gaps: &[TimeRange]) -> Result<(), String> {
    for gap in gaps {
        if !(gap.start.is_finite() && gap.end.is_finite()) {
            return Err(format!("gap bounds must be finite, got {}..{}", gap.start, gap.end));
        }
    }
    Ok(())
}

/// A single immutable entry in a session's ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub session_id: SessionId,

    /// Position in the session chain, starting at 0, no gaps
    pub sequence: u64,

    pub kind: EntryKind,

    pub payload: EntryPayload,

    pub payload_hash: String,

    /// `entry_hash` of the previous entry (or [`GENESIS_HASH`])
    pub prev_hash: String,

    pub entry_hash: String,

    pub created_at: DateTime<Utc>,

    /// Sequences this entry logically depends on
    #[serde(default)]
    pub references: BTreeSet<u64>,
}

impl LedgerEntry {
    /// Build a sealed entry with both hashes computed
    pub fn seal(
        session_id: SessionId,
        sequence: u64,
        payload: EntryPayload,
        prev_hash: String,
        created_at: DateTime<Utc>,
        references: BTreeSet<u64>,
    ) -> Result<Self, serde_json::Error> {
        let payload_hash = payload.content_hash()?;
        let mut entry = Self {
            session_id,
            sequence,
            kind: payload.kind(),
            payload,
            payload_hash,
            prev_hash,
            entry_hash: String::new(),
            created_at,
            references,
        };
        entry.entry_hash = entry.compute_entry_hash();
        Ok(entry)
    }

    /// Recompute the entry hash from the entry's fields
    pub fn compute_entry_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.session_id.as_str().as_bytes());
        hasher.update(b"|");
        hasher.update(self.sequence.to_be_bytes());
        hasher.update(b"|");
        hasher.update(self.kind.as_str().as_bytes());
        hasher.update(b"|");
        hasher.update(self.payload_hash.as_bytes());
        hasher.update(b"|");
        hasher.update(self.prev_hash.as_bytes());
        hasher.update(b"|");
        hasher.update(
            self.created_at
                .to_rfc3339_opts(SecondsFormat::Nanos, true)
                .as_bytes(),
        );
        for reference in &self.references {
            hasher.update(b"|");
            hasher.update(reference.to_be_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

/// Hex SHA256 of arbitrary bytes
pub fn compute_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transcript(t: f64, text: &str) -> EntryPayload {
        EntryPayload::EvidenceTranscript(TranscriptEvidence {
            timestamp_seconds: t,
            text: text.to_string(),
            confidence: 0.9,
        })
    }

    #[test]
    fn test_seal_computes_hashes() {
        let entry = LedgerEntry::seal(
            SessionId::from("s1"),
            0,
            transcript(1.0, "hello"),
            GENESIS_HASH.to_string(),
            Utc::now(),
            BTreeSet::new(),
        )
        .unwrap();

        assert_eq!(entry.kind, EntryKind::EvidenceTranscript);
        assert_eq!(entry.payload_hash.len(), 64);
        assert_eq!(entry.entry_hash, entry.compute_entry_hash());
    }

    #[test]
    fn test_payload_hash_is_content_addressed() {
        let a = transcript(1.0, "hello").content_hash().unwrap();
        let b = transcript(1.0, "hello").content_hash().unwrap();
        let c = transcript(1.0, "goodbye").content_hash().unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_entry_hash_covers_references() {
        let now = Utc::now();
        let plain = LedgerEntry::seal(
            SessionId::from("s1"),
            3,
            transcript(1.0, "x"),
            GENESIS_HASH.to_string(),
            now,
            BTreeSet::new(),
        )
        .unwrap();
        let referenced = LedgerEntry::seal(
            SessionId::from("s1"),
            3,
            transcript(1.0, "x"),
            GENESIS_HASH.to_string(),
            now,
            [1u64, 2].into_iter().collect(),
        )
        .unwrap();

        assert_ne!(plain.entry_hash, referenced.entry_hash);
    }

    #[test]
    fn test_note_id_derivation_is_stable() {
        let session = SessionId::from("session-a");
        let id1 = NoteId::derive(&session, 4);
        let id2 = NoteId::derive(&session, 4);
        let id3 = NoteId::derive(&session, 5);

        assert_eq!(id1, id2);
        assert_ne!(id1, id3);
        assert_eq!(id1.as_str().len(), 12);
    }

    #[test]
    fn test_payload_serialization_shape() {
        let json = serde_json::to_value(transcript(2.5, "turn left")).unwrap();
        assert_eq!(json["type"], "evidence_transcript");
        assert_eq!(json["data"]["text"], "turn left");
    }

    #[test]
    fn test_validate_rejects_unrepresentable_numbers() {
        assert!(transcript(0.0, "start").validate().is_ok());
        assert!(transcript(f64::NAN, "x").validate().is_err());
        assert!(transcript(f64::INFINITY, "x").validate().is_err());
        assert!(transcript(-1.0, "x").validate().is_err());

        let confident = |confidence: f64| {
            EntryPayload::EvidenceTranscript(TranscriptEvidence {
                timestamp_seconds: 1.0,
                text: "x".to_string(),
                confidence,
            })
        };
        assert!(confident(1.0).validate().is_ok());
        assert!(confident(1.5).validate().is_err());
        assert!(confident(f64::NAN).validate().is_err());

        let frame = EntryPayload::EvidenceFrame(FrameEvidence {
            timestamp_seconds: f64::NEG_INFINITY,
            blob_ref: "frame-1.jpg".to_string(),
            availability: BlobAvailability::Present,
        });
        let error = frame.validate().unwrap_err();
        assert!(error.contains("timestamp_seconds"));
    }
}
