//! Deterministic reconstruction of session state from the ledger.
//!
//! [`SessionSnapshot::fold`] is a pure fold: the same ledger prefix always
//! yields the same snapshot, byte for byte. Everything else in this module
//! (replay, export, verification) is a thin read around it.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, instrument};

use crate::adapters::BlobIndex;
use crate::core::classifier::classify;
use crate::core::ledger_store::{LedgerError, LedgerStore};
use crate::domain::{
    compute_hash, BlobAvailability, EntryKind, EntryPayload, EscalationAction, EscalationState,
    LadderStep, LedgerEntry, Note, NoteId, SessionId, Transition, GENESIS_HASH,
};

/// Version of the export bundle layout
pub const BUNDLE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("Replay of session {session_id} is not deterministic: {first} != {second}")]
    Nondeterministic {
        session_id: SessionId,
        first: String,
        second: String,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Notes and escalation states as of some ledger prefix
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: SessionId,

    /// Number of entries folded
    pub entry_count: u64,

    /// `entry_hash` of the last folded entry
    pub tip_hash: String,

    /// `created_at` of the last folded entry
    pub as_of: Option<DateTime<Utc>>,

    pub notes: BTreeMap<NoteId, Note>,

    pub escalations: BTreeMap<NoteId, EscalationState>,
}

impl SessionSnapshot {
    pub fn empty(session_id: SessionId) -> Self {
        Self {
            session_id,
            entry_count: 0,
            tip_hash: GENESIS_HASH.to_string(),
            as_of: None,
            notes: BTreeMap::new(),
            escalations: BTreeMap::new(),
        }
    }

    /// Fold entries in order, starting from an empty snapshot
    pub fn fold<I>(session_id: SessionId, entries: I) -> Self
    where
        I: IntoIterator,
        I::Item: AsRef<LedgerEntry>,
    {
        let mut snapshot = Self::empty(session_id);
        for entry in entries {
            snapshot.apply(entry.as_ref());
        }
        snapshot.refresh_rate_counters();
        snapshot
    }

    /// Apply one entry's effect
    pub fn apply(&mut self, entry: &LedgerEntry) {
        match &entry.payload {
            EntryPayload::EvidenceTranscript(_) | EntryPayload::EvidenceFrame(_) => {}
            EntryPayload::NoteCreated(created) => {
                let note = Note::from_created(entry, created);
                let mut state = EscalationState::new(note.note_id.clone());
                if let Transition::Raised { to, .. } = state.observe(classify(note.confidence)) {
                    state.raise(to);
                }
                self.escalations.insert(note.note_id.clone(), state);
                self.notes.insert(note.note_id.clone(), note);
            }
            EntryPayload::NoteRevision(revision) => {
                if let Some(note) = self.notes.get_mut(&revision.note_id) {
                    note.apply_revision(entry, revision);
                    // downward moves only count once an escalation_resolved is recorded
                    if let Some(state) = self.escalations.get_mut(&revision.note_id) {
                        if let Transition::Raised { to, .. } =
                            state.observe(classify(revision.confidence))
                        {
                            state.raise(to);
                        }
                    }
                }
            }
            EntryPayload::ContextRequest(request) => {
                if let Some(state) = self.escalations.get_mut(&request.note_id) {
                    state.record_action(match request.step {
                        LadderStep::ExpandWindow => EscalationAction::WindowExpanded,
                        LadderStep::FreshCapture => EscalationAction::CaptureRequested,
                    });
                }
            }
            EntryPayload::RetryCapture(retry) => {
                if let Some(state) = self.escalations.get_mut(&retry.note_id) {
                    state.record_action(EscalationAction::CaptureRetried);
                }
            }
            EntryPayload::EscalationResolved(resolved) => {
                if let Some(state) = self.escalations.get_mut(&resolved.note_id) {
                    state.resolve();
                }
            }
        }

        self.entry_count = entry.sequence + 1;
        self.tip_hash = entry.entry_hash.clone();
        self.as_of = Some(entry.created_at);
    }

    /// Measure every note's sliding revision counter at `as_of`
    fn refresh_rate_counters(&mut self) {
        if let Some(as_of) = self.as_of {
            for note in self.notes.values_mut() {
                note.refresh_rate_counter(as_of);
            }
        }
    }

    /// Notes not absorbed by a merge, ordered by timestamp then id
    pub fn active_notes(&self) -> Vec<Note> {
        let mut notes: Vec<Note> = self
            .notes
            .values()
            .filter(|n| n.is_active())
            .cloned()
            .collect();
        notes.sort_by(|a, b| {
            a.timestamp_seconds
                .total_cmp(&b.timestamp_seconds)
                .then_with(|| a.note_id.cmp(&b.note_id))
        });
        notes
    }

    pub fn escalation(&self, note_id: &NoteId) -> Option<&EscalationState> {
        self.escalations.get(note_id)
    }

    /// SHA256 of the snapshot's JSON encoding
    pub fn digest(&self) -> Result<String, serde_json::Error> {
        Ok(compute_hash(&serde_json::to_vec(self)?))
    }
}

/// Fold `0..=up_to_sequence` of a session
#[instrument(skip(store), fields(session = %session_id))]
pub async fn replay(
    store: &LedgerStore,
    session_id: &SessionId,
    up_to_sequence: u64,
) -> Result<SessionSnapshot, ReplayError> {
    let cursor = store.read(session_id, 0, up_to_sequence).await?;
    Ok(SessionSnapshot::fold(session_id.clone(), cursor))
}

/// Evidence entry and whether its blob can still be fetched
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceRecord {
    pub sequence: u64,
    pub kind: EntryKind,
    pub timestamp_seconds: f64,
    pub payload_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blob_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub availability: Option<BlobAvailability>,
}

/// Hash-stable export of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionBundle {
    pub format_version: u32,
    pub session_id: SessionId,
    pub snapshot: SessionSnapshot,
    pub evidence: Vec<EvidenceRecord>,
    /// SHA256 over the bundle with this field empty
    pub bundle_hash: String,
}

impl SessionBundle {
    fn seal(mut self) -> Result<Self, serde_json::Error> {
        self.bundle_hash = self.compute_hash()?;
        Ok(self)
    }

    pub fn compute_hash(&self) -> Result<String, serde_json::Error> {
        let mut unsealed = self.clone();
        unsealed.bundle_hash = String::new();
        Ok(compute_hash(&serde_json::to_vec(&unsealed)?))
    }

    pub fn verify_hash(&self) -> Result<bool, serde_json::Error> {
        Ok(self.compute_hash()? == self.bundle_hash)
    }
}

fn evidence_record(entry: &LedgerEntry, blobs: &dyn BlobIndex) -> Option<EvidenceRecord> {
    let (blob_ref, availability) = match &entry.payload {
        EntryPayload::EvidenceTranscript(_) => (None, None),
        EntryPayload::EvidenceFrame(frame) => (
            Some(frame.blob_ref.clone()),
            Some(blobs.availability(&frame.blob_ref, frame.availability)),
        ),
        _ => return None,
    };

    Some(EvidenceRecord {
        sequence: entry.sequence,
        kind: entry.kind,
        timestamp_seconds: entry.payload.timestamp_seconds().unwrap_or_default(),
        payload_hash: entry.payload_hash.clone(),
        blob_ref,
        availability,
    })
}

/// Full replay plus evidence availability, sealed with a bundle hash
#[instrument(skip(store, blobs), fields(session = %session_id))]
pub async fn export(
    store: &LedgerStore,
    session_id: &SessionId,
    blobs: &dyn BlobIndex,
) -> Result<SessionBundle, ReplayError> {
    let entries: Vec<Arc<LedgerEntry>> = store.read(session_id, 0, u64::MAX).await?.collect();
    let evidence = entries
        .iter()
        .filter_map(|e| evidence_record(e, blobs))
        .collect();
    let snapshot = SessionSnapshot::fold(session_id.clone(), &entries);

    let bundle = SessionBundle {
        format_version: BUNDLE_FORMAT_VERSION,
        session_id: session_id.clone(),
        snapshot,
        evidence,
        bundle_hash: String::new(),
    }
    .seal()?;

    info!(
        entries = entries.len(),
        notes = bundle.snapshot.notes.len(),
        "Exported session bundle"
    );
    Ok(bundle)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayVerification {
    pub entries: u64,
    pub digest: String,
}

/// Verify the chain, then replay it twice from one cursor and compare digests
#[instrument(skip(store), fields(session = %session_id))]
pub async fn verify_replay(
    store: &LedgerStore,
    session_id: &SessionId,
) -> Result<ReplayVerification, ReplayError> {
    let verified = store.verify_chain(session_id).await?;
    let mut cursor = store
        .read(session_id, 0, verified.saturating_sub(1))
        .await?;

    let first = if verified == 0 {
        SessionSnapshot::empty(session_id.clone())
    } else {
        SessionSnapshot::fold(session_id.clone(), cursor.by_ref())
    };
    cursor.restart();
    let second = if verified == 0 {
        SessionSnapshot::empty(session_id.clone())
    } else {
        SessionSnapshot::fold(session_id.clone(), cursor)
    };

    let (first, second) = (first.digest()?, second.digest()?);
    if first != second {
        return Err(ReplayError::Nondeterministic {
            session_id: session_id.clone(),
            first,
            second,
        });
    }

    info!(entries = verified, digest = %first, "Replay verified");
    Ok(ReplayVerification {
        entries: verified,
        digest: first,
    })
}
