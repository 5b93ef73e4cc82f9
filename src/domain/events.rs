//! Events published to collaborators (UI / extension) per session.
//!
//! These are notifications about ledger changes, not the ledger itself;
//! a subscriber that falls behind can always catch up through replay.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::escalation::Tier;
use super::ledger::{Resolution, SessionId};
use super::note::Note;

/// A single notification on the session event stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEvent {
    pub session_id: SessionId,

    /// Ledger sequence this event is about
    pub sequence: u64,

    pub emitted_at: DateTime<Utc>,

    #[serde(flatten)]
    pub kind: SessionEventKind,

    /// Note snapshot after the change (if the event concerns a note)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<Note>,
}

impl SessionEvent {
    pub fn new(session_id: SessionId, sequence: u64, kind: SessionEventKind) -> Self {
        Self {
            session_id,
            sequence,
            emitted_at: Utc::now(),
            kind,
            note: None,
        }
    }

    pub fn with_note(mut self, note: Note) -> Self {
        self.note = Some(note);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEventKind {
    NoteCreated,

    NoteRevision,

    /// Reconciliation for one evidence entry finished
    BackfillComplete {
        affected: usize,
        revised: usize,
        deferred: usize,
    },

    /// A note's tier moved up; `prompt` asks the user to act
    EscalationRaised { tier: Tier, prompt: bool },

    EscalationResolved { resolution: Resolution },
}
