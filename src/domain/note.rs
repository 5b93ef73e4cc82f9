//! Note projection derived from ledger lineage.
//!
//! A [`Note`] is a cache: its state is reproduced by folding the
//! `note_created` / `note_revision` entries listed in its lineage.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::ledger::{
    EntryPayload, LedgerEntry, NoteCreated, NoteId, NoteRevision, SessionId, TimeRange,
};

/// Width of the sliding window behind `revision_count_this_hour`
pub const REVISION_WINDOW_SECONDS: i64 = 3600;

/// Current state of a timestamped note
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub note_id: NoteId,

    pub session_id: SessionId,

    pub text: String,

    pub category: String,

    /// Synthesis confidence (0.0 - 1.0)
    pub confidence: f64,

    /// Anchor into the video
    pub timestamp_seconds: f64,

    /// Sequences of the note_created/note_revision entries, in order
    pub lineage: Vec<u64>,

    /// Revisions inside the sliding hour, measured at the last refresh
    pub revision_count_this_hour: u32,

    /// `created_at` of each revision entry in the lineage
    #[serde(default)]
    pub revision_times: Vec<DateTime<Utc>>,

    /// Evidence sequences the current state incorporated
    #[serde(default)]
    pub evidence: BTreeSet<u64>,

    /// Time ranges the last synthesis lacked evidence for
    #[serde(default)]
    pub gaps: Vec<TimeRange>,

    /// Set once a merge absorbed this note into another
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_into: Option<NoteId>,
}

impl Note {
    /// Build the initial projection from a `note_created` entry
    pub fn from_created(entry: &LedgerEntry, created: &NoteCreated) -> Self {
        Self {
            note_id: created.note_id.clone(),
            session_id: entry.session_id.clone(),
            text: created.text.clone(),
            category: created.category.clone(),
            confidence: created.confidence,
            timestamp_seconds: created.timestamp_seconds,
            lineage: vec![entry.sequence],
            revision_count_this_hour: 0,
            revision_times: Vec::new(),
            evidence: entry.references.clone(),
            gaps: created.gaps.clone(),
            merged_into: None,
        }
    }

    /// Apply a `note_revision` entry on top of the current state
    pub fn apply_revision(&mut self, entry: &LedgerEntry, revision: &NoteRevision) {
        self.text = revision.text.clone();
        self.category = revision.category.clone();
        self.confidence = revision.confidence;
        self.gaps = revision.gaps.clone();
        if revision.merged_into.is_some() {
            self.merged_into = revision.merged_into.clone();
        }
        self.lineage.push(entry.sequence);
        self.revision_times.push(entry.created_at);
        self.evidence.extend(entry.references.iter().copied());
    }

    /// Rebuild a note from its lineage entries alone.
    ///
    /// Returns `None` if the first entry is not a `note_created`.
    pub fn from_lineage(entries: &[LedgerEntry]) -> Option<Self> {
        let (first, rest) = entries.split_first()?;
        let mut note = match &first.payload {
            EntryPayload::NoteCreated(created) => Self::from_created(first, created),
            _ => return None,
        };

        for entry in rest {
            if let EntryPayload::NoteRevision(revision) = &entry.payload {
                if revision.note_id == note.note_id {
                    note.apply_revision(entry, revision);
                }
            }
        }

        Some(note)
    }

    /// Count revisions created at or after `since`
    pub fn revisions_since(&self, since: DateTime<Utc>) -> u32 {
        self.revision_times.iter().filter(|t| **t >= since).count() as u32
    }

    /// Recompute `revision_count_this_hour` relative to `now`
    pub fn refresh_rate_counter(&mut self, now: DateTime<Utc>) {
        let since = now - Duration::seconds(REVISION_WINDOW_SECONDS);
        self.revision_count_this_hour = self.revisions_since(since);
    }

    /// When the oldest revision inside the window ages out
    pub fn window_opens_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let since = now - Duration::seconds(REVISION_WINDOW_SECONDS);
        self.revision_times
            .iter()
            .filter(|t| **t >= since)
            .min()
            .map(|oldest| *oldest + Duration::seconds(REVISION_WINDOW_SECONDS))
    }

    /// Whether evidence at `t` is relevant to this note
    pub fn is_affected_by(&self, t: f64, window_seconds: f64) -> bool {
        (self.timestamp_seconds - t).abs() <= window_seconds
            || self.gaps.iter().any(|gap| gap.contains(t))
    }

    /// Merged notes stay in history but are no longer listed
    pub fn is_active(&self) -> bool {
        self.merged_into.is_none()
    }
}
