//! Domain types for the evidence ledger.
//!
//! This module contains the core data structures:
//! - Ledger: Immutable, hash-chained entries and their payloads
//! - Note: Projection derived from ledger lineage
//! - Escalation: Per-note tier state machine
//! - Events: Notifications published per session

pub mod escalation;
pub mod events;
pub mod ledger;
pub mod note;

// Re-export commonly used types
pub use escalation::{EscalationAction, EscalationState, Tier, Transition};
pub use events::{SessionEvent, SessionEventKind};
pub use ledger::{
    compute_hash, BlobAvailability, ContextRequest, EntryKind, EntryPayload, EscalationResolved,
    FrameEvidence, LadderStep, LedgerEntry, NoteCreated, NoteId, NoteRevision, Resolution,
    RetryCapture, RevisionReason, SessionId, TimeRange, TranscriptEvidence, GENESIS_HASH,
};
pub use note::Note;
