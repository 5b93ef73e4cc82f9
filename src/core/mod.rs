//! Core ledger and reconciliation logic.
//!
//! This module contains:
//! - LedgerStore: Append-only, hash-chained ledger per session
//! - Classifier: Confidence tiers
//! - Reconciler: Backfill reconciliation of notes against late evidence
//! - EscalationCoordinator: Per-note escalation ladder
//! - DiffusionSupervisor: Budget-bounded refinement passes
//! - Replay: Deterministic snapshots, export and verification
//! - Engine: Wiring of all of the above

pub mod bus;
pub mod classifier;
pub mod clock;
pub mod diffusion;
pub mod engine;
pub mod escalation;
pub mod ledger_store;
pub mod locks;
pub mod reconciler;
pub mod replay;
pub mod similarity;

// Re-export commonly used types
pub use bus::EventBus;
pub use classifier::{classify, CRITICAL_THRESHOLD, STABLE_THRESHOLD};
pub use clock::{Clock, ManualClock, SystemClock};
pub use diffusion::{
    DiffusionError, DiffusionReport, DiffusionSupervisor, DiffusionTask, Rejected, TaskStatus,
};
pub use engine::{Collaborators, Engine, IngestReport};
pub use escalation::{EscalationCoordinator, EscalationError, EscalationOutcome};
pub use ledger_store::{verify_links, LedgerCursor, LedgerError, LedgerStore, PendingEntry, Tip};
pub use locks::{NoteGuard, NoteLocks};
pub use reconciler::{DeltaThreshold, NoteUpdate, ReconcileReport, Reconciler};
pub use replay::{
    export, replay, verify_replay, EvidenceRecord, ReplayError, ReplayVerification,
    SessionBundle, SessionSnapshot,
};
pub use similarity::text_similarity;
