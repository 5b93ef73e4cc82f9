//! notewell - Evidence ledger and diffusion reconciliation engine
//!
//! Keeps timestamped video notes consistent with evidence that arrives
//! late, out of order, or not at all.
//!
//! # Architecture
//!
//! The system is built around a hash-chained ledger:
//! - Every transcript fragment, frame capture and note change is an
//!   immutable, content-addressed ledger entry
//! - Notes and escalation states are projections, derived by replay
//! - Writers append with an optimistic tip check instead of locking
//!
//! # Modules
//!
//! - `adapters`: External collaborators (synthesis, capture, cost governor, blobs)
//! - `core`: Ledger store, reconciler, escalation, diffusion, replay
//! - `domain`: Data structures (LedgerEntry, Note, EscalationState)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Feed evidence into a session
//! notewell ingest lecture-42 evidence.jsonl
//!
//! # List current notes
//! notewell notes lecture-42
//!
//! # Verify chain integrity and replay determinism
//! notewell verify lecture-42
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use core::{Engine, LedgerError, LedgerStore, SessionBundle, SessionSnapshot};
pub use domain::{EntryKind, EntryPayload, LedgerEntry, Note, NoteId, SessionId, Tier};
