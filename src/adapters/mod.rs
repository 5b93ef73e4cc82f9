//! Adapter interfaces for external collaborators.
//!
//! Synthesis, fresh captures, cost governance and blob storage live
//! outside the ledger engine; these traits are the seams it talks through.

pub mod blobs;
pub mod budget;
pub mod capture;
pub mod synthesis;

pub use blobs::{BlobIndex, DirectoryBlobIndex, RecordedAvailability};
pub use budget::{CostGovernor, Reservation, SessionBudget};
pub use capture::{CaptureError, CaptureRequest, CaptureRequester, Captured, NoCapture};
pub use synthesis::{
    synthesize_with_timeout, ContextWindow, ExtractiveSynthesizer, HttpSynthesizer,
    SynthesisError, SynthesisOutput, SynthesisPurpose, Synthesizer,
};
