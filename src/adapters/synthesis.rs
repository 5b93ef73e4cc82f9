//! Note synthesis collaborators.
//!
//! The reconciler, the escalation ladder and diffusion passes all hand a
//! [`ContextWindow`] to a [`Synthesizer`] and get back text, category and
//! confidence. Two implementations ship: a rule-based extractive one and
//! an HTTP client for an external (LLM-backed) service.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{
    BlobAvailability, EntryPayload, LedgerEntry, NoteId, SessionId, TimeRange,
};

/// Why synthesis is being run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SynthesisPurpose {
    Create,
    Backfill,
    Escalation,
    Refinement,
    Merge,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextTranscript {
    pub sequence: u64,
    pub timestamp_seconds: f64,
    pub text: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextFrame {
    pub sequence: u64,
    pub timestamp_seconds: f64,
    pub blob_ref: String,
    pub availability: BlobAvailability,
}

/// Evidence handed to a synthesizer
#[derive(Debug, Clone, Serialize)]
pub struct ContextWindow {
    pub session_id: SessionId,
    pub note_id: Option<NoteId>,
    pub purpose: SynthesisPurpose,
    pub center: f64,
    pub range: TimeRange,
    pub transcripts: Vec<ContextTranscript>,
    pub frames: Vec<ContextFrame>,
    /// Current note text, when re-deriving an existing note
    pub prior_text: Option<String>,
}

impl ContextWindow {
    /// Gather the evidence entries whose timestamp falls inside `range`
    pub fn from_entries<'a>(
        session_id: SessionId,
        purpose: SynthesisPurpose,
        center: f64,
        range: TimeRange,
        entries: impl IntoIterator<Item = &'a Arc<LedgerEntry>>,
    ) -> Self {
        let mut transcripts = Vec::new();
        let mut frames = Vec::new();

        for entry in entries {
            match &entry.payload {
                EntryPayload::EvidenceTranscript(t) if range.contains(t.timestamp_seconds) => {
                    transcripts.push(ContextTranscript {
                        sequence: entry.sequence,
                        timestamp_seconds: t.timestamp_seconds,
                        text: t.text.clone(),
                        confidence: t.confidence,
                    });
                }
                EntryPayload::EvidenceFrame(f) if range.contains(f.timestamp_seconds) => {
                    frames.push(ContextFrame {
                        sequence: entry.sequence,
                        timestamp_seconds: f.timestamp_seconds,
                        blob_ref: f.blob_ref.clone(),
                        availability: f.availability,
                    });
                }
                _ => {}
            }
        }

        Self {
            session_id,
            note_id: None,
            purpose,
            center,
            range,
            transcripts,
            frames,
            prior_text: None,
        }
    }

    pub fn for_note(mut self, note_id: NoteId, prior_text: impl Into<String>) -> Self {
        self.note_id = Some(note_id);
        self.prior_text = Some(prior_text.into());
        self
    }

    /// Ledger sequences of all evidence in the window
    pub fn evidence_sequences(&self) -> BTreeSet<u64> {
        self.transcripts
            .iter()
            .map(|t| t.sequence)
            .chain(self.frames.iter().map(|f| f.sequence))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.transcripts.is_empty() && self.frames.is_empty()
    }
}

/// What a synthesizer produces
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisOutput {
    pub text: String,
    pub category: String,
    pub confidence: f64,
    /// Ranges the synthesizer lacked evidence for
    #[serde(default)]
    pub gaps: Vec<TimeRange>,
}

#[derive(Debug, Error)]
pub enum SynthesisError {
    #[error("Synthesis upstream error: {0}")]
    Upstream(String),

    #[error("Synthesis timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Malformed synthesis output: {0}")]
    Malformed(String),
}

/// External synthesis function
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Human-readable synthesizer name
    fn name(&self) -> &str;

    async fn synthesize(&self, window: &ContextWindow) -> Result<SynthesisOutput, SynthesisError>;
}

/// Run a synthesizer under a timeout
pub async fn synthesize_with_timeout(
    synthesizer: &dyn Synthesizer,
    window: &ContextWindow,
    timeout: Duration,
) -> Result<SynthesisOutput, SynthesisError> {
    match tokio::time::timeout(timeout, synthesizer.synthesize(window)).await {
        Ok(result) => result.and_then(validate),
        Err(_) => Err(SynthesisError::Timeout {
            seconds: timeout.as_secs(),
        }),
    }
}

fn validate(output: SynthesisOutput) -> Result<SynthesisOutput, SynthesisError> {
    if !(0.0..=1.0).contains(&output.confidence) {
        return Err(SynthesisError::Malformed(format!(
            "confidence {} outside 0.0..=1.0",
            output.confidence
        )));
    }
    if output.text.trim().is_empty() {
        return Err(SynthesisError::Malformed("empty text".to_string()));
    }
    Ok(output)
}

/// Rule-based synthesizer: stitches transcript fragments together
#[derive(Debug, Default, Clone)]
pub struct ExtractiveSynthesizer;

/// Confidence bonus per frame capture in the window
const FRAME_BONUS: f64 = 0.05;

impl ExtractiveSynthesizer {
    pub fn new() -> Self {
        Self
    }

    fn categorize(text: &str) -> &'static str {
        let lower = text.to_lowercase();
        let first_word = lower.split_whitespace().next().unwrap_or("");
        const IMPERATIVES: [&str; 10] = [
            "turn", "click", "press", "go", "open", "take", "run", "add", "remove", "install",
        ];

        if lower.contains('?') {
            "question"
        } else if IMPERATIVES.contains(&first_word)
            || lower.contains("should")
            || lower.contains("must")
            || lower.contains("need to")
        {
            "action"
        } else if lower.contains(" is ") || lower.contains(" means ") || lower.contains("defined as")
        {
            "definition"
        } else {
            "observation"
        }
    }
}

#[async_trait]
impl Synthesizer for ExtractiveSynthesizer {
    fn name(&self) -> &str {
        "extractive"
    }

    async fn synthesize(&self, window: &ContextWindow) -> Result<SynthesisOutput, SynthesisError> {
        if window.transcripts.is_empty() {
            return Err(SynthesisError::Upstream(
                "no transcript evidence in window".to_string(),
            ));
        }

        let mut fragments = window.transcripts.clone();
        fragments.sort_by(|a, b| {
            a.timestamp_seconds
                .total_cmp(&b.timestamp_seconds)
                .then(a.sequence.cmp(&b.sequence))
        });

        let text = fragments
            .iter()
            .map(|t| t.text.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ");

        let mean = fragments.iter().map(|t| t.confidence).sum::<f64>() / fragments.len() as f64;
        let confidence = (mean + FRAME_BONUS * window.frames.len() as f64).clamp(0.0, 1.0);

        let left_empty = !fragments.iter().any(|t| t.timestamp_seconds < window.center);
        let right_empty = !fragments.iter().any(|t| t.timestamp_seconds > window.center);
        let mut gaps = Vec::new();
        if left_empty && window.range.start < window.center {
            gaps.push(TimeRange {
                start: window.range.start,
                end: window.center,
            });
        }
        if right_empty && window.range.end > window.center {
            gaps.push(TimeRange {
                start: window.center,
                end: window.range.end,
            });
        }

        Ok(SynthesisOutput {
            category: Self::categorize(&text).to_string(),
            text,
            confidence,
            gaps,
        })
    }
}

/// Synthesizer backed by an HTTP service.
///
/// POSTs the context window as JSON and expects a `SynthesisOutput` body.
pub struct HttpSynthesizer {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpSynthesizer {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Synthesizer for HttpSynthesizer {
    fn name(&self) -> &str {
        "http"
    }

    async fn synthesize(&self, window: &ContextWindow) -> Result<SynthesisOutput, SynthesisError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(window)
            .send()
            .await
            .map_err(|e| SynthesisError::Upstream(e.to_string()))?;

        if !response.status().is_success() {
            return Err(SynthesisError::Upstream(format!(
                "{} returned {}",
                self.endpoint,
                response.status()
            )));
        }

        response
            .json::<SynthesisOutput>()
            .await
            .map_err(|e| SynthesisError::Malformed(e.to_string()))
    }
}
