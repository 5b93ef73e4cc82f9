//! Escalation coordinator: drives low-confidence notes through the ladder.
//!
//! Every note update is observed against the note's escalation state as
//! it stood before the update. Entering `warning` requests a background
//! diffusion pass; entering `critical` runs the ladder:
//!
//! 1. widen the retrieval window and re-synthesize
//! 2. ask the capture pipeline for fresh evidence and re-synthesize
//! 3. prompt the user
//!
//! Each ladder step is recorded in the ledger before its side effect runs.
//! Ladder executions are serialized per note.

use std::collections::BTreeSet;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::adapters::{
    synthesize_with_timeout, CaptureRequest, CaptureRequester, ContextWindow, CostGovernor,
    Reservation, SynthesisOutput, SynthesisPurpose, Synthesizer,
};
use crate::config::{EscalationSettings, ReconcileSettings};
use crate::core::bus::EventBus;
use crate::core::classifier::classify;
use crate::core::ledger_store::{LedgerError, LedgerStore};
use crate::core::locks::NoteLocks;
use crate::core::reconciler::NoteUpdate;
use crate::core::replay::SessionSnapshot;
use crate::domain::{
    ContextRequest, EntryPayload, EscalationResolved, EscalationState, LadderStep, LedgerEntry,
    Note, NoteId, NoteRevision, Resolution, RetryCapture, RevisionReason, SessionEvent,
    SessionEventKind, SessionId, Tier, TimeRange, Transition,
};

#[derive(Debug, Error)]
pub enum EscalationError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("Note {note_id} not found in session {session_id}")]
    UnknownNote {
        session_id: SessionId,
        note_id: NoteId,
    },
}

/// What observing a note update led to
#[derive(Debug, Clone, PartialEq)]
pub enum EscalationOutcome {
    /// Stable, unchanged, already handled or already resolved
    NoAction,
    /// Entered warning; a diffusion pass was requested
    DiffusionQueued,
    /// Confidence recovered, automatically or through the ladder
    Resolved { confidence: f64 },
    /// Ladder exhausted; the user has been prompted
    Unresolved,
}

pub struct EscalationCoordinator {
    store: Arc<LedgerStore>,
    synthesizer: Arc<dyn Synthesizer>,
    capture: Arc<dyn CaptureRequester>,
    governor: Arc<dyn CostGovernor>,
    settings: EscalationSettings,
    reconcile: ReconcileSettings,
    bus: EventBus,
    diffusion_requests: mpsc::UnboundedSender<SessionId>,
    locks: Arc<NoteLocks>,
}

impl EscalationCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<LedgerStore>,
        synthesizer: Arc<dyn Synthesizer>,
        capture: Arc<dyn CaptureRequester>,
        governor: Arc<dyn CostGovernor>,
        settings: EscalationSettings,
        reconcile: ReconcileSettings,
        bus: EventBus,
        diffusion_requests: mpsc::UnboundedSender<SessionId>,
    ) -> Self {
        Self {
            store,
            synthesizer,
            capture,
            governor,
            settings,
            reconcile,
            bus,
            diffusion_requests,
            locks: Arc::new(NoteLocks::new()),
        }
    }

    /// Share note locks with another writer, e.g. the reconciler
    pub fn with_note_locks(mut self, locks: Arc<NoteLocks>) -> Self {
        self.locks = locks;
        self
    }

    /// React to a note_created / note_revision written by another component
    #[instrument(skip(self, update), fields(session = %update.note.session_id, note = %update.note.note_id, seq = update.entry.sequence))]
    pub async fn observe(&self, update: &NoteUpdate) -> Result<EscalationOutcome, EscalationError> {
        let note = &update.note;
        let session_id = &note.session_id;
        let _guard = self.locks.lock(session_id, &note.note_id).await;

        let entries = self.store.entries(session_id, 0, u64::MAX).await?;
        let prior = SessionSnapshot::fold(
            session_id.clone(),
            entries.iter().take_while(|e| e.sequence < update.entry.sequence),
        );
        let current = SessionSnapshot::fold(session_id.clone(), &entries);

        let prior_state = prior
            .escalation(&note.note_id)
            .cloned()
            .unwrap_or_else(|| EscalationState::new(note.note_id.clone()));
        let Some(current_state) = current.escalation(&note.note_id) else {
            return Err(EscalationError::UnknownNote {
                session_id: session_id.clone(),
                note_id: note.note_id.clone(),
            });
        };

        if current_state.resolved {
            debug!("Escalation already resolved");
            return Ok(EscalationOutcome::NoAction);
        }
        if current_state.attempts > prior_state.attempts {
            debug!("Update already handled by a ladder run");
            return Ok(EscalationOutcome::NoAction);
        }

        match prior_state.observe(classify(note.confidence)) {
            Transition::Unchanged | Transition::Ignored => Ok(EscalationOutcome::NoAction),
            Transition::Raised { from, to } => {
                info!(%from, %to, confidence = note.confidence, "Escalation raised");
                self.bus.publish(
                    SessionEvent::new(
                        session_id.clone(),
                        update.entry.sequence,
                        SessionEventKind::EscalationRaised {
                            tier: to,
                            prompt: false,
                        },
                    )
                    .with_note(note.clone()),
                );
                match to {
                    Tier::Warning => {
                        if self.diffusion_requests.send(session_id.clone()).is_err() {
                            warn!("Diffusion queue closed, pass not requested");
                        }
                        Ok(EscalationOutcome::DiffusionQueued)
                    }
                    Tier::Critical => self.run_ladder(note).await,
                    Tier::Stable => Ok(EscalationOutcome::NoAction),
                }
            }
            Transition::Recovered { from, to } => {
                info!(%from, %to, confidence = note.confidence, "Confidence recovered");
                let references = note.lineage.last().copied().into_iter().collect();
                self.resolve(note, Resolution::ConfidenceRecovered, references)
                    .await?;
                Ok(EscalationOutcome::Resolved {
                    confidence: note.confidence,
                })
            }
        }
    }

    /// User dismissed the escalation prompt for a note.
    ///
    /// Returns `None` when there is no open escalation to dismiss.
    #[instrument(skip(self), fields(session = %session_id, note = %note_id))]
    pub async fn dismiss(
        &self,
        session_id: &SessionId,
        note_id: &NoteId,
    ) -> Result<Option<LedgerEntry>, EscalationError> {
        let _guard = self.locks.lock(session_id, note_id).await;

        let entries = self.store.entries(session_id, 0, u64::MAX).await?;
        let snapshot = SessionSnapshot::fold(session_id.clone(), &entries);
        let (Some(note), Some(state)) = (snapshot.notes.get(note_id), snapshot.escalation(note_id))
        else {
            return Err(EscalationError::UnknownNote {
                session_id: session_id.clone(),
                note_id: note_id.clone(),
            });
        };

        if !state.is_open() {
            debug!(tier = %state.tier, resolved = state.resolved, "Nothing to dismiss");
            return Ok(None);
        }

        let references = note.lineage.last().copied().into_iter().collect();
        let entry = self
            .resolve(note, Resolution::UserDismissed, references)
            .await?;
        Ok(Some(entry))
    }

    async fn run_ladder(&self, note: &Note) -> Result<EscalationOutcome, EscalationError> {
        let session_id = &note.session_id;
        let expanded = self.reconcile.window_seconds + self.settings.window_increment_seconds;

        // Step 1: widen the window
        let request = self
            .store
            .append_retrying(
                session_id,
                EntryPayload::ContextRequest(ContextRequest {
                    note_id: note.note_id.clone(),
                    step: LadderStep::ExpandWindow,
                    timestamp_seconds: note.timestamp_seconds,
                    window_seconds: expanded,
                }),
                note.lineage.last().copied().into_iter().collect(),
            )
            .await?;
        info!(seq = request.sequence, window = expanded, "Ladder step 1: expanded window");

        if let Some((output, evidence)) = self.resynthesize(note, expanded).await? {
            if classify(output.confidence) != Tier::Critical {
                return self
                    .recover(note, output, with(evidence, request.sequence))
                    .await;
            }
        }

        // Step 2: fresh capture
        if self
            .governor
            .reserve(session_id, self.settings.capture_estimated_cost)
            == Reservation::Denied
        {
            info!(cost = self.settings.capture_estimated_cost, "Budget exhausted, skipping fresh capture");
            return Ok(self.prompt(note, request.sequence));
        }

        let request = self
            .store
            .append_retrying(
                session_id,
                EntryPayload::ContextRequest(ContextRequest {
                    note_id: note.note_id.clone(),
                    step: LadderStep::FreshCapture,
                    timestamp_seconds: note.timestamp_seconds,
                    window_seconds: self.settings.window_increment_seconds,
                }),
                [request.sequence].into_iter().collect(),
            )
            .await?;
        info!(seq = request.sequence, "Ladder step 2: fresh capture requested");

        let capture_request = CaptureRequest {
            session_id: session_id.clone(),
            note_id: note.note_id.clone(),
            timestamp_seconds: note.timestamp_seconds,
            window_seconds: self.settings.window_increment_seconds,
        };
        let captured = match tokio::time::timeout(
            self.settings.capture_timeout(),
            self.capture.request_capture(&capture_request),
        )
        .await
        {
            Ok(Ok(captured)) => captured,
            Ok(Err(e)) => {
                warn!(error = %e, "Fresh capture failed");
                return Ok(self.prompt(note, request.sequence));
            }
            Err(_) => {
                warn!(
                    timeout_secs = self.settings.capture_timeout_seconds,
                    "Fresh capture timed out"
                );
                return Ok(self.prompt(note, request.sequence));
            }
        };

        let mut references: BTreeSet<u64> = [request.sequence].into_iter().collect();
        let mut count = 0;
        for evidence in captured {
            let payload = evidence.into_payload();
            if let Err(details) = payload.validate() {
                warn!(kind = %payload.kind(), %details, "Captured evidence rejected");
                continue;
            }
            let entry = self
                .store
                .append_retrying(session_id, payload, [request.sequence].into_iter().collect())
                .await?;
            references.insert(entry.sequence);
            count += 1;
        }

        let retry = self
            .store
            .append_retrying(
                session_id,
                EntryPayload::RetryCapture(RetryCapture {
                    note_id: note.note_id.clone(),
                    timestamp_seconds: note.timestamp_seconds,
                    captured: count,
                }),
                references,
            )
            .await?;
        info!(seq = retry.sequence, captured = count, "Re-synthesizing with fresh capture");

        if let Some((output, evidence)) = self.resynthesize(note, expanded).await? {
            if classify(output.confidence) != Tier::Critical {
                return self
                    .recover(note, output, with(evidence, retry.sequence))
                    .await;
            }
        }

        // Step 3: hand over to the user
        Ok(self.prompt(note, retry.sequence))
    }

    async fn resynthesize(
        &self,
        note: &Note,
        radius: f64,
    ) -> Result<Option<(SynthesisOutput, BTreeSet<u64>)>, LedgerError> {
        let entries = self.store.entries(&note.session_id, 0, u64::MAX).await?;
        let window = ContextWindow::from_entries(
            note.session_id.clone(),
            SynthesisPurpose::Escalation,
            note.timestamp_seconds,
            TimeRange::around(note.timestamp_seconds, radius),
            &entries,
        )
        .for_note(note.note_id.clone(), note.text.clone());

        match synthesize_with_timeout(
            self.synthesizer.as_ref(),
            &window,
            self.reconcile.synthesis_timeout(),
        )
        .await
        {
            Ok(output) => Ok(Some((output, window.evidence_sequences()))),
            Err(e) => {
                warn!(error = %e, "Escalation synthesis failed");
                Ok(None)
            }
        }
    }

    /// Write the recovered revision, then resolve
    async fn recover(
        &self,
        note: &Note,
        output: SynthesisOutput,
        references: BTreeSet<u64>,
    ) -> Result<EscalationOutcome, EscalationError> {
        let revision = NoteRevision {
            note_id: note.note_id.clone(),
            text: output.text,
            category: output.category,
            confidence: output.confidence,
            reason: RevisionReason::Escalation,
            merged_into: None,
            gaps: output.gaps,
        };
        let entry = self
            .store
            .append_retrying(
                &note.session_id,
                EntryPayload::NoteRevision(revision.clone()),
                references,
            )
            .await?;

        let mut revised = note.clone();
        revised.apply_revision(&entry, &revision);
        revised.refresh_rate_counter(self.store.clock().now());
        self.bus.publish(
            SessionEvent::new(
                note.session_id.clone(),
                entry.sequence,
                SessionEventKind::NoteRevision,
            )
            .with_note(revised.clone()),
        );

        self.resolve(
            &revised,
            Resolution::ConfidenceRecovered,
            [entry.sequence].into_iter().collect(),
        )
        .await?;
        Ok(EscalationOutcome::Resolved {
            confidence: revised.confidence,
        })
    }

    async fn resolve(
        &self,
        note: &Note,
        resolution: Resolution,
        references: BTreeSet<u64>,
    ) -> Result<LedgerEntry, LedgerError> {
        let entry = self
            .store
            .append_retrying(
                &note.session_id,
                EntryPayload::EscalationResolved(EscalationResolved {
                    note_id: note.note_id.clone(),
                    resolution,
                    confidence: note.confidence,
                }),
                references,
            )
            .await?;

        info!(note = %note.note_id, seq = entry.sequence, ?resolution, "Escalation resolved");
        self.bus.publish(
            SessionEvent::new(
                note.session_id.clone(),
                entry.sequence,
                SessionEventKind::EscalationResolved { resolution },
            )
            .with_note(note.clone()),
        );
        Ok(entry)
    }

    fn prompt(&self, note: &Note, sequence: u64) -> EscalationOutcome {
        warn!(note = %note.note_id, "Escalation unresolved, prompting user");
        self.bus.publish(
            SessionEvent::new(
                note.session_id.clone(),
                sequence,
                SessionEventKind::EscalationRaised {
                    tier: Tier::Critical,
                    prompt: true,
                },
            )
            .with_note(note.clone()),
        );
        EscalationOutcome::Unresolved
    }
}

fn with(mut references: BTreeSet<u64>, sequence: u64) -> BTreeSet<u64> {
    references.insert(sequence);
    references
}
