//! Backfill reconciliation: re-derive notes when evidence arrives late.
//!
//! Each evidence entry is matched against the current note projections.
//! Affected notes are re-synthesized with the widened context; a revision
//! is written only when it clears the semantic delta threshold, and only
//! while the note is under its hourly revision cap. Capped revisions are
//! parked and re-synthesized from scratch once the window rolls over.
//!
//! Revisions of one note are serialized, and every revision is sealed
//! against the tip its note state was read at. When the ledger moves in
//! between, the note is re-read and the threshold and cap are checked
//! again before the next attempt.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::{debug, info, instrument, warn};

use crate::adapters::{
    synthesize_with_timeout, ContextWindow, SynthesisOutput, SynthesisPurpose, Synthesizer,
};
use crate::config::ReconcileSettings;
use crate::core::bus::EventBus;
use crate::core::ledger_store::{LedgerError, LedgerStore, Tip};
use crate::core::locks::NoteLocks;
use crate::core::replay::SessionSnapshot;
use crate::core::similarity::text_similarity;
use crate::domain::{
    EntryKind, EntryPayload, LedgerEntry, Note, NoteCreated, NoteId, NoteRevision,
    RevisionReason, SessionEvent, SessionEventKind, SessionId, TimeRange,
};

/// When a candidate output differs enough from a note to be written
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeltaThreshold {
    pub text_similarity: f64,
    pub confidence_delta: f64,
}

impl DeltaThreshold {
    pub fn from_settings(settings: &ReconcileSettings) -> Self {
        Self {
            text_similarity: settings.text_similarity_threshold,
            confidence_delta: settings.confidence_delta_threshold,
        }
    }

    pub fn qualifies(&self, note: &Note, output: &SynthesisOutput) -> bool {
        text_similarity(&note.text, &output.text) < self.text_similarity
            || (output.confidence - note.confidence).abs() >= self.confidence_delta
    }
}

/// A note change that was written to the ledger
#[derive(Debug, Clone)]
pub struct NoteUpdate {
    pub entry: LedgerEntry,
    /// Projection after the entry
    pub note: Note,
}

/// What one reconciliation pass did
#[derive(Debug, Clone, Default)]
pub struct ReconcileReport {
    /// Evidence sequence that triggered the pass (none for deferred passes)
    pub trigger: Option<u64>,
    pub affected: usize,
    pub updates: Vec<NoteUpdate>,
    /// Candidates inside the delta threshold
    pub discarded: usize,
    pub deferred: Vec<NoteId>,
    /// Notes whose synthesis failed
    pub failed: Vec<NoteId>,
}

/// A revision held back by the rate cap
#[derive(Debug, Clone)]
struct Deferred {
    not_before: DateTime<Utc>,
    trigger: u64,
    timestamp_seconds: f64,
}

enum Candidate {
    Appended(NoteUpdate),
    Discarded,
    Deferred(DateTime<Utc>),
    Failed,
    /// Merged away since it was matched
    Inactive,
}

enum Creation {
    Created(NoteUpdate),
    Failed,
    /// Another writer created notes covering the evidence first
    Covered(Vec<NoteId>),
}

pub struct Reconciler {
    store: Arc<LedgerStore>,
    synthesizer: Arc<dyn Synthesizer>,
    settings: ReconcileSettings,
    threshold: DeltaThreshold,
    bus: EventBus,
    locks: Arc<NoteLocks>,
    deferred: Mutex<HashMap<SessionId, BTreeMap<NoteId, Deferred>>>,
    deferred_changed: Notify,
}

impl Reconciler {
    pub fn new(
        store: Arc<LedgerStore>,
        synthesizer: Arc<dyn Synthesizer>,
        settings: ReconcileSettings,
        bus: EventBus,
    ) -> Self {
        Self {
            store,
            synthesizer,
            threshold: DeltaThreshold::from_settings(&settings),
            settings,
            bus,
            locks: Arc::new(NoteLocks::new()),
            deferred: Mutex::new(HashMap::new()),
            deferred_changed: Notify::new(),
        }
    }

    pub fn threshold(&self) -> DeltaThreshold {
        self.threshold
    }

    /// Per-note locks held while a note is revised
    pub fn note_locks(&self) -> Arc<NoteLocks> {
        self.locks.clone()
    }

    /// Reconcile the notes affected by a newly appended evidence entry
    #[instrument(skip(self, evidence), fields(session = %evidence.session_id, seq = evidence.sequence))]
    pub async fn on_evidence(&self, evidence: &LedgerEntry) -> Result<ReconcileReport, LedgerError> {
        let mut report = ReconcileReport {
            trigger: Some(evidence.sequence),
            ..ReconcileReport::default()
        };
        let t = match evidence.payload.timestamp_seconds() {
            Some(t) if evidence.kind.is_evidence() => t,
            _ => return Ok(report),
        };

        let session_id = &evidence.session_id;
        let (tip, entries) = self.store.head(session_id).await?;
        let mut affected = self.notes_covering(session_id, &entries, t);

        if affected.is_empty() {
            match self.create_note(evidence, t, tip, entries).await? {
                Creation::Created(update) => report.updates.push(update),
                Creation::Failed => report
                    .failed
                    .push(NoteId::derive(session_id, evidence.sequence)),
                Creation::Covered(covering) => affected = covering,
            }
        }
        report.affected = affected.len();

        for note_id in affected {
            let candidate = self
                .revise(session_id, &note_id, Some(t), evidence.sequence)
                .await?;
            self.record(session_id, &note_id, candidate, evidence.sequence, t, &mut report);
        }

        info!(
            affected = report.affected,
            revised = report.updates.len(),
            discarded = report.discarded,
            deferred = report.deferred.len(),
            "Backfill complete"
        );
        self.bus.publish(SessionEvent::new(
            session_id.clone(),
            evidence.sequence,
            SessionEventKind::BackfillComplete {
                affected: report.affected,
                revised: report.updates.len(),
                deferred: report.deferred.len(),
            },
        ));
        Ok(report)
    }

    /// Re-evaluate deferred revisions whose rate window has opened.
    ///
    /// A deferred revision that fails again is parked for another
    /// `deferred_retry_seconds` instead of being dropped.
    #[instrument(skip(self), fields(session = %session_id))]
    pub async fn process_deferred(&self, session_id: &SessionId) -> Result<ReconcileReport, LedgerError> {
        let mut report = ReconcileReport::default();
        let now = self.store.clock().now();

        let due: Vec<(NoteId, Deferred)> = {
            let mut deferred = self.deferred.lock().unwrap_or_else(|e| e.into_inner());
            let Some(parked) = deferred.get_mut(session_id) else {
                return Ok(report);
            };
            let ready: Vec<NoteId> = parked
                .iter()
                .filter(|(_, d)| d.not_before <= now)
                .map(|(id, _)| id.clone())
                .collect();
            ready
                .into_iter()
                .filter_map(|id| parked.remove(&id).map(|d| (id, d)))
                .collect()
        };

        for (note_id, parked) in due {
            let retry = Deferred {
                not_before: now + self.settings.deferred_retry(),
                ..parked.clone()
            };
            match self
                .revise(session_id, &note_id, Some(parked.timestamp_seconds), parked.trigger)
                .await
            {
                Ok(Candidate::Inactive) => {
                    debug!(note = %note_id, "Deferred note no longer active");
                }
                Ok(Candidate::Failed) => {
                    report.affected += 1;
                    self.park(session_id, &note_id, retry);
                    report.failed.push(note_id);
                }
                Ok(candidate) => {
                    report.affected += 1;
                    self.record(
                        session_id,
                        &note_id,
                        candidate,
                        parked.trigger,
                        parked.timestamp_seconds,
                        &mut report,
                    );
                }
                Err(e) => {
                    warn!(note = %note_id, error = %e, "Deferred revision failed, parked again");
                    self.park(session_id, &note_id, retry);
                    report.failed.push(note_id);
                }
            }
        }

        Ok(report)
    }

    /// Deferred revisions for a session and when each may run
    pub fn deferred_notes(&self, session_id: &SessionId) -> Vec<(NoteId, DateTime<Utc>)> {
        let deferred = self.deferred.lock().unwrap_or_else(|e| e.into_inner());
        deferred
            .get(session_id)
            .map(|parked| {
                parked
                    .iter()
                    .map(|(id, d)| (id.clone(), d.not_before))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Earliest time any deferred revision may run
    pub fn next_deferred(&self) -> Option<DateTime<Utc>> {
        let deferred = self.deferred.lock().unwrap_or_else(|e| e.into_inner());
        deferred
            .values()
            .flat_map(|parked| parked.values().map(|d| d.not_before))
            .min()
    }

    /// Sessions with a deferred revision due at `now`
    pub fn due_sessions(&self, now: DateTime<Utc>) -> Vec<SessionId> {
        let deferred = self.deferred.lock().unwrap_or_else(|e| e.into_inner());
        deferred
            .iter()
            .filter(|(_, parked)| parked.values().any(|d| d.not_before <= now))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Resolves once a revision was parked or [`Self::wake_deferred`] was called
    pub async fn deferred_changed(&self) {
        self.deferred_changed.notified().await
    }

    /// Make anyone waiting on [`Self::deferred_changed`] look at the queue again
    pub fn wake_deferred(&self) {
        self.deferred_changed.notify_one();
    }

    /// Rebuild the deferred queue of a session from its ledger.
    ///
    /// Deferrals are not written to the ledger. A note is parked again when
    /// evidence touching it arrived after its last lineage entry while its
    /// hourly window was full. If that candidate had been discarded rather
    /// than deferred, the re-run is discarded by the delta threshold again.
    #[instrument(skip(self), fields(session = %session_id))]
    pub async fn restore_deferred(&self, session_id: &SessionId) -> Result<Vec<NoteId>, LedgerError> {
        let (_, entries) = self.store.head(session_id).await?;
        let snapshot = SessionSnapshot::fold(session_id.clone(), &entries);
        let now = self.store.clock().now();
        let mut restored = Vec::new();

        for mut note in snapshot.active_notes() {
            note.refresh_rate_counter(now);
            if note.revision_count_this_hour < self.settings.revision_cap_per_hour {
                continue;
            }
            let last_written = note.lineage.last().copied().unwrap_or(0);
            let pending = entries.iter().rev().take_while(|e| e.sequence > last_written).find_map(|e| {
                let t = e.payload.timestamp_seconds().filter(|_| e.kind.is_evidence())?;
                note.is_affected_by(t, self.settings.window_seconds)
                    .then_some((e.sequence, t))
            });
            let Some((trigger, timestamp_seconds)) = pending else {
                continue;
            };

            let not_before = note
                .window_opens_at(now)
                .unwrap_or_else(|| now + self.settings.deferred_retry());
            let mut deferred = self.deferred.lock().unwrap_or_else(|e| e.into_inner());
            let parked = deferred.entry(session_id.clone()).or_default();
            if parked.contains_key(&note.note_id) {
                continue;
            }
            parked.insert(
                note.note_id.clone(),
                Deferred {
                    not_before,
                    trigger,
                    timestamp_seconds,
                },
            );
            restored.push(note.note_id.clone());
        }

        if !restored.is_empty() {
            info!(restored = restored.len(), "Deferred revisions restored");
            self.deferred_changed.notify_one();
        }
        Ok(restored)
    }

    fn park(&self, session_id: &SessionId, note_id: &NoteId, parked: Deferred) {
        {
            let mut deferred = self.deferred.lock().unwrap_or_else(|e| e.into_inner());
            deferred
                .entry(session_id.clone())
                .or_default()
                .insert(note_id.clone(), parked);
        }
        self.deferred_changed.notify_one();
    }

    fn record(
        &self,
        session_id: &SessionId,
        note_id: &NoteId,
        candidate: Candidate,
        trigger: u64,
        timestamp_seconds: f64,
        report: &mut ReconcileReport,
    ) {
        let unpark = || {
            let mut deferred = self.deferred.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(parked) = deferred.get_mut(session_id) {
                parked.remove(note_id);
            }
        };

        match candidate {
            Candidate::Appended(update) => {
                unpark();
                report.updates.push(update);
            }
            Candidate::Discarded => {
                unpark();
                report.discarded += 1;
            }
            Candidate::Inactive => unpark(),
            Candidate::Deferred(not_before) => {
                self.park(
                    session_id,
                    note_id,
                    Deferred {
                        not_before,
                        trigger,
                        timestamp_seconds,
                    },
                );
                report.deferred.push(note_id.clone());
            }
            // a parked revision stays parked; the next evidence retries
            Candidate::Failed => report.failed.push(note_id.clone()),
        }
    }

    /// Active notes the evidence at `t` is relevant to
    fn notes_covering(&self, session_id: &SessionId, entries: &[Arc<LedgerEntry>], t: f64) -> Vec<NoteId> {
        SessionSnapshot::fold(session_id.clone(), entries)
            .active_notes()
            .into_iter()
            .filter(|n| n.is_affected_by(t, self.settings.window_seconds))
            .map(|n| n.note_id)
            .collect()
    }

    async fn create_note(
        &self,
        evidence: &LedgerEntry,
        t: f64,
        mut tip: Tip,
        entries: Vec<Arc<LedgerEntry>>,
    ) -> Result<Creation, LedgerError> {
        let session_id = &evidence.session_id;
        let window = ContextWindow::from_entries(
            session_id.clone(),
            SynthesisPurpose::Create,
            t,
            TimeRange::around(t, self.settings.window_seconds),
            &entries,
        );

        let output = match synthesize_with_timeout(
            self.synthesizer.as_ref(),
            &window,
            self.settings.synthesis_timeout(),
        )
        .await
        {
            Ok(output) => output,
            Err(e) => {
                warn!(error = %e, synthesizer = self.synthesizer.name(), "Synthesis failed, no note created");
                return Ok(Creation::Failed);
            }
        };

        let mut references = window.evidence_sequences();
        references.insert(evidence.sequence);
        let created = NoteCreated {
            note_id: NoteId::derive(session_id, evidence.sequence),
            text: output.text,
            category: output.category,
            confidence: output.confidence,
            timestamp_seconds: t,
            gaps: output.gaps,
        };

        let mut attempt = 0u32;
        let entry = loop {
            match self
                .store
                .append_at(
                    session_id,
                    &tip,
                    EntryKind::NoteCreated,
                    EntryPayload::NoteCreated(created.clone()),
                    references.clone(),
                )
                .await
            {
                Ok(entry) => break entry,
                Err(e) if e.is_conflict() && attempt < self.store.max_conflict_retries() => {
                    attempt += 1;
                    let (fresh_tip, fresh) = self.store.head(session_id).await?;
                    let covering = self.notes_covering(session_id, &fresh, t);
                    if !covering.is_empty() {
                        debug!(notes = covering.len(), "Evidence now covered by another writer's note");
                        return Ok(Creation::Covered(covering));
                    }
                    tip = fresh_tip;
                }
                Err(e) => return Err(e),
            }
        };
        let note = Note::from_created(&entry, &created);

        info!(note = %note.note_id, seq = entry.sequence, confidence = note.confidence, "Note created");
        self.bus.publish(
            SessionEvent::new(session_id.clone(), entry.sequence, SessionEventKind::NoteCreated)
                .with_note(note.clone()),
        );
        Ok(Creation::Created(NoteUpdate { entry, note }))
    }

    /// Current projection of an active note, rate counter as of `now`
    fn active_note(
        session_id: &SessionId,
        entries: &[Arc<LedgerEntry>],
        note_id: &NoteId,
        now: DateTime<Utc>,
    ) -> Option<Note> {
        let snapshot = SessionSnapshot::fold(session_id.clone(), entries);
        let mut note = snapshot
            .notes
            .get(note_id)
            .filter(|n| n.is_active())
            .cloned()?;
        note.refresh_rate_counter(now);
        Some(note)
    }

    async fn revise(
        &self,
        session_id: &SessionId,
        note_id: &NoteId,
        evidence_at: Option<f64>,
        trigger: u64,
    ) -> Result<Candidate, LedgerError> {
        let _guard = self.locks.lock(session_id, note_id).await;

        let (mut tip, entries) = self.store.head(session_id).await?;
        let now = self.store.clock().now();
        let Some(mut note) = Self::active_note(session_id, &entries, note_id, now) else {
            return Ok(Candidate::Inactive);
        };

        let mut range = TimeRange::around(note.timestamp_seconds, self.settings.window_seconds);
        if let Some(t) = evidence_at {
            range.start = range.start.min(t);
            range.end = range.end.max(t);
        }

        let window = ContextWindow::from_entries(
            session_id.clone(),
            SynthesisPurpose::Backfill,
            note.timestamp_seconds,
            range,
            &entries,
        )
        .for_note(note.note_id.clone(), note.text.clone());

        let output = match synthesize_with_timeout(
            self.synthesizer.as_ref(),
            &window,
            self.settings.synthesis_timeout(),
        )
        .await
        {
            Ok(output) => output,
            Err(e) => {
                warn!(note = %note_id, error = %e, "Synthesis failed, keeping last known-good state");
                return Ok(Candidate::Failed);
            }
        };

        let mut references = window.evidence_sequences();
        references.insert(trigger);
        let revision = NoteRevision {
            note_id: note_id.clone(),
            text: output.text.clone(),
            category: output.category.clone(),
            confidence: output.confidence,
            reason: RevisionReason::Backfill,
            merged_into: None,
            gaps: output.gaps.clone(),
        };

        let mut attempt = 0u32;
        let entry = loop {
            if !self.threshold.qualifies(&note, &output) {
                debug!(note = %note_id, "Candidate revision within delta threshold, discarded");
                return Ok(Candidate::Discarded);
            }

            if note.revision_count_this_hour >= self.settings.revision_cap_per_hour {
                let not_before = note
                    .window_opens_at(now)
                    .unwrap_or_else(|| now + self.settings.deferred_retry());
                info!(
                    note = %note_id,
                    count = note.revision_count_this_hour,
                    %not_before,
                    "Revision cap reached, deferring"
                );
                return Ok(Candidate::Deferred(not_before));
            }

            match self
                .store
                .append_at(
                    session_id,
                    &tip,
                    EntryKind::NoteRevision,
                    EntryPayload::NoteRevision(revision.clone()),
                    references.clone(),
                )
                .await
            {
                Ok(entry) => break entry,
                Err(e) if e.is_conflict() && attempt < self.store.max_conflict_retries() => {
                    attempt += 1;
                    debug!(note = %note_id, attempt, "Ledger moved during reconciliation, re-checking note");
                    let (fresh_tip, fresh) = self.store.head(session_id).await?;
                    let Some(current) = Self::active_note(session_id, &fresh, note_id, now) else {
                        return Ok(Candidate::Inactive);
                    };
                    tip = fresh_tip;
                    note = current;
                }
                Err(e) => return Err(e),
            }
        };

        let mut revised = note.clone();
        revised.apply_revision(&entry, &revision);
        revised.refresh_rate_counter(now);

        info!(
            note = %note_id,
            seq = entry.sequence,
            from = note.confidence,
            to = revised.confidence,
            "Note revised"
        );
        self.bus.publish(
            SessionEvent::new(session_id.clone(), entry.sequence, SessionEventKind::NoteRevision)
                .with_note(revised.clone()),
        );
        Ok(Candidate::Appended(NoteUpdate {
            entry,
            note: revised,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{ExtractiveSynthesizer, SynthesisError};
    use crate::domain::TranscriptEvidence;
    use async_trait::async_trait;
    use std::collections::BTreeSet;

    struct Failing;

    #[async_trait]
    impl Synthesizer for Failing {
        fn name(&self) -> &str {
            "failing"
        }
        async fn synthesize(&self, _: &ContextWindow) -> Result<SynthesisOutput, SynthesisError> {
            Err(SynthesisError::Upstream("model offline".to_string()))
        }
    }

    fn transcript(t: f64, text: &str, confidence: f64) -> EntryPayload {
        EntryPayload::EvidenceTranscript(TranscriptEvidence {
            timestamp_seconds: t,
            text: text.to_string(),
            confidence,
        })
    }

    fn reconciler(store: Arc<LedgerStore>, synthesizer: Arc<dyn Synthesizer>) -> Reconciler {
        Reconciler::new(store, synthesizer, ReconcileSettings::default(), EventBus::default())
    }

    #[test]
    fn test_delta_threshold() {
        let threshold = DeltaThreshold::from_settings(&ReconcileSettings::default());
        let note = Note {
            note_id: NoteId::new("n1"),
            session_id: SessionId::from("s1"),
            text: "turn left here".to_string(),
            category: "action".to_string(),
            confidence: 0.7,
            timestamp_seconds: 10.0,
            lineage: vec![1],
            revision_count_this_hour: 0,
            revision_times: Vec::new(),
            evidence: BTreeSet::new(),
            gaps: Vec::new(),
            merged_into: None,
        };
        let output = |text: &str, confidence: f64| SynthesisOutput {
            text: text.to_string(),
            category: "action".to_string(),
            confidence,
            gaps: Vec::new(),
        };

        assert!(!threshold.qualifies(&note, &output("turn left here", 0.72)));
        assert!(threshold.qualifies(&note, &output("turn left here", 0.76)));
        assert!(threshold.qualifies(&note, &output("turn right at the lights", 0.7)));
    }

    #[tokio::test]
    async fn test_first_evidence_creates_note() {
        let store = Arc::new(LedgerStore::in_memory());
        let session = SessionId::from("s1");
        let evidence = store
            .append_retrying(&session, transcript(10.0, "turn left here", 0.9), BTreeSet::new())
            .await
            .unwrap();

        let report = reconciler(store.clone(), Arc::new(ExtractiveSynthesizer::new()))
            .on_evidence(&evidence)
            .await
            .unwrap();

        assert_eq!(report.affected, 0);
        assert_eq!(report.updates.len(), 1);
        let update = &report.updates[0];
        assert_eq!(update.note.note_id, NoteId::derive(&session, 0));
        assert!(update.entry.references.contains(&0));
        assert_eq!(store.len(&session).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_synthesis_failure_writes_nothing() {
        let store = Arc::new(LedgerStore::in_memory());
        let session = SessionId::from("s1");
        let evidence = store
            .append_retrying(&session, transcript(10.0, "turn left here", 0.9), BTreeSet::new())
            .await
            .unwrap();

        let report = reconciler(store.clone(), Arc::new(Failing))
            .on_evidence(&evidence)
            .await
            .unwrap();

        assert!(report.updates.is_empty());
        assert_eq!(report.failed.len(), 1);
        assert_eq!(store.len(&session).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_non_evidence_is_ignored() {
        let store = Arc::new(LedgerStore::in_memory());
        let session = SessionId::from("s1");
        let entry = store
            .append_retrying(
                &session,
                EntryPayload::NoteCreated(NoteCreated {
                    note_id: NoteId::new("n1"),
                    text: "x".to_string(),
                    category: "observation".to_string(),
                    confidence: 0.9,
                    timestamp_seconds: 1.0,
                    gaps: Vec::new(),
                }),
                BTreeSet::new(),
            )
            .await
            .unwrap();

        let report = reconciler(store.clone(), Arc::new(ExtractiveSynthesizer::new()))
            .on_evidence(&entry)
            .await
            .unwrap();
        assert!(report.updates.is_empty());
        assert_eq!(store.len(&session).await.unwrap(), 1);
    }
}
