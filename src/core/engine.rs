//! Engine: wires the ledger store, the reconcilers and the collaborators.
//!
//! Ingest path: evidence → ledger append → deferred revisions that came due
//! → backfill reconciliation → escalation for every note update. Warning
//! escalations land on an unbounded diffusion queue, drained either by
//! [`Engine::drain_diffusion_requests`] or by a spawned worker. Deferred
//! revisions also run from their own worker once their rate window opens.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::adapters::{
    BlobIndex, CaptureRequester, CostGovernor, DirectoryBlobIndex, ExtractiveSynthesizer,
    HttpSynthesizer, NoCapture, RecordedAvailability, SessionBudget, Synthesizer,
};
use crate::config::ResolvedConfig;
use crate::domain::{
    EntryPayload, FrameEvidence, LedgerEntry, Note, NoteId, SessionEvent, SessionId,
    TranscriptEvidence,
};

use super::bus::EventBus;
use super::diffusion::{DiffusionReport, DiffusionSupervisor, DiffusionTask, Rejected};
use super::escalation::{EscalationCoordinator, EscalationOutcome};
use super::ledger_store::LedgerStore;
use super::reconciler::{NoteUpdate, ReconcileReport, Reconciler};
use super::replay::{self, ReplayVerification, SessionBundle, SessionSnapshot};

/// External collaborators the engine talks to
#[derive(Clone)]
pub struct Collaborators {
    pub synthesizer: Arc<dyn Synthesizer>,
    pub capture: Arc<dyn CaptureRequester>,
    pub governor: Arc<dyn CostGovernor>,
    pub blobs: Arc<dyn BlobIndex>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            synthesizer: Arc::new(ExtractiveSynthesizer::new()),
            capture: Arc::new(NoCapture),
            governor: Arc::new(SessionBudget::new(25.0)),
            blobs: Arc::new(RecordedAvailability),
        }
    }
}

impl Collaborators {
    pub fn from_config(config: &ResolvedConfig) -> Self {
        let synthesizer: Arc<dyn Synthesizer> = match &config.synthesis.endpoint {
            Some(endpoint) => Arc::new(HttpSynthesizer::new(endpoint.clone())),
            None => Arc::new(ExtractiveSynthesizer::new()),
        };

        Self {
            synthesizer,
            capture: Arc::new(NoCapture),
            governor: Arc::new(SessionBudget::new(config.budget.per_session)),
            blobs: Arc::new(DirectoryBlobIndex::new(config.home.join("blobs"))),
        }
    }

    pub fn with_synthesizer(mut self, synthesizer: Arc<dyn Synthesizer>) -> Self {
        self.synthesizer = synthesizer;
        self
    }

    pub fn with_capture(mut self, capture: Arc<dyn CaptureRequester>) -> Self {
        self.capture = capture;
        self
    }

    pub fn with_governor(mut self, governor: Arc<dyn CostGovernor>) -> Self {
        self.governor = governor;
        self
    }
}

/// Everything one evidence entry set in motion
#[derive(Debug, Clone)]
pub struct IngestReport {
    pub evidence: LedgerEntry,
    /// Deferred revisions that came due before this evidence
    pub deferred: ReconcileReport,
    pub backfill: ReconcileReport,
    pub escalations: Vec<(NoteId, EscalationOutcome)>,
}

pub struct Engine {
    store: Arc<LedgerStore>,
    reconciler: Reconciler,
    escalation: EscalationCoordinator,
    diffusion: DiffusionSupervisor,
    blobs: Arc<dyn BlobIndex>,
    bus: EventBus,
    diffusion_requests: tokio::sync::Mutex<mpsc::UnboundedReceiver<SessionId>>,
}

impl Engine {
    pub fn new(store: Arc<LedgerStore>, config: &ResolvedConfig, collaborators: Collaborators) -> Self {
        let bus = EventBus::default();
        let (tx, rx) = mpsc::unbounded_channel();

        let reconciler = Reconciler::new(
            store.clone(),
            collaborators.synthesizer.clone(),
            config.reconcile.clone(),
            bus.clone(),
        );
        let escalation = EscalationCoordinator::new(
            store.clone(),
            collaborators.synthesizer.clone(),
            collaborators.capture.clone(),
            collaborators.governor.clone(),
            config.escalation.clone(),
            config.reconcile.clone(),
            bus.clone(),
            tx,
        )
        .with_note_locks(reconciler.note_locks());
        let diffusion = DiffusionSupervisor::new(
            store.clone(),
            collaborators.synthesizer.clone(),
            collaborators.governor.clone(),
            config.diffusion.clone(),
            config.reconcile.clone(),
            bus.clone(),
        );

        Self {
            store,
            reconciler,
            escalation,
            diffusion,
            blobs: collaborators.blobs,
            bus,
            diffusion_requests: tokio::sync::Mutex::new(rx),
        }
    }

    /// Engine over the durable ledger under the configured home
    pub async fn open(config: &ResolvedConfig) -> Result<Self> {
        let store = LedgerStore::open(config.sessions_dir())
            .await
            .with_context(|| format!("Failed to open ledger at {}", config.sessions_dir().display()))?
            .with_max_conflict_retries(config.ledger.max_conflict_retries);

        let engine = Self::new(
            Arc::new(store),
            config,
            Collaborators::from_config(config),
        );
        engine.restore_deferred().await?;
        Ok(engine)
    }

    /// Rebuild deferred revisions from every stored session.
    ///
    /// A session that fails to load is logged and skipped.
    pub async fn restore_deferred(&self) -> Result<usize> {
        let mut restored = 0;
        for session_id in self.store.sessions().await.context("Failed to list sessions")? {
            match self.reconciler.restore_deferred(&session_id).await {
                Ok(notes) => restored += notes.len(),
                Err(e) => warn!(session = %session_id, error = %e, "Deferred revisions not restored"),
            }
        }
        Ok(restored)
    }

    pub fn store(&self) -> &Arc<LedgerStore> {
        &self.store
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub fn diffusion(&self) -> &DiffusionSupervisor {
        &self.diffusion
    }

    /// Session events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.bus.subscribe()
    }

    /// Append an evidence entry and reconcile around it
    #[instrument(skip(self, payload), fields(session = %session_id, kind = %payload.kind()))]
    pub async fn ingest(&self, session_id: &SessionId, payload: EntryPayload) -> Result<IngestReport> {
        if !payload.kind().is_evidence() {
            bail!("Only evidence can be ingested, got {}", payload.kind());
        }
        if let Err(details) = payload.validate() {
            bail!("Invalid {} evidence: {}", payload.kind(), details);
        }

        let evidence = self
            .store
            .append_retrying(session_id, payload, BTreeSet::new())
            .await
            .context("Failed to append evidence")?;
        info!(seq = evidence.sequence, "Evidence appended");

        let deferred = self
            .reconciler
            .process_deferred(session_id)
            .await
            .context("Failed to process deferred revisions")?;
        let backfill = self
            .reconciler
            .on_evidence(&evidence)
            .await
            .context("Backfill reconciliation failed")?;

        let escalations = self
            .observe_all(deferred.updates.iter().chain(backfill.updates.iter()))
            .await?;

        Ok(IngestReport {
            evidence,
            deferred,
            backfill,
            escalations,
        })
    }

    pub async fn ingest_transcript(
        &self,
        session_id: &SessionId,
        evidence: TranscriptEvidence,
    ) -> Result<IngestReport> {
        self.ingest(session_id, EntryPayload::EvidenceTranscript(evidence))
            .await
    }

    pub async fn ingest_frame(
        &self,
        session_id: &SessionId,
        evidence: FrameEvidence,
    ) -> Result<IngestReport> {
        self.ingest(session_id, EntryPayload::EvidenceFrame(evidence))
            .await
    }

    /// Re-evaluate deferred revisions whose rate window has opened
    pub async fn process_deferred(&self, session_id: &SessionId) -> Result<ReconcileReport> {
        let report = self
            .reconciler
            .process_deferred(session_id)
            .await
            .context("Failed to process deferred revisions")?;
        self.observe_all(report.updates.iter()).await?;
        Ok(report)
    }

    /// Run deferred revisions as their rate windows open; runs until the handle is aborted
    pub fn spawn_deferred_worker(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let now = self.store.clock().now();
                for session_id in self.reconciler.due_sessions(now) {
                    if let Err(e) = self.process_deferred(&session_id).await {
                        error!(session = %session_id, error = %e, "Deferred revisions failed");
                    }
                }

                match self.reconciler.next_deferred() {
                    Some(at) => {
                        let wait = (at - self.store.clock().now())
                            .to_std()
                            .unwrap_or(Duration::ZERO);
                        tokio::select! {
                            _ = tokio::time::sleep(wait) => {}
                            _ = self.reconciler.deferred_changed() => {}
                        }
                    }
                    None => self.reconciler.deferred_changed().await,
                }
            }
        })
    }

    async fn observe_all<'a>(
        &self,
        updates: impl Iterator<Item = &'a NoteUpdate>,
    ) -> Result<Vec<(NoteId, EscalationOutcome)>> {
        let mut outcomes = Vec::new();
        for update in updates {
            let outcome = self
                .escalation
                .observe(update)
                .await
                .with_context(|| format!("Escalation failed for note {}", update.note.note_id))?;
            outcomes.push((update.note.note_id.clone(), outcome));
        }
        Ok(outcomes)
    }

    /// Current note projections, ordered by timestamp
    pub async fn get_notes(&self, session_id: &SessionId) -> Result<Vec<Note>> {
        let snapshot = replay::replay(&self.store, session_id, u64::MAX)
            .await
            .context("Failed to project notes")?;
        Ok(snapshot.active_notes())
    }

    /// User dismissed the escalation prompt of a note
    pub async fn dismiss(&self, session_id: &SessionId, note_id: &NoteId) -> Result<Option<LedgerEntry>> {
        Ok(self.escalation.dismiss(session_id, note_id).await?)
    }

    pub async fn schedule_diffusion(&self, session_id: &SessionId) -> Result<DiffusionTask, Rejected> {
        self.diffusion.schedule(session_id).await
    }

    /// Execute a scheduled pass and observe the revisions it committed
    pub async fn execute_diffusion(&self, task_id: Uuid) -> Result<DiffusionReport> {
        let report = self.diffusion.execute(task_id).await?;
        if let Some(last) = report.revisions.last() {
            let snapshot = replay::replay(&self.store, &report.task.session_id, last.sequence).await?;
            let updates: Vec<NoteUpdate> = report
                .revisions
                .iter()
                .filter_map(|entry| {
                    let note = snapshot.notes.get(entry.payload.note_id()?)?;
                    note.is_active().then(|| NoteUpdate {
                        entry: entry.clone(),
                        note: note.clone(),
                    })
                })
                .collect();
            self.observe_all(updates.iter()).await?;
        }
        Ok(report)
    }

    /// Schedule and execute a pass in one go
    pub async fn run_diffusion(&self, session_id: &SessionId) -> Result<DiffusionReport> {
        let task = self.schedule_diffusion(session_id).await?;
        self.execute_diffusion(task.id).await
    }

    /// Run the passes requested so far. Returns nothing while a worker owns the queue.
    pub async fn drain_diffusion_requests(&self) -> Vec<DiffusionReport> {
        let requested: Vec<SessionId> = {
            let Ok(mut rx) = self.diffusion_requests.try_lock() else {
                return Vec::new();
            };
            let mut seen = HashSet::new();
            let mut sessions = Vec::new();
            while let Ok(session_id) = rx.try_recv() {
                if seen.insert(session_id.clone()) {
                    sessions.push(session_id);
                }
            }
            sessions
        };

        let mut reports = Vec::new();
        for session_id in requested {
            if let Some(report) = self.handle_diffusion_request(&session_id).await {
                reports.push(report);
            }
        }
        reports
    }

    async fn handle_diffusion_request(&self, session_id: &SessionId) -> Option<DiffusionReport> {
        let task = match self.schedule_diffusion(session_id).await {
            Ok(task) => task,
            Err(rejected) => {
                info!(session = %session_id, reason = %rejected, "Diffusion request skipped");
                return None;
            }
        };

        match self.execute_diffusion(task.id).await {
            Ok(report) => Some(report),
            Err(e) => {
                error!(session = %session_id, error = %e, "Diffusion pass failed");
                None
            }
        }
    }

    /// Serve diffusion requests in the background; runs until the handle is aborted
    pub fn spawn_diffusion_worker(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut rx = self.diffusion_requests.lock().await;
            while let Some(session_id) = rx.recv().await {
                self.handle_diffusion_request(&session_id).await;
            }
        })
    }

    pub async fn replay(&self, session_id: &SessionId, up_to_sequence: u64) -> Result<SessionSnapshot> {
        Ok(replay::replay(&self.store, session_id, up_to_sequence).await?)
    }

    pub async fn export(&self, session_id: &SessionId) -> Result<SessionBundle> {
        Ok(replay::export(&self.store, session_id, self.blobs.as_ref()).await?)
    }

    pub async fn verify(&self, session_id: &SessionId) -> Result<ReplayVerification> {
        Ok(replay::verify_replay(&self.store, session_id).await?)
    }

    /// Raw ledger entries `from..=to`
    pub async fn ledger(&self, session_id: &SessionId, from: u64, to: u64) -> Result<Vec<Arc<LedgerEntry>>> {
        Ok(self.store.entries(session_id, from, to).await?)
    }
}
