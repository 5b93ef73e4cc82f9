//! Diffusion task supervisor: budget-bounded secondary refinement passes.
//!
//! A pass merges near-duplicate notes and re-words notes sitting in the
//! warning tier. Its input is fixed when the task is scheduled: the task
//! reads the ledger only up to `ledger_cursor`, so the planned revisions
//! are a function of that prefix alone. Revisions are committed in one
//! atomic batch; any failure aborts the task with nothing written. So does
//! a note the plan touches having been revised after the cursor: the
//! newer revision wins and a later pass starts from it.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::adapters::{
    synthesize_with_timeout, ContextWindow, CostGovernor, Reservation, SynthesisError,
    SynthesisOutput, SynthesisPurpose, Synthesizer,
};
use crate::config::{DiffusionSettings, ReconcileSettings};
use crate::core::bus::EventBus;
use crate::core::classifier::classify;
use crate::core::ledger_store::{LedgerError, LedgerStore, PendingEntry};
use crate::core::reconciler::DeltaThreshold;
use crate::core::replay::SessionSnapshot;
use crate::core::similarity::text_similarity;
use crate::domain::{
    EntryKind, EntryPayload, LedgerEntry, Note, NoteId, NoteRevision, RevisionReason,
    SessionEvent, SessionEventKind, SessionId, Tier, TimeRange,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Committed,
    Aborted,
}

/// One scheduled refinement pass
#[derive(Debug, Clone, Serialize)]
pub struct DiffusionTask {
    pub id: Uuid,
    pub session_id: SessionId,
    /// Last sequence the task may read
    pub ledger_cursor: u64,
    pub status: TaskStatus,
    pub cost_spent: f64,
}

/// Why a pass was not scheduled
#[derive(Debug, Error)]
pub enum Rejected {
    #[error("Session {session_id} already has {active} active diffusion task(s)")]
    ConcurrencyLimit { session_id: SessionId, active: usize },

    #[error("Cost budget exhausted for session {0}")]
    BudgetExhausted(SessionId),

    #[error("Session {0} has no ledger entries to refine")]
    EmptySession(SessionId),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Why a running pass was aborted
#[derive(Debug, Error)]
pub enum DiffusionError {
    #[error("Synthesis failed: {0}")]
    Synthesis(#[from] SynthesisError),

    #[error("Cost budget exhausted after spending {spent}")]
    BudgetExhausted { spent: f64 },

    #[error("Diffusion task timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("Unknown diffusion task: {0}")]
    UnknownTask(Uuid),

    #[error("Diffusion task {id} is {status:?}, expected queued")]
    NotQueued { id: Uuid, status: TaskStatus },

    #[error("Note {note_id} was revised at sequence {sequence}, after the task's cursor")]
    Superseded { note_id: NoteId, sequence: u64 },
}

/// Outcome of a committed pass
#[derive(Debug, Clone)]
pub struct DiffusionReport {
    pub task: DiffusionTask,
    pub merged: usize,
    pub refined: usize,
    pub revisions: Vec<LedgerEntry>,
}

/// Revisions planned against the task's ledger prefix
#[derive(Debug, Default)]
struct Plan {
    revisions: Vec<PendingEntry>,
    merged: usize,
    refined: usize,
}

pub struct DiffusionSupervisor {
    store: Arc<LedgerStore>,
    synthesizer: Arc<dyn Synthesizer>,
    governor: Arc<dyn CostGovernor>,
    settings: DiffusionSettings,
    reconcile: ReconcileSettings,
    threshold: DeltaThreshold,
    bus: EventBus,
    /// Queued and running tasks; finished tasks are dropped
    tasks: Mutex<HashMap<Uuid, DiffusionTask>>,
}

impl DiffusionSupervisor {
    pub fn new(
        store: Arc<LedgerStore>,
        synthesizer: Arc<dyn Synthesizer>,
        governor: Arc<dyn CostGovernor>,
        settings: DiffusionSettings,
        reconcile: ReconcileSettings,
        bus: EventBus,
    ) -> Self {
        Self {
            store,
            synthesizer,
            governor,
            settings,
            threshold: DeltaThreshold::from_settings(&reconcile),
            reconcile,
            bus,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Schedule a pass over the session's ledger as of now
    #[instrument(skip(self), fields(session = %session_id))]
    pub async fn schedule(&self, session_id: &SessionId) -> Result<DiffusionTask, Rejected> {
        let tip = self.store.tip(session_id).await?;
        if tip.next_sequence == 0 {
            return Err(Rejected::EmptySession(session_id.clone()));
        }

        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        let active = tasks
            .values()
            .filter(|t| t.session_id == *session_id)
            .count();
        if active >= self.settings.max_active_per_session {
            info!(active, "Diffusion rejected: concurrency limit");
            return Err(Rejected::ConcurrencyLimit {
                session_id: session_id.clone(),
                active,
            });
        }

        let cost = self.settings.estimated_cost_per_pass;
        if self.governor.reserve(session_id, cost) == Reservation::Denied {
            info!(cost, "Diffusion rejected: budget exhausted");
            return Err(Rejected::BudgetExhausted(session_id.clone()));
        }

        let task = DiffusionTask {
            id: Uuid::new_v4(),
            session_id: session_id.clone(),
            ledger_cursor: tip.next_sequence - 1,
            status: TaskStatus::Queued,
            cost_spent: cost,
        };
        tasks.insert(task.id, task.clone());
        info!(task_id = %task.id, cursor = task.ledger_cursor, "Diffusion task scheduled");
        Ok(task)
    }

    /// Current state of a queued or running task
    pub fn task(&self, id: Uuid) -> Option<DiffusionTask> {
        let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.get(&id).cloned()
    }

    pub fn active_tasks(&self, session_id: &SessionId) -> Vec<DiffusionTask> {
        let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks
            .values()
            .filter(|t| t.session_id == *session_id)
            .cloned()
            .collect()
    }

    /// Run a queued task to commit or abort
    #[instrument(skip(self), fields(task_id = %id))]
    pub async fn execute(&self, id: Uuid) -> Result<DiffusionReport, DiffusionError> {
        let task = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            let task = tasks.get_mut(&id).ok_or(DiffusionError::UnknownTask(id))?;
            if task.status != TaskStatus::Queued {
                return Err(DiffusionError::NotQueued {
                    id,
                    status: task.status,
                });
            }
            task.status = TaskStatus::Running;
            task.clone()
        };
        info!(session = %task.session_id, cursor = task.ledger_cursor, "Diffusion task running");

        let timeout = self.settings.task_timeout();
        let planned = match tokio::time::timeout(timeout, self.plan(&task)).await {
            Ok(result) => result,
            Err(_) => Err(DiffusionError::Timeout {
                seconds: timeout.as_secs(),
            }),
        };
        let outcome = match planned {
            Ok(plan) => self.commit(&task, plan).await,
            Err(e) => Err(e),
        };

        let mut finished = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.remove(&id).unwrap_or(task)
        };

        match outcome {
            Ok((plan, revisions)) => {
                finished.status = TaskStatus::Committed;
                info!(
                    merged = plan.merged,
                    refined = plan.refined,
                    revisions = revisions.len(),
                    cost = finished.cost_spent,
                    "Diffusion task committed"
                );
                Ok(DiffusionReport {
                    task: finished,
                    merged: plan.merged,
                    refined: plan.refined,
                    revisions,
                })
            }
            Err(e) => {
                finished.status = TaskStatus::Aborted;
                warn!(error = %e, cost = finished.cost_spent, "Diffusion task aborted");
                Err(e)
            }
        }
    }

    /// Reserve the cost of one synthesis call against the task
    fn charge(&self, task: &DiffusionTask) -> Result<(), DiffusionError> {
        let cost = self.settings.estimated_cost_per_pass;
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        let spent = tasks.get(&task.id).map(|t| t.cost_spent).unwrap_or(0.0);

        if self.governor.reserve(&task.session_id, cost) == Reservation::Denied {
            return Err(DiffusionError::BudgetExhausted { spent });
        }
        if let Some(t) = tasks.get_mut(&task.id) {
            t.cost_spent += cost;
        }
        Ok(())
    }

    async fn synthesize(
        &self,
        task: &DiffusionTask,
        window: &ContextWindow,
    ) -> Result<SynthesisOutput, DiffusionError> {
        self.charge(task)?;
        Ok(synthesize_with_timeout(
            self.synthesizer.as_ref(),
            window,
            self.reconcile.synthesis_timeout(),
        )
        .await?)
    }

    async fn plan(&self, task: &DiffusionTask) -> Result<Plan, DiffusionError> {
        let entries: Vec<Arc<LedgerEntry>> = self
            .store
            .read(&task.session_id, 0, task.ledger_cursor)
            .await?
            .collect();
        let snapshot = SessionSnapshot::fold(task.session_id.clone(), &entries);
        let notes = snapshot.active_notes();

        let mut plan = Plan::default();
        let mut touched: BTreeSet<NoteId> = BTreeSet::new();

        for (i, survivor) in notes.iter().enumerate() {
            if touched.contains(&survivor.note_id) {
                continue;
            }
            let candidate = notes[i + 1..]
                .iter()
                .take_while(|n| {
                    n.timestamp_seconds - survivor.timestamp_seconds
                        <= self.settings.merge_window_seconds
                })
                .find(|n| {
                    !touched.contains(&n.note_id)
                        && text_similarity(&survivor.text, &n.text)
                            >= self.settings.merge_similarity_threshold
                });

            if let Some(absorbed) = candidate {
                debug!(survivor = %survivor.note_id, absorbed = %absorbed.note_id, "Merging notes");
                self.plan_merge(task, survivor, absorbed, &entries, &mut plan)
                    .await?;
                touched.insert(survivor.note_id.clone());
                touched.insert(absorbed.note_id.clone());
            }
        }

        for note in notes.iter().filter(|n| !touched.contains(&n.note_id)) {
            if classify(note.confidence) != Tier::Warning {
                continue;
            }
            let window = ContextWindow::from_entries(
                task.session_id.clone(),
                SynthesisPurpose::Refinement,
                note.timestamp_seconds,
                TimeRange::around(note.timestamp_seconds, self.reconcile.window_seconds),
                &entries,
            )
            .for_note(note.note_id.clone(), note.text.clone());

            let output = self.synthesize(task, &window).await?;
            if !self.threshold.qualifies(note, &output) {
                debug!(note = %note.note_id, "Refinement within delta threshold");
                continue;
            }

            let references = note
                .lineage
                .iter()
                .copied()
                .chain(window.evidence_sequences())
                .collect();
            plan.revisions.push(PendingEntry::new(
                EntryPayload::NoteRevision(NoteRevision {
                    note_id: note.note_id.clone(),
                    text: output.text,
                    category: output.category,
                    confidence: output.confidence,
                    reason: RevisionReason::Refinement,
                    merged_into: None,
                    gaps: output.gaps,
                }),
                references,
            ));
            plan.refined += 1;
        }

        Ok(plan)
    }

    async fn plan_merge(
        &self,
        task: &DiffusionTask,
        survivor: &Note,
        absorbed: &Note,
        entries: &[Arc<LedgerEntry>],
        plan: &mut Plan,
    ) -> Result<(), DiffusionError> {
        let radius = self.reconcile.window_seconds;
        let range = TimeRange {
            start: (survivor.timestamp_seconds.min(absorbed.timestamp_seconds) - radius).max(0.0),
            end: survivor.timestamp_seconds.max(absorbed.timestamp_seconds) + radius,
        };
        let window = ContextWindow::from_entries(
            task.session_id.clone(),
            SynthesisPurpose::Merge,
            survivor.timestamp_seconds,
            range,
            entries,
        )
        .for_note(
            survivor.note_id.clone(),
            format!("{}\n{}", survivor.text, absorbed.text),
        );

        let output = self.synthesize(task, &window).await?;

        let survivor_refs: BTreeSet<u64> = survivor
            .lineage
            .iter()
            .chain(absorbed.lineage.iter())
            .copied()
            .chain(window.evidence_sequences())
            .collect();
        plan.revisions.push(PendingEntry::new(
            EntryPayload::NoteRevision(NoteRevision {
                note_id: survivor.note_id.clone(),
                text: output.text,
                category: output.category,
                confidence: output.confidence,
                reason: RevisionReason::Merge,
                merged_into: None,
                gaps: output.gaps,
            }),
            survivor_refs,
        ));
        plan.revisions.push(PendingEntry::new(
            EntryPayload::NoteRevision(NoteRevision {
                note_id: absorbed.note_id.clone(),
                text: absorbed.text.clone(),
                category: absorbed.category.clone(),
                confidence: absorbed.confidence,
                reason: RevisionReason::Merge,
                merged_into: Some(survivor.note_id.clone()),
                gaps: absorbed.gaps.clone(),
            }),
            absorbed.lineage.iter().copied().collect(),
        ));
        plan.merged += 1;
        Ok(())
    }

    async fn commit(
        &self,
        task: &DiffusionTask,
        plan: Plan,
    ) -> Result<(Plan, Vec<LedgerEntry>), DiffusionError> {
        if plan.revisions.is_empty() {
            return Ok((plan, Vec::new()));
        }

        let touched: BTreeSet<&NoteId> = plan
            .revisions
            .iter()
            .filter_map(|pending| pending.payload.note_id())
            .collect();

        let mut attempt = 0u32;
        let committed = loop {
            let (tip, entries) = self.store.head(&task.session_id).await?;
            let newer = entries
                .iter()
                .skip_while(|e| e.sequence <= task.ledger_cursor)
                .filter(|e| matches!(e.kind, EntryKind::NoteCreated | EntryKind::NoteRevision))
                .find_map(|e| {
                    let id = e.payload.note_id()?;
                    touched.contains(id).then(|| (id.clone(), e.sequence))
                });
            if let Some((note_id, sequence)) = newer {
                return Err(DiffusionError::Superseded { note_id, sequence });
            }

            match self
                .store
                .append_batch(&task.session_id, &tip, plan.revisions.clone())
                .await
            {
                Ok(committed) => break committed,
                Err(e) if e.is_conflict() && attempt < self.store.max_conflict_retries() => {
                    attempt += 1;
                    debug!(attempt, "Ledger moved during commit, re-checking touched notes");
                }
                Err(e) => return Err(e.into()),
            }
        };

        if let Some(last) = committed.last() {
            let snapshot = SessionSnapshot::fold(
                task.session_id.clone(),
                self.store
                    .read(&task.session_id, 0, last.sequence)
                    .await?,
            );
            for entry in &committed {
                let mut event = SessionEvent::new(
                    task.session_id.clone(),
                    entry.sequence,
                    SessionEventKind::NoteRevision,
                );
                if let Some(note) = entry.payload.note_id().and_then(|id| snapshot.notes.get(id)) {
                    event = event.with_note(note.clone());
                }
                self.bus.publish(event);
            }
        }

        Ok((plan, committed))
    }
}
