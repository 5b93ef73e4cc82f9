//! Diffusion Integration Tests
//!
//! Exclusive scheduling per session, cursor-bounded planning, commits
//! racing newer revisions and the background worker that serves warning
//! escalations.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{engine, kinds, manual_clock, output, transcript, ScriptedSynthesizer};
use notewell::adapters::SynthesisPurpose;
use notewell::core::{Collaborators, DiffusionError, EscalationOutcome, Rejected, TaskStatus};
use notewell::domain::{EntryKind, EntryPayload, RevisionReason, SessionEventKind, SessionId};

fn refining_synth() -> Arc<ScriptedSynthesizer> {
    ScriptedSynthesizer::new(|window| match window.purpose {
        SynthesisPurpose::Refinement => Ok(output(
            &format!("Whisk the eggs ({} sources)", window.transcripts.len()),
            0.75,
        )),
        _ => Ok(output("Whisk the eggs", 0.7)),
    })
}

#[tokio::test]
async fn test_concurrent_schedules_admit_one_task() {
    let engine = engine(manual_clock(), Collaborators::default());
    let session = SessionId::from("s1");
    engine
        .ingest_transcript(&session, transcript(10.0, "whisk the eggs", 0.9))
        .await
        .unwrap();

    let (a, b) = tokio::join!(
        engine.schedule_diffusion(&session),
        engine.schedule_diffusion(&session)
    );
    let admitted = [&a, &b].iter().filter(|r| r.is_ok()).count();
    assert_eq!(admitted, 1);
    let rejected = if a.is_ok() { b } else { a };
    assert!(matches!(rejected, Err(Rejected::ConcurrencyLimit { active: 1, .. })));

    // another session is not blocked
    let other = SessionId::from("s2");
    engine
        .ingest_transcript(&other, transcript(5.0, "preheat the oven", 0.9))
        .await
        .unwrap();
    assert!(engine.schedule_diffusion(&other).await.is_ok());
}

#[tokio::test]
async fn test_pass_only_sees_ledger_up_to_its_cursor() {
    let synth = refining_synth();
    let engine = engine(
        manual_clock(),
        Collaborators::default().with_synthesizer(synth.clone()),
    );
    let session = SessionId::from("s1");

    let first = engine
        .ingest_transcript(&session, transcript(10.0, "whisk the eggs", 0.7))
        .await
        .unwrap();
    assert_eq!(first.escalations[0].1, EscalationOutcome::DiffusionQueued);

    let task = engine.schedule_diffusion(&session).await.unwrap();
    assert_eq!(task.ledger_cursor, 1);
    assert_eq!(task.status, TaskStatus::Queued);

    // evidence after scheduling is outside the pass
    engine
        .ingest_transcript(&session, transcript(11.0, "until frothy", 0.7))
        .await
        .unwrap();

    let report = engine.execute_diffusion(task.id).await.unwrap();
    assert_eq!(report.task.status, TaskStatus::Committed);
    assert_eq!(report.refined, 1);
    assert_eq!(report.merged, 0);
    assert_eq!(report.revisions.len(), 1);

    match &report.revisions[0].payload {
        EntryPayload::NoteRevision(revision) => {
            assert_eq!(revision.reason, RevisionReason::Refinement);
            assert_eq!(revision.text, "Whisk the eggs (1 sources)");
        }
        other => panic!("expected a revision, got {:?}", other.kind()),
    }
    // committed after the later evidence
    assert!(report.revisions[0].sequence > 2);

    // committed and removed
    assert!(engine.diffusion().task(task.id).is_none());
    assert!(engine.diffusion().active_tasks(&session).is_empty());
}

/// Backfill lifts the note to stable; refinement would pull it back
fn competing_synth(refinement_latency: Duration) -> Arc<ScriptedSynthesizer> {
    ScriptedSynthesizer::with_latency(
        move |purpose| match purpose {
            SynthesisPurpose::Refinement => refinement_latency,
            _ => Duration::ZERO,
        },
        |window| match window.purpose {
            SynthesisPurpose::Create => Ok(output("Whisk the eggs", 0.7)),
            SynthesisPurpose::Backfill => Ok(output("Whisk the eggs until stiff peaks form", 0.95)),
            _ => Ok(output("Whisk the eggs gently", 0.75)),
        },
    )
}

fn assert_superseded(result: anyhow::Result<notewell::core::DiffusionReport>, sequence: u64) {
    let error = result.expect_err("commit should have been refused");
    match error.downcast_ref::<DiffusionError>() {
        Some(DiffusionError::Superseded { sequence: seq, .. }) => assert_eq!(*seq, sequence),
        other => panic!("expected a superseded commit, got {:?}", other),
    }
}

#[tokio::test]
async fn test_commit_refuses_to_overwrite_newer_revision() {
    let synth = competing_synth(Duration::ZERO);
    let engine = engine(
        manual_clock(),
        Collaborators::default().with_synthesizer(synth.clone()),
    );
    let session = SessionId::from("s1");

    engine
        .ingest_transcript(&session, transcript(10.0, "whisk the eggs", 0.7))
        .await
        .unwrap();
    let task = engine.schedule_diffusion(&session).await.unwrap();
    assert_eq!(task.ledger_cursor, 1);

    // backfill after the cursor revises the same note
    let backfill = engine
        .ingest_transcript(&session, transcript(12.0, "until stiff peaks form", 0.95))
        .await
        .unwrap();
    assert_eq!(backfill.backfill.updates[0].entry.sequence, 3);

    assert_superseded(engine.execute_diffusion(task.id).await, 3);
    assert_eq!(synth.calls(SynthesisPurpose::Refinement), 1);
    assert!(engine.diffusion().active_tasks(&session).is_empty());

    let notes = engine.get_notes(&session).await.unwrap();
    assert_eq!(notes[0].text, "Whisk the eggs until stiff peaks form");
    assert_eq!(notes[0].confidence, 0.95);
    assert_eq!(
        kinds(&engine, &session).await,
        vec![
            EntryKind::EvidenceTranscript,
            EntryKind::NoteCreated,
            EntryKind::EvidenceTranscript,
            EntryKind::NoteRevision,
            EntryKind::EscalationResolved,
        ]
    );
}

#[tokio::test]
async fn test_backfill_during_running_pass_wins() {
    let synth = competing_synth(Duration::from_millis(50));
    let engine = engine(
        manual_clock(),
        Collaborators::default().with_synthesizer(synth.clone()),
    );
    let session = SessionId::from("s1");

    engine
        .ingest_transcript(&session, transcript(10.0, "whisk the eggs", 0.7))
        .await
        .unwrap();
    let task = engine.schedule_diffusion(&session).await.unwrap();

    // the pass is mid-synthesis when the backfill lands
    let (pass, backfill) = tokio::join!(
        engine.execute_diffusion(task.id),
        engine.ingest_transcript(&session, transcript(12.0, "until stiff peaks form", 0.95)),
    );
    let backfill = backfill.unwrap();
    assert_eq!(backfill.backfill.updates.len(), 1);
    assert_superseded(pass, backfill.backfill.updates[0].entry.sequence);

    let notes = engine.get_notes(&session).await.unwrap();
    assert_eq!(notes[0].text, "Whisk the eggs until stiff peaks form");
    let refinements = engine
        .ledger(&session, 0, u64::MAX)
        .await
        .unwrap()
        .iter()
        .filter(|e| {
            matches!(&e.payload, EntryPayload::NoteRevision(r) if r.reason == RevisionReason::Refinement)
        })
        .count();
    assert_eq!(refinements, 0);
}

#[tokio::test]
async fn test_worker_serves_warning_escalations() {
    let synth = refining_synth();
    let engine = Arc::new(engine(
        manual_clock(),
        Collaborators::default().with_synthesizer(synth.clone()),
    ));
    let session = SessionId::from("s1");
    let mut events = engine.subscribe();
    let worker = engine.clone().spawn_diffusion_worker();

    engine
        .ingest_transcript(&session, transcript(10.0, "whisk the eggs", 0.7))
        .await
        .unwrap();

    let refined = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.unwrap();
            if event.kind == SessionEventKind::NoteRevision {
                return event;
            }
        }
    })
    .await
    .expect("worker did not refine the note");
    assert_eq!(refined.note.unwrap().confidence, 0.75);

    worker.abort();
    assert_eq!(synth.calls(SynthesisPurpose::Refinement), 1);
    assert_eq!(
        kinds(&engine, &session).await,
        vec![
            EntryKind::EvidenceTranscript,
            EntryKind::NoteCreated,
            EntryKind::NoteRevision,
        ]
    );
}
