//! Backfill Reconciliation Integration Tests
//!
//! Late evidence against existing notes: delta threshold, hourly revision
//! cap with deferral, gap matching, synthesis failure and concurrent
//! evidence for the same note.

mod common;

use std::sync::Arc;

use chrono::Duration;
use tempfile::TempDir;

use common::{
    durable_engine, engine, kinds, manual_clock, output, transcript, ScriptedSynthesizer,
};
use notewell::adapters::{SynthesisError, SynthesisOutput, SynthesisPurpose};
use notewell::core::{Clock, Collaborators, Engine};
use notewell::domain::{EntryKind, NoteId, SessionEventKind, SessionId, TimeRange};

fn revisions(kinds: &[EntryKind]) -> usize {
    kinds.iter().filter(|k| **k == EntryKind::NoteRevision).count()
}

/// Every evidence fragment changes the note: "step N" for N transcripts
fn counting_synth() -> Arc<ScriptedSynthesizer> {
    ScriptedSynthesizer::new(|window| Ok(output(&format!("step {}", window.transcripts.len()), 0.9)))
}

/// Create a note, revise it three times, then defer the fourth revision
async fn fill_revision_window(engine: &Engine, session: &SessionId) -> NoteId {
    let created = engine
        .ingest_transcript(session, transcript(10.0, "first", 0.9))
        .await
        .unwrap();
    let note_id = created.backfill.updates[0].note.note_id.clone();

    for (i, t) in [11.0, 12.0, 13.0].into_iter().enumerate() {
        engine
            .ingest_transcript(session, transcript(t, &format!("more {}", i), 0.9))
            .await
            .unwrap();
    }
    let capped = engine
        .ingest_transcript(session, transcript(14.0, "one too many", 0.9))
        .await
        .unwrap();
    assert_eq!(capped.backfill.deferred, vec![note_id.clone()]);
    note_id
}

#[tokio::test]
async fn test_concurrent_evidence_revises_once() {
    let synth = ScriptedSynthesizer::with_latency(
        |_| std::time::Duration::from_millis(20),
        |window| match window.purpose {
            SynthesisPurpose::Create => Ok(output("Turn the valve", 0.9)),
            _ => Ok(output("Turn the valve clockwise", 0.92)),
        },
    );
    let engine = engine(
        manual_clock(),
        Collaborators::default().with_synthesizer(synth.clone()),
    );
    let session = SessionId::from("s1");

    engine
        .ingest_transcript(&session, transcript(10.0, "turn the valve", 0.9))
        .await
        .unwrap();

    // both reconcile against the same note while synthesis is in flight
    let (early, late) = tokio::join!(
        engine.ingest_transcript(&session, transcript(9.8, "clockwise", 0.9)),
        engine.ingest_transcript(&session, transcript(10.2, "clockwise, yes", 0.9)),
    );
    let (early, late) = (early.unwrap(), late.unwrap());

    assert_eq!(early.backfill.affected, 1);
    assert_eq!(late.backfill.affected, 1);
    assert_eq!(early.backfill.updates.len() + late.backfill.updates.len(), 1);
    assert_eq!(early.backfill.discarded + late.backfill.discarded, 1);

    let kinds = kinds(&engine, &session).await;
    assert_eq!(kinds.len(), 5);
    assert_eq!(revisions(&kinds), 1);
    assert_eq!(synth.calls(SynthesisPurpose::Backfill), 2);

    let notes = engine.get_notes(&session).await.unwrap();
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].text, "Turn the valve clockwise");
    assert_eq!(notes[0].lineage.len(), 2);
}

#[tokio::test]
async fn test_concurrent_first_evidence_creates_one_note() {
    let synth = ScriptedSynthesizer::with_latency(
        |_| std::time::Duration::from_millis(20),
        |window| match window.purpose {
            SynthesisPurpose::Create => Ok(output("Preheat the oven", 0.9)),
            _ => Ok(output("Preheat the oven", 0.9)),
        },
    );
    let engine = engine(manual_clock(), Collaborators::default().with_synthesizer(synth));
    let session = SessionId::from("s1");

    let (a, b) = tokio::join!(
        engine.ingest_transcript(&session, transcript(5.0, "preheat the oven", 0.9)),
        engine.ingest_transcript(&session, transcript(5.5, "to 200 degrees", 0.9)),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    // the slower writer finds the note and reconciles into it instead
    let created = [&a, &b]
        .iter()
        .flat_map(|r| r.backfill.updates.iter())
        .filter(|u| u.entry.kind == EntryKind::NoteCreated)
        .count();
    assert_eq!(created, 1);
    assert_eq!(a.backfill.affected + b.backfill.affected, 1);
    assert_eq!(engine.get_notes(&session).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_evidence_on_both_sides_of_a_note_revises_once() {
    let synth = ScriptedSynthesizer::new(|window| match window.purpose {
        SynthesisPurpose::Create => Ok(output("Turn the valve", 0.9)),
        _ => Ok(output("Turn the valve clockwise", 0.92)),
    });
    let engine = engine(
        manual_clock(),
        Collaborators::default().with_synthesizer(synth.clone()),
    );
    let session = SessionId::from("s1");

    engine
        .ingest_transcript(&session, transcript(10.0, "turn the valve", 0.9))
        .await
        .unwrap();

    let early = engine
        .ingest_transcript(&session, transcript(9.8, "clockwise", 0.9))
        .await
        .unwrap();
    assert_eq!(early.backfill.affected, 1);
    assert_eq!(early.backfill.updates.len(), 1);

    let late = engine
        .ingest_transcript(&session, transcript(10.2, "clockwise, yes", 0.9))
        .await
        .unwrap();
    assert_eq!(late.backfill.affected, 1);
    assert!(late.backfill.updates.is_empty());
    assert_eq!(late.backfill.discarded, 1);

    let kinds = kinds(&engine, &session).await;
    assert_eq!(kinds.len(), 5);
    assert_eq!(revisions(&kinds), 1);
    assert_eq!(synth.calls(SynthesisPurpose::Backfill), 2);

    let notes = engine.get_notes(&session).await.unwrap();
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].text, "Turn the valve clockwise");
    assert_eq!(notes[0].lineage.len(), 2);
}

#[tokio::test]
async fn test_small_confidence_wobble_is_discarded() {
    let synth = ScriptedSynthesizer::new(|window| match window.purpose {
        SynthesisPurpose::Create => Ok(output("Mix the dry ingredients", 0.9)),
        _ => Ok(output("Mix the dry ingredients", 0.93)),
    });
    let engine = engine(manual_clock(), Collaborators::default().with_synthesizer(synth));
    let session = SessionId::from("s1");

    engine
        .ingest_transcript(&session, transcript(10.0, "mix the dry ingredients", 0.9))
        .await
        .unwrap();
    let report = engine
        .ingest_transcript(&session, transcript(12.0, "dry ones first", 0.9))
        .await
        .unwrap();

    assert_eq!(report.backfill.discarded, 1);
    assert_eq!(revisions(&kinds(&engine, &session).await), 0);
}

#[tokio::test]
async fn test_fourth_revision_in_an_hour_is_deferred() {
    let clock = manual_clock();
    let start = clock.now();
    let synth = ScriptedSynthesizer::new(|window| {
        Ok(output(&format!("step {}", window.transcripts.len()), 0.9))
    });
    let engine = engine(clock.clone(), Collaborators::default().with_synthesizer(synth));
    let session = SessionId::from("s1");

    let created = engine
        .ingest_transcript(&session, transcript(10.0, "first", 0.9))
        .await
        .unwrap();
    let note_id: NoteId = created.backfill.updates[0].note.note_id.clone();

    for (i, t) in [11.0, 12.0, 13.0].into_iter().enumerate() {
        let report = engine
            .ingest_transcript(&session, transcript(t, &format!("more {}", i), 0.9))
            .await
            .unwrap();
        assert_eq!(report.backfill.updates.len(), 1);
    }

    let capped = engine
        .ingest_transcript(&session, transcript(14.0, "one too many", 0.9))
        .await
        .unwrap();
    assert!(capped.backfill.updates.is_empty());
    assert_eq!(capped.backfill.deferred, vec![note_id.clone()]);
    assert_eq!(
        engine.reconciler().deferred_notes(&session),
        vec![(note_id.clone(), start + Duration::hours(1))]
    );
    assert_eq!(revisions(&kinds(&engine, &session).await), 3);

    // window still closed
    clock.advance(Duration::minutes(30));
    let early = engine.process_deferred(&session).await.unwrap();
    assert!(early.updates.is_empty());

    clock.advance(Duration::minutes(31));
    let due = engine.process_deferred(&session).await.unwrap();
    assert_eq!(due.updates.len(), 1);
    assert!(engine.reconciler().deferred_notes(&session).is_empty());

    let snapshot = engine.replay(&session, u64::MAX).await.unwrap();
    let note = &snapshot.notes[&note_id];
    assert_eq!(note.text, "step 5");
    assert_eq!(note.revision_count_this_hour, 1);
    assert_eq!(revisions(&kinds(&engine, &session).await), 4);
}

#[tokio::test]
async fn test_deferred_worker_runs_revision_when_window_opens() {
    let clock = manual_clock();
    let engine = Arc::new(engine(
        clock.clone(),
        Collaborators::default().with_synthesizer(counting_synth()),
    ));
    let session = SessionId::from("s1");
    let note_id = fill_revision_window(&engine, &session).await;

    let mut events = engine.subscribe();
    let worker = engine.clone().spawn_deferred_worker();

    // window still closed: the worker waits
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert_eq!(revisions(&kinds(&engine, &session).await), 3);

    clock.advance(Duration::minutes(61));
    engine.reconciler().wake_deferred();

    let revised = tokio::time::timeout(std::time::Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.unwrap();
            if event.kind == SessionEventKind::NoteRevision {
                return event;
            }
        }
    })
    .await
    .expect("deferred revision did not run");
    worker.abort();

    let note = revised.note.unwrap();
    assert_eq!(note.note_id, note_id);
    assert_eq!(note.text, "step 5");
    assert!(engine.reconciler().deferred_notes(&session).is_empty());
    assert_eq!(revisions(&kinds(&engine, &session).await), 4);
}

#[tokio::test]
async fn test_deferred_revision_survives_restart() {
    let temp = TempDir::new().unwrap();
    let clock = manual_clock();
    let start = clock.now();
    let session = SessionId::from("s1");

    let note_id = {
        let engine = durable_engine(
            temp.path(),
            clock.clone(),
            Collaborators::default().with_synthesizer(counting_synth()),
        )
        .await;
        fill_revision_window(&engine, &session).await
    };

    let engine = durable_engine(
        temp.path(),
        clock.clone(),
        Collaborators::default().with_synthesizer(counting_synth()),
    )
    .await;
    assert!(engine.reconciler().deferred_notes(&session).is_empty());

    assert_eq!(engine.restore_deferred().await.unwrap(), 1);
    assert_eq!(
        engine.reconciler().deferred_notes(&session),
        vec![(note_id.clone(), start + Duration::hours(1))]
    );
    // restoring twice does not duplicate
    assert_eq!(engine.restore_deferred().await.unwrap(), 0);

    clock.advance(Duration::minutes(61));
    let due = engine.process_deferred(&session).await.unwrap();
    assert_eq!(due.updates.len(), 1);
    assert_eq!(due.updates[0].note.text, "step 5");
    assert_eq!(revisions(&kinds(&engine, &session).await), 4);
}

#[tokio::test]
async fn test_failed_deferred_revision_is_parked_again() {
    let clock = manual_clock();
    let failing = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let synth = {
        let failing = failing.clone();
        ScriptedSynthesizer::new(move |window| {
            if failing.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(SynthesisError::Upstream("service unavailable".to_string()));
            }
            Ok(output(&format!("step {}", window.transcripts.len()), 0.9))
        })
    };
    let engine = engine(clock.clone(), Collaborators::default().with_synthesizer(synth));
    let session = SessionId::from("s1");
    let note_id = fill_revision_window(&engine, &session).await;

    failing.store(true, std::sync::atomic::Ordering::SeqCst);
    clock.advance(Duration::minutes(61));
    let failed = engine.process_deferred(&session).await.unwrap();
    assert_eq!(failed.failed, vec![note_id.clone()]);
    assert_eq!(
        engine.reconciler().deferred_notes(&session),
        vec![(note_id.clone(), clock.now() + Duration::seconds(60))]
    );

    failing.store(false, std::sync::atomic::Ordering::SeqCst);
    clock.advance(Duration::seconds(60));
    let due = engine.process_deferred(&session).await.unwrap();
    assert_eq!(due.updates.len(), 1);
    assert!(engine.reconciler().deferred_notes(&session).is_empty());
}

#[tokio::test]
async fn test_evidence_inside_a_gap_reaches_the_note() {
    let synth = ScriptedSynthesizer::new(|window| match window.purpose {
        SynthesisPurpose::Create if window.center < 100.0 => Ok(SynthesisOutput {
            gaps: vec![TimeRange {
                start: 50.0,
                end: 90.0,
            }],
            ..output("Heat the pan", 0.85)
        }),
        SynthesisPurpose::Create => Ok(output("Serve", 0.9)),
        _ => Ok(output("Heat the pan until it smokes", 0.9)),
    });
    let engine = engine(manual_clock(), Collaborators::default().with_synthesizer(synth));
    let session = SessionId::from("s1");

    engine
        .ingest_transcript(&session, transcript(10.0, "heat the pan", 0.85))
        .await
        .unwrap();

    // outside ±30s, inside the recorded gap
    let in_gap = engine
        .ingest_transcript(&session, transcript(70.0, "until it smokes", 0.9))
        .await
        .unwrap();
    assert_eq!(in_gap.backfill.affected, 1);
    assert_eq!(in_gap.backfill.updates.len(), 1);

    // nothing nearby: a new note
    let unrelated = engine
        .ingest_transcript(&session, transcript(200.0, "serve", 0.9))
        .await
        .unwrap();
    assert_eq!(unrelated.backfill.affected, 0);
    assert_eq!(unrelated.backfill.updates[0].entry.kind, EntryKind::NoteCreated);

    let notes = engine.get_notes(&session).await.unwrap();
    assert_eq!(notes.len(), 2);
    assert_eq!(notes[0].text, "Heat the pan until it smokes");
    assert!(notes[0].gaps.is_empty());
}

#[tokio::test]
async fn test_synthesis_failure_keeps_last_known_good() {
    let synth = ScriptedSynthesizer::new(|window| match window.purpose {
        SynthesisPurpose::Create => Ok(output("Label the samples", 0.9)),
        _ => Err(SynthesisError::Upstream("service unavailable".to_string())),
    });
    let engine = engine(manual_clock(), Collaborators::default().with_synthesizer(synth));
    let session = SessionId::from("s1");

    let created = engine
        .ingest_transcript(&session, transcript(10.0, "label the samples", 0.9))
        .await
        .unwrap();
    let note_id = created.backfill.updates[0].note.note_id.clone();

    let report = engine
        .ingest_transcript(&session, transcript(12.0, "with the date", 0.9))
        .await
        .unwrap();
    assert_eq!(report.backfill.failed, vec![note_id]);
    assert!(report.backfill.updates.is_empty());

    assert_eq!(
        kinds(&engine, &session).await,
        vec![
            EntryKind::EvidenceTranscript,
            EntryKind::NoteCreated,
            EntryKind::EvidenceTranscript,
        ]
    );
    let notes = engine.get_notes(&session).await.unwrap();
    assert_eq!(notes[0].text, "Label the samples");
}
