//! Command-line interface for notewell.
//!
//! Provides commands for ingesting evidence, listing notes, replaying and
//! exporting sessions, verifying ledgers, running deferred revisions and
//! handling escalations.

use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::config::{self, ResolvedConfig};
use crate::core::{Engine, EscalationOutcome};
use crate::domain::{EntryPayload, NoteId, SessionId};

/// notewell - Evidence ledger and diffusion reconciliation engine
#[derive(Parser, Debug)]
#[command(name = "notewell")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Ingest evidence (one JSON payload per line)
    Ingest {
        /// Session ID
        session: String,

        /// JSONL file (reads from stdin if not provided)
        file: Option<PathBuf>,
    },

    /// List current notes of a session
    Notes {
        /// Session ID
        session: String,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Replay a session up to a sequence and print the snapshot
    Replay {
        /// Session ID
        session: String,

        /// Last sequence to fold (defaults to the tip)
        #[arg(long)]
        up_to: Option<u64>,
    },

    /// Export a hash-stable session bundle
    Export {
        /// Session ID
        session: String,

        /// Output file (prints to stdout if not provided)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Verify chain integrity and replay determinism
    Verify {
        /// Session ID
        session: String,
    },

    /// Run a diffusion (refinement) pass
    Diffuse {
        /// Session ID
        session: String,
    },

    /// Run deferred revisions whose rate window has opened
    Reconcile {
        /// Session ID
        session: String,

        /// Keep running until no deferred revision is left
        #[arg(long)]
        wait: bool,
    },

    /// Dismiss the escalation prompt of a note
    Dismiss {
        /// Session ID
        session: String,

        /// Note ID
        note_id: String,
    },

    /// Print raw ledger entries
    Ledger {
        /// Session ID
        session: String,

        /// First sequence
        #[arg(long, default_value = "0")]
        from: u64,

        /// Last sequence (defaults to the tip)
        #[arg(long)]
        to: Option<u64>,
    },

    /// List known sessions
    Sessions,

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Ingest { session, file } => ingest(&session.as_str().into(), file).await,
            Commands::Notes { session, json } => list_notes(&session.as_str().into(), json).await,
            Commands::Replay { session, up_to } => replay(&session.as_str().into(), up_to).await,
            Commands::Export { session, output } => export(&session.as_str().into(), output).await,
            Commands::Verify { session } => verify(&session.as_str().into()).await,
            Commands::Diffuse { session } => diffuse(&session.as_str().into()).await,
            Commands::Reconcile { session, wait } => {
                reconcile(&session.as_str().into(), wait).await
            }
            Commands::Dismiss { session, note_id } => {
                dismiss(&session.as_str().into(), &NoteId::new(note_id)).await
            }
            Commands::Ledger { session, from, to } => {
                show_ledger(&session.as_str().into(), from, to).await
            }
            Commands::Sessions => list_sessions().await,
            Commands::Config => show_config(),
        }
    }
}

async fn engine() -> Result<Engine> {
    let cfg = config::config()?;
    Engine::open(cfg).await
}

/// Ingest evidence payloads from a JSONL file or stdin
async fn ingest(session_id: &SessionId, file: Option<PathBuf>) -> Result<()> {
    let input = match file {
        Some(path) => std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read evidence file: {}", path.display()))?,
        None => {
            let mut buffer = String::new();
            io::stdin()
                .read_to_string(&mut buffer)
                .context("Failed to read from stdin")?;
            buffer
        }
    };

    let engine = engine().await?;
    let mut ingested = 0usize;
    let mut updates = 0usize;
    let mut prompts = Vec::new();

    for (line_no, line) in input.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let payload: EntryPayload = serde_json::from_str(line)
            .with_context(|| format!("Invalid evidence on line {}", line_no + 1))?;

        let report = engine.ingest(session_id, payload).await?;
        ingested += 1;
        updates += report.deferred.updates.len() + report.backfill.updates.len();
        for (note_id, outcome) in report.escalations {
            if outcome == EscalationOutcome::Unresolved {
                prompts.push(note_id);
            }
        }
    }

    let passes = engine.drain_diffusion_requests().await;

    println!("Ingested {} evidence entries into {}", ingested, session_id);
    println!("Note updates: {}", updates);
    println!("Diffusion passes: {}", passes.len());
    if !prompts.is_empty() {
        println!("\nNotes needing attention:");
        for note_id in prompts {
            println!("  {}  (dismiss with: notewell dismiss {} {})", note_id, session_id, note_id);
        }
    }

    Ok(())
}

/// List current notes
async fn list_notes(session_id: &SessionId, json: bool) -> Result<()> {
    let engine = engine().await?;
    let notes = engine.get_notes(session_id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&notes)?);
        return Ok(());
    }

    if notes.is_empty() {
        println!("No notes in session {}", session_id);
        return Ok(());
    }

    println!("{:<14} {:>8} {:<12} {:>6}  TEXT", "NOTE ID", "AT", "CATEGORY", "CONF");
    println!("{}", "-".repeat(80));
    for note in notes {
        println!(
            "{:<14} {:>7.1}s {:<12} {:>6.2}  {}",
            note.note_id, note.timestamp_seconds, note.category, note.confidence, note.text
        );
    }

    Ok(())
}

/// Print the snapshot at a sequence
async fn replay(session_id: &SessionId, up_to: Option<u64>) -> Result<()> {
    let engine = engine().await?;
    let snapshot = engine
        .replay(session_id, up_to.unwrap_or(u64::MAX))
        .await?;

    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    eprintln!("\n[Digest: {}]", snapshot.digest()?);
    Ok(())
}

/// Export the session bundle
async fn export(session_id: &SessionId, output: Option<PathBuf>) -> Result<()> {
    let engine = engine().await?;
    let bundle = engine.export(session_id).await?;
    let json = serde_json::to_string_pretty(&bundle)?;

    match output {
        Some(path) => {
            std::fs::write(&path, json)
                .with_context(|| format!("Failed to write bundle: {}", path.display()))?;
            eprintln!("Bundle written to {}", path.display());
        }
        None => println!("{}", json),
    }
    eprintln!("Bundle hash: {}", bundle.bundle_hash);
    Ok(())
}

/// Verify the chain and replay determinism
async fn verify(session_id: &SessionId) -> Result<()> {
    let engine = engine().await?;
    let verification = engine.verify(session_id).await?;

    println!("Session:  {}", session_id);
    println!("Entries:  {}", verification.entries);
    println!("Digest:   {}", verification.digest);
    println!("Status:   ok");
    Ok(())
}

/// Run one diffusion pass
async fn diffuse(session_id: &SessionId) -> Result<()> {
    let engine = engine().await?;
    let report = engine.run_diffusion(session_id).await?;

    println!("Task:      {}", report.task.id);
    println!("Cursor:    {}", report.task.ledger_cursor);
    println!("Merged:    {}", report.merged);
    println!("Refined:   {}", report.refined);
    println!("Revisions: {}", report.revisions.len());
    println!("Cost:      {:.2}", report.task.cost_spent);
    Ok(())
}

/// Run due deferred revisions, optionally waiting for the rest
async fn reconcile(session_id: &SessionId, wait: bool) -> Result<()> {
    let engine = Arc::new(engine().await?);
    let report = engine.process_deferred(session_id).await?;
    println!("Deferred revisions run: {}", report.updates.len());
    if !report.failed.is_empty() {
        println!("Failed, retried later:  {}", report.failed.len());
    }

    if wait {
        let worker = engine.clone().spawn_deferred_worker();
        while let Some(at) = engine
            .reconciler()
            .deferred_notes(session_id)
            .into_iter()
            .map(|(_, at)| at)
            .min()
        {
            eprintln!("Waiting until {} for deferred revisions", at);
            let remaining = (at - engine.store().clock().now())
                .to_std()
                .unwrap_or(Duration::ZERO);
            tokio::time::sleep(remaining + Duration::from_secs(1)).await;
        }
        worker.abort();
        println!("All deferred revisions have run");
        return Ok(());
    }

    let waiting = engine.reconciler().deferred_notes(session_id);
    if !waiting.is_empty() {
        println!("\nStill deferred:");
        for (note_id, at) in waiting {
            println!("  {}  not before {}", note_id, at);
        }
    }
    Ok(())
}

/// Dismiss an escalation prompt
async fn dismiss(session_id: &SessionId, note_id: &NoteId) -> Result<()> {
    let engine = engine().await?;

    match engine.dismiss(session_id, note_id).await? {
        Some(entry) => println!("Escalation for {} dismissed (sequence {})", note_id, entry.sequence),
        None => println!("No open escalation for {}", note_id),
    }
    Ok(())
}

/// Print ledger entries as JSON lines
async fn show_ledger(session_id: &SessionId, from: u64, to: Option<u64>) -> Result<()> {
    let engine = engine().await?;
    let entries = engine
        .ledger(session_id, from, to.unwrap_or(u64::MAX))
        .await?;

    for entry in entries {
        println!("{}", serde_json::to_string(entry.as_ref())?);
    }
    Ok(())
}

async fn list_sessions() -> Result<()> {
    let engine = engine().await?;
    let sessions = engine.store().sessions().await?;

    if sessions.is_empty() {
        println!("No sessions found");
        return Ok(());
    }

    println!("{:<40} {:>8}", "SESSION", "ENTRIES");
    println!("{}", "-".repeat(49));
    for session_id in sessions {
        let len = engine.store().len(&session_id).await?;
        println!("{:<40} {:>8}", session_id, len);
    }
    Ok(())
}

/// Show resolved configuration
fn show_config() -> Result<()> {
    let cfg: &ResolvedConfig = config::config()?;

    println!("notewell configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:     {}", cfg.home.display());
    println!("  Sessions: {}", cfg.sessions_dir().display());
    println!();
    println!("Reconcile:");
    println!("  Window:               ±{}s", cfg.reconcile.window_seconds);
    println!("  Text similarity:      {}", cfg.reconcile.text_similarity_threshold);
    println!("  Confidence delta:     {}", cfg.reconcile.confidence_delta_threshold);
    println!("  Revision cap (hour):  {}", cfg.reconcile.revision_cap_per_hour);
    println!("  Deferred retry:       {}s", cfg.reconcile.deferred_retry_seconds);
    println!();
    println!("Escalation:");
    println!("  Window increment:     ±{}s", cfg.escalation.window_increment_seconds);
    println!("  Capture cost:         {}", cfg.escalation.capture_estimated_cost);
    println!();
    println!("Diffusion:");
    println!("  Max active/session:   {}", cfg.diffusion.max_active_per_session);
    println!("  Task timeout:         {}s", cfg.diffusion.task_timeout_seconds);
    println!("  Cost per pass:        {}", cfg.diffusion.estimated_cost_per_pass);
    println!();
    println!("Budget per session:     {}", cfg.budget.per_session);
    println!(
        "Synthesis:              {}",
        cfg.synthesis.endpoint.as_deref().unwrap_or("rule-based")
    );

    Ok(())
}
