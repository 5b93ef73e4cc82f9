//! Test doubles shared by the integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};

use notewell::adapters::{
    CaptureError, CaptureRequest, CaptureRequester, Captured, ContextWindow, SynthesisError,
    SynthesisOutput, SynthesisPurpose, Synthesizer,
};
use notewell::config::ResolvedConfig;
use notewell::core::{Collaborators, Engine, LedgerStore, ManualClock};
use notewell::domain::{EntryKind, SessionId, TranscriptEvidence};

type Script = dyn Fn(&ContextWindow) -> Result<SynthesisOutput, SynthesisError> + Send + Sync;
type Latency = dyn Fn(SynthesisPurpose) -> Duration + Send + Sync;

/// Synthesizer whose output is computed by a closure over the window
pub struct ScriptedSynthesizer {
    script: Box<Script>,
    /// Time spent before answering, so concurrent callers interleave
    latency: Box<Latency>,
    calls: Mutex<Vec<SynthesisPurpose>>,
}

impl ScriptedSynthesizer {
    pub fn new(
        script: impl Fn(&ContextWindow) -> Result<SynthesisOutput, SynthesisError>
            + Send
            + Sync
            + 'static,
    ) -> Arc<Self> {
        Self::with_latency(|_| Duration::ZERO, script)
    }

    pub fn with_latency(
        latency: impl Fn(SynthesisPurpose) -> Duration + Send + Sync + 'static,
        script: impl Fn(&ContextWindow) -> Result<SynthesisOutput, SynthesisError>
            + Send
            + Sync
            + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            script: Box::new(script),
            latency: Box::new(latency),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self, purpose: SynthesisPurpose) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|p| **p == purpose)
            .count()
    }
}

#[async_trait]
impl Synthesizer for ScriptedSynthesizer {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn synthesize(&self, window: &ContextWindow) -> Result<SynthesisOutput, SynthesisError> {
        self.calls.lock().unwrap().push(window.purpose);
        let latency = (self.latency)(window.purpose);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        (self.script)(window)
    }
}

/// Capture pipeline that hands back fixed evidence and remembers requests
pub struct RecordingCapture {
    evidence: Vec<Captured>,
    requests: Mutex<Vec<CaptureRequest>>,
}

impl RecordingCapture {
    pub fn new(evidence: Vec<Captured>) -> Arc<Self> {
        Arc::new(Self {
            evidence,
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<CaptureRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl CaptureRequester for RecordingCapture {
    async fn request_capture(&self, request: &CaptureRequest) -> Result<Vec<Captured>, CaptureError> {
        self.requests.lock().unwrap().push(request.clone());
        Ok(self.evidence.clone())
    }
}

pub fn output(text: &str, confidence: f64) -> SynthesisOutput {
    SynthesisOutput {
        text: text.to_string(),
        category: "observation".to_string(),
        confidence,
        gaps: Vec::new(),
    }
}

pub fn transcript(t: f64, text: &str, confidence: f64) -> TranscriptEvidence {
    TranscriptEvidence {
        timestamp_seconds: t,
        text: text.to_string(),
        confidence,
    }
}

pub fn manual_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap(),
    ))
}

pub fn config() -> ResolvedConfig {
    ResolvedConfig::with_home(PathBuf::from("/tmp/notewell-tests"))
}

/// Engine over an in-memory ledger driven by `clock`
pub fn engine(clock: Arc<ManualClock>, collaborators: Collaborators) -> Engine {
    let store = LedgerStore::in_memory().with_clock(clock);
    Engine::new(Arc::new(store), &config(), collaborators)
}

/// Engine over a durable ledger in `dir` driven by `clock`
pub async fn durable_engine(dir: &Path, clock: Arc<ManualClock>, collaborators: Collaborators) -> Engine {
    let store = LedgerStore::open(dir).await.unwrap().with_clock(clock);
    Engine::new(Arc::new(store), &config(), collaborators)
}

pub async fn kinds(engine: &Engine, session_id: &SessionId) -> Vec<EntryKind> {
    engine
        .ledger(session_id, 0, u64::MAX)
        .await
        .unwrap()
        .iter()
        .map(|e| e.kind)
        .collect()
}
