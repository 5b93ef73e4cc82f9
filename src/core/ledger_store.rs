//! Append-only, hash-chained ledger with optimistic concurrency.
//!
//! Each session owns one chain. Writers read the chain tip, seal their
//! entry against it and commit with a tip check; if another writer got
//! there first the commit fails with [`LedgerError::ChainConflict`] and
//! nothing is written. Readers never take the commit lock.
//!
//! The durable backend stores each chain as newline-delimited JSON at
//! `<dir>/<session_id>/ledger.jsonl`. Commits take an exclusive file lock,
//! absorb entries other processes appended since the last sync, and only
//! then check the tip, so the compare-and-append holds across processes.

use std::collections::{BTreeSet, HashMap};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use fs2::FileExt;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, instrument};

use crate::core::clock::{Clock, SystemClock};
use crate::domain::{EntryKind, EntryPayload, LedgerEntry, SessionId, GENESIS_HASH};

/// Errors that can occur in the ledger store
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Chain conflict in session {session_id}: sealed at sequence {expected_sequence}, tip is at {actual_sequence}")]
    ChainConflict {
        session_id: SessionId,
        expected_sequence: u64,
        actual_sequence: u64,
    },

    #[error("Payload of kind {payload} cannot be appended as {kind}")]
    KindMismatch { kind: EntryKind, payload: EntryKind },

    #[error("Invalid {kind} payload: {details}")]
    InvalidPayload { kind: EntryKind, details: String },

    #[error("Hash chain broken in session {session_id} at sequence {sequence}: {details}")]
    HashChainBroken {
        session_id: SessionId,
        sequence: u64,
        details: String,
    },

    #[error("Session not loaded: {0}")]
    UnknownSession(SessionId),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LedgerError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, LedgerError::ChainConflict { .. })
    }
}

/// The point a writer seals its entries against
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tip {
    pub next_sequence: u64,
    pub prev_hash: String,
}

impl Tip {
    fn genesis() -> Self {
        Self {
            next_sequence: 0,
            prev_hash: GENESIS_HASH.to_string(),
        }
    }
}

/// An entry waiting to be sealed
#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub kind: EntryKind,
    pub payload: EntryPayload,
    pub references: BTreeSet<u64>,
}

impl PendingEntry {
    pub fn new(payload: EntryPayload, references: BTreeSet<u64>) -> Self {
        Self {
            kind: payload.kind(),
            payload,
            references,
        }
    }
}

/// One session's chain
struct SessionChain {
    entries: RwLock<Vec<Arc<LedgerEntry>>>,
    commit: tokio::sync::Mutex<()>,
}

impl SessionChain {
    fn new(entries: Vec<LedgerEntry>) -> Self {
        Self {
            entries: RwLock::new(entries.into_iter().map(Arc::new).collect()),
            commit: tokio::sync::Mutex::new(()),
        }
    }

    fn tip(&self) -> Tip {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        match entries.last() {
            Some(last) => Tip {
                next_sequence: last.sequence + 1,
                prev_hash: last.entry_hash.clone(),
            },
            None => Tip::genesis(),
        }
    }

    fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn get(&self, sequence: u64) -> Option<Arc<LedgerEntry>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(sequence as usize).cloned()
    }

    fn extend(&self, new_entries: Vec<Arc<LedgerEntry>>) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.extend(new_entries);
    }
}

/// Lazy, ordered, finite and restartable read over one session.
///
/// The upper bound is fixed when the cursor is created, so the cursor
/// sees a consistent prefix even while writers keep appending.
pub struct LedgerCursor {
    chain: Option<Arc<SessionChain>>,
    from: u64,
    /// Inclusive; `None` when the range is empty
    upper: Option<u64>,
    next: u64,
}

impl LedgerCursor {
    /// Rewind to the first entry of the range
    pub fn restart(&mut self) {
        self.next = self.from;
    }

    /// Last sequence this cursor will yield
    pub fn upper_bound(&self) -> Option<u64> {
        self.upper
    }
}

impl Iterator for LedgerCursor {
    type Item = Arc<LedgerEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        let upper = self.upper?;
        if self.next > upper {
            return None;
        }
        let entry = self.chain.as_ref()?.get(self.next)?;
        self.next += 1;
        Some(entry)
    }
}

/// The ledger store
pub struct LedgerStore {
    sessions: RwLock<HashMap<SessionId, Arc<SessionChain>>>,
    backend: Option<FileBackend>,
    clock: Arc<dyn Clock>,
    max_conflict_retries: u32,
}

impl LedgerStore {
    /// Volatile store (tests, simulations)
    pub fn in_memory() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            backend: None,
            clock: Arc::new(SystemClock),
            max_conflict_retries: 8,
        }
    }

    /// Durable store rooted at `sessions_dir`
    pub async fn open(sessions_dir: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let dir = sessions_dir.into();
        fs::create_dir_all(&dir).await?;

        Ok(Self {
            backend: Some(FileBackend { dir }),
            ..Self::in_memory()
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_max_conflict_retries(mut self, retries: u32) -> Self {
        self.max_conflict_retries = retries;
        self
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn max_conflict_retries(&self) -> u32 {
        self.max_conflict_retries
    }

    fn cached(&self, session_id: &SessionId) -> Option<Arc<SessionChain>> {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        sessions.get(session_id).cloned()
    }

    async fn chain(&self, session_id: &SessionId) -> Result<Arc<SessionChain>, LedgerError> {
        if let Some(chain) = self.cached(session_id) {
            return Ok(chain);
        }

        let loaded = match &self.backend {
            Some(backend) => backend.load(session_id).await?,
            None => Vec::new(),
        };
        verify_links(session_id, None, &loaded)?;

        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        let chain = sessions
            .entry(session_id.clone())
            .or_insert_with(|| Arc::new(SessionChain::new(loaded)))
            .clone();
        Ok(chain)
    }

    /// Current tip of a session chain
    pub async fn tip(&self, session_id: &SessionId) -> Result<Tip, LedgerError> {
        Ok(self.chain(session_id).await?.tip())
    }

    /// Every entry of a session chain together with the tip they end at.
    ///
    /// Sealing against the returned tip fails with `ChainConflict` if
    /// anything was appended after the entries were read.
    pub async fn head(
        &self,
        session_id: &SessionId,
    ) -> Result<(Tip, Vec<Arc<LedgerEntry>>), LedgerError> {
        let chain = self.chain(session_id).await?;
        let entries = chain.entries.read().unwrap_or_else(|e| e.into_inner()).clone();
        let tip = match entries.last() {
            Some(last) => Tip {
                next_sequence: last.sequence + 1,
                prev_hash: last.entry_hash.clone(),
            },
            None => Tip::genesis(),
        };
        Ok((tip, entries))
    }

    /// Number of entries in a session chain
    pub async fn len(&self, session_id: &SessionId) -> Result<u64, LedgerError> {
        Ok(self.chain(session_id).await?.len() as u64)
    }

    /// Append one entry against the current tip.
    ///
    /// Fails with `ChainConflict` if another writer advanced the tip between
    /// the tip read and the commit; the caller retries with a fresh read.
    pub async fn append(
        &self,
        session_id: &SessionId,
        kind: EntryKind,
        payload: EntryPayload,
        references: BTreeSet<u64>,
    ) -> Result<LedgerEntry, LedgerError> {
        let tip = self.tip(session_id).await?;
        self.append_at(session_id, &tip, kind, payload, references)
            .await
    }

    /// Append one entry sealed against a tip the caller already read
    #[instrument(skip(self, payload, references), fields(session = %session_id, seq = expected.next_sequence))]
    pub async fn append_at(
        &self,
        session_id: &SessionId,
        expected: &Tip,
        kind: EntryKind,
        payload: EntryPayload,
        references: BTreeSet<u64>,
    ) -> Result<LedgerEntry, LedgerError> {
        let pending = vec![PendingEntry {
            kind,
            payload,
            references,
        }];
        let mut committed = self.commit_pending(session_id, expected, pending).await?;
        committed
            .pop()
            .ok_or_else(|| LedgerError::UnknownSession(session_id.clone()))
    }

    /// Append several entries atomically against one tip check
    pub async fn append_batch(
        &self,
        session_id: &SessionId,
        expected: &Tip,
        pending: Vec<PendingEntry>,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        self.commit_pending(session_id, expected, pending).await
    }

    /// Append, re-reading the tip after each chain conflict
    pub async fn append_retrying(
        &self,
        session_id: &SessionId,
        payload: EntryPayload,
        references: BTreeSet<u64>,
    ) -> Result<LedgerEntry, LedgerError> {
        let pending = vec![PendingEntry::new(payload, references)];
        let mut committed = self.append_batch_retrying(session_id, pending).await?;
        committed
            .pop()
            .ok_or_else(|| LedgerError::UnknownSession(session_id.clone()))
    }

    /// Batch append, re-reading the tip after each chain conflict
    pub async fn append_batch_retrying(
        &self,
        session_id: &SessionId,
        pending: Vec<PendingEntry>,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        let mut attempt = 0u32;
        loop {
            let tip = self.tip(session_id).await?;
            match self
                .commit_pending(session_id, &tip, pending.clone())
                .await
            {
                Err(e) if e.is_conflict() && attempt < self.max_conflict_retries => {
                    attempt += 1;
                    debug!(session = %session_id, attempt, "Chain conflict, retrying with fresh tip");
                }
                other => return other,
            }
        }
    }

    async fn commit_pending(
        &self,
        session_id: &SessionId,
        expected: &Tip,
        pending: Vec<PendingEntry>,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        if pending.is_empty() {
            return Ok(Vec::new());
        }

        let created_at = self.clock.now();
        let mut sealed = Vec::with_capacity(pending.len());
        let mut prev_hash = expected.prev_hash.clone();
        for (offset, entry) in pending.into_iter().enumerate() {
            if entry.payload.kind() != entry.kind {
                return Err(LedgerError::KindMismatch {
                    kind: entry.kind,
                    payload: entry.payload.kind(),
                });
            }
            entry
                .payload
                .validate()
                .map_err(|details| LedgerError::InvalidPayload {
                    kind: entry.kind,
                    details,
                })?;
            let next = LedgerEntry::seal(
                session_id.clone(),
                expected.next_sequence + offset as u64,
                entry.payload,
                prev_hash,
                created_at,
                entry.references,
            )?;
            prev_hash = next.entry_hash.clone();
            sealed.push(next);
        }

        let chain = self.chain(session_id).await?;
        let _guard = chain.commit.lock().await;

        if let Some(backend) = &self.backend {
            let memory_tip = chain.tip();
            let outcome = backend
                .commit(session_id, chain.len(), memory_tip, sealed.clone())
                .await?;
            if !outcome.absorbed.is_empty() {
                let last = chain.get(chain.tip().next_sequence.wrapping_sub(1));
                verify_links(session_id, last.as_deref(), &outcome.absorbed)?;
                chain.extend(outcome.absorbed.into_iter().map(Arc::new).collect());
            }
            if !outcome.committed {
                return Err(LedgerError::ChainConflict {
                    session_id: session_id.clone(),
                    expected_sequence: expected.next_sequence,
                    actual_sequence: chain.tip().next_sequence,
                });
            }
        } else {
            let actual = chain.tip();
            if actual != *expected {
                return Err(LedgerError::ChainConflict {
                    session_id: session_id.clone(),
                    expected_sequence: expected.next_sequence,
                    actual_sequence: actual.next_sequence,
                });
            }
        }

        chain.extend(sealed.iter().cloned().map(Arc::new).collect());
        debug!(
            session = %session_id,
            first = expected.next_sequence,
            count = sealed.len(),
            "Appended ledger entries"
        );
        Ok(sealed)
    }

    /// Read `from..=to`, bounded by the tip observed now
    pub async fn read(
        &self,
        session_id: &SessionId,
        from_sequence: u64,
        to_sequence: u64,
    ) -> Result<LedgerCursor, LedgerError> {
        let chain = self.chain(session_id).await?;
        let len = chain.len() as u64;
        let upper = if len == 0 || from_sequence > to_sequence {
            None
        } else {
            let bound = to_sequence.min(len - 1);
            (bound >= from_sequence).then_some(bound)
        };

        Ok(LedgerCursor {
            chain: Some(chain),
            from: from_sequence,
            upper,
            next: from_sequence,
        })
    }

    /// Collect `from..=to` into a vector
    pub async fn entries(
        &self,
        session_id: &SessionId,
        from_sequence: u64,
        to_sequence: u64,
    ) -> Result<Vec<Arc<LedgerEntry>>, LedgerError> {
        Ok(self
            .read(session_id, from_sequence, to_sequence)
            .await?
            .collect())
    }

    /// Pull in entries other processes appended to the durable chain
    pub async fn refresh(&self, session_id: &SessionId) -> Result<u64, LedgerError> {
        let chain = self.chain(session_id).await?;
        let Some(backend) = &self.backend else {
            return Ok(0);
        };

        let _guard = chain.commit.lock().await;
        let on_disk = backend.load(session_id).await?;
        let known = chain.len();
        if on_disk.len() <= known {
            return Ok(0);
        }

        let absorbed: Vec<LedgerEntry> = on_disk.into_iter().skip(known).collect();
        let last = chain.get((known as u64).wrapping_sub(1));
        verify_links(session_id, last.as_deref(), &absorbed)?;
        let count = absorbed.len() as u64;
        chain.extend(absorbed.into_iter().map(Arc::new).collect());
        Ok(count)
    }

    /// Recompute every hash and link of a session chain.
    ///
    /// Returns the number of verified entries.
    pub async fn verify_chain(&self, session_id: &SessionId) -> Result<u64, LedgerError> {
        let entries: Vec<LedgerEntry> = self
            .read(session_id, 0, u64::MAX)
            .await?
            .map(|e| (*e).clone())
            .collect();
        verify_links(session_id, None, &entries)?;
        Ok(entries.len() as u64)
    }

    /// Drop a session from the in-memory cache (durable data stays)
    pub fn evict(&self, session_id: &SessionId) -> Result<(), LedgerError> {
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        sessions
            .remove(session_id)
            .map(|_| ())
            .ok_or_else(|| LedgerError::UnknownSession(session_id.clone()))
    }

    /// Sessions known to this store (cached or on disk)
    pub async fn sessions(&self) -> Result<Vec<SessionId>, LedgerError> {
        let mut ids: BTreeSet<SessionId> = {
            let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
            sessions.keys().cloned().collect()
        };

        if let Some(backend) = &self.backend {
            let mut dir = fs::read_dir(&backend.dir).await?;
            while let Some(entry) = dir.next_entry().await? {
                if entry.file_type().await?.is_dir() {
                    if let Some(name) = entry.file_name().to_str() {
                        ids.insert(SessionId::new(name));
                    }
                }
            }
        }

        Ok(ids.into_iter().collect())
    }
}

/// Check hashes, links and sequence continuity of `entries`, which follow `prev`
pub fn verify_links(
    session_id: &SessionId,
    prev: Option<&LedgerEntry>,
    entries: &[LedgerEntry],
) -> Result<(), LedgerError> {
    let (mut expected_sequence, mut expected_prev) = match prev {
        Some(p) => (p.sequence + 1, p.entry_hash.clone()),
        None => (0, GENESIS_HASH.to_string()),
    };

    for entry in entries {
        let broken = |details: String| LedgerError::HashChainBroken {
            session_id: session_id.clone(),
            sequence: entry.sequence,
            details,
        };

        if entry.session_id != *session_id {
            return Err(broken(format!("entry belongs to session {}", entry.session_id)));
        }
        if entry.sequence != expected_sequence {
            return Err(broken(format!("expected sequence {}", expected_sequence)));
        }
        if entry.prev_hash != expected_prev {
            return Err(broken("prev_hash does not match previous entry".to_string()));
        }
        if entry.kind != entry.payload.kind() {
            return Err(broken("kind does not match payload".to_string()));
        }
        if entry.payload.content_hash()? != entry.payload_hash {
            return Err(broken("payload_hash does not match payload".to_string()));
        }
        if entry.compute_entry_hash() != entry.entry_hash {
            return Err(broken("entry_hash does not match entry".to_string()));
        }

        expected_sequence += 1;
        expected_prev = entry.entry_hash.clone();
    }

    Ok(())
}

/// Result of a durable commit attempt
struct CommitOutcome {
    /// Entries found on disk that this process had not seen
    absorbed: Vec<LedgerEntry>,
    committed: bool,
}

/// JSONL files, one per session
struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    fn ledger_path(&self, session_id: &SessionId) -> PathBuf {
        self.dir.join(session_id.as_str()).join("ledger.jsonl")
    }

    async fn load(&self, session_id: &SessionId) -> Result<Vec<LedgerEntry>, LedgerError> {
        let path = self.ledger_path(session_id);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&path).await?;
        parse_lines(&content)
    }

    async fn commit(
        &self,
        session_id: &SessionId,
        known: usize,
        memory_tip: Tip,
        entries: Vec<LedgerEntry>,
    ) -> Result<CommitOutcome, LedgerError> {
        let path = self.ledger_path(session_id);
        let session_id = session_id.clone();
        tokio::task::spawn_blocking(move || {
            commit_blocking(&path, &session_id, known, memory_tip, entries)
        })
        .await
        .map_err(|e| LedgerError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
    }
}

fn parse_lines(content: &str) -> Result<Vec<LedgerEntry>, LedgerError> {
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).map_err(LedgerError::from))
        .collect()
}

fn commit_blocking(
    path: &Path,
    session_id: &SessionId,
    known: usize,
    memory_tip: Tip,
    entries: Vec<LedgerEntry>,
) -> Result<CommitOutcome, LedgerError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(path)?;
    file.lock_exclusive()?;

    let result = (|| {
        let mut content = String::new();
        file.read_to_string(&mut content)?;
        let on_disk = parse_lines(&content)?;

        if on_disk.len() < known {
            return Err(LedgerError::HashChainBroken {
                session_id: session_id.clone(),
                sequence: on_disk.len() as u64,
                details: "ledger file is shorter than the loaded chain".to_string(),
            });
        }

        let absorbed: Vec<LedgerEntry> = on_disk.into_iter().skip(known).collect();
        let disk_tip = match absorbed.last() {
            Some(last) => Tip {
                next_sequence: last.sequence + 1,
                prev_hash: last.entry_hash.clone(),
            },
            None => memory_tip,
        };

        let first = &entries[0];
        if first.sequence != disk_tip.next_sequence || first.prev_hash != disk_tip.prev_hash {
            return Ok(CommitOutcome {
                absorbed,
                committed: false,
            });
        }

        let mut buffer = String::new();
        for entry in &entries {
            buffer.push_str(&serde_json::to_string(entry)?);
            buffer.push('\n');
        }
        file.write_all(buffer.as_bytes())?;
        file.flush()?;
        file.sync_data()?;

        Ok(CommitOutcome {
            absorbed,
            committed: true,
        })
    })();

    let _ = file.unlock();
    result
}
