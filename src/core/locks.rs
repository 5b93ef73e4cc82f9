//! Per-note async locks.
//!
//! A lock lives in the map only while some task holds it or waits for it;
//! the last guard to be released removes the entry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;

use crate::domain::{NoteId, SessionId};

type NoteKey = (SessionId, NoteId);

#[derive(Default)]
pub struct NoteLocks {
    locks: Mutex<HashMap<NoteKey, Arc<tokio::sync::Mutex<()>>>>,
}

/// Exclusive access to one note until dropped
pub struct NoteGuard<'a> {
    locks: &'a NoteLocks,
    key: NoteKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl NoteLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, session_id: &SessionId, note_id: &NoteId) -> NoteGuard<'_> {
        let key = (session_id.clone(), note_id.clone());
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.entry(key.clone()).or_default().clone()
        };
        let guard = lock.lock_owned().await;
        NoteGuard {
            locks: self,
            key,
            guard: Some(guard),
        }
    }

    /// Notes currently locked or waited on
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for NoteGuard<'_> {
    fn drop(&mut self) {
        // waiters clone the lock under the map mutex, so the count is exact here
        let mut locks = self.locks.locks.lock().unwrap_or_else(|e| e.into_inner());
        drop(self.guard.take());
        if locks
            .get(&self.key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_released_lock_is_pruned() {
        let locks = NoteLocks::new();
        let session = SessionId::from("s1");

        {
            let _a = locks.lock(&session, &NoteId::new("a")).await;
            let _b = locks.lock(&session, &NoteId::new("b")).await;
            assert_eq!(locks.len(), 2);
        }
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_waiter_keeps_entry_until_done() {
        let locks = Arc::new(NoteLocks::new());
        let session = SessionId::from("s1");
        let note = NoteId::new("a");

        let first = locks.lock(&session, &note).await;
        let waiter = {
            let locks = locks.clone();
            let session = session.clone();
            let note = note.clone();
            tokio::spawn(async move {
                let _guard = locks.lock(&session, &note).await;
                tokio::time::sleep(Duration::from_millis(5)).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        drop(first);
        assert_eq!(locks.len(), 1);
        waiter.await.unwrap();
        assert!(locks.is_empty());
    }
}
