//! Per-note escalation state machine.
//!
//! ```text
//! stable ──► warning ──► critical
//!    │          │           │
//!    └──────────┴─────┬─────┘
//!                     ▼
//!                 resolved   (terminal)
//! ```
//!
//! Tiers only move upward while a note is escalated. Any downward move of
//! an escalated note is a recovery and ends in `resolved`; nothing fires
//! once a note is resolved.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::ledger::NoteId;

/// Confidence tier of a note
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Stable,
    Warning,
    Critical,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Stable => write!(f, "stable"),
            Tier::Warning => write!(f, "warning"),
            Tier::Critical => write!(f, "critical"),
        }
    }
}

/// Last escalation action taken for a note
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationAction {
    WindowExpanded,
    CaptureRequested,
    CaptureRetried,
    Resolved,
}

/// Outcome of observing a new tier for a note
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Same tier as before
    Unchanged,
    /// Tier moved upward
    Raised { from: Tier, to: Tier },
    /// Escalated note came back down; resolution is due
    Recovered { from: Tier, to: Tier },
    /// Note already resolved
    Ignored,
}

/// Escalation state of one note
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationState {
    pub note_id: NoteId,
    pub tier: Tier,
    pub attempts: u32,
    pub last_action: Option<EscalationAction>,
    pub resolved: bool,
}

impl EscalationState {
    /// Every note starts stable; its first synthesis is observed like any other
    pub fn new(note_id: NoteId) -> Self {
        Self {
            note_id,
            tier: Tier::Stable,
            attempts: 0,
            last_action: None,
            resolved: false,
        }
    }

    /// Classify what observing `tier` would do, without changing state
    pub fn observe(&self, tier: Tier) -> Transition {
        if self.resolved {
            return Transition::Ignored;
        }
        match tier.cmp(&self.tier) {
            std::cmp::Ordering::Greater => Transition::Raised {
                from: self.tier,
                to: tier,
            },
            std::cmp::Ordering::Less => Transition::Recovered {
                from: self.tier,
                to: tier,
            },
            std::cmp::Ordering::Equal => Transition::Unchanged,
        }
    }

    /// Apply an upward move. Returns false when the move is not allowed.
    pub fn raise(&mut self, to: Tier) -> bool {
        if self.resolved || to <= self.tier {
            return false;
        }
        self.tier = to;
        true
    }

    /// Record a ladder action. Returns false once resolved.
    pub fn record_action(&mut self, action: EscalationAction) -> bool {
        if self.resolved {
            return false;
        }
        self.attempts += 1;
        self.last_action = Some(action);
        true
    }

    /// Enter the terminal state. Returns false if already resolved.
    pub fn resolve(&mut self) -> bool {
        if self.resolved {
            return false;
        }
        self.resolved = true;
        self.last_action = Some(EscalationAction::Resolved);
        true
    }

    /// Escalated and still awaiting resolution
    pub fn is_open(&self) -> bool {
        !self.resolved && self.tier != Tier::Stable
    }
}
