//! Cost governor: per-session spend limits for diffusion and captures.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::domain::SessionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    Allowed,
    Denied,
}

pub trait CostGovernor: Send + Sync {
    /// Reserve `estimated_cost` against the session's budget
    fn reserve(&self, session_id: &SessionId, estimated_cost: f64) -> Reservation;
}

/// Fixed budget per session, tracked in memory
#[derive(Debug)]
pub struct SessionBudget {
    per_session: f64,
    spent: Mutex<HashMap<SessionId, f64>>,
}

impl SessionBudget {
    pub fn new(per_session: f64) -> Self {
        Self {
            per_session,
            spent: Mutex::new(HashMap::new()),
        }
    }
}

impl CostGovernor for SessionBudget {
    fn reserve(&self, session_id: &SessionId, estimated_cost: f64) -> Reservation {
        let mut spent = self.spent.lock().unwrap_or_else(|e| e.into_inner());
        let used = spent.entry(session_id.clone()).or_insert(0.0);
        if *used + estimated_cost > self.per_session {
            return Reservation::Denied;
        }
        *used += estimated_cost;
        Reservation::Allowed
    }
}
