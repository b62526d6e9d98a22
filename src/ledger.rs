//! Session ledger: per-turn token and cost accounting.
//!
//! The only shared mutable resource in the pipeline. All state lives
//! behind one mutex, which makes each `record_turn` a single atomic
//! read-modify-write; concurrent turns in the same session cannot lose
//! updates. Re-delivery of a turn id is ignored, so usage is counted
//! at most once per assistant turn. Cancelled turns never call
//! `record_turn`, so no partial update exists for them.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::models::SessionUsage;

#[derive(Default)]
struct LedgerState {
    sessions: HashMap<String, SessionUsage>,
    /// user_id -> session_ids
    users: HashMap<String, HashSet<String>>,
    seen_turns: HashSet<String>,
}

/// Accumulates token usage per session and per user.
pub struct SessionLedger {
    state: Mutex<LedgerState>,
    cost_per_million_tokens: f64,
}

impl SessionLedger {
    pub fn new(cost_per_million_tokens: f64) -> Self {
        Self {
            state: Mutex::new(LedgerState::default()),
            cost_per_million_tokens,
        }
    }

    /// Associate a session with a user for [`get_user_usage`] aggregation.
    ///
    /// [`get_user_usage`]: SessionLedger::get_user_usage
    pub fn bind_user(&self, session_id: &str, user_id: &str) {
        let mut state = self.state.lock().expect("ledger mutex poisoned");
        state
            .users
            .entry(user_id.to_string())
            .or_default()
            .insert(session_id.to_string());
    }

    /// Record one assistant turn's usage.
    ///
    /// Idempotent on `turn_id`: duplicates are ignored. When no cost
    /// estimate is supplied it is derived from `tokens_used` via the
    /// configured blended rate. Returns whether the turn was recorded
    /// (false on duplicate delivery).
    pub fn record_turn(
        &self,
        session_id: &str,
        turn_id: &str,
        tokens_used: u64,
        cost_estimate: Option<f64>,
    ) -> bool {
        let mut state = self.state.lock().expect("ledger mutex poisoned");

        if !state.seen_turns.insert(turn_id.to_string()) {
            return false;
        }

        let cost = cost_estimate
            .unwrap_or_else(|| tokens_used as f64 * self.cost_per_million_tokens / 1_000_000.0);

        let now = Utc::now();
        let usage = state
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionUsage {
                session_id: session_id.to_string(),
                cumulative_tokens: 0,
                cumulative_cost: 0.0,
                last_updated: now,
            });
        usage.cumulative_tokens += tokens_used;
        usage.cumulative_cost += cost;
        usage.last_updated = now;
        true
    }

    pub fn get_session_usage(&self, session_id: &str) -> Option<SessionUsage> {
        let state = self.state.lock().expect("ledger mutex poisoned");
        state.sessions.get(session_id).cloned()
    }

    /// Aggregate usage over all sessions bound to `user_id`.
    pub fn get_user_usage(&self, user_id: &str) -> Option<UserUsage> {
        let state = self.state.lock().expect("ledger mutex poisoned");
        let session_ids = state.users.get(user_id)?;

        let mut tokens = 0u64;
        let mut cost = 0.0f64;
        let mut last_updated: Option<DateTime<Utc>> = None;
        let mut sessions = 0usize;

        for id in session_ids {
            if let Some(usage) = state.sessions.get(id) {
                tokens += usage.cumulative_tokens;
                cost += usage.cumulative_cost;
                sessions += 1;
                last_updated = Some(match last_updated {
                    Some(t) if t > usage.last_updated => t,
                    _ => usage.last_updated,
                });
            }
        }

        Some(UserUsage {
            user_id: user_id.to_string(),
            sessions,
            cumulative_tokens: tokens,
            cumulative_cost: cost,
            last_updated,
        })
    }
}

/// Usage aggregated across a user's sessions.
#[derive(Debug, Clone)]
pub struct UserUsage {
    pub user_id: String,
    pub sessions: usize,
    pub cumulative_tokens: u64,
    pub cumulative_cost: f64,
    pub last_updated: Option<DateTime<Utc>>,
}
