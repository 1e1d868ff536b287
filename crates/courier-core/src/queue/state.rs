//! Task state machine.

use serde::{Deserialize, Serialize};

/// Task state.
///
/// Transitions are forward-only:
/// - Pending -> InFlight -> Succeeded
/// - Pending -> InFlight -> Pending (retry with backoff, until the budget)
/// - Pending -> InFlight -> DeadLettered (budget spent or fast-failed)
/// - InFlight -> Pending (stale-lease recovery after a worker crash)
///
/// A retriable failure re-enters `Pending` with a future `next_attempt_at`;
/// terminal failure is `DeadLettered` and never leaves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting to run; eligible for lease once `next_attempt_at` is due.
    Pending,

    /// Exclusively owned by one worker for the current attempt.
    InFlight,

    /// Delivered (2xx). Kept for the audit window, then purged.
    Succeeded,

    /// Retries exhausted or fast-failed. Requires operator action; never
    /// retried automatically.
    DeadLettered,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::DeadLettered)
    }

    pub fn is_leasable(self) -> bool {
        matches!(self, TaskState::Pending)
    }

    /// Stable name used for persistence and log fields.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::InFlight => "in_flight",
            TaskState::Succeeded => "succeeded",
            TaskState::DeadLettered => "dead_lettered",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskState::Pending),
            "in_flight" => Some(TaskState::InFlight),
            "succeeded" => Some(TaskState::Succeeded),
            "dead_lettered" => Some(TaskState::DeadLettered),
            _ => None,
        }
    }
}
