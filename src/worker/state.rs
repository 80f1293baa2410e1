//! Per-request lifecycle state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Cap on the recorded transition history per task.
const MAX_TRANSITIONS: usize = 200;

/// Lifecycle phase of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPhase {
    /// Waiting in the queue.
    Pending,
    /// Bound to a slot, payload fetch in flight.
    AwaitingPayload,
    /// Running on a worker slot (or marked invalid and waiting to finalize).
    Executing,
    /// Result being stored and delivered.
    PendingFinalization,
    /// Published; no longer tracked.
    Terminal,
}

impl TaskPhase {
    /// Check if this phase allows moving to `target`.
    pub fn can_transition_to(&self, target: TaskPhase) -> bool {
        use TaskPhase::*;

        matches!(
            (self, target),
            (Pending, AwaitingPayload)
                | (AwaitingPayload, Executing)
                // Payload fetch failed; back to the queue.
                | (AwaitingPayload, Pending)
                | (Executing, PendingFinalization)
                // Timed out below the limit.
                | (Executing, Pending)
                | (PendingFinalization, Terminal)
        )
    }
}

impl std::fmt::Display for TaskPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::AwaitingPayload => "awaiting_payload",
            Self::Executing => "executing",
            Self::PendingFinalization => "pending_finalization",
            Self::Terminal => "terminal",
        };
        write!(f, "{s}")
    }
}

/// A phase transition event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: TaskPhase,
    pub to: TaskPhase,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

/// Current phase plus bounded transition history.
#[derive(Debug, Clone, Serialize)]
pub struct Lifecycle {
    pub phase: TaskPhase,
    pub transitions: Vec<StateTransition>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            phase: TaskPhase::Pending,
            transitions: Vec::new(),
        }
    }

    /// Move to a new phase.
    pub fn transition_to(
        &mut self,
        new_phase: TaskPhase,
        reason: Option<String>,
    ) -> Result<(), String> {
        if !self.phase.can_transition_to(new_phase) {
            return Err(format!(
                "Cannot transition from {} to {}",
                self.phase, new_phase
            ));
        }

        self.transitions.push(StateTransition {
            from: self.phase,
            to: new_phase,
            timestamp: Utc::now(),
            reason,
        });

        if self.transitions.len() > MAX_TRANSITIONS {
            let drain_count = self.transitions.len() - MAX_TRANSITIONS;
            self.transitions.drain(..drain_count);
        }

        self.phase = new_phase;
        Ok(())
    }

    /// How many times the request was bound to a slot, as far as the
    /// recorded history reaches.
    pub fn attempts(&self) -> usize {
        self.transitions
            .iter()
            .filter(|t| t.to == TaskPhase::AwaitingPayload)
            .count()
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_transitions_valid() {
        assert!(TaskPhase::Pending.can_transition_to(TaskPhase::AwaitingPayload));
        assert!(TaskPhase::AwaitingPayload.can_transition_to(TaskPhase::Executing));
        assert!(TaskPhase::Executing.can_transition_to(TaskPhase::PendingFinalization));
        assert!(TaskPhase::Executing.can_transition_to(TaskPhase::Pending));
        assert!(TaskPhase::PendingFinalization.can_transition_to(TaskPhase::Terminal));
    }

    #[test]
    fn phase_transitions_invalid() {
        assert!(!TaskPhase::Pending.can_transition_to(TaskPhase::Executing));
        assert!(!TaskPhase::Terminal.can_transition_to(TaskPhase::Pending));
        assert!(!TaskPhase::PendingFinalization.can_transition_to(TaskPhase::Pending));
        assert!(!TaskPhase::Executing.can_transition_to(TaskPhase::Terminal));
    }

    #[test]
    fn transition_history_capped() {
        let mut lifecycle = Lifecycle::new();
        lifecycle
            .transition_to(TaskPhase::AwaitingPayload, None)
            .unwrap();
        lifecycle.transition_to(TaskPhase::Executing, None).unwrap();
        for i in 0..150 {
            lifecycle
                .transition_to(TaskPhase::Pending, Some(format!("timeout {i}")))
                .unwrap();
            lifecycle
                .transition_to(TaskPhase::AwaitingPayload, None)
                .unwrap();
            lifecycle.transition_to(TaskPhase::Executing, None).unwrap();
        }
        assert_eq!(lifecycle.transitions.len(), 200);
        assert_eq!(lifecycle.phase, TaskPhase::Executing);
        // Each retry adds three transitions; the oldest were dropped.
        assert_eq!(lifecycle.attempts(), 67);
    }

    #[test]
    fn rejects_illegal_move() {
        let mut lifecycle = Lifecycle::new();
        let err = lifecycle
            .transition_to(TaskPhase::Terminal, None)
            .unwrap_err();
        assert!(err.contains("pending"));
        assert_eq!(lifecycle.phase, TaskPhase::Pending);
    }

    #[test]
    fn phase_serde() {
        let json = serde_json::to_string(&TaskPhase::PendingFinalization).unwrap();
        assert_eq!(json, "\"pending_finalization\"");
        assert_eq!(TaskPhase::AwaitingPayload.to_string(), "awaiting_payload");
    }
}
