use serde::Serialize;

use crate::types::RunStatus;

/// Describes a single valid state transition for a run.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct StateTransition {
    pub from: RunStatus,
    pub to: RunStatus,
    pub trigger: &'static str,
}

const TRANSITIONS: &[StateTransition] = &[
    // Due runs are claimed by one worker.
    StateTransition {
        from: RunStatus::Active,
        to: RunStatus::Processing,
        trigger: "claim",
    },
    StateTransition {
        from: RunStatus::WaitingDelay,
        to: RunStatus::Processing,
        trigger: "claim",
    },
    // Processing ->
    StateTransition {
        from: RunStatus::Processing,
        to: RunStatus::Active,
        trigger: "advance_immediately",
    },
    StateTransition {
        from: RunStatus::Processing,
        to: RunStatus::WaitingDelay,
        trigger: "advance_after_delay",
    },
    StateTransition {
        from: RunStatus::Processing,
        to: RunStatus::Completed,
        trigger: "end_of_sequence",
    },
    StateTransition {
        from: RunStatus::Processing,
        to: RunStatus::Failed,
        trigger: "execution_failed",
    },
    StateTransition {
        from: RunStatus::Processing,
        to: RunStatus::Cancelled,
        trigger: "deferred_cancel",
    },
    // Parked runs can be cancelled directly.
    StateTransition {
        from: RunStatus::Active,
        to: RunStatus::Cancelled,
        trigger: "cancel",
    },
    StateTransition {
        from: RunStatus::WaitingDelay,
        to: RunStatus::Cancelled,
        trigger: "cancel",
    },
];

/// Guards the run lifecycle by enforcing a finite set of valid transitions.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunStateMachine;

impl RunStateMachine {
    pub fn transitions() -> &'static [StateTransition] {
        TRANSITIONS
    }

    /// Returns `true` if the given transition is allowed.
    pub fn can_transition(from: RunStatus, to: RunStatus) -> bool {
        TRANSITIONS.iter().any(|t| t.from == from && t.to == to)
    }

    /// Name of the trigger for an allowed transition.
    pub fn trigger(from: RunStatus, to: RunStatus) -> Option<&'static str> {
        TRANSITIONS
            .iter()
            .find(|t| t.from == from && t.to == to)
            .map(|t| t.trigger)
    }
}
