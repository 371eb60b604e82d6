// Work item status state machine with validation

use super::WorkItemStatus;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateTransitionError {
    #[error("Invalid state transition from {from:?} to {to:?}")]
    InvalidTransition {
        from: WorkItemStatus,
        to: WorkItemStatus,
    },

    #[error("Work item already in terminal state: {0:?}")]
    AlreadyTerminal(WorkItemStatus),
}

/// Validates if a work item can transition from one status to another
pub fn can_transition(from: WorkItemStatus, to: WorkItemStatus) -> bool {
    use WorkItemStatus::*;

    match (from, to) {
        // From Queued
        (Queued, Assigned) => true,

        // From Blocked (dependency satisfaction, or cascade failure when a
        // dependency goes terminal)
        (Blocked, Queued) => true,
        (Blocked, Failed) => true,

        // From Assigned (worktree acquisition can fail before execution)
        (Assigned, InProgress) => true,
        (Assigned, Queued) => true,
        (Assigned, Failed) => true,

        // From InProgress (timeout and execution failure requeue)
        (InProgress, Gating) => true,
        (InProgress, Queued) => true,
        (InProgress, Failed) => true,

        // From Gating (gate failure and merge conflict requeue)
        (Gating, Merged) => true,
        (Gating, Queued) => true,
        (Gating, Failed) => true,

        // Same state is always allowed (no-op)
        (a, b) if a == b => true,

        // Merged and Failed are terminal; everything else is invalid
        _ => false,
    }
}

/// Validates and performs a state transition
pub fn transition_state(
    current: WorkItemStatus,
    target: WorkItemStatus,
) -> Result<WorkItemStatus, StateTransitionError> {
    if is_terminal_state(current) && current != target {
        return Err(StateTransitionError::AlreadyTerminal(current));
    }

    if !can_transition(current, target) {
        return Err(StateTransitionError::InvalidTransition {
            from: current,
            to: target,
        });
    }

    Ok(target)
}

/// Check if a status is a terminal state
pub fn is_terminal_state(status: WorkItemStatus) -> bool {
    matches!(status, WorkItemStatus::Merged | WorkItemStatus::Failed)
}

/// Check if a status indicates in-flight work (a slot or worktree is held)
pub fn is_in_flight_state(status: WorkItemStatus) -> bool {
    matches!(
        status,
        WorkItemStatus::Assigned | WorkItemStatus::InProgress | WorkItemStatus::Gating
    )
}
