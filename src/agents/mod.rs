//! Agent execution: roles, slots, and the boundary to the reasoning engine
//!
//! The orchestrator never talks to a model directly. It hands an
//! `AgentRequest` to whatever implements `AgentRunner` and gets back an
//! artifact or a failure; `pool` bounds how many of those run at once.

pub mod pool;
pub mod runner;

use crate::models::{AgentRole, ArtifactDescriptor};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// One bounded execution resource.
///
/// A slot holds at most one work item at a time; its role and role priority
/// are fixed at configuration time.
#[derive(Debug, Clone, Serialize)]
pub struct AgentSlot {
    pub id: String,
    pub role: AgentRole,
    /// Tie-break among equally capable slots (lower preferred)
    pub role_priority: i32,
    /// Work item currently occupying the slot
    pub current_item: Option<String>,
}

impl AgentSlot {
    pub fn is_free(&self) -> bool {
        self.current_item.is_none()
    }
}

/// Cancellation flag shared between the orchestrator and a running agent.
///
/// Runners are expected to observe it between units of work; process-based
/// runners kill their child when it trips.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Everything an agent needs to execute one work item
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub work_item_id: String,
    pub role: AgentRole,
    pub title: String,
    pub body: Option<String>,
    pub worktree_path: PathBuf,
    pub branch_name: String,
}

/// Execution-layer failures
#[derive(Debug, Clone, Error)]
pub enum AgentError {
    #[error("agent execution for {work_item_id} timed out after {timeout_secs}s")]
    Timeout {
        work_item_id: String,
        timeout_secs: u64,
    },

    #[error("agent execution for {work_item_id} failed: {message}")]
    Failed {
        work_item_id: String,
        message: String,
    },

    #[error("agent execution for {work_item_id} was cancelled")]
    Cancelled { work_item_id: String },
}

/// Executes one work item inside its worktree.
///
/// Implementations run on a blocking thread and must check the cancel flag
/// periodically; the orchestrator frees the slot as soon as the flag trips,
/// it does not wait for a straggler to notice.
pub trait AgentRunner: Send + Sync {
    fn run(&self, request: &AgentRequest, cancel: &CancelFlag)
        -> Result<ArtifactDescriptor, AgentError>;
}
