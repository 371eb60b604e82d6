//! Agent pool coordinator
//!
//! Owns the fixed set of execution slots and assigns ready work items to free
//! ones. Each dispatch runs the agent on a blocking thread with a deadline
//! and a cancellation flag; the orchestrator polls the returned handle.

use crate::activation::ActivationState;
use crate::agents::{AgentError, AgentRequest, AgentRunner, AgentSlot, CancelFlag};
use crate::models::{AgentRole, ArtifactDescriptor, WorkItem};
use crate::worktree::Worktree;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no free agent slot for role {0}")]
    NoFreeSlot(AgentRole),

    #[error("work item {0} is already dispatched")]
    AlreadyDispatched(String),
}

/// Handle to one in-flight agent execution
pub struct ExecutionHandle {
    work_item_id: String,
    slot_id: String,
    cancel: CancelFlag,
    join: tokio::task::JoinHandle<Result<ArtifactDescriptor, AgentError>>,
    deadline: Instant,
    timeout: Duration,
}

impl ExecutionHandle {
    pub fn work_item_id(&self) -> &str {
        &self.work_item_id
    }

    pub fn slot_id(&self) -> &str {
        &self.slot_id
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub fn deadline_exceeded(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Raise the cancellation flag for the running agent
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Consume the handle as a timeout: cancel the agent and report the
    /// deadline failure without waiting for the straggler to notice
    pub fn into_timeout(self) -> AgentError {
        self.cancel.cancel();
        AgentError::Timeout {
            work_item_id: self.work_item_id,
            timeout_secs: self.timeout.as_secs(),
        }
    }

    /// Wait for the execution to finish and return its result
    pub async fn outcome(self) -> Result<ArtifactDescriptor, AgentError> {
        match self.join.await {
            Ok(result) => result,
            Err(e) => Err(AgentError::Failed {
                work_item_id: self.work_item_id,
                message: format!("agent task aborted: {}", e),
            }),
        }
    }
}

/// Bounded pool of role-typed agent slots
pub struct AgentPoolCoordinator {
    slots: Vec<AgentSlot>,
}

impl AgentPoolCoordinator {
    /// Build the pool from validated activation state: `slots_per_role`
    /// slots for every enabled role, carrying the configured role priority.
    pub fn from_activation(activation: &ActivationState, slots_per_role: usize) -> Self {
        let mut slots = Vec::new();
        for role in activation.enabled_roles() {
            let role_priority = activation.role_priority(role);
            for index in 0..slots_per_role {
                slots.push(AgentSlot {
                    id: format!("{}-{}", role, index),
                    role,
                    role_priority,
                    current_item: None,
                });
            }
        }
        log::info!("[Pool] Configured {} agent slot(s)", slots.len());
        Self { slots }
    }

    /// Free slots for a role, for scheduling decisions upstream
    pub fn capacity(&self, role: AgentRole) -> usize {
        self.slots
            .iter()
            .filter(|s| s.role == role && s.is_free())
            .count()
    }

    pub fn slots(&self) -> &[AgentSlot] {
        &self.slots
    }

    /// The slot currently executing a work item, if any
    pub fn slot_for_item(&self, work_item_id: &str) -> Option<&AgentSlot> {
        self.slots
            .iter()
            .find(|s| s.current_item.as_deref() == Some(work_item_id))
    }

    /// Assign a work item to a free slot and start executing it.
    ///
    /// Slot selection: role match first, then ascending role priority, then
    /// slot id. The slot is occupied before this returns, so a concurrent
    /// scheduling pass can never double-dispatch the same item.
    pub fn dispatch(
        &mut self,
        item: &WorkItem,
        worktree: &Worktree,
        runner: Arc<dyn AgentRunner>,
        timeout: Duration,
    ) -> Result<ExecutionHandle, DispatchError> {
        if self.slot_for_item(&item.id).is_some() {
            return Err(DispatchError::AlreadyDispatched(item.id.clone()));
        }

        let slot_id = {
            let slot = self
                .slots
                .iter_mut()
                .filter(|s| s.role == item.role && s.is_free())
                .min_by(|a, b| a.role_priority.cmp(&b.role_priority).then(a.id.cmp(&b.id)))
                .ok_or(DispatchError::NoFreeSlot(item.role))?;
            slot.current_item = Some(item.id.clone());
            slot.id.clone()
        };

        let request = AgentRequest {
            work_item_id: item.id.clone(),
            role: item.role,
            title: item.title.clone(),
            body: item.body.clone(),
            worktree_path: worktree.path.clone(),
            branch_name: worktree.branch_name.clone(),
        };

        let cancel = CancelFlag::new();
        let task_cancel = cancel.clone();
        let join = tokio::task::spawn_blocking(move || runner.run(&request, &task_cancel));

        log::info!(
            "[Pool] Dispatched {} to slot {} (deadline {}s)",
            item.id,
            slot_id,
            timeout.as_secs()
        );

        Ok(ExecutionHandle {
            work_item_id: item.id.clone(),
            slot_id,
            cancel,
            join,
            deadline: Instant::now() + timeout,
            timeout,
        })
    }

    /// Free a slot after its execution finished, timed out, or was cancelled
    pub fn release_slot(&mut self, slot_id: &str) {
        if let Some(slot) = self.slots.iter_mut().find(|s| s.id == slot_id) {
            if let Some(item) = slot.current_item.take() {
                log::debug!("[Pool] Freed slot {} (was {})", slot_id, item);
            }
        }
    }
}
