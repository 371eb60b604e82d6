// Core data model: work items, roles, artifacts

pub mod state_machine;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Lifecycle status of a work item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemStatus {
    /// Admitted and eligible for scheduling
    Queued,
    /// Admitted but waiting on unmerged dependencies
    Blocked,
    /// Selected by the scheduler, worktree being prepared
    Assigned,
    /// Executing on an agent slot
    InProgress,
    /// Execution finished, quality gate running
    Gating,
    /// Work merged to the mainline (terminal)
    Merged,
    /// Permanently failed (terminal)
    Failed,
}

/// Role an agent slot performs.
///
/// This is a closed set: unknown role names in configuration are rejected at
/// load time rather than accepted silently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    Antihallucination,
    Planner,
    Architect,
    Coder,
    Tester,
    Reviewer,
}

impl AgentRole {
    pub const ALL: [AgentRole; 6] = [
        AgentRole::Antihallucination,
        AgentRole::Planner,
        AgentRole::Architect,
        AgentRole::Coder,
        AgentRole::Tester,
        AgentRole::Reviewer,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            AgentRole::Antihallucination => "antihallucination",
            AgentRole::Planner => "planner",
            AgentRole::Architect => "architect",
            AgentRole::Coder => "coder",
            AgentRole::Tester => "tester",
            AgentRole::Reviewer => "reviewer",
        }
    }

    /// Parse a role name. Returns None for anything outside the closed set.
    pub fn from_name(name: &str) -> Option<AgentRole> {
        match name.to_lowercase().as_str() {
            "antihallucination" => Some(AgentRole::Antihallucination),
            "planner" => Some(AgentRole::Planner),
            "architect" => Some(AgentRole::Architect),
            "coder" => Some(AgentRole::Coder),
            "tester" => Some(AgentRole::Tester),
            "reviewer" => Some(AgentRole::Reviewer),
            _ => None,
        }
    }

    /// Default scheduling priority for the role (lower = preferred).
    ///
    /// Antihallucination is highest-priority and typically reserved for
    /// verification passes rather than primary execution.
    pub fn default_priority(&self) -> i32 {
        match self {
            AgentRole::Antihallucination => 0,
            AgentRole::Planner => 1,
            AgentRole::Architect => 2,
            AgentRole::Coder => 3,
            AgentRole::Tester => 4,
            AgentRole::Reviewer => 5,
        }
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A unit of work sourced from the issue tracker.
///
/// The `sequence` field is assigned by the work queue at admission and gives
/// the stable FIFO tie-break among equal priorities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    /// Tracker issue id
    pub id: String,

    /// Short title describing the work
    pub title: String,

    /// Detailed description from the tracker
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,

    /// Priority level (lower = more urgent)
    pub priority: i32,

    /// Ids of work items that must merge before this one can run
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,

    /// Role required to execute this item
    pub role: AgentRole,

    pub status: WorkItemStatus,

    /// Times this item has been returned to the queue after a failure
    #[serde(default)]
    pub retry_count: u32,

    /// Insertion order, assigned by the queue
    #[serde(default)]
    pub sequence: u64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkItem {
    /// Create a new item in the Queued state with no dependencies.
    pub fn new(id: impl Into<String>, title: impl Into<String>, priority: i32, role: AgentRole) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: title.into(),
            body: None,
            priority,
            dependencies: Vec::new(),
            role,
            status: WorkItemStatus::Queued,
            retry_count: 0,
            sequence: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }
}

/// Artifact produced by a successful agent execution.
///
/// The branch holds the committed work; the worktree path is where the
/// quality gate runs its checks before the branch is allowed to merge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactDescriptor {
    pub work_item_id: String,
    pub branch_name: String,
    pub worktree_path: PathBuf,
    /// Optional free-form summary reported by the agent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}
