//! Git data types shared across operations

use serde::{Deserialize, Serialize};

/// Represents the result of a merge operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeOutcome {
    pub success: bool,
    pub message: String,
    pub conflict_files: Vec<String>,
    pub commit_id: Option<String>,
    pub fast_forward: bool,
}

/// Represents a registered git worktree
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorktreeEntry {
    pub name: String,
    pub path: String,
    pub branch: Option<String>,
}
