// Clippy allows for reasonable defaults
// These suppress warnings where the suggested change doesn't improve readability
#![allow(clippy::too_many_arguments)] // Orchestration constructors need many collaborators
#![allow(clippy::new_without_default)] // Default not always appropriate for stateful types
#![allow(clippy::collapsible_if)] // Separate ifs can be more readable

// Module declarations
pub mod activation;
pub mod agents;
pub mod config;
mod git;
pub mod logging;
pub mod models;
pub mod orchestrator;
pub mod quality;
pub mod queue;
pub mod tracker;
mod utils;
pub mod worktree;

// Re-export the types most embedders need
pub use activation::{ActivationState, AgentSettings};
pub use config::{ConfigManager, ForgeConfig, GateSettings, SchedulerSettings};
pub use models::{AgentRole, ArtifactDescriptor, WorkItem, WorkItemStatus};
pub use orchestrator::{Orchestrator, OrchestratorMetrics, OrchestratorState};
pub use quality::{QualityGateEnforcer, QualityReport};
pub use queue::{QueueError, WorkQueue};
pub use worktree::{Worktree, WorktreeConflictError, WorktreeManager};
