//! Orchestrator facade
//!
//! Drives the control loop: ingest issues from the tracker, pull ready work
//! from the queue, acquire a worktree, dispatch to the agent pool, run the
//! quality gate on the result, then merge or requeue. The queue and the
//! worktree/slot registries are the only shared mutable state; each sits
//! behind its own mutex and no lock is held while waiting on the tracker,
//! git, or an agent.

use crate::activation::ActivationState;
use crate::agents::pool::{AgentPoolCoordinator, ExecutionHandle};
use crate::agents::{AgentError, AgentRunner};
use crate::config::SchedulerSettings;
use crate::git::GitClient;
use crate::models::state_machine;
use crate::models::{ArtifactDescriptor, WorkItem, WorkItemStatus};
use crate::quality::{QualityGateEnforcer, QualityReport};
use crate::queue::{QueueError, RequeueOutcome, WorkQueue};
use crate::tracker::{work_item_from_issue, IssueTracker, LabelMap, TrackerError, TrackerIssue};
use crate::utils::lock_mutex_recover;
use crate::worktree::{Worktree, WorktreeManager};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Label posted to the tracker when an item is permanently failed
const FAILED_LABEL: &str = "forgeflow:failed";

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("git operation failed: {0}")]
    Git(#[from] git2::Error),

    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Merge failures for one work item's current attempt
#[derive(Debug, Error)]
enum MergeError {
    #[error("merge conflict in: {}", .0.join(", "))]
    Conflict(Vec<String>),

    #[error("{0}")]
    Other(String),
}

/// Current state of the orchestration loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorState {
    Idle,
    Running,
    Completed,
    Cancelled,
}

/// Cumulative counters for one orchestration run
#[derive(Debug, Clone, Default, Serialize)]
pub struct OrchestratorMetrics {
    pub dispatches: u32,
    pub merged: u32,
    pub failed_terminally: u32,
    pub gate_failures: u32,
    pub timeouts: u32,
    pub merge_conflicts: u32,
    pub cancelled: u32,
    pub total_duration_secs: f64,
}

/// The facade that owns the authoritative registries and runs the loop
pub struct Orchestrator {
    activation: ActivationState,
    settings: SchedulerSettings,
    execution_id: String,
    mainline_branch: String,
    queue: Arc<Mutex<WorkQueue>>,
    worktrees: Arc<Mutex<WorktreeManager>>,
    pool: Arc<Mutex<AgentPoolCoordinator>>,
    gate: QualityGateEnforcer,
    tracker: Arc<dyn IssueTracker>,
    runner: Arc<dyn AgentRunner>,
    label_map: LabelMap,
    /// In-flight executions by work item id
    active: HashMap<String, ExecutionHandle>,
    /// Gate reports retained for audit until the item goes terminal
    reports: HashMap<String, QualityReport>,
    /// Only one merge into the mainline may be in flight at a time
    merge_lock: Arc<Mutex<()>>,
    cancelled: Arc<Mutex<bool>>,
    state: OrchestratorState,
    metrics: OrchestratorMetrics,
    last_tracker_poll: Option<Instant>,
}

impl Orchestrator {
    /// Build an orchestrator from validated activation state.
    ///
    /// The mainline branch is taken from the settings, falling back to the
    /// repository's current HEAD branch.
    pub fn new(
        activation: ActivationState,
        settings: SchedulerSettings,
        gate: QualityGateEnforcer,
        tracker: Arc<dyn IssueTracker>,
        runner: Arc<dyn AgentRunner>,
    ) -> Result<Self, OrchestratorError> {
        let mainline_branch = match &settings.mainline_branch {
            Some(branch) => branch.clone(),
            None => GitClient::open(&activation.project_path)?.default_branch_name(),
        };

        let queue = WorkQueue::new(settings.retry_ceiling);
        let worktrees = WorktreeManager::new(&activation.project_path);
        let pool = AgentPoolCoordinator::from_activation(&activation, settings.slots_per_role);

        Ok(Self {
            execution_id: uuid::Uuid::new_v4().to_string(),
            mainline_branch,
            queue: Arc::new(Mutex::new(queue)),
            worktrees: Arc::new(Mutex::new(worktrees)),
            pool: Arc::new(Mutex::new(pool)),
            gate,
            tracker,
            runner,
            label_map: LabelMap::default(),
            active: HashMap::new(),
            reports: HashMap::new(),
            merge_lock: Arc::new(Mutex::new(())),
            cancelled: Arc::new(Mutex::new(false)),
            state: OrchestratorState::Idle,
            metrics: OrchestratorMetrics::default(),
            last_tracker_poll: None,
            activation,
            settings,
        })
    }

    pub fn with_label_map(mut self, label_map: LabelMap) -> Self {
        self.label_map = label_map;
        self
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    pub fn state(&self) -> OrchestratorState {
        self.state
    }

    pub fn metrics(&self) -> &OrchestratorMetrics {
        &self.metrics
    }

    pub fn mainline_branch(&self) -> &str {
        &self.mainline_branch
    }

    /// Snapshot of the work item registry, in admission order
    pub fn work_items(&self) -> Vec<WorkItem> {
        lock_mutex_recover(&self.queue).snapshot()
    }

    /// Snapshot of the live worktrees
    pub fn worktrees(&self) -> Vec<Worktree> {
        lock_mutex_recover(&self.worktrees).snapshot()
    }

    /// The retained gate report for an item still in flight
    pub fn quality_report(&self, work_item_id: &str) -> Option<&QualityReport> {
        self.reports.get(work_item_id)
    }

    /// Get a handle that cancels the whole run when set
    pub fn cancel_handle(&self) -> Arc<Mutex<bool>> {
        self.cancelled.clone()
    }

    /// Request cancellation of the whole run
    pub fn cancel(&mut self) {
        *lock_mutex_recover(&self.cancelled) = true;
    }

    /// Run the orchestration loop.
    ///
    /// With `exit_when_idle` set (the default) the loop returns once every
    /// admitted item is terminal and no agent is running; otherwise it keeps
    /// polling the tracker until cancelled.
    pub async fn run(&mut self) -> Result<OrchestratorMetrics, OrchestratorError> {
        log::info!(
            "[Orchestrator] Starting execution {} for '{}' ({} slot(s), mainline '{}')",
            self.execution_id,
            self.activation.project_name,
            lock_mutex_recover(&self.pool).slots().len(),
            self.mainline_branch
        );

        let start_time = Instant::now();
        self.state = OrchestratorState::Running;

        loop {
            if *lock_mutex_recover(&self.cancelled) {
                log::warn!("[Orchestrator] Cancelled, shutting down in-flight work");
                self.shutdown_in_flight();
                self.state = OrchestratorState::Cancelled;
                self.metrics.total_duration_secs = start_time.elapsed().as_secs_f64();
                return Ok(self.metrics.clone());
            }

            if self.should_poll_tracker() {
                if let Err(e) = self.ingest_from_tracker().await {
                    // Retries are already spent inside the tracker client;
                    // work already admitted keeps flowing
                    log::warn!("[Orchestrator] Tracker poll failed: {}", e);
                    self.last_tracker_poll = Some(Instant::now());
                }
            }

            self.dispatch_ready().await;
            self.reap_completions().await;

            let idle = self.active.is_empty() && !lock_mutex_recover(&self.queue).has_pending();
            if idle && self.settings.exit_when_idle {
                self.state = OrchestratorState::Completed;
                self.metrics.total_duration_secs = start_time.elapsed().as_secs_f64();
                log::info!(
                    "[Orchestrator] Completed: {} merged, {} failed, {} cancelled",
                    self.metrics.merged,
                    self.metrics.failed_terminally,
                    self.metrics.cancelled
                );
                return Ok(self.metrics.clone());
            }

            tokio::time::sleep(Duration::from_millis(self.settings.poll_interval_ms)).await;
        }
    }

    fn should_poll_tracker(&self) -> bool {
        match self.last_tracker_poll {
            None => true,
            Some(at) => at.elapsed() >= Duration::from_secs(self.settings.tracker_poll_secs),
        }
    }

    /// Pull open issues, admit new ones, cancel withdrawn ones
    async fn ingest_from_tracker(&mut self) -> Result<(), TrackerError> {
        let issues = self.with_tracker(|t| t.open_issues()).await?;
        self.last_tracker_poll = Some(Instant::now());

        let open_ids: HashSet<String> = issues.iter().map(|i| i.id.clone()).collect();
        self.admit_new_issues(&issues);
        self.cancel_withdrawn(&open_ids).await;
        Ok(())
    }

    /// Admit issues the registry doesn't know yet, in dependency order.
    ///
    /// A batch can arrive in any order, so admission loops until a pass
    /// admits nothing; whatever still has unresolved dependency references is
    /// skipped until those issues appear.
    fn admit_new_issues(&mut self, issues: &[TrackerIssue]) {
        let mut queue = lock_mutex_recover(&self.queue);
        let mut pending: Vec<&TrackerIssue> =
            issues.iter().filter(|i| !queue.contains(&i.id)).collect();

        loop {
            let mut admitted_any = false;
            pending.retain(|issue| {
                let item = work_item_from_issue(issue, &self.label_map);
                if !self.activation.is_enabled(item.role) {
                    log::warn!(
                        "[Orchestrator] Skipping issue {}: role {} is not enabled",
                        issue.id,
                        item.role
                    );
                    return false;
                }
                match queue.enqueue(item) {
                    Ok(status) => {
                        log::info!("[Orchestrator] Admitted issue {} as {:?}", issue.id, status);
                        admitted_any = true;
                        false
                    }
                    // The dependency may be later in this same batch
                    Err(QueueError::UnknownDependency { .. }) => true,
                    Err(e) => {
                        log::warn!("[Orchestrator] Rejected issue {}: {}", issue.id, e);
                        false
                    }
                }
            });

            if !admitted_any || pending.is_empty() {
                break;
            }
        }

        for issue in pending {
            log::debug!(
                "[Orchestrator] Issue {} has unresolved dependency references, deferring",
                issue.id
            );
        }
    }

    /// Cancel non-terminal items whose tracker issue is no longer open
    async fn cancel_withdrawn(&mut self, open_ids: &HashSet<String>) {
        let withdrawn: Vec<String> = {
            let queue = lock_mutex_recover(&self.queue);
            queue
                .snapshot()
                .into_iter()
                .filter(|i| !state_machine::is_terminal_state(i.status))
                .filter(|i| !open_ids.contains(&i.id))
                .map(|i| i.id)
                .collect()
        };

        for id in withdrawn {
            log::info!(
                "[Orchestrator] Issue {} was closed externally, cancelling",
                id
            );
            self.cancel_item(&id).await;
        }
    }

    /// Cancel one work item at any point before merge.
    ///
    /// Preempts an in-progress agent through the same path as a timeout,
    /// releases its worktree, and removes it from the registry without retry
    /// accounting.
    pub async fn cancel_item(&mut self, work_item_id: &str) {
        if let Some(handle) = self.active.remove(work_item_id) {
            handle.cancel();
            lock_mutex_recover(&self.pool).release_slot(handle.slot_id());
        }
        lock_mutex_recover(&self.worktrees).release(work_item_id);

        let removed = lock_mutex_recover(&self.queue).cancel(work_item_id);
        if removed.is_some() {
            self.metrics.cancelled += 1;
        }
        self.reports.remove(work_item_id);
        self.report_cascade_failures().await;
    }

    /// Dispatch every ready item whose role has a free slot.
    ///
    /// "Assign", "acquire worktree", and "occupy slot" happen within this
    /// single pass so a concurrent completion pass never observes them
    /// half-applied.
    async fn dispatch_ready(&mut self) {
        loop {
            // Best ready item whose role has capacity right now
            let candidate: Option<WorkItem> = {
                let queue = lock_mutex_recover(&self.queue);
                let pool = lock_mutex_recover(&self.pool);
                queue.ready_items().into_iter().find_map(|id| {
                    let item = queue.get(&id)?;
                    (pool.capacity(item.role) > 0).then(|| item.clone())
                })
            };
            let Some(item) = candidate else { break };

            if let Err(e) =
                lock_mutex_recover(&self.queue).mark(&item.id, WorkItemStatus::Assigned)
            {
                log::error!("[Orchestrator] Failed to assign {}: {}", item.id, e);
                break;
            }

            // Fresh base: the mainline may have advanced since the last merge
            let base_commit = match self.mainline_tip() {
                Ok(commit) => commit,
                Err(e) => {
                    log::error!("[Orchestrator] Failed to resolve mainline tip: {}", e);
                    self.requeue_or_fail(&item.id, "mainline tip unavailable").await;
                    break;
                }
            };

            let acquired = lock_mutex_recover(&self.worktrees).acquire(&item.id, &base_commit);
            let worktree = match acquired {
                Ok(worktree) => worktree,
                Err(conflict) => {
                    log::warn!("[Orchestrator] {}", conflict);
                    self.requeue_or_fail(&item.id, &conflict.to_string()).await;
                    continue;
                }
            };

            let dispatched = lock_mutex_recover(&self.pool).dispatch(
                &item,
                &worktree,
                self.runner.clone(),
                Duration::from_secs(self.settings.dispatch_timeout_secs),
            );

            match dispatched {
                Ok(handle) => {
                    if let Err(e) =
                        lock_mutex_recover(&self.queue).mark(&item.id, WorkItemStatus::InProgress)
                    {
                        log::error!("[Orchestrator] Failed to mark {} in progress: {}", item.id, e);
                    }
                    self.metrics.dispatches += 1;
                    self.active.insert(item.id.clone(), handle);
                }
                Err(e) => {
                    log::error!("[Orchestrator] Dispatch of {} failed: {}", item.id, e);
                    lock_mutex_recover(&self.worktrees).release(&item.id);
                    self.requeue_or_fail(&item.id, &e.to_string()).await;
                }
            }
        }
    }

    /// Collect finished and overdue executions and resolve each one
    async fn reap_completions(&mut self) {
        let due: Vec<String> = self
            .active
            .iter()
            .filter(|(_, handle)| handle.is_finished() || handle.deadline_exceeded())
            .map(|(id, _)| id.clone())
            .collect();

        for id in due {
            let Some(handle) = self.active.remove(&id) else {
                continue;
            };
            let slot_id = handle.slot_id().to_string();

            // A handle that finished under the wire still counts as finished
            let result = if handle.is_finished() {
                handle.outcome().await
            } else {
                Err(handle.into_timeout())
            };

            lock_mutex_recover(&self.pool).release_slot(&slot_id);

            match result {
                Ok(artifact) => self.gate_and_merge(artifact).await,
                Err(AgentError::Timeout {
                    timeout_secs: secs, ..
                }) => {
                    log::warn!(
                        "[Orchestrator] {} exceeded its {}s deadline, requeuing",
                        id,
                        secs
                    );
                    self.metrics.timeouts += 1;
                    lock_mutex_recover(&self.worktrees).release(&id);
                    self.requeue_or_fail(&id, "execution deadline exceeded").await;
                }
                Err(e) => {
                    log::warn!("[Orchestrator] {}", e);
                    lock_mutex_recover(&self.worktrees).release(&id);
                    self.requeue_or_fail(&id, &e.to_string()).await;
                }
            }
        }
    }

    /// Gate the artifact and merge it, or requeue the item
    async fn gate_and_merge(&mut self, artifact: ArtifactDescriptor) {
        let id = artifact.work_item_id.clone();

        if let Err(e) = lock_mutex_recover(&self.queue).mark(&id, WorkItemStatus::Gating) {
            log::error!("[Orchestrator] Failed to mark {} gating: {}", id, e);
        }
        let Some(item) = lock_mutex_recover(&self.queue).get(&id).cloned() else {
            // Cancelled while the agent was finishing
            lock_mutex_recover(&self.worktrees).release(&id);
            return;
        };

        let report = self.gate.evaluate(&item, &artifact);
        let passed = report.passed();
        let failing = report
            .failing_check()
            .map(|c| format!("{}: {}", c.name, c.detail));
        self.reports.insert(id.clone(), report);

        if !passed {
            self.metrics.gate_failures += 1;
            lock_mutex_recover(&self.worktrees).release(&id);
            let reason = format!(
                "quality gate failed at {}",
                failing.unwrap_or_else(|| "unknown check".to_string())
            );
            self.requeue_or_fail(&id, &reason).await;
            return;
        }

        match self.merge_artifact(&artifact) {
            Ok(commit_id) => {
                if let Err(e) = lock_mutex_recover(&self.queue).mark(&id, WorkItemStatus::Merged) {
                    log::error!("[Orchestrator] Failed to mark {} merged: {}", id, e);
                }
                self.metrics.merged += 1;
                lock_mutex_recover(&self.worktrees).release(&id);
                self.reports.remove(&id);
                self.publish_merged(&id, commit_id).await;
            }
            Err(MergeError::Conflict(files)) => {
                log::warn!(
                    "[Orchestrator] Merge conflict for {}: {:?}; discarding worktree",
                    id,
                    files
                );
                self.metrics.merge_conflicts += 1;
                // Discard and requeue; the next attempt starts from the
                // advanced mainline tip
                lock_mutex_recover(&self.worktrees).release(&id);
                self.requeue_or_fail(&id, &format!("merge conflict in {}", files.join(", ")))
                    .await;
            }
            Err(MergeError::Other(message)) => {
                log::error!("[Orchestrator] Merge of {} failed: {}", id, message);
                lock_mutex_recover(&self.worktrees).release(&id);
                self.requeue_or_fail(&id, &format!("merge failed: {}", message))
                    .await;
            }
        }
    }

    /// Merge the artifact branch into the mainline, strictly serialized
    fn merge_artifact(&self, artifact: &ArtifactDescriptor) -> Result<Option<String>, MergeError> {
        let _guard = lock_mutex_recover(&self.merge_lock);

        let git = GitClient::open(&self.activation.project_path)
            .map_err(|e| MergeError::Other(e.to_string()))?;

        match git.merge_into(&artifact.branch_name, &self.mainline_branch) {
            Ok(outcome) if outcome.success => Ok(outcome.commit_id),
            Ok(outcome) if !outcome.conflict_files.is_empty() => {
                if let Err(e) = git.abort_merge() {
                    log::warn!("[Orchestrator] Failed to abort merge: {}", e);
                }
                Err(MergeError::Conflict(outcome.conflict_files))
            }
            Ok(outcome) => Err(MergeError::Other(outcome.message)),
            Err(e) => Err(MergeError::Other(e.to_string())),
        }
    }

    fn mainline_tip(&self) -> Result<String, git2::Error> {
        GitClient::open(&self.activation.project_path)?.branch_tip(&self.mainline_branch)
    }

    /// Return a failed item to the queue or fail it terminally, and publish
    /// terminal outcomes to the tracker
    async fn requeue_or_fail(&mut self, work_item_id: &str, reason: &str) {
        let outcome = lock_mutex_recover(&self.queue).requeue(work_item_id);
        match outcome {
            Ok(RequeueOutcome::Requeued { retry_count }) => {
                log::info!(
                    "[Orchestrator] Requeued {} (retry {}): {}",
                    work_item_id,
                    retry_count,
                    reason
                );
            }
            Ok(RequeueOutcome::FailedTerminally) => {
                self.metrics.failed_terminally += 1;
                self.reports.remove(work_item_id);
                self.publish_failed(work_item_id, reason).await;
            }
            Err(e) => {
                log::error!(
                    "[Orchestrator] Failed to requeue {}: {}",
                    work_item_id,
                    e
                );
            }
        }
        self.report_cascade_failures().await;
    }

    /// Publish items failed by dependency cascade
    async fn report_cascade_failures(&mut self) {
        let cascaded = lock_mutex_recover(&self.queue).take_cascade_failures();
        for id in cascaded {
            self.metrics.failed_terminally += 1;
            self.reports.remove(&id);
            self.publish_failed(&id, "a dependency can never merge").await;
        }
    }

    /// Close the issue and leave a status comment after a merge
    async fn publish_merged(&self, work_item_id: &str, commit_id: Option<String>) {
        let id = work_item_id.to_string();
        let body = match commit_id {
            Some(commit) => format!("ForgeFlow: merged to {} as {}", self.mainline_branch, commit),
            None => format!("ForgeFlow: merged to {}", self.mainline_branch),
        };

        let comment_id = id.clone();
        if let Err(e) = self
            .with_tracker(move |t| t.post_comment(&comment_id, &body))
            .await
        {
            log::warn!("[Orchestrator] Failed to comment on issue {}: {}", id, e);
        }
        let close_id = id.clone();
        if let Err(e) = self.with_tracker(move |t| t.close_issue(&close_id)).await {
            log::warn!("[Orchestrator] Failed to close issue {}: {}", id, e);
        }
    }

    /// Report a permanent failure back to the tracker for human attention
    async fn publish_failed(&self, work_item_id: &str, reason: &str) {
        let id = work_item_id.to_string();
        let attempts = lock_mutex_recover(&self.queue)
            .get(&id)
            .map(|i| i.retry_count)
            .unwrap_or(0);
        let body = format!(
            "ForgeFlow: work item permanently failed after {} attempt(s): {}",
            attempts.max(1),
            reason
        );

        let comment_id = id.clone();
        if let Err(e) = self
            .with_tracker(move |t| t.post_comment(&comment_id, &body))
            .await
        {
            log::warn!("[Orchestrator] Failed to comment on issue {}: {}", id, e);
        }
        let label_id = id.clone();
        if let Err(e) = self
            .with_tracker(move |t| t.add_label(&label_id, FAILED_LABEL))
            .await
        {
            log::warn!("[Orchestrator] Failed to label issue {}: {}", id, e);
        }
    }

    /// Run a blocking tracker call off the async loop
    async fn with_tracker<T, F>(&self, op: F) -> Result<T, TrackerError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn IssueTracker) -> Result<T, TrackerError> + Send + 'static,
    {
        let tracker = self.tracker.clone();
        tokio::task::spawn_blocking(move || op(tracker.as_ref()))
            .await
            .map_err(|e| TrackerError::Request(format!("tracker task aborted: {}", e)))?
    }

    /// Preempt every in-flight agent and release its resources
    fn shutdown_in_flight(&mut self) {
        for (id, handle) in self.active.drain() {
            handle.cancel();
            lock_mutex_recover(&self.pool).release_slot(handle.slot_id());
            lock_mutex_recover(&self.worktrees).release(&id);
        }
        lock_mutex_recover(&self.worktrees).release_all();
    }
}
