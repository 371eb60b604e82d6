//! Work queue
//!
//! Owns the authoritative work item registry and decides what is allowed to
//! run next: readiness first, then ascending priority, then insertion order.
//! Status changes go through the state machine in `models::state_machine` so
//! an item can never skip a lifecycle stage.

use crate::models::state_machine::{self, StateTransitionError};
use crate::models::{WorkItem, WorkItemStatus};
use chrono::Utc;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("work item {0} is already registered")]
    DuplicateItem(String),

    #[error("work item {item} depends on unknown item {dependency}")]
    UnknownDependency { item: String, dependency: String },

    #[error("work item {0} depends on itself")]
    SelfDependency(String),

    #[error("unknown work item {0}")]
    UnknownItem(String),

    #[error(transparent)]
    InvalidTransition(#[from] StateTransitionError),
}

/// Result of a requeue attempt after a failed execution or gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequeueOutcome {
    /// Returned to the queue for another attempt
    Requeued { retry_count: u32 },
    /// Retry ceiling reached; the item is permanently failed
    FailedTerminally,
}

/// Priority- and dependency-aware work item registry
pub struct WorkQueue {
    items: HashMap<String, WorkItem>,
    next_sequence: u64,
    retry_ceiling: u32,
    /// Items failed because a dependency went terminal, pending pickup by the
    /// orchestrator for tracker reporting
    cascade_failed: Vec<String>,
}

impl WorkQueue {
    pub fn new(retry_ceiling: u32) -> Self {
        Self {
            items: HashMap::new(),
            next_sequence: 0,
            retry_ceiling,
            cascade_failed: Vec::new(),
        }
    }

    /// Admit a work item.
    ///
    /// The item enters as Queued, or Blocked if any dependency is unmerged.
    /// Duplicate ids and references to unregistered dependencies are rejected
    /// with no state change.
    pub fn enqueue(&mut self, mut item: WorkItem) -> Result<WorkItemStatus, QueueError> {
        if self.items.contains_key(&item.id) {
            return Err(QueueError::DuplicateItem(item.id));
        }
        for dep in &item.dependencies {
            if *dep == item.id {
                return Err(QueueError::SelfDependency(item.id.clone()));
            }
            if !self.items.contains_key(dep) {
                return Err(QueueError::UnknownDependency {
                    item: item.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }

        item.sequence = self.next_sequence;
        self.next_sequence += 1;
        item.status = if self.all_dependencies_merged(&item) {
            WorkItemStatus::Queued
        } else {
            WorkItemStatus::Blocked
        };
        item.updated_at = Utc::now();

        log::debug!(
            "[Queue] Enqueued {} (priority {}, role {}) as {:?}",
            item.id,
            item.priority,
            item.role,
            item.status
        );

        let status = item.status;
        self.items.insert(item.id.clone(), item);
        Ok(status)
    }

    fn all_dependencies_merged(&self, item: &WorkItem) -> bool {
        item.dependencies.iter().all(|dep_id| {
            self.items
                .get(dep_id)
                .map(|dep| dep.status == WorkItemStatus::Merged)
                .unwrap_or(false)
        })
    }

    /// Ids of all ready items, best first: ascending priority, then
    /// insertion order. A Blocked item never appears regardless of priority.
    pub fn ready_items(&self) -> Vec<String> {
        let mut ready: Vec<&WorkItem> = self
            .items
            .values()
            .filter(|i| i.status == WorkItemStatus::Queued && self.all_dependencies_merged(i))
            .collect();
        ready.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.sequence.cmp(&b.sequence)));
        ready.into_iter().map(|i| i.id.clone()).collect()
    }

    /// Peek the highest-priority ready item without removing it
    pub fn next_ready(&self) -> Option<&WorkItem> {
        let id = self.ready_items().into_iter().next()?;
        self.items.get(&id)
    }

    /// Transition an item's status.
    ///
    /// On transition to Merged, Blocked items whose dependencies are now all
    /// satisfied are promoted to Queued in the same pass. On transition to
    /// Failed, Blocked dependents that can never become ready are failed too
    /// (retrievable via `take_cascade_failures`).
    pub fn mark(&mut self, id: &str, status: WorkItemStatus) -> Result<(), QueueError> {
        let item = self
            .items
            .get_mut(id)
            .ok_or_else(|| QueueError::UnknownItem(id.to_string()))?;

        let new_status = state_machine::transition_state(item.status, status)?;
        item.status = new_status;
        item.updated_at = Utc::now();

        log::debug!("[Queue] {} -> {:?}", id, new_status);

        match new_status {
            WorkItemStatus::Merged => self.promote_unblocked(),
            WorkItemStatus::Failed => self.cascade_failures(),
            _ => {}
        }

        Ok(())
    }

    /// Return a failed item to the queue, or fail it terminally once the
    /// retry ceiling is exceeded. Increments the retry count either way.
    pub fn requeue(&mut self, id: &str) -> Result<RequeueOutcome, QueueError> {
        let retry_count = {
            let item = self
                .items
                .get_mut(id)
                .ok_or_else(|| QueueError::UnknownItem(id.to_string()))?;
            item.retry_count += 1;
            item.retry_count
        };

        if retry_count > self.retry_ceiling {
            log::warn!(
                "[Queue] {} exceeded retry ceiling ({} > {}), failing terminally",
                id,
                retry_count,
                self.retry_ceiling
            );
            self.mark(id, WorkItemStatus::Failed)?;
            Ok(RequeueOutcome::FailedTerminally)
        } else {
            self.mark(id, WorkItemStatus::Queued)?;
            Ok(RequeueOutcome::Requeued { retry_count })
        }
    }

    /// Remove an item entirely (external cancellation). No retry accounting.
    ///
    /// Dependents that were blocked on it can never become ready and are
    /// failed in the same pass.
    pub fn cancel(&mut self, id: &str) -> Option<WorkItem> {
        let removed = self.items.remove(id)?;
        log::info!("[Queue] Cancelled {}", id);
        self.cascade_failures();
        Some(removed)
    }

    /// Promote Blocked items whose dependencies are now all merged
    fn promote_unblocked(&mut self) {
        let promotable: Vec<String> = self
            .items
            .values()
            .filter(|i| i.status == WorkItemStatus::Blocked && self.all_dependencies_merged(i))
            .map(|i| i.id.clone())
            .collect();

        for id in promotable {
            if let Some(item) = self.items.get_mut(&id) {
                item.status = WorkItemStatus::Queued;
                item.updated_at = Utc::now();
                log::info!("[Queue] {} unblocked", id);
            }
        }
    }

    /// Fail Blocked items whose dependencies can never merge (a dependency is
    /// terminally failed, or was cancelled out of the registry)
    fn cascade_failures(&mut self) {
        loop {
            let doomed: Vec<String> = self
                .items
                .values()
                .filter(|i| i.status == WorkItemStatus::Blocked)
                .filter(|i| {
                    i.dependencies.iter().any(|dep_id| {
                        self.items
                            .get(dep_id)
                            .map(|dep| dep.status == WorkItemStatus::Failed)
                            .unwrap_or(true)
                    })
                })
                .map(|i| i.id.clone())
                .collect();

            if doomed.is_empty() {
                break;
            }

            for id in doomed {
                if let Some(item) = self.items.get_mut(&id) {
                    item.status = WorkItemStatus::Failed;
                    item.updated_at = Utc::now();
                    log::warn!("[Queue] {} failed: dependency can never merge", id);
                    self.cascade_failed.push(id);
                }
            }
        }
    }

    /// Drain the ids failed by dependency cascade since the last call
    pub fn take_cascade_failures(&mut self) -> Vec<String> {
        std::mem::take(&mut self.cascade_failed)
    }

    pub fn get(&self, id: &str) -> Option<&WorkItem> {
        self.items.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.items.contains_key(id)
    }

    /// True while any item is in a non-terminal state
    pub fn has_pending(&self) -> bool {
        self.items
            .values()
            .any(|i| !state_machine::is_terminal_state(i.status))
    }

    /// All items in insertion order, for observability
    pub fn snapshot(&self) -> Vec<WorkItem> {
        let mut items: Vec<WorkItem> = self.items.values().cloned().collect();
        items.sort_by_key(|i| i.sequence);
        items
    }

    pub fn count_with_status(&self, status: WorkItemStatus) -> usize {
        self.items.values().filter(|i| i.status == status).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AgentRole;

    fn item(id: &str, priority: i32) -> WorkItem {
        WorkItem::new(id, format!("Item {}", id), priority, AgentRole::Coder)
    }

    #[test]
    fn test_enqueue_orders_by_priority_then_insertion() {
        let mut queue = WorkQueue::new(3);
        queue.enqueue(item("a", 2)).unwrap();
        queue.enqueue(item("b", 1)).unwrap();
        queue.enqueue(item("c", 1)).unwrap();

        assert_eq!(queue.ready_items(), vec!["b", "c", "a"]);
        assert_eq!(queue.next_ready().unwrap().id, "b");
        // Peek does not remove
        assert_eq!(queue.next_ready().unwrap().id, "b");
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let mut queue = WorkQueue::new(3);
        queue.enqueue(item("a", 1)).unwrap();
        assert!(matches!(
            queue.enqueue(item("a", 2)),
            Err(QueueError::DuplicateItem(_))
        ));
        // No state change: the original keeps its priority
        assert_eq!(queue.get("a").unwrap().priority, 1);
    }

    #[test]
    fn test_unknown_and_self_dependency_rejected() {
        let mut queue = WorkQueue::new(3);
        assert!(matches!(
            queue.enqueue(item("a", 1).with_dependencies(vec!["ghost".to_string()])),
            Err(QueueError::UnknownDependency { .. })
        ));
        assert!(matches!(
            queue.enqueue(item("b", 1).with_dependencies(vec!["b".to_string()])),
            Err(QueueError::SelfDependency(_))
        ));
    }

    #[test]
    fn test_blocked_item_never_ready_until_dependency_merges() {
        let mut queue = WorkQueue::new(3);
        queue.enqueue(item("v", 5)).unwrap();
        let status = queue
            .enqueue(item("w", 0).with_dependencies(vec!["v".to_string()]))
            .unwrap();
        assert_eq!(status, WorkItemStatus::Blocked);

        // Highest priority, but blocked: never selected
        assert_eq!(queue.next_ready().unwrap().id, "v");

        queue.mark("v", WorkItemStatus::Assigned).unwrap();
        queue.mark("v", WorkItemStatus::InProgress).unwrap();
        queue.mark("v", WorkItemStatus::Gating).unwrap();
        assert!(queue.next_ready().is_none());

        queue.mark("v", WorkItemStatus::Merged).unwrap();
        // Promoted in the same pass
        assert_eq!(queue.get("w").unwrap().status, WorkItemStatus::Queued);
        assert_eq!(queue.next_ready().unwrap().id, "w");
    }

    #[test]
    fn test_promotion_waits_for_all_dependencies() {
        let mut queue = WorkQueue::new(3);
        queue.enqueue(item("d1", 1)).unwrap();
        queue.enqueue(item("d2", 1)).unwrap();
        queue
            .enqueue(item("w", 0).with_dependencies(vec!["d1".to_string(), "d2".to_string()]))
            .unwrap();

        for dep in ["d1", "d2"] {
            queue.mark(dep, WorkItemStatus::Assigned).unwrap();
            queue.mark(dep, WorkItemStatus::InProgress).unwrap();
            queue.mark(dep, WorkItemStatus::Gating).unwrap();
        }

        queue.mark("d1", WorkItemStatus::Merged).unwrap();
        assert_eq!(queue.get("w").unwrap().status, WorkItemStatus::Blocked);

        queue.mark("d2", WorkItemStatus::Merged).unwrap();
        assert_eq!(queue.get("w").unwrap().status, WorkItemStatus::Queued);
    }

    #[test]
    fn test_requeue_until_ceiling() {
        let mut queue = WorkQueue::new(2);
        queue.enqueue(item("a", 1)).unwrap();

        for expected_retry in 1..=2u32 {
            queue.mark("a", WorkItemStatus::Assigned).unwrap();
            queue.mark("a", WorkItemStatus::InProgress).unwrap();
            let outcome = queue.requeue("a").unwrap();
            assert_eq!(
                outcome,
                RequeueOutcome::Requeued {
                    retry_count: expected_retry
                }
            );
            assert_eq!(queue.get("a").unwrap().status, WorkItemStatus::Queued);
        }

        queue.mark("a", WorkItemStatus::Assigned).unwrap();
        queue.mark("a", WorkItemStatus::InProgress).unwrap();
        let outcome = queue.requeue("a").unwrap();
        assert_eq!(outcome, RequeueOutcome::FailedTerminally);
        assert_eq!(queue.get("a").unwrap().status, WorkItemStatus::Failed);
        assert!(!queue.has_pending());
    }

    #[test]
    fn test_terminal_failure_cascades_to_dependents() {
        let mut queue = WorkQueue::new(0);
        queue.enqueue(item("base", 1)).unwrap();
        queue
            .enqueue(item("mid", 1).with_dependencies(vec!["base".to_string()]))
            .unwrap();
        queue
            .enqueue(item("leaf", 1).with_dependencies(vec!["mid".to_string()]))
            .unwrap();

        queue.mark("base", WorkItemStatus::Assigned).unwrap();
        queue.mark("base", WorkItemStatus::InProgress).unwrap();
        assert_eq!(queue.requeue("base").unwrap(), RequeueOutcome::FailedTerminally);

        assert_eq!(queue.get("mid").unwrap().status, WorkItemStatus::Failed);
        assert_eq!(queue.get("leaf").unwrap().status, WorkItemStatus::Failed);

        let mut cascaded = queue.take_cascade_failures();
        cascaded.sort();
        assert_eq!(cascaded, vec!["leaf".to_string(), "mid".to_string()]);
        assert!(queue.take_cascade_failures().is_empty());
    }

    #[test]
    fn test_cancel_removes_without_penalty_and_cascades() {
        let mut queue = WorkQueue::new(3);
        queue.enqueue(item("a", 1)).unwrap();
        queue
            .enqueue(item("b", 1).with_dependencies(vec!["a".to_string()]))
            .unwrap();

        let removed = queue.cancel("a").unwrap();
        assert_eq!(removed.retry_count, 0);
        assert!(!queue.contains("a"));
        assert_eq!(queue.get("b").unwrap().status, WorkItemStatus::Failed);
    }

    #[test]
    fn test_mark_unknown_item() {
        let mut queue = WorkQueue::new(3);
        assert!(matches!(
            queue.mark("ghost", WorkItemStatus::Assigned),
            Err(QueueError::UnknownItem(_))
        ));
    }

    #[test]
    fn test_invalid_transition_rejected() {
        let mut queue = WorkQueue::new(3);
        queue.enqueue(item("a", 1)).unwrap();
        assert!(matches!(
            queue.mark("a", WorkItemStatus::Merged),
            Err(QueueError::InvalidTransition(_))
        ));
        // Rejected at the boundary: status unchanged
        assert_eq!(queue.get("a").unwrap().status, WorkItemStatus::Queued);
    }

    #[test]
    fn test_snapshot_in_insertion_order() {
        let mut queue = WorkQueue::new(3);
        queue.enqueue(item("z", 9)).unwrap();
        queue.enqueue(item("a", 1)).unwrap();

        let ids: Vec<String> = queue.snapshot().into_iter().map(|i| i.id).collect();
        assert_eq!(ids, vec!["z", "a"]);
    }
}
