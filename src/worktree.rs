//! Worktree manager
//!
//! Creates and destroys the isolated checkout each work item executes in.
//! One active worktree per work item, one work item per worktree; branch and
//! path names are derived deterministically from the item id so no two live
//! checkouts can collide.

use crate::git::GitClient;
use crate::utils::backoff_delay;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

const MAX_CREATE_ATTEMPTS: u32 = 3;
const CREATE_BACKOFF_MS: u64 = 100;

/// Lifecycle status of a worktree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorktreeStatus {
    Creating,
    Active,
    Cleaning,
    Destroyed,
}

/// An isolated checkout bound to exactly one work item
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worktree {
    pub work_item_id: String,
    pub path: PathBuf,
    pub branch_name: String,
    pub base_commit: String,
    pub status: WorktreeStatus,
}

/// Acquisition failed: a live worktree already exists for the item, or
/// creation kept hitting contention until the retry budget ran out
#[derive(Debug, Error)]
#[error("worktree conflict for work item {work_item_id}: {reason}")]
pub struct WorktreeConflictError {
    pub work_item_id: String,
    pub reason: String,
}

/// Registry of live worktrees for one project repository
pub struct WorktreeManager {
    project_path: PathBuf,
    active: HashMap<String, Worktree>,
}

impl WorktreeManager {
    pub fn new(project_path: &Path) -> Self {
        Self {
            project_path: project_path.to_path_buf(),
            active: HashMap::new(),
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn get(&self, work_item_id: &str) -> Option<&Worktree> {
        self.active.get(work_item_id)
    }

    /// All live worktrees, for observability
    pub fn snapshot(&self) -> Vec<Worktree> {
        self.active.values().cloned().collect()
    }

    /// Create an isolated checkout for a work item, rooted at `base_commit`.
    ///
    /// Branch: `forgeflow/<sanitized-id>`. Path:
    /// `<project>/.forgeflow/worktrees/<sanitized-id>`. Transient git or
    /// filesystem errors are retried with backoff; partial state is cleaned
    /// up before each retry so the caller either gets a usable worktree or an
    /// error, never a half-initialized checkout.
    pub fn acquire(
        &mut self,
        work_item_id: &str,
        base_commit: &str,
    ) -> Result<Worktree, WorktreeConflictError> {
        if self.active.contains_key(work_item_id) {
            return Err(WorktreeConflictError {
                work_item_id: work_item_id.to_string(),
                reason: "an active worktree already exists for this work item".to_string(),
            });
        }

        let branch_name = format!("forgeflow/{}", sanitize_branch_name(work_item_id));
        let path = self
            .project_path
            .join(".forgeflow")
            .join("worktrees")
            .join(sanitize_path_component(work_item_id));

        // Distinct ids can sanitize to the same name; that still counts as a
        // live collision
        if self
            .active
            .values()
            .any(|w| w.path == path || w.branch_name == branch_name)
        {
            return Err(WorktreeConflictError {
                work_item_id: work_item_id.to_string(),
                reason: format!(
                    "branch {} or path {:?} is held by another live worktree",
                    branch_name, path
                ),
            });
        }

        if let Some(parent) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                return Err(WorktreeConflictError {
                    work_item_id: work_item_id.to_string(),
                    reason: format!("failed to create worktree directory: {}", e),
                });
            }
        }

        let mut worktree = Worktree {
            work_item_id: work_item_id.to_string(),
            path: path.clone(),
            branch_name: branch_name.clone(),
            base_commit: base_commit.to_string(),
            status: WorktreeStatus::Creating,
        };

        let mut last_error = String::new();
        for attempt in 0..MAX_CREATE_ATTEMPTS {
            match self.try_create(&branch_name, &path, base_commit) {
                Ok(()) => {
                    worktree.status = WorktreeStatus::Active;
                    log::info!(
                        "[Worktree] Created worktree for {} at {:?} on branch {}",
                        work_item_id,
                        path,
                        branch_name
                    );
                    self.active
                        .insert(work_item_id.to_string(), worktree.clone());
                    return Ok(worktree);
                }
                Err(e) => {
                    last_error = e;
                    log::warn!(
                        "[Worktree] Creation attempt {}/{} for {} failed: {}",
                        attempt + 1,
                        MAX_CREATE_ATTEMPTS,
                        work_item_id,
                        last_error
                    );
                    self.cleanup_partial(&branch_name, &path);
                    if attempt + 1 < MAX_CREATE_ATTEMPTS {
                        std::thread::sleep(backoff_delay(attempt, CREATE_BACKOFF_MS));
                    }
                }
            }
        }

        Err(WorktreeConflictError {
            work_item_id: work_item_id.to_string(),
            reason: format!(
                "creation failed after {} attempts: {}",
                MAX_CREATE_ATTEMPTS, last_error
            ),
        })
    }

    fn try_create(&self, branch: &str, path: &Path, base_commit: &str) -> Result<(), String> {
        let git = GitClient::open(&self.project_path)
            .map_err(|e| format!("failed to open git repository: {}", e))?;

        if let Err(e) = git.prune_orphaned_worktrees() {
            log::warn!("[Worktree] Failed to prune orphaned worktrees: {}", e);
        }

        // A directory without a .git file is leftover from a crashed run
        if path.exists() && !path.join(".git").exists() {
            log::warn!("[Worktree] Removing stale directory at {:?}", path);
            if let Err(e) = std::fs::remove_dir_all(path) {
                log::warn!("[Worktree] Failed to remove stale directory: {}", e);
            }
        }

        // Stale branch from an earlier attempt
        if git.branch_exists(branch) {
            if let Err(e) = git.delete_branch(branch) {
                log::debug!("[Worktree] Branch {} couldn't be deleted: {}", branch, e);
            }
        }

        git.create_branch_at(branch, base_commit)
            .map_err(|e| format!("failed to create branch {}: {}", branch, e))?;

        git.add_worktree(branch, path)
            .map_err(|e| format!("failed to create worktree: {}", e))?;

        Ok(())
    }

    /// Remove whatever a failed creation attempt left behind
    fn cleanup_partial(&self, branch: &str, path: &Path) {
        if path.exists() {
            let _ = std::fs::remove_dir_all(path);
        }
        if let Ok(git) = GitClient::open(&self.project_path) {
            let _ = git.prune_orphaned_worktrees();
            if git.branch_exists(branch) {
                let _ = git.delete_branch(branch);
            }
        }
    }

    /// Destroy the checkout for a work item: worktree registration,
    /// directory, and branch.
    ///
    /// Idempotent; releasing an id with no live worktree is a no-op. Runs on
    /// every exit path, so failures are logged rather than raised.
    pub fn release(&mut self, work_item_id: &str) {
        let mut worktree = match self.active.remove(work_item_id) {
            Some(w) => w,
            None => return, // Already released
        };
        worktree.status = WorktreeStatus::Cleaning;

        let git = match GitClient::open(&self.project_path) {
            Ok(git) => git,
            Err(e) => {
                log::warn!("[Worktree] Failed to open git repository: {}", e);
                return;
            }
        };

        if let Err(e) = git.remove_worktree(&worktree.path) {
            log::warn!("[Worktree] Failed to remove worktree from git: {}", e);
        }

        if worktree.path.exists() {
            if let Err(e) = std::fs::remove_dir_all(&worktree.path) {
                log::warn!("[Worktree] Failed to remove worktree directory: {}", e);
            }
        }

        if git.branch_exists(&worktree.branch_name) {
            if let Err(e) = git.delete_branch(&worktree.branch_name) {
                log::warn!(
                    "[Worktree] Failed to delete branch {}: {}",
                    worktree.branch_name,
                    e
                );
            }
        }

        worktree.status = WorktreeStatus::Destroyed;
        log::info!(
            "[Worktree] Released worktree for {} at {:?}",
            work_item_id,
            worktree.path
        );
    }

    /// Release all worktrees (cleanup on shutdown)
    pub fn release_all(&mut self) {
        let work_item_ids: Vec<String> = self.active.keys().cloned().collect();
        for id in work_item_ids {
            self.release(&id);
        }
    }
}

/// Sanitize a string for use in a branch name
fn sanitize_branch_name(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect::<String>()
        .to_lowercase()
}

/// Sanitize a string for use as a path component
fn sanitize_path_component(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect::<String>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::tests::setup_test_repo;

    #[test]
    fn test_sanitize_branch_name() {
        assert_eq!(sanitize_branch_name("ISSUE-1.1"), "issue-1-1");
        assert_eq!(sanitize_branch_name("a b/c"), "a-b-c");
    }

    #[test]
    fn test_sanitize_path_component() {
        assert_eq!(sanitize_path_component("ISSUE-1.1"), "ISSUE-1_1");
        assert_eq!(sanitize_path_component("a/b"), "a_b");
    }

    #[test]
    fn test_acquire_creates_isolated_checkout() {
        let (temp_dir, git) = setup_test_repo();
        let base = git.branch_tip(&git.default_branch_name()).unwrap();

        let mut manager = WorktreeManager::new(temp_dir.path());
        let worktree = manager.acquire("42", &base).unwrap();

        assert_eq!(worktree.status, WorktreeStatus::Active);
        assert_eq!(worktree.branch_name, "forgeflow/42");
        assert!(worktree.path.join(".git").exists());
        assert!(worktree.path.join("test.txt").exists());
        assert_eq!(manager.active_count(), 1);
    }

    #[test]
    fn test_second_acquire_for_same_item_conflicts() {
        let (temp_dir, git) = setup_test_repo();
        let base = git.branch_tip(&git.default_branch_name()).unwrap();

        let mut manager = WorktreeManager::new(temp_dir.path());
        manager.acquire("42", &base).unwrap();

        let err = manager.acquire("42", &base).unwrap_err();
        assert_eq!(err.work_item_id, "42");
        assert_eq!(manager.active_count(), 1);
    }

    #[test]
    fn test_distinct_items_get_distinct_worktrees() {
        let (temp_dir, git) = setup_test_repo();
        let base = git.branch_tip(&git.default_branch_name()).unwrap();

        let mut manager = WorktreeManager::new(temp_dir.path());
        let a = manager.acquire("1", &base).unwrap();
        let b = manager.acquire("2", &base).unwrap();

        assert_ne!(a.path, b.path);
        assert_ne!(a.branch_name, b.branch_name);
        assert_eq!(manager.active_count(), 2);
    }

    #[test]
    fn test_release_is_idempotent_and_removes_artifacts() {
        let (temp_dir, git) = setup_test_repo();
        let base = git.branch_tip(&git.default_branch_name()).unwrap();

        let mut manager = WorktreeManager::new(temp_dir.path());
        let worktree = manager.acquire("42", &base).unwrap();
        let path = worktree.path.clone();

        manager.release("42");
        assert!(!path.exists());
        assert!(!git.branch_exists("forgeflow/42"));
        assert_eq!(manager.active_count(), 0);

        // Releasing again is a no-op, not an error
        manager.release("42");
        manager.release("never-acquired");
    }

    #[test]
    fn test_reacquire_after_release() {
        let (temp_dir, git) = setup_test_repo();
        let base = git.branch_tip(&git.default_branch_name()).unwrap();

        let mut manager = WorktreeManager::new(temp_dir.path());
        manager.acquire("42", &base).unwrap();
        manager.release("42");

        let worktree = manager.acquire("42", &base).unwrap();
        assert!(worktree.path.join(".git").exists());
    }

    #[test]
    fn test_acquire_recovers_from_stale_directory() {
        let (temp_dir, git) = setup_test_repo();
        let base = git.branch_tip(&git.default_branch_name()).unwrap();

        // Leftover directory with no .git, as after a crash
        let stale = temp_dir
            .path()
            .join(".forgeflow")
            .join("worktrees")
            .join("42");
        std::fs::create_dir_all(&stale).unwrap();
        std::fs::write(stale.join("junk.txt"), "stale").unwrap();

        let mut manager = WorktreeManager::new(temp_dir.path());
        let worktree = manager.acquire("42", &base).unwrap();
        assert!(worktree.path.join(".git").exists());
        assert!(!worktree.path.join("junk.txt").exists());
    }

    #[test]
    fn test_release_all() {
        let (temp_dir, git) = setup_test_repo();
        let base = git.branch_tip(&git.default_branch_name()).unwrap();

        let mut manager = WorktreeManager::new(temp_dir.path());
        manager.acquire("1", &base).unwrap();
        manager.acquire("2", &base).unwrap();

        manager.release_all();
        assert_eq!(manager.active_count(), 0);
    }
}
