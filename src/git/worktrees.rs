//! Worktree management for GitClient
//!
//! Contains methods for creating, listing, and removing worktrees

use git2::{BranchType, Error as GitError, Repository, Worktree, WorktreePruneOptions};
use std::path::Path;

use crate::git::types::WorktreeEntry;
use crate::git::GitClient;

impl GitClient {
    /// Add a worktree for an existing branch at the given path
    pub fn add_worktree(&self, branch: &str, path: &Path) -> Result<WorktreeEntry, GitError> {
        use git2::WorktreeAddOptions;

        let branch_ref = self.repo.find_branch(branch, BranchType::Local)?;

        let mut opts = WorktreeAddOptions::new();
        opts.reference(Some(branch_ref.get()));

        // Branch names like "forgeflow/issue-7" would create nested
        // directories under .git/worktrees/, which fails
        let worktree_name = branch.replace('/', "-");

        let worktree = self.repo.worktree(&worktree_name, path, Some(&opts))?;

        self.worktree_to_entry(&worktree)
    }

    /// List all registered worktrees
    pub fn list_worktrees(&self) -> Result<Vec<WorktreeEntry>, GitError> {
        let worktrees = self.repo.worktrees()?;

        let mut result = Vec::new();
        for name in worktrees.iter().flatten() {
            if let Ok(worktree) = self.repo.find_worktree(name) {
                result.push(self.worktree_to_entry(&worktree)?);
            }
        }

        Ok(result)
    }

    /// Remove a worktree by path, pruning its registration even if the
    /// checkout is still valid
    pub fn remove_worktree(&self, path: &Path) -> Result<(), GitError> {
        let wanted = path.to_string_lossy();
        let worktrees = self.repo.worktrees()?;

        for name in worktrees.iter().flatten() {
            if let Ok(worktree) = self.repo.find_worktree(name) {
                let worktree_path = worktree.path().to_string_lossy();
                if worktree_path == wanted
                    || worktree_path.trim_end_matches('/') == wanted.trim_end_matches('/')
                {
                    let mut opts = WorktreePruneOptions::new();
                    opts.valid(true).locked(true).working_tree(true);
                    worktree.prune(Some(&mut opts))?;
                    return Ok(());
                }
            }
        }

        Err(GitError::from_str(&format!(
            "Worktree not found: {}",
            wanted
        )))
    }

    /// Prune orphaned worktrees (where the physical directory no longer
    /// exists), cleaning up stale entries in .git/worktrees/
    pub fn prune_orphaned_worktrees(&self) -> Result<u32, GitError> {
        let worktrees = self.repo.worktrees()?;
        let mut pruned_count = 0;

        for name in worktrees.iter().flatten() {
            if let Ok(worktree) = self.repo.find_worktree(name) {
                if !worktree.path().exists() {
                    log::info!(
                        "[Git] Pruning orphaned worktree '{}' (path {:?} no longer exists)",
                        name,
                        worktree.path()
                    );
                    if let Err(e) = worktree.prune(None) {
                        log::warn!("[Git] Failed to prune worktree '{}': {}", name, e);
                    } else {
                        pruned_count += 1;
                    }
                }
            }
        }

        Ok(pruned_count)
    }

    fn worktree_to_entry(&self, worktree: &Worktree) -> Result<WorktreeEntry, GitError> {
        let name = worktree.name().unwrap_or("").to_string();
        let path = worktree.path().to_string_lossy().to_string();

        // Determine the branch checked out in this worktree
        let branch = if let Ok(wt_repo) = Repository::open(worktree.path()) {
            wt_repo
                .head()
                .ok()
                .filter(|head| head.is_branch())
                .and_then(|head| head.shorthand().map(|s| s.to_string()))
        } else {
            None
        };

        Ok(WorktreeEntry { name, path, branch })
    }
}
