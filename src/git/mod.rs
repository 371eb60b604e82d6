//! Git operations using git2-rs
//!
//! This module provides the version-control plumbing the orchestrator needs:
//! - `mod.rs` - Core GitClient struct, branch and commit operations
//! - `worktrees` - Worktree management (add, remove, prune)
//! - `merge` - Merging agent branches into the mainline
//! - `types` - Shared data structures
//!
//! Some methods are plumbing exercised only from tests (dry-run conflict
//! checks, worktree listing)
#![allow(dead_code)]

mod merge;
#[cfg(test)]
pub(crate) mod tests;
mod types;
mod worktrees;

pub use types::{MergeOutcome, WorktreeEntry};

use git2::{BranchType, Error as GitError, Oid, Repository};
use std::path::{Path, PathBuf};

/// Git client for repository operations
pub struct GitClient {
    pub(crate) repo: Repository,
}

impl GitClient {
    /// Open the repository at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, GitError> {
        let repo = Repository::open(path)?;
        Ok(Self { repo })
    }

    /// Get the repository's gitdir path
    pub fn repo_path(&self) -> PathBuf {
        self.repo.path().to_path_buf()
    }

    /// Get the tip commit hash of a local branch
    pub fn branch_tip(&self, branch: &str) -> Result<String, GitError> {
        let branch = self.repo.find_branch(branch, BranchType::Local)?;
        let commit = branch.get().peel_to_commit()?;
        Ok(commit.id().to_string())
    }

    /// Create a branch pointing at a specific commit
    pub fn create_branch_at(&self, name: &str, commit_id: &str) -> Result<(), GitError> {
        let oid = Oid::from_str(commit_id)?;
        let commit = self.repo.find_commit(oid)?;
        self.repo.branch(name, &commit, false)?;
        Ok(())
    }

    /// Delete a local branch
    pub fn delete_branch(&self, name: &str) -> Result<(), GitError> {
        let mut branch = self.repo.find_branch(name, BranchType::Local)?;
        branch.delete()?;
        Ok(())
    }

    /// Check whether a local branch exists
    pub fn branch_exists(&self, name: &str) -> bool {
        self.repo.find_branch(name, BranchType::Local).is_ok()
    }

    /// Checkout a branch in the main working directory
    pub fn checkout_branch(&self, name: &str) -> Result<(), GitError> {
        let obj = self.repo.revparse_single(&format!("refs/heads/{}", name))?;

        self.repo.checkout_tree(&obj, None)?;
        self.repo.set_head(&format!("refs/heads/{}", name))?;

        Ok(())
    }

    /// Get the name of the branch HEAD points to.
    ///
    /// Resolution order: current HEAD branch, then "main"/"master" if they
    /// exist, then "main" as a final fallback.
    pub fn default_branch_name(&self) -> String {
        if let Ok(head) = self.repo.head() {
            if head.is_branch() {
                if let Some(name) = head.shorthand() {
                    return name.to_string();
                }
            }
        }

        for name in &["main", "master"] {
            if self.repo.find_branch(name, BranchType::Local).is_ok() {
                return (*name).to_string();
            }
        }

        "main".to_string()
    }
}
