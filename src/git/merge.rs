//! Merge handling for GitClient
//!
//! Merging an agent branch into the mainline is the one operation worktree
//! isolation cannot protect; callers serialize these methods.

use git2::{build::CheckoutBuilder, BranchType, Error as GitError, MergeOptions, Signature};

use crate::git::types::MergeOutcome;
use crate::git::GitClient;

impl GitClient {
    /// Merge a source branch into a target branch.
    ///
    /// Checks out the target first, then fast-forwards when possible and
    /// otherwise creates a merge commit. Conflicts are reported in the
    /// outcome, not raised as errors; the caller decides whether to abort.
    pub fn merge_into(
        &self,
        source_branch: &str,
        target_branch: &str,
    ) -> Result<MergeOutcome, GitError> {
        log::info!("[Git] Merging {} into {}", source_branch, target_branch);

        self.checkout_branch(target_branch)?;

        let source_ref = self.repo.find_branch(source_branch, BranchType::Local)?;
        let source_commit = source_ref.get().peel_to_commit()?;
        let annotated_commit = self.repo.find_annotated_commit(source_commit.id())?;

        let (analysis, _preference) = self.repo.merge_analysis(&[&annotated_commit])?;

        if analysis.is_up_to_date() {
            log::info!("[Git] Already up to date");
            return Ok(MergeOutcome {
                success: true,
                message: "Already up to date".to_string(),
                conflict_files: vec![],
                commit_id: None,
                fast_forward: false,
            });
        }

        if analysis.is_fast_forward() {
            log::info!("[Git] Fast-forward merge possible");

            let target_ref_name = format!("refs/heads/{}", target_branch);
            let mut target_ref = self.repo.find_reference(&target_ref_name)?;
            target_ref.set_target(
                source_commit.id(),
                &format!(
                    "Fast-forward merge {} into {}",
                    source_branch, target_branch
                ),
            )?;
            self.repo
                .checkout_head(Some(CheckoutBuilder::default().force()))?;

            return Ok(MergeOutcome {
                success: true,
                message: format!(
                    "Fast-forward merged {} into {}",
                    source_branch, target_branch
                ),
                conflict_files: vec![],
                commit_id: Some(source_commit.id().to_string()),
                fast_forward: true,
            });
        }

        // Normal merge
        let mut merge_opts = MergeOptions::new();
        let mut checkout_opts = CheckoutBuilder::new();
        checkout_opts.safe();

        self.repo.merge(
            &[&annotated_commit],
            Some(&mut merge_opts),
            Some(&mut checkout_opts),
        )?;

        let mut index = self.repo.index()?;
        if index.has_conflicts() {
            let mut conflict_files = Vec::new();
            for conflict in index.conflicts()?.flatten() {
                if let Some(entry) = conflict.our.or(conflict.their).or(conflict.ancestor) {
                    conflict_files.push(String::from_utf8_lossy(&entry.path).to_string());
                }
            }

            log::warn!("[Git] Merge has conflicts: {:?}", conflict_files);
            return Ok(MergeOutcome {
                success: false,
                message: format!("Merge conflicts in {} file(s)", conflict_files.len()),
                conflict_files,
                commit_id: None,
                fast_forward: false,
            });
        }

        // No conflicts - create merge commit
        let tree_id = index.write_tree()?;
        let tree = self.repo.find_tree(tree_id)?;

        let head_commit = self.repo.head()?.peel_to_commit()?;
        let signature = self
            .repo
            .signature()
            .or_else(|_| Signature::now("ForgeFlow", "forgeflow@example.com"))?;

        let merge_commit = self.repo.commit(
            Some("HEAD"),
            &signature,
            &signature,
            &format!("Merge branch '{}' into '{}'", source_branch, target_branch),
            &tree,
            &[&head_commit, &source_commit],
        )?;

        self.repo.cleanup_state()?;

        log::info!("[Git] Merge successful: {}", merge_commit);

        Ok(MergeOutcome {
            success: true,
            message: format!(
                "Successfully merged {} into {}",
                source_branch, target_branch
            ),
            conflict_files: vec![],
            commit_id: Some(merge_commit.to_string()),
            fast_forward: false,
        })
    }

    /// Abort an ongoing merge, resetting the working tree to HEAD
    pub fn abort_merge(&self) -> Result<(), GitError> {
        log::info!("[Git] Aborting merge");

        let head = self.repo.head()?.peel_to_commit()?;
        self.repo
            .reset(head.as_object(), git2::ResetType::Hard, None)?;

        self.repo.cleanup_state()?;

        Ok(())
    }

    /// Dry-run conflict check between two branches without touching the
    /// working tree
    pub fn conflicts_between(
        &self,
        source_branch: &str,
        target_branch: &str,
    ) -> Result<Vec<String>, GitError> {
        let source_ref = self.repo.find_branch(source_branch, BranchType::Local)?;
        let target_ref = self.repo.find_branch(target_branch, BranchType::Local)?;

        let source_commit = source_ref.get().peel_to_commit()?;
        let target_commit = target_ref.get().peel_to_commit()?;

        let merge_base = self
            .repo
            .merge_base(source_commit.id(), target_commit.id())?;

        let source_tree = source_commit.tree()?;
        let target_tree = target_commit.tree()?;
        let base_commit = self.repo.find_commit(merge_base)?;
        let base_tree = base_commit.tree()?;

        let mut merge_opts = MergeOptions::new();
        let index = self.repo.merge_trees(
            &base_tree,
            &target_tree,
            &source_tree,
            Some(&mut merge_opts),
        )?;

        let mut conflict_files = Vec::new();
        if index.has_conflicts() {
            for conflict in index.conflicts()?.flatten() {
                if let Some(entry) = conflict.our.or(conflict.their).or(conflict.ancestor) {
                    conflict_files.push(String::from_utf8_lossy(&entry.path).to_string());
                }
            }
        }

        Ok(conflict_files)
    }
}
