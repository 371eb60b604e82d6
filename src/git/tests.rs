//! Tests for GitClient
//!
//! Each test builds a throwaway repository with one initial commit.

use crate::git::GitClient;
use git2::{Repository, Signature};
use std::fs;
use std::path::Path;
use tempfile::TempDir;

pub(crate) fn setup_test_repo() -> (TempDir, GitClient) {
    let temp_dir = TempDir::new().unwrap();
    let repo_path = temp_dir.path();

    let repo = Repository::init(repo_path).unwrap();

    let sig = Signature::now("Test User", "test@example.com").unwrap();
    let tree_id = {
        let mut index = repo.index().unwrap();

        let test_file = repo_path.join("test.txt");
        fs::write(&test_file, "Hello, World!").unwrap();
        index.add_path(Path::new("test.txt")).unwrap();
        index.write().unwrap();
        index.write_tree().unwrap()
    };

    let tree = repo.find_tree(tree_id).unwrap();
    repo.commit(Some("HEAD"), &sig, &sig, "Initial commit", &tree, &[])
        .unwrap();

    let client = GitClient::open(repo_path).unwrap();
    (temp_dir, client)
}

/// Commit a file change onto the currently checked-out branch of `repo_path`
pub(crate) fn commit_file(repo_path: &Path, file: &str, content: &str, message: &str) -> String {
    let repo = Repository::open(repo_path).unwrap();
    let sig = Signature::now("Test User", "test@example.com").unwrap();

    fs::write(repo_path.join(file), content).unwrap();
    let mut index = repo.index().unwrap();
    index.add_path(Path::new(file)).unwrap();
    index.write().unwrap();
    let tree_id = index.write_tree().unwrap();
    let tree = repo.find_tree(tree_id).unwrap();

    let parent = repo.head().unwrap().peel_to_commit().unwrap();
    let oid = repo
        .commit(Some("HEAD"), &sig, &sig, message, &tree, &[&parent])
        .unwrap();
    oid.to_string()
}

#[test]
fn test_open_repo() {
    let (_temp_dir, client) = setup_test_repo();
    assert!(client.repo_path().exists());
}

#[test]
fn test_branch_tip_and_create_branch_at() {
    let (_temp_dir, client) = setup_test_repo();

    let mainline = client.default_branch_name();
    let tip = client.branch_tip(&mainline).unwrap();
    assert_eq!(tip.len(), 40);

    client.create_branch_at("feature-a", &tip).unwrap();
    assert!(client.branch_exists("feature-a"));
    assert_eq!(client.branch_tip("feature-a").unwrap(), tip);
}

#[test]
fn test_delete_branch() {
    let (_temp_dir, client) = setup_test_repo();

    let tip = client.branch_tip(&client.default_branch_name()).unwrap();
    client.create_branch_at("to-delete", &tip).unwrap();
    assert!(client.branch_exists("to-delete"));

    client.delete_branch("to-delete").unwrap();
    assert!(!client.branch_exists("to-delete"));
}

#[test]
fn test_add_and_remove_worktree() {
    let (temp_dir, client) = setup_test_repo();

    let tip = client.branch_tip(&client.default_branch_name()).unwrap();
    client.create_branch_at("forgeflow/wt-test", &tip).unwrap();

    let wt_path = temp_dir.path().join("wt-test");
    let entry = client
        .add_worktree("forgeflow/wt-test", &wt_path)
        .unwrap();
    assert_eq!(entry.name, "forgeflow-wt-test");
    assert!(Path::new(&entry.path).exists());

    client.remove_worktree(&wt_path).unwrap();
    let names: Vec<String> = client
        .list_worktrees()
        .unwrap()
        .iter()
        .map(|w| w.name.clone())
        .collect();
    assert!(!names.contains(&"forgeflow-wt-test".to_string()));
}

#[test]
fn test_prune_orphaned_worktrees() {
    let (temp_dir, client) = setup_test_repo();

    let tip = client.branch_tip(&client.default_branch_name()).unwrap();
    client.create_branch_at("forgeflow/orphan", &tip).unwrap();

    let wt_path = temp_dir.path().join("orphan");
    client.add_worktree("forgeflow/orphan", &wt_path).unwrap();

    // Simulate a crashed agent leaving a registration with no directory
    fs::remove_dir_all(&wt_path).unwrap();

    let pruned = client.prune_orphaned_worktrees().unwrap();
    assert_eq!(pruned, 1);
}

#[test]
fn test_merge_fast_forward() {
    let (temp_dir, client) = setup_test_repo();
    let mainline = client.default_branch_name();

    let tip = client.branch_tip(&mainline).unwrap();
    client.create_branch_at("forgeflow/ff", &tip).unwrap();

    // Commit on the branch in an isolated worktree
    let wt_path = temp_dir.path().join("ff");
    client.add_worktree("forgeflow/ff", &wt_path).unwrap();
    commit_file(&wt_path, "feature.txt", "new file", "Add feature");

    let outcome = client.merge_into("forgeflow/ff", &mainline).unwrap();
    assert!(outcome.success);
    assert!(outcome.fast_forward);
    assert!(temp_dir.path().join("feature.txt").exists());
}

#[test]
fn test_merge_reports_conflicts() {
    let (temp_dir, client) = setup_test_repo();
    let mainline = client.default_branch_name();

    let tip = client.branch_tip(&mainline).unwrap();
    client.create_branch_at("forgeflow/conflict", &tip).unwrap();

    let wt_path = temp_dir.path().join("conflict");
    client.add_worktree("forgeflow/conflict", &wt_path).unwrap();
    commit_file(&wt_path, "test.txt", "branch version", "Branch change");

    // Diverge the mainline on the same file
    commit_file(temp_dir.path(), "test.txt", "mainline version", "Mainline change");

    let outcome = client.merge_into("forgeflow/conflict", &mainline).unwrap();
    assert!(!outcome.success);
    assert_eq!(outcome.conflict_files, vec!["test.txt".to_string()]);

    client.abort_merge().unwrap();
    let content = fs::read_to_string(temp_dir.path().join("test.txt")).unwrap();
    assert_eq!(content, "mainline version");
}

#[test]
fn test_conflicts_between_dry_run() {
    let (temp_dir, client) = setup_test_repo();
    let mainline = client.default_branch_name();

    let tip = client.branch_tip(&mainline).unwrap();
    client.create_branch_at("forgeflow/dry", &tip).unwrap();

    let wt_path = temp_dir.path().join("dry");
    client.add_worktree("forgeflow/dry", &wt_path).unwrap();
    commit_file(&wt_path, "test.txt", "branch version", "Branch change");
    commit_file(temp_dir.path(), "test.txt", "mainline version", "Mainline change");

    let conflicts = client
        .conflicts_between("forgeflow/dry", &mainline)
        .unwrap();
    assert_eq!(conflicts, vec!["test.txt".to_string()]);

    // The dry run must not leave the repository mid-merge
    let head_content = fs::read_to_string(temp_dir.path().join("test.txt")).unwrap();
    assert_eq!(head_content, "mainline version");
}
