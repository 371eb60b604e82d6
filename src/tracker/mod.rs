//! Issue tracker boundary
//!
//! The tracker is an external event source (work items in) and sink (status
//! out); the internal registry is the scheduling source of truth. Everything
//! here is blocking and is called off the async loop.

pub mod github;

use crate::models::{AgentRole, WorkItem};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// An issue as reported by the tracker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerIssue {
    /// Tracker-native id (issue number for GitHub)
    pub id: String,
    pub title: String,
    pub body: Option<String>,
    pub labels: Vec<String>,
    /// Ids of issues that must merge before this one
    pub blocked_by: Vec<String>,
}

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("tracker request failed: {0}")]
    Request(String),

    #[error("tracker response could not be parsed: {0}")]
    Parse(String),
}

/// Read/write interface to the issue tracker.
///
/// Blocking by design; the orchestrator wraps calls in a blocking task and
/// never holds a registry lock while waiting.
pub trait IssueTracker: Send + Sync {
    fn open_issues(&self) -> Result<Vec<TrackerIssue>, TrackerError>;
    fn post_comment(&self, issue_id: &str, body: &str) -> Result<(), TrackerError>;
    fn close_issue(&self, issue_id: &str) -> Result<(), TrackerError>;
    fn add_label(&self, issue_id: &str, label: &str) -> Result<(), TrackerError>;
}

/// Configurable mapping from tracker labels to priority and role
#[derive(Debug, Clone)]
pub struct LabelMap {
    /// Substring matched against lowercased labels, with the priority it maps to
    priorities: Vec<(&'static str, i32)>,
    default_priority: i32,
    default_role: AgentRole,
}

impl Default for LabelMap {
    fn default() -> Self {
        Self {
            priorities: vec![
                ("critical", 0),
                ("p0", 0),
                ("urgent", 0),
                ("high", 1),
                ("p1", 1),
                ("important", 1),
                ("medium", 2),
                ("p2", 2),
                ("low", 3),
                ("p3", 3),
                ("nice", 4),
                ("p4", 4),
                ("backlog", 4),
            ],
            default_priority: 2,
            default_role: AgentRole::Coder,
        }
    }
}

impl LabelMap {
    pub fn with_default_role(mut self, role: AgentRole) -> Self {
        self.default_role = role;
        self
    }

    /// Priority from the first matching label, lower = more urgent
    pub fn priority_for(&self, labels: &[String]) -> i32 {
        for label in labels {
            let lower = label.to_lowercase();
            for (pattern, priority) in &self.priorities {
                if lower.contains(pattern) {
                    return *priority;
                }
            }
        }
        self.default_priority
    }

    /// Role from a `role:<name>` label or a bare role-name label
    pub fn role_for(&self, labels: &[String]) -> AgentRole {
        for label in labels {
            let lower = label.to_lowercase();
            let name = lower.strip_prefix("role:").unwrap_or(&lower);
            if let Some(role) = AgentRole::from_name(name.trim()) {
                return role;
            }
        }
        self.default_role
    }
}

/// Extract blocking issue references from an issue body.
///
/// Recognizes lines like `Blocked by: #12, #13` and `Depends on #7`.
/// Duplicates are dropped, first-seen order kept.
pub fn dependency_refs(body: &str) -> Vec<String> {
    let line_re = Regex::new(r"(?i)\b(?:blocked by|depends on)\b").unwrap();
    let ref_re = Regex::new(r"#(\d+)").unwrap();

    let mut refs = Vec::new();
    for line in body.lines() {
        if !line_re.is_match(line) {
            continue;
        }
        for capture in ref_re.captures_iter(line) {
            let id = capture[1].to_string();
            if !refs.contains(&id) {
                refs.push(id);
            }
        }
    }
    refs
}

/// Convert a tracker issue into a work item using the label mapping
pub fn work_item_from_issue(issue: &TrackerIssue, labels: &LabelMap) -> WorkItem {
    let mut item = WorkItem::new(
        issue.id.clone(),
        issue.title.clone(),
        labels.priority_for(&issue.labels),
        labels.role_for(&issue.labels),
    )
    .with_dependencies(issue.blocked_by.clone());

    if let Some(body) = &issue.body {
        item = item.with_body(body.clone());
    }
    item
}
