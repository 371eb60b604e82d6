//! Quality gate enforcer
//!
//! Runs an ordered pipeline of checks against an agent's artifact and
//! renders the pass/fail verdict that decides whether the branch may merge.
//! The pipeline short-circuits on the first failure, but every check that
//! ran is recorded in the report.

use crate::config::{GateCheckSettings, GateSettings};
use crate::models::{ArtifactDescriptor, WorkItem};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const CHECK_OUTPUT_TAIL_CHARS: usize = 400;

/// Outcome of a single gate check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckOutcome {
    Passed,
    Failed,
}

/// One attempted check, in pipeline order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub outcome: CheckOutcome,
    pub detail: String,
}

/// Overall gate verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Fail,
}

/// Immutable record of one gate evaluation.
///
/// Retained for audit until the owning work item is merged or permanently
/// failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityReport {
    pub work_item_id: String,
    pub checks: Vec<CheckResult>,
    pub verdict: Verdict,
    pub evaluated_at: DateTime<Utc>,
}

impl QualityReport {
    pub fn passed(&self) -> bool {
        self.verdict == Verdict::Pass
    }

    /// The check that stopped the pipeline, if any
    pub fn failing_check(&self) -> Option<&CheckResult> {
        self.checks
            .iter()
            .find(|c| c.outcome == CheckOutcome::Failed)
    }
}

/// A single gate check. Ok means pass; the Err string becomes the recorded
/// failure detail.
pub trait QualityCheck: Send + Sync {
    fn name(&self) -> &str;
    fn run(&self, item: &WorkItem, artifact: &ArtifactDescriptor) -> Result<String, String>;
}

/// Check that runs a command inside the artifact's worktree and passes iff
/// the command exits 0. Build, static checks, tests, and verification passes
/// are all expressed this way.
pub struct CommandCheck {
    name: String,
    program: String,
    args: Vec<String>,
}

impl CommandCheck {
    pub fn new(name: impl Into<String>, program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args,
        }
    }

    pub fn from_settings(settings: &GateCheckSettings) -> Self {
        Self::new(&settings.name, &settings.command, settings.args.clone())
    }
}

impl QualityCheck for CommandCheck {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, _item: &WorkItem, artifact: &ArtifactDescriptor) -> Result<String, String> {
        let output = std::process::Command::new(&self.program)
            .args(&self.args)
            .current_dir(&artifact.worktree_path)
            .output()
            .map_err(|e| format!("failed to run '{}': {}", self.program, e))?;

        let stdout = output_tail(&output.stdout);
        let stderr = output_tail(&output.stderr);

        if output.status.success() {
            Ok(stdout)
        } else {
            Err(format!(
                "'{}' exited with {}: {}",
                self.program,
                output
                    .status
                    .code()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string()),
                if stderr.is_empty() { stdout } else { stderr }
            ))
        }
    }
}

fn output_tail(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let trimmed = text.trim();
    let chars: Vec<char> = trimmed.chars().collect();
    let start = chars.len().saturating_sub(CHECK_OUTPUT_TAIL_CHARS);
    chars[start..].iter().collect()
}

/// The ordered check pipeline
pub struct QualityGateEnforcer {
    checks: Vec<Box<dyn QualityCheck>>,
}

impl QualityGateEnforcer {
    pub fn new(checks: Vec<Box<dyn QualityCheck>>) -> Self {
        Self { checks }
    }

    /// Build the pipeline from .forgeflow/config.yaml gate settings,
    /// preserving the configured order
    pub fn from_config(settings: &GateSettings) -> Self {
        let checks = settings
            .checks
            .iter()
            .map(|c| Box::new(CommandCheck::from_settings(c)) as Box<dyn QualityCheck>)
            .collect();
        Self::new(checks)
    }

    pub fn check_count(&self) -> usize {
        self.checks.len()
    }

    /// Run the pipeline against an artifact.
    ///
    /// Deterministic: identical (artifact, check configuration) inputs yield
    /// an identical sequence of results and verdict. The first failing check
    /// stops the pipeline; checks never attempted are not recorded.
    pub fn evaluate(&self, item: &WorkItem, artifact: &ArtifactDescriptor) -> QualityReport {
        let mut results = Vec::new();
        let mut verdict = Verdict::Pass;

        for check in &self.checks {
            match check.run(item, artifact) {
                Ok(detail) => {
                    log::debug!("[Gate] {} passed for {}", check.name(), item.id);
                    results.push(CheckResult {
                        name: check.name().to_string(),
                        outcome: CheckOutcome::Passed,
                        detail,
                    });
                }
                Err(detail) => {
                    log::warn!(
                        "[Gate] {} failed for {}: {}",
                        check.name(),
                        item.id,
                        detail
                    );
                    results.push(CheckResult {
                        name: check.name().to_string(),
                        outcome: CheckOutcome::Failed,
                        detail,
                    });
                    verdict = Verdict::Fail;
                    break;
                }
            }
        }

        log::info!(
            "[Gate] Verdict for {}: {:?} ({}/{} checks ran)",
            item.id,
            verdict,
            results.len(),
            self.checks.len()
        );

        QualityReport {
            work_item_id: item.id.clone(),
            checks: results,
            verdict,
            evaluated_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AgentRole;
    use std::path::PathBuf;

    struct FixedCheck {
        name: String,
        result: Result<String, String>,
    }

    impl FixedCheck {
        fn passing(name: &str) -> Box<dyn QualityCheck> {
            Box::new(Self {
                name: name.to_string(),
                result: Ok(String::new()),
            })
        }

        fn failing(name: &str, detail: &str) -> Box<dyn QualityCheck> {
            Box::new(Self {
                name: name.to_string(),
                result: Err(detail.to_string()),
            })
        }
    }

    impl QualityCheck for FixedCheck {
        fn name(&self) -> &str {
            &self.name
        }

        fn run(&self, _item: &WorkItem, _artifact: &ArtifactDescriptor) -> Result<String, String> {
            self.result.clone()
        }
    }

    fn test_item() -> WorkItem {
        WorkItem::new("42", "Fix the parser", 1, AgentRole::Coder)
    }

    fn test_artifact(path: &std::path::Path) -> ArtifactDescriptor {
        ArtifactDescriptor {
            work_item_id: "42".to_string(),
            branch_name: "forgeflow/42".to_string(),
            worktree_path: path.to_path_buf(),
            summary: None,
        }
    }

    #[test]
    fn test_all_checks_pass() {
        let gate = QualityGateEnforcer::new(vec![
            FixedCheck::passing("build"),
            FixedCheck::passing("tests"),
        ]);

        let report = gate.evaluate(&test_item(), &test_artifact(&PathBuf::from("/tmp")));
        assert!(report.passed());
        assert_eq!(report.checks.len(), 2);
        assert!(report.failing_check().is_none());
    }

    #[test]
    fn test_pipeline_short_circuits_on_first_failure() {
        let gate = QualityGateEnforcer::new(vec![
            FixedCheck::passing("build"),
            FixedCheck::failing("tests", "2 tests failed"),
            FixedCheck::passing("lint"),
        ]);

        let report = gate.evaluate(&test_item(), &test_artifact(&PathBuf::from("/tmp")));
        assert_eq!(report.verdict, Verdict::Fail);

        // Exactly build and tests recorded; lint never ran
        let names: Vec<&str> = report.checks.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["build", "tests"]);
        assert_eq!(report.checks[0].outcome, CheckOutcome::Passed);
        assert_eq!(report.checks[1].outcome, CheckOutcome::Failed);
        assert_eq!(report.failing_check().unwrap().detail, "2 tests failed");
    }

    #[test]
    fn test_empty_pipeline_passes() {
        let gate = QualityGateEnforcer::new(vec![]);
        let report = gate.evaluate(&test_item(), &test_artifact(&PathBuf::from("/tmp")));
        assert!(report.passed());
        assert!(report.checks.is_empty());
    }

    #[test]
    fn test_evaluate_is_deterministic() {
        let gate = QualityGateEnforcer::new(vec![
            FixedCheck::passing("build"),
            FixedCheck::failing("tests", "boom"),
        ]);
        let item = test_item();
        let artifact = test_artifact(&PathBuf::from("/tmp"));

        let first = gate.evaluate(&item, &artifact);
        let second = gate.evaluate(&item, &artifact);

        assert_eq!(first.verdict, second.verdict);
        assert_eq!(first.checks.len(), second.checks.len());
        for (a, b) in first.checks.iter().zip(second.checks.iter()) {
            assert_eq!(a.name, b.name);
            assert_eq!(a.outcome, b.outcome);
            assert_eq!(a.detail, b.detail);
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_command_check_runs_in_worktree() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("marker.txt"), "present").unwrap();

        let pass = CommandCheck::new(
            "marker",
            "sh",
            vec!["-c".to_string(), "test -f marker.txt".to_string()],
        );
        assert!(pass.run(&test_item(), &test_artifact(temp_dir.path())).is_ok());

        let fail = CommandCheck::new(
            "missing",
            "sh",
            vec!["-c".to_string(), "test -f absent.txt".to_string()],
        );
        assert!(fail
            .run(&test_item(), &test_artifact(temp_dir.path()))
            .is_err());
    }

    #[test]
    fn test_from_config_preserves_order() {
        let settings = GateSettings {
            checks: vec![
                GateCheckSettings {
                    name: "build".to_string(),
                    command: "cargo".to_string(),
                    args: vec!["build".to_string()],
                },
                GateCheckSettings {
                    name: "tests".to_string(),
                    command: "cargo".to_string(),
                    args: vec!["test".to_string()],
                },
            ],
        };

        let gate = QualityGateEnforcer::from_config(&settings);
        assert_eq!(gate.check_count(), 2);
        assert_eq!(gate.checks[0].name(), "build");
        assert_eq!(gate.checks[1].name(), "tests");
    }
}
