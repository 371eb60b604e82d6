//! Process-based agent runner
//!
//! Spawns a CLI coding agent inside the work item's worktree, polls it with
//! cancellation, and turns the exit status into an artifact or a failure.
//! The orchestrator only sees the `AgentRunner` trait; this is the default
//! implementation for agents that ship as command-line tools.

use crate::agents::{AgentError, AgentRequest, AgentRunner, CancelFlag};
use crate::models::ArtifactDescriptor;
use anyhow::{anyhow, Result};
use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

const DEFAULT_POLL_INTERVAL_MS: u64 = 250;
const OUTPUT_TAIL_CHARS: usize = 400;

/// Runs a configured command as the agent.
///
/// Arguments may contain `{prompt}`, `{item_id}`, and `{branch}`
/// placeholders; if none of the arguments mentions `{prompt}`, the prompt is
/// appended as the final argument.
pub struct CommandRunner {
    program: String,
    args: Vec<String>,
    envs: Vec<(String, String)>,
    poll_interval: Duration,
}

impl CommandRunner {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    fn spawn(&self, request: &AgentRequest, prompt: &str) -> Result<Child> {
        let mut cmd = Command::new(&self.program);

        let mut prompt_used = false;
        for arg in &self.args {
            if arg.contains("{prompt}") {
                prompt_used = true;
            }
            cmd.arg(
                arg.replace("{prompt}", prompt)
                    .replace("{item_id}", &request.work_item_id)
                    .replace("{branch}", &request.branch_name),
            );
        }
        if !prompt_used {
            cmd.arg(prompt);
        }

        for (key, value) in &self.envs {
            cmd.env(key, value);
        }

        cmd.current_dir(&request.worktree_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        cmd.spawn()
            .map_err(|e| anyhow!("failed to spawn agent process '{}': {}", self.program, e))
    }
}

impl AgentRunner for CommandRunner {
    fn run(
        &self,
        request: &AgentRequest,
        cancel: &CancelFlag,
    ) -> Result<ArtifactDescriptor, AgentError> {
        let prompt = build_prompt(request);

        let mut child = self.spawn(request, &prompt).map_err(|e| AgentError::Failed {
            work_item_id: request.work_item_id.clone(),
            message: e.to_string(),
        })?;

        log::info!(
            "[Runner] Started agent process for {} in {:?}",
            request.work_item_id,
            request.worktree_path
        );

        // Drain output on threads so the child can't block on a full pipe
        let stdout_reader = drain_pipe(child.stdout.take());
        let stderr_reader = drain_pipe(child.stderr.take());

        loop {
            if cancel.is_cancelled() {
                log::warn!(
                    "[Runner] Cancellation requested for {}, killing agent process",
                    request.work_item_id
                );
                let _ = child.kill();
                let _ = child.wait();
                return Err(AgentError::Cancelled {
                    work_item_id: request.work_item_id.clone(),
                });
            }

            match child.try_wait() {
                Ok(Some(status)) => {
                    let stdout = stdout_reader.join().unwrap_or_default();
                    let stderr = stderr_reader.join().unwrap_or_default();

                    if status.success() {
                        log::info!("[Runner] Agent for {} exited cleanly", request.work_item_id);
                        return Ok(ArtifactDescriptor {
                            work_item_id: request.work_item_id.clone(),
                            branch_name: request.branch_name.clone(),
                            worktree_path: request.worktree_path.clone(),
                            summary: non_empty_tail(&stdout),
                        });
                    }

                    let detail = non_empty_tail(&stderr)
                        .or_else(|| non_empty_tail(&stdout))
                        .unwrap_or_default();
                    return Err(AgentError::Failed {
                        work_item_id: request.work_item_id.clone(),
                        message: format!(
                            "agent exited with {}: {}",
                            status
                                .code()
                                .map(|c| c.to_string())
                                .unwrap_or_else(|| "signal".to_string()),
                            detail
                        ),
                    });
                }
                Ok(None) => std::thread::sleep(self.poll_interval),
                Err(e) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(AgentError::Failed {
                        work_item_id: request.work_item_id.clone(),
                        message: format!("failed to poll agent process: {}", e),
                    });
                }
            }
        }
    }
}

fn drain_pipe<R: Read + Send + 'static>(
    pipe: Option<R>,
) -> std::thread::JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    })
}

/// Last `OUTPUT_TAIL_CHARS` characters of the output, or None if blank
fn non_empty_tail(bytes: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(bytes);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    let chars: Vec<char> = trimmed.chars().collect();
    let start = chars.len().saturating_sub(OUTPUT_TAIL_CHARS);
    Some(chars[start..].iter().collect())
}

/// Build the prompt handed to the agent process
fn build_prompt(request: &AgentRequest) -> String {
    format!(
        "# Work Item\n\n\
         **ID**: {}\n\
         **Role**: {}\n\
         **Title**: {}\n\n\
         ## Description\n{}\n\n\
         ## Instructions\n\
         - You are working in an isolated checkout on branch {}\n\
         - Implement this work item completely\n\
         - Commit all changes to the current branch before exiting\n\
         - Exit with status 0 only when the work is done\n",
        request.work_item_id,
        request.role,
        request.title,
        request.body.as_deref().unwrap_or("(no description)"),
        request.branch_name
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AgentRole;
    use std::path::PathBuf;

    fn test_request(dir: &std::path::Path) -> AgentRequest {
        AgentRequest {
            work_item_id: "42".to_string(),
            role: AgentRole::Coder,
            title: "Fix the parser".to_string(),
            body: Some("Details".to_string()),
            worktree_path: dir.to_path_buf(),
            branch_name: "forgeflow/42".to_string(),
        }
    }

    #[test]
    fn test_build_prompt_contains_item_fields() {
        let request = test_request(&PathBuf::from("/tmp"));
        let prompt = build_prompt(&request);
        assert!(prompt.contains("**ID**: 42"));
        assert!(prompt.contains("**Role**: coder"));
        assert!(prompt.contains("branch forgeflow/42"));
        assert!(prompt.contains("Details"));
    }

    #[test]
    fn test_non_empty_tail() {
        assert_eq!(non_empty_tail(b"  \n"), None);
        assert_eq!(non_empty_tail(b"hello"), Some("hello".to_string()));

        let long = "x".repeat(1000);
        let tail = non_empty_tail(long.as_bytes()).unwrap();
        assert_eq!(tail.len(), OUTPUT_TAIL_CHARS);
    }

    #[cfg(unix)]
    #[test]
    fn test_run_success_produces_artifact() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let runner = CommandRunner::new("sh").with_args(vec![
            "-c".to_string(),
            "echo done".to_string(),
        ]);

        let artifact = runner
            .run(&test_request(temp_dir.path()), &CancelFlag::new())
            .unwrap();
        assert_eq!(artifact.work_item_id, "42");
        assert_eq!(artifact.branch_name, "forgeflow/42");
        assert_eq!(artifact.summary, Some("done".to_string()));
    }

    #[cfg(unix)]
    #[test]
    fn test_run_failure_reports_exit_code() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let runner = CommandRunner::new("sh").with_args(vec![
            "-c".to_string(),
            "echo broken >&2; exit 3".to_string(),
        ]);

        let err = runner
            .run(&test_request(temp_dir.path()), &CancelFlag::new())
            .unwrap_err();
        match err {
            AgentError::Failed { message, .. } => {
                assert!(message.contains("3"));
                assert!(message.contains("broken"));
            }
            other => panic!("expected Failed, got {:?}", other),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_run_observes_cancellation() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let runner = CommandRunner::new("sh")
            .with_args(vec!["-c".to_string(), "sleep 30".to_string()]);

        let cancel = CancelFlag::new();
        let canceller = cancel.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            canceller.cancel();
        });

        let err = runner
            .run(&test_request(temp_dir.path()), &cancel)
            .unwrap_err();
        assert!(matches!(err, AgentError::Cancelled { .. }));
        handle.join().unwrap();
    }
}
