//! GitHub implementation of the issue tracker boundary

use crate::tracker::{dependency_refs, IssueTracker, TrackerError, TrackerIssue};
use crate::utils::backoff_delay;
use serde_json::{json, Value};

const MAX_REQUEST_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF_MS: u64 = 500;

/// GitHub REST API client for one repository
pub struct GitHubTracker {
    token: String,
    owner: String,
    repo: String,
    client: reqwest::blocking::Client,
}

impl GitHubTracker {
    pub fn new(token: String, owner: String, repo: String) -> Self {
        Self {
            token,
            owner,
            repo,
            client: reqwest::blocking::Client::new(),
        }
    }

    fn api_url(&self, path: &str) -> String {
        format!(
            "https://api.github.com/repos/{}/{}/{}",
            self.owner, self.repo, path
        )
    }

    /// Issue a request, retrying transient transport errors and 5xx/429
    /// responses with backoff before giving up
    fn request_with_retry<F>(&self, build: F) -> Result<reqwest::blocking::Response, TrackerError>
    where
        F: Fn() -> reqwest::blocking::RequestBuilder,
    {
        let mut last_error = String::new();

        for attempt in 0..MAX_REQUEST_ATTEMPTS {
            let request = build()
                .header("Authorization", format!("Bearer {}", self.token))
                .header("Accept", "application/vnd.github.v3+json")
                .header("User-Agent", "forgeflow");

            match request.send() {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }
                    let retriable = status.is_server_error() || status.as_u16() == 429;
                    let text = response.text().unwrap_or_default();
                    last_error = format!("GitHub API error ({}): {}", status, text);
                    if !retriable {
                        return Err(TrackerError::Request(last_error));
                    }
                }
                Err(e) => {
                    last_error = format!("request failed: {}", e);
                }
            }

            log::warn!(
                "[GitHub] Attempt {}/{} failed: {}",
                attempt + 1,
                MAX_REQUEST_ATTEMPTS,
                last_error
            );
            if attempt + 1 < MAX_REQUEST_ATTEMPTS {
                std::thread::sleep(backoff_delay(attempt, RETRY_BACKOFF_MS));
            }
        }

        Err(TrackerError::Request(last_error))
    }
}

impl IssueTracker for GitHubTracker {
    fn open_issues(&self) -> Result<Vec<TrackerIssue>, TrackerError> {
        let url = self.api_url("issues?state=open&per_page=100");
        let response = self.request_with_retry(|| self.client.get(&url))?;

        let issues_data: Vec<Value> = response
            .json()
            .map_err(|e| TrackerError::Parse(format!("Failed to parse response: {}", e)))?;

        let issues = issues_data
            .iter()
            .filter(|data| data.get("pull_request").is_none()) // Filter out PRs
            .map(parse_issue)
            .collect();

        Ok(issues)
    }

    fn post_comment(&self, issue_id: &str, body: &str) -> Result<(), TrackerError> {
        let url = self.api_url(&format!("issues/{}/comments", issue_id));
        let payload = json!({ "body": body });
        self.request_with_retry(|| self.client.post(&url).json(&payload))?;
        Ok(())
    }

    fn close_issue(&self, issue_id: &str) -> Result<(), TrackerError> {
        let url = self.api_url(&format!("issues/{}", issue_id));
        let payload = json!({ "state": "closed" });
        self.request_with_retry(|| self.client.patch(&url).json(&payload))?;
        Ok(())
    }

    fn add_label(&self, issue_id: &str, label: &str) -> Result<(), TrackerError> {
        let url = self.api_url(&format!("issues/{}/labels", issue_id));
        let payload = json!({ "labels": [label] });
        self.request_with_retry(|| self.client.post(&url).json(&payload))?;
        Ok(())
    }
}

fn parse_issue(data: &Value) -> TrackerIssue {
    let labels = data["labels"]
        .as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|l| l["name"].as_str())
                .map(|s| s.to_string())
                .collect()
        })
        .unwrap_or_default();

    let body = data["body"].as_str().map(|s| s.to_string());
    let blocked_by = body.as_deref().map(dependency_refs).unwrap_or_default();

    TrackerIssue {
        id: data["number"].as_u64().unwrap_or(0).to_string(),
        title: data["title"].as_str().unwrap_or("").to_string(),
        body,
        labels,
        blocked_by,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_github_tracker() {
        let tracker = GitHubTracker::new(
            "test_token".to_string(),
            "owner".to_string(),
            "repo".to_string(),
        );

        assert_eq!(tracker.owner, "owner");
        assert_eq!(tracker.repo, "repo");
        assert_eq!(
            tracker.api_url("issues/7/comments"),
            "https://api.github.com/repos/owner/repo/issues/7/comments"
        );
    }

    #[test]
    fn test_parse_issue() {
        let data = serde_json::json!({
            "number": 42,
            "title": "Fix the parser",
            "body": "Context.\nBlocked by: #40, #41",
            "labels": [{"name": "high"}, {"name": "role:coder"}]
        });

        let issue = parse_issue(&data);
        assert_eq!(issue.id, "42");
        assert_eq!(issue.title, "Fix the parser");
        assert_eq!(issue.labels, vec!["high", "role:coder"]);
        assert_eq!(issue.blocked_by, vec!["40", "41"]);
    }

    #[test]
    fn test_parse_issue_with_missing_fields() {
        let data = serde_json::json!({ "number": 7 });
        let issue = parse_issue(&data);
        assert_eq!(issue.id, "7");
        assert_eq!(issue.title, "");
        assert!(issue.body.is_none());
        assert!(issue.labels.is_empty());
        assert!(issue.blocked_by.is_empty());
    }

    // Note: Actual API tests would require a real GitHub token and repository
}
