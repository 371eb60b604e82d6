//! Configuration file handling
//!
//! Reads and writes .forgeflow/config.yaml for project-specific orchestration
//! settings. Activation state (forgeflow.config.json) is separate and owned
//! by the activation script; this file belongs to the orchestrator.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Scheduler and lifecycle settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    /// Requeues allowed before an item is permanently failed
    #[serde(default = "default_retry_ceiling")]
    pub retry_ceiling: u32,

    /// Deadline for a single agent execution, in seconds
    #[serde(default = "default_dispatch_timeout")]
    pub dispatch_timeout_secs: u64,

    /// Delay between scheduling passes, in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Seconds between issue tracker polls
    #[serde(default = "default_tracker_poll")]
    pub tracker_poll_secs: u64,

    /// Execution slots per enabled role
    #[serde(default = "default_slots_per_role")]
    pub slots_per_role: usize,

    /// Branch agent work merges into; discovered from HEAD when empty
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mainline_branch: Option<String>,

    /// Stop the loop once the queue drains and no agent is running
    #[serde(default = "default_exit_when_idle")]
    pub exit_when_idle: bool,
}

fn default_retry_ceiling() -> u32 {
    3
}
fn default_dispatch_timeout() -> u64 {
    1800
}
fn default_poll_interval() -> u64 {
    250
}
fn default_tracker_poll() -> u64 {
    30
}
fn default_slots_per_role() -> usize {
    1
}
fn default_exit_when_idle() -> bool {
    true
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            retry_ceiling: default_retry_ceiling(),
            dispatch_timeout_secs: default_dispatch_timeout(),
            poll_interval_ms: default_poll_interval(),
            tracker_poll_secs: default_tracker_poll(),
            slots_per_role: default_slots_per_role(),
            mainline_branch: None,
            exit_when_idle: default_exit_when_idle(),
        }
    }
}

/// One configured quality gate check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateCheckSettings {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Quality gate settings: the ordered check pipeline
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GateSettings {
    #[serde(default)]
    pub checks: Vec<GateCheckSettings>,
}

/// Top-level .forgeflow/config.yaml contents
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForgeConfig {
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    #[serde(default)]
    pub gate: GateSettings,
}

/// Configuration file manager
pub struct ConfigManager {
    config_path: std::path::PathBuf,
}

impl ConfigManager {
    /// Create a new config manager for a project
    pub fn new(project_path: &Path) -> Self {
        Self {
            config_path: project_path.join(".forgeflow").join("config.yaml"),
        }
    }

    /// Check if config file exists
    pub fn exists(&self) -> bool {
        self.config_path.exists()
    }

    /// Read config from file, returning defaults if not found
    pub fn read(&self) -> Result<ForgeConfig, String> {
        if !self.config_path.exists() {
            return Ok(ForgeConfig::default());
        }

        let content = std::fs::read_to_string(&self.config_path)
            .map_err(|e| format!("Failed to read config file: {}", e))?;

        serde_yaml::from_str(&content).map_err(|e| format!("Failed to parse config file: {}", e))
    }

    /// Write config to file
    pub fn write(&self, config: &ForgeConfig) -> Result<(), String> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create config directory: {}", e))?;
        }

        let content = serde_yaml::to_string(config)
            .map_err(|e| format!("Failed to serialize config: {}", e))?;

        std::fs::write(&self.config_path, content)
            .map_err(|e| format!("Failed to write config file: {}", e))
    }

    /// Initialize config with defaults if it doesn't exist
    pub fn initialize(&self) -> Result<ForgeConfig, String> {
        if self.exists() {
            return self.read();
        }

        let config = ForgeConfig::default();
        self.write(&config)?;
        Ok(config)
    }

    /// Update specific fields in the config
    pub fn update<F>(&self, updater: F) -> Result<ForgeConfig, String>
    where
        F: FnOnce(&mut ForgeConfig),
    {
        let mut config = self.read()?;
        updater(&mut config);
        self.write(&config)?;
        Ok(config)
    }

    /// Get the config file path
    pub fn path(&self) -> &Path {
        &self.config_path
    }
}
