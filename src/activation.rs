//! Process-wide activation state
//!
//! The one-time activation script writes `forgeflow.config.json` and the
//! `.forgeflow_active` marker into the project directory. This module loads
//! both once at startup into an immutable value that is passed explicitly
//! into the orchestrator's constructor; no component reads ambient
//! file-system state after that.

use crate::models::AgentRole;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Name of the configuration file written by the activation script
pub const CONFIG_FILE: &str = "forgeflow.config.json";
/// Name of the activation marker file
pub const MARKER_FILE: &str = ".forgeflow_active";

/// Per-role settings from the activation config
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct AgentSettings {
    pub enabled: bool,
    /// Scheduling priority for the role (lower = preferred)
    pub priority: i32,
}

/// Raw on-disk shape of `forgeflow.config.json`
#[derive(Debug, Clone, Deserialize)]
struct RawConfig {
    project_name: String,
    project_path: PathBuf,
    #[serde(default)]
    #[allow(dead_code)]
    activation_time: Option<String>,
    forgeflow_version: String,
    agents: HashMap<String, AgentSettings>,
}

/// Raw on-disk shape of `.forgeflow_active`
#[derive(Debug, Clone, Deserialize)]
struct RawMarker {
    activated: bool,
    #[serde(default)]
    #[allow(dead_code)]
    timestamp: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    project: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

/// Validated, immutable activation state
#[derive(Debug, Clone)]
pub struct ActivationState {
    pub project_name: String,
    pub project_path: PathBuf,
    pub version: String,
    /// Role settings keyed by the closed role set; unknown names are
    /// rejected during load
    pub agents: BTreeMap<AgentRole, AgentSettings>,
}

impl ActivationState {
    /// Roles with `enabled: true`, in role order
    pub fn enabled_roles(&self) -> Vec<AgentRole> {
        self.agents
            .iter()
            .filter(|(_, settings)| settings.enabled)
            .map(|(role, _)| *role)
            .collect()
    }

    pub fn is_enabled(&self, role: AgentRole) -> bool {
        self.agents
            .get(&role)
            .map(|s| s.enabled)
            .unwrap_or(false)
    }

    /// Configured priority for a role, falling back to the role default
    pub fn role_priority(&self, role: AgentRole) -> i32 {
        self.agents
            .get(&role)
            .map(|s| s.priority)
            .unwrap_or_else(|| role.default_priority())
    }
}

#[derive(Debug, Error)]
pub enum ActivationError {
    #[error("activation marker not found at {0}")]
    MarkerMissing(PathBuf),

    #[error("activation config not found at {0}")]
    ConfigMissing(PathBuf),

    #[error("project is not activated (marker status: {0})")]
    NotActivated(String),

    #[error("unknown agent role in activation config: {0}")]
    UnknownRole(String),

    #[error("no agent role is enabled")]
    NoEnabledAgents,

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Load and validate the activation state for a project directory.
///
/// Fails if the marker is absent or `activated` is false, if any role name
/// falls outside the closed set, or if no role is enabled.
pub fn load(project_path: &Path) -> Result<ActivationState, ActivationError> {
    let marker_path = project_path.join(MARKER_FILE);
    if !marker_path.exists() {
        return Err(ActivationError::MarkerMissing(marker_path));
    }
    let marker: RawMarker = read_json(&marker_path)?;
    if !marker.activated {
        return Err(ActivationError::NotActivated(
            marker.status.unwrap_or_else(|| "unknown".to_string()),
        ));
    }

    let config_path = project_path.join(CONFIG_FILE);
    if !config_path.exists() {
        return Err(ActivationError::ConfigMissing(config_path));
    }
    let raw: RawConfig = read_json(&config_path)?;

    let mut agents = BTreeMap::new();
    for (name, settings) in raw.agents {
        let role = AgentRole::from_name(&name).ok_or(ActivationError::UnknownRole(name))?;
        agents.insert(role, settings);
    }

    if !agents.values().any(|s| s.enabled) {
        return Err(ActivationError::NoEnabledAgents);
    }

    log::info!(
        "[Activation] Loaded '{}' (v{}) with {} enabled role(s)",
        raw.project_name,
        raw.forgeflow_version,
        agents.values().filter(|s| s.enabled).count()
    );

    Ok(ActivationState {
        project_name: raw.project_name,
        project_path: raw.project_path,
        version: raw.forgeflow_version,
        agents,
    })
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ActivationError> {
    let content = std::fs::read_to_string(path).map_err(|source| ActivationError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| ActivationError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
