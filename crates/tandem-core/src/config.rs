//! Orchestrator and per-run configuration
//!
//! `RunConfig` travels with every run request so concurrent sessions never
//! read shared globals. `OrchestratorConfig` is loaded once at startup from
//! `~/.tandem/config.toml` plus environment overrides.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::paths;

pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MAX_TOOL_CALLS: usize = 25;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_HISTORY_TOKEN_BUDGET: usize = 8000;

/// Whether sensitive tools wait for host approval
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionMode {
    /// Sensitive tools require approval
    #[default]
    Supervised,
    /// Everything runs without asking
    Autonomous,
}

/// Where the repository overview comes from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepomapSource {
    /// Ignore-aware file tree built by the orchestrator
    #[default]
    Local,
    /// Ask the host via `execute_in_host`
    Host,
}

/// How run workers are hosted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerMode {
    /// A child process per run, killed on cancel
    #[default]
    Process,
    /// A task per run, aborted on cancel
    InProcess,
}

/// Everything one agent run needs to know
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub base_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    pub max_tool_calls: usize,
    pub max_retries: u32,
    pub command_timeout_secs: u64,
    pub history_token_budget: usize,
    pub permission_mode: PermissionMode,
    /// Route list_files/search_files through the host
    pub tools_via_host: bool,
    /// Apply patches through host `replace_regions` instead of writing disk
    pub apply_via_host: bool,
    pub repomap: RepomapSource,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            api_key: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            temperature: None,
            max_tool_calls: DEFAULT_MAX_TOOL_CALLS,
            max_retries: DEFAULT_MAX_RETRIES,
            command_timeout_secs: DEFAULT_COMMAND_TIMEOUT_SECS,
            history_token_budget: DEFAULT_HISTORY_TOKEN_BUDGET,
            permission_mode: PermissionMode::default(),
            tools_via_host: false,
            apply_via_host: false,
            repomap: RepomapSource::default(),
        }
    }
}

impl RunConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

/// Startup configuration for the orchestrator process
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub worker: WorkerMode,
    pub run: RunConfig,
}

impl OrchestratorConfig {
    /// Load `~/.tandem/config.toml` and apply environment overrides
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_path(&paths::config_file())?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load from a specific path; a missing file yields defaults
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("Invalid config in {}", path.display()))
    }

    /// Apply `TANDEM_*` overrides using `lookup` for variable access
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(model) = lookup("TANDEM_MODEL") {
            self.run.model = model;
        }
        if let Some(key) = lookup("TANDEM_API_KEY").or_else(|| lookup("OPENAI_API_KEY")) {
            self.run.api_key = Some(key);
        }
        if let Some(url) = lookup("TANDEM_BASE_URL") {
            self.run.base_url = url;
        }
        if let Some(mode) = lookup("TANDEM_WORKER") {
            match mode.as_str() {
                "process" => self.worker = WorkerMode::Process,
                "in_process" => self.worker = WorkerMode::InProcess,
                other => tracing::warn!("Ignoring unknown TANDEM_WORKER value: {}", other),
            }
        }
    }
}
