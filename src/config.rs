//! Global configuration parsing and validation.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{info, warn};

use crate::{AppError, Result};

/// Default loopback port for the authorization gateway.
pub const DEFAULT_GATEWAY_PORT: u16 = 3001;

/// Nested Slack configuration required for Socket Mode connectivity.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SlackConfig {
    /// App-level token used for Socket Mode.
    #[serde(default)]
    pub app_token: String,
    /// Bot user token used for posting messages.
    #[serde(default)]
    pub bot_token: String,
    /// Default channel where notifications are posted.
    #[serde(default)]
    pub channel_id: String,
}

/// Nested LINE Messaging API configuration.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct LineConfig {
    /// Channel access token for the Messaging API.
    #[serde(default)]
    pub channel_access_token: String,
    /// Local port for the inbound webhook listener.
    #[serde(default = "default_line_webhook_port")]
    pub webhook_port: u16,
}

impl Default for LineConfig {
    fn default() -> Self {
        Self {
            channel_access_token: String::new(),
            webhook_port: default_line_webhook_port(),
        }
    }
}

/// HTTP polling channel configuration.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct HttpChannelConfig {
    /// Whether the poll-based `/api/v1` channel is enabled.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// GitHub intake configuration.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GithubConfig {
    /// Personal access token used for REST calls and authenticated clones.
    #[serde(default)]
    pub token: String,
    /// Repositories (`owner/repo`) polled for trigger issues.
    #[serde(default)]
    pub repos: Vec<String>,
    /// Issue label that marks an issue as a task for the orchestrator.
    #[serde(default = "default_trigger_label")]
    pub trigger_label: String,
    /// Poll interval in seconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            repos: Vec::new(),
            trigger_label: default_trigger_label(),
            poll_interval_seconds: default_poll_interval(),
        }
    }
}

/// Agent CLI invocation settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct AgentConfig {
    /// Agent CLI binary (e.g. `claude`).
    #[serde(default = "default_agent_binary")]
    pub binary: String,
    /// System prompt appended to every invocation.
    #[serde(default)]
    pub system_prompt: String,
    /// Optional cap on agent turns per invocation.
    #[serde(default)]
    pub max_turns: Option<u32>,
    /// Hard wall-clock timeout for one agent run, in seconds.
    #[serde(default = "default_agent_timeout")]
    pub timeout_seconds: u64,
    /// Per-stream cap on captured stdout/stderr bytes.
    #[serde(default = "default_max_output_size")]
    pub max_output_size: usize,
    /// Strip Slack-related environment variables from the child environment.
    #[serde(default)]
    pub sanitize_env: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            binary: default_agent_binary(),
            system_prompt: String::new(),
            max_turns: None,
            timeout_seconds: default_agent_timeout(),
            max_output_size: default_max_output_size(),
            sanitize_env: false,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_line_webhook_port() -> u16 {
    3100
}

fn default_trigger_label() -> String {
    "claps".into()
}

fn default_poll_interval() -> u64 {
    60
}

fn default_agent_binary() -> String {
    "claude".into()
}

fn default_agent_timeout() -> u64 {
    600
}

fn default_max_output_size() -> usize {
    1024 * 1024
}

fn default_session_max_age() -> u64 {
    24
}

fn default_gateway_port() -> u16 {
    DEFAULT_GATEWAY_PORT
}

fn default_home_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".claps")
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// State directory holding sessions, tokens, clones, and history.
    #[serde(default = "default_home_dir")]
    pub home_dir: PathBuf,
    /// Loopback port for the authorization gateway.
    #[serde(default = "default_gateway_port")]
    pub gateway_port: u16,
    /// Session record TTL in hours.
    #[serde(default = "default_session_max_age")]
    pub session_max_age_hours: u64,
    /// Agent CLI settings.
    #[serde(default)]
    pub agent: AgentConfig,
    /// Slack connectivity settings; absent disables the Slack adapter.
    #[serde(default)]
    pub slack: Option<SlackConfig>,
    /// LINE connectivity settings; absent disables the LINE adapter.
    #[serde(default)]
    pub line: Option<LineConfig>,
    /// HTTP polling channel settings.
    #[serde(default)]
    pub http: Option<HttpChannelConfig>,
    /// GitHub intake settings.
    #[serde(default)]
    pub github: GithubConfig,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load missing credentials from the OS keyring, then environment
    /// variables. Already-populated fields are left untouched so the TOML
    /// file remains the highest-priority source.
    pub fn load_credentials(&mut self) {
        if let Some(ref mut slack) = self.slack {
            if slack.app_token.is_empty() {
                slack.app_token = lookup_credential("slack-app-token", "SLACK_APP_TOKEN");
            }
            if slack.bot_token.is_empty() {
                slack.bot_token = lookup_credential("slack-bot-token", "SLACK_BOT_TOKEN");
            }
        }
        if let Some(ref mut line) = self.line {
            if line.channel_access_token.is_empty() {
                line.channel_access_token =
                    lookup_credential("line-channel-access-token", "LINE_CHANNEL_ACCESS_TOKEN");
            }
        }
        if self.github.token.is_empty() {
            self.github.token = lookup_credential("github-token", "GITHUB_TOKEN");
        }
    }

    /// Path of the persisted session map.
    #[must_use]
    pub fn sessions_path(&self) -> PathBuf {
        self.home_dir.join("sessions.json")
    }

    /// Path of the gateway auth token file, present only while running.
    #[must_use]
    pub fn auth_token_path(&self) -> PathBuf {
        self.home_dir.join("auth-token")
    }

    /// Path of the operator-maintained admin configuration.
    #[must_use]
    pub fn admin_config_path(&self) -> PathBuf {
        self.home_dir.join("admin-config.json")
    }

    /// Path of the append-only task history log.
    #[must_use]
    pub fn history_path(&self) -> PathBuf {
        self.home_dir.join("history.jsonl")
    }

    /// Base directory for repository clones.
    #[must_use]
    pub fn repos_dir(&self) -> PathBuf {
        self.home_dir.join("repos")
    }

    /// Clone directory for one repository.
    #[must_use]
    pub fn repo_dir(&self, owner: &str, repo: &str) -> PathBuf {
        self.repos_dir().join(owner).join(repo)
    }

    /// Shared workspace used by tasks without a target repository.
    #[must_use]
    pub fn shared_workspace_dir(&self) -> PathBuf {
        self.home_dir.join("workspace")
    }

    fn validate(&self) -> Result<()> {
        if self.gateway_port == 0 {
            return Err(AppError::Config("gateway_port must be non-zero".into()));
        }
        if self.agent.binary.is_empty() {
            return Err(AppError::Config("agent.binary must not be empty".into()));
        }
        if self.agent.max_output_size == 0 {
            return Err(AppError::Config(
                "agent.max_output_size must be greater than zero".into(),
            ));
        }
        for spec in &self.github.repos {
            if spec.split('/').count() != 2 {
                return Err(AppError::Config(format!(
                    "github.repos entry '{spec}' is not owner/repo"
                )));
            }
        }
        Ok(())
    }
}

fn lookup_credential(keyring_key: &str, env_var: &str) -> String {
    match keyring::Entry::new("claps", keyring_key).and_then(|entry| entry.get_password()) {
        Ok(secret) if !secret.is_empty() => {
            info!(key = keyring_key, "credential loaded from keyring");
            return secret;
        }
        Ok(_) => {}
        Err(keyring::Error::NoEntry) => {}
        Err(err) => warn!(key = keyring_key, %err, "keyring lookup failed"),
    }
    std::env::var(env_var).unwrap_or_default()
}

/// Per-user identity mapping row from `admin-config.json`.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct UserMapping {
    /// Canonical Slack user id.
    #[serde(default)]
    pub slack_id: Option<String>,
    /// GitHub login mapped to the Slack id.
    #[serde(default)]
    pub github_handle: Option<String>,
    /// LINE user id mapped to the Slack id.
    #[serde(default)]
    pub line_id: Option<String>,
    /// HTTP device id mapped to the Slack id.
    #[serde(default)]
    pub http_device_id: Option<String>,
}

/// Per-channel user whitelists.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct AllowedUsers {
    /// Slack user ids allowed to create tasks. Empty allows everyone.
    #[serde(default)]
    pub slack: Vec<String>,
    /// LINE user ids allowed to create tasks. Empty allows everyone.
    #[serde(default)]
    pub line: Vec<String>,
    /// HTTP device ids allowed to create tasks. Empty allows everyone.
    #[serde(default)]
    pub http: Vec<String>,
}

/// Operator-maintained administrative configuration.
///
/// Stored at `~/.claps/admin-config.json` (mode 0600) and hot-reloaded by
/// [`crate::config_watcher::AdminConfigWatcher`].
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct AdminConfig {
    /// Per-channel whitelists.
    #[serde(default)]
    pub allowed_users: AllowedUsers,
    /// Cross-channel identity mapping table.
    #[serde(default)]
    pub user_mappings: Vec<UserMapping>,
    /// Slack id of the administrator, used when no mapping matches.
    #[serde(default)]
    pub admin_slack_id: Option<String>,
}

impl AdminConfig {
    /// Load the admin configuration, returning defaults when the file is
    /// absent or malformed. Malformed content is logged, never fatal.
    #[must_use]
    pub fn load_or_default(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(parsed) => parsed,
                Err(err) => {
                    warn!(path = %path.display(), %err, "malformed admin config; using defaults");
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }
}
