//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// File-system or I/O operation failure.
    Io(String),
    /// JSON serialization or deserialization failure.
    Json(String),
    /// Git subprocess operation failure.
    Git(String),
    /// GitHub REST API failure.
    Github(String),
    /// Agent subprocess spawn or streaming failure.
    Agent(String),
    /// Authorization gateway protocol failure.
    Gateway(String),
    /// Channel adapter or routing failure.
    Channel(String),
    /// Session store failure.
    Session(String),
    /// Worktree creation or removal failure.
    Worktree(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// Caller is not authorized to perform the requested action.
    Unauthorized(String),
    /// Operation exceeded its deadline.
    Timeout(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
            Self::Json(msg) => write!(f, "json: {msg}"),
            Self::Git(msg) => write!(f, "git: {msg}"),
            Self::Github(msg) => write!(f, "github: {msg}"),
            Self::Agent(msg) => write!(f, "agent: {msg}"),
            Self::Gateway(msg) => write!(f, "gateway: {msg}"),
            Self::Channel(msg) => write!(f, "channel: {msg}"),
            Self::Session(msg) => write!(f, "session: {msg}"),
            Self::Worktree(msg) => write!(f, "worktree: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Unauthorized(msg) => write!(f, "unauthorized: {msg}"),
            Self::Timeout(msg) => write!(f, "timeout: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        Self::Channel(err.to_string())
    }
}
