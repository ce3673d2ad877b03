//! Crate-wide error taxonomy.
//!
//! Every component returns `Result<T, AgentShellError>`. Messages are kept
//! short and safe for the tool boundary -- never include secret bytes.

use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum AgentShellError {
    #[error("session is busy: {0}")]
    Busy(String),

    #[error("session not found or terminated: {0}")]
    SessionGone(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("provide_input called while session is not awaiting input: {0}")]
    PromptMismatch(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("connection failed: {0}")]
    ConnFailed(String),

    #[error("connection pool exhausted for {0}")]
    PoolExhausted(String),

    #[error("tunnel not found: {0}")]
    TunnelNotFound(String),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, AgentShellError>;

impl AgentShellError {
    /// True for errors raised by a read deadline elapsing, so callers can
    /// distinguish "no data yet" from a hard I/O failure.
    pub fn is_timeout(&self) -> bool {
        matches!(self, AgentShellError::Timeout(_))
    }
}

impl From<std::io::Error> for AgentShellError {
    fn from(e: std::io::Error) -> Self {
        AgentShellError::IoError(e.to_string())
    }
}
