//! The crate-wide error taxonomy: tool-level and dispatcher-level failures
//! that are reported to callers as values, never as panics or JSON-RPC
//! protocol errors.

use crate::browser_buffer::BrowserCommandRecord;
use thiserror::Error;

/// Every error a session, dispatcher, or registry operation can produce.
///
/// This is deliberately *not* used for MCP protocol-level errors (malformed
/// JSON-RPC, missing fields) — those are handled beneath the tool layer by
/// `rmcp` itself. `CoreError` is the payload behind `{success:false, error}`.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("session '{0}' not found")]
    SessionNotFound(String),

    #[error("session '{0}' already exists")]
    SessionAlreadyExists(String),

    #[error("SSH transport error: {0}")]
    SshTransport(String),

    #[error("validation: {0}")]
    Validation(String),

    #[error("command queue is full")]
    QueueFull,

    #[error("command discarded: stale (queued longer than the staleness window)")]
    StaleCommand,

    #[error("command timed out")]
    TimedOut,

    #[error("no command is currently executing in this session")]
    NoActiveMcpCommand,

    /// An MCP submission was rejected because browser-initiated commands ran
    /// unacknowledged.
    #[error("BROWSER_COMMANDS_EXECUTED")]
    BrowserCommandsExecuted {
        browser_commands: Vec<BrowserCommandRecord>,
    },

    #[error("session is shutting down")]
    SessionDisposing,
}

impl CoreError {
    /// The stable error code surfaced to MCP callers.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::SessionNotFound(_) => "SESSION_NOT_FOUND",
            CoreError::SessionAlreadyExists(_) => "SESSION_ALREADY_EXISTS",
            CoreError::SshTransport(_) => "SSH_TRANSPORT_ERROR",
            CoreError::Validation(_) => "VALIDATION_ERROR",
            CoreError::QueueFull => "QUEUE_FULL",
            CoreError::StaleCommand => "STALE_COMMAND",
            CoreError::TimedOut => "TIMED_OUT",
            CoreError::NoActiveMcpCommand => "NO_ACTIVE_MCP_COMMAND",
            CoreError::BrowserCommandsExecuted { .. } => "BROWSER_COMMANDS_EXECUTED",
            CoreError::SessionDisposing => "SESSION_DISPOSING",
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
