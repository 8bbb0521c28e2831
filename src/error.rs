//! Agent-wide error taxonomy.
//!
//! Every error that can cross a worker boundary is an [`AgentError`];
//! each variant maps onto one of the wire error codes carried in the
//! JSON response envelope.

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum AgentError {
    /// Missing or malformed request parameters.
    #[error("{0}")]
    UserInput(String),

    /// Unknown session id.
    #[error("unknown session id")]
    InvalidSession,

    /// Unknown or terminated cursor id, or a cursor-id mismatch on fetch.
    #[error("unknown or terminated cursor id")]
    InvalidCursor,

    /// A cursor received a command it does not support.
    #[error("cursor cannot handle this command")]
    InvalidCursorCommand,

    /// Driver failure: open, ping, query, exec or row scan.
    #[error("database error: {0}")]
    Db(String),

    /// An in-flight driver call was aborted by cancellation.
    #[error("operation cancelled")]
    Cancelled,

    /// Soft signal: the result set is exhausted.
    #[error("no data")]
    NoData,

    /// A write to the streaming transport or export sink failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// Internal invariant violation or response serialization failure.
    #[error("{0}")]
    Unrecoverable(String),
}

impl AgentError {
    /// Wire error code for the JSON envelope.
    pub fn code(&self) -> &'static str {
        match self {
            AgentError::UserInput(_) => "invalid-user-input",
            AgentError::InvalidSession => "invalid-session-id",
            AgentError::InvalidCursor => "invalid-cursor-id",
            AgentError::InvalidCursorCommand => "invalid-cursor-cmd",
            AgentError::Db(_) | AgentError::Cancelled => "db-error",
            AgentError::NoData => "no-data",
            AgentError::Transport(_) | AgentError::Unrecoverable(_) => "unrecoverable-error",
        }
    }
}
