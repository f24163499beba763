//! Error types shared by the router and the command channel.

use std::io;

/// Stable error codes carried by user-visible failures and peer responses.
pub mod codes {
    /// General failure reported by a peer.
    pub const GENERAL: u16 = 2000;
    /// A parameter was not bound before execute.
    pub const PARAMETER_NOT_SET: u16 = 2002;
    /// The session backing a command has been closed.
    pub const SESSION_CLOSED: u16 = 2003;
    /// The statement was cancelled on the peer.
    pub const STATEMENT_CANCELLED: u16 = 2004;
    /// The statement does not support the requested operation.
    pub const UNSUPPORTED_OPERATION: u16 = 2005;
}

/// Errors that can occur while routing a statement or driving the wire
/// protocol against a peer.
#[derive(thiserror::Error, Debug)]
pub enum DbError {
    /// I/O failure on the peer transport. Only this kind enters the
    /// session's reconnect handling.
    #[error("transport: {0}")]
    Transport(#[from] io::Error),
    /// The peer produced a message the protocol does not allow here.
    #[error("protocol: {0}")]
    Protocol(String),
    /// Caller-side misuse, e.g. an unbound parameter.
    #[error("error {code}: {message}")]
    User { code: u16, message: String },
    /// Failure reported by the remote peer over the wire.
    #[error("peer error {code}: {message}")]
    Peer { code: u16, message: String },
    /// Cluster-level failure, e.g. no live seed endpoint for DDL.
    #[error("cluster: {0}")]
    Cluster(String),
    /// The session or command has been closed.
    #[error("session closed")]
    Closed,
}

impl DbError {
    /// `PARAMETER_NOT_SET` carrying the 1-based parameter index.
    pub fn parameter_not_set(index: usize) -> Self {
        DbError::User {
            code: codes::PARAMETER_NOT_SET,
            message: format!("parameter #{} is not set", index + 1),
        }
    }

    pub fn unsupported(what: &str) -> Self {
        DbError::User {
            code: codes::UNSUPPORTED_OPERATION,
            message: what.to_string(),
        }
    }

    /// Whether this error came from the transport layer. Reconnect handling
    /// applies to exactly these.
    pub fn is_transport(&self) -> bool {
        matches!(self, DbError::Transport(_))
    }

    /// Collapse any error crossing a router boundary into a [`DbError`].
    pub fn convert<E: Into<DbError>>(e: E) -> DbError {
        e.into()
    }

    /// The code to report over the wire when this error crosses back to a
    /// client.
    pub fn code(&self) -> u16 {
        match self {
            DbError::User { code, .. } | DbError::Peer { code, .. } => *code,
            DbError::Closed => codes::SESSION_CLOSED,
            _ => codes::GENERAL,
        }
    }
}

impl From<tokio::task::JoinError> for DbError {
    fn from(e: tokio::task::JoinError) -> Self {
        DbError::Protocol(format!("task failed: {e}"))
    }
}
