//! Error types for the chat relay.
//!
//! Errors are split by how far they are allowed to travel:
//! - `ServerError`: startup and listener failures, returned from `Server::run`
//! - `ConnectionError`: transport failures that end a single connection
//! - `ChatError`: application failures, reported back to the client in a reply

use std::time::Duration;
use thiserror::Error;

/// Listener-level failures.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid listen address '{0}'")]
    InvalidAddress(String),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("connection limiter closed")]
    LimiterClosed,

    #[error("failed to initialize user store: {0}")]
    UserStore(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Failures that terminate one connection and nothing else.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no frame received for {0:?}")]
    Idle(Duration),

    #[error("outbound queue closed")]
    WriterClosed,

    #[error("writer task failed: {0}")]
    Writer(String),
}

/// Application failures. The `Display` text is what the client sees as `reason`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    #[error("invalid username or password")]
    InvalidCredentials,

    #[error("username already taken: {0}")]
    UsernameTaken(String),

    #[error("username must be 1-{max} characters without whitespace")]
    InvalidUsername { max: usize },

    #[error("username is reserved: {0}")]
    ReservedUsername(String),

    #[error("password must not be empty")]
    EmptyPassword,

    #[error("session is not valid on this connection")]
    InvalidSession,

    #[error("receiver is not online: {0}")]
    ReceiverOffline(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ChatError {
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}
