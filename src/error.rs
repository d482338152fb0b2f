//! Error types shared across the chat server.

use crate::protocol::FrameError;
use crate::registry::RegistryError;

/// Result type alias for chat operations
pub type Result<T> = std::result::Result<T, ChatError>;

/// Errors surfaced by session, command and server operations.
///
/// None of these are fatal to the server; they end at most one session.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    /// Framing or transport failure on a connection
    #[error(transparent)]
    Frame(#[from] FrameError),
    /// A registry operation was refused
    #[error(transparent)]
    Registry(#[from] RegistryError),
    /// The session's connection is already gone
    #[error("session has disconnected")]
    SessionGone,
    /// No session uses the given display name
    #[error("user {0} not found")]
    UserNotFound(String),
    /// Socket setup failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
