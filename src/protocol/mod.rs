//! Chat wire protocol.
//!
//! Every message in either direction is a single frame:
//!
//! ```text
//! <length, 4 ASCII digits, left-justified, space padded><UTF-8 payload>
//!
//! Example:
//! "5   hello"
//! "12  Goodbye, ann."
//! ```
//!
//! Control tokens travel as ordinary payloads. The server sends
//! [`NAME_REQUEST`], [`NAME_IN_USE`], [`LEFT`] and [`EXIT`]; the only token a
//! client sends back is [`EXIT`], echoing a forced termination.

pub mod frame;
pub mod parser;

pub use frame::{FrameError, FrameReader, FrameWriter};
pub use parser::{parse as parse_inbound, Control, Inbound};

/// Sent by the server right after accepting a connection; the client answers
/// with its display name.
pub const NAME_REQUEST: &str = "GET_USERNAME";

/// The requested display name is already taken; the connection is closed.
pub const NAME_IN_USE: &str = "USERNAME_IN_USE";

/// Confirms a `/leave`; the server closes the connection afterwards.
pub const LEFT: &str = "LEAVE";

/// Forced termination (kick or shutdown). Clients echo it before closing.
pub const EXIT: &str = "END";

/// Prefix marking a line as a slash-command.
pub const COMMAND_SENTINEL: char = '/';
