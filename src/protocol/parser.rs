//! Classification of inbound client lines.

use super::{COMMAND_SENTINEL, EXIT};

/// Control tokens a client may send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// The client acknowledges a forced termination.
    Exit,
}

/// One line received from a client, classified once at the protocol boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Chat text for everyone.
    Broadcast(String),
    /// A slash-command, e.g. `/whisper ann hi` is `{ name: "/whisper", args: ["ann", "hi"] }`.
    Command { name: String, args: Vec<String> },
    /// A control token.
    Control(Control),
    /// Nothing but whitespace.
    Empty,
}

/// Parse a received payload.
pub fn parse(line: &str) -> Inbound {
    if line == EXIT {
        return Inbound::Control(Control::Exit);
    }

    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Inbound::Empty;
    }

    if trimmed.starts_with(COMMAND_SENTINEL) {
        let mut words = trimmed.split_whitespace().map(str::to_string);
        // trimmed is non-empty, so there is at least one word
        let name = words.next().unwrap_or_default();
        return Inbound::Command {
            name,
            args: words.collect(),
        };
    }

    Inbound::Broadcast(line.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_broadcast() {
        assert_eq!(parse("hello all"), Inbound::Broadcast("hello all".into()));
    }

    #[test]
    fn test_parse_command_tokenizes_on_whitespace() {
        assert_eq!(
            parse("/whisper  ann   are you there"),
            Inbound::Command {
                name: "/whisper".into(),
                args: vec!["ann".into(), "are".into(), "you".into(), "there".into()],
            }
        );
        assert_eq!(
            parse("/users"),
            Inbound::Command {
                name: "/users".into(),
                args: vec![],
            }
        );
    }

    #[test]
    fn test_parse_exit_token() {
        assert_eq!(parse("END"), Inbound::Control(Control::Exit));
        // Only the exact token is a control message
        assert_eq!(parse("END of story"), Inbound::Broadcast("END of story".into()));
    }

    #[test]
    fn test_parse_empty() {
        assert_eq!(parse(""), Inbound::Empty);
        assert_eq!(parse("   "), Inbound::Empty);
    }
}
