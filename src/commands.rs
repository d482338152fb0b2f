//! Slash-command dispatch for a single session.
//!
//! Every inbound chat line is either broadcast as `name> text` or resolved
//! against [`COMMANDS`] and run by the matching handler. Handlers report
//! misuse to the issuing session only; an `Err` from a handler is turned into
//! a generic failure reply and never ends the session.

use tracing::{debug, info, warn};

use crate::error::{ChatError, Result};
use crate::protocol::{frame, Inbound, COMMAND_SENTINEL, LEFT};
use crate::registry::{Registry, RegistryError, RemovedSession, MAX_NAME_LEN};
use crate::session::{SessionHandle, SessionId};

/// Known slash-commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Rename,
    Users,
    Whisper,
    Help,
    Leave,
}

/// Static description of a command.
#[derive(Debug)]
pub struct CommandEntry {
    pub kind: CommandKind,
    pub name: &'static str,
    pub usage: &'static str,
    pub help: &'static str,
}

pub static COMMANDS: [CommandEntry; 5] = [
    CommandEntry {
        kind: CommandKind::Rename,
        name: "/rename",
        usage: "/rename [New Username]",
        help: "Function: Renames your username to [New Username].",
    },
    CommandEntry {
        kind: CommandKind::Users,
        name: "/users",
        usage: "/users",
        help: "Function: Outputs a list of all users currently online.",
    },
    CommandEntry {
        kind: CommandKind::Whisper,
        name: "/whisper",
        usage: "/whisper [Username] [Message...]",
        help: "Function: Sends a private message to [Username]. Remember, usernames are case sensitive.",
    },
    CommandEntry {
        kind: CommandKind::Help,
        name: "/help",
        usage: "/help [/command (optional)]",
        help: "Function: Returns information about a specified command; if no command is specified \
               then outputs a list of available commands. Commands are case sensitive.",
    },
    CommandEntry {
        kind: CommandKind::Leave,
        name: "/leave",
        usage: "/leave",
        help: "Function: Removes you from the server.",
    },
];

impl CommandKind {
    /// Resolve a command by its exact (case sensitive) name.
    pub fn lookup(name: &str) -> Option<&'static CommandEntry> {
        COMMANDS.iter().find(|entry| entry.name == name)
    }

    fn arity_ok(self, args: usize) -> bool {
        match self {
            CommandKind::Rename => args == 1,
            CommandKind::Users | CommandKind::Leave => args == 0,
            CommandKind::Whisper => args >= 2,
            CommandKind::Help => args <= 1,
        }
    }
}

/// Whether the session loop should keep reading after a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Leave,
}

/// The issuing session, as seen by command handlers.
pub struct Context<'a> {
    pub registry: &'a Registry,
    pub id: SessionId,
    pub handle: &'a SessionHandle,
}

impl Context<'_> {
    fn reply(&self, text: impl Into<String>) -> Result<()> {
        self.handle.send(text)
    }

    /// Current display name; renames are visible immediately.
    fn name(&self) -> Result<String> {
        self.registry
            .name_of(self.id)
            .ok_or(ChatError::Registry(RegistryError::NotFound))
    }
}

/// Handle one classified line from a session.
pub fn dispatch(ctx: &Context<'_>, inbound: Inbound) -> Flow {
    match inbound {
        Inbound::Broadcast(text) => {
            if let Err(e) = send_all(ctx, &text) {
                warn!(id = ctx.id, error = %e, "Failed to broadcast message");
                let _ = ctx.reply("Something unforeseen went wrong whilst processing your message!");
            }
            Flow::Continue
        }
        Inbound::Command { name, args } => run_command(ctx, &name, &args),
        Inbound::Control(_) | Inbound::Empty => Flow::Continue,
    }
}

fn run_command(ctx: &Context<'_>, name: &str, args: &[String]) -> Flow {
    let Some(entry) = CommandKind::lookup(name) else {
        debug!(id = ctx.id, command = name, "Unknown command");
        let _ = ctx.reply(format!("{name} is not a valid command."));
        return Flow::Continue;
    };

    let outcome = if entry.kind.arity_ok(args.len()) {
        match entry.kind {
            CommandKind::Rename => rename(ctx, &args[0]),
            CommandKind::Users => list_users(ctx),
            CommandKind::Whisper => whisper(ctx, &args[0], &args[1..].join(" ")),
            CommandKind::Help => help(ctx, args.first().map(String::as_str)),
            CommandKind::Leave => leave(ctx),
        }
    } else {
        debug!(id = ctx.id, command = entry.name, args = args.len(), "Wrong parameters");
        ctx.reply(format!(
            "Invalid parameters! Ensure command is in the form: {}.",
            entry.usage
        ))
        .map(|()| Flow::Continue)
    };

    outcome.unwrap_or_else(|e| {
        warn!(id = ctx.id, command = entry.name, error = %e, "Command failed");
        let _ = ctx.reply(format!(
            "An error occurred! The {} command has failed for unforeseen reasons.",
            entry.name
        ));
        Flow::Continue
    })
}

fn send_all(ctx: &Context<'_>, text: &str) -> Result<()> {
    let name = ctx.name()?;
    let line = format!("{name}> {text}");
    if frame::encoded_len(&line).is_none() {
        return ctx.reply("Your message is too long to send.");
    }
    info!(user = %name, message = text, "Received message");
    ctx.registry.broadcast(&line);
    Ok(())
}

fn rename(ctx: &Context<'_>, new_name: &str) -> Result<Flow> {
    match ctx.registry.rename(ctx.id, new_name) {
        Ok(old) => {
            info!(
                peer = %ctx.handle.peer(),
                from = %old,
                to = new_name,
                "Username changed"
            );
            ctx.registry.broadcast(&format!(
                "The user {old} has changed their username to {new_name}."
            ));
        }
        Err(RegistryError::NoChange(current)) => {
            ctx.reply(format!("Your username is already set as {current}!"))?;
        }
        Err(RegistryError::NameConflict(taken)) => {
            ctx.reply(format!("There already exists a user called {taken}!"))?;
        }
        Err(RegistryError::EmptyName) => {
            ctx.reply("You can't change your username to nothing!")?;
        }
        Err(RegistryError::NameTooLong(_)) => {
            ctx.reply(format!("Usernames can be at most {MAX_NAME_LEN} bytes long!"))?;
        }
        Err(e) => return Err(e.into()),
    }
    Ok(Flow::Continue)
}

fn list_users(ctx: &Context<'_>) -> Result<Flow> {
    let names = ctx.registry.list();
    let frames = match names.as_slice() {
        [only] => vec![format!("There is only 1 user online: \n{only}.")],
        _ => pack_lines(
            format!("There are {} users currently online: ", names.len()),
            &names,
        ),
    };
    debug!(id = ctx.id, frames = frames.len(), "User list requested");
    for part in frames {
        ctx.reply(part)?;
    }
    Ok(Flow::Continue)
}

/// Append `lines` to `header`, one per line, starting a new frame whenever
/// the next line would overflow the current one.
fn pack_lines(header: String, lines: &[String]) -> Vec<String> {
    let mut frames = Vec::new();
    let mut current = header;
    for line in lines {
        if current.len() + 1 + line.len() > frame::MAX_PAYLOAD {
            frames.push(std::mem::take(&mut current));
        } else {
            current.push('\n');
        }
        current.push_str(line);
    }
    frames.push(current);
    frames
}

fn whisper(ctx: &Context<'_>, target: &str, message: &str) -> Result<Flow> {
    let name = ctx.name()?;
    if target == name {
        ctx.reply("You can't whisper to yourself!")?;
        return Ok(Flow::Continue);
    }

    let not_found = || {
        ctx.reply(format!(
            "Could not locate the user {target}! Type /users to see who is online."
        ))
    };
    let Some((_, recipient)) = ctx.registry.find(target) else {
        not_found()?;
        return Ok(Flow::Continue);
    };

    if message.trim().is_empty() {
        ctx.reply("You can't whisper nothing! Please include a message.")?;
        return Ok(Flow::Continue);
    }

    let delivered = format!("From {name} to you> {message}");
    let echo = format!("From you to {target}> {message}");
    if frame::encoded_len(&delivered).is_none() || frame::encoded_len(&echo).is_none() {
        ctx.reply("Your message is too long to send.")?;
        return Ok(Flow::Continue);
    }

    match recipient.send(delivered) {
        Ok(()) => {
            ctx.reply(echo)?;
            info!(from = %name, to = target, message, "Whisper");
        }
        // Disconnected between lookup and delivery
        Err(ChatError::SessionGone) => not_found()?,
        Err(e) => return Err(e),
    }
    Ok(Flow::Continue)
}

fn help(ctx: &Context<'_>, topic: Option<&str>) -> Result<Flow> {
    let Some(topic) = topic else {
        let names: Vec<&str> = COMMANDS.iter().map(|entry| entry.name).collect();
        ctx.reply(format!(
            "List of commands: {}.\nType /help [/command] for more info about that command.",
            names.join(", ")
        ))?;
        return Ok(Flow::Continue);
    };

    let qualified = if topic.starts_with(COMMAND_SENTINEL) {
        topic.to_string()
    } else {
        format!("{COMMAND_SENTINEL}{topic}")
    };
    match CommandKind::lookup(&qualified) {
        Some(entry) => ctx.reply(format!("Format: {}.\n{}", entry.usage, entry.help))?,
        None => ctx.reply(format!("/help command failed, {topic} is not a valid command!"))?,
    }
    Ok(Flow::Continue)
}

fn leave(ctx: &Context<'_>) -> Result<Flow> {
    let name = ctx.name()?;
    // The client may be gone already; removal must happen regardless
    let _ = ctx.reply(format!("Goodbye, {name}."));
    let _ = ctx.reply(LEFT);
    info!(user = %name, "User used /leave");
    depart(ctx.registry, ctx.id);
    Ok(Flow::Leave)
}

/// Remove a session and tell everyone it left.
///
/// Returns `None` when the session was already removed (by `/leave`, a kick
/// or shutdown), in which case nothing is announced.
pub fn depart(registry: &Registry, id: SessionId) -> Option<RemovedSession> {
    let removed = registry.remove(id).ok()?;
    registry.broadcast(&format!("{} has left.", removed.name));
    info!(user = %removed.name, peer = %removed.peer, "Connection closed");
    Some(removed)
}
