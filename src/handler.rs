//! Per-connection handling: name handshake, then the session loop.
//!
//! A connection moves through `AwaitingName -> Active -> Closed`:
//!
//! 1. The server sends [`NAME_REQUEST`] and reads one frame as the display name.
//! 2. A taken name gets [`NAME_IN_USE`] and the connection is closed without
//!    ever being registered.
//! 3. Otherwise the session is registered, a join notice is broadcast and the
//!    client is welcomed.
//! 4. Lines are dispatched until the client leaves, echoes
//!    [`EXIT`](crate::protocol::EXIT), is terminated by the server, or the
//!    stream fails.
//!
//! Every way out of the active state goes through the same teardown, which
//! removes the session if it is still registered and lets the writer task
//! flush and close the socket.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use crate::commands::{self, Context, Flow};
use crate::error::{ChatError, Result};
use crate::protocol::{
    parse_inbound, Control, FrameError, FrameReader, Inbound, NAME_IN_USE, NAME_REQUEST,
};
use crate::registry::{Registry, RegistryError, MAX_NAME_LEN};
use crate::session::{SessionHandle, SessionId};

/// How long queued output may take to reach a client once its session is over.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(3);

const WELCOME: &str =
    "You have successfully connected to the server, welcome!\nType /help for a list of commands.\n";

/// Why a session loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    /// The peer closed the stream.
    Disconnected,
    /// `/leave` was used.
    Left,
    /// The client echoed the exit token.
    Acknowledged,
    /// Kicked, or the server is shutting down.
    Terminated,
}

/// Handle a single client connection from handshake to close.
pub async fn handle_connection<R, W>(
    reader: R,
    writer: W,
    peer: SocketAddr,
    registry: &Registry,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (handle, mut writer_task) = SessionHandle::spawn(writer, peer);
    let mut reader = FrameReader::new(reader);

    let outcome = match handshake(&mut reader, &handle, registry).await {
        Ok(Some(id)) => {
            let outcome = run_session(&mut reader, &handle, registry, id).await;
            // No-op when /leave already removed the session
            commands::depart(registry, id);
            outcome
        }
        Ok(None) => Ok(()),
        Err(e) => Err(e),
    };

    // Anything still queued (a farewell, the exit token, the conflict signal)
    // is flushed before the socket closes, unless the client stopped reading.
    drop(reader);
    drop(handle);
    match tokio::time::timeout(FLUSH_TIMEOUT, &mut writer_task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(peer = %peer, error = %e, "Writer task failed"),
        Err(_) => {
            debug!(peer = %peer, "Client not reading, dropping unsent output");
            writer_task.abort();
        }
    }
    outcome
}

/// Negotiate a display name. `Ok(None)` means the connection is not admitted.
async fn handshake<R>(
    reader: &mut FrameReader<R>,
    handle: &SessionHandle,
    registry: &Registry,
) -> Result<Option<SessionId>>
where
    R: AsyncRead + Unpin,
{
    let peer = handle.peer();
    handle.send(NAME_REQUEST)?;

    let Some(raw) = reader.receive().await? else {
        debug!(peer = %peer, "Connection closed before sending a username");
        return Ok(None);
    };
    let name = raw.trim();

    match registry.add(name, handle.clone()) {
        Ok(id) => {
            info!(peer = %peer, user = name, "New connection accepted");
            registry.broadcast(&format!("{name} has joined!"));
            Ok(Some(id))
        }
        Err(RegistryError::NameConflict(_)) => {
            info!(peer = %peer, user = name, "Connection rejected, username in use");
            handle.send(NAME_IN_USE)?;
            Ok(None)
        }
        Err(RegistryError::NameTooLong(len)) => {
            info!(peer = %peer, len, "Connection rejected, username too long");
            handle.send(format!("Usernames can be at most {MAX_NAME_LEN} bytes long!"))?;
            Ok(None)
        }
        Err(e) => {
            debug!(peer = %peer, user = name, reason = %e, "Connection rejected");
            Ok(None)
        }
    }
}

async fn run_session<R>(
    reader: &mut FrameReader<R>,
    handle: &SessionHandle,
    registry: &Registry,
    id: SessionId,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let peer = handle.peer();
    let ctx = Context {
        registry,
        id,
        handle,
    };

    let exit = match serve_lines(reader, &ctx).await {
        Ok(exit) => exit,
        Err(ChatError::Frame(FrameError::Io(e))) => {
            debug!(peer = %peer, error = %e, "Connection lost");
            Exit::Disconnected
        }
        Err(ChatError::SessionGone) => Exit::Disconnected,
        Err(e) => {
            warn!(peer = %peer, error = %e, "Closing session after error");
            return Err(e);
        }
    };
    debug!(peer = %peer, ?exit, "Session finished");
    Ok(())
}

async fn serve_lines<R>(reader: &mut FrameReader<R>, ctx: &Context<'_>) -> Result<Exit>
where
    R: AsyncRead + Unpin,
{
    ctx.handle.send(WELCOME)?;

    loop {
        let received = tokio::select! {
            _ = ctx.handle.terminated() => return Ok(Exit::Terminated),
            received = reader.receive() => received?,
        };
        let Some(line) = received else {
            return Ok(Exit::Disconnected);
        };

        match parse_inbound(&line) {
            Inbound::Control(Control::Exit) => return Ok(Exit::Acknowledged),
            inbound => {
                if commands::dispatch(ctx, inbound) == Flow::Leave {
                    return Ok(Exit::Left);
                }
            }
        }
    }
}
