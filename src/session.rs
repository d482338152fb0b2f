//! Per-connection session state.
//!
//! A connection is split in two: the handling task owns the read half, and a
//! writer task owns the write half and drains an unbounded outbound queue.
//! Everything else, including other sessions broadcasting or whispering,
//! talks to a connection through a cloneable [`SessionHandle`]. The socket is
//! closed when the writer task finishes, which happens once every handle has
//! been dropped and the queue is empty.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::AsyncWrite;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{ChatError, Result};
use crate::protocol::{FrameError, FrameWriter, EXIT};

/// Identifier assigned by the registry; never reused within a process.
pub type SessionId = u64;

/// Cloneable sending side of a session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    peer: SocketAddr,
    outbox: mpsc::UnboundedSender<String>,
    terminate: Arc<Notify>,
}

impl SessionHandle {
    /// Start the writer task for `writer` and return the handle feeding it.
    pub fn spawn<W>(writer: W, peer: SocketAddr) -> (Self, JoinHandle<()>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbox, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(write_loop(FrameWriter::new(writer), rx, peer));
        let handle = SessionHandle {
            peer,
            outbox,
            terminate: Arc::new(Notify::new()),
        };
        (handle, task)
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Queue a message. Fails only when the connection has already gone away.
    pub fn send(&self, text: impl Into<String>) -> Result<()> {
        self.outbox
            .send(text.into())
            .map_err(|_| ChatError::SessionGone)
    }

    /// Force this session to end: tell the client, then wake its handling loop.
    pub fn terminate(&self) {
        // The client may already be gone; the loop is woken regardless.
        let _ = self.send(EXIT);
        self.terminate.notify_one();
    }

    /// Resolves once [`terminate`](Self::terminate) has been called.
    pub async fn terminated(&self) {
        self.terminate.notified().await
    }
}

async fn write_loop<W>(
    mut writer: FrameWriter<W>,
    mut rx: mpsc::UnboundedReceiver<String>,
    peer: SocketAddr,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(text) = rx.recv().await {
        match writer.send(&text).await {
            Ok(()) => {}
            Err(FrameError::TooLarge(len)) => {
                warn!(peer = %peer, len, "Dropping outbound message larger than one frame");
            }
            Err(e) => {
                debug!(peer = %peer, error = %e, "Write failed, closing connection");
                return;
            }
        }
    }
    if let Err(e) = writer.shutdown().await {
        debug!(peer = %peer, error = %e, "Shutdown of write half failed");
    }
}
