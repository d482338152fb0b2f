//! TCP server for chat connections.
//!
//! Accepts incoming connections, hands each one to its own task, and
//! coordinates operator actions: announcements, kicks and the draining
//! shutdown.

use crate::config::Config;
use crate::error::{ChatError, Result};
use crate::handler::handle_connection;
use crate::protocol::frame;
use crate::registry::Registry;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};

const SHUTDOWN_WARNING: &str = "[SERVER WARNING] The server is now self destructing.";

/// Server instance
pub struct Server {
    config: Config,
    registry: Arc<Registry>,
    connection_limit: Arc<Semaphore>,
    /// Set once every session has drained; the accept loop then drops the listener
    stopped: watch::Sender<bool>,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: Config) -> Self {
        let connection_limit = Arc::new(Semaphore::new(config.max_connections));
        Server {
            config,
            registry: Arc::new(Registry::new()),
            connection_limit,
            stopped: watch::Sender::new(false),
        }
    }

    /// Get a reference to the registry for testing
    #[cfg(test)]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Bind the configured address and serve until shut down.
    pub async fn run(&self) -> Result<()> {
        let addr = self
            .config
            .listen_addr()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
        let listener = bind(addr)?;
        self.serve(listener).await
    }

    /// Accept connections on `listener` until [`shutdown`](Self::shutdown) completes.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        info!(address = %listener.local_addr()?, "Server listening");
        let mut stopped = self.stopped.subscribe();

        loop {
            // Wait for a connection slot
            let permit = tokio::select! {
                _ = stopped.wait_for(|stopped| *stopped) => break,
                permit = Arc::clone(&self.connection_limit).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let (stream, peer) = tokio::select! {
                _ = stopped.wait_for(|stopped| *stopped) => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                        continue;
                    }
                },
            };
            debug!(peer = %peer, "New connection");

            let registry = Arc::clone(&self.registry);
            tokio::spawn(async move {
                let (reader, writer) = stream.into_split();
                if let Err(e) = handle_connection(reader, writer, peer, &registry).await {
                    debug!(peer = %peer, error = %e, "Connection error");
                }
                drop(permit);
            });
        }

        drop(listener);
        info!("Server closed");
        Ok(())
    }

    /// Broadcast a message from the operator to every session. A message too
    /// long for one frame is not sent.
    pub fn announce(&self, message: &str) -> usize {
        let line = format!("[THE SERVER SPEAKS] {message}");
        if frame::encoded_len(&line).is_none() {
            warn!(len = message.len(), "Server broadcast too long, not sent");
            return 0;
        }
        info!(message, "Server broadcast");
        self.registry.broadcast(&line)
    }

    /// Force one session to end. Does not wait for it to drain.
    pub fn kick(&self, name: &str) -> Result<()> {
        let Some((_, handle)) = self.registry.find(name) else {
            warn!(user = name, "Kick failed, user not found");
            return Err(ChatError::UserNotFound(name.to_string()));
        };
        info!(user = name, peer = %handle.peer(), "Kicking user");
        handle.terminate();
        Ok(())
    }

    /// Drain every session, then stop accepting connections.
    ///
    /// New registrations are refused first. Each session in turn is told to
    /// terminate and awaited until its own task has removed it from the
    /// registry. Only then is the listener released. Returns the number of
    /// sessions drained.
    pub async fn shutdown(&self) -> usize {
        self.registry.close();
        self.registry.broadcast(SHUTDOWN_WARNING);

        let mut drained = 0;
        while !self.registry.is_empty() {
            for (id, handle) in self.registry.sessions() {
                handle.terminate();
                drop(handle);
                self.registry.wait_until_gone(id).await;
                drained += 1;
                debug!(id, remaining = self.registry.len(), "Session drained");
            }
        }

        self.stopped.send_replace(true);
        info!(drained, "All sessions drained");
        drained
    }
}

/// Bind a listening socket with `SO_REUSEADDR`.
fn bind(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    TcpListener::from_std(socket.into())
}
