//! Registry of connected sessions and the display names they hold.
//!
//! Provides a thread-safe directory with:
//! - Atomic add/remove/rename, so the set of names in use always equals the
//!   set of session names
//! - Point-in-time snapshots for listing and broadcasting
//! - Change notification for draining sessions at shutdown
//!
//! The lock is a `std::sync::RwLock` and is never held across an `.await`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::watch;
use tracing::{debug, trace};

use crate::session::{SessionHandle, SessionId};

/// Longest display name, in bytes. Keeps every notice that quotes names
/// within a single frame.
pub const MAX_NAME_LEN: usize = 32;

/// Refused registry operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("the name {0} is already in use")]
    NameConflict(String),
    #[error("the name is empty")]
    EmptyName,
    #[error("the name is {} bytes long, the limit is {}", .0, MAX_NAME_LEN)]
    NameTooLong(usize),
    #[error("the name is already {0}")]
    NoChange(String),
    #[error("session not found")]
    NotFound,
    #[error("the server is shutting down")]
    Closed,
}

struct Entry {
    name: String,
    handle: SessionHandle,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<SessionId, Entry>,
    names: HashMap<String, SessionId>,
    next_id: SessionId,
    closed: bool,
}

/// What remains of a session after it has been removed.
#[derive(Debug, Clone)]
pub struct RemovedSession {
    pub name: String,
    pub peer: SocketAddr,
}

/// Thread-safe directory of live sessions.
pub struct Registry {
    inner: RwLock<Inner>,
    /// Bumped after every add and remove
    changes: watch::Sender<u64>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            inner: RwLock::new(Inner::default()),
            changes: watch::Sender::new(0),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    fn notify_change(&self) {
        self.changes.send_modify(|version| *version += 1);
    }

    /// Register a session under `name`.
    ///
    /// The "name in use" check and the insertion happen under one write lock,
    /// so of two concurrent handshakes for the same name exactly one succeeds.
    pub fn add(&self, name: &str, handle: SessionHandle) -> Result<SessionId, RegistryError> {
        let id = {
            let mut inner = self.write();
            if inner.closed {
                return Err(RegistryError::Closed);
            }
            if name.is_empty() {
                return Err(RegistryError::EmptyName);
            }
            if name.len() > MAX_NAME_LEN {
                return Err(RegistryError::NameTooLong(name.len()));
            }
            if inner.names.contains_key(name) {
                return Err(RegistryError::NameConflict(name.to_string()));
            }

            let id = inner.next_id;
            inner.next_id += 1;
            inner.names.insert(name.to_string(), id);
            inner.sessions.insert(
                id,
                Entry {
                    name: name.to_string(),
                    handle,
                },
            );
            id
        };

        trace!(id, name, "Session registered");
        self.notify_change();
        Ok(id)
    }

    /// Remove a session. `NotFound` means someone else removed it first.
    pub fn remove(&self, id: SessionId) -> Result<RemovedSession, RegistryError> {
        let entry = {
            let mut inner = self.write();
            let entry = inner.sessions.remove(&id).ok_or(RegistryError::NotFound)?;
            inner.names.remove(&entry.name);
            entry
        };

        trace!(id, name = %entry.name, "Session removed");
        self.notify_change();
        Ok(RemovedSession {
            name: entry.name,
            peer: entry.handle.peer(),
        })
    }

    /// Change a session's display name, returning the old one.
    pub fn rename(&self, id: SessionId, new_name: &str) -> Result<String, RegistryError> {
        let mut inner = self.write();
        let current = inner
            .sessions
            .get(&id)
            .map(|entry| entry.name.clone())
            .ok_or(RegistryError::NotFound)?;

        if new_name == current {
            return Err(RegistryError::NoChange(current));
        }
        if inner.names.contains_key(new_name) {
            return Err(RegistryError::NameConflict(new_name.to_string()));
        }
        if new_name.is_empty() {
            return Err(RegistryError::EmptyName);
        }
        if new_name.len() > MAX_NAME_LEN {
            return Err(RegistryError::NameTooLong(new_name.len()));
        }

        inner.names.remove(&current);
        inner.names.insert(new_name.to_string(), id);
        if let Some(entry) = inner.sessions.get_mut(&id) {
            entry.name = new_name.to_string();
        }
        debug!(id, from = %current, to = new_name, "Session renamed");
        Ok(current)
    }

    /// Look up a session by display name.
    pub fn find(&self, name: &str) -> Option<(SessionId, SessionHandle)> {
        let inner = self.read();
        let id = *inner.names.get(name)?;
        inner.sessions.get(&id).map(|entry| (id, entry.handle.clone()))
    }

    /// Current display name of a session.
    pub fn name_of(&self, id: SessionId) -> Option<String> {
        self.read().sessions.get(&id).map(|entry| entry.name.clone())
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.read().sessions.contains_key(&id)
    }

    /// Sorted snapshot of the names in use.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().names.keys().cloned().collect();
        names.sort();
        names
    }

    /// Snapshot of every live session.
    pub fn sessions(&self) -> Vec<(SessionId, SessionHandle)> {
        self.read()
            .sessions
            .iter()
            .map(|(id, entry)| (*id, entry.handle.clone()))
            .collect()
    }

    /// Send `text` to every session.
    ///
    /// Recipients are snapshotted first and messaged outside the lock. A
    /// recipient that disconnects in between is skipped. Returns the number
    /// of sessions the message was queued for.
    pub fn broadcast(&self, text: &str) -> usize {
        let recipients: Vec<SessionHandle> = self
            .read()
            .sessions
            .values()
            .map(|entry| entry.handle.clone())
            .collect();

        let mut delivered = 0;
        for handle in recipients {
            match handle.send(text) {
                Ok(()) => delivered += 1,
                Err(_) => trace!(peer = %handle.peer(), "Broadcast recipient already gone"),
            }
        }
        delivered
    }

    pub fn len(&self) -> usize {
        self.read().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().sessions.is_empty()
    }

    /// Refuse all further registrations.
    pub fn close(&self) {
        self.write().closed = true;
    }

    /// Wait until session `id` is no longer registered.
    pub async fn wait_until_gone(&self, id: SessionId) {
        let mut changes = self.changes.subscribe();
        // wait_for checks the current state before sleeping, so a removal that
        // happened before subscribing is not missed
        let _ = changes.wait_for(|_| !self.contains(id)).await;
    }

    /// Check that the name index and the session table agree.
    #[cfg(test)]
    fn is_consistent(&self) -> bool {
        let inner = self.read();
        inner.names.len() == inner.sessions.len()
            && inner
                .sessions
                .iter()
                .all(|(id, entry)| inner.names.get(&entry.name) == Some(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn handle() -> SessionHandle {
        let (_client, server) = tokio::io::duplex(1024);
        SessionHandle::spawn(server, "127.0.0.1:5000".parse().unwrap()).0
    }

    #[tokio::test]
    async fn test_add_and_find() {
        let registry = Registry::new();
        let id = registry.add("ann", handle()).unwrap();

        assert_eq!(registry.find("ann").map(|(found, _)| found), Some(id));
        assert!(registry.find("bob").is_none());
        assert_eq!(registry.name_of(id).as_deref(), Some("ann"));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_add_rejects_duplicate_and_empty() {
        let registry = Registry::new();
        registry.add("ann", handle()).unwrap();

        assert_eq!(
            registry.add("ann", handle()),
            Err(RegistryError::NameConflict("ann".into()))
        );
        assert_eq!(registry.add("", handle()), Err(RegistryError::EmptyName));
        let long = "n".repeat(MAX_NAME_LEN + 1);
        assert_eq!(
            registry.add(&long, handle()),
            Err(RegistryError::NameTooLong(MAX_NAME_LEN + 1))
        );
        registry.add(&"n".repeat(MAX_NAME_LEN), handle()).unwrap();
        assert_eq!(registry.len(), 2);
        assert!(registry.is_consistent());
    }

    #[tokio::test]
    async fn test_remove_twice() {
        let registry = Registry::new();
        let id = registry.add("ann", handle()).unwrap();

        let removed = registry.remove(id).unwrap();
        assert_eq!(removed.name, "ann");
        assert_eq!(registry.remove(id).unwrap_err(), RegistryError::NotFound);
        assert!(registry.is_empty());
        // The name is free again
        registry.add("ann", handle()).unwrap();
    }

    #[tokio::test]
    async fn test_rename() {
        let registry = Registry::new();
        let ann = registry.add("ann", handle()).unwrap();
        registry.add("bob", handle()).unwrap();

        assert_eq!(
            registry.rename(ann, "ann"),
            Err(RegistryError::NoChange("ann".into()))
        );
        assert_eq!(
            registry.rename(ann, "bob"),
            Err(RegistryError::NameConflict("bob".into()))
        );
        assert_eq!(registry.rename(ann, ""), Err(RegistryError::EmptyName));
        assert_eq!(
            registry.rename(ann, &"n".repeat(MAX_NAME_LEN + 1)),
            Err(RegistryError::NameTooLong(MAX_NAME_LEN + 1))
        );
        assert_eq!(registry.list(), vec!["ann", "bob"]);

        assert_eq!(registry.rename(ann, "cat").as_deref(), Ok("ann"));
        assert_eq!(registry.list(), vec!["bob", "cat"]);
        assert!(registry.find("ann").is_none());
        assert_eq!(registry.rename(999, "dan"), Err(RegistryError::NotFound));
        assert!(registry.is_consistent());
    }

    #[tokio::test]
    async fn test_invariant_over_mixed_operations() {
        let registry = Registry::new();
        let mut ids = Vec::new();
        for i in 0..20 {
            ids.push(registry.add(&format!("user{i}"), handle()).unwrap());
            assert!(registry.is_consistent());
        }
        for (i, id) in ids.iter().enumerate() {
            match i % 3 {
                0 => {
                    registry.remove(*id).unwrap();
                }
                1 => {
                    let _ = registry.rename(*id, &format!("user{}", i + 1));
                }
                _ => {
                    registry.rename(*id, &format!("renamed{i}")).unwrap();
                }
            }
            assert!(registry.is_consistent());
        }
        assert_eq!(registry.list().len(), registry.len());
    }

    #[tokio::test]
    async fn test_closed_registry_refuses_adds() {
        let registry = Registry::new();
        registry.close();
        assert_eq!(registry.add("ann", handle()), Err(RegistryError::Closed));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_adds_same_name() {
        let registry = Arc::new(Registry::new());
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let registry = Arc::clone(&registry);
            tasks.push(tokio::spawn(async move {
                registry.add("ann", handle()).is_ok()
            }));
        }

        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(registry.list(), vec!["ann"]);
    }

    #[tokio::test]
    async fn test_broadcast_skips_departed_recipient() {
        let registry = Registry::new();
        let (client, server) = tokio::io::duplex(1024);
        let (live, _task) = SessionHandle::spawn(server, "127.0.0.1:5001".parse().unwrap());
        registry.add("ann", live).unwrap();

        let (gone_client, gone_server) = tokio::io::duplex(64);
        let (gone, gone_task) =
            SessionHandle::spawn(gone_server, "127.0.0.1:5002".parse().unwrap());
        registry.add("bob", gone.clone()).unwrap();
        drop(gone_client);
        let _ = gone.send("x");
        gone_task.await.unwrap();

        assert_eq!(registry.broadcast("hi"), 1);

        let mut reader = crate::protocol::FrameReader::new(client);
        assert_eq!(reader.receive().await.unwrap().as_deref(), Some("hi"));
    }

    #[tokio::test]
    async fn test_wait_until_gone() {
        let registry = Arc::new(Registry::new());
        let id = registry.add("ann", handle()).unwrap();

        let remover = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                registry.remove(id).unwrap();
            })
        };

        tokio::time::timeout(Duration::from_secs(5), registry.wait_until_gone(id))
            .await
            .expect("session should be removed");
        remover.await.unwrap();

        // Already gone: returns immediately
        registry.wait_until_gone(id).await;
        assert!(registry.is_empty());
    }
}
