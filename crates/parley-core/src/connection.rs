//! Connection handles and per-connection session state.

use parley_protocol::ServerEvent;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

/// Counter mixed into generated ids so two connections accepted in the
/// same nanosecond still differ.
static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Identifier of one live transport connection.
///
/// This is the value persisted as an identity's transport handle id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a process-unique connection ID.
    #[must_use]
    pub fn generate() -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn_{:x}_{:x}", timestamp, counter))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// The transport handle: a way to push events to one specific connection.
///
/// Cloning is cheap; all clones feed the same connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<Arc<ServerEvent>>,
}

impl ConnectionHandle {
    pub(crate) fn new(id: ConnectionId, tx: mpsc::UnboundedSender<Arc<ServerEvent>>) -> Self {
        Self { id, tx }
    }

    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Push an event to this connection.
    ///
    /// Returns `false` if the connection has already gone away.
    pub fn send(&self, event: Arc<ServerEvent>) -> bool {
        self.tx.send(event).is_ok()
    }
}

impl PartialEq for ConnectionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ConnectionHandle {}

/// Outbound queue of one connection: targeted events plus status broadcasts.
#[derive(Debug)]
pub struct Outbox {
    targeted: mpsc::UnboundedReceiver<Arc<ServerEvent>>,
    broadcast: broadcast::Receiver<Arc<ServerEvent>>,
}

impl Outbox {
    pub(crate) fn new(
        targeted: mpsc::UnboundedReceiver<Arc<ServerEvent>>,
        broadcast: broadcast::Receiver<Arc<ServerEvent>>,
    ) -> Self {
        Self {
            targeted,
            broadcast,
        }
    }

    /// Wait for the next outbound event.
    ///
    /// Returns `None` once the hub is gone.
    pub async fn recv(&mut self) -> Option<Arc<ServerEvent>> {
        loop {
            tokio::select! {
                biased;

                Some(event) = self.targeted.recv() => return Some(event),

                result = self.broadcast.recv() => match result {
                    Ok(event) => return Some(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Outbox lagged behind status broadcasts");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                },
            }
        }
    }

    /// Take an already queued event without waiting.
    pub fn try_recv(&mut self) -> Option<Arc<ServerEvent>> {
        if let Ok(event) = self.targeted.try_recv() {
            return Some(event);
        }
        loop {
            match self.broadcast.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }

    /// Drain every queued event.
    pub fn drain(&mut self) -> Vec<Arc<ServerEvent>> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

/// Identity binding of a connection.
///
/// A connection has no username until it registers, and can never
/// register again once closed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Unregistered,
    Registered {
        username: String,
    },
    Closed,
}

/// One connection's handle together with its state.
///
/// Owned by the task driving the connection, so its events are always
/// handled in arrival order.
#[derive(Debug)]
pub struct Session {
    handle: ConnectionHandle,
    state: ConnectionState,
}

impl Session {
    #[must_use]
    pub fn new(handle: ConnectionHandle) -> Self {
        Self {
            handle,
            state: ConnectionState::Unregistered,
        }
    }

    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        self.handle.id()
    }

    #[must_use]
    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    #[must_use]
    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// Username bound to this connection, if registered.
    #[must_use]
    pub fn username(&self) -> Option<&str> {
        match &self.state {
            ConnectionState::Registered { username } => Some(username),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    /// Bind a username, returning the one previously bound.
    pub(crate) fn bind(&mut self, username: &str) -> Option<String> {
        let previous = std::mem::replace(
            &mut self.state,
            ConnectionState::Registered {
                username: username.to_string(),
            },
        );
        match previous {
            ConnectionState::Registered { username } => Some(username),
            _ => None,
        }
    }

    /// Move to `Closed`, returning the username that was bound.
    pub(crate) fn close(&mut self) -> Option<String> {
        match std::mem::replace(&mut self.state, ConnectionState::Closed) {
            ConnectionState::Registered { username } => Some(username),
            _ => None,
        }
    }
}
