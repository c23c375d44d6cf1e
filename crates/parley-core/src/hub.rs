//! Connection hub.
//!
//! The hub is the transport-level address book: every open connection is
//! listed here by id, whether or not it has registered a username. It
//! provides targeted delivery by handle id and a broadcast to everyone.

use crate::connection::{ConnectionHandle, ConnectionId, Outbox};
use dashmap::DashMap;
use parley_protocol::ServerEvent;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace};

/// Default capacity of the status broadcast channel.
pub const DEFAULT_BROADCAST_CAPACITY: usize = 1024;

/// Table of open connections.
#[derive(Debug)]
pub struct Hub {
    connections: DashMap<ConnectionId, ConnectionHandle>,
    broadcast: broadcast::Sender<Arc<ServerEvent>>,
}

impl Hub {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BROADCAST_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (broadcast, _) = broadcast::channel(capacity);
        Self {
            connections: DashMap::new(),
            broadcast,
        }
    }

    /// Open a new connection: allocate its id, handle and outbound queue.
    pub fn open(&self) -> (ConnectionHandle, Outbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ConnectionHandle::new(ConnectionId::generate(), tx);
        let outbox = Outbox::new(rx, self.broadcast.subscribe());

        self.connections.insert(handle.id().clone(), handle.clone());
        debug!(connection = %handle.id(), open = self.connections.len(), "Connection opened");

        (handle, outbox)
    }

    /// Forget a connection. Idempotent.
    pub fn close(&self, connection: &ConnectionId) {
        if self.connections.remove(connection).is_some() {
            debug!(connection = %connection, open = self.connections.len(), "Connection closed");
        }
    }

    /// Push an event to one connection.
    ///
    /// Returns `false` if no such connection is open here.
    pub fn send_to(&self, connection: &ConnectionId, event: ServerEvent) -> bool {
        match self.connections.get(connection) {
            Some(handle) => {
                let sent = handle.send(Arc::new(event));
                trace!(connection = %connection, sent, "Targeted send");
                sent
            }
            None => false,
        }
    }

    /// Send an event to every open connection.
    ///
    /// Returns the number of receivers.
    pub fn broadcast(&self, event: ServerEvent) -> usize {
        let count = self.broadcast.send(Arc::new(event)).unwrap_or_default();
        trace!(recipients = count, "Broadcast");
        count
    }

    /// Number of open connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_protocol::PresenceStatus;

    #[test]
    fn test_open_close() {
        let hub = Hub::new();
        let (h1, _o1) = hub.open();
        let (h2, _o2) = hub.open();

        assert_ne!(h1.id(), h2.id());
        assert_eq!(hub.len(), 2);
        assert!(hub.send_to(h1.id(), ServerEvent::typing("bob")));

        hub.close(h1.id());
        hub.close(h1.id());
        assert_eq!(hub.len(), 1);
        assert!(!hub.send_to(h1.id(), ServerEvent::typing("bob")));
    }

    #[test]
    fn test_send_to_targets_one_connection() {
        let hub = Hub::new();
        let (h1, mut o1) = hub.open();
        let (_h2, mut o2) = hub.open();

        assert!(hub.send_to(h1.id(), ServerEvent::typing("bob")));
        assert_eq!(o1.drain().len(), 1);
        assert!(o2.drain().is_empty());

        assert!(!hub.send_to(&"conn-missing".into(), ServerEvent::typing("bob")));
    }

    #[tokio::test]
    async fn test_broadcast_reaches_everyone() {
        let hub = Hub::new();
        let (_h1, mut o1) = hub.open();
        let (_h2, mut o2) = hub.open();

        let count = hub.broadcast(ServerEvent::user_status("alice", PresenceStatus::Online));
        assert_eq!(count, 2);

        let expected = ServerEvent::user_status("alice", PresenceStatus::Online);
        assert_eq!(*o1.recv().await.unwrap(), expected);
        assert_eq!(*o2.recv().await.unwrap(), expected);
    }

    #[test]
    fn test_broadcast_without_connections() {
        let hub = Hub::new();
        assert_eq!(
            hub.broadcast(ServerEvent::user_status("alice", PresenceStatus::Offline)),
            0
        );
    }
}
