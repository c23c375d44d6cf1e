//! The relay engine.
//!
//! The relay turns inbound connection events into registry and store
//! mutations plus outbound events. Handlers are independent and share only
//! the registry, the hub and the two stores, so one relay serves every
//! connection in the process.

use crate::connection::{ConnectionId, Outbox, Session};
use crate::hub::{Hub, DEFAULT_BROADCAST_CAPACITY};
use crate::registry::{validate_username, PresenceRegistry};
use crate::store::{ConversationLog, IdentityStore, NewMessage, StoreError};
use parley_protocol::{ClientEvent, PresenceStatus, SendMessage, ServerEvent, TypingNotice};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Relay errors.
#[derive(Debug, Error)]
pub enum RelayError {
    /// A durable store call failed. Side effects after it were skipped.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The username sent with `register` was rejected.
    #[error("Invalid username: {0}")]
    InvalidUsername(&'static str),

    /// The session has already been closed.
    #[error("Session closed")]
    SessionClosed,
}

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Capacity of the status broadcast channel.
    pub broadcast_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: DEFAULT_BROADCAST_CAPACITY,
        }
    }
}

/// Whether a targeted event reached a live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// The recipient was not reachable; nothing was queued.
    Dropped,
}

impl Delivery {
    fn from_sent(sent: bool) -> Self {
        if sent {
            Delivery::Delivered
        } else {
            Delivery::Dropped
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Delivery::Delivered => "delivered",
            Delivery::Dropped => "dropped",
        }
    }
}

/// Result of dispatching one inbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Registered,
    Message(Delivery),
    Typing(Delivery),
}

/// The relay engine.
pub struct Relay {
    registry: PresenceRegistry,
    hub: Hub,
    identities: Arc<dyn IdentityStore>,
    log: Arc<dyn ConversationLog>,
}

impl Relay {
    /// Create a relay with default configuration.
    #[must_use]
    pub fn new(identities: Arc<dyn IdentityStore>, log: Arc<dyn ConversationLog>) -> Self {
        Self::with_config(RelayConfig::default(), identities, log)
    }

    /// Create a relay with custom configuration.
    #[must_use]
    pub fn with_config(
        config: RelayConfig,
        identities: Arc<dyn IdentityStore>,
        log: Arc<dyn ConversationLog>,
    ) -> Self {
        info!("Creating relay with config: {:?}", config);
        Self {
            registry: PresenceRegistry::new(),
            hub: Hub::with_capacity(config.broadcast_capacity),
            identities,
            log,
        }
    }

    #[must_use]
    pub fn registry(&self) -> &PresenceRegistry {
        &self.registry
    }

    #[must_use]
    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    #[must_use]
    pub fn identities(&self) -> &Arc<dyn IdentityStore> {
        &self.identities
    }

    #[must_use]
    pub fn log(&self) -> &Arc<dyn ConversationLog> {
        &self.log
    }

    /// Accept a new connection. It starts out unregistered.
    pub fn connect(&self) -> (Session, Outbox) {
        let (handle, outbox) = self.hub.open();
        (Session::new(handle), outbox)
    }

    /// Route one inbound event to its handler.
    ///
    /// # Errors
    ///
    /// Returns an error if the handler failed; see the individual handlers.
    pub async fn dispatch(
        &self,
        session: &mut Session,
        event: ClientEvent,
    ) -> Result<Outcome, RelayError> {
        trace!(connection = %session.id(), event = event.name(), "Dispatch");
        match event {
            ClientEvent::Register(username) => {
                self.register(session, &username).await?;
                Ok(Outcome::Registered)
            }
            ClientEvent::SendMessage(message) => {
                self.send_message(session, message).await.map(Outcome::Message)
            }
            ClientEvent::Typing(notice) => Ok(Outcome::Typing(self.typing(session, notice)?)),
        }
    }

    /// Bind `username` to the session's connection and announce it online.
    ///
    /// Registering again rebinds; registering under a different name first
    /// releases the old one.
    ///
    /// # Errors
    ///
    /// Returns an error if the username is invalid, the session is closed, or
    /// the identity store write fails. Nothing else happens in those cases.
    pub async fn register(&self, session: &mut Session, username: &str) -> Result<(), RelayError> {
        if session.is_closed() {
            return Err(RelayError::SessionClosed);
        }
        validate_username(username).map_err(RelayError::InvalidUsername)?;

        let connection = session.id().clone();
        self.identities.mark_online(username, &connection).await?;
        self.registry.register(username, session.handle().clone());

        if let Some(previous) = session.bind(username) {
            if previous != username {
                debug!(
                    connection = %connection,
                    from = %previous,
                    to = %username,
                    "Connection renamed"
                );
                if let Err(e) = self.release(&previous, &connection).await {
                    warn!(username = %previous, error = %e, "Failed to release previous username");
                }
            }
        }

        self.hub
            .broadcast(ServerEvent::user_status(username, PresenceStatus::Online));
        info!(username = %username, connection = %connection, "User online");
        Ok(())
    }

    /// Persist a message, then push it to the recipient if they are online.
    ///
    /// Reachability comes from the durable identity record, so a recipient
    /// bound to a connection in another process is simply dropped here.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is closed or a store call fails. The
    /// message is not delivered if the append failed.
    pub async fn send_message(
        &self,
        session: &Session,
        message: SendMessage,
    ) -> Result<Delivery, RelayError> {
        if session.is_closed() {
            return Err(RelayError::SessionClosed);
        }

        let stored = self
            .log
            .append(NewMessage {
                from: message.from,
                to: message.to,
                message: message.message,
            })
            .await?;

        let recipient = self.identities.find(&stored.to).await?;
        let sent = recipient
            .as_ref()
            .and_then(|identity| identity.reachable_handle())
            .is_some_and(|handle| {
                self.hub.send_to(
                    handle,
                    ServerEvent::receive_message(stored.from.as_str(), stored.message.as_str()),
                )
            });

        let delivery = Delivery::from_sent(sent);
        debug!(
            connection = %session.id(),
            from = %stored.from,
            to = %stored.to,
            id = stored.id,
            delivery = delivery.as_str(),
            "Message relayed"
        );
        Ok(delivery)
    }

    /// Push a typing indicator to the recipient's registered connection.
    ///
    /// # Errors
    ///
    /// Returns an error only if the session is closed.
    pub fn typing(&self, session: &Session, notice: TypingNotice) -> Result<Delivery, RelayError> {
        if session.is_closed() {
            return Err(RelayError::SessionClosed);
        }

        let sent = self
            .registry
            .lookup(&notice.to)
            .is_some_and(|handle| handle.send(Arc::new(ServerEvent::typing(notice.from.as_str()))));

        trace!(from = %notice.from, to = %notice.to, sent, "Typing");
        Ok(Delivery::from_sent(sent))
    }

    /// Tear down a connection.
    ///
    /// A registered session releases its username unless a newer connection
    /// has taken it over. Calling this twice is harmless.
    ///
    /// # Errors
    ///
    /// Returns an error if the identity store write fails; the offline
    /// broadcast is skipped in that case.
    pub async fn disconnect(&self, session: &mut Session) -> Result<(), RelayError> {
        let connection = session.id().clone();
        let username = session.close();
        self.hub.close(&connection);

        match username {
            Some(username) => {
                self.release(&username, &connection).await?;
            }
            None => debug!(connection = %connection, "Unregistered connection closed"),
        }
        Ok(())
    }

    /// Drop `username`'s binding to `connection` and announce it offline.
    ///
    /// The store is always cleared if it still names this connection, even
    /// when the registry has already moved on, since registry and store
    /// writes for two racing registrations can land in opposite orders.
    /// The offline broadcast goes out only once neither the registry nor
    /// the store binds the username to a live connection.
    ///
    /// Returns `true` if the user was announced offline.
    async fn release(&self, username: &str, connection: &ConnectionId) -> Result<bool, RelayError> {
        let removed = self.registry.remove_if_current(username, connection);
        let cleared = self.identities.mark_offline(username, connection).await?;

        if !cleared {
            debug!(
                username = %username,
                connection = %connection,
                "Stored handle belongs to another connection, staying online"
            );
            return Ok(false);
        }
        if !removed && self.registry.contains(username) {
            debug!(username = %username, connection = %connection, "Superseded, staying online");
            return Ok(false);
        }

        self.hub
            .broadcast(ServerEvent::user_status(username, PresenceStatus::Offline));
        info!(username = %username, connection = %connection, "User offline");
        Ok(true)
    }

    /// Relay statistics.
    #[must_use]
    pub fn stats(&self) -> RelayStats {
        RelayStats {
            connection_count: self.hub.len(),
            online_count: self.registry.len(),
        }
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Copy)]
pub struct RelayStats {
    /// Open connections, registered or not.
    pub connection_count: usize,
    /// Usernames registered in this process.
    pub online_count: usize,
}
