//! Event types for the Parley realtime protocol.
//!
//! Every frame carries exactly one named event with its payload:
//!
//! ```json
//! {"event": "send_message", "data": {"from": "bob", "to": "alice", "message": "hi"}}
//! ```

use serde::{Deserialize, Serialize};

/// Online/offline state of a user, as announced in `user_status` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
}

impl PresenceStatus {
    /// Map a durable online flag to a status.
    #[must_use]
    pub fn from_online(is_online: bool) -> Self {
        if is_online {
            PresenceStatus::Online
        } else {
            PresenceStatus::Offline
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceStatus::Online => "online",
            PresenceStatus::Offline => "offline",
        }
    }
}

impl std::fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of an inbound `send_message` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessage {
    /// Sender username.
    pub from: String,
    /// Recipient username.
    pub to: String,
    /// Message body.
    pub message: String,
}

/// Payload of an inbound `typing` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingNotice {
    /// Who is typing.
    pub from: String,
    /// Who should be told.
    pub to: String,
}

/// Payload of an outbound `user_status` broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub username: String,
    pub status: PresenceStatus,
}

/// Events sent by clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Bind a username to the sending connection.
    Register(String),

    /// Persist a message and relay it to the recipient if reachable.
    SendMessage(SendMessage),

    /// Tell the recipient the sender is typing.
    Typing(TypingNotice),
}

impl ClientEvent {
    /// Event name as it appears on the wire.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::Register(_) => "register",
            ClientEvent::SendMessage(_) => "send_message",
            ClientEvent::Typing(_) => "typing",
        }
    }

    /// Create a `register` event.
    #[must_use]
    pub fn register(username: impl Into<String>) -> Self {
        ClientEvent::Register(username.into())
    }

    /// Create a `send_message` event.
    #[must_use]
    pub fn send_message(
        from: impl Into<String>,
        to: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        ClientEvent::SendMessage(SendMessage {
            from: from.into(),
            to: to.into(),
            message: message.into(),
        })
    }

    /// Create a `typing` event.
    #[must_use]
    pub fn typing(from: impl Into<String>, to: impl Into<String>) -> Self {
        ClientEvent::Typing(TypingNotice {
            from: from.into(),
            to: to.into(),
        })
    }
}

/// Events sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Sent once when a connection is accepted.
    Connected {
        /// Transport handle id of this connection.
        connection_id: String,
        /// Protocol version spoken by the server.
        version: String,
    },

    /// Broadcast to every connection when a user comes online or goes offline.
    UserStatus(StatusChange),

    /// Targeted delivery of a chat message.
    ReceiveMessage {
        from: String,
        message: String,
    },

    /// Targeted typing indicator.
    Typing {
        from: String,
    },

    /// A frame from the client could not be decoded.
    Error {
        code: u16,
        message: String,
    },
}

impl ServerEvent {
    /// Event name as it appears on the wire.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Connected { .. } => "connected",
            ServerEvent::UserStatus(_) => "user_status",
            ServerEvent::ReceiveMessage { .. } => "receive_message",
            ServerEvent::Typing { .. } => "typing",
            ServerEvent::Error { .. } => "error",
        }
    }

    /// Create a `user_status` event.
    #[must_use]
    pub fn user_status(username: impl Into<String>, status: PresenceStatus) -> Self {
        ServerEvent::UserStatus(StatusChange {
            username: username.into(),
            status,
        })
    }

    /// Create a `receive_message` event.
    #[must_use]
    pub fn receive_message(from: impl Into<String>, message: impl Into<String>) -> Self {
        ServerEvent::ReceiveMessage {
            from: from.into(),
            message: message.into(),
        }
    }

    /// Create a `typing` event.
    #[must_use]
    pub fn typing(from: impl Into<String>) -> Self {
        ServerEvent::Typing { from: from.into() }
    }

    /// Create an `error` event.
    #[must_use]
    pub fn error(code: u16, message: impl Into<String>) -> Self {
        ServerEvent::Error {
            code,
            message: message.into(),
        }
    }

    /// Create a `connected` event.
    #[must_use]
    pub fn connected(connection_id: impl Into<String>, version: impl Into<String>) -> Self {
        ServerEvent::Connected {
            connection_id: connection_id.into(),
            version: version.into(),
        }
    }
}
