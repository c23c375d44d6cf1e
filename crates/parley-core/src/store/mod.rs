//! Durable collaborators of the relay: the identity store and the
//! conversation log.
//!
//! Both are traits so the relay can run against SQLite in production and
//! against the in-memory implementations in [`memory`] in tests.

pub mod memory;

use crate::connection::ConnectionId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The username already has an identity.
    #[error("Username already taken: {0}")]
    Conflict(String),

    /// The backing store failed or is unreachable.
    #[error("Store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Wrap any backend failure.
    pub fn backend(err: impl std::fmt::Display) -> Self {
        StoreError::Backend(err.to_string())
    }
}

/// Durable account record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub username: String,
    /// bcrypt hash; `None` for identities created by a bare registration.
    pub credential_hash: Option<String>,
    pub is_online: bool,
    pub transport_handle_id: Option<ConnectionId>,
}

impl Identity {
    /// An offline identity with the given credential.
    #[must_use]
    pub fn new(username: impl Into<String>, credential_hash: Option<String>) -> Self {
        Self {
            username: username.into(),
            credential_hash,
            is_online: false,
            transport_handle_id: None,
        }
    }

    /// The handle id to deliver to, if the identity is online.
    #[must_use]
    pub fn reachable_handle(&self) -> Option<&ConnectionId> {
        if self.is_online {
            self.transport_handle_id.as_ref()
        } else {
            None
        }
    }
}

/// A message to append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub from: String,
    pub to: String,
    pub message: String,
}

/// A stored message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Store-assigned id; breaks timestamp ties.
    pub id: u64,
    pub from: String,
    pub to: String,
    pub message: String,
    /// Creation time in unix milliseconds.
    pub timestamp: u64,
}

/// Current unix time in milliseconds.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Durable identity records keyed by username.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Look up an identity.
    async fn find(&self, username: &str) -> Result<Option<Identity>, StoreError>;

    /// Create an offline identity with a credential.
    ///
    /// Fails with [`StoreError::Conflict`] if the username exists.
    async fn create(&self, username: &str, credential_hash: &str)
        -> Result<Identity, StoreError>;

    /// Attach a credential to an identity that has none, as left behind by a
    /// `register` before signup.
    ///
    /// Returns `false` if the username is unknown or already has a credential.
    async fn set_credential_if_absent(
        &self,
        username: &str,
        credential_hash: &str,
    ) -> Result<bool, StoreError>;

    /// Mark online with the given handle, creating a credential-less
    /// identity if the username is unknown.
    async fn mark_online(&self, username: &str, handle: &ConnectionId) -> Result<(), StoreError>;

    /// Mark offline and clear the handle, but only if the stored handle is
    /// still `handle`.
    ///
    /// Returns `true` if the identity was updated.
    async fn mark_offline(&self, username: &str, handle: &ConnectionId)
        -> Result<bool, StoreError>;
}

/// Append-only message log.
#[async_trait]
pub trait ConversationLog: Send + Sync {
    /// Append a message, assigning its id and timestamp.
    async fn append(&self, message: NewMessage) -> Result<Message, StoreError>;

    /// All messages between two users in either direction, oldest first.
    async fn history(&self, user1: &str, user2: &str) -> Result<Vec<Message>, StoreError>;
}
