//! Presence registry.
//!
//! The registry answers "which live connection, if any, represents this
//! username right now" for the current process. A username maps to at most
//! one handle; the most recent registration wins.

use crate::connection::{ConnectionHandle, ConnectionId};
use dashmap::DashMap;
use tracing::debug;

/// Maximum username length in bytes.
pub const MAX_USERNAME_LENGTH: usize = 64;

/// Validate a username.
///
/// # Errors
///
/// Returns an error message if the username is invalid.
pub fn validate_username(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Username cannot be empty");
    }
    if name.len() > MAX_USERNAME_LENGTH {
        return Err("Username too long");
    }
    if name.starts_with('$') {
        return Err("Usernames starting with '$' are reserved");
    }
    if !name.chars().all(|c| c.is_ascii_graphic()) {
        return Err("Username contains invalid characters");
    }
    Ok(())
}

/// Process-local map from username to live connection.
#[derive(Debug, Default)]
pub struct PresenceRegistry {
    entries: DashMap<String, ConnectionHandle>,
}

impl PresenceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a username to a handle, replacing any previous binding.
    ///
    /// Returns the superseded handle. It is not notified.
    pub fn register(
        &self,
        username: impl Into<String>,
        handle: ConnectionHandle,
    ) -> Option<ConnectionHandle> {
        let username = username.into();
        let connection = handle.id().clone();
        let previous = self.entries.insert(username.clone(), handle);

        match &previous {
            Some(old) if old.id() != &connection => {
                debug!(
                    username = %username,
                    connection = %connection,
                    superseded = %old.id(),
                    "Presence: handle replaced"
                );
            }
            Some(_) => {}
            None => debug!(username = %username, connection = %connection, "Presence: registered"),
        }

        previous
    }

    /// Live handle for a username, if any.
    #[must_use]
    pub fn lookup(&self, username: &str) -> Option<ConnectionHandle> {
        self.entries.get(username).map(|entry| entry.value().clone())
    }

    /// Remove a username unconditionally. No-op if absent.
    pub fn remove(&self, username: &str) -> Option<ConnectionHandle> {
        let removed = self.entries.remove(username).map(|(_, handle)| handle);
        if removed.is_some() {
            debug!(username = %username, "Presence: removed");
        }
        removed
    }

    /// Remove a username only if it is still bound to `connection`.
    ///
    /// Returns `true` if the entry was removed.
    pub fn remove_if_current(&self, username: &str, connection: &ConnectionId) -> bool {
        let removed = self
            .entries
            .remove_if(username, |_, handle| handle.id() == connection)
            .is_some();

        if removed {
            debug!(username = %username, connection = %connection, "Presence: removed");
        } else {
            debug!(
                username = %username,
                connection = %connection,
                "Presence: entry not owned by connection, kept"
            );
        }
        removed
    }

    #[must_use]
    pub fn contains(&self, username: &str) -> bool {
        self.entries.contains_key(username)
    }

    /// Number of registered usernames.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
