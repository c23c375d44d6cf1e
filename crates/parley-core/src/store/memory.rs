//! In-memory stores.
//!
//! Used by tests and by `store.url = "memory"` deployments. Nothing
//! survives a restart.

use super::{
    now_millis, ConversationLog, Identity, IdentityStore, Message, NewMessage, StoreError,
};
use crate::connection::ConnectionId;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::RwLock;

/// Identity records in a concurrent map.
#[derive(Debug, Default)]
pub struct MemoryIdentityStore {
    identities: DashMap<String, Identity>,
}

impl MemoryIdentityStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.identities.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }
}

#[async_trait]
impl IdentityStore for MemoryIdentityStore {
    async fn find(&self, username: &str) -> Result<Option<Identity>, StoreError> {
        Ok(self.identities.get(username).map(|e| e.value().clone()))
    }

    async fn create(
        &self,
        username: &str,
        credential_hash: &str,
    ) -> Result<Identity, StoreError> {
        match self.identities.entry(username.to_string()) {
            Entry::Occupied(_) => Err(StoreError::Conflict(username.to_string())),
            Entry::Vacant(slot) => {
                let identity = Identity::new(username, Some(credential_hash.to_string()));
                slot.insert(identity.clone());
                Ok(identity)
            }
        }
    }

    async fn set_credential_if_absent(
        &self,
        username: &str,
        credential_hash: &str,
    ) -> Result<bool, StoreError> {
        match self.identities.get_mut(username) {
            Some(mut identity) if identity.credential_hash.is_none() => {
                identity.credential_hash = Some(credential_hash.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_online(&self, username: &str, handle: &ConnectionId) -> Result<(), StoreError> {
        let mut entry = self
            .identities
            .entry(username.to_string())
            .or_insert_with(|| Identity::new(username, None));
        entry.is_online = true;
        entry.transport_handle_id = Some(handle.clone());
        Ok(())
    }

    async fn mark_offline(
        &self,
        username: &str,
        handle: &ConnectionId,
    ) -> Result<bool, StoreError> {
        match self.identities.get_mut(username) {
            Some(mut identity) if identity.transport_handle_id.as_ref() == Some(handle) => {
                identity.is_online = false;
                identity.transport_handle_id = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[derive(Debug, Default)]
struct LogInner {
    messages: Vec<Message>,
    next_id: u64,
}

/// Append-only message log held in a vector.
#[derive(Debug, Default)]
pub struct MemoryConversationLog {
    inner: RwLock<LogInner>,
}

impl MemoryConversationLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of stored messages.
    pub async fn len(&self) -> usize {
        self.inner.read().await.messages.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.messages.is_empty()
    }
}

#[async_trait]
impl ConversationLog for MemoryConversationLog {
    async fn append(&self, message: NewMessage) -> Result<Message, StoreError> {
        let mut inner = self.inner.write().await;

        // Timestamps never go backwards even if the wall clock does.
        let last = inner.messages.last().map_or(0, |m| m.timestamp);
        inner.next_id += 1;

        let stored = Message {
            id: inner.next_id,
            from: message.from,
            to: message.to,
            message: message.message,
            timestamp: now_millis().max(last),
        };
        inner.messages.push(stored.clone());
        Ok(stored)
    }

    async fn history(&self, user1: &str, user2: &str) -> Result<Vec<Message>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .messages
            .iter()
            .filter(|m| {
                (m.from == user1 && m.to == user2) || (m.from == user2 && m.to == user1)
            })
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_message(from: &str, to: &str, body: &str) -> NewMessage {
        NewMessage {
            from: from.to_string(),
            to: to.to_string(),
            message: body.to_string(),
        }
    }

    #[tokio::test]
    async fn test_create_conflict() {
        let store = MemoryIdentityStore::new();
        store.create("alice", "hash").await.unwrap();

        assert!(matches!(
            store.create("alice", "other").await,
            Err(StoreError::Conflict(name)) if name == "alice"
        ));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_mark_online_upserts() {
        let store = MemoryIdentityStore::new();
        let handle = ConnectionId::new("conn-1");

        store.mark_online("ghost", &handle).await.unwrap();

        let identity = store.find("ghost").await.unwrap().unwrap();
        assert!(identity.is_online);
        assert!(identity.credential_hash.is_none());
        assert_eq!(identity.reachable_handle(), Some(&handle));
    }

    #[tokio::test]
    async fn test_credential_only_set_once() {
        let store = MemoryIdentityStore::new();
        assert!(!store.set_credential_if_absent("ghost", "h").await.unwrap());

        store.mark_online("ghost", &ConnectionId::new("conn-1")).await.unwrap();
        assert!(store.set_credential_if_absent("ghost", "h1").await.unwrap());
        assert!(!store.set_credential_if_absent("ghost", "h2").await.unwrap());
        assert_eq!(
            store.find("ghost").await.unwrap().unwrap().credential_hash.as_deref(),
            Some("h1")
        );

        store.create("alice", "hash").await.unwrap();
        assert!(!store.set_credential_if_absent("alice", "other").await.unwrap());
    }

    #[tokio::test]
    async fn test_mark_offline_compares_handle() {
        let store = MemoryIdentityStore::new();
        let old = ConnectionId::new("conn-1");
        let new = ConnectionId::new("conn-2");

        store.mark_online("alice", &old).await.unwrap();
        store.mark_online("alice", &new).await.unwrap();

        assert!(!store.mark_offline("alice", &old).await.unwrap());
        assert!(store.find("alice").await.unwrap().unwrap().is_online);

        assert!(store.mark_offline("alice", &new).await.unwrap());
        let identity = store.find("alice").await.unwrap().unwrap();
        assert!(!identity.is_online);
        assert!(identity.transport_handle_id.is_none());

        assert!(!store.mark_offline("nobody", &new).await.unwrap());
    }

    #[tokio::test]
    async fn test_history_is_symmetric_and_ordered() {
        let log = MemoryConversationLog::new();
        log.append(new_message("alice", "bob", "one")).await.unwrap();
        log.append(new_message("carol", "bob", "noise")).await.unwrap();
        log.append(new_message("bob", "alice", "two")).await.unwrap();
        log.append(new_message("alice", "bob", "three")).await.unwrap();

        let forward = log.history("alice", "bob").await.unwrap();
        let backward = log.history("bob", "alice").await.unwrap();

        assert_eq!(forward, backward);
        let bodies: Vec<_> = forward.iter().map(|m| m.message.as_str()).collect();
        assert_eq!(bodies, ["one", "two", "three"]);
        assert!(forward.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        assert_eq!(log.len().await, 4);
    }
}
