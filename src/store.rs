//! External collaborator seams
//!
//! The hub core never talks to a database directly. Message persistence
//! and channel membership checks go through these traits; the HTTP/REST
//! side of the application supplies the real implementations. The
//! in-memory store here backs the standalone binary and the tests.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::hub::{ChannelId, UserId};

/// A persisted chat message, safe to broadcast as a canonical record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub channel_id: ChannelId,
    pub author_id: UserId,
    pub content: String,
    pub edited: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_username: Option<String>,
}

/// Verifies a user belongs to a channel before the hub will subscribe them.
///
/// Called concurrently from many inbound pumps. A returned error is
/// treated as a denial: logged, reported to the requesting connection
/// only, never retried.
#[async_trait]
pub trait MembershipChecker: Send + Sync {
    async fn is_member(&self, user_id: UserId, channel_id: ChannelId) -> anyhow::Result<bool>;
}

/// Persists an incoming chat message and returns the saved record.
///
/// The implementation must assign a durable id and timestamps so the
/// result can be fanned out as-is.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn save_message(
        &self,
        channel_id: ChannelId,
        author_id: UserId,
        content: &str,
    ) -> anyhow::Result<ChatMessage>;
}

/// In-memory store implementing both collaborator seams.
///
/// Single-process only, no persistence across restarts. In open mode
/// every user is a member of every channel, which is what the standalone
/// binary wants; tests use closed mode with explicit member sets.
pub struct MemoryStore {
    members: RwLock<HashMap<ChannelId, HashSet<UserId>>>,
    messages: RwLock<Vec<ChatMessage>>,
    open_membership: bool,
}

impl MemoryStore {
    /// Open-membership store: any user may subscribe to any channel.
    pub fn new() -> Self {
        Self {
            members: RwLock::new(HashMap::new()),
            messages: RwLock::new(Vec::new()),
            open_membership: true,
        }
    }

    /// Closed-membership store: only users added via [`add_member`]
    /// pass the membership check.
    ///
    /// [`add_member`]: MemoryStore::add_member
    pub fn closed() -> Self {
        Self {
            members: RwLock::new(HashMap::new()),
            messages: RwLock::new(Vec::new()),
            open_membership: false,
        }
    }

    pub fn add_member(&self, channel_id: ChannelId, user_id: UserId) {
        self.members
            .write()
            .entry(channel_id)
            .or_default()
            .insert(user_id);
    }

    /// Number of messages saved so far.
    pub fn message_count(&self) -> usize {
        self.messages.read().len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MembershipChecker for MemoryStore {
    async fn is_member(&self, user_id: UserId, channel_id: ChannelId) -> anyhow::Result<bool> {
        if self.open_membership {
            return Ok(true);
        }
        Ok(self
            .members
            .read()
            .get(&channel_id)
            .is_some_and(|members| members.contains(&user_id)))
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn save_message(
        &self,
        channel_id: ChannelId,
        author_id: UserId,
        content: &str,
    ) -> anyhow::Result<ChatMessage> {
        let now = Utc::now();
        let message = ChatMessage {
            id: Uuid::new_v4(),
            channel_id,
            author_id,
            content: content.to_string(),
            edited: false,
            created_at: now,
            updated_at: now,
            author_username: None,
        };
        self.messages.write().push(message.clone());
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_membership_allows_everyone() {
        let store = MemoryStore::new();
        let allowed = store
            .is_member(Uuid::new_v4(), Uuid::new_v4())
            .await
            .unwrap();
        assert!(allowed);
    }

    #[tokio::test]
    async fn test_closed_membership_requires_explicit_member() {
        let store = MemoryStore::closed();
        let user = Uuid::new_v4();
        let channel = Uuid::new_v4();

        assert!(!store.is_member(user, channel).await.unwrap());

        store.add_member(channel, user);
        assert!(store.is_member(user, channel).await.unwrap());
        assert!(!store.is_member(Uuid::new_v4(), channel).await.unwrap());
    }

    #[tokio::test]
    async fn test_save_message_assigns_identity() {
        let store = MemoryStore::new();
        let channel = Uuid::new_v4();
        let author = Uuid::new_v4();

        let saved = store.save_message(channel, author, "hi").await.unwrap();
        assert_eq!(saved.channel_id, channel);
        assert_eq!(saved.author_id, author);
        assert_eq!(saved.content, "hi");
        assert!(!saved.edited);
        assert_eq!(store.message_count(), 1);

        let again = store.save_message(channel, author, "hi").await.unwrap();
        assert_ne!(saved.id, again.id);
    }
}
