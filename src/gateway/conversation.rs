//! Conversation records and the registry that owns them.
//!
//! Each live conversation sits behind its own `tokio::sync::Mutex`, so events for one
//! conversation are processed strictly one at a time while different conversations
//! proceed in parallel. The map lock is only held long enough to look up or swap an
//! entry, never across a backend call.

use crate::connectors::{Connector, SessionContext};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConversationState {
    Active,
    Ended,
}

pub struct Conversation {
    pub conversation_id: String,
    pub agent_id: String,
    pub customer_org_id: String,
    pub state: ConversationState,
    pub welcome_sent: bool,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    last_activity: Instant,
    pub streams: HashSet<Uuid>,
    pub consecutive_failures: u32,
    pub connector: Arc<dyn Connector>,
}

impl Conversation {
    pub fn new(
        conversation_id: String,
        agent_id: String,
        customer_org_id: String,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let now = Utc::now();
        Self {
            conversation_id,
            agent_id,
            customer_org_id,
            state: ConversationState::Active,
            welcome_sent: false,
            created_at: now,
            last_activity_at: now,
            last_activity: Instant::now(),
            streams: HashSet::new(),
            consecutive_failures: 0,
            connector,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == ConversationState::Active
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
        self.last_activity_at = Utc::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    pub fn session_context(&self) -> SessionContext {
        SessionContext {
            conversation_id: self.conversation_id.clone(),
            agent_id: self.agent_id.clone(),
            customer_org_id: self.customer_org_id.clone(),
        }
    }

    pub fn summary(&self) -> ConversationSummary {
        ConversationSummary {
            conversation_id: self.conversation_id.clone(),
            agent_id: self.agent_id.clone(),
            customer_org_id: self.customer_org_id.clone(),
            connector: self.connector.name().to_string(),
            state: self.state,
            welcome_sent: self.welcome_sent,
            created_at: self.created_at,
            last_activity_at: self.last_activity_at,
            attached_streams: self.streams.len(),
            consecutive_failures: self.consecutive_failures,
        }
    }
}

/// Read-only view of a conversation for monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationSummary {
    pub conversation_id: String,
    pub agent_id: String,
    pub customer_org_id: String,
    pub connector: String,
    pub state: ConversationState,
    pub welcome_sent: bool,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub attached_streams: usize,
    pub consecutive_failures: u32,
}

pub type ConversationHandle = Arc<Mutex<Conversation>>;

/// Outcome of [`ConversationRegistry::get_or_insert`].
pub enum Slot {
    /// An entry already existed for the id
    Existing(ConversationHandle),
    /// A new entry was inserted; the guard is held so nobody can use it before it is started
    Created(ConversationHandle, tokio::sync::OwnedMutexGuard<Conversation>),
}

#[derive(Default)]
pub struct ConversationRegistry {
    entries: RwLock<HashMap<String, ConversationHandle>>,
}

impl ConversationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, conversation_id: &str) -> Option<ConversationHandle> {
        self.entries.read().await.get(conversation_id).cloned()
    }

    /// Return the live entry for `conversation_id`, or insert the one built by `create`.
    ///
    /// The new entry is locked before it becomes visible in the map.
    pub async fn get_or_insert<F>(&self, conversation_id: &str, create: F) -> Slot
    where
        F: FnOnce() -> Conversation,
    {
        let mut entries = self.entries.write().await;
        if let Some(existing) = entries.get(conversation_id) {
            return Slot::Existing(existing.clone());
        }
        let handle: ConversationHandle = Arc::new(Mutex::new(create()));
        let guard = handle.clone().lock_owned().await;
        entries.insert(conversation_id.to_string(), handle.clone());
        Slot::Created(handle, guard)
    }

    /// Remove `conversation_id` only if it still maps to `handle`.
    pub async fn remove(&self, conversation_id: &str, handle: &ConversationHandle) -> bool {
        let mut entries = self.entries.write().await;
        match entries.get(conversation_id) {
            Some(current) if Arc::ptr_eq(current, handle) => {
                entries.remove(conversation_id);
                true
            }
            _ => false,
        }
    }

    /// Snapshot of every handle, so callers can lock entries without holding the map.
    pub async fn handles(&self) -> Vec<ConversationHandle> {
        self.entries.read().await.values().cloned().collect()
    }

    /// Like [`handles`](Self::handles), paired with each conversation id.
    pub async fn entries(&self) -> Vec<(String, ConversationHandle)> {
        self.entries
            .read()
            .await
            .iter()
            .map(|(id, handle)| (id.clone(), handle.clone()))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::tests::StaticConnector;

    fn conversation(id: &str) -> Conversation {
        Conversation::new(
            id.to_string(),
            "BotA".to_string(),
            "org-1".to_string(),
            StaticConnector::new("static", &[("BotA", true)]),
        )
    }

    #[tokio::test]
    async fn test_second_insert_sees_existing_entry() {
        let registry = ConversationRegistry::new();
        let created = match registry.get_or_insert("call-1", || conversation("call-1")).await {
            Slot::Created(handle, _guard) => handle,
            Slot::Existing(_) => panic!("expected a new entry"),
        };
        match registry.get_or_insert("call-1", || conversation("call-1")).await {
            Slot::Existing(handle) => assert!(Arc::ptr_eq(&handle, &created)),
            Slot::Created(..) => panic!("entry was created twice"),
        }
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_remove_ignores_replaced_entry() {
        let registry = ConversationRegistry::new();
        let stale: ConversationHandle = Arc::new(Mutex::new(conversation("call-1")));
        registry.get_or_insert("call-1", || conversation("call-1")).await;
        assert!(!registry.remove("call-1", &stale).await);
        assert!(registry.get("call-1").await.is_some());

        let current = registry.get("call-1").await.unwrap();
        assert!(registry.remove("call-1", &current).await);
        assert!(registry.get("call-1").await.is_none());
    }

    #[test]
    fn test_summary_reflects_state() {
        let mut conversation = conversation("call-1");
        conversation.streams.insert(Uuid::new_v4());
        conversation.welcome_sent = true;
        let summary = conversation.summary();
        assert_eq!(summary.attached_streams, 1);
        assert!(summary.welcome_sent);
        assert_eq!(summary.state, ConversationState::Active);
        assert_eq!(summary.connector, "static");
    }
}
