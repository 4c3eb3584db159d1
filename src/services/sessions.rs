use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;

use crate::db::{self, queries, Db};
use crate::models::ConversationState;
use crate::services::slots::SlotStore;

/// Conversation state keyed by recipient address.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, address: &str) -> anyhow::Result<Option<ConversationState>>;

    async fn set(&self, state: &ConversationState) -> anyhow::Result<()>;

    async fn delete(&self, address: &str) -> anyhow::Result<()>;

    /// Remove and return every session idle since before `cutoff`.
    async fn take_expired(&self, cutoff: DateTime<Utc>) -> anyhow::Result<Vec<ConversationState>>;

    /// Conversations currently in progress.
    async fn count(&self) -> anyhow::Result<usize>;
}

#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<String, ConversationState>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(&self, address: &str) -> anyhow::Result<Option<ConversationState>> {
        Ok(self.sessions.read().await.get(address).cloned())
    }

    async fn set(&self, state: &ConversationState) -> anyhow::Result<()> {
        self.sessions
            .write()
            .await
            .insert(state.address.clone(), state.clone());
        Ok(())
    }

    async fn delete(&self, address: &str) -> anyhow::Result<()> {
        self.sessions.write().await.remove(address);
        Ok(())
    }

    async fn take_expired(&self, cutoff: DateTime<Utc>) -> anyhow::Result<Vec<ConversationState>> {
        let mut sessions = self.sessions.write().await;
        let expired: Vec<String> = sessions
            .values()
            .filter(|s| s.last_updated < cutoff)
            .map(|s| s.address.clone())
            .collect();
        Ok(expired
            .iter()
            .filter_map(|address| sessions.remove(address))
            .collect())
    }

    async fn count(&self) -> anyhow::Result<usize> {
        Ok(self.sessions.read().await.len())
    }
}

pub struct SqliteSessionStore {
    db: Db,
}

impl SqliteSessionStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn get(&self, address: &str) -> anyhow::Result<Option<ConversationState>> {
        let conn = db::lock(&self.db)?;
        queries::get_conversation(&conn, address)
    }

    async fn set(&self, state: &ConversationState) -> anyhow::Result<()> {
        let conn = db::lock(&self.db)?;
        queries::save_conversation(&conn, state)
    }

    async fn delete(&self, address: &str) -> anyhow::Result<()> {
        let conn = db::lock(&self.db)?;
        queries::delete_conversation(&conn, address)?;
        Ok(())
    }

    async fn take_expired(&self, cutoff: DateTime<Utc>) -> anyhow::Result<Vec<ConversationState>> {
        let conn = db::lock(&self.db)?;
        let expired = queries::expired_conversations(&conn, cutoff)?;
        for state in &expired {
            queries::delete_conversation(&conn, &state.address)?;
        }
        Ok(expired)
    }

    async fn count(&self) -> anyhow::Result<usize> {
        let conn = db::lock(&self.db)?;
        queries::count_conversations(&conn)
    }
}

/// Drop idle sessions and hand back any slot they were still holding.
/// Returns how many sessions were removed.
pub async fn sweep_expired(
    sessions: &dyn SessionStore,
    slots: &dyn SlotStore,
    ttl: Duration,
) -> anyhow::Result<usize> {
    let expired = sessions.take_expired(Utc::now() - ttl).await?;

    for state in &expired {
        if let Some(slot_id) = state.stage.held_claim() {
            if let Err(e) = slots.release_slot(slot_id, &state.address).await {
                tracing::error!(error = %e, slot_id, address = %state.address, "failed to release expired claim");
            }
        }
        tracing::debug!(address = %state.address, stage = state.stage.name(), "session expired");
    }

    Ok(expired.len())
}

pub fn spawn_sweeper(
    sessions: Arc<dyn SessionStore>,
    slots: Arc<dyn SlotStore>,
    ttl: Duration,
    every: std::time::Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            match sweep_expired(sessions.as_ref(), slots.as_ref(), ttl).await {
                Ok(0) => {}
                Ok(count) => tracing::info!(count, "expired idle sessions"),
                Err(e) => tracing::error!(error = %e, "session sweep failed"),
            }
        }
    })
}
