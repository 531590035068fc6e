//! In-memory connection store.

use super::{Connection, ConnectionStore, ConnectionUpdate};
use crate::provider::Provider;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Connection store kept in a `HashMap`. Contents are lost on drop.
#[derive(Default)]
pub struct MemoryConnectionStore {
    connections: RwLock<HashMap<(String, Provider), Connection>>,
}

impl MemoryConnectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a full connection record, replacing any existing one.
    pub async fn insert(&self, connection: Connection) {
        let key = (connection.user_id.clone(), connection.provider);
        self.connections.write().await.insert(key, connection);
    }
}

#[async_trait]
impl ConnectionStore for MemoryConnectionStore {
    async fn find(&self, user_id: &str, provider: Provider) -> Result<Option<Connection>> {
        let key = (user_id.to_string(), provider);
        Ok(self.connections.read().await.get(&key).cloned())
    }

    async fn upsert(&self, user_id: &str, provider: Provider, update: ConnectionUpdate) -> Result<()> {
        let key = (user_id.to_string(), provider);
        let mut connections = self.connections.write().await;
        match connections.get_mut(&key) {
            Some(existing) => update.apply_to(existing),
            None => {
                let created = update.into_connection(user_id, provider)?;
                connections.insert(key, created);
            }
        }
        Ok(())
    }

    async fn delete(&self, user_id: &str, provider: Provider) -> Result<bool> {
        let key = (user_id.to_string(), provider);
        Ok(self.connections.write().await.remove(&key).is_some())
    }

    async fn list_by_user(&self, user_id: &str) -> Result<Vec<Provider>> {
        let mut providers: Vec<Provider> = self
            .connections
            .read()
            .await
            .keys()
            .filter(|(uid, _)| uid == user_id)
            .map(|(_, provider)| *provider)
            .collect();
        providers.sort();
        Ok(providers)
    }
}
